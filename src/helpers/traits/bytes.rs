pub const HEADER_END: &[u8] = b"\r\n\r\n";

pub trait SplitBytes {
    fn split_header_body(&self) -> (&[u8], &[u8]);
    fn find_header_end(&self) -> Option<usize>;
}

impl SplitBytes for [u8] {
    /// Splits at the first blank line. Without one the whole input is header.
    fn split_header_body(&self) -> (&[u8], &[u8]) {
        match find_subslice(self, HEADER_END) {
            Some(pos) => (&self[..pos], &self[pos + HEADER_END.len()..]),
            None => (self, &self[self.len()..]),
        }
    }

    /// Offset just past the blank line terminating the header block.
    fn find_header_end(&self) -> Option<usize> {
        find_subslice(self, HEADER_END).map(|pos| pos + HEADER_END.len())
    }
}

pub fn find_subslice(data: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || data.len() < needle.len() {
        return None;
    }
    data.windows(needle.len()).position(|window| window == needle)
}

pub fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let headers_str = String::from_utf8_lossy(headers);
    headers_str
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| {
            line.split(':')
                .nth(1)
                .and_then(|len| len.trim().parse().ok())
        })
}
