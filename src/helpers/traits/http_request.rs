use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use http::{Method, Version};
use percent_encoding::percent_decode_str;

use crate::error::{ServerError, ServerResult};
use crate::helpers::traits::bytes::SplitBytes;

/// Header block with unique keys kept in first-seen order.
///
/// Keys compare ASCII case-insensitively; a repeated key overwrites the value
/// in place instead of appending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut list = HeaderList::new();
        for (k, v) in iter {
            list.insert(k, v);
        }
        list
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub request_line: String,
    pub method: Method,
    pub uri: String,
    pub path: String,
    pub query: String,
    pub version: Version,
    pub headers: HeaderList,
    pub body: Vec<u8>,
    pub client_addr: SocketAddr,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Body of a POST request, or `None` when there is nothing but whitespace
    /// after the header block.
    pub fn post_body(&self) -> Option<String> {
        if self.method != Method::POST {
            return None;
        }
        let body = String::from_utf8_lossy(&self.body);
        let body = body.trim();
        match body.is_empty() {
            true => None,
            false => Some(body.to_owned()),
        }
    }
}

/// Parses the bytes of one request read from `client_addr`.
pub fn parse_request(bytes: &[u8], client_addr: SocketAddr) -> ServerResult<Request> {
    if bytes.is_empty() {
        return Err(ServerError::MalformedRequest("empty request"));
    }

    let (header, body) = bytes.split_header_body();
    let header = String::from_utf8_lossy(header);
    let mut lines = header.split("\r\n");

    let request_line = lines.next().unwrap_or_default().trim().to_owned();
    let mut tokens = request_line.split_whitespace();
    let method = tokens
        .next()
        .ok_or(ServerError::MalformedRequest("missing method"))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ServerError::MalformedRequest("invalid method"))?;
    let uri = tokens
        .next()
        .ok_or(ServerError::MalformedRequest("missing request target"))?
        .to_owned();
    let version = match tokens.next() {
        Some("HTTP/0.9") => Version::HTTP_09,
        Some("HTTP/1.1") => Version::HTTP_11,
        _ => Version::HTTP_10,
    };

    let headers = header_lines(lines).collect::<HeaderList>();

    let (path, query) = split_query(&uri);
    let path = percent_decode_str(path).decode_utf8_lossy().into_owned();
    let query = query.to_owned();

    Ok(Request {
        request_line,
        method,
        uri,
        path,
        query,
        version,
        headers,
        body: body.to_vec(),
        client_addr,
        received_at: Utc::now(),
    })
}

/// Splits each line on its first colon. A line without a colon becomes a key
/// with an empty value; blank keys are dropped.
pub fn header_lines<'a, I>(lines: I) -> impl Iterator<Item = (&'a str, &'a str)>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .map(|line| match line.split_once(':') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line.trim(), ""),
        })
        .filter(|(key, _)| !key.is_empty())
}

/// Path and query string, separated on the first `?`.
pub fn split_query(uri: &str) -> (&str, &str) {
    uri.split_once('?').unwrap_or((uri, ""))
}

/// Decodes `k=v` pairs separated by `separator`, keeping their order.
pub fn decode_pairs(input: &str, separator: char) -> Vec<(String, String)> {
    input
        .split(separator)
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    percent_decode_str(&raw).decode_utf8_lossy().into_owned()
}
