use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::helpers::traits::bytes::{parse_content_length, SplitBytes};

/// Requests larger than this are cut off; the remainder is never read.
const MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;

#[async_trait]
pub trait StreamHttp {
    /// Reads one request: the header block plus as much body as
    /// `Content-Length` announces. An empty read is a malformed request.
    async fn read_request_bytes(&mut self, config: &ServerConfig) -> ServerResult<Vec<u8>>;
}

#[async_trait]
impl<R> StreamHttp for R
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_request_bytes(&mut self, config: &ServerConfig) -> ServerResult<Vec<u8>> {
        let mut bytes: Vec<u8> = vec![];
        let mut buf = vec![0; config.read_buffer_size.max(1)];
        let read_timeout = Duration::from_millis(config.read_timeout_miliseconds);

        let mut content_length = None;
        let mut header_end = None;
        loop {
            let n = match tokio::time::timeout(read_timeout, self.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    debug!(read = bytes.len(), "read timed out, using what arrived");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
            trace!(chunk = n, total = bytes.len(), "read chunk");

            if header_end.is_none() {
                header_end = bytes.find_header_end();
                if let Some(end) = header_end {
                    content_length = parse_content_length(&bytes[..end]);
                }
            }
            match (header_end, content_length) {
                (Some(end), Some(length)) if bytes.len() >= end.saturating_add(length) => break,
                (Some(_), None) => break,
                _ => {}
            }
            if bytes.len() >= MAX_REQUEST_SIZE {
                debug!(limit = MAX_REQUEST_SIZE, "request size limit reached");
                break;
            }
        }

        if bytes.is_empty() {
            return Err(ServerError::MalformedRequest("no data"));
        }
        Ok(bytes)
    }
}
