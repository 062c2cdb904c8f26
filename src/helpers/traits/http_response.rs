use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ServerResult;
use crate::helpers::traits::file_cache::{LoadedFile, MappedFile};

pub const SERVER_NAME: &str = concat!("ServHTTP/", env!("CARGO_PKG_VERSION"));

/// Headers the writer always computes itself.
const MANAGED_HEADERS: [&str; 3] = ["content-length", "connection", "keep-alive"];

/// Response payload. File contents are shared with the cache or mapped,
/// never copied before they reach the socket.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Vec<u8>),
    Shared(Arc<Vec<u8>>),
    Mapped(Arc<MappedFile>),
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Bytes(bytes) => bytes.as_slice(),
            Body::Shared(bytes) => bytes.as_slice(),
            Body::Mapped(file) => file.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Bytes(Vec::new())
    }
}

impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Body {}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Bytes(text.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Bytes(text.into_bytes())
    }
}

impl From<LoadedFile> for Body {
    fn from(file: LoadedFile) -> Self {
        match file {
            LoadedFile::Cached(bytes) => Body::Shared(bytes),
            LoadedFile::Mapped(file) => Body::Mapped(Arc::new(file)),
            LoadedFile::Empty => Body::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    /// Replaces `"<code> <reason>"` in the status line when a script sets
    /// its own `Status` header.
    pub status_text: Option<String>,
    /// Ordered and allowed to repeat, e.g. several `Set-Cookie` lines.
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            status_text: None,
            headers: Vec::new(),
            body: Body::default(),
        }
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
            .header("Content-Type", "text/html")
            .body("<h1>Bad Request</h1>")
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_headers<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn status_line(&self) -> String {
        match &self.status_text {
            Some(text) => format!("HTTP/1.0 {}\r\n", text),
            None => format!(
                "HTTP/1.0 {} {}\r\n",
                self.status.as_str(),
                self.status.canonical_reason().unwrap_or("Unknown")
            ),
        }
    }

    /// Status line and header block, blank line included. `Server` and
    /// `Date` are added when missing; `Content-Length` and
    /// `Connection: close` always reflect what is sent.
    pub fn head(&self) -> String {
        let mut head = self.status_line();

        for (key, value) in self.headers.iter() {
            if MANAGED_HEADERS
                .iter()
                .any(|managed| key.eq_ignore_ascii_case(managed))
            {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", key, value));
        }
        if self.get_header("server").is_none() {
            head.push_str(&format!("Server: {}\r\n", SERVER_NAME));
        }
        if self.get_header("date").is_none() {
            head.push_str(&format!(
                "Date: {}\r\n",
                Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
            ));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str("Connection: close\r\n\r\n");
        head
    }

    pub fn to_http(&self) -> Vec<u8> {
        let mut bytes = self.head().into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}

#[async_trait]
pub trait ResponseUtil {
    async fn respond(&mut self, response: &Response) -> ServerResult<()>;
}

#[async_trait]
impl<W> ResponseUtil for W
where
    W: AsyncWrite + Unpin + Send,
{
    async fn respond(&mut self, response: &Response) -> ServerResult<()> {
        self.write_all(response.head().as_bytes()).await?;
        self.write_all(response.body.as_bytes()).await?;
        self.flush().await?;
        Ok(())
    }
}
