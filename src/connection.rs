//! Per-connection request handling.
//!
//! A connection moves through `ReceiveHeader -> {BadRequest, Route}` and
//! `Route -> {StaticServe, ScriptServe, NotFound}`, then closes. Nothing is
//! revisited and only one response is written.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::helpers::traits::file_cache::FileCache;
use crate::helpers::traits::http_request::parse_request;
use crate::helpers::traits::http_response::{Response, ResponseUtil};
use crate::helpers::traits::http_stream::StreamHttp;
use crate::resolver::{resolve, Mode, Resolution, ResolvedTarget};
use crate::script::{execute, InterpreterRunner, ScriptEnvironment, ScriptRunner};
use crate::static_files::{not_found_page, serve_file};

/// Sent to the configured observer once a request resolved to a file.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub connection_id: Uuid,
    pub client_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub path: PathBuf,
    pub mode: Mode,
    pub at: DateTime<Utc>,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    BadRequest,
    Static,
    Script,
    NotFound,
}

/// Shared, read-only state every connection task works from.
pub struct ConnectionHandler {
    config: Arc<ServerConfig>,
    cache: Option<Arc<FileCache>>,
    runner: Option<Arc<dyn ScriptRunner>>,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("runner", &self.runner.is_some())
            .finish()
    }
}

impl ConnectionHandler {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let cache = config
            .enable_file_cache
            .then(|| Arc::new(FileCache::new(config.file_cache_threshold, 256)));
        let runner = config.script.clone().map(|script| {
            Arc::new(InterpreterRunner::new(script, config.work_dir.clone()))
                as Arc<dyn ScriptRunner>
        });
        Self {
            config,
            cache,
            runner,
        }
    }

    /// Replaces the interpreter, e.g. with an in-process runner.
    pub fn with_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves exactly one request on `stream`.
    ///
    /// Only malformed input is answered with an error response; failures
    /// while reading files or running processes are returned to the caller
    /// and the connection is dropped without a reply.
    pub async fn handle<S>(
        &self,
        stream: &mut S,
        client_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> ServerResult<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = match stream.read_request_bytes(&self.config).await {
            Ok(bytes) => parse_request(&bytes, client_addr),
            Err(e) => Err(e),
        };
        let request = match request {
            Ok(request) => request,
            Err(ServerError::MalformedRequest(reason)) => {
                debug!(%client_addr, reason, "bad request");
                return self
                    .finish(stream, Response::bad_request(), Outcome::BadRequest)
                    .await;
            }
            Err(e) => return Err(e),
        };
        info!(%client_addr, method = %request.method, uri = %request.uri, "request");

        let target = match resolve(&request.path, &self.config) {
            Resolution::Found(target) => target,
            Resolution::NotFound => {
                let response = not_found_page(&self.config).await?;
                return self.finish(stream, response, Outcome::NotFound).await;
            }
        };
        self.notify(&target, client_addr, local_addr);

        match (target.mode, &self.runner) {
            (Mode::Script, Some(runner)) => {
                let server_port = local_addr.map_or(self.config.port, |addr| addr.port());
                let env = ScriptEnvironment::build(&request, &target, &self.config, server_port);
                let response = execute(runner.as_ref(), &env).await?;
                self.finish(stream, response, Outcome::Script).await
            }
            _ => {
                let response = serve_file(&target.path, &self.config, self.cache.as_ref()).await?;
                self.finish(stream, response, Outcome::Static).await
            }
        }
    }

    async fn finish<S>(
        &self,
        stream: &mut S,
        response: Response,
        outcome: Outcome,
    ) -> ServerResult<Outcome>
    where
        S: AsyncWrite + Unpin + Send,
    {
        stream.respond(&response).await?;
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "shutdown after response failed");
        }
        debug!(status = %response.status, ?outcome, "connection closed");
        Ok(outcome)
    }

    /// Delivers at most once and never waits; a full or closed channel
    /// loses the event.
    fn notify(
        &self,
        target: &ResolvedTarget,
        client_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) {
        let Some(observer) = &self.config.observer else {
            return;
        };
        let event = ConnectionEvent {
            connection_id: Uuid::new_v4(),
            client_addr,
            local_addr,
            path: target.path.clone(),
            mode: target.mode,
            at: Utc::now(),
        };
        if let Err(e) = observer.try_send(event) {
            debug!(error = %e, "observer event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::sync::mpsc;

    struct EchoRunner;

    #[async_trait]
    impl ScriptRunner for EchoRunner {
        async fn run(&self, env: &ScriptEnvironment) -> ServerResult<Vec<u8>> {
            Ok(format!(
                "Content-type: text/plain\r\n\r\nself={}",
                env.server_var("PHP_SELF").unwrap_or_default()
            )
            .into_bytes())
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl ScriptRunner for FailingRunner {
        async fn run(&self, _env: &ScriptEnvironment) -> ServerResult<Vec<u8>> {
            Err(ServerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "php-cgi missing",
            )))
        }
    }

    async fn roundtrip(handler: &ConnectionHandler, raw: &[u8]) -> (ServerResult<Outcome>, String) {
        let (mut client, mut server) = duplex(64 * 1024);
        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();

        let outcome = handler
            .handle(&mut server, "127.0.0.1:40000".parse().unwrap(), None)
            .await;
        drop(server);

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        (outcome, reply)
    }

    fn docs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("index.php"), "<?php echo 'hi';").unwrap();
        dir
    }

    #[tokio::test]
    async fn empty_request_gets_400() {
        let dir = docs();
        let handler = ConnectionHandler::new(Arc::new(ServerConfig::builder(dir.path()).build().unwrap()));
        let (outcome, reply) = roundtrip(&handler, b"").await;
        assert_eq!(outcome.unwrap(), Outcome::BadRequest);
        assert!(reply.starts_with("HTTP/1.0 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn static_index_and_observer_event() {
        let dir = docs();
        let (tx, mut rx) = mpsc::channel(4);
        let mut builder = ServerConfig::builder(dir.path());
        builder.observer(tx);
        let handler = ConnectionHandler::new(Arc::new(builder.build().unwrap()));

        let (outcome, reply) = roundtrip(&handler, b"GET / HTTP/1.0\r\n\r\n").await;
        assert_eq!(outcome.unwrap(), Outcome::Static);
        assert!(reply.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(reply.contains("Content-Type: text/html\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
        assert!(reply.ends_with("<h1>home</h1>"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.mode, Mode::Static);
        assert!(event.path.ends_with("index.html"));
        assert_eq!(event.client_addr.port(), 40000);
    }

    #[tokio::test]
    async fn script_index_uses_runner() {
        let dir = docs();
        let mut builder = ServerConfig::builder(dir.path());
        builder.enable_scripts(dir.path(), "").unwrap();
        let handler = ConnectionHandler::new(Arc::new(builder.build().unwrap()))
            .with_runner(Arc::new(EchoRunner));

        let (outcome, reply) = roundtrip(&handler, b"GET / HTTP/1.0\r\n\r\n").await;
        assert_eq!(outcome.unwrap(), Outcome::Script);
        assert!(reply.contains("Content-type: text/plain\r\n"));
        assert!(reply.ends_with("self=/index.php"));
    }

    #[tokio::test]
    async fn unknown_path_gets_fallback_404() {
        let dir = docs();
        let mut builder = ServerConfig::builder(dir.path());
        builder.error_page(404, dir.path().join("missing-404.html"));
        let handler = ConnectionHandler::new(Arc::new(builder.build().unwrap()));

        let (outcome, reply) = roundtrip(&handler, b"GET /nope.html HTTP/1.0\r\n\r\n").await;
        assert_eq!(outcome.unwrap(), Outcome::NotFound);
        assert!(reply.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(reply.ends_with(crate::static_files::NOT_FOUND_FALLBACK));
    }

    #[tokio::test]
    async fn script_failure_drops_connection_without_reply() {
        let dir = docs();
        let mut builder = ServerConfig::builder(dir.path());
        builder.enable_scripts(dir.path(), "").unwrap();
        let handler = ConnectionHandler::new(Arc::new(builder.build().unwrap()))
            .with_runner(Arc::new(FailingRunner));

        let (outcome, reply) = roundtrip(&handler, b"GET /index.php HTTP/1.0\r\n\r\n").await;
        assert!(matches!(outcome, Err(ServerError::Io(_))));
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn stylesheet_failure_drops_connection_without_reply() {
        let dir = docs();
        std::fs::write(dir.path().join("theme.scss"), "a { color: red; }").unwrap();
        let mut builder = ServerConfig::builder(dir.path());
        builder.sass_binary(dir.path().join("no-sass-here"));
        let handler = ConnectionHandler::new(Arc::new(builder.build().unwrap()));

        let (outcome, reply) = roundtrip(&handler, b"GET /theme.scss HTTP/1.0\r\n\r\n").await;
        assert!(matches!(outcome, Err(ServerError::NoCompilerFound(_))));
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn full_observer_does_not_block() {
        let dir = docs();
        let (tx, _rx) = mpsc::channel(1);
        let mut builder = ServerConfig::builder(dir.path());
        builder.observer(tx);
        let handler = ConnectionHandler::new(Arc::new(builder.build().unwrap()));

        for _ in 0..3 {
            let (outcome, _) = roundtrip(&handler, b"GET /index.html HTTP/1.0\r\n\r\n").await;
            assert_eq!(outcome.unwrap(), Outcome::Static);
        }
    }
}
