use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod connection;
pub mod error;
pub mod helpers;
pub mod resolver;
pub mod script;
pub mod static_files;

pub use config::{ScriptConfig, ServerConfig, ServerConfigBuilder, ServerConfigFile};
pub use connection::{ConnectionEvent, ConnectionHandler, Outcome};
pub use error::{ServerError, ServerResult};
pub use helpers::traits::file_cache::FileCache;
pub use helpers::traits::http_request::{parse_request, HeaderList, Request};
pub use helpers::traits::http_response::{Body, Response, ResponseUtil};
pub use helpers::traits::http_stream::StreamHttp;
pub use resolver::{resolve, Mode, Resolution, ResolvedTarget};
pub use script::{InterpreterRunner, ScriptEnvironment, ScriptOutput, ScriptRunner};

pub mod external {
    pub use async_trait;
    #[cfg(feature = "env")]
    pub use dotenv;
    pub use http;
    pub use tokio;
}

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

pub struct Server {
    pub listener: TcpListener,
    handler: Arc<ConnectionHandler>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Server, SendableError> {
        Self::with_handler(ConnectionHandler::new(Arc::new(config))).await
    }

    /// Binds to the handler's configured address.
    pub async fn with_handler(handler: ConnectionHandler) -> Result<Server, SendableError> {
        let address = handler.config().address();
        let listener = TcpListener::bind(&address).await?;
        info!(
            address = %listener.local_addr()?,
            docs_dir = ?handler.config().docs_dir,
            scripts = handler.config().scripts_enabled(),
            "server listening"
        );
        Ok(Server {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        self.handler.config()
    }

    pub async fn accept(&self) -> Result<Accept, SendableError> {
        let (tcp_stream, client_addr) = accept_connection(&self.listener).await?;
        Ok(Accept::new(tcp_stream, client_addr, self.handler.clone()))
    }

    /// Accepts connections until the process ends.
    pub async fn run(self) -> ServerResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes, each handled by its own
    /// task. Connections still in flight at shutdown are aborted.
    pub async fn run_until<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let Server { listener, handler } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = accept_connection(&listener) => {
                    let (tcp_stream, client_addr) = match accepted {
                        Ok(data) => data,
                        Err(e) => {
                            debug!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let accept = Accept::new(tcp_stream, client_addr, handler.clone());
                    connections.spawn(async move {
                        if let Err(e) = accept.handle().await {
                            warn!(%client_addr, error = %e, "connection failed");
                        }
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        info!(in_flight = connections.len(), "server stopping");
        drop(listener);
        connections.shutdown().await;
        Ok(())
    }
}

async fn accept_connection(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    match listener.accept().await {
        Ok(data) => Ok(data),
        Err(e) => {
            if !is_connection_error(&e) {
                warn!(error = %e, "accept error, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e)
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// An accepted connection, not yet read from.
pub struct Accept {
    pub tcp_stream: TcpStream,
    pub client_addr: SocketAddr,
    handler: Arc<ConnectionHandler>,
}

impl Accept {
    pub fn new(tcp_stream: TcpStream, client_addr: SocketAddr, handler: Arc<ConnectionHandler>) -> Self {
        Self {
            tcp_stream,
            client_addr,
            handler,
        }
    }

    pub async fn handle(mut self) -> ServerResult<Outcome> {
        self.tcp_stream.set_nodelay(self.handler.config().no_delay)?;
        let local_addr = self.tcp_stream.local_addr().ok();
        self.handler
            .handle(&mut self.tcp_stream, self.client_addr, local_addr)
            .await
    }
}
