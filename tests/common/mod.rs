#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;

use servhttp::{Server, ServerConfigBuilder};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Binds an ephemeral port on loopback and serves until stopped.
    pub async fn start(mut builder: ServerConfigBuilder) -> Self {
        builder.host("127.0.0.1").port(0);
        let server = Server::new(builder.build().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    pub async fn send(&self, raw: &[u8]) -> String {
        request(self.addr, raw).await
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap();
    }
}

/// Sends `raw` as-is, half-closes, and reads until the server closes.
pub async fn request(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    String::from_utf8_lossy(&reply).into_owned()
}

/// Document root with a home page, a styled sub-page and a custom 404.
pub fn site() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "index.html", "<h1>home</h1>");
    write(dir.path(), "about/index.htm", "<h1>about</h1>");
    write(dir.path(), "css/site.css", "body{margin:0}");
    write(dir.path(), "errors/404.html", "<h1>custom 404</h1>");
    dir
}

pub fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

pub fn body(reply: &str) -> &str {
    reply.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}
