use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use http::StatusCode;
use tokio::process::Command;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::helpers::traits::file_cache::FileCache;
use crate::helpers::traits::http_response::{Body, Response};

/// Sent when no 404 page is configured or the configured file is missing.
pub const NOT_FOUND_FALLBACK: &str = "<h1>Sorry, unable to find this file!</h1>";

const STYLESHEET_SOURCES: [&str; 2] = ["sass", "scss"];

/// Serves an existing file verbatim; Sass sources are compiled first and
/// served as CSS.
pub async fn serve_file(
    path: &Path,
    config: &ServerConfig,
    cache: Option<&Arc<FileCache>>,
) -> ServerResult<Response> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let (body, content_type) = if STYLESHEET_SOURCES.contains(&extension.as_str()) {
        let css = compile_stylesheet(path, &config.sass_binary).await?;
        (Body::from(css), "text/css")
    } else {
        (read_file(path, cache).await?, content_type(path))
    };

    Ok(Response::new(StatusCode::OK)
        .header("Content-Type", content_type)
        .body(body))
}

/// Content type by extension, `text/html` when unknown.
pub fn content_type(path: &Path) -> &'static str {
    mime_guess::from_path(path).first_raw().unwrap_or("text/html")
}

/// Through the cache, files come back shared or memory-mapped.
async fn read_file(path: &Path, cache: Option<&Arc<FileCache>>) -> ServerResult<Body> {
    let Some(cache) = cache else {
        return Ok(tokio::fs::read(path).await?.into());
    };

    let cache = cache.clone();
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || cache.load(&path).map(Body::from))
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e)))?
}

/// Pipes a `.sass`/`.scss` file through the external compiler.
pub async fn compile_stylesheet(path: &Path, compiler: &Path) -> ServerResult<Vec<u8>> {
    if !compiler.is_file() {
        return Err(ServerError::NoCompilerFound(compiler.to_path_buf()));
    }
    let source = std::fs::canonicalize(path)?;

    debug!(?compiler, ?source, "compiling stylesheet");
    let output = Command::new(compiler)
        .arg(&source)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await?;
    if !output.status.success() {
        return Err(ServerError::ProcessFailed {
            program: compiler.to_path_buf(),
            status: output.status,
        });
    }
    Ok(output.stdout)
}

/// The configured 404 page, or the inline fallback when that file is missing.
pub async fn not_found_page(config: &ServerConfig) -> ServerResult<Response> {
    let body = match config.error_page(404) {
        Some(page) if page.is_file() => tokio::fs::read(page).await?,
        _ => NOT_FOUND_FALLBACK.as_bytes().to_vec(),
    };
    Ok(Response::new(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/html")
        .body(body))
}
