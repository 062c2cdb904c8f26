use std::path::PathBuf;

use clap::Parser;
use servhttp::external::dotenv::dotenv;
use servhttp::{SendableError, Server, ServerConfig, ServerConfigFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serves a document root over HTTP/1.0, optionally running PHP scripts.
///
/// Settings are layered: built-in defaults, then the JSON config file, then
/// environment variables (a `.env` file is honored), then these flags.
#[derive(Parser)]
#[command(name = "serve", version, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Document root
    #[arg(short, long)]
    docs_dir: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding the php-cgi binary; enables script mode
    #[arg(long)]
    php_dir: Option<PathBuf>,

    /// php.ini passed to the interpreter with `-c`
    #[arg(long, requires = "php_dir")]
    php_ini: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "servhttp=info,serve=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut builder = ServerConfig::builder(".");
    if let Some(path) = &cli.config {
        ServerConfigFile::load(path)?.apply(&mut builder)?;
    }
    builder.from_env()?;
    if let Some(docs_dir) = cli.docs_dir {
        builder.docs_dir(docs_dir);
    }
    if let Some(host) = cli.host {
        builder.host(host);
    }
    if let Some(port) = cli.port {
        builder.port(port);
    }
    if let Some(php_dir) = cli.php_dir {
        builder.enable_scripts(php_dir, cli.php_ini.unwrap_or_default())?;
    }

    let server = Server::new(builder.build()?).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("ctrl-c received");
        })
        .await?;
    Ok(())
}
