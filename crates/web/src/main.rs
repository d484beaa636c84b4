use std::net::SocketAddr;

use ghostrunner_common::{AppContext, DatabaseSettings, DEFAULT_ALIAS};
use tracing::info;

use ghostrunner_web::server::{install_schema, WebServer};

// Connections belong to the thread that opened them, so requests are served on
// the main thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let web_addr: SocketAddr = std::env::var("GHOSTRUNNER_WEB_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let database_url = std::env::var("GHOSTRUNNER_DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://ghostrunner.db".to_string());

    let ctx = AppContext::new(&[DatabaseSettings::from_url(DEFAULT_ALIAS, &database_url)?]);
    install_schema(ctx.connections.default_db()?)?;

    info!("Starting Ghostrunner Web on http://{} (database: {})", web_addr, database_url);

    WebServer::new(ctx).serve(web_addr).await
}
