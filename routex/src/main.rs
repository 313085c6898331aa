//! routex binary: load config, wire the state, serve
//!
//! Boot failures (bad master password, migration errors, port bind) log and
//! exit nonzero; nothing runs half-initialized.

use routex::api;
use routex::config::Config;
use routex::observability::init_tracing;
use routex::server::Server;
use routex::state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("routex failed to start: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database.path,
        port = config.server.port,
        "starting routex"
    );

    let state = AppState::build(config).await?;
    let app = api::router(state.clone());

    Server::new(state).serve(app).await?;
    Ok(())
}
