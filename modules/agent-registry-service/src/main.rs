//! Agent Registry Service: standalone binary for registering agents, issuing
//! access tokens, dispatching tool calls to agent webhooks and tracking
//! payments for them.
//!
//! Serves a REST API under /api and an MCP JSON-RPC endpoint at /mcp.
//! Default: http://127.0.0.1:8000/

mod config;
mod db;
mod dispatch;
mod error;
mod mcp;
mod payments;
mod registry;
mod routes;
mod tokens;

use config::Config;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env().expect("Invalid configuration");

    log::info!("Opening database at: {}", config.database_url);
    let database = Arc::new(db::Db::open(&config.database_url).expect("Failed to open database"));

    let state = routes::AppState::build(&config, database).expect("Failed to build HTTP client");
    if !config.require_tokens {
        log::warn!("MCP tool calls are accepted without access tokens");
    }

    let app = routes::router(state);

    let addr = config.bind_addr();
    log::info!("Agent Registry Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
