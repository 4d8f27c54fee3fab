//! Calculator webhook: an example agent that answers tool calls dispatched by
//! the registry.
//!
//! Default: http://127.0.0.1:8001/webhook

mod routes;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let port: u16 = std::env::var("CALCULATOR_WEBHOOK_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8001);

    let app = routes::router();

    let addr = format!("127.0.0.1:{}", port);
    log::info!("Calculator webhook listening on http://{}/webhook", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
