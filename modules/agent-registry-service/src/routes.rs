//! Axum route handlers for the agent registry REST API and MCP endpoint.

use crate::config::Config;
use crate::db::Db;
use crate::dispatch::{Dispatcher, WebhookClient};
use crate::error::{RegistryError, Result};
use crate::mcp::McpFacade;
use crate::payments::{CoinbaseCommerceProvider, PaymentProvider, PaymentService, SimulatedProvider};
use crate::registry::Registry;
use crate::tokens::TokenSigner;
use agent_registry_types::*;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub registry: Arc<Registry>,
    pub payments: Arc<PaymentService>,
    pub mcp: Arc<McpFacade>,
    pub start_time: Instant,
}

impl AppState {
    pub fn build(config: &Config, db: Arc<Db>) -> reqwest::Result<Arc<Self>> {
        let registry = Arc::new(Registry::new(
            db.clone(),
            TokenSigner::new(&config.secret_key),
        ));
        let webhook = Arc::new(WebhookClient::new(config.webhook_timeout)?);
        let dispatcher = Dispatcher::new(db.clone(), webhook);

        let provider: Arc<dyn PaymentProvider> = match &config.coinbase_api_key {
            Some(key) => Arc::new(CoinbaseCommerceProvider::new(key, config.webhook_timeout)?),
            None => Arc::new(SimulatedProvider),
        };
        log::info!("Using payment provider: {}", provider.name());
        let payments = Arc::new(PaymentService::new(
            db,
            provider,
            config.coinbase_webhook_secret.clone(),
        ));

        let mcp = Arc::new(McpFacade::new(
            registry.clone(),
            dispatcher,
            payments.clone(),
            config.require_tokens,
        ));

        Ok(Arc::new(Self {
            registry,
            payments,
            mcp,
            start_time: Instant::now(),
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = tower_http::cors::CorsLayer::permissive();

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents", get(list_agents))
        .route(
            "/api/agents/:agent_id",
            get(get_agent).put(update_agent).delete(deactivate_agent),
        )
        .route("/api/tokens/create", post(create_token))
        .route("/api/tokens/user/:user_id", get(list_user_tokens))
        .route("/api/tokens/tool-call/:tool_call_id", get(tool_call_status))
        .route("/api/tokens/create-payment", post(create_payment))
        .route("/api/tokens/webhook/payment", post(payment_webhook))
        .route("/api/payments/:identifier", get(payment_status))
        .route("/mcp", post(mcp))
        .with_state(state)
        .layer(cors)
}

fn respond<T: Serialize>(result: Result<T>, success: StatusCode) -> (StatusCode, Json<RpcResponse<T>>) {
    match result {
        Ok(data) => (success, Json(RpcResponse::ok(data))),
        Err(e) => {
            let status = e.status_code();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                log::error!("Request failed: {}", e);
            }
            (status, Json(RpcResponse::err(e.to_string())))
        }
    }
}

/// Extractor rejections become validation errors so they keep the envelope.
fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| RegistryError::validation(e.body_text()))
}

fn query_params<T>(query: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    query
        .map(|Query(value)| value)
        .map_err(|e| RegistryError::validation(e.body_text()))
}

// GET /
async fn root() -> Json<Value> {
    Json(json!({
        "service": "agent-registry",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "agents": "/api/agents",
            "tokens": "/api/tokens",
            "payments": "/api/payments",
            "mcp": "/mcp",
            "health": "/health"
        }
    }))
}

// GET /health
async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let result = state.registry.stats().map(|stats| ServiceStatus {
        running: true,
        uptime_secs: state.start_time.elapsed().as_secs(),
        total_agents: stats.total_agents,
        total_tool_calls: stats.total_tool_calls,
        total_payments: stats.total_payments,
    });
    respond(result, StatusCode::OK)
}

// POST /api/agents/register
async fn register_agent(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<RegisterAgentRequest>, JsonRejection>,
) -> (StatusCode, Json<RpcResponse<Agent>>) {
    let result = json_body(payload).and_then(|req| state.registry.register_agent(req));
    respond(result, StatusCode::CREATED)
}

// GET /api/agents
async fn list_agents(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<ListAgentsQuery>, QueryRejection>,
) -> (StatusCode, Json<RpcResponse<AgentList>>) {
    let result = query_params(query).and_then(|query| state.registry.list_agents(&query));
    respond(result, StatusCode::OK)
}

// GET /api/agents/:agent_id
async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> (StatusCode, Json<RpcResponse<Agent>>) {
    respond(state.registry.get_agent(&agent_id), StatusCode::OK)
}

// PUT /api/agents/:agent_id
async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    payload: std::result::Result<Json<RegisterAgentRequest>, JsonRejection>,
) -> (StatusCode, Json<RpcResponse<Agent>>) {
    let result = json_body(payload).and_then(|req| state.registry.update_agent(&agent_id, req));
    respond(result, StatusCode::OK)
}

// DELETE /api/agents/:agent_id
async fn deactivate_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    respond(
        state.registry.deactivate_agent(&agent_id).map(|()| true),
        StatusCode::OK,
    )
}

// POST /api/tokens/create
async fn create_token(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreateTokenRequest>, JsonRejection>,
) -> (StatusCode, Json<RpcResponse<Token>>) {
    let result = json_body(payload).and_then(|req| state.registry.create_token(req));
    respond(result, StatusCode::CREATED)
}

// GET /api/tokens/user/:user_id
async fn list_user_tokens(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<RpcResponse<UserTokens>>) {
    respond(state.registry.list_user_tokens(&user_id), StatusCode::OK)
}

// GET /api/tokens/tool-call/:tool_call_id
async fn tool_call_status(
    State(state): State<Arc<AppState>>,
    Path(tool_call_id): Path<String>,
) -> (StatusCode, Json<RpcResponse<ToolCall>>) {
    respond(state.registry.get_tool_call_status(&tool_call_id), StatusCode::OK)
}

// POST /api/tokens/create-payment
async fn create_payment(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> (StatusCode, Json<RpcResponse<Payment>>) {
    let result = match json_body(payload) {
        Ok(req) => state.payments.create_payment(req).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::CREATED)
}

// GET /api/payments/:identifier
async fn payment_status(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
) -> (StatusCode, Json<RpcResponse<Payment>>) {
    respond(state.payments.get_payment_status(&identifier), StatusCode::OK)
}

// POST /api/tokens/webhook/payment
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<RpcResponse<Payment>>) {
    let signature = headers
        .get("X-CC-Webhook-Signature")
        .and_then(|v| v.to_str().ok());
    let result = state
        .payments
        .verify_webhook_signature(&body, signature)
        .and_then(|()| {
            serde_json::from_slice::<PaymentEvent>(&body)
                .map_err(|_| RegistryError::validation("Invalid webhook data"))
        })
        .and_then(|event| state.payments.apply_provider_event(event));
    respond(result, StatusCode::OK)
}

// POST /mcp
async fn mcp(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match state.mcp.handle_body(&body, bearer).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
