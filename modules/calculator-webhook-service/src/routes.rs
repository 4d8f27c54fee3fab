//! Calculator agent webhook: the reference implementation of the tool-call
//! webhook contract.

use agent_registry_types::{WebhookRequest, WebhookResponse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Value, json};
use strum::IntoEnumIterator;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    fn operands(self) -> (&'static str, &'static str) {
        match self {
            Operation::Multiply => ("x", "y"),
            _ => ("a", "b"),
        }
    }

    pub fn apply(self, params: &Value) -> Result<f64, String> {
        let (left, right) = self.operands();
        let a = operand(params, left)?;
        let b = operand(params, right)?;
        let value = match self {
            Operation::Add => a + b,
            Operation::Subtract => a - b,
            Operation::Multiply => a * b,
            Operation::Divide => {
                if b == 0.0 {
                    return Err("Division by zero is not allowed".to_string());
                }
                a / b
            }
        };
        if !value.is_finite() {
            return Err("Result is not a finite number".to_string());
        }
        Ok(value)
    }
}

fn operand(params: &Value, key: &str) -> Result<f64, String> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("Missing or invalid parameter '{}'", key))
}

/// Whole results go out as JSON integers.
fn number(value: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() <= MAX_EXACT {
        json!(value as i64)
    } else {
        json!(value)
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .layer(tower_http::cors::CorsLayer::permissive())
}

// GET /
async fn root() -> Json<Value> {
    let tools: Vec<&'static str> = Operation::iter().map(<&'static str>::from).collect();
    Json(json!({
        "message": "Calculator agent webhook",
        "available_tools": tools,
        "webhook_endpoint": "/webhook"
    }))
}

// GET /health
async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

// POST /webhook
async fn webhook(Json(req): Json<WebhookRequest>) -> Json<WebhookResponse> {
    log::info!(
        "Received tool call {}: {} with parameters {}",
        req.tool_call_id,
        req.tool_name,
        req.parameters
    );

    let Ok(op) = req.tool_name.parse::<Operation>() else {
        return Json(WebhookResponse::failure(
            format!("Tool '{}' not found", req.tool_name),
            Some(req.tool_call_id),
        ));
    };

    match op.apply(&req.parameters) {
        Ok(value) => Json(WebhookResponse::success(number(value), req.tool_call_id)),
        Err(e) => {
            log::warn!("Tool call {} failed: {}", req.tool_call_id, e);
            Json(WebhookResponse::failure(e, Some(req.tool_call_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    async fn call(tool_name: &str, parameters: Value) -> Value {
        let body = json!({
            "tool_name": tool_name,
            "parameters": parameters,
            "tool_call_id": "call-1"
        });
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_operations() {
        assert_eq!(Operation::Add.apply(&json!({"a": 5, "b": 3})), Ok(8.0));
        assert_eq!(Operation::Subtract.apply(&json!({"a": 5, "b": 8})), Ok(-3.0));
        assert_eq!(Operation::Multiply.apply(&json!({"x": 2.5, "y": 4})), Ok(10.0));
        assert_eq!(Operation::Divide.apply(&json!({"a": 7, "b": 2})), Ok(3.5));
        assert!(Operation::Divide.apply(&json!({"a": 1, "b": 0})).is_err());
        assert!(Operation::Multiply.apply(&json!({"a": 1, "b": 2})).is_err());
        assert_eq!("divide".parse::<Operation>(), Ok(Operation::Divide));
        assert!("modulo".parse::<Operation>().is_err());
    }

    #[test]
    fn test_whole_results_are_integers() {
        assert_eq!(number(8.0), json!(8));
        assert_eq!(number(-3.0), json!(-3));
        assert_eq!(number(3.5), json!(3.5));
    }

    #[tokio::test]
    async fn test_webhook_add() {
        let body = call("add", json!({"a": 5, "b": 3})).await;
        assert_eq!(body["result"], json!(8));
        assert_eq!(body["tool_call_id"], "call-1");
        assert_eq!(body["status"], "success");
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_root_lists_tools() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = router().oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body["available_tools"],
            json!(["add", "subtract", "multiply", "divide"])
        );
    }

    #[tokio::test]
    async fn test_webhook_errors() {
        let body = call("divide", json!({"a": 1, "b": 0})).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], "Division by zero is not allowed");
        assert!(body.get("result").is_none());

        let body = call("sqrt", json!({"a": 4})).await;
        assert_eq!(body["error"], "Tool 'sqrt' not found");
        assert_eq!(body["tool_call_id"], "call-1");
    }
}
