//! Tool-call dispatch: records a call, forwards it to the agent's webhook and
//! stores whatever comes back.

use crate::db::Db;
use crate::error::{RegistryError, Result};
use agent_registry_types::*;
use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Outbound HTTP client for agent webhooks. One attempt per call, bounded by `timeout`.
pub struct WebhookClient {
    client: Client,
    timeout: Duration,
}

/// Why a webhook round trip did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookFailure {
    pub timed_out: bool,
    pub message: String,
    /// Error payload persisted as the tool call's result.
    pub payload: Value,
}

impl WebhookFailure {
    fn timeout(timeout: Duration) -> Self {
        let message = format!("Webhook request timed out after {}ms", timeout.as_millis());
        Self {
            timed_out: true,
            payload: json!({ "error": message }),
            message,
        }
    }

    fn failed(message: impl Into<String>, details: Option<String>) -> Self {
        let message = message.into();
        let payload = match details {
            Some(details) => json!({ "error": message, "details": details }),
            None => json!({ "error": message }),
        };
        Self {
            timed_out: false,
            message,
            payload,
        }
    }
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn invoke(
        &self,
        webhook_url: &str,
        request: &WebhookRequest,
    ) -> std::result::Result<Value, WebhookFailure> {
        let response = match self.client.post(webhook_url).json(request).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(WebhookFailure::timeout(self.timeout)),
            Err(e) => {
                return Err(WebhookFailure::failed(
                    format!("Webhook request failed: {}", e),
                    None,
                ));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return Err(WebhookFailure::timeout(self.timeout)),
            Err(e) => {
                return Err(WebhookFailure::failed(
                    format!("Failed to read webhook response: {}", e),
                    None,
                ));
            }
        };

        if !status.is_success() {
            return Err(WebhookFailure::failed(
                format!("Webhook call failed with status {}", status.as_u16()),
                Some(body),
            ));
        }

        let json: Value = serde_json::from_str(&body).map_err(|_| {
            WebhookFailure::failed("Webhook returned a malformed response", Some(body.clone()))
        })?;
        interpret_response(json, &body)
    }
}

/// `{result}` is success; `{error}` or anything else is a failure.
fn interpret_response(json: Value, raw: &str) -> std::result::Result<Value, WebhookFailure> {
    if let Some(error) = json.get("error").filter(|e| !e.is_null()) {
        let text = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(WebhookFailure {
            timed_out: false,
            message: format!("Agent reported an error: {}", text),
            payload: json!({ "error": error }),
        });
    }
    match json {
        Value::Object(mut map) if map.contains_key("result") => {
            Ok(map.remove("result").unwrap_or(Value::Null))
        }
        _ => Err(WebhookFailure::failed(
            "Webhook response is missing a 'result' field",
            Some(raw.to_string()),
        )),
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<Db>,
    webhook: Arc<WebhookClient>,
}

impl Dispatcher {
    pub fn new(db: Arc<Db>, webhook: Arc<WebhookClient>) -> Self {
        Self { db, webhook }
    }

    pub async fn call_tool(&self, req: CallToolRequest) -> Result<ToolCall> {
        if req.caller_user_id.trim().is_empty() {
            return Err(RegistryError::validation("caller_user_id is required"));
        }
        let agent = self
            .db
            .get_agent(&req.agent_id)?
            .ok_or(RegistryError::NotFound("Agent"))?;
        if !agent.has_tool(&req.tool_name) {
            return Err(RegistryError::UnknownTool(req.tool_name));
        }

        let call = ToolCall {
            id: Uuid::new_v4().to_string(),
            agent_id: agent.id.clone(),
            caller_user_id: req.caller_user_id,
            tool_name: req.tool_name,
            parameters: req.parameters,
            status: ToolCallStatus::Pending,
            result: None,
            cost: agent.pricing,
            payment_status: PaymentState::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.db.insert_tool_call(&call)?;
        log::info!(
            "Dispatching tool call {} ({} on agent {})",
            call.id,
            call.tool_name,
            call.agent_id
        );

        if !req.wait {
            let this = self.clone();
            let pending = call.clone();
            let webhook_url = agent.webhook_url;
            tokio::spawn(async move {
                let id = pending.id.clone();
                if let Err(e) = this.execute(&webhook_url, pending).await {
                    log::warn!("Background tool call {} failed: {}", id, e);
                }
            });
            return Ok(call);
        }

        self.execute(&agent.webhook_url, call).await
    }

    async fn execute(&self, webhook_url: &str, call: ToolCall) -> Result<ToolCall> {
        let request = WebhookRequest {
            tool_name: call.tool_name.clone(),
            parameters: call.parameters.clone(),
            tool_call_id: call.id.clone(),
        };
        let outcome = self.webhook.invoke(webhook_url, &request).await;
        let now = Utc::now();

        match outcome {
            Ok(result) => {
                if !self
                    .db
                    .finish_tool_call(&call.id, ToolCallStatus::Completed, &result, now)?
                {
                    log::info!("Tool call {} was finalized before its webhook answered", call.id);
                    return self.current(&call.id);
                }
                log::info!("Tool call {} completed", call.id);
                Ok(ToolCall {
                    status: ToolCallStatus::Completed,
                    result: Some(result),
                    completed_at: Some(now),
                    ..call
                })
            }
            Err(failure) => {
                if !self
                    .db
                    .finish_tool_call(&call.id, ToolCallStatus::Failed, &failure.payload, now)?
                {
                    log::info!("Tool call {} was finalized before its webhook failed", call.id);
                    return self.current(&call.id);
                }
                log::warn!("Tool call {} failed: {}", call.id, failure.message);
                Err(if failure.timed_out {
                    RegistryError::UpstreamTimeout {
                        tool_call_id: call.id,
                        timeout_ms: self.webhook.timeout().as_millis() as u64,
                    }
                } else {
                    RegistryError::UpstreamError {
                        tool_call_id: call.id,
                        message: failure.message,
                    }
                })
            }
        }
    }

    fn current(&self, tool_call_id: &str) -> Result<ToolCall> {
        self.db
            .get_tool_call(tool_call_id)?
            .ok_or(RegistryError::NotFound("Tool call"))
    }

    pub fn poll_tool_call(&self, tool_call_id: &str) -> Result<ToolCallPoll> {
        let call = self.current(tool_call_id)?;
        Ok(ToolCallPoll::from(&call))
    }

    /// Stores a result produced off the webhook path.
    pub fn finalize_tool_call(&self, req: FinalizeToolCallRequest) -> Result<ToolCall> {
        let status = req.status.unwrap_or(ToolCallStatus::Completed);
        if !status.is_terminal() {
            return Err(RegistryError::validation(
                "status must be 'completed' or 'failed'",
            ));
        }
        let call = self.current(&req.tool_call_id)?;
        if call.status.is_terminal() {
            return Err(RegistryError::InvalidState(format!(
                "Tool call already {}",
                call.status
            )));
        }

        let now = Utc::now();
        if !self
            .db
            .finish_tool_call(&call.id, status, &req.result, now)?
        {
            return Err(RegistryError::InvalidState(
                "Tool call already finalized".to_string(),
            ));
        }
        log::info!("Tool call {} finalized as {}", call.id, status);
        Ok(ToolCall {
            status,
            result: Some(req.result),
            completed_at: Some(now),
            ..call
        })
    }
}
