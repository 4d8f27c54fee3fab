//! Shared types for the agent registry service, its webhooks, and its RPC clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =====================================================
// Domain Types
// =====================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub webhook_url: String,
    /// Tool name -> parameter schema.
    pub tool_schema: Map<String, Value>,
    pub pricing: f64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tool_schema.contains_key(tool_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub id: String,
    pub token: String,
    pub agent_id: String,
    pub user_id: String,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Listing form with the secret part of the value hidden.
    pub fn masked(&self) -> TokenSummary {
        let visible: String = self.token.chars().take(16).collect();
        TokenSummary {
            id: self.id.clone(),
            token: format!("{}...", visible),
            agent_id: self.agent_id.clone(),
            user_id: self.user_id.clone(),
            is_active: self.is_active,
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSummary {
    pub id: String,
    pub token: String,
    pub agent_id: String,
    pub user_id: String,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ToolCallStatus::Pending)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Paid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub agent_id: String,
    pub caller_user_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub cost: f64,
    pub payment_status: PaymentState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: String,
    pub tool_call_id: String,
    pub amount: f64,
    pub currency: String,
    /// Checkout / charge id assigned by the payment provider.
    pub provider_payment_id: Option<String>,
    pub checkout_url: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// =====================================================
// RPC Request Types
// =====================================================

/// Registration and update body. Every field defaults so that missing
/// fields surface as validation errors rather than decode failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub tool_schema: Value,
    #[serde(default)]
    pub pricing: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAgentsQuery {
    pub user_id: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentList {
    pub agents: Vec<Agent>,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub agent_id: String,
    pub user_id: String,
    #[serde(default)]
    pub expires_in_days: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserTokens {
    pub user_id: String,
    pub tokens: Vec<TokenSummary>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub agent_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    pub caller_user_id: String,
    /// When false the webhook round trip runs in the background and the
    /// pending record is returned straight away.
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallIdRequest {
    pub tool_call_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeToolCallRequest {
    pub tool_call_id: String,
    pub result: Value,
    #[serde(default)]
    pub status: Option<ToolCallStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolCallPoll {
    pub tool_call_id: String,
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub payment_status: PaymentState,
}

impl From<&ToolCall> for ToolCallPoll {
    fn from(call: &ToolCall) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            status: call.status,
            result: call.result.clone(),
            completed_at: call.completed_at,
            payment_status: call.payment_status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub tool_call_id: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

pub fn default_currency() -> String {
    "USD".to_string()
}

/// Status notification pushed by the payment provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentEvent {
    #[serde(default)]
    pub checkout_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// =====================================================
// Agent Webhook Contract
// =====================================================

/// Body POSTed to an agent's `webhook_url`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookRequest {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    pub tool_call_id: String,
}

/// Body an agent webhook answers with: `result` on success, `error` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl WebhookResponse {
    pub fn success(result: Value, tool_call_id: impl Into<String>) -> Self {
        Self {
            result: Some(result),
            error: None,
            tool_call_id: Some(tool_call_id.into()),
            status: Some("success".to_string()),
        }
    }

    pub fn failure(error: impl Into<String>, tool_call_id: Option<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
            tool_call_id,
            status: Some("error".to_string()),
        }
    }
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub total_agents: i64,
    pub total_tool_calls: i64,
    pub total_payments: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_agents: i64,
    pub total_tool_calls: i64,
    pub total_payments: i64,
}
