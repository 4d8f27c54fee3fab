//! MCP JSON-RPC facade over the registry, dispatch and payment operations.
//!
//! Reads are exposed as resources, writes as tools. Operation failures inside
//! `tools/call` are returned as tool results with `isError: true`; protocol
//! failures are JSON-RPC errors.

use crate::dispatch::Dispatcher;
use crate::error::{RegistryError, Result};
use crate::payments::PaymentService;
use crate::registry::Registry;
use agent_registry_types::*;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use strum::IntoEnumIterator;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const RESOURCE_NOT_FOUND: i32 = -32002;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(McpError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Readable resources, keyed by URI.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceUri {
    AgentList,
    Agent(String),
    ToolCallStatus(String),
    PaymentStatus(String),
    UserTokens(String),
}

impl ResourceUri {
    pub fn parse(uri: &str) -> Option<Self> {
        if uri == "agent://list" {
            return Some(ResourceUri::AgentList);
        }
        let templates: [(&str, fn(String) -> ResourceUri); 4] = [
            ("agent://get/", ResourceUri::Agent),
            ("tool_call://status/", ResourceUri::ToolCallStatus),
            ("payment://get_status/", ResourceUri::PaymentStatus),
            ("user://tokens/", ResourceUri::UserTokens),
        ];
        templates.iter().find_map(|(prefix, build)| {
            uri.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(|rest| build(rest.to_string()))
        })
    }
}

/// Write operations exposed through `tools/call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::EnumIter, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FacadeTool {
    AgentRegister,
    TokenCreate,
    AgentCallTool,
    PaymentCreate,
    ToolCallPoll,
    ToolCallFinalize,
}

impl FacadeTool {
    fn description(self) -> &'static str {
        match self {
            FacadeTool::AgentRegister => "Register an agent with its webhook URL and tool schema",
            FacadeTool::TokenCreate => "Issue an access token for calling an agent's tools",
            FacadeTool::AgentCallTool => "Invoke a tool on a registered agent through its webhook",
            FacadeTool::PaymentCreate => "Create a payment for a tool call",
            FacadeTool::ToolCallPoll => "Read the current status and result of a tool call",
            FacadeTool::ToolCallFinalize => "Store the result of a pending tool call",
        }
    }

    fn input_schema(self) -> Value {
        match self {
            FacadeTool::AgentRegister => json!({
                "type": "object",
                "properties": {
                    "user_id": {"type": "string"},
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "webhook_url": {"type": "string"},
                    "tool_schema": {"type": "object"},
                    "pricing": {"type": "number"}
                },
                "required": ["user_id", "name", "webhook_url", "tool_schema"]
            }),
            FacadeTool::TokenCreate => json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "user_id": {"type": "string"},
                    "expires_in_days": {"type": "integer", "default": 30}
                },
                "required": ["agent_id", "user_id"]
            }),
            FacadeTool::AgentCallTool => json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "tool_name": {"type": "string"},
                    "parameters": {"type": "object"},
                    "caller_user_id": {"type": "string"},
                    "wait": {"type": "boolean", "default": true}
                },
                "required": ["agent_id", "tool_name", "caller_user_id"]
            }),
            FacadeTool::PaymentCreate => json!({
                "type": "object",
                "properties": {
                    "tool_call_id": {"type": "string"},
                    "amount": {"type": "number"},
                    "currency": {"type": "string", "default": "USD"}
                },
                "required": ["tool_call_id", "amount"]
            }),
            FacadeTool::ToolCallPoll => json!({
                "type": "object",
                "properties": {
                    "tool_call_id": {"type": "string"}
                },
                "required": ["tool_call_id"]
            }),
            FacadeTool::ToolCallFinalize => json!({
                "type": "object",
                "properties": {
                    "tool_call_id": {"type": "string"},
                    "result": {},
                    "status": {"type": "string", "enum": ["completed", "failed"]}
                },
                "required": ["tool_call_id", "result"]
            }),
        }
    }
}

enum ToolFailure {
    InvalidArguments(String),
    Operation(RegistryError),
}

impl From<RegistryError> for ToolFailure {
    fn from(e: RegistryError) -> Self {
        ToolFailure::Operation(e)
    }
}

fn arguments<T: DeserializeOwned>(value: Value) -> std::result::Result<T, ToolFailure> {
    serde_json::from_value(value)
        .map_err(|e| ToolFailure::InvalidArguments(format!("Invalid arguments: {}", e)))
}

pub struct McpFacade {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    payments: Arc<PaymentService>,
    require_tokens: bool,
}

impl McpFacade {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Dispatcher,
        payments: Arc<PaymentService>,
        require_tokens: bool,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            payments,
            require_tokens,
        }
    }

    /// Entry point for a raw request body. `None` means no reply is owed.
    pub async fn handle_body(&self, body: &[u8], bearer: Option<&str>) -> Option<McpResponse> {
        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                return Some(McpResponse::error(
                    None,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
            }
        };
        let id = value.get("id").cloned();
        let request: McpRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return Some(McpResponse::error(
                    id,
                    INVALID_REQUEST,
                    format!("Invalid request: {}", e),
                ));
            }
        };
        if request.jsonrpc != "2.0" {
            return Some(McpResponse::error(
                request.id,
                INVALID_REQUEST,
                "Invalid request: jsonrpc must be \"2.0\"",
            ));
        }
        self.handle(request, bearer).await
    }

    pub async fn handle(&self, request: McpRequest, bearer: Option<&str>) -> Option<McpResponse> {
        if request.method.starts_with("notifications/") {
            log::debug!("MCP notification: {}", request.method);
            return None;
        }

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.id),
            "ping" => McpResponse::success(request.id, json!({})),
            "resources/list" => self.handle_list_resources(request.id),
            "resources/templates/list" => self.handle_list_templates(request.id),
            "resources/read" => self.handle_read_resource(request.id, &request.params),
            "tools/list" => self.handle_list_tools(request.id),
            "tools/call" => {
                self.handle_call_tool(request.id, request.params, bearer)
                    .await
            }
            other => McpResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        };
        Some(response)
    }

    fn handle_initialize(&self, id: Option<Value>) -> McpResponse {
        McpResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "resources": {
                        "subscribe": false,
                        "listChanged": false
                    },
                    "tools": {}
                },
                "serverInfo": {
                    "name": "agent-registry",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    fn handle_list_resources(&self, id: Option<Value>) -> McpResponse {
        McpResponse::success(
            id,
            json!({
                "resources": [
                    {
                        "uri": "agent://list",
                        "name": "Registered agents",
                        "description": "All active agents",
                        "mimeType": "application/json"
                    }
                ]
            }),
        )
    }

    fn handle_list_templates(&self, id: Option<Value>) -> McpResponse {
        let template = |uri: &str, name: &str| {
            json!({
                "uriTemplate": uri,
                "name": name,
                "mimeType": "application/json"
            })
        };
        McpResponse::success(
            id,
            json!({
                "resourceTemplates": [
                    template("agent://get/{agent_id}", "Agent details"),
                    template("tool_call://status/{tool_call_id}", "Tool call status"),
                    template("payment://get_status/{identifier}", "Payment status"),
                    template("user://tokens/{user_id}", "A user's active tokens"),
                ]
            }),
        )
    }

    fn handle_read_resource(&self, id: Option<Value>, params: &Value) -> McpResponse {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return McpResponse::error(id, INVALID_PARAMS, "Missing resource uri");
        };
        let Some(resource) = ResourceUri::parse(uri) else {
            return McpResponse::error(
                id,
                RESOURCE_NOT_FOUND,
                format!("Unknown resource: {}", uri),
            );
        };

        match self.read_resource(&resource) {
            Ok(value) => McpResponse::success(
                id,
                json!({
                    "contents": [
                        {
                            "uri": uri,
                            "mimeType": "application/json",
                            "text": value.to_string()
                        }
                    ]
                }),
            ),
            Err(e @ RegistryError::NotFound(_)) => {
                McpResponse::error(id, RESOURCE_NOT_FOUND, e.to_string())
            }
            Err(e) => {
                log::error!("Failed to read resource {}: {}", uri, e);
                McpResponse::error(id, INTERNAL_ERROR, e.to_string())
            }
        }
    }

    fn read_resource(&self, resource: &ResourceUri) -> Result<Value> {
        Ok(match resource {
            ResourceUri::AgentList => {
                let list = self.registry.list_agents(&ListAgentsQuery::default())?;
                json!({
                    "agents": list.agents,
                    "total": list.total,
                    "timestamp": Utc::now(),
                })
            }
            ResourceUri::Agent(agent_id) => json!(self.registry.get_agent(agent_id)?),
            ResourceUri::ToolCallStatus(tool_call_id) => {
                json!(self.registry.get_tool_call_status(tool_call_id)?)
            }
            ResourceUri::PaymentStatus(identifier) => {
                json!(self.payments.get_payment_status(identifier)?)
            }
            ResourceUri::UserTokens(user_id) => json!(self.registry.list_user_tokens(user_id)?),
        })
    }

    fn handle_list_tools(&self, id: Option<Value>) -> McpResponse {
        let tools: Vec<Value> = FacadeTool::iter()
            .map(|tool| {
                json!({
                    "name": tool.as_ref(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect();
        McpResponse::success(id, json!({ "tools": tools }))
    }

    async fn handle_call_tool(
        &self,
        id: Option<Value>,
        params: Value,
        bearer: Option<&str>,
    ) -> McpResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::error(id, INVALID_PARAMS, "Missing tool name");
        };
        let Ok(tool) = name.parse::<FacadeTool>() else {
            return McpResponse::error(id, INVALID_PARAMS, format!("Unknown tool: {}", name));
        };
        let args = match params.get("arguments") {
            Some(Value::Null) | None => json!({}),
            Some(args) => args.clone(),
        };

        match self.run_tool(tool, args, bearer).await {
            Ok(value) => McpResponse::success(id, tool_result(value, false)),
            Err(ToolFailure::InvalidArguments(msg)) => McpResponse::error(id, INVALID_PARAMS, msg),
            Err(ToolFailure::Operation(e)) => {
                log::warn!("MCP tool {} failed: {}", tool.as_ref(), e);
                let mut payload = json!({
                    "error": e.to_string(),
                    "kind": e.kind(),
                });
                if let Some(tool_call_id) = e.tool_call_id() {
                    payload["tool_call_id"] = json!(tool_call_id);
                }
                McpResponse::success(id, tool_result(payload, true))
            }
        }
    }

    async fn run_tool(
        &self,
        tool: FacadeTool,
        args: Value,
        bearer: Option<&str>,
    ) -> std::result::Result<Value, ToolFailure> {
        let value = match tool {
            FacadeTool::AgentRegister => {
                json!(self.registry.register_agent(arguments(args)?)?)
            }
            FacadeTool::TokenCreate => json!(self.registry.create_token(arguments(args)?)?),
            FacadeTool::AgentCallTool => {
                let req: CallToolRequest = arguments(args)?;
                match bearer {
                    Some(token) => {
                        self.registry
                            .authorize_call(token, &req.agent_id, &req.caller_user_id)?;
                    }
                    None if self.require_tokens => {
                        return Err(RegistryError::Unauthorized(
                            "a bearer token is required to call agent tools".to_string(),
                        )
                        .into());
                    }
                    None => {}
                }
                json!(self.dispatcher.call_tool(req).await?)
            }
            FacadeTool::PaymentCreate => {
                json!(self.payments.create_payment(arguments(args)?).await?)
            }
            FacadeTool::ToolCallPoll => {
                let req: ToolCallIdRequest = arguments(args)?;
                json!(self.dispatcher.poll_tool_call(&req.tool_call_id)?)
            }
            FacadeTool::ToolCallFinalize => {
                json!(self.dispatcher.finalize_tool_call(arguments(args)?)?)
            }
        };
        Ok(value)
    }
}

fn tool_result(value: Value, is_error: bool) -> Value {
    json!({
        "content": [
            {
                "type": "text",
                "text": value.to_string()
            }
        ],
        "structuredContent": value,
        "isError": is_error,
    })
}
