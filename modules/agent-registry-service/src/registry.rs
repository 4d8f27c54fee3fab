//! Agent registration, access tokens and tool-call reads.

use crate::db::Db;
use crate::error::{RegistryError, Result};
use crate::tokens::TokenSigner;
use agent_registry_types::*;
use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_TOKEN_DAYS: i64 = 30;
const MAX_TOKEN_DAYS: i64 = 3650;
const DEFAULT_PER_PAGE: u32 = 10;
const MAX_PER_PAGE: u32 = 100;

pub struct Registry {
    db: Arc<Db>,
    signer: TokenSigner,
}

/// Registration payload after validation.
struct AgentFields {
    user_id: String,
    name: String,
    description: Option<String>,
    webhook_url: String,
    tool_schema: Map<String, Value>,
    pricing: f64,
}

impl Registry {
    pub fn new(db: Arc<Db>, signer: TokenSigner) -> Self {
        Self { db, signer }
    }

    pub fn register_agent(&self, req: RegisterAgentRequest) -> Result<Agent> {
        let fields = validate_agent(req)?;
        let now = Utc::now();
        let agent = Agent {
            id: Uuid::new_v4().to_string(),
            user_id: fields.user_id,
            name: fields.name,
            description: fields.description,
            webhook_url: fields.webhook_url,
            tool_schema: fields.tool_schema,
            pricing: fields.pricing,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_agent(&agent)?;
        log::info!(
            "Registered agent {} ({}) with {} tool(s)",
            agent.id,
            agent.name,
            agent.tool_schema.len()
        );
        Ok(agent)
    }

    pub fn list_agents(&self, query: &ListAgentsQuery) -> Result<AgentList> {
        let owner = query.user_id.as_deref().filter(|o| !o.trim().is_empty());
        let total = self.db.count_agents(owner)?;

        if query.page.is_none() && query.per_page.is_none() {
            let agents = self.db.list_agents(owner, None, 0)?;
            return Ok(AgentList {
                agents,
                total,
                page: None,
                per_page: None,
            });
        }

        let page = query.page.unwrap_or(1);
        let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE);
        if page < 1 {
            return Err(RegistryError::validation("page must be at least 1"));
        }
        if !(1..=MAX_PER_PAGE).contains(&per_page) {
            return Err(RegistryError::validation(format!(
                "per_page must be between 1 and {}",
                MAX_PER_PAGE
            )));
        }
        let offset = (page - 1).saturating_mul(per_page);
        let agents = self.db.list_agents(owner, Some(per_page), offset)?;
        Ok(AgentList {
            agents,
            total,
            page: Some(page),
            per_page: Some(per_page),
        })
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        self.db
            .get_agent(agent_id)?
            .ok_or(RegistryError::NotFound("Agent"))
    }

    pub fn update_agent(&self, agent_id: &str, req: RegisterAgentRequest) -> Result<Agent> {
        let existing = self.get_agent(agent_id)?;
        let fields = validate_agent(req)?;
        let agent = Agent {
            user_id: fields.user_id,
            name: fields.name,
            description: fields.description,
            webhook_url: fields.webhook_url,
            tool_schema: fields.tool_schema,
            pricing: fields.pricing,
            updated_at: Utc::now(),
            ..existing
        };
        if !self.db.update_agent(&agent)? {
            return Err(RegistryError::NotFound("Agent"));
        }
        log::info!("Updated agent {}", agent.id);
        Ok(agent)
    }

    pub fn deactivate_agent(&self, agent_id: &str) -> Result<()> {
        if !self.db.deactivate_agent(agent_id, Utc::now())? {
            return Err(RegistryError::NotFound("Agent"));
        }
        log::info!("Deactivated agent {}", agent_id);
        Ok(())
    }

    pub fn create_token(&self, req: CreateTokenRequest) -> Result<Token> {
        let user_id = req.user_id.trim();
        if user_id.is_empty() {
            return Err(RegistryError::validation("user_id is required"));
        }
        let days = req.expires_in_days.unwrap_or(DEFAULT_TOKEN_DAYS);
        if !(1..=MAX_TOKEN_DAYS).contains(&days) {
            return Err(RegistryError::validation(format!(
                "expires_in_days must be between 1 and {}",
                MAX_TOKEN_DAYS
            )));
        }
        let agent = self.get_agent(&req.agent_id)?;

        let now = Utc::now();
        let expires_at = now + Duration::days(days);
        let id = Uuid::new_v4().to_string();
        let token = Token {
            token: self.signer.sign(&id, &agent.id, user_id, expires_at)?,
            id,
            agent_id: agent.id,
            user_id: user_id.to_string(),
            is_active: true,
            expires_at,
            created_at: now,
        };
        self.db.insert_token(&token)?;
        log::info!(
            "Issued token {} for agent {} to user {} (expires {})",
            token.id,
            token.agent_id,
            token.user_id,
            token.expires_at
        );
        Ok(token)
    }

    /// Resolves a presented token value to its live row.
    pub fn verify_token(&self, value: &str) -> Result<Token> {
        let claims = self.signer.verify(value)?;
        let token = self
            .db
            .get_token_by_value(value)?
            .ok_or_else(|| RegistryError::Unauthorized("unknown token".to_string()))?;

        if token.id != claims.token_id || token.agent_id != claims.agent_id {
            return Err(RegistryError::Unauthorized("token does not match its record".to_string()));
        }
        if !token.is_active {
            return Err(RegistryError::Unauthorized("token has been revoked".to_string()));
        }
        if token.is_expired_at(Utc::now()) {
            return Err(RegistryError::Unauthorized("token has expired".to_string()));
        }
        Ok(token)
    }

    /// A token only grants calls to the agent and on behalf of the user it names.
    pub fn authorize_call(&self, value: &str, agent_id: &str, caller_user_id: &str) -> Result<Token> {
        let token = self.verify_token(value)?;
        if token.agent_id != agent_id {
            return Err(RegistryError::Unauthorized(
                "token was not issued for this agent".to_string(),
            ));
        }
        if token.user_id != caller_user_id {
            return Err(RegistryError::Unauthorized(
                "token was issued to a different user".to_string(),
            ));
        }
        Ok(token)
    }

    pub fn list_user_tokens(&self, user_id: &str) -> Result<UserTokens> {
        let tokens: Vec<TokenSummary> = self
            .db
            .list_active_tokens_for_user(user_id)?
            .iter()
            .map(Token::masked)
            .collect();
        Ok(UserTokens {
            user_id: user_id.to_string(),
            total: tokens.len(),
            tokens,
        })
    }

    pub fn get_tool_call_status(&self, tool_call_id: &str) -> Result<ToolCall> {
        self.db
            .get_tool_call(tool_call_id)?
            .ok_or(RegistryError::NotFound("Tool call"))
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        self.db.get_stats()
    }
}

fn validate_agent(req: RegisterAgentRequest) -> Result<AgentFields> {
    let mut missing = Vec::new();
    if req.user_id.trim().is_empty() {
        missing.push("user_id");
    }
    if req.name.trim().is_empty() {
        missing.push("name");
    }
    if req.webhook_url.trim().is_empty() {
        missing.push("webhook_url");
    }
    if req.tool_schema.is_null() {
        missing.push("tool_schema");
    }
    if !missing.is_empty() {
        return Err(RegistryError::validation(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }

    let webhook_url = req.webhook_url.trim().to_string();
    match url::Url::parse(&webhook_url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.has_host() => {}
        _ => {
            return Err(RegistryError::validation(
                "webhook_url must be an absolute http(s) URL",
            ));
        }
    }

    let tool_schema = normalize_tool_schema(req.tool_schema)?;

    if !req.pricing.is_finite() || req.pricing < 0.0 {
        return Err(RegistryError::validation("pricing must be a non-negative number"));
    }

    Ok(AgentFields {
        user_id: req.user_id.trim().to_string(),
        name: req.name.trim().to_string(),
        description: req
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        webhook_url,
        tool_schema,
        pricing: req.pricing,
    })
}

/// Accepts either `{tool: schema, ...}` or the wrapped `{"tools": {tool: schema, ...}}`.
fn normalize_tool_schema(schema: Value) -> Result<Map<String, Value>> {
    let Value::Object(mut map) = schema else {
        return Err(RegistryError::validation(
            "tool_schema must be a JSON object mapping tool names to parameter schemas",
        ));
    };
    if map.len() == 1 && map.get("tools").is_some_and(Value::is_object) {
        if let Some(Value::Object(inner)) = map.remove("tools") {
            map = inner;
        }
    }
    if map.is_empty() {
        return Err(RegistryError::validation(
            "tool_schema must declare at least one tool",
        ));
    }
    Ok(map)
}
