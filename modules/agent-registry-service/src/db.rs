//! SQLite database operations for agents, tokens, tool calls and payments.

use crate::error::{RegistryError, Result};
use agent_registry_types::*;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row, params};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const AGENT_COLUMNS: &str = "id, user_id, name, description, webhook_url, tool_schema,
                             pricing, is_active, created_at, updated_at";

const TOKEN_COLUMNS: &str = "id, token, agent_id, user_id, is_active, expires_at, created_at";

const TOOL_CALL_COLUMNS: &str = "id, agent_id, caller_user_id, tool_name, parameters, status,
                                 result, cost, payment_status, created_at, completed_at";

const PAYMENT_COLUMNS: &str = "id, tool_call_id, amount, currency, provider_payment_id,
                               checkout_url, status, created_at, completed_at";

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                webhook_url TEXT NOT NULL,
                tool_schema TEXT NOT NULL,
                pricing REAL NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agents_owner ON agents(user_id);

            CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                agent_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (agent_id) REFERENCES agents(id)
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);

            CREATE TABLE IF NOT EXISTS tool_calls (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                caller_user_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                parameters TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                cost REAL NOT NULL DEFAULT 0,
                payment_status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                completed_at TEXT,
                FOREIGN KEY (agent_id) REFERENCES agents(id)
            );
            CREATE INDEX IF NOT EXISTS idx_tool_calls_agent ON tool_calls(agent_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                tool_call_id TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                provider_payment_id TEXT,
                checkout_url TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                completed_at TEXT,
                FOREIGN KEY (tool_call_id) REFERENCES tool_calls(id)
            );
            CREATE INDEX IF NOT EXISTS idx_payments_tool_call ON payments(tool_call_id);
            CREATE INDEX IF NOT EXISTS idx_payments_provider ON payments(provider_payment_id);",
        )
    }

    // =====================================================
    // Agents
    // =====================================================

    pub fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO agents (id, user_id, name, description, webhook_url, tool_schema,
                                 pricing, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                agent.id,
                agent.user_id,
                agent.name,
                agent.description,
                agent.webhook_url,
                Value::Object(agent.tool_schema.clone()),
                agent.pricing,
                agent.is_active,
                agent.created_at,
                agent.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Active agent by id. Deactivated agents read as absent.
    pub fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let conn = self.conn();
        let agent = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1 AND is_active = 1"),
                params![agent_id],
                row_to_agent,
            )
            .optional()?;
        Ok(agent)
    }

    /// Active agents, newest first. `limit = None` returns every row.
    pub fn list_agents(
        &self,
        owner: Option<&str>,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<Agent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents
             WHERE is_active = 1 AND (?1 IS NULL OR user_id = ?1)
             ORDER BY created_at DESC, id ASC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let limit: i64 = limit.map(i64::from).unwrap_or(-1);
        let agents = stmt
            .query_map(params![owner, limit, offset], row_to_agent)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(agents)
    }

    pub fn count_agents(&self, owner: Option<&str>) -> Result<i64> {
        let conn = self.conn();
        let total = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE is_active = 1 AND (?1 IS NULL OR user_id = ?1)",
            params![owner],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    /// Overwrites the mutable fields of an active agent. Returns false if absent.
    pub fn update_agent(&self, agent: &Agent) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE agents
             SET user_id = ?2,
                 name = ?3,
                 description = ?4,
                 webhook_url = ?5,
                 tool_schema = ?6,
                 pricing = ?7,
                 updated_at = ?8
             WHERE id = ?1 AND is_active = 1",
            params![
                agent.id,
                agent.user_id,
                agent.name,
                agent.description,
                agent.webhook_url,
                Value::Object(agent.tool_schema.clone()),
                agent.pricing,
                agent.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn deactivate_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE agents SET is_active = 0, updated_at = ?2 WHERE id = ?1 AND is_active = 1",
            params![agent_id, now],
        )?;
        Ok(changed > 0)
    }

    // =====================================================
    // Tokens
    // =====================================================

    pub fn insert_token(&self, token: &Token) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tokens (id, token, agent_id, user_id, is_active, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id,
                token.token,
                token.agent_id,
                token.user_id,
                token.is_active,
                token.expires_at,
                token.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_token_by_value(&self, value: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        let token = conn
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token = ?1"),
                params![value],
                row_to_token,
            )
            .optional()?;
        Ok(token)
    }

    pub fn list_active_tokens_for_user(&self, user_id: &str) -> Result<Vec<Token>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY created_at DESC"
        ))?;
        let tokens = stmt
            .query_map(params![user_id], row_to_token)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(tokens)
    }

    // =====================================================
    // Tool Calls
    // =====================================================

    pub fn insert_tool_call(&self, call: &ToolCall) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tool_calls (id, agent_id, caller_user_id, tool_name, parameters, status,
                                     result, cost, payment_status, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                call.id,
                call.agent_id,
                call.caller_user_id,
                call.tool_name,
                call.parameters,
                call.status.as_ref(),
                call.result,
                call.cost,
                call.payment_status.as_ref(),
                call.created_at,
                call.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_tool_call(&self, tool_call_id: &str) -> Result<Option<ToolCall>> {
        let conn = self.conn();
        let call = conn
            .query_row(
                &format!("SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE id = ?1"),
                params![tool_call_id],
                row_to_tool_call,
            )
            .optional()?;
        Ok(call)
    }

    /// Moves a pending call to a terminal status. Returns false when the call
    /// is absent or already left `pending`, so only the first writer wins.
    pub fn finish_tool_call(
        &self,
        tool_call_id: &str,
        status: ToolCallStatus,
        result: &Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tool_calls
             SET status = ?2, result = ?3, completed_at = ?4
             WHERE id = ?1 AND status = 'pending'",
            params![tool_call_id, status.as_ref(), result, completed_at],
        )?;
        Ok(changed > 0)
    }

    // =====================================================
    // Payments
    // =====================================================

    /// Inserts a payment if its tool call exists, in one transaction.
    pub fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM tool_calls WHERE id = ?1)",
            params![payment.tool_call_id],
            |r| r.get(0),
        )?;
        if !exists {
            return Err(RegistryError::NotFound("Tool call"));
        }
        tx.execute(
            "INSERT INTO payments (id, tool_call_id, amount, currency, provider_payment_id,
                                   checkout_url, status, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                payment.id,
                payment.tool_call_id,
                payment.amount,
                payment.currency,
                payment.provider_payment_id,
                payment.checkout_url,
                payment.status,
                payment.created_at,
                payment.completed_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Latest payment matching a payment id, tool call id or provider id.
    pub fn find_payment(&self, identifier: &str) -> Result<Option<Payment>> {
        let conn = self.conn();
        let payment = conn
            .query_row(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments
                     WHERE id = ?1 OR tool_call_id = ?1 OR provider_payment_id = ?1
                     ORDER BY created_at DESC
                     LIMIT 1"
                ),
                params![identifier],
                row_to_payment,
            )
            .optional()?;
        Ok(payment)
    }

    /// Records a provider status change. A `completed` status also stamps
    /// `completed_at` and marks the tool call paid, in the same transaction.
    pub fn apply_payment_event(
        &self,
        provider_payment_id: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let payment = tx
            .query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_payment_id = ?1"),
                params![provider_payment_id],
                row_to_payment,
            )
            .optional()?;
        let Some(mut payment) = payment else {
            return Ok(None);
        };

        payment.status = status.to_string();
        if status == "completed" {
            payment.completed_at = Some(now);
            tx.execute(
                "UPDATE tool_calls SET payment_status = ?2 WHERE id = ?1",
                params![payment.tool_call_id, PaymentState::Paid.as_ref()],
            )?;
        }
        tx.execute(
            "UPDATE payments SET status = ?2, completed_at = ?3 WHERE id = ?1",
            params![payment.id, payment.status, payment.completed_at],
        )?;
        tx.commit()?;
        Ok(Some(payment))
    }

    pub fn get_stats(&self) -> Result<RegistryStats> {
        let conn = self.conn();
        let count = |sql: &str| -> SqliteResult<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        Ok(RegistryStats {
            total_agents: count("SELECT COUNT(*) FROM agents WHERE is_active = 1")?,
            total_tool_calls: count("SELECT COUNT(*) FROM tool_calls")?,
            total_payments: count("SELECT COUNT(*) FROM payments")?,
        })
    }
}

fn parse_column<T>(row: &Row, idx: usize) -> SqliteResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_agent(row: &Row) -> SqliteResult<Agent> {
    let schema: Value = row.get(5)?;
    Ok(Agent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        webhook_url: row.get(4)?,
        tool_schema: match schema {
            Value::Object(map) => map,
            _ => Default::default(),
        },
        pricing: row.get(6)?,
        is_active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_token(row: &Row) -> SqliteResult<Token> {
    Ok(Token {
        id: row.get(0)?,
        token: row.get(1)?,
        agent_id: row.get(2)?,
        user_id: row.get(3)?,
        is_active: row.get(4)?,
        expires_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_tool_call(row: &Row) -> SqliteResult<ToolCall> {
    Ok(ToolCall {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        caller_user_id: row.get(2)?,
        tool_name: row.get(3)?,
        parameters: row.get(4)?,
        status: parse_column(row, 5)?,
        result: row.get(6)?,
        cost: row.get(7)?,
        payment_status: parse_column(row, 8)?,
        created_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

fn row_to_payment(row: &Row) -> SqliteResult<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        tool_call_id: row.get(1)?,
        amount: row.get(2)?,
        currency: row.get(3)?,
        provider_payment_id: row.get(4)?,
        checkout_url: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    pub(crate) fn sample_agent(id: &str, owner: &str) -> Agent {
        let now = Utc::now();
        Agent {
            id: id.to_string(),
            user_id: owner.to_string(),
            name: "Calculator Agent".to_string(),
            description: Some("adds numbers".to_string()),
            webhook_url: "http://127.0.0.1:8001/webhook".to_string(),
            tool_schema: json!({"add": {"a": "number", "b": "number"}})
                .as_object()
                .cloned()
                .unwrap(),
            pricing: 0.05,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn sample_call(id: &str, agent_id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            caller_user_id: "caller".to_string(),
            tool_name: "add".to_string(),
            parameters: json!({"a": 5, "b": 3}),
            status: ToolCallStatus::Pending,
            result: None,
            cost: 0.05,
            payment_status: PaymentState::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn sample_payment(id: &str, tool_call_id: &str, provider_id: &str) -> Payment {
        Payment {
            id: id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            amount: 1.25,
            currency: "USD".to_string(),
            provider_payment_id: Some(provider_id.to_string()),
            checkout_url: None,
            status: "pending".to_string(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_agent_roundtrip_and_soft_delete() {
        let db = Db::open(":memory:").unwrap();
        let agent = sample_agent("a1", "owner");
        db.insert_agent(&agent).unwrap();

        let fetched = db.get_agent("a1").unwrap().unwrap();
        assert_eq!(fetched.webhook_url, agent.webhook_url);
        assert_eq!(fetched.tool_schema, agent.tool_schema);
        assert_eq!(fetched.description.as_deref(), Some("adds numbers"));

        assert!(db.deactivate_agent("a1", Utc::now()).unwrap());
        assert!(db.get_agent("a1").unwrap().is_none());
        assert!(!db.deactivate_agent("a1", Utc::now()).unwrap());
        assert_eq!(db.count_agents(None).unwrap(), 0);
    }

    #[test]
    fn test_list_agents_filter_and_paging() {
        let db = Db::open(":memory:").unwrap();
        for i in 0..5 {
            let owner = if i % 2 == 0 { "even" } else { "odd" };
            db.insert_agent(&sample_agent(&format!("a{i}"), owner)).unwrap();
        }

        assert_eq!(db.list_agents(None, None, 0).unwrap().len(), 5);
        assert_eq!(db.list_agents(Some("even"), None, 0).unwrap().len(), 3);
        assert_eq!(db.count_agents(Some("odd")).unwrap(), 2);
        assert_eq!(db.list_agents(None, Some(2), 0).unwrap().len(), 2);
        assert_eq!(db.list_agents(None, Some(2), 4).unwrap().len(), 1);
    }

    #[test]
    fn test_tool_call_requires_agent() {
        let db = Db::open(":memory:").unwrap();
        let err = db.insert_tool_call(&sample_call("c1", "missing")).unwrap_err();
        assert!(matches!(err, RegistryError::Database(_)));
    }

    #[test]
    fn test_finish_tool_call_only_once() {
        let db = Db::open(":memory:").unwrap();
        db.insert_agent(&sample_agent("a1", "owner")).unwrap();
        db.insert_tool_call(&sample_call("c1", "a1")).unwrap();

        let first = db
            .finish_tool_call("c1", ToolCallStatus::Completed, &json!(8), Utc::now())
            .unwrap();
        let second = db
            .finish_tool_call("c1", ToolCallStatus::Failed, &json!({"error": "late"}), Utc::now())
            .unwrap();
        assert!(first);
        assert!(!second);

        let call = db.get_tool_call("c1").unwrap().unwrap();
        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.result, Some(json!(8)));
        assert!(call.completed_at.is_some());
    }

    #[test]
    fn test_payment_requires_tool_call() {
        let db = Db::open(":memory:").unwrap();
        let err = db
            .insert_payment(&sample_payment("p1", "missing", "checkout_1"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound("Tool call")));
        assert_eq!(db.get_stats().unwrap().total_payments, 0);
    }

    #[test]
    fn test_payment_lookup_and_completion() {
        let db = Db::open(":memory:").unwrap();
        db.insert_agent(&sample_agent("a1", "owner")).unwrap();
        db.insert_tool_call(&sample_call("c1", "a1")).unwrap();
        db.insert_payment(&sample_payment("p1", "c1", "checkout_1")).unwrap();

        for identifier in ["p1", "c1", "checkout_1"] {
            assert_eq!(db.find_payment(identifier).unwrap().unwrap().id, "p1");
        }
        assert!(db.find_payment("nope").unwrap().is_none());

        let updated = db
            .apply_payment_event("checkout_1", "completed", Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, "completed");
        assert!(updated.completed_at.is_some());

        let call = db.get_tool_call("c1").unwrap().unwrap();
        assert_eq!(call.payment_status, PaymentState::Paid);
        assert!(db.apply_payment_event("unknown", "completed", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_tokens_by_user() {
        let db = Db::open(":memory:").unwrap();
        db.insert_agent(&sample_agent("a1", "owner")).unwrap();
        let now = Utc::now();
        let token = Token {
            id: "t1".to_string(),
            token: "value-1".to_string(),
            agent_id: "a1".to_string(),
            user_id: "caller".to_string(),
            is_active: true,
            expires_at: now + Duration::days(30),
            created_at: now,
        };
        db.insert_token(&token).unwrap();

        let fetched = db.get_token_by_value("value-1").unwrap().unwrap();
        assert_eq!(fetched.agent_id, "a1");
        assert_eq!(db.list_active_tokens_for_user("caller").unwrap().len(), 1);
        assert!(db.list_active_tokens_for_user("other").unwrap().is_empty());
    }
}
