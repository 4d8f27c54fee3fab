//! Payments for tool calls, delegated to an external payment provider.

use crate::db::Db;
use crate::error::{RegistryError, Result};
use agent_registry_types::*;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const COINBASE_COMMERCE_API: &str = "https://api.commerce.coinbase.com";
const COINBASE_API_VERSION: &str = "2018-03-22";

/// What a provider hands back for a newly created payment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPayment {
    pub id: String,
    pub status: String,
    pub checkout_url: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_payment(&self, amount: f64, currency: &str) -> std::result::Result<ProviderPayment, String>;
}

/// Stand-in used when no provider API key is configured.
pub struct SimulatedProvider;

#[async_trait]
impl PaymentProvider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn create_payment(&self, _amount: f64, _currency: &str) -> std::result::Result<ProviderPayment, String> {
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("checkout_{}", &simple[..8]);
        Ok(ProviderPayment {
            checkout_url: Some(format!("https://commerce.coinbase.com/checkout/{}", id)),
            id,
            status: "pending".to_string(),
        })
    }
}

/// Coinbase Commerce charges API.
pub struct CoinbaseCommerceProvider {
    api_key: String,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl CoinbaseCommerceProvider {
    pub fn new(api_key: &str, timeout: Duration) -> reqwest::Result<Self> {
        Self::with_base_url(api_key, COINBASE_COMMERCE_API, timeout)
    }

    pub fn with_base_url(api_key: &str, base_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    fn request_error(&self, action: &str, e: reqwest::Error) -> String {
        if e.is_timeout() {
            format!(
                "Payment provider timed out after {}ms",
                self.timeout.as_millis()
            )
        } else {
            format!("Failed to {}: {}", action, e)
        }
    }
}

#[async_trait]
impl PaymentProvider for CoinbaseCommerceProvider {
    fn name(&self) -> &str {
        "coinbase-commerce"
    }

    async fn create_payment(&self, amount: f64, currency: &str) -> std::result::Result<ProviderPayment, String> {
        let body = json!({
            "name": "Agent tool call",
            "description": "Payment for an agent tool invocation",
            "pricing_type": "fixed_price",
            "local_price": {
                "amount": format!("{:.2}", amount),
                "currency": currency,
            }
        });

        let resp = self
            .client
            .post(format!("{}/charges", self.base_url))
            .header("X-CC-Api-Key", &self.api_key)
            .header("X-CC-Version", COINBASE_API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error("reach payment provider", e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| self.request_error("read payment provider response", e))?;
        if !status.is_success() {
            return Err(format!("Payment provider returned HTTP {}: {}", status, text));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| format!("Invalid payment provider response: {}", e))?;
        let data = &json["data"];
        let id = data["code"]
            .as_str()
            .or_else(|| data["id"].as_str())
            .ok_or_else(|| "Payment provider response has no charge code".to_string())?;

        Ok(ProviderPayment {
            id: id.to_string(),
            status: "pending".to_string(),
            checkout_url: data["hosted_url"].as_str().map(str::to_string),
        })
    }
}

pub struct PaymentService {
    db: Arc<Db>,
    provider: Arc<dyn PaymentProvider>,
    webhook_secret: Option<String>,
}

impl PaymentService {
    pub fn new(db: Arc<Db>, provider: Arc<dyn PaymentProvider>, webhook_secret: Option<String>) -> Self {
        Self {
            db,
            provider,
            webhook_secret,
        }
    }

    pub async fn create_payment(&self, req: CreatePaymentRequest) -> Result<Payment> {
        if !req.amount.is_finite() || req.amount <= 0.0 {
            return Err(RegistryError::validation("amount must be greater than 0"));
        }
        let currency = normalize_currency(&req.currency)?;
        if self.db.get_tool_call(&req.tool_call_id)?.is_none() {
            return Err(RegistryError::NotFound("Tool call"));
        }

        let quote = self
            .provider
            .create_payment(req.amount, &currency)
            .await
            .map_err(|e| {
                log::warn!("{} payment creation failed: {}", self.provider.name(), e);
                RegistryError::PaymentProvider(e)
            })?;

        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            tool_call_id: req.tool_call_id,
            amount: req.amount,
            currency,
            provider_payment_id: Some(quote.id),
            checkout_url: quote.checkout_url,
            status: quote.status,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.db.insert_payment(&payment)?;
        log::info!(
            "Created payment {} for tool call {} ({} {})",
            payment.id,
            payment.tool_call_id,
            payment.amount,
            payment.currency
        );
        Ok(payment)
    }

    /// Persisted status only; the provider is not re-queried.
    pub fn get_payment_status(&self, identifier: &str) -> Result<Payment> {
        self.db
            .find_payment(identifier)?
            .ok_or(RegistryError::NotFound("Payment"))
    }

    /// Checks the hex HMAC-SHA256 of a provider webhook body. A no-op when no
    /// webhook secret is configured.
    pub fn verify_webhook_signature(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(secret) = &self.webhook_secret else {
            return Ok(());
        };
        let signature = signature
            .ok_or_else(|| RegistryError::Unauthorized("missing webhook signature".to_string()))?;
        let expected = hex::decode(signature.trim())
            .map_err(|_| RegistryError::Unauthorized("malformed webhook signature".to_string()))?;

        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| RegistryError::Unauthorized("invalid webhook signature".to_string()))
    }

    pub fn apply_provider_event(&self, event: PaymentEvent) -> Result<Payment> {
        let (Some(checkout_id), Some(status)) = (event.checkout_id, event.status) else {
            return Err(RegistryError::validation("Invalid webhook data"));
        };
        let payment = self
            .db
            .apply_payment_event(&checkout_id, &status, Utc::now())?
            .ok_or(RegistryError::NotFound("Payment"))?;
        log::info!("Payment {} is now {}", payment.id, payment.status);
        Ok(payment)
    }
}

fn normalize_currency(currency: &str) -> Result<String> {
    let currency = currency.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RegistryError::validation(
            "currency must be a three-letter code",
        ));
    }
    Ok(currency.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{sample_agent, sample_call};

    struct FailingProvider;

    #[async_trait]
    impl PaymentProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn create_payment(&self, _amount: f64, _currency: &str) -> std::result::Result<ProviderPayment, String> {
            Err("provider unavailable".to_string())
        }
    }

    fn service_with(provider: Arc<dyn PaymentProvider>, secret: Option<&str>) -> (PaymentService, Arc<Db>) {
        let db = Arc::new(Db::open(":memory:").unwrap());
        db.insert_agent(&sample_agent("a1", "owner")).unwrap();
        db.insert_tool_call(&sample_call("c1", "a1")).unwrap();
        (
            PaymentService::new(db.clone(), provider, secret.map(str::to_string)),
            db,
        )
    }

    fn request(tool_call_id: &str) -> CreatePaymentRequest {
        CreatePaymentRequest {
            tool_call_id: tool_call_id.to_string(),
            amount: 0.05,
            currency: "usd".to_string(),
        }
    }

    #[tokio::test]
    async fn test_payment_for_missing_tool_call() {
        let (service, db) = service_with(Arc::new(SimulatedProvider), None);
        let err = service.create_payment(request("ghost")).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound("Tool call")));
        assert_eq!(db.get_stats().unwrap().total_payments, 0);
    }

    #[tokio::test]
    async fn test_provider_failure_creates_nothing() {
        let (service, db) = service_with(Arc::new(FailingProvider), None);
        let err = service.create_payment(request("c1")).await.unwrap_err();
        match err {
            RegistryError::PaymentProvider(msg) => assert_eq!(msg, "provider unavailable"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(db.get_stats().unwrap().total_payments, 0);
    }

    #[tokio::test]
    async fn test_simulated_payment_lifecycle() {
        let (service, db) = service_with(Arc::new(SimulatedProvider), None);
        let payment = service.create_payment(request("c1")).await.unwrap();
        assert_eq!(payment.currency, "USD");
        assert_eq!(payment.status, "pending");
        let checkout_id = payment.provider_payment_id.clone().unwrap();
        assert!(checkout_id.starts_with("checkout_"));
        assert_eq!(checkout_id.len(), "checkout_".len() + 8);

        assert_eq!(service.get_payment_status("c1").unwrap().id, payment.id);
        assert_eq!(service.get_payment_status(&checkout_id).unwrap().id, payment.id);
        assert!(matches!(
            service.get_payment_status("nothing"),
            Err(RegistryError::NotFound("Payment"))
        ));

        let completed = service
            .apply_provider_event(PaymentEvent {
                checkout_id: Some(checkout_id),
                status: Some("completed".to_string()),
            })
            .unwrap();
        assert_eq!(completed.status, "completed");
        assert_eq!(
            db.get_tool_call("c1").unwrap().unwrap().payment_status,
            PaymentState::Paid
        );
    }

    #[tokio::test]
    async fn test_payment_validation() {
        let (service, _) = service_with(Arc::new(SimulatedProvider), None);

        let mut req = request("c1");
        req.amount = 0.0;
        assert!(matches!(
            service.create_payment(req).await,
            Err(RegistryError::Validation(_))
        ));

        let mut req = request("c1");
        req.currency = "dollars".to_string();
        assert!(matches!(
            service.create_payment(req).await,
            Err(RegistryError::Validation(_))
        ));

        assert!(matches!(
            service.apply_provider_event(PaymentEvent::default()),
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            service.apply_provider_event(PaymentEvent {
                checkout_id: Some("checkout_missing".to_string()),
                status: Some("completed".to_string()),
            }),
            Err(RegistryError::NotFound("Payment"))
        ));
    }

    #[test]
    fn test_webhook_signature() {
        let (open, _) = service_with(Arc::new(SimulatedProvider), None);
        assert!(open.verify_webhook_signature(b"{}", None).is_ok());

        let (service, _) = service_with(Arc::new(SimulatedProvider), Some("whsec"));
        let body = br#"{"checkout_id":"checkout_1","status":"completed"}"#;
        let mut mac = HmacSha256::new_from_slice(b"whsec").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(service.verify_webhook_signature(body, Some(&signature)).is_ok());
        assert!(service.verify_webhook_signature(body, None).is_err());
        assert!(service.verify_webhook_signature(b"{}", Some(&signature)).is_err());
        assert!(service.verify_webhook_signature(body, Some("zz")).is_err());
    }

    #[tokio::test]
    async fn test_coinbase_provider_parses_charge() {
        use axum::Json;
        use axum::http::HeaderMap;
        use axum::routing::post;

        let router = axum::Router::new().route(
            "/charges",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-cc-api-key"], "key-123");
                assert_eq!(body["local_price"]["amount"], "1.50");
                Json(json!({"data": {"code": "ABCD1234", "hosted_url": "https://pay.example/ABCD1234"}}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let provider = CoinbaseCommerceProvider::with_base_url(
            "key-123",
            &format!("http://{}", addr),
            Duration::from_secs(5),
        )
        .unwrap();
        let charge = provider.create_payment(1.5, "USD").await.unwrap();
        assert_eq!(charge.id, "ABCD1234");
        assert_eq!(charge.checkout_url.as_deref(), Some("https://pay.example/ABCD1234"));
    }

    #[tokio::test]
    async fn test_coinbase_provider_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let provider = CoinbaseCommerceProvider::with_base_url(
            "key-123",
            &format!("http://{}", addr),
            Duration::from_millis(200),
        )
        .unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            provider.create_payment(1.0, "USD"),
        )
        .await
        .expect("provider call should be bounded by its own timeout");
        assert_eq!(
            outcome.unwrap_err(),
            "Payment provider timed out after 200ms"
        );
    }
}
