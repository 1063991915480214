// core/blockchain-monitor/src/callback.rs
// Notification hooks invoked after a transaction has been stored

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use coinwatch_common::{TenantId, TransactionRecord, TxStatus};

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Webhook request failed: {0}")]
    Request(String),
    #[error("Webhook returned HTTP {0}")]
    Status(u16),
    #[error("{0}")]
    Other(String),
}

/// Payload handed to callbacks; amount is in satoshis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionNotification {
    pub tenant: TenantId,
    pub coin: String,
    pub txid: String,
    pub address: String,
    pub amount: u64,
    pub confirmations: u32,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
}

impl From<&TransactionRecord> for TransactionNotification {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            tenant: record.tenant_id,
            coin: record.coin.clone(),
            txid: record.txid.clone(),
            address: record.address.clone(),
            amount: record.amount_satoshis,
            confirmations: record.confirmations,
            status: record.status,
            timestamp: record.timestamp,
        }
    }
}

#[async_trait]
pub trait TransactionCallback: Send + Sync {
    async fn on_transaction(
        &self,
        notification: &TransactionNotification,
    ) -> Result<(), CallbackError>;
}

/// Wraps a synchronous closure.
pub struct FnCallback<F> {
    f: F,
}

impl<F> FnCallback<F>
where
    F: Fn(&TransactionNotification) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TransactionCallback for FnCallback<F>
where
    F: Fn(&TransactionNotification) + Send + Sync,
{
    async fn on_transaction(
        &self,
        notification: &TransactionNotification,
    ) -> Result<(), CallbackError> {
        (self.f)(notification);
        Ok(())
    }
}

/// Wraps a closure returning a future.
pub struct AsyncFnCallback<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnCallback<F, Fut>
where
    F: Fn(TransactionNotification) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> TransactionCallback for AsyncFnCallback<F, Fut>
where
    F: Fn(TransactionNotification) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send,
{
    async fn on_transaction(
        &self,
        notification: &TransactionNotification,
    ) -> Result<(), CallbackError> {
        (self.f)(notification.clone()).await
    }
}

/// POSTs each notification as JSON.
pub struct WebhookCallback {
    url: String,
    client: reqwest::Client,
}

impl WebhookCallback {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallbackError::Request(e.to_string()))?;
        Ok(Self::new(url, client))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransactionCallback for WebhookCallback {
    async fn on_transaction(
        &self,
        notification: &TransactionNotification,
    ) -> Result<(), CallbackError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| CallbackError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::Status(status.as_u16()));
        }

        debug!(txid = %notification.txid, url = %self.url, "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn notification() -> TransactionNotification {
        let record = TransactionRecord::observed(
            TenantId(7),
            "LTC",
            "ab12",
            "LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3",
            60_000_000,
            1,
            Utc::now(),
        );
        TransactionNotification::from(&record)
    }

    #[test]
    fn test_payload_shape() {
        let value = serde_json::to_value(notification()).unwrap();
        assert_eq!(value["tenant"], 7);
        assert_eq!(value["coin"], "LTC");
        assert_eq!(value["amount"], 60_000_000);
        assert_eq!(value["status"], "confirming");
        assert!(value.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_fn_callback_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback = FnCallback::new(move |n: &TransactionNotification| {
            assert_eq!(n.txid, "ab12");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        callback.on_transaction(&notification()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_callback_error_propagates() {
        let callback = AsyncFnCallback::new(|_n: TransactionNotification| async {
            Err(CallbackError::Other("downstream rejected".to_string()))
        });

        let err = callback.on_transaction(&notification()).await.unwrap_err();
        assert_eq!(err.to_string(), "downstream rejected");
    }

    #[tokio::test]
    async fn test_webhook_posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks/tx")
            .match_body(Matcher::PartialJson(json!({
                "txid": "ab12",
                "coin": "LTC",
                "confirmations": 1
            })))
            .with_status(200)
            .create_async()
            .await;

        let callback = WebhookCallback::new(
            format!("{}/hooks/tx", server.url()),
            reqwest::Client::new(),
        );
        callback.on_transaction(&notification()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hooks/tx")
            .with_status(503)
            .create_async()
            .await;

        let callback =
            WebhookCallback::with_timeout(format!("{}/hooks/tx", server.url()), Duration::from_secs(5))
                .unwrap();
        match callback.on_transaction(&notification()).await {
            Err(CallbackError::Status(503)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
