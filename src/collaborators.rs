//! Outbound collaborators: notifications, audit trail and payment gateway

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{Actor, ActorRole, BankDetails};

// ===== Notifications =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    User,
    Provider,
    Ambassador,
}

/// Push notification addressed to one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub account_id: Uuid,
    pub account_kind: AccountKind,
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// Fire-and-forget delivery. Callers log failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the `notifications` tracing target.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            target: "notifications",
            account_id = %notification.account_id,
            account_kind = ?notification.account_kind,
            title = %notification.title,
            body = %notification.body,
            "notification"
        );
        Ok(())
    }
}

/// POSTs notifications as JSON to a delivery webhook.
#[derive(Clone)]
pub struct HttpNotifier {
    http: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.http
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .context("notification webhook unreachable")?
            .error_for_status()
            .context("notification webhook rejected the message")?;
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(())
    }
}

// ===== Activity log =====

/// Append-only audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub actor_role: ActorRole,
    pub action: String,
    pub description: String,
    pub affected_entity: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        actor: Actor,
        action: impl Into<String>,
        affected_entity: impl Into<String>,
        description: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: actor.id,
            actor_role: actor.role,
            action: action.into(),
            description: description.into(),
            affected_entity: affected_entity.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, entry: &ActivityEntry) -> Result<()>;
}

/// Writes audit entries to the `activity` tracing target.
#[derive(Debug, Default, Clone)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn record(&self, entry: &ActivityEntry) -> Result<()> {
        tracing::info!(
            target: "activity",
            actor_id = %entry.actor_id,
            actor_role = entry.actor_role.as_str(),
            action = %entry.action,
            entity = %entry.affected_entity,
            details = %entry.details,
            "{}",
            entry.description
        );
        Ok(())
    }
}

/// Persists audit entries to the `activity_log` table.
#[derive(Clone)]
pub struct PgActivityLog {
    db_pool: PgPool,
}

impl PgActivityLog {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ActivityLog for PgActivityLog {
    async fn record(&self, entry: &ActivityEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (
                id, actor_id, actor_role, action, description, affected_entity, details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.actor_id)
        .bind(entry.actor_role)
        .bind(&entry.action)
        .bind(&entry.description)
        .bind(&entry.affected_entity)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.db_pool)
        .await
        .context("Failed to write activity log entry")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl RecordingActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl ActivityLog for RecordingActivityLog {
    async fn record(&self, entry: &ActivityEntry) -> Result<()> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
        Ok(())
    }
}

// ===== Payment gateway =====

/// Successful gateway call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReceipt {
    pub reference: String,
}

/// Card charges and outbound bank transfers.
///
/// `idempotency_key` is forwarded so a retried call is not executed twice.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        account_id: Uuid,
        amount: i64,
        idempotency_key: &str,
    ) -> LedgerResult<GatewayReceipt>;

    async fn transfer(
        &self,
        account_id: Uuid,
        amount: i64,
        bank_details: &BankDetails,
        idempotency_key: &str,
    ) -> LedgerResult<GatewayReceipt>;
}

/// REST payment gateway client
#[derive(Clone)]
pub struct HttpPaymentGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn post(&self, path: &str, idempotency_key: &str, body: Value) -> LedgerResult<GatewayReceipt> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LedgerError::GatewayFailure(format!("{path} unreachable: {err}")))?
            .error_for_status()
            .map_err(|err| LedgerError::GatewayFailure(format!("{path} rejected: {err}")))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|err| LedgerError::GatewayFailure(format!("{path} bad response: {err}")))?;

        payload
            .pointer("/reference")
            .or_else(|| payload.pointer("/id"))
            .and_then(|value| value.as_str())
            .map(|reference| GatewayReceipt {
                reference: reference.to_string(),
            })
            .ok_or_else(|| LedgerError::GatewayFailure(format!("{path} returned no reference")))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(
        &self,
        account_id: Uuid,
        amount: i64,
        idempotency_key: &str,
    ) -> LedgerResult<GatewayReceipt> {
        self.post(
            "/charges",
            idempotency_key,
            json!({ "account_id": account_id, "amount": amount }),
        )
        .await
    }

    async fn transfer(
        &self,
        account_id: Uuid,
        amount: i64,
        bank_details: &BankDetails,
        idempotency_key: &str,
    ) -> LedgerResult<GatewayReceipt> {
        self.post(
            "/transfers",
            idempotency_key,
            json!({
                "account_id": account_id,
                "amount": amount,
                "bank_details": bank_details,
            }),
        )
        .await
    }
}

/// Gateway that never leaves the process. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct SimulatedPaymentGateway {
    failing: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl SimulatedPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every call made so far, as `kind:idempotency_key`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn receipt(&self, kind: &str, idempotency_key: &str) -> LedgerResult<GatewayReceipt> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{kind}:{idempotency_key}"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::GatewayFailure(format!(
                "simulated {kind} declined"
            )));
        }
        Ok(GatewayReceipt {
            reference: format!("sim_{kind}_{idempotency_key}"),
        })
    }
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    async fn charge(
        &self,
        _account_id: Uuid,
        _amount: i64,
        idempotency_key: &str,
    ) -> LedgerResult<GatewayReceipt> {
        self.receipt("charge", idempotency_key)
    }

    async fn transfer(
        &self,
        _account_id: Uuid,
        _amount: i64,
        _bank_details: &BankDetails,
        idempotency_key: &str,
    ) -> LedgerResult<GatewayReceipt> {
        self.receipt("transfer", idempotency_key)
    }
}

// ===== Wiring =====

/// The outbound collaborators one service instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub activity: Arc<dyn ActivityLog>,
    pub notifier: Arc<dyn Notifier>,
    pub gateway: Arc<dyn PaymentGateway>,
}

impl Collaborators {
    pub fn new(
        activity: Arc<dyn ActivityLog>,
        notifier: Arc<dyn Notifier>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            activity,
            notifier,
            gateway,
        }
    }

    /// Tracing sinks and the simulated gateway.
    pub fn local() -> Self {
        Self::new(
            Arc::new(TracingActivityLog),
            Arc::new(TracingNotifier),
            Arc::new(SimulatedPaymentGateway::new()),
        )
    }

    /// Append to the audit trail. A sink failure is logged, never returned.
    pub async fn audit(&self, entry: ActivityEntry) {
        if let Err(err) = self.activity.record(&entry).await {
            tracing::warn!(
                action = %entry.action,
                entity = %entry.affected_entity,
                error = %err,
                "activity log write failed"
            );
        }
    }

    /// Deliver a notification. A delivery failure is logged, never returned.
    pub async fn notify(&self, notification: Notification) {
        if let Err(err) = self.notifier.notify(&notification).await {
            tracing::warn!(
                account_id = %notification.account_id,
                title = %notification.title,
                error = %err,
                "notification delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_gateway_toggles_failure() {
        let gateway = SimulatedPaymentGateway::new();
        let receipt = gateway.charge(Uuid::nil(), 100, "req-1").await.unwrap();
        assert_eq!(receipt.reference, "sim_charge_req-1");

        gateway.set_failing(true);
        let err = gateway.charge(Uuid::nil(), 100, "req-1").await.unwrap_err();
        assert!(matches!(err, LedgerError::GatewayFailure(_)));
    }

    #[tokio::test]
    async fn recording_sinks_keep_entries() {
        let log = RecordingActivityLog::new();
        log.record(&ActivityEntry::new(
            Actor::system(),
            "wallet_credit",
            "wallet:abc",
            "credited",
            json!({ "amount": 100 }),
        ))
        .await
        .unwrap();
        assert_eq!(log.actions(), vec!["wallet_credit".to_string()]);
    }
}
