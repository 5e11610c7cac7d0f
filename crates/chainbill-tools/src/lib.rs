//! Narrow interfaces to the services the billing core consumes but does not own.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use chainbill_core::Delegation;

/// Signed authorization forwarded verbatim to the execution service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegationProof {
    pub delegation_id: Uuid,
    pub signature: String,
}

impl From<&Delegation> for DelegationProof {
    fn from(delegation: &Delegation) -> Self {
        Self {
            delegation_id: delegation.id,
            signature: delegation.proof.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPayload {
    /// Stable per logical redemption; services that support it deduplicate on this key.
    pub idempotency_key: String,
    pub network_id: String,
    pub token_address: String,
    pub from_wallet: String,
    pub amount: Decimal,
    pub currency: String,
    pub memo: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("execution service unavailable: {0}")]
    Unavailable(String),

    /// Insufficient balance, expired or revoked delegation, and similar.
    #[error("execution rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Submits one delegated transfer and returns its transaction reference.
    async fn submit(
        &self,
        proof: &DelegationProof,
        payload: &ExecutionPayload,
    ) -> Result<String, ExecutionError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    InApp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub channel: NotificationChannel,
    pub template: String,
    pub recipient: String,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChargeContext {
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub product_id: Uuid,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxResult {
    pub tax_amount: Decimal,
    pub breakdown: serde_json::Value,
}

impl TaxResult {
    pub fn zero() -> Self {
        Self {
            tax_amount: Decimal::ZERO,
            breakdown: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait TaxCalculator: Send + Sync {
    async fn compute(&self, amount: Decimal, context: &ChargeContext) -> anyhow::Result<TaxResult>;
}

#[async_trait]
pub trait DiscountCalculator: Send + Sync {
    async fn compute(&self, amount: Decimal, context: &ChargeContext) -> anyhow::Result<Decimal>;
}

#[derive(Debug, Clone, Default)]
pub struct NoTax;

#[async_trait]
impl TaxCalculator for NoTax {
    async fn compute(
        &self,
        _amount: Decimal,
        _context: &ChargeContext,
    ) -> anyhow::Result<TaxResult> {
        Ok(TaxResult::zero())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoDiscount;

#[async_trait]
impl DiscountCalculator for NoDiscount {
    async fn compute(&self, _amount: Decimal, _context: &ChargeContext) -> anyhow::Result<Decimal> {
        Ok(Decimal::ZERO)
    }
}
