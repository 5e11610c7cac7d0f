use anyhow::Context;
use chainbill_core::LedgerStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::executor::SettlementExecutor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub receipts_completed: usize,
    pub receipts_failed: usize,
    pub invoices_issued: usize,
    pub invoices_failed: usize,
}

impl SettlementExecutor {
    /// Finishes bookkeeping for confirmed transfers left incomplete and invoices payments that
    /// settled without one.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let receipts = self
            .store
            .incomplete_receipts(self.batch_size)
            .await
            .context("failed to load incomplete settlement receipts")?;
        for receipt in receipts {
            let key = receipt.idempotency_key.clone();
            let context = receipt.context.clone();
            match self.complete_bookkeeping(receipt, now).await {
                Ok(_) => report.receipts_completed += 1,
                Err(err) => {
                    self.record_failure(key, context, err, now).await;
                    report.receipts_failed += 1;
                }
            }
        }

        let payments = self
            .store
            .uninvoiced_payments(self.batch_size)
            .await
            .context("failed to load uninvoiced payments")?;
        for payment in payments {
            match self.issue_invoice(&payment, now).await {
                Ok(_) => report.invoices_issued += 1,
                Err(err) => {
                    error!("failed to invoice payment {}: {err:#}", payment.id);
                    report.invoices_failed += 1;
                }
            }
        }

        info!(
            "reconciliation finished: {} receipts completed, {} still failing, {} invoices issued, {} invoice failures",
            report.receipts_completed,
            report.receipts_failed,
            report.invoices_issued,
            report.invoices_failed
        );
        Ok(report)
    }
}
