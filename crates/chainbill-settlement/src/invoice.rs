use chainbill_core::{BillingError, BillingResult, Invoice, LedgerStore, Payment};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::executor::SettlementExecutor;

/// `INV-<settlement date>-<payment prefix>`, unique per payment.
pub fn invoice_number(payment: &Payment) -> String {
    let simple = payment.id.simple().to_string().to_uppercase();
    format!("INV-{}-{}", payment.settled_at.format("%Y%m%d"), &simple[..10])
}

pub fn invoice_for(payment: &Payment, issued_at: DateTime<Utc>) -> Invoice {
    Invoice {
        id: Uuid::new_v4(),
        number: invoice_number(payment),
        workspace_id: payment.workspace_id,
        customer_id: payment.customer_id,
        subscription_id: payment.subscription_id,
        payment_id: payment.id,
        purpose: payment.purpose,
        period_start: payment.period_start,
        period_end: payment.period_end,
        subtotal: payment.subtotal,
        discount: payment.discount,
        tax: payment.tax,
        total: payment.amount,
        currency: payment.currency.clone(),
        tax_breakdown: payment.tax_breakdown.clone(),
        issued_at,
    }
}

impl SettlementExecutor {
    /// Second phase of a settlement: creates the payment's invoice and links it. Safe to repeat.
    pub async fn issue_invoice(
        &self,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        if let Some(existing) = self.store.invoice_for_payment(payment.id).await? {
            if payment.invoice_id != Some(existing.id) {
                self.store.link_invoice(payment.id, existing.id).await?;
            }
            return Ok(existing);
        }

        let invoice = invoice_for(payment, now);
        if !self.store.insert_invoice(&invoice).await? {
            if let Some(existing) = self.store.invoice_for_payment(payment.id).await? {
                self.store.link_invoice(payment.id, existing.id).await?;
                return Ok(existing);
            }
            return Err(BillingError::Conflict(format!(
                "an invoice already covers the period of payment {}",
                payment.id
            )));
        }
        self.store.link_invoice(payment.id, invoice.id).await?;

        info!(
            "issued invoice {} for payment {} ({} {})",
            invoice.number, payment.id, invoice.total, invoice.currency
        );
        Ok(invoice)
    }
}
