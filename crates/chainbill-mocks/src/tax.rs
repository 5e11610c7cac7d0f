use async_trait::async_trait;
use chainbill_tools::{ChargeContext, DiscountCalculator, TaxCalculator, TaxResult};
use rust_decimal::Decimal;
use serde_json::json;

/// Applies one rate to every charge.
#[derive(Debug, Clone)]
pub struct FlatRateTax {
    pub rate: Decimal,
}

#[async_trait]
impl TaxCalculator for FlatRateTax {
    async fn compute(
        &self,
        amount: Decimal,
        _context: &ChargeContext,
    ) -> anyhow::Result<TaxResult> {
        let tax_amount = (amount * self.rate).round_dp(6);
        Ok(TaxResult {
            tax_amount,
            breakdown: json!({ "flat": { "rate": self.rate, "amount": tax_amount } }),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FixedDiscount {
    pub amount: Decimal,
}

#[async_trait]
impl DiscountCalculator for FixedDiscount {
    async fn compute(&self, _amount: Decimal, _context: &ChargeContext) -> anyhow::Result<Decimal> {
        Ok(self.amount)
    }
}

/// Calculator whose backend is always down.
#[derive(Debug, Clone, Default)]
pub struct FailingCalculator;

#[async_trait]
impl TaxCalculator for FailingCalculator {
    async fn compute(
        &self,
        _amount: Decimal,
        _context: &ChargeContext,
    ) -> anyhow::Result<TaxResult> {
        anyhow::bail!("tax service unavailable")
    }
}

#[async_trait]
impl DiscountCalculator for FailingCalculator {
    async fn compute(&self, _amount: Decimal, _context: &ChargeContext) -> anyhow::Result<Decimal> {
        anyhow::bail!("discount service unavailable")
    }
}
