use chainbill_core::{BookkeepingStep, ChargeQuote, SettlementErrorKind, SettlementFailure};
use chainbill_tools::ExecutionError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SettlementError {
    #[error("invalid settlement: {0}")]
    Validation(String),

    #[error("execution service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("execution rejected: {0}")]
    Rejected(String),

    /// Funds moved but the ledger is incomplete. Never resubmitted; a retry resumes bookkeeping.
    #[error("bookkeeping failed after transaction {transaction_ref}: {message}")]
    Bookkeeping {
        transaction_ref: String,
        completed_steps: Vec<BookkeepingStep>,
        /// What the confirmed transfer charged; a resumed settlement books exactly this.
        quote: ChargeQuote,
        message: String,
    },
}

impl SettlementError {
    pub fn kind(&self) -> SettlementErrorKind {
        match self {
            SettlementError::Validation(_) => SettlementErrorKind::Validation,
            SettlementError::ServiceUnavailable(_) => SettlementErrorKind::ServiceUnavailable,
            SettlementError::Rejected(_) => SettlementErrorKind::Rejected,
            SettlementError::Bookkeeping { .. } => SettlementErrorKind::Bookkeeping,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The charge behind a confirmed transfer, present only for bookkeeping failures.
    pub fn settled_quote(&self) -> Option<&ChargeQuote> {
        match self {
            SettlementError::Bookkeeping { quote, .. } => Some(quote),
            _ => None,
        }
    }

    pub fn transaction_ref(&self) -> Option<&str> {
        match self {
            SettlementError::Bookkeeping {
                transaction_ref, ..
            } => Some(transaction_ref),
            _ => None,
        }
    }
}

impl From<ExecutionError> for SettlementError {
    fn from(error: ExecutionError) -> Self {
        match error {
            ExecutionError::Unavailable(message) => SettlementError::ServiceUnavailable(message),
            ExecutionError::Rejected(message) => SettlementError::Rejected(message),
        }
    }
}

/// A failed settlement together with the failure record written for it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FailedSettlement {
    pub error: SettlementError,
    pub failure: SettlementFailure,
}

impl FailedSettlement {
    pub fn kind(&self) -> SettlementErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rust_decimal::Decimal;

    use super::*;

    #[rstest]
    #[case(SettlementError::Validation("amount".into()), true)]
    #[case(SettlementError::ServiceUnavailable("timeout".into()), true)]
    #[case(SettlementError::Rejected("insufficient balance".into()), false)]
    #[case(
        SettlementError::Bookkeeping {
            transaction_ref: "0xabc".into(),
            completed_steps: vec![BookkeepingStep::EventRecorded],
            quote: ChargeQuote::untaxed(Decimal::from(100)),
            message: "db down".into(),
        },
        false
    )]
    fn only_pre_submission_errors_are_retryable(
        #[case] error: SettlementError,
        #[case] retryable: bool,
    ) {
        assert_eq!(error.is_retryable(), retryable);
    }

    #[rstest]
    fn execution_errors_map_to_their_kind() {
        let unavailable: SettlementError = ExecutionError::Unavailable("503".into()).into();
        let rejected: SettlementError = ExecutionError::Rejected("revoked".into()).into();

        assert_eq!(unavailable.kind(), SettlementErrorKind::ServiceUnavailable);
        assert_eq!(rejected.kind(), SettlementErrorKind::Rejected);
        assert_eq!(rejected.transaction_ref(), None);
    }
}
