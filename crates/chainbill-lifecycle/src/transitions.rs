//! Subscription status transition rules.
//!
//! | From                 | To                                                   |
//! |----------------------|------------------------------------------------------|
//! | Active               | Active, Suspended, Overdue, Cancelled, Completed, Expired, Failed |
//! | Overdue              | Overdue, Active, Cancelled, Completed, Expired, Failed |
//! | Suspended / Paused   | itself, Active, Cancelled, Expired, Failed           |
//! | Cancelled, Expired, Completed, Failed | nothing                             |

use chainbill_core::{BillingError, BillingResult, SubscriptionStatus};

use SubscriptionStatus::*;

pub fn allowed_transitions(status: SubscriptionStatus) -> &'static [SubscriptionStatus] {
    match status {
        Active => &[Active, Suspended, Overdue, Cancelled, Completed, Expired, Failed],
        Overdue => &[Overdue, Active, Cancelled, Completed, Expired, Failed],
        Suspended => &[Suspended, Active, Cancelled, Expired, Failed],
        Paused => &[Paused, Active, Cancelled, Expired, Failed],
        Cancelled | Expired | Completed | Failed => &[],
    }
}

pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

pub fn validate_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> BillingResult<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Active, Suspended)]
    #[case(Active, Overdue)]
    #[case(Overdue, Active)]
    #[case(Overdue, Cancelled)]
    #[case(Suspended, Active)]
    #[case(Paused, Active)]
    #[case(Active, Completed)]
    #[case(Overdue, Completed)]
    fn permits_lifecycle_moves(#[case] from: SubscriptionStatus, #[case] to: SubscriptionStatus) {
        assert!(validate_transition(from, to).is_ok());
    }

    #[rstest]
    #[case(Suspended, Overdue)]
    #[case(Suspended, Completed)]
    #[case(Overdue, Suspended)]
    #[case(Cancelled, Active)]
    #[case(Completed, Active)]
    #[case(Expired, Cancelled)]
    #[case(Failed, Failed)]
    fn rejects_everything_else(#[case] from: SubscriptionStatus, #[case] to: SubscriptionStatus) {
        assert!(matches!(
            validate_transition(from, to),
            Err(BillingError::InvalidTransition { .. })
        ));
    }

    #[rstest]
    fn terminal_statuses_are_dead_ends() {
        for status in [Cancelled, Expired, Completed, Failed] {
            assert!(status.is_terminal());
            assert!(allowed_transitions(status).is_empty());
        }
    }
}
