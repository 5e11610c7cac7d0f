pub mod dunning;
pub mod error;
pub mod events;
pub mod models;
pub mod settings;
pub mod settlement;
pub mod storage;

pub use dunning::{
    AttemptStatus, CampaignStatus, CampaignTarget, DunningAction, DunningAttempt, DunningCampaign,
    DunningConfiguration, FinalAction,
};
pub use error::{BillingError, BillingResult};
pub use events::{StateChangeAudit, SubscriptionEvent, SubscriptionEventKind};
pub use models::{
    BillingInterval, ChangeStatus, ChangeType, Customer, Delegation, IntervalUnit, Invoice,
    LineItem, Payment, Product, ProrationKind, ProrationRecord, ScheduledChange,
    SettlementPurpose, Subscription, SubscriptionStatus, line_items_total,
};
pub use settings::EngineSettings;
pub use settlement::{
    BookkeepingStep, ChargeQuote, SettlementContext, SettlementErrorKind, SettlementFailure,
    SettlementReceipt,
};
pub use storage::{
    CatalogStore, DunningStore, LedgerStore, RecordStore, ScheduledChangeStore, SubscriptionStore,
};
