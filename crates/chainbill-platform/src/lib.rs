pub mod config;
pub mod contracts;
pub mod db;
pub mod http_execution;
pub mod pg_store;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{SweepCompletedEvent, SweepKind};
pub use db::{connect_database, connect_record_store};
pub use http_execution::HttpExecutionService;
pub use pg_store::PgRecordStore;
pub use redis_bus::{RedisBus, RedisNotificationSender};
