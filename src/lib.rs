//! Alarm evaluation and feed engine for the sensor flow pipeline.
//!
//! Gateway readings are checked against per-gateway threshold rules; every
//! violation becomes an alarm that is pushed live to subscribers and
//! persisted to a paginated store. Module map, leaves first:
//! - `registry`    – per-gateway threshold rules, loaded on demand
//! - `evaluator`   – pure reading -> alarm events
//! - `store`       – alarm persistence, pagination, append retry
//! - `coordinator` – live + stored alarm views per subscriber
//! - `pipeline`    – per-gateway ordering and not-loaded suspension
//! - `source`      – reading delivery interface
//! - `service`, `routes`, `config`, `schema` – the HTTP service around it

pub mod config;
pub mod coordinator;
pub mod error;
pub mod evaluator;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod routes;
pub mod schema;
pub mod service;
pub mod source;
pub mod store;

pub use config::Config;
pub use coordinator::{
    AlarmFeedCoordinator, CoordinatorSettings, FailurePolicy, FeedStatus, FeedUpdate, FeedView,
    Subscription, SubscriptionHandle,
};
pub use error::AlarmError;
pub use models::{AlarmEvent, AlarmRecord, Priority, Reading, ThresholdRule};
pub use pipeline::{AlarmPipeline, SuspendPolicy};
pub use registry::{ConfigSource, HttpConfigSource, ThresholdRegistry};
pub use service::AlarmService;
pub use source::{ChannelReadingSource, ReadingSource};
pub use store::{AlarmStore, MemoryAlarmStore, PgAlarmStore, RetryPolicy};
