//! Configuration models for the engine, queue pools and cron entries.

pub mod cron;
pub mod engine;
pub mod queues;

pub use self::cron::{CronEnqueueOptions, CronEntryConfig};
pub use engine::{EngineConfig, ENV_PREFIX};
pub use queues::{parse_queue_pools, QueuePool};
