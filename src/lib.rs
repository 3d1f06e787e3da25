//! # Prometheus Job Engine
//!
//! A durable, concurrency-controlled job execution engine for the Prometheus AI Platform.
//!
//! Jobs are rows in a shared store. Any number of worker processes claim, run and retire
//! them cooperatively, with cron-style recurring schedules layered on top.
//!
//! ## Core Problem Solved
//!
//! Background work on the platform has to survive restarts and run on several machines
//! without being executed twice:
//!
//! - **Durability**: jobs are persisted before they run and retired only after they finish
//! - **No Double Execution**: session-scoped advisory locks keep two workers off the same row
//! - **Crash Recovery**: a dead worker's locks vanish with its session and the row is
//!   claimable again
//! - **Per-Key Limits**: concurrency keys cap how many related jobs run at once in one process
//! - **Low Latency Without Busy Polling**: pub/sub wake-ups with a polling safety net
//!
//! ## Key Features
//!
//! - **Schedulers**: bounded pools of OS worker threads, one pool per queue group
//! - **Notifier and Poller**: wake idle workers on enqueue, or periodically when pub/sub is down
//! - **Cron**: cron expressions, natural-language phrases or callables; at most one
//!   enqueue per tick across a cluster via the `(cron_key, cron_at)` uniqueness constraint
//! - **Four-Tier Shutdown**: no wait, wait forever, cancel now, or wait then cancel, with one
//!   shared budget across every component
//! - **Retries**: per-job exponential backoff with jitter; interrupted jobs always retry
//!
//! ## Capsule - Running the Engine
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use prometheus_job_engine::builders::CapsuleBuilder;
//! use prometheus_job_engine::config::EngineConfig;
//! use prometheus_job_engine::core::{
//!     EngineContext, JobArguments, JobRegistry, NewJob, PerformError, Performable, ShutdownTimeout,
//! };
//! use prometheus_job_engine::infra::InMemoryStore;
//!
//! struct SendDigest;
//!
//! #[async_trait]
//! impl Performable for SendDigest {
//!     async fn perform(&self, args: &JobArguments) -> Result<(), PerformError> {
//!         // deliver the digest
//!         Ok(())
//!     }
//! }
//!
//! let capsule = CapsuleBuilder::new(
//!     EngineContext::global(),
//!     Arc::new(InMemoryStore::new()),
//!     JobRegistry::new().register("SendDigest", SendDigest),
//! )
//! .config(EngineConfig::from_env()?)
//! .build()?;
//!
//! capsule.start()?;
//! capsule.enqueue(NewJob::new("SendDigest").queue("mailers"))?;
//! capsule.shutdown(ShutdownTimeout::Forever);
//! ```
//!
//! For complete examples, see:
//! - `tests/engine_test.rs` - End-to-end claim, retry and wake-up behavior
//! - `tests/cron_test.rs` - Cron scheduling and deduplication

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Job model, execution, wake-up sources and lifecycle.
pub mod core;
/// Configuration models for the engine, queue pools and cron entries.
pub mod config;
/// Builders wiring configuration into running components.
pub mod builders;
/// Infrastructure adapters for job storage.
pub mod infra;
/// Shared utilities.
pub mod util;
