//! Job model, execution, wake-up sources and lifecycle.

pub mod audit;
pub mod capsule;
pub mod concurrency;
pub mod cron;
pub mod enqueue;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod multi_scheduler;
pub mod notifier;
pub mod pause;
pub mod performable;
pub mod performer;
pub mod poller;
pub mod queue_filter;
pub mod scheduler;
pub mod store;
pub mod wake;

pub use self::cron::{CronEntry, CronManager, CronSchedule, Deferred};
pub use audit::{
    build_audit_event, shared_sink, AuditEvent, AuditSink, InMemoryAuditSink, SharedAuditSink,
};
pub use capsule::{Capsule, CapsuleStats, EngineContext};
pub use concurrency::ConcurrencyLimiter;
pub use enqueue::Enqueuer;
pub use error::{ConfigError, EngineError, ErrorReporter, PerformError, StoreError};
pub use job::{ErrorEvent, JobArguments, JobFinish, JobId, JobOutcome, JobRow, NewJob};
pub use lifecycle::{shutdown_all, Lifecycle, ShutdownTimeout};
pub use multi_scheduler::MultiScheduler;
pub use notifier::{Notifier, NotifierOptions, NotifierState};
pub use pause::{PauseRegistry, PauseScope, PausedScopes};
pub use performable::{JobRegistry, Performable, RetryPolicy};
pub use performer::{perform_inline, ExecutionContext, ExecutionResult, JobPerformer};
pub use poller::Poller;
pub use queue_filter::{QueueFilter, QueuePattern};
pub use scheduler::{
    CleanupPolicy, Scheduler, SchedulerOptions, SchedulerState, SchedulerStats, CANCEL_GRACE,
};
pub use store::{ClaimRequest, ClaimedJob, InsertOutcome, Store, Subscription, NOTIFY_CHANNEL};
pub use wake::{WakeHint, WakeTarget};
