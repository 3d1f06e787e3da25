//! Claim-and-execute of single job rows.
//!
//! A claim takes the row's advisory lock and a concurrency slot; both are
//! held until the attempt's outcome is persisted, then released together.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn};

use crate::core::audit::{build_audit_event, SharedAuditSink};
use crate::core::concurrency::ConcurrencyLimiter;
use crate::core::error::{EngineError, PerformError, StoreError};
use crate::core::job::{ErrorEvent, JobArguments, JobFinish, JobId, JobOutcome, JobRow};
use crate::core::pause::PauseRegistry;
use crate::core::performable::{JobRegistry, Performable, RetryPolicy};
use crate::core::queue_filter::QueueFilter;
use crate::core::store::{ClaimRequest, ClaimedJob, Store};
use crate::core::wake::WakeHint;
use crate::util::clock;

/// Outcome of one `next()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// A job ran and succeeded.
    Succeeded {
        /// The job.
        job_id: JobId,
    },
    /// A job ran and raised a fault.
    Errored {
        /// The job.
        job_id: JobId,
        /// Its job class.
        job_class: String,
        /// Error text persisted on the row.
        error: String,
        /// Classification persisted on the row.
        event: ErrorEvent,
        /// No retry policy handled the fault.
        unhandled: bool,
    },
    /// Nothing claimable.
    NoWork,
}

impl ExecutionResult {
    /// Whether a job was executed.
    #[must_use]
    pub const fn performed(&self) -> bool {
        !matches!(self, Self::NoWork)
    }

    /// The unhandled fault as an engine error, if any.
    #[must_use]
    pub fn unhandled_error(&self) -> Option<EngineError> {
        match self {
            Self::Errored {
                job_id,
                job_class,
                error,
                unhandled: true,
                ..
            } => Some(EngineError::JobFailed {
                job_id: *job_id,
                job_class: job_class.clone(),
                message: error.clone(),
            }),
            _ => None,
        }
    }
}

/// A claimed row ready to run.
pub struct ClaimedExecution {
    claimed: ClaimedJob,
    concurrency_key: Option<String>,
    performable: Option<Arc<dyn Performable>>,
}

impl ClaimedExecution {
    /// The claimed row.
    #[must_use]
    pub const fn row(&self) -> &JobRow {
        &self.claimed.row
    }
}

impl fmt::Debug for ClaimedExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedExecution")
            .field("job_id", &self.claimed.row.id)
            .field("lock_key", &self.claimed.lock_key)
            .field("concurrency_key", &self.concurrency_key)
            .finish_non_exhaustive()
    }
}

enum RunOutcome {
    Completed,
    Fault(PerformError),
    Panicked(String),
    Cancelled,
}

/// Per-thread execution environment: a current-thread tokio runtime for
/// the async performable and a cancellation signal.
pub struct ExecutionContext {
    runtime: tokio::runtime::Runtime,
    cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    /// Context cancelled when `cancel` turns true.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime cannot be built.
    pub fn new(cancel: watch::Receiver<bool>) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime, cancel })
    }

    /// Context that is never cancelled.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime cannot be built.
    pub fn uncancellable() -> Result<Self, std::io::Error> {
        let (_tx, rx) = watch::channel(false);
        Self::new(rx)
    }

    fn run(&self, performable: &dyn Performable, args: &JobArguments) -> RunOutcome {
        let mut cancel = self.cancel.clone();
        self.runtime.block_on(async move {
            let work = AssertUnwindSafe(performable.perform(args)).catch_unwind();
            tokio::select! {
                biased;
                result = work => match result {
                    Ok(Ok(())) => RunOutcome::Completed,
                    Ok(Err(fault)) => RunOutcome::Fault(fault),
                    Err(panic) => RunOutcome::Panicked(panic_message(panic.as_ref())),
                },
                () = cancelled(&mut cancel) => RunOutcome::Cancelled,
            }
        })
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cancelled", &*self.cancel.borrow())
            .finish_non_exhaustive()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}

/// Claims and executes rows matching one queue filter.
pub struct JobPerformer {
    filter: QueueFilter,
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    limiter: Arc<ConcurrencyLimiter>,
    pauses: Arc<PauseRegistry>,
    audit: Option<SharedAuditSink>,
    lookahead: usize,
    preserve_job_records: bool,
}

impl JobPerformer {
    /// Performer for `filter`.
    #[must_use]
    pub fn new(
        filter: QueueFilter,
        store: Arc<dyn Store>,
        registry: Arc<JobRegistry>,
        limiter: Arc<ConcurrencyLimiter>,
        pauses: Arc<PauseRegistry>,
    ) -> Self {
        Self {
            filter,
            store,
            registry,
            limiter,
            pauses,
            audit: None,
            lookahead: 50,
            preserve_job_records: true,
        }
    }

    /// Maximum locked candidates skipped per claim.
    #[must_use]
    pub const fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// Keep (true) or delete (false) successfully finished rows.
    #[must_use]
    pub const fn with_preserve_job_records(mut self, preserve: bool) -> Self {
        self.preserve_job_records = preserve;
        self
    }

    /// Record executions to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: SharedAuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    /// The queue filter.
    #[must_use]
    pub const fn filter(&self) -> &QueueFilter {
        &self.filter
    }

    /// Whether a wake-up for `hint` concerns this performer.
    #[must_use]
    pub fn accepts(&self, hint: Option<&WakeHint>) -> bool {
        self.filter
            .matches_hint(hint.and_then(|h| h.queue_name.as_deref()))
    }

    /// Claim the next eligible row and its concurrency slot.
    ///
    /// A row whose key is saturated is unlocked again and `None` returned;
    /// it stays pending for a later attempt.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn claim(&self) -> Result<Option<ClaimedExecution>, StoreError> {
        let request = ClaimRequest {
            filter: self.filter.clone(),
            paused: self.pauses.snapshot(),
            excluded_concurrency_keys: self.limiter.saturated_keys(),
            lookahead: self.lookahead,
            now: clock::now(),
        };
        let Some(claimed) = self.store.claim_next(&request)? else {
            return Ok(None);
        };
        let performable = self.registry.get(&claimed.row.job_class);

        if let Some(key) = claimed.row.concurrency_key.clone() {
            let max = self
                .limiter
                .limit_for(&key, performable.as_ref().and_then(|p| p.concurrency_limit()));
            if !self.limiter.try_acquire_for(&key, claimed.row.id, max) {
                debug!(
                    job.id = %claimed.row.id,
                    key = %key,
                    "deferring job; concurrency key at capacity"
                );
                self.store.release(&claimed)?;
                self.record(&claimed.row, "deferred", Some(key));
                return Ok(None);
            }
            return Ok(Some(ClaimedExecution {
                claimed,
                concurrency_key: Some(key),
                performable,
            }));
        }

        Ok(Some(ClaimedExecution {
            claimed,
            concurrency_key: None,
            performable,
        }))
    }

    /// Run a claimed row, persist its outcome and release the lock and slot.
    ///
    /// # Errors
    ///
    /// Propagates store failures while persisting or unlocking. Job faults
    /// are not errors here; they are reported through the result.
    pub fn perform(
        &self,
        execution: ClaimedExecution,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, StoreError> {
        let row = &execution.claimed.row;
        let span = info_span!(
            "job",
            job.id = %row.id,
            job.class = %row.job_class,
            job.queue = %row.queue_name
        );
        let _entered = span.enter();

        let performed_at = clock::now();
        let attempt = row.executions_count.saturating_add(1);
        let (run, policy) = match &execution.performable {
            Some(performable) => (
                ctx.run(performable.as_ref(), &row.arguments),
                performable.retry_policy(),
            ),
            None => (
                RunOutcome::Fault(PerformError::Discard(format!(
                    "no performable registered for job class `{}`",
                    row.job_class
                ))),
                RetryPolicy::none(),
            ),
        };
        let missing = execution.performable.is_none();
        let finished_at = clock::now();
        let (outcome, result) = self.classify(row, attempt, &policy, run, missing, finished_at);

        let persisted = self.store.mark_finished(
            &execution.claimed,
            &JobFinish {
                performed_at,
                finished_at,
                outcome: outcome.clone(),
            },
        );
        let released = self.store.release(&execution.claimed);
        if let Some(key) = &execution.concurrency_key {
            self.limiter.release(key);
        }
        persisted?;
        released?;

        match &outcome {
            JobOutcome::Succeeded | JobOutcome::Destroy => {
                info!(attempt, "job succeeded");
                self.record(row, "succeeded", None);
            }
            JobOutcome::Retry { scheduled_at, error, event } => {
                warn!(attempt, %error, retry_at = %scheduled_at, "job will be retried");
                let action = if *event == ErrorEvent::Interrupted {
                    "interrupted"
                } else {
                    "retried"
                };
                self.record(row, action, Some(error.clone()));
            }
            JobOutcome::Failed { error, event } => {
                warn!(attempt, %error, event = event.code(), "job failed");
                let action = match event {
                    ErrorEvent::Discarded => "discarded",
                    ErrorEvent::Handled => "handled",
                    _ => "failed",
                };
                self.record(row, action, Some(error.clone()));
            }
        }
        Ok(result)
    }

    /// Claim and run one row.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn next(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, StoreError> {
        match self.claim()? {
            Some(execution) => self.perform(execution, ctx),
            None => Ok(ExecutionResult::NoWork),
        }
    }

    /// Upcoming future-scheduled wake-ups for this filter.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn upcoming(&self, limit: usize) -> Result<Vec<WakeHint>, StoreError> {
        self.store.upcoming_scheduled(&self.filter, limit, clock::now())
    }

    /// Delete preserved finished rows older than `older_than`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn cleanup(&self, older_than: Duration) -> Result<usize, StoreError> {
        let removed = self
            .store
            .cleanup_finished(clock::sub(clock::now(), older_than))?;
        if removed > 0 {
            info!(removed, "cleaned up preserved job records");
        }
        Ok(removed)
    }

    fn classify(
        &self,
        row: &JobRow,
        attempt: u32,
        policy: &RetryPolicy,
        run: RunOutcome,
        missing: bool,
        now: DateTime<Utc>,
    ) -> (JobOutcome, ExecutionResult) {
        let errored = |error: String, event: ErrorEvent, unhandled: bool| {
            ExecutionResult::Errored {
                job_id: row.id,
                job_class: row.job_class.clone(),
                error,
                event,
                unhandled,
            }
        };

        let failure = match run {
            RunOutcome::Completed => {
                let outcome = if self.preserve_job_records {
                    JobOutcome::Succeeded
                } else {
                    JobOutcome::Destroy
                };
                return (outcome, ExecutionResult::Succeeded { job_id: row.id });
            }
            RunOutcome::Cancelled | RunOutcome::Fault(PerformError::Interrupted) => {
                let error = "interrupted".to_string();
                return (
                    JobOutcome::Retry {
                        scheduled_at: now,
                        error: error.clone(),
                        event: ErrorEvent::Interrupted,
                    },
                    errored(error, ErrorEvent::Interrupted, false),
                );
            }
            RunOutcome::Fault(PerformError::Discard(reason)) if missing => {
                return (
                    JobOutcome::Failed {
                        error: reason.clone(),
                        event: ErrorEvent::Unhandled,
                    },
                    errored(reason, ErrorEvent::Unhandled, true),
                );
            }
            RunOutcome::Fault(PerformError::Discard(reason)) => {
                return (
                    JobOutcome::Failed {
                        error: reason.clone(),
                        event: ErrorEvent::Discarded,
                    },
                    errored(reason, ErrorEvent::Discarded, false),
                );
            }
            RunOutcome::Fault(PerformError::Handled(reason)) => {
                return (
                    JobOutcome::Failed {
                        error: reason.clone(),
                        event: ErrorEvent::Handled,
                    },
                    errored(reason, ErrorEvent::Handled, false),
                );
            }
            RunOutcome::Fault(PerformError::Failed(error)) => format!("{error:#}"),
            RunOutcome::Panicked(message) => format!("panicked: {message}"),
        };

        if policy.should_retry(attempt) {
            let scheduled_at = clock::add(now, policy.delay_for(attempt));
            return (
                JobOutcome::Retry {
                    scheduled_at,
                    error: failure.clone(),
                    event: ErrorEvent::Retried,
                },
                errored(failure, ErrorEvent::Retried, false),
            );
        }
        let event = if policy.retries() {
            ErrorEvent::RetryStopped
        } else {
            ErrorEvent::Unhandled
        };
        (
            JobOutcome::Failed {
                error: failure.clone(),
                event,
            },
            errored(failure, event, true),
        )
    }

    fn record(&self, row: &JobRow, action: &str, detail: Option<String>) {
        if let Some(sink) = &self.audit {
            sink.lock().record(build_audit_event(row, action, detail));
        }
    }
}

impl fmt::Debug for JobPerformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPerformer")
            .field("filter", &self.filter.to_string())
            .field("lookahead", &self.lookahead)
            .field("preserve_job_records", &self.preserve_job_records)
            .finish_non_exhaustive()
    }
}

/// Drain jobs on the calling thread until none remain or `limit` jobs ran.
///
/// Must be called outside a tokio runtime. The first unhandled job fault
/// stops the loop and is returned as [`EngineError::JobFailed`].
///
/// # Errors
///
/// Store failures, runtime construction failure, or the first unhandled
/// job fault.
pub fn perform_inline(
    performer: &JobPerformer,
    limit: Option<usize>,
) -> Result<usize, EngineError> {
    let ctx = ExecutionContext::uncancellable()?;
    let mut performed = 0_usize;
    while limit.is_none_or(|limit| performed < limit) {
        let result = performer.next(&ctx)?;
        if !result.performed() {
            break;
        }
        performed += 1;
        if let Some(error) = result.unhandled_error() {
            return Err(error);
        }
    }
    Ok(performed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::{shared_sink, InMemoryAuditSink};
    use crate::core::job::NewJob;
    use crate::core::pause::PauseScope;
    use crate::infra::InMemoryStore;
    use async_trait::async_trait;

    struct Noop {
        limit: Option<usize>,
    }

    #[async_trait]
    impl Performable for Noop {
        async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
            Ok(())
        }

        fn concurrency_limit(&self) -> Option<usize> {
            self.limit
        }
    }

    struct Discarding;

    #[async_trait]
    impl Performable for Discarding {
        async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
            Err(PerformError::Discard("stale payload".to_string()))
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::exponential(5, Duration::from_secs(1))
        }
    }

    struct Failing;

    #[async_trait]
    impl Performable for Failing {
        async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
            Err(anyhow::anyhow!("upstream timed out").into())
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::exponential(2, Duration::from_millis(0)).with_jitter(0.0)
        }
    }

    struct Recovering;

    #[async_trait]
    impl Performable for Recovering {
        async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
            Err(PerformError::Handled("fell back to cached rates".to_string()))
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::exponential(5, Duration::from_secs(1))
        }
    }

    struct Interrupting;

    #[async_trait]
    impl Performable for Interrupting {
        async fn perform(&self, _args: &JobArguments) -> Result<(), PerformError> {
            Err(PerformError::Interrupted)
        }
    }

    fn performer(store: &InMemoryStore, limiter: ConcurrencyLimiter) -> JobPerformer {
        let registry = JobRegistry::new()
            .register("Noop", Noop { limit: None })
            .register("Limited", Noop { limit: Some(1) })
            .register("Discarding", Discarding)
            .register("Failing", Failing)
            .register("Recovering", Recovering)
            .register("Interrupting", Interrupting);
        JobPerformer::new(
            QueueFilter::All,
            Arc::new(store.session()),
            Arc::new(registry),
            Arc::new(limiter),
            Arc::new(PauseRegistry::new()),
        )
    }

    fn run_one(performer: &JobPerformer) -> ExecutionResult {
        let ctx = ExecutionContext::uncancellable().unwrap();
        performer.next(&ctx).unwrap()
    }

    #[test]
    fn saturated_key_defers_and_unlocks_the_row() {
        let store = InMemoryStore::new();
        let limiter = ConcurrencyLimiter::new(5);
        assert!(limiter.try_acquire("tenant", 5));
        let performer = performer(&store, limiter);
        let job = NewJob::new("Limited").concurrency_key("tenant");
        let id = job.id;
        store.insert_job(job).unwrap();

        assert!(performer.claim().unwrap().is_none());
        assert!(!store.is_locked(id));
        assert_eq!(performer.limiter.waiting("tenant"), vec![id]);
        assert_eq!(store.pending(), 1);

        performer.limiter.release("tenant");
        assert!(run_one(&performer).performed());
        assert_eq!(performer.limiter.tracked_keys(), 0);
    }

    #[test]
    fn success_keeps_or_destroys_the_row() {
        let store = InMemoryStore::new();
        let job = NewJob::new("Noop");
        let kept = job.id;
        store.insert_job(job).unwrap();
        assert_eq!(
            run_one(&performer(&store, ConcurrencyLimiter::default())),
            ExecutionResult::Succeeded { job_id: kept }
        );
        let row = store.job(kept).unwrap();
        assert!(row.finished_at.is_some());
        assert_eq!(row.executions_count, 1);

        let job = NewJob::new("Noop");
        let destroyed = job.id;
        store.insert_job(job).unwrap();
        let performer =
            performer(&store, ConcurrencyLimiter::default()).with_preserve_job_records(false);
        assert!(run_one(&performer).performed());
        assert!(store.job(destroyed).is_none());
    }

    #[test]
    fn discard_fails_without_retry() {
        let store = InMemoryStore::new();
        let job = NewJob::new("Discarding");
        let id = job.id;
        store.insert_job(job).unwrap();

        let result = run_one(&performer(&store, ConcurrencyLimiter::default()));
        assert!(matches!(
            result,
            ExecutionResult::Errored { event: ErrorEvent::Discarded, unhandled: false, .. }
        ));
        assert!(result.unhandled_error().is_none());
        let row = store.job(id).unwrap();
        assert!(row.finished_at.is_some());
        assert_eq!(row.error_event, Some(ErrorEvent::Discarded));
    }

    #[test]
    fn handled_fault_finishes_without_retry_or_report() {
        let store = InMemoryStore::new();
        let events = InMemoryAuditSink::new(10);
        let performer = performer(&store, ConcurrencyLimiter::default())
            .with_audit(shared_sink(events.clone()));
        let job = NewJob::new("Recovering");
        let id = job.id;
        store.insert_job(job).unwrap();

        let result = run_one(&performer);
        assert!(matches!(
            result,
            ExecutionResult::Errored { event: ErrorEvent::Handled, unhandled: false, .. }
        ));
        assert!(result.unhandled_error().is_none());
        let row = store.job(id).unwrap();
        assert!(row.finished_at.is_some());
        assert_eq!(row.error_event, Some(ErrorEvent::Handled));
        assert_eq!(row.error.as_deref(), Some("fell back to cached rates"));
        assert_eq!(store.pending(), 0);
        assert!(events.events().iter().any(|event| event.action == "handled"));
    }

    #[test]
    fn missing_class_is_unhandled() {
        let store = InMemoryStore::new();
        let job = NewJob::new("Unknown");
        let id = job.id;
        store.insert_job(job).unwrap();

        let result = run_one(&performer(&store, ConcurrencyLimiter::default()));
        assert!(matches!(
            result.unhandled_error(),
            Some(EngineError::JobFailed { job_class, .. }) if job_class == "Unknown"
        ));
        assert_eq!(store.job(id).unwrap().error_event, Some(ErrorEvent::Unhandled));
    }

    #[test]
    fn failures_retry_until_the_policy_stops() {
        let store = InMemoryStore::new();
        let job = NewJob::new("Failing");
        let id = job.id;
        store.insert_job(job).unwrap();
        let performer = performer(&store, ConcurrencyLimiter::default());

        let first = run_one(&performer);
        assert!(matches!(
            first,
            ExecutionResult::Errored { event: ErrorEvent::Retried, unhandled: false, .. }
        ));
        let row = store.job(id).unwrap();
        assert!(row.finished_at.is_none());
        assert_eq!(row.error.as_deref(), Some("upstream timed out"));

        let second = run_one(&performer);
        assert!(matches!(
            second,
            ExecutionResult::Errored { event: ErrorEvent::RetryStopped, unhandled: true, .. }
        ));
        assert_eq!(store.job(id).unwrap().executions_count, 2);
        assert_eq!(run_one(&performer), ExecutionResult::NoWork);
    }

    #[test]
    fn interruption_always_retries_immediately() {
        let store = InMemoryStore::new();
        let job = NewJob::new("Interrupting");
        let id = job.id;
        store.insert_job(job).unwrap();

        let result = run_one(&performer(&store, ConcurrencyLimiter::default()));
        assert!(matches!(result, ExecutionResult::Errored { event: ErrorEvent::Interrupted, .. }));
        let row = store.job(id).unwrap();
        assert!(row.is_eligible(clock::now()));
        assert_eq!(row.error_event, Some(ErrorEvent::Interrupted));
    }

    #[test]
    fn paused_class_is_not_claimed_and_audit_records_runs() {
        let store = InMemoryStore::new();
        store.insert_job(NewJob::new("Noop")).unwrap();
        let events = InMemoryAuditSink::new(10);
        let performer = performer(&store, ConcurrencyLimiter::default())
            .with_audit(shared_sink(events.clone()));

        assert!(performer.pauses.pause(PauseScope::JobClass("Noop".into())));
        assert_eq!(run_one(&performer), ExecutionResult::NoWork);
        assert!(performer.pauses.unpause(&PauseScope::JobClass("Noop".into())));
        assert!(run_one(&performer).performed());
        let actions: Vec<String> = events.events().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, ["succeeded"]);
    }
}
