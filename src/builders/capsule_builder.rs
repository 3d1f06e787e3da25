//! Builders to construct schedulers and capsules from configuration.

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::audit::SharedAuditSink;
use crate::core::capsule::{Capsule, CapsuleParts, EngineContext};
use crate::core::concurrency::ConcurrencyLimiter;
use crate::core::cron::{CronEntry, CronManager};
use crate::core::enqueue::Enqueuer;
use crate::core::error::{ConfigError, EngineError, ErrorReporter};
use crate::core::multi_scheduler::MultiScheduler;
use crate::core::notifier::Notifier;
use crate::core::pause::PauseRegistry;
use crate::core::performable::JobRegistry;
use crate::core::performer::JobPerformer;
use crate::core::poller::Poller;
use crate::core::scheduler::{Scheduler, SchedulerOptions};
use crate::core::store::Store;
use crate::core::wake::WakeTarget;

/// Concurrency limiter with the configured default and per-key limits.
#[must_use]
pub fn build_limiter(cfg: &EngineConfig) -> ConcurrencyLimiter {
    cfg.concurrency_limits
        .iter()
        .fold(ConcurrencyLimiter::new(cfg.default_concurrency_limit), |limiter, (key, max)| {
            limiter.with_limit(key.clone(), *max)
        })
}

/// One scheduler per configured queue pool, sharing `limiter` and `pauses`.
///
/// # Errors
///
/// Invalid configuration.
pub fn build_schedulers(
    cfg: &EngineConfig,
    store: &Arc<dyn Store>,
    registry: &Arc<JobRegistry>,
    limiter: &Arc<ConcurrencyLimiter>,
    pauses: &Arc<PauseRegistry>,
    reporter: &ErrorReporter,
    audit: Option<&SharedAuditSink>,
) -> Result<MultiScheduler, ConfigError> {
    cfg.validate()?;

    let mut schedulers = Vec::new();
    for (index, pool) in cfg.queue_pools()?.into_iter().enumerate() {
        let mut performer = JobPerformer::new(
            pool.filter,
            Arc::clone(store),
            Arc::clone(registry),
            Arc::clone(limiter),
            Arc::clone(pauses),
        )
        .with_lookahead(cfg.claim_lookahead)
        .with_preserve_job_records(cfg.preserve_job_records);
        if let Some(sink) = audit {
            performer = performer.with_audit(Arc::clone(sink));
        }

        let mut options = SchedulerOptions::new(
            format!("jobs-{index}"),
            pool.max_threads.unwrap_or(cfg.max_threads),
        )
        .with_max_cache(cfg.max_cache);
        if let Some(cleanup) = cfg.cleanup_policy() {
            options = options.with_cleanup(cleanup);
        }
        schedulers.push(Scheduler::new(options, performer, reporter.clone()));
    }

    Ok(MultiScheduler::new(schedulers))
}

/// Assembles a [`Capsule`] from configuration.
pub struct CapsuleBuilder {
    context: Arc<EngineContext>,
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    config: EngineConfig,
    cron_entries: Vec<CronEntry>,
    audit: Option<SharedAuditSink>,
}

impl CapsuleBuilder {
    /// Builder with default configuration.
    #[must_use]
    pub fn new(context: Arc<EngineContext>, store: Arc<dyn Store>, registry: JobRegistry) -> Self {
        Self {
            context,
            store,
            registry: Arc::new(registry),
            config: EngineConfig::default(),
            cron_entries: Vec::new(),
            audit: None,
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a cron entry next to those in the configuration.
    #[must_use]
    pub fn cron_entry(mut self, entry: CronEntry) -> Self {
        self.cron_entries.push(entry);
        self
    }

    /// Record execution events to `sink`.
    #[must_use]
    pub fn audit(mut self, sink: SharedAuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Wire schedulers, notifier, poller and cron manager and register the
    /// capsule with its context. Nothing is started.
    ///
    /// # Errors
    ///
    /// Invalid configuration, including cron entries that fail to parse,
    /// share a key, or target an unregistered job class.
    pub fn build(self) -> Result<Capsule, EngineError> {
        let Self {
            context,
            store,
            registry,
            config,
            mut cron_entries,
            audit,
        } = self;
        let reporter = context.reporter().clone();
        let limiter = Arc::new(build_limiter(&config));
        let schedulers = Arc::new(build_schedulers(
            &config,
            &store,
            &registry,
            &limiter,
            context.pauses(),
            &reporter,
            audit.as_ref(),
        )?);
        let recipients: Vec<Arc<dyn WakeTarget>> =
            vec![Arc::clone(&schedulers) as Arc<dyn WakeTarget>];

        let listen = config.enable_listen_notify && store.supports_listen();
        let notifier = listen.then(|| {
            Notifier::new(
                config.notifier_options(),
                Arc::clone(&store),
                recipients.clone(),
                reporter.clone(),
            )
        });
        let poller = Poller::new(config.poll_interval(), recipients);
        let enqueuer = Enqueuer::new(Arc::clone(&store)).with_notify(listen);

        cron_entries.extend(config.cron_entries()?);
        let cron = if cron_entries.is_empty() {
            None
        } else {
            Some(
                CronManager::new(cron_entries, &registry, enqueuer.clone(), reporter)?
                    .with_graceful_restart_period(config.cron_graceful_restart_period()),
            )
        };

        Ok(Capsule::assemble(CapsuleParts {
            context,
            store,
            registry,
            limiter,
            schedulers,
            notifier,
            poller,
            cron,
            cron_enabled: config.enable_cron,
            enqueuer,
            claim_lookahead: config.claim_lookahead,
            shutdown_timeout: config.shutdown_timeout(),
        }))
    }
}

impl fmt::Debug for CapsuleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsuleBuilder")
            .field("config", &self.config)
            .field("cron_entries", &self.cron_entries.len())
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}
