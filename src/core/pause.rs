//! Operational pause switches keyed by queue, job class, or label.

use std::collections::HashSet;
use std::fmt;

use parking_lot::RwLock;
use tracing::info;

use crate::core::job::JobRow;

/// What a pause applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PauseScope {
    /// Every row in the named queue.
    Queue(String),
    /// Every row of the named job class.
    JobClass(String),
    /// Every row carrying the label.
    Label(String),
}

impl fmt::Display for PauseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "queue:{name}"),
            Self::JobClass(name) => write!(f, "job_class:{name}"),
            Self::Label(name) => write!(f, "label:{name}"),
        }
    }
}

/// Point-in-time copy of the paused scopes, passed into claim queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PausedScopes {
    /// Paused queue names.
    pub queues: HashSet<String>,
    /// Paused job classes.
    pub job_classes: HashSet<String>,
    /// Paused labels.
    pub labels: HashSet<String>,
}

impl PausedScopes {
    /// Whether `row` falls under any paused scope.
    #[must_use]
    pub fn excludes(&self, row: &JobRow) -> bool {
        self.queues.contains(&row.queue_name)
            || self.job_classes.contains(&row.job_class)
            || row.labels.iter().any(|l| self.labels.contains(l))
    }

    /// Nothing is paused.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.job_classes.is_empty() && self.labels.is_empty()
    }
}

/// Shared, mutable pause state.
#[derive(Debug, Default)]
pub struct PauseRegistry {
    scopes: RwLock<PausedScopes>,
}

impl PauseRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause `scope`. Returns false if it was already paused.
    pub fn pause(&self, scope: PauseScope) -> bool {
        let mut scopes = self.scopes.write();
        let inserted = match &scope {
            PauseScope::Queue(name) => scopes.queues.insert(name.clone()),
            PauseScope::JobClass(name) => scopes.job_classes.insert(name.clone()),
            PauseScope::Label(name) => scopes.labels.insert(name.clone()),
        };
        if inserted {
            info!(scope = %scope, "paused");
        }
        inserted
    }

    /// Unpause `scope`. Returns false if it was not paused.
    pub fn unpause(&self, scope: &PauseScope) -> bool {
        let mut scopes = self.scopes.write();
        let removed = match scope {
            PauseScope::Queue(name) => scopes.queues.remove(name),
            PauseScope::JobClass(name) => scopes.job_classes.remove(name),
            PauseScope::Label(name) => scopes.labels.remove(name),
        };
        if removed {
            info!(scope = %scope, "unpaused");
        }
        removed
    }

    /// Whether `scope` is paused.
    #[must_use]
    pub fn is_paused(&self, scope: &PauseScope) -> bool {
        let scopes = self.scopes.read();
        match scope {
            PauseScope::Queue(name) => scopes.queues.contains(name),
            PauseScope::JobClass(name) => scopes.job_classes.contains(name),
            PauseScope::Label(name) => scopes.labels.contains(name),
        }
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> PausedScopes {
        self.scopes.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::NewJob;
    use crate::util::clock;

    #[test]
    fn pause_excludes_matching_rows_only() {
        let registry = PauseRegistry::new();
        assert!(registry.pause(PauseScope::Label("bulk".into())));
        assert!(!registry.pause(PauseScope::Label("bulk".into())));

        let now = clock::now();
        let tagged = JobRow::from_new(NewJob::new("Export").label("bulk"), now);
        let plain = JobRow::from_new(NewJob::new("Export"), now);
        let snapshot = registry.snapshot();
        assert!(snapshot.excludes(&tagged));
        assert!(!snapshot.excludes(&plain));

        assert!(registry.unpause(&PauseScope::Label("bulk".into())));
        assert!(registry.snapshot().is_empty());
    }
}
