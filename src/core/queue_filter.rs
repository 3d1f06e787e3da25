//! Queue filter expressions.
//!
//! | input        | meaning                                              |
//! |--------------|------------------------------------------------------|
//! | `*`          | every queue                                          |
//! | `a,b`        | only `a` and `b`                                     |
//! | `+a,b`       | only `a` and `b`, draining `a` before `b`             |
//! | `-a,b`       | every queue except `a` and `b`                        |
//! | `mail*`      | any queue starting with `mail` (inside any list)      |

use std::fmt;
use std::str::FromStr;

use crate::core::error::ConfigError;

/// One queue name or prefix wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePattern {
    /// Exact queue name.
    Exact(String),
    /// Prefix followed by `*`.
    Prefix(String),
}

impl QueuePattern {
    fn parse(raw: &str) -> Self {
        raw.strip_suffix('*').map_or_else(
            || Self::Exact(raw.to_string()),
            |prefix| Self::Prefix(prefix.to_string()),
        )
    }

    /// Whether `queue` matches.
    #[must_use]
    pub fn matches(&self, queue: &str) -> bool {
        match self {
            Self::Exact(name) => name == queue,
            Self::Prefix(prefix) => queue.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for QueuePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Which queues a performer claims from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueFilter {
    /// Every queue.
    #[default]
    All,
    /// Listed queues only.
    Include {
        /// Accepted queues.
        patterns: Vec<QueuePattern>,
        /// Drain in list order before priority.
        ordered: bool,
    },
    /// Every queue except the listed ones.
    Exclude(Vec<QueuePattern>),
}

impl QueueFilter {
    /// Whether rows in `queue` may be claimed.
    #[must_use]
    pub fn matches(&self, queue: &str) -> bool {
        match self {
            Self::All => true,
            Self::Include { patterns, .. } => patterns.iter().any(|p| p.matches(queue)),
            Self::Exclude(patterns) => !patterns.iter().any(|p| p.matches(queue)),
        }
    }

    /// Whether a wake-up naming `queue` (or any queue) concerns this filter.
    #[must_use]
    pub fn matches_hint(&self, queue: Option<&str>) -> bool {
        queue.is_none_or(|q| self.matches(q))
    }

    /// Ordering rank for `queue`; lower drains first. Zero unless ordered.
    #[must_use]
    pub fn rank(&self, queue: &str) -> usize {
        match self {
            Self::Include {
                patterns,
                ordered: true,
            } => patterns
                .iter()
                .position(|p| p.matches(queue))
                .unwrap_or(patterns.len()),
            _ => 0,
        }
    }
}

fn split_patterns(raw: &str, source: &str) -> Result<Vec<QueuePattern>, ConfigError> {
    let patterns: Vec<QueuePattern> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(QueuePattern::parse)
        .collect();
    if patterns.is_empty() {
        return Err(ConfigError::InvalidQueues(source.to_string()));
    }
    Ok(patterns)
}

impl FromStr for QueueFilter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "*" {
            return Ok(Self::All);
        }
        if let Some(rest) = trimmed.strip_prefix('-') {
            return split_patterns(rest, s).map(Self::Exclude);
        }
        if let Some(rest) = trimmed.strip_prefix('+') {
            return split_patterns(rest, s).map(|patterns| Self::Include {
                patterns,
                ordered: true,
            });
        }
        split_patterns(trimmed, s).map(|patterns| Self::Include {
            patterns,
            ordered: false,
        })
    }
}

impl fmt::Display for QueueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |patterns: &[QueuePattern]| {
            patterns
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            Self::All => f.write_str("*"),
            Self::Include { patterns, ordered } => {
                if *ordered {
                    f.write_str("+")?;
                }
                f.write_str(&join(patterns))
            }
            Self::Exclude(patterns) => write!(f, "-{}", join(patterns)),
        }
    }
}
