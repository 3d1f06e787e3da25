//! Queue pool strings: `filter:threads;filter:threads`.

use std::fmt;
use std::str::FromStr;

use crate::core::error::ConfigError;
use crate::core::queue_filter::QueueFilter;

/// One scheduler's share of the queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePool {
    /// Queues this pool claims from.
    pub filter: QueueFilter,
    /// Worker count; `None` uses the configured default.
    pub max_threads: Option<usize>,
}

impl FromStr for QueuePool {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (filter, max_threads) = match s.rsplit_once(':') {
            Some((filter, threads)) => {
                let threads: usize = threads.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: "queues".to_string(),
                    reason: format!("`{threads}` is not a thread count"),
                })?;
                if threads == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "queues".to_string(),
                        reason: format!("pool `{s}` has zero threads"),
                    });
                }
                (filter, Some(threads))
            }
            None => (s, None),
        };
        Ok(Self {
            filter: filter.parse()?,
            max_threads,
        })
    }
}

impl fmt::Display for QueuePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_threads {
            Some(threads) => write!(f, "{}:{threads}", self.filter),
            None => write!(f, "{}", self.filter),
        }
    }
}

/// Parse `;`-separated pools. Empty segments are skipped.
///
/// # Errors
///
/// [`ConfigError::InvalidQueues`] for an empty string, or the first pool
/// that fails to parse.
pub fn parse_queue_pools(input: &str) -> Result<Vec<QueuePool>, ConfigError> {
    let pools = input
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<QueuePool>, _>>()?;
    if pools.is_empty() {
        return Err(ConfigError::InvalidQueues(input.to_string()));
    }
    Ok(pools)
}
