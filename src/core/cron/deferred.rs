//! Values that are either fixed or computed at fire time.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A static value or a function of the fire time.
pub enum Deferred<T> {
    /// Fixed value.
    Static(T),
    /// Evaluated each time the value is needed.
    Dynamic(Arc<dyn Fn(DateTime<Utc>) -> T + Send + Sync>),
}

impl<T: Clone> Deferred<T> {
    /// Wrap a function evaluated at fire time.
    pub fn dynamic(f: impl Fn(DateTime<Utc>) -> T + Send + Sync + 'static) -> Self {
        Self::Dynamic(Arc::new(f))
    }

    /// The value for fire time `at`.
    pub fn evaluate(&self, at: DateTime<Utc>) -> T {
        match self {
            Self::Static(value) => value.clone(),
            Self::Dynamic(f) => f(at),
        }
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Self::Static(value)
    }
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(value) => Self::Static(value.clone()),
            Self::Dynamic(f) => Self::Dynamic(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}
