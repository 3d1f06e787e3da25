//! Builders wiring configuration into running components.

pub mod capsule_builder;

pub use capsule_builder::{build_limiter, build_schedulers, CapsuleBuilder};
