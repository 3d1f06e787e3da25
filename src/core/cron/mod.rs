//! Recurring job entries and the manager that fires them.

pub mod deferred;
pub mod entry;
pub mod manager;
pub mod natural;
pub mod schedule;

pub use deferred::Deferred;
pub use entry::CronEntry;
pub use manager::CronManager;
pub use schedule::{CronSchedule, NextFn};
