//! Courier agent runtime.
//!
//! Triggers watch external sources and produce job profiles; the
//! [`TriggerManager`] polls them, hands jobs to a [`JobManager`] and keeps the
//! trigger→job bookkeeping honest. Trigger profiles survive restarts through
//! the local store.

pub mod daemon;
pub mod db;
pub mod error;
pub mod job;
pub mod signal;
pub mod trigger;

pub use db::{FileBookmarkDb, TriggerProfileDb};
pub use error::{AgentError, Result};
pub use job::{InMemoryJobManager, JobManager};
pub use signal::StopSignal;
pub use trigger::{DirectoryTrigger, Trigger, TriggerManager, TriggerRegistry};
