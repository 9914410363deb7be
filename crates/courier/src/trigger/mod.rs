//! Trigger capability, kind registry and the trigger manager daemon.
//!
//! A trigger watches some external source and hands out job profiles on
//! demand. New kinds plug in through [`TriggerRegistry`]; the manager never
//! looks at a kind beyond asking the registry for a constructor.

mod directory;
mod manager;

pub use directory::DirectoryTrigger;
pub use manager::TriggerManager;

use crate::db::FileBookmarkDb;
use crate::error::{AgentError, Result};
use courier_conf::{JobProfile, TriggerProfile};
use courier_db::Db;
use std::collections::HashMap;
use std::sync::Arc;

/// Detects work and emits job profiles.
///
/// `fetch_job_profile` and `destroy` may be called concurrently from
/// different threads, including after `destroy` has already run.
pub trait Trigger: Send + Sync {
    /// One-time setup. Fails when the watched resource is unreachable.
    fn init(&mut self, profile: TriggerProfile) -> Result<()>;

    /// Start background detection without blocking the caller.
    fn run(&mut self) -> Result<()>;

    /// Next detected job, if any. Never blocks.
    fn fetch_job_profile(&self) -> Option<JobProfile>;

    fn trigger_profile(&self) -> &TriggerProfile;

    /// Stop background work. Idempotent; safe after a failed `init` or `run`.
    fn destroy(&self);
}

type TriggerFactory = Arc<dyn Fn() -> Box<dyn Trigger> + Send + Sync>;

/// Maps `job.trigger` kind names to constructors.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    factories: HashMap<String, TriggerFactory>,
}

impl TriggerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind. Nothing is remembered across
    /// restarts.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DirectoryTrigger::KIND, || Box::new(DirectoryTrigger::new()));
        registry
    }

    /// Registry with every built-in kind, keeping file bookmarks in `db`.
    pub fn with_store(db: Arc<dyn Db>) -> Self {
        let bookmarks = FileBookmarkDb::new(db);
        let mut registry = Self::new();
        registry.register(DirectoryTrigger::KIND, move || {
            Box::new(DirectoryTrigger::new().with_bookmarks(bookmarks.clone()))
        });
        registry
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Trigger> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Fresh, uninitialised trigger for the profile's kind.
    pub fn create(&self, profile: &TriggerProfile) -> Result<Box<dyn Trigger>> {
        let kind = profile
            .trigger_kind()
            .ok_or_else(|| AgentError::invalid_profile("trigger profile has no kind"))?;
        let factory = self
            .factories
            .get(&kind)
            .ok_or(AgentError::UnknownTriggerKind(kind))?;
        Ok(factory())
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
