//! Trigger manager daemon.
//!
//! Owns the active triggers and the trigger→job index. Two workers drive it:
//! `trigger-fetch` polls every trigger for new jobs and `trigger-job-check`
//! prunes index entries whose jobs the job manager no longer reports.
//!
//! Submissions, re-arms and deletions are serialised so the running quota
//! holds under concurrent callers. Lock order is submissions → index →
//! triggers. The index lock is never held across a job manager call.

use super::{Trigger, TriggerRegistry};
use crate::daemon::WorkerGroup;
use crate::db::{FileBookmarkDb, TriggerProfileDb};
use crate::error::{AgentError, Result};
use crate::job::JobManager;
use courier_conf::{keys, AgentConf, Profile, TriggerProfile};
use courier_db::Db;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type TriggerMap = HashMap<String, Arc<dyn Trigger>>;
type JobIndex = HashMap<String, HashSet<String>>;

pub struct TriggerManager {
    conf: Arc<AgentConf>,
    job_manager: Arc<dyn JobManager>,
    profile_db: TriggerProfileDb,
    bookmarks: FileBookmarkDb,
    registry: TriggerRegistry,
    submissions: Mutex<()>,
    triggers: RwLock<TriggerMap>,
    trigger_jobs: Mutex<JobIndex>,
    workers: Mutex<Option<WorkerGroup>>,
}

impl TriggerManager {
    pub fn new(conf: Arc<AgentConf>, job_manager: Arc<dyn JobManager>, db: Arc<dyn Db>) -> Self {
        Self {
            conf,
            job_manager,
            profile_db: TriggerProfileDb::new(db.clone()),
            bookmarks: FileBookmarkDb::new(db.clone()),
            registry: TriggerRegistry::with_store(db),
            submissions: Mutex::new(()),
            triggers: RwLock::new(HashMap::new()),
            trigger_jobs: Mutex::new(HashMap::new()),
            workers: Mutex::new(None),
        }
    }

    /// Replace the trigger kind registry.
    pub fn with_registry(mut self, registry: TriggerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn profile_db(&self) -> &TriggerProfileDb {
        &self.profile_db
    }

    /// Validate, persist and activate a trigger profile.
    ///
    /// Returns `false` when required keys are missing, when the running
    /// quota is exhausted for a new id, or when activation fails. A profile
    /// that persisted but failed to activate stays persisted.
    pub fn submit_trigger(&self, profile: TriggerProfile) -> bool {
        if !profile.all_required_key_exist() {
            error!(
                missing = ?profile.missing_keys(),
                "trigger profile missing required keys"
            );
            return false;
        }
        let Some(id) = profile.trigger_id() else {
            return false;
        };

        let _submission = self.submission_slot();
        let max = self.conf.trigger_max_running_num();
        let active = self.active_count();
        if !self.is_active(&id) && active >= max {
            error!(trigger_id = %id, active, max, "running trigger quota exceeded");
            return false;
        }

        if let Err(e) = self.profile_db.store_trigger(&profile) {
            error!(trigger_id = %id, error = %e, "failed to persist trigger profile");
            return false;
        }
        self.activate(profile)
    }

    /// Instantiate, initialise and start a trigger.
    ///
    /// An active trigger with the same id is stopped first; its persisted
    /// profile is left alone. Failures are logged and reported as `false`.
    pub fn add_trigger(&self, profile: TriggerProfile) -> bool {
        let _submission = self.submission_slot();
        self.activate(profile)
    }

    fn activate(&self, profile: TriggerProfile) -> bool {
        let Some(id) = profile.trigger_id() else {
            error!("trigger profile has no id");
            return false;
        };

        if self.stop_trigger(&id).is_some() {
            warn!(trigger_id = %id, "trigger already active, restarted with new profile");
        }

        let trigger = match self.start_trigger(&id, profile) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(trigger_id = %id, error = %e, "failed to start trigger");
                return false;
            }
        };

        let kind = trigger.trigger_profile().trigger_kind().unwrap_or_default();
        let replaced = self.triggers_mut().insert(id.clone(), trigger);
        if let Some(old) = replaced {
            warn!(trigger_id = %id, "replaced a concurrently added trigger");
            destroy_quietly(&id, old.as_ref());
        }
        info!(trigger_id = %id, kind = %kind, "trigger started");
        true
    }

    fn start_trigger(&self, id: &str, profile: TriggerProfile) -> Result<Arc<dyn Trigger>> {
        let mut trigger = self.registry.create(&profile)?;
        let started = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            trigger.init(profile)?;
            trigger.run()
        }))
        .unwrap_or_else(|_| Err(AgentError::Panicked(id.to_string())));

        if let Err(e) = started {
            destroy_quietly(id, trigger.as_ref());
            return Err(e);
        }
        Ok(Arc::from(trigger))
    }

    /// Remove an active trigger from the map, delete its jobs and destroy it.
    fn stop_trigger(&self, id: &str) -> Option<Arc<dyn Trigger>> {
        let trigger = self.triggers_mut().remove(id)?;
        self.delete_related_jobs(id);
        destroy_quietly(id, trigger.as_ref());
        Some(trigger)
    }

    /// Stop a trigger, delete its jobs and forget its persisted profile and
    /// file bookmarks.
    ///
    /// Unknown ids return `false`.
    pub fn delete_trigger(&self, id: &str) -> bool {
        let _submission = self.submission_slot();
        let stopped = self.stop_trigger(id).is_some();
        if let Err(e) = self.bookmarks.clear(id) {
            warn!(trigger_id = %id, error = %e, "failed to clear file bookmarks");
        }
        match self.profile_db.delete_trigger(id) {
            Ok(true) if !stopped => {
                warn!(trigger_id = %id, "removed persisted profile of inactive trigger");
            }
            Ok(_) => {}
            Err(e) => error!(trigger_id = %id, error = %e, "failed to remove persisted trigger profile"),
        }
        if !stopped {
            warn!(trigger_id = %id, "delete requested for unknown trigger");
            return false;
        }
        info!(trigger_id = %id, "trigger deleted");
        true
    }

    fn delete_related_jobs(&self, id: &str) {
        let instance_ids = self.index().remove(id).unwrap_or_default();
        for instance_id in instance_ids {
            if self.job_manager.delete_job(&instance_id) {
                debug!(trigger_id = %id, instance_id = %instance_id, "related job deleted");
            } else {
                debug!(trigger_id = %id, instance_id = %instance_id, "related job already gone");
            }
        }
    }

    pub fn trigger(&self, id: &str) -> Option<Arc<dyn Trigger>> {
        self.triggers().get(id).cloned()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.triggers().contains_key(id)
    }

    /// Active trigger ids, sorted.
    pub fn trigger_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.triggers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.triggers().len()
    }

    /// Job instance ids currently attributed to a trigger.
    pub fn related_jobs(&self, id: &str) -> HashSet<String> {
        self.index().get(id).cloned().unwrap_or_default()
    }

    /// One pass of the job-fetch loop. Returns the number of jobs submitted.
    pub fn fetch_once(&self) -> usize {
        let snapshot: Vec<(String, Arc<dyn Trigger>)> = self
            .triggers()
            .iter()
            .map(|(id, trigger)| (id.clone(), trigger.clone()))
            .collect();

        let mut submitted = 0;
        for (id, trigger) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| self.poll_trigger(&id, &trigger))) {
                Ok(Ok(true)) => submitted += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => error!(trigger_id = %id, error = %e, "failed to submit job"),
                Err(_) => error!(trigger_id = %id, "trigger panicked while polled"),
            }
        }
        submitted
    }

    fn poll_trigger(&self, id: &str, trigger: &Arc<dyn Trigger>) -> Result<bool> {
        let Some(mut job) = trigger.fetch_job_profile() else {
            return Ok(false);
        };
        let instance_id = match job.instance_id() {
            Some(instance_id) => instance_id,
            None => {
                let instance_id = Uuid::new_v4().to_string();
                job.set(keys::JOB_INSTANCE_ID, instance_id.clone());
                instance_id
            }
        };

        // A replaced instance must not clear jobs of its successor
        if trigger.trigger_profile().only_one_job() && self.is_current(id, trigger) {
            self.delete_related_jobs(id);
        }
        self.job_manager.submit_job_profile(job)?;

        let recorded = {
            let mut index = self.index();
            // The trigger may have been deleted or replaced mid-poll
            let current = self.is_current(id, trigger);
            if current {
                index
                    .entry(id.to_string())
                    .or_default()
                    .insert(instance_id.clone());
            }
            current
        };

        if !recorded {
            debug!(trigger_id = %id, instance_id = %instance_id, "trigger gone, discarding job");
            self.job_manager.delete_job(&instance_id);
            return Ok(false);
        }
        debug!(trigger_id = %id, instance_id = %instance_id, "job submitted");
        Ok(true)
    }

    /// One pass of the reconciliation loop. Returns the number of pruned ids.
    ///
    /// Never deletes jobs; only drops bookkeeping for jobs that are gone.
    pub fn reconcile_once(&self) -> usize {
        let recorded: Vec<(String, Vec<String>)> = self
            .index()
            .iter()
            .map(|(id, jobs)| (id.clone(), jobs.iter().cloned().collect()))
            .collect();
        let live = self.job_manager.jobs();

        let mut pruned = 0;
        let mut index = self.index();
        for (id, instance_ids) in recorded {
            let Some(jobs) = index.get_mut(&id) else {
                continue;
            };
            for instance_id in instance_ids {
                if !live.contains_key(&instance_id) && jobs.remove(&instance_id) {
                    debug!(trigger_id = %id, instance_id = %instance_id, "pruned finished job");
                    pruned += 1;
                }
            }
        }
        index.retain(|_, jobs| !jobs.is_empty());
        pruned
    }

    /// Re-activate persisted triggers and start both workers.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers_slot();
        if workers.is_some() {
            return Err(AgentError::InvalidState(
                "trigger manager already started".to_string(),
            ));
        }

        let profiles = self.profile_db.triggers()?;
        let restored = profiles.len();
        for profile in profiles {
            let id = profile.trigger_id().unwrap_or_default();
            if !self.add_trigger(profile) {
                warn!(trigger_id = %id, "failed to restore persisted trigger");
            }
        }

        let mut group = WorkerGroup::new();
        let fetch = Arc::downgrade(self);
        group.spawn_periodic("trigger-fetch", self.conf.trigger_fetch_interval(), move || {
            if let Some(manager) = fetch.upgrade() {
                manager.fetch_once();
            }
            Ok(())
        })?;
        let check = Arc::downgrade(self);
        group.spawn_periodic("trigger-job-check", self.conf.job_check_interval(), move || {
            if let Some(manager) = check.upgrade() {
                manager.reconcile_once();
            }
            Ok(())
        })?;
        *workers = Some(group);

        info!(
            restored,
            active = self.active_count(),
            "trigger manager started"
        );
        Ok(())
    }

    /// Stop both workers and destroy every active trigger.
    ///
    /// Persisted profiles are kept so the next `start` restores them.
    pub fn stop(&self) {
        let group = self.workers_slot().take();
        if let Some(mut group) = group {
            group.stop();
        }

        let _submission = self.submission_slot();
        let drained: Vec<(String, Arc<dyn Trigger>)> = self.triggers_mut().drain().collect();
        let stopped = drained.len();
        for (id, trigger) in drained {
            destroy_quietly(&id, trigger.as_ref());
        }
        self.index().clear();
        info!(stopped, "trigger manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.workers_slot().is_some()
    }

    fn is_current(&self, id: &str, trigger: &Arc<dyn Trigger>) -> bool {
        self.triggers()
            .get(id)
            .map_or(false, |active| same_trigger(active, trigger))
    }

    fn submission_slot(&self) -> MutexGuard<'_, ()> {
        self.submissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn triggers(&self) -> RwLockReadGuard<'_, TriggerMap> {
        self.triggers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn triggers_mut(&self) -> RwLockWriteGuard<'_, TriggerMap> {
        self.triggers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn index(&self) -> MutexGuard<'_, JobIndex> {
        self.trigger_jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn workers_slot(&self) -> MutexGuard<'_, Option<WorkerGroup>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn same_trigger(a: &Arc<dyn Trigger>, b: &Arc<dyn Trigger>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn destroy_quietly(id: &str, trigger: &dyn Trigger) {
    if panic::catch_unwind(AssertUnwindSafe(|| trigger.destroy())).is_err() {
        error!(trigger_id = %id, "trigger panicked while destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::InMemoryJobManager;
    use courier_conf::JobProfile;
    use courier_db::SqliteDb;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;

    /// Hands out a fixed queue of jobs.
    struct QueueTrigger {
        profile: TriggerProfile,
        queue: Mutex<VecDeque<String>>,
    }

    impl Trigger for QueueTrigger {
        fn init(&mut self, profile: TriggerProfile) -> Result<()> {
            self.profile = profile;
            Ok(())
        }

        fn run(&mut self) -> Result<()> {
            Ok(())
        }

        fn fetch_job_profile(&self) -> Option<JobProfile> {
            let instance_id = self.queue.lock().unwrap().pop_front()?;
            Some(JobProfile::from_trigger(&self.profile, instance_id))
        }

        fn trigger_profile(&self) -> &TriggerProfile {
            &self.profile
        }

        fn destroy(&self) {}
    }

    /// Emits a single job. An instance handed a gate signals once it is
    /// inside `fetch_job_profile` and parks there until released.
    struct GatedTrigger {
        profile: TriggerProfile,
        job: String,
        gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
        emitted: AtomicBool,
    }

    impl Trigger for GatedTrigger {
        fn init(&mut self, profile: TriggerProfile) -> Result<()> {
            self.profile = profile;
            Ok(())
        }

        fn run(&mut self) -> Result<()> {
            Ok(())
        }

        fn fetch_job_profile(&self) -> Option<JobProfile> {
            if self.emitted.swap(true, Ordering::SeqCst) {
                return None;
            }
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered, release)) = gate {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
            Some(JobProfile::from_trigger(&self.profile, self.job.clone()))
        }

        fn trigger_profile(&self) -> &TriggerProfile {
            &self.profile
        }

        fn destroy(&self) {}
    }

    fn manager(jobs: &[&str]) -> (TriggerManager, Arc<InMemoryJobManager>) {
        let job_manager = Arc::new(InMemoryJobManager::new());
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let queued: Vec<String> = jobs.iter().map(|s| s.to_string()).collect();
        let mut registry = TriggerRegistry::new();
        registry.register("queue", move || {
            Box::new(QueueTrigger {
                profile: TriggerProfile::new(),
                queue: Mutex::new(queued.iter().cloned().collect()),
            })
        });
        let manager = TriggerManager::new(Arc::new(AgentConf::new()), job_manager.clone(), db)
            .with_registry(registry);
        (manager, job_manager)
    }

    fn profile(id: &str, only_one_job: bool) -> TriggerProfile {
        let mut profile = TriggerProfile::new();
        profile.set(keys::JOB_ID, id);
        profile.set(keys::JOB_TRIGGER, "queue");
        profile.set_bool(keys::TRIGGER_ONLY_ONE_JOB, only_one_job);
        profile
    }

    #[test]
    fn test_fetch_indexes_jobs() {
        let (manager, jobs) = manager(&["a", "b"]);
        assert!(manager.submit_trigger(profile("t1", false)));

        assert_eq!(manager.fetch_once(), 1);
        assert_eq!(manager.fetch_once(), 1);
        assert_eq!(manager.fetch_once(), 0);

        let related = manager.related_jobs("t1");
        assert!(related.contains("a") && related.contains("b"));
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn test_only_one_job_deletes_previous() {
        let (manager, jobs) = manager(&["a", "b"]);
        assert!(manager.submit_trigger(profile("t1", true)));

        manager.fetch_once();
        assert!(jobs.contains("a"));
        manager.fetch_once();
        assert!(!jobs.contains("a"));
        assert!(jobs.contains("b"));
        assert_eq!(manager.related_jobs("t1"), HashSet::from(["b".to_string()]));
    }

    #[test]
    fn test_reconcile_prunes_finished_jobs() {
        let (manager, jobs) = manager(&["a", "b"]);
        assert!(manager.submit_trigger(profile("t1", false)));
        manager.fetch_once();
        manager.fetch_once();

        jobs.complete_job("a");
        assert_eq!(manager.reconcile_once(), 1);
        assert_eq!(manager.related_jobs("t1"), HashSet::from(["b".to_string()]));
        assert!(jobs.contains("b"));

        jobs.complete_job("b");
        assert_eq!(manager.reconcile_once(), 1);
        assert!(manager.related_jobs("t1").is_empty());
        assert_eq!(manager.reconcile_once(), 0);
    }

    #[test]
    fn test_delete_trigger_deletes_related_jobs() {
        let (manager, jobs) = manager(&["a"]);
        assert!(manager.submit_trigger(profile("t1", false)));
        manager.fetch_once();
        assert!(jobs.contains("a"));

        assert!(manager.delete_trigger("t1"));
        assert!(jobs.is_empty());
        assert!(manager.profile_db().get_trigger("t1").unwrap().is_none());
        assert!(!manager.delete_trigger("t1"));
    }

    #[test]
    fn test_same_trigger_compares_identity() {
        let (manager, _) = manager(&[]);
        assert!(manager.submit_trigger(profile("t1", false)));
        let first = manager.trigger("t1").unwrap();
        assert!(same_trigger(&first, &manager.trigger("t1").unwrap()));

        assert!(manager.submit_trigger(profile("t1", false)));
        assert!(!same_trigger(&first, &manager.trigger("t1").unwrap()));
    }

    #[test]
    fn test_replaced_trigger_keeps_successor_jobs() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Mutex::new(Some((entered_tx, release_rx)));
        let built = AtomicUsize::new(0);
        let mut registry = TriggerRegistry::new();
        registry.register("gated", move || {
            let n = built.fetch_add(1, Ordering::SeqCst);
            Box::new(GatedTrigger {
                profile: TriggerProfile::new(),
                job: format!("job-{}", n),
                gate: Mutex::new(gate.lock().unwrap().take()),
                emitted: AtomicBool::new(false),
            })
        });
        let job_manager = Arc::new(InMemoryJobManager::new());
        let db: Arc<dyn Db> = Arc::new(SqliteDb::open_in_memory().unwrap());
        let manager = Arc::new(
            TriggerManager::new(Arc::new(AgentConf::new()), job_manager.clone(), db)
                .with_registry(registry),
        );
        let gated = || {
            let mut profile = profile("t1", true);
            profile.set(keys::JOB_TRIGGER, "gated");
            profile
        };
        assert!(manager.submit_trigger(gated()));

        let poller = {
            let manager = manager.clone();
            thread::spawn(move || manager.fetch_once())
        };
        entered_rx.recv().unwrap();

        // Re-arm while the first instance is still inside its fetch
        assert!(manager.submit_trigger(gated()));
        assert_eq!(manager.fetch_once(), 1);
        assert!(job_manager.contains("job-1"));

        release_tx.send(()).unwrap();
        assert_eq!(poller.join().unwrap(), 0);

        assert!(job_manager.contains("job-1"));
        assert!(!job_manager.contains("job-0"));
        assert_eq!(
            manager.related_jobs("t1"),
            HashSet::from(["job-1".to_string()])
        );
    }
}
