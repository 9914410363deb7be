//! Directory trigger: polls a glob pattern and emits one job per new or
//! modified file.
//!
//! Polling instead of OS watch APIs keeps behaviour identical on every
//! platform and on network mounts. With a bookmark store attached, files
//! already turned into jobs are not emitted again after a restart.

use super::Trigger;
use crate::db::FileBookmarkDb;
use crate::error::{AgentError, Result};
use crate::signal::StopSignal;
use courier_conf::{keys, JobProfile, TriggerProfile};
use glob::{MatchOptions, Pattern};
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// What to watch, resolved from the trigger profile.
#[derive(Debug, Clone)]
struct WatchSpec {
    pattern: Pattern,
    base_dir: PathBuf,
    /// Pattern has no directory part, so walked paths are matched relative
    /// to the working directory.
    relative_to_base: bool,
    /// `None` when the pattern contains `**`.
    max_depth: Option<usize>,
    interval: Duration,
    skip_existing: bool,
}

impl WatchSpec {
    fn from_profile(profile: &TriggerProfile) -> Result<Self> {
        let id = profile.trigger_id().unwrap_or_default();
        let raw = profile.get(keys::JOB_DIR_FILTER_PATTERN)?;
        let pattern = Pattern::new(&raw)
            .map_err(|e| AgentError::trigger(&id, format!("bad pattern {}: {}", raw, e)))?;
        let (base_dir, max_depth) = split_pattern(&raw);
        let relative_to_base = base_dir.is_none();
        let base_dir = base_dir.unwrap_or_else(|| PathBuf::from("."));

        if !base_dir.is_dir() {
            return Err(AgentError::trigger(
                &id,
                format!("watch directory {} does not exist", base_dir.display()),
            ));
        }

        Ok(Self {
            pattern,
            base_dir,
            relative_to_base,
            max_depth,
            interval: profile.get_interval_secs_or(
                keys::JOB_FILE_SCAN_INTERVAL,
                keys::DEFAULT_JOB_FILE_SCAN_INTERVAL,
            ),
            skip_existing: profile.get_bool_or(keys::JOB_DIR_SKIP_EXISTING, false),
        })
    }

    fn matches(&self, path: &Path) -> bool {
        let candidate = if self.relative_to_base {
            path.strip_prefix(&self.base_dir).unwrap_or(path)
        } else {
            path
        };
        self.pattern.matches_path_with(candidate, MATCH_OPTIONS)
    }
}

fn has_glob_chars(segment: &str) -> bool {
    segment.contains(&['*', '?', '['][..])
}

/// Longest literal directory prefix of a pattern and the walk depth below it.
///
/// The prefix is `None` when the pattern starts with a glob segment.
fn split_pattern(raw: &str) -> (Option<PathBuf>, Option<usize>) {
    let components: Vec<Component<'_>> = Path::new(raw).components().collect();
    let literal_len = components
        .iter()
        .position(|c| has_glob_chars(&c.as_os_str().to_string_lossy()))
        .unwrap_or(components.len());

    // A literal file path watches its parent directory
    let literal_len = if literal_len == components.len() {
        literal_len.saturating_sub(1)
    } else {
        literal_len
    };

    let base: PathBuf = components[..literal_len].iter().collect();
    let base = if base.as_os_str().is_empty() {
        None
    } else {
        Some(base)
    };

    let rest = &components[literal_len..];
    let recursive = rest
        .iter()
        .any(|c| c.as_os_str().to_string_lossy().contains("**"));
    let max_depth = if recursive { None } else { Some(rest.len()) };
    (base, max_depth)
}

/// Tracks modification times between scans.
struct DirectoryScanner {
    spec: WatchSpec,
    seen: HashMap<PathBuf, SystemTime>,
    trigger_id: String,
    bookmarks: Option<FileBookmarkDb>,
}

impl DirectoryScanner {
    fn new(spec: WatchSpec) -> Self {
        Self {
            spec,
            seen: HashMap::new(),
            trigger_id: String::new(),
            bookmarks: None,
        }
    }

    fn with_bookmarks(mut self, trigger_id: String, bookmarks: Option<FileBookmarkDb>) -> Self {
        self.trigger_id = trigger_id;
        self.bookmarks = bookmarks;
        self
    }

    // Only files this scanner has not seen yet consult the store
    fn already_emitted(&self, path: &Path, modified: SystemTime) -> bool {
        let Some(bookmarks) = &self.bookmarks else {
            return false;
        };
        match bookmarks.is_recorded(&self.trigger_id, path, modified) {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!(trigger_id = %self.trigger_id, path = %path.display(), error = %e, "bookmark lookup failed");
                false
            }
        }
    }

    /// Files that are new or whose mtime changed since the last scan, sorted.
    fn scan(&mut self) -> Vec<(PathBuf, SystemTime)> {
        let mut walker = WalkDir::new(&self.spec.base_dir).follow_links(false);
        if let Some(depth) = self.spec.max_depth {
            walker = walker.max_depth(depth);
        }

        let mut current = HashMap::with_capacity(self.seen.len());
        let mut changed = Vec::new();
        for entry in walker.into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.spec.matches(entry.path()) {
                continue;
            }
            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(modified)) => modified,
                _ => continue,
            };
            let path = entry.into_path();
            let is_new = match self.seen.get(&path) {
                Some(previous) => *previous != modified,
                None => !self.already_emitted(&path, modified),
            };
            if is_new {
                changed.push((path.clone(), modified));
            }
            current.insert(path, modified);
        }

        // Vanished files are forgotten so a recreated file fires again
        self.seen = current;
        changed.sort();
        changed
    }
}

struct ScanState {
    pending: Mutex<VecDeque<(PathBuf, SystemTime)>>,
    stop: StopSignal,
}

impl ScanState {
    fn pending(&self) -> MutexGuard<'_, VecDeque<(PathBuf, SystemTime)>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Trigger kind `directory`.
pub struct DirectoryTrigger {
    profile: TriggerProfile,
    spec: Option<WatchSpec>,
    bookmarks: Option<FileBookmarkDb>,
    state: Arc<ScanState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryTrigger {
    pub const KIND: &'static str = "directory";

    pub fn new() -> Self {
        Self {
            profile: TriggerProfile::new(),
            spec: None,
            bookmarks: None,
            state: Arc::new(ScanState {
                pending: Mutex::new(VecDeque::new()),
                stop: StopSignal::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Remember emitted files in `bookmarks` so restarts do not repeat them.
    pub fn with_bookmarks(mut self, bookmarks: FileBookmarkDb) -> Self {
        self.bookmarks = Some(bookmarks);
        self
    }

    fn trigger_id(&self) -> String {
        self.profile.trigger_id().unwrap_or_default()
    }

    /// Files detected but not yet fetched.
    pub fn pending_len(&self) -> usize {
        self.state.pending().len()
    }
}

impl Default for DirectoryTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for DirectoryTrigger {
    fn init(&mut self, profile: TriggerProfile) -> Result<()> {
        let spec = WatchSpec::from_profile(&profile)?;
        debug!(
            trigger_id = ?profile.trigger_id(),
            base_dir = %spec.base_dir.display(),
            max_depth = ?spec.max_depth,
            "directory trigger initialised"
        );
        self.profile = profile;
        self.spec = Some(spec);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let id = self.trigger_id();
        let spec = self
            .spec
            .clone()
            .ok_or_else(|| AgentError::trigger(&id, "run before init"))?;
        if self.state.stop.is_stopped() {
            return Err(AgentError::trigger(&id, "trigger already destroyed"));
        }

        let interval = spec.interval;
        let mut scanner =
            DirectoryScanner::new(spec).with_bookmarks(id.clone(), self.bookmarks.clone());
        let state = self.state.clone();
        let thread_id = id.clone();
        let handle = thread::Builder::new()
            .name(format!("dir-trigger-{}", id))
            .spawn(move || {
                if scanner.spec.skip_existing {
                    let existing = scanner.scan().len();
                    debug!(trigger_id = %thread_id, existing, "skipping existing files");
                    if state.stop.wait_timeout(interval) {
                        return;
                    }
                }
                loop {
                    let found = scanner.scan();
                    if !found.is_empty() {
                        debug!(trigger_id = %thread_id, files = found.len(), "files detected");
                        state.pending().extend(found);
                    }
                    if state.stop.wait_timeout(interval) {
                        break;
                    }
                }
            })?;

        *self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        info!(trigger_id = %id, interval_ms = interval.as_millis() as u64, "directory trigger running");
        Ok(())
    }

    fn fetch_job_profile(&self) -> Option<JobProfile> {
        if self.state.stop.is_stopped() {
            return None;
        }
        let (path, modified) = self.state.pending().pop_front()?;
        if let Some(bookmarks) = &self.bookmarks {
            if let Err(e) = bookmarks.record(&self.trigger_id(), &path, modified) {
                warn!(trigger_id = %self.trigger_id(), path = %path.display(), error = %e, "failed to record file bookmark");
            }
        }
        let mut job = JobProfile::from_trigger(&self.profile, Uuid::new_v4().to_string());
        job.set(keys::JOB_FILE_PATH, path.to_string_lossy());
        Some(job)
    }

    fn trigger_profile(&self) -> &TriggerProfile {
        &self.profile
    }

    fn destroy(&self) {
        self.state.stop.stop();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(trigger_id = %self.trigger_id(), "scan thread panicked");
            }
            info!(trigger_id = %self.trigger_id(), "directory trigger destroyed");
        }
        self.state.pending().clear();
    }
}

impl Drop for DirectoryTrigger {
    fn drop(&mut self) {
        self.destroy();
    }
}
