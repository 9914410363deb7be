//! Directory trigger detection behaviour.

use courier::{DirectoryTrigger, Trigger};
use courier_conf::{keys, JobProfile, TriggerProfile};
use filetime::{set_file_mtime, FileTime};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn profile(dir: &Path, skip_existing: bool) -> TriggerProfile {
    let mut profile = TriggerProfile::new();
    profile.set(keys::JOB_ID, "inbox");
    profile.set(keys::JOB_TRIGGER, DirectoryTrigger::KIND);
    profile.set(
        keys::JOB_DIR_FILTER_PATTERN,
        format!("{}/*.csv", dir.display()),
    );
    profile.set(keys::JOB_FILE_SCAN_INTERVAL, "0.02");
    profile.set_bool(keys::JOB_DIR_SKIP_EXISTING, skip_existing);
    profile
}

fn started(dir: &Path, skip_existing: bool) -> DirectoryTrigger {
    let mut trigger = DirectoryTrigger::new();
    trigger.init(profile(dir, skip_existing)).unwrap();
    trigger.run().unwrap();
    trigger
}

fn next_job(trigger: &DirectoryTrigger, timeout: Duration) -> Option<JobProfile> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(job) = trigger.fetch_job_profile() {
            return Some(job);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn file_path(job: &JobProfile) -> String {
    job.get(keys::JOB_FILE_PATH).unwrap()
}

#[test]
fn test_emits_existing_and_new_files_once() {
    let tmp = TempDir::new().unwrap();
    let existing = tmp.path().join("existing.csv");
    fs::write(&existing, "1").unwrap();

    let trigger = started(tmp.path(), false);
    let first = next_job(&trigger, Duration::from_secs(5)).unwrap();
    assert_eq!(file_path(&first), existing.to_string_lossy());
    assert_eq!(first.job_id().as_deref(), Some("inbox"));

    let created = tmp.path().join("created.csv");
    fs::write(&created, "2").unwrap();
    let second = next_job(&trigger, Duration::from_secs(5)).unwrap();
    assert_eq!(file_path(&second), created.to_string_lossy());
    assert_ne!(first.instance_id(), second.instance_id());

    thread::sleep(Duration::from_millis(100));
    assert!(trigger.fetch_job_profile().is_none());
    trigger.destroy();
}

#[test]
fn test_skip_existing_ignores_files_present_at_start() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("old.csv"), "1").unwrap();

    let trigger = started(tmp.path(), true);
    thread::sleep(Duration::from_millis(100));
    assert!(trigger.fetch_job_profile().is_none());

    let fresh = tmp.path().join("fresh.csv");
    fs::write(&fresh, "2").unwrap();
    let job = next_job(&trigger, Duration::from_secs(5)).unwrap();
    assert_eq!(file_path(&job), fresh.to_string_lossy());
}

#[test]
fn test_modified_file_emits_again() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data.csv");
    fs::write(&data, "v1").unwrap();
    set_file_mtime(&data, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

    let trigger = started(tmp.path(), false);
    assert!(next_job(&trigger, Duration::from_secs(5)).is_some());

    set_file_mtime(&data, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    let job = next_job(&trigger, Duration::from_secs(5)).unwrap();
    assert_eq!(file_path(&job), data.to_string_lossy());
}

#[test]
fn test_destroy_stops_emission() {
    let tmp = TempDir::new().unwrap();
    let trigger = started(tmp.path(), false);
    trigger.destroy();
    trigger.destroy();

    fs::write(tmp.path().join("late.csv"), "x").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(trigger.fetch_job_profile().is_none());
    assert_eq!(trigger.pending_len(), 0);
}

#[test]
fn test_destroy_concurrent_with_fetch() {
    let tmp = TempDir::new().unwrap();
    for n in 0..50 {
        fs::write(tmp.path().join(format!("f{}.csv", n)), "x").unwrap();
    }
    let trigger = Arc::new(started(tmp.path(), false));

    let fetchers: Vec<_> = (0..4)
        .map(|_| {
            let trigger = trigger.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    if let Some(job) = trigger.fetch_job_profile() {
                        seen.push(file_path(&job));
                    }
                }
                seen
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(5));
    trigger.destroy();

    let mut all = Vec::new();
    for fetcher in fetchers {
        all.extend(fetcher.join().unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(unique.len(), all.len(), "a file was emitted twice");
    assert!(trigger.fetch_job_profile().is_none());
}

#[test]
fn test_run_before_init_fails() {
    let mut trigger = DirectoryTrigger::new();
    assert!(trigger.run().is_err());
    trigger.destroy();
}
