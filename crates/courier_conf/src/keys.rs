//! Recognized configuration keys and their defaults.

use std::time::Duration;

// Agent
pub const AGENT_HOME: &str = "agent.home";
pub const AGENT_LOCAL_STORE_PATH: &str = "agent.localStore.path";
pub const DEFAULT_LOCAL_STORE_FILE: &str = "localdb/agent.sqlite3";

// Trigger manager
pub const TRIGGER_MAX_RUNNING_NUM: &str = "trigger.max.running.num";
pub const DEFAULT_TRIGGER_MAX_RUNNING_NUM: i32 = 4096;
pub const TRIGGER_FETCH_INTERVAL: &str = "trigger.fetch.interval";
pub const DEFAULT_TRIGGER_FETCH_INTERVAL: Duration = Duration::from_secs(1);
pub const TRIGGER_JOB_CHECK_INTERVAL: &str = "trigger.job.check.interval";
pub const DEFAULT_TRIGGER_JOB_CHECK_INTERVAL: Duration = Duration::from_secs(60);

// Job / trigger profiles
pub const JOB_ID: &str = "job.id";
pub const JOB_INSTANCE_ID: &str = "job.instance.id";
pub const JOB_NAME: &str = "job.name";
pub const JOB_TRIGGER: &str = "job.trigger";
pub const TRIGGER_ONLY_ONE_JOB: &str = "job.trigger.onlyOneJob";

// Directory trigger
pub const JOB_DIR_FILTER_PATTERN: &str = "job.fileJob.dir.pattern";
pub const JOB_DIR_SKIP_EXISTING: &str = "job.fileJob.dir.skipExisting";
pub const JOB_FILE_SCAN_INTERVAL: &str = "job.fileJob.scan.interval";
pub const DEFAULT_JOB_FILE_SCAN_INTERVAL: Duration = Duration::from_secs(1);
pub const JOB_FILE_PATH: &str = "job.fileJob.path";
