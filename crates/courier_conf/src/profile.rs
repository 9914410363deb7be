//! Configuration specializations: agent settings, trigger and job profiles.

use crate::configuration::{Configuration, SourceFormat};
use crate::error::Result;
use crate::keys;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// A configuration that knows which keys it cannot do without.
pub trait Profile {
    fn required_keys(&self) -> &'static [&'static str];

    fn configuration(&self) -> &Configuration;

    fn all_required_key_exist(&self) -> bool {
        let conf = self.configuration();
        self.required_keys().iter().all(|key| conf.has_key(key))
    }

    /// Required keys that are not stored, for diagnostics.
    fn missing_keys(&self) -> Vec<&'static str> {
        let conf = self.configuration();
        self.required_keys()
            .iter()
            .copied()
            .filter(|key| !conf.has_key(key))
            .collect()
    }
}

macro_rules! configuration_newtype {
    ($name:ident) => {
        impl Deref for $name {
            type Target = Configuration;

            fn deref(&self) -> &Configuration {
                &self.conf
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Configuration {
                &mut self.conf
            }
        }

        impl From<Configuration> for $name {
            fn from(conf: Configuration) -> Self {
                Self { conf }
            }
        }
    };
}

/// Process-wide agent settings.
///
/// Built once at startup and shared by handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentConf {
    conf: Configuration,
}

configuration_newtype!(AgentConf);

impl AgentConf {
    const CONF_FILES: [(&'static str, SourceFormat); 3] = [
        ("agent.properties", SourceFormat::Properties),
        ("agent.json", SourceFormat::Json),
        ("agent.toml", SourceFormat::Toml),
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Load `agent.properties`, `agent.json` and `agent.toml` from `home`
    /// when present. Later files override earlier ones.
    pub fn load_home(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref();
        let mut conf = Configuration::new();
        for (file, format) in Self::CONF_FILES {
            let path = home.join(file);
            if path.is_file() {
                conf.load(&path, format);
            }
        }
        conf.set(keys::AGENT_HOME, home.to_string_lossy());
        debug!(home = %home.display(), entries = conf.len(), "agent configuration loaded");
        Self { conf }
    }

    pub fn home(&self) -> PathBuf {
        PathBuf::from(self.conf.get_or(keys::AGENT_HOME, "."))
    }

    /// Path of the local store, relative paths resolved against the home.
    pub fn local_store_path(&self) -> PathBuf {
        match self.conf.get_opt(keys::AGENT_LOCAL_STORE_PATH) {
            Some(path) => {
                let path = PathBuf::from(path);
                if path.is_absolute() {
                    path
                } else {
                    self.home().join(path)
                }
            }
            None => self.home().join(keys::DEFAULT_LOCAL_STORE_FILE),
        }
    }

    pub fn trigger_max_running_num(&self) -> usize {
        let max = self.conf.get_int_or(
            keys::TRIGGER_MAX_RUNNING_NUM,
            keys::DEFAULT_TRIGGER_MAX_RUNNING_NUM,
        );
        usize::try_from(max).unwrap_or(0)
    }

    pub fn trigger_fetch_interval(&self) -> Duration {
        self.conf.get_interval_secs_or(
            keys::TRIGGER_FETCH_INTERVAL,
            keys::DEFAULT_TRIGGER_FETCH_INTERVAL,
        )
    }

    pub fn job_check_interval(&self) -> Duration {
        self.conf.get_interval_secs_or(
            keys::TRIGGER_JOB_CHECK_INTERVAL,
            keys::DEFAULT_TRIGGER_JOB_CHECK_INTERVAL,
        )
    }
}

impl Profile for AgentConf {
    fn required_keys(&self) -> &'static [&'static str] {
        &[keys::AGENT_HOME]
    }

    fn configuration(&self) -> &Configuration {
        &self.conf
    }
}

/// Describes one trigger; identified by `job.id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerProfile {
    conf: Configuration,
}

configuration_newtype!(TriggerProfile);

impl TriggerProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a profile from JSON, nested or already flat.
    pub fn parse_json_str(text: &str) -> Result<Self> {
        let mut conf = Configuration::new();
        conf.load_from_text(text)?;
        Ok(Self { conf })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let format = SourceFormat::from_path(path).unwrap_or(SourceFormat::Json);
        let mut conf = Configuration::new();
        conf.load_from_str(&text, format)?;
        Ok(Self { conf })
    }

    pub fn trigger_id(&self) -> Option<String> {
        self.conf.get_opt(keys::JOB_ID)
    }

    /// Registered trigger kind name, e.g. `directory`.
    pub fn trigger_kind(&self) -> Option<String> {
        self.conf.get_opt(keys::JOB_TRIGGER)
    }

    pub fn only_one_job(&self) -> bool {
        self.conf.get_bool_or(keys::TRIGGER_ONLY_ONE_JOB, false)
    }
}

impl Profile for TriggerProfile {
    fn required_keys(&self) -> &'static [&'static str] {
        &[keys::JOB_ID, keys::JOB_TRIGGER]
    }

    fn configuration(&self) -> &Configuration {
        &self.conf
    }
}

/// One unit of work emitted by a trigger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobProfile {
    conf: Configuration,
}

configuration_newtype!(JobProfile);

impl JobProfile {
    /// Copy of the trigger's settings stamped with a fresh instance id.
    pub fn from_trigger(trigger: &TriggerProfile, instance_id: impl Into<String>) -> Self {
        let mut conf = trigger.configuration().clone();
        conf.set(keys::JOB_INSTANCE_ID, instance_id);
        Self { conf }
    }

    pub fn job_id(&self) -> Option<String> {
        self.conf.get_opt(keys::JOB_ID)
    }

    pub fn instance_id(&self) -> Option<String> {
        self.conf.get_opt(keys::JOB_INSTANCE_ID)
    }
}

impl Profile for JobProfile {
    fn required_keys(&self) -> &'static [&'static str] {
        &[keys::JOB_ID, keys::JOB_INSTANCE_ID]
    }

    fn configuration(&self) -> &Configuration {
        &self.conf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_trigger_profile_required_keys() {
        let profile =
            TriggerProfile::parse_json_str(r#"{"job":{"id":"t1","trigger":"directory"}}"#).unwrap();
        assert!(profile.all_required_key_exist());
        assert_eq!(profile.trigger_id().as_deref(), Some("t1"));
        assert_eq!(profile.trigger_kind().as_deref(), Some("directory"));
        assert!(!profile.only_one_job());

        let incomplete = TriggerProfile::parse_json_str(r#"{"job":{"id":"t1"}}"#).unwrap();
        assert!(!incomplete.all_required_key_exist());
        assert_eq!(incomplete.missing_keys(), vec![keys::JOB_TRIGGER]);
    }

    #[test]
    fn test_trigger_profile_flat_json_round_trip() {
        let mut profile = TriggerProfile::new();
        profile.set(keys::JOB_ID, "t1");
        profile.set(keys::JOB_TRIGGER, "directory");
        profile.set_bool(keys::TRIGGER_ONLY_ONE_JOB, true);

        let restored = TriggerProfile::parse_json_str(&profile.to_json_str()).unwrap();
        assert_eq!(restored, profile);
        assert!(restored.only_one_job());
    }

    #[test]
    fn test_trigger_profile_from_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t1.toml");
        std::fs::write(&path, "[job]\nid = \"t1\"\ntrigger = \"directory\"\n").unwrap();

        let profile = TriggerProfile::from_file(&path).unwrap();
        assert_eq!(profile.trigger_id().as_deref(), Some("t1"));
        assert!(profile.all_required_key_exist());
    }

    #[test]
    fn test_job_profile_from_trigger() {
        let mut trigger = TriggerProfile::new();
        trigger.set(keys::JOB_ID, "t1");
        trigger.set(keys::JOB_TRIGGER, "directory");

        let job = JobProfile::from_trigger(&trigger, "inst-1");
        assert!(job.all_required_key_exist());
        assert_eq!(job.job_id().as_deref(), Some("t1"));
        assert_eq!(job.instance_id().as_deref(), Some("inst-1"));
        assert!(!trigger.has_key(keys::JOB_INSTANCE_ID));
    }

    #[test]
    fn test_agent_conf_defaults() {
        let tmp = TempDir::new().unwrap();
        let conf = AgentConf::load_home(tmp.path());

        assert!(conf.all_required_key_exist());
        assert_eq!(conf.home(), tmp.path());
        assert_eq!(
            conf.local_store_path(),
            tmp.path().join(keys::DEFAULT_LOCAL_STORE_FILE)
        );
        assert_eq!(conf.trigger_max_running_num(), 4096);
        assert_eq!(conf.trigger_fetch_interval(), Duration::from_secs(1));
        assert_eq!(conf.job_check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_agent_conf_later_files_override() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("agent.properties"),
            "trigger.max.running.num=5\nagent.localStore.path=store/db.sqlite3\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("agent.json"),
            r#"{"trigger":{"max":{"running":{"num":7}},"fetch":{"interval":0.5}}}"#,
        )
        .unwrap();

        let conf = AgentConf::load_home(tmp.path());
        assert_eq!(conf.trigger_max_running_num(), 7);
        assert_eq!(conf.trigger_fetch_interval(), Duration::from_millis(500));
        assert_eq!(
            conf.local_store_path(),
            tmp.path().join("store").join("db.sqlite3")
        );
    }

    #[test]
    fn test_agent_conf_unusable_intervals_use_defaults() {
        let mut conf = AgentConf::new();
        conf.load_from_text(r#"{"trigger":{"fetch":{"interval":1e20},"job":{"check":{"interval":0}}}}"#)
            .unwrap();

        assert_eq!(conf.trigger_fetch_interval(), keys::DEFAULT_TRIGGER_FETCH_INTERVAL);
        assert_eq!(conf.job_check_interval(), keys::DEFAULT_TRIGGER_JOB_CHECK_INTERVAL);
    }
}
