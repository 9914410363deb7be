//! Entities persisted by the local store.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processing state recorded alongside a key/value entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateSearchKey {
    Success,
    Failed,
    Running,
    Accepted,
}

impl StateSearchKey {
    pub const ALL: [StateSearchKey; 4] = [
        StateSearchKey::Success,
        StateSearchKey::Failed,
        StateSearchKey::Running,
        StateSearchKey::Accepted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Running => "RUNNING",
            Self::Accepted => "ACCEPTED",
        }
    }
}

impl fmt::Display for StateSearchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateSearchKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "RUNNING" => Ok(Self::Running),
            "ACCEPTED" => Ok(Self::Accepted),
            other => Err(format!("unknown state: {}", other)),
        }
    }
}

impl ToSql for StateSearchKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for StateSearchKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Generic durable state, e.g. trigger profiles or file read offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueEntity {
    pub key: String,
    pub state: StateSearchKey,
    /// Opaque payload, usually JSON.
    pub value: String,
    pub file_name: Option<String>,
}

impl KeyValueEntity {
    pub fn new(key: impl Into<String>, value: impl Into<String>, state: StateSearchKey) -> Self {
        Self {
            key: key.into(),
            state,
            value: value.into(),
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// An instruction delivered to the agent, tracked until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntity {
    pub id: String,
    pub command_result: i32,
    pub acked: bool,
    pub task_id: String,
    pub version: i32,
    pub delivery_time: DateTime<Utc>,
}

impl CommandEntity {
    /// New unacknowledged command delivered now.
    pub fn new(id: impl Into<String>, task_id: impl Into<String>, version: i32) -> Self {
        Self {
            id: id.into(),
            command_result: 0,
            acked: false,
            task_id: task_id.into(),
            version,
            delivery_time: Utc::now(),
        }
    }
}
