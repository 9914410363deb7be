//! Flat key space built from nested configuration sources.

use crate::error::{ConfError, Result};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Format of a configuration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Nested JSON document
    Json,
    /// Nested TOML document
    Toml,
    /// Flat `key=value` lines
    Properties,
}

impl SourceFormat {
    /// Pick a format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            "properties" | "props" => Some(Self::Properties),
            _ => None,
        }
    }
}

/// A single stored scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl ConfValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(v) => Value::from(*v),
            Self::Float(v) => Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(v.to_string())),
            Self::Bool(b) => Value::Bool(*b),
        }
    }

    /// Integer view; numeric strings and whole floats convert.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    /// Boolean view; `"true"`/`"false"` strings convert case-insensitively.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::String(s) if s.trim().eq_ignore_ascii_case("true") => Some(true),
            Self::String(s) if s.trim().eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for ConfValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Flattened configuration store.
///
/// Only scalar leaves are stored. Keys are case-sensitive; array elements
/// are addressed by suffixing the parent key with `[index]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    storage: HashMap<String, ConfValue>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a source file into the store.
    ///
    /// A missing or malformed file is logged and leaves the store unchanged;
    /// callers check `all_required_key_exist()` afterwards.
    pub fn load(&mut self, path: impl AsRef<Path>, format: SourceFormat) {
        let path = path.as_ref();
        match self.try_load(path, format) {
            Ok(()) => debug!(path = %path.display(), ?format, "configuration source loaded"),
            Err(err) => error!(
                path = %path.display(),
                ?format,
                error = %err,
                "failed to load configuration source"
            ),
        }
    }

    fn try_load(&mut self, path: &Path, format: SourceFormat) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.load_from_str(&text, format)
    }

    /// Parse `text` in the given format and merge it into the store.
    ///
    /// The text is parsed completely before anything is inserted.
    pub fn load_from_str(&mut self, text: &str, format: SourceFormat) -> Result<()> {
        match format {
            SourceFormat::Json => {
                let root: Value = serde_json::from_str(text)?;
                self.update_from_value(&root);
            }
            SourceFormat::Toml => {
                let root: toml::Value = toml::from_str(text)?;
                self.update_from_value(&toml_to_json(root));
            }
            SourceFormat::Properties => {
                for (key, value) in parse_properties(text) {
                    self.storage.insert(key, ConfValue::String(value));
                }
            }
        }
        Ok(())
    }

    /// Flatten an in-memory JSON document into the store.
    pub fn load_from_text(&mut self, text: &str) -> Result<()> {
        let root: Value = serde_json::from_str(text)?;
        self.update_from_value(&root);
        Ok(())
    }

    /// Flatten an already parsed JSON value into the store.
    pub fn update_from_value(&mut self, root: &Value) {
        let mut path = HashMap::new();
        self.flatten(&mut path, 0, root);
    }

    // Arrays rewrite the parent segment in place (`key` -> `key[i]`) and
    // recurse at the same depth, so they never add a level of their own.
    fn flatten(&mut self, path: &mut HashMap<usize, String>, depth: usize, node: &Value) {
        match node {
            Value::Object(map) => {
                for (key, child) in map {
                    path.insert(depth, key.clone());
                    self.flatten(path, depth + 1, child);
                }
            }
            Value::Array(items) => match depth.checked_sub(1) {
                Some(parent) => {
                    let last_key = path.get(&parent).cloned().unwrap_or_default();
                    for (index, item) in items.iter().enumerate() {
                        path.insert(parent, format!("{}[{}]", last_key, index));
                        self.flatten(path, depth, item);
                    }
                }
                None => {
                    for item in items {
                        self.flatten(path, depth, item);
                    }
                }
            },
            Value::Null => {}
            scalar => {
                let key_chain = (0..depth)
                    .map(|i| path.get(&i).map(String::as_str).unwrap_or(""))
                    .collect::<Vec<_>>()
                    .join(".");
                if key_chain.trim().is_empty() {
                    return;
                }
                if let Some(value) = ConfValue::from_json(scalar) {
                    self.storage.insert(key_chain, value);
                }
            }
        }
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }

    pub fn get_value(&self, key: &str) -> Option<&ConfValue> {
        self.storage.get(key)
    }

    fn require(&self, key: &str) -> Result<&ConfValue> {
        self.storage
            .get(key)
            .ok_or_else(|| ConfError::missing_key(key))
    }

    fn or_default<T>(&self, key: &str, default: T, read: impl FnOnce(&Self) -> Result<T>) -> T {
        if !self.has_key(key) {
            return default;
        }
        match read(self) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "unreadable configuration value, using default");
                default
            }
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i32> {
        self.require(key)?
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| ConfError::invalid_value(key, "int"))
    }

    pub fn get_int_or(&self, key: &str, default: i32) -> i32 {
        self.or_default(key, default, |conf| conf.get_int(key))
    }

    pub fn get_long(&self, key: &str) -> Result<i64> {
        self.require(key)?
            .as_i64()
            .ok_or_else(|| ConfError::invalid_value(key, "long"))
    }

    pub fn get_long_or(&self, key: &str, default: i64) -> i64 {
        self.or_default(key, default, |conf| conf.get_long(key))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.require(key)?
            .as_bool()
            .ok_or_else(|| ConfError::invalid_value(key, "boolean"))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.or_default(key, default, |conf| conf.get_bool(key))
    }

    /// String view of any stored scalar.
    pub fn get(&self, key: &str) -> Result<String> {
        self.require(key).map(ToString::to_string)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.storage
            .get(key)
            .map(ToString::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_opt(&self, key: &str) -> Option<String> {
        self.storage.get(key).map(ToString::to_string)
    }

    fn get_secs(&self, key: &str) -> Result<Duration> {
        self.require(key)?
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| ConfError::invalid_value(key, "seconds"))
    }

    /// Duration stored as (possibly fractional) seconds.
    pub fn get_duration_secs_or(&self, key: &str, default: Duration) -> Duration {
        self.or_default(key, default, |conf| conf.get_secs(key))
    }

    /// Polling period in seconds. Zero falls back to `default` like any
    /// other unusable value.
    pub fn get_interval_secs_or(&self, key: &str, default: Duration) -> Duration {
        self.or_default(key, default, |conf| {
            let interval = conf.get_secs(key)?;
            if interval.is_zero() {
                return Err(ConfError::invalid_value(key, "positive seconds"));
            }
            Ok(interval)
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.storage
            .insert(key.into(), ConfValue::String(value.into()));
    }

    pub fn set_int(&mut self, key: impl Into<String>, value: i32) {
        self.storage
            .insert(key.into(), ConfValue::Integer(i64::from(value)));
    }

    pub fn set_long(&mut self, key: impl Into<String>, value: i64) {
        self.storage.insert(key.into(), ConfValue::Integer(value));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.storage.insert(key.into(), ConfValue::Bool(value));
    }

    /// Copy every entry of `other` over this store.
    pub fn merge(&mut self, other: &Configuration) {
        for (key, value) in &other.storage {
            self.storage.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// All entries sorted by key.
    pub fn entries(&self) -> Vec<(&str, &ConfValue)> {
        let mut entries: Vec<_> = self
            .storage
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// All entries as sorted `key=value` strings.
    pub fn storage_list(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect()
    }

    /// Flat JSON object of every entry; parsing it back yields the same store.
    pub fn to_json_str(&self) -> String {
        let sorted: BTreeMap<&str, Value> = self
            .storage
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_json()))
            .collect();
        let object: Map<String, Value> = sorted
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Value::Object(object).to_string()
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Parse property-style text: `key=value` or `key:value` per logical line.
fn parse_properties(text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut logical = String::new();

    for raw in text.lines() {
        let line = raw.trim_start();
        if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!'))
        {
            continue;
        }
        if let Some(continued) = line.strip_suffix('\\') {
            logical.push_str(continued);
            continue;
        }
        logical.push_str(line);
        entries.extend(split_property(&logical));
        logical.clear();
    }
    if !logical.is_empty() {
        entries.extend(split_property(&logical));
    }
    entries
}

fn split_property(line: &str) -> Option<(String, String)> {
    let (key, value) = match line.find(|c| c == '=' || c == ':') {
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => (line, ""),
    };
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}
