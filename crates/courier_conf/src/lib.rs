//! Configuration store for Courier.
//!
//! Nested JSON/TOML documents and flat property files are flattened into a
//! single key space (`a.b[2].c`) with typed accessors. Agent settings, trigger
//! profiles and job profiles are all specializations of [`Configuration`].

mod configuration;
mod error;
pub mod keys;
mod profile;

pub use configuration::{ConfValue, Configuration, SourceFormat};
pub use error::{ConfError, Result};
pub use profile::{AgentConf, JobProfile, Profile, TriggerProfile};
