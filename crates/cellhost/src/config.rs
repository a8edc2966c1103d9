//! Wire constants and host configuration.
//!
//! The constants fix the on-wire message layout and are shared by every
//! process in a host tree; they are not configurable. [`HostConfig`] carries
//! the tunables, built with `with_*` methods or read from the
//! `CELLHOST_CONFIG` environment variable as JSON.

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// Maximum number of tagged slots in one message.
pub const MESSAGE_MAX_MEMBERS: usize = 7;

/// Size in bytes of the fixed message record (slots plus string buffer).
pub const MESSAGE_SIZE: usize = 512;

/// Kernel limit on descriptors carried by one SCM_RIGHTS control message.
pub const SCM_MAX_FD: usize = 253;

/// Descriptor number the inbox socket occupies inside a worker.
pub const INBOX_FD: i32 = 3;

/// Default upper bound for the pre-init hook arena.
pub const DEFAULT_HOOK_ARENA_LIMIT: usize = 1024 * 1024;

const CONFIG_ENV: &str = "CELLHOST_CONFIG";

// The string buffer must at least hold one length-prefixed byte.
const _: () = assert!(MESSAGE_SIZE > MESSAGE_MAX_MEMBERS * 8 + 1);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CELLHOST_CONFIG is not valid unicode")]
    NotUnicode,
    #[error("invalid CELLHOST_CONFIG: {0}")]
    Json(#[from] serde_json::Error),
}

/// Host-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Descriptors accepted per received datagram. Never exceeds [`SCM_MAX_FD`].
    pub max_fds_per_recv: usize,
    /// Signal a worker receives when its parent dies. `None` disables it.
    #[serde(with = "signal_name")]
    pub parent_death_signal: Option<Signal>,
    /// Bytes the pre-init hook may allocate from its arena.
    pub hook_arena_limit: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_fds_per_recv: MESSAGE_MAX_MEMBERS,
            parent_death_signal: Some(Signal::SIGKILL),
            hook_arena_limit: DEFAULT_HOOK_ARENA_LIMIT,
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `CELLHOST_CONFIG` if set, defaults otherwise.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(raw) => Self::from_json(&raw),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode),
        }
    }

    /// Parse a JSON object; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn with_max_fds_per_recv(mut self, n: usize) -> Self {
        self.max_fds_per_recv = n;
        self
    }

    pub fn with_parent_death_signal(mut self, signal: Option<Signal>) -> Self {
        self.parent_death_signal = signal;
        self
    }

    pub fn with_hook_arena_limit(mut self, bytes: usize) -> Self {
        self.hook_arena_limit = bytes;
        self
    }

    /// Effective per-receive descriptor limit.
    pub fn fd_limit(&self) -> usize {
        self.max_fds_per_recv.min(SCM_MAX_FD)
    }
}

mod signal_name {
    use std::str::FromStr;

    use nix::sys::signal::Signal;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(signal: &Option<Signal>, s: S) -> Result<S::Ok, S::Error> {
        match signal {
            Some(signal) => s.serialize_some(signal.as_str()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Signal>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|name| Signal::from_str(&name).map_err(|_| de::Error::custom(format!("unknown signal {name:?}"))))
            .transpose()
    }
}
