// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The transport section of the host's configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::payload::Severity;

/// Smallest accepted data buffer.
pub const MIN_BUFFER_SIZE: usize = 1024;
/// Largest accepted data buffer.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// When a producer waits for its buffer to drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Never; posting returns as soon as the record is stored.
    #[default]
    Off,
    /// After every post, up to `flush_timeout_ms`.
    Always,
}

/// Set of severities, one bit per [`Severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeverityMask(u32);

impl SeverityMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b11_1111);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, severity: Severity) -> bool {
        self.0 & severity.bit() != 0
    }

    pub const fn with(self, severity: Severity) -> Self {
        Self(self.0 | severity.bit())
    }

    pub const fn without(self, severity: Severity) -> Self {
        Self(self.0 & !severity.bit())
    }

    /// Every severity at or above `min`.
    pub fn at_least(min: Severity) -> Self {
        Severity::ALL
            .iter()
            .filter(|&&s| s >= min)
            .fold(Self::NONE, |m, &s| m.with(s))
    }
}

impl Default for SeverityMask {
    fn default() -> Self {
        Self::at_least(Severity::Info)
    }
}

impl FromIterator<Severity> for SeverityMask {
    fn from_iter<I: IntoIterator<Item = Severity>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, |m, s| m.with(s))
    }
}

/// Transport settings shared by producers and consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Directory-like prefix of every object name.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Application identifier; keeps unrelated hosts apart.
    #[serde(default = "default_identifier")]
    pub identifier: String,

    /// Data bytes of each producer's buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Evict old records when the buffer is full instead of dropping new ones.
    #[serde(default = "default_overwrite")]
    pub overwrite_on_full: bool,

    /// Severities posted before any consumer says otherwise.
    #[serde(default)]
    pub default_enabled: SeverityMask,

    #[serde(default)]
    pub flush_mode: FlushMode,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("diagring")
}

fn default_identifier() -> String {
    "host".to_owned()
}

fn default_buffer_size() -> usize {
    256 * 1024
}

fn default_overwrite() -> bool {
    true
}

fn default_lock_timeout_ms() -> u64 {
    100
}

fn default_query_timeout_ms() -> u64 {
    500
}

fn default_flush_timeout_ms() -> u64 {
    1000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            identifier: default_identifier(),
            buffer_size: default_buffer_size(),
            overwrite_on_full: default_overwrite(),
            default_enabled: SeverityMask::default(),
            flush_mode: FlushMode::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

impl TransportConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(TransportError::Config("identifier must not be empty".into()));
        }
        if self.identifier.contains(['/', '\\', '\0']) {
            return Err(TransportError::Config(format!(
                "identifier {:?} contains a path separator or NUL",
                self.identifier
            )));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(TransportError::Config(format!(
                "buffer_size {} outside [{MIN_BUFFER_SIZE}, {MAX_BUFFER_SIZE}]",
                self.buffer_size
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(TransportError::Config("lock_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}
