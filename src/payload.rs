// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Typed payloads carried behind an envelope, and the per-consumer table of
// factories that rebuilds them from a record's type name.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// A message body that knows its wire type name and how to (de)serialize.
pub trait Payload: Send + fmt::Debug {
    /// Name written into the record's type field; selects the factory.
    fn type_name(&self) -> &str;

    fn serialize(&self, out: &mut Vec<u8>);

    /// Fill `self` from `bytes`, as produced by [`serialize`](Self::serialize).
    fn deserialize(&mut self, bytes: &[u8]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn Payload + '_ {
    /// Downcast to a concrete payload type.
    pub fn downcast_ref<T: Payload + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Payload> + Send + Sync>;

/// Type name to payload factory.
#[derive(Default)]
pub struct PayloadRegistry {
    factories: HashMap<String, Factory>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows [`TextPayload`].
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        reg.register_default::<TextPayload>(TextPayload::TYPE_NAME);
        reg
    }

    /// Register `factory` for `type_name`, replacing any previous one.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Payload> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    /// Register a payload type constructed through `Default`.
    pub fn register_default<T: Payload + Default + 'static>(&mut self, type_name: impl Into<String>) {
        self.register(type_name, || Box::new(T::default()));
    }

    /// A fresh, empty payload for `type_name`.
    pub fn create(&self, type_name: &str) -> Option<Box<dyn Payload>> {
        self.factories.get(type_name).map(|f| f())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("PayloadRegistry").field("types", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in text payload
// ---------------------------------------------------------------------------

/// Message severity, one bit each in a [`SeverityMask`](crate::SeverityMask).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warning = 3,
    Error = 4,
    Assert = 5,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Trace,
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Assert,
    ];

    pub const fn bit(self) -> u32 {
        1 << self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Assert => "assert",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A severity byte followed by UTF-8 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextPayload {
    pub severity: Severity,
    pub text: String,
}

impl TextPayload {
    pub const TYPE_NAME: &'static str = "text";

    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
        }
    }
}

impl Payload for TextPayload {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.severity as u8);
        out.extend_from_slice(self.text.as_bytes());
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<()> {
        let (&sev, text) = bytes
            .split_first()
            .ok_or_else(|| TransportError::malformed("text payload", "missing severity byte"))?;
        self.severity = Severity::from_u8(sev)
            .ok_or_else(|| TransportError::malformed("text payload", format!("unknown severity {sev}")))?;
        self.text = String::from_utf8_lossy(text).into_owned();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
