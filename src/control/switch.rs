// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::Control;
use crate::codec::Metadata;

/// Ready-made [`Control`]: an atomic flag plus the last exclusion list and
/// configuration it was given.
#[derive(Debug)]
pub struct CategorySwitch {
    metadata: Metadata,
    enabled: AtomicBool,
    excluded: Mutex<Vec<String>>,
    config: Mutex<serde_json::Value>,
}

impl CategorySwitch {
    pub fn new(metadata: Metadata, enabled: bool) -> Self {
        Self {
            metadata,
            enabled: AtomicBool::new(enabled),
            excluded: Mutex::new(Vec::new()),
            config: Mutex::new(serde_json::Value::Null),
        }
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|n| n == name)
    }

    pub fn excluded_names(&self) -> Vec<String> {
        self.excluded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn config(&self) -> serde_json::Value {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Control for CategorySwitch {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn configure(&self, config: &serde_json::Value) {
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
    }

    fn exclude(&self, excluded: &[String]) {
        *self.excluded.lock().unwrap_or_else(|e| e.into_inner()) = excluded.to_vec();
    }
}
