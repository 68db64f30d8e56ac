// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Desired category settings as pushed over the settings channel:
//
//   [{"category": "...", "module": "...", "enabled": true,
//     "excluded": ["..."], "config": {...}}, ...]

use serde::{Deserialize, Serialize};

use crate::codec::Metadata;
use crate::error::Result;

/// What a consumer wants for one category (optionally narrowed to a module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredSetting {
    pub category: String,
    /// `None` matches every module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl DesiredSetting {
    pub fn new(category: impl Into<String>, enabled: bool) -> Self {
        Self {
            category: category.into(),
            module: None,
            enabled,
            excluded: Vec::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn excluded(mut self, excluded: Vec<String>) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Whether this setting applies to a control with `metadata`.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.category == metadata.category && self.module.as_ref().map_or(true, |m| *m == metadata.module)
    }

    /// Among `settings`, the one that applies to `metadata`. A setting naming
    /// the module wins over a category-wide one; otherwise the first wins.
    pub fn best_match<'a>(settings: &'a [DesiredSetting], metadata: &Metadata) -> Option<&'a DesiredSetting> {
        let mut found = None;
        for s in settings.iter().filter(|s| s.matches(metadata)) {
            if s.module.is_some() {
                return Some(s);
            }
            found.get_or_insert(s);
        }
        found
    }
}

/// A complete desired list; each push replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionDocument(pub Vec<DesiredSetting>);

impl DistributionDocument {
    pub fn to_json_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn into_settings(self) -> Vec<DesiredSetting> {
        self.0
    }
}
