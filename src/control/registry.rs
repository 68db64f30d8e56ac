// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-process table of announced controls and the desired settings last
// pushed by a consumer.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use slab::Slab;

use super::{Control, DesiredSetting, DistributionDocument};
use crate::codec::Metadata;
use crate::error::Result;

/// Visitor for [`ControlRegistry::iterate`].
pub trait ControlHandler {
    fn handle(&mut self, control: &dyn Control);
}

impl<F: FnMut(&dyn Control)> ControlHandler for F {
    fn handle(&mut self, control: &dyn Control) {
        self(control)
    }
}

#[derive(Default)]
struct Inner {
    controls: Slab<Arc<dyn Control>>,
    desired: Vec<DesiredSetting>,
}

/// Announced controls of one process.
///
/// Not a singleton: create one per process (or per test) and share it
/// through an `Arc`.
#[derive(Default)]
pub struct ControlRegistry {
    inner: Mutex<Inner>,
}

/// Keeps a control announced; revokes it on drop.
#[must_use = "dropping the announcement revokes the control immediately"]
pub struct Announcement {
    registry: Weak<ControlRegistry>,
    key: usize,
    control: Arc<dyn Control>,
}

impl Announcement {
    pub fn control(&self) -> &Arc<dyn Control> {
        &self.control
    }

    /// Revoke now instead of at drop.
    pub fn revoke(self) {}
}

impl Drop for Announcement {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.revoke_key(self.key, &self.control);
        }
    }
}

impl std::fmt::Debug for Announcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcement")
            .field("key", &self.key)
            .field("control", &self.control)
            .finish()
    }
}

fn same_control(a: &Arc<dyn Control>, b: &Arc<dyn Control>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl ControlRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `control`, applying any matching desired setting to it.
    /// The control stays announced until the returned guard drops.
    ///
    /// Controls are called with the registry unlocked, so they may query it.
    pub fn announce(self: &Arc<Self>, control: Arc<dyn Control>) -> Announcement {
        let md = control.metadata();
        let (key, setting) = {
            let mut inner = self.inner();
            let setting = DesiredSetting::best_match(&inner.desired, &md).cloned();
            (inner.controls.insert(control.clone()), setting)
        };
        if let Some(setting) = &setting {
            apply_setting(control.as_ref(), setting);
        }
        tracing::trace!(control = %md, key, "announced control");
        Announcement {
            registry: Arc::downgrade(self),
            key,
            control,
        }
    }

    /// Remove `control` if it is announced. Returns whether it was.
    pub fn revoke(&self, control: &Arc<dyn Control>) -> bool {
        let mut inner = self.inner();
        let key = inner
            .controls
            .iter()
            .find(|(_, c)| same_control(c, control))
            .map(|(k, _)| k);
        match key {
            Some(k) => {
                inner.controls.remove(k);
                true
            }
            None => false,
        }
    }

    fn revoke_key(&self, key: usize, control: &Arc<dyn Control>) {
        let mut inner = self.inner();
        // The key may have been reused after an explicit revoke.
        if inner.controls.get(key).is_some_and(|c| same_control(c, control)) {
            inner.controls.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner().controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every announced control. The registry is not locked while the
    /// handler runs, so the handler may announce or revoke.
    pub fn iterate(&self, handler: &mut dyn ControlHandler) {
        for control in self.snapshot() {
            handler.handle(control.as_ref());
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Control>> {
        self.inner().controls.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Replace the desired settings and apply them to every announced
    /// control they match. Unmatched controls keep their state.
    pub fn update_enabled_categories(&self, desired: Vec<DesiredSetting>) {
        let pending: Vec<(Arc<dyn Control>, DesiredSetting)> = {
            let mut inner = self.inner();
            inner.desired = desired;
            let inner = &*inner;
            inner
                .controls
                .iter()
                .filter_map(|(_, c)| {
                    DesiredSetting::best_match(&inner.desired, &c.metadata()).map(|s| (c.clone(), s.clone()))
                })
                .collect()
        };
        for (control, setting) in &pending {
            apply_setting(control.as_ref(), setting);
        }
        tracing::debug!(matched = pending.len(), "applied desired categories");
    }

    /// Parse a distribution document and apply it.
    pub fn apply_document(&self, bytes: &[u8]) -> Result<usize> {
        let settings = DistributionDocument::from_json_slice(bytes)?.into_settings();
        let n = settings.len();
        self.update_enabled_categories(settings);
        Ok(n)
    }

    /// Enable or disable every control in `metadata.category`, restricted to
    /// `metadata.module` unless it is empty. Returns how many matched.
    pub fn apply_toggle(&self, metadata: &Metadata, enabled: bool) -> usize {
        let mut matched = 0;
        for control in self.snapshot() {
            let md = control.metadata();
            let module_ok = metadata.module.is_empty() || metadata.module == md.module;
            if md.category == metadata.category && module_ok {
                matched += 1;
                if control.is_enabled() != enabled {
                    control.enable(enabled);
                }
            }
        }
        tracing::debug!(category = %metadata.category, module = %metadata.module, enabled, matched, "applied toggle");
        matched
    }

    /// Metadata of every enabled control.
    pub fn enabled_categories(&self) -> Vec<Metadata> {
        self.snapshot()
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.metadata())
            .collect()
    }

    /// Whether an announced control gates `metadata`, and if so whether
    /// any of them is enabled.
    pub fn is_enabled(&self, metadata: &Metadata) -> Option<bool> {
        let mut seen = None;
        for c in self.snapshot() {
            let md = c.metadata();
            if md.category == metadata.category && md.module == metadata.module {
                if c.is_enabled() {
                    return Some(true);
                }
                seen = Some(false);
            }
        }
        seen
    }

    /// Whether the current desired list enables `category`.
    pub fn is_default_category(&self, category: &str) -> bool {
        self.inner()
            .desired
            .iter()
            .any(|s| s.enabled && s.category == category)
    }

    pub fn desired_settings(&self) -> Vec<DesiredSetting> {
        self.inner().desired.clone()
    }
}

impl std::fmt::Debug for ControlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("ControlRegistry")
            .field("controls", &inner.controls.len())
            .field("desired", &inner.desired)
            .finish()
    }
}

fn apply_setting(control: &dyn Control, setting: &DesiredSetting) {
    if control.is_enabled() != setting.enabled {
        control.enable(setting.enabled);
    }
    control.configure(&setting.config);
    control.exclude(&setting.excluded);
}
