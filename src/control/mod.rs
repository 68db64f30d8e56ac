// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Producer-side category controls and the protocol that drives them.

mod distribution;
mod registry;
mod switch;

pub use distribution::{DesiredSetting, DistributionDocument};
pub use registry::{Announcement, ControlHandler, ControlRegistry};
pub use switch::CategorySwitch;

use crate::codec::Metadata;

/// A category a subsystem lets consumers switch on and off remotely.
///
/// Implementations use interior mutability; the registry calls them from
/// whichever thread services the administrative channels.
pub trait Control: Send + Sync {
    /// Category, module and payload type this control gates.
    fn metadata(&self) -> Metadata;

    fn is_enabled(&self) -> bool;

    fn enable(&self, enabled: bool);

    /// Free-form settings from the last matching desired setting.
    fn configure(&self, _config: &serde_json::Value) {}

    /// Names to exclude within the category.
    fn exclude(&self, _excluded: &[String]) {}
}

impl std::fmt::Debug for dyn Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("metadata", &self.metadata())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
