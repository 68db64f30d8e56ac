// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control registry: announce/revoke, toggles and desired settings.

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use serde_json::json;

use diagring::{CategorySwitch, Control, ControlRegistry, DesiredSetting, Metadata};

fn switch(category: &str, module: &str, on: bool) -> Arc<CategorySwitch> {
    Arc::new(CategorySwitch::new(Metadata::new("text", category, module), on))
}

#[test]
fn revoking_an_unannounced_control_is_a_no_op() {
    let reg = ControlRegistry::new();
    let _kept = reg.announce(switch("net", "io", true));

    let stranger: Arc<dyn Control> = switch("net", "io", true);
    assert!(!reg.revoke(&stranger));
    assert_eq!(reg.len(), 1);
}

#[test]
fn explicit_revoke_and_guard_revoke() {
    let reg = ControlRegistry::new();
    let a: Arc<dyn Control> = switch("a", "m", true);
    let guard_a = reg.announce(a.clone());
    let guard_b = reg.announce(switch("b", "m", true));
    assert_eq!(reg.len(), 2);

    assert!(reg.revoke(&a));
    assert!(!reg.revoke(&a));
    drop(guard_a);
    assert_eq!(reg.len(), 1);

    guard_b.revoke();
    assert!(reg.is_empty());
}

#[test]
fn guard_outliving_registry_is_harmless() {
    let reg = ControlRegistry::new();
    let guard = reg.announce(switch("a", "m", true));
    drop(reg);
    drop(guard);
}

#[test]
fn later_desired_list_supersedes_earlier_one() {
    let reg = ControlRegistry::new();
    let net = switch("net", "io", false);
    let gl = switch("gl", "renderer", false);
    let _n = reg.announce(net.clone());
    let _g = reg.announce(gl.clone());

    reg.update_enabled_categories(vec![
        DesiredSetting::new("net", true).config(json!({"level": 2})),
        DesiredSetting::new("gl", true).excluded(vec!["shadows".into()]),
    ]);
    assert!(net.is_enabled());
    assert!(gl.is_enabled());
    assert!(reg.is_default_category("net"));

    reg.update_enabled_categories(vec![DesiredSetting::new("net", false)]);
    assert!(!net.is_enabled());
    assert_eq!(net.config(), serde_json::Value::Null);
    // Not in the new list: left as it was.
    assert!(gl.is_enabled());
    assert!(gl.is_excluded("shadows"));

    assert!(!reg.is_default_category("net"));
    assert!(!reg.is_default_category("gl"));
    assert_eq!(reg.desired_settings(), vec![DesiredSetting::new("net", false)]);
}

#[test]
fn setting_applies_config_and_exclusions() {
    let reg = ControlRegistry::new();
    let io = switch("net", "io", true);
    let _a = reg.announce(io.clone());

    reg.update_enabled_categories(vec![DesiredSetting::new("net", true)
        .module("io")
        .excluded(vec!["dns".into(), "tls".into()])
        .config(json!({"verbose": true}))]);
    assert!(io.is_enabled());
    assert!(io.is_excluded("tls"));
    assert!(!io.is_excluded("http"));
    assert_eq!(io.config(), json!({"verbose": true}));
}

#[test]
fn module_restricted_setting_leaves_other_modules_alone() {
    let reg = ControlRegistry::new();
    let io = switch("net", "io", true);
    let ui = switch("net", "ui", true);
    let _a = reg.announce(io.clone());
    let _b = reg.announce(ui.clone());

    reg.update_enabled_categories(vec![DesiredSetting::new("net", false).module("ui")]);
    assert!(io.is_enabled());
    assert!(!ui.is_enabled());
}

#[test]
fn toggles_match_category_and_optional_module() {
    let reg = ControlRegistry::new();
    let io = switch("net", "io", true);
    let ui = switch("net", "ui", true);
    let gl = switch("gl", "ui", true);
    let _a = reg.announce(io.clone());
    let _b = reg.announce(ui.clone());
    let _c = reg.announce(gl.clone());

    assert_eq!(reg.apply_toggle(&Metadata::new("text", "net", ""), false), 2);
    assert!(!io.is_enabled() && !ui.is_enabled());
    assert!(gl.is_enabled());

    assert_eq!(reg.apply_toggle(&Metadata::new("text", "net", "io"), true), 1);
    assert!(io.is_enabled() && !ui.is_enabled());

    // Idempotent.
    assert_eq!(reg.apply_toggle(&Metadata::new("text", "net", "io"), true), 1);
    assert!(io.is_enabled());

    let mut enabled: Vec<String> = reg.enabled_categories().into_iter().map(|m| m.to_string()).collect();
    enabled.sort();
    assert_eq!(enabled, vec!["io/net<text>", "ui/gl<text>"]);
}

#[test]
fn distribution_document_bytes_apply() {
    let reg = ControlRegistry::new();
    let net = switch("net", "io", false);
    let _a = reg.announce(net.clone());

    let n = reg
        .apply_document(br#"[{"category": "net", "enabled": true, "excluded": ["dns"]}]"#)
        .unwrap();
    assert_eq!(n, 1);
    assert!(net.is_enabled());
    assert!(net.is_excluded("dns"));

    assert!(reg.apply_document(b"{not json").is_err());
    assert!(net.is_enabled());
}

/// Logs its own toggles back through the registry that drives it.
struct SelfReporting {
    registry: Weak<ControlRegistry>,
    switch: CategorySwitch,
}

impl Control for SelfReporting {
    fn metadata(&self) -> Metadata {
        self.switch.metadata()
    }

    fn is_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    fn enable(&self, enabled: bool) {
        if let Some(reg) = self.registry.upgrade() {
            let _ = reg.is_enabled(&self.metadata());
            let _ = reg.desired_settings();
        }
        self.switch.enable(enabled);
    }

    fn exclude(&self, _excluded: &[String]) {
        if let Some(reg) = self.registry.upgrade() {
            let _ = reg.enabled_categories();
        }
    }
}

#[test]
fn controls_may_call_back_into_the_registry_while_settings_apply() {
    let reg = ControlRegistry::new();
    let ctl = Arc::new(SelfReporting {
        registry: Arc::downgrade(&reg),
        switch: CategorySwitch::new(Metadata::new("text", "net", "io"), false),
    });
    let announced = reg.announce(ctl.clone());

    let (tx, rx) = mpsc::channel();
    let r = reg.clone();
    thread::spawn(move || {
        r.update_enabled_categories(vec![DesiredSetting::new("net", true)]);
        let _ = tx.send(());
    });
    if rx.recv_timeout(Duration::from_secs(5)).is_err() {
        // Dropping the guard would wait on the stuck lock.
        std::mem::forget(announced);
        panic!("applying settings blocked on the registry lock");
    }
    assert!(ctl.is_enabled());
    assert_eq!(reg.is_enabled(&Metadata::new("text", "net", "io")), Some(true));
}
