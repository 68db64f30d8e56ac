// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   diag_emit <producer_id> <interval_ms> [config.json]
//
// Posts a numbered text message every <interval_ms> milliseconds in the
// categories "tick" (info) and "detail" (debug), and services consumer
// toggles in the background. Run `diag_tail <producer_id>` next to it and
// switch "tick" off with `diag_tail <producer_id> --disable tick`.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use diagring::{CategorySwitch, ControlRegistry, Metadata, Producer, Severity, TextPayload, TransportConfig};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static QUIT: AtomicBool = AtomicBool::new(false);

fn main() -> Result<(), Box<dyn Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: diag_emit <producer_id> <interval_ms> [config.json]");
        std::process::exit(1);
    }
    let producer_id: u32 = args[1].parse()?;
    let interval = Duration::from_millis(args[2].parse()?);
    let config = match args.get(3) {
        Some(path) => TransportConfig::from_file(path)?,
        None => TransportConfig::default(),
    };

    install_quit_handler();

    let registry = ControlRegistry::new();
    let tick = Arc::new(CategorySwitch::new(Metadata::new(TextPayload::TYPE_NAME, "tick", "diag_emit"), true));
    let detail = Arc::new(CategorySwitch::new(Metadata::new(TextPayload::TYPE_NAME, "detail", "diag_emit"), false));
    let _tick = registry.announce(tick);
    let _detail = registry.announce(detail);

    let producer = Arc::new(Producer::new(config, producer_id, registry)?);
    let _worker = producer.spawn_control_worker()?;
    println!("emit: producer {producer_id} posting every {interval:?}");

    let mut n = 0u64;
    while !QUIT.load(Ordering::Acquire) {
        n += 1;
        let outcome = producer.post_text("tick", "diag_emit", Severity::Info, &format!("tick {n}"))?;
        producer.post_text("detail", "diag_emit", Severity::Debug, &format!("detail of tick {n}"))?;
        tracing::trace!(n, ?outcome, "posted");
        thread::sleep(interval);
    }
    println!("emit: {n} ticks, {} dropped", producer.dropped());
    Ok(())
}

extern "C" fn on_signal(_: libc::c_int) {
    QUIT.store(true, Ordering::Release);
}

fn install_quit_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }
}
