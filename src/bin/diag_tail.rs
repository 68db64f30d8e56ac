// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   diag_tail <id>[,<id>...] [--config <config.json>]
//             [--enable <category>] [--disable <category>] [--list]
//
// Attaches to the buffers of the given producer ids and prints every message
// until interrupted. --enable/--disable push a category toggle (all modules)
// to every producer first; --list prints their enabled categories and exits.

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use diagring::{Metadata, MessageClient, PayloadRegistry, TextPayload, TransportConfig};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static QUIT: AtomicBool = AtomicBool::new(false);

const USAGE: &str =
    "usage: diag_tail <id>[,<id>...] [--config <file>] [--enable <category>] [--disable <category>] [--list]";

fn main() -> Result<(), Box<dyn Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(ids) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };
    let ids = ids
        .split(',')
        .map(str::parse::<u32>)
        .collect::<Result<Vec<_>, _>>()?;

    let mut config = TransportConfig::default();
    let mut toggles = Vec::new();
    let mut list = false;
    let mut rest = args[1..].iter();
    while let Some(flag) = rest.next() {
        match flag.as_str() {
            "--config" => config = TransportConfig::from_file(rest.next().ok_or(USAGE)?)?,
            "--enable" => toggles.push((rest.next().ok_or(USAGE)?.clone(), true)),
            "--disable" => toggles.push((rest.next().ok_or(USAGE)?.clone(), false)),
            "--list" => list = true,
            other => return Err(format!("unknown option {other}\n{USAGE}").into()),
        }
    }

    install_quit_handler();

    let client = MessageClient::new(config, PayloadRegistry::with_builtin())?;
    for &id in &ids {
        client.add_instance(id)?;
    }
    client.set_unknown_type_hook(|env| {
        println!("[{}] <{} message without a decoder>", env.producer_id, env.metadata.type_name);
    });

    for (category, enabled) in &toggles {
        let md = Metadata::new(TextPayload::TYPE_NAME, category.as_str(), "");
        let n = client.enable(&md, *enabled)?;
        println!("tail: {} {category} on {n} producer(s)", if *enabled { "enabled" } else { "disabled" });
    }
    if list {
        for md in client.enabled()? {
            println!("{md}");
        }
        return Ok(());
    }

    println!("tail: attached to {ids:?}");
    while !QUIT.load(Ordering::Acquire) {
        client.wait_for_updates(Duration::from_millis(200), |env, payload| {
            match payload.downcast_ref::<TextPayload>() {
                Some(text) => println!(
                    "[{}] {:>14}ns {}:{} {}/{} {}: {}",
                    env.producer_id,
                    env.timestamp.as_nanos(),
                    env.source_file,
                    env.source_line,
                    env.metadata.module,
                    env.metadata.category,
                    text.severity,
                    text.text
                ),
                None => println!("[{}] {} {payload:?}", env.producer_id, env.metadata),
            }
        })?;
    }
    println!("tail: {:?}", client.stats());
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
