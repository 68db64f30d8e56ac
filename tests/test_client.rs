// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Consumer side: attaching, draining, waking and bookkeeping.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use diagring::cyclic::DropReason;
use diagring::{
    CategorySwitch, Control, ControlRegistry, DesiredSetting, Envelope, Metadata, MessageClient, Payload,
    PayloadRegistry, PostOutcome, Producer, Severity, TextPayload, TransportConfig, WaitStatus,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_client_{}_{n}", std::process::id())
}

fn config(prefix: &str) -> TransportConfig {
    TransportConfig {
        base_path: "diagring-test".into(),
        identifier: unique_name(prefix),
        buffer_size: 4096,
        ..TransportConfig::default()
    }
}

fn producer(cfg: &TransportConfig, id: u32) -> Producer {
    Producer::new(cfg.clone(), id, ControlRegistry::new()).expect("producer")
}

fn client(cfg: &TransportConfig) -> MessageClient {
    MessageClient::new(cfg.clone(), PayloadRegistry::with_builtin()).expect("client")
}

fn texts(client: &MessageClient) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    client
        .pop_messages_and_call(|env, p| {
            let text = p.downcast_ref::<TextPayload>().expect("text payload");
            out.push((env.producer_id, text.text.clone()));
        })
        .unwrap();
    out
}

#[test]
fn envelope_and_payload_round_trip() {
    let cfg = config("round_trip");
    let prod = producer(&cfg, 7);
    let client = client(&cfg);
    client.add_instance(7).unwrap();

    let payload = TextPayload::new(Severity::Error, "shader compile failed");
    prod.post_at("gl", "renderer", &payload, "src/shader.rs", 88).unwrap();

    let mut seen: Vec<(Envelope, TextPayload)> = Vec::new();
    let n = client
        .pop_messages_and_call(|env, p| {
            seen.push((env.clone(), p.downcast_ref::<TextPayload>().unwrap().clone()));
        })
        .unwrap();
    assert_eq!(n, 1);
    let (env, text) = &seen[0];
    assert_eq!(env.producer_id, 7);
    assert_eq!(env.source_file, "src/shader.rs");
    assert_eq!(env.source_line, 88);
    assert_eq!(env.metadata.category, "gl");
    assert_eq!(env.metadata.module, "renderer");
    assert_eq!(env.metadata.type_name, TextPayload::TYPE_NAME);
    assert!(env.timestamp.as_nanos() > 0);
    assert_eq!(text, &payload);
}

#[test]
fn empty_location_and_names_round_trip() {
    let cfg = config("empty_fields");
    let prod = producer(&cfg, 2);
    let client = client(&cfg);
    client.add_instance(2).unwrap();

    let payload = TextPayload::new(Severity::Info, "");
    prod.post_at("", "", &payload, "", 0).unwrap();

    let mut seen = Vec::new();
    client
        .pop_messages_and_call(|env, p| seen.push((env.clone(), p.downcast_ref::<TextPayload>().unwrap().clone())))
        .unwrap();
    assert_eq!(seen.len(), 1);
    let (env, text) = &seen[0];
    assert_eq!(env.source_file, "");
    assert_eq!(env.source_line, 0);
    assert_eq!(env.metadata, Metadata::new(TextPayload::TYPE_NAME, "", ""));
    assert_eq!(text, &payload);
}

#[test]
fn largest_body_the_ring_holds_round_trips() {
    let cfg = config("max_body");
    let prod = producer(&cfg, 2);
    let client = client(&cfg);
    client.add_instance(2).unwrap();

    let max_body = prod.instance().data().max_body();
    let envelope = Envelope::new(2, Metadata::new(TextPayload::TYPE_NAME, "big", "m"), "f.rs", 1);
    // Payload is one severity byte plus the text.
    let text_len = max_body - envelope.encoded_len() - 1;

    let fits = "a".repeat(text_len);
    assert!(matches!(
        prod.post_at("big", "m", &TextPayload::new(Severity::Info, fits.clone()), "f.rs", 1)
            .unwrap(),
        PostOutcome::Written { .. }
    ));
    assert_eq!(texts(&client), vec![(2, fits)]);

    let too_big = "a".repeat(text_len + 1);
    assert_eq!(
        prod.post_at("big", "m", &TextPayload::new(Severity::Info, too_big), "f.rs", 1)
            .unwrap(),
        PostOutcome::Dropped(DropReason::TooLarge)
    );
    assert!(texts(&client).is_empty());
}

#[test]
fn record_wrapping_the_ring_end_round_trips() {
    let cfg = config("wrap");
    let prod = producer(&cfg, 2);
    let client = client(&cfg);
    client.add_instance(2).unwrap();

    // Three passes over a 4 KiB ring: the second and third records straddle
    // the end.
    for i in 0..3u8 {
        let text: String = (0..3000).map(|j| char::from(b'a' + ((j + usize::from(i)) % 26) as u8)).collect();
        prod.post_text("wrap", "test", Severity::Info, &text).unwrap();
        assert_eq!(texts(&client), vec![(2, text)]);
    }
}

#[test]
fn messages_of_one_producer_stay_in_order() {
    let cfg = config("fifo");
    let prod = producer(&cfg, 1);
    let client = client(&cfg);
    client.add_instance(1).unwrap();

    for i in 0..20 {
        prod.post_text("seq", "test", Severity::Info, &format!("m{i}")).unwrap();
    }
    let got: Vec<String> = texts(&client).into_iter().map(|(_, t)| t).collect();
    let want: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
    assert_eq!(got, want);
}

#[test]
fn consumer_may_attach_before_producer_starts() {
    let cfg = config("early_consumer");
    let client = client(&cfg);
    client.add_instance(3).unwrap();

    let prod = producer(&cfg, 3);
    prod.post_text("boot", "test", Severity::Warning, "late producer").unwrap();
    assert_eq!(texts(&client), vec![(3, "late producer".to_owned())]);
}

#[test]
fn wait_wakes_when_representative_is_written() {
    let cfg = config("wake");
    let prod = producer(&cfg, 1);
    let client = Arc::new(client(&cfg));
    client.add_instance(1).unwrap();

    let c = client.clone();
    let waiter = thread::spawn(move || {
        let mut n = 0;
        let pass = c.wait_for_updates(Duration::from_secs(5), |_, _| n += 1).unwrap();
        (pass.status, n)
    });
    thread::sleep(Duration::from_millis(30));
    prod.post_text("wake", "test", Severity::Info, "ding").unwrap();

    let (status, n) = waiter.join().unwrap();
    assert_eq!(status, WaitStatus::Signaled);
    assert_eq!(n, 1);
}

#[test]
fn timeout_still_drains_other_instances() {
    let cfg = config("scenario_b");
    let _first = producer(&cfg, 1);
    let second = producer(&cfg, 2);
    let client = client(&cfg);
    client.add_instance(1).unwrap();
    client.add_instance(2).unwrap();

    second.post_text("only", "test", Severity::Info, "from two").unwrap();
    let mut got = Vec::new();
    let pass = client
        .wait_for_updates(Duration::from_millis(30), |env, _| got.push(env.producer_id))
        .unwrap();
    assert_eq!(pass.status, WaitStatus::TimedOut);
    assert_eq!(pass.delivered, 1);
    assert_eq!(got, vec![2]);
}

#[test]
fn skip_waiting_forces_an_immediate_pass() {
    let cfg = config("skip");
    let _first = producer(&cfg, 1);
    let second = producer(&cfg, 2);
    let client = client(&cfg);
    client.add_instance(1).unwrap();
    client.add_instance(2).unwrap();

    second.post_text("only", "test", Severity::Info, "skip me in").unwrap();
    client.skip_waiting().unwrap();

    let start = Instant::now();
    let pass = client.wait_for_updates(Duration::from_secs(5), |_, _| {}).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(pass.status, WaitStatus::Signaled);
    assert_eq!(pass.delivered, 1);
}

#[test]
fn instances_drain_in_registration_order() {
    let cfg = config("order");
    let a = producer(&cfg, 10);
    let b = producer(&cfg, 20);
    let client = client(&cfg);
    client.add_instance(20).unwrap();
    client.add_instance(10).unwrap();

    a.post_text("x", "test", Severity::Info, "a").unwrap();
    b.post_text("x", "test", Severity::Info, "b").unwrap();
    let ids: Vec<u32> = texts(&client).into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![20, 10]);
}

#[test]
fn duplicate_add_replaces_in_place_and_unknown_remove_is_safe() {
    let cfg = config("table");
    let client = client(&cfg);
    client.add_instance(1).unwrap();
    client.add_instance(2).unwrap();
    client.add_instance(1).unwrap();
    assert_eq!(client.instance_ids(), vec![1, 2]);

    assert!(!client.remove_instance(99));
    assert!(client.remove_instance(1));
    assert_eq!(client.instance_ids(), vec![2]);

    client.clear_instances();
    assert!(client.instance_ids().is_empty());
    assert_eq!(client.pop_messages_and_call(|_, _| {}).unwrap(), 0);
}

#[test]
fn removing_the_representative_unblocks_the_waiter() {
    let cfg = config("cancel");
    let client = Arc::new(client(&cfg));
    client.add_instance(1).unwrap();

    let c = client.clone();
    let waiter = thread::spawn(move || c.wait_for_updates(Duration::from_secs(10), |_, _| {}).unwrap());
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    assert!(client.remove_instance(1));
    let pass = waiter.join().unwrap();
    assert_eq!(pass.status, WaitStatus::Relinquished);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn producer_drop_wakes_the_waiter() {
    let cfg = config("producer_exit");
    let prod = producer(&cfg, 1);
    let client = Arc::new(client(&cfg));
    client.add_instance(1).unwrap();

    let c = client.clone();
    let waiter = thread::spawn(move || c.wait_for_updates(Duration::from_secs(10), |_, _| {}).unwrap());
    thread::sleep(Duration::from_millis(50));
    drop(prod);
    assert_eq!(waiter.join().unwrap().status, WaitStatus::Signaled);
}

#[derive(Debug, Default)]
struct MeshStats {
    triangles: u32,
}

impl Payload for MeshStats {
    fn type_name(&self) -> &str {
        "mesh"
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.triangles.to_le_bytes());
    }

    fn deserialize(&mut self, bytes: &[u8]) -> diagring::Result<()> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| diagring::TransportError::Config("bad mesh payload".into()))?;
        self.triangles = u32::from_le_bytes(arr);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn unknown_type_is_consumed_counted_and_reported() {
    let cfg = config("unknown");
    let prod = producer(&cfg, 5);
    let client = client(&cfg);
    client.add_instance(5).unwrap();

    let reported = Arc::new(Mutex::new(Vec::new()));
    let r = reported.clone();
    client.set_unknown_type_hook(move |env| r.lock().unwrap().push(env.metadata.type_name.clone()));

    prod.post("geometry", "loader", &MeshStats { triangles: 12 }).unwrap();
    prod.post_text("geometry", "loader", Severity::Info, "loaded").unwrap();

    let mut visited = 0;
    let delivered = client.pop_messages_and_call(|_, _| visited += 1).unwrap();
    assert_eq!((delivered, visited), (1, 1));
    assert_eq!(*reported.lock().unwrap(), vec!["mesh".to_owned()]);
    assert_eq!(client.stats().unknown_type, 1);
    assert_eq!(client.stats().delivered, 1);

    // Nothing left behind.
    assert_eq!(client.pop_messages_and_call(|_, _| {}).unwrap(), 0);
}

#[test]
fn custom_payload_factories_are_used() {
    let cfg = config("custom");
    let prod = producer(&cfg, 5);
    let mut payloads = PayloadRegistry::new();
    payloads.register_default::<MeshStats>("mesh");
    let client = MessageClient::new(cfg.clone(), payloads).unwrap();
    client.add_instance(5).unwrap();

    prod.post("geometry", "loader", &MeshStats { triangles: 42 }).unwrap();
    let mut got = 0;
    client
        .pop_messages_and_call(|_, p| got = p.downcast_ref::<MeshStats>().unwrap().triangles)
        .unwrap();
    assert_eq!(got, 42);
}

#[test]
fn corrupt_tail_is_flushed_and_counted() {
    let cfg = config("corrupt");
    let prod = producer(&cfg, 4);
    let client = client(&cfg);
    client.add_instance(4).unwrap();

    prod.post_text("ok", "test", Severity::Info, "before").unwrap();
    {
        let data = prod.instance().data();
        let mut g = data.lock(false, Duration::from_millis(100)).unwrap().unwrap();
        g.reserve(3);
        g.write(&[0xee, 0xee, 0x00]).unwrap();
    }
    prod.post_text("ok", "test", Severity::Info, "lost with the tail").unwrap();

    assert_eq!(texts(&client), vec![(4, "before".to_owned())]);
    assert_eq!(client.stats().corrupt_flushes, 1);

    prod.post_text("ok", "test", Severity::Info, "after").unwrap();
    assert_eq!(texts(&client), vec![(4, "after".to_owned())]);
}

#[test]
fn visitor_and_hook_may_call_back_into_the_client() {
    let cfg = config("reentrant");
    let prod = producer(&cfg, 6);
    let client = Arc::new(client(&cfg));
    client.add_instance(6).unwrap();

    let weak = Arc::downgrade(&client);
    client.set_unknown_type_hook(move |_| {
        if let Some(c) = weak.upgrade() {
            let _ = c.stats();
            let _ = c.instance_ids();
        }
    });

    prod.post("mesh", "loader", &MeshStats { triangles: 3 }).unwrap();
    prod.post_text("a", "test", Severity::Info, "one").unwrap();
    prod.post_text("a", "test", Severity::Info, "two").unwrap();

    let (tx, rx) = mpsc::channel();
    let c = client.clone();
    thread::spawn(move || {
        let mut nested = Vec::new();
        let delivered = c
            .pop_messages_and_call(|_, _| {
                nested.push(c.pop_messages_and_call(|_, _| {}).unwrap());
                let _ = c.stats();
            })
            .unwrap();
        let _ = tx.send((delivered, nested));
    });
    let (delivered, nested) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("drain blocked on the client's own locks");
    assert_eq!(delivered, 2);
    // The outer pass already took every record.
    assert_eq!(nested, vec![0, 0]);
    assert_eq!(client.stats().unknown_type, 1);
}

#[test]
fn distributed_list_reaches_instances_added_later() {
    let cfg = config("distribute_first");
    let client = client(&cfg);
    let settings = vec![DesiredSetting::new("net", true)];
    // Nobody attached yet: nothing accepts it, but the list is kept.
    assert_eq!(client.distribute(settings.clone()).unwrap(), 0);
    assert_eq!(client.desired_settings(), Some(settings));

    let reg = ControlRegistry::new();
    let net = Arc::new(CategorySwitch::new(Metadata::new(TextPayload::TYPE_NAME, "net", "io"), false));
    let _a = reg.announce(net.clone());
    let prod = Producer::new(cfg.clone(), 8, reg).unwrap();
    client.add_instance(8).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !net.is_enabled() && Instant::now() < deadline {
        prod.service_control(Some(Duration::from_millis(20))).unwrap();
    }
    assert!(net.is_enabled());
}
