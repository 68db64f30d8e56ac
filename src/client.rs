// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Consumer endpoint: attaches to any number of producers' instances, drains
// them in registration order and pushes category toggles and settings back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::codec::{decode_envelope, Envelope, Metadata, MAX_BODY};
use crate::config::TransportConfig;
use crate::control::{DesiredSetting, DistributionDocument};
use crate::doorbell::{Doorbell, WaitStatus};
use crate::error::Result;
use crate::instance::{BufferInstance, InstanceRole};
use crate::payload::{Payload, PayloadRegistry};

/// Counters of everything the drain loop saw, since the client was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Records decoded and handed to the visitor.
    pub delivered: u64,
    /// Records whose type had no registered factory.
    pub unknown_type: u64,
    /// Records whose envelope or payload failed to decode.
    pub malformed: u64,
    /// Buffer tails discarded after an implausible length prefix.
    pub corrupt_flushes: u64,
    /// Drain passes that skipped an instance because its lock timed out.
    pub lock_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    unknown_type: AtomicU64,
    malformed: AtomicU64,
    corrupt_flushes: AtomicU64,
    lock_timeouts: AtomicU64,
}

/// Result of one [`MessageClient::wait_for_updates`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePass {
    /// How the wait on the representative doorbell ended.
    pub status: WaitStatus,
    /// Records delivered by the drain that followed.
    pub delivered: usize,
}

type UnknownTypeHook = Box<dyn FnMut(&Envelope) + Send>;

/// Drains the buffers of a set of producers.
///
/// One worker thread usually owns the [`wait_for_updates`](Self::wait_for_updates)
/// loop; other threads may add or remove instances and push toggles
/// concurrently.
pub struct MessageClient {
    config: TransportConfig,
    payloads: PayloadRegistry,
    instances: Mutex<Vec<Arc<BufferInstance>>>,
    desired: Mutex<Option<Vec<DesiredSetting>>>,
    scratch: Mutex<Vec<u8>>,
    skip: AtomicBool,
    counters: Counters,
    unknown_hook: Mutex<Option<UnknownTypeHook>>,
}

impl MessageClient {
    pub fn new(config: TransportConfig, payloads: PayloadRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            payloads,
            instances: Mutex::new(Vec::new()),
            desired: Mutex::new(None),
            scratch: Mutex::new(vec![0u8; MAX_BODY]),
            skip: AtomicBool::new(false),
            counters: Counters::default(),
            unknown_hook: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn instances(&self) -> MutexGuard<'_, Vec<Arc<BufferInstance>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<BufferInstance>> {
        self.instances().clone()
    }

    // -----------------------------------------------------------------------
    // Instance table
    // -----------------------------------------------------------------------

    /// Attach to producer `producer_id`, creating its objects if the producer
    /// has not started yet. Adding an id again replaces the old handle in
    /// place.
    pub fn add_instance(&self, producer_id: u32) -> Result<()> {
        let inst = Arc::new(BufferInstance::open(&self.config, producer_id, InstanceRole::Consumer)?);
        if let Some(settings) = self.desired.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            push_document(&inst, settings)?;
        }
        let replaced = {
            let mut list = self.instances();
            match list.iter().position(|i| i.producer_id() == producer_id) {
                Some(pos) => Some(std::mem::replace(&mut list[pos], inst)),
                None => {
                    list.push(inst);
                    None
                }
            }
        };
        tracing::debug!(producer_id, replaced = replaced.is_some(), "added instance");
        Ok(())
    }

    /// Detach from `producer_id`. Returns whether it was attached.
    pub fn remove_instance(&self, producer_id: u32) -> bool {
        let removed = {
            let mut list = self.instances();
            list.iter()
                .position(|i| i.producer_id() == producer_id)
                .map(|pos| list.remove(pos))
        };
        if let Some(inst) = &removed {
            inst.relinquish();
            tracing::debug!(producer_id, "removed instance");
        }
        removed.is_some()
    }

    pub fn clear_instances(&self) {
        let list = std::mem::take(&mut *self.instances());
        for inst in &list {
            inst.relinquish();
        }
        tracing::debug!(count = list.len(), "cleared instances");
    }

    /// Attached producer ids in registration order.
    pub fn instance_ids(&self) -> Vec<u32> {
        self.instances().iter().map(|i| i.producer_id()).collect()
    }

    fn representative(&self) -> Option<Arc<Doorbell>> {
        self.instances().first().map(|i| i.data_bell().clone())
    }

    // -----------------------------------------------------------------------
    // Wait and drain
    // -----------------------------------------------------------------------

    /// Wait up to `timeout` for the first-registered instance to be written
    /// to, then drain every instance through `visit`.
    ///
    /// The drain runs whatever the wait returned: only the representative
    /// instance rings the shared wait, so the others are polled here.
    pub fn wait_for_updates<F>(&self, timeout: Duration, visit: F) -> Result<UpdatePass>
    where
        F: FnMut(&Envelope, &dyn Payload),
    {
        let representative = self.representative();
        let status = match &representative {
            _ if self.skip.load(Ordering::Acquire) => WaitStatus::Signaled,
            Some(bell) => bell.wait(Some(timeout))?,
            None => self.idle(timeout),
        };
        if status == WaitStatus::Signaled {
            if let Some(bell) = &representative {
                bell.acknowledge()?;
            }
        }
        self.skip.store(false, Ordering::Release);
        let delivered = self.pop_messages_and_call(visit)?;
        Ok(UpdatePass { status, delivered })
    }

    fn idle(&self, timeout: Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if self.skip.load(Ordering::Acquire) {
                return WaitStatus::Signaled;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return WaitStatus::TimedOut;
            }
            std::thread::sleep(left.min(Duration::from_millis(5)));
        }
    }

    /// Make the current or next [`wait_for_updates`](Self::wait_for_updates)
    /// return at once and drain.
    pub fn skip_waiting(&self) -> Result<()> {
        self.skip.store(true, Ordering::Release);
        if let Some(bell) = self.representative() {
            bell.ring()?;
        }
        Ok(())
    }

    /// Drain every attached instance in registration order, calling `visit`
    /// for each record whose payload type is registered. Returns how many
    /// records were delivered.
    ///
    /// Records are copied out before `visit` runs, so the visitor may call
    /// back into the client.
    pub fn pop_messages_and_call<F>(&self, mut visit: F) -> Result<usize>
    where
        F: FnMut(&Envelope, &dyn Payload),
    {
        let instances = self.snapshot();
        let mut delivered = 0;
        for inst in &instances {
            let taken = {
                let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
                inst.take_records(&mut scratch)?
            };
            let Some(batch) = taken else {
                self.counters.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(producer_id = inst.producer_id(), "instance lock timed out, skipped");
                continue;
            };
            if batch.flushed > 0 {
                self.counters.corrupt_flushes.fetch_add(1, Ordering::Relaxed);
            }
            for body in batch.bodies() {
                if self.deliver(inst.producer_id(), body, &mut visit) {
                    delivered += 1;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(delivered)
    }

    fn deliver<F>(&self, producer_id: u32, body: &[u8], visit: &mut F) -> bool
    where
        F: FnMut(&Envelope, &dyn Payload),
    {
        let (envelope, bytes) = match decode_envelope(body, producer_id) {
            Ok(v) => v,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(producer_id, error = %e, "undecodable envelope");
                return false;
            }
        };
        let Some(mut payload) = self.payloads.create(&envelope.metadata.type_name) else {
            self.counters.unknown_type.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(producer_id, metadata = %envelope.metadata, "no factory for payload type");
            self.report_unknown(&envelope);
            return false;
        };
        if let Err(e) = payload.deserialize(bytes) {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(producer_id, metadata = %envelope.metadata, error = %e, "undecodable payload");
            return false;
        }
        visit(&envelope, payload.as_ref());
        true
    }

    fn report_unknown(&self, envelope: &Envelope) {
        // Run the hook unlocked; it may call back into the client.
        let taken = self.unknown_hook.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut hook) = taken {
            hook(envelope);
            let mut slot = self.unknown_hook.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    /// Called with the envelope of every record dropped for lack of a factory.
    pub fn set_unknown_type_hook<F>(&self, hook: F)
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        *self.unknown_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.counters;
        ClientStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            unknown_type: c.unknown_type.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            corrupt_flushes: c.corrupt_flushes.load(Ordering::Relaxed),
            lock_timeouts: c.lock_timeouts.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Ask every attached producer to enable or disable the category in
    /// `metadata` (an empty module means all modules). Returns how many
    /// instances accepted the toggle.
    pub fn enable(&self, metadata: &Metadata, enabled: bool) -> Result<usize> {
        let mut accepted = 0;
        for inst in self.snapshot() {
            if inst.push_toggle(metadata, enabled)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Live enabled categories of every attached producer. Producers that do
    /// not answer within the configured query timeout contribute nothing.
    pub fn enabled(&self) -> Result<impl Iterator<Item = Metadata>> {
        let mut all = Vec::new();
        for inst in self.snapshot() {
            if let Some(list) = inst.query_categories(self.config.query_timeout())? {
                all.extend(list);
            }
        }
        Ok(all.into_iter())
    }

    /// Replace the desired settings and push them to every attached producer.
    /// Instances added later receive the same list, whether or not every
    /// push succeeded. Returns how many instances accepted it.
    pub fn distribute(&self, settings: Vec<DesiredSetting>) -> Result<usize> {
        let doc = DistributionDocument(settings.clone()).to_json_vec()?;
        *self.desired.lock().unwrap_or_else(|e| e.into_inner()) = Some(settings);

        let mut accepted = 0;
        for inst in self.snapshot() {
            match inst.push_settings(&doc) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(producer_id = inst.producer_id(), error = %e, "settings push failed");
                }
            }
        }
        Ok(accepted)
    }

    /// Desired settings last passed to [`distribute`](Self::distribute).
    pub fn desired_settings(&self) -> Option<Vec<DesiredSetting>> {
        self.desired.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for MessageClient {
    fn drop(&mut self) {
        self.clear_instances();
    }
}

impl std::fmt::Debug for MessageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageClient")
            .field("instances", &self.instance_ids())
            .field("stats", &self.stats())
            .finish()
    }
}

fn push_document(inst: &BufferInstance, settings: &[DesiredSetting]) -> Result<bool> {
    let doc = DistributionDocument(settings.to_vec()).to_json_vec()?;
    inst.push_settings(&doc)
}
