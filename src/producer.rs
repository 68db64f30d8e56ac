// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Producer endpoint: owns one buffer instance, posts records into it and
// services the consumers' administrative requests against a control registry.

use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backoff::adaptive_yield;
use crate::codec::{encode_record, Envelope, Metadata};
use crate::config::{FlushMode, SeverityMask, TransportConfig};
use crate::control::ControlRegistry;
use crate::cyclic::{DropReason, WriteOutcome};
use crate::doorbell::{Doorbell, WaitStatus};
use crate::error::{Result, TransportError};
use crate::instance::{AdminRequest, BufferInstance, InstanceRole};
use crate::payload::{Payload, Severity, TextPayload};

/// Longest single wait of the control worker before it re-checks for stop.
const WORKER_POLL: Duration = Duration::from_millis(250);

/// What happened to one posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// Stored; `evicted` bytes of older records made room for it.
    Written { evicted: usize },
    /// Its category or severity is switched off.
    Filtered,
    /// Did not fit and was dropped.
    Dropped(DropReason),
    /// The buffer stayed locked for the whole lock timeout.
    LockTimedOut,
}

/// Writes diagnostic records for one producer id.
pub struct Producer {
    config: TransportConfig,
    instance: BufferInstance,
    registry: Arc<ControlRegistry>,
    severities: AtomicU32,
    dropped: AtomicU64,
}

impl Producer {
    /// Create (or re-attach to) the instance of `producer_id`. Toggles and
    /// settings pushed by consumers are applied to `registry`.
    pub fn new(config: TransportConfig, producer_id: u32, registry: Arc<ControlRegistry>) -> Result<Self> {
        config.validate()?;
        let instance = BufferInstance::open(&config, producer_id, InstanceRole::Producer)?;
        Ok(Self {
            severities: AtomicU32::new(config.default_enabled.bits()),
            config,
            instance,
            registry,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn producer_id(&self) -> u32 {
        self.instance.producer_id()
    }

    pub fn registry(&self) -> &Arc<ControlRegistry> {
        &self.registry
    }

    pub fn instance(&self) -> &BufferInstance {
        &self.instance
    }

    pub fn severities(&self) -> SeverityMask {
        SeverityMask::from_bits(self.severities.load(Ordering::Relaxed))
    }

    pub fn set_severities(&self, mask: SeverityMask) {
        self.severities.store(mask.bits(), Ordering::Relaxed);
    }

    /// Messages dropped for lack of space or lock time.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Posting
    // -----------------------------------------------------------------------

    /// Post `payload` under `category`/`module`, tagged with the caller's
    /// source location.
    #[track_caller]
    pub fn post(&self, category: &str, module: &str, payload: &dyn Payload) -> Result<PostOutcome> {
        let at = Location::caller();
        self.post_at(category, module, payload, at.file(), at.line())
    }

    /// Post a [`TextPayload`], honouring the severity mask.
    #[track_caller]
    pub fn post_text(&self, category: &str, module: &str, severity: Severity, text: &str) -> Result<PostOutcome> {
        if !self.severities().contains(severity) {
            return Ok(PostOutcome::Filtered);
        }
        let at = Location::caller();
        let payload = TextPayload::new(severity, text);
        self.post_at(category, module, &payload, at.file(), at.line())
    }

    /// Post with an explicit source location.
    pub fn post_at(
        &self,
        category: &str,
        module: &str,
        payload: &dyn Payload,
        file: &str,
        line: u32,
    ) -> Result<PostOutcome> {
        let metadata = Metadata::new(payload.type_name(), category, module);
        if self.registry.is_enabled(&metadata) == Some(false) {
            return Ok(PostOutcome::Filtered);
        }

        let envelope = Envelope::new(self.producer_id(), metadata, file, line);
        let mut bytes = Vec::new();
        payload.serialize(&mut bytes);
        let mut record = Vec::with_capacity(2 + envelope.encoded_len() + bytes.len());
        match encode_record(&envelope, &bytes, &mut record) {
            Ok(()) => {}
            Err(TransportError::RecordTooLarge { size, .. }) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(size, "message larger than any record, dropped");
                return Ok(PostOutcome::Dropped(DropReason::TooLarge));
            }
            Err(e) => return Err(e),
        }

        let outcome = match self.instance.write_record(&record)? {
            None => PostOutcome::LockTimedOut,
            Some(WriteOutcome::Written { evicted }) => PostOutcome::Written { evicted },
            Some(WriteOutcome::Dropped(reason)) => PostOutcome::Dropped(reason),
        };
        match outcome {
            PostOutcome::Written { .. } if self.config.flush_mode == FlushMode::Always => {
                self.flush(self.config.flush_timeout())?;
            }
            PostOutcome::Dropped(_) | PostOutcome::LockTimedOut => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Wait until consumers have drained the buffer. Returns `false` if
    /// records are still unread after `timeout`.
    pub fn flush(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        loop {
            if self.instance.data().stats()?.used == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            adaptive_yield(&mut k);
        }
    }

    // -----------------------------------------------------------------------
    // Administrative channels
    // -----------------------------------------------------------------------

    /// Wait up to `timeout` (`None`: forever) for consumer requests, then
    /// handle every pending one. Returns how many were handled.
    pub fn service_control(&self, timeout: Option<Duration>) -> Result<usize> {
        if self.instance.wait_admin(timeout)? == WaitStatus::Relinquished {
            return Ok(0);
        }
        let requests = self.instance.drain_admin()?;
        for req in &requests {
            self.handle(req)?;
        }
        Ok(requests.len())
    }

    fn handle(&self, req: &AdminRequest) -> Result<()> {
        match req {
            AdminRequest::Toggle { metadata, enabled } => {
                self.registry.apply_toggle(metadata, *enabled);
            }
            AdminRequest::Settings(doc) => {
                if let Err(e) = self.registry.apply_document(doc) {
                    tracing::warn!(error = %e, label = e.as_label(), "ignoring settings document");
                }
            }
            AdminRequest::Query { seq } => {
                let categories = self.registry.enabled_categories();
                self.instance.send_reply(*seq, &categories)?;
            }
        }
        Ok(())
    }

    /// Run [`service_control`](Self::service_control) on a background
    /// thread until the returned worker is dropped.
    pub fn spawn_control_worker(self: &Arc<Self>) -> Result<ControlWorker> {
        let stop = Arc::new(AtomicBool::new(false));
        let producer = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("diag-control-{}", self.producer_id()))
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    if let Err(e) = producer.service_control(Some(WORKER_POLL)) {
                        tracing::warn!(error = %e, "control service pass failed");
                        std::thread::sleep(WORKER_POLL);
                    }
                }
            })?;
        Ok(ControlWorker {
            stop,
            bell: self.instance.admin_bell().clone(),
            handle: Some(handle),
        })
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("instance", &self.instance)
            .field("severities", &self.severities())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Background thread servicing a producer's administrative channels.
/// Stops and joins on drop.
pub struct ControlWorker {
    stop: Arc<AtomicBool>,
    bell: Arc<Doorbell>,
    handle: Option<JoinHandle<()>>,
}

impl ControlWorker {
    /// Stop and join now instead of at drop.
    pub fn stop(self) {}
}

impl Drop for ControlWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.bell.ring() {
            tracing::warn!(error = %e, "failed to wake control worker");
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("control worker panicked");
            }
        }
    }
}
