// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One producer's set of shared objects.
//
//   <base>/<identifier>.<id>         data ring        -> rings .bell
//   <base>/<identifier>.<id>.ctl     category toggles -> rings .admin
//   <base>/<identifier>.<id>.qry     category queries -> rings .admin
//   <base>/<identifier>.<id>.set     settings docs    -> rings .admin
//   <base>/<identifier>.<id>.rpl     query replies    -> rings .reply
//
// Producer and consumers open the same objects; whichever side comes first
// creates them. The role only decides what happens on close.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::{decode_toggle, encode_toggle, Metadata, MAX_BODY, MIN_METADATA_LEN};
use crate::config::TransportConfig;
use crate::cyclic::{BufferOptions, CyclicBuffer, PopOutcome, WriteOutcome};
use crate::doorbell::{Doorbell, WaitStatus};
use crate::error::Result;
use crate::platform::posix::current_pid;
use crate::shm_name::{object_name, ObjectRole};

const CONTROL_CAPACITY: usize = 4 * 1024;
const QUERY_CAPACITY: usize = 1024;
const SETTINGS_CAPACITY: usize = 64 * 1024;
const REPLY_CAPACITY: usize = 40 * 1024;

/// Upper bound of one category-query reply.
pub const REPLY_SCRATCH: usize = 32 * 1024;

const SEQ_LEN: usize = 4;

/// Which side of the transport opened an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    /// Owns the data ring; rings every doorbell on close.
    Producer,
    /// Drains the data ring; relinquishes its doorbell handles on close.
    Consumer,
}

/// A request read from the administrative channels by the producer.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminRequest {
    Toggle { metadata: Metadata, enabled: bool },
    /// Raw distribution document (JSON).
    Settings(Vec<u8>),
    Query { seq: u32 },
}

/// Records taken out of the data ring in one locked pass.
#[derive(Debug, Default)]
pub struct DataBatch {
    bytes: Vec<u8>,
    spans: Vec<Range<usize>>,
    /// Unread bytes discarded because of an implausible length prefix.
    pub flushed: usize,
}

impl DataBatch {
    /// Record bodies in FIFO order.
    pub fn bodies(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.spans.iter().map(move |r| &self.bytes[r.clone()])
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// The data ring, administrative rings and doorbells of one producer.
pub struct BufferInstance {
    producer_id: u32,
    role: InstanceRole,
    lock_timeout: Duration,
    data: CyclicBuffer,
    data_bell: Arc<Doorbell>,
    control: CyclicBuffer,
    query: CyclicBuffer,
    settings: CyclicBuffer,
    admin_bell: Arc<Doorbell>,
    reply: CyclicBuffer,
    reply_bell: Arc<Doorbell>,
    next_seq: AtomicU32,
}

impl BufferInstance {
    /// Create or attach to the objects of `producer_id` described by `cfg`.
    pub fn open(cfg: &TransportConfig, producer_id: u32, role: InstanceRole) -> Result<Self> {
        let name = |r| object_name(&cfg.base_path, &cfg.identifier, producer_id, r);

        let data_bell = Arc::new(Doorbell::open(&name(ObjectRole::DataBell))?);
        let admin_bell = Arc::new(Doorbell::open(&name(ObjectRole::AdminBell))?);
        let reply_bell = Arc::new(Doorbell::open(&name(ObjectRole::ReplyBell))?);

        let ring = |role, opts: BufferOptions, bell: &Arc<Doorbell>| -> Result<CyclicBuffer> {
            let mut buf = CyclicBuffer::open_or_create(&name(role), opts)?;
            buf.set_data_listener(bell.clone());
            Ok(buf)
        };
        let data = ring(
            ObjectRole::Data,
            BufferOptions::new(cfg.buffer_size, cfg.overwrite_on_full),
            &data_bell,
        )?;
        let control = ring(
            ObjectRole::Control,
            BufferOptions::new(CONTROL_CAPACITY, true).min_body(MIN_METADATA_LEN + 1),
            &admin_bell,
        )?;
        let query = ring(
            ObjectRole::Query,
            BufferOptions::new(QUERY_CAPACITY, true).min_body(SEQ_LEN),
            &admin_bell,
        )?;
        let settings = ring(
            ObjectRole::Settings,
            BufferOptions::new(SETTINGS_CAPACITY, true).min_body(2),
            &admin_bell,
        )?;
        let reply = ring(
            ObjectRole::Reply,
            BufferOptions::new(REPLY_CAPACITY, true).min_body(SEQ_LEN),
            &reply_bell,
        )?;

        tracing::debug!(producer_id, ?role, data = data.name(), "opened buffer instance");
        Ok(Self {
            producer_id,
            role,
            lock_timeout: cfg.lock_timeout(),
            data,
            data_bell,
            control,
            query,
            settings,
            admin_bell,
            reply,
            reply_bell,
            next_seq: AtomicU32::new(current_pid().wrapping_shl(16)),
        })
    }

    pub fn producer_id(&self) -> u32 {
        self.producer_id
    }

    pub fn role(&self) -> InstanceRole {
        self.role
    }

    pub fn data(&self) -> &CyclicBuffer {
        &self.data
    }

    pub fn data_bell(&self) -> &Arc<Doorbell> {
        &self.data_bell
    }

    pub fn admin_bell(&self) -> &Arc<Doorbell> {
        &self.admin_bell
    }

    // -----------------------------------------------------------------------
    // Data channel
    // -----------------------------------------------------------------------

    /// Store one framed record in the data ring. `Ok(None)` if the ring
    /// could not be locked in time.
    pub fn write_record(&self, record: &[u8]) -> Result<Option<WriteOutcome>> {
        let Some(mut guard) = self.data.lock(false, self.lock_timeout)? else {
            return Ok(None);
        };
        Ok(Some(guard.write_record(record)?))
    }

    /// Move every readable record out of the data ring, using `scratch` as
    /// the per-record bound. `Ok(None)` if the ring could not be locked in
    /// time.
    pub fn take_records(&self, scratch: &mut [u8]) -> Result<Option<DataBatch>> {
        let Some(mut guard) = self.data.lock(false, self.lock_timeout)? else {
            return Ok(None);
        };
        let mut batch = DataBatch::default();
        loop {
            match guard.pop_record(scratch)? {
                PopOutcome::Record(len) => {
                    let start = batch.bytes.len();
                    batch.bytes.extend_from_slice(&scratch[..len]);
                    batch.spans.push(start..start + len);
                }
                PopOutcome::Empty => break,
                PopOutcome::Corrupt { flushed } => {
                    batch.flushed += flushed;
                    break;
                }
            }
        }
        Ok(Some(batch))
    }

    // -----------------------------------------------------------------------
    // Consumer side of the administrative channels
    // -----------------------------------------------------------------------

    /// Push a category toggle. Returns whether it was stored.
    pub fn push_toggle(&self, metadata: &Metadata, enabled: bool) -> Result<bool> {
        let mut body = Vec::with_capacity(metadata.encoded_len() + 1);
        encode_toggle(metadata, enabled, &mut body)?;
        self.push(&self.control, &body)
    }

    /// Push a distribution document. Returns whether it was stored.
    pub fn push_settings(&self, document: &[u8]) -> Result<bool> {
        self.push(&self.settings, document)
    }

    fn push(&self, ring: &CyclicBuffer, body: &[u8]) -> Result<bool> {
        let Some(mut guard) = ring.lock(false, self.lock_timeout)? else {
            tracing::debug!(ring = ring.name(), "admin ring lock timed out");
            return Ok(false);
        };
        match guard.write_body(body)? {
            WriteOutcome::Written { .. } => Ok(true),
            WriteOutcome::Dropped(reason) => {
                tracing::warn!(ring = ring.name(), ?reason, len = body.len(), "admin record dropped");
                Ok(false)
            }
        }
    }

    /// Ask the producer for its enabled categories and wait up to `timeout`
    /// for the answer. `Ok(None)` if none arrived.
    pub fn query_categories(&self, timeout: Duration) -> Result<Option<Vec<Metadata>>> {
        let deadline = Instant::now() + timeout;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if !self.push(&self.query, &seq.to_le_bytes())? {
            return Ok(None);
        }
        let mut scratch = vec![0u8; self.reply.max_body()];
        loop {
            self.reply_bell.acknowledge()?;
            if let Some(list) = self.find_reply(seq, &mut scratch)? {
                return Ok(Some(list));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.reply_bell.wait(Some(remaining))? {
                WaitStatus::Signaled => continue,
                WaitStatus::TimedOut | WaitStatus::Relinquished => break,
            }
        }
        tracing::debug!(producer_id = self.producer_id, seq, "category query unanswered");
        Ok(None)
    }

    fn find_reply(&self, seq: u32, scratch: &mut [u8]) -> Result<Option<Vec<Metadata>>> {
        let Some(mut guard) = self.reply.lock(false, self.lock_timeout)? else {
            return Ok(None);
        };
        while let PopOutcome::Record(len) = guard.pop_record(scratch)? {
            let (head, rest) = scratch[..len].split_at(SEQ_LEN);
            let got = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            if got != seq {
                // Stale answer to an earlier, abandoned query.
                continue;
            }
            return Metadata::decode_list(rest).map(Some);
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Producer side of the administrative channels
    // -----------------------------------------------------------------------

    /// Wait until a consumer pushes something to the administrative
    /// channels. A signaled wait is acknowledged before returning.
    pub fn wait_admin(&self, timeout: Option<Duration>) -> Result<WaitStatus> {
        let status = self.admin_bell.wait(timeout)?;
        if status == WaitStatus::Signaled {
            self.admin_bell.acknowledge()?;
        }
        Ok(status)
    }

    /// Pop every pending administrative request: settings first, then
    /// toggles, then queries. Undecodable records are logged and skipped.
    pub fn drain_admin(&self) -> Result<Vec<AdminRequest>> {
        let mut out = Vec::new();
        let mut scratch = vec![0u8; MAX_BODY];

        self.drain_ring(&self.settings, &mut scratch, &mut out, |body| {
            Some(AdminRequest::Settings(body.to_vec()))
        })?;
        self.drain_ring(&self.control, &mut scratch, &mut out, |body| match decode_toggle(body) {
            Ok((metadata, enabled)) => Some(AdminRequest::Toggle { metadata, enabled }),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable toggle");
                None
            }
        })?;
        self.drain_ring(&self.query, &mut scratch, &mut out, |body| {
            let seq = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            Some(AdminRequest::Query { seq })
        })?;
        Ok(out)
    }

    fn drain_ring<F>(
        &self,
        ring: &CyclicBuffer,
        scratch: &mut [u8],
        out: &mut Vec<AdminRequest>,
        mut decode: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Option<AdminRequest>,
    {
        let Some(mut guard) = ring.lock(false, self.lock_timeout)? else {
            return Ok(());
        };
        while let PopOutcome::Record(len) = guard.pop_record(scratch)? {
            out.extend(decode(&scratch[..len]));
        }
        Ok(())
    }

    /// Answer query `seq` with `categories`, truncating the list so the
    /// reply stays within [`REPLY_SCRATCH`].
    pub fn send_reply(&self, seq: u32, categories: &[Metadata]) -> Result<bool> {
        let mut body = Vec::with_capacity(256);
        body.extend_from_slice(&seq.to_le_bytes());
        for md in categories {
            if body.len() + md.encoded_len() > REPLY_SCRATCH {
                tracing::warn!(seq, total = categories.len(), "category reply truncated");
                break;
            }
            md.encode(&mut body)?;
        }
        self.push(&self.reply, &body)
    }

    // -----------------------------------------------------------------------

    /// Wake everything parked on this instance's doorbells.
    pub fn ring_all(&self) {
        for bell in [&self.data_bell, &self.admin_bell, &self.reply_bell] {
            if let Err(e) = bell.ring() {
                tracing::warn!(doorbell = bell.name(), error = %e, "failed to ring doorbell");
            }
        }
    }

    /// Release this handle's doorbell interest, unblocking local waiters.
    pub fn relinquish(&self) {
        for bell in [&self.data_bell, &self.admin_bell, &self.reply_bell] {
            if let Err(e) = bell.relinquish() {
                tracing::warn!(doorbell = bell.name(), error = %e, "failed to relinquish doorbell");
            }
        }
    }

    /// Remove every named object of `producer_id`.
    pub fn clear_storage(cfg: &TransportConfig, producer_id: u32) {
        let name = |r| object_name(&cfg.base_path, &cfg.identifier, producer_id, r);
        for role in [
            ObjectRole::Data,
            ObjectRole::Control,
            ObjectRole::Query,
            ObjectRole::Settings,
            ObjectRole::Reply,
        ] {
            CyclicBuffer::clear_storage(&name(role));
        }
        for role in [ObjectRole::DataBell, ObjectRole::AdminBell, ObjectRole::ReplyBell] {
            Doorbell::clear_storage(&name(role));
        }
    }
}

impl Drop for BufferInstance {
    fn drop(&mut self) {
        match self.role {
            InstanceRole::Producer => self.ring_all(),
            InstanceRole::Consumer => self.relinquish(),
        }
        tracing::debug!(producer_id = self.producer_id, role = ?self.role, "closed buffer instance");
    }
}

impl std::fmt::Debug for BufferInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferInstance")
            .field("producer_id", &self.producer_id)
            .field("role", &self.role)
            .field("data", &self.data)
            .finish()
    }
}
