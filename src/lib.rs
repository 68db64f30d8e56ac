// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process diagnostic message transport.
//
// Every producer process owns a cyclic buffer of length-prefixed records in
// named shared memory, plus a doorbell that wakes consumers and small
// administrative rings through which consumers switch categories on and off.
// Consumers attach to any number of producers with a `MessageClient`.

#[cfg(not(unix))]
compile_error!("diagring requires POSIX shared memory and process-shared pthread primitives");

pub mod shm_name;

mod platform;

mod backoff;

mod shm;
pub use shm::{ShmHandle, ShmLayout, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod error;
pub use error::{Result, TransportError};

pub mod codec;
pub use codec::{Envelope, Metadata, Timestamp};

pub mod cyclic;
pub use cyclic::{BufferGuard, BufferOptions, BufferStats, CyclicBuffer, DataListener};

mod doorbell;
pub use doorbell::{Doorbell, WaitStatus};

pub mod config;
pub use config::{FlushMode, SeverityMask, TransportConfig};

pub mod payload;
pub use payload::{Payload, PayloadRegistry, Severity, TextPayload};

pub mod instance;
pub use instance::{BufferInstance, InstanceRole};

pub mod control;
pub use control::{Announcement, CategorySwitch, Control, ControlRegistry, DesiredSetting};

mod client;
pub use client::{ClientStats, MessageClient, UpdatePass};

mod producer;
pub use producer::{ControlWorker, PostOutcome, Producer};
