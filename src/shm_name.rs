// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Rendezvous names for buffers and doorbells.
//
// A producer's objects are addressed by `<base_path>/<identifier>.<id>` plus a
// role suffix. Those logical names are folded into POSIX shm object names:
// one leading '/', every other separator turned into '_', and names over the
// platform limit shortened with an FNV-1a hash.

use std::path::Path;

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length for POSIX shm names; 0 disables truncation.
///
/// `PSHMNAMLEN` is 31 on macOS; Linux allows up to NAME_MAX.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Produce a POSIX shm-safe name (leading '/', no other '/').
///
/// Names longer than [`SHM_NAME_MAX`] become `/<prefix>_<16 hex digits>`.
pub fn make_shm_name(name: &str) -> String {
    let body: String = name
        .trim_start_matches('/')
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let result = format!("/{body}");

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    // '/' + prefix + '_' + 16 hex digits
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);
    let hash = fnv1a_64(result.as_bytes());

    let mut prefix_end = prefix_len.min(body.len());
    while !body.is_char_boundary(prefix_end) {
        prefix_end -= 1;
    }
    format!("/{}_{hash:016x}", &body[..prefix_end])
}

/// Role of a named object belonging to one buffer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRole {
    /// Producer → consumer record ring.
    Data,
    /// Doorbell rung after every data write.
    DataBell,
    /// Consumer → producer category toggles.
    Control,
    /// Consumer → producer category queries.
    Query,
    /// Consumer → producer distribution documents.
    Settings,
    /// Doorbell rung after any administrative push.
    AdminBell,
    /// Producer → consumer query replies.
    Reply,
    /// Doorbell rung after every reply.
    ReplyBell,
}

impl ObjectRole {
    fn suffix(self) -> &'static str {
        match self {
            ObjectRole::Data => "",
            ObjectRole::DataBell => ".bell",
            ObjectRole::Control => ".ctl",
            ObjectRole::Query => ".qry",
            ObjectRole::Settings => ".set",
            ObjectRole::AdminBell => ".admin",
            ObjectRole::Reply => ".rpl",
            ObjectRole::ReplyBell => ".reply",
        }
    }
}

/// Logical name of one of a producer's objects:
/// `<base_path>/<identifier>.<producer_id><suffix>`.
pub fn object_name(base_path: &Path, identifier: &str, producer_id: u32, role: ObjectRole) -> String {
    let base = base_path.to_string_lossy();
    let base = base.trim_end_matches('/');
    format!("{base}/{identifier}.{producer_id}{}", role.suffix())
}
