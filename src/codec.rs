// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Binary layout of metadata, envelopes, records and control toggles.
//
// All integers are little endian; strings are NUL terminated.
//
//   record   = [u16 body_len][body]
//   body     = [u64 timestamp][u32 line][file\0][module\0][category\0][type\0][payload]
//   metadata = [module\0][category\0][type\0]
//   toggle   = [metadata][u8 enabled]

use crate::error::{Result, TransportError};
use crate::platform::posix::monotonic_nanos;

/// Bytes of the length prefix in front of every record body.
pub const LEN_PREFIX: usize = 2;

/// Largest body a length prefix can describe.
pub const MAX_BODY: usize = u16::MAX as usize;

/// Smallest possible envelope: timestamp, line and four empty strings.
pub const MIN_ENVELOPE_LEN: usize = 8 + 4 + 4;

/// Smallest possible serialized metadata: three empty strings.
pub const MIN_METADATA_LEN: usize = 3;

/// Class of a diagnostic message: payload type, category and module.
///
/// `type_name` selects the payload factory on the consumer side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Metadata {
    pub type_name: String,
    pub category: String,
    pub module: String,
}

impl Metadata {
    pub fn new(type_name: impl Into<String>, category: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            category: category.into(),
            module: module.into(),
        }
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.module.len() + self.category.len() + self.type_name.len() + 3
    }

    /// Append the serialized form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        put_cstr(out, &self.module, "module")?;
        put_cstr(out, &self.category, "category")?;
        put_cstr(out, &self.type_name, "type_name")
    }

    /// Decode one metadata entry from the front of `bytes`, returning it with
    /// the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes, "metadata");
        let module = r.cstr()?;
        let category = r.cstr()?;
        let type_name = r.cstr()?;
        Ok((
            Self {
                type_name,
                category,
                module,
            },
            r.pos,
        ))
    }

    /// Decode back-to-back entries filling all of `bytes`.
    pub fn decode_list(mut bytes: &[u8]) -> Result<Vec<Self>> {
        let mut list = Vec::new();
        while !bytes.is_empty() {
            let (md, used) = Self::decode(bytes)?;
            list.push(md);
            bytes = &bytes[used..];
        }
        Ok(list)
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}<{}>", self.module, self.category, self.type_name)
    }
}

/// Monotonic timestamp in nanoseconds, comparable across processes of one host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        Self(monotonic_nanos())
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

/// Header prefixed to every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub timestamp: Timestamp,
    /// Id of the producer whose buffer carried the record. Not serialized;
    /// stamped by the consumer from the instance it drained.
    pub producer_id: u32,
    pub source_file: String,
    pub source_line: u32,
    pub metadata: Metadata,
}

impl Envelope {
    /// Envelope stamped with the current time.
    pub fn new(producer_id: u32, metadata: Metadata, source_file: impl Into<String>, source_line: u32) -> Self {
        Self {
            timestamp: Timestamp::now(),
            producer_id,
            source_file: source_file.into(),
            source_line,
            metadata,
        }
    }

    /// Serialized size of the envelope part of a body.
    pub fn encoded_len(&self) -> usize {
        8 + 4 + self.source_file.len() + 1 + self.metadata.encoded_len()
    }
}

/// Append a complete record (`[u16 len][envelope][payload]`) to `out`.
pub fn encode_record(envelope: &Envelope, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let body_len = envelope.encoded_len() + payload.len();
    if body_len > MAX_BODY {
        return Err(TransportError::RecordTooLarge {
            size: body_len,
            max: MAX_BODY,
        });
    }
    out.reserve(LEN_PREFIX + body_len);
    out.extend_from_slice(&(body_len as u16).to_le_bytes());
    out.extend_from_slice(&envelope.timestamp.as_nanos().to_le_bytes());
    out.extend_from_slice(&envelope.source_line.to_le_bytes());
    put_cstr(out, &envelope.source_file, "source_file")?;
    envelope.metadata.encode(out)?;
    out.extend_from_slice(payload);
    Ok(())
}

/// Split a record body into its envelope and payload bytes.
pub fn decode_envelope(body: &[u8], producer_id: u32) -> Result<(Envelope, &[u8])> {
    if body.len() < MIN_ENVELOPE_LEN {
        return Err(TransportError::malformed(
            "envelope",
            format!("{} bytes, minimum is {MIN_ENVELOPE_LEN}", body.len()),
        ));
    }
    let mut r = Reader::new(body, "envelope");
    let timestamp = Timestamp::from_nanos(r.u64()?);
    let source_line = r.u32()?;
    let source_file = r.cstr()?;
    let (metadata, used) = Metadata::decode(&body[r.pos..])?;
    let payload = &body[r.pos + used..];
    Ok((
        Envelope {
            timestamp,
            producer_id,
            source_file,
            source_line,
            metadata,
        },
        payload,
    ))
}

/// Body of a control toggle: metadata followed by one enable byte.
pub fn encode_toggle(metadata: &Metadata, enabled: bool, out: &mut Vec<u8>) -> Result<()> {
    metadata.encode(out)?;
    out.push(enabled as u8);
    Ok(())
}

pub fn decode_toggle(body: &[u8]) -> Result<(Metadata, bool)> {
    let (metadata, used) = Metadata::decode(body)?;
    match &body[used..] {
        [flag] => Ok((metadata, *flag != 0)),
        rest => Err(TransportError::malformed(
            "toggle",
            format!("expected 1 flag byte, found {}", rest.len()),
        )),
    }
}

/// Read the little-endian length prefix at the start of `bytes`.
pub fn read_len_prefix(bytes: [u8; LEN_PREFIX]) -> usize {
    u16::from_le_bytes(bytes) as usize
}

fn put_cstr(out: &mut Vec<u8>, s: &str, field: &'static str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(TransportError::InvalidField { field });
    }
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| TransportError::malformed(self.what, format!("truncated at byte {}", self.pos)))?;
        self.pos = end;
        let mut arr = [0u8; N];
        arr.copy_from_slice(bytes);
        Ok(arr)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn cstr(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| TransportError::malformed(self.what, "unterminated string"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| TransportError::malformed(self.what, e.to_string()))?
            .to_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            timestamp: Timestamp::from_nanos(0x0102_0304_0506_0708),
            producer_id: 9,
            source_file: "src/render.rs".into(),
            source_line: 311,
            metadata: Metadata::new("text", "gl", "renderer"),
        }
    }

    #[test]
    fn record_layout_matches_wire_format() {
        let mut out = Vec::new();
        encode_record(&sample(), b"xyz", &mut out).unwrap();

        let body_len = read_len_prefix([out[0], out[1]]);
        assert_eq!(body_len, out.len() - LEN_PREFIX);
        assert_eq!(&out[2..10], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&out[10..14], &311u32.to_le_bytes());
        assert_eq!(&out[14..28], b"src/render.rs\0");
        assert_eq!(&out[28..], b"renderer\0gl\0text\0xyz");
    }

    #[test]
    fn envelope_decodes_with_consumer_producer_id() {
        let mut out = Vec::new();
        encode_record(&sample(), b"payload", &mut out).unwrap();
        let (env, payload) = decode_envelope(&out[LEN_PREFIX..], 9).unwrap();
        assert_eq!(env, sample());
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn empty_strings_give_minimum_envelope() {
        let env = Envelope {
            timestamp: Timestamp::from_nanos(1),
            producer_id: 0,
            source_file: String::new(),
            source_line: 0,
            metadata: Metadata::default(),
        };
        assert_eq!(env.encoded_len(), MIN_ENVELOPE_LEN);
    }

    #[test]
    fn nul_in_field_is_rejected() {
        let mut env = sample();
        env.metadata.category = "bad\0cat".into();
        let err = encode_record(&env, b"", &mut Vec::new()).unwrap_err();
        assert!(matches!(err, TransportError::InvalidField { field: "category" }));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let payload = vec![0u8; MAX_BODY];
        let err = encode_record(&sample(), &payload, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, TransportError::RecordTooLarge { .. }));
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let mut out = Vec::new();
        encode_record(&sample(), b"", &mut out).unwrap();
        // Cut inside the module string so its terminator is missing.
        let cut = &out[LEN_PREFIX..LEN_PREFIX + 30];
        assert!(decode_envelope(cut, 0).is_err());
    }

    #[test]
    fn toggle_carries_one_flag_byte() {
        let md = Metadata::new("text", "net", "io");
        let mut out = Vec::new();
        encode_toggle(&md, true, &mut out).unwrap();
        assert_eq!(out.last(), Some(&1));
        assert_eq!(decode_toggle(&out).unwrap(), (md.clone(), true));

        out.push(0);
        assert!(decode_toggle(&out).is_err());
    }

    #[test]
    fn metadata_list_is_back_to_back() {
        let a = Metadata::new("text", "a", "m1");
        let b = Metadata::new("", "b", "");
        let mut out = Vec::new();
        a.encode(&mut out).unwrap();
        b.encode(&mut out).unwrap();
        assert_eq!(out.len(), a.encoded_len() + b.encoded_len());
        assert_eq!(Metadata::decode_list(&out).unwrap(), vec![a, b]);
    }
}
