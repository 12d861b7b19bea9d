//! Versioned binary encoding of [`ArrayTaskState`].
//!
//! The host stores one opaque blob per task instance between passes. The
//! blob is tagged with a schema version; version 0 is the only one defined.
//!
//! ## Version 0 Payload
//!
//! All integers are little-endian.
//!
//! ```text
//! phase: u8
//! execution_array_size: u32
//! original_array_size: u32
//! original_min_successes: u32
//! detailed_phases: CompactArray
//! indexes_to_cache: BitSet
//! retry_attempts: CompactArray
//! cached_upstream: BitSet
//! external_job_id: OptString
//! job_definition_handle: OptString
//! reason: OptString
//!
//! OptString: present: u8 (0 | 1) [len: u32, utf8 bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use fanout_core::{BitSet, CompactArray};

use crate::error::{Error, Result};
use crate::phase::Phase;
use crate::state::ArrayTaskState;

/// The schema version written by [`encode_state`].
pub const CURRENT_STATE_VERSION: u32 = 0;

/// A state blob as exchanged with the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedPluginState {
    /// Schema version of `payload`.
    pub version: u32,
    /// Encoded state.
    pub payload: Bytes,
}

fn put_u32(buf: &mut BytesMut, value: usize, field: &str) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| Error::storage(format!("{field} {value} does not fit in u32")))?;
    buf.put_u32_le(value);
    Ok(())
}

fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_u32(buf, s.len(), "string length")?;
            buf.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes, field: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::corrupted(format!("truncated {field}")));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes, field: &str) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(Error::corrupted(format!("truncated {field}")));
    }
    Ok(buf.get_u32_le() as usize)
}

fn get_opt_string(buf: &mut Bytes, field: &str) -> Result<Option<String>> {
    match get_u8(buf, field)? {
        0 => Ok(None),
        1 => {
            let len = get_u32(buf, field)?;
            if buf.remaining() < len {
                return Err(Error::corrupted(format!("truncated {field}")));
            }
            let raw = buf.split_to(len);
            String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|e| Error::corrupted(format!("{field} is not utf-8: {e}")))
        }
        flag => Err(Error::corrupted(format!("invalid {field} presence flag {flag}"))),
    }
}

fn core_to_corrupted(field: &str) -> impl FnOnce(fanout_core::Error) -> Error + '_ {
    move |e| Error::corrupted(format!("{field}: {e}"))
}

/// Encodes `state` at the current schema version.
///
/// # Errors
///
/// Returns [`Error::Storage`] if a size does not fit the encoding.
pub fn encode_state(state: &ArrayTaskState) -> Result<PersistedPluginState> {
    let mut buf = BytesMut::new();
    buf.put_u8(state.current_phase.as_code());
    put_u32(&mut buf, state.execution_array_size, "execution size")?;
    put_u32(&mut buf, state.original_array_size, "original size")?;
    put_u32(&mut buf, state.original_min_successes, "min successes")?;
    state.detailed_phases.encode(&mut buf)?;
    state.indexes_to_cache.encode(&mut buf)?;
    state.retry_attempts.encode(&mut buf)?;
    state.cached_upstream.encode(&mut buf)?;
    put_opt_string(&mut buf, state.external_job_id.as_deref())?;
    put_opt_string(&mut buf, state.job_definition_handle.as_deref())?;
    put_opt_string(&mut buf, state.reason.as_deref())?;

    Ok(PersistedPluginState {
        version: CURRENT_STATE_VERSION,
        payload: buf.freeze(),
    })
}

/// Decodes a persisted blob.
///
/// # Errors
///
/// Returns [`Error::CorruptedPluginState`] for an unknown version, malformed
/// or trailing bytes, or a state that violates its invariants.
pub fn decode_state(persisted: &PersistedPluginState) -> Result<ArrayTaskState> {
    if persisted.version != CURRENT_STATE_VERSION {
        return Err(Error::corrupted(format!(
            "unknown state version {}",
            persisted.version
        )));
    }

    let mut buf = persisted.payload.clone();
    let current_phase = Phase::from_code(get_u8(&mut buf, "phase")?)?;
    let execution_array_size = get_u32(&mut buf, "execution size")?;
    let original_array_size = get_u32(&mut buf, "original size")?;
    let original_min_successes = get_u32(&mut buf, "min successes")?;
    let detailed_phases =
        CompactArray::decode(&mut buf).map_err(core_to_corrupted("detailed phases"))?;
    let indexes_to_cache =
        BitSet::decode(&mut buf).map_err(core_to_corrupted("indexes to cache"))?;
    let retry_attempts =
        CompactArray::decode(&mut buf).map_err(core_to_corrupted("retry attempts"))?;
    let cached_upstream =
        BitSet::decode(&mut buf).map_err(core_to_corrupted("cached upstream"))?;
    let external_job_id = get_opt_string(&mut buf, "external job id")?;
    let job_definition_handle = get_opt_string(&mut buf, "job definition handle")?;
    let reason = get_opt_string(&mut buf, "reason")?;

    if buf.has_remaining() {
        return Err(Error::corrupted(format!(
            "{} trailing bytes after state",
            buf.remaining()
        )));
    }

    let state = ArrayTaskState {
        current_phase,
        execution_array_size,
        original_array_size,
        original_min_successes,
        detailed_phases,
        indexes_to_cache,
        retry_attempts,
        cached_upstream,
        external_job_id,
        job_definition_handle,
        reason,
    };
    state.validate()?;
    Ok(state)
}
