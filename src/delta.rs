//! Delta chain resolution.
//!
//! Walks the store in reverse insertion order and materializes every delta
//! into a full object buffer. OFS_DELTA chains are followed through arena
//! indices; REF_DELTA bases are looked up by hash and, when absent from
//! the store, fetched from the local tree through a [`BaseProvider`]
//! (thin packs reference bases the server assumes the client has).
//!
//! Resolution appends a new object per resolved delta; the delta and base
//! entries are never mutated.
//!
//! # Delta format
//! A delta payload starts with two varints (base size, result size)
//! followed by an instruction stream: commands with the high bit set copy
//! `length` bytes from the base at `offset` (a zero length encodes
//! 65536); commands 1..=127 insert that many literal bytes from the delta
//! payload; command 0 is reserved and treated as corruption.

use std::fmt;

use crate::errors::{ScanError, StoreError};
use crate::object_id::ObjectId;
use crate::object_store::{ObjectKind, ObjectStore};

/// Delta resolution error taxonomy.
#[derive(Debug)]
#[non_exhaustive]
pub enum DeltaError {
    /// Instruction or varint ran past the end of the delta payload.
    Truncated,
    /// A size varint would exceed 64 bits.
    VarintOverflow,
    /// Command byte 0 encountered.
    BadCommandZero,
    /// A copy instruction reads outside the base buffer.
    CopyOutOfRange,
    /// An instruction writes past the declared result size.
    Overflow { wanted: usize, target: usize },
    /// The instruction stream produced fewer bytes than declared.
    SizeMismatch { produced: usize, declared: usize },
    /// A REF_DELTA base is absent from the store and the local tree.
    MissingBase { id: String },
    /// Object store failure while loading buffers.
    Store(StoreError),
    /// Local scan failure while fetching a fallback base.
    Scan(ScanError),
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "delta truncated"),
            Self::VarintOverflow => write!(f, "delta varint overflow"),
            Self::BadCommandZero => write!(f, "delta command zero"),
            Self::CopyOutOfRange => write!(f, "delta copy out of range"),
            Self::Overflow { wanted, target } => {
                write!(f, "delta position overflow -- {wanted} > {target}")
            }
            Self::SizeMismatch { produced, declared } => {
                write!(f, "delta produced {produced} bytes, declared {declared}")
            }
            Self::MissingBase { id } => write!(f, "cannot find delta base {id}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Scan(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DeltaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Scan(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for DeltaError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<ScanError> for DeltaError {
    fn from(err: ScanError) -> Self {
        Self::Scan(err)
    }
}

/// Fallback source for REF_DELTA bases missing from the store.
///
/// The local scanner implements this by locating a file with the wanted
/// blob hash and inserting it into the store.
pub trait BaseProvider {
    /// Attempts to load the object named by `id` into the store.
    ///
    /// Returns the arena index on success, `None` when no local source
    /// matches.
    ///
    /// # Errors
    /// Filesystem failures while reading a candidate file.
    fn load_base(
        &mut self,
        store: &mut ObjectStore,
        id: &ObjectId,
    ) -> Result<Option<usize>, ScanError>;
}

/// A provider that never finds anything; for packs known to be complete.
pub struct NoFallback;

impl BaseProvider for NoFallback {
    fn load_base(
        &mut self,
        _store: &mut ObjectStore,
        _id: &ObjectId,
    ) -> Result<Option<usize>, ScanError> {
        Ok(None)
    }
}

/// Resolves every delta in the store, newest first.
///
/// # Errors
/// `MissingBase` when a chain bottoms out on an unknown hash, or any
/// instruction-stream error.
pub fn resolve_deltas(
    store: &mut ObjectStore,
    provider: &mut dyn BaseProvider,
) -> Result<(), DeltaError> {
    for outer in (0..store.len()).rev() {
        if !store.kind_at(outer).is_delta() {
            continue;
        }

        // Follow the chain down to a concrete base object.
        let mut chain: Vec<usize> = Vec::new();
        let mut cursor = outer;
        let base_index = loop {
            match store.kind_at(cursor) {
                ObjectKind::OfsDelta { base_index } => {
                    chain.push(cursor);
                    cursor = base_index;
                }
                ObjectKind::RefDelta { base_id } => {
                    chain.push(cursor);
                    if let Some(found) = store.lookup(&base_id) {
                        break found;
                    }
                    match provider.load_base(store, &base_id)? {
                        Some(found) => break found,
                        None => {
                            return Err(DeltaError::MissingBase {
                                id: base_id.to_hex(),
                            })
                        }
                    }
                }
                _ => break cursor,
            }
        };

        let base_kind = store.kind_at(base_index);
        let mut merged = store.buffer(base_index)?.to_vec();
        store.release(base_index);

        // Apply base-adjacent first, outermost last.
        for &delta_index in chain.iter().rev() {
            let layer = {
                let delta = store.buffer(delta_index)?;
                apply_delta(&merged, delta)?
            };
            store.release(delta_index);
            merged = layer;
        }

        store.insert_resident(base_kind, merged)?;
    }
    Ok(())
}

/// Reads a delta size varint (7 bits per byte, little-endian).
fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut shift: u32 = 0;
    let mut result: u64 = 0;
    for _ in 0..10 {
        let byte = *data.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift = shift.saturating_add(7);
        if shift > 63 {
            return Err(DeltaError::VarintOverflow);
        }
    }
    Err(DeltaError::VarintOverflow)
}

/// Parses the base and result sizes from a delta payload.
///
/// # Errors
/// Truncated or oversized varints.
pub fn delta_sizes(delta: &[u8]) -> Result<(usize, usize), DeltaError> {
    let mut pos = 0usize;
    let base = read_varint(delta, &mut pos)? as usize;
    let result = read_varint(delta, &mut pos)? as usize;
    Ok((base, result))
}

/// Applies one delta payload to `base`, returning the reconstructed
/// object.
///
/// # Errors
/// Any instruction-stream violation; writing past the declared result
/// size is `Overflow`.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0usize;
    let _base_size = read_varint(delta, &mut pos)? as usize;
    let result_size = read_varint(delta, &mut pos)? as usize;

    let mut out = Vec::with_capacity(result_size);
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let (offset, length) = decode_copy(delta, &mut pos, cmd)?;
            let end = offset.checked_add(length).ok_or(DeltaError::CopyOutOfRange)?;
            if end > base.len() {
                return Err(DeltaError::CopyOutOfRange);
            }
            if out.len() + length > result_size {
                return Err(DeltaError::Overflow {
                    wanted: out.len() + length,
                    target: result_size,
                });
            }
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let length = cmd as usize;
            if pos + length > delta.len() {
                return Err(DeltaError::Truncated);
            }
            if out.len() + length > result_size {
                return Err(DeltaError::Overflow {
                    wanted: out.len() + length,
                    target: result_size,
                });
            }
            out.extend_from_slice(&delta[pos..pos + length]);
            pos += length;
        } else {
            return Err(DeltaError::BadCommandZero);
        }
    }

    if out.len() != result_size {
        return Err(DeltaError::SizeMismatch {
            produced: out.len(),
            declared: result_size,
        });
    }
    Ok(out)
}

/// Decodes a copy instruction's offset and length.
///
/// Bits 0..3 of the command select which of four offset bytes follow;
/// bits 4..6 select which of three length bytes. Both are assembled
/// little-endian from the bytes present. A zero length means 65536.
fn decode_copy(delta: &[u8], pos: &mut usize, cmd: u8) -> Result<(usize, usize), DeltaError> {
    let mut offset = 0usize;
    let mut length = 0usize;

    for bit in 0..4 {
        if cmd & (1 << bit) != 0 {
            let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            offset |= (byte as usize) << (bit * 8);
        }
    }
    for bit in 0..3 {
        if cmd & (0x10 << bit) != 0 {
            let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            length |= (byte as usize) << (bit * 8);
        }
    }

    if length == 0 {
        length = 0x10000;
    }
    Ok((offset, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::varint;

    fn delta_of(base_len: usize, result_len: usize, body: &[u8]) -> Vec<u8> {
        let mut delta = varint(base_len as u64);
        delta.extend_from_slice(&varint(result_len as u64));
        delta.extend_from_slice(body);
        delta
    }

    #[test]
    fn copy_then_insert() {
        // Copy 3 bytes from offset 0, then insert "XYZ".
        let delta = delta_of(3, 6, &[0x90, 0x03, 0x03, b'X', b'Y', b'Z']);
        let out = apply_delta(b"abc", &delta).unwrap();
        assert_eq!(out, b"abcXYZ");
    }

    #[test]
    fn copy_length_zero_means_65536() {
        let base = vec![7u8; 0x10000];
        // Copy with no length bytes present: offset 0, length 0 -> 65536.
        let delta = delta_of(base.len(), 0x10000, &[0x80]);
        let out = apply_delta(&base, &delta).unwrap();
        assert_eq!(out.len(), 0x10000);
        assert!(out.iter().all(|&b| b == 7));
    }

    #[test]
    fn overflow_past_declared_size_is_fatal() {
        let delta = delta_of(3, 2, &[0x90, 0x03]);
        assert!(matches!(
            apply_delta(b"abc", &delta),
            Err(DeltaError::Overflow { .. })
        ));
    }

    #[test]
    fn copy_outside_base_is_fatal() {
        let delta = delta_of(3, 4, &[0x91, 0x02, 0x04]);
        assert!(matches!(
            apply_delta(b"abc", &delta),
            Err(DeltaError::CopyOutOfRange)
        ));
    }

    #[test]
    fn command_zero_is_corruption() {
        let delta = delta_of(3, 1, &[0x00]);
        assert!(matches!(
            apply_delta(b"abc", &delta),
            Err(DeltaError::BadCommandZero)
        ));
    }

    #[test]
    fn short_output_is_fatal() {
        let delta = delta_of(3, 9, &[0x90, 0x03]);
        assert!(matches!(
            apply_delta(b"abc", &delta),
            Err(DeltaError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn resolves_ofs_chain_through_store() {
        let mut store = ObjectStore::new(false);
        store
            .insert_packed(ObjectKind::Blob, b"hello\n".to_vec(), 12)
            .unwrap();
        // Rewrite to "hello world\n": copy "hello", insert " world\n".
        let mut body = vec![0x90, 0x05, 0x07];
        body.extend_from_slice(b" world\n");
        let delta = delta_of(6, 12, &body);
        store
            .insert_packed(ObjectKind::OfsDelta { base_index: 0 }, delta, 40)
            .unwrap();

        resolve_deltas(&mut store, &mut NoFallback).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.kind_at(2), ObjectKind::Blob);
        assert_eq!(store.buffer(2).unwrap(), b"hello world\n");
        // The resolved blob is findable by its canonical hash.
        let id = store.id_at(2);
        assert_eq!(store.lookup(&id), Some(2));
    }

    #[test]
    fn missing_ref_base_is_fatal() {
        let mut store = ObjectStore::new(false);
        let ghost = crate::hash::blob_id(b"not present");
        let delta = delta_of(11, 1, &[0x01, b'x']);
        store
            .insert_packed(ObjectKind::RefDelta { base_id: ghost }, delta, 12)
            .unwrap();
        assert!(matches!(
            resolve_deltas(&mut store, &mut NoFallback),
            Err(DeltaError::MissingBase { .. })
        ));
    }

    #[test]
    fn ref_base_loaded_through_provider() {
        struct OneBlob(Vec<u8>);
        impl BaseProvider for OneBlob {
            fn load_base(
                &mut self,
                store: &mut ObjectStore,
                id: &ObjectId,
            ) -> Result<Option<usize>, ScanError> {
                if crate::hash::blob_id(&self.0) == *id {
                    let index = store
                        .insert_resident(ObjectKind::Blob, self.0.clone())
                        .expect("resident insert");
                    Ok(Some(index))
                } else {
                    Ok(None)
                }
            }
        }

        let base = b"hello\n".to_vec();
        let base_id = crate::hash::blob_id(&base);
        let mut body = vec![0x90, 0x05, 0x07];
        body.extend_from_slice(b" world\n");
        let delta = delta_of(6, 12, &body);

        let mut store = ObjectStore::new(false);
        store
            .insert_packed(ObjectKind::RefDelta { base_id }, delta, 12)
            .unwrap();
        resolve_deltas(&mut store, &mut OneBlob(base)).unwrap();

        let resolved = crate::hash::blob_id(b"hello world\n");
        assert!(store.lookup(&resolved).is_some());
    }
}
