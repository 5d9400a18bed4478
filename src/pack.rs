//! Pack stream reading.
//!
//! Parses a fully assembled pack buffer (magic, version, object count,
//! concatenated zlib-compressed entries, SHA-1 trailer) and feeds every
//! contained object into the [`ObjectStore`]. Delta entries are stored
//! unresolved; the delta module materializes them afterwards.
//!
//! # Scope
//! - Validates the pack header and the trailing checksum.
//! - Decodes variable-length entry headers, including OFS_DELTA negative
//!   offsets and REF_DELTA base ids.
//! - Inflates each entry's zlib stream, recovering the compressed length
//!   from the decoder so the cursor can advance.
//!
//! # Invariants
//! - Entry sizes declared in headers are informational; the zlib stream is
//!   the source of truth for payload length.
//! - OFS_DELTA back-references are resolved to insertion indices during
//!   the read; they never point forward.

use std::fmt;

use flate2::{Decompress, FlushDecompress, Status};

use crate::errors::StoreError;
use crate::hash::sha1_bytes;
use crate::object_id::{ObjectId, OID_LEN};
use crate::object_store::{ObjectKind, ObjectStore};

/// Pack header size: magic(4) + version(4) + object_count(4).
const PACK_HEADER_SIZE: usize = 12;

/// Inflate output is appended in chunks of this size.
const INFLATE_BUF_SIZE: usize = 64 * 1024;

/// Safety bound on entry header length (size varint plus base reference).
const MAX_HEADER_BYTES: usize = 64;

/// Zlib inflation error taxonomy.
#[derive(Debug, PartialEq, Eq)]
pub enum InflateError {
    /// The stream ended before the decoder reached stream end.
    TruncatedInput,
    /// The decoder made no progress with input remaining.
    Stalled,
    /// The underlying zlib backend rejected the stream.
    Backend,
}

impl fmt::Display for InflateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedInput => write!(f, "zlib stream truncated"),
            Self::Stalled => write!(f, "zlib stream stalled"),
            Self::Backend => write!(f, "zlib data stream failure"),
        }
    }
}

impl std::error::Error for InflateError {}

/// Pack reading error taxonomy.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackError {
    /// Buffer is smaller than header plus trailer.
    TooSmall,
    /// Missing `PACK` magic.
    BadSignature,
    /// Pack version other than 2.
    UnsupportedVersion(u32),
    /// Entry data ran past the end of the buffer.
    Truncated,
    /// Entry header exceeded the safety bound.
    HeaderTooLong,
    /// Reserved or unknown object type tag.
    BadObjectType(u8),
    /// An OFS_DELTA back-reference matched no stored object.
    OrphanOfsDelta { offset: u64 },
    /// The trailing SHA-1 does not match the pack contents.
    ChecksumMismatch { expected: String, actual: String },
    /// Zlib inflation failed.
    Zlib(InflateError),
    /// Spill file failure while storing an object.
    Store(StoreError),
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "pack data too small"),
            Self::BadSignature => write!(f, "bad pack signature"),
            Self::UnsupportedVersion(version) => {
                write!(f, "pack version {version} not supported")
            }
            Self::Truncated => write!(f, "truncated pack data"),
            Self::HeaderTooLong => write!(f, "pack entry header exceeded safety bound"),
            Self::BadObjectType(tag) => write!(f, "bad pack object type {tag}"),
            Self::OrphanOfsDelta { offset } => {
                write!(f, "cannot find ofs-delta base object at offset {offset}")
            }
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "pack checksum mismatch -- expected: {expected}, received: {actual}"
            ),
            Self::Zlib(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Zlib(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<InflateError> for PackError {
    fn from(err: InflateError) -> Self {
        Self::Zlib(err)
    }
}

impl From<StoreError> for PackError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Verifies that the pack's final 20 bytes equal the SHA-1 of everything
/// preceding them.
///
/// # Errors
/// - `TooSmall` if the buffer cannot hold a trailer.
/// - `ChecksumMismatch` with both hex digests on disagreement.
pub fn verify_trailer(pack: &[u8]) -> Result<(), PackError> {
    if pack.len() < OID_LEN {
        return Err(PackError::TooSmall);
    }
    let body_len = pack.len() - OID_LEN;
    let actual = sha1_bytes(&pack[..body_len]);
    let expected = &pack[body_len..];
    if expected != actual.as_bytes() {
        let expected = ObjectId::try_from_slice(expected).map(|id| id.to_hex());
        return Err(PackError::ChecksumMismatch {
            expected: expected.unwrap_or_default(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// Unpacks every object in `pack` into the store.
///
/// The caller must have verified the trailer already; this function only
/// parses. Returns the number of objects the header declared.
///
/// # Errors
/// Any header, zlib, or spill failure; `OrphanOfsDelta` when a delta's
/// backward offset matches no previously read object.
pub fn unpack(store: &mut ObjectStore, pack: &[u8]) -> Result<u32, PackError> {
    if pack.len() < PACK_HEADER_SIZE + OID_LEN {
        return Err(PackError::TooSmall);
    }
    if &pack[0..4] != b"PACK" {
        return Err(PackError::BadSignature);
    }
    let version = u32::from_be_bytes([pack[4], pack[5], pack[6], pack[7]]);
    if version != 2 {
        return Err(PackError::UnsupportedVersion(version));
    }
    let declared = u32::from_be_bytes([pack[8], pack[9], pack[10], pack[11]]);

    // The trailer is excluded so the checksum is never parsed as an entry.
    let data_end = pack.len() - OID_LEN;
    let mut inflater = Decompress::new(true);
    let mut pos = PACK_HEADER_SIZE;
    let mut remaining = declared;

    while pos < data_end && remaining > 0 {
        remaining -= 1;
        let header_offset = pos as u64;

        let first = *pack.get(pos).ok_or(PackError::Truncated)?;
        pos += 1;
        let type_tag = (first >> 4) & 0x07;
        let mut size: u64 = (first & 0x0f) as u64;
        let mut shift: u32 = 4;
        let mut byte = first;
        while byte & 0x80 != 0 {
            if pos - header_offset as usize >= MAX_HEADER_BYTES {
                return Err(PackError::HeaderTooLong);
            }
            byte = *pack.get(pos).ok_or(PackError::Truncated)?;
            pos += 1;
            size |= ((byte & 0x7f) as u64) << shift;
            shift = shift.saturating_add(7);
        }

        let kind = match type_tag {
            1 => ObjectKind::Commit,
            2 => ObjectKind::Tree,
            3 => ObjectKind::Blob,
            4 => ObjectKind::Tag,
            6 => {
                let back = read_ofs_offset(pack, &mut pos, header_offset as usize)?;
                if back > header_offset {
                    return Err(PackError::OrphanOfsDelta { offset: header_offset });
                }
                let base_offset = header_offset - back;
                let base_index = store
                    .find_by_pack_offset(base_offset)
                    .ok_or(PackError::OrphanOfsDelta { offset: header_offset })?;
                ObjectKind::OfsDelta { base_index }
            }
            7 => {
                let end = pos + OID_LEN;
                if end > data_end {
                    return Err(PackError::Truncated);
                }
                let base_id = ObjectId::try_from_slice(&pack[pos..end])
                    .ok_or(PackError::Truncated)?;
                pos = end;
                ObjectKind::RefDelta { base_id }
            }
            tag => return Err(PackError::BadObjectType(tag)),
        };

        let mut payload = Vec::with_capacity(size as usize);
        let consumed = inflate_all(&mut inflater, &pack[pos..data_end], &mut payload)?;
        pos += consumed;

        store.insert_packed(kind, payload, header_offset)?;
    }

    Ok(declared)
}

/// Reads an OFS_DELTA negative offset ("subtract-and-shift" varint).
fn read_ofs_offset(pack: &[u8], pos: &mut usize, start: usize) -> Result<u64, PackError> {
    let mut byte = *pack.get(*pos).ok_or(PackError::Truncated)?;
    *pos += 1;
    let mut value: u64 = (byte & 0x7f) as u64;
    while byte & 0x80 != 0 {
        if *pos - start >= MAX_HEADER_BYTES {
            return Err(PackError::HeaderTooLong);
        }
        byte = *pack.get(*pos).ok_or(PackError::Truncated)?;
        *pos += 1;
        value = ((value + 1) << 7) | (byte & 0x7f) as u64;
    }
    Ok(value)
}

/// Inflates one complete zlib stream, appending output to `out`.
///
/// Returns the number of compressed input bytes consumed, which callers
/// use to advance the pack cursor past the entry.
pub fn inflate_all(
    inflater: &mut Decompress,
    input: &[u8],
    out: &mut Vec<u8>,
) -> Result<usize, InflateError> {
    inflater.reset(true);
    let mut buf = [0u8; INFLATE_BUF_SIZE];
    let mut in_pos = 0usize;

    loop {
        let before_in = inflater.total_in() as usize;
        let before_out = inflater.total_out() as usize;

        let status = inflater
            .decompress(&input[in_pos..], &mut buf, FlushDecompress::None)
            .map_err(|_| InflateError::Backend)?;

        let consumed = inflater.total_in() as usize - before_in;
        let produced = inflater.total_out() as usize - before_out;
        in_pos += consumed;

        if produced != 0 {
            out.extend_from_slice(&buf[..produced]);
        }

        match status {
            Status::StreamEnd => return Ok(in_pos),
            Status::Ok => {
                if consumed == 0 && produced == 0 {
                    if in_pos >= input.len() {
                        return Err(InflateError::TruncatedInput);
                    }
                    return Err(InflateError::Stalled);
                }
            }
            Status::BufError => {
                if in_pos >= input.len() {
                    return Err(InflateError::TruncatedInput);
                }
            }
        }
    }
}
