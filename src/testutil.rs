//! Shared helpers for unit tests: synthetic pack construction.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::hash::sha1_bytes;
use crate::object_id::ObjectId;

/// Zlib-compresses a payload.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("deflate write");
    encoder.finish().expect("deflate finish")
}

/// Encodes a delta size varint (7 bits per byte, little-endian).
pub fn varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out
}

/// Encodes a pack entry header for `kind` with the given payload size.
pub fn pack_entry_header(kind: u8, mut size: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = (kind << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);
    out
}

/// Encodes an OFS_DELTA negative offset.
pub fn ofs_encode(mut value: u64) -> Vec<u8> {
    let mut buf = [0u8; 10];
    let mut pos = buf.len() - 1;
    buf[pos] = (value & 0x7f) as u8;
    loop {
        value >>= 7;
        if value == 0 {
            break;
        }
        value -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (value & 0x7f) as u8;
    }
    buf[pos..].to_vec()
}

/// Builds a complete pack (header, entries, SHA-1 trailer).
///
/// Entries are `(type_tag, payload, ofs_base)`; `ofs_base` names the entry
/// index an OFS_DELTA (type 6) refers back to.
pub fn synth_pack(entries: &[(u8, Vec<u8>, Option<usize>)]) -> Vec<u8> {
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    let mut offsets = Vec::with_capacity(entries.len());
    for (kind, payload, base) in entries {
        let offset = pack.len() as u64;
        offsets.push(offset);
        pack.extend_from_slice(&pack_entry_header(*kind, payload.len() as u64));
        if *kind == 6 {
            let base_offset = offsets[base.expect("ofs-delta entry needs a base")];
            pack.extend_from_slice(&ofs_encode(offset - base_offset));
        }
        pack.extend_from_slice(&deflate(payload));
    }

    let trailer = sha1_bytes(&pack);
    pack.extend_from_slice(trailer.as_bytes());
    pack
}

/// Serializes one tree entry in git's on-disk tree format.
pub fn tree_entry(mode: &str, name: &str, id: &ObjectId) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(mode.as_bytes());
    out.push(b' ');
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(id.as_bytes());
    out
}

/// Serializes a commit payload pointing at `tree_id`.
pub fn commit_payload(tree_id: &ObjectId) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"tree ");
    out.extend_from_slice(tree_id.to_hex().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(b"author A U Thor <author@example.com> 1700000000 +0000\n");
    out.extend_from_slice(b"committer A U Thor <author@example.com> 1700000000 +0000\n");
    out.extend_from_slice(b"\nsnapshot\n");
    out
}
