//! Canonical object hashing.
//!
//! Git addresses every object by the SHA-1 of `"<type> <size>\0"` followed
//! by the payload. Local files are hashed in blob form so they can be
//! compared directly against tree entries; symlinks hash their link target
//! string. Ignored paths get a placeholder hash derived from the path
//! itself so they are represented without ever matching remote content.

use std::fs;
use std::io;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::object_id::ObjectId;

/// SHA-1 of an arbitrary byte run.
#[must_use]
pub fn sha1_bytes(data: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(data);
    ObjectId::new(hasher.finalize().into())
}

/// Canonical hash of an object payload under the given type name.
///
/// `type_name` must be one of the wire type names (`commit`, `tree`,
/// `blob`, `tag`, `ofs-delta`, `ref-delta`).
#[must_use]
pub fn object_id(type_name: &str, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(type_name.as_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(payload);
    ObjectId::new(hasher.finalize().into())
}

/// Canonical blob hash of a payload.
#[inline]
#[must_use]
pub fn blob_id(payload: &[u8]) -> ObjectId {
    object_id("blob", payload)
}

/// Blob hash of an on-disk file.
///
/// Symlinks hash the link target string; regular files hash their
/// contents.
///
/// # Errors
/// Any I/O failure while reading the file or link.
pub fn file_blob_id(path: &Path, mode: u32) -> io::Result<ObjectId> {
    if mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32 {
        let target = fs::read_link(path)?;
        Ok(blob_id(target.as_os_str().as_encoded_bytes()))
    } else {
        let data = fs::read(path)?;
        Ok(blob_id(&data))
    }
}

/// Placeholder hash for an ignored path.
///
/// Hashes the absolute path string directly (no blob header) so ignored
/// files are present in the local index but never hash-match a tree entry.
#[inline]
#[must_use]
pub fn path_placeholder_id(path: &str) -> ObjectId {
    sha1_bytes(path.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_hash_matches_git() {
        // `echo hello | git hash-object --stdin`
        let id = blob_id(b"hello\n");
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn empty_blob_hash_matches_git() {
        let id = blob_id(b"");
        assert_eq!(id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn placeholder_differs_from_blob_form() {
        assert_ne!(path_placeholder_id("hello\n"), blob_id(b"hello\n"));
    }

    #[test]
    fn file_hash_reads_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello\n").unwrap();
        let id = file_blob_id(&path, 0o100644).unwrap();
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn symlink_hashes_target_string() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("a.txt", &link).unwrap();
        let id = file_blob_id(&link, 0o120000).unwrap();
        assert_eq!(id, blob_id(b"a.txt"));
    }
}
