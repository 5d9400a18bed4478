//! File bookkeeping nodes.
//!
//! The sync state is carried in ordered maps keyed by absolute path: the
//! local tree as scanned from disk, the remote tree as recorded in the
//! manifest and rebuilt by the walk, and a hash-to-path index used to
//! recover objects from local files.

use std::collections::BTreeMap;

use crate::object_id::ObjectId;

/// One file, directory, or symlink in a tracked tree.
#[derive(Clone, Debug)]
pub struct FileNode {
    /// POSIX mode bits (type and permissions).
    pub mode: u32,
    /// Blob or tree hash; `None` for local directories the manifest does
    /// not know.
    pub id: Option<ObjectId>,
    /// Present on disk and should remain after the deletion pass.
    pub keep: bool,
    /// Bytes must be written from the object store.
    pub save: bool,
}

impl FileNode {
    /// Directory check on the stored mode.
    #[inline]
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// Symlink check on the stored mode.
    #[inline]
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }
}

/// Path-keyed ordered collection of file nodes.
pub type PathMap = BTreeMap<String, FileNode>;

/// Hash-keyed index into the local tree (first path wins).
pub type HashIndex = BTreeMap<ObjectId, String>;
