//! Local working-tree scanner.
//!
//! Recursively enumerates the target directory, hashing every regular
//! file and symlink in blob form so the tree walk can compare local state
//! against tree entries by hash alone. Ignored paths get a placeholder
//! hash derived from the path so they are represented but never
//! considered mismatched. A `.git` directory anywhere in the tree aborts
//! the run: this tool owns the whole tree and must not fight the real
//! client.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::delta::BaseProvider;
use crate::errors::ScanError;
use crate::file_node::{FileNode, HashIndex, PathMap};
use crate::hash;
use crate::object_id::ObjectId;
use crate::object_store::{ObjectKind, ObjectStore};

/// True when `path` starts with one of the configured ignore prefixes.
#[must_use]
pub fn is_ignored(ignores: &[String], path: &str) -> bool {
    ignores.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// Scans the tree rooted at `base_path` into the local collections.
///
/// Directory nodes inherit mode and hash from the manifest when known.
/// The target directory itself is marked `keep`, as is any path naming
/// the revision stamp file.
///
/// # Errors
/// `CoexistenceRefused` on a `.git` directory; I/O failures otherwise.
pub fn scan_local_tree(
    base_path: &str,
    target: &str,
    ignores: &[String],
    remote_by_path: &PathMap,
    local_by_path: &mut PathMap,
    local_by_hash: &mut HashIndex,
) -> Result<(), ScanError> {
    let known = remote_by_path.get(base_path);
    let node = FileNode {
        mode: known.map_or(0o040000, |n| n.mode),
        id: known.and_then(|n| n.id),
        keep: base_path == target,
        save: false,
    };
    if let Some(id) = node.id {
        local_by_hash
            .entry(id)
            .or_insert_with(|| base_path.to_string());
    }
    local_by_path.insert(base_path.to_string(), node);

    let entries = match fs::read_dir(base_path) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    for entry in entries {
        let entry = entry.map_err(|source| ScanError::Io {
            path: Path::new(base_path).to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let full_path = format!("{base_path}/{name}");

        let meta = fs::symlink_metadata(&full_path).map_err(|source| ScanError::Io {
            path: Path::new(&full_path).to_path_buf(),
            source,
        })?;

        if meta.is_dir() {
            if name == ".git" {
                return Err(ScanError::CoexistenceRefused {
                    path: Path::new(&full_path).to_path_buf(),
                });
            }
            scan_local_tree(
                &full_path,
                target,
                ignores,
                remote_by_path,
                local_by_path,
                local_by_hash,
            )?;
        } else {
            let mode = meta.mode();
            let id = if is_ignored(ignores, &full_path) {
                hash::path_placeholder_id(&full_path)
            } else {
                hash::file_blob_id(Path::new(&full_path), mode).map_err(|source| {
                    ScanError::Io {
                        path: Path::new(&full_path).to_path_buf(),
                        source,
                    }
                })?
            };

            let node = FileNode {
                mode,
                id: Some(id),
                keep: full_path.contains(".gituprevision"),
                save: false,
            };
            local_by_hash.entry(id).or_insert_with(|| full_path.clone());
            local_by_path.insert(full_path, node);
        }
    }

    Ok(())
}

/// Loads an object from the local tree into the store.
///
/// Lookup order: already in the store, then by hash, then by path. A
/// matching regular file or symlink is read and stored as a blob.
/// Returns `None` when no local source matches.
///
/// # Errors
/// Read failure on a matched file.
pub fn load_from_local(
    store: &mut ObjectStore,
    local_by_path: &PathMap,
    local_by_hash: &HashIndex,
    id: Option<&ObjectId>,
    path: Option<&str>,
) -> Result<Option<usize>, ScanError> {
    if let Some(id) = id {
        if let Some(found) = store.lookup(id) {
            return Ok(Some(found));
        }
    }

    let found_path = id
        .and_then(|id| local_by_hash.get(id).map(String::as_str))
        .or_else(|| path.filter(|p| local_by_path.contains_key(*p)));

    let Some(found_path) = found_path else {
        return Ok(None);
    };
    let Some(node) = local_by_path.get(found_path) else {
        return Ok(None);
    };
    if node.is_dir() {
        return Ok(None);
    }

    let data = if node.is_symlink() {
        fs::read_link(found_path)
            .map(|t| t.as_os_str().as_encoded_bytes().to_vec())
            .map_err(|source| ScanError::Io {
                path: Path::new(found_path).to_path_buf(),
                source,
            })?
    } else {
        fs::read(found_path).map_err(|source| ScanError::Io {
            path: Path::new(found_path).to_path_buf(),
            source,
        })?
    };

    let index = store
        .insert_resident(ObjectKind::Blob, data)
        .map_err(|err| ScanError::Io {
            path: Path::new(found_path).to_path_buf(),
            source: std::io::Error::other(err.to_string()),
        })?;
    Ok(Some(index))
}

/// [`BaseProvider`] over the scanned local tree, used by the delta
/// resolver to satisfy thin-pack bases.
pub struct LocalSource<'a> {
    pub local_by_path: &'a PathMap,
    pub local_by_hash: &'a HashIndex,
}

impl BaseProvider for LocalSource<'_> {
    fn load_base(
        &mut self,
        store: &mut ObjectStore,
        id: &ObjectId,
    ) -> Result<Option<usize>, ScanError> {
        load_from_local(store, self.local_by_path, self.local_by_hash, Some(id), None)
    }
}
