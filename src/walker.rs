//! Tree walking and materialization.
//!
//! Starting from the wanted commit, walks commit → root tree → subtrees,
//! reconciling every entry against the scanned local tree: entries whose
//! local copy already hash-matches are kept as-is, everything else is
//! queued for writing. Each visited tree emits a manifest block in
//! pre-order. Materialization then writes queued blobs, fixes
//! permissions, and creates symlinks; the repair variant rewrites only
//! files whose on-disk bytes disagree with the wanted hash.
//!
//! # Invariants
//! - A local node marked `keep` survives the deletion pass.
//! - Pruning never touches a path outside the target directory and
//!   rejects any path containing `../`.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use crate::errors::WalkError;
use crate::file_node::{FileNode, HashIndex, PathMap};
use crate::manifest::ManifestWriter;
use crate::object_id::{ObjectId, OID_LEN};
use crate::object_store::ObjectStore;
use crate::scanner;

/// Change display state: verbosity, depth trimming, prefix dedup.
#[derive(Debug)]
pub struct ChangeDisplay {
    pub verbosity: u8,
    /// Adjusted display depth; 0 prints full paths.
    pub depth: usize,
    trim_seen: BTreeSet<String>,
}

impl ChangeDisplay {
    #[must_use]
    pub fn new(verbosity: u8, depth: usize) -> Self {
        Self {
            verbosity,
            depth,
            trim_seen: BTreeSet::new(),
        }
    }

    /// Trims a path to the configured depth.
    ///
    /// Returns the trimmed path and whether this prefix had not been
    /// displayed before.
    pub fn trim(&mut self, path: &str) -> (String, bool) {
        if self.depth == 0 {
            return (path.to_string(), false);
        }

        let bytes = path.as_bytes();
        let mut cut: Option<usize> = Some(0);
        for _ in 0..=self.depth {
            cut = match cut {
                Some(at) => bytes[at + 1..]
                    .iter()
                    .position(|&b| b == b'/')
                    .map(|rel| at + 1 + rel),
                None => break,
            };
        }

        let trimmed = match cut {
            Some(at) => path[..at].to_string(),
            None => path.to_string(),
        };
        let just_added = self.trim_seen.insert(trimmed.clone());
        (trimmed, just_added)
    }
}

/// One parsed tree entry.
struct TreeEntry {
    mode: u32,
    id: ObjectId,
    name: String,
}

/// Parses a tree object payload into entries.
///
/// Format per entry: `<octal mode> <name>\0<20-byte hash>`.
fn parse_tree(payload: &[u8], path: &str) -> Result<Vec<TreeEntry>, WalkError> {
    let malformed = || WalkError::MalformedTree {
        path: path.to_string(),
    };

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let space = memchr::memchr(b' ', &payload[pos..]).ok_or_else(malformed)?;
        let mode_text = std::str::from_utf8(&payload[pos..pos + space]).map_err(|_| malformed())?;
        let mode = u32::from_str_radix(mode_text, 8).map_err(|_| malformed())?;
        pos += space + 1;

        let nul = memchr::memchr(0, &payload[pos..]).ok_or_else(malformed)?;
        let name = String::from_utf8_lossy(&payload[pos..pos + nul]).into_owned();
        if name.is_empty() {
            return Err(malformed());
        }
        pos += nul + 1;

        if pos + OID_LEN > payload.len() {
            return Err(malformed());
        }
        let id = ObjectId::try_from_slice(&payload[pos..pos + OID_LEN]).ok_or_else(malformed)?;
        pos += OID_LEN;

        entries.push(TreeEntry { mode, id, name });
    }
    Ok(entries)
}

/// Borrowed view of the session state the walk mutates.
pub struct Walker<'a> {
    pub store: &'a mut ObjectStore,
    pub local_by_path: &'a mut PathMap,
    pub local_by_hash: &'a HashIndex,
    pub remote_by_path: &'a mut PathMap,
    pub display: &'a mut ChangeDisplay,
}

impl Walker<'_> {
    /// Walks the commit named by `want`, emitting manifest blocks rooted
    /// at the target directory.
    ///
    /// # Errors
    /// `NotACommit` when the want object is absent or not a commit; any
    /// walk failure below it.
    pub fn walk_commit(
        &mut self,
        want: &ObjectId,
        target: &str,
        manifest: &mut ManifestWriter,
    ) -> Result<(), WalkError> {
        let commit = self.store.lookup(want).ok_or_else(|| WalkError::NotACommit {
            id: want.to_hex(),
        })?;
        let payload = self.store.buffer(commit)?.to_vec();
        self.store.release(commit);

        // The payload begins "tree <40-hex>\n".
        if payload.len() < 45 || !payload.starts_with(b"tree ") {
            return Err(WalkError::NotACommit { id: want.to_hex() });
        }
        let tree_id = ObjectId::from_hex(&payload[5..45]).map_err(|_| WalkError::NotACommit {
            id: want.to_hex(),
        })?;

        self.process_tree(tree_id, target, manifest)
    }

    /// Emits one manifest block for `tree_id` and recurses into
    /// subtrees, reconciling file entries against the local tree.
    fn process_tree(
        &mut self,
        tree_id: ObjectId,
        base_path: &str,
        manifest: &mut ManifestWriter,
    ) -> Result<(), WalkError> {
        let tree_index = self.store.lookup(&tree_id).ok_or_else(|| WalkError::MissingTree {
            id: tree_id.to_hex(),
            path: base_path.to_string(),
        })?;
        let payload = self.store.buffer(tree_index)?.to_vec();
        self.store.release(tree_index);

        // The directory exists remotely, so it is not deletion fodder.
        if let Some(local) = self.local_by_path.get_mut(base_path) {
            local.keep = true;
            local.save = false;
        }

        let entries = parse_tree(&payload, base_path)?;

        manifest
            .begin_tree(&tree_id, base_path)
            .map_err(|source| WalkError::Io {
                path: base_path.to_string(),
                source,
            })?;
        for entry in &entries {
            manifest
                .entry(entry.mode, &entry.id, &entry.name)
                .map_err(|source| WalkError::Io {
                    path: base_path.to_string(),
                    source,
                })?;
        }
        manifest.end_tree().map_err(|source| WalkError::Io {
            path: base_path.to_string(),
            source,
        })?;

        for entry in entries {
            let full_path = format!("{base_path}/{}", entry.name);

            if entry.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                self.process_tree(entry.id, &full_path, manifest)?;
                continue;
            }

            // An unchanged local copy needs no write and no object.
            if let Some(local) = self.local_by_path.get_mut(&full_path) {
                local.keep = true;
                local.save = false;
                if local.id == Some(entry.id) {
                    continue;
                }
            }

            // The blob may be recoverable from an identical local file.
            if self.store.lookup(&entry.id).is_none() {
                scanner::load_from_local(
                    self.store,
                    self.local_by_path,
                    self.local_by_hash,
                    Some(&entry.id),
                    Some(&full_path),
                )?;
            }
            if self.store.lookup(&entry.id).is_none() {
                return Err(WalkError::MissingObject {
                    id: entry.id.to_hex(),
                    path: full_path,
                });
            }

            let node = FileNode {
                mode: entry.mode,
                id: Some(entry.id),
                keep: true,
                save: true,
            };
            self.remote_by_path.insert(full_path, node);
        }

        Ok(())
    }

    /// Writes every queued blob to disk (clone and pull runs).
    ///
    /// Paths of written `UPDATING` files are appended to `updating`.
    ///
    /// # Errors
    /// `MissingObject` when a queued hash is absent; filesystem failures.
    pub fn materialize(&mut self, updating: &mut Vec<String>) -> Result<(), WalkError> {
        let queued: Vec<(String, FileNode)> = self
            .remote_by_path
            .iter()
            .filter(|(_, node)| node.save)
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect();

        for (path, node) in queued {
            let Some(id) = node.id else { continue };
            let index = self.store.lookup(&id).ok_or_else(|| WalkError::MissingObject {
                id: id.to_hex(),
                path: path.clone(),
            })?;
            let data = self.store.buffer(index)?.to_vec();
            self.store.release(index);

            save_file(&path, node.mode, &data, self.display)?;
            if path.contains("UPDATING") {
                updating.push(path);
            }
        }
        Ok(())
    }

    /// Repair materialization: rewrites only files whose on-disk content
    /// hash disagrees with the wanted hash, then shields every remote
    /// path from the deletion pass.
    ///
    /// # Errors
    /// Filesystem failures while checking or writing.
    pub fn save_repairs(&mut self, updating: &mut Vec<String>) -> Result<(), WalkError> {
        let candidates: Vec<(String, FileNode)> = self
            .remote_by_path
            .iter()
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect();

        for (path, node) in candidates {
            let Some(id) = node.id else { continue };
            let Some(index) = self.store.lookup(&id) else {
                continue;
            };

            if node.is_dir() {
                make_path(&path).map_err(|source| WalkError::Io {
                    path: path.clone(),
                    source,
                })?;
                continue;
            }

            let missing = fs::symlink_metadata(&path).is_err();
            let update = if missing {
                true
            } else {
                // Identical content can exist at several paths; rewrite
                // only genuinely altered files.
                match crate::hash::file_blob_id(Path::new(&path), node.mode) {
                    Ok(on_disk) => on_disk != id,
                    Err(_) => true,
                }
            };

            if update {
                let data = self.store.buffer(index)?.to_vec();
                self.store.release(index);
                save_file(&path, node.mode, &data, self.display)?;
                if path.contains("UPDATING") {
                    updating.push(path);
                }
            }
        }

        // Nothing the remote still references may be deleted.
        for (path, _) in self.remote_by_path.iter() {
            if let Some(local) = self.local_by_path.get_mut(path) {
                local.keep = true;
            }
        }
        Ok(())
    }
}

/// Creates a directory and any missing parents with mode 0755.
pub fn make_path(path: &str) -> std::io::Result<()> {
    fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

/// Writes one blob to disk.
///
/// Symlink modes create a symlink to the payload string. Regular files
/// are created 0600 and chmod'ed to the recorded mode afterwards. Parent
/// directories are created as needed.
pub fn save_file(
    path: &str,
    mode: u32,
    data: &[u8],
    display: &mut ChangeDisplay,
) -> Result<(), WalkError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let io_err = |source| WalkError::Io {
        path: path.to_string(),
        source,
    };

    let (display_path, just_added) = display.trim(path);
    let mut exists = false;
    if display.depth > 0 {
        exists |= Path::new(&display_path).exists();
    }

    if let Some(slash) = path.rfind('/') {
        let parent = &path[..slash];
        if !parent.is_empty() && !Path::new(parent).exists() {
            make_path(parent).map_err(io_err)?;
        }
    }

    if display.verbosity > 0 {
        exists |= fs::symlink_metadata(path).is_ok();
        if display.depth == 0 || just_added {
            println!(" {} {}", if exists { '*' } else { '+' }, display_path);
        }
    }

    if mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32 {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(err)),
        }
        let target = std::ffi::OsStr::from_bytes(data);
        std::os::unix::fs::symlink(target, path).map_err(io_err)?;
    } else {
        let perms = fs::Permissions::from_mode(mode & 0o7777);
        // A read-only previous copy would block the truncating open.
        if fs::symlink_metadata(path).is_ok() {
            fs::set_permissions(path, perms.clone()).map_err(io_err)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(io_err)?;
        file.write_all(data).map_err(io_err)?;
        fs::set_permissions(path, perms).map_err(io_err)?;
    }

    Ok(())
}

/// Recursively removes a directory tree.
///
/// Refuses to touch anything outside the target directory or any path
/// containing `../`. Removal failures are warnings, not fatal errors,
/// matching the best-effort nature of the deletion pass.
pub fn prune_tree(target: &str, base_path: &str) -> Result<(), WalkError> {
    if !base_path.starts_with(target) {
        return Err(WalkError::PathEscape {
            path: base_path.to_string(),
        });
    }
    if base_path.contains("../") {
        return Err(WalkError::PathEscape {
            path: base_path.to_string(),
        });
    }

    if let Err(err) = fs::remove_dir_all(base_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            eprintln!(" ! cannot remove {base_path}");
        }
    }
    Ok(())
}
