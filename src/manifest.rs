//! The persisted remote-state manifest.
//!
//! A text file capturing the last materialized remote state. Line 1 is
//! the hex commit hash the tree corresponds to (the next run's "have").
//! Then one block per tree: a header line `040000\t<tree-hash>\t<path>/`,
//! one line per tree entry `<octal mode>\t<entry-hash>\t<name>`, and a
//! terminating blank line.
//!
//! Re-parsing a manifest yields two things: the remote file nodes used to
//! diff against the local tree, and synthetic tree-object buffers (git's
//! exact on-disk tree byte format) that prime the object store so an
//! incremental pull can reference prior trees as delta bases.
//!
//! Writes are staged to `<path>.new` and renamed onto the manifest only
//! when the run completes, so a failed run never corrupts the prior
//! state.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::file_node::{FileNode, PathMap};
use crate::object_id::ObjectId;
use crate::object_store::{ObjectKind, ObjectStore};

/// Parsed manifest head state.
#[derive(Debug, Default)]
pub struct LoadedManifest {
    /// The commit hash on line 1, if the file had one.
    pub have: Option<String>,
}

/// Loads a manifest, populating `remote_by_path` and (when `synthesize`
/// is set) priming the store with tree objects rebuilt from each block.
///
/// Malformed lines are reported to stderr and skipped, matching the
/// file's role as best-effort prior state.
///
/// # Errors
/// I/O failure reading the file.
pub fn load(
    path: &Path,
    synthesize: bool,
    store: &mut ObjectStore,
    remote_by_path: &mut PathMap,
) -> io::Result<LoadedManifest> {
    let data = fs::read(path)?;
    let mut loaded = LoadedManifest::default();
    let mut base_path = String::new();
    let mut buffer: Vec<u8> = Vec::new();
    let mut first = true;

    for raw_line in data.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(raw_line);

        if first {
            first = false;
            if !line.is_empty() {
                loaded.have = Some(line.into_owned());
            }
            continue;
        }

        // A blank line closes the current tree block.
        if line.is_empty() {
            if !buffer.is_empty() {
                if synthesize {
                    store
                        .insert_resident(ObjectKind::Tree, std::mem::take(&mut buffer))
                        .map_err(|err| io::Error::other(err.to_string()))?;
                }
                buffer.clear();
            }
            continue;
        }

        let mut fields = line.splitn(3, '\t');
        let (mode_text, hash_text, entry_path) =
            match (fields.next(), fields.next(), fields.next()) {
                (Some(m), Some(h), Some(p)) => (m, h, p),
                _ => {
                    eprintln!(" ! Malformed line '{line}' in {}.  Skipping...", path.display());
                    continue;
                }
            };

        let mode = u32::from_str_radix(mode_text, 8).unwrap_or(0);
        let id = match ObjectId::from_hex_str(hash_text) {
            Ok(id) => id,
            Err(_) => {
                eprintln!(" ! Malformed line '{line}' in {}.  Skipping...", path.display());
                continue;
            }
        };

        let node_path = if let Some(dir) = entry_path.strip_suffix('/') {
            base_path = entry_path.to_string();
            dir.to_string()
        } else {
            // Rebuild the parent tree's entry bytes: mode, name, raw hash.
            buffer.extend_from_slice(format!("{mode:o}").as_bytes());
            buffer.push(b' ');
            buffer.extend_from_slice(entry_path.as_bytes());
            buffer.push(0);
            buffer.extend_from_slice(id.as_bytes());
            format!("{base_path}{entry_path}")
        };

        remote_by_path.insert(
            node_path,
            FileNode {
                mode,
                id: Some(id),
                keep: false,
                save: false,
            },
        );
    }

    Ok(loaded)
}

/// Streaming writer for the staged manifest.
///
/// The output is written to `<path>.new` and renamed onto `path` by
/// [`ManifestWriter::commit`]. Dropping an uncommitted writer removes the
/// staged file.
#[derive(Debug)]
pub struct ManifestWriter {
    out: Option<BufWriter<File>>,
    staged: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl ManifestWriter {
    /// Creates the staged file and writes the "have" line.
    ///
    /// # Errors
    /// File creation or write failure.
    pub fn create(path: &Path, want: &str) -> io::Result<Self> {
        // Appended suffix, not `with_extension`: section names may contain
        // dots that must survive in the staged name.
        let mut staged = path.as_os_str().to_owned();
        staged.push(".new");
        let staged = PathBuf::from(staged);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&staged)?;
        let mut out = BufWriter::new(file);
        out.write_all(want.as_bytes())?;
        out.write_all(b"\n")?;
        Ok(Self {
            out: Some(out),
            staged,
            target: path.to_path_buf(),
            committed: false,
        })
    }

    /// Writes a tree block header.
    ///
    /// # Errors
    /// Write failure.
    pub fn begin_tree(&mut self, id: &ObjectId, path: &str) -> io::Result<()> {
        let out = self.writer()?;
        writeln!(out, "040000\t{id}\t{path}/")
    }

    /// Writes one tree entry line.
    ///
    /// # Errors
    /// Write failure.
    pub fn entry(&mut self, mode: u32, id: &ObjectId, name: &str) -> io::Result<()> {
        let out = self.writer()?;
        writeln!(out, "{mode:o}\t{id}\t{name}")
    }

    /// Terminates the current tree block.
    ///
    /// # Errors
    /// Write failure.
    pub fn end_tree(&mut self) -> io::Result<()> {
        let out = self.writer()?;
        out.write_all(b"\n")
    }

    /// Flushes and atomically renames the staged file onto the manifest.
    ///
    /// # Errors
    /// Flush or rename failure.
    pub fn commit(mut self) -> io::Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        fs::rename(&self.staged, &self.target)?;
        self.committed = true;
        Ok(())
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.out
            .as_mut()
            .ok_or_else(|| io::Error::other("manifest writer already committed"))
    }
}

impl Drop for ManifestWriter {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.out.take());
            let _ = fs::remove_file(&self.staged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    fn sample_manifest(dir: &Path) -> PathBuf {
        let blob = hash::blob_id(b"hello\n");
        let tree_bytes = crate::testutil::tree_entry("100644", "a.txt", &blob);
        let tree_id = hash::object_id("tree", &tree_bytes);
        let commit = crate::testutil::commit_payload(&tree_id);
        let commit_id = hash::object_id("commit", &commit);

        let path = dir.join("manifest");
        let text = format!(
            "{}\n040000\t{}\t/target/\n100644\t{}\t{}\n\n",
            commit_id.to_hex(),
            tree_id.to_hex(),
            blob.to_hex(),
            "a.txt"
        );
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn load_recovers_have_and_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_manifest(dir.path());

        let mut store = ObjectStore::new(false);
        let mut remote = PathMap::new();
        let loaded = load(&path, true, &mut store, &mut remote).unwrap();

        assert!(loaded.have.is_some());
        assert!(remote.contains_key("/target"));
        assert!(remote.contains_key("/target/a.txt"));
        let node = &remote["/target/a.txt"];
        assert_eq!(node.mode, 0o100644);
        assert!(!node.keep);
    }

    #[test]
    fn synthesized_tree_hashes_to_recorded_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_manifest(dir.path());

        let mut store = ObjectStore::new(false);
        let mut remote = PathMap::new();
        load(&path, true, &mut store, &mut remote).unwrap();

        let tree_id = remote["/target"].id.unwrap();
        assert_eq!(store.lookup(&tree_id), Some(0));
    }

    #[test]
    fn clone_runs_skip_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_manifest(dir.path());

        let mut store = ObjectStore::new(false);
        let mut remote = PathMap::new();
        load(&path, false, &mut store, &mut remote).unwrap();
        assert!(store.is_empty());
        assert!(!remote.is_empty());
    }

    #[test]
    fn writer_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_manifest(dir.path());
        let original = fs::read(&path).unwrap();

        let mut store = ObjectStore::new(false);
        let mut remote = PathMap::new();
        let loaded = load(&path, true, &mut store, &mut remote).unwrap();

        // Re-emit from the parsed state.
        let out_path = dir.path().join("rewritten");
        let mut writer = ManifestWriter::create(&out_path, loaded.have.as_deref().unwrap()).unwrap();
        let tree_id = remote["/target"].id.unwrap();
        let blob_id = remote["/target/a.txt"].id.unwrap();
        writer.begin_tree(&tree_id, "/target").unwrap();
        writer.entry(0o100644, &blob_id, "a.txt").unwrap();
        writer.end_tree().unwrap();
        writer.commit().unwrap();

        assert_eq!(fs::read(&out_path).unwrap(), original);
    }

    #[test]
    fn uncommitted_writer_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("manifest");
        let staged = target.with_extension("new");
        {
            let _writer = ManifestWriter::create(&target, "0".repeat(40).as_str()).unwrap();
            assert!(staged.exists());
        }
        assert!(!staged.exists());
        assert!(!target.exists());
    }
}
