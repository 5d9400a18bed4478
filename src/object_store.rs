//! In-memory object index with optional file-backed spill.
//!
//! Objects live in an insertion-order arena whose indices are stable; the
//! arena order matches the pack's on-wire order, which is what OFS_DELTA
//! back-references resolve against. A second, ordered index maps canonical
//! hashes to arena indices for the non-delta types; deltas exist only in
//! the arena.
//!
//! # Low-memory mode
//! While a pack is being unpacked, every inflated payload is appended to a
//! scratch file and the in-memory copy is dropped; the arena entry keeps
//! `(file_offset, size)` and reloads on demand. After the unpack the
//! scratch file is reopened read-only and unlinked, so it disappears with
//! the process. Objects from pre-pack sources (manifest trees, locally
//! loaded blobs) and resolved delta results stay resident and are never
//! released.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::errors::StoreError;
use crate::hash;
use crate::object_id::ObjectId;

/// Object variant stored in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
    /// Delta whose base is identified by arena index (resolved from the
    /// pack offset during the read).
    OfsDelta { base_index: usize },
    /// Delta whose base is identified by hash.
    RefDelta { base_id: ObjectId },
}

impl ObjectKind {
    /// Wire type name used in the canonical hash header.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
            Self::OfsDelta { .. } => "ofs-delta",
            Self::RefDelta { .. } => "ref-delta",
        }
    }

    /// True for the two delta variants.
    #[inline]
    #[must_use]
    pub const fn is_delta(&self) -> bool {
        matches!(self, Self::OfsDelta { .. } | Self::RefDelta { .. })
    }
}

/// One arena entry.
#[derive(Debug)]
struct StoredObject {
    kind: ObjectKind,
    id: ObjectId,
    pack_offset: u64,
    data: Option<Vec<u8>>,
    size: u32,
    spill_offset: Option<u64>,
    can_free: bool,
}

/// Scratch-file state for low-memory mode.
#[derive(Debug)]
struct Spill {
    writer: Option<File>,
    reader: Option<File>,
    len: u64,
}

/// Insertion-order arena plus hash index.
#[derive(Debug)]
pub struct ObjectStore {
    objects: Vec<StoredObject>,
    by_id: BTreeMap<ObjectId, usize>,
    low_memory: bool,
    supersede: bool,
    verbose: bool,
    spill: Option<Spill>,
}

impl ObjectStore {
    /// Creates an empty store.
    ///
    /// With `low_memory` set, packed objects are spilled to the scratch
    /// file registered via [`ObjectStore::begin_spill`].
    #[must_use]
    pub fn new(low_memory: bool) -> Self {
        Self {
            objects: Vec::new(),
            by_id: BTreeMap::new(),
            low_memory,
            supersede: false,
            verbose: false,
            spill: None,
        }
    }

    /// Lets a freshly arrived duplicate supersede the indexed entry.
    ///
    /// Used by repair runs, where the re-fetched copy is the one that must
    /// be materialized.
    pub fn set_supersede(&mut self, supersede: bool) {
        self.supersede = supersede;
    }

    /// Dumps one record per stored object to stdout.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Number of arena entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when no objects are stored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Kind of the object at `index`.
    #[inline]
    #[must_use]
    pub fn kind_at(&self, index: usize) -> ObjectKind {
        self.objects[index].kind
    }

    /// Canonical id of the object at `index`.
    #[inline]
    #[must_use]
    pub fn id_at(&self, index: usize) -> ObjectId {
        self.objects[index].id
    }

    /// Payload size of the object at `index`.
    #[inline]
    #[must_use]
    pub fn size_at(&self, index: usize) -> usize {
        self.objects[index].size as usize
    }

    /// Looks up a non-delta object by canonical hash.
    #[inline]
    #[must_use]
    pub fn lookup(&self, id: &ObjectId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    /// Finds the most recent object whose entry header sits at
    /// `pack_offset`.
    ///
    /// OFS_DELTA back-references always point at earlier entries, so the
    /// scan runs newest-first.
    #[must_use]
    pub fn find_by_pack_offset(&self, pack_offset: u64) -> Option<usize> {
        self.objects
            .iter()
            .rposition(|obj| obj.pack_offset == pack_offset)
    }

    /// Inserts an object read from pack data.
    ///
    /// In low-memory mode the payload is appended to the scratch file and
    /// dropped from memory.
    ///
    /// # Errors
    /// Scratch-file I/O failures.
    pub fn insert_packed(
        &mut self,
        kind: ObjectKind,
        data: Vec<u8>,
        pack_offset: u64,
    ) -> Result<usize, StoreError> {
        let spill = self.low_memory;
        self.insert(kind, data, pack_offset, spill)
    }

    /// Inserts an object that must stay resident: a resolved delta
    /// result, a manifest-synthesized tree, or a locally loaded blob.
    ///
    /// # Errors
    /// Scratch-file I/O failures (none in practice; resident inserts do
    /// not touch the spill file).
    pub fn insert_resident(
        &mut self,
        kind: ObjectKind,
        data: Vec<u8>,
    ) -> Result<usize, StoreError> {
        self.insert(kind, data, 0, false)
    }

    fn insert(
        &mut self,
        kind: ObjectKind,
        data: Vec<u8>,
        pack_offset: u64,
        spill: bool,
    ) -> Result<usize, StoreError> {
        let id = hash::object_id(kind.type_name(), &data);

        if !kind.is_delta() {
            if let Some(&existing) = self.by_id.get(&id) {
                if !self.supersede {
                    return Ok(existing);
                }
            }
        }

        let index = self.objects.len();
        let size = data.len() as u32;
        let mut object = StoredObject {
            kind,
            id,
            pack_offset,
            data: Some(data),
            size,
            spill_offset: None,
            can_free: false,
        };

        if spill {
            let offset = self.spill_write(object.data.as_deref().unwrap_or_default())?;
            object.spill_offset = Some(offset);
            object.can_free = true;
            object.data = None;
        }

        if self.verbose {
            println!(
                "###### {index:05}-{} {pack_offset} {size} {id}",
                object.kind.type_name()
            );
        }

        if !kind.is_delta() {
            self.by_id.insert(id, index);
        }
        self.objects.push(object);
        Ok(index)
    }

    /// Opens the scratch file for the unpack phase.
    ///
    /// # Errors
    /// File creation failure.
    pub fn begin_spill(&mut self, path: &Path) -> Result<(), StoreError> {
        let writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        self.spill = Some(Spill {
            writer: Some(writer),
            reader: None,
            len: 0,
        });
        Ok(())
    }

    /// Closes the write side, reopens the scratch file read-only, and
    /// unlinks it so the descriptor is its only reference.
    ///
    /// # Errors
    /// Flush, reopen, or unlink failure.
    pub fn finish_spill(&mut self, path: &Path) -> Result<(), StoreError> {
        if let Some(spill) = self.spill.as_mut() {
            if let Some(mut writer) = spill.writer.take() {
                writer.flush()?;
            }
            spill.reader = Some(File::open(path)?);
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn spill_write(&mut self, data: &[u8]) -> Result<u64, StoreError> {
        let spill = self
            .spill
            .as_mut()
            .ok_or(StoreError::BufferUnavailable { index: usize::MAX })?;
        let writer = spill
            .writer
            .as_mut()
            .ok_or(StoreError::BufferUnavailable { index: usize::MAX })?;
        let offset = spill.len;
        writer.write_all(data)?;
        spill.len += data.len() as u64;
        Ok(offset)
    }

    /// Returns the payload of the object at `index`, reloading it from
    /// the scratch file if it was released.
    ///
    /// # Errors
    /// Scratch-file I/O failure, or `BufferUnavailable` when the entry
    /// has neither a resident copy nor a file offset.
    pub fn buffer(&mut self, index: usize) -> Result<&[u8], StoreError> {
        if self.objects[index].data.is_none() {
            let offset = self.objects[index]
                .spill_offset
                .ok_or(StoreError::BufferUnavailable { index })?;
            let size = self.objects[index].size as usize;
            let reader = self
                .spill
                .as_mut()
                .and_then(|s| s.reader.as_mut())
                .ok_or(StoreError::BufferUnavailable { index })?;
            let mut data = vec![0u8; size];
            reader.seek(SeekFrom::Start(offset))?;
            reader.read_exact(&mut data)?;
            self.objects[index].data = Some(data);
        }
        Ok(self.objects[index].data.as_deref().unwrap_or_default())
    }

    /// Drops the in-memory copy of a file-backed object.
    ///
    /// Resident objects are unaffected.
    pub fn release(&mut self, index: usize) {
        if self.low_memory && self.objects[index].can_free {
            self.objects[index].data = None;
        }
    }
}
