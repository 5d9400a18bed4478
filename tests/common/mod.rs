#![allow(dead_code)] // each test binary uses a different subset

//! Shared fixtures: synthetic packs and an offline sync harness that
//! drives the manifest/scan/unpack/resolve/walk/prune stages the way a
//! real run does, minus the network.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;

use gitup::delta;
use gitup::errors::GitupError;
use gitup::file_node::{HashIndex, PathMap};
use gitup::hash;
use gitup::manifest::{self, ManifestWriter};
use gitup::object_id::ObjectId;
use gitup::object_store::ObjectStore;
use gitup::pack;
use gitup::scanner::{self, LocalSource};
use gitup::walker::{self, ChangeDisplay, Walker};

/// Zlib-compresses a payload.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Encodes a pack entry header.
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

/// One pack entry for [`synth_pack`].
pub enum Entry {
    /// Non-delta object: type tag 1..=4.
    Plain(u8, Vec<u8>),
    /// OFS_DELTA against an earlier entry (by index).
    Ofs(usize, Vec<u8>),
    /// REF_DELTA against an out-of-pack base.
    Ref(ObjectId, Vec<u8>),
}

/// Builds a complete pack with a valid SHA-1 trailer.
pub fn synth_pack(entries: &[Entry]) -> Vec<u8> {
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    let mut offsets = Vec::new();
    for entry in entries {
        let offset = pack.len() as u64;
        offsets.push(offset);
        match entry {
            Entry::Plain(kind, payload) => {
                pack.extend_from_slice(&pack_entry_header(*kind, payload.len() as u64));
                pack.extend_from_slice(&deflate(payload));
            }
            Entry::Ofs(base, payload) => {
                pack.extend_from_slice(&pack_entry_header(6, payload.len() as u64));
                pack.extend_from_slice(&ofs_encode(offset - offsets[*base]));
                pack.extend_from_slice(&deflate(payload));
            }
            Entry::Ref(base_id, payload) => {
                pack.extend_from_slice(&pack_entry_header(7, payload.len() as u64));
                pack.extend_from_slice(base_id.as_bytes());
                pack.extend_from_slice(&deflate(payload));
            }
        }
    }

    let trailer = hash::sha1_bytes(&pack);
    pack.extend_from_slice(trailer.as_bytes());
    pack
}

/// Serializes one git tree entry.
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

/// Delta size varint.
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

/// Offline sync environment: a target tree and a manifest location.
pub struct Env {
    pub target: String,
    pub manifest: PathBuf,
    pub ignores: Vec<String>,
    pub low_memory: bool,
}

impl Env {
    pub fn new(root: &Path) -> Self {
        Self {
            target: root.join("tree").to_string_lossy().into_owned(),
            manifest: root.join("work").join("section"),
            ignores: Vec::new(),
            low_memory: false,
        }
    }

    pub fn manifest_bytes(&self) -> Vec<u8> {
        fs::read(&self.manifest).unwrap()
    }
}

/// In-memory state for one offline run.
pub struct State {
    pub store: ObjectStore,
    pub local_by_path: PathMap,
    pub local_by_hash: HashIndex,
    pub remote_by_path: PathMap,
}

/// Loads manifest + local scan the way the session's prepare stage does.
pub fn load_state(env: &Env) -> Result<State, GitupError> {
    let mut state = State {
        store: ObjectStore::new(env.low_memory),
        local_by_path: PathMap::new(),
        local_by_hash: HashIndex::new(),
        remote_by_path: PathMap::new(),
    };

    let manifest_exists = env.manifest.exists();
    let clone = !manifest_exists || !Path::new(&env.target).exists();
    if manifest_exists {
        manifest::load(
            &env.manifest,
            !clone,
            &mut state.store,
            &mut state.remote_by_path,
        )?;
    }
    if Path::new(&env.target).exists() {
        scanner::scan_local_tree(
            &env.target,
            &env.target,
            &env.ignores,
            &state.remote_by_path,
            &mut state.local_by_path,
            &mut state.local_by_hash,
        )?;
    }
    Ok(state)
}

/// Unpack + resolve + walk + materialize + manifest commit.
///
/// Returns the number of files queued for writing.
pub fn apply_pack(
    env: &Env,
    state: &mut State,
    pack_data: &[u8],
    want: &ObjectId,
) -> Result<usize, GitupError> {
    fs::create_dir_all(env.manifest.parent().unwrap()).unwrap();

    pack::verify_trailer(pack_data)?;
    if env.low_memory {
        let mut scratch = env.manifest.as_os_str().to_owned();
        scratch.push(".tmp");
        let scratch = PathBuf::from(scratch);
        state.store.begin_spill(&scratch)?;
        pack::unpack(&mut state.store, pack_data)?;
        state.store.finish_spill(&scratch)?;
    } else {
        pack::unpack(&mut state.store, pack_data)?;
    }

    let mut provider = LocalSource {
        local_by_path: &state.local_by_path,
        local_by_hash: &state.local_by_hash,
    };
    delta::resolve_deltas(&mut state.store, &mut provider)?;

    let mut display = ChangeDisplay::new(0, 0);
    let mut writer = ManifestWriter::create(&env.manifest, &want.to_hex())?;
    let mut walker = Walker {
        store: &mut state.store,
        local_by_path: &mut state.local_by_path,
        local_by_hash: &state.local_by_hash,
        remote_by_path: &mut state.remote_by_path,
        display: &mut display,
    };
    let mut updating = Vec::new();
    walker.walk_commit(want, &env.target, &mut writer)?;
    let queued = state
        .remote_by_path
        .values()
        .filter(|node| node.save)
        .count();

    let mut walker = Walker {
        store: &mut state.store,
        local_by_path: &mut state.local_by_path,
        local_by_hash: &state.local_by_hash,
        remote_by_path: &mut state.remote_by_path,
        display: &mut display,
    };
    walker.materialize(&mut updating)?;
    writer.commit()?;
    Ok(queued)
}

/// Deletion pass over local nodes not marked keep.
pub fn delete_orphans(env: &Env, state: &mut State) {
    let doomed: Vec<(String, u32)> = state
        .local_by_path
        .iter()
        .filter(|(_, node)| !node.keep)
        .map(|(path, node)| (path.clone(), node.mode))
        .collect();

    for (path, mode) in doomed {
        if scanner::is_ignored(&env.ignores, &path) {
            continue;
        }
        if mode & 0o170000 == 0o040000 {
            walker::prune_tree(&env.target, &path).unwrap();
        } else {
            let _ = fs::remove_file(&path);
        }
    }
}

/// Complete run: fresh state, apply, delete. Returns queued-write count.
pub fn run_once(env: &Env, pack_data: &[u8], want: &ObjectId) -> Result<usize, GitupError> {
    let mut state = load_state(env)?;
    let queued = apply_pack(env, &mut state, pack_data, want)?;
    delete_orphans(env, &mut state);
    Ok(queued)
}
