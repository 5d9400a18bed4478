//! End-to-end sync scenarios over synthetic packs: clone into an empty
//! target, idempotent re-runs, incremental pulls with deltas, symlink
//! materialization, and low-memory equivalence.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use common::{commit_payload, run_once, synth_pack, tree_entry, varint, Entry, Env};
use gitup::hash;
use gitup::object_id::ObjectId;

/// Pack for scenario 1: commit -> tree -> blob `a.txt` = "hello\n".
fn clone_pack() -> (Vec<u8>, ObjectId) {
    let blob = b"hello\n".to_vec();
    let blob_id = hash::blob_id(&blob);
    let tree = tree_entry("100644", "a.txt", &blob_id);
    let tree_id = hash::object_id("tree", &tree);
    let commit = commit_payload(&tree_id);
    let commit_id = hash::object_id("commit", &commit);

    let pack = synth_pack(&[
        Entry::Plain(1, commit),
        Entry::Plain(2, tree),
        Entry::Plain(3, blob),
    ]);
    (pack, commit_id)
}

#[test]
fn clone_from_empty_target() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::new(dir.path());
    let (pack, want) = clone_pack();

    let written = run_once(&env, &pack, &want).unwrap();
    assert_eq!(written, 1);

    let file = format!("{}/a.txt", env.target);
    assert_eq!(fs::read(&file).unwrap(), b"hello\n");
    let mode = fs::metadata(&file).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o644);

    let manifest = String::from_utf8(env.manifest_bytes()).unwrap();
    let mut lines = manifest.lines();
    assert_eq!(lines.next().unwrap(), want.to_hex());
    let tree_id = hash::object_id("tree", &tree_entry("100644", "a.txt", &hash::blob_id(b"hello\n")));
    assert!(manifest.contains(&format!("040000\t{}\t{}/", tree_id.to_hex(), env.target)));
}

#[test]
fn second_run_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::new(dir.path());
    let (pack, want) = clone_pack();

    run_once(&env, &pack, &want).unwrap();
    let manifest_before = env.manifest_bytes();
    let file = format!("{}/a.txt", env.target);
    let contents_before = fs::read(&file).unwrap();

    let written = run_once(&env, &pack, &want).unwrap();
    assert_eq!(written, 0);
    assert_eq!(env.manifest_bytes(), manifest_before);
    assert_eq!(fs::read(&file).unwrap(), contents_before);
}

#[test]
fn incremental_pull_with_ofs_delta() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::new(dir.path());
    let (pack, want) = clone_pack();
    run_once(&env, &pack, &want).unwrap();

    // The new blob arrives as an ofs-delta against the old one.
    let old_blob = b"hello\n".to_vec();
    let new_blob_id = hash::blob_id(b"hello world\n");
    let tree = tree_entry("100644", "a.txt", &new_blob_id);
    let tree_id = hash::object_id("tree", &tree);
    let commit = commit_payload(&tree_id);
    let commit_id = hash::object_id("commit", &commit);

    let mut delta = varint(6);
    delta.extend_from_slice(&varint(12));
    delta.extend_from_slice(&[0x90, 0x05]); // copy "hello"
    delta.push(0x07);
    delta.extend_from_slice(b" world\n"); // insert " world\n"

    let pack2 = synth_pack(&[
        Entry::Plain(1, commit),
        Entry::Plain(2, tree),
        Entry::Plain(3, old_blob),
        Entry::Ofs(2, delta),
    ]);

    let written = run_once(&env, &pack2, &commit_id).unwrap();
    assert_eq!(written, 1);

    let file = format!("{}/a.txt", env.target);
    assert_eq!(fs::read(&file).unwrap(), b"hello world\n");
    let manifest = String::from_utf8(env.manifest_bytes()).unwrap();
    assert_eq!(manifest.lines().next().unwrap(), commit_id.to_hex());
}

#[test]
fn thin_pack_base_recovered_from_local_tree() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::new(dir.path());
    let (pack, want) = clone_pack();
    run_once(&env, &pack, &want).unwrap();

    // A thin pack: the delta's base blob is only on disk, not in-pack.
    let base_id = hash::blob_id(b"hello\n");
    let new_blob_id = hash::blob_id(b"hello world\n");
    let tree = tree_entry("100644", "a.txt", &new_blob_id);
    let tree_id = hash::object_id("tree", &tree);
    let commit = commit_payload(&tree_id);
    let commit_id = hash::object_id("commit", &commit);

    let mut delta = varint(6);
    delta.extend_from_slice(&varint(12));
    delta.extend_from_slice(&[0x90, 0x05]);
    delta.push(0x07);
    delta.extend_from_slice(b" world\n");

    let pack2 = synth_pack(&[
        Entry::Plain(1, commit),
        Entry::Plain(2, tree),
        Entry::Ref(base_id, delta),
    ]);

    run_once(&env, &pack2, &commit_id).unwrap();
    assert_eq!(
        fs::read(format!("{}/a.txt", env.target)).unwrap(),
        b"hello world\n"
    );
}

#[test]
fn symlink_materialization() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::new(dir.path());

    let blob = b"hello\n".to_vec();
    let blob_id = hash::blob_id(&blob);
    let link_target = b"a.txt".to_vec();
    let link_id = hash::blob_id(&link_target);

    let mut tree = tree_entry("100644", "a.txt", &blob_id);
    tree.extend_from_slice(&tree_entry("120000", "link", &link_id));
    let tree_id = hash::object_id("tree", &tree);
    let commit = commit_payload(&tree_id);
    let commit_id = hash::object_id("commit", &commit);

    let pack = synth_pack(&[
        Entry::Plain(1, commit),
        Entry::Plain(2, tree),
        Entry::Plain(3, blob),
        Entry::Plain(3, link_target),
    ]);

    run_once(&env, &pack, &commit_id).unwrap();
    let link = format!("{}/link", env.target);
    assert_eq!(fs::read_link(&link).unwrap().as_os_str(), "a.txt");

    // A rescan hash-matches the link, so a second run changes nothing.
    let written = run_once(&env, &pack, &commit_id).unwrap();
    assert_eq!(written, 0);
    assert_eq!(fs::read_link(&link).unwrap().as_os_str(), "a.txt");
}

#[test]
fn nested_trees_and_executables() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::new(dir.path());

    let script = b"#!/bin/sh\nexit 0\n".to_vec();
    let script_id = hash::blob_id(&script);
    let subtree = tree_entry("100755", "run.sh", &script_id);
    let subtree_id = hash::object_id("tree", &subtree);
    let root = tree_entry("40000", "bin", &subtree_id);
    let root_id = hash::object_id("tree", &root);
    let commit = commit_payload(&root_id);
    let commit_id = hash::object_id("commit", &commit);

    let pack = synth_pack(&[
        Entry::Plain(1, commit),
        Entry::Plain(2, root),
        Entry::Plain(2, subtree),
        Entry::Plain(3, script),
    ]);

    run_once(&env, &pack, &commit_id).unwrap();
    let path = format!("{}/bin/run.sh", env.target);
    assert_eq!(fs::read(&path).unwrap(), b"#!/bin/sh\nexit 0\n");
    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o755);

    // Both tree blocks appear in the manifest.
    let manifest = String::from_utf8(env.manifest_bytes()).unwrap();
    assert!(manifest.contains(&format!("040000\t{}\t{}/", root_id.to_hex(), env.target)));
    assert!(manifest.contains(&format!(
        "040000\t{}\t{}/bin/",
        subtree_id.to_hex(),
        env.target
    )));
}

#[test]
fn low_memory_mode_is_bit_identical() {
    let dir_normal = tempfile::tempdir().unwrap();
    let dir_low = tempfile::tempdir().unwrap();
    let mut env_normal = Env::new(dir_normal.path());
    let mut env_low = Env::new(dir_low.path());
    env_normal.low_memory = false;
    env_low.low_memory = true;

    let (pack, want) = clone_pack();
    run_once(&env_normal, &pack, &want).unwrap();
    run_once(&env_low, &pack, &want).unwrap();

    let normal = fs::read(format!("{}/a.txt", env_normal.target)).unwrap();
    let low = fs::read(format!("{}/a.txt", env_low.target)).unwrap();
    assert_eq!(normal, low);
    assert_eq!(env_normal.manifest_bytes(), env_low.manifest_bytes());

    // The scratch file is unlinked once the unpack finishes.
    let mut scratch = env_low.manifest.as_os_str().to_owned();
    scratch.push(".tmp");
    assert!(!Path::new(&scratch).exists());
}

#[test]
fn manifest_round_trip_reproduces_itself() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::new(dir.path());
    let (pack, want) = clone_pack();
    run_once(&env, &pack, &want).unwrap();
    let first = env.manifest_bytes();

    // Reload the manifest (synthesizing trees) and re-run: the walk
    // regenerates byte-identical output from the synthesized state.
    run_once(&env, &pack, &want).unwrap();
    assert_eq!(env.manifest_bytes(), first);
}
