//! The sync session.
//!
//! Owns the object store, the three file-node collections, and the run
//! state (clone vs. pull vs. repair), and drives the whole flow: load
//! the prior manifest, scan the local tree, talk to the server, unpack
//! and resolve the pack, walk and materialize, then prune what the
//! remote no longer has.
//!
//! Every run is one of:
//! - **clone** — target or manifest missing (or `-c`): shallow fetch of
//!   the whole tree.
//! - **pull** — incremental fetch using the manifest's "have" commit as
//!   the delta base.
//! - **repair** — targeted multi-want fetch of missing or modified
//!   files; the manifest is left untouched and the user is told to
//!   rerun.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::config::{encode_section, Config};
use crate::delta;
use crate::errors::{GitupError, ProtocolError};
use crate::file_node::{HashIndex, PathMap};
use crate::manifest::{self, ManifestWriter};
use crate::object_id::ObjectId;
use crate::object_store::ObjectStore;
use crate::pack;
use crate::protocol;
use crate::repair::plan_repairs;
use crate::scanner::{self, LocalSource};
use crate::transport::Transport;
use crate::walker::{self, ChangeDisplay, Walker};

/// One invocation's state.
pub struct Session {
    config: Config,
    store: ObjectStore,
    local_by_path: PathMap,
    local_by_hash: HashIndex,
    remote_by_path: PathMap,
    display: ChangeDisplay,
    updating: Vec<String>,
    manifest_path: PathBuf,
    branch: String,
    have: Option<String>,
    want: Option<String>,
    clone: bool,
    repair: bool,
    current: bool,
}

/// Runs one complete sync with the resolved configuration.
///
/// # Errors
/// Any stage failure; all are fatal.
pub fn run(config: Config) -> Result<(), GitupError> {
    let mut session = Session::new(config);
    session.prepare()?;
    session.sync()?;
    session.write_revision_stamp()?;
    session.delete_orphans()?;
    session.finish();
    Ok(())
}

impl Session {
    fn new(config: Config) -> Self {
        let depth = if config.display_depth > 0 {
            // The configured depth counts below the target directory.
            config.display_depth as usize
                + config.target_directory.matches('/').count()
        } else {
            0
        };
        let display = ChangeDisplay::new(config.verbosity, depth);
        let store = ObjectStore::new(config.low_memory);

        Self {
            branch: config.branch.clone(),
            have: config.have.clone(),
            want: config.want.clone(),
            clone: config.force_clone,
            repair: false,
            current: false,
            store,
            local_by_path: PathMap::new(),
            local_by_hash: HashIndex::new(),
            remote_by_path: PathMap::new(),
            display,
            updating: Vec::new(),
            manifest_path: PathBuf::new(),
            config,
        }
    }

    fn verbose(&self) -> bool {
        self.config.verbosity > 0
    }

    /// Work directory, manifest, local scan, and parameter display.
    fn prepare(&mut self) -> Result<(), GitupError> {
        walker::make_path(&self.config.work_directory)?;

        let encoded = encode_section(&self.config.section);
        self.manifest_path = Path::new(&self.config.work_directory).join(&encoded);
        if encoded != self.config.section {
            // A manifest written before the name was encoded moves over.
            let plain = Path::new(&self.config.work_directory).join(&self.config.section);
            if plain.exists() {
                fs::rename(&plain, &self.manifest_path)?;
            }
        }

        let target_exists = Path::new(&self.config.target_directory).exists();
        let manifest_exists = self.manifest_path.exists();
        if !target_exists || !manifest_exists {
            self.clone = true;
        }

        if target_exists && manifest_exists {
            let loaded = manifest::load(
                &self.manifest_path,
                !self.clone,
                &mut self.store,
                &mut self.remote_by_path,
            )?;
            if self.have.is_none() {
                self.have = loaded.have;
            }
        }

        if target_exists {
            if self.verbose() {
                eprint!("# Scanning local repository...");
            }
            let target = self.config.target_directory.clone();
            scanner::scan_local_tree(
                &target,
                &target,
                &self.config.ignores,
                &self.remote_by_path,
                &mut self.local_by_path,
                &mut self.local_by_hash,
            )?;
            if self.verbose() {
                eprintln!();
            }
        }

        // Pulling without a usable delta base degenerates to a clone.
        if !self.clone && self.have.is_none() {
            self.clone = true;
        }

        if self.verbose() {
            self.show_parameters();
        }
        Ok(())
    }

    fn show_parameters(&self) {
        let config = &self.config;
        eprintln!("# Host: {}", config.host);
        eprintln!("# Port: {}", config.port);
        if let Some(proxy) = &config.proxy {
            eprintln!("# Proxy Host: {}", proxy.host);
            eprintln!("# Proxy Port: {}", proxy.port);
            if let Some(username) = &proxy.username {
                eprintln!("# Proxy Username: {username}");
            }
        }
        eprintln!("# Repository Path: {}", config.repository_path);
        eprintln!("# Target Directory: {}", config.target_directory);
        if let Some(pack_file) = &config.pack_file {
            eprintln!("# Using pack file: {pack_file}");
        }
        if let Some(tag) = &config.tag {
            eprintln!("# Tag: {tag}");
        }
        if let Some(have) = &self.have {
            eprintln!("# Have: {have}");
        }
        if let Some(want) = &self.want {
            eprintln!("# Want: {want}");
        }
        if config.low_memory {
            eprintln!("# Low memory mode: Yes");
        }
    }

    /// Fetch, unpack, resolve, and materialize.
    fn sync(&mut self) -> Result<(), GitupError> {
        let local_pack = self
            .config
            .pack_file
            .clone()
            .filter(|path| Path::new(path).exists());

        if let Some(pack_file) = local_pack {
            if self.verbose() {
                eprintln!("# Action: {}", if self.clone { "clone" } else { "pull" });
            }
            if self.want.is_none() {
                return Err(GitupError::Protocol(ProtocolError::RefNotFound {
                    reference: format!("want checksum for {pack_file}"),
                }));
            }
            let data = fs::read(&pack_file)?;
            pack::verify_trailer(&data)?;
            self.unpack(&data)?;
            self.resolve_deltas()?;
            self.save_objects()?;
            return Ok(());
        }

        let mut transport = Transport::connect(&self.config)?;

        // Discovery, ref listing, and want resolution.
        let discovery = transport.exchange(
            protocol::refs_discovery_request(&self.config).as_bytes(),
        )?;
        if self.config.verbosity > 1 {
            println!("{}", String::from_utf8_lossy(&discovery));
        }
        protocol::verify_version_two(&discovery, &self.config.host)?;

        let refs_body = protocol::ls_refs_body();
        let refs = transport.exchange(
            protocol::upload_pack_request(&self.config, &refs_body).as_bytes(),
        )?;
        if self.config.verbosity > 1 {
            println!("{}", String::from_utf8_lossy(&refs));
        }

        let refs_text = String::from_utf8_lossy(&refs);
        let resolved = protocol::resolve_want(
            &refs_text,
            &self.config.branch,
            self.config.tag.as_deref(),
            self.want.as_deref(),
            Local::now().date_naive(),
        )?;
        self.branch = resolved.branch;
        if self.verbose() {
            if self.want.is_none() {
                eprintln!("# Want: {}", resolved.want);
            }
            if self.config.tag.is_none() {
                eprintln!("# Branch: {}", self.branch);
            }
        }
        self.want = Some(resolved.want);

        if self.config.keep_pack && self.verbose() {
            eprintln!("# Saving pack file: {}", self.pack_file_name());
        }

        if self.have.is_some() && self.have == self.want {
            self.current = true;
        }

        // A pull first verifies the tree it is about to delta against.
        if self.config.repair || !self.clone {
            let plan = plan_repairs(
                &self.remote_by_path,
                &self.local_by_path,
                &self.config.ignores,
                self.config.verbosity,
            );
            if !plan.is_empty() {
                self.repair = true;
                self.store.set_supersede(true);
                if self.verbose() {
                    eprintln!("# Action: repair");
                }
                let body = protocol::repair_body(&plan)?;
                self.fetch_pack(&mut transport, &body)?;
                self.resolve_deltas()?;
                self.save_repairs()?;
            }
        }

        if !self.current && !self.repair {
            if self.verbose() {
                eprintln!("# Action: {}", if self.clone { "clone" } else { "pull" });
            }
            let want = self.want.clone().unwrap_or_default();
            let body = if self.clone {
                protocol::clone_body(&want)
            } else {
                let have = self.have.clone().unwrap_or_default();
                protocol::pull_body(&want, &have)
            };
            self.fetch_pack(&mut transport, &body)?;
            self.resolve_deltas()?;
            self.save_objects()?;
        }

        Ok(())
    }

    /// POSTs one fetch body and unpacks the returned pack.
    fn fetch_pack(&mut self, transport: &mut Transport, body: &str) -> Result<(), GitupError> {
        let request = protocol::upload_pack_request(&self.config, body);
        let response = transport.exchange(request.as_bytes())?;
        let pack_data = protocol::extract_pack(&response)?;
        pack::verify_trailer(&pack_data)?;

        if self.config.keep_pack {
            let name = self.pack_file_name();
            fs::write(&name, &pack_data)?;
        }

        self.unpack(&pack_data)
    }

    fn pack_file_name(&self) -> String {
        format!(
            "{}-{}.pack",
            self.config.section,
            self.want.as_deref().unwrap_or_default()
        )
    }

    /// Unpacks a verified pack buffer, spilling payloads in low-memory
    /// mode.
    fn unpack(&mut self, pack_data: &[u8]) -> Result<(), GitupError> {
        self.store.set_verbose(self.config.verbosity > 1);
        if self.config.low_memory {
            let scratch = self.scratch_path();
            self.store.begin_spill(&scratch)?;
            pack::unpack(&mut self.store, pack_data)?;
            self.store.finish_spill(&scratch)?;
        } else {
            pack::unpack(&mut self.store, pack_data)?;
        }
        Ok(())
    }

    fn scratch_path(&self) -> PathBuf {
        let mut path = self.manifest_path.as_os_str().to_owned();
        path.push(".tmp");
        PathBuf::from(path)
    }

    fn resolve_deltas(&mut self) -> Result<(), GitupError> {
        let mut provider = LocalSource {
            local_by_path: &self.local_by_path,
            local_by_hash: &self.local_by_hash,
        };
        delta::resolve_deltas(&mut self.store, &mut provider)?;
        Ok(())
    }

    /// Walks the wanted commit, stages the new manifest, writes queued
    /// files, and commits the manifest.
    fn save_objects(&mut self) -> Result<(), GitupError> {
        let want_hex = self.want.clone().unwrap_or_default();
        let want_id = ObjectId::from_hex_str(&want_hex)?;
        let target = self.config.target_directory.clone();

        let mut writer = ManifestWriter::create(&self.manifest_path, &want_hex)?;
        let mut walker = Walker {
            store: &mut self.store,
            local_by_path: &mut self.local_by_path,
            local_by_hash: &self.local_by_hash,
            remote_by_path: &mut self.remote_by_path,
            display: &mut self.display,
        };
        walker.walk_commit(&want_id, &target, &mut writer)?;
        walker.materialize(&mut self.updating)?;
        writer.commit()?;
        Ok(())
    }

    /// Repair materialization; the manifest is deliberately untouched.
    fn save_repairs(&mut self) -> Result<(), GitupError> {
        let mut walker = Walker {
            store: &mut self.store,
            local_by_path: &mut self.local_by_path,
            local_by_hash: &self.local_by_hash,
            remote_by_path: &mut self.remote_by_path,
            display: &mut self.display,
        };
        walker.save_repairs(&mut self.updating)?;
        Ok(())
    }

    /// Writes `.gituprevision` (`<branch-or-tag>:<first-9-of-want>`).
    fn write_revision_stamp(&mut self) -> Result<(), GitupError> {
        let Some(want) = &self.want else { return Ok(()) };
        let label = self.config.tag.as_deref().unwrap_or(&self.branch);
        let stamp = format!("{label}:{}\n", &want[..want.len().min(9)]);
        let path = format!("{}/.gituprevision", self.config.target_directory);

        let mut quiet = ChangeDisplay::new(0, 0);
        walker::save_file(&path, 0o644, stamp.as_bytes(), &mut quiet)
            .map_err(GitupError::Walk)?;
        Ok(())
    }

    /// Removes local files and directories the remote tree no longer
    /// contains.
    fn delete_orphans(&mut self) -> Result<(), GitupError> {
        let target = self.config.target_directory.clone();
        let doomed: Vec<(String, u32)> = self
            .local_by_path
            .iter()
            .filter(|(_, node)| !node.keep)
            .map(|(path, node)| (path.clone(), node.mode))
            .collect();

        for (path, mode) in doomed {
            // An unchanged tree deletes nothing unless it was repaired.
            if self.current && !self.repair {
                continue;
            }
            if scanner::is_ignored(&self.config.ignores, &path) {
                continue;
            }

            if self.verbose() && self.display.depth == 0 {
                println!(" - {path}");
            }

            if mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                let (display_path, just_added) = self.display.trim(&path);
                if self.verbose()
                    && self.display.depth > 0
                    && just_added
                    && display_path.len() == path.len()
                {
                    println!(" - {display_path}");
                }
                walker::prune_tree(&target, &path).map_err(GitupError::Walk)?;
            } else {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(_) => eprintln!(" ! cannot remove {path}"),
                }
            }
        }
        Ok(())
    }

    /// Final notices.
    fn finish(&self) {
        if self.verbose() && !self.updating.is_empty() {
            eprintln!("#");
            eprintln!("# Please review the following file(s) for important changes.");
            for path in &self.updating {
                eprintln!("#\t{path}");
            }
            eprintln!("#");
        }
        if self.repair {
            eprintln!(
                "# The local repository has been repaired.  \
                 Please rerun gitup to pull the latest commit."
            );
        }
        if self.verbose() {
            eprintln!("# Done.");
        }
    }
}
