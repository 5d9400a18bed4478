//! Error types for the sync stages.
//!
//! Errors are stage-specific to keep diagnostics precise: configuration,
//! transport, protocol, local scanning, tree walking, and the object store
//! each have their own enum, and the pack and delta modules define their
//! wire-format errors next to the parsers. [`GitupError`] aggregates the
//! stages for the binary's single fatal-exit path.
//!
//! Every error is fatal to the process; there is no local recovery except
//! the quarterly-branch retry inside ref resolution.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::delta::DeltaError;
use crate::object_id::CorruptHash;
use crate::pack::PackError;

/// Errors from configuration loading and validation.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(PathBuf, io::Error),
    /// The configuration file is not a regular file.
    NotAFile(PathBuf),
    /// TOML syntax or type error.
    Parse(toml::de::Error),
    /// No section on the command line matched the configuration.
    UnknownSection {
        /// Sections present in the configuration file.
        known: Vec<String>,
    },
    /// A mandatory key is absent from the selected section.
    MissingKey { section: String, key: &'static str },
    /// A proxy environment variable could not be parsed.
    MalformedProxy(String),
    /// `-t` and `-w` were both given.
    TagAndWantConflict,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, err) => write!(f, "cannot load {}: {err}", path.display()),
            Self::NotAFile(path) => write!(f, "cannot load {}", path.display()),
            Self::Parse(err) => write!(f, "configuration parse error: {err}"),
            Self::UnknownSection { known } => {
                write!(
                    f,
                    "cannot find a matching section in the command line arguments; \
                     these are the configured sections:"
                )?;
                for section in known {
                    write!(f, "\n\t * {section}")?;
                }
                Ok(())
            }
            Self::MissingKey { section, key } => write!(f, "no {key} found in [{section}]"),
            Self::MalformedProxy(value) => write!(f, "malformed proxy host/port {value}"),
            Self::TagAndWantConflict => {
                write!(f, "a tag and a want cannot both be requested")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(_, err) => Some(err),
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors from the TCP/TLS/HTTP transport.
#[derive(Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// DNS resolution produced no usable address.
    Resolve { host: String, source: io::Error },
    /// TCP connect failed for every resolved address.
    Connect { host: String, source: io::Error },
    /// Read or write failure on the established stream.
    Io(io::Error),
    /// TLS setup or handshake failure.
    Tls(native_tls::Error),
    /// The server answered with a non-success status code.
    Http { code: u32 },
    /// The proxy refused the CONNECT request.
    ProxyRefused { code: u32 },
    /// Chunked transfer encoding could not be decoded.
    MalformedChunking,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve { host, source } => write!(f, "cannot resolve {host}: {source}"),
            Self::Connect { host, source } => write!(f, "connect failure to {host}: {source}"),
            Self::Io(err) => write!(f, "transport failure: {err}"),
            Self::Tls(err) => write!(f, "TLS failure: {err}"),
            Self::Http { code } => write!(f, "HTTP error {code}"),
            Self::ProxyRefused { code } => write!(f, "proxy CONNECT refused with {code}"),
            Self::MalformedChunking => write!(f, "malformed chunked transfer encoding"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resolve { source, .. } | Self::Connect { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            Self::Tls(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<native_tls::Error> for TransportError {
    fn from(err: native_tls::Error) -> Self {
        Self::Tls(err)
    }
}

/// Errors from the v2 protocol driver.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The server does not speak protocol version 2.
    UnsupportedProtocol { host: String },
    /// The requested branch, tag, or commit could not be resolved.
    RefNotFound { reference: String },
    /// The fetch response did not contain recognizable pack data.
    MalformedPackData,
    /// The repair want list exceeds the request size ceiling.
    TooManyRepairs { size: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedProtocol { host } => {
                write!(f, "{host} does not support the version 2 wire protocol")
            }
            Self::RefNotFound { reference } => write!(f, "{reference} doesn't exist"),
            Self::MalformedPackData => write!(f, "malformed pack data"),
            Self::TooManyRepairs { size } => write!(
                f,
                "there are too many files to repair ({size} bytes of wants) -- \
                 please re-clone the repository"
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors from the local tree scanner.
#[derive(Debug)]
#[non_exhaustive]
pub enum ScanError {
    /// A `.git` directory exists inside the target tree.
    CoexistenceRefused { path: PathBuf },
    /// Filesystem failure while scanning or reading.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CoexistenceRefused { path } => write!(
                f,
                "a .git directory was found at {} -- gitup does not update this \
                 directory, which will cause problems for the official Git client; \
                 please remove it and rerun",
                path.display()
            ),
            Self::Io { path, source } => write!(f, "cannot read {}: {source}", path.display()),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::CoexistenceRefused { .. } => None,
        }
    }
}

/// Errors from the object store.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Spill file I/O failure.
    Io(io::Error),
    /// An object's buffer was requested but no backing copy exists.
    BufferUnavailable { index: usize },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "object store I/O failure: {err}"),
            Self::BufferUnavailable { index } => {
                write!(f, "object {index} has no backing buffer")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::BufferUnavailable { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors from the tree walk, materialization, and deletion passes.
#[derive(Debug)]
#[non_exhaustive]
pub enum WalkError {
    /// The want does not name a commit object in the store.
    NotACommit { id: String },
    /// A tree object referenced by the walk is absent.
    MissingTree { id: String, path: String },
    /// A tree object's entry bytes could not be parsed.
    MalformedTree { path: String },
    /// A blob referenced by the walk is absent from the store and the
    /// local tree.
    MissingObject { id: String, path: String },
    /// A deletion target lies outside the configured target directory.
    PathEscape { path: String },
    /// Filesystem failure while writing or removing.
    Io { path: String, source: io::Error },
    /// Object store failure while loading buffers.
    Store(StoreError),
    /// Local scan failure while loading a fallback object.
    Scan(ScanError),
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotACommit { id } => write!(f, "first object {id} is not a commit"),
            Self::MissingTree { id, path } => {
                write!(f, "tree {path} -- {id} cannot be found")
            }
            Self::MalformedTree { path } => write!(f, "malformed tree object for {path}"),
            Self::MissingObject { id, path } => {
                write!(f, "file {path} -- {id} cannot be found")
            }
            Self::PathEscape { path } => write!(f, "illegal path traverse in {path}"),
            Self::Io { path, source } => write!(f, "cannot write {path}: {source}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Scan(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WalkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Store(err) => Some(err),
            Self::Scan(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for WalkError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<ScanError> for WalkError {
    fn from(err: ScanError) -> Self {
        Self::Scan(err)
    }
}

/// Aggregate error for the binary's fatal-exit path.
#[derive(Debug)]
#[non_exhaustive]
pub enum GitupError {
    Config(ConfigError),
    Transport(TransportError),
    Protocol(ProtocolError),
    Pack(PackError),
    Delta(DeltaError),
    Scan(ScanError),
    Store(StoreError),
    Walk(WalkError),
    Hash(CorruptHash),
    Io(io::Error),
}

impl fmt::Display for GitupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Transport(err) => write!(f, "{err}"),
            Self::Protocol(err) => write!(f, "{err}"),
            Self::Pack(err) => write!(f, "{err}"),
            Self::Delta(err) => write!(f, "{err}"),
            Self::Scan(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Walk(err) => write!(f, "{err}"),
            Self::Hash(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for GitupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Transport(err) => Some(err),
            Self::Protocol(err) => Some(err),
            Self::Pack(err) => Some(err),
            Self::Delta(err) => Some(err),
            Self::Scan(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Walk(err) => Some(err),
            Self::Hash(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

macro_rules! from_stage {
    ($variant:ident, $err:ty) => {
        impl From<$err> for GitupError {
            fn from(err: $err) -> Self {
                Self::$variant(err)
            }
        }
    };
}

from_stage!(Config, ConfigError);
from_stage!(Transport, TransportError);
from_stage!(Protocol, ProtocolError);
from_stage!(Pack, PackError);
from_stage!(Delta, DeltaError);
from_stage!(Scan, ScanError);
from_stage!(Store, StoreError);
from_stage!(Walk, WalkError);
from_stage!(Hash, CorruptHash);
from_stage!(Io, io::Error);
