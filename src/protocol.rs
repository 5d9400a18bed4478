//! Git v2 smart-HTTP protocol driver.
//!
//! Builds the two requests the protocol needs (`GET .../info/refs` for
//! discovery, `POST .../git-upload-pack` for everything else), frames
//! command bodies as pkt-lines, resolves the wanted commit from the
//! ls-refs response, and extracts raw pack bytes from the band-framed
//! fetch response.
//!
//! # Fetch variants
//! | run    | packets besides command/done/flush |
//! |--------|------------------------------------|
//! | clone  | `no-progress`, `ofs-delta`, `shallow <want>`, `want <want>` |
//! | pull   | `thin-pack`, `no-progress`, `ofs-delta`, `shallow <want>`, `shallow <have>`, `deepen 1`, `want <want>`, `have <have>` |
//! | repair | `thin-pack`, `no-progress`, `ofs-delta`, one `want` per defect, `deepen 1` |

use chrono::{Datelike, NaiveDate};
use memchr::memmem;

use crate::config::Config;
use crate::errors::ProtocolError;
use crate::repair::RepairPlan;

/// Version advertised in `User-Agent`.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// pkt-line flush packet.
pub const FLUSH: &str = "0000";

/// pkt-line delimiter packet.
pub const DELIM: &str = "0001";

/// Repair want-block ceiling: 3200 KiB of pkt-lines.
const REPAIR_WANT_CEILING: usize = 3_276_800;

/// Frames one pkt-line: 4-hex length prefix covering itself.
#[must_use]
pub fn pkt_line(payload: &str) -> String {
    format!("{:04x}{payload}", payload.len() + 4)
}

/// The discovery request: `GET <repo>/info/refs?service=git-upload-pack`.
#[must_use]
pub fn refs_discovery_request(config: &Config) -> String {
    format!(
        "GET {repo}/info/refs?service=git-upload-pack HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         User-Agent: gitup/{VERSION}\r\n\
         Git-Protocol: version=2\r\n\
         \r\n",
        repo = config.repository_path,
        host = config.host_bracketed,
        port = config.port
    )
}

/// A `POST <repo>/git-upload-pack` request around a pkt-line body.
#[must_use]
pub fn upload_pack_request(config: &Config, body: &str) -> String {
    format!(
        "POST {repo}/git-upload-pack HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         User-Agent: gitup/{VERSION}\r\n\
         Accept-encoding: deflate, gzip\r\n\
         Content-type: application/x-git-upload-pack-request\r\n\
         Accept: application/x-git-upload-pack-result\r\n\
         Git-Protocol: version=2\r\n\
         Content-length: {length}\r\n\
         \r\n\
         {body}",
        repo = config.repository_path,
        host = config.host_bracketed,
        port = config.port,
        length = body.len()
    )
}

/// Requires the discovery response to advertise protocol version 2.
///
/// # Errors
/// `UnsupportedProtocol` naming the host.
pub fn verify_version_two(response: &[u8], host: &str) -> Result<(), ProtocolError> {
    if memmem::find(response, b"version 2").is_none() {
        return Err(ProtocolError::UnsupportedProtocol {
            host: host.to_string(),
        });
    }
    Ok(())
}

/// The `ls-refs` command body.
#[must_use]
pub fn ls_refs_body() -> String {
    let mut body = String::new();
    body.push_str(&pkt_line("command=ls-refs\n"));
    body.push_str(&pkt_line("object-format=sha1"));
    body.push_str(DELIM);
    body.push_str(&pkt_line("peel\n"));
    body.push_str(&pkt_line("symrefs\n"));
    body.push_str(&pkt_line("ref-prefix HEAD\n"));
    body.push_str(&pkt_line("ref-prefix refs/heads/\n"));
    body.push_str(&pkt_line("ref-prefix refs/tags/\n"));
    body.push_str(FLUSH);
    body
}

/// Outcome of want resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedWant {
    /// 40-hex commit hash to fetch.
    pub want: String,
    /// Branch name for display and the revision stamp; `(detached)` for
    /// explicit wants, the substituted `<year>Q<quarter>` name for the
    /// quarterly branch.
    pub branch: String,
}

/// Resolves the user's selection against the ls-refs response text.
///
/// Tags prefer the `peeled:` annotation; the special branch name
/// `quarterly` substitutes the current calendar quarter and falls back
/// to the previous quarter exactly once.
///
/// # Errors
/// `RefNotFound` when two passes fail to produce a 40-hex hash.
pub fn resolve_want(
    refs: &str,
    branch: &str,
    tag: Option<&str>,
    explicit_want: Option<&str>,
    today: NaiveDate,
) -> Result<ResolvedWant, ProtocolError> {
    if let Some(want) = explicit_want {
        // History cannot be searched, so an explicit want detaches.
        return Ok(ResolvedWant {
            want: want.to_string(),
            branch: "(detached)".to_string(),
        });
    }

    let quarterly = branch.starts_with("quarterly");
    let mut reference = String::new();

    for fallback in [false, true] {
        reference = if quarterly {
            format!(" refs/heads/{}", quarter_branch(today, fallback))
        } else if let Some(tag) = tag {
            format!(" refs/tags/{tag}")
        } else {
            format!(" refs/heads/{branch}")
        };

        if let Some(want) = search_ref(refs, &reference) {
            let branch = if quarterly {
                reference[" refs/heads/".len()..].to_string()
            } else {
                branch.to_string()
            };
            return Ok(ResolvedWant { want, branch });
        }
    }

    Err(ProtocolError::RefNotFound {
        reference: reference.trim_start().to_string(),
    })
}

/// Finds the hash for one reference: the 40 characters following a
/// `peeled:` annotation, else the 40 characters preceding the ref name.
fn search_ref(refs: &str, reference: &str) -> Option<String> {
    let peeled = format!("{reference} peeled:");
    if let Some(at) = refs.find(&peeled) {
        let start = at + peeled.len();
        let hash = refs.get(start..start + 40)?;
        return Some(hash.to_string());
    }
    if let Some(at) = refs.find(reference) {
        if at >= 40 {
            return Some(refs[at - 40..at].to_string());
        }
    }
    None
}

/// Computes the `<year>Q<quarter>` branch name, optionally stepping back
/// one quarter (wrapping the year in Q1).
fn quarter_branch(today: NaiveDate, fallback: bool) -> String {
    let month0 = today.month0();
    let year = today.year() - i32::from(fallback && month0 < 3);
    let quarter = (month0 / 3 + if fallback { 3 } else { 0 }) % 4 + 1;
    format!("{year:04}Q{quarter}")
}

/// Fetch body for a shallow clone.
#[must_use]
pub fn clone_body(want: &str) -> String {
    let mut body = String::new();
    body.push_str(&pkt_line("command=fetch"));
    body.push_str(DELIM);
    body.push_str(&pkt_line("no-progress"));
    body.push_str(&pkt_line("ofs-delta"));
    body.push_str(&pkt_line(&format!("shallow {want}")));
    body.push_str(&pkt_line(&format!("want {want}\n")));
    body.push_str(&pkt_line("done\n"));
    body.push_str(FLUSH);
    body
}

/// Fetch body for an incremental pull.
#[must_use]
pub fn pull_body(want: &str, have: &str) -> String {
    let mut body = String::new();
    body.push_str(&pkt_line("command=fetch"));
    body.push_str(DELIM);
    body.push_str(&pkt_line("thin-pack"));
    body.push_str(&pkt_line("no-progress"));
    body.push_str(&pkt_line("ofs-delta"));
    body.push_str(&pkt_line(&format!("shallow {want}")));
    body.push_str(&pkt_line(&format!("shallow {have}")));
    body.push_str(&pkt_line("deepen 1"));
    body.push_str(&pkt_line(&format!("want {want}\n")));
    body.push_str(&pkt_line(&format!("have {have}\n")));
    body.push_str(&pkt_line("done\n"));
    body.push_str(FLUSH);
    body
}

/// Fetch body for a targeted repair: one want per defective path.
///
/// # Errors
/// `TooManyRepairs` when the want block exceeds the request ceiling.
pub fn repair_body(plan: &RepairPlan) -> Result<String, ProtocolError> {
    let want_bytes = plan.want_bytes();
    if want_bytes > REPAIR_WANT_CEILING {
        return Err(ProtocolError::TooManyRepairs { size: want_bytes });
    }

    let mut body = String::new();
    body.push_str(&pkt_line("command=fetch"));
    body.push_str(DELIM);
    body.push_str(&pkt_line("thin-pack"));
    body.push_str(&pkt_line("no-progress"));
    body.push_str(&pkt_line("ofs-delta"));
    for (id, _) in &plan.defects {
        body.push_str(&pkt_line(&format!("want {id}\n")));
    }
    body.push_str(&pkt_line("deepen 1"));
    body.push_str(&pkt_line("done\n"));
    body.push_str(FLUSH);
    Ok(body)
}

/// Extracts raw pack bytes from a fetch response body.
///
/// Locates the `PACK` magic, backs up over the 5-byte band marker that
/// precedes it, and then strips the `<4-hex length><band>` marker from
/// every following chunk, concatenating band-1 payloads. The returned
/// buffer still carries the trailing SHA-1, which the caller verifies.
///
/// # Errors
/// `MalformedPackData` when no pack or inconsistent framing is found.
pub fn extract_pack(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let pack_at = memmem::find(body, b"PACK").ok_or(ProtocolError::MalformedPackData)?;
    if pack_at < 5 {
        return Err(ProtocolError::MalformedPackData);
    }

    let mut out = Vec::with_capacity(body.len() - pack_at);
    let mut cursor = pack_at - 5;
    while cursor + 5 <= body.len() {
        let length = parse_hex4(&body[cursor..cursor + 4])?;
        if length == 0 {
            break;
        }
        if length < 5 || cursor + length > body.len() {
            return Err(ProtocolError::MalformedPackData);
        }
        // Band 1 is pack data; progress and error bands are dropped.
        if body[cursor + 4] == 1 {
            out.extend_from_slice(&body[cursor + 5..cursor + length]);
        }
        cursor += length;
    }
    Ok(out)
}

fn parse_hex4(data: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::MalformedPackData)?;
    usize::from_str_radix(text, 16).map_err(|_| ProtocolError::MalformedPackData)
}
