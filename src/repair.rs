//! Repair planning.
//!
//! Compares the manifest's view of the tree against what the scanner
//! found on disk. A node is defective when it is missing locally, or
//! present with a different content hash and not covered by an ignore
//! prefix. The defect set drives a targeted multi-want fetch; an empty
//! set makes repair a no-op.

use crate::file_node::PathMap;
use crate::object_id::ObjectId;
use crate::scanner::is_ignored;

/// Defects found between the manifest and the local tree.
#[derive(Debug, Default)]
pub struct RepairPlan {
    /// Wanted object hashes with the paths that need them.
    pub defects: Vec<(ObjectId, String)>,
}

impl RepairPlan {
    /// True when nothing needs repair.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defects.is_empty()
    }

    /// Size in bytes of the want block this plan expands to, one
    /// pkt-line per defect.
    #[must_use]
    pub fn want_bytes(&self) -> usize {
        // "0032want <40-hex>\n" is 50 bytes per defect.
        self.defects.len() * 50
    }
}

/// Computes the defect set.
///
/// At verbosity 1 and above each defect is reported to stderr.
#[must_use]
pub fn plan_repairs(
    remote_by_path: &PathMap,
    local_by_path: &PathMap,
    ignores: &[String],
    verbosity: u8,
) -> RepairPlan {
    let mut plan = RepairPlan::default();

    for (path, remote) in remote_by_path {
        let Some(id) = remote.id else { continue };
        let local = local_by_path.get(path);

        let defective = match local {
            None => true,
            Some(local) => local.id != Some(id) && !is_ignored(ignores, path),
        };
        if !defective {
            continue;
        }

        if verbosity > 0 {
            let state = if local.is_some() {
                "has been modified."
            } else {
                "is missing."
            };
            eprintln!(" ! {path} {state}");
        }
        plan.defects.push((id, path.clone()));
    }

    plan
}
