//! ``src/download.rs``
//! ============================================================================
//! # Download Initiator: Subtree to Bundle Request
//!
//! Flattens a target directory into a list of `(relative path, size, hash)`
//! entries, skipping files that are already queued or finished (per-file
//! filter, never per-directory), and hands the list to the queue
//! collaborator as one atomic bundle request.
//!
//! Per-file problems are recorded in the summary and do not abort sibling
//! processing. An all-filtered subtree produces no bundle request at all:
//! `create_bundle` is only invoked for a non-empty file set.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ListingError;
use crate::model::tree::{ContentHash, DirPtr};
use crate::services::{QueueService, QueueToken};

/// Download priority carried through to the queue collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Paused,
    Lowest,
    Low,
    #[default]
    Default,
    Normal,
    High,
    Highest,
}

/// One file of a bundle request: path relative to the bundle target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFileInfo {
    pub file: String,
    pub size: u64,
    pub hash: ContentHash,
}

/// Caller-visible outcome of one subtree walk.
#[derive(Debug, Default, Clone)]
pub struct DownloadSummary {
    pub collected: usize,
    pub skipped_queued: usize,

    /// Per-file failures: (relative path, reason).
    pub failed: Vec<(String, String)>,
}

/// Walk `dir` collecting bundle files. ADLS groupings and ADL-origin copies
/// are excluded; their real counterparts are walked where they live.
#[must_use]
pub fn collect_bundle_files(dir: &DirPtr) -> (Vec<BundleFileInfo>, DownloadSummary) {
    let mut files = Vec::new();
    let mut summary = DownloadSummary::default();
    collect_walk(dir, "", &mut files, &mut summary);
    (files, summary)
}

fn collect_walk(
    dir: &DirPtr,
    prefix: &str,
    files: &mut Vec<BundleFileInfo>,
    summary: &mut DownloadSummary,
) {
    let guard = dir.read();

    for f in &guard.files {
        if f.adls {
            continue;
        }

        let rel_path = format!("{prefix}{}", f.name);

        if f.is_queued() {
            summary.skipped_queued += 1;
            continue;
        }

        if f.hash.as_str().is_empty() {
            // Continue-on-error at file granularity.
            warn!(file = %rel_path, "Skipping file without content hash");
            summary
                .failed
                .push((rel_path, String::from("missing content hash")));
            continue;
        }

        files.push(BundleFileInfo {
            file: rel_path,
            size: f.size,
            hash: f.hash.clone(),
        });
        summary.collected += 1;
    }

    for d in &guard.dirs {
        let child = d.read();
        if child.is_adls() {
            continue;
        }
        let child_prefix = format!("{prefix}{}/", child.name);
        drop(child);

        collect_walk(d, &child_prefix, files, summary);
    }
}

/// Flatten `dir` and submit one atomic bundle request. Returns the queue
/// token when a bundle was created, `None` when everything was filtered out
/// (no request is made in that case).
pub async fn download_directory(
    queue: &dyn QueueService,
    dir: &DirPtr,
    target: &str,
    priority: Priority,
    auto_search: Option<u64>,
) -> Result<(Option<QueueToken>, DownloadSummary), ListingError> {
    let (files, summary) = collect_bundle_files(dir);

    if files.is_empty() {
        debug!(target, "Every file already queued or finished, no bundle request");
        return Ok((None, summary));
    }

    debug!(target, files = files.len(), "Requesting bundle creation");
    let token = queue
        .create_bundle(target, files, priority, auto_search)
        .await?;

    Ok((Some(token), summary))
}
