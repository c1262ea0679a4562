//! ``src/loader.rs``
//! ============================================================================
//! # List Loader: Full Loads and Incremental Merges
//!
//! Parses an already-received listing payload into tree nodes. Payloads are
//! JSON documents describing one branch of the peer's share:
//!
//! ```json
//! {
//!   "base": "/",
//!   "complete": true,
//!   "directories": [
//!     { "name": "Music", "complete": true,
//!       "files": [ { "name": "a.mp3", "size": 100, "tth": "H1" } ] }
//!   ],
//!   "files": []
//! }
//! ```
//!
//! A directory entry without listed children and `complete = false` becomes
//! `IncompleteNochild`; with listed children it becomes `IncompleteChild`.
//!
//! Parsing completes before any tree mutation, so a malformed payload fails
//! the call with `ListingError::Parse` and leaves branches committed by
//! earlier calls untouched. Abort checkpoints sit between directories; a
//! close() mid-load stops after the last fully committed directory.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ListingError;
use crate::model::dupe::DupeStatus;
use crate::model::tree::{
    ContentHash, DirPtr, DirType, Directory, FileEntry, TokenSource, find_child,
};
use crate::services::ShareService;

/// Maps loaded base dirs by their full lowercase path, with a visited flag
/// used to prune branches absent from a refreshed payload.
pub type DirMap = HashMap<String, (DirPtr, bool)>;

const fn default_true() -> bool {
    true
}

fn default_base() -> String {
    String::from("/")
}

/// One file in a listing payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    pub name: String,
    pub size: u64,
    pub tth: String,

    #[serde(default)]
    pub date: i64,
}

/// One directory in a listing payload. Children are optional: a partial
/// list may claim a directory exists without listing its contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryPayload {
    pub name: String,

    #[serde(default = "default_true")]
    pub complete: bool,

    /// Bytes claimed for an incomplete branch.
    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub date: i64,

    #[serde(default)]
    pub directories: Option<Vec<DirectoryPayload>>,

    #[serde(default)]
    pub files: Option<Vec<FilePayload>>,
}

impl DirectoryPayload {
    const fn children_listed(&self) -> bool {
        self.directories.is_some() || self.files.is_some()
    }

    const fn dir_type(&self) -> DirType {
        if self.complete {
            DirType::Normal
        } else if self.children_listed() {
            DirType::IncompleteChild
        } else {
            DirType::IncompleteNochild
        }
    }
}

/// Top-level listing payload covering the branch rooted at `base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPayload {
    #[serde(default = "default_base")]
    pub base: String,

    #[serde(default = "default_true")]
    pub complete: bool,

    #[serde(default)]
    pub directories: Option<Vec<DirectoryPayload>>,

    #[serde(default)]
    pub files: Option<Vec<FilePayload>>,
}

impl ListingPayload {
    /// Parse a raw payload. No tree state is touched here.
    pub fn parse(text: &str) -> Result<Self, ListingError> {
        serde_json::from_str(text).map_err(|e| ListingError::parse(e.to_string()))
    }
}

/// Stateless loader over the collaborators a load needs. One instance is
/// built per dispatched load task.
pub struct ListLoader<'a> {
    pub share: &'a dyn ShareService,
    pub tokens: &'a TokenSource,
    pub abort: CancellationToken,

    /// Update timestamp stamped on every touched directory.
    pub list_date: i64,
}

impl ListLoader<'_> {
    /// Full load: parse the whole payload and rebuild the branch at the
    /// payload's base (usually the root). Returns the directory count.
    pub fn load_full(
        &self,
        root: &DirPtr,
        base_dirs: &mut DirMap,
        text: &str,
    ) -> Result<usize, ListingError> {
        let payload = ListingPayload::parse(text)?;

        debug!(base = %payload.base, "Full list load");

        root.write().clear_all();
        base_dirs.clear();
        base_dirs.insert(String::from("/"), (DirPtr::clone(root), true));

        let (base_dir, base_path) = self.ensure_base(root, &payload.base, base_dirs)?;

        let mut loaded = 0usize;
        self.fill_directory(&base_dir, &base_path, &payload, base_dirs, false, &mut loaded)?;

        {
            let mut guard = base_dir.write();
            if payload.complete {
                guard.set_complete();
            } else {
                guard.set_dir_type(DirType::IncompleteChild);
            }
            guard.update_date = self.list_date;
        }
        if payload.complete {
            root.write().set_complete();
        }

        Ok(loaded)
    }

    /// Partial/incremental load: merge the payload into the existing tree
    /// under `base`. Directories already present (case-insensitive path
    /// match) are updated rather than duplicated; once the pass completes,
    /// previously loaded child dirs under the same base that it did not
    /// revisit are removed from the live view. An aborted pass keeps every
    /// committed directory and prunes nothing. Returns the count of
    /// directories loaded or merged.
    pub fn merge_partial(
        &self,
        root: &DirPtr,
        base_dirs: &mut DirMap,
        text: &str,
        base: &str,
    ) -> Result<usize, ListingError> {
        let payload = ListingPayload::parse(text)?;

        let base_key = normalize_path(base);
        debug!(base = %base_key, "Partial list merge");

        // Everything previously loaded under this base starts unvisited.
        for (key, entry) in base_dirs.iter_mut() {
            if key.starts_with(&base_key) {
                entry.1 = false;
            }
        }

        let (base_dir, base_path) = self.ensure_base(root, base, base_dirs)?;

        let mut loaded = 0usize;
        if let Err(e) =
            self.fill_directory(&base_dir, &base_path, &payload, base_dirs, true, &mut loaded)
        {
            // An interrupted pass never reaches every directory the payload
            // would have revisited, so nothing may be pruned. Visited flags
            // go back to normal for later merges.
            for (key, entry) in base_dirs.iter_mut() {
                if key.starts_with(&base_key) {
                    entry.1 = true;
                }
            }
            return Err(e);
        }

        self.prune_unvisited(&base_key, base_dirs);

        {
            let mut guard = base_dir.write();
            if payload.complete {
                guard.set_complete();
            } else if guard.dir_type() != DirType::Adls {
                guard.set_dir_type(DirType::IncompleteChild);
            }
            guard.update_date = self.list_date;
            guard.loading = false;
        }

        Ok(loaded)
    }

    /// Walk (and create where missing) the directories along `base`,
    /// registering each in the DirMap. Returns the base node and its
    /// normalized path.
    fn ensure_base(
        &self,
        root: &DirPtr,
        base: &str,
        base_dirs: &mut DirMap,
    ) -> Result<(DirPtr, String), ListingError> {
        let mut cursor = DirPtr::clone(root);
        let mut path = String::from("/");

        for segment in base.split('/').filter(|s| !s.is_empty()) {
            self.checkpoint()?;

            let child = match find_child(&cursor, segment) {
                Some(existing) => existing,
                None => Directory::attach(
                    &cursor,
                    segment.to_string(),
                    DirType::IncompleteChild,
                    self.list_date,
                    self.tokens,
                ),
            };

            path.push_str(&child.read().name);
            path.push('/');
            base_dirs.insert(path.to_lowercase(), (DirPtr::clone(&child), true));
            cursor = child;
        }

        Ok((cursor, path))
    }

    /// Commit one payload level into `dir`, then recurse. When `updating`,
    /// existing directories are merged by case-insensitive name instead of
    /// duplicated, and a listed file set replaces the previous one.
    fn fill_directory(
        &self,
        dir: &DirPtr,
        path: &str,
        payload: &ListingPayload,
        base_dirs: &mut DirMap,
        updating: bool,
        loaded: &mut usize,
    ) -> Result<(), ListingError> {
        if let Some(files) = payload.files.as_deref() {
            self.set_files(dir, files);
        }

        if let Some(dirs) = payload.directories.as_deref() {
            self.fill_children(dir, path, dirs, base_dirs, updating, loaded)?;
        }

        Ok(())
    }

    fn fill_children(
        &self,
        dir: &DirPtr,
        path: &str,
        children: &[DirectoryPayload],
        base_dirs: &mut DirMap,
        updating: bool,
        loaded: &mut usize,
    ) -> Result<(), ListingError> {
        for entry in children {
            self.checkpoint()?;

            let existing = if updating {
                find_child(dir, &entry.name)
            } else {
                None
            };

            let node = match existing {
                Some(node) => {
                    let mut guard = node.write();
                    guard.set_dir_type(entry.dir_type());
                    guard.partial_size = if entry.complete { 0 } else { entry.size };
                    guard.remote_date = entry.date;
                    guard.update_date = self.list_date;
                    drop(guard);
                    node
                }
                None => {
                    let node = Directory::attach(
                        dir,
                        entry.name.clone(),
                        entry.dir_type(),
                        self.list_date,
                        self.tokens,
                    );
                    {
                        let mut guard = node.write();
                        guard.partial_size = if entry.complete { 0 } else { entry.size };
                        guard.remote_date = entry.date;
                    }
                    node
                }
            };

            *loaded += 1;

            let child_path = format!("{path}{}/", entry.name);
            base_dirs.insert(child_path.to_lowercase(), (DirPtr::clone(&node), true));
            trace!(path = %child_path, "Directory committed");

            if let Some(files) = entry.files.as_deref() {
                self.set_files(&node, files);
            }

            if let Some(dirs) = entry.directories.as_deref() {
                self.fill_children(&node, &child_path, dirs, base_dirs, updating, loaded)?;
            }
        }

        Ok(())
    }

    /// Replace the direct file set of `dir` with the payload's files,
    /// resolving dupe status against the share.
    fn set_files(&self, dir: &DirPtr, files: &[FilePayload]) {
        let mut parsed = Vec::with_capacity(files.len());
        for f in files {
            let hash = ContentHash::new(f.tth.clone());
            let dupe: DupeStatus = self.share.is_dupe_of(&hash);
            parsed.push(FileEntry::new(
                dir,
                f.name.clone(),
                f.size,
                hash,
                dupe,
                f.date,
                self.tokens.next(),
            ));
        }

        dir.write().files = parsed;
    }

    /// Detach every directory under `base_key` that this merge pass did not
    /// revisit. Externally held handles keep the subtree alive.
    fn prune_unvisited(&self, base_key: &str, base_dirs: &mut DirMap) {
        let stale: Vec<String> = base_dirs
            .iter()
            .filter(|(key, (_, visited))| {
                !visited && key.as_str() != base_key && key.starts_with(base_key)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            if let Some((dir, _)) = base_dirs.remove(&key) {
                debug!(path = %key, "Pruning directory absent from refreshed payload");
                detach_from_parent(&dir);
            }
        }
    }

    fn checkpoint(&self) -> Result<(), ListingError> {
        if self.abort.is_cancelled() {
            return Err(ListingError::Aborted);
        }
        Ok(())
    }
}

/// Lowercased, `/`-wrapped path key for DirMap lookups.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut key = String::from("/");
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        key.push_str(&segment.to_lowercase());
        key.push('/');
    }
    key
}

fn detach_from_parent(dir: &DirPtr) {
    let (token, parent) = {
        let guard = dir.read();
        (guard.token(), guard.parent_ptr())
    };

    if let Some(parent) = parent {
        parent.write().dirs.retain(|d| d.read().token() != token);
    }
}
