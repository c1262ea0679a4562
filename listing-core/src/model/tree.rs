//! ``src/model/tree.rs``
//! ============================================================================
//! # Tree Model: Remote Directory/File Hierarchy
//!
//! The mutable tree representing one peer's shared-file catalog. Directory
//! nodes use shared ownership (`Arc<RwLock<..>>`) so a UI holder browsing a
//! subtree keeps it alive even if a concurrent reload detaches it from the
//! live tree; files are owned exclusively by their parent directory.
//!
//! The tree itself holds no serialization lock. Every mutation must go
//! through the listing's task dispatcher, which guarantees at most one task
//! touches the tree at a time. External readers holding a `DirPtr` may read
//! without synchronization but must not assume the node still reflects the
//! live tree after a reload.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU32, Ordering},
};

use ahash::AHashSet;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::dupe::DupeStatus;
use crate::services::ShareService;

/// Shared handle to a directory node.
pub type DirPtr = Arc<RwLock<Directory>>;

/// Stable numeric identifier, unique per listing, assigned at construction
/// and never reused. Used for cross-referencing without path strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeToken(pub u32);

/// Per-listing token allocator.
#[derive(Debug, Default)]
pub struct TokenSource {
    next: AtomicU32,
}

impl TokenSource {
    #[must_use]
    pub fn next(&self) -> NodeToken {
        NodeToken(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque content root hash, computed elsewhere and used here only for
/// identity and dupe checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completeness/kind marker for a directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirType {
    /// Children fully known.
    Normal,

    /// Children listed, but their own contents still pending.
    IncompleteChild,

    /// Nothing below this node has been loaded yet.
    IncompleteNochild,

    /// Synthetic grouping node produced by the ADL matcher.
    Adls,
}

/// Leaf node: one remote file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub hash: ContentHash,

    /// True for ADL-origin copies attached under a synthetic ADLS directory.
    pub adls: bool,

    pub dupe: DupeStatus,
    pub remote_date: i64,
    token: NodeToken,
    parent: Weak<RwLock<Directory>>,
}

impl FileEntry {
    #[must_use]
    pub fn new(
        parent: &DirPtr,
        name: String,
        size: u64,
        hash: ContentHash,
        dupe: DupeStatus,
        remote_date: i64,
        token: NodeToken,
    ) -> Self {
        Self {
            name,
            size,
            hash,
            adls: false,
            dupe,
            remote_date,
            token,
            parent: Arc::downgrade(parent),
        }
    }

    /// Copy of this file for attachment under an ADLS grouping directory.
    #[must_use]
    pub fn adl_copy(&self, parent: &DirPtr, token: NodeToken) -> Self {
        let mut copy = self.clone();
        copy.adls = true;
        copy.token = token;
        copy.parent = Arc::downgrade(parent);
        copy
    }

    #[must_use]
    pub const fn token(&self) -> NodeToken {
        self.token
    }

    #[must_use]
    pub const fn is_queued(&self) -> bool {
        self.dupe.is_queued()
    }

    /// Full remote path, computed through the parent chain.
    #[must_use]
    pub fn path(&self) -> String {
        match self.parent.upgrade() {
            Some(dir) => format!("{}{}", dir_path(&dir), self.name),
            None => self.name.clone(),
        }
    }
}

/// Inner node: one remote directory (or a synthetic ADLS grouping).
#[derive(Debug)]
pub struct Directory {
    pub name: String,
    dir_type: DirType,

    /// Bytes claimed by the peer before this branch was fully loaded.
    pub partial_size: u64,

    pub dupe: DupeStatus,
    pub remote_date: i64,
    pub update_date: i64,
    pub loading: bool,
    token: NodeToken,
    parent: Option<Weak<RwLock<Directory>>>,

    pub dirs: Vec<DirPtr>,
    pub files: Vec<FileEntry>,

    /// For ADLS nodes only: the true full remote path of the matched
    /// location this synthetic node represents.
    pub adl_full_path: Option<String>,
}

impl Directory {
    /// Create a detached root node.
    #[must_use]
    pub fn new_root(tokens: &TokenSource) -> DirPtr {
        Arc::new(RwLock::new(Self {
            name: String::new(),
            dir_type: DirType::IncompleteNochild,
            partial_size: 0,
            dupe: DupeStatus::None,
            remote_date: 0,
            update_date: 0,
            loading: false,
            token: tokens.next(),
            parent: None,
            dirs: Vec::new(),
            files: Vec::new(),
            adl_full_path: None,
        }))
    }

    /// Create a child directory and attach it to `parent`.
    pub fn attach(
        parent: &DirPtr,
        name: String,
        dir_type: DirType,
        update_date: i64,
        tokens: &TokenSource,
    ) -> DirPtr {
        let child = Arc::new(RwLock::new(Self {
            name,
            dir_type,
            partial_size: 0,
            dupe: DupeStatus::None,
            remote_date: 0,
            update_date,
            loading: false,
            token: tokens.next(),
            parent: Some(Arc::downgrade(parent)),
            dirs: Vec::new(),
            files: Vec::new(),
            adl_full_path: None,
        }));

        parent.write().dirs.push(Arc::clone(&child));
        child
    }

    /// Create a synthetic ADLS grouping node under `parent`, remembering the
    /// true remote path it stands for.
    pub fn attach_adl(
        parent: &DirPtr,
        name: String,
        full_path: String,
        update_date: i64,
        tokens: &TokenSource,
    ) -> DirPtr {
        let child = Self::attach(parent, name, DirType::Adls, update_date, tokens);
        child.write().adl_full_path = Some(full_path);
        child
    }

    #[must_use]
    pub const fn token(&self) -> NodeToken {
        self.token
    }

    /// Upgraded parent handle, `None` for the root or a detached node.
    #[must_use]
    pub fn parent_ptr(&self) -> Option<DirPtr> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    #[must_use]
    pub const fn dir_type(&self) -> DirType {
        self.dir_type
    }

    pub const fn set_dir_type(&mut self, dir_type: DirType) {
        self.dir_type = dir_type;
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.dir_type, DirType::Normal | DirType::Adls)
    }

    pub const fn set_complete(&mut self) {
        self.dir_type = DirType::Normal;
    }

    #[must_use]
    pub const fn is_adls(&self) -> bool {
        matches!(self.dir_type, DirType::Adls)
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Sum of the direct children file sizes.
    #[must_use]
    pub fn files_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Recursive file count. ADLS subtrees and ADL-origin copies only count
    /// when `count_adls` is set.
    #[must_use]
    pub fn total_file_count(&self, count_adls: bool) -> usize {
        if self.is_adls() && !count_adls {
            return 0;
        }

        let own: usize = self
            .files
            .iter()
            .filter(|f| count_adls || !f.adls)
            .count();

        own + self
            .dirs
            .iter()
            .map(|d| d.read().total_file_count(count_adls))
            .sum::<usize>()
    }

    /// Recursive size. Incomplete branches contribute the partial-size hint
    /// the peer claimed for them.
    #[must_use]
    pub fn total_size(&self, count_adls: bool) -> u64 {
        if self.is_adls() && !count_adls {
            return 0;
        }

        if !self.is_complete() {
            return self.partial_size;
        }

        let own: u64 = self
            .files
            .iter()
            .filter(|f| count_adls || !f.adls)
            .map(|f| f.size)
            .sum();

        own + self
            .dirs
            .iter()
            .map(|d| d.read().total_size(count_adls))
            .sum::<u64>()
    }

    /// True if this node or any descendant is still missing children.
    #[must_use]
    pub fn find_incomplete(&self) -> bool {
        if !self.is_complete() {
            return true;
        }

        self.dirs.iter().any(|d| d.read().find_incomplete())
    }

    /// Collect the distinct content hashes under this node.
    pub fn collect_hashes(&self, out: &mut AHashSet<ContentHash>, include_adls: bool) {
        if self.is_adls() && !include_adls {
            return;
        }

        for f in &self.files {
            if include_adls || !f.adls {
                out.insert(f.hash.clone());
            }
        }

        for d in &self.dirs {
            d.read().collect_hashes(out, include_adls);
        }
    }

    /// Recompute dupe statuses against the share, bottom-up. A directory is
    /// a full share dupe when all children are, a partial one when any is.
    pub fn check_share_dupes(&mut self, share: &dyn ShareService) -> DupeStatus {
        let mut any = false;
        let mut all = true;

        for f in &mut self.files {
            f.dupe = share.is_dupe_of(&f.hash);
            if f.dupe.is_shared() {
                any = true;
            } else {
                all = false;
            }
        }

        for d in &self.dirs {
            let child = d.write().check_share_dupes(share);
            if child.is_shared() {
                any = true;
            }
            if child != DupeStatus::Share {
                all = false;
            }
        }

        self.dupe = if any && all && (!self.files.is_empty() || !self.dirs.is_empty()) {
            DupeStatus::Share
        } else if any {
            DupeStatus::PartialShare
        } else {
            DupeStatus::None
        };

        self.dupe
    }

    /// Drop every child node. The subtrees stay alive for external holders.
    pub fn clear_all(&mut self) {
        self.dirs.clear();
        self.files.clear();
    }

    /// Remove synthetic ADLS groupings, recursively.
    pub fn clear_adls(&mut self) {
        self.dirs.retain(|d| !d.read().is_adls());
        for d in &self.dirs {
            d.write().clear_adls();
        }
        self.files.retain(|f| !f.adls);
    }
}

/// Full remote path of a directory node, `/`-terminated. The root renders
/// as `/`. Locks are taken one node at a time while walking up.
#[must_use]
pub fn dir_path(dir: &DirPtr) -> String {
    let mut segments: Vec<String> = Vec::new();
    let mut cursor: Option<DirPtr> = Some(Arc::clone(dir));

    while let Some(node) = cursor {
        let guard = node.read();
        if !guard.name.is_empty() {
            segments.push(guard.name.clone());
        }
        cursor = guard
            .parent
            .as_ref()
            .and_then(std::sync::Weak::upgrade);
    }

    let mut path = String::from("/");
    for seg in segments.iter().rev() {
        path.push_str(seg);
        path.push('/');
    }
    path
}

/// Case-insensitive direct-child lookup.
#[must_use]
pub fn find_child(dir: &DirPtr, name: &str) -> Option<DirPtr> {
    let guard = dir.read();
    guard
        .dirs
        .iter()
        .find(|d| d.read().name.eq_ignore_ascii_case(name))
        .cloned()
}

/// Case-insensitive path lookup from `root`. Returns the explicit not-found
/// outcome as `None`; lookups never fail with an error.
#[must_use]
pub fn find_directory(root: &DirPtr, path: &str) -> Option<DirPtr> {
    let mut cursor = Arc::clone(root);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        cursor = find_child(&cursor, segment)?;
    }
    Some(cursor)
}

/// Filter in place: keep only files whose hash is in `keep`, then prune
/// directories left with nothing. ADLS subtrees are not touched.
pub fn filter_by_hashes(dir: &DirPtr, keep: &AHashSet<ContentHash>) {
    {
        let mut guard = dir.write();
        guard.files.retain(|f| f.adls || keep.contains(&f.hash));
    }

    let children: Vec<DirPtr> = dir.read().dirs.clone();
    for child in &children {
        if child.read().is_adls() {
            continue;
        }
        filter_by_hashes(child, keep);
    }

    dir.write().dirs.retain(|d| {
        let guard = d.read();
        guard.is_adls() || !guard.files.is_empty() || !guard.dirs.is_empty()
    });
}

/// Diff filter: keep only the files this tree shares with `other`.
pub fn filter_by_listing(dir: &DirPtr, other: &DirPtr) {
    let mut keep: AHashSet<ContentHash> = AHashSet::new();
    other.read().collect_hashes(&mut keep, false);
    filter_by_hashes(dir, &keep);
}

/// Recursive regex search over file names. Matches are appended as full
/// remote paths.
pub fn find_files(dir: &DirPtr, regex: &Regex, results: &mut Vec<String>) {
    find_files_walk(dir, &dir_path(dir), regex, results);
}

fn find_files_walk(dir: &DirPtr, prefix: &str, regex: &Regex, results: &mut Vec<String>) {
    let guard = dir.read();

    for f in &guard.files {
        if regex.is_match(&f.name) {
            results.push(format!("{prefix}{}", f.name));
        }
    }

    for d in &guard.dirs {
        let child_prefix = format!("{prefix}{}/", d.read().name);
        find_files_walk(d, &child_prefix, regex, results);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::dir_with_files;
    use super::*;

    fn sample_tree() -> (DirPtr, TokenSource) {
        let tokens = TokenSource::default();
        let root = Directory::new_root(&tokens);
        root.write().set_complete();

        dir_with_files(
            &root,
            "Music",
            &[("a.mp3", 100, "H1"), ("b.mp3", 200, "H2")],
            &tokens,
        );
        dir_with_files(&root, "Video", &[("clip.mkv", 5000, "H3")], &tokens);

        (root, tokens)
    }

    #[test]
    fn aggregates_match_scenario() {
        let (root, _tokens) = sample_tree();
        let guard = root.read();

        assert_eq!(guard.total_file_count(false), 3);
        assert_eq!(guard.total_size(false), 5300);
    }

    #[test]
    fn adl_inclusive_count_never_less_than_exclusive() {
        let (root, tokens) = sample_tree();

        let adl = Directory::attach_adl(
            &root,
            "<<ADL: flac>>".to_string(),
            "/Music/".to_string(),
            0,
            &tokens,
        );
        let src = find_directory(&root, "/Music/").unwrap();
        let copy = src.read().files[0].adl_copy(&adl, tokens.next());
        adl.write().files.push(copy);

        let guard = root.read();
        assert!(guard.total_file_count(true) >= guard.total_file_count(false));
        assert_eq!(guard.total_file_count(false), 3);
        assert_eq!(guard.total_file_count(true), 4);
    }

    #[test]
    fn incomplete_dir_reports_partial_size() {
        let tokens = TokenSource::default();
        let root = Directory::new_root(&tokens);
        root.write().set_complete();

        let pending = Directory::attach(
            &root,
            "Pending".to_string(),
            DirType::IncompleteNochild,
            0,
            &tokens,
        );
        pending.write().partial_size = 777;

        assert_eq!(root.read().total_size(false), 777);
        assert!(root.read().find_incomplete());
    }

    #[test]
    fn filter_against_no_hashes_empties_tree() {
        let (root, _tokens) = sample_tree();

        filter_by_hashes(&root, &AHashSet::new());

        assert_eq!(root.read().total_file_count(false), 0);
        assert_eq!(root.read().dir_count(), 0);
    }

    #[test]
    fn filter_against_all_hashes_is_identity() {
        let (root, _tokens) = sample_tree();

        let mut all = AHashSet::new();
        root.read().collect_hashes(&mut all, false);
        assert_eq!(all.len(), 3);

        filter_by_hashes(&root, &all);

        assert_eq!(root.read().total_file_count(false), 3);
        assert_eq!(root.read().dir_count(), 2);
    }

    #[test]
    fn detached_subtree_survives_through_external_handle() {
        let (root, _tokens) = sample_tree();
        let music = find_directory(&root, "/music/").unwrap();

        filter_by_hashes(&root, &AHashSet::new());

        // The live tree no longer references Music, the handle still works.
        assert!(find_directory(&root, "/Music/").is_none());
        assert_eq!(music.read().name, "Music");
        assert_eq!(music.read().file_count(), 2);
    }

    #[test]
    fn paths_walk_parent_chain() {
        let (root, _tokens) = sample_tree();
        let music = find_directory(&root, "/Music/").unwrap();

        assert_eq!(dir_path(&root), "/");
        assert_eq!(dir_path(&music), "/Music/");
        assert_eq!(music.read().files[0].path(), "/Music/a.mp3");
    }

    #[test]
    fn lookup_is_case_insensitive_and_not_found_is_none() {
        let (root, _tokens) = sample_tree();

        assert!(find_directory(&root, "/MUSIC/").is_some());
        assert!(find_directory(&root, "/Nope/").is_none());
    }

    #[test]
    fn regex_file_search_returns_full_paths() {
        let (root, _tokens) = sample_tree();

        let regex = Regex::new(r"\.mkv$").unwrap();
        let mut results = Vec::new();
        find_files(&root, &regex, &mut results);

        assert_eq!(results, vec!["/Video/clip.mkv".to_string()]);
    }

    #[test]
    fn tokens_are_unique_within_listing() {
        let (root, tokens) = sample_tree();
        let mut seen = AHashSet::new();

        assert!(seen.insert(root.read().token()));
        for d in &root.read().dirs {
            assert!(seen.insert(d.read().token()));
            for f in &d.read().files {
                assert!(seen.insert(f.token()));
            }
        }
        assert!(seen.insert(tokens.next()));
    }
}
