//! ``src/search.rs``
//! ============================================================================
//! # Search Engine: In-Tree Queries and Live Network Search State
//!
//! Two independent mechanisms share the ordered result set:
//!
//! 1. In-tree search walks the subtree rooted at the query's target
//!    directory and tests names, sizes and dates. It completes within one
//!    dispatched task and is restartable; rerunning replaces the result set.
//! 2. Live network search is dispatched outbound under a generated token;
//!    results arrive later through the search-result handler and are
//!    appended up to a configured cap. A periodic timer tick ends the
//!    search once too much time passes since the last received result.
//!
//! Results are full path strings in an `IndexSet`: duplicate-free, iteration
//! order is insertion order, so UI paging stays stable.

use std::time::{Duration, Instant};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ListingError;
use crate::model::tree::DirPtr;

/// How the size bound applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMode {
    #[default]
    Any,
    AtLeast,
    AtMost,
    Exact,
}

/// Which node kinds a query matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeFilter {
    #[default]
    Any,
    File,
    Directory,
}

/// One search query: string tokens, size bound with comparison mode, type
/// filter, extension filter and the directory to search under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// All terms must match, case-insensitively.
    pub terms: Vec<String>,

    pub size: Option<u64>,
    pub size_mode: SizeMode,
    pub type_filter: TypeFilter,

    /// Extensions without the leading dot; empty means no filter.
    pub extensions: Vec<String>,

    pub min_date: Option<i64>,
    pub max_date: Option<i64>,

    /// Directory path the search is rooted at; `/` for the whole listing.
    pub target: String,
}

impl SearchQuery {
    #[must_use]
    pub fn for_terms<S: Into<String>>(terms: Vec<String>, target: S) -> Self {
        Self {
            terms,
            target: target.into(),
            ..Self::default()
        }
    }

    fn terms_match(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.terms.iter().all(|t| lower.contains(&t.to_lowercase()))
    }

    fn size_matches(&self, size: u64) -> bool {
        match (self.size, self.size_mode) {
            (None, _) | (Some(_), SizeMode::Any) => true,
            (Some(bound), SizeMode::AtLeast) => size >= bound,
            (Some(bound), SizeMode::AtMost) => size <= bound,
            (Some(bound), SizeMode::Exact) => size == bound,
        }
    }

    fn date_matches(&self, date: i64) -> bool {
        self.min_date.is_none_or(|min| date >= min)
            && self.max_date.is_none_or(|max| date <= max)
    }

    fn extension_matches(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }

        let lower = name.to_lowercase();
        self.extensions
            .iter()
            .any(|ext| lower.ends_with(&format!(".{}", ext.to_lowercase())))
    }

    #[must_use]
    pub fn matches_file(&self, name: &str, size: u64, date: i64) -> bool {
        if matches!(self.type_filter, TypeFilter::Directory) {
            return false;
        }

        self.terms_match(name)
            && self.extension_matches(name)
            && self.size_matches(size)
            && self.date_matches(date)
    }

    #[must_use]
    pub fn matches_dir(&self, name: &str, date: i64) -> bool {
        if matches!(self.type_filter, TypeFilter::File) {
            return false;
        }
        if !self.extensions.is_empty() {
            return false;
        }

        self.terms_match(name) && self.date_matches(date)
    }
}

/// Walk the subtree at `dir` and append matches (full paths) to `results`.
/// ADLS subtrees are skipped; their contents are synthetic copies.
pub fn search_tree(
    dir: &DirPtr,
    query: &SearchQuery,
    results: &mut IndexSet<String>,
    abort: &CancellationToken,
) -> Result<(), ListingError> {
    search_walk(dir, &crate::model::tree::dir_path(dir), query, results, abort)
}

fn search_walk(
    dir: &DirPtr,
    prefix: &str,
    query: &SearchQuery,
    results: &mut IndexSet<String>,
    abort: &CancellationToken,
) -> Result<(), ListingError> {
    if abort.is_cancelled() {
        return Err(ListingError::Aborted);
    }

    let guard = dir.read();

    for f in &guard.files {
        if !f.adls && query.matches_file(&f.name, f.size, f.remote_date) {
            results.insert(format!("{prefix}{}", f.name));
        }
    }

    for d in &guard.dirs {
        let child = d.read();
        if child.is_adls() {
            continue;
        }

        let child_prefix = format!("{prefix}{}/", child.name);
        if query.matches_dir(&child.name, child.remote_date) {
            results.insert(child_prefix.clone());
        }
        drop(child);

        search_walk(d, &child_prefix, query, results, abort)?;
    }

    Ok(())
}

/// State of one outstanding live network search.
#[derive(Debug)]
pub struct LiveSearch {
    pub token: String,
    pub started: Instant,
    pub last_result: Instant,
    pub result_count: usize,
    pub max_results: usize,
}

impl LiveSearch {
    #[must_use]
    pub fn new(token: String, max_results: usize) -> Self {
        let now = Instant::now();
        Self {
            token,
            started: now,
            last_result: now,
            result_count: 0,
            max_results,
        }
    }

    /// Record one accepted result.
    pub fn register_result(&mut self) {
        self.result_count += 1;
        self.last_result = Instant::now();
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.result_count >= self.max_results
    }

    /// True once `timeout` elapsed since the last received result (or since
    /// the start, if nothing arrived). Evaluated on timer ticks.
    #[must_use]
    pub fn timed_out(&self, timeout: Duration) -> bool {
        self.last_result.elapsed() >= timeout
    }
}
