//! ``src/adl.rs``
//! ============================================================================
//! # ADL Matcher: Auto-Download Rules Over the Tree
//!
//! Evaluates user-defined rules against every real file and directory in a
//! listing. Each rule owns one synthetic ADLS grouping node under the root;
//! matched files are attached to it as ADL-origin copies, and matched
//! directories become ADLS child nodes carrying the true full remote path of
//! the location they represent.
//!
//! A match pass always clears previous ADLS nodes and rebuilds from scratch;
//! groupings are never patched incrementally.

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ListingError;
use crate::model::tree::{DirPtr, Directory, TokenSource, dir_path};

/// What part of a node a rule's pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdlTarget {
    FileName,
    FullPath,
    DirectoryName,
}

/// One auto-download rule.
#[derive(Debug, Clone)]
pub struct AdlRule {
    /// Name of the grouping directory created for this rule's matches.
    pub name: String,

    pub pattern: Regex,
    pub target: AdlTarget,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub active: bool,
}

impl AdlRule {
    #[must_use]
    pub fn new<S: Into<String>>(name: S, pattern: Regex, target: AdlTarget) -> Self {
        Self {
            name: name.into(),
            pattern,
            target,
            min_size: None,
            max_size: None,
            active: true,
        }
    }

    fn size_ok(&self, size: u64) -> bool {
        self.min_size.is_none_or(|min| size >= min)
            && self.max_size.is_none_or(|max| size <= max)
    }

    #[must_use]
    pub fn matches_file(&self, name: &str, full_path: &str, size: u64) -> bool {
        if !self.active || !self.size_ok(size) {
            return false;
        }

        match self.target {
            AdlTarget::FileName => self.pattern.is_match(name),
            AdlTarget::FullPath => self.pattern.is_match(full_path),
            AdlTarget::DirectoryName => false,
        }
    }

    #[must_use]
    pub fn matches_dir(&self, name: &str) -> bool {
        self.active && matches!(self.target, AdlTarget::DirectoryName) && self.pattern.is_match(name)
    }
}

/// Run a full match pass: clear previous ADLS nodes, walk the tree, attach
/// fresh groupings under the root. Returns the number of matches.
pub fn match_listing(
    root: &DirPtr,
    rules: &[AdlRule],
    tokens: &TokenSource,
    abort: &CancellationToken,
    now: i64,
) -> Result<usize, ListingError> {
    root.write().clear_adls();

    let active: Vec<&AdlRule> = rules.iter().filter(|r| r.active).collect();
    if active.is_empty() {
        return Ok(0);
    }

    let mut pass = MatchPass {
        root,
        tokens,
        abort,
        now,
        groups: vec![None; active.len()],
        matches: 0,
    };

    pass.walk(root, &dir_path(root), &active)?;

    debug!(matches = pass.matches, rules = active.len(), "ADL match pass finished");
    Ok(pass.matches)
}

struct MatchPass<'a> {
    root: &'a DirPtr,
    tokens: &'a TokenSource,
    abort: &'a CancellationToken,
    now: i64,

    /// Lazily created grouping node per active rule.
    groups: Vec<Option<DirPtr>>,
    matches: usize,
}

impl MatchPass<'_> {
    fn group(&mut self, idx: usize, rule: &AdlRule, matched_path: &str) -> DirPtr {
        if let Some(existing) = &self.groups[idx] {
            return DirPtr::clone(existing);
        }

        let group = Directory::attach_adl(
            self.root,
            rule.name.clone(),
            matched_path.to_string(),
            self.now,
            self.tokens,
        );
        self.groups[idx] = Some(DirPtr::clone(&group));
        group
    }

    fn walk(
        &mut self,
        dir: &DirPtr,
        prefix: &str,
        rules: &[&AdlRule],
    ) -> Result<(), ListingError> {
        if self.abort.is_cancelled() {
            return Err(ListingError::Aborted);
        }

        // Snapshot real children first: attaching groupings under the root
        // must not feed the walk.
        let (files, dirs): (Vec<_>, Vec<_>) = {
            let guard = dir.read();
            (guard.files.clone(), guard.dirs.clone())
        };

        for f in &files {
            if f.adls {
                continue;
            }
            let full_path = format!("{prefix}{}", f.name);

            for (idx, rule) in rules.iter().enumerate() {
                if rule.matches_file(&f.name, &full_path, f.size) {
                    let group = self.group(idx, rule, prefix);
                    let copy = f.adl_copy(&group, self.tokens.next());
                    group.write().files.push(copy);
                    self.matches += 1;
                }
            }
        }

        for d in &dirs {
            let (name, is_adls) = {
                let guard = d.read();
                (guard.name.clone(), guard.is_adls())
            };
            if is_adls {
                continue;
            }

            let child_prefix = format!("{prefix}{name}/");

            for (idx, rule) in rules.iter().enumerate() {
                if rule.matches_dir(&name) {
                    let group = self.group(idx, rule, &child_prefix);
                    // Matched directories appear as ADLS children carrying
                    // their real remote path; their direct files come along
                    // as ADL-origin copies.
                    let synthetic = Directory::attach_adl(
                        &group,
                        name.clone(),
                        child_prefix.clone(),
                        self.now,
                        self.tokens,
                    );
                    {
                        let mut sg = synthetic.write();
                        let copies: Vec<_> = d
                            .read()
                            .files
                            .iter()
                            .map(|f| f.adl_copy(&synthetic, self.tokens.next()))
                            .collect();
                        sg.files = copies;
                    }
                    self.matches += 1;
                }
            }

            self.walk(d, &child_prefix, rules)?;
        }

        Ok(())
    }
}
