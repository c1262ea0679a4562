//! ``src/listing.rs``
//! ============================================================================
//! # `DirectoryListing`: One Peer's Shared-File Catalog
//!
//! The facade tying the engine together: owns the tree, the per-listing task
//! dispatcher, the lifecycle state machine and the listener surface. Every
//! mutation — loads, searches, ADL matching, dupe checks, download
//! initiation — runs as a dispatched task; external event sources (network
//! search results, peer presence, share refreshes, timer ticks) enter
//! through small single-purpose handler functions that enqueue into the same
//! queue.
//!
//! Lifecycle: `DownloadPending → Downloading → Loading → Loaded`, with
//! `Loaded` re-entered after every successful reload. `close()` is terminal:
//! it emits `Closing`, rejects new tasks, aborts the running one at its next
//! checkpoint, and the listing may be dropped once `wait_idle()` resolves.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::Utc;
use indexmap::IndexSet;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::adl::match_listing;
use crate::config::ListingConfig;
use crate::download::{Priority, download_directory};
use crate::error::ListingError;
use crate::events::{ListenerHub, ListingEvent, Severity};
use crate::loader::{DirMap, ListLoader, normalize_path};
use crate::model::tree::{DirPtr, Directory, TokenSource, dir_path, find_directory};
use crate::search::{LiveSearch, SearchQuery, search_tree};
use crate::services::{AdlProvider, QueueService, QueueToken, SearchService, ShareService};

/// Identity of the peer whose share this listing represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub cid: String,
    pub nick: String,
    pub hub_url: String,
}

/// Nick part of a cached list file name (`<nick>.<cid>.json`).
#[must_use]
pub fn nick_from_filename(file_name: &str) -> String {
    let stem = file_name.strip_suffix(".json").unwrap_or(file_name);
    match stem.rsplit_once('.') {
        Some((nick, _cid)) => nick.to_string(),
        None => stem.to_string(),
    }
}

/// CID part of a cached list file name, when present.
#[must_use]
pub fn cid_from_filename(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".json").unwrap_or(file_name);
    stem.rsplit_once('.').map(|(_, cid)| cid.to_string())
}

/// Load/download progress of the listing as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    DownloadPending,
    Downloading,
    Loading,
    Loaded,
}

/// Whether a browse action should ask the transport for fresh content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    None,
    Dir,
    All,
}

/// Cached summary of the currently browsed directory, recomputed whenever
/// the browse position changes.
#[derive(Debug, Clone)]
pub struct LocationInfo {
    pub path: String,
    pub size: u64,
    pub files: usize,
    pub directories: usize,
    pub complete: bool,
}

impl Default for LocationInfo {
    fn default() -> Self {
        Self {
            path: String::from("/"),
            size: 0,
            files: 0,
            directories: 0,
            complete: false,
        }
    }
}

/// State mutated only from dispatched tasks (and the few direct calls that
/// take the same lock).
struct ListingState {
    base_dirs: DirMap,
    lifecycle: LifecycleState,
    current: Option<DirPtr>,
    location: LocationInfo,
    cur_search: Option<SearchQuery>,
    live: Option<LiveSearch>,
    results: IndexSet<String>,
    cursor: Option<usize>,
    queue_token: Option<QueueToken>,
}

struct ListingInner {
    user: PeerIdentity,
    partial_list: bool,
    file_name: String,
    config: ListingConfig,
    tokens: TokenSource,
    root: DirPtr,
    dispatcher: crate::dispatch::task_queue::TaskDispatcher,
    listeners: ListenerHub,
    share: Arc<dyn ShareService>,
    queue: Arc<dyn QueueService>,
    searcher: Arc<dyn SearchService>,
    adl: Arc<dyn AdlProvider>,
    open: AtomicBool,
    state: Mutex<ListingState>,
}

/// Cheaply cloneable handle to one listing. All clones share the same tree,
/// dispatcher and listener hub.
#[derive(Clone)]
pub struct DirectoryListing {
    inner: Arc<ListingInner>,
}

impl DirectoryListing {
    #[must_use]
    pub fn new(
        user: PeerIdentity,
        partial_list: bool,
        file_name: String,
        config: ListingConfig,
        share: Arc<dyn ShareService>,
        queue: Arc<dyn QueueService>,
        searcher: Arc<dyn SearchService>,
        adl: Arc<dyn AdlProvider>,
    ) -> Self {
        let tokens = TokenSource::default();
        let root = Directory::new_root(&tokens);

        Self {
            inner: Arc::new(ListingInner {
                user,
                partial_list,
                file_name,
                config,
                tokens,
                root,
                dispatcher: crate::dispatch::task_queue::TaskDispatcher::new(),
                listeners: ListenerHub::new(),
                share,
                queue,
                searcher,
                adl,
                open: AtomicBool::new(true),
                state: Mutex::new(ListingState {
                    base_dirs: DirMap::new(),
                    lifecycle: LifecycleState::DownloadPending,
                    current: None,
                    location: LocationInfo::default(),
                    cur_search: None,
                    live: None,
                    results: IndexSet::new(),
                    cursor: None,
                    queue_token: None,
                }),
            }),
        }
    }

    // ---- accessors ---------------------------------------------------------

    #[must_use]
    pub fn user(&self) -> &PeerIdentity {
        &self.inner.user
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    #[must_use]
    pub fn is_partial_list(&self) -> bool {
        self.inner.partial_list
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn root(&self) -> DirPtr {
        DirPtr::clone(&self.inner.root)
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.state.lock().await.lifecycle
    }

    pub async fn current_location(&self) -> LocationInfo {
        self.inner.state.lock().await.location.clone()
    }

    pub async fn queue_token(&self) -> Option<QueueToken> {
        self.inner.state.lock().await.queue_token
    }

    pub async fn result_count(&self) -> usize {
        self.inner.state.lock().await.results.len()
    }

    /// Register an event subscriber. Each subscriber gets its own channel.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ListingEvent> {
        self.inner.listeners.subscribe()
    }

    #[must_use]
    pub fn total_list_size(&self, adls: bool) -> u64 {
        self.inner.root.read().total_size(adls)
    }

    #[must_use]
    pub fn total_file_count(&self, adls: bool) -> usize {
        self.inner.root.read().total_file_count(adls)
    }

    /// Recursive size of one directory, or the not-found outcome as `None`.
    #[must_use]
    pub fn dir_size(&self, path: &str) -> Option<u64> {
        find_directory(&self.inner.root, path).map(|d| d.read().total_size(false))
    }

    #[must_use]
    pub fn find_directory(&self, path: &str) -> Option<DirPtr> {
        find_directory(&self.inner.root, path)
    }

    #[must_use]
    pub fn find_incomplete(&self) -> bool {
        self.inner.root.read().find_incomplete()
    }

    /// Resolve only after every pending and running task finished; the
    /// listing may be dropped afterwards.
    pub async fn wait_idle(&self) {
        self.inner.dispatcher.wait_idle().await;
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Terminal shutdown: rejects new tasks, aborts the running one at its
    /// next checkpoint and emits `Closing` as the final event.
    pub fn close(&self) {
        if self.inner.dispatcher.is_closed() {
            return;
        }

        self.inner.open.store(false, Ordering::Release);
        self.inner.listeners.emit(&ListingEvent::Closing);
        self.inner.dispatcher.close();
        debug!(nick = %self.inner.user.nick, "Listing closed");
    }

    fn set_state(inner: &ListingInner, st: &mut ListingState, state: LifecycleState) {
        if st.lifecycle != state {
            st.lifecycle = state;
            inner.listeners.emit(&ListingEvent::StateChanged { state });
        }
    }

    fn status(inner: &ListingInner, severity: Severity, text: String) {
        inner
            .listeners
            .emit(&ListingEvent::StatusMessage { text, severity });
    }

    fn update_location(st: &mut ListingState, dir: &DirPtr) {
        let path = dir_path(dir);
        let guard = dir.read();
        st.location = LocationInfo {
            path,
            size: guard.total_size(false),
            files: guard.total_file_count(false),
            directories: guard.dir_count(),
            complete: guard.is_complete(),
        };
        drop(guard);
        st.current = Some(DirPtr::clone(dir));
    }

    // ---- task API ----------------------------------------------------------

    /// Enqueue an arbitrary task behind every pending one.
    pub fn add_async_task<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.dispatcher.enqueue(task);
    }

    /// Parse and load a complete listing payload, replacing the tree.
    pub fn add_full_list_task(&self, payload: String) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |abort| async move {
            Self::full_list_impl(&inner, &abort, &payload).await;
        });
    }

    /// Merge a partial listing payload under `base`.
    pub fn add_partial_list_task(
        &self,
        payload: String,
        base: String,
        reload_all: bool,
        change_dir: bool,
    ) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |abort| async move {
            Self::partial_list_impl(&inner, &abort, &payload, &base, reload_all, change_dir).await;
        });
    }

    /// Diff this listing against another one's tree: keep only shared files.
    pub fn add_list_diff_task(&self, other_root: DirPtr) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let _st = inner.state.lock().await;
            crate::model::tree::filter_by_listing(&inner.root, &other_root);
            Self::status(
                &inner,
                Severity::Info,
                String::from("List diff finished"),
            );
        });
    }

    /// Rerun the auto-download rules over the whole tree.
    pub fn add_match_adl_task(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |abort| async move {
            let _st = inner.state.lock().await;
            Self::match_adl_impl(&inner, &abort);
        });
    }

    /// Recheck every node's dupe status against the share.
    pub fn add_dupe_check_task(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let _st = inner.state.lock().await;
            inner.root.write().check_share_dupes(inner.share.as_ref());
            inner.listeners.emit(&ListingEvent::DupesChecked);
        });
    }

    /// Start a search. Full listings search the in-memory tree; partial
    /// listings dispatch a live network search correlated by token.
    pub fn add_search_task(&self, query: SearchQuery) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |abort| async move {
            Self::search_impl(&inner, &abort, query).await;
        });
    }

    /// Turn the subtree at `remote_dir` into one bundle request targeting
    /// the local `target` path.
    pub fn add_directory_download_task(
        &self,
        remote_dir: String,
        target: String,
        priority: Priority,
        auto_search: Option<u64>,
    ) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            Self::download_impl(&inner, &remote_dir, &target, priority, auto_search).await;
        });
    }

    // ---- direct calls (serialized through the state lock) ------------------

    /// Move the browse position. Returns `false` when the directory is not
    /// in the list; closed listings reject browsing outright.
    pub async fn change_directory(&self, path: &str, reload: ReloadMode) -> bool {
        if !self.is_open() {
            return false;
        }

        let inner = &self.inner;
        let mut st = inner.state.lock().await;

        let Some(dir) = find_directory(&inner.root, path) else {
            trace!(path, "change_directory: not found");
            return false;
        };

        Self::update_location(&mut st, &dir);
        inner.listeners.emit(&ListingEvent::ChangeDirectory {
            path: st.location.path.clone(),
        });

        let incomplete = !dir.read().is_complete();
        if !matches!(reload, ReloadMode::None) || incomplete {
            dir.write().loading = true;
            inner.listeners.emit(&ListingEvent::ReloadRequested {
                path: st.location.path.clone(),
                reload_all: matches!(reload, ReloadMode::All),
            });
        }

        true
    }

    /// Advance (or retreat) the cursor over the ordered result set and move
    /// the browse position to the directory containing the hit. Fails with
    /// `None` when the result set is empty.
    pub async fn next_result(&self, prev: bool) -> Option<String> {
        let inner = &self.inner;
        let mut st = inner.state.lock().await;

        if st.results.is_empty() {
            return None;
        }

        let len = st.results.len();
        let idx = match st.cursor {
            None => {
                if prev {
                    len - 1
                } else {
                    0
                }
            }
            Some(i) => {
                if prev {
                    i.saturating_sub(1)
                } else {
                    (i + 1).min(len - 1)
                }
            }
        };
        st.cursor = Some(idx);

        let path = st.results.get_index(idx).cloned()?;
        let containing = containing_directory(&path);
        if let Some(dir) = find_directory(&inner.root, &containing) {
            Self::update_location(&mut st, &dir);
            inner.listeners.emit(&ListingEvent::ChangeDirectory {
                path: st.location.path.clone(),
            });
        }

        Some(path)
    }

    /// True when `path` is the result the cursor currently points at.
    pub async fn is_current_search_path(&self, path: &str) -> bool {
        let st = self.inner.state.lock().await;
        st.cursor
            .and_then(|i| st.results.get_index(i))
            .is_some_and(|p| p == path)
    }

    // ---- external event handlers -------------------------------------------

    /// Live search result, correlated by token. Mismatched or late results
    /// are ignored.
    pub fn on_search_result(&self, token: &str, path: String) {
        let inner = Arc::clone(&self.inner);
        let token = token.to_string();
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;

            let Some(live) = st.live.as_mut() else {
                return;
            };
            if live.token != token || live.at_capacity() {
                return;
            }

            if st.results.insert(path.clone()) {
                live.register_result();
                inner
                    .listeners
                    .emit(&ListingEvent::SearchResultAdded { path });
            }

            if live.at_capacity() {
                Self::end_search(&inner, st, false);
            }
        });
    }

    /// Periodic timer tick; ends the live search once the configured quiet
    /// period elapsed since the last result.
    pub fn on_timer_tick(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;

            let timed_out = st
                .live
                .as_ref()
                .is_some_and(|live| live.timed_out(inner.config.search.timeout));
            if timed_out {
                Self::end_search(&inner, st, true);
            }
        });
    }

    /// The peer's client reported how many results the direct search
    /// produced in total.
    pub fn on_direct_search_end(&self, token: &str, result_count: usize) {
        let inner = Arc::clone(&self.inner);
        let token = token.to_string();
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let mut guard = inner.state.lock().await;
            let st = &mut *guard;

            let matches = st.live.as_ref().is_some_and(|live| live.token == token);
            if matches && (result_count == 0 || st.results.len() >= result_count) {
                Self::end_search(&inner, st, false);
            }
        });
    }

    /// Peer presence changes only surface as listener events.
    pub fn on_user_updated(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            inner
                .listeners
                .emit(&ListingEvent::UserUpdated { online: true });
        });
    }

    pub fn on_user_disconnected(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            inner
                .listeners
                .emit(&ListingEvent::UserUpdated { online: false });
        });
    }

    /// The local share refreshed some paths; recheck dupe statuses.
    pub fn on_share_refreshed(&self) {
        if self.inner.config.dupe_check_on_refresh {
            self.add_dupe_check_task();
        }
    }

    /// The transport started downloading this listing's file.
    pub fn on_download_starting(&self, list_file: &str) {
        if list_file != self.inner.file_name {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let mut st = inner.state.lock().await;
            Self::set_state(&inner, &mut st, LifecycleState::Downloading);
        });
    }

    /// The transport failed to fetch this listing's file.
    pub fn on_download_failed(&self, list_file: &str, reason: String) {
        if list_file != self.inner.file_name {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let mut st = inner.state.lock().await;
            Self::set_state(&inner, &mut st, LifecycleState::DownloadPending);
            Self::status(
                &inner,
                Severity::Warning,
                format!("List download failed: {reason}"),
            );
        });
    }

    /// The queue removed the bundle this listing created.
    pub fn on_queue_removed(&self, directory: String) {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(move |_abort| async move {
            let mut st = inner.state.lock().await;
            if st.queue_token.take().is_some() {
                inner
                    .listeners
                    .emit(&ListingEvent::RemovedQueue { directory });
            }
        });
    }

    // ---- task implementations ----------------------------------------------

    async fn full_list_impl(inner: &Arc<ListingInner>, abort: &CancellationToken, payload: &str) {
        let mut st = inner.state.lock().await;
        Self::set_state(inner, &mut st, LifecycleState::Loading);
        inner.listeners.emit(&ListingEvent::LoadingStarted {
            directory: String::from("/"),
        });

        let loader = ListLoader {
            share: inner.share.as_ref(),
            tokens: &inner.tokens,
            abort: abort.clone(),
            list_date: Utc::now().timestamp(),
        };

        match loader.load_full(&inner.root, &mut st.base_dirs, payload) {
            Ok(count) => {
                Self::set_state(inner, &mut st, LifecycleState::Loaded);
                Self::update_location(&mut st, &inner.root);
                inner.listeners.emit(&ListingEvent::LoadingFinished {
                    directory: String::from("/"),
                    dirs_loaded: count,
                    reload: false,
                    change_dir: true,
                });

                if inner.config.match_adl {
                    Self::match_adl_impl(inner, abort);
                }
            }
            Err(e) if e.is_abort() => trace!("Full load aborted by close()"),
            Err(e) => Self::loading_failed(inner, &e),
        }
    }

    async fn partial_list_impl(
        inner: &Arc<ListingInner>,
        abort: &CancellationToken,
        payload: &str,
        base: &str,
        reload_all: bool,
        change_dir: bool,
    ) {
        let mut st = inner.state.lock().await;

        if reload_all {
            inner.root.write().clear_all();
            st.base_dirs.clear();
        }

        Self::set_state(inner, &mut st, LifecycleState::Loading);
        inner.listeners.emit(&ListingEvent::LoadingStarted {
            directory: base.to_string(),
        });

        let loader = ListLoader {
            share: inner.share.as_ref(),
            tokens: &inner.tokens,
            abort: abort.clone(),
            list_date: Utc::now().timestamp(),
        };

        match loader.merge_partial(&inner.root, &mut st.base_dirs, payload, base) {
            Ok(count) => {
                Self::set_state(inner, &mut st, LifecycleState::Loaded);

                if change_dir {
                    if let Some(dir) = find_directory(&inner.root, base) {
                        Self::update_location(&mut st, &dir);
                        inner.listeners.emit(&ListingEvent::ChangeDirectory {
                            path: st.location.path.clone(),
                        });
                    }
                }

                inner.listeners.emit(&ListingEvent::LoadingFinished {
                    directory: normalize_path(base),
                    dirs_loaded: count,
                    reload: reload_all,
                    change_dir,
                });
            }
            Err(e) if e.is_abort() => trace!("Partial load aborted by close()"),
            Err(e) => Self::loading_failed(inner, &e),
        }
    }

    fn loading_failed(inner: &Arc<ListingInner>, e: &ListingError) {
        warn!(error = %e, "List load failed");
        inner.listeners.emit(&ListingEvent::LoadingFailed {
            reason: e.to_string(),
        });
    }

    fn match_adl_impl(inner: &Arc<ListingInner>, abort: &CancellationToken) {
        let rules = inner.adl.rules();
        if rules.is_empty() {
            return;
        }

        match match_listing(
            &inner.root,
            &rules,
            &inner.tokens,
            abort,
            Utc::now().timestamp(),
        ) {
            Ok(matches) => {
                if matches > 0 {
                    Self::status(
                        inner,
                        Severity::Info,
                        format!("Auto-download rules matched {matches} item(s)"),
                    );
                }
            }
            Err(e) if e.is_abort() => trace!("ADL match aborted by close()"),
            Err(e) => Self::status(inner, Severity::Error, e.to_string()),
        }
    }

    async fn search_impl(inner: &Arc<ListingInner>, abort: &CancellationToken, query: SearchQuery) {
        let mut guard = inner.state.lock().await;
        let st = &mut *guard;

        st.results.clear();
        st.cursor = None;
        st.cur_search = Some(query.clone());

        if inner.partial_list {
            let token = nanoid::nanoid!();
            match inner.searcher.send_search(&token, &query).await {
                Ok(()) => {
                    st.live = Some(LiveSearch::new(
                        token.clone(),
                        inner.config.search.max_results,
                    ));
                    inner.listeners.emit(&ListingEvent::SearchStarted { token });
                }
                Err(e) => Self::status(
                    inner,
                    Severity::Error,
                    ListingError::search_failed(e.to_string()).to_string(),
                ),
            }
            return;
        }

        let target = if query.target.is_empty() {
            Some(DirPtr::clone(&inner.root))
        } else {
            find_directory(&inner.root, &query.target)
        };

        let Some(dir) = target else {
            inner.listeners.emit(&ListingEvent::SearchEnded {
                timed_out: false,
                result_count: 0,
            });
            return;
        };

        match search_tree(&dir, &query, &mut st.results, abort) {
            Ok(()) => {
                inner.listeners.emit(&ListingEvent::SearchEnded {
                    timed_out: false,
                    result_count: st.results.len(),
                });
            }
            Err(e) if e.is_abort() => trace!("In-tree search aborted by close()"),
            Err(e) => Self::status(inner, Severity::Error, e.to_string()),
        }
    }

    fn end_search(inner: &Arc<ListingInner>, st: &mut ListingState, timed_out: bool) {
        st.live = None;
        inner.listeners.emit(&ListingEvent::SearchEnded {
            timed_out,
            result_count: st.results.len(),
        });
    }

    async fn download_impl(
        inner: &Arc<ListingInner>,
        remote_dir: &str,
        target: &str,
        priority: Priority,
        auto_search: Option<u64>,
    ) {
        let mut st = inner.state.lock().await;

        let Some(dir) = find_directory(&inner.root, remote_dir) else {
            Self::status(
                inner,
                Severity::Error,
                ListingError::not_found(remote_dir).to_string(),
            );
            return;
        };

        match download_directory(inner.queue.as_ref(), &dir, target, priority, auto_search).await {
            Ok((Some(token), summary)) => {
                st.queue_token = Some(token);
                let total: u64 = dir.read().total_size(false);
                Self::status(
                    inner,
                    Severity::Info,
                    format!(
                        "Queued {} file(s) ({}), {} skipped",
                        summary.collected,
                        bytesize::ByteSize::b(total),
                        summary.skipped_queued
                    ),
                );
            }
            Ok((None, summary)) => {
                Self::status(
                    inner,
                    Severity::Info,
                    format!(
                        "Nothing to queue: {} file(s) already queued or finished",
                        summary.skipped_queued
                    ),
                );
            }
            Err(e) => Self::status(inner, Severity::Error, e.to_string()),
        }
    }
}

/// Directory containing a search hit: files map to their parent directory,
/// directory hits map to themselves.
fn containing_directory(path: &str) -> String {
    if path.ends_with('/') {
        return path.to_string();
    }
    match path.rfind('/') {
        Some(idx) => path[..=idx].to_string(),
        None => String::from("/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::BundleFileInfo;
    use crate::events::ListingEvent;
    use crate::model::dupe::DupeStatus;
    use crate::model::tree::ContentHash;
    use crate::search::TypeFilter;
    use crate::services::NoAdlRules;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const FULL: &str = r#"{
        "base": "/",
        "complete": true,
        "directories": [
            { "name": "Music", "complete": true, "files": [
                { "name": "a.mp3", "size": 100, "tth": "H1" },
                { "name": "b.mp3", "size": 200, "tth": "H2" }
            ]},
            { "name": "Video", "complete": true, "files": [
                { "name": "clip.mkv", "size": 5000, "tth": "H3" }
            ]}
        ]
    }"#;

    #[derive(Default)]
    struct StubShare {
        dupes: HashMap<String, DupeStatus>,
    }

    impl ShareService for StubShare {
        fn is_dupe_of(&self, hash: &ContentHash) -> DupeStatus {
            self.dupes
                .get(hash.as_str())
                .copied()
                .unwrap_or(DupeStatus::None)
        }
    }

    #[derive(Default)]
    struct StubQueue {
        calls: PlMutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl QueueService for StubQueue {
        async fn create_bundle(
            &self,
            target: &str,
            files: Vec<BundleFileInfo>,
            _priority: Priority,
            _auto_search: Option<u64>,
        ) -> Result<QueueToken, ListingError> {
            self.calls.lock().push((target.to_string(), files.len()));
            Ok(QueueToken(7))
        }
    }

    #[derive(Default)]
    struct StubSearcher {
        sent: PlMutex<Vec<String>>,
    }

    #[async_trait]
    impl SearchService for StubSearcher {
        async fn send_search(
            &self,
            token: &str,
            _query: &SearchQuery,
        ) -> Result<(), ListingError> {
            self.sent.lock().push(token.to_string());
            Ok(())
        }
    }

    struct Fixture {
        listing: DirectoryListing,
        events: UnboundedReceiver<ListingEvent>,
        queue: Arc<StubQueue>,
        searcher: Arc<StubSearcher>,
    }

    fn fixture(partial: bool, share: StubShare, config: ListingConfig) -> Fixture {
        let queue = Arc::new(StubQueue::default());
        let searcher = Arc::new(StubSearcher::default());
        let listing = DirectoryListing::new(
            PeerIdentity {
                cid: String::from("CID123"),
                nick: String::from("peer"),
                hub_url: String::from("example://hub"),
            },
            partial,
            String::from("peer.CID123.json"),
            config,
            Arc::new(share),
            Arc::clone(&queue) as Arc<dyn QueueService>,
            Arc::clone(&searcher) as Arc<dyn SearchService>,
            Arc::new(NoAdlRules),
        );
        let events = listing.subscribe();
        Fixture {
            listing,
            events,
            queue,
            searcher,
        }
    }

    fn drain(events: &mut UnboundedReceiver<ListingEvent>) -> Vec<ListingEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn full_load_transitions_and_counts() {
        let mut fx = fixture(false, StubShare::default(), ListingConfig::default());

        assert_eq!(fx.listing.state().await, LifecycleState::DownloadPending);
        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;

        assert_eq!(fx.listing.state().await, LifecycleState::Loaded);
        assert_eq!(fx.listing.total_file_count(false), 3);
        assert_eq!(fx.listing.total_list_size(false), 5300);
        assert_eq!(fx.listing.dir_size("/Video/"), Some(5000));
        assert_eq!(fx.listing.dir_size("/Nope/"), None);

        let events = drain(&mut fx.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ListingEvent::LoadingStarted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ListingEvent::LoadingFinished { dirs_loaded: 2, .. })));

        let location = fx.listing.current_location().await;
        assert_eq!(location.path, "/");
        assert_eq!(location.files, 3);
    }

    #[tokio::test]
    async fn malformed_payload_reports_loading_failed() {
        let mut fx = fixture(false, StubShare::default(), ListingConfig::default());

        fx.listing.add_full_list_task(String::from("{ broken"));
        fx.listing.wait_idle().await;

        let events = drain(&mut fx.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ListingEvent::LoadingFailed { .. })));
    }

    #[tokio::test]
    async fn close_discards_pending_load_and_emits_closing() {
        let mut fx = fixture(false, StubShare::default(), ListingConfig::default());

        // A slow task keeps the drain loop busy so the load stays queued.
        fx.listing.add_async_task(|token| async move {
            for _ in 0..200 {
                if token.is_cancelled() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        fx.listing.add_full_list_task(FULL.to_string());

        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.listing.close();
        fx.listing.wait_idle().await;

        assert!(!fx.listing.is_open());
        assert_eq!(fx.listing.total_file_count(false), 0);
        assert!(
            drain(&mut fx.events)
                .iter()
                .any(|e| matches!(e, ListingEvent::Closing))
        );

        // Nothing runs after close.
        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;
        assert_eq!(fx.listing.total_file_count(false), 0);
    }

    #[tokio::test]
    async fn in_tree_search_and_cursor_paging() {
        let mut fx = fixture(false, StubShare::default(), ListingConfig::default());

        // Empty result set: next_result is a failure outcome.
        assert_eq!(fx.listing.next_result(false).await, None);

        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;
        drain(&mut fx.events);

        let query = SearchQuery {
            type_filter: TypeFilter::File,
            ..SearchQuery::default()
        };
        fx.listing.add_search_task(query);
        fx.listing.wait_idle().await;

        assert_eq!(fx.listing.result_count().await, 3);

        let first = fx.listing.next_result(false).await.unwrap();
        assert_eq!(first, "/Music/a.mp3");
        assert!(fx.listing.is_current_search_path("/Music/a.mp3").await);

        let second = fx.listing.next_result(false).await.unwrap();
        assert_eq!(second, "/Music/b.mp3");

        // Cursor moves the browse position to the containing directory.
        assert_eq!(fx.listing.current_location().await.path, "/Music/");

        let back = fx.listing.next_result(true).await.unwrap();
        assert_eq!(back, "/Music/a.mp3");

        // Clamped at the start.
        assert_eq!(fx.listing.next_result(true).await.unwrap(), "/Music/a.mp3");
    }

    #[tokio::test]
    async fn live_search_times_out_after_quiet_period() {
        let mut config = ListingConfig::default();
        config.search.timeout = Duration::ZERO;

        let mut fx = fixture(true, StubShare::default(), config);

        fx.listing
            .add_search_task(SearchQuery::for_terms(vec![String::from("clip")], "/"));
        fx.listing.wait_idle().await;

        let token = fx.searcher.sent.lock().first().cloned().unwrap();
        fx.listing
            .on_search_result(&token, String::from("/Video/clip.mkv"));
        fx.listing.wait_idle().await;
        assert_eq!(fx.listing.result_count().await, 1);

        // Two ticks later the quiet period is exceeded.
        fx.listing.on_timer_tick();
        fx.listing.on_timer_tick();
        fx.listing.wait_idle().await;

        let events = drain(&mut fx.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ListingEvent::SearchEnded {
                timed_out: true,
                result_count: 1
            }
        )));
        assert_eq!(fx.listing.result_count().await, 1);
    }

    #[tokio::test]
    async fn live_search_ignores_mismatched_tokens_and_caps_results() {
        let mut config = ListingConfig::default();
        config.search.timeout = Duration::from_secs(600);
        config.search.max_results = 2;

        let mut fx = fixture(true, StubShare::default(), config);
        fx.listing
            .add_search_task(SearchQuery::for_terms(vec![], "/"));
        fx.listing.wait_idle().await;
        let token = fx.searcher.sent.lock().first().cloned().unwrap();

        fx.listing.on_search_result("bogus", String::from("/x"));
        fx.listing.on_search_result(&token, String::from("/a"));
        fx.listing.on_search_result(&token, String::from("/b"));
        fx.listing.on_search_result(&token, String::from("/c"));
        fx.listing.wait_idle().await;

        assert_eq!(fx.listing.result_count().await, 2);
        let events = drain(&mut fx.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ListingEvent::SearchEnded {
                timed_out: false,
                result_count: 2
            }
        )));
    }

    #[tokio::test]
    async fn download_records_and_clears_queue_token() {
        let mut fx = fixture(false, StubShare::default(), ListingConfig::default());
        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;

        fx.listing.add_directory_download_task(
            String::from("/Video/"),
            String::from("/downloads/Video"),
            Priority::Default,
            None,
        );
        fx.listing.wait_idle().await;

        assert_eq!(fx.listing.queue_token().await, Some(QueueToken(7)));
        assert_eq!(fx.queue.calls.lock().len(), 1);

        fx.listing.on_queue_removed(String::from("/downloads/Video"));
        fx.listing.wait_idle().await;
        assert_eq!(fx.listing.queue_token().await, None);

        let events = drain(&mut fx.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, ListingEvent::RemovedQueue { .. })));
    }

    #[tokio::test]
    async fn download_of_missing_directory_reports_not_found() {
        let mut fx = fixture(false, StubShare::default(), ListingConfig::default());
        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;
        drain(&mut fx.events);

        fx.listing.add_directory_download_task(
            String::from("/Nope/"),
            String::from("/downloads/Nope"),
            Priority::Default,
            None,
        );
        fx.listing.wait_idle().await;

        assert!(fx.queue.calls.lock().is_empty());
        assert_eq!(fx.listing.queue_token().await, None);

        let events = drain(&mut fx.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ListingEvent::StatusMessage {
                text,
                severity: Severity::Error
            } if text.contains("/Nope/")
        )));
    }

    #[tokio::test]
    async fn failed_search_dispatch_reports_status_error() {
        struct OfflineSearcher;

        #[async_trait]
        impl SearchService for OfflineSearcher {
            async fn send_search(
                &self,
                _token: &str,
                _query: &SearchQuery,
            ) -> Result<(), ListingError> {
                Err(ListingError::Other(String::from("peer offline")))
            }
        }

        let listing = DirectoryListing::new(
            PeerIdentity {
                cid: String::from("CID123"),
                nick: String::from("peer"),
                hub_url: String::from("example://hub"),
            },
            true,
            String::from("peer.CID123.json"),
            ListingConfig::default(),
            Arc::new(StubShare::default()),
            Arc::new(StubQueue::default()),
            Arc::new(OfflineSearcher),
            Arc::new(NoAdlRules),
        );
        let mut events = listing.subscribe();

        listing.add_search_task(SearchQuery::for_terms(vec![String::from("x")], "/"));
        listing.wait_idle().await;

        let got = drain(&mut events);
        assert!(!got
            .iter()
            .any(|e| matches!(e, ListingEvent::SearchStarted { .. })));
        assert!(got.iter().any(|e| matches!(
            e,
            ListingEvent::StatusMessage {
                text,
                severity: Severity::Error
            } if text.contains("peer offline")
        )));
    }

    #[tokio::test]
    async fn finished_files_skip_bundle_creation_entirely() {
        let share = StubShare {
            dupes: HashMap::from([(String::from("H3"), DupeStatus::Finished)]),
        };
        let fx = fixture(false, share, ListingConfig::default());

        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;

        fx.listing.add_directory_download_task(
            String::from("/Video/"),
            String::from("/downloads/Video"),
            Priority::Default,
            None,
        );
        fx.listing.wait_idle().await;

        assert!(fx.queue.calls.lock().is_empty());
        assert_eq!(fx.listing.queue_token().await, None);
    }

    #[tokio::test]
    async fn change_directory_outcomes() {
        let mut fx = fixture(false, StubShare::default(), ListingConfig::default());
        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;
        drain(&mut fx.events);

        assert!(fx.listing.change_directory("/Music/", ReloadMode::None).await);
        let location = fx.listing.current_location().await;
        assert_eq!(location.path, "/Music/");
        assert_eq!(location.files, 2);
        assert_eq!(location.size, 300);

        assert!(!fx.listing.change_directory("/Nope/", ReloadMode::None).await);

        assert!(fx.listing.change_directory("/Video/", ReloadMode::Dir).await);
        let events = drain(&mut fx.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ListingEvent::ReloadRequested {
                reload_all: false,
                ..
            }
        )));

        fx.listing.close();
        assert!(!fx.listing.change_directory("/Music/", ReloadMode::None).await);
    }

    #[tokio::test]
    async fn share_refresh_triggers_dupe_recheck() {
        let share = StubShare {
            dupes: HashMap::from([
                (String::from("H1"), DupeStatus::Share),
                (String::from("H2"), DupeStatus::Share),
            ]),
        };
        let mut fx = fixture(false, share, ListingConfig::default());

        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;

        fx.listing.on_share_refreshed();
        fx.listing.wait_idle().await;

        let music = fx.listing.find_directory("/Music/").unwrap();
        assert_eq!(music.read().dupe, DupeStatus::Share);
        let video = fx.listing.find_directory("/Video/").unwrap();
        assert_eq!(video.read().dupe, DupeStatus::None);

        assert!(
            drain(&mut fx.events)
                .iter()
                .any(|e| matches!(e, ListingEvent::DupesChecked))
        );
    }

    #[tokio::test]
    async fn transport_events_drive_state_machine() {
        let fx = fixture(false, StubShare::default(), ListingConfig::default());

        fx.listing.on_download_starting("peer.CID123.json");
        fx.listing.wait_idle().await;
        assert_eq!(fx.listing.state().await, LifecycleState::Downloading);

        fx.listing
            .on_download_failed("peer.CID123.json", String::from("connection reset"));
        fx.listing.wait_idle().await;
        assert_eq!(fx.listing.state().await, LifecycleState::DownloadPending);

        // Events for other list files are ignored.
        fx.listing.on_download_starting("other.X.json");
        fx.listing.wait_idle().await;
        assert_eq!(fx.listing.state().await, LifecycleState::DownloadPending);
    }

    #[tokio::test]
    async fn list_diff_keeps_only_shared_files() {
        let fx = fixture(false, StubShare::default(), ListingConfig::default());
        fx.listing.add_full_list_task(FULL.to_string());
        fx.listing.wait_idle().await;

        let other = fixture(false, StubShare::default(), ListingConfig::default());
        let other_payload = r#"{ "complete": true, "directories": [
            { "name": "Video", "complete": true, "files": [
                { "name": "clip.mkv", "size": 5000, "tth": "H3" }
            ]}
        ]}"#;
        other.listing.add_full_list_task(other_payload.to_string());
        other.listing.wait_idle().await;

        fx.listing.add_list_diff_task(other.listing.root());
        fx.listing.wait_idle().await;

        assert_eq!(fx.listing.total_file_count(false), 1);
        assert!(fx.listing.find_directory("/Music/").is_none());
        assert!(fx.listing.find_directory("/Video/").is_some());
    }

    #[test]
    fn list_file_name_helpers() {
        assert_eq!(nick_from_filename("Alice.ABCD1234.json"), "Alice");
        assert_eq!(
            cid_from_filename("Alice.ABCD1234.json").as_deref(),
            Some("ABCD1234")
        );
        assert_eq!(nick_from_filename("bare"), "bare");
        assert_eq!(cid_from_filename("bare"), None);
    }
}
