//! ``src/events.rs``
//! ============================================================================
//! # Listing Events: Listener Surface for Presentation/API Layers
//!
//! Lifecycle changes, load progress, search activity and status messages are
//! emitted as `ListingEvent` values. Consumers register independently (one
//! channel per subscriber) and each receives every event in emission order;
//! payloads carry only paths, counts and tokens, never transport details.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::listing::LifecycleState;

/// Message severity for user-facing status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Event emitted by a listing as a side effect of task completion.
#[derive(Debug, Clone)]
pub enum ListingEvent {
    /// Lifecycle state machine moved.
    StateChanged { state: LifecycleState },

    /// A load task started processing `directory`.
    LoadingStarted { directory: String },

    /// A load task committed its result.
    LoadingFinished {
        directory: String,
        dirs_loaded: usize,
        reload: bool,
        change_dir: bool,
    },

    /// A load task failed with a structural error. Aborts are not reported.
    LoadingFailed { reason: String },

    /// The browse position moved.
    ChangeDirectory { path: String },

    /// A browse action asked for content the engine does not have; the
    /// transport collaborator is expected to fetch the branch.
    ReloadRequested { path: String, reload_all: bool },

    /// A live search was dispatched under `token`.
    SearchStarted { token: String },

    /// One result was appended to the ordered result set.
    SearchResultAdded { path: String },

    /// The active search ended, by timeout or by hitting the result cap.
    SearchEnded {
        timed_out: bool,
        result_count: usize,
    },

    /// Dupe statuses were recomputed against the share.
    DupesChecked,

    /// Peer presence changed.
    UserUpdated { online: bool },

    /// The queue reported removal of the bundle this listing created.
    RemovedQueue { directory: String },

    /// Free-form status line for the user.
    StatusMessage { text: String, severity: Severity },

    /// The listing is shutting down; no further events follow.
    Closing,
}

/// Fan-out hub: independent observer registrations, each delivering into its
/// own unbounded channel. Dead receivers are pruned on emit.
#[derive(Debug, Default)]
pub struct ListenerHub {
    senders: parking_lot::Mutex<Vec<UnboundedSender<ListingEvent>>>,
}

impl ListenerHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Events emitted after this call are
    /// delivered in order.
    pub fn subscribe(&self) -> UnboundedReceiver<ListingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn emit(&self, event: &ListingEvent) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}
