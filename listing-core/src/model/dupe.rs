//! ``src/model/dupe.rs``
//! ============================================================================
//! # `DupeStatus`: Classification Against the Local Share and Queue
//!
//! Every file and directory in a remote listing is classified relative to
//! the local share and the download queue. The status is computed by the
//! share collaborator when nodes are inserted and can be recomputed in bulk
//! after a share refresh.

use serde::{Deserialize, Serialize};

/// Dupe classification of a remote file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DupeStatus {
    /// Not present locally in any form.
    #[default]
    None,

    /// Some, but not all, of the content exists in the local share.
    PartialShare,

    /// Fully present in the local share.
    Share,

    /// Currently in the download queue.
    Queue,

    /// Download finished but not yet moved into the share.
    Finished,
}

impl DupeStatus {
    #[must_use]
    /// True if the content is already queued or downloaded; such files are
    /// skipped when a subtree is turned into a bundle request.
    pub const fn is_queued(self) -> bool {
        matches!(self, Self::Queue | Self::Finished)
    }

    #[must_use]
    /// True if the content exists in the local share, fully or partially.
    pub const fn is_shared(self) -> bool {
        matches!(self, Self::Share | Self::PartialShare)
    }
}

impl std::fmt::Display for DupeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: &'_ str = match self {
            Self::None => "none",
            Self::PartialShare => "partial_share",
            Self::Share => "share",
            Self::Queue => "queue",
            Self::Finished => "finished",
        };

        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_states() {
        assert!(DupeStatus::Queue.is_queued());
        assert!(DupeStatus::Finished.is_queued());
        assert!(!DupeStatus::Share.is_queued());
        assert!(!DupeStatus::None.is_queued());
    }

    #[test]
    fn shared_states() {
        assert!(DupeStatus::Share.is_shared());
        assert!(DupeStatus::PartialShare.is_shared());
        assert!(!DupeStatus::Queue.is_shared());
    }
}
