//! src/error.rs
//! ============================================================================
//! # `ListingError`: Unified Error Type for the Listing Engine
//!
//! This module defines the error enum used across the whole crate. Each
//! variant carries enough context for diagnostics, and all fallible listing
//! operations return `Result<T, ListingError>`.
//!
//! Two variants deserve special care:
//! - `Parse` is a structural failure: the whole load call fails and the tree
//!   keeps only the branches committed by earlier calls.
//! - `Aborted` is raised when `close()` interrupts a running task. It must
//!   unwind without side effects and is never reported to the user as an
//!   error.

use std::io;
use thiserror::Error;

/// Unified error type for all listing-engine operations.
#[derive(Debug, Error)]
pub enum ListingError {
    /// Standard IO error, auto-converted from `io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or truncated listing payload.
    #[error("Payload parse error: {reason}")]
    Parse { reason: String },

    /// A running task observed the close signal and unwound.
    #[error("Operation was aborted")]
    Aborted,

    /// Directory or path lookup that found nothing.
    #[error("Path not found in list: {0}")]
    NotFound(String),

    /// Bundle creation rejected by the queue collaborator.
    #[error("Bundle creation failed for {target}: {reason}")]
    Bundle { target: String, reason: String },

    /// Live search could not be dispatched.
    #[error("Search dispatch failed: {reason}")]
    SearchFailed { reason: String },

    /// TOML config parsing error.
    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// Task rejected because the listing is closed.
    #[error("Listing is closed")]
    Closed,

    /// Any other error, with description.
    #[error("Unexpected error: {0}")]
    Other(String),
}

impl ListingError {
    /// Create a payload parse error.
    pub fn parse<S: Into<String>>(reason: S) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a not-found outcome for a path lookup.
    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a bundle failure error.
    pub fn bundle<S1: Into<String>, S2: Into<String>>(target: S1, reason: S2) -> Self {
        Self::Bundle {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a search dispatch error.
    pub fn search_failed<S: Into<String>>(reason: S) -> Self {
        Self::SearchFailed {
            reason: reason.into(),
        }
    }

    #[must_use]
    /// True for the abort outcome raised by `close()`. Callers converting
    /// task results into listener notifications must swallow these.
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted | Self::Closed)
    }
}

// Allow conversion from `anyhow::Error` as fallback.
impl From<anyhow::Error> for ListingError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(e.to_string())
    }
}
