//! ``src/services.rs``
//! ============================================================================
//! # Collaborator Interfaces
//!
//! The listing engine consumes a handful of external services through narrow
//! trait seams: the local share (dupe checks), the download queue (bundle
//! creation), the network search dispatcher, and the auto-download rule
//! store. Hashing, wire IO and rendering all live behind these boundaries;
//! the engine never implements them.

use async_trait::async_trait;

use crate::adl::AdlRule;
use crate::download::{BundleFileInfo, Priority};
use crate::error::ListingError;
use crate::model::dupe::DupeStatus;
use crate::model::tree::ContentHash;
use crate::search::SearchQuery;

/// Queue-side identifier of a created bundle, kept on the listing until the
/// queue reports the bundle's removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueToken(pub u64);

/// Local share lookups. Implementations are expected to be cheap; the
/// dupe-recheck walk calls this once per file.
pub trait ShareService: Send + Sync {
    fn is_dupe_of(&self, hash: &ContentHash) -> DupeStatus;
}

/// Download queue: accepts one atomic bundle request for a flat file set.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn create_bundle(
        &self,
        target: &str,
        files: Vec<BundleFileInfo>,
        priority: Priority,
        auto_search: Option<u64>,
    ) -> Result<QueueToken, ListingError>;
}

/// Outbound network search. Results come back asynchronously through
/// `DirectoryListing::on_search_result`, correlated by token.
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn send_search(&self, token: &str, query: &SearchQuery) -> Result<(), ListingError>;
}

/// Store of user-defined auto-download rules, consumed by the ADL matcher.
pub trait AdlProvider: Send + Sync {
    fn rules(&self) -> Vec<AdlRule>;
}

/// Share service that never reports a dupe. Useful for listings browsed
/// without a local share attached, and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShare;

impl ShareService for NoShare {
    fn is_dupe_of(&self, _hash: &ContentHash) -> DupeStatus {
        DupeStatus::None
    }
}

/// Rule provider with no rules configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAdlRules;

impl AdlProvider for NoAdlRules {
    fn rules(&self) -> Vec<AdlRule> {
        Vec::new()
    }
}
