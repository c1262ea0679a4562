pub mod error;

pub mod config;

pub mod model {
    pub mod dupe;
    pub use dupe::DupeStatus;

    pub mod tree;
    pub use tree::{
        ContentHash, DirPtr, DirType, Directory, FileEntry, NodeToken, TokenSource, dir_path,
        find_directory,
    };
}

pub mod dispatch {
    pub mod task_queue;
    pub use task_queue::TaskDispatcher;
}

pub mod loader;
pub use loader::{DirMap, ListLoader, ListingPayload};

pub mod search;
pub use search::{LiveSearch, SearchQuery, SizeMode, TypeFilter};

pub mod adl;
pub use adl::{AdlRule, AdlTarget};

pub mod download;
pub use download::{BundleFileInfo, DownloadSummary, Priority};

pub mod events;
pub use events::{ListenerHub, ListingEvent, Severity};

pub mod services;
pub use services::{AdlProvider, QueueService, QueueToken, SearchService, ShareService};

pub mod listing;
pub use listing::{DirectoryListing, LifecycleState, LocationInfo, PeerIdentity, ReloadMode};

pub mod logging;
pub use logging::Logger;

pub use error::ListingError;
