pub mod client;
pub mod cookies;
pub mod decoder;
pub mod error;
pub mod fetch;
pub mod iterator;
pub mod memo;
pub mod models;
pub mod search;
pub mod version;

pub use client::{
    AttachmentStream, CredentialSource, EnvCredentials, Session, SessionState, StaticCredentials,
    TrackerConfig,
};
pub use error::Error;
pub use models::*;

// Session building blocks
pub use cookies::{Cookie, CookieJar};
pub use version::{DEFAULT_MIN_VERSION, ServerVersion, VersionRange};

// Bulk export pipeline re-exports
pub use decoder::{DecodeSummary, IssueDecoder, Termination};
pub use fetch::BulkFetch;
pub use iterator::{IssueIterator, QUEUE_CAPACITY};
pub use memo::{MetadataCache, Memoizer};
pub use search::extract_issue_ids;
