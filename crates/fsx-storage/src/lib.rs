//! Persistence and HTTP plumbing: the SQLite job store, the append-only match cache,
//! the raw payload archive and a retrying JSON client for external services.

mod artifacts;
mod cache;
mod http;
mod store;

pub use artifacts::{ArchivedPayload, ArtifactStore};
pub use cache::{MatchCache, MemoryMatchCache, NewMatchEntry};
pub use http::{is_transient_status, BackoffPolicy, FetchError, HttpClientConfig, JsonHttpClient};
pub use store::{JobRecord, Store, StoreError, StoredPage};

pub const CRATE_NAME: &str = "fsx-storage";
