//! Organization repositories and issues, mirrored into a local cache.
//!
//! Provides the remote client, the SQLite-backed store and the
//! stale-while-revalidate coordinator that ties them together.

pub mod client;
pub mod store;
pub mod sync;
pub mod types;

pub use client::{GitHubClient, RemoteSource};
pub use store::{CacheScope, LocalStore, Observation, Snapshot};
pub use sync::{LoadStream, RefreshStatus, SyncCoordinator};
pub use types::{
    Issue, IssueAuthor, IssueState, IssuesScope, RepositoriesScope, RepositorySummary, PAGE_SIZE,
};
