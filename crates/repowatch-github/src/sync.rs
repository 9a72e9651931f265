//! Stale-while-revalidate loading.
//!
//! A load subscribes the caller to the local store and, in a detached task,
//! fetches fresh rows and replaces the scope. Consumers only ever see what
//! the store emits. A failed fetch reaches the caller only when the scope
//! has never been populated; otherwise it is logged and dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use repowatch_core::{DatabaseError, RemoteError, SyncConfig, SyncError};

use crate::client::RemoteSource;
use crate::store::{CacheScope, LocalStore, Observation};
use crate::types::{IssuesScope, RepositoriesScope, RepositorySummary};

type Outcome = Option<Result<usize, SyncError>>;

/// Progress of the background refresh started by a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshStatus {
    InFlight,
    /// The scope was replaced with this many rows.
    Committed(usize),
    /// The fetch failed but cached rows exist, so the stream carries on with them.
    Suppressed(SyncError),
    /// The fetch failed and there was nothing cached; the stream yields the error.
    Surfaced(SyncError),
}

/// Drives fetch-then-replace for cache scopes.
#[derive(Clone)]
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    coalesce: bool,
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Outcome>>>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<LocalStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            coalesce: config.coalesce_refreshes,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Fetch rows for `scope` and replace the cached set with them.
    ///
    /// Without coalescing every call fetches on its own and the last replace
    /// to commit wins. With coalescing, a call that finds a refresh of the
    /// same scope already running waits for it and shares its outcome
    /// instead of fetching again.
    pub async fn refresh<S, F, Fut>(&self, scope: &S, fetch: F) -> Result<usize, SyncError>
    where
        S: CacheScope,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<S::Row>, RemoteError>>,
    {
        if !self.coalesce {
            return self.fetch_and_replace(scope, fetch).await;
        }

        let key = scope.key();
        let leader = loop {
            let mut follower = {
                let mut inflight = self.inflight.lock();
                match inflight.get(&key) {
                    Some(receiver) => receiver.clone(),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        inflight.insert(key.clone(), receiver);
                        break sender;
                    }
                }
            };

            tracing::debug!("Joining in-flight refresh of {}", key);
            let outcome = follower
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| (*outcome).clone());
            if let Some(result) = outcome {
                return result;
            }
            // The leader was dropped before finishing; take over.
        };

        let _guard = InflightGuard {
            table: Arc::clone(&self.inflight),
            key,
        };
        let result = self.fetch_and_replace(scope, fetch).await;
        leader.send_replace(Some(result.clone()));
        result
    }

    async fn fetch_and_replace<S, F, Fut>(&self, scope: &S, fetch: F) -> Result<usize, SyncError>
    where
        S: CacheScope,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<S::Row>, RemoteError>>,
    {
        let rows = fetch().await?;
        let count = rows.len();

        let store = Arc::clone(&self.store);
        let scope = scope.clone();
        tokio::task::spawn_blocking(move || store.replace(&scope, &rows))
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))??;

        Ok(count)
    }

    /// Subscribe to `scope` and refresh it in the background.
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// stream stops emissions but never cancels the refresh.
    pub fn load<S, F, Fut>(&self, scope: S, fetch: F) -> LoadStream<S>
    where
        S: CacheScope,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<S::Row>, RemoteError>> + Send + 'static,
    {
        let observation = self.store.observe(scope.clone());
        let (status_tx, status_rx) = watch::channel(RefreshStatus::InFlight);
        let coordinator = self.clone();

        tokio::spawn(async move {
            let key = scope.key();
            let status = match coordinator.refresh(&scope, fetch).await {
                Ok(count) => {
                    tracing::info!("Refreshed {} with {} rows", key, count);
                    RefreshStatus::Committed(count)
                }
                Err(error) => {
                    if coordinator.has_fallback(&scope).await {
                        tracing::warn!("Refresh of {} failed, serving cached rows: {}", key, error);
                        RefreshStatus::Suppressed(error)
                    } else {
                        tracing::error!("Refresh of {} failed with nothing cached: {}", key, error);
                        RefreshStatus::Surfaced(error)
                    }
                }
            };
            status_tx.send_replace(status);
        });

        LoadStream {
            observation,
            status: status_rx,
            status_closed: false,
            emitted: false,
        }
    }

    async fn has_fallback<S: CacheScope>(&self, scope: &S) -> bool {
        let store = Arc::clone(&self.store);
        let scope = scope.clone();
        matches!(
            tokio::task::spawn_blocking(move || store.last_synced(&scope)).await,
            Ok(Ok(Some(_)))
        )
    }

    /// Load an organization's repositories.
    pub fn load_repositories(
        &self,
        remote: Arc<dyn RemoteSource>,
        organization: &str,
    ) -> LoadStream<RepositoriesScope> {
        let org = organization.to_string();
        self.load(RepositoriesScope::new(organization), move || async move {
            remote.fetch_org_repositories(&org).await
        })
    }

    /// Load one repository's issues in the scope's state.
    pub fn load_issues(
        &self,
        remote: Arc<dyn RemoteSource>,
        scope: IssuesScope,
    ) -> LoadStream<IssuesScope> {
        let target = scope.clone();
        self.load(scope, move || async move {
            remote
                .fetch_issues(&target.organization, &target.repo_name, target.state)
                .await
        })
    }

    /// Look a repository up in the cache, falling back to the remote.
    ///
    /// A remotely fetched repository is returned but not cached.
    pub async fn repository_detail(
        &self,
        organization: &str,
        name: &str,
        remote: &dyn RemoteSource,
    ) -> Result<RepositorySummary, SyncError> {
        let store = Arc::clone(&self.store);
        let (org, repo) = (organization.to_string(), name.to_string());
        let cached = tokio::task::spawn_blocking(move || store.read_repository(&org, &repo))
            .await
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))??;

        if let Some(repository) = cached {
            tracing::debug!("Serving {}/{} from cache", organization, name);
            return Ok(repository);
        }

        Ok(remote.fetch_repository(organization, name).await?)
    }
}

struct InflightGuard {
    table: Arc<Mutex<HashMap<String, watch::Receiver<Outcome>>>>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
    }
}

/// Rows of one scope as they are committed, plus a surfaced refresh error.
pub struct LoadStream<S: CacheScope> {
    observation: Observation<S>,
    status: watch::Receiver<RefreshStatus>,
    status_closed: bool,
    emitted: bool,
}

impl<S: CacheScope> LoadStream<S> {
    /// Next item of the stream.
    ///
    /// A populated scope yields its cached rows first. A never-populated
    /// scope yields nothing until its first replace commits, or yields the
    /// refresh error if that fetch fails. Once rows have been yielded, a
    /// cleared scope yields an empty list. Returns `None` once the store is
    /// gone.
    pub async fn next(&mut self) -> Option<Result<Vec<S::Row>, SyncError>> {
        loop {
            tokio::select! {
                biased;

                changed = self.status.changed(), if !self.status_closed => {
                    if changed.is_err() {
                        self.status_closed = true;
                        continue;
                    }
                    let surfaced = match &*self.status.borrow_and_update() {
                        RefreshStatus::Surfaced(error) => Some(error.clone()),
                        _ => None,
                    };
                    if let Some(error) = surfaced {
                        return Some(Err(error));
                    }
                }

                snapshot = self.observation.next() => {
                    match snapshot? {
                        Ok(snapshot) if snapshot.is_populated() || self.emitted => {
                            self.emitted = true;
                            return Some(Ok(snapshot.rows));
                        }
                        Ok(_) => continue,
                        Err(error) => return Some(Err(error.into())),
                    }
                }
            }
        }
    }

    /// Current state of the background refresh.
    pub fn status(&self) -> RefreshStatus {
        self.status.borrow().clone()
    }

    /// Wait until the background refresh has finished one way or another.
    pub async fn refreshed(&self) -> RefreshStatus {
        let mut status = self.status.clone();
        status
            .wait_for(|s| !matches!(s, RefreshStatus::InFlight))
            .await
            .map(|s| (*s).clone())
            .unwrap_or(RefreshStatus::InFlight)
    }

    pub fn scope(&self) -> &S {
        self.observation.scope()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn repo(id: i64, name: &str) -> RepositorySummary {
        RepositorySummary {
            id,
            name: name.to_string(),
            description: None,
            language: Some("Java".to_string()),
            stars: 1,
            forks: 0,
            open_issues_count: 0,
            html_url: format!("https://github.com/intuit/{}", name),
            created_at: "2020-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            topics: BTreeSet::new(),
        }
    }

    fn coordinator(coalesce: bool) -> SyncCoordinator {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        SyncCoordinator::new(
            store,
            &SyncConfig {
                coalesce_refreshes: coalesce,
            },
        )
    }

    fn offline() -> RemoteError {
        RemoteError::Network("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_load_emits_fetched_rows() {
        let sync = coordinator(false);
        let scope = RepositoriesScope::new("intuit");

        let mut stream = sync.load(scope.clone(), || async { Ok(vec![repo(1, "a")]) });

        assert_eq!(stream.next().await, Some(Ok(vec![repo(1, "a")])));
        assert_eq!(stream.refreshed().await, RefreshStatus::Committed(1));
        assert_eq!(sync.store().read(&scope).unwrap(), vec![repo(1, "a")]);
    }

    #[tokio::test]
    async fn test_cached_rows_survive_failed_refresh() {
        let sync = coordinator(false);
        let scope = RepositoriesScope::new("intuit");
        sync.store().replace(&scope, &[repo(1, "x")]).unwrap();

        let mut stream = sync.load(scope, || async { Err(offline()) });

        assert_eq!(stream.next().await, Some(Ok(vec![repo(1, "x")])));
        assert_eq!(
            stream.refreshed().await,
            RefreshStatus::Suppressed(SyncError::Remote(offline()))
        );
        let more = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(more.is_err(), "stream emitted after a suppressed failure");
    }

    #[tokio::test]
    async fn test_fetched_empty_is_a_fallback() {
        let sync = coordinator(false);
        let scope = RepositoriesScope::new("intuit");
        sync.store().replace(&scope, &[]).unwrap();

        let mut stream = sync.load(scope, || async { Err(offline()) });

        assert_eq!(stream.next().await, Some(Ok(vec![])));
        assert!(matches!(stream.refreshed().await, RefreshStatus::Suppressed(_)));
    }

    #[tokio::test]
    async fn test_never_populated_failure_is_surfaced() {
        let sync = coordinator(false);
        let scope = RepositoriesScope::new("intuit");

        let mut stream = sync.load(scope, || async { Err(offline()) });

        assert_eq!(stream.next().await, Some(Err(SyncError::Remote(offline()))));
    }

    #[tokio::test]
    async fn test_clear_during_stream_emits_empty_rows() {
        let sync = coordinator(false);
        let scope = RepositoriesScope::new("intuit");

        let mut stream = sync.load(scope.clone(), || async { Ok(vec![repo(1, "a")]) });
        assert_eq!(stream.next().await, Some(Ok(vec![repo(1, "a")])));
        assert_eq!(stream.refreshed().await, RefreshStatus::Committed(1));

        sync.store().clear().unwrap();

        let cleared = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match stream.next().await {
                    Some(Ok(rows)) if !rows.is_empty() => continue,
                    other => break other,
                }
            }
        })
        .await
        .expect("stream did not report the cleared scope");
        assert_eq!(cleared, Some(Ok(vec![])));
        assert!(sync.store().read(&scope).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_stream_does_not_cancel_refresh() {
        let sync = coordinator(false);
        let scope = RepositoriesScope::new("intuit");
        let gate = Arc::new(Notify::new());

        let release = Arc::clone(&gate);
        let stream = sync.load(scope.clone(), move || async move {
            release.notified().await;
            Ok(vec![repo(1, "a")])
        });
        drop(stream);
        gate.notify_one();

        for _ in 0..100 {
            if sync.store().last_synced(&scope).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sync.store().read(&scope).unwrap(), vec![repo(1, "a")]);
    }

    #[tokio::test]
    async fn test_overlapping_refreshes_fetch_independently_by_default() {
        let sync = coordinator(false);
        let scope = RepositoriesScope::new("intuit");
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>, row| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, RemoteError>(vec![row])
            }
        };

        let (a, b) = tokio::join!(
            sync.refresh(&scope, fetch(Arc::clone(&calls), repo(1, "a"))),
            sync.refresh(&scope, fetch(Arc::clone(&calls), repo(2, "b"))),
        );

        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let rows = sync.store().read(&scope).unwrap();
        assert!(rows == vec![repo(1, "a")] || rows == vec![repo(2, "b")]);
    }

    #[tokio::test]
    async fn test_coalesced_refreshes_share_one_fetch() {
        let sync = coordinator(true);
        let scope = RepositoriesScope::new("intuit");
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let spawn_refresh = || {
            let sync = sync.clone();
            let scope = scope.clone();
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                sync.refresh(&scope, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(vec![repo(1, "a")])
                })
                .await
            })
        };

        let first = spawn_refresh();
        let second = spawn_refresh();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        assert_eq!(first.await.unwrap(), Ok(1));
        assert_eq!(second.await.unwrap(), Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sync.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_coalesced_failure_is_shared() {
        let sync = coordinator(true);
        let scope = RepositoriesScope::new("intuit");
        let gate = Arc::new(Notify::new());

        let leader = {
            let sync = sync.clone();
            let scope = scope.clone();
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                sync.refresh(&scope, move || async move {
                    gate.notified().await;
                    Err::<Vec<RepositorySummary>, _>(offline())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let sync = sync.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                sync.refresh(&scope, || async { Ok(vec![repo(9, "never")]) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        assert_eq!(leader.await.unwrap(), Err(SyncError::Remote(offline())));
        assert_eq!(follower.await.unwrap(), Err(SyncError::Remote(offline())));
        assert!(sync.store().read(&scope).unwrap().is_empty());
    }

    struct CannedRemote {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteSource for CannedRemote {
        async fn fetch_org_repositories(
            &self,
            _org: &str,
        ) -> Result<Vec<RepositorySummary>, RemoteError> {
            Ok(vec![])
        }

        async fn fetch_repository(
            &self,
            _org: &str,
            name: &str,
        ) -> Result<RepositorySummary, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if name == "missing" {
                Err(RemoteError::NotFound(name.to_string()))
            } else {
                Ok(repo(42, name))
            }
        }

        async fn fetch_issues(
            &self,
            _org: &str,
            _repo: &str,
            _state: crate::types::IssueState,
        ) -> Result<Vec<crate::types::Issue>, RemoteError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_repository_detail_prefers_cache() {
        let sync = coordinator(false);
        let remote = CannedRemote {
            calls: AtomicUsize::new(0),
        };
        sync.store()
            .replace(&RepositoriesScope::new("intuit"), &[repo(1, "cached")])
            .unwrap();

        let cached = sync.repository_detail("intuit", "cached", &remote).await;
        assert_eq!(cached, Ok(repo(1, "cached")));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        let fetched = sync.repository_detail("intuit", "other", &remote).await;
        assert_eq!(fetched, Ok(repo(42, "other")));
        assert!(sync.store().read_repository("intuit", "other").unwrap().is_none());

        let missing = sync.repository_detail("intuit", "missing", &remote).await;
        assert!(matches!(missing, Err(SyncError::Remote(RemoteError::NotFound(_)))));
    }
}
