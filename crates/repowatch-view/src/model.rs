//! Screen models: wire load streams and query parameters into observable state.
//!
//! Each model runs its work on spawned tokio tasks and publishes the result
//! through a `watch` channel, so a renderer only ever reads the latest state.
//! Models must be created and driven from within a tokio runtime.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use repowatch_github::{
    CacheScope, Issue, IssueState, IssuesScope, LoadStream, RemoteSource, RepositorySummary,
    SyncCoordinator,
};

use crate::query::{derive_view, FilterOption, QueryParams, QueryState, SortOption};
use crate::state::{reduce, ItemState, ViewEvent, ViewState};

/// User actions on the repository list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoriesIntent {
    Load,
    UpdateSearchQuery(String),
    ClearSearch,
    UpdateSortOption(SortOption),
    UpdateFilterOption(FilterOption),
    ResetFilters,
}

/// User actions on the repository detail screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryDetailIntent {
    LoadRepository,
    LoadIssues(IssueState),
}

/// A background task that is aborted when replaced or dropped.
#[derive(Default)]
struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    fn replace(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.0.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.0.get_mut().take() {
            handle.abort();
        }
    }
}

fn apply<T>(state: &watch::Sender<ViewState<T>>, event: ViewEvent<T>) {
    state.send_modify(|current| {
        let previous = std::mem::take(current);
        *current = reduce(previous, event);
    });
}

/// Organization repository list with live search, filter and sort.
pub struct RepositoriesModel {
    coordinator: SyncCoordinator,
    remote: Arc<dyn RemoteSource>,
    organization: String,
    query: QueryState,
    state: Arc<watch::Sender<ViewState<RepositorySummary>>>,
    task: TaskSlot,
}

impl RepositoriesModel {
    /// Create the model and start the first load.
    pub fn new(
        coordinator: SyncCoordinator,
        remote: Arc<dyn RemoteSource>,
        organization: impl Into<String>,
    ) -> Self {
        let model = Self {
            coordinator,
            remote,
            organization: organization.into(),
            query: QueryState::new(),
            state: Arc::new(watch::channel(ViewState::Loading).0),
            task: TaskSlot::default(),
        };
        model.load();
        model
    }

    pub fn state(&self) -> watch::Receiver<ViewState<RepositorySummary>> {
        self.state.subscribe()
    }

    pub fn query(&self) -> QueryParams {
        self.query.params()
    }

    pub fn process_intent(&self, intent: RepositoriesIntent) {
        tracing::debug!("Repositories intent: {:?}", intent);
        match intent {
            RepositoriesIntent::Load => self.load(),
            RepositoriesIntent::UpdateSearchQuery(text) => self.query.set_search_text(text),
            RepositoriesIntent::ClearSearch => self.query.clear_search(),
            RepositoriesIntent::UpdateSortOption(sort) => self.query.set_sort(sort),
            RepositoriesIntent::UpdateFilterOption(filter) => self.query.set_filter(filter),
            RepositoriesIntent::ResetFilters => self.query.reset(),
        }
    }

    fn load(&self) {
        apply(&self.state, ViewEvent::LoadRequested);

        let stream = self
            .coordinator
            .load_repositories(Arc::clone(&self.remote), &self.organization);
        let handle = tokio::spawn(watch_repositories(
            stream,
            self.query.subscribe(),
            Arc::clone(&self.state),
        ));
        self.task.replace(handle);
    }
}

/// Recompute the view whenever the rows or the query change.
async fn watch_repositories<S>(
    mut stream: LoadStream<S>,
    mut query: watch::Receiver<QueryParams>,
    state: Arc<watch::Sender<ViewState<RepositorySummary>>>,
) where
    S: CacheScope<Row = RepositorySummary>,
{
    let mut rows: Option<Vec<RepositorySummary>> = None;
    let mut query_open = true;

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(fresh)) => rows = Some(fresh),
                Some(Err(error)) => {
                    apply(&state, ViewEvent::Failed(error.user_message().to_string()));
                    continue;
                }
                None => break,
            },
            changed = query.changed(), if query_open => {
                if changed.is_err() {
                    query_open = false;
                    continue;
                }
            }
        }

        if let Some(rows) = &rows {
            let params = query.borrow_and_update().clone();
            apply(&state, ViewEvent::Rows(derive_view(rows, &params)));
        }
    }
}

/// Forward a load stream into a list state without any derivation.
async fn watch_rows<S: CacheScope>(
    mut stream: LoadStream<S>,
    state: Arc<watch::Sender<ViewState<S::Row>>>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(rows) => apply(&state, ViewEvent::Rows(rows)),
            Err(error) => apply(&state, ViewEvent::Failed(error.user_message().to_string())),
        }
    }
}

/// One repository with its open and closed issues.
pub struct RepositoryDetailModel {
    coordinator: SyncCoordinator,
    remote: Arc<dyn RemoteSource>,
    organization: String,
    name: String,
    repository: Arc<watch::Sender<ItemState<RepositorySummary>>>,
    open_issues: Arc<watch::Sender<ViewState<Issue>>>,
    closed_issues: Arc<watch::Sender<ViewState<Issue>>>,
    repository_task: TaskSlot,
    open_task: TaskSlot,
    closed_task: TaskSlot,
}

impl RepositoryDetailModel {
    /// Create the model and load the repository and both issue lists.
    pub fn new(
        coordinator: SyncCoordinator,
        remote: Arc<dyn RemoteSource>,
        organization: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let model = Self {
            coordinator,
            remote,
            organization: organization.into(),
            name: name.into(),
            repository: Arc::new(watch::channel(ItemState::Loading).0),
            open_issues: Arc::new(watch::channel(ViewState::Loading).0),
            closed_issues: Arc::new(watch::channel(ViewState::Loading).0),
            repository_task: TaskSlot::default(),
            open_task: TaskSlot::default(),
            closed_task: TaskSlot::default(),
        };
        model.process_intent(RepositoryDetailIntent::LoadRepository);
        model.process_intent(RepositoryDetailIntent::LoadIssues(IssueState::Open));
        model.process_intent(RepositoryDetailIntent::LoadIssues(IssueState::Closed));
        model
    }

    pub fn repository(&self) -> watch::Receiver<ItemState<RepositorySummary>> {
        self.repository.subscribe()
    }

    pub fn issues(&self, state: IssueState) -> watch::Receiver<ViewState<Issue>> {
        match state {
            IssueState::Open => self.open_issues.subscribe(),
            IssueState::Closed => self.closed_issues.subscribe(),
        }
    }

    pub fn process_intent(&self, intent: RepositoryDetailIntent) {
        tracing::debug!("Repository detail intent for {}: {:?}", self.name, intent);
        match intent {
            RepositoryDetailIntent::LoadRepository => self.load_repository(),
            RepositoryDetailIntent::LoadIssues(state) => self.load_issues(state),
        }
    }

    fn load_repository(&self) {
        self.repository.send_replace(ItemState::Loading);

        let coordinator = self.coordinator.clone();
        let remote = Arc::clone(&self.remote);
        let (organization, name) = (self.organization.clone(), self.name.clone());
        let repository = Arc::clone(&self.repository);

        let handle = tokio::spawn(async move {
            let state = match coordinator
                .repository_detail(&organization, &name, remote.as_ref())
                .await
            {
                Ok(repo) => ItemState::Ready(repo),
                Err(error) => {
                    tracing::error!("Failed to load {}/{}: {}", organization, name, error);
                    ItemState::Error(error.user_message().to_string())
                }
            };
            repository.send_replace(state);
        });
        self.repository_task.replace(handle);
    }

    fn load_issues(&self, issue_state: IssueState) {
        let (state, slot) = match issue_state {
            IssueState::Open => (&self.open_issues, &self.open_task),
            IssueState::Closed => (&self.closed_issues, &self.closed_task),
        };
        apply(state, ViewEvent::LoadRequested);

        let scope = IssuesScope::new(self.organization.clone(), self.name.clone(), issue_state);
        let stream = self.coordinator.load_issues(Arc::clone(&self.remote), scope);
        slot.replace(tokio::spawn(watch_rows(stream, Arc::clone(state))));
    }
}
