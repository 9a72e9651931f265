//! SQLite-backed local store for repositories and issues.
//!
//! Rows are partitioned by scope. The only write is [`LocalStore::replace`],
//! which deletes a scope's rows and inserts the new set inside one
//! transaction, so a reader sees either the old rows or the new rows and
//! never a mix. Observers are notified per scope after each commit.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use repowatch_core::{DatabaseError, RusqliteErrorExt};

use crate::types::{
    Issue, IssueAuthor, IssueState, IssuesScope, RepositoriesScope, RepositorySummary,
};

/// A cache partition: knows its key and how to read and write its rows.
pub trait CacheScope: Clone + Send + Sync + 'static {
    type Row: Clone + Send + Sync + 'static;

    /// Stable key identifying the partition in `scope_state` and in the watcher table.
    fn key(&self) -> String;

    /// Read the scope's rows in insertion order.
    fn read_rows(&self, conn: &Connection) -> rusqlite::Result<Vec<Self::Row>>;

    fn delete_rows(&self, tx: &Transaction<'_>) -> rusqlite::Result<usize>;

    fn insert_rows(&self, tx: &Transaction<'_>, rows: &[Self::Row]) -> rusqlite::Result<()>;
}

/// Rows of a scope together with its populated marker, read under one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<T> {
    pub rows: Vec<T>,
    /// Milliseconds since epoch of the last completed replace; `None` if never populated.
    pub synced_at: Option<i64>,
}

impl<T> Snapshot<T> {
    pub fn is_populated(&self) -> bool {
        self.synced_at.is_some()
    }
}

/// Persisted, observable cache.
pub struct LocalStore {
    conn: Mutex<Connection>,
    watchers: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl LocalStore {
    /// Open (or create) the cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| e.into_database_error())?;
        Self::with_connection(conn)
    }

    /// Create an in-memory cache. Contents are lost on drop.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory().map_err(|e| e.into_database_error())?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let store = Self {
            conn: Mutex::new(conn),
            watchers: Mutex::new(HashMap::new()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn
            .lock()
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS repositories (
                organization TEXT NOT NULL,
                id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                language TEXT,
                stars INTEGER NOT NULL,
                forks INTEGER NOT NULL,
                open_issues_count INTEGER NOT NULL,
                html_url TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                topics TEXT NOT NULL,
                PRIMARY KEY (organization, id)
            );

            CREATE TABLE IF NOT EXISTS issues (
                organization TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                issue_state TEXT NOT NULL,
                id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                number INTEGER NOT NULL,
                title TEXT NOT NULL,
                state TEXT NOT NULL,
                body TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                html_url TEXT NOT NULL,
                author_id INTEGER NOT NULL,
                author_login TEXT NOT NULL,
                author_avatar_url TEXT NOT NULL,
                PRIMARY KEY (organization, repo_name, issue_state, id)
            );

            CREATE TABLE IF NOT EXISTS scope_state (
                scope_key TEXT PRIMARY KEY,
                populated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_repositories_name ON repositories(organization, name);
            "#,
            )
            .map_err(|e| e.into_database_error())
    }

    /// Point-in-time rows of `scope`.
    pub fn read<S: CacheScope>(&self, scope: &S) -> Result<Vec<S::Row>, DatabaseError> {
        Ok(self.snapshot(scope)?.rows)
    }

    /// Rows and populated marker of `scope`, read atomically.
    pub fn snapshot<S: CacheScope>(&self, scope: &S) -> Result<Snapshot<S::Row>, DatabaseError> {
        let conn = self.conn.lock();
        let rows = scope.read_rows(&conn).map_err(|e| e.into_database_error())?;
        let synced_at = Self::synced_at(&conn, &scope.key()).map_err(|e| e.into_database_error())?;
        Ok(Snapshot { rows, synced_at })
    }

    /// When `scope` was last replaced, if ever.
    pub fn last_synced<S: CacheScope>(&self, scope: &S) -> Result<Option<i64>, DatabaseError> {
        let conn = self.conn.lock();
        Self::synced_at(&conn, &scope.key()).map_err(|e| e.into_database_error())
    }

    fn synced_at(conn: &Connection, key: &str) -> rusqlite::Result<Option<i64>> {
        conn.query_row(
            "SELECT populated_at FROM scope_state WHERE scope_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    /// Atomically swap the rows of `scope` for `rows`.
    ///
    /// An empty `rows` clears the scope but still marks it populated.
    pub fn replace<S: CacheScope>(&self, scope: &S, rows: &[S::Row]) -> Result<(), DatabaseError> {
        let key = scope.key();
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(|e| e.into_database_error())?;
            let removed = scope.delete_rows(&tx).map_err(|e| e.into_database_error())?;
            scope
                .insert_rows(&tx, rows)
                .map_err(|e| e.into_database_error())?;
            tx.execute(
                "INSERT OR REPLACE INTO scope_state (scope_key, populated_at) VALUES (?1, ?2)",
                params![key, chrono::Utc::now().timestamp_millis()],
            )
            .map_err(|e| e.into_database_error())?;
            tx.commit().map_err(|e| e.into_database_error())?;

            tracing::debug!("Replaced {}: {} rows out, {} rows in", key, removed, rows.len());
        }
        self.notify(&key);
        Ok(())
    }

    /// Subscribe to `scope`. The first `next()` yields the current rows.
    pub fn observe<S: CacheScope>(self: &Arc<Self>, scope: S) -> Observation<S> {
        let changes = {
            let mut watchers = self.watchers.lock();
            prune_watchers(&mut watchers);
            watchers
                .entry(scope.key())
                .or_insert_with(|| watch::channel(0).0)
                .subscribe()
        };

        Observation {
            store: Arc::clone(self),
            scope,
            changes,
            stale: true,
        }
    }

    fn notify(&self, key: &str) {
        let mut watchers = self.watchers.lock();
        prune_watchers(&mut watchers);
        if let Some(sender) = watchers.get(key) {
            sender.send_modify(|version| *version += 1);
        }
    }

    /// Look up one cached repository by name.
    pub fn read_repository(
        &self,
        organization: &str,
        name: &str,
    ) -> Result<Option<RepositorySummary>, DatabaseError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM repositories WHERE organization = ?1 AND name = ?2 LIMIT 1",
            REPOSITORY_COLUMNS
        );
        conn.query_row(&sql, params![organization, name], row_to_repository)
            .optional()
            .map_err(|e| e.into_database_error())
    }

    /// Drop every cached row and populated marker.
    pub fn clear(&self) -> Result<(), DatabaseError> {
        self.conn
            .lock()
            .execute_batch(
                "BEGIN; DELETE FROM repositories; DELETE FROM issues; DELETE FROM scope_state; COMMIT;",
            )
            .map_err(|e| e.into_database_error())?;

        let mut watchers = self.watchers.lock();
        prune_watchers(&mut watchers);
        for sender in watchers.values() {
            sender.send_modify(|version| *version += 1);
        }
        Ok(())
    }
}

/// Drop senders whose observers are all gone.
fn prune_watchers(watchers: &mut HashMap<String, watch::Sender<u64>>) {
    watchers.retain(|_, sender| sender.receiver_count() > 0);
}

/// Live view of one scope.
///
/// `next()` is cancel-safe: if it is dropped mid-read, the following call
/// reads again instead of waiting for another change.
pub struct Observation<S: CacheScope> {
    store: Arc<LocalStore>,
    scope: S,
    changes: watch::Receiver<u64>,
    stale: bool,
}

impl<S: CacheScope> Observation<S> {
    pub fn scope(&self) -> &S {
        &self.scope
    }

    /// Wait for the next committed state of the scope.
    ///
    /// Changes that land while the caller is busy are folded into one
    /// emission of the latest state. Returns `None` only if the store is gone.
    pub async fn next(&mut self) -> Option<Result<Snapshot<S::Row>, DatabaseError>> {
        if !self.stale {
            if self.changes.changed().await.is_err() {
                return None;
            }
            self.stale = true;
        }
        self.changes.borrow_and_update();

        let store = Arc::clone(&self.store);
        let scope = self.scope.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.snapshot(&scope))
            .await
            .unwrap_or_else(|e| Err(DatabaseError::QueryFailed(e.to_string())));

        self.stale = false;
        Some(snapshot)
    }
}

const REPOSITORY_COLUMNS: &str = "id, name, description, language, stars, forks, \
     open_issues_count, html_url, created_at, updated_at, topics";

fn row_to_repository(row: &rusqlite::Row) -> rusqlite::Result<RepositorySummary> {
    let topics_json: String = row.get(10)?;
    let topics = serde_json::from_str(&topics_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(RepositorySummary {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        language: row.get(3)?,
        stars: row.get(4)?,
        forks: row.get(5)?,
        open_issues_count: row.get(6)?,
        html_url: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        topics,
    })
}

impl CacheScope for RepositoriesScope {
    type Row = RepositorySummary;

    fn key(&self) -> String {
        format!("repos:{}", self.organization)
    }

    fn read_rows(&self, conn: &Connection) -> rusqlite::Result<Vec<RepositorySummary>> {
        let sql = format!(
            "SELECT {} FROM repositories WHERE organization = ?1 ORDER BY position",
            REPOSITORY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![self.organization], row_to_repository)?;
        rows.collect()
    }

    fn delete_rows(&self, tx: &Transaction<'_>) -> rusqlite::Result<usize> {
        tx.execute(
            "DELETE FROM repositories WHERE organization = ?1",
            params![self.organization],
        )
    }

    fn insert_rows(&self, tx: &Transaction<'_>, rows: &[RepositorySummary]) -> rusqlite::Result<()> {
        let mut stmt = tx.prepare(
            r#"
            INSERT OR REPLACE INTO repositories
            (organization, id, position, name, description, language, stars, forks,
             open_issues_count, html_url, created_at, updated_at, topics)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )?;

        for (position, repo) in rows.iter().enumerate() {
            let topics_json = serde_json::to_string(&repo.topics)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            stmt.execute(params![
                self.organization,
                repo.id,
                position as i64,
                repo.name,
                repo.description,
                repo.language,
                repo.stars,
                repo.forks,
                repo.open_issues_count,
                repo.html_url,
                repo.created_at,
                repo.updated_at,
                topics_json,
            ])?;
        }
        Ok(())
    }
}

fn row_to_issue(row: &rusqlite::Row) -> rusqlite::Result<Issue> {
    let state: String = row.get(3)?;
    let state: IssueState = state.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Issue {
        id: row.get(0)?,
        number: row.get(1)?,
        title: row.get(2)?,
        state,
        body: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        html_url: row.get(7)?,
        author: IssueAuthor {
            id: row.get(8)?,
            login: row.get(9)?,
            avatar_url: row.get(10)?,
        },
    })
}

impl CacheScope for IssuesScope {
    type Row = Issue;

    fn key(&self) -> String {
        format!("issues:{}/{}:{}", self.organization, self.repo_name, self.state)
    }

    fn read_rows(&self, conn: &Connection) -> rusqlite::Result<Vec<Issue>> {
        let mut stmt = conn.prepare(
            "SELECT id, number, title, state, body, created_at, updated_at, html_url,
                    author_id, author_login, author_avatar_url
             FROM issues
             WHERE organization = ?1 AND repo_name = ?2 AND issue_state = ?3
             ORDER BY position",
        )?;
        let rows = stmt.query_map(
            params![self.organization, self.repo_name, self.state.as_str()],
            row_to_issue,
        )?;
        rows.collect()
    }

    fn delete_rows(&self, tx: &Transaction<'_>) -> rusqlite::Result<usize> {
        tx.execute(
            "DELETE FROM issues WHERE organization = ?1 AND repo_name = ?2 AND issue_state = ?3",
            params![self.organization, self.repo_name, self.state.as_str()],
        )
    }

    fn insert_rows(&self, tx: &Transaction<'_>, rows: &[Issue]) -> rusqlite::Result<()> {
        let mut stmt = tx.prepare(
            r#"
            INSERT OR REPLACE INTO issues
            (organization, repo_name, issue_state, id, position, number, title, state, body,
             created_at, updated_at, html_url, author_id, author_login, author_avatar_url)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )?;

        for (position, issue) in rows.iter().enumerate() {
            stmt.execute(params![
                self.organization,
                self.repo_name,
                self.state.as_str(),
                issue.id,
                position as i64,
                issue.number,
                issue.title,
                issue.state.as_str(),
                issue.body,
                issue.created_at,
                issue.updated_at,
                issue.html_url,
                issue.author.id,
                issue.author.login,
                issue.author.avatar_url,
            ])?;
        }
        Ok(())
    }
}
