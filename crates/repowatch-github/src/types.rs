//! Repository and issue types, in both their domain and wire shapes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Page-size ceiling for list endpoints. Only the first page is ever fetched.
pub const PAGE_SIZE: u32 = 100;

/// A repository as cached locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stars: u32,
    pub forks: u32,
    pub open_issues_count: u32,
    pub html_url: String,
    /// ISO-8601, compared as an opaque string
    pub created_at: String,
    /// ISO-8601, compared as an opaque string
    pub updated_at: String,
    pub topics: BTreeSet<String>,
}

/// Issue state, as used in both the query string and the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
        }
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IssueState::Open),
            "closed" => Ok(IssueState::Closed),
            other => Err(format!("unknown issue state: {}", other)),
        }
    }
}

/// The user who opened an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueAuthor {
    pub id: i64,
    pub login: String,
    pub avatar_url: String,
}

/// An issue as cached locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub number: u32,
    pub title: String,
    pub state: IssueState,
    pub body: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub html_url: String,
    pub author: IssueAuthor,
}

/// Repository object as returned by `/orgs/{org}/repos` and `/repos/{owner}/{repo}`.
#[derive(Debug, Deserialize)]
pub struct ApiRepository {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stargazers_count: u32,
    pub forks_count: u32,
    pub open_issues_count: u32,
    pub html_url: String,
    pub created_at: String,
    pub updated_at: String,
    /// Missing on some payload variants.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl From<ApiRepository> for RepositorySummary {
    fn from(api: ApiRepository) -> Self {
        Self {
            id: api.id,
            name: api.name,
            description: api.description,
            language: api.language,
            stars: api.stargazers_count,
            forks: api.forks_count,
            open_issues_count: api.open_issues_count,
            html_url: api.html_url,
            created_at: api.created_at,
            updated_at: api.updated_at,
            topics: api.topics.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
    pub id: i64,
    pub login: String,
    pub avatar_url: String,
}

/// Issue object as returned by `/repos/{owner}/{repo}/issues`.
#[derive(Debug, Deserialize)]
pub struct ApiIssue {
    pub id: i64,
    pub number: u32,
    pub title: String,
    pub state: IssueState,
    pub body: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub html_url: String,
    pub user: ApiUser,
}

impl From<ApiIssue> for Issue {
    fn from(api: ApiIssue) -> Self {
        Self {
            id: api.id,
            number: api.number,
            title: api.title,
            state: api.state,
            body: api.body,
            created_at: api.created_at,
            updated_at: api.updated_at,
            html_url: api.html_url,
            author: IssueAuthor {
                id: api.user.id,
                login: api.user.login,
                avatar_url: api.user.avatar_url,
            },
        }
    }
}

/// Cache partition holding one organization's repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoriesScope {
    pub organization: String,
}

impl RepositoriesScope {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
        }
    }
}

/// Cache partition holding one repository's issues in one state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssuesScope {
    pub organization: String,
    pub repo_name: String,
    pub state: IssueState,
}

impl IssuesScope {
    pub fn new(
        organization: impl Into<String>,
        repo_name: impl Into<String>,
        state: IssueState,
    ) -> Self {
        Self {
            organization: organization.into(),
            repo_name: repo_name.into(),
            state,
        }
    }
}
