//! Remote source for organization repositories and issues.
//!
//! Every call issues exactly one request and reads only the first page
//! (`per_page=100`). Nothing is cached and nothing is retried here: retry
//! policy belongs to the caller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::sync::Arc;
use tracing::instrument;
use url::Url;

use repowatch_core::{GitHubConfig, RemoteError, ReqwestErrorExt};

use crate::types::*;

/// Read-only access to the remote repository API.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// `GET /orgs/{org}/repos?per_page=100`
    async fn fetch_org_repositories(&self, org: &str)
        -> Result<Vec<RepositorySummary>, RemoteError>;

    /// `GET /repos/{owner}/{repo}`
    async fn fetch_repository(&self, org: &str, name: &str)
        -> Result<RepositorySummary, RemoteError>;

    /// `GET /repos/{owner}/{repo}/issues?state={state}&per_page=100`
    async fn fetch_issues(
        &self,
        org: &str,
        repo: &str,
        state: IssueState,
    ) -> Result<Vec<Issue>, RemoteError>;
}

/// GitHub REST client. No credentials are sent.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    base_url: Url,
    client: Arc<Client>,
}

impl GitHubClient {
    /// Create a client from configuration.
    ///
    /// A timeout is applied only when `request_timeout_secs` is set.
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        let base_url = Url::parse(&config.api_base_url)
            .with_context(|| format!("Invalid API base URL: {}", config.api_base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("API base URL cannot hold a path: {}", config.api_base_url);
        }

        Ok(Self {
            base_url,
            client: Arc::new(client),
        })
    }

    /// Create a client pointed at `base_url` with otherwise default settings.
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Self::new(&GitHubConfig {
            api_base_url: base_url.to_string(),
            ..GitHubConfig::default()
        })
    }

    /// Build `base_url/segments...`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RemoteError::InvalidRequest(format!("Unusable base URL: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn build_request(&self, url: Url) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = request.send().await.map_err(|e| e.into_remote_error())?;
        Self::handle_response(response).await
    }

    /// Classify the response: 2xx is decoded, 404 is `NotFound`, anything else `Remote`.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();
        let url = response.url().to_string();

        if status.is_success() {
            let bytes = response.bytes().await.map_err(|e| e.into_remote_error())?;
            serde_json::from_slice(&bytes)
                .map_err(|e| RemoteError::Decode(format!("{}: {}", url, e)))
        } else if status == StatusCode::NOT_FOUND {
            Err(RemoteError::NotFound(url))
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(RemoteError::Remote {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), RemoteError> {
    if value.trim().is_empty() {
        return Err(RemoteError::InvalidRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

#[async_trait]
impl RemoteSource for GitHubClient {
    #[instrument(skip(self), level = "info")]
    async fn fetch_org_repositories(
        &self,
        org: &str,
    ) -> Result<Vec<RepositorySummary>, RemoteError> {
        require_non_empty("organization", org)?;
        tracing::debug!("Fetching repositories for {}", org);

        let url = self.endpoint(&["orgs", org, "repos"])?;
        let request = self
            .build_request(url)
            .query(&[("per_page", PAGE_SIZE.to_string())]);
        let repos: Vec<ApiRepository> = self.get(request).await?;

        tracing::info!("Fetched {} repositories for {}", repos.len(), org);
        Ok(repos.into_iter().map(RepositorySummary::from).collect())
    }

    #[instrument(skip(self), level = "info")]
    async fn fetch_repository(
        &self,
        org: &str,
        name: &str,
    ) -> Result<RepositorySummary, RemoteError> {
        require_non_empty("organization", org)?;
        require_non_empty("repository", name)?;
        tracing::debug!("Fetching repository {}/{}", org, name);

        let url = self.endpoint(&["repos", org, name])?;
        let repo: ApiRepository = self.get(self.build_request(url)).await?;

        tracing::info!("Fetched repository {}/{}", org, name);
        Ok(repo.into())
    }

    #[instrument(skip(self), level = "info")]
    async fn fetch_issues(
        &self,
        org: &str,
        repo: &str,
        state: IssueState,
    ) -> Result<Vec<Issue>, RemoteError> {
        require_non_empty("organization", org)?;
        require_non_empty("repository", repo)?;
        tracing::debug!("Fetching {} issues for {}/{}", state, org, repo);

        let url = self.endpoint(&["repos", org, repo, "issues"])?;
        let request = self.build_request(url).query(&[
            ("state", state.as_str().to_string()),
            ("per_page", PAGE_SIZE.to_string()),
        ]);
        let issues: Vec<ApiIssue> = self.get(request).await?;

        tracing::info!("Fetched {} {} issues for {}/{}", issues.len(), state, org, repo);
        Ok(issues.into_iter().map(Issue::from).collect())
    }
}
