//! Minimal forge (GitHub) surface for the gating controller.
//!
//! The controller needs four calls: read a pull request, post a comment,
//! set a commit status, and list changed files. Everything else stays out.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Error talking to the forge.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// The API rejected the request.
    #[error("forge error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// The request never reached the API.
    #[error("forge unreachable: {0}")]
    Transport(String),

    /// A response could not be decoded.
    #[error("malformed forge response: {0}")]
    Malformed(String),
}

/// Pull request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    /// Pull request is open.
    Open,
    /// Pull request is closed (merged or not).
    Closed,
}

/// The slice of a pull request the controller reads.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    /// Pull request number.
    pub number: u64,
    /// Lifecycle state.
    pub state: PullRequestState,
}

/// One changed file in a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestChange {
    /// Repository-relative filename.
    pub filename: String,
}

/// A commit status posted to a SHA.
#[derive(Debug, Clone)]
pub struct CommitStatus {
    /// Status state (`success`, `pending`, `failure`).
    pub state: String,
    /// Status context name.
    pub context: String,
    /// Short human-readable description.
    pub description: String,
}

/// The forge calls the gating controller performs.
#[async_trait::async_trait]
pub trait ForgeClient: Send + Sync {
    /// Reads a pull request.
    async fn get_pull_request(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest, ForgeError>;

    /// Posts an issue comment on a pull request.
    async fn create_comment(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ForgeError>;

    /// Posts a commit status on a SHA.
    async fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), ForgeError>;

    /// Lists the files changed by a pull request.
    async fn get_pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PullRequestChange>, ForgeError>;
}

#[async_trait::async_trait]
impl<T: ForgeClient + ?Sized> ForgeClient for std::sync::Arc<T> {
    async fn get_pull_request(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest, ForgeError> {
        (**self).get_pull_request(org, repo, number).await
    }

    async fn create_comment(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ForgeError> {
        (**self).create_comment(org, repo, number, body).await
    }

    async fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), ForgeError> {
        (**self).create_status(org, repo, sha, status).await
    }

    async fn get_pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PullRequestChange>, ForgeError> {
        (**self).get_pull_request_changes(org, repo, number).await
    }
}

/// GitHub implementation of [`ForgeClient`] using token authentication.
pub struct GitHubClient {
    api_base_url: String,
    token: SecretString,
    client: reqwest::Client,
    dry_run: bool,
}

const GITHUB_API_VERSION: &str = "2022-11-28";

impl GitHubClient {
    /// Creates a client against the public GitHub API.
    #[must_use]
    pub fn new(token: SecretString, dry_run: bool) -> Self {
        Self::with_api_base_url("https://api.github.com", token, dry_run)
    }

    /// Creates a client against an explicit API base URL.
    #[must_use]
    pub fn with_api_base_url(
        api_base_url: impl Into<String>,
        token: SecretString,
        dry_run: bool,
    ) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
            dry_run,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_base_url))
            .bearer_auth(self.token.expose_secret())
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "conveyor-pipeline-controller")
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<Vec<u8>, ForgeError> {
        let response = builder
            .send()
            .await
            .map_err(|err| ForgeError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ForgeError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(ForgeError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }
}

#[async_trait::async_trait]
impl ForgeClient for GitHubClient {
    async fn get_pull_request(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest, ForgeError> {
        let body = self
            .execute(self.request(
                reqwest::Method::GET,
                &format!("/repos/{org}/{repo}/pulls/{number}"),
            ))
            .await?;
        serde_json::from_slice(&body).map_err(|err| ForgeError::Malformed(err.to_string()))
    }

    async fn create_comment(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ForgeError> {
        if self.dry_run {
            tracing::info!(org, repo, number, body, "dry-run: suppressing comment");
            return Ok(());
        }
        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{org}/{repo}/issues/{number}/comments"),
            )
            .json(&json!({ "body": body })),
        )
        .await
        .map(|_| ())
    }

    async fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), ForgeError> {
        if self.dry_run {
            tracing::info!(org, repo, sha, context = %status.context, "dry-run: suppressing status");
            return Ok(());
        }
        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{org}/{repo}/statuses/{sha}"),
            )
            .json(&json!({
                "state": status.state,
                "context": status.context,
                "description": status.description,
            })),
        )
        .await
        .map(|_| ())
    }

    async fn get_pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PullRequestChange>, ForgeError> {
        let body = self
            .execute(self.request(
                reqwest::Method::GET,
                &format!("/repos/{org}/{repo}/pulls/{number}/files"),
            ))
            .await?;
        serde_json::from_slice(&body).map_err(|err| ForgeError::Malformed(err.to_string()))
    }
}
