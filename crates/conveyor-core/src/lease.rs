//! Lease client.
//!
//! Certain tests consume externally managed concurrency resources (cloud
//! quota slices and the like). The lease server hands out named resources;
//! this client acquires them with a bounded timeout, heartbeats every held
//! lease on a fixed cadence, and releases everything at shutdown.

use std::sync::Mutex;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default bound on a single lease acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(120 * 60);

/// How often held leases are refreshed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait before retrying when no resource is free.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Error acquiring or maintaining leases.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// No resource became free within the acquisition timeout.
    #[error("timed out waiting to acquire a {resource_type} lease after {timeout:?}")]
    AcquireTimeout {
        /// Requested resource type.
        resource_type: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// Acquisition was cancelled by the ambient context.
    #[error("lease acquisition cancelled")]
    Cancelled,

    /// The server rejected a request.
    #[error("lease server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// The server could not be reached.
    #[error("lease server unreachable: {0}")]
    Transport(String),

    /// The credentials file was malformed.
    #[error("invalid lease server credentials: must be of the form <username>:<password>")]
    InvalidCredentials,
}

/// Credentials for the lease server, loaded from a `<user>:<password>` file.
#[derive(Clone)]
pub struct LeaseCredentials {
    username: String,
    password: SecretString,
}

impl LeaseCredentials {
    /// Parses credentials from the content of a credentials file.
    pub fn parse(content: &str) -> Result<Self, LeaseError> {
        let (username, password) = content
            .trim_end_matches('\n')
            .split_once(':')
            .ok_or(LeaseError::InvalidCredentials)?;
        if username.is_empty() {
            return Err(LeaseError::InvalidCredentials);
        }
        Ok(Self {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Resource {
    name: String,
}

/// Client for the lease server.
pub struct LeaseClient {
    owner: String,
    address: String,
    credentials: LeaseCredentials,
    acquire_timeout: Duration,
    held: Mutex<Vec<String>>,
    client: reqwest::Client,
}

impl LeaseClient {
    /// Creates a client owned by `owner` against the server at `address`.
    #[must_use]
    pub fn new(
        owner: impl Into<String>,
        address: impl Into<String>,
        credentials: LeaseCredentials,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            owner: owner.into(),
            address: address.into(),
            credentials,
            acquire_timeout,
            held: Mutex::new(Vec::new()),
            client: reqwest::Client::new(),
        }
    }

    fn post(&self, path: &str, query: &[(&str, &str)]) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.address))
            .basic_auth(
                &self.credentials.username,
                Some(self.credentials.password.expose_secret()),
            )
            .query(query)
    }

    /// Acquires one resource of `resource_type`, blocking until the server
    /// grants it, the configured timeout elapses, or `cancel` fires.
    pub async fn acquire(
        &self,
        resource_type: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LeaseError> {
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(LeaseError::Cancelled);
            }
            let response = self
                .post(
                    "/acquire",
                    &[
                        ("type", resource_type),
                        ("state", "free"),
                        ("dest", "leased"),
                        ("owner", self.owner.as_str()),
                    ],
                )
                .send()
                .await
                .map_err(|err| LeaseError::Transport(err.to_string()))?;
            let status = response.status();
            if status.is_success() {
                let resource: Resource = response
                    .json()
                    .await
                    .map_err(|err| LeaseError::Transport(err.to_string()))?;
                self.held
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(resource.name.clone());
                tracing::info!(resource = %resource.name, resource_type, "acquired lease");
                return Ok(resource.name);
            }
            if status.as_u16() != 404 {
                let message = response.text().await.unwrap_or_default();
                return Err(LeaseError::Server { status: status.as_u16(), message });
            }
            // Nothing free right now; retry until the deadline.
            let retry_at = tokio::time::Instant::now() + RETRY_DELAY;
            if retry_at > deadline {
                return Err(LeaseError::AcquireTimeout {
                    resource_type: resource_type.to_string(),
                    timeout: self.acquire_timeout,
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(LeaseError::Cancelled),
                () = tokio::time::sleep_until(retry_at) => {}
            }
        }
    }

    /// Refreshes every held lease.
    pub async fn heartbeat(&self) -> Result<(), LeaseError> {
        let held: Vec<String> = self.held.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for name in held {
            let response = self
                .post(
                    "/update",
                    &[
                        ("name", name.as_str()),
                        ("state", "leased"),
                        ("owner", self.owner.as_str()),
                    ],
                )
                .send()
                .await
                .map_err(|err| LeaseError::Transport(err.to_string()))?;
            if !response.status().is_success() {
                return Err(LeaseError::Server {
                    status: response.status().as_u16(),
                    message: format!("failed to update lease {name}"),
                });
            }
        }
        Ok(())
    }

    /// Releases one held lease back to the free pool.
    pub async fn release(&self, name: &str) -> Result<(), LeaseError> {
        let response = self
            .post(
                "/release",
                &[("name", name), ("dest", "free"), ("owner", self.owner.as_str())],
            )
            .send()
            .await
            .map_err(|err| LeaseError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LeaseError::Server {
                status: response.status().as_u16(),
                message: format!("failed to release lease {name}"),
            });
        }
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|held| held != name);
        Ok(())
    }

    /// Releases every held lease, returning the names that were held.
    pub async fn release_all(&self) -> Result<Vec<String>, LeaseError> {
        let held: Vec<String> = self.held.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for name in &held {
            self.release(name).await?;
        }
        Ok(held)
    }

    /// Names of currently held leases.
    #[must_use]
    pub fn held(&self) -> Vec<String> {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Runs the heartbeat loop until `cancel` fires, then releases all held
/// leases. Heartbeat failures are logged, not fatal.
pub async fn run_heartbeat(client: std::sync::Arc<LeaseClient>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = client.heartbeat().await {
                    tracing::warn!(error = %err, "failed to update leases");
                }
            }
        }
    }
    match client.release_all().await {
        Ok(released) if !released.is_empty() => {
            tracing::info!(?released, "released held leases at shutdown");
        }
        Ok(_) => {}
        Err(err) => tracing::error!(error = %err, "failed to release held leases"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credentials() {
        let creds = LeaseCredentials::parse("user:pass\n").unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password.expose_secret(), "pass");
    }

    #[test]
    fn rejects_credentials_without_separator() {
        assert!(matches!(
            LeaseCredentials::parse("nopassword"),
            Err(LeaseError::InvalidCredentials)
        ));
        assert!(matches!(
            LeaseCredentials::parse(":only-password"),
            Err(LeaseError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_immediately() {
        let client = LeaseClient::new(
            "ci-op-abc-xyz",
            "http://127.0.0.1:0",
            LeaseCredentials::parse("u:p").unwrap(),
            Duration::from_secs(1),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            client.acquire("aws-quota-slice", &cancel).await,
            Err(LeaseError::Cancelled)
        ));
    }
}
