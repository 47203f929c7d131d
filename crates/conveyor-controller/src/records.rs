//! Build-outcome record access.
//!
//! Records live as custom objects in a single namespace of the scheduling
//! cluster. The store lists a pull request's presubmit records by label
//! selector and surfaces changed records through a polling loop; the
//! reconciler only sees records whose observed state changed since the
//! last poll.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conveyor_core::gating::{BuildRecord, BuildState};

use crate::reconciler::RecordLister;

/// How often the namespace is polled for changed records.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Reads build records from the scheduling cluster's record namespace.
pub struct RecordStore {
    base_url: String,
    token: SecretString,
    namespace: String,
    client: reqwest::Client,
    observed: Mutex<HashMap<String, BuildState>>,
}

impl RecordStore {
    /// Creates a store over the record namespace at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: SecretString, namespace: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            namespace: namespace.into(),
            client: reqwest::Client::new(),
            observed: Mutex::new(HashMap::new()),
        }
    }

    async fn list(&self, selector: &str) -> Result<Vec<BuildRecord>, String> {
        let url = format!(
            "{}/apis/build.conveyor.ci/v1/namespaces/{}/buildrecords",
            self.base_url, self.namespace
        );
        let response = self
            .client
            .get(&url)
            .query(&[("labelSelector", selector)])
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|err| format!("could not list build records: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("record list rejected: {}", response.status()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| format!("malformed record list: {err}"))?;
        let items = body["items"].as_array().cloned().unwrap_or_default();
        Ok(items.iter().filter_map(record_from_json).collect())
    }

    /// Polls for records whose state changed, sending each into `tx` until
    /// cancelled.
    pub async fn watch_changed(
        &self,
        tx: mpsc::Sender<BuildRecord>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.list("type=presubmit").await {
                        Ok(records) => {
                            for record in records {
                                let key = format!(
                                    "{}/{}#{}@{}:{}",
                                    record.org, record.repo, record.pull_number,
                                    record.pull_sha, record.job
                                );
                                let changed = {
                                    let mut observed =
                                        self.observed.lock().unwrap_or_else(|e| e.into_inner());
                                    observed.insert(key, record.state) != Some(record.state)
                                };
                                if changed && tx.send(record).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to poll build records"),
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl RecordLister for RecordStore {
    async fn list_presubmits(
        &self,
        org: &str,
        repo: &str,
        pull_number: u64,
        base_ref: &str,
    ) -> Result<Vec<BuildRecord>, String> {
        let selector = format!(
            "type=presubmit,org={org},repo={repo},pull={pull_number},base-ref={base_ref}"
        );
        self.list(&selector).await
    }
}

/// Maps one record object into the decision model. Records missing
/// essential fields are dropped.
fn record_from_json(value: &Value) -> Option<BuildRecord> {
    let spec = &value["spec"];
    let refs = &spec["refs"];
    let pull = refs["pulls"].as_array()?.first()?;
    let state = match value["status"]["state"].as_str()? {
        "triggered" => BuildState::Triggered,
        "pending" => BuildState::Pending,
        "success" => BuildState::Success,
        "failure" => BuildState::Failure,
        "aborted" => BuildState::Aborted,
        "error" => BuildState::Error,
        _ => return None,
    };
    Some(BuildRecord {
        job: spec["job"].as_str()?.to_string(),
        org: refs["org"].as_str()?.to_string(),
        repo: refs["repo"].as_str()?.to_string(),
        base_ref: refs["base_ref"].as_str()?.to_string(),
        pull_number: pull["number"].as_u64()?,
        pull_sha: pull["sha"].as_str()?.to_string(),
        state,
        created_at: value["metadata"]["creationTimestamp"]
            .as_str()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_record_objects() {
        let value = json!({
            "metadata": { "creationTimestamp": "2026-05-01T12:00:00Z" },
            "spec": {
                "job": "pull-acme-widget-e2e",
                "refs": {
                    "org": "acme", "repo": "widget", "base_ref": "main",
                    "pulls": [{ "number": 7, "sha": "abc123" }],
                },
            },
            "status": { "state": "success" },
        });
        let record = record_from_json(&value).unwrap();
        assert_eq!(record.job, "pull-acme-widget-e2e");
        assert_eq!(record.pull_number, 7);
        assert_eq!(record.state, BuildState::Success);
    }

    #[test]
    fn drops_records_without_state_or_pulls() {
        let missing_state = json!({
            "metadata": { "creationTimestamp": "2026-05-01T12:00:00Z" },
            "spec": { "job": "j", "refs": { "org": "o", "repo": "r", "base_ref": "b",
                "pulls": [{ "number": 1, "sha": "s" }] } },
            "status": {},
        });
        assert!(record_from_json(&missing_state).is_none());

        let missing_pulls = json!({
            "metadata": { "creationTimestamp": "2026-05-01T12:00:00Z" },
            "spec": { "job": "j", "refs": { "org": "o", "repo": "r", "base_ref": "b", "pulls": [] } },
            "status": { "state": "success" },
        });
        assert!(record_from_json(&missing_pulls).is_none());
    }
}
