//! Reason-tagged failure reporting.
//!
//! Every fatal error surfaced by the orchestrator carries exactly one stable
//! reason from a closed taxonomy. Reasons are reported to the results sink
//! for aggregation; context-cancellation errors are excluded because an
//! interrupted run says nothing about the job itself.

use std::error::Error as StdError;
use std::fmt;

use serde_json::json;

/// The reason attached to errors that did not declare one.
pub const DEFAULT_REASON: &str = "executing_graph";

/// The closed reason taxonomy, in rough lifecycle order.
pub const REASONS: &[&str] = &[
    "loading_args",
    "loading_config",
    "config_resolver",
    "config_resolver_literal",
    "validating_config",
    "defaulting_config",
    "resolving_inputs",
    "building_graph",
    "initializing_namespace",
    "executing_graph",
    "executing_post",
];

/// A fatal error tagged with its reporting reason.
#[derive(Debug)]
pub struct OperatorError {
    reason: &'static str,
    /// Whether a covering JUnit artifact was already written for this error.
    junit_written: bool,
    /// Whether this error is a context cancellation.
    cancelled: bool,
    source: Box<dyn StdError + Send + Sync>,
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl StdError for OperatorError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl OperatorError {
    /// Tags `source` with `reason`.
    #[must_use]
    pub fn for_reason(
        reason: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        debug_assert!(REASONS.contains(&reason), "unknown reason {reason}");
        Self { reason, junit_written: false, cancelled: false, source: source.into() }
    }

    /// Tags `source` with the default reason.
    #[must_use]
    pub fn with_default_reason(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            reason: DEFAULT_REASON,
            junit_written: false,
            cancelled: false,
            source: source.into(),
        }
    }

    /// Marks the error as already covered by an emitted JUnit artifact.
    #[must_use]
    pub fn junit_written(mut self) -> Self {
        self.junit_written = true;
        self
    }

    /// Marks the error as a context cancellation.
    #[must_use]
    pub fn cancellation(mut self) -> Self {
        self.cancelled = true;
        self
    }

    /// The stable reporting reason.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Whether a covering JUnit artifact was already written.
    #[must_use]
    pub fn wrote_junit(&self) -> bool {
        self.junit_written
    }

    /// Whether this error is a context cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Posts run outcomes to the results sink.
///
/// A missing sink address turns every report into a no-op, so local runs
/// work without infrastructure.
pub struct ResultsReporter {
    address: Option<String>,
    job_name: String,
    cluster: String,
    client: reqwest::Client,
}

impl ResultsReporter {
    /// Creates a reporter for the sink at `address`.
    #[must_use]
    pub fn new(address: Option<String>, job_name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            address,
            job_name: job_name.into(),
            cluster: cluster.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Reports the run outcome. Cancellation errors are skipped; an empty
    /// error list reports success. Failures to deliver are logged and
    /// swallowed, reporting never fails a run.
    pub async fn report(&self, errors: &[OperatorError]) {
        let Some(address) = &self.address else {
            return;
        };
        let reportable: Vec<&OperatorError> =
            errors.iter().filter(|e| !e.is_cancelled()).collect();

        let payloads = if reportable.is_empty() {
            vec![json!({
                "job_name": self.job_name,
                "cluster": self.cluster,
                "state": "succeeded",
                "reason": "unknown",
            })]
        } else {
            reportable
                .iter()
                .map(|err| {
                    json!({
                        "job_name": self.job_name,
                        "cluster": self.cluster,
                        "state": "failed",
                        "reason": err.reason(),
                    })
                })
                .collect()
        };

        for payload in payloads {
            let result = self
                .client
                .post(format!("{address}/result"))
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(status = %response.status(), "results sink rejected report");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "could not reach results sink"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_exactly_one_reason() {
        let err = OperatorError::for_reason("building_graph", "boom".to_string());
        assert_eq!(err.reason(), "building_graph");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn default_reason_is_executing_graph() {
        let err = OperatorError::with_default_reason("boom".to_string());
        assert_eq!(err.reason(), DEFAULT_REASON);
    }

    #[test]
    fn junit_and_cancellation_markers() {
        let err = OperatorError::for_reason("executing_graph", "x".to_string())
            .junit_written()
            .cancellation();
        assert!(err.wrote_junit());
        assert!(err.is_cancelled());
    }

    #[test]
    fn taxonomy_is_closed_and_ordered() {
        assert_eq!(REASONS.len(), 11);
        assert!(REASONS.contains(&DEFAULT_REASON));
    }
}
