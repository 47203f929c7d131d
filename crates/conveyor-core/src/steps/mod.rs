//! The step contract.
//!
//! A step is a unit of work with a name, typed requirements, typed
//! creations, and an execute contract. Steps are constructed from the
//! configuration, validated, placed in the graph, and executed at most once
//! per invocation. A step exclusively owns its outputs while it runs.

mod factory;

pub use factory::{PIPELINE_IMAGE_STREAM, SOURCE_TAG, StepSet, steps_from_config};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::inputs::InputDefinition;
use crate::lease::LeaseClient;

/// A typed dependency token published by one step and consumed by another.
///
/// The set is closed; a requirement is satisfied by any creation that
/// compares equal under the variant's equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepLink {
    /// A named image in the pipeline stream.
    Image(String),
    /// The imported images of a named release.
    ReleaseImages(String),
    /// The RPM repository served from build products.
    RpmRepo,
    /// An externally hosted image by pull spec.
    ExternalImage(String),
    /// An assembled release payload by name.
    ReleasePayload(String),
}

/// Whether any requirement in `requires` is satisfied by a creation in
/// `creates`.
#[must_use]
pub fn has_any_link(requires: &[StepLink], creates: &[StepLink]) -> bool {
    requires.iter().any(|r| creates.contains(r))
}

/// Failure of a step contract method.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step needs a lease but no lease client is configured.
    #[error("step requires a lease but no lease client is configured")]
    NoLeaseClient,

    /// The step needs a cluster-provisioning client but none is configured.
    #[error("step requires a Hive client but no Hive kubeconfig is configured")]
    NoHiveClient,

    /// Upstream input resolution failed.
    #[error("could not resolve inputs for step {step}: {message}")]
    InputResolution {
        /// The failing step.
        step: String,
        /// What went wrong.
        message: String,
    },

    /// The step is semantically invalid.
    #[error("step {step} failed validation: {message}")]
    Validation {
        /// The failing step.
        step: String,
        /// What is invalid.
        message: String,
    },

    /// Execution failed.
    #[error("step {step} failed: {message}")]
    Execution {
        /// The failing step.
        step: String,
        /// What went wrong.
        message: String,
    },

    /// Execution was cancelled by the ambient context.
    #[error("step {step} was cancelled")]
    Cancelled {
        /// The cancelled step.
        step: String,
    },
}

impl StepError {
    /// Whether this error is a context cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Everything a step may touch while executing.
pub struct ExecutionContext {
    /// Cooperative cancellation for all in-flight work.
    pub cancel: CancellationToken,
    /// Cluster the work is submitted to.
    pub cluster: Arc<dyn ClusterClient>,
    /// The execution namespace.
    pub namespace: String,
    /// Lease client, when the invocation configured one.
    pub lease_client: Option<Arc<LeaseClient>>,
    /// How often submitted workloads are polled for completion.
    pub poll_interval: Duration,
    /// Labels applied to every created workload.
    pub labels: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Polls `phase` until the workload reaches a terminal phase, honoring
    /// cancellation.
    pub async fn wait_for_workload<F, Fut>(
        &self,
        step: &str,
        mut phase: F,
    ) -> Result<crate::cluster::WorkloadPhase, StepError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<crate::cluster::WorkloadPhase, crate::cluster::ClusterError>>
            + Send,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled { step: step.to_string() });
            }
            let current = phase().await.map_err(|err| StepError::Execution {
                step: step.to_string(),
                message: err.to_string(),
            })?;
            if current.is_terminal() {
                return Ok(current);
            }
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(StepError::Cancelled { step: step.to_string() });
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// The uniform step contract.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    /// The step name; also its graph identity.
    fn name(&self) -> &str;

    /// Human-readable description for logs and the step-graph artifact.
    fn description(&self) -> String;

    /// Typed dependencies the step consumes.
    fn requires(&self) -> Vec<StepLink>;

    /// Typed outputs the step publishes.
    fn creates(&self) -> Vec<StepLink>;

    /// Content-addressed inputs contributing to the workspace hash.
    fn inputs(&self) -> Result<InputDefinition, StepError>;

    /// Semantic check before execution.
    fn validate(&self) -> Result<(), StepError> {
        Ok(())
    }

    /// Performs the side effect. Honors cancellation through the context.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError>;
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A configurable step for graph and executor tests.
    pub struct FakeStep {
        pub name: String,
        pub requires: Vec<StepLink>,
        pub creates: Vec<StepLink>,
        pub fail: bool,
        pub delay: Duration,
    }

    impl FakeStep {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                requires: Vec::new(),
                creates: Vec::new(),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        pub fn creating(mut self, link: StepLink) -> Self {
            self.creates.push(link);
            self
        }

        pub fn requiring(mut self, link: StepLink) -> Self {
            self.requires.push(link);
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait::async_trait]
    impl Step for FakeStep {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> String {
            format!("fake step {}", self.name)
        }

        fn requires(&self) -> Vec<StepLink> {
            self.requires.clone()
        }

        fn creates(&self) -> Vec<StepLink> {
            self.creates.clone()
        }

        fn inputs(&self) -> Result<InputDefinition, StepError> {
            Ok(vec![self.name.clone()])
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), StepError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(StepError::Execution {
                    step: self.name.clone(),
                    message: "configured to fail".to_string(),
                });
            }
            Ok(())
        }
    }

    pub fn context() -> ExecutionContext {
        ExecutionContext {
            cancel: CancellationToken::new(),
            cluster: Arc::new(crate::cluster::MemoryClusterClient::new()),
            namespace: "ci-op-test".to_string(),
            lease_client: None,
            poll_interval: Duration::from_millis(1),
            labels: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_match_structurally() {
        let requires = vec![StepLink::Image("component".into())];
        assert!(has_any_link(&requires, &[StepLink::Image("component".into())]));
        assert!(!has_any_link(&requires, &[StepLink::Image("other".into())]));
        assert!(!has_any_link(&requires, &[StepLink::ReleaseImages("component".into())]));
    }

    #[test]
    fn rpm_repo_link_is_singleton() {
        assert!(has_any_link(&[StepLink::RpmRepo], &[StepLink::RpmRepo]));
    }
}
