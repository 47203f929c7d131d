//! Deriving steps from the configuration.
//!
//! The full step set is a function of the configuration and the job spec:
//! a source step, an import step per base image and external image, a build
//! step per image, a release-import step per release, and a test step per
//! test. Promotion steps are derived separately and only run after the main
//! graph succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ExecutionContext, Step, StepError, StepLink};
use crate::cluster::{BuildRequest, PodRequest, WorkloadPhase};
use crate::config::{
    ExternalImage, ImageBuildConfiguration, IntegrationStream, PromotionTarget,
    ReleaseBuildConfiguration, TestConfiguration,
};
use crate::jobspec::JobSpec;

/// The pipeline image stream every build tags into.
pub const PIPELINE_IMAGE_STREAM: &str = "pipeline";

/// The implicit source image tag.
pub const SOURCE_TAG: &str = "src";

/// The build steps and promotion steps derived from one configuration.
pub struct StepSet {
    /// Steps forming the main execution graph.
    pub steps: Vec<Arc<dyn Step>>,
    /// Steps run concurrently after the main graph succeeds.
    pub promotion_steps: Vec<Arc<dyn Step>>,
}

/// Derives all steps from the configuration.
///
/// `lease_configured` and `hive_configured` record which optional clients
/// the invocation supplied; steps that need an absent client fail
/// validation with the matching sentinel.
pub fn steps_from_config(
    config: &ReleaseBuildConfiguration,
    job_spec: &JobSpec,
    promote: bool,
    lease_configured: bool,
    hive_configured: bool,
) -> StepSet {
    let mut steps: Vec<Arc<dyn Step>> = Vec::new();

    steps.push(Arc::new(SourceStep { refs_summary: source_identity(job_spec) }));

    for (tag, stream) in &config.base_images {
        steps.push(Arc::new(InputImageStep { tag: tag.clone(), stream: stream.clone() }));
    }

    for image in &config.external_images {
        steps.push(Arc::new(ExternalImageStep { image: image.clone() }));
    }

    for image in &config.images {
        steps.push(Arc::new(ImageBuildStep { image: image.clone() }));
    }

    for (name, release) in &config.releases {
        steps.push(Arc::new(ReleaseImportStep {
            name: name.clone(),
            stream: release.integration.clone(),
        }));
    }

    for test in &config.tests {
        steps.push(Arc::new(TestStep {
            test: test.clone(),
            lease_configured,
            hive_configured,
        }));
    }

    let mut promotion_steps: Vec<Arc<dyn Step>> = Vec::new();
    if promote {
        if let Some(promotion) = &config.promotion {
            for target in &promotion.to {
                promotion_steps.push(Arc::new(PromotionStep {
                    target: target.clone(),
                    images: config.images.iter().map(|i| i.to.clone()).collect(),
                    additional_images: promotion.additional_images.clone(),
                }));
            }
        }
    }

    StepSet { steps, promotion_steps }
}

fn source_identity(job_spec: &JobSpec) -> Vec<String> {
    job_spec
        .all_refs()
        .iter()
        .map(|r| r.ref_string())
        .collect()
}

/// Clones the source tree and publishes it as the `src` image.
struct SourceStep {
    refs_summary: Vec<String>,
}

#[async_trait::async_trait]
impl Step for SourceStep {
    fn name(&self) -> &str {
        "src"
    }

    fn description(&self) -> String {
        "Clone the correct source code into an image".to_string()
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::Image(SOURCE_TAG.to_string())]
    }

    fn inputs(&self) -> Result<Vec<String>, StepError> {
        Ok(self.refs_summary.clone())
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let build = BuildRequest {
            name: SOURCE_TAG.to_string(),
            from_tag: None,
            to_tag: format!("{PIPELINE_IMAGE_STREAM}:{SOURCE_TAG}"),
            dockerfile_path: None,
            labels: ctx.labels.clone(),
        };
        submit_and_wait_build(ctx, self.name(), &build).await
    }
}

/// Imports one base image into the pipeline stream.
struct InputImageStep {
    tag: String,
    stream: IntegrationStream,
}

#[async_trait::async_trait]
impl Step for InputImageStep {
    fn name(&self) -> &str {
        &self.tag
    }

    fn description(&self) -> String {
        format!(
            "Find the input image {} and tag it into the pipeline",
            self.tag
        )
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::Image(self.tag.clone())]
    }

    fn inputs(&self) -> Result<Vec<String>, StepError> {
        Ok(vec![format!("{}/{}:{}", self.stream.namespace, self.stream.name, self.tag)])
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let from = format!("{}/{}:{}", self.stream.namespace, self.stream.name, self.tag);
        ctx.cluster
            .import_image_tag(&ctx.namespace, PIPELINE_IMAGE_STREAM, &self.tag, &from)
            .await
            .map_err(|err| StepError::Execution {
                step: self.tag.clone(),
                message: err.to_string(),
            })
    }
}

/// Imports one externally hosted image.
struct ExternalImageStep {
    image: ExternalImage,
}

#[async_trait::async_trait]
impl Step for ExternalImageStep {
    fn name(&self) -> &str {
        &self.image.name
    }

    fn description(&self) -> String {
        format!("Import the external image {}", self.image.pull_spec)
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![
            StepLink::Image(self.image.name.clone()),
            StepLink::ExternalImage(self.image.pull_spec.clone()),
        ]
    }

    fn inputs(&self) -> Result<Vec<String>, StepError> {
        Ok(vec![self.image.pull_spec.clone()])
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        ctx.cluster
            .import_image_tag(
                &ctx.namespace,
                PIPELINE_IMAGE_STREAM,
                &self.image.name,
                &self.image.pull_spec,
            )
            .await
            .map_err(|err| StepError::Execution {
                step: self.image.name.clone(),
                message: err.to_string(),
            })
    }
}

/// Builds one named image on the cluster.
struct ImageBuildStep {
    image: ImageBuildConfiguration,
}

impl ImageBuildStep {
    fn from_tag(&self) -> String {
        self.image.from.clone().unwrap_or_else(|| SOURCE_TAG.to_string())
    }
}

#[async_trait::async_trait]
impl Step for ImageBuildStep {
    fn name(&self) -> &str {
        &self.image.to
    }

    fn description(&self) -> String {
        format!("Build image {} from the repository", self.image.to)
    }

    fn requires(&self) -> Vec<StepLink> {
        vec![StepLink::Image(self.from_tag())]
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::Image(self.image.to.clone())]
    }

    fn inputs(&self) -> Result<Vec<String>, StepError> {
        Ok(vec![format!(
            "{}|{}|{}",
            self.image.to,
            self.from_tag(),
            self.image.dockerfile_path.clone().unwrap_or_default()
        )])
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let build = BuildRequest {
            name: self.image.to.clone(),
            from_tag: Some(format!("{PIPELINE_IMAGE_STREAM}:{}", self.from_tag())),
            to_tag: format!("{PIPELINE_IMAGE_STREAM}:{}", self.image.to),
            dockerfile_path: self.image.dockerfile_path.clone(),
            labels: ctx.labels.clone(),
        };
        submit_and_wait_build(ctx, self.name(), &build).await
    }
}

/// Imports the images of one named release and assembles its payload.
struct ReleaseImportStep {
    name: String,
    stream: Option<IntegrationStream>,
}

#[async_trait::async_trait]
impl Step for ReleaseImportStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Import the release {} into the test namespace", self.name)
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![
            StepLink::ReleaseImages(self.name.clone()),
            StepLink::ReleasePayload(self.name.clone()),
        ]
    }

    fn inputs(&self) -> Result<Vec<String>, StepError> {
        match &self.stream {
            Some(stream) => Ok(vec![format!("{}/{}", stream.namespace, stream.name)]),
            None => Ok(vec![self.name.clone()]),
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        let from = format!("{}/{}", stream.namespace, stream.name);
        ctx.cluster
            .import_image_tag(&ctx.namespace, &format!("stable-{}", self.name), "latest", &from)
            .await
            .map_err(|err| StepError::Execution {
                step: self.name.clone(),
                message: err.to_string(),
            })
    }
}

/// Runs one declared test.
struct TestStep {
    test: TestConfiguration,
    lease_configured: bool,
    hive_configured: bool,
}

impl TestStep {
    fn leases(&self) -> &[crate::config::LeaseRequest] {
        self.test
            .multi_stage
            .as_ref()
            .map(|s| s.leases.as_slice())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Step for TestStep {
    fn name(&self) -> &str {
        &self.test.as_name
    }

    fn description(&self) -> String {
        format!("Run test {}", self.test.as_name)
    }

    fn requires(&self) -> Vec<StepLink> {
        let mut requires = Vec::new();
        if let Some(from) = &self.test.from {
            requires.push(StepLink::Image(from.clone()));
        }
        if let Some(stage) = &self.test.multi_stage {
            for step in stage.pre.iter().chain(&stage.test).chain(&stage.post) {
                if let Some(from) = &step.from {
                    requires.push(StepLink::Image(from.clone()));
                }
                for dependency in &step.dependencies {
                    if dependency.pull_spec.is_none() {
                        requires.push(StepLink::Image(dependency.name.clone()));
                    }
                }
            }
        }
        requires.sort();
        requires.dedup();
        requires
    }

    fn creates(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn inputs(&self) -> Result<Vec<String>, StepError> {
        Ok(vec![self.test.as_name.clone()])
    }

    fn validate(&self) -> Result<(), StepError> {
        if !self.leases().is_empty() && !self.lease_configured {
            return Err(StepError::NoLeaseClient);
        }
        if self.test.cluster_claim.is_some() && !self.hive_configured {
            return Err(StepError::NoHiveClient);
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let mut env: BTreeMap<String, String> = self
            .test
            .multi_stage
            .as_ref()
            .map(|s| s.environment.clone())
            .unwrap_or_default();

        let mut held = Vec::new();
        if let Some(lease_client) = &ctx.lease_client {
            for lease in self.leases() {
                let resource = lease_client
                    .acquire(&lease.resource_type, &ctx.cancel)
                    .await
                    .map_err(|err| StepError::Execution {
                        step: self.test.as_name.clone(),
                        message: format!("could not acquire lease: {err}"),
                    })?;
                if let Some(env_name) = &lease.env {
                    env.insert(env_name.clone(), resource.clone());
                }
                held.push(resource);
            }
        }

        let pod = PodRequest {
            name: self.test.as_name.clone(),
            image: format!(
                "{PIPELINE_IMAGE_STREAM}:{}",
                self.test.from.clone().unwrap_or_else(|| SOURCE_TAG.to_string())
            ),
            commands: self.test.commands.clone().unwrap_or_default(),
            env,
            labels: ctx.labels.clone(),
            node_name: None,
        };
        let result = run_test_pod(ctx, &self.test.as_name, &pod).await;

        if let Some(lease_client) = &ctx.lease_client {
            for resource in held {
                if let Err(err) = lease_client.release(&resource).await {
                    tracing::warn!(resource, error = %err, "failed to release lease");
                }
            }
        }
        result
    }
}

async fn run_test_pod(
    ctx: &ExecutionContext,
    name: &str,
    pod: &PodRequest,
) -> Result<(), StepError> {
    match ctx.cluster.submit_pod(&ctx.namespace, pod).await {
        Ok(()) => {}
        Err(err) if err.is_already_exists() => {}
        Err(err) => {
            return Err(StepError::Execution { step: name.to_string(), message: err.to_string() });
        }
    }
    let phase = ctx
        .wait_for_workload(name, || ctx.cluster.pod_phase(&ctx.namespace, &pod.name))
        .await?;
    match phase {
        WorkloadPhase::Succeeded => Ok(()),
        other => Err(StepError::Execution {
            step: name.to_string(),
            message: format!("test pod finished in phase {other:?}"),
        }),
    }
}

async fn submit_and_wait_build(
    ctx: &ExecutionContext,
    name: &str,
    build: &BuildRequest,
) -> Result<(), StepError> {
    match ctx.cluster.submit_build(&ctx.namespace, build).await {
        Ok(()) => {}
        Err(err) if err.is_already_exists() => {}
        Err(err) => {
            return Err(StepError::Execution { step: name.to_string(), message: err.to_string() });
        }
    }
    let phase = ctx
        .wait_for_workload(name, || ctx.cluster.build_phase(&ctx.namespace, &build.name))
        .await?;
    match phase {
        WorkloadPhase::Succeeded => Ok(()),
        other => Err(StepError::Execution {
            step: name.to_string(),
            message: format!("build finished in phase {other:?}"),
        }),
    }
}

/// Publishes built images to one promotion target.
struct PromotionStep {
    target: PromotionTarget,
    images: Vec<String>,
    additional_images: BTreeMap<String, String>,
}

#[async_trait::async_trait]
impl Step for PromotionStep {
    fn name(&self) -> &str {
        "[promotion]"
    }

    fn description(&self) -> String {
        format!(
            "Promote built images into the release stream {}/{}",
            self.target.namespace, self.target.name
        )
    }

    fn requires(&self) -> Vec<StepLink> {
        let mut requires: Vec<StepLink> =
            self.images.iter().cloned().map(StepLink::Image).collect();
        requires.extend(self.additional_images.values().cloned().map(StepLink::Image));
        requires
    }

    fn creates(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn inputs(&self) -> Result<Vec<String>, StepError> {
        Ok(vec![format!("{}/{}", self.target.namespace, self.target.name)])
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let named: Vec<(String, String)> = self
            .images
            .iter()
            .map(|image| (image.clone(), image.clone()))
            .chain(self.additional_images.iter().map(|(to, from)| (to.clone(), from.clone())))
            .collect();
        for (to, from) in named {
            let source = format!("{}/{PIPELINE_IMAGE_STREAM}:{from}", ctx.namespace);
            ctx.cluster
                .import_image_tag(&self.target.namespace, &self.target.name, &to, &source)
                .await
                .map_err(|err| StepError::Execution {
                    step: self.name().to_string(),
                    message: format!("could not promote {from} to {to}: {err}"),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LeaseRequest, MultiStageTestConfiguration};

    fn minimal_config() -> ReleaseBuildConfiguration {
        ReleaseBuildConfiguration {
            images: vec![ImageBuildConfiguration {
                to: "component".into(),
                from: Some(SOURCE_TAG.into()),
                dockerfile_path: None,
            }],
            tests: vec![TestConfiguration {
                as_name: "unit".into(),
                commands: Some("make test".into()),
                from: Some("component".into()),
                ..TestConfiguration::default()
            }],
            ..ReleaseBuildConfiguration::default()
        }
    }

    #[test]
    fn derives_steps_in_config_order() {
        let set = steps_from_config(&minimal_config(), &JobSpec::default(), false, false, false);
        let names: Vec<&str> = set.steps.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["src", "component", "unit"]);
        assert!(set.promotion_steps.is_empty());
    }

    #[test]
    fn promotion_steps_derived_only_when_promoting() {
        let mut config = minimal_config();
        config.promotion = Some(crate::config::PromotionConfiguration {
            to: vec![PromotionTarget {
                namespace: "ocp".into(),
                name: "4.17".into(),
                tag: None,
            }],
            additional_images: BTreeMap::new(),
        });
        let set = steps_from_config(&config, &JobSpec::default(), true, false, false);
        assert_eq!(set.promotion_steps.len(), 1);
        assert!(
            set.promotion_steps[0]
                .requires()
                .contains(&StepLink::Image("component".into()))
        );
    }

    #[test]
    fn lease_requirement_without_client_fails_validation() {
        let mut config = minimal_config();
        config.tests[0].multi_stage = Some(MultiStageTestConfiguration {
            leases: vec![LeaseRequest {
                resource_type: "aws-quota-slice".into(),
                env: Some("LEASED_RESOURCE".into()),
            }],
            ..MultiStageTestConfiguration::default()
        });
        let set = steps_from_config(&config, &JobSpec::default(), false, false, false);
        let test_step = set.steps.iter().find(|s| s.name() == "unit").unwrap();
        assert!(matches!(test_step.validate(), Err(StepError::NoLeaseClient)));

        let set = steps_from_config(&config, &JobSpec::default(), false, true, false);
        let test_step = set.steps.iter().find(|s| s.name() == "unit").unwrap();
        assert!(test_step.validate().is_ok());
    }

    #[test]
    fn cluster_claim_without_hive_fails_validation() {
        let mut config = minimal_config();
        config.tests[0].cluster_claim = Some(crate::config::ClusterClaim::default());
        let set = steps_from_config(&config, &JobSpec::default(), false, false, false);
        let test_step = set.steps.iter().find(|s| s.name() == "unit").unwrap();
        assert!(matches!(test_step.validate(), Err(StepError::NoHiveClient)));
    }

    #[tokio::test]
    async fn build_step_runs_against_memory_cluster() {
        let set = steps_from_config(&minimal_config(), &JobSpec::default(), false, false, false);
        let ctx = crate::steps::testutil::context();
        for step in &set.steps {
            step.execute(&ctx).await.unwrap();
        }
    }
}
