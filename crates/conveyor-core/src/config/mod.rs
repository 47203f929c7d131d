//! Release build configuration.
//!
//! The declarative description of a repository's build surface: images,
//! tests, release pointers, and promotion rules. Immutable after load;
//! [`ReleaseBuildConfiguration::validate`] must pass before any steps are
//! derived from it.

mod load;

pub use load::{
    CONFIG_SPEC_GCS_URL_VAR, CONFIG_SPEC_VAR, ClusterProfileDetails, ConfigSource,
    HttpResolverClient, LoadError, ObjectOpener, ResolverClient, UNRESOLVED_CONFIG_VAR,
    load_configuration, read_bytes_maybe_gzip, read_file_maybe_gzip,
};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a configuration within the config store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Organization.
    #[serde(default)]
    pub org: String,
    /// Repository.
    #[serde(default)]
    pub repo: String,
    /// Branch.
    #[serde(default)]
    pub branch: String,
    /// Optional variant discriminator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Metadata {
    /// Whether no identity is recorded at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.org.is_empty() && self.repo.is_empty() && self.branch.is_empty() && self.variant.is_none()
    }
}

/// A named build product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildConfiguration {
    /// Output tag of the image.
    pub to: String,
    /// Base image tag the build starts from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Path of the Dockerfile relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
}

/// Pointer to an integrated stream in an external registry namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationStream {
    /// Namespace holding the stream.
    pub namespace: String,
    /// Stream name.
    pub name: String,
}

/// Source of a named release payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseConfiguration {
    /// Integration pointer assembling the release from a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationStream>,
}

/// A single promotion target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionTarget {
    /// Namespace promoted images land in.
    pub namespace: String,
    /// Stream name promoted images land in.
    pub name: String,
    /// Tag override; defaults to the branch name upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Rules for publishing built images after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionConfiguration {
    /// Targets to promote to.
    #[serde(default)]
    pub to: Vec<PromotionTarget>,
    /// Extra images to promote under different names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_images: BTreeMap<String, String>,
}

/// An externally hosted image referenced by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalImage {
    /// Name the image is referenced by.
    pub name: String,
    /// Full pull spec of the image.
    pub pull_spec: String,
    /// Name of the pull secret needed to fetch it, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
}

/// A dependency injected into a multi-stage step as an environment variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDependency {
    /// Image name the dependency resolves.
    pub name: String,
    /// Environment variable the pull spec is exposed as.
    pub env: String,
    /// Resolved pull spec override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_spec: Option<String>,
}

/// One literal step of a multi-stage test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralTestStep {
    /// Step name.
    #[serde(rename = "as")]
    pub as_name: String,
    /// Image tag the step runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Commands executed by the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<String>,
    /// Dependencies exposed to the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<StepDependency>,
}

/// A lease a test must hold while running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Resource type managed by the lease server.
    pub resource_type: String,
    /// Environment variable the leased resource name is exposed as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

/// The resolved (literal) form of a multi-stage test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiStageTestConfiguration {
    /// Cluster profile the test provisions against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_profile: Option<String>,
    /// Environment parameters shared by all steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Dependency overrides applied to all phases.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency_overrides: BTreeMap<String, String>,
    /// Leases acquired for the duration of the test.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leases: Vec<LeaseRequest>,
    /// Setup steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<LiteralTestStep>,
    /// Test steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<LiteralTestStep>,
    /// Teardown steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<LiteralTestStep>,
}

/// A claim for a pre-provisioned cluster from a cluster pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterClaim {
    /// Cloud the claimed cluster runs on.
    #[serde(default)]
    pub cloud: String,
    /// Owning pool namespace.
    #[serde(default)]
    pub owner: String,
    /// Product version of the claimed cluster.
    #[serde(default)]
    pub version: String,
}

/// A declarative test recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfiguration {
    /// Test name; also the target name selecting it.
    #[serde(rename = "as")]
    pub as_name: String,
    /// Commands for simple container tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<String>,
    /// Image tag simple container tests run in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Cron schedule for periodic execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Interval schedule for periodic execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Cluster profile for simple tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_profile: Option<String>,
    /// Whether the test namespace keeps the restricted egress policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_network_access: Option<bool>,
    /// Resolved multi-stage recipe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_stage: Option<MultiStageTestConfiguration>,
    /// Claim for a pre-provisioned cluster instead of a fresh install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_claim: Option<ClusterClaim>,
}

impl TestConfiguration {
    /// The cluster profile name the test provisions against, from either the
    /// simple or the multi-stage form.
    #[must_use]
    pub fn cluster_profile_name(&self) -> Option<&str> {
        self.cluster_profile
            .as_deref()
            .or_else(|| self.multi_stage.as_ref()?.cluster_profile.as_deref())
    }
}

/// The full declarative build surface of one repository branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBuildConfiguration {
    /// Identity of this configuration.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    /// Named build products.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageBuildConfiguration>,
    /// Base images imported into the pipeline by tag name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub base_images: BTreeMap<String, IntegrationStream>,
    /// Test recipes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestConfiguration>,
    /// Named release payloads.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub releases: BTreeMap<String, ReleaseConfiguration>,
    /// Stream all output tags anchor to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_specification: Option<IntegrationStream>,
    /// Promotion rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionConfiguration>,
    /// Externally hosted images.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_images: Vec<ExternalImage>,
    /// Canonical import path of the repository, when it differs from org/repo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_go_repository: Option<String>,
}

/// A configuration validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The YAML did not parse.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// One or more semantic invariants were violated.
    #[error("invalid configuration:{}", .0.iter().map(|e| format!("\n  * {e}")).collect::<String>())]
    Invalid(Vec<String>),

    /// A key=value parameter did not parse.
    #[error("could not parse {param_type}: {value:?} is not in the format key=value")]
    MalformedParam {
        /// Which parameter family was being parsed.
        param_type: &'static str,
        /// The rejected value.
        value: String,
    },
}

impl ReleaseBuildConfiguration {
    /// Parses a configuration from YAML, strictly.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Names of images known to the pipeline: built images, base images, and
    /// external images.
    fn known_image_names(&self) -> BTreeSet<&str> {
        let mut known: BTreeSet<&str> = self.images.iter().map(|i| i.to.as_str()).collect();
        known.extend(self.base_images.keys().map(String::as_str));
        known.extend(self.external_images.iter().map(|e| e.name.as_str()));
        known.insert("src");
        known
    }

    /// Checks the semantic invariants: every referenced image resolves, every
    /// test references only known images, test and image names are unique,
    /// and promotion targets are unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();
        let known = self.known_image_names();

        let mut image_names = BTreeSet::new();
        for image in &self.images {
            if !image_names.insert(image.to.as_str()) {
                errs.push(format!("images: duplicate output tag {:?}", image.to));
            }
            if let Some(from) = &image.from {
                if !known.contains(from.as_str()) {
                    errs.push(format!(
                        "images[{}]: base image {:?} does not resolve",
                        image.to, from
                    ));
                }
            }
        }

        let mut test_names = BTreeSet::new();
        for test in &self.tests {
            if !test_names.insert(test.as_name.as_str()) {
                errs.push(format!("tests: duplicate name {:?}", test.as_name));
            }
            if test.cron.is_some() && test.interval.is_some() {
                errs.push(format!(
                    "tests[{}]: cron and interval are mutually exclusive",
                    test.as_name
                ));
            }
            if let Some(from) = &test.from {
                if !known.contains(from.as_str()) {
                    errs.push(format!(
                        "tests[{}]: image {:?} is not a known image",
                        test.as_name, from
                    ));
                }
            }
            if let Some(stage) = &test.multi_stage {
                for step in stage.pre.iter().chain(&stage.test).chain(&stage.post) {
                    for dependency in &step.dependencies {
                        if dependency.pull_spec.is_none()
                            && !known.contains(dependency.name.as_str())
                        {
                            errs.push(format!(
                                "tests[{}]: step {:?} dependency {:?} is not a known image",
                                test.as_name, step.as_name, dependency.name
                            ));
                        }
                    }
                }
            }
        }

        if let Some(promotion) = &self.promotion {
            let mut targets = BTreeSet::new();
            for target in &promotion.to {
                let key = (
                    target.namespace.as_str(),
                    target.name.as_str(),
                    target.tag.as_deref(),
                );
                if !targets.insert(key) {
                    errs.push(format!(
                        "promotion: duplicate target {}/{}",
                        target.namespace, target.name
                    ));
                }
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errs))
        }
    }

    /// Injects multi-stage environment overrides into every multi-stage test.
    /// Later calls win, so the caller applies environment-derived overrides
    /// before explicit flags.
    pub fn override_multi_stage_params(&mut self, params: &BTreeMap<String, String>) {
        for test in &mut self.tests {
            if let Some(stage) = &mut test.multi_stage {
                for (name, value) in params {
                    let trimmed = value.trim_matches(|c| c == '"' || c == '\'');
                    stage
                        .environment
                        .insert(name.clone(), trimmed.to_string());
                }
            }
        }
    }

    /// Rewrites the pull spec of every step dependency whose environment
    /// variable name matches `name`, case-insensitively.
    pub fn override_step_dependency(&mut self, name: &str, pull_spec: &str) {
        for test in &mut self.tests {
            if let Some(stage) = &mut test.multi_stage {
                for step in stage
                    .pre
                    .iter_mut()
                    .chain(stage.test.iter_mut())
                    .chain(stage.post.iter_mut())
                {
                    for dependency in &mut step.dependencies {
                        if dependency.env.eq_ignore_ascii_case(name) {
                            dependency.pull_spec = Some(pull_spec.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Applies configuration-level dependency overrides, then the supplied
    /// parameter overrides; explicit parameters always take precedence.
    pub fn apply_dependency_overrides(&mut self, params: &BTreeMap<String, String>) {
        let config_level: Vec<(String, String)> = self
            .tests
            .iter()
            .filter_map(|t| t.multi_stage.as_ref())
            .flat_map(|s| s.dependency_overrides.clone())
            .collect();
        for (name, pull_spec) in &config_level {
            self.override_step_dependency(name, pull_spec);
        }
        for (name, pull_spec) in params {
            self.override_step_dependency(name, pull_spec);
        }
    }

    /// Renames each targeted test to `<as>-<suffix>`, returning the renamed
    /// targets in order.
    pub fn apply_target_suffix(&mut self, targets: &mut [String], suffix: &str) {
        if suffix.is_empty() {
            return;
        }
        for test in &mut self.tests {
            if let Some(slot) = targets.iter_mut().find(|t| **t == test.as_name) {
                let renamed = format!("{}-{suffix}", test.as_name);
                tracing::debug!(target = %renamed, "added suffix to target");
                test.as_name.clone_from(&renamed);
                *slot = renamed;
            }
        }
    }
}

/// Parses repeatable `key=value` parameters, aggregating all failures.
pub fn parse_key_val_params(
    input: &[String],
    param_type: &'static str,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut params = BTreeMap::new();
    let mut errs = Vec::new();
    for param in input {
        match param.split_once('=') {
            Some((key, value)) => {
                params.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => errs.push(format!(
                "could not parse {param_type}: {param} is not in the format key=value"
            )),
        }
    }
    if errs.is_empty() {
        Ok(params)
    } else {
        Err(ConfigError::Invalid(errs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_test(test: TestConfiguration) -> ReleaseBuildConfiguration {
        ReleaseBuildConfiguration {
            images: vec![ImageBuildConfiguration {
                to: "component".into(),
                from: Some("src".into()),
                dockerfile_path: None,
            }],
            tests: vec![test],
            ..ReleaseBuildConfiguration::default()
        }
    }

    #[test]
    fn parses_minimal_yaml() {
        let config = ReleaseBuildConfiguration::from_yaml(
            "metadata:\n  org: acme\n  repo: widget\n  branch: main\ntests:\n- as: unit\n  commands: make test\n  from: src\n",
        )
        .unwrap();
        assert_eq!(config.metadata.org, "acme");
        assert_eq!(config.tests[0].as_name, "unit");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_test_image() {
        let config = config_with_test(TestConfiguration {
            as_name: "unit".into(),
            from: Some("missing".into()),
            ..TestConfiguration::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not a known image"), "{err}");
    }

    #[test]
    fn rejects_duplicate_promotion_targets() {
        let mut config = config_with_test(TestConfiguration {
            as_name: "unit".into(),
            ..TestConfiguration::default()
        });
        config.promotion = Some(PromotionConfiguration {
            to: vec![
                PromotionTarget { namespace: "ocp".into(), name: "4.17".into(), tag: None },
                PromotionTarget { namespace: "ocp".into(), name: "4.17".into(), tag: None },
            ],
            additional_images: BTreeMap::new(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate target"), "{err}");
    }

    #[test]
    fn rejects_cron_and_interval_together() {
        let config = config_with_test(TestConfiguration {
            as_name: "nightly".into(),
            cron: Some("0 0 * * *".into()),
            interval: Some("24h".into()),
            ..TestConfiguration::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn multi_stage_param_overrides_strip_quotes() {
        let mut config = config_with_test(TestConfiguration {
            as_name: "e2e".into(),
            multi_stage: Some(MultiStageTestConfiguration::default()),
            ..TestConfiguration::default()
        });
        let mut params = BTreeMap::new();
        params.insert("REGION".to_string(), "\"us-east-1\"".to_string());
        config.override_multi_stage_params(&params);
        let stage = config.tests[0].multi_stage.as_ref().unwrap();
        assert_eq!(stage.environment["REGION"], "us-east-1");
    }

    #[test]
    fn dependency_override_matches_env_case_insensitively() {
        let mut config = config_with_test(TestConfiguration {
            as_name: "e2e".into(),
            multi_stage: Some(MultiStageTestConfiguration {
                test: vec![LiteralTestStep {
                    as_name: "run".into(),
                    dependencies: vec![StepDependency {
                        name: "component".into(),
                        env: "OO_INDEX".into(),
                        pull_spec: None,
                    }],
                    ..LiteralTestStep::default()
                }],
                ..MultiStageTestConfiguration::default()
            }),
            ..TestConfiguration::default()
        });
        let mut params = BTreeMap::new();
        params.insert("oo_index".to_string(), "registry.example/pushed/image".to_string());
        config.apply_dependency_overrides(&params);
        let stage = config.tests[0].multi_stage.as_ref().unwrap();
        assert_eq!(
            stage.test[0].dependencies[0].pull_spec.as_deref(),
            Some("registry.example/pushed/image")
        );
    }

    #[test]
    fn target_suffix_renames_test_and_target() {
        let mut config = config_with_test(TestConfiguration {
            as_name: "e2e".into(),
            ..TestConfiguration::default()
        });
        let mut targets = vec!["e2e".to_string()];
        config.apply_target_suffix(&mut targets, "agg-0");
        assert_eq!(config.tests[0].as_name, "e2e-agg-0");
        assert_eq!(targets[0], "e2e-agg-0");
    }

    #[test]
    fn parse_key_val_params_aggregates_errors() {
        let input = vec!["A=1".to_string(), "broken".to_string(), "B=2".to_string()];
        let err = parse_key_val_params(&input, "multi-stage-param").unwrap_err();
        assert!(err.to_string().contains("broken"), "{err}");
        let ok = parse_key_val_params(&input[..1].to_vec(), "multi-stage-param").unwrap();
        assert_eq!(ok["A"], "1");
    }
}
