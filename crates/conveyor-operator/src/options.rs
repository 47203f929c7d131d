//! Invocation options and their completion.
//!
//! Flag parsing is only the first half: `complete()` resolves the job spec,
//! loads and validates the configuration, reads secrets off disk, and
//! leaves a fully-resolved [`CompletedOptions`] for the driver. Every
//! failure out of completion carries its reporting reason.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

use conveyor_core::censor::DynamicCensor;
use conveyor_core::cluster::{HttpClusterClient, Secret, SecretType};
use conveyor_core::config::{
    self, ConfigSource, HttpResolverClient, ObjectOpener, ReleaseBuildConfiguration,
    ResolverClient,
};
use conveyor_core::inputs::name_hash;
use conveyor_core::jobspec::{JobSpec, summarize_ref};
use conveyor_core::results::OperatorError;

/// Default idle TTL for the execution namespace.
const DEFAULT_IDLE_CLEANUP: Duration = Duration::from_secs(60 * 60);

/// Default hard TTL for the execution namespace.
const DEFAULT_HARD_CLEANUP: Duration = Duration::from_secs(24 * 60 * 60);

/// Name of the minted image-import pull secret.
pub const REGISTRY_PULL_SECRET: &str = "registry-pull-credentials";

/// Name of the minted image-mirror push secret.
pub const REGISTRY_PUSH_SECRET: &str = "registry-push-credentials";

/// Default name of the artifact upload secret.
pub const UPLOAD_SECRET: &str = "gcs-upload-credentials";

/// Orchestrate multi-stage image-based builds.
///
/// Reads a declarative configuration and executes the selected build steps
/// in an ephemeral namespace whose name is derived from all build inputs,
/// so identical jobs share cluster-side artifacts.
#[derive(Debug, Parser)]
#[command(name = "conveyor-operator", version, about)]
pub struct Options {
    /// The configuration file. Falls back to $CONFIG_SPEC or the resolver.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// The configuration file before resolution; resolved remotely.
    #[arg(long)]
    pub unresolved_config: Option<PathBuf>,

    /// Address of the config resolver.
    #[arg(long, default_value = "https://config.ci.svc")]
    pub resolver_address: String,

    /// One or more targets to build. Only steps required for these targets
    /// run.
    #[arg(long = "target")]
    pub targets: Vec<String>,

    /// After all targets complete, publish the built images per the
    /// promotion configuration.
    #[arg(long)]
    pub promote: bool,

    /// Print the build graph in digraph format and exit.
    #[arg(long)]
    pub print_graph: bool,

    /// Namespace to run in; `{id}` is replaced with the input hash.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Namespace build products are read from.
    #[arg(long, default_value = "stable")]
    pub base_namespace: String,

    /// Extra inputs for the build input hash, to make the namespace unique.
    #[arg(long = "input-hash")]
    pub extra_input_hash: Vec<String>,

    /// Delete the namespace after this much idle time.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub delete_when_idle: Option<Duration>,

    /// Delete the namespace after this much total time.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub delete_after: Option<Duration>,

    /// Address of the lease server. Required when a test acquires leases.
    #[arg(long)]
    pub lease_server: Option<String>,

    /// Credentials file for the lease server, `<username>:<password>`.
    #[arg(long)]
    pub lease_server_credentials_file: Option<PathBuf>,

    /// Maximum time to wait for lease acquisition.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2h")]
    pub lease_acquire_timeout: Duration,

    /// Docker config used to import images.
    #[arg(long)]
    pub image_import_pull_secret: Option<PathBuf>,

    /// Docker config used to mirror images for promotion.
    #[arg(long)]
    pub image_mirror_push_secret: Option<PathBuf>,

    /// Credentials used to upload logs and artifacts.
    #[arg(long)]
    pub gcs_upload_secret: Option<PathBuf>,

    /// Kubeconfig for the cluster-provisioning service.
    #[arg(long)]
    pub hive_kubeconfig: Option<PathBuf>,

    /// Populate the job spec from this `ORG/REPO@REF` instead of $JOB_SPEC.
    #[arg(long)]
    pub git_ref: Option<String>,

    /// Inject a test from another configuration,
    /// `ORG/REPO@BRANCH{__VARIANT}:TEST` or JSON.
    #[arg(long = "with-test-from")]
    pub inject_test: Option<String>,

    /// Keep the restricted egress policy even for tests that ask for
    /// unrestricted network access.
    #[arg(long)]
    pub restrict_network_access: bool,

    /// Environment parameter passed to multi-stage tests, `NAME=VALUE`.
    #[arg(long = "multi-stage-param")]
    pub multi_stage_params: Vec<String>,

    /// Dependency override, `ENVVARNAME=PULLSPEC`.
    #[arg(long = "dependency-override-param")]
    pub dependency_override_params: Vec<String>,

    /// Extra suffix added to the targeted test names.
    #[arg(long, default_value = "")]
    pub target_additional_suffix: String,

    /// Directories converted into secrets in the test namespace.
    #[arg(long = "secret-dir")]
    pub secret_directories: Vec<PathBuf>,

    /// Private SSH key used to clone private repositories.
    #[arg(long)]
    pub ssh_key_path: Option<PathBuf>,

    /// OAuth token used to clone private repositories.
    #[arg(long)]
    pub oauth_token_path: Option<PathBuf>,

    /// Write an env-compatible file with the job outputs.
    #[arg(long)]
    pub write_params: Option<PathBuf>,

    /// Give the pull request authors view access to the namespace.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub give_pr_author_access_to_namespace: bool,

    /// Username to impersonate for all cluster requests.
    #[arg(long = "as")]
    pub impersonate_user: Option<String>,

    /// Restrict pod scheduling to a single node.
    #[arg(long)]
    pub node: Option<String>,

    /// Maximum time a created pod may stay pending.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
    pub pod_pending_timeout: Duration,

    /// Address of the cluster API server. Falls back to the in-cluster
    /// environment.
    #[arg(long)]
    pub cluster_api_url: Option<String>,

    /// File holding the cluster API bearer token.
    #[arg(long)]
    pub cluster_token_file: Option<PathBuf>,

    /// Address of the results sink.
    #[arg(long)]
    pub results_address: Option<String>,

    /// Org of the project, for the resolver.
    #[arg(long)]
    pub org: Option<String>,

    /// Repo of the project, for the resolver.
    #[arg(long)]
    pub repo: Option<String>,

    /// Branch of the project, for the resolver.
    #[arg(long)]
    pub branch: Option<String>,

    /// Variant of the project's configuration, for the resolver.
    #[arg(long)]
    pub variant: Option<String>,

    /// Show verbose output.
    #[arg(short, long)]
    pub verbose: bool,
}

/// A clone-auth secret and the flavor it authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneAuthType {
    /// SSH private key.
    Ssh,
    /// OAuth token.
    Oauth,
}

/// Fully resolved invocation state.
pub struct CompletedOptions {
    /// The parsed flags.
    pub options: Options,
    /// The resolved job spec.
    pub job_spec: JobSpec,
    /// The validated configuration.
    pub config: ReleaseBuildConfiguration,
    /// Idle TTL and whether the user set it explicitly.
    pub idle_cleanup: (Duration, bool),
    /// Hard TTL and whether the user set it explicitly.
    pub hard_cleanup: (Duration, bool),
    /// Requested targets, after suffixing.
    pub targets: Vec<String>,
    /// Pull request authors, for namespace access.
    pub authors: Vec<String>,
    /// Clone-auth secret, when configured.
    pub clone_auth: Option<(CloneAuthType, Secret)>,
    /// Secrets read from `--secret-dir`.
    pub secrets: Vec<Secret>,
    /// Image-import pull secret.
    pub pull_secret: Option<Secret>,
    /// Image-mirror push secret.
    pub push_secret: Option<Secret>,
    /// Artifact upload secret.
    pub upload_secret: Option<Secret>,
    /// Cluster profiles needed by the targeted tests, `(target, profile)`.
    pub cluster_profiles: Vec<(String, String)>,
    /// Whether a lease client is configured.
    pub lease_configured: bool,
    /// Whether a cluster-provisioning client is configured.
    pub hive_configured: bool,
    /// The resolver client.
    pub resolver: Arc<dyn ResolverClient>,
    /// Extra inputs for the input hash, including synthetic entries.
    pub extra_inputs: Vec<String>,
}

impl std::fmt::Debug for CompletedOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedOptions")
            .field("options", &self.options)
            .field("job_spec", &self.job_spec)
            .field("config", &self.config)
            .field("idle_cleanup", &self.idle_cleanup)
            .field("hard_cleanup", &self.hard_cleanup)
            .field("targets", &self.targets)
            .field("authors", &self.authors)
            .field("clone_auth", &self.clone_auth)
            .field("secrets", &self.secrets)
            .field("pull_secret", &self.pull_secret)
            .field("push_secret", &self.push_secret)
            .field("upload_secret", &self.upload_secret)
            .field("cluster_profiles", &self.cluster_profiles)
            .field("lease_configured", &self.lease_configured)
            .field("hive_configured", &self.hive_configured)
            .field("resolver", &"<resolver client>")
            .field("extra_inputs", &self.extra_inputs)
            .finish()
    }
}

/// Reads object-store URLs that point at locally mounted paths.
struct MountedOpener;

impl ObjectOpener for MountedOpener {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

impl Options {
    /// Resolves everything the driver needs. Failures carry their
    /// reporting reason.
    pub async fn complete(self, censor: &DynamicCensor) -> Result<CompletedOptions, OperatorError> {
        let args_err = |message: String| OperatorError::for_reason("loading_args", message);

        if self.config.is_some() && self.unresolved_config.is_some() {
            return Err(args_err(
                "cannot set --config and --unresolved-config at the same time".to_string(),
            ));
        }
        if self.ssh_key_path.is_some() && self.oauth_token_path.is_some() {
            return Err(args_err(
                "both --ssh-key-path and --oauth-token-path are specified".to_string(),
            ));
        }

        // The job spec comes from the environment; --git-ref overrides or
        // replaces its refs.
        let mut job_spec = match JobSpec::from_env() {
            Ok(mut from_env) => {
                if let Some(git_ref) = &self.git_ref {
                    let from_ref = JobSpec::from_git_ref(git_ref)
                        .map_err(|err| args_err(format!("failed to resolve --git-ref: {err}")))?;
                    from_env.refs = from_ref.refs;
                }
                from_env
            }
            Err(env_err) => match &self.git_ref {
                Some(git_ref) => JobSpec::from_git_ref(git_ref)
                    .map_err(|err| args_err(format!("failed to resolve --git-ref: {err}")))?,
                None => {
                    return Err(args_err(format!(
                        "failed to determine job spec: no --git-ref passed and failed to \
                         resolve job spec from env: {env_err}"
                    )));
                }
            },
        };
        job_spec.base_namespace.clone_from(&self.base_namespace);
        job_spec.target = self.targets.first().cloned().unwrap_or_else(|| "all".to_string());

        let resolver: Arc<dyn ResolverClient> =
            Arc::new(HttpResolverClient::new(&self.resolver_address));

        // Load the configuration, by priority: file, inline, object store,
        // unresolved forms, resolver.
        let mut config = self.load_config(&job_spec, resolver.as_ref()).await?;

        if let Some(alias) = &config.canonical_go_repository {
            if self.git_ref.is_some() {
                if let Some(refs) = &mut job_spec.refs {
                    refs.path_alias = Some(alias.clone());
                }
            }
        }

        config
            .validate()
            .map_err(|err| OperatorError::for_reason("validating_config", err.to_string()))?;

        // Collect authors and guard the cache against unresolved refs.
        let mut extra_inputs = self.extra_input_hash.clone();
        let mut authors = Vec::new();
        for refs in job_spec.all_refs() {
            if refs.base_sha.is_empty() {
                tracing::debug!(
                    base_ref = %refs.base_ref,
                    "resolved SHA missing, adding synthetic input to avoid false cache hit"
                );
                extra_inputs.push(chrono::Utc::now().to_rfc3339());
            }
            tracing::info!("{}", summarize_ref(refs));
            for pull in &refs.pulls {
                authors.push(pull.author.clone());
            }
        }

        let clone_auth = self.load_clone_auth(censor)?;

        let mut secrets = Vec::new();
        for dir in &self.secret_directories {
            secrets.push(secret_from_dir(dir).map_err(args_err)?);
        }

        let pull_secret = self
            .docker_config_secret(REGISTRY_PULL_SECRET, self.image_import_pull_secret.as_deref(), censor)
            .map_err(args_err)?;
        let push_secret = self
            .docker_config_secret(REGISTRY_PUSH_SECRET, self.image_mirror_push_secret.as_deref(), censor)
            .map_err(args_err)?;
        let upload_secret_name = job_spec
            .decoration_config
            .as_ref()
            .and_then(|d| d.gcs_credentials_secret.clone())
            .unwrap_or_else(|| UPLOAD_SECRET.to_string());
        let upload_secret = self
            .opaque_secret(&upload_secret_name, self.gcs_upload_secret.as_deref(), censor)
            .map_err(args_err)?;

        // Environment-derived multi-stage parameters first, explicit flags
        // second so flags win.
        let mut env_params = BTreeMap::new();
        for (key, value) in std::env::vars() {
            if key.strip_prefix("MULTISTAGE_PARAM_OVERRIDE_").is_some() {
                env_params.insert(key, value);
            }
        }
        config.override_multi_stage_params(&env_params);
        let flag_params = config::parse_key_val_params(&self.multi_stage_params, "multi-stage-param")
            .map_err(|err| args_err(err.to_string()))?;
        config.override_multi_stage_params(&flag_params);

        let dependency_params = config::parse_key_val_params(
            &self.dependency_override_params,
            "dependency-override-param",
        )
        .map_err(|err| args_err(err.to_string()))?;
        config.apply_dependency_overrides(&dependency_params);

        let mut targets = self.targets.clone();
        config.apply_target_suffix(&mut targets, &self.target_additional_suffix);
        if let Some(first) = targets.first() {
            job_spec.target.clone_from(first);
        }
        job_spec.target_additional_suffix.clone_from(&self.target_additional_suffix);

        let cluster_profiles = targets
            .iter()
            .filter_map(|target| {
                let test = config.tests.iter().find(|t| &t.as_name == target)?;
                let profile = test.cluster_profile_name()?;
                Some((target.clone(), profile.to_string()))
            })
            .collect();

        let lease_configured =
            self.lease_server.is_some() && self.lease_server_credentials_file.is_some();
        let hive_configured = self.hive_kubeconfig.is_some();

        Ok(CompletedOptions {
            idle_cleanup: (
                self.delete_when_idle.unwrap_or(DEFAULT_IDLE_CLEANUP),
                self.delete_when_idle.is_some(),
            ),
            hard_cleanup: (
                self.delete_after.unwrap_or(DEFAULT_HARD_CLEANUP),
                self.delete_after.is_some(),
            ),
            options: self,
            job_spec,
            config,
            targets,
            authors,
            clone_auth,
            secrets,
            pull_secret,
            push_secret,
            upload_secret,
            cluster_profiles,
            lease_configured,
            hive_configured,
            resolver,
            extra_inputs,
        })
    }

    async fn load_config(
        &self,
        job_spec: &JobSpec,
        resolver: &dyn ResolverClient,
    ) -> Result<ReleaseBuildConfiguration, OperatorError> {
        if let Some(inject) = &self.inject_test {
            if self.config.is_some() || self.unresolved_config.is_some() {
                return Err(OperatorError::for_reason(
                    "loading_args",
                    "cannot request injecting test into locally provided config".to_string(),
                ));
            }
            let info = self.resolver_info(job_spec);
            return resolver
                .config_with_test(&info, inject)
                .await
                .map_err(|err| OperatorError::for_reason("config_resolver", err));
        }

        let source = if let Some(path) = &self.config {
            ConfigSource::File(path.clone())
        } else if let Ok(value) = std::env::var(config::CONFIG_SPEC_VAR) {
            ConfigSource::Inline(value)
        } else if let Ok(url) = std::env::var(config::CONFIG_SPEC_GCS_URL_VAR) {
            ConfigSource::ObjectStore(url)
        } else if let Some(path) = &self.unresolved_config {
            ConfigSource::UnresolvedFile(path.clone())
        } else if let Ok(value) = std::env::var(config::UNRESOLVED_CONFIG_VAR) {
            ConfigSource::UnresolvedInline(value)
        } else {
            ConfigSource::Resolver(self.resolver_info(job_spec))
        };

        config::load_configuration(&source, resolver, Some(&MountedOpener))
            .await
            .map_err(|err| OperatorError::for_reason(err.reason, err.message))
    }

    /// Identifies the configuration for the resolver: refs first, explicit
    /// flags override.
    fn resolver_info(&self, job_spec: &JobSpec) -> config::Metadata {
        let mut orgs = Vec::new();
        let mut repos = Vec::new();
        let mut branches = Vec::new();
        for refs in job_spec.all_refs() {
            if !refs.org.is_empty() && !refs.repo.is_empty() && !refs.base_ref.is_empty() {
                orgs.push(refs.org.clone());
                repos.push(refs.repo.clone());
                branches.push(refs.base_ref.clone());
            }
        }
        config::Metadata {
            org: self.org.clone().unwrap_or_else(|| orgs.join(",")),
            repo: self.repo.clone().unwrap_or_else(|| repos.join(",")),
            branch: self.branch.clone().unwrap_or_else(|| branches.join(",")),
            variant: self.variant.clone(),
        }
    }

    fn load_clone_auth(
        &self,
        censor: &DynamicCensor,
    ) -> Result<Option<(CloneAuthType, Secret)>, OperatorError> {
        let (auth_type, path) = match (&self.ssh_key_path, &self.oauth_token_path) {
            (Some(path), None) => (CloneAuthType::Ssh, path),
            (None, Some(path)) => (CloneAuthType::Oauth, path),
            _ => return Ok(None),
        };
        let secret = clone_secret_from_path(auth_type, path, censor).map_err(|err| {
            OperatorError::for_reason(
                "loading_args",
                format!("could not get secret from path {}: {err}", path.display()),
            )
        })?;
        Ok(Some((auth_type, secret)))
    }

    fn docker_config_secret(
        &self,
        name: &str,
        path: Option<&Path>,
        censor: &DynamicCensor,
    ) -> Result<Option<Secret>, String> {
        let Some(path) = path else { return Ok(None) };
        let data = std::fs::read(path).map_err(|err| {
            format!("could not read file {} for secret {name}: {err}", path.display())
        })?;
        censor.add_secrets([data.clone()]);
        let mut secret = Secret {
            secret_type: SecretType::DockerConfigJson,
            immutable: true,
            ..Secret::default()
        };
        secret.metadata.name = name.to_string();
        secret.data.insert(".dockerconfigjson".to_string(), data);
        Ok(Some(secret))
    }

    fn opaque_secret(
        &self,
        name: &str,
        path: Option<&Path>,
        censor: &DynamicCensor,
    ) -> Result<Option<Secret>, String> {
        let Some(path) = path else { return Ok(None) };
        let data = std::fs::read(path).map_err(|err| {
            format!("could not read file {} for secret {name}: {err}", path.display())
        })?;
        censor.add_secrets([data.clone()]);
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "credentials".to_string());
        let mut secret = Secret { immutable: true, ..Secret::default() };
        secret.metadata.name = name.to_string();
        secret.data.insert(key, data);
        Ok(Some(secret))
    }

    /// Builds the cluster client from flags or the in-cluster environment.
    pub fn cluster_client(&self) -> Result<HttpClusterClient, OperatorError> {
        let args_err = |message: String| OperatorError::for_reason("loading_args", message);

        let url = match &self.cluster_api_url {
            Some(url) => url.clone(),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST")
                    .map_err(|_| args_err("failed to load cluster config: no --cluster-api-url and not running in a cluster".to_string()))?;
                let port = std::env::var("KUBERNETES_SERVICE_PORT")
                    .unwrap_or_else(|_| "443".to_string());
                format!("https://{host}:{port}")
            }
        };
        let token_path = self
            .cluster_token_file
            .clone()
            .unwrap_or_else(|| {
                PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
            });
        let token = std::fs::read_to_string(&token_path).map_err(|err| {
            args_err(format!("could not read cluster token {}: {err}", token_path.display()))
        })?;
        HttpClusterClient::new(
            url,
            SecretString::from(token.trim().to_string()),
            self.impersonate_user.clone(),
        )
        .map_err(|err| args_err(format!("failed to construct cluster client: {err}")))
    }
}

/// Builds the clone-auth secret, named by the hash of its content.
fn clone_secret_from_path(
    auth_type: CloneAuthType,
    path: &Path,
    censor: &DynamicCensor,
) -> Result<Secret, String> {
    let raw = std::fs::read(path).map_err(|err| err.to_string())?;
    let hash = name_hash(&raw);
    let data = raw.trim_ascii().to_vec();
    censor.add_secrets([data.clone()]);

    let mut secret = Secret { immutable: true, ..Secret::default() };
    match auth_type {
        CloneAuthType::Ssh => {
            secret.metadata.name = format!("ssh-{hash}");
            secret.secret_type = SecretType::SshAuth;
            secret.data.insert("ssh-privatekey".to_string(), data);
        }
        CloneAuthType::Oauth => {
            secret.metadata.name = format!("oauth-{hash}");
            secret.secret_type = SecretType::BasicAuth;
            secret.data.insert("oauth-token".to_string(), data.clone());
            // A git source-strategy build authenticates with these keys.
            secret.data.insert("username".to_string(), data.clone());
            secret.data.insert("password".to_string(), data);
        }
    }
    Ok(secret)
}

/// Converts a directory of files into a secret. A directory containing a
/// single `.dockercfg` or `config.json` file becomes a pull secret.
fn secret_from_dir(dir: &Path) -> Result<Secret, String> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("cannot derive a secret name from {}", dir.display()))?;
    let mut secret = Secret { immutable: true, ..Secret::default() };
    secret.metadata.name = name.clone();

    let entries = std::fs::read_dir(dir)
        .map_err(|err| format!("failed to generate secret {name}: {err}"))?;
    for entry in entries {
        let entry = entry.map_err(|err| format!("failed to generate secret {name}: {err}"))?;
        if !entry.path().is_file() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().into_owned();
        let data = std::fs::read(entry.path())
            .map_err(|err| format!("failed to generate secret {name}: {err}"))?;
        secret.data.insert(key, data);
    }

    if secret.data.len() == 1 {
        if secret.data.contains_key(".dockercfg") {
            secret.secret_type = SecretType::Dockercfg;
        } else if secret.data.contains_key("config.json") {
            secret.secret_type = SecretType::DockerConfigJson;
        }
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("conveyor-operator").chain(args.iter().copied()))
            .unwrap()
    }

    #[tokio::test]
    async fn config_flags_are_mutually_exclusive() {
        let options = parse(&["--config", "a.yaml", "--unresolved-config", "b.yaml"]);
        let censor = DynamicCensor::new();
        let err = options.complete(&censor).await.unwrap_err();
        assert_eq!(err.reason(), "loading_args");
        assert!(err.to_string().contains("--config and --unresolved-config"));
    }

    #[tokio::test]
    async fn clone_auth_flags_are_mutually_exclusive() {
        let options = parse(&["--ssh-key-path", "key", "--oauth-token-path", "token"]);
        let censor = DynamicCensor::new();
        let err = options.complete(&censor).await.unwrap_err();
        assert!(err.to_string().contains("--ssh-key-path and --oauth-token-path"));
    }

    #[test]
    fn targets_are_repeatable() {
        let options = parse(&["--target", "unit", "--target", "e2e"]);
        assert_eq!(options.targets, vec!["unit", "e2e"]);
    }

    #[test]
    fn ssh_clone_secret_is_named_by_content_hash() {
        let censor = DynamicCensor::new();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        std::fs::write(&key_path, b"private-key-material\n").unwrap();

        let secret = clone_secret_from_path(CloneAuthType::Ssh, &key_path, &censor).unwrap();
        assert!(secret.metadata.name.starts_with("ssh-"));
        assert_eq!(secret.metadata.name.len(), "ssh-".len() + 8);
        assert!(secret.immutable);
        assert_eq!(secret.data["ssh-privatekey"], b"private-key-material".to_vec());
        // The key material is registered with the censor.
        assert_eq!(censor.censor_str("private-key-material"), "CENSORED");
    }

    #[test]
    fn oauth_clone_secret_carries_basic_auth_keys() {
        let censor = DynamicCensor::new();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, b"gh-token").unwrap();

        let secret = clone_secret_from_path(CloneAuthType::Oauth, &token_path, &censor).unwrap();
        assert!(secret.metadata.name.starts_with("oauth-"));
        assert_eq!(secret.data["username"], b"gh-token".to_vec());
        assert_eq!(secret.data["password"], b"gh-token".to_vec());
    }

    #[test]
    fn secret_dir_detects_pull_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("registry-bundle");
        std::fs::create_dir(&bundle).unwrap();
        std::fs::write(bundle.join("config.json"), b"{}").unwrap();

        let secret = secret_from_dir(&bundle).unwrap();
        assert_eq!(secret.metadata.name, "registry-bundle");
        assert_eq!(secret.secret_type, SecretType::DockerConfigJson);
    }
}
