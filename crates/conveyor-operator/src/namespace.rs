//! Ephemeral execution namespace management.
//!
//! The namespace is created on first reference, initialized through a
//! strict sequence (project request, RBAC warm-up, TTL annotations, pull
//! secrets, access grants, minted secrets, the pipeline image stream, and a
//! disruption budget), heartbeated while the run is live, and reaped by an
//! external TTL controller. On interrupt the namespace contents are dumped
//! to the artifact directory for later review.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use conveyor_core::artifacts::{self, NAMESPACE_DIR};
use conveyor_core::censor::DynamicCensor;
use conveyor_core::cluster::{
    ClusterClient, ImageStream, NamespacePhase, ObjectMeta, PodDisruptionBudget, ProjectRequest,
    RoleBinding, Secret, Subject,
};
use conveyor_core::jobspec::JobSpec;
use conveyor_core::steps::PIPELINE_IMAGE_STREAM;

use crate::options::CompletedOptions;

/// Idle-TTL annotation honored by the namespace reaper.
pub const ANNOTATION_IDLE_TTL: &str = "conveyor.ci/ttl.idle";

/// Hard-TTL annotation honored by the namespace reaper.
pub const ANNOTATION_HARD_TTL: &str = "conveyor.ci/ttl.hard";

/// Liveness annotation refreshed by the heartbeat.
pub const ANNOTATION_LAST_ACTIVE: &str = "conveyor.ci/last-active";

/// Label applied to every object the orchestrator creates.
pub const CREATED_BY_LABEL: &str = "conveyor.ci/created-by";

/// How often the liveness annotation is refreshed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How many 1 Hz attempts to give RBAC propagation.
const RBAC_ATTEMPTS: u32 = 30;

/// How many 1 Hz attempts to give pull-secret minting.
const PULL_SECRET_ATTEMPTS: u32 = 299;

/// Labels identifying the job on the namespace and its workloads.
pub fn job_labels(job_spec: &JobSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CREATED_BY_LABEL.to_string(), "true".to_string());
    if let Some(refs) = &job_spec.refs {
        labels.insert("conveyor.ci/org".to_string(), refs.org.clone());
        labels.insert("conveyor.ci/repo".to_string(), refs.repo.clone());
        labels.insert("conveyor.ci/branch".to_string(), refs.base_ref.clone());
    }
    labels
}

/// Creates and initializes the execution namespace. Idempotent: an existing
/// object is never an error, and TTL annotations set by a previous run are
/// preserved unless the user asked for new values.
pub async fn initialize_namespace(
    completed: &CompletedOptions,
    cluster: &Arc<dyn ClusterClient>,
    namespace: &str,
) -> Result<()> {
    tracing::debug!(namespace, "creating namespace");

    create_project(completed, cluster.as_ref(), namespace).await?;
    wait_for_rbac(cluster.as_ref(), namespace).await?;
    annotate_namespace(completed, cluster.as_ref(), namespace).await?;
    relax_egress_if_requested(completed, cluster.as_ref(), namespace).await?;
    wait_for_pull_secrets(cluster.as_ref(), namespace).await?;

    if completed.options.give_pr_author_access_to_namespace && !completed.authors.is_empty() {
        let binding = author_access_role_binding(namespace, &completed.authors);
        tracing::debug!(authors = ?completed.authors, "creating author access rolebinding");
        match cluster.create_role_binding(namespace, &binding).await {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err).context("could not create role binding"),
        }
    }

    for secret in [&completed.pull_secret, &completed.push_secret, &completed.upload_secret]
        .into_iter()
        .flatten()
    {
        match cluster.create_secret(namespace, secret).await {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("couldn't create secret {}", secret.metadata.name));
            }
        }
    }

    tracing::debug!("setting up pipeline image stream for the test");
    let stream = ImageStream {
        metadata: ObjectMeta {
            name: PIPELINE_IMAGE_STREAM.to_string(),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        // pipeline:* tags are directly referenceable inside the namespace.
        lookup_policy_local: true,
    };
    match cluster.create_image_stream(namespace, &stream).await {
        Ok(()) => {}
        Err(err) if err.is_already_exists() => {}
        Err(err) => return Err(err).context("could not set up pipeline imagestream for test"),
    }

    if let Some((auth_type, secret)) = &completed.clone_auth {
        match cluster.create_secret(namespace, secret).await {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "couldn't create secret {} for {auth_type:?} authentication",
                        secret.metadata.name
                    )
                });
            }
        }
    }

    // Cluster-profile secrets come from the resolver plus the central `ci`
    // namespace; external-image pull secrets from `test-credentials`.
    let mut derived_secrets: Vec<Secret> = Vec::new();
    for (target, profile) in &completed.cluster_profiles {
        let secret = cluster_profile_secret(completed, cluster.as_ref(), target, profile)
            .await
            .with_context(|| format!("failed to create cluster profile secret {profile}"))?;
        derived_secrets.push(secret);
    }
    for image in &completed.config.external_images {
        if let Some(pull_secret) = &image.pull_secret {
            let source = cluster
                .get_secret("test-credentials", pull_secret)
                .await
                .with_context(|| {
                    format!("failed to get secret {pull_secret:?} from test-credentials namespace")
                })?;
            derived_secrets.push(Secret {
                metadata: ObjectMeta {
                    name: format!("external-pull-secret-{pull_secret}"),
                    ..ObjectMeta::default()
                },
                data: source.data,
                secret_type: conveyor_core::cluster::SecretType::DockerConfigJson,
                immutable: true,
            });
        }
    }
    let user_secrets = completed.secrets.iter().cloned();
    for secret in user_secrets.chain(derived_secrets) {
        let created = cluster
            .upsert_immutable_secret(namespace, &secret)
            .await
            .with_context(|| format!("could not update secret {}", secret.metadata.name))?;
        if created {
            tracing::debug!(secret = %secret.metadata.name, "created secret");
        } else {
            tracing::debug!(secret = %secret.metadata.name, "updated secret");
        }
    }

    let pdb = PodDisruptionBudget {
        metadata: ObjectMeta {
            name: format!("conveyor-{}", CREATED_BY_LABEL.replace('/', "-")),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        max_unavailable: 0,
        selector_key: CREATED_BY_LABEL.to_string(),
    };
    cluster
        .ensure_pod_disruption_budget(namespace, &pdb)
        .await
        .with_context(|| format!("failed to create pdb for label key {CREATED_BY_LABEL}"))?;
    tracing::debug!(label = CREATED_BY_LABEL, "created pdb for labelled pods");
    Ok(())
}

async fn create_project(
    completed: &CompletedOptions,
    cluster: &dyn ClusterClient,
    namespace: &str,
) -> Result<()> {
    let job_spec = &completed.job_spec;
    let request = ProjectRequest {
        name: namespace.to_string(),
        display_name: format!("{namespace} - {}", job_spec.job),
        description: job_description(job_spec),
        labels: BTreeMap::from([(
            "conveyor.ci/requester".to_string(),
            "conveyor-operator".to_string(),
        )]),
    };

    let auth_warmup = Duration::from_secs(15);
    let begin = tokio::time::Instant::now();
    loop {
        match cluster.create_project_request(&request).await {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err).context("could not set up namespace for test"),
        }
        match cluster.get_namespace(namespace).await {
            Ok(ns) if ns.phase == NamespacePhase::Terminating => {
                tracing::info!("waiting for namespace to finish terminating before creating another");
                tokio::time::sleep(Duration::from_secs(3)).await;
                continue;
            }
            Ok(_) => break,
            Err(err) if err.is_not_found() => continue,
            // Give the authentication caches a moment to catch up.
            Err(err) if err.is_forbidden() && begin.elapsed() < auth_warmup => {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to wait for authentication cache to warm up after {auth_warmup:?}")
                });
            }
        }
    }
    Ok(())
}

async fn wait_for_rbac(cluster: &dyn ClusterClient, namespace: &str) -> Result<()> {
    let start = tokio::time::Instant::now();
    for attempt in 0..RBAC_ATTEMPTS {
        match cluster.can_i(namespace, "create", "rolebindings").await {
            Ok(true) => {
                tracing::debug!(elapsed = ?start.elapsed(), "rbac initialized in the new namespace");
                return Ok(());
            }
            Ok(false) => {
                tracing::debug!("[{attempt}/{RBAC_ATTEMPTS}] rbac in namespace not yet ready, sleeping");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to create access review while checking namespace initialization");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tracing::error!("timed out waiting for RBAC to initialize in the test namespace");
    bail!("timed out waiting for RBAC")
}

async fn annotate_namespace(
    completed: &CompletedOptions,
    cluster: &dyn ClusterClient,
    namespace: &str,
) -> Result<()> {
    let (idle_ttl, idle_set) = completed.idle_cleanup;
    let (hard_ttl, hard_set) = completed.hard_cleanup;

    let mut updates = BTreeMap::new();
    if idle_ttl > Duration::ZERO {
        updates.insert(
            ANNOTATION_IDLE_TTL.to_string(),
            humantime::format_duration(idle_ttl).to_string(),
        );
    }
    if hard_ttl > Duration::ZERO {
        updates.insert(
            ANNOTATION_HARD_TTL.to_string(),
            humantime::format_duration(hard_ttl).to_string(),
        );
    }
    // The value is refreshed whenever the namespace is reused.
    updates.insert(ANNOTATION_LAST_ACTIVE.to_string(), chrono::Utc::now().to_rfc3339());

    let mut ns = cluster
        .get_namespace(namespace)
        .await
        .context("could not read namespace to annotate")?;
    for (key, value) in &updates {
        // TTLs set by an earlier run stay in place unless the user asked.
        let preserve = match key.as_str() {
            ANNOTATION_IDLE_TTL => !idle_set,
            ANNOTATION_HARD_TTL => !hard_set,
            _ => false,
        };
        if preserve && ns.metadata.annotations.contains_key(key) {
            continue;
        }
        ns.metadata.annotations.insert(key.clone(), value.clone());
    }
    for (key, value) in job_labels(&completed.job_spec) {
        ns.metadata.labels.insert(key, value);
    }

    match cluster.update_namespace(&ns).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_forbidden() => {
            tracing::warn!("could not edit namespace: no permission to update it");
            Ok(())
        }
        Err(err) => {
            Err(err).context("could not update namespace to add labels, TTLs and active annotations")
        }
    }
}

async fn relax_egress_if_requested(
    completed: &CompletedOptions,
    cluster: &dyn ClusterClient,
    namespace: &str,
) -> Result<()> {
    let wants_intranet = completed.config.tests.iter().any(|test| {
        completed.targets.contains(&test.as_name)
            && test.restrict_network_access == Some(false)
    });
    if !wants_intranet || completed.options.restrict_network_access {
        return Ok(());
    }

    tracing::debug!(namespace, "deleting egress firewall");
    match cluster.delete_egress_firewall(namespace, "default").await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            tracing::warn!("egress firewall does not exist: {err}");
            Ok(())
        }
        Err(conveyor_core::cluster::ClusterError::KindNotFound(kind)) => {
            tracing::warn!(kind, "egress firewall kind not installed");
            Ok(())
        }
        Err(err) => Err(err).context("could not delete egress firewall"),
    }
}

async fn wait_for_pull_secrets(cluster: &dyn ClusterClient, namespace: &str) -> Result<()> {
    let start = tokio::time::Instant::now();
    for attempt in 0..PULL_SECRET_ATTEMPTS {
        let mut minted = true;
        for account in ["builder", "default"] {
            match cluster.get_service_account(namespace, account).await {
                Ok(sa) => minted = minted && !sa.image_pull_secrets.is_empty(),
                Err(err) if err.is_not_found() => minted = false,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to fetch service account {account}"));
                }
            }
        }
        if minted {
            tracing::debug!(elapsed = ?start.elapsed(), "image pull secrets initialized");
            return Ok(());
        }
        tracing::debug!(
            "[{attempt}/{PULL_SECRET_ATTEMPTS}] image pull secrets in namespace not yet ready, sleeping"
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tracing::error!("timed out waiting for image pull secrets in the test namespace");
    bail!("timed out waiting for image pull secrets")
}

async fn cluster_profile_secret(
    completed: &CompletedOptions,
    cluster: &dyn ClusterClient,
    target: &str,
    profile: &str,
) -> Result<Secret> {
    let details = completed
        .resolver
        .cluster_profile(profile)
        .await
        .map_err(|err| anyhow::anyhow!(err))
        .with_context(|| format!("failed to retrieve details for cluster profile {profile}"))?;
    let source = cluster
        .get_secret("ci", &details.secret)
        .await
        .with_context(|| format!("failed to get secret {:?} from ci namespace", details.secret))?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: format!("{target}-cluster-profile"),
            ..ObjectMeta::default()
        },
        data: source.data,
        secret_type: source.secret_type,
        immutable: true,
    })
}

/// The role binding granting pull request authors view access. Authors are
/// deduplicated and sorted so the object is stable across runs.
pub fn author_access_role_binding(namespace: &str, authors: &[String]) -> RoleBinding {
    let mut sorted: Vec<&String> = authors.iter().collect();
    sorted.sort();
    sorted.dedup();
    RoleBinding {
        metadata: ObjectMeta {
            name: "conveyor-author-access".to_string(),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        subjects: sorted
            .into_iter()
            .map(|author| Subject { kind: "Group".to_string(), name: format!("{author}-group") })
            .collect(),
        role_kind: "ClusterRole".to_string(),
        role_name: "view".to_string(),
    }
}

/// Renders the namespace description from the job spec.
fn job_description(job_spec: &JobSpec) -> String {
    let Some(refs) = &job_spec.refs else {
        return job_spec.job.clone();
    };
    let links: Vec<String> = refs
        .pulls
        .iter()
        .map(|pull| {
            format!(
                "https://github.com/{}/{}/pull/{} - {}",
                refs.org, refs.repo, pull.number, pull.author
            )
        })
        .collect();
    if links.is_empty() {
        format!(
            "{} on https://github.com/{}/{} ref={} commit={}",
            job_spec.job, refs.org, refs.repo, refs.base_ref, refs.base_sha
        )
    } else {
        format!(
            "{}\n\n{} on https://github.com/{}/{}",
            links.join("\n"),
            job_spec.job,
            refs.org,
            refs.repo
        )
    }
}

/// Describes the job for cluster events.
pub fn event_job_description(job_spec: &JobSpec, namespace: &str) -> String {
    let Some(refs) = &job_spec.refs else {
        return format!("Running job {} in namespace {namespace}", job_spec.job);
    };
    match refs.pulls.as_slice() {
        [] => format!("Running job {} in namespace {namespace}", job_spec.job),
        [pull] => format!(
            "Running job {} for PR https://github.com/{}/{}/pull/{} in namespace {namespace} from author {}",
            job_spec.job, refs.org, refs.repo, pull.number, pull.author
        ),
        pulls => {
            let links: Vec<String> = pulls
                .iter()
                .map(|p| format!("https://github.com/{}/{}/pull/{}", refs.org, refs.repo, p.number))
                .collect();
            let authors: Vec<&str> = pulls.iter().map(|p| p.author.as_str()).collect();
            format!(
                "Running job {} for PRs ({}) in namespace {namespace} from authors ({})",
                job_spec.job,
                links.join(", "),
                authors.join(", ")
            )
        }
    }
}

/// Refreshes the liveness annotation until cancelled. Failures are logged,
/// never fatal.
pub async fn run_heartbeat(
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and the namespace was just active.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let annotations = BTreeMap::from([(
                    ANNOTATION_LAST_ACTIVE.to_string(),
                    chrono::Utc::now().to_rfc3339(),
                )]);
                if let Err(err) = cluster.patch_namespace_annotations(&namespace, &annotations).await {
                    tracing::warn!(namespace, error = %err, "failed to patch the namespace liveness annotation");
                }
            }
        }
    }
}

/// Watches the namespace and cancels the run when its deletion begins. The
/// watch reconnects whenever the channel closes and exits only on context
/// cancellation.
pub async fn monitor_namespace(
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    cancel: CancellationToken,
) {
    loop {
        let mut events = match cluster.watch_namespace(&namespace).await {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(error = %err, "could not start a watch on our test namespace");
                cancel.cancel();
                return;
            }
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        None => break, // reconnect
                        Some(event) => {
                            if event.name == namespace && event.deletion_timestamp.is_some() {
                                tracing::info!(
                                    "the namespace in which this test is executing has been deleted, cancelling"
                                );
                                cancel.cancel();
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Dumps namespace objects to the artifact directory, best effort. Each
/// failure is logged; none aborts teardown.
pub async fn save_namespace_artifacts(
    cluster: &Arc<dyn ClusterClient>,
    censor: &DynamicCensor,
    namespace: &str,
) {
    let Some(root) = artifacts::artifact_dir() else {
        return;
    };
    for resource in ["pods", "events", "builds", "imagestreams", "templateinstances"] {
        match cluster.list_raw(namespace, resource).await {
            Ok(value) => {
                let data = serde_json::to_vec_pretty(&value).unwrap_or_default();
                let rel = format!("{NAMESPACE_DIR}/{resource}.json");
                if let Err(err) = artifacts::save_artifact(censor, &root, &rel, &data) {
                    tracing::warn!(resource, error = %err, "failed to save namespace artifact");
                }
            }
            Err(err) => tracing::warn!(resource, error = %err, "failed to list namespace resource"),
        }
    }
}
