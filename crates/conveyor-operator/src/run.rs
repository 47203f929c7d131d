//! The run driver.
//!
//! Wires the pieces in order: derive steps, resolve inputs into the
//! namespace name, build and order the partial graph, initialize the
//! namespace, execute, then run promotion steps. Every fatal error carries
//! its reporting reason, and the step-graph artifact is written on the way
//! out whether the run succeeded or not.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use conveyor_core::artifacts::{
    self, MetadataWriter, STEP_GRAPH_JSON_FILENAME, save_artifact,
};
use conveyor_core::censor::DynamicCensor;
use conveyor_core::cluster::{ClusterClient, ClusterEvent, EventType};
use conveyor_core::execute::{run_graph, run_promotion_steps};
use conveyor_core::graph::{StepGraphDetails, build_partial_graph, print_digraph, topological_sort};
use conveyor_core::inputs::{InputDefinition, binary_identity, input_hash};
use conveyor_core::junit::TestSuites;
use conveyor_core::lease::{self, LeaseClient, LeaseCredentials};
use conveyor_core::results::OperatorError;
use conveyor_core::steps::{ExecutionContext, Step, StepError, steps_from_config};

use crate::namespace::{
    event_job_description, initialize_namespace, job_labels, monitor_namespace, run_heartbeat,
    save_namespace_artifacts,
};
use crate::options::CompletedOptions;

/// Runs the orchestrator to completion, returning all fatal errors.
pub async fn run(mut completed: CompletedOptions, censor: Arc<DynamicCensor>) -> Vec<OperatorError> {
    let start = std::time::Instant::now();
    let result = run_inner(&mut completed, &censor).await;
    tracing::info!("ran for {:?}", Duration::from_secs(start.elapsed().as_secs()));
    result
}

async fn run_inner(
    completed: &mut CompletedOptions,
    censor: &Arc<DynamicCensor>,
) -> Vec<OperatorError> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let step_set = steps_from_config(
        &completed.config,
        &completed.job_spec,
        completed.options.promote,
        completed.lease_configured,
        completed.hive_configured,
    );

    // Inputs must be resolved over the FULL step set, before target
    // selection: two jobs with different targets share an artifact cache.
    let namespace = match resolve_inputs(completed, &step_set.steps) {
        Ok(namespace) => namespace,
        Err(err) => return vec![err],
    };
    completed.job_spec.namespace.clone_from(&namespace);
    tracing::info!(namespace, "using namespace");

    let mut metadata = MetadataWriter::new();
    if let Some(root) = artifacts::artifact_dir() {
        if let Err(err) = metadata.write(censor, &root, &completed.job_spec, &namespace) {
            return vec![OperatorError::with_default_reason(format!(
                "unable to write metadata.json for build: {err}"
            ))];
        }
    }

    let selected = match build_partial_graph(&step_set.steps, &completed.targets) {
        Ok(selected) => selected,
        Err(err) => {
            return vec![OperatorError::for_reason("building_graph", err.to_string())];
        }
    };
    let ordered = match topological_sort(&selected) {
        Ok(ordered) => ordered,
        Err(err) => {
            return vec![OperatorError::for_reason("building_graph", err.to_string())];
        }
    };
    let names: Vec<&str> = ordered.iter().map(|s| s.name()).collect();
    tracing::info!("running {}", names.join(", "));

    if completed.options.print_graph {
        let mut stdout = std::io::stdout().lock();
        if let Err(err) = print_digraph(&mut stdout, &ordered) {
            return vec![OperatorError::for_reason(
                "building_graph",
                format!("could not print graph: {err}"),
            )];
        }
        return Vec::new();
    }

    if let Some(errs) = validate_steps(&ordered) {
        return errs;
    }

    let mut graph_details = StepGraphDetails::from_ordered(&ordered);

    let cluster: Arc<dyn ClusterClient> = match completed.options.cluster_client() {
        Ok(client) => Arc::new(client),
        Err(err) => return vec![err],
    };

    if let Err(err) = initialize_namespace(completed, &cluster, &namespace).await {
        write_step_graph_artifact(censor, &graph_details);
        return vec![OperatorError::for_reason("initializing_namespace", format!("{err:#}"))];
    }

    tokio::spawn(run_heartbeat(Arc::clone(&cluster), namespace.clone(), cancel.clone()));
    tokio::spawn(monitor_namespace(Arc::clone(&cluster), namespace.clone(), cancel.clone()));

    let lease_client = match init_lease_client(completed, &namespace, &cancel) {
        Ok(client) => client,
        Err(err) => {
            write_step_graph_artifact(censor, &graph_details);
            return vec![err];
        }
    };

    let ctx = Arc::new(ExecutionContext {
        cancel: cancel.clone(),
        cluster: Arc::clone(&cluster),
        namespace: namespace.clone(),
        lease_client,
        poll_interval: Duration::from_secs(5),
        labels: job_labels(&completed.job_spec),
    });

    emit_event(&cluster, completed, &namespace, EventType::Normal, "CiJobStarted").await;

    let outcome = run_graph(Arc::clone(&ctx), &ordered).await;
    let mut suite = outcome.suite;
    write_junit(censor, &mut suite, "operator");
    graph_details.merge_from(&outcome.details);

    // Rewrite the metadata to catch custom metadata generated by the job.
    write_metadata(&mut metadata, completed, censor, &namespace);

    let mut errors = Vec::new();
    if !outcome.failures.is_empty() {
        emit_event(&cluster, completed, &namespace, EventType::Warning, "CiJobFailed").await;
        for failure in outcome.failures {
            let cancelled = failure.is_cancelled();
            let mut err = OperatorError::for_reason(
                "executing_graph",
                format!("could not run steps: {failure}"),
            )
            .junit_written();
            if cancelled {
                err = err.cancellation();
            }
            errors.push(err);
        }
    } else {
        if let Some(path) = &completed.options.write_params {
            if let Err(err) = write_params_file(path, completed, &namespace) {
                tracing::warn!(error = %err, "could not write the params file");
            }
        }
        let (promotion_details, promotion_failures) =
            run_promotion_steps(Arc::clone(&ctx), &step_set.promotion_steps).await;
        graph_details.merge_from(&promotion_details);
        if promotion_failures.is_empty() {
            emit_event(&cluster, completed, &namespace, EventType::Normal, "CiJobSucceeded").await;
        } else {
            emit_event(&cluster, completed, &namespace, EventType::Warning, "PostStepFailed").await;
            for failure in promotion_failures {
                let cancelled = failure.is_cancelled();
                let mut err = OperatorError::for_reason(
                    "executing_post",
                    format!("could not run promotion step: {failure}"),
                );
                if cancelled {
                    err = err.cancellation();
                }
                errors.push(err);
            }
        }
    }

    write_step_graph_artifact(censor, &graph_details);
    if cancel.is_cancelled() {
        save_namespace_artifacts(&cluster, censor, &namespace).await;
    }
    errors
}

/// Gathers every step's inputs plus the configuration, extra inputs, and
/// the binary identity, and derives the namespace name from their hash.
fn resolve_inputs(
    completed: &CompletedOptions,
    steps: &[Arc<dyn Step>],
) -> Result<String, OperatorError> {
    let mut inputs: InputDefinition = Vec::new();
    for step in steps {
        let definition = step.inputs().map_err(|err| {
            OperatorError::for_reason(
                "resolving_inputs",
                format!("could not determine inputs for step {}: {err}", step.name()),
            )
        })?;
        inputs.extend(definition);
    }

    // The additional target suffix must hash the same as the bare name, so
    // aggregated runs share the cache.
    let mut config = completed.config.clone();
    let suffix = &completed.options.target_additional_suffix;
    if !suffix.is_empty() {
        for test in &mut config.tests {
            if completed.targets.contains(&test.as_name) {
                if let Some(bare) = test.as_name.strip_suffix(&format!("-{suffix}")) {
                    test.as_name = bare.to_string();
                }
            }
        }
    }
    match serde_yaml::to_string(&config) {
        Ok(serialized) => inputs.push(serialized),
        Err(err) => {
            return Err(OperatorError::for_reason(
                "resolving_inputs",
                format!("could not serialize configuration: {err}"),
            ));
        }
    }

    inputs.extend(completed.extra_inputs.iter().cloned());

    if let Ok(binary) = std::env::current_exe() {
        if let Some(identity) = binary_identity(&binary) {
            tracing::trace!(binary = %binary.display(), identity, "using binary as hash");
            inputs.push(identity);
        } else {
            tracing::trace!("could not derive an identity from the current binary");
        }
    }

    let hash = input_hash(&inputs);
    let template = completed
        .options
        .namespace
        .clone()
        .unwrap_or_else(|| "ci-op-{id}".to_string());
    Ok(template.replace("{id}", &hash))
}

/// Validates every ordered step, expanding the optional-client sentinels
/// into actionable messages.
fn validate_steps(ordered: &[Arc<dyn Step>]) -> Option<Vec<OperatorError>> {
    let mut errors = Vec::new();
    for step in ordered {
        if let Err(err) = step.validate() {
            errors.push(OperatorError::for_reason(
                "building_graph",
                format!("step {:?} failed validation: {err}", step.name()),
            ));
            match err {
                StepError::NoLeaseClient => errors.push(OperatorError::for_reason(
                    "building_graph",
                    "a lease client was required but none was provided, add the --lease-... arguments"
                        .to_string(),
                )),
                StepError::NoHiveClient => errors.push(OperatorError::for_reason(
                    "building_graph",
                    "a Hive client was required but none was provided, add the --hive-kubeconfig argument"
                        .to_string(),
                )),
                _ => {}
            }
        }
    }
    if errors.is_empty() { None } else { Some(errors) }
}

fn init_lease_client(
    completed: &CompletedOptions,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<Option<Arc<LeaseClient>>, OperatorError> {
    if !completed.lease_configured {
        return Ok(None);
    }
    let (Some(server), Some(credentials_file)) = (
        &completed.options.lease_server,
        &completed.options.lease_server_credentials_file,
    ) else {
        return Ok(None);
    };

    let content = std::fs::read_to_string(credentials_file).map_err(|err| {
        OperatorError::for_reason(
            "loading_args",
            format!("failed to load lease credentials: {err}"),
        )
    })?;
    let credentials = LeaseCredentials::parse(&content).map_err(|err| {
        OperatorError::for_reason("loading_args", format!("failed to create the lease client: {err}"))
    })?;

    let owner = format!("{namespace}-{}", completed.job_spec.unique_hash());
    let client = Arc::new(LeaseClient::new(
        owner,
        server.clone(),
        credentials,
        completed.options.lease_acquire_timeout,
    ));
    tokio::spawn(lease::run_heartbeat(Arc::clone(&client), cancel.clone()));
    Ok(Some(client))
}

/// Writes an env-compatible file describing the job outputs, for tooling
/// that consumes the run's results without talking to the cluster.
fn write_params_file(
    path: &std::path::Path,
    completed: &CompletedOptions,
    namespace: &str,
) -> std::io::Result<()> {
    let job_name_safe: String = completed
        .job_spec
        .job
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let content = format!(
        "NAMESPACE={namespace}\nJOB_NAME={}\nJOB_NAME_SAFE={job_name_safe}\nUNIQUE_HASH={}\nIMAGE_FORMAT={namespace}/pipeline:${{component}}\n",
        completed.job_spec.job,
        completed.job_spec.unique_hash(),
    );
    std::fs::write(path, content)
}

fn write_metadata(
    metadata: &mut MetadataWriter,
    completed: &CompletedOptions,
    censor: &DynamicCensor,
    namespace: &str,
) {
    let Some(root) = artifacts::artifact_dir() else {
        return;
    };
    if let Err(err) = metadata.write(censor, &root, &completed.job_spec, namespace) {
        tracing::warn!(error = %err, "unable to update the metadata artifact");
    }
}

fn write_junit(censor: &DynamicCensor, suites: &mut TestSuites, phase: &str) {
    let Some(root) = artifacts::artifact_dir() else {
        return;
    };
    match suites.serialize(censor) {
        Ok(data) => {
            if let Err(err) = save_artifact(censor, &root, &format!("junit_{phase}.xml"), &data) {
                tracing::warn!(error = %err, "unable to write JUnit result");
            }
        }
        Err(err) => tracing::warn!(error = %err, "unable to serialize JUnit result"),
    }
}

fn write_step_graph_artifact(censor: &DynamicCensor, details: &StepGraphDetails) {
    let Some(root) = artifacts::artifact_dir() else {
        return;
    };
    match serde_json::to_vec_pretty(details) {
        Ok(data) => {
            if let Err(err) = save_artifact(censor, &root, STEP_GRAPH_JSON_FILENAME, &data) {
                tracing::error!(error = %err, "failed to save the step graph artifact");
            }
        }
        Err(err) => tracing::error!(error = %err, "failed to marshal the step graph"),
    }
}

async fn emit_event(
    cluster: &Arc<dyn ClusterClient>,
    completed: &CompletedOptions,
    namespace: &str,
    event_type: EventType,
    reason: &str,
) {
    let event = ClusterEvent {
        event_type,
        reason: reason.to_string(),
        message: event_job_description(&completed.job_spec, namespace),
    };
    if let Err(err) = cluster.emit_event(namespace, &event).await {
        tracing::debug!(reason, error = %err, "could not emit lifecycle event");
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let interrupted = wait_for_signal().await;
        tracing::info!(signal = interrupted, "process interrupted, cancelling execution");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::warn!(error = %err, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::steps::StepLink;

    struct ProbeStep {
        name: &'static str,
        validation: Option<fn() -> StepError>,
    }

    #[async_trait::async_trait]
    impl Step for ProbeStep {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> String {
            format!("probe step {}", self.name)
        }
        fn requires(&self) -> Vec<StepLink> {
            Vec::new()
        }
        fn creates(&self) -> Vec<StepLink> {
            Vec::new()
        }
        fn inputs(&self) -> Result<Vec<String>, StepError> {
            Ok(Vec::new())
        }
        fn validate(&self) -> Result<(), StepError> {
            match self.validation {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
        async fn execute(&self, _: &ExecutionContext) -> Result<(), StepError> {
            Ok(())
        }
    }

    #[test]
    fn sentinel_validation_failures_explain_missing_flags() {
        let step = ProbeStep { name: "needs-lease", validation: Some(|| StepError::NoLeaseClient) };
        let errs = validate_steps(&[Arc::new(step)]).unwrap();
        assert_eq!(errs.len(), 2);
        assert!(errs[1].to_string().contains("--lease-"), "{}", errs[1]);
        assert!(errs.iter().all(|e| e.reason() == "building_graph"));

        let step = ProbeStep { name: "needs-hive", validation: Some(|| StepError::NoHiveClient) };
        let errs = validate_steps(&[Arc::new(step)]).unwrap();
        assert!(errs[1].to_string().contains("--hive-kubeconfig"), "{}", errs[1]);
    }

    #[test]
    fn valid_steps_produce_no_errors() {
        let step = ProbeStep { name: "fine", validation: None };
        assert!(validate_steps(&[Arc::new(step)]).is_none());
    }
}
