//! Controller configuration.
//!
//! Two inputs steer the controller: the enabled-repository file (which
//! repositories participate, and whether triggering is automatic) and the
//! job configuration (from which each repository's presubmits are
//! classified into the gating sets). Both hot-reload: the enabled file via
//! a filesystem watcher, the job configuration on a fixed cadence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use conveyor_core::gating::PresubmitSet;

/// How often the presubmit sets are recomputed.
const RELOAD_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Trigger mode for a repository.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TriggerMode {
    /// `auto` posts the stage-two comment, `manual` suppresses it.
    #[serde(default)]
    pub trigger: String,
}

impl TriggerMode {
    /// Whether stage-two comments are posted automatically.
    #[must_use]
    pub fn is_auto(&self) -> bool {
        self.trigger.is_empty() || self.trigger == "auto"
    }
}

/// One enabled repository.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoItem {
    /// Repository name.
    pub name: String,
    /// Trigger mode.
    #[serde(default)]
    pub mode: TriggerMode,
}

/// One organization block. An empty repository list enables every
/// repository in the organization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrgConfig {
    /// Organization name.
    pub org: String,
    /// Enabled repositories.
    #[serde(default)]
    pub repos: Vec<RepoItem>,
}

/// The enabled-repository file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnabledConfig {
    /// Organization blocks.
    #[serde(default)]
    pub orgs: Vec<OrgConfig>,
}

impl EnabledConfig {
    /// Returns the trigger mode when `org/repo` is enabled.
    #[must_use]
    pub fn repo_mode(&self, org: &str, repo: &str) -> Option<TriggerMode> {
        let block = self.orgs.iter().find(|o| o.org == org)?;
        if block.repos.is_empty() {
            return Some(TriggerMode::default());
        }
        block.repos.iter().find(|r| r.name == repo).map(|r| r.mode.clone())
    }
}

/// Hot-reloading view over an enabled-repository file.
pub struct ConfigWatcher {
    path: PathBuf,
    config: RwLock<EnabledConfig>,
}

impl ConfigWatcher {
    /// Loads the file and builds the watcher state.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        let config = load_enabled_config(&path)?;
        Ok(Self { path, config: RwLock::new(config) })
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn get(&self) -> EnabledConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-reads the file, replacing the snapshot. Parse failures keep the
    /// previous snapshot.
    pub fn reload(&self) {
        match load_enabled_config(&self.path) {
            Ok(config) => {
                *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
                tracing::info!(path = %self.path.display(), "reloaded enabled-repository config");
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "could not reload config");
            }
        }
    }

    /// Watches the file for changes until cancelled. The notify watcher
    /// runs on its own thread; reloads happen on this task.
    pub async fn watch(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(4);
        let path = self.path.clone();
        let mut watcher = match notify::recommended_watcher(move |event| {
            if let Ok(event) = event {
                let event: notify::Event = event;
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.blocking_send(());
                }
            }
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::error!(error = %err, "could not create file watcher");
                return;
            }
        };
        if let Err(err) =
            notify::Watcher::watch(&mut watcher, &path, notify::RecursiveMode::NonRecursive)
        {
            tracing::error!(path = %path.display(), error = %err, "could not watch config file");
            return;
        }
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = rx.recv() => {
                    if changed.is_none() {
                        return;
                    }
                    self.reload();
                }
            }
        }
    }
}

fn load_enabled_config(path: &Path) -> Result<EnabledConfig, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("could not read {}: {err}", path.display()))?;
    serde_yaml::from_str(&raw).map_err(|err| format!("could not parse {}: {err}", path.display()))
}

/// One presubmit in the job configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresubmitJobConfig {
    /// Job name.
    pub name: String,
    /// Whether the job runs on every push.
    #[serde(default)]
    pub always_run: bool,
    /// Whether the job's context is exempt from branch protection.
    #[serde(default)]
    pub optional: bool,
    /// Path predicate that triggers the job.
    #[serde(default)]
    pub run_if_changed: Option<String>,
    /// Inverse path predicate that skips the job.
    #[serde(default)]
    pub skip_if_only_changed: Option<String>,
    /// Path predicate evaluated by the pipeline's second stage.
    #[serde(default)]
    pub pipeline_run_if_changed: Option<String>,
}

/// The job configuration file: presubmits per `org/repo`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    /// Presubmits keyed by `org/repo`.
    #[serde(default)]
    pub presubmits: HashMap<String, Vec<PresubmitJobConfig>>,
}

/// Classifies a repository's presubmits into the gating sets.
#[must_use]
pub fn classify_presubmits(jobs: &[PresubmitJobConfig]) -> PresubmitSet {
    let mut set = PresubmitSet::default();
    for job in jobs {
        if job.optional {
            continue;
        }
        if job.pipeline_run_if_changed.is_some() {
            set.pipeline_conditionally_required.push(job.name.clone());
        } else if job.always_run {
            set.always_required.push(job.name.clone());
        } else if job.run_if_changed.is_some() || job.skip_if_only_changed.is_some() {
            set.conditionally_required.push(job.name.clone());
        } else {
            // Required, never auto-run: only a human can turn it green.
            set.protected.push(job.name.clone());
        }
    }
    set
}

/// Periodically recomputed presubmit sets per repository.
pub struct ConfigDataProvider {
    path: PathBuf,
    presubmits: RwLock<HashMap<String, PresubmitSet>>,
}

impl ConfigDataProvider {
    /// Loads the job configuration and computes the initial sets.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        let presubmits = compute_presubmits(&path)?;
        Ok(Self { path, presubmits: RwLock::new(presubmits) })
    }

    /// The gating sets for `org/repo`. Unknown repositories get an empty
    /// set.
    #[must_use]
    pub fn get_presubmits(&self, org_repo: &str) -> PresubmitSet {
        self.presubmits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(org_repo)
            .cloned()
            .unwrap_or_default()
    }

    /// Recomputes the sets on a fixed cadence until cancelled.
    pub async fn run(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match compute_presubmits(&self.path) {
                        Ok(updated) => {
                            *self.presubmits.write().unwrap_or_else(|e| e.into_inner()) = updated;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "could not recompute presubmit sets");
                        }
                    }
                }
            }
        }
    }
}

fn compute_presubmits(path: &Path) -> Result<HashMap<String, PresubmitSet>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("could not read {}: {err}", path.display()))?;
    let config: JobConfig = serde_yaml::from_str(&raw)
        .map_err(|err| format!("could not parse {}: {err}", path.display()))?;
    Ok(config
        .presubmits
        .iter()
        .map(|(repo, jobs)| (repo.clone(), classify_presubmits(jobs)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_all_sets() {
        let jobs = vec![
            PresubmitJobConfig { name: "protected".into(), ..PresubmitJobConfig::default() },
            PresubmitJobConfig {
                name: "always".into(),
                always_run: true,
                ..PresubmitJobConfig::default()
            },
            PresubmitJobConfig {
                name: "conditional".into(),
                run_if_changed: Some("^pkg/".into()),
                ..PresubmitJobConfig::default()
            },
            PresubmitJobConfig {
                name: "pipeline".into(),
                pipeline_run_if_changed: Some("^cmd/".into()),
                ..PresubmitJobConfig::default()
            },
            PresubmitJobConfig {
                name: "optional".into(),
                optional: true,
                always_run: true,
                ..PresubmitJobConfig::default()
            },
        ];
        let set = classify_presubmits(&jobs);
        assert_eq!(set.protected, vec!["protected"]);
        assert_eq!(set.always_required, vec!["always"]);
        assert_eq!(set.conditionally_required, vec!["conditional"]);
        assert_eq!(set.pipeline_conditionally_required, vec!["pipeline"]);
    }

    #[test]
    fn org_with_empty_repo_list_enables_all() {
        let config: EnabledConfig = serde_yaml::from_str(
            "orgs:\n- org: acme\n- org: globex\n  repos:\n  - name: widget\n    mode:\n      trigger: manual\n",
        )
        .unwrap();
        assert!(config.repo_mode("acme", "anything").unwrap().is_auto());
        assert_eq!(
            config.repo_mode("globex", "widget").unwrap().trigger,
            "manual"
        );
        assert!(config.repo_mode("globex", "other").is_none());
        assert!(config.repo_mode("unknown", "repo").is_none());
    }

    #[test]
    fn watcher_reload_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enabled.yaml");
        std::fs::write(&path, "orgs:\n- org: acme\n").unwrap();
        let watcher = ConfigWatcher::new(&path).unwrap();
        assert!(watcher.get().repo_mode("acme", "x").is_some());

        std::fs::write(&path, "orgs:\n- org: globex\n").unwrap();
        watcher.reload();
        assert!(watcher.get().repo_mode("acme", "x").is_none());
        assert!(watcher.get().repo_mode("globex", "x").is_some());
    }
}
