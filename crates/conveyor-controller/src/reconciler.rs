//! The gating reconciler.
//!
//! Consumes changed build-outcome records and decides, per pull request and
//! revision, whether the second stage should be triggered. Promotion fires
//! at most once per (repository, SHA); a deduplication map with a daily
//! sweep enforces that, and a short-lived cache avoids re-reading closed
//! pull requests from the forge on every record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use conveyor_core::forge::{ForgeClient, PullRequestState};
use conveyor_core::gating::{
    BuildRecord, BuildState, JobClass, PromotionDecision, PromotionDeduper, classify,
    evaluate_promotion, promotion_comment,
};

use crate::config_provider::{ConfigDataProvider, ConfigWatcher};

/// How long a promotion entry blocks repeats.
pub const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a pull-request state lookup stays fresh.
const CLOSED_PR_TTL: Duration = Duration::from_secs(60 * 60);

/// Comment posted when a pull request opens in a gated repository.
pub const PULL_REQUEST_INFO_COMMENT: &str = "**Pipeline controller notification**\n\
    This repository is configured to use the pipeline controller. Second-stage tests \
    will be triggered only if the required tests of the first stage are successful. \
    The pipeline controller automatically detects which contexts are required or not \
    needed and will utilize a set of `/test` and `/override` commands to trigger the \
    second stage.";

/// Lists the build-outcome records of one pull request.
#[async_trait::async_trait]
pub trait RecordLister: Send + Sync {
    /// All presubmit records for `(org, repo, pull, base_ref)`.
    async fn list_presubmits(
        &self,
        org: &str,
        repo: &str,
        pull_number: u64,
        base_ref: &str,
    ) -> Result<Vec<BuildRecord>, String>;
}

#[async_trait::async_trait]
impl<T: RecordLister + ?Sized> RecordLister for Arc<T> {
    async fn list_presubmits(
        &self,
        org: &str,
        repo: &str,
        pull_number: u64,
        base_ref: &str,
    ) -> Result<Vec<BuildRecord>, String> {
        (**self).list_presubmits(org, repo, pull_number, base_ref).await
    }
}

struct CachedPrState {
    closed: bool,
    fetched: Instant,
}

/// Caches pull-request open/closed state for a bounded time.
pub struct ClosedPrCache {
    entries: Mutex<HashMap<String, CachedPrState>>,
}

impl ClosedPrCache {
    fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    async fn is_closed(
        &self,
        forge: &dyn ForgeClient,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<bool, String> {
        let key = format!("{org}/{repo}#{number}");
        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&key) {
                if entry.fetched.elapsed() < CLOSED_PR_TTL {
                    return Ok(entry.closed);
                }
            }
        }
        let pr = forge
            .get_pull_request(org, repo, number)
            .await
            .map_err(|err| format!("could not get pull request {key}: {err}"))?;
        let closed = pr.state == PullRequestState::Closed;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, CachedPrState { closed, fetched: Instant::now() });
        Ok(closed)
    }
}

/// Reconciles changed build-outcome records into promotion decisions.
pub struct Reconciler<L, F> {
    lister: L,
    forge: F,
    provider: Arc<ConfigDataProvider>,
    watcher: Arc<ConfigWatcher>,
    ids: Mutex<PromotionDeduper>,
    closed_prs: ClosedPrCache,
}

impl<L: RecordLister, F: ForgeClient> Reconciler<L, F> {
    /// Creates a reconciler over the given collaborators.
    pub fn new(
        lister: L,
        forge: F,
        provider: Arc<ConfigDataProvider>,
        watcher: Arc<ConfigWatcher>,
    ) -> Self {
        Self {
            lister,
            forge,
            provider,
            watcher,
            ids: Mutex::new(PromotionDeduper::new(DEDUP_TTL)),
            closed_prs: ClosedPrCache::new(),
        }
    }

    /// Handles one changed record. Returns whether a stage-two comment was
    /// posted.
    pub async fn reconcile(&self, record: &BuildRecord) -> Result<bool, String> {
        // Only successful completions can change the quorum in promotion's
        // favor; everything else is noise here.
        if record.state != BuildState::Success {
            return Ok(false);
        }

        let org_repo = format!("{}/{}", record.org, record.repo);
        let presubmits = self.provider.get_presubmits(&org_repo);
        if presubmits.is_empty() {
            return Ok(false);
        }
        if classify(&presubmits, &record.job) == JobClass::Unknown {
            return Ok(false);
        }

        let Some(mode) = self.watcher.get().repo_mode(&record.org, &record.repo) else {
            return Ok(false);
        };

        if self
            .closed_prs
            .is_closed(&self.forge, &record.org, &record.repo, record.pull_number)
            .await?
        {
            return Ok(false);
        }

        let records = self
            .lister
            .list_presubmits(&record.org, &record.repo, record.pull_number, &record.base_ref)
            .await?;

        match evaluate_promotion(&presubmits, &records, &record.pull_sha) {
            PromotionDecision::Hold(reason) => {
                tracing::debug!(
                    org_repo,
                    pull = record.pull_number,
                    sha = %record.pull_sha,
                    ?reason,
                    "holding promotion"
                );
                Ok(false)
            }
            PromotionDecision::Promote => {
                let claimed = self
                    .ids
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .try_claim(&record.org, &record.repo, &record.pull_sha);
                if !claimed {
                    return Ok(false);
                }
                let comment = promotion_comment(&presubmits, &records, &record.pull_sha);
                if comment.is_empty() {
                    return Ok(false);
                }
                if !mode.is_auto() {
                    tracing::info!(
                        org_repo,
                        pull = record.pull_number,
                        "manual trigger mode, suppressing stage-two comment"
                    );
                    return Ok(false);
                }
                self.forge
                    .create_comment(&record.org, &record.repo, record.pull_number, &comment)
                    .await
                    .map_err(|err| format!("failed to create comment: {err}"))?;
                tracing::info!(
                    org_repo,
                    pull = record.pull_number,
                    sha = %record.pull_sha,
                    "triggered second stage"
                );
                Ok(true)
            }
        }
    }

    /// Sweeps expired promotion entries until cancelled.
    pub async fn sweep_old_ids(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.ids.lock().unwrap_or_else(|e| e.into_inner()).sweep();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};

    use conveyor_core::forge::{CommitStatus, ForgeError, PullRequest, PullRequestChange};

    use super::*;

    struct FakeLister {
        records: Vec<BuildRecord>,
    }

    #[async_trait::async_trait]
    impl RecordLister for FakeLister {
        async fn list_presubmits(
            &self,
            _: &str,
            _: &str,
            _: u64,
            _: &str,
        ) -> Result<Vec<BuildRecord>, String> {
            Ok(self.records.clone())
        }
    }

    #[derive(Default)]
    struct FakeForge {
        closed: Vec<u64>,
        comments: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ForgeClient for FakeForge {
        async fn get_pull_request(
            &self,
            _: &str,
            _: &str,
            number: u64,
        ) -> Result<PullRequest, ForgeError> {
            let state = if self.closed.contains(&number) {
                PullRequestState::Closed
            } else {
                PullRequestState::Open
            };
            Ok(PullRequest { number, state })
        }

        async fn create_comment(&self, _: &str, _: &str, _: u64, _: &str) -> Result<(), ForgeError> {
            self.comments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_status(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &CommitStatus,
        ) -> Result<(), ForgeError> {
            Ok(())
        }

        async fn get_pull_request_changes(
            &self,
            _: &str,
            _: &str,
            _: u64,
        ) -> Result<Vec<PullRequestChange>, ForgeError> {
            Ok(Vec::new())
        }
    }

    fn record(job: &str, state: BuildState, sha: &str) -> BuildRecord {
        BuildRecord {
            job: job.to_string(),
            org: "org".to_string(),
            repo: "repo".to_string(),
            base_ref: "master".to_string(),
            pull_number: 123,
            pull_sha: sha.to_string(),
            state,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn fixtures(
        dir: &tempfile::TempDir,
        forge: FakeForge,
        records: Vec<BuildRecord>,
        trigger: &str,
    ) -> Reconciler<FakeLister, FakeForge> {
        let jobs_path = dir.path().join("jobs.yaml");
        std::fs::write(
            &jobs_path,
            "presubmits:\n  org/repo:\n  - name: org-repo-master-ps1\n  - name: org-repo-master-ps2\n    always_run: true\n  - name: org-repo-master-ps3\n    run_if_changed: '^pkg/'\n",
        )
        .unwrap();
        let enabled_path = dir.path().join("enabled.yaml");
        std::fs::write(
            &enabled_path,
            format!(
                "orgs:\n- org: org\n  repos:\n  - name: repo\n    mode:\n      trigger: {trigger}\n"
            ),
        )
        .unwrap();

        let provider = Arc::new(ConfigDataProvider::new(&jobs_path).unwrap());
        let watcher = Arc::new(ConfigWatcher::new(&enabled_path).unwrap());
        Reconciler::new(FakeLister { records }, forge, provider, watcher)
    }

    #[tokio::test]
    async fn promotes_and_comments_in_auto_mode() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fixtures(
            &dir,
            FakeForge::default(),
            vec![
                record("org-repo-master-ps2", BuildState::Success, "sha"),
                record("org-repo-master-ps3", BuildState::Success, "sha"),
            ],
            "auto",
        );
        let changed = record("org-repo-master-ps3", BuildState::Success, "sha");
        assert!(reconciler.reconcile(&changed).await.unwrap());
        assert_eq!(reconciler.forge.comments.load(Ordering::SeqCst), 1);

        // The same revision never promotes twice.
        assert!(!reconciler.reconcile(&changed).await.unwrap());
        assert_eq!(reconciler.forge.comments.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_mode_suppresses_the_comment() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fixtures(
            &dir,
            FakeForge::default(),
            vec![
                record("org-repo-master-ps2", BuildState::Success, "sha"),
                record("org-repo-master-ps3", BuildState::Success, "sha"),
            ],
            "manual",
        );
        let changed = record("org-repo-master-ps2", BuildState::Success, "sha");
        assert!(!reconciler.reconcile(&changed).await.unwrap());
        assert_eq!(reconciler.forge.comments.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_sha_successes_do_not_promote() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fixtures(
            &dir,
            FakeForge::default(),
            vec![
                record("org-repo-master-ps2", BuildState::Success, "other-sha"),
                record("org-repo-master-ps3", BuildState::Success, "other-sha"),
            ],
            "auto",
        );
        let changed = record("org-repo-master-ps3", BuildState::Success, "sha");
        assert!(!reconciler.reconcile(&changed).await.unwrap());
        assert_eq!(reconciler.forge.comments.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_pull_requests_never_promote() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fixtures(
            &dir,
            FakeForge { closed: vec![123], ..FakeForge::default() },
            vec![
                record("org-repo-master-ps2", BuildState::Success, "sha"),
                record("org-repo-master-ps3", BuildState::Success, "sha"),
            ],
            "auto",
        );
        let changed = record("org-repo-master-ps2", BuildState::Success, "sha");
        assert!(!reconciler.reconcile(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn manual_intervention_holds_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fixtures(
            &dir,
            FakeForge::default(),
            vec![
                record("org-repo-master-ps1", BuildState::Success, "sha"),
                record("org-repo-master-ps2", BuildState::Success, "sha"),
                record("org-repo-master-ps3", BuildState::Success, "sha"),
            ],
            "auto",
        );
        let changed = record("org-repo-master-ps2", BuildState::Success, "sha");
        assert!(!reconciler.reconcile(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn unrelated_jobs_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fixtures(&dir, FakeForge::default(), Vec::new(), "auto");
        let changed = record("some-other-job", BuildState::Success, "sha");
        assert!(!reconciler.reconcile(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn non_success_records_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fixtures(&dir, FakeForge::default(), Vec::new(), "auto");
        let changed = record("org-repo-master-ps2", BuildState::Failure, "sha");
        assert!(!reconciler.reconcile(&changed).await.unwrap());
    }
}
