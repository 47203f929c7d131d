//! Pipeline gating policy.
//!
//! A repository opted into pipeline gating splits its presubmits into
//! `protected` jobs (never auto-triggered), `always required`,
//! `conditionally required`, and `pipeline conditionally required` jobs.
//! When the first-stage quorum succeeds on a single revision, the second
//! stage is triggered with a Prow-style comment. The decision itself is
//! pure; the controller owns IO and deduplication sweeps.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The classified presubmits of one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresubmitSet {
    /// Jobs that are never auto-triggered.
    pub protected: Vec<String>,
    /// Required jobs that always run.
    pub always_required: Vec<String>,
    /// Required jobs gated on a path predicate.
    pub conditionally_required: Vec<String>,
    /// Jobs gated on the pipeline itself.
    pub pipeline_conditionally_required: Vec<String>,
}

impl PresubmitSet {
    /// Whether the repository has no gating-relevant presubmits at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.protected.is_empty()
            && self.always_required.is_empty()
            && self.conditionally_required.is_empty()
            && self.pipeline_conditionally_required.is_empty()
    }
}

/// Classification of a job name against a presubmit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    /// Member of the protected set.
    Protected,
    /// Member of the always-required set.
    AlwaysRequired,
    /// Member of the conditionally-required set.
    ConditionallyRequired,
    /// Member of the pipeline-conditionally-required set.
    PipelineConditionallyRequired,
    /// Not a gating-relevant job.
    Unknown,
}

/// Classifies a job name.
#[must_use]
pub fn classify(set: &PresubmitSet, job: &str) -> JobClass {
    if set.protected.iter().any(|j| j == job) {
        JobClass::Protected
    } else if set.always_required.iter().any(|j| j == job) {
        JobClass::AlwaysRequired
    } else if set.conditionally_required.iter().any(|j| j == job) {
        JobClass::ConditionallyRequired
    } else if set.pipeline_conditionally_required.iter().any(|j| j == job) {
        JobClass::PipelineConditionallyRequired
    } else {
        JobClass::Unknown
    }
}

/// Terminal and non-terminal states of a build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    /// Queued, not yet scheduled.
    Triggered,
    /// Scheduled and running.
    Pending,
    /// Finished successfully.
    Success,
    /// Finished unsuccessfully.
    Failure,
    /// Stopped before completion.
    Aborted,
    /// Infrastructure error.
    Error,
}

/// One build-outcome record for a presubmit run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Job name.
    pub job: String,
    /// Organization.
    pub org: String,
    /// Repository.
    pub repo: String,
    /// Base branch of the pull request.
    pub base_ref: String,
    /// Pull request number.
    pub pull_number: u64,
    /// Pull head SHA the job ran against.
    pub pull_sha: String,
    /// Current state.
    pub state: BuildState,
    /// When the record was created. The latest record per job wins.
    pub created_at: DateTime<Utc>,
}

/// Why promotion was withheld.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldReason {
    /// A protected job already succeeded on this SHA, indicating manual
    /// intervention.
    ManualTrigger,
    /// A required job has not finished on this SHA.
    RequiredIncomplete(String),
    /// A required job finished unsuccessfully on this SHA.
    RequiredFailed(String),
    /// No conditionally-required job succeeded on this SHA.
    ConditionalQuorumNotMet,
}

/// The gating decision for one (pull request, SHA) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionDecision {
    /// Trigger stage two.
    Promote,
    /// Do nothing, for the given reason.
    Hold(HoldReason),
}

/// Returns the latest record per job name, restricted to `sha`.
fn latest_per_job<'a>(
    records: &'a [BuildRecord],
    sha: &str,
) -> BTreeMap<&'a str, &'a BuildRecord> {
    let mut latest: BTreeMap<&str, &BuildRecord> = BTreeMap::new();
    for record in records.iter().filter(|r| r.pull_sha == sha) {
        latest
            .entry(record.job.as_str())
            .and_modify(|existing| {
                if record.created_at > existing.created_at {
                    *existing = record;
                }
            })
            .or_insert(record);
    }
    latest
}

/// Computes the promotion decision for the records of one pull request,
/// judged on a single revision.
///
/// All `always_required` jobs must be complete-ok on `sha`; every
/// conditionally-required job that ran must be complete-ok, and at least one
/// must have run when the set is non-empty. A protected job that is already
/// green means a human is driving and the controller stays out of the way.
#[must_use]
pub fn evaluate_promotion(
    set: &PresubmitSet,
    records: &[BuildRecord],
    sha: &str,
) -> PromotionDecision {
    let latest = latest_per_job(records, sha);

    for job in &set.protected {
        if let Some(record) = latest.get(job.as_str()) {
            if record.state == BuildState::Success {
                return PromotionDecision::Hold(HoldReason::ManualTrigger);
            }
        }
    }

    for job in &set.always_required {
        match latest.get(job.as_str()) {
            None => {
                return PromotionDecision::Hold(HoldReason::RequiredIncomplete(job.clone()));
            }
            Some(record) => match record.state {
                BuildState::Success => {}
                BuildState::Failure | BuildState::Aborted | BuildState::Error => {
                    return PromotionDecision::Hold(HoldReason::RequiredFailed(job.clone()));
                }
                BuildState::Triggered | BuildState::Pending => {
                    return PromotionDecision::Hold(HoldReason::RequiredIncomplete(job.clone()));
                }
            },
        }
    }

    if !set.conditionally_required.is_empty() {
        let mut any_succeeded = false;
        for job in &set.conditionally_required {
            match latest.get(job.as_str()) {
                // Conditional jobs that did not run do not block.
                None => {}
                Some(record) => match record.state {
                    BuildState::Success => any_succeeded = true,
                    BuildState::Failure | BuildState::Aborted | BuildState::Error => {
                        return PromotionDecision::Hold(HoldReason::RequiredFailed(job.clone()));
                    }
                    BuildState::Triggered | BuildState::Pending => {
                        return PromotionDecision::Hold(HoldReason::RequiredIncomplete(
                            job.clone(),
                        ));
                    }
                },
            }
        }
        if !any_succeeded {
            return PromotionDecision::Hold(HoldReason::ConditionalQuorumNotMet);
        }
    }

    PromotionDecision::Promote
}

/// Builds the stage-two trigger comment: a `/test` line per protected job,
/// and an `/override` line per pipeline-conditionally-required job that did
/// not run on this revision.
#[must_use]
pub fn promotion_comment(set: &PresubmitSet, records: &[BuildRecord], sha: &str) -> String {
    let latest = latest_per_job(records, sha);
    let mut lines: Vec<String> = Vec::new();
    for job in &set.protected {
        lines.push(format!("/test {job}"));
    }
    for job in &set.pipeline_conditionally_required {
        if !latest.contains_key(job.as_str()) {
            lines.push(format!("/override {job}"));
        }
    }
    lines.join("\n")
}

/// At-most-once promotion tracking per (org, repo, SHA). Entries expire so
/// the map does not grow without bound.
#[derive(Debug)]
pub struct PromotionDeduper {
    seen: HashMap<String, Instant>,
    ttl: Duration,
}

impl PromotionDeduper {
    /// Creates a deduper whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { seen: HashMap::new(), ttl }
    }

    /// Records a promotion, returning `false` when this key already
    /// promoted within the TTL.
    pub fn try_claim(&mut self, org: &str, repo: &str, sha: &str) -> bool {
        let key = format!("{org}/{repo}@{sha}");
        let now = Instant::now();
        match self.seen.get(&key) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    /// Drops expired entries.
    pub fn sweep(&mut self) {
        let ttl = self.ttl;
        let now = Instant::now();
        self.seen.retain(|_, at| now.duration_since(*at) < ttl);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no entries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "sha";

    fn record(job: &str, state: BuildState, sha: &str) -> BuildRecord {
        record_at(job, state, sha, 0)
    }

    fn record_at(job: &str, state: BuildState, sha: &str, minutes: i64) -> BuildRecord {
        BuildRecord {
            job: job.to_string(),
            org: "org".to_string(),
            repo: "repo".to_string(),
            base_ref: "master".to_string(),
            pull_number: 123,
            pull_sha: sha.to_string(),
            state,
            created_at: DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::minutes(minutes),
        }
    }

    fn set() -> PresubmitSet {
        PresubmitSet {
            protected: vec!["ps1".into()],
            always_required: vec!["ps2".into()],
            conditionally_required: vec!["ps3".into()],
            pipeline_conditionally_required: Vec::new(),
        }
    }

    #[test]
    fn promotes_when_all_required_green() {
        let records = vec![
            record("ps2", BuildState::Success, SHA),
            record("ps3", BuildState::Success, SHA),
        ];
        assert_eq!(evaluate_promotion(&set(), &records, SHA), PromotionDecision::Promote);
    }

    #[test]
    fn holds_when_conditionally_required_failed() {
        let records = vec![
            record("ps2", BuildState::Success, SHA),
            record("ps3", BuildState::Failure, SHA),
        ];
        assert_eq!(
            evaluate_promotion(&set(), &records, SHA),
            PromotionDecision::Hold(HoldReason::RequiredFailed("ps3".into()))
        );
    }

    #[test]
    fn promotes_when_only_some_conditional_ran() {
        let mut gate = set();
        gate.conditionally_required =
            vec!["ps3".into(), "ps4".into(), "ps5".into()];
        let records = vec![
            record("ps2", BuildState::Success, SHA),
            record("ps3", BuildState::Success, SHA),
        ];
        assert_eq!(evaluate_promotion(&gate, &records, SHA), PromotionDecision::Promote);
    }

    #[test]
    fn holds_when_always_required_aborted() {
        let records = vec![
            record("ps2", BuildState::Aborted, SHA),
            record("ps3", BuildState::Success, SHA),
        ];
        assert_eq!(
            evaluate_promotion(&set(), &records, SHA),
            PromotionDecision::Hold(HoldReason::RequiredFailed("ps2".into()))
        );
    }

    #[test]
    fn holds_when_protected_already_green() {
        let records = vec![
            record("ps1", BuildState::Success, SHA),
            record("ps2", BuildState::Success, SHA),
            record("ps3", BuildState::Success, SHA),
        ];
        assert_eq!(
            evaluate_promotion(&set(), &records, SHA),
            PromotionDecision::Hold(HoldReason::ManualTrigger)
        );
    }

    #[test]
    fn holds_while_required_still_running() {
        let records = vec![
            record("ps2", BuildState::Pending, SHA),
            record("ps3", BuildState::Triggered, SHA),
        ];
        assert_eq!(
            evaluate_promotion(&set(), &records, SHA),
            PromotionDecision::Hold(HoldReason::RequiredIncomplete("ps2".into()))
        );
    }

    #[test]
    fn promotes_with_only_protected_jobs() {
        let gate = PresubmitSet { protected: vec!["ps2".into()], ..PresubmitSet::default() };
        assert_eq!(evaluate_promotion(&gate, &[], SHA), PromotionDecision::Promote);
    }

    #[test]
    fn green_runs_on_other_shas_do_not_count() {
        let records = vec![
            record("ps2", BuildState::Success, "other-sha"),
            record("ps3", BuildState::Success, "other-sha"),
        ];
        assert_eq!(
            evaluate_promotion(&set(), &records, SHA),
            PromotionDecision::Hold(HoldReason::RequiredIncomplete("ps2".into()))
        );
    }

    #[test]
    fn latest_record_per_job_wins() {
        let records = vec![
            record_at("ps2", BuildState::Failure, SHA, 0),
            record_at("ps2", BuildState::Success, SHA, 10),
            record("ps3", BuildState::Success, SHA),
        ];
        assert_eq!(evaluate_promotion(&set(), &records, SHA), PromotionDecision::Promote);

        let records = vec![
            record_at("ps2", BuildState::Success, SHA, 0),
            record_at("ps2", BuildState::Failure, SHA, 10),
            record("ps3", BuildState::Success, SHA),
        ];
        assert_eq!(
            evaluate_promotion(&set(), &records, SHA),
            PromotionDecision::Hold(HoldReason::RequiredFailed("ps2".into()))
        );
    }

    #[test]
    fn classify_covers_all_sets() {
        let mut gate = set();
        gate.pipeline_conditionally_required = vec!["ps9".into()];
        assert_eq!(classify(&gate, "ps1"), JobClass::Protected);
        assert_eq!(classify(&gate, "ps2"), JobClass::AlwaysRequired);
        assert_eq!(classify(&gate, "ps3"), JobClass::ConditionallyRequired);
        assert_eq!(classify(&gate, "ps9"), JobClass::PipelineConditionallyRequired);
        assert_eq!(classify(&gate, "nope"), JobClass::Unknown);
    }

    #[test]
    fn comment_tests_protected_and_overrides_absent_pipeline_conditionals() {
        let mut gate = set();
        gate.pipeline_conditionally_required = vec!["opt-in".into(), "ran".into()];
        let records = vec![record("ran", BuildState::Success, SHA)];
        let comment = promotion_comment(&gate, &records, SHA);
        assert_eq!(comment, "/test ps1\n/override opt-in");
    }

    #[test]
    fn deduper_claims_at_most_once_per_sha() {
        let mut deduper = PromotionDeduper::new(Duration::from_secs(60));
        assert!(deduper.try_claim("org", "repo", SHA));
        assert!(!deduper.try_claim("org", "repo", SHA));
        assert!(deduper.try_claim("org", "repo", "other"));
    }

    #[test]
    fn deduper_sweep_drops_expired_entries() {
        let mut deduper = PromotionDeduper::new(Duration::ZERO);
        assert!(deduper.try_claim("org", "repo", SHA));
        deduper.sweep();
        assert!(deduper.is_empty());
    }
}
