//! Job specification: what triggered this run.
//!
//! The job spec is resolved once at startup, either from the `JOB_SPEC`
//! downward-API environment variable or from a `--git-ref` lookup, and is
//! fixed for the lifetime of one invocation. Late-bound fields (target,
//! namespace, owner reference) are set by the driver as they are resolved.

use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inputs::name_hash;

/// Environment variable carrying the downward-API job spec JSON.
pub const JOB_SPEC_VAR: &str = "JOB_SPEC";

/// Error resolving the job spec.
#[derive(Debug, Error)]
pub enum JobSpecError {
    /// `JOB_SPEC` was not set in the environment.
    #[error("$JOB_SPEC unset")]
    EnvUnset,

    /// `JOB_SPEC` did not parse.
    #[error("malformed $JOB_SPEC: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A `--git-ref` value was not of the form `ORG/NAME@REF`.
    #[error("invalid git ref {value:?}: must be ORG/NAME@REF")]
    InvalidGitRef {
        /// The rejected value.
        value: String,
    },

    /// `git ls-remote` failed or resolved nothing.
    #[error("could not resolve {git_ref}: {reason}")]
    Unresolvable {
        /// The ref that failed to resolve.
        git_ref: String,
        /// Why resolution failed.
        reason: String,
    },
}

/// The type of job being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Runs against a pull request.
    Presubmit,
    /// Runs against a merged branch.
    Postsubmit,
    /// Runs on a schedule.
    #[default]
    Periodic,
    /// Runs on demand without refs.
    Batch,
}

/// A pull merged into the base ref for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pull {
    /// Pull request number.
    pub number: u64,
    /// Head SHA of the pull.
    #[serde(default)]
    pub sha: String,
    /// Login of the author.
    #[serde(default)]
    pub author: String,
}

/// A repository checkout contributing source to this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Refs {
    /// Organization name.
    pub org: String,
    /// Repository name.
    pub repo: String,
    /// Base branch or tag.
    pub base_ref: String,
    /// Resolved SHA of the base ref. Empty when resolution failed upstream.
    #[serde(default)]
    pub base_sha: String,
    /// Pulls merged onto the base.
    #[serde(default)]
    pub pulls: Vec<Pull>,
    /// Override for the checkout path of the repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_alias: Option<String>,
}

impl Refs {
    /// Renders the ref the way result metadata expects:
    /// `base:sha,pull:pullsha,...`.
    #[must_use]
    pub fn ref_string(&self) -> String {
        let mut out = format!("{}:{}", self.base_ref, self.base_sha);
        for pull in &self.pulls {
            out.push_str(&format!(",{}:{}", pull.number, pull.sha));
        }
        out
    }
}

/// GCS upload configuration forwarded by the job decoration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DecorationConfig {
    /// Name override for the GCS credentials secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs_credentials_secret: Option<String>,
}

/// The trigger description for one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobSpec {
    /// Job type.
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    /// Job name.
    #[serde(default)]
    pub job: String,
    /// Unique build identifier assigned by the scheduler.
    #[serde(rename = "buildid", default)]
    pub build_id: String,
    /// Identifier of the scheduling record that spawned this run.
    #[serde(rename = "prowjobid", default)]
    pub prowjob_id: String,
    /// Primary refs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,
    /// Additional refs checked out beside the primary.
    #[serde(default)]
    pub extra_refs: Vec<Refs>,
    /// Decoration configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoration_config: Option<DecorationConfig>,

    /// The first requested target, used for reporting. Set by the driver.
    #[serde(skip)]
    pub target: String,
    /// Extra suffix applied to the targeted test name.
    #[serde(skip)]
    pub target_additional_suffix: String,
    /// The resolved execution namespace. Set after input resolution.
    #[serde(skip)]
    pub namespace: String,
    /// Namespace build products are read from.
    #[serde(skip)]
    pub base_namespace: String,
}

impl JobSpec {
    /// Resolves the job spec from the environment.
    pub fn from_env() -> Result<Self, JobSpecError> {
        let raw = std::env::var(JOB_SPEC_VAR).map_err(|_| JobSpecError::EnvUnset)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Populates a synthetic job spec from a local Git reference of the form
    /// `ORG/NAME@REF`, resolving the SHA with `git ls-remote`.
    pub fn from_git_ref(git_ref: &str) -> Result<Self, JobSpecError> {
        let (org_repo, base_ref) = git_ref.split_once('@').ok_or_else(|| {
            JobSpecError::InvalidGitRef { value: git_ref.to_string() }
        })?;
        let (org, repo) = org_repo.split_once('/').ok_or_else(|| {
            JobSpecError::InvalidGitRef { value: git_ref.to_string() }
        })?;

        let remote = format!("https://github.com/{org}/{repo}.git");
        let output = Command::new("git")
            .args(["ls-remote", &remote, base_ref])
            .output()
            .map_err(|err| JobSpecError::Unresolvable {
                git_ref: git_ref.to_string(),
                reason: format!("git ls-remote failed: {err}"),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next().unwrap_or_default();
        let mut columns = first.split('\t');
        let sha = columns.next().unwrap_or_default().to_string();
        let resolved_name = columns.next().unwrap_or_default();
        if sha.is_empty() {
            return Err(JobSpecError::Unresolvable {
                git_ref: git_ref.to_string(),
                reason: format!("ref {base_ref:?} does not point to any commit"),
            });
        }
        // Branch shorthands must resolve to exactly the named branch; anything
        // else is ambiguous and the caller has to be explicit.
        if let Some(trimmed) = resolved_name.strip_prefix("refs/heads/") {
            if !base_ref.starts_with("refs/heads/") && trimmed != base_ref {
                return Err(JobSpecError::Unresolvable {
                    git_ref: git_ref.to_string(),
                    reason: format!(
                        "ref {base_ref:?} does not point to any commit (did you mean {trimmed:?}?)"
                    ),
                });
            }
        }
        tracing::info!(git_ref, sha, "resolved git ref");

        Ok(Self {
            job_type: JobType::Periodic,
            job: "dev".to_string(),
            refs: Some(Refs {
                org: org.to_string(),
                repo: repo.to_string(),
                base_ref: base_ref.to_string(),
                base_sha: sha,
                ..Refs::default()
            }),
            ..Self::default()
        })
    }

    /// All refs contributing to this run: primary first, then extras.
    #[must_use]
    pub fn all_refs(&self) -> Vec<&Refs> {
        self.refs.iter().chain(self.extra_refs.iter()).collect()
    }

    /// A short hash making concurrently running invocations of the same job
    /// unique, used for lease ownership.
    #[must_use]
    pub fn unique_hash(&self) -> String {
        name_hash(format!("{}-{}", self.job, self.build_id).as_bytes())
    }
}

static SHA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^[0-9a-fA-F]+$").expect("static regex")
});

/// Truncates values that look like hexadecimal Git SHAs to `len` characters.
/// Tags and other refs pass through untouched.
#[must_use]
pub fn shorten(value: &str, len: usize) -> &str {
    if value.len() > len && SHA_RE.is_match(value) {
        &value[..len]
    } else {
        value
    }
}

/// Renders a one-line summary of a ref for startup logging.
#[must_use]
pub fn summarize_ref(refs: &Refs) -> String {
    if !refs.pulls.is_empty() {
        let pulls: Vec<String> = refs
            .pulls
            .iter()
            .map(|p| format!("#{} {} @{}", p.number, shorten(&p.sha, 8), p.author))
            .collect();
        return format!(
            "Resolved source https://github.com/{}/{} to {}@{}, merging: {}",
            refs.org,
            refs.repo,
            refs.base_ref,
            shorten(&refs.base_sha, 8),
            pulls.join(", ")
        );
    }
    if refs.base_sha.is_empty() {
        return format!(
            "Resolved SHA missing for {} in https://github.com/{}/{} (will prevent caching)",
            refs.base_ref, refs.org, refs.repo
        );
    }
    format!(
        "Resolved source https://github.com/{}/{} to {}@{}",
        refs.org,
        refs.repo,
        refs.base_ref,
        shorten(&refs.base_sha, 8)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs_with_pull() -> Refs {
        Refs {
            org: "acme".into(),
            repo: "widget".into(),
            base_ref: "main".into(),
            base_sha: "0123456789abcdef0123456789abcdef01234567".into(),
            pulls: vec![Pull { number: 42, sha: "fedcba9876543210fedcba9876543210fedcba98".into(), author: "dev".into() }],
            path_alias: None,
        }
    }

    #[test]
    fn parses_downward_api_json() {
        let spec: JobSpec = serde_json::from_str(
            r#"{"type":"presubmit","job":"pull-acme-widget-unit","buildid":"123","prowjobid":"abc",
                "refs":{"org":"acme","repo":"widget","base_ref":"main","base_sha":"deadbeef",
                        "pulls":[{"number":7,"sha":"cafe","author":"dev"}]}}"#,
        )
        .unwrap();
        assert_eq!(spec.job_type, JobType::Presubmit);
        assert_eq!(spec.build_id, "123");
        assert_eq!(spec.refs.unwrap().pulls[0].number, 7);
    }

    #[test]
    fn shorten_only_truncates_hex() {
        assert_eq!(shorten("0123456789abcdef", 8), "01234567");
        assert_eq!(shorten("release-4.17", 8), "release-4.17");
        assert_eq!(shorten("abc", 8), "abc");
    }

    #[test]
    fn summarize_includes_pulls() {
        let summary = summarize_ref(&refs_with_pull());
        assert!(summary.contains("merging: #42 fedcba98 @dev"), "{summary}");
    }

    #[test]
    fn summarize_flags_missing_sha() {
        let refs = Refs { base_sha: String::new(), ..refs_with_pull() };
        let refs = Refs { pulls: Vec::new(), ..refs };
        assert!(summarize_ref(&refs).contains("will prevent caching"));
    }

    #[test]
    fn ref_string_includes_pulls() {
        let refs = refs_with_pull();
        assert!(refs.ref_string().starts_with("main:0123456789abcdef"));
        assert!(refs.ref_string().contains(",42:fedcba"));
    }

    #[test]
    fn unique_hash_is_stable() {
        let spec = JobSpec { job: "j".into(), build_id: "1".into(), ..JobSpec::default() };
        assert_eq!(spec.unique_hash(), spec.unique_hash());
        assert_eq!(spec.unique_hash().len(), crate::inputs::ENCODED_HASH_LEN);
    }
}
