//! Artifact output.
//!
//! Everything the orchestrator leaves behind lands under the `$ARTIFACTS`
//! root: `metadata.json` (written at start, updated at end), the per-phase
//! JUnit files, the step-graph record, the orchestrator log, and the
//! namespace dumps taken on interrupt. Every artifact passes through the
//! censor before touching disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::censor::DynamicCensor;
use crate::jobspec::JobSpec;

/// Environment variable naming the artifact root.
pub const ARTIFACTS_VAR: &str = "ARTIFACTS";

/// The result metadata artifact.
pub const METADATA_JSON_FILENAME: &str = "metadata.json";

/// The step-graph detail artifact.
pub const STEP_GRAPH_JSON_FILENAME: &str = "ci-operator-step-graph.json";

/// The verbose orchestrator log.
pub const LOG_FILENAME: &str = "ci-operator.log";

/// Name of the custom metadata file a job may drop anywhere under the
/// artifact root.
pub const CUSTOM_METADATA_FILE: &str = "custom-prow-metadata.json";

/// Subdirectory for namespace object dumps.
pub const NAMESPACE_DIR: &str = "namespace";

/// Error writing an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Filesystem failure.
    #[error("could not write artifact {path}: {source}")]
    Io {
        /// The artifact path.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The custom metadata file did not parse.
    #[error("could not parse custom metadata {path}: {message}")]
    CustomMetadata {
        /// The file that failed to parse.
        path: String,
        /// Parse failure detail.
        message: String,
    },
}

/// The artifact root, when the environment provides one.
#[must_use]
pub fn artifact_dir() -> Option<PathBuf> {
    std::env::var_os(ARTIFACTS_VAR).map(PathBuf::from).filter(|p| !p.as_os_str().is_empty())
}

/// Censors `data` and writes it to `rel_path` under `root`, creating parent
/// directories as needed.
pub fn save_artifact(
    censor: &DynamicCensor,
    root: &Path,
    rel_path: &str,
    data: &[u8],
) -> Result<(), ArtifactError> {
    let path = root.join(rel_path);
    let io_err = |source| ArtifactError::Io { path: path.display().to_string(), source };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut censored = data.to_vec();
    censor.censor(&mut censored);
    std::fs::write(&path, censored).map_err(io_err)
}

/// The metadata consumed by result dashboards after a run completes. The
/// work namespace is recorded so dashboards can link into the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultMetadata {
    /// Monotonic revision of this document within one run.
    pub revision: String,
    /// Primary repository as `org/repo`.
    #[serde(rename = "repo", default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    /// All checked-out repositories and their refs.
    #[serde(rename = "repos", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repos: BTreeMap<String, String>,
    /// Scheduling record identifier.
    #[serde(rename = "pod", default, skip_serializing_if = "String::is_empty")]
    pub pod: String,
    /// The execution namespace.
    #[serde(rename = "work-namespace", default, skip_serializing_if = "String::is_empty")]
    pub work_namespace: String,
    /// Custom metadata merged from the job's own metadata file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Writes `metadata.json`, merging any custom metadata the job produced.
///
/// The writer is called twice per run: once at start for a stable document,
/// and once at the end to pick up custom metadata. The revision counter
/// distinguishes the two.
#[derive(Debug, Default)]
pub struct MetadataWriter {
    revision: u32,
}

impl MetadataWriter {
    /// Creates a writer with revision zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the metadata artifact. Custom-metadata parse failures are
    /// logged and returned after the document is still written.
    pub fn write(
        &mut self,
        censor: &DynamicCensor,
        root: &Path,
        job_spec: &JobSpec,
        namespace: &str,
    ) -> Result<(), ArtifactError> {
        let custom_file = find_custom_metadata_file(root);

        // A start-of-run document already on disk stays untouched unless
        // custom metadata showed up.
        let metadata_path = root.join(METADATA_JSON_FILENAME);
        if custom_file.is_none() && metadata_path.exists() && self.revision > 0 {
            tracing::debug!("no custom metadata found, not updating the metadata artifact");
            return Ok(());
        }

        self.revision += 1;
        let mut document = ResultMetadata {
            revision: self.revision.to_string(),
            pod: job_spec.prowjob_id.clone(),
            work_namespace: namespace.to_string(),
            ..ResultMetadata::default()
        };
        if let Some(refs) = &job_spec.refs {
            document.repo = format!("{}/{}", refs.org, refs.repo);
            document.repos.insert(document.repo.clone(), refs.ref_string());
        }
        for refs in &job_spec.extra_refs {
            document
                .repos
                .entry(format!("{}/{}", refs.org, refs.repo))
                .or_insert_with(|| refs.ref_string());
        }

        let mut custom_err = None;
        if let Some(path) = custom_file {
            tracing::info!("found custom metadata");
            match parse_custom_metadata(censor, &path) {
                Ok(custom) => document.metadata = custom,
                Err(err) => {
                    tracing::warn!(error = %err, "error parsing custom metadata");
                    custom_err = Some(err);
                }
            }
        }

        let serialized = serde_json::to_vec_pretty(&document).unwrap_or_default();
        save_artifact(censor, root, METADATA_JSON_FILENAME, &serialized)?;
        match custom_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Finds the first custom metadata file under the artifact root. Multiple
/// matches are not supported; the first is used and the rest are reported.
#[must_use]
pub fn find_custom_metadata_file(root: &Path) -> Option<PathBuf> {
    let mut found: Option<PathBuf> = None;
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.file_name() == CUSTOM_METADATA_FILE {
            if found.is_none() {
                found = Some(entry.into_path());
            } else {
                tracing::error!(
                    "multiple custom metadata files found, which are not supported; using the first"
                );
                break;
            }
        }
    }
    found
}

fn parse_custom_metadata(
    censor: &DynamicCensor,
    path: &Path,
) -> Result<BTreeMap<String, String>, ArtifactError> {
    let custom_err = |message: String| ArtifactError::CustomMetadata {
        path: path.display().to_string(),
        message,
    };
    let raw = std::fs::read(path).map_err(|err| custom_err(err.to_string()))?;
    let parsed: BTreeMap<String, String> =
        serde_json::from_slice(&raw).map_err(|err| custom_err(err.to_string()))?;
    Ok(parsed
        .into_iter()
        .map(|(key, value)| (censor.censor_str(&key), censor.censor_str(&value)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobspec::Refs;

    fn job_spec() -> JobSpec {
        JobSpec {
            prowjob_id: "pod-123".into(),
            refs: Some(Refs {
                org: "acme".into(),
                repo: "widget".into(),
                base_ref: "main".into(),
                base_sha: "abc".into(),
                ..Refs::default()
            }),
            ..JobSpec::default()
        }
    }

    #[test]
    fn save_artifact_censors_and_creates_dirs() {
        let censor = DynamicCensor::new();
        censor.add_secrets(["tok3n"]);
        let dir = tempfile::tempdir().unwrap();
        save_artifact(&censor, dir.path(), "nested/out.txt", b"have tok3n here").unwrap();
        let written = std::fs::read_to_string(dir.path().join("nested/out.txt")).unwrap();
        assert_eq!(written, "have CENSORED here");
    }

    #[test]
    fn metadata_written_at_start_and_stable_without_custom() {
        let censor = DynamicCensor::new();
        let dir = tempfile::tempdir().unwrap();
        let mut writer = MetadataWriter::new();
        writer.write(&censor, dir.path(), &job_spec(), "ci-op-abcd1234").unwrap();

        let first = std::fs::read_to_string(dir.path().join(METADATA_JSON_FILENAME)).unwrap();
        assert!(first.contains("\"revision\": \"1\""), "{first}");
        assert!(first.contains("ci-op-abcd1234"), "{first}");

        // Second write without custom metadata leaves the document alone.
        writer.write(&censor, dir.path(), &job_spec(), "ci-op-abcd1234").unwrap();
        let second = std::fs::read_to_string(dir.path().join(METADATA_JSON_FILENAME)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn custom_metadata_is_merged_and_censored() {
        let censor = DynamicCensor::new();
        censor.add_secrets(["hunter2"]);
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("e2e")).unwrap();
        std::fs::write(
            dir.path().join("e2e").join(CUSTOM_METADATA_FILE),
            br#"{"cluster-version": "4.17.3", "password": "hunter2"}"#,
        )
        .unwrap();

        let mut writer = MetadataWriter::new();
        writer.write(&censor, dir.path(), &job_spec(), "ns").unwrap();
        let written = std::fs::read_to_string(dir.path().join(METADATA_JSON_FILENAME)).unwrap();
        assert!(written.contains("cluster-version"), "{written}");
        assert!(written.contains("CENSORED"), "{written}");
        assert!(!written.contains("hunter2"), "{written}");
    }

    #[test]
    fn malformed_custom_metadata_still_writes_document() {
        let censor = DynamicCensor::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CUSTOM_METADATA_FILE), b"{not json").unwrap();

        let mut writer = MetadataWriter::new();
        let err = writer.write(&censor, dir.path(), &job_spec(), "ns").unwrap_err();
        assert!(matches!(err, ArtifactError::CustomMetadata { .. }));
        assert!(dir.path().join(METADATA_JSON_FILENAME).exists());
    }

    #[test]
    fn first_custom_metadata_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("a").join(CUSTOM_METADATA_FILE), b"{}").unwrap();
        std::fs::write(dir.path().join("b").join(CUSTOM_METADATA_FILE), b"{}").unwrap();
        let found = find_custom_metadata_file(dir.path()).unwrap();
        assert!(found.ends_with(Path::new("a").join(CUSTOM_METADATA_FILE)));
    }
}
