//! Configuration store traversal.
//!
//! Configurations live under `ROOT/org/repo/org-repo-branch.yaml`, with an
//! optional `__variant` suffix before the extension. The directory and file
//! naming encode the configuration's identity, so walking the tree yields
//! both the document and its metadata without reading any index.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use conveyor_core::config::ReleaseBuildConfiguration;

/// Identity of one configuration file derived from its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigInfo {
    /// Organization, from the grandparent directory.
    pub org: String,
    /// Repository, from the parent directory.
    pub repo: String,
    /// Branch, from the file name.
    pub branch: String,
    /// Variant, from the `__variant` suffix.
    pub variant: Option<String>,
    /// Absolute path of the file.
    pub path: PathBuf,
}

/// One unit of work for the rewrite pool.
#[derive(Debug, Clone)]
pub struct ConfigJob {
    /// The parsed configuration.
    pub configuration: ReleaseBuildConfiguration,
    /// Its identity.
    pub info: ConfigInfo,
}

/// Derives the identity of a configuration file from its path, or explains
/// why the path does not follow the naming convention.
pub fn info_from_path(path: &Path) -> Result<ConfigInfo, String> {
    let repo_dir = path
        .parent()
        .ok_or_else(|| format!("could not extract repo from {}", path.display()))?;
    let repo = repo_dir
        .file_name()
        .ok_or_else(|| format!("could not extract repo from {}", path.display()))?
        .to_string_lossy()
        .into_owned();
    let org = repo_dir
        .parent()
        .and_then(Path::file_name)
        .ok_or_else(|| format!("could not extract org from {}", path.display()))?
        .to_string_lossy()
        .into_owned();

    let basename = path
        .file_stem()
        .ok_or_else(|| format!("bad file name {}", path.display()))?
        .to_string_lossy()
        .into_owned();
    let prefix = format!("{org}-{repo}-");
    let branch_variant = basename
        .strip_prefix(&prefix)
        .ok_or_else(|| format!("file name was not prefixed with {prefix:?}: {basename:?}"))?;

    let (branch, variant) = match branch_variant.split_once("__") {
        Some((branch, variant)) => (branch.to_string(), Some(variant.to_string())),
        None => (branch_variant.to_string(), None),
    };
    Ok(ConfigInfo { org, repo, branch, variant, path: path.to_path_buf() })
}

/// Walks the configuration root and parses every YAML file that follows the
/// naming convention. Returns the jobs plus per-file failures.
pub fn gather_jobs(root: &Path) -> (Vec<ConfigJob>, Vec<String>) {
    let mut jobs = Vec::new();
    let mut failures = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => {}
            _ => continue,
        }
        let info = match info_from_path(path) {
            Ok(info) => info,
            Err(err) => {
                tracing::debug!(path = %path.display(), "skipping: {err}");
                continue;
            }
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => match ReleaseBuildConfiguration::from_yaml(&raw) {
                Ok(configuration) => jobs.push(ConfigJob { configuration, info }),
                Err(err) => {
                    failures.push(format!("could not parse {}: {err}", path.display()));
                }
            },
            Err(err) => failures.push(format!("could not read {}: {err}", path.display())),
        }
    }
    (jobs, failures)
}

/// Writes a configuration back to its file.
pub fn commit_job(job: &ConfigJob) -> Result<(), String> {
    let serialized = serde_yaml::to_string(&job.configuration).map_err(|err| {
        format!(
            "failed to serialize configuration for {}/{}@{}: {err}",
            job.info.org, job.info.repo, job.info.branch
        )
    })?;
    std::fs::write(&job.info.path, serialized).map_err(|err| {
        format!(
            "failed to commit configuration for {}/{}@{}: {err}",
            job.info.org, job.info.repo, job.info.branch
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_identity_from_path() {
        let info =
            info_from_path(Path::new("/configs/acme/widget/acme-widget-release-4.14.yaml"))
                .unwrap();
        assert_eq!(info.org, "acme");
        assert_eq!(info.repo, "widget");
        assert_eq!(info.branch, "release-4.14");
        assert_eq!(info.variant, None);
    }

    #[test]
    fn derives_variant_from_suffix() {
        let info =
            info_from_path(Path::new("/configs/acme/widget/acme-widget-master__nightly-4.17.yaml"))
                .unwrap();
        assert_eq!(info.branch, "master");
        assert_eq!(info.variant.as_deref(), Some("nightly-4.17"));
    }

    #[test]
    fn rejects_unprefixed_names() {
        let err = info_from_path(Path::new("/configs/acme/widget/other-name.yaml")).unwrap_err();
        assert!(err.contains("not prefixed"), "{err}");
    }

    #[test]
    fn gather_parses_wellformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("acme/widget");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(
            repo_dir.join("acme-widget-release-4.14.yaml"),
            "tests:\n- as: e2e-aws\n  cron: 0 0 * * *\n",
        )
        .unwrap();
        std::fs::write(repo_dir.join("acme-widget-release-4.15.yaml"), "tests: [").unwrap();

        let (jobs, failures) = gather_jobs(dir.path());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].info.branch, "release-4.14");
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn commit_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("acme/widget");
        std::fs::create_dir_all(&repo_dir).unwrap();
        let path = repo_dir.join("acme-widget-main.yaml");
        std::fs::write(&path, "tests:\n- as: e2e-aws\n  cron: 0 0 * * *\n").unwrap();

        let (mut jobs, _) = gather_jobs(dir.path());
        jobs[0].configuration.tests[0].cron = Some("0 0 1 1 *".to_string());
        commit_job(&jobs[0]).unwrap();

        let (jobs, _) = gather_jobs(dir.path());
        assert_eq!(jobs[0].configuration.tests[0].cron.as_deref(), Some("0 0 1 1 *"));
    }
}
