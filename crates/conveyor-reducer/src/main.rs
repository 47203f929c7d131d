//! conveyor-reducer - reduce periodic test frequency by release age.
//!
//! Walks a configuration store and rewrites the cron and interval schedules
//! of versioned branches: the older the release, the less often its tests
//! run. Files are gathered first, then fanned out to a fixed-size worker
//! pool; each file belongs to exactly one (org, repo, branch, variant), so
//! writers never overlap.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use conveyor_core::schedule::{
    MajorMinor, effective_version, profile_allowed, reduce_test_schedule, release_age_band,
    should_exclude_qe_cluster_profile, should_process_job_by_name,
};

mod walk;

use walk::{ConfigJob, commit_job, gather_jobs};

/// The cluster-profile filter file.
#[derive(Debug, Deserialize)]
struct ClusterProfilesConfig {
    cluster_profiles: Vec<String>,
}

/// Reduce periodic test frequency according to release age.
#[derive(Debug, Parser)]
#[command(name = "conveyor-reducer", version, about)]
struct Options {
    /// Current release as `major.minor`.
    #[arg(long, required = true)]
    current_release: String,

    /// Maximum number of threads for parallel processing.
    #[arg(long)]
    max_threads: Option<usize>,

    /// YAML file with `cluster_profiles` to restrict processing to.
    #[arg(long)]
    cluster_profiles_config: Option<PathBuf>,

    /// Root of the configuration store.
    #[arg(long, required = true)]
    config_dir: PathBuf,

    /// Write the rewritten files. Without this, decisions are only logged.
    #[arg(long)]
    confirm: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Options::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: Options) -> Result<()> {
    let max_threads = match options.max_threads {
        Some(n) if n > 0 => n,
        Some(n) => bail!("max-threads must be positive, got {n}"),
        None => std::thread::available_parallelism().map_or(1, |n| n.get()),
    };

    let current = MajorMinor::parse(&options.current_release)
        .context("not valid --current-release")?;

    let allowed_profiles = match &options.cluster_profiles_config {
        None => {
            tracing::info!("no cluster profiles filter specified, processing all configurations");
            None
        }
        Some(path) => {
            let profiles = load_cluster_profiles(path)
                .context("could not load cluster profiles configuration")?;
            tracing::info!(count = profiles.len(), "loaded cluster profiles filter");
            Some(profiles)
        }
    };

    let (jobs, gather_failures) = gather_jobs(&options.config_dir);
    let mut failures = gather_failures;

    tracing::info!(
        configurations = jobs.len(),
        threads = max_threads,
        "processing configurations"
    );
    failures.extend(process_in_parallel(
        jobs,
        max_threads,
        current,
        allowed_profiles.as_ref(),
        options.confirm,
    ));

    if failures.is_empty() {
        tracing::info!("all configurations processed successfully");
        Ok(())
    } else {
        for failure in &failures {
            tracing::error!("{failure}");
        }
        bail!("failed to process {} configurations", failures.len())
    }
}

fn load_cluster_profiles(path: &std::path::Path) -> Result<HashSet<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: ClusterProfilesConfig =
        serde_yaml::from_str(&raw).context("failed to parse cluster profiles YAML")?;
    if config.cluster_profiles.is_empty() {
        bail!("no cluster profiles specified in config file");
    }
    for profile in &config.cluster_profiles {
        tracing::debug!(profile, "allowing cluster profile");
    }
    Ok(config.cluster_profiles.into_iter().collect())
}

/// Fans the gathered jobs out to the worker pool. Workers pull from a
/// shared queue and push failures into an aggregation channel drained on
/// this thread after the pool joins.
fn process_in_parallel(
    jobs: Vec<ConfigJob>,
    max_threads: usize,
    current: MajorMinor,
    allowed_profiles: Option<&HashSet<String>>,
    confirm: bool,
) -> Vec<String> {
    let total = jobs.len();
    let queue = Mutex::new(jobs.into_iter());
    let (error_tx, error_rx) = mpsc::channel::<String>();
    let processed = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for worker in 0..max_threads {
            let queue = &queue;
            let processed = &processed;
            let error_tx = error_tx.clone();
            scope.spawn(move || {
                tracing::debug!(worker, "worker started");
                let mut handled = 0usize;
                loop {
                    let Some(mut job) = queue.lock().unwrap_or_else(|e| e.into_inner()).next()
                    else {
                        break;
                    };
                    if let Err(err) =
                        process_configuration(&mut job, current, allowed_profiles, confirm)
                    {
                        let _ = error_tx.send(err);
                    }
                    handled += 1;
                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    if done % 100 == 0 || done == total {
                        tracing::info!(
                            "progress: {done}/{total} configurations processed ({:.1}%)",
                            done as f64 / total.max(1) as f64 * 100.0
                        );
                    }
                }
                tracing::debug!(worker, handled, "worker finished");
            });
        }
        drop(error_tx);
    });

    error_rx.into_iter().collect()
}

/// Applies the band policy to one configuration file.
fn process_configuration(
    job: &mut ConfigJob,
    current: MajorMinor,
    allowed_profiles: Option<&HashSet<String>>,
    confirm: bool,
) -> Result<(), String> {
    let info = &job.info;
    tracing::debug!(
        org = %info.org,
        repo = %info.repo,
        branch = %info.branch,
        variant = ?info.variant,
        "processing configuration"
    );

    let version = effective_version(&info.branch, info.variant.as_deref());
    let Ok(version) = MajorMinor::parse(&version) else {
        tracing::debug!(branch = %info.branch, "no version extracted, leaving schedules alone");
        return Ok(());
    };
    let band = release_age_band(version, current);

    let mut modified = 0usize;
    for test in &mut job.configuration.tests {
        if !should_process_job_by_name(&test.as_name) {
            continue;
        }
        let profile = test.cluster_profile_name().map(str::to_string);
        if should_exclude_qe_cluster_profile(profile.as_deref()) {
            tracing::debug!(test = %test.as_name, "skipping: cluster profile is a QE profile");
            continue;
        }
        if !profile_allowed(profile.as_deref(), allowed_profiles) {
            tracing::debug!(test = %test.as_name, "skipping: cluster profile not in allowed list");
            continue;
        }
        let before = (test.cron.clone(), test.interval.clone());
        reduce_test_schedule(test, band);
        if before != (test.cron.clone(), test.interval.clone()) {
            modified += 1;
        }
    }

    if modified > 0 {
        tracing::info!(
            org = %info.org,
            repo = %info.repo,
            branch = %info.branch,
            modified,
            "reduced test schedules"
        );
        if confirm {
            commit_job(job)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::schedule::{
        is_executed_at_most_once_per_year, is_executed_at_most_x_times_a_month,
    };
    use walk::gather_jobs;

    fn write_config(dir: &std::path::Path, org: &str, repo: &str, branch: &str, body: &str) {
        let repo_dir = dir.join(org).join(repo);
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join(format!("{org}-{repo}-{branch}.yaml")), body).unwrap();
    }

    fn run_reducer(dir: &std::path::Path, current: &str) {
        let (jobs, failures) = gather_jobs(dir);
        assert!(failures.is_empty(), "{failures:?}");
        let current = MajorMinor::parse(current).unwrap();
        let errors = process_in_parallel(jobs, 2, current, None, true);
        assert!(errors.is_empty(), "{errors:?}");
    }

    fn read_test(dir: &std::path::Path, org: &str, repo: &str, branch: &str) -> (Option<String>, Option<String>) {
        let (jobs, _) = gather_jobs(dir);
        let job = jobs
            .iter()
            .find(|j| j.info.org == org && j.info.repo == repo && j.info.branch == branch)
            .unwrap();
        let test = &job.configuration.tests[0];
        (test.cron.clone(), test.interval.clone())
    }

    #[test]
    fn old_branch_daily_cron_becomes_yearly() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.14",
            "tests:\n- as: e2e-test\n  cron: 0 0 * * *\n",
        );
        run_reducer(dir.path(), "4.17");
        let (cron, _) = read_test(dir.path(), "acme", "widget", "release-4.14");
        assert!(is_executed_at_most_once_per_year(&cron.unwrap()).unwrap());
    }

    #[test]
    fn n1_branch_interval_becomes_weekly_cron() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.16",
            "tests:\n- as: e2e-aws\n  interval: 24h\n",
        );
        run_reducer(dir.path(), "4.17");
        let (cron, interval) = read_test(dir.path(), "acme", "widget", "release-4.16");
        assert!(interval.is_none());
        assert!(is_executed_at_most_x_times_a_month(&cron.unwrap(), 5).unwrap());
    }

    #[test]
    fn n2_branch_interval_becomes_biweekly_cron() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.15",
            "tests:\n- as: e2e-upgrade\n  interval: 24h\n",
        );
        run_reducer(dir.path(), "4.17");
        let (cron, interval) = read_test(dir.path(), "acme", "widget", "release-4.15");
        assert!(interval.is_none());
        assert!(is_executed_at_most_x_times_a_month(&cron.unwrap(), 2).unwrap());
    }

    #[test]
    fn current_release_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.17",
            "tests:\n- as: e2e-test\n  cron: 0 0 * * *\n",
        );
        run_reducer(dir.path(), "4.17");
        let (cron, _) = read_test(dir.path(), "acme", "widget", "release-4.17");
        assert_eq!(cron.as_deref(), Some("0 0 * * *"));
    }

    #[test]
    fn unmatched_test_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.14",
            "tests:\n- as: unit\n  cron: 0 0 * * *\n",
        );
        run_reducer(dir.path(), "4.17");
        let (cron, _) = read_test(dir.path(), "acme", "widget", "release-4.14");
        assert_eq!(cron.as_deref(), Some("0 0 * * *"));
    }

    #[test]
    fn second_run_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.15",
            "tests:\n- as: e2e-test\n  cron: 0 0 * * *\n",
        );
        run_reducer(dir.path(), "4.17");
        let first = read_test(dir.path(), "acme", "widget", "release-4.15");
        run_reducer(dir.path(), "4.17");
        let second = read_test(dir.path(), "acme", "widget", "release-4.15");
        assert_eq!(first, second);
        assert!(is_executed_at_most_x_times_a_month(&second.0.unwrap(), 2).unwrap());
    }

    #[test]
    fn qe_profiles_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.14",
            "tests:\n- as: e2e-test\n  cron: 0 0 * * *\n  cluster_profile: hypershift-qe-powervs\n",
        );
        run_reducer(dir.path(), "4.17");
        let (cron, _) = read_test(dir.path(), "acme", "widget", "release-4.14");
        assert_eq!(cron.as_deref(), Some("0 0 * * *"));
    }

    #[test]
    fn profile_allow_list_restricts_processing() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "acme",
            "widget",
            "release-4.14",
            "tests:\n- as: e2e-test\n  cron: 0 0 * * *\n  cluster_profile: gcp\n",
        );
        let (jobs, _) = gather_jobs(dir.path());
        let allowed: HashSet<String> = ["aws".to_string()].into_iter().collect();
        let current = MajorMinor::parse("4.17").unwrap();
        let errors = process_in_parallel(jobs, 1, current, Some(&allowed), true);
        assert!(errors.is_empty());
        let (cron, _) = read_test(dir.path(), "acme", "widget", "release-4.14");
        assert_eq!(cron.as_deref(), Some("0 0 * * *"));
    }
}
