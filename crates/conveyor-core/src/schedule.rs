//! Release-age schedule policy.
//!
//! Versioned branches accumulate periodic test schedules that should thin
//! out as the release ages. Each release-age band maps to one allowed
//! frequency: the current release is untouched, `n-1` runs at most four
//! times a month, `n-2` at most twice a month, and anything `n-3` or older
//! at most once a year. Schedules that exceed their band are replaced by
//! randomly generated crons that satisfy it.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use rand::Rng;
use regex::Regex;
use thiserror::Error;

use crate::config::TestConfiguration;

/// Error evaluating a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The cron expression did not parse.
    #[error("could not parse cron expression {expr:?}: {message}")]
    Parse {
        /// The rejected expression.
        expr: String,
        /// Parser detail.
        message: String,
    },

    /// The expression produced more invocations than the synthetic window
    /// can count; it is either invalid or absurdly frequent.
    #[error("cron expression {expr:?} exceeded {max} iterations")]
    IterationGuard {
        /// The offending expression.
        expr: String,
        /// The guard that tripped.
        max: usize,
    },

    /// A version string did not parse as `major.minor`.
    #[error("invalid version {0:?}: must be major.minor")]
    InvalidVersion(String),
}

/// A `major.minor` release version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MajorMinor {
    /// Major version.
    pub major: i64,
    /// Minor version.
    pub minor: i64,
}

impl MajorMinor {
    /// Parses `major.minor`.
    pub fn parse(value: &str) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidVersion(value.to_string());
        let (major, minor) = value.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }

    /// The version `minor - n` releases back.
    #[must_use]
    pub fn past(self, n: i64) -> Self {
        Self { major: self.major, minor: self.minor - n }
    }
}

impl std::fmt::Display for MajorMinor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The release-age band of a test's version relative to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAgeBand {
    /// The current release; schedules are untouched.
    Current,
    /// One release back: at most four runs a month.
    NMinus1,
    /// Two releases back: at most two runs a month.
    NMinus2,
    /// Three or more releases back: at most one run a year.
    NMinus3OrOlder,
}

/// Computes the band of `version` against `current`. Versions newer than
/// `n-1` (including the current release and anything ahead of it) are
/// untouched; an unmatched gap does not exist since bands are exhaustive
/// below `n-1`.
#[must_use]
pub fn release_age_band(version: MajorMinor, current: MajorMinor) -> ReleaseAgeBand {
    if version <= current.past(3) {
        ReleaseAgeBand::NMinus3OrOlder
    } else if version == current.past(2) {
        ReleaseAgeBand::NMinus2
    } else if version == current.past(1) {
        ReleaseAgeBand::NMinus1
    } else {
        ReleaseAgeBand::Current
    }
}

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:release|openshift)-(\d+\.\d+)$|^.*nightly-(\d+\.\d+)$").expect("static regex")
});

/// Extracts a `major.minor` version from a branch or variant name.
///
/// Matches `release-4.17`, `openshift-4.14`, and `master__nightly-4.17`
/// style names, plus the compact 3-character variant form `4NN` → `4.NN`.
/// Returns an empty string when nothing matches.
#[must_use]
pub fn extract_version(value: &str) -> String {
    if let Some(captures) = VERSION_RE.captures(value) {
        for group in [1, 2] {
            if let Some(m) = captures.get(group) {
                return m.as_str().to_string();
            }
        }
    }
    // Compact variant form: "419" -> "4.19".
    let bytes = value.as_bytes();
    if bytes.len() == 3 && bytes[0] == b'4' && value[1..].chars().all(|c| c.is_ascii_digit()) {
        return format!("{}.{}", &value[0..1], &value[1..3]);
    }
    String::new()
}

/// Picks the version governing a configuration from its branch and variant
/// names, preferring a `4.x` variant over a non-`4.x` branch.
#[must_use]
pub fn effective_version(branch: &str, variant: Option<&str>) -> String {
    let branch_version = extract_version(branch);
    let variant_version = variant.map(extract_version).unwrap_or_default();

    if !variant_version.is_empty() && variant_version.starts_with("4.") {
        if !branch_version.starts_with("4.") {
            return variant_version;
        }
    } else if branch_version.is_empty() && !variant_version.is_empty() {
        return variant_version;
    }
    branch_version
}

/// Keywords a test name must contain to be subject to schedule reduction.
const REQUIRED_NAME_KEYWORDS: &[&str] =
    &["e2e", "upgrade", "vsphere", "aws", "nightly", "metal", "conformance", "ocp"];

/// Whether the test name opts into schedule reduction.
#[must_use]
pub fn should_process_job_by_name(name: &str) -> bool {
    if name.contains("mirror-nightly-image") || name.contains("promote-") {
        return false;
    }
    let lowered = name.to_lowercase();
    REQUIRED_NAME_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
}

/// Whether the test's cluster profile excludes it as a QE profile.
#[must_use]
pub fn should_exclude_qe_cluster_profile(profile: Option<&str>) -> bool {
    profile.is_some_and(|p| p.to_lowercase().contains("-qe"))
}

/// Whether the test passes the optional profile allow-list. Tests without a
/// profile always pass.
#[must_use]
pub fn profile_allowed(profile: Option<&str>, allowed: Option<&HashSet<String>>) -> bool {
    match (profile, allowed) {
        (_, None) | (None, _) => true,
        (Some(profile), Some(allowed)) => allowed.contains(profile),
    }
}

fn expand_macro(expr: &str) -> Option<&'static str> {
    match expr.to_lowercase().as_str() {
        "@daily" => Some("0 0 * * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    }
}

/// Rewrites cron macros to generated crons of the next reduced frequency:
/// daily becomes weekend-weekly, weekly becomes bi-weekly, monthly and
/// yearly stay at their frequency but get a generated spread.
#[must_use]
pub fn convert_cron_macro_to_generated(expr: &str) -> String {
    match expr.to_lowercase().as_str() {
        "@daily" => generate_weekly_weekend_cron(),
        "@weekly" => generate_bi_weekly_cron(),
        "@monthly" => generate_monthly_cron(),
        "@yearly" | "@annually" => generate_yearly_cron(),
        _ => expr.to_string(),
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrites numeric day-of-week tokens to names. Standard crontab numbers
/// days 0-7 with both 0 and 7 meaning Sunday; the schedule library numbers
/// them differently, so names are the unambiguous form.
fn normalize_day_of_week(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 8);
    let mut token = String::new();
    let flush = |token: &mut String, out: &mut String| {
        if let Ok(n) = token.parse::<usize>() {
            if n <= 7 {
                out.push_str(DAY_NAMES[n % 7]);
                token.clear();
                return;
            }
        }
        out.push_str(token);
        token.clear();
    };
    for c in field.chars() {
        if c.is_ascii_digit() {
            token.push(c);
        } else {
            flush(&mut token, &mut out);
            out.push(c);
        }
    }
    flush(&mut token, &mut out);
    out
}

/// Parses a five-field cron expression (or macro) into a schedule.
fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let canonical = expand_macro(expr).map_or_else(|| expr.to_string(), String::from);
    let fields: Vec<&str> = canonical.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ScheduleError::Parse {
            expr: expr.to_string(),
            message: format!("expected 5 fields, got {}", fields.len()),
        });
    }
    let with_seconds = format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        normalize_day_of_week(fields[4]),
    );
    Schedule::from_str(&with_seconds).map_err(|err| ScheduleError::Parse {
        expr: expr.to_string(),
        message: err.to_string(),
    })
}

fn synthetic_window_start() -> DateTime<Utc> {
    // A fixed window keeps the counters deterministic.
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Whether the expression fires at most once in a synthetic year.
pub fn is_executed_at_most_once_per_year(expr: &str) -> Result<bool, ScheduleError> {
    const MAX_ITERATIONS: usize = 1000;
    let schedule = parse_schedule(expr)?;
    let start = synthetic_window_start();
    let end = start + chrono::Duration::days(366);

    let mut count = 0usize;
    for (iterations, next) in schedule.after(&start).enumerate() {
        if iterations >= MAX_ITERATIONS {
            tracing::warn!(expr, "cron expression exceeded the yearly iteration guard");
            return Err(ScheduleError::IterationGuard { expr: expr.to_string(), max: MAX_ITERATIONS });
        }
        if next >= end {
            break;
        }
        count += 1;
    }
    Ok(count <= 1)
}

/// Whether the expression fires at most `x` times in a synthetic month.
pub fn is_executed_at_most_x_times_a_month(expr: &str, x: usize) -> Result<bool, ScheduleError> {
    const MAX_ITERATIONS: usize = 100;
    let schedule = parse_schedule(expr)?;
    let start = synthetic_window_start();
    let end = start + chrono::Duration::days(31);

    let mut count = 0usize;
    for (iterations, next) in schedule.after(&start).enumerate() {
        if iterations >= MAX_ITERATIONS {
            tracing::warn!(expr, "cron expression exceeded the monthly iteration guard");
            return Err(ScheduleError::IterationGuard { expr: expr.to_string(), max: MAX_ITERATIONS });
        }
        if next > end {
            break;
        }
        count += 1;
    }
    Ok(count <= x)
}

/// Generates a once-a-week cron on a weekend day.
#[must_use]
pub fn generate_weekly_weekend_cron() -> String {
    let mut rng = rand::thread_rng();
    let day = if rng.gen_range(0..2) == 0 { 0 } else { 6 };
    format!("{} {} * * {day}", rng.gen_range(0..60), rng.gen_range(0..24))
}

/// Generates a twice-a-month cron with one day in each half of the month.
#[must_use]
pub fn generate_bi_weekly_cron() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{} {} {},{} * *",
        rng.gen_range(0..60),
        rng.gen_range(0..24),
        rng.gen_range(5..15),
        rng.gen_range(15..29),
    )
}

/// Generates a once-a-month cron.
#[must_use]
pub fn generate_monthly_cron() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{} {} {} * *",
        rng.gen_range(0..60),
        rng.gen_range(0..24),
        rng.gen_range(1..29),
    )
}

/// Generates a once-a-year cron on a random day and month. Days stop at 28
/// to avoid month-boundary surprises.
#[must_use]
pub fn generate_yearly_cron() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{} {} {} {} *",
        rng.gen_range(0..60),
        rng.gen_range(0..24),
        rng.gen_range(1..29),
        rng.gen_range(1..13),
    )
}

/// Interval floor for each band; intervals shorter than the floor are
/// replaced with a generated cron for the band.
fn interval_floor(band: ReleaseAgeBand) -> Option<Duration> {
    match band {
        ReleaseAgeBand::Current => None,
        ReleaseAgeBand::NMinus1 => Some(Duration::from_secs(7 * 24 * 3600)),
        ReleaseAgeBand::NMinus2 => Some(Duration::from_secs(14 * 24 * 3600)),
        ReleaseAgeBand::NMinus3OrOlder => Some(Duration::from_secs(365 * 24 * 3600)),
    }
}

fn reduced_cron_for_band(band: ReleaseAgeBand) -> String {
    match band {
        ReleaseAgeBand::Current => String::new(),
        ReleaseAgeBand::NMinus1 => generate_weekly_weekend_cron(),
        ReleaseAgeBand::NMinus2 => generate_bi_weekly_cron(),
        ReleaseAgeBand::NMinus3OrOlder => generate_yearly_cron(),
    }
}

fn cron_meets_band(expr: &str, band: ReleaseAgeBand) -> Result<bool, ScheduleError> {
    match band {
        ReleaseAgeBand::Current => Ok(true),
        ReleaseAgeBand::NMinus1 => {
            // A yearly-or-less schedule is below the target band; it still
            // gets regenerated so old branches keep some coverage.
            if is_executed_at_most_once_per_year(expr)? {
                return Ok(false);
            }
            is_executed_at_most_x_times_a_month(expr, 4)
        }
        ReleaseAgeBand::NMinus2 => {
            if is_executed_at_most_once_per_year(expr)? {
                return Ok(false);
            }
            is_executed_at_most_x_times_a_month(expr, 2)
        }
        ReleaseAgeBand::NMinus3OrOlder => is_executed_at_most_once_per_year(expr),
    }
}

/// Applies the band policy to one test in place.
///
/// Cron schedules above the band's frequency are replaced with generated
/// crons; intervals below the band's floor are cleared in favor of a
/// generated cron. Parse failures are logged and leave the test untouched.
pub fn reduce_test_schedule(test: &mut TestConfiguration, band: ReleaseAgeBand) {
    if band == ReleaseAgeBand::Current {
        return;
    }

    if let Some(cron_expr) = test.cron.clone() {
        let converted = convert_cron_macro_to_generated(&cron_expr);
        test.cron = Some(converted.clone());
        match cron_meets_band(&converted, band) {
            Ok(true) => {}
            Ok(false) => test.cron = Some(reduced_cron_for_band(band)),
            Err(err) => {
                tracing::warn!(test = %test.as_name, error = %err, "can't evaluate cron string");
                test.cron = Some(cron_expr);
            }
        }
    }

    if let Some(interval) = test.interval.clone() {
        let Some(floor) = interval_floor(band) else {
            return;
        };
        match humantime::parse_duration(&interval) {
            Ok(duration) if duration < floor => {
                test.cron = Some(reduced_cron_for_band(band));
                test.interval = None;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(test = %test.as_name, error = %err, "can't parse interval string");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_version_vectors() {
        assert_eq!(extract_version("release-4.17"), "4.17");
        assert_eq!(extract_version("openshift-4.14"), "4.14");
        assert_eq!(extract_version("master__nightly-4.17"), "4.17");
        assert_eq!(extract_version("feature-4.15"), "");
        assert_eq!(extract_version("419"), "4.19");
        assert_eq!(extract_version("519"), "");
        assert_eq!(extract_version("4x9"), "");
    }

    #[test]
    fn effective_version_prefers_ocp_variant() {
        assert_eq!(effective_version("release-1.12", Some("417")), "4.17");
        assert_eq!(effective_version("release-4.16", Some("417")), "4.16");
        assert_eq!(effective_version("main", Some("nightly-4.15")), "4.15");
        assert_eq!(effective_version("main", None), "");
    }

    #[test]
    fn name_filter_vectors() {
        assert!(should_process_job_by_name("e2e-aws-upgrade"));
        assert!(should_process_job_by_name("OCP-conformance"));
        assert!(!should_process_job_by_name("promote-images"));
        assert!(!should_process_job_by_name("mirror-nightly-image-e2e"));
        assert!(!should_process_job_by_name("unit"));
    }

    #[test]
    fn qe_profile_filter_vectors() {
        assert!(should_exclude_qe_cluster_profile(Some("hypershift-qe-powervs")));
        assert!(!should_exclude_qe_cluster_profile(Some("aws")));
        assert!(!should_exclude_qe_cluster_profile(Some("request-queue")));
        assert!(!should_exclude_qe_cluster_profile(None));
    }

    #[test]
    fn profile_allow_list() {
        let allowed: HashSet<String> = ["aws".to_string()].into_iter().collect();
        assert!(profile_allowed(Some("aws"), Some(&allowed)));
        assert!(!profile_allowed(Some("gcp"), Some(&allowed)));
        assert!(profile_allowed(None, Some(&allowed)));
        assert!(profile_allowed(Some("gcp"), None));
    }

    #[test]
    fn yearly_counter_vectors() {
        assert!(is_executed_at_most_once_per_year("@yearly").unwrap());
        assert!(!is_executed_at_most_once_per_year("0 0 * * *").unwrap());
        assert!(is_executed_at_most_once_per_year("30 4 7 6 *").unwrap());
    }

    #[test]
    fn monthly_counter_vectors() {
        assert!(is_executed_at_most_x_times_a_month("0 0 1,15 * *", 2).unwrap());
        assert!(!is_executed_at_most_x_times_a_month("0 0 1,15 * *", 1).unwrap());
        assert!(is_executed_at_most_x_times_a_month("0 0 * * 6", 5).unwrap());
        assert!(!is_executed_at_most_x_times_a_month("0 0 * * *", 4).unwrap());
    }

    #[test]
    fn hourly_cron_trips_the_monthly_guard() {
        assert!(matches!(
            is_executed_at_most_x_times_a_month("0 * * * *", 4),
            Err(ScheduleError::IterationGuard { .. })
        ));
    }

    #[test]
    fn weekend_day_numbers_parse() {
        // Standard crontab Sunday (0) and Saturday (6) both count four or
        // five times a month.
        assert!(is_executed_at_most_x_times_a_month("15 3 * * 0", 5).unwrap());
        assert!(is_executed_at_most_x_times_a_month("15 3 * * 6", 5).unwrap());
    }

    #[test]
    fn bands_follow_release_age() {
        let current = MajorMinor::parse("4.17").unwrap();
        let band = |v: &str| release_age_band(MajorMinor::parse(v).unwrap(), current);
        assert_eq!(band("4.17"), ReleaseAgeBand::Current);
        assert_eq!(band("4.18"), ReleaseAgeBand::Current);
        assert_eq!(band("4.16"), ReleaseAgeBand::NMinus1);
        assert_eq!(band("4.15"), ReleaseAgeBand::NMinus2);
        assert_eq!(band("4.14"), ReleaseAgeBand::NMinus3OrOlder);
        assert_eq!(band("4.10"), ReleaseAgeBand::NMinus3OrOlder);
        assert_eq!(band("3.11"), ReleaseAgeBand::NMinus3OrOlder);
    }

    fn test_config(cron: Option<&str>, interval: Option<&str>) -> TestConfiguration {
        TestConfiguration {
            as_name: "e2e-test".to_string(),
            cron: cron.map(str::to_string),
            interval: interval.map(str::to_string),
            ..TestConfiguration::default()
        }
    }

    #[test]
    fn daily_cron_on_old_branch_becomes_yearly() {
        let mut test = test_config(Some("0 0 * * *"), None);
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus3OrOlder);
        let cron = test.cron.unwrap();
        assert!(is_executed_at_most_once_per_year(&cron).unwrap(), "{cron}");
    }

    #[test]
    fn interval_on_n2_branch_becomes_biweekly_cron() {
        let mut test = test_config(None, Some("24h"));
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus2);
        assert!(test.interval.is_none());
        let cron = test.cron.unwrap();
        assert!(is_executed_at_most_x_times_a_month(&cron, 2).unwrap(), "{cron}");
    }

    #[test]
    fn long_interval_is_left_alone() {
        let mut test = test_config(None, Some("5000h"));
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus2);
        assert_eq!(test.interval.as_deref(), Some("5000h"));
        assert!(test.cron.is_none());
    }

    #[test]
    fn current_band_is_untouched() {
        let mut test = test_config(Some("0 0 * * *"), None);
        reduce_test_schedule(&mut test, ReleaseAgeBand::Current);
        assert_eq!(test.cron.as_deref(), Some("0 0 * * *"));
    }

    #[test]
    fn compliant_cron_is_preserved() {
        let mut test = test_config(Some("30 4 7 6 *"), None);
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus3OrOlder);
        assert_eq!(test.cron.as_deref(), Some("30 4 7 6 *"));
    }

    #[test]
    fn yearly_cron_on_n1_branch_is_regenerated_weekly() {
        let mut test = test_config(Some("@yearly"), None);
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus1);
        let cron = test.cron.unwrap();
        assert!(is_executed_at_most_x_times_a_month(&cron, 5).unwrap(), "{cron}");
        assert!(!is_executed_at_most_once_per_year(&cron).unwrap(), "{cron}");
    }

    #[test]
    fn unparsable_cron_is_kept_and_skipped() {
        let mut test = test_config(Some("not a cron"), None);
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus2);
        assert_eq!(test.cron.as_deref(), Some("not a cron"));
    }

    #[test]
    fn generators_stay_in_range() {
        for _ in 0..100 {
            let weekly = generate_weekly_weekend_cron();
            assert!(is_executed_at_most_x_times_a_month(&weekly, 5).unwrap(), "{weekly}");

            let biweekly = generate_bi_weekly_cron();
            assert!(is_executed_at_most_x_times_a_month(&biweekly, 2).unwrap(), "{biweekly}");

            let yearly = generate_yearly_cron();
            assert!(is_executed_at_most_once_per_year(&yearly).unwrap(), "{yearly}");
        }
    }

    #[test]
    fn reduction_is_idempotent() {
        let mut test = test_config(Some("0 0 * * *"), None);
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus2);
        let first = test.cron.clone();
        reduce_test_schedule(&mut test, ReleaseAgeBand::NMinus2);
        assert_eq!(test.cron, first);
    }

    #[test]
    fn macro_conversion_reduces_frequency() {
        let daily = convert_cron_macro_to_generated("@daily");
        assert!(is_executed_at_most_x_times_a_month(&daily, 5).unwrap(), "{daily}");
        let weekly = convert_cron_macro_to_generated("@weekly");
        assert!(is_executed_at_most_x_times_a_month(&weekly, 2).unwrap(), "{weekly}");
        assert_eq!(convert_cron_macro_to_generated("0 0 1 * *"), "0 0 1 * *");
    }
}
