//! conveyor-operator - orchestrate multi-stage image-based builds.
//!
//! Reads a declarative configuration, materializes the step graph for the
//! requested targets, and executes it in an ephemeral namespace derived
//! from the build inputs. Exit code is 0 on success and 1 on any failure;
//! a short summary of every failure goes to stderr.

use std::io::Write;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::LevelFilter};

use conveyor_core::artifacts::{self, LOG_FILENAME, save_artifact};
use conveyor_core::censor::DynamicCensor;
use conveyor_core::junit::{FailureOutput, TestCase, TestSuite, TestSuites};
use conveyor_core::results::{OperatorError, ResultsReporter};

mod namespace;
mod options;
mod run;

use options::Options;

#[tokio::main]
async fn main() -> ExitCode {
    let censor = Arc::new(DynamicCensor::new());
    if let Err(err) = setup_logging(&censor) {
        eprintln!("could not set up logging: {err}");
        return ExitCode::FAILURE;
    }

    let options = Options::parse();
    let verbose = options.verbose;
    if verbose {
        tracing::debug!("verbose output enabled");
    }

    let completed = match options.complete(&censor).await {
        Ok(completed) => completed,
        Err(err) => {
            tracing::error!("failed to load arguments: {err}");
            report_and_summarize(&censor, None, vec![err]).await;
            return ExitCode::FAILURE;
        }
    };

    let reporter = ResultsReporter::new(
        completed.options.results_address.clone(),
        completed.job_spec.job.clone(),
        "default".to_string(),
    );

    let errors = run::run(completed, Arc::clone(&censor)).await;
    if errors.is_empty() {
        reporter.report(&[]).await;
        return ExitCode::SUCCESS;
    }

    report_and_summarize(&censor, Some(&reporter), errors).await;
    ExitCode::FAILURE
}

/// Prints the failure summary, writes the covering JUnit artifact for
/// errors that lack one, and reports reasons to the results sink.
async fn report_and_summarize(
    censor: &DynamicCensor,
    reporter: Option<&ResultsReporter>,
    errors: Vec<OperatorError>,
) {
    let mut message = String::new();
    for err in &errors {
        message.push_str(&format!("\n  * {err}"));
    }
    tracing::error!("some steps failed:");
    tracing::error!("{message}");

    write_failing_junit(censor, &errors);
    if let Some(reporter) = reporter {
        reporter.report(&errors).await;
    }
}

/// Writes a JUnit artifact with one failed `initialize` test case per error
/// that is not already covered by an emitted JUnit file, so higher-level
/// automation always sees a result.
fn write_failing_junit(censor: &DynamicCensor, errors: &[OperatorError]) {
    let Some(root) = artifacts::artifact_dir() else {
        return;
    };
    let cases: Vec<TestCase> = errors
        .iter()
        .filter(|err| !err.wrote_junit())
        .map(|err| TestCase {
            name: "initialize".to_string(),
            failure_output: Some(FailureOutput { output: err.to_string() }),
            ..TestCase::default()
        })
        .collect();
    if cases.is_empty() {
        return;
    }
    let mut suites = TestSuites {
        suites: vec![TestSuite {
            name: "job".to_string(),
            num_tests: errors.len() as u32,
            num_failed: errors.len() as u32,
            test_cases: cases,
            ..TestSuite::default()
        }],
    };
    match suites.serialize(censor) {
        Ok(data) => {
            if let Err(err) = save_artifact(censor, &root, "junit_job.xml", &data) {
                tracing::trace!(error = %err, "unable to write top level failing JUnit artifact");
            }
        }
        Err(err) => tracing::trace!(error = %err, "unable to serialize failing JUnit artifact"),
    }
}

/// A `MakeWriter` that scrubs registered secrets from every line before it
/// reaches the underlying writer.
struct CensoringWriter {
    censor: Arc<DynamicCensor>,
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl CensoringWriter {
    fn stdout(censor: Arc<DynamicCensor>) -> Self {
        Self { censor, inner: Arc::new(Mutex::new(Box::new(std::io::stdout()))) }
    }

    fn file(censor: Arc<DynamicCensor>, file: std::fs::File) -> Self {
        Self { censor, inner: Arc::new(Mutex::new(Box::new(file))) }
    }
}

struct CensoringHandle {
    censor: Arc<DynamicCensor>,
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Write for CensoringHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut data = buf.to_vec();
        self.censor.censor(&mut data);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.write_all(&data)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CensoringWriter {
    type Writer = CensoringHandle;

    fn make_writer(&'a self) -> Self::Writer {
        CensoringHandle { censor: Arc::clone(&self.censor), inner: Arc::clone(&self.inner) }
    }
}

/// Installs two logging layers: human-readable info and above on stdout,
/// and the full JSON stream appended to the artifact log when `$ARTIFACTS`
/// is set. Both pass through the censor.
fn setup_logging(censor: &Arc<DynamicCensor>) -> Result<(), String> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(CensoringWriter::stdout(Arc::clone(censor)))
        .with_filter(LevelFilter::INFO);

    let file_layer = match artifacts::artifact_dir() {
        None => None,
        Some(root) => {
            std::fs::create_dir_all(&root).map_err(|err| err.to_string())?;
            let file = std::fs::File::create(root.join(LOG_FILENAME))
                .map_err(|err| err.to_string())?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(CensoringWriter::file(Arc::clone(censor), file))
                    .with_filter(LevelFilter::TRACE),
            )
        }
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| err.to_string())
}
