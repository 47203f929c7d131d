//! Concurrent graph execution.
//!
//! Execution is concurrent across independent steps, serialized across
//! dependency edges, and fail-fast within a subgraph while isolated across
//! siblings: once any step fails, nothing new is dispatched, but steps that
//! are already running finish (or are cancelled through the ambient
//! context) and their results are preserved. No step is dispatched twice.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::graph::{StepDetails, detail_for};
use crate::junit::{FailureOutput, TestCase, TestSuite, TestSuites};
use crate::steps::{ExecutionContext, Step, StepError, has_any_link};

/// The outcome of running a graph: per-step detail, a JUnit suite, and the
/// list of failures. An empty failure list means success.
pub struct RunOutcome {
    /// JUnit suite covering every executed step.
    pub suite: TestSuites,
    /// Timing and outcome records for executed steps.
    pub details: Vec<StepDetails>,
    /// Errors from failed steps.
    pub failures: Vec<StepError>,
}

/// Executes an ordered step list against the context.
///
/// `ordered` must be a topological order of the graph; dependency edges are
/// recomputed from links so that a step is dispatched only when every
/// predecessor succeeded.
pub async fn run_graph(ctx: Arc<ExecutionContext>, ordered: &[Arc<dyn Step>]) -> RunOutcome {
    let requires: Vec<_> = ordered.iter().map(|s| s.requires()).collect();
    let creates: Vec<_> = ordered.iter().map(|s| s.creates()).collect();

    // predecessors[i] holds indexes of steps that must succeed before i runs.
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); ordered.len()];
    for (consumer, reqs) in requires.iter().enumerate() {
        for (creator, outs) in creates.iter().enumerate() {
            if creator != consumer && has_any_link(reqs, outs) {
                predecessors[consumer].push(creator);
            }
        }
    }

    let mut dispatched: BTreeSet<usize> = BTreeSet::new();
    let mut succeeded: BTreeSet<usize> = BTreeSet::new();
    let mut failed_any = false;

    let mut details: Vec<StepDetails> = Vec::new();
    let mut failures: Vec<StepError> = Vec::new();
    let mut cases: Vec<TestCase> = Vec::new();
    let mut in_flight: JoinSet<(usize, StepDetails, Result<(), StepError>)> = JoinSet::new();

    loop {
        // Dispatch every ready step, unless a failure stopped the graph.
        if !failed_any {
            for idx in 0..ordered.len() {
                if dispatched.contains(&idx) {
                    continue;
                }
                if !predecessors[idx].iter().all(|p| succeeded.contains(p)) {
                    continue;
                }
                dispatched.insert(idx);
                let step = ordered[idx].clone();
                let ctx = Arc::clone(&ctx);
                tracing::info!(step = step.name(), "running step");
                in_flight.spawn(async move {
                    let started_at = Utc::now();
                    let clock = Instant::now();
                    let result = step.execute(&ctx).await;
                    let detail =
                        detail_for(step.as_ref(), started_at, clock.elapsed(), result.is_err());
                    (idx, detail, result)
                });
            }
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (idx, detail, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                // A panicking step counts as a failure but cannot name itself.
                failures.push(StepError::Execution {
                    step: "<join>".to_string(),
                    message: err.to_string(),
                });
                failed_any = true;
                continue;
            }
        };

        let step_name = detail.name.clone();
        let duration_seconds = detail.duration_ms.unwrap_or_default() as f64 / 1000.0;
        match result {
            Ok(()) => {
                tracing::info!(step = %step_name, "step succeeded");
                succeeded.insert(idx);
                cases.push(TestCase {
                    name: step_name,
                    duration_seconds,
                    ..TestCase::default()
                });
            }
            Err(err) => {
                tracing::error!(step = %step_name, error = %err, "step failed");
                failed_any = true;
                cases.push(TestCase {
                    name: step_name,
                    duration_seconds,
                    failure_output: Some(FailureOutput { output: err.to_string() }),
                    ..TestCase::default()
                });
                failures.push(err);
            }
        }
        details.push(detail);
    }

    // Steps that never ran are reported as skipped.
    for (idx, step) in ordered.iter().enumerate() {
        if !dispatched.contains(&idx) {
            cases.push(TestCase {
                name: step.name().to_string(),
                skip_message: Some("dependencies failed".to_string()),
                ..TestCase::default()
            });
        }
    }

    let num_tests = cases.len() as u32;
    let num_failed = cases.iter().filter(|c| c.failure_output.is_some()).count() as u32;
    let suite = TestSuites {
        suites: vec![TestSuite {
            name: "step graph".to_string(),
            num_tests,
            num_failed,
            test_cases: cases,
            ..TestSuite::default()
        }],
    };

    RunOutcome { suite, details, failures }
}

/// Runs the promotion steps concurrently with fail-fast semantics: every
/// step is dispatched at once, and any failure is returned after all
/// in-flight steps settle.
pub async fn run_promotion_steps(
    ctx: Arc<ExecutionContext>,
    steps: &[Arc<dyn Step>],
) -> (Vec<StepDetails>, Vec<StepError>) {
    let mut in_flight: JoinSet<(StepDetails, Result<(), StepError>)> = JoinSet::new();
    for step in steps {
        let step = step.clone();
        let ctx = Arc::clone(&ctx);
        in_flight.spawn(async move {
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = step.execute(&ctx).await;
            let detail = detail_for(step.as_ref(), started_at, clock.elapsed(), result.is_err());
            (detail, result)
        });
    }

    let mut details = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok((detail, Ok(()))) => details.push(detail),
            Ok((detail, Err(err))) => {
                details.push(detail);
                failures.push(err);
            }
            Err(err) => failures.push(StepError::Execution {
                step: "<join>".to_string(),
                message: err.to_string(),
            }),
        }
    }
    (details, failures)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::steps::StepLink;
    use crate::steps::testutil::{FakeStep, context};

    fn arc(step: FakeStep) -> Arc<dyn Step> {
        Arc::new(step)
    }

    #[tokio::test]
    async fn runs_whole_graph_in_dependency_order() {
        let steps = vec![
            arc(FakeStep::new("src").creating(StepLink::Image("src".into()))),
            arc(FakeStep::new("build")
                .requiring(StepLink::Image("src".into()))
                .creating(StepLink::Image("component".into()))),
            arc(FakeStep::new("test").requiring(StepLink::Image("component".into()))),
        ];
        let outcome = run_graph(Arc::new(context()), &steps).await;
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.details.len(), 3);
        assert_eq!(outcome.suite.suites[0].num_failed, 0);
    }

    #[tokio::test]
    async fn failure_stops_dispatch_but_not_running_siblings() {
        let steps = vec![
            arc(FakeStep::new("fails-fast")
                .failing()
                .creating(StepLink::Image("gate".into()))),
            arc(FakeStep::new("slow-sibling").delayed(Duration::from_millis(50))),
            arc(FakeStep::new("downstream").requiring(StepLink::Image("gate".into()))),
        ];
        // "downstream" waits on the failing step and is never dispatched; the
        // slow sibling was already running and finishes cleanly.
        let outcome = run_graph(Arc::new(context()), &steps).await;
        assert_eq!(outcome.failures.len(), 1);
        let suite = &outcome.suite.suites[0];
        let slow = suite.test_cases.iter().find(|c| c.name == "slow-sibling").unwrap();
        assert!(slow.failure_output.is_none());
        assert!(slow.skip_message.is_none());
        let skipped = suite.test_cases.iter().find(|c| c.name == "downstream").unwrap();
        assert!(skipped.skip_message.is_some());
    }

    #[tokio::test]
    async fn dependents_of_failed_steps_never_run() {
        let steps = vec![
            arc(FakeStep::new("root").failing().creating(StepLink::Image("root".into()))),
            arc(FakeStep::new("child").requiring(StepLink::Image("root".into()))),
        ];
        let outcome = run_graph(Arc::new(context()), &steps).await;
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.details.len(), 1);
        let suite = &outcome.suite.suites[0];
        let child = suite.test_cases.iter().find(|c| c.name == "child").unwrap();
        assert!(child.skip_message.is_some());
    }

    #[tokio::test]
    async fn steps_run_at_most_once() {
        let steps = vec![
            arc(FakeStep::new("a").creating(StepLink::Image("a".into()))),
            arc(FakeStep::new("b").requiring(StepLink::Image("a".into()))),
            arc(FakeStep::new("c").requiring(StepLink::Image("a".into()))),
        ];
        let outcome = run_graph(Arc::new(context()), &steps).await;
        assert_eq!(outcome.details.len(), 3);
        let mut names: Vec<&str> = outcome.details.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn promotion_steps_run_concurrently_and_aggregate_failures() {
        let steps = vec![
            arc(FakeStep::new("promote-a")),
            arc(FakeStep::new("promote-b").failing()),
        ];
        let (details, failures) = run_promotion_steps(Arc::new(context()), &steps).await;
        assert_eq!(details.len(), 2);
        assert_eq!(failures.len(), 1);
    }
}
