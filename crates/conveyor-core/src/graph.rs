//! Step graph construction and ordering.
//!
//! The full step set is narrowed to the minimum vertex-induced subgraph that
//! transitively satisfies the requested targets, then ordered with Kahn's
//! algorithm. Ties are broken by ascending step name, so the order is
//! deterministic and logs are reproducible.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::steps::{Step, StepLink, has_any_link};

/// Error building or ordering the graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A requested target matched no step name or created image.
    #[error("unresolved target: no step or image named {0:?}")]
    UnresolvedTarget(String),

    /// The selected subgraph contains a cycle.
    #[error("cyclic graph: could not order steps {0:?}")]
    CyclicGraph(Vec<String>),
}

/// Steps in a valid topological order.
pub type OrderedStepList = Vec<Arc<dyn Step>>;

/// Computes the partial graph: the subset of `steps` transitively required
/// to satisfy `targets`.
///
/// A step is seeded when its name equals a target or one of its creations is
/// the named target image; the set then expands to every step whose
/// creations satisfy a requirement of an included step, to a fixed point.
pub fn build_partial_graph(
    steps: &[Arc<dyn Step>],
    targets: &[String],
) -> Result<Vec<Arc<dyn Step>>, GraphError> {
    if targets.is_empty() {
        return Ok(steps.to_vec());
    }

    let mut included: BTreeSet<usize> = BTreeSet::new();
    for target in targets {
        let target_link = StepLink::Image(target.clone());
        let mut matched = false;
        for (idx, step) in steps.iter().enumerate() {
            if step.name() == target || step.creates().contains(&target_link) {
                included.insert(idx);
                matched = true;
            }
        }
        if !matched {
            return Err(GraphError::UnresolvedTarget(target.clone()));
        }
    }

    // Expand to a fixed point: pull in every step that creates something an
    // included step requires.
    loop {
        let mut added = false;
        let requirements: Vec<StepLink> = included
            .iter()
            .flat_map(|idx| steps[*idx].requires())
            .collect();
        for (idx, step) in steps.iter().enumerate() {
            if included.contains(&idx) {
                continue;
            }
            if has_any_link(&requirements, &step.creates()) {
                included.insert(idx);
                added = true;
            }
        }
        if !added {
            break;
        }
    }

    Ok(included.iter().map(|idx| steps[*idx].clone()).collect())
}

/// Orders `steps` topologically with Kahn's algorithm, breaking ties by
/// ascending step name.
pub fn topological_sort(steps: &[Arc<dyn Step>]) -> Result<OrderedStepList, GraphError> {
    let creates: Vec<Vec<StepLink>> = steps.iter().map(|s| s.creates()).collect();
    let requires: Vec<Vec<StepLink>> = steps.iter().map(|s| s.requires()).collect();

    // Edge from creator to consumer; nodes first, edges second.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut indegree: Vec<usize> = vec![0; steps.len()];
    for (consumer, reqs) in requires.iter().enumerate() {
        for (creator, outs) in creates.iter().enumerate() {
            if creator == consumer {
                continue;
            }
            if has_any_link(reqs, outs) {
                dependents[creator].push(consumer);
                indegree[consumer] += 1;
            }
        }
    }

    // The ready set is keyed by name, so ties pop in ascending name order.
    let mut ready: BTreeMap<(String, usize), usize> = BTreeMap::new();
    for (idx, degree) in indegree.iter().enumerate() {
        if *degree == 0 {
            ready.insert((steps[idx].name().to_string(), idx), idx);
        }
    }

    let mut ordered = Vec::with_capacity(steps.len());
    while let Some((_, idx)) = ready.pop_first() {
        ordered.push(steps[idx].clone());
        for &dependent in &dependents[idx] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert((steps[dependent].name().to_string(), dependent), dependent);
            }
        }
    }

    if ordered.len() != steps.len() {
        let mut remaining: Vec<String> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(idx, _)| steps[idx].name().to_string())
            .collect();
        remaining.sort();
        return Err(GraphError::CyclicGraph(remaining));
    }
    Ok(ordered)
}

/// Writes the graph in the `child parent` edge format consumed by the
/// digraph utility. Only the prefix of the topological order can satisfy a
/// step's requirements, so edges are found by scanning it.
pub fn print_digraph<W: std::io::Write>(
    out: &mut W,
    ordered: &[Arc<dyn Step>],
) -> std::io::Result<()> {
    for (idx, step) in ordered.iter().enumerate() {
        let requires = step.requires();
        for other in &ordered[..idx] {
            if has_any_link(&requires, &other.creates()) {
                writeln!(out, "{} {}", step.name(), other.name())?;
            }
        }
    }
    Ok(())
}

/// Timing and outcome detail for one executed step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepDetails {
    /// Step name.
    pub name: String,
    /// Step description.
    pub description: String,
    /// Names of the steps this step depended on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// When execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Whether the step failed. Absent when the step never ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<bool>,
}

/// The serialized step-graph artifact: one record per step in topological
/// order, merged with execution detail as steps finish.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepGraphDetails {
    /// Per-step records.
    pub steps: Vec<StepDetails>,
}

impl StepGraphDetails {
    /// Builds the skeleton record set from an ordered step list, resolving
    /// dependency names over the topological prefix.
    #[must_use]
    pub fn from_ordered(ordered: &[Arc<dyn Step>]) -> Self {
        let mut steps = Vec::with_capacity(ordered.len());
        for (idx, step) in ordered.iter().enumerate() {
            let requires = step.requires();
            let dependencies: Vec<String> = ordered[..idx]
                .iter()
                .filter(|other| has_any_link(&requires, &other.creates()))
                .map(|other| other.name().to_string())
                .collect();
            steps.push(StepDetails {
                name: step.name().to_string(),
                description: step.description(),
                dependencies,
                ..StepDetails::default()
            });
        }
        Self { steps }
    }

    /// Merges execution detail into the matching records.
    pub fn merge_from(&mut self, details: &[StepDetails]) {
        for detail in details {
            match self.steps.iter_mut().find(|s| s.name == detail.name) {
                Some(existing) => {
                    let dependencies = std::mem::take(&mut existing.dependencies);
                    *existing = detail.clone();
                    existing.dependencies = dependencies;
                }
                None => self.steps.push(detail.clone()),
            }
        }
    }
}

/// Records timing for a step execution, for the step-graph artifact.
#[must_use]
pub fn detail_for(
    step: &dyn Step,
    started_at: DateTime<Utc>,
    duration: Duration,
    failed: bool,
) -> StepDetails {
    StepDetails {
        name: step.name().to_string(),
        description: step.description(),
        dependencies: Vec::new(),
        started_at: Some(started_at),
        finished_at: Some(started_at + chrono::Duration::from_std(duration).unwrap_or_default()),
        duration_ms: Some(duration.as_millis() as u64),
        failed: Some(failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testutil::FakeStep;

    fn arc(step: FakeStep) -> Arc<dyn Step> {
        Arc::new(step)
    }

    fn diamond() -> Vec<Arc<dyn Step>> {
        vec![
            arc(FakeStep::new("src").creating(StepLink::Image("src".into()))),
            arc(FakeStep::new("left")
                .requiring(StepLink::Image("src".into()))
                .creating(StepLink::Image("left".into()))),
            arc(FakeStep::new("right")
                .requiring(StepLink::Image("src".into()))
                .creating(StepLink::Image("right".into()))),
            arc(FakeStep::new("join")
                .requiring(StepLink::Image("left".into()))
                .requiring(StepLink::Image("right".into()))),
        ]
    }

    #[test]
    fn sort_is_deterministic_with_name_ties() {
        let ordered = topological_sort(&diamond()).unwrap();
        let names: Vec<&str> = ordered.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["src", "left", "right", "join"]);

        // Repeat runs produce the identical sequence.
        for _ in 0..10 {
            let again = topological_sort(&diamond()).unwrap();
            let again: Vec<&str> = again.iter().map(|s| s.name()).collect();
            assert_eq!(again, names);
        }
    }

    #[test]
    fn roots_order_by_name() {
        let steps = vec![
            arc(FakeStep::new("zeta")),
            arc(FakeStep::new("alpha")),
            arc(FakeStep::new("mike")),
        ];
        let ordered = topological_sort(&steps).unwrap();
        let names: Vec<&str> = ordered.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["alpha", "mike", "zeta"]);
    }

    #[test]
    fn detects_cycles() {
        let steps = vec![
            arc(FakeStep::new("a")
                .requiring(StepLink::Image("b".into()))
                .creating(StepLink::Image("a".into()))),
            arc(FakeStep::new("b")
                .requiring(StepLink::Image("a".into()))
                .creating(StepLink::Image("b".into()))),
        ];
        match topological_sort(&steps) {
            Err(GraphError::CyclicGraph(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn partial_graph_selects_transitive_closure() {
        let steps = diamond();
        let selected = build_partial_graph(&steps, &["left".to_string()]).unwrap();
        let names: Vec<&str> = selected.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["src", "left"]);
    }

    #[test]
    fn partial_graph_seeds_by_created_image() {
        let steps = vec![
            arc(FakeStep::new("builder").creating(StepLink::Image("component".into()))),
            arc(FakeStep::new("unrelated")),
        ];
        let selected = build_partial_graph(&steps, &["component".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), "builder");
    }

    #[test]
    fn unknown_target_is_an_error() {
        let err = build_partial_graph(&diamond(), &["does-not-exist".to_string()]).unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedTarget(_)));
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[test]
    fn empty_targets_select_everything() {
        let selected = build_partial_graph(&diamond(), &[]).unwrap();
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn digraph_lists_edges_child_first() {
        let ordered = topological_sort(&diamond()).unwrap();
        let mut out = Vec::new();
        print_digraph(&mut out, &ordered).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("left src"), "{text}");
        assert!(text.contains("join left"), "{text}");
        assert!(text.contains("join right"), "{text}");
    }

    #[test]
    fn graph_details_resolve_dependency_names() {
        let ordered = topological_sort(&diamond()).unwrap();
        let details = StepGraphDetails::from_ordered(&ordered);
        let join = details.steps.iter().find(|s| s.name == "join").unwrap();
        assert_eq!(join.dependencies, vec!["left".to_string(), "right".to_string()]);
    }

    #[test]
    fn merge_preserves_dependencies() {
        let ordered = topological_sort(&diamond()).unwrap();
        let mut details = StepGraphDetails::from_ordered(&ordered);
        details.merge_from(&[StepDetails {
            name: "join".into(),
            description: "fake step join".into(),
            failed: Some(false),
            ..StepDetails::default()
        }]);
        let join = details.steps.iter().find(|s| s.name == "join").unwrap();
        assert_eq!(join.failed, Some(false));
        assert_eq!(join.dependencies.len(), 2);
    }
}
