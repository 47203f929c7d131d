//! End-to-end step graph execution against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use conveyor_core::censor::DynamicCensor;
use conveyor_core::cluster::MemoryClusterClient;
use conveyor_core::config::{
    ImageBuildConfiguration, PromotionConfiguration, PromotionTarget, ReleaseBuildConfiguration,
    TestConfiguration,
};
use conveyor_core::execute::{run_graph, run_promotion_steps};
use conveyor_core::graph::{StepGraphDetails, build_partial_graph, topological_sort};
use conveyor_core::inputs::{ENCODED_HASH_LEN, NAME_ALPHABET, input_hash};
use conveyor_core::jobspec::JobSpec;
use conveyor_core::steps::{ExecutionContext, steps_from_config};

fn fixture_config() -> ReleaseBuildConfiguration {
    ReleaseBuildConfiguration {
        images: vec![
            ImageBuildConfiguration {
                to: "base".into(),
                from: Some("src".into()),
                dockerfile_path: None,
            },
            ImageBuildConfiguration {
                to: "component".into(),
                from: Some("base".into()),
                dockerfile_path: None,
            },
        ],
        tests: vec![
            TestConfiguration {
                as_name: "unit".into(),
                commands: Some("make test".into()),
                from: Some("component".into()),
                ..TestConfiguration::default()
            },
            TestConfiguration {
                as_name: "lint".into(),
                commands: Some("make lint".into()),
                from: Some("src".into()),
                ..TestConfiguration::default()
            },
        ],
        promotion: Some(PromotionConfiguration {
            to: vec![PromotionTarget {
                namespace: "release".into(),
                name: "4.17".into(),
                tag: None,
            }],
            additional_images: BTreeMap::new(),
        }),
        ..ReleaseBuildConfiguration::default()
    }
}

fn context() -> Arc<ExecutionContext> {
    Arc::new(ExecutionContext {
        cancel: CancellationToken::new(),
        cluster: Arc::new(MemoryClusterClient::new()),
        namespace: "ci-op-test".to_string(),
        lease_client: None,
        poll_interval: Duration::from_millis(1),
        labels: BTreeMap::new(),
    })
}

#[tokio::test]
async fn full_graph_executes_and_reports() {
    let config = fixture_config();
    config.validate().unwrap();
    let set = steps_from_config(&config, &JobSpec::default(), true, false, false);

    let selected = build_partial_graph(&set.steps, &["unit".to_string()]).unwrap();
    let ordered = topological_sort(&selected).unwrap();
    let names: Vec<&str> = ordered.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["src", "base", "component", "unit"]);

    let outcome = run_graph(context(), &ordered).await;
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.details.len(), 4);

    let mut graph_details = StepGraphDetails::from_ordered(&ordered);
    graph_details.merge_from(&outcome.details);
    let unit = graph_details.steps.iter().find(|s| s.name == "unit").unwrap();
    assert_eq!(unit.failed, Some(false));
    assert_eq!(unit.dependencies, vec!["component".to_string()]);

    let mut suite = outcome.suite;
    let censor = DynamicCensor::new();
    let xml = String::from_utf8(suite.serialize(&censor).unwrap()).unwrap();
    assert!(xml.contains("testcase name=\"unit\""), "{xml}");

    let (promotion_details, promotion_failures) =
        run_promotion_steps(context(), &set.promotion_steps).await;
    assert!(promotion_failures.is_empty());
    assert_eq!(promotion_details.len(), 1);
}

#[tokio::test]
async fn repeated_runs_produce_identical_ordering_and_hash() {
    let config = fixture_config();
    let serialized = serde_yaml::to_string(&config).unwrap();

    let mut orderings = Vec::new();
    let mut hashes = Vec::new();
    for _ in 0..3 {
        let set = steps_from_config(&config, &JobSpec::default(), false, false, false);
        let ordered = topological_sort(&set.steps).unwrap();
        orderings.push(
            ordered.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
        );

        let mut inputs = vec![serialized.clone()];
        for step in &set.steps {
            inputs.extend(step.inputs().unwrap());
        }
        hashes.push(input_hash(&inputs));
    }
    assert!(orderings.windows(2).all(|w| w[0] == w[1]));
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(hashes[0].len(), ENCODED_HASH_LEN);
    assert!(hashes[0].chars().all(|c| NAME_ALPHABET.contains(c)));
}

#[tokio::test]
async fn missing_target_fails_graph_construction() {
    let config = fixture_config();
    let set = steps_from_config(&config, &JobSpec::default(), false, false, false);
    let err = build_partial_graph(&set.steps, &["does-not-exist".to_string()]).unwrap_err();
    assert!(err.to_string().contains("does-not-exist"));
}
