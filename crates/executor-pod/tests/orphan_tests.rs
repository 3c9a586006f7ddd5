mod common;

use common::{fast_config, FakeCluster};
use executor_core::{spawn_background, ExecutionId, LiveExecutions};
use executor_pod::metrics::{LAST_ORPHAN_SWEEP, ORPHANS_DELETED};
use executor_pod::naming::{
    pod_name, EXECUTION_ID_ANNOTATION, MANAGED_BY_LABEL,
};
use executor_pod::{AgentMetrics, MetricsPersistence, OrphanReconciler};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn managed_pod(execution: &str, agent_label: &str) -> Pod {
    let id = ExecutionId::from(execution);
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), agent_label.to_string());
    let mut annotations = BTreeMap::new();
    annotations.insert(EXECUTION_ID_ANNOTATION.to_string(), execution.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(&id)),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_deletes_exactly_the_orphans_across_sweeps() {
    let cluster = FakeCluster::new();
    cluster.insert_pod(managed_pod("live-1", "script-agent"));
    cluster.insert_pod(managed_pod("orphan-1", "script-agent"));
    cluster.insert_pod(managed_pod("orphan-2", "script-agent"));
    cluster.insert_pod(managed_pod("someone-else", "other-agent"));

    let live = LiveExecutions::new();
    live.insert(ExecutionId::from("live-1"));
    let reconciler = OrphanReconciler::new(cluster.clone(), Arc::new(live.clone()), &fast_config());

    let first = reconciler.sweep().await.unwrap();
    let mut deleted = first.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["script-orphan-1", "script-orphan-2"]);
    assert_eq!(first.live, 1);

    let second = reconciler.sweep().await.unwrap();
    assert!(second.deleted.is_empty());
    assert_eq!(second.live, 1);

    live.remove(&ExecutionId::from("live-1"));
    let third = reconciler.sweep().await.unwrap();
    assert_eq!(third.deleted, vec!["script-live-1"]);

    assert_eq!(cluster.pod_names(), vec!["script-someone-else"]);
}

#[tokio::test]
async fn test_failed_deletions_are_retried_next_sweep() {
    let cluster = FakeCluster::new();
    cluster.insert_pod(managed_pod("orphan", "script-agent"));
    let reconciler = OrphanReconciler::new(
        cluster.clone(),
        Arc::new(LiveExecutions::new()),
        &fast_config(),
    );

    cluster.fail_deletes(true);
    let first = reconciler.sweep().await.unwrap();
    assert!(first.deleted.is_empty());
    assert_eq!(first.failed, vec!["script-orphan"]);

    cluster.fail_deletes(false);
    let second = reconciler.sweep().await.unwrap();
    assert_eq!(second.deleted, vec!["script-orphan"]);
}

#[tokio::test]
async fn test_unannotated_pods_with_our_label_are_orphans() {
    let cluster = FakeCluster::new();
    let mut pod = managed_pod("mystery", "script-agent");
    pod.metadata.annotations = None;
    cluster.insert_pod(pod);

    let reconciler = OrphanReconciler::new(
        cluster.clone(),
        Arc::new(LiveExecutions::new()),
        &fast_config(),
    );
    assert_eq!(reconciler.sweep().await.unwrap().deleted, vec!["script-mystery"]);
}

#[tokio::test]
async fn test_background_sweeps_record_metrics() {
    let cluster = FakeCluster::new();
    cluster.insert_pod(managed_pod("orphan-a", "script-agent"));
    cluster.insert_pod(managed_pod("orphan-b", "script-agent"));

    let store = Arc::new(MetricsPersistence::new(cluster.clone(), "script-agent-metrics", 5));
    let metrics = Arc::new(AgentMetrics::new(Arc::clone(&store)));
    let reconciler = Arc::new(
        OrphanReconciler::new(cluster.clone(), Arc::new(LiveExecutions::new()), &fast_config())
            .with_metrics(Arc::clone(&metrics))
            .with_interval(Duration::from_millis(20)),
    );

    let cancel = CancellationToken::new();
    let task = spawn_background(reconciler, cancel.clone());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cluster.config_map_data("script-agent-metrics").contains_key(LAST_ORPHAN_SWEEP) {
        assert!(tokio::time::Instant::now() < deadline, "no sweep recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    task.await.unwrap();

    assert!(cluster.pod_names().is_empty());
    assert_eq!(metrics.counter(ORPHANS_DELETED).await.unwrap(), 2);
    assert!(metrics.last_orphan_sweep().await.unwrap().is_some());
}
