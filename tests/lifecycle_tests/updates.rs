//! Living with a running cluster: scaling, upgrades, status and access

use strata::ErrorKind;
use strata_aws::CloudErrorKind;
use strata_common::kubeconfig::Kubeconfig;
use strata_common::state::ClusterPhase;

use super::helpers::{small_cluster, Harness};

async fn running() -> Harness {
    let h = Harness::new().await;
    h.alice().create_cluster(&small_cluster()).await.unwrap();
    h
}

/// Story: Scaling the node pool updates the cloud and the stored config
#[tokio::test]
async fn story_scale_node_pool() {
    let h = running().await;
    let alice = h.alice();

    let state = alice.scale_node_pool("t1", 2, 6, 4).await.unwrap();

    assert_eq!(state.status.phase, ClusterPhase::Active);
    assert_eq!(state.config.node.desired_size, 4);
    let scaling = h.cloud.node_group_scaling("t1", "t1-nodes").unwrap();
    assert_eq!((scaling.min_size, scaling.max_size, scaling.desired_size), (2, 6, 4));

    let live = alice.status("t1", true).await.unwrap();
    assert_eq!(live.status.nodes_total, 4);
}

/// Story: Bad bounds are rejected before the cluster is locked or touched
#[tokio::test]
async fn story_invalid_scaling_is_rejected() {
    let h = running().await;
    h.cloud.clear_calls();

    let err = h.alice().scale_node_pool("t1", 3, 5, 2).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(h.cloud.calls().is_empty());
    let stored = h.alice().status("t1", false).await.unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Active);
    assert_eq!(stored.config.node.desired_size, 2);
}

/// Story: Upgrading the control plane records the new version
#[tokio::test]
async fn story_upgrade_version() {
    let h = running().await;

    let state = h.alice().upgrade_version("t1", "1.30").await.unwrap();

    assert_eq!(state.config.kubernetes_version, "1.30");
    assert_eq!(h.cloud.cluster_version("t1").as_deref(), Some("1.30"));
}

/// Story: A rejected upgrade leaves the cluster marked Failed, and unlocked
#[tokio::test]
async fn story_failed_upgrade_is_recorded() {
    let h = running().await;
    h.cloud
        .fail_next("eks:UpdateClusterVersion", CloudErrorKind::InvalidParameter);

    let err = h.alice().upgrade_version("t1", "1.30").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderFatal);

    let stored = h.alice().status("t1", false).await.unwrap();
    assert_eq!(stored.status.phase, ClusterPhase::Failed);
    assert!(!stored.status.message.is_empty());
    assert_eq!(stored.config.kubernetes_version, "1.29");
    assert!(h.alice().lock_info("t1").await.unwrap().is_none());

    // The failure is not sticky: the next attempt goes through
    h.alice().upgrade_version("t1", "1.30").await.unwrap();
}

/// Story: Updating an unknown cluster is not found
#[tokio::test]
async fn story_update_unknown_cluster() {
    let h = Harness::new().await;
    let err = h.alice().upgrade_version("t1", "1.30").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Story: Status refresh reads live state without writing it back
#[tokio::test]
async fn story_refreshed_status_is_read_only() {
    let h = running().await;
    let alice = h.alice();
    let stored = alice.status("t1", false).await.unwrap();

    let live = alice.status("t1", true).await.unwrap();

    assert_eq!(live.status.phase, ClusterPhase::Active);
    assert_eq!(live.status.endpoint, stored.status.endpoint);
    assert_eq!(live.status.nodes_ready, 2);
    assert_eq!(alice.status("t1", false).await.unwrap(), stored);
}

/// Story: An operator exports a kubeconfig and merges it into their own
#[tokio::test]
async fn story_export_kubeconfig() {
    let h = running().await;
    let alice = h.alice();
    let endpoint = alice.status("t1", false).await.unwrap().status.endpoint.unwrap();
    let primary = h.dir.path().join("home").join(".kube").join("config");

    let path = alice.export_kubeconfig("t1", Some(&primary)).await.unwrap();

    assert_eq!(path, h.dir.path().join("kubeconfigs").join("t1.yaml"));
    let written = Kubeconfig::from_yaml(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let context = written.current_context.clone().unwrap();
    assert!(context.ends_with(":cluster/t1"), "{}", context);
    assert_eq!(written.server(&context), Some(endpoint.as_str()));

    let merged = Kubeconfig::from_yaml(&std::fs::read_to_string(&primary).unwrap()).unwrap();
    assert_eq!(merged.current_context, Some(context));
}
