//! Standing clusters up and tearing them down
//!
//! These stories follow an operator through the two workflows that touch
//! every resource layer, including what happens when a create dies halfway.

use strata::ErrorKind;
use strata_aws::{AwsResources, CloudErrorKind};
use strata_common::state::ClusterPhase;

use super::helpers::{small_cluster, Harness, ALICE};

// =============================================================================
// Create
// =============================================================================

/// Story: An operator creates a two-zone cluster against a fresh backend
///
/// The state becomes Active, records the node pool's desired count, and lays
/// out one public and one private subnet per zone.
#[tokio::test]
async fn story_create_records_an_active_two_zone_cluster() {
    let h = Harness::new().await;
    let alice = h.alice();

    let state = alice.create_cluster(&small_cluster()).await.unwrap();

    assert_eq!(state.status.phase, ClusterPhase::Active);
    assert!(state.status.ready);
    assert_eq!(state.status.nodes_total, 2);
    assert_eq!(state.config.node.desired_size, 2);

    let graph = AwsResources::from_value(&state.resources["aws"]).unwrap();
    assert_eq!(graph.networking.public_subnets.len(), 2);
    assert_eq!(graph.networking.private_subnets.len(), 2);
    assert_eq!(graph.cluster.node_groups[0].scaling.desired_size, 2);

    // What was returned is exactly what a later reader sees
    assert_eq!(alice.status("t1", false).await.unwrap(), state);
    assert_eq!(alice.list().await.unwrap(), vec!["t1"]);
    assert_eq!(
        h.cloud.node_group_scaling("t1", "t1-nodes").map(|s| s.desired_size),
        Some(2)
    );
    assert!(alice.lock_info("t1").await.unwrap().is_none());
}

/// Story: A second create for the same name is refused before any cloud call
#[tokio::test]
async fn story_second_create_is_refused() {
    let h = Harness::new().await;
    let alice = h.alice();
    alice.create_cluster(&small_cluster()).await.unwrap();
    h.cloud.clear_calls();

    let err = alice.create_cluster(&small_cluster()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(h.cloud.calls().is_empty());
}

/// Story: A single-zone cluster is refused before anything is created
#[tokio::test]
async fn story_single_zone_cluster_is_refused_up_front() {
    let h = Harness::new().await;
    let mut config = small_cluster();
    config.network.az_count = 1;

    let err = h.alice().create_cluster(&config).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(h.cloud.calls().is_empty());
    assert_eq!(h.cloud.live_resource_count(), 0);
    assert!(h.alice().list().await.unwrap().is_empty());
}

/// Story: A create that dies at the node pool leaves a graph to reclaim
///
/// Nothing is saved, the error carries every resource created so far, and
/// handing that graph to a partial destroy leaves the account empty.
#[tokio::test]
async fn story_failed_create_is_reclaimed_from_its_partial_graph() {
    let h = Harness::new().await;
    let alice = h.alice();
    let config = small_cluster();
    h.cloud.fail_next("eks:CreateNodegroup", CloudErrorKind::LimitExceeded);

    let err = alice.create_cluster(&config).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProviderFatal);
    assert!(err.to_string().contains("run destroy against 't1'"));
    assert!(alice.list().await.unwrap().is_empty());
    assert!(h.cloud.live_resource_count() > 0);

    let partial = err.partial_resources().unwrap().clone();
    let graph = AwsResources::from_value(&partial).unwrap();
    assert!(graph.cluster.control_plane.is_some());
    assert!(graph.cluster.node_groups.is_empty());

    let report = alice.destroy_partial(&config, &partial).await.unwrap();
    assert!(report.is_clean(), "leftovers: {:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(h.cloud.live_resource_count(), 0);
    assert!(alice.lock_info("t1").await.unwrap().is_none());
}

// =============================================================================
// Destroy
// =============================================================================

/// Story: Destroying a name with no state fails without touching anything
///
/// No manager runs and no lock is left behind.
#[tokio::test]
async fn story_destroying_an_unknown_cluster_is_not_found() {
    let h = Harness::new().await;

    let err = h.alice().destroy_cluster("t1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.cloud.calls().is_empty());
    assert!(h.alice().lock_info("t1").await.unwrap().is_none());
    assert_eq!(h.locks.record_count("strata-locks"), 0);
}

/// Story: Destroy removes every resource, in reverse order, and the state
#[tokio::test]
async fn story_destroy_leaves_an_empty_account() {
    let h = Harness::new().await;
    let alice = h.alice();
    alice.create_cluster(&small_cluster()).await.unwrap();

    let report = alice.destroy_cluster("t1").await.unwrap();

    assert!(report.is_clean());
    let order = report.resource_order();
    assert_eq!(&order[..2], ["node-group", "control-plane"]);
    assert_eq!(order.last(), Some(&"role"));
    assert_eq!(h.cloud.live_resource_count(), 0);
    assert!(alice.list().await.unwrap().is_empty());

    // Gone means gone: a second destroy has nothing to work on
    let err = alice.destroy_cluster("t1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Story: Teardown continues past a stuck resource and says what is left
///
/// The failed VPC delete is reported, every other resource is still removed,
/// and the state is deleted so the name can be reused.
#[tokio::test]
async fn story_destroy_reports_leftovers() {
    let h = Harness::new().await;
    let alice = h.alice();
    alice.create_cluster(&small_cluster()).await.unwrap();
    h.cloud.fail_next("ec2:DeleteVpc", CloudErrorKind::DependencyViolation);

    let report = alice.destroy_cluster("t1").await.unwrap();

    let failed: Vec<_> = report.failures().map(|e| e.resource.as_str()).collect();
    assert_eq!(failed, ["vpc"]);
    assert_eq!(h.cloud.live_resource_count(), 1);
    assert!(alice.list().await.unwrap().is_empty());

    let err = report.into_result("t1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
}

/// Story: Any operator can destroy what another created
#[tokio::test]
async fn story_state_is_shared_between_operators() {
    let h = Harness::new().await;
    h.alice().create_cluster(&small_cluster()).await.unwrap();

    let bob = h.operator("bob@host");
    assert_eq!(bob.list().await.unwrap(), vec!["t1"]);
    assert!(bob.destroy_cluster("t1").await.unwrap().is_clean());
    assert!(h.operator(ALICE).list().await.unwrap().is_empty());
}
