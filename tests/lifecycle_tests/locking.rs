//! Two operators contending for one cluster
//!
//! Locks never wait: whoever arrives second is told who holds the lock and
//! for what, and tries again later.

use strata::ErrorKind;

use super::helpers::{small_cluster, Harness, ALICE, BOB};

/// Story: The second lock on a name fails until the first is released
#[tokio::test]
async fn story_lock_is_exclusive_until_released() {
    let h = Harness::new().await;
    let alice = h.backend(ALICE);
    let bob = h.backend(BOB);

    let held = alice.lock("t1", "create").await.unwrap();

    let err = bob.lock("t1", "create").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains(ALICE), "{}", err);

    alice.unlock(&held).await.unwrap();
    let third = bob.lock("t1", "update").await.unwrap();

    let info = bob.lock_info("t1").await.unwrap().unwrap();
    assert_eq!(info.who, BOB);
    assert_eq!(info.operation, "update");
    assert_eq!(info.id, third.owner_token());
}

/// Story: Locking is per cluster name
#[tokio::test]
async fn story_different_clusters_do_not_contend() {
    let h = Harness::new().await;
    let _a = h.backend(ALICE).lock("t1", "create").await.unwrap();
    let _b = h.backend(BOB).lock("t2", "create").await.unwrap();
    assert_eq!(h.locks.record_count("strata-locks"), 2);
}

/// Story: A stale handle cannot release someone else's lock
///
/// Bob force-unlocks a lock Alice abandoned and takes it himself. When
/// Alice's process comes back and releases its old handle, Bob keeps his lock.
#[tokio::test]
async fn story_stale_handle_does_not_release_a_new_holder() {
    let h = Harness::new().await;
    let alice = h.backend(ALICE);
    let bob = h.backend(BOB);

    let stale = alice.lock("t1", "create").await.unwrap();
    bob.force_unlock("t1").await.unwrap();
    let _mine = bob.lock("t1", "destroy").await.unwrap();

    let _ = alice.unlock(&stale).await;

    let info = bob.lock_info("t1").await.unwrap().unwrap();
    assert_eq!(info.who, BOB);
    assert_eq!(info.operation, "destroy");
}

/// Story: A workflow that finds the cluster locked does nothing
///
/// Bob is mid-destroy; Alice's create is refused before any cloud call, and
/// once Bob is done she can proceed.
#[tokio::test]
async fn story_workflow_refused_while_locked() {
    let h = Harness::new().await;
    let bob = h.backend(BOB);
    let held = bob.lock("t1", "destroy").await.unwrap();

    let err = h.alice().create_cluster(&small_cluster()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(h.cloud.calls().is_empty());

    // The refused workflow must not have released Bob's lock
    assert_eq!(bob.lock_info("t1").await.unwrap().unwrap().who, BOB);

    bob.unlock(&held).await.unwrap();
    h.alice().create_cluster(&small_cluster()).await.unwrap();
}

/// Story: An operator recovers from a crashed process with force-unlock
#[tokio::test]
async fn story_force_unlock_recovers_from_a_crash() {
    let h = Harness::new().await;
    let crashed = h.backend(BOB).lock("t1", "create").await.unwrap();
    drop(crashed);

    let alice = h.alice();
    let info = alice.lock_info("t1").await.unwrap().unwrap();
    assert_eq!(info.who, BOB);

    alice.force_unlock("t1").await.unwrap();
    assert!(alice.lock_info("t1").await.unwrap().is_none());
    alice.create_cluster(&small_cluster()).await.unwrap();
}
