//! Exercises the volume state machine against the fake API server.

use subprovisioner::subprovisioner::util::error::{rpc_code, RpcCode};
use subprovisioner::subprovisioner::volume::claims::{
    set_state_to, stage_on_node, unstage_from_node,
};
use subprovisioner::subprovisioner::volume::VolumeState;

use crate::support::{FakeCluster, PvcSeed};

const STATE: &str = "subprovisioner.gitlab.io/state";
const STAGED_ON: &str = "subprovisioner.gitlab.io/staged-on-nodes";

fn annotation(cluster: &FakeCluster, name: &str, key: &str) -> Option<String> {
    cluster.pvc("default", name)["metadata"]["annotations"][key]
        .as_str()
        .map(String::from)
}

#[tokio::test]
async fn staging_tracks_per_node_multiplicity() {
    let cluster = FakeCluster::start().await;
    let client = cluster.client();

    cluster.seed_pvc(PvcSeed::new("default", "data", "u-1").annotation(STATE, "idle"));

    stage_on_node(&client, "data", "default", "node-a")
        .await
        .unwrap();
    assert_eq!(annotation(&cluster, "data", STATE).as_deref(), Some("staged"));
    assert_eq!(
        annotation(&cluster, "data", STAGED_ON).as_deref(),
        Some("node-a")
    );

    stage_on_node(&client, "data", "default", "node-b")
        .await
        .unwrap();
    assert_eq!(
        annotation(&cluster, "data", STAGED_ON).as_deref(),
        Some("node-a,node-b")
    );

    // Re-staging an already staged node changes nothing.
    stage_on_node(&client, "data", "default", "node-a")
        .await
        .unwrap();
    assert_eq!(
        annotation(&cluster, "data", STAGED_ON).as_deref(),
        Some("node-a,node-b")
    );

    unstage_from_node(&client, "data", "default", "node-a")
        .await
        .unwrap();
    assert_eq!(annotation(&cluster, "data", STATE).as_deref(), Some("staged"));
    assert_eq!(
        annotation(&cluster, "data", STAGED_ON).as_deref(),
        Some("node-b")
    );

    unstage_from_node(&client, "data", "default", "node-b")
        .await
        .unwrap();
    assert_eq!(annotation(&cluster, "data", STATE).as_deref(), Some("idle"));
    assert_eq!(annotation(&cluster, "data", STAGED_ON), None);
}

#[tokio::test]
async fn busy_volumes_reject_conflicting_operations() {
    let cluster = FakeCluster::start().await;
    let client = cluster.client();

    cluster.seed_pvc(PvcSeed::new("default", "data", "u-1").annotation(STATE, "cloning"));

    let err = set_state_to(&client, "data", "default", VolumeState::Expanding)
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::FailedPrecondition));
    assert!(err.to_string().contains("cloned"));

    let err = stage_on_node(&client, "data", "default", "node-a")
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::FailedPrecondition));

    // Requesting the state the volume is already in is a no-op success.
    set_state_to(&client, "data", "default", VolumeState::Cloning)
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_states_reject_all_transitions() {
    let cluster = FakeCluster::start().await;
    let client = cluster.client();

    cluster.seed_pvc(PvcSeed::new("default", "data", "u-1").annotation(STATE, "defragmenting"));

    let err = set_state_to(&client, "data", "default", VolumeState::Expanding)
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::FailedPrecondition));
    assert!(err.to_string().contains("unknown state"));
}

#[tokio::test]
async fn deleted_volumes_reject_new_operations_but_allow_unstaging() {
    let cluster = FakeCluster::start().await;
    let client = cluster.client();

    cluster.seed_pvc(
        PvcSeed::new("default", "doomed", "u-2")
            .annotation(STATE, "staged")
            .annotation(STAGED_ON, "node-a")
            .deleted(),
    );

    let err = set_state_to(&client, "doomed", "default", VolumeState::Snapshotting)
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::FailedPrecondition));
    assert!(err.to_string().contains("deleted"));

    let err = stage_on_node(&client, "doomed", "default", "node-b")
        .await
        .unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::FailedPrecondition));

    // The unstage reduction path stays open so deletion can make progress.
    unstage_from_node(&client, "doomed", "default", "node-a")
        .await
        .unwrap();
    assert_eq!(
        annotation(&cluster, "doomed", STATE).as_deref(),
        Some("idle")
    );
}

#[tokio::test]
async fn transitions_retry_through_update_conflicts() {
    let cluster = FakeCluster::start().await;
    let client = cluster.client();

    cluster.seed_pvc(PvcSeed::new("default", "data", "u-1").annotation(STATE, "idle"));
    cluster.inject_update_conflicts(2);

    set_state_to(&client, "data", "default", VolumeState::Snapshotting)
        .await
        .unwrap();
    assert_eq!(
        annotation(&cluster, "data", STATE).as_deref(),
        Some("snapshotting")
    );
}
