//! Node RPC flows that do not require a kernel NBD device.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use subprovisioner::subprovisioner::csi::types::*;
use subprovisioner::subprovisioner::node::NodeService;

use crate::support::{FakeCluster, PvcSeed};

const DOMAIN: &str = "subprovisioner.gitlab.io";

fn service(cluster: &FakeCluster) -> NodeService {
    NodeService::new(
        Arc::new(cluster.client()),
        "node-a".to_string(),
        "subprovisioner:latest".to_string(),
    )
}

fn staging_worker_labels(uid: &str) -> HashMap<String, String> {
    HashMap::from([
        (format!("{}/component", DOMAIN), "volume-staging".to_string()),
        (format!("{}/node-name", DOMAIN), "node-a".to_string()),
        (format!("{}/pvc-uid", DOMAIN), uid.to_string()),
    ])
}

#[tokio::test]
async fn unstaging_deletes_the_worker_and_reduces_the_staged_set() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "data", "u-1")
            .label(&format!("{}/uid", DOMAIN), "u-1")
            .annotation(&format!("{}/state", DOMAIN), "staged")
            .annotation(&format!("{}/staged-on-nodes", DOMAIN), "node-a"),
    );
    cluster.seed_replica_set("storage", "worker", staging_worker_labels("u-1"));

    let dir = tempfile::tempdir().unwrap();
    let staging_path = dir.path().join("staging");
    fs::write(&staging_path, b"block node stand-in").unwrap();

    service(&cluster)
        .unstage_volume(NodeUnstageVolumeRequest {
            volume_id: "u-1".to_string(),
            staging_target_path: staging_path.to_str().unwrap().to_string(),
        })
        .await
        .unwrap();

    assert!(cluster.replica_set("storage", "worker").is_none());
    assert!(!staging_path.exists());

    let pvc = cluster.pvc("default", "data");
    assert_eq!(
        pvc["metadata"]["annotations"][format!("{}/state", DOMAIN)].as_str(),
        Some("idle")
    );
    assert!(pvc["metadata"]["annotations"][format!("{}/staged-on-nodes", DOMAIN)].is_null());
}

#[tokio::test]
async fn unstaging_without_a_worker_is_idempotent() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "data", "u-1")
            .label(&format!("{}/uid", DOMAIN), "u-1")
            .annotation(&format!("{}/state", DOMAIN), "idle"),
    );

    let dir = tempfile::tempdir().unwrap();
    let staging_path = dir.path().join("absent");

    service(&cluster)
        .unstage_volume(NodeUnstageVolumeRequest {
            volume_id: "u-1".to_string(),
            staging_target_path: staging_path.to_str().unwrap().to_string(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn publishing_links_the_target_and_readonly_clears_write_bits() {
    let cluster = FakeCluster::start().await;
    let node = service(&cluster);

    let dir = tempfile::tempdir().unwrap();
    let staging_path = dir.path().join("staging");
    fs::write(&staging_path, b"block node stand-in").unwrap();
    let target_path = dir.path().join("publish");

    node.publish_volume(NodePublishVolumeRequest {
        volume_id: "u-1".to_string(),
        staging_target_path: staging_path.to_str().unwrap().to_string(),
        target_path: target_path.to_str().unwrap().to_string(),
        readonly: true,
        volume_capability: None,
    })
    .await
    .unwrap();

    let link = fs::read_link(&target_path).unwrap();
    assert_eq!(link, staging_path);
    // Mode change follows the link to the staging file.
    let mode = fs::metadata(&target_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o222, 0);

    node.unpublish_volume(NodeUnpublishVolumeRequest {
        volume_id: "u-1".to_string(),
        target_path: target_path.to_str().unwrap().to_string(),
    })
    .await
    .unwrap();
    assert!(fs::symlink_metadata(&target_path).is_err());
}

#[tokio::test]
async fn publishing_replaces_a_pre_created_directory() {
    let cluster = FakeCluster::start().await;
    let node = service(&cluster);

    let dir = tempfile::tempdir().unwrap();
    let staging_path = dir.path().join("staging");
    fs::write(&staging_path, b"block node stand-in").unwrap();
    let target_path = dir.path().join("publish");
    fs::create_dir(&target_path).unwrap();

    node.publish_volume(NodePublishVolumeRequest {
        volume_id: "u-1".to_string(),
        staging_target_path: staging_path.to_str().unwrap().to_string(),
        target_path: target_path.to_str().unwrap().to_string(),
        readonly: false,
        volume_capability: None,
    })
    .await
    .unwrap();

    assert_eq!(fs::read_link(&target_path).unwrap(), staging_path);
}
