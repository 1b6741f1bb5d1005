//! End-to-end controller RPC flows against the fake API server.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use subprovisioner::subprovisioner::controller::ControllerService;
use subprovisioner::subprovisioner::csi::types::*;
use subprovisioner::subprovisioner::util::error::{rpc_code, RpcCode};

use crate::support::{FakeCluster, PvcSeed, SnapshotSeed};

const DOMAIN: &str = "subprovisioner.gitlab.io";
const MIB_128: i64 = 134217728;
const MIB_256: i64 = 268435456;

fn service(cluster: &FakeCluster) -> ControllerService {
    ControllerService::new(
        Arc::new(cluster.client()),
        "subprovisioner:latest".to_string(),
    )
}

fn block_capability() -> VolumeCapability {
    VolumeCapability {
        access_mode: Some(AccessMode::SingleNodeWriter),
        block: Some(BlockVolumeCapability {}),
        mount: None,
    }
}

fn create_request(pvc_name: &str, capacity: i64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: format!("pvc-{}", pvc_name),
        capacity_range: Some(CapacityRange {
            required_bytes: Some(capacity),
            limit_bytes: None,
        }),
        volume_capabilities: vec![block_capability()],
        parameters: HashMap::from([
            (
                "csi.storage.k8s.io/pvc/name".to_string(),
                pvc_name.to_string(),
            ),
            (
                "csi.storage.k8s.io/pvc/namespace".to_string(),
                "default".to_string(),
            ),
            ("backingClaimName".to_string(), "backing".to_string()),
            ("backingClaimNamespace".to_string(), "storage".to_string()),
            ("basePath".to_string(), "vms".to_string()),
        ]),
        volume_content_source: None,
    }
}

fn command_of(job: &Value) -> Vec<String> {
    job.pointer("/spec/template/spec/containers/0/command")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn pvc_annotation(cluster: &FakeCluster, name: &str, key: &str) -> Option<String> {
    cluster.pvc("default", name)["metadata"]["annotations"][format!("{}/{}", DOMAIN, key)]
        .as_str()
        .map(String::from)
}

#[tokio::test]
async fn create_volume_from_nothing_claims_then_runs_the_image_job() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(PvcSeed::new("default", "data", "u-1"));

    let response = service(&cluster)
        .create_volume(create_request("data", MIB_128))
        .await
        .unwrap();

    assert_eq!(response.volume.volume_id, "u-1");
    assert_eq!(response.volume.capacity_bytes, MIB_128);
    assert_eq!(
        response.volume.volume_context.get("backingPvcName").unwrap(),
        "backing"
    );

    let pvc = cluster.pvc("default", "data");
    let finalizers = pvc.pointer("/metadata/finalizers").unwrap();
    assert_eq!(
        finalizers,
        &serde_json::json!([format!("{}/cleanup", DOMAIN)])
    );
    assert_eq!(
        pvc.pointer(&format!("/metadata/labels/{}~1uid", DOMAIN))
            .and_then(Value::as_str),
        Some("u-1")
    );
    assert_eq!(
        pvc_annotation(&cluster, "data", "state").as_deref(),
        Some("idle")
    );
    assert_eq!(
        pvc_annotation(&cluster, "data", "capacity").as_deref(),
        Some("134217728")
    );

    // The creation Job runs in the backing namespace and is retained.
    let job = cluster
        .job("storage", "subprovisioner-create-u-1")
        .expect("creation job exists");
    let command = command_of(&job);
    assert_eq!(command[0], "qemu-img");
    assert!(command.contains(&"/var/backing/pvc-u-1.qcow2".to_string()));
    assert!(command.contains(&MIB_128.to_string()));
    assert_eq!(
        job.pointer("/spec/template/spec/containers/0/volumeMounts/0/subPath")
            .and_then(Value::as_str),
        Some("vms")
    );
}

#[tokio::test]
async fn create_volume_is_idempotent() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(PvcSeed::new("default", "data", "u-1"));

    let controller = service(&cluster);
    let first = controller
        .create_volume(create_request("data", MIB_128))
        .await
        .unwrap();
    let second = controller
        .create_volume(create_request("data", MIB_128))
        .await
        .unwrap();

    assert_eq!(first.volume.volume_id, second.volume.volume_id);
    assert_eq!(
        cluster.job_names("storage"),
        vec!["subprovisioner-create-u-1".to_string()]
    );
}

#[tokio::test]
async fn create_volume_rejects_filesystem_capabilities_and_bad_ranges() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(PvcSeed::new("default", "data", "u-1"));
    let controller = service(&cluster);

    let mut request = create_request("data", MIB_128);
    request.volume_capabilities = vec![VolumeCapability {
        access_mode: Some(AccessMode::SingleNodeWriter),
        block: None,
        mount: Some(MountVolumeCapability::default()),
    }];
    let err = controller.create_volume(request).await.unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::InvalidArgument));

    let mut request = create_request("data", MIB_128);
    request.capacity_range = None;
    let err = controller.create_volume(request).await.unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::InvalidArgument));

    let mut request = create_request("data", MIB_128);
    request.parameters.remove("backingClaimName");
    let err = controller.create_volume(request).await.unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::InvalidArgument));
}

#[tokio::test]
async fn cloning_rebases_both_volumes_onto_a_shared_ancestor() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "src", "src-uid")
            .label(&format!("{}/uid", DOMAIN), "src-uid")
            .annotation(&format!("{}/state", DOMAIN), "idle")
            .annotation(&format!("{}/capacity", DOMAIN), &MIB_256.to_string()),
    );
    cluster.seed_pvc(PvcSeed::new("default", "dst", "dst-uid"));

    let mut request = create_request("dst", MIB_128);
    request.volume_content_source = Some(VolumeContentSource {
        volume: Some(VolumeContentSourceVolume {
            volume_id: "src-uid".to_string(),
        }),
        snapshot: None,
    });

    let response = service(&cluster).create_volume(request).await.unwrap();

    // Clone capacity grows to the source's.
    assert_eq!(response.volume.capacity_bytes, MIB_256);

    // The source went through cloning and is idle again.
    assert_eq!(
        pvc_annotation(&cluster, "src", "state").as_deref(),
        Some("idle")
    );

    let job = cluster
        .job("storage", "subprovisioner-create-dst-uid")
        .expect("cloning job exists");
    let command = command_of(&job);
    assert!(command.contains(&"cloned-src-uid-to-dst-uid.qcow2".to_string()));
    assert!(command.contains(&"/var/backing/pvc-src-uid.qcow2".to_string()));
    assert!(command.contains(&"/var/backing/pvc-dst-uid.qcow2".to_string()));
}

#[tokio::test]
async fn cloning_a_staged_source_fails_with_precondition() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "src", "src-uid")
            .label(&format!("{}/uid", DOMAIN), "src-uid")
            .annotation(&format!("{}/state", DOMAIN), "staged")
            .annotation(&format!("{}/staged-on-nodes", DOMAIN), "node-a")
            .annotation(&format!("{}/capacity", DOMAIN), &MIB_128.to_string()),
    );
    cluster.seed_pvc(PvcSeed::new("default", "dst", "dst-uid"));

    let mut request = create_request("dst", MIB_128);
    request.volume_content_source = Some(VolumeContentSource {
        volume: Some(VolumeContentSourceVolume {
            volume_id: "src-uid".to_string(),
        }),
        snapshot: None,
    });

    let err = service(&cluster).create_volume(request).await.unwrap_err();
    assert_eq!(rpc_code(err.as_ref()), Some(RpcCode::FailedPrecondition));
    assert!(err.to_string().contains("staged"));
}

#[tokio::test]
async fn create_volume_from_snapshot_roots_the_overlay_at_the_snapshot() {
    let cluster = FakeCluster::start().await;
    cluster.seed_snapshot(
        SnapshotSeed::new("default", "snap", "snap-1")
            .label(&format!("{}/uid", DOMAIN), "snap-1")
            .annotation(&format!("{}/size", DOMAIN), &MIB_128.to_string()),
    );
    cluster.seed_pvc(PvcSeed::new("default", "dst", "dst-uid"));

    let mut request = create_request("dst", MIB_256);
    request.volume_content_source = Some(VolumeContentSource {
        volume: None,
        snapshot: Some(VolumeContentSourceSnapshot {
            snapshot_id: "snap-1".to_string(),
        }),
    });

    let response = service(&cluster).create_volume(request).await.unwrap();
    assert_eq!(response.volume.capacity_bytes, MIB_256);

    let job = cluster
        .job("storage", "subprovisioner-create-dst-uid")
        .expect("creation job exists");
    let command = command_of(&job);
    assert!(command.contains(&"snapshot-snap-1.qcow2".to_string()));
    assert!(command.contains(&"/var/backing/pvc-dst-uid.qcow2".to_string()));
}

#[tokio::test]
async fn snapshotting_seals_the_image_and_returns_the_source_to_idle() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "src", "src-uid")
            .label(&format!("{}/uid", DOMAIN), "src-uid")
            .annotation(&format!("{}/state", DOMAIN), "idle")
            .annotation(&format!("{}/capacity", DOMAIN), &MIB_128.to_string())
            .annotation(&format!("{}/backing-pvc-name", DOMAIN), "backing")
            .annotation(&format!("{}/backing-pvc-namespace", DOMAIN), "storage")
            .annotation(&format!("{}/backing-pvc-base-path", DOMAIN), ""),
    );
    cluster.seed_snapshot(SnapshotSeed::new("default", "snap", "snap-1"));

    let request = CreateSnapshotRequest {
        name: "snap".to_string(),
        source_volume_id: "src-uid".to_string(),
        parameters: HashMap::from([
            (
                "csi.storage.k8s.io/volumesnapshot/name".to_string(),
                "snap".to_string(),
            ),
            (
                "csi.storage.k8s.io/volumesnapshot/namespace".to_string(),
                "default".to_string(),
            ),
        ]),
    };

    let response = service(&cluster).create_snapshot(request).await.unwrap();
    assert_eq!(response.snapshot.snapshot_id, "snap-1");
    assert_eq!(response.snapshot.size_bytes, MIB_128);
    assert!(response.snapshot.ready_to_use);

    // The snapshot object inherited the backing ref and recorded its size.
    let snapshot = cluster.snapshot("default", "snap");
    assert_eq!(
        snapshot
            .pointer(&format!("/metadata/labels/{}~1uid", DOMAIN))
            .and_then(Value::as_str),
        Some("snap-1")
    );
    assert_eq!(
        snapshot["metadata"]["annotations"][format!("{}/size", DOMAIN)].as_str(),
        Some("134217728")
    );

    // Source is idle again and the snapshotting job was cleaned up.
    assert_eq!(
        pvc_annotation(&cluster, "src", "state").as_deref(),
        Some("idle")
    );
    assert!(cluster
        .job("storage", "subprovisioner-snapshot-snap-1")
        .is_none());
}

#[tokio::test]
async fn expansion_resizes_then_patches_capacity_and_state_together() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "data", "u-1")
            .label(&format!("{}/uid", DOMAIN), "u-1")
            .annotation(&format!("{}/state", DOMAIN), "idle")
            .annotation(&format!("{}/capacity", DOMAIN), &MIB_128.to_string())
            .annotation(&format!("{}/backing-pvc-name", DOMAIN), "backing")
            .annotation(&format!("{}/backing-pvc-namespace", DOMAIN), "storage")
            .annotation(&format!("{}/backing-pvc-base-path", DOMAIN), ""),
    );

    let response = service(&cluster)
        .expand_volume(ControllerExpandVolumeRequest {
            volume_id: "u-1".to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: Some(MIB_256),
                limit_bytes: None,
            }),
        })
        .await
        .unwrap();

    assert_eq!(response.capacity_bytes, MIB_256);
    assert!(!response.node_expansion_required);

    assert_eq!(
        pvc_annotation(&cluster, "data", "capacity").as_deref(),
        Some("268435456")
    );
    assert_eq!(
        pvc_annotation(&cluster, "data", "state").as_deref(),
        Some("idle")
    );

    // Expansion jobs are not retained after success.
    assert!(cluster.job("storage", "subprovisioner-expand-u-1").is_none());
}

#[tokio::test]
async fn expansion_to_a_smaller_or_equal_size_short_circuits() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "data", "u-1")
            .label(&format!("{}/uid", DOMAIN), "u-1")
            .annotation(&format!("{}/state", DOMAIN), "staged")
            .annotation(&format!("{}/capacity", DOMAIN), &MIB_256.to_string()),
    );

    // Even though the volume is staged, a retried expansion that already
    // happened answers success without touching the state machine.
    let response = service(&cluster)
        .expand_volume(ControllerExpandVolumeRequest {
            volume_id: "u-1".to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: Some(MIB_128),
                limit_bytes: None,
            }),
        })
        .await
        .unwrap();

    assert_eq!(response.capacity_bytes, MIB_256);
    assert_eq!(
        pvc_annotation(&cluster, "data", "state").as_deref(),
        Some("staged")
    );
    assert!(cluster.job("storage", "subprovisioner-expand-u-1").is_none());
}
