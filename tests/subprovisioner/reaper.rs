//! Deletion reaper behavior against the fake API server.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use subprovisioner::subprovisioner::controller::DeletionReaper;

use crate::support::{FakeCluster, PvcSeed};

const DOMAIN: &str = "subprovisioner.gitlab.io";

fn reaper(cluster: &FakeCluster) -> Arc<DeletionReaper> {
    Arc::new(DeletionReaper::new(
        Arc::new(cluster.client()),
        "subprovisioner:latest".to_string(),
    ))
}

fn doomed_pvc(name: &str, uid: &str) -> PvcSeed {
    PvcSeed::new("default", name, uid)
        .label(&format!("{}/uid", DOMAIN), uid)
        .annotation(&format!("{}/state", DOMAIN), "idle")
        .annotation(&format!("{}/capacity", DOMAIN), "134217728")
        .annotation(&format!("{}/backing-pvc-name", DOMAIN), "backing")
        .annotation(&format!("{}/backing-pvc-namespace", DOMAIN), "storage")
        .annotation(&format!("{}/backing-pvc-base-path", DOMAIN), "")
        .finalizer(&format!("{}/cleanup", DOMAIN))
        .deleted()
}

fn finalizers(cluster: &FakeCluster, name: &str) -> Vec<String> {
    cluster.pvc("default", name)["metadata"]["finalizers"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn reaping_runs_the_deletion_job_and_releases_the_finalizer() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(doomed_pvc("doomed", "u-1"));
    // The retained creation Job from the volume's birth.
    cluster.seed_job("storage", "subprovisioner-create-u-1");

    reaper(&cluster).process_key("default/doomed").await.unwrap();

    assert!(finalizers(&cluster, "doomed").is_empty());
    // Creation and deletion Jobs are both gone afterwards.
    assert!(cluster.job("storage", "subprovisioner-create-u-1").is_none());
    assert!(cluster.job("storage", "subprovisioner-delete-u-1").is_none());
}

#[tokio::test]
async fn staged_claims_are_not_reaped() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        doomed_pvc("doomed", "u-1").annotation(&format!("{}/staged-on-nodes", DOMAIN), "node-a"),
    );

    reaper(&cluster).process_key("default/doomed").await.unwrap();

    assert_eq!(
        finalizers(&cluster, "doomed"),
        vec![format!("{}/cleanup", DOMAIN)]
    );
    assert!(cluster.job("storage", "subprovisioner-delete-u-1").is_none());
}

#[tokio::test]
async fn live_claims_are_not_reaped() {
    let cluster = FakeCluster::start().await;
    cluster.seed_pvc(
        PvcSeed::new("default", "alive", "u-2")
            .label(&format!("{}/uid", DOMAIN), "u-2")
            .annotation(&format!("{}/backing-pvc-namespace", DOMAIN), "storage")
            .finalizer(&format!("{}/cleanup", DOMAIN)),
    );

    reaper(&cluster).process_key("default/alive").await.unwrap();

    assert_eq!(
        finalizers(&cluster, "alive"),
        vec![format!("{}/cleanup", DOMAIN)]
    );
}

#[tokio::test]
async fn vanished_claims_are_forgotten() {
    let cluster = FakeCluster::start().await;
    reaper(&cluster).process_key("default/gone").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn the_run_loop_observes_and_reaps_tombstoned_claims() {
    let cluster = FakeCluster::start().await;
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(reaper(&cluster).run(shutdown.clone()));

    cluster.seed_pvc(doomed_pvc("doomed", "u-1"));

    let reaped = timeout(Duration::from_secs(30), async {
        loop {
            if finalizers(&cluster, "doomed").is_empty() {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    shutdown.cancel();
    let _ = handle.await;

    assert!(reaped.is_ok(), "reaper did not release the finalizer in time");
    assert!(cluster.job("storage", "subprovisioner-delete-u-1").is_none());
}
