/*
 * Copyright (C) 2024 The Subprovisioner Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Deletion reaper.
//!
//! Watches every claim carrying the driver's uid label. Claims observed with
//! a deletion timestamp are keyed into a queue drained by a small worker
//! pool. A claim is reaped once no node stages it anymore: the creation Job
//! is removed, a deletion Job unlinks the image, and finally the cleanup
//! finalizer is released. This is the only code path that removes the
//! finalizer, so claims whose create-volume failed after the finalizer went
//! on are still reclaimed here.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::subprovisioner::config;
use crate::subprovisioner::dispatch::job::{
    create_job, delete_job_synchronously, wait_for_job_to_succeed, JobConfig,
};
use crate::subprovisioner::k8s::client::{
    is_not_found_error, retry_on_conflict, ApiClient,
};
use crate::subprovisioner::k8s::pvc::PersistentVolumeClaim;
use crate::subprovisioner::logger::{log_info, log_warn};

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "reaper";

const WORKERS: usize = 4;
const REQUEUE_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const REQUEUE_BACKOFF_MAX: Duration = Duration::from_secs(30);
const WATCH_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: PersistentVolumeClaim,
}

pub struct DeletionReaper {
    client: Arc<ApiClient>,
    image: String,
}

impl DeletionReaper {
    pub fn new(client: Arc<ApiClient>, image: String) -> Self {
        Self { client, image }
    }

    /// Runs the watch loop and worker pool until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(Mutex::new(rx));
        let attempts = Arc::new(Mutex::new(HashMap::<String, u32>::new()));

        let mut tasks = Vec::new();

        for _ in 0..WORKERS {
            let reaper = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            let tx = tx.clone();
            let attempts = Arc::clone(&attempts);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                reaper.run_worker(rx, tx, attempts, shutdown).await;
            }));
        }

        {
            let reaper = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                reaper.run_watch(tx, shutdown).await;
            }));
        }

        shutdown.cancelled().await;
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Lists and then watches claims, feeding tombstoned keys into the queue.
    /// Stream failures fall back to a fresh list with exponential backoff.
    async fn run_watch(&self, tx: mpsc::UnboundedSender<String>, shutdown: CancellationToken) {
        let mut backoff = WATCH_BACKOFF_INITIAL;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let resource_version = match self.resync(&tx).await {
                Ok(version) => {
                    backoff = WATCH_BACKOFF_INITIAL;
                    version
                }
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "failed to list claims",
                        &[("error", &err.to_string())],
                    );
                    None
                }
            };

            if let Some(version) = resource_version {
                match self.watch_once(&tx, &version, &shutdown).await {
                    Ok(()) => backoff = WATCH_BACKOFF_INITIAL,
                    Err(err) => {
                        log_warn(
                            COMPONENT,
                            "claim watch interrupted",
                            &[("error", &err.to_string())],
                        );
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
        }
    }

    async fn resync(
        &self,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<Option<String>, DynError> {
        let list = self.client.list_pvcs(&config::uid_label()).await?;
        for pvc in &list.items {
            if pvc.metadata.is_being_deleted() {
                let _ = tx.send(claim_key(pvc));
            }
        }
        Ok(list.metadata.resource_version)
    }

    /// Consumes one watch stream until it ends or fails.
    async fn watch_once(
        &self,
        tx: &mpsc::UnboundedSender<String>,
        resource_version: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), DynError> {
        let mut response = self
            .client
            .watch_pvcs(&config::uid_label(), Some(resource_version))
            .await?;

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                return Ok(()); // stream ended; caller re-lists
            };

            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<WatchEvent>(line) {
                    Ok(event) => {
                        if matches!(event.event_type.as_str(), "ADDED" | "MODIFIED")
                            && event.object.metadata.is_being_deleted()
                        {
                            let _ = tx.send(claim_key(&event.object));
                        }
                    }
                    Err(err) => {
                        log_warn(
                            COMPONENT,
                            "ignoring malformed watch event",
                            &[("error", &err.to_string())],
                        );
                    }
                }
            }
        }
    }

    async fn run_worker(
        &self,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
        tx: mpsc::UnboundedSender<String>,
        attempts: Arc<Mutex<HashMap<String, u32>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let key = {
                let mut receiver = rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    key = receiver.recv() => match key {
                        Some(key) => key,
                        None => return,
                    },
                }
            };

            match self.process_key(&key).await {
                Ok(()) => {
                    attempts.lock().await.remove(&key);
                }
                Err(err) => {
                    let attempt = {
                        let mut attempts = attempts.lock().await;
                        let entry = attempts.entry(key.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    log_warn(
                        COMPONENT,
                        "failed to reap claim, requeueing",
                        &[
                            ("key", &key),
                            ("attempt", &attempt.to_string()),
                            ("error", &err.to_string()),
                        ],
                    );

                    let backoff = requeue_backoff(attempt);
                    let tx = tx.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = sleep(backoff) => {
                                let _ = tx.send(key);
                            }
                        }
                    });
                }
            }
        }
    }

    /// Processes one queued claim key. The claim is re-fetched so the
    /// decision is made against the freshest state, never the watch cache.
    pub async fn process_key(&self, key: &str) -> Result<(), DynError> {
        let Some((namespace, name)) = key.split_once('/') else {
            // Malformed keys cannot become valid on retry.
            return Ok(());
        };

        let pvc = match self.client.get_pvc(namespace, name).await {
            Ok(pvc) => pvc,
            Err(err) if is_not_found_error(err.as_ref()) => return Ok(()),
            Err(err) => return Err(err),
        };

        let staged_key = config::annotation("staged-on-nodes");
        let is_staged = pvc
            .metadata
            .annotation(&staged_key)
            .is_some_and(|nodes| !nodes.is_empty());
        let has_finalizer = pvc.metadata.has_finalizer(&config::cleanup_finalizer());

        if pvc.metadata.is_being_deleted() && !is_staged && has_finalizer {
            log_info(COMPONENT, "deleting volume", &[("key", key)]);
            self.delete_volume(&pvc).await?;
        }

        Ok(())
    }

    async fn delete_volume(&self, pvc: &PersistentVolumeClaim) -> Result<(), DynError> {
        let pvc_uid = pvc.metadata.uid.clone().unwrap_or_default();
        let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
        let pvc_namespace = pvc
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let annotation = |name: &str| -> String {
            pvc.metadata
                .annotation(&config::annotation(name))
                .unwrap_or_default()
                .to_string()
        };
        let backing_pvc_name = annotation("backing-pvc-name");
        let backing_pvc_namespace = annotation("backing-pvc-namespace");
        let backing_pvc_base_path = annotation("backing-pvc-base-path");

        // The creation Job was retained for idempotency; drop it first.
        delete_job_synchronously(
            &self.client,
            &config::creation_job_name(&pvc_uid),
            &backing_pvc_namespace,
        )
        .await?;

        let deletion_job_name = config::deletion_job_name(&pvc_uid);

        create_job(
            &self.client,
            &JobConfig {
                name: deletion_job_name.clone(),
                namespace: backing_pvc_namespace.clone(),
                labels: HashMap::from([
                    (
                        config::annotation("component"),
                        "volume-deletion".to_string(),
                    ),
                    (config::annotation("pvc-uid"), pvc_uid.clone()),
                ]),
                image: self.image.clone(),
                command: vec![
                    "rm".to_string(),
                    "-f".to_string(),
                    config::volume_image_path(&pvc_uid),
                ],
                backing_pvc_name,
                backing_pvc_base_path,
            },
        )
        .await?;

        wait_for_job_to_succeed(&self.client, &deletion_job_name, &backing_pvc_namespace).await?;

        delete_job_synchronously(&self.client, &deletion_job_name, &backing_pvc_namespace)
            .await?;

        // Release the cleanup finalizer; the orchestrator then lets the
        // claim object go.
        let client = Arc::clone(&self.client);
        let finalizer = config::cleanup_finalizer();
        retry_on_conflict(|| {
            let client = Arc::clone(&client);
            let finalizer = finalizer.clone();
            let pvc_name = pvc_name.clone();
            let pvc_namespace = pvc_namespace.clone();
            async move {
                let mut pvc = client.get_pvc(&pvc_namespace, &pvc_name).await?;
                pvc.metadata.finalizers.retain(|f| f != &finalizer);
                client.update_pvc(&pvc).await?;
                Ok(())
            }
        })
        .await?;

        log_info(
            COMPONENT,
            "volume deleted",
            &[("pvc", &format!("{}/{}", pvc_namespace, pvc_name))],
        );

        Ok(())
    }
}

fn claim_key(pvc: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}",
        pvc.metadata.namespace.as_deref().unwrap_or("default"),
        pvc.metadata.name.as_deref().unwrap_or_default()
    )
}

fn requeue_backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    (REQUEUE_BACKOFF_INITIAL * factor).min(REQUEUE_BACKOFF_MAX)
}
