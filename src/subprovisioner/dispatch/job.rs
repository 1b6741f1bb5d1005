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

//! One-shot image jobs.
//!
//! All image manipulation runs inside Jobs that mount the backing volume at
//! [`config::BACKING_MOUNT`]. Job names are deterministic per record, so a
//! retried RPC re-attaches to the Job it dispatched before instead of
//! starting the work twice.

use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use tokio::time::sleep;

use crate::subprovisioner::config;
use crate::subprovisioner::k8s::client::{
    is_already_exists_error, is_not_found_error, ApiClient,
};
use crate::subprovisioner::k8s::job::{Job, JobSpec};
use crate::subprovisioner::k8s::meta::ObjectMeta;
use crate::subprovisioner::k8s::pod::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};

type DynError = Box<dyn Error + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Retried on failure until far beyond any realistic transient problem.
const JOB_BACKOFF_LIMIT: i32 = 99999;

pub struct JobConfig {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,

    pub image: String,
    pub command: Vec<String>,

    pub backing_pvc_name: String,
    pub backing_pvc_base_path: String,
}

pub fn build_job(cfg: &JobConfig) -> Job {
    let pod_spec = PodSpec {
        restart_policy: Some("Never".to_string()),
        node_name: None,
        containers: vec![Container {
            name: "container".to_string(),
            image: Some(cfg.image.clone()),
            command: cfg.command.clone(),
            volume_mounts: vec![VolumeMount {
                name: "backing".to_string(),
                mount_path: config::BACKING_MOUNT.to_string(),
                sub_path: Some(cfg.backing_pvc_base_path.clone())
                    .filter(|path| !path.is_empty()),
            }],
            ..Default::default()
        }],
        volumes: vec![Volume {
            name: "backing".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: cfg.backing_pvc_name.clone(),
            }),
            host_path: None,
        }],
    };

    Job::new(
        ObjectMeta {
            name: Some(cfg.name.clone()),
            namespace: Some(cfg.namespace.clone()),
            labels: cfg.labels.clone(),
            ..Default::default()
        },
        JobSpec {
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: ObjectMeta::default(),
                spec: pod_spec,
            },
        },
    )
}

/// Idempotent: an already existing Job with the same name is treated as ours.
pub async fn create_job(client: &ApiClient, cfg: &JobConfig) -> Result<(), DynError> {
    let job = build_job(cfg);
    match client.create_job(&job).await {
        Ok(_) => Ok(()),
        Err(err) if is_already_exists_error(err.as_ref()) => Ok(()),
        Err(err) => Err(err),
    }
}

pub async fn wait_for_job_to_succeed(
    client: &ApiClient,
    job_name: &str,
    job_namespace: &str,
) -> Result<(), DynError> {
    loop {
        let job = client.get_job(job_namespace, job_name).await?;
        if job.has_succeeded() {
            return Ok(());
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Idempotent. Succeeds immediately if the object no longer exists, otherwise
/// requests foreground deletion and waits until the Job is gone.
pub async fn delete_job_synchronously(
    client: &ApiClient,
    job_name: &str,
    job_namespace: &str,
) -> Result<(), DynError> {
    match client.delete_job(job_namespace, job_name).await {
        Ok(()) => {}
        Err(err) if is_not_found_error(err.as_ref()) => return Ok(()),
        Err(err) => return Err(err),
    }

    loop {
        sleep(POLL_INTERVAL).await;
        match client.get_job(job_namespace, job_name).await {
            Ok(_) => {}
            Err(err) if is_not_found_error(err.as_ref()) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}
