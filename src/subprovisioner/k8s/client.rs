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

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use crate::subprovisioner::k8s::job::Job;
use crate::subprovisioner::k8s::pvc::{PersistentVolumeClaim, PersistentVolumeClaimList};
use crate::subprovisioner::k8s::replicaset::{ReplicaSet, ReplicaSetList};
use crate::subprovisioner::k8s::volumesnapshot::{VolumeSnapshot, VolumeSnapshotList};
use crate::subprovisioner::util::error::with_context;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const CONFLICT_RETRY_STEPS: u32 = 5;
const CONFLICT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

type DynError = Box<dyn Error + Send + Sync>;

/// Error answered by the API server, carrying the HTTP status and, when the
/// server supplied one, the Kubernetes Status reason.
#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub message: String,
}

impl HttpError {
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    /// A compare-and-set collision on update. Creates that hit an existing
    /// object answer 409 too but with reason AlreadyExists.
    pub fn is_conflict(&self) -> bool {
        self.status == StatusCode::CONFLICT && self.reason.as_deref() != Some("AlreadyExists")
    }

    pub fn is_already_exists(&self) -> bool {
        self.status == StatusCode::CONFLICT && self.reason.as_deref() == Some("AlreadyExists")
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api server answered {}: {}", self.status, self.message)
    }
}

impl Error for HttpError {}

/// Kubernetes `Status` response body, used for error details only.
#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn find_http_error<'a>(error: &'a (dyn Error + 'static)) -> Option<&'a HttpError> {
    let mut current: Option<&(dyn Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(http) = err.downcast_ref::<HttpError>() {
            return Some(http);
        }
        current = err.source();
    }
    None
}

pub fn is_not_found_error(error: &(dyn Error + 'static)) -> bool {
    find_http_error(error).is_some_and(HttpError::is_not_found)
}

pub fn is_conflict_error(error: &(dyn Error + 'static)) -> bool {
    find_http_error(error).is_some_and(HttpError::is_conflict)
}

pub fn is_already_exists_error(error: &(dyn Error + 'static)) -> bool {
    find_http_error(error).is_some_and(HttpError::is_already_exists)
}

/// Runs `operation` again while it fails with an update conflict, with a
/// short bounded backoff. Any other error propagates immediately.
pub async fn retry_on_conflict<T, F, Fut>(mut operation: F) -> Result<T, DynError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DynError>>,
{
    let mut backoff = CONFLICT_RETRY_BACKOFF;
    for _ in 1..CONFLICT_RETRY_STEPS {
        match operation().await {
            Err(err) if is_conflict_error(err.as_ref()) => {
                sleep(backoff).await;
                backoff *= 2;
            }
            other => return other,
        }
    }
    operation().await
}

/// Typed client for the orchestrator's object store.
///
/// Covers exactly the objects the driver coordinates through: PVCs (state
/// machine and finalizer), Jobs (image operations), ReplicaSets (staging
/// workers), and VolumeSnapshots.
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Connects using the in-cluster service-account configuration.
    pub fn in_cluster() -> Result<Self, DynError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|e| with_context(e, "KUBERNETES_SERVICE_HOST is not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|e| with_context(e, "KUBERNETES_SERVICE_PORT is not set"))?;

        let token_path = format!("{}/token", SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(&token_path)
            .map_err(|e| with_context(e, format!("Failed to read {}", token_path)))?
            .trim()
            .to_string();

        let ca_path = format!("{}/ca.crt", SERVICE_ACCOUNT_DIR);
        let ca_pem = std::fs::read(&ca_path)
            .map_err(|e| with_context(e, format!("Failed to read {}", ca_path)))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .map_err(|e| with_context(e, "Failed to parse cluster CA certificate"))?;

        let http = Client::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| with_context(e, "Failed to build HTTP client"))?;

        Ok(Self {
            http,
            base_url: format!("https://{}:{}", host, port),
            token: Some(token),
        })
    }

    /// Connects to an explicit endpoint without authentication. Used by the
    /// test harness to point the client at a fake API server.
    pub fn with_endpoint(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token: None,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<T, DynError> {
        let response = builder
            .send()
            .await
            .map_err(|e| with_context(e, format!("Failed to {}", what)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| with_context(e, format!("Failed to parse response while {}", what)));
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: Option<StatusBody> = serde_json::from_str(&body).ok();
        let (message, reason) = match parsed {
            Some(status_body) => (
                status_body.message.unwrap_or_else(|| body.clone()),
                status_body.reason,
            ),
            None => (body, None),
        };

        Err(with_context(
            HttpError {
                status,
                reason,
                message,
            },
            format!("Failed to {}", what),
        ))
    }

    // PersistentVolumeClaims

    pub async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, DynError> {
        let path = format!(
            "/api/v1/namespaces/{}/persistentvolumeclaims/{}",
            namespace, name
        );
        self.execute(
            self.request(Method::GET, &path),
            &format!("get PVC {}/{}", namespace, name),
        )
        .await
    }

    /// Lists PVCs across all namespaces matching a label selector.
    pub async fn list_pvcs(
        &self,
        label_selector: &str,
    ) -> Result<PersistentVolumeClaimList, DynError> {
        let builder = self
            .request(Method::GET, "/api/v1/persistentvolumeclaims")
            .query(&[("labelSelector", label_selector)]);
        self.execute(builder, "list PVCs").await
    }

    /// Replaces a PVC. The object's resourceVersion must be set; the API
    /// server answers 409 Conflict when it no longer matches.
    pub async fn update_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, DynError> {
        let namespace = pvc.metadata.namespace.as_deref().unwrap_or("default");
        let name = pvc.metadata.name.as_deref().unwrap_or_default();
        let path = format!(
            "/api/v1/namespaces/{}/persistentvolumeclaims/{}",
            namespace, name
        );
        self.execute(
            self.request(Method::PUT, &path).json(pvc),
            &format!("update PVC {}/{}", namespace, name),
        )
        .await
    }

    pub async fn strategic_merge_patch_pvc(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<PersistentVolumeClaim, DynError> {
        let path = format!(
            "/api/v1/namespaces/{}/persistentvolumeclaims/{}",
            namespace, name
        );
        let builder = self
            .request(Method::PATCH, &path)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/strategic-merge-patch+json",
            )
            .body(patch.to_string());
        self.execute(builder, &format!("patch PVC {}/{}", namespace, name))
            .await
    }

    /// Opens a watch stream over PVCs matching a label selector. The caller
    /// consumes newline-delimited watch events from the response body.
    pub async fn watch_pvcs(
        &self,
        label_selector: &str,
        resource_version: Option<&str>,
    ) -> Result<reqwest::Response, DynError> {
        let mut query: Vec<(&str, &str)> =
            vec![("labelSelector", label_selector), ("watch", "true")];
        if let Some(version) = resource_version {
            query.push(("resourceVersion", version));
        }
        let response = self
            .request(Method::GET, "/api/v1/persistentvolumeclaims")
            .query(&query)
            .send()
            .await
            .map_err(|e| with_context(e, "Failed to open PVC watch"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(with_context(
                HttpError {
                    status,
                    reason: None,
                    message: body,
                },
                "Failed to open PVC watch",
            ));
        }
        Ok(response)
    }

    // Jobs

    pub async fn get_job(&self, namespace: &str, name: &str) -> Result<Job, DynError> {
        let path = format!("/apis/batch/v1/namespaces/{}/jobs/{}", namespace, name);
        self.execute(
            self.request(Method::GET, &path),
            &format!("get Job {}/{}", namespace, name),
        )
        .await
    }

    pub async fn create_job(&self, job: &Job) -> Result<Job, DynError> {
        let namespace = job.metadata.namespace.as_deref().unwrap_or("default");
        let path = format!("/apis/batch/v1/namespaces/{}/jobs", namespace);
        self.execute(
            self.request(Method::POST, &path).json(job),
            &format!(
                "create Job {}/{}",
                namespace,
                job.metadata.name.as_deref().unwrap_or_default()
            ),
        )
        .await
    }

    pub async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), DynError> {
        let path = format!("/apis/batch/v1/namespaces/{}/jobs/{}", namespace, name);
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "DeleteOptions",
            "propagationPolicy": "Foreground",
        });
        let _: Value = self
            .execute(
                self.request(Method::DELETE, &path).json(&body),
                &format!("delete Job {}/{}", namespace, name),
            )
            .await?;
        Ok(())
    }

    // ReplicaSets

    pub async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, DynError> {
        let path = format!(
            "/apis/apps/v1/namespaces/{}/replicasets/{}",
            namespace, name
        );
        self.execute(
            self.request(Method::GET, &path),
            &format!("get ReplicaSet {}/{}", namespace, name),
        )
        .await
    }

    pub async fn create_replica_set(
        &self,
        replica_set: &ReplicaSet,
    ) -> Result<ReplicaSet, DynError> {
        let namespace = replica_set
            .metadata
            .namespace
            .as_deref()
            .unwrap_or("default");
        let path = format!("/apis/apps/v1/namespaces/{}/replicasets", namespace);
        self.execute(
            self.request(Method::POST, &path).json(replica_set),
            &format!(
                "create ReplicaSet {}/{}",
                namespace,
                replica_set.metadata.name.as_deref().unwrap_or_default()
            ),
        )
        .await
    }

    pub async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), DynError> {
        let path = format!(
            "/apis/apps/v1/namespaces/{}/replicasets/{}",
            namespace, name
        );
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "DeleteOptions",
            "propagationPolicy": "Foreground",
        });
        let _: Value = self
            .execute(
                self.request(Method::DELETE, &path).json(&body),
                &format!("delete ReplicaSet {}/{}", namespace, name),
            )
            .await?;
        Ok(())
    }

    /// Lists ReplicaSets across all namespaces matching a label selector.
    pub async fn list_replica_sets(
        &self,
        label_selector: &str,
    ) -> Result<ReplicaSetList, DynError> {
        let builder = self
            .request(Method::GET, "/apis/apps/v1/replicasets")
            .query(&[("labelSelector", label_selector)]);
        self.execute(builder, "list ReplicaSets").await
    }

    // VolumeSnapshots

    pub async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VolumeSnapshot, DynError> {
        let path = format!(
            "/apis/snapshot.storage.k8s.io/v1/namespaces/{}/volumesnapshots/{}",
            namespace, name
        );
        self.execute(
            self.request(Method::GET, &path),
            &format!("get VolumeSnapshot {}/{}", namespace, name),
        )
        .await
    }

    pub async fn list_volume_snapshots(
        &self,
        label_selector: &str,
    ) -> Result<VolumeSnapshotList, DynError> {
        let builder = self
            .request(Method::GET, "/apis/snapshot.storage.k8s.io/v1/volumesnapshots")
            .query(&[("labelSelector", label_selector)]);
        self.execute(builder, "list VolumeSnapshots").await
    }

    pub async fn merge_patch_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<VolumeSnapshot, DynError> {
        let path = format!(
            "/apis/snapshot.storage.k8s.io/v1/namespaces/{}/volumesnapshots/{}",
            namespace, name
        );
        let builder = self
            .request(Method::PATCH, &path)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/merge-patch+json",
            )
            .body(patch.to_string());
        self.execute(
            builder,
            &format!("patch VolumeSnapshot {}/{}", namespace, name),
        )
        .await
    }
}
