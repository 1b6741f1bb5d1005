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

//! JSON-over-unix-socket surface for the CSI services.
//!
//! One router per process role: the controller process serves the identity
//! and controller routes, the node process the identity and node routes.

use std::error::Error;
use std::io::ErrorKind;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::UnixListener;

use crate::subprovisioner::controller::ControllerService;
use crate::subprovisioner::csi::identity;
use crate::subprovisioner::csi::types::*;
use crate::subprovisioner::logger::{log_error, log_info};
use crate::subprovisioner::node::NodeService;
use crate::subprovisioner::util::error::{rpc_code, with_context, RpcCode};

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "server";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn from_rpc(method: &'static str, err: DynError) -> Self {
        let status = match rpc_code(err.as_ref()) {
            Some(RpcCode::InvalidArgument) => StatusCode::BAD_REQUEST,
            Some(RpcCode::FailedPrecondition) => StatusCode::PRECONDITION_FAILED,
            Some(RpcCode::NotFound) => StatusCode::NOT_FOUND,
            Some(RpcCode::Unknown) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = err.to_string();
        log_error(
            COMPONENT,
            "request failed",
            &[
                ("method", method),
                ("status", status.as_str()),
                ("error", &message),
            ],
        );
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

fn logged<T>(method: &'static str, result: Result<T, DynError>) -> Result<Json<T>, ApiError> {
    match result {
        Ok(value) => {
            log_info(COMPONENT, "request succeeded", &[("method", method)]);
            Ok(Json(value))
        }
        Err(err) => Err(ApiError::from_rpc(method, err)),
    }
}

// Identity handlers, shared by both processes.

async fn plugin_info() -> Json<GetPluginInfoResponse> {
    Json(identity::get_plugin_info())
}

async fn plugin_capabilities() -> Json<GetPluginCapabilitiesResponse> {
    Json(identity::get_plugin_capabilities())
}

async fn probe() -> Json<ProbeResponse> {
    Json(identity::probe())
}

fn identity_routes<S: Clone + Send + Sync + 'static>() -> Router<S> {
    Router::new()
        .route("/identity/info", get(plugin_info))
        .route("/identity/capabilities", get(plugin_capabilities))
        .route("/identity/probe", get(probe))
}

// Controller handlers

async fn create_volume(
    State(service): State<Arc<ControllerService>>,
    Json(req): Json<CreateVolumeRequest>,
) -> Result<Json<CreateVolumeResponse>, ApiError> {
    logged("CreateVolume", service.create_volume(req).await)
}

async fn delete_volume(
    State(service): State<Arc<ControllerService>>,
    Json(req): Json<DeleteVolumeRequest>,
) -> Result<Json<()>, ApiError> {
    logged("DeleteVolume", service.delete_volume(req).await)
}

async fn create_snapshot(
    State(service): State<Arc<ControllerService>>,
    Json(req): Json<CreateSnapshotRequest>,
) -> Result<Json<CreateSnapshotResponse>, ApiError> {
    logged("CreateSnapshot", service.create_snapshot(req).await)
}

async fn delete_snapshot(
    State(service): State<Arc<ControllerService>>,
    Json(req): Json<DeleteSnapshotRequest>,
) -> Result<Json<()>, ApiError> {
    logged("DeleteSnapshot", service.delete_snapshot(req).await)
}

async fn expand_volume(
    State(service): State<Arc<ControllerService>>,
    Json(req): Json<ControllerExpandVolumeRequest>,
) -> Result<Json<ControllerExpandVolumeResponse>, ApiError> {
    logged("ControllerExpandVolume", service.expand_volume(req).await)
}

async fn controller_capabilities(
    State(service): State<Arc<ControllerService>>,
) -> Json<ControllerGetCapabilitiesResponse> {
    Json(service.get_capabilities())
}

async fn validate_volume_capabilities() -> ApiError {
    // Kubernetes never calls this.
    ApiError {
        status: StatusCode::NOT_IMPLEMENTED,
        message: "method ValidateVolumeCapabilities not required by Kubernetes".to_string(),
    }
}

pub fn controller_router(service: Arc<ControllerService>) -> Router {
    identity_routes()
        .route("/controller/create-volume", post(create_volume))
        .route("/controller/delete-volume", post(delete_volume))
        .route("/controller/create-snapshot", post(create_snapshot))
        .route("/controller/delete-snapshot", post(delete_snapshot))
        .route("/controller/expand-volume", post(expand_volume))
        .route(
            "/controller/validate-volume-capabilities",
            post(validate_volume_capabilities),
        )
        .route("/controller/capabilities", get(controller_capabilities))
        .with_state(service)
}

// Node handlers

async fn stage_volume(
    State(service): State<Arc<NodeService>>,
    Json(req): Json<NodeStageVolumeRequest>,
) -> Result<Json<()>, ApiError> {
    logged("NodeStageVolume", service.stage_volume(req).await)
}

async fn unstage_volume(
    State(service): State<Arc<NodeService>>,
    Json(req): Json<NodeUnstageVolumeRequest>,
) -> Result<Json<()>, ApiError> {
    logged("NodeUnstageVolume", service.unstage_volume(req).await)
}

async fn publish_volume(
    State(service): State<Arc<NodeService>>,
    Json(req): Json<NodePublishVolumeRequest>,
) -> Result<Json<()>, ApiError> {
    logged("NodePublishVolume", service.publish_volume(req).await)
}

async fn unpublish_volume(
    State(service): State<Arc<NodeService>>,
    Json(req): Json<NodeUnpublishVolumeRequest>,
) -> Result<Json<()>, ApiError> {
    logged("NodeUnpublishVolume", service.unpublish_volume(req).await)
}

async fn node_capabilities(
    State(service): State<Arc<NodeService>>,
) -> Json<NodeGetCapabilitiesResponse> {
    Json(service.get_capabilities())
}

async fn node_info(State(service): State<Arc<NodeService>>) -> Json<NodeGetInfoResponse> {
    Json(service.get_info())
}

pub fn node_router(service: Arc<NodeService>) -> Router {
    identity_routes()
        .route("/node/stage-volume", post(stage_volume))
        .route("/node/unstage-volume", post(unstage_volume))
        .route("/node/publish-volume", post(publish_volume))
        .route("/node/unpublish-volume", post(unpublish_volume))
        .route("/node/capabilities", get(node_capabilities))
        .route("/node/info", get(node_info))
        .with_state(service)
}

/// Binds the router to a unix socket, replacing any stale socket file.
pub async fn serve_on_socket(socket_path: &str, router: Router) -> Result<(), DynError> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to remove stale socket {}", socket_path),
            ))
        }
    }

    let listener = UnixListener::bind(socket_path)
        .map_err(|e| with_context(e, format!("Failed to bind {}", socket_path)))?;

    log_info(COMPONENT, "listening", &[("socket", socket_path)]);

    axum::serve(listener, router)
        .await
        .map_err(|e| with_context(e, "Server terminated abnormally"))
}
