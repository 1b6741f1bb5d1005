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
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use subprovisioner::subprovisioner::controller::{ControllerService, DeletionReaper};
use subprovisioner::subprovisioner::k8s::ApiClient;
use subprovisioner::subprovisioner::logger::{set_log_format, LogFormat};
use subprovisioner::subprovisioner::node::{staging, NodeService};
use subprovisioner::subprovisioner::server;

/// CSI driver provisioning block volumes as qcow2 overlays on a shared file
/// system.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    /// Emit logs as JSON instead of key=value text
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cluster-singleton controller plugin
    Controller(ControllerArgs),

    /// Run the per-node plugin
    Node(NodeArgs),

    /// Run the staging worker (invoked inside staging pods, not by hand)
    StageWorker(StageWorkerArgs),
}

#[derive(Args)]
struct ControllerArgs {
    /// Path of the unix socket to serve CSI requests on
    #[arg(long)]
    csi_socket: String,

    /// Container image used for image jobs and staging workers
    #[arg(long)]
    image: String,
}

#[derive(Args)]
struct NodeArgs {
    /// Path of the unix socket to serve CSI requests on
    #[arg(long)]
    csi_socket: String,

    /// Name of the node this plugin instance runs on
    #[arg(long)]
    node_name: String,

    /// Container image used for image jobs and staging workers
    #[arg(long)]
    image: String,
}

#[derive(Args)]
struct StageWorkerArgs {
    /// Path of the qcow2 image under the backing mount
    image_path: String,

    /// Path at which to create the block special file
    device_path: String,

    /// Whether the export is read-only ("true" or "false")
    readonly: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    if cli.json_logs {
        set_log_format(LogFormat::Json);
    }

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Node(args) => run_node(args).await,
        Commands::StageWorker(args) => {
            let readonly = match args.readonly.as_str() {
                "true" => true,
                "false" => false,
                other => {
                    return Err(format!("readonly must be \"true\" or \"false\", got {:?}", other)
                        .into())
                }
            };
            staging::run(&args.image_path, &args.device_path, readonly).await
        }
    }
}

async fn run_controller(args: ControllerArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let client = Arc::new(ApiClient::in_cluster()?);

    let reaper = Arc::new(DeletionReaper::new(Arc::clone(&client), args.image.clone()));
    let shutdown = CancellationToken::new();
    tokio::spawn(reaper.run(shutdown.clone()));

    let service = Arc::new(ControllerService::new(client, args.image));
    let result = server::serve_on_socket(&args.csi_socket, server::controller_router(service)).await;

    shutdown.cancel();
    result
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let client = Arc::new(ApiClient::in_cluster()?);
    let service = Arc::new(NodeService::new(client, args.node_name, args.image));
    server::serve_on_socket(&args.csi_socket, server::node_router(service)).await
}
