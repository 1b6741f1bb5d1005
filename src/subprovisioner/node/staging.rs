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

//! Staging worker program.
//!
//! Runs inside the privileged per-(volume, node) pod. Exports the volume's
//! qcow2 image over a unix NBD socket with qemu-storage-daemon, attaches the
//! export to a free /dev/nbdX with the kernel NBD client, clones the device
//! special file to the kubelet staging path, then blocks until terminated.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Pid, Uid};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::signal::unix::{signal, SignalKind};

use crate::subprovisioner::logger::{log_info, log_warn};
use crate::subprovisioner::util::error::{new_error, with_context};

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "stage-worker";

const NBD_EXPORT_NAME: &str = "volume";
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point of the `stage-worker` subcommand.
pub async fn run(image_path: &str, device_output_path: &str, readonly: bool) -> Result<(), DynError> {
    let socket_path = std::env::temp_dir().join("qsd-nbd.sock");

    let mut daemon = start_storage_daemon(image_path, &socket_path, readonly)?;

    let result = stage_and_wait(&socket_path, device_output_path).await;

    let device = match &result {
        Ok(device) => Some(device.clone()),
        Err(_) => None,
    };

    if let Some(device) = &device {
        disconnect_nbd_device(device);
    }
    stop_storage_daemon(&mut daemon);

    result.map(|_| ())
}

async fn stage_and_wait(
    socket_path: &Path,
    device_output_path: &str,
) -> Result<String, DynError> {
    let device = attach_free_nbd_device(socket_path)?;

    if let Err(err) = clone_device_node(&device, device_output_path) {
        disconnect_nbd_device(&device);
        return Err(err);
    }

    log_info(
        COMPONENT,
        "volume staged",
        &[("device", &device), ("target", device_output_path)],
    );

    wait_for_termination().await;

    Ok(device)
}

/// Starts qemu-storage-daemon exporting the image over the unix socket.
/// Direct IO is attempted first; file systems that do not support O_DIRECT
/// make the daemon exit, in which case it is restarted with caching enabled.
fn start_storage_daemon(
    image_path: &str,
    socket_path: &Path,
    readonly: bool,
) -> Result<Child, DynError> {
    for direct_io in [true, false] {
        let _ = fs::remove_file(socket_path);

        let mut child = spawn_storage_daemon(image_path, socket_path, readonly, direct_io)?;

        match wait_for_socket(socket_path, &mut child)? {
            true => return Ok(child),
            false => {
                if direct_io {
                    log_warn(
                        COMPONENT,
                        "storage daemon refused direct IO, retrying with caching",
                        &[("image", image_path)],
                    );
                    continue;
                }
                return Err(new_error(format!(
                    "storage daemon failed to start for {}",
                    image_path
                )));
            }
        }
    }
    unreachable!("second storage daemon attempt always returns");
}

fn spawn_storage_daemon(
    image_path: &str,
    socket_path: &Path,
    readonly: bool,
    direct_io: bool,
) -> Result<Child, DynError> {
    let file_blockdev = if direct_io {
        format!(
            "driver=file,node-name=file0,filename={},cache.direct=on",
            image_path
        )
    } else {
        format!("driver=file,node-name=file0,filename={}", image_path)
    };

    Command::new("qemu-storage-daemon")
        .arg("--blockdev")
        .arg(&file_blockdev)
        .arg("--blockdev")
        .arg("driver=qcow2,node-name=fmt0,file=file0")
        .arg("--nbd-server")
        .arg(format!(
            "addr.type=unix,addr.path={}",
            socket_path.display()
        ))
        .arg("--export")
        .arg(format!(
            "type=nbd,id=export0,node-name=fmt0,name={},writable={}",
            NBD_EXPORT_NAME,
            if readonly { "off" } else { "on" }
        ))
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| with_context(e, "Failed to start qemu-storage-daemon"))
}

/// Returns true once the NBD socket exists, false if the daemon exited first.
fn wait_for_socket(socket_path: &Path, child: &mut Child) -> Result<bool, DynError> {
    let deadline = Instant::now() + SOCKET_WAIT_TIMEOUT;
    loop {
        if socket_path.exists() {
            return Ok(true);
        }
        if let Some(status) = child
            .try_wait()
            .map_err(|e| with_context(e, "Failed to poll qemu-storage-daemon"))?
        {
            log_warn(
                COMPONENT,
                "storage daemon exited during startup",
                &[("status", &status.to_string())],
            );
            return Ok(false);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(new_error("timed out waiting for the NBD socket"));
        }
        std::thread::sleep(SOCKET_POLL_INTERVAL);
    }
}

/// Scans /dev/nbd* in randomized order for a free device and attaches the
/// export to it.
///
/// Attachment races with other staging workers on the node. The kernel
/// accepts whichever connect lands first, so after attaching we re-query the
/// device: whoever sees it connected after its own attach won, everyone else
/// moves on to the next candidate.
fn attach_free_nbd_device(socket_path: &Path) -> Result<String, DynError> {
    let mut devices = list_nbd_devices()?;
    devices.shuffle(&mut thread_rng());

    for device in &devices {
        if nbd_device_is_connected(device) {
            continue;
        }

        let attached = Command::new("nbd-client")
            .arg("-unix")
            .arg(socket_path)
            .arg("-name")
            .arg(NBD_EXPORT_NAME)
            .arg(device)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| with_context(e, "Failed to invoke nbd-client"))?
            .success();
        if !attached {
            continue;
        }

        if !nbd_device_is_connected(device) {
            // Lost the race; the connect went to someone else's device.
            continue;
        }

        if nbd_device_size(device) == 0 {
            disconnect_nbd_device(device);
            continue;
        }

        return Ok(device.clone());
    }

    Err(new_error("no free NBD device found"))
}

fn list_nbd_devices() -> Result<Vec<String>, DynError> {
    let mut devices = Vec::new();
    let entries =
        fs::read_dir("/dev").map_err(|e| with_context(e, "Failed to list /dev"))?;
    for entry in entries {
        let entry = entry.map_err(|e| with_context(e, "Failed to iterate /dev"))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(suffix) = name.strip_prefix("nbd") {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                devices.push(format!("/dev/{}", name));
            }
        }
    }
    if devices.is_empty() {
        return Err(new_error(
            "no /dev/nbd* devices present; is the nbd module loaded?",
        ));
    }
    Ok(devices)
}

fn nbd_device_is_connected(device: &str) -> bool {
    Command::new("nbd-client")
        .arg("-check")
        .arg(device)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn nbd_device_size(device: &str) -> u64 {
    let name = device.trim_start_matches("/dev/");
    let sectors = fs::read_to_string(format!("/sys/block/{}/size", name))
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(0);
    sectors * 512
}

fn disconnect_nbd_device(device: &str) {
    let result = Command::new("nbd-client")
        .arg("-d")
        .arg(device)
        .stdin(Stdio::null())
        .status();
    if !result.map(|status| status.success()).unwrap_or(false) {
        log_warn(COMPONENT, "failed to disconnect NBD device", &[("device", device)]);
    }
}

/// Recreates the block special file at the staging path with the device's
/// rdev, mode, and ownership. The kubelet bind-mounts this node into pods.
fn clone_device_node(device: &str, target: &str) -> Result<(), DynError> {
    let stat = nix::sys::stat::stat(device)
        .map_err(|e| with_context(e, format!("Failed to stat {}", device)))?;

    let target_path = PathBuf::from(target);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| with_context(e, format!("Failed to create {}", parent.display())))?;
    }
    match fs::remove_file(&target_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(with_context(err, format!("Failed to remove {}", target))),
    }

    let mode = Mode::from_bits_truncate(stat.st_mode & 0o7777);
    mknod(&target_path, SFlag::S_IFBLK, mode, stat.st_rdev)
        .map_err(|e| with_context(e, format!("Failed to create block node {}", target)))?;
    chown(
        &target_path,
        Some(Uid::from_raw(stat.st_uid)),
        Some(Gid::from_raw(stat.st_gid)),
    )
    .map_err(|e| with_context(e, format!("Failed to chown {}", target)))?;

    Ok(())
}

/// Blocks until SIGTERM or SIGINT.
async fn wait_for_termination() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return,
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(int) => int,
        Err(_) => return,
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    log_info(COMPONENT, "terminating", &[]);
}

/// Asks the daemon to stop with SIGTERM, escalating to SIGKILL on timeout.
fn stop_storage_daemon(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);

    let deadline = Instant::now() + DAEMON_STOP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(_) => return,
        }
    }
}
