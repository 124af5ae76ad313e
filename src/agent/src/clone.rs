// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The clone copier.
//!
//! Cloning reconstructs a tablet on this backend from a peer's snapshot:
//! snapshot on the remote, list the snapshot directory, download every file,
//! verify lengths, release the snapshot, and hand the result to the storage
//! engine. Sources are tried in order; the first success wins. The header
//! file is downloaded last: its presence is the engine's completeness marker,
//! so an interrupted copy can never be mistaken for a whole tablet.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use slate_agent_types::protocol::{
    BackendIdent, ClonePayload, DropTabletPayload, FinishReport, Signature, SnapshotPayload,
    TaskKind, TaskStatus, TaskStatusCode,
};
use slate_agent_types::AgentError;

use crate::agent::TaskContext;
use crate::download::tablet_download_url;

const DOWNLOAD_FILE_MAX_RETRY: u32 = 3;
const LIST_REMOTE_FILE_TIMEOUT: Duration = Duration::from_secs(15);
const GET_LENGTH_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn handle_clone(
    ctx: &TaskContext,
    signature: Signature,
    request: ClonePayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let mut result: Result<(), AgentError> = Ok(());

    let already_exists = ctx
        .engine
        .has_tablet(request.tablet_id, request.schema_hash)
        .await;
    if already_exists {
        info!(
            signature,
            tablet_id = request.tablet_id,
            "clone target already exists locally, skipping copy"
        );
        error_msgs.push("clone tablet already exists".to_string());
    } else {
        let mut local_shard = None;
        match ctx.engine.obtain_shard_path(request.storage_medium).await {
            Ok(shard) => {
                result = clone_copy(ctx, signature, &request, &shard, &mut error_msgs).await;
                if result.is_ok() {
                    if let Err(e) = ctx
                        .engine
                        .load_header(&shard, request.tablet_id, request.schema_hash)
                        .await
                    {
                        warn!(signature, shard = %shard.display(), "load header failed: {e}");
                        error_msgs.push(format!("load header failed: {e}"));
                        result = Err(e);
                    }
                }
                local_shard = Some(shard);
            }
            Err(e) => {
                warn!(signature, "clone get local shard path failed: {e}");
                error_msgs.push(format!("clone get local shard path failed: {e}"));
                result = Err(e);
            }
        }
        // A failed copy leaves a partial tablet directory behind; removal is
        // best-effort, the engine reaps leftovers too.
        if result.is_err() {
            if let Some(shard) = &local_shard {
                let local_dir = tablet_dir(shard, &request);
                info!(signature, dir = %local_dir.display(), "clone failed, removing local dir");
                if let Err(e) = tokio::fs::remove_dir_all(&local_dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(signature, dir = %local_dir.display(), "removing clone dir failed: {e}");
                    }
                }
            }
        }
    }

    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::Clone, signature);
    if result.is_ok() {
        match ctx
            .engine
            .tablet_info(request.tablet_id, request.schema_hash)
            .await
        {
            Ok(tablet_info) => {
                let stale = match (request.committed_version, request.committed_version_hash) {
                    (Some(version), Some(version_hash)) => {
                        tablet_info.version < version
                            || (tablet_info.version == version
                                && tablet_info.version_hash != version_hash)
                    }
                    _ => false,
                };
                if stale {
                    // A version older than what the master committed means we
                    // copied a leftover replica that was awaiting drop.
                    info!(
                        signature,
                        tablet_id = request.tablet_id,
                        version = tablet_info.version,
                        expected_version = request.committed_version,
                        "cloned tablet is stale, dropping it"
                    );
                    let drop_request = DropTabletPayload {
                        tablet_id: request.tablet_id,
                        schema_hash: request.schema_hash,
                    };
                    if let Err(e) = ctx.engine.drop_tablet(&drop_request).await {
                        warn!(signature, "dropping stale cloned tablet failed: {e}");
                    }
                    error_msgs.push(format!(
                        "cloned tablet is stale: version {}, expected at least {:?}",
                        tablet_info.version, request.committed_version
                    ));
                    result = Err(AgentError::Internal("cloned tablet is stale".to_string()));
                } else {
                    report.finish_tablet_infos = Some(vec![tablet_info]);
                }
            }
            Err(e) => {
                warn!(signature, "clone done, but fetching tablet info failed: {e}");
                error_msgs.push(format!("clone done, but fetching tablet info failed: {e}"));
                result = Err(e);
            }
        }
    }

    if result.is_err() {
        error_msgs.push("clone failed".to_string());
    }
    let code = match &result {
        Ok(()) => TaskStatusCode::Ok,
        Err(e) => e.status_code(),
    };
    report.status = TaskStatus { code, error_msgs };
    report
}

fn tablet_dir(shard: &Path, request: &ClonePayload) -> PathBuf {
    shard
        .join(request.tablet_id.to_string())
        .join(request.schema_hash.to_string())
}

/// Copies the tablet from the first source backend that works end to end.
async fn clone_copy(
    ctx: &TaskContext,
    signature: Signature,
    request: &ClonePayload,
    local_shard: &Path,
    error_msgs: &mut Vec<String>,
) -> Result<(), AgentError> {
    let token = ctx.master.token();
    let mut last_error = AgentError::Internal("clone request carries no source backends".into());
    for src in &request.src_backends {
        match clone_from_source(ctx, signature, request, local_shard, &token, src).await {
            Ok(()) => {
                info!(signature, src = %src, "clone copy done");
                return Ok(());
            }
            Err(e) => {
                warn!(signature, src = %src, "clone from source failed: {e}");
                error_msgs.push(format!("clone from {} failed: {e}", src.host));
                last_error = e;
            }
        }
    }
    Err(last_error)
}

async fn clone_from_source(
    ctx: &TaskContext,
    signature: Signature,
    request: &ClonePayload,
    local_shard: &Path,
    token: &str,
    src: &BackendIdent,
) -> Result<(), AgentError> {
    let snapshot_request = SnapshotPayload {
        tablet_id: request.tablet_id,
        schema_hash: request.schema_hash,
    };
    let snapshot_path = ctx.peer_client.make_snapshot(src, &snapshot_request).await?;
    info!(signature, src = %src, %snapshot_path, "made remote snapshot");

    let copy_result =
        copy_snapshot(ctx, signature, request, local_shard, token, src, &snapshot_path).await;

    // Always release; the peer reaps leaked snapshots on its own schedule.
    if let Err(e) = ctx.peer_client.release_snapshot(src, &snapshot_path).await {
        warn!(signature, src = %src, %snapshot_path, "release snapshot failed: {e}");
    }

    copy_result
}

async fn copy_snapshot(
    ctx: &TaskContext,
    signature: Signature,
    request: &ClonePayload,
    local_shard: &Path,
    token: &str,
    src: &BackendIdent,
    snapshot_path: &str,
) -> Result<(), AgentError> {
    let mut remote_dir = snapshot_path.to_string();
    if !remote_dir.ends_with('/') {
        remote_dir.push('/');
    }
    remote_dir.push_str(&format!("{}/{}/", request.tablet_id, request.schema_hash));

    let local_dir = tablet_dir(local_shard, request);
    if tokio::fs::try_exists(&local_dir)
        .await
        .map_err(|e| AgentError::Internal(format!("checking {} failed: {e}", local_dir.display())))?
    {
        tokio::fs::remove_dir_all(&local_dir).await.map_err(|e| {
            AgentError::Internal(format!("clearing {} failed: {e}", local_dir.display()))
        })?;
    }
    tokio::fs::create_dir_all(&local_dir).await.map_err(|e| {
        AgentError::Internal(format!("creating {} failed: {e}", local_dir.display()))
    })?;

    let list_url = tablet_download_url(&src.host, src.http_port, token, &remote_dir);
    let listing = with_linear_retry(signature, "list remote dir", || {
        let list_url = &list_url;
        let downloader = &ctx.downloader;
        async move { downloader.list_remote_dir(list_url, LIST_REMOTE_FILE_TIMEOUT).await }
    })
    .await?;

    for file_name in order_files_header_last(&listing) {
        let remote_file = format!("{remote_dir}{file_name}");
        let url = tablet_download_url(&src.host, src.http_port, token, &remote_file);

        let file_size = with_linear_retry(signature, "get file length", || {
            let url = &url;
            let downloader = &ctx.downloader;
            async move { downloader.get_length(url, GET_LENGTH_TIMEOUT).await }
        })
        .await?;

        // Budget the transfer by the configured low-speed floor.
        let timeout_secs = (file_size
            / (ctx.config.download_low_speed_limit_kbps.max(1) * 1024))
            .max(ctx.config.download_low_speed_time);
        let download_timeout = Duration::from_secs(timeout_secs);

        let local_path = local_dir.join(&file_name);
        with_linear_retry(signature, "download file", || {
            let url = &url;
            let local_path = &local_path;
            let downloader = &ctx.downloader;
            async move {
                downloader.download_file(url, local_path, download_timeout).await?;
                let metadata = tokio::fs::metadata(local_path).await.map_err(|e| {
                    AgentError::FileDownloadFailed(format!(
                        "stat {} failed: {e}",
                        local_path.display()
                    ))
                })?;
                if metadata.len() != file_size {
                    return Err(AgentError::FileDownloadFailed(format!(
                        "{} length mismatch: remote {file_size}, local {}",
                        local_path.display(),
                        metadata.len()
                    )));
                }
                tokio::fs::set_permissions(
                    local_path,
                    std::fs::Permissions::from_mode(0o600),
                )
                .await
                .map_err(|e| {
                    AgentError::FileDownloadFailed(format!(
                        "chmod {} failed: {e}",
                        local_path.display()
                    ))
                })
            }
        })
        .await?;
    }

    Ok(())
}

/// Splits a newline-separated listing into file names, moving header files to
/// the back so they are copied last.
fn order_files_header_last(listing: &str) -> Vec<String> {
    let (mut files, headers): (Vec<String>, Vec<String>) = listing
        .lines()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .partition(|name| !name.ends_with(".hdr"));
    files.extend(headers);
    files
}

/// Retries `f` up to [`DOWNLOAD_FILE_MAX_RETRY`] times, sleeping `i` seconds
/// after the `i`-th failure.
async fn with_linear_retry<T, F, Fut>(
    signature: Signature,
    what: &str,
    mut f: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= DOWNLOAD_FILE_MAX_RETRY {
                    return Err(e);
                }
                warn!(signature, attempt, "{what} failed, retrying: {e}");
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }
    }
}
