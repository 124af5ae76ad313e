// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Upload and restore via the external transfer tool.
//!
//! Both handlers write the remote source properties to a uniquely named JSON
//! temp file, invoke the configured transfer script with an argv array, and
//! remove the temp file on every exit path. Restore additionally renames the
//! downloaded tablet files to the target tablet id and loads the header.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::process::Command;
use tracing::{info, warn};

use slate_agent_types::protocol::{
    FinishReport, RestorePayload, Signature, StorageMedium, TabletId, TaskKind, TaskStatus,
    TaskStatusCode, UploadPayload,
};
use slate_agent_types::AgentError;

use crate::agent::TaskContext;

/// A temp-file label unique enough across workers and retries: the worker's
/// task id (process id when outside a runtime) plus wall seconds, plus the
/// tablet id for restores.
fn transfer_label(tablet_id: Option<TabletId>) -> String {
    let worker = tokio::task::try_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| std::process::id().to_string());
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    match tablet_id {
        Some(tablet_id) => format!("{worker}_{seconds}_{tablet_id}"),
        None => format!("{worker}_{seconds}"),
    }
}

async fn write_info_file(
    ctx: &TaskContext,
    label: &str,
    properties: &std::collections::BTreeMap<String, String>,
) -> Result<PathBuf, AgentError> {
    tokio::fs::create_dir_all(&ctx.config.agent_tmp_dir)
        .await
        .map_err(|e| {
            AgentError::Internal(format!(
                "creating {} failed: {e}",
                ctx.config.agent_tmp_dir.display()
            ))
        })?;
    let info_file = ctx.config.agent_tmp_dir.join(label);
    let json = serde_json::to_vec(properties)
        .map_err(|e| AgentError::Internal(format!("serializing remote source info failed: {e}")))?;
    tokio::fs::write(&info_file, json).await.map_err(|e| {
        AgentError::Internal(format!(
            "writing remote source info to {} failed: {e}",
            info_file.display()
        ))
    })?;
    Ok(info_file)
}

async fn run_transfer_tool(
    ctx: &TaskContext,
    label: &str,
    direction: &str,
    local: &str,
    remote: &str,
    info_file: &Path,
    with_file_list: bool,
) -> Result<(), AgentError> {
    let mut command = Command::new("sh");
    command
        .arg(&ctx.config.trans_file_tool_path)
        .arg(label)
        .arg(direction)
        .arg(local)
        .arg(remote)
        .arg(info_file);
    if with_file_list {
        command.arg("file_list");
    }
    info!(
        tool = %ctx.config.trans_file_tool_path.display(),
        direction,
        local,
        remote,
        "running transfer tool"
    );
    let output = command
        .output()
        .await
        .map_err(|e| AgentError::Internal(format!("spawning transfer tool failed: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AgentError::Internal(format!(
            "transfer tool {direction} exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

pub(crate) async fn upload(
    ctx: &TaskContext,
    signature: Signature,
    request: UploadPayload,
) -> FinishReport {
    info!(signature, "starting upload");
    let mut error_msgs = Vec::new();
    let label = transfer_label(None);

    let result = match write_info_file(ctx, &label, &request.remote_source_properties).await {
        Ok(info_file) => {
            let _cleanup = scopeguard::guard(info_file.clone(), |path| {
                let _ = std::fs::remove_file(path);
            });
            let mut local = request.local_file_path.clone();
            if let Some(tablet_id) = request.tablet_id {
                local = format!("{local}/{tablet_id}");
            }
            run_transfer_tool(
                ctx,
                &label,
                "upload",
                &local,
                &request.remote_file_path,
                &info_file,
                true,
            )
            .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        warn!(signature, "upload failed: {e}");
        error_msgs.push(format!("upload failed: {e}"));
    } else {
        info!(signature, "upload finished");
    }

    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::Upload, signature);
    let code = match &result {
        Ok(()) => TaskStatusCode::Ok,
        Err(e) => e.status_code(),
    };
    report.status = TaskStatus { code, error_msgs };
    report
}

pub(crate) async fn restore(
    ctx: &TaskContext,
    signature: Signature,
    request: RestorePayload,
) -> FinishReport {
    info!(signature, tablet_id = request.tablet_id, "starting restore");
    let mut error_msgs = Vec::new();
    let label = transfer_label(Some(request.tablet_id));

    let result = match write_info_file(ctx, &label, &request.remote_source_properties).await {
        Ok(info_file) => {
            let _cleanup = scopeguard::guard(info_file.clone(), |path| {
                let _ = std::fs::remove_file(path);
            });
            restore_inner(ctx, signature, &request, &label, &info_file).await
        }
        Err(e) => Err(e),
    };

    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::Restore, signature);
    match result {
        Ok(()) => {
            info!(signature, tablet_id = request.tablet_id, "restore finished");
            ctx.report_version.bump();
            report.report_version = Some(ctx.report_version.current());
            match ctx
                .engine
                .tablet_info(request.tablet_id, request.schema_hash)
                .await
            {
                Ok(info) => report.finish_tablet_infos = Some(vec![info]),
                // The restore itself succeeded; a missing info only costs the
                // master its eager view of the tablet.
                Err(e) => warn!(
                    signature,
                    tablet_id = request.tablet_id,
                    "restore done, but fetching tablet info failed: {e}"
                ),
            }
            report.status = TaskStatus {
                code: TaskStatusCode::Ok,
                error_msgs,
            };
        }
        Err(e) => {
            warn!(signature, "restore failed: {e}");
            error_msgs.push(format!("restore failed: {e}"));
            report.status = TaskStatus {
                code: e.status_code(),
                error_msgs,
            };
        }
    }
    report
}

async fn restore_inner(
    ctx: &TaskContext,
    signature: Signature,
    request: &RestorePayload,
    label: &str,
    info_file: &Path,
) -> Result<(), AgentError> {
    let shard_root = ctx.engine.obtain_shard_path(StorageMedium::Hdd).await?;
    let local_dir = shard_root.join(request.tablet_id.to_string());
    let local = format!("{}/", local_dir.display());

    run_transfer_tool(
        ctx,
        label,
        "download",
        &local,
        &request.remote_file_path,
        info_file,
        false,
    )
    .await?;

    rename_restored_files(&local_dir, request.tablet_id).await?;

    ctx.engine
        .load_header(&shard_root, request.tablet_id, request.schema_hash)
        .await
        .map_err(|e| {
            warn!(signature, shard = %shard_root.display(), "load header failed: {e}");
            e
        })
}

/// The restored name for a downloaded tablet file, or `None` if the file is
/// not one the engine recognizes.
///
/// Data and index files are named `<tablet>_<rest>`; header files are named
/// `<tablet>.hdr`. Everything before the first separator is replaced by the
/// target tablet id.
pub(crate) fn restored_file_name(tablet_id: TabletId, file_name: &str) -> Option<String> {
    if file_name.len() <= 4 {
        return None;
    }
    let separator = if file_name.ends_with(".hdr") {
        '.'
    } else if file_name.ends_with(".idx") || file_name.ends_with(".dat") {
        '_'
    } else {
        return None;
    };
    let position = file_name.find(separator)?;
    Some(format!("{tablet_id}{}", &file_name[position..]))
}

async fn rename_restored_files(local_dir: &Path, tablet_id: TabletId) -> Result<(), AgentError> {
    let io_err = |what: &str, path: &Path, e: std::io::Error| {
        AgentError::Internal(format!("{what} {} failed: {e}", path.display()))
    };
    if !tokio::fs::try_exists(local_dir)
        .await
        .map_err(|e| io_err("checking", local_dir, e))?
    {
        return Ok(());
    }
    let mut pending = vec![local_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_err("reading", &dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("reading", &dir, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| io_err("stating", &path, e))?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(new_name) = restored_file_name(tablet_id, name) {
                if new_name != name {
                    let new_path = path.with_file_name(&new_name);
                    info!(from = %path.display(), to = %new_path.display(), "renaming restored file");
                    tokio::fs::rename(&path, &new_path)
                        .await
                        .map_err(|e| io_err("renaming", &path, e))?;
                }
            }
        }
    }
    Ok(())
}
