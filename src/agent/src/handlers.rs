// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-kind task handlers.
//!
//! A handler converts one dequeued [`TaskRequest`] into a [`FinishReport`].
//! Handlers never fail past their own report: every error from the storage
//! engine or a peer is folded into the report's status code and message list.
//! Registry removal is the worker loop's job, so no handler can skip it.

use tracing::{info, warn};

use slate_agent_types::protocol::{
    AlterTabletPayload, CancelDeletePayload, CheckConsistencyPayload, CreateTabletPayload,
    DropTabletPayload, FinishReport, PushPayload, PushType, ReleaseSnapshotPayload, Signature,
    SnapshotPayload, StorageMediumMigratePayload, TabletInfo, TaskKind, TaskPayload, TaskRequest,
    TaskStatus, TaskStatusCode,
};
use slate_agent_types::AgentError;

use crate::agent::TaskContext;
use crate::client::AlterState;

/// Pushes retry once on an internal (non-request) error.
const PUSH_MAX_RETRY: u32 = 1;

/// Runs the handler for `request` and builds its finish report.
pub(crate) async fn handle_task(ctx: &TaskContext, request: TaskRequest) -> FinishReport {
    let signature = request.signature;
    match request.payload {
        TaskPayload::CreateTablet(p) => create_tablet(ctx, signature, p).await,
        TaskPayload::DropTablet(p) => drop_tablet(ctx, signature, p).await,
        TaskPayload::SchemaChange(p) => {
            alter_tablet(ctx, signature, TaskKind::SchemaChange, p).await
        }
        TaskPayload::Rollup(p) => alter_tablet(ctx, signature, TaskKind::Rollup, p).await,
        TaskPayload::Push(p) => push(ctx, signature, p).await,
        TaskPayload::Clone(p) => crate::clone::handle_clone(ctx, signature, p).await,
        TaskPayload::StorageMediumMigrate(p) => storage_medium_migrate(ctx, signature, p).await,
        TaskPayload::CancelDelete(p) => cancel_delete(ctx, signature, p).await,
        TaskPayload::CheckConsistency(p) => check_consistency(ctx, signature, p).await,
        TaskPayload::MakeSnapshot(p) => make_snapshot(ctx, signature, p).await,
        TaskPayload::ReleaseSnapshot(p) => release_snapshot(ctx, signature, p).await,
        TaskPayload::Upload(p) => crate::transfer::upload(ctx, signature, p).await,
        TaskPayload::Restore(p) => crate::transfer::restore(ctx, signature, p).await,
    }
}

fn status_of(result: &Result<(), AgentError>, error_msgs: Vec<String>) -> TaskStatus {
    let code = match result {
        Ok(()) => TaskStatusCode::Ok,
        Err(e) => e.status_code(),
    };
    TaskStatus { code, error_msgs }
}

async fn create_tablet(
    ctx: &TaskContext,
    signature: Signature,
    request: CreateTabletPayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let result = ctx.engine.create_tablet(&request).await;
    match &result {
        Ok(()) => {
            ctx.report_version.bump();
        }
        Err(e) => {
            warn!(signature, tablet_id = request.tablet_id, "create tablet failed: {e}");
            error_msgs.push(format!("create tablet failed: {e}"));
        }
    }
    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::CreateTablet, signature);
    report.report_version = Some(ctx.report_version.current());
    report.status = status_of(&result, error_msgs);
    report
}

async fn drop_tablet(
    ctx: &TaskContext,
    signature: Signature,
    request: DropTabletPayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let result = ctx.engine.drop_tablet(&request).await;
    if let Err(e) = &result {
        warn!(signature, tablet_id = request.tablet_id, "drop tablet failed: {e}");
        error_msgs.push(format!("drop tablet failed: {e}"));
    }
    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::DropTablet, signature);
    report.status = status_of(&result, error_msgs);
    report
}

async fn alter_tablet(
    ctx: &TaskContext,
    signature: Signature,
    kind: TaskKind,
    request: AlterTabletPayload,
) -> FinishReport {
    let process_name = if kind == TaskKind::Rollup {
        "rollup"
    } else {
        "schema change"
    };
    info!(signature, process_name, base_tablet_id = request.base_tablet_id, "starting alter");

    let mut error_msgs = Vec::new();
    let mut result: Result<(), AgentError> = Ok(());

    // A failed prior alter leaves a half-built new tablet behind; it must go
    // before the alter can be retried.
    match ctx
        .engine
        .alter_state(request.base_tablet_id, request.base_schema_hash)
        .await
    {
        Ok(state) => {
            info!(signature, ?state, "prior alter state");
            if state == AlterState::Failed {
                let drop_request = DropTabletPayload {
                    tablet_id: request.new_tablet.tablet_id,
                    schema_hash: request.new_tablet.schema_hash,
                };
                if let Err(e) = ctx.engine.drop_tablet(&drop_request).await {
                    warn!(signature, "dropping leftover alter tablet failed: {e}");
                    error_msgs.push(format!("dropping leftover alter tablet failed: {e}"));
                    result = Err(e);
                }
            }
            if result.is_ok()
                && matches!(
                    state,
                    AlterState::Done | AlterState::Failed | AlterState::Waiting
                )
            {
                let run = match kind {
                    TaskKind::Rollup => ctx.engine.rollup(&request).await,
                    _ => ctx.engine.schema_change(&request).await,
                };
                if let Err(e) = run {
                    warn!(signature, "{process_name} failed: {e}");
                    error_msgs.push(format!("{process_name} failed: {e}"));
                    result = Err(e);
                }
            }
        }
        Err(e) => {
            warn!(signature, "fetching prior alter state failed: {e}");
            error_msgs.push(format!("fetching prior alter state failed: {e}"));
            result = Err(e);
        }
    }

    if result.is_ok() {
        ctx.report_version.bump();
        info!(signature, "{process_name} finished");
    }

    let mut report = FinishReport::new(ctx.backend.clone(), kind, signature);
    report.report_version = Some(ctx.report_version.current());

    if result.is_ok() {
        match ctx
            .engine
            .tablet_info(request.new_tablet.tablet_id, request.new_tablet.schema_hash)
            .await
        {
            Ok(info) => {
                report.finish_tablet_infos = Some(vec![info]);
                error_msgs.push(format!("{process_name} success"));
            }
            Err(e) => {
                warn!(
                    signature,
                    tablet_id = request.new_tablet.tablet_id,
                    "{process_name} success, but fetching new tablet info failed: {e}"
                );
                error_msgs.push(format!(
                    "{process_name} success, but fetching new tablet info failed: {e}"
                ));
                result = Err(e);
            }
        }
    }

    report.status = status_of(&result, error_msgs);
    report
}

async fn push(ctx: &TaskContext, signature: Signature, request: PushPayload) -> FinishReport {
    let result: Result<Vec<TabletInfo>, AgentError> = match request.push_type {
        PushType::Load | PushType::LoadDelete => match ctx.pusher.init(&request).await {
            Ok(()) => {
                let mut retries = 0;
                loop {
                    match ctx.pusher.process(&request).await {
                        Err(AgentError::Internal(e)) if retries < PUSH_MAX_RETRY => {
                            warn!(signature, "push internal error, retrying: {e}");
                            retries += 1;
                        }
                        other => break other,
                    }
                }
            }
            Err(e) => Err(e),
        },
        PushType::Delete => ctx.engine.delete_data(&request).await,
    };

    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::Push, signature);
    if request.push_type == PushType::Delete {
        report.request_version = Some(request.version);
        report.request_version_hash = Some(request.version_hash);
    }

    let mut error_msgs = Vec::new();
    let status = match result {
        Ok(infos) => {
            info!(signature, "push finished");
            error_msgs.push("push success".to_string());
            ctx.report_version.bump();
            report.finish_tablet_infos = Some(infos);
            status_of(&Ok(()), error_msgs)
        }
        Err(e) => {
            warn!(signature, "push failed: {e}");
            error_msgs.push(format!("push failed: {e}"));
            status_of(&Err(e), error_msgs)
        }
    };
    report.report_version = Some(ctx.report_version.current());
    report.status = status;
    report
}

async fn storage_medium_migrate(
    ctx: &TaskContext,
    signature: Signature,
    request: StorageMediumMigratePayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let result = ctx.engine.storage_medium_migrate(&request).await;
    match &result {
        Ok(()) => info!(signature, tablet_id = request.tablet_id, "storage medium migrated"),
        Err(e) => {
            warn!(signature, "storage medium migrate failed: {e}");
            error_msgs.push(format!("storage medium migrate failed: {e}"));
        }
    }
    let mut report =
        FinishReport::new(ctx.backend.clone(), TaskKind::StorageMediumMigrate, signature);
    report.status = status_of(&result, error_msgs);
    report
}

async fn cancel_delete(
    ctx: &TaskContext,
    signature: Signature,
    request: CancelDeletePayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let result = ctx.engine.cancel_delete(&request).await;
    match &result {
        Ok(()) => info!(signature, tablet_id = request.tablet_id, "cancel delete finished"),
        Err(e) => {
            warn!(signature, "cancel delete failed: {e}");
            error_msgs.push(format!("cancel delete failed: {e}"));
        }
    }
    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::CancelDelete, signature);
    report.status = status_of(&result, error_msgs);
    report
}

async fn check_consistency(
    ctx: &TaskContext,
    signature: Signature,
    request: CheckConsistencyPayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let mut checksum = 0u32;
    let result = match ctx
        .engine
        .compute_checksum(
            request.tablet_id,
            request.schema_hash,
            request.version,
            request.version_hash,
        )
        .await
    {
        Ok(c) => {
            info!(signature, checksum = c, "consistency check finished");
            checksum = c;
            Ok(())
        }
        Err(e) => {
            warn!(signature, "consistency check failed: {e}");
            error_msgs.push(format!("consistency check failed: {e}"));
            Err(e)
        }
    };
    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::CheckConsistency, signature);
    report.tablet_checksum = Some(i64::from(checksum));
    report.request_version = Some(request.version);
    report.request_version_hash = Some(request.version_hash);
    report.status = status_of(&result, error_msgs);
    report
}

async fn make_snapshot(
    ctx: &TaskContext,
    signature: Signature,
    request: SnapshotPayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::MakeSnapshot, signature);
    let result = match ctx.engine.make_snapshot(&request).await {
        Ok(snapshot_path) => {
            info!(
                signature,
                tablet_id = request.tablet_id,
                %snapshot_path,
                "made snapshot"
            );
            report.snapshot_path = Some(snapshot_path);
            Ok(())
        }
        Err(e) => {
            warn!(signature, tablet_id = request.tablet_id, "make snapshot failed: {e}");
            error_msgs.push(format!("make snapshot failed: {e}"));
            Err(e)
        }
    };
    report.status = status_of(&result, error_msgs);
    report
}

async fn release_snapshot(
    ctx: &TaskContext,
    signature: Signature,
    request: ReleaseSnapshotPayload,
) -> FinishReport {
    let mut error_msgs = Vec::new();
    let result = ctx.engine.release_snapshot(&request.snapshot_path).await;
    match &result {
        Ok(()) => info!(signature, snapshot_path = %request.snapshot_path, "released snapshot"),
        Err(e) => {
            warn!(signature, "release snapshot failed: {e}");
            error_msgs.push(format!("release snapshot failed: {e}"));
        }
    }
    let mut report = FinishReport::new(ctx.backend.clone(), TaskKind::ReleaseSnapshot, signature);
    report.status = status_of(&result, error_msgs);
    report
}
