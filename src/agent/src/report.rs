// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reporting to the master.
//!
//! The completion reporter delivers one [`FinishReport`] with bounded retry.
//! The three periodic reporters push the task list, the disk inventory, and
//! the tablet inventory on their configured intervals; the disk and tablet
//! reporters additionally wake early when the storage engine signals a broken
//! disk through the [`DiskEventHub`]. All three hold off until the first
//! master heartbeat has been observed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use slate_agent_types::protocol::{DiskInfo, FinishReport, ReportRequest};

use crate::agent::TaskContext;
use crate::client::MasterClient;
use crate::retry::Retry;
use crate::task::{self, AbortOnDropHandle, JoinHandleExt};

/// Attempts per finish report, including the first.
const TASK_FINISH_MAX_RETRY: usize = 3;

/// Delivers `report` to the master, retrying up to three times with a fixed
/// pause. An undeliverable report is dropped: the master re-drives the task
/// after seeing it in the periodic task report.
pub(crate) async fn finish_task(
    master_client: &dyn MasterClient,
    pause: Duration,
    report: &FinishReport,
) {
    let result = Retry::default()
        .max_tries(TASK_FINISH_MAX_RETRY)
        .initial_backoff(pause)
        .factor(1.0)
        .retry_async(|state| async move {
            match master_client.finish_task(report).await {
                Ok(result) => {
                    debug!(
                        signature = report.signature,
                        code = ?result.status.code,
                        "finish task reported"
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        signature = report.signature,
                        attempt = state.i,
                        "finish task report failed: {e}"
                    );
                    Err(e)
                }
            }
        })
        .await;
    if let Err(e) = result {
        warn!(signature = report.signature, "abandoning finish report: {e}");
    }
}

/// Wakeup channel between the storage engine and the disk/tablet reporters.
///
/// The engine broadcasts when a disk goes bad so the master learns about it
/// before the next timed report. Each reporter acknowledges the wakeup by
/// setting its `recently_reported` flag, which the engine consults to avoid
/// broadcasting again within the same interval.
#[derive(Debug, Default)]
pub struct DiskEventHub {
    broken: Notify,
    disk_state_reported: AtomicBool,
    tablet_inventory_reported: AtomicBool,
}

impl DiskEventHub {
    pub fn new() -> Self {
        DiskEventHub::default()
    }

    /// Wakes the disk and tablet reporters for an out-of-band report.
    pub fn broadcast_disk_failure(&self) {
        self.disk_state_reported.store(false, Ordering::SeqCst);
        self.tablet_inventory_reported.store(false, Ordering::SeqCst);
        self.broken.notify_waiters();
    }

    pub fn disk_state_recently_reported(&self) -> bool {
        self.disk_state_reported.load(Ordering::SeqCst)
    }

    pub fn tablet_inventory_recently_reported(&self) -> bool {
        self.tablet_inventory_reported.load(Ordering::SeqCst)
    }

    fn mark_disk_state_reported(&self) {
        self.disk_state_reported.store(true, Ordering::SeqCst);
    }

    fn mark_tablet_inventory_reported(&self) {
        self.tablet_inventory_reported.store(true, Ordering::SeqCst);
    }

    /// Waits for a broadcast or `duration`, whichever comes first. Returns
    /// whether a broadcast arrived.
    async fn wait(&self, duration: Duration) -> bool {
        tokio::time::timeout(duration, self.broken.notified())
            .await
            .is_ok()
    }
}

/// Waits until the first master heartbeat has been observed.
async fn await_master(ctx: &TaskContext) {
    while !ctx.master.is_ready() {
        debug!("waiting for the first master heartbeat");
        tokio::time::sleep(ctx.config.sleep_interval()).await;
    }
}

/// Periodically reports every known task signature.
pub(crate) fn spawn_task_reporter(ctx: Arc<TaskContext>) -> AbortOnDropHandle<()> {
    task::spawn(
        || "report-task".to_string(),
        async move {
            loop {
                await_master(&ctx).await;
                let mut request = ReportRequest::new(ctx.backend.clone());
                request.tasks = Some(ctx.registry.snapshot_signatures());
                match ctx.master_client.report(&request).await {
                    Ok(result) => debug!(code = ?result.status.code, "reported task list"),
                    Err(e) => warn!("reporting task list failed: {e}"),
                }
                tokio::time::sleep(ctx.config.report_task_interval()).await;
            }
        },
    )
    .abort_on_drop()
}

/// Periodically reports shard root path stats, keyed by root path.
pub(crate) fn spawn_disk_reporter(ctx: Arc<TaskContext>) -> AbortOnDropHandle<()> {
    task::spawn(
        || "report-disk-state".to_string(),
        async move {
            let wait = ctx.config.report_disk_state_interval();
            loop {
                await_master(&ctx).await;
                match ctx.engine.root_path_stats().await {
                    Ok(stats) => {
                        let disks: BTreeMap<String, DiskInfo> = stats
                            .into_iter()
                            .map(|disk| (disk.root_path.clone(), disk))
                            .collect();
                        let mut request = ReportRequest::new(ctx.backend.clone());
                        request.disks = Some(disks);
                        match ctx.master_client.report(&request).await {
                            Ok(result) => {
                                debug!(code = ?result.status.code, "reported disk state")
                            }
                            Err(e) => warn!("reporting disk state failed: {e}"),
                        }
                    }
                    Err(e) => warn!("collecting root path stats failed: {e}"),
                }
                if ctx.disk_events.wait(wait).await {
                    ctx.disk_events.mark_disk_state_reported();
                }
            }
        },
    )
    .abort_on_drop()
}

/// Periodically reports the full tablet inventory with the current report
/// version.
pub(crate) fn spawn_tablet_reporter(ctx: Arc<TaskContext>) -> AbortOnDropHandle<()> {
    task::spawn(
        || "report-tablet".to_string(),
        async move {
            let wait = ctx.config.report_tablet_interval();
            loop {
                await_master(&ctx).await;
                let mut request = ReportRequest::new(ctx.backend.clone());
                // Stamp the version before collecting, so the reported
                // version is never newer than the inventory it covers.
                request.report_version = Some(ctx.report_version.current());
                match ctx.engine.all_tablets().await {
                    Ok(tablets) => {
                        request.tablets = Some(tablets);
                        match ctx.master_client.report(&request).await {
                            Ok(result) => {
                                debug!(code = ?result.status.code, "reported tablet inventory")
                            }
                            Err(e) => warn!("reporting tablet inventory failed: {e}"),
                        }
                    }
                    Err(e) => warn!("collecting tablet inventory failed: {e}"),
                }
                if ctx.disk_events.wait(wait).await {
                    ctx.disk_events.mark_tablet_inventory_reported();
                }
            }
        },
    )
    .abort_on_drop()
}
