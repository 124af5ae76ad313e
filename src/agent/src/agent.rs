// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The agent handle.
//!
//! An [`Agent`] owns the process-wide task state (registry, report version,
//! master endpoint, disk event hub), one worker pool per task kind, and the
//! three periodic reporters. The embedding backend server constructs it with
//! its concrete service implementations and forwards every master-dispatched
//! task through [`Agent::submit_task`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use slate_agent_types::protocol::{BackendIdent, PushType, TaskPayload, TaskRequest};

use crate::client::{CgroupsMgr, MasterClient, MasterInfo, PeerClient, Pusher, StorageEngine};
use crate::config::AgentConfig;
use crate::download::FileDownloader;
use crate::pool::{PoolSpec, WorkerPool};
use crate::registry::{ReportVersion, TaskRegistry};
use crate::report::{self, DiskEventHub};
use crate::task::AbortOnDropHandle;

/// The concrete implementations of the agent's external collaborators.
pub struct AgentServices {
    pub master_client: Arc<dyn MasterClient>,
    pub peer_client: Arc<dyn PeerClient>,
    pub engine: Arc<dyn StorageEngine>,
    pub pusher: Arc<dyn Pusher>,
    pub downloader: Arc<dyn FileDownloader>,
    pub cgroups: Arc<dyn CgroupsMgr>,
}

/// Everything a worker or reporter needs, shared by reference.
pub(crate) struct TaskContext {
    pub config: AgentConfig,
    pub backend: BackendIdent,
    pub registry: Arc<TaskRegistry>,
    pub report_version: Arc<ReportVersion>,
    pub master: Arc<MasterInfo>,
    pub disk_events: Arc<DiskEventHub>,
    pub master_client: Arc<dyn MasterClient>,
    pub peer_client: Arc<dyn PeerClient>,
    pub engine: Arc<dyn StorageEngine>,
    pub pusher: Arc<dyn Pusher>,
    pub downloader: Arc<dyn FileDownloader>,
    pub cgroups: Arc<dyn CgroupsMgr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum PoolKind {
    CreateTablet,
    DropTablet,
    Push,
    Delete,
    Alter,
    Clone,
    StorageMediumMigrate,
    CancelDelete,
    CheckConsistency,
    Upload,
    Restore,
    MakeSnapshot,
    ReleaseSnapshot,
}

/// The backend task agent.
pub struct Agent {
    ctx: Arc<TaskContext>,
    pools: BTreeMap<PoolKind, WorkerPool>,
    reporters: Vec<AbortOnDropHandle<()>>,
}

impl Agent {
    /// Starts all worker pools and reporters. Workers idle until tasks are
    /// submitted; reporters idle until the first master heartbeat.
    pub fn start(config: AgentConfig, backend: BackendIdent, services: AgentServices) -> Agent {
        let ctx = Arc::new(TaskContext {
            config,
            backend,
            registry: Arc::new(TaskRegistry::new()),
            report_version: Arc::new(ReportVersion::new_at_startup()),
            master: Arc::new(MasterInfo::new()),
            disk_events: Arc::new(DiskEventHub::new()),
            master_client: services.master_client,
            peer_client: services.peer_client,
            engine: services.engine,
            pusher: services.pusher,
            downloader: services.downloader,
            cgroups: services.cgroups,
        });

        let config = &ctx.config;
        let pool_specs = [
            (
                PoolKind::CreateTablet,
                "create-tablet",
                PoolSpec::fifo(config.create_table_worker_count),
            ),
            (
                PoolKind::DropTablet,
                "drop-tablet",
                PoolSpec::fifo(config.drop_table_worker_count),
            ),
            (
                PoolKind::Push,
                "push",
                PoolSpec::fair(
                    config.push_worker_count_normal_priority
                        + config.push_worker_count_high_priority,
                    config.push_worker_count_high_priority,
                ),
            ),
            (
                PoolKind::Delete,
                "delete",
                PoolSpec::fair(config.delete_worker_count, 0),
            ),
            (
                PoolKind::Alter,
                "alter-tablet",
                PoolSpec::fifo(config.alter_table_worker_count),
            ),
            (
                PoolKind::Clone,
                "clone",
                PoolSpec::fifo(config.clone_worker_count),
            ),
            (
                PoolKind::StorageMediumMigrate,
                "storage-medium-migrate",
                PoolSpec::fifo(config.storage_medium_migrate_count),
            ),
            (
                PoolKind::CancelDelete,
                "cancel-delete",
                PoolSpec::fifo(config.cancel_delete_data_worker_count),
            ),
            (
                PoolKind::CheckConsistency,
                "check-consistency",
                PoolSpec::fifo(config.check_consistency_worker_count),
            ),
            (
                PoolKind::Upload,
                "upload",
                PoolSpec::fifo(config.upload_worker_count),
            ),
            (
                PoolKind::Restore,
                "restore",
                PoolSpec::fifo(config.restore_worker_count),
            ),
            (
                PoolKind::MakeSnapshot,
                "make-snapshot",
                PoolSpec::fifo(config.make_snapshot_worker_count),
            ),
            (
                PoolKind::ReleaseSnapshot,
                "release-snapshot",
                PoolSpec::fifo(config.release_snapshot_worker_count),
            ),
        ];
        let pools = pool_specs
            .into_iter()
            .map(|(kind, label, spec)| (kind, WorkerPool::start(label, spec, Arc::clone(&ctx))))
            .collect();

        let reporters = vec![
            report::spawn_task_reporter(Arc::clone(&ctx)),
            report::spawn_disk_reporter(Arc::clone(&ctx)),
            report::spawn_tablet_reporter(Arc::clone(&ctx)),
        ];

        info!(backend = %ctx.backend, "task agent started");
        Agent {
            ctx,
            pools,
            reporters,
        }
    }

    /// The shared master endpoint handle, for the heartbeat receiver.
    pub fn master_info(&self) -> Arc<MasterInfo> {
        Arc::clone(&self.ctx.master)
    }

    /// The disk event hub, for the storage engine to signal broken disks.
    pub fn disk_events(&self) -> Arc<DiskEventHub> {
        Arc::clone(&self.ctx.disk_events)
    }

    /// Routes one master-dispatched task to its pool. Returns `false` if the
    /// task was dropped as a duplicate.
    pub fn submit_task(&self, task: TaskRequest) -> bool {
        let pool_kind = match &task.payload {
            TaskPayload::CreateTablet(_) => PoolKind::CreateTablet,
            TaskPayload::DropTablet(_) => PoolKind::DropTablet,
            TaskPayload::SchemaChange(_) | TaskPayload::Rollup(_) => PoolKind::Alter,
            TaskPayload::Push(push) if push.push_type == PushType::Delete => PoolKind::Delete,
            TaskPayload::Push(_) => PoolKind::Push,
            TaskPayload::Clone(_) => PoolKind::Clone,
            TaskPayload::StorageMediumMigrate(_) => PoolKind::StorageMediumMigrate,
            TaskPayload::CancelDelete(_) => PoolKind::CancelDelete,
            TaskPayload::CheckConsistency(_) => PoolKind::CheckConsistency,
            TaskPayload::Upload(_) => PoolKind::Upload,
            TaskPayload::Restore(_) => PoolKind::Restore,
            TaskPayload::MakeSnapshot(_) => PoolKind::MakeSnapshot,
            TaskPayload::ReleaseSnapshot(_) => PoolKind::ReleaseSnapshot,
        };
        let Some(pool) = self.pools.get(&pool_kind) else {
            return false;
        };
        pool.submit(task)
    }

    /// Submits a batch of tasks, dropping duplicates individually.
    pub fn submit_tasks(&self, tasks: impl IntoIterator<Item = TaskRequest>) {
        for task in tasks {
            self.submit_task(task);
        }
    }

    /// Drains the agent: every pool stops accepting work, queued tasks are
    /// discarded, in-flight tasks run to completion, and the reporters stop.
    pub async fn shutdown(mut self) {
        for pool in self.pools.values_mut() {
            pool.shutdown().await;
        }
        self.reporters.clear();
        info!("task agent stopped");
    }
}
