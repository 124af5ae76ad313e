// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Contracts with the agent's external collaborators.
//!
//! The storage engine, the data pusher, the master RPC client, and the peer
//! RPC client are all owned by the embedding backend server; the agent sees
//! them only through these traits, and tests substitute fakes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use slate_agent_types::protocol::{
    AlterTabletPayload, BackendIdent, CancelDeletePayload, CreateTabletPayload, DiskInfo,
    DropTabletPayload, FinishReport, MasterResult, PushPayload, ReportRequest, SchemaHash,
    SnapshotPayload, StorageMedium, StorageMediumMigratePayload, TabletId, TabletInfo, Version,
    VersionHash,
};
use slate_agent_types::AgentError;

/// The master's RPC surface, as consumed by this agent.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn finish_task(&self, request: &FinishReport) -> Result<MasterResult, AgentError>;

    async fn report(&self, request: &ReportRequest) -> Result<MasterResult, AgentError>;
}

/// The agent RPC surface of a peer backend, as consumed during clone.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Asks `backend` to snapshot a tablet; returns the remote snapshot path.
    async fn make_snapshot(
        &self,
        backend: &BackendIdent,
        request: &SnapshotPayload,
    ) -> Result<String, AgentError>;

    async fn release_snapshot(
        &self,
        backend: &BackendIdent,
        snapshot_path: &str,
    ) -> Result<(), AgentError>;
}

/// Outcome of a previously attempted alter on a base tablet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlterState {
    Waiting,
    Running,
    Done,
    Failed,
}

/// The local storage engine, as consumed by the kind handlers.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn create_tablet(&self, request: &CreateTabletPayload) -> Result<(), AgentError>;

    async fn drop_tablet(&self, request: &DropTabletPayload) -> Result<(), AgentError>;

    async fn schema_change(&self, request: &AlterTabletPayload) -> Result<(), AgentError>;

    async fn rollup(&self, request: &AlterTabletPayload) -> Result<(), AgentError>;

    /// State of the most recent alter on `(tablet_id, schema_hash)`.
    async fn alter_state(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
    ) -> Result<AlterState, AgentError>;

    /// Applies a delete push and returns the affected tablets.
    async fn delete_data(&self, request: &PushPayload) -> Result<Vec<TabletInfo>, AgentError>;

    async fn cancel_delete(&self, request: &CancelDeletePayload) -> Result<(), AgentError>;

    /// Computes the 32-bit consistency checksum of a tablet version.
    async fn compute_checksum(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        version: Version,
        version_hash: VersionHash,
    ) -> Result<u32, AgentError>;

    async fn storage_medium_migrate(
        &self,
        request: &StorageMediumMigratePayload,
    ) -> Result<(), AgentError>;

    async fn make_snapshot(&self, request: &SnapshotPayload) -> Result<String, AgentError>;

    async fn release_snapshot(&self, snapshot_path: &str) -> Result<(), AgentError>;

    /// Whether the tablet exists locally.
    async fn has_tablet(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> bool;

    /// A local shard root path on the given storage medium, for a new tablet.
    async fn obtain_shard_path(&self, medium: StorageMedium) -> Result<PathBuf, AgentError>;

    /// Loads the header of a freshly copied tablet from a local shard root,
    /// making the tablet visible to the engine.
    async fn load_header(
        &self,
        shard_root: &Path,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
    ) -> Result<(), AgentError>;

    async fn tablet_info(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
    ) -> Result<TabletInfo, AgentError>;

    /// Stats for every shard root path, for the disk reporter.
    async fn root_path_stats(&self) -> Result<Vec<DiskInfo>, AgentError>;

    /// The full tablet inventory, for the tablet reporter.
    async fn all_tablets(&self) -> Result<Vec<TabletInfo>, AgentError>;
}

/// The data pusher that streams a batch load into a tablet.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn init(&self, request: &PushPayload) -> Result<(), AgentError>;

    async fn process(&self, request: &PushPayload) -> Result<Vec<TabletInfo>, AgentError>;
}

/// Resource-group registration for worker tasks.
pub trait CgroupsMgr: Send + Sync {
    /// Registers the calling worker with the system resource group so CPU
    /// accounting reflects which operation is running.
    fn apply_system_cgroup(&self);
}

/// A [`CgroupsMgr`] that does nothing, for tests and for deployments without
/// cgroup support.
#[derive(Debug, Default)]
pub struct DisabledCgroupsMgr;

impl CgroupsMgr for DisabledCgroupsMgr {
    fn apply_system_cgroup(&self) {}
}

#[derive(Debug, Default)]
struct MasterEndpoint {
    addr: Option<(String, u16)>,
    token: String,
}

/// Shared knowledge of the master, written by the heartbeat receiver.
///
/// Until the first heartbeat arrives the address is unset and the periodic
/// reporters hold off.
#[derive(Debug, Default)]
pub struct MasterInfo {
    endpoint: Mutex<MasterEndpoint>,
}

impl MasterInfo {
    pub fn new() -> Self {
        MasterInfo::default()
    }

    /// Records the master endpoint and cluster token from a heartbeat.
    pub fn observe_heartbeat(&self, host: String, port: u16, token: String) {
        let mut endpoint = self.endpoint.lock().expect("lock poisoned");
        endpoint.addr = Some((host, port));
        endpoint.token = token;
    }

    /// Whether at least one heartbeat has been received.
    pub fn is_ready(&self) -> bool {
        self.endpoint.lock().expect("lock poisoned").addr.is_some()
    }

    pub fn address(&self) -> Option<(String, u16)> {
        self.endpoint.lock().expect("lock poisoned").addr.clone()
    }

    /// The cluster token authenticating peer download URLs.
    pub fn token(&self) -> String {
        self.endpoint.lock().expect("lock poisoned").token.clone()
    }
}
