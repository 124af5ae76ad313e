// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The task protocol between the master and a backend's task agent.
//!
//! The master dispatches [`TaskRequest`]s to every backend; the agent answers
//! each with a [`FinishReport`] and periodically pushes [`ReportRequest`]s
//! describing its task list, disk inventory, and tablet inventory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a tablet, a horizontal shard of a table.
pub type TabletId = i64;
/// Hash of a tablet's schema; `(TabletId, SchemaHash)` names a tablet replica.
pub type SchemaHash = i64;
/// A tablet data version.
pub type Version = i64;
/// Hash accompanying a [`Version`] to detect divergent histories.
pub type VersionHash = i64;
/// Master-generated 64-bit identifier uniquely naming a task submission.
pub type Signature = i64;

/// The network identity of a backend process.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendIdent {
    pub host: String,
    /// The backend's RPC port.
    pub be_port: u16,
    /// The backend's HTTP port, used by the peer download protocol.
    pub http_port: u16,
}

impl fmt::Display for BackendIdent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.be_port)
    }
}

/// The kind of a task, as the master names it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaskKind {
    CreateTablet,
    DropTablet,
    SchemaChange,
    Rollup,
    Push,
    /// Reserved for the master's bookkeeping. Data deletes travel as [`TaskKind::Push`]
    /// requests whose payload carries [`PushType::Delete`].
    Delete,
    Clone,
    StorageMediumMigrate,
    CancelDelete,
    CheckConsistency,
    MakeSnapshot,
    ReleaseSnapshot,
    Upload,
    Restore,
    // Internal kinds; these never flow through task submission.
    ReportTask,
    ReportDiskState,
    ReportTablet,
}

/// Dispatch priority of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    High,
}

/// The resource accounting identity a task runs under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub user: String,
}

/// Storage medium of a shard root path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMedium {
    Hdd,
    Ssd,
}

/// How a push request mutates the target tablet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushType {
    Load,
    LoadDelete,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTabletPayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub storage_medium: StorageMedium,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTabletPayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
}

/// A schema-change or rollup request. The new tablet is materialized next to
/// the base tablet and then backfilled by the storage engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTabletPayload {
    pub base_tablet_id: TabletId,
    pub base_schema_hash: SchemaHash,
    pub new_tablet: CreateTabletPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub version: Version,
    pub version_hash: VersionHash,
    pub push_type: PushType,
    /// Location of the batch to load, for `Load`/`LoadDelete` pushes.
    pub http_file_path: Option<String>,
    pub http_file_size: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonePayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    /// Source backends to copy from, tried in order until one succeeds.
    pub src_backends: Vec<BackendIdent>,
    pub storage_medium: StorageMedium,
    /// If set, the cloned tablet must not be older than this version.
    pub committed_version: Option<Version>,
    pub committed_version_hash: Option<VersionHash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMediumMigratePayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub storage_medium: StorageMedium,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDeletePayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub version: Version,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConsistencyPayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub version: Version,
    pub version_hash: VersionHash,
}

/// Also serves as the peer RPC request for remote snapshots during clone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSnapshotPayload {
    pub snapshot_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPayload {
    pub local_file_path: String,
    pub remote_file_path: String,
    /// Credentials and endpoint properties of the remote source, passed to the
    /// external transfer tool as a JSON file.
    pub remote_source_properties: BTreeMap<String, String>,
    pub tablet_id: Option<TabletId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePayload {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub remote_file_path: String,
    pub remote_source_properties: BTreeMap<String, String>,
}

/// The kind-specific payload of a [`TaskRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPayload {
    CreateTablet(CreateTabletPayload),
    DropTablet(DropTabletPayload),
    SchemaChange(AlterTabletPayload),
    Rollup(AlterTabletPayload),
    Push(PushPayload),
    Clone(ClonePayload),
    StorageMediumMigrate(StorageMediumMigratePayload),
    CancelDelete(CancelDeletePayload),
    CheckConsistency(CheckConsistencyPayload),
    MakeSnapshot(SnapshotPayload),
    ReleaseSnapshot(ReleaseSnapshotPayload),
    Upload(UploadPayload),
    Restore(RestorePayload),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::CreateTablet(_) => TaskKind::CreateTablet,
            TaskPayload::DropTablet(_) => TaskKind::DropTablet,
            TaskPayload::SchemaChange(_) => TaskKind::SchemaChange,
            TaskPayload::Rollup(_) => TaskKind::Rollup,
            TaskPayload::Push(_) => TaskKind::Push,
            TaskPayload::Clone(_) => TaskKind::Clone,
            TaskPayload::StorageMediumMigrate(_) => TaskKind::StorageMediumMigrate,
            TaskPayload::CancelDelete(_) => TaskKind::CancelDelete,
            TaskPayload::CheckConsistency(_) => TaskKind::CheckConsistency,
            TaskPayload::MakeSnapshot(_) => TaskKind::MakeSnapshot,
            TaskPayload::ReleaseSnapshot(_) => TaskKind::ReleaseSnapshot,
            TaskPayload::Upload(_) => TaskKind::Upload,
            TaskPayload::Restore(_) => TaskKind::Restore,
        }
    }
}

/// A work item dispatched by the master.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub signature: Signature,
    pub priority: Option<Priority>,
    pub resource_info: Option<ResourceInfo>,
    pub payload: TaskPayload,
}

impl TaskRequest {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    /// The submitting user, or the empty string if the master did not attach
    /// resource information.
    pub fn user(&self) -> &str {
        self.resource_info.as_ref().map_or("", |r| r.user.as_str())
    }

    pub fn priority(&self) -> Priority {
        self.priority.unwrap_or(Priority::Normal)
    }
}

/// Status code reported back to the master for a finished task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatusCode {
    Ok,
    /// The request itself was unusable; re-driving it verbatim cannot succeed.
    AnalysisError,
    /// The task failed for a reason internal to this backend.
    RuntimeError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub code: TaskStatusCode,
    /// Human-readable context. Never parsed by the master.
    pub error_msgs: Vec<String>,
}

impl TaskStatus {
    pub fn ok() -> Self {
        TaskStatus {
            code: TaskStatusCode::Ok,
            error_msgs: Vec::new(),
        }
    }
}

/// Identity and state of one tablet replica on this backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletInfo {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub version: Version,
    pub version_hash: VersionHash,
    pub row_count: i64,
    pub data_size: i64,
}

/// Capacity and health of one shard root path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub root_path: String,
    pub disk_total_capacity: i64,
    pub data_used_capacity: i64,
    pub disk_available_capacity: i64,
    pub is_used: bool,
}

/// Completion report for a single task, sent via `finish_task`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishReport {
    pub backend: BackendIdent,
    pub kind: TaskKind,
    pub signature: Signature,
    pub status: TaskStatus,
    pub report_version: Option<u64>,
    pub finish_tablet_infos: Option<Vec<TabletInfo>>,
    /// Widened 32-bit consistency checksum.
    pub tablet_checksum: Option<i64>,
    pub request_version: Option<Version>,
    pub request_version_hash: Option<VersionHash>,
    pub snapshot_path: Option<String>,
}

impl FinishReport {
    pub fn new(backend: BackendIdent, kind: TaskKind, signature: Signature) -> Self {
        FinishReport {
            backend,
            kind,
            signature,
            status: TaskStatus::ok(),
            report_version: None,
            finish_tablet_infos: None,
            tablet_checksum: None,
            request_version: None,
            request_version_hash: None,
            snapshot_path: None,
        }
    }
}

/// Periodic state report pushed to the master. Exactly one of `tasks`,
/// `disks`, or `tablets` is populated per report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub backend: BackendIdent,
    pub tasks: Option<BTreeMap<TaskKind, BTreeSet<Signature>>>,
    pub disks: Option<BTreeMap<String, DiskInfo>>,
    pub tablets: Option<Vec<TabletInfo>>,
    pub report_version: Option<u64>,
}

impl ReportRequest {
    pub fn new(backend: BackendIdent) -> Self {
        ReportRequest {
            backend,
            tasks: None,
            disks: None,
            tablets: None,
            report_version: None,
        }
    }
}

/// The master's answer to `finish_task` and `report`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterResult {
    pub status: TaskStatus,
}
