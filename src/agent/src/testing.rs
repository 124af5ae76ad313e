// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fake collaborators and request builders shared by the crate's tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use slate_agent_types::protocol::{
    AlterTabletPayload, BackendIdent, CancelDeletePayload, CheckConsistencyPayload,
    ClonePayload, CreateTabletPayload, DiskInfo, DropTabletPayload, FinishReport, MasterResult,
    Priority, PushPayload, PushType, ReleaseSnapshotPayload, ReportRequest, ResourceInfo,
    SchemaHash, Signature, SnapshotPayload, StorageMedium, StorageMediumMigratePayload, TabletId,
    TabletInfo, TaskKind, TaskPayload, TaskRequest, TaskStatus, Version, VersionHash,
};
use slate_agent_types::AgentError;

use crate::agent::{Agent, AgentServices, TaskContext};
use crate::client::{
    AlterState, DisabledCgroupsMgr, MasterClient, MasterInfo, PeerClient, Pusher, StorageEngine,
};
use crate::config::AgentConfig;
use crate::download::FileDownloader;
use crate::registry::{ReportVersion, TaskRegistry};
use crate::report::DiskEventHub;

/// Polls `cond` under virtual time until it holds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached in time");
}

/// A full set of fake collaborators plus the shared agent state.
pub(crate) struct TestHarness {
    pub config: AgentConfig,
    pub backend: BackendIdent,
    pub master: Arc<FakeMasterClient>,
    pub peer: Arc<FakePeerClient>,
    pub engine: Arc<FakeStorageEngine>,
    pub pusher: Arc<FakePusher>,
    pub downloader: Arc<FakeDownloader>,
    registry: Arc<TaskRegistry>,
    report_version: Arc<ReportVersion>,
    master_info: Arc<MasterInfo>,
    disk_events: Arc<DiskEventHub>,
    cgroups: Arc<DisabledCgroupsMgr>,
}

impl TestHarness {
    pub fn new() -> Self {
        TestHarness {
            config: AgentConfig::default(),
            backend: backend("localhost"),
            master: Arc::new(FakeMasterClient::default()),
            peer: Arc::new(FakePeerClient::default()),
            engine: Arc::new(FakeStorageEngine::default()),
            pusher: Arc::new(FakePusher::new()),
            downloader: Arc::new(FakeDownloader::default()),
            registry: Arc::new(TaskRegistry::new()),
            report_version: Arc::new(ReportVersion::starting_at(10_000)),
            master_info: Arc::new(MasterInfo::new()),
            disk_events: Arc::new(DiskEventHub::new()),
            cgroups: Arc::new(DisabledCgroupsMgr),
        }
    }

    /// A context over the harness's shared state and the current config.
    pub fn context(&self) -> Arc<TaskContext> {
        Arc::new(TaskContext {
            config: self.config.clone(),
            backend: self.backend.clone(),
            registry: Arc::clone(&self.registry),
            report_version: Arc::clone(&self.report_version),
            master: Arc::clone(&self.master_info),
            disk_events: Arc::clone(&self.disk_events),
            master_client: self.master.clone(),
            peer_client: self.peer.clone(),
            engine: self.engine.clone(),
            pusher: self.pusher.clone(),
            downloader: self.downloader.clone(),
            cgroups: self.cgroups.clone(),
        })
    }

    /// An [`Agent`] over the fakes and the current config. The agent owns its
    /// own registry and master state, independent of [`TestHarness::context`].
    pub fn start_agent(&self) -> Agent {
        Agent::start(
            self.config.clone(),
            self.backend.clone(),
            AgentServices {
                master_client: self.master.clone(),
                peer_client: self.peer.clone(),
                engine: self.engine.clone(),
                pusher: self.pusher.clone(),
                downloader: self.downloader.clone(),
                cgroups: self.cgroups.clone(),
            },
        )
    }
}

// Request builders. Tablets in tests use schema hash 7 unless stated.

pub(crate) fn backend(host: &str) -> BackendIdent {
    BackendIdent {
        host: host.to_string(),
        be_port: 9060,
        http_port: 8040,
    }
}

pub(crate) fn tablet_info(
    tablet_id: TabletId,
    schema_hash: SchemaHash,
    version: Version,
    version_hash: VersionHash,
) -> TabletInfo {
    TabletInfo {
        tablet_id,
        schema_hash,
        version,
        version_hash,
        row_count: 0,
        data_size: 0,
    }
}

pub(crate) fn disk_info(root_path: &str) -> DiskInfo {
    DiskInfo {
        root_path: root_path.to_string(),
        disk_total_capacity: 1 << 40,
        data_used_capacity: 1 << 30,
        disk_available_capacity: (1 << 40) - (1 << 30),
        is_used: true,
    }
}

fn request(signature: Signature, payload: TaskPayload) -> TaskRequest {
    TaskRequest {
        signature,
        priority: None,
        resource_info: None,
        payload,
    }
}

pub(crate) fn create_tablet_request(signature: Signature) -> TaskRequest {
    request(
        signature,
        TaskPayload::CreateTablet(CreateTabletPayload {
            tablet_id: signature,
            schema_hash: 7,
            storage_medium: StorageMedium::Hdd,
        }),
    )
}

pub(crate) fn schema_change_request(
    signature: Signature,
    base_tablet_id: TabletId,
    new_tablet_id: TabletId,
) -> TaskRequest {
    request(
        signature,
        TaskPayload::SchemaChange(AlterTabletPayload {
            base_tablet_id,
            base_schema_hash: 7,
            new_tablet: CreateTabletPayload {
                tablet_id: new_tablet_id,
                schema_hash: 7,
                storage_medium: StorageMedium::Hdd,
            },
        }),
    )
}

pub(crate) fn push_request(signature: Signature, user: &str) -> TaskRequest {
    push_request_with_priority(signature, user, Priority::Normal)
}

pub(crate) fn push_request_with_priority(
    signature: Signature,
    user: &str,
    priority: Priority,
) -> TaskRequest {
    TaskRequest {
        signature,
        priority: Some(priority),
        resource_info: Some(ResourceInfo {
            user: user.to_string(),
        }),
        payload: TaskPayload::Push(PushPayload {
            tablet_id: signature,
            schema_hash: 7,
            version: 1,
            version_hash: 1,
            push_type: PushType::Load,
            http_file_path: Some(format!("http://fe/load/{signature}")),
            http_file_size: Some(1024),
        }),
    }
}

pub(crate) fn delete_push_request(
    signature: Signature,
    tablet_id: TabletId,
    version: Version,
    version_hash: VersionHash,
) -> TaskRequest {
    request(
        signature,
        TaskPayload::Push(PushPayload {
            tablet_id,
            schema_hash: 7,
            version,
            version_hash,
            push_type: PushType::Delete,
            http_file_path: None,
            http_file_size: None,
        }),
    )
}

pub(crate) fn check_consistency_request(
    signature: Signature,
    tablet_id: TabletId,
    version: Version,
    version_hash: VersionHash,
) -> TaskRequest {
    request(
        signature,
        TaskPayload::CheckConsistency(CheckConsistencyPayload {
            tablet_id,
            schema_hash: 7,
            version,
            version_hash,
        }),
    )
}

pub(crate) fn make_snapshot_request(signature: Signature, tablet_id: TabletId) -> TaskRequest {
    request(
        signature,
        TaskPayload::MakeSnapshot(SnapshotPayload {
            tablet_id,
            schema_hash: 7,
        }),
    )
}

pub(crate) fn release_snapshot_request(signature: Signature, snapshot_path: &str) -> TaskRequest {
    request(
        signature,
        TaskPayload::ReleaseSnapshot(ReleaseSnapshotPayload {
            snapshot_path: snapshot_path.to_string(),
        }),
    )
}

pub(crate) fn migrate_request(
    signature: Signature,
    tablet_id: TabletId,
    storage_medium: StorageMedium,
) -> TaskRequest {
    request(
        signature,
        TaskPayload::StorageMediumMigrate(StorageMediumMigratePayload {
            tablet_id,
            schema_hash: 7,
            storage_medium,
        }),
    )
}

pub(crate) fn clone_payload(
    tablet_id: TabletId,
    schema_hash: SchemaHash,
    src_backends: Vec<BackendIdent>,
) -> ClonePayload {
    ClonePayload {
        tablet_id,
        schema_hash,
        src_backends,
        storage_medium: StorageMedium::Hdd,
        committed_version: None,
        committed_version_hash: None,
    }
}

pub(crate) fn finish_report(
    ctx: &TaskContext,
    kind: TaskKind,
    signature: Signature,
) -> FinishReport {
    FinishReport::new(ctx.backend.clone(), kind, signature)
}

fn ok_result() -> MasterResult {
    MasterResult {
        status: TaskStatus::ok(),
    }
}

/// Records master RPCs; `finish_task` can be scripted to fail.
#[derive(Default)]
pub(crate) struct FakeMasterClient {
    finish_attempts: AtomicUsize,
    fail_finish_times: AtomicUsize,
    finished: Mutex<Vec<FinishReport>>,
    reports: Mutex<Vec<ReportRequest>>,
}

impl FakeMasterClient {
    pub fn fail_finish(&self, times: usize) {
        self.fail_finish_times.store(times, Ordering::SeqCst);
    }

    pub fn finish_attempts(&self) -> usize {
        self.finish_attempts.load(Ordering::SeqCst)
    }

    pub fn finish_reports(&self) -> Vec<FinishReport> {
        self.finished.lock().unwrap().clone()
    }

    pub fn report_requests(&self) -> Vec<ReportRequest> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl MasterClient for FakeMasterClient {
    async fn finish_task(&self, request: &FinishReport) -> Result<MasterResult, AgentError> {
        self.finish_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_finish_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_finish_times.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::RpcFailure("injected finish failure".into()));
        }
        self.finished.lock().unwrap().push(request.clone());
        Ok(ok_result())
    }

    async fn report(&self, request: &ReportRequest) -> Result<MasterResult, AgentError> {
        self.reports.lock().unwrap().push(request.clone());
        Ok(ok_result())
    }
}

/// Records peer snapshot RPCs; snapshots can be scripted to fail per host.
#[derive(Default)]
pub(crate) struct FakePeerClient {
    fail_hosts: Mutex<BTreeSet<String>>,
    snapshot_calls: Mutex<Vec<String>>,
    release_calls: Mutex<Vec<(String, String)>>,
}

impl FakePeerClient {
    pub fn fail_snapshot_for(&self, host: &str) {
        self.fail_hosts.lock().unwrap().insert(host.to_string());
    }

    pub fn snapshot_calls(&self) -> Vec<String> {
        self.snapshot_calls.lock().unwrap().clone()
    }

    pub fn release_calls(&self) -> Vec<(String, String)> {
        self.release_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerClient for FakePeerClient {
    async fn make_snapshot(
        &self,
        backend: &BackendIdent,
        request: &SnapshotPayload,
    ) -> Result<String, AgentError> {
        self.snapshot_calls.lock().unwrap().push(backend.host.clone());
        if self.fail_hosts.lock().unwrap().contains(&backend.host) {
            return Err(AgentError::RpcFailure(format!(
                "injected snapshot failure on {}",
                backend.host
            )));
        }
        Ok(format!("/snapshots/{}", request.tablet_id))
    }

    async fn release_snapshot(
        &self,
        backend: &BackendIdent,
        snapshot_path: &str,
    ) -> Result<(), AgentError> {
        self.release_calls
            .lock()
            .unwrap()
            .push((backend.host.clone(), snapshot_path.to_string()));
        Ok(())
    }
}

/// An in-memory storage engine double.
#[derive(Default)]
pub(crate) struct FakeStorageEngine {
    fail_create: AtomicBool,
    fail_checksum: AtomicBool,
    fail_tablet_info: AtomicBool,
    fail_all_tablets_times: AtomicUsize,
    checksum: AtomicU32,
    created: Mutex<Vec<TabletId>>,
    dropped: Mutex<Vec<(TabletId, SchemaHash)>>,
    schema_changes: Mutex<Vec<TabletId>>,
    rollups: Mutex<Vec<TabletId>>,
    deletes: Mutex<Vec<TabletId>>,
    cancels: Mutex<Vec<TabletId>>,
    migrates: Mutex<Vec<TabletId>>,
    released: Mutex<Vec<String>>,
    load_headers: Mutex<Vec<(TabletId, SchemaHash)>>,
    alter_state: Mutex<AlterState>,
    tablets: Mutex<BTreeMap<(TabletId, SchemaHash), TabletInfo>>,
    shard_root: Mutex<Option<PathBuf>>,
    header_registers: Mutex<Option<TabletInfo>>,
    root_path_stats: Mutex<Vec<DiskInfo>>,
}

impl Default for AlterState {
    fn default() -> Self {
        AlterState::Done
    }
}

impl FakeStorageEngine {
    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn set_checksum(&self, checksum: u32) {
        self.checksum.store(checksum, Ordering::SeqCst);
    }

    pub fn fail_tablet_info(&self) {
        self.fail_tablet_info.store(true, Ordering::SeqCst);
    }

    pub fn set_alter_state(&self, state: AlterState) {
        *self.alter_state.lock().unwrap() = state;
    }

    pub fn put_tablet(&self, info: TabletInfo) {
        self.tablets
            .lock()
            .unwrap()
            .insert((info.tablet_id, info.schema_hash), info);
    }

    pub fn set_shard_root(&self, path: &Path) {
        *self.shard_root.lock().unwrap() = Some(path.to_path_buf());
    }

    /// Makes a later `load_header` insert `info` into the tablet map, the way
    /// the real engine makes a copied tablet visible.
    pub fn load_header_registers(&self, info: TabletInfo) {
        *self.header_registers.lock().unwrap() = Some(info);
    }

    pub fn set_root_path_stats(&self, stats: Vec<DiskInfo>) {
        *self.root_path_stats.lock().unwrap() = stats;
    }

    pub fn fail_all_tablets(&self, times: usize) {
        self.fail_all_tablets_times.store(times, Ordering::SeqCst);
    }

    pub fn created_tablets(&self) -> Vec<TabletId> {
        self.created.lock().unwrap().clone()
    }

    pub fn dropped_tablets(&self) -> Vec<(TabletId, SchemaHash)> {
        self.dropped.lock().unwrap().clone()
    }

    pub fn schema_changes(&self) -> Vec<TabletId> {
        self.schema_changes.lock().unwrap().clone()
    }

    pub fn delete_calls(&self) -> Vec<TabletId> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn migrate_calls(&self) -> Vec<TabletId> {
        self.migrates.lock().unwrap().clone()
    }

    pub fn released_snapshots(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn load_header_calls(&self) -> Vec<(TabletId, SchemaHash)> {
        self.load_headers.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageEngine for FakeStorageEngine {
    async fn create_tablet(&self, request: &CreateTabletPayload) -> Result<(), AgentError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AgentError::Internal("injected create failure".into()));
        }
        self.created.lock().unwrap().push(request.tablet_id);
        self.put_tablet(tablet_info(request.tablet_id, request.schema_hash, 1, 1));
        Ok(())
    }

    async fn drop_tablet(&self, request: &DropTabletPayload) -> Result<(), AgentError> {
        self.dropped
            .lock()
            .unwrap()
            .push((request.tablet_id, request.schema_hash));
        self.tablets
            .lock()
            .unwrap()
            .remove(&(request.tablet_id, request.schema_hash));
        Ok(())
    }

    async fn schema_change(&self, request: &AlterTabletPayload) -> Result<(), AgentError> {
        self.schema_changes
            .lock()
            .unwrap()
            .push(request.new_tablet.tablet_id);
        // The alter materializes the new tablet.
        self.put_tablet(tablet_info(
            request.new_tablet.tablet_id,
            request.new_tablet.schema_hash,
            1,
            1,
        ));
        Ok(())
    }

    async fn rollup(&self, request: &AlterTabletPayload) -> Result<(), AgentError> {
        self.rollups.lock().unwrap().push(request.new_tablet.tablet_id);
        self.put_tablet(tablet_info(
            request.new_tablet.tablet_id,
            request.new_tablet.schema_hash,
            1,
            1,
        ));
        Ok(())
    }

    async fn alter_state(
        &self,
        _tablet_id: TabletId,
        _schema_hash: SchemaHash,
    ) -> Result<AlterState, AgentError> {
        Ok(*self.alter_state.lock().unwrap())
    }

    async fn delete_data(&self, request: &PushPayload) -> Result<Vec<TabletInfo>, AgentError> {
        self.deletes.lock().unwrap().push(request.tablet_id);
        let tablets = self.tablets.lock().unwrap();
        Ok(tablets
            .get(&(request.tablet_id, request.schema_hash))
            .cloned()
            .into_iter()
            .collect())
    }

    async fn cancel_delete(&self, request: &CancelDeletePayload) -> Result<(), AgentError> {
        self.cancels.lock().unwrap().push(request.tablet_id);
        Ok(())
    }

    async fn compute_checksum(
        &self,
        _tablet_id: TabletId,
        _schema_hash: SchemaHash,
        _version: Version,
        _version_hash: VersionHash,
    ) -> Result<u32, AgentError> {
        if self.fail_checksum.load(Ordering::SeqCst) {
            return Err(AgentError::Internal("injected checksum failure".into()));
        }
        Ok(self.checksum.load(Ordering::SeqCst))
    }

    async fn storage_medium_migrate(
        &self,
        request: &StorageMediumMigratePayload,
    ) -> Result<(), AgentError> {
        self.migrates.lock().unwrap().push(request.tablet_id);
        Ok(())
    }

    async fn make_snapshot(&self, request: &SnapshotPayload) -> Result<String, AgentError> {
        Ok(format!("/local_snapshots/{}", request.tablet_id))
    }

    async fn release_snapshot(&self, snapshot_path: &str) -> Result<(), AgentError> {
        self.released.lock().unwrap().push(snapshot_path.to_string());
        Ok(())
    }

    async fn has_tablet(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> bool {
        self.tablets
            .lock()
            .unwrap()
            .contains_key(&(tablet_id, schema_hash))
    }

    async fn obtain_shard_path(&self, _medium: StorageMedium) -> Result<PathBuf, AgentError> {
        self.shard_root
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AgentError::Internal("no shard root configured".into()))
    }

    async fn load_header(
        &self,
        _shard_root: &Path,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
    ) -> Result<(), AgentError> {
        self.load_headers.lock().unwrap().push((tablet_id, schema_hash));
        if let Some(info) = self.header_registers.lock().unwrap().clone() {
            self.put_tablet(info);
        }
        Ok(())
    }

    async fn tablet_info(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
    ) -> Result<TabletInfo, AgentError> {
        if self.fail_tablet_info.load(Ordering::SeqCst) {
            return Err(AgentError::Internal("injected tablet info failure".into()));
        }
        self.tablets
            .lock()
            .unwrap()
            .get(&(tablet_id, schema_hash))
            .cloned()
            .ok_or_else(|| {
                AgentError::Internal(format!("tablet {tablet_id}/{schema_hash} not found"))
            })
    }

    async fn root_path_stats(&self) -> Result<Vec<DiskInfo>, AgentError> {
        Ok(self.root_path_stats.lock().unwrap().clone())
    }

    async fn all_tablets(&self) -> Result<Vec<TabletInfo>, AgentError> {
        let remaining = self.fail_all_tablets_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_all_tablets_times.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::Internal("injected inventory failure".into()));
        }
        Ok(self.tablets.lock().unwrap().values().cloned().collect())
    }
}

/// A pusher whose `process` can be gated (to observe scheduling order) or
/// scripted to fail.
pub(crate) struct FakePusher {
    holding: AtomicBool,
    gate: Semaphore,
    started: Mutex<Vec<TabletId>>,
    process_calls: AtomicUsize,
    fail_process_times: AtomicUsize,
}

impl FakePusher {
    pub fn new() -> Self {
        FakePusher {
            holding: AtomicBool::new(false),
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            process_calls: AtomicUsize::new(0),
            fail_process_times: AtomicUsize::new(0),
        }
    }

    /// Makes every `process` call block until [`release`](Self::release).
    pub fn hold(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn started(&self) -> Vec<TabletId> {
        self.started.lock().unwrap().clone()
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn fail_process(&self, times: usize) {
        self.fail_process_times.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl Pusher for FakePusher {
    async fn init(&self, _request: &PushPayload) -> Result<(), AgentError> {
        Ok(())
    }

    async fn process(&self, request: &PushPayload) -> Result<Vec<TabletInfo>, AgentError> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(request.tablet_id);
        if self.holding.load(Ordering::SeqCst) {
            self.gate
                .acquire()
                .await
                .expect("gate semaphore closed")
                .forget();
        }
        let remaining = self.fail_process_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_process_times.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::Internal("injected push failure".into()));
        }
        Ok(vec![tablet_info(request.tablet_id, request.schema_hash, request.version, request.version_hash)])
    }
}

/// Serves an in-memory file set through the download protocol and records
/// every URL requested.
#[derive(Default)]
pub(crate) struct FakeDownloader {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
    lie_about_length: AtomicBool,
}

impl FakeDownloader {
    pub fn put_file(&self, name: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(name.to_string(), bytes);
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Makes length probes overstate every file by one byte, so verification
    /// fails.
    pub fn lie_about_length(&self) {
        self.lie_about_length.store(true, Ordering::SeqCst);
    }

    fn file_param(url: &str) -> &str {
        url.split("&file=").nth(1).unwrap_or("")
    }

    fn file_name(url: &str) -> String {
        Self::file_param(url)
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string()
    }

    fn lookup(&self, url: &str) -> Result<Vec<u8>, AgentError> {
        let name = Self::file_name(url);
        self.files
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| AgentError::FileDownloadFailed(format!("{name} not on fake peer")))
    }
}

#[async_trait]
impl FileDownloader for FakeDownloader {
    async fn list_remote_dir(&self, url: &str, _timeout: Duration) -> Result<String, AgentError> {
        self.requests.lock().unwrap().push(url.to_string());
        let files = self.files.lock().unwrap();
        let mut listing = files.keys().cloned().collect::<Vec<_>>().join("\n");
        listing.push('\n');
        Ok(listing)
    }

    async fn get_length(&self, url: &str, _timeout: Duration) -> Result<u64, AgentError> {
        self.requests.lock().unwrap().push(url.to_string());
        let length = self.lookup(url)?.len() as u64;
        if self.lie_about_length.load(Ordering::SeqCst) {
            Ok(length + 1)
        } else {
            Ok(length)
        }
    }

    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        _timeout: Duration,
    ) -> Result<(), AgentError> {
        self.requests.lock().unwrap().push(url.to_string());
        let bytes = self.lookup(url)?;
        tokio::fs::write(local_path, bytes)
            .await
            .map_err(|e| AgentError::FileDownloadFailed(format!("local write failed: {e}")))?;
        Ok(())
    }
}
