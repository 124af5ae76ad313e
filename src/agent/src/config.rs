// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use slate_agent_types::protocol::BackendIdent;

/// Configuration of the task agent.
///
/// Worker counts size the per-kind pools, intervals drive the periodic
/// reporters, and the transfer options parameterize the peer download
/// protocol and the external upload/restore tool. The embedding server
/// deserializes this from its own configuration file; every field has a
/// default.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    // Worker counts.
    pub create_table_worker_count: u32,
    pub drop_table_worker_count: u32,
    pub push_worker_count_normal_priority: u32,
    pub push_worker_count_high_priority: u32,
    pub delete_worker_count: u32,
    pub alter_table_worker_count: u32,
    pub clone_worker_count: u32,
    pub storage_medium_migrate_count: u32,
    pub cancel_delete_data_worker_count: u32,
    pub check_consistency_worker_count: u32,
    pub upload_worker_count: u32,
    pub restore_worker_count: u32,
    pub make_snapshot_worker_count: u32,
    pub release_snapshot_worker_count: u32,

    // Reporter intervals, in seconds.
    pub report_task_interval_seconds: u64,
    pub report_disk_state_interval_seconds: u64,
    pub report_olap_table_interval_seconds: u64,
    /// The short pause used by retry loops and heartbeat gating.
    pub sleep_one_second: u64,

    // Transfer options.
    pub download_low_speed_limit_kbps: u64,
    pub download_low_speed_time: u64,
    pub agent_tmp_dir: PathBuf,
    pub trans_file_tool_path: PathBuf,

    // Backend identity.
    pub be_port: u16,
    pub webserver_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            create_table_worker_count: 3,
            drop_table_worker_count: 3,
            push_worker_count_normal_priority: 3,
            push_worker_count_high_priority: 3,
            delete_worker_count: 3,
            alter_table_worker_count: 3,
            clone_worker_count: 3,
            storage_medium_migrate_count: 1,
            cancel_delete_data_worker_count: 3,
            check_consistency_worker_count: 1,
            upload_worker_count: 1,
            restore_worker_count: 1,
            make_snapshot_worker_count: 5,
            release_snapshot_worker_count: 5,
            report_task_interval_seconds: 10,
            report_disk_state_interval_seconds: 60,
            report_olap_table_interval_seconds: 60,
            sleep_one_second: 1,
            download_low_speed_limit_kbps: 50,
            download_low_speed_time: 300,
            agent_tmp_dir: PathBuf::from("./tmp"),
            trans_file_tool_path: PathBuf::from("./bin/trans_file_tool.sh"),
            be_port: 9060,
            webserver_port: 8040,
        }
    }
}

impl AgentConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_one_second)
    }

    pub fn report_task_interval(&self) -> Duration {
        Duration::from_secs(self.report_task_interval_seconds)
    }

    pub fn report_disk_state_interval(&self) -> Duration {
        Duration::from_secs(self.report_disk_state_interval_seconds)
    }

    pub fn report_tablet_interval(&self) -> Duration {
        Duration::from_secs(self.report_olap_table_interval_seconds)
    }

    /// This backend's network identity, as stamped into every report.
    pub fn backend_ident(&self, host: String) -> BackendIdent {
        BackendIdent {
            host,
            be_port: self.be_port,
            http_port: self.webserver_port,
        }
    }
}
