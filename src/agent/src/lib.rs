// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Slate backend task agent.
//!
//! Every storage/compute node runs this engine to execute administrative work
//! items dispatched by the master: tablet lifecycle, data pushes, clones,
//! migrations, consistency checks, snapshots, and backup/restore. The agent
//! deduplicates re-sent work, schedules pushes fairly across users, reports
//! completions with bounded retry, and periodically pushes its task list,
//! disk inventory, and tablet inventory back to the master.
//!
//! The embedding backend server constructs an [`Agent`] with its concrete
//! [`StorageEngine`](client::StorageEngine), [`Pusher`](client::Pusher), and
//! RPC clients, then forwards every master-dispatched task through
//! [`Agent::submit_task`].

pub mod agent;
pub mod client;
pub mod config;
pub mod download;
pub mod registry;
pub mod report;
pub mod retry;
pub mod task;

mod clone;
mod handlers;
mod pool;
mod scheduler;
mod transfer;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentServices};
pub use config::AgentConfig;
pub use report::DiskEventHub;

pub use slate_agent_types::protocol;
pub use slate_agent_types::AgentError;
