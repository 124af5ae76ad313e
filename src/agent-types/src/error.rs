// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The agent error taxonomy.

use thiserror::Error;

use crate::protocol::TaskStatusCode;

/// Everything that can go wrong while executing a task.
///
/// Handlers never propagate these past their own bookkeeping; an error
/// becomes the status code and message list of the task's [`FinishReport`].
///
/// [`FinishReport`]: crate::protocol::FinishReport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// A clone found the target tablet already present locally. Reported as
    /// success: the master only cares that the replica exists.
    #[error("tablet already exists: {0}")]
    AlreadyExists(String),
    /// The request was malformed or referenced unusable state.
    #[error("malformed task request: {0}")]
    TaskRequest(String),
    /// The storage engine (or another internal collaborator) failed.
    #[error("internal error: {0}")]
    Internal(String),
    /// A peer file download failed, transport-wise or by size mismatch.
    #[error("file download failed: {0}")]
    FileDownloadFailed(String),
    /// An RPC to the master or a peer backend failed.
    #[error("rpc failure: {0}")]
    RpcFailure(String),
}

impl AgentError {
    /// The status code this error maps to in a finish report.
    pub fn status_code(&self) -> TaskStatusCode {
        match self {
            AgentError::AlreadyExists(_) => TaskStatusCode::Ok,
            AgentError::TaskRequest(_) => TaskStatusCode::AnalysisError,
            AgentError::Internal(_)
            | AgentError::FileDownloadFailed(_)
            | AgentError::RpcFailure(_) => TaskStatusCode::RuntimeError,
        }
    }
}
