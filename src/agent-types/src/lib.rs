// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared types for the Slate backend task agent.
//!
//! This crate holds the wire-level protocol spoken between a backend's task
//! agent and the master, as well as the agent's error taxonomy. It contains
//! no behavior beyond trivial accessors, so that both the agent engine and
//! the embedding backend server can depend on it without pulling in the
//! execution machinery.

pub mod error;
pub mod protocol;

pub use error::AgentError;
