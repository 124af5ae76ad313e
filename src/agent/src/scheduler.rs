// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The fair dequeue policy of the push/delete pools.
//!
//! Workers in those pools are partitioned into a high-priority lane and a
//! normal lane. High-lane workers only take requests marked high priority.
//! Normal-lane workers pick the queued request whose user is currently
//! under-represented: a user's share of running slots should not exceed their
//! share of outstanding work. The `running == 0` clause keeps every user with
//! queued work eligible, which rules out starvation.

use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use slate_agent_types::protocol::{Priority, TaskRequest};

use crate::registry::TaskRegistry;

/// The lane a worker was assigned at pool start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    High,
    Normal,
}

/// Selects the queue index the calling worker should dequeue, or `None` if
/// nothing is eligible for its lane (only possible for the high lane).
///
/// `pool_size` is the total worker count of the pool, the denominator of a
/// user's supply share.
pub fn pick_index(
    tasks: &VecDeque<TaskRequest>,
    lane: Lane,
    pool_size: u32,
    registry: &TaskRegistry,
) -> Option<usize> {
    match lane {
        Lane::High => tasks.iter().position(|t| t.priority() == Priority::High),
        Lane::Normal => {
            let mut improper_users = BTreeSet::new();
            for (index, task) in tasks.iter().enumerate() {
                let user = task.user();
                if improper_users.contains(user) {
                    continue;
                }
                let shares = registry.fair_shares(task.kind(), user);
                if shares.user_running == 0 {
                    return Some(index);
                }
                let demand = f64::from(shares.user_total) / f64::from(shares.total.max(1));
                let supply = f64::from(shares.user_running + 1) / f64::from(pool_size.max(1));
                debug!(
                    signature = task.signature,
                    user, demand, supply, "considering queued task"
                );
                if supply <= demand {
                    return Some(index);
                }
                improper_users.insert(user.to_string());
            }
            // Every queued user is over-represented; fall back to the head so
            // the pool never idles while work is queued.
            if tasks.is_empty() {
                None
            } else {
                Some(0)
            }
        }
    }
}
