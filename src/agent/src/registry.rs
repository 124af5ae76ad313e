// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Process-wide task bookkeeping.
//!
//! The [`TaskRegistry`] deduplicates re-sent work by `(kind, signature)` and
//! maintains the per-user counters the fair push scheduler reads. The
//! [`ReportVersion`] is the monotonic counter attached to reports so the
//! master can discard stale state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use slate_agent_types::protocol::{Signature, TaskKind};

/// Counters the fair scheduler samples for one `(kind, user)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FairShareSample {
    /// Tasks of this kind known for the user (queued or running).
    pub user_total: u32,
    /// Tasks of this kind known agent-wide.
    pub total: u32,
    /// Tasks of this kind the user has in flight.
    pub user_running: u32,
}

#[derive(Debug, Default)]
struct SignatureState {
    /// Every signature currently known to the agent, queued or running.
    seen: BTreeMap<TaskKind, BTreeSet<Signature>>,
    /// Demand denominator: total known tasks per user, tracked for `Push` only.
    total_per_user: BTreeMap<TaskKind, BTreeMap<String, u32>>,
    total: BTreeMap<TaskKind, u32>,
}

/// Dedup set and fairness counters, shared by every pool.
///
/// An entry lives from a successful [`try_insert`](TaskRegistry::try_insert)
/// until the matching [`remove`](TaskRegistry::remove); the worker loop calls
/// `remove` on every exit path, so the registry returns to the exact state
/// that would exist had the task never been submitted.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    signatures: Mutex<SignatureState>,
    /// Supply numerator: in-flight tasks per user, tracked for `Push` only.
    /// A separate lock so `mark_running` can be called from inside the
    /// scheduler without re-entering the signatures lock.
    running: Mutex<BTreeMap<TaskKind, BTreeMap<String, u32>>>,
}

fn tracks_users(kind: TaskKind) -> bool {
    kind == TaskKind::Push
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry::default()
    }

    /// Records a task. Returns `false` if the signature is already known, in
    /// which case the caller must drop the request without enqueueing it.
    pub fn try_insert(&self, kind: TaskKind, signature: Signature, user: &str) -> bool {
        let mut state = self.signatures.lock().expect("lock poisoned");
        let signature_set = state.seen.entry(kind).or_default();
        if !signature_set.insert(signature) {
            info!(?kind, signature, "task already registered, dropping");
            return false;
        }
        if tracks_users(kind) {
            *state
                .total_per_user
                .entry(kind)
                .or_default()
                .entry(user.to_string())
                .or_insert(0) += 1;
            *state.total.entry(kind).or_insert(0) += 1;
        }
        true
    }

    /// Marks one task of the given kind as in flight for `user`.
    pub fn mark_running(&self, kind: TaskKind, user: &str) {
        if !tracks_users(kind) {
            return;
        }
        let mut running = self.running.lock().expect("lock poisoned");
        *running
            .entry(kind)
            .or_default()
            .entry(user.to_string())
            .or_insert(0) += 1;
    }

    /// Erases a task. `user` must be the user passed to `try_insert`.
    ///
    /// Counters saturate at zero: a remove that does not match a prior insert
    /// must not be able to drive them negative.
    pub fn remove(&self, kind: TaskKind, signature: Signature, user: &str) {
        let mut state = self.signatures.lock().expect("lock poisoned");
        let removed = state
            .seen
            .get_mut(&kind)
            .map_or(false, |set| set.remove(&signature));
        debug_assert!(removed, "removing unknown task {kind:?}/{signature}");
        if tracks_users(kind) {
            if let Some(per_user) = state.total_per_user.get_mut(&kind) {
                decrement(per_user, user);
            }
            if let Some(total) = state.total.get_mut(&kind) {
                *total = total.saturating_sub(1);
            }
            drop(state);
            let mut running = self.running.lock().expect("lock poisoned");
            if let Some(per_user) = running.get_mut(&kind) {
                decrement(per_user, user);
            }
        }
    }

    /// Samples the counters the fair scheduler compares for a candidate task.
    pub fn fair_shares(&self, kind: TaskKind, user: &str) -> FairShareSample {
        let state = self.signatures.lock().expect("lock poisoned");
        let user_total = state
            .total_per_user
            .get(&kind)
            .and_then(|m| m.get(user))
            .copied()
            .unwrap_or(0);
        let total = state.total.get(&kind).copied().unwrap_or(0);
        drop(state);
        let running = self.running.lock().expect("lock poisoned");
        let user_running = running
            .get(&kind)
            .and_then(|m| m.get(user))
            .copied()
            .unwrap_or(0);
        FairShareSample {
            user_total,
            total,
            user_running,
        }
    }

    /// Deep copy of the known signatures, for the task reporter.
    pub fn snapshot_signatures(&self) -> BTreeMap<TaskKind, BTreeSet<Signature>> {
        self.signatures.lock().expect("lock poisoned").seen.clone()
    }

    /// Whether the given signature is currently known.
    pub fn contains(&self, kind: TaskKind, signature: Signature) -> bool {
        self.signatures
            .lock()
            .expect("lock poisoned")
            .seen
            .get(&kind)
            .map_or(false, |set| set.contains(&signature))
    }
}

fn decrement(per_user: &mut BTreeMap<String, u32>, user: &str) {
    if let Some(count) = per_user.get_mut(user) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            per_user.remove(user);
        }
    }
}

/// Monotonic version counter attached to reports.
///
/// Seeded at startup to wall seconds × 10000 so that a restarted agent never
/// reports a version the master has already seen from the previous process.
#[derive(Debug)]
pub struct ReportVersion(AtomicU64);

impl ReportVersion {
    pub fn new_at_startup() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        ReportVersion(AtomicU64::new(seconds * 10_000))
    }

    #[cfg(test)]
    pub(crate) fn starting_at(version: u64) -> Self {
        ReportVersion(AtomicU64::new(version))
    }

    /// Bumps the version after an operation that changed local tablet state.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
