// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed worker pools.
//!
//! A pool is a fixed set of worker tasks draining one FIFO queue of
//! [`TaskRequest`]s. Submission deduplicates through the [`TaskRegistry`];
//! a worker runs the kind handler, sends the finish report, and unregisters
//! the task, so registry state always returns to baseline. The push/delete
//! pools replace the FIFO dequeue with the fair policy from
//! [`scheduler`](crate::scheduler).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slate_agent_types::protocol::TaskRequest;

use crate::agent::TaskContext;
use crate::registry::TaskRegistry;
use crate::scheduler::{self, Lane};
use crate::task;

/// Sizing of a pool.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolSpec {
    pub worker_count: u32,
    /// Number of workers assigned to the high-priority lane. Only meaningful
    /// for fair pools.
    pub high_priority_count: u32,
    /// Whether dequeues follow the fair push policy instead of FIFO.
    pub fair: bool,
}

impl PoolSpec {
    pub fn fifo(worker_count: u32) -> Self {
        PoolSpec {
            worker_count,
            high_priority_count: 0,
            fair: false,
        }
    }

    pub fn fair(worker_count: u32, high_priority_count: u32) -> Self {
        PoolSpec {
            worker_count,
            high_priority_count,
            fair: true,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    tasks: VecDeque<TaskRequest>,
    closed: bool,
}

#[derive(Debug, Default)]
struct TaskQueue {
    inner: Mutex<QueueInner>,
    added: Notify,
}

#[derive(Clone, Copy, Debug)]
struct DequeuePolicy {
    fair: bool,
    lane: Lane,
    pool_size: u32,
}

/// A fixed set of workers over one shared queue.
pub(crate) struct WorkerPool {
    label: &'static str,
    queue: Arc<TaskQueue>,
    registry: Arc<TaskRegistry>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the pool's workers eagerly. Workers live until
    /// [`shutdown`](WorkerPool::shutdown).
    pub fn start(label: &'static str, spec: PoolSpec, ctx: Arc<TaskContext>) -> WorkerPool {
        let queue = Arc::new(TaskQueue::default());
        let registry = Arc::clone(&ctx.registry);
        let mut workers = Vec::with_capacity(spec.worker_count as usize);
        for i in 0..spec.worker_count {
            let lane = if spec.fair && i < spec.high_priority_count {
                Lane::High
            } else {
                Lane::Normal
            };
            let policy = DequeuePolicy {
                fair: spec.fair,
                lane,
                pool_size: spec.worker_count,
            };
            let ctx = Arc::clone(&ctx);
            let queue = Arc::clone(&queue);
            workers.push(task::spawn(
                || format!("{label}-worker-{i}"),
                worker_loop(ctx, queue, policy),
            ));
        }
        WorkerPool {
            label,
            queue,
            registry,
            workers,
        }
    }

    /// Registers and enqueues a task. Returns `false` if the task was a
    /// duplicate or the pool is shutting down; either way the request is
    /// dropped silently (the master re-drives on its heartbeat cycle).
    pub fn submit(&self, task: TaskRequest) -> bool {
        let kind = task.kind();
        let signature = task.signature;
        let user = task.user().to_string();
        if !self.registry.try_insert(kind, signature, &user) {
            return false;
        }
        {
            let mut inner = self.queue.inner.lock().expect("lock poisoned");
            if inner.closed {
                drop(inner);
                warn!(pool = self.label, signature, "rejecting submit after shutdown");
                self.registry.remove(kind, signature, &user);
                return false;
            }
            inner.tasks.push_back(task);
            debug!(
                pool = self.label,
                signature,
                queued = inner.tasks.len(),
                "task enqueued"
            );
        }
        self.queue.added.notify_one();
        true
    }

    /// Closes the queue and joins the workers. Queued-but-unstarted requests
    /// are discarded and unregistered; in-flight tasks run to completion.
    pub async fn shutdown(&mut self) {
        let drained: Vec<TaskRequest> = {
            let mut inner = self.queue.inner.lock().expect("lock poisoned");
            inner.closed = true;
            inner.tasks.drain(..).collect()
        };
        for task in &drained {
            self.registry.remove(task.kind(), task.signature, task.user());
        }
        if !drained.is_empty() {
            info!(
                pool = self.label,
                discarded = drained.len(),
                "discarded queued tasks at shutdown"
            );
        }
        self.queue.added.notify_waiters();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(ctx: Arc<TaskContext>, queue: Arc<TaskQueue>, policy: DequeuePolicy) {
    while let Some(request) = dequeue(&ctx, &queue, policy).await {
        ctx.cgroups.apply_system_cgroup();
        let kind = request.kind();
        let signature = request.signature;
        let user = request.user().to_string();
        info!(?kind, signature, "starting task");
        let report = crate::handlers::handle_task(&ctx, request).await;
        crate::report::finish_task(&*ctx.master_client, ctx.config.sleep_interval(), &report).await;
        ctx.registry.remove(kind, signature, &user);
    }
}

enum Wait {
    /// Park until another task is enqueued.
    Enqueued,
    /// High lane found no high-priority work; pause briefly and rescan.
    HighRetry,
}

async fn dequeue(
    ctx: &TaskContext,
    queue: &TaskQueue,
    policy: DequeuePolicy,
) -> Option<TaskRequest> {
    loop {
        // Register interest before inspecting the queue so a concurrent
        // submit cannot slip between the check and the park.
        let notified = queue.added.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let wait = {
            let mut inner = queue.inner.lock().expect("lock poisoned");
            if inner.tasks.is_empty() {
                if inner.closed {
                    return None;
                }
                Wait::Enqueued
            } else if !policy.fair {
                return Some(inner.tasks.pop_front().expect("queue is nonempty"));
            } else {
                match scheduler::pick_index(
                    &inner.tasks,
                    policy.lane,
                    policy.pool_size,
                    &ctx.registry,
                ) {
                    Some(index) => {
                        let task = inner.tasks.remove(index).expect("index in bounds");
                        ctx.registry.mark_running(task.kind(), task.user());
                        return Some(task);
                    }
                    None => {
                        // Only normal-priority work is queued; wake a
                        // normal-lane worker to take it.
                        queue.added.notify_one();
                        Wait::HighRetry
                    }
                }
            }
        };
        match wait {
            Wait::Enqueued => notified.as_mut().await,
            Wait::HighRetry => tokio::time::sleep(ctx.config.sleep_interval()).await,
        }
    }
}
