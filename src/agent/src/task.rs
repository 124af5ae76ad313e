// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task spawning helpers.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};

/// Spawns a named task onto the current runtime.
///
/// The name is computed lazily and recorded in the trace stream; the runtime
/// itself only attaches names under `tokio_unstable`.
pub fn spawn<N, F>(name: N, future: F) -> JoinHandle<F::Output>
where
    N: FnOnce() -> String,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name();
    tracing::debug!(task = %name, "spawning task");
    tokio::spawn(future)
}

/// A wrapper around a [`JoinHandle`] that aborts the task when dropped.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDropHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Converts the handle into one that aborts the task on drop.
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}
