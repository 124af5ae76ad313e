// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.

use std::future::Future;
use std::time::Duration;

/// Configures a bounded retry operation.
///
/// ```
/// use std::time::Duration;
/// use slate_agent::retry::Retry;
///
/// # async fn f() -> Result<(), ()> {
/// Retry::default()
///     .max_tries(3)
///     .initial_backoff(Duration::from_secs(1))
///     .retry_async(|state| async move {
///         if state.i == 0 { Err(()) } else { Ok(()) }
///     })
///     .await
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_tries: usize,
}

/// The state of an operation being retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// Zero-based attempt counter.
    pub i: usize,
    /// The backoff that will precede the next attempt, or `None` if this is
    /// the final attempt.
    pub next_backoff: Option<Duration>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: usize::MAX,
        }
    }
}

impl Retry {
    /// Sets the backoff before the second attempt.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Sets the multiplier applied to the backoff after every attempt.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Clamps the backoff to a maximum.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the total number of attempts, including the first.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max_tries must be at least one");
        self.max_tries = max_tries;
        self
    }

    /// Runs `f` until it succeeds or the attempt budget is exhausted,
    /// sleeping the configured backoff between attempts. Returns the last
    /// error on exhaustion.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.initial_backoff.min(self.clamp_backoff);
        let mut i = 0;
        loop {
            let last = i + 1 >= self.max_tries;
            let state = RetryState {
                i,
                next_backoff: (!last).then_some(backoff),
            };
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) if last => return Err(e),
                Err(_) => {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f64(self.factor).min(self.clamp_backoff);
                    i += 1;
                }
            }
        }
    }
}
