// Copyright 2025, The Driftsync Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Network error classification and category-specific retry with exponential
//! backoff and jitter. Both are pure aside from the jitter randomness.

mod categorize;

use std::{future::Future, time::Duration};

use driftsync_shutdown::ShutdownSignal;
use log::*;
use rand::Rng;
use thiserror::Error;

pub use categorize::{categorize_error, ErrorCategory};

const LOG_TARGET: &str = "comms::retry";

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("Operation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
    #[error("Operation cancelled")]
    Cancelled,
}

/// Retry behaviour for one error category.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Multiplicative jitter width in [0, 1].
    pub jitter: f64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Category-specific defaults.
    pub fn for_category(category: ErrorCategory) -> Self {
        use ErrorCategory::*;
        match category {
            ConnectionReset => Self {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                backoff_factor: 1.5,
                ..Default::default()
            },
            Timeout => Self {
                max_retries: 3,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                backoff_factor: 2.5,
                ..Default::default()
            },
            ConnectionRefused => Self {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_factor: 2.0,
                ..Default::default()
            },
            NetworkUnreachable | NetworkDown => Self {
                max_retries: 4,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(120),
                backoff_factor: 3.0,
                ..Default::default()
            },
            HostUnreachable => Self {
                max_retries: 4,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                backoff_factor: 2.0,
                ..Default::default()
            },
            Temporary | Authentication | Unknown => Self::default(),
        }
    }

    /// The delay before attempt `attempt + 1`. The exponential growth is
    /// capped at `max_delay` before jitter is applied.
    pub fn calculate_backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponential = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter == 0.0 {
            1.0
        } else {
            rng.gen_range(1.0 - jitter..=1.0 + jitter)
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// Call `operation` until it succeeds or the policy is exhausted, waiting the
/// backoff delay between attempts. A triggered shutdown signal aborts the
/// wait and returns `RetryError::Cancelled`.
pub async fn retry<F, Fut, T, E>(
    mut shutdown: ShutdownSignal,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        if shutdown.is_triggered() {
            return Err(RetryError::Cancelled);
        }
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if shutdown.is_triggered() {
                    return Err(RetryError::Cancelled);
                }
                if attempt >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last_error: err,
                    });
                }
                let delay = policy.calculate_backoff(attempt, &mut rand::thread_rng());
                debug!(
                    target: LOG_TARGET,
                    "Attempt {} failed: '{}'. Retrying in {:.1}s",
                    attempt + 1,
                    err,
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = shutdown.wait() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {},
                }
            },
        }
        attempt += 1;
    }
}
