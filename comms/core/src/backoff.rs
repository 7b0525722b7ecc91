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

use std::time::Duration;

pub trait Backoff {
    fn calculate_backoff(&self, attempts: usize) -> Duration;
}

/// The same delay for every attempt.
#[derive(Clone, Debug)]
pub struct ConstantBackoff(Duration);

impl ConstantBackoff {
    pub fn new(timeout: Duration) -> Self {
        Self(timeout)
    }
}

impl Backoff for ConstantBackoff {
    fn calculate_backoff(&self, _: usize) -> Duration {
        self.0
    }
}

/// `base · factor^(attempts − 1)`, capped at `max`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    factor: f64,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self { base, factor, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

impl Backoff for ExponentialBackoff {
    fn calculate_backoff(&self, attempts: usize) -> Duration {
        if attempts == 0 {
            return Duration::from_secs(0);
        }
        let delay = self.base.as_secs_f64() * self.factor.powi(attempts as i32 - 1);
        self.max.min(Duration::from_secs_f64(delay))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_backoff() {
        let backoff = ConstantBackoff::new(Duration::from_secs(2));
        assert_eq!(backoff.calculate_backoff(1), Duration::from_secs(2));
        assert_eq!(backoff.calculate_backoff(10), Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff_caps_at_max() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(60));
        assert_eq!(backoff.calculate_backoff(0), Duration::from_secs(0));
        assert_eq!(backoff.calculate_backoff(1), Duration::from_secs(1));
        assert_eq!(backoff.calculate_backoff(4), Duration::from_secs(8));
        assert_eq!(backoff.calculate_backoff(100), Duration::from_secs(60));
    }
}
