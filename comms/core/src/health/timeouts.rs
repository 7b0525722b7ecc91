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

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

/// EWMA smoothing factor for the connection success rate.
const SUCCESS_RATE_ALPHA: f64 = 0.1;

#[derive(Debug)]
struct TimeoutState {
    /// Smoothed connection success rate, starting at an even 0.5.
    success_rate: f64,
    /// Consecutive failures per dial address.
    failures: HashMap<String, u32>,
}

/// Progressive dial and TLS-handshake timeouts, adjusted by success/failure
/// history. One per service, injected into dialers by their factories.
#[derive(Debug)]
pub struct AdaptiveTimeouts {
    state: Mutex<TimeoutState>,
}

impl AdaptiveTimeouts {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimeoutState {
                success_rate: 0.5,
                failures: HashMap::new(),
            }),
        }
    }

    /// `10s · (2 − rate)`, bounded to [5s, 60s].
    pub fn adaptive_tls_handshake_timeout(&self) -> Duration {
        let rate = self.state.lock().expect("timeouts lock poisoned").success_rate;
        clamp_secs(10.0 * (2.0 - rate), 5.0, 60.0)
    }

    /// `20s · (1 + 0.5 · failures(addr))`, bounded to [5s, 60s].
    pub fn progressive_dial_timeout(&self, address: &str) -> Duration {
        let failures = self
            .state
            .lock()
            .expect("timeouts lock poisoned")
            .failures
            .get(address)
            .copied()
            .unwrap_or(0);
        clamp_secs(20.0 * (1.0 + 0.5 * f64::from(failures)), 5.0, 60.0)
    }

    /// `60s · (2 − rate)`, bounded to [30s, 300s].
    pub fn adaptive_connection_loop_sleep(&self) -> Duration {
        let rate = self.state.lock().expect("timeouts lock poisoned").success_rate;
        clamp_secs(60.0 * (2.0 - rate), 30.0, 300.0)
    }

    pub fn record_connection_success(&self, address: &str) {
        let mut state = self.state.lock().expect("timeouts lock poisoned");
        state.success_rate = (1.0 - SUCCESS_RATE_ALPHA) * state.success_rate + SUCCESS_RATE_ALPHA;
        if let Some(failures) = state.failures.get_mut(address) {
            *failures = failures.saturating_sub(1);
            if *failures == 0 {
                state.failures.remove(address);
            }
        }
    }

    pub fn record_connection_failure(&self, address: &str) {
        let mut state = self.state.lock().expect("timeouts lock poisoned");
        state.success_rate = (1.0 - SUCCESS_RATE_ALPHA) * state.success_rate;
        *state.failures.entry(address.to_string()).or_insert(0) += 1;
    }

    #[cfg(test)]
    fn set_success_rate(&self, rate: f64) {
        self.state.lock().unwrap().success_rate = rate;
    }
}

impl Default for AdaptiveTimeouts {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_secs(secs: f64, min: f64, max: f64) -> Duration {
    Duration::from_secs_f64(secs.clamp(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_timeout_follows_success_rate() {
        let timeouts = AdaptiveTimeouts::new();
        // rate 0.5 → 15s, 0.3 → 17s, 0.9 → 11s
        for (rate, expected) in [(0.5, 15.0), (0.3, 17.0), (0.9, 11.0)] {
            timeouts.set_success_rate(rate);
            let got = timeouts.adaptive_tls_handshake_timeout().as_secs_f64();
            assert!((got - expected).abs() <= 2.0, "rate {} gave {}s", rate, got);
        }
    }

    #[test]
    fn tls_timeout_is_bounded() {
        let timeouts = AdaptiveTimeouts::new();
        timeouts.set_success_rate(0.0);
        assert!(timeouts.adaptive_tls_handshake_timeout() <= Duration::from_secs(60));
        timeouts.set_success_rate(1.0);
        assert!(timeouts.adaptive_tls_handshake_timeout() >= Duration::from_secs(5));
    }

    #[test]
    fn dial_timeout_grows_with_failures() {
        let timeouts = AdaptiveTimeouts::new();
        let addr = "tcp://198.51.100.1:22000";
        assert_eq!(timeouts.progressive_dial_timeout(addr), Duration::from_secs(20));
        timeouts.record_connection_failure(addr);
        assert_eq!(timeouts.progressive_dial_timeout(addr), Duration::from_secs(30));
        timeouts.record_connection_failure(addr);
        assert_eq!(timeouts.progressive_dial_timeout(addr), Duration::from_secs(40));
        // Caps at the upper bound
        for _ in 0..20 {
            timeouts.record_connection_failure(addr);
        }
        assert_eq!(timeouts.progressive_dial_timeout(addr), Duration::from_secs(60));
    }

    #[test]
    fn success_decrements_failures_never_below_zero() {
        let timeouts = AdaptiveTimeouts::new();
        let addr = "tcp://198.51.100.1:22000";
        timeouts.record_connection_failure(addr);
        timeouts.record_connection_success(addr);
        timeouts.record_connection_success(addr);
        assert_eq!(timeouts.progressive_dial_timeout(addr), Duration::from_secs(20));
    }

    #[test]
    fn success_rate_moves_toward_outcomes() {
        let timeouts = AdaptiveTimeouts::new();
        for _ in 0..50 {
            timeouts.record_connection_success("a");
        }
        let after_successes = timeouts.adaptive_tls_handshake_timeout();
        for _ in 0..100 {
            timeouts.record_connection_failure("a");
        }
        let after_failures = timeouts.adaptive_tls_handshake_timeout();
        assert!(after_failures > after_successes);
    }

    #[test]
    fn loop_sleep_bounds() {
        let timeouts = AdaptiveTimeouts::new();
        timeouts.set_success_rate(1.0);
        assert_eq!(timeouts.adaptive_connection_loop_sleep(), Duration::from_secs(60));
        timeouts.set_success_rate(0.0);
        assert_eq!(timeouts.adaptive_connection_loop_sleep(), Duration::from_secs(120));
    }
}
