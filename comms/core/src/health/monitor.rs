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
    collections::VecDeque,
    future::Future,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use log::*;

use crate::config::ConfigStore;

const LOG_TARGET: &str = "comms::health::monitor";

/// A connection is considered healthy above this score.
pub const HEALTHY_SCORE_THRESHOLD: f64 = 70.0;

const RING_CAPACITY: usize = 20;
const RECOMPUTE_INTERVAL: Duration = Duration::from_secs(10);

const WEIGHT_LATENCY: f64 = 0.3;
const WEIGHT_JITTER: f64 = 0.2;
const WEIGHT_LOSS: f64 = 0.2;
const WEIGHT_THROUGHPUT: f64 = 0.15;
const WEIGHT_BANDWIDTH: f64 = 0.15;

/// Snapshot of the current normalized metrics, consumed by convergence
/// scoring and status reporting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QualityMetrics {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub throughput_mbps: f64,
    pub bandwidth_mbps: f64,
    /// exp(−latency/30), in [0, 1].
    pub latency_score: f64,
    /// exp(−loss), in [0, 1].
    pub loss_score: f64,
    pub health_score: f64,
    pub stability: f64,
}

#[derive(Debug)]
struct MonitorState {
    latency_ms: VecDeque<f64>,
    loss_pct: VecDeque<f64>,
    throughput_mbps: VecDeque<f64>,
    bandwidth_mbps: VecDeque<f64>,
    jitter_ms: f64,
    stability: f64,
    score: f64,
    interval: Duration,
    established: Instant,
}

/// Per-connection health measurement. One per live connection; readers take a
/// shared lock, every mutation recomputes score and keep-alive interval under
/// the same lock that took the sample.
#[derive(Debug)]
pub struct HealthMonitor {
    config: Arc<ConfigStore>,
    state: RwLock<MonitorState>,
}

impl HealthMonitor {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let max = config.current().keep_alive_max();
        Self {
            config,
            state: RwLock::new(MonitorState {
                latency_ms: VecDeque::with_capacity(RING_CAPACITY),
                loss_pct: VecDeque::with_capacity(RING_CAPACITY),
                throughput_mbps: VecDeque::with_capacity(RING_CAPACITY),
                bandwidth_mbps: VecDeque::with_capacity(RING_CAPACITY),
                jitter_ms: 0.0,
                stability: 100.0,
                score: 50.0,
                interval: max,
                established: Instant::now(),
            }),
        }
    }

    pub fn record_latency(&self, latency: Duration) {
        let mut state = self.state.write().expect("health monitor lock poisoned");
        push_sample(&mut state.latency_ms, latency.as_secs_f64() * 1000.0);
        state.jitter_ms = mean_deviation(&state.latency_ms);
        self.recompute_locked(&mut state);
    }

    /// Record a one-way packet loss percentage observation and refresh the
    /// stability blend.
    pub fn record_packet_loss(&self, loss_pct: f64) {
        let mut state = self.state.write().expect("health monitor lock poisoned");
        push_sample(&mut state.loss_pct, loss_pct.max(0.0));
        let uptime_factor = (state.established.elapsed().as_secs_f64() / 600.0).min(1.0);
        let variance_factor = (1.0 - variance(&state.loss_pct) / 100.0).clamp(0.0, 1.0);
        state.stability = 100.0 * (0.7 * variance_factor + 0.3 * uptime_factor);
        self.recompute_locked(&mut state);
    }

    pub fn record_throughput(&self, mbps: f64) {
        let mut state = self.state.write().expect("health monitor lock poisoned");
        push_sample(&mut state.throughput_mbps, mbps.max(0.0));
        self.recompute_locked(&mut state);
    }

    pub fn record_bandwidth(&self, bytes_in: u64, bytes_out: u64, window: Duration) {
        if window.is_zero() {
            return;
        }
        let mbps = ((bytes_in + bytes_out) as f64 * 8.0) / window.as_secs_f64() / 1_000_000.0;
        let mut state = self.state.write().expect("health monitor lock poisoned");
        push_sample(&mut state.bandwidth_mbps, mbps);
        self.recompute_locked(&mut state);
    }

    /// The current adaptive keep-alive interval.
    pub fn interval(&self) -> Duration {
        self.state.read().expect("health monitor lock poisoned").interval
    }

    pub fn health_score(&self) -> f64 {
        self.state.read().expect("health monitor lock poisoned").score
    }

    pub fn is_healthy(&self) -> bool {
        self.health_score() > HEALTHY_SCORE_THRESHOLD
    }

    pub fn stability(&self) -> f64 {
        self.state.read().expect("health monitor lock poisoned").stability
    }

    pub fn quality_metrics(&self) -> QualityMetrics {
        let state = self.state.read().expect("health monitor lock poisoned");
        let latency_ms = mean(&state.latency_ms).unwrap_or_default();
        let loss_pct = mean(&state.loss_pct).unwrap_or_default();
        QualityMetrics {
            latency_ms,
            jitter_ms: state.jitter_ms,
            packet_loss_pct: loss_pct,
            throughput_mbps: mean(&state.throughput_mbps).unwrap_or_default(),
            bandwidth_mbps: mean(&state.bandwidth_mbps).unwrap_or_default(),
            latency_score: (-latency_ms / 30.0).exp(),
            loss_score: (-loss_pct).exp(),
            health_score: state.score,
            stability: state.stability,
        }
    }

    /// Force the health score, bypassing measurement. Test-only.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn set_health_score_for_test(&self, score: f64) {
        let mut state = self.state.write().expect("health monitor lock poisoned");
        state.score = score;
        let options = self.config.current();
        state.interval = keep_alive_interval(score, options.keep_alive_min(), options.keep_alive_max());
    }

    /// Recompute score and interval without a new sample.
    pub(crate) fn recompute(&self) {
        let mut state = self.state.write().expect("health monitor lock poisoned");
        self.recompute_locked(&mut state);
    }

    /// Periodic recomputation every 10s until `closed` resolves.
    pub(crate) fn spawn_ticker(self: Arc<Self>, closed: impl Future<Output = ()> + Send + 'static) {
        let monitor = self;
        tokio::spawn(async move {
            tokio::pin!(closed);
            let mut ticker = tokio::time::interval(RECOMPUTE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut closed => {
                        trace!(target: LOG_TARGET, "Health ticker stopped: connection closed");
                        break;
                    },
                    _ = ticker.tick() => {
                        monitor.recompute();
                    },
                }
            }
        });
    }

    fn recompute_locked(&self, state: &mut MonitorState) {
        let options = self.config.current();
        let min = options.keep_alive_min();
        let max = options.keep_alive_max();

        let no_samples = state.latency_ms.is_empty() &&
            state.loss_pct.is_empty() &&
            state.throughput_mbps.is_empty() &&
            state.bandwidth_mbps.is_empty();
        if no_samples {
            state.score = 50.0;
            state.interval = max;
            return;
        }

        // Absent metrics contribute a neutral factor
        let latency_factor = mean(&state.latency_ms).map(|ms| (-ms / 30.0).exp()).unwrap_or(0.5);
        let jitter_factor = if state.latency_ms.is_empty() {
            0.5
        } else {
            (-state.jitter_ms / 15.0).exp()
        };
        let loss_factor = mean(&state.loss_pct).map(|pct| (-pct).exp()).unwrap_or(0.5);
        let throughput_factor = mean(&state.throughput_mbps)
            .map(|mbps| (mbps / 100.0).clamp(0.0, 1.0))
            .unwrap_or(0.5);
        let bandwidth_factor = mean(&state.bandwidth_mbps)
            .map(|mbps| (mbps / 200.0).clamp(0.0, 1.0))
            .unwrap_or(0.5);

        state.score = (100.0 *
            (WEIGHT_LATENCY * latency_factor +
                WEIGHT_JITTER * jitter_factor +
                WEIGHT_LOSS * loss_factor +
                WEIGHT_THROUGHPUT * throughput_factor +
                WEIGHT_BANDWIDTH * bandwidth_factor))
            .clamp(0.0, 100.0);

        state.interval = if options.adaptive_keep_alive_enabled {
            keep_alive_interval(state.score, min, max)
        } else {
            max
        };
    }
}

/// Quadratic mapping from health score to keep-alive interval: a lower score
/// produces a more aggressive (shorter) interval. Output is always within
/// `[min, max]`.
pub fn keep_alive_interval(score: f64, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let normalized = (score / 100.0).clamp(0.0, 1.0);
    let range = max.as_secs_f64() - min.as_secs_f64();
    Duration::from_secs_f64(min.as_secs_f64() + range * normalized * normalized)
}

fn push_sample(ring: &mut VecDeque<f64>, sample: f64) {
    if ring.len() == RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(sample);
}

fn mean(ring: &VecDeque<f64>) -> Option<f64> {
    if ring.is_empty() {
        return None;
    }
    Some(ring.iter().sum::<f64>() / ring.len() as f64)
}

fn mean_deviation(ring: &VecDeque<f64>) -> f64 {
    match mean(ring) {
        Some(m) => ring.iter().map(|v| (v - m).abs()).sum::<f64>() / ring.len() as f64,
        None => 0.0,
    }
}

fn variance(ring: &VecDeque<f64>) -> f64 {
    match mean(ring) {
        Some(m) => ring.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / ring.len() as f64,
        None => 0.0,
    }
}
