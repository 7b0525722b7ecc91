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
    time::{Duration, Instant},
};

use crate::{
    connection_manager::PeerConnection,
    types::{CloseReason, ConnectionId},
};

/// Connections that lived shorter than this are counted against a device's
/// stability.
pub const SHORT_LIVED_THRESHOLD: Duration = Duration::from_secs(5);

const HISTORY_CAPACITY: usize = 50;
const CHURN_WINDOW: Duration = Duration::from_secs(60);
const SHORT_LIVED_RECENCY: Duration = Duration::from_secs(120);

const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
struct ConnectionRecord {
    connection_id: ConnectionId,
    established: Instant,
    closed_at: Option<Instant>,
    duration: Option<Duration>,
    reason: Option<CloseReason>,
    priority: i32,
    health_score: f64,
}

impl ConnectionRecord {
    fn short_lived(&self) -> bool {
        self.duration.map(|d| d < SHORT_LIVED_THRESHOLD).unwrap_or(false)
    }
}

/// Per-device memory of how connections to the device have fared recently.
#[derive(Debug, Default)]
pub struct StabilityManager {
    history: VecDeque<ConnectionRecord>,
}

impl StabilityManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_established(&mut self, connection: &PeerConnection) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(ConnectionRecord {
            connection_id: connection.id().clone(),
            established: Instant::now() - connection.age(),
            closed_at: None,
            duration: None,
            reason: None,
            priority: connection.priority(),
            health_score: connection.health().health_score(),
        });
    }

    pub fn record_closed(&mut self, connection_id: &ConnectionId, reason: CloseReason, health_score: f64) {
        let now = Instant::now();
        if let Some(record) = self
            .history
            .iter_mut()
            .find(|r| &r.connection_id == connection_id && r.closed_at.is_none())
        {
            record.closed_at = Some(now);
            record.duration = Some(now.saturating_duration_since(record.established));
            record.reason = Some(reason);
            record.health_score = health_score;
        }
    }

    /// Stability score in [0, 100]:
    /// (1 − short-lived rate)·0.4 + normalized mean duration·0.3 +
    /// (1 − churn-per-minute/10)·0.3.
    pub fn stability_score(&self) -> f64 {
        let closed: Vec<&ConnectionRecord> = self.history.iter().filter(|r| r.closed_at.is_some()).collect();
        if closed.is_empty() {
            return 100.0;
        }

        let short_rate = closed.iter().filter(|r| r.short_lived()).count() as f64 / closed.len() as f64;
        let mean_duration_secs = closed
            .iter()
            .filter_map(|r| r.duration)
            .map(|d| d.as_secs_f64())
            .sum::<f64>() /
            closed.len() as f64;
        let duration_factor = (mean_duration_secs / 60.0).min(1.0);
        let now = Instant::now();
        let churn_per_minute = closed
            .iter()
            .filter(|r| {
                r.closed_at
                    .map(|at| now.saturating_duration_since(at) <= CHURN_WINDOW)
                    .unwrap_or(false)
            })
            .count() as f64;
        let churn_factor = (1.0 - churn_per_minute / 10.0).max(0.0);

        (100.0 * ((1.0 - short_rate) * 0.4 + duration_factor * 0.3 + churn_factor * 0.3)).clamp(0.0, 100.0)
    }

    /// A connection is stable once it has lived past the short-lived
    /// threshold with a passable health score.
    pub fn is_connection_stable(&self, connection: &PeerConnection) -> bool {
        connection.age() >= SHORT_LIVED_THRESHOLD && connection.health().health_score() > 50.0
    }

    /// Scale the configured base reconnect interval by the device's
    /// stability: stable devices redial at half the base, churning devices
    /// back off to twice the base. Clamped to [5s, 5min].
    pub fn adaptive_reconnect_interval(&self, base: Duration) -> Duration {
        let factor = 2.0 - 1.5 * (self.stability_score() / 100.0);
        let interval = Duration::from_secs_f64(base.as_secs_f64() * factor);
        interval.clamp(MIN_RECONNECT_INTERVAL, MAX_RECONNECT_INTERVAL)
    }

    /// Whether any connection to this device was recently short-lived. Used
    /// to push the device back in the dial queue.
    pub fn has_recent_short_lived(&self) -> bool {
        let now = Instant::now();
        self.history.iter().any(|r| {
            r.short_lived() &&
                r.closed_at
                    .map(|at| now.saturating_duration_since(at) <= SHORT_LIVED_RECENCY)
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::connection::build_test_connection;

    #[test]
    fn no_history_is_fully_stable() {
        let manager = StabilityManager::new();
        assert_eq!(manager.stability_score(), 100.0);
        assert!(!manager.has_recent_short_lived());
    }

    #[tokio::test]
    async fn short_lived_closures_reduce_score() {
        let mut manager = StabilityManager::new();
        for _ in 0..5 {
            let conn = build_test_connection(10);
            manager.record_established(&conn);
            manager.record_closed(conn.id(), CloseReason::Error, 20.0);
        }
        assert!(manager.stability_score() < 50.0, "score {}", manager.stability_score());
        assert!(manager.has_recent_short_lived());
    }

    #[tokio::test]
    async fn fresh_connection_is_not_stable() {
        let manager = StabilityManager::new();
        let conn = build_test_connection(10);
        assert!(!manager.is_connection_stable(&conn));
    }

    #[test]
    fn reconnect_interval_is_clamped() {
        let manager = StabilityManager::new();
        // Perfectly stable: half the base
        assert_eq!(
            manager.adaptive_reconnect_interval(Duration::from_secs(60)),
            Duration::from_secs(30)
        );
        assert_eq!(
            manager.adaptive_reconnect_interval(Duration::from_secs(2)),
            MIN_RECONNECT_INTERVAL
        );
        assert_eq!(
            manager.adaptive_reconnect_interval(Duration::from_secs(100_000)),
            MAX_RECONNECT_INTERVAL
        );
    }
}
