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

use std::time::{Duration, Instant};

use crate::{config::Options, connection_manager::PeerConnection};

/// Score improvement required when priorities do not differ.
const SCORE_IMPROVEMENT_MARGIN: f64 = 20.0;

/// Minimum-dwell policy: a device's connection may only be replaced once it
/// has been established for the configured age, the previous replacement is
/// old enough, and the candidate improves on it by a real margin.
#[derive(Debug)]
pub struct HysteresisController {
    min_dwell: Duration,
    priority_margin: i32,
    last_switch: Option<Instant>,
}

impl HysteresisController {
    pub fn new(min_dwell: Duration, priority_margin: i32) -> Self {
        Self {
            min_dwell,
            priority_margin,
            last_switch: None,
        }
    }

    pub fn from_options(options: &Options) -> Self {
        Self::new(
            options.connection_replacement_age_threshold,
            options.connection_replacement_priority_threshold,
        )
    }

    /// Whether `candidate` may replace `existing`.
    pub fn should_switch_connection(&self, existing: &PeerConnection, candidate: &PeerConnection) -> bool {
        if existing.age() < self.min_dwell {
            return false;
        }
        if let Some(last) = self.last_switch {
            if last.elapsed() < self.min_dwell {
                return false;
            }
        }
        let priority_improvement = existing.priority() - candidate.priority();
        if priority_improvement >= self.priority_margin {
            return true;
        }
        // Equal transports compete on measured quality instead
        priority_improvement >= 0 &&
            candidate.health().health_score() - existing.health().health_score() >= SCORE_IMPROVEMENT_MARGIN
    }

    pub fn record_switch(&mut self) {
        self.last_switch = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::connection::build_test_connection;

    #[tokio::test]
    async fn fresh_incumbent_is_kept() {
        let controller = HysteresisController::new(Duration::from_secs(10), 10);
        let existing = build_test_connection(30);
        let candidate = build_test_connection(10);
        assert!(!controller.should_switch_connection(&existing, &candidate));
    }

    #[tokio::test]
    async fn old_incumbent_yields_to_better_priority() {
        let controller = HysteresisController::new(Duration::ZERO, 10);
        let existing = build_test_connection(30);
        let candidate = build_test_connection(10);
        assert!(controller.should_switch_connection(&existing, &candidate));
    }

    #[tokio::test]
    async fn marginal_improvement_is_rejected() {
        let controller = HysteresisController::new(Duration::ZERO, 10);
        let existing = build_test_connection(30);
        let candidate = build_test_connection(25);
        assert!(!controller.should_switch_connection(&existing, &candidate));
    }

    #[tokio::test]
    async fn recent_switch_blocks_another() {
        let mut controller = HysteresisController::new(Duration::from_millis(500), 10);
        let existing = build_test_connection(30);
        let candidate = build_test_connection(10);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(controller.should_switch_connection(&existing, &candidate));
        controller.record_switch();
        assert!(!controller.should_switch_connection(&existing, &candidate));
    }
}
