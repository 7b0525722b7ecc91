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
    time::{Duration, Instant},
};

use crate::{connection_manager::PeerConnection, types::ConnectionId};

const WEIGHT_HEALTH: f64 = 0.4;
const WEIGHT_STABILITY: f64 = 0.3;
const WEIGHT_LATENCY: f64 = 0.2;
const WEIGHT_LOSS: f64 = 0.1;

/// Two top scores closer than this are considered equally good paths.
const DIVERGENCE_EPSILON: f64 = 0.1;
/// A lead this large makes the best path the clear winner.
const PROMOTE_GAP: f64 = 0.2;
const EVALUATION_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergenceState {
    Unknown,
    Stable,
    Converging,
    Diverging,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergenceAction {
    None,
    Wait,
    Close,
    Promote,
}

/// Per-device composite scoring over the device's concurrent connections,
/// detecting when multiple paths are fighting over primacy.
#[derive(Debug, Default)]
pub struct ConvergenceManager {
    scores: HashMap<ConnectionId, f64>,
    last_divergence: Option<Instant>,
}

impl ConvergenceManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Refresh the composite score for a connection:
    /// health·0.4 + stability·0.3 + latency-score·0.2 + loss-score·0.1,
    /// normalized to [0, 1].
    pub fn update_connection(&mut self, connection: &PeerConnection) {
        let metrics = connection.health().quality_metrics();
        let score = WEIGHT_HEALTH * (metrics.health_score / 100.0) +
            WEIGHT_STABILITY * (metrics.stability / 100.0) +
            WEIGHT_LATENCY * metrics.latency_score +
            WEIGHT_LOSS * metrics.loss_score;
        self.scores.insert(connection.id().clone(), score.clamp(0.0, 1.0));
    }

    pub fn remove_connection(&mut self, connection_id: &ConnectionId) {
        self.scores.remove(connection_id);
    }

    pub fn score(&self, connection_id: &ConnectionId) -> Option<f64> {
        self.scores.get(connection_id).copied()
    }

    /// Evaluate the overall state from the sorted scores.
    pub fn evaluate(&mut self, max_connections: usize) -> (ConvergenceState, ConvergenceAction) {
        if self.scores.is_empty() {
            return (ConvergenceState::Unknown, ConvergenceAction::None);
        }
        if self.scores.len() == 1 {
            return (ConvergenceState::Stable, ConvergenceAction::None);
        }

        let mut sorted: Vec<f64> = self.scores.values().copied().collect();
        sorted.sort_by(|a, b| b.partial_cmp(a).expect("scores are finite"));
        let top = sorted[0];
        let second = sorted[1];

        if top - second <= DIVERGENCE_EPSILON {
            self.last_divergence = Some(Instant::now());
            let action = if self.scores.len() > max_connections {
                ConvergenceAction::Close
            } else {
                ConvergenceAction::Wait
            };
            return (ConvergenceState::Diverging, action);
        }

        if let Some(at) = self.last_divergence {
            if at.elapsed() < EVALUATION_WINDOW {
                return (ConvergenceState::Converging, ConvergenceAction::Wait);
            }
        }

        let action = if top - second >= PROMOTE_GAP {
            ConvergenceAction::Promote
        } else {
            ConvergenceAction::None
        };
        (ConvergenceState::Stable, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::connection::build_test_connection;

    fn manager_with_scores(scores: &[f64]) -> ConvergenceManager {
        let mut manager = ConvergenceManager::new();
        for (i, score) in scores.iter().enumerate() {
            let conn = build_test_connection(10 + i as i32);
            manager.scores.insert(conn.id().clone(), *score);
        }
        manager
    }

    #[test]
    fn empty_is_unknown() {
        let mut manager = ConvergenceManager::new();
        assert_eq!(manager.evaluate(2), (ConvergenceState::Unknown, ConvergenceAction::None));
    }

    #[tokio::test]
    async fn single_connection_is_stable() {
        let mut manager = manager_with_scores(&[0.8]);
        assert_eq!(manager.evaluate(2), (ConvergenceState::Stable, ConvergenceAction::None));
    }

    #[tokio::test]
    async fn close_scores_diverge() {
        let mut manager = manager_with_scores(&[0.80, 0.75]);
        assert_eq!(manager.evaluate(2), (ConvergenceState::Diverging, ConvergenceAction::Wait));
    }

    #[tokio::test]
    async fn diverging_over_limit_closes() {
        let mut manager = manager_with_scores(&[0.80, 0.75, 0.70]);
        assert_eq!(manager.evaluate(2), (ConvergenceState::Diverging, ConvergenceAction::Close));
    }

    #[tokio::test]
    async fn clear_winner_promotes() {
        let mut manager = manager_with_scores(&[0.9, 0.4]);
        assert_eq!(manager.evaluate(2), (ConvergenceState::Stable, ConvergenceAction::Promote));
    }

    #[tokio::test]
    async fn converging_after_recent_divergence() {
        let mut manager = manager_with_scores(&[0.80, 0.75]);
        let _ = manager.evaluate(2);
        // The gap widens, but we only just diverged
        let ids: Vec<ConnectionId> = manager.scores.keys().cloned().collect();
        manager.scores.insert(ids[0].clone(), 0.95);
        manager.scores.insert(ids[1].clone(), 0.40);
        assert_eq!(
            manager.evaluate(2),
            (ConvergenceState::Converging, ConvergenceAction::Wait)
        );
    }

    #[tokio::test]
    async fn update_and_remove_round_trip() {
        let mut manager = ConvergenceManager::new();
        let conn = build_test_connection(10);
        manager.update_connection(&conn);
        let score = manager.score(conn.id()).unwrap();
        assert!((0.0..=1.0).contains(&score));
        manager.remove_connection(conn.id());
        assert!(manager.score(conn.id()).is_none());
    }
}
