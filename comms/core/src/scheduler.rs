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

//! Multipath traffic placement: picks a connection for each outbound unit of
//! work and splits byte budgets by bandwidth share.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    connection_manager::PeerConnection,
    types::{ConnectionId, DeviceId},
};

struct SchedulerInner {
    devices: HashMap<DeviceId, Vec<PeerConnection>>,
    selection_counts: HashMap<ConnectionId, u64>,
    rng: StdRng,
}

/// Per-service connection selector. The RNG is constructor-parameterized so
/// tests supply a fixed seed and weighted selection is reproducible.
pub struct PacketScheduler {
    inner: Mutex<SchedulerInner>,
}

impl PacketScheduler {
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Mutex::new(SchedulerInner {
                devices: HashMap::new(),
                selection_counts: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    pub fn register_connection(&self, connection: PeerConnection) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        let device = *connection.device_id();
        let conns = inner.devices.entry(device).or_default();
        if !conns.iter().any(|c| c.id() == connection.id()) {
            conns.push(connection);
        }
    }

    pub fn unregister_connection(&self, connection: &PeerConnection) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.selection_counts.remove(connection.id());
        if let Some(conns) = inner.devices.get_mut(connection.device_id()) {
            conns.retain(|c| c.id() != connection.id());
            if conns.is_empty() {
                inner.devices.remove(connection.device_id());
            }
        }
    }

    /// The connection with the best health score; ties break by insertion
    /// order.
    pub fn select_connection(&self, device_id: &DeviceId) -> Option<PeerConnection> {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        let live = live_connections(&inner, device_id);
        let best = live
            .iter()
            .fold(None::<(&PeerConnection, f64)>, |best, conn| {
                let score = conn.health().health_score();
                match best {
                    Some((_, best_score)) if best_score >= score => best,
                    _ => Some((conn, score)),
                }
            })
            .map(|(conn, _)| conn.clone())?;
        *inner.selection_counts.entry(best.id().clone()).or_insert(0) += 1;
        Some(best)
    }

    /// Weighted random selection by health score. An all-zero score set
    /// falls back to uniform random.
    pub fn select_connection_for_load_balancing(&self, device_id: &DeviceId) -> Option<PeerConnection> {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        let live = live_connections(&inner, device_id);
        if live.is_empty() {
            return None;
        }

        let scores: Vec<f64> = live.iter().map(|c| c.health().health_score().max(0.0)).collect();
        let total: f64 = scores.iter().sum();
        let selected = if total <= 0.0 {
            live[inner.rng.gen_range(0..live.len())].clone()
        } else {
            let mut draw = inner.rng.gen_range(0.0..total);
            let mut chosen = live.last().expect("non-empty").clone();
            for (conn, score) in live.iter().zip(&scores) {
                if draw < *score {
                    chosen = conn.clone();
                    break;
                }
                draw -= score;
            }
            chosen
        };
        *inner.selection_counts.entry(selected.id().clone()).or_insert(0) += 1;
        Some(selected)
    }

    /// Prefer measured traffic capacity: `bandwidth · 1/(1+latency) ·
    /// (1 − loss)` over connections with bandwidth samples, health score for
    /// the rest.
    pub fn select_connection_based_on_traffic(&self, device_id: &DeviceId) -> Option<PeerConnection> {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        let live = live_connections(&inner, device_id);
        if live.is_empty() {
            return None;
        }

        let with_traffic: Vec<(&PeerConnection, f64)> = live
            .iter()
            .filter_map(|conn| {
                let metrics = conn.health().quality_metrics();
                if metrics.bandwidth_mbps > 0.0 {
                    let latency_s = metrics.latency_ms / 1000.0;
                    let loss = (metrics.packet_loss_pct / 100.0).clamp(0.0, 1.0);
                    Some((conn, metrics.bandwidth_mbps * (1.0 / (1.0 + latency_s)) * (1.0 - loss)))
                } else {
                    None
                }
            })
            .collect();

        let selected = if with_traffic.is_empty() {
            live.iter()
                .fold(None::<(&PeerConnection, f64)>, |best, conn| {
                    let score = conn.health().health_score();
                    match best {
                        Some((_, best_score)) if best_score >= score => best,
                        _ => Some((conn, score)),
                    }
                })
                .map(|(conn, _)| conn.clone())?
        } else {
            with_traffic
                .iter()
                .fold(None::<(&PeerConnection, f64)>, |best, (conn, score)| match best {
                    Some((_, best_score)) if best_score >= *score => best,
                    _ => Some((conn, *score)),
                })
                .map(|(conn, _)| (*conn).clone())?
        };
        *inner.selection_counts.entry(selected.id().clone()).or_insert(0) += 1;
        Some(selected)
    }

    /// Split a byte budget across the device's connections in proportion to
    /// their bandwidth share; with no bandwidth data the split is even.
    pub fn distribute_data_chunks(&self, device_id: &DeviceId, total_bytes: u64) -> Vec<(ConnectionId, u64)> {
        let inner = self.inner.lock().expect("scheduler lock poisoned");
        let live = live_connections(&inner, device_id);
        if live.is_empty() {
            return Vec::new();
        }

        let bandwidths: Vec<f64> = live
            .iter()
            .map(|c| c.health().quality_metrics().bandwidth_mbps.max(0.0))
            .collect();
        let total_bandwidth: f64 = bandwidths.iter().sum();

        if total_bandwidth <= 0.0 {
            let base = total_bytes / live.len() as u64;
            let remainder = total_bytes % live.len() as u64;
            return live
                .iter()
                .enumerate()
                .map(|(i, conn)| (conn.id().clone(), base + u64::from((i as u64) < remainder)))
                .collect();
        }

        let mut allocated = 0u64;
        let mut shares: Vec<(ConnectionId, u64)> = Vec::with_capacity(live.len());
        for (i, (conn, bandwidth)) in live.iter().zip(&bandwidths).enumerate() {
            let share = if i == live.len() - 1 {
                total_bytes - allocated
            } else {
                (total_bytes as f64 * bandwidth / total_bandwidth) as u64
            };
            allocated += share;
            shares.push((conn.id().clone(), share));
        }
        shares
    }

    /// How often a connection has been selected, for observability and tests.
    pub fn selection_count(&self, connection_id: &ConnectionId) -> u64 {
        self.inner
            .lock()
            .expect("scheduler lock poisoned")
            .selection_counts
            .get(connection_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for PacketScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn live_connections(inner: &SchedulerInner, device_id: &DeviceId) -> Vec<PeerConnection> {
    inner
        .devices
        .get(device_id)
        .map(|conns| conns.iter().filter(|c| !c.is_closed()).cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::connection::build_test_connection_for_device,
        types::CloseReason,
    };

    fn device() -> DeviceId {
        DeviceId::from_certificate(b"scheduler peer")
    }

    #[tokio::test]
    async fn empty_scheduler_selects_nothing() {
        let scheduler = PacketScheduler::with_seed(1);
        let d = device();
        assert!(scheduler.select_connection(&d).is_none());
        assert!(scheduler.select_connection_for_load_balancing(&d).is_none());
        assert!(scheduler.select_connection_based_on_traffic(&d).is_none());
        assert!(scheduler.distribute_data_chunks(&d, 1000).is_empty());
    }

    #[tokio::test]
    async fn failover_follows_the_best_score() {
        let scheduler = PacketScheduler::with_seed(1);
        let d = device();
        let lan = build_test_connection_for_device(d, 10);
        let wifi = build_test_connection_for_device(d, 20);
        let relay = build_test_connection_for_device(d, 30);
        lan.health().set_health_score_for_test(95.0);
        wifi.health().set_health_score_for_test(80.0);
        relay.health().set_health_score_for_test(70.0);
        for conn in [&lan, &wifi, &relay] {
            scheduler.register_connection(conn.clone());
        }

        assert_eq!(scheduler.select_connection(&d).unwrap().id(), lan.id());

        lan.health().set_health_score_for_test(0.0);
        assert_eq!(scheduler.select_connection(&d).unwrap().id(), wifi.id());

        wifi.health().set_health_score_for_test(40.0);
        assert_eq!(scheduler.select_connection(&d).unwrap().id(), relay.id());

        lan.health().set_health_score_for_test(95.0);
        assert_eq!(scheduler.select_connection(&d).unwrap().id(), lan.id());
    }

    #[tokio::test]
    async fn ties_break_by_insertion_order() {
        let scheduler = PacketScheduler::with_seed(1);
        let d = device();
        let first = build_test_connection_for_device(d, 10);
        let second = build_test_connection_for_device(d, 10);
        first.health().set_health_score_for_test(80.0);
        second.health().set_health_score_for_test(80.0);
        scheduler.register_connection(first.clone());
        scheduler.register_connection(second);
        assert_eq!(scheduler.select_connection(&d).unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn load_balancing_spreads_equal_scores() {
        let scheduler = PacketScheduler::with_seed(42);
        let d = device();
        let conns: Vec<_> = (0..3).map(|_| build_test_connection_for_device(d, 10)).collect();
        for conn in &conns {
            conn.health().set_health_score_for_test(90.0);
            scheduler.register_connection(conn.clone());
        }

        for _ in 0..300 {
            scheduler.select_connection_for_load_balancing(&d).unwrap();
        }
        for conn in &conns {
            let count = scheduler.selection_count(conn.id());
            assert!((70..=130).contains(&count), "connection got {} selections", count);
        }
    }

    #[tokio::test]
    async fn zero_scores_fall_back_to_uniform() {
        let scheduler = PacketScheduler::with_seed(7);
        let d = device();
        let conns: Vec<_> = (0..3).map(|_| build_test_connection_for_device(d, 10)).collect();
        for conn in &conns {
            conn.health().set_health_score_for_test(0.0);
            scheduler.register_connection(conn.clone());
        }
        for _ in 0..300 {
            scheduler.select_connection_for_load_balancing(&d).unwrap();
        }
        for conn in &conns {
            assert!(scheduler.selection_count(conn.id()) > 0);
        }
    }

    #[tokio::test]
    async fn traffic_selection_prefers_measured_capacity() {
        let scheduler = PacketScheduler::with_seed(1);
        let d = device();
        let fat = build_test_connection_for_device(d, 10);
        let thin = build_test_connection_for_device(d, 10);
        // 80 Mbit/s vs 8 Mbit/s over one second
        fat.health().record_bandwidth(10_000_000, 0, std::time::Duration::from_secs(1));
        thin.health().record_bandwidth(1_000_000, 0, std::time::Duration::from_secs(1));
        thin.health().set_health_score_for_test(99.0);
        scheduler.register_connection(thin.clone());
        scheduler.register_connection(fat.clone());

        assert_eq!(scheduler.select_connection_based_on_traffic(&d).unwrap().id(), fat.id());
    }

    #[tokio::test]
    async fn chunks_split_evenly_without_bandwidth() {
        let scheduler = PacketScheduler::with_seed(1);
        let d = device();
        let conns: Vec<_> = (0..3).map(|_| build_test_connection_for_device(d, 10)).collect();
        for conn in &conns {
            scheduler.register_connection(conn.clone());
        }
        let shares = scheduler.distribute_data_chunks(&d, 1000);
        assert_eq!(shares.len(), 3);
        assert_eq!(shares.iter().map(|(_, b)| b).sum::<u64>(), 1000);
        for (_, bytes) in &shares {
            assert!((333..=334).contains(bytes));
        }
    }

    #[tokio::test]
    async fn chunks_follow_bandwidth_share() {
        let scheduler = PacketScheduler::with_seed(1);
        let d = device();
        let fast = build_test_connection_for_device(d, 10);
        let slow = build_test_connection_for_device(d, 10);
        fast.health().record_bandwidth(30_000_000, 0, std::time::Duration::from_secs(1));
        slow.health().record_bandwidth(10_000_000, 0, std::time::Duration::from_secs(1));
        scheduler.register_connection(fast.clone());
        scheduler.register_connection(slow.clone());

        let shares = scheduler.distribute_data_chunks(&d, 4000);
        assert_eq!(shares.iter().map(|(_, b)| b).sum::<u64>(), 4000);
        let fast_share = shares.iter().find(|(id, _)| id == fast.id()).unwrap().1;
        assert!((2900..=3100).contains(&fast_share), "fast share {}", fast_share);
    }

    #[tokio::test]
    async fn closed_connections_are_skipped() {
        let scheduler = PacketScheduler::with_seed(1);
        let d = device();
        let conn = build_test_connection_for_device(d, 10);
        scheduler.register_connection(conn.clone());
        conn.close(CloseReason::Shutdown);
        assert!(scheduler.select_connection(&d).is_none());
    }
}
