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
    sync::{Arc, Mutex},
    time::Duration,
};

use log::*;

use super::peer_connection::PeerConnection;
use crate::{
    config::ConfigStore,
    quality::{ConvergenceAction, ConvergenceManager, ConvergenceState, HysteresisController, StabilityManager},
    types::{CloseReason, DeviceId, Hello},
};

const LOG_TARGET: &str = "comms::connection_manager::tracker";

/// Hard ceiling on parallel connections to one device.
const MAX_CONNECTIONS_PER_DEVICE: usize = 128;

/// How many parallel connections to keep to a device, given the local
/// preference and the remote's advertised tolerance.
pub fn desired_connections(local: u32, remote: u32) -> usize {
    if remote == 0 || remote == 1 || local == 1 {
        return 1;
    }
    (local.max(remote) as usize).min(MAX_CONNECTIONS_PER_DEVICE)
}

struct DeviceState {
    connections: Vec<PeerConnection>,
    remote_num_connections: u32,
    stability: StabilityManager,
    hysteresis: HysteresisController,
    convergence: ConvergenceManager,
}

/// Per-device accounting of live connections: admission, veto-gated
/// eviction, and desired-count negotiation. All operations serialize on one
/// internal mutex; external readers receive copies.
pub struct ConnectionTracker {
    config: Arc<ConfigStore>,
    devices: Mutex<HashMap<DeviceId, DeviceState>>,
}

impl ConnectionTracker {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a connection that completed its hello. Records the remote's
    /// advertised parallel-connection count, then evicts worse-priority
    /// connections unless one of the stability, hysteresis, or convergence
    /// policies vetoes the eviction. Evicted connections are closed on a
    /// detached task so this never blocks holding the lock.
    pub fn account_added_connection(&self, connection: PeerConnection, hello: &Hello) {
        let options = self.config.current();
        let upgrade_threshold = options.connection_priority_upgrade_threshold;
        let local_preference = options
            .device(connection.device_id())
            .map(|d| d.num_connections)
            .unwrap_or(1);

        let mut devices = self.devices.lock().expect("tracker lock poisoned");
        let state = devices.entry(*connection.device_id()).or_insert_with(|| DeviceState {
            connections: Vec::new(),
            remote_num_connections: hello.num_connections,
            stability: StabilityManager::new(),
            hysteresis: HysteresisController::from_options(&options),
            convergence: ConvergenceManager::new(),
        });
        state.remote_num_connections = hello.num_connections;
        state.connections.push(connection.clone());
        state.stability.record_established(&connection);
        state.convergence.update_connection(&connection);

        let desired = if options.multipath_enabled {
            desired_connections(local_preference, state.remote_num_connections)
        } else {
            1
        };

        let mut evicted = Vec::new();
        for existing in &state.connections {
            if existing.id() == connection.id() || existing.is_closed() {
                continue;
            }
            if existing.priority() <= connection.priority() - upgrade_threshold {
                continue;
            }
            // Any single "keep" veto spares the connection: stability first,
            // then hysteresis, then convergence
            if !state.stability.is_connection_stable(existing) {
                trace!(
                    target: LOG_TARGET,
                    "Sparing {}: not yet proven stable",
                    existing
                );
                continue;
            }
            if !state.hysteresis.should_switch_connection(existing, &connection) {
                trace!(target: LOG_TARGET, "Sparing {}: hysteresis", existing);
                continue;
            }
            match state.convergence.evaluate(desired) {
                (ConvergenceState::Converging, _) | (ConvergenceState::Diverging, ConvergenceAction::Wait) => {
                    trace!(target: LOG_TARGET, "Sparing {}: convergence says wait", existing);
                    continue;
                },
                _ => {},
            }
            evicted.push(existing.clone());
        }

        if !evicted.is_empty() {
            state.hysteresis.record_switch();
        }

        // Count enforcement is not subject to vetoes. One extra connection
        // is tolerated while a replacement is in flight; anything beyond that
        // closes lowest-ranked first.
        let mut live: Vec<PeerConnection> = state
            .connections
            .iter()
            .filter(|c| !c.is_closed() && !evicted.iter().any(|e| e.id() == c.id()))
            .cloned()
            .collect();
        if live.len() > desired + 1 {
            live.sort_by(|a, b| {
                b.priority()
                    .cmp(&a.priority())
                    .then_with(|| {
                        a.health()
                            .health_score()
                            .partial_cmp(&b.health().health_score())
                            .expect("scores are finite")
                    })
            });
            for surplus in live.iter().take(live.len() - (desired + 1)) {
                evicted.push(surplus.clone());
            }
        }

        drop(devices);

        if !evicted.is_empty() {
            debug!(
                target: LOG_TARGET,
                "Evicting {} connection(s) to device '{}' in favour of {}",
                evicted.len(),
                connection.device_id().short_str(),
                connection
            );
            tokio::spawn(async move {
                for conn in evicted {
                    conn.close(CloseReason::Replaced);
                }
            });
        }
    }

    /// Remove a closed connection. The stability manager is told about the
    /// closure; the device's state is dropped with its last connection.
    pub fn account_removed_connection(&self, connection: &PeerConnection) {
        let mut devices = self.devices.lock().expect("tracker lock poisoned");
        let Some(state) = devices.get_mut(connection.device_id()) else {
            return;
        };
        let reason = connection.close_reason().unwrap_or(CloseReason::Error);
        state
            .stability
            .record_closed(connection.id(), reason, connection.health().health_score());
        state.convergence.remove_connection(connection.id());
        state.connections.retain(|c| c.id() != connection.id());
        if state.connections.is_empty() {
            devices.remove(connection.device_id());
        }
    }

    /// Refresh a connection's convergence score from its current metrics.
    pub fn update_connection_quality(&self, connection: &PeerConnection) {
        let mut devices = self.devices.lock().expect("tracker lock poisoned");
        if let Some(state) = devices.get_mut(connection.device_id()) {
            state.convergence.update_connection(connection);
        }
    }

    pub fn desired_connections_to_device(&self, device_id: &DeviceId) -> usize {
        let options = self.config.current();
        if !options.multipath_enabled {
            return 1;
        }
        let local = options.device(device_id).map(|d| d.num_connections).unwrap_or(1);
        let remote = self
            .devices
            .lock()
            .expect("tracker lock poisoned")
            .get(device_id)
            .map(|s| s.remote_num_connections)
            .unwrap_or(0);
        desired_connections(local, remote)
    }

    /// The worst (highest) priority among live connections, or `i32::MAX`
    /// when there are none.
    pub fn worst_connection_priority(&self, device_id: &DeviceId) -> i32 {
        self.devices
            .lock()
            .expect("tracker lock poisoned")
            .get(device_id)
            .and_then(|s| s.connections.iter().filter(|c| !c.is_closed()).map(|c| c.priority()).max())
            .unwrap_or(i32::MAX)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.devices
            .lock()
            .expect("tracker lock poisoned")
            .iter()
            .filter(|(_, s)| s.connections.iter().any(|c| !c.is_closed()))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot copy of the device's live connections.
    pub fn connections_for_device(&self, device_id: &DeviceId) -> Vec<PeerConnection> {
        self.devices
            .lock()
            .expect("tracker lock poisoned")
            .get(device_id)
            .map(|s| s.connections.iter().filter(|c| !c.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, device_id: &DeviceId) -> usize {
        self.connections_for_device(device_id).len()
    }

    pub fn total_connections(&self) -> usize {
        self.devices
            .lock()
            .expect("tracker lock poisoned")
            .values()
            .map(|s| s.connections.iter().filter(|c| !c.is_closed()).count())
            .sum()
    }

    pub fn stability_score(&self, device_id: &DeviceId) -> Option<f64> {
        self.devices
            .lock()
            .expect("tracker lock poisoned")
            .get(device_id)
            .map(|s| s.stability.stability_score())
    }

    /// Whether connections to this device have recently been short-lived,
    /// used to penalize it in the dial queue.
    pub fn has_recent_short_lived(&self, device_id: &DeviceId) -> bool {
        self.devices
            .lock()
            .expect("tracker lock poisoned")
            .get(device_id)
            .map(|s| s.stability.has_recent_short_lived())
            .unwrap_or(false)
    }

    /// The device's stability-adjusted reconnect interval.
    pub fn adaptive_reconnect_interval(&self, device_id: &DeviceId, base: Duration) -> Duration {
        self.devices
            .lock()
            .expect("tracker lock poisoned")
            .get(device_id)
            .map(|s| s.stability.adaptive_reconnect_interval(base))
            .unwrap_or(base)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        config::{DeviceOptions, Options},
        test_utils::connection::{build_test_connection_for_device, build_test_connection_with},
        types::Hello,
    };

    fn hello(num_connections: u32) -> Hello {
        Hello {
            client_name: "driftsync".to_string(),
            client_version: "0.3.1".to_string(),
            device_name: "remote".to_string(),
            timestamp: 1,
            num_connections,
        }
    }

    fn tracker_with_device(device_id: DeviceId, num_connections: u32) -> ConnectionTracker {
        ConnectionTracker::new(Arc::new(ConfigStore::new(Options {
            devices: vec![DeviceOptions {
                device_id,
                num_connections,
                ..Default::default()
            }],
            multipath_enabled: true,
            ..Default::default()
        })))
    }

    #[test]
    fn desired_connections_formula() {
        // R ≤ 0 or R = 1 or L = 1 pins the count to one
        assert_eq!(desired_connections(4, 0), 1);
        assert_eq!(desired_connections(4, 1), 1);
        assert_eq!(desired_connections(1, 8), 1);
        // Otherwise the larger preference wins, capped at 128
        assert_eq!(desired_connections(2, 4), 4);
        assert_eq!(desired_connections(6, 2), 6);
        assert_eq!(desired_connections(0, 5), 5);
        assert_eq!(desired_connections(200, 300), 128);
    }

    #[tokio::test]
    async fn added_connection_is_tracked_and_removed() {
        let device_id = DeviceId::from_certificate(b"peer-a");
        let tracker = tracker_with_device(device_id, 1);
        let conn = build_test_connection_for_device(device_id, 10);

        tracker.account_added_connection(conn.clone(), &hello(1));
        assert_eq!(tracker.connection_count(&device_id), 1);
        assert_eq!(tracker.connected_devices(), vec![device_id]);
        assert_eq!(tracker.worst_connection_priority(&device_id), 10);

        conn.close(CloseReason::PeerClosed);
        tracker.account_removed_connection(&conn);
        assert_eq!(tracker.connection_count(&device_id), 0);
        assert!(tracker.connected_devices().is_empty());
        assert_eq!(tracker.worst_connection_priority(&device_id), i32::MAX);
    }

    #[tokio::test]
    async fn advertised_count_feeds_desired() {
        let device_id = DeviceId::from_certificate(b"peer-b");
        let tracker = tracker_with_device(device_id, 2);
        let conn = build_test_connection_for_device(device_id, 10);
        tracker.account_added_connection(conn, &hello(4));
        assert_eq!(tracker.desired_connections_to_device(&device_id), 4);
    }

    #[tokio::test]
    async fn proven_incumbent_is_evicted_by_better_priority() {
        let device_id = DeviceId::from_certificate(b"peer-c");
        let tracker = tracker_with_device(device_id, 1);

        // An aged, healthy relay connection
        let incumbent = build_test_connection_with(device_id, 50, Instant::now() - Duration::from_secs(30));
        incumbent.health().set_health_score_for_test(60.0);
        tracker.account_added_connection(incumbent.clone(), &hello(1));

        // A much better LAN connection arrives
        let upgrade = build_test_connection_for_device(device_id, 10);
        upgrade.health().set_health_score_for_test(95.0);
        tracker.account_added_connection(upgrade.clone(), &hello(1));

        driftsync_test_utils::async_assert_eventually!(
            incumbent.is_closed(),
            expect = true,
            max_attempts = 20,
            interval = Duration::from_millis(50)
        );
        assert_eq!(incumbent.close_reason(), Some(CloseReason::Replaced));
        assert!(!upgrade.is_closed());

        tracker.account_removed_connection(&incumbent);
        assert_eq!(tracker.connection_count(&device_id), 1);
    }

    #[tokio::test]
    async fn unproven_incumbent_is_spared() {
        let device_id = DeviceId::from_certificate(b"peer-d");
        let tracker = tracker_with_device(device_id, 1);

        // Fresh incumbent: must not be evicted regardless of priority gap;
        // the surplus rule closes the new connection instead (equal count)
        let incumbent = build_test_connection_for_device(device_id, 50);
        incumbent.health().set_health_score_for_test(60.0);
        tracker.account_added_connection(incumbent.clone(), &hello(2));

        let candidate = build_test_connection_with(device_id, 10, Instant::now() - Duration::from_secs(1));
        candidate.health().set_health_score_for_test(95.0);
        tracker.account_added_connection(candidate.clone(), &hello(2));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!incumbent.is_closed());
    }

    #[tokio::test]
    async fn marginal_priority_gain_is_not_an_upgrade() {
        let device_id = DeviceId::from_certificate(b"peer-e");
        let tracker = tracker_with_device(device_id, 2);

        let incumbent = build_test_connection_with(device_id, 14, Instant::now() - Duration::from_secs(30));
        incumbent.health().set_health_score_for_test(80.0);
        tracker.account_added_connection(incumbent.clone(), &hello(2));

        // Five points better is below the default threshold of ten
        let candidate = build_test_connection_with(device_id, 9, Instant::now() - Duration::from_secs(1));
        candidate.health().set_health_score_for_test(80.0);
        tracker.account_added_connection(candidate.clone(), &hello(2));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!incumbent.is_closed());
        assert_eq!(tracker.connection_count(&device_id), 2);
    }

    #[tokio::test]
    async fn surplus_beyond_desired_is_closed() {
        let device_id = DeviceId::from_certificate(b"peer-f");
        let tracker = tracker_with_device(device_id, 2);

        let mut conns = Vec::new();
        for i in 0..4 {
            let conn = build_test_connection_with(
                device_id,
                10,
                Instant::now() - Duration::from_secs(30 - i),
            );
            conn.health().set_health_score_for_test(80.0);
            tracker.account_added_connection(conn.clone(), &hello(2));
            conns.push(conn);
        }

        driftsync_test_utils::async_assert_eventually!(
            conns.iter().filter(|c| c.is_closed()).count() >= 1,
            expect = true,
            max_attempts = 20,
            interval = Duration::from_millis(50)
        );
        for conn in conns.iter().filter(|c| c.is_closed()) {
            tracker.account_removed_connection(conn);
        }
        // Within desired, allowing one transient replacement in flight
        assert!(tracker.connection_count(&device_id) <= 3);
    }
}
