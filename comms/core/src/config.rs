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

use std::{sync::Arc, time::Duration};

use serde_derive::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::DeviceId;

pub const DEFAULT_KEEP_ALIVE_MIN: Duration = Duration::from_secs(20);
pub const DEFAULT_KEEP_ALIVE_MAX: Duration = Duration::from_secs(120);

/// When to compress data sent to a device. Consumed by the protocol layer;
/// carried here because it is part of the per-device record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Always,
    #[default]
    Metadata,
    Never,
}

/// Per-device configuration record.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceOptions {
    pub device_id: DeviceId,
    /// Dial addresses; the literal `"dynamic"` is replaced at dial time by a
    /// discovery lookup.
    pub addresses: Vec<String>,
    pub paused: bool,
    /// CIDR allow-list. Empty means any network is allowed.
    pub allowed_networks: Vec<String>,
    /// Expected certificate common name. Empty means the client default.
    pub cert_name: String,
    pub compression: Compression,
    /// Preferred number of parallel connections to this device.
    pub num_connections: u32,
}

/// Connection-management options. Field defaults are set in `Default`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Options {
    /// This device's own identifier. Connections from it are rejected.
    pub device_id: DeviceId,
    pub device_name: String,
    pub client_name: String,
    pub client_version: String,

    /// Listen addresses as URL strings, e.g. `tcp://0.0.0.0:22000`.
    pub listen_addresses: Vec<String>,
    pub devices: Vec<DeviceOptions>,
    pub ignored_devices: Vec<DeviceId>,

    /// Maximum total live connections. 0 disables the limit.
    pub connection_limit_max: usize,
    /// Stop dialing for more connections once this many devices are
    /// connected. 0 disables.
    pub connection_limit_enough: usize,
    /// Minimum priority improvement (priorities are lower-is-better) required
    /// before a new connection replaces an established one. Default: 10
    pub connection_priority_upgrade_threshold: i32,
    /// Minimum age of a connection before it may be replaced. Default: 10s
    pub connection_replacement_age_threshold: Duration,
    /// Priority margin used by replacement hysteresis. Default: 10
    pub connection_replacement_priority_threshold: i32,
    /// Base interval between dial passes for a device. Default: 60s
    pub reconnect_interval: Duration,
    /// Use more than one concurrent connection per device for data transfer.
    pub multipath_enabled: bool,

    pub random_ports_enabled: bool,
    pub random_port_range_start: u16,
    pub random_port_range_end: u16,

    pub adaptive_keep_alive_enabled: bool,
    /// Defaults to 20s when unset.
    pub adaptive_keep_alive_min: Option<Duration>,
    /// Defaults to 120s when unset.
    pub adaptive_keep_alive_max: Option<Duration>,

    /// CIDRs that are always classified as LAN.
    pub always_local_nets: Vec<String>,
    /// Omit LAN addresses from `external_addresses` snapshots.
    pub omit_lan_external_addresses: bool,

    pub tcp_enabled: bool,
    pub relay_enabled: bool,
    pub tcp_lan_priority: i32,
    pub tcp_wan_priority: i32,
    pub relay_priority: i32,
}

impl Options {
    pub fn device(&self, device_id: &DeviceId) -> Option<&DeviceOptions> {
        self.devices.iter().find(|d| &d.device_id == device_id)
    }

    pub fn is_ignored(&self, device_id: &DeviceId) -> bool {
        self.ignored_devices.contains(device_id)
    }

    pub fn keep_alive_min(&self) -> Duration {
        self.adaptive_keep_alive_min.unwrap_or(DEFAULT_KEEP_ALIVE_MIN)
    }

    pub fn keep_alive_max(&self) -> Duration {
        self.adaptive_keep_alive_max.unwrap_or(DEFAULT_KEEP_ALIVE_MAX)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device_id: DeviceId::default(),
            device_name: String::new(),
            client_name: "driftsync".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addresses: vec![],
            devices: vec![],
            ignored_devices: vec![],
            connection_limit_max: 0,
            connection_limit_enough: 0,
            connection_priority_upgrade_threshold: 10,
            connection_replacement_age_threshold: Duration::from_secs(10),
            connection_replacement_priority_threshold: 10,
            reconnect_interval: Duration::from_secs(60),
            multipath_enabled: false,
            random_ports_enabled: false,
            random_port_range_start: 49152,
            random_port_range_end: 60000,
            adaptive_keep_alive_enabled: true,
            adaptive_keep_alive_min: None,
            adaptive_keep_alive_max: None,
            always_local_nets: vec![],
            omit_lan_external_addresses: false,
            tcp_enabled: true,
            relay_enabled: true,
            tcp_lan_priority: 10,
            tcp_wan_priority: 30,
            relay_priority: 50,
        }
    }
}

/// Subscribable configuration source. Components snapshot with `current` and
/// react to commits via `subscribe`.
#[derive(Debug)]
pub struct ConfigStore {
    tx: watch::Sender<Arc<Options>>,
}

impl ConfigStore {
    pub fn new(options: Options) -> Self {
        let (tx, _) = watch::channel(Arc::new(options));
        Self { tx }
    }

    pub fn current(&self) -> Arc<Options> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Options>> {
        self.tx.subscribe()
    }

    /// Commit a new configuration, notifying all subscribers.
    pub fn commit(&self, options: Options) {
        let _ = self.tx.send(Arc::new(options));
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_bounds_default_when_unset() {
        let opts = Options::default();
        assert_eq!(opts.keep_alive_min(), DEFAULT_KEEP_ALIVE_MIN);
        assert_eq!(opts.keep_alive_max(), DEFAULT_KEEP_ALIVE_MAX);

        let opts = Options {
            adaptive_keep_alive_min: Some(Duration::from_secs(10)),
            adaptive_keep_alive_max: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert_eq!(opts.keep_alive_min(), Duration::from_secs(10));
        assert_eq!(opts.keep_alive_max(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn commit_notifies_subscribers() {
        let store = ConfigStore::default();
        let mut rx = store.subscribe();
        store.commit(Options {
            connection_limit_max: 5,
            ..Default::default()
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().connection_limit_max, 5);
        assert_eq!(store.current().connection_limit_max, 5);
    }
}
