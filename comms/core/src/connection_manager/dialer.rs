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

//! The dial loop: resolves device addresses, buckets targets by priority,
//! dials buckets in parallel under global and per-device semaphores, and
//! feeds successes into the shared intake channel.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use cidr::IpCidr;
use driftsync_shutdown::ShutdownSignal;
use futures::{stream::FuturesUnordered, StreamExt};
use log::*;
use tokio::sync::{mpsc, Semaphore};
use url::Url;

use super::next_dial::NextDialRegistry;
use crate::{
    collaborators::{Discovery, ProtocolRecipient},
    config::ConfigStore,
    connection_manager::tracker::ConnectionTracker,
    health::AdaptiveTimeouts,
    transports::{EstablishedStream, TransportContext, TransportDialer, TransportRegistry},
    types::DeviceId,
};

const LOG_TARGET: &str = "comms::connection_manager::dialer";

const GLOBAL_DIAL_PARALLELISM: usize = 64;
const PER_DEVICE_DIAL_PARALLELISM: usize = 8;

const STANDARD_SLEEP: Duration = Duration::from_secs(60);
const MIN_SLEEP: Duration = Duration::from_secs(5);
const INITIAL_RAMPUP_SLEEP: Duration = Duration::from_secs(1);

/// The literal address entry replaced by a discovery lookup.
const DYNAMIC_ADDRESS: &str = "dynamic";

/// Latest dial outcome per address.
#[derive(Clone, Debug)]
pub struct ConnectionStatusEntry {
    pub when: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionStatusRegistry {
    entries: Mutex<HashMap<String, ConnectionStatusEntry>>,
}

impl ConnectionStatusRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_status(&self, address: &str, error: Option<String>) {
        self.entries.lock().expect("status lock poisoned").insert(
            address.to_string(),
            ConnectionStatusEntry {
                when: Utc::now(),
                error,
            },
        );
    }

    pub fn snapshot(&self) -> HashMap<String, ConnectionStatusEntry> {
        self.entries.lock().expect("status lock poisoned").clone()
    }
}

#[derive(Debug, Default)]
struct PendingRedials {
    all: bool,
    devices: HashSet<DeviceId>,
}

/// Coalescing redial signal: any number of concurrent requests collapse into
/// at most one extra dial-loop iteration.
#[derive(Clone)]
pub struct DialNowHandle {
    tx: mpsc::Sender<()>,
    pending: Arc<Mutex<PendingRedials>>,
}

impl DialNowHandle {
    pub(crate) fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                tx,
                pending: Arc::new(Mutex::new(PendingRedials::default())),
            },
            rx,
        )
    }

    /// Force a dial pass for every non-paused device. Non-blocking.
    pub fn request_all(&self) {
        self.pending.lock().expect("pending redials lock poisoned").all = true;
        let _ = self.tx.try_send(());
    }

    /// Force a dial pass for one device, e.g. after its connection closed.
    pub fn request_device(&self, device_id: DeviceId) {
        self.pending
            .lock()
            .expect("pending redials lock poisoned")
            .devices
            .insert(device_id);
        let _ = self.tx.try_send(());
    }

    fn take(&self) -> PendingRedials {
        std::mem::take(&mut *self.pending.lock().expect("pending redials lock poisoned"))
    }
}

struct DialTarget {
    address: Url,
    dialer: Arc<dyn TransportDialer>,
    priority: i32,
}

struct DeviceDialPlan {
    device_id: DeviceId,
    targets: Vec<DialTarget>,
    penalized: bool,
    last_seen: Option<DateTime<Utc>>,
}

/// Runs as a single task; owns the next-dial registry outright.
pub(crate) struct DialScheduler {
    config: Arc<ConfigStore>,
    registry: Arc<TransportRegistry>,
    dialers: HashMap<&'static str, Arc<dyn TransportDialer>>,
    discovery: Arc<dyn Discovery>,
    protocol: Arc<dyn ProtocolRecipient>,
    tracker: Arc<ConnectionTracker>,
    timeouts: Arc<AdaptiveTimeouts>,
    intake_tx: mpsc::Sender<EstablishedStream>,
    status: Arc<ConnectionStatusRegistry>,
    next_dial: NextDialRegistry,
    dial_now: DialNowHandle,
    dial_now_rx: mpsc::Receiver<()>,
    warned_schemes: HashSet<String>,
    shutdown: ShutdownSignal,
}

impl DialScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<TransportRegistry>,
        ctx: TransportContext,
        discovery: Arc<dyn Discovery>,
        protocol: Arc<dyn ProtocolRecipient>,
        tracker: Arc<ConnectionTracker>,
        timeouts: Arc<AdaptiveTimeouts>,
        intake_tx: mpsc::Sender<EstablishedStream>,
        status: Arc<ConnectionStatusRegistry>,
        dial_now: DialNowHandle,
        dial_now_rx: mpsc::Receiver<()>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let dialers = registry
            .factories()
            .into_iter()
            .map(|factory| (factory.scheme(), factory.new_dialer(&ctx)))
            .collect();
        Self {
            config,
            registry,
            dialers,
            discovery,
            protocol,
            tracker,
            timeouts,
            intake_tx,
            status,
            next_dial: NextDialRegistry::new(),
            dial_now,
            dial_now_rx,
            warned_schemes: HashSet::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        debug!(target: LOG_TARGET, "Dial scheduler started");
        let mut rampup_sleep = INITIAL_RAMPUP_SLEEP;

        loop {
            self.dial_iteration().await;

            let sleep = if rampup_sleep < STANDARD_SLEEP {
                // Initial rampup: exponentially increasing sleeps
                let current = rampup_sleep;
                rampup_sleep = (rampup_sleep * 2).min(STANDARD_SLEEP);
                current
            } else {
                let next_event = self
                    .next_dial
                    .next_event_after(Instant::now())
                    .unwrap_or(STANDARD_SLEEP);
                next_event.min(STANDARD_SLEEP).max(MIN_SLEEP)
            };

            tokio::select! {
                _ = self.shutdown.wait() => {
                    debug!(target: LOG_TARGET, "Dial scheduler shutting down");
                    break;
                },
                _ = tokio::time::sleep(sleep) => {},
                Some(_) = self.dial_now_rx.recv() => {
                    self.apply_pending_redials();
                },
            }
        }
    }

    /// Drain the coalesced redial requests, clearing next-dial times for the
    /// named devices. An active forced-redial cool-down is respected.
    fn apply_pending_redials(&mut self) {
        let pending = self.dial_now.take();
        let options = self.config.current();
        let now = Instant::now();
        let requested: Vec<DeviceId> = if pending.all {
            options
                .devices
                .iter()
                .filter(|d| !d.paused && d.device_id != options.device_id)
                .map(|d| d.device_id)
                .collect()
        } else {
            pending.devices.into_iter().collect()
        };
        for device_id in requested {
            if options.device(&device_id).map(|d| d.paused).unwrap_or(true) {
                continue;
            }
            self.next_dial.redial_device(&device_id, now);
        }
    }

    async fn dial_iteration(&mut self) {
        let options = self.config.current();

        self.next_dial
            .retain_devices(|device_id| options.device(device_id).is_some());

        if options.connection_limit_enough > 0 &&
            self.tracker.connected_devices().len() >= options.connection_limit_enough
        {
            trace!(target: LOG_TARGET, "Enough devices connected, skipping dial pass");
            return;
        }

        let enabled: HashMap<&'static str, Arc<dyn TransportDialer>> = self
            .registry
            .enabled_factories(&options)
            .into_iter()
            .filter_map(|factory| {
                self.dialers
                    .get(factory.scheme())
                    .map(|dialer| (factory.scheme(), dialer.clone()))
            })
            .collect();
        let best_dialer_priority = enabled.values().map(|d| d.best_priority()).min().unwrap_or(i32::MAX);

        let statistics = self.protocol.device_statistics().unwrap_or_else(|err| {
            debug!(target: LOG_TARGET, "Device statistics unavailable: {}", err);
            HashMap::new()
        });

        let mut queue = self.build_queue(&options, &enabled, best_dialer_priority, &statistics).await;

        // Most recently seen first; devices whose connections were recently
        // short-lived go to the back
        queue.sort_by(|a, b| a.penalized.cmp(&b.penalized).then(b.last_seen.cmp(&a.last_seen)));

        if queue.is_empty() {
            return;
        }
        debug!(target: LOG_TARGET, "Dialing {} device(s)", queue.len());

        let global_semaphore = Arc::new(Semaphore::new(GLOBAL_DIAL_PARALLELISM));
        let mut device_tasks = Vec::with_capacity(queue.len());
        for plan in queue {
            let global_semaphore = global_semaphore.clone();
            let intake_tx = self.intake_tx.clone();
            let status = self.status.clone();
            let timeouts = self.timeouts.clone();
            device_tasks.push(tokio::spawn(dial_device(
                plan,
                global_semaphore,
                intake_tx,
                status,
                timeouts,
            )));
        }
        for task in device_tasks {
            let _ = task.await;
        }
    }

    async fn build_queue(
        &mut self,
        options: &crate::config::Options,
        enabled: &HashMap<&'static str, Arc<dyn TransportDialer>>,
        best_dialer_priority: i32,
        statistics: &HashMap<DeviceId, crate::collaborators::DeviceStatistics>,
    ) -> Vec<DeviceDialPlan> {
        let now = Instant::now();
        let upgrade_threshold = options.connection_priority_upgrade_threshold;
        let mut queue = Vec::new();

        for device in &options.devices {
            if device.device_id == options.device_id || device.paused || options.is_ignored(&device.device_id) {
                continue;
            }

            let current = self.tracker.connection_count(&device.device_id);
            let desired = self.tracker.desired_connections_to_device(&device.device_id);
            let worst = self.tracker.worst_connection_priority(&device.device_id);
            // Only dial targets that would better the worst connection by at
            // least the upgrade threshold (priorities are lower-is-better)
            let cutoff = worst.saturating_sub(upgrade_threshold);
            if best_dialer_priority >= cutoff && current >= desired {
                continue;
            }

            let addresses = self.resolve_addresses(device).await;
            let allowed_networks = parse_allowed_networks(&device.allowed_networks);

            let mut targets = Vec::new();
            for address in addresses {
                if !self.next_dial.is_due(&device.device_id, &address, now) {
                    continue;
                }
                // Push the next dial out before parsing so bad entries do
                // not retry in a tight loop
                self.next_dial
                    .register_attempt(&device.device_id, &address, now, Duration::ZERO);

                let url = match Url::parse(&address) {
                    Ok(url) => url,
                    Err(err) => {
                        self.status.set_status(&address, Some(format!("invalid address: {}", err)));
                        continue;
                    },
                };
                let Some(dialer) = enabled.get(url.scheme()) else {
                    match self.registry.get(url.scheme()) {
                        // Disabled schemes are skipped quietly
                        Ok(_) => trace!(target: LOG_TARGET, "Skipping disabled scheme '{}'", url.scheme()),
                        Err(err) => {
                            if self.warned_schemes.insert(url.scheme().to_string()) {
                                warn!(target: LOG_TARGET, "{}", err);
                            }
                            self.status.set_status(&address, Some(err.to_string()));
                        },
                    }
                    continue;
                };

                if !address_in_allowed_networks(&url, &allowed_networks) {
                    trace!(
                        target: LOG_TARGET,
                        "Address {} is outside the allowed networks for '{}'",
                        address,
                        device.device_id.short_str()
                    );
                    continue;
                }
                if current > 0 && !dialer.allows_multi_conns() {
                    continue;
                }
                let priority = dialer.priority(url.host_str().unwrap_or_default());
                if current > 0 && priority >= cutoff {
                    continue;
                }

                // The device's stability history scales its redial pace
                let redial_interval = self
                    .tracker
                    .adaptive_reconnect_interval(&device.device_id, dialer.redial_frequency());
                self.next_dial
                    .register_attempt(&device.device_id, &address, now, redial_interval);
                targets.push(DialTarget {
                    address: url,
                    dialer: dialer.clone(),
                    priority,
                });
            }

            if targets.is_empty() {
                continue;
            }
            queue.push(DeviceDialPlan {
                device_id: device.device_id,
                targets,
                penalized: self.tracker.has_recent_short_lived(&device.device_id),
                last_seen: statistics.get(&device.device_id).and_then(|s| s.last_seen),
            });
        }
        queue
    }

    /// Literal entries plus discovery results for `"dynamic"`, deduplicated
    /// in order.
    async fn resolve_addresses(&self, device: &crate::config::DeviceOptions) -> Vec<String> {
        let mut addresses = Vec::new();
        for entry in &device.addresses {
            if entry == DYNAMIC_ADDRESS {
                match self.discovery.lookup(&device.device_id).await {
                    Ok(found) => addresses.extend(found),
                    Err(err) => {
                        debug!(
                            target: LOG_TARGET,
                            "Discovery lookup for '{}' failed: {}",
                            device.device_id.short_str(),
                            err
                        );
                    },
                }
            } else {
                addresses.push(entry.clone());
            }
        }
        let mut seen = HashSet::new();
        addresses.retain(|a| seen.insert(a.clone()));
        addresses
    }
}

/// Dial one device: lowest-priority bucket first, the whole bucket in
/// parallel. The first success cancels the rest for this device; total
/// failure moves on to the next bucket.
async fn dial_device(
    plan: DeviceDialPlan,
    global_semaphore: Arc<Semaphore>,
    intake_tx: mpsc::Sender<EstablishedStream>,
    status: Arc<ConnectionStatusRegistry>,
    timeouts: Arc<AdaptiveTimeouts>,
) {
    let mut buckets: BTreeMap<i32, Vec<DialTarget>> = BTreeMap::new();
    for target in plan.targets {
        buckets.entry(target.priority).or_default().push(target);
    }
    let device_semaphore = Arc::new(Semaphore::new(PER_DEVICE_DIAL_PARALLELISM));

    for (priority, bucket) in buckets {
        let mut dials: FuturesUnordered<_> = bucket
            .into_iter()
            .map(|target| {
                let global_semaphore = global_semaphore.clone();
                let device_semaphore = device_semaphore.clone();
                async move {
                    let _global = global_semaphore.acquire_owned().await.expect("semaphore closed");
                    let _device = device_semaphore.acquire_owned().await.expect("semaphore closed");
                    let result = target.dialer.dial(&target.address).await;
                    (target.address, result)
                }
            })
            .collect();

        let mut connected = false;
        while let Some((address, result)) = dials.next().await {
            match result {
                Ok(mut established) => {
                    debug!(
                        target: LOG_TARGET,
                        "Dialed '{}' at {} (priority {})",
                        plan.device_id.short_str(),
                        address,
                        priority
                    );
                    established.expected_device = Some(plan.device_id);
                    timeouts.record_connection_success(address.as_str());
                    status.set_status(address.as_str(), None);
                    let _ = intake_tx.send(established).await;
                    connected = true;
                    // Dropping the remaining futures cancels their dials
                    break;
                },
                Err(err) => {
                    debug!(
                        target: LOG_TARGET,
                        "Dial of '{}' at {} failed: {}",
                        plan.device_id.short_str(),
                        address,
                        err
                    );
                    timeouts.record_connection_failure(address.as_str());
                    status.set_status(address.as_str(), Some(err.to_string()));
                },
            }
        }
        if connected {
            return;
        }
    }
}

fn parse_allowed_networks(networks: &[String]) -> Vec<IpCidr> {
    networks
        .iter()
        .filter_map(|net| match net.parse::<IpCidr>() {
            Ok(cidr) => Some(cidr),
            Err(err) => {
                warn!(target: LOG_TARGET, "Ignoring invalid allowed network '{}': {}", net, err);
                None
            },
        })
        .collect()
}

/// An empty allow-list admits everything. Non-IP hosts cannot be checked at
/// dial time and pass through; the accept path re-checks with the real peer
/// address.
fn address_in_allowed_networks(url: &Url, allowed: &[IpCidr]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match url.host_str().and_then(|h| h.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().ok()) {
        Some(ip) => allowed.iter().any(|cidr| cidr.contains(&ip)),
        None => true,
    }
}

/// Re-check of the allow-list against a concrete remote address, used on the
/// accept path.
pub(crate) fn remote_in_allowed_networks(remote_address: &str, networks: &[String]) -> bool {
    let allowed = parse_allowed_networks(networks);
    if allowed.is_empty() {
        return true;
    }
    match Url::parse(remote_address) {
        Ok(url) => address_in_allowed_networks(&url, &allowed),
        Err(_) => false,
    }
}

// The scheduler's moving parts (cool-down, bucketing, queue ordering) are
// unit-tested in next_dial.rs and via the end-to-end tests in tests/; the
// helpers below are covered directly.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_networks_filtering() {
        let allowed = parse_allowed_networks(&["192.168.0.0/16".to_string(), "bogus".to_string()]);
        assert_eq!(allowed.len(), 1);

        let inside = Url::parse("tcp://192.168.4.2:22000").unwrap();
        let outside = Url::parse("tcp://203.0.113.9:22000").unwrap();
        let named = Url::parse("tcp://peer.example.com:22000").unwrap();
        assert!(address_in_allowed_networks(&inside, &allowed));
        assert!(!address_in_allowed_networks(&outside, &allowed));
        // Unresolvable at dial time: allowed through
        assert!(address_in_allowed_networks(&named, &allowed));
        // Empty list admits everything
        assert!(address_in_allowed_networks(&outside, &[]));
    }

    #[test]
    fn remote_allow_list_check() {
        let networks = vec!["10.0.0.0/8".to_string()];
        assert!(remote_in_allowed_networks("tcp://10.1.2.3:4444", &networks));
        assert!(!remote_in_allowed_networks("tcp://203.0.113.9:4444", &networks));
        assert!(remote_in_allowed_networks("tcp://203.0.113.9:4444", &[]));
    }

    #[tokio::test]
    async fn dial_now_coalesces() {
        let (handle, mut rx) = DialNowHandle::new();
        for _ in 0..10 {
            handle.request_all();
        }
        // All ten requests collapse into a single wakeup
        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
        let pending = handle.take();
        assert!(pending.all);
    }

    #[tokio::test]
    async fn device_requests_accumulate() {
        let (handle, mut rx) = DialNowHandle::new();
        let a = DeviceId::from_certificate(b"a");
        let b = DeviceId::from_certificate(b"b");
        handle.request_device(a);
        handle.request_device(b);
        handle.request_device(a);
        rx.recv().await.unwrap();
        let pending = handle.take();
        assert!(!pending.all);
        assert_eq!(pending.devices.len(), 2);
    }
}
