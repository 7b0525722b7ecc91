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

//! The top-level connection service: owns the tracker, dial scheduler,
//! listener supervisor, packet scheduler, and migration manager, and exposes
//! the small external API the rest of the daemon consumes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use driftsync_shutdown::ShutdownSignal;
use log::*;
use tokio::sync::{broadcast, mpsc};

use crate::{
    collaborators::{Discovery, ProtocolRecipient, RateLimitRegistry, TlsHandshaker},
    config::ConfigStore,
    connection_manager::{
        exchange_hello,
        now_nanos,
        remote_in_allowed_networks,
        verify_common_name,
        verify_peer_identity,
        versions_compatible,
        ConnectionManagerError,
        ConnectionStatusEntry,
        ConnectionStatusRegistry,
        ConnectionTracker,
        DialNowHandle,
        DialScheduler,
        HelloError,
        ListenerStatusEntry,
        ListenerSupervisor,
        PeerConnection,
    },
    health::{AdaptiveTimeouts, HealthMonitor},
    lan::LanClassifier,
    migration::MigrationManager,
    scheduler::PacketScheduler,
    transports::{EstablishedStream, TransportContext, TransportRegistry},
    types::{CloseReason, ConnectionId, DeviceId, Hello},
};

const LOG_TARGET: &str = "comms::service";

const INTAKE_CHANNEL_SIZE: usize = 32;
const EVENT_CHANNEL_SIZE: usize = 64;
const QUALITY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Events published to embedders on a broadcast channel.
#[derive(Clone, Debug)]
pub enum ServiceEvent {
    ConnectionAdded(PeerConnection),
    ConnectionClosed {
        device_id: DeviceId,
        connection_id: ConnectionId,
        reason: CloseReason,
    },
    DeviceConnected(DeviceId),
    DeviceDisconnected(DeviceId),
    /// A listener's addresses, error, or NAT hint changed.
    ListenerChanged(String),
}

/// The connection management core of the daemon. Construct once, call
/// `serve` with a shutdown signal, and use the accessors from anywhere.
pub struct ConnectionService {
    config: Arc<ConfigStore>,
    registry: Arc<TransportRegistry>,
    discovery: Arc<dyn Discovery>,
    protocol: Arc<dyn ProtocolRecipient>,
    rate_limits: Arc<dyn RateLimitRegistry>,
    ctx: TransportContext,
    tracker: Arc<ConnectionTracker>,
    scheduler: Arc<PacketScheduler>,
    migration: Arc<MigrationManager>,
    timeouts: Arc<AdaptiveTimeouts>,
    status: Arc<ConnectionStatusRegistry>,
    listeners: Arc<Mutex<ListenerSupervisor>>,
    dial_now: DialNowHandle,
    dial_now_rx: Mutex<Option<mpsc::Receiver<()>>>,
    intake_rx: Mutex<Option<mpsc::Receiver<EstablishedStream>>>,
    listener_changed_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    events_tx: broadcast::Sender<ServiceEvent>,
}

impl ConnectionService {
    pub fn new(
        config: Arc<ConfigStore>,
        registry: TransportRegistry,
        tls: Arc<dyn TlsHandshaker>,
        discovery: Arc<dyn Discovery>,
        protocol: Arc<dyn ProtocolRecipient>,
        rate_limits: Arc<dyn RateLimitRegistry>,
    ) -> Self {
        let registry = Arc::new(registry);
        let lan = Arc::new(LanClassifier::new(&config.current()));
        let timeouts = Arc::new(AdaptiveTimeouts::new());
        let ctx = TransportContext {
            config: config.clone(),
            tls,
            lan,
            timeouts: timeouts.clone(),
        };
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CHANNEL_SIZE);
        let (dial_now, dial_now_rx) = DialNowHandle::new();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (listener_changed_tx, listener_changed_rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(Mutex::new(ListenerSupervisor::new(
            config.clone(),
            registry.clone(),
            ctx.clone(),
            intake_tx,
            listener_changed_tx,
        )));

        Self {
            tracker: Arc::new(ConnectionTracker::new(config.clone())),
            scheduler: Arc::new(PacketScheduler::new()),
            migration: Arc::new(MigrationManager::new()),
            status: Arc::new(ConnectionStatusRegistry::new()),
            listeners,
            dial_now,
            dial_now_rx: Mutex::new(Some(dial_now_rx)),
            intake_rx: Mutex::new(Some(intake_rx)),
            listener_changed_rx: Mutex::new(Some(listener_changed_rx)),
            events_tx,
            config,
            registry,
            discovery,
            protocol,
            rate_limits,
            ctx,
            timeouts,
        }
    }

    /// Seed the packet scheduler deterministically. Intended for tests.
    pub fn with_scheduler_seed(mut self, seed: u64) -> Self {
        self.scheduler = Arc::new(PacketScheduler::with_seed(seed));
        self
    }

    /// Run the service until the shutdown signal resolves. Starts the dial
    /// loop, the intake handler, and the configured listeners, and reacts to
    /// configuration commits.
    pub async fn serve(&self, shutdown: ShutdownSignal) {
        let Some(dial_now_rx) = self.dial_now_rx.lock().expect("service lock poisoned").take() else {
            warn!(target: LOG_TARGET, "serve called more than once, ignoring");
            return;
        };
        let intake_rx = self
            .intake_rx
            .lock()
            .expect("service lock poisoned")
            .take()
            .expect("intake receiver and dial-now receiver are taken together");
        let mut listener_changed_rx = self
            .listener_changed_rx
            .lock()
            .expect("service lock poisoned")
            .take()
            .expect("listener-changed receiver and dial-now receiver are taken together");

        // Intake channel is shared by the listeners (created in new) and the
        // dial scheduler
        let intake_tx = {
            let listeners = self.listeners.lock().expect("service lock poisoned");
            listeners.intake_sender()
        };

        self.listeners
            .lock()
            .expect("service lock poisoned")
            .apply_config(&shutdown);

        let dial_scheduler = DialScheduler::new(
            self.config.clone(),
            self.registry.clone(),
            self.ctx.clone(),
            self.discovery.clone(),
            self.protocol.clone(),
            self.tracker.clone(),
            self.timeouts.clone(),
            intake_tx,
            self.status.clone(),
            self.dial_now.clone(),
            dial_now_rx,
            shutdown.clone(),
        );
        tokio::spawn(dial_scheduler.run());

        self.spawn_intake_handler(intake_rx, shutdown.clone());
        self.spawn_quality_sweeper(shutdown.clone());

        let mut config_rx = self.config.subscribe();
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!(target: LOG_TARGET, "Connection service shutting down");
                    break;
                },
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(target: LOG_TARGET, "Configuration committed, re-evaluating listeners and dials");
                    self.listeners
                        .lock()
                        .expect("service lock poisoned")
                        .apply_config(&shutdown);
                    self.dial_now.request_all();
                },
                Some(address) = listener_changed_rx.recv() => {
                    let _ = self.events_tx.send(ServiceEvent::ListenerChanged(address));
                },
            }
        }

        self.listeners.lock().expect("service lock poisoned").stop_all();
        for device_id in self.tracker.connected_devices() {
            for connection in self.tracker.connections_for_device(&device_id) {
                connection.close(CloseReason::Shutdown);
            }
        }
    }

    fn spawn_intake_handler(&self, mut intake_rx: mpsc::Receiver<EstablishedStream>, shutdown: ShutdownSignal) {
        let worker = IntakeWorker {
            config: self.config.clone(),
            tracker: self.tracker.clone(),
            scheduler: self.scheduler.clone(),
            protocol: self.protocol.clone(),
            rate_limits: self.rate_limits.clone(),
            status: self.status.clone(),
            dial_now: self.dial_now.clone(),
            events_tx: self.events_tx.clone(),
        };
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    established = intake_rx.recv() => {
                        let Some(established) = established else { break };
                        let worker = worker.clone();
                        // One short-lived hello worker per incoming stream
                        tokio::spawn(async move { worker.handle_established(established).await });
                    },
                }
            }
        });
    }

    /// Periodic sweep refreshing each connection's composite score from its
    /// latest measurements, so convergence decisions track reality even
    /// without traffic.
    fn spawn_quality_sweeper(&self, shutdown: ShutdownSignal) {
        let tracker = self.tracker.clone();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(QUALITY_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        for device_id in tracker.connected_devices() {
                            for connection in tracker.connections_for_device(&device_id) {
                                tracker.update_connection_quality(&connection);
                            }
                        }
                    },
                }
            }
        });
    }

    pub fn listener_status(&self) -> HashMap<String, ListenerStatusEntry> {
        self.listeners.lock().expect("service lock poisoned").status()
    }

    /// Latest dial outcome per address.
    pub fn connection_status(&self) -> HashMap<String, ConnectionStatusEntry> {
        self.status.snapshot()
    }

    pub fn nat_type(&self) -> String {
        self.listeners.lock().expect("service lock poisoned").nat_type()
    }

    pub fn get_connected_devices(&self) -> Vec<DeviceId> {
        self.tracker.connected_devices()
    }

    pub fn get_connections_for_device(&self, device_id: &DeviceId) -> Vec<PeerConnection> {
        self.tracker.connections_for_device(device_id)
    }

    pub fn packet_scheduler(&self) -> Arc<PacketScheduler> {
        self.scheduler.clone()
    }

    pub fn migration_manager(&self) -> Arc<MigrationManager> {
        self.migration.clone()
    }

    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        self.tracker.clone()
    }

    /// Force a dial pass; non-blocking, concurrent calls coalesce into at
    /// most one extra iteration.
    pub fn dial_now(&self) {
        self.dial_now.request_all();
    }

    pub fn all_addresses(&self) -> Vec<String> {
        self.listeners.lock().expect("service lock poisoned").all_addresses()
    }

    pub fn external_addresses(&self) -> Vec<String> {
        self.listeners.lock().expect("service lock poisoned").external_addresses()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events_tx.subscribe()
    }
}

/// Everything a hello worker needs, cheap to clone per incoming stream.
#[derive(Clone)]
struct IntakeWorker {
    config: Arc<ConfigStore>,
    tracker: Arc<ConnectionTracker>,
    scheduler: Arc<PacketScheduler>,
    protocol: Arc<dyn ProtocolRecipient>,
    rate_limits: Arc<dyn RateLimitRegistry>,
    status: Arc<ConnectionStatusRegistry>,
    dial_now: DialNowHandle,
    events_tx: broadcast::Sender<ServiceEvent>,
}

impl IntakeWorker {
    /// Validate and admit one freshly established stream: identity checks,
    /// early admission, hello exchange, common-name check, then hand-off to
    /// the tracker and protocol layer.
    async fn handle_established(&self, established: EstablishedStream) {
        let remote_address = established.remote_address.clone();
        match self.admit(established).await {
            Ok(device_id) => {
                trace!(
                    target: LOG_TARGET,
                    "Admitted connection to '{}' from {}",
                    device_id.short_str(),
                    remote_address
                );
            },
            Err(err) => {
                match err {
                    ConnectionManagerError::Hello(ref hello_err) => {
                        warn!(
                            target: LOG_TARGET,
                            "Rejected connection from {}: {}", remote_address, hello_err
                        );
                    },
                    ref policy => {
                        debug!(
                            target: LOG_TARGET,
                            "Dropped connection from {}: {}", remote_address, policy
                        );
                    },
                }
                self.status.set_status(&remote_address, Some(err.to_string()));
            },
        }
    }

    async fn admit(&self, established: EstablishedStream) -> Result<DeviceId, ConnectionManagerError> {
        let options = self.config.current();
        let mut stream = established.stream;

        let device_id = verify_peer_identity(stream.as_ref(), &options.device_id)?;
        if let Some(expected) = established.expected_device {
            if expected != device_id {
                return Err(ConnectionManagerError::Hello(HelloError::UnexpectedDevice {
                    expected: expected.short_str(),
                    actual: device_id.short_str(),
                }));
            }
        }

        // Early admission, before spending a hello exchange on it
        let Some(device) = options.device(&device_id) else {
            return Err(ConnectionManagerError::UnknownDevice);
        };
        if options.is_ignored(&device_id) {
            return Err(ConnectionManagerError::DeviceIgnored);
        }
        if device.paused {
            return Err(ConnectionManagerError::DevicePaused);
        }
        if !remote_in_allowed_networks(&established.remote_address, &device.allowed_networks) {
            return Err(ConnectionManagerError::NetworkNotAllowed);
        }
        if options.connection_limit_max > 0 && self.tracker.total_connections() >= options.connection_limit_max {
            return Err(ConnectionManagerError::ConnectionLimitReached);
        }
        let current = self.tracker.connection_count(&device_id);
        let desired = self.tracker.desired_connections_to_device(&device_id);
        let worst = self.tracker.worst_connection_priority(&device_id);
        if current >= desired &&
            established.priority > worst.saturating_sub(options.connection_priority_upgrade_threshold)
        {
            return Err(ConnectionManagerError::NotAnUpgrade {
                new_priority: established.priority,
                worst,
            });
        }

        let local_timestamp = now_nanos();
        let local_hello = Hello {
            client_name: options.client_name.clone(),
            client_version: options.client_version.clone(),
            // Only name ourselves to devices we already know
            device_name: options.device_name.clone(),
            timestamp: local_timestamp,
            num_connections: device.num_connections,
        };
        let remote_hello = exchange_hello(&mut stream, local_hello).await?;
        if !versions_compatible(&options.client_version, &remote_hello.client_version) {
            return Err(ConnectionManagerError::Hello(HelloError::IncompatibleVersion(
                remote_hello.client_version,
            )));
        }

        self.protocol
            .on_hello(device_id, &established.remote_address, &remote_hello)
            .await
            .map_err(ConnectionManagerError::ProtocolVeto)?;

        let expected_name = if device.cert_name.is_empty() {
            options.client_name.as_str()
        } else {
            device.cert_name.as_str()
        };
        verify_common_name(stream.as_ref(), expected_name)?;

        let connection_id = ConnectionId::generate(local_timestamp, remote_hello.timestamp, &mut rand::thread_rng());
        let stream = self.rate_limits.wrap(&device_id, stream);
        let health = Arc::new(HealthMonitor::new(self.config.clone()));
        let connection = PeerConnection::new(
            connection_id,
            device_id,
            established.transport.to_string(),
            established.direction,
            established.remote_address.clone(),
            established.is_local,
            established.priority,
            stream,
            health,
        );
        connection.spawn_monitor_ticker();

        let first_connection = self.tracker.connection_count(&device_id) == 0;
        self.tracker.account_added_connection(connection.clone(), &remote_hello);
        self.scheduler.register_connection(connection.clone());
        self.spawn_close_watcher(connection.clone());

        self.protocol.add_connection(connection.clone(), remote_hello).await;
        self.status.set_status(&established.remote_address, None);

        let _ = self.events_tx.send(ServiceEvent::ConnectionAdded(connection));
        if first_connection {
            let _ = self.events_tx.send(ServiceEvent::DeviceConnected(device_id));
        }
        Ok(device_id)
    }

    /// One watcher per live connection, parked on its closed signal.
    fn spawn_close_watcher(&self, connection: PeerConnection) {
        let tracker = self.tracker.clone();
        let scheduler = self.scheduler.clone();
        let dial_now = self.dial_now.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut signal = connection.closed_signal();
            signal.wait().await;

            let device_id = *connection.device_id();
            let reason = connection.close_reason().unwrap_or(CloseReason::Error);
            tracker.account_removed_connection(&connection);
            scheduler.unregister_connection(&connection);

            let _ = events_tx.send(ServiceEvent::ConnectionClosed {
                device_id,
                connection_id: connection.id().clone(),
                reason,
            });
            if tracker.connection_count(&device_id) == 0 {
                let _ = events_tx.send(ServiceEvent::DeviceDisconnected(device_id));
                // Ask the dial loop to try this device again soon
                if reason != CloseReason::Shutdown {
                    dial_now.request_device(device_id);
                }
            }
        });
    }
}
