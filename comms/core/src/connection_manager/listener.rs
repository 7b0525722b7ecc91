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

//! Starts and stops listeners as the configuration changes, supervising each
//! with restart backoff.

use std::{collections::HashMap, sync::Arc, time::Duration};

use driftsync_shutdown::{Shutdown, ShutdownSignal};
use log::*;
use tokio::sync::mpsc;

use crate::{
    backoff::{Backoff, ConstantBackoff},
    config::ConfigStore,
    transports::{parse_canonical, EstablishedStream, ListenerState, TransportContext, TransportRegistry},
};

const LOG_TARGET: &str = "comms::connection_manager::listener";

/// Failures tolerated before the restart backoff kicks in.
const RESTART_THRESHOLD: u32 = 2;
const RESTART_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ListenerStatusEntry {
    pub error: Option<String>,
    pub lan_addresses: Vec<String>,
    pub wan_addresses: Vec<String>,
}

struct ListenerHandle {
    state: Arc<ListenerState>,
    shutdown: Option<Shutdown>,
}

impl ListenerHandle {
    fn stop(&mut self) {
        if let Some(mut shutdown) = self.shutdown.take() {
            shutdown.trigger();
        }
    }
}

/// Owns the live listeners. Driven by the service facade on every
/// configuration commit.
pub(crate) struct ListenerSupervisor {
    config: Arc<ConfigStore>,
    registry: Arc<TransportRegistry>,
    ctx: TransportContext,
    intake_tx: mpsc::Sender<EstablishedStream>,
    changed_tx: mpsc::UnboundedSender<String>,
    live: HashMap<String, ListenerHandle>,
}

impl ListenerSupervisor {
    pub fn new(
        config: Arc<ConfigStore>,
        registry: Arc<TransportRegistry>,
        ctx: TransportContext,
        intake_tx: mpsc::Sender<EstablishedStream>,
        changed_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            config,
            registry,
            ctx,
            intake_tx,
            changed_tx,
            live: HashMap::new(),
        }
    }

    /// The intake channel accepted connections are published on, shared with
    /// the dial scheduler.
    pub fn intake_sender(&self) -> mpsc::Sender<EstablishedStream> {
        self.intake_tx.clone()
    }

    /// Diff the declared listen addresses against the live set: start new
    /// ones, stop removed ones, leave the rest.
    pub fn apply_config(&mut self, shutdown: &ShutdownSignal) {
        let options = self.config.current();
        let declared: Vec<String> = options.listen_addresses.clone();

        let removed: Vec<String> = self
            .live
            .keys()
            .filter(|address| !declared.contains(address))
            .cloned()
            .collect();
        for address in removed {
            info!(target: LOG_TARGET, "Stopping listener on {}", address);
            if let Some(mut handle) = self.live.remove(&address) {
                handle.stop();
            }
        }

        for address in declared {
            if self.live.contains_key(&address) {
                continue;
            }
            self.start_listener(address, shutdown);
        }
    }

    fn start_listener(&mut self, address: String, shutdown: &ShutdownSignal) {
        let uri = match parse_canonical(&address) {
            Ok(uri) => uri,
            Err(err) => {
                // Rejected with a diagnostic, never fatal
                warn!(target: LOG_TARGET, "Refusing to listen on '{}': {}", address, err);
                let state = Arc::new(ListenerState::new(
                    url::Url::parse("tcp://0.0.0.0:0").expect("static url is valid"),
                ));
                state.set_error(Some(err.to_string()));
                self.live.insert(address, ListenerHandle { state, shutdown: None });
                return;
            },
        };

        let factory = match self.registry.get_enabled(uri.scheme(), &self.config.current()) {
            Ok(factory) => factory,
            Err(err) => {
                warn!(target: LOG_TARGET, "Cannot listen on '{}': {}", address, err);
                let state = Arc::new(ListenerState::new(uri));
                state.set_error(Some(err.to_string()));
                self.live.insert(address, ListenerHandle { state, shutdown: None });
                return;
            },
        };

        info!(target: LOG_TARGET, "Starting listener on {}", uri);
        let state = Arc::new(ListenerState::new(uri.clone()));
        // Forward per-listener state changes to the service
        let mut changed_rx = state.subscribe_changed();
        let changed_tx = self.changed_tx.clone();
        let changed_address = address.clone();
        tokio::spawn(async move {
            while changed_rx.changed().await.is_ok() {
                if changed_tx.send(changed_address.clone()).is_err() {
                    break;
                }
            }
        });

        let listener_shutdown = Shutdown::new();
        let mut signal = listener_shutdown.to_signal();
        // Tie the child listener to the service lifetime
        let mut service_signal = shutdown.clone();

        let ctx = self.ctx.clone();
        let intake_tx = self.intake_tx.clone();
        let supervised_state = state.clone();
        tokio::spawn(async move {
            let backoff = ConstantBackoff::new(RESTART_BACKOFF);
            let mut consecutive_failures = 0u32;
            loop {
                let mut listener = match factory.new_listener(uri.clone(), &ctx) {
                    Ok(listener) => listener,
                    Err(err) => {
                        warn!(target: LOG_TARGET, "Cannot create listener for {}: {}", uri, err);
                        supervised_state.set_error(Some(err.to_string()));
                        return;
                    },
                };
                let result = tokio::select! {
                    _ = service_signal.wait() => return,
                    result = listener.serve(supervised_state.clone(), intake_tx.clone(), signal.clone()) => result,
                };
                if signal.is_triggered() || service_signal.is_triggered() {
                    return;
                }
                match result {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(target: LOG_TARGET, "Listener on {} failed: {}", uri, err);
                        supervised_state.set_error(Some(err.to_string()));
                        consecutive_failures += 1;
                        let delay = if consecutive_failures >= RESTART_THRESHOLD {
                            consecutive_failures = 0;
                            backoff.calculate_backoff(1)
                        } else {
                            Duration::from_secs(1)
                        };
                        tokio::select! {
                            _ = service_signal.wait() => return,
                            _ = signal.wait() => return,
                            _ = tokio::time::sleep(delay) => {},
                        }
                    },
                }
            }
        });

        self.live.insert(address, ListenerHandle {
            state,
            shutdown: Some(listener_shutdown),
        });
    }

    pub fn status(&self) -> HashMap<String, ListenerStatusEntry> {
        self.live
            .iter()
            .map(|(address, handle)| {
                (address.clone(), ListenerStatusEntry {
                    error: handle.state.error(),
                    lan_addresses: handle.state.lan_addresses(),
                    wan_addresses: handle.state.wan_addresses(),
                })
            })
            .collect()
    }

    /// The first listener hint that is not "unknown".
    pub fn nat_type(&self) -> String {
        self.live
            .values()
            .map(|handle| handle.state.nat_type())
            .find(|nat| nat != "unknown")
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn all_addresses(&self) -> Vec<String> {
        let mut addresses = Vec::new();
        for handle in self.live.values() {
            addresses.extend(handle.state.lan_addresses());
            addresses.extend(handle.state.wan_addresses());
        }
        addresses.sort();
        addresses.dedup();
        addresses
    }

    pub fn external_addresses(&self) -> Vec<String> {
        let omit_lan = self.config.current().omit_lan_external_addresses;
        let mut addresses = Vec::new();
        for handle in self.live.values() {
            if !omit_lan {
                addresses.extend(handle.state.lan_addresses());
            }
            addresses.extend(handle.state.wan_addresses());
        }
        addresses.sort();
        addresses.dedup();
        addresses
    }

    pub fn stop_all(&mut self) {
        for (_, handle) in self.live.iter_mut() {
            handle.stop();
        }
        self.live.clear();
    }
}
