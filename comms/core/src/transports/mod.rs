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

//! Pluggable transports, keyed by URL scheme. Each factory produces dialers
//! and listeners carrying a declared priority; the registry distinguishes
//! unknown schemes from disabled ones so callers can quietly skip the
//! latter.

mod relay;
mod tcp;

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use driftsync_shutdown::ShutdownSignal;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use url::Url;

pub use relay::RelayTransportFactory;
pub use tcp::TcpTransportFactory;

use crate::{
    collaborators::{SecureStream, TlsHandshaker},
    config::{ConfigStore, Options},
    health::AdaptiveTimeouts,
    lan::LanClassifier,
    types::{ConnectionDirection, DeviceId},
};

pub const TCP_SCHEME: &str = "tcp";
pub const RELAY_SCHEME: &str = "relay";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unknown address scheme '{0}'")]
    UnknownScheme(String),
    #[error("Address scheme '{0}' is disabled by configuration")]
    SchemeDisabled(&'static str),
    #[error("Address scheme '{0}' is deprecated")]
    SchemeDeprecated(&'static str),
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Scheme '{0}' does not support listening")]
    ListenNotSupported(&'static str),
    #[error("Dial timed out")]
    DialTimeout,
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a factory needs to instantiate a dialer or listener.
#[derive(Clone)]
pub struct TransportContext {
    pub config: Arc<ConfigStore>,
    pub tls: Arc<dyn TlsHandshaker>,
    pub lan: Arc<LanClassifier>,
    pub timeouts: Arc<AdaptiveTimeouts>,
}

/// A freshly dialed or accepted stream with a completed TLS handshake,
/// heading for the hello exchange.
pub struct EstablishedStream {
    pub stream: Box<dyn SecureStream>,
    pub remote_address: String,
    pub transport: &'static str,
    pub is_local: bool,
    pub priority: i32,
    pub direction: ConnectionDirection,
    /// For dialed streams, the device this dial was for; the peer's actual
    /// identity must match. Accepted streams carry no expectation.
    pub expected_device: Option<DeviceId>,
}

#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(&self, address: &Url) -> Result<EstablishedStream, TransportError>;

    /// Priority of a connection to the given host, lower is better.
    fn priority(&self, host: &str) -> i32;

    /// The best priority this dialer can produce.
    fn best_priority(&self) -> i32;

    fn allows_multi_conns(&self) -> bool {
        true
    }

    fn always_wan(&self) -> bool {
        false
    }

    /// How long to wait before redialing an address through this transport.
    fn redial_frequency(&self) -> Duration;
}

#[async_trait]
pub trait TransportListener: Send {
    /// Bind and accept until shutdown, publishing accepted streams to the
    /// intake channel and address/error updates to the shared state.
    async fn serve(
        &mut self,
        state: Arc<ListenerState>,
        intake: mpsc::Sender<EstablishedStream>,
        shutdown: ShutdownSignal,
    ) -> Result<(), TransportError>;
}

pub trait TransportFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Whether this transport may be used under the given configuration.
    /// Returns `SchemeDisabled` or `SchemeDeprecated` errors.
    fn valid(&self, options: &Options) -> Result<(), TransportError>;

    fn new_dialer(&self, ctx: &TransportContext) -> Arc<dyn TransportDialer>;

    fn new_listener(&self, uri: Url, ctx: &TransportContext) -> Result<Box<dyn TransportListener>, TransportError>;
}

/// Scheme-keyed factories. Built by the service facade at construction time
/// and shared by the dial scheduler and listener supervisor.
#[derive(Default)]
pub struct TransportRegistry {
    factories: HashMap<&'static str, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// A registry with the built-in TCP and relay transports.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TcpTransportFactory));
        registry.register(Arc::new(RelayTransportFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(factory.scheme(), factory);
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn TransportFactory>, TransportError> {
        self.factories
            .get(scheme)
            .cloned()
            .ok_or_else(|| TransportError::UnknownScheme(scheme.to_string()))
    }

    /// Like `get`, but also enforces the factory's configuration validity.
    pub fn get_enabled(&self, scheme: &str, options: &Options) -> Result<Arc<dyn TransportFactory>, TransportError> {
        let factory = self.get(scheme)?;
        factory.valid(options)?;
        Ok(factory)
    }

    pub fn factories(&self) -> Vec<Arc<dyn TransportFactory>> {
        self.factories.values().cloned().collect()
    }

    pub fn enabled_factories(&self, options: &Options) -> Vec<Arc<dyn TransportFactory>> {
        self.factories
            .values()
            .filter(|f| f.valid(options).is_ok())
            .cloned()
            .collect()
    }
}

/// Parse an address, requiring the canonical string form round-trips.
pub fn parse_canonical(address: &str) -> Result<Url, TransportError> {
    let url = Url::parse(address).map_err(|err| TransportError::InvalidAddress {
        address: address.to_string(),
        reason: err.to_string(),
    })?;
    if url.as_str() != address {
        return Err(TransportError::InvalidAddress {
            address: address.to_string(),
            reason: format!("not in canonical form, expected '{}'", url),
        });
    }
    if url.host_str().map(|h| h.is_empty()).unwrap_or(true) {
        return Err(TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Shared status of one listener, updated by its serve task and read by the
/// service facade. Changes are signalled on a watch channel the facade
/// converts into an event.
#[derive(Debug)]
pub struct ListenerState {
    uri: Url,
    lan_addresses: Mutex<Vec<String>>,
    wan_addresses: Mutex<Vec<String>>,
    error: Mutex<Option<String>>,
    nat_type: Mutex<String>,
    changed_tx: watch::Sender<()>,
}

impl ListenerState {
    pub fn new(uri: Url) -> Self {
        let (changed_tx, _) = watch::channel(());
        Self {
            uri,
            lan_addresses: Mutex::new(Vec::new()),
            wan_addresses: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            nat_type: Mutex::new("unknown".to_string()),
            changed_tx,
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn lan_addresses(&self) -> Vec<String> {
        self.lan_addresses.lock().expect("listener state lock poisoned").clone()
    }

    pub fn wan_addresses(&self) -> Vec<String> {
        self.wan_addresses.lock().expect("listener state lock poisoned").clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("listener state lock poisoned").clone()
    }

    pub fn nat_type(&self) -> String {
        self.nat_type.lock().expect("listener state lock poisoned").clone()
    }

    pub fn subscribe_changed(&self) -> watch::Receiver<()> {
        self.changed_tx.subscribe()
    }

    pub fn set_addresses(&self, lan: Vec<String>, wan: Vec<String>) {
        *self.lan_addresses.lock().expect("listener state lock poisoned") = lan;
        *self.wan_addresses.lock().expect("listener state lock poisoned") = wan;
        let _ = self.changed_tx.send(());
    }

    pub fn set_error(&self, error: Option<String>) {
        *self.error.lock().expect("listener state lock poisoned") = error;
        let _ = self.changed_tx.send(());
    }

    pub fn set_nat_type(&self, nat_type: String) {
        *self.nat_type.lock().expect("listener state lock poisoned") = nat_type;
        let _ = self.changed_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trip_is_required() {
        assert!(parse_canonical("tcp://192.0.2.1:22000").is_ok());
        assert!(parse_canonical("relay://relay.example.com:22067").is_ok());

        // Uppercase schemes normalize, so the input is not canonical
        match parse_canonical("TCP://192.0.2.1:22000") {
            Err(TransportError::InvalidAddress { .. }) => {},
            other => panic!("unexpected {:?}", other.map(|u| u.to_string())),
        }
        assert!(parse_canonical("not a url").is_err());
        assert!(parse_canonical("tcp://").is_err());
    }

    #[test]
    fn registry_distinguishes_unknown_from_disabled() {
        let registry = TransportRegistry::with_defaults();
        let options = Options {
            relay_enabled: false,
            ..Default::default()
        };

        assert!(matches!(
            registry.get_enabled("quic", &options),
            Err(TransportError::UnknownScheme(_))
        ));
        assert!(matches!(
            registry.get_enabled("relay", &options),
            Err(TransportError::SchemeDisabled("relay"))
        ));
        assert!(registry.get_enabled("tcp", &options).is_ok());
        assert_eq!(registry.enabled_factories(&options).len(), 1);
    }

    #[test]
    fn listener_state_signals_changes() {
        let state = ListenerState::new(Url::parse("tcp://0.0.0.0:22000").unwrap());
        let mut rx = state.subscribe_changed();
        assert!(!rx.has_changed().unwrap());
        state.set_addresses(vec!["tcp://192.168.1.5:22000".to_string()], vec![]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(state.lan_addresses(), vec!["tcp://192.168.1.5:22000".to_string()]);
        assert_eq!(state.nat_type(), "unknown");
    }
}
