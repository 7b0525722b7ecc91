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

use async_trait::async_trait;
use tokio::{net::TcpStream, time::timeout};
use url::Url;

use super::{
    EstablishedStream,
    TransportContext,
    TransportDialer,
    TransportError,
    TransportFactory,
    TransportListener,
    RELAY_SCHEME,
};
use crate::{config::Options, types::ConnectionDirection};

/// Relayed TCP via a rendezvous server. Always WAN, one connection per
/// device, and the lowest preference of the built-in transports. The relay
/// merely forwards bytes; the TLS session is still end-to-end with the
/// joined device.
pub struct RelayTransportFactory;

impl TransportFactory for RelayTransportFactory {
    fn scheme(&self) -> &'static str {
        RELAY_SCHEME
    }

    fn valid(&self, options: &Options) -> Result<(), TransportError> {
        if !options.relay_enabled {
            return Err(TransportError::SchemeDisabled(RELAY_SCHEME));
        }
        Ok(())
    }

    fn new_dialer(&self, ctx: &TransportContext) -> Arc<dyn TransportDialer> {
        Arc::new(RelayDialer { ctx: ctx.clone() })
    }

    fn new_listener(&self, _uri: Url, _ctx: &TransportContext) -> Result<Box<dyn TransportListener>, TransportError> {
        Err(TransportError::ListenNotSupported(RELAY_SCHEME))
    }
}

struct RelayDialer {
    ctx: TransportContext,
}

#[async_trait]
impl TransportDialer for RelayDialer {
    async fn dial(&self, address: &Url) -> Result<EstablishedStream, TransportError> {
        let host = address.host_str().ok_or_else(|| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "missing host".to_string(),
        })?;
        let port = address.port().ok_or_else(|| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "missing port".to_string(),
        })?;

        let dial_timeout = self.ctx.timeouts.progressive_dial_timeout(address.as_str());
        let tcp = timeout(dial_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::DialTimeout)??;
        tcp.set_nodelay(true)?;

        let tls_timeout = self.ctx.timeouts.adaptive_tls_handshake_timeout();
        let stream = timeout(tls_timeout, self.ctx.tls.connect(host, tcp))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)??;

        Ok(EstablishedStream {
            stream,
            remote_address: address.to_string(),
            transport: RELAY_SCHEME,
            is_local: false,
            priority: self.ctx.config.current().relay_priority,
            direction: ConnectionDirection::Outbound,
            expected_device: None,
        })
    }

    fn priority(&self, _host: &str) -> i32 {
        self.ctx.config.current().relay_priority
    }

    fn best_priority(&self) -> i32 {
        self.ctx.config.current().relay_priority
    }

    fn allows_multi_conns(&self) -> bool {
        false
    }

    fn always_wan(&self) -> bool {
        true
    }

    fn redial_frequency(&self) -> Duration {
        // Relays are the fallback path; redial them at a gentler pace
        self.ctx.config.current().reconnect_interval * 2
    }
}
