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
use driftsync_shutdown::ShutdownSignal;
use log::*;
use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use url::Url;

use super::{
    EstablishedStream,
    ListenerState,
    TransportContext,
    TransportDialer,
    TransportError,
    TransportFactory,
    TransportListener,
    TCP_SCHEME,
};
use crate::{config::Options, types::ConnectionDirection};

const LOG_TARGET: &str = "comms::transports::tcp";

/// Direct TCP, on LAN and WAN. The same transport serves both; the LAN
/// classifier decides which priority applies per address.
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn scheme(&self) -> &'static str {
        TCP_SCHEME
    }

    fn valid(&self, options: &Options) -> Result<(), TransportError> {
        if !options.tcp_enabled {
            return Err(TransportError::SchemeDisabled(TCP_SCHEME));
        }
        Ok(())
    }

    fn new_dialer(&self, ctx: &TransportContext) -> Arc<dyn TransportDialer> {
        Arc::new(TcpDialer { ctx: ctx.clone() })
    }

    fn new_listener(&self, uri: Url, ctx: &TransportContext) -> Result<Box<dyn TransportListener>, TransportError> {
        Ok(Box::new(TcpPeerListener {
            uri,
            ctx: ctx.clone(),
        }))
    }
}

struct TcpDialer {
    ctx: TransportContext,
}

#[async_trait]
impl TransportDialer for TcpDialer {
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
        let peer_addr = tcp.peer_addr()?;

        let tls_timeout = self.ctx.timeouts.adaptive_tls_handshake_timeout();
        let stream = timeout(tls_timeout, self.ctx.tls.connect(host, tcp))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)??;

        let is_local = self.ctx.lan.is_lan(&peer_addr.ip());
        let options = self.ctx.config.current();
        Ok(EstablishedStream {
            stream,
            remote_address: address.to_string(),
            transport: TCP_SCHEME,
            is_local,
            priority: if is_local {
                options.tcp_lan_priority
            } else {
                options.tcp_wan_priority
            },
            direction: ConnectionDirection::Outbound,
            expected_device: None,
        })
    }

    fn priority(&self, host: &str) -> i32 {
        let options = self.ctx.config.current();
        if self.ctx.lan.is_lan_host(host) {
            options.tcp_lan_priority
        } else {
            options.tcp_wan_priority
        }
    }

    fn best_priority(&self) -> i32 {
        self.ctx.config.current().tcp_lan_priority
    }

    fn redial_frequency(&self) -> Duration {
        self.ctx.config.current().reconnect_interval
    }
}

struct TcpPeerListener {
    uri: Url,
    ctx: TransportContext,
}

#[async_trait]
impl TransportListener for TcpPeerListener {
    async fn serve(
        &mut self,
        state: Arc<ListenerState>,
        intake: mpsc::Sender<EstablishedStream>,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), TransportError> {
        let options = self.ctx.config.current();
        let host = self.uri.host_str().unwrap_or("0.0.0.0").to_string();
        let mut port = self.uri.port().unwrap_or(0);
        if port == 0 && options.random_ports_enabled && options.random_port_range_start <= options.random_port_range_end
        {
            port = rand::thread_rng().gen_range(options.random_port_range_start..=options.random_port_range_end);
        }

        let listener = match TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(err) => {
                state.set_error(Some(err.to_string()));
                return Err(err.into());
            },
        };
        let local_addr = listener.local_addr()?;
        state.set_error(None);

        let bound = format!("tcp://{}", local_addr);
        if local_addr.ip().is_loopback() {
            state.set_addresses(vec![bound], vec![]);
        } else {
            state.set_addresses(vec![bound.clone()], vec![bound]);
        }
        info!(target: LOG_TARGET, "Listening on tcp://{}", local_addr);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!(target: LOG_TARGET, "TCP listener on {} shutting down", local_addr);
                    return Ok(());
                },
                accepted = listener.accept() => {
                    let (tcp, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(target: LOG_TARGET, "Accept failed on {}: {}", local_addr, err);
                            state.set_error(Some(err.to_string()));
                            return Err(err.into());
                        },
                    };
                    let ctx = self.ctx.clone();
                    let intake = intake.clone();
                    tokio::spawn(async move {
                        if let Err(err) = accept_one(ctx, intake, tcp, peer_addr).await {
                            debug!(
                                target: LOG_TARGET,
                                "Inbound connection from {} failed before hello: {}", peer_addr, err
                            );
                        }
                    });
                },
            }
        }
    }
}

async fn accept_one(
    ctx: TransportContext,
    intake: mpsc::Sender<EstablishedStream>,
    tcp: TcpStream,
    peer_addr: std::net::SocketAddr,
) -> Result<(), TransportError> {
    tcp.set_nodelay(true)?;
    let tls_timeout = ctx.timeouts.adaptive_tls_handshake_timeout();
    let stream = timeout(tls_timeout, ctx.tls.accept(tcp))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;

    let is_local = ctx.lan.is_lan(&peer_addr.ip());
    let options = ctx.config.current();
    let established = EstablishedStream {
        stream,
        remote_address: format!("tcp://{}", peer_addr),
        transport: TCP_SCHEME,
        is_local,
        priority: if is_local {
            options.tcp_lan_priority
        } else {
            options.tcp_wan_priority
        },
        direction: ConnectionDirection::Inbound,
        expected_device: None,
    };
    let _ = intake.send(established).await;
    Ok(())
}
