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

//! Interfaces to the services this crate collaborates with but does not own:
//! device discovery, the wire protocol layer, rate limiting, and the TLS
//! handshake. Their failures cross the boundary as `anyhow::Error`.

use std::{collections::HashMap, io};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{
    connection_manager::PeerConnection,
    types::{DeviceId, Hello},
};

/// Name-to-addresses lookup for devices configured with the `"dynamic"`
/// address placeholder.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn lookup(&self, device_id: &DeviceId) -> Result<Vec<String>, anyhow::Error>;
}

/// Discovery that never finds anything.
pub struct NoDiscovery;

#[async_trait]
impl Discovery for NoDiscovery {
    async fn lookup(&self, _: &DeviceId) -> Result<Vec<String>, anyhow::Error> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeviceStatistics {
    pub last_seen: Option<DateTime<Utc>>,
}

/// The protocol layer that consumes authenticated streams.
#[async_trait]
pub trait ProtocolRecipient: Send + Sync {
    /// Pre-admission veto, called once the remote hello has been read. An
    /// error closes the connection.
    async fn on_hello(&self, remote_id: DeviceId, remote_addr: &str, hello: &Hello) -> Result<(), anyhow::Error>;

    /// Hand over an admitted connection.
    async fn add_connection(&self, connection: PeerConnection, hello: Hello);

    /// Used to rank devices by last-seen when ordering the dial queue.
    fn device_statistics(&self) -> Result<HashMap<DeviceId, DeviceStatistics>, anyhow::Error>;
}

/// An authenticated duplex byte stream as produced by the TLS collaborator.
pub trait SecureStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// DER bytes of the certificates the peer presented.
    fn peer_certificates(&self) -> Vec<Vec<u8>>;

    /// Common name from the peer's leaf certificate, if present.
    fn peer_common_name(&self) -> Option<String>;
}

/// Performs the TLS handshake on freshly dialed or accepted TCP streams.
/// Certificate generation and verification policy live with the implementor.
#[async_trait]
pub trait TlsHandshaker: Send + Sync {
    async fn connect(&self, server_name: &str, stream: TcpStream) -> io::Result<Box<dyn SecureStream>>;
    async fn accept(&self, stream: TcpStream) -> io::Result<Box<dyn SecureStream>>;
}

/// Wraps admitted streams in the embedder's rate limiters.
pub trait RateLimitRegistry: Send + Sync {
    fn wrap(&self, device_id: &DeviceId, stream: Box<dyn SecureStream>) -> Box<dyn SecureStream>;
}

/// Rate limiting that passes streams through untouched.
pub struct NoRateLimit;

impl RateLimitRegistry for NoRateLimit {
    fn wrap(&self, _: &DeviceId, stream: Box<dyn SecureStream>) -> Box<dyn SecureStream> {
        stream
    }
}
