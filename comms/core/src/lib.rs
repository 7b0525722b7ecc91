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

//! # driftsync_comms
//!
//! Connection management for the Driftsync peer-to-peer file
//! synchronisation daemon: for each configured remote device it maintains
//! one or more mutually authenticated streams over heterogeneous transports
//! (direct TCP on LAN and WAN, relayed TCP, and anything registered through
//! the same factory interface), and continuously optimizes which streams are
//! active according to measured quality.
//!
//! The entry point is [`service::ConnectionService`]. Identity, TLS, the
//! wire protocol, discovery, and rate limiting are collaborator seams
//! defined in [`collaborators`].

pub mod backoff;
pub mod collaborators;
pub mod config;
pub mod connection_manager;
pub mod health;
pub mod lan;
pub mod migration;
pub mod quality;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod transports;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{Compression, ConfigStore, DeviceOptions, Options};
pub use connection_manager::{ConnectionTracker, PeerConnection};
pub use service::{ConnectionService, ServiceEvent};
pub use types::{CloseReason, ConnectionDirection, ConnectionId, DeviceId, Hello};
