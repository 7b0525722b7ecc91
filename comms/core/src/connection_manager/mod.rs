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

//! Dialing, listening, hello exchange, and per-device connection tracking.

mod dialer;
mod error;
mod hello;
mod listener;
mod next_dial;
mod peer_connection;
mod tracker;

#[cfg(test)]
mod tests;

pub use dialer::{ConnectionStatusEntry, ConnectionStatusRegistry, DialNowHandle};
pub(crate) use dialer::{remote_in_allowed_networks, DialScheduler};
pub use error::{ConnectionManagerError, HelloError};
pub use hello::{
    exchange_hello,
    now_nanos,
    verify_common_name,
    verify_peer_identity,
    versions_compatible,
    HelloCodec,
    HELLO_TIMEOUT,
};
pub use listener::ListenerStatusEntry;
pub(crate) use listener::ListenerSupervisor;
pub use next_dial::{NextDialRegistry, MIN_REDIAL_INTERVAL};
pub use peer_connection::{ClosedSignal, PeerConnection};
pub use tracker::{desired_connections, ConnectionTracker};
