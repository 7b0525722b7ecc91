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

use std::{
    sync::Arc,
    time::Instant,
};

use super::memory::duplex_secure_stream;
use crate::{
    config::ConfigStore,
    connection_manager::{now_nanos, PeerConnection},
    health::HealthMonitor,
    types::{ConnectionDirection, ConnectionId, DeviceId},
};

/// A standalone outbound TCP connection to a throwaway device.
pub fn build_test_connection(priority: i32) -> PeerConnection {
    use rand::RngCore;
    let mut cert = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut cert);
    build_test_connection_for_device(DeviceId::from_certificate(&cert), priority)
}

pub fn build_test_connection_for_device(device_id: DeviceId, priority: i32) -> PeerConnection {
    build_test_connection_with(device_id, priority, Instant::now())
}

/// Full control over the established instant, for tests exercising age and
/// dwell rules.
pub fn build_test_connection_with(device_id: DeviceId, priority: i32, established: Instant) -> PeerConnection {
    let (stream, _far) = duplex_secure_stream(device_id.as_bytes().to_vec(), "driftsync");
    let now = now_nanos();
    let id = ConnectionId::generate(now, now, &mut rand::thread_rng());
    PeerConnection::with_established(
        id,
        device_id,
        "tcp".to_string(),
        ConnectionDirection::Outbound,
        "tcp://192.0.2.10:22000".to_string(),
        false,
        priority,
        stream,
        Arc::new(HealthMonitor::new(Arc::new(ConfigStore::default()))),
        established,
    )
}
