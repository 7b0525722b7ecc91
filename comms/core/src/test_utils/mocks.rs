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
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    collaborators::{DeviceStatistics, Discovery, ProtocolRecipient},
    connection_manager::PeerConnection,
    types::{DeviceId, Hello},
};

/// Discovery backed by a fixed table.
#[derive(Default)]
pub struct StaticDiscovery {
    addresses: Mutex<HashMap<DeviceId, Vec<String>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_addresses(&self, device_id: DeviceId, addresses: Vec<String>) {
        self.addresses
            .lock()
            .expect("static discovery lock poisoned")
            .insert(device_id, addresses);
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn lookup(&self, device_id: &DeviceId) -> Result<Vec<String>, anyhow::Error> {
        Ok(self
            .addresses
            .lock()
            .expect("static discovery lock poisoned")
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Protocol layer mock recording every hand-off, with an optional standing
/// veto.
#[derive(Default)]
pub struct RecordingProtocol {
    veto: Mutex<Option<String>>,
    added: Mutex<Vec<(PeerConnection, Hello)>>,
    statistics: Mutex<HashMap<DeviceId, DeviceStatistics>>,
}

impl RecordingProtocol {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_veto(&self, reason: Option<&str>) {
        *self.veto.lock().expect("protocol mock lock poisoned") = reason.map(|s| s.to_string());
    }

    pub fn set_last_seen(&self, device_id: DeviceId, last_seen: DateTime<Utc>) {
        self.statistics
            .lock()
            .expect("protocol mock lock poisoned")
            .insert(device_id, DeviceStatistics {
                last_seen: Some(last_seen),
            });
    }

    pub fn added_connections(&self) -> Vec<(PeerConnection, Hello)> {
        self.added.lock().expect("protocol mock lock poisoned").clone()
    }
}

#[async_trait]
impl ProtocolRecipient for RecordingProtocol {
    async fn on_hello(&self, _remote_id: DeviceId, _remote_addr: &str, _hello: &Hello) -> Result<(), anyhow::Error> {
        match self.veto.lock().expect("protocol mock lock poisoned").clone() {
            Some(reason) => Err(anyhow::anyhow!(reason)),
            None => Ok(()),
        }
    }

    async fn add_connection(&self, connection: PeerConnection, hello: Hello) {
        self.added
            .lock()
            .expect("protocol mock lock poisoned")
            .push((connection, hello));
    }

    fn device_statistics(&self) -> Result<HashMap<DeviceId, DeviceStatistics>, anyhow::Error> {
        Ok(self.statistics.lock().expect("protocol mock lock poisoned").clone())
    }
}
