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

//! Tracks in-flight per-file transfer state and relocates it when a better
//! connection to the same device appears. Pending block requests survive the
//! move; re-issuing them is the caller's job, using the returned state.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use log::*;

use crate::{
    connection_manager::PeerConnection,
    types::{ConnectionId, DeviceId},
};

const LOG_TARGET: &str = "comms::migration";

/// A transfer moves once the best available connection scores this much
/// better than its current one.
const MIGRATION_SCORE_RATIO: f64 = 1.2;

#[derive(Clone, Debug)]
pub struct BlockRequest {
    pub block_index: u32,
    pub offset: u64,
    pub size: u32,
    pub hash: Vec<u8>,
    pub requested_at: Instant,
}

#[derive(Clone, Debug)]
pub struct TransferState {
    pub connection_id: ConnectionId,
    pub folder: String,
    pub file: String,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub next_block_index: u32,
    pub started_at: Instant,
    pub last_activity: Instant,
    /// Request id → outstanding block request.
    pub pending_requests: HashMap<u32, BlockRequest>,
}

impl TransferState {
    /// Mean transfer rate since the transfer started.
    pub fn rate_bytes_per_sec(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / elapsed
    }
}

fn transfer_key(connection_id: &ConnectionId, folder: &str, file: &str) -> (ConnectionId, String) {
    (connection_id.clone(), format!("{}/{}", folder, file))
}

struct MigrationInner {
    transfers: HashMap<(ConnectionId, String), TransferState>,
    migrations_by_device: HashMap<DeviceId, u64>,
}

/// Exclusive owner of all in-flight transfer state, keyed by
/// (connection, folder/file). Connections only observe via queries.
pub struct MigrationManager {
    inner: Mutex<MigrationInner>,
}

impl MigrationManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MigrationInner {
                transfers: HashMap::new(),
                migrations_by_device: HashMap::new(),
            }),
        }
    }

    pub fn register_transfer(&self, connection_id: &ConnectionId, folder: &str, file: &str, total_size: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("migration lock poisoned");
        inner
            .transfers
            .entry(transfer_key(connection_id, folder, file))
            .or_insert_with(|| TransferState {
                connection_id: connection_id.clone(),
                folder: folder.to_string(),
                file: file.to_string(),
                total_size,
                bytes_transferred: 0,
                next_block_index: 0,
                started_at: now,
                last_activity: now,
                pending_requests: HashMap::new(),
            });
    }

    pub fn update_transfer(
        &self,
        connection_id: &ConnectionId,
        folder: &str,
        file: &str,
        bytes_delta: u64,
        next_block_index: u32,
    ) {
        let mut inner = self.inner.lock().expect("migration lock poisoned");
        if let Some(state) = inner.transfers.get_mut(&transfer_key(connection_id, folder, file)) {
            state.bytes_transferred += bytes_delta;
            state.next_block_index = next_block_index;
            state.last_activity = Instant::now();
        }
    }

    pub fn remove_transfer(&self, connection_id: &ConnectionId, folder: &str, file: &str) -> Option<TransferState> {
        self.inner
            .lock()
            .expect("migration lock poisoned")
            .transfers
            .remove(&transfer_key(connection_id, folder, file))
    }

    pub fn add_pending_request(
        &self,
        connection_id: &ConnectionId,
        folder: &str,
        file: &str,
        request_id: u32,
        request: BlockRequest,
    ) {
        let mut inner = self.inner.lock().expect("migration lock poisoned");
        if let Some(state) = inner.transfers.get_mut(&transfer_key(connection_id, folder, file)) {
            state.pending_requests.insert(request_id, request);
            state.last_activity = Instant::now();
        }
    }

    pub fn remove_pending_request(
        &self,
        connection_id: &ConnectionId,
        folder: &str,
        file: &str,
        request_id: u32,
    ) -> Option<BlockRequest> {
        let mut inner = self.inner.lock().expect("migration lock poisoned");
        inner
            .transfers
            .get_mut(&transfer_key(connection_id, folder, file))
            .and_then(|state| state.pending_requests.remove(&request_id))
    }

    pub fn transfer(&self, connection_id: &ConnectionId, folder: &str, file: &str) -> Option<TransferState> {
        self.inner
            .lock()
            .expect("migration lock poisoned")
            .transfers
            .get(&transfer_key(connection_id, folder, file))
            .cloned()
    }

    pub fn transfers_for_connection(&self, connection_id: &ConnectionId) -> Vec<TransferState> {
        self.inner
            .lock()
            .expect("migration lock poisoned")
            .transfers
            .values()
            .filter(|state| &state.connection_id == connection_id)
            .cloned()
            .collect()
    }

    /// Atomically relocate one transfer's state onto another connection,
    /// preserving its pending requests. Returns the relocated state so the
    /// caller can re-issue them.
    pub fn migrate_single_transfer(
        &self,
        old_connection: &PeerConnection,
        new_connection: &PeerConnection,
        folder: &str,
        file: &str,
    ) -> Option<TransferState> {
        let mut inner = self.inner.lock().expect("migration lock poisoned");
        let mut state = inner.transfers.remove(&transfer_key(old_connection.id(), folder, file))?;
        state.connection_id = new_connection.id().clone();
        state.last_activity = Instant::now();
        let relocated = state.clone();
        inner
            .transfers
            .insert(transfer_key(new_connection.id(), folder, file), state);
        *inner
            .migrations_by_device
            .entry(*new_connection.device_id())
            .or_insert(0) += 1;
        debug!(
            target: LOG_TARGET,
            "Migrated transfer {}/{} from {} to {}",
            folder,
            file,
            old_connection.id(),
            new_connection.id()
        );
        Some(relocated)
    }

    /// Whether a transfer on `connection` should move: true iff the best of
    /// `candidates` scores at least 1.2× the current connection.
    pub fn should_migrate_transfer(&self, connection: &PeerConnection, candidates: &[PeerConnection]) -> bool {
        let current = connection.health().health_score();
        let best = candidates
            .iter()
            .filter(|c| c.id() != connection.id() && !c.is_closed())
            .map(|c| c.health().health_score())
            .fold(f64::MIN, f64::max);
        best > f64::MIN && best >= current * MIGRATION_SCORE_RATIO
    }

    pub fn migration_count(&self, device_id: &DeviceId) -> u64 {
        self.inner
            .lock()
            .expect("migration lock poisoned")
            .migrations_by_device
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::connection::build_test_connection_for_device;

    fn device() -> DeviceId {
        DeviceId::from_certificate(b"migration peer")
    }

    fn request(block_index: u32) -> BlockRequest {
        BlockRequest {
            block_index,
            offset: u64::from(block_index) * 128 * 1024,
            size: 128 * 1024,
            hash: vec![0xab; 32],
            requested_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn register_update_remove_round_trip() {
        let manager = MigrationManager::new();
        let conn = build_test_connection_for_device(device(), 10);

        manager.register_transfer(conn.id(), "photos", "holiday.jpg", 1_000_000);
        manager.update_transfer(conn.id(), "photos", "holiday.jpg", 256_000, 2);

        let state = manager.transfer(conn.id(), "photos", "holiday.jpg").unwrap();
        assert_eq!(state.bytes_transferred, 256_000);
        assert_eq!(state.next_block_index, 2);
        assert_eq!(state.total_size, 1_000_000);

        assert!(manager.remove_transfer(conn.id(), "photos", "holiday.jpg").is_some());
        assert!(manager.transfer(conn.id(), "photos", "holiday.jpg").is_none());
    }

    #[tokio::test]
    async fn migration_preserves_pending_requests() {
        let manager = MigrationManager::new();
        let d = device();
        let old_conn = build_test_connection_for_device(d, 30);
        let new_conn = build_test_connection_for_device(d, 10);

        manager.register_transfer(old_conn.id(), "docs", "spec.pdf", 500_000);
        manager.add_pending_request(old_conn.id(), "docs", "spec.pdf", 1, request(4));
        manager.add_pending_request(old_conn.id(), "docs", "spec.pdf", 2, request(5));

        let relocated = manager
            .migrate_single_transfer(&old_conn, &new_conn, "docs", "spec.pdf")
            .unwrap();
        assert_eq!(&relocated.connection_id, new_conn.id());
        assert_eq!(relocated.pending_requests.len(), 2);

        assert!(manager.transfer(old_conn.id(), "docs", "spec.pdf").is_none());
        let moved = manager.transfer(new_conn.id(), "docs", "spec.pdf").unwrap();
        assert_eq!(moved.pending_requests.len(), 2);
        assert_eq!(manager.migration_count(&d), 1);
    }

    #[tokio::test]
    async fn migrating_missing_transfer_is_none() {
        let manager = MigrationManager::new();
        let d = device();
        let old_conn = build_test_connection_for_device(d, 30);
        let new_conn = build_test_connection_for_device(d, 10);
        assert!(manager
            .migrate_single_transfer(&old_conn, &new_conn, "docs", "nope.txt")
            .is_none());
        assert_eq!(manager.migration_count(&d), 0);
    }

    #[tokio::test]
    async fn should_migrate_requires_a_clear_win() {
        let manager = MigrationManager::new();
        let d = device();
        let current = build_test_connection_for_device(d, 30);
        let better = build_test_connection_for_device(d, 10);
        current.health().set_health_score_for_test(50.0);

        better.health().set_health_score_for_test(55.0);
        assert!(!manager.should_migrate_transfer(&current, &[better.clone()]));

        better.health().set_health_score_for_test(65.0);
        assert!(manager.should_migrate_transfer(&current, &[better.clone()]));

        // No candidates, no move
        assert!(!manager.should_migrate_transfer(&current, &[]));
    }
}
