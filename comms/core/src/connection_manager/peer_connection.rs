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
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::*;
use tokio::sync::watch;

use crate::{
    collaborators::SecureStream,
    health::HealthMonitor,
    types::{CloseReason, ConnectionDirection, ConnectionId, DeviceId},
};

const LOG_TARGET: &str = "comms::connection_manager::peer_connection";

/// A live, authenticated connection to a remote device.
///
/// Cheaply cloneable handle. The underlying stream is handed to the protocol
/// layer exactly once via `take_stream`; after that the handle carries
/// metadata, the health monitor, and the close signal. A closed connection
/// never re-opens and its identifier is never reused.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    device_id: DeviceId,
    transport: String,
    direction: ConnectionDirection,
    remote_address: String,
    is_local: bool,
    priority: i32,
    established_at: DateTime<Utc>,
    established: Instant,
    health: Arc<HealthMonitor>,
    stream: Mutex<Option<Box<dyn SecureStream>>>,
    closed_tx: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,
}

impl PeerConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnectionId,
        device_id: DeviceId,
        transport: String,
        direction: ConnectionDirection,
        remote_address: String,
        is_local: bool,
        priority: i32,
        stream: Box<dyn SecureStream>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self::with_established(
            id,
            device_id,
            transport,
            direction,
            remote_address,
            is_local,
            priority,
            stream,
            health,
            Instant::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_established(
        id: ConnectionId,
        device_id: DeviceId,
        transport: String,
        direction: ConnectionDirection,
        remote_address: String,
        is_local: bool,
        priority: i32,
        stream: Box<dyn SecureStream>,
        health: Arc<HealthMonitor>,
        established: Instant,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                device_id,
                transport,
                direction,
                remote_address,
                is_local,
                priority,
                established_at: Utc::now(),
                established,
                health,
                stream: Mutex::new(Some(stream)),
                closed_tx,
                close_reason: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn transport(&self) -> &str {
        &self.inner.transport
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.inner.direction
    }

    pub fn remote_address(&self) -> &str {
        &self.inner.remote_address
    }

    pub fn is_local(&self) -> bool {
        self.inner.is_local
    }

    /// Transport priority, lower is better.
    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.inner.established_at
    }

    pub fn age(&self) -> Duration {
        self.inner.established.elapsed()
    }

    /// The connection's health monitor. Always present; the tracker and
    /// scheduler observe quality through this and nothing else.
    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    /// Hand the underlying stream to the protocol layer. Returns `None` on
    /// every call after the first.
    pub fn take_stream(&self) -> Option<Box<dyn SecureStream>> {
        self.inner.stream.lock().expect("connection stream lock poisoned").take()
    }

    /// Close with a cause. Idempotent; the first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let mut close_reason = self.inner.close_reason.lock().expect("close reason lock poisoned");
        if close_reason.is_some() {
            return;
        }
        *close_reason = Some(reason);
        drop(close_reason);

        // Drop the stream so the protocol layer observes EOF if it never
        // claimed it
        let _ = self.inner.stream.lock().expect("connection stream lock poisoned").take();

        debug!(
            target: LOG_TARGET,
            "Closing connection {} to device '{}' ({})",
            self.inner.id,
            self.inner.device_id.short_str(),
            reason
        );
        let _ = self.inner.closed_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock().expect("close reason lock poisoned")
    }

    /// A future-producing handle that resolves once the connection closes.
    pub fn closed_signal(&self) -> ClosedSignal {
        ClosedSignal {
            rx: self.inner.closed_tx.subscribe(),
        }
    }

    /// Start the health monitor's periodic recomputation, stopping when this
    /// connection closes. Requires a tokio runtime.
    pub(crate) fn spawn_monitor_ticker(&self) {
        let signal = self.closed_signal();
        self.inner.health.clone().spawn_ticker(signal.wait_owned());
    }
}

impl fmt::Display for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {}, {}, priority={}]",
            self.inner.id,
            self.inner.device_id.short_str(),
            self.inner.transport,
            self.inner.direction,
            self.inner.priority
        )
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.inner.id)
            .field("device_id", &self.inner.device_id)
            .field("transport", &self.inner.transport)
            .field("direction", &self.inner.direction)
            .field("priority", &self.inner.priority)
            .field("is_local", &self.inner.is_local)
            .finish()
    }
}

/// Resolves when the connection is closed.
#[derive(Clone, Debug)]
pub struct ClosedSignal {
    rx: watch::Receiver<bool>,
}

impl ClosedSignal {
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub(crate) fn wait_owned(mut self) -> impl std::future::Future<Output = ()> + Send + 'static {
        async move { self.wait().await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::connection::build_test_connection;

    #[tokio::test]
    async fn close_is_idempotent_and_first_reason_wins() {
        let conn = build_test_connection(10);
        assert!(!conn.is_closed());
        assert!(conn.close_reason().is_none());

        conn.close(CloseReason::Replaced);
        conn.close(CloseReason::Error);

        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::Replaced));
    }

    #[tokio::test]
    async fn closed_signal_resolves() {
        let conn = build_test_connection(10);
        let mut signal = conn.closed_signal();
        let waiter = tokio::spawn(async move { signal.wait().await });
        conn.close(CloseReason::Shutdown);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once() {
        let conn = build_test_connection(10);
        assert!(conn.take_stream().is_some());
        assert!(conn.take_stream().is_none());
    }

    #[tokio::test]
    async fn close_drops_unclaimed_stream() {
        let conn = build_test_connection(10);
        conn.close(CloseReason::Shutdown);
        assert!(conn.take_stream().is_none());
    }
}
