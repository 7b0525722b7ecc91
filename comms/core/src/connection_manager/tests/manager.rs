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

//! End-to-end tests over real loopback TCP: two services, one listening and
//! one dialing, with a pass-through TLS handshaker and collaborator mocks.

use std::{sync::Arc, time::Duration};

use driftsync_shutdown::Shutdown;
use driftsync_test_utils::{async_assert_eventually, unpack_enum};

use crate::{
    collaborators::NoRateLimit,
    config::{ConfigStore, DeviceOptions, Options},
    service::{ConnectionService, ServiceEvent},
    test_utils::{
        init_logger,
        memory::TestTlsHandshaker,
        mocks::{RecordingProtocol, StaticDiscovery},
    },
    transports::TransportRegistry,
    types::DeviceId,
};

struct TestNode {
    service: Arc<ConnectionService>,
    protocol: Arc<RecordingProtocol>,
    discovery: Arc<StaticDiscovery>,
    config: Arc<ConfigStore>,
}

fn build_node(options: Options, peer_certificate: Vec<u8>, peer_common_name: &str) -> TestNode {
    let config = Arc::new(ConfigStore::new(options));
    let protocol = Arc::new(RecordingProtocol::new());
    let discovery = Arc::new(StaticDiscovery::new());
    let service = Arc::new(ConnectionService::new(
        config.clone(),
        TransportRegistry::with_defaults(),
        Arc::new(TestTlsHandshaker::new(peer_certificate, peer_common_name)),
        discovery.clone(),
        protocol.clone(),
        Arc::new(NoRateLimit),
    ));
    TestNode {
        service,
        protocol,
        discovery,
        config,
    }
}

fn device_record(device_id: DeviceId) -> DeviceOptions {
    DeviceOptions {
        device_id,
        addresses: vec!["dynamic".to_string()],
        num_connections: 1,
        ..Default::default()
    }
}

async fn wait_for_listener(node: &TestNode) -> String {
    let mut bound = None;
    for _ in 0..50 {
        let status = node.service.listener_status();
        if let Some(entry) = status.values().next() {
            if let Some(address) = entry.lan_addresses.first() {
                bound = Some(address.clone());
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bound.expect("listener did not bind")
}

#[tokio::test]
async fn dial_and_admit_end_to_end() {
    init_logger();
    let cert_a = b"certificate of node a".to_vec();
    let cert_b = b"certificate of node b".to_vec();
    let id_a = DeviceId::from_certificate(&cert_a);
    let id_b = DeviceId::from_certificate(&cert_b);

    // Node B listens and knows about A; it sees A's certificate on accept
    let node_b = build_node(
        Options {
            device_id: id_b,
            listen_addresses: vec!["tcp://127.0.0.1:0".to_string()],
            devices: vec![device_record(id_a)],
            ..Default::default()
        },
        cert_a.clone(),
        "driftsync",
    );

    // Node A knows about B via discovery; it sees B's certificate on dial
    let node_a = build_node(
        Options {
            device_id: id_a,
            devices: vec![device_record(id_b)],
            ..Default::default()
        },
        cert_b.clone(),
        "driftsync",
    );

    let mut shutdown = Shutdown::new();
    let service_b = node_b.service.clone();
    let signal_b = shutdown.to_signal();
    tokio::spawn(async move { service_b.serve(signal_b).await });

    let bound = wait_for_listener(&node_b).await;
    node_a.discovery.set_addresses(id_b, vec![bound]);

    let mut events_a = node_a.service.subscribe_events();
    let service_a = node_a.service.clone();
    let signal_a = shutdown.to_signal();
    tokio::spawn(async move { service_a.serve(signal_a).await });
    node_a.service.dial_now();

    async_assert_eventually!(
        node_a.service.get_connected_devices().contains(&id_b),
        expect = true,
        max_attempts = 50,
        interval = Duration::from_millis(100)
    );
    async_assert_eventually!(
        node_b.service.get_connected_devices().contains(&id_a),
        expect = true,
        max_attempts = 50,
        interval = Duration::from_millis(100)
    );

    // Both protocol layers received the hand-off with the peer's hello
    let added_a = node_a.protocol.added_connections();
    assert_eq!(added_a.len(), 1);
    assert_eq!(added_a[0].0.device_id(), &id_b);
    assert_eq!(added_a[0].1.client_name, "driftsync");
    assert!(added_a[0].0.is_local(), "loopback dial should classify as LAN");

    let added_b = node_b.protocol.added_connections();
    assert_eq!(added_b.len(), 1);
    assert_eq!(added_b[0].0.device_id(), &id_a);

    // Dial status for the address is recorded as success
    let status = node_a.service.connection_status();
    assert!(status.values().any(|entry| entry.error.is_none()));

    // The dialing side published the connection and device events in order
    let event = tokio::time::timeout(Duration::from_secs(5), events_a.recv())
        .await
        .unwrap()
        .unwrap();
    unpack_enum!(ServiceEvent::ConnectionAdded(connection) = event);
    assert_eq!(connection.device_id(), &id_b);
    let event = tokio::time::timeout(Duration::from_secs(5), events_a.recv())
        .await
        .unwrap()
        .unwrap();
    unpack_enum!(ServiceEvent::DeviceConnected(device_id) = event);
    assert_eq!(device_id, id_b);

    shutdown.trigger();
}

#[tokio::test]
async fn unknown_device_is_rejected() {
    init_logger();
    let cert_a = b"unknown node a".to_vec();
    let cert_b = b"known node b".to_vec();
    let id_a = DeviceId::from_certificate(&cert_a);
    let id_b = DeviceId::from_certificate(&cert_b);

    // B does not list A in its configuration
    let node_b = build_node(
        Options {
            device_id: id_b,
            listen_addresses: vec!["tcp://127.0.0.1:0".to_string()],
            ..Default::default()
        },
        cert_a.clone(),
        "driftsync",
    );
    let node_a = build_node(
        Options {
            device_id: id_a,
            devices: vec![device_record(id_b)],
            ..Default::default()
        },
        cert_b.clone(),
        "driftsync",
    );

    let mut shutdown = Shutdown::new();
    let service_b = node_b.service.clone();
    let signal_b = shutdown.to_signal();
    tokio::spawn(async move { service_b.serve(signal_b).await });
    let bound = wait_for_listener(&node_b).await;
    node_a.discovery.set_addresses(id_b, vec![bound]);

    let service_a = node_a.service.clone();
    let signal_a = shutdown.to_signal();
    tokio::spawn(async move { service_a.serve(signal_a).await });
    node_a.service.dial_now();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(node_b.protocol.added_connections().is_empty());
    assert!(node_b.service.get_connected_devices().is_empty());
    assert!(node_a.service.get_connected_devices().is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn certificate_name_mismatch_is_rejected() {
    init_logger();
    let cert_a = b"node a with odd name".to_vec();
    let cert_b = b"node b expecting name".to_vec();
    let id_a = DeviceId::from_certificate(&cert_a);
    let id_b = DeviceId::from_certificate(&cert_b);

    // B expects a specific certificate name for A, which A's certificate
    // does not carry
    let node_b = build_node(
        Options {
            device_id: id_b,
            listen_addresses: vec!["tcp://127.0.0.1:0".to_string()],
            devices: vec![DeviceOptions {
                cert_name: "expected-name".to_string(),
                ..device_record(id_a)
            }],
            ..Default::default()
        },
        cert_a.clone(),
        "driftsync",
    );
    let node_a = build_node(
        Options {
            device_id: id_a,
            devices: vec![device_record(id_b)],
            ..Default::default()
        },
        cert_b.clone(),
        "driftsync",
    );

    let mut shutdown = Shutdown::new();
    let service_b = node_b.service.clone();
    let signal_b = shutdown.to_signal();
    tokio::spawn(async move { service_b.serve(signal_b).await });
    let bound = wait_for_listener(&node_b).await;
    node_a.discovery.set_addresses(id_b, vec![bound]);

    let service_a = node_a.service.clone();
    let signal_a = shutdown.to_signal();
    tokio::spawn(async move { service_a.serve(signal_a).await });
    node_a.service.dial_now();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(node_b.protocol.added_connections().is_empty());
    assert!(node_b.service.get_connected_devices().is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn paused_device_is_not_dialed() {
    init_logger();
    let cert_a = b"pausing node a".to_vec();
    let cert_b = b"paused node b".to_vec();
    let id_a = DeviceId::from_certificate(&cert_a);
    let id_b = DeviceId::from_certificate(&cert_b);

    let node_b = build_node(
        Options {
            device_id: id_b,
            listen_addresses: vec!["tcp://127.0.0.1:0".to_string()],
            devices: vec![device_record(id_a)],
            ..Default::default()
        },
        cert_a.clone(),
        "driftsync",
    );
    let node_a = build_node(
        Options {
            device_id: id_a,
            devices: vec![DeviceOptions {
                paused: true,
                ..device_record(id_b)
            }],
            ..Default::default()
        },
        cert_b.clone(),
        "driftsync",
    );

    let mut shutdown = Shutdown::new();
    let service_b = node_b.service.clone();
    let signal_b = shutdown.to_signal();
    tokio::spawn(async move { service_b.serve(signal_b).await });
    let bound = wait_for_listener(&node_b).await;
    node_a.discovery.set_addresses(id_b, vec![bound]);

    let service_a = node_a.service.clone();
    let signal_a = shutdown.to_signal();
    tokio::spawn(async move { service_a.serve(signal_a).await });
    node_a.service.dial_now();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(node_a.service.get_connected_devices().is_empty());
    assert!(node_a.service.connection_status().is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn config_commit_starts_listener_later() {
    init_logger();
    let cert_a = b"late listener peer".to_vec();
    let cert_b = b"late listener node".to_vec();
    let id_b = DeviceId::from_certificate(&cert_b);

    let node_b = build_node(
        Options {
            device_id: id_b,
            ..Default::default()
        },
        cert_a.clone(),
        "driftsync",
    );

    let mut shutdown = Shutdown::new();
    let service_b = node_b.service.clone();
    let signal_b = shutdown.to_signal();
    tokio::spawn(async move { service_b.serve(signal_b).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node_b.service.listener_status().is_empty());

    // Committing a listen address brings the listener up without a restart
    node_b.config.commit(Options {
        device_id: id_b,
        listen_addresses: vec!["tcp://127.0.0.1:0".to_string()],
        ..Default::default()
    });
    let bound = wait_for_listener(&node_b).await;
    assert!(bound.starts_with("tcp://127.0.0.1:"));
    assert!(!node_b.service.all_addresses().is_empty());

    shutdown.trigger();
}
