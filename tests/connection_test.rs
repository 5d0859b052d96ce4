// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use framelink::network::{ConnectionState, DisconnectCallback};
use framelink::service::{ConnectionConfig, NetworkConfig, PollerConfig};
use framelink::{
    setup_local_tracing, Connection, ConnectionDetails, DataPacket, IncomingConnectionListener,
    NetworkManager, NetworkSystem, SocketNetworkSystem,
};
use rstest::{fixture, rstest};

const ECHO: u32 = 7;
const RECORD: u32 = 8;

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().ok();
}

/// Replies to `ECHO` packets with a response carrying the same payload and
/// to `echo` labelled packets with an `echo-reply` labelled packet. Text
/// sent as `RECORD` is kept in arrival order.
#[derive(Default)]
struct EchoListener {
    accepted: Mutex<Vec<Arc<Connection>>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl IncomingConnectionListener for EchoListener {
    fn incoming_connection(&self, connection: &Arc<Connection>) {
        connection.register_packet_callback(
            ECHO,
            Arc::new(|connection: &Arc<Connection>, packet: &Arc<DataPacket>| {
                connection.send_data_response(packet, packet.payload(), false, false);
            }),
        );
        connection.register_labelled_packet_callback(
            "echo",
            Arc::new(
                |connection: &Arc<Connection>, _: &Arc<DataPacket>, data: &[u8]| {
                    connection.send_labelled_packet("echo-reply", data, None, false);
                },
            ),
        );
        let received = self.received.clone();
        connection.register_packet_callback(
            RECORD,
            Arc::new(move |_: &Arc<Connection>, packet: &Arc<DataPacket>| {
                let (text, _) = packet.read_string(0).unwrap();
                received.lock().unwrap().push(text);
            }),
        );
        self.accepted.lock().unwrap().push(connection.clone());
    }
}

fn start_manager() -> (Arc<NetworkManager>, Arc<SocketNetworkSystem>) {
    let network = NetworkConfig::default();
    let manager = NetworkManager::new(&network);
    let system = SocketNetworkSystem::new(
        manager.clone(),
        PollerConfig {
            poll_timeout_ms: 50,
            ..PollerConfig::default()
        },
        &ConnectionConfig::default(),
    );
    manager.install_system(system.clone(), true).unwrap();
    manager.start().unwrap();
    (manager, system)
}

/// Ticks `manager` until `condition` holds or ten seconds pass.
fn pump(manager: &NetworkManager, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        manager.update();
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn listening_port(listening: &Connection) -> u16 {
    ConnectionDetails::parse(&listening.friendly_identifier())
        .unwrap()
        .port()
        .unwrap()
}

struct Harness {
    manager: Arc<NetworkManager>,
    system: Arc<SocketNetworkSystem>,
    server: Arc<EchoListener>,
    listening: Arc<Connection>,
    port: u16,
}

impl Harness {
    fn new() -> Harness {
        let (manager, system) = start_manager();
        let server = Arc::new(EchoListener::default());
        let listening = manager
            .listen(server.clone(), "(Socket)direct:127.0.0.1:0")
            .unwrap();
        let port = listening_port(&listening);
        assert_ne!(port, 0);
        Harness {
            manager,
            system,
            server,
            listening,
            port,
        }
    }

    fn address(&self) -> String {
        format!("(Socket)direct:127.0.0.1:{}", self.port)
    }

    fn connect(&self) -> Arc<Connection> {
        let client = self.manager.connect(&self.address(), None, None).unwrap();
        assert!(self.pump(|| client.is_connected() && client.has_remote_details()));
        assert!(self.pump(|| self.server.accepted.lock().unwrap().len() == 1));
        client
    }

    fn accepted(&self) -> Arc<Connection> {
        self.server.accepted.lock().unwrap()[0].clone()
    }

    fn pump(&self, condition: impl FnMut() -> bool) -> bool {
        pump(&self.manager, condition)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

#[rstest]
fn test_request_response(_setup: ()) {
    let harness = Harness::new();
    let client = harness.connect();

    let reply = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let reply = reply.clone();
        let calls = calls.clone();
        client
            .send_data(
                ECHO,
                b"hello",
                Some(Box::new(move |_: &Arc<Connection>, packet: &Arc<DataPacket>| {
                    *reply.lock().unwrap() = Some(packet.payload().to_vec());
                    calls.fetch_add(1, Ordering::SeqCst);
                })),
                false,
            )
            .unwrap();
    }

    assert!(harness.pump(|| calls.load(Ordering::SeqCst) == 1));
    assert_eq!(reply.lock().unwrap().as_deref(), Some(&b"hello"[..]));
    assert_eq!(client.pending_responses(), 0);
    assert!(harness.manager.total_bytes_sent() > 0);
    assert_eq!(
        harness.manager.total_bytes_sent(),
        harness.manager.total_bytes_received()
    );
}

#[rstest]
fn test_large_labelled_payload(_setup: ()) {
    let harness = Harness::new();
    let client = harness.connect();

    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let echoed = Arc::new(Mutex::new(Vec::new()));
    {
        let echoed = echoed.clone();
        client.register_labelled_packet_callback(
            "echo-reply",
            Arc::new(
                move |_: &Arc<Connection>, _: &Arc<DataPacket>, data: &[u8]| {
                    echoed.lock().unwrap().push(data.to_vec());
                },
            ),
        );
    }
    client.send_labelled_packet("echo", &payload, None, false);

    assert!(harness.pump(|| !echoed.lock().unwrap().is_empty()));
    let echoed = echoed.lock().unwrap();
    assert_eq!(echoed.len(), 1);
    assert!(echoed[0] == payload);
}

#[rstest]
fn test_order_preserved_when_sent_while_connecting(_setup: ()) {
    let harness = Harness::new();
    let client = harness.manager.connect(&harness.address(), None, None).unwrap();
    for i in 0..20 {
        client
            .send_message(RECORD, &format!("message {}", i), None, false)
            .unwrap();
    }
    assert!(harness.pump(|| harness.server.received.lock().unwrap().len() == 20));
    let received = harness.server.received.lock().unwrap();
    for (i, text) in received.iter().enumerate() {
        assert_eq!(text, &format!("message {}", i));
    }
    assert_eq!(client.queued_packets(), 0);
}

#[rstest]
fn test_disconnect_notifies_both_sides(_setup: ()) {
    let harness = Harness::new();
    let client_dropped = Arc::new(AtomicBool::new(false));
    let client = {
        let flag = client_dropped.clone();
        let on_drop: DisconnectCallback =
            Arc::new(move |_: &Arc<Connection>| flag.store(true, Ordering::SeqCst));
        harness
            .manager
            .connect(&harness.address(), None, Some(on_drop))
            .unwrap()
    };
    assert!(harness.pump(|| client.is_connected()));
    assert!(harness.pump(|| harness.server.accepted.lock().unwrap().len() == 1));

    let server = harness.accepted();
    let server_dropped = Arc::new(AtomicBool::new(false));
    {
        let flag = server_dropped.clone();
        server.register_disconnect_callback(
            "test",
            Arc::new(move |_: &Arc<Connection>| flag.store(true, Ordering::SeqCst)),
        );
    }

    assert!(client.disconnect());
    assert!(client_dropped.load(Ordering::SeqCst));
    assert!(client.is_manual_disconnect());
    assert!(harness.pump(|| server_dropped.load(Ordering::SeqCst)));
    assert_eq!(server.state(), ConnectionState::Disconnected);
    assert!(!server.is_manual_disconnect());
    assert!(harness.pump(|| harness.system.connection_count() == 1));
    assert!(harness.system.stop_listening(&harness.listening));
}

#[rstest]
fn test_refused_connect_reports_drop(_setup: ()) {
    let harness = Harness::new();
    // bind then release a port so nothing listens on it
    let closed_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let dropped = Arc::new(AtomicBool::new(false));
    let on_drop: DisconnectCallback = {
        let dropped = dropped.clone();
        Arc::new(move |_: &Arc<Connection>| dropped.store(true, Ordering::SeqCst))
    };
    match harness.manager.connect(
        &format!("(Socket)direct:127.0.0.1:{}", closed_port),
        None,
        Some(on_drop),
    ) {
        Ok(client) => {
            assert!(harness.pump(|| dropped.load(Ordering::SeqCst)));
            assert_eq!(client.state(), ConnectionState::Disconnected);
            assert!(!client.is_manual_disconnect());
        }
        // refused synchronously by the kernel
        Err(_) => {}
    }
}

#[rstest]
fn test_clean_up_releases_everything(_setup: ()) {
    let harness = Harness::new();
    let client = harness.connect();
    assert!(harness.system.poller_count() >= 1);

    harness.system.clean_up();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(harness.system.poller_count(), 0);
    assert_eq!(harness.system.connection_count(), 0);
}

#[rstest]
fn test_listener_outlives_caller_handles(_setup: ()) {
    let (manager, _system) = start_manager();
    let server = Arc::new(EchoListener::default());
    let weak_server = Arc::downgrade(&server);
    let port = {
        let listening = manager
            .listen(server, "(Socket)direct:127.0.0.1:0")
            .unwrap();
        listening_port(&listening)
    };

    let client = manager
        .connect(&format!("(Socket)direct:127.0.0.1:{}", port), None, None)
        .unwrap();
    assert!(pump(&manager, || client.is_connected()));
    assert!(pump(&manager, || {
        weak_server
            .upgrade()
            .map(|server| server.accepted.lock().unwrap().len() == 1)
            .unwrap_or(false)
    }));
    manager.shutdown();
}
