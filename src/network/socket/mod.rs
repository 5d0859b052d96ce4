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

//! TCP network system.
//!
//! Sockets are spread over poller threads, each running a
//! [`SocketThreadTask`] over at most `max_sockets_per_thread` sockets. A
//! socket is registered with exactly one poller; readiness comes back here
//! as `read_notify`, `write_notify` and `except_notify` and is routed to the
//! owning [`Connection`] through the socket map.
//!
//! Threads are created on demand when every poller is full and stop on
//! their own once their last socket is removed. A stopped thread is parked
//! in a cleanup list and joined from [`NetworkSystem::update`].

use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::network::connection::{ConnectCallback, DisconnectCallback};
use crate::network::manager::{IncomingConnectionListener, NetworkManager, NetworkSystem};
use crate::network::{
    Connection, ConnectionDetails, ConnectionId, ConnectionOptions, ConnectionState,
};
use crate::service::{ConnectionConfig, PollerConfig};
use crate::{AppError, AppResult};

pub use poller::SocketId;
pub use tcp::{ListenerTransport, TcpTransport};

pub(crate) use poller::SocketThreadTask;
use tcp::resolve_address;

mod poller;
mod tcp;

const LISTEN_BACKLOG: i32 = 128;

struct TaskHandle {
    id: u64,
    task: Arc<SocketThreadTask>,
    thread: Option<JoinHandle<()>>,
}

struct ListeningSocket {
    listener: Arc<TcpListener>,
    callback: Arc<dyn IncomingConnectionListener>,
}

pub struct SocketNetworkSystem {
    self_ref: Weak<SocketNetworkSystem>,
    manager: Arc<NetworkManager>,
    poller: PollerConfig,
    options: ConnectionOptions,
    connections: DashMap<SocketId, Arc<Connection>>,
    /// reverse of `connections`
    sockets: DashMap<ConnectionId, SocketId>,
    listeners: DashMap<SocketId, ListeningSocket>,
    /// sockets with a connect in flight and the moment they give up
    connecting: DashMap<SocketId, (Instant, Arc<std::net::TcpStream>)>,
    tasks: Mutex<Vec<TaskHandle>>,
    task_lookup: DashMap<SocketId, Arc<SocketThreadTask>>,
    cleanup: Mutex<Vec<JoinHandle<()>>>,
    next_task_id: AtomicU64,
    started: AtomicBool,
}

impl SocketNetworkSystem {
    pub fn new(
        manager: Arc<NetworkManager>,
        poller: PollerConfig,
        connection: &ConnectionConfig,
    ) -> Arc<SocketNetworkSystem> {
        let options = ConnectionOptions::for_manager(&manager, connection);
        Arc::new_cyclic(|self_ref| SocketNetworkSystem {
            self_ref: self_ref.clone(),
            manager,
            poller,
            options,
            connections: DashMap::new(),
            sockets: DashMap::new(),
            listeners: DashMap::new(),
            connecting: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            task_lookup: DashMap::new(),
            cleanup: Mutex::new(Vec::new()),
            next_task_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
        })
    }

    pub fn manager(&self) -> &Arc<NetworkManager> {
        &self.manager
    }

    pub fn poller_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stopped poller threads not yet joined.
    pub fn pending_cleanup(&self) -> usize {
        self.cleanup.lock().len()
    }

    fn connection(&self, id: SocketId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Rebinds `connection` to `socket`: its previous socket, if any, leaves
    /// the socket map and its poller; the new one joins the same poller when
    /// possible, otherwise any poller with room. `None` only releases.
    pub(crate) fn update_socket(
        &self,
        socket: Option<(SocketId, RawFd)>,
        connection: &Arc<Connection>,
    ) -> AppResult<()> {
        let previous = match socket {
            Some((id, _)) => self.sockets.insert(connection.id(), id),
            None => self.sockets.remove(&connection.id()).map(|(_, id)| id),
        };
        if let Some(previous) = previous {
            self.connections.remove(&previous);
        }
        if let Some((id, _)) = socket {
            self.connections.insert(id, connection.clone());
        }

        let previous_task = previous.and_then(|previous| {
            self.task_lookup
                .remove(&previous)
                .map(|(_, task)| (previous, task))
        });
        match (previous_task, socket) {
            (Some((previous, task)), Some((id, fd))) => {
                task.remove_socket(previous);
                if task.add_socket(id, fd) {
                    self.task_lookup.insert(id, task);
                    Ok(())
                } else {
                    self.assign_thread_task(id, fd)
                }
            }
            (Some((previous, task)), None) => {
                task.remove_socket(previous);
                Ok(())
            }
            (None, Some((id, fd))) => self.assign_thread_task(id, fd).map_err(|e| {
                self.connections.remove(&id);
                self.sockets.remove(&connection.id());
                e
            }),
            (None, None) => Ok(()),
        }
    }

    /// Gives `id` to a poller with spare capacity, creating (and, once
    /// started, running) a new one when all are full.
    pub(crate) fn assign_thread_task(&self, id: SocketId, fd: RawFd) -> AppResult<()> {
        let mut tasks = self.tasks.lock();
        for handle in tasks.iter() {
            if handle.task.has_capacity() && handle.task.add_socket(id, fd) {
                self.task_lookup.insert(id, handle.task.clone());
                return Ok(());
            }
        }

        let task = Arc::new(SocketThreadTask::new(
            self.poller.socket_capacity(),
            self.poller.poll_timeout(),
        )?);
        if !task.add_socket(id, fd) {
            return Err(AppError::IllegalStateError(format!(
                "unable to assign {} to a new poller",
                id
            )));
        }
        let mut handle = TaskHandle {
            id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            task: task.clone(),
            thread: None,
        };
        if self.started.load(Ordering::Acquire) {
            self.spawn_poller(&mut handle)?;
        }
        debug!("poller {} created for {}", handle.id, id);
        tasks.push(handle);
        self.task_lookup.insert(id, task);
        Ok(())
    }

    fn spawn_poller(&self, handle: &mut TaskHandle) -> AppResult<()> {
        let task = handle.task.clone();
        let system = self.self_ref.clone();
        let task_id = handle.id;
        let thread = thread::Builder::new()
            .name(format!("framelink-poller-{}", task_id))
            .spawn(move || {
                task.run(&system);
                if let Some(system) = system.upgrade() {
                    system.on_thread_task_complete(task_id);
                }
            })?;
        handle.thread = Some(thread);
        Ok(())
    }

    /// Called from the poller thread as it exits. Its handle moves to the
    /// cleanup list; joining it here would join the calling thread.
    pub(crate) fn on_thread_task_complete(&self, task_id: u64) {
        let handle = {
            let mut tasks = self.tasks.lock();
            let Some(position) = tasks.iter().position(|h| h.id == task_id) else {
                return;
            };
            tasks.remove(position)
        };
        self.task_lookup
            .retain(|_, task| !Arc::ptr_eq(task, &handle.task));
        if let Some(thread) = handle.thread {
            self.cleanup.lock().push(thread);
        }
        info!(
            "poller {} finished, {} pollers remain",
            task_id,
            self.poller_count()
        );
    }

    pub(crate) fn enable_write_check(&self, id: SocketId) {
        if let Some(task) = self.task_lookup.get(&id) {
            task.enable_write_check(id);
        }
    }

    /// Drops `id` from its poller; `false` when no poller holds it.
    pub(crate) fn remove_socket(&self, id: SocketId) -> bool {
        match self.task_lookup.remove(&id) {
            Some((_, task)) => task.remove_socket(id),
            None => false,
        }
    }

    pub(crate) fn begin_connect(&self, id: SocketId, stream: Arc<std::net::TcpStream>) {
        let deadline = Instant::now() + self.poller.connect_timeout();
        self.connecting.insert(id, (deadline, stream));
    }

    pub(crate) fn end_connect(&self, id: SocketId) {
        self.connecting.remove(&id);
    }

    pub(crate) fn read_notify(&self, id: SocketId) {
        if self.listeners.contains_key(&id) {
            self.accept(id);
            return;
        }
        if let Some(connection) = self.connection(id) {
            connection.update_receive();
        }
    }

    /// Completes a pending connect, then lets the connection drain its
    /// queue.
    pub(crate) fn write_notify(&self, id: SocketId) {
        let Some(connection) = self.connection(id) else {
            return;
        };
        if let Some((_, (_, stream))) = self.connecting.remove(&id) {
            match stream.take_error() {
                Ok(None) => {
                    connection.set_state(ConnectionState::Connected);
                    self.manager.connection_established(&connection);
                }
                Ok(Some(e)) | Err(e) => {
                    warn!(
                        "connect to {} failed: {}",
                        connection.friendly_identifier(),
                        e
                    );
                    connection.close_transport();
                    return;
                }
            }
        }
        connection.update_send(true);
    }

    /// Out of band data or an invalid descriptor; not worth trusting.
    pub(crate) fn except_notify(&self, id: SocketId) {
        match self.connection(id) {
            Some(connection) => {
                warn!(
                    "exceptional condition on {} ({}), disconnecting",
                    id,
                    connection.friendly_identifier()
                );
                connection.disconnect();
            }
            None => trace!("exceptional condition on released {}", id),
        }
    }

    pub(crate) fn check_for_timeout(&self, id: SocketId) {
        let expired = self
            .connecting
            .get(&id)
            .map(|entry| entry.value().0 <= Instant::now())
            .unwrap_or(false);
        if !expired {
            return;
        }
        self.connecting.remove(&id);
        if let Some(connection) = self.connection(id) {
            if connection.is_connecting() {
                warn!(
                    "connect to {} timed out",
                    connection.friendly_identifier()
                );
                connection.close_transport();
            }
        }
    }

    /// Accepts every pending connection on listening socket `id`.
    pub(crate) fn accept(&self, id: SocketId) {
        let Some((listener, callback)) = self
            .listeners
            .get(&id)
            .map(|entry| (entry.listener.clone(), entry.callback.clone()))
        else {
            error!("incoming connection on {} but no listener is registered", id);
            return;
        };

        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept on {} failed: {}", id, e);
                    return;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                error!("failed to make accepted socket from {} non-blocking: {}", peer, e);
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!("TCP_NODELAY on {}: {}", peer, e);
            }

            let socket_id = SocketId::next();
            let fd = stream.as_raw_fd();
            let transport = TcpTransport::accepted(self.self_ref.clone(), socket_id, stream, peer);
            let connection = Connection::new(
                self.manager.clone(),
                Box::new(transport),
                ConnectionOptions {
                    auto_reconnect: false,
                    ..self.options.clone()
                },
            );
            info!("accepted {}", connection.friendly_identifier());
            connection.set_state(ConnectionState::Connected);
            self.manager.connection_established(&connection);
            self.manager.connection_incoming(&connection, &callback);
            // registered last so no packet is queued ahead of its connection
            if let Err(e) = self.update_socket(Some((socket_id, fd)), &connection) {
                error!("dropping incoming connection from {}: {}", peer, e);
                connection.close_transport();
            }
        }
    }

    /// Called by the listening connection's transport when it is closed.
    pub(crate) fn stop_listening_socket(&self, id: SocketId, connection: &Arc<Connection>) -> bool {
        if self.listeners.remove(&id).is_none() {
            return false;
        }
        if let Err(e) = self.update_socket(None, connection) {
            debug!("release of listening {} failed: {}", id, e);
        }
        info!("stopped listening on {}", connection.friendly_identifier());
        true
    }

    /// Closes a connection returned by `listen`.
    pub fn stop_listening(&self, connection: &Arc<Connection>) -> bool {
        connection.close_transport()
    }

    fn check_supported(details: &ConnectionDetails) -> AppResult<u16> {
        if details.connection_type() != "direct" {
            return Err(AppError::UnsupportedConnectionType(format!(
                "'{}' in {}",
                details.connection_type(),
                details
            )));
        }
        if details.option("security") == Some("tls") {
            return Err(AppError::UnsupportedConnectionType(format!(
                "tls in {}",
                details
            )));
        }
        details.port().ok_or_else(|| {
            AppError::InvalidConnectionDetails(format!("{} needs a port", details))
        })
    }

    fn listening_connections(&self) -> Vec<Arc<Connection>> {
        let ids: Vec<SocketId> = self.listeners.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.connection(id)).collect()
    }

    fn join_cleanup(&self) {
        let handles = std::mem::take(&mut *self.cleanup.lock());
        for handle in handles {
            Self::join(handle);
        }
    }

    fn join(handle: JoinHandle<()>) {
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("poller thread panicked");
        }
    }
}

impl NetworkSystem for SocketNetworkSystem {
    fn name(&self) -> &str {
        "Socket"
    }

    fn start(&self) -> AppResult<()> {
        let mut tasks = self.tasks.lock();
        self.started.store(true, Ordering::Release);
        for handle in tasks.iter_mut().filter(|h| h.thread.is_none()) {
            self.spawn_poller(handle)?;
        }
        Ok(())
    }

    /// Port 0 picks an ephemeral port; the returned connection's friendly
    /// identifier carries the bound address.
    fn listen(
        &self,
        listener: Arc<dyn IncomingConnectionListener>,
        details: &ConnectionDetails,
    ) -> AppResult<Arc<Connection>> {
        let port = Self::check_supported(details)?;
        let address = resolve_address(details.address(), port)?;

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("unable to set SO_REUSEADDR, rebinding {} may fail: {}", address, e);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&address.into()).map_err(|e| {
            AppError::DetailedIoError(format!("unable to bind {}: {}", address, e))
        })?;
        socket.listen(LISTEN_BACKLOG).map_err(|e| {
            AppError::DetailedIoError(format!("unable to listen on {}: {}", address, e))
        })?;
        let tcp_listener: TcpListener = socket.into();
        let local = tcp_listener.local_addr()?;

        let id = SocketId::next();
        let fd = tcp_listener.as_raw_fd();
        let connection = Connection::new(
            self.manager.clone(),
            Box::new(ListenerTransport::new(self.self_ref.clone(), id, local)),
            self.options.clone(),
        );
        self.listeners.insert(
            id,
            ListeningSocket {
                listener: Arc::new(tcp_listener),
                callback: listener,
            },
        );
        if let Err(e) = self.update_socket(Some((id, fd)), &connection) {
            self.listeners.remove(&id);
            return Err(e);
        }
        info!("listening on {}", local);
        Ok(connection)
    }

    /// A first attempt that fails outright is returned as an error unless
    /// auto reconnect is configured, in which case it is retried later.
    fn connect(
        &self,
        details: &ConnectionDetails,
        connect_callback: Option<ConnectCallback>,
        disconnect_callback: Option<DisconnectCallback>,
    ) -> AppResult<Arc<Connection>> {
        let port = Self::check_supported(details)?;
        if port == 0 {
            return Err(AppError::InvalidConnectionDetails(format!(
                "{} needs a non-zero port",
                details
            )));
        }
        let connection = Connection::new(
            self.manager.clone(),
            Box::new(TcpTransport::outgoing(self.self_ref.clone(), details.clone())),
            self.options.clone(),
        );
        if let Some(callback) = connect_callback {
            connection.register_connect_callback("", callback);
        }
        if let Some(callback) = disconnect_callback {
            connection.register_disconnect_callback("", callback);
        }
        if let Err(e) = connection.connect() {
            if !connection.auto_reconnect() {
                return Err(e);
            }
            warn!("connect to {} failed, will retry: {}", details, e);
            self.manager
                .schedule_reconnect(&connection, connection.reconnect_delay());
        }
        Ok(connection)
    }

    /// Listening sockets stay open; `clean_up` closes them.
    fn disconnect_all(&self) {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in connections {
            connection.disconnect();
        }
    }

    fn update(&self) {
        self.join_cleanup();
    }

    fn clean_up(&self) {
        self.disconnect_all();
        for connection in self.listening_connections() {
            connection.close_transport();
        }
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in &handles {
            handle.task.stop();
        }
        for handle in handles {
            if let Some(thread) = handle.thread {
                Self::join(thread);
            }
        }
        self.task_lookup.clear();
        self.join_cleanup();
        self.started.store(false, Ordering::Release);
    }
}

impl Drop for SocketNetworkSystem {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in &handles {
            handle.task.stop();
        }
        for handle in handles {
            if let Some(thread) = handle.thread {
                Self::join(thread);
            }
        }
        self.join_cleanup();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::network::connection::test_support::disconnected;
    use crate::service::NetworkConfig;
    use crate::setup_local_tracing;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().ok();
    }

    fn system(capacity: usize) -> Arc<SocketNetworkSystem> {
        system_with(capacity, 200)
    }

    fn system_with(capacity: usize, connect_timeout_ms: u64) -> Arc<SocketNetworkSystem> {
        SocketNetworkSystem::new(
            NetworkManager::new(&NetworkConfig::default()),
            PollerConfig {
                max_sockets_per_thread: capacity,
                poll_timeout_ms: 20,
                connect_timeout_ms,
            },
            &ConnectionConfig::default(),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[rstest]
    fn test_pollers_grow_and_shrink(_setup: ()) {
        let system = system(2);
        system.start().unwrap();
        let pairs: Vec<(UnixStream, UnixStream)> =
            (0..3).map(|_| UnixStream::pair().unwrap()).collect();
        let ids: Vec<SocketId> = pairs
            .iter()
            .map(|(a, _)| {
                let id = SocketId::next();
                system.assign_thread_task(id, a.as_raw_fd()).unwrap();
                id
            })
            .collect();
        assert_eq!(system.poller_count(), 2);

        for id in &ids {
            assert!(system.remove_socket(*id));
        }
        assert!(wait_until(|| system.poller_count() == 0));
        assert!(wait_until(|| {
            system.update();
            system.pending_cleanup() == 0
        }));
    }

    #[rstest]
    fn test_pollers_wait_for_start(_setup: ()) {
        let system = system(1);
        let (a, _b) = UnixStream::pair().unwrap();
        system.assign_thread_task(SocketId::next(), a.as_raw_fd()).unwrap();
        assert!(system.tasks.lock().iter().all(|h| h.thread.is_none()));
        system.start().unwrap();
        assert!(system.tasks.lock().iter().all(|h| h.thread.is_some()));
        system.clean_up();
        assert_eq!(system.poller_count(), 0);
    }

    #[rstest]
    #[case("(Socket)passive:127.0.0.1:9000")]
    #[case("(Socket)direct:127.0.0.1:9000:security=tls")]
    fn test_unsupported_types_rejected(_setup: (), #[case] input: &str) {
        let system = system(0);
        let details = ConnectionDetails::parse(input).unwrap();
        assert!(matches!(
            system.connect(&details, None, None),
            Err(AppError::UnsupportedConnectionType(_))
        ));
    }

    #[rstest]
    fn test_connect_requires_port(_setup: ()) {
        let system = system(0);
        let details = ConnectionDetails::parse("(Socket)direct:127.0.0.1").unwrap();
        assert!(matches!(
            system.connect(&details, None, None),
            Err(AppError::InvalidConnectionDetails(_))
        ));
    }

    #[rstest]
    #[case(0, true)]
    #[case(60_000, false)]
    fn test_connect_deadline(
        _setup: (),
        #[case] connect_timeout_ms: u64,
        #[case] expires: bool,
    ) {
        // never started, so only the deadline can end the connect
        let system = system_with(4, connect_timeout_ms);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let details = ConnectionDetails::parse(&format!("(Socket)direct:127.0.0.1:{}", port))
            .unwrap();
        let connection = system.connect(&details, None, None).unwrap();
        assert!(connection.is_connecting());
        let id = *system.sockets.get(&connection.id()).unwrap();

        system.check_for_timeout(id);
        if expires {
            assert_eq!(connection.state(), ConnectionState::Disconnected);
            assert!(!connection.is_manual_disconnect());
            assert!(!system.connecting.contains_key(&id));
            assert_eq!(system.connection_count(), 0);
        } else {
            assert!(connection.is_connecting());
            assert!(system.connecting.contains_key(&id));
        }
        system.clean_up();
    }

    #[rstest]
    fn test_invalid_descriptor_released(_setup: ()) {
        let system = system(4);
        system.start().unwrap();
        // far above any descriptor this process has open
        let id = SocketId::next();
        system.assign_thread_task(id, 900_000).unwrap();
        assert_eq!(system.poller_count(), 1);

        assert!(wait_until(|| system.poller_count() == 0));
        assert!(!system.task_lookup.contains_key(&id));
        assert!(wait_until(|| {
            system.update();
            system.pending_cleanup() == 0
        }));
    }

    #[rstest]
    fn test_rebinding_replaces_socket(_setup: ()) {
        let system = system(4);
        let (connection, _mock) = disconnected(ConnectionOptions::default());
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();
        let first = SocketId::next();
        let second = SocketId::next();

        system
            .update_socket(Some((first, a.as_raw_fd())), &connection)
            .unwrap();
        system
            .update_socket(Some((second, b.as_raw_fd())), &connection)
            .unwrap();
        assert_eq!(system.connection_count(), 1);
        assert!(system.connection(first).is_none());
        assert!(system.connection(second).is_some());
        assert_eq!(*system.sockets.get(&connection.id()).unwrap(), second);
        assert!(!system.task_lookup.contains_key(&first));
        assert_eq!(system.task_lookup.get(&second).unwrap().socket_count(), 1);
        assert_eq!(system.poller_count(), 1);

        system.update_socket(None, &connection).unwrap();
        assert_eq!(system.connection_count(), 0);
        assert!(system.sockets.is_empty());
        assert!(system.task_lookup.is_empty());
        system.clean_up();
    }

    #[rstest]
    fn test_connections_use_manager_limits(_setup: ()) {
        let manager = NetworkManager::new(&NetworkConfig {
            receive_buffer_size: 512,
            max_packet_size: 4096,
            ..NetworkConfig::default()
        });
        let system = SocketNetworkSystem::new(
            manager,
            PollerConfig::default(),
            &ConnectionConfig::default(),
        );
        assert_eq!(system.options.receive_buffer_size, 512);
        assert_eq!(system.options.max_packet_size, 4096);
    }
}
