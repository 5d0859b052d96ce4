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

//! Application facing side of the network layer.
//!
//! Poller threads report completed packets and connection events here. In
//! queued dispatch mode they are buffered and delivered when the application
//! calls [`NetworkManager::update`], so packet processing never slows down
//! the threads that move bytes. `update` also drives reconnect timers and
//! the maintenance of every installed [`NetworkSystem`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::network::connection::{ConnectCallback, ConnectionId, DisconnectCallback};
use crate::network::{Connection, ConnectionDetails, DataPacket};
use crate::service::{DispatchMode, NetworkConfig};
use crate::{AppError, AppResult};

/// Receives everything that happens on the connections it owns.
pub trait ConnectionOwner: Send + Sync {
    fn received_packet(&self, connection: &Arc<Connection>, packet: &Arc<DataPacket>);

    fn connection_established(&self, _connection: &Arc<Connection>) {}

    fn connection_dropped(&self, _connection: &Arc<Connection>) {}
}

/// Told about connections accepted on a listening socket.
pub trait IncomingConnectionListener: Send + Sync {
    fn incoming_connection(&self, connection: &Arc<Connection>);
}

/// A family of transports, addressed by the `(System)` prefix of a
/// connection string.
pub trait NetworkSystem: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> AppResult<()>;

    /// Returns the listening connection.
    fn listen(
        &self,
        listener: Arc<dyn IncomingConnectionListener>,
        details: &ConnectionDetails,
    ) -> AppResult<Arc<Connection>>;

    fn connect(
        &self,
        details: &ConnectionDetails,
        connect_callback: Option<ConnectCallback>,
        disconnect_callback: Option<DisconnectCallback>,
    ) -> AppResult<Arc<Connection>>;

    fn disconnect_all(&self);

    /// Periodic maintenance from the application thread.
    fn update(&self);

    fn clean_up(&self);
}

#[derive(Debug, Default)]
struct Throughput {
    window_start: Option<Instant>,
    window_sent: u64,
    window_received: u64,
    sent_per_second: u64,
    received_per_second: u64,
}

#[derive(Default)]
struct PendingEvents {
    established: Vec<Arc<Connection>>,
    established_ids: HashSet<ConnectionId>,
    incoming: Vec<(Arc<Connection>, Arc<dyn IncomingConnectionListener>)>,
}

pub struct NetworkManager {
    dispatch_mode: DispatchMode,
    receive_buffer_size: usize,
    max_packet_size: u32,
    events: Mutex<PendingEvents>,
    packets: Mutex<Vec<(Arc<Connection>, Arc<DataPacket>)>>,
    reconnects: Mutex<HashMap<ConnectionId, (Instant, Weak<Connection>)>>,
    systems: RwLock<Vec<Weak<dyn NetworkSystem>>>,
    default_system: RwLock<Option<String>>,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
    throughput: Mutex<Throughput>,
}

impl NetworkManager {
    pub fn new(config: &NetworkConfig) -> Arc<NetworkManager> {
        Arc::new(NetworkManager {
            dispatch_mode: config.dispatch_mode,
            receive_buffer_size: config.receive_buffer_size,
            max_packet_size: config.max_packet_size,
            events: Mutex::new(PendingEvents::default()),
            packets: Mutex::new(Vec::new()),
            reconnects: Mutex::new(HashMap::new()),
            systems: RwLock::new(Vec::new()),
            default_system: RwLock::new(None),
            total_bytes_sent: AtomicU64::new(0),
            total_bytes_received: AtomicU64::new(0),
            throughput: Mutex::new(Throughput::default()),
        })
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    /// Receive buffer size handed to new connections.
    pub fn receive_buffer_size(&self) -> usize {
        self.receive_buffer_size
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// The manager only keeps a weak reference; the caller owns the system.
    pub fn install_system(&self, system: Arc<dyn NetworkSystem>, default: bool) -> AppResult<()> {
        let name = system.name().to_string();
        let mut systems = self.systems.write();
        systems.retain(|s| s.strong_count() > 0);
        if systems
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.name() == name)
        {
            return Err(AppError::InvalidOperation(format!(
                "network system '{}' already installed",
                name
            )));
        }
        systems.push(Arc::downgrade(&system));
        let mut default_system = self.default_system.write();
        if default || default_system.is_none() {
            *default_system = Some(name.clone());
        }
        info!("installed network system {}", name);
        Ok(())
    }

    pub fn uninstall_system(&self, name: &str) -> AppResult<()> {
        let system = self.system(Some(name))?;
        system.disconnect_all();
        // deliver the notifications the disconnects produced
        self.update();
        system.clean_up();
        self.systems.write().retain(|s| match s.upgrade() {
            Some(s) => s.name() != name,
            None => false,
        });
        let mut default_system = self.default_system.write();
        if default_system.as_deref() == Some(name) {
            *default_system = None;
        }
        Ok(())
    }

    fn system(&self, name: Option<&str>) -> AppResult<Arc<dyn NetworkSystem>> {
        let default_system = self.default_system.read().clone();
        let name = match name.map(str::to_string).or(default_system) {
            Some(name) => name,
            None => {
                return Err(AppError::IllegalStateError(
                    "no network system installed".to_string(),
                ))
            }
        };
        self.systems
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|s| s.name() == name)
            .ok_or_else(|| AppError::InvalidValue(format!("network system '{}' not found", name)))
    }

    fn installed_systems(&self) -> Vec<Arc<dyn NetworkSystem>> {
        self.systems.read().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn start(&self) -> AppResult<()> {
        for system in self.installed_systems() {
            if let Err(e) = system.start() {
                error!("network system {} failed to start: {}", system.name(), e);
            }
        }
        self.throughput.lock().window_start = Some(Instant::now());
        Ok(())
    }

    /// Disconnects everything, flushes the resulting events and stops every
    /// installed system.
    pub fn shutdown(&self) {
        for system in self.installed_systems() {
            system.disconnect_all();
            self.update();
            system.clean_up();
        }
        self.reconnects.lock().clear();
    }

    pub fn listen(
        &self,
        listener: Arc<dyn IncomingConnectionListener>,
        connection_details: &str,
    ) -> AppResult<Arc<Connection>> {
        let details = ConnectionDetails::parse(connection_details)?;
        self.system(details.system())?.listen(listener, &details)
    }

    pub fn connect(
        &self,
        connection_details: &str,
        connect_callback: Option<ConnectCallback>,
        disconnect_callback: Option<DisconnectCallback>,
    ) -> AppResult<Arc<Connection>> {
        let details = ConnectionDetails::parse(connection_details)?;
        self.system(details.system())?
            .connect(&details, connect_callback, disconnect_callback)
    }

    pub fn report_sent_data(&self, bytes: usize) {
        self.total_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.throughput.lock().window_sent += bytes as u64;
    }

    pub fn report_received_data(&self, bytes: usize) {
        self.total_bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.throughput.lock().window_received += bytes as u64;
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent_per_second(&self) -> u64 {
        self.throughput.lock().sent_per_second
    }

    pub fn bytes_received_per_second(&self) -> u64 {
        self.throughput.lock().received_per_second
    }

    /// Each connection is reported at most once per `update`.
    pub fn connection_established(&self, connection: &Arc<Connection>) {
        if self.dispatch_mode == DispatchMode::Immediate {
            connection.established();
            return;
        }
        let mut events = self.events.lock();
        if events.established_ids.insert(connection.id()) {
            events.established.push(connection.clone());
        }
    }

    pub fn connection_incoming(
        &self,
        connection: &Arc<Connection>,
        listener: &Arc<dyn IncomingConnectionListener>,
    ) {
        if self.dispatch_mode == DispatchMode::Immediate {
            listener.incoming_connection(connection);
            return;
        }
        self.events
            .lock()
            .incoming
            .push((connection.clone(), listener.clone()));
    }

    pub fn connection_packet_received(&self, connection: &Arc<Connection>, packet: DataPacket) {
        let packet = Arc::new(packet);
        if self.dispatch_mode == DispatchMode::Immediate {
            connection.process_received_packet(&packet);
            return;
        }
        self.packets.lock().push((connection.clone(), packet));
    }

    pub fn pending_packets(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn schedule_reconnect(&self, connection: &Arc<Connection>, delay: Duration) {
        debug!(
            "reconnect of {} scheduled in {:?}",
            connection.friendly_identifier(),
            delay
        );
        self.reconnects.lock().insert(
            connection.id(),
            (Instant::now() + delay, Arc::downgrade(connection)),
        );
    }

    pub fn cancel_reconnect(&self, connection_id: ConnectionId) -> bool {
        self.reconnects.lock().remove(&connection_id).is_some()
    }

    pub fn has_reconnect_scheduled(&self, connection_id: ConnectionId) -> bool {
        self.reconnects.lock().contains_key(&connection_id)
    }

    /// Delivers queued events in the order established, incoming, packets,
    /// then fires expired reconnect timers and ticks installed systems.
    pub fn update(&self) {
        // packets first: a packet is only ever queued after the events of
        // its connection, so this snapshot never outruns theirs
        let packets = std::mem::take(&mut *self.packets.lock());
        let (established, incoming) = {
            let mut events = self.events.lock();
            events.established_ids.clear();
            (
                std::mem::take(&mut events.established),
                std::mem::take(&mut events.incoming),
            )
        };

        for connection in &established {
            connection.established();
        }
        for (connection, listener) in &incoming {
            listener.incoming_connection(connection);
        }
        for (connection, packet) in &packets {
            connection.process_received_packet(packet);
        }

        self.fire_reconnects();

        for system in self.installed_systems() {
            system.update();
        }

        self.refresh_throughput();
    }

    fn fire_reconnects(&self) {
        let now = Instant::now();
        let due: Vec<Weak<Connection>> = {
            let mut reconnects = self.reconnects.lock();
            let expired: Vec<ConnectionId> = reconnects
                .iter()
                .filter(|(_, (deadline, _))| *deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| reconnects.remove(&id).map(|(_, conn)| conn))
                .collect()
        };
        for connection in due.iter().filter_map(Weak::upgrade) {
            info!("attempting reconnect of {}", connection.friendly_identifier());
            if let Err(e) = connection.connect() {
                warn!(
                    "reconnect of {} failed: {}",
                    connection.friendly_identifier(),
                    e
                );
                if connection.auto_reconnect() {
                    self.schedule_reconnect(&connection, connection.reconnect_delay());
                }
            }
        }
    }

    fn refresh_throughput(&self) {
        let mut throughput = self.throughput.lock();
        let now = Instant::now();
        let start = *throughput.window_start.get_or_insert(now);
        let elapsed = now.duration_since(start).as_secs_f64();
        if elapsed >= 1.0 {
            throughput.sent_per_second = (throughput.window_sent as f64 / elapsed) as u64;
            throughput.received_per_second = (throughput.window_received as f64 / elapsed) as u64;
            throughput.window_sent = 0;
            throughput.window_received = 0;
            throughput.window_start = Some(now);
        }
    }
}
