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

//! Per peer endpoint.
//!
//! A [`Connection`] owns the outbound queue, the inbound frame reassembly
//! state, the callback registries and the reconnect policy. Raw bytes move
//! through a [`Transport`]; everything above the byte level lives here.
//!
//! Locking:
//! - the outbound queue and the in-flight packet sit behind the send mutex,
//!   the non-blocking drain uses `try_lock` and gives up instead of waiting
//! - byte accounting has its own mutex so telemetry never holds the send lock
//! - callback registries are copied out before dispatch, a callback may
//!   register callbacks, send, or disconnect without deadlocking

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::network::manager::{ConnectionOwner, NetworkManager};
use crate::network::packet::MINIMUM_RESERVED_PACKET_ID;
use crate::network::transport::Transport;
use crate::service::{ConnectionConfig, NetworkConfig};
use crate::{AppError, AppResult};

pub use callbacks::{
    BacklogCallback, ConnectCallback, DisconnectCallback, LabelledPacketCallback, PacketCallback,
    ResponseCallback,
};
pub use handshake::{host_details, parse_remote_details, PROTOCOL_VERSION};

use callbacks::Callbacks;
use receive::ReceiveState;
use send::SendState;

mod callbacks;
mod handshake;
mod receive;
mod send;

#[cfg(test)]
pub(crate) mod test_support;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Behaviour switches applied when a connection is created. All of them can
/// be changed later through the connection's setters.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub queue_while_disconnected: bool,
    pub discard_queue_on_disconnect: bool,
    pub receive_buffer_size: usize,
    pub max_packet_size: u32,
    /// 0 disables the backlog callback
    pub backlog_threshold: u64,
}

impl ConnectionOptions {
    pub fn from_config(network: &NetworkConfig, connection: &ConnectionConfig) -> Self {
        ConnectionOptions {
            auto_reconnect: connection.auto_reconnect,
            reconnect_delay: Duration::from_millis(connection.reconnect_delay_ms),
            queue_while_disconnected: connection.queue_while_disconnected,
            discard_queue_on_disconnect: connection.discard_queue_on_disconnect,
            receive_buffer_size: network.receive_buffer_size.max(1),
            max_packet_size: network.max_packet_size,
            backlog_threshold: connection.backlog_threshold,
        }
    }

    /// Buffer and frame limits come from `manager`, so every system it
    /// drives agrees on them.
    pub fn for_manager(manager: &NetworkManager, connection: &ConnectionConfig) -> Self {
        ConnectionOptions {
            receive_buffer_size: manager.receive_buffer_size().max(1),
            max_packet_size: manager.max_packet_size(),
            ..ConnectionOptions::from_config(&NetworkConfig::default(), connection)
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions::from_config(&NetworkConfig::default(), &ConnectionConfig::default())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Accounting {
    bytes_queued: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

pub struct Connection {
    id: ConnectionId,
    self_ref: Weak<Connection>,
    manager: Arc<NetworkManager>,
    transport: Box<dyn Transport>,
    state: AtomicCell<ConnectionState>,
    can_send: AtomicBool,
    send_state: Mutex<SendState>,
    receive_state: Mutex<ReceiveState>,
    accounting: Mutex<Accounting>,
    callbacks: Callbacks,
    auto_reconnect: AtomicBool,
    reconnect_delay: AtomicCell<Duration>,
    manual_disconnect: AtomicBool,
    queue_while_disconnected: AtomicBool,
    discard_queue_on_disconnect: AtomicBool,
    next_packet_id: AtomicU32,
    remote_big_endian: AtomicBool,
    remote_details_received: AtomicBool,
    backlog_threshold: AtomicU64,
    max_packet_size: u32,
    owner: RwLock<Option<Weak<dyn ConnectionOwner>>>,
    local_identifier: RwLock<Option<String>>,
}

impl Connection {
    pub fn new(
        manager: Arc<NetworkManager>,
        transport: Box<dyn Transport>,
        options: ConnectionOptions,
    ) -> Arc<Connection> {
        Arc::new_cyclic(|self_ref| Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            self_ref: self_ref.clone(),
            manager,
            transport,
            state: AtomicCell::new(ConnectionState::Disconnected),
            can_send: AtomicBool::new(false),
            send_state: Mutex::new(SendState::default()),
            receive_state: Mutex::new(ReceiveState::new(options.receive_buffer_size)),
            accounting: Mutex::new(Accounting::default()),
            callbacks: Callbacks::default(),
            auto_reconnect: AtomicBool::new(options.auto_reconnect),
            reconnect_delay: AtomicCell::new(options.reconnect_delay),
            manual_disconnect: AtomicBool::new(false),
            queue_while_disconnected: AtomicBool::new(options.queue_while_disconnected),
            discard_queue_on_disconnect: AtomicBool::new(options.discard_queue_on_disconnect),
            next_packet_id: AtomicU32::new(1),
            remote_big_endian: AtomicBool::new(false),
            remote_details_received: AtomicBool::new(false),
            backlog_threshold: AtomicU64::new(options.backlog_threshold),
            max_packet_size: options.max_packet_size,
            owner: RwLock::new(None),
            local_identifier: RwLock::new(None),
        })
    }

    fn arc(&self) -> Option<Arc<Connection>> {
        self.self_ref.upgrade()
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn manager(&self) -> &Arc<NetworkManager> {
        &self.manager
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn friendly_identifier(&self) -> String {
        self.transport.friendly_identifier()
    }

    pub fn local_friendly_identifier(&self) -> Option<String> {
        self.local_identifier
            .read()
            .clone()
            .or_else(|| self.transport.local_friendly_identifier())
    }

    pub fn set_owner(&self, owner: Weak<dyn ConnectionOwner>) {
        *self.owner.write() = Some(owner);
    }

    fn owner(&self) -> Option<Arc<dyn ConnectionOwner>> {
        self.owner.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn can_send(&self) -> bool {
        self.can_send.load(Ordering::Acquire)
    }

    /// Entering `Connected` queues the handshake ahead of everything else
    /// and forces a drain.
    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state);
        if previous == state {
            return;
        }
        debug!(
            "connection {} state {:?} -> {:?}",
            self.id, previous, state
        );
        if state != ConnectionState::Connected {
            self.can_send.store(false, Ordering::Release);
        } else {
            self.send_host_details();
            self.update_send(true);
        }
    }

    /// Returns `Ok(false)` when already connected or connecting.
    pub fn connect(&self) -> AppResult<bool> {
        if self.is_connected() || self.is_connecting() {
            return Ok(false);
        }
        let connection = self.arc().ok_or_else(|| {
            AppError::IllegalStateError(format!("connection {} is being dropped", self.id))
        })?;
        self.manager.cancel_reconnect(self.id);
        self.manual_disconnect.store(false, Ordering::Release);
        self.transport.open(&connection)?;
        Ok(true)
    }

    /// Manual disconnect; suppresses auto reconnect until the next
    /// `connect`. Safe to call repeatedly and from callbacks.
    pub fn disconnect(&self) -> bool {
        self.manual_disconnect.store(true, Ordering::Release);
        self.manager.cancel_reconnect(self.id);
        if self.state() == ConnectionState::Disconnected {
            return false;
        }
        self.close_transport()
    }

    /// Closes the transport without marking the disconnect as manual, so an
    /// armed auto reconnect still fires.
    pub(crate) fn close_transport(&self) -> bool {
        match self.arc() {
            Some(connection) => self.transport.close(&connection),
            None => false,
        }
    }

    pub fn is_manual_disconnect(&self) -> bool {
        self.manual_disconnect.load(Ordering::Acquire)
    }

    /// Runs on the thread that noticed the loss, before any reconnect is
    /// armed.
    pub(crate) fn dropped(&self) {
        self.set_state(ConnectionState::Disconnected);
        let Some(connection) = self.arc() else {
            return;
        };
        info!("disconnected: {}", self.friendly_identifier());
        if let Some(owner) = self.owner() {
            owner.connection_dropped(&connection);
        }

        self.receive_state.lock().reset();
        let discard = self.discard_queue_on_disconnect.load(Ordering::Acquire);
        let requeued = {
            let mut send_state = self.send_state.lock();
            if discard {
                send_state.clear();
                None
            } else {
                Some(send_state.rewind_current())
            }
        };
        {
            let mut accounting = self.accounting.lock();
            match requeued {
                None => accounting.bytes_queued = 0,
                Some(bytes) => accounting.bytes_queued += bytes as u64,
            }
        }

        for callback in self.callbacks.disconnect.all() {
            callback(&connection);
        }

        if self.auto_reconnect.load(Ordering::Acquire) && !self.is_manual_disconnect() {
            self.manager
                .schedule_reconnect(&connection, self.reconnect_delay.load());
        }
    }

    /// Called once the connection is usable from the application side.
    pub(crate) fn established(&self) {
        let Some(connection) = self.arc() else {
            return;
        };
        *self.local_identifier.write() = self.transport.local_friendly_identifier();
        info!("connected: {}", self.friendly_identifier());
        if let Some(owner) = self.owner() {
            owner.connection_established(&connection);
        }
        for callback in self.callbacks.connect.all() {
            callback(&connection);
        }
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::Release);
        if !enabled {
            self.manager.cancel_reconnect(self.id);
        }
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::Acquire)
    }

    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.reconnect_delay.store(delay);
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay.load()
    }

    pub fn set_queue_while_disconnected(&self, enabled: bool) {
        self.queue_while_disconnected.store(enabled, Ordering::Release);
    }

    pub fn set_discard_queue_on_disconnect(&self, enabled: bool) {
        self.discard_queue_on_disconnect
            .store(enabled, Ordering::Release);
    }

    pub fn set_receive_buffer_size(&self, size: usize) {
        self.receive_state.lock().resize_buffer(size.max(1));
    }

    pub fn is_remote_big_endian(&self) -> bool {
        self.remote_big_endian.load(Ordering::Acquire)
    }

    /// True once the peer's handshake was accepted.
    pub fn has_remote_details(&self) -> bool {
        self.remote_details_received.load(Ordering::Acquire)
    }

    pub fn bytes_queued(&self) -> u64 {
        self.accounting.lock().bytes_queued
    }

    pub fn bytes_sent(&self) -> u64 {
        self.accounting.lock().bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.accounting.lock().bytes_received
    }

    pub fn queued_packets(&self) -> usize {
        self.send_state.lock().len()
    }

    /// Ids wrap below the reserved range and never hit 0.
    fn next_packet_id(&self) -> u32 {
        self.next_packet_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                let next = id.wrapping_add(1);
                Some(if next == 0 || next >= MINIMUM_RESERVED_PACKET_ID {
                    1
                } else {
                    next
                })
            })
            .unwrap_or_else(|id| id)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.friendly_identifier())
            .finish()
    }
}
