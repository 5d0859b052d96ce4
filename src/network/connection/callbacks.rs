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

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::Connection;
use crate::network::packet::{
    DataPacket, LABELLED_PACKET, LABELLED_RESPONSE_PACKET, REMOTE_DETAILS, RESPONSE_PACKET,
};

pub type PacketCallback = Arc<dyn Fn(&Arc<Connection>, &Arc<DataPacket>) + Send + Sync>;
/// Fires at most once, for the response carrying the request's packet id.
pub type ResponseCallback = Box<dyn FnOnce(&Arc<Connection>, &Arc<DataPacket>) + Send>;
/// Receives the payload bytes that follow the label.
pub type LabelledPacketCallback =
    Arc<dyn Fn(&Arc<Connection>, &Arc<DataPacket>, &[u8]) + Send + Sync>;
pub type ConnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Called with the bytes queued once the backlog threshold is reached;
/// returning false drops the packet being queued.
pub type BacklogCallback = Arc<dyn Fn(&Arc<Connection>, u64) -> bool + Send + Sync>;

/// Key to callback list map read by copying the list out, so no lock is
/// held while callbacks run.
pub(super) struct CallbackRegistry<K, V> {
    map: RwLock<HashMap<K, Vec<V>>>,
}

impl<K, V> Default for CallbackRegistry<K, V> {
    fn default() -> Self {
        CallbackRegistry {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> CallbackRegistry<K, V> {
    pub(super) fn register(&self, key: K, callback: V) {
        self.map.write().entry(key).or_default().push(callback);
    }

    pub(super) fn get<Q>(&self, key: &Q) -> Vec<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.map.read().get(key).cloned().unwrap_or_default()
    }

    pub(super) fn all(&self) -> Vec<V> {
        self.map.read().values().flatten().cloned().collect()
    }

    pub(super) fn clear<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.map.write().remove(key).is_some()
    }

    pub(super) fn clear_all(&self) {
        self.map.write().clear();
    }
}

#[derive(Default)]
pub(super) struct Callbacks {
    pub(super) packet: CallbackRegistry<u32, PacketCallback>,
    pub(super) labelled: CallbackRegistry<String, LabelledPacketCallback>,
    pub(super) connect: CallbackRegistry<String, ConnectCallback>,
    pub(super) disconnect: CallbackRegistry<String, DisconnectCallback>,
    pub(super) response: Mutex<HashMap<u32, ResponseCallback>>,
    backlog: RwLock<Option<BacklogCallback>>,
    allowed_packet_types: RwLock<HashSet<u32>>,
    allowed_labels: RwLock<HashSet<String>>,
}

impl Callbacks {
    pub(super) fn backlog(&self) -> Option<BacklogCallback> {
        self.backlog.read().clone()
    }
}

impl Connection {
    pub fn register_packet_callback(&self, packet_type: u32, callback: PacketCallback) {
        self.callbacks.packet.register(packet_type, callback);
    }

    pub fn register_labelled_packet_callback(&self, label: &str, callback: LabelledPacketCallback) {
        self.callbacks.labelled.register(label.to_string(), callback);
    }

    pub fn register_connect_callback(&self, identifier: &str, callback: ConnectCallback) {
        self.callbacks.connect.register(identifier.to_string(), callback);
    }

    pub fn register_disconnect_callback(&self, identifier: &str, callback: DisconnectCallback) {
        self.callbacks
            .disconnect
            .register(identifier.to_string(), callback);
    }

    /// A threshold of 0 disables the callback.
    pub fn set_backlog_callback(&self, callback: BacklogCallback, threshold: u64) {
        *self.callbacks.backlog.write() = Some(callback);
        self.backlog_threshold.store(threshold, Ordering::Release);
    }

    pub fn clear_backlog_callback(&self) {
        *self.callbacks.backlog.write() = None;
        self.backlog_threshold.store(0, Ordering::Release);
    }

    pub fn clear_packet_callbacks(&self, packet_type: u32) {
        self.callbacks.packet.clear(&packet_type);
    }

    pub fn clear_all_packet_type_callbacks(&self) {
        self.callbacks.packet.clear_all();
    }

    pub fn clear_labelled_packet_callbacks(&self, label: &str) {
        self.callbacks.labelled.clear(label);
    }

    pub fn clear_all_labelled_packet_callbacks(&self) {
        self.callbacks.labelled.clear_all();
    }

    /// Packet type and labelled callbacks.
    pub fn clear_all_packet_callbacks(&self) {
        self.clear_all_packet_type_callbacks();
        self.clear_all_labelled_packet_callbacks();
    }

    pub fn clear_connect_callbacks(&self, identifier: &str) {
        self.callbacks.connect.clear(identifier);
    }

    pub fn clear_all_connect_callbacks(&self) {
        self.callbacks.connect.clear_all();
    }

    pub fn clear_disconnect_callbacks(&self, identifier: &str) {
        self.callbacks.disconnect.clear(identifier);
    }

    pub fn clear_all_disconnect_callbacks(&self) {
        self.callbacks.disconnect.clear_all();
    }

    pub fn pending_responses(&self) -> usize {
        self.callbacks.response.lock().len()
    }

    /// The handshake type is always accepted and cannot be listed.
    pub fn add_allowed_packet_type(&self, packet_type: u32) {
        if packet_type == REMOTE_DETAILS {
            warn!("the handshake packet type is always allowed");
            return;
        }
        self.callbacks
            .allowed_packet_types
            .write()
            .insert(packet_type);
    }

    pub fn remove_allowed_packet_type(&self, packet_type: u32) {
        if packet_type == REMOTE_DETAILS {
            warn!("the handshake packet type cannot be removed from the allow list");
            return;
        }
        self.callbacks
            .allowed_packet_types
            .write()
            .remove(&packet_type);
    }

    pub fn allowed_packet_types(&self) -> HashSet<u32> {
        self.callbacks.allowed_packet_types.read().clone()
    }

    /// Labelled and response packets, for allow lists that still want the
    /// built in sub protocols.
    pub fn add_built_in_packet_types_to_allow_list(&self) {
        let mut allowed = self.callbacks.allowed_packet_types.write();
        allowed.insert(LABELLED_PACKET);
        allowed.insert(LABELLED_RESPONSE_PACKET);
        allowed.insert(RESPONSE_PACKET);
    }

    pub fn add_allowed_label(&self, label: &str) {
        self.callbacks
            .allowed_labels
            .write()
            .insert(label.to_string());
    }

    pub fn remove_allowed_label(&self, label: &str) {
        self.callbacks.allowed_labels.write().remove(label);
    }

    pub fn allowed_labels(&self) -> HashSet<String> {
        self.callbacks.allowed_labels.read().clone()
    }

    fn is_packet_type_allowed(&self, packet_type: u32) -> bool {
        if packet_type == REMOTE_DETAILS {
            return true;
        }
        let allowed = self.callbacks.allowed_packet_types.read();
        allowed.is_empty() || allowed.contains(&packet_type)
    }

    /// Application side dispatch of one completed packet.
    ///
    /// A type outside a non-empty allow list disconnects. Responses go to
    /// the single callback waiting on their packet id; anything else goes to
    /// the built in handlers and every callback registered for the type. The
    /// owner hears about every accepted packet.
    pub fn process_received_packet(&self, packet: &Arc<DataPacket>) {
        let Some(connection) = self.arc() else {
            return;
        };
        let packet_type = packet.packet_type();
        if !self.is_packet_type_allowed(packet_type) {
            warn!(
                "connection {} received packet type {:#x} not in the allow list, disconnecting",
                self.id, packet_type
            );
            self.disconnect();
            return;
        }

        if packet.is_response_packet() {
            let callback = self.callbacks.response.lock().remove(&packet.packet_id());
            match callback {
                Some(callback) => callback(&connection, packet),
                None => debug!(
                    "connection {} has no response callback for packet id {}",
                    self.id,
                    packet.packet_id()
                ),
            }
        } else {
            match packet_type {
                REMOTE_DETAILS => self.on_remote_details(packet),
                LABELLED_PACKET => self.process_labelled_packet(&connection, packet),
                _ => {}
            }
            for callback in self.callbacks.packet.get(&packet_type) {
                callback(&connection, packet);
            }
        }

        if let Some(owner) = self.owner() {
            owner.received_packet(&connection, packet);
        }
    }

    fn process_labelled_packet(&self, connection: &Arc<Connection>, packet: &Arc<DataPacket>) {
        let label = match packet.label() {
            Some(label) if !label.is_empty() => label,
            _ => {
                warn!(
                    "connection {} received a labelled packet without a label",
                    self.id
                );
                return;
            }
        };

        let allowed = {
            let allowed = self.callbacks.allowed_labels.read();
            allowed.is_empty() || allowed.contains(&label)
        };
        if !allowed {
            warn!(
                "connection {} received label '{}' not in the allow list, disconnecting",
                self.id, label
            );
            self.disconnect();
            return;
        }

        let data = packet.data_after_label();
        for callback in self.callbacks.labelled.get(label.as_str()) {
            callback(connection, packet, data);
        }
    }
}
