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

//! In-memory transport for exercising connections without sockets.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Connection, ConnectionOptions, ConnectionState};
use crate::network::manager::NetworkManager;
use crate::network::packet::DataPacketHeader;
use crate::network::transport::{IoStatus, Transport};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    /// 0 writes everything offered
    send_chunk: usize,
    /// total bytes accepted before reporting `Wait`
    send_budget: Option<usize>,
    fail_sends: bool,
    incoming: VecDeque<u8>,
    incoming_closed: bool,
    open_count: usize,
    open_fails: bool,
    close_count: usize,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub(crate) fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    pub(crate) fn set_send_chunk(&self, chunk: usize) {
        self.state.lock().send_chunk = chunk;
    }

    pub(crate) fn set_send_budget(&self, budget: Option<usize>) {
        self.state.lock().send_budget = budget;
    }

    pub(crate) fn fail_sends(&self) {
        self.state.lock().fail_sends = true;
    }

    pub(crate) fn push_incoming(&self, bytes: &[u8]) {
        self.state.lock().incoming.extend(bytes.iter().copied());
    }

    pub(crate) fn pending_incoming(&self) -> usize {
        self.state.lock().incoming.len()
    }

    pub(crate) fn close_incoming(&self) {
        self.state.lock().incoming_closed = true;
    }

    pub(crate) fn set_open_fails(&self, fails: bool) {
        self.state.lock().open_fails = fails;
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.lock().close_count
    }
}

impl Transport for MockTransport {
    fn send(&self, buf: &[u8]) -> (usize, IoStatus) {
        let mut state = self.state.lock();
        if state.fail_sends {
            return (0, IoStatus::Disconnect);
        }
        let mut count = buf.len();
        if state.send_chunk > 0 {
            count = count.min(state.send_chunk);
        }
        if let Some(budget) = state.send_budget {
            if budget == 0 {
                return (0, IoStatus::Wait);
            }
            count = count.min(budget);
            state.send_budget = Some(budget - count);
        }
        state.written.extend_from_slice(&buf[..count]);
        (count, IoStatus::Success)
    }

    fn receive(&self, buf: &mut [u8]) -> (usize, IoStatus) {
        let mut state = self.state.lock();
        if state.incoming.is_empty() {
            return if state.incoming_closed {
                (0, IoStatus::Disconnect)
            } else {
                (0, IoStatus::Wait)
            };
        }
        let count = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..count)) {
            *slot = byte;
        }
        (count, IoStatus::Success)
    }

    fn open(&self, connection: &Arc<Connection>) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            state.open_count += 1;
            if state.open_fails {
                return Err(AppError::DetailedIoError("mock open refused".to_string()));
            }
        }
        connection.set_state(ConnectionState::Connecting);
        Ok(())
    }

    fn close(&self, connection: &Arc<Connection>) -> bool {
        self.state.lock().close_count += 1;
        connection.set_state(ConnectionState::Disconnected);
        connection.dropped();
        true
    }

    fn friendly_identifier(&self) -> String {
        "(Mock)direct:peer:1".to_string()
    }

    fn local_friendly_identifier(&self) -> Option<String> {
        Some("(Mock)direct:local:2".to_string())
    }
}

pub(crate) fn manager() -> Arc<NetworkManager> {
    NetworkManager::new(&NetworkConfig::default())
}

pub(crate) fn disconnected(options: ConnectionOptions) -> (Arc<Connection>, MockTransport) {
    let mock = MockTransport::default();
    let connection = Connection::new(manager(), Box::new(mock.clone()), options);
    (connection, mock)
}

/// A connection that has completed its transport connect and already
/// written its handshake.
pub(crate) fn connected_pair(options: ConnectionOptions) -> (Arc<Connection>, MockTransport) {
    let (connection, mock) = disconnected(options);
    connection.set_state(ConnectionState::Connected);
    (connection, mock)
}

/// Encodes one frame the way a native order peer would.
pub(crate) fn frame(packet_type: u32, packet_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = DataPacketHeader::new(packet_type, packet_id, payload.len() as u32)
        .encode()
        .to_vec();
    bytes.extend_from_slice(payload);
    bytes
}
