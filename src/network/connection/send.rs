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

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{Connection, ConnectionState, ResponseCallback};
use crate::network::packet::{
    is_labelled_type, is_reserved_type, DataPacket, DataPacketHeader, HEADER_SIZE,
    LABELLED_RESPONSE_PACKET, RESPONSE_PACKET,
};
use crate::network::transport::IoStatus;
use crate::{AppError, AppResult};

pub(super) struct QueuedPacket {
    packet: Arc<DataPacket>,
    header: [u8; HEADER_SIZE],
    /// payload bytes not yet written
    remaining: usize,
    disconnect_after_send: bool,
}

impl QueuedPacket {
    fn new(packet: Arc<DataPacket>, packet_id: u32, disconnect_after_send: bool) -> Self {
        let header =
            DataPacketHeader::new(packet.packet_type(), packet_id, packet.size() as u32).encode();
        QueuedPacket {
            remaining: packet.size(),
            packet,
            header,
            disconnect_after_send,
        }
    }
}

/// Outbound queue plus the packet currently on the wire. Kept apart from
/// the queue so a prioritised push can never land in the middle of a frame.
#[derive(Default)]
pub(super) struct SendState {
    queue: VecDeque<QueuedPacket>,
    current: Option<QueuedPacket>,
    header_sent: bool,
    header_bytes_sent: usize,
}

impl SendState {
    pub(super) fn len(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    pub(super) fn clear(&mut self) {
        self.queue.clear();
        self.current = None;
        self.header_sent = false;
        self.header_bytes_sent = 0;
    }

    /// Puts the in-flight packet back at the head of the queue, to be
    /// resent from its first byte, and returns how many of its bytes had
    /// already been written.
    pub(super) fn rewind_current(&mut self) -> usize {
        let header_written = if self.header_sent {
            HEADER_SIZE
        } else {
            self.header_bytes_sent
        };
        self.header_sent = false;
        self.header_bytes_sent = 0;
        match self.current.take() {
            Some(mut current) => {
                let payload_written = current.packet.size() - current.remaining;
                current.remaining = current.packet.size();
                self.queue.push_front(current);
                header_written + payload_written
            }
            None => 0,
        }
    }
}

impl Connection {
    /// Queues `packet` and tries to write it straight away.
    ///
    /// While disconnected with queueing disabled the packet is dropped
    /// without error. Response packets keep the packet id they were built
    /// with, everything else gets a fresh id.
    pub fn send_data_packet(
        &self,
        packet: impl Into<Arc<DataPacket>>,
        response_callback: Option<ResponseCallback>,
        prioritise: bool,
        disconnect_after_send: bool,
        is_response_packet: bool,
    ) {
        let packet: Arc<DataPacket> = packet.into();
        if self.state() == ConnectionState::Disconnected
            && !self.queue_while_disconnected.load(Ordering::Acquire)
        {
            trace!(
                "connection {} dropping packet type {:#x} while disconnected",
                self.id,
                packet.packet_type()
            );
            return;
        }

        let queued_bytes = (packet.size() + HEADER_SIZE) as u64;
        let backlog = {
            let mut accounting = self.accounting.lock();
            accounting.bytes_queued += queued_bytes;
            accounting.bytes_queued
        };
        let threshold = self.backlog_threshold.load(Ordering::Acquire);
        if threshold > 0 && backlog >= threshold {
            if let (Some(callback), Some(connection)) = (self.callbacks.backlog(), self.arc()) {
                if !callback(&connection, backlog) {
                    debug!(
                        "connection {} backlog of {} bytes rejected packet type {:#x}",
                        self.id,
                        backlog,
                        packet.packet_type()
                    );
                    let mut accounting = self.accounting.lock();
                    accounting.bytes_queued = accounting.bytes_queued.saturating_sub(queued_bytes);
                    return;
                }
            }
        }

        let packet_id = if is_response_packet {
            packet.packet_id()
        } else {
            self.next_packet_id()
        };

        {
            let mut send_state = self.send_state.lock();
            let queued = QueuedPacket::new(packet, packet_id, disconnect_after_send);
            if prioritise {
                send_state.queue.push_front(queued);
            } else {
                send_state.queue.push_back(queued);
            }
            if let Some(callback) = response_callback {
                self.callbacks.response.lock().insert(packet_id, callback);
            }
        }

        self.update_send(false);
    }

    /// Drains the queue and applies the outcome: a transport failure closes
    /// the transport, a completed disconnect-after-send packet disconnects.
    pub fn update_send(&self, reenable: bool) {
        match self.send_packets(reenable) {
            IoStatus::Disconnect => {
                self.close_transport();
            }
            IoStatus::DisconnectRequested => {
                self.disconnect();
            }
            _ => {}
        }
    }

    /// Writes queued packets until the queue is empty or the transport
    /// pushes back.
    ///
    /// Without `reenable` this fails fast with `InternalFailure` when the
    /// connection is not sendable or another thread holds the send lock;
    /// with `reenable` it waits for the lock.
    pub fn send_packets(&self, reenable: bool) -> IoStatus {
        let mut send_state = if reenable {
            self.send_state.lock()
        } else {
            if !self.can_send() {
                return IoStatus::InternalFailure;
            }
            match self.send_state.try_lock() {
                Some(guard) => guard,
                None => return IoStatus::InternalFailure,
            }
        };
        if !self.is_connected() {
            return IoStatus::InternalFailure;
        }

        self.can_send.store(false, Ordering::Release);
        let status = self.drain(&mut send_state);
        if status == IoStatus::Success {
            self.can_send.store(self.is_connected(), Ordering::Release);
        }
        status
    }

    fn drain(&self, state: &mut SendState) -> IoStatus {
        let SendState {
            queue,
            current,
            header_sent,
            header_bytes_sent,
        } = state;

        loop {
            if current.is_none() {
                *current = queue.pop_front();
                *header_sent = false;
                *header_bytes_sent = 0;
            }
            let Some(packet) = current.as_mut() else {
                return IoStatus::Success;
            };

            if !*header_sent {
                let (sent, status) = self.transport.send(&packet.header[*header_bytes_sent..]);
                self.account_sent(sent);
                *header_bytes_sent += sent;
                if status != IoStatus::Success {
                    return status;
                }
                if *header_bytes_sent < HEADER_SIZE {
                    continue;
                }
                *header_sent = true;

                if packet.packet.size() == 0 {
                    let disconnect = packet.disconnect_after_send;
                    *current = None;
                    *header_sent = false;
                    if disconnect {
                        return IoStatus::DisconnectRequested;
                    }
                    continue;
                }
            }

            let offset = packet.packet.size() - packet.remaining;
            let (sent, status) = self.transport.send(&packet.packet.payload()[offset..]);
            self.account_sent(sent);
            packet.remaining -= sent.min(packet.remaining);
            if status != IoStatus::Success {
                return status;
            }
            if packet.remaining == 0 {
                let disconnect = packet.disconnect_after_send;
                *current = None;
                *header_sent = false;
                if disconnect {
                    return IoStatus::DisconnectRequested;
                }
            }
        }
    }

    fn account_sent(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.manager.report_sent_data(bytes);
        let mut accounting = self.accounting.lock();
        accounting.bytes_queued = accounting.bytes_queued.saturating_sub(bytes as u64);
        accounting.bytes_sent += bytes as u64;
    }

    fn check_user_type(packet_type: u32) -> AppResult<()> {
        if is_reserved_type(packet_type) {
            return Err(AppError::ReservedPacketType(packet_type));
        }
        Ok(())
    }

    pub fn send_data(
        &self,
        packet_type: u32,
        data: &[u8],
        response_callback: Option<ResponseCallback>,
        prioritise: bool,
    ) -> AppResult<()> {
        Self::check_user_type(packet_type)?;
        self.send_data_packet(
            DataPacket::from_payload(packet_type, data),
            response_callback,
            prioritise,
            false,
            false,
        );
        Ok(())
    }

    pub fn send_message(
        &self,
        packet_type: u32,
        message: &str,
        response_callback: Option<ResponseCallback>,
        prioritise: bool,
    ) -> AppResult<()> {
        Self::check_user_type(packet_type)?;
        self.send_data_packet(
            DataPacket::message(packet_type, message),
            response_callback,
            prioritise,
            false,
            false,
        );
        Ok(())
    }

    /// Header only packet.
    pub fn send_control_packet(
        &self,
        packet_type: u32,
        response_callback: Option<ResponseCallback>,
        prioritise: bool,
    ) -> AppResult<()> {
        Self::check_user_type(packet_type)?;
        self.send_data_packet(
            DataPacket::control(packet_type),
            response_callback,
            prioritise,
            false,
            false,
        );
        Ok(())
    }

    pub fn send_labelled_packet(
        &self,
        label: &str,
        data: &[u8],
        response_callback: Option<ResponseCallback>,
        prioritise: bool,
    ) {
        self.send_data_packet(
            DataPacket::labelled(label, data),
            response_callback,
            prioritise,
            false,
            false,
        );
    }

    pub fn send_labelled_message(
        &self,
        label: &str,
        message: &str,
        response_callback: Option<ResponseCallback>,
        prioritise: bool,
    ) {
        self.send_data_packet(
            DataPacket::labelled_message(label, message),
            response_callback,
            prioritise,
            false,
            false,
        );
    }

    pub fn send_labelled_strings(
        &self,
        label: &str,
        strings: &[&str],
        response_callback: Option<ResponseCallback>,
        prioritise: bool,
    ) {
        self.send_data_packet(
            DataPacket::labelled_strings(label, strings),
            response_callback,
            prioritise,
            false,
            false,
        );
    }

    /// Sends `packet` as the answer to `responding_to`, reusing its packet
    /// id. Labelled packets travel as labelled responses.
    pub fn send_data_packet_response(
        &self,
        responding_to: &DataPacket,
        packet: DataPacket,
        prioritise: bool,
        disconnect_after_send: bool,
    ) {
        let response_type = if is_labelled_type(packet.packet_type()) {
            LABELLED_RESPONSE_PACKET
        } else {
            RESPONSE_PACKET
        };
        let packet = packet
            .with_packet_type(response_type)
            .with_packet_id(responding_to.packet_id());
        self.send_data_packet(packet, None, prioritise, disconnect_after_send, true);
    }

    pub fn send_data_response(
        &self,
        responding_to: &DataPacket,
        data: &[u8],
        prioritise: bool,
        disconnect_after_send: bool,
    ) {
        self.send_data_packet_response(
            responding_to,
            DataPacket::from_payload(RESPONSE_PACKET, data),
            prioritise,
            disconnect_after_send,
        );
    }

    pub fn send_message_response(
        &self,
        responding_to: &DataPacket,
        message: &str,
        prioritise: bool,
        disconnect_after_send: bool,
    ) {
        self.send_data_packet_response(
            responding_to,
            DataPacket::message(RESPONSE_PACKET, message),
            prioritise,
            disconnect_after_send,
        );
    }

    pub fn send_labelled_response(
        &self,
        responding_to: &DataPacket,
        label: &str,
        data: &[u8],
        prioritise: bool,
        disconnect_after_send: bool,
    ) {
        self.send_data_packet_response(
            responding_to,
            DataPacket::labelled(label, data),
            prioritise,
            disconnect_after_send,
        );
    }
}
