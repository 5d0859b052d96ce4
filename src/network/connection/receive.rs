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

use tracing::{error, trace};

use super::Connection;
use crate::network::packet::{ByteOrder, DataPacket, DataPacketHeader, HEADER_SIZE, REMOTE_DETAILS};
use crate::network::transport::IoStatus;
use crate::{AppError, AppResult};

/// Rebuilds frames from an arbitrary split of the byte stream.
pub(super) struct FrameAssembler {
    header: [u8; HEADER_SIZE],
    header_received: usize,
    body: Option<DataPacket>,
    /// byte order the peer writes headers in, learned from its handshake
    wire_order: ByteOrder,
}

impl FrameAssembler {
    pub(super) fn new() -> Self {
        FrameAssembler {
            header: [0; HEADER_SIZE],
            header_received: 0,
            body: None,
            wire_order: ByteOrder::native(),
        }
    }

    pub(super) fn reset(&mut self) {
        self.header_received = 0;
        self.body = None;
    }

    /// Appends `bytes`, pushing every frame it completes onto `completed`.
    /// Fails when a header declares a payload above `max_packet_size`.
    pub(super) fn consume(
        &mut self,
        mut bytes: &[u8],
        max_packet_size: u32,
        completed: &mut Vec<DataPacket>,
    ) -> AppResult<()> {
        while !bytes.is_empty() {
            if self.body.is_none() {
                let take = bytes.len().min(HEADER_SIZE - self.header_received);
                self.header[self.header_received..self.header_received + take]
                    .copy_from_slice(&bytes[..take]);
                self.header_received += take;
                bytes = &bytes[take..];
                if self.header_received < HEADER_SIZE {
                    break;
                }
                let header = self.decode_header(max_packet_size)?;
                self.body = Some(
                    DataPacket::new(header.packet_type, header.data_length as usize)
                        .with_packet_id(header.packet_id)
                        .with_byte_order(self.wire_order),
                );
            }

            if let Some(body) = self.body.as_mut() {
                let appended = body.append_data(bytes);
                bytes = &bytes[appended..];
                if body.has_received_all_data() {
                    if let Some(packet) = self.body.take() {
                        completed.push(packet);
                    }
                    self.header_received = 0;
                }
            }
        }
        Ok(())
    }

    /// The handshake type id reads the same in either byte order, so an
    /// implausible handshake length means the peer uses the other order.
    fn decode_header(&mut self, max_packet_size: u32) -> AppResult<DataPacketHeader> {
        let header = DataPacketHeader::decode(&self.header, self.wire_order);
        if header.data_length <= max_packet_size {
            return Ok(header);
        }
        if header.packet_type == REMOTE_DETAILS {
            let swapped_order = self.wire_order.swapped();
            let swapped = DataPacketHeader::decode(&self.header, swapped_order);
            if swapped.data_length <= max_packet_size {
                self.wire_order = swapped_order;
                return Ok(swapped);
            }
        }
        Err(AppError::PacketTooLarge(format!(
            "packet type {:#x} declares {} bytes, limit is {}",
            header.packet_type, header.data_length, max_packet_size
        )))
    }
}

pub(super) struct ReceiveState {
    buffer: Vec<u8>,
    assembler: FrameAssembler,
}

impl ReceiveState {
    pub(super) fn new(buffer_size: usize) -> Self {
        ReceiveState {
            buffer: vec![0; buffer_size],
            assembler: FrameAssembler::new(),
        }
    }

    pub(super) fn reset(&mut self) {
        self.assembler.reset();
    }

    pub(super) fn resize_buffer(&mut self, size: usize) {
        self.buffer.resize(size, 0);
        self.buffer.shrink_to_fit();
    }
}

impl Connection {
    /// One non-blocking read followed by frame reassembly. Completed
    /// packets go to the manager after the receive lock is released.
    pub fn receive_packets(&self) -> IoStatus {
        let mut completed = Vec::new();
        let status = {
            let mut state = self.receive_state.lock();
            let ReceiveState { buffer, assembler } = &mut *state;
            let (received, status) = self.transport.receive(buffer);
            if status != IoStatus::Success {
                return status;
            }
            self.manager.report_received_data(received);
            self.accounting.lock().bytes_received += received as u64;
            trace!("connection {} received {} bytes", self.id, received);

            match assembler.consume(&buffer[..received], self.max_packet_size, &mut completed) {
                Ok(()) => IoStatus::Success,
                Err(e) => {
                    error!(
                        "connection {} ({}) protocol error: {}",
                        self.id,
                        self.friendly_identifier(),
                        e
                    );
                    IoStatus::Disconnect
                }
            }
        };

        if let Some(connection) = self.arc() {
            for packet in completed {
                self.manager.connection_packet_received(&connection, packet);
            }
        }
        status
    }

    pub fn update_receive(&self) {
        if self.receive_packets() == IoStatus::Disconnect {
            self.close_transport();
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::{fixture, rstest};

    use super::*;
    use crate::network::connection::test_support::{connected_pair, frame};
    use crate::network::connection::ConnectionOptions;
    use crate::setup_local_tracing;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().ok();
    }

    fn sample_packets() -> Vec<(u32, u32, Vec<u8>)> {
        vec![
            (7, 1, b"first".to_vec()),
            (8, 2, Vec::new()),
            (9, 3, (0..=255u8).collect()),
            (7, 4, vec![0xAB; 1000]),
        ]
    }

    fn stream(packets: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
        packets
            .iter()
            .flat_map(|(t, id, payload)| frame(*t, *id, payload))
            .collect()
    }

    fn assert_matches(completed: &[DataPacket], packets: &[(u32, u32, Vec<u8>)]) {
        assert_eq!(completed.len(), packets.len());
        for (packet, (t, id, payload)) in completed.iter().zip(packets) {
            assert_eq!(packet.packet_type(), *t);
            assert_eq!(packet.packet_id(), *id);
            assert_eq!(packet.payload(), payload.as_slice());
        }
    }

    #[rstest]
    #[case(1)]
    #[case(5)]
    #[case(12)]
    #[case(13)]
    #[case(4096)]
    fn test_fixed_chunks(_setup: (), #[case] chunk: usize) {
        let packets = sample_packets();
        let bytes = stream(&packets);
        let mut assembler = FrameAssembler::new();
        let mut completed = Vec::new();
        for piece in bytes.chunks(chunk) {
            assembler.consume(piece, 0x00A0_0000, &mut completed).unwrap();
        }
        assert_matches(&completed, &packets);
    }

    #[rstest]
    fn test_random_chunks(_setup: ()) {
        let packets = sample_packets();
        let bytes = stream(&packets);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let mut assembler = FrameAssembler::new();
            let mut completed = Vec::new();
            let mut rest = bytes.as_slice();
            while !rest.is_empty() {
                let take = rng.gen_range(1..=rest.len().min(64));
                assembler
                    .consume(&rest[..take], 0x00A0_0000, &mut completed)
                    .unwrap();
                rest = &rest[take..];
            }
            assert_matches(&completed, &packets);
        }
    }

    #[rstest]
    fn test_second_header_starts_in_same_read(_setup: ()) {
        let mut bytes = frame(7, 1, b"one");
        let second = frame(8, 2, b"two");
        bytes.extend_from_slice(&second[..5]);
        let mut assembler = FrameAssembler::new();
        let mut completed = Vec::new();
        assembler.consume(&bytes, 0x00A0_0000, &mut completed).unwrap();
        assert_eq!(completed.len(), 1);
        assembler
            .consume(&second[5..], 0x00A0_0000, &mut completed)
            .unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[1].payload(), b"two");
    }

    #[rstest]
    fn test_oversized_length_rejected(_setup: ()) {
        let header = DataPacketHeader::new(7, 1, 1025).encode();
        let mut assembler = FrameAssembler::new();
        let mut completed = Vec::new();
        let result = assembler.consume(&header, 1024, &mut completed);
        assert!(matches!(result, Err(AppError::PacketTooLarge(_))));
        assert!(completed.is_empty());
    }

    #[rstest]
    fn test_foreign_order_handshake_switches_wire_order(_setup: ()) {
        let swap = |v: u32| v.swap_bytes().to_ne_bytes();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&swap(REMOTE_DETAILS));
        bytes.extend_from_slice(&swap(1));
        bytes.extend_from_slice(&swap(2));
        bytes.extend_from_slice(b"ok");
        bytes.extend_from_slice(&swap(7));
        bytes.extend_from_slice(&swap(2));
        bytes.extend_from_slice(&swap(1));
        bytes.push(0xFF);

        let mut assembler = FrameAssembler::new();
        let mut completed = Vec::new();
        assembler.consume(&bytes, 0x00A0_0000, &mut completed).unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].payload(), b"ok");
        assert_eq!(completed[1].packet_type(), 7);
        assert_eq!(completed[1].packet_id(), 2);
        assert_eq!(completed[1].byte_order(), ByteOrder::native().swapped());
    }

    #[rstest]
    fn test_connection_receives_through_transport(_setup: ()) {
        let (connection, mock) = connected_pair(ConnectionOptions {
            receive_buffer_size: 7,
            ..ConnectionOptions::default()
        });
        let packets = sample_packets();
        mock.push_incoming(&stream(&packets));
        while mock.pending_incoming() > 0 {
            assert_eq!(connection.receive_packets(), IoStatus::Success);
        }
        assert_eq!(connection.manager().pending_packets(), packets.len());
        assert_eq!(
            connection.bytes_received(),
            stream(&packets).len() as u64
        );
        assert_eq!(connection.receive_packets(), IoStatus::Wait);
    }

    #[rstest]
    fn test_oversized_frame_disconnects(_setup: ()) {
        let (connection, mock) = connected_pair(ConnectionOptions {
            max_packet_size: 16,
            ..ConnectionOptions::default()
        });
        mock.push_incoming(&frame(7, 1, &[0u8; 17]));
        connection.update_receive();
        assert!(!connection.is_connected());
        assert_eq!(mock.close_count(), 1);
    }

    #[rstest]
    fn test_orderly_close_disconnects(_setup: ()) {
        let (connection, mock) = connected_pair(ConnectionOptions::default());
        mock.close_incoming();
        connection.update_receive();
        assert!(!connection.is_connected());
    }
}
