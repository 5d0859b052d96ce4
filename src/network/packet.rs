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

//! Frame codec.
//!
//! A frame is a 12 byte header followed by the payload. The header carries
//! three u32 fields in the sender's native byte order: packet type id,
//! packet id and payload length. Peers learn each other's byte order from
//! the handshake packet sent right after the connection is established.

use bytes::{BufMut, BytesMut};

pub const HEADER_SIZE: usize = 12;
/// `[u32 bytes per char][u32 length]` prefix of an encoded string.
pub const STRING_HEADER_SIZE: usize = 8;

pub const LABELLED_PACKET: u32 = 0xFFFF_FFFF;
pub const REMOTE_DETAILS: u32 = 0xFEFE_FEFE;
pub const LABELLED_RESPONSE_PACKET: u32 = 0xF000_0002;
pub const RESPONSE_PACKET: u32 = 0xF000_0001;
/// Packet types and packet ids at or above this value are reserved.
pub const MINIMUM_RESERVED_PACKET_ID: u32 = 0xF000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn is_big(self) -> bool {
        self == ByteOrder::Big
    }

    pub fn swapped(self) -> ByteOrder {
        match self {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ByteOrder::Little => "little",
            ByteOrder::Big => "big",
        }
    }

    pub fn parse(token: &str) -> Option<ByteOrder> {
        match token {
            "little" => Some(ByteOrder::Little),
            "big" => Some(ByteOrder::Big),
            _ => None,
        }
    }

    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        }
    }
}

/// Decoded form of the fixed size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacketHeader {
    pub packet_type: u32,
    pub packet_id: u32,
    pub data_length: u32,
}

impl DataPacketHeader {
    pub fn new(packet_type: u32, packet_id: u32, data_length: u32) -> Self {
        DataPacketHeader {
            packet_type,
            packet_id,
            data_length,
        }
    }

    /// Encodes in native byte order, as every frame leaves this host.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.packet_type.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.packet_id.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.data_length.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE], order: ByteOrder) -> Self {
        let field = |at: usize| order.read_u32([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        DataPacketHeader {
            packet_type: field(0),
            packet_id: field(4),
            data_length: field(8),
        }
    }
}

/// Appends `[1][len][bytes]` in native byte order.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.reserve(STRING_HEADER_SIZE + value.len());
    buf.put_slice(&1u32.to_ne_bytes());
    buf.put_slice(&(value.len() as u32).to_ne_bytes());
    buf.put_slice(value.as_bytes());
}

pub fn encoded_string_len(value: &str) -> usize {
    STRING_HEADER_SIZE + value.len()
}

/// One framed unit: either built locally for sending or reassembled from the
/// wire. Received packets carry the remote byte order so multi byte reads
/// decode correctly.
#[derive(Debug, Clone)]
pub struct DataPacket {
    packet_type: u32,
    packet_id: u32,
    byte_order: ByteOrder,
    size: usize,
    data: BytesMut,
}

impl DataPacket {
    /// An empty body of `size` bytes waiting to be filled by `append_data`.
    pub fn new(packet_type: u32, size: usize) -> DataPacket {
        DataPacket {
            packet_type,
            packet_id: 0,
            byte_order: ByteOrder::native(),
            size,
            data: BytesMut::with_capacity(size),
        }
    }

    pub fn from_payload(packet_type: u32, payload: &[u8]) -> DataPacket {
        DataPacket {
            packet_type,
            packet_id: 0,
            byte_order: ByteOrder::native(),
            size: payload.len(),
            data: BytesMut::from(payload),
        }
    }

    /// Header only packet.
    pub fn control(packet_type: u32) -> DataPacket {
        DataPacket::new(packet_type, 0)
    }

    pub fn message(packet_type: u32, text: &str) -> DataPacket {
        let mut data = BytesMut::new();
        put_string(&mut data, text);
        DataPacket::from_buf(packet_type, data)
    }

    pub fn labelled(label: &str, payload: &[u8]) -> DataPacket {
        let mut data = BytesMut::with_capacity(encoded_string_len(label) + payload.len());
        put_string(&mut data, label);
        data.put_slice(payload);
        DataPacket::from_buf(LABELLED_PACKET, data)
    }

    pub fn labelled_message(label: &str, text: &str) -> DataPacket {
        DataPacket::labelled_strings(label, &[text])
    }

    pub fn labelled_strings(label: &str, strings: &[&str]) -> DataPacket {
        let mut data = BytesMut::new();
        put_string(&mut data, label);
        for s in strings {
            put_string(&mut data, s);
        }
        DataPacket::from_buf(LABELLED_PACKET, data)
    }

    fn from_buf(packet_type: u32, data: BytesMut) -> DataPacket {
        DataPacket {
            packet_type,
            packet_id: 0,
            byte_order: ByteOrder::native(),
            size: data.len(),
            data,
        }
    }

    pub fn with_packet_id(mut self, packet_id: u32) -> DataPacket {
        self.packet_id = packet_id;
        self
    }

    pub fn with_packet_type(mut self, packet_type: u32) -> DataPacket {
        self.packet_type = packet_type;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> DataPacket {
        self.byte_order = byte_order;
        self
    }

    pub fn packet_type(&self) -> u32 {
        self.packet_type
    }

    pub fn packet_id(&self) -> u32 {
        self.packet_id
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Declared payload size.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn is_response_packet(&self) -> bool {
        is_response_type(self.packet_type)
    }

    pub fn is_labelled_packet(&self) -> bool {
        is_labelled_type(self.packet_type)
    }

    /// Copies as much of `bytes` as still fits and returns the count.
    pub fn append_data(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining());
        self.data.put_slice(&bytes[..take]);
        take
    }

    pub fn remaining(&self) -> usize {
        self.size - self.data.len()
    }

    pub fn has_received_all_data(&self) -> bool {
        self.data.len() == self.size
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset + 4)?;
        Some(self.byte_order.read_u32([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.data.get(offset..offset + 2)?;
        Some(self.byte_order.read_u16([bytes[0], bytes[1]]))
    }

    /// Reads an encoded string at `offset`, returning it with the offset just
    /// past it. The bytes-per-char field doubles as a byte order check: it is
    /// always 1, so a value of `0x01000000` means the writer used the other
    /// order.
    pub fn read_string(&self, offset: usize) -> Option<(String, usize)> {
        let raw = self.data.get(offset..offset + STRING_HEADER_SIZE)?;
        let mut order = self.byte_order;
        let bytes_per_char = order.read_u32([raw[0], raw[1], raw[2], raw[3]]);
        if bytes_per_char != 1 {
            order = order.swapped();
            if order.read_u32([raw[0], raw[1], raw[2], raw[3]]) != 1 {
                return None;
            }
        }
        let len = order.read_u32([raw[4], raw[5], raw[6], raw[7]]) as usize;
        let start = offset + STRING_HEADER_SIZE;
        let text = self.data.get(start..start.checked_add(len)?)?;
        let text = String::from_utf8_lossy(text).into_owned();
        Some((text, start + len))
    }

    /// Label at the start of a labelled packet's payload.
    pub fn label(&self) -> Option<String> {
        self.read_string(0).map(|(label, _)| label)
    }

    /// Payload bytes following the label; empty when the label is unreadable.
    pub fn data_after_label(&self) -> &[u8] {
        match self.read_string(0) {
            Some((_, end)) => &self.data[end..],
            None => &[],
        }
    }

    /// Consecutive encoded strings from `offset` to the end of the payload.
    pub fn read_strings(&self, mut offset: usize) -> Vec<String> {
        let mut strings = Vec::new();
        while offset < self.data.len() {
            match self.read_string(offset) {
                Some((s, next)) => {
                    strings.push(s);
                    offset = next;
                }
                None => break,
            }
        }
        strings
    }
}

pub fn is_response_type(packet_type: u32) -> bool {
    packet_type == RESPONSE_PACKET || packet_type == LABELLED_RESPONSE_PACKET
}

pub fn is_labelled_type(packet_type: u32) -> bool {
    packet_type == LABELLED_PACKET || packet_type == LABELLED_RESPONSE_PACKET
}

pub fn is_reserved_type(packet_type: u32) -> bool {
    packet_type >= MINIMUM_RESERVED_PACKET_ID
}
