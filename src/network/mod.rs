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

//! Framed connection layer.
//!
//! # Architecture
//!
//! - [`Connection`]: one peer endpoint, queues outbound packets, reassembles
//!   inbound frames and dispatches them to registered callbacks
//! - [`Transport`]: the byte level below a connection, [`TcpTransport`] for
//!   TCP streams
//! - [`SocketNetworkSystem`]: owns the sockets and spreads them over poller
//!   threads, routing readiness back to connections
//! - [`NetworkManager`]: queues connection events for the application
//!   thread, fires reconnect timers and keeps throughput figures
//!
//! # Wire format
//!
//! Every frame is a 12 byte header of three `u32` (type, id, payload length)
//! in the sender's byte order followed by the payload. Each side opens with a
//! `REMOTE_DETAILS` packet announcing its byte order.

pub use connection::{
    host_details, parse_remote_details, BacklogCallback, ConnectCallback, Connection,
    ConnectionId, ConnectionOptions, ConnectionState, DisconnectCallback, LabelledPacketCallback,
    PacketCallback, ResponseCallback, PROTOCOL_VERSION,
};
pub use details::ConnectionDetails;
pub use manager::{ConnectionOwner, IncomingConnectionListener, NetworkManager, NetworkSystem};
pub use packet::{
    is_labelled_type, is_reserved_type, is_response_type, ByteOrder, DataPacket,
    DataPacketHeader, HEADER_SIZE, LABELLED_PACKET, LABELLED_RESPONSE_PACKET,
    MINIMUM_RESERVED_PACKET_ID, REMOTE_DETAILS, RESPONSE_PACKET,
};
pub use socket::{ListenerTransport, SocketId, SocketNetworkSystem, TcpTransport};
pub use transport::{IoStatus, Transport};

mod connection;
mod details;
mod manager;
mod packet;
mod socket;
mod transport;
