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

//! The first packet each side sends: `<version>:<little|big>`.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use super::Connection;
use crate::network::packet::{ByteOrder, DataPacket, REMOTE_DETAILS};
use crate::{AppError, AppResult};

pub const PROTOCOL_VERSION: &str = "1.0";

/// Handshake text describing this host.
pub fn host_details() -> String {
    format!("{}:{}", PROTOCOL_VERSION, ByteOrder::native().as_str())
}

/// Returns the byte order a peer announced, or `MalformedProtocol` when the
/// text is not `1.0:little` or `1.0:big`.
pub fn parse_remote_details(details: &str) -> AppResult<ByteOrder> {
    let parts: Vec<&str> = details.split(':').collect();
    if parts.len() < 2 {
        return Err(AppError::MalformedProtocol(format!(
            "remote details '{}' has no byte order",
            details
        )));
    }
    if parts[0] != PROTOCOL_VERSION {
        return Err(AppError::MalformedProtocol(format!(
            "remote protocol version {} does not match {}",
            parts[0], PROTOCOL_VERSION
        )));
    }
    ByteOrder::parse(parts[1]).ok_or_else(|| {
        AppError::MalformedProtocol(format!("unknown byte order '{}'", parts[1]))
    })
}

impl Connection {
    pub(super) fn send_host_details(&self) {
        self.send_data_packet(
            DataPacket::message(REMOTE_DETAILS, &host_details()),
            None,
            true,
            false,
            false,
        );
    }

    pub(super) fn on_remote_details(&self, packet: &DataPacket) {
        let parsed = packet
            .read_string(0)
            .ok_or_else(|| AppError::MalformedProtocol("unreadable remote details".to_string()))
            .and_then(|(details, _)| parse_remote_details(&details));
        match parsed {
            Ok(order) => {
                debug!(
                    "connection {} peer announced {} byte order",
                    self.id,
                    order.as_str()
                );
                self.remote_big_endian
                    .store(order.is_big(), Ordering::Release);
                self.remote_details_received.store(true, Ordering::Release);
            }
            Err(e) => {
                warn!(
                    "connection {} ({}) rejected handshake: {}",
                    self.id,
                    self.friendly_identifier(),
                    e
                );
                self.disconnect();
            }
        }
    }
}
