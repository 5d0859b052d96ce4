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

use std::sync::Arc;

use crate::network::Connection;
use crate::AppResult;

/// Outcome of a single non-blocking I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// nothing could be transferred; retry once readiness is signalled
    Wait,
    Success,
    /// fatal for this connection
    Disconnect,
    /// the last queued packet asked for a graceful close
    DisconnectRequested,
    /// local precondition not met, the send lock was busy or the
    /// connection is not sendable
    InternalFailure,
}

/// Raw byte mover under a [`Connection`].
///
/// `send` and `receive` never block. A transport that returns `Wait` from
/// `send` is responsible for asking its multiplexer for a write readiness
/// notification.
pub trait Transport: Send + Sync {
    fn send(&self, buf: &[u8]) -> (usize, IoStatus);

    /// `(0, Disconnect)` on orderly close by the peer.
    fn receive(&self, buf: &mut [u8]) -> (usize, IoStatus);

    /// Starts connecting. The connection is `Connecting` on success.
    fn open(&self, connection: &Arc<Connection>) -> AppResult<()>;

    /// Tears the transport down and runs the connection's drop handling.
    /// Returns false when there was nothing to close.
    fn close(&self, connection: &Arc<Connection>) -> bool;

    fn friendly_identifier(&self) -> String;

    /// Known once the local end is bound.
    fn local_friendly_identifier(&self) -> Option<String>;
}
