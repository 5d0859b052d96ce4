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

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace};

use super::{SocketId, SocketNetworkSystem};
use crate::network::transport::{IoStatus, Transport};
use crate::network::{Connection, ConnectionDetails, ConnectionState};
use crate::{AppError, AppResult};

/// `ANY` binds every interface; anything else is an IP literal or a host
/// name, resolved with IPv4 preferred.
pub(crate) fn resolve_address(address: &str, port: u16) -> AppResult<SocketAddr> {
    if address.eq_ignore_ascii_case("ANY") {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let candidates: Vec<SocketAddr> = (address, port)
        .to_socket_addrs()
        .map_err(|e| AppError::AddressResolution(format!("{}: {}", address, e)))?
        .collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| AppError::AddressResolution(format!("{}: no addresses", address)))
}

pub(crate) fn socket_identifier(addr: &SocketAddr) -> String {
    format!("(Socket)direct:{}:{}", addr.ip(), addr.port())
}

/// Non-blocking TCP stream under a [`Connection`].
///
/// Every successful `open` creates a new OS socket with a new [`SocketId`];
/// `close` releases it from the poller and drops it.
pub struct TcpTransport {
    system: Weak<SocketNetworkSystem>,
    details: ConnectionDetails,
    identifier: String,
    stream: RwLock<Option<(SocketId, Arc<TcpStream>)>>,
}

impl TcpTransport {
    pub(crate) fn outgoing(system: Weak<SocketNetworkSystem>, details: ConnectionDetails) -> Self {
        TcpTransport {
            system,
            identifier: details.to_string(),
            details,
            stream: RwLock::new(None),
        }
    }

    pub(crate) fn accepted(
        system: Weak<SocketNetworkSystem>,
        id: SocketId,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Self {
        TcpTransport {
            system,
            details: ConnectionDetails::new("Socket", "direct", &peer.ip().to_string(), peer.port()),
            identifier: socket_identifier(&peer),
            stream: RwLock::new(Some((id, Arc::new(stream)))),
        }
    }

    fn current(&self) -> Option<(SocketId, Arc<TcpStream>)> {
        self.stream.read().clone()
    }

    fn would_block(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ) || e.raw_os_error() == Some(libc::ENOBUFS)
    }

    fn start_connect(&self, address: SocketAddr) -> AppResult<TcpStream> {
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        match socket.connect(&address.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                return Err(AppError::DetailedIoError(format!(
                    "connect to {} failed: {}",
                    address, e
                )))
            }
        }
        Ok(socket.into())
    }
}

impl Transport for TcpTransport {
    fn send(&self, buf: &[u8]) -> (usize, IoStatus) {
        let Some((id, stream)) = self.current() else {
            return (0, IoStatus::InternalFailure);
        };
        match (&*stream).write(buf) {
            Ok(0) if !buf.is_empty() => {
                if let Some(system) = self.system.upgrade() {
                    system.enable_write_check(id);
                }
                (0, IoStatus::Wait)
            }
            Ok(sent) => (sent, IoStatus::Success),
            Err(e) if Self::would_block(&e) => {
                trace!("{} send would block", id);
                if let Some(system) = self.system.upgrade() {
                    system.enable_write_check(id);
                }
                (0, IoStatus::Wait)
            }
            Err(e) => {
                debug!("{} ({}) send failed: {}", id, self.identifier, e);
                (0, IoStatus::Disconnect)
            }
        }
    }

    fn receive(&self, buf: &mut [u8]) -> (usize, IoStatus) {
        let Some((id, stream)) = self.current() else {
            return (0, IoStatus::InternalFailure);
        };
        match (&*stream).read(buf) {
            Ok(0) => (0, IoStatus::Disconnect),
            Ok(received) => (received, IoStatus::Success),
            Err(e) if Self::would_block(&e) => (0, IoStatus::Wait),
            Err(e) => {
                error!("{} ({}) receive failed: {}", id, self.identifier, e);
                (0, IoStatus::Disconnect)
            }
        }
    }

    fn open(&self, connection: &Arc<Connection>) -> AppResult<()> {
        let system = self.system.upgrade().ok_or_else(|| {
            AppError::IllegalStateError("socket network system is gone".to_string())
        })?;
        let port = match self.details.port() {
            Some(port) if port != 0 => port,
            _ => {
                return Err(AppError::InvalidConnectionDetails(format!(
                    "{} has no port",
                    self.details
                )))
            }
        };
        let address = resolve_address(self.details.address(), port)?;

        connection.set_state(ConnectionState::Connecting);
        let stream = match self.start_connect(address) {
            Ok(stream) => stream,
            Err(e) => {
                connection.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        info!("connecting to {}", address);

        let id = SocketId::next();
        let fd = stream.as_raw_fd();
        let stream = Arc::new(stream);
        *self.stream.write() = Some((id, stream.clone()));
        system.begin_connect(id, stream);
        if let Err(e) = system.update_socket(Some((id, fd)), connection) {
            self.stream.write().take();
            system.end_connect(id);
            connection.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    fn close(&self, connection: &Arc<Connection>) -> bool {
        let Some((id, stream)) = self.stream.write().take() else {
            return false;
        };
        connection.set_state(ConnectionState::Disconnected);
        if let Some(system) = self.system.upgrade() {
            system.end_connect(id);
            if let Err(e) = system.update_socket(None, connection) {
                debug!("{} release failed: {}", id, e);
            }
        }
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            trace!("{} shutdown: {}", id, e);
        }
        drop(stream);
        connection.dropped();
        true
    }

    fn friendly_identifier(&self) -> String {
        self.identifier.clone()
    }

    fn local_friendly_identifier(&self) -> Option<String> {
        let (_, stream) = self.current()?;
        stream.local_addr().ok().map(|addr| socket_identifier(&addr))
    }
}

/// Transport of the connection returned by `listen`. It moves no bytes;
/// closing it stops listening.
pub struct ListenerTransport {
    system: Weak<SocketNetworkSystem>,
    id: SocketId,
    local: SocketAddr,
}

impl ListenerTransport {
    pub(crate) fn new(system: Weak<SocketNetworkSystem>, id: SocketId, local: SocketAddr) -> Self {
        ListenerTransport { system, id, local }
    }
}

impl Transport for ListenerTransport {
    fn send(&self, _buf: &[u8]) -> (usize, IoStatus) {
        (0, IoStatus::InternalFailure)
    }

    fn receive(&self, _buf: &mut [u8]) -> (usize, IoStatus) {
        (0, IoStatus::Wait)
    }

    fn open(&self, _connection: &Arc<Connection>) -> AppResult<()> {
        Err(AppError::InvalidOperation(format!(
            "{} is listening and cannot connect",
            self.friendly_identifier()
        )))
    }

    fn close(&self, connection: &Arc<Connection>) -> bool {
        match self.system.upgrade() {
            Some(system) => system.stop_listening_socket(self.id, connection),
            None => false,
        }
    }

    fn friendly_identifier(&self) -> String {
        socket_identifier(&self.local)
    }

    fn local_friendly_identifier(&self) -> Option<String> {
        Some(socket_identifier(&self.local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_any() {
        let addr = resolve_address("ANY", 9090).unwrap();
        assert_eq!(addr, "0.0.0.0:9090".parse().unwrap());
    }

    #[test]
    fn test_resolve_literal_and_host() {
        assert_eq!(
            resolve_address("127.0.0.1", 1).unwrap(),
            "127.0.0.1:1".parse().unwrap()
        );
        let local = resolve_address("localhost", 2).unwrap();
        assert!(local.ip().is_loopback());
        assert_eq!(local.port(), 2);
    }

    #[test]
    fn test_identifier_round_trips_through_details() {
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        let details = ConnectionDetails::parse(&socket_identifier(&addr)).unwrap();
        assert_eq!(details.system(), Some("Socket"));
        assert_eq!(details.address(), "10.1.2.3");
        assert_eq!(details.port(), Some(4567));
    }
}
