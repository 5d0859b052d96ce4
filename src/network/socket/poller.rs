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

//! One `poll(2)` loop over a bounded set of sockets.
//!
//! Other threads never touch the `pollfd` array. They record add, remove and
//! write interest changes in pending sets and wake the loop, which applies
//! them between two polls. A loop whose set becomes empty stops.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use super::SocketNetworkSystem;
use crate::AppResult;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one OS socket for as long as it is registered.
///
/// Descriptors are reused by the kernel as soon as they are closed; ids are
/// not, so a late readiness event for a closed socket can never reach the
/// connection that now owns the same descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> SocketId {
        SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLPRI;
const ALL_EVENTS: libc::c_short = READ_EVENTS | libc::POLLOUT | libc::POLLNVAL;

#[derive(Default)]
struct PendingChanges {
    /// sockets counted against the capacity, pending or applied
    members: HashSet<SocketId>,
    add: HashMap<SocketId, RawFd>,
    remove: HashSet<SocketId>,
    enable_write: HashSet<SocketId>,
    disable_write: HashSet<SocketId>,
}

/// The `pollfd` array and the id at each index, owned by the poll loop.
/// Index 0 is the waker.
struct PollSet {
    fds: Vec<libc::pollfd>,
    ids: Vec<Option<SocketId>>,
    index: HashMap<SocketId, usize>,
}

impl PollSet {
    fn new(waker: RawFd) -> Self {
        PollSet {
            fds: vec![libc::pollfd {
                fd: waker,
                events: libc::POLLIN,
                revents: 0,
            }],
            ids: vec![None],
            index: HashMap::new(),
        }
    }

    fn socket_count(&self) -> usize {
        self.index.len()
    }

    fn add(&mut self, id: SocketId, fd: RawFd) {
        if self.index.contains_key(&id) {
            error!("{} added to a poller twice", id);
            return;
        }
        self.fds.push(libc::pollfd {
            fd,
            events: ALL_EVENTS,
            revents: 0,
        });
        self.ids.push(Some(id));
        self.index.insert(id, self.fds.len() - 1);
    }

    /// Swaps the entry with the last one and rebuilds the index.
    fn remove(&mut self, id: SocketId) {
        let Some(position) = self.index.get(&id).copied() else {
            error!("{} removed from a poller it is not part of", id);
            return;
        };
        self.fds.swap_remove(position);
        self.ids.swap_remove(position);
        self.index = self
            .ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| id.map(|id| (id, i)))
            .collect();
    }

    fn set_write_interest(&mut self, id: SocketId, enabled: bool) {
        let Some(position) = self.index.get(&id).copied() else {
            error!("write interest change for unknown {}", id);
            return;
        };
        let pfd = &mut self.fds[position];
        if enabled {
            pfd.events |= libc::POLLOUT;
        } else {
            pfd.events &= !libc::POLLOUT;
        }
    }
}

pub(crate) struct SocketThreadTask {
    capacity: usize,
    poll_timeout: Duration,
    pending: Mutex<PendingChanges>,
    update_required: AtomicBool,
    stopping: AtomicBool,
    waker_rx: UnixStream,
    waker_tx: UnixStream,
}

impl SocketThreadTask {
    pub(crate) fn new(capacity: usize, poll_timeout: Duration) -> AppResult<SocketThreadTask> {
        let (waker_tx, waker_rx) = UnixStream::pair()?;
        waker_tx.set_nonblocking(true)?;
        waker_rx.set_nonblocking(true)?;
        Ok(SocketThreadTask {
            capacity: capacity.max(1),
            poll_timeout,
            pending: Mutex::new(PendingChanges::default()),
            update_required: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            waker_rx,
            waker_tx,
        })
    }

    pub(crate) fn has_capacity(&self) -> bool {
        !self.is_stopping() && self.socket_count() < self.capacity
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.pending.lock().members.len()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// False when the task is full, stopping, or already has the socket.
    pub(crate) fn add_socket(&self, id: SocketId, fd: RawFd) -> bool {
        {
            let mut pending = self.pending.lock();
            if self.is_stopping() || pending.members.len() >= self.capacity {
                return false;
            }
            if !pending.members.insert(id) {
                error!("{} already added", id);
                return false;
            }
            pending.add.insert(id, fd);
            pending.remove.remove(&id);
        }
        self.request_update();
        true
    }

    pub(crate) fn remove_socket(&self, id: SocketId) -> bool {
        {
            let mut pending = self.pending.lock();
            if !pending.members.remove(&id) {
                trace!("{} already marked for removal", id);
                return false;
            }
            // never applied, nothing to take out of the poll set
            if pending.add.remove(&id).is_none() {
                pending.remove.insert(id);
            }
            pending.enable_write.remove(&id);
            pending.disable_write.remove(&id);
        }
        self.request_update();
        true
    }

    pub(crate) fn enable_write_check(&self, id: SocketId) {
        self.change_write_interest(id, true);
    }

    pub(crate) fn disable_write_check(&self, id: SocketId) {
        self.change_write_interest(id, false);
    }

    fn change_write_interest(&self, id: SocketId, enabled: bool) {
        {
            let mut pending = self.pending.lock();
            if !pending.members.contains(&id) {
                trace!("write check change on {} which is not part of this poller", id);
                return;
            }
            let set = if enabled {
                &mut pending.enable_write
            } else {
                &mut pending.disable_write
            };
            if !set.insert(id) {
                return;
            }
        }
        self.request_update();
    }

    /// Asks the loop to exit at its next wake up.
    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wake();
    }

    fn request_update(&self) {
        self.update_required.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        match (&self.waker_tx).write(&[1]) {
            Ok(_) => {}
            // a wake up is already pending
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("failed to wake poller: {}", e),
        }
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.waker_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Applies pending changes; removals first, then write interest, then
    /// additions. Returns false once the set is empty and the loop should
    /// stop.
    fn apply_pending(&self, poll_set: &mut PollSet) -> bool {
        let update_required = self.update_required.swap(false, Ordering::AcqRel);
        if !update_required && poll_set.socket_count() > 0 {
            return true;
        }
        let mut pending = self.pending.lock();
        for id in std::mem::take(&mut pending.remove) {
            poll_set.remove(id);
        }
        for id in std::mem::take(&mut pending.disable_write) {
            poll_set.set_write_interest(id, false);
        }
        for id in std::mem::take(&mut pending.enable_write) {
            poll_set.set_write_interest(id, true);
        }
        for (id, fd) in std::mem::take(&mut pending.add) {
            poll_set.add(id, fd);
        }
        if poll_set.socket_count() == 0 && pending.members.is_empty() {
            // under the pending lock, so no add can slip in after this
            self.stopping.store(true, Ordering::Release);
            return false;
        }
        true
    }

    /// Poll loop body, run on the task's own thread until the set becomes
    /// empty, the task is stopped, or the system goes away.
    pub(crate) fn run(&self, system: &Weak<SocketNetworkSystem>) {
        let mut poll_set = PollSet::new(self.waker_rx.as_raw_fd());
        let timeout_ms = self.poll_timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        while !self.is_stopping() {
            if !self.apply_pending(&mut poll_set) {
                break;
            }

            // SAFETY: the pointer and length describe `poll_set.fds`, which
            // stays untouched for the duration of the call.
            let ready = unsafe {
                libc::poll(
                    poll_set.fds.as_mut_ptr(),
                    poll_set.fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if ready < 0 {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("poll failed over {} descriptors: {}", poll_set.fds.len(), e);
                }
                continue;
            }

            let Some(system) = system.upgrade() else {
                break;
            };

            if poll_set.fds[0].revents != 0 {
                self.drain_waker();
            }
            let events: Vec<(SocketId, libc::c_short)> = poll_set
                .fds
                .iter()
                .zip(&poll_set.ids)
                .filter_map(|(pfd, id)| id.map(|id| (id, pfd.revents)))
                .collect();

            for (id, revents) in events {
                if revents & libc::POLLNVAL != 0 {
                    system.except_notify(id);
                    if !system.remove_socket(id) {
                        self.remove_socket(id);
                    }
                } else {
                    if revents & READ_EVENTS != 0 {
                        system.read_notify(id);
                    }
                    if revents & libc::POLLOUT != 0 {
                        // level triggered, re-enabled when a send has to wait
                        self.disable_write_check(id);
                        system.write_notify(id);
                    }
                }
                system.check_for_timeout(id);
            }
        }
        self.stopping.store(true, Ordering::Release);
        info!("poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(capacity: usize) -> SocketThreadTask {
        SocketThreadTask::new(capacity, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_capacity_is_enforced() {
        let task = task(2);
        assert!(task.add_socket(SocketId::next(), 10));
        let second = SocketId::next();
        assert!(task.add_socket(second, 11));
        assert!(!task.has_capacity());
        assert!(!task.add_socket(SocketId::next(), 12));

        assert!(task.remove_socket(second));
        assert!(!task.remove_socket(second));
        assert!(task.has_capacity());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let task = task(4);
        let id = SocketId::next();
        assert!(task.add_socket(id, 10));
        assert!(!task.add_socket(id, 10));
        assert_eq!(task.socket_count(), 1);
    }

    #[test]
    fn test_pending_changes_applied_once() {
        let task = task(4);
        let (a, b, c) = (SocketId::next(), SocketId::next(), SocketId::next());
        task.add_socket(a, 10);
        task.add_socket(b, 11);
        task.add_socket(c, 12);

        let mut poll_set = PollSet::new(3);
        assert!(task.apply_pending(&mut poll_set));
        assert_eq!(poll_set.socket_count(), 3);

        task.disable_write_check(b);
        task.remove_socket(a);
        assert!(task.apply_pending(&mut poll_set));
        assert_eq!(poll_set.socket_count(), 2);
        assert_eq!(poll_set.fds.len(), 3);
        for (id, position) in &poll_set.index {
            assert_eq!(poll_set.ids[*position], Some(*id));
        }
        let b_events = poll_set.fds[poll_set.index[&b]].events;
        assert_eq!(b_events & libc::POLLOUT, 0);

        task.enable_write_check(b);
        task.apply_pending(&mut poll_set);
        assert_ne!(poll_set.fds[poll_set.index[&b]].events & libc::POLLOUT, 0);
        // waker stays in front
        assert_eq!(poll_set.fds[0].fd, 3);
    }

    #[test]
    fn test_empty_set_stops() {
        let task = task(4);
        let id = SocketId::next();
        task.add_socket(id, 10);
        let mut poll_set = PollSet::new(3);
        assert!(task.apply_pending(&mut poll_set));
        task.remove_socket(id);
        assert!(!task.apply_pending(&mut poll_set));
        assert!(task.is_stopping());
        assert!(!task.add_socket(SocketId::next(), 11));
    }

    #[test]
    fn test_remove_before_apply_never_polled() {
        let task = task(4);
        let id = SocketId::next();
        task.add_socket(id, 10);
        task.remove_socket(id);
        let mut poll_set = PollSet::new(3);
        assert!(!task.apply_pending(&mut poll_set));
        assert_eq!(poll_set.socket_count(), 0);
    }
}
