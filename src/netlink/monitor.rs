// Modem Manager Core - Netlink Monitor
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Link notifications and TCP connection tracking over two netlink sockets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::process::{ProcessResolver, ProcfsResolver};
use super::wire::{self, NlMessage};

/// Sequence number tagging statistics requests sent by the monitor.
pub const INTERNAL_SEQUENCE: u32 = 100000;

const RECEIVE_BUFFER: usize = 4096;

bitmask! {
    /// What a link message reported.
    pub struct LinkEventFlags: u8 {
        const ADD = 1 << 0;
        const REMOVE = 1 << 1;
        const STATS = 1 << 2;
    }
}

/// Decoded link notification or statistics reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEvent {
    pub name: String,
    pub flags: LinkEventFlags,
    pub up: bool,
    pub running: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Classify one routing message. Other message kinds yield `None`.
pub fn classify_link(message: &NlMessage<'_>, index_name: impl Fn(u32) -> Option<String>) -> Option<InterfaceEvent> {
    if !matches!(message.kind, wire::RTM_NEWLINK | wire::RTM_DELLINK | wire::RTM_GETLINK) {
        return None;
    }
    let record = wire::parse_link(message.payload)?;

    let mut flags = if message.seq == INTERNAL_SEQUENCE {
        LinkEventFlags::STATS
    } else {
        match message.kind {
            wire::RTM_NEWLINK => LinkEventFlags::ADD,
            wire::RTM_DELLINK => LinkEventFlags::REMOVE,
            _ => LinkEventFlags::STATS,
        }
    };

    let (rx_bytes, tx_bytes) = match record.counters() {
        Some(counters) => {
            flags |= LinkEventFlags::STATS;
            counters
        }
        None => (0, 0),
    };

    let name = record
        .name
        .clone()
        .or_else(|| index_name(record.index))
        .unwrap_or_default();

    Some(InterfaceEvent {
        name,
        flags,
        up: record.flags & wire::IFF_UP != 0,
        running: record.flags & wire::IFF_RUNNING != 0,
        rx_bytes,
        tx_bytes,
    })
}

/// TCP connection owned by a local process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkConnection {
    pub inode: u64,
    pub family: u8,
    /// Source as `address:port`.
    pub src_addr: String,
    /// Destination as `address:port`.
    pub dst_addr: String,
    pub src_port: u16,
    pub state: u8,
    pub queue_depth: u32,
    pub uid: u32,
    pub pid: u32,
    pub app_name: String,
    pub dst_hostname: String,
    /// Unix time of the last dump that listed the connection.
    pub update_time: i64,
}

/// Delta of the connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    Added(NetlinkConnection),
    Modified { inode: u64, state: u8, queue_depth: u32 },
    Removed { inode: u64 },
}

/// Connection table fed with socket diagnostic dumps.
///
/// Dumps are answered in request order; each `NLMSG_DONE` closes the oldest
/// outstanding dump and removes connections of its family that it did not
/// list.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<u64, NetlinkConnection>,
    changes: Option<VecDeque<ConnectionChange>>,
    touched: HashSet<u64>,
    pending_dumps: VecDeque<u8>,
    owner_uid: u32,
}

impl ConnectionTable {
    pub fn new(owner_uid: u32) -> Self {
        Self {
            owner_uid,
            ..Self::default()
        }
    }

    /// Note that a dump for `family` was requested.
    pub fn expect_dump(&mut self, family: u8) {
        self.pending_dumps.push_back(family);
    }

    /// Apply one received buffer. Returns whether the table changed.
    pub fn read_connections(&mut self, buf: &[u8], now: i64, resolver: &mut dyn ProcessResolver) -> bool {
        let mut changed = false;
        for message in wire::messages(buf) {
            match message.kind {
                wire::NLMSG_DONE => {
                    changed |= self.finish_dump();
                }
                wire::NLMSG_ERROR => {
                    if let Some(code) = wire::error_code(message.payload).filter(|c| *c != 0) {
                        debug!("Connection dump failed: {}", io::Error::from_raw_os_error(-code));
                    }
                    if let Some(family) = self.pending_dumps.pop_front() {
                        self.forget_touched(family);
                    }
                }
                wire::SOCK_DIAG_BY_FAMILY => {
                    if let Some(record) = wire::parse_diag(message.payload) {
                        changed |= self.apply_record(record, now, resolver);
                    }
                }
                _ => {}
            }
        }
        changed
    }

    fn apply_record(&mut self, record: wire::DiagRecord, now: i64, resolver: &mut dyn ProcessResolver) -> bool {
        if record.uid != self.owner_uid && self.owner_uid != 0 {
            return false;
        }
        self.touched.insert(record.inode);

        if let Some(existing) = self.connections.get_mut(&record.inode) {
            existing.update_time = now;
            if existing.queue_depth != record.queue_depth || existing.state != record.state {
                existing.queue_depth = record.queue_depth;
                existing.state = record.state;
                let change = ConnectionChange::Modified {
                    inode: record.inode,
                    state: record.state,
                    queue_depth: record.queue_depth,
                };
                self.push_change(change);
                return true;
            }
            return false;
        }

        // Unresolved owners are retried on the next dump.
        let Some(process) = resolver.resolve(record.inode) else {
            return false;
        };

        let dst_addr = format!("{}:{}", record.dst, record.dst_port);
        let connection = NetlinkConnection {
            inode: record.inode,
            family: record.family,
            src_addr: format!("{}:{}", record.src, record.src_port),
            dst_hostname: dst_addr.clone(),
            dst_addr,
            src_port: record.src_port,
            state: record.state,
            queue_depth: record.queue_depth,
            uid: record.uid,
            pid: process.pid,
            app_name: process.name,
            update_time: now,
        };
        self.push_change(ConnectionChange::Added(connection.clone()));
        self.connections.insert(record.inode, connection);
        true
    }

    fn finish_dump(&mut self) -> bool {
        let Some(family) = self.pending_dumps.pop_front() else {
            return false;
        };

        let stale: Vec<u64> = self
            .connections
            .values()
            .filter(|c| c.family == family && !self.touched.contains(&c.inode))
            .map(|c| c.inode)
            .collect();

        for inode in &stale {
            self.connections.remove(inode);
            self.push_change(ConnectionChange::Removed { inode: *inode });
        }

        self.forget_touched(family);
        !stale.is_empty()
    }

    /// Drop the marks a dump of `family` left behind.
    fn forget_touched(&mut self, family: u8) {
        let connections = &self.connections;
        self.touched
            .retain(|inode| connections.get(inode).map(|c| c.family != family).unwrap_or(false));
    }

    fn push_change(&mut self, change: ConnectionChange) {
        if let Some(queue) = self.changes.as_mut() {
            queue.push_back(change);
        }
    }

    /// Copy of the table. Starts recording changes from now on.
    pub fn open_list(&mut self) -> Vec<NetlinkConnection> {
        if self.changes.is_none() {
            self.changes = Some(VecDeque::new());
        }
        let mut list: Vec<NetlinkConnection> = self.connections.values().cloned().collect();
        list.sort_by_key(|c| c.inode);
        list
    }

    /// Stop recording changes and drop the undelivered ones.
    pub fn close_list(&mut self) {
        self.changes = None;
    }

    pub fn drain_changes(&mut self) -> Vec<ConnectionChange> {
        self.changes
            .as_mut()
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, inode: u64) -> Option<&NetlinkConnection> {
        self.connections.get(&inode)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

struct ConnectionState {
    table: ConnectionTable,
    resolver: Box<dyn ProcessResolver>,
    buffer: Vec<u8>,
}

/// Owner of the diagnostic and routing sockets.
pub struct NetlinkMonitor {
    conn_socket: Option<OwnedFd>,
    link_socket: Option<OwnedFd>,
    conn: Mutex<ConnectionState>,
    link_buffer: Mutex<Vec<u8>>,
    seq: AtomicU32,
    uid: u32,
}

impl NetlinkMonitor {
    /// Open both sockets. A socket that cannot be opened stays unavailable.
    pub fn open() -> Self {
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };

        let conn_socket = open_socket(libc::NETLINK_SOCK_DIAG, 0)
            .map_err(|e| warn!("Failed to open socket diagnostics: {}", e))
            .ok();
        let link_socket = open_socket(libc::NETLINK_ROUTE, libc::RTMGRP_LINK as u32)
            .map_err(|e| warn!("Failed to open routing socket: {}", e))
            .ok();

        info!(
            "Netlink monitor opened (connections: {}, interfaces: {})",
            conn_socket.is_some(),
            link_socket.is_some()
        );

        Self::with_parts(conn_socket, link_socket, uid, Box::new(ProcfsResolver::new(uid)))
    }

    fn with_parts(
        conn_socket: Option<OwnedFd>,
        link_socket: Option<OwnedFd>,
        uid: u32,
        resolver: Box<dyn ProcessResolver>,
    ) -> Self {
        Self {
            conn_socket,
            link_socket,
            conn: Mutex::new(ConnectionState {
                table: ConnectionTable::new(uid),
                resolver,
                buffer: vec![0; RECEIVE_BUFFER],
            }),
            link_buffer: Mutex::new(vec![0; RECEIVE_BUFFER]),
            seq: AtomicU32::new(1),
            uid,
        }
    }

    pub fn connection_fd(&self) -> Option<RawFd> {
        self.conn_socket.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn interface_fd(&self) -> Option<RawFd> {
        self.link_socket.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Ask for every TCP socket of `family` (`AF_INET` or `AF_INET6`).
    pub fn request_connections(&self, family: i32) -> bool {
        let Some(fd) = self.connection_fd() else {
            return false;
        };
        if family != libc::AF_INET && family != libc::AF_INET6 {
            return false;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = wire::encode_connections_request(family as u8, seq);
        match send(fd, &request) {
            Ok(()) => {
                let mut state = self.conn.lock();
                state.resolver.refresh();
                state.table.expect_dump(family as u8);
                true
            }
            Err(e) => {
                debug!("Failed to request connections: {}", e);
                false
            }
        }
    }

    /// Drain the diagnostic socket into the table. Returns whether it changed.
    pub fn read_connections(&self) -> bool {
        let Some(fd) = self.connection_fd() else {
            return false;
        };

        let now = chrono::Utc::now().timestamp();
        let mut guard = self.conn.lock();
        let state = &mut *guard;
        let mut changed = false;
        loop {
            match receive(fd, &mut state.buffer) {
                Ok(Some(len)) => {
                    changed |= state
                        .table
                        .read_connections(&state.buffer[..len], now, state.resolver.as_mut());
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Failed to read connections: {}", e);
                    break;
                }
            }
        }
        changed
    }

    /// Ask for the counters of interface `name`.
    pub fn request_interface_statistics(&self, name: &str) -> bool {
        let Some(fd) = self.interface_fd() else {
            return false;
        };
        let Some(index) = interface_index(name) else {
            return false;
        };

        let request = wire::encode_link_request(index, INTERNAL_SEQUENCE);
        match send(fd, &request) {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to request statistics of {}: {}", name, e);
                false
            }
        }
    }

    /// Drain the routing socket.
    pub fn read_interface_events(&self) -> Vec<InterfaceEvent> {
        let Some(fd) = self.interface_fd() else {
            return Vec::new();
        };

        let mut buffer = self.link_buffer.lock();
        let mut events = Vec::new();
        loop {
            match receive(fd, &mut buffer) {
                Ok(Some(len)) => {
                    events.extend(
                        wire::messages(&buffer[..len]).filter_map(|m| classify_link(&m, interface_name)),
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Failed to read interface events: {}", e);
                    break;
                }
            }
        }
        events
    }

    /// Snapshot of the connection table for an interactive consumer.
    pub fn open_connection_list(&self) -> Vec<NetlinkConnection> {
        self.conn.lock().table.open_list()
    }

    pub fn close_connection_list(&self) {
        self.conn.lock().table.close_list();
    }

    /// Changes recorded since the last call.
    pub fn connection_changes(&self) -> Vec<ConnectionChange> {
        self.conn.lock().table.drain_changes()
    }
}

/// Human readable TCP state.
pub fn socket_state_name(state: u8) -> &'static str {
    match state {
        1 => "Established",
        2 => "SYN sent",
        3 => "SYN recv",
        4 | 5 => "FIN wait",
        6 => "Time wait",
        7 => "Close",
        8 => "Close wait",
        9 => "Last ACK",
        10 => "Listen",
        11 => "Closing",
        _ => "Unknown",
    }
}

/// Ask process `pid` to terminate.
pub fn terminate_application(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill only takes plain integers.
    unsafe { libc::kill(pid, 0) == 0 && libc::kill(pid, libc::SIGTERM) == 0 }
}

fn open_socket(protocol: libc::c_int, groups: u32) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall; the descriptor is owned right after the check.
    let raw = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            protocol,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a fresh descriptor nobody else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: sockaddr_nl is plain data; all-zero is a valid value.
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = groups;
    // SAFETY: addr outlives the call and the length matches its type.
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn send(fd: RawFd, data: &[u8]) -> io::Result<()> {
    // SAFETY: the buffer is valid for `data.len()` bytes.
    let rc = unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), 0) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Receive one datagram, growing `buf` when it would be truncated.
/// `Ok(None)` means nothing is queued.
fn receive(fd: RawFd, buf: &mut Vec<u8>) -> io::Result<Option<usize>> {
    // SAFETY: the buffer is valid for `buf.len()` bytes.
    let peeked = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_PEEK | libc::MSG_TRUNC | libc::MSG_DONTWAIT,
        )
    };
    if peeked < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock { Ok(None) } else { Err(err) };
    }
    if peeked as usize > buf.len() {
        buf.resize(peeked as usize, 0);
    }

    // SAFETY: as above.
    let received = unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_DONTWAIT)
    };
    if received < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock { Ok(None) } else { Err(err) };
    }
    Ok(Some(received as usize))
}

fn interface_index(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;
    // SAFETY: `name` is a valid C string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    (index != 0).then_some(index)
}

fn interface_name(index: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: the buffer holds IF_NAMESIZE bytes as required.
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: on success the buffer holds a NUL terminated name.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}
