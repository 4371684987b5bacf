// Modem Manager Core - Netlink
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Kernel netlink monitoring of interfaces and TCP connections.

mod monitor;
mod process;
pub mod wire;

pub use monitor::{
    classify_link, socket_state_name, terminate_application, ConnectionChange, ConnectionTable,
    InterfaceEvent, LinkEventFlags, NetlinkConnection, NetlinkMonitor, INTERNAL_SEQUENCE,
};
pub use process::{ProcessInfo, ProcessResolver, ProcfsResolver};
