// Modem Manager Core - Events
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Events reported by backends and delivered by the core.

use std::sync::Arc;

use crossbeam_channel::Sender;

use super::device::{Capability, Device, NetworkMode, RegistrationStatus, ScannedNetwork, TrafficSnapshot};
use super::worker::Waker;
use crate::netlink::ConnectionChange;

/// Change reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    DeviceAdded(Device),
    DeviceRemoved(u32),
    DeviceEnabledStatus(bool),
    DeviceBlockedStatus(bool),
    DevicePreparedStatus(bool),
    DeviceConnectionStatus(bool),
    SmsListReady,
    /// Message with the given backend index is complete.
    SmsCompleted(u32),
    SmsSent(bool),
    UssdResult(Option<String>),
    ScanResult(Option<Vec<ScannedNetwork>>),
    SignalLevelChange(u32),
    NetworkModeChange(NetworkMode),
    NetworkRegistrationChange {
        status: RegistrationStatus,
        operator_code: u32,
        operator_name: String,
    },
    LocationChange {
        location_3gpp: [u32; 4],
        location_gps: [f32; 4],
    },
    ModemEnableResult(bool),
    ModemUnlockResult(bool),
    ModemConnectionResult(bool),
    /// A capability became available after the device was opened.
    ExtendCapabilities(Capability),
}

/// Observable transition delivered to the event callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Backend(BackendEvent),
    DeviceOpened(u32),
    DeviceClosing(u32),
    /// Traffic of the connected device, `None` when disconnected.
    NetStatus(Option<TrafficSnapshot>),
    TrafficLimit(String),
    TimeLimit(String),
    UpdateConnectionsList(Vec<ConnectionChange>),
    SmsNewDay,
    ServiceActivationStarted,
    ServiceChanged(String),
    ServiceActivated(String),
    ServiceError { module: String, message: String },
    ServiceActivationFinished,
    ServiceAuthError,
    ServiceOtherError(String),
    /// Startup could not complete after activation.
    StartupError(String),
}

/// External event callback.
pub type EventCallback = Arc<dyn Fn(CoreEvent) + Send + Sync>;

/// Handle backends use to report events to the worker.
#[derive(Clone)]
pub struct EventSink {
    sender: Sender<BackendEvent>,
    waker: Arc<Waker>,
}

impl EventSink {
    pub(crate) fn new(sender: Sender<BackendEvent>, waker: Arc<Waker>) -> Self {
        Self { sender, waker }
    }

    /// Queue `event` and wake the worker.
    pub fn emit(&self, event: BackendEvent) {
        if self.sender.send(event).is_ok() {
            self.waker.wake();
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}
