// Modem Manager Core - Worker
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Background thread following interfaces, connections and the open device.
//!
//! All device state lives in [`CoreState`] behind one mutex. The worker holds
//! it for the device part of every tick. Events raised while it is held are
//! queued and handed to the callback once it is released.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::{ConnectionBackend, ConnectionCaps, ConnectionStatus, DeviceBackend, DeviceOperations};
use super::device::{Capability, Device, DeviceOperation, RegistrationStatus};
use super::events::{BackendEvent, CoreEvent, EventCallback};
use crate::config::{DeviceSettings, LimitAction, TimeLimit, TrafficLimit};
use crate::netlink::{InterfaceEvent, LinkEventFlags, NetlinkMonitor};
use crate::storage::{MessageStore, TrafficStore};

/// Longest wait of one tick.
const POLL_TIMEOUT_MS: libc::c_int = 1000;

/// Connection status is polled for this long after a refresh request.
const STATUS_REFRESH_WINDOW_SECS: i64 = 15;

/// Wakes the worker out of its poll.
#[derive(Debug)]
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: the buffer is a valid u64 for the duration of the call.
        let written = unsafe {
            libc::write(self.fd.as_raw_fd(), &one as *const u64 as *const libc::c_void, 8)
        };
        if written != 8 {
            debug!("Failed to wake worker: {}", io::Error::last_os_error());
        }
    }

    /// Reset the counter. Returns whether a wake-up was pending.
    pub fn drain(&self) -> bool {
        let mut value: u64 = 0;
        // SAFETY: the buffer is a valid u64 for the duration of the call.
        let read = unsafe {
            libc::read(self.fd.as_raw_fd(), &mut value as *mut u64 as *mut libc::c_void, 8)
        };
        read == 8 && value > 0
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Commands sent to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Stop,
    /// Poll the connection status for a while.
    Refresh,
}

/// State shared between the worker and the owning thread.
pub(crate) struct CoreState {
    pub device_backend: Option<Box<dyn DeviceBackend>>,
    pub conn_backend: Option<Box<dyn ConnectionBackend>>,
    pub conn_caps: ConnectionCaps,
    pub devices: Vec<Device>,
    pub device: Option<Device>,
    pub message_store: Option<Box<dyn MessageStore>>,
    pub traffic_store: Option<Box<dyn TrafficStore>>,
    pub settings: Option<DeviceSettings>,
    pub settings_dir: PathBuf,
    pub traffic_limit: TrafficLimit,
    pub time_limit: TimeLimit,
    traffic_limit_fired: bool,
    time_limit_fired: bool,
    status_refresh_since: Option<i64>,
    new_day: i64,
    pending: Vec<CoreEvent>,
}

impl CoreState {
    pub fn new(settings_dir: PathBuf, traffic_limit: TrafficLimit, time_limit: TimeLimit) -> Self {
        Self {
            device_backend: None,
            conn_backend: None,
            conn_caps: ConnectionCaps::EMPTY,
            devices: Vec::new(),
            device: None,
            message_store: None,
            traffic_store: None,
            settings: None,
            settings_dir,
            traffic_limit,
            time_limit,
            traffic_limit_fired: false,
            time_limit_fired: false,
            status_refresh_since: None,
            new_day: next_day_boundary(Local::now()),
            pending: Vec::new(),
        }
    }

    /// Queue `event` for delivery after the lock is released.
    pub fn push(&mut self, event: CoreEvent) {
        self.pending.push(event);
    }

    pub fn device_ops(&self) -> DeviceOperations {
        self.device_backend
            .as_ref()
            .map(|b| b.operations())
            .unwrap_or(DeviceOperations::EMPTY)
    }

    pub fn monitored(&self) -> bool {
        self.conn_caps.contains(ConnectionCaps::MONITORING)
    }

    pub fn request_status_refresh(&mut self, now: i64) {
        self.status_refresh_since = Some(now);
    }

    pub fn set_new_day(&mut self, timestamp: i64) {
        self.new_day = timestamp;
    }

    /// Ask the connection backend for the status of the open device.
    ///
    /// With `result` set the outcome is reported as a connection result,
    /// even when nothing changed. Returns whether the status changed.
    pub fn poll_connection_status(&mut self, now: i64, result: Option<bool>) -> bool {
        let Some(device) = self.device.as_ref() else {
            return false;
        };
        let Some(backend) = self.conn_backend.as_mut() else {
            return false;
        };
        let status = match backend.status() {
            Ok(status) => status,
            Err(e) => {
                debug!("Connection status unavailable: {}", e);
                return false;
            }
        };

        let changed = status.connected != device.connected || status.interface != device.interface;
        if changed || result.is_some() {
            self.apply_connection_status(status, now, result);
        }
        changed
    }

    fn apply_connection_status(&mut self, status: ConnectionStatus, now: i64, result: Option<bool>) {
        let session_start = if status.connected {
            self.conn_backend
                .as_mut()
                .and_then(|b| b.timestamp().ok())
                .unwrap_or(now)
        } else {
            0
        };

        let Some(device) = self.device.as_mut() else {
            return;
        };
        device.connected = status.connected;
        device.interface = status.interface;

        if device.connected {
            device.session_start = session_start;
            device.session_time = (now - session_start).unsigned_abs();
            if let Some(store) = self.traffic_store.as_mut() {
                store.open_session(session_start);
            }
            self.traffic_limit_fired = false;
            self.time_limit_fired = false;
            info!("Connected through {}", device.interface);
        } else {
            if let Some(store) = self.traffic_store.as_mut() {
                store.close_session();
            }
            device.reset_traffic(now);
            self.pending.push(CoreEvent::NetStatus(None));
            info!("Disconnected");
        }

        let connected = device.connected;
        self.pending.push(CoreEvent::Backend(match result {
            Some(ok) => BackendEvent::ModemConnectionResult(ok),
            None => BackendEvent::DeviceConnectionStatus(connected),
        }));
    }

    /// Account interface counters of the open device.
    pub fn count_traffic(&mut self, rx: u64, tx: u64, now: i64) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        if let Some(sample) = device.count_traffic(rx, tx, now) {
            if let Some(store) = self.traffic_store.as_mut() {
                store.add_sample(&sample);
            }
        }
        let snapshot = device.traffic_snapshot();
        self.pending.push(CoreEvent::NetStatus(Some(snapshot)));
    }

    fn handle_interface_event(&mut self, event: &InterfaceEvent, now: i64) {
        let Some((ours, device_connected)) = self
            .device
            .as_ref()
            .map(|d| (d.interface == event.name, d.connected))
        else {
            return;
        };

        if event.flags.contains(LinkEventFlags::STATS) && device_connected && ours {
            self.count_traffic(event.rx_bytes, event.tx_bytes, now);
        }
        if self.monitored() {
            return;
        }

        if event.flags.contains(LinkEventFlags::ADD) {
            let appeared = !device_connected && event.up && event.running;
            let went_down = device_connected && ours && !event.up && !event.running;
            if appeared || went_down {
                debug!("Interface {} changed, refreshing connection status", event.name);
                self.status_refresh_since = Some(now);
            }
        }
        if event.flags.contains(LinkEventFlags::REMOVE) && device_connected && ours {
            debug!("Interface {} removed, refreshing connection status", event.name);
            self.status_refresh_since = Some(now);
        }
    }

    /// Apply a backend event and forward it.
    pub fn handle_backend_event(&mut self, event: BackendEvent, now: i64) {
        match &event {
            BackendEvent::DeviceAdded(device) => {
                if !self.devices.iter().any(|d| d.id == device.id) {
                    self.devices.push(device.clone());
                }
            }
            BackendEvent::DeviceRemoved(id) => {
                self.devices.retain(|d| d.id != *id);
            }
            BackendEvent::DeviceEnabledStatus(enabled) => {
                if let Some(device) = self.device.as_mut() {
                    device.enabled = *enabled;
                }
            }
            BackendEvent::DeviceBlockedStatus(blocked) => {
                if let Some(device) = self.device.as_mut() {
                    device.blocked = *blocked;
                }
            }
            BackendEvent::DevicePreparedStatus(prepared) => {
                if let Some(device) = self.device.as_mut() {
                    device.prepared = *prepared;
                }
            }
            BackendEvent::DeviceConnectionStatus(_) if self.monitored() => {
                self.poll_connection_status(now, None);
                return;
            }
            BackendEvent::ModemConnectionResult(ok) => {
                if let Some(device) = self.device.as_mut() {
                    device.conn_transition = false;
                }
                if self.monitored() {
                    self.poll_connection_status(now, Some(*ok));
                    return;
                }
            }
            BackendEvent::ModemEnableResult(ok) => {
                self.finish_operation();
                if *ok {
                    self.refresh_information();
                }
            }
            BackendEvent::ModemUnlockResult(_)
            | BackendEvent::SmsSent(_)
            | BackendEvent::UssdResult(_)
            | BackendEvent::ScanResult(_) => {
                self.finish_operation();
            }
            BackendEvent::SmsCompleted(index) => {
                self.store_message(*index);
            }
            BackendEvent::SignalLevelChange(level) => {
                if let Some(device) = self.device.as_mut() {
                    device.signal_level = *level;
                }
            }
            BackendEvent::NetworkModeChange(mode) => {
                if let Some(device) = self.device.as_mut() {
                    device.mode = *mode;
                }
            }
            BackendEvent::NetworkRegistrationChange {
                status,
                operator_code,
                operator_name,
            } => {
                if let Some(device) = self.device.as_mut() {
                    device.reg_status = *status;
                    device.operator_code = *operator_code;
                    device.operator_name = operator_name.clone();
                    device.registered = matches!(status, RegistrationStatus::Home | RegistrationStatus::Roaming);
                }
            }
            BackendEvent::LocationChange {
                location_3gpp,
                location_gps,
            } => {
                if let Some(device) = self.device.as_mut() {
                    device.location_3gpp = *location_3gpp;
                    device.location_gps = *location_gps;
                }
            }
            BackendEvent::ExtendCapabilities(Capability::Contacts) => {
                self.load_contacts();
            }
            _ => {}
        }
        self.pending.push(CoreEvent::Backend(event));
    }

    fn finish_operation(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.operation = DeviceOperation::Idle;
        }
    }

    fn refresh_information(&mut self) {
        let (Some(backend), Some(device)) = (self.device_backend.as_mut(), self.device.as_mut()) else {
            return;
        };
        if let Err(e) = backend.information(device) {
            warn!("Failed to refresh device information: {}", e);
        }
    }

    pub fn load_contacts(&mut self) {
        if !self.device_ops().contains(DeviceOperations::CONTACTS_ENUM) {
            return;
        }
        let (Some(backend), Some(device)) = (self.device_backend.as_mut(), self.device.as_mut()) else {
            return;
        };
        match backend.contacts_enum() {
            Ok(contacts) => {
                debug!("Loaded {} contacts", contacts.len());
                device.contacts = contacts;
            }
            Err(e) => warn!("Failed to enumerate contacts: {}", e),
        }
    }

    fn store_message(&mut self, index: u32) {
        if !self.device_ops().contains(DeviceOperations::SMS_GET) {
            return;
        }
        let Some(backend) = self.device_backend.as_mut() else {
            return;
        };
        let message = match backend.sms_get(index) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to fetch message {}: {}", index, e);
                return;
            }
        };
        if let Some(store) = self.message_store.as_mut() {
            if store.add_message(&message).is_none() {
                warn!("Failed to store message {}", index);
            }
        }
    }

    /// Fire traffic and time limits once per session.
    pub fn check_limits(&mut self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        let traffic = device.rx_bytes + device.tx_bytes;
        let session_time = device.session_time;

        let mut disconnect = false;
        if self.traffic_limit.enabled
            && !self.traffic_limit_fired
            && self.traffic_limit.threshold_bytes() < traffic
        {
            self.traffic_limit_fired = true;
            disconnect |= self.traffic_limit.action == LimitAction::Disconnect;
            info!("Traffic limit reached ({} bytes)", traffic);
            self.pending.push(CoreEvent::TrafficLimit(self.traffic_limit.message.clone()));
        }
        if self.time_limit.enabled
            && !self.time_limit_fired
            && self.time_limit.threshold_seconds() < session_time
        {
            self.time_limit_fired = true;
            disconnect |= self.time_limit.action == LimitAction::Disconnect;
            info!("Time limit reached ({} s)", session_time);
            self.pending.push(CoreEvent::TimeLimit(self.time_limit.message.clone()));
        }

        if disconnect {
            if let Some(backend) = self.conn_backend.as_mut() {
                if let Err(e) = backend.disconnect() {
                    warn!("Failed to disconnect on limit: {}", e);
                }
            }
        }
    }

    fn update_device_state(&mut self) {
        if self.device.is_none() || !self.device_ops().contains(DeviceOperations::UPDATE_STATE) {
            return;
        }
        if let Some(backend) = self.device_backend.as_mut() {
            if let Err(e) = backend.update_state() {
                debug!("Device state update failed: {}", e);
            }
        }
    }

    fn check_new_day(&mut self, now: DateTime<Local>) {
        if now.timestamp() >= self.new_day {
            self.pending.push(CoreEvent::SmsNewDay);
            self.new_day = next_day_boundary(now);
        }
    }

    /// Device part of one worker tick.
    pub fn tick(&mut self, ready: &Readiness, monitor: Option<&NetlinkMonitor>, backend_events: &Receiver<BackendEvent>) {
        let local_now = Local::now();
        let now = local_now.timestamp();

        if let Some(since) = self.status_refresh_since {
            if self.device.is_some() && !self.monitored() {
                if (now - since).abs() <= STATUS_REFRESH_WINDOW_SECS {
                    if self.poll_connection_status(now, None) {
                        self.status_refresh_since = None;
                    }
                } else {
                    self.status_refresh_since = None;
                }
            }
        }

        if let Some(monitor) = monitor {
            if ready.timed_out {
                if let Some(device) = self.device.as_ref().filter(|d| d.connected) {
                    monitor.request_interface_statistics(&device.interface);
                    monitor.request_connections(libc::AF_INET);
                    monitor.request_connections(libc::AF_INET6);
                }
            }
            if ready.interfaces {
                for event in monitor.read_interface_events() {
                    self.handle_interface_event(&event, now);
                }
            }
            if ready.connections && monitor.read_connections() {
                let changes = monitor.connection_changes();
                self.pending.push(CoreEvent::UpdateConnectionsList(changes));
            }
        }

        for event in backend_events.try_iter() {
            self.handle_backend_event(event, now);
        }

        self.update_device_state();
        self.check_limits();
        self.check_new_day(local_now);
    }
}

/// Unix time of the next local midnight.
pub fn next_day_boundary(now: DateTime<Local>) -> i64 {
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.timestamp())
        .unwrap_or_else(|| now.timestamp() + 86_400)
}

/// Mutex-guarded state plus the external callback.
pub(crate) struct Shared {
    state: Mutex<CoreState>,
    callback: EventCallback,
}

impl Shared {
    pub fn new(state: CoreState, callback: EventCallback) -> Self {
        Self {
            state: Mutex::new(state),
            callback,
        }
    }

    /// Run `f` under the device mutex, then deliver the events it queued.
    pub fn locked<R>(&self, f: impl FnOnce(&mut CoreState) -> R) -> R {
        let (result, events) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.pending))
        };
        for event in events {
            (self.callback)(event);
        }
        result
    }

    /// Deliver `event` directly. Must not be called under the mutex.
    pub fn emit(&self, event: CoreEvent) {
        (self.callback)(event);
    }
}

/// Which sources woke up the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub timed_out: bool,
    pub interfaces: bool,
    pub connections: bool,
}

fn wait(waker: &Waker, monitor: Option<&NetlinkMonitor>) -> Readiness {
    let source = |fd: RawFd| libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let link_fd = monitor.and_then(NetlinkMonitor::interface_fd);
    let conn_fd = monitor.and_then(NetlinkMonitor::connection_fd);

    let mut fds = vec![source(waker.raw_fd())];
    let link_slot = link_fd.map(|fd| {
        fds.push(source(fd));
        fds.len() - 1
    });
    let conn_slot = conn_fd.map(|fd| {
        fds.push(source(fd));
        fds.len() - 1
    });

    // SAFETY: fds is a valid array of pollfd for the duration of the call.
    let status = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
    if status < 0 {
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            warn!("Worker poll failed: {}", error);
        }
        return Readiness::default();
    }

    let readable = |slot: Option<usize>| slot.map(|i| fds[i].revents & libc::POLLIN != 0).unwrap_or(false);
    Readiness {
        timed_out: status == 0,
        interfaces: readable(link_slot),
        connections: readable(conn_slot),
    }
}

/// Handle of the running worker.
pub(crate) struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    waker: Arc<Waker>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, command: WorkerCommand) {
        if self.commands.send(command).is_ok() {
            self.waker.wake();
        }
    }

    /// Stop the worker and wait for it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.send(WorkerCommand::Stop);
            if thread.join().is_err() {
                warn!("Worker thread panicked");
            }
            info!("Worker stopped");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the worker thread.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    backend_events: Receiver<BackendEvent>,
    monitor: Option<Arc<NetlinkMonitor>>,
) -> io::Result<WorkerHandle> {
    let (commands, command_rx) = crossbeam_channel::unbounded();
    let worker_waker = waker.clone();

    let thread = thread::Builder::new()
        .name("modem-core-worker".into())
        .spawn(move || run(shared, worker_waker, command_rx, backend_events, monitor))?;

    Ok(WorkerHandle {
        commands,
        waker,
        thread: Some(thread),
    })
}

fn run(
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    commands: Receiver<WorkerCommand>,
    backend_events: Receiver<BackendEvent>,
    monitor: Option<Arc<NetlinkMonitor>>,
) {
    info!("Worker started");
    // The first ticks look up the connection status.
    shared.locked(|state| state.request_status_refresh(Local::now().timestamp()));

    loop {
        let ready = wait(&waker, monitor.as_deref());
        waker.drain();

        let mut stop = false;
        let mut refresh = false;
        for command in commands.try_iter() {
            match command {
                WorkerCommand::Stop => stop = true,
                WorkerCommand::Refresh => refresh = true,
            }
        }
        if stop {
            break;
        }

        shared.locked(|state| {
            if refresh {
                state.request_status_refresh(Local::now().timestamp());
            }
            state.tick(&ready, monitor.as_deref(), &backend_events);
        });
    }
}
