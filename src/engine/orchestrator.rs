// Modem Manager Core - Orchestrator
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! The public core: module selection, startup and device operations.
//!
//! [`Core`] builds the module registry, starts the services the preferred
//! modules need, binds one device backend and one connection backend and
//! then runs the worker. Every call that touches the open device takes the
//! device mutex shared with the worker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use chrono::{Local, NaiveDate};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::backend::{
    Backend, ConnectionBackend, ConnectionCaps, ConnectionOperations, DeviceBackend, DeviceOperations,
    UssdRequestKind, UssdSessionState, TIMEOUT_OPERATIONS,
};
use super::cache::ModuleCache;
use super::device::{
    Contact, ContactsCaps, ConnectionProfile, Device, DeviceOperation, DeviceStateRequest, LocationCaps, ScanCaps,
    SmsCaps, SmsMessage, UssdCaps, UssdEncoding,
};
use super::events::{BackendEvent, CoreEvent, EventCallback, EventSink};
use super::module::{Module, ModuleFunctions, ModuleKind, Requirement};
use super::registry::{ModuleLoader, Registry, ServiceLookup};
use super::validation::{classify_ussd, merge_sms, validate_sms_number};
use super::worker::{self, next_day_boundary, CoreState, Shared, Waker, WorkerCommand, WorkerHandle};
use crate::config::{CoreOptions, DeviceSettings};
use crate::error::{CoreError, Result};
use crate::netlink::{self, NetlinkConnection, NetlinkMonitor};
use crate::polkit::{manage_modem_action, manage_network_action, Authorizer};
use crate::storage::{DayTraffic, StoreProvider};
use crate::svcmanager::{ActivationTech, ServiceManager, SvcEvent};

/// Per-device setting holding the chosen USSD encoding.
const USSD_ENCODING_KEY: &str = "ussd_encoding";

/// Everything the core needs from its environment.
pub struct CoreParts {
    pub options: CoreOptions,
    pub loader: Box<dyn ModuleLoader>,
    pub authorizer: Arc<dyn Authorizer>,
    /// Service tracking, `None` when the system bus is unavailable.
    pub services: Option<ServiceManager>,
    pub stores: Arc<dyn StoreProvider>,
    pub settings_dir: PathBuf,
    pub cache: ModuleCache,
    /// Follow interfaces and connections over netlink.
    pub open_netlink: bool,
    pub callback: EventCallback,
}

/// Device and service orchestration core.
pub struct Core {
    options: CoreOptions,
    loader: Box<dyn ModuleLoader>,
    authorizer: Arc<dyn Authorizer>,
    services: Option<ServiceManager>,
    stores: Arc<dyn StoreProvider>,
    registry: Registry,
    device_module: Option<usize>,
    conn_module: Option<usize>,
    profiles: Vec<ConnectionProfile>,
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    events: Sender<BackendEvent>,
    backend_events: Receiver<BackendEvent>,
    open_netlink: bool,
    monitor: Option<Arc<NetlinkMonitor>>,
    worker: Option<WorkerHandle>,
    activation: Option<thread::JoinHandle<ActivationReport>>,
}

fn bound_device<'a>(
    backend: &'a mut Option<Box<dyn DeviceBackend>>,
    operation: DeviceOperations,
    name: &'static str,
) -> Result<&'a mut dyn DeviceBackend> {
    let backend = backend.as_mut().ok_or(CoreError::NoModule("device"))?;
    if !backend.operations().contains(operation) {
        return Err(CoreError::Unsupported(name));
    }
    Ok(backend.as_mut())
}

fn bound_connection<'a>(
    backend: &'a mut Option<Box<dyn ConnectionBackend>>,
    operation: ConnectionOperations,
    name: &'static str,
) -> Result<&'a mut dyn ConnectionBackend> {
    let backend = backend.as_mut().ok_or(CoreError::NoModule("connection"))?;
    if !backend.operations().contains(operation) {
        return Err(CoreError::Unsupported(name));
    }
    Ok(backend.as_mut())
}

fn default_ussd_encoding(manufacturer: &str) -> UssdEncoding {
    // Huawei modems answer USSD in UCS-2.
    if manufacturer.eq_ignore_ascii_case("huawei") {
        UssdEncoding::Ucs2
    } else {
        UssdEncoding::Gsm7
    }
}

/// Outcome of an activation run, handed back to the owning thread.
struct ActivationReport {
    services: ServiceManager,
    /// Modules whose services came up.
    activated: Vec<String>,
    finished: bool,
    last_error: Option<String>,
}

/// Translate activation progress into core events. `Finished` has no
/// counterpart until the modules are open.
fn service_event(event: SvcEvent, describe: impl Fn(&str) -> String) -> Option<CoreEvent> {
    Some(match event {
        SvcEvent::Started => CoreEvent::ServiceActivationStarted,
        SvcEvent::EntityChanged(module) => CoreEvent::ServiceChanged(describe(&module)),
        SvcEvent::EntityActivated(module) => CoreEvent::ServiceActivated(describe(&module)),
        SvcEvent::EntityError { module, message } => CoreEvent::ServiceError {
            module: describe(&module),
            message,
        },
        SvcEvent::Finished => return None,
        SvcEvent::AuthError => CoreEvent::ServiceAuthError,
        SvcEvent::OtherError(message) => CoreEvent::ServiceOtherError(message),
    })
}

fn run_activation(
    mut services: ServiceManager,
    shared: &Shared,
    descriptions: &HashMap<String, String>,
) -> ActivationReport {
    let describe = |module: &str| descriptions.get(module).cloned().unwrap_or_else(|| module.to_string());
    let mut activated = Vec::new();
    let mut finished = false;

    services.start_activation(&mut |event| {
        match &event {
            SvcEvent::EntityActivated(module) => activated.push(module.clone()),
            SvcEvent::Finished => finished = true,
            _ => {}
        }
        if let Some(event) = service_event(event, describe) {
            shared.emit(event);
        }
    });

    let last_error = services.last_error().map(str::to_string);
    ActivationReport {
        services,
        activated,
        finished,
        last_error,
    }
}

impl Core {
    /// Build the module registry. Nothing is opened until [`Core::start`].
    pub fn new(parts: CoreParts) -> Result<Self> {
        let CoreParts {
            options,
            loader,
            authorizer,
            services,
            stores,
            settings_dir,
            cache,
            open_netlink,
            callback,
        } = parts;

        let registry = Registry::build(
            &options.modules_dir,
            &cache,
            loader.as_ref(),
            services.as_ref().map(|s| s as &dyn ServiceLookup),
        )?;

        let waker = Arc::new(Waker::new()?);
        let (events, backend_events) = crossbeam_channel::unbounded();
        let state = CoreState::new(settings_dir, options.traffic_limit.clone(), options.time_limit.clone());

        Ok(Self {
            options,
            loader,
            authorizer,
            services,
            stores,
            registry,
            device_module: None,
            conn_module: None,
            profiles: Vec::new(),
            shared: Arc::new(Shared::new(state, callback)),
            waker,
            events,
            backend_events,
            open_netlink,
            monitor: None,
            worker: None,
            activation: None,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn device_module(&self) -> Option<&Module> {
        self.device_module.and_then(|i| self.registry.module(i))
    }

    pub fn connection_module(&self) -> Option<&Module> {
        self.conn_module.and_then(|i| self.registry.module(i))
    }

    /// Choose the preferred modules and start the services they need.
    ///
    /// Without a service manager the modules are opened and the worker
    /// started before returning. Otherwise activation runs on its own
    /// thread and reports progress through the callback as it happens;
    /// startup completes in [`Core::poll_startup`] or [`Core::wait_startup`]
    /// once it is over.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() || self.activation.is_some() {
            return Ok(());
        }

        let pair = self
            .registry
            .choose_pair(self.options.device_module.as_deref(), self.options.connection_module.as_deref())
            .ok_or(CoreError::NoCompatibleModules)?;
        self.registry.set_recommended(pair);
        info!(
            "Preferred modules: {} and {}",
            self.registry.modules()[pair.device].shortname,
            self.registry.modules()[pair.connection].shortname
        );

        let Some(mut services) = self.services.take() else {
            return self.finish_startup();
        };

        if self.options.enable_services {
            for index in [pair.device, pair.connection] {
                let module = &self.registry.modules()[index];
                if module.applicable
                    || module.activation == ActivationTech::None
                    || module.descriptor.requirement != Requirement::Service
                {
                    continue;
                }
                let bus_name = Some(module.service_name()).filter(|s| !s.is_empty());
                if services.schedule_start(
                    module.systemd_name(),
                    bus_name,
                    &module.shortname,
                    self.options.enable_services_autostart,
                ) {
                    info!("Service of module {} scheduled for activation", module.shortname);
                }
            }
        }

        let descriptions: HashMap<String, String> = self
            .registry
            .modules()
            .iter()
            .map(|m| (m.shortname.clone(), m.description().to_string()))
            .collect();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("modem-core-activation".into())
            .spawn(move || run_activation(services, &shared, &descriptions))?;
        self.activation = Some(handle);
        Ok(())
    }

    /// Whether service activation is still in progress.
    pub fn is_starting(&self) -> bool {
        self.activation.is_some()
    }

    /// Complete startup if activation has ended. Returns `None` while it is
    /// still running or when no activation was started.
    pub fn poll_startup(&mut self) -> Option<Result<()>> {
        if !self.activation.as_ref().is_some_and(|h| h.is_finished()) {
            return None;
        }
        let handle = self.activation.take()?;
        Some(self.complete_activation(handle))
    }

    /// Block until activation has ended and complete startup.
    pub fn wait_startup(&mut self) -> Result<()> {
        match self.activation.take() {
            Some(handle) => self.complete_activation(handle),
            None => Ok(()),
        }
    }

    fn complete_activation(&mut self, handle: thread::JoinHandle<ActivationReport>) -> Result<()> {
        let report = handle
            .join()
            .map_err(|_| CoreError::Activation("activation thread panicked".to_string()))?;
        self.services = Some(report.services);
        for module in &report.activated {
            self.registry.mark_applicable(module);
        }

        if !report.finished {
            let message = report
                .last_error
                .unwrap_or_else(|| "activation did not finish".to_string());
            warn!("Service activation failed: {}", message);
            return Err(CoreError::Activation(message));
        }

        match self.finish_startup() {
            Ok(()) => {
                self.shared.emit(CoreEvent::ServiceActivationFinished);
                Ok(())
            }
            Err(e) => {
                self.shared.emit(CoreEvent::StartupError(e.to_string()));
                Err(e)
            }
        }
    }

    fn finish_startup(&mut self) -> Result<()> {
        let (device_open, conn_open) = self.select_modules();
        if !(device_open && conn_open) {
            self.close_modules();
            return Err(CoreError::NoModule(if device_open { "connection" } else { "device" }));
        }

        if self.open_netlink {
            self.monitor = Some(Arc::new(NetlinkMonitor::open()));
        }
        self.shared
            .locked(|state| state.set_new_day(next_day_boundary(Local::now())));

        let handle = worker::spawn(
            self.shared.clone(),
            self.waker.clone(),
            self.backend_events.clone(),
            self.monitor.clone(),
        )?;
        self.worker = Some(handle);
        info!("Core started");
        Ok(())
    }

    /// Open one device and one connection module.
    ///
    /// Recommended modules go first, then a partner of whichever side
    /// opened, then every ranked pair in turn.
    fn select_modules(&mut self) -> (bool, bool) {
        self.close_modules();

        let mut device_open = false;
        let mut conn_open = false;

        let recommended: Vec<(usize, ModuleKind)> = self
            .registry
            .modules()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.applicable && m.recommended)
            .map(|(i, m)| (i, m.kind()))
            .collect();
        for (index, kind) in recommended {
            match kind {
                ModuleKind::Device if !device_open => device_open = self.open_device_module(index),
                ModuleKind::Connection if !conn_open => conn_open = self.open_connection_module(index),
                _ => {}
            }
            if device_open && conn_open {
                return (true, true);
            }
        }

        let pairs = self.registry.pairs().to_vec();
        match (device_open, conn_open) {
            (false, true) => {
                let service = self.connection_module().map(|m| m.service_name().to_string()).unwrap_or_default();
                for pair in pairs {
                    let (device, connection) = (&self.registry.modules()[pair.device], &self.registry.modules()[pair.connection]);
                    if connection.service_name().eq_ignore_ascii_case(&service)
                        && device.applicable
                        && self.open_device_module(pair.device)
                    {
                        device_open = true;
                        break;
                    }
                }
            }
            (true, false) => {
                let service = self.device_module().map(|m| m.service_name().to_string()).unwrap_or_default();
                for pair in pairs {
                    let (device, connection) = (&self.registry.modules()[pair.device], &self.registry.modules()[pair.connection]);
                    if device.service_name().eq_ignore_ascii_case(&service)
                        && connection.applicable
                        && self.open_connection_module(pair.connection)
                    {
                        conn_open = true;
                        break;
                    }
                }
            }
            (false, false) => {
                for pair in pairs {
                    device_open = self.open_device_module(pair.device);
                    conn_open = self.open_connection_module(pair.connection);
                    if device_open && conn_open {
                        break;
                    }
                }
            }
            (true, true) => {}
        }

        (device_open, conn_open)
    }

    fn authorize(&self, module: &Module) -> bool {
        if !module.descriptor.functions.contains(ModuleFunctions::AUTHORIZATION) {
            return true;
        }
        let action = match module.kind() {
            ModuleKind::Device => manage_modem_action(&module.shortname),
            ModuleKind::Connection => manage_network_action(&module.shortname),
        };
        if !self.authorizer.action_needed(&action, false) {
            return true;
        }
        if self.authorizer.request_password(&action) {
            true
        } else {
            warn!("Module {} not authorized ({})", module.shortname, action);
            false
        }
    }

    /// Authorize and load a module, rejecting it when required operations
    /// are missing.
    fn bind(&self, index: usize, kind: ModuleKind) -> Option<Backend> {
        let module = self.registry.module(index)?;
        if module.kind() != kind || !self.authorize(module) {
            return None;
        }
        let backend = match self.loader.load(module) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Failed to load module {}: {}", module.shortname, e);
                return None;
            }
        };
        let missing = backend.missing_required();
        if missing != 0 {
            warn!(
                "Module {} lacks required {} operations ({:#x})",
                module.shortname,
                backend.kind_label(),
                missing
            );
            return None;
        }
        Some(backend)
    }

    fn sink(&self) -> EventSink {
        EventSink::new(self.events.clone(), self.waker.clone())
    }

    fn timeout_for(&self, operation: DeviceOperation) -> u32 {
        match operation {
            DeviceOperation::Enable => self.options.enable_timeout,
            DeviceOperation::SendSms => self.options.send_sms_timeout,
            DeviceOperation::SendUssd => self.options.send_ussd_timeout,
            DeviceOperation::Scan => self.options.scan_networks_timeout,
            DeviceOperation::Idle | DeviceOperation::Unlock => 0,
        }
    }

    fn open_device_module(&mut self, index: usize) -> bool {
        let Some(Backend::Device(mut backend)) = self.bind(index, ModuleKind::Device) else {
            return false;
        };
        if let Err(e) = backend.open(self.sink()) {
            warn!("Failed to open device module: {}", e);
            return false;
        }
        if backend.operations().contains(DeviceOperations::SET_TIMEOUT) {
            for operation in TIMEOUT_OPERATIONS {
                if let Err(e) = backend.set_timeout(operation, self.timeout_for(operation)) {
                    debug!("Timeout of {:?} not set: {}", operation, e);
                }
            }
        }

        self.shared.locked(|state| {
            if let Some(mut previous) = state.device_backend.replace(backend) {
                previous.close();
            }
        });
        self.device_module = Some(index);
        info!("Device module {} opened", self.registry.modules()[index].shortname);
        true
    }

    fn open_connection_module(&mut self, index: usize) -> bool {
        let Some(Backend::Connection(mut backend)) = self.bind(index, ModuleKind::Connection) else {
            return false;
        };
        if let Err(e) = backend.open(self.sink()) {
            warn!("Failed to open connection module: {}", e);
            return false;
        }
        let caps = backend.capabilities();

        self.shared.locked(|state| {
            if let Some(mut previous) = state.conn_backend.replace(backend) {
                previous.close();
            }
            state.conn_caps = caps;
        });
        self.conn_module = Some(index);
        info!("Connection module {} opened", self.registry.modules()[index].shortname);
        true
    }

    fn close_modules(&mut self) {
        self.shared.locked(|state| {
            if let Some(mut backend) = state.device_backend.take() {
                backend.close();
            }
            if let Some(mut backend) = state.conn_backend.take() {
                backend.close();
            }
            state.conn_caps = ConnectionCaps::EMPTY;
            state.devices.clear();
        });
        self.device_module = None;
        self.conn_module = None;
        self.profiles.clear();
    }

    /// Close the open device, stop the worker and release both modules.
    pub fn close(&mut self) {
        if let Some(handle) = self.activation.take() {
            match handle.join() {
                Ok(report) => self.services = Some(report.services),
                Err(_) => warn!("Activation thread panicked"),
            }
        }
        self.devices_close();
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        if self.device_module.is_some() || self.conn_module.is_some() {
            self.close_modules();
            info!("Core closed");
        }
        self.monitor = None;
    }

    // Devices

    /// Ask the backend for the current device list.
    pub fn devices_enum(&self) -> Result<Vec<Device>> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::DEVICES_ENUM, "devices_enum")?;
            let devices = backend.devices_enum()?;
            debug!("Enumerated {} devices", devices.len());
            state.devices = devices.clone();
            Ok(devices)
        })
    }

    /// Devices known from the last enumeration and later hotplug events.
    pub fn devices_list(&self) -> Vec<Device> {
        self.shared.locked(|state| state.devices.clone())
    }

    /// Snapshot of the open device.
    pub fn device(&self) -> Option<Device> {
        self.shared.locked(|state| state.device.clone())
    }

    /// Open device `id`, or the first known device when `id` is unknown and
    /// `open_first` is set.
    pub fn devices_open(&self, id: u32, open_first: bool) -> Result<()> {
        let (target, current) = self.shared.locked(|state| {
            let target = state
                .devices
                .iter()
                .find(|d| d.id == id)
                .or_else(|| if open_first { state.devices.first() } else { None })
                .cloned();
            (target, state.device.as_ref().map(|d| d.id))
        });
        let mut device = target.ok_or_else(|| CoreError::InvalidArgument(format!("unknown device {}", id)))?;

        if current == Some(device.id) {
            return Ok(());
        }
        if current.is_some() {
            self.devices_close();
        }

        let stores = self.stores.clone();
        let monitored = self.shared.locked(|state| -> Result<bool> {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::DEVICE_OPEN, "device_open")?;
            backend.device_open(&device)?;
            if let Err(e) = backend.information(&mut device) {
                warn!("Failed to read device information: {}", e);
            }

            state.message_store = stores.open_message_store(&device.persistent_id, &device.internal_id);
            state.traffic_store = stores.open_traffic_store(&device.persistent_id, &device.internal_id);
            let settings = DeviceSettings::open(&state.settings_dir, &device.persistent_id);
            device.ussd_encoding = settings
                .get_string(USSD_ENCODING_KEY)
                .and_then(|value| UssdEncoding::parse(&value))
                .unwrap_or_else(|| default_ussd_encoding(&device.manufacturer));
            state.settings = Some(settings);

            if let Some(conn) = state.conn_backend.as_mut() {
                if let Err(e) = conn.device_open(&device) {
                    warn!("Connection module cannot follow device {}: {}", device.id, e);
                }
            }

            let id = device.id;
            let export = device.contacts_caps.contains(ContactsCaps::EXPORT);
            state.device = Some(device);
            if export {
                state.load_contacts();
            }

            let monitored = state.monitored();
            if monitored {
                state.poll_connection_status(Local::now().timestamp(), None);
            }
            state.push(CoreEvent::DeviceOpened(id));
            info!("Device {} opened", id);
            Ok(monitored)
        })?;

        if !monitored {
            if let Some(worker) = self.worker.as_ref() {
                worker.send(WorkerCommand::Refresh);
            }
        }
        Ok(())
    }

    /// Close the open device. Returns whether one was open.
    pub fn devices_close(&self) -> bool {
        let Some(id) = self.shared.locked(|state| state.device.as_ref().map(|d| d.id)) else {
            return false;
        };
        self.shared.emit(CoreEvent::DeviceClosing(id));

        self.shared.locked(|state| {
            if let Some(backend) = state.device_backend.as_mut() {
                if let Err(e) = backend.device_close() {
                    warn!("Failed to close device {}: {}", id, e);
                }
            }
            if let Some(mut device) = state.device.take() {
                if device.connected {
                    if let Some(store) = state.traffic_store.as_mut() {
                        store.close_session();
                    }
                }
                device.reset_traffic(Local::now().timestamp());
            }
            state.message_store = None;
            state.traffic_store = None;
            state.settings = None;
            state.push(CoreEvent::NetStatus(None));

            if let Some(conn) = state.conn_backend.as_mut() {
                if let Err(e) = conn.device_close() {
                    debug!("Connection module device close failed: {}", e);
                }
            }
        });
        info!("Device {} closed", id);
        true
    }

    pub fn devices_state(&self, request: DeviceStateRequest) -> Result<bool> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::DEVICE_STATE, "device_state")?;
            if state.device.is_none() {
                return Err(CoreError::NoDevice);
            }
            backend.device_state(request)
        })
    }

    /// Mark the open device busy with `operation` and run `call`.
    /// The device goes back to idle when the call fails.
    fn start_operation(
        &self,
        required: DeviceOperations,
        name: &'static str,
        operation: DeviceOperation,
        call: impl FnOnce(&mut dyn DeviceBackend, &Device) -> Result<()>,
    ) -> Result<()> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, required, name)?;
            let device = state.device.as_mut().ok_or(CoreError::NoDevice)?;
            device.operation = operation;
            let result = call(backend, device);
            if result.is_err() {
                device.operation = DeviceOperation::Idle;
            }
            result
        })
    }

    pub fn devices_enable(&self, enabled: bool) -> Result<()> {
        if self.device_field(false, |d| d.enabled == enabled) {
            return Ok(());
        }
        self.start_operation(DeviceOperations::ENABLE, "enable", DeviceOperation::Enable, |backend, _| {
            backend.enable(enabled)
        })
    }

    pub fn devices_unlock(&self, pin: &str) -> Result<()> {
        if pin.is_empty() {
            return Err(CoreError::InvalidArgument("empty PIN".to_string()));
        }
        self.start_operation(DeviceOperations::UNLOCK, "unlock", DeviceOperation::Unlock, |backend, _| {
            backend.unlock(pin)
        })
    }

    pub fn interrupt_operation(&self) -> Result<()> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::INTERRUPT, "interrupt")?;
            backend.interrupt()
        })
    }

    /// Most recent error text of the device backend.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .locked(|state| state.device_backend.as_ref().and_then(|b| b.last_error()))
    }

    /// Most recent error text of the connection backend.
    pub fn last_connection_error(&self) -> Option<String> {
        self.shared
            .locked(|state| state.conn_backend.as_ref().and_then(|b| b.last_error()))
    }

    fn device_field<T>(&self, default: T, read: impl FnOnce(&Device) -> T) -> T {
        self.shared.locked(|state| state.device.as_ref().map(read)).unwrap_or(default)
    }

    pub fn location_capabilities(&self) -> LocationCaps {
        self.device_field(LocationCaps::EMPTY, |d| d.location_caps)
    }

    pub fn sms_capabilities(&self) -> SmsCaps {
        self.device_field(SmsCaps::EMPTY, |d| d.sms_caps)
    }

    pub fn ussd_capabilities(&self) -> UssdCaps {
        self.device_field(UssdCaps::EMPTY, |d| d.ussd_caps)
    }

    pub fn scan_capabilities(&self) -> ScanCaps {
        self.device_field(ScanCaps::EMPTY, |d| d.scan_caps)
    }

    pub fn contacts_capabilities(&self) -> ContactsCaps {
        self.device_field(ContactsCaps::EMPTY, |d| d.contacts_caps)
    }

    // SMS

    /// Messages on the device, with multipart messages folded when
    /// `concatenate` is set.
    pub fn sms_enum(&self, concatenate: bool) -> Result<Vec<SmsMessage>> {
        let messages = self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::SMS_ENUM, "sms_enum")?;
            let device = state.device.as_ref().ok_or(CoreError::NoDevice)?;
            if !device.sms_caps.contains(SmsCaps::RECEIVE) {
                return Err(CoreError::MissingCapability("sms receive"));
            }
            backend.sms_enum()
        })?;
        Ok(if concatenate { merge_sms(messages) } else { messages })
    }

    pub fn sms_get(&self, index: u32) -> Result<SmsMessage> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::SMS_GET, "sms_get")?;
            let device = state.device.as_ref().ok_or(CoreError::NoDevice)?;
            if !device.sms_caps.contains(SmsCaps::RECEIVE) {
                return Err(CoreError::MissingCapability("sms receive"));
            }
            backend.sms_get(index)
        })
    }

    pub fn sms_delete(&self, index: u32) -> Result<()> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::SMS_DELETE, "sms_delete")?;
            let device = state.device.as_ref().ok_or(CoreError::NoDevice)?;
            if !device.sms_caps.contains(SmsCaps::RECEIVE) {
                return Err(CoreError::MissingCapability("sms receive"));
            }
            backend.sms_delete(index)
        })
    }

    /// Send a text message. `validity` is -1 for the network default.
    pub fn sms_send(&self, number: &str, text: &str, validity: i32, report: bool) -> Result<()> {
        if !validate_sms_number(number) {
            return Err(CoreError::InvalidArgument(format!("invalid number {:?}", number)));
        }
        if text.is_empty() {
            return Err(CoreError::InvalidArgument("empty message".to_string()));
        }
        if !(-1..=255).contains(&validity) {
            return Err(CoreError::InvalidArgument(format!("validity {} out of range", validity)));
        }
        self.start_operation(DeviceOperations::SMS_SEND, "sms_send", DeviceOperation::SendSms, |backend, device| {
            if !device.sms_caps.contains(SmsCaps::SEND) {
                return Err(CoreError::MissingCapability("sms send"));
            }
            backend.sms_send(number, text, validity, report)
        })
    }

    /// Messages saved in the store of the open device.
    pub fn stored_messages(&self) -> Vec<SmsMessage> {
        self.shared
            .locked(|state| state.message_store.as_mut().map(|s| s.messages()))
            .unwrap_or_default()
    }

    pub fn remove_stored_message(&self, db_id: u64) -> bool {
        self.shared
            .locked(|state| state.message_store.as_mut().map(|s| s.remove_message(db_id)))
            .unwrap_or(false)
    }

    // USSD

    pub fn ussd_cancel_session(&self) -> Result<()> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::USSD_CANCEL, "ussd_cancel_session")?;
            if state.device.is_none() {
                return Err(CoreError::NoDevice);
            }
            backend.ussd_cancel_session()
        })
    }

    pub fn ussd_get_state(&self) -> Result<UssdSessionState> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::USSD_STATE, "ussd_state")?;
            if state.device.is_none() {
                return Err(CoreError::NoDevice);
            }
            backend.ussd_state()
        })
    }

    /// Send a USSD request or response. Returns how it was classified.
    pub fn ussd_send(&self, request: &str) -> Result<UssdRequestKind> {
        let kind = classify_ussd(request);
        if kind == UssdRequestKind::Invalid {
            return Err(CoreError::InvalidArgument(format!("invalid USSD request {:?}", request)));
        }
        self.start_operation(DeviceOperations::USSD_SEND, "ussd_send", DeviceOperation::SendUssd, |backend, device| {
            if !device.ussd_caps.contains(UssdCaps::SEND) {
                return Err(CoreError::MissingCapability("ussd send"));
            }
            backend.ussd_send(request, kind, device.ussd_encoding)
        })?;
        Ok(kind)
    }

    /// Change the USSD encoding of the open device and remember it.
    pub fn ussd_set_encoding(&self, encoding: UssdEncoding) -> Result<()> {
        self.shared.locked(|state| {
            let device = state.device.as_mut().ok_or(CoreError::NoDevice)?;
            device.ussd_encoding = encoding;
            if let Some(settings) = state.settings.as_mut() {
                settings.set_string(USSD_ENCODING_KEY, encoding.as_str());
            }
            Ok(())
        })
    }

    pub fn ussd_get_encoding(&self) -> UssdEncoding {
        self.device_field(UssdEncoding::Gsm7, |d| d.ussd_encoding)
    }

    // Networks

    /// Start an operator scan. Results arrive as a `ScanResult` event.
    pub fn networks_scan(&self) -> Result<()> {
        self.start_operation(DeviceOperations::NETWORKS_SCAN, "networks_scan", DeviceOperation::Scan, |backend, device| {
            if !device.scan_caps.contains(ScanCaps::OBSERVE) {
                return Err(CoreError::MissingCapability("network scan"));
            }
            backend.networks_scan()
        })
    }

    // Contacts

    pub fn contacts_list(&self) -> Result<Vec<Contact>> {
        self.shared.locked(|state| {
            let device = state.device.as_ref().ok_or(CoreError::NoDevice)?;
            if !device.contacts_caps.contains(ContactsCaps::EXPORT) {
                return Err(CoreError::MissingCapability("contacts export"));
            }
            Ok(device.contacts.clone())
        })
    }

    pub fn contacts_get(&self, id: u32) -> Result<Option<Contact>> {
        Ok(self.contacts_list()?.into_iter().find(|c| c.id == id))
    }

    /// Store a contact on the device and return its identifier.
    pub fn contacts_add(&self, contact: Contact) -> Result<u32> {
        if contact.name.is_empty() {
            return Err(CoreError::InvalidArgument("contact without name".to_string()));
        }
        if !validate_sms_number(&contact.number) {
            return Err(CoreError::InvalidArgument(format!("invalid number {:?}", contact.number)));
        }
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::CONTACTS_ADD, "contacts_add")?;
            let device = state.device.as_mut().ok_or(CoreError::NoDevice)?;
            if !device.contacts_caps.contains(ContactsCaps::EDIT) {
                return Err(CoreError::MissingCapability("contacts edit"));
            }
            let id = backend.contacts_add(&contact)?;
            device.contacts.push(Contact { id, ..contact });
            Ok(id)
        })
    }

    pub fn contacts_delete(&self, id: u32) -> Result<()> {
        self.shared.locked(|state| {
            let backend = bound_device(&mut state.device_backend, DeviceOperations::CONTACTS_DELETE, "contacts_delete")?;
            let device = state.device.as_mut().ok_or(CoreError::NoDevice)?;
            if !device.contacts_caps.contains(ContactsCaps::EDIT) {
                return Err(CoreError::MissingCapability("contacts edit"));
            }
            backend.contacts_delete(id)?;
            device.contacts.retain(|c| c.id != id);
            Ok(())
        })
    }

    // Connections

    /// Reload connection profiles, sorted by name.
    pub fn connections_enum(&mut self) -> Result<Vec<ConnectionProfile>> {
        let mut profiles = self.shared.locked(|state| {
            let backend = bound_connection(&mut state.conn_backend, ConnectionOperations::ENUM, "connection_enum")?;
            backend.enum_profiles()
        })?;
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        self.profiles = profiles.clone();
        Ok(profiles)
    }

    /// Profiles from the last enumeration.
    pub fn connections_list(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    pub fn connections_add(&mut self, profile: &ConnectionProfile) -> Result<ConnectionProfile> {
        let stored = self.shared.locked(|state| {
            let backend = bound_connection(&mut state.conn_backend, ConnectionOperations::ADD, "connection_add")?;
            backend.add_profile(profile)
        })?;
        self.profiles.push(stored.clone());
        self.profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stored)
    }

    pub fn connections_update(&mut self, profile: &ConnectionProfile) -> Result<()> {
        self.shared.locked(|state| {
            let backend = bound_connection(&mut state.conn_backend, ConnectionOperations::UPDATE, "connection_update")?;
            backend.update_profile(profile)
        })?;
        if let Some(existing) = self.profiles.iter_mut().find(|p| p.uuid == profile.uuid) {
            *existing = profile.clone();
        }
        self.profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    pub fn connections_remove(&mut self, uuid: &str) -> Result<()> {
        self.shared.locked(|state| {
            let backend = bound_connection(&mut state.conn_backend, ConnectionOperations::REMOVE, "connection_remove")?;
            backend.remove_profile(uuid)
        })?;
        self.profiles.retain(|p| p.uuid != uuid);
        Ok(())
    }

    /// Connect the open device using profile `uuid`.
    pub fn connections_connect(&self, uuid: &str) -> Result<()> {
        let profile = self
            .profiles
            .iter()
            .find(|p| p.uuid == uuid)
            .cloned()
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown connection {}", uuid)))?;

        self.shared.locked(|state| {
            let backend = bound_connection(&mut state.conn_backend, ConnectionOperations::CONNECT, "connect")?;
            let device = state.device.as_mut().ok_or(CoreError::NoDevice)?;
            device.conn_transition = true;
            let result = backend.connect(&profile);
            if result.is_err() {
                device.conn_transition = false;
            }
            result
        })
    }

    /// Disconnect the open device. Returns `false` when it was not connected.
    pub fn connections_disconnect(&self) -> Result<bool> {
        self.shared.locked(|state| {
            let backend = bound_connection(&mut state.conn_backend, ConnectionOperations::DISCONNECT, "disconnect")?;
            let Some(device) = state.device.as_mut().filter(|d| d.connected) else {
                return Ok(false);
            };
            device.conn_transition = true;
            if let Err(e) = backend.disconnect() {
                device.conn_transition = false;
                return Err(e);
            }
            Ok(true)
        })
    }

    pub fn connections_active_uuid(&self) -> Result<Option<String>> {
        self.shared.locked(|state| {
            let backend = bound_connection(&mut state.conn_backend, ConnectionOperations::ACTIVE_UUID, "connection_active_uuid")?;
            backend.active_uuid()
        })
    }

    /// Capabilities of the connection module. Without one, profiles are
    /// managed by the core itself.
    pub fn connections_capabilities(&self) -> ConnectionCaps {
        self.shared.locked(|state| {
            if state.conn_backend.is_some() {
                state.conn_caps
            } else {
                ConnectionCaps::MANAGEMENT
            }
        })
    }

    /// Whether a connect or disconnect is in progress.
    pub fn connections_transition(&self) -> bool {
        self.device_field(false, |d| d.conn_transition)
    }

    // Traffic and netlink

    /// Traffic of the open device on `day`.
    pub fn traffic_day(&self, day: NaiveDate) -> Option<DayTraffic> {
        self.shared
            .locked(|state| state.traffic_store.as_mut().and_then(|s| s.day_totals(day)))
    }

    /// Start reporting connection changes and return the current table.
    pub fn open_connection_list(&self) -> Vec<NetlinkConnection> {
        self.monitor
            .as_ref()
            .map(|m| m.open_connection_list())
            .unwrap_or_default()
    }

    pub fn close_connection_list(&self) {
        if let Some(monitor) = self.monitor.as_ref() {
            monitor.close_connection_list();
        }
    }

    /// Ask the process owning a connection to terminate.
    pub fn terminate_application(&self, pid: u32) -> bool {
        netlink::terminate_application(pid)
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("device_module", &self.device_module().map(|m| m.shortname.as_str()))
            .field("connection_module", &self.connection_module().map(|m| m.shortname.as_str()))
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}
