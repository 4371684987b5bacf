// Modem Manager Core - Service Activation
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Discovery and ordered activation of the services modules depend on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::bus::{ServiceBus, SystemBus};
use crate::error::{CoreError, Result};
use crate::polkit::{Authorizer, MANAGE_SERVICES_ACTION};

/// Default time a single activation may take.
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_millis(15000);

/// Bus reply codes meaning the name has an owner.
const START_REPLY_SUCCESS: u32 = 1;
const START_REPLY_ALREADY_RUNNING: u32 = 2;

/// How a missing dependency could be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationTech {
    #[default]
    None,
    Systemd,
    Bus,
}

/// Progress of an activation run. Entity events carry the module name the
/// transition was scheduled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvcEvent {
    Started,
    EntityChanged(String),
    EntityActivated(String),
    EntityError { module: String, message: String },
    Finished,
    AuthError,
    OtherError(String),
}

/// Init system service as last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Service {
    pub loaded: bool,
    pub active: bool,
    pub running: bool,
    pub enabled: bool,
}

/// Well-known bus name as last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interface {
    pub active: bool,
    pub activatable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entity {
    Service(String),
    Interface(String),
}

/// One queued activation.
#[derive(Debug, Clone)]
struct Transition {
    entity: Entity,
    module: String,
    /// Start job of a service while it runs.
    job: Option<String>,
    enable: bool,
}

/// Message for a failed start job, `None` for success.
fn job_result_error(result: &str) -> Option<&'static str> {
    match result {
        "done" => None,
        "canceled" => Some("Job canceled"),
        "timeout" => Some("Systemd timeout reached"),
        "failed" => Some("Service activation failed"),
        "dependency" => Some("Service depends on already failed service"),
        "skipped" => Some("Service skipped"),
        _ => Some("Unknown error"),
    }
}

/// Tracks services and bus names and activates them one at a time.
pub struct ServiceManager {
    runtime: Runtime,
    bus: Box<dyn ServiceBus>,
    authorizer: Arc<dyn Authorizer>,
    systemd_available: bool,
    bus_available: bool,
    services: HashMap<String, Service>,
    interfaces: HashMap<String, Interface>,
    queue: VecDeque<Transition>,
    last_error: Option<String>,
    timeout: Duration,
}

impl ServiceManager {
    /// Open against the system bus.
    pub fn open_system(authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        let runtime = build_runtime()?;
        let bus = runtime.block_on(SystemBus::connect())?;
        Self::from_parts(runtime, Box::new(bus), authorizer)
    }

    /// Open against any bus implementation.
    pub fn open(bus: Box<dyn ServiceBus>, authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        Self::from_parts(build_runtime()?, bus, authorizer)
    }

    fn from_parts(runtime: Runtime, bus: Box<dyn ServiceBus>, authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        let mut manager = Self {
            runtime,
            bus,
            authorizer,
            systemd_available: false,
            bus_available: false,
            services: HashMap::new(),
            interfaces: HashMap::new(),
            queue: VecDeque::new(),
            last_error: None,
            timeout: ACTIVATION_TIMEOUT,
        };
        manager.load()?;
        Ok(manager)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn load(&mut self) -> Result<()> {
        if self.authorizer.action_needed(MANAGE_SERVICES_ACTION, true) {
            match self.runtime.block_on(load_systemd(&*self.bus)) {
                Ok(services) => {
                    info!("Found {} systemd services", services.len());
                    self.services = services;
                    self.systemd_available = true;
                }
                Err(e) => warn!("Systemd services unavailable: {:#}", e),
            }
        } else {
            debug!("Service management action unavailable, skipping systemd");
        }

        match self.runtime.block_on(load_interfaces(&*self.bus)) {
            Ok(interfaces) => {
                info!("Found {} bus names", interfaces.len());
                self.interfaces = interfaces;
                self.bus_available = true;
            }
            Err(e) => warn!("Bus names unavailable: {:#}", e),
        }

        if !self.systemd_available && !self.bus_available {
            return Err(CoreError::Activation("no service activation technology is available".to_string()));
        }
        Ok(())
    }

    /// Whether the service is running, by unit name or bus name.
    pub fn service_state(&self, unit: Option<&str>, bus_name: Option<&str>) -> bool {
        let unit_running = unit
            .filter(|_| self.systemd_available)
            .and_then(|u| self.services.get(u))
            .map(|s| s.running)
            .unwrap_or(false);
        let name_active = bus_name
            .filter(|_| self.bus_available)
            .and_then(|n| self.interfaces.get(n))
            .map(|i| i.active)
            .unwrap_or(false);
        unit_running || name_active
    }

    /// How a stopped service could be started.
    pub fn activation_tech(&self, unit: Option<&str>, bus_name: Option<&str>) -> ActivationTech {
        if let Some(service) = unit.filter(|_| self.systemd_available).and_then(|u| self.services.get(u)) {
            if !service.running {
                return ActivationTech::Systemd;
            }
        }
        if let Some(interface) = bus_name.filter(|_| self.bus_available).and_then(|n| self.interfaces.get(n)) {
            if interface.activatable && !interface.active {
                return ActivationTech::Bus;
            }
        }
        // Without a known unit or bus name there is nothing to start.
        ActivationTech::None
    }

    pub fn service(&self, unit: &str) -> Option<&Service> {
        self.services.get(unit)
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name)
    }

    /// Queue a start for `module`. Returns `true` when queued or already
    /// running, `false` when nothing can start it.
    pub fn schedule_start(&mut self, unit: Option<&str>, bus_name: Option<&str>, module: &str, enable: bool) -> bool {
        if let Some(unit) = unit.filter(|_| self.systemd_available) {
            if let Some(service) = self.services.get(unit) {
                if service.running {
                    return true;
                }
                // Services run before bus names, in scheduling order.
                let position = self
                    .queue
                    .iter()
                    .position(|t| matches!(t.entity, Entity::Interface(_)))
                    .unwrap_or(self.queue.len());
                self.queue.insert(
                    position,
                    Transition {
                        entity: Entity::Service(unit.to_string()),
                        module: module.to_string(),
                        job: None,
                        enable,
                    },
                );
                debug!("Scheduled service {} for {}", unit, module);
                return true;
            }
        }

        if let Some(name) = bus_name.filter(|_| self.bus_available) {
            if let Some(interface) = self.interfaces.get(name) {
                if interface.active {
                    return true;
                }
                if interface.activatable {
                    self.queue.push_back(Transition {
                        entity: Entity::Interface(name.to_string()),
                        module: module.to_string(),
                        job: None,
                        enable,
                    });
                    debug!("Scheduled bus name {} for {}", name, module);
                    return true;
                }
            }
        }

        false
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Latest activation error text.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Run every queued activation in order, reporting through `sink`.
    ///
    /// A failure drops the rest of the queue and ends the run without
    /// `Finished`.
    pub fn start_activation(&mut self, sink: &mut dyn FnMut(SvcEvent)) {
        if self.queue.is_empty() {
            sink(SvcEvent::Finished);
            return;
        }

        let needs_systemd = self.queue.iter().any(|t| matches!(t.entity, Entity::Service(_)));
        if needs_systemd {
            if !self.authorizer.request_password(MANAGE_SERVICES_ACTION) {
                self.last_error = Some("Authorization refused".to_string());
                self.queue.clear();
                sink(SvcEvent::AuthError);
                return;
            }
            if let Err(e) = self.runtime.block_on(self.bus.subscribe()) {
                let message = format!("{:#}", e);
                self.last_error = Some(message.clone());
                self.queue.clear();
                self.authorizer.revoke_authorization(MANAGE_SERVICES_ACTION);
                sink(SvcEvent::OtherError(message));
                return;
            }
        }

        sink(SvcEvent::Started);

        let Self {
            runtime,
            bus,
            queue,
            services,
            interfaces,
            last_error,
            timeout,
            ..
        } = self;
        let bus: &dyn ServiceBus = bus.as_ref();

        let failed = runtime.block_on(async {
            let mut failed = false;
            while let Some(transition) = queue.front_mut() {
                let module = transition.module.clone();
                sink(SvcEvent::EntityChanged(module.clone()));

                let outcome = match transition.entity.clone() {
                    Entity::Service(unit) => activate_unit(bus, transition, &unit, *timeout).await,
                    Entity::Interface(name) => activate_name(bus, &name, *timeout).await,
                };

                match outcome {
                    Ok(()) => {
                        if let Some(done) = queue.pop_front() {
                            match done.entity {
                                Entity::Service(unit) => {
                                    let service = services.entry(unit).or_default();
                                    service.active = true;
                                    service.running = true;
                                    service.enabled |= done.enable;
                                }
                                Entity::Interface(name) => {
                                    interfaces.entry(name).or_default().active = true;
                                }
                            }
                        }
                        sink(SvcEvent::EntityActivated(module));
                    }
                    Err(message) => {
                        let job = queue.front().and_then(|t| t.job.as_deref()).unwrap_or("-");
                        warn!("Activation for {} failed (job {}): {}", module, job, message);
                        *last_error = Some(message.clone());
                        queue.clear();
                        sink(SvcEvent::EntityError { module, message });
                        failed = true;
                        break;
                    }
                }
            }

            if needs_systemd {
                if let Err(e) = bus.unsubscribe().await {
                    debug!("{:#}", e);
                }
            }
            failed
        });

        if needs_systemd {
            self.authorizer.revoke_authorization(MANAGE_SERVICES_ACTION);
        }
        if !failed {
            info!("Service activation finished");
            sink(SvcEvent::Finished);
        }
    }
}

async fn activate_unit(bus: &dyn ServiceBus, transition: &mut Transition, unit: &str, timeout: Duration) -> std::result::Result<(), String> {
    let job = bus.start_unit(unit).await.map_err(|e| format!("{:#}", e))?;
    transition.job = Some(job.clone());

    let result = match tokio::time::timeout(timeout, bus.wait_job_removed(&job)).await {
        Err(_) => return Err("Timeout".to_string()),
        Ok(Err(e)) => return Err(format!("{:#}", e)),
        Ok(Ok(result)) => result,
    };

    if let Some(message) = job_result_error(&result) {
        return Err(message.to_string());
    }

    if transition.enable {
        if let Err(e) = bus.enable_unit_file(unit).await {
            warn!("Failed to enable {}: {:#}", unit, e);
        }
    }
    Ok(())
}

async fn activate_name(bus: &dyn ServiceBus, name: &str, timeout: Duration) -> std::result::Result<(), String> {
    match tokio::time::timeout(timeout, bus.start_service_by_name(name)).await {
        Err(_) => Err("Timeout".to_string()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Ok(Ok(START_REPLY_SUCCESS | START_REPLY_ALREADY_RUNNING)) => Ok(()),
        Ok(Ok(_)) => Err("Unknown activation status".to_string()),
    }
}

async fn load_systemd(bus: &dyn ServiceBus) -> anyhow::Result<HashMap<String, Service>> {
    let mut services: HashMap<String, Service> = HashMap::new();

    for unit in bus.list_units().await? {
        if !unit.name.ends_with(".service") {
            continue;
        }
        services.insert(
            unit.name,
            Service {
                loaded: unit.load_state == "loaded",
                active: unit.active_state == "active",
                running: unit.sub_state == "running",
                enabled: false,
            },
        );
    }

    for file in bus.list_unit_files().await? {
        let name = file.path.rsplit('/').next().unwrap_or(&file.path);
        if !name.ends_with(".service") {
            continue;
        }
        let service = services.entry(name.to_string()).or_default();
        service.enabled = file.state == "enabled";
    }

    Ok(services)
}

async fn load_interfaces(bus: &dyn ServiceBus) -> anyhow::Result<HashMap<String, Interface>> {
    let mut interfaces: HashMap<String, Interface> = HashMap::new();

    for name in bus.list_activatable_names().await? {
        interfaces.insert(name, Interface { active: false, activatable: true });
    }

    for name in bus.list_names().await? {
        if name.starts_with(':') {
            continue;
        }
        interfaces.entry(name).or_default().active = true;
    }

    Ok(interfaces)
}

fn build_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted service bus shared by the activation tests.

    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::anyhow;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::polkit::Authorizer;
    use crate::svcmanager::bus::{ServiceBus, UnitFileRecord, UnitRecord};

    #[derive(Default)]
    pub struct MockState {
        pub job_results: HashMap<String, String>,
        pub name_replies: HashMap<String, u32>,
        /// Units whose jobs finish only once `release` is notified.
        pub hanging_units: Vec<String>,
        pub calls: Vec<String>,
    }

    #[derive(Default, Clone)]
    pub struct MockBus {
        pub state: Arc<Mutex<MockState>>,
        pub release: Arc<Notify>,
    }

    impl MockBus {
        fn record(&self, call: String) {
            self.state.lock().calls.push(call);
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().calls.clone()
        }
    }

    impl ServiceBus for MockBus {
        fn list_units(&self) -> BoxFuture<'_, anyhow::Result<Vec<UnitRecord>>> {
            let unit = |name: &str, sub: &str| UnitRecord {
                name: name.to_string(),
                load_state: "loaded".to_string(),
                active_state: if sub == "running" { "active" } else { "inactive" }.to_string(),
                sub_state: sub.to_string(),
            };
            Box::pin(async move {
                Ok(vec![
                    unit("ModemManager.service", "dead"),
                    unit("NetworkManager.service", "running"),
                    unit("ofono.service", "dead"),
                    unit("broken.service", "dead"),
                    unit("slow.service", "dead"),
                    unit("dbus.socket", "running"),
                ])
            })
        }

        fn list_unit_files(&self) -> BoxFuture<'_, anyhow::Result<Vec<UnitFileRecord>>> {
            Box::pin(async {
                Ok(vec![UnitFileRecord {
                    path: "/usr/lib/systemd/system/NetworkManager.service".to_string(),
                    state: "enabled".to_string(),
                }])
            })
        }

        fn list_activatable_names(&self) -> BoxFuture<'_, anyhow::Result<Vec<String>>> {
            Box::pin(async {
                Ok(vec![
                    "org.freedesktop.ModemManager1".to_string(),
                    "org.ofono".to_string(),
                    "org.weird".to_string(),
                ])
            })
        }

        fn list_names(&self) -> BoxFuture<'_, anyhow::Result<Vec<String>>> {
            Box::pin(async {
                Ok(vec![
                    ":1.42".to_string(),
                    "org.freedesktop.NetworkManager".to_string(),
                ])
            })
        }

        fn subscribe(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            self.record("subscribe".to_string());
            Box::pin(async { Ok(()) })
        }

        fn unsubscribe(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            self.record("unsubscribe".to_string());
            Box::pin(async { Ok(()) })
        }

        fn start_unit<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
            self.record(format!("start_unit {}", unit));
            Box::pin(async move { Ok(format!("/job/{}", unit)) })
        }

        fn wait_job_removed<'a>(&'a self, job: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
            let unit = job.trim_start_matches("/job/").to_string();
            let hang = self.state.lock().hanging_units.contains(&unit);
            let result = self.state.lock().job_results.get(&unit).cloned();
            let release = self.release.clone();
            Box::pin(async move {
                if hang {
                    release.notified().await;
                }
                Ok(result.unwrap_or_else(|| "done".to_string()))
            })
        }

        fn enable_unit_file<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
            self.record(format!("enable {}", unit));
            Box::pin(async { Err(anyhow!("read-only filesystem")) })
        }

        fn start_service_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<u32>> {
            self.record(format!("start_name {}", name));
            let reply = self.state.lock().name_replies.get(name).copied();
            Box::pin(async move { reply.ok_or_else(|| anyhow!("name has no owner")) })
        }
    }

    pub struct FakeAuth {
        pub grant: bool,
        pub systemd_allowed: bool,
    }

    impl Authorizer for FakeAuth {
        fn action_needed(&self, _action: &str, _strict: bool) -> bool {
            self.systemd_allowed
        }

        fn request_password(&self, _action: &str) -> bool {
            self.grant
        }

        fn revoke_authorization(&self, _action: &str) -> bool {
            true
        }
    }
}
