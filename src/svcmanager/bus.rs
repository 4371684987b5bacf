// Modem Manager Core - Service Bus
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Init system and message bus calls used by service activation.

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, MatchRule, MessageStream};

const SYSTEMD_BUS: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";

const DBUS_BUS: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Unit as listed by the init system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    pub name: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
}

/// Installed unit file and its enablement state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFileRecord {
    pub path: String,
    pub state: String,
}

/// Calls needed to discover and start services.
pub trait ServiceBus: Send {
    fn list_units(&self) -> BoxFuture<'_, Result<Vec<UnitRecord>>>;
    fn list_unit_files(&self) -> BoxFuture<'_, Result<Vec<UnitFileRecord>>>;
    fn list_activatable_names(&self) -> BoxFuture<'_, Result<Vec<String>>>;
    fn list_names(&self) -> BoxFuture<'_, Result<Vec<String>>>;
    /// Start receiving job notifications.
    fn subscribe(&self) -> BoxFuture<'_, Result<()>>;
    fn unsubscribe(&self) -> BoxFuture<'_, Result<()>>;
    /// Queue a start job for `unit` and return the job path.
    fn start_unit<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>>;
    /// Wait until `job` is removed and return its result string.
    fn wait_job_removed<'a>(&'a self, job: &'a str) -> BoxFuture<'a, Result<String>>;
    fn enable_unit_file<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<()>>;
    /// Ask the bus to activate `name`. Returns the start reply code.
    fn start_service_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<u32>>;
}

type UnitTuple = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

/// Service bus on the system D-Bus.
pub struct SystemBus {
    connection: Connection,
    job_signals: Mutex<Option<MessageStream>>,
}

impl SystemBus {
    /// Connect to the system bus. Must run inside the runtime that will
    /// drive later calls.
    pub async fn connect() -> Result<Self> {
        info!("Connecting to system bus for service activation...");
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;
        Ok(Self {
            connection,
            job_signals: Mutex::new(None),
        })
    }

    async fn list_units_impl(&self) -> Result<Vec<UnitRecord>> {
        let reply = self
            .connection
            .call_method(Some(SYSTEMD_BUS), SYSTEMD_PATH, Some(MANAGER_INTERFACE), "ListUnits", &())
            .await?;
        let units: Vec<UnitTuple> = reply.body().deserialize()?;
        Ok(units
            .into_iter()
            .map(|(name, _, load_state, active_state, sub_state, ..)| UnitRecord {
                name,
                load_state,
                active_state,
                sub_state,
            })
            .collect())
    }

    async fn list_unit_files_impl(&self) -> Result<Vec<UnitFileRecord>> {
        let reply = self
            .connection
            .call_method(Some(SYSTEMD_BUS), SYSTEMD_PATH, Some(MANAGER_INTERFACE), "ListUnitFiles", &())
            .await?;
        let files: Vec<(String, String)> = reply.body().deserialize()?;
        Ok(files
            .into_iter()
            .map(|(path, state)| UnitFileRecord { path, state })
            .collect())
    }

    async fn dbus_names(&self, method: &str) -> Result<Vec<String>> {
        let reply = self
            .connection
            .call_method(Some(DBUS_BUS), DBUS_PATH, Some(DBUS_INTERFACE), method, &())
            .await?;
        Ok(reply.body().deserialize()?)
    }

    async fn subscribe_impl(&self) -> Result<()> {
        // The stream buffers from creation on, so no job can finish unseen.
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(SYSTEMD_BUS)?
            .interface(MANAGER_INTERFACE)?
            .member("JobRemoved")?
            .build();
        let stream = MessageStream::for_match_rule(rule, &self.connection, None).await?;
        *self.job_signals.lock().await = Some(stream);

        self.connection
            .call_method(Some(SYSTEMD_BUS), SYSTEMD_PATH, Some(MANAGER_INTERFACE), "Subscribe", &())
            .await
            .context("Failed to subscribe to systemd signals")?;
        Ok(())
    }

    async fn unsubscribe_impl(&self) -> Result<()> {
        self.job_signals.lock().await.take();
        self.connection
            .call_method(Some(SYSTEMD_BUS), SYSTEMD_PATH, Some(MANAGER_INTERFACE), "Unsubscribe", &())
            .await
            .context("Failed to unsubscribe from systemd signals")?;
        Ok(())
    }

    async fn start_unit_impl(&self, unit: &str) -> Result<String> {
        let reply = self
            .connection
            .call_method(
                Some(SYSTEMD_BUS),
                SYSTEMD_PATH,
                Some(MANAGER_INTERFACE),
                "StartUnit",
                &(unit, "replace"),
            )
            .await?;
        let job: OwnedObjectPath = reply.body().deserialize()?;
        debug!("Start job for {}: {}", unit, job.as_str());
        Ok(job.as_str().to_string())
    }

    async fn wait_job_removed_impl(&self, job: &str) -> Result<String> {
        let mut guard = self.job_signals.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Not subscribed to systemd job signals"))?;

        while let Some(message) = stream.next().await {
            let message = message?;
            let (_id, path, unit, result): (u32, OwnedObjectPath, String, String) =
                message.body().deserialize()?;
            if path.as_str() == job {
                debug!("Job {} for {} finished: {}", job, unit, result);
                return Ok(result);
            }
        }

        Err(anyhow!("Job signal stream closed"))
    }

    async fn enable_unit_file_impl(&self, unit: &str) -> Result<()> {
        let reply = self
            .connection
            .call_method(
                Some(SYSTEMD_BUS),
                SYSTEMD_PATH,
                Some(MANAGER_INTERFACE),
                "EnableUnitFiles",
                &(vec![unit], false, true),
            )
            .await?;
        let (_carries_install_info, changes): (bool, Vec<(String, String, String)>) =
            reply.body().deserialize()?;
        debug!("Enabled {} ({} changes)", unit, changes.len());
        Ok(())
    }

    async fn start_service_by_name_impl(&self, name: &str) -> Result<u32> {
        let reply = self
            .connection
            .call_method(
                Some(DBUS_BUS),
                DBUS_PATH,
                Some(DBUS_INTERFACE),
                "StartServiceByName",
                &(name, 0u32),
            )
            .await?;
        Ok(reply.body().deserialize()?)
    }
}

impl ServiceBus for SystemBus {
    fn list_units(&self) -> BoxFuture<'_, Result<Vec<UnitRecord>>> {
        Box::pin(self.list_units_impl())
    }

    fn list_unit_files(&self) -> BoxFuture<'_, Result<Vec<UnitFileRecord>>> {
        Box::pin(self.list_unit_files_impl())
    }

    fn list_activatable_names(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(self.dbus_names("ListActivatableNames"))
    }

    fn list_names(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(self.dbus_names("ListNames"))
    }

    fn subscribe(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.subscribe_impl())
    }

    fn unsubscribe(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.unsubscribe_impl())
    }

    fn start_unit<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.start_unit_impl(unit))
    }

    fn wait_job_removed<'a>(&'a self, job: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.wait_job_removed_impl(job))
    }

    fn enable_unit_file<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.enable_unit_file_impl(unit))
    }

    fn start_service_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<u32>> {
        Box::pin(self.start_service_by_name_impl(name))
    }
}
