// Modem Manager Core - Main Entry Point
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Headless runner: starts the core, opens the first modem and logs events
//! until Enter is pressed.

use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use modem_manager_core::engine::{BuiltinLoader, ModuleCache};
use modem_manager_core::polkit::{ActionTable, Authorizer, PolkitClient};
use modem_manager_core::storage::JsonStoreProvider;
use modem_manager_core::svcmanager::ServiceManager;
use modem_manager_core::{Core, CoreOptions, CoreParts, DeviceSettings};

fn run() -> modem_manager_core::Result<()> {
    let options = CoreOptions::load();

    let authorizer: Arc<dyn Authorizer> = match PolkitClient::open() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Polkit unavailable, using static action table: {}", e);
            Arc::new(ActionTable::new())
        }
    };

    let services = match ServiceManager::open_system(authorizer.clone()) {
        Ok(services) => Some(services),
        Err(e) => {
            warn!("Service management unavailable: {}", e);
            None
        }
    };

    let mut core = Core::new(CoreParts {
        options,
        loader: Box::new(BuiltinLoader::new()),
        authorizer,
        services,
        stores: Arc::new(JsonStoreProvider::new()),
        settings_dir: DeviceSettings::default_dir(),
        cache: ModuleCache::default(),
        open_netlink: true,
        callback: Arc::new(|event| info!("Event: {:?}", event)),
    })?;

    core.start()?;
    core.wait_startup()?;

    let devices = core.devices_enum()?;
    info!("Found {} devices", devices.len());
    if !devices.is_empty() {
        core.devices_open(devices[0].id, true)?;
    }

    info!("Running, press Enter to quit");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    core.close();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
