// Modem Manager Core - Service Manager
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Starting the system services backend modules depend on.

mod bus;
mod manager;

pub use bus::{ServiceBus, SystemBus, UnitFileRecord, UnitRecord};
#[cfg(test)]
pub(crate) use manager::testing;
pub use manager::{ActivationTech, Interface, Service, ServiceManager, SvcEvent, ACTIVATION_TIMEOUT};
