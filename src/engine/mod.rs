// Modem Manager Core - Engine
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Module registry, backend bindings and the device worker.

pub mod backend;
pub mod cache;
pub mod device;
pub mod events;
pub mod module;
mod orchestrator;
pub mod registry;
pub mod validation;
mod worker;

pub use backend::{
    Backend, ConnectionBackend, ConnectionCaps, ConnectionOperations, ConnectionStatus, DeviceBackend,
    DeviceOperations, UssdRequestKind, UssdSessionState,
};
pub use cache::ModuleCache;
pub use device::{
    Capability, Contact, ConnectionProfile, Device, DeviceOperation, DeviceStateRequest, ScannedNetwork, SmsMessage,
    TrafficSample, TrafficSnapshot, UssdEncoding,
};
pub use events::{BackendEvent, CoreEvent, EventCallback, EventSink};
pub use module::{Module, ModuleDescriptor, ModuleFunctions, ModuleKind, Priority, Requirement};
pub use orchestrator::{Core, CoreParts};
pub use registry::{BackendFactory, BuiltinLoader, ModuleLoader, Registry};
pub use worker::{next_day_boundary, WorkerCommand};
