// Modem Manager Core - Errors
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Error type shared by the public API.

use thiserror::Error;

/// Failure reported by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No device module and connection module can work together.
    #[error("no compatible pair of device and connection modules is available")]
    NoCompatibleModules,

    /// The module kind needed for the call is not open.
    #[error("no {0} module is open")]
    NoModule(&'static str),

    /// A module could not be bound or opened.
    #[error("module {module} rejected: {reason}")]
    ModuleRejected { module: String, reason: String },

    /// The open backend does not provide the requested operation.
    #[error("operation not supported by backend: {0}")]
    Unsupported(&'static str),

    #[error("no device is open")]
    NoDevice,

    /// The open device lacks a capability the call depends on.
    #[error("device lacks capability: {0}")]
    MissingCapability(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Error text reported by a backend call.
    #[error("{0}")]
    Backend(String),

    #[error("service activation failed: {0}")]
    Activation(String),

    #[error("system bus: {0}")]
    Bus(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Bus(format!("{:#}", err))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
