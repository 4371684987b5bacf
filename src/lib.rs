// Modem Manager Core - Library Root
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Device and service orchestration core for a mobile broadband modem manager.
//!
//! The crate discovers a compatible pair of backend modules (device management
//! and connection management), authorizes and starts the system services they
//! depend on, and runs a background worker that follows network interfaces and
//! transport connections over netlink. Every observable change is delivered to
//! a single event callback.

/// Declares a copyable bit set newtype with named flags.
macro_rules! bitmask {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident: $ty:ty {
            $(
                $(#[$flag_meta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
        $vis struct $name($ty);

        #[allow(dead_code)]
        impl $name {
            pub const EMPTY: Self = Self(0);
            $(
                $(#[$flag_meta])*
                pub const $flag: Self = Self($value);
            )*

            pub const fn bits(self) -> $ty {
                self.0
            }

            pub const fn from_bits(bits: $ty) -> Self {
                Self(bits)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

pub mod config;
pub mod engine;
pub mod error;
pub mod netlink;
pub mod polkit;
pub mod storage;
pub mod svcmanager;

pub use config::{CoreOptions, DeviceSettings};
pub use engine::{Core, CoreEvent, CoreParts};
pub use error::{CoreError, Result};
