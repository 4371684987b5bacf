// Modem Manager Core - Authorization
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Authorization gate backed by the system policy service.

mod client;

use std::collections::HashMap;

pub use client::{process_start_time, PolkitClient};

/// Action guarding service management.
pub const MANAGE_SERVICES_ACTION: &str = "ru.linuxonly.modem-manager-gui.manage-services";

/// Action guarding a device module with the given short name.
pub fn manage_modem_action(shortname: &str) -> String {
    format!("ru.linuxonly.modem-manager-gui.manage-modem-{}", shortname)
}

/// Action guarding a connection module with the given short name.
pub fn manage_network_action(shortname: &str) -> String {
    format!("ru.linuxonly.modem-manager-gui.manage-network-{}", shortname)
}

/// Implicit authorization level of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthLevel {
    #[default]
    NotAuthorized,
    AuthRequired,
    AdminAuthRequired,
    AuthRequiredRetained,
    AdminAuthRequiredRetained,
    Authorized,
}

impl AuthLevel {
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => AuthLevel::AuthRequired,
            2 => AuthLevel::AdminAuthRequired,
            3 => AuthLevel::AuthRequiredRetained,
            4 => AuthLevel::AdminAuthRequiredRetained,
            5 => AuthLevel::Authorized,
            _ => AuthLevel::NotAuthorized,
        }
    }

    /// Whether a grant at this level outlives the request.
    pub fn is_retained(self) -> bool {
        matches!(self, AuthLevel::AuthRequiredRetained | AuthLevel::AdminAuthRequiredRetained)
    }
}

/// Policy action with its implicit authorizations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Action {
    pub any: AuthLevel,
    pub inactive: AuthLevel,
    pub active: AuthLevel,
    /// Actions implied by this one.
    pub implies: Vec<String>,
}

/// Known policy actions by name.
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    actions: HashMap<String, Action>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, action: Action) {
        self.actions.insert(name.into(), action);
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether `name` must be authorized before use.
    ///
    /// An action with no implied actions is always needed. Otherwise strict
    /// mode needs every implied action to be known, non-strict mode one.
    pub fn action_needed(&self, name: &str, strict: bool) -> bool {
        let Some(action) = self.actions.get(name) else {
            return false;
        };

        if action.implies.is_empty() {
            return true;
        }

        if strict {
            action.implies.iter().all(|implied| self.contains(implied))
        } else {
            action.implies.iter().any(|implied| self.contains(implied))
        }
    }

    /// Whether an active session keeps the grant once given.
    pub fn is_retained(&self, name: &str) -> bool {
        self.actions
            .get(name)
            .map(|a| a.active.is_retained())
            .unwrap_or(false)
    }
}

/// Answers authorization questions for the other components.
pub trait Authorizer: Send + Sync {
    fn action_needed(&self, action: &str, strict: bool) -> bool;
    /// Ask the user to authorize `action`. Returns whether it was granted.
    fn request_password(&self, action: &str) -> bool;
    /// Drop a retained grant of `action`.
    fn revoke_authorization(&self, action: &str) -> bool;
}

/// A bare table answers `action_needed` but cannot grant anything.
impl Authorizer for ActionTable {
    fn action_needed(&self, action: &str, strict: bool) -> bool {
        ActionTable::action_needed(self, action, strict)
    }

    fn request_password(&self, _action: &str) -> bool {
        false
    }

    fn revoke_authorization(&self, _action: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(implies: &[&str]) -> Action {
        Action {
            implies: implies.iter().map(|s| s.to_string()).collect(),
            ..Action::default()
        }
    }

    fn table() -> ActionTable {
        let mut table = ActionTable::new();
        table.insert("org.freedesktop.systemd1.manage-units", action(&[]));
        table.insert("plain", action(&[]));
        table.insert(
            MANAGE_SERVICES_ACTION,
            action(&["org.freedesktop.systemd1.manage-units", "org.freedesktop.systemd1.reload-daemon"]),
        );
        table.insert("single", action(&["org.freedesktop.systemd1.manage-units"]));
        table
    }

    #[test]
    fn test_unknown_action_not_needed() {
        assert!(!table().action_needed("missing", false));
        assert!(!table().action_needed("missing", true));
    }

    #[test]
    fn test_action_without_implies_is_needed() {
        assert!(table().action_needed("plain", true));
    }

    #[test]
    fn test_strict_requires_all_implied() {
        let table = table();
        assert!(!table.action_needed(MANAGE_SERVICES_ACTION, true));
        assert!(table.action_needed(MANAGE_SERVICES_ACTION, false));
        assert!(table.action_needed("single", true));
    }

    #[test]
    fn test_auth_level_mapping() {
        assert_eq!(AuthLevel::from_raw(4), AuthLevel::AdminAuthRequiredRetained);
        assert_eq!(AuthLevel::from_raw(42), AuthLevel::NotAuthorized);

        let mut table = ActionTable::new();
        table.insert(
            "kept",
            Action { active: AuthLevel::from_raw(4), ..Action::default() },
        );
        assert!(table.is_retained("kept"));
        assert!(!table.is_retained("missing"));
    }

    #[test]
    fn test_user_retained_grant_is_revocable() {
        let mut table = ActionTable::new();
        table.insert(
            "user-retained",
            Action { active: AuthLevel::AuthRequiredRetained, ..Action::default() },
        );
        table.insert(
            "one-shot",
            Action { active: AuthLevel::AuthRequired, ..Action::default() },
        );
        assert!(table.is_retained("user-retained"));
        assert!(!table.is_retained("one-shot"));
        assert!(AuthLevel::from_raw(3).is_retained());
        assert!(!AuthLevel::from_raw(5).is_retained());
    }

    #[test]
    fn test_table_authorizer_never_grants() {
        let table = table();
        let auth: &dyn Authorizer = &table;
        assert!(auth.action_needed("plain", false));
        assert!(!auth.request_password("plain"));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(manage_modem_action("mm07"), "ru.linuxonly.modem-manager-gui.manage-modem-mm07");
        assert_eq!(manage_network_action("nm09"), "ru.linuxonly.modem-manager-gui.manage-network-nm09");
    }
}
