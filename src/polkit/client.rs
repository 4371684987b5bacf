// Modem Manager Core - Policy Service Client
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! D-Bus client for the system policy authority.

use std::collections::HashMap;
use std::fs;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};
use zbus::blocking::Connection;
use zbus::zvariant::Value;

use super::{Action, ActionTable, AuthLevel, Authorizer};

const POLKIT_BUS: &str = "org.freedesktop.PolicyKit1";
const POLKIT_PATH: &str = "/org/freedesktop/PolicyKit1/Authority";
const AUTHORITY_INTERFACE: &str = "org.freedesktop.PolicyKit1.Authority";

const IMPLY_ANNOTATION: &str = "org.freedesktop.policykit.imply";

/// Let the authority show an authentication dialog.
const ALLOW_USER_INTERACTION: u32 = 1;

type ActionDescription = (
    String,
    String,
    String,
    String,
    String,
    String,
    u32,
    u32,
    u32,
    HashMap<String, String>,
);

/// Identity of this process as the authority sees it.
#[derive(Debug, Clone, Copy)]
struct Subject {
    pid: u32,
    start_time: u64,
    uid: u32,
}

/// Read the start time of process `pid` in clock ticks since boot.
pub fn process_start_time(pid: u32) -> Result<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid))
        .with_context(|| format!("Failed to read stat of process {}", pid))?;
    parse_start_time(&stat).ok_or_else(|| anyhow!("Malformed stat of process {}", pid))
}

/// Field 22 of `/proc/<pid>/stat`. The command name may contain spaces, so
/// counting starts after its closing parenthesis.
fn parse_start_time(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Client for the policy authority on the system bus.
pub struct PolkitClient {
    connection: Connection,
    table: ActionTable,
    subject: Subject,
}

impl PolkitClient {
    /// Connect to the authority and load the action table.
    pub fn open() -> Result<Self> {
        info!("Connecting to policy authority...");

        let connection = Connection::system().context("Failed to connect to system D-Bus")?;

        let pid = std::process::id();
        let start_time = process_start_time(pid)?;
        if start_time == 0 {
            return Err(anyhow!("Unable to determine process start time"));
        }
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };

        let locale = std::env::var("LANG").unwrap_or_else(|_| "C".to_string());
        let descriptions: Vec<ActionDescription> = connection
            .call_method(
                Some(POLKIT_BUS),
                POLKIT_PATH,
                Some(AUTHORITY_INTERFACE),
                "EnumerateActions",
                &(locale.as_str(),),
            )
            .context("Failed to enumerate policy actions")?
            .body()
            .deserialize()?;

        let mut table = ActionTable::new();
        for (name, _, _, _, _, _, any, inactive, active, annotations) in descriptions {
            let implies = annotations
                .get(IMPLY_ANNOTATION)
                .map(|list| list.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default();
            table.insert(
                name,
                Action {
                    any: AuthLevel::from_raw(any),
                    inactive: AuthLevel::from_raw(inactive),
                    active: AuthLevel::from_raw(active),
                    implies,
                },
            );
        }

        info!("Loaded {} policy actions", table.len());

        Ok(Self {
            connection,
            table,
            subject: Subject { pid, start_time, uid },
        })
    }

    pub fn actions(&self) -> &ActionTable {
        &self.table
    }

    fn check_authorization(&self, action: &str) -> Result<bool> {
        let mut details: HashMap<&str, Value> = HashMap::new();
        details.insert("pid", Value::from(self.subject.pid));
        details.insert("start-time", Value::from(self.subject.start_time));
        details.insert("uid", Value::from(self.subject.uid));
        let subject = ("unix-process", details);
        let extra: HashMap<&str, &str> = HashMap::new();

        let (authorized, _challenge, _details): (bool, bool, HashMap<String, String>) = self
            .connection
            .call_method(
                Some(POLKIT_BUS),
                POLKIT_PATH,
                Some(AUTHORITY_INTERFACE),
                "CheckAuthorization",
                &(subject, action, extra, ALLOW_USER_INTERACTION, ""),
            )?
            .body()
            .deserialize()?;

        Ok(authorized)
    }
}

impl Authorizer for PolkitClient {
    fn action_needed(&self, action: &str, strict: bool) -> bool {
        self.table.action_needed(action, strict)
    }

    fn request_password(&self, action: &str) -> bool {
        if !self.table.contains(action) {
            warn!("Unknown policy action {}", action);
            return false;
        }

        match self.check_authorization(action) {
            Ok(granted) => {
                debug!("Authorization for {}: {}", action, granted);
                granted
            }
            Err(e) => {
                warn!("Authorization check for {} failed: {:#}", action, e);
                false
            }
        }
    }

    fn revoke_authorization(&self, action: &str) -> bool {
        if !self.table.is_retained(action) {
            return false;
        }

        let result = self.connection.call_method(
            Some(POLKIT_BUS),
            POLKIT_PATH,
            Some(AUTHORITY_INTERFACE),
            "RevokeTemporaryAuthorizationById",
            &(action,),
        );
        match result {
            Ok(_) => true,
            Err(e) => {
                debug!("Failed to revoke authorization for {}: {}", action, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_time() {
        let stat = "4242 (cat) R 1 4242 4242 0 -1 4194304 90 0 0 0 0 0 0 0 20 0 1 0 987654 5619712 180";
        assert_eq!(parse_start_time(stat), Some(987654));
    }

    #[test]
    fn test_parse_start_time_with_spaces_in_name() {
        let stat = "77 (tricky ) name) S 1 77 77 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 31337 0 0";
        assert_eq!(parse_start_time(stat), Some(31337));
    }

    #[test]
    fn test_parse_start_time_truncated() {
        assert_eq!(parse_start_time("1 (init) S 0 1"), None);
        assert_eq!(parse_start_time("garbage"), None);
    }

    #[test]
    fn test_own_start_time_is_readable() {
        assert!(process_start_time(std::process::id()).unwrap() > 0);
    }
}
