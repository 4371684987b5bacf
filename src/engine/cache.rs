// Modem Manager Core - Module Cache
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Caching of module descriptors to avoid probing every module at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::module::{Module, ModuleDescriptor, ModuleFunctions, ModuleKind, Priority, Requirement};
use crate::config::APP_DIR;
use crate::storage::write_private;

/// Oldest cache layout still understood.
pub const CACHE_VERSION: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheHeader {
    timestamp: i64,
    version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedModule {
    identifier: u32,
    #[serde(rename = "type")]
    kind: u32,
    requirement: u32,
    priority: u32,
    functions: u32,
    #[serde(default)]
    description: String,
    #[serde(rename = "servicename", default)]
    service_name: String,
    #[serde(rename = "systemdname", default)]
    systemd_name: String,
    #[serde(default)]
    compatibility: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    cache: CacheHeader,
    modules: BTreeMap<String, CachedModule>,
}

impl CachedModule {
    fn from_module(module: &Module) -> Self {
        let d = &module.descriptor;
        Self {
            identifier: d.identifier,
            kind: d.kind.as_raw(),
            requirement: d.requirement.as_raw(),
            priority: d.priority.as_raw(),
            functions: d.functions.bits(),
            description: d.description.clone(),
            service_name: d.service_name.clone(),
            systemd_name: d.systemd_name.clone(),
            compatibility: d.compatibility.clone(),
        }
    }

    fn into_descriptor(self) -> Option<ModuleDescriptor> {
        Some(ModuleDescriptor {
            identifier: self.identifier,
            kind: ModuleKind::from_raw(self.kind)?,
            requirement: Requirement::from_raw(self.requirement)?,
            priority: Priority::from_raw(self.priority)?,
            functions: ModuleFunctions::from_bits(self.functions),
            description: self.description,
            service_name: self.service_name,
            systemd_name: self.systemd_name,
            compatibility: self.compatibility,
        })
    }
}

/// Module descriptor cache keyed on the modules directory timestamp.
#[derive(Debug, Clone)]
pub struct ModuleCache {
    path: PathBuf,
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl ModuleCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("modules.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cached modules.
    ///
    /// Returns `None` when the cache is missing, stale for `dir_mtime`, too
    /// old, or holds no usable module.
    pub fn load(&self, dir_mtime: i64) -> Option<Vec<Module>> {
        let content = fs::read_to_string(&self.path).ok()?;
        let cached: CacheFile = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to parse module cache: {}", e);
                return None;
            }
        };

        if cached.cache.timestamp != dir_mtime || cached.cache.version < CACHE_VERSION {
            debug!(
                "Module cache is stale (timestamp {}, version {})",
                cached.cache.timestamp, cached.cache.version
            );
            return None;
        }

        let modules: Vec<Module> = cached
            .modules
            .into_iter()
            .filter_map(|(filename, entry)| match entry.into_descriptor() {
                Some(descriptor) => Some(Module::new(descriptor, &filename)),
                None => {
                    debug!("Skipping invalid cache entry {}", filename);
                    None
                }
            })
            .collect();

        if modules.is_empty() {
            return None;
        }
        Some(modules)
    }

    /// Save `modules` for `dir_mtime`.
    pub fn save(&self, dir_mtime: i64, modules: &[Module]) {
        let file = CacheFile {
            cache: CacheHeader {
                timestamp: dir_mtime,
                version: CACHE_VERSION,
            },
            modules: modules
                .iter()
                .map(|m| (m.filename.clone(), CachedModule::from_module(m)))
                .collect(),
        };

        match serde_json::to_string_pretty(&file) {
            Ok(content) => {
                if let Err(e) = write_private(&self.path, &content) {
                    warn!("Failed to save module cache: {}", e);
                }
            }
            Err(e) => {
                warn!("Failed to serialize module cache: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::module::testing::descriptor;

    fn sample_modules() -> Vec<Module> {
        let mut mm = descriptor(7, ModuleKind::Device, Priority::Recommended, "org.freedesktop.ModemManager1", "org.freedesktop.NetworkManager");
        mm.functions = ModuleFunctions::AUTHORIZATION;
        mm.systemd_name = "ModemManager.service".to_string();
        let mut nm = descriptor(3, ModuleKind::Connection, Priority::Normal, "org.freedesktop.NetworkManager", "org.freedesktop.ModemManager1");
        nm.requirement = Requirement::File;
        vec![
            Module::new(mm, "libmodem_mm07.so"),
            Module::new(nm, "libconn_nm09.so"),
        ]
    }

    #[test]
    fn test_round_trip_keeps_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(dir.path().join("modules.json"));
        let modules = sample_modules();
        cache.save(1234, &modules);

        let mut loaded = cache.load(1234).unwrap();
        loaded.sort_by(|a, b| a.filename.cmp(&b.filename));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].filename, "libconn_nm09.so");
        assert_eq!(loaded[0].shortname, "nm09");
        assert_eq!(loaded[0].descriptor, modules[1].descriptor);
        assert_eq!(loaded[1].descriptor, modules[0].descriptor);
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(dir.path().join("modules.json"));
        cache.save(1234, &sample_modules());
        assert!(cache.load(1235).is_none());
    }

    #[test]
    fn test_old_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.json");
        fs::write(
            &path,
            r#"{"cache":{"timestamp":5,"version":3},"modules":{"libmodem_a.so":{"identifier":1,"type":0,"requirement":2,"priority":1,"functions":0}}}"#,
        )
        .unwrap();
        assert!(ModuleCache::new(&path).load(5).is_none());
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.json");
        fs::write(
            &path,
            r#"{"cache":{"timestamp":5,"version":4},"modules":{
                "libmodem_a.so":{"identifier":1,"type":0,"requirement":2,"priority":1,"functions":0},
                "libmodem_b.so":{"identifier":2,"type":9,"requirement":2,"priority":1,"functions":0}}}"#,
        )
        .unwrap();
        let loaded = ModuleCache::new(&path).load(5).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].shortname, "a");
    }

    #[test]
    fn test_broken_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.json");
        fs::write(&path, "not json").unwrap();
        assert!(ModuleCache::new(&path).load(0).is_none());

        fs::write(&path, r#"{"cache":{"timestamp":0,"version":4},"modules":{}}"#).unwrap();
        assert!(ModuleCache::new(&path).load(0).is_none());
    }

    #[test]
    fn test_cache_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("modules.json");
        ModuleCache::new(&path).save(1, &sample_modules());
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
