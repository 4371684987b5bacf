// Modem Manager Core - Module Registry
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Discovery of backend modules and ranking of compatible pairs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};

use super::backend::Backend;
use super::cache::ModuleCache;
use super::module::{are_compatible, compare_modules, compare_pairs, Module, ModuleDescriptor, ModuleKind, ModulePair, Requirement};
use crate::error::{CoreError, Result};
use crate::svcmanager::{ActivationTech, ServiceManager};

/// Builds a backend instance.
pub type BackendFactory = Box<dyn Fn() -> Backend + Send + Sync>;

/// Finds, describes and binds modules.
pub trait ModuleLoader: Send {
    /// Module file names available in `dir`.
    fn candidates(&self, dir: &Path) -> Vec<String> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read modules directory {}: {}", dir.display(), e);
                return Vec::new();
            }
        };
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".so") && (3..256).contains(&name.len()))
            .collect()
    }

    /// Static description of module `filename`, `None` if it is not a module.
    fn describe(&self, dir: &Path, filename: &str) -> Option<ModuleDescriptor>;

    /// Instantiate the backend of `module`.
    fn load(&self, module: &Module) -> Result<Backend>;
}

struct BuiltinModule {
    descriptor: ModuleDescriptor,
    factory: BackendFactory,
}

/// Loader serving modules compiled into the program.
#[derive(Default)]
pub struct BuiltinLoader {
    modules: BTreeMap<String, BuiltinModule>,
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `filename`.
    pub fn register(&mut self, filename: impl Into<String>, descriptor: ModuleDescriptor, factory: BackendFactory) {
        self.modules.insert(filename.into(), BuiltinModule { descriptor, factory });
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleLoader for BuiltinLoader {
    fn candidates(&self, _dir: &Path) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    fn describe(&self, _dir: &Path, filename: &str) -> Option<ModuleDescriptor> {
        self.modules.get(filename).map(|m| m.descriptor.clone())
    }

    fn load(&self, module: &Module) -> Result<Backend> {
        let builtin = self
            .modules
            .get(&module.filename)
            .ok_or_else(|| CoreError::ModuleRejected {
                module: module.shortname.clone(),
                reason: "not a builtin module".to_string(),
            })?;
        Ok((builtin.factory)())
    }
}

impl std::fmt::Debug for BuiltinLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinLoader")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Service state queries used to judge module applicability.
pub trait ServiceLookup {
    fn service_state(&self, unit: Option<&str>, bus_name: Option<&str>) -> bool;
    fn activation_tech(&self, unit: Option<&str>, bus_name: Option<&str>) -> ActivationTech;
}

impl ServiceLookup for ServiceManager {
    fn service_state(&self, unit: Option<&str>, bus_name: Option<&str>) -> bool {
        ServiceManager::service_state(self, unit, bus_name)
    }

    fn activation_tech(&self, unit: Option<&str>, bus_name: Option<&str>) -> ActivationTech {
        ServiceManager::activation_tech(self, unit, bus_name)
    }
}

/// Known modules and their compatible pairs, both ranked.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    modules: Vec<Module>,
    pairs: Vec<ModulePair>,
}

fn dir_mtime(dir: &Path) -> Option<i64> {
    let modified = fs::metadata(dir).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64)
}

fn scan(dir: &Path, loader: &dyn ModuleLoader) -> Vec<Module> {
    let modules: Vec<Module> = loader
        .candidates(dir)
        .into_iter()
        .filter_map(|filename| match loader.describe(dir, &filename) {
            Some(descriptor) => Some(Module::new(descriptor, &filename)),
            None => {
                debug!("{} is not a usable module", filename);
                None
            }
        })
        .collect();
    info!("Found {} modules", modules.len());
    modules
}

impl Registry {
    /// Discover modules in `dir`, reusing `cache` when it is current.
    pub fn build(
        dir: &Path,
        cache: &ModuleCache,
        loader: &dyn ModuleLoader,
        services: Option<&dyn ServiceLookup>,
    ) -> Result<Self> {
        let modules = match dir_mtime(dir) {
            Some(mtime) => match cache.load(mtime) {
                Some(modules) => {
                    debug!("Using {} cached modules", modules.len());
                    modules
                }
                None => {
                    let modules = scan(dir, loader);
                    cache.save(mtime, &modules);
                    modules
                }
            },
            None => scan(dir, loader),
        };
        Self::from_modules(modules, services)
    }

    /// Rank `modules` and pair the usable ones.
    pub fn from_modules(mut modules: Vec<Module>, services: Option<&dyn ServiceLookup>) -> Result<Self> {
        for module in modules.iter_mut() {
            annotate(module, services);
        }
        modules.sort_by(compare_modules);

        let mut pairs = Vec::new();
        for (d, device) in modules.iter().enumerate() {
            if device.kind() != ModuleKind::Device || !device.is_available() {
                continue;
            }
            for (c, connection) in modules.iter().enumerate() {
                if connection.kind() != ModuleKind::Connection || !connection.is_available() {
                    continue;
                }
                if are_compatible(&device.descriptor, &connection.descriptor) {
                    pairs.push(ModulePair::new(&modules, d, c));
                }
            }
        }
        pairs.sort_by(compare_pairs);

        if pairs.is_empty() {
            return Err(CoreError::NoCompatibleModules);
        }
        info!("{} compatible module pairs", pairs.len());
        Ok(Self { modules, pairs })
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn module(&self, index: usize) -> Option<&Module> {
        self.modules.get(index)
    }

    pub fn pairs(&self) -> &[ModulePair] {
        &self.pairs
    }

    /// Index of the module called `shortname`.
    pub fn find(&self, shortname: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.shortname == shortname)
    }

    /// Pick the pair to use given preferred module short names.
    pub fn choose_pair(&self, device: Option<&str>, connection: Option<&str>) -> Option<ModulePair> {
        let device = device.and_then(|name| self.find(name)).filter(|&i| self.modules[i].kind() == ModuleKind::Device);
        let connection = connection
            .and_then(|name| self.find(name))
            .filter(|&i| self.modules[i].kind() == ModuleKind::Connection);

        let chosen = match (device, connection) {
            (Some(d), Some(c)) => {
                if are_compatible(&self.modules[d].descriptor, &self.modules[c].descriptor) {
                    Some(ModulePair::new(&self.modules, d, c))
                } else {
                    let service = self.modules[d].service_name();
                    self.pairs
                        .iter()
                        .find(|p| self.modules[p.device].service_name() == service)
                        .copied()
                }
            }
            (None, Some(c)) => self.pairs.iter().find(|p| p.connection == c).copied(),
            (Some(d), None) => self.pairs.iter().find(|p| p.device == d).copied(),
            (None, None) => None,
        };
        chosen.or_else(|| self.pairs.first().copied())
    }

    pub fn set_recommended(&mut self, pair: ModulePair) {
        for module in self.modules.iter_mut() {
            module.recommended = false;
        }
        self.modules[pair.device].recommended = true;
        self.modules[pair.connection].recommended = true;
    }

    /// Mark the module called `shortname` as usable after its service started.
    pub fn mark_applicable(&mut self, shortname: &str) -> bool {
        match self.modules.iter_mut().find(|m| m.shortname == shortname) {
            Some(module) => {
                module.applicable = true;
                true
            }
            None => false,
        }
    }
}

fn annotate(module: &mut Module, services: Option<&dyn ServiceLookup>) {
    let unit = module.systemd_name().map(str::to_string);
    let bus_name = Some(module.service_name().to_string()).filter(|s| !s.is_empty());

    module.applicable = match module.descriptor.requirement {
        Requirement::Service => services
            .map(|s| s.service_state(unit.as_deref(), bus_name.as_deref()))
            .unwrap_or(false),
        Requirement::File => Path::new(module.service_name()).exists(),
        Requirement::None => true,
    };

    module.activation = if !module.applicable && module.descriptor.requirement == Requirement::Service {
        services
            .map(|s| s.activation_tech(unit.as_deref(), bus_name.as_deref()))
            .unwrap_or(ActivationTech::None)
    } else {
        ActivationTech::None
    };

    debug!(
        "Module {} ({}): applicable {}, activation {:?}",
        module.shortname,
        module.kind().label(),
        module.applicable,
        module.activation
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::testing::{FakeConnection, FakeDevice, SharedJournal};
    use crate::engine::module::testing::descriptor;
    use crate::engine::module::Priority;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MM: &str = "org.freedesktop.ModemManager1";
    const NM: &str = "org.freedesktop.NetworkManager";
    const OFONO: &str = "org.ofono";
    const CONNMAN: &str = "net.connman";

    struct Services {
        running: Vec<&'static str>,
        activatable: Vec<&'static str>,
    }

    impl ServiceLookup for Services {
        fn service_state(&self, _unit: Option<&str>, bus_name: Option<&str>) -> bool {
            bus_name.map(|n| self.running.contains(&n)).unwrap_or(false)
        }

        fn activation_tech(&self, _unit: Option<&str>, bus_name: Option<&str>) -> ActivationTech {
            match bus_name {
                Some(n) if self.activatable.contains(&n) => ActivationTech::Bus,
                _ => ActivationTech::None,
            }
        }
    }

    fn modules() -> Vec<Module> {
        vec![
            Module::new(descriptor(1, ModuleKind::Device, Priority::Recommended, MM, &format!("{};{}", NM, CONNMAN)), "libmodem_mm07.so"),
            Module::new(descriptor(2, ModuleKind::Device, Priority::Normal, OFONO, CONNMAN), "libmodem_ofono109.so"),
            Module::new(descriptor(3, ModuleKind::Connection, Priority::Recommended, NM, MM), "libconn_nm09.so"),
            Module::new(descriptor(4, ModuleKind::Connection, Priority::Normal, CONNMAN, &format!("{};{}", MM, OFONO)), "libconn_connman112.so"),
        ]
    }

    fn all_running() -> Services {
        Services {
            running: vec![MM, NM, OFONO, CONNMAN],
            activatable: vec![],
        }
    }

    #[test]
    fn test_pairs_are_ranked() {
        let services = all_running();
        let registry = Registry::from_modules(modules(), Some(&services)).unwrap();
        let names: Vec<(String, String)> = registry
            .pairs()
            .iter()
            .map(|p| {
                (
                    registry.modules()[p.device].shortname.clone(),
                    registry.modules()[p.connection].shortname.clone(),
                )
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("mm07".to_string(), "nm09".to_string()),
                ("mm07".to_string(), "connman112".to_string()),
                ("ofono109".to_string(), "connman112".to_string()),
            ]
        );
    }

    #[test]
    fn test_unavailable_modules_are_not_paired() {
        let services = Services {
            running: vec![OFONO, CONNMAN],
            activatable: vec![NM],
        };
        let registry = Registry::from_modules(modules(), Some(&services)).unwrap();
        let mm = registry.find("mm07").unwrap();
        assert!(!registry.modules()[mm].applicable);
        assert!(registry.pairs().iter().all(|p| p.device != mm));

        let nm = registry.find("nm09").unwrap();
        assert_eq!(registry.modules()[nm].activation, ActivationTech::Bus);
    }

    #[test]
    fn test_no_pairs_is_an_error() {
        let services = Services {
            running: vec![],
            activatable: vec![],
        };
        assert!(matches!(
            Registry::from_modules(modules(), Some(&services)),
            Err(CoreError::NoCompatibleModules)
        ));
    }

    #[test]
    fn test_file_requirement() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("pppd");
        fs::write(&marker, "").unwrap();

        let mut dev = descriptor(1, ModuleKind::Device, Priority::Normal, MM, "/nonexistent");
        dev.requirement = Requirement::None;
        dev.compatibility = marker.to_string_lossy().into_owned();
        let mut conn = descriptor(2, ModuleKind::Connection, Priority::Normal, &marker.to_string_lossy(), MM);
        conn.requirement = Requirement::File;

        let registry = Registry::from_modules(
            vec![Module::new(dev, "libmodem_mm.so"), Module::new(conn, "libconn_pppd.so")],
            None,
        )
        .unwrap();
        assert_eq!(registry.pairs().len(), 1);
    }

    #[test]
    fn test_preferred_pair_resolution() {
        let services = all_running();
        let registry = Registry::from_modules(modules(), Some(&services)).unwrap();
        let names = |pair: ModulePair| {
            (
                registry.modules()[pair.device].shortname.as_str(),
                registry.modules()[pair.connection].shortname.as_str(),
            )
        };

        let both = registry.choose_pair(Some("ofono109"), Some("connman112")).unwrap();
        assert_eq!(names(both), ("ofono109", "connman112"));

        let mismatch = registry.choose_pair(Some("ofono109"), Some("nm09")).unwrap();
        assert_eq!(names(mismatch), ("ofono109", "connman112"));

        let conn_only = registry.choose_pair(None, Some("connman112")).unwrap();
        assert_eq!(names(conn_only), ("mm07", "connman112"));

        let dev_only = registry.choose_pair(Some("ofono109"), None).unwrap();
        assert_eq!(names(dev_only), ("ofono109", "connman112"));

        let unknown = registry.choose_pair(Some("nothing"), None).unwrap();
        assert_eq!(names(unknown), ("mm07", "nm09"));
    }

    #[test]
    fn test_mark_applicable() {
        let services = Services {
            running: vec![MM],
            activatable: vec![NM],
        };
        let mut registry = Registry::from_modules(modules(), Some(&services)).unwrap();
        assert!(registry.mark_applicable("nm09"));
        assert!(registry.modules()[registry.find("nm09").unwrap()].applicable);
        assert!(!registry.mark_applicable("missing"));
    }

    #[test]
    fn test_build_scans_and_caches() {
        let dir = module_dir();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(cache_dir.path().join("modules.json"));

        let registry = Registry::build(dir.path(), &cache, &DiskLoader::default(), None).unwrap();
        assert_eq!(registry.modules().len(), 2);
        assert!(cache.path().exists());

        let mtime = dir_mtime(dir.path()).unwrap();
        assert_eq!(cache.load(mtime).map(|m| m.len()), Some(2));
    }

    #[test]
    fn test_unchanged_directory_is_not_rescanned() {
        let dir = module_dir();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = ModuleCache::new(cache_dir.path().join("modules.json"));
        let loader = DiskLoader::default();

        let first = Registry::build(dir.path(), &cache, &loader, None).unwrap();
        let described = loader.described.load(Ordering::SeqCst);
        assert_eq!(described, 2);

        let second = Registry::build(dir.path(), &cache, &loader, None).unwrap();
        assert_eq!(loader.described.load(Ordering::SeqCst), described);
        let names = |r: &Registry| r.modules().iter().map(|m| m.shortname.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), names(&second));
    }

    /// Directory holding two module files and one stray file.
    fn module_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("libmodem_mm07.so"), "").unwrap();
        fs::write(dir.path().join("libconn_nm09.so"), "").unwrap();
        fs::write(dir.path().join("README"), "").unwrap();
        dir
    }

    /// Describes module files by name and counts how often it was asked.
    #[derive(Default)]
    struct DiskLoader {
        described: AtomicUsize,
    }

    impl ModuleLoader for DiskLoader {
        fn describe(&self, _dir: &Path, filename: &str) -> Option<ModuleDescriptor> {
            self.described.fetch_add(1, Ordering::SeqCst);
            let mut d = match filename {
                "libmodem_mm07.so" => descriptor(1, ModuleKind::Device, Priority::Normal, MM, NM),
                "libconn_nm09.so" => descriptor(2, ModuleKind::Connection, Priority::Normal, NM, MM),
                _ => return None,
            };
            d.requirement = Requirement::None;
            Some(d)
        }

        fn load(&self, module: &Module) -> Result<Backend> {
            Err(CoreError::ModuleRejected {
                module: module.shortname.clone(),
                reason: "test".to_string(),
            })
        }
    }

    #[test]
    fn test_builtin_loader() {
        let journal = SharedJournal::default();
        let mut loader = BuiltinLoader::new();
        let device_journal = journal.clone();
        loader.register(
            "libmodem_fake.so",
            descriptor(1, ModuleKind::Device, Priority::Normal, MM, NM),
            Box::new(move || Backend::Device(Box::new(FakeDevice::new(device_journal.clone())))),
        );
        let conn_journal = journal.clone();
        loader.register(
            "libconn_fake.so",
            descriptor(2, ModuleKind::Connection, Priority::Normal, NM, MM),
            Box::new(move || Backend::Connection(Box::new(FakeConnection::new(conn_journal.clone())))),
        );

        let dir = Path::new("/nonexistent-modules");
        let mut names = loader.candidates(dir);
        names.sort();
        assert_eq!(names, vec!["libconn_fake.so", "libmodem_fake.so"]);

        let module = Module::new(loader.describe(dir, "libmodem_fake.so").unwrap(), "libmodem_fake.so");
        assert!(matches!(loader.load(&module), Ok(Backend::Device(_))));
    }
}
