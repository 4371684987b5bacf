// Modem Manager Core - Modules
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Backend module descriptors, compatibility and ranking.

use std::cmp::Ordering;

use crate::svcmanager::ActivationTech;

/// Which half of a pair a module implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Device,
    Connection,
}

impl ModuleKind {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(ModuleKind::Device),
            1 => Some(ModuleKind::Connection),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            ModuleKind::Device => 0,
            ModuleKind::Connection => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModuleKind::Device => "device",
            ModuleKind::Connection => "connection",
        }
    }
}

/// What must be present for a module to work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// The service named by the module must run.
    Service,
    /// The path held in the service name must exist.
    File,
    None,
}

impl Requirement {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Requirement::Service),
            1 => Some(Requirement::File),
            2 => Some(Requirement::None),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Requirement::Service => 0,
            Requirement::File => 1,
            Requirement::None => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    Recommended,
}

impl Priority {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::Recommended),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::Recommended => 2,
        }
    }
}

bitmask! {
    pub struct ModuleFunctions: u32 {
        /// Opening the module needs user authorization.
        const AUTHORIZATION = 1 << 0;
    }
}

/// Static description a module reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub identifier: u32,
    pub kind: ModuleKind,
    pub requirement: Requirement,
    pub priority: Priority,
    pub functions: ModuleFunctions,
    pub description: String,
    /// Bus name of the service, or a path for file requirements.
    pub service_name: String,
    pub systemd_name: String,
    /// Semicolon separated service names this module works with.
    pub compatibility: String,
}

/// Module known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub descriptor: ModuleDescriptor,
    pub filename: String,
    pub shortname: String,
    pub applicable: bool,
    pub recommended: bool,
    pub activation: ActivationTech,
}

impl Module {
    pub fn new(descriptor: ModuleDescriptor, filename: &str) -> Self {
        Self {
            shortname: short_name(filename).unwrap_or_else(|| filename.to_string()),
            filename: filename.to_string(),
            descriptor,
            applicable: false,
            recommended: false,
            activation: ActivationTech::None,
        }
    }

    pub fn identifier(&self) -> u32 {
        self.descriptor.identifier
    }

    pub fn kind(&self) -> ModuleKind {
        self.descriptor.kind
    }

    pub fn priority(&self) -> Priority {
        self.descriptor.priority
    }

    pub fn service_name(&self) -> &str {
        &self.descriptor.service_name
    }

    /// Init unit name, when one is declared.
    pub fn systemd_name(&self) -> Option<&str> {
        Some(self.descriptor.systemd_name.as_str()).filter(|s| !s.is_empty())
    }

    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    /// Usable now, or startable later.
    pub fn is_available(&self) -> bool {
        self.applicable || self.activation != ActivationTech::None
    }
}

/// Short name of a module file: `libmodem_mm07.so` gives `mm07`.
pub fn short_name(filename: &str) -> Option<String> {
    let start = filename.find('_')? + 1;
    let end = start + filename[start..].find(".so")?;
    Some(filename[start..end].to_string()).filter(|s| !s.is_empty())
}

fn lists_service(compatibility: &str, service: &str) -> bool {
    compatibility
        .split(';')
        .map(str::trim)
        .any(|entry| !entry.is_empty() && entry.eq_ignore_ascii_case(service))
}

/// Whether two modules name each other's service in their compatibility lists.
pub fn are_compatible(a: &ModuleDescriptor, b: &ModuleDescriptor) -> bool {
    if a.service_name.is_empty() || b.service_name.is_empty() {
        return false;
    }
    if a.compatibility.is_empty() || b.compatibility.is_empty() {
        return false;
    }
    lists_service(&a.compatibility, &b.service_name) && lists_service(&b.compatibility, &a.service_name)
}

/// Order modules by priority, then identifier, both descending.
pub fn compare_modules(a: &Module, b: &Module) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| b.identifier().cmp(&a.identifier()))
}

/// Compatible device and connection module, as indexes into the module list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModulePair {
    pub device: usize,
    pub connection: usize,
    priority: u32,
    identifier: u64,
}

impl ModulePair {
    pub fn new(modules: &[Module], device: usize, connection: usize) -> Self {
        let (d, c) = (&modules[device], &modules[connection]);
        Self {
            device,
            connection,
            priority: d.priority().as_raw() + c.priority().as_raw(),
            identifier: d.identifier() as u64 + c.identifier() as u64,
        }
    }
}

/// Order pairs by summed priority, then summed identifier, both descending.
pub fn compare_pairs(a: &ModulePair, b: &ModulePair) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.identifier.cmp(&a.identifier))
}


#[cfg(test)]
mod tests {
    use super::testing::descriptor;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("libmodem_mm07.so").as_deref(), Some("mm07"));
        assert_eq!(short_name("libconn_nm09.so").as_deref(), Some("nm09"));
        assert_eq!(short_name("libmodem.so"), None);
        assert_eq!(short_name("lib_.so"), None);
    }

    #[test]
    fn test_compatibility_needs_both_directions() {
        let mm = descriptor(1, ModuleKind::Device, Priority::Normal, "org.freedesktop.ModemManager1", "org.freedesktop.NetworkManager;");
        let nm = descriptor(2, ModuleKind::Connection, Priority::Normal, "org.freedesktop.NetworkManager", "org.freedesktop.ModemManager1;org.ofono;");
        let lonely = descriptor(3, ModuleKind::Connection, Priority::Normal, "org.example.Conn", "org.freedesktop.ModemManager1;");

        assert!(are_compatible(&mm, &nm));
        assert!(are_compatible(&nm, &mm));
        assert!(!are_compatible(&mm, &lonely));
        assert!(!are_compatible(&lonely, &mm));
    }

    #[test]
    fn test_compatibility_ignores_case() {
        let a = descriptor(1, ModuleKind::Device, Priority::Low, "org.A", "ORG.B");
        let b = descriptor(2, ModuleKind::Connection, Priority::Low, "org.b", "org.a");
        assert!(are_compatible(&a, &b));
    }

    #[test]
    fn test_empty_fields_never_compatible() {
        let a = descriptor(1, ModuleKind::Device, Priority::Low, "", "org.b");
        let b = descriptor(2, ModuleKind::Connection, Priority::Low, "org.b", "");
        let c = descriptor(3, ModuleKind::Connection, Priority::Low, "org.c", ";;");
        assert!(!are_compatible(&a, &b));
        assert!(!are_compatible(&b, &c));
        assert!(!are_compatible(&c, &c));
    }

    #[test]
    fn test_module_order() {
        let mut modules = vec![
            Module::new(descriptor(5, ModuleKind::Device, Priority::Low, "a", "b"), "libmodem_a.so"),
            Module::new(descriptor(1, ModuleKind::Device, Priority::Recommended, "a", "b"), "libmodem_b.so"),
            Module::new(descriptor(9, ModuleKind::Device, Priority::Recommended, "a", "b"), "libmodem_c.so"),
        ];
        modules.sort_by(compare_modules);
        let ids: Vec<u32> = modules.iter().map(Module::identifier).collect();
        assert_eq!(ids, vec![9, 1, 5]);
    }

    #[test]
    fn test_pair_order() {
        let modules = vec![
            Module::new(descriptor(1, ModuleKind::Device, Priority::Recommended, "a", "b"), "libmodem_a.so"),
            Module::new(descriptor(2, ModuleKind::Device, Priority::Normal, "a", "b"), "libmodem_b.so"),
            Module::new(descriptor(3, ModuleKind::Connection, Priority::Normal, "b", "a"), "libconn_c.so"),
            Module::new(descriptor(4, ModuleKind::Connection, Priority::Low, "b", "a"), "libconn_d.so"),
        ];
        let mut pairs = vec![
            ModulePair::new(&modules, 1, 3),
            ModulePair::new(&modules, 0, 3),
            ModulePair::new(&modules, 1, 2),
            ModulePair::new(&modules, 0, 2),
        ];
        pairs.sort_by(compare_pairs);
        let order: Vec<(usize, usize)> = pairs.iter().map(|p| (p.device, p.connection)).collect();
        assert_eq!(order, vec![(0, 2), (1, 2), (0, 3), (1, 3)]);
    }

    fn service_name() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["org.a", "org.b", "org.c", "ORG.A", ""]).prop_map(str::to_string)
    }

    fn compat_list() -> impl Strategy<Value = String> {
        prop::collection::vec(service_name(), 0..4).prop_map(|v| v.join(";"))
    }

    proptest! {
        #[test]
        fn prop_compatibility_is_symmetric(
            sa in service_name(), ca in compat_list(),
            sb in service_name(), cb in compat_list(),
        ) {
            let a = descriptor(1, ModuleKind::Device, Priority::Low, &sa, &ca);
            let b = descriptor(2, ModuleKind::Connection, Priority::Low, &sb, &cb);
            prop_assert_eq!(are_compatible(&a, &b), are_compatible(&b, &a));
        }

        #[test]
        fn prop_pair_order_is_total(ids in prop::collection::vec((0u32..50, 0u32..3), 2..8)) {
            let modules: Vec<Module> = ids
                .iter()
                .enumerate()
                .map(|(i, (id, prio))| {
                    let kind = if i % 2 == 0 { ModuleKind::Device } else { ModuleKind::Connection };
                    let prio = Priority::from_raw(*prio).unwrap_or(Priority::Low);
                    Module::new(descriptor(*id, kind, prio, "a", "a"), "libx_y.so")
                })
                .collect();
            let mut pairs = Vec::new();
            for d in (0..modules.len()).step_by(2) {
                for c in (1..modules.len()).step_by(2) {
                    pairs.push(ModulePair::new(&modules, d, c));
                }
            }
            pairs.sort_by(compare_pairs);
            for w in pairs.windows(2) {
                prop_assert!(compare_pairs(&w[0], &w[1]) != Ordering::Greater);
                prop_assert!(w[0].priority >= w[1].priority);
            }
        }
    }
}
