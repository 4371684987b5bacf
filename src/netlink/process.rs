// Modem Manager Core - Socket Owner Lookup
// Copyright (C) 2026 Christos Daggas
// SPDX-License-Identifier: MIT

//! Resolves the process owning a socket inode through procfs.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Owner of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Maps socket inodes to owning processes.
pub trait ProcessResolver: Send {
    /// Forget state gathered for the previous dump.
    fn refresh(&mut self) {}
    fn resolve(&mut self, inode: u64) -> Option<ProcessInfo>;
}

/// Resolver scanning `/proc/<pid>/fd` of processes owned by one user.
#[derive(Debug)]
pub struct ProcfsResolver {
    root: PathBuf,
    uid: u32,
    inode_to_pid: HashMap<u64, u32>,
    scanned: bool,
}

impl ProcfsResolver {
    /// Resolver for processes of `uid`. Root sees every process.
    pub fn new(uid: u32) -> Self {
        Self::with_root("/proc", uid)
    }

    pub fn with_root(root: impl Into<PathBuf>, uid: u32) -> Self {
        Self {
            root: root.into(),
            uid,
            inode_to_pid: HashMap::new(),
            scanned: false,
        }
    }

    /// Build a mapping from socket inodes to PIDs.
    fn build_inode_map(&mut self) {
        self.inode_to_pid.clear();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Failed to read {}: {}", self.root.display(), e);
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let pid: u32 = match name.to_string_lossy().parse() {
                Ok(p) => p,
                Err(_) => continue,
            };

            if self.uid != 0 {
                match entry.metadata() {
                    Ok(meta) if meta.uid() == self.uid => {}
                    _ => continue,
                }
            }

            let fds = match fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(_) => continue,
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if let Some(inode) = parse_socket_link(&link.to_string_lossy()) {
                        self.inode_to_pid.insert(inode, pid);
                    }
                }
            }
        }

        self.scanned = true;
    }

    fn process_name(&self, pid: u32) -> String {
        let dir = self.root.join(pid.to_string());
        if let Ok(exe) = fs::read_link(dir.join("exe")) {
            if let Some(name) = exe.file_name() {
                return name.to_string_lossy().into_owned();
            }
        }
        read_comm(&dir).unwrap_or_else(|| "unknown".to_string())
    }
}

impl ProcessResolver for ProcfsResolver {
    fn refresh(&mut self) {
        self.scanned = false;
    }

    fn resolve(&mut self, inode: u64) -> Option<ProcessInfo> {
        if !self.scanned {
            self.build_inode_map();
        }
        let pid = *self.inode_to_pid.get(&inode)?;
        Some(ProcessInfo {
            pid,
            name: self.process_name(pid),
        })
    }
}

fn read_comm(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join("comm"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract the inode from a `socket:[12345]` link target.
fn parse_socket_link(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_parse_socket_link() {
        assert_eq!(parse_socket_link("socket:[12345]"), Some(12345));
        assert_eq!(parse_socket_link("pipe:[12345]"), None);
        assert_eq!(parse_socket_link("socket:[abc]"), None);
    }

    #[test]
    fn test_resolves_from_fake_procfs() {
        let root = tempfile::tempdir().unwrap();
        let proc_dir = root.path().join("321");
        fs::create_dir_all(proc_dir.join("fd")).unwrap();
        fs::write(proc_dir.join("comm"), "curl\n").unwrap();
        symlink("socket:[777]", proc_dir.join("fd").join("3")).unwrap();
        symlink("/dev/null", proc_dir.join("fd").join("0")).unwrap();
        fs::create_dir_all(root.path().join("self")).unwrap();

        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        let mut resolver = ProcfsResolver::with_root(root.path(), uid);
        assert_eq!(
            resolver.resolve(777),
            Some(ProcessInfo { pid: 321, name: "curl".to_string() })
        );
        assert_eq!(resolver.resolve(778), None);
    }

    #[test]
    fn test_refresh_rescans() {
        let root = tempfile::tempdir().unwrap();
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        let mut resolver = ProcfsResolver::with_root(root.path(), uid);
        assert_eq!(resolver.resolve(9), None);

        let proc_dir = root.path().join("55");
        fs::create_dir_all(proc_dir.join("fd")).unwrap();
        fs::write(proc_dir.join("comm"), "wget").unwrap();
        symlink("socket:[9]", proc_dir.join("fd").join("4")).unwrap();
        assert_eq!(resolver.resolve(9), None);

        resolver.refresh();
        assert_eq!(resolver.resolve(9).map(|p| p.pid), Some(55));
    }
}
