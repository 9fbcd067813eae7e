//! Linux namespace isolation.
//!
//! Translates the configured namespace name set into the `clone(2)` flag
//! mask the manager forks with, and finishes namespace setup inside the
//! child: user-namespace ID maps, a fresh `/proc`, `/sys`, and the hostname.

use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use sandbox_common::config::{IsolationConfig, SandboxConfiguration};
use sandbox_common::error::Result;
use std::path::Path;

use crate::module::{Module, ModuleState};
use crate::syscall;

/// Maps the configured namespace names onto the kernel clone-flag mask.
/// The manager passes this mask to `clone(2)` when creating the child.
#[must_use]
pub fn clone_flags(isolation: &IsolationConfig) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    for name in &isolation.namespaces {
        flags |= match name.as_str() {
            "pid" => CloneFlags::CLONE_NEWPID,
            "net" => CloneFlags::CLONE_NEWNET,
            "ipc" => CloneFlags::CLONE_NEWIPC,
            "uts" => CloneFlags::CLONE_NEWUTS,
            "mount" => CloneFlags::CLONE_NEWNS,
            "user" => CloneFlags::CLONE_NEWUSER,
            _ => CloneFlags::empty(),
        };
    }
    flags
}

/// The namespaces module. Carries no parent-side kernel state; all of its
/// work happens in the child.
#[derive(Debug)]
pub struct NamespacesModule {
    state: ModuleState,
    user_ns_enabled: bool,
}

impl NamespacesModule {
    /// Creates the module in the uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            user_ns_enabled: false,
        }
    }

    /// Writes the user-namespace ID maps for the calling process.
    ///
    /// `setgroups` must be denied before the GID map is written or the
    /// kernel rejects the write; a failure there aborts before any map
    /// is written.
    fn apply_user_namespace(config: &SandboxConfiguration) -> Result<()> {
        syscall::write_setgroups("deny")?;

        let uid = &config.isolation.uid_map;
        let uid_map = format!("{} {} {}\n", uid.container_uid, uid.host_uid, uid.count);
        syscall::write_uid_map(&uid_map)?;
        tracing::debug!(map = %uid_map.trim_end(), "wrote uid_map");

        let gid = &config.isolation.gid_map;
        let gid_map = format!("{} {} {}\n", gid.container_gid, gid.host_gid, gid.count);
        syscall::write_gid_map(&gid_map)?;
        tracing::debug!(map = %gid_map.trim_end(), "wrote gid_map");

        Ok(())
    }
}

impl Default for NamespacesModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for NamespacesModule {
    fn name(&self) -> &'static str {
        "namespaces"
    }

    fn module_type(&self) -> &'static str {
        "isolation"
    }

    fn description(&self) -> &'static str {
        "Linux namespace isolation for PID, network, mount, UTS, IPC, and user namespaces"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, config: &SandboxConfiguration) -> Result<()> {
        self.user_ns_enabled = config.isolation.has_namespace("user");
        self.state = ModuleState::Initialized;
        tracing::info!(
            namespaces = ?config.isolation.namespaces,
            user_ns = self.user_ns_enabled,
            "namespaces module initialized"
        );
        Ok(())
    }

    fn apply_child(&mut self, config: &SandboxConfiguration) -> Result<()> {
        if self.user_ns_enabled {
            Self::apply_user_namespace(config)?;
        }

        if config.isolation.has_namespace("pid") {
            syscall::mount(
                Some(Path::new("proc")),
                Path::new("/proc"),
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None,
            )?;
        }

        if config.isolation.has_namespace("mount") {
            // /sys may be unavailable in nested or heavily confined
            // environments; the sandbox still works without it.
            if let Err(e) = syscall::mount(
                Some(Path::new("sysfs")),
                Path::new("/sys"),
                Some("sysfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None,
            ) {
                tracing::warn!(error = %e, "failed to mount /sys");
            }
        }

        if config.isolation.has_namespace("uts") {
            if let Err(e) = syscall::set_hostname(&config.sandbox.hostname) {
                tracing::warn!(error = %e, "failed to set hostname");
            }
        }

        self.state = ModuleState::Running;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.state = ModuleState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_common::config::IsolationConfig;

    fn isolation_with(namespaces: &[&str]) -> IsolationConfig {
        IsolationConfig {
            namespaces: namespaces.iter().map(|s| (*s).into()).collect(),
            ..IsolationConfig::default()
        }
    }

    #[test]
    fn all_six_names_map_to_flags() {
        let flags = clone_flags(&IsolationConfig::default());
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn subset_maps_to_subset() {
        let flags = clone_flags(&isolation_with(&["pid", "uts"]));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn empty_set_maps_to_no_flags() {
        let flags = clone_flags(&isolation_with(&[]));
        assert!(flags.is_empty());
    }

    #[test]
    fn lifecycle_states() {
        let config = SandboxConfiguration::default();
        let mut module = NamespacesModule::new();
        assert_eq!(module.state(), ModuleState::Uninitialized);

        module.initialize(&config).expect("initialize");
        assert_eq!(module.state(), ModuleState::Initialized);

        module.cleanup().expect("cleanup");
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut module = NamespacesModule::new();
        module.cleanup().expect("first");
        module.cleanup().expect("second");
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[test]
    fn initialize_records_user_namespace_selection() {
        let mut config = SandboxConfiguration::default();
        config.isolation = isolation_with(&["pid", "mount"]);

        let mut module = NamespacesModule::new();
        module.initialize(&config).expect("initialize");
        assert!(!module.user_ns_enabled);

        config.isolation = isolation_with(&["user"]);
        module.initialize(&config).expect("initialize");
        assert!(module.user_ns_enabled);
    }

    #[test]
    fn metadata() {
        let module = NamespacesModule::new();
        assert_eq!(module.name(), "namespaces");
        assert_eq!(module.module_type(), "isolation");
        assert!(module.dependencies().is_empty());
    }
}
