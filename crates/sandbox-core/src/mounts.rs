//! Bind-mount management.
//!
//! Applies the configured bind mounts in declaration order inside the
//! child's mount namespace. Targets are resolved against the pivoted root,
//! so this module depends on `rootfs` having run first. A source that does
//! not exist on the host is created as a directory — a deliberate
//! convenience for scratch mounts.

use nix::mount::{MntFlags, MsFlags};
use sandbox_common::config::{BindMount, SandboxConfiguration};
use sandbox_common::error::Result;
use std::path::PathBuf;

use crate::module::{Module, ModuleState};
use crate::syscall;

/// One applied bind mount, recorded for reverse-order cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMount {
    /// Host-side source.
    pub source: PathBuf,
    /// Target inside the new root.
    pub target: PathBuf,
    /// Mount flags used for the initial bind.
    pub flags: MsFlags,
    /// Whether a read-only remount was requested.
    pub read_only: bool,
}

/// The bind-mounts module.
#[derive(Debug)]
pub struct MountsModule {
    state: ModuleState,
    configured: usize,
    active_mounts: Vec<ActiveMount>,
}

impl MountsModule {
    /// Creates the module in the uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            configured: 0,
            active_mounts: Vec::new(),
        }
    }

    /// Mounts applied so far, in application order.
    #[must_use]
    pub fn active_mounts(&self) -> &[ActiveMount] {
        &self.active_mounts
    }

    fn apply_bind_mount(&mut self, mount: &BindMount) -> Result<()> {
        tracing::debug!(
            source = %mount.source.display(),
            target = %mount.target.display(),
            read_only = mount.read_only,
            "applying bind mount"
        );

        if !syscall::exists(&mount.source) {
            tracing::warn!(
                source = %mount.source.display(),
                "bind mount source does not exist, creating"
            );
            syscall::mkdir_recursive(&mount.source)?;
        }

        syscall::mkdir_recursive(&mount.target)?;

        syscall::mount(
            Some(mount.source.as_path()),
            &mount.target,
            None,
            MsFlags::MS_BIND,
            None,
        )?;

        if mount.read_only {
            // The bind itself succeeded; a failed read-only remount leaves
            // the target writable, which is degraded but functional.
            if let Err(e) = syscall::mount(
                None,
                &mount.target,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None,
            ) {
                tracing::warn!(
                    target = %mount.target.display(),
                    error = %e,
                    "failed to remount read-only"
                );
            }
        }

        self.active_mounts.push(ActiveMount {
            source: mount.source.clone(),
            target: mount.target.clone(),
            flags: MsFlags::MS_BIND,
            read_only: mount.read_only,
        });

        Ok(())
    }
}

impl Default for MountsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for MountsModule {
    fn name(&self) -> &'static str {
        "mounts"
    }

    fn module_type(&self) -> &'static str {
        "filesystem"
    }

    fn description(&self) -> &'static str {
        "Ordered bind mounts with optional read-only remount"
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["rootfs"]
    }

    fn is_enabled(&self) -> bool {
        // Nothing configured means nothing to do in any later phase.
        self.state == ModuleState::Uninitialized || self.configured > 0
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, config: &SandboxConfiguration) -> Result<()> {
        self.configured = config.mounts.bind_mounts.len();
        for mount in &config.mounts.bind_mounts {
            tracing::debug!(
                source = %mount.source.display(),
                target = %mount.target.display(),
                read_only = mount.read_only,
                "configured bind mount"
            );
        }
        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&mut self, config: &SandboxConfiguration) -> Result<()> {
        for mount in &config.mounts.bind_mounts {
            self.apply_bind_mount(mount)?;
        }
        self.state = ModuleState::Running;
        tracing::info!(count = self.active_mounts.len(), "bind mounts applied");
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        for mount in self.active_mounts.iter().rev() {
            tracing::debug!(target = %mount.target.display(), "unmounting");
            if let Err(e) = syscall::unmount(&mount.target, MntFlags::empty()) {
                tracing::warn!(target = %mount.target.display(), error = %e, "unmount failed");
            }
        }
        self.active_mounts.clear();
        self.state = ModuleState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mount_list_leaves_active_mounts_empty() {
        let mut config = SandboxConfiguration::default();
        config.mounts.bind_mounts.clear();

        let mut module = MountsModule::new();
        module.initialize(&config).expect("initialize");
        module.apply_child(&config).expect("apply_child");

        assert!(module.active_mounts().is_empty());
        assert_eq!(module.state(), ModuleState::Running);
    }

    #[test]
    fn disabled_when_initialized_with_no_mounts() {
        let mut config = SandboxConfiguration::default();
        config.mounts.bind_mounts.clear();

        let mut module = MountsModule::new();
        assert!(module.is_enabled(), "enabled before initialize");

        module.initialize(&config).expect("initialize");
        assert!(!module.is_enabled(), "disabled with nothing configured");
    }

    #[test]
    fn enabled_with_configured_mounts() {
        let config = SandboxConfiguration::default();
        let mut module = MountsModule::new();
        module.initialize(&config).expect("initialize");
        assert!(module.is_enabled());
    }

    #[test]
    fn cleanup_clears_records_and_is_idempotent() {
        let mut module = MountsModule::new();
        module.active_mounts.push(ActiveMount {
            source: "/tmp".into(),
            target: "/nonexistent/sandbox/mount-target".into(),
            flags: MsFlags::MS_BIND,
            read_only: false,
        });

        module.cleanup().expect("first cleanup");
        assert!(module.active_mounts().is_empty());
        assert_eq!(module.state(), ModuleState::Stopped);

        module.cleanup().expect("second cleanup");
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[test]
    fn depends_on_rootfs() {
        let module = MountsModule::new();
        assert_eq!(module.dependencies(), vec!["rootfs"]);
    }

    #[test]
    fn metadata() {
        let module = MountsModule::new();
        assert_eq!(module.name(), "mounts");
        assert_eq!(module.module_type(), "filesystem");
    }
}
