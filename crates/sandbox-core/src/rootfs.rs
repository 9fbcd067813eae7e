//! Root filesystem management.
//!
//! Verifies (or bootstraps) the configured rootfs in the parent, then
//! performs the pivot-root dance in the child: bind the new root onto
//! itself, `pivot_root(2)`, detach the old root, and mount the essential
//! pseudo-filesystems inside the new root.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{MntFlags, MsFlags};
use sandbox_common::config::SandboxConfiguration;
use sandbox_common::constants::BOOTSTRAP_MIRROR;
use sandbox_common::error::{Result, SandboxError};

use crate::module::{Module, ModuleState};
use crate::syscall;

/// First-level directories every usable root filesystem needs.
const REQUIRED_DIRS: &[&str] = &[
    "/bin", "/etc", "/home", "/lib", "/lib64", "/media", "/mnt", "/opt", "/root", "/sbin",
    "/srv", "/tmp", "/usr", "/var",
];

/// Mount point for the old root inside the new one, detached after pivot.
const OLD_ROOT: &str = "/oldroot";

/// The root filesystem module.
#[derive(Debug)]
pub struct RootFsModule {
    state: ModuleState,
    root_path: PathBuf,
}

impl RootFsModule {
    /// Creates the module in the uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            root_path: PathBuf::new(),
        }
    }

    /// Path of the root filesystem recorded at initialization.
    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Bootstraps the rootfs with debootstrap. Requires the helper on the
    /// host and network access to the mirror.
    fn bootstrap(config: &SandboxConfiguration) -> Result<()> {
        tracing::info!(
            distro = %config.sandbox.distro,
            release = %config.sandbox.release,
            path = %config.sandbox.rootfs_path.display(),
            "bootstrapping rootfs"
        );

        let status = Command::new("debootstrap")
            .arg("--arch=amd64")
            .arg("--variant=minbase")
            .arg(&config.sandbox.release)
            .arg(&config.sandbox.rootfs_path)
            .arg(BOOTSTRAP_MIRROR)
            .status()
            .map_err(|e| SandboxError::Module {
                module: "rootfs",
                message: format!("failed to spawn debootstrap: {e}"),
            })?;

        if !status.success() {
            return Err(SandboxError::Module {
                module: "rootfs",
                message: format!("debootstrap failed with status {status}"),
            });
        }

        tracing::info!("bootstrap completed");
        Ok(())
    }

    /// Ensures the minimal FHS skeleton exists under the rootfs. Missing
    /// directories are created; existing ones are left alone.
    fn ensure_fhs_skeleton(&self) -> Result<()> {
        for dir in REQUIRED_DIRS {
            let full = self.root_path.join(dir.trim_start_matches('/'));
            if !syscall::is_directory(&full) {
                syscall::mkdir_recursive(&full)?;
            }
        }
        Ok(())
    }

    /// Binds the new root onto itself and pivots into it. The recursive
    /// bind is required: `pivot_root` insists that the new root is a mount
    /// point distinct from the current root's.
    fn do_pivot_root(&self) -> Result<()> {
        syscall::mount(
            Some(&self.root_path),
            &self.root_path,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )?;

        let put_old = self.root_path.join(OLD_ROOT.trim_start_matches('/'));
        syscall::pivot_root(&self.root_path, &put_old)?;

        std::env::set_current_dir("/").map_err(|e| SandboxError::Io {
            path: "/".into(),
            source: e,
        })?;

        Ok(())
    }

    /// Mounts `/proc`, `/sys`, and a tmpfs `/dev` inside the new root.
    /// `/proc` is required; the other two are best-effort.
    fn mount_essential_filesystems(&self) -> Result<()> {
        syscall::mount(
            Some(Path::new("proc")),
            Path::new("/proc"),
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None,
        )?;

        if let Err(e) = syscall::mount(
            Some(Path::new("sysfs")),
            Path::new("/sys"),
            Some("sysfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None,
        ) {
            tracing::warn!(error = %e, "failed to mount /sys");
        }

        if let Err(e) = syscall::mount(
            Some(Path::new("tmpfs")),
            Path::new("/dev"),
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755"),
        ) {
            tracing::warn!(error = %e, "failed to mount /dev");
        }

        Ok(())
    }
}

impl Default for RootFsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for RootFsModule {
    fn name(&self) -> &'static str {
        "rootfs"
    }

    fn module_type(&self) -> &'static str {
        "filesystem"
    }

    fn description(&self) -> &'static str {
        "Root filesystem preparation via pivot_root, with optional debootstrap"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, config: &SandboxConfiguration) -> Result<()> {
        self.root_path = config.sandbox.rootfs_path.clone();
        tracing::debug!(path = %self.root_path.display(), "rootfs module initializing");

        if !syscall::exists(&self.root_path) && config.sandbox.auto_bootstrap {
            Self::bootstrap(config)?;
        }

        if !syscall::exists(&self.root_path) {
            return Err(SandboxError::Module {
                module: "rootfs",
                message: format!("rootfs does not exist: {}", self.root_path.display()),
            });
        }

        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&mut self, _config: &SandboxConfiguration) -> Result<()> {
        tracing::info!(path = %self.root_path.display(), "switching root filesystem");

        self.ensure_fhs_skeleton()?;

        let put_old = self.root_path.join(OLD_ROOT.trim_start_matches('/'));
        syscall::mkdir_recursive(&put_old)?;

        self.do_pivot_root()?;

        // The old root stays visible at /oldroot until lazily detached;
        // a failure leaves it mounted but harmless.
        if let Err(e) = syscall::unmount(Path::new(OLD_ROOT), MntFlags::MNT_DETACH) {
            tracing::warn!(error = %e, "failed to detach old root");
        }

        self.mount_essential_filesystems()?;

        self.state = ModuleState::Running;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.state = ModuleState::Stopped;
        Ok(())
    }
}
