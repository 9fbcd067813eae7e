//! Cgroup v2 resource control.
//!
//! Creates a per-instance subtree named `sandbox-<name>-<parent-pid>` under
//! the unified hierarchy, writes the memory, CPU, and PID limits during
//! parent-side initialization, and enrolls the child into the cgroup before
//! it starts consuming resources.

use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use sandbox_common::config::SandboxConfiguration;
use sandbox_common::constants::CGROUP_V2_PATH;
use sandbox_common::error::Result;

use crate::module::{Module, ModuleState};
use crate::syscall;

/// `cpu.max` period in microseconds.
const CPU_PERIOD_US: u64 = 100_000;

/// The cgroups module. Owns the cgroup directory it creates and removes it
/// again at cleanup.
#[derive(Debug)]
pub struct CgroupsModule {
    state: ModuleState,
    hierarchy: PathBuf,
    cgroup_name: String,
    created: Option<PathBuf>,
}

impl CgroupsModule {
    /// Creates the module against the system hierarchy at
    /// [`CGROUP_V2_PATH`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_hierarchy(PathBuf::from(CGROUP_V2_PATH))
    }

    /// Creates the module against an alternate hierarchy root. Tests point
    /// this at a scratch directory; attribute writes become plain file
    /// writes there.
    #[must_use]
    pub fn with_hierarchy(hierarchy: PathBuf) -> Self {
        Self {
            state: ModuleState::Uninitialized,
            hierarchy,
            cgroup_name: String::new(),
            created: None,
        }
    }

    /// Full path of the cgroup directory, once created.
    #[must_use]
    pub fn cgroup_path(&self) -> Option<&Path> {
        self.created.as_deref()
    }

    /// Name of the per-instance cgroup.
    #[must_use]
    pub fn cgroup_name(&self) -> &str {
        &self.cgroup_name
    }

    fn write_attr(&self, attribute: &str, value: &str) -> Result<()> {
        syscall::cgroup_write(&self.hierarchy, &self.cgroup_name, attribute, value)
    }

    fn apply_memory_limits(&self, config: &SandboxConfiguration) -> Result<()> {
        let memory_bytes = config.resources.memory_mb * 1024 * 1024;
        self.write_attr("memory.max", &memory_bytes.to_string())?;
        tracing::debug!(memory_mb = config.resources.memory_mb, "memory limit set");

        // Soft pressure threshold at 80% of the hard limit.
        if let Err(e) = self.write_attr("memory.high", &(memory_bytes * 8 / 10).to_string()) {
            tracing::warn!(error = %e, "failed to set memory.high");
        }

        if !config.resources.enable_swap {
            if let Err(e) = self.write_attr("memory.swap.max", "0") {
                tracing::warn!(error = %e, "failed to set memory.swap.max");
            }
        }

        Ok(())
    }

    fn apply_cpu_limits(&self, config: &SandboxConfiguration) -> Result<()> {
        // cpu.max takes "<quota> <period>" in microseconds; a quota of
        // percent * 1000 against a 100ms period yields percent% of one CPU.
        let quota_us = config.resources.cpu_quota_percent * 1000;
        self.write_attr("cpu.max", &format!("{quota_us} {CPU_PERIOD_US}"))?;
        tracing::debug!(
            cpu_quota_percent = config.resources.cpu_quota_percent,
            "cpu quota set"
        );
        Ok(())
    }

    fn apply_pid_limits(&self, config: &SandboxConfiguration) -> Result<()> {
        if config.resources.max_pids > 0 {
            self.write_attr("pids.max", &config.resources.max_pids.to_string())?;
            tracing::debug!(max_pids = config.resources.max_pids, "pid limit set");
        }
        Ok(())
    }
}

impl Default for CgroupsModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CgroupsModule {
    fn name(&self) -> &'static str {
        "cgroups"
    }

    fn module_type(&self) -> &'static str {
        "isolation"
    }

    fn description(&self) -> &'static str {
        "Cgroup v2 resource limits for CPU, memory, and PID counts"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, config: &SandboxConfiguration) -> Result<()> {
        self.cgroup_name = format!(
            "sandbox-{}-{}",
            config.sandbox.name,
            std::process::id()
        );
        let full_path = syscall::cgroup_path(&self.hierarchy, &self.cgroup_name);
        tracing::info!(path = %full_path.display(), "creating cgroup");

        syscall::cgroup_create(&self.hierarchy, &self.cgroup_name)?;
        self.created = Some(full_path);

        self.apply_memory_limits(config)?;
        self.apply_cpu_limits(config)?;
        self.apply_pid_limits(config)?;

        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn prepare_child(&mut self, _config: &SandboxConfiguration, child_pid: Pid) -> Result<()> {
        tracing::debug!(pid = child_pid.as_raw(), "enrolling child into cgroup");
        syscall::cgroup_add_pid(&self.hierarchy, &self.cgroup_name, child_pid)?;
        self.state = ModuleState::Running;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.created.take().is_some() {
            if let Err(e) = syscall::cgroup_remove(&self.hierarchy, &self.cgroup_name) {
                tracing::warn!(error = %e, cgroup = %self.cgroup_name, "failed to remove cgroup");
            }
        }
        self.state = ModuleState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_common::config::SandboxConfiguration;

    fn module_in(dir: &Path) -> CgroupsModule {
        CgroupsModule::with_hierarchy(dir.to_path_buf())
    }

    fn read_attr(module: &CgroupsModule, attr: &str) -> String {
        let path = module.cgroup_path().expect("cgroup created").join(attr);
        std::fs::read_to_string(path).expect("attribute readable")
    }

    #[test]
    fn initialize_creates_cgroup_and_writes_limits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = module_in(dir.path());
        let config = SandboxConfiguration::default();

        module.initialize(&config).expect("initialize");
        assert_eq!(module.state(), ModuleState::Initialized);

        let expected_name = format!("sandbox-sandbox-default-{}", std::process::id());
        assert_eq!(module.cgroup_name(), expected_name);

        assert_eq!(
            read_attr(&module, "memory.max"),
            (512u64 * 1024 * 1024).to_string()
        );
        assert_eq!(
            read_attr(&module, "memory.high"),
            (512u64 * 1024 * 1024 * 8 / 10).to_string()
        );
        assert_eq!(read_attr(&module, "memory.swap.max"), "0");
        assert_eq!(read_attr(&module, "cpu.max"), "50000 100000");
        assert_eq!(read_attr(&module, "pids.max"), "100");
    }

    #[test]
    fn full_cpu_quota_writes_equal_quota_and_period() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = module_in(dir.path());
        let mut config = SandboxConfiguration::default();
        config.resources.cpu_quota_percent = 100;

        module.initialize(&config).expect("initialize");
        assert_eq!(read_attr(&module, "cpu.max"), "100000 100000");
    }

    #[test]
    fn zero_max_pids_omits_the_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = module_in(dir.path());
        let mut config = SandboxConfiguration::default();
        config.resources.max_pids = 0;

        module.initialize(&config).expect("initialize");
        let pids_max = module.cgroup_path().expect("created").join("pids.max");
        assert!(!pids_max.exists(), "pids.max should not be written");
    }

    #[test]
    fn swap_enabled_skips_swap_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = module_in(dir.path());
        let mut config = SandboxConfiguration::default();
        config.resources.enable_swap = true;

        module.initialize(&config).expect("initialize");
        let swap_max = module.cgroup_path().expect("created").join("memory.swap.max");
        assert!(!swap_max.exists(), "memory.swap.max should not be written");
    }

    #[test]
    fn prepare_child_enrolls_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = module_in(dir.path());
        let config = SandboxConfiguration::default();

        module.initialize(&config).expect("initialize");
        module
            .prepare_child(&config, Pid::from_raw(4321))
            .expect("prepare_child");
        assert_eq!(module.state(), ModuleState::Running);
        assert_eq!(read_attr(&module, "cgroup.procs"), "4321");
    }

    #[test]
    fn cleanup_is_idempotent_and_forgets_the_cgroup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = module_in(dir.path());
        let config = SandboxConfiguration::default();

        module.initialize(&config).expect("initialize");
        module.cleanup().expect("first cleanup");
        assert_eq!(module.state(), ModuleState::Stopped);
        assert!(module.cgroup_path().is_none());

        module.cleanup().expect("second cleanup");
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[test]
    fn initialize_fails_when_hierarchy_is_not_writable() {
        let mut module = CgroupsModule::with_hierarchy(PathBuf::from(
            "/nonexistent/sandbox/cgroup/root",
        ));
        let config = SandboxConfiguration::default();
        assert!(module.initialize(&config).is_err());
        assert_eq!(module.state(), ModuleState::Uninitialized);
    }
}
