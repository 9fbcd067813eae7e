//! The sandbox manager.
//!
//! Owns the module registry, resolves the execution order from declared
//! dependencies, and drives the run: modules initialize in the parent, the
//! child is created with `clone(2)` carrying the configured namespace
//! flags, modules apply inside the child while the parent enrolls it into
//! its cgroup, and after the child exits every module is cleaned up in
//! reverse order.
//!
//! Control crosses the process boundary exactly once, at the clone. The
//! only channels back are the child's exit status and the stdout pipe; the
//! parent drains the pipe to EOF before reaping so a full pipe can never
//! wedge the child.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use sandbox_common::config::SandboxConfiguration;
use sandbox_common::error::Result;
use sandbox_core::capability::CapabilityModule;
use sandbox_core::cgroups::CgroupsModule;
use sandbox_core::module::Module;
use sandbox_core::mounts::MountsModule;
use sandbox_core::namespaces::{self, NamespacesModule};
use sandbox_core::rootfs::RootFsModule;
use sandbox_core::seccomp::SeccompModule;
use sandbox_core::syscall;

use crate::result::{SandboxResult, SandboxState};

/// Poll interval for the graceful-shutdown window of [`SandboxManager::stop`].
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Orchestrates the lifecycle of one sandbox instance.
pub struct SandboxManager {
    config: SandboxConfiguration,
    state: SandboxState,
    modules: Vec<Box<dyn Module>>,
    execution_order: Vec<usize>,
    child_pid: Arc<AtomicI32>,
}

impl SandboxManager {
    /// Creates a manager with an empty module registry.
    #[must_use]
    pub fn new(config: SandboxConfiguration) -> Self {
        Self {
            config,
            state: SandboxState::Created,
            modules: Vec::new(),
            execution_order: Vec::new(),
            child_pid: Arc::new(AtomicI32::new(-1)),
        }
    }

    /// The configuration this manager runs with.
    #[must_use]
    pub fn config(&self) -> &SandboxConfiguration {
        &self.config
    }

    /// Current manager state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Pid of the running child, if any.
    #[must_use]
    pub fn child_pid(&self) -> Option<i32> {
        let pid = self.child_pid.load(Ordering::SeqCst);
        (pid > 0).then_some(pid)
    }

    /// True while the child process is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == SandboxState::Running && self.child_pid().is_some()
    }

    /// Registers the six core isolation modules in their canonical order:
    /// namespaces, cgroups, rootfs, mounts, caps, and seccomp last, so the
    /// filter is installed after every other child-side step.
    pub fn register_default_modules(&mut self) {
        self.register_module(Box::new(NamespacesModule::new()));
        self.register_module(Box::new(CgroupsModule::new()));
        self.register_module(Box::new(RootFsModule::new()));
        self.register_module(Box::new(MountsModule::new()));
        self.register_module(Box::new(CapabilityModule::new()));
        self.register_module(Box::new(SeccompModule::new()));
    }

    /// Registers a module. Re-registering a name replaces the previous
    /// instance in place and logs a warning.
    pub fn register_module(&mut self, module: Box<dyn Module>) {
        let name = module.name();
        if let Some(existing) = self.modules.iter_mut().find(|m| m.name() == name) {
            tracing::warn!(module = name, "module already registered, replacing");
            *existing = module;
        } else {
            tracing::info!(module = name, "registered module");
            self.modules.push(module);
        }
    }

    /// Removes a module by name. Returns false if no such module exists.
    pub fn unregister_module(&mut self, name: &str) -> bool {
        match self.modules.iter().position(|m| m.name() == name) {
            Some(idx) => {
                let _ = self.modules.remove(idx);
                tracing::info!(module = name, "unregistered module");
                true
            }
            None => false,
        }
    }

    /// Borrows a registered module by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&dyn Module> {
        self.modules
            .iter()
            .find(|m| m.name() == name)
            .map(AsRef::as_ref)
    }

    /// Resolves the execution order: a depth-first topological sort over
    /// `dependencies()`, with ties broken by registration order. A
    /// dependency cycle is logged and broken at the offending node, and an
    /// unregistered dependency is logged and skipped; both yield a partial
    /// order rather than an error.
    pub fn resolve_execution_order(&mut self) -> Vec<&'static str> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();

        for idx in 0..self.modules.len() {
            visit(&self.modules, idx, &mut visited, &mut in_progress, &mut order);
        }

        self.execution_order = order;
        tracing::info!(modules = self.execution_order.len(), "resolved execution order");
        self.execution_order
            .iter()
            .map(|&idx| self.modules[idx].name())
            .collect()
    }

    /// Runs the sandbox to completion and returns the result record.
    pub fn run(&mut self) -> SandboxResult {
        let start = Instant::now();
        tracing::info!(name = %self.config.sandbox.name, "starting sandbox");

        self.set_state(SandboxState::Initializing);
        let _ = self.resolve_execution_order();

        if let Err(e) = self.initialize_modules() {
            tracing::error!(error = %e, "failed to initialize modules");
            self.set_state(SandboxState::Error);
            let _ = self.cleanup_modules();
            return self.finish_failure(start, format!("failed to initialize modules: {e}"));
        }

        self.set_state(SandboxState::Preparing);

        let (pipe_read, pipe_write) = match nix::unistd::pipe() {
            Ok(fds) => fds,
            Err(e) => {
                tracing::error!(error = %e, "failed to create pipe");
                self.set_state(SandboxState::Error);
                let _ = self.cleanup_modules();
                return self.finish_failure(start, format!("failed to create pipe: {e}"));
            }
        };

        let clone_flags = namespaces::clone_flags(&self.config.isolation);
        tracing::info!(?clone_flags, "forking child process");

        let child = {
            let config = self.config.clone();
            let order = self.execution_order.clone();
            let read_fd = pipe_read.as_raw_fd();
            let write_fd = pipe_write.as_raw_fd();
            let modules = &mut self.modules;
            syscall::clone_child(
                clone_flags,
                Box::new(move || child_entry(modules, &order, &config, read_fd, write_fd)),
            )
        };

        let pid = match child {
            Ok(pid) => pid,
            Err(e) => {
                tracing::error!(error = %e, "failed to fork child");
                drop(pipe_read);
                drop(pipe_write);
                self.set_state(SandboxState::Error);
                let _ = self.cleanup_modules();
                return self.finish_failure(start, format!("failed to fork process: {e}"));
            }
        };

        // Parent side. Close the write end so EOF arrives once the child
        // (and everything it execs) is gone.
        drop(pipe_write);
        self.child_pid.store(pid.as_raw(), Ordering::SeqCst);
        self.set_state(SandboxState::Running);
        tracing::info!(pid = pid.as_raw(), "child process started");

        if let Err(e) = self.prepare_child_modules(pid) {
            tracing::error!(error = %e, "failed to prepare child process");
            let _ = signal::kill(pid, Signal::SIGKILL);
        }

        let mut stdout_buf = Vec::new();
        let mut reader = File::from(pipe_read);
        if let Err(e) = reader.read_to_end(&mut stdout_buf) {
            tracing::warn!(error = %e, "failed to drain child stdout");
        }

        let status = wait::waitpid(pid, None);

        let mut result = SandboxResult {
            exit_code: -1,
            success: false,
            error_message: None,
            execution_time_ms: 0,
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            child_pid: Some(pid.as_raw()),
        };

        match status {
            Ok(WaitStatus::Exited(_, code)) => {
                result.exit_code = code;
                result.success = code == 0;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                result.exit_code = -(sig as i32);
                result.success = false;
                result.error_message = Some(format!("killed by signal: {sig}"));
            }
            Ok(other) => {
                result.error_message = Some(format!("unexpected wait status: {other:?}"));
            }
            Err(e) => {
                result.error_message = Some(format!("waitpid failed: {e}"));
            }
        }

        self.set_state(SandboxState::Stopping);
        self.child_pid.store(-1, Ordering::SeqCst);
        let _ = self.cleanup_modules();
        self.set_state(SandboxState::Stopped);

        result.execution_time_ms = elapsed_ms(start);
        tracing::info!(
            exit_code = result.exit_code,
            elapsed_ms = result.execution_time_ms,
            "sandbox execution completed"
        );
        result
    }

    /// Runs the sandbox on a background thread and returns a handle that
    /// can stop the child and join the result.
    #[must_use]
    pub fn run_async(mut self) -> SandboxHandle {
        let child_pid = Arc::clone(&self.child_pid);
        let thread = std::thread::spawn(move || self.run());
        SandboxHandle { child_pid, thread }
    }

    /// Stops a running child: SIGTERM, a polled graceful window, then
    /// SIGKILL. Returns true, and is a no-op, when no child exists.
    pub fn stop(&self, timeout_ms: u64) -> bool {
        stop_child(&self.child_pid, timeout_ms)
    }

    fn initialize_modules(&mut self) -> Result<()> {
        for i in 0..self.execution_order.len() {
            let idx = self.execution_order[i];
            tracing::info!(module = self.modules[idx].name(), "initializing module");
            self.modules[idx].initialize(&self.config)?;
        }
        Ok(())
    }

    fn prepare_child_modules(&mut self, child_pid: Pid) -> Result<()> {
        for i in 0..self.execution_order.len() {
            let idx = self.execution_order[i];
            if !self.modules[idx].is_enabled() {
                continue;
            }
            self.modules[idx].prepare_child(&self.config, child_pid)?;
        }
        Ok(())
    }

    /// Cleans up modules in reverse execution order, accumulating failures
    /// instead of short-circuiting.
    fn cleanup_modules(&mut self) -> bool {
        let mut success = true;
        for i in (0..self.execution_order.len()).rev() {
            let idx = self.execution_order[i];
            tracing::info!(module = self.modules[idx].name(), "cleaning up module");
            if let Err(e) = self.modules[idx].cleanup() {
                tracing::error!(
                    module = self.modules[idx].name(),
                    error = %e,
                    "module cleanup failed"
                );
                success = false;
            }
        }
        success
    }

    fn finish_failure(&mut self, start: Instant, message: String) -> SandboxResult {
        let mut result = SandboxResult::failure(message);
        result.execution_time_ms = elapsed_ms(start);
        result
    }

    fn set_state(&mut self, state: SandboxState) {
        tracing::debug!(from = %self.state, to = %state, "manager state changed");
        self.state = state;
    }
}

/// Handle to a sandbox running on a background thread.
pub struct SandboxHandle {
    child_pid: Arc<AtomicI32>,
    thread: JoinHandle<SandboxResult>,
}

impl SandboxHandle {
    /// Stops the running child; same semantics as [`SandboxManager::stop`].
    pub fn stop(&self, timeout_ms: u64) -> bool {
        stop_child(&self.child_pid, timeout_ms)
    }

    /// True once the background run has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the run to complete and returns its result.
    #[must_use]
    pub fn join(self) -> SandboxResult {
        self.thread
            .join()
            .unwrap_or_else(|_| SandboxResult::failure("sandbox thread panicked"))
    }
}

/// Child-side entry point, executed inside the new namespaces. The return
/// value becomes the child's exit status; the child never returns to the
/// manager.
fn child_entry(
    modules: &mut [Box<dyn Module>],
    order: &[usize],
    config: &SandboxConfiguration,
    read_fd: i32,
    write_fd: i32,
) -> isize {
    let _ = nix::unistd::close(read_fd);

    if let Err(e) = syscall::set_process_name(&config.sandbox.name) {
        tracing::debug!(error = %e, "failed to set process title");
    }

    if nix::unistd::dup2(write_fd, libc::STDOUT_FILENO).is_err() {
        return 1;
    }
    let _ = nix::unistd::close(write_fd);

    for &idx in order {
        let module = &mut modules[idx];
        if !module.is_enabled() {
            continue;
        }
        if let Err(e) = module.apply_child(config) {
            tracing::error!(module = module.name(), error = %e, "child setup failed");
            return 1;
        }
    }

    match syscall::exec_command(&config.sandbox.command) {
        Ok(never) => match never {},
        Err(e) => {
            tracing::error!(error = %e, "failed to exec command");
            1
        }
    }
}

/// Depth-first visit for dependency resolution.
fn visit(
    modules: &[Box<dyn Module>],
    idx: usize,
    visited: &mut HashSet<&'static str>,
    in_progress: &mut HashSet<&'static str>,
    order: &mut Vec<usize>,
) {
    let name = modules[idx].name();
    if in_progress.contains(name) {
        tracing::warn!(module = name, "circular module dependency detected, breaking cycle");
        return;
    }
    if visited.contains(name) {
        return;
    }

    let _ = in_progress.insert(name);
    for dep in modules[idx].dependencies() {
        match modules.iter().position(|m| m.name() == dep) {
            Some(dep_idx) => visit(modules, dep_idx, visited, in_progress, order),
            None => {
                tracing::warn!(module = name, dependency = dep, "dependency not registered");
            }
        }
    }
    let _ = in_progress.remove(name);
    let _ = visited.insert(name);
    order.push(idx);
}

/// Shared stop implementation: SIGTERM, poll `waitpid(WNOHANG)` every
/// 100 ms up to the timeout, then SIGKILL and reap.
fn stop_child(child_pid: &AtomicI32, timeout_ms: u64) -> bool {
    let raw = child_pid.load(Ordering::SeqCst);
    if raw <= 0 {
        return true;
    }
    let pid = Pid::from_raw(raw);
    tracing::info!(pid = raw, timeout_ms, "stopping sandbox");

    if signal::kill(pid, Signal::SIGTERM).is_err() {
        // Delivery fails only once the child is already gone.
        return true;
    }

    for _ in 0..(timeout_ms / 100) {
        match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(STOP_POLL_INTERVAL),
            // Reaped here, or already reaped by the run loop.
            Ok(_) | Err(_) => return true,
        }
    }

    tracing::warn!(pid = raw, "graceful shutdown window elapsed, sending SIGKILL");
    let _ = signal::kill(pid, Signal::SIGKILL);
    let _ = wait::waitpid(pid, None);
    true
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::module::ModuleState;

    struct StubModule {
        name: &'static str,
        deps: Vec<&'static str>,
        state: ModuleState,
    }

    impl StubModule {
        fn new(name: &'static str, deps: &[&'static str]) -> Box<Self> {
            Box::new(Self {
                name,
                deps: deps.to_vec(),
                state: ModuleState::Uninitialized,
            })
        }
    }

    impl Module for StubModule {
        fn name(&self) -> &'static str {
            self.name
        }
        fn module_type(&self) -> &'static str {
            "isolation"
        }
        fn description(&self) -> &'static str {
            "stub"
        }
        fn dependencies(&self) -> Vec<&'static str> {
            self.deps.clone()
        }
        fn state(&self) -> ModuleState {
            self.state
        }
        fn initialize(&mut self, _config: &SandboxConfiguration) -> Result<()> {
            self.state = ModuleState::Initialized;
            Ok(())
        }
        fn cleanup(&mut self) -> Result<()> {
            self.state = ModuleState::Stopped;
            Ok(())
        }
    }

    fn manager() -> SandboxManager {
        SandboxManager::new(SandboxConfiguration::default())
    }

    #[test]
    fn new_manager_starts_created_with_no_child() {
        let m = manager();
        assert_eq!(m.state(), SandboxState::Created);
        assert!(m.child_pid().is_none());
        assert!(!m.is_running());
    }

    #[test]
    fn register_and_query_modules() {
        let mut m = manager();
        m.register_module(StubModule::new("alpha", &[]));
        m.register_module(StubModule::new("beta", &[]));

        assert!(m.module("alpha").is_some());
        assert!(m.module("beta").is_some());
        assert!(m.module("gamma").is_none());
    }

    #[test]
    fn reregistering_replaces_in_place() {
        let mut m = manager();
        m.register_module(StubModule::new("alpha", &[]));
        m.register_module(StubModule::new("beta", &[]));
        m.register_module(StubModule::new("alpha", &["beta"]));

        let order = m.resolve_execution_order();
        assert_eq!(order.len(), 2, "replacement must not duplicate");
        assert_eq!(
            m.module("alpha").expect("alpha").dependencies(),
            vec!["beta"]
        );
    }

    #[test]
    fn unregister_removes_module() {
        let mut m = manager();
        m.register_module(StubModule::new("alpha", &[]));
        assert!(m.unregister_module("alpha"));
        assert!(!m.unregister_module("alpha"));
        assert!(m.module("alpha").is_none());
    }

    #[test]
    fn execution_order_is_registration_order_without_dependencies() {
        let mut m = manager();
        m.register_module(StubModule::new("c", &[]));
        m.register_module(StubModule::new("a", &[]));
        m.register_module(StubModule::new("b", &[]));

        assert_eq!(m.resolve_execution_order(), vec!["c", "a", "b"]);
    }

    #[test]
    fn dependencies_precede_dependents() {
        let mut m = manager();
        m.register_module(StubModule::new("mounts-like", &["rootfs-like"]));
        m.register_module(StubModule::new("rootfs-like", &[]));

        assert_eq!(
            m.resolve_execution_order(),
            vec!["rootfs-like", "mounts-like"]
        );
    }

    #[test]
    fn default_modules_order_rootfs_before_mounts_and_seccomp_last() {
        let mut m = manager();
        m.register_default_modules();
        let order = m.resolve_execution_order();

        let pos = |name: &str| order.iter().position(|n| *n == name).expect(name);
        assert!(pos("rootfs") < pos("mounts"));
        assert_eq!(*order.last().expect("non-empty"), "seccomp");
        assert_eq!(order.len(), 6);
    }

    #[test]
    fn dependency_cycle_is_broken_not_fatal() {
        let mut m = manager();
        m.register_module(StubModule::new("a", &["b"]));
        m.register_module(StubModule::new("b", &["a"]));

        let order = m.resolve_execution_order();
        assert_eq!(order.len(), 2, "both modules survive the cycle");
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn missing_dependency_is_skipped() {
        let mut m = manager();
        m.register_module(StubModule::new("a", &["ghost"]));

        let order = m.resolve_execution_order();
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn stop_with_no_child_is_a_true_no_op() {
        let m = manager();
        assert!(m.stop(1000));
        assert!(m.stop(0));
    }
}
