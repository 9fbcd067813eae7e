//! The uniform lifecycle contract every isolation primitive implements.
//!
//! A module is consulted four times around the fork boundary, in a fixed
//! order decided by the manager:
//!
//! 1. `initialize` — parent, pre-fork: acquire parent-side resources.
//! 2. `prepare_child` — parent, post-fork: actions that need the child pid.
//! 3. `apply_child` — child, inside the new namespaces: install isolation.
//! 4. `cleanup` — parent, post-exit: release resources in reverse order.
//!
//! After the fork, parent and child each hold their own copy of a module;
//! state mutated by `apply_child` is only ever visible in the child, and
//! state acquired in `initialize` is visible on both sides. Nothing in a
//! module is synchronised across the boundary — coordination happens through
//! the child's exit status and the stdout pipe.

use std::fmt;

use nix::unistd::Pid;
use sandbox_common::config::SandboxConfiguration;
use sandbox_common::error::Result;

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    /// Created but not yet initialized.
    Uninitialized,
    /// `initialize` completed.
    Initialized,
    /// `apply_child` completed (child side) or the run is in flight.
    Running,
    /// Cleanup in progress.
    Stopping,
    /// Cleanup completed; all acquired resources released.
    Stopped,
    /// A lifecycle phase failed.
    Error,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Contract implemented by every isolation module.
///
/// The default implementations of [`prepare_child`](Module::prepare_child),
/// [`apply_child`](Module::apply_child), and [`execute`](Module::execute)
/// do nothing, so a module only overrides the phases it participates in.
pub trait Module: Send {
    /// Unique module name; also the key for dependency declarations.
    fn name(&self) -> &'static str;

    /// Module version string.
    fn version(&self) -> &'static str {
        "1.0.0"
    }

    /// Module category: `isolation`, `filesystem`, or `security`.
    fn module_type(&self) -> &'static str;

    /// One-line human description.
    fn description(&self) -> &'static str;

    /// Names of modules that must precede this one in execution order.
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Whether the module has work to do for the current configuration.
    /// Consulted by the manager after `initialize`; defaults to enabled.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Current lifecycle state.
    fn state(&self) -> ModuleState;

    /// Acquires parent-side resources before the fork.
    ///
    /// # Errors
    ///
    /// A failure aborts the run before any child exists.
    fn initialize(&mut self, config: &SandboxConfiguration) -> Result<()>;

    /// Parent-side actions that need the child pid (e.g. cgroup enrolment).
    ///
    /// # Errors
    ///
    /// A failure causes the manager to kill the child.
    fn prepare_child(&mut self, _config: &SandboxConfiguration, _child_pid: Pid) -> Result<()> {
        Ok(())
    }

    /// Installs isolation inside the child, within the new namespaces.
    ///
    /// # Errors
    ///
    /// A failure makes the child exit with status 1 before exec.
    fn apply_child(&mut self, _config: &SandboxConfiguration) -> Result<()> {
        Ok(())
    }

    /// Reserved for modules that replace the command; the six core modules
    /// return 0 and let the manager exec the configured command.
    ///
    /// # Errors
    ///
    /// Propagates any failure from a command-replacing module.
    fn execute(&mut self, _config: &SandboxConfiguration) -> Result<i32> {
        Ok(0)
    }

    /// Releases parent-side resources. Idempotent: a second call observes
    /// nothing left to release and still succeeds.
    ///
    /// # Errors
    ///
    /// Failures are logged and accumulated by the manager, never raised.
    fn cleanup(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_state_display() {
        assert_eq!(format!("{}", ModuleState::Uninitialized), "uninitialized");
        assert_eq!(format!("{}", ModuleState::Initialized), "initialized");
        assert_eq!(format!("{}", ModuleState::Running), "running");
        assert_eq!(format!("{}", ModuleState::Stopped), "stopped");
    }

    struct Minimal {
        state: ModuleState,
    }

    impl Module for Minimal {
        fn name(&self) -> &'static str {
            "minimal"
        }
        fn module_type(&self) -> &'static str {
            "isolation"
        }
        fn description(&self) -> &'static str {
            "test module"
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

    #[test]
    fn default_phases_are_no_ops() {
        let config = SandboxConfiguration::default();
        let mut module = Minimal {
            state: ModuleState::Uninitialized,
        };

        module.initialize(&config).expect("initialize");
        module
            .prepare_child(&config, Pid::from_raw(1))
            .expect("prepare_child");
        module.apply_child(&config).expect("apply_child");
        assert_eq!(module.execute(&config).expect("execute"), 0);
        module.cleanup().expect("cleanup");
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[test]
    fn default_metadata() {
        let module = Minimal {
            state: ModuleState::Uninitialized,
        };
        assert_eq!(module.version(), "1.0.0");
        assert!(module.dependencies().is_empty());
        assert!(module.is_enabled());
    }
}
