//! Linux capability restriction.
//!
//! Clears every capability set in the child and selectively re-adds the
//! configured names to the effective, permitted, and inheritable sets. Each
//! granted capability is then raised in the ambient set so it survives
//! `execve` of non-setuid binaries; ambient support is missing on older
//! kernels, so that step is best-effort.

use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use sandbox_common::config::SandboxConfiguration;
use sandbox_common::error::{Result, SandboxError};

use crate::module::{Module, ModuleState};

fn caps_err(message: String) -> SandboxError {
    SandboxError::Module {
        module: "caps",
        message,
    }
}

/// Resolves configured capability names against the kernel's capability
/// table. Unknown names are logged and skipped.
fn resolve_capabilities(names: &[String]) -> CapsHashSet {
    let mut set = CapsHashSet::new();
    for name in names {
        match Capability::from_str(name) {
            Ok(cap) => {
                let _ = set.insert(cap);
            }
            Err(_) => tracing::warn!(capability = %name, "unknown capability, skipping"),
        }
    }
    set
}

/// The capabilities module. Child-side only; it holds no kernel state in
/// the parent.
#[derive(Debug)]
pub struct CapabilityModule {
    state: ModuleState,
    granted: Vec<String>,
}

impl CapabilityModule {
    /// Creates the module in the uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            granted: Vec::new(),
        }
    }
}

impl Default for CapabilityModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CapabilityModule {
    fn name(&self) -> &'static str {
        "caps"
    }

    fn module_type(&self) -> &'static str {
        "security"
    }

    fn description(&self) -> &'static str {
        "Capability restriction with selective re-grant and ambient raise"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, config: &SandboxConfiguration) -> Result<()> {
        self.granted = config.security.capabilities.clone();
        tracing::info!(
            requested = self.granted.len(),
            capabilities = ?self.granted,
            "caps module initialized"
        );
        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn apply_child(&mut self, config: &SandboxConfiguration) -> Result<()> {
        let keep = resolve_capabilities(&config.security.capabilities);
        tracing::info!(retained = keep.len(), "restricting capabilities");

        // Inheritable entries must still be present in the permitted set
        // when written, so the inheritable set is committed first.
        caps::set(None, CapSet::Inheritable, &keep)
            .map_err(|e| caps_err(format!("failed to set inheritable capabilities: {e}")))?;
        caps::set(None, CapSet::Permitted, &keep)
            .map_err(|e| caps_err(format!("failed to set permitted capabilities: {e}")))?;
        caps::set(None, CapSet::Effective, &keep)
            .map_err(|e| caps_err(format!("failed to set effective capabilities: {e}")))?;

        for cap in &keep {
            if let Err(e) = caps::raise(None, CapSet::Ambient, *cap) {
                tracing::warn!(capability = %cap, error = %e, "failed to raise ambient capability");
            }
        }

        self.state = ModuleState::Running;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.granted.clear();
        self.state = ModuleState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_known_capability_names() {
        let set = resolve_capabilities(&[
            "CAP_CHOWN".into(),
            "CAP_NET_BIND_SERVICE".into(),
            "CAP_SYS_ADMIN".into(),
        ]);
        assert_eq!(set.len(), 3);
        assert!(set.contains(&Capability::CAP_CHOWN));
        assert!(set.contains(&Capability::CAP_NET_BIND_SERVICE));
        assert!(set.contains(&Capability::CAP_SYS_ADMIN));
    }

    #[test]
    fn unknown_names_are_skipped() {
        let set = resolve_capabilities(&[
            "CAP_CHOWN".into(),
            "CAP_TOTALLY_MADE_UP".into(),
            "chown".into(),
        ]);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn empty_request_resolves_to_empty_set() {
        let set = resolve_capabilities(&[]);
        assert!(set.is_empty());
    }

    #[test]
    fn lifecycle_states() {
        let mut config = SandboxConfiguration::default();
        config.security.capabilities = vec!["CAP_KILL".into()];

        let mut module = CapabilityModule::new();
        assert_eq!(module.state(), ModuleState::Uninitialized);

        module.initialize(&config).expect("initialize");
        assert_eq!(module.state(), ModuleState::Initialized);
        assert_eq!(module.granted, vec!["CAP_KILL".to_string()]);

        module.cleanup().expect("cleanup");
        assert_eq!(module.state(), ModuleState::Stopped);
        assert!(module.granted.is_empty());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut module = CapabilityModule::new();
        module.cleanup().expect("first");
        module.cleanup().expect("second");
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[test]
    fn metadata() {
        let module = CapabilityModule::new();
        assert_eq!(module.name(), "caps");
        assert_eq!(module.module_type(), "security");
        assert!(module.dependencies().is_empty());
    }
}
