//! Seccomp-BPF syscall filtering.
//!
//! The filter is compiled in the parent during `initialize` and the BPF
//! blob is retained on the module; the child installs it as the very last
//! isolation step, after every other module has issued the syscalls the
//! filter would deny.
//!
//! With no profile override, the module generates an allow-list of common
//! user-space calls with the policy-selected default action. A profile file
//! is a JSON document of the shape:
//!
//! ```json
//! {
//!   "default_action": "errno",
//!   "syscalls": [ { "names": ["read", "write"], "action": "allow" } ]
//! }
//! ```
//!
//! The compiled program has a single match action (allow); rules with any
//! other action are warned about and skipped, as are syscall names unknown
//! to the fixed resolution table.

use std::collections::BTreeMap;
use std::path::Path;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use serde::Deserialize;
use sandbox_common::config::SandboxConfiguration;
use sandbox_common::error::{Result, SandboxError};

use crate::module::{Module, ModuleState};
use crate::syscall;

/// Syscall names admitted by the generated default policy.
const DEFAULT_ALLOWLIST: &[&str] = &[
    "read", "write", "close", "brk", "execve", "exit_group", "exit", "getpid", "gettid",
    "getppid", "getuid", "getgid", "geteuid", "getegid", "getrandom", "mmap", "mprotect",
    "munmap", "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "ioctl", "pread64",
    "pwrite64", "readv", "writev", "access", "pipe", "sched_yield", "mremap", "msync",
    "mincore", "madvise", "shmget", "shmat", "shmctl", "shmdt", "dup", "dup2", "pause",
    "nanosleep", "getitimer", "setitimer", "alarm", "setpgid", "getpgid", "getsid",
    "setsid", "syslog", "getrlimit", "getrusage", "gettimeofday", "settimeofday",
    "symlink", "readlink", "uselib", "readahead", "setxattr", "lsetxattr", "fsetxattr",
    "getxattr", "lgetxattr", "fgetxattr", "listxattr", "llistxattr", "flistxattr",
    "removexattr", "lremovexattr", "fremovexattr", "tkill", "time", "futex",
    "sched_setaffinity", "sched_getaffinity", "io_setup", "io_destroy", "io_getevents",
    "io_submit", "io_cancel", "lookup_dcookie", "epoll_create", "remap_file_pages",
    "set_tid_address", "timer_create", "timer_settime", "timer_gettime",
    "timer_getoverrun", "timer_delete", "clock_settime", "clock_gettime", "clock_getres",
    "clock_nanosleep", "wait4", "kill", "uname", "semget", "semop", "semctl", "msgget",
    "msgsnd", "msgrcv", "msgctl", "fcntl", "flock", "fsync", "fdatasync", "truncate",
    "ftruncate", "getcwd", "chdir", "fchdir", "rename", "mkdir", "rmdir", "creat",
    "link", "unlink", "open", "vhangup", "sethostname", "setrlimit",
];

/// Fixed name-to-number resolution table for the current architecture.
#[cfg(target_arch = "x86_64")]
const SYSCALL_TABLE: &[(&str, libc::c_long)] = &[
    ("access", libc::SYS_access),
    ("alarm", libc::SYS_alarm),
    ("brk", libc::SYS_brk),
    ("chdir", libc::SYS_chdir),
    ("clock_getres", libc::SYS_clock_getres),
    ("clock_gettime", libc::SYS_clock_gettime),
    ("clock_nanosleep", libc::SYS_clock_nanosleep),
    ("clock_settime", libc::SYS_clock_settime),
    ("close", libc::SYS_close),
    ("creat", libc::SYS_creat),
    ("dup", libc::SYS_dup),
    ("dup2", libc::SYS_dup2),
    ("epoll_create", libc::SYS_epoll_create),
    ("execve", libc::SYS_execve),
    ("exit", libc::SYS_exit),
    ("exit_group", libc::SYS_exit_group),
    ("fchdir", libc::SYS_fchdir),
    ("fcntl", libc::SYS_fcntl),
    ("fdatasync", libc::SYS_fdatasync),
    ("fgetxattr", libc::SYS_fgetxattr),
    ("flistxattr", libc::SYS_flistxattr),
    ("flock", libc::SYS_flock),
    ("fremovexattr", libc::SYS_fremovexattr),
    ("fsetxattr", libc::SYS_fsetxattr),
    ("fsync", libc::SYS_fsync),
    ("ftruncate", libc::SYS_ftruncate),
    ("futex", libc::SYS_futex),
    ("getcwd", libc::SYS_getcwd),
    ("getegid", libc::SYS_getegid),
    ("geteuid", libc::SYS_geteuid),
    ("getgid", libc::SYS_getgid),
    ("getitimer", libc::SYS_getitimer),
    ("getpgid", libc::SYS_getpgid),
    ("getpid", libc::SYS_getpid),
    ("getppid", libc::SYS_getppid),
    ("getrandom", libc::SYS_getrandom),
    ("getrlimit", libc::SYS_getrlimit),
    ("getrusage", libc::SYS_getrusage),
    ("getsid", libc::SYS_getsid),
    ("gettid", libc::SYS_gettid),
    ("gettimeofday", libc::SYS_gettimeofday),
    ("getuid", libc::SYS_getuid),
    ("getxattr", libc::SYS_getxattr),
    ("io_cancel", libc::SYS_io_cancel),
    ("io_destroy", libc::SYS_io_destroy),
    ("io_getevents", libc::SYS_io_getevents),
    ("io_setup", libc::SYS_io_setup),
    ("io_submit", libc::SYS_io_submit),
    ("ioctl", libc::SYS_ioctl),
    ("kill", libc::SYS_kill),
    ("lgetxattr", libc::SYS_lgetxattr),
    ("link", libc::SYS_link),
    ("listxattr", libc::SYS_listxattr),
    ("llistxattr", libc::SYS_llistxattr),
    ("lookup_dcookie", libc::SYS_lookup_dcookie),
    ("lremovexattr", libc::SYS_lremovexattr),
    ("lsetxattr", libc::SYS_lsetxattr),
    ("madvise", libc::SYS_madvise),
    ("mincore", libc::SYS_mincore),
    ("mkdir", libc::SYS_mkdir),
    ("mmap", libc::SYS_mmap),
    ("mprotect", libc::SYS_mprotect),
    ("mremap", libc::SYS_mremap),
    ("msgctl", libc::SYS_msgctl),
    ("msgget", libc::SYS_msgget),
    ("msgrcv", libc::SYS_msgrcv),
    ("msgsnd", libc::SYS_msgsnd),
    ("msync", libc::SYS_msync),
    ("munmap", libc::SYS_munmap),
    ("nanosleep", libc::SYS_nanosleep),
    ("open", libc::SYS_open),
    ("pause", libc::SYS_pause),
    ("pipe", libc::SYS_pipe),
    ("pread64", libc::SYS_pread64),
    ("pwrite64", libc::SYS_pwrite64),
    ("read", libc::SYS_read),
    ("readahead", libc::SYS_readahead),
    ("readlink", libc::SYS_readlink),
    ("readv", libc::SYS_readv),
    ("remap_file_pages", libc::SYS_remap_file_pages),
    ("removexattr", libc::SYS_removexattr),
    ("rename", libc::SYS_rename),
    ("rmdir", libc::SYS_rmdir),
    ("rt_sigaction", libc::SYS_rt_sigaction),
    ("rt_sigprocmask", libc::SYS_rt_sigprocmask),
    ("rt_sigreturn", libc::SYS_rt_sigreturn),
    ("sched_getaffinity", libc::SYS_sched_getaffinity),
    ("sched_setaffinity", libc::SYS_sched_setaffinity),
    ("sched_yield", libc::SYS_sched_yield),
    ("semctl", libc::SYS_semctl),
    ("semget", libc::SYS_semget),
    ("semop", libc::SYS_semop),
    ("set_tid_address", libc::SYS_set_tid_address),
    ("setgroups", libc::SYS_setgroups),
    ("sethostname", libc::SYS_sethostname),
    ("setitimer", libc::SYS_setitimer),
    ("setpgid", libc::SYS_setpgid),
    ("setrlimit", libc::SYS_setrlimit),
    ("setsid", libc::SYS_setsid),
    ("settimeofday", libc::SYS_settimeofday),
    ("setxattr", libc::SYS_setxattr),
    ("shmat", libc::SYS_shmat),
    ("shmctl", libc::SYS_shmctl),
    ("shmdt", libc::SYS_shmdt),
    ("shmget", libc::SYS_shmget),
    ("symlink", libc::SYS_symlink),
    ("syslog", libc::SYS_syslog),
    ("time", libc::SYS_time),
    ("timer_create", libc::SYS_timer_create),
    ("timer_delete", libc::SYS_timer_delete),
    ("timer_getoverrun", libc::SYS_timer_getoverrun),
    ("timer_gettime", libc::SYS_timer_gettime),
    ("timer_settime", libc::SYS_timer_settime),
    ("tkill", libc::SYS_tkill),
    ("truncate", libc::SYS_truncate),
    ("uname", libc::SYS_uname),
    ("unlink", libc::SYS_unlink),
    ("uselib", libc::SYS_uselib),
    ("vhangup", libc::SYS_vhangup),
    ("wait4", libc::SYS_wait4),
    ("write", libc::SYS_write),
    ("writev", libc::SYS_writev),
];

#[cfg(not(target_arch = "x86_64"))]
const SYSCALL_TABLE: &[(&str, libc::c_long)] = &[];

#[cfg(target_arch = "x86_64")]
fn target_arch() -> Option<TargetArch> {
    Some(TargetArch::x86_64)
}

#[cfg(target_arch = "aarch64")]
fn target_arch() -> Option<TargetArch> {
    Some(TargetArch::aarch64)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn target_arch() -> Option<TargetArch> {
    None
}

/// Resolves a syscall name through the fixed table.
fn syscall_number(name: &str) -> Option<i64> {
    SYSCALL_TABLE
        .iter()
        .find(|(entry, _)| *entry == name)
        .map(|(_, number)| *number as i64)
}

fn seccomp_err(message: String) -> SandboxError {
    SandboxError::Seccomp { message }
}

/// JSON profile document overriding the generated policy.
#[derive(Debug, Deserialize)]
struct SeccompProfile {
    #[serde(default)]
    default_action: Option<String>,
    #[serde(default)]
    syscalls: Vec<ProfileRule>,
}

/// One profile rule: a set of syscall names and the action applied to them.
#[derive(Debug, Deserialize)]
struct ProfileRule {
    names: Vec<String>,
    action: String,
}

/// Parses a profile action name. Unknown names yield `None`.
fn parse_action(name: &str) -> Option<SeccompAction> {
    match name {
        "allow" => Some(SeccompAction::Allow),
        "errno" => Some(SeccompAction::Errno(libc::EPERM as u32)),
        "kill" => Some(SeccompAction::KillThread),
        "log" => Some(SeccompAction::Log),
        "trap" => Some(SeccompAction::Trap),
        _ => None,
    }
}

/// The seccomp module.
#[derive(Debug)]
pub struct SeccompModule {
    state: ModuleState,
    enabled: bool,
    default_action: SeccompAction,
    filter: Option<BpfProgram>,
}

impl SeccompModule {
    /// Creates the module in the uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            enabled: true,
            default_action: SeccompAction::Errno(libc::EPERM as u32),
            filter: None,
        }
    }

    /// The default action selected from the configured policy.
    #[must_use]
    pub fn default_action(&self) -> &SeccompAction {
        &self.default_action
    }

    /// Whether a compiled filter blob is retained.
    #[must_use]
    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    fn action_for_policy(policy: &str) -> SeccompAction {
        match policy {
            "strict" => SeccompAction::KillThread,
            "log" => SeccompAction::Log,
            "allow" => SeccompAction::Allow,
            // "default", the empty explicit policy, and anything else.
            _ => SeccompAction::Errno(libc::EPERM as u32),
        }
    }

    /// Resolves the default allow-list through the fixed table.
    fn default_allowed_syscalls() -> Vec<i64> {
        let mut allowed = Vec::new();
        for name in DEFAULT_ALLOWLIST {
            match syscall_number(name) {
                Some(number) => allowed.push(number),
                // Some names (e.g. legacy calls) are absent on newer
                // architectures; skipping matches the resolver behaviour.
                None => tracing::debug!(syscall = %name, "not in resolution table, skipping"),
            }
        }
        allowed
    }

    /// Loads a profile document, possibly overriding the default action,
    /// and returns the allowed syscall numbers.
    fn load_profile(&mut self, path: &Path) -> Result<Vec<i64>> {
        tracing::info!(path = %path.display(), "loading seccomp profile");
        let content = syscall::read_file(path)?;
        let profile: SeccompProfile = serde_json::from_str(&content)
            .map_err(|e| seccomp_err(format!("invalid profile document: {e}")))?;

        if let Some(action_name) = &profile.default_action {
            match parse_action(action_name) {
                Some(action) => self.default_action = action,
                None => {
                    tracing::warn!(action = %action_name, "unknown default action, keeping policy")
                }
            }
        }

        let mut allowed = Vec::new();
        for rule in &profile.syscalls {
            if !matches!(parse_action(&rule.action), Some(SeccompAction::Allow)) {
                tracing::warn!(
                    action = %rule.action,
                    "only allow rules are supported by the compiled filter, skipping"
                );
                continue;
            }
            for name in &rule.names {
                match syscall_number(name) {
                    Some(number) => allowed.push(number),
                    None => tracing::warn!(syscall = %name, "unknown syscall, skipping"),
                }
            }
        }
        Ok(allowed)
    }

    /// Compiles the allowed set into a BPF program with the selected
    /// default action.
    fn compile(&self, allowed: &[i64]) -> Result<BpfProgram> {
        let Some(arch) = target_arch() else {
            return Err(seccomp_err("unsupported architecture".into()));
        };

        let rules: BTreeMap<i64, Vec<SeccompRule>> =
            allowed.iter().map(|number| (*number, Vec::new())).collect();

        let filter = SeccompFilter::new(
            rules,
            self.default_action.clone(),
            SeccompAction::Allow,
            arch,
        )
        .map_err(|e| seccomp_err(format!("failed to build filter: {e}")))?;

        let program: BpfProgram = filter
            .try_into()
            .map_err(|e| seccomp_err(format!("failed to compile filter: {e}")))?;

        tracing::debug!(
            allowed = allowed.len(),
            instructions = program.len(),
            "seccomp filter compiled"
        );
        Ok(program)
    }
}

impl Default for SeccompModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for SeccompModule {
    fn name(&self) -> &'static str {
        "seccomp"
    }

    fn module_type(&self) -> &'static str {
        "security"
    }

    fn description(&self) -> &'static str {
        "Seccomp-BPF syscall filtering with policy-driven default action"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn initialize(&mut self, config: &SandboxConfiguration) -> Result<()> {
        let policy = &config.security.seccomp_policy;
        let profile_path = &config.security.seccomp_profile_path;

        self.enabled = !policy.is_empty() || !profile_path.is_empty();
        if !self.enabled {
            tracing::info!("seccomp disabled (no policy specified)");
            self.state = ModuleState::Initialized;
            return Ok(());
        }

        self.default_action = Self::action_for_policy(policy);

        let allowed = if profile_path.is_empty() {
            Self::default_allowed_syscalls()
        } else {
            self.load_profile(Path::new(profile_path))?
        };

        if allowed.is_empty() {
            tracing::warn!("no syscalls resolved for the filter, seccomp disabled");
            self.enabled = false;
            self.state = ModuleState::Initialized;
            return Ok(());
        }

        self.filter = Some(self.compile(&allowed)?);
        self.state = ModuleState::Initialized;
        tracing::info!(
            policy = %policy,
            allowed = allowed.len(),
            "seccomp module initialized"
        );
        Ok(())
    }

    fn apply_child(&mut self, _config: &SandboxConfiguration) -> Result<()> {
        if !self.enabled {
            tracing::debug!("seccomp disabled, skipping");
            return Ok(());
        }

        let program = self
            .filter
            .as_ref()
            .ok_or_else(|| seccomp_err("no compiled filter to install".into()))?;

        seccompiler::apply_filter(program)
            .map_err(|e| seccomp_err(format!("failed to install filter: {e}")))?;

        tracing::debug!("seccomp filter installed");
        self.state = ModuleState::Running;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.filter = None;
        self.state = ModuleState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_selects_default_action() {
        assert!(matches!(
            SeccompModule::action_for_policy("default"),
            SeccompAction::Errno(_)
        ));
        assert!(matches!(
            SeccompModule::action_for_policy("strict"),
            SeccompAction::KillThread
        ));
        assert!(matches!(
            SeccompModule::action_for_policy("log"),
            SeccompAction::Log
        ));
        assert!(matches!(
            SeccompModule::action_for_policy("allow"),
            SeccompAction::Allow
        ));
        assert!(matches!(
            SeccompModule::action_for_policy(""),
            SeccompAction::Errno(_)
        ));
    }

    #[test]
    fn disabled_without_policy_or_profile() {
        let mut config = SandboxConfiguration::default();
        config.security.seccomp_policy = String::new();
        config.security.seccomp_profile_path = String::new();

        let mut module = SeccompModule::new();
        module.initialize(&config).expect("initialize");
        assert!(!module.is_enabled());
        assert!(!module.has_filter());
        assert_eq!(module.state(), ModuleState::Initialized);

        // A disabled module is a no-op in the child.
        module.apply_child(&config).expect("apply_child");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn default_policy_compiles_a_filter() {
        let config = SandboxConfiguration::default();
        let mut module = SeccompModule::new();

        module.initialize(&config).expect("initialize");
        assert!(module.is_enabled());
        assert!(module.has_filter());
        assert!(matches!(module.default_action(), SeccompAction::Errno(_)));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn profile_overrides_default_action_and_allowlist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = dir.path().join("profile.json");
        std::fs::write(
            &profile,
            r#"{"default_action":"kill",
                "syscalls":[{"names":["read","write","not_a_syscall"],"action":"allow"}]}"#,
        )
        .expect("write profile");

        let mut config = SandboxConfiguration::default();
        config.security.seccomp_profile_path = profile.to_string_lossy().into_owned();

        let mut module = SeccompModule::new();
        module.initialize(&config).expect("initialize");
        assert!(module.is_enabled());
        assert!(module.has_filter());
        assert!(matches!(module.default_action(), SeccompAction::KillThread));
    }

    #[test]
    fn profile_with_only_non_allow_rules_disables_the_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = dir.path().join("profile.json");
        std::fs::write(
            &profile,
            r#"{"syscalls":[{"names":["read"],"action":"kill"}]}"#,
        )
        .expect("write profile");

        let mut config = SandboxConfiguration::default();
        config.security.seccomp_profile_path = profile.to_string_lossy().into_owned();

        let mut module = SeccompModule::new();
        module.initialize(&config).expect("initialize");
        assert!(!module.is_enabled());
        assert!(!module.has_filter());
    }

    #[test]
    fn missing_profile_file_fails_initialization() {
        let mut config = SandboxConfiguration::default();
        config.security.seccomp_profile_path = "/nonexistent/sandbox/profile.json".into();

        let mut module = SeccompModule::new();
        assert!(module.initialize(&config).is_err());
    }

    #[test]
    fn malformed_profile_fails_initialization() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = dir.path().join("profile.json");
        std::fs::write(&profile, "{ not json").expect("write profile");

        let mut config = SandboxConfiguration::default();
        config.security.seccomp_profile_path = profile.to_string_lossy().into_owned();

        let mut module = SeccompModule::new();
        let result = module.initialize(&config);
        assert!(matches!(result, Err(SandboxError::Seccomp { .. })));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn cleanup_drops_the_compiled_blob() {
        let config = SandboxConfiguration::default();
        let mut module = SeccompModule::new();
        module.initialize(&config).expect("initialize");
        assert!(module.has_filter());

        module.cleanup().expect("cleanup");
        assert!(!module.has_filter());
        assert_eq!(module.state(), ModuleState::Stopped);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn resolution_table_covers_the_core_allowlist() {
        for name in ["read", "write", "execve", "exit_group", "open", "futex"] {
            assert!(syscall_number(name).is_some(), "missing {name}");
        }
        assert!(syscall_number("not_a_syscall").is_none());
    }
}
