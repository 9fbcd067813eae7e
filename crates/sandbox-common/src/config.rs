//! Configuration model for the sandbox engine.
//!
//! The configuration is a single JSON document with seven top-level groups:
//! `sandbox`, `resources`, `isolation`, `security`, `mounts`, `ai_module`,
//! and `logging`. Missing keys take the defaults below; unknown keys are
//! ignored for forward compatibility. The parsed record is immutable after
//! load — modules receive it by shared reference and never mutate it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, SandboxError};

/// The closed set of namespace names accepted in `isolation.namespaces`.
pub const NAMESPACE_NAMES: &[&str] = &["pid", "net", "ipc", "uts", "mount", "user"];

/// Root configuration record, shared by reference across the whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfiguration {
    /// Instance identity and the command to run.
    pub sandbox: SandboxConfig,
    /// Cgroup resource limits.
    pub resources: ResourcesConfig,
    /// Namespace selection and user-namespace ID maps.
    pub isolation: IsolationConfig,
    /// Capability and seccomp policy.
    pub security: SecurityConfig,
    /// Bind mounts applied inside the new root.
    pub mounts: MountsConfig,
    /// External AI advisor; the core reads nothing but `enabled`.
    pub ai_module: AiModuleConfig,
    /// Logging sink configuration.
    pub logging: LoggingConfig,
}

/// The `sandbox` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Instance name, also used for the cgroup and the child process title.
    pub name: String,
    /// Hostname set inside the UTS namespace.
    pub hostname: String,
    /// Root filesystem the child pivots into.
    pub rootfs_path: PathBuf,
    /// Command and arguments executed inside the sandbox.
    pub command: Vec<String>,
    /// Bootstrap the rootfs with debootstrap when it does not exist.
    pub auto_bootstrap: bool,
    /// Distribution passed to the bootstrap helper.
    pub distro: String,
    /// Release passed to the bootstrap helper.
    pub release: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: constants::DEFAULT_SANDBOX_NAME.into(),
            hostname: constants::DEFAULT_HOSTNAME.into(),
            rootfs_path: PathBuf::from(constants::DEFAULT_ROOTFS_PATH),
            command: vec!["/bin/bash".into()],
            auto_bootstrap: false,
            distro: "ubuntu".into(),
            release: "focal".into(),
        }
    }
}

/// The `resources` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Hard memory limit in mebibytes.
    pub memory_mb: u64,
    /// CPU quota as a percentage of one CPU (1-100 per virtual CPU unit).
    pub cpu_quota_percent: u64,
    /// Maximum number of PIDs; 0 means unlimited.
    pub max_pids: u64,
    /// Whether the sandbox may use swap.
    pub enable_swap: bool,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_quota_percent: 50,
            max_pids: 100,
            enable_swap: false,
        }
    }
}

/// A single user-namespace UID mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UidMap {
    /// First UID of the range on the host side.
    pub host_uid: u32,
    /// First UID of the range inside the namespace.
    pub container_uid: u32,
    /// Length of the mapped range.
    pub count: u32,
}

impl Default for UidMap {
    fn default() -> Self {
        Self {
            host_uid: 1000,
            container_uid: 0,
            count: 1,
        }
    }
}

/// A single user-namespace GID mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GidMap {
    /// First GID of the range on the host side.
    pub host_gid: u32,
    /// First GID of the range inside the namespace.
    pub container_gid: u32,
    /// Length of the mapped range.
    pub count: u32,
}

impl Default for GidMap {
    fn default() -> Self {
        Self {
            host_gid: 1000,
            container_gid: 0,
            count: 1,
        }
    }
}

/// The `isolation` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Namespaces to create, a subset of [`NAMESPACE_NAMES`].
    pub namespaces: Vec<String>,
    /// UID mapping written when the `user` namespace is selected.
    pub uid_map: UidMap,
    /// GID mapping written when the `user` namespace is selected.
    pub gid_map: GidMap,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            namespaces: NAMESPACE_NAMES.iter().map(|s| (*s).into()).collect(),
            uid_map: UidMap::default(),
            gid_map: GidMap::default(),
        }
    }
}

impl IsolationConfig {
    /// Returns true if the named namespace is selected.
    #[must_use]
    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.iter().any(|ns| ns == name)
    }
}

/// The `security` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Capability names retained by the child; everything else is dropped.
    pub capabilities: Vec<String>,
    /// Seccomp policy: `default`, `strict`, `log`, `allow`, or empty (off).
    pub seccomp_policy: String,
    /// Optional JSON profile overriding the generated allow-list.
    pub seccomp_profile_path: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            seccomp_policy: "default".into(),
            seccomp_profile_path: String::new(),
        }
    }
}

/// One bind-mount record, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host-side source path.
    pub source: PathBuf,
    /// Target path, resolved inside the new root.
    pub target: PathBuf,
    /// Remount the target read-only after binding.
    #[serde(default)]
    pub read_only: bool,
}

/// The `mounts` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountsConfig {
    /// Ordered bind mounts.
    pub bind_mounts: Vec<BindMount>,
}

impl Default for MountsConfig {
    fn default() -> Self {
        Self {
            bind_mounts: vec![BindMount {
                source: PathBuf::from("/tmp"),
                target: PathBuf::from("/tmp"),
                read_only: false,
            }],
        }
    }
}

/// The `ai_module` group. An external collaborator: the isolation pipeline
/// reads nothing but `enabled`; the remaining fields configure its HTTP
/// client and are passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiModuleConfig {
    /// Whether the advisor is active.
    pub enabled: bool,
    /// Provider identifier.
    pub provider: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// API base URL.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Response token budget.
    pub max_tokens: u64,
    /// System prompt prepended to advisor requests.
    pub system_prompt: String,
    /// Report pipeline errors to the advisor automatically.
    pub auto_report_errors: bool,
}

impl Default for AiModuleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "openai".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4-turbo".into(),
            temperature: 0.2,
            max_tokens: 1000,
            system_prompt: "You are a sandbox assistant that helps analyze and configure \
                            sandbox environments."
                .into(),
            auto_report_errors: true,
        }
    }
}

/// The `logging` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: `error`, `warn`, `info`, `debug`, or `trace`.
    pub level: String,
    /// Destination: `stdout` or `file`.
    pub output: String,
    /// Log file path, used when `output` is `file`.
    pub log_file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            output: "stdout".into(),
            log_file: PathBuf::from(constants::DEFAULT_LOG_FILE),
        }
    }
}

impl LoggingConfig {
    /// Maps the configured level string onto a `tracing` level.
    /// Unrecognised strings fall back to `info`.
    #[must_use]
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// Parser for the JSON configuration document.
///
/// Parsing is a three-step pipeline, and any failure surfaces as a single
/// recoverable [`SandboxError::Config`]:
/// 1. parse the document into a JSON tree,
/// 2. check the required sections and keys are present,
/// 3. deserialize with defaults applied, then validate value ranges.
#[derive(Debug)]
pub struct ConfigParser {
    json: serde_json::Value,
}

impl ConfigParser {
    /// Creates a parser from raw JSON content.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Config`] if the content is not valid JSON.
    pub fn from_str(content: &str) -> Result<Self> {
        let json = serde_json::from_str(content).map_err(|e| SandboxError::Config {
            message: format!("failed to parse JSON: {e}"),
        })?;
        Ok(Self { json })
    }

    /// Creates a parser from a configuration file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Io`] if the file cannot be read and
    /// [`SandboxError::Config`] if it is not valid JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SandboxError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_str(&content)
    }

    /// Parses, validates, and returns the immutable configuration record.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Config`] if a required section or key is
    /// missing, or if a value fails validation.
    pub fn parse(&self) -> Result<SandboxConfiguration> {
        self.validate_required()?;
        let config: SandboxConfiguration =
            serde_json::from_value(self.json.clone()).map_err(|e| SandboxError::Config {
                message: format!("failed to deserialize configuration: {e}"),
            })?;
        config.validate()?;
        tracing::debug!(name = %config.sandbox.name, "configuration parsed");
        Ok(config)
    }

    /// Checks that the required sections and keys are present, before
    /// defaults are applied.
    fn validate_required(&self) -> Result<()> {
        let obj = self.json.as_object().ok_or_else(|| SandboxError::Config {
            message: "configuration must be a JSON object".into(),
        })?;

        let sandbox = obj.get("sandbox").ok_or_else(|| SandboxError::Config {
            message: "configuration must contain a 'sandbox' section".into(),
        })?;
        if sandbox.get("command").is_none() {
            return Err(SandboxError::Config {
                message: "'sandbox' section must contain 'command'".into(),
            });
        }

        let resources = obj.get("resources").ok_or_else(|| SandboxError::Config {
            message: "configuration must contain a 'resources' section".into(),
        })?;
        if resources.get("memory_mb").is_none() {
            return Err(SandboxError::Config {
                message: "'resources' section must contain 'memory_mb'".into(),
            });
        }

        Ok(())
    }

    /// Returns true if `path` is a readable JSON file containing both
    /// required sections. Used to filter discovery candidates.
    #[must_use]
    pub fn is_valid_config_file(path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            return false;
        };
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(json) => json.get("sandbox").is_some() && json.get("resources").is_some(),
            Err(_) => false,
        }
    }

    /// Resolves the default configuration location: `SANDBOX_CONFIG_PATH`
    /// if set, otherwise the first valid candidate from
    /// [`constants::CONFIG_SEARCH_PATHS`].
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(constants::CONFIG_PATH_ENV) {
            return Some(PathBuf::from(env_path));
        }
        constants::CONFIG_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| Self::is_valid_config_file(p))
    }
}

impl SandboxConfiguration {
    /// Validates value ranges after defaults have been applied.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Config`] when a value is out of range or a
    /// namespace name is not in the closed set.
    pub fn validate(&self) -> Result<()> {
        if self.sandbox.command.is_empty() {
            return Err(SandboxError::Config {
                message: "'sandbox.command' must not be empty".into(),
            });
        }
        if self.resources.memory_mb == 0 {
            return Err(SandboxError::Config {
                message: "'resources.memory_mb' must be positive".into(),
            });
        }
        if self.resources.cpu_quota_percent == 0 {
            return Err(SandboxError::Config {
                message: "'resources.cpu_quota_percent' must be positive".into(),
            });
        }
        for ns in &self.isolation.namespaces {
            if !NAMESPACE_NAMES.contains(&ns.as_str()) {
                return Err(SandboxError::Config {
                    message: format!("unknown namespace '{ns}'"),
                });
            }
        }
        Ok(())
    }
}
