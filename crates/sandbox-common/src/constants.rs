//! System-wide constants and default paths.

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Default rootfs location used when the configuration does not name one.
pub const DEFAULT_ROOTFS_PATH: &str = "/var/lib/sandbox/rootfs/ubuntu_focal";

/// Default instance name.
pub const DEFAULT_SANDBOX_NAME: &str = "sandbox-default";

/// Default hostname inside the UTS namespace.
pub const DEFAULT_HOSTNAME: &str = "sandbox-container";

/// Default log file location.
pub const DEFAULT_LOG_FILE: &str = "/var/log/sandbox/sandbox.log";

/// Environment variable naming a configuration file to load.
pub const CONFIG_PATH_ENV: &str = "SANDBOX_CONFIG_PATH";

/// Candidate configuration locations, probed in order when neither the CLI
/// nor the environment names a file.
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "/etc/sandbox/default.json",
    "/var/lib/sandbox/config.json",
    "./config/default.json",
    "../config/default.json",
];

/// Mirror handed to the bootstrap helper.
pub const BOOTSTRAP_MIRROR: &str = "http://archive.ubuntu.com/ubuntu/";

/// Application name used in log output.
pub const APP_NAME: &str = "sandbox";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "sandbox";
