//! # sandbox — process-isolation CLI
//!
//! Loads the configuration (explicit `--config`, then `SANDBOX_CONFIG_PATH`,
//! then the well-known candidate locations, then built-in defaults), applies
//! the command-line overrides, and runs the given command inside the
//! sandbox. The process exits with the child's exit code, or 1 on
//! configuration failure.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use sandbox_common::config::{ConfigParser, LoggingConfig, SandboxConfiguration};
use sandbox_runtime::manager::SandboxManager;

/// Run a command inside a namespace, cgroup, capability, and seccomp
/// sandbox.
#[derive(Parser, Debug)]
#[command(
    name = "sandbox",
    version,
    disable_version_flag = true,
    about,
    after_help = "Examples:\n  \
        sandbox --config /etc/sandbox/default.json -- /bin/bash\n  \
        sandbox -n mysandbox -- /bin/ls -la\n  \
        sandbox --ai -c config.json -- echo hello"
)]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sandbox instance name override.
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// Enable debug logging regardless of the configured level.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Print version information.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Enable the AI advisor module.
    #[arg(long)]
    ai: bool,

    /// Command to execute inside the sandbox, after `--`.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<String>,
}

/// Initializes the global tracing subscriber from the logging config.
/// The file sink is wrapped in a mutex so records from any thread are
/// written whole.
fn init_logging(logging: &LoggingConfig) {
    let level = logging.tracing_level();

    if logging.output == "file" {
        if let Some(parent) = logging.log_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.log_file)
        {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!(
                    "sandbox: cannot open log file {}: {e}; logging to stdout",
                    logging.log_file.display()
                );
            }
        }
    }

    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Loads the configuration from the CLI path, the discovered default
/// location, or built-in defaults.
fn load_configuration(cli: &Cli) -> anyhow::Result<SandboxConfiguration> {
    if let Some(path) = &cli.config {
        if !ConfigParser::is_valid_config_file(path) {
            anyhow::bail!("invalid configuration file: {}", path.display());
        }
        return Ok(ConfigParser::from_file(path)?.parse()?);
    }

    if let Some(path) = ConfigParser::default_config_path() {
        return Ok(ConfigParser::from_file(&path)?.parse()?);
    }

    Ok(SandboxConfiguration::default())
}

fn main() {
    let cli = Cli::parse();

    let mut config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sandbox: {e}");
            std::process::exit(1);
        }
    };

    // Command-line overrides on top of the loaded document.
    config.sandbox.command.clone_from(&cli.command);
    if let Some(name) = &cli.name {
        config.sandbox.name.clone_from(name);
    }
    if cli.ai {
        config.ai_module.enabled = true;
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }

    if let Err(e) = config.validate() {
        eprintln!("sandbox: {e}");
        std::process::exit(1);
    }

    init_logging(&config.logging);
    tracing::info!(command = %config.sandbox.command[0], "starting sandbox platform");

    let mut manager = SandboxManager::new(config);
    manager.register_default_modules();

    let result = manager.run();

    if result.success {
        tracing::info!("sandbox executed successfully");
    } else if let Some(message) = &result.error_message {
        tracing::error!(error = %message, "sandbox execution failed");
    }

    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }

    // Negative signal codes wrap modulo 256 at the OS boundary.
    std::process::exit(result.exit_code);
}
