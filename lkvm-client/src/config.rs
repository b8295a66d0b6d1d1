//! Client configuration.
//!
//! Loaded from YAML with defaults for every field, e.g.:
//!
//! ```yaml
//! tool_path: /usr/bin/lkvm
//! root_helper: sudo
//! command_timeout_secs: 30
//! refresh_interval_ms: 1000
//! # Stock lkvm boots with `run`, which stays in the foreground as the VM
//! detach_create: true
//! launch_log: /var/log/lkvm/launch.log
//! commands:
//!   create: run
//! ```

use anyhow::{Context, Result};
use lkvm_common::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::ClientError;

/// Default tool executable, resolved on PATH.
pub const DEFAULT_TOOL: &str = "lkvm";

/// Lifecycle client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Hypervisor tool executable (bare name or path)
    pub tool_path: String,

    /// Privilege helper prefixed to every invocation (e.g. "sudo")
    pub root_helper: Option<String>,

    /// Refuse to run as non-root without a root helper
    pub require_root: bool,

    /// Per-invocation timeout in seconds
    pub command_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on timeout, in milliseconds
    pub kill_grace_ms: u64,

    /// Maximum bytes captured per output stream
    pub max_output_bytes: usize,

    /// Minimum interval between two `list` refreshes, in milliseconds
    pub refresh_interval_ms: u64,

    /// Delay between re-inspections while waiting for a state, in milliseconds
    pub poll_interval_ms: u64,

    /// How long a lifecycle operation waits for its target state, in seconds
    pub settle_timeout_secs: u64,

    /// Include running instances in listings (`--run`)
    pub list_running: bool,

    /// Include stopped rootfs instances in listings (`--rootfs`)
    pub list_rootfs: bool,

    /// Read `--mem`/`--cpus` from the VM process when the listing lacks them
    pub probe_process_cmdline: bool,

    /// Start `create` in the background instead of waiting for it to exit
    pub detach_create: bool,

    /// How long a background launch is watched for an early exit, in milliseconds
    pub launch_window_ms: u64,

    /// File that collects the output of background launches
    pub launch_log: Option<String>,

    /// Subcommand names understood by the tool
    pub commands: ToolCommands,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log format (json, pretty)
    pub log_format: LogFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tool_path: DEFAULT_TOOL.to_string(),
            root_helper: None,
            require_root: false,
            command_timeout_secs: 30,
            kill_grace_ms: 2000,
            max_output_bytes: 1024 * 1024,
            refresh_interval_ms: 1000,
            poll_interval_ms: 250,
            settle_timeout_secs: 30,
            list_running: true,
            list_rootfs: true,
            probe_process_cmdline: true,
            detach_create: false,
            launch_window_ms: 1000,
            launch_log: None,
            commands: ToolCommands::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// Subcommand names, one per tool operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCommands {
    pub list: String,
    pub create: String,
    pub setup: String,
    pub sandbox: String,
    pub start: String,
    pub stop: String,
    pub pause: String,
    pub resume: String,
    pub destroy: String,
    pub balloon: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            list: "list".to_string(),
            create: "create".to_string(),
            setup: "setup".to_string(),
            sandbox: "sandbox".to_string(),
            start: "start".to_string(),
            stop: "stop".to_string(),
            pause: "pause".to_string(),
            resume: "resume".to_string(),
            destroy: "destroy".to_string(),
            balloon: "balloon".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        debug!(path = %path.display(), tool = %config.tool_path, "Loaded client configuration");
        Ok(config)
    }

    /// Check values that would make the client unusable.
    pub fn validate(&self) -> std::result::Result<(), ClientError> {
        let invalid = |field: &str, message: &str| {
            Err(ClientError::InvalidConfig(format!("{}: {}", field, message)))
        };

        if self.tool_path.trim().is_empty() {
            return invalid("tool_path", "must not be empty");
        }
        if self.command_timeout_secs == 0 {
            return invalid("command_timeout_secs", "must be greater than 0");
        }
        if self.max_output_bytes == 0 {
            return invalid("max_output_bytes", "must be greater than 0");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms", "must be greater than 0");
        }
        if self.launch_window_ms == 0 {
            return invalid("launch_window_ms", "must be greater than 0");
        }
        if !self.list_running && !self.list_rootfs {
            return invalid("list_running", "at least one of list_running and list_rootfs must be set");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return invalid("log_level", &format!("must be one of: {:?}", valid_levels));
        }

        Ok(())
    }

    /// Install the global tracing subscriber described by this config.
    pub fn init_logging(&self) -> Result<()> {
        lkvm_common::init_logging(&self.log_level, self.log_format)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn launch_window(&self) -> Duration {
        Duration::from_millis(self.launch_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.commands.stop, "stop");
        assert_eq!(config.commands.setup, "setup");
        assert!(!config.detach_create);
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
tool_path: /usr/bin/lkvm
root_helper: sudo
command_timeout_secs: 10
refresh_interval_ms: 0
log_format: json
detach_create: true
launch_window_ms: 300
commands:
  create: run
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tool_path, "/usr/bin/lkvm");
        assert_eq!(config.root_helper.as_deref(), Some("sudo"));
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.refresh_interval(), Duration::ZERO);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.commands.create, "run");
        assert!(config.detach_create);
        assert_eq!(config.launch_window(), Duration::from_millis(300));
        // Unset subcommands keep their defaults
        assert_eq!(config.commands.list, "list");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = ClientConfig::default();
        config.command_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));

        let mut config = ClientConfig::default();
        config.launch_window_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.list_running = false;
        config.list_rootfs = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tool_path: /opt/kvmtool/lkvm\nsettle_timeout_secs: 5").unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.tool_path, "/opt/kvmtool/lkvm");
        assert_eq!(config.settle_timeout(), Duration::from_secs(5));

        assert!(ClientConfig::load("/nonexistent/lkvm.yaml").is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "command_timeout_secs: 0").unwrap();
        assert!(ClientConfig::load(file.path()).is_err());
    }
}
