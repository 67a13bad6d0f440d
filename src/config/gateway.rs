//! Gateway configuration
//!
//! Every field has a default, so an absent file or an empty one yields a
//! working local setup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::AttachConfig;
use crate::tmux::DEFAULT_CAPTURE_LINES;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl ServerSettings {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// How attach processes are launched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Multiplexer binary
    pub multiplexer: String,
    /// `TERM` for attach processes
    pub term: String,
    /// Locale for attach processes (`LANG`, `LC_ALL`, `LC_CTYPE`)
    pub lang: String,
    /// Working directory; `$HOME`, then `/tmp`, when unset
    pub working_dir: Option<PathBuf>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            multiplexer: "tmux".to_string(),
            term: "xterm-256color".to_string(),
            lang: "en_US.UTF-8".to_string(),
            working_dir: None,
        }
    }
}

impl TerminalConfig {
    /// Resolved working directory for attach processes
    pub fn resolved_working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    /// Attach settings for the session registry
    pub fn attach_config(&self) -> AttachConfig {
        AttachConfig::tmux(&self.multiplexer)
            .with_working_dir(self.resolved_working_dir())
            .with_env("TERM", &self.term)
            .with_env("LANG", &self.lang)
            .with_env("LC_ALL", &self.lang)
            .with_env("LC_CTYPE", &self.lang)
    }
}

/// Activity monitor timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Silence after which a busy session becomes idle
    pub idle_threshold_ms: u64,
    /// Period of the idle sweep
    pub idle_check_interval_ms: u64,
    /// Period of the pane diff sweep
    pub pane_check_interval_ms: u64,
    /// Period of the liveness sweep
    pub liveness_interval_ms: u64,
    /// Trailing pane lines captured for diffing
    pub capture_lines: u32,
    /// Register multiplexer sessions that were not configured
    pub discover_sessions: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 5000,
            idle_check_interval_ms: 1000,
            pane_check_interval_ms: 5000,
            liveness_interval_ms: 5000,
            capture_lines: DEFAULT_CAPTURE_LINES,
            discover_sessions: true,
        }
    }
}

impl MonitorConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn pane_check_interval(&self) -> Duration {
        Duration::from_millis(self.pane_check_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

/// A session the gateway manages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Multiplexer session name
    pub name: String,
    /// Directory the session starts in
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Command the session runs instead of a shell
    #[serde(default)]
    pub command: Option<String>,
    /// Create the session at startup if it does not exist
    #[serde(default)]
    pub autostart: bool,
}

/// Root gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSettings,
    pub terminal: TerminalConfig,
    pub monitor: MonitorConfig,
    pub sessions: Vec<SessionConfig>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Check intervals and session names
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("idle_threshold_ms", self.monitor.idle_threshold_ms),
            ("idle_check_interval_ms", self.monitor.idle_check_interval_ms),
            ("pane_check_interval_ms", self.monitor.pane_check_interval_ms),
            ("liveness_interval_ms", self.monitor.liveness_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "monitor.{} must be greater than zero",
                    field
                )));
            }
        }

        if self.terminal.multiplexer.is_empty() {
            return Err(ConfigError::Invalid(
                "terminal.multiplexer cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for session in &self.sessions {
            if session.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "session name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(session.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate session name: {}",
                    session.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.server.socket_addr(), "127.0.0.1:5000");
        assert_eq!(config.monitor.idle_threshold(), Duration::from_secs(5));
        assert_eq!(config.monitor.idle_check_interval(), Duration::from_secs(1));
        assert!(config.monitor.discover_sessions);
        assert!(config.sessions.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 6000

[monitor]
idle_threshold_ms = 2000
discover_sessions = false

[[sessions]]
name = "dev"
working_dir = "/srv/app"
autostart = true

[[sessions]]
name = "logs"
command = "tail -f /var/log/syslog"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.monitor.idle_threshold_ms, 2000);
        assert_eq!(config.monitor.liveness_interval_ms, 5000);
        assert!(!config.monitor.discover_sessions);

        assert_eq!(config.sessions.len(), 2);
        assert_eq!(config.sessions[0].name, "dev");
        assert_eq!(config.sessions[0].working_dir, Some(PathBuf::from("/srv/app")));
        assert!(config.sessions[0].autostart);
        assert_eq!(
            config.sessions[1].command.as_deref(),
            Some("tail -f /var/log/syslog")
        );
        assert!(!config.sessions[1].autostart);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = GatewayConfig::load(&dir.path().join("gateway.toml"));
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = GatewayConfig::load_or_default(None).unwrap();
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_invalid_toml() {
        let result = GatewayConfig::from_toml("[server\nport = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = GatewayConfig::from_toml("[monitor]\nidle_check_interval_ms = 0\n");
        match result {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("idle_check_interval_ms")),
            other => panic!("Expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let toml = "[[sessions]]\nname = \"dev\"\n\n[[sessions]]\nname = \"dev\"\n";
        assert!(matches!(
            GatewayConfig::from_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_empty_session_name_rejected() {
        let toml = "[[sessions]]\nname = \"  \"\n";
        assert!(matches!(
            GatewayConfig::from_toml(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_attach_config_environment() {
        let terminal = TerminalConfig {
            working_dir: Some(PathBuf::from("/work")),
            ..TerminalConfig::default()
        };
        let spec = terminal.attach_config().command_for("dev");

        assert_eq!(spec.program, "tmux");
        assert_eq!(spec.args, vec!["attach-session", "-t", "=dev"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/work")));
        for key in ["TERM", "LANG", "LC_ALL", "LC_CTYPE"] {
            assert!(spec.env.iter().any(|(k, _)| k == key), "missing {}", key);
        }
        assert!(spec
            .env
            .contains(&("TERM".to_string(), "xterm-256color".to_string())));
    }
}
