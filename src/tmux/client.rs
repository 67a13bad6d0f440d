//! Terminal multiplexer access
//!
//! The gateway never owns sessions itself: they live in tmux and are only
//! attached to. [`Multiplexer`] is the narrow view the registry and the
//! activity monitor need; [`TmuxClient`] implements it by shelling out.

use std::path::Path;
use std::process::Output;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Default number of trailing pane lines captured for diffing
pub const DEFAULT_CAPTURE_LINES: u32 = 20;

/// Errors that can occur while talking to the multiplexer
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Failed to run {binary}: {source}")]
    Exec {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Result type for multiplexer operations
pub type MuxResult<T> = Result<T, MuxError>;

/// Read-only view of an external terminal multiplexer
pub trait Multiplexer: Send + Sync {
    /// Names of all sessions currently known to the multiplexer
    fn list_sessions(&self) -> BoxFuture<'_, MuxResult<Vec<String>>>;

    /// Whether a session with exactly this name exists
    fn session_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, MuxResult<bool>>;

    /// Snapshot of the visible pane content, `None` when it cannot be captured
    fn capture_pane<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Vec<u8>>>;
}

/// Multiplexer backed by the tmux command line
#[derive(Debug, Clone)]
pub struct TmuxClient {
    binary: String,
    capture_lines: u32,
}

impl TmuxClient {
    /// Create a client invoking the given tmux binary
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            capture_lines: DEFAULT_CAPTURE_LINES,
        }
    }

    /// Set how many trailing lines `capture_pane` returns
    pub fn with_capture_lines(mut self, lines: u32) -> Self {
        self.capture_lines = lines;
        self
    }

    /// The tmux binary in use
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Exact-match target for a session name
    ///
    /// Without the `=` prefix tmux falls back to prefix matching, so `dev`
    /// would also match `dev-2`.
    fn target(name: &str) -> String {
        format!("={name}")
    }

    /// Active pane of the exactly-named session
    fn pane_target(name: &str) -> String {
        format!("={name}:")
    }

    async fn run(&self, args: &[&str]) -> MuxResult<Output> {
        debug!("Running {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| MuxError::Exec {
                binary: self.binary.clone(),
                source,
            })
    }

    fn failure(&self, args: &[&str], output: &Output) -> MuxError {
        MuxError::CommandFailed {
            command: format!("{} {}", self.binary, args.first().copied().unwrap_or_default()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Create a detached session unless one with this name already exists
    ///
    /// Returns `true` when a new session was created.
    pub async fn create_session(
        &self,
        name: &str,
        working_dir: Option<&Path>,
        command: Option<&str>,
    ) -> MuxResult<bool> {
        if self.exists(name).await? {
            return Ok(false);
        }

        let dir = working_dir.map(|d| d.to_string_lossy().into_owned());
        let command = command.map(startup_command);
        let mut args = vec!["new-session", "-d", "-s", name];
        if let Some(dir) = dir.as_deref() {
            args.extend(["-c", dir]);
        }
        if let Some(command) = command.as_deref() {
            args.push(command);
        }

        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failure(&args, &output));
        }
        Ok(true)
    }

    /// Kill a session; returns `false` when it did not exist
    pub async fn kill_session(&self, name: &str) -> MuxResult<bool> {
        let target = Self::target(name);
        let args = ["kill-session", "-t", target.as_str()];
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_session(&stderr) {
            return Ok(false);
        }
        Err(self.failure(&args, &output))
    }

    async fn sessions(&self) -> MuxResult<Vec<String>> {
        let args = ["list-sessions", "-F", "#{session_name}"];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // No server running means no sessions, not an error
            if is_missing_session(&stderr) {
                return Ok(Vec::new());
            }
            return Err(self.failure(&args, &output));
        }

        Ok(parse_session_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn exists(&self, name: &str) -> MuxResult<bool> {
        let target = Self::target(name);
        let output = self.run(&["has-session", "-t", target.as_str()]).await?;
        Ok(output.status.success())
    }

    async fn capture(&self, name: &str) -> Option<Vec<u8>> {
        let target = Self::pane_target(name);
        let start = format!("-{}", self.capture_lines);
        let output = self
            .run(&["capture-pane", "-t", target.as_str(), "-p", "-S", start.as_str()])
            .await
            .ok()?;
        output.status.success().then_some(output.stdout)
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl Multiplexer for TmuxClient {
    fn list_sessions(&self) -> BoxFuture<'_, MuxResult<Vec<String>>> {
        self.sessions().boxed()
    }

    fn session_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, MuxResult<bool>> {
        self.exists(name).boxed()
    }

    fn capture_pane<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        self.capture(name).boxed()
    }
}

/// Parse `list-sessions -F "#{session_name}"` output
fn parse_session_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Keep the session alive in an interactive shell once `command` exits
fn startup_command(command: &str) -> String {
    format!("{}; exec bash", command)
}

/// Whether tmux stderr means "nothing there" rather than a real failure
fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("can't find session")
        || stderr.contains("session not found")
        || stderr.contains("no sessions")
        || stderr.contains("error connecting to")
}
