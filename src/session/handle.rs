//! Live attachment to a multiplexer session
//!
//! A [`SessionHandle`] is one attach process (by default
//! `tmux attach-session`) running under its own PTY. The session itself keeps
//! living in the multiplexer after the handle is killed.

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::pty::{CommandSpec, PtyError, PtyEvent, PtyProcess, TerminalSize};
use crate::tmux::{Multiplexer, MuxError};

/// Placeholder replaced by the session name in attach arguments
pub const SESSION_PLACEHOLDER: &str = "{session}";

/// Errors that can occur while attaching to a session
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Failed to attach to session {name}: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: PtyError,
    },

    #[error("Multiplexer unavailable: {0}")]
    Multiplexer(#[from] MuxError),

    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
}

/// Result type for handle operations
pub type HandleResult<T> = Result<T, HandleError>;

/// How attach processes are started
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// Program to run
    pub program: String,
    /// Arguments, with [`SESSION_PLACEHOLDER`] substituted
    pub args: Vec<String>,
    /// Working directory of the attach process
    pub working_dir: Option<PathBuf>,
    /// Environment for the attach process
    pub env: Vec<(String, String)>,
}

impl AttachConfig {
    /// Attach through `<binary> attach-session -t =<name>`
    pub fn tmux(binary: impl Into<String>) -> Self {
        Self {
            program: binary.into(),
            args: vec![
                "attach-session".to_string(),
                "-t".to_string(),
                format!("={SESSION_PLACEHOLDER}"),
            ],
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build the command for a specific session
    pub fn command_for(&self, name: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program)
            .with_args(self.args.iter().map(|a| a.replace(SESSION_PLACEHOLDER, name)));
        spec.cwd = self.working_dir.clone();
        spec.env = self.env.clone();
        spec
    }
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self::tmux("tmux")
    }
}

/// One OS-level attachment to a named session
pub struct SessionHandle {
    name: String,
    process: PtyProcess,
}

impl SessionHandle {
    /// Attach to an existing multiplexer session
    ///
    /// Fails with [`HandleError::NotFound`] when the multiplexer does not know
    /// the session. The returned receiver is the only consumer of the handle's
    /// output and exit events.
    pub async fn attach(
        name: &str,
        mux: &dyn Multiplexer,
        config: &AttachConfig,
        size: TerminalSize,
    ) -> HandleResult<(Self, mpsc::Receiver<PtyEvent>)> {
        if !mux.session_exists(name).await? {
            return Err(HandleError::NotFound(name.to_string()));
        }

        let (process, events) = PtyProcess::spawn(&config.command_for(name), size).map_err(
            |source| HandleError::SpawnFailed {
                name: name.to_string(),
                source,
            },
        )?;

        Ok((
            Self {
                name: name.to_string(),
                process,
            },
            events,
        ))
    }

    /// Session name this handle is attached to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue input for the attach process; dropped once closing
    pub fn write(&self, data: &[u8]) {
        self.process.write(data);
    }

    /// Propagate a new geometry; `false` when nothing changed
    pub async fn resize(&self, cols: u16, rows: u16) -> HandleResult<bool> {
        Ok(self.process.resize(cols, rows).await?)
    }

    /// Terminate the attach process (idempotent)
    pub fn kill(&self) {
        self.process.kill();
    }

    /// Whether termination was requested
    pub fn is_closing(&self) -> bool {
        self.process.is_closing()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .field("process", &self.process.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::fake::FakeMultiplexer;
    use std::time::Duration;
    use tokio::time::timeout;

    fn cat_config() -> AttachConfig {
        AttachConfig {
            program: "cat".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    #[test]
    fn test_tmux_attach_command() {
        let config = AttachConfig::tmux("tmux")
            .with_working_dir("/tmp")
            .with_env("TERM", "xterm-256color");
        let spec = config.command_for("dev");
        assert_eq!(spec.program, "tmux");
        assert_eq!(spec.args, vec!["attach-session", "-t", "=dev"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_unknown_session() {
        let mux = FakeMultiplexer::default();
        let result =
            SessionHandle::attach("ghost", &mux, &cat_config(), TerminalSize::default()).await;
        assert!(matches!(result, Err(HandleError::NotFound(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_attach_multiplexer_unreachable() {
        let mux = FakeMultiplexer::with_sessions(["dev"]);
        mux.set_unreachable(true);
        let result =
            SessionHandle::attach("dev", &mux, &cat_config(), TerminalSize::default()).await;
        assert!(matches!(result, Err(HandleError::Multiplexer(_))));
    }

    #[tokio::test]
    async fn test_attach_spawn_failure() {
        let mux = FakeMultiplexer::with_sessions(["dev"]);
        let config = AttachConfig {
            program: "/nonexistent/attach-binary".to_string(),
            ..cat_config()
        };
        let result = SessionHandle::attach("dev", &mux, &config, TerminalSize::default()).await;
        assert!(matches!(result, Err(HandleError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_attach_write_kill() {
        let mux = FakeMultiplexer::with_sessions(["dev"]);
        let (handle, mut events) =
            SessionHandle::attach("dev", &mux, &cat_config(), TerminalSize::default())
                .await
                .unwrap();
        assert_eq!(handle.name(), "dev");

        handle.write(b"ping\n");
        let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert!(matches!(first, Some(PtyEvent::Output(_))));

        handle.kill();
        assert!(handle.is_closing());

        let mut saw_exit = false;
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
            if let PtyEvent::Exit(_) = event {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }
}
