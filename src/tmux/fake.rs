//! In-memory multiplexer for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::{Multiplexer, MuxError, MuxResult};

/// Multiplexer whose sessions and pane contents are set by the test
#[derive(Default)]
pub struct FakeMultiplexer {
    sessions: Mutex<HashSet<String>>,
    panes: Mutex<HashMap<String, Vec<u8>>>,
    unreachable: AtomicBool,
}

impl FakeMultiplexer {
    pub fn with_sessions<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fake = Self::default();
        fake.sessions
            .lock()
            .unwrap()
            .extend(names.into_iter().map(Into::into));
        fake
    }

    pub fn add(&self, name: &str) {
        self.sessions.lock().unwrap().insert(name.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.sessions.lock().unwrap().remove(name);
        self.panes.lock().unwrap().remove(name);
    }

    pub fn set_pane(&self, name: &str, content: &str) {
        self.panes
            .lock()
            .unwrap()
            .insert(name.to_string(), content.as_bytes().to_vec());
    }

    /// Make every call fail as if the tmux server could not be reached
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> MuxResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MuxError::CommandFailed {
                command: "fake".to_string(),
                stderr: "unreachable".to_string(),
            });
        }
        Ok(())
    }
}

impl Multiplexer for FakeMultiplexer {
    fn list_sessions(&self) -> BoxFuture<'_, MuxResult<Vec<String>>> {
        async move {
            self.check()?;
            let mut names: Vec<String> = self.sessions.lock().unwrap().iter().cloned().collect();
            names.sort();
            Ok(names)
        }
        .boxed()
    }

    fn session_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, MuxResult<bool>> {
        async move {
            self.check()?;
            Ok(self.sessions.lock().unwrap().contains(name))
        }
        .boxed()
    }

    fn capture_pane<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        async move {
            self.check().ok()?;
            self.panes.lock().unwrap().get(name).cloned()
        }
        .boxed()
    }
}
