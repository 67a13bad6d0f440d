//! Session ownership registry
//!
//! Maps a session name to the one connection allowed to drive it. Claims for
//! the same name are serialized on a per-name slot lock; different names never
//! contend beyond the brief map lookup.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AttachConfig, HandleResult, SessionHandle};
use crate::monitor::ActivityMonitor;
use crate::pty::{PtyEvent, TerminalSize};
use crate::tmux::Multiplexer;

/// Identifier of a gateway connection
pub type ConnectionId = Uuid;

/// Message handed to a connection that lost its session to a newer claimant
pub const REPLACED_MESSAGE: &str = "Connection replaced by another client";

/// Notice sent to an evicted owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionNotice {
    /// Human readable reason, forwarded to the client
    pub message: String,
}

/// Everything a connection receives when it becomes the owner
#[derive(Debug)]
pub struct Claim {
    /// The freshly attached handle
    pub handle: Arc<SessionHandle>,
    /// Output and exit of the handle, in order
    pub events: mpsc::Receiver<PtyEvent>,
    /// Resolves if a later claimant evicts this owner
    pub evicted: oneshot::Receiver<EvictionNotice>,
}

/// Current owner of a session
struct Owner {
    connection_id: ConnectionId,
    handle: Arc<SessionHandle>,
    notice_tx: oneshot::Sender<EvictionNotice>,
}

type Slot = Arc<Mutex<Option<Owner>>>;

/// Enforces single ownership of sessions
pub struct OwnershipRegistry {
    slots: DashMap<String, Slot>,
    mux: Arc<dyn Multiplexer>,
    monitor: Arc<ActivityMonitor>,
    attach: AttachConfig,
}

impl OwnershipRegistry {
    /// Create a registry attaching through the given multiplexer
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        monitor: Arc<ActivityMonitor>,
        attach: AttachConfig,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            mux,
            monitor,
            attach,
        }
    }

    fn slot(&self, name: &str) -> Slot {
        Arc::clone(self.slots.entry(name.to_string()).or_default().value())
    }

    /// Make `connection_id` the owner of `name`
    ///
    /// A previous owner is unlinked, sent an [`EvictionNotice`] and has its
    /// handle killed before the new handle is attached. The later claimant
    /// always wins. If attaching fails the session is left unowned.
    pub async fn claim(&self, name: &str, connection_id: ConnectionId) -> HandleResult<Claim> {
        let slot = self.slot(name);
        let mut owner = slot.lock().await;

        let evicted_previous = match owner.take() {
            Some(previous) => {
                info!(
                    "Session {} claimed by {}, evicting {}",
                    name, connection_id, previous.connection_id
                );
                let _ = previous.notice_tx.send(EvictionNotice {
                    message: REPLACED_MESSAGE.to_string(),
                });
                previous.handle.kill();
                true
            }
            None => false,
        };

        let attached =
            SessionHandle::attach(name, self.mux.as_ref(), &self.attach, TerminalSize::default())
                .await;
        let (handle, events) = match attached {
            Ok(attached) => attached,
            Err(e) => {
                // No live handle remains; hand the session back to pane diffing
                if evicted_previous {
                    self.monitor.detach(name).await;
                }
                drop(owner);
                drop(slot);
                self.prune(name);
                return Err(e);
            }
        };
        let handle = Arc::new(handle);
        let (notice_tx, evicted) = oneshot::channel();

        *owner = Some(Owner {
            connection_id,
            handle: Arc::clone(&handle),
            notice_tx,
        });
        self.monitor.attach(name).await;

        debug!("Session {} now owned by {}", name, connection_id);
        Ok(Claim {
            handle,
            events,
            evicted,
        })
    }

    /// Drop ownership if `connection_id` is still the recorded owner
    ///
    /// Returns `false` when a newer claimant already took over.
    pub async fn release(&self, name: &str, connection_id: ConnectionId) -> bool {
        let Some(slot) = self.slots.get(name).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        let released = {
            let mut owner = slot.lock().await;
            match owner.as_ref() {
                Some(current) if current.connection_id == connection_id => {
                    *owner = None;
                    self.monitor.detach(name).await;
                    true
                }
                _ => false,
            }
        };
        drop(slot);

        if released {
            debug!("Session {} released by {}", name, connection_id);
            self.prune(name);
        }
        released
    }

    /// Unlink and kill the current handle without an eviction notice
    ///
    /// Used when the session disappeared from the multiplexer; the owner
    /// observes the process exit and disconnects.
    pub async fn terminate(&self, name: &str) -> bool {
        let Some(slot) = self.slots.get(name).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        let owner = slot.lock().await.take();
        drop(slot);

        match owner {
            Some(owner) => {
                info!(
                    "Terminating handle of session {} owned by {}",
                    name, owner.connection_id
                );
                owner.handle.kill();
                self.prune(name);
                true
            }
            None => false,
        }
    }

    /// Current owner of a session
    pub async fn owner_of(&self, name: &str) -> Option<ConnectionId> {
        let slot = self.slots.get(name).map(|s| Arc::clone(s.value()))?;
        let owner = slot.lock().await;
        owner.as_ref().map(|o| o.connection_id)
    }

    /// Number of sessions that currently have an owner
    pub async fn session_count(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Kill every owned handle; used during shutdown
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        for name in names {
            self.terminate(&name).await;
        }
    }

    /// Forget an empty slot nobody else is holding
    fn prune(&self, name: &str) {
        self.slots.remove_if(name, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().map(|o| o.is_none()).unwrap_or(false)
        });
    }
}
