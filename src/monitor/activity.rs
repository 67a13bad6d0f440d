//! Busy/idle classification of multiplexer sessions
//!
//! Four signals feed the classification:
//! - output from a live handle (push, authoritative while attached)
//! - a periodic idle sweep turning silent busy sessions idle
//! - pane snapshot diffing for sessions nobody is attached to
//! - a liveness sweep that stops and forgets sessions tmux no longer has
//!
//! All transitions happen under the record lock and are published before it
//! is released, which keeps per-session event order and lets `subscribe`
//! take a snapshot no event can slip past.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{NotificationHub, Subscription};
use crate::config::MonitorConfig;
use crate::tmux::Multiplexer;

/// Activity classification of a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// Producing output recently
    Busy,
    /// Silent for longer than the idle threshold
    Idle,
    /// The multiplexer session is gone
    Stopped,
    /// Not monitored
    Unknown,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityState::Busy => "busy",
            ActivityState::Idle => "idle",
            ActivityState::Stopped => "stopped",
            ActivityState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single state transition, emitted once
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    /// Stable identifier of the session (its name)
    pub session_id: String,
    /// Multiplexer session name
    pub session_name: String,
    /// State after the transition
    pub state: ActivityState,
    /// State before the transition
    pub previous_state: ActivityState,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
}

impl StateChangeEvent {
    pub fn new(
        name: &str,
        state: ActivityState,
        previous_state: ActivityState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: name.to_string(),
            session_name: name.to_string(),
            state,
            previous_state,
            timestamp,
        }
    }
}

/// Monitor-owned view of one session
#[derive(Debug, Clone)]
struct ActivityRecord {
    state: ActivityState,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    /// Previous pane capture, only kept while unattached
    last_snapshot: Option<Vec<u8>>,
    /// Whether a live handle feeds push signals
    attached: bool,
}

impl ActivityRecord {
    fn seeded(now: Instant) -> Self {
        Self {
            state: ActivityState::Busy,
            last_activity: now,
            last_activity_at: Utc::now(),
            last_snapshot: None,
            attached: false,
        }
    }
}

/// Read-only summary of a monitored session
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityInfo {
    pub state: ActivityState,
    pub last_activity: DateTime<Utc>,
    pub attached: bool,
}

/// Background engine classifying sessions as busy, idle or stopped
pub struct ActivityMonitor {
    records: Mutex<HashMap<String, ActivityRecord>>,
    mux: Arc<dyn Multiplexer>,
    hub: Arc<NotificationHub>,
    config: MonitorConfig,
}

impl ActivityMonitor {
    /// Create a monitor reporting to the given hub
    pub fn new(mux: Arc<dyn Multiplexer>, hub: Arc<NotificationHub>, config: MonitorConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            mux,
            hub,
            config,
        }
    }

    /// The hub transitions are published to
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Start monitoring a session, assumed busy until proven otherwise
    ///
    /// Idempotent: an existing record is left untouched.
    pub async fn register(&self, name: &str) {
        let mut records = self.records.lock().await;
        if !records.contains_key(name) {
            records.insert(name.to_string(), ActivityRecord::seeded(Instant::now()));
            info!("Monitoring session {}", name);
        }
    }

    /// Stop monitoring a session without emitting an event
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.records.lock().await.remove(name).is_some();
        if removed {
            info!("Stopped monitoring session {}", name);
        }
        removed
    }

    /// Mark a session as having a live handle, registering it if needed
    pub async fn attach(&self, name: &str) {
        let mut records = self.records.lock().await;
        let record = records
            .entry(name.to_string())
            .or_insert_with(|| ActivityRecord::seeded(Instant::now()));
        record.attached = true;
        record.last_snapshot = None;
        debug!("Session {} attached", name);
    }

    /// Mark a session as unattended; diffing takes over
    pub async fn detach(&self, name: &str) {
        if let Some(record) = self.records.lock().await.get_mut(name) {
            record.attached = false;
            record.last_snapshot = None;
            debug!("Session {} detached", name);
        }
    }

    /// Push signal: output was seen on a live handle
    pub async fn record_activity(&self, name: &str) {
        self.record_activity_at(name, Instant::now()).await;
    }

    pub(crate) async fn record_activity_at(&self, name: &str, now: Instant) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(name) {
            Some(record) => self.mark_active(name, record, now).await,
            None => false,
        }
    }

    /// Current state of a session, `Unknown` when not monitored
    pub async fn state_of(&self, name: &str) -> ActivityState {
        self.records
            .lock()
            .await
            .get(name)
            .map(|r| r.state)
            .unwrap_or(ActivityState::Unknown)
    }

    /// Details of a monitored session
    pub async fn info(&self, name: &str) -> Option<ActivityInfo> {
        self.records.lock().await.get(name).map(|r| ActivityInfo {
            state: r.state,
            last_activity: r.last_activity_at,
            attached: r.attached,
        })
    }

    /// Snapshot of every monitored session's state
    pub async fn states(&self) -> BTreeMap<String, ActivityState> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(name, r)| (name.clone(), r.state))
            .collect()
    }

    /// Subscribe to transitions, starting with a consistent snapshot
    pub async fn subscribe(&self) -> Subscription {
        let records = self.records.lock().await;
        let states = records
            .iter()
            .map(|(name, r)| (name.clone(), r.state))
            .collect();
        self.hub.subscribe(states).await
    }

    /// Idle sweep: busy sessions silent past the threshold become idle
    pub async fn check_idle(&self) -> usize {
        self.check_idle_at(Instant::now()).await
    }

    pub(crate) async fn check_idle_at(&self, now: Instant) -> usize {
        let threshold = self.config.idle_threshold();
        let mut records = self.records.lock().await;
        let mut transitions = 0;

        for (name, record) in records.iter_mut() {
            if record.state == ActivityState::Busy
                && now.saturating_duration_since(record.last_activity) >= threshold
            {
                self.transition(name, record, ActivityState::Idle).await;
                transitions += 1;
            }
        }

        transitions
    }

    /// Diff sweep for sessions without a live handle
    pub async fn check_pane_activity(&self) -> usize {
        let unattended: Vec<String> = {
            let records = self.records.lock().await;
            records
                .iter()
                .filter(|(_, r)| !r.attached)
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut changed = 0;
        for name in unattended {
            let Some(content) = self.mux.capture_pane(&name).await else {
                continue;
            };

            let mut records = self.records.lock().await;
            let Some(record) = records.get_mut(&name) else {
                continue;
            };
            // A handle showed up while capturing; its push signal wins
            if record.attached {
                continue;
            }

            let differs = record.last_snapshot.as_ref().map(|prev| *prev != content);
            match differs {
                // First capture is only a baseline
                None => record.last_snapshot = Some(content),
                Some(false) => {}
                Some(true) => {
                    record.last_snapshot = Some(content);
                    self.mark_active(&name, record, Instant::now()).await;
                    changed += 1;
                }
            }
        }

        changed
    }

    /// Liveness sweep against the multiplexer
    ///
    /// Returns the sessions that were found gone and deregistered. When
    /// discovery is enabled, unknown multiplexer sessions get registered.
    pub async fn check_liveness(&self) -> Vec<String> {
        let monitored: Vec<String> = self.records.lock().await.keys().cloned().collect();

        let live: HashSet<String> = match self.mux.list_sessions().await {
            Ok(sessions) => sessions.into_iter().collect(),
            Err(e) => {
                warn!("Skipping liveness check, multiplexer unavailable: {}", e);
                return Vec::new();
            }
        };

        let mut records = self.records.lock().await;
        let mut stopped = Vec::new();

        for name in monitored {
            if live.contains(&name) {
                continue;
            }
            if let Some(record) = records.remove(&name) {
                self.publish(&name, ActivityState::Stopped, record.state)
                    .await;
                stopped.push(name);
            }
        }

        if self.config.discover_sessions {
            for name in live {
                if !records.contains_key(&name) {
                    info!("Discovered session {}", name);
                    records.insert(name, ActivityRecord::seeded(Instant::now()));
                }
            }
        }

        stopped
    }

    /// Spawn the sweep tasks
    ///
    /// Names of sessions found gone are sent on `stopped_tx` so their handles
    /// can be torn down.
    pub fn start(
        self: &Arc<Self>,
        shutdown: &broadcast::Sender<()>,
        stopped_tx: mpsc::UnboundedSender<String>,
    ) -> Vec<JoinHandle<()>> {
        info!(
            "Starting activity monitor (idle threshold: {}ms)",
            self.config.idle_threshold_ms
        );

        vec![
            self.spawn_sweep(
                "idle",
                self.config.idle_check_interval(),
                shutdown.subscribe(),
                |monitor| async move {
                    monitor.check_idle().await;
                },
            ),
            self.spawn_sweep(
                "pane",
                self.config.pane_check_interval(),
                shutdown.subscribe(),
                |monitor| async move {
                    monitor.check_pane_activity().await;
                },
            ),
            self.spawn_sweep(
                "liveness",
                self.config.liveness_interval(),
                shutdown.subscribe(),
                move |monitor| {
                    let stopped_tx = stopped_tx.clone();
                    async move {
                        for name in monitor.check_liveness().await {
                            let _ = stopped_tx.send(name);
                        }
                    }
                },
            ),
        ]
    }

    fn spawn_sweep<F, Fut>(
        self: &Arc<Self>,
        label: &'static str,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
        sweep: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(Arc::clone(&monitor)).await,
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("{} sweep stopped", label);
        })
    }

    /// Refresh the activity timestamp, waking an idle session
    async fn mark_active(&self, name: &str, record: &mut ActivityRecord, now: Instant) -> bool {
        record.last_activity = now;
        record.last_activity_at = Utc::now();
        if record.state == ActivityState::Idle {
            self.transition(name, record, ActivityState::Busy).await;
            return true;
        }
        false
    }

    async fn transition(&self, name: &str, record: &mut ActivityRecord, state: ActivityState) {
        let previous = record.state;
        record.state = state;
        self.publish(name, state, previous).await;
    }

    async fn publish(&self, name: &str, state: ActivityState, previous: ActivityState) {
        info!("Session {}: {} -> {}", name, previous, state);
        let event = StateChangeEvent::new(name, state, previous, Utc::now());
        self.hub.publish(&event).await;
    }
}
