use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::message::{liveness_probe, FrameRouter};
use super::policy::{CloseDecision, ReconnectPolicy, ReconnectTracker, ABNORMAL_CLOSE, NORMAL_CLOSE};
use super::transport::{ChannelConnection, ChannelTransport, Frame};
use crate::observability::telemetry::{record_state_transition, redact_secrets};
use crate::reconcile::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Torn down by the owner; terminal
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "Disconnected"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Connected => write!(f, "Connected"),
            ChannelState::Closed => write!(f, "Closed"),
        }
    }
}

/// Keeps one notification channel alive for one entity type and forwards
/// its change events.
pub struct ChannelSupervisor {
    url: Url,
    scope: String,
    transport: Arc<dyn ChannelTransport>,
    policy: ReconnectPolicy,
}

/// Owner side of a running supervisor.
pub struct SupervisorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    state: watch::Receiver<ChannelState>,
    scope: String,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Whether the supervisor stopped on its own (normal close or budget spent).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the supervisor to stop by itself and return its final state.
    pub async fn join(mut self) -> ChannelState {
        if let Err(e) = (&mut self.task).await {
            warn!(scope = %self.scope, error = %e, "Channel supervisor task failed");
        }
        self.state()
    }

    /// Cancel any pending reconnect, close the connection normally and
    /// move to `Closed`.
    pub async fn shutdown(mut self) -> ChannelState {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(scope = %self.scope, error = %e, "Channel supervisor task failed");
        }
        set_state(&self.state_tx, &self.scope, ChannelState::Closed);
        self.state()
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() && !self.task.is_finished() {
            self.task.abort();
        }
    }
}

fn set_state(tx: &watch::Sender<ChannelState>, scope: &str, next: ChannelState) {
    tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        record_state_transition(scope, &current.to_string(), &next.to_string());
        *current = next;
        true
    });
}

enum Session {
    Ended(u16),
    TornDown,
}

impl ChannelSupervisor {
    pub fn new(
        url: Url,
        scope: impl Into<String>,
        transport: Arc<dyn ChannelTransport>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            url,
            scope: scope.into(),
            transport,
            policy,
        }
    }

    /// Start supervising. Change events for this scope go to `events`.
    pub fn spawn(self, events: mpsc::Sender<ChangeEvent>) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let scope = self.scope.clone();
        let task = tokio::spawn(self.run(events, shutdown_rx, Arc::clone(&state_tx)));
        SupervisorHandle {
            shutdown: Some(shutdown_tx),
            state_tx,
            state: state_rx,
            scope,
            task,
        }
    }

    async fn run(
        self,
        events: mpsc::Sender<ChangeEvent>,
        mut shutdown: oneshot::Receiver<()>,
        state: Arc<watch::Sender<ChannelState>>,
    ) {
        let mut tracker = ReconnectTracker::new(self.policy.clone());
        let mut router = FrameRouter::new(self.scope.clone());
        let url = redact_secrets(self.url.as_str());

        loop {
            set_state(&state, &self.scope, ChannelState::Connecting);
            let connected = tokio::select! {
                _ = &mut shutdown => {
                    set_state(&state, &self.scope, ChannelState::Closed);
                    return;
                }
                result = self.transport.connect(&self.url) => result,
            };

            let code = match connected {
                Ok(mut connection) => {
                    tracker.on_connected();
                    set_state(&state, &self.scope, ChannelState::Connected);
                    info!(scope = %self.scope, url = %url, "Notification channel connected");
                    if let Err(e) = connection.send_text(liveness_probe()).await {
                        debug!(scope = %self.scope, error = %e, "Liveness probe not sent");
                    }
                    match self
                        .pump(connection.as_mut(), &mut router, &events, &mut shutdown)
                        .await
                    {
                        Session::Ended(code) => code,
                        Session::TornDown => {
                            if let Err(e) = connection.close(NORMAL_CLOSE).await {
                                debug!(scope = %self.scope, error = %e, "Close handshake failed");
                            }
                            set_state(&state, &self.scope, ChannelState::Closed);
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(scope = %self.scope, url = %url, error = %e, "Notification channel connect failed");
                    ABNORMAL_CLOSE
                }
            };

            set_state(&state, &self.scope, ChannelState::Disconnected);
            match tracker.on_close(code) {
                CloseDecision::Normal => {
                    info!(scope = %self.scope, "Notification channel closed by server");
                    return;
                }
                CloseDecision::Exhausted => {
                    warn!(
                        scope = %self.scope,
                        attempts = tracker.attempts(),
                        code,
                        "Reconnect budget exhausted, staying disconnected"
                    );
                    return;
                }
                CloseDecision::Reconnect { attempt, delay } => {
                    info!(
                        scope = %self.scope,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code,
                        "Scheduling reconnect"
                    );
                    tokio::select! {
                        _ = &mut shutdown => {
                            set_state(&state, &self.scope, ChannelState::Closed);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn pump(
        &self,
        connection: &mut dyn ChannelConnection,
        router: &mut FrameRouter,
        events: &mpsc::Sender<ChangeEvent>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Session {
        loop {
            let frame = tokio::select! {
                _ = &mut *shutdown => return Session::TornDown,
                frame = connection.next_frame() => frame,
            };
            match frame {
                Frame::Text(text) => {
                    if let Some(event) = router.route(&text) {
                        if events.send(event).await.is_err() {
                            debug!(scope = %self.scope, "Event receiver gone, dropping notification");
                        }
                    }
                }
                Frame::Closed(code) => return Session::Ended(code),
            }
        }
    }
}
