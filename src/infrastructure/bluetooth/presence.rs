//! Presence Orchestrator
//!
//! Keeps a proximity session running whenever the link is down and hands
//! the acquired peer to the connection controller. A session is stopped as
//! soon as a connection attempt begins and is bounded by a timeout, after
//! which the orchestrator sits in `Waiting` until the next disconnect.

use crate::domain::error::LinkError;
use crate::domain::models::{ConnectionState, PresenceEvent, PresenceStatus};
use crate::infrastructure::bluetooth::connection::ConnectionController;
use crate::infrastructure::bluetooth::scanner::{PresenceCriteria, PresenceSession, SignalSampler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on one proximity session
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PresenceOrchestrator {
    sampler: SignalSampler,
    controller: ConnectionController,
    criteria: PresenceCriteria,
    session_timeout: Duration,
}

impl PresenceOrchestrator {
    pub fn new(
        sampler: SignalSampler,
        controller: ConnectionController,
        criteria: PresenceCriteria,
        session_timeout: Duration,
    ) -> Self {
        Self {
            sampler,
            controller,
            criteria,
            session_timeout,
        }
    }

    /// Start supervising. Dropping the handle stops everything.
    pub fn start(self) -> PresenceHandle {
        let token = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(PresenceStatus::Idle);
        let task = tokio::spawn(self.supervise(Arc::new(status_tx), token.clone()));
        PresenceHandle {
            token,
            status: status_rx,
            _task: task,
        }
    }

    async fn supervise(self, status: Arc<watch::Sender<PresenceStatus>>, token: CancellationToken) {
        let mut states = self.controller.subscribe_state();
        let mut active: Option<ActiveSession> = None;

        loop {
            let state = states.borrow_and_update().clone();
            match state {
                ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                    self.ensure_session(&mut active, &status, &token);
                }
                ConnectionState::Connecting | ConnectionState::Connected(_) => {
                    if let Some(session) = active.take() {
                        session.stop();
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        debug!("Connection controller gone");
                        break;
                    }
                }
            }
        }

        if let Some(session) = active.take() {
            session.stop();
        }
        info!("Presence detection stopped");
    }

    fn ensure_session(
        &self,
        active: &mut Option<ActiveSession>,
        status: &Arc<watch::Sender<PresenceStatus>>,
        token: &CancellationToken,
    ) {
        if active.as_ref().is_some_and(ActiveSession::is_running) {
            debug!("Presence session already running");
            return;
        }

        info!(
            "Starting presence session for '{}' (timeout {:?})",
            self.criteria.target_pattern, self.session_timeout
        );
        let session_token = token.child_token();
        let handle = tokio::spawn(run_session(
            self.sampler.start(self.criteria.clone()),
            self.controller.clone(),
            status.clone(),
            self.session_timeout,
            session_token.clone(),
        ));
        *active = Some(ActiveSession {
            token: session_token,
            handle,
        });
    }
}

struct ActiveSession {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn stop(self) {
        if self.is_running() {
            debug!("Stopping presence session");
        }
        self.token.cancel();
    }
}

/// Handle to a running orchestrator
pub struct PresenceHandle {
    token: CancellationToken,
    status: watch::Receiver<PresenceStatus>,
    _task: JoinHandle<()>,
}

impl PresenceHandle {
    pub fn status(&self) -> PresenceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PresenceStatus> {
        self.status.clone()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum SessionEnd {
    Done,
    StreamEnded,
    TimedOut,
    Cancelled,
}

async fn run_session(
    mut session: PresenceSession,
    controller: ConnectionController,
    status: Arc<watch::Sender<PresenceStatus>>,
    timeout: Duration,
    token: CancellationToken,
) {
    let end = tokio::select! {
        _ = token.cancelled() => SessionEnd::Cancelled,
        driven = tokio::time::timeout(timeout, drive(&mut session, &controller, &status)) => {
            match driven {
                Ok(true) => SessionEnd::Done,
                Ok(false) => SessionEnd::StreamEnded,
                Err(_) => SessionEnd::TimedOut,
            }
        }
    };
    // Stops the underlying scan if it is still running.
    drop(session);

    match end {
        SessionEnd::Done => {}
        SessionEnd::StreamEnded => {
            info!("Presence scan ended without a match, waiting for the next disconnect");
            status.send_replace(PresenceStatus::Waiting);
        }
        SessionEnd::TimedOut => {
            info!("Presence session timed out, waiting for the next disconnect");
            status.send_replace(PresenceStatus::Waiting);
        }
        SessionEnd::Cancelled => {
            status.send_replace(PresenceStatus::Idle);
        }
    }
}

/// Returns false when the scan ran dry before any outcome.
async fn drive(
    session: &mut PresenceSession,
    controller: &ConnectionController,
    status: &watch::Sender<PresenceStatus>,
) -> bool {
    while let Some(event) = session.next().await {
        match event {
            PresenceEvent::Loading => {
                status.send_replace(PresenceStatus::Scanning);
            }
            PresenceEvent::Acquired(device) => {
                info!("Presence acquired: {} ({}), connecting", device.name, device.id);
                status.send_replace(PresenceStatus::Acquired(device.id.clone()));
                controller.connect(device.id);
                return true;
            }
            PresenceEvent::Error(reason) => {
                let error = LinkError::ScanFailed(reason);
                warn!("{}", error);
                status.send_replace(PresenceStatus::Error(error.to_string()));
                return true;
            }
        }
    }
    false
}
