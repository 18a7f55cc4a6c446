use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use axum::extract::ws::{close_code, Message};
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::id::ConnectionId;
use crate::signaling::{Identity, Role};

const DEFAULT_OUTBOUND_DEPTH: usize = 64;
const DEFAULT_LIVENESS_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames that may queue for the writer task before senders wait.
    pub outbound_buffer: usize,
    /// Liveness signals that may queue for the heartbeat monitor.
    pub liveness_buffer: usize,
    /// Upper bound on how long a writer waits for queue capacity.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_DEPTH,
            liveness_buffer: DEFAULT_LIVENESS_DEPTH,
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session left the Active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadFailed,
    WriteFailed,
    ProbeFailed,
    IdleTimeout,
    Evicted,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ReadFailed => "read_failed",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::ProbeFailed => "probe_failed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Evicted => "evicted",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Close code sent to the peer in the final close frame.
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed => close_code::NORMAL,
            CloseReason::Shutdown => close_code::AWAY,
            CloseReason::Evicted | CloseReason::IdleTimeout => close_code::POLICY,
            CloseReason::ReadFailed | CloseReason::WriteFailed | CloseReason::ProbeFailed => {
                close_code::ERROR
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session is closed")]
    Closed,
    #[error("outbound queue stalled for {0:?}")]
    Stalled(Duration),
}

impl DeliveryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeliveryError::Closed => "closed",
            DeliveryError::Stalled(_) => "stalled",
        }
    }
}

/// Receiving halves handed to the per-connection tasks.
pub struct SessionChannels {
    /// Drained by the writer task, the only owner of the socket sink.
    pub outbound: mpsc::Receiver<Message>,
    /// Drained by the heartbeat monitor.
    pub liveness: mpsc::Receiver<Instant>,
}

/// State for one admitted connection.
pub struct Session {
    identity: Identity,
    connection_id: ConnectionId,
    role: Role,
    outbound: mpsc::Sender<Message>,
    liveness: mpsc::Sender<Instant>,
    last_active: parking_lot::Mutex<Instant>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    write_timeout: Duration,
}

impl Session {
    pub fn new(
        identity: Identity,
        connection_id: ConnectionId,
        role: Role,
        config: &SessionConfig,
    ) -> (Self, SessionChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (liveness_tx, liveness_rx) = mpsc::channel(config.liveness_buffer.max(1));
        let session = Self {
            identity,
            connection_id,
            role,
            outbound: outbound_tx,
            liveness: liveness_tx,
            last_active: parking_lot::Mutex::new(Instant::now()),
            state: AtomicU8::new(SessionState::Active as u8),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            write_timeout: config.write_timeout,
        };
        let channels = SessionChannels {
            outbound: outbound_rx,
            liveness: liveness_rx,
        };
        (session, channels)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Token cancelled when the session closes. Every per-connection task
    /// selects on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shuts the session down. Exactly one caller wins and gets `true`; the
    /// winner records the reason and cancels the session token, which makes
    /// the writer task send the close frame and drop the socket. Losers return
    /// `false` without side effects.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);

        counter!("beach_signal_sessions_closed_total", 1, "reason" => reason.as_str());
        info!(
            identity = %self.identity,
            connection_id = %self.connection_id,
            role = %self.role,
            reason = reason.as_str(),
            "session closed"
        );
        true
    }

    /// Queues a frame for the writer task, waiting at most the write timeout
    /// for capacity.
    pub async fn send(&self, message: Message) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        match timeout(self.write_timeout, self.outbound.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Stalled(self.write_timeout)),
        }
    }

    /// Queues an empty protocol-level ping.
    pub async fn probe(&self) -> Result<(), DeliveryError> {
        self.send(Message::Ping(Vec::new())).await
    }

    /// Records inbound application traffic and notifies the monitor.
    ///
    /// Never blocks. When the mailbox is full the signal is dropped and the
    /// monitor only sees an older instant; it re-reads `last_active` before
    /// closing for idleness, so the dropped signal still counts. A closed
    /// mailbox means the monitor has stopped.
    pub fn signal_liveness(&self) {
        let now = Instant::now();
        *self.last_active.lock() = now;
        match self.liveness.try_send(now) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(identity = %self.identity, "liveness mailbox full; signal dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    pub(crate) fn session(identity: &str, role: Role) -> (Arc<Session>, SessionChannels) {
        session_with(identity, role, &SessionConfig::default())
    }

    pub(crate) fn session_with(
        identity: &str,
        role: Role,
        config: &SessionConfig,
    ) -> (Arc<Session>, SessionChannels) {
        let (session, channels) =
            Session::new(Identity::from(identity), ConnectionId::new(1), role, config);
        (Arc::new(session), channels)
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_won_exactly_once() {
        let (session, _channels) = session("alice", Role::Consumer);

        let mut handles = Vec::new();
        for reason in [
            CloseReason::ReadFailed,
            CloseReason::ProbeFailed,
            CloseReason::Evicted,
            CloseReason::IdleTimeout,
        ] {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.close(reason) }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.cancellation().is_cancelled());
        assert!(session.close_reason().is_some());
        assert!(!session.close(CloseReason::Shutdown));
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_queues_for_writer_until_closed() {
        let (session, mut channels) = session("alice", Role::Consumer);

        session
            .send(Message::Text("hello".into()))
            .await
            .expect("send while active");
        match channels.outbound.recv().await {
            Some(Message::Text(text)) => assert_eq!(text, "hello"),
            other => panic!("unexpected frame {other:?}"),
        }

        session.close(CloseReason::ClientClosed);
        assert_eq!(
            session.send(Message::Text("late".into())).await,
            Err(DeliveryError::Closed)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_reports_closed_when_writer_is_gone() {
        let (session, channels) = session("alice", Role::Consumer);
        drop(channels);
        assert_eq!(session.probe().await, Err(DeliveryError::Closed));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn send_times_out_on_full_queue() {
        let config = SessionConfig {
            outbound_buffer: 1,
            liveness_buffer: 1,
            write_timeout: Duration::from_millis(50),
        };
        let (session, _channels) = session_with("alice", Role::Consumer, &config);

        session.probe().await.expect("first fits");
        assert_eq!(
            session.probe().await,
            Err(DeliveryError::Stalled(Duration::from_millis(50)))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn liveness_never_blocks_and_tolerates_stopped_monitor() {
        let config = SessionConfig {
            liveness_buffer: 1,
            ..SessionConfig::default()
        };
        let (session, channels) = session_with("alice", Role::Producer, &config);

        session.signal_liveness();
        session.signal_liveness();
        session.signal_liveness();

        let SessionChannels { liveness, .. } = channels;
        drop(liveness);
        session.signal_liveness();
        assert!(!session.is_closed());
    }

    #[test_timeout::timeout]
    fn close_codes_follow_reason() {
        assert_eq!(CloseReason::ClientClosed.close_code(), close_code::NORMAL);
        assert_eq!(CloseReason::Evicted.close_code(), close_code::POLICY);
        assert_eq!(CloseReason::Shutdown.close_code(), close_code::AWAY);
        assert_eq!(CloseReason::ProbeFailed.close_code(), close_code::ERROR);
    }
}
