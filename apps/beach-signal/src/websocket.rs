use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::{extract_bearer, AuthError, VerifiedIdentity};
use crate::handlers::ApiError;
use crate::id::ConnectionId;
use crate::monitor::HeartbeatMonitor;
use crate::registry::ConnectionRegistry;
use crate::router::SignalRouter;
use crate::session::{CloseReason, Session, SessionChannels};
use crate::state::AppState;

/// How long a closing connection waits for its writer to flush the close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Admits a connection. The credential is checked before the upgrade, so a
/// rejected client sees a plain 401 and never gets a socket.
pub async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let verified = match extract_bearer(&headers, query.token.as_deref())
        .ok_or(AuthError::MissingToken)
        .and_then(|token| state.verifier.verify(&token))
    {
        Ok(verified) => verified,
        Err(err) => {
            warn!(error = %err, "rejecting signaling connection");
            return ApiError::from(err).into_response();
        }
    };

    let connection_id = match state.ids.next_connection_id() {
        Ok(id) => id,
        Err(err) => {
            error!(error = %err, "failed to allocate connection id");
            return ApiError::Internal.into_response();
        }
    };

    counter!("beach_signal_connections_accepted_total", 1, "role" => verified.role.as_str());
    ws.on_upgrade(move |socket| handle_socket(socket, state, verified, connection_id))
}

/// Runs one admitted connection until it closes. The read loop runs here;
/// the writer and the heartbeat monitor run as sibling tasks.
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    verified: VerifiedIdentity,
    connection_id: ConnectionId,
) {
    let (session, channels) = Session::new(
        verified.identity,
        connection_id,
        verified.role,
        &state.session,
    );
    let session = Arc::new(session);
    let SessionChannels { outbound, liveness } = channels;

    state.registry.register(Arc::clone(&session));
    info!(
        identity = %session.identity(),
        connection_id = %connection_id,
        role = %session.role(),
        name = verified.name.as_deref().unwrap_or(""),
        "signaling connection registered"
    );

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(
        sink,
        outbound,
        Arc::clone(&session),
        state.registry.clone(),
        state.session.write_timeout,
    ));
    let monitor = HeartbeatMonitor::new(
        Arc::clone(&session),
        state.registry.clone(),
        liveness,
        state.heartbeat,
    )
    .spawn();

    let reason = read_loop(stream, &session, &state.router).await;

    state
        .registry
        .remove(session.identity().as_str(), &session);
    session.close(reason);

    if let Err(err) = monitor.await {
        warn!(connection_id = %connection_id, error = %err, "heartbeat monitor panicked");
    }
    if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!(connection_id = %connection_id, "writer did not finish in time; aborting");
        writer.abort();
    }

    debug!(
        identity = %session.identity(),
        connection_id = %connection_id,
        reason = session.close_reason().map(|r| r.as_str()).unwrap_or("unknown"),
        "signaling connection finished"
    );
}

/// Sole owner of the socket sink. Drains the outbound queue until the session
/// closes, then sends a close frame carrying the close reason.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    session: Arc<Session>,
    registry: ConnectionRegistry,
    write_timeout: Duration,
) {
    let cancel = session.cancellation();
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let failure = match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("socket write stalled for {write_timeout:?}"),
        };
        warn!(
            identity = %session.identity(),
            connection_id = %session.connection_id(),
            error = %failure,
            "socket write failed; closing session"
        );
        counter!("beach_signal_write_failures_total", 1);
        registry.remove(session.identity().as_str(), &session);
        session.close(CloseReason::WriteFailed);
        return;
    }

    let reason = session.close_reason().unwrap_or(CloseReason::ClientClosed);
    let frame = CloseFrame {
        code: reason.close_code(),
        reason: Cow::Borrowed(reason.as_str()),
    };
    // The peer may already be gone; nothing is left to report either way.
    let _ = timeout(WRITER_DRAIN, sink.send(Message::Close(Some(frame)))).await;
    let _ = timeout(WRITER_DRAIN, sink.close()).await;
}

/// Reads frames in order and hands each to the router. Returns the reason the
/// connection stopped reading.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    session: &Session,
    router: &SignalRouter,
) -> CloseReason {
    let cancel = session.cancellation();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return session.close_reason().unwrap_or(CloseReason::ClientClosed);
            }
            frame = stream.next() => frame,
        };

        match frame {
            None => return CloseReason::ClientClosed,
            Some(Err(err)) => {
                debug!(
                    identity = %session.identity(),
                    connection_id = %session.connection_id(),
                    error = %err,
                    "websocket read failed"
                );
                return CloseReason::ReadFailed;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    identity = %session.identity(),
                    code = frame.as_ref().map(|f| f.code),
                    "client sent close frame"
                );
                return CloseReason::ClientClosed;
            }
            Some(Ok(frame)) => {
                router.dispatch(session, frame).await;
            }
        }
    }
}
