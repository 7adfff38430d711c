//! The per-tab streaming connection.
//!
//! One WebSocket per browser tab. The single connection task owns both
//! halves of the socket, so every outbound frame — session events, exit
//! reports, pings, file acknowledgements — is serialized through it, each
//! write under a 10 second deadline. Inbound frames drive registration,
//! input, activity, and the file-upload machine.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Extension,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::protocol::{AckStatus, Frame, FrameError};
use crate::session::{self, ClientEvent};
use crate::transfer::{ChunkOutcome, FileTransfer};

use super::auth::AuthedUser;
use super::AppState;

/// Liveness: ping cadence and how long we tolerate silence. Generous for
/// mobile browsers that suspend background tabs.
const PING_PERIOD: Duration = Duration::from_secs(50);
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Deadline applied to each outbound write.
const WRITE_WAIT: Duration = Duration::from_secs(10);

pub(super) async fn stream(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state, session_id, user))
}

async fn handle_stream(socket: WebSocket, state: AppState, session_id: String, user: AuthedUser) {
    // Unknown id and foreign owner get the same rejection.
    let session = state
        .sessions
        .get(&session_id)
        .filter(|s| s.user_id == user.id);
    let Some(session) = session else {
        close_with(socket, close_code::POLICY, "session not found").await;
        return;
    };

    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let client_id = session::next_client_id();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ClientEvent>();
    let mut registry_events = state.sessions.subscribe_events();
    let exit_signal = session.exit_signal();

    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut registered = false;
    let mut is_writer = false;
    let mut transfer: Option<FileTransfer> = None;

    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // the first tick fires immediately
    let idle = tokio::time::sleep(PONG_WAIT);
    tokio::pin!(idle);

    tracing::debug!(session = %session.id, client = client_id, user = %user.id, "client connected");

    // `break Some((code, reason))` sends a close frame on the way out.
    let close_reason: Option<(u16, &'static str)> = loop {
        tokio::select! {
            // Session events -> wire frames
            event = event_rx.recv() => {
                let Some(event) = event else { break None };
                if let ClientEvent::WriteState(writer) = &event {
                    is_writer = *writer;
                }
                if send_frame(&mut ws_tx, event_frame(event)).await.is_err() {
                    break None;
                }
            }

            // Inbound frames
            msg = ws_rx.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + PONG_WAIT);
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => continue, // text, ping, pong
                    Some(Err(e)) => {
                        tracing::debug!(client = client_id, ?e, "websocket read error");
                        break None;
                    }
                };

                let frame = match Frame::decode(&data) {
                    Ok(frame) => frame,
                    Err(FrameError::UnknownType(byte)) => {
                        tracing::debug!(client = client_id, byte, "ignoring unknown frame type");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(client = client_id, %e, "malformed frame");
                        break Some((close_code::POLICY, "malformed frame"));
                    }
                };

                match frame {
                    Frame::Stdin(input) => {
                        if is_writer {
                            session.write_input(input).await;
                        }
                    }

                    Frame::Resize { cols, rows } => {
                        if !registered {
                            // A hidden tab cannot register; wait for real
                            // dimensions.
                            if cols == 0 && rows == 0 {
                                continue;
                            }
                            if !session.register_client(client_id, cols, rows, event_tx.clone()) {
                                break Some((close_code::NORMAL, "session closed"));
                            }
                            registered = true;
                        } else {
                            session.set_activity(client_id, cols, rows);
                        }
                    }

                    Frame::FileStart { size, name } => {
                        if !is_writer {
                            if send_ack(&mut ws_tx, AckStatus::Error, "viewer cannot upload files").await.is_err() {
                                break None;
                            }
                            continue;
                        }
                        // A new start silently replaces any transfer in
                        // flight.
                        if let Some(prior) = transfer.take() {
                            prior.abort().await;
                        }
                        let cwd = match session.working_dir() {
                            Ok(cwd) => cwd,
                            Err(e) => {
                                tracing::warn!(session = %session.id, ?e, "cwd lookup failed");
                                if send_ack(&mut ws_tx, AckStatus::Error, "failed to get working directory").await.is_err() {
                                    break None;
                                }
                                continue;
                            }
                        };
                        let ack = match FileTransfer::begin(&cwd, &name, size).await {
                            Ok(started) => {
                                transfer = Some(started);
                                (AckStatus::Progress, String::new())
                            }
                            Err(e) => (AckStatus::Error, e.to_string()),
                        };
                        if send_ack(&mut ws_tx, ack.0, &ack.1).await.is_err() {
                            break None;
                        }
                    }

                    Frame::FileChunk { offset, data } => {
                        if !is_writer {
                            if send_ack(&mut ws_tx, AckStatus::Error, "viewer cannot upload files").await.is_err() {
                                break None;
                            }
                            continue;
                        }
                        let Some(active) = transfer.as_mut() else {
                            if send_ack(&mut ws_tx, AckStatus::Error, "no active transfer").await.is_err() {
                                break None;
                            }
                            continue;
                        };
                        let ack = match active.accept_chunk(offset, &data).await {
                            Ok(ChunkOutcome::More) => (AckStatus::Progress, String::new()),
                            Ok(ChunkOutcome::Complete) => {
                                let done = transfer.take().expect("transfer in flight");
                                (AckStatus::Success, done.finish().await)
                            }
                            Err(e) => {
                                if let Some(failed) = transfer.take() {
                                    failed.abort().await;
                                }
                                (AckStatus::Error, e.to_string())
                            }
                        };
                        if send_ack(&mut ws_tx, ack.0, &ack.1).await.is_err() {
                            break None;
                        }
                    }

                    // Server-to-client frame types echoed back are ignored.
                    _ => {}
                }
            }

            _ = ping.tick() => {
                if send_message(&mut ws_tx, Message::Ping(Bytes::new())).await.is_err() {
                    break None;
                }
            }

            () = &mut idle => {
                tracing::debug!(client = client_id, "liveness timeout, closing");
                break None;
            }

            // Shell exit: drain queued output first so the client sees
            // everything the shell printed before the exit report.
            _ = exit_signal.cancelled() => {
                while let Ok(event) = event_rx.try_recv() {
                    if let ClientEvent::WriteState(writer) = &event {
                        is_writer = *writer;
                    }
                    if send_frame(&mut ws_tx, event_frame(event)).await.is_err() {
                        break;
                    }
                }
                let code = session.exit_code().unwrap_or(0);
                let _ = send_frame(&mut ws_tx, Frame::Exit(code as u32)).await;
                break None;
            }

            // Session list changes for this user, from any source.
            result = registry_events.recv() => {
                match result {
                    Ok(event) if event.user_id() == user.id => {
                        if send_frame(&mut ws_tx, Frame::SessionsChange).await.is_err() {
                            break None;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(client = client_id, missed, "registry events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break Some((close_code::NORMAL, "server shutting down"));
                }
            }
        }
    };

    if registered {
        session.remove_client(client_id);
    }
    if let Some(pending) = transfer.take() {
        pending.abort().await;
    }
    // The last client to leave an exited session removes it.
    if session.has_exited() && session.client_count() == 0 {
        state.sessions.remove(&session.id);
    }
    if let Some((code, reason)) = close_reason {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    }
    tracing::debug!(
        session = %session.id,
        client = client_id,
        remaining = session.client_count(),
        "client disconnected"
    );
}

fn event_frame(event: ClientEvent) -> Frame {
    match event {
        ClientEvent::Output(data) => Frame::Stdout(data),
        ClientEvent::WriteState(writer) => Frame::WriteState(writer),
        ClientEvent::TerminalSize { cols, rows } => Frame::ResizeNotify { cols, rows },
        ClientEvent::ClientCount(count) => Frame::ClientCount(count),
    }
}

async fn send_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: Message,
) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_WAIT, ws_tx.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

async fn send_frame(ws_tx: &mut SplitSink<WebSocket, Message>, frame: Frame) -> Result<(), ()> {
    send_message(ws_tx, Message::Binary(frame.encode())).await
}

async fn send_ack(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    status: AckStatus,
    message: &str,
) -> Result<(), ()> {
    send_frame(ws_tx, Frame::ack(status, message)).await
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
