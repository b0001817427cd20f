//! Connection Handler: per-accepted-socket entrypoint.
//!
//! Directly grounded in `tandem-server`'s `handle_connection` (the
//! `accept_hdr_async` callback for path extraction, the `ws_stream.split()` +
//! mpsc "direct" outbox + dedicated send task shape) but generalized from a
//! flat accept/relay loop into the full validate -> admit -> quota ->
//! capacity -> assign -> bind-handlers pipeline, with typed close codes at
//! every rejection point instead of a silent `return Ok(())`.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::AppState;
use crate::classify::{self, RoomKind};
use crate::room::Connection;

/// Bound on the per-connection outbox: broadcasts and direct sends queue
/// here before the send task writes them to the socket.
const OUTBOX_CAPACITY: usize = 64;

fn extract_room_id(path: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        "default".to_string()
    } else {
        path.to_string()
    }
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

/// Accept one socket, run its full lifecycle, and never propagate an error:
/// per spec.md §7, an uncaught per-connection error must not crash the
/// process; it is logged and the connection is simply dropped.
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, state: Arc<AppState>) {
    let room_id_holder = Arc::new(std::sync::Mutex::new(String::new()));
    let holder = room_id_holder.clone();
    let callback = move |req: &Request, resp: Response| {
        *holder.lock().unwrap() = extract_room_id(req.uri().path());
        Ok(resp)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[conn] handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };
    let room_id = room_id_holder.lock().unwrap().clone();
    let peer_ip = peer_addr.ip();

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Step 2: the literal `/default` path is a connectivity probe, not a room.
    if room_id == "default" {
        let _ = ws_tx.send(close_frame(1000, "test connection")).await;
        return;
    }

    // Step 3: classify and refuse unsupported shapes outright.
    let kind = classify::classify(&room_id);
    if kind == RoomKind::Unsupported {
        warn!("[conn] rejecting unsupported room '{}' from {}", room_id, peer_addr);
        let _ = ws_tx.send(close_frame(1008, "Unauthorized room access")).await;
        return;
    }

    // Step 4: per-(IP, room) connection quota.
    if !state.quota.admit(peer_ip, &room_id).await {
        warn!(
            "[conn] quota exceeded for {} in room '{}', rejecting",
            peer_ip, room_id
        );
        let _ = ws_tx
            .send(close_frame(1008, "Too many connections per IP per room"))
            .await;
        return;
    }

    // Step 5: room-wide capacity.
    if state.rooms.active_client_count(&room_id).await >= state.config.max_clients_per_room {
        state.quota.release(peer_ip, &room_id).await;
        warn!("[conn] room '{}' at capacity, rejecting {}", room_id, peer_addr);
        let _ = ws_tx.send(close_frame(1008, "Room capacity exceeded")).await;
        return;
    }

    // Steps 6-7: assign identity, join the room.
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
    let conn = Connection::new(room_id.clone(), peer_ip, outbox_tx);
    let client_id = conn.client_id.clone();
    let conn_handle = conn.clone();

    let active = state.rooms.add_client(&room_id, kind.clone(), conn).await;
    info!(
        "[conn] {} joined '{}' from {} ({} active)",
        client_id, room_id, peer_addr, active
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Step 8: bind transport event handlers via the recv loop below.
    loop {
        match ws_rx.next().await {
            Some(Ok(msg)) => {
                if msg.is_close() {
                    break;
                }
                // Any inbound frame, including pong, is a liveness signal.
                conn_handle.touch();
                conn_handle.set_alive(true);
                if msg.is_binary() {
                    route_message(&state, &room_id, &kind, &client_id, msg.into_data().to_vec())
                        .await;
                }
            }
            Some(Err(e)) => {
                warn!(
                    "[conn] {} websocket error in '{}', synthesizing disconnect: {}",
                    client_id, room_id, e
                );
                break;
            }
            None => break,
        }
    }

    send_task.abort();
    let remaining = state.rooms.remove_client(&room_id, &client_id).await;
    if conn_handle.mark_quota_released() {
        state.quota.release(peer_ip, &room_id).await;
    }
    info!(
        "[conn] {} left '{}' ({} active remain)",
        client_id, room_id, remaining
    );
}

/// Route one inbound binary frame. FileTree rooms get a best-effort typed
/// decode purely for logging/dispatch clarity; whether or not it matches,
/// the raw bytes are always relayed byte-for-byte via the same broadcast
/// call (spec.md §4.6, §8 scenario 4).
async fn route_message(state: &AppState, room_id: &str, kind: &RoomKind, sender: &str, bytes: Vec<u8>) {
    if let RoomKind::FileTree { .. } = kind
        && let Ok(text) = std::str::from_utf8(&bytes)
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(text)
        && value.get("type").and_then(|t| t.as_str()) == Some("fileTree")
    {
        debug!("[room:{}] typed fileTree event from {}", room_id, sender);
    }
    state.rooms.broadcast(room_id, bytes, sender).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_room_id_strips_leading_slash() {
        assert_eq!(extract_room_id("/repo-7-a.ts"), "repo-7-a.ts");
        assert_eq!(extract_room_id("/"), "default");
        assert_eq!(extract_room_id("/default"), "default");
        assert_eq!(extract_room_id("/filetree-1?token=abc"), "filetree-1");
    }

    #[test]
    fn extract_room_id_empty_path_is_default() {
        assert_eq!(extract_room_id(""), "default");
    }
}
