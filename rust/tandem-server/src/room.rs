//! Room Registry: the set of rooms and their members, and broadcast fan-out.
//!
//! Generalizes `tandem-server`'s `Room`/`Rooms` pair. The teacher keeps a
//! `broadcast::Sender<(Uuid, Message)>` per room and relies on every peer's
//! own receiver to filter out its own messages; this registry instead keeps
//! an explicit per-connection outbox so membership, liveness, and the
//! active-client predicate (spec.md §3) are all directly inspectable rather
//! than implied by channel subscriber counts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use rand::Rng;
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;

use crate::classify::RoomKind;
use crate::document::DocumentRegistry;
use crate::lifecycle::LifecycleController;

/// Bound on how long a single peer send may take before that peer is
/// considered dead. Required by spec.md §5: a send that cannot complete
/// promptly must not stall the whole broadcast.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// A single accepted WebSocket connection's server-side bookkeeping.
///
/// `alive` and `last_activity` are atomics rather than fields behind the
/// room's member-set lock: the heartbeat ticker and the per-connection
/// message task both touch them independently of room membership changes.
pub struct Connection {
    pub client_id: String,
    pub room_id: String,
    pub peer_ip: IpAddr,
    pub connected_at: Instant,
    last_activity_ms: AtomicU64,
    alive: AtomicBool,
    quota_released: AtomicBool,
    outbox: mpsc::Sender<Message>,
}

impl Connection {
    pub fn new(room_id: String, peer_ip: IpAddr, outbox: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            client_id: generate_client_id(),
            room_id,
            peer_ip,
            connected_at: Instant::now(),
            last_activity_ms: AtomicU64::new(now_ms()),
            alive: AtomicBool::new(true),
            quota_released: AtomicBool::new(false),
            outbox,
        })
    }

    /// Whether the transport is still open, i.e. the writer task's receiver
    /// has not been dropped.
    pub fn is_open(&self) -> bool {
        !self.outbox.is_closed()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Active iff the transport is open, the liveness flag is set, and both
    /// ids are non-empty (they always are once a `Connection` exists, but we
    /// check explicitly to mirror spec.md §3's predicate literally).
    pub fn is_active(&self) -> bool {
        self.is_open() && self.is_alive() && !self.client_id.is_empty() && !self.room_id.is_empty()
    }

    /// Send a frame to this connection's transport, bounded by
    /// [`SEND_TIMEOUT`]. Returns `false` (and never panics or propagates an
    /// error) on a timed-out or closed channel, the caller treats that as
    /// "this peer is dead".
    pub async fn send(&self, msg: Message) -> bool {
        matches!(
            tokio::time::timeout(SEND_TIMEOUT, self.outbox.send(msg)).await,
            Ok(Ok(()))
        )
    }

    /// Close the transport with the given code/reason by sending a close
    /// frame; the connection's own task is responsible for actually
    /// tearing down the socket once it observes the channel close.
    pub async fn close(&self, code: u16, reason: &'static str) {
        let frame = Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(code),
            reason: reason.into(),
        }));
        let _ = self.send(frame).await;
    }

    /// Marks this connection's quota slot as released. Returns `true` only
    /// the first time it's called, so whichever path notices the
    /// disconnect first (heartbeat termination or the connection's own
    /// cleanup) is the only one that actually calls `QuotaTable::release`.
    pub fn mark_quota_released(&self) -> bool {
        !self.quota_released.swap(true, Ordering::Relaxed)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `client_<millis>_<random>`, a process-unique token (spec.md §3).
fn generate_client_id() -> String {
    let millis = now_ms();
    let suffix: u32 = rand::rng().random();
    format!("client_{}_{:08x}", millis, suffix)
}

/// A broadcast group identified by a room id.
pub struct Room {
    pub id: String,
    pub kind: RoomKind,
    members: RwLock<HashMap<String, Arc<Connection>>>,
    pub created_at: Instant,
    last_activity_ms: AtomicU64,
}

impl Room {
    fn new(id: String, kind: RoomKind) -> Self {
        Self {
            id,
            kind,
            members: RwLock::new(HashMap::new()),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(now_ms()),
        }
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Count of members satisfying the active predicate (spec.md §3),
    /// distinct from the raw member-set size, which may include dormant
    /// peers awaiting reap.
    pub async fn active_count(&self) -> usize {
        self.members
            .read()
            .await
            .values()
            .filter(|c| c.is_active())
            .count()
    }

    pub async fn raw_member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Snapshot of every member connection, for the heartbeat ticker.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.members.read().await.values().cloned().collect()
    }
}

/// Aggregate status, as exposed by [`RoomRegistry::status`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStatus {
    pub total_rooms: usize,
    pub total_clients: usize,
    pub code_editor_rooms: usize,
    pub file_tree_rooms: usize,
    pub grace_period_rooms: usize,
    pub documents_in_memory: usize,
}

/// Owns the set of rooms and their members; routes broadcasts; exposes
/// aggregate status. See spec.md §4.4.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    documents: Arc<DocumentRegistry>,
    lifecycle: OnceLock<Weak<LifecycleController>>,
}

impl RoomRegistry {
    pub fn new(documents: Arc<DocumentRegistry>) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            documents,
            lifecycle: OnceLock::new(),
        })
    }

    /// Wire the Lifecycle Controller this registry delegates `onRoomEmpty`
    /// to. Stored as a `Weak` reference: the controller holds a strong
    /// reference back to the registry, so a strong reference here would
    /// leak both in a cycle. Called exactly once during startup wiring.
    pub fn set_lifecycle(&self, lifecycle: Weak<LifecycleController>) {
        let _ = self.lifecycle.set(lifecycle);
    }

    fn lifecycle(&self) -> Option<Arc<LifecycleController>> {
        self.lifecycle.get().and_then(Weak::upgrade)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Snapshot of every room currently registered, for the heartbeat and
    /// reap tickers.
    pub async fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Sum of active-client counts across every room, used by the reap
    /// pass's anomaly check (spec.md §4.5/§8).
    pub async fn total_active_clients(&self) -> usize {
        let rooms = self.all_rooms().await;
        let mut total = 0;
        for room in &rooms {
            total += room.active_count().await;
        }
        total
    }

    /// Add a client to a room, creating the room on first insertion.
    /// Cancels any pending grace timer for the room. Inserting the same
    /// connection twice (by client id) is a no-op beyond the timer cancel.
    pub async fn add_client(&self, room_id: &str, kind: RoomKind, conn: Arc<Connection>) -> usize {
        let room = {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(Room::new(room_id.to_string(), kind)))
                .clone()
        };

        if let Some(lifecycle) = self.lifecycle() {
            lifecycle.cancel_grace_timer(room_id).await;
        }

        {
            let mut members = room.members.write().await;
            members.entry(conn.client_id.clone()).or_insert(conn);
        }
        room.touch();
        room.active_count().await
    }

    /// Remove a client from a room. If the connection isn't present this is
    /// a no-op (beyond touching `last_activity`). If the active count drops
    /// to zero, delegates cleanup policy to the Lifecycle Controller.
    pub async fn remove_client(&self, room_id: &str, client_id: &str) -> usize {
        let Some(room) = self.get(room_id).await else {
            return 0;
        };

        {
            let mut members = room.members.write().await;
            members.remove(client_id);
        }
        room.touch();
        let remaining = room.active_count().await;

        if remaining == 0 {
            if let Some(lifecycle) = self.lifecycle() {
                lifecycle.on_room_empty(room_id.to_string(), room.kind.clone()).await;
            }
        }

        remaining
    }

    /// Broadcast `payload` to every member of `room_id` except `sender`.
    ///
    /// Order matters (spec.md §4.4): the CRDT update is applied to the
    /// server's document replica *before* fan-out, so the replica stays
    /// consistent with anything any peer has already been sent even if the
    /// broadcast itself fails partway through. Dead peers are collected
    /// during the send pass and purged only after iteration completes, so
    /// eviction never invalidates the iterator (spec.md §9).
    pub async fn broadcast(&self, room_id: &str, payload: Vec<u8>, sender: &str) -> usize {
        let Some(room) = self.get(room_id).await else {
            return 0;
        };

        if room.kind.has_document() {
            self.documents.apply_update(room_id, &payload).await;
        }

        let members: Vec<Arc<Connection>> = room.members.read().await.values().cloned().collect();

        let mut delivered = 0usize;
        let mut dead: Vec<String> = Vec::new();
        let message = Message::Binary(payload.into());

        for member in &members {
            if member.client_id == sender {
                continue;
            }
            if !member.is_open() {
                dead.push(member.client_id.clone());
                continue;
            }
            if member.send(message.clone()).await {
                delivered += 1;
            } else {
                warn!(
                    "[room:{}] send to {} failed, marking dead",
                    room_id, member.client_id
                );
                dead.push(member.client_id.clone());
            }
        }

        if !dead.is_empty() {
            let mut members = room.members.write().await;
            for client_id in &dead {
                members.remove(client_id);
            }
        }

        room.touch();
        delivered
    }

    /// Active client count for a room (0 if the room doesn't exist).
    pub async fn active_client_count(&self, room_id: &str) -> usize {
        match self.get(room_id).await {
            Some(room) => room.active_count().await,
            None => 0,
        }
    }

    /// Scan all rooms, evicting members that fail the active predicate.
    /// Rooms whose active count transitions to zero trigger `onRoomEmpty`.
    /// Returns the number of connections evicted.
    pub async fn reap_dead_clients(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut evicted = 0usize;

        for room in rooms {
            let dead: Vec<String> = {
                let members = room.members.read().await;
                members
                    .values()
                    .filter(|c| !c.is_active())
                    .map(|c| c.client_id.clone())
                    .collect()
            };
            if dead.is_empty() {
                continue;
            }

            {
                let mut members = room.members.write().await;
                for client_id in &dead {
                    members.remove(client_id);
                }
            }
            evicted += dead.len();
            debug!("[room:{}] reaped {} dead client(s)", room.id, dead.len());

            if room.active_count().await == 0 {
                if let Some(lifecycle) = self.lifecycle() {
                    lifecycle
                        .on_room_empty(room.id.clone(), room.kind.clone())
                        .await;
                }
            }
        }

        evicted
    }

    /// Destroy rooms with zero active clients and no pending grace timer.
    /// Returns the number of rooms destroyed.
    pub async fn reap_empty_rooms(&self) -> usize {
        let candidates: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut destroyed = 0usize;

        for room in candidates {
            if room.active_count().await != 0 {
                continue;
            }
            let has_timer = match self.lifecycle() {
                Some(lifecycle) => lifecycle.has_pending_grace_timer(&room.id).await,
                None => false,
            };
            if has_timer {
                continue;
            }
            self.destroy_room(&room.id).await;
            destroyed += 1;
        }

        destroyed
    }

    /// Destroy a single room: removes it from the registry and destroys its
    /// document (if any). Idempotent.
    pub async fn destroy_room(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
        self.documents.destroy(room_id).await;
    }

    /// Close every connection with code 1008, destroy every room and
    /// document, and clear all grace timers. Used when the aggregate
    /// active-client anomaly threshold is exceeded (spec.md §4.5/§7).
    /// Returns the number of connections closed.
    pub async fn force_cleanup_all(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.write().await.drain().map(|(_, r)| r).collect();
        let mut closed = 0usize;

        for room in &rooms {
            let members: Vec<Arc<Connection>> = room.members.read().await.values().cloned().collect();
            for member in members {
                member.close(1008, "Server maintenance: force cleanup").await;
                closed += 1;
            }
        }

        self.documents.destroy_all().await;
        if let Some(lifecycle) = self.lifecycle() {
            lifecycle.clear_all_grace_timers().await;
        }

        closed
    }

    /// Close every connection with code 1001 ("going away"). Used by
    /// shutdown; does not also destroy documents (the caller, Lifecycle
    /// Controller's `shutdown()`, does that once after this returns).
    pub async fn close_all(&self, code: u16, reason: &'static str) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut closed = 0usize;
        for room in &rooms {
            let members: Vec<Arc<Connection>> = room.members.read().await.values().cloned().collect();
            for member in members {
                member.close(code, reason).await;
                closed += 1;
            }
        }
        closed
    }

    pub async fn clear_all_rooms(&self) {
        self.rooms.write().await.clear();
    }

    /// Aggregate status for monitoring (spec.md §4.4).
    pub async fn status(&self) -> RegistryStatus {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut status = RegistryStatus {
            total_rooms: rooms.len(),
            documents_in_memory: self.documents.count().await,
            ..Default::default()
        };

        for room in &rooms {
            status.total_clients += room.active_count().await;
            match room.kind {
                RoomKind::CodeEditor { .. } => status.code_editor_rooms += 1,
                RoomKind::FileTree { .. } => status.file_tree_rooms += 1,
                _ => {}
            }
            if let Some(lifecycle) = self.lifecycle()
                && lifecycle.has_pending_grace_timer(&room.id).await
            {
                status.grace_period_rooms += 1;
            }
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;

    fn test_conn(room_id: &str) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Connection::new(room_id.to_string(), "127.0.0.1".parse().unwrap(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn add_then_remove_client_restores_membership() {
        let documents = Arc::new(DocumentRegistry::new());
        let registry = RoomRegistry::new(documents);
        let (conn, _rx) = test_conn("filetree-1");
        let client_id = conn.client_id.clone();

        let count = registry
            .add_client("filetree-1", classify("filetree-1"), conn)
            .await;
        assert_eq!(count, 1);

        let remaining = registry.remove_client("filetree-1", &client_id).await;
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn remove_client_not_present_is_noop() {
        let documents = Arc::new(DocumentRegistry::new());
        let registry = RoomRegistry::new(documents);
        let remaining = registry.remove_client("nonexistent", "client_x").await;
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_counts_peers() {
        let documents = Arc::new(DocumentRegistry::new());
        let registry = RoomRegistry::new(documents);

        let (a, mut a_rx) = test_conn("filetree-1");
        let (b, mut b_rx) = test_conn("filetree-1");
        let a_id = a.client_id.clone();

        registry.add_client("filetree-1", classify("filetree-1"), a.clone()).await;
        registry.add_client("filetree-1", classify("filetree-1"), b.clone()).await;

        let delivered = registry.broadcast("filetree-1", vec![1, 2, 3], &a_id).await;
        assert_eq!(delivered, 1);

        assert!(a_rx.try_recv().is_err());
        let received = b_rx.try_recv().unwrap();
        assert!(matches!(received, Message::Binary(ref bytes) if bytes.as_ref() == [1, 2, 3]));
    }

    #[tokio::test]
    async fn broadcast_applies_crdt_update_before_fanout_for_code_editor_rooms() {
        let documents = Arc::new(DocumentRegistry::new());
        let registry = RoomRegistry::new(documents.clone());

        let (a, _a_rx) = test_conn("repo-1-a.ts");
        let (b, mut b_rx) = test_conn("repo-1-a.ts");
        let a_id = a.client_id.clone();

        registry.add_client("repo-1-a.ts", classify("repo-1-a.ts"), a).await;
        registry.add_client("repo-1-a.ts", classify("repo-1-a.ts"), b).await;

        let doc = loro::LoroDoc::new();
        doc.get_text("monaco-content").insert(0, "hi").unwrap();
        let update = doc.export(loro::ExportMode::all_updates()).unwrap();

        registry.broadcast("repo-1-a.ts", update, &a_id).await;

        assert_eq!(documents.read_text("repo-1-a.ts").await, "hi");
        assert!(b_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn active_client_count_excludes_dormant_peers() {
        let documents = Arc::new(DocumentRegistry::new());
        let registry = RoomRegistry::new(documents);
        let (conn, _rx) = test_conn("filetree-1");
        conn.set_alive(false);
        registry.add_client("filetree-1", classify("filetree-1"), conn).await;
        assert_eq!(registry.active_client_count("filetree-1").await, 0);
    }

    #[tokio::test]
    async fn reap_dead_clients_evicts_inactive_members() {
        let documents = Arc::new(DocumentRegistry::new());
        let registry = RoomRegistry::new(documents);
        let (conn, _rx) = test_conn("filetree-1");
        conn.set_alive(false);
        registry.add_client("filetree-1", classify("filetree-1"), conn).await;

        let evicted = registry.reap_dead_clients().await;
        assert_eq!(evicted, 1);
    }
}
