//! Lifecycle Controller: grace timers, heartbeat, reap passes, shutdown.
//!
//! The teacher (`tandem-server`) has none of this, its rooms live for the
//! process lifetime and there is no heartbeat or reaper at all. This module
//! is grounded instead in the grace-period/reconnection-window idiom from
//! the `offbit-ai-zeal` reference server (`get_stats`/timer-based cleanup)
//! and in the cancellable-timer pattern laid out by spec.md §9: one-shot
//! timers keyed by room id, cancelled atomically with `addClient`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::classify::RoomKind;
use crate::config::Config;
use crate::document::DocumentRegistry;
use crate::quota::QuotaTable;
use crate::room::RoomRegistry;

/// Drives grace-period timers, the heartbeat ticker, and reap passes
/// against a [`RoomRegistry`]. See spec.md §4.5.
pub struct LifecycleController {
    config: Arc<Config>,
    rooms: Arc<RoomRegistry>,
    documents: Arc<DocumentRegistry>,
    quota: Arc<QuotaTable>,
    grace_timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    force_cleanups: AtomicUsize,
}

impl LifecycleController {
    /// Construct the controller and wire it into `rooms` as its `onRoomEmpty`
    /// delegate. The registry only holds a `Weak` back-reference, so the
    /// strong `Arc` chain is controller -> registry only.
    pub fn new(
        config: Arc<Config>,
        rooms: Arc<RoomRegistry>,
        documents: Arc<DocumentRegistry>,
        quota: Arc<QuotaTable>,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            config,
            rooms: rooms.clone(),
            documents,
            quota,
            grace_timers: Arc::new(Mutex::new(HashMap::new())),
            force_cleanups: AtomicUsize::new(0),
        });
        rooms.set_lifecycle(Arc::downgrade(&controller));
        controller
    }

    /// Count of `forceCleanupAll` invocations so far, for status/tests.
    pub fn force_cleanup_count(&self) -> usize {
        self.force_cleanups.load(Ordering::Relaxed)
    }

    pub async fn has_pending_grace_timer(&self, room_id: &str) -> bool {
        self.grace_timers.lock().await.contains_key(room_id)
    }

    /// Cancel a pending grace timer, if any. Called by `addClient` so a
    /// rejoin during the grace window aborts the pending destruction.
    pub async fn cancel_grace_timer(&self, room_id: &str) {
        if let Some(handle) = self.grace_timers.lock().await.remove(room_id) {
            handle.abort();
            debug!("[lifecycle] cancelled grace timer for room {}", room_id);
        }
    }

    pub async fn clear_all_grace_timers(&self) {
        let mut timers = self.grace_timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Room Registry delegates here once a room's active count drops to
    /// zero. FileTree/SavePoint/Unsupported/Probe rooms are destroyed on the
    /// spot; CodeEditor rooms get a grace period during which a rejoin
    /// cancels the pending destruction.
    pub async fn on_room_empty(&self, room_id: String, kind: RoomKind) {
        match kind {
            RoomKind::CodeEditor { .. } => self.arm_grace_timer(room_id).await,
            _ => {
                debug!("[lifecycle] room {} emptied, destroying immediately", room_id);
                self.rooms.destroy_room(&room_id).await;
            }
        }
    }

    async fn arm_grace_timer(&self, room_id: String) {
        let grace_period = self.config.grace_period;
        let rooms = self.rooms.clone();
        let grace_timers = self.grace_timers.clone();
        let timer_room_id = room_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if rooms.active_client_count(&timer_room_id).await == 0 {
                info!(
                    "[lifecycle] grace period elapsed for room {}, destroying",
                    timer_room_id
                );
                rooms.destroy_room(&timer_room_id).await;
            } else {
                debug!(
                    "[lifecycle] grace period elapsed for room {} but it was rejoined",
                    timer_room_id
                );
            }
            grace_timers.lock().await.remove(&timer_room_id);
        });

        let mut timers = self.grace_timers.lock().await;
        if let Some(previous) = timers.insert(room_id, handle) {
            previous.abort();
        }
    }

    /// Runs at `PingInterval`. For every known connection: terminate it if it
    /// already fails the active predicate, otherwise flip `alive` to false
    /// and send a ping, the next pong or inbound message flips it back.
    /// A peer that never acknowledges is reaped on the *following* tick.
    pub async fn heartbeat(&self) {
        for room in self.rooms.all_rooms().await {
            for conn in room.connections().await {
                if !conn.is_active() {
                    conn.close(1011, "heartbeat timeout").await;
                    self.rooms.remove_client(&room.id, &conn.client_id).await;
                    if conn.mark_quota_released() {
                        self.quota.release(conn.peer_ip, &room.id).await;
                    }
                    continue;
                }
                conn.set_alive(false);
                if !conn.send(Message::Ping(Vec::new().into())).await {
                    warn!(
                        "[lifecycle] ping send failed for {} in room {}",
                        conn.client_id, room.id
                    );
                }
            }
        }
    }

    /// Runs at a fixed interval. Dead-client eviction, then empty-room
    /// destruction, then the emergency-drain anomaly check.
    pub async fn reap(&self) {
        let evicted = self.rooms.reap_dead_clients().await;
        let destroyed = self.rooms.reap_empty_rooms().await;
        if evicted > 0 || destroyed > 0 {
            debug!(
                "[lifecycle] reap pass: evicted {} client(s), destroyed {} room(s)",
                evicted, destroyed
            );
        }

        let active = self.rooms.total_active_clients().await;
        if active > self.config.anomaly_threshold {
            warn!(
                "[lifecycle] active client count {} exceeds anomaly threshold {}, forcing cleanup",
                active, self.config.anomaly_threshold
            );
            self.force_cleanups.fetch_add(1, Ordering::Relaxed);
            self.rooms.force_cleanup_all().await;
            self.quota.reset().await;
        }
    }

    /// Close every connection with 1001, cancel every grace timer, and
    /// destroy every room and document. Does not stop the process, the
    /// caller (main's signal handler) exits once this returns.
    pub async fn shutdown(&self) {
        info!("[lifecycle] shutting down: closing all connections");
        self.clear_all_grace_timers().await;
        let closed = self.rooms.close_all(1001, "Server shutting down").await;
        self.rooms.clear_all_rooms().await;
        self.documents.destroy_all().await;
        info!("[lifecycle] shutdown closed {} connection(s)", closed);
    }
}
