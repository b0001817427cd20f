//! Connection Quota: caps concurrent connections per (client IP, room).
//!
//! New relative to the teacher (`tandem-server` has no per-IP bookkeeping at
//! all); grounded in the registry style the teacher already uses for
//! `Room::peer_count`, an atomic-ish counter that is deleted once it hits
//! zero, matching `RoomManager::leave`'s empty-room cleanup in the
//! `elske-choice-sherpa` reference file.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::Mutex;

/// Mapping peer-IP -> mapping room-id -> connection count.
///
/// Invariant: every positive count corresponds to at least one active
/// connection from that IP in that room; the entry is deleted when the
/// count drops to zero (spec.md §3).
pub struct QuotaTable {
    counts: Mutex<HashMap<IpAddr, HashMap<String, usize>>>,
    max_per_ip_per_room: usize,
}

impl QuotaTable {
    pub fn new(max_per_ip_per_room: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            max_per_ip_per_room,
        }
    }

    /// Admit a new connection from `ip` into `room_id`. Returns `false` (and
    /// makes no change) if the cap has already been reached.
    pub async fn admit(&self, ip: IpAddr, room_id: &str) -> bool {
        let mut counts = self.counts.lock().await;
        let per_room = counts.entry(ip).or_default();
        let count = per_room.entry(room_id.to_string()).or_insert(0);
        if *count >= self.max_per_ip_per_room {
            if *count == 0 {
                per_room.remove(room_id);
            }
            return false;
        }
        *count += 1;
        true
    }

    /// Release a connection previously admitted for (ip, room_id).
    pub async fn release(&self, ip: IpAddr, room_id: &str) {
        let mut counts = self.counts.lock().await;
        let Some(per_room) = counts.get_mut(&ip) else {
            return;
        };
        if let Some(count) = per_room.get_mut(room_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_room.remove(room_id);
            }
        }
        if per_room.is_empty() {
            counts.remove(&ip);
        }
    }

    /// Current count for (ip, room_id), mainly for tests and status.
    pub async fn count(&self, ip: IpAddr, room_id: &str) -> usize {
        self.counts
            .lock()
            .await
            .get(&ip)
            .and_then(|per_room| per_room.get(room_id))
            .copied()
            .unwrap_or(0)
    }

    /// Clear every tracked count. Used by the emergency-flush path
    /// (spec.md §4.5) after a force cleanup.
    pub async fn reset(&self) {
        self.counts.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn admits_up_to_the_cap() {
        let quota = QuotaTable::new(2);
        assert!(quota.admit(ip(), "room").await);
        assert!(quota.admit(ip(), "room").await);
        assert!(!quota.admit(ip(), "room").await);
        assert_eq!(quota.count(ip(), "room").await, 2);
    }

    #[tokio::test]
    async fn release_restores_capacity() {
        let quota = QuotaTable::new(1);
        assert!(quota.admit(ip(), "room").await);
        assert!(!quota.admit(ip(), "room").await);
        quota.release(ip(), "room").await;
        assert_eq!(quota.count(ip(), "room").await, 0);
        assert!(quota.admit(ip(), "room").await);
    }

    #[tokio::test]
    async fn admit_then_release_restores_counter() {
        let quota = QuotaTable::new(10);
        quota.admit(ip(), "room").await;
        quota.release(ip(), "room").await;
        assert_eq!(quota.count(ip(), "room").await, 0);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let quota = QuotaTable::new(10);
        quota.admit(ip(), "room-a").await;
        quota.admit(ip(), "room-b").await;
        quota.reset().await;
        assert_eq!(quota.count(ip(), "room-a").await, 0);
        assert_eq!(quota.count(ip(), "room-b").await, 0);
    }

    #[tokio::test]
    async fn eleventh_connection_from_same_ip_is_rejected() {
        let quota = QuotaTable::new(10);
        for _ in 0..10 {
            assert!(quota.admit(ip(), "repo-1-a.ts").await);
        }
        assert!(!quota.admit(ip(), "repo-1-a.ts").await);
        assert_eq!(quota.count(ip(), "repo-1-a.ts").await, 10);
    }
}
