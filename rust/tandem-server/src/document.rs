//! Document Registry: one CRDT replica per code-editor room.
//!
//! Generalizes `tandem-server`'s original per-`Room` `LoroDoc` (one document
//! embedded directly in the room struct) into a registry keyed by room id,
//! so document lifetime is governed by the Lifecycle Controller rather than
//! tied 1:1 to room membership bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use loro::{ExportMode, LoroDoc};
use tokio::sync::{Mutex, RwLock};

/// The text container name CRDT clients write editor content into.
const CONTENT_CONTAINER: &str = "monaco-content";

struct DocumentEntry {
    doc: LoroDoc,
    last_snapshot: Vec<u8>,
}

impl DocumentEntry {
    fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            last_snapshot: Vec::new(),
        }
    }
}

/// Aggregate info about a single document, for status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentInfo {
    pub exists: bool,
    pub content_length: usize,
    pub state_size: usize,
}

/// Owns one CRDT document replica per code-editor room.
///
/// The registry-wide lock is only ever held for map lookups/inserts; the
/// CPU-bound CRDT import/export work happens under each entry's own lock so
/// one busy document never blocks unrelated rooms (spec.md §5).
pub struct DocumentRegistry {
    docs: RwLock<HashMap<String, Arc<Mutex<DocumentEntry>>>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotently create a document for `room_id` if none exists yet.
    pub async fn ensure(&self, room_id: &str) {
        if self.docs.read().await.contains_key(room_id) {
            return;
        }
        let mut docs = self.docs.write().await;
        docs.entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DocumentEntry::new())));
    }

    /// Apply a CRDT update to the room's document, creating the document if
    /// necessary. Never propagates a failure to the caller: bytes that are
    /// not a valid update frame (e.g. stray awareness traffic) are a silent
    /// no-op, per spec.md §4.2/§7.
    pub async fn apply_update(&self, room_id: &str, bytes: &[u8]) {
        self.ensure(room_id).await;
        let entry = match self.docs.read().await.get(room_id).cloned() {
            Some(entry) => entry,
            None => return,
        };

        let mut entry = entry.lock().await;
        match entry.doc.import(bytes) {
            Ok(_) => match entry.doc.export(ExportMode::Snapshot) {
                Ok(snapshot) => {
                    debug!(
                        "[document:{}] applied update ({} bytes), snapshot now {} bytes",
                        room_id,
                        bytes.len(),
                        snapshot.len()
                    );
                    entry.last_snapshot = snapshot;
                }
                Err(e) => error!("[document:{}] failed to export snapshot: {}", room_id, e),
            },
            Err(e) => {
                debug!(
                    "[document:{}] update rejected by CRDT library, treating as no-op: {}",
                    room_id, e
                );
            }
        }
    }

    /// Read the current text content, or the empty string if the room has
    /// no document.
    pub async fn read_text(&self, room_id: &str) -> String {
        let entry = match self.docs.read().await.get(room_id).cloned() {
            Some(entry) => entry,
            None => return String::new(),
        };
        let entry = entry.lock().await;
        entry.doc.get_text(CONTENT_CONTAINER).to_string()
    }

    /// Aggregate info about a room's document.
    pub async fn info(&self, room_id: &str) -> DocumentInfo {
        let entry = match self.docs.read().await.get(room_id).cloned() {
            Some(entry) => entry,
            None => {
                return DocumentInfo {
                    exists: false,
                    content_length: 0,
                    state_size: 0,
                };
            }
        };
        let entry = entry.lock().await;
        DocumentInfo {
            exists: true,
            content_length: entry.doc.get_text(CONTENT_CONTAINER).len_utf8(),
            state_size: entry.last_snapshot.len(),
        }
    }

    /// Release native document resources for one room. Idempotent.
    pub async fn destroy(&self, room_id: &str) {
        self.docs.write().await.remove(room_id);
    }

    /// Bulk variant of [`Self::destroy`] for shutdown and emergency cleanup.
    pub async fn destroy_all(&self) {
        self.docs.write().await.clear();
    }

    /// Count of documents currently in memory, for status reporting.
    pub async fn count(&self) -> usize {
        self.docs.read().await.len()
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update() -> Vec<u8> {
        let doc = LoroDoc::new();
        let text = doc.get_text(CONTENT_CONTAINER);
        text.insert(0, "Hello, World!").unwrap();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let registry = DocumentRegistry::new();
        registry.ensure("repo-1-a.ts").await;
        registry.ensure("repo-1-a.ts").await;
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn apply_update_then_read_text() {
        let registry = DocumentRegistry::new();
        registry.apply_update("repo-1-a.ts", &sample_update()).await;
        assert_eq!(registry.read_text("repo-1-a.ts").await, "Hello, World!");
        let info = registry.info("repo-1-a.ts").await;
        assert!(info.exists);
        assert_eq!(info.content_length, "Hello, World!".len());
        assert!(info.state_size > 0);
    }

    #[tokio::test]
    async fn apply_update_invalid_bytes_is_silent_noop() {
        let registry = DocumentRegistry::new();
        registry.apply_update("repo-1-a.ts", b"not a real crdt frame").await;
        // Document is still created (ensure is called first) but the text is empty.
        assert_eq!(registry.read_text("repo-1-a.ts").await, "");
    }

    #[tokio::test]
    async fn read_text_on_missing_room_is_empty() {
        let registry = DocumentRegistry::new();
        assert_eq!(registry.read_text("nope").await, "");
        let info = registry.info("nope").await;
        assert!(!info.exists);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let registry = DocumentRegistry::new();
        registry.ensure("repo-1-a.ts").await;
        registry.destroy("repo-1-a.ts").await;
        registry.destroy("repo-1-a.ts").await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn destroy_all_clears_every_document() {
        let registry = DocumentRegistry::new();
        registry.ensure("repo-1-a.ts").await;
        registry.ensure("repo-2-b.ts").await;
        registry.destroy_all().await;
        assert_eq!(registry.count().await, 0);
    }
}
