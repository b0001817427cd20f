//! Save Trigger: read a code-editor document's text and persist it over HTTP.
//!
//! New relative to the teacher, which has no persistence call at all - the
//! HTTP client usage is grounded in the `reqwest`-based outbound call style
//! used elsewhere in the example pack for JSON `PUT`/`POST` requests. Per
//! spec.md §9's Open Question, this is exposed as a plain callable and is
//! not wired to any automatic trigger; an admin surface or external
//! scheduler (e.g. a save-point room receiving a sentinel message) is
//! expected to invoke it.

use log::warn;
use serde::Serialize;

use crate::classify::{self, RoomKind};
use crate::document::DocumentRegistry;
use crate::error::SaveError;

#[derive(Debug, Serialize)]
struct SaveRequestBody<'a> {
    #[serde(rename = "filePath")]
    file_path: &'a str,
    content: &'a str,
    source: &'a str,
}

/// Read `roomId`'s document text and `PUT` it to the persistence API.
///
/// Fails with [`SaveError::NotCodeEditorRoom`] if `room_id` doesn't satisfy
/// save eligibility (CodeEditor with a non-empty file path, per spec.md §9).
/// A non-2xx response or a network-level failure both surface as a
/// `SaveError`; the caller decides whether to retry (the core does not).
pub async fn trigger_save(
    client: &reqwest::Client,
    api_base_url: &str,
    documents: &DocumentRegistry,
    room_id: &str,
) -> Result<(), SaveError> {
    let kind = classify::classify(room_id);
    let (repository_id, file_path) = classify::save_fields(&kind)
        .ok_or_else(|| SaveError::NotCodeEditorRoom(room_id.to_string()))?;

    let content = documents.read_text(room_id).await;
    let url = format!("{}/repositories/{}/files/content", api_base_url.trim_end_matches('/'), repository_id);
    let body = SaveRequestBody {
        file_path,
        content: &content,
        source: "yjs-collaboration",
    };

    let response = client
        .put(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| SaveError::Request(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        warn!("[save] {} -> {} for room '{}'", url, status, room_id);
        return Err(SaveError::BadStatus {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
        });
    }

    Ok(())
}

/// Convenience guard used by admin surfaces before calling [`trigger_save`];
/// lets a caller short-circuit without an HTTP client on hand.
pub fn is_save_eligible(room_id: &str) -> bool {
    matches!(classify::classify(room_id), RoomKind::CodeEditor { file_path: Some(_), .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_save_eligible_requires_file_path() {
        assert!(is_save_eligible("repo-7-src/main.ts"));
        assert!(!is_save_eligible("repo-7"));
        assert!(!is_save_eligible("filetree-7"));
    }

    #[tokio::test]
    async fn trigger_save_rejects_non_code_editor_room() {
        let documents = DocumentRegistry::new();
        let client = reqwest::Client::new();
        let err = trigger_save(&client, "http://localhost:3000/api", &documents, "filetree-7")
            .await
            .unwrap_err();
        assert!(matches!(err, SaveError::NotCodeEditorRoom(_)));
    }
}
