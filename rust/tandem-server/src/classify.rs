//! Room-ID Classifier: a pure function from a room identifier to a [`RoomKind`].
//!
//! Recognized shapes (anchored, case-sensitive), evaluated in this order:
//!
//! - `repo-<int>-<rest>` or bare `repo-<int>` -> [`RoomKind::CodeEditor`]
//! - `filetree-<int>` -> [`RoomKind::FileTree`]
//! - `savepoint-<int>` -> [`RoomKind::SavePoint`]
//! - `default` -> [`RoomKind::Probe`]
//! - anything else -> [`RoomKind::Unsupported`]
//!
//! Invalid integer parsing (overflow, non-digits) falls through to
//! `Unsupported` rather than panicking.

/// The classification of a room, carrying whatever structured fields its
/// shape implies. Dispatch on room kind (lifecycle policy, document
/// eligibility) should match on this enum rather than re-parsing strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomKind {
    /// `repo-<id>` or `repo-<id>-<file path>`. `file_path` is `None` for the
    /// bare form; admission allows both, save eligibility requires the path.
    CodeEditor {
        repository_id: u64,
        file_path: Option<String>,
    },
    /// `filetree-<id>`.
    FileTree { repository_id: u64 },
    /// `savepoint-<id>`.
    SavePoint { repository_id: u64 },
    /// The literal `default` path, interpreted as a connectivity probe.
    Probe,
    /// Empty or unrecognized room id.
    Unsupported,
}

impl RoomKind {
    /// Whether this room kind's lifecycle includes a server-side CRDT
    /// document replica (see `document.rs`).
    pub fn has_document(&self) -> bool {
        matches!(self, RoomKind::CodeEditor { .. })
    }
}

/// Classify a room id. Pure function: same input always yields the same
/// output (spec.md §8 invariant 6).
pub fn classify(room_id: &str) -> RoomKind {
    if room_id.is_empty() {
        return RoomKind::Unsupported;
    }
    if room_id == "default" {
        return RoomKind::Probe;
    }
    if let Some((repository_id, file_path)) = parse_code_editor(room_id) {
        return RoomKind::CodeEditor {
            repository_id,
            file_path,
        };
    }
    if let Some(repository_id) = parse_suffixed_int(room_id, "filetree-") {
        return RoomKind::FileTree { repository_id };
    }
    if let Some(repository_id) = parse_suffixed_int(room_id, "savepoint-") {
        return RoomKind::SavePoint { repository_id };
    }
    RoomKind::Unsupported
}

/// Parses `repo-<digits>` or `repo-<digits>-<rest>`. The bare form (no
/// trailing dash) and the dash+non-empty-rest form both match; a trailing
/// dash with nothing after it (`repo-7-`) does not, since spec.md §4.1
/// requires `rest` to be non-empty whenever it is present at all.
fn parse_code_editor(room_id: &str) -> Option<(u64, Option<String>)> {
    let after_prefix = room_id.strip_prefix("repo-")?;
    let digit_end = after_prefix
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(after_prefix.len());
    if digit_end == 0 {
        return None;
    }
    let (digits, tail) = after_prefix.split_at(digit_end);
    let repository_id: u64 = digits.parse().ok()?;
    if tail.is_empty() {
        return Some((repository_id, None));
    }
    let rest = tail.strip_prefix('-')?;
    if rest.is_empty() {
        return None;
    }
    Some((repository_id, Some(rest.to_string())))
}

/// Parses `<prefix><digits>` where the digits span the entire remainder.
fn parse_suffixed_int(room_id: &str, prefix: &str) -> Option<u64> {
    let digits = room_id.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Save eligibility (spec.md §9 Open Question): the stricter form used by
/// the save path requires a non-empty file path. We additionally allow that
/// path to contain further `/` separators - real editor paths are nested
/// (`src/main.ts`), and rejecting them would make every realistic save
/// request fail, which contradicts the worked save scenario in spec.md §8.
pub fn save_fields(kind: &RoomKind) -> Option<(u64, &str)> {
    match kind {
        RoomKind::CodeEditor {
            repository_id,
            file_path: Some(file_path),
        } => Some((*repository_id, file_path.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_code_editor_with_path() {
        let kind = classify("repo-7-src/main.ts");
        assert_eq!(
            kind,
            RoomKind::CodeEditor {
                repository_id: 7,
                file_path: Some("src/main.ts".to_string()),
            }
        );
    }

    #[test]
    fn classifies_bare_code_editor_room() {
        let kind = classify("repo-7");
        assert_eq!(
            kind,
            RoomKind::CodeEditor {
                repository_id: 7,
                file_path: None,
            }
        );
    }

    #[test]
    fn rejects_trailing_dash_with_empty_path() {
        assert_eq!(classify("repo-7-"), RoomKind::Unsupported);
    }

    #[test]
    fn classifies_filetree() {
        assert_eq!(
            classify("filetree-42"),
            RoomKind::FileTree { repository_id: 42 }
        );
    }

    #[test]
    fn classifies_savepoint() {
        assert_eq!(
            classify("savepoint-3"),
            RoomKind::SavePoint { repository_id: 3 }
        );
    }

    #[test]
    fn classifies_default_as_probe() {
        assert_eq!(classify("default"), RoomKind::Probe);
        assert_eq!(classify(""), RoomKind::Unsupported);
    }

    #[test]
    fn classifies_unknown_shapes_as_unsupported() {
        assert_eq!(classify("repo-abc-x"), RoomKind::Unsupported);
        assert_eq!(classify("filetree-"), RoomKind::Unsupported);
        assert_eq!(classify("filetree-abc"), RoomKind::Unsupported);
        assert_eq!(classify("something-else"), RoomKind::Unsupported);
    }

    #[test]
    fn classification_is_pure() {
        for id in ["repo-7-a/b.rs", "filetree-1", "savepoint-9", "default", "garbage"] {
            assert_eq!(classify(id), classify(id));
        }
    }

    #[test]
    fn save_fields_requires_non_empty_path() {
        assert_eq!(
            save_fields(&classify("repo-7-src/main.ts")),
            Some((7, "src/main.ts"))
        );
        assert_eq!(save_fields(&classify("repo-7")), None);
        assert_eq!(save_fields(&classify("filetree-7")), None);
    }
}
