//! Open document tracking
//!
//! Tracks the text and version of every document the server has been told
//! about, and decides which notification (if any) brings the server in sync.
//! Also hosts the UTF-16 position arithmetic used by buffer edits.

use lsp_types::{Position, TextDocumentItem, Uri, VersionedTextDocumentIdentifier};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

// ============================================================================
// Document Entry
// ============================================================================

/// A document currently open in the server
#[derive(Debug, Clone, PartialEq)]
pub struct OpenDocument {
    pub uri: Uri,
    pub language_id: String,
    /// Strictly increases while the document stays open
    pub version: i32,
    pub text: String,
}

/// Notification needed to sync the server with the registry
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentAction {
    /// Send `textDocument/didOpen`
    Open(TextDocumentItem),
    /// Send a full-text `textDocument/didChange`
    Change {
        document: VersionedTextDocumentIdentifier,
        text: String,
    },
    /// Server already has this exact text
    Unchanged,
}

// ============================================================================
// Document Registry
// ============================================================================

/// Open documents keyed by absolute path
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    documents: HashMap<PathBuf, OpenDocument>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `text` as the content of `path`
    ///
    /// A new document starts at version 0; reopening with identical text is
    /// a no-op and different text bumps the version.
    pub fn open(&mut self, path: &Path, uri: Uri, language_id: &str, text: String) -> DocumentAction {
        if let Some(document) = self.documents.get_mut(path) {
            if document.text == text {
                debug!("Document {} is already open and unchanged", path.display());
                return DocumentAction::Unchanged;
            }
            return Self::apply_change(document, text);
        }

        debug!("Opening document {}", path.display());
        let document = OpenDocument {
            uri,
            language_id: language_id.to_string(),
            version: 0,
            text,
        };
        let item = TextDocumentItem {
            uri: document.uri.clone(),
            language_id: document.language_id.clone(),
            version: document.version,
            text: document.text.clone(),
        };
        self.documents.insert(path.to_path_buf(), document);
        DocumentAction::Open(item)
    }

    /// Like [`open`](Self::open), but leaves an already open document alone
    pub fn open_if_absent(
        &mut self,
        path: &Path,
        uri: Uri,
        language_id: &str,
        text: String,
    ) -> DocumentAction {
        if self.documents.contains_key(path) {
            return DocumentAction::Unchanged;
        }
        self.open(path, uri, language_id, text)
    }

    /// Put back an entry saved before a change the server never received
    pub fn restore(&mut self, path: &Path, previous: Option<OpenDocument>) {
        match previous {
            Some(document) => {
                self.documents.insert(path.to_path_buf(), document);
            }
            None => {
                self.documents.remove(path);
            }
        }
    }

    /// Replace the text of an open document
    ///
    /// Returns `None` when the document is not open.
    pub fn change(&mut self, path: &Path, text: String) -> Option<DocumentAction> {
        let document = self.documents.get_mut(path)?;
        if document.text == text {
            return Some(DocumentAction::Unchanged);
        }
        Some(Self::apply_change(document, text))
    }

    fn apply_change(document: &mut OpenDocument, text: String) -> DocumentAction {
        document.version += 1;
        document.text = text;
        DocumentAction::Change {
            document: VersionedTextDocumentIdentifier {
                uri: document.uri.clone(),
                version: document.version,
            },
            text: document.text.clone(),
        }
    }

    /// Forget a document; returns it if it was open
    pub fn close(&mut self, path: &Path) -> Option<OpenDocument> {
        self.documents.remove(path)
    }

    pub fn get(&self, path: &Path) -> Option<&OpenDocument> {
        self.documents.get(path)
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.documents.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Paths of every open document
    pub fn paths(&self) -> Vec<PathBuf> {
        self.documents.keys().cloned().collect()
    }
}

// ============================================================================
// UTF-16 Positions
// ============================================================================

/// Byte offset of an LSP position (UTF-16 character units)
///
/// Returns `None` past the end of a line or the document, or inside a
/// surrogate pair. The position right after the last character of a line is
/// valid.
pub fn offset_at(text: &str, position: Position) -> Option<usize> {
    let mut line_start = 0;
    for _ in 0..position.line {
        line_start += text[line_start..].find('\n')? + 1;
    }

    let line_end = text[line_start..]
        .find('\n')
        .map_or(text.len(), |index| line_start + index);
    let line = &text[line_start..line_end];
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut units = 0u32;
    for (index, ch) in line.char_indices() {
        if units == position.character {
            return Some(line_start + index);
        }
        units += ch.len_utf16() as u32;
        if units > position.character {
            return None;
        }
    }

    (units == position.character).then_some(line_start + line.len())
}

/// Position reached after inserting `inserted` at `start`
pub fn position_after(start: Position, inserted: &str) -> Position {
    match inserted.rsplit_once('\n') {
        Some((head, tail)) => Position {
            line: start.line + head.matches('\n').count() as u32 + 1,
            character: utf16_len(tail),
        },
        None => Position {
            line: start.line,
            character: start.character + utf16_len(inserted),
        },
    }
}

fn utf16_len(text: &str) -> u32 {
    text.chars().map(|ch| ch.len_utf16() as u32).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(path: &str) -> Uri {
        format!("file://{path}").parse().unwrap()
    }

    fn pos(line: u32, character: u32) -> Position {
        Position { line, character }
    }

    #[test]
    fn test_open_is_idempotent_for_identical_text() {
        let mut registry = DocumentRegistry::new();
        let path = Path::new("/ws/a.py");

        let first = registry.open(path, uri("/ws/a.py"), "python", "x = 1\n".to_string());
        assert!(matches!(first, DocumentAction::Open(ref item) if item.version == 0));

        let second = registry.open(path, uri("/ws/a.py"), "python", "x = 1\n".to_string());
        assert_eq!(second, DocumentAction::Unchanged);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_open_with_new_text_sends_change() {
        let mut registry = DocumentRegistry::new();
        let path = Path::new("/ws/a.py");
        registry.open(path, uri("/ws/a.py"), "python", "x = 1\n".to_string());

        match registry.open(path, uri("/ws/a.py"), "python", "x = 2\n".to_string()) {
            DocumentAction::Change { document, text } => {
                assert_eq!(document.version, 1);
                assert_eq!(text, "x = 2\n");
            }
            other => panic!("Expected change, got {other:?}"),
        }
    }

    #[test]
    fn test_open_if_absent_keeps_current_text() {
        let mut registry = DocumentRegistry::new();
        let path = Path::new("/ws/a.py");
        registry.open(path, uri("/ws/a.py"), "python", "edited\n".to_string());

        let action = registry.open_if_absent(path, uri("/ws/a.py"), "python", "disk\n".to_string());
        assert_eq!(action, DocumentAction::Unchanged);
        assert_eq!(registry.get(path).unwrap().text, "edited\n");
        assert_eq!(registry.get(path).unwrap().version, 0);

        let other = Path::new("/ws/b.py");
        let opened = registry.open_if_absent(other, uri("/ws/b.py"), "python", "disk\n".to_string());
        assert!(matches!(opened, DocumentAction::Open(_)));
    }

    #[test]
    fn test_restore_undoes_open_and_change() {
        let mut registry = DocumentRegistry::new();
        let path = Path::new("/ws/a.py");

        registry.open(path, uri("/ws/a.py"), "python", "x = 1\n".to_string());
        registry.restore(path, None);
        assert!(!registry.is_open(path));

        registry.open(path, uri("/ws/a.py"), "python", "x = 1\n".to_string());
        let saved = registry.get(path).cloned();
        registry.change(path, "x = 2\n".to_string());
        registry.restore(path, saved);

        let document = registry.get(path).unwrap();
        assert_eq!(document.text, "x = 1\n");
        assert_eq!(document.version, 0);
    }

    #[test]
    fn test_versions_strictly_increase() {
        let mut registry = DocumentRegistry::new();
        let path = Path::new("/ws/a.py");
        registry.open(path, uri("/ws/a.py"), "python", String::new());

        let mut last = 0;
        for i in 1..5 {
            registry.change(path, format!("v{i}")).unwrap();
            let version = registry.get(path).unwrap().version;
            assert!(version > last);
            last = version;
        }
    }

    #[test]
    fn test_close_and_reopen_restarts_version() {
        let mut registry = DocumentRegistry::new();
        let path = Path::new("/ws/a.py");
        registry.open(path, uri("/ws/a.py"), "python", "a".to_string());
        registry.change(path, "b".to_string());

        assert!(registry.close(path).is_some());
        assert!(registry.close(path).is_none());
        assert!(registry.is_empty());
        assert!(registry.change(path, "c".to_string()).is_none());

        let reopened = registry.open(path, uri("/ws/a.py"), "python", "b".to_string());
        assert!(matches!(reopened, DocumentAction::Open(ref item) if item.version == 0));
    }

    #[test]
    fn test_offset_at_counts_utf16_units() {
        let text = "héllo\n😀x\r\nend";

        assert_eq!(offset_at(text, pos(0, 0)), Some(0));
        assert_eq!(offset_at(text, pos(0, 2)), Some(3));
        assert_eq!(offset_at(text, pos(0, 5)), Some(6));
        assert_eq!(offset_at(text, pos(0, 6)), None);

        // The emoji is two UTF-16 units and four bytes
        assert_eq!(offset_at(text, pos(1, 0)), Some(7));
        assert_eq!(offset_at(text, pos(1, 1)), None);
        assert_eq!(offset_at(text, pos(1, 2)), Some(11));
        assert_eq!(offset_at(text, pos(1, 3)), Some(12));
        assert_eq!(offset_at(text, pos(1, 4)), None);

        assert_eq!(offset_at(text, pos(2, 3)), Some(text.len()));
        assert_eq!(offset_at(text, pos(3, 0)), None);
    }

    #[test]
    fn test_position_after_insertion() {
        assert_eq!(position_after(pos(4, 2), "abc"), pos(4, 5));
        assert_eq!(position_after(pos(4, 2), "a\nbc"), pos(5, 2));
        assert_eq!(position_after(pos(4, 2), "a\n\n😀"), pos(6, 2));
        assert_eq!(position_after(pos(4, 2), "line\n"), pos(5, 0));
    }
}
