//! Open documents and in-memory buffer edits
//!
//! Edits apply to the client's copy of an open document and reach the
//! server as full-text `didChange` notifications. Positions count UTF-16
//! code units, as on the wire.

use std::path::{Path, PathBuf};

use lsp_types::Position;

use super::LanguageServer;
use crate::error::LspError;
use crate::lsp::documents::{offset_at, position_after};

fn invalid_position(path: &Path, position: Position) -> LspError {
    LspError::InvalidPosition {
        path: path.to_path_buf(),
        line: position.line,
        character: position.character,
    }
}

impl LanguageServer {
    fn document_path(&self, relative_path: &Path) -> PathBuf {
        self.session().resolve_path(relative_path)
    }

    /// Open a document with its on-disk content
    ///
    /// Documents opened here stay open until [`close_file`](Self::close_file)
    /// or the end of the session, whatever the document policy.
    pub async fn open_file(&self, relative_path: impl AsRef<Path>) -> Result<(), LspError> {
        let path = self.document_path(relative_path.as_ref());
        self.session().ensure_open(&path).await?;
        Ok(())
    }

    /// Open a document with the given content instead of the on-disk text
    pub fn open_file_with_text(
        &self,
        relative_path: impl AsRef<Path>,
        text: impl Into<String>,
    ) -> Result<(), LspError> {
        let path = self.document_path(relative_path.as_ref());
        self.session().open(&path, text.into())?;
        Ok(())
    }

    pub fn close_file(&self, relative_path: impl AsRef<Path>) -> Result<(), LspError> {
        let path = self.document_path(relative_path.as_ref());
        self.session().close(&path)
    }

    pub fn is_open(&self, relative_path: impl AsRef<Path>) -> bool {
        let path = self.document_path(relative_path.as_ref());
        self.session().is_open(&path)
    }

    /// Current client-side text of an open document
    pub fn document_text(&self, relative_path: impl AsRef<Path>) -> Result<String, LspError> {
        let path = self.document_path(relative_path.as_ref());
        self.session()
            .document_text(&path)
            .ok_or(LspError::DocumentNotOpen { path })
    }

    /// Insert `text` at a position of an open document
    ///
    /// Returns the position just after the inserted text.
    pub fn insert_text_at_position(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
        text: &str,
    ) -> Result<Position, LspError> {
        let path = self.document_path(relative_path.as_ref());
        let start = Position { line, character };

        self.session().edit_document(&path, |current| {
            let offset = offset_at(current, start).ok_or_else(|| invalid_position(&path, start))?;

            let mut updated = String::with_capacity(current.len() + text.len());
            updated.push_str(&current[..offset]);
            updated.push_str(text);
            updated.push_str(&current[offset..]);

            Ok((updated, position_after(start, text)))
        })
    }

    /// Delete the text between two positions of an open document
    ///
    /// Returns the removed text.
    pub fn delete_text_between_positions(
        &self,
        relative_path: impl AsRef<Path>,
        start: Position,
        end: Position,
    ) -> Result<String, LspError> {
        let path = self.document_path(relative_path.as_ref());

        self.session().edit_document(&path, |current| {
            let from = offset_at(current, start).ok_or_else(|| invalid_position(&path, start))?;
            let to = offset_at(current, end).ok_or_else(|| invalid_position(&path, end))?;
            if to < from {
                return Err(invalid_position(&path, end));
            }

            let removed = current[from..to].to_string();
            let updated = format!("{}{}", &current[..from], &current[to..]);
            Ok((updated, removed))
        })
    }
}
