//! Semantic queries
//!
//! Every query checks the server capability, opens the document if needed,
//! sends the request and normalizes the response into crate types.

use std::future::Future;
use std::path::Path;

use lsp_types::{
    CompletionItem, CompletionItemKind, CompletionResponse, CompletionTextEdit, Hover,
    PartialResultParams, Position, ReferenceContext, TextDocumentIdentifier,
    TextDocumentPositionParams, Uri, WorkDoneProgressParams,
};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::LanguageServer;
use crate::config::DocumentPolicy;
use crate::error::LspError;
use crate::lsp::capabilities::{Feature, supports};
use crate::lsp::rpc::RpcError;
use crate::symbol::{
    DocumentSymbols, FileLocation, FlatSymbol, parse_document_symbols, parse_locations,
    parse_workspace_symbols, path_to_uri,
};

/// A completion candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEntry {
    pub label: String,
    /// Text to insert: the edit's text, else `insertText`, else the label
    pub completion_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<CompletionItemKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<CompletionItem> for CompletionEntry {
    fn from(item: CompletionItem) -> Self {
        let completion_text = match item.text_edit {
            Some(CompletionTextEdit::Edit(edit)) => edit.new_text,
            Some(CompletionTextEdit::InsertAndReplace(edit)) => edit.new_text,
            None => item.insert_text.unwrap_or_else(|| item.label.clone()),
        };

        Self {
            label: item.label,
            completion_text,
            kind: item.kind,
            detail: item.detail,
        }
    }
}

fn decode<T>(method: &str, result: Result<T, serde_json::Error>) -> Result<T, LspError> {
    result.map_err(|e| LspError::Rpc(RpcError::Deserialization(format!("{method}: {e}"))))
}

fn position_params(uri: Uri, line: u32, character: u32) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri },
        position: Position { line, character },
    }
}

impl LanguageServer {
    /// Send `feature`'s request with the configured request timeout
    async fn send<P: Serialize>(&self, feature: Feature, params: P) -> Result<Value, LspError> {
        let params = serde_json::to_value(params)
            .map_err(|e| RpcError::Serialization(format!("{}: {e}", feature.method())))?;

        let session = self.session();
        let timeout = session.config().request_timeout;
        Ok(session
            .rpc()
            .call(feature.method(), Some(params), timeout)
            .await?)
    }

    fn require(&self, feature: Feature) -> Result<(), LspError> {
        let capabilities = self.session().ensure_ready()?;
        if !supports(&capabilities, feature) {
            return Err(LspError::UnsupportedCapability(feature));
        }
        Ok(())
    }

    /// Run a document query against `relative_path`, opening it if needed
    async fn with_document<T, F, Fut>(
        &self,
        feature: Feature,
        relative_path: &Path,
        query: F,
    ) -> Result<T, LspError>
    where
        F: FnOnce(Uri) -> Fut,
        Fut: Future<Output = Result<T, LspError>>,
    {
        self.require(feature)?;

        let session = self.session();
        let path = session.resolve_path(relative_path);
        let opened = session.ensure_open(&path).await?;
        let uri = path_to_uri(&path)?;

        let result = query(uri).await;

        if opened
            && session.config().document_policy == DocumentPolicy::CloseAfterQuery
            && let Err(e) = session.close(&path)
        {
            debug!("Failed to close {} after query: {}", path.display(), e);
        }
        result
    }

    async fn locations(
        &self,
        feature: Feature,
        relative_path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Vec<FileLocation>, LspError> {
        self.with_document(feature, relative_path, |uri| async move {
            let params = position_params(uri, line, character);
            let response = self.send(feature, params).await?;
            decode(feature.method(), parse_locations(response, self.root()))
        })
        .await
    }

    pub async fn request_definition(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<Vec<FileLocation>, LspError> {
        self.locations(Feature::Definition, relative_path.as_ref(), line, character)
            .await
    }

    pub async fn request_declaration(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<Vec<FileLocation>, LspError> {
        self.locations(Feature::Declaration, relative_path.as_ref(), line, character)
            .await
    }

    pub async fn request_type_definition(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<Vec<FileLocation>, LspError> {
        self.locations(Feature::TypeDefinition, relative_path.as_ref(), line, character)
            .await
    }

    pub async fn request_implementation(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<Vec<FileLocation>, LspError> {
        self.locations(Feature::Implementation, relative_path.as_ref(), line, character)
            .await
    }

    /// References in server order, declaration included
    pub async fn request_references(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<Vec<FileLocation>, LspError> {
        let feature = Feature::References;
        self.with_document(feature, relative_path.as_ref(), |uri| async move {
            let params = lsp_types::ReferenceParams {
                text_document_position: position_params(uri, line, character),
                work_done_progress_params: WorkDoneProgressParams::default(),
                partial_result_params: PartialResultParams::default(),
                context: ReferenceContext {
                    include_declaration: true,
                },
            };
            let response = self.send(feature, params).await?;
            decode(feature.method(), parse_locations(response, self.root()))
        })
        .await
    }

    /// Symbols of one document, both flat and as a containment tree
    pub async fn request_document_symbols(
        &self,
        relative_path: impl AsRef<Path>,
    ) -> Result<DocumentSymbols, LspError> {
        let feature = Feature::DocumentSymbol;
        self.with_document(feature, relative_path.as_ref(), |uri| async move {
            let params = lsp_types::DocumentSymbolParams {
                text_document: TextDocumentIdentifier { uri },
                work_done_progress_params: WorkDoneProgressParams::default(),
                partial_result_params: PartialResultParams::default(),
            };
            let response = self.send(feature, params).await?;
            decode(feature.method(), parse_document_symbols(response, self.root()))
        })
        .await
    }

    /// Accepts both `CompletionItem[]` and `CompletionList` responses
    pub async fn request_completions(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<Vec<CompletionEntry>, LspError> {
        let feature = Feature::Completion;
        self.with_document(feature, relative_path.as_ref(), |uri| async move {
            let params = position_params(uri, line, character);
            let response = self.send(feature, params).await?;
            let items = match decode(feature.method(), from_value::<CompletionResponse>(response))? {
                Some(CompletionResponse::Array(items)) => items,
                Some(CompletionResponse::List(list)) => list.items,
                None => Vec::new(),
            };
            Ok(items.into_iter().map(CompletionEntry::from).collect())
        })
        .await
    }

    pub async fn request_hover(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        character: u32,
    ) -> Result<Option<Hover>, LspError> {
        let feature = Feature::Hover;
        self.with_document(feature, relative_path.as_ref(), |uri| async move {
            let params = position_params(uri, line, character);
            let response = self.send(feature, params).await?;
            decode(feature.method(), from_value::<Hover>(response))
        })
        .await
    }

    /// Workspace-wide symbol search
    pub async fn request_workspace_symbols(&self, query: &str) -> Result<Vec<FlatSymbol>, LspError> {
        let feature = Feature::WorkspaceSymbol;
        self.require(feature)?;

        let params = lsp_types::WorkspaceSymbolParams {
            query: query.to_string(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let response = self.send(feature, params).await?;
        decode(feature.method(), parse_workspace_symbols(response, self.root()))
    }
}

/// Deserialize a nullable response
fn from_value<T: DeserializeOwned>(value: Value) -> Result<Option<T>, serde_json::Error> {
    serde_json::from_value(value)
}
