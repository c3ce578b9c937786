//! LSP protocol session
//!
//! Owns the handshake, the session state machine, the capability snapshot
//! and the open-document registry. Everything here runs on top of an
//! [`RpcSession`]; process concerns live one layer up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use lsp_types::notification::{
    DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, Initialized,
};
use lsp_types::request::Initialize;
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, CompletionItemCapability,
    ConfigurationParams, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DocumentSymbolClientCapabilities, GotoCapability,
    HoverClientCapabilities, InitializeParams, InitializedParams, LogMessageParams, MarkupKind,
    MessageType, ReferenceClientCapabilities, ServerCapabilities, ShowMessageParams,
    TextDocumentClientCapabilities, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentSyncClientCapabilities, WindowClientCapabilities, WorkspaceClientCapabilities,
    WorkspaceFolder,
};
use serde_json::Value;
use tracing::{Level, debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::LspError;
use crate::log_timing;
use crate::lsp::documents::{DocumentAction, DocumentRegistry};
use crate::lsp::rpc::{RpcSession, parse_params};
use crate::symbol::path_to_uri;

/// Tracing target for `window/logMessage` and `window/showMessage`
const SERVER_LOG_TARGET: &str = "polyglot_lsp::server_log";

// ============================================================================
// Session State
// ============================================================================

/// Protocol session lifecycle
#[derive(Debug, Clone)]
pub enum SessionState {
    NotStarted,
    Initializing,
    Ready(Arc<ServerCapabilities>),
    ShuttingDown,
    Terminated,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::NotStarted => "NotStarted",
            SessionState::Initializing => "Initializing",
            SessionState::Ready(_) => "Ready",
            SessionState::ShuttingDown => "ShuttingDown",
            SessionState::Terminated => "Terminated",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready(_))
    }

    /// Legal transitions; anything may terminate except a terminated session
    fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (NotStarted, Initializing)
                | (Initializing, Ready(_))
                | (NotStarted | Initializing | Ready(_), ShuttingDown)
                | (NotStarted | Initializing | Ready(_) | ShuttingDown, Terminated)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Protocol Session
// ============================================================================

pub struct ProtocolSession {
    rpc: RpcSession,
    config: Arc<SessionConfig>,
    state: Mutex<SessionState>,
    documents: Mutex<DocumentRegistry>,
}

impl fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("state", &self.lock_state().name())
            .field("open_documents", &self.lock_documents().len())
            .finish()
    }
}

impl ProtocolSession {
    /// Wrap an RPC session and install the default server-request handlers
    pub fn new(rpc: RpcSession, config: Arc<SessionConfig>) -> Self {
        let session = Self {
            rpc,
            config,
            state: Mutex::new(SessionState::NotStarted),
            documents: Mutex::new(DocumentRegistry::new()),
        };
        session.register_default_handlers();
        session
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_documents(&self) -> MutexGuard<'_, DocumentRegistry> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_default_handlers(&self) {
        self.rpc.on_request("workspace/configuration", |params| {
            let params: ConfigurationParams = parse_params(params)?;
            Ok(Value::Array(vec![Value::Null; params.items.len()]))
        });

        let folders = self.workspace_folders();
        self.rpc.on_request("workspace/workspaceFolders", move |_| {
            Ok(serde_json::to_value(&folders).unwrap_or(Value::Null))
        });

        for method in [
            "client/registerCapability",
            "client/unregisterCapability",
            "window/workDoneProgress/create",
        ] {
            self.rpc.on_request(method, |_| Ok(Value::Null));
        }

        self.rpc.on_notification("window/logMessage", |params| {
            if let Ok(params) = parse_params::<LogMessageParams>(params) {
                log_server_message(params.typ, &params.message);
            }
        });
        self.rpc.on_notification("window/showMessage", |params| {
            if let Ok(params) = parse_params::<ShowMessageParams>(params) {
                log_server_message(params.typ, &params.message);
            }
        });
        self.rpc
            .on_notification("textDocument/publishDiagnostics", |params| {
                trace!(target: SERVER_LOG_TARGET, "diagnostics: {:?}", params);
            });
        self.rpc.on_notification("$/progress", |params| {
            trace!(target: SERVER_LOG_TARGET, "progress: {:?}", params);
        });
    }

    fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        let name = self
            .config
            .root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.root.display().to_string());

        match path_to_uri(&self.config.root) {
            Ok(uri) => vec![WorkspaceFolder { uri, name }],
            Err(e) => {
                warn!("Workspace root has no file URI: {}", e);
                Vec::new()
            }
        }
    }

    pub fn rpc(&self) -> &RpcSession {
        &self.rpc
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state, reconciled with the RPC layer's termination flag
    pub fn state(&self) -> SessionState {
        let mut state = self.lock_state();
        if self.rpc.termination().is_some() && !matches!(*state, SessionState::Terminated) {
            *state = SessionState::Terminated;
        }
        state.clone()
    }

    /// Move to `next`, rejecting illegal transitions
    fn transition(&self, next: SessionState) -> Result<(), LspError> {
        let mut state = self.lock_state();
        if !state.can_transition_to(&next) {
            return Err(LspError::invalid_transition(state.name(), next.name()));
        }
        debug!("ProtocolSession: {} -> {}", state.name(), next.name());
        *state = next;
        Ok(())
    }

    /// Record that the session is gone; always allowed
    pub fn mark_terminated(&self) {
        *self.lock_state() = SessionState::Terminated;
    }

    /// Capabilities, if the handshake completed
    pub fn capabilities(&self) -> Option<Arc<ServerCapabilities>> {
        match self.state() {
            SessionState::Ready(capabilities) => Some(capabilities),
            _ => None,
        }
    }

    /// Capabilities of a ready session, or why the session is not usable
    pub fn ensure_ready(&self) -> Result<Arc<ServerCapabilities>, LspError> {
        match self.state() {
            SessionState::Ready(capabilities) => Ok(capabilities),
            SessionState::Terminated => match self.rpc.termination() {
                Some(reason) if reason.is_fatal() => Err(LspError::Rpc(reason)),
                _ => Err(LspError::not_ready(SessionState::Terminated.name())),
            },
            other => Err(LspError::not_ready(other.name())),
        }
    }

    /// Perform the `initialize`/`initialized` handshake
    pub async fn initialize(&self) -> Result<Arc<ServerCapabilities>, LspError> {
        self.transition(SessionState::Initializing)?;

        info!(
            "Initializing {} session in {}",
            self.config.language,
            self.config.root.display()
        );
        let started = Instant::now();

        let params = self.initialize_params()?;
        let result = match self
            .rpc
            .request::<Initialize>(params, self.config.initialization_timeout)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Initialize handshake failed: {}", e);
                self.rpc.terminate(e.clone());
                self.mark_terminated();
                return Err(LspError::Rpc(e));
            }
        };

        if let Some(server_info) = &result.server_info {
            info!(
                "Connected to {} {}",
                server_info.name,
                server_info.version.as_deref().unwrap_or("")
            );
        }
        debug!("LSP server capabilities: {:?}", result.capabilities);

        self.rpc
            .notification::<Initialized>(InitializedParams {})?;

        let capabilities = Arc::new(result.capabilities);
        self.transition(SessionState::Ready(Arc::clone(&capabilities)))?;
        log_timing!(Level::INFO, "initialize", started.elapsed());

        Ok(capabilities)
    }

    fn initialize_params(&self) -> Result<InitializeParams, LspError> {
        let root_uri = path_to_uri(&self.config.root)?;

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_path: Some(self.config.root.display().to_string()),
            root_uri: Some(root_uri),
            initialization_options: self.config.initialization_options.clone(),
            capabilities: client_capabilities(),
            workspace_folders: Some(self.workspace_folders()),
            client_info: Some(ClientInfo {
                name: self.config.client_name.clone(),
                version: Some(self.config.client_version.clone()),
            }),
            ..Default::default()
        };

        Ok(params)
    }

    /// Resolve a workspace-relative (or absolute) path
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        self.config.root.join(path)
    }

    /// Make `text` the content of `path` on the server
    ///
    /// Returns true if this sent a fresh `didOpen`.
    pub fn open(&self, path: &Path, text: String) -> Result<bool, LspError> {
        self.open_document(path, text, false)
    }

    fn open_document(&self, path: &Path, text: String, keep_existing: bool) -> Result<bool, LspError> {
        self.ensure_ready()?;
        let uri = path_to_uri(path)?;
        let language_id = self.config.language.document_language_id(path);

        let mut documents = self.lock_documents();
        self.sync_document(&mut documents, path, |documents| {
            let action = if keep_existing {
                documents.open_if_absent(path, uri, language_id, text)
            } else {
                documents.open(path, uri, language_id, text)
            };
            let opened = matches!(action, DocumentAction::Open(_));
            Ok((action, opened))
        })
    }

    /// Replace the text of an open document
    pub fn change(&self, path: &Path, text: String) -> Result<(), LspError> {
        self.ensure_ready()?;

        let mut documents = self.lock_documents();
        self.sync_document(&mut documents, path, |documents| {
            let action = documents
                .change(path, text)
                .ok_or_else(|| LspError::DocumentNotOpen {
                    path: path.to_path_buf(),
                })?;
            Ok((action, ()))
        })
    }

    /// Rewrite an open document's text under the registry lock
    ///
    /// `edit` maps the current text to the new text plus a value returned to
    /// the caller; the resulting `didChange` is sent before the lock drops.
    pub fn edit_document<T, F>(&self, path: &Path, edit: F) -> Result<T, LspError>
    where
        F: FnOnce(&str) -> Result<(String, T), LspError>,
    {
        self.ensure_ready()?;

        let mut documents = self.lock_documents();
        self.sync_document(&mut documents, path, |documents| {
            let current = documents
                .get(path)
                .ok_or_else(|| LspError::DocumentNotOpen {
                    path: path.to_path_buf(),
                })?;
            let (text, output) = edit(&current.text)?;
            let action = documents
                .change(path, text)
                .unwrap_or(DocumentAction::Unchanged);
            Ok((action, output))
        })
    }

    /// Close a document; closing a document that is not open is a no-op
    pub fn close(&self, path: &Path) -> Result<(), LspError> {
        self.ensure_ready()?;

        let mut documents = self.lock_documents();
        let Some(document) = documents.get(path) else {
            return Ok(());
        };

        debug!("Closing document {}", path.display());
        self.rpc
            .notification::<DidCloseTextDocument>(DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier {
                    uri: document.uri.clone(),
                },
            })?;
        documents.close(path);
        Ok(())
    }

    /// Open `path` with its on-disk content unless it is already open
    ///
    /// Returns true if the document was opened by this call. A document
    /// opened or edited while the file was being read keeps its text.
    pub async fn ensure_open(&self, path: &Path) -> Result<bool, LspError> {
        self.ensure_ready()?;
        if self.is_open(path) {
            return Ok(false);
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| LspError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;
        self.open_document(path, text, true)
    }

    /// Apply `update` to the registry and notify the server
    ///
    /// The registry entry is put back if the notification cannot be sent.
    fn sync_document<T, F>(
        &self,
        documents: &mut DocumentRegistry,
        path: &Path,
        update: F,
    ) -> Result<T, LspError>
    where
        F: FnOnce(&mut DocumentRegistry) -> Result<(DocumentAction, T), LspError>,
    {
        let previous = documents.get(path).cloned();
        let (action, output) = update(documents)?;
        if let Err(e) = self.send_document_action(action) {
            warn!(
                "Failed to sync {} with the server, keeping previous state: {}",
                path.display(),
                e
            );
            documents.restore(path, previous);
            return Err(e);
        }
        Ok(output)
    }

    fn send_document_action(&self, action: DocumentAction) -> Result<(), LspError> {
        match action {
            DocumentAction::Open(text_document) => {
                self.rpc
                    .notification::<DidOpenTextDocument>(DidOpenTextDocumentParams {
                        text_document,
                    })?;
            }
            DocumentAction::Change { document, text } => {
                self.rpc
                    .notification::<DidChangeTextDocument>(DidChangeTextDocumentParams {
                        text_document: document,
                        content_changes: vec![TextDocumentContentChangeEvent {
                            range: None,
                            range_length: None,
                            text,
                        }],
                    })?;
            }
            DocumentAction::Unchanged => {}
        }
        Ok(())
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.lock_documents().is_open(path)
    }

    /// Current text of an open document
    pub fn document_text(&self, path: &Path) -> Option<String> {
        self.lock_documents().get(path).map(|document| document.text.clone())
    }

    pub fn open_documents(&self) -> Vec<PathBuf> {
        self.lock_documents().paths()
    }

    /// Stop accepting queries; EOF from the server is expected from now on
    pub fn begin_shutdown(&self) -> Result<(), LspError> {
        self.transition(SessionState::ShuttingDown)?;
        self.rpc.begin_shutdown();
        Ok(())
    }
}

fn log_server_message(typ: MessageType, message: &str) {
    if typ == MessageType::ERROR {
        error!(target: SERVER_LOG_TARGET, "{}", message);
    } else if typ == MessageType::WARNING {
        warn!(target: SERVER_LOG_TARGET, "{}", message);
    } else if typ == MessageType::INFO {
        info!(target: SERVER_LOG_TARGET, "{}", message);
    } else {
        debug!(target: SERVER_LOG_TARGET, "{}", message);
    }
}

/// Capabilities this client advertises
fn client_capabilities() -> ClientCapabilities {
    let goto = Some(GotoCapability {
        dynamic_registration: Some(false),
        link_support: Some(true),
    });

    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            workspace_folders: Some(true),
            configuration: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(false),
            }),
            completion: Some(CompletionClientCapabilities {
                dynamic_registration: Some(false),
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            declaration: goto,
            definition: goto,
            type_definition: goto,
            implementation: goto,
            references: Some(ReferenceClientCapabilities {
                dynamic_registration: Some(false),
            }),
            document_symbol: Some(DocumentSymbolClientCapabilities {
                dynamic_registration: Some(false),
                symbol_kind: None,
                hierarchical_document_symbol_support: Some(true),
                tag_support: None,
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}
