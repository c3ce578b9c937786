//! Async Language Server Protocol client runtime
//!
//! Launches a language server, speaks JSON-RPC with it over stdio and
//! exposes typed semantic queries (definitions, references, symbols, hover,
//! completions) plus in-memory buffer edits.
//!
//! ```no_run
//! use polyglot_lsp::{Language, LanguageServer, SessionConfig};
//!
//! # async fn demo() -> Result<(), polyglot_lsp::LspError> {
//! let config = SessionConfig::builder()
//!     .root("/path/to/black")
//!     .language(Language::Python)
//!     .build()?;
//!
//! let locations = LanguageServer::scoped(config, |server| async move {
//!     server.request_definition("src/black/mode.py", 163, 4).await
//! })
//! .await?;
//! println!("{} definition(s)", locations.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod lsp;
pub mod server;
pub mod symbol;

#[cfg(test)]
mod test_utils;

pub use config::{DocumentPolicy, Language, SessionConfig, SessionConfigBuilder};
pub use error::{ConfigError, LspError};
pub use lsp::{Feature, RpcError, SessionState};
pub use server::{CompletionEntry, LanguageServer};
pub use symbol::{DocumentSymbols, FileLocation, FlatSymbol, SymbolKind, SymbolNode};
