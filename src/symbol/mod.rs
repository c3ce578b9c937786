//! Symbol and location shapes
//!
//! Normalized views of what servers return for navigation and symbol
//! queries, independent of which response variant a server chose.

pub mod location;
pub mod tree;

pub use location::{FileLocation, parse_locations, path_to_uri, relative_to, uri_to_path};
pub use tree::{
    DocumentSymbols, FlatSymbol, SymbolKind, SymbolNode, build_tree, flatten,
    parse_document_symbols, parse_workspace_symbols,
};
