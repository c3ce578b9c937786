//! Document symbol shapes
//!
//! Servers answer `textDocument/documentSymbol` either with a hierarchy
//! (`DocumentSymbol[]`) or a flat list (`SymbolInformation[]`). Both are
//! normalized into a flat list plus a tree; the tree for a flat response is
//! rebuilt from range containment.

use std::path::Path;

use lsp_types::{Position, Range, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::symbol::location::FileLocation;

// ============================================================================
// Symbol kinds
// ============================================================================

/// Numeric LSP symbol kind
///
/// Kept as the raw wire code so unknown kinds from newer servers survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolKind(pub u32);

impl SymbolKind {
    pub const FILE: SymbolKind = SymbolKind(1);
    pub const MODULE: SymbolKind = SymbolKind(2);
    pub const NAMESPACE: SymbolKind = SymbolKind(3);
    pub const PACKAGE: SymbolKind = SymbolKind(4);
    pub const CLASS: SymbolKind = SymbolKind(5);
    pub const METHOD: SymbolKind = SymbolKind(6);
    pub const PROPERTY: SymbolKind = SymbolKind(7);
    pub const FIELD: SymbolKind = SymbolKind(8);
    pub const CONSTRUCTOR: SymbolKind = SymbolKind(9);
    pub const ENUM: SymbolKind = SymbolKind(10);
    pub const INTERFACE: SymbolKind = SymbolKind(11);
    pub const FUNCTION: SymbolKind = SymbolKind(12);
    pub const VARIABLE: SymbolKind = SymbolKind(13);
    pub const CONSTANT: SymbolKind = SymbolKind(14);
    pub const STRING: SymbolKind = SymbolKind(15);
    pub const NUMBER: SymbolKind = SymbolKind(16);
    pub const BOOLEAN: SymbolKind = SymbolKind(17);
    pub const ARRAY: SymbolKind = SymbolKind(18);
    pub const OBJECT: SymbolKind = SymbolKind(19);
    pub const KEY: SymbolKind = SymbolKind(20);
    pub const NULL: SymbolKind = SymbolKind(21);
    pub const ENUM_MEMBER: SymbolKind = SymbolKind(22);
    pub const STRUCT: SymbolKind = SymbolKind(23);
    pub const EVENT: SymbolKind = SymbolKind(24);
    pub const OPERATOR: SymbolKind = SymbolKind(25);
    pub const TYPE_PARAMETER: SymbolKind = SymbolKind(26);

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 26] = [
            "File",
            "Module",
            "Namespace",
            "Package",
            "Class",
            "Method",
            "Property",
            "Field",
            "Constructor",
            "Enum",
            "Interface",
            "Function",
            "Variable",
            "Constant",
            "String",
            "Number",
            "Boolean",
            "Array",
            "Object",
            "Key",
            "Null",
            "EnumMember",
            "Struct",
            "Event",
            "Operator",
            "TypeParameter",
        ];
        (self.0 as usize)
            .checked_sub(1)
            .and_then(|index| NAMES.get(index))
            .copied()
            .unwrap_or("Unknown")
    }
}

// ============================================================================
// Symbol shapes
// ============================================================================

/// One symbol, independent of the response shape it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatSymbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Full extent of the symbol
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_range: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<FileLocation>,
}

/// A symbol with its nested symbols, ordered by source position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolNode {
    #[serde(flatten)]
    pub symbol: FlatSymbol,
    pub children: Vec<SymbolNode>,
}

impl SymbolNode {
    fn leaf(symbol: FlatSymbol) -> Self {
        Self {
            symbol,
            children: Vec::new(),
        }
    }

    /// `(kind code, ordered children)` view of this node
    pub fn kind_entry(&self) -> (SymbolKind, &[SymbolNode]) {
        (self.symbol.kind, &self.children)
    }
}

/// Result of a document symbol query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSymbols {
    /// Every symbol; server order for flat responses, pre-order otherwise
    pub flat: Vec<FlatSymbol>,
    pub tree: Vec<SymbolNode>,
}

// ============================================================================
// Flat <-> tree
// ============================================================================

fn key(position: Position) -> (u32, u32) {
    (position.line, position.character)
}

/// `outer` strictly contains `inner`; identical ranges are siblings
fn contains(outer: &Range, inner: &Range) -> bool {
    key(outer.start) <= key(inner.start) && key(inner.end) <= key(outer.end) && outer != inner
}

/// Build a tree from a flat symbol list by range containment
///
/// Symbols are visited by start ascending, end descending, then input order,
/// keeping a stack of open ancestors. A symbol that partially overlaps the
/// top of the stack closes it and becomes a sibling.
pub fn build_tree(symbols: &[FlatSymbol]) -> Vec<SymbolNode> {
    let mut order: Vec<usize> = (0..symbols.len()).collect();
    order.sort_by(|&a, &b| {
        let (a_range, b_range) = (&symbols[a].range, &symbols[b].range);
        key(a_range.start)
            .cmp(&key(b_range.start))
            .then_with(|| key(b_range.end).cmp(&key(a_range.end)))
            .then_with(|| a.cmp(&b))
    });

    let mut roots = Vec::new();
    let mut stack: Vec<SymbolNode> = Vec::new();

    fn attach(node: SymbolNode, stack: &mut [SymbolNode], roots: &mut Vec<SymbolNode>) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    for index in order {
        let symbol = &symbols[index];
        while let Some(top) = stack.last() {
            if contains(&top.symbol.range, &symbol.range) {
                break;
            }
            if let Some(done) = stack.pop() {
                attach(done, &mut stack, &mut roots);
            }
        }
        stack.push(SymbolNode::leaf(symbol.clone()));
    }

    while let Some(done) = stack.pop() {
        attach(done, &mut stack, &mut roots);
    }

    roots
}

/// Pre-order flattening of a tree
pub fn flatten(tree: &[SymbolNode]) -> Vec<FlatSymbol> {
    fn visit(nodes: &[SymbolNode], out: &mut Vec<FlatSymbol>) {
        for node in nodes {
            out.push(node.symbol.clone());
            visit(&node.children, out);
        }
    }

    let mut out = Vec::new();
    visit(tree, &mut out);
    out
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDocumentSymbol {
    name: String,
    kind: SymbolKind,
    range: Range,
    #[serde(default)]
    selection_range: Option<Range>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    children: Option<Vec<WireDocumentSymbol>>,
}

#[derive(Deserialize)]
struct WireLocation {
    uri: Uri,
    /// `WorkspaceSymbol` may omit the range
    #[serde(default)]
    range: Option<Range>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSymbolInformation {
    name: String,
    kind: SymbolKind,
    location: WireLocation,
    #[serde(default)]
    container_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireSymbols {
    Nested(Vec<WireDocumentSymbol>),
    Flat(Vec<WireSymbolInformation>),
}

impl WireSymbolInformation {
    fn into_flat(self, root: &Path) -> FlatSymbol {
        let range = self.location.range.unwrap_or_default();
        FlatSymbol {
            name: self.name,
            kind: self.kind,
            range,
            selection_range: None,
            detail: None,
            container_name: self.container_name,
            location: Some(FileLocation::resolve(self.location.uri, range, root)),
        }
    }
}

fn nested_to_node(symbol: WireDocumentSymbol, container: Option<&str>) -> SymbolNode {
    let mut children: Vec<SymbolNode> = symbol
        .children
        .unwrap_or_default()
        .into_iter()
        .map(|child| nested_to_node(child, Some(&symbol.name)))
        .collect();
    // Stable: equal starts keep server order
    children.sort_by_key(|child| key(child.symbol.range.start));

    SymbolNode {
        symbol: FlatSymbol {
            name: symbol.name,
            kind: symbol.kind,
            range: symbol.range,
            selection_range: symbol.selection_range,
            detail: symbol.detail,
            container_name: container.map(str::to_string),
            location: None,
        },
        children,
    }
}

/// Normalize a `textDocument/documentSymbol` response
pub fn parse_document_symbols(value: Value, root: &Path) -> Result<DocumentSymbols, serde_json::Error> {
    let response: Option<WireSymbols> = serde_json::from_value(value)?;

    Ok(match response {
        None => DocumentSymbols {
            flat: Vec::new(),
            tree: Vec::new(),
        },
        Some(WireSymbols::Nested(symbols)) => {
            let mut tree: Vec<SymbolNode> = symbols
                .into_iter()
                .map(|symbol| nested_to_node(symbol, None))
                .collect();
            tree.sort_by_key(|node| key(node.symbol.range.start));
            DocumentSymbols {
                flat: flatten(&tree),
                tree,
            }
        }
        Some(WireSymbols::Flat(symbols)) => {
            let flat: Vec<FlatSymbol> = symbols
                .into_iter()
                .map(|symbol| symbol.into_flat(root))
                .collect();
            DocumentSymbols {
                tree: build_tree(&flat),
                flat,
            }
        }
    })
}

/// Normalize a `workspace/symbol` response
pub fn parse_workspace_symbols(value: Value, root: &Path) -> Result<Vec<FlatSymbol>, serde_json::Error> {
    let response: Option<Vec<WireSymbolInformation>> = serde_json::from_value(value)?;
    Ok(response
        .unwrap_or_default()
        .into_iter()
        .map(|symbol| symbol.into_flat(root))
        .collect())
}
