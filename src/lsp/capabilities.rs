//! Capability checks against the server's `initialize` response

use lsp_types::{
    DeclarationCapability, HoverProviderCapability, ImplementationProviderCapability, OneOf,
    ServerCapabilities, TypeDefinitionProviderCapability,
};
use std::fmt;

/// Query families gated on a server capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Definition,
    Declaration,
    TypeDefinition,
    Implementation,
    References,
    DocumentSymbol,
    WorkspaceSymbol,
    Hover,
    Completion,
}

impl Feature {
    /// The LSP method backing this feature
    pub fn method(self) -> &'static str {
        match self {
            Feature::Definition => "textDocument/definition",
            Feature::Declaration => "textDocument/declaration",
            Feature::TypeDefinition => "textDocument/typeDefinition",
            Feature::Implementation => "textDocument/implementation",
            Feature::References => "textDocument/references",
            Feature::DocumentSymbol => "textDocument/documentSymbol",
            Feature::WorkspaceSymbol => "workspace/symbol",
            Feature::Hover => "textDocument/hover",
            Feature::Completion => "textDocument/completion",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

fn one_of<T>(provider: &Option<OneOf<bool, T>>) -> bool {
    matches!(provider, Some(OneOf::Left(true)) | Some(OneOf::Right(_)))
}

/// Whether the server advertised `feature`; absent or `false` means no
pub fn supports(capabilities: &ServerCapabilities, feature: Feature) -> bool {
    match feature {
        Feature::Definition => one_of(&capabilities.definition_provider),
        Feature::References => one_of(&capabilities.references_provider),
        Feature::DocumentSymbol => one_of(&capabilities.document_symbol_provider),
        Feature::WorkspaceSymbol => one_of(&capabilities.workspace_symbol_provider),
        Feature::Declaration => match &capabilities.declaration_provider {
            Some(DeclarationCapability::Simple(enabled)) => *enabled,
            Some(_) => true,
            None => false,
        },
        Feature::TypeDefinition => match &capabilities.type_definition_provider {
            Some(TypeDefinitionProviderCapability::Simple(enabled)) => *enabled,
            Some(_) => true,
            None => false,
        },
        Feature::Implementation => match &capabilities.implementation_provider {
            Some(ImplementationProviderCapability::Simple(enabled)) => *enabled,
            Some(_) => true,
            None => false,
        },
        Feature::Hover => match &capabilities.hover_provider {
            Some(HoverProviderCapability::Simple(enabled)) => *enabled,
            Some(_) => true,
            None => false,
        },
        Feature::Completion => capabilities.completion_provider.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn capabilities(value: serde_json::Value) -> ServerCapabilities {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_boolean_and_options_providers() {
        let caps = capabilities(json!({
            "definitionProvider": true,
            "referencesProvider": {"workDoneProgress": false},
            "documentSymbolProvider": false,
            "hoverProvider": true,
            "completionProvider": {"triggerCharacters": ["."]}
        }));

        assert!(supports(&caps, Feature::Definition));
        assert!(supports(&caps, Feature::References));
        assert!(!supports(&caps, Feature::DocumentSymbol));
        assert!(supports(&caps, Feature::Hover));
        assert!(supports(&caps, Feature::Completion));
    }

    #[test]
    fn test_absent_providers_are_unsupported() {
        let caps = capabilities(json!({}));

        for feature in [
            Feature::Definition,
            Feature::Declaration,
            Feature::TypeDefinition,
            Feature::Implementation,
            Feature::References,
            Feature::DocumentSymbol,
            Feature::WorkspaceSymbol,
            Feature::Hover,
            Feature::Completion,
        ] {
            assert!(!supports(&caps, feature), "{feature} should be unsupported");
        }
    }
}
