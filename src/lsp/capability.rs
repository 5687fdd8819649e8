//! Capability trees and the guards that check methods against them.
use crate::lsp::error::CapabilityError;
use crate::lsp::registration::RegistrationStore;
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Which peer's declared capabilities a method is gated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilitySide {
    /// Client-to-server methods, gated by `ServerCapabilities`.
    Server,
    /// Server-to-client methods, gated by `ClientCapabilities`.
    Client,
}

impl fmt::Display for CapabilitySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilitySide::Server => write!(f, "server"),
            CapabilitySide::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKey {
    /// Always available regardless of what was declared.
    Always,
    /// Dot-separated path into the capability tree.
    Path(&'static str),
}

lazy_static! {
    static ref ALWAYS_ALLOWED: HashSet<&'static str> = [
        "initialize",
        "initialized",
        "shutdown",
        "exit",
        "$/cancelRequest",
        "$/progress",
        "$/setTrace",
        "$/logTrace",
        "client/registerCapability",
        "client/unregisterCapability",
        "window/workDoneProgress/cancel",
        "textDocument/didOpen",
        "textDocument/didChange",
        "textDocument/didClose",
        "textDocument/didSave",
        "textDocument/willSave",
        "textDocument/willSaveWaitUntil",
    ]
    .into_iter()
    .collect();

    static ref SERVER_CAPABILITIES: HashMap<&'static str, CapabilityKey> = {
        use CapabilityKey::*;
        [
            ("textDocument/hover", Path("hoverProvider")),
            ("textDocument/completion", Path("completionProvider")),
            ("completionItem/resolve", Path("completionProvider.resolveProvider")),
            ("textDocument/signatureHelp", Path("signatureHelpProvider")),
            ("textDocument/declaration", Path("declarationProvider")),
            ("textDocument/definition", Path("definitionProvider")),
            ("textDocument/typeDefinition", Path("typeDefinitionProvider")),
            ("textDocument/implementation", Path("implementationProvider")),
            ("textDocument/references", Path("referencesProvider")),
            ("textDocument/documentHighlight", Path("documentHighlightProvider")),
            ("textDocument/documentSymbol", Path("documentSymbolProvider")),
            ("textDocument/codeAction", Path("codeActionProvider")),
            ("codeAction/resolve", Path("codeActionProvider.resolveProvider")),
            ("textDocument/codeLens", Path("codeLensProvider")),
            ("codeLens/resolve", Path("codeLensProvider.resolveProvider")),
            ("textDocument/documentLink", Path("documentLinkProvider")),
            ("documentLink/resolve", Path("documentLinkProvider.resolveProvider")),
            ("textDocument/documentColor", Path("colorProvider")),
            ("textDocument/colorPresentation", Path("colorProvider")),
            ("textDocument/formatting", Path("documentFormattingProvider")),
            ("textDocument/rangeFormatting", Path("documentRangeFormattingProvider")),
            ("textDocument/onTypeFormatting", Path("documentOnTypeFormattingProvider")),
            ("textDocument/rename", Path("renameProvider")),
            ("textDocument/prepareRename", Path("renameProvider.prepareProvider")),
            ("textDocument/foldingRange", Path("foldingRangeProvider")),
            ("textDocument/selectionRange", Path("selectionRangeProvider")),
            ("textDocument/prepareCallHierarchy", Path("callHierarchyProvider")),
            ("callHierarchy/incomingCalls", Path("callHierarchyProvider")),
            ("callHierarchy/outgoingCalls", Path("callHierarchyProvider")),
            ("textDocument/prepareTypeHierarchy", Path("typeHierarchyProvider")),
            ("typeHierarchy/supertypes", Path("typeHierarchyProvider")),
            ("typeHierarchy/subtypes", Path("typeHierarchyProvider")),
            ("textDocument/semanticTokens/full", Path("semanticTokensProvider.full")),
            ("textDocument/semanticTokens/full/delta", Path("semanticTokensProvider.full.delta")),
            ("textDocument/semanticTokens/range", Path("semanticTokensProvider.range")),
            ("textDocument/linkedEditingRange", Path("linkedEditingRangeProvider")),
            ("textDocument/moniker", Path("monikerProvider")),
            ("textDocument/inlayHint", Path("inlayHintProvider")),
            ("inlayHint/resolve", Path("inlayHintProvider.resolveProvider")),
            ("textDocument/inlineValue", Path("inlineValueProvider")),
            ("textDocument/diagnostic", Path("diagnosticProvider")),
            ("workspace/diagnostic", Path("diagnosticProvider.workspaceDiagnostics")),
            ("workspace/symbol", Path("workspaceSymbolProvider")),
            ("workspaceSymbol/resolve", Path("workspaceSymbolProvider.resolveProvider")),
            ("workspace/executeCommand", Path("executeCommandProvider")),
            ("workspace/willCreateFiles", Path("workspace.fileOperations.willCreate")),
            ("workspace/didCreateFiles", Path("workspace.fileOperations.didCreate")),
            ("workspace/willRenameFiles", Path("workspace.fileOperations.willRename")),
            ("workspace/didRenameFiles", Path("workspace.fileOperations.didRename")),
            ("workspace/willDeleteFiles", Path("workspace.fileOperations.willDelete")),
            ("workspace/didDeleteFiles", Path("workspace.fileOperations.didDelete")),
            (
                "workspace/didChangeWorkspaceFolders",
                Path("workspace.workspaceFolders.changeNotifications"),
            ),
            ("workspace/didChangeConfiguration", Always),
            ("workspace/didChangeWatchedFiles", Always),
        ]
        .into_iter()
        .collect()
    };

    static ref CLIENT_CAPABILITIES: HashMap<&'static str, CapabilityKey> = {
        use CapabilityKey::*;
        [
            ("workspace/applyEdit", Path("workspace.applyEdit")),
            ("workspace/configuration", Path("workspace.configuration")),
            ("workspace/workspaceFolders", Path("workspace.workspaceFolders")),
            ("workspace/semanticTokens/refresh", Path("workspace.semanticTokens.refreshSupport")),
            ("workspace/codeLens/refresh", Path("workspace.codeLens.refreshSupport")),
            ("workspace/inlayHint/refresh", Path("workspace.inlayHint.refreshSupport")),
            ("workspace/inlineValue/refresh", Path("workspace.inlineValue.refreshSupport")),
            ("workspace/diagnostic/refresh", Path("workspace.diagnostics.refreshSupport")),
            ("window/workDoneProgress/create", Path("window.workDoneProgress")),
            ("window/showDocument", Path("window.showDocument.support")),
            ("window/showMessage", Always),
            ("window/showMessageRequest", Always),
            ("window/logMessage", Always),
            ("telemetry/event", Always),
            ("textDocument/publishDiagnostics", Always),
        ]
        .into_iter()
        .collect()
    };
}

pub fn is_always_allowed(method: &str) -> bool {
    ALWAYS_ALLOWED.contains(method)
}

/// Capability key gating `method`, looked up in the table for `side`.
pub fn resolve_capability(side: CapabilitySide, method: &str) -> Option<CapabilityKey> {
    match side {
        CapabilitySide::Server => SERVER_CAPABILITIES.get(method).copied(),
        CapabilitySide::Client => CLIENT_CAPABILITIES.get(method).copied(),
    }
}

/// Immutable snapshot of a declared capability set.
#[derive(Debug, Clone)]
pub struct CapabilityTree(Arc<Value>);

impl Default for CapabilityTree {
    fn default() -> Self {
        CapabilityTree(Arc::new(Value::Object(Default::default())))
    }
}

impl CapabilityTree {
    pub fn new(capabilities: Value) -> Self {
        CapabilityTree(Arc::new(capabilities))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self.0.as_ref(), |node, segment| node.as_object()?.get(segment))
    }

    /// Present and neither `false` nor `null`.
    pub fn is_enabled(&self, path: &str) -> bool {
        !matches!(self.lookup(path), None | Some(Value::Null) | Some(Value::Bool(false)))
    }
}

/// Which traffic a guard polices; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardRole {
    /// Local calls checked against the remote's capabilities.
    Outbound,
    /// Local handlers (and the remote calls they serve) checked against local capabilities.
    Inbound,
}

impl fmt::Display for GuardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardRole::Outbound => write!(f, "outbound"),
            GuardRole::Inbound => write!(f, "inbound"),
        }
    }
}

/// Authorizes methods against one capability tree. Rebuilt, never mutated,
/// when capabilities are (re)declared.
#[derive(Debug, Clone)]
pub struct CapabilityGuard {
    role: GuardRole,
    side: CapabilitySide,
    tree: CapabilityTree,
    strict: bool,
}

impl CapabilityGuard {
    pub fn new(role: GuardRole, side: CapabilitySide, tree: CapabilityTree, strict: bool) -> Self {
        CapabilityGuard {
            role,
            side,
            tree,
            strict,
        }
    }

    pub fn tree(&self) -> &CapabilityTree {
        &self.tree
    }

    pub fn side(&self) -> CapabilitySide {
        self.side
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// `Ok(true)` when the method is supported. In non-strict mode an
    /// unsupported method yields `Ok(false)` after a warning and the caller
    /// proceeds; strict mode returns the error instead.
    pub fn check(&self, method: &str, registrations: &RegistrationStore) -> Result<bool, CapabilityError> {
        if is_always_allowed(method) {
            return Ok(true);
        }
        let path = match resolve_capability(self.side, method) {
            Some(CapabilityKey::Always) => return Ok(true),
            Some(CapabilityKey::Path(path)) => path,
            None => {
                if registrations.contains_method(method) {
                    return Ok(true);
                }
                if self.strict {
                    return Err(CapabilityError::UnknownMethod {
                        method: method.to_string(),
                    });
                }
                tracing::debug!(guard = %self.role, side = %self.side, method, "no capability mapping; allowing");
                return Ok(true);
            }
        };
        if self.tree.is_enabled(path) || registrations.contains_method(method) {
            return Ok(true);
        }
        if self.strict {
            return Err(CapabilityError::Unsupported {
                method: method.to_string(),
                path: path.to_string(),
            });
        }
        tracing::warn!(
            guard = %self.role,
            side = %self.side,
            method,
            capability = path,
            "capability not declared; proceeding anyway"
        );
        Ok(false)
    }
}
