//! Capabilities registered after the handshake via `client/registerCapability`.
use lsp_types::Registration;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Registrations keyed by their id. Kept apart from the static capability tree;
/// guards consult both.
#[derive(Debug, Default)]
pub struct RegistrationStore {
    entries: RwLock<HashMap<String, Registration>>,
}

impl RegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registrations: impl IntoIterator<Item = Registration>) {
        let mut entries = self.entries.write();
        for registration in registrations {
            tracing::debug!(id = %registration.id, method = %registration.method, "capability registered");
            if let Some(previous) = entries.insert(registration.id.clone(), registration) {
                tracing::warn!(id = %previous.id, method = %previous.method, "registration id reused; replacing");
            }
        }
    }

    /// Remove registrations by id; unknown ids are ignored.
    pub fn unregister<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<Registration> {
        let mut entries = self.entries.write();
        ids.into_iter()
            .filter_map(|id| {
                let removed = entries.remove(id);
                if removed.is_none() {
                    tracing::debug!(id, "unregister for unknown registration id");
                }
                removed
            })
            .collect()
    }

    pub fn contains_method(&self, method: &str) -> bool {
        self.entries.read().values().any(|r| r.method == method)
    }

    pub fn get(&self, id: &str) -> Option<Registration> {
        self.entries.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Registration> {
        let mut all: Vec<Registration> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registration(id: &str, method: &str) -> Registration {
        Registration {
            id: id.to_string(),
            method: method.to_string(),
            register_options: Some(json!({"documentSelector": null})),
        }
    }

    #[test]
    fn test_register_and_unregister_by_id() {
        let store = RegistrationStore::new();
        store.register(vec![
            registration("1", "textDocument/formatting"),
            registration("2", "workspace/symbol"),
        ]);
        assert!(store.contains_method("textDocument/formatting"));

        let removed = store.unregister(["1", "missing"]);
        assert_eq!(removed.len(), 1);
        assert!(!store.contains_method("textDocument/formatting"));
        assert!(store.contains_method("workspace/symbol"));
    }

    #[test]
    fn test_same_method_under_two_ids_survives_one_unregister() {
        let store = RegistrationStore::new();
        store.register(vec![registration("a", "workspace/symbol"), registration("b", "workspace/symbol")]);
        store.unregister(["a"]);
        assert!(store.contains_method("workspace/symbol"));
        assert_eq!(store.list()[0].id, "b");
    }
}
