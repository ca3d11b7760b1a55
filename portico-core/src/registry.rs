//! Registries resolving port URIs to reachable endpoints.
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use tracing::debug;

use crate::{port::PortEndpoint, Result};

/// The registry/locator contract ports publish themselves into.
pub trait Registry: Send + Sync {
    fn publish(&self, uri: &str, endpoint: Arc<dyn PortEndpoint>) -> Result<()>;
    fn unpublish(&self, uri: &str) -> Result<()>;
    /// Returns `None` when the URI is unknown to this registry.
    fn resolve(&self, uri: &str) -> Option<Arc<dyn PortEndpoint>>;
}

/// In-process registry of one runtime context.
///
/// Entries do not keep ports alive: a port dropped without being
/// unpublished simply stops resolving.
#[derive(Default)]
pub struct LocalRegistry {
    table: RwLock<HashMap<String, Weak<dyn PortEndpoint>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table
            .read()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Registry for LocalRegistry {
    fn publish(&self, uri: &str, endpoint: Arc<dyn PortEndpoint>) -> Result<()> {
        let mut table = self.table.write();
        if let Some(existing) = table.get(uri) {
            ensure_contract!(
                existing.strong_count() == 0,
                "port uri {uri} is already published"
            );
        }
        table.insert(uri.to_string(), Arc::downgrade(&endpoint));
        debug!("registry: published {uri}");
        Ok(())
    }

    fn unpublish(&self, uri: &str) -> Result<()> {
        ensure_contract!(
            self.table.write().remove(uri).is_some(),
            "port uri {uri} is not published"
        );
        debug!("registry: unpublished {uri}");
        Ok(())
    }

    fn resolve(&self, uri: &str) -> Option<Arc<dyn PortEndpoint>> {
        self.table.read().get(uri).and_then(Weak::upgrade)
    }
}
