//! Provider registry. The first registered provider becomes primary.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cloudfs_core::{CloudfsError, CloudfsResult};

use crate::Provider;

#[derive(Default)]
struct Inner {
    providers: HashMap<String, Arc<dyn Provider>>,
    order: Vec<String>,
    primary: Option<String>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn Provider>) -> CloudfsResult<()> {
        let mut inner = self.write()?;
        let id = provider.id().to_string();
        if inner.providers.contains_key(&id) {
            return Err(CloudfsError::AlreadyExists(format!("provider {id}")));
        }
        if inner.primary.is_none() {
            inner.primary = Some(id.clone());
        }
        inner.order.push(id.clone());
        inner.providers.insert(id, provider);
        Ok(())
    }

    pub fn get(&self, id: &str) -> CloudfsResult<Option<Arc<dyn Provider>>> {
        Ok(self.read()?.providers.get(id).cloned())
    }

    /// Like [`get`](Self::get) but failing with `NoProvider`.
    pub fn require(&self, id: &str) -> CloudfsResult<Arc<dyn Provider>> {
        self.get(id)?
            .ok_or_else(|| CloudfsError::NoProvider(id.to_string()))
    }

    /// All providers in registration order.
    pub fn all(&self) -> CloudfsResult<Vec<Arc<dyn Provider>>> {
        let inner = self.read()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.providers.get(id).cloned())
            .collect())
    }

    pub fn primary(&self) -> CloudfsResult<Option<Arc<dyn Provider>>> {
        let inner = self.read()?;
        Ok(inner
            .primary
            .as_ref()
            .and_then(|id| inner.providers.get(id).cloned()))
    }

    pub fn set_primary(&self, id: &str) -> CloudfsResult<()> {
        let mut inner = self.write()?;
        if !inner.providers.contains_key(id) {
            return Err(CloudfsError::NoProvider(id.to_string()));
        }
        inner.primary = Some(id.to_string());
        Ok(())
    }

    /// Drop a provider from the registry. The engine verifies no placement
    /// references it before calling this.
    pub fn unregister(&self, id: &str) -> CloudfsResult<()> {
        let mut inner = self.write()?;
        if inner.providers.remove(id).is_none() {
            return Err(CloudfsError::NoProvider(id.to_string()));
        }
        inner.order.retain(|existing| existing != id);
        if inner.primary.as_deref() == Some(id) {
            inner.primary = inner.order.first().cloned();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.providers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> CloudfsResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| CloudfsError::Storage("registry lock poisoned".into()))
    }

    fn write(&self) -> CloudfsResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| CloudfsError::Storage("registry lock poisoned".into()))
    }
}
