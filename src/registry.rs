//! Known feed sources.
//!
//! The registry is loaded once from the source catalog. A catalog failure is
//! logged and leaves the registry empty; process start is not aborted.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

pub type SourceId = i64;

/// A configured video feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled", alias = "is_active")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Source {
    pub fn new(id: SourceId, name: &str, url: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            url: url.to_string(),
            enabled: true,
        }
    }
}

/// Where sources come from.
pub trait SourceCatalog {
    fn list_sources(&self) -> Result<Vec<Source>, BackendError>;
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<BTreeMap<SourceId, Arc<Source>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let registry = Self::new();
        registry.replace_all(sources);
        registry
    }

    /// Load from the catalog. Failures leave the registry empty.
    pub fn load(catalog: &dyn SourceCatalog) -> Self {
        match catalog.list_sources() {
            Ok(sources) => {
                let registry = Self::from_sources(sources);
                log::info!("registry: loaded {} sources from catalog", registry.len());
                registry
            }
            Err(e) => {
                log::error!("registry: failed to load sources: {}", e);
                Self::new()
            }
        }
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<Source>> {
        self.read().get(&id).cloned()
    }

    /// All source ids in ascending order.
    pub fn ids(&self) -> Vec<SourceId> {
        self.read().keys().copied().collect()
    }

    pub fn sources(&self) -> Vec<Arc<Source>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Insert or replace one source. Running workers keep the `Arc` they were
    /// started with until restarted.
    pub fn reconfigure(&self, source: Source) -> Option<Arc<Source>> {
        self.write().insert(source.id, Arc::new(source))
    }

    pub fn replace_all(&self, sources: impl IntoIterator<Item = Source>) {
        let mut map = self.write();
        map.clear();
        for source in sources {
            if map.contains_key(&source.id) {
                log::warn!("registry: duplicate source id {}, keeping the last entry", source.id);
            }
            map.insert(source.id, Arc::new(source));
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<SourceId, Arc<Source>>> {
        self.sources.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<SourceId, Arc<Source>>> {
        self.sources.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
