//! Immutable kind → store map built once at construction.

use std::sync::Arc;

use kcache_core::{gvk_key, list_gvk, CacheOptions, CacheResult, Connector, Gvk, RemoteFetch, WatchSource};
use kcache_store::WatchStore;
use rustc_hash::FxHashMap;
use tracing::info;

/// Everything the facade needs to serve one dedicated kind.
pub struct KindEntry {
    pub gvk: Gvk,
    pub store: Arc<WatchStore>,
    pub source: Arc<dyn WatchSource>,
    pub fetcher: Arc<dyn RemoteFetch>,
}

/// Dedicated stores, reachable by kind and by the kind's list identifier.
pub struct StoreRegistry {
    by_kind: FxHashMap<Gvk, Arc<KindEntry>>,
    entries: Vec<Arc<KindEntry>>,
    options: CacheOptions,
}

impl StoreRegistry {
    /// Build one store per kind. The first kind that cannot be resolved
    /// aborts construction.
    pub fn build(kinds: &[Gvk], connector: &dyn Connector, options: &CacheOptions) -> CacheResult<Self> {
        let mut by_kind = FxHashMap::default();
        let mut entries = Vec::with_capacity(kinds.len());
        for gvk in kinds {
            if by_kind.contains_key(gvk) {
                continue;
            }
            let namespaced = connector.namespaced(gvk)?;
            let ns = options.namespace.as_deref().filter(|_| namespaced);
            let entry = Arc::new(KindEntry {
                gvk: gvk.clone(),
                store: Arc::new(WatchStore::new(gvk.clone(), options.event_buffer)),
                source: connector.watch_source(gvk, ns, None)?,
                fetcher: connector.fetcher(gvk)?,
            });
            info!(gvk = %gvk_key(gvk), ns = %ns.unwrap_or("(all)"), "cache: dedicated store registered");
            by_kind.insert(list_gvk(gvk), entry.clone());
            by_kind.insert(gvk.clone(), entry.clone());
            entries.push(entry);
        }
        Ok(Self { by_kind, entries, options: options.clone() })
    }

    /// Entry for a kind or its list identifier.
    pub fn lookup(&self, gvk: &Gvk) -> Option<&Arc<KindEntry>> {
        self.by_kind.get(gvk)
    }

    pub fn contains(&self, gvk: &Gvk) -> bool {
        self.by_kind.contains_key(gvk)
    }

    pub fn entries(&self) -> &[Arc<KindEntry>] {
        &self.entries
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }
}
