//! kcache facade: one read interface over dedicated stores and a fallback.
//!
//! Kinds listed at construction get a [`WatchStore`](kcache_store::WatchStore)
//! each, with a remote fetch on miss. Every other kind is delegated untouched
//! to a [`FallbackCache`].

#![forbid(unsafe_code)]

mod fallback;
mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kcache_core::{
    gvk_key, list_gvk, stamp_kind, CacheObject, CacheResult, DynamicObject, Extractor, Gvk, ListOptions, ObjectKey,
};
use kcache_kubehub::Scheme;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use fallback::{FallbackCache, FilteredCache, KindInformer};
pub use kcache_store::{Informer, StoreEvent};
pub use registry::{KindEntry, StoreRegistry};

/// Read-through cache: dedicated stores for configured kinds, the fallback
/// for everything else.
pub struct SelectiveCache {
    registry: StoreRegistry,
    fallback: Arc<dyn FallbackCache>,
    scheme: Arc<Scheme>,
    started: AtomicBool,
}

impl SelectiveCache {
    pub fn new(registry: StoreRegistry, fallback: Arc<dyn FallbackCache>, scheme: Arc<Scheme>) -> Self {
        Self { registry, fallback, scheme, started: AtomicBool::new(false) }
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }

    pub async fn get<K: CacheObject>(&self, key: &ObjectKey) -> CacheResult<K> {
        let gvk = self.scheme.gvk_for::<K>()?;
        K::from_cached(self.get_dynamic(&gvk, key).await?)
    }

    /// Serve `key` from the kind's store, falling back to one remote GET on a
    /// miss. A fetched object is returned but not stored; the watch delivers
    /// it in due course.
    pub async fn get_dynamic(&self, gvk: &Gvk, key: &ObjectKey) -> CacheResult<DynamicObject> {
        let Some(entry) = self.registry.lookup(gvk) else {
            counter!("cache_reads_total", 1u64, "path" => "fallback");
            return self.fallback.get(gvk, key).await;
        };
        if let Some(obj) = entry.store.get(key) {
            counter!("cache_reads_total", 1u64, "path" => "store");
            return Ok(obj);
        }
        counter!("cache_reads_total", 1u64, "path" => "remote");
        let started = Instant::now();
        match entry.fetcher.fetch(key).await {
            Ok(mut obj) => {
                stamp_kind(&mut obj, &entry.gvk);
                counter!("cache_refills_total", 1u64, "outcome" => "hit");
                debug!(gvk = %gvk_key(&entry.gvk), key = %key, took_ms = %started.elapsed().as_millis(), "cache: miss refilled");
                Ok(obj)
            }
            Err(e) if e.is_not_found() => {
                counter!("cache_refills_total", 1u64, "outcome" => "not_found");
                Err(e)
            }
            Err(e) => {
                counter!("cache_refills_total", 1u64, "outcome" => "error");
                warn!(gvk = %gvk_key(&entry.gvk), key = %key, error = %e, "cache: refill failed");
                Err(e)
            }
        }
    }

    pub async fn list<K: CacheObject>(&self, opts: &ListOptions) -> CacheResult<Vec<K>> {
        let gvk = self.scheme.gvk_for::<K>()?;
        self.list_dynamic(&list_gvk(&gvk), opts).await?.into_iter().map(K::from_cached).collect()
    }

    /// `gvk` may be the kind or its list identifier.
    pub async fn list_dynamic(&self, gvk: &Gvk, opts: &ListOptions) -> CacheResult<Vec<DynamicObject>> {
        match self.registry.lookup(gvk) {
            Some(entry) => {
                counter!("cache_reads_total", 1u64, "path" => "store");
                entry.store.list(opts)
            }
            None => {
                counter!("cache_reads_total", 1u64, "path" => "fallback");
                self.fallback.list(gvk, opts).await
            }
        }
    }

    pub async fn get_informer<K: CacheObject>(&self) -> CacheResult<Arc<dyn Informer>> {
        let gvk = self.scheme.gvk_for::<K>()?;
        self.get_informer_for_kind(&gvk).await
    }

    pub async fn get_informer_for_kind(&self, gvk: &Gvk) -> CacheResult<Arc<dyn Informer>> {
        match self.registry.lookup(gvk) {
            Some(entry) => {
                let informer: Arc<dyn Informer> = entry.store.clone();
                Ok(informer)
            }
            None => self.fallback.get_informer_for_kind(gvk).await,
        }
    }

    pub async fn index_field<K: CacheObject>(&self, field: &str, extractor: Extractor) -> CacheResult<()> {
        let gvk = self.scheme.gvk_for::<K>()?;
        self.index_field_for_kind(&gvk, field, extractor).await
    }

    /// Register index `field:<field>` on the kind's store or in the fallback.
    pub async fn index_field_for_kind(&self, gvk: &Gvk, field: &str, extractor: Extractor) -> CacheResult<()> {
        match self.registry.lookup(gvk) {
            Some(entry) => entry.store.index_field(field, extractor),
            None => self.fallback.index_field(gvk, field, extractor).await,
        }
    }

    /// Spawn one watch task per dedicated store, then run the fallback until
    /// `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> CacheResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("cache: start called twice; dedicated stores already running");
        } else {
            let opts = self.registry.options();
            for entry in self.registry.entries() {
                tokio::spawn(entry.store.clone().run(entry.source.clone(), opts.resync, opts.watch_backoff, cancel.clone()));
            }
            info!(stores = self.registry.entries().len(), "cache: dedicated stores started");
        }
        self.fallback.start(cancel).await
    }

    /// `true` once every dedicated store and then the fallback have synced.
    /// A single unsynced store blocks until `cancel` fires, which yields
    /// `false`.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let started = Instant::now();
        for entry in self.registry.entries() {
            if !entry.store.wait_synced(cancel).await {
                debug!(gvk = %gvk_key(&entry.gvk), "cache: sync wait cancelled");
                return false;
            }
        }
        let synced = self.fallback.wait_for_sync(cancel).await;
        if synced {
            info!(took_ms = %started.elapsed().as_millis(), "cache: synced");
        }
        synced
    }
}
