//! Cache for every kind without a dedicated store.

use std::sync::{Arc, Mutex, PoisonError};

use kcache_core::{
    gvk_key, item_gvk, CacheError, CacheOptions, CacheResult, Connector, DynamicObject, Extractor, Gvk, LabelSelector,
    ListOptions, ObjectKey, WatchSource,
};
use kcache_store::{Informer, StoreEvent, WatchStore};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Read interface the facade delegates to for kinds it does not own.
#[async_trait::async_trait]
pub trait FallbackCache: Send + Sync {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> CacheResult<DynamicObject>;

    /// `gvk` may be the kind or its list identifier.
    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> CacheResult<Vec<DynamicObject>>;

    async fn get_informer_for_kind(&self, gvk: &Gvk) -> CacheResult<Arc<dyn Informer>>;

    async fn index_field(&self, gvk: &Gvk, field: &str, extractor: Extractor) -> CacheResult<()>;

    /// Run until `cancel` fires.
    async fn start(&self, cancel: CancellationToken) -> CacheResult<()>;

    /// `true` once everything started so far has synced, `false` on cancel.
    async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool;
}

struct Watched {
    namespace: Option<String>,
    store: Arc<WatchStore>,
    source: Arc<dyn WatchSource>,
}

/// All stores backing one kind in the fallback: one per watched namespace,
/// or a single cluster-wide store. They share one change channel.
pub struct KindInformer {
    gvk: Gvk,
    per_namespace: bool,
    watched: Vec<Watched>,
    events: broadcast::Sender<StoreEvent>,
}

impl KindInformer {
    fn store_for(&self, namespace: Option<&str>) -> Option<&Arc<WatchStore>> {
        if !self.per_namespace {
            return self.watched.first().map(|w| &w.store);
        }
        let ns = namespace?;
        self.watched.iter().find(|w| w.namespace.as_deref() == Some(ns)).map(|w| &w.store)
    }

    fn stores(&self) -> impl Iterator<Item = &Arc<WatchStore>> {
        self.watched.iter().map(|w| &w.store)
    }

    fn spawn(&self, options: &CacheOptions, cancel: &CancellationToken) {
        for w in &self.watched {
            tokio::spawn(w.store.clone().run(w.source.clone(), options.resync, options.watch_backoff, cancel.clone()));
        }
    }

    async fn wait_synced(&self, cancel: &CancellationToken) -> bool {
        for store in self.stores() {
            if !store.wait_synced(cancel).await {
                return false;
            }
        }
        true
    }
}

impl Informer for KindInformer {
    fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    fn has_synced(&self) -> bool {
        self.stores().all(|s| s.has_synced())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn add_indexer(&self, name: &str, f: Extractor) -> CacheResult<()> {
        for store in self.stores() {
            store.add_indexer(name, f.clone())?;
        }
        Ok(())
    }

    fn list_all(&self) -> Vec<DynamicObject> {
        self.stores().flat_map(|s| s.list_all()).collect()
    }
}

#[derive(Default)]
struct State {
    kinds: FxHashMap<Gvk, Arc<KindInformer>>,
    running: Option<CancellationToken>,
}

/// Fallback that watches kinds lazily on first use, filtered by a per-kind
/// label selector and optionally restricted to a set of namespaces.
pub struct FilteredCache {
    connector: Arc<dyn Connector>,
    selectors: FxHashMap<Gvk, LabelSelector>,
    namespaces: Vec<String>,
    options: CacheOptions,
    state: Mutex<State>,
}

impl FilteredCache {
    pub fn new(connector: Arc<dyn Connector>, options: CacheOptions) -> Self {
        Self {
            connector,
            selectors: FxHashMap::default(),
            namespaces: Vec::new(),
            options,
            state: Mutex::new(State::default()),
        }
    }

    /// Only watch objects of `gvk` that match `selector`.
    pub fn with_selector(mut self, gvk: Gvk, selector: LabelSelector) -> Self {
        self.selectors.insert(gvk, selector);
        self
    }

    /// Watch namespaced kinds in these namespaces only. Empty and repeated
    /// names are ignored; no names means cluster-wide.
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = FxHashSet::default();
        self.namespaces = namespaces
            .into_iter()
            .map(Into::into)
            .filter(|ns: &String| !ns.is_empty() && seen.insert(ns.clone()))
            .collect();
        self
    }

    fn informers(&self) -> Vec<Arc<KindInformer>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.kinds.values().cloned().collect()
    }

    /// Informer for `gvk`, creating its stores on first use. After start,
    /// every caller waits until the informer has synced, whether it created
    /// it or found it already registered.
    async fn informer(&self, gvk: &Gvk) -> CacheResult<Arc<KindInformer>> {
        let (informer, running) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let informer = match state.kinds.get(gvk) {
                Some(existing) => existing.clone(),
                None => {
                    let informer = Arc::new(self.build(gvk)?);
                    state.kinds.insert(gvk.clone(), informer.clone());
                    if let Some(cancel) = &state.running {
                        informer.spawn(&self.options, cancel);
                    }
                    informer
                }
            };
            (informer, state.running.clone())
        };
        if let Some(cancel) = running.filter(|_| !informer.has_synced()) {
            if !informer.wait_synced(&cancel).await {
                return Err(CacheError::Remote(format!("cache stopped before {} synced", gvk_key(gvk))));
            }
        }
        Ok(informer)
    }

    fn build(&self, gvk: &Gvk) -> CacheResult<KindInformer> {
        let namespaced = self.connector.namespaced(gvk)?;
        let labels = self.selectors.get(gvk);
        let (events, _) = broadcast::channel(self.options.event_buffer.max(1));
        let per_namespace = namespaced && !self.namespaces.is_empty();
        let scopes: Vec<Option<&str>> = if per_namespace {
            self.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        } else {
            vec![None]
        };
        let mut watched = Vec::with_capacity(scopes.len());
        for ns in scopes {
            watched.push(Watched {
                namespace: ns.map(str::to_string),
                store: Arc::new(WatchStore::with_events(gvk.clone(), events.clone())),
                source: self.connector.watch_source(gvk, ns, labels)?,
            });
        }
        info!(
            gvk = %gvk_key(gvk),
            stores = watched.len(),
            labels = %labels.map(|l| l.to_string()).unwrap_or_default(),
            "fallback: informer created"
        );
        Ok(KindInformer { gvk: gvk.clone(), per_namespace, watched, events })
    }
}

#[async_trait::async_trait]
impl FallbackCache for FilteredCache {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> CacheResult<DynamicObject> {
        let informer = self.informer(gvk).await?;
        informer
            .store_for(key.namespace())
            .and_then(|s| s.get(key))
            .ok_or_else(|| CacheError::not_found(gvk_key(gvk), key))
    }

    async fn list(&self, gvk: &Gvk, opts: &ListOptions) -> CacheResult<Vec<DynamicObject>> {
        let informer = self.informer(&item_gvk(gvk)).await?;
        if informer.per_namespace {
            if let Some(ns) = opts.namespace() {
                return match informer.store_for(Some(ns)) {
                    Some(store) => store.list(opts),
                    None => {
                        debug!(gvk = %gvk_key(gvk), ns = %ns, "fallback: namespace not watched");
                        Ok(Vec::new())
                    }
                };
            }
        }
        let mut out = Vec::new();
        for store in informer.stores() {
            out.extend(store.list(opts)?);
        }
        Ok(out)
    }

    async fn get_informer_for_kind(&self, gvk: &Gvk) -> CacheResult<Arc<dyn Informer>> {
        let informer: Arc<dyn Informer> = self.informer(gvk).await?;
        Ok(informer)
    }

    async fn index_field(&self, gvk: &Gvk, field: &str, extractor: Extractor) -> CacheResult<()> {
        let informer = self.informer(gvk).await?;
        for store in informer.stores() {
            store.index_field(field, extractor.clone())?;
        }
        Ok(())
    }

    async fn start(&self, cancel: CancellationToken) -> CacheResult<()> {
        let started = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.running.is_some() {
                false
            } else {
                for informer in state.kinds.values() {
                    informer.spawn(&self.options, &cancel);
                }
                state.running = Some(cancel.clone());
                true
            }
        };
        if started {
            info!(namespaces = ?self.namespaces, "fallback: started");
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        for informer in self.informers() {
            if !informer.wait_synced(cancel).await {
                return false;
            }
        }
        true
    }
}
