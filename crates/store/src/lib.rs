//! kcache store: a watch-backed, indexed snapshot of one resource kind.
//!
//! A [`WatchStore`] is fed exclusively by its watch task ([`WatchStore::run`]);
//! readers take a short read lock and always receive independent,
//! kind-stamped copies.

#![forbid(unsafe_code)]

mod indexer;
mod source;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use kcache_core::{
    copy_as, field_index_name, gvk_key, meta_key, namespace_of, namespaced_index_key, CacheError, CacheResult,
    DynamicObject, Extractor, Gvk, ListOptions, ObjectKey, WatchEvent, WatchSource, NAMESPACE_INDEX,
};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use indexer::Indexer;
pub use source::{ChannelFeed, ChannelSource};

/// Change notification delivered to informer subscribers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Added(DynamicObject),
    Updated { old: DynamicObject, new: DynamicObject },
    Deleted(DynamicObject),
}

/// Handle to a running watch, for callers that subscribe directly.
pub trait Informer: Send + Sync {
    fn gvk(&self) -> &Gvk;
    fn has_synced(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
    fn add_indexer(&self, name: &str, f: Extractor) -> CacheResult<()>;
    fn list_all(&self) -> Vec<DynamicObject>;
}

/// Indexed snapshot of one kind, kept current by a list+watch subscription.
pub struct WatchStore {
    gvk: Gvk,
    label: String,
    inner: RwLock<Indexer>,
    synced: watch::Sender<bool>,
    events: broadcast::Sender<StoreEvent>,
}

fn namespace_index(obj: &DynamicObject) -> Vec<String> {
    vec![namespace_of(obj).to_string()]
}

impl WatchStore {
    /// New, unsynced store with the namespace index registered.
    pub fn new(gvk: Gvk, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self::with_events(gvk, events)
    }

    /// Like [`WatchStore::new`], publishing changes on a caller-owned channel
    /// so several stores can share one subscription.
    pub fn with_events(gvk: Gvk, events: broadcast::Sender<StoreEvent>) -> Self {
        let mut ix = Indexer::new();
        // fresh indexer: registration cannot conflict
        let _ = ix.add_indexer(NAMESPACE_INDEX, Arc::new(namespace_index));
        let (synced, _) = watch::channel(false);
        Self { label: gvk_key(&gvk), gvk, inner: RwLock::new(ix), synced, events }
    }

    pub fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexer> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexer> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Raw copy of the object stored under a snapshot-table key.
    pub fn get_by_key(&self, key: &str) -> Option<DynamicObject> {
        self.read().get(key).cloned()
    }

    /// Kind-stamped copy of the object at `key`, or `None` on a miss.
    pub fn get(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.read().get(&key.store_key()).map(|o| copy_as(o, &self.gvk))
    }

    pub fn by_index(&self, index: &str, value: &str) -> CacheResult<Vec<DynamicObject>> {
        Ok(self.read().by_index(index, value)?.into_iter().cloned().collect())
    }

    pub fn list_all(&self) -> Vec<DynamicObject> {
        self.read().list().cloned().collect()
    }

    /// Select, filter and copy objects for a list call.
    ///
    /// A field selector must be a single `field=value` requirement and is
    /// served from the `field:<field>` index; otherwise a namespace
    /// restriction is served from the namespace index; otherwise every object
    /// is a candidate. Candidates are then filtered by namespace and label
    /// selector. Order is unspecified.
    pub fn list(&self, opts: &ListOptions) -> CacheResult<Vec<DynamicObject>> {
        let started = Instant::now();
        let ns = opts.namespace();
        let inner = self.read();
        let candidates: Vec<&DynamicObject> = match (&opts.field_selector, ns) {
            (Some(fields), _) => {
                let (field, value) = fields.requires_exact_match().ok_or_else(|| {
                    CacheError::UnsupportedSelector(format!(
                        "non-exact field matches are not supported by the cache: {:?}",
                        fields.to_string()
                    ))
                })?;
                inner.by_index(&field_index_name(field), &namespaced_index_key(ns.unwrap_or(""), value))?
            }
            (None, Some(ns)) => inner.by_index(NAMESPACE_INDEX, ns)?,
            (None, None) => inner.list().collect(),
        };
        let mut out = Vec::with_capacity(candidates.len());
        for obj in candidates {
            if let Some(ns) = ns {
                if namespace_of(obj) != ns {
                    continue;
                }
            }
            if let Some(sel) = &opts.label_selector {
                if !sel.matches_opt(obj.metadata.labels.as_ref()) {
                    continue;
                }
            }
            out.push(copy_as(obj, &self.gvk));
        }
        drop(inner);
        histogram!("store_list_ms", started.elapsed().as_secs_f64() * 1_000.0);
        Ok(out)
    }

    pub fn add_indexer(&self, name: &str, f: Extractor) -> CacheResult<()> {
        self.write().add_indexer(name, f)?;
        debug!(gvk = %self.label, index = %name, "indexer registered");
        Ok(())
    }

    /// Register index `field:<field>`. Each extracted value of a namespaced
    /// object is stored twice, as `ns/value` and `__all_namespaces/value`;
    /// cluster-scoped objects store only the latter.
    pub fn index_field(&self, field: &str, extractor: Extractor) -> CacheResult<()> {
        let doubled: Extractor = Arc::new(move |obj: &DynamicObject| {
            let ns = namespace_of(obj);
            let raw = extractor(obj);
            if ns.is_empty() {
                return raw.iter().map(|v| namespaced_index_key("", v)).collect();
            }
            let mut vals = Vec::with_capacity(raw.len() * 2);
            vals.extend(raw.iter().map(|v| namespaced_index_key(ns, v)));
            vals.extend(raw.iter().map(|v| namespaced_index_key("", v)));
            vals
        });
        self.add_indexer(&field_index_name(field), doubled)
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Resolve once the store has synced (`true`) or `cancel` fires (`false`).
    pub async fn wait_synced(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            res = rx.wait_for(|s| *s) => res.is_ok(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Apply one watch event. Only the store's watch task calls this.
    pub fn apply(&self, event: WatchEvent) {
        let notify = self.events.receiver_count() > 0;
        let mut out = Vec::new();
        let mut restarted = false;
        let (kind, len) = {
            let mut inner = self.write();
            let kind = match event {
                WatchEvent::Applied(obj) => {
                    let key = meta_key(&obj.metadata);
                    let new = notify.then(|| obj.clone());
                    let old = inner.upsert(&key, obj);
                    if let Some(new) = new {
                        out.push(match old {
                            Some(old) => StoreEvent::Updated { old, new },
                            None => StoreEvent::Added(new),
                        });
                    }
                    "applied"
                }
                WatchEvent::Deleted(obj) => {
                    let key = meta_key(&obj.metadata);
                    // unknown keys are not announced
                    if let Some(old) = inner.remove(&key).filter(|_| notify) {
                        out.push(StoreEvent::Deleted(old));
                    }
                    "deleted"
                }
                WatchEvent::Restarted(list) => {
                    let fresh: FxHashMap<String, DynamicObject> =
                        list.into_iter().map(|o| (meta_key(&o.metadata), o)).collect();
                    let listed = notify.then(|| fresh.clone());
                    let mut previous = inner.replace(fresh);
                    if let Some(listed) = listed {
                        for (key, new) in listed {
                            out.push(match previous.remove(&key) {
                                Some(old) => StoreEvent::Updated { old, new },
                                None => StoreEvent::Added(new),
                            });
                        }
                        out.extend(previous.into_values().map(StoreEvent::Deleted));
                    }
                    restarted = true;
                    "restarted"
                }
            };
            (kind, inner.len())
        };
        if restarted && !self.has_synced() {
            info!(gvk = %self.label, objects = len, "store synced");
            self.synced.send_replace(true);
        }
        counter!("store_events_total", 1u64, "gvk" => self.label.clone(), "kind" => kind);
        gauge!("store_objects", len as f64, "gvk" => self.label.clone());
        for e in out {
            let _ = self.events.send(e);
        }
    }

    /// Drive the store from `source` until `cancel` fires.
    ///
    /// With `resync` set, the subscription is dropped and re-established
    /// every interval so the store re-lists. A stream that ends is
    /// re-established after `backoff`. Stream errors are logged; the source
    /// is expected to retry on its own.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn WatchSource>,
        resync: Option<Duration>,
        backoff: Duration,
        cancel: CancellationToken,
    ) {
        info!(gvk = %self.label, resync_secs = ?resync.map(|d| d.as_secs()), "store watch starting");
        loop {
            let mut stream = source.watch();
            let deadline = resync.map(|d| tokio::time::Instant::now() + d);
            let ended = loop {
                let resync_due = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(gvk = %self.label, "store watch stopped");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Ok(ev)) => self.apply(ev),
                        Some(Err(e)) => warn!(gvk = %self.label, error = %e, "watch error"),
                        None => break true,
                    },
                    _ = resync_due => {
                        debug!(gvk = %self.label, "resync: re-listing");
                        break false;
                    }
                }
            };
            counter!("watch_restarts_total", 1u64, "gvk" => self.label.clone());
            if ended {
                warn!(gvk = %self.label, backoff_ms = %backoff.as_millis(), "watch stream ended; restarting");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(gvk = %self.label, "store watch stopped");
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

impl Informer for WatchStore {
    fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    fn has_synced(&self) -> bool {
        WatchStore::has_synced(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        WatchStore::subscribe(self)
    }

    fn add_indexer(&self, name: &str, f: Extractor) -> CacheResult<()> {
        WatchStore::add_indexer(self, name, f)
    }

    fn list_all(&self) -> Vec<DynamicObject> {
        WatchStore::list_all(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcache_core::{field_extractor, FieldSelector, LabelSelector};
    use kube::core::ApiResource;

    fn gvk() -> Gvk {
        Gvk { group: "example.io".into(), version: "v1".into(), kind: "Widget".into() }
    }

    fn widget(name: &str, ns: &str, color: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, &ApiResource::from_gvk(&gvk()))
            .data(serde_json::json!({ "spec": { "color": color } }));
        if !ns.is_empty() {
            o = o.within(ns);
        }
        o.types = None;
        o
    }

    fn store() -> WatchStore {
        let s = WatchStore::new(gvk(), 16);
        s.index_field("spec.color", field_extractor("spec.color")).unwrap();
        s
    }

    #[test]
    fn get_returns_stamped_independent_copy() {
        let s = store();
        s.apply(WatchEvent::Applied(widget("w1", "ops", "red")));
        let mut got = s.get(&ObjectKey::namespaced("ops", "w1")).unwrap();
        assert_eq!(got.types.as_ref().map(|t| t.kind.as_str()), Some("Widget"));
        got.data["spec"]["color"] = serde_json::json!("blue");
        got.metadata.name = Some("mutated".into());
        let again = s.get(&ObjectKey::namespaced("ops", "w1")).unwrap();
        assert_eq!(again.data["spec"]["color"], "red");
        assert_eq!(again.metadata.name.as_deref(), Some("w1"));
        assert!(s.get(&ObjectKey::namespaced("other", "w1")).is_none());
    }

    #[test]
    fn cluster_scoped_keys_use_bare_name() {
        let s = store();
        s.apply(WatchEvent::Applied(widget("global", "", "red")));
        assert!(s.get_by_key("global").is_some());
        assert!(s.get(&ObjectKey::cluster("global")).is_some());
        // only the all-namespaces key is stored for cluster-scoped objects
        let all = s.list(&ListOptions::default().fields(FieldSelector::one_term_equal("spec.color", "red"))).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(s.read().index_values("field:spec.color"), vec!["__all_namespaces/red".to_string()]);
    }

    #[test]
    fn list_precedence_and_filters() {
        let s = store();
        let mut w1 = widget("w1", "ops", "red");
        w1.metadata.labels = Some([("tier".to_string(), "web".to_string())].into_iter().collect());
        s.apply(WatchEvent::Applied(w1));
        s.apply(WatchEvent::Applied(widget("w2", "ops", "blue")));
        s.apply(WatchEvent::Applied(widget("w3", "dev", "red")));

        assert_eq!(s.list(&ListOptions::default()).unwrap().len(), 3);
        assert_eq!(s.list(&ListOptions::default().within("ops")).unwrap().len(), 2);

        let red = ListOptions::default().fields("spec.color==red".parse().unwrap());
        assert_eq!(s.list(&red).unwrap().len(), 2);
        let red_ops = red.clone().within("ops");
        let names: Vec<_> = s.list(&red_ops).unwrap().into_iter().filter_map(|o| o.metadata.name).collect();
        assert_eq!(names, vec!["w1".to_string()]);

        let web: LabelSelector = "tier=web".parse().unwrap();
        assert_eq!(s.list(&ListOptions::default().labels(web.clone())).unwrap().len(), 1);
        assert_eq!(s.list(&ListOptions::default().within("dev").labels(web)).unwrap().len(), 0);

        for listed in s.list(&ListOptions::default()).unwrap() {
            assert_eq!(listed.types.as_ref().map(|t| t.kind.as_str()), Some("Widget"));
        }
    }

    #[test]
    fn unsupported_field_selectors_fail() {
        let s = store();
        s.apply(WatchEvent::Applied(widget("w1", "ops", "red")));
        for sel in ["spec.color!=red", "spec.color=red,metadata.name=w1"] {
            let opts = ListOptions::default().fields(sel.parse().unwrap());
            assert!(matches!(s.list(&opts), Err(CacheError::UnsupportedSelector(_))), "{}", sel);
        }
        let missing = ListOptions::default().fields("spec.size=xl".parse().unwrap());
        assert!(matches!(s.list(&missing), Err(CacheError::MissingIndex(_))));
    }

    #[test]
    fn restart_replaces_and_marks_synced() {
        let s = store();
        assert!(!s.has_synced());
        s.apply(WatchEvent::Applied(widget("stale", "ops", "red")));
        s.apply(WatchEvent::Restarted(vec![widget("w1", "ops", "red"), widget("w2", "dev", "blue")]));
        assert!(s.has_synced());
        assert_eq!(s.len(), 2);
        assert!(s.get_by_key("ops/stale").is_none());
        let red = ListOptions::default().fields(FieldSelector::one_term_equal("spec.color", "red"));
        assert_eq!(s.list(&red).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let s = store();
        let mut rx = s.subscribe();
        s.apply(WatchEvent::Applied(widget("w1", "ops", "red")));
        s.apply(WatchEvent::Applied(widget("w1", "ops", "blue")));
        s.apply(WatchEvent::Deleted(widget("w1", "ops", "blue")));
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::Added(_)));
        match rx.recv().await.unwrap() {
            StoreEvent::Updated { old, new } => {
                assert_eq!(old.data["spec"]["color"], "red");
                assert_eq!(new.data["spec"]["color"], "blue");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::Deleted(_)));
    }

    #[test]
    fn deleting_unknown_key_is_silent() {
        let s = store();
        let mut rx = s.subscribe();
        s.apply(WatchEvent::Deleted(widget("ghost", "ops", "red")));
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn index_added_after_insert_covers_both_key_shapes() {
        let s = WatchStore::new(gvk(), 16);
        s.apply(WatchEvent::Applied(widget("w1", "ops", "red")));
        s.index_field("spec.color", field_extractor("spec.color")).unwrap();

        let red = ListOptions::default().fields("spec.color=red".parse().unwrap());
        let red_ops = red.clone().within("ops");
        let names = |opts: &ListOptions| -> Vec<String> {
            s.list(opts).unwrap().into_iter().filter_map(|o| o.metadata.name).collect()
        };
        assert_eq!(names(&red_ops), vec!["w1".to_string()]);
        assert_eq!(names(&red), vec!["w1".to_string()]);

        s.apply(WatchEvent::Deleted(widget("w1", "ops", "red")));
        assert!(names(&red_ops).is_empty());
        assert!(names(&red).is_empty());
        assert!(s.read().index_values("field:spec.color").is_empty());
    }

    #[tokio::test]
    async fn wait_synced_honours_cancellation() {
        let s = store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!s.wait_synced(&cancel).await);
        s.apply(WatchEvent::Restarted(Vec::new()));
        // cancellation wins even once synced
        assert!(!s.wait_synced(&cancel).await);
        assert!(s.wait_synced(&CancellationToken::new()).await);
    }
}
