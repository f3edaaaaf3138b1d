#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kcache_core::{
    gvk_key, CacheError, CacheResult, Connector, DynamicObject, Gvk, LabelSelector, ObjectKey, RemoteFetch, WatchSource,
};
use kcache_store::{ChannelFeed, ChannelSource};
use kube::core::ApiResource;
use rustc_hash::FxHashMap;

pub fn widget_gvk() -> Gvk {
    Gvk { group: "example.io".into(), version: "v1".into(), kind: "Widget".into() }
}

pub fn gadget_gvk() -> Gvk {
    Gvk { group: "example.io".into(), version: "v1".into(), kind: "Gadget".into() }
}

pub fn widget(name: &str, ns: &str, color: &str) -> DynamicObject {
    object(&widget_gvk(), name, ns, color)
}

pub fn object(gvk: &Gvk, name: &str, ns: &str, color: &str) -> DynamicObject {
    let mut o = DynamicObject::new(name, &ApiResource::from_gvk(gvk)).data(serde_json::json!({ "spec": { "color": color } }));
    if !ns.is_empty() {
        o = o.within(ns);
    }
    o
}

/// What the remote side answers for one key.
#[derive(Clone)]
pub enum Scripted {
    Found(DynamicObject),
    Fail(String),
}

/// In-memory connector: every watch source is a channel the test feeds,
/// every fetch is answered from a script.
#[derive(Default)]
pub struct FakeConnector {
    namespaced: FxHashMap<Gvk, bool>,
    feeds: Mutex<FxHashMap<(Gvk, Option<String>), ChannelFeed>>,
    pub watches: Mutex<Vec<(String, Option<String>, Option<String>)>>,
    script: Arc<Mutex<FxHashMap<(String, String), Scripted>>>,
    pub fetches: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(kinds: &[(Gvk, bool)]) -> Self {
        Self { namespaced: kinds.iter().cloned().collect(), ..Default::default() }
    }

    pub fn feed(&self, gvk: &Gvk, ns: Option<&str>) -> ChannelFeed {
        self.feeds
            .lock()
            .unwrap()
            .get(&(gvk.clone(), ns.map(str::to_string)))
            .cloned()
            .unwrap_or_else(|| panic!("no watch for {} in {:?}", gvk_key(gvk), ns))
    }

    pub fn script(&self, gvk: &Gvk, key: &ObjectKey, answer: Scripted) {
        self.script.lock().unwrap().insert((gvk_key(gvk), key.store_key()), answer);
    }
}

impl Connector for FakeConnector {
    fn namespaced(&self, gvk: &Gvk) -> CacheResult<bool> {
        self.namespaced.get(gvk).copied().ok_or_else(|| CacheError::UnknownKind(gvk_key(gvk)))
    }

    fn watch_source(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        labels: Option<&LabelSelector>,
    ) -> CacheResult<Arc<dyn WatchSource>> {
        self.namespaced(gvk)?;
        let (source, feed) = ChannelSource::new();
        self.feeds.lock().unwrap().insert((gvk.clone(), namespace.map(str::to_string)), feed);
        self.watches.lock().unwrap().push((
            gvk_key(gvk),
            namespace.map(str::to_string),
            labels.map(|l| l.to_string()),
        ));
        Ok(source)
    }

    fn fetcher(&self, gvk: &Gvk) -> CacheResult<Arc<dyn RemoteFetch>> {
        self.namespaced(gvk)?;
        Ok(Arc::new(ScriptedFetcher {
            gvk: gvk_key(gvk),
            script: self.script.clone(),
            calls: self.fetches.clone(),
        }))
    }
}

pub struct ScriptedFetcher {
    gvk: String,
    script: Arc<Mutex<FxHashMap<(String, String), Scripted>>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl RemoteFetch for ScriptedFetcher {
    async fn fetch(&self, key: &ObjectKey) -> CacheResult<DynamicObject> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.script.lock().unwrap().get(&(self.gvk.clone(), key.store_key())).cloned();
        match answer {
            Some(Scripted::Found(obj)) => Ok(obj),
            Some(Scripted::Fail(msg)) => Err(CacheError::Remote(msg)),
            None => Err(CacheError::not_found(self.gvk.clone(), key)),
        }
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
