//! kcache kubehub: kube-rs wiring for watch sources and single-object fetches.

#![forbid(unsafe_code)]

mod scheme;

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kcache_core::{
    gvk_key, CacheError, CacheResult, Connector, DynamicObject, EventStream, Gvk, LabelSelector, ObjectKey, RemoteFetch,
    WatchEvent, WatchSource,
};
use kube::{
    api::Api,
    core::ApiResource,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use tracing::{debug, info};

pub use scheme::Scheme;

fn strip_managed_fields(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj
}

fn scoped_api(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// List+watch subscription for one kind, restarted by the store on resync.
pub struct KubeSource {
    api: Api<DynamicObject>,
    config: watcher::Config,
    gvk: String,
}

impl KubeSource {
    pub fn new(api: Api<DynamicObject>, gvk: &Gvk, labels: Option<&LabelSelector>) -> Self {
        let mut config = watcher::Config::default();
        if let Some(sel) = labels.filter(|s| !s.is_empty()) {
            config = config.labels(&sel.to_string());
        }
        Self { api, config, gvk: gvk_key(gvk) }
    }
}

impl WatchSource for KubeSource {
    fn watch(&self) -> EventStream {
        info!(gvk = %self.gvk, labels = ?self.config.label_selector, "watcher started");
        let gvk = self.gvk.clone();
        watcher::watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .map(move |ev| match ev {
                Ok(Event::Applied(o)) => Ok(WatchEvent::Applied(strip_managed_fields(o))),
                Ok(Event::Deleted(o)) => Ok(WatchEvent::Deleted(strip_managed_fields(o))),
                Ok(Event::Restarted(list)) => {
                    debug!(gvk = %gvk, count = list.len(), "watch restart");
                    Ok(WatchEvent::Restarted(list.into_iter().map(strip_managed_fields).collect()))
                }
                Err(e) => Err(CacheError::Remote(format!("watch {}: {}", gvk, e))),
            })
            .boxed()
    }
}

/// Single-object GET for one kind, used to refill cache misses.
pub struct KubeFetcher {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
    gvk: String,
}

impl KubeFetcher {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        let gvk = format!("{}/{}", ar.api_version, ar.kind);
        Self { client, ar, namespaced, gvk }
    }
}

/// 404 means confirmed absence; everything else is a retrievable failure.
pub fn fetch_error(resource: &str, key: &ObjectKey, err: kube::Error) -> CacheError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => CacheError::not_found(resource, &key.to_string()),
        other => CacheError::Remote(format!("get {} {}: {}", resource, key, other)),
    }
}

#[async_trait::async_trait]
impl RemoteFetch for KubeFetcher {
    async fn fetch(&self, key: &ObjectKey) -> CacheResult<DynamicObject> {
        let started = Instant::now();
        let api = scoped_api(self.client.clone(), &self.ar, self.namespaced, key.namespace());
        let res = api.get(&key.name).await;
        debug!(gvk = %self.gvk, key = %key, ok = res.is_ok(), took_ms = %started.elapsed().as_millis(), "remote fetch");
        res.map(strip_managed_fields).map_err(|e| fetch_error(&self.ar.plural, key, e))
    }
}

/// Builds kube-backed sources and fetchers from one client and a [`Scheme`].
#[derive(Clone)]
pub struct KubeConnector {
    client: Client,
    scheme: Arc<Scheme>,
}

impl KubeConnector {
    /// Construct the HTTP client for `config`. No request is sent.
    pub fn new(config: Config, scheme: Arc<Scheme>) -> CacheResult<Self> {
        let client = Client::try_from(config).map_err(|e| CacheError::Construction(format!("kube client: {}", e)))?;
        Ok(Self { client, scheme })
    }

    pub fn from_client(client: Client, scheme: Arc<Scheme>) -> Self {
        Self { client, scheme }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }
}

impl Connector for KubeConnector {
    fn namespaced(&self, gvk: &Gvk) -> CacheResult<bool> {
        Ok(self.scheme.resolve(gvk)?.1)
    }

    fn watch_source(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        labels: Option<&LabelSelector>,
    ) -> CacheResult<Arc<dyn WatchSource>> {
        let (ar, namespaced) = self.scheme.resolve(gvk)?;
        let api = scoped_api(self.client.clone(), ar, namespaced, namespace);
        debug!(gvk = %gvk_key(gvk), ns = ?namespace.filter(|_| namespaced), "watch source built");
        Ok(Arc::new(KubeSource::new(api, gvk, labels)))
    }

    fn fetcher(&self, gvk: &Gvk) -> CacheResult<Arc<dyn RemoteFetch>> {
        let (ar, namespaced) = self.scheme.resolve(gvk)?;
        Ok(Arc::new(KubeFetcher::new(self.client.clone(), ar.clone(), namespaced)))
    }
}
