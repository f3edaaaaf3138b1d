//! Seams between the cache and the API server.

use std::sync::Arc;

use futures::stream::BoxStream;
use kube::core::DynamicObject;

use crate::{CacheResult, Gvk, LabelSelector, ObjectKey};

/// One change observed by a list+watch subscription.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// A full listing; replaces everything previously seen.
    Restarted(Vec<DynamicObject>),
}

pub type EventStream = BoxStream<'static, CacheResult<WatchEvent>>;

/// Produces a fresh list+watch subscription each time it is called.
pub trait WatchSource: Send + Sync {
    fn watch(&self) -> EventStream;
}

/// Narrow per-kind client used to refill a single object on a cache miss.
#[async_trait::async_trait]
pub trait RemoteFetch: Send + Sync {
    /// `CacheError::NotFound` when the API server reports 404.
    async fn fetch(&self, key: &ObjectKey) -> CacheResult<DynamicObject>;
}

/// Builds per-kind sources and fetchers from one connection configuration.
pub trait Connector: Send + Sync {
    /// Whether objects of this kind live in namespaces. Fails with
    /// `UnknownKind` when the kind cannot be resolved.
    fn namespaced(&self, gvk: &Gvk) -> CacheResult<bool>;

    fn watch_source(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        labels: Option<&LabelSelector>,
    ) -> CacheResult<Arc<dyn WatchSource>>;

    fn fetcher(&self, gvk: &Gvk) -> CacheResult<Arc<dyn RemoteFetch>>;
}
