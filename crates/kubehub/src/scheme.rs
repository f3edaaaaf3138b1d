//! Mapping from Rust types and kind identifiers to API resources.

use std::any::{type_name, TypeId};

use anyhow::{Context, Result};
use k8s_openapi::NamespaceResourceScope;
use kcache_core::{gvk_key, gvk_of, CacheError, CacheResult, Gvk};
use kube::{
    core::ApiResource,
    discovery::{Discovery, Scope},
    Client, Resource,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

/// Known kinds: their `ApiResource`, whether they are namespaced, and the
/// Rust types registered for them.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    by_gvk: FxHashMap<Gvk, (ApiResource, bool)>,
    by_type: FxHashMap<TypeId, Gvk>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically typed resource. Scope comes from the type.
    pub fn register<K>(&mut self) -> &mut Self
    where
        K: Resource<DynamicType = ()> + 'static,
        K::Scope: 'static,
    {
        let gvk = gvk_of::<K>();
        let namespaced = TypeId::of::<K::Scope>() == TypeId::of::<NamespaceResourceScope>();
        self.by_gvk.insert(gvk.clone(), (ApiResource::erase::<K>(&()), namespaced));
        self.by_type.insert(TypeId::of::<K>(), gvk);
        self
    }

    /// Register a kind known only by identifier, e.g. a CRD without Rust types.
    pub fn add_dynamic(&mut self, gvk: &Gvk, plural: &str, namespaced: bool) -> &mut Self {
        let ar = ApiResource::from_gvk_with_plural(gvk, plural);
        self.by_gvk.insert(gvk.clone(), (ar, namespaced));
        self
    }

    /// Resolve the requested kinds the scheme does not know yet via API
    /// discovery. Kinds the server does not serve are logged and left out.
    pub async fn discover_into(&mut self, client: Client, kinds: &[Gvk]) -> Result<()> {
        let missing: Vec<&Gvk> = kinds.iter().filter(|g| !self.by_gvk.contains_key(*g)).collect();
        if missing.is_empty() {
            return Ok(());
        }
        let started = std::time::Instant::now();
        let discovery = Discovery::new(client).run().await.context("running API discovery")?;
        let mut found = 0usize;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let gvk = Gvk { group: ar.group.clone(), version: ar.version.clone(), kind: ar.kind.clone() };
                if missing.contains(&&gvk) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(gvk = %gvk_key(&gvk), namespaced, "discovered");
                    self.by_gvk.insert(gvk, (ar.clone(), namespaced));
                    found += 1;
                }
            }
        }
        for gvk in missing.iter().filter(|g| !self.by_gvk.contains_key(**g)) {
            warn!(gvk = %gvk_key(gvk), "kind not served by the API server");
        }
        info!(requested = missing.len(), found, took_ms = %started.elapsed().as_millis(), "discovery complete");
        Ok(())
    }

    pub fn contains(&self, gvk: &Gvk) -> bool {
        self.by_gvk.contains_key(gvk)
    }

    /// `ApiResource` and namespaced flag for a kind, or `UnknownKind`.
    pub fn resolve(&self, gvk: &Gvk) -> CacheResult<(&ApiResource, bool)> {
        self.by_gvk
            .get(gvk)
            .map(|(ar, ns)| (ar, *ns))
            .ok_or_else(|| CacheError::UnknownKind(gvk_key(gvk)))
    }

    /// Kind identifier registered for Rust type `K`, or `UnknownType`.
    pub fn gvk_for<K: 'static>(&self) -> CacheResult<Gvk> {
        self.by_type.get(&TypeId::of::<K>()).cloned().ok_or_else(|| CacheError::UnknownType(type_name::<K>().to_string()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Gvk> {
        self.by_gvk.keys()
    }
}
