//! Snapshot table plus secondary indices, kept consistent on every write.

use kcache_core::{CacheError, CacheResult, DynamicObject, Extractor};
use rustc_hash::{FxHashMap, FxHashSet};

type Index = FxHashMap<String, FxHashSet<String>>;

/// Objects keyed by `namespace/name`, with named indices mapping index
/// values to object keys.
#[derive(Default)]
pub struct Indexer {
    items: FxHashMap<String, DynamicObject>,
    indexers: FxHashMap<String, Extractor>,
    indices: FxHashMap<String, Index>,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Register an index and build it over the objects already present.
    pub fn add_indexer(&mut self, name: &str, f: Extractor) -> CacheResult<()> {
        if self.indexers.contains_key(name) {
            return Err(CacheError::IndexConflict(name.to_string()));
        }
        let mut index = Index::default();
        for (key, obj) in self.items.iter() {
            for v in f(obj) {
                index.entry(v).or_default().insert(key.clone());
            }
        }
        self.indices.insert(name.to_string(), index);
        self.indexers.insert(name.to_string(), f);
        Ok(())
    }

    pub fn has_indexer(&self, name: &str) -> bool {
        self.indexers.contains_key(name)
    }

    /// Insert or replace; returns the previous object under `key`.
    pub fn upsert(&mut self, key: &str, obj: DynamicObject) -> Option<DynamicObject> {
        let old = self.items.insert(key.to_string(), obj);
        let Self { items, indexers, indices } = self;
        update_indices(indexers, indices, key, old.as_ref(), items.get(key));
        old
    }

    pub fn remove(&mut self, key: &str) -> Option<DynamicObject> {
        let old = self.items.remove(key)?;
        let Self { indexers, indices, .. } = self;
        update_indices(indexers, indices, key, Some(&old), None);
        Some(old)
    }

    /// Swap in a complete listing and rebuild every index. Returns the
    /// previous table.
    pub fn replace(&mut self, fresh: FxHashMap<String, DynamicObject>) -> FxHashMap<String, DynamicObject> {
        let previous = std::mem::replace(&mut self.items, fresh);
        for (name, f) in self.indexers.iter() {
            let mut index = Index::default();
            for (key, obj) in self.items.iter() {
                for v in f(obj) {
                    index.entry(v).or_default().insert(key.clone());
                }
            }
            self.indices.insert(name.clone(), index);
        }
        previous
    }

    pub fn get(&self, key: &str) -> Option<&DynamicObject> {
        self.items.get(key)
    }

    pub fn list(&self) -> impl Iterator<Item = &DynamicObject> {
        self.items.values()
    }

    /// Objects whose index `name` contains `value`.
    pub fn by_index(&self, name: &str, value: &str) -> CacheResult<Vec<&DynamicObject>> {
        let index = self.indices.get(name).ok_or_else(|| CacheError::MissingIndex(name.to_string()))?;
        Ok(index
            .get(value)
            .map(|keys| keys.iter().filter_map(|k| self.items.get(k)).collect())
            .unwrap_or_default())
    }

    /// Values currently present in index `name` (empty buckets are pruned).
    pub fn index_values(&self, name: &str) -> Vec<String> {
        self.indices.get(name).map(|i| i.keys().cloned().collect()).unwrap_or_default()
    }
}

fn update_indices(
    indexers: &FxHashMap<String, Extractor>,
    indices: &mut FxHashMap<String, Index>,
    key: &str,
    old: Option<&DynamicObject>,
    new: Option<&DynamicObject>,
) {
    for (name, f) in indexers.iter() {
        let index = indices.entry(name.clone()).or_default();
        if let Some(o) = old {
            for v in f(o) {
                if let Some(keys) = index.get_mut(&v) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&v);
                    }
                }
            }
        }
        if let Some(n) = new {
            for v in f(n) {
                index.entry(v).or_default().insert(key.to_string());
            }
        }
    }
}
