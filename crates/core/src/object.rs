//! Typed copies out of the cache, kind stamping and field extraction.

use std::sync::Arc;

use kube::core::{DynamicObject, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{api_version, CacheError, CacheResult, Gvk};

/// Extracts zero or more index values from an object.
pub type Extractor = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;

/// A type readers can receive from the cache.
///
/// The cache holds objects in their dynamic form; reads hand out an
/// independent, kind-stamped copy decoded into the caller's type. Cache hits
/// and remote refills go through the same conversion.
pub trait CacheObject: Sized + Send + 'static {
    fn from_cached(obj: DynamicObject) -> CacheResult<Self>;
}

impl<K> CacheObject for K
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Send + 'static,
{
    fn from_cached(obj: DynamicObject) -> CacheResult<Self> {
        let raw = serde_json::to_value(&obj)?;
        serde_json::from_value(raw).map_err(|e| CacheError::Decode(format!("{}: {}", K::kind(&()), e)))
    }
}

/// Set `apiVersion`/`kind` on an object.
pub fn stamp_kind(obj: &mut DynamicObject, gvk: &Gvk) {
    obj.types = Some(TypeMeta { api_version: api_version(gvk), kind: gvk.kind.clone() });
}

/// Deep copy of `obj` stamped with `gvk`.
pub fn copy_as(obj: &DynamicObject, gvk: &Gvk) -> DynamicObject {
    let mut out = obj.clone();
    stamp_kind(&mut out, gvk);
    out
}

pub fn namespace_of(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or("")
}

/// Build an extractor for a dotted field path such as `spec.color`.
///
/// `metadata.name`, `metadata.namespace`, `metadata.labels.<key>` and
/// `metadata.annotations.<key>` read object metadata directly (label keys may
/// contain dots and slashes); other paths walk the object body. Strings,
/// numbers and booleans render as-is, arrays yield one value per scalar
/// element, anything else yields nothing.
pub fn field_extractor(path: &str) -> Extractor {
    let path = path.trim_start_matches('.').to_string();
    Arc::new(move |obj: &DynamicObject| {
        let meta = &obj.metadata;
        if path == "metadata.name" {
            return meta.name.iter().cloned().collect();
        }
        if path == "metadata.namespace" {
            return meta.namespace.iter().cloned().collect();
        }
        if let Some(key) = path.strip_prefix("metadata.labels.") {
            return meta.labels.as_ref().and_then(|l| l.get(key)).cloned().into_iter().collect();
        }
        if let Some(key) = path.strip_prefix("metadata.annotations.") {
            return meta.annotations.as_ref().and_then(|a| a.get(key)).cloned().into_iter().collect();
        }
        let mut out = Vec::new();
        if let Some(rest) = path.strip_prefix("metadata.") {
            if let Ok(m) = serde_json::to_value(meta) {
                if let Some(v) = m.pointer(&to_pointer(rest)) {
                    render(v, &mut out);
                }
            }
        } else if let Some(v) = obj.data.pointer(&to_pointer(&path)) {
            render(v, &mut out);
        }
        out
    })
}

fn to_pointer(path: &str) -> String {
    let mut p = String::with_capacity(path.len() + 1);
    for seg in path.split('.') {
        p.push('/');
        p.push_str(&seg.replace('~', "~0").replace('/', "~1"));
    }
    p
}

fn render(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => {
            for item in items {
                if !item.is_array() {
                    render(item, out);
                }
            }
        }
        Value::Null | Value::Object(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ApiResource;

    fn widget_gvk() -> Gvk {
        Gvk { group: "example.io".into(), version: "v1".into(), kind: "Widget".into() }
    }

    fn widget(name: &str, ns: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&widget_gvk());
        DynamicObject::new(name, &ar).within(ns).data(serde_json::json!({
            "spec": { "color": "red", "sizes": [1, 2], "nested": { "a": 1 }, "enabled": true }
        }))
    }

    #[test]
    fn stamping_sets_type_meta() {
        let mut w = widget("w1", "ops");
        w.types = None;
        let copy = copy_as(&w, &widget_gvk());
        let tm = copy.types.expect("stamped");
        assert_eq!(tm.api_version, "example.io/v1");
        assert_eq!(tm.kind, "Widget");
        assert!(w.types.is_none(), "source object is left untouched");
    }

    #[test]
    fn extractor_walks_body_and_metadata() {
        let mut w = widget("w1", "ops");
        w.metadata.labels = Some([("app.kubernetes.io/name".to_string(), "kcache".to_string())].into_iter().collect());
        assert_eq!(field_extractor("spec.color")(&w), vec!["red"]);
        assert_eq!(field_extractor(".spec.sizes")(&w), vec!["1", "2"]);
        assert_eq!(field_extractor("spec.enabled")(&w), vec!["true"]);
        assert!(field_extractor("spec.nested")(&w).is_empty());
        assert!(field_extractor("spec.missing")(&w).is_empty());
        assert_eq!(field_extractor("metadata.name")(&w), vec!["w1"]);
        assert_eq!(field_extractor("metadata.namespace")(&w), vec!["ops"]);
        assert_eq!(field_extractor("metadata.labels.app.kubernetes.io/name")(&w), vec!["kcache"]);
    }

    #[test]
    fn typed_decode_from_dynamic() {
        let ar = ApiResource::erase::<ConfigMap>(&());
        let dynamic = DynamicObject::new("settings", &ar)
            .within("ops")
            .data(serde_json::json!({ "data": { "color": "blue" } }));
        let cm = ConfigMap::from_cached(dynamic).unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("settings"));
        assert_eq!(cm.data.unwrap().get("color").map(String::as_str), Some("blue"));
    }
}
