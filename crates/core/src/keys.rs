//! Key scheme shared by the snapshot table and every index.

use std::fmt;

use kube::core::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Partition name used for index keys that must match across namespaces.
pub const ALL_NAMESPACES: &str = "__all_namespaces";

/// Name of the built-in namespace index every store carries.
pub const NAMESPACE_INDEX: &str = "namespace";

pub const FIELD_INDEX_PREFIX: &str = "field:";

/// Address of a single object. An empty namespace means cluster-scoped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// Snapshot-table key for this address.
    pub fn store_key(&self) -> String {
        object_key(self.namespace().unwrap_or(""), &self.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.store_key())
    }
}

/// `name` for cluster-scoped objects, `namespace/name` otherwise.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

pub fn meta_key(meta: &ObjectMeta) -> String {
    object_key(meta.namespace.as_deref().unwrap_or(""), meta.name.as_deref().unwrap_or(""))
}

pub fn field_index_name(field: &str) -> String {
    format!("{}{}", FIELD_INDEX_PREFIX, field)
}

/// Prefix an index value with its namespace, or with [`ALL_NAMESPACES`] when
/// the namespace is empty.
pub fn namespaced_index_key(namespace: &str, value: &str) -> String {
    if namespace.is_empty() {
        format!("{}/{}", ALL_NAMESPACES, value)
    } else {
        format!("{}/{}", namespace, value)
    }
}
