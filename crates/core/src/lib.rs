//! kcache core types: kind identifiers, the key scheme, selectors and the
//! seams (watch sources, remote fetchers, connectors) the store and facade
//! crates are built against.

#![forbid(unsafe_code)]

mod error;
mod gvk;
mod keys;
mod object;
mod options;
mod selector;
mod source;

pub use error::{CacheError, CacheResult};
pub use gvk::{api_version, gvk_key, gvk_of, is_list, item_gvk, list_gvk, parse_gvk_key, Gvk};
pub use keys::{
    field_index_name, meta_key, namespaced_index_key, object_key, ObjectKey, ALL_NAMESPACES,
    FIELD_INDEX_PREFIX, NAMESPACE_INDEX,
};
pub use object::{copy_as, field_extractor, namespace_of, stamp_kind, CacheObject, Extractor};
pub use options::{CacheOptions, ListOptions};
pub use selector::{FieldRequirement, FieldSelector, LabelSelector, Operator, Requirement};
pub use source::{Connector, EventStream, RemoteFetch, WatchEvent, WatchSource};

pub use kube::core::DynamicObject;
