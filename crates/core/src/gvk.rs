//! Resource kind identifiers and their `List` variants.

use kube::Resource;

use crate::{CacheError, CacheResult};

pub use kube::core::GroupVersionKind as Gvk;

const LIST_SUFFIX: &str = "List";

/// The list identifier paired with a kind: same group/version, kind + `List`.
pub fn list_gvk(gvk: &Gvk) -> Gvk {
    Gvk { group: gvk.group.clone(), version: gvk.version.clone(), kind: format!("{}{}", gvk.kind, LIST_SUFFIX) }
}

pub fn is_list(gvk: &Gvk) -> bool {
    gvk.kind.len() > LIST_SUFFIX.len() && gvk.kind.ends_with(LIST_SUFFIX)
}

/// Inverse of [`list_gvk`]. Identifiers without the suffix come back unchanged.
pub fn item_gvk(list: &Gvk) -> Gvk {
    let kind = if is_list(list) { &list.kind[..list.kind.len() - LIST_SUFFIX.len()] } else { list.kind.as_str() };
    Gvk { group: list.group.clone(), version: list.version.clone(), kind: kind.to_string() }
}

pub fn api_version(gvk: &Gvk) -> String {
    if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) }
}

/// `group/version/Kind`, or `version/Kind` for the core group.
pub fn gvk_key(gvk: &Gvk) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> CacheResult<Gvk> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(Gvk { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(Gvk { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(CacheError::UnknownKind(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

/// Kind identifier of a statically typed resource.
pub fn gvk_of<K: Resource<DynamicType = ()>>() -> Gvk {
    Gvk { group: K::group(&()).into_owned(), version: K::version(&()).into_owned(), kind: K::kind(&()).into_owned() }
}
