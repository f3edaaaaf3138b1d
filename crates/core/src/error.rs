use serde::{Deserialize, Serialize};

/// Errors surfaced by every cache read path.
///
/// `NotFound` and `UnsupportedSelector` are local conditions returned to the
/// immediate caller; `Remote` is retrievable; `Construction`, `UnknownType`
/// and `UnknownKind` abort whatever operation triggered them.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum CacheError {
    #[error("not_found: {resource} \"{key}\"")]
    NotFound { resource: String, key: String },
    #[error("unsupported_selector: {0}")]
    UnsupportedSelector(String),
    #[error("invalid_selector: {0}")]
    InvalidSelector(String),
    #[error("unknown_type: {0} is not registered in the scheme")]
    UnknownType(String),
    #[error("unknown_kind: {0}")]
    UnknownKind(String),
    #[error("missing_index: index {0} does not exist")]
    MissingIndex(String),
    #[error("index_conflict: index {0} already registered")]
    IndexConflict(String),
    #[error("remote: {0}")]
    Remote(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("construction: {0}")]
    Construction(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    pub fn not_found(resource: impl Into<String>, key: impl std::fmt::Display) -> Self {
        CacheError::NotFound { resource: resource.into(), key: key.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Decode(e.to_string())
    }
}
