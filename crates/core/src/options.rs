use std::time::Duration;

use crate::{FieldSelector, LabelSelector};

/// Runtime options shared by every watch-backed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Restrict dedicated watches to one namespace (None = all namespaces).
    pub namespace: Option<String>,
    /// Tear down and re-list every watch at this interval (None = never).
    pub resync: Option<Duration>,
    /// Capacity of each store's change broadcast channel.
    pub event_buffer: usize,
    /// Delay before re-establishing a watch stream that ended.
    pub watch_backoff: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { namespace: None, resync: None, event_buffer: 1024, watch_backoff: Duration::from_secs(1) }
    }
}

impl CacheOptions {
    /// Read `KCACHE_NAMESPACE`, `KCACHE_RESYNC_SECS`, `KCACHE_EVENT_BUFFER` and
    /// `KCACHE_WATCH_BACKOFF_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let namespace = std::env::var("KCACHE_NAMESPACE").ok().filter(|s| !s.is_empty());
        let resync = std::env::var("KCACHE_RESYNC_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        let event_buffer = std::env::var("KCACHE_EVENT_BUFFER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(d.event_buffer);
        let watch_backoff = std::env::var("KCACHE_WATCH_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.watch_backoff);
        Self { namespace, resync, event_buffer, watch_backoff }
    }
}

/// Restrictions for a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
}

impl ListOptions {
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn labels(mut self, selector: LabelSelector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    pub fn fields(mut self, selector: FieldSelector) -> Self {
        self.field_selector = Some(selector);
        self
    }

    /// The namespace restriction, if any (empty counts as none).
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}
