//! In-process watch source driven through a channel. Used by tests and by
//! callers that feed a store from something other than the API server.

use std::sync::Arc;

use futures::stream;
use kcache_core::{CacheError, DynamicObject, EventStream, WatchEvent, WatchSource};
use tokio::sync::{mpsc, Mutex};

/// Watch source whose events come from a [`ChannelFeed`].
///
/// Every call to `watch` reads from the same underlying channel, so the feed
/// survives a resync or a restarted stream.
pub struct ChannelSource {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<WatchEvent>>>,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelFeed {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl ChannelSource {
    pub fn new() -> (Arc<Self>, ChannelFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { rx: Arc::new(Mutex::new(rx)) }), ChannelFeed { tx })
    }
}

impl WatchSource for ChannelSource {
    fn watch(&self) -> EventStream {
        let rx = self.rx.clone();
        Box::pin(stream::unfold(rx, |rx| async move {
            let next = rx.lock().await.recv().await;
            next.map(|ev| (Ok(ev), rx))
        }))
    }
}

impl ChannelFeed {
    pub fn send(&self, event: WatchEvent) -> Result<(), CacheError> {
        self.tx.send(event).map_err(|_| CacheError::Remote("channel source closed".into()))
    }

    pub fn applied(&self, obj: DynamicObject) -> Result<(), CacheError> {
        self.send(WatchEvent::Applied(obj))
    }

    pub fn deleted(&self, obj: DynamicObject) -> Result<(), CacheError> {
        self.send(WatchEvent::Deleted(obj))
    }

    pub fn restarted(&self, objs: Vec<DynamicObject>) -> Result<(), CacheError> {
        self.send(WatchEvent::Restarted(objs))
    }
}
