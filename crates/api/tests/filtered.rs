#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, gadget_gvk, object, widget, widget_gvk, FakeConnector};
use kcache_api::{FallbackCache, FilteredCache, StoreEvent};
use kcache_core::{field_extractor, list_gvk, CacheOptions, Gvk, LabelSelector, ListOptions, ObjectKey, WatchEvent};
use tokio_util::sync::CancellationToken;

fn node_gvk() -> Gvk {
    Gvk { group: "example.io".into(), version: "v1".into(), kind: "Rack".into() }
}

fn setup(namespaces: &[&str]) -> (Arc<FakeConnector>, Arc<FilteredCache>) {
    let conn = Arc::new(FakeConnector::new(&[(widget_gvk(), true), (gadget_gvk(), true), (node_gvk(), false)]));
    let selector: LabelSelector = "team=storage".parse().unwrap();
    let cache = FilteredCache::new(conn.clone(), CacheOptions::default())
        .with_selector(widget_gvk(), selector)
        .with_namespaces(namespaces.iter().copied());
    (conn, Arc::new(cache))
}

#[tokio::test]
async fn kinds_are_watched_lazily_with_their_selector() {
    let (conn, cache) = setup(&[]);
    assert!(conn.watches.lock().unwrap().is_empty());

    cache.list(&list_gvk(&widget_gvk()), &ListOptions::default()).await.unwrap();
    cache.list(&gadget_gvk(), &ListOptions::default()).await.unwrap();
    cache.list(&widget_gvk(), &ListOptions::default()).await.unwrap();

    let watches = conn.watches.lock().unwrap().clone();
    assert_eq!(
        watches,
        vec![
            ("example.io/v1/Widget".to_string(), None, Some("team=storage".to_string())),
            ("example.io/v1/Gadget".to_string(), None, None),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_namespace_stores_serve_only_watched_namespaces() {
    let (conn, cache) = setup(&["ops", "dev", ""]);
    let cancel = CancellationToken::new();
    {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.start(cancel).await });
    }
    // lazily created after start: the read waits for both namespace stores
    let pending = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&widget_gvk(), &ObjectKey::namespaced("ops", "w1")).await })
    };
    eventually(|| conn.watches.lock().unwrap().len() == 2).await;
    conn.feed(&widget_gvk(), Some("ops")).restarted(vec![widget("w1", "ops", "red")]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished(), "dev store has not synced yet");
    conn.feed(&widget_gvk(), Some("dev")).restarted(vec![widget("w2", "dev", "red")]).unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap().unwrap();
    assert_eq!(got.metadata.name.as_deref(), Some("w1"));

    let err = cache.get(&widget_gvk(), &ObjectKey::namespaced("prod", "w1")).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(cache.list(&widget_gvk(), &ListOptions::default()).await.unwrap().len(), 2);
    assert_eq!(cache.list(&widget_gvk(), &ListOptions::default().within("dev")).await.unwrap().len(), 1);
    assert!(cache.list(&widget_gvk(), &ListOptions::default().within("prod")).await.unwrap().is_empty());
    assert!(cache.wait_for_sync(&cancel).await);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_reads_wait_for_a_lazily_created_informer() {
    let (conn, cache) = setup(&[]);
    let cancel = CancellationToken::new();
    {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.start(cancel).await });
    }
    let key = ObjectKey::namespaced("ops", "w1");
    let first = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.get(&widget_gvk(), &key).await })
    };
    eventually(|| conn.watches.lock().unwrap().len() == 1).await;
    // the informer is registered but not synced yet
    let second = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.get(&widget_gvk(), &key).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!second.is_finished());

    conn.feed(&widget_gvk(), None).restarted(vec![widget("w1", "ops", "red")]).unwrap();
    for read in [first, second] {
        let got = tokio::time::timeout(Duration::from_secs(2), read).await.unwrap().unwrap().unwrap();
        assert_eq!(got.metadata.name.as_deref(), Some("w1"));
    }
    assert_eq!(conn.watches.lock().unwrap().len(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn repeated_namespaces_are_watched_once() {
    let (conn, cache) = setup(&["ops", "dev", "ops", "", "dev"]);
    cache.get_informer_for_kind(&widget_gvk()).await.unwrap();
    let scopes: Vec<_> = conn.watches.lock().unwrap().iter().map(|(_, ns, _)| ns.clone()).collect();
    assert_eq!(scopes, vec![Some("ops".to_string()), Some("dev".to_string())]);

    let cancel = CancellationToken::new();
    {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.start(cancel).await });
    }
    conn.feed(&widget_gvk(), Some("ops")).restarted(vec![widget("w1", "ops", "red")]).unwrap();
    conn.feed(&widget_gvk(), Some("dev")).restarted(Vec::new()).unwrap();
    assert!(cache.wait_for_sync(&cancel).await);
    let all = cache.list(&widget_gvk(), &ListOptions::default()).await.unwrap();
    assert_eq!(all.len(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn cluster_scoped_kinds_use_one_store() {
    let (conn, cache) = setup(&["ops", "dev"]);
    let informer = cache.get_informer_for_kind(&node_gvk()).await.unwrap();
    assert_eq!(conn.watches.lock().unwrap().clone(), vec![("example.io/v1/Rack".to_string(), None, None)]);
    assert!(!informer.has_synced());

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(!cache.wait_for_sync(&cancel).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn informer_merges_namespace_events_and_indexes() {
    let (conn, cache) = setup(&["ops", "dev"]);
    cache.index_field(&gadget_gvk(), "spec.color", field_extractor("spec.color")).await.unwrap();
    let informer = cache.get_informer_for_kind(&gadget_gvk()).await.unwrap();
    let mut events = informer.subscribe();

    let cancel = CancellationToken::new();
    {
        let cache = cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.start(cancel).await });
    }
    conn.feed(&gadget_gvk(), Some("ops")).restarted(Vec::new()).unwrap();
    conn.feed(&gadget_gvk(), Some("dev")).restarted(Vec::new()).unwrap();
    assert!(cache.wait_for_sync(&cancel).await);
    assert!(informer.has_synced());

    conn.feed(&gadget_gvk(), Some("ops")).send(WatchEvent::Applied(object(&gadget_gvk(), "g1", "ops", "red"))).unwrap();
    conn.feed(&gadget_gvk(), Some("dev")).send(WatchEvent::Applied(object(&gadget_gvk(), "g2", "dev", "red"))).unwrap();
    for _ in 0..2 {
        let ev = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(ev, StoreEvent::Added(_)));
    }

    let red = ListOptions::default().fields("spec.color=red".parse().unwrap());
    assert_eq!(cache.list(&gadget_gvk(), &red).await.unwrap().len(), 2);
    assert_eq!(cache.list(&gadget_gvk(), &red.clone().within("ops")).await.unwrap().len(), 1);
    assert_eq!(informer.list_all().len(), 2);
    cancel.cancel();
}

#[tokio::test]
async fn unknown_kinds_fail_to_build() {
    let (_conn, cache) = setup(&[]);
    let unknown = Gvk { group: "example.io".into(), version: "v1".into(), kind: "Sprocket".into() };
    assert!(cache.get(&unknown, &ObjectKey::cluster("s")).await.is_err());
}
