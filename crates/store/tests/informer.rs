mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{key, node_indexers, pod, wait_for, Event, Recorder, ScriptedSource};
use mirra_core::{HandlerFns, MirrorConfig, MirrorError, StoreError, WatchEvent};
use mirra_store::{new_indexer_informer, Cache, Controller};
use tokio_util::sync::CancellationToken;

fn spawn_controller(
    controller: Controller<common::Pod, ScriptedSource, Recorder>,
) -> (Arc<Controller<common::Pod, ScriptedSource, Recorder>>, CancellationToken, tokio::task::JoinHandle<Result<(), MirrorError>>) {
    let controller = Arc::new(controller);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        async move { controller.run(cancel).await }
    });
    (controller, cancel, task)
}

fn with_resync(src: ScriptedSource, rec: Recorder, period_ms: u64) -> (Arc<Cache<common::Pod>>, Controller<common::Pod, ScriptedSource, Recorder>) {
    let cache = Arc::new(Cache::with_indexers(node_indexers()));
    let config = MirrorConfig::default().with_resync_period(Some(Duration::from_millis(period_ms)));
    let controller = Controller::new(config, Arc::new(src), Arc::new(rec), Arc::clone(&cache));
    (cache, controller)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_and_watch_events_reach_handler_in_key_order() {
    let (src, tx) = ScriptedSource::new(vec![pod("a", "1", "n1"), pod("b", "1", "n1")]);
    let rec = Recorder::default();
    let (cache, controller) = new_indexer_informer(src, None, rec.clone(), node_indexers());
    let (controller, cancel, task) = spawn_controller(controller);

    wait_for("initial sync", || controller.has_synced()).await;
    assert_eq!(cache.len(), 2);

    tx.unbounded_send(WatchEvent::Added(pod("c", "2", "n2"))).unwrap();
    tx.unbounded_send(WatchEvent::Modified(pod("a", "3", "n2"))).unwrap();
    tx.unbounded_send(WatchEvent::Bookmark("4".into())).unwrap();
    tx.unbounded_send(WatchEvent::Deleted(pod("b", "5", "n1"))).unwrap();
    wait_for("b deleted", || cache.get_by_key(&key("b")).is_none() && cache.len() == 2).await;
    wait_for("a moved", || cache.get_by_key(&key("a")).map(|p| p.rv == "3").unwrap_or(false)).await;

    assert_eq!(rec.for_key(&key("a")), vec![Event::Add(key("a"), "1".into()), Event::Update(key("a"), "1".into(), "3".into())]);
    assert_eq!(rec.for_key(&key("b")), vec![Event::Add(key("b"), "1".into()), Event::Delete(key("b"), "5".into())]);
    assert_eq!(rec.for_key(&key("c")), vec![Event::Add(key("c"), "2".into())]);
    assert_eq!(rec.events().len(), 5);

    let mut on_n2: Vec<String> = cache.by_index("node", "n2").unwrap().iter().map(|p| p.name.clone()).collect();
    on_n2.sort();
    assert_eq!(on_n2, vec!["a".to_string(), "c".to_string()]);
    assert!(cache.by_index("node", "n1").unwrap().is_empty());
    wait_for("bookmark marker", || controller.last_sync_resource_version() == "5").await;

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_relist_only_re_delivers_updates() {
    let (src, _tx) = ScriptedSource::new(vec![pod("a", "1", "n1"), pod("b", "1", "n1")]);
    let rec = Recorder::default();
    let (cache, controller) = with_resync(src.clone(), rec.clone(), 30);
    let (_controller, cancel, task) = spawn_controller(controller);

    wait_for("two resync cycles", || src.list_calls() >= 3 && rec.events().len() >= 6).await;
    cancel.cancel();
    assert!(task.await.unwrap().is_ok());

    let mut keys = cache.list_keys();
    keys.sort();
    assert_eq!(keys, vec![key("a"), key("b")]);
    for k in [key("a"), key("b")] {
        let events = rec.for_key(&k);
        assert_eq!(events[0], Event::Add(k.clone(), "1".into()));
        assert!(events[1..].iter().all(|e| *e == Event::Update(k.clone(), "1".into(), "1".into())), "{:?}", events);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_missing_a_key_deletes_it_once() {
    let (src, _tx) = ScriptedSource::new(vec![pod("a", "1", "n1"), pod("b", "1", "n1")]);
    let rec = Recorder::default();
    let (cache, controller) = with_resync(src.clone(), rec.clone(), 30);
    let (_controller, cancel, task) = spawn_controller(controller);

    wait_for("initial sync", || cache.len() == 2).await;
    src.set_listing(vec![pod("a", "1", "n1")]);
    wait_for("b gone", || cache.get_by_key(&key("b")).is_none()).await;
    let calls = src.list_calls();
    wait_for("another resync after the deletion", || src.list_calls() >= calls + 2).await;
    cancel.cancel();
    assert!(task.await.unwrap().is_ok());

    let deletes: Vec<Event> = rec.for_key(&key("b")).into_iter().filter(|e| matches!(e, Event::Delete(..))).collect();
    assert_eq!(deletes, vec![Event::Delete(key("b"), "1".into())]);
    assert!(cache.by_index("node", "n1").unwrap().iter().all(|p| p.name == "a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_resync_listing_skips_the_cycle() {
    let (src, _tx) = ScriptedSource::new(vec![pod("a", "1", "n1")]);
    let rec = Recorder::default();
    let (cache, controller) = with_resync(src.clone(), rec.clone(), 20);
    let (controller, cancel, task) = spawn_controller(controller);

    wait_for("initial sync", || controller.has_synced() && cache.len() == 1).await;
    src.fail_listing("apiserver unavailable");
    let calls = src.list_calls();
    wait_for("failed cycles", || src.list_calls() >= calls + 3).await;
    assert_eq!(cache.len(), 1);
    assert!(rec.events().iter().all(|e| !matches!(e, Event::Delete(..))));

    src.set_listing(vec![pod("a", "2", "n1"), pod("b", "1", "n1")]);
    wait_for("recovered", || cache.len() == 2).await;
    wait_for("a refreshed", || cache.get_by_key(&key("a")).map(|p| p.rv == "2").unwrap_or(false)).await;

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_error_restarts_from_a_fresh_listing() {
    let (src, tx) = ScriptedSource::new(vec![pod("a", "1", "n1")]);
    let rec = Recorder::default();
    let (cache, controller) = new_indexer_informer(src.clone(), None, rec.clone(), node_indexers());
    let (_controller, cancel, task) = spawn_controller(controller);

    wait_for("initial sync", || cache.len() == 1).await;
    let _tx2 = src.next_watch();
    src.set_listing(vec![pod("a", "1", "n1"), pod("c", "7", "n3")]);
    tx.unbounded_send(WatchEvent::Error("too old resource version".into())).unwrap();

    wait_for("relisted", || cache.get_by_key(&key("c")).is_some()).await;
    assert!(src.list_calls() >= 2);
    assert_eq!(rec.for_key(&key("c")), vec![Event::Add(key("c"), "7".into())]);

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_failure_halts_the_loop_and_surfaces() {
    let (src, _tx) = ScriptedSource::new(vec![pod("ok", "1", "n1"), pod("broken", "1", "bad")]);
    let rec = Recorder::default();
    let (cache, controller) = new_indexer_informer(src, None, rec.clone(), node_indexers());
    let (_controller, _cancel, task) = spawn_controller(controller);

    let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    match res {
        Err(MirrorError::StoreMutation(StoreError::IndexFunc { name, key: k, .. })) => {
            assert_eq!(name, "node");
            assert_eq!(k, key("broken"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(cache.get_by_key(&key("broken")).is_none());
    assert!(rec.for_key(&key("broken")).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_replays_what_was_already_queued() {
    let (src, _tx) = ScriptedSource::new((0..50).map(|i| pod(&format!("p{}", i), "1", "n1")).collect());
    let rec = Recorder::default();
    let (cache, controller) = new_indexer_informer(src, None, rec.clone(), node_indexers());
    let (controller, cancel, task) = spawn_controller(controller);

    // the whole listing is queued under one lock, so any replayed chain means all 50 are queued
    wait_for("first chain replayed", || !cache.is_empty()).await;
    cancel.cancel();
    let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(res.is_ok());
    assert!(controller.queue().is_closed());
    assert!(controller.queue().is_empty());
    assert_eq!(cache.len(), 50);
    assert_eq!(rec.events().len(), 50);
    assert!(rec.events().iter().all(|e| matches!(e, Event::Add(..))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_panic_stops_the_source() {
    let (src, _tx) = ScriptedSource::new(vec![pod("ok", "1", "n1"), pod("boom", "1", "n1")]);
    let handler = HandlerFns::new().with_add(|p: &common::Pod| {
        if p.name == "boom" {
            panic!("handler exploded on {}", p.name);
        }
    });
    let cache = Arc::new(Cache::with_indexers(node_indexers()));
    let config = MirrorConfig::default().with_resync_period(Some(Duration::from_millis(20)));
    let controller = Arc::new(Controller::new(config, Arc::new(src.clone()), Arc::new(handler), Arc::clone(&cache)));
    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(CancellationToken::new()).await }
    });

    let joined = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();
    assert!(joined.unwrap_err().is_panic());
    wait_for("queue closed", || controller.queue().is_closed()).await;
    // a tick already in flight may still list once; after that the source stays quiet
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = src.list_calls();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(src.list_calls(), calls);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_may_ask_whether_the_mirror_synced() {
    let (src, _tx) = ScriptedSource::new(vec![pod("a", "1", "n1"), pod("b", "1", "n1")]);
    let seen: Arc<std::sync::Mutex<Vec<bool>>> = Arc::default();
    let cache = Arc::new(Cache::with_indexers(node_indexers()));
    let controller = Arc::new_cyclic(|weak: &std::sync::Weak<Controller<common::Pod, ScriptedSource, HandlerFns<common::Pod>>>| {
        let weak = weak.clone();
        let seen = Arc::clone(&seen);
        let handler = HandlerFns::new().with_add(move |_p: &common::Pod| {
            if let Some(c) = weak.upgrade() {
                seen.lock().unwrap().push(c.has_synced());
            }
        });
        Controller::new(MirrorConfig::default(), Arc::new(src), Arc::new(handler), Arc::clone(&cache))
    });
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        async move { controller.run(cancel).await }
    });

    wait_for("both adds delivered", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![false, false]);
    wait_for("synced", || controller.has_synced()).await;
    cancel.cancel();
    assert!(tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_watch_resumes_from_the_newest_marker() {
    let (src, tx) = ScriptedSource::new(vec![pod("a", "1", "n1")]);
    let rec = Recorder::default();
    let (cache, controller) = new_indexer_informer(src.clone(), None, rec.clone(), node_indexers());
    let (controller, cancel, task) = spawn_controller(controller);

    wait_for("initial sync", || controller.has_synced()).await;
    tx.unbounded_send(WatchEvent::Added(pod("b", "7", "n1"))).unwrap();
    wait_for("b added", || cache.get_by_key(&key("b")).is_some()).await;
    let tx2 = src.next_watch();
    // outlive the short-stream guard, then let the source close the stream
    tokio::time::sleep(Duration::from_millis(400)).await;
    drop(tx);

    wait_for("second watch", || src.watched_from().len() == 2).await;
    assert_eq!(src.watched_from(), vec!["100".to_string(), "7".to_string()]);
    tx2.unbounded_send(WatchEvent::Added(pod("c", "8", "n1"))).unwrap();
    wait_for("c added", || cache.get_by_key(&key("c")).is_some()).await;
    assert_eq!(src.list_calls(), 1);
    assert_eq!(rec.events().len(), 3);

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_closed_at_once_relists() {
    let (src, tx) = ScriptedSource::new(vec![pod("a", "1", "n1")]);
    drop(tx);
    let _tx2 = src.next_watch();
    let rec = Recorder::default();
    let (cache, controller) = new_indexer_informer(src.clone(), None, rec.clone(), node_indexers());
    let (_controller, cancel, task) = spawn_controller(controller);

    wait_for("relisted after backoff", || src.list_calls() == 2 && rec.events().len() == 2).await;
    assert_eq!(cache.len(), 1);
    assert_eq!(rec.for_key(&key("a")), vec![Event::Add(key("a"), "1".into()), Event::Update(key("a"), "1".into(), "1".into())]);

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}
