#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use mirra_core::{BoxError, IndexFunc, Indexers, ListerWatcher, Resource, ResourceEventHandler, WatchEvent};
use smallvec::smallvec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub ns: String,
    pub name: String,
    pub rv: String,
    pub node: String,
}

impl Resource for Pod {
    fn namespace(&self) -> Option<&str> { Some(&self.ns) }
    fn name(&self) -> Option<&str> { Some(&self.name) }
    fn resource_version(&self) -> Option<&str> { Some(&self.rv) }
}

pub fn pod(name: &str, rv: &str, node: &str) -> Pod {
    Pod { ns: "default".into(), name: name.into(), rv: rv.into(), node: node.into() }
}

pub fn key(name: &str) -> String {
    format!("default/{}", name)
}

/// `node` index; refuses pods scheduled on "bad".
pub fn node_indexers() -> Indexers<Pod> {
    let by_node: IndexFunc<Pod> = Arc::new(|p: &Pod| {
        if p.node == "bad" {
            return Err(BoxError::from("unschedulable node"));
        }
        Ok(smallvec![p.node.clone()])
    });
    let mut ix = Indexers::new();
    ix.insert("node".to_string(), by_node);
    ix
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Add(String, String),
    Update(String, String, String),
    Delete(String, String),
}

impl Event {
    pub fn key(&self) -> &str {
        match self {
            Event::Add(k, _) | Event::Update(k, _, _) | Event::Delete(k, _) => k,
        }
    }
}

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn for_key(&self, k: &str) -> Vec<Event> {
        self.events().into_iter().filter(|e| e.key() == k).collect()
    }
}

impl ResourceEventHandler<Pod> for Recorder {
    fn on_add(&self, obj: &Pod) {
        self.events.lock().unwrap().push(Event::Add(key(&obj.name), obj.rv.clone()));
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        self.events.lock().unwrap().push(Event::Update(key(&new.name), old.rv.clone(), new.rv.clone()));
    }

    fn on_delete(&self, obj: &Pod) {
        self.events.lock().unwrap().push(Event::Delete(key(&obj.name), obj.rv.clone()));
    }
}

struct SourceState {
    listing: Result<Vec<Pod>, String>,
    watches: VecDeque<mpsc::UnboundedReceiver<WatchEvent<Pod>>>,
    watched_from: Vec<String>,
}

/// In-memory change source: a settable listing plus pre-registered watch streams.
#[derive(Clone)]
pub struct ScriptedSource {
    state: Arc<Mutex<SourceState>>,
    lists: Arc<AtomicUsize>,
    rv: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(initial: Vec<Pod>) -> (Self, mpsc::UnboundedSender<WatchEvent<Pod>>) {
        let src = Self {
            state: Arc::new(Mutex::new(SourceState { listing: Ok(initial), watches: VecDeque::new(), watched_from: Vec::new() })),
            lists: Arc::new(AtomicUsize::new(0)),
            rv: Arc::new(AtomicUsize::new(100)),
        };
        let tx = src.next_watch();
        (src, tx)
    }

    /// Register the stream handed to the next `watch` call.
    pub fn next_watch(&self) -> mpsc::UnboundedSender<WatchEvent<Pod>> {
        let (tx, rx) = mpsc::unbounded();
        self.state.lock().unwrap().watches.push_back(rx);
        tx
    }

    pub fn set_listing(&self, items: Vec<Pod>) {
        self.state.lock().unwrap().listing = Ok(items);
    }

    pub fn fail_listing(&self, msg: &str) {
        self.state.lock().unwrap().listing = Err(msg.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Marker passed to every `watch` call so far.
    pub fn watched_from(&self) -> Vec<String> {
        self.state.lock().unwrap().watched_from.clone()
    }
}

#[async_trait]
impl ListerWatcher<Pod> for ScriptedSource {
    async fn list(&self) -> Result<(Vec<Pod>, String), BoxError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let rv = self.rv.fetch_add(1, Ordering::SeqCst).to_string();
        match &self.state.lock().unwrap().listing {
            Ok(items) => Ok((items.clone(), rv)),
            Err(msg) => Err(BoxError::from(msg.clone())),
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, WatchEvent<Pod>>, BoxError> {
        let mut st = self.state.lock().unwrap();
        st.watched_from.push(resource_version.to_string());
        match st.watches.pop_front() {
            Some(rx) => Ok(rx.boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Poll `cond` until it holds; panics after two seconds.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
