//! Mirra kubehub: list/watch change source over any served GVK, backed by
//! kube's dynamic API.

#![forbid(unsafe_code)]

use std::ops::Deref;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use mirra_core::{BoxError, IndexFunc, IndexValues, ListerWatcher, Resource, WatchEvent};
use serde::Serialize;
use tracing::{debug, info};

/// Server-side watch timeout; the reflector relists when the stream ends.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// A `DynamicObject` as the engine sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct KubeObject(pub DynamicObject);

impl KubeObject {
    /// Wrap `obj`, dropping `metadata.managedFields`.
    pub fn new(mut obj: DynamicObject) -> Self {
        obj.metadata.managed_fields = None;
        Self(obj)
    }

    pub fn into_inner(self) -> DynamicObject {
        self.0
    }
}

impl Deref for KubeObject {
    type Target = DynamicObject;

    fn deref(&self) -> &DynamicObject {
        &self.0
    }
}

impl Resource for KubeObject {
    fn namespace(&self) -> Option<&str> {
        self.0.metadata.namespace.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.0.metadata.name.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.0.metadata.resource_version.as_deref()
    }
}

/// Index objects by the value of label `key`; unlabelled objects are not filed.
pub fn label_index(key: &str) -> IndexFunc<KubeObject> {
    let key = key.to_string();
    Arc::new(move |obj: &KubeObject| {
        let mut vals = IndexValues::new();
        if let Some(v) = obj.metadata.labels.as_ref().and_then(|l| l.get(&key)) {
            vals.push(v.clone());
        }
        Ok(vals)
    })
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn event_type<T>(ev: &KubeEvent<T>) -> &'static str {
    match ev {
        KubeEvent::Added(_) => "added",
        KubeEvent::Modified(_) => "modified",
        KubeEvent::Deleted(_) => "deleted",
        KubeEvent::Bookmark(_) => "bookmark",
        KubeEvent::Error(_) => "error",
    }
}

/// Map one watch frame from the API server onto the engine's event vocabulary.
pub fn convert(ev: KubeEvent<DynamicObject>) -> WatchEvent<KubeObject> {
    counter!("mirra_watch_events_total", 1u64, "type" => event_type(&ev));
    match ev {
        KubeEvent::Added(o) => WatchEvent::Added(KubeObject::new(o)),
        KubeEvent::Modified(o) => WatchEvent::Modified(KubeObject::new(o)),
        KubeEvent::Deleted(o) => WatchEvent::Deleted(KubeObject::new(o)),
        KubeEvent::Bookmark(bm) => WatchEvent::Bookmark(bm.metadata.resource_version),
        KubeEvent::Error(e) => WatchEvent::Error(format!("{} ({}): {}", e.reason, e.code, e.message)),
    }
}

/// List + watch over one GVK, optionally restricted to a namespace.
pub struct KubeListWatch {
    api: Api<DynamicObject>,
    gvk_key: String,
}

impl KubeListWatch {
    pub fn new(api: Api<DynamicObject>, gvk_key: impl Into<String>) -> Self {
        Self { api, gvk_key: gvk_key.into() }
    }

    /// Resolve `gvk_key` (`v1/Kind` or `group/v1/Kind`) through discovery using
    /// the default kube client. Cluster-scoped kinds ignore `namespace`.
    pub async fn for_gvk(gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if namespaced => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "resolved api resource");
        Ok(Self::new(api, gvk_key))
    }

    pub fn gvk_key(&self) -> &str {
        &self.gvk_key
    }
}

#[async_trait]
impl ListerWatcher<KubeObject> for KubeListWatch {
    async fn list(&self) -> Result<(Vec<KubeObject>, String), BoxError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing {}", self.gvk_key))?;
        let rv = list.metadata.resource_version.unwrap_or_default();
        debug!(gvk = %self.gvk_key, items = list.items.len(), rv = %rv, "listed");
        Ok((list.items.into_iter().map(KubeObject::new).collect(), rv))
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, WatchEvent<KubeObject>>, BoxError> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self
            .api
            .watch(&wp, resource_version)
            .await
            .with_context(|| format!("watching {} from {}", self.gvk_key, resource_version))?;
        debug!(gvk = %self.gvk_key, rv = %resource_version, "watch opened");
        Ok(stream
            .map(|frame| match frame {
                Ok(ev) => convert(ev),
                Err(e) => WatchEvent::Error(e.to_string()),
            })
            .boxed())
    }
}
