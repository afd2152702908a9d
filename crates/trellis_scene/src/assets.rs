//! Asset loading
//!
//! The scene never performs I/O. Requests are handed to a [`Fetcher`] and
//! the host reports completion through [`Scene::complete_request`]. The
//! [`AssetCache`] coalesces requests by URL for the lifetime of the scene:
//! a second request for an in-flight URL joins the first, and a settled URL
//! answers immediately.
//!
//! `t-asset-item` nodes, and media elements placed directly inside
//! `t-assets`, request their `src` when they connect. The asset container
//! settles once every tracked child has, or when the configured timeout
//! passes.

use crate::config::AssetFailurePolicy;
use crate::document::{NodeId, NodeKind};
use crate::events::{names, EventDetail};
use crate::scene::Scene;
use rustc_hash::FxHashMap;

/// How a request ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetOutcome {
    Loaded,
    Failed(String),
}

impl AssetOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, AssetOutcome::Loaded)
    }
}

/// What a hook gets back from `request_asset`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetStatus {
    Pending,
    Ready(AssetOutcome),
}

/// Starts a request; completion is reported back by the host
pub trait Fetcher {
    fn start(&mut self, url: &str);
}

/// Fetcher that never starts anything
#[derive(Debug, Default)]
pub struct NullFetcher;

impl Fetcher for NullFetcher {
    fn start(&mut self, url: &str) {
        tracing::trace!("NullFetcher ignoring `{}`", url);
    }
}

/// Settlement state of a node taking part in load fan-in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Pending,
    Loaded,
    Failed,
}

impl LoadStatus {
    pub fn is_settled(self) -> bool {
        !matches!(self, LoadStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AssetWaiter {
    Item(NodeId),
    Component { entity: NodeId, key: String },
    System(String),
}

#[derive(Debug)]
enum CacheEntry {
    Pending(Vec<AssetWaiter>),
    Done(AssetOutcome),
}

pub(crate) enum AssetRequest {
    /// First request for this URL; the caller starts the fetch
    New,
    /// Joined an in-flight request
    Joined,
    Ready(AssetOutcome),
}

/// Request-coalescing cache keyed by URL; entries are never evicted
#[derive(Debug, Default)]
pub struct AssetCache {
    entries: FxHashMap<String, CacheEntry>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request(&mut self, url: &str, waiter: AssetWaiter) -> AssetRequest {
        match self.entries.get_mut(url) {
            Some(CacheEntry::Pending(waiters)) => {
                if !waiters.contains(&waiter) {
                    waiters.push(waiter);
                }
                AssetRequest::Joined
            }
            Some(CacheEntry::Done(outcome)) => AssetRequest::Ready(outcome.clone()),
            None => {
                self.entries
                    .insert(url.to_string(), CacheEntry::Pending(vec![waiter]));
                AssetRequest::New
            }
        }
    }

    /// Record an outcome and hand back everyone waiting on it
    ///
    /// Completing a URL twice keeps the first outcome.
    pub(crate) fn complete(&mut self, url: &str, outcome: AssetOutcome) -> Vec<AssetWaiter> {
        let Some(entry) = self.entries.get_mut(url) else {
            self.entries.insert(url.to_string(), CacheEntry::Done(outcome));
            return Vec::new();
        };
        if matches!(entry, CacheEntry::Done(_)) {
            return Vec::new();
        }
        match std::mem::replace(entry, CacheEntry::Done(outcome)) {
            CacheEntry::Pending(waiters) => waiters,
            CacheEntry::Done(_) => Vec::new(),
        }
    }

    pub fn outcome(&self, url: &str) -> Option<&AssetOutcome> {
        match self.entries.get(url) {
            Some(CacheEntry::Done(outcome)) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_pending(&self, url: &str) -> bool {
        matches!(self.entries.get(url), Some(CacheEntry::Pending(_)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Scene {
    /// Whether a connected node fetches its `src` as an asset
    pub(crate) fn is_tracked_asset(&self, node: NodeId) -> bool {
        match self.doc.kind(node) {
            Some(NodeKind::AssetItem) => true,
            Some(NodeKind::Element) => {
                self.doc.is_media_element(node)
                    && self
                        .doc
                        .parent(node)
                        .and_then(|p| self.doc.kind(p))
                        .map(|k| k == NodeKind::Assets)
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    pub(crate) fn request_item(&mut self, node: NodeId) {
        let Some(url) = self.doc.attribute(node, "src").map(str::to_string) else {
            if self.doc.kind(node) == Some(NodeKind::AssetItem) {
                tracing::warn!("Asset item {:?} has no `src`", node);
                self.load_status.insert(node, LoadStatus::Failed);
                self.emit(
                    node,
                    names::ERROR,
                    EventDetail::Request {
                        url: String::new(),
                        message: Some("missing src".to_string()),
                    },
                    false,
                );
            }
            return;
        };
        self.load_status.insert(node, LoadStatus::Pending);
        match self.assets.request(&url, AssetWaiter::Item(node)) {
            AssetRequest::New => {
                tracing::debug!("Fetching `{}`", url);
                self.fetcher.start(&url);
            }
            AssetRequest::Joined => {}
            AssetRequest::Ready(outcome) => self.settle_item(node, &url, &outcome),
        }
    }

    fn settle_item(&mut self, node: NodeId, url: &str, outcome: &AssetOutcome) {
        if self.load_status.get(node).copied() != Some(LoadStatus::Pending) {
            return;
        }
        match outcome {
            AssetOutcome::Loaded => {
                self.load_status.insert(node, LoadStatus::Loaded);
                self.emit(node, names::LOADED, EventDetail::None, false);
            }
            AssetOutcome::Failed(message) => {
                tracing::warn!("Asset `{}` failed to load: {}", url, message);
                self.load_status.insert(node, LoadStatus::Failed);
                let detail = EventDetail::Request {
                    url: url.to_string(),
                    message: Some(message.clone()),
                };
                self.emit(node, names::ERROR, detail.clone(), false);
                if self.config.asset_failure == AssetFailurePolicy::FailFast {
                    if let Some(container) = self.doc.parent(node) {
                        self.fail_container(container, detail);
                    }
                }
            }
        }
    }

    fn fail_container(&mut self, container: NodeId, detail: EventDetail) {
        if self.doc.kind(container) != Some(NodeKind::Assets)
            || self.load_status.get(container).copied() != Some(LoadStatus::Pending)
        {
            return;
        }
        tracing::warn!("Asset container {:?} failed", container);
        self.load_status.insert(container, LoadStatus::Failed);
        self.emit(container, names::ERROR, detail, false);
    }

    /// Report the end of a request started by the [`Fetcher`]
    ///
    /// Waiting items settle, and components that asked for the URL get
    /// `on_asset` if they are still attached. Completions that arrive after
    /// an asset timeout still apply.
    pub fn complete_request(&mut self, url: &str, outcome: AssetOutcome) {
        let waiters = self.assets.complete(url, outcome.clone());
        for waiter in waiters {
            match waiter {
                AssetWaiter::Item(node) => {
                    if self.doc.contains(node) {
                        self.settle_item(node, url, &outcome);
                    }
                }
                AssetWaiter::Component { entity, key } => {
                    let result = self
                        .with_component_behavior(entity, &key, |b, ctx| b.on_asset(ctx, url, &outcome));
                    if let Some(Err(e)) = result {
                        tracing::warn!("Component `{}` on_asset failed: {}", key, e);
                    }
                }
                AssetWaiter::System(name) => {
                    let result =
                        self.with_system_behavior(&name, |b, ctx| b.on_asset(ctx, url, &outcome));
                    if let Some(Err(e)) = result {
                        tracing::warn!("System `{}` on_asset failed: {}", name, e);
                    }
                }
            }
        }
        self.settle_loads();
    }

    /// Settle asset containers whose timeout has passed
    ///
    /// The clock for a container starts at the first frame after it
    /// connects.
    pub(crate) fn check_asset_timeouts(&mut self, now_ms: f64) {
        let Some(timeout) = self.config.asset_timeout_ms else {
            return;
        };
        let mut expired = Vec::new();
        for (container, started) in self.asset_containers.iter_mut() {
            if self.load_status.get(container).copied() != Some(LoadStatus::Pending) {
                continue;
            }
            let start = *started.get_or_insert(now_ms);
            if now_ms - start >= timeout {
                expired.push(container);
            }
        }
        if expired.is_empty() {
            return;
        }
        for container in expired {
            tracing::warn!(
                "Asset loading timed out after {}ms; continuing without pending assets",
                timeout
            );
            self.load_status.insert(container, LoadStatus::Loaded);
            self.emit(container, names::TIMEOUT, EventDetail::None, false);
            self.emit(container, names::LOADED, EventDetail::None, false);
        }
        self.settle_loads();
    }
}
