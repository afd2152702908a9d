//! Entity event surface
//!
//! Entities emit DOM-style custom events (`loaded`, `componentinitialized`,
//! `stateadded`, ...). Listeners are registered per node and event name and
//! observe events without access to the scene; hosts typically push what
//! they see into their own queues.

use crate::document::NodeId;
use rustc_hash::FxHashMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use trellis_core::PropValue;

new_key_type! {
    /// Handle returned when a listener is registered
    pub struct ListenerId;
}

/// Event names emitted by the runtime
pub mod names {
    pub const LOADED: &str = "loaded";
    pub const ERROR: &str = "error";
    pub const TIMEOUT: &str = "timeout";
    pub const PLAY: &str = "play";
    pub const PAUSE: &str = "pause";
    pub const COMPONENT_INITIALIZED: &str = "componentinitialized";
    pub const COMPONENT_CHANGED: &str = "componentchanged";
    pub const COMPONENT_REMOVED: &str = "componentremoved";
    pub const STATE_ADDED: &str = "stateadded";
    pub const STATE_REMOVED: &str = "stateremoved";
    pub const OBJECT3D_SET: &str = "object3dset";
    pub const OBJECT3D_REMOVE: &str = "object3dremove";
    pub const CHILD_ATTACHED: &str = "child-attached";
    pub const CHILD_DETACHED: &str = "child-detached";
}

/// Event payload
#[derive(Clone, Debug, Default, PartialEq)]
pub enum EventDetail {
    #[default]
    None,
    Component {
        name: String,
        id: Option<String>,
    },
    State(String),
    Object3D(String),
    Child(NodeId),
    Request {
        url: String,
        message: Option<String>,
    },
    Value(PropValue),
}

/// A dispatched event
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub name: String,
    /// Node the event was emitted on
    pub target: NodeId,
    /// Node whose listener is currently running
    pub current_target: NodeId,
    pub detail: EventDetail,
    pub bubbles: bool,
}

type Callback = Box<dyn FnMut(&Event)>;

struct Listener {
    node: NodeId,
    event: String,
    callback: Callback,
}

/// Listener storage and dispatch
#[derive(Default)]
pub struct Listeners {
    listeners: SlotMap<ListenerId, Listener>,
    by_node: FxHashMap<NodeId, SmallVec<[ListenerId; 4]>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event` on `node`
    pub fn add<F>(&mut self, node: NodeId, event: &str, callback: F) -> ListenerId
    where
        F: FnMut(&Event) + 'static,
    {
        let id = self.listeners.insert(Listener {
            node,
            event: event.to_string(),
            callback: Box::new(callback),
        });
        self.by_node.entry(node).or_default().push(id);
        id
    }

    /// Unregister a listener; returns whether it existed
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let Some(listener) = self.listeners.remove(id) else {
            return false;
        };
        if let Some(ids) = self.by_node.get_mut(&listener.node) {
            ids.retain(|l| *l != id);
            if ids.is_empty() {
                self.by_node.remove(&listener.node);
            }
        }
        true
    }

    /// Drop every listener registered on a node
    pub fn remove_node(&mut self, node: NodeId) {
        if let Some(ids) = self.by_node.remove(&node) {
            for id in ids {
                self.listeners.remove(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver an event along `path` (target first, then ancestors)
    ///
    /// Only the first node of the path is visited when the event does not
    /// bubble.
    pub fn dispatch(&mut self, path: &[NodeId], mut event: Event) {
        let visit = if event.bubbles { path.len() } else { path.len().min(1) };
        for node in &path[..visit] {
            let Some(ids) = self.by_node.get(node) else {
                continue;
            };
            event.current_target = *node;
            let ids: SmallVec<[ListenerId; 4]> = ids.clone();
            for id in ids {
                if let Some(listener) = self.listeners.get_mut(id) {
                    if listener.event == event.name {
                        (listener.callback)(&event);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}
