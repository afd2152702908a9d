//! Markup document
//!
//! A DOM-like tree of tagged nodes with ordered string attributes. The scene
//! treats it as the source of truth for markup: attribute writes made
//! through [`Document::set_attribute`] are queued as [`MutationRecord`]s and
//! delivered in batches, the way a host mutation observer would deliver
//! them.
//!
//! Nodes are stored in a slotmap arena; ids are never reused while a node is
//! alive, and a removed node's id stops resolving.

use crate::error::{Result, SceneError};
use indexmap::map::Entry;
use indexmap::IndexMap;
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, opt, value},
    multi::{many1, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use rustc_hash::FxHashMap;
use slotmap::{new_key_type, Key, SlotMap};
use smallvec::SmallVec;
use trellis_core::{NodeHandle, NodeLookup};

new_key_type! {
    /// Unique identifier for a document node
    pub struct NodeId;
}

impl NodeId {
    /// Opaque handle used by the schema engine
    pub fn to_handle(self) -> NodeHandle {
        NodeHandle(self.data().as_ffi())
    }

    /// Reconstruct from a schema-engine handle
    pub fn from_handle(handle: NodeHandle) -> Self {
        slotmap::KeyData::from_ffi(handle.0).into()
    }
}

pub const SCENE_TAG: &str = "t-scene";
pub const ENTITY_TAG: &str = "t-entity";
pub const MIXIN_TAG: &str = "t-mixin";
pub const ASSETS_TAG: &str = "t-assets";
pub const ASSET_ITEM_TAG: &str = "t-asset-item";

/// Tags whose nodes are media elements (passed through by the `asset` type)
pub const MEDIA_TAGS: &[&str] = &["img", "video", "audio", "canvas"];

/// What role a node plays in the runtime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Scene,
    Entity,
    Mixin,
    Assets,
    AssetItem,
    /// Plain markup with no runtime behavior
    Element,
}

impl NodeKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            SCENE_TAG => NodeKind::Scene,
            ENTITY_TAG => NodeKind::Entity,
            MIXIN_TAG => NodeKind::Mixin,
            ASSETS_TAG => NodeKind::Assets,
            ASSET_ITEM_TAG => NodeKind::AssetItem,
            _ => NodeKind::Element,
        }
    }

    /// Runtime nodes take part in load fan-in
    pub fn is_node_type(self) -> bool {
        !matches!(self, NodeKind::Element)
    }

    pub fn is_entity(self) -> bool {
        matches!(self, NodeKind::Scene | NodeKind::Entity)
    }
}

/// A document node
#[derive(Clone, Debug)]
pub struct Node {
    pub tag: String,
    pub kind: NodeKind,
    pub attributes: IndexMap<String, String>,
    pub parent: Option<NodeId>,
    pub children: SmallVec<[NodeId; 8]>,
    pub connected: bool,
}

/// One observed attribute change; `value: None` means removed
#[derive(Clone, Debug, PartialEq)]
pub struct MutationRecord {
    pub node: NodeId,
    pub name: String,
    pub old_value: Option<String>,
    pub value: Option<String>,
}

/// The markup tree
#[derive(Debug, Default)]
pub struct Document {
    nodes: SlotMap<NodeId, Node>,
    ids: FxHashMap<String, SmallVec<[NodeId; 1]>>,
    mutations: Vec<MutationRecord>,
    root: Option<NodeId>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    // === Nodes ===

    /// Create a detached node, inferring its kind from the tag
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.create_node(tag, NodeKind::from_tag(tag))
    }

    /// Create a detached node with an explicit kind
    pub fn create_node(&mut self, tag: &str, kind: NodeKind) -> NodeId {
        self.nodes.insert(Node {
            tag: tag.to_ascii_lowercase(),
            kind,
            attributes: IndexMap::new(),
            parent: None,
            children: SmallVec::new(),
            connected: false,
        })
    }

    /// Create the connected root node
    pub fn create_root(&mut self, tag: &str) -> NodeId {
        let root = self.create_node(tag, NodeKind::Scene);
        if let Some(node) = self.nodes.get_mut(root) {
            node.connected = true;
        }
        self.root = Some(root);
        root
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node(&self, node: NodeId) -> Option<&Node> {
        self.nodes.get(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node).map(|n| n.tag.as_str())
    }

    pub fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.nodes.get(node).map(|n| n.kind)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.nodes.get(node).map(|n| n.connected).unwrap_or(false)
    }

    /// `node` followed by its ancestors, nearest first
    pub fn path_to_root(&self, node: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = self.contains(node).then_some(node);
        while let Some(n) = current {
            path.push(n);
            current = self.parent(n);
        }
        path
    }

    /// Whether `ancestor` is `node` or one of its ancestors
    pub fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent(n);
        }
        false
    }

    /// Subtree in document order
    pub fn pre_order(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.contains(node) {
            return out;
        }
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    /// Subtree with every child before its parent
    pub fn post_order(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if !self.contains(node) {
            return out;
        }
        // (node, children visited)
        let mut stack = vec![(node, false)];
        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                out.push(n);
            } else {
                stack.push((n, true));
                stack.extend(self.children(n).iter().rev().map(|c| (*c, false)));
            }
        }
        out
    }

    /// Append a detached node as the last child of `parent`
    ///
    /// The child's subtree becomes connected when `parent` is.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if !self.contains(parent) {
            return Err(SceneError::UnknownNode(parent));
        }
        let Some(node) = self.nodes.get(child) else {
            return Err(SceneError::UnknownNode(child));
        };
        if node.parent.is_some() || Some(child) == self.root {
            return Err(SceneError::InvalidHierarchy(
                "node already has a parent".to_string(),
            ));
        }
        if self.is_inclusive_ancestor(child, parent) {
            return Err(SceneError::InvalidHierarchy(
                "node cannot be appended inside itself".to_string(),
            ));
        }

        let connected = self.is_connected(parent);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(child) {
            c.parent = Some(parent);
        }
        if connected {
            for n in self.pre_order(child) {
                if let Some(node) = self.nodes.get_mut(n) {
                    node.connected = true;
                }
            }
        }
        Ok(())
    }

    /// Remove a node and its subtree from the arena
    ///
    /// Returns the removed ids, children before parents.
    pub fn remove_subtree(&mut self, node: NodeId) -> Vec<NodeId> {
        let removed = self.post_order(node);
        if let Some(parent) = self.parent(node) {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|c| *c != node);
            }
        }
        for n in &removed {
            if let Some(old) = self.nodes.remove(*n) {
                if let Some(id) = old.attributes.get("id") {
                    self.unindex_id(id, *n);
                }
            }
        }
        if self.root.map(|r| removed.contains(&r)).unwrap_or(false) {
            self.root = None;
        }
        self.mutations.retain(|m| self.nodes.contains_key(m.node));
        removed
    }

    // === Attributes ===

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes
            .get(node)
            .and_then(|n| n.attributes.get(name))
            .map(String::as_str)
    }

    pub fn has_attribute(&self, node: NodeId, name: &str) -> bool {
        self.attribute(node, name).is_some()
    }

    pub fn attributes(&self, node: NodeId) -> Option<&IndexMap<String, String>> {
        self.nodes.get(node).map(|n| &n.attributes)
    }

    /// Write an attribute and queue a mutation record for connected nodes
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> bool {
        let Some(old) = self.write_attribute(node, name, Some(value)) else {
            return false;
        };
        if self.is_connected(node) {
            self.mutations.push(MutationRecord {
                node,
                name: name.to_string(),
                old_value: old,
                value: Some(value.to_string()),
            });
        }
        true
    }

    /// Remove an attribute and queue a mutation record; returns whether it existed
    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> bool {
        if !self.has_attribute(node, name) {
            return false;
        }
        let old = self.write_attribute(node, name, None).flatten();
        if self.is_connected(node) {
            self.mutations.push(MutationRecord {
                node,
                name: name.to_string(),
                old_value: old,
                value: None,
            });
        }
        true
    }

    /// Write an attribute without notifying observers
    pub fn set_attribute_silent(&mut self, node: NodeId, name: &str, value: &str) -> bool {
        self.write_attribute(node, name, Some(value)).is_some()
    }

    /// Remove an attribute without notifying observers
    pub fn remove_attribute_silent(&mut self, node: NodeId, name: &str) -> bool {
        self.has_attribute(node, name) && self.write_attribute(node, name, None).is_some()
    }

    /// Returns `Some(previous value)` if the node exists
    fn write_attribute(
        &mut self,
        node: NodeId,
        name: &str,
        value: Option<&str>,
    ) -> Option<Option<String>> {
        let n = self.nodes.get_mut(node)?;
        let old = match value {
            Some(v) => n.attributes.insert(name.to_string(), v.to_string()),
            None => n.attributes.shift_remove(name),
        };
        if name == "id" {
            if let Some(old_id) = &old {
                self.unindex_id(old_id, node);
            }
            if let Some(new_id) = value {
                self.ids.entry(new_id.to_string()).or_default().push(node);
            }
        }
        Some(old)
    }

    fn unindex_id(&mut self, id: &str, node: NodeId) {
        if let Some(nodes) = self.ids.get_mut(id) {
            nodes.retain(|n| *n != node);
            if nodes.is_empty() {
                self.ids.remove(id);
            }
        }
    }

    // === Mutations ===

    pub fn has_pending_mutations(&self) -> bool {
        !self.mutations.is_empty()
    }

    /// Drop queued records for one attribute of a node
    pub fn discard_mutations(&mut self, node: NodeId, name: &str) {
        self.mutations.retain(|r| !(r.node == node && r.name == name));
    }

    /// Drain queued records, one per (node, attribute)
    ///
    /// Records are kept in first-seen order; the last written value wins and
    /// the first recorded old value is kept.
    pub fn take_mutations(&mut self) -> Vec<MutationRecord> {
        let mut merged: IndexMap<(NodeId, String), MutationRecord> = IndexMap::new();
        for record in self.mutations.drain(..) {
            match merged.entry((record.node, record.name.clone())) {
                Entry::Occupied(mut e) => e.get_mut().value = record.value,
                Entry::Vacant(e) => {
                    e.insert(record);
                }
            }
        }
        merged.into_values().collect()
    }

    // === Queries ===

    /// First connected node with this `id`
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.ids
            .get(id)?
            .iter()
            .copied()
            .find(|n| self.is_connected(*n))
    }

    /// First connected node matching `selector`, in document order
    pub fn query_selector(&self, selector: &str) -> Option<NodeId> {
        let selector = Selector::parse(selector)?;
        let root = self.root?;
        self.pre_order(root)
            .into_iter()
            .find(|n| selector.matches(self, *n))
    }

    /// Every connected node matching `selector`, in document order
    pub fn query_selector_all(&self, selector: &str) -> Vec<NodeId> {
        let (Some(selector), Some(root)) = (Selector::parse(selector), self.root) else {
            return Vec::new();
        };
        self.pre_order(root)
            .into_iter()
            .filter(|n| selector.matches(self, *n))
            .collect()
    }

    /// Whether a node matches `selector`
    pub fn matches(&self, node: NodeId, selector: &str) -> bool {
        Selector::parse(selector)
            .map(|s| s.matches(self, node))
            .unwrap_or(false)
    }

    pub fn is_media_element(&self, node: NodeId) -> bool {
        self.nodes
            .get(node)
            .map(|n| n.kind == NodeKind::Element && MEDIA_TAGS.contains(&n.tag.as_str()))
            .unwrap_or(false)
    }
}

impl NodeLookup for Document {
    fn element_by_id(&self, id: &str) -> Option<NodeHandle> {
        Document::element_by_id(self, id).map(NodeId::to_handle)
    }

    fn query_selector(&self, selector: &str) -> Option<NodeHandle> {
        Document::query_selector(self, selector).map(NodeId::to_handle)
    }

    fn query_selector_all(&self, selector: &str) -> Vec<NodeHandle> {
        Document::query_selector_all(self, selector)
            .into_iter()
            .map(NodeId::to_handle)
            .collect()
    }

    fn attribute(&self, node: NodeHandle, name: &str) -> Option<String> {
        Document::attribute(self, NodeId::from_handle(node), name).map(String::from)
    }

    fn is_media_element(&self, node: NodeHandle) -> bool {
        Document::is_media_element(self, NodeId::from_handle(node))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Selectors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum SimpleSelector {
    Universal,
    Tag(String),
    Id(String),
    Class(String),
    Attribute { name: String, value: Option<String> },
}

/// A parsed selector list: `a, b c`, compounds of `tag#id.class[attr=value]`
/// joined by the descendant combinator
#[derive(Clone, Debug, PartialEq)]
pub struct Selector {
    alternatives: Vec<Vec<Vec<SimpleSelector>>>,
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '-' || c == '_')(input)
}

fn attribute_value(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
        take_while1(|c: char| c != ']' && !c.is_whitespace()),
    ))(input)
}

fn attribute_selector(input: &str) -> IResult<&str, SimpleSelector> {
    map(
        delimited(
            char('['),
            pair(
                delimited(multispace0, identifier, multispace0),
                opt(preceded(tuple((char('='), multispace0)), attribute_value)),
            ),
            preceded(multispace0, char(']')),
        ),
        |(name, value)| SimpleSelector::Attribute {
            name: name.to_string(),
            value: value.map(String::from),
        },
    )(input)
}

fn simple_selector(input: &str) -> IResult<&str, SimpleSelector> {
    alt((
        map(preceded(char('#'), identifier), |id| {
            SimpleSelector::Id(id.to_string())
        }),
        map(preceded(char('.'), identifier), |class| {
            SimpleSelector::Class(class.to_string())
        }),
        attribute_selector,
        value(SimpleSelector::Universal, char('*')),
        map(identifier, |tag| SimpleSelector::Tag(tag.to_ascii_lowercase())),
    ))(input)
}

fn compound_selector(input: &str) -> IResult<&str, Vec<SimpleSelector>> {
    many1(simple_selector)(input)
}

fn complex_selector(input: &str) -> IResult<&str, Vec<Vec<SimpleSelector>>> {
    separated_list1(multispace1, compound_selector)(input)
}

fn selector_list(input: &str) -> IResult<&str, Vec<Vec<Vec<SimpleSelector>>>> {
    separated_list1(
        delimited(multispace0, char(','), multispace0),
        complex_selector,
    )(input)
}

impl Selector {
    /// Parse a selector; `None` if it is malformed or unsupported
    pub fn parse(input: &str) -> Option<Self> {
        all_consuming(delimited(multispace0, selector_list, multispace0))(input)
            .ok()
            .map(|(_, alternatives)| Selector { alternatives })
    }

    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        self.alternatives
            .iter()
            .any(|complex| matches_complex(doc, node, complex))
    }
}

fn matches_simple(node: &Node, simple: &SimpleSelector) -> bool {
    match simple {
        SimpleSelector::Universal => true,
        SimpleSelector::Tag(tag) => node.tag == *tag,
        SimpleSelector::Id(id) => node.attributes.get("id") == Some(id),
        SimpleSelector::Class(class) => node
            .attributes
            .get("class")
            .map(|c| c.split_whitespace().any(|c| c == class))
            .unwrap_or(false),
        SimpleSelector::Attribute { name, value } => match (node.attributes.get(name), value) {
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
            (None, _) => false,
        },
    }
}

fn matches_compound(doc: &Document, node: NodeId, compound: &[SimpleSelector]) -> bool {
    doc.node(node)
        .map(|n| compound.iter().all(|s| matches_simple(n, s)))
        .unwrap_or(false)
}

fn matches_complex(doc: &Document, node: NodeId, complex: &[Vec<SimpleSelector>]) -> bool {
    let Some((last, ancestors)) = complex.split_last() else {
        return false;
    };
    if !matches_compound(doc, node, last) {
        return false;
    }
    let mut current = doc.parent(node);
    for compound in ancestors.iter().rev() {
        loop {
            let Some(candidate) = current else {
                return false;
            };
            current = doc.parent(candidate);
            if matches_compound(doc, candidate, compound) {
                break;
            }
        }
    }
    true
}
