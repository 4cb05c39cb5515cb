// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The node store: the arena of node data behind the structural lock.

use alloc::borrow::ToOwned;
use alloc::collections::btree_map::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use indexmap::IndexSet;
use log::{debug, error};
use twox_hash::xxhash64;

use super::node::{Node, NodeId, ReleaseQueue, WeakNode};
use super::property::{Property, is_available};
use crate::config::ReleasePolicy;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{DeviceTreeNode, DeviceTreeProperty, FastMap, fast_map, hash_state};

/// Mutable per-node state, only accessed under the structural lock.
///
/// The arena keeps a weak handle only: strong handles live in the parent's
/// child map (and, for the root, in [`TreeState`] itself).
#[derive(Debug)]
struct NodeData {
    handle: WeakNode,
    name: String,
    parent: Option<NodeId>,
    children: FastMap<String, Node>,
    properties: FastMap<String, Arc<Property>>,
    dead_properties: Vec<Arc<Property>>,
    detached: bool,
}

impl NodeData {
    fn new(node: &Node, detached: bool) -> Self {
        Self {
            handle: node.downgrade(),
            name: node.name().to_owned(),
            parent: node.parent_id(),
            children: fast_map(),
            properties: fast_map(),
            dead_properties: Vec::new(),
            detached,
        }
    }

    fn retire(&mut self, property: Arc<Property>) {
        if !self
            .dead_properties
            .iter()
            .any(|dead| Arc::ptr_eq(dead, &property))
        {
            self.dead_properties.push(property);
        }
    }

    fn revive(&mut self, property: &Arc<Property>) -> bool {
        let position = self
            .dead_properties
            .iter()
            .position(|dead| Arc::ptr_eq(dead, property));
        match position {
            Some(index) => {
                self.dead_properties.remove(index);
                true
            }
            None => false,
        }
    }

    fn insert_property(&mut self, property: &Arc<Property>, position: Option<usize>) {
        let name = property.name().to_owned();
        match position {
            Some(index) if index <= self.properties.len() => {
                self.properties.shift_insert(index, name, property.clone());
            }
            _ => {
                self.properties.insert(name, property.clone());
            }
        }
    }
}

/// The whole live tree, guarded by the structural lock.
#[derive(Debug)]
pub(crate) struct TreeState {
    root: Node,
    nodes: BTreeMap<NodeId, NodeData>,
    attached: IndexSet<NodeId, xxhash64::State>,
    phandles: FastMap<u32, NodeId>,
    graveyard: Vec<NodeId>,
    next_id: u64,
    policy: ReleasePolicy,
    releases: Arc<ReleaseQueue>,
}

fn property_subject(node: &Node, name: &str) -> String {
    format!("{}:{}", node.full_path(), name)
}

fn phandle_of(node: &DeviceTreeNode) -> Result<u32> {
    node.property("phandle")
        .or_else(|| node.property("linux,phandle"))
        .map_or(Ok(0), DeviceTreeProperty::as_u32)
}

fn type_of(node: &DeviceTreeNode) -> Option<String> {
    node.property("device_type")
        .and_then(|prop| prop.as_str().ok())
        .map(ToOwned::to_owned)
}

impl TreeState {
    /// Creates a store holding only an empty root node.
    pub(crate) fn new(
        policy: ReleasePolicy,
        releases: Arc<ReleaseQueue>,
        root_type: Option<String>,
        root_phandle: u32,
    ) -> Self {
        let root = Node::new(
            NodeId::new(0),
            None,
            String::new(),
            "/".to_owned(),
            root_type,
            root_phandle,
            releases.clone(),
        );
        let mut nodes = BTreeMap::new();
        nodes.insert(root.id(), NodeData::new(&root, false));
        let mut attached = IndexSet::with_hasher(hash_state());
        attached.insert(root.id());
        let mut phandles = fast_map();
        if root_phandle != 0 {
            phandles.insert(root_phandle, root.id());
        }

        Self {
            root,
            nodes,
            attached,
            phandles,
            graveyard: Vec::new(),
            next_id: 1,
            policy,
            releases,
        }
    }

    /// Builds the store from a description of the initial tree.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyExists`] if two nodes share a phandle and
    /// [`ErrorKind::InvalidArgument`] if a phandle is malformed.
    pub(crate) fn from_model(
        root: &DeviceTreeNode,
        policy: ReleasePolicy,
        releases: Arc<ReleaseQueue>,
    ) -> Result<Self> {
        let mut state = Self::new(policy, releases, type_of(root), phandle_of(root)?);
        let root_node = state.root();
        state.populate(&root_node, root)?;
        Ok(state)
    }

    fn populate(&mut self, node: &Node, model: &DeviceTreeNode) -> Result<()> {
        for property in model.properties() {
            let property = Arc::new(Property::from(property.clone()));
            self.add_property(node, &property, None)?;
        }
        for child in model.children() {
            let child_node =
                self.create_node(node, child.name(), type_of(child), phandle_of(child)?)?;
            self.attach(&child_node, None)?;
            self.populate(&child_node, child)?;
        }
        Ok(())
    }

    pub(crate) fn policy(&self) -> ReleasePolicy {
        self.policy
    }

    pub(crate) fn root(&self) -> Node {
        self.root.clone()
    }

    /// Drains the release queue, releasing every node whose last handle was
    /// dropped.
    pub(crate) fn reap(&mut self) {
        loop {
            let pending = self.releases.take();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                self.release(id);
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let Some(data) = self.nodes.get_mut(&id) else {
            debug!("Ignoring release of unknown node {id}");
            return;
        };
        if !data.detached {
            error!("Released node {id} is still attached, keeping it");
            return;
        }
        match self.policy {
            ReleasePolicy::Keep => {
                debug!("Moving released node {id} ({}) to the graveyard", data.name);
                data.children.clear();
                self.graveyard.push(id);
            }
            ReleasePolicy::Free => {
                debug!("Freeing released node {id}");
                self.nodes.remove(&id);
            }
        }
    }

    /// Allocates a new detached node to be attached under `parent`.
    pub(crate) fn create_node(
        &mut self,
        parent: &Node,
        name: &str,
        node_type: Option<String>,
        phandle: u32,
    ) -> Result<Node> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("{}/{}", parent.full_path(), name),
            ));
        }
        if !self.nodes.contains_key(&parent.id()) {
            return Err(Error::new(ErrorKind::NotFound, parent.full_path()));
        }
        let full_path = if parent.full_path() == "/" {
            format!("/{name}")
        } else {
            format!("{}/{}", parent.full_path(), name)
        };
        let id = NodeId::new(self.next_id);
        self.next_id += 1;
        let node = Node::new(
            id,
            Some(parent.id()),
            name.to_owned(),
            full_path,
            node_type,
            phandle,
            self.releases.clone(),
        );
        self.nodes.insert(id, NodeData::new(&node, true));
        Ok(node)
    }

    fn data(&self, node: &Node) -> Result<&NodeData> {
        self.nodes
            .get(&node.id())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, node.full_path()))
    }

    fn data_mut(&mut self, node: &Node) -> Result<&mut NodeData> {
        self.nodes
            .get_mut(&node.id())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, node.full_path()))
    }

    /// Returns the IDs of `id` and all of its descendants.
    pub(crate) fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            ids.push(id);
            if let Some(data) = self.nodes.get(&id) {
                stack.extend(data.children.values().rev().map(Node::id));
            }
        }
        ids
    }

    /// Returns `true` if `ancestor` is `id` or one of its (recorded)
    /// ancestors.
    pub(crate) fn is_ancestor_or_self(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|data| data.parent);
        }
        false
    }

    /// Links a detached node (and its subtree) into its recorded parent.
    ///
    /// `position` restores a previous place in the parent's child list.
    pub(crate) fn attach(&mut self, node: &Node, position: Option<usize>) -> Result<()> {
        let data = self.data(node)?;
        if !data.detached {
            return Err(Error::new(ErrorKind::InvalidArgument, node.full_path()));
        }
        let Some(parent_id) = data.parent else {
            return Err(Error::new(ErrorKind::InvalidArgument, node.full_path()));
        };
        let parent = self
            .nodes
            .get(&parent_id)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, node.full_path()))?;
        if parent.detached {
            return Err(Error::new(ErrorKind::InvalidArgument, node.full_path()));
        }
        if parent.children.contains_key(node.name()) {
            return Err(Error::new(ErrorKind::AlreadyExists, node.full_path()));
        }

        let subtree = self.subtree_ids(node.id());
        let mut new_phandles = Vec::new();
        for id in &subtree {
            let Some(handle) = self.nodes.get(id).and_then(|data| data.handle.upgrade()) else {
                continue;
            };
            let phandle = handle.phandle();
            if phandle != 0 {
                if self.phandles.contains_key(&phandle) || new_phandles.contains(&phandle) {
                    return Err(Error::new(ErrorKind::AlreadyExists, handle.full_path()));
                }
                new_phandles.push(phandle);
            }
        }

        let parent = self
            .nodes
            .get_mut(&parent_id)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, node.full_path()))?;
        let name = node.name().to_owned();
        match position {
            Some(index) if index <= parent.children.len() => {
                parent.children.shift_insert(index, name, node.clone());
            }
            _ => {
                parent.children.insert(name, node.clone());
            }
        }

        for id in subtree {
            if let Some(data) = self.nodes.get_mut(&id) {
                data.detached = false;
                if let Some(handle) = data.handle.upgrade()
                    && handle.phandle() != 0
                {
                    self.phandles.insert(handle.phandle(), id);
                }
            }
            self.attached.insert(id);
        }
        Ok(())
    }

    /// Unlinks an attached node (and its subtree) from the tree, returning
    /// its former position in the parent's child list.
    pub(crate) fn detach(&mut self, node: &Node) -> Result<usize> {
        let data = self.data(node)?;
        if data.detached {
            return Err(Error::new(ErrorKind::InvalidArgument, node.full_path()));
        }
        let Some(parent_id) = data.parent else {
            return Err(Error::new(ErrorKind::InvalidArgument, node.full_path()));
        };
        let parent = self
            .nodes
            .get_mut(&parent_id)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, node.full_path()))?;
        let Some((index, _, _handle)) = parent.children.shift_remove_full(node.name()) else {
            return Err(Error::new(ErrorKind::InternalInconsistency, node.full_path()));
        };

        for id in self.subtree_ids(node.id()) {
            if let Some(data) = self.nodes.get_mut(&id) {
                data.detached = true;
            }
            self.attached.shift_remove(&id);
            self.phandles.retain(|_, owner| *owner != id);
        }
        Ok(index)
    }

    pub(crate) fn add_property(
        &mut self,
        node: &Node,
        property: &Arc<Property>,
        position: Option<usize>,
    ) -> Result<()> {
        let data = self.data_mut(node)?;
        if data.properties.contains_key(property.name()) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                property_subject(node, property.name()),
            ));
        }
        data.revive(property);
        data.insert_property(property, position);
        Ok(())
    }

    /// Removes exactly `property` from the node, retiring it to the dead
    /// list, and returns its former position.
    pub(crate) fn remove_property(
        &mut self,
        node: &Node,
        property: &Arc<Property>,
    ) -> Result<usize> {
        let data = self.data_mut(node)?;
        let Some((index, _, current)) = data.properties.get_full(property.name()) else {
            return Err(Error::new(
                ErrorKind::NotFound,
                property_subject(node, property.name()),
            ));
        };
        if !Arc::ptr_eq(current, property) {
            return Err(Error::new(
                ErrorKind::Conflict { blocking: None },
                property_subject(node, property.name()),
            ));
        }
        if let Some((_, removed)) = data.properties.shift_remove_index(index) {
            data.retire(removed);
        }
        Ok(index)
    }

    /// Replaces `expected` (or nothing) with `property`, retiring the
    /// replaced instance to the dead list.
    pub(crate) fn update_property(
        &mut self,
        node: &Node,
        property: &Arc<Property>,
        expected: Option<&Arc<Property>>,
    ) -> Result<()> {
        let data = self.data_mut(node)?;
        let matches = match (data.properties.get(property.name()), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            _ => false,
        };
        if !matches {
            return Err(Error::new(
                ErrorKind::Conflict { blocking: None },
                property_subject(node, property.name()),
            ));
        }
        data.revive(property);
        if let Some(old) = data
            .properties
            .insert(property.name().to_owned(), property.clone())
        {
            data.retire(old);
        }
        Ok(())
    }

    /// Brings a removed property back from the dead list.
    pub(crate) fn restore_property(
        &mut self,
        node: &Node,
        property: &Arc<Property>,
        position: Option<usize>,
    ) -> Result<()> {
        let data = self.data(node)?;
        if !data
            .dead_properties
            .iter()
            .any(|dead| Arc::ptr_eq(dead, property))
        {
            return Err(Error::new(
                ErrorKind::InternalInconsistency,
                property_subject(node, property.name()),
            ));
        }
        self.add_property(node, property, position)
    }

    /// Undoes an update of `old` to `property`, bringing `old` back from the
    /// dead list. An update that added the property is undone by removing
    /// it.
    pub(crate) fn restore_update(
        &mut self,
        node: &Node,
        property: &Arc<Property>,
        old: Option<&Arc<Property>>,
    ) -> Result<()> {
        let Some(old) = old else {
            self.remove_property(node, property)?;
            return Ok(());
        };
        let data = self.data(node)?;
        if !data.dead_properties.iter().any(|dead| Arc::ptr_eq(dead, old)) {
            return Err(Error::new(
                ErrorKind::InternalInconsistency,
                property_subject(node, old.name()),
            ));
        }
        self.update_property(node, old, Some(property))
    }

    pub(crate) fn find_by_path(&self, path: &str) -> Option<Node> {
        let rest = path.strip_prefix('/')?;
        let mut current = self.root.clone();
        for component in rest.split('/').filter(|s| !s.is_empty()) {
            current = self.nodes.get(&current.id())?.children.get(component)?.clone();
        }
        Some(current)
    }

    pub(crate) fn find_by_phandle(&self, phandle: u32) -> Option<Node> {
        if phandle == 0 {
            return None;
        }
        let id = self.phandles.get(&phandle)?;
        self.nodes.get(id)?.handle.upgrade()
    }

    pub(crate) fn parent(&self, node: &Node) -> Option<Node> {
        let parent = node.parent_id()?;
        self.nodes.get(&parent)?.handle.upgrade()
    }

    pub(crate) fn children(&self, node: &Node) -> Vec<Node> {
        self.nodes
            .get(&node.id())
            .map(|data| data.children.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn child(&self, node: &Node, name: &str) -> Option<Node> {
        self.nodes.get(&node.id())?.children.get(name).cloned()
    }

    pub(crate) fn property(&self, node: &Node, name: &str) -> Option<Arc<Property>> {
        self.nodes.get(&node.id())?.properties.get(name).cloned()
    }

    pub(crate) fn properties(&self, node: &Node) -> Vec<Arc<Property>> {
        self.nodes
            .get(&node.id())
            .map(|data| data.properties.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn dead_properties(&self, node: &Node) -> Vec<Arc<Property>> {
        self.nodes
            .get(&node.id())
            .map(|data| data.dead_properties.clone())
            .unwrap_or_default()
    }

    pub(crate) fn is_attached(&self, id: NodeId) -> bool {
        self.attached.contains(&id)
    }

    pub(crate) fn attached_count(&self) -> usize {
        self.attached.len()
    }

    pub(crate) fn is_available(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|data| {
            is_available(
                data.properties.get("compatible").map(Arc::as_ref),
                data.properties.get("status").map(Arc::as_ref),
            )
        })
    }

    /// Returns `true` if the node is attached and available, i.e. would have
    /// a device bound to it.
    pub(crate) fn has_device(&self, id: NodeId) -> bool {
        self.is_attached(id) && self.is_available(id)
    }

    /// Copies the node and its subtree into an owned description.
    pub(crate) fn snapshot(&self, id: NodeId) -> Option<DeviceTreeNode> {
        let data = self.nodes.get(&id)?;
        let mut node = DeviceTreeNode::new(data.name.as_str());
        for property in data.properties.values() {
            node.add_property(DeviceTreeProperty::from(property.as_ref()));
        }
        for child in data.children.values() {
            if let Some(child) = self.snapshot(child.id()) {
                node.add_child(child);
            }
        }
        Some(node)
    }

    /// Returns snapshots of the nodes kept in the graveyard, oldest first.
    pub(crate) fn graveyard(&self) -> Vec<DeviceTreeNode> {
        self.graveyard
            .iter()
            .filter_map(|id| self.snapshot(*id))
            .collect()
    }
}
