// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};

use spin::Mutex;

/// A stable identifier of a node within one [`LiveTree`](crate::LiveTree).
///
/// Identifiers are never reused by the tree that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value of this identifier.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node IDs whose last handle was dropped, waiting to be reaped by the tree.
///
/// Handles may be dropped while the structural lock is held, so this queue
/// has its own lock and the tree drains it the next time it takes the
/// structural lock.
#[derive(Debug, Default)]
pub(crate) struct ReleaseQueue {
    pending: Mutex<Vec<NodeId>>,
}

impl ReleaseQueue {
    fn push(&self, id: NodeId) {
        self.pending.lock().push(id);
    }

    pub(crate) fn take(&self) -> Vec<NodeId> {
        core::mem::take(&mut *self.pending.lock())
    }
}

struct NodeCell {
    id: NodeId,
    parent: Option<NodeId>,
    name: String,
    full_path: String,
    node_type: Option<String>,
    phandle: u32,
    releases: Arc<ReleaseQueue>,
}

impl Drop for NodeCell {
    fn drop(&mut self) {
        self.releases.push(self.id);
    }
}

/// A reference-counted handle to a node of a [`LiveTree`](crate::LiveTree).
///
/// Cloning a handle acquires a reference and dropping it releases one. The
/// tree itself holds a reference to every attached node, so only detached
/// nodes can lose their last reference; the tree then moves them to its
/// graveyard or frees them, depending on its
/// [`ReleasePolicy`](crate::ReleasePolicy).
///
/// The identity fields (name, path, type, phandle and parent) never change.
/// Everything else is read through the tree.
#[derive(Clone)]
pub struct Node {
    cell: Arc<NodeCell>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        parent: Option<NodeId>,
        name: String,
        full_path: String,
        node_type: Option<String>,
        phandle: u32,
        releases: Arc<ReleaseQueue>,
    ) -> Self {
        Self {
            cell: Arc::new(NodeCell {
                id,
                parent,
                name,
                full_path,
                node_type,
                phandle,
                releases,
            }),
        }
    }

    /// Returns the identifier of this node.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.cell.id
    }

    /// Returns the identifier of the node this node is (or was created to be)
    /// attached under, or `None` for the root.
    #[must_use]
    pub fn parent_id(&self) -> Option<NodeId> {
        self.cell.parent
    }

    /// Returns the name of this node, including any `@unit-address` suffix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Returns the absolute path of this node.
    #[must_use]
    pub fn full_path(&self) -> &str {
        &self.cell.full_path
    }

    /// Returns the type of this node (its `device_type`), if any.
    #[must_use]
    pub fn node_type(&self) -> Option<&str> {
        self.cell.node_type.as_deref()
    }

    /// Returns the phandle of this node, or 0 if it has none.
    #[must_use]
    pub fn phandle(&self) -> u32 {
        self.cell.phandle
    }

    /// Returns the number of live references to this node, including the one
    /// held by the tree while the node is attached.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }

    pub(crate) fn is_from(&self, releases: &Arc<ReleaseQueue>) -> bool {
        Arc::ptr_eq(&self.cell.releases, releases)
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.cell))
    }
}

/// A non-owning reference to a node, as kept by the node store.
#[derive(Clone)]
pub(crate) struct WeakNode(Weak<NodeCell>);

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(|cell| Node { cell })
    }
}

impl fmt::Debug for WeakNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakNode")
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cell.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.cell.id)
            .field("full_path", &self.cell.full_path)
            .field("phandle", &self.cell.phandle)
            .finish_non_exhaustive()
    }
}
