// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The live, shared device tree.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

mod node;
mod property;
mod store;

pub use node::{Node, NodeId};
pub(crate) use node::ReleaseQueue;
pub use property::{Property, SENSITIVE_PREFIX, is_available};
pub(crate) use store::TreeState;

use crate::config::{LiveTreeConfig, ReleasePolicy};
use crate::error::{Error, ErrorKind, Result};
use crate::model::{DeviceTree, DeviceTreeNode};
use crate::notifier::{NotifierChain, NotifierId, ReconfigEvent, ReconfigObserver, Veto};
use crate::transaction::Transaction;

#[derive(Debug)]
struct Shared {
    state: Mutex<TreeState>,
    releases: Arc<ReleaseQueue>,
    notifiers: NotifierChain,
    transactions: Mutex<()>,
}

/// A live device tree that can be read and edited concurrently.
///
/// `LiveTree` is a cheap, clonable handle: all clones refer to the same tree.
/// Structural edits go through a [`Transaction`] (or the one-shot helpers
/// such as [`add_property`](Self::add_property), which run a single-entry
/// transaction), so that registered observers can veto them and so that
/// they can be reverted.
///
/// # Examples
///
/// ```
/// use live_device_tree::{LiveTree, Property};
///
/// let tree = LiveTree::new();
/// let root = tree.root();
/// let uart = tree.create_node(&root, "uart@1000", None, 0).unwrap();
/// tree.attach_node(&uart).unwrap();
/// tree.add_property(&uart, Property::new("compatible", "ns16550a\0"))
///     .unwrap();
///
/// assert_eq!(tree.find_node_by_path("/uart@1000"), Some(uart.clone()));
/// assert!(tree.is_available(&uart));
/// ```
#[derive(Debug, Clone)]
pub struct LiveTree {
    shared: Arc<Shared>,
}

impl Default for LiveTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveTree {
    /// Creates a tree containing only an empty root node, using the default
    /// configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LiveTreeConfig::new())
    }

    /// Creates a tree containing only an empty root node.
    #[must_use]
    pub fn with_config(config: LiveTreeConfig) -> Self {
        let releases = Arc::new(ReleaseQueue::default());
        let state = TreeState::new(config.policy(), releases.clone(), None, 0);
        Self::from_state(state, releases)
    }

    /// Builds a live tree from a description of its initial contents.
    ///
    /// Phandles are taken from the `phandle` (or `linux,phandle`) property
    /// of each node and node types from `device_type`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyExists`] if two nodes share a phandle, or
    /// [`ErrorKind::InvalidArgument`] if a phandle is not a single cell.
    pub fn from_model(tree: &DeviceTree, config: LiveTreeConfig) -> Result<Self> {
        let releases = Arc::new(ReleaseQueue::default());
        let state = TreeState::from_model(tree.root(), config.policy(), releases.clone())?;
        Ok(Self::from_state(state, releases))
    }

    fn from_state(state: TreeState, releases: Arc<ReleaseQueue>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                releases,
                notifiers: NotifierChain::default(),
                transactions: Mutex::new(()),
            }),
        }
    }

    /// Takes the structural lock, releasing any nodes dropped since it was
    /// last taken.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TreeState> {
        let mut state = self.shared.state.lock();
        state.reap();
        state
    }

    /// Serializes applies and reverts of transactions on this tree.
    ///
    /// Fails rather than spins if one is already running, which is also
    /// what an observer editing the tree from a notification would hit.
    pub(crate) fn serialize(&self) -> Result<MutexGuard<'_, ()>> {
        self.shared
            .transactions
            .try_lock()
            .ok_or_else(|| Error::new(ErrorKind::Busy, "transaction"))
    }

    pub(crate) fn notify(&self, event: &ReconfigEvent<'_>) -> core::result::Result<(), Veto> {
        self.shared.notifiers.notify(event)
    }

    pub(crate) fn check_owned(&self, node: &Node) -> Result<()> {
        if self.owns(node) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::InvalidArgument, node.full_path()))
        }
    }

    /// Returns `true` if `node` was created by this tree.
    #[must_use]
    pub fn owns(&self, node: &Node) -> bool {
        node.is_from(&self.shared.releases)
    }

    /// Returns the policy applied to detached nodes whose last handle is
    /// dropped.
    #[must_use]
    pub fn release_policy(&self) -> ReleasePolicy {
        self.lock().policy()
    }

    /// Returns the root node.
    #[must_use]
    pub fn root(&self) -> Node {
        self.lock().root()
    }

    /// Returns the number of attached nodes, including the root.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.lock().attached_count()
    }

    /// Allocates a new, detached node meant to be attached under `parent`.
    ///
    /// The node's full path is derived from the parent's. It only becomes
    /// part of the tree once attached, e.g. with
    /// [`attach_node`](Self::attach_node).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if `parent` belongs to another
    /// tree or `name` is empty or contains a `/`.
    pub fn create_node(
        &self,
        parent: &Node,
        name: &str,
        node_type: Option<&str>,
        phandle: u32,
    ) -> Result<Node> {
        self.check_owned(parent)?;
        self.lock()
            .create_node(parent, name, node_type.map(ToOwned::to_owned), phandle)
    }

    /// Finds an attached node by its absolute path.
    #[must_use]
    pub fn find_node_by_path(&self, path: &str) -> Option<Node> {
        self.lock().find_by_path(path)
    }

    /// Finds an attached node by its phandle.
    #[must_use]
    pub fn find_node_by_phandle(&self, phandle: u32) -> Option<Node> {
        self.lock().find_by_phandle(phandle)
    }

    /// Returns the parent of `node`, or `None` for the root.
    #[must_use]
    pub fn parent(&self, node: &Node) -> Option<Node> {
        self.lock().parent(node)
    }

    /// Returns the children of `node`, in attach order.
    #[must_use]
    pub fn children(&self, node: &Node) -> Vec<Node> {
        self.lock().children(node)
    }

    /// Returns the child of `node` with the given name (including any
    /// `@unit-address` suffix).
    #[must_use]
    pub fn child_by_name(&self, node: &Node, name: &str) -> Option<Node> {
        self.lock().child(node, name)
    }

    /// Returns the live property of `node` with the given name.
    #[must_use]
    pub fn property(&self, node: &Node, name: &str) -> Option<Arc<Property>> {
        self.lock().property(node, name)
    }

    /// Returns the live properties of `node`, in insertion order.
    #[must_use]
    pub fn properties(&self, node: &Node) -> Vec<Arc<Property>> {
        self.lock().properties(node)
    }

    /// Returns the properties retired from `node` by removals and updates.
    #[must_use]
    pub fn dead_properties(&self, node: &Node) -> Vec<Arc<Property>> {
        self.lock().dead_properties(node)
    }

    /// Returns `true` if `node` is currently reachable from the root.
    #[must_use]
    pub fn is_attached(&self, node: &Node) -> bool {
        self.owns(node) && self.lock().is_attached(node.id())
    }

    /// Returns `true` if `node` should have a bound device, according to
    /// [`is_available`].
    #[must_use]
    pub fn is_available(&self, node: &Node) -> bool {
        self.owns(node) && self.lock().is_available(node.id())
    }

    /// Reads a property of `node` as a big-endian `u32` cell.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if the property does not exist, or
    /// [`ErrorKind::InvalidArgument`] if it is not a single cell.
    pub fn read_u32(&self, node: &Node, name: &str) -> Result<u32> {
        self.property(node, name)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, node.full_path()))?
            .as_u32()
    }

    /// Reads a property of `node` as a string.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if the property does not exist, or
    /// [`ErrorKind::InvalidArgument`] if it is not valid UTF-8.
    pub fn read_string(&self, node: &Node, name: &str) -> Result<String> {
        let property = self
            .property(node, name)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, node.full_path()))?;
        property.as_str().map(ToOwned::to_owned)
    }

    /// Copies the attached tree into an owned [`DeviceTree`].
    #[must_use]
    pub fn snapshot(&self) -> DeviceTree {
        let state = self.lock();
        let root = state
            .snapshot(state.root().id())
            .unwrap_or_else(|| DeviceTreeNode::new(""));
        DeviceTree::new(root)
    }

    /// Copies `node` and its subtree into an owned [`DeviceTreeNode`].
    #[must_use]
    pub fn snapshot_node(&self, node: &Node) -> Option<DeviceTreeNode> {
        if !self.owns(node) {
            return None;
        }
        self.lock().snapshot(node.id())
    }

    /// Returns the nodes kept in the graveyard under
    /// [`ReleasePolicy::Keep`], oldest first.
    #[must_use]
    pub fn graveyard(&self) -> Vec<DeviceTreeNode> {
        self.lock().graveyard()
    }

    /// Registers an observer to be told about every change to this tree.
    ///
    /// Observers are called in registration order, while the transaction
    /// making the change holds the tree's transaction lock. An observer that
    /// edits the tree gets [`ErrorKind::Busy`] back.
    pub fn register_notifier(&self, observer: impl ReconfigObserver + 'static) -> NotifierId {
        self.shared.notifiers.register(Arc::new(observer))
    }

    /// Unregisters an observer. Returns `false` if it was not registered.
    pub fn unregister_notifier(&self, id: NotifierId) -> bool {
        self.shared.notifiers.unregister(id)
    }

    /// Creates a new, empty transaction on this tree.
    #[must_use]
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self)
    }

    fn run_one(&self, stage: impl FnOnce(&mut Transaction) -> Result<()>) -> Result<()> {
        let mut tx = self.transaction();
        tx.start()?;
        stage(&mut tx)?;
        tx.apply()?;
        tx.commit()
    }

    /// Attaches a node created with [`create_node`](Self::create_node).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the node is already
    /// attached or is the root, [`ErrorKind::AlreadyExists`] if its parent
    /// already has a child of the same name or its phandle is taken, and
    /// [`ErrorKind::Vetoed`] if an observer rejects the change.
    pub fn attach_node(&self, node: &Node) -> Result<()> {
        self.run_one(|tx| tx.attach_node(node))
    }

    /// Detaches a node (and its subtree) from the tree.
    ///
    /// Outstanding handles stay valid.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] for the root or a node that is
    /// not attached, and [`ErrorKind::Vetoed`] if an observer rejects the
    /// change.
    pub fn detach_node(&self, node: &Node) -> Result<()> {
        self.run_one(|tx| tx.detach_node(node))
    }

    /// Adds a property to `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyExists`] if the node already has a
    /// property of the same name, and [`ErrorKind::Vetoed`] if an observer
    /// rejects the change.
    pub fn add_property(&self, node: &Node, property: impl Into<Arc<Property>>) -> Result<()> {
        let property = property.into();
        self.run_one(|tx| tx.add_property(node, property))
    }

    /// Removes the property called `name` from `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if there is no such property, and
    /// [`ErrorKind::Vetoed`] if an observer rejects the change.
    pub fn remove_property(&self, node: &Node, name: &str) -> Result<()> {
        self.run_one(|tx| tx.remove_property(node, name))
    }

    /// Replaces the same-named property of `node`, or adds it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Vetoed`] if an observer rejects the change, or
    /// [`ErrorKind::Conflict`] if the property changed concurrently.
    pub fn update_property(&self, node: &Node, property: impl Into<Arc<Property>>) -> Result<()> {
        let property = property.into();
        self.run_one(|tx| tx.update_property(node, property))
    }
}
