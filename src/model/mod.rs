// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An owned, detached description of a device tree.
//!
//! This module provides the [`DeviceTree`], [`DeviceTreeNode`], and
//! [`DeviceTreeProperty`] structs. They are plain values with no reference
//! counting or locking: they describe the initial contents of a
//! [`LiveTree`](crate::LiveTree), the contents of an overlay bundle, and the
//! result of taking a snapshot of a live tree.

use core::fmt;

use indexmap::IndexMap;
use twox_hash::xxhash64;

mod node;
mod property;
pub use node::{DeviceTreeNode, DeviceTreeNodeBuilder};
pub use property::DeviceTreeProperty;

pub(crate) type FastMap<K, V> = IndexMap<K, V, xxhash64::State>;

pub(crate) fn fast_map<K, V>() -> FastMap<K, V> {
    IndexMap::with_hasher(hash_state())
}

pub(crate) fn hash_state() -> xxhash64::State {
    xxhash64::State::with_seed(0xdead_cafe)
}

/// An owned description of a whole device tree.
///
/// # Examples
///
/// ```
/// # use live_device_tree::model::{DeviceTree, DeviceTreeNode};
/// let root = DeviceTreeNode::new("");
/// let mut tree = DeviceTree::new(root);
/// tree.root_mut().add_child(DeviceTreeNode::new("child"));
/// assert!(tree.find_node("/child").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTree {
    root: DeviceTreeNode,
}

impl DeviceTree {
    /// Creates a new `DeviceTree` with the given root node.
    #[must_use]
    pub fn new(root: DeviceTreeNode) -> Self {
        Self { root }
    }

    /// Returns a reference to the root node of the device tree.
    #[must_use]
    pub fn root(&self) -> &DeviceTreeNode {
        &self.root
    }

    /// Returns a mutable reference to the root node of the device tree.
    pub fn root_mut(&mut self) -> &mut DeviceTreeNode {
        &mut self.root
    }

    /// Consumes the tree and returns its root node.
    #[must_use]
    pub fn into_root(self) -> DeviceTreeNode {
        self.root
    }

    /// Finds a node by its absolute path.
    ///
    /// # Performance
    ///
    /// Child lookup is a constant-time operation, so this is linear in the
    /// number of path segments.
    #[must_use]
    pub fn find_node(&self, path: &str) -> Option<&DeviceTreeNode> {
        let rest = path.strip_prefix('/')?;
        let mut current_node = &self.root;
        for component in rest.split('/').filter(|s| !s.is_empty()) {
            current_node = current_node.child(component)?;
        }
        Some(current_node)
    }

    /// Finds a node by its absolute path and returns a mutable reference to
    /// it.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::model::{DeviceTree, DeviceTreeNode};
    /// let mut tree = DeviceTree::new(DeviceTreeNode::new(""));
    /// tree.root_mut().add_child(DeviceTreeNode::new("child"));
    /// let child = tree.find_node_mut("/child").unwrap();
    /// assert_eq!(child.name(), "child");
    /// ```
    pub fn find_node_mut(&mut self, path: &str) -> Option<&mut DeviceTreeNode> {
        let rest = path.strip_prefix('/')?;
        let mut current_node = &mut self.root;
        for component in rest.split('/').filter(|s| !s.is_empty()) {
            current_node = current_node.child_mut(component)?;
        }
        Some(current_node)
    }
}

impl From<DeviceTreeNode> for DeviceTree {
    fn from(root: DeviceTreeNode) -> Self {
        Self::new(root)
    }
}

impl fmt::Display for DeviceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "/dts-v1/;")?;
        writeln!(f)?;
        self.root.fmt_recursive(f, 0, true)
    }
}
