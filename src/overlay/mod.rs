// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Overlays: patches merged into a live tree through a transaction.
//!
//! An overlay bundle is a [`DeviceTree`] whose root children are fragments.
//! Each fragment names its target with a `target` phandle or a `target-path`
//! and carries the patch content in an `__overlay__` child:
//!
//! ```dts
//! / {
//!     fragment@0 {
//!         target-path = "/soc";
//!         __overlay__ {
//!             -old-prop;
//!             new-prop = <1>;
//!             -uart@2000 { };
//!             i2c@3000 { compatible = "vendor,i2c"; };
//!         };
//!     };
//! };
//! ```
//!
//! A leading `-` on a property or child name removes the same-named
//! property or child of the target instead of merging it.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, error};

mod registry;

pub use registry::{Overlay, OverlayId, OverlayRegistry};

use crate::error::{Error, ErrorKind, Result};
use crate::live::{LiveTree, Node, Property};
use crate::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};
use crate::transaction::{DeviceStateChange, Transaction, TransactionEntry, notify_device};

/// Name of the fragment child holding the patch content.
pub const OVERLAY_NODE: &str = "__overlay__";

/// A node whose availability an overlay changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// The node.
    pub node: Node,
    /// Whether the node was available before the overlay was applied.
    pub previous: bool,
    /// Whether the node is available with the overlay applied.
    pub current: bool,
}

/// Splits a removal marker off a node or property name.
///
/// Returns the name the marker removes, or `None` if `name` is not a
/// removal marker.
fn removal_target(name: &str) -> Option<&str> {
    name.strip_prefix('-').filter(|target| !target.is_empty())
}

fn depth_below(target: &Node, node: &Node) -> Option<usize> {
    let rest = if target.full_path() == "/" {
        node.full_path()
    } else {
        node.full_path().strip_prefix(target.full_path())?
    };
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    Some(rest.split('/').filter(|s| !s.is_empty()).count())
}

/// Stages the edits that merge `overlay` into `target`.
///
/// Properties named `name` are skipped. Other properties are added, or
/// updated if the target already has them; a `-`-prefixed property removes
/// the target's property of that name, if any. Children are matched by
/// their full name (including any `@unit-address`): a matching child is
/// merged recursively, a missing one is created and attached first, and a
/// `-`-prefixed child detaches the target's child of that name, if any.
///
/// The transaction must be in progress. On error, the caller is expected to
/// abort it.
///
/// # Errors
///
/// Returns [`ErrorKind::OutOfResources`] if a property cannot be copied,
/// [`ErrorKind::InvalidArgument`] if a new child has a malformed phandle,
/// and whatever staging returns.
pub fn apply_overlay_node(
    tx: &mut Transaction,
    target: &Node,
    overlay: &DeviceTreeNode,
) -> Result<()> {
    for property in overlay.properties() {
        let name = property.name();
        if name == "name" {
            continue;
        }
        if let Some(removed) = removal_target(name) {
            if tx.lookup_property(target, removed).is_some() {
                tx.remove_property(target, removed)?;
            }
            continue;
        }

        let copy = Property::try_copy(name, property.value())?;
        if tx.lookup_property(target, name).is_some() {
            tx.update_property(target, copy)?;
        } else {
            tx.add_property(target, copy)?;
        }
    }

    for child in overlay.children() {
        let name = child.name();
        if let Some(removed) = removal_target(name) {
            if let Some(existing) = tx.lookup_child(target, removed) {
                tx.detach_node(&existing)?;
            }
            continue;
        }

        let node = match tx.lookup_child(target, name) {
            Some(existing) => existing,
            None => {
                let phandle = child
                    .property("phandle")
                    .map_or(Ok(0), DeviceTreeProperty::as_u32)?;
                let node_type = child
                    .property("device_type")
                    .and_then(|prop| prop.as_str().ok());
                let node = tx.tree().create_node(target, name, node_type, phandle)?;
                tx.attach_node(&node)?;
                node
            }
        };
        apply_overlay_node(tx, &node, child)?;
    }
    Ok(())
}

/// One fragment of an overlay bundle, bound to its target in a live tree.
#[derive(Debug)]
pub struct OverlayInfo {
    name: String,
    target: Node,
    overlay: DeviceTreeNode,
    depth: u32,
    transaction: Transaction,
    devices: Vec<DeviceEntry>,
}

impl OverlayInfo {
    /// Binds `overlay` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if `target` belongs to another
    /// tree.
    pub fn new(tree: &LiveTree, target: Node, overlay: DeviceTreeNode) -> Result<Self> {
        tree.check_owned(&target)?;
        Ok(Self {
            name: target.full_path().to_owned(),
            target,
            overlay,
            depth: 0,
            transaction: tree.transaction(),
            devices: Vec::new(),
        })
    }

    /// Builds an `OverlayInfo` from a fragment of an overlay bundle.
    ///
    /// The target is the node whose phandle is the fragment's `target`
    /// property or, failing that, the node at its `target-path`. An optional
    /// `depth` property limits device notifications to that many levels
    /// below the target.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the fragment has no
    /// `__overlay__` child, no target, or a malformed `target`,
    /// `target-path` or `depth`, and [`ErrorKind::NotFound`] if the target
    /// does not exist.
    pub fn from_fragment(tree: &LiveTree, fragment: &DeviceTreeNode) -> Result<Self> {
        let invalid = || Error::new(ErrorKind::InvalidArgument, fragment.name());
        let overlay = fragment.child(OVERLAY_NODE).ok_or_else(invalid)?;

        let target = if let Some(target) = fragment.property("target") {
            let phandle = target.as_u32().map_err(|_e| invalid())?;
            tree.find_node_by_phandle(phandle)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, fragment.name()))?
        } else if let Some(target_path) = fragment.property("target-path") {
            let path = target_path.as_str().map_err(|_e| invalid())?;
            tree.find_node_by_path(path)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, fragment.name()))?
        } else {
            return Err(invalid());
        };

        let depth = fragment
            .property("depth")
            .map_or(Ok(0), |depth| depth.as_u32().map_err(|_e| invalid()))?;

        let mut info = Self::new(tree, target, overlay.clone())?.with_depth(depth);
        info.name = fragment.name().to_owned();
        Ok(info)
    }

    /// Limits device notifications to nodes at most `depth` levels below the
    /// target. Zero means no limit.
    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Returns the fragment name, or the target path for infos built with
    /// [`new`](Self::new).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node the overlay is merged into.
    #[must_use]
    pub fn target(&self) -> &Node {
        &self.target
    }

    /// Returns the patch content.
    #[must_use]
    pub fn overlay(&self) -> &DeviceTreeNode {
        &self.overlay
    }

    /// Returns the device notification depth limit.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Returns the edits made by the last apply, in application order.
    #[must_use]
    pub fn log(&self) -> &[TransactionEntry] {
        self.transaction.entries()
    }

    /// Returns the availability changes made by the last apply that were
    /// within the depth limit.
    #[must_use]
    pub fn device_entries(&self) -> &[DeviceEntry] {
        &self.devices
    }

    /// Returns the nodes touched by the last apply.
    pub fn touched_nodes(&self) -> impl Iterator<Item = &Node> {
        self.log().iter().map(TransactionEntry::node)
    }

    fn within_depth(&self, node: &Node) -> bool {
        if self.depth == 0 {
            return true;
        }
        let limit = usize::try_from(self.depth).unwrap_or(usize::MAX);
        depth_below(&self.target, node).is_some_and(|depth| depth <= limit)
    }

    /// Folds per-entry availability changes into one entry per node, and
    /// drops nodes that end where they started or lie beyond the depth
    /// limit.
    fn device_entries_of(&self, changes: Vec<DeviceStateChange>) -> Vec<DeviceEntry> {
        let mut devices: Vec<DeviceEntry> = Vec::new();
        for change in changes {
            match devices.iter_mut().find(|entry| entry.node == change.node) {
                Some(entry) => entry.current = change.current,
                None => devices.push(DeviceEntry {
                    node: change.node,
                    previous: change.previous,
                    current: change.current,
                }),
            }
        }
        devices.retain(|entry| entry.previous != entry.current);
        devices.retain(|entry| {
            let keep = self.within_depth(&entry.node);
            if !keep {
                debug!(
                    "Not notifying {} beyond depth {} of {}",
                    entry.node.full_path(),
                    self.depth,
                    self.target.full_path()
                );
            }
            keep
        });
        devices
    }

    /// Merges the overlay into the target as one transaction, then tells
    /// observers about every node whose availability changed.
    ///
    /// # Errors
    ///
    /// Returns the first staging or apply error; the tree is left
    /// unchanged. If the staged edits cannot be discarded either, returns
    /// [`ErrorKind::InternalInconsistency`] naming the original failure.
    pub fn apply(&mut self) -> Result<()> {
        let tx = &mut self.transaction;
        tx.start()?;
        let staged = apply_overlay_node(tx, &self.target, &self.overlay);
        if let Err(err) = staged.and_then(|()| tx.apply()) {
            error!("Failed to apply overlay {}: {err}", self.name);
            if let Err(abort_err) = tx.abort() {
                error!("Failed to abort overlay {}: {abort_err}", self.name);
                return Err(Error::new(ErrorKind::InternalInconsistency, err.subject()));
            }
            return Err(err);
        }
        tx.commit_silently()?;

        let devices = self.device_entries_of(self.transaction.device_changes());
        for entry in &devices {
            notify_device(self.transaction.tree(), &entry.node, entry.current);
        }
        self.devices = devices;
        Ok(())
    }

    /// Reverts an applied overlay, then tells observers about every node
    /// whose availability the revert changed.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the overlay is not applied, or the
    /// revert error; the overlay then stays applied.
    pub fn revert(&mut self) -> Result<()> {
        let changes = match self.transaction.revert_silently() {
            Ok(changes) => changes,
            Err(err) => {
                error!("Failed to revert overlay {}: {err}", self.name);
                return Err(err);
            }
        };
        for entry in &self.device_entries_of(changes) {
            notify_device(self.transaction.tree(), &entry.node, entry.current);
        }
        self.devices.clear();
        Ok(())
    }
}

/// Builds one [`OverlayInfo`] per fragment of `bundle`.
///
/// Root children without an `__overlay__` child are skipped.
///
/// # Errors
///
/// Returns [`ErrorKind::InvalidArgument`] if the bundle has no fragments,
/// and the first error of [`OverlayInfo::from_fragment`].
pub fn build_overlay_infos(tree: &LiveTree, bundle: &DeviceTree) -> Result<Vec<OverlayInfo>> {
    let infos = bundle
        .root()
        .children()
        .filter(|fragment| fragment.child(OVERLAY_NODE).is_some())
        .map(|fragment| OverlayInfo::from_fragment(tree, fragment))
        .collect::<Result<Vec<_>>>()?;
    if infos.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument, "/"));
    }
    Ok(infos)
}

/// Applies every info in order. If one fails, those already applied are
/// reverted in reverse order.
///
/// # Errors
///
/// Returns the error of the first info that fails to apply.
pub fn apply_overlays(infos: &mut [OverlayInfo]) -> Result<()> {
    for index in 0..infos.len() {
        if let Err(err) = infos[index].apply() {
            for applied in infos[..index].iter_mut().rev() {
                if let Err(revert_err) = applied.revert() {
                    error!(
                        "Failed to roll back overlay {}: {revert_err}",
                        applied.name()
                    );
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Reverts every info in reverse order. If one fails, those already
/// reverted are applied again.
///
/// # Errors
///
/// Returns the error of the first info that fails to revert.
pub fn revert_overlays(infos: &mut [OverlayInfo]) -> Result<()> {
    for index in (0..infos.len()).rev() {
        if let Err(err) = infos[index].revert() {
            for reverted in &mut infos[index + 1..] {
                if let Err(apply_err) = reverted.apply() {
                    error!(
                        "Failed to restore overlay {}: {apply_err}",
                        reverted.name()
                    );
                    return Err(Error::new(
                        ErrorKind::InternalInconsistency,
                        reverted.name(),
                    ));
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_markers() {
        assert_eq!(removal_target("-status"), Some("status"));
        assert_eq!(removal_target("-uart@2000"), Some("uart@2000"));
        assert_eq!(removal_target("uart@2000"), None);
        assert_eq!(removal_target("-"), None);
    }

    #[test]
    fn depth_relative_to_target() {
        let tree = LiveTree::new();
        let root = tree.root();
        let soc = tree.create_node(&root, "soc", None, 0).unwrap();
        let uart = tree.create_node(&soc, "uart@1000", None, 0).unwrap();
        let socket = tree.create_node(&root, "socket", None, 0).unwrap();

        assert_eq!(depth_below(&root, &root), Some(0));
        assert_eq!(depth_below(&root, &uart), Some(2));
        assert_eq!(depth_below(&soc, &uart), Some(1));
        assert_eq!(depth_below(&soc, &soc), Some(0));
        assert_eq!(depth_below(&soc, &socket), None);
    }
}
