// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::collections::btree_set::BTreeSet;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;

use log::{error, info};
use spin::Mutex;

use super::{DeviceEntry, OverlayInfo, apply_overlays, build_overlay_infos, revert_overlays};
use crate::error::{Error, ErrorKind, Result};
use crate::live::{LiveTree, Node};
use crate::model::DeviceTree;

/// The identifier of an applied overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayId(u32);

impl OverlayId {
    /// Returns the raw numeric value of this identifier.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out the lowest free identifier, starting at 1.
#[derive(Debug)]
struct IdAllocator {
    used: BTreeSet<u32>,
    limit: u32,
}

impl IdAllocator {
    fn new() -> Self {
        Self::with_limit(u32::MAX)
    }

    fn with_limit(limit: u32) -> Self {
        Self {
            used: BTreeSet::new(),
            limit,
        }
    }

    fn alloc(&mut self) -> Result<OverlayId> {
        let mut candidate = 1;
        for &used in &self.used {
            if used != candidate {
                break;
            }
            candidate = candidate.checked_add(1).unwrap_or(0);
        }
        if candidate == 0 || candidate > self.limit {
            return Err(Error::new(ErrorKind::OutOfResources, "overlay id"));
        }
        self.used.insert(candidate);
        Ok(OverlayId(candidate))
    }

    fn free(&mut self, id: OverlayId) {
        self.used.remove(&id.0);
    }
}

/// An applied overlay bundle.
#[derive(Debug)]
pub struct Overlay {
    id: OverlayId,
    infos: Vec<OverlayInfo>,
}

impl Overlay {
    /// Returns the identifier of this overlay.
    #[must_use]
    pub fn id(&self) -> OverlayId {
        self.id
    }

    /// Returns the fragments of this overlay, in application order.
    #[must_use]
    pub fn infos(&self) -> &[OverlayInfo] {
        &self.infos
    }

    /// Returns the target nodes of the fragments.
    pub fn targets(&self) -> impl Iterator<Item = &Node> {
        self.infos.iter().map(OverlayInfo::target)
    }

    /// Returns every node the overlay's edits touched.
    pub fn touched_nodes(&self) -> impl Iterator<Item = &Node> {
        self.infos.iter().flat_map(OverlayInfo::touched_nodes)
    }

    /// Returns the availability changes the overlay made.
    pub fn device_entries(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.infos.iter().flat_map(OverlayInfo::device_entries)
    }
}

#[derive(Debug)]
struct RegistryState {
    ids: IdAllocator,
    applied: Vec<Overlay>,
}

/// Tracks the overlays applied to a [`LiveTree`], and only lets an overlay
/// be removed if no later overlay touched the same part of the tree.
///
/// # Examples
///
/// ```
/// use live_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};
/// use live_device_tree::overlay::OverlayRegistry;
/// use live_device_tree::LiveTree;
///
/// let tree = LiveTree::new();
/// let registry = OverlayRegistry::new(&tree);
///
/// let bundle = DeviceTree::new(
///     DeviceTreeNode::builder("")
///         .child(
///             DeviceTreeNode::builder("fragment@0")
///                 .property(DeviceTreeProperty::new("target-path", "/\0"))
///                 .child(
///                     DeviceTreeNode::builder("__overlay__")
///                         .property(DeviceTreeProperty::new("model", "board\0"))
///                         .build(),
///                 )
///                 .build(),
///         )
///         .build(),
/// );
///
/// let id = registry.create(&bundle).unwrap();
/// assert_eq!(tree.read_string(&tree.root(), "model").unwrap(), "board");
/// registry.destroy(id).unwrap();
/// assert!(tree.property(&tree.root(), "model").is_none());
/// ```
#[derive(Debug)]
pub struct OverlayRegistry {
    tree: LiveTree,
    inner: Mutex<RegistryState>,
}

impl OverlayRegistry {
    /// Creates an empty registry for `tree`.
    #[must_use]
    pub fn new(tree: &LiveTree) -> Self {
        Self {
            tree: tree.clone(),
            inner: Mutex::new(RegistryState {
                ids: IdAllocator::new(),
                applied: Vec::new(),
            }),
        }
    }

    /// Returns the tree overlays are applied to.
    #[must_use]
    pub fn tree(&self) -> &LiveTree {
        &self.tree
    }

    /// Applies an overlay bundle and returns the identifier of the new
    /// overlay.
    ///
    /// All fragments are applied as one unit: if any fails, the ones
    /// already applied are reverted.
    ///
    /// # Errors
    ///
    /// Returns the error of the first fragment that cannot be built or
    /// applied, or [`ErrorKind::OutOfResources`] if no identifier is left.
    pub fn create(&self, bundle: &DeviceTree) -> Result<OverlayId> {
        let mut infos = build_overlay_infos(&self.tree, bundle)?;
        let mut inner = self.inner.lock();
        let id = inner.ids.alloc()?;
        if let Err(err) = apply_overlays(&mut infos) {
            error!("Failed to apply overlay {id}: {err}");
            inner.ids.free(id);
            return Err(err);
        }
        info!("Applied overlay {id} with {} fragment(s)", infos.len());
        inner.applied.push(Overlay { id, infos });
        Ok(id)
    }

    /// Checks whether the overlay `id` could be removed now.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] for an unknown overlay and
    /// [`ErrorKind::Conflict`] naming the later overlay that touched a node
    /// in this one's target subtrees or overlapping its edits.
    pub fn check_removable(&self, id: OverlayId) -> Result<()> {
        let inner = self.inner.lock();
        let index = Self::index_of(&inner, id)?;
        self.check_topmost(&inner.applied, index)
    }

    fn index_of(inner: &RegistryState, id: OverlayId) -> Result<usize> {
        inner
            .applied
            .iter()
            .position(|overlay| overlay.id == id)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, id.to_string()))
    }

    /// A later overlay blocks removal if it touched a node inside one of
    /// this overlay's target subtrees, or a node on the same root path as
    /// one this overlay touched.
    fn check_topmost(&self, applied: &[Overlay], index: usize) -> Result<()> {
        let targets: Vec<&Node> = applied[index].targets().collect();
        let footprint: Vec<&Node> = applied[index].touched_nodes().collect();
        let state = self.tree.lock();
        for later in applied[index + 1..].iter().rev() {
            for touched in later.touched_nodes() {
                let in_target = targets
                    .iter()
                    .any(|target| state.is_ancestor_or_self(target.id(), touched.id()));
                let overlaps = in_target
                    || footprint.iter().any(|node| {
                        state.is_ancestor_or_self(node.id(), touched.id())
                            || state.is_ancestor_or_self(touched.id(), node.id())
                    });
                if overlaps {
                    error!(
                        "Overlay {} is not topmost: overlay {} touched {}",
                        applied[index].id,
                        later.id,
                        touched.full_path()
                    );
                    return Err(Error::new(
                        ErrorKind::Conflict {
                            blocking: Some(later.id),
                        },
                        touched.full_path(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn destroy_at(&self, inner: &mut RegistryState, index: usize) -> Result<()> {
        self.check_topmost(&inner.applied, index)?;
        let mut overlay = inner.applied.remove(index);
        if let Err(err) = revert_overlays(&mut overlay.infos) {
            error!("Failed to revert overlay {}: {err}", overlay.id);
            inner.applied.insert(index, overlay);
            return Err(err);
        }
        inner.ids.free(overlay.id);
        info!("Removed overlay {}", overlay.id);
        Ok(())
    }

    /// Reverts and forgets the overlay `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] for an unknown overlay,
    /// [`ErrorKind::Conflict`] if a later overlay touched an overlapping
    /// node, or the revert error; the overlay then stays applied.
    pub fn destroy(&self, id: OverlayId) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = Self::index_of(&inner, id)?;
        self.destroy_at(&mut inner, index)
    }

    /// Removes every overlay, most recently applied first.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error.
    pub fn destroy_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while !inner.applied.is_empty() {
            let index = inner.applied.len() - 1;
            self.destroy_at(&mut inner, index)?;
        }
        Ok(())
    }

    /// Calls `f` with the overlay `id`, if it is applied.
    pub fn with_overlay<R>(&self, id: OverlayId, f: impl FnOnce(&Overlay) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.applied.iter().find(|overlay| overlay.id == id).map(f)
    }

    /// Returns the identifiers of the applied overlays, oldest first.
    #[must_use]
    pub fn ids(&self) -> Vec<OverlayId> {
        self.inner
            .lock()
            .applied
            .iter()
            .map(|overlay| overlay.id)
            .collect()
    }

    /// Returns `true` if the overlay `id` is applied.
    #[must_use]
    pub fn contains(&self, id: OverlayId) -> bool {
        self.inner
            .lock()
            .applied
            .iter()
            .any(|overlay| overlay.id == id)
    }

    /// Returns the number of applied overlays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().applied.len()
    }

    /// Returns `true` if no overlay is applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc().unwrap(), OverlayId(1));
        assert_eq!(ids.alloc().unwrap(), OverlayId(2));
    }

    #[test]
    fn lowest_free_id_is_reused() {
        let mut ids = IdAllocator::new();
        let first = ids.alloc().unwrap();
        let second = ids.alloc().unwrap();
        let third = ids.alloc().unwrap();
        ids.free(second);
        assert_eq!(ids.alloc().unwrap(), second);
        ids.free(first);
        ids.free(third);
        assert_eq!(ids.alloc().unwrap(), first);
        assert_eq!(ids.alloc().unwrap(), third);
    }

    #[test]
    fn exhausted_ids() {
        let mut ids = IdAllocator::with_limit(2);
        ids.alloc().unwrap();
        ids.alloc().unwrap();
        assert_eq!(
            ids.alloc().unwrap_err().kind,
            ErrorKind::OutOfResources
        );
    }

    #[test]
    fn display() {
        assert_eq!(OverlayId(7).to_string(), "#7");
    }
}
