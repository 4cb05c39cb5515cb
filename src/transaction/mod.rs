// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transactions: ordered lists of primitive edits that apply atomically and
//! can be reverted.
//!
//! A [`Transaction`] moves through the following states:
//!
//! ```text
//! Ready --start--> InProgress --apply--> Committing --commit--> Committed
//!   ^                 |   ^                  |                      |
//!   +-----abort-------+   +--(apply fails)---+                   revert
//!   ^                                                               |
//!   +------------------------------- Reverting <--------------------+
//! ```
//!
//! Entries are staged without holding the tree's structural lock. Staging
//! looks ahead into the entries already staged, so an update staged after
//! an add of the same property replaces the staged property rather than
//! the live one.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, error, warn};

mod entry;

pub use entry::{Action, DeviceStateChange, TransactionEntry};

use crate::error::{Error, ErrorKind, Result};
use crate::live::{LiveTree, Node, Property};
use crate::notifier::{ReconfigAction, ReconfigEvent};

/// The lifecycle state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Not started, or fully reverted.
    Ready,
    /// Accepting staged entries.
    InProgress,
    /// Applied to the tree, waiting to be committed or aborted.
    Committing,
    /// Applied and committed; can be reverted.
    Committed,
    /// Being reverted.
    Reverting,
}

/// A revertible, ordered list of edits to a [`LiveTree`].
///
/// # Examples
///
/// ```
/// use live_device_tree::{LiveTree, Property};
///
/// let tree = LiveTree::new();
/// let root = tree.root();
/// let bus = tree.create_node(&root, "bus", None, 0).unwrap();
///
/// let mut tx = tree.transaction();
/// tx.start().unwrap();
/// tx.attach_node(&bus).unwrap();
/// tx.add_property(&bus, Property::new("compatible", "simple-bus\0"))
///     .unwrap();
/// tx.apply().unwrap();
/// tx.commit().unwrap();
/// assert!(tree.is_available(&bus));
///
/// tx.revert().unwrap();
/// assert!(tree.find_node_by_path("/bus").is_none());
/// ```
#[derive(Debug)]
pub struct Transaction {
    tree: LiveTree,
    state: TransactionState,
    entries: Vec<TransactionEntry>,
}

const SUBJECT: &str = "transaction";

fn entry_subject(entry: &TransactionEntry) -> String {
    match &entry.property {
        Some(property) => alloc::format!("{}:{}", entry.node.full_path(), property.name()),
        None => String::from(entry.node.full_path()),
    }
}

fn forward_event(entry: &TransactionEntry) -> ReconfigEvent<'_> {
    ReconfigEvent {
        action: entry.action.reconfig_action(),
        node: &entry.node,
        property: entry.property.as_deref(),
        old_property: entry.old_property.as_deref(),
    }
}

fn inverse_event(entry: &TransactionEntry) -> ReconfigEvent<'_> {
    match (entry.action, entry.old_property.as_deref()) {
        (Action::UpdateProperty, Some(old)) => ReconfigEvent {
            action: ReconfigAction::UpdateProperty,
            node: &entry.node,
            property: Some(old),
            old_property: entry.property.as_deref(),
        },
        (Action::UpdateProperty, None) => ReconfigEvent {
            action: ReconfigAction::RemoveProperty,
            node: &entry.node,
            property: entry.property.as_deref(),
            old_property: None,
        },
        (action, _) => ReconfigEvent {
            action: action.inverse().reconfig_action(),
            node: &entry.node,
            property: entry.property.as_deref(),
            old_property: None,
        },
    }
}

fn notify_entry(
    tree: &LiveTree,
    entry: &TransactionEntry,
    event: &ReconfigEvent<'_>,
    vetoable: bool,
) -> Result<()> {
    if entry.action.is_property_action() && !tree.is_attached(&entry.node) {
        return Ok(());
    }
    match tree.notify(event) {
        Ok(()) => Ok(()),
        Err(veto) if vetoable => Err(Error::new(ErrorKind::Vetoed(veto), entry_subject(entry))),
        Err(veto) => {
            warn!(
                "Ignoring veto of {} at {}: {veto}",
                event.action,
                entry_subject(entry)
            );
            Ok(())
        }
    }
}

fn entry_property(entry: &TransactionEntry) -> Result<&Arc<Property>> {
    entry
        .property
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, entry.node.full_path()))
}

type DeviceChange = Option<(bool, bool)>;

fn change_between(previous: bool, current: bool) -> DeviceChange {
    (previous != current).then_some((previous, current))
}

/// Notifies observers of `entry`, then applies it under the structural lock
/// and records the availability change it actually made.
fn apply_entry(tree: &LiveTree, entry: &mut TransactionEntry, vetoable: bool) -> Result<()> {
    debug!("Applying {} at {}", entry.action, entry_subject(entry));
    notify_entry(tree, entry, &forward_event(entry), vetoable)?;

    let mut state = tree.lock();
    let id = entry.node.id();
    let previous = state.has_device(id);
    match entry.action {
        Action::AttachNode => state.attach(&entry.node, entry.position)?,
        Action::DetachNode => entry.position = Some(state.detach(&entry.node)?),
        Action::AddProperty => {
            state.add_property(&entry.node, entry_property(entry)?, entry.position)?;
        }
        Action::RemoveProperty => {
            let position = state.remove_property(&entry.node, entry_property(entry)?)?;
            entry.position = Some(position);
        }
        Action::UpdateProperty => state.update_property(
            &entry.node,
            entry_property(entry)?,
            entry.old_property.as_ref(),
        )?,
    }
    entry.device_change = change_between(previous, state.has_device(id));
    Ok(())
}

/// Undoes `entry` and returns the availability change the undo made.
fn revert_entry(
    tree: &LiveTree,
    entry: &mut TransactionEntry,
    vetoable: bool,
) -> Result<DeviceChange> {
    debug!("Reverting {} at {}", entry.action, entry_subject(entry));
    notify_entry(tree, entry, &inverse_event(entry), vetoable)?;

    let mut state = tree.lock();
    let id = entry.node.id();
    let previous = state.has_device(id);
    match entry.action {
        Action::AttachNode => entry.position = Some(state.detach(&entry.node)?),
        Action::DetachNode => state.attach(&entry.node, entry.position)?,
        Action::AddProperty => {
            let position = state.remove_property(&entry.node, entry_property(entry)?)?;
            entry.position = Some(position);
        }
        Action::RemoveProperty => {
            state.restore_property(&entry.node, entry_property(entry)?, entry.position)?;
        }
        Action::UpdateProperty => state.restore_update(
            &entry.node,
            entry_property(entry)?,
            entry.old_property.as_ref(),
        )?,
    }
    entry.device_change = None;
    Ok(change_between(previous, state.has_device(id)))
}

/// Reverts already applied entries, newest first, without letting observers
/// veto the rollback.
fn unwind(tree: &LiveTree, entries: &mut [TransactionEntry]) -> Result<()> {
    for entry in entries.iter_mut().rev() {
        if let Err(err) = revert_entry(tree, entry, false) {
            error!("Failed to unwind {}: {err}", entry_subject(entry));
            return Err(Error::new(
                ErrorKind::InternalInconsistency,
                entry.node.full_path(),
            ));
        }
    }
    Ok(())
}

/// Re-applies reverted entries in order, without letting observers veto.
fn replay(tree: &LiveTree, entries: &mut [TransactionEntry]) -> Result<()> {
    for entry in entries.iter_mut() {
        if let Err(err) = apply_entry(tree, entry, false) {
            error!("Failed to replay {}: {err}", entry_subject(entry));
            return Err(Error::new(
                ErrorKind::InternalInconsistency,
                entry.node.full_path(),
            ));
        }
    }
    Ok(())
}

/// Tells observers that `node` gained or lost its device. Vetoes are
/// ignored: the tree has already changed.
pub(crate) fn notify_device(tree: &LiveTree, node: &Node, available: bool) {
    let action = if available {
        ReconfigAction::CreateDevice
    } else {
        ReconfigAction::DestroyDevice
    };
    if let Err(veto) = tree.notify(&ReconfigEvent::node(action, node)) {
        warn!("Ignoring failed {action} for {}: {veto}", node.full_path());
    }
}

fn notify_devices(tree: &LiveTree, changes: &[DeviceStateChange]) {
    for change in changes {
        notify_device(tree, &change.node, change.current);
    }
}

impl Transaction {
    /// Creates an empty transaction on `tree`.
    #[must_use]
    pub fn new(tree: &LiveTree) -> Self {
        Self {
            tree: tree.clone(),
            state: TransactionState::Ready,
            entries: Vec::new(),
        }
    }

    /// Returns the tree this transaction edits.
    #[must_use]
    pub fn tree(&self) -> &LiveTree {
        &self.tree
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the staged entries, in application order.
    #[must_use]
    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    /// Returns the availability changes the last apply made, in
    /// application order.
    ///
    /// Changes are measured on the tree as each entry is applied, so edits
    /// made between staging and applying are taken into account.
    #[must_use]
    pub fn device_changes(&self) -> Vec<DeviceStateChange> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .device_change
                    .map(|(previous, current)| DeviceStateChange {
                        node: entry.node.clone(),
                        action: entry.action,
                        previous,
                        current,
                    })
            })
            .collect()
    }

    /// Starts staging entries.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] unless the transaction is
    /// [`Ready`](TransactionState::Ready).
    pub fn start(&mut self) -> Result<()> {
        if self.state != TransactionState::Ready {
            return Err(Error::new(ErrorKind::Busy, SUBJECT));
        }
        self.state = TransactionState::InProgress;
        Ok(())
    }

    fn check_staging(&self, node: &Node) -> Result<()> {
        if self.state != TransactionState::InProgress {
            return Err(Error::new(ErrorKind::Busy, SUBJECT));
        }
        self.tree.check_owned(node)
    }

    fn push(&mut self, entry: TransactionEntry) {
        debug!("Staging {} at {}", entry.action, entry_subject(&entry));
        self.entries.push(entry);
    }

    /// Returns the property `name` of `node` as it will be once the staged
    /// entries are applied.
    #[must_use]
    pub fn lookup_property(&self, node: &Node, name: &str) -> Option<Arc<Property>> {
        for entry in self.entries.iter().rev() {
            if entry.node != *node {
                continue;
            }
            let Some(property) = &entry.property else {
                continue;
            };
            if property.name() != name {
                continue;
            }
            return match entry.action {
                Action::RemoveProperty => None,
                _ => Some(property.clone()),
            };
        }
        self.tree.property(node, name)
    }

    /// Returns the child `name` of `parent` as it will be once the staged
    /// entries are applied.
    #[must_use]
    pub fn lookup_child(&self, parent: &Node, name: &str) -> Option<Node> {
        for entry in self.entries.iter().rev() {
            let is_structural = matches!(entry.action, Action::AttachNode | Action::DetachNode);
            if is_structural
                && entry.node.parent_id() == Some(parent.id())
                && entry.node.name() == name
            {
                return (entry.action == Action::AttachNode).then(|| entry.node.clone());
            }
        }
        self.tree.child_by_name(parent, name)
    }

    /// Stages attaching `node` (created with
    /// [`LiveTree::create_node`]) under its parent.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the transaction is not in progress and
    /// [`ErrorKind::InvalidArgument`] for the root or a node of another
    /// tree.
    pub fn attach_node(&mut self, node: &Node) -> Result<()> {
        self.check_staging(node)?;
        if node.parent_id().is_none() {
            return Err(Error::new(ErrorKind::InvalidArgument, node.full_path()));
        }
        self.push(TransactionEntry::new(Action::AttachNode, node.clone()));
        Ok(())
    }

    /// Stages detaching `node` from its parent.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the transaction is not in progress and
    /// [`ErrorKind::InvalidArgument`] for the root or a node of another
    /// tree.
    pub fn detach_node(&mut self, node: &Node) -> Result<()> {
        self.check_staging(node)?;
        if node.parent_id().is_none() {
            return Err(Error::new(ErrorKind::InvalidArgument, node.full_path()));
        }
        self.push(TransactionEntry::new(Action::DetachNode, node.clone()));
        Ok(())
    }

    /// Stages adding `property` to `node`.
    ///
    /// The property must not exist when the entry is applied.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the transaction is not in progress and
    /// [`ErrorKind::InvalidArgument`] for a node of another tree.
    pub fn add_property(&mut self, node: &Node, property: impl Into<Arc<Property>>) -> Result<()> {
        self.check_staging(node)?;
        let property = property.into();
        let mut entry = TransactionEntry::new(Action::AddProperty, node.clone());
        entry.property = Some(property);
        self.push(entry);
        Ok(())
    }

    /// Stages removing the property `name` from `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if the node will not have such a
    /// property, [`ErrorKind::Busy`] if the transaction is not in progress
    /// and [`ErrorKind::InvalidArgument`] for a node of another tree.
    pub fn remove_property(&mut self, node: &Node, name: &str) -> Result<()> {
        self.check_staging(node)?;
        let Some(current) = self.lookup_property(node, name) else {
            return Err(Error::new(
                ErrorKind::NotFound,
                alloc::format!("{}:{}", node.full_path(), name),
            ));
        };
        let mut entry = TransactionEntry::new(Action::RemoveProperty, node.clone());
        entry.property = Some(current);
        self.push(entry);
        Ok(())
    }

    /// Stages replacing the same-named property of `node` with `property`,
    /// or adding it if the node will not have one.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the transaction is not in progress and
    /// [`ErrorKind::InvalidArgument`] for a node of another tree.
    pub fn update_property(
        &mut self,
        node: &Node,
        property: impl Into<Arc<Property>>,
    ) -> Result<()> {
        self.check_staging(node)?;
        let property = property.into();
        let mut entry = TransactionEntry::new(Action::UpdateProperty, node.clone());
        entry.old_property = self.lookup_property(node, property.name());
        entry.property = Some(property);
        self.push(entry);
        Ok(())
    }

    /// Stages an arbitrary action. Property actions need `property`; a
    /// removal only uses its name.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if a property action has no
    /// property, and otherwise whatever the specific staging method returns.
    pub fn stage(
        &mut self,
        action: Action,
        node: &Node,
        property: Option<Arc<Property>>,
    ) -> Result<()> {
        let missing = || Error::new(ErrorKind::InvalidArgument, node.full_path());
        match action {
            Action::AttachNode => self.attach_node(node),
            Action::DetachNode => self.detach_node(node),
            Action::AddProperty => self.add_property(node, property.ok_or_else(missing)?),
            Action::RemoveProperty => {
                let property = property.ok_or_else(missing)?;
                self.remove_property(node, property.name())
            }
            Action::UpdateProperty => self.update_property(node, property.ok_or_else(missing)?),
        }
    }

    /// Applies every staged entry to the tree, notifying observers before
    /// each one.
    ///
    /// If any entry fails (including by an observer's veto), the entries
    /// applied so far are reverted in reverse order, the transaction goes
    /// back to [`InProgress`](TransactionState::InProgress) and the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the transaction is not in progress or
    /// another apply or revert on the tree is running, or the error of the
    /// first failing entry.
    pub fn apply(&mut self) -> Result<()> {
        if self.state != TransactionState::InProgress {
            return Err(Error::new(ErrorKind::Busy, SUBJECT));
        }
        let _serial = self.tree.serialize()?;
        self.state = TransactionState::Committing;

        for index in 0..self.entries.len() {
            if let Err(err) = apply_entry(&self.tree, &mut self.entries[index], true) {
                error!("Transaction failed at entry {index}: {err}");
                self.state = TransactionState::InProgress;
                unwind(&self.tree, &mut self.entries[..index])?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Commits an applied transaction and fires the device notifications of
    /// its availability changes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] unless the transaction has been applied.
    pub fn commit(&mut self) -> Result<()> {
        self.commit_silently()?;
        notify_devices(&self.tree, &self.device_changes());
        Ok(())
    }

    /// Commits without firing device notifications.
    pub(crate) fn commit_silently(&mut self) -> Result<()> {
        if self.state != TransactionState::Committing {
            return Err(Error::new(ErrorKind::Busy, SUBJECT));
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Discards the transaction, undoing an apply that was not committed.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the transaction is neither in progress
    /// nor applied, and [`ErrorKind::InternalInconsistency`] if an applied
    /// entry cannot be undone.
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            TransactionState::InProgress => {}
            TransactionState::Committing => {
                let _serial = self.tree.serialize()?;
                unwind(&self.tree, &mut self.entries)?;
            }
            _ => return Err(Error::new(ErrorKind::Busy, SUBJECT)),
        }
        self.entries.clear();
        self.state = TransactionState::Ready;
        Ok(())
    }

    /// Reverts a committed transaction by applying the inverse of every
    /// entry in reverse order, then fires the device notifications of the
    /// availability changes the revert made.
    ///
    /// On success the transaction is emptied and [`Ready`] again. If an
    /// entry cannot be reverted, the entries reverted so far are applied
    /// again and the transaction stays [`Committed`].
    ///
    /// [`Ready`]: TransactionState::Ready
    /// [`Committed`]: TransactionState::Committed
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] unless the transaction is committed and
    /// no other apply or revert on the tree is running, the error of the
    /// failing entry, or [`ErrorKind::InternalInconsistency`] if the tree
    /// could not be restored either.
    pub fn revert(&mut self) -> Result<()> {
        let changes = self.revert_silently()?;
        notify_devices(&self.tree, &changes);
        Ok(())
    }

    /// Reverts without firing device notifications, returning the
    /// availability changes made in revert order.
    pub(crate) fn revert_silently(&mut self) -> Result<Vec<DeviceStateChange>> {
        if self.state != TransactionState::Committed {
            return Err(Error::new(ErrorKind::Busy, SUBJECT));
        }
        let _serial = self.tree.serialize()?;
        self.state = TransactionState::Reverting;

        let mut changes = Vec::new();
        for index in (0..self.entries.len()).rev() {
            let entry = &mut self.entries[index];
            match revert_entry(&self.tree, entry, true) {
                Ok(change) => {
                    if let Some((previous, current)) = change {
                        changes.push(DeviceStateChange {
                            node: entry.node.clone(),
                            action: entry.action.inverse(),
                            previous,
                            current,
                        });
                    }
                }
                Err(err) => {
                    error!("Revert failed at entry {index}: {err}");
                    self.state = TransactionState::Committed;
                    replay(&self.tree, &mut self.entries[index + 1..])?;
                    return Err(err);
                }
            }
        }

        self.entries.clear();
        self.state = TransactionState::Ready;
        Ok(changes)
    }
}
