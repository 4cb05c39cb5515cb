// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The reconfiguration notifier bus.
//!
//! Observers are told about every primitive edit before it is made, and can
//! reject it with a [`Veto`]. The first veto stops the chain and fails the
//! edit, which in turn rolls back the transaction it belongs to.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::debug;
use spin::RwLock;

use crate::live::{Node, Property};

/// The kind of change an observer is being told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconfigAction {
    /// A node is about to be attached to the tree.
    AttachNode,
    /// A node is about to be detached from the tree.
    DetachNode,
    /// A property is about to be added to an attached node.
    AddProperty,
    /// A property is about to be removed from an attached node.
    RemoveProperty,
    /// A property of an attached node is about to be replaced.
    UpdateProperty,
    /// A node became available and should get a device.
    CreateDevice,
    /// A node stopped being available and its device should go away.
    DestroyDevice,
}

impl fmt::Display for ReconfigAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AttachNode => "attach node",
            Self::DetachNode => "detach node",
            Self::AddProperty => "add property",
            Self::RemoveProperty => "remove property",
            Self::UpdateProperty => "update property",
            Self::CreateDevice => "create device",
            Self::DestroyDevice => "destroy device",
        };
        f.write_str(name)
    }
}

/// A change delivered to every [`ReconfigObserver`].
#[derive(Debug, Clone, Copy)]
pub struct ReconfigEvent<'a> {
    /// What is happening.
    pub action: ReconfigAction,
    /// The node being changed.
    pub node: &'a Node,
    /// The property being added, removed or installed, for property events.
    pub property: Option<&'a Property>,
    /// The property being replaced, for [`ReconfigAction::UpdateProperty`].
    pub old_property: Option<&'a Property>,
}

impl<'a> ReconfigEvent<'a> {
    pub(crate) fn node(action: ReconfigAction, node: &'a Node) -> Self {
        Self {
            action,
            node,
            property: None,
            old_property: None,
        }
    }
}

/// An observer's rejection of a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veto {
    reason: String,
}

impl Veto {
    /// Creates a veto with a human-readable reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Returns the reason given for the veto.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for Veto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Something that wants to hear about (and possibly block) changes to a
/// live tree.
///
/// Observers are called synchronously, in registration order, without the
/// tree's structural lock held. They may read the tree; edits made from an
/// observer fail with [`ErrorKind::Busy`](crate::ErrorKind::Busy).
///
/// # Examples
///
/// ```
/// # use live_device_tree::{LiveTree, Property};
/// # use live_device_tree::notifier::{ReconfigAction, ReconfigEvent, Veto};
/// let tree = LiveTree::new();
/// tree.register_notifier(|event: &ReconfigEvent<'_>| {
///     if event.action == ReconfigAction::AddProperty {
///         Err(Veto::new("read-only"))
///     } else {
///         Ok(())
///     }
/// });
/// let root = tree.root();
/// assert!(tree.add_property(&root, Property::new("model", "x")).is_err());
/// ```
pub trait ReconfigObserver: Send + Sync {
    /// Handles a change that is about to happen.
    ///
    /// # Errors
    ///
    /// Returns a [`Veto`] to reject the change.
    fn handle_change(&self, event: &ReconfigEvent<'_>) -> Result<(), Veto>;
}

impl<F> ReconfigObserver for F
where
    F: Fn(&ReconfigEvent<'_>) -> Result<(), Veto> + Send + Sync,
{
    fn handle_change(&self, event: &ReconfigEvent<'_>) -> Result<(), Veto> {
        self(event)
    }
}

/// Identifies a registered observer, for unregistering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

#[derive(Default)]
pub(crate) struct NotifierChain {
    inner: RwLock<ChainState>,
}

#[derive(Default)]
struct ChainState {
    next_id: u64,
    observers: Vec<(NotifierId, Arc<dyn ReconfigObserver>)>,
}

impl fmt::Debug for NotifierChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierChain")
            .field("observers", &self.inner.read().observers.len())
            .finish()
    }
}

impl NotifierChain {
    pub(crate) fn register(&self, observer: Arc<dyn ReconfigObserver>) -> NotifierId {
        let mut inner = self.inner.write();
        let id = NotifierId(inner.next_id);
        inner.next_id += 1;
        inner.observers.push((id, observer));
        id
    }

    pub(crate) fn unregister(&self, id: NotifierId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        inner.observers.len() != before
    }

    /// Calls every observer in registration order, stopping at the first
    /// veto.
    pub(crate) fn notify(&self, event: &ReconfigEvent<'_>) -> Result<(), Veto> {
        let observers: Vec<_> = self
            .inner
            .read()
            .observers
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            if let Err(veto) = observer.handle_change(event) {
                debug!(
                    "{} of {} vetoed: {veto}",
                    event.action,
                    event.node.full_path()
                );
                return Err(veto);
            }
        }
        Ok(())
    }
}
