// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::sync::Arc;
use core::fmt;

use crate::live::{Node, Property};
use crate::notifier::ReconfigAction;

/// A primitive tree edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Link a detached node under its parent.
    AttachNode,
    /// Unlink a node from its parent.
    DetachNode,
    /// Add a property that does not exist yet.
    AddProperty,
    /// Remove an existing property.
    RemoveProperty,
    /// Replace a property, or add it if it does not exist.
    UpdateProperty,
}

impl Action {
    /// Returns the action that undoes this one.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::transaction::Action;
    /// assert_eq!(Action::AttachNode.inverse(), Action::DetachNode);
    /// assert_eq!(Action::UpdateProperty.inverse(), Action::UpdateProperty);
    /// ```
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::AttachNode => Self::DetachNode,
            Self::DetachNode => Self::AttachNode,
            Self::AddProperty => Self::RemoveProperty,
            Self::RemoveProperty => Self::AddProperty,
            Self::UpdateProperty => Self::UpdateProperty,
        }
    }

    /// Returns `true` for the property actions.
    #[must_use]
    pub fn is_property_action(self) -> bool {
        matches!(
            self,
            Self::AddProperty | Self::RemoveProperty | Self::UpdateProperty
        )
    }

    pub(crate) fn reconfig_action(self) -> ReconfigAction {
        match self {
            Self::AttachNode => ReconfigAction::AttachNode,
            Self::DetachNode => ReconfigAction::DetachNode,
            Self::AddProperty => ReconfigAction::AddProperty,
            Self::RemoveProperty => ReconfigAction::RemoveProperty,
            Self::UpdateProperty => ReconfigAction::UpdateProperty,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reconfig_action(), f)
    }
}

/// One staged edit of a [`Transaction`](super::Transaction).
///
/// The entry holds a reference to its node for as long as the transaction
/// keeps it.
#[derive(Debug, Clone)]
pub struct TransactionEntry {
    pub(crate) action: Action,
    pub(crate) node: Node,
    pub(crate) property: Option<Arc<Property>>,
    pub(crate) old_property: Option<Arc<Property>>,
    pub(crate) device_change: Option<(bool, bool)>,
    pub(crate) position: Option<usize>,
}

impl TransactionEntry {
    pub(crate) fn new(action: Action, node: Node) -> Self {
        Self {
            action,
            node,
            property: None,
            old_property: None,
            device_change: None,
            position: None,
        }
    }

    /// Returns the edit this entry makes.
    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Returns the node being edited.
    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Returns the property being added, removed or installed.
    #[must_use]
    pub fn property(&self) -> Option<&Arc<Property>> {
        self.property.as_ref()
    }

    /// Returns the property an update replaces, as captured when the entry
    /// was staged. `None` if the update adds the property.
    #[must_use]
    pub fn old_property(&self) -> Option<&Arc<Property>> {
        self.old_property.as_ref()
    }

    /// Returns the availability of the node before and after this entry was
    /// applied, if applying it changed it. `None` until the entry is applied.
    #[must_use]
    pub fn device_change(&self) -> Option<(bool, bool)> {
        self.device_change
    }
}

/// A change of a node's availability caused by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStateChange {
    /// The node whose availability changes.
    pub node: Node,
    /// The action that made the change. Changes made by a revert carry the
    /// inverse of the reverted entry's action.
    pub action: Action,
    /// Whether the node was available before.
    pub previous: bool,
    /// Whether the node is available after.
    pub current: bool,
}
