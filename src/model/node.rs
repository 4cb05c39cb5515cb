// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::borrow::ToOwned;
use alloc::string::String;
use core::fmt;

use super::property::DeviceTreeProperty;
use super::{FastMap, fast_map};

/// An owned, mutable device tree node, as found in a [`DeviceTree`]
/// description.
///
/// Children and properties are stored in [`IndexMap`](indexmap::IndexMap)s,
/// which provide O(1) lookups by name while preserving insertion order. A
/// child's name is its full basename, including any `@unit-address` suffix.
///
/// [`DeviceTree`]: crate::model::DeviceTree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTreeNode {
    name: String,
    properties: FastMap<String, DeviceTreeProperty>,
    children: FastMap<String, DeviceTreeNode>,
}

impl Default for DeviceTreeNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            properties: fast_map(),
            children: fast_map(),
        }
    }
}

impl DeviceTreeNode {
    /// Creates a new [`DeviceTreeNode`] with the given name.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::model::DeviceTreeNode;
    /// let node = DeviceTreeNode::new("uart@1000");
    /// assert_eq!(node.name(), "uart@1000");
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates a new [`DeviceTreeNodeBuilder`] with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DeviceTreeNodeBuilder {
        DeviceTreeNodeBuilder::new(name)
    }

    /// Returns the name of this node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns an iterator over the properties of this node, in insertion
    /// order.
    pub fn properties(&self) -> impl Iterator<Item = &DeviceTreeProperty> {
        self.properties.values()
    }

    /// Finds a property by its name and returns a reference to it.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&DeviceTreeProperty> {
        self.properties.get(name)
    }

    /// Finds a property by its name and returns a mutable reference to it.
    #[must_use]
    pub fn property_mut(&mut self, name: &str) -> Option<&mut DeviceTreeProperty> {
        self.properties.get_mut(name)
    }

    /// Adds a property to this node, replacing any property with the same
    /// name.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::model::{DeviceTreeNode, DeviceTreeProperty};
    /// let mut node = DeviceTreeNode::new("my-node");
    /// node.add_property(DeviceTreeProperty::new("my-prop", vec![1, 2, 3, 4]));
    /// assert_eq!(node.property("my-prop").unwrap().value(), &[1, 2, 3, 4]);
    /// ```
    pub fn add_property(&mut self, property: DeviceTreeProperty) {
        self.properties.insert(property.name().to_owned(), property);
    }

    /// Removes a property from this node by its name.
    ///
    /// # Performance
    ///
    /// This is a linear-time operation, as it needs to shift elements after
    /// the removed property.
    pub fn remove_property(&mut self, name: &str) -> Option<DeviceTreeProperty> {
        self.properties.shift_remove(name)
    }

    /// Returns an iterator over the children of this node, in insertion
    /// order.
    pub fn children(&self) -> impl Iterator<Item = &DeviceTreeNode> {
        self.children.values()
    }

    /// Finds a child by its name and returns a reference to it.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::model::DeviceTreeNode;
    /// let mut node = DeviceTreeNode::new("my-node");
    /// node.add_child(DeviceTreeNode::new("child@10"));
    /// assert!(node.child("child@10").is_some());
    /// assert!(node.child("child").is_none());
    /// ```
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&DeviceTreeNode> {
        self.children.get(name)
    }

    /// Finds a child by its name and returns a mutable reference to it.
    #[must_use]
    pub fn child_mut(&mut self, name: &str) -> Option<&mut DeviceTreeNode> {
        self.children.get_mut(name)
    }

    /// Adds a child to this node, replacing any child with the same name.
    pub fn add_child(&mut self, child: DeviceTreeNode) {
        self.children.insert(child.name().to_owned(), child);
    }

    /// Removes a child from this node by its name.
    ///
    /// # Performance
    ///
    /// This is a linear-time operation, as it needs to shift elements after
    /// the removed child.
    pub fn remove_child(&mut self, name: &str) -> Option<DeviceTreeNode> {
        self.children.shift_remove(name)
    }

    pub(crate) fn fmt_recursive(
        &self,
        f: &mut fmt::Formatter<'_>,
        indent: usize,
        is_root: bool,
    ) -> fmt::Result {
        if is_root {
            writeln!(f, "{:indent$}/ {{", "", indent = indent)?;
        } else {
            writeln!(f, "{:indent$}{} {{", "", self.name, indent = indent)?;
        }

        for prop in self.properties() {
            prop.fmt(f, indent + 4)?;
        }

        for (i, child) in self.children().enumerate() {
            if i > 0 || !self.properties.is_empty() {
                writeln!(f)?;
            }
            child.fmt_recursive(f, indent + 4, false)?;
        }

        writeln!(f, "{:indent$}}};", "", indent = indent)
    }
}

/// A builder for creating [`DeviceTreeNode`]s.
///
/// # Examples
///
/// ```
/// # use live_device_tree::model::{DeviceTreeNode, DeviceTreeProperty};
/// let node = DeviceTreeNode::builder("dev@0")
///     .property(DeviceTreeProperty::new("compatible", "vendor,dev"))
///     .child(DeviceTreeNode::new("port"))
///     .build();
/// assert_eq!(node.properties().count(), 1);
/// assert_eq!(node.children().count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct DeviceTreeNodeBuilder {
    node: DeviceTreeNode,
}

impl DeviceTreeNodeBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            node: DeviceTreeNode::new(name),
        }
    }

    /// Adds a property to the node.
    #[must_use]
    pub fn property(mut self, property: DeviceTreeProperty) -> Self {
        self.node.add_property(property);
        self
    }

    /// Adds a child to the node.
    #[must_use]
    pub fn child(mut self, child: DeviceTreeNode) -> Self {
        self.node.add_child(child);
        self
    }

    /// Builds the `DeviceTreeNode`.
    #[must_use]
    pub fn build(self) -> DeviceTreeNode {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::model::DeviceTree;

    #[test]
    fn format_dts() {
        let tree = DeviceTree::new(
            DeviceTreeNode::builder("")
                .child(
                    DeviceTreeNode::builder("bus")
                        .property(DeviceTreeProperty::new("compatible", "simple-bus\0"))
                        .property(DeviceTreeProperty::new("reg", 0x1000u32.to_be_bytes()))
                        .property(DeviceTreeProperty::empty("ranges"))
                        .property(DeviceTreeProperty::new("mac", [1u8, 2, 3]))
                        .build(),
                )
                .build(),
        );

        assert_eq!(
            tree.to_string(),
            r#"/dts-v1/;

/ {
    bus {
        compatible = "simple-bus";
        reg = <0x1000>;
        ranges;
        mac = [01 02 03];
    };
};
"#
        );
    }
}
