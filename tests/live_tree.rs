// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::Arc;

use live_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};
use live_device_tree::{ErrorKind, LiveTree, LiveTreeConfig, Property, ReleasePolicy};

fn base_tree() -> LiveTree {
    let model = DeviceTree::new(
        DeviceTreeNode::builder("")
            .child(
                DeviceTreeNode::builder("soc")
                    .property(DeviceTreeProperty::new("phandle", 1u32.to_be_bytes()))
                    .property(DeviceTreeProperty::new("device_type", "soc\0"))
                    .child(
                        DeviceTreeNode::builder("uart@1000")
                            .property(DeviceTreeProperty::new("compatible", "ns16550a\0"))
                            .property(DeviceTreeProperty::new("status", "okay\0"))
                            .property(DeviceTreeProperty::new("reg", 0x1000u32.to_be_bytes()))
                            .build(),
                    )
                    .build(),
            )
            .build(),
    );
    LiveTree::from_model(&model, LiveTreeConfig::new()).unwrap()
}

#[test]
fn lookups() {
    let tree = base_tree();
    let root = tree.root();
    assert_eq!(root.full_path(), "/");
    assert_eq!(root.parent_id(), None);
    assert_eq!(tree.node_count(), 3);

    let soc = tree.find_node_by_path("/soc").unwrap();
    assert_eq!(soc.phandle(), 1);
    assert_eq!(soc.node_type(), Some("soc"));
    assert_eq!(tree.find_node_by_phandle(1), Some(soc.clone()));
    assert_eq!(tree.parent(&soc), Some(root.clone()));
    assert_eq!(tree.children(&root), vec![soc.clone()]);

    let uart = tree.child_by_name(&soc, "uart@1000").unwrap();
    assert_eq!(uart.full_path(), "/soc/uart@1000");
    assert_eq!(tree.read_u32(&uart, "reg").unwrap(), 0x1000);
    assert_eq!(tree.read_string(&uart, "compatible").unwrap(), "ns16550a");
    assert!(tree.is_attached(&uart));
    assert!(tree.is_available(&uart));
    assert!(!tree.is_available(&soc));

    assert!(tree.child_by_name(&soc, "uart").is_none());
    assert!(tree.find_node_by_path("soc").is_none());
    assert_eq!(
        tree.read_u32(&uart, "missing").unwrap_err().kind,
        ErrorKind::NotFound
    );
    assert_eq!(
        tree.read_u32(&uart, "compatible").unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
}

#[test]
fn attach_and_detach() {
    let tree = base_tree();
    let soc = tree.find_node_by_path("/soc").unwrap();
    let spi = tree.create_node(&soc, "spi@2000", None, 7).unwrap();
    assert_eq!(spi.full_path(), "/soc/spi@2000");
    assert!(!tree.is_attached(&spi));
    assert!(tree.find_node_by_phandle(7).is_none());

    tree.attach_node(&spi).unwrap();
    assert_eq!(tree.find_node_by_path("/soc/spi@2000"), Some(spi.clone()));
    assert_eq!(tree.find_node_by_phandle(7), Some(spi.clone()));
    let names: Vec<_> = tree
        .children(&soc)
        .iter()
        .map(|child| child.name().to_owned())
        .collect();
    assert_eq!(names, ["uart@1000", "spi@2000"]);

    tree.add_property(&spi, Property::new("compatible", "vendor,spi\0"))
        .unwrap();
    tree.detach_node(&spi).unwrap();
    assert!(!tree.is_attached(&spi));
    assert!(tree.find_node_by_path("/soc/spi@2000").is_none());
    assert!(tree.find_node_by_phandle(7).is_none());

    // The handle stays valid after detaching.
    assert_eq!(spi.name(), "spi@2000");
    assert_eq!(
        tree.read_string(&spi, "compatible").unwrap(),
        "vendor,spi"
    );
}

#[test]
fn detach_covers_subtree() {
    let tree = base_tree();
    let soc = tree.find_node_by_path("/soc").unwrap();
    let uart = tree.find_node_by_path("/soc/uart@1000").unwrap();

    tree.detach_node(&soc).unwrap();
    assert!(!tree.is_attached(&uart));
    assert!(tree.find_node_by_phandle(1).is_none());
    assert_eq!(tree.node_count(), 1);

    tree.attach_node(&soc).unwrap();
    assert!(tree.is_attached(&uart));
    assert_eq!(tree.find_node_by_path("/soc/uart@1000"), Some(uart));
    assert_eq!(tree.node_count(), 3);
}

#[test]
fn attach_errors() {
    let tree = base_tree();
    let root = tree.root();
    let soc = tree.find_node_by_path("/soc").unwrap();

    assert_eq!(
        tree.attach_node(&soc).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        tree.detach_node(&root).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );

    let duplicate = tree.create_node(&root, "soc", None, 0).unwrap();
    assert_eq!(
        tree.attach_node(&duplicate).unwrap_err().kind,
        ErrorKind::AlreadyExists
    );

    let same_phandle = tree.create_node(&root, "other", None, 1).unwrap();
    assert_eq!(
        tree.attach_node(&same_phandle).unwrap_err().kind,
        ErrorKind::AlreadyExists
    );

    let detached = tree.create_node(&root, "detached", None, 0).unwrap();
    assert_eq!(
        tree.detach_node(&detached).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );

    assert_eq!(
        tree.create_node(&root, "a/b", None, 0).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        tree.create_node(&root, "", None, 0).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
}

#[test]
fn nodes_of_other_trees_are_rejected() {
    let tree = base_tree();
    let other = LiveTree::new();
    let foreign = other.create_node(&other.root(), "foreign", None, 0).unwrap();

    assert!(!tree.owns(&foreign));
    assert!(!tree.is_attached(&foreign));
    assert_eq!(
        tree.attach_node(&foreign).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        tree.create_node(&foreign, "child", None, 0)
            .unwrap_err()
            .kind,
        ErrorKind::InvalidArgument
    );
}

#[test]
fn duplicate_phandles_in_model() {
    let model = DeviceTree::new(
        DeviceTreeNode::builder("")
            .child(
                DeviceTreeNode::builder("a")
                    .property(DeviceTreeProperty::new("phandle", 3u32.to_be_bytes()))
                    .build(),
            )
            .child(
                DeviceTreeNode::builder("b")
                    .property(DeviceTreeProperty::new("linux,phandle", 3u32.to_be_bytes()))
                    .build(),
            )
            .build(),
    );
    assert_eq!(
        LiveTree::from_model(&model, LiveTreeConfig::new())
            .unwrap_err()
            .kind,
        ErrorKind::AlreadyExists
    );
}

#[test]
fn reference_counts() {
    let tree = base_tree();
    let root = tree.root();
    let node = tree.create_node(&root, "counted", None, 0).unwrap();
    assert_eq!(node.ref_count(), 1);

    tree.attach_node(&node).unwrap();
    assert_eq!(node.ref_count(), 2);

    let extra = node.clone();
    assert_eq!(node.ref_count(), 3);
    drop(extra);

    tree.detach_node(&node).unwrap();
    assert_eq!(node.ref_count(), 1);
}

#[test]
fn released_nodes_go_to_the_graveyard() {
    let tree = LiveTree::new();
    assert_eq!(tree.release_policy(), ReleasePolicy::Keep);

    let node = tree.create_node(&tree.root(), "kept", None, 0).unwrap();
    tree.attach_node(&node).unwrap();
    tree.add_property(&node, Property::new("reg", 4u32.to_be_bytes()))
        .unwrap();
    tree.detach_node(&node).unwrap();

    assert!(tree.graveyard().is_empty());
    drop(node);

    let graveyard = tree.graveyard();
    assert_eq!(graveyard.len(), 1);
    assert_eq!(graveyard[0].name(), "kept");
    assert_eq!(graveyard[0].property("reg").unwrap().as_u32(), Ok(4));
}

#[test]
fn released_nodes_can_be_freed() {
    let model = DeviceTree::new(
        DeviceTreeNode::builder("")
            .child(DeviceTreeNode::new("chosen"))
            .build(),
    );
    let config = LiveTreeConfig::new().release_policy(ReleasePolicy::Free);
    let tree = LiveTree::from_model(&model, config).unwrap();
    assert_eq!(tree.release_policy(), ReleasePolicy::Free);

    let chosen = tree.find_node_by_path("/chosen").unwrap();
    tree.detach_node(&chosen).unwrap();
    drop(chosen);
    assert!(tree.graveyard().is_empty());
}

#[test]
fn attached_nodes_are_not_released() {
    let tree = LiveTree::new();
    let node = tree.create_node(&tree.root(), "held", None, 0).unwrap();
    tree.attach_node(&node).unwrap();
    drop(node);

    // The parent still holds the node.
    let node = tree.find_node_by_path("/held").unwrap();
    assert_eq!(node.ref_count(), 2);
    assert!(tree.graveyard().is_empty());
}

#[test]
fn property_edits_retire_old_values() {
    let tree = base_tree();
    let uart = tree.find_node_by_path("/soc/uart@1000").unwrap();
    let old_status = tree.property(&uart, "status").unwrap();

    tree.update_property(&uart, Property::new("status", "disabled\0"))
        .unwrap();
    assert_eq!(tree.read_string(&uart, "status").unwrap(), "disabled");
    assert!(!tree.is_available(&uart));
    let dead = tree.dead_properties(&uart);
    assert_eq!(dead.len(), 1);
    assert!(Arc::ptr_eq(&dead[0], &old_status));

    let reg = tree.property(&uart, "reg").unwrap();
    tree.remove_property(&uart, "reg").unwrap();
    assert!(tree.property(&uart, "reg").is_none());
    assert!(tree
        .dead_properties(&uart)
        .iter()
        .any(|dead| Arc::ptr_eq(dead, &reg)));

    assert_eq!(
        tree.remove_property(&uart, "reg").unwrap_err().kind,
        ErrorKind::NotFound
    );
    assert_eq!(
        tree.add_property(&uart, Property::new("compatible", "x\0"))
            .unwrap_err()
            .kind,
        ErrorKind::AlreadyExists
    );

    // Updating a missing property adds it.
    tree.update_property(&uart, Property::new("clock-frequency", 1u32.to_be_bytes()))
        .unwrap();
    assert_eq!(tree.read_u32(&uart, "clock-frequency").unwrap(), 1);
}

#[test]
fn properties_keep_insertion_order() {
    let tree = base_tree();
    let uart = tree.find_node_by_path("/soc/uart@1000").unwrap();
    let names: Vec<_> = tree
        .properties(&uart)
        .iter()
        .map(|prop| prop.name().to_owned())
        .collect();
    assert_eq!(names, ["compatible", "status", "reg"]);
}

#[test]
fn sensitive_properties() {
    let tree = base_tree();
    let root = tree.root();
    tree.add_property(&root, Property::new("security-key", [7u8; 8]))
        .unwrap();
    let key = tree.property(&root, "security-key").unwrap();
    assert!(key.is_sensitive());
    assert_eq!(key.exposed_len(), 0);
    assert_eq!(key.value(), &[7u8; 8]);
}
