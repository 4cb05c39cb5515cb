// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use live_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};
use live_device_tree::{ErrorKind, LiveTree, LiveTreeConfig};

#[test]
fn tree_creation() {
    let tree = DeviceTree::new(
        DeviceTreeNode::builder("")
            .property(DeviceTreeProperty::new("compatible", "test"))
            .property(DeviceTreeProperty::new("prop-u32", 1u32.to_be_bytes()))
            .child(
                DeviceTreeNode::builder("child-a")
                    .property(DeviceTreeProperty::new("child-prop", "a"))
                    .build(),
            )
            .child(
                DeviceTreeNode::builder("child-b@10")
                    .property(DeviceTreeProperty::new("child-prop", "b\0"))
                    .build(),
            )
            .build(),
    );

    let root = tree.root();
    assert_eq!(root.name(), "");
    assert_eq!(root.properties().count(), 2);
    assert_eq!(root.children().count(), 2);
    assert_eq!(root.property("prop-u32").unwrap().as_u32(), Ok(1));

    let child_a = root.child("child-a").unwrap();
    assert_eq!(child_a.property("child-prop").unwrap().as_str(), Ok("a"));

    let child_b = tree.find_node("/child-b@10").unwrap();
    assert_eq!(child_b.property("child-prop").unwrap().as_str(), Ok("b"));
    assert!(tree.find_node("/child-b").is_none());
}

#[test]
fn tree_modification() {
    let mut tree = DeviceTree::new(DeviceTreeNode::new(""));

    tree.root_mut().add_child(DeviceTreeNode::new("child"));
    assert_eq!(tree.root().children().count(), 1);

    let child = tree.find_node_mut("/child").unwrap();
    child.add_property(DeviceTreeProperty::new("prop", "value"));
    child
        .property_mut("prop")
        .unwrap()
        .set_value("new-value".as_bytes());
    assert_eq!(
        tree.find_node("/child")
            .unwrap()
            .property("prop")
            .unwrap()
            .as_str(),
        Ok("new-value")
    );

    let child = tree.root_mut().child_mut("child").unwrap();
    assert!(child.remove_property("prop").is_some());
    assert_eq!(child.properties().count(), 0);

    assert!(tree.root_mut().remove_child("child").is_some());
    assert_eq!(tree.root().children().count(), 0);
}

#[test]
fn malformed_cells() {
    let prop = DeviceTreeProperty::new("reg", [0u8, 1, 2]);
    assert_eq!(prop.as_u32().unwrap_err().kind, ErrorKind::InvalidArgument);
}

#[test]
fn device_tree_format() {
    let tree = DeviceTree::new(
        DeviceTreeNode::builder("")
            .child(
                DeviceTreeNode::builder("child-a")
                    .child(DeviceTreeNode::builder("child-a-a").build())
                    .build(),
            )
            .child(DeviceTreeNode::builder("child-b").build())
            .build(),
    );

    assert_eq!(
        tree.to_string(),
        r#"/dts-v1/;

/ {
    child-a {
        child-a-a {
        };
    };

    child-b {
    };
};
"#
    );
}

#[test]
fn live_snapshot_matches_model() {
    let model = DeviceTree::new(
        DeviceTreeNode::builder("")
            .property(DeviceTreeProperty::new("model", "test-board\0"))
            .child(
                DeviceTreeNode::builder("soc")
                    .property(DeviceTreeProperty::new("phandle", 1u32.to_be_bytes()))
                    .child(
                        DeviceTreeNode::builder("uart@1000")
                            .property(DeviceTreeProperty::new("compatible", "ns16550a\0"))
                            .property(DeviceTreeProperty::new("reg", 0x1000u32.to_be_bytes()))
                            .build(),
                    )
                    .build(),
            )
            .child(DeviceTreeNode::new("chosen"))
            .build(),
    );

    let tree = LiveTree::from_model(&model, LiveTreeConfig::new()).unwrap();
    assert_eq!(tree.snapshot(), model);
    assert_eq!(tree.snapshot().to_string(), model.to_string());

    let soc = tree.find_node_by_path("/soc").unwrap();
    assert_eq!(tree.snapshot_node(&soc).as_ref(), model.find_node("/soc"));
}
