// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A live, mutable device tree with transactional edits and revertible
//! overlays.
//!
//! The library is built around three layers:
//!
//! - The [`LiveTree`], a shared tree of reference-counted [`Node`]s and
//!   immutable [`Property`] values. All structural changes happen under a
//!   single lock, and detached nodes stay valid for as long as someone holds
//!   a handle to them.
//! - [`Transaction`]s, which stage primitive edits (attach/detach a node,
//!   add/remove/update a property), apply them atomically while telling
//!   registered [observers](notifier::ReconfigObserver) about each one, and
//!   can later revert them.
//! - [Overlays](overlay), which merge a patch tree into the live tree through
//!   a transaction, track which nodes became available or unavailable, and
//!   are kept in an [`OverlayRegistry`](overlay::OverlayRegistry) that only
//!   lets the most recent overlays touching a part of the tree be removed.
//!
//! Detached descriptions of trees (initial contents, overlay bundles and
//! snapshots) use the owned types of the [`model`] module, which also print
//! themselves as DTS source.
//!
//! The library is `#![no_std]` and only needs `alloc`.
//!
//! # Examples
//!
//! ```
//! use live_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};
//! use live_device_tree::overlay::OverlayRegistry;
//! use live_device_tree::{LiveTree, LiveTreeConfig};
//!
//! let base = DeviceTree::new(
//!     DeviceTreeNode::builder("")
//!         .child(
//!             DeviceTreeNode::builder("soc")
//!                 .property(DeviceTreeProperty::new("phandle", 1u32.to_be_bytes()))
//!                 .build(),
//!         )
//!         .build(),
//! );
//! let tree = LiveTree::from_model(&base, LiveTreeConfig::new()).unwrap();
//!
//! // Add an enabled UART below the node with phandle 1.
//! let bundle = DeviceTree::new(
//!     DeviceTreeNode::builder("")
//!         .child(
//!             DeviceTreeNode::builder("fragment@0")
//!                 .property(DeviceTreeProperty::new("target", 1u32.to_be_bytes()))
//!                 .child(
//!                     DeviceTreeNode::builder("__overlay__")
//!                         .child(
//!                             DeviceTreeNode::builder("uart@1000")
//!                                 .property(DeviceTreeProperty::new("compatible", "ns16550a\0"))
//!                                 .build(),
//!                         )
//!                         .build(),
//!                 )
//!                 .build(),
//!         )
//!         .build(),
//! );
//!
//! let registry = OverlayRegistry::new(&tree);
//! let id = registry.create(&bundle).unwrap();
//! let uart = tree.find_node_by_path("/soc/uart@1000").unwrap();
//! assert!(tree.is_available(&uart));
//!
//! registry.destroy(id).unwrap();
//! assert!(!tree.is_attached(&uart));
//! println!("{}", tree.snapshot());
//! ```

#![no_std]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

extern crate alloc;

pub mod config;
pub mod error;
mod live;
pub mod model;
pub mod notifier;
pub mod overlay;
pub mod transaction;

pub use config::{LiveTreeConfig, ReleasePolicy};
pub use error::{Error, ErrorKind, Result};
pub use live::{LiveTree, Node, NodeId, Property, SENSITIVE_PREFIX, is_available};
pub use transaction::Transaction;
