// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Arc, Mutex};

use live_device_tree::notifier::{ReconfigAction, ReconfigEvent, ReconfigObserver, Veto};
use live_device_tree::transaction::TransactionState;
use live_device_tree::{ErrorKind, LiveTree, Property};

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<(ReconfigAction, String)>>>,
}

impl Recorder {
    fn take(&self) -> Vec<(ReconfigAction, String)> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl ReconfigObserver for Recorder {
    fn handle_change(&self, event: &ReconfigEvent<'_>) -> Result<(), Veto> {
        let subject = match event.property {
            Some(property) => format!("{}:{}", event.node.full_path(), property.name()),
            None => event.node.full_path().to_owned(),
        };
        self.events.lock().unwrap().push((event.action, subject));
        Ok(())
    }
}

/// Vetoes adding or updating a property with the given name.
struct VetoProperty(&'static str);

impl ReconfigObserver for VetoProperty {
    fn handle_change(&self, event: &ReconfigEvent<'_>) -> Result<(), Veto> {
        let is_write = matches!(
            event.action,
            ReconfigAction::AddProperty | ReconfigAction::UpdateProperty
        );
        if is_write && event.property.is_some_and(|prop| prop.name() == self.0) {
            return Err(Veto::new(format!("{} is read-only", self.0)));
        }
        Ok(())
    }
}

fn event(action: ReconfigAction, subject: &str) -> (ReconfigAction, String) {
    (action, subject.to_owned())
}

#[test]
fn events_in_order() {
    let tree = LiveTree::new();
    let recorder = Recorder::default();
    tree.register_notifier(recorder.clone());

    let dev = tree.create_node(&tree.root(), "dev", None, 0).unwrap();
    let mut tx = tree.transaction();
    tx.start().unwrap();
    tx.attach_node(&dev).unwrap();
    tx.add_property(&dev, Property::new("compatible", "vendor,dev\0"))
        .unwrap();
    tx.apply().unwrap();
    assert_eq!(
        recorder.take(),
        [
            event(ReconfigAction::AttachNode, "/dev"),
            event(ReconfigAction::AddProperty, "/dev:compatible"),
        ]
    );

    tx.commit().unwrap();
    assert_eq!(
        recorder.take(),
        [event(ReconfigAction::CreateDevice, "/dev")]
    );

    tx.revert().unwrap();
    assert_eq!(
        recorder.take(),
        [
            event(ReconfigAction::RemoveProperty, "/dev:compatible"),
            event(ReconfigAction::DetachNode, "/dev"),
            event(ReconfigAction::DestroyDevice, "/dev"),
        ]
    );
}

#[test]
fn update_events_carry_old_value() {
    let tree = LiveTree::new();
    let root = tree.root();
    tree.add_property(&root, Property::new("model", "a\0")).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tree.register_notifier(move |event: &ReconfigEvent<'_>| -> Result<(), Veto> {
        if event.action == ReconfigAction::UpdateProperty {
            let new = event.property.map(|prop| prop.as_str().unwrap().to_owned());
            let old = event
                .old_property
                .map(|prop| prop.as_str().unwrap().to_owned());
            sink.lock().unwrap().push((new, old));
        }
        Ok(())
    });

    tree.update_property(&root, Property::new("model", "b\0"))
        .unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        [(Some("b".to_owned()), Some("a".to_owned()))]
    );
}

#[test]
fn veto_rolls_back_transaction() {
    let tree = LiveTree::new();
    let root = tree.root();
    let recorder = Recorder::default();
    tree.register_notifier(recorder.clone());
    tree.register_notifier(VetoProperty("locked"));

    let mut tx = tree.transaction();
    tx.start().unwrap();
    tx.add_property(&root, Property::new("free", "x\0")).unwrap();
    tx.add_property(&root, Property::new("locked", "y\0")).unwrap();
    let err = tx.apply().unwrap_err();

    assert_eq!(err.kind, ErrorKind::Vetoed(Veto::new("locked is read-only")));
    assert_eq!(err.subject(), "/:locked");
    assert_eq!(tx.state(), TransactionState::InProgress);
    assert!(tree.property(&root, "free").is_none());
    assert!(tree.property(&root, "locked").is_none());
    assert_eq!(
        recorder.take(),
        [
            event(ReconfigAction::AddProperty, "/:free"),
            event(ReconfigAction::AddProperty, "/:locked"),
            event(ReconfigAction::RemoveProperty, "/:free"),
        ]
    );

    tx.abort().unwrap();
    assert_eq!(tx.state(), TransactionState::Ready);
    assert!(tx.entries().is_empty());
}

#[test]
fn first_veto_stops_the_chain() {
    let tree = LiveTree::new();
    tree.register_notifier(VetoProperty("locked"));
    let recorder = Recorder::default();
    tree.register_notifier(recorder.clone());

    let err = tree
        .add_property(&tree.root(), Property::new("locked", "y\0"))
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Vetoed(_)));
    assert!(recorder.take().is_empty());
}

#[test]
fn detached_property_edits_are_silent() {
    let tree = LiveTree::new();
    let recorder = Recorder::default();
    tree.register_notifier(recorder.clone());

    let node = tree.create_node(&tree.root(), "pending", None, 0).unwrap();
    tree.add_property(&node, Property::new("compatible", "vendor,dev\0"))
        .unwrap();
    tree.update_property(&node, Property::new("compatible", "vendor,dev2\0"))
        .unwrap();
    tree.remove_property(&node, "compatible").unwrap();
    assert!(recorder.take().is_empty());

    tree.attach_node(&node).unwrap();
    assert_eq!(
        recorder.take(),
        [event(ReconfigAction::AttachNode, "/pending")]
    );
}

#[test]
fn unregistered_observers_are_not_called() {
    let tree = LiveTree::new();
    let recorder = Recorder::default();
    let id = tree.register_notifier(recorder.clone());
    let veto = tree.register_notifier(VetoProperty("model"));

    assert!(tree.unregister_notifier(veto));
    assert!(!tree.unregister_notifier(veto));
    tree.add_property(&tree.root(), Property::new("model", "x\0"))
        .unwrap();
    assert_eq!(recorder.take().len(), 1);

    assert!(tree.unregister_notifier(id));
    tree.remove_property(&tree.root(), "model").unwrap();
    assert!(recorder.take().is_empty());
}

#[test]
fn device_events_follow_the_tree() {
    let tree = LiveTree::new();
    let dev = tree.create_node(&tree.root(), "dev", None, 0).unwrap();
    tree.attach_node(&dev).unwrap();
    let recorder = Recorder::default();
    tree.register_notifier(recorder.clone());

    let mut tx = tree.transaction();
    tx.start().unwrap();
    tx.add_property(&dev, Property::new("compatible", "vendor,dev\0"))
        .unwrap();
    // Disabled after staging, before applying.
    tree.add_property(&dev, Property::new("status", "disabled\0"))
        .unwrap();
    recorder.take();

    tx.apply().unwrap();
    tx.commit().unwrap();
    assert!(!tree.is_available(&dev));
    assert!(tx.device_changes().is_empty());
    assert_eq!(
        recorder.take(),
        [event(ReconfigAction::AddProperty, "/dev:compatible")]
    );

    tree.update_property(&dev, Property::new("status", "okay\0"))
        .unwrap();
    assert!(tree.is_available(&dev));
    assert_eq!(
        recorder.take(),
        [
            event(ReconfigAction::UpdateProperty, "/dev:status"),
            event(ReconfigAction::CreateDevice, "/dev"),
        ]
    );

    tx.revert().unwrap();
    assert!(!tree.is_available(&dev));
    assert_eq!(
        recorder.take(),
        [
            event(ReconfigAction::RemoveProperty, "/dev:compatible"),
            event(ReconfigAction::DestroyDevice, "/dev"),
        ]
    );
}

#[test]
fn observers_cannot_edit_the_tree() {
    let tree = LiveTree::new();
    let nested = Arc::new(Mutex::new(None));
    let seen = nested.clone();
    let inner = tree.clone();
    tree.register_notifier(move |event: &ReconfigEvent<'_>| -> Result<(), Veto> {
        if event.action == ReconfigAction::AddProperty {
            let result = inner.add_property(&inner.root(), Property::new("serial", "1\0"));
            *seen.lock().unwrap() = Some(result.map_err(|err| err.kind));
        }
        Ok(())
    });

    let root = tree.root();
    tree.add_property(&root, Property::new("model", "board\0"))
        .unwrap();
    assert_eq!(*nested.lock().unwrap(), Some(Err(ErrorKind::Busy)));
    assert_eq!(tree.read_string(&root, "model").unwrap(), "board");
    assert!(tree.property(&root, "serial").is_none());
}
