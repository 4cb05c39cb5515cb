// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for the `live_device_tree` crate.

use alloc::string::String;
use core::fmt;

use crate::notifier::Veto;
use crate::overlay::OverlayId;

/// A specialized [`Result`](core::result::Result) type for live tree
/// operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// An error that can occur when editing a live device tree or applying an
/// overlay to it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Error {
    subject: String,
    /// The type of the error that has occurred.
    pub kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind,
        }
    }

    /// Returns what the error is about: a node path, an overlay fragment
    /// name or an overlay ID.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// The kind of an error that can occur when editing a live device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A node, property, overlay target or overlay ID could not be found.
    NotFound,
    /// A property or child node with the same name already exists, or a
    /// phandle is already taken.
    AlreadyExists,
    /// The request is malformed, e.g. an overlay fragment has no target or a
    /// node handle belongs to another tree.
    InvalidArgument,
    /// An allocation or an identifier space was exhausted.
    OutOfResources,
    /// A reconfiguration observer rejected the change.
    Vetoed(Veto),
    /// The transaction is not in a state that allows the operation, or
    /// another apply or revert on the same tree is running.
    Busy,
    /// The change clashes with a newer one. For overlay removal, `blocking`
    /// is the more recently applied overlay that prevents it.
    Conflict {
        /// The overlay that blocks the operation, if any.
        blocking: Option<OverlayId>,
    },
    /// A revert found the tree in a state it cannot undo, e.g. a retired
    /// property is missing from the dead property list.
    InternalInconsistency,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at `{}`", self.kind, self.subject)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfResources => write!(f, "out of resources"),
            Self::Vetoed(veto) => write!(f, "change vetoed: {veto}"),
            Self::Busy => write!(f, "transaction is busy"),
            Self::Conflict {
                blocking: Some(overlay),
            } => write!(f, "conflicts with overlay {overlay}"),
            Self::Conflict { blocking: None } => write!(f, "conflicts with a concurrent change"),
            Self::InternalInconsistency => write!(f, "internal inconsistency"),
        }
    }
}

impl core::error::Error for Error {}
