// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration of a [`LiveTree`](crate::LiveTree).

/// What happens to a detached node once its last handle is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// The node is moved to the graveyard with its properties preserved.
    ///
    /// Observers may still look at a node shortly after it was detached, so
    /// this is the default.
    #[default]
    Keep,
    /// The node and its properties are freed.
    Free,
}

/// Options for building a [`LiveTree`](crate::LiveTree).
///
/// # Examples
///
/// ```
/// # use live_device_tree::{LiveTreeConfig, ReleasePolicy};
/// assert_eq!(LiveTreeConfig::new().policy(), ReleasePolicy::Keep);
///
/// let config = LiveTreeConfig::new().release_policy(ReleasePolicy::Free);
/// assert_eq!(config.policy(), ReleasePolicy::Free);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveTreeConfig {
    release_policy: ReleasePolicy,
}

impl LiveTreeConfig {
    /// Creates a configuration with every option left at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets what happens to released detached nodes.
    #[must_use]
    pub fn release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    /// Returns the configured release policy.
    #[must_use]
    pub fn policy(&self) -> ReleasePolicy {
        self.release_policy
    }
}
