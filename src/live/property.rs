// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::{FromBytes, big_endian};

use crate::error::{Error, ErrorKind};
use crate::model::DeviceTreeProperty;

/// Name prefix of properties whose contents are hidden from read-only
/// exposure layers.
pub const SENSITIVE_PREFIX: &str = "security-";

/// An immutable property of a live tree node.
///
/// Properties are shared as `Arc<Property>` and never modified in place: an
/// update installs a new instance and retires the previous one to the node's
/// dead property list, where a revert can find it again.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Property {
    name: String,
    value: Vec<u8>,
}

impl Property {
    /// Creates a new property with the given name and value.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::Property;
    /// let prop = Property::new("status", "okay");
    /// assert_eq!(prop.name(), "status");
    /// assert_eq!(prop.len(), 4);
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Duplicates a name and value into a new property, reporting allocation
    /// failure instead of aborting.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::OutOfResources`] if the name or value buffer
    /// cannot be allocated.
    pub fn try_copy(name: &str, value: &[u8]) -> Result<Self, Error> {
        let mut owned_name = String::new();
        owned_name
            .try_reserve_exact(name.len())
            .map_err(|_e| Error::new(ErrorKind::OutOfResources, name))?;
        owned_name.push_str(name);

        let mut owned_value = Vec::new();
        owned_value
            .try_reserve_exact(value.len())
            .map_err(|_e| Error::new(ErrorKind::OutOfResources, name))?;
        owned_value.extend_from_slice(value);

        Ok(Self {
            name: owned_name,
            value: owned_value,
        })
    }

    /// Returns the name of this property.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value of this property.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Returns the length of the value in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Returns `true` if the property has no value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Returns `true` if the property's name carries the
    /// [`SENSITIVE_PREFIX`].
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        self.name.starts_with(SENSITIVE_PREFIX)
    }

    /// Returns the size an exposure layer should report for this property.
    ///
    /// Sensitive properties report zero, while their contents remain readable
    /// through [`value`](Self::value).
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::Property;
    /// assert_eq!(Property::new("security-key", [1u8, 2, 3]).exposed_len(), 0);
    /// assert_eq!(Property::new("reg", [1u8, 2, 3]).exposed_len(), 3);
    /// ```
    #[must_use]
    pub fn exposed_len(&self) -> usize {
        if self.is_sensitive() { 0 } else { self.len() }
    }

    /// Returns the value of this property as a big-endian `u32` cell.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the value is not exactly four
    /// bytes long.
    pub fn as_u32(&self) -> Result<u32, Error> {
        big_endian::U32::ref_from_bytes(&self.value)
            .map(|val| val.get())
            .map_err(|_e| Error::new(ErrorKind::InvalidArgument, self.name.as_str()))
    }

    /// Returns the value of this property as a string, without trailing NUL
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the value is not valid UTF-8.
    pub fn as_str(&self) -> Result<&str, Error> {
        core::str::from_utf8(&self.value)
            .map(|s| s.trim_end_matches('\0'))
            .map_err(|_e| Error::new(ErrorKind::InvalidArgument, self.name.as_str()))
    }
}

impl From<&Property> for DeviceTreeProperty {
    fn from(property: &Property) -> Self {
        DeviceTreeProperty::new(property.name.as_str(), property.value.as_slice())
    }
}

impl From<DeviceTreeProperty> for Property {
    fn from(property: DeviceTreeProperty) -> Self {
        Property::new(property.name(), property.value())
    }
}

/// Decides whether a node with the given `compatible` and `status`
/// properties should have a bound device.
///
/// A node is available if it has a non-empty `compatible` property and
/// either no `status` property or a `status` of `"okay"` or `"ok"`.
///
/// # Examples
///
/// ```
/// # use live_device_tree::{Property, is_available};
/// let compatible = Property::new("compatible", "vendor,dev");
/// let disabled = Property::new("status", "disabled");
/// assert!(is_available(Some(&compatible), None));
/// assert!(!is_available(Some(&compatible), Some(&disabled)));
/// assert!(!is_available(None, None));
/// ```
#[must_use]
pub fn is_available(compatible: Option<&Property>, status: Option<&Property>) -> bool {
    let Some(compatible) = compatible else {
        return false;
    };
    if compatible.is_empty() {
        return false;
    }
    match status {
        None => true,
        Some(status) => matches!(status.as_str(), Ok("okay" | "ok")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compatible() -> Property {
        Property::new("compatible", "vendor,dev\0")
    }

    #[test]
    fn available_without_status() {
        assert!(is_available(Some(&compatible()), None));
    }

    #[test]
    fn available_with_okay_status() {
        assert!(is_available(
            Some(&compatible()),
            Some(&Property::new("status", "okay\0"))
        ));
        assert!(is_available(
            Some(&compatible()),
            Some(&Property::new("status", "ok"))
        ));
    }

    #[test]
    fn unavailable_without_compatible() {
        assert!(!is_available(None, None));
        assert!(!is_available(None, Some(&Property::new("status", "okay"))));
        assert!(!is_available(
            Some(&Property::new("compatible", "")),
            Some(&Property::new("status", "okay"))
        ));
    }

    #[test]
    fn unavailable_with_empty_or_disabled_status() {
        assert!(!is_available(
            Some(&compatible()),
            Some(&Property::new("status", ""))
        ));
        assert!(!is_available(
            Some(&compatible()),
            Some(&Property::new("status", "disabled"))
        ));
    }

    #[test]
    fn sensitive_properties_hide_their_size() {
        let prop = Property::new("security-token", [0xaau8; 16]);
        assert!(prop.is_sensitive());
        assert_eq!(prop.exposed_len(), 0);
        assert_eq!(prop.value().len(), 16);
    }

    #[test]
    fn try_copy_duplicates_contents() {
        let prop = Property::try_copy("reg", &[0, 0, 0x10, 0]).unwrap();
        assert_eq!(prop.name(), "reg");
        assert_eq!(prop.as_u32().unwrap(), 0x1000);
    }
}
