// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use zerocopy::{FromBytes, big_endian};

use crate::error::{Error, ErrorKind};

/// An owned, mutable device tree property, as found in a [`DeviceTree`]
/// description.
///
/// [`DeviceTree`]: crate::model::DeviceTree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTreeProperty {
    name: String,
    value: Vec<u8>,
}

impl DeviceTreeProperty {
    /// Creates a new `DeviceTreeProperty` with the given name and value.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::model::DeviceTreeProperty;
    /// let prop = DeviceTreeProperty::new("my-prop", vec![1, 2, 3, 4]);
    /// assert_eq!(prop.name(), "my-prop");
    /// assert_eq!(prop.value(), &[1, 2, 3, 4]);
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Creates a property with no value, e.g. a boolean flag or a removal
    /// marker such as `-status`.
    #[must_use]
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
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

    /// Sets the value of this property.
    pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    /// Returns the value of this property as a big-endian `u32` cell.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the value is not exactly four
    /// bytes long.
    ///
    /// # Examples
    ///
    /// ```
    /// # use live_device_tree::model::DeviceTreeProperty;
    /// let prop = DeviceTreeProperty::new("phandle", 0x1234u32.to_be_bytes());
    /// assert_eq!(prop.as_u32().unwrap(), 0x1234);
    /// ```
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

    pub(crate) fn fmt(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        fmt_property(f, &self.name, &self.value, indent)
    }
}

/// Writes a property in DTS syntax, choosing between the string list, cell
/// and byte string forms based on the value.
pub(crate) fn fmt_property(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    value: &[u8],
    indent: usize,
) -> fmt::Result {
    write!(f, "{:indent$}{}", "", name, indent = indent)?;

    if value.is_empty() {
        return writeln!(f, ";");
    }

    let is_printable = value
        .iter()
        .all(|&ch| ch.is_ascii_graphic() || ch == b' ' || ch == 0);
    let has_empty = value.windows(2).any(|window| window == [0, 0]);
    if is_printable && value.ends_with(&[0]) && !has_empty && value[0] != 0 {
        let mut strings = value[..value.len() - 1]
            .split(|&b| b == 0)
            .map(|s| core::str::from_utf8(s).unwrap_or_default());
        if let Some(first) = strings.next() {
            write!(f, " = \"{first}\"")?;
            for s in strings {
                write!(f, ", \"{s}\"")?;
            }
            return writeln!(f, ";");
        }
    }

    if value.len().is_multiple_of(4) {
        write!(f, " = <")?;
        for (i, chunk) in value.chunks_exact(4).enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            let val = big_endian::U32::ref_from_bytes(chunk).map_or(0, |val| val.get());
            write!(f, "0x{val:02x}")?;
        }
        writeln!(f, ">;")
    } else {
        write!(f, " = [")?;
        for (i, byte) in value.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        writeln!(f, "];")
    }
}
