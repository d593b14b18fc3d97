// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A thin but safe Rust layer around the Linux GPIO character device uAPI
//! and the epoll readiness-notification calls used to watch its descriptors.

use std::ffi::OsStr;
use std::fmt;
use std::io::Error as IoError;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::prelude::RawFd;
use std::slice;
use std::str::FromStr;
use std::str::Utf8Error;

/// This module implements GPIO ABI v1 which was released in Linux v4.8.
pub mod v1;

/// This module wraps the epoll and eventfd calls used to wait for
/// edge events across multiple line descriptors.
pub mod epoll;

/// The result returned by [`devio_uapi`] functions.
///
/// [`devio_uapi`]: crate
pub type Result<T> = std::result::Result<T, Error>;

/// Result returned by struct validators.
pub type ValidationResult = std::result::Result<(), ValidationError>;

/// Errors returned by [`devio_uapi`] functions.
///
/// [`devio_uapi`]: crate
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum Error {
    /// An error returned from an underlying system call.
    #[error(transparent)]
    Os(Errno),

    /// The response to a system call contained unexpected content.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A read returned fewer bytes than the event requires.
    #[error(transparent)]
    UnderRead(#[from] UnderReadError),
}

impl Error {
    /// Capture the errno left behind by a failed system call.
    pub fn from_errno() -> Error {
        Error::Os(Errno(IoError::last_os_error().raw_os_error().unwrap_or(0)))
    }

    /// The captured errno, if this error wraps a system call failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Os(e) => Some(e.0),
            _ => None,
        }
    }
}

/// The error number returned by a failed system call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Errno(pub i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", IoError::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Errno {}

/// A failure to validate a struct returned from a system call.
//
// Should only be seen if a kernel update adds an enum value we are unaware of.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("kernel returned invalid {field}: {msg}")]
pub struct ValidationError {
    pub field: String,
    pub msg: String,
}

impl ValidationError {
    pub fn new<S: Into<String>, T: Into<String>>(field: S, msg: T) -> ValidationError {
        ValidationError {
            field: field.into(),
            msg: msg.into(),
        }
    }
}

/// A read of an event struct returned fewer bytes than the struct requires.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("reading {kind} requires {expected} bytes, got {found}")]
pub struct UnderReadError {
    pub kind: &'static str,
    pub expected: usize,
    pub found: usize,
}

impl UnderReadError {
    pub fn new(kind: &'static str, expected: usize, found: usize) -> UnderReadError {
        UnderReadError {
            kind,
            expected,
            found,
        }
    }
}

/// An identifier for a line on a particular chip.
///
/// Valid offsets are in the range 0..`num_lines` as reported in the
/// [`ChipInfo`](v1::ChipInfo).
pub type Offset = u32;

/// Close a chip or line request descriptor.
///
/// The caller must own the descriptor; it is invalid after the call.
pub fn close(fd: RawFd) -> Result<()> {
    // SAFETY: ownership of fd is taken from the caller.
    match unsafe { libc::close(fd) } {
        0 => Ok(()),
        _ => Err(Error::from_errno()),
    }
}

/// The maximum number of bytes stored in a Name.
pub const NAME_MAX: usize = 32;

/// The maximum number of lines that may be requested in a single request.
pub const LINES_MAX: usize = 64;

/// A uAPI name string.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Name([u8; NAME_MAX]);

impl Name {
    /// Checks whether the Name is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    /// The length of the contained name.
    #[inline]
    pub fn strlen(&self) -> usize {
        self.0.iter().position(|&x| x == 0).unwrap_or(self.0.len())
    }

    /// Convert the contained name to an OsStr slice.
    pub fn as_os_str(&self) -> &OsStr {
        // SAFETY: strlen bounds the slice within the array.
        unsafe { OsStr::from_bytes(slice::from_raw_parts(&self.0[0], self.strlen())) }
    }
}

impl FromStr for Name {
    type Err = Utf8Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut n: Name = Default::default();
        for (src, dst) in s.as_bytes().iter().zip(n.0.iter_mut()) {
            *dst = *src;
        }
        Ok(n)
    }
}

impl From<&Name> for String {
    fn from(n: &Name) -> String {
        String::from(n.as_os_str().to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_from_str() {
        let a = Name::from_str("banana").unwrap();
        assert_eq!(a.as_os_str(), "banana");
        assert_eq!(a.strlen(), 6);
        let a = Name::from_str("an overly long truncated name -><- cut here").unwrap();
        assert_eq!(a.as_os_str(), "an overly long truncated name ->");
        assert_eq!(a.strlen(), NAME_MAX);
    }

    #[test]
    fn name_is_empty() {
        let mut a = Name::default();
        assert!(a.is_empty());
        a = Name::from_str("banana").unwrap();
        assert!(!a.is_empty());
    }

    #[test]
    fn name_to_string() {
        let a = Name::from_str("gpiochip0").unwrap();
        assert_eq!(String::from(&a), "gpiochip0");
        assert_eq!(String::from(&Name::default()), "");
    }

    #[test]
    fn errno_display() {
        let e = Errno(libc::EINVAL);
        assert!(format!("{}", e).contains("os error"));
    }
}
