// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A hardware abstraction layer for single board computer peripherals,
//! built on the Linux GPIO character device.
//!
//! Chips and their lines can be discovered and provisioned using the
//! [`chip`] module.
//!
//! Device wrappers over provisioned lines, and the registry that enforces
//! exclusive ownership of physical resources, live in the [`gpio`] and
//! [`registry`] modules.
//!
//! All kernel access is routed through a [`Backend`], so the entire stack
//! can be exercised against the in-memory simulator in [`sim`] as well as
//! real hardware.
//!
//! To read a line on real hardware:
//! ```no_run
//! # use devio::Result;
//! use devio::{Chip, Pull, EdgeTrigger};
//!
//! # fn main() -> Result<()> {
//! let chip = Chip::from_path("/dev/gpiochip0")?;
//! let l3 = chip.provision_input(3, Pull::None, EdgeTrigger::None)?;
//! let value = l3.value()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Backend`]: backend::Backend

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The kernel port seam: the [`Backend`](backend::Backend) trait and its
/// production implementation.
pub mod backend;

/// Types and functions specific to chips.
pub mod chip;

/// Types specific to lines.
pub mod line;

/// The per-chip edge event dispatcher.
pub mod events;

/// Digital input/output device wrappers and their capability traits.
pub mod gpio;

/// The device registry enforcing exclusive ownership of physical resources.
pub mod registry;

/// An in-memory backend simulating chips and lines for deterministic tests.
pub mod sim;

pub use backend::{Backend, Native};
pub use chip::{chips, chips_on, Chip};
pub use line::{Direction, EdgeKind, EdgeTrigger, Line, Pull};
pub use registry::DeviceRegistry;

/// A kernel descriptor for an open chip or requested line.
pub type Descriptor = i32;

/// Errors returned by [`devio`] functions.
///
/// [`devio`]: crate
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// Problem accessing a GPIO chip character device.
    #[error("\"{0}\" {1}.")]
    Open(PathBuf, chip::OpenErrorKind),

    /// An offset outside the chip's line array.
    #[error("invalid offset {offset}, must be in 0..{num_lines}.")]
    InvalidOffset {
        offset: line::Offset,
        num_lines: u32,
    },

    /// The offset is already provisioned by this process.
    #[error("line {0} is already reserved.")]
    AlreadyReserved(line::Offset),

    /// The registry key already maps to an open device.
    #[error("device \"{0}\" is already open.")]
    AlreadyOpen(String),

    /// An error returned from an underlying kernel call.
    #[error("kernel {0} returned: {1}")]
    Ioctl(KernelCall, #[source] devio_uapi::Error),

    /// A bounded wait exceeded its deadline.
    #[error("wait timed out after {0:?}.")]
    Timeout(Duration),

    /// The requested capability is unavailable on this backend or kernel.
    #[error("{0} is not supported by this backend.")]
    Unsupported(&'static str),

    /// The operation was attempted on a closed device.
    #[error("device is closed.")]
    Closed,
}

/// Identifiers for the underlying kernel calls.
#[doc(hidden)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelCall {
    GetChipInfo,
    GetLineInfo,
    GetLineHandle,
    GetLineEvent,
    GetLineValues,
    SetLineValues,
    ReadEvent,
    WaitEvent,
    EpollCreate,
    EpollCtl,
    EpollWait,
    Close,
}

impl fmt::Display for KernelCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelCall::GetChipInfo => "get_chip_info",
            KernelCall::GetLineInfo => "get_line_info",
            KernelCall::GetLineHandle => "get_line_handle",
            KernelCall::GetLineEvent => "get_line_event",
            KernelCall::GetLineValues => "get_line_values",
            KernelCall::SetLineValues => "set_line_values",
            KernelCall::ReadEvent => "read_event",
            KernelCall::WaitEvent => "wait_event",
            KernelCall::EpollCreate => "epoll_create",
            KernelCall::EpollCtl => "epoll_ctl",
            KernelCall::EpollWait => "epoll_wait",
            KernelCall::Close => "close",
        };
        write!(f, "{}", name)
    }
}

/// The result for [`devio`] functions.
///
/// [`devio`]: crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            format!(
                "{}",
                Error::InvalidOffset {
                    offset: 9,
                    num_lines: 8
                }
            ),
            "invalid offset 9, must be in 0..8."
        );
        assert_eq!(
            format!("{}", Error::AlreadyOpen("gpio-17".into())),
            "device \"gpio-17\" is already open."
        );
        assert_eq!(
            format!("{}", Error::Unsupported("line bias")),
            "line bias is not supported by this backend."
        );
        assert_eq!(format!("{}", Error::Closed), "device is closed.");
    }

    #[test]
    fn kernel_call_display() {
        assert_eq!(format!("{}", KernelCall::GetLineHandle), "get_line_handle");
        assert_eq!(format!("{}", KernelCall::EpollWait), "epoll_wait");
    }
}
