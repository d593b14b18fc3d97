// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::line::{self, EdgeKind, EdgeTrigger, Offset, Pull};
use crate::{chip, Descriptor, Error, KernelCall, Result};
use devio_uapi::{epoll, v1};
use std::fmt;
use std::fs;
use std::os::unix::prelude::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// The consumer label attached to kernel line requests.
const CONSUMER: &str = "devio";

/// The kernel port.
///
/// Everything the higher layers need from the platform is routed through
/// this trait: the chip and line request protocol, synchronous value
/// access, and the readiness-notification contexts used by the event
/// dispatcher.  [`Native`] implements it with real kernel calls; the
/// [`sim`](crate::sim) backend implements it in memory.
pub trait Backend: fmt::Debug + Send + Sync {
    /// The paths of all the GPIO character devices provided by this
    /// backend, sorted in name order.
    fn chip_paths(&self) -> Result<Vec<PathBuf>>;

    /// Open the chip at the given path, returning its descriptor and
    /// information.
    fn open_chip(&self, path: &Path) -> Result<(Descriptor, chip::Info)>;

    /// The metadata for a line on an open chip.
    fn line_info(&self, cfd: Descriptor, offset: Offset) -> Result<line::Info>;

    /// Request a line as an input, returning the line descriptor.
    ///
    /// A backend that cannot apply the requested pull fails with
    /// [`Error::Unsupported`] rather than dropping it.
    fn request_input(
        &self,
        cfd: Descriptor,
        offset: Offset,
        pull: Pull,
        trigger: EdgeTrigger,
    ) -> Result<Descriptor>;

    /// Request a line as an output driven to `initial`, returning the line
    /// descriptor.
    fn request_output(&self, cfd: Descriptor, offset: Offset, initial: bool) -> Result<Descriptor>;

    /// Read the logical value of a requested line.
    fn get_value(&self, lfd: Descriptor) -> Result<bool>;

    /// Set the logical value of a requested line.
    fn set_value(&self, lfd: Descriptor, value: bool) -> Result<()>;

    /// Wait for the line to have an edge event available to read.
    ///
    /// Returns false if the timeout expires with no event available.
    fn wait_edge(&self, lfd: Descriptor, timeout: Duration) -> Result<bool>;

    /// Read one raw edge event from a line descriptor requested with an
    /// edge trigger.
    fn read_edge(&self, lfd: Descriptor) -> Result<(u64, EdgeKind)>;

    /// Close a chip or line descriptor.
    fn close(&self, fd: Descriptor) -> Result<()>;

    /// Create a readiness-notification context.
    ///
    /// The [`EventWait`] half is owned by the poller thread; the
    /// [`Interest`] half adds and removes descriptors and wakes the waiter
    /// from other threads.  Dropping the [`EventWait`] closes the context.
    fn notifier(&self) -> Result<(Box<dyn EventWait>, Arc<dyn Interest>)>;
}

/// The outcome of one blocking wait on a readiness-notification context.
#[derive(Debug, Eq, PartialEq)]
pub enum Readiness {
    /// The listed descriptors have events available to read, in readiness
    /// order.
    Ready(Vec<Descriptor>),

    /// The waiter was woken via [`Interest::wake`].
    Woken,
}

/// The blocking half of a readiness-notification context.
pub trait EventWait: Send {
    /// Block until watched descriptors are readable, or the context is
    /// woken.
    fn wait(&mut self) -> Result<Readiness>;
}

/// The control half of a readiness-notification context.
pub trait Interest: Send + Sync {
    /// Add a descriptor to the watched set.
    fn add(&self, fd: Descriptor) -> Result<()>;

    /// Remove a descriptor from the watched set.
    ///
    /// Removing a descriptor that is not watched is a no-op.
    fn remove(&self, fd: Descriptor) -> Result<()>;

    /// Wake the blocked waiter.
    fn wake(&self) -> Result<()>;
}

/// The production backend, using the GPIO character device uAPI.
#[derive(Debug, Default)]
pub struct Native;

/// Check if a path corresponds to a GPIO character device.
///
/// Returns the resolved path to the character device.
fn is_chip<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let pb = fs::canonicalize(&path)
        .map_err(|e| Error::Open(path.as_ref().to_path_buf(), open_error_kind(&e)))?;
    // canonical paths of form /dev/gpiochipXX are assumed good
    if let Some(pbstr) = pb.to_str() {
        if let Some(num) = pbstr.strip_prefix("/dev/gpiochip") {
            if !num.is_empty() && num.chars().all(|c| char::is_digit(c, 10)) {
                return Ok(pb);
            }
        }
    }
    Err(Error::Open(pb, chip::OpenErrorKind::NotGpioChip))
}

fn open_error_kind(e: &std::io::Error) -> chip::OpenErrorKind {
    match e.kind() {
        std::io::ErrorKind::NotFound => chip::OpenErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => chip::OpenErrorKind::AccessDenied,
        _ => chip::OpenErrorKind::Os(e.raw_os_error().unwrap_or(0)),
    }
}

fn handle_flags(pull: Pull) -> v1::HandleRequestFlags {
    match pull {
        Pull::None => v1::HandleRequestFlags::default(),
        Pull::Up => v1::HandleRequestFlags::BIAS_PULL_UP,
        Pull::Down => v1::HandleRequestFlags::BIAS_PULL_DOWN,
    }
}

fn event_flags(trigger: EdgeTrigger) -> v1::EventRequestFlags {
    match trigger {
        EdgeTrigger::None => v1::EventRequestFlags::default(),
        EdgeTrigger::Rising => v1::EventRequestFlags::RISING_EDGE,
        EdgeTrigger::Falling => v1::EventRequestFlags::FALLING_EDGE,
        EdgeTrigger::Both => v1::EventRequestFlags::BOTH_EDGES,
    }
}

// Kernels prior to v5.5 reject requests carrying bias flags with EINVAL.
// That refusal is surfaced as Unsupported rather than being retried with
// the pull silently dropped.
fn map_request_err(call: KernelCall, pull: Pull, e: devio_uapi::Error) -> Error {
    if pull != Pull::None && e.errno() == Some(libc::EINVAL) {
        return Error::Unsupported("line bias");
    }
    Error::Ioctl(call, e)
}

impl Backend for Native {
    fn chip_paths(&self) -> Result<Vec<PathBuf>> {
        let mut chips = fs::read_dir("/dev")
            .map_err(|e| Error::Open(PathBuf::from("/dev"), open_error_kind(&e)))?
            .filter_map(|x| x.ok())
            .flat_map(|de| is_chip(de.path()))
            .collect::<Vec<PathBuf>>();
        chips.sort_unstable_by(|a, b| chip::path_compare(a, b));
        chips.dedup();
        Ok(chips)
    }

    fn open_chip(&self, path: &Path) -> Result<(Descriptor, chip::Info)> {
        let path = is_chip(path)?;
        let f = fs::File::open(&path).map_err(|e| Error::Open(path.clone(), open_error_kind(&e)))?;
        let fd = f.into_raw_fd();
        let ci = match v1::get_chip_info(fd) {
            Ok(ci) => ci,
            Err(e) => {
                _ = devio_uapi::close(fd);
                return Err(Error::Ioctl(KernelCall::GetChipInfo, e));
            }
        };
        Ok((fd, chip::Info::from(ci)))
    }

    fn line_info(&self, cfd: Descriptor, offset: Offset) -> Result<line::Info> {
        v1::get_line_info(cfd, offset)
            .map(|li| line::Info::from(&li))
            .map_err(|e| Error::Ioctl(KernelCall::GetLineInfo, e))
    }

    fn request_input(
        &self,
        cfd: Descriptor,
        offset: Offset,
        pull: Pull,
        trigger: EdgeTrigger,
    ) -> Result<Descriptor> {
        let consumer = devio_uapi::Name::from_str(CONSUMER).unwrap_or_default();
        if trigger == EdgeTrigger::None {
            let mut hr = v1::HandleRequest {
                flags: v1::HandleRequestFlags::INPUT | handle_flags(pull),
                consumer,
                num_lines: 1,
                ..Default::default()
            };
            hr.offsets.set(0, offset);
            return v1::get_line_handle(cfd, hr)
                .map(|f| f.into_raw_fd())
                .map_err(|e| map_request_err(KernelCall::GetLineHandle, pull, e));
        }
        let er = v1::EventRequest {
            offset,
            handleflags: v1::HandleRequestFlags::INPUT | handle_flags(pull),
            eventflags: event_flags(trigger),
            consumer,
            ..Default::default()
        };
        v1::get_line_event(cfd, er)
            .map(|f| f.into_raw_fd())
            .map_err(|e| map_request_err(KernelCall::GetLineEvent, pull, e))
    }

    fn request_output(&self, cfd: Descriptor, offset: Offset, initial: bool) -> Result<Descriptor> {
        let mut hr = v1::HandleRequest {
            flags: v1::HandleRequestFlags::OUTPUT,
            consumer: devio_uapi::Name::from_str(CONSUMER).unwrap_or_default(),
            num_lines: 1,
            ..Default::default()
        };
        hr.offsets.set(0, offset);
        hr.values.set(0, initial as u8);
        v1::get_line_handle(cfd, hr)
            .map(|f| f.into_raw_fd())
            .map_err(|e| Error::Ioctl(KernelCall::GetLineHandle, e))
    }

    fn get_value(&self, lfd: Descriptor) -> Result<bool> {
        let mut vals = v1::LineValues::default();
        v1::get_line_values(lfd, &mut vals)
            .map(|_| vals.get(0) != 0)
            .map_err(|e| Error::Ioctl(KernelCall::GetLineValues, e))
    }

    fn set_value(&self, lfd: Descriptor, value: bool) -> Result<()> {
        let mut vals = v1::LineValues::default();
        vals.set(0, value as u8);
        v1::set_line_values(lfd, &vals).map_err(|e| Error::Ioctl(KernelCall::SetLineValues, e))
    }

    fn wait_edge(&self, lfd: Descriptor, timeout: Duration) -> Result<bool> {
        v1::wait_event(lfd, timeout).map_err(|e| Error::Ioctl(KernelCall::WaitEvent, e))
    }

    fn read_edge(&self, lfd: Descriptor) -> Result<(u64, EdgeKind)> {
        v1::read_edge_event(lfd)
            .map(|le| (le.timestamp_ns, EdgeKind::from(le.kind)))
            .map_err(|e| Error::Ioctl(KernelCall::ReadEvent, e))
    }

    fn close(&self, fd: Descriptor) -> Result<()> {
        devio_uapi::close(fd).map_err(|e| Error::Ioctl(KernelCall::Close, e))
    }

    fn notifier(&self) -> Result<(Box<dyn EventWait>, Arc<dyn Interest>)> {
        let ep = epoll::Epoll::new().map_err(|e| Error::Ioctl(KernelCall::EpollCreate, e))?;
        let wake = epoll::Eventfd::new().map_err(|e| Error::Ioctl(KernelCall::EpollCreate, e))?;
        ep.add(wake.as_raw_fd(), WAKE_TOKEN)
            .map_err(|e| Error::Ioctl(KernelCall::EpollCtl, e))?;
        let ep = Arc::new(ep);
        let wake = Arc::new(wake);
        Ok((
            Box::new(NativeWait {
                epoll: ep.clone(),
                wake: wake.clone(),
            }),
            Arc::new(NativeInterest { epoll: ep, wake }),
        ))
    }
}

/// The token reserved for the wake eventfd in the epoll set.
const WAKE_TOKEN: u64 = u64::MAX;

#[derive(Debug)]
struct NativeWait {
    epoll: Arc<epoll::Epoll>,
    wake: Arc<epoll::Eventfd>,
}

impl EventWait for NativeWait {
    fn wait(&mut self) -> Result<Readiness> {
        let tokens = self
            .epoll
            .wait(None)
            .map_err(|e| Error::Ioctl(KernelCall::EpollWait, e))?;
        let fds: Vec<Descriptor> = tokens
            .iter()
            .filter(|t| **t != WAKE_TOKEN)
            .map(|t| *t as Descriptor)
            .collect();
        if !fds.is_empty() {
            // the wake, if any, is left pending and reported next wait
            return Ok(Readiness::Ready(fds));
        }
        self.wake
            .clear()
            .map_err(|e| Error::Ioctl(KernelCall::EpollWait, e))?;
        Ok(Readiness::Woken)
    }
}

#[derive(Debug)]
struct NativeInterest {
    epoll: Arc<epoll::Epoll>,
    wake: Arc<epoll::Eventfd>,
}

impl Interest for NativeInterest {
    fn add(&self, fd: Descriptor) -> Result<()> {
        self.epoll
            .add(fd, fd as u64)
            .map_err(|e| Error::Ioctl(KernelCall::EpollCtl, e))
    }

    fn remove(&self, fd: Descriptor) -> Result<()> {
        match self.epoll.delete(fd) {
            Ok(()) => Ok(()),
            // already gone, e.g. auto-removed when the descriptor closed
            Err(e) if matches!(e.errno(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            Err(e) => Err(Error::Ioctl(KernelCall::EpollCtl, e)),
        }
    }

    fn wake(&self) -> Result<()> {
        self.wake
            .notify()
            .map_err(|e| Error::Ioctl(KernelCall::EpollCtl, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_handle_flags() {
        assert_eq!(handle_flags(Pull::None), v1::HandleRequestFlags::default());
        assert_eq!(handle_flags(Pull::Up), v1::HandleRequestFlags::BIAS_PULL_UP);
        assert_eq!(
            handle_flags(Pull::Down),
            v1::HandleRequestFlags::BIAS_PULL_DOWN
        );
    }

    #[test]
    fn input_event_flags() {
        assert_eq!(
            event_flags(EdgeTrigger::None),
            v1::EventRequestFlags::default()
        );
        assert_eq!(
            event_flags(EdgeTrigger::Rising),
            v1::EventRequestFlags::RISING_EDGE
        );
        assert_eq!(
            event_flags(EdgeTrigger::Falling),
            v1::EventRequestFlags::FALLING_EDGE
        );
        assert_eq!(
            event_flags(EdgeTrigger::Both),
            v1::EventRequestFlags::BOTH_EDGES
        );
    }

    #[test]
    fn bias_refusal_is_surfaced() {
        let e = devio_uapi::Error::Os(devio_uapi::Errno(libc::EINVAL));
        assert_eq!(
            map_request_err(KernelCall::GetLineEvent, Pull::Up, e),
            Error::Unsupported("line bias")
        );
        let e = devio_uapi::Error::Os(devio_uapi::Errno(libc::EINVAL));
        assert_eq!(
            map_request_err(KernelCall::GetLineEvent, Pull::None, e),
            Error::Ioctl(
                KernelCall::GetLineEvent,
                devio_uapi::Error::Os(devio_uapi::Errno(libc::EINVAL))
            )
        );
        let e = devio_uapi::Error::Os(devio_uapi::Errno(libc::EBUSY));
        assert_eq!(
            map_request_err(KernelCall::GetLineEvent, Pull::Up, e),
            Error::Ioctl(
                KernelCall::GetLineEvent,
                devio_uapi::Error::Os(devio_uapi::Errno(libc::EBUSY))
            )
        );
    }
}
