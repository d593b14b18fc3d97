// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Readiness notification for line event descriptors.
//!
//! An [`Epoll`] context watches a set of descriptors, each tagged with a
//! caller supplied token, and blocks until one becomes readable.  An
//! [`Eventfd`] added to the set provides a way to wake the blocked waiter
//! from another thread.

use libc::{EPOLLIN, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL};
use std::os::unix::prelude::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{Error, Result};

/// The maximum number of readiness notifications returned by a single wait.
const EVENTS_MAX: usize = 16;

/// An epoll instance watching a set of tokenized descriptors.
#[derive(Debug)]
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    /// Create a new epoll context.
    pub fn new() -> Result<Epoll> {
        // SAFETY: on success the returned fd is owned here and only here.
        let fd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::from_errno());
        }
        // SAFETY: fd checked valid above.
        Ok(Epoll {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Add a descriptor to the watched set.
    ///
    /// The token is returned from [`wait`](Epoll::wait) when the descriptor
    /// becomes readable.
    pub fn add(&self, fd: RawFd, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: ev is a plain struct read by the kernel.
        match unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), EPOLL_CTL_ADD, fd, &mut ev) } {
            0 => Ok(()),
            _ => Err(Error::from_errno()),
        }
    }

    /// Remove a descriptor from the watched set.
    pub fn delete(&self, fd: RawFd) -> Result<()> {
        // SAFETY: the event argument is ignored for EPOLL_CTL_DEL.
        match unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        } {
            0 => Ok(()),
            _ => Err(Error::from_errno()),
        }
    }

    /// Block until watched descriptors become readable and return their tokens.
    ///
    /// A timeout of None blocks indefinitely.
    /// Returns an empty set if the timeout expires first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<u64>> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().try_into().unwrap_or(libc::c_int::MAX),
        };
        // SAFETY: epoll_event is plain data, all-zeroes is a valid value.
        let mut events: [libc::epoll_event; EVENTS_MAX] = unsafe { std::mem::zeroed() };
        loop {
            // SAFETY: the kernel writes at most EVENTS_MAX entries.
            let n = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    events.as_mut_ptr(),
                    EVENTS_MAX as libc::c_int,
                    timeout_ms,
                )
            };
            if n < 0 {
                let e = Error::from_errno();
                if e.errno() == Some(libc::EINTR) {
                    continue;
                }
                return Err(e);
            }
            return Ok(events[..n as usize].iter().map(|ev| ev.u64).collect());
        }
    }
}

impl AsRawFd for Epoll {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// An eventfd used to wake an [`Epoll`] waiter.
#[derive(Debug)]
pub struct Eventfd {
    fd: OwnedFd,
}

impl Eventfd {
    /// Create a new eventfd.
    pub fn new() -> Result<Eventfd> {
        // SAFETY: on success the returned fd is owned here and only here.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(Error::from_errno());
        }
        // SAFETY: fd checked valid above.
        Ok(Eventfd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Make the eventfd readable, waking any waiter watching it.
    pub fn notify(&self) -> Result<()> {
        let inc: u64 = 1;
        // SAFETY: writes exactly the 8 bytes eventfd requires.
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                std::ptr::addr_of!(inc) as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            return Err(Error::from_errno());
        }
        Ok(())
    }

    /// Consume any pending notifications, returning the eventfd to unreadable.
    pub fn clear(&self) -> Result<()> {
        let mut count: u64 = 0;
        // SAFETY: reads exactly the 8 bytes eventfd provides.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                std::ptr::addr_of_mut!(count) as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let e = Error::from_errno();
            // not readable means already clear
            if e.errno() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }
}

impl AsRawFd for Eventfd {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
