// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::backend::{Backend, Native};
use crate::events::{Dispatcher, Listener};
use crate::line::{self, Direction, EdgeTrigger, Offset, Pull, Slot};
use crate::{Descriptor, Error, Result};
use devio_uapi::v1;
#[cfg(feature = "serde")]
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::prelude::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Compare two chip paths.
///
// Sorts paths naturally, assuming any chip numbering is at the end of the
// path - as it is for gpiochips.
pub fn path_compare(a: &Path, b: &Path) -> std::cmp::Ordering {
    let a = a.as_os_str().as_bytes();
    let b = b.as_os_str().as_bytes();

    if a.len() == b.len() {
        // if equal length then just compare lexicographically
        return a.cmp(b);
    }
    for (ai, bi) in a.iter().zip(b.iter()) {
        if *ai != *bi {
            if !ai.is_ascii_digit() || !bi.is_ascii_digit() {
                // if either is not a digit then this character is definitive
                return (*ai).cmp(bi);
            }
            // else drop thru to length comparison
            break;
        }
    }
    // equal up to the length of the shortest - shorter numbers are smaller
    a.len().cmp(&b.len())
}

/// Open every GPIO character device on the system.
///
/// The chips are sorted in name order and assigned cumulative global line
/// bases, so a flat GPIO number can be resolved across chips with
/// [`Chip::line_by_gpio`].
pub fn chips() -> Result<Vec<Chip>> {
    chips_on(Arc::new(Native))
}

/// Open every chip provided by the given backend.
///
/// As [`chips`], but on an explicit [`Backend`].
pub fn chips_on(backend: Arc<dyn Backend>) -> Result<Vec<Chip>> {
    let mut base = 0;
    let mut chips = Vec::new();
    for p in backend.chip_paths()? {
        let chip = Chip::new(backend.clone(), &p, base)?;
        base += chip.num_lines();
        chips.push(chip);
    }
    Ok(chips)
}

/// Reasons a path cannot be opened as a GPIO character device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenErrorKind {
    /// The device node does not exist.
    NotFound,

    /// The device node exists but is not accessible.
    AccessDenied,

    /// The path does not refer to a GPIO character device.
    NotGpioChip,

    /// The open failed with the contained errno.
    Os(i32),
}

impl fmt::Display for OpenErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenErrorKind::NotFound => write!(f, "could not be found"),
            OpenErrorKind::AccessDenied => write!(f, "is not accessible"),
            OpenErrorKind::NotGpioChip => write!(f, "is not a GPIO character device"),
            OpenErrorKind::Os(errno) => {
                write!(f, "could not be opened: {}", devio_uapi::Errno(*errno))
            }
        }
    }
}

/// The publicly available information for a GPIO chip.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct Info {
    /// The system name for the chip, such as "*gpiochip0*".
    pub name: String,

    /// A functional name for the chip.
    ///
    /// This typically identifies the type of GPIO chip.
    pub label: String,

    /// The number of lines provided by the chip.
    pub num_lines: u32,
}

impl From<v1::ChipInfo> for Info {
    fn from(ci: v1::ChipInfo) -> Self {
        Info {
            name: String::from(&ci.name),
            label: String::from(&ci.label),
            num_lines: ci.num_lines,
        }
    }
}

/// A GPIO character device.
///
/// The chip's line metadata is enumerated once at open and is immutable
/// thereafter; the live provisioning state is tracked separately, in the
/// chip's reservation table and the [`Line`](line::Line) handles it issues.
///
/// A Chip is a cheap cloneable handle; clones all refer to the same open
/// device.
#[derive(Clone, Debug)]
pub struct Chip {
    inner: Arc<ChipInner>,
}

#[derive(Debug)]
struct ChipInner {
    backend: Arc<dyn Backend>,

    /// The resolved path of the character device.
    path: PathBuf,

    info: Info,

    /// The global line number of this chip's line 0.
    base: u32,

    /// Line metadata, fixed at open.
    lines: Vec<line::Info>,

    /// The chip descriptor, present until the chip is closed.
    fd: Mutex<Option<Descriptor>>,

    /// The offsets currently provisioned by this process.
    ///
    /// The kernel does not enforce in-process exclusivity, so this table
    /// does.
    reservations: Mutex<HashMap<Offset, Arc<Slot>>>,

    /// The edge event dispatcher, started on first listener registration.
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Chip {
    /// Constructs a Chip using the given path.
    ///
    /// The path must resolve to a valid GPIO character device.
    ///
    /// # Examples
    ///```no_run
    /// # fn example() -> devio::Result<devio::Chip>{
    /// let chip = devio::Chip::from_path("/dev/gpiochip0")?;
    /// # Ok(chip)
    /// # }
    ///```
    pub fn from_path<P: AsRef<Path>>(p: P) -> Result<Chip> {
        Chip::new(Arc::new(Native), p.as_ref(), 0)
    }

    /// Constructs a Chip using the given name.
    ///
    /// The name must resolve to a valid GPIO character device.
    ///
    /// # Examples
    ///```no_run
    /// # fn example() -> devio::Result<devio::Chip>{
    /// let chip = devio::Chip::from_name("gpiochip0")?;
    /// # Ok(chip)
    /// # }
    ///```
    pub fn from_name(n: &str) -> Result<Chip> {
        Chip::new(Arc::new(Native), Path::new(&format!("/dev/{}", n)), 0)
    }

    /// Constructs a Chip at the given path on an explicit backend.
    pub fn from_path_on<P: AsRef<Path>>(backend: Arc<dyn Backend>, p: P) -> Result<Chip> {
        Chip::new(backend, p.as_ref(), 0)
    }

    fn new(backend: Arc<dyn Backend>, path: &Path, base: u32) -> Result<Chip> {
        let (fd, info) = backend.open_chip(path)?;
        // enumerate the line metadata while the chip is pristine
        let mut lines = Vec::with_capacity(info.num_lines as usize);
        for offset in 0..info.num_lines {
            match backend.line_info(fd, offset) {
                Ok(li) => lines.push(li),
                Err(e) => {
                    _ = backend.close(fd);
                    return Err(e);
                }
            }
        }
        Ok(Chip {
            inner: Arc::new(ChipInner {
                backend,
                path: path.to_path_buf(),
                info,
                base,
                lines,
                fd: Mutex::new(Some(fd)),
                reservations: Mutex::new(HashMap::new()),
                dispatcher: Mutex::new(None),
            }),
        })
    }

    /// Return the name of the chip, such as "*gpiochip0*".
    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    /// Return the functional label of the chip.
    pub fn label(&self) -> &str {
        &self.inner.info.label
    }

    /// Return the path of the chip.
    pub fn path(&self) -> &Path {
        self.inner.path.as_ref()
    }

    /// Get the information for the chip.
    pub fn info(&self) -> Info {
        self.inner.info.clone()
    }

    /// The number of lines provided by the chip.
    pub fn num_lines(&self) -> u32 {
        self.inner.info.num_lines
    }

    /// The global line number of this chip's line 0.
    ///
    /// Only meaningful for chips opened via [`chips`], which assigns the
    /// bases; a directly opened chip has base 0.
    pub fn gpio_base(&self) -> u32 {
        self.inner.base
    }

    /// The metadata for every line on the chip, in offset order.
    pub fn lines(&self) -> &[line::Info] {
        &self.inner.lines
    }

    /// The metadata for the line at the given offset.
    pub fn line_info(&self, offset: Offset) -> Result<&line::Info> {
        self.inner
            .lines
            .get(offset as usize)
            .ok_or(Error::InvalidOffset {
                offset,
                num_lines: self.inner.info.num_lines,
            })
    }

    /// Find the metadata for the named line.
    ///
    /// Returns the first matching line.
    pub fn find_line(&self, name: &str) -> Option<&line::Info> {
        self.inner.lines.iter().find(|li| li.name == name)
    }

    /// The metadata for the line with the given global GPIO number.
    ///
    /// Resolves against the base assigned by [`chips`].
    pub fn line_by_gpio(&self, gpio: u32) -> Option<&line::Info> {
        gpio.checked_sub(self.inner.base)
            .and_then(|offset| self.inner.lines.get(offset as usize))
    }

    /// Check if the chip has been closed.
    pub fn is_closed(&self) -> bool {
        self.descriptor().is_err()
    }

    /// Provision a line as an input.
    ///
    /// The pull is translated into the kernel bias request flags; a
    /// backend or kernel without bias support refuses it with
    /// [`Error::Unsupported`].  An edge trigger other than
    /// [`EdgeTrigger::None`] requests an event descriptor whose edges can
    /// be consumed via a listener or [`Line::wait_edge`](line::Line::wait_edge).
    ///
    /// Fails with [`Error::AlreadyReserved`] while a previous provisioning
    /// of the offset is still held.
    pub fn provision_input(&self, offset: Offset, pull: Pull, trigger: EdgeTrigger) -> Result<line::Line> {
        self.line_info(offset)?;
        let cfd = self.descriptor()?;
        let slot = self.claim(offset)?;
        match self.inner.backend.request_input(cfd, offset, pull, trigger) {
            Ok(lfd) => {
                slot.set(lfd);
                Ok(line::Line::new(
                    self.clone(),
                    offset,
                    Direction::Input,
                    trigger,
                    slot,
                ))
            }
            Err(e) => {
                self.unclaim(offset);
                Err(e)
            }
        }
    }

    /// Provision a line as an output, driven to `initial` before this
    /// returns.
    ///
    /// Fails with [`Error::AlreadyReserved`] while a previous provisioning
    /// of the offset is still held.
    pub fn provision_output(&self, offset: Offset, initial: bool) -> Result<line::Line> {
        self.line_info(offset)?;
        let cfd = self.descriptor()?;
        let slot = self.claim(offset)?;
        match self.inner.backend.request_output(cfd, offset, initial) {
            Ok(lfd) => {
                slot.set(lfd);
                Ok(line::Line::new(
                    self.clone(),
                    offset,
                    Direction::Output,
                    EdgeTrigger::None,
                    slot,
                ))
            }
            Err(e) => {
                self.unclaim(offset);
                Err(e)
            }
        }
    }

    /// Close the chip.
    ///
    /// Stops the event dispatcher, force-releases any still-provisioned
    /// line descriptors, then closes the chip's own descriptor.  Callers
    /// should release their lines first - the [`DeviceRegistry`] ensures
    /// that ordering when devices are closed through it.
    ///
    /// Not idempotent: a second close fails with [`Error::Closed`].
    /// Cleanup is best-effort; the first failure is surfaced after the
    /// remaining resources have been released.
    ///
    /// [`DeviceRegistry`]: crate::registry::DeviceRegistry
    pub fn close(&self) -> Result<()> {
        self.inner.close_impl()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    fn descriptor(&self) -> Result<Descriptor> {
        self.inner
            .fd
            .lock()
            .expect("failed to acquire lock on chip descriptor")
            .ok_or(Error::Closed)
    }

    // Reserve the offset, failing if it is already held.
    fn claim(&self, offset: Offset) -> Result<Arc<Slot>> {
        let mut reservations = self
            .inner
            .reservations
            .lock()
            .expect("failed to acquire lock on reservations");
        if reservations.contains_key(&offset) {
            return Err(Error::AlreadyReserved(offset));
        }
        let slot = Arc::new(Slot::default());
        reservations.insert(offset, slot.clone());
        Ok(slot)
    }

    fn unclaim(&self, offset: Offset) {
        self.inner
            .reservations
            .lock()
            .expect("failed to acquire lock on reservations")
            .remove(&offset);
    }

    /// Release a provisioned line: clear the reservation, then close the
    /// descriptor.  A second release of the same line is a no-op.
    pub(crate) fn release_line(&self, offset: Offset, slot: &Slot) -> Result<()> {
        let fd = {
            let mut reservations = self
                .inner
                .reservations
                .lock()
                .expect("failed to acquire lock on reservations");
            let fd = slot.take();
            reservations.remove(&offset);
            fd
        };
        match fd {
            Some(fd) => self.inner.backend.close(fd),
            None => Ok(()),
        }
    }

    /// Register a listener for edge events on the given line descriptor.
    ///
    /// The first registration on the chip starts the event dispatcher.
    /// Registering a descriptor again just replaces its listener.
    pub(crate) fn register_listener(&self, fd: Descriptor, listener: Listener) -> Result<()> {
        let mut guard = self
            .inner
            .dispatcher
            .lock()
            .expect("failed to acquire lock on dispatcher");
        if guard.is_none() {
            *guard = Some(Dispatcher::start(self.inner.backend.clone())?);
        }
        guard
            .as_ref()
            .expect("dispatcher is running")
            .register(fd, listener)
    }

    /// Deregister the listener for the given line descriptor.
    ///
    /// Safe to call for descriptors that are not registered.  The last
    /// deregistration stops the dispatcher.
    pub(crate) fn deregister_listener(&self, fd: Descriptor) -> Result<()> {
        let mut guard = self
            .inner
            .dispatcher
            .lock()
            .expect("failed to acquire lock on dispatcher");
        let empty = match guard.as_mut() {
            Some(d) => d.deregister(fd)?,
            None => return Ok(()),
        };
        if empty {
            if let Some(mut d) = guard.take() {
                d.stop()?;
            }
        }
        Ok(())
    }
}

impl ChipInner {
    fn close_impl(&self) -> Result<()> {
        let cfd = self
            .fd
            .lock()
            .expect("failed to acquire lock on chip descriptor")
            .take()
            .ok_or(Error::Closed)?;
        log::debug!("closing chip {}", self.info.name);
        let mut first_err = None;

        if let Some(mut d) = self
            .dispatcher
            .lock()
            .expect("failed to acquire lock on dispatcher")
            .take()
        {
            if let Err(e) = d.stop() {
                first_err.get_or_insert(e);
            }
        }

        let reservations: Vec<(Offset, Arc<Slot>)> = self
            .reservations
            .lock()
            .expect("failed to acquire lock on reservations")
            .drain()
            .collect();
        for (offset, slot) in reservations {
            if let Some(fd) = slot.take() {
                log::debug!("force releasing line {}", offset);
                if let Err(e) = self.backend.close(fd) {
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.backend.close(cfd) {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ChipInner {
    fn drop(&mut self) {
        let open = self
            .fd
            .lock()
            .expect("failed to acquire lock on chip descriptor")
            .is_some();
        if open {
            if let Err(e) = self.close_impl() {
                log::warn!("failed to close chip {}: {}", self.info.name, e);
            }
        }
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.info.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    mod info {
        use super::*;

        #[test]
        fn from_uapi() {
            let ui = v1::ChipInfo {
                name: devio_uapi::Name::from_str("banana").unwrap(),
                label: devio_uapi::Name::from_str("peel").unwrap(),
                num_lines: 42,
            };
            let i = Info::from(ui);
            assert_eq!(i.num_lines, 42);
            assert_eq!(i.name.as_str(), "banana");
            assert_eq!(i.label.as_str(), "peel");
        }
    }

    #[test]
    fn path_compare() {
        use super::path_compare;
        use std::cmp::Ordering;

        assert_eq!(
            path_compare(Path::new("/dev/gpiochip0"), Path::new("/dev/gpiochip0")),
            Ordering::Equal
        );
        assert_eq!(
            path_compare(Path::new("/dev/gpiochip0"), Path::new("/dev/gpiochip1")),
            Ordering::Less
        );
        assert_eq!(
            path_compare(Path::new("/dev/gpiochip3"), Path::new("/dev/gpiochip10")),
            Ordering::Less
        );
        assert_eq!(
            path_compare(Path::new("/dev/gpiochip10"), Path::new("/dev/gpiochip3")),
            Ordering::Greater
        );
        assert_eq!(
            path_compare(Path::new("/dev/gpiochip"), Path::new("/dev/gpiochip1")),
            Ordering::Less
        );
    }
}
