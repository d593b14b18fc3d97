// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::chip::Chip;
use crate::{Descriptor, Error, Result};
use devio_uapi::v1;
#[cfg(feature = "serde")]
use serde_derive::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An identifier for a line on a particular chip.
///
/// Valid offsets are in the range 0..`num_lines` as reported in the chip
/// [`Info`](crate::chip::Info).
pub type Offset = u32;

/// The direction of a line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    /// The line is an input.
    Input,

    /// The line is an output.
    Output,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Input
    }
}

impl From<v1::LineInfoFlags> for Direction {
    fn from(flags: v1::LineInfoFlags) -> Self {
        if flags.contains(v1::LineInfoFlags::OUTPUT) {
            return Direction::Output;
        }
        Direction::Input
    }
}

/// The pull resistor configuration requested for an input line.
///
/// Pull configuration is a capability of the backend and kernel, not a
/// guarantee - a backend that cannot apply the requested bias refuses the
/// request with [`Error::Unsupported`] rather than silently ignoring it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Pull {
    /// No bias is requested and the line floats unless externally driven.
    None,

    /// The line is pulled up to the supply rail.
    Up,

    /// The line is pulled down to ground.
    Down,
}

impl Default for Pull {
    fn default() -> Self {
        Self::None
    }
}

/// The edge notification policy for an input line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EdgeTrigger {
    /// No edge notification; the line can only be read synchronously.
    None,

    /// Report transitions from inactive to active.
    Rising,

    /// Report transitions from active to inactive.
    Falling,

    /// Report transitions in both directions.
    Both,
}

impl Default for EdgeTrigger {
    fn default() -> Self {
        Self::None
    }
}

/// The cause of an [`EdgeEvent`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EdgeKind {
    /// Indicates the line transitioned from inactive to active.
    Rising = 1,

    /// Indicates the line transitioned from active to inactive.
    Falling = 2,
}

impl From<v1::LineEdgeEventKind> for EdgeKind {
    fn from(kind: v1::LineEdgeEventKind) -> Self {
        match kind {
            v1::LineEdgeEventKind::RisingEdge => EdgeKind::Rising,
            v1::LineEdgeEventKind::FallingEdge => EdgeKind::Falling,
        }
    }
}

/// The publicly available information for a line.
///
/// Fixed at the time the chip is opened; the live provisioning state is
/// carried by [`Line`], not here.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct Info {
    /// The line offset on the GPIO chip.
    pub offset: Offset,

    /// The name of this GPIO line, such as the output pin of the line on
    /// the chip, a rail or a pin header name on a board, as specified by the
    /// GPIO chip.
    ///
    /// May be empty.
    pub name: String,

    /// A functional name for the consumer of this GPIO line as set
    /// by whatever is using it.
    ///
    /// May be empty if not set by the user or the line is unused.
    pub consumer: String,

    /// When true the line is reserved by the kernel and not available for
    /// request.
    pub used: bool,

    /// When true the line active state corresponds to a physical low.
    pub active_low: bool,

    /// When true the line is an open drain output.
    pub open_drain: bool,

    /// When true the line is an open source output.
    pub open_source: bool,

    /// The direction of the line.
    pub direction: Direction,
}

impl From<&v1::LineInfo> for Info {
    fn from(li: &v1::LineInfo) -> Self {
        Info {
            offset: li.offset,
            name: String::from(&li.name),
            consumer: String::from(&li.consumer),
            used: li.flags.contains(v1::LineInfoFlags::USED),
            active_low: li.flags.contains(v1::LineInfoFlags::ACTIVE_LOW),
            open_drain: li.flags.contains(v1::LineInfoFlags::OPEN_DRAIN),
            open_source: li.flags.contains(v1::LineInfoFlags::OPEN_SOURCE),
            direction: Direction::from(li.flags),
        }
    }
}

/// The details of an edge detected on an input line.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EdgeEvent {
    /// The descriptor of the line request that produced the event.
    pub descriptor: Descriptor,

    /// The event trigger identifier.
    pub kind: EdgeKind,

    /// The best estimate of time of event occurrence, in nanoseconds,
    /// from the monotonic clock.
    pub timestamp_ns: u64,

    /// The wall clock time the event was received, in milliseconds since
    /// the Unix epoch.
    ///
    /// Derived when the event is read from the kernel, so it trails
    /// `timestamp_ns` by the queuing latency.
    pub epoch_ms: i64,
}

/// The shared slot holding a provisioned line's descriptor.
///
/// Reachable from both the [`Line`] handle and the chip's reservation
/// table, so either side can release the descriptor exactly once.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    fd: Mutex<Option<Descriptor>>,
}

impl Slot {
    pub(crate) fn get(&self) -> Option<Descriptor> {
        *self.fd.lock().expect("failed to acquire lock on slot")
    }

    pub(crate) fn set(&self, fd: Descriptor) {
        *self.fd.lock().expect("failed to acquire lock on slot") = Some(fd);
    }

    pub(crate) fn take(&self) -> Option<Descriptor> {
        self.fd
            .lock()
            .expect("failed to acquire lock on slot")
            .take()
    }
}

/// A provisioned line on a chip.
///
/// Holds the kernel descriptor for the line for as long as it is
/// provisioned.  The descriptor is released, and the chip's reservation
/// cleared, by [`release`](Line::release) or by dropping the Line.
#[derive(Debug)]
pub struct Line {
    chip: Chip,
    offset: Offset,
    direction: Direction,
    trigger: EdgeTrigger,
    slot: Arc<Slot>,
}

impl Line {
    pub(crate) fn new(
        chip: Chip,
        offset: Offset,
        direction: Direction,
        trigger: EdgeTrigger,
        slot: Arc<Slot>,
    ) -> Line {
        Line {
            chip,
            offset,
            direction,
            trigger,
            slot,
        }
    }

    /// The offset of the line on its chip.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// The direction the line was provisioned with.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The edge notification policy the line was provisioned with.
    ///
    /// Only relevant for inputs.
    pub fn trigger(&self) -> EdgeTrigger {
        self.trigger
    }

    /// The kernel descriptor for the line.
    ///
    /// Present if and only if the line is provisioned and not yet released.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.slot.get()
    }

    /// Check if the line still holds its descriptor.
    pub fn is_provisioned(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Read the logical value of the line.
    ///
    /// A synchronous kernel call on the calling thread.
    pub fn value(&self) -> Result<bool> {
        let fd = self.slot.get().ok_or(Error::Closed)?;
        self.chip.backend().get_value(fd)
    }

    /// Set the logical value of the line.
    ///
    /// A synchronous kernel call on the calling thread.
    /// Fails for lines provisioned as inputs.
    pub fn set_value(&self, value: bool) -> Result<()> {
        let fd = self.slot.get().ok_or(Error::Closed)?;
        self.chip.backend().set_value(fd, value)
    }

    /// Block until the line reports an edge event, or the timeout expires
    /// with [`Error::Timeout`].
    ///
    /// Only available on lines provisioned with an edge trigger, and only
    /// sensible while no listener is registered for the line - a registered
    /// listener consumes the events first.
    pub fn wait_edge(&self, timeout: Duration) -> Result<EdgeEvent> {
        if self.trigger == EdgeTrigger::None {
            return Err(Error::Unsupported("edge detection"));
        }
        let fd = self.slot.get().ok_or(Error::Closed)?;
        let backend = self.chip.backend();
        if !backend.wait_edge(fd, timeout)? {
            return Err(Error::Timeout(timeout));
        }
        let (timestamp_ns, kind) = backend.read_edge(fd)?;
        Ok(EdgeEvent {
            descriptor: fd,
            kind,
            timestamp_ns,
            epoch_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Release the line, clearing its reservation and closing its
    /// descriptor.
    ///
    /// A second release is a no-op.  Any listener registered for the line's
    /// descriptor must be deregistered first.
    pub fn release(&self) -> Result<()> {
        self.chip.release_line(self.offset, &self.slot)
    }
}

impl Drop for Line {
    fn drop(&mut self) {
        if self.is_provisioned() {
            if let Err(e) = self.release() {
                log::warn!("failed to release line {}: {}", self.offset, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod direction {
        use super::*;

        #[test]
        fn default() {
            assert_eq!(Direction::default(), Direction::Input);
        }

        #[test]
        fn from_line_info_flags() {
            assert_eq!(
                Direction::from(v1::LineInfoFlags::OUTPUT),
                Direction::Output
            );
            assert_eq!(
                Direction::from(v1::LineInfoFlags::ACTIVE_LOW),
                Direction::Input
            );
        }
    }

    mod edge_kind {
        use super::*;

        #[test]
        fn from_uapi() {
            assert_eq!(
                EdgeKind::from(v1::LineEdgeEventKind::RisingEdge),
                EdgeKind::Rising
            );
            assert_eq!(
                EdgeKind::from(v1::LineEdgeEventKind::FallingEdge),
                EdgeKind::Falling
            );
        }
    }

    mod info {
        use super::*;
        use std::str::FromStr;

        #[test]
        fn from_line_info() {
            let li: v1::LineInfo = Default::default();
            let info = Info::from(&li);
            assert_eq!(info.offset, 0);
            assert!(info.name.is_empty());
            assert!(info.consumer.is_empty());
            assert!(!info.used);
            assert!(!info.active_low);
            assert!(!info.open_drain);
            assert!(!info.open_source);
            assert_eq!(info.direction, Direction::Input);

            let li = v1::LineInfo {
                offset: 32,
                flags: v1::LineInfoFlags::USED
                    | v1::LineInfoFlags::ACTIVE_LOW
                    | v1::LineInfoFlags::OUTPUT
                    | v1::LineInfoFlags::OPEN_DRAIN,
                name: devio_uapi::Name::from_str("banana").unwrap(),
                consumer: devio_uapi::Name::from_str("jam").unwrap(),
            };
            let info = Info::from(&li);
            assert_eq!(info.offset, 32);
            assert_eq!(info.name, "banana");
            assert_eq!(info.consumer, "jam");
            assert!(info.used);
            assert!(info.active_low);
            assert!(info.open_drain);
            assert!(!info.open_source);
            assert_eq!(info.direction, Direction::Output);
        }
    }

    mod slot {
        use super::*;

        #[test]
        fn take_is_once() {
            let slot = Slot::default();
            assert_eq!(slot.get(), None);
            slot.set(42);
            assert_eq!(slot.get(), Some(42));
            assert_eq!(slot.take(), Some(42));
            assert_eq!(slot.take(), None);
            assert_eq!(slot.get(), None);
        }
    }
}
