// SPDX-License-Identifier: Apache-2.0 OR MIT

use bitflags::bitflags;
use ioctl_sys::{ior, iorw};
use libc::{c_long, pollfd, ppoll, sigset_t, time_t, timespec, POLLIN};
use std::fs::File;
use std::mem;
use std::os::unix::prelude::{FromRawFd, RawFd};
use std::ptr::null;
use std::time::Duration;

use super::{Error, Name, Offset, Result, UnderReadError, ValidationError, ValidationResult};
use super::LINES_MAX;

const IOCTL_MAGIC: u8 = 0xb4;

#[repr(u8)]
enum Ioctl {
    GetChipInfo = 1,
    GetLineInfo = 2,
    GetLineHandle = 3,
    GetLineEvent = 4,
    GetLineValues = 8,
    SetLineValues = 9,
}

/// Information about a particular GPIO chip.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChipInfo {
    /// The Linux kernel name of this GPIO chip.
    pub name: Name,

    /// A functional name for this GPIO chip, such as a product number.
    ///
    /// May be empty.
    pub label: Name,

    /// The number of GPIO lines on this chip.
    pub num_lines: u32,
}

/// Get the publicly available information for a chip.
///
/// * `cfd` - The fd of the open chip.
pub fn get_chip_info(cfd: RawFd) -> Result<ChipInfo> {
    let ci = ChipInfo::default();
    // SAFETY: returned struct contains only raw byte arrays and integers.
    match unsafe {
        libc::ioctl(
            cfd,
            ior!(IOCTL_MAGIC, Ioctl::GetChipInfo as u8, mem::size_of::<ChipInfo>())
                as libc::c_ulong,
            &ci,
        )
    } {
        0 => Ok(ci),
        _ => Err(Error::from_errno()),
    }
}

bitflags! {
    /// Flags indicating the configuration of a line, as reported by the kernel.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct LineInfoFlags: u32 {
        /// The line is in use by the kernel and is not available for request.
        const USED = 1;

        /// The line is an output.
        const OUTPUT = 2;

        /// The line active state corresponds to a physical low.
        const ACTIVE_LOW = 4;

        /// The line is an open drain output.
        const OPEN_DRAIN = 8;

        /// The line is an open source output.
        const OPEN_SOURCE = 16;
    }
}

/// Information about a certain GPIO line.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineInfo {
    /// The line offset on this GPIO device.
    ///
    /// This is the identifier used when requesting the line from the kernel.
    pub offset: Offset,

    /// The configuration flags for this line.
    pub flags: LineInfoFlags,

    /// The name of this GPIO line, such as the output pin of the line on the
    /// chip, a rail or a pin header name on a board, as specified by the GPIO
    /// chip.
    ///
    /// May be empty.
    pub name: Name,

    /// A functional name for the consumer of this GPIO line as set by
    /// whatever is using it.
    ///
    /// May be empty if the line is unused.
    pub consumer: Name,
}

/// Get the publicly available information for a line.
///
/// This does not include the line value.
/// The line must be requested to access the value.
///
/// * `cfd` - The fd of the open chip.
/// * `offset` - The offset of the line.
pub fn get_line_info(cfd: RawFd, offset: Offset) -> Result<LineInfo> {
    let li = LineInfo {
        offset,
        ..Default::default()
    };
    // SAFETY: returned struct contains raw byte arrays and bitfields that are safe to decode.
    match unsafe {
        libc::ioctl(
            cfd,
            iorw!(IOCTL_MAGIC, Ioctl::GetLineInfo as u8, mem::size_of::<LineInfo>())
                as libc::c_ulong,
            &li,
        )
    } {
        0 => Ok(li),
        _ => Err(Error::from_errno()),
    }
}

bitflags! {
    /// Configuration flags for requested lines.
    ///
    /// Several of the flags are mutually exclusive, e.g. BIAS_PULL_UP and
    /// BIAS_PULL_DOWN.  The kernel rejects requests with flag combinations
    /// that do not make sense.  Kernels prior to v5.5 reject any request
    /// carrying bias flags.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct HandleRequestFlags: u32 {
        /// Requests the line as an input.
        const INPUT = 1;

        /// Requests the line as an output.
        const OUTPUT = 2;

        /// Requests the line as active low.
        const ACTIVE_LOW = 4;

        /// Requests the line as open drain.
        const OPEN_DRAIN = 8;

        /// Requests the line as open source.
        const OPEN_SOURCE = 16;

        /// Requests the line with pull-up bias.
        const BIAS_PULL_UP = 32;

        /// Requests the line with pull-down bias.
        const BIAS_PULL_DOWN = 64;

        /// Requests the line with bias disabled.
        const BIAS_DISABLED = 128;
    }
}

/// An array of line offsets, as embedded in a [`HandleRequest`].
#[repr(C)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Offsets([Offset; LINES_MAX]);

impl Offsets {
    /// Get the indexed offset from the set.
    #[inline]
    pub fn get(&self, idx: usize) -> Offset {
        self.0[idx]
    }

    /// Set the indexed offset in the set.
    #[inline]
    pub fn set(&mut self, idx: usize, offset: Offset) {
        self.0[idx] = offset;
    }
}

impl Default for Offsets {
    fn default() -> Self {
        Offsets([0; LINES_MAX])
    }
}

/// The logical values of the requested lines.
///
/// Values are stored as u8, as the uAPI specifies.
/// 0 is *inactive*, with 1 and all other values taken as *active*.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LineValues([u8; LINES_MAX]);

impl LineValues {
    /// Return the value of a line.
    ///
    /// * `idx` - The index into the request offsets for the line of interest.
    #[inline]
    pub fn get(&self, idx: usize) -> u8 {
        self.0[idx]
    }

    /// Set the value of a line.
    ///
    /// * `idx` - The index into the request offsets for the line of interest.
    /// * `value` - The logical state of the line to be set.
    #[inline]
    pub fn set(&mut self, idx: usize, value: u8) {
        self.0[idx] = value;
    }
}

impl Default for LineValues {
    fn default() -> Self {
        LineValues([0; LINES_MAX])
    }
}

/// Information about a GPIO line handle request.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HandleRequest {
    /// The requested lines, identified by offset on the associated GPIO device.
    pub offsets: Offsets,

    /// The requested flags for the requested GPIO lines.
    pub flags: HandleRequestFlags,

    /// If [`HandleRequestFlags::OUTPUT`] is set, the initial output value for
    /// each requested offset.
    pub values: LineValues,

    /// A requested consumer label for the selected GPIO lines.
    pub consumer: Name,

    /// The number of valid fields in the `offsets` and `values` arrays.
    ///
    /// Set to 1 to request a single line.
    pub num_lines: u32,

    /// The descriptor the kernel returns for the requested lines.
    //
    // Specified as an int in gpio.h, which is not fixed width.  It is
    // usually i32, so that is what we go with here.
    #[doc(hidden)]
    pub fd: i32,
}

/// Request a line or set of lines for exclusive access.
///
/// * `cfd` - The fd of the open chip.
/// * `hr` - The line handle request.
pub fn get_line_handle(cfd: RawFd, hr: HandleRequest) -> Result<File> {
    // SAFETY: hr is consumed and the returned file is drawn from the returned fd.
    unsafe {
        match libc::ioctl(
            cfd,
            iorw!(
                IOCTL_MAGIC,
                Ioctl::GetLineHandle as u8,
                mem::size_of::<HandleRequest>()
            ) as libc::c_ulong,
            &hr,
        ) {
            0 => Ok(File::from_raw_fd(hr.fd)),
            _ => Err(Error::from_errno()),
        }
    }
}

bitflags! {
    /// Additional configuration flags for event requests.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct EventRequestFlags: u32 {
        /// Report rising edge events on the requested line.
        const RISING_EDGE = 1;

        /// Report falling edge events on the requested line.
        const FALLING_EDGE = 2;

        /// Report both rising and falling edge events on the requested line.
        const BOTH_EDGES = Self::RISING_EDGE.bits() | Self::FALLING_EDGE.bits();
    }
}

/// Information about a GPIO event request.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EventRequest {
    /// The line to request edge events from, identified by its offset
    /// on the associated GPIO device.
    pub offset: Offset,

    /// The requested handle flags for the GPIO line.
    pub handleflags: HandleRequestFlags,

    /// The requested event flags for the GPIO line.
    pub eventflags: EventRequestFlags,

    /// A requested consumer label for the selected GPIO line.
    pub consumer: Name,

    /// The descriptor the kernel returns for the requested line.
    //
    // As per HandleRequest.fd.
    #[doc(hidden)]
    pub fd: i32,
}

/// Request a line with edge detection enabled.
///
/// Detected events can be read from the returned file.
///
/// * `cfd` - The fd of the open chip.
/// * `er` - The line event request.
pub fn get_line_event(cfd: RawFd, er: EventRequest) -> Result<File> {
    // SAFETY: er is consumed and the returned file is drawn from the returned fd.
    unsafe {
        match libc::ioctl(
            cfd,
            iorw!(
                IOCTL_MAGIC,
                Ioctl::GetLineEvent as u8,
                mem::size_of::<EventRequest>()
            ) as libc::c_ulong,
            &er,
        ) {
            0 => Ok(File::from_raw_fd(er.fd)),
            _ => Err(Error::from_errno()),
        }
    }
}

/// Read the values of requested lines.
///
/// * `lfd` - The descriptor returned by [`get_line_handle`] or [`get_line_event`].
/// * `vals` - The line values to be populated.
pub fn get_line_values(lfd: RawFd, vals: &mut LineValues) -> Result<()> {
    // SAFETY: vals are raw integers that are safe to decode.
    match unsafe {
        libc::ioctl(
            lfd,
            iorw!(
                IOCTL_MAGIC,
                Ioctl::GetLineValues as u8,
                mem::size_of::<LineValues>()
            ) as libc::c_ulong,
            vals.0.as_mut_ptr(),
        )
    } {
        0 => Ok(()),
        _ => Err(Error::from_errno()),
    }
}

/// Set the values of requested lines.
///
/// * `lfd` - The descriptor returned by [`get_line_handle`].
/// * `vals` - The line values to be set.
pub fn set_line_values(lfd: RawFd, vals: &LineValues) -> Result<()> {
    // SAFETY: vals is not modified.
    match unsafe {
        libc::ioctl(
            lfd,
            iorw!(
                IOCTL_MAGIC,
                Ioctl::SetLineValues as u8,
                mem::size_of::<LineValues>()
            ) as libc::c_ulong,
            vals.0.as_ptr(),
        )
    } {
        0 => Ok(()),
        _ => Err(Error::from_errno()),
    }
}

/// The trigger identifier for a [`LineEdgeEvent`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineEdgeEventKind {
    /// Indicates the line transitioned from *inactive* to *active*.
    RisingEdge = 1,

    /// Indicates the line transitioned from *active* to *inactive*.
    FallingEdge = 2,
}

impl TryFrom<u32> for LineEdgeEventKind {
    type Error = String;

    fn try_from(v: u32) -> std::result::Result<Self, Self::Error> {
        use LineEdgeEventKind::*;
        match v {
            x if x == RisingEdge as u32 => Ok(RisingEdge),
            x if x == FallingEdge as u32 => Ok(FallingEdge),
            _ => Err(format!("invalid value: {}", v)),
        }
    }
}

impl LineEdgeEventKind {
    /// Confirm that the value read from the kernel is valid in Rust.
    fn validate(&self) -> std::result::Result<(), String> {
        LineEdgeEventKind::try_from(*self as u32).map(|_| ())
    }
}

/// Information about an edge event on a requested line.
#[repr(C)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineEdgeEvent {
    /// The best estimate of time of event occurrence, in nanoseconds.
    pub timestamp_ns: u64,

    /// The kind of line event.
    pub kind: LineEdgeEventKind,
}

impl LineEdgeEvent {
    /// Interpret a buffer as a LineEdgeEvent.
    ///
    /// The buffer is assumed to have been populated by a read of the line
    /// request descriptor, so the content is validated before being returned.
    pub fn from_slice(d: &[u64]) -> Result<&LineEdgeEvent> {
        debug_assert!(mem::size_of::<LineEdgeEvent>() % 8 == 0);
        let len = d.len() * 8;
        if len < mem::size_of::<LineEdgeEvent>() {
            return Err(Error::from(UnderReadError::new(
                "LineEdgeEvent",
                mem::size_of::<LineEdgeEvent>(),
                len,
            )));
        }
        // SAFETY: event is validated before being returned.
        let le = unsafe { &*(d as *const [u64] as *const LineEdgeEvent) };
        le.validate().map(|_| le).map_err(Error::from)
    }

    /// Check that a LineEdgeEvent read from the kernel is valid in Rust.
    fn validate(&self) -> ValidationResult {
        self.kind
            .validate()
            .map_err(|e| ValidationError::new("kind", e))
    }
}

/// Read a single edge event from a line event descriptor.
///
/// Blocks until an event is available unless the descriptor is non-blocking.
///
/// * `lfd` - The descriptor returned by [`get_line_event`].
pub fn read_edge_event(lfd: RawFd) -> Result<LineEdgeEvent> {
    let mut buf = [0_u64; mem::size_of::<LineEdgeEvent>() / 8];
    // SAFETY: the read is bounded by the buffer size and the content is
    // validated by from_slice.
    let n = unsafe {
        libc::read(
            lfd,
            buf.as_mut_ptr() as *mut libc::c_void,
            mem::size_of_val(&buf),
        )
    };
    if n < 0 {
        return Err(Error::from_errno());
    }
    let read = (n as usize) / 8;
    LineEdgeEvent::from_slice(&buf[..read]).cloned()
}

/// Check if the descriptor has an event available to read.
pub fn has_event(fd: RawFd) -> Result<bool> {
    wait_event(fd, Duration::ZERO)
}

/// Wait for the descriptor to have an event available to read.
///
/// Returns false if the timeout expires with no event available.
pub fn wait_event(fd: RawFd, d: Duration) -> Result<bool> {
    let mut pfd = pollfd {
        fd,
        events: POLLIN,
        revents: 0,
    };
    let timeout = timespec {
        tv_sec: d.as_secs() as time_t,
        tv_nsec: d.subsec_nanos() as c_long,
    };
    // SAFETY: ppoll writes only into pfd.revents.
    unsafe {
        match ppoll(
            std::ptr::addr_of_mut!(pfd),
            1,
            std::ptr::addr_of!(timeout),
            null() as *const sigset_t,
        ) {
            -1 => Err(Error::from_errno()),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod chip_info {
        use super::*;

        #[test]
        fn size() {
            assert_eq!(
                mem::size_of::<ChipInfo>(),
                68usize,
                concat!("Size of: ", stringify!(ChipInfo))
            );
        }
    }

    mod line_info {
        use super::*;

        #[test]
        fn size() {
            assert_eq!(
                mem::size_of::<LineInfo>(),
                72usize,
                concat!("Size of: ", stringify!(LineInfo))
            );
        }
    }

    mod handle_request {
        use super::*;

        #[test]
        fn size() {
            assert_eq!(
                mem::size_of::<HandleRequest>(),
                364usize,
                concat!("Size of: ", stringify!(HandleRequest))
            );
        }
    }

    mod event_request {
        use super::*;

        #[test]
        fn size() {
            assert_eq!(
                mem::size_of::<EventRequest>(),
                48usize,
                concat!("Size of: ", stringify!(EventRequest))
            );
        }
    }

    mod line_values {
        use super::*;

        #[test]
        fn size() {
            assert_eq!(
                mem::size_of::<LineValues>(),
                64usize,
                concat!("Size of: ", stringify!(LineValues))
            );
        }

        #[test]
        fn get_set() {
            let mut vals = LineValues::default();
            assert_eq!(vals.get(0), 0);
            vals.set(0, 1);
            assert_eq!(vals.get(0), 1);
            vals.set(0, 42);
            assert_eq!(vals.get(0), 42);
        }
    }

    mod line_edge_event {
        use super::*;

        #[test]
        fn size() {
            assert_eq!(
                mem::size_of::<LineEdgeEvent>(),
                16usize,
                concat!("Size of: ", stringify!(LineEdgeEvent))
            );
        }

        #[test]
        fn from_slice() {
            let mut buf = [0_u64; 2];
            buf[0] = 1234;
            buf[1] = LineEdgeEventKind::FallingEdge as u32 as u64;
            let le = LineEdgeEvent::from_slice(&buf).unwrap();
            assert_eq!(le.timestamp_ns, 1234);
            assert_eq!(le.kind, LineEdgeEventKind::FallingEdge);

            buf[1] = 42;
            let err = LineEdgeEvent::from_slice(&buf).unwrap_err();
            assert_eq!(
                err,
                Error::Validation(ValidationError::new("kind", "invalid value: 42"))
            );

            let err = LineEdgeEvent::from_slice(&buf[..1]).unwrap_err();
            assert_eq!(
                err,
                Error::UnderRead(UnderReadError::new("LineEdgeEvent", 16, 8))
            );
        }

        #[test]
        fn kind_try_from() {
            assert_eq!(
                LineEdgeEventKind::try_from(1),
                Ok(LineEdgeEventKind::RisingEdge)
            );
            assert_eq!(
                LineEdgeEventKind::try_from(2),
                Ok(LineEdgeEventKind::FallingEdge)
            );
            assert_eq!(
                LineEdgeEventKind::try_from(3),
                Err("invalid value: 3".to_string())
            );
        }
    }
}
