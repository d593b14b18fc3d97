// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An in-memory [`Backend`] simulating chips and lines.
//!
//! The simulator keeps an arena of virtual chips, lines and descriptors
//! and implements the full backend contract, including the
//! readiness-notification context, so the provisioning, value and event
//! pipelines can be exercised deterministically without hardware.
//!
//! ```
//! # use std::sync::Arc;
//! use devio::sim::Sim;
//! use devio::{Chip, EdgeTrigger, Pull};
//!
//! # fn main() -> devio::Result<()> {
//! let sim = Sim::simpleton(8);
//! let chip = Chip::from_path_on(Arc::new(sim.clone()), "/dev/gpiochip0")?;
//! let line = chip.provision_input(3, Pull::None, EdgeTrigger::None)?;
//! sim.set_level(0, 3, true);
//! assert!(line.value()?);
//! # Ok(())
//! # }
//! ```

use crate::backend::{Backend, EventWait, Interest, Readiness};
use crate::chip;
use crate::line::{self, Direction, EdgeKind, EdgeTrigger, Offset, Pull};
use crate::{Descriptor, Error, KernelCall, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

fn os_err(call: KernelCall, errno: i32) -> Error {
    Error::Ioctl(call, devio_uapi::Error::Os(devio_uapi::Errno(errno)))
}

/// Start building a simulator.
pub fn builder() -> Builder {
    Builder {
        chips: Vec::new(),
        bias_supported: true,
    }
}

/// A builder of simulators.
#[derive(Debug)]
pub struct Builder {
    chips: Vec<(String, u32)>,
    bias_supported: bool,
}

impl Builder {
    /// Add a chip with the given label and number of lines.
    ///
    /// Chips appear as `/dev/gpiochipN` in the order they are added.
    pub fn with_chip(mut self, label: &str, num_lines: u32) -> Builder {
        self.chips.push((label.into(), num_lines));
        self
    }

    /// Refuse pull bias requests, as kernels prior to v5.5 do.
    pub fn without_bias(mut self) -> Builder {
        self.bias_supported = false;
        self
    }

    /// Construct the simulator.
    pub fn build(self) -> Sim {
        Sim {
            inner: Arc::new(SimInner {
                chips: self
                    .chips
                    .into_iter()
                    .map(|(label, num_lines)| SimChip {
                        label,
                        lines: Mutex::new(vec![SimLine::default(); num_lines as usize]),
                    })
                    .collect(),
                bias_supported: self.bias_supported,
                fds: Mutex::new(HashMap::new()),
                next_fd: AtomicI32::new(1000),
                clock_ns: AtomicU64::new(0),
                hub: Arc::new(EventHub::default()),
            }),
        }
    }
}

/// A simulator of one or more chips.
///
/// Cheap to clone; clones share the simulated hardware, so a clone kept by
/// the test can drive levels and inject edges while another is used as the
/// [`Backend`].
#[derive(Clone, Debug)]
pub struct Sim {
    inner: Arc<SimInner>,
}

#[derive(Debug)]
struct SimInner {
    chips: Vec<SimChip>,
    bias_supported: bool,
    fds: Mutex<HashMap<Descriptor, FdState>>,
    next_fd: AtomicI32,
    clock_ns: AtomicU64,
    hub: Arc<EventHub>,
}

#[derive(Debug)]
struct SimChip {
    label: String,
    lines: Mutex<Vec<SimLine>>,
}

#[derive(Clone, Debug)]
struct SimLine {
    level: bool,
    requested: bool,
    direction: Direction,
}

impl Default for SimLine {
    fn default() -> Self {
        SimLine {
            level: false,
            requested: false,
            direction: Direction::Input,
        }
    }
}

#[derive(Clone, Debug)]
enum FdState {
    Chip(usize),
    Line {
        chip: usize,
        offset: Offset,
        direction: Direction,
        trigger: EdgeTrigger,
    },
}

// Readiness state shared between the simulated lines, the waiter and the
// interest handles.  The ready queue is a FIFO of descriptor tokens in
// event arrival order, which is what gives the simulator the same
// cross-descriptor ordering as the native epoll context.
#[derive(Debug, Default)]
struct EventHub {
    state: Mutex<HubState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct HubState {
    queues: HashMap<Descriptor, VecDeque<(u64, EdgeKind)>>,
    ready: VecDeque<Descriptor>,
    watched: HashSet<Descriptor>,
    wake: bool,
}

fn trigger_matches(trigger: EdgeTrigger, kind: EdgeKind) -> bool {
    match trigger {
        EdgeTrigger::None => false,
        EdgeTrigger::Rising => kind == EdgeKind::Rising,
        EdgeTrigger::Falling => kind == EdgeKind::Falling,
        EdgeTrigger::Both => true,
    }
}

impl Sim {
    /// A simulator of a single chip with the given number of lines.
    pub fn simpleton(num_lines: u32) -> Sim {
        builder().with_chip("simpleton", num_lines).build()
    }

    /// Drive the external level of a line, generating an edge event if an
    /// event request is watching the transition.
    ///
    /// A no-op if the level does not change.  The event timestamp comes
    /// from the simulator's fake monotonic clock.
    pub fn set_level(&self, chip: usize, offset: Offset, level: bool) {
        {
            let Some(c) = self.inner.chips.get(chip) else {
                return;
            };
            let mut lines = c.lines.lock().expect("failed to acquire lock on lines");
            match lines.get_mut(offset as usize) {
                Some(l) if l.level != level => {}
                _ => return,
            }
        }
        let kind = if level {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        };
        let ns = self.inner.clock_ns.fetch_add(1_000_000, Ordering::SeqCst) + 1_000_000;
        self.push_edge(chip, offset, kind, ns);
    }

    /// Inject an edge with an explicit timestamp.
    ///
    /// The line level follows the edge: rising drives it high, falling
    /// low.  The event is queued only if the line is provisioned with a
    /// trigger matching the edge, as on real hardware.
    pub fn inject_edge(&self, chip: usize, offset: Offset, kind: EdgeKind, timestamp_ns: u64) {
        self.push_edge(chip, offset, kind, timestamp_ns);
    }

    /// The current level of a line.
    pub fn level(&self, chip: usize, offset: Offset) -> Option<bool> {
        self.inner
            .chips
            .get(chip)?
            .lines
            .lock()
            .expect("failed to acquire lock on lines")
            .get(offset as usize)
            .map(|l| l.level)
    }

    fn push_edge(&self, chip: usize, offset: Offset, kind: EdgeKind, ns: u64) {
        {
            let Some(c) = self.inner.chips.get(chip) else {
                return;
            };
            let mut lines = c.lines.lock().expect("failed to acquire lock on lines");
            match lines.get_mut(offset as usize) {
                Some(l) => l.level = kind == EdgeKind::Rising,
                None => return,
            }
        }
        let target = {
            let fds = self.inner.fds.lock().expect("failed to acquire lock on fds");
            fds.iter().find_map(|(fd, st)| match st {
                FdState::Line {
                    chip: c,
                    offset: o,
                    trigger,
                    ..
                } if *c == chip && *o == offset && trigger_matches(*trigger, kind) => Some(*fd),
                _ => None,
            })
        };
        if let Some(fd) = target {
            let mut st = self
                .inner
                .hub
                .state
                .lock()
                .expect("failed to acquire lock on event hub");
            st.queues.entry(fd).or_default().push_back((ns, kind));
            if st.watched.contains(&fd) {
                st.ready.push_back(fd);
            }
            self.inner.hub.cond.notify_all();
        }
    }

    fn alloc_fd(&self, state: FdState) -> Descriptor {
        let fd = self.inner.next_fd.fetch_add(1, Ordering::SeqCst);
        self.inner
            .fds
            .lock()
            .expect("failed to acquire lock on fds")
            .insert(fd, state);
        fd
    }

    fn fd_state(&self, fd: Descriptor) -> Option<FdState> {
        self.inner
            .fds
            .lock()
            .expect("failed to acquire lock on fds")
            .get(&fd)
            .cloned()
    }

    fn chip_of(&self, cfd: Descriptor, call: KernelCall) -> Result<usize> {
        match self.fd_state(cfd) {
            Some(FdState::Chip(idx)) => Ok(idx),
            _ => Err(os_err(call, libc::EBADF)),
        }
    }
}

impl Backend for Sim {
    fn chip_paths(&self) -> Result<Vec<PathBuf>> {
        Ok((0..self.inner.chips.len())
            .map(|i| PathBuf::from(format!("/dev/gpiochip{}", i)))
            .collect())
    }

    fn open_chip(&self, path: &Path) -> Result<(Descriptor, chip::Info)> {
        let idx = path
            .to_str()
            .and_then(|p| p.strip_prefix("/dev/gpiochip"))
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|idx| *idx < self.inner.chips.len())
            .ok_or_else(|| Error::Open(path.to_path_buf(), chip::OpenErrorKind::NotFound))?;
        let c = &self.inner.chips[idx];
        let num_lines = c.lines.lock().expect("failed to acquire lock on lines").len() as u32;
        let fd = self.alloc_fd(FdState::Chip(idx));
        Ok((
            fd,
            chip::Info {
                name: format!("gpiochip{}", idx),
                label: c.label.clone(),
                num_lines,
            },
        ))
    }

    fn line_info(&self, cfd: Descriptor, offset: Offset) -> Result<line::Info> {
        let idx = self.chip_of(cfd, KernelCall::GetLineInfo)?;
        let c = &self.inner.chips[idx];
        let lines = c.lines.lock().expect("failed to acquire lock on lines");
        let l = lines
            .get(offset as usize)
            .ok_or(os_err(KernelCall::GetLineInfo, libc::EINVAL))?;
        Ok(line::Info {
            offset,
            name: format!("{}-{}", c.label, offset),
            consumer: if l.requested {
                "devio".into()
            } else {
                String::new()
            },
            used: l.requested,
            active_low: false,
            open_drain: false,
            open_source: false,
            direction: l.direction,
        })
    }

    fn request_input(
        &self,
        cfd: Descriptor,
        offset: Offset,
        pull: Pull,
        trigger: EdgeTrigger,
    ) -> Result<Descriptor> {
        let call = if trigger == EdgeTrigger::None {
            KernelCall::GetLineHandle
        } else {
            KernelCall::GetLineEvent
        };
        let idx = self.chip_of(cfd, call)?;
        if pull != Pull::None && !self.inner.bias_supported {
            return Err(Error::Unsupported("line bias"));
        }
        {
            let mut lines = self.inner.chips[idx]
                .lines
                .lock()
                .expect("failed to acquire lock on lines");
            let l = lines
                .get_mut(offset as usize)
                .ok_or(os_err(call, libc::EINVAL))?;
            if l.requested {
                return Err(os_err(call, libc::EBUSY));
            }
            l.requested = true;
            l.direction = Direction::Input;
            // an externally applied pull drives the line level
            match pull {
                Pull::Up => l.level = true,
                Pull::Down => l.level = false,
                Pull::None => {}
            }
        }
        Ok(self.alloc_fd(FdState::Line {
            chip: idx,
            offset,
            direction: Direction::Input,
            trigger,
        }))
    }

    fn request_output(&self, cfd: Descriptor, offset: Offset, initial: bool) -> Result<Descriptor> {
        let idx = self.chip_of(cfd, KernelCall::GetLineHandle)?;
        {
            let mut lines = self.inner.chips[idx]
                .lines
                .lock()
                .expect("failed to acquire lock on lines");
            let l = lines
                .get_mut(offset as usize)
                .ok_or(os_err(KernelCall::GetLineHandle, libc::EINVAL))?;
            if l.requested {
                return Err(os_err(KernelCall::GetLineHandle, libc::EBUSY));
            }
            l.requested = true;
            l.direction = Direction::Output;
            l.level = initial;
        }
        Ok(self.alloc_fd(FdState::Line {
            chip: idx,
            offset,
            direction: Direction::Output,
            trigger: EdgeTrigger::None,
        }))
    }

    fn get_value(&self, lfd: Descriptor) -> Result<bool> {
        match self.fd_state(lfd) {
            Some(FdState::Line { chip, offset, .. }) => Ok(self.inner.chips[chip]
                .lines
                .lock()
                .expect("failed to acquire lock on lines")[offset as usize]
                .level),
            _ => Err(os_err(KernelCall::GetLineValues, libc::EBADF)),
        }
    }

    fn set_value(&self, lfd: Descriptor, value: bool) -> Result<()> {
        match self.fd_state(lfd) {
            Some(FdState::Line {
                chip,
                offset,
                direction: Direction::Output,
                ..
            }) => {
                self.inner.chips[chip]
                    .lines
                    .lock()
                    .expect("failed to acquire lock on lines")[offset as usize]
                    .level = value;
                Ok(())
            }
            Some(FdState::Line { .. }) => Err(os_err(KernelCall::SetLineValues, libc::EPERM)),
            _ => Err(os_err(KernelCall::SetLineValues, libc::EBADF)),
        }
    }

    fn wait_edge(&self, lfd: Descriptor, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut st = self
            .inner
            .hub
            .state
            .lock()
            .expect("failed to acquire lock on event hub");
        loop {
            if st.queues.get(&lfd).map(|q| !q.is_empty()).unwrap_or(false) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            st = self
                .inner
                .hub
                .cond
                .wait_timeout(st, deadline - now)
                .expect("failed to acquire lock on event hub")
                .0;
        }
    }

    fn read_edge(&self, lfd: Descriptor) -> Result<(u64, EdgeKind)> {
        self.inner
            .hub
            .state
            .lock()
            .expect("failed to acquire lock on event hub")
            .queues
            .get_mut(&lfd)
            .and_then(|q| q.pop_front())
            .ok_or(os_err(KernelCall::ReadEvent, libc::EAGAIN))
    }

    fn close(&self, fd: Descriptor) -> Result<()> {
        let state = self
            .inner
            .fds
            .lock()
            .expect("failed to acquire lock on fds")
            .remove(&fd)
            .ok_or(os_err(KernelCall::Close, libc::EBADF))?;
        if let FdState::Line { chip, offset, .. } = state {
            self.inner.chips[chip]
                .lines
                .lock()
                .expect("failed to acquire lock on lines")[offset as usize]
                .requested = false;
            let mut st = self
                .inner
                .hub
                .state
                .lock()
                .expect("failed to acquire lock on event hub");
            st.queues.remove(&fd);
            st.watched.remove(&fd);
            st.ready.retain(|f| *f != fd);
        }
        Ok(())
    }

    fn notifier(&self) -> Result<(Box<dyn EventWait>, Arc<dyn Interest>)> {
        Ok((
            Box::new(SimWait {
                hub: self.inner.hub.clone(),
            }),
            Arc::new(SimInterest {
                hub: self.inner.hub.clone(),
            }),
        ))
    }
}

#[derive(Debug)]
struct SimWait {
    hub: Arc<EventHub>,
}

impl EventWait for SimWait {
    fn wait(&mut self) -> Result<Readiness> {
        let mut st = self
            .hub
            .state
            .lock()
            .expect("failed to acquire lock on event hub");
        loop {
            // ready descriptors are delivered before a wake is honored, as
            // with the native epoll context
            let mut fds = Vec::new();
            while let Some(fd) = st.ready.pop_front() {
                if st.watched.contains(&fd) {
                    fds.push(fd);
                }
            }
            if !fds.is_empty() {
                return Ok(Readiness::Ready(fds));
            }
            if st.wake {
                st.wake = false;
                return Ok(Readiness::Woken);
            }
            st = self
                .hub
                .cond
                .wait(st)
                .expect("failed to acquire lock on event hub");
        }
    }
}

#[derive(Debug)]
struct SimInterest {
    hub: Arc<EventHub>,
}

impl Interest for SimInterest {
    fn add(&self, fd: Descriptor) -> Result<()> {
        let mut st = self
            .hub
            .state
            .lock()
            .expect("failed to acquire lock on event hub");
        st.watched.insert(fd);
        // events buffered before interest was added are reported now
        let pending = st.queues.get(&fd).map(|q| q.len()).unwrap_or(0);
        for _ in 0..pending {
            st.ready.push_back(fd);
        }
        self.hub.cond.notify_all();
        Ok(())
    }

    fn remove(&self, fd: Descriptor) -> Result<()> {
        self.hub
            .state
            .lock()
            .expect("failed to acquire lock on event hub")
            .watched
            .remove(&fd);
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        self.hub
            .state
            .lock()
            .expect("failed to acquire lock on event hub")
            .wake = true;
        self.hub.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(sim: &Sim) -> Descriptor {
        sim.open_chip(Path::new("/dev/gpiochip0")).unwrap().0
    }

    #[test]
    fn open_chip_unknown() {
        let sim = Sim::simpleton(4);
        assert!(matches!(
            sim.open_chip(Path::new("/dev/gpiochip1")),
            Err(Error::Open(_, chip::OpenErrorKind::NotFound))
        ));
        assert!(matches!(
            sim.open_chip(Path::new("/dev/mem")),
            Err(Error::Open(_, chip::OpenErrorKind::NotFound))
        ));
    }

    #[test]
    fn request_is_exclusive() {
        let sim = Sim::simpleton(4);
        let cfd = open(&sim);
        let lfd = sim
            .request_input(cfd, 2, Pull::None, EdgeTrigger::None)
            .unwrap();
        assert_eq!(
            sim.request_output(cfd, 2, false).unwrap_err(),
            os_err(KernelCall::GetLineHandle, libc::EBUSY)
        );
        sim.close(lfd).unwrap();
        assert!(sim.request_output(cfd, 2, false).is_ok());
    }

    #[test]
    fn descriptors_are_distinct() {
        let sim = Sim::simpleton(4);
        let cfd = open(&sim);
        let a = sim
            .request_input(cfd, 0, Pull::None, EdgeTrigger::None)
            .unwrap();
        sim.close(a).unwrap();
        let b = sim
            .request_input(cfd, 0, Pull::None, EdgeTrigger::None)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn output_levels() {
        let sim = Sim::simpleton(4);
        let cfd = open(&sim);
        let lfd = sim.request_output(cfd, 1, true).unwrap();
        assert!(sim.get_value(lfd).unwrap());
        assert_eq!(sim.level(0, 1), Some(true));
        sim.set_value(lfd, false).unwrap();
        assert!(!sim.get_value(lfd).unwrap());
    }

    #[test]
    fn write_to_input_is_refused() {
        let sim = Sim::simpleton(4);
        let cfd = open(&sim);
        let lfd = sim
            .request_input(cfd, 1, Pull::None, EdgeTrigger::None)
            .unwrap();
        assert_eq!(
            sim.set_value(lfd, true).unwrap_err(),
            os_err(KernelCall::SetLineValues, libc::EPERM)
        );
    }

    #[test]
    fn bias_refused_when_unsupported() {
        let sim = builder().with_chip("old", 4).without_bias().build();
        let cfd = open(&sim);
        assert_eq!(
            sim.request_input(cfd, 1, Pull::Up, EdgeTrigger::None)
                .unwrap_err(),
            Error::Unsupported("line bias")
        );
        // no pull still works
        assert!(sim
            .request_input(cfd, 1, Pull::None, EdgeTrigger::None)
            .is_ok());
    }

    #[test]
    fn edges_queue_on_event_descriptors() {
        let sim = Sim::simpleton(4);
        let cfd = open(&sim);
        let lfd = sim
            .request_input(cfd, 3, Pull::None, EdgeTrigger::Both)
            .unwrap();
        sim.inject_edge(0, 3, EdgeKind::Rising, 1000);
        sim.inject_edge(0, 3, EdgeKind::Falling, 2000);
        assert_eq!(sim.read_edge(lfd).unwrap(), (1000, EdgeKind::Rising));
        assert_eq!(sim.read_edge(lfd).unwrap(), (2000, EdgeKind::Falling));
        assert_eq!(
            sim.read_edge(lfd).unwrap_err(),
            os_err(KernelCall::ReadEvent, libc::EAGAIN)
        );
    }

    #[test]
    fn rising_only_trigger_filters_falling() {
        let sim = Sim::simpleton(4);
        let cfd = open(&sim);
        let lfd = sim
            .request_input(cfd, 3, Pull::None, EdgeTrigger::Rising)
            .unwrap();
        sim.inject_edge(0, 3, EdgeKind::Rising, 1000);
        sim.inject_edge(0, 3, EdgeKind::Falling, 2000);
        assert_eq!(sim.read_edge(lfd).unwrap(), (1000, EdgeKind::Rising));
        assert!(sim.read_edge(lfd).is_err());
        // the level still follows the filtered edge
        assert_eq!(sim.level(0, 3), Some(false));
    }

    #[test]
    fn wait_edge_times_out() {
        let sim = Sim::simpleton(4);
        let cfd = open(&sim);
        let lfd = sim
            .request_input(cfd, 3, Pull::None, EdgeTrigger::Both)
            .unwrap();
        assert!(!sim.wait_edge(lfd, Duration::from_millis(10)).unwrap());
        sim.inject_edge(0, 3, EdgeKind::Rising, 1000);
        assert!(sim.wait_edge(lfd, Duration::from_millis(10)).unwrap());
    }
}
