// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Digital device wrappers over provisioned lines.
//!
//! Each wrapper owns exactly one [`Line`] for its lifetime and drives the
//! chip's provisioner and event dispatcher on behalf of callers.  The
//! wrappers are composed from the orthogonal capability traits
//! [`Readable`], [`Writable`] and [`Listenable`].
//!
//! Closed is a sink state: once a device is closed every operation fails
//! with [`Error::Closed`], and a second close is a no-op.

use crate::chip::Chip;
use crate::line::{Direction, EdgeEvent, EdgeKind, EdgeTrigger, Line, Offset, Pull};
use crate::registry::{gpio_key, Device};
use crate::{Descriptor, Error, Result};
use std::sync::mpsc;
use std::time::Duration;

/// A device whose current level can be read.
pub trait Readable {
    /// Read the logical level of the device.
    fn read(&self) -> Result<bool>;
}

/// A device whose level can be driven.
pub trait Writable {
    /// Drive the device to the given logical level.
    fn write(&mut self, value: bool) -> Result<()>;
}

/// A callback receiving the input events of a [`Listenable`] device.
pub type InputCallback = Box<dyn FnMut(InputEvent) + Send>;

/// A device that can deliver edge events to a callback.
pub trait Listenable {
    /// Register a callback for the device's edge events.
    ///
    /// Callbacks run on the dispatcher's drainer thread and must be fast
    /// and non-blocking; they must not operate on devices of the same
    /// chip.  Enabling again replaces the callback.
    fn enable_listener(&mut self, callback: InputCallback) -> Result<()>;

    /// Stop delivering events.
    ///
    /// A no-op if no listener is enabled.
    fn disable_listener(&mut self) -> Result<()>;
}

/// A timestamped digital input transition, as handed to listeners.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputEvent {
    /// The global GPIO number of the input that changed.
    pub gpio: u32,

    /// The wall clock time the event was received, in milliseconds since
    /// the Unix epoch.
    pub epoch_ms: i64,

    /// The monotonic event timestamp, in nanoseconds.
    pub timestamp_ns: u64,

    /// The level the input transitioned to.
    pub value: bool,
}

fn input_event(gpio: u32, event: &EdgeEvent) -> InputEvent {
    InputEvent {
        gpio,
        epoch_ms: event.epoch_ms,
        timestamp_ns: event.timestamp_ns,
        value: event.kind == EdgeKind::Rising,
    }
}

/// A cancellable stream of input events.
///
/// Returned by [`DigitalInput::events`] and
/// [`DigitalInputOutput::events`]; iterating blocks until the next event.
/// Dropping the stream cancels the subscription.  The stream ends when the
/// device is closed.
#[derive(Debug)]
pub struct InputEvents {
    chip: Chip,
    descriptor: Descriptor,
    rx: mpsc::Receiver<InputEvent>,
}

impl Iterator for InputEvents {
    type Item = InputEvent;

    fn next(&mut self) -> Option<InputEvent> {
        self.rx.recv().ok()
    }
}

impl Drop for InputEvents {
    fn drop(&mut self) {
        if let Err(e) = self.chip.deregister_listener(self.descriptor) {
            log::warn!("failed to cancel event stream: {}", e);
        }
    }
}

/// A digital input device over one provisioned input line.
#[derive(Debug)]
pub struct DigitalInput {
    key: String,
    chip: Chip,
    line: Line,
    gpio: u32,
    listening: bool,
    closed: bool,
}

impl DigitalInput {
    /// Provision the line at `offset` as an input and wrap it.
    ///
    /// Construction fails cleanly: on any provisioning error no device is
    /// returned and nothing remains reserved.
    pub fn new(chip: &Chip, offset: Offset, pull: Pull, trigger: EdgeTrigger) -> Result<DigitalInput> {
        let line = chip.provision_input(offset, pull, trigger)?;
        let gpio = chip.gpio_base() + offset;
        Ok(DigitalInput {
            key: gpio_key(gpio),
            chip: chip.clone(),
            line,
            gpio,
            listening: false,
            closed: false,
        })
    }

    /// The global GPIO number of the input.
    pub fn gpio(&self) -> u32 {
        self.gpio
    }

    /// Read the level of the input.
    ///
    /// A synchronous kernel call on the calling thread.
    pub fn read(&self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.line.value()
    }

    /// Register a callback for the input's edge events.
    pub fn enable_listener(&mut self, mut callback: InputCallback) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let fd = self.line.descriptor().ok_or(Error::Closed)?;
        let gpio = self.gpio;
        self.chip
            .register_listener(fd, Box::new(move |event| callback(input_event(gpio, &event))))?;
        self.listening = true;
        Ok(())
    }

    /// Stop delivering events.
    pub fn disable_listener(&mut self) -> Result<()> {
        if !self.listening {
            return Ok(());
        }
        self.listening = false;
        match self.line.descriptor() {
            Some(fd) => self.chip.deregister_listener(fd),
            None => Ok(()),
        }
    }

    /// Subscribe to the input's edge events as a cancellable stream.
    ///
    /// Replaces any listener registered via
    /// [`enable_listener`](DigitalInput::enable_listener).
    /// Dropping the returned stream cancels the subscription.
    pub fn events(&mut self) -> Result<InputEvents> {
        if self.closed {
            return Err(Error::Closed);
        }
        let fd = self.line.descriptor().ok_or(Error::Closed)?;
        let (tx, rx) = mpsc::channel();
        let gpio = self.gpio;
        self.chip.register_listener(
            fd,
            Box::new(move |event| {
                // the receiver may be gone; the stream was cancelled
                _ = tx.send(input_event(gpio, &event));
            }),
        )?;
        self.listening = true;
        Ok(InputEvents {
            chip: self.chip.clone(),
            descriptor: fd,
            rx,
        })
    }

    /// Block until the input reports an edge, or fail with
    /// [`Error::Timeout`].
    ///
    /// Only sensible while no listener is enabled - an enabled listener
    /// consumes the events first.
    pub fn wait_edge(&self, timeout: Duration) -> Result<InputEvent> {
        if self.closed {
            return Err(Error::Closed);
        }
        let event = self.line.wait_edge(timeout)?;
        Ok(input_event(self.gpio, &event))
    }

    /// Close the device: disable any active listener, then release the
    /// line.
    ///
    /// A second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        if let Err(e) = self.disable_listener() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.line.release() {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Readable for DigitalInput {
    fn read(&self) -> Result<bool> {
        DigitalInput::read(self)
    }
}

impl Listenable for DigitalInput {
    fn enable_listener(&mut self, callback: InputCallback) -> Result<()> {
        DigitalInput::enable_listener(self, callback)
    }

    fn disable_listener(&mut self) -> Result<()> {
        DigitalInput::disable_listener(self)
    }
}

impl Device for DigitalInput {
    fn key(&self) -> &str {
        &self.key
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        DigitalInput::close(self)
    }
}

/// A digital output device over one provisioned output line.
#[derive(Debug)]
pub struct DigitalOutput {
    key: String,
    line: Line,
    gpio: u32,
    closed: bool,
}

impl DigitalOutput {
    /// Provision the line at `offset` as an output and wrap it.
    ///
    /// The initial value is applied by the provisioning request itself,
    /// before this returns.
    pub fn new(chip: &Chip, offset: Offset, initial: bool) -> Result<DigitalOutput> {
        let line = chip.provision_output(offset, initial)?;
        let gpio = chip.gpio_base() + offset;
        Ok(DigitalOutput {
            key: gpio_key(gpio),
            line,
            gpio,
            closed: false,
        })
    }

    /// The global GPIO number of the output.
    pub fn gpio(&self) -> u32 {
        self.gpio
    }

    /// Read back the level of the output.
    ///
    /// Reading back output values is dependent on driver and hardware
    /// support, though it frequently works.
    pub fn read(&self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.line.value()
    }

    /// Drive the output to the given level.
    ///
    /// A synchronous kernel call on the calling thread.
    pub fn write(&mut self, value: bool) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.line.set_value(value)
    }

    /// Invert the level of the output.
    pub fn toggle(&mut self) -> Result<()> {
        let value = self.read()?;
        self.write(!value)
    }

    /// Close the device, releasing the line.
    ///
    /// A second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.line.release()
    }
}

impl Readable for DigitalOutput {
    fn read(&self) -> Result<bool> {
        DigitalOutput::read(self)
    }
}

impl Writable for DigitalOutput {
    fn write(&mut self, value: bool) -> Result<()> {
        DigitalOutput::write(self, value)
    }
}

impl Device for DigitalOutput {
    fn key(&self) -> &str {
        &self.key
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        DigitalOutput::close(self)
    }
}

/// A mode-switchable digital device over one line.
///
/// The character device exposes no in-place direction flip at this level,
/// so switching mode is a full teardown and rebuild: the current
/// descriptor is closed and a fresh line of the opposite direction is
/// provisioned, yielding a new descriptor.
#[derive(Debug)]
pub struct DigitalInputOutput {
    key: String,
    chip: Chip,
    line: Line,
    offset: Offset,
    gpio: u32,
    listening: bool,
    closed: bool,
}

impl DigitalInputOutput {
    /// Provision the line at `offset` in the given initial mode.
    ///
    /// Inputs are provisioned with both-edge trigger and no pull; outputs
    /// start low.
    pub fn new(chip: &Chip, offset: Offset, mode: Direction) -> Result<DigitalInputOutput> {
        let line = Self::provision(chip, offset, mode)?;
        let gpio = chip.gpio_base() + offset;
        Ok(DigitalInputOutput {
            key: gpio_key(gpio),
            chip: chip.clone(),
            line,
            offset,
            gpio,
            listening: false,
            closed: false,
        })
    }

    fn provision(chip: &Chip, offset: Offset, mode: Direction) -> Result<Line> {
        match mode {
            Direction::Input => chip.provision_input(offset, Pull::None, EdgeTrigger::Both),
            Direction::Output => chip.provision_output(offset, false),
        }
    }

    /// The global GPIO number of the device.
    pub fn gpio(&self) -> u32 {
        self.gpio
    }

    /// The current mode of the device.
    pub fn mode(&self) -> Direction {
        self.line.direction()
    }

    /// The kernel descriptor of the current line.
    ///
    /// Changes on every mode switch, as the line is fully reprovisioned.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.line.descriptor()
    }

    /// Switch the device to the given mode.
    ///
    /// A no-op if the device is already in that mode.  Any active listener
    /// is disabled first.  The old descriptor is closed and the line fully
    /// reprovisioned in the new direction.
    pub fn set_mode(&mut self, mode: Direction) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.line.direction() == mode {
            return Ok(());
        }
        self.disable_listener()?;
        self.line.release()?;
        self.line = Self::provision(&self.chip, self.offset, mode)?;
        Ok(())
    }

    /// Read the level of the line.
    pub fn read(&self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.line.value()
    }

    /// Drive the line to the given level.
    ///
    /// Fails while the device is in input mode.
    pub fn write(&mut self, value: bool) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.line.set_value(value)
    }

    /// Register a callback for edge events while in input mode.
    pub fn enable_listener(&mut self, mut callback: InputCallback) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.line.direction() != Direction::Input {
            return Err(Error::Unsupported("edge detection on outputs"));
        }
        let fd = self.line.descriptor().ok_or(Error::Closed)?;
        let gpio = self.gpio;
        self.chip
            .register_listener(fd, Box::new(move |event| callback(input_event(gpio, &event))))?;
        self.listening = true;
        Ok(())
    }

    /// Stop delivering events.
    pub fn disable_listener(&mut self) -> Result<()> {
        if !self.listening {
            return Ok(());
        }
        self.listening = false;
        match self.line.descriptor() {
            Some(fd) => self.chip.deregister_listener(fd),
            None => Ok(()),
        }
    }

    /// Subscribe to edge events as a cancellable stream while in input
    /// mode.
    pub fn events(&mut self) -> Result<InputEvents> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.line.direction() != Direction::Input {
            return Err(Error::Unsupported("edge detection on outputs"));
        }
        let fd = self.line.descriptor().ok_or(Error::Closed)?;
        let (tx, rx) = mpsc::channel();
        let gpio = self.gpio;
        self.chip.register_listener(
            fd,
            Box::new(move |event| {
                _ = tx.send(input_event(gpio, &event));
            }),
        )?;
        self.listening = true;
        Ok(InputEvents {
            chip: self.chip.clone(),
            descriptor: fd,
            rx,
        })
    }

    /// Close the device: disable any active listener, then release the
    /// line.
    ///
    /// A second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        if let Err(e) = self.disable_listener() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.line.release() {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Readable for DigitalInputOutput {
    fn read(&self) -> Result<bool> {
        DigitalInputOutput::read(self)
    }
}

impl Writable for DigitalInputOutput {
    fn write(&mut self, value: bool) -> Result<()> {
        DigitalInputOutput::write(self, value)
    }
}

impl Listenable for DigitalInputOutput {
    fn enable_listener(&mut self, callback: InputCallback) -> Result<()> {
        DigitalInputOutput::enable_listener(self, callback)
    }

    fn disable_listener(&mut self) -> Result<()> {
        DigitalInputOutput::disable_listener(self)
    }
}

impl Device for DigitalInputOutput {
    fn key(&self) -> &str {
        &self.key
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<()> {
        DigitalInputOutput::close(self)
    }
}
