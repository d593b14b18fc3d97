// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The registry key for a GPIO pin, by global GPIO number.
pub fn gpio_key(gpio: u32) -> String {
    format!("gpio-{}", gpio)
}

/// The registry key for an I2C device, by bus number and address.
pub fn i2c_key(bus: u32, address: u16) -> String {
    format!("i2c-{}:{:#04x}", bus, address)
}

/// The registry key for an SPI device, by controller and chip select.
pub fn spi_key(controller: u32, chip_select: u32) -> String {
    format!("spi-{}:{}", controller, chip_select)
}

/// A device that can be held in the [`DeviceRegistry`].
///
/// Implemented by the digital device wrappers in [`gpio`](crate::gpio),
/// and by bus-oriented device wrappers that share the registry's
/// exclusive-ownership contract.
pub trait Device: Send {
    /// The registry key identifying the physical resource the device owns.
    fn key(&self) -> &str;

    /// Check if the device has been closed.
    fn is_closed(&self) -> bool;

    /// Close the device, releasing the resources it owns.
    ///
    /// A second close is a no-op.
    fn close(&mut self) -> Result<()>;
}

// A key is considered open while a factory is running for it or while it
// maps to a live device.
enum KeySlot {
    Opening,
    Open(Arc<Mutex<dyn Device>>),
}

impl std::fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySlot::Opening => f.write_str("Opening"),
            KeySlot::Open(_) => f.write_str("Open(..)"),
        }
    }
}

/// Maps physical resource keys to at most one open device each.
///
/// The registry enforces the exclusive-ownership invariant for physical
/// resources: opening a key that is already open fails with
/// [`Error::AlreadyOpen`] and never replaces the existing owner.  Exactly
/// one of two concurrent opens on the same key succeeds.
///
/// A cheap cloneable handle; clones refer to the same registry.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    slots: Arc<Mutex<HashMap<String, KeySlot>>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        Default::default()
    }

    /// Open a device for a key.
    ///
    /// The factory is invoked to construct the device only once the key is
    /// claimed, and the claim is dropped again if the factory fails, so no
    /// partially constructed device is ever reachable.
    ///
    /// Do not call with the lock on a device returned by this registry
    /// held.
    ///
    /// # Examples
    /// ```no_run
    /// # use devio::{Chip, Pull, EdgeTrigger, DeviceRegistry};
    /// # use devio::gpio::DigitalInput;
    /// # use devio::registry::gpio_key;
    /// # fn example() -> devio::Result<()> {
    /// let chip = Chip::from_path("/dev/gpiochip0")?;
    /// let registry = DeviceRegistry::new();
    /// let button = registry.open(&gpio_key(17), || {
    ///     DigitalInput::new(&chip, 17, Pull::None, EdgeTrigger::Both)
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open<D, F>(&self, key: &str, factory: F) -> Result<Arc<Mutex<D>>>
    where
        D: Device + 'static,
        F: FnOnce() -> Result<D>,
    {
        {
            let mut slots = self
                .slots
                .lock()
                .expect("failed to acquire lock on registry");
            match slots.get(key) {
                Some(KeySlot::Opening) => return Err(Error::AlreadyOpen(key.into())),
                Some(KeySlot::Open(d)) => {
                    let closed = d
                        .lock()
                        .expect("failed to acquire lock on device")
                        .is_closed();
                    if !closed {
                        return Err(Error::AlreadyOpen(key.into()));
                    }
                    // the owner was closed directly rather than through the
                    // registry; the key is free again
                }
                None => {}
            }
            slots.insert(key.into(), KeySlot::Opening);
        }
        // construct outside the lock; the Opening claim keeps the key held
        match factory() {
            Ok(device) => {
                let device = Arc::new(Mutex::new(device));
                self.slots
                    .lock()
                    .expect("failed to acquire lock on registry")
                    .insert(key.into(), KeySlot::Open(device.clone()));
                Ok(device)
            }
            Err(e) => {
                self.slots
                    .lock()
                    .expect("failed to acquire lock on registry")
                    .remove(key);
                Err(e)
            }
        }
    }

    /// Check if a key currently maps to an open device.
    pub fn is_open(&self, key: &str) -> bool {
        let slots = self
            .slots
            .lock()
            .expect("failed to acquire lock on registry");
        match slots.get(key) {
            Some(KeySlot::Opening) => true,
            Some(KeySlot::Open(d)) => !d
                .lock()
                .expect("failed to acquire lock on device")
                .is_closed(),
            None => false,
        }
    }

    /// Close the device registered for a key and remove it from the
    /// registry.
    ///
    /// Fails with [`Error::Closed`] if the key does not map to an open
    /// device.
    pub fn close(&self, key: &str) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .expect("failed to acquire lock on registry");
        match slots.get(key) {
            Some(KeySlot::Open(_)) => {}
            // an Opening claim belongs to the in-flight open, leave it
            Some(KeySlot::Opening) | None => return Err(Error::Closed),
        }
        match slots.remove(key) {
            Some(KeySlot::Open(d)) => d
                .lock()
                .expect("failed to acquire lock on device")
                .close(),
            _ => Err(Error::Closed),
        }
    }

    /// Close every registered device.
    ///
    /// Best-effort: every device is closed even if an earlier close fails,
    /// and the first error is surfaced once cleanup completes.
    pub fn close_all(&self) -> Result<()> {
        let devices: Vec<Arc<Mutex<dyn Device>>> = {
            let mut slots = self
                .slots
                .lock()
                .expect("failed to acquire lock on registry");
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    KeySlot::Open(d) => Some(d),
                    KeySlot::Opening => None,
                })
                .collect()
        };
        let mut first_err = None;
        for device in devices {
            let mut device = device.lock().expect("failed to acquire lock on device");
            if let Err(e) = device.close() {
                log::warn!("failed to close device \"{}\": {}", device.key(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
