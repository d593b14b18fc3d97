// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-chip edge event pipeline.
//!
//! Two cooperating background threads connected by a bounded channel: the
//! poller blocks on the backend's readiness-notification context, decodes
//! raw events and sends them down the channel; the drainer receives them
//! in strict FIFO order and dispatches each to the listener registered for
//! its descriptor.  Delivery order equals kernel report order, both across
//! and within descriptors.
//!
//! Cancellation is cooperative: a wake token interrupts the poller's
//! blocking wait, and the poller dropping the channel sender ends the
//! drainer.  Listener callbacks run on the drainer thread, so they must be
//! fast and non-blocking, and must not re-enter listener registration.

use crate::backend::{Backend, EventWait, Interest, Readiness};
use crate::line::EdgeEvent;
use crate::{Descriptor, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

/// A listener for edge events on one line descriptor.
pub(crate) type Listener = Box<dyn FnMut(EdgeEvent) + Send>;

/// The depth of the poller to drainer hand-off channel.
///
/// Bounded so a stalled listener applies backpressure to the poller
/// instead of growing the queue without limit.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// The edge event dispatcher for one chip.
///
/// Started on first listener registration, stopped on the last
/// deregistration or when the chip closes.
pub(crate) struct Dispatcher {
    interest: Arc<dyn Interest>,
    listeners: Arc<Mutex<HashMap<Descriptor, Listener>>>,
    stop: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    drainer: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Create the readiness-notification context and start the poller and
    /// drainer threads.
    pub(crate) fn start(backend: Arc<dyn Backend>) -> Result<Dispatcher> {
        let (wait, interest) = backend.notifier()?;
        let listeners: Arc<Mutex<HashMap<Descriptor, Listener>>> = Default::default();
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);

        let poller = {
            let stop = stop.clone();
            thread::spawn(move || poll_events(wait, backend, stop, tx))
        };
        let drainer = {
            let listeners = listeners.clone();
            thread::spawn(move || drain_events(rx, listeners))
        };
        log::debug!("event dispatcher started");
        Ok(Dispatcher {
            interest,
            listeners,
            stop,
            poller: Some(poller),
            drainer: Some(drainer),
        })
    }

    /// Register a listener for a descriptor.
    ///
    /// The listener is in place before interest is added, so no event can
    /// arrive without a listener to receive it.  Registering a descriptor
    /// that already has a listener just replaces the listener.
    pub(crate) fn register(&self, fd: Descriptor, listener: Listener) -> Result<()> {
        let mut listeners = self
            .listeners
            .lock()
            .expect("failed to acquire lock on listeners");
        let replaced = listeners.insert(fd, listener).is_some();
        if !replaced {
            if let Err(e) = self.interest.add(fd) {
                listeners.remove(&fd);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove interest in a descriptor and drop its listener.
    ///
    /// Safe even if an event for the descriptor is already in flight - the
    /// drainer drops events with no listener.  Returns true when no
    /// listeners remain.
    pub(crate) fn deregister(&self, fd: Descriptor) -> Result<bool> {
        let mut listeners = self
            .listeners
            .lock()
            .expect("failed to acquire lock on listeners");
        if listeners.remove(&fd).is_some() {
            self.interest.remove(fd)?;
        }
        Ok(listeners.is_empty())
    }

    /// Stop both threads and close the readiness-notification context.
    pub(crate) fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.interest.wake() {
            // without the wake the poller cannot be unblocked, so leave
            // the threads rather than hang joining them
            log::warn!("failed to wake event poller: {}", e);
            return Err(e);
        }
        if let Some(h) = self.poller.take() {
            _ = h.join();
        }
        // the poller dropped the channel sender, ending the drainer
        if let Some(h) = self.drainer.take() {
            _ = h.join();
        }
        self.listeners
            .lock()
            .expect("failed to acquire lock on listeners")
            .clear();
        log::debug!("event dispatcher stopped");
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.poller.is_some() {
            _ = self.stop();
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.poller.is_some())
            .finish()
    }
}

// The poller task: block on the readiness context, decode each raw event
// and push it onto the channel.  Exits when woken after a stop, or when
// the drainer is gone.
fn poll_events(
    mut wait: Box<dyn EventWait>,
    backend: Arc<dyn Backend>,
    stop: Arc<AtomicBool>,
    tx: SyncSender<EdgeEvent>,
) {
    loop {
        match wait.wait() {
            Ok(Readiness::Woken) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Ok(Readiness::Ready(fds)) => {
                for fd in fds {
                    match backend.read_edge(fd) {
                        Ok((timestamp_ns, kind)) => {
                            let event = EdgeEvent {
                                descriptor: fd,
                                kind,
                                timestamp_ns,
                                epoch_ms: chrono::Utc::now().timestamp_millis(),
                            };
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        // e.g. the descriptor was released while its event
                        // was pending
                        Err(e) => log::warn!("failed to read event from descriptor {}: {}", fd, e),
                    }
                }
            }
            Err(e) => {
                log::warn!("event wait failed: {}", e);
                break;
            }
        }
    }
    // tx drops here, ending the drainer once the queue drains
}

// The drainer task: receive events in FIFO order and dispatch each to the
// listener registered for its descriptor.
fn drain_events(rx: Receiver<EdgeEvent>, listeners: Arc<Mutex<HashMap<Descriptor, Listener>>>) {
    while let Ok(event) = rx.recv() {
        let mut listeners = listeners
            .lock()
            .expect("failed to acquire lock on listeners");
        match listeners.get_mut(&event.descriptor) {
            Some(listener) => listener(event),
            None => log::warn!(
                "no listener for descriptor {}, dropping {:?} event",
                event.descriptor,
                event.kind
            ),
        }
    }
    log::debug!("event drainer finished");
}
