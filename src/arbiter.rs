//! Default-address arbiter: the bus has a single address-0 slot that every
//! freshly reset device answers on, so reset+address sequences of sibling
//! ports must be serialized through this object.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::HubError;

#[derive(Default)]
struct Slot {
    held_by: Option<u8>,
    pending: usize,
}

/// Mutual exclusion over the default-address slot of one hub tree.
///
/// Acquisition hands out a [`DefaultAddressLease`] guard; the slot is freed
/// when the guard drops, so every exit path of an enumeration (success,
/// transfer error, device removal, cancellation) releases exactly once.
#[derive(Default)]
pub struct DefaultAddressArbiter {
    slot: Mutex<Slot>,
    released: Condvar,
}

impl DefaultAddressArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the lock leaves no torn state behind; keep
        // going with the inner value instead of propagating the poison.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks the calling context until the slot is free, then claims it for
    /// `port`. Gives up with [`HubError::Busy`] once `timeout` elapses so a
    /// hung enumeration cannot deadlock the hub.
    pub fn acquire(
        self: &Arc<Self>,
        port: u8,
        timeout: Duration,
    ) -> Result<DefaultAddressLease, HubError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        slot.pending += 1;
        loop {
            if slot.held_by.is_none() {
                slot.held_by = Some(port);
                slot.pending -= 1;
                return Ok(DefaultAddressLease {
                    arbiter: Arc::clone(self),
                    port,
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                slot.pending -= 1;
                return Err(HubError::Busy);
            }
            let (guard, _timed_out) = self
                .released
                .wait_timeout(slot, remaining)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
            // Re-check the slot even on timeout; the deadline test above
            // decides whether to keep waiting.
        }
    }

    fn release(&self, port: u8) {
        let mut slot = self.slot();
        if slot.held_by == Some(port) {
            slot.held_by = None;
            self.released.notify_one();
        }
    }

    /// Port currently owning the slot, if any.
    pub fn held_by(&self) -> Option<u8> {
        self.slot().held_by
    }

    /// Number of ports currently blocked in [`DefaultAddressArbiter::acquire`].
    pub fn pending_requests(&self) -> usize {
        self.slot().pending
    }
}

/// Scoped ownership of the default-address slot. Dropping the lease releases
/// the slot and wakes one waiting acquirer.
pub struct DefaultAddressLease {
    arbiter: Arc<DefaultAddressArbiter>,
    port: u8,
}

impl DefaultAddressLease {
    pub fn port(&self) -> u8 {
        self.port
    }
}

impl Drop for DefaultAddressLease {
    fn drop(&mut self) {
        self.arbiter.release(self.port);
    }
}
