//! Shared test doubles for the external device framework.
// Compiled into every integration-test binary; not all of them use every
// helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use usbhub::{DefaultAddressArbiter, DeviceHandle, EnumerationSink, HubError, UsbSpeed};

/// Recording stand-in for the device framework. When given the hub's
/// arbiter it asserts the default-address invariant on every address
/// assignment.
#[derive(Default)]
pub struct FakeSink {
    pub added: Mutex<Vec<(u8, UsbSpeed)>>,
    pub removed: Mutex<Vec<DeviceHandle>>,
    next: AtomicU64,
    arbiter: Mutex<Option<Arc<DefaultAddressArbiter>>>,
    fail_next_address: AtomicBool,
}

impl FakeSink {
    pub fn watch_arbiter(&self, arbiter: Arc<DefaultAddressArbiter>) {
        *self.arbiter.lock().unwrap() = Some(arbiter);
    }

    pub fn fail_next_address(&self) {
        self.fail_next_address.store(true, Ordering::SeqCst);
    }

    pub fn added(&self) -> Vec<(u8, UsbSpeed)> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<DeviceHandle> {
        self.removed.lock().unwrap().clone()
    }
}

impl EnumerationSink for FakeSink {
    fn address_device(&self, port: u8, speed: UsbSpeed) -> Result<DeviceHandle, HubError> {
        if let Some(arbiter) = self.arbiter.lock().unwrap().as_ref() {
            assert_eq!(
                arbiter.held_by(),
                Some(port),
                "address assignment without holding the default-address lease"
            );
        }
        if self.fail_next_address.swap(false, Ordering::SeqCst) {
            return Err(HubError::Transfer("injected address failure"));
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.added.lock().unwrap().push((port, speed));
        Ok(DeviceHandle(id))
    }

    fn remove_device(&self, handle: DeviceHandle) -> Result<(), HubError> {
        self.removed.lock().unwrap().push(handle);
        Ok(())
    }
}
