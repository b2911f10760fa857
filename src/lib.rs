//! USB hub class driver core: per-port state machines, default-address
//! arbitration and change-notification dispatch, decoupled from the transfer
//! layer and the device framework behind trait seams.

use core::fmt;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

pub mod arbiter;
pub mod hub;
pub mod port;
pub mod root_hub;
pub(crate) mod status;

pub use arbiter::{DefaultAddressArbiter, DefaultAddressLease};
pub use hub::{HubConfig, HubDescriptor, HubDevice};
pub use port::PortState;
pub use root_hub::{PortRegisterRegion, RootHub, PORTSC_REGISTER_SIZE};

/// Bus speed of a USB device or hub.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
}

bitflags! {
    /// Status half of a GetPortStatus result (wPortStatus).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
    }
}

bitflags! {
    /// Change half of a GetPortStatus result (wPortChange).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortChange: u16 {
        const C_CONNECTION = 1 << 0;
        const C_ENABLE = 1 << 1;
        const C_SUSPEND = 1 << 2;
        const C_OVER_CURRENT = 1 << 3;
        const C_RESET = 1 << 4;
    }
}

bitflags! {
    /// Hub-level status word (wHubStatus).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct HubStatus: u16 {
        const LOCAL_POWER = 1 << 0;
        const OVER_CURRENT = 1 << 1;
    }
}

bitflags! {
    /// Hub-level change word (wHubChange).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct HubChange: u16 {
        const C_LOCAL_POWER = 1 << 0;
        const C_OVER_CURRENT = 1 << 1;
    }
}

impl PortStatus {
    /// Speed of the device behind a port, derived from the status speed bits.
    ///
    /// The low-speed bit wins over the high-speed bit (the latter is reserved
    /// while the former is set); ports of a SuperSpeed hub only carry
    /// SuperSpeed devices.
    pub fn device_speed(self, hub_speed: UsbSpeed) -> UsbSpeed {
        if hub_speed == UsbSpeed::Super {
            UsbSpeed::Super
        } else if self.contains(PortStatus::LOW_SPEED) {
            UsbSpeed::Low
        } else if self.contains(PortStatus::HIGH_SPEED) {
            UsbSpeed::High
        } else {
            UsbSpeed::Full
        }
    }
}

/// Port feature selectors for SetPortFeature/ClearPortFeature (USB 2.0 table
/// 11-17).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum PortFeature {
    Enable = 1,
    Suspend = 2,
    Reset = 4,
    Power = 8,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
}

/// Hub feature selectors for ClearHubFeature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

/// Opaque handle for a child device registered with the external device
/// framework. The framework owns the device object; this core only keeps the
/// handle so it can request removal on disconnect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceHandle(pub u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum HubError {
    /// Malformed hub descriptor; fatal to that hub's creation.
    #[error("malformed hub descriptor: {0}")]
    InvalidDescriptor(&'static str),
    /// One control-channel or register operation failed.
    #[error("control transfer failed: {0}")]
    Transfer(&'static str),
    /// Default-address acquisition timed out.
    #[error("default address slot busy")]
    Busy,
    /// Unexpected wire data; logged, non-fatal.
    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(&'static str),
    /// Root-hub register mapping failure; fatal to root-hub init.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}

/// Hub control channel supplied by the external transfer layer.
///
/// One channel is shared by every port of a hub; implementations must accept
/// calls from concurrent port contexts and are responsible for correlating
/// requests with responses. Every operation may fail with
/// [`HubError::Transfer`], which this core treats as a transient fault of
/// that one operation.
pub trait HubControl: Send + Sync {
    /// GetPortStatus: reads the status/change register pair of `port`
    /// (1-based).
    fn port_status(&self, port: u8) -> Result<(PortStatus, PortChange), HubError>;

    /// SetPortFeature on `port`.
    fn set_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), HubError>;

    /// ClearPortFeature on `port`.
    fn clear_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), HubError>;

    /// GetHubStatus: hub-level status/change pair.
    fn hub_status(&self) -> Result<(HubStatus, HubChange), HubError>;

    /// ClearHubFeature: acknowledges a hub-level change.
    fn clear_hub_feature(&self, feature: HubFeature) -> Result<(), HubError>;

    /// Waits between polls of an in-progress hardware operation. The default
    /// blocks the calling thread; transports with their own scheduler should
    /// override this to yield instead.
    fn delay(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Child-device registration seam towards the external device framework.
pub trait EnumerationSink: Send + Sync {
    /// Assigns a bus address to the freshly reset device on `port` and
    /// registers it as a child device. Called only while the caller holds the
    /// default-address lease for that port.
    fn address_device(&self, port: u8, speed: UsbSpeed) -> Result<DeviceHandle, HubError>;

    /// Removes a previously registered child device.
    fn remove_device(&self, handle: DeviceHandle) -> Result<(), HubError>;
}

/// Length in bytes of the interrupt change bitmap for a hub with
/// `port_count` ports: one bit for the hub itself plus one per port.
pub fn change_bitmap_len(port_count: u8) -> usize {
    (port_count as usize + 1 + 7) / 8
}
