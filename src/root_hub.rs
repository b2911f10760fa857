//! Root hub adapter: ports wired to host-controller PORTSC registers rather
//! than behind a hub device. The register block is translated to the same
//! control contract the hub ports use, so the port state machine and the
//! default-address arbiter are shared unchanged.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::arbiter::DefaultAddressArbiter;
use crate::hub::{HubConfig, HubShared};
use crate::port::{Port, PortState};
use crate::{
    DeviceHandle, EnumerationSink, HubChange, HubControl, HubError, HubFeature, HubStatus,
    PortChange, PortFeature, PortStatus, UsbSpeed,
};

/// Bytes of register space per root port (one 16-bit PORTSC register).
pub const PORTSC_REGISTER_SIZE: usize = 2;

// UHCI PORTSC bit layout.
const PORTSC_CCS: u16 = 1 << 0;
const PORTSC_CSC: u16 = 1 << 1;
const PORTSC_PED: u16 = 1 << 2;
const PORTSC_PEDC: u16 = 1 << 3;
const PORTSC_LSDA: u16 = 1 << 8;
const PORTSC_PR: u16 = 1 << 9;
const PORTSC_SUSP: u16 = 1 << 12;
// Write-1-to-clear bits; writes must keep them zero to leave them latched.
const PORTSC_W1C: u16 = PORTSC_CSC | PORTSC_PEDC;

/// Externally supplied port register region at some base address; offsets
/// are relative to that base, `PORTSC_REGISTER_SIZE` apart per port.
pub trait PortRegisterRegion: Send {
    /// Maps the region for access. Called exactly once, before any
    /// read/write; fails with [`HubError::ResourceExhausted`].
    fn map(&mut self, expected_len: usize) -> Result<(), HubError>;

    fn read_portsc(&self, offset: usize) -> Result<u16, HubError>;

    fn write_portsc(&mut self, offset: usize, value: u16) -> Result<(), HubError>;

    /// Size of the region in bytes.
    fn len(&self) -> usize;
}

struct PortscState {
    region: Box<dyn PortRegisterRegion>,
    /// Ports with a software-completed reset whose reset-change has not been
    /// acknowledged yet. PORTSC has no reset-change bit; it is synthesized
    /// from the end of the reset pulse.
    reset_done: Vec<bool>,
}

/// [`HubControl`] over a PORTSC register block.
struct PortscChannel {
    state: Mutex<PortscState>,
    port_count: u8,
    reset_pulse: Duration,
}

impl PortscChannel {
    fn new(region: Box<dyn PortRegisterRegion>, port_count: u8, reset_pulse: Duration) -> Self {
        Self {
            state: Mutex::new(PortscState {
                region,
                reset_done: vec![false; port_count as usize],
            }),
            port_count,
            reset_pulse,
        }
    }

    fn state(&self) -> MutexGuard<'_, PortscState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn offset(&self, port: u8) -> Result<usize, HubError> {
        if port == 0 || port > self.port_count {
            return Err(HubError::ProtocolAnomaly("no such root port"));
        }
        Ok((port - 1) as usize * PORTSC_REGISTER_SIZE)
    }
}

impl HubControl for PortscChannel {
    fn port_status(&self, port: u8) -> Result<(PortStatus, PortChange), HubError> {
        let offset = self.offset(port)?;
        let state = self.state();
        let raw = state.region.read_portsc(offset)?;

        // Root ports are permanently powered.
        let mut status = PortStatus::POWER;
        status.set(PortStatus::CONNECTION, raw & PORTSC_CCS != 0);
        status.set(PortStatus::ENABLE, raw & PORTSC_PED != 0);
        status.set(PortStatus::SUSPEND, raw & PORTSC_SUSP != 0);
        status.set(PortStatus::RESET, raw & PORTSC_PR != 0);
        status.set(PortStatus::LOW_SPEED, raw & PORTSC_LSDA != 0);

        let mut change = PortChange::empty();
        change.set(PortChange::C_CONNECTION, raw & PORTSC_CSC != 0);
        change.set(PortChange::C_ENABLE, raw & PORTSC_PEDC != 0);
        change.set(
            PortChange::C_RESET,
            state.reset_done[(port - 1) as usize] && raw & PORTSC_PR == 0,
        );
        Ok((status, change))
    }

    fn set_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), HubError> {
        let offset = self.offset(port)?;
        match feature {
            PortFeature::Reset => {
                // PORTSC reset is driven by software: raise the reset signal,
                // hold it for the pulse width, drop it and enable the port.
                {
                    let mut state = self.state();
                    let raw = state.region.read_portsc(offset)?;
                    state
                        .region
                        .write_portsc(offset, (raw & !PORTSC_W1C) | PORTSC_PR)?;
                }
                self.delay(self.reset_pulse);
                let mut state = self.state();
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, (raw & !PORTSC_W1C & !PORTSC_PR) | PORTSC_PED)?;
                state.reset_done[(port - 1) as usize] = true;
                Ok(())
            }
            PortFeature::Enable => {
                let mut state = self.state();
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, (raw & !PORTSC_W1C) | PORTSC_PED)
            }
            PortFeature::Suspend => {
                let mut state = self.state();
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, (raw & !PORTSC_W1C) | PORTSC_SUSP)
            }
            // No power switching on root ports.
            PortFeature::Power => Ok(()),
            _ => Err(HubError::ProtocolAnomaly("feature not settable on root port")),
        }
    }

    fn clear_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), HubError> {
        let offset = self.offset(port)?;
        let mut state = self.state();
        match feature {
            PortFeature::CConnection => {
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, (raw & !PORTSC_W1C) | PORTSC_CSC)
            }
            PortFeature::CEnable => {
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, (raw & !PORTSC_W1C) | PORTSC_PEDC)
            }
            PortFeature::CReset => {
                state.reset_done[(port - 1) as usize] = false;
                Ok(())
            }
            PortFeature::Enable => {
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, raw & !PORTSC_W1C & !PORTSC_PED)
            }
            PortFeature::Suspend => {
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, raw & !PORTSC_W1C & !PORTSC_SUSP)
            }
            // Nothing latched for these on a PORTSC port.
            PortFeature::Power | PortFeature::CSuspend | PortFeature::COverCurrent => Ok(()),
            PortFeature::Reset => {
                let raw = state.region.read_portsc(offset)?;
                state
                    .region
                    .write_portsc(offset, raw & !PORTSC_W1C & !PORTSC_PR)
            }
        }
    }

    fn hub_status(&self) -> Result<(HubStatus, HubChange), HubError> {
        // The root hub has no hub-level status word.
        Ok((HubStatus::empty(), HubChange::empty()))
    }

    fn clear_hub_feature(&self, _feature: HubFeature) -> Result<(), HubError> {
        Ok(())
    }
}

/// The host controller's built-in hub. Ports are initialized in index order;
/// a failure mid-sequence rolls the already-initialized ports back so no
/// partial bring-up is ever observable.
pub struct RootHub {
    shared: HubShared,
    ports: Vec<Port>,
}

impl RootHub {
    /// Fixed interval for the periodic status check registered with the
    /// external scheduler; root ports have no interrupt pipe to wait on.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

    pub fn init(
        region: Box<dyn PortRegisterRegion>,
        port_count: u8,
        sink: Arc<dyn EnumerationSink>,
        config: HubConfig,
    ) -> Result<Self, HubError> {
        if port_count == 0 {
            return Err(HubError::InvalidDescriptor("root hub reports zero ports"));
        }
        let expected = port_count as usize * PORTSC_REGISTER_SIZE;
        if region.len() != expected {
            return Err(HubError::InvalidDescriptor(
                "port register region size mismatch",
            ));
        }
        let mut region = region;
        region.map(expected)?;

        let channel = Arc::new(PortscChannel::new(
            region,
            port_count,
            config.port_reset_pulse,
        ));
        let shared = HubShared {
            channel,
            sink,
            arbiter: Arc::new(DefaultAddressArbiter::new()),
            config,
            speed: UsbSpeed::Full,
            power_switched: false,
            per_port_power: false,
            power_good_delay: Duration::ZERO,
        };

        let mut ports: Vec<Port> = Vec::with_capacity(port_count as usize);
        for number in 1..=port_count {
            let mut port = Port::new(number);
            if let Err(err) = Self::init_port(&shared, &mut port) {
                warn!(port = number, %err, "root port init failed, rolling back");
                for earlier in &mut ports {
                    earlier.shut_down(&shared);
                }
                return Err(err);
            }
            ports.push(port);
        }
        debug!(ports = ports.len(), "root hub ready");

        Ok(Self { shared, ports })
    }

    /// Brings one port to a known state: stale change bits acknowledged,
    /// port disabled.
    fn init_port(shared: &HubShared, port: &mut Port) -> Result<(), HubError> {
        let number = port.number();
        shared
            .channel
            .clear_port_feature(number, PortFeature::CConnection)?;
        shared
            .channel
            .clear_port_feature(number, PortFeature::CEnable)?;
        shared
            .channel
            .clear_port_feature(number, PortFeature::Enable)?;
        port.power_on(shared);
        Ok(())
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }

    pub fn port_state(&self, number: u8) -> Option<PortState> {
        number
            .checked_sub(1)
            .and_then(|idx| self.ports.get(idx as usize))
            .map(Port::state)
    }

    pub fn port_device(&self, number: u8) -> Option<DeviceHandle> {
        number
            .checked_sub(1)
            .and_then(|idx| self.ports.get(idx as usize))
            .and_then(Port::device)
    }

    pub fn arbiter(&self) -> &Arc<DefaultAddressArbiter> {
        &self.shared.arbiter
    }

    /// Periodic port status sweep, driven by the external timer at
    /// [`RootHub::POLL_INTERVAL`].
    pub fn poll_tick(&mut self) {
        for port in &mut self.ports {
            match self.shared.channel.port_status(port.number()) {
                Ok((status, change)) if !change.is_empty() => {
                    port.on_status_change(&self.shared, status, change);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(port = port.number(), %err, "port register read failed");
                    port.mark_error();
                }
            }
        }
    }

    /// Tears every port down before the register region goes away.
    pub fn fini(&mut self) {
        for port in &mut self.ports {
            port.shut_down(&self.shared);
        }
        debug!("root hub finalized");
    }
}
