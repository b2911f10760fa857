//! Hub device context: aggregates the ports of one hub, the shared control
//! channel and the default-address arbiter, and feeds change notifications
//! from the polling transport into the per-port state machines.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::arbiter::DefaultAddressArbiter;
use crate::port::{Port, PortState};
use crate::status::{self, ChangeBitmap};
use crate::{
    DeviceHandle, EnumerationSink, HubChange, HubControl, HubError, HubFeature, HubStatus,
    UsbSpeed,
};

/// Hub attributes fixed at creation, decoded from the hub class descriptor
/// by the transfer layer.
#[derive(Clone, Copy, Debug)]
pub struct HubDescriptor {
    /// Number of downstream ports; must be positive.
    pub port_count: u8,
    /// Speed the hub itself operates at.
    pub speed: UsbSpeed,
    /// Hub supports port power switching at all.
    pub power_switched: bool,
    /// Each port is switched individually (implies `power_switched`).
    pub per_port_power: bool,
    /// bPwrOn2PwrGood: settle time after powering a port.
    pub power_good_delay: Duration,
}

impl HubDescriptor {
    fn validate(&self) -> Result<(), HubError> {
        if self.port_count == 0 {
            return Err(HubError::InvalidDescriptor("hub reports zero ports"));
        }
        if self.per_port_power && !self.power_switched {
            return Err(HubError::InvalidDescriptor(
                "per-port power switching on a hub without switched power",
            ));
        }
        Ok(())
    }
}

/// Bounded retry/wait constants of the driver. The defaults are the small
/// fixed values the hub class has always tolerated; all of them are
/// overridable per hub.
#[derive(Clone, Copy, Debug)]
pub struct HubConfig {
    /// Bound on waiting for the default-address slot.
    pub default_address_timeout: Duration,
    /// How many times a port reset is attempted before the port is declared
    /// unusable.
    pub port_reset_attempts: u32,
    /// Polls of the status register per reset attempt.
    pub reset_wait_polls: u32,
    /// Pause between those polls, issued through the transport.
    pub reset_poll_interval: Duration,
    /// Width of the reset pulse the root-hub adapter drives on its port
    /// registers. External hubs time the pulse themselves.
    pub port_reset_pulse: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_address_timeout: Duration::from_millis(500),
            port_reset_attempts: 3,
            reset_wait_polls: 20,
            reset_poll_interval: Duration::from_millis(10),
            port_reset_pulse: Duration::from_millis(50),
        }
    }
}

/// Capabilities shared by every port of one hub. Ports own all their other
/// state exclusively; this plus the arbiter is the only data crossing port
/// contexts.
pub(crate) struct HubShared {
    pub(crate) channel: Arc<dyn HubControl>,
    pub(crate) sink: Arc<dyn EnumerationSink>,
    pub(crate) arbiter: Arc<DefaultAddressArbiter>,
    pub(crate) config: HubConfig,
    pub(crate) speed: UsbSpeed,
    pub(crate) power_switched: bool,
    pub(crate) per_port_power: bool,
    pub(crate) power_good_delay: Duration,
}

/// One attached hub: created on device-add, shut down on device-remove or
/// device-gone. All state is in-memory and rebuilt on re-add.
pub struct HubDevice {
    shared: HubShared,
    ports: Vec<Port>,
    shut_down: bool,
}

impl HubDevice {
    /// Validates the descriptor, builds the port array and powers the ports.
    /// A port that fails to power up stays `Unpowered` and is skipped by
    /// later notifications; this does not fail hub creation.
    pub fn new(
        descriptor: HubDescriptor,
        channel: Arc<dyn HubControl>,
        sink: Arc<dyn EnumerationSink>,
        config: HubConfig,
    ) -> Result<Self, HubError> {
        descriptor.validate()?;
        let shared = HubShared {
            channel,
            sink,
            arbiter: Arc::new(DefaultAddressArbiter::new()),
            config,
            speed: descriptor.speed,
            power_switched: descriptor.power_switched,
            per_port_power: descriptor.per_port_power,
            power_good_delay: descriptor.power_good_delay,
        };

        let mut ports: Vec<Port> = (1..=descriptor.port_count).map(Port::new).collect();
        for (idx, port) in ports.iter_mut().enumerate() {
            if shared.power_switched && !shared.per_port_power && idx > 0 {
                // Ganged switching: the set-power on the first port powered
                // the whole gang.
                port.mark_powered();
            } else {
                port.power_on(&shared);
            }
        }
        if shared.power_switched && !shared.power_good_delay.is_zero() {
            shared.channel.delay(shared.power_good_delay);
        }
        debug!(ports = ports.len(), "hub ready");

        Ok(Self {
            shared,
            ports,
            shut_down: false,
        })
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }

    /// State of port `number` (1-based).
    pub fn port_state(&self, number: u8) -> Option<PortState> {
        self.port(number).map(Port::state)
    }

    /// Child device registered on port `number`, if any.
    pub fn port_device(&self, number: u8) -> Option<DeviceHandle> {
        self.port(number).and_then(Port::device)
    }

    /// The hub's default-address arbiter. Exposed so integrations (and
    /// tests) can observe the lease invariant.
    pub fn arbiter(&self) -> &Arc<DefaultAddressArbiter> {
        &self.shared.arbiter
    }

    fn port(&self, number: u8) -> Option<&Port> {
        number
            .checked_sub(1)
            .and_then(|idx| self.ports.get(idx as usize))
    }

    /// Polling-transport callback: consumes one raw change bitmap (bit 0 =
    /// hub, bits 1..=port_count = ports) and dispatches every flagged
    /// change. Returns whether polling should continue.
    pub fn on_interrupt_data(&mut self, buf: &[u8]) -> bool {
        if self.shut_down {
            return false;
        }
        let bitmap = ChangeBitmap::new(buf, self.port_count());
        if bitmap.hub_changed() {
            self.handle_hub_change();
        }
        status::dispatch(&self.shared, &mut self.ports, &bitmap);
        true
    }

    /// Periodic status sweep for transports without a working interrupt
    /// pipe: reads every port's status pair and processes any asserted
    /// change bits.
    pub fn poll_tick(&mut self) {
        if self.shut_down {
            return;
        }
        match self.shared.channel.hub_status() {
            Ok((_, change)) if !change.is_empty() => self.handle_hub_change(),
            Ok(_) => {}
            Err(err) => warn!(%err, "hub status read failed"),
        }
        for port in &mut self.ports {
            match self.shared.channel.port_status(port.number()) {
                Ok((status, change)) if !change.is_empty() => {
                    port.on_status_change(&self.shared, status, change);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(port = port.number(), %err, "port status read failed");
                    port.mark_error();
                }
            }
        }
    }

    /// Hub-level change (bit 0 of the bitmap): acknowledge the hub features
    /// and, after an over-current episode on a switched hub, bring port
    /// power back.
    fn handle_hub_change(&mut self) {
        let (status, change) = match self.shared.channel.hub_status() {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "hub status read failed");
                return;
            }
        };
        if change.contains(HubChange::C_LOCAL_POWER) {
            debug!(lost = status.contains(HubStatus::LOCAL_POWER), "hub local power change");
            if let Err(err) = self
                .shared
                .channel
                .clear_hub_feature(HubFeature::CHubLocalPower)
            {
                warn!(%err, "failed to acknowledge hub power change");
            }
        }
        if change.contains(HubChange::C_OVER_CURRENT) {
            warn!("hub over-current change");
            if let Err(err) = self
                .shared
                .channel
                .clear_hub_feature(HubFeature::CHubOverCurrent)
            {
                warn!(%err, "failed to acknowledge hub over-current");
            }
            if self.shared.power_switched {
                if status.contains(HubStatus::OVER_CURRENT) {
                    for port in &mut self.ports {
                        port.power_off(&self.shared);
                    }
                } else {
                    self.shared.channel.delay(self.shared.power_good_delay);
                    for port in &mut self.ports {
                        port.power_on(&self.shared);
                    }
                }
            }
        }
    }

    /// Device-remove/device-gone path. No port can hold the default-address
    /// lease past this point (leases are scoped to the enumeration call), so
    /// the control channel handle can be dropped safely afterwards; further
    /// polling callbacks are refused.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        debug_assert!(self.shared.arbiter.held_by().is_none());
        self.shut_down = true;
        debug!("hub shut down");
    }
}
