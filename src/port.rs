//! Per-port state machine: drives one downstream port from powered through
//! connected, reset, addressed and back, in response to status-change bits
//! and the outcome of the control operations it issues itself.

use tracing::{debug, trace, warn};

use crate::hub::HubShared;
use crate::{DeviceHandle, HubError, PortChange, PortFeature, PortStatus};

/// Lifecycle state of one downstream port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortState {
    Unpowered,
    Powered,
    Disconnected,
    Resetting,
    Enabled,
    AddressAssigning,
    Addressed,
    Disabling,
    Error,
}

impl PortState {
    pub fn name(self) -> &'static str {
        match self {
            PortState::Unpowered => "unpowered",
            PortState::Powered => "powered",
            PortState::Disconnected => "disconnected",
            PortState::Resetting => "resetting",
            PortState::Enabled => "enabled",
            PortState::AddressAssigning => "address-assigning",
            PortState::Addressed => "addressed",
            PortState::Disabling => "disabling",
            PortState::Error => "error",
        }
    }
}

enum ResetOutcome {
    /// Reset completed and the port came up enabled.
    Enabled(PortStatus),
    /// Reset-complete did not show up within the poll bound, or the port
    /// stayed disabled afterwards.
    NotEnabled,
    /// The device disappeared mid-sequence.
    Vanished,
}

pub(crate) struct Port {
    number: u8,
    state: PortState,
    device: Option<DeviceHandle>,
}

impl Port {
    pub(crate) fn new(number: u8) -> Self {
        Self {
            number,
            state: PortState::Unpowered,
            device: None,
        }
    }

    pub(crate) fn number(&self) -> u8 {
        self.number
    }

    pub(crate) fn state(&self) -> PortState {
        self.state
    }

    pub(crate) fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    /// Powers the port up. On hubs without power switching the feature write
    /// is skipped; the port is considered powered from the start.
    pub(crate) fn power_on(&mut self, shared: &HubShared) {
        if shared.power_switched {
            if let Err(err) = shared
                .channel
                .set_port_feature(self.number, PortFeature::Power)
            {
                warn!(port = self.number, %err, "failed to power port");
                self.state = PortState::Unpowered;
                return;
            }
        }
        if self.state == PortState::Unpowered {
            self.state = PortState::Powered;
        }
    }

    /// Records the port as powered without issuing a feature write (ganged
    /// hubs, permanently powered root ports that were already brought up).
    pub(crate) fn mark_powered(&mut self) {
        if self.state == PortState::Unpowered {
            self.state = PortState::Powered;
        }
    }

    pub(crate) fn power_off(&mut self, shared: &HubShared) {
        if shared.power_switched {
            if let Err(err) = shared
                .channel
                .clear_port_feature(self.number, PortFeature::Power)
            {
                warn!(port = self.number, %err, "failed to power port down");
            }
        }
        self.state = PortState::Unpowered;
    }

    /// A control operation against this port failed; contain the fault to
    /// this port. Any child stays registered until a physical disconnect
    /// clears the state.
    pub(crate) fn mark_error(&mut self) {
        if self.state != PortState::Error {
            debug!(port = self.number, "port marked unusable");
            self.state = PortState::Error;
        }
    }

    /// Consumes one freshly read status/change pair for this port, clearing
    /// each change bit it acts on and applying the transition it triggers.
    /// Change bits with no state-compatible transition are acknowledged and
    /// dropped, which makes duplicate notifications idempotent.
    pub(crate) fn on_status_change(
        &mut self,
        shared: &HubShared,
        status: PortStatus,
        change: PortChange,
    ) {
        if change.contains(PortChange::C_CONNECTION) {
            if self.ack(shared, PortFeature::CConnection).is_err() {
                return;
            }
            self.handle_connect_change(shared, status);
        }
        if change.contains(PortChange::C_ENABLE) {
            if self.ack(shared, PortFeature::CEnable).is_err() {
                return;
            }
            // Enable changes outside a reset sequence are informational; the
            // reset path checks the enable bit itself.
            trace!(port = self.number, "enable change acknowledged");
        }
        if change.contains(PortChange::C_SUSPEND) {
            if self.ack(shared, PortFeature::CSuspend).is_err() {
                return;
            }
            trace!(port = self.number, "suspend change acknowledged");
        }
        if change.contains(PortChange::C_OVER_CURRENT) {
            if self.ack(shared, PortFeature::COverCurrent).is_err() {
                return;
            }
            self.handle_over_current(shared, status);
        }
        if change.contains(PortChange::C_RESET) {
            // The enumeration sequence acknowledges its own reset completion;
            // one arriving here is stale.
            if self.ack(shared, PortFeature::CReset).is_err() {
                return;
            }
            trace!(port = self.number, "stray reset change acknowledged");
        }
    }

    fn ack(&mut self, shared: &HubShared, feature: PortFeature) -> Result<(), HubError> {
        shared
            .channel
            .clear_port_feature(self.number, feature)
            .map_err(|err| {
                warn!(port = self.number, ?feature, %err, "change acknowledge failed");
                self.mark_error();
                err
            })
    }

    fn handle_connect_change(&mut self, shared: &HubShared, status: PortStatus) {
        let connected = status.contains(PortStatus::CONNECTION);
        match (self.state, connected) {
            (PortState::Powered | PortState::Disconnected, true) => {
                self.begin_enumeration(shared);
            }
            (PortState::Unpowered, true) => {
                warn!(port = self.number, "connect reported on unpowered port");
            }
            (
                PortState::Unpowered | PortState::Powered | PortState::Disconnected,
                false,
            ) => {
                trace!(port = self.number, "stale disconnect ignored");
            }
            (_, false) => self.handle_disconnect(shared),
            (_, true) => {
                // Already past Disconnected; a repeat of the same connect
                // notification must not start a second enumeration.
                trace!(port = self.number, state = self.state.name(), "stale connect ignored");
            }
        }
    }

    /// Runs the reset+address sequence for a newly connected device. The
    /// default-address lease brackets the whole sequence and is dropped on
    /// every exit path.
    fn begin_enumeration(&mut self, shared: &HubShared) {
        let lease = match shared
            .arbiter
            .acquire(self.number, shared.config.default_address_timeout)
        {
            Ok(lease) => lease,
            Err(err) => {
                // Not fatal: the port stays disconnected and the next connect
                // change retries.
                warn!(port = self.number, %err, "default address unavailable, deferring");
                return;
            }
        };

        self.state = PortState::Resetting;
        match self.reset_and_address(shared) {
            Ok(Some(handle)) => {
                debug!(port = self.number, %handle, "device addressed");
                self.device = Some(handle);
                self.state = PortState::Addressed;
            }
            Ok(None) => {
                debug!(port = self.number, "device vanished during enumeration");
                self.state = PortState::Disconnected;
            }
            Err(err) => {
                warn!(port = self.number, %err, "enumeration failed");
                self.give_up(shared);
            }
        }
        drop(lease);
    }

    fn reset_and_address(&mut self, shared: &HubShared) -> Result<Option<DeviceHandle>, HubError> {
        for attempt in 0..shared.config.port_reset_attempts {
            match self.reset_once(shared) {
                Ok(ResetOutcome::Enabled(status)) => {
                    self.state = PortState::Enabled;
                    let speed = status.device_speed(shared.speed);
                    self.state = PortState::AddressAssigning;
                    let handle = shared.sink.address_device(self.number, speed)?;
                    return Ok(Some(handle));
                }
                Ok(ResetOutcome::Vanished) => return Ok(None),
                Ok(ResetOutcome::NotEnabled) => {
                    debug!(port = self.number, attempt, "port reset did not complete");
                }
                Err(err) => {
                    debug!(port = self.number, attempt, %err, "port reset attempt failed");
                }
            }
        }
        Err(HubError::Transfer("port reset retries exhausted"))
    }

    /// One reset attempt: re-checks the connection, raises the reset feature
    /// and polls bounded for the reset-complete change.
    fn reset_once(&mut self, shared: &HubShared) -> Result<ResetOutcome, HubError> {
        let (status, _) = shared.channel.port_status(self.number)?;
        if !status.contains(PortStatus::CONNECTION) {
            return Ok(ResetOutcome::Vanished);
        }

        shared
            .channel
            .set_port_feature(self.number, PortFeature::Reset)?;

        for _ in 0..shared.config.reset_wait_polls {
            shared.channel.delay(shared.config.reset_poll_interval);
            let (status, change) = shared.channel.port_status(self.number)?;
            if !status.contains(PortStatus::CONNECTION) {
                return Ok(ResetOutcome::Vanished);
            }
            if change.contains(PortChange::C_RESET) {
                shared
                    .channel
                    .clear_port_feature(self.number, PortFeature::CReset)?;
                return Ok(if status.contains(PortStatus::ENABLE) {
                    ResetOutcome::Enabled(status)
                } else {
                    ResetOutcome::NotEnabled
                });
            }
        }
        Ok(ResetOutcome::NotEnabled)
    }

    /// Retry budget exhausted: the port is unusable until the device is
    /// physically re-plugged. Power is removed where the hub can switch it.
    fn give_up(&mut self, shared: &HubShared) {
        if shared.power_switched {
            if let Err(err) = shared
                .channel
                .clear_port_feature(self.number, PortFeature::Power)
            {
                warn!(port = self.number, %err, "failed to unpower broken port");
            }
        }
        self.state = PortState::Error;
    }

    /// Connect change reported the device gone: unregister the child and
    /// return to `Disconnected`. Also the recovery path out of `Error`.
    pub(crate) fn handle_disconnect(&mut self, shared: &HubShared) {
        if let Some(handle) = self.device.take() {
            debug!(port = self.number, %handle, "removing child device");
            if let Err(err) = shared.sink.remove_device(handle) {
                warn!(port = self.number, %err, "child removal failed");
            }
        }
        self.state = PortState::Disconnected;
    }

    /// Over-current: the hub already shut the port off; drop the child and
    /// restore power once the hub signals the condition is gone.
    fn handle_over_current(&mut self, shared: &HubShared, status: PortStatus) {
        warn!(port = self.number, "over-current change on port");
        if let Some(handle) = self.device.take() {
            if let Err(err) = shared.sink.remove_device(handle) {
                warn!(port = self.number, %err, "child removal failed");
            }
        }
        if status.contains(PortStatus::OVER_CURRENT) {
            // Condition still active; wait for the change that reports it
            // cleared before re-powering.
            self.state = PortState::Unpowered;
            return;
        }
        if shared.power_switched {
            shared.channel.delay(shared.power_good_delay);
            if let Err(err) = shared
                .channel
                .set_port_feature(self.number, PortFeature::Power)
            {
                warn!(port = self.number, %err, "failed to re-power port");
                self.mark_error();
                return;
            }
        }
        self.state = PortState::Powered;
    }

    /// Tears the port down on hub shutdown or root-hub rollback: child gone,
    /// port disabled at the hardware, back to `Powered`.
    pub(crate) fn shut_down(&mut self, shared: &HubShared) {
        if let Some(handle) = self.device.take() {
            if let Err(err) = shared.sink.remove_device(handle) {
                warn!(port = self.number, %err, "child removal failed");
            }
        }
        self.state = PortState::Disabling;
        if let Err(err) = shared
            .channel
            .clear_port_feature(self.number, PortFeature::Enable)
        {
            warn!(port = self.number, %err, "failed to disable port");
        }
        self.state = PortState::Powered;
    }
}
