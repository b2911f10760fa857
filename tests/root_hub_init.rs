//! Root-hub bring-up: region size check, mapping, ordered port init with
//! rollback, and enumeration through the PORTSC translation.

mod util;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use usbhub::{
    HubConfig, HubError, PortRegisterRegion, PortState, RootHub, UsbSpeed, PORTSC_REGISTER_SIZE,
};
use util::FakeSink;

// PORTSC bits the fake hardware cares about.
const CCS: u16 = 1 << 0;
const CSC: u16 = 1 << 1;
const PED: u16 = 1 << 2;
const PEDC: u16 = 1 << 3;
const LSDA: u16 = 1 << 8;

#[derive(Clone, Copy, Debug, PartialEq)]
enum RegOp {
    Read(usize),
    Write(usize),
}

#[derive(Default)]
struct RegionState {
    regs: Vec<u16>,
    mapped: bool,
    fail_map: bool,
    /// 0-based port index whose writes fail.
    fail_writes_to: Option<usize>,
    ops: Vec<RegOp>,
}

/// Register region backed by plain memory with UHCI-style W1C change bits.
struct FakeRegion {
    state: Arc<Mutex<RegionState>>,
}

impl FakeRegion {
    fn new(port_count: usize) -> (Box<Self>, Arc<Mutex<RegionState>>) {
        let state = Arc::new(Mutex::new(RegionState {
            regs: vec![0; port_count],
            ..RegionState::default()
        }));
        (Box::new(Self { state: state.clone() }), state)
    }
}

impl PortRegisterRegion for FakeRegion {
    fn map(&mut self, expected_len: usize) -> Result<(), HubError> {
        let mut state = self.state.lock().unwrap();
        assert_eq!(expected_len, state.regs.len() * PORTSC_REGISTER_SIZE);
        if state.fail_map {
            return Err(HubError::ResourceExhausted("pio mapping denied"));
        }
        state.mapped = true;
        Ok(())
    }

    fn read_portsc(&self, offset: usize) -> Result<u16, HubError> {
        let mut state = self.state.lock().unwrap();
        assert!(state.mapped, "register read before mapping");
        let port = offset / PORTSC_REGISTER_SIZE;
        state.ops.push(RegOp::Read(port));
        Ok(state.regs[port])
    }

    fn write_portsc(&mut self, offset: usize, value: u16) -> Result<(), HubError> {
        let mut state = self.state.lock().unwrap();
        assert!(state.mapped, "register write before mapping");
        let port = offset / PORTSC_REGISTER_SIZE;
        state.ops.push(RegOp::Write(port));
        if state.fail_writes_to == Some(port) {
            return Err(HubError::Transfer("register write fault"));
        }
        // W1C semantics for the change bits; everything else is taken from
        // the written value.
        let latched = state.regs[port] & (CSC | PEDC) & !value;
        state.regs[port] = (value & !(CSC | PEDC)) | latched;
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().regs.len() * PORTSC_REGISTER_SIZE
    }
}

fn test_config() -> HubConfig {
    HubConfig {
        reset_poll_interval: Duration::ZERO,
        port_reset_pulse: Duration::ZERO,
        ..HubConfig::default()
    }
}

#[test]
fn region_size_mismatch_fails_without_touching_ports() {
    let (region, state) = FakeRegion::new(3);
    let sink = Arc::new(FakeSink::default());
    let err = RootHub::init(region, 4, sink, test_config()).err().unwrap();
    assert!(matches!(err, HubError::InvalidDescriptor(_)));
    let state = state.lock().unwrap();
    assert!(!state.mapped);
    assert!(state.ops.is_empty());
}

#[test]
fn mapping_failure_is_resource_exhausted() {
    let (region, state) = FakeRegion::new(2);
    state.lock().unwrap().fail_map = true;
    let sink = Arc::new(FakeSink::default());
    let err = RootHub::init(region, 2, sink, test_config()).err().unwrap();
    assert!(matches!(err, HubError::ResourceExhausted(_)));
    assert!(state.lock().unwrap().ops.is_empty());
}

#[test]
fn init_failure_rolls_back_exactly_the_earlier_ports() {
    let (region, state) = FakeRegion::new(4);
    state.lock().unwrap().fail_writes_to = Some(2);
    let sink = Arc::new(FakeSink::default());

    let err = RootHub::init(region, 4, sink, test_config()).err().unwrap();
    assert!(matches!(err, HubError::Transfer(_)));

    let state = state.lock().unwrap();
    // No access beyond the failing port.
    assert!(state.ops.iter().all(|op| {
        let port = match op {
            RegOp::Read(p) | RegOp::Write(p) => *p,
        };
        port <= 2
    }));
    let writes_to = |port: usize| {
        state
            .ops
            .iter()
            .filter(|op| **op == RegOp::Write(port))
            .count()
    };
    // Ports 0 and 1: three init writes plus one rollback disable each; port
    // 2 only saw its single failing write.
    assert_eq!(writes_to(0), 4);
    assert_eq!(writes_to(1), 4);
    assert_eq!(writes_to(2), 1);
    assert_eq!(writes_to(3), 0);
}

#[test]
fn connected_port_enumerates_through_the_registers() {
    let (region, state) = FakeRegion::new(2);
    let sink = Arc::new(FakeSink::default());
    let mut rh = RootHub::init(region, 2, sink.clone(), test_config()).unwrap();
    sink.watch_arbiter(rh.arbiter().clone());
    assert_eq!(rh.port_state(1), Some(PortState::Powered));

    // Plug a full-speed device into port 1.
    {
        let mut state = state.lock().unwrap();
        state.regs[0] |= CCS | CSC;
    }
    rh.poll_tick();

    assert_eq!(rh.port_state(1), Some(PortState::Addressed));
    assert_eq!(rh.port_state(2), Some(PortState::Powered));
    assert_eq!(sink.added(), vec![(1, UsbSpeed::Full)]);
    assert_eq!(rh.arbiter().held_by(), None);
    // The port ended up enabled with the reset signal released.
    assert_eq!(state.lock().unwrap().regs[0] & PED, PED);
}

#[test]
fn low_speed_device_is_reported_from_the_line_state_bit() {
    let (region, state) = FakeRegion::new(1);
    let sink = Arc::new(FakeSink::default());
    let mut rh = RootHub::init(region, 1, sink.clone(), test_config()).unwrap();

    state.lock().unwrap().regs[0] |= CCS | CSC | LSDA;
    rh.poll_tick();

    assert_eq!(sink.added(), vec![(1, UsbSpeed::Low)]);
}

#[test]
fn disconnect_after_enumeration_removes_the_child() {
    let (region, state) = FakeRegion::new(1);
    let sink = Arc::new(FakeSink::default());
    let mut rh = RootHub::init(region, 1, sink.clone(), test_config()).unwrap();

    state.lock().unwrap().regs[0] |= CCS | CSC;
    rh.poll_tick();
    let handle = rh.port_device(1).unwrap();

    {
        let mut state = state.lock().unwrap();
        state.regs[0] &= !(CCS | PED);
        state.regs[0] |= CSC | PEDC;
    }
    rh.poll_tick();

    assert_eq!(rh.port_state(1), Some(PortState::Disconnected));
    assert_eq!(sink.removed(), vec![handle]);
}

#[test]
fn fini_disables_ports_and_unregisters_children() {
    let (region, state) = FakeRegion::new(2);
    let sink = Arc::new(FakeSink::default());
    let mut rh = RootHub::init(region, 2, sink.clone(), test_config()).unwrap();

    state.lock().unwrap().regs[0] |= CCS | CSC;
    rh.poll_tick();
    let handle = rh.port_device(1).unwrap();

    rh.fini();

    assert_eq!(sink.removed(), vec![handle]);
    assert_eq!(rh.port_state(1), Some(PortState::Powered));
    assert_eq!(state.lock().unwrap().regs[0] & PED, 0);
}
