//! Status-change dispatch: decodes the raw interrupt change bitmap from the
//! polling transport and routes each flagged port through its state machine.

use tracing::warn;

use crate::hub::HubShared;
use crate::port::Port;
use crate::change_bitmap_len;

/// View over one raw change-bitmap buffer. Bit 0 flags a hub-level change;
/// bits `1..=port_count` flag per-port changes, iterated in ascending port
/// order. Asserted bits beyond `port_count` are protocol anomalies.
pub(crate) struct ChangeBitmap<'a> {
    bytes: &'a [u8],
    port_count: u8,
}

impl<'a> ChangeBitmap<'a> {
    pub(crate) fn new(bytes: &'a [u8], port_count: u8) -> Self {
        if bytes.len() != change_bitmap_len(port_count) {
            warn!(
                got = bytes.len(),
                expected = change_bitmap_len(port_count),
                "change bitmap length mismatch"
            );
        }
        Self { bytes, port_count }
    }

    fn bit(&self, index: usize) -> bool {
        self.bytes
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    pub(crate) fn hub_changed(&self) -> bool {
        self.bit(0)
    }

    /// Ports flagged as changed, ascending, restricted to the valid range.
    pub(crate) fn changed_ports(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=self.port_count).filter(|&port| self.bit(port as usize))
    }

    /// Number of asserted bits that name no existing port.
    pub(crate) fn anomalies(&self) -> usize {
        (self.port_count as usize + 1..self.bytes.len() * 8)
            .filter(|&bit| self.bit(bit))
            .count()
    }
}

/// Routes every flagged port of `bitmap` through its state machine, reading
/// the full status pair first. Per-port failures stay on that port.
pub(crate) fn dispatch(shared: &HubShared, ports: &mut [Port], bitmap: &ChangeBitmap<'_>) {
    let anomalies = bitmap.anomalies();
    if anomalies > 0 {
        warn!(anomalies, "change bits for nonexistent ports discarded");
    }
    for number in bitmap.changed_ports() {
        let port = &mut ports[(number - 1) as usize];
        match shared.channel.port_status(number) {
            Ok((status, change)) => port.on_status_change(shared, status, change),
            Err(err) => {
                warn!(port = number, %err, "port status read failed");
                port.mark_error();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_bit_and_ports_decode_in_order() {
        // Bit 0 = hub, bits 2 and 4 = ports 2 and 4.
        let buf = [0b0001_0101u8];
        let bitmap = ChangeBitmap::new(&buf, 4);
        assert!(bitmap.hub_changed());
        assert_eq!(bitmap.changed_ports().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(bitmap.anomalies(), 0);
    }

    #[test]
    fn out_of_range_bits_are_anomalies_not_ports() {
        // Port 5 on a 4-port hub.
        let buf = [1u8 << 5];
        let bitmap = ChangeBitmap::new(&buf, 4);
        assert!(!bitmap.hub_changed());
        assert_eq!(bitmap.changed_ports().count(), 0);
        assert_eq!(bitmap.anomalies(), 1);
    }

    #[test]
    fn wide_bitmap_reaches_high_ports() {
        // Port 9 of an 11-port hub lives in the second byte.
        let buf = [0u8, 0b0000_0010];
        let bitmap = ChangeBitmap::new(&buf, 11);
        assert_eq!(bitmap.changed_ports().collect::<Vec<_>>(), vec![9]);
        assert_eq!(bitmap.anomalies(), 0);
    }

    #[test]
    fn short_buffer_reads_as_unset() {
        let buf = [0b0000_0100u8];
        let bitmap = ChangeBitmap::new(&buf, 11);
        assert_eq!(bitmap.changed_ports().collect::<Vec<_>>(), vec![2]);
    }
}
