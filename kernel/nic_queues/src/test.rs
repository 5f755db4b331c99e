//! Tests for ring bookkeeping, with the hardware's side of each transfer simulated
//! by writing the descriptors directly.

extern crate std;

use self::std::dbg;
use alloc::{vec, vec::Vec};
use iudma_descriptors::{len_stat_word, DESC_ESOP, DESC_EOP, DESC_OWNER, DESC_RX_CRC, DESC_SOP};
use super::*;

#[derive(Debug, PartialEq, Eq)]
struct TestBuf {
    id: u32,
    cap: u16,
}

impl DmaBuffer for TestBuf {
    fn bus_address(&self) -> u32 {
        0x0100_0000 + self.id * 0x800
    }

    fn capacity(&self) -> u16 {
        self.cap
    }
}

fn buf(id: u32) -> TestBuf {
    TestBuf { id, cap: 1536 }
}

fn ring(capacity: usize) -> Ring<TestBuf> {
    Ring::new(capacity, DescriptorLayout::STANDARD).unwrap()
}

/// Acts as the DMA engine finishing a receive into descriptor `index`.
fn hw_receive(ring: &mut Ring<TestBuf>, index: usize, length: u16, flags: u32) {
    let layout = ring.layout;
    let desc = ring.table.desc_mut(index);
    let wrap = desc.len_stat() & layout.wrap();
    desc.set_len_stat(len_stat_word(length, flags | wrap));
}

/// Acts as the DMA engine finishing the transmit of descriptor `index`.
fn hw_transmit(ring: &mut Ring<TestBuf>, index: usize) {
    let desc = ring.table.desc_mut(index);
    desc.set_len_stat(desc.len_stat() & !DESC_OWNER);
}

#[test]
fn new_rejects_bad_capacity() {
    assert!(Ring::<TestBuf>::new(0, DescriptorLayout::STANDARD).is_err());
    assert!(Ring::<TestBuf>::new(MAX_RING_SIZE + 1, DescriptorLayout::STANDARD).is_err());
}

#[test]
fn new_ring_is_zeroed_with_wrap_on_last() {
    let ring = ring(8);
    dbg!(&ring);
    for i in 0..8 {
        let desc = ring.table().get(i).unwrap();
        assert_eq!(desc.address(), 0);
        assert!(!desc.owned_by_hardware());
        assert_eq!(desc.is_wrap(DescriptorLayout::STANDARD), i == 7);
    }
    assert_eq!(ring.table().size_in_bytes(), 64);
    assert_eq!(ring.table().as_bytes().len(), 64);
    assert!(ring.verify().is_ok());
}

#[test]
fn live_count_tracks_posted_but_not_harvested() {
    let mut ring = ring(16);
    let mut next_id = 0;
    let mut outstanding = 0usize;
    let mut seed: u32 = 0x1234_5678;
    for _ in 0..500 {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let post = (seed >> 16) % 3 != 0;
        if post && !ring.is_full() {
            ring.post_rx(buf(next_id)).unwrap();
            next_id += 1;
            outstanding += 1;
        } else if outstanding > 0 {
            let head = ring.head();
            hw_receive(&mut ring, head, 64, DESC_ESOP);
            assert!(ring.harvest_rx().unwrap().is_some());
            outstanding -= 1;
        }
        assert_eq!(ring.live_count(), outstanding);
        assert!(ring.live_count() <= ring.capacity());
    }
    assert!(ring.verify().is_ok());
}

#[test]
fn rx_round_trip_returns_same_buffer_and_length() {
    let mut ring = ring(4);
    ring.post_rx(buf(7)).unwrap();
    let desc = ring.table().get(0).unwrap();
    assert!(desc.owned_by_hardware());
    assert_eq!(desc.address(), buf(7).bus_address());
    assert_eq!(desc.length(), 1536);

    hw_receive(&mut ring, 0, 98, DESC_ESOP);
    let (buffer, status) = ring.harvest_rx().unwrap().unwrap();
    assert_eq!(buffer, buf(7));
    assert_eq!(status.length, 98);
    assert!(status.is_whole_frame());
    assert!(ring.is_empty());
}

#[test]
fn harvest_of_hardware_owned_slot_is_idempotent() {
    let mut ring = ring(4);
    ring.post_rx(buf(1)).unwrap();
    ring.post_rx(buf(2)).unwrap();
    let before = ring.table().get(0).unwrap().len_stat();
    for _ in 0..5 {
        assert!(ring.harvest_rx().unwrap().is_none());
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 2);
        assert_eq!(ring.live_count(), 2);
        assert_eq!(ring.table().get(0).unwrap().len_stat(), before);
    }
}

#[test]
fn harvest_of_empty_ring_returns_nothing() {
    let mut ring = ring(4);
    assert!(ring.harvest_rx().unwrap().is_none());
    assert!(ring.reclaim_tx().unwrap().is_none());
}

#[test]
fn wraparound_resumes_at_index_zero() {
    let mut ring = ring(4);
    for id in 0..4 {
        ring.post_rx(buf(id)).unwrap();
        hw_receive(&mut ring, id as usize, 60, DESC_ESOP);
        let (buffer, _) = ring.harvest_rx().unwrap().unwrap();
        assert_eq!(buffer.id, id);
    }
    assert_eq!(ring.tail(), 0);
    assert_eq!(ring.head(), 0);

    // the fifth post lands on index 0 again
    ring.post_rx(buf(4)).unwrap();
    assert_eq!(ring.table().get(0).unwrap().address(), buf(4).bus_address());
    assert_eq!(ring.tail(), 1);

    // the wrap slot is re-armed with its marker and completes like any other
    for id in 5..8 {
        ring.post_rx(buf(id)).unwrap();
    }
    let last = ring.table().get(3).unwrap();
    assert!(last.is_wrap(DescriptorLayout::STANDARD));
    assert!(last.owned_by_hardware());
    for index in 0..4 {
        hw_receive(&mut ring, index, 60, DESC_ESOP);
        let (buffer, _) = ring.harvest_rx().unwrap().unwrap();
        assert_eq!(buffer.id, 4 + index as u32);
    }
    assert!(ring.table().get(3).unwrap().is_wrap(DescriptorLayout::STANDARD));
    assert!(ring.verify().is_ok());
}

#[test]
fn wrap_bit_survives_on_shifted_layout() {
    let layout = DescriptorLayout::new(3).unwrap();
    let mut ring: Ring<TestBuf> = Ring::new(2, layout).unwrap();
    ring.post_tx(buf(0), 60, true, true).unwrap();
    ring.post_tx(buf(1), 60, true, true).unwrap();
    let last = ring.table().get(1).unwrap();
    assert!(last.is_wrap(layout));
    assert_eq!(last.len_stat() & layout.esop(), layout.esop());
    hw_transmit(&mut ring, 0);
    hw_transmit(&mut ring, 1);
    assert_eq!(ring.reclaim_tx().unwrap(), Some(buf(0)));
    assert_eq!(ring.reclaim_tx().unwrap(), Some(buf(1)));
    assert!(ring.table().get(1).unwrap().is_wrap(layout));
    assert!(ring.verify().is_ok());
}

#[test]
fn full_rx_ring_rejects_then_accepts_after_harvest() {
    let mut ring = ring(2);
    ring.post_rx(buf(0)).unwrap();
    ring.post_rx(buf(1)).unwrap();
    let rejected = ring.post_rx(buf(2)).unwrap_err();
    assert_eq!(rejected.into_inner(), buf(2));
    assert_eq!(ring.live_count(), 2);

    hw_receive(&mut ring, 0, 60, DESC_ESOP);
    ring.harvest_rx().unwrap().unwrap();
    assert!(ring.post_rx(buf(2)).is_ok());
}

#[test]
fn full_tx_ring_rejects_then_accepts_after_reclaim() {
    let mut ring = ring(1);
    ring.post_tx(buf(0), 60, true, true).unwrap();
    assert_eq!(ring.post_tx(buf(1), 60, true, true).unwrap_err().0, buf(1));
    hw_transmit(&mut ring, 0);
    assert_eq!(ring.reclaim_tx().unwrap(), Some(buf(0)));
    assert!(ring.post_tx(buf(1), 60, true, true).is_ok());
}

#[test]
fn hardware_owning_idle_descriptor_is_desync() {
    let mut ring = ring(4);
    ring.table.desc_mut(0).set_len_stat(DESC_OWNER);
    let err = ring.harvest_rx().unwrap_err();
    assert_eq!(err, RingDesync { index: 0, reason: DesyncReason::OwnedWhileIdle });
    assert_eq!(ring.reclaim_tx().unwrap_err().reason, DesyncReason::OwnedWhileIdle);
    assert_eq!(ring.verify().unwrap_err().reason, DesyncReason::OwnedWhileIdle);
}

#[test]
fn received_length_beyond_offer_is_desync() {
    let mut ring = ring(4);
    ring.post_rx(TestBuf { id: 0, cap: 128 }).unwrap();
    hw_receive(&mut ring, 0, 129, DESC_ESOP);
    assert_eq!(ring.harvest_rx().unwrap_err().reason, DesyncReason::LengthOverrun);
    // the buffer stays in the ring for a later forced release
    assert_eq!(ring.live_count(), 1);
}

#[test]
fn misplaced_wrap_is_detected() {
    let mut ring = ring(4);
    ring.table.desc_mut(3).set_len_stat(0);
    assert_eq!(ring.verify().unwrap_err(), RingDesync { index: 3, reason: DesyncReason::WrapMisplaced });
}

#[test]
fn error_status_is_reported_with_buffer() {
    let mut ring = ring(4);
    ring.post_rx(buf(0)).unwrap();
    hw_receive(&mut ring, 0, 64, DESC_ESOP | DESC_RX_CRC);
    let (buffer, status) = ring.harvest_rx().unwrap().unwrap();
    assert_eq!(buffer, buf(0));
    assert_eq!(status.errors, DESC_RX_CRC);
}

#[test]
fn capacity_four_scenario() {
    let mut ring = ring(4);
    for id in 0..4 {
        assert!(ring.post_rx(buf(id)).is_ok());
    }
    let e = ring.post_rx(buf(4)).unwrap_err().into_inner();
    assert_eq!(e, buf(4));

    hw_receive(&mut ring, 0, 100, DESC_ESOP);
    hw_receive(&mut ring, 1, 200, DESC_ESOP);
    let (a, a_status) = ring.harvest_rx().unwrap().unwrap();
    let (b, b_status) = ring.harvest_rx().unwrap().unwrap();
    assert_eq!((a.id, a_status.length), (0, 100));
    assert_eq!((b.id, b_status.length), (1, 200));
    assert!(ring.harvest_rx().unwrap().is_none());

    assert!(ring.post_rx(e).is_ok());
    assert_eq!(ring.live_count(), 3);
}

#[test]
fn tx_capacity_two_scenario() {
    let mut ring = ring(2);
    ring.post_tx(buf(9), 64, true, true).unwrap();
    let desc = ring.table().get(0).unwrap();
    assert_eq!(desc.length(), 64);
    assert_eq!(desc.len_stat() & DESC_ESOP, DESC_ESOP);

    assert!(ring.reclaim_tx().unwrap().is_none());
    hw_transmit(&mut ring, 0);
    let reclaimed: Vec<TestBuf> = core::iter::from_fn(|| ring.reclaim_tx().unwrap()).collect();
    assert_eq!(reclaimed, [buf(9)]);
    assert!(ring.is_empty());
}

#[test]
fn multi_fragment_packet_is_posted_whole() {
    let mut ring = ring(4);
    ring.post_tx_packet(vec![(buf(0), 100), (buf(1), 200), (buf(2), 300)]).unwrap();
    assert_eq!(ring.live_count(), 3);
    let flags = |i: usize| ring.table().get(i).unwrap().len_stat() & DESC_ESOP;
    assert_eq!(flags(0), DESC_SOP);
    assert_eq!(flags(1), 0);
    assert_eq!(flags(2), DESC_EOP);
    assert!(ring.table().get(2).unwrap().owned_by_hardware());

    let rejected = ring.post_tx_packet(vec![(buf(3), 10), (buf(4), 10)]).unwrap_err().into_inner();
    assert_eq!(rejected.len(), 2);
    assert_eq!(ring.live_count(), 3);
    assert_eq!(ring.tail(), 3);
}

#[test]
fn oversized_tx_length_is_truncated_to_buffer() {
    let mut ring = ring(2);
    ring.post_tx(TestBuf { id: 0, cap: 64 }, 100, true, true).unwrap();
    assert_eq!(ring.table().get(0).unwrap().length(), 64);
}

#[test]
fn force_release_drains_everything() {
    let mut ring = ring(4);
    for id in 0..3 {
        ring.post_rx(buf(id)).unwrap();
    }
    let mut released = Vec::new();
    assert_eq!(ring.force_release(&mut released), 3);
    assert_eq!(released.iter().map(|b| b.id).collect::<Vec<_>>(), [0, 1, 2]);
    assert!(ring.is_empty());
    assert_eq!((ring.head(), ring.tail()), (0, 0));
    assert!(!ring.table().get(0).unwrap().owned_by_hardware());
    assert!(ring.verify().is_ok());
}

#[test]
fn reset_requires_empty_ring() {
    let mut ring = ring(4);
    ring.post_rx(buf(0)).unwrap();
    assert!(ring.reset().is_err());
    hw_receive(&mut ring, 0, 60, DESC_ESOP);
    ring.harvest_rx().unwrap().unwrap();
    assert!(ring.reset().is_ok());
    assert_eq!((ring.head(), ring.tail()), (0, 0));
}
