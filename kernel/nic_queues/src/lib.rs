//! Descriptor rings: the host-side bookkeeping for one direction of one DMA channel.
//!
//! A [`Ring`] pairs a [`DescriptorTable`] shared with the device with an array of slots
//! that own the buffers the descriptors point to. Software posts at `tail` and
//! harvests (rx) or reclaims (tx) at `head`; `live_count` is the number of
//! descriptors currently owned by the hardware, which are exactly the ones
//! from `head` (inclusive) to `tail` (exclusive), modulo the capacity.
//!
//! The ring itself does no locking and touches no registers.
//! Its owner serializes access and kicks the hardware.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate zerocopy;
extern crate iudma_descriptors;
extern crate nic_buffers;

mod table;
#[cfg(test)]
mod test;

pub use table::DescriptorTable;

use core::fmt;
use alloc::vec::Vec;
use iudma_descriptors::{DescriptorLayout, RxStatus, DESC_LENGTH_MAX};
use nic_buffers::DmaBuffer;

/// The largest number of descriptors a ring may have.
pub const MAX_RING_SIZE: usize = 8192;


/// A post failed because every descriptor of the ring is owned by the hardware.
/// The rejected buffer is handed back.
pub struct RingFull<B>(pub B);

impl<B> RingFull<B> {
    pub fn into_inner(self) -> B {
        self.0
    }
}

impl<B> fmt::Debug for RingFull<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RingFull")
    }
}


/// How the descriptor table disagreed with the ring's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesyncReason {
    /// The hardware owns a descriptor that software never posted.
    OwnedWhileIdle,
    /// A descriptor software considers live has no buffer behind it.
    MissingBuffer,
    /// A descriptor software considers free still holds a buffer.
    StrayBuffer,
    /// The hardware reported receiving more bytes than the buffer offered.
    LengthOverrun,
    /// The WRAP marker is missing from the last descriptor or present on another one.
    WrapMisplaced,
}

impl fmt::Display for DesyncReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            DesyncReason::OwnedWhileIdle => "hardware owns a descriptor that was never posted",
            DesyncReason::MissingBuffer  => "live descriptor has no buffer",
            DesyncReason::StrayBuffer    => "free descriptor still holds a buffer",
            DesyncReason::LengthOverrun  => "received length exceeds the offered capacity",
            DesyncReason::WrapMisplaced  => "wrap marker is not on the last descriptor",
        })
    }
}

/// The ring's view of descriptor ownership no longer matches the hardware's.
/// This cannot be repaired in place; the ring must be drained and rebuilt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingDesync {
    pub index: usize,
    pub reason: DesyncReason,
}

impl fmt::Display for RingDesync {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ring desync at descriptor {}: {}", self.index, self.reason)
    }
}


/// A buffer held by the ring, and how many bytes its descriptor was armed with.
/// For rx that is the capacity offered, which is distinct from the length
/// the hardware writes back on completion.
struct Slot<B> {
    buffer: B,
    armed_length: u16,
}

/// A fixed-capacity ring of descriptors and the buffers they point to.
pub struct Ring<B: DmaBuffer> {
    layout: DescriptorLayout,
    table: DescriptorTable,
    slots: Vec<Option<Slot<B>>>,
    head: usize,
    tail: usize,
    live_count: usize,
}

impl<B: DmaBuffer> Ring<B> {
    /// Creates a ring of `capacity` zeroed descriptors with the WRAP marker on the last one.
    pub fn new(capacity: usize, layout: DescriptorLayout) -> Result<Ring<B>, &'static str> {
        if capacity == 0 || capacity > MAX_RING_SIZE {
            return Err("Ring::new(): capacity must be between 1 and MAX_RING_SIZE");
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        let mut ring = Ring {
            layout,
            table: DescriptorTable::new_zeroed(capacity),
            slots,
            head: 0,
            tail: 0,
            live_count: 0,
        };
        ring.init_descriptors();
        Ok(ring)
    }

    fn init_descriptors(&mut self) {
        for i in 0..self.capacity() {
            let wrap = self.is_last(i);
            self.table.desc_mut(i).init(self.layout, wrap);
        }
    }

    fn is_last(&self, index: usize) -> bool {
        index == self.capacity() - 1
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The number of descriptors currently owned by the hardware.
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.live_count == self.capacity()
    }

    /// The next descriptor to harvest or reclaim.
    pub fn head(&self) -> usize {
        self.head
    }

    /// The next descriptor to post.
    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn layout(&self) -> DescriptorLayout {
        self.layout
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    /// Installs an empty receive buffer at `tail` and hands it to the hardware.
    pub fn post_rx(&mut self, buffer: B) -> Result<(), RingFull<B>> {
        if self.is_full() {
            return Err(RingFull(buffer));
        }
        let index = self.tail;
        let offered = buffer.capacity().min(DESC_LENGTH_MAX);
        let wrap = self.is_last(index);
        self.table.desc_mut(index).arm_rx(self.layout, buffer.bus_address(), offered, wrap);
        self.slots[index] = Some(Slot { buffer, armed_length: offered });
        self.tail = self.next(index);
        self.live_count += 1;
        Ok(())
    }

    /// Takes the buffer at `head` back from the hardware if it has completed a receive.
    ///
    /// Returns `Ok(None)`, without side effects, if the hardware still owns it.
    pub fn harvest_rx(&mut self) -> Result<Option<(B, RxStatus)>, RingDesync> {
        if !self.head_completed()? {
            return Ok(None);
        }
        let index = self.head;
        let status = self.table.desc(index).rx_status(self.layout);
        let armed = self.slots[index].as_ref().map(|slot| slot.armed_length);
        if armed.map_or(false, |offered| status.length > offered) {
            return Err(self.desync(index, DesyncReason::LengthOverrun));
        }
        let slot = self.take_head()?;
        Ok(Some((slot.buffer, status)))
    }

    /// Hands `length` bytes of `buffer` to the hardware for transmission.
    ///
    /// `length` must not exceed the buffer's capacity nor the descriptor's length field.
    pub fn post_tx(&mut self, buffer: B, length: u16, sop: bool, eop: bool) -> Result<(), RingFull<B>> {
        if self.is_full() {
            return Err(RingFull(buffer));
        }
        let index = self.tail;
        self.arm_tx_at(index, buffer, length, sop, eop);
        self.tail = self.next(index);
        self.live_count += 1;
        Ok(())
    }

    /// Posts the fragments of one packet, in order, so that the hardware
    /// cannot start on the first fragment before the last one is armed.
    ///
    /// Either all fragments are posted or none are.
    pub fn post_tx_packet(&mut self, fragments: Vec<(B, u16)>) -> Result<(), RingFull<Vec<(B, u16)>>> {
        let count = fragments.len();
        if count == 0 {
            return Ok(());
        }
        if count > self.free_count() {
            return Err(RingFull(fragments));
        }
        let first = self.tail;
        let mut first_fragment = None;
        let mut index = first;
        for (i, (buffer, length)) in fragments.into_iter().enumerate() {
            if i == 0 {
                first_fragment = Some((buffer, length));
            } else {
                self.arm_tx_at(index, buffer, length, false, i == count - 1);
            }
            index = self.next(index);
        }
        if let Some((buffer, length)) = first_fragment {
            self.arm_tx_at(first, buffer, length, true, count == 1);
        }
        self.tail = index;
        self.live_count += count;
        Ok(())
    }

    fn arm_tx_at(&mut self, index: usize, buffer: B, length: u16, sop: bool, eop: bool) {
        let limit = buffer.capacity().min(DESC_LENGTH_MAX);
        let length = if length > limit {
            error!("Ring::post_tx(): length {} exceeds buffer limit {}, truncating", length, limit);
            limit
        } else {
            length
        };
        let wrap = self.is_last(index);
        self.table.desc_mut(index).arm_tx(self.layout, buffer.bus_address(), length, sop, eop, wrap);
        self.slots[index] = Some(Slot { buffer, armed_length: length });
    }

    /// Takes the buffer at `head` back from the hardware if it has been transmitted.
    pub fn reclaim_tx(&mut self) -> Result<Option<B>, RingDesync> {
        if !self.head_completed()? {
            return Ok(None);
        }
        let slot = self.take_head()?;
        Ok(Some(slot.buffer))
    }

    /// Returns whether the descriptor at `head` has been given back by the hardware.
    fn head_completed(&self) -> Result<bool, RingDesync> {
        let owned = self.table.desc(self.head).owned_by_hardware();
        if self.live_count == 0 {
            return if owned {
                Err(self.desync(self.head, DesyncReason::OwnedWhileIdle))
            } else {
                Ok(false)
            };
        }
        Ok(!owned)
    }

    fn take_head(&mut self) -> Result<Slot<B>, RingDesync> {
        let index = self.head;
        let slot = match self.slots[index].take() {
            Some(slot) => slot,
            None => return Err(self.desync(index, DesyncReason::MissingBuffer)),
        };
        let wrap = self.is_last(index);
        self.table.desc_mut(index).init(self.layout, wrap);
        self.head = self.next(index);
        self.live_count -= 1;
        Ok(slot)
    }

    fn desync(&self, index: usize, reason: DesyncReason) -> RingDesync {
        error!("Ring: {} (head {}, tail {}, live {}, capacity {}), descriptor: {:?}",
            reason, self.head, self.tail, self.live_count, self.capacity(), self.table.desc(index));
        RingDesync { index, reason }
    }

    /// Checks every descriptor and slot against the ring's bookkeeping.
    pub fn verify(&self) -> Result<(), RingDesync> {
        for i in 0..self.capacity() {
            let offset = (i + self.capacity() - self.head) % self.capacity();
            let live = offset < self.live_count;
            let desc = self.table.desc(i);
            if desc.is_wrap(self.layout) != self.is_last(i) {
                return Err(self.desync(i, DesyncReason::WrapMisplaced));
            }
            match (live, self.slots[i].is_some()) {
                (true, false) => return Err(self.desync(i, DesyncReason::MissingBuffer)),
                (false, true) => return Err(self.desync(i, DesyncReason::StrayBuffer)),
                _ => { }
            }
            if !live && desc.owned_by_hardware() {
                return Err(self.desync(i, DesyncReason::OwnedWhileIdle));
            }
        }
        Ok(())
    }

    /// Takes every buffer out of the ring, whether or not the hardware is done with it,
    /// and returns the ring to its freshly created state.
    ///
    /// Only call this once the hardware has stopped walking the ring.
    /// Returns the number of buffers moved into `released`.
    pub fn force_release(&mut self, released: &mut Vec<B>) -> usize {
        let mut count = 0;
        for slot in self.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                released.push(slot.buffer);
                count += 1;
            }
        }
        self.init_descriptors();
        self.head = 0;
        self.tail = 0;
        self.live_count = 0;
        count
    }

    /// Re-zeroes the descriptor table and cursors of a ring that holds no buffers.
    pub fn reset(&mut self) -> Result<(), &'static str> {
        if self.slots.iter().any(Option::is_some) {
            return Err("Ring::reset(): ring still holds buffers");
        }
        self.init_descriptors();
        self.head = 0;
        self.tail = 0;
        self.live_count = 0;
        Ok(())
    }
}

impl<B: DmaBuffer> fmt::Debug for Ring<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("live_count", &self.live_count)
            .finish()
    }
}
