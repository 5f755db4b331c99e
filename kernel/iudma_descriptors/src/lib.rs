//! The descriptor format used by the iuDMA engine found in BCM63xx ENET blocks.
//!
//! A descriptor is two little-endian 32-bit words that both the host and the DMA engine
//! read and write directly:
//! * `len_stat`: the buffer length (bits 16..28), the ownership bit (bit 15),
//!   the packet/ring markers and the receive status bits.
//! * `address`: the bus address of the buffer that this descriptor points to.
//!
//! The oldest hardware (BCM6345) places the EOP, SOP and WRAP markers 3 bits lower
//! than the later chips; this is captured by a [`DescriptorLayout`], which is derived
//! once from the register geometry and then passed to every descriptor accessor.
//! The ownership bit is never shifted.

#![no_std]

#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate zerocopy;


use core::{fmt, ops::Range, ptr};
use core::sync::atomic::{fence, Ordering};
use bit_field::BitField;
use zerocopy::{AsBytes, FromBytes};

/// The bit range of the length field within `len_stat`.
pub const DESC_LENGTH_BITS:             Range<usize> = 16..28;
/// The largest length the 12-bit length field can express.
pub const DESC_LENGTH_MAX:              u16 = 0xfff;
pub const DESC_LENGTH_MASK:             u32 = (DESC_LENGTH_MAX as u32) << 16;

/// Set by the host to hand a descriptor to the DMA engine,
/// cleared by the engine when it is done with it.
pub const DESC_OWNER:                   u32 = 1 << 15;
/// End of packet (unshifted position).
pub const DESC_EOP:                     u32 = 1 << 14;
/// Start of packet (unshifted position).
pub const DESC_SOP:                     u32 = 1 << 13;
/// Both packet markers, used by single-descriptor packets.
pub const DESC_ESOP:                    u32 = DESC_EOP | DESC_SOP;
/// Last descriptor of the ring (unshifted position).
pub const DESC_WRAP:                    u32 = 1 << 12;

/// Tx: the MAC appends the frame check sequence.
pub const DESC_APPEND_CRC:              u32 = 1 << 8;

/// Rx status: FIFO underrun.
pub const DESC_RX_UNDERRUN:             u32 = 1 << 9;
/// Rx status: frame longer than the maximum receive length.
pub const DESC_RX_OVERSIZE:             u32 = 1 << 4;
/// Rx status: receive error signalled by the PHY.
pub const DESC_RX_ERROR:                u32 = 1 << 2;
/// Rx status: CRC error.
pub const DESC_RX_CRC:                  u32 = 1 << 1;
/// Rx status: FIFO overflow.
pub const DESC_RX_OVERFLOW:             u32 = 1 << 0;
/// All receive status bits that mean the frame must not be delivered.
pub const DESC_RX_ERRORS:               u32 = DESC_RX_UNDERRUN | DESC_RX_OVERSIZE | DESC_RX_ERROR | DESC_RX_CRC | DESC_RX_OVERFLOW;


/// Where the shiftable descriptor flags live on a given hardware variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorLayout {
    shift: u32,
}

impl DescriptorLayout {
    /// The layout of every variant except the BCM6345.
    pub const STANDARD: DescriptorLayout = DescriptorLayout { shift: 0 };

    /// Creates a layout whose EOP, SOP and WRAP bits are shifted down by `shift` bits.
    ///
    /// Returns `None` if the shifted flags would collide with the ownership bit
    /// or fall off the end of the word.
    pub const fn new(shift: u32) -> Option<DescriptorLayout> {
        if shift > 12 {
            None
        } else {
            Some(DescriptorLayout { shift })
        }
    }

    pub const fn shift(&self) -> u32 {
        self.shift
    }

    pub const fn eop(&self) -> u32 {
        DESC_EOP >> self.shift
    }

    pub const fn sop(&self) -> u32 {
        DESC_SOP >> self.shift
    }

    pub const fn esop(&self) -> u32 {
        DESC_ESOP >> self.shift
    }

    pub const fn wrap(&self) -> u32 {
        DESC_WRAP >> self.shift
    }

    /// The receive error bits, excluding any bit that the shifted markers occupy.
    /// On the BCM6345 the shifted WRAP bit lands on the underrun position.
    pub const fn rx_error_mask(&self) -> u32 {
        DESC_RX_ERRORS & !(self.esop() | self.wrap())
    }
}

impl Default for DescriptorLayout {
    fn default() -> Self {
        DescriptorLayout::STANDARD
    }
}


/// Builds a `len_stat` word from a length and a set of flag bits.
/// Lengths above [`DESC_LENGTH_MAX`] are truncated to the field width.
pub fn len_stat_word(length: u16, flags: u32) -> u32 {
    let mut word = flags & !DESC_LENGTH_MASK;
    word.set_bits(DESC_LENGTH_BITS, (length & DESC_LENGTH_MAX) as u32);
    word
}


/// One iuDMA buffer descriptor, exactly as the DMA engine reads it from memory.
///
/// All accesses are volatile because the engine may write the descriptor
/// at any time while it owns it.
#[derive(FromBytes, AsBytes)]
#[repr(C)]
pub struct Descriptor {
    len_stat: u32,
    address:  u32,
}

const_assert_eq!(core::mem::size_of::<Descriptor>(), 8);
const_assert_eq!(core::mem::align_of::<Descriptor>(), 4);

impl Descriptor {
    pub fn len_stat(&self) -> u32 {
        unsafe { ptr::read_volatile(&self.len_stat) }
    }

    pub fn set_len_stat(&mut self, value: u32) {
        unsafe { ptr::write_volatile(&mut self.len_stat, value) }
    }

    pub fn address(&self) -> u32 {
        unsafe { ptr::read_volatile(&self.address) }
    }

    pub fn set_address(&mut self, value: u32) {
        unsafe { ptr::write_volatile(&mut self.address, value) }
    }

    /// Returns true while the DMA engine owns this descriptor.
    pub fn owned_by_hardware(&self) -> bool {
        self.len_stat() & DESC_OWNER == DESC_OWNER
    }

    /// The raw value of the length field.
    ///
    /// Its meaning depends on who wrote it last: the capacity offered (rx post),
    /// the bytes to send (tx post) or the bytes received (rx completion).
    pub fn length(&self) -> u16 {
        self.len_stat().get_bits(DESC_LENGTH_BITS) as u16
    }

    /// Returns true if this descriptor carries the ring's WRAP marker.
    pub fn is_wrap(&self, layout: DescriptorLayout) -> bool {
        self.len_stat() & layout.wrap() != 0
    }

    /// Resets the descriptor to its idle, host-owned state.
    /// Only the WRAP marker survives, if `wrap` is set.
    pub fn init(&mut self, layout: DescriptorLayout, wrap: bool) {
        self.set_address(0);
        self.set_len_stat(if wrap { layout.wrap() } else { 0 });
    }

    /// Hands an empty receive buffer of `capacity` bytes to the DMA engine.
    ///
    /// The address is written before the ownership bit so the engine
    /// never sees an owned descriptor that points at a stale buffer.
    pub fn arm_rx(&mut self, layout: DescriptorLayout, buffer_address: u32, capacity: u16, wrap: bool) {
        self.set_address(buffer_address);
        fence(Ordering::Release);
        let mut flags = DESC_OWNER;
        if wrap {
            flags |= layout.wrap();
        }
        self.set_len_stat(len_stat_word(capacity, flags));
    }

    /// Hands `length` bytes of a transmit buffer to the DMA engine.
    pub fn arm_tx(&mut self, layout: DescriptorLayout, buffer_address: u32, length: u16, sop: bool, eop: bool, wrap: bool) {
        self.set_address(buffer_address);
        fence(Ordering::Release);
        let mut flags = DESC_OWNER | DESC_APPEND_CRC;
        if sop {
            flags |= layout.sop();
        }
        if eop {
            flags |= layout.eop();
        }
        if wrap {
            flags |= layout.wrap();
        }
        self.set_len_stat(len_stat_word(length, flags));
    }

    /// Decodes the status the DMA engine wrote back when it completed a receive.
    pub fn rx_status(&self, layout: DescriptorLayout) -> RxStatus {
        // pairs with the engine's write of the ownership bit
        fence(Ordering::Acquire);
        let word = self.len_stat();
        RxStatus {
            length: word.get_bits(DESC_LENGTH_BITS) as u16,
            sop:    word & layout.sop() != 0,
            eop:    word & layout.eop() != 0,
            errors: word & layout.rx_error_mask(),
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{len_stat: {:#010X}, address: {:#010X}, length: {}, owner: {}}}",
            self.len_stat(), self.address(), self.length(), self.owned_by_hardware())
    }
}


/// What the DMA engine reported about a completed receive descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxStatus {
    /// Bytes received into the buffer, including the frame check sequence.
    pub length: u16,
    pub sop: bool,
    pub eop: bool,
    /// The receive error bits that were set, see [`DESC_RX_ERRORS`].
    pub errors: u32,
}

impl RxStatus {
    pub fn has_errors(&self) -> bool {
        self.errors != 0
    }

    /// Returns true if the whole frame fit into this one descriptor.
    pub fn is_whole_frame(&self) -> bool {
        self.sop && self.eop
    }
}
