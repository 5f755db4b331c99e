//! Register definitions for the iuDMA controller found in BCM63xx Ethernet blocks.
//!
//! The controller is reached through up to three memory-mapped regions:
//! * `Dma`: the shared region holding the global config, flow-control thresholds,
//!   buffer-allocation counters and (on newer chips) the global interrupt registers.
//! * `Dmac`: one fixed-width block of control registers per hardware channel.
//! * `Dmas`: one block of on-chip SRAM state words per hardware channel (absent on the BCM6345).
//!
//! Which registers exist, and where, differs per chip family.
//! That is captured once in a [`Geometry`] value; nothing else in the driver
//! needs to know which chip it runs on.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate volatile;
extern crate iudma_descriptors;

mod geometry;
mod block;

pub use geometry::*;
pub use block::*;


/// Global config register: enables the whole DMA controller.
pub const DMA_CFG_EN:                   u32 = 1 << 0;

/// The bit in the global config register that enables flow control for hardware channel `hw_chan`.
pub const fn dma_cfg_flowc_enable(hw_chan: usize) -> u32 {
    1 << ((hw_chan >> 1) + 1)
}

/// BUFALLOC register: forces the allocation count instead of adding to it.
pub const DMA_BUFALLOC_FORCE:           u32 = 1 << 31;

/// Channel config: enable the channel / start fetching descriptors.
pub const CHANCFG_EN:                   u32 = 1 << 0;
/// Channel config (BCM6345): follow the descriptor chain.
pub const CHANCFG_CHAINING:             u32 = 1 << 2;
/// Channel config (BCM6345): honour the WRAP descriptor marker.
pub const CHANCFG_WRAP_EN:              u32 = 1 << 3;
/// Channel config (BCM6345): enable flow control on this channel.
pub const CHANCFG_FLOWC_EN:             u32 = 1 << 4;

/// Channel interrupt: a buffer (descriptor) was completed.
pub const IR_BUFDONE:                   u32 = 1 << 0;
/// Channel interrupt: a whole packet was completed.
pub const IR_PKTDONE:                   u32 = 1 << 1;
/// Channel interrupt: the channel reached a descriptor it does not own.
pub const IR_NOTOWNER:                  u32 = 1 << 2;
/// Every cause bit a channel can raise.
pub const IR_ALL:                       u32 = IR_BUFDONE | IR_PKTDONE | IR_NOTOWNER;
