//! The iuDMA packet engine of the Broadcom BCM63xx Ethernet MAC and Ethernet switch blocks.
//!
//! A [`DmaEngine`] owns the controller's registers and up to
//! `num_hw_channels / 2` [`Channel`]s. Each channel drives a receive ring and a
//! transmit ring of descriptors shared with the hardware:
//! * Receive: the channel keeps the ring topped up with buffers from the
//!   [`BufferAllocator`], harvests completed frames and hands them to a [`PacketSink`].
//! * Transmit: callers post filled buffers, which go back to the allocator
//!   once the hardware has sent them.
//!
//! The engine does not run on its own. The interrupt handler reads the cause with
//! [`DmaEngine::read_global_cause()`] and passes it to [`DmaEngine::dispatch()`];
//! a [`Timer`] provides busy-wait delays and deferred refill retries.
//!
//! Everything chip-specific lives in the [`Geometry`] given at creation.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate iudma_descriptors;
extern crate iudma_regs;
extern crate nic_buffers;
extern crate nic_queues;

mod channel;
mod collaborators;
mod config;
mod engine;
mod error;
mod flow;
mod stats;

pub use channel::*;
pub use collaborators::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use flow::*;
pub use stats::{ChannelStats, StatsSnapshot};

pub use iudma_regs::{Geometry, MmioRegion, RegisterBlock, BCM6345, BCM6348, BCM6368};
pub use nic_buffers::{BufferAllocator, DmaBuffer};

use alloc::sync::Arc;

/// Creates a DMA engine for the chip whose registers are in `regions`.
pub fn create_engine<R, A, T>(
    regions: DmaRegions<R>,
    geometry: Geometry,
    allocator: Arc<A>,
    timer: Arc<T>,
    config: EngineConfig,
) -> Result<DmaEngine<R, A, T>, DmaError>
    where R: RegisterBlock, A: BufferAllocator, T: Timer
{
    DmaEngine::new(regions, geometry, allocator, timer, config)
}

/// Disables every channel of `engine`, releases all of their buffers and stops the controller.
/// Frames that complete while the channels drain are handed to `sink`.
pub fn teardown_engine<R, A, T, S>(engine: DmaEngine<R, A, T>, sink: &mut S) -> Result<(), DmaError>
    where R: RegisterBlock, A: BufferAllocator, T: Timer, S: PacketSink<Buf<A>>
{
    engine.teardown(sink)
}
