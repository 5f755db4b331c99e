//! The interfaces through which the DMA engine hands off received packets and asks for time.

use alloc::collections::VecDeque;

/// Receives the frames a channel has harvested.
///
/// Called outside of any ring lock, from whichever context harvested the frames.
pub trait PacketSink<B> {
    fn deliver(&mut self, channel: usize, buffer: B, length: u16);
}

impl<B, F: FnMut(usize, B, u16)> PacketSink<B> for F {
    fn deliver(&mut self, channel: usize, buffer: B, length: u16) {
        self(channel, buffer, length)
    }
}

/// A received frame waiting to be consumed by a higher layer.
pub struct ReceivedPacket<B> {
    pub channel: usize,
    pub buffer: B,
    /// The number of valid bytes at the start of `buffer`.
    pub length: u16,
}

/// Newly received frames are pushed onto the back of the queue.
impl<B> PacketSink<B> for VecDeque<ReceivedPacket<B>> {
    fn deliver(&mut self, channel: usize, buffer: B, length: u16) {
        self.push_back(ReceivedPacket { channel, buffer, length });
    }
}

/// The time source of the DMA engine.
pub trait Timer: Send + Sync {
    /// Busy-waits for `us` microseconds.
    fn delay_us(&self, us: u32);

    /// Arranges for `DmaEngine::retry_refill(channel)` to be called once, `after_ms` from now.
    /// Must not block or call back synchronously.
    fn schedule_refill(&self, channel: usize, after_ms: u32);
}
