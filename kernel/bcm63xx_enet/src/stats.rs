//! Per-channel counters.

use core::ops::AddAssign;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Counters updated by a channel as it runs. Readers get a [`StatsSnapshot`].
#[derive(Default)]
pub struct ChannelStats {
    pub(crate) rx_packets: AtomicUsize,
    pub(crate) rx_bytes: AtomicUsize,
    pub(crate) tx_packets: AtomicUsize,
    pub(crate) tx_bytes: AtomicUsize,
    pub(crate) rx_errors: AtomicUsize,
    pub(crate) rx_dropped: AtomicUsize,
    pub(crate) desync_events: AtomicUsize,
    pub(crate) alloc_failures: AtomicUsize,
    pub(crate) forced_reclaims: AtomicUsize,
    pub(crate) refill_retries: AtomicUsize,
}

pub(crate) fn bump(counter: &AtomicUsize, amount: usize) {
    counter.fetch_add(amount, Ordering::Relaxed);
}

impl ChannelStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed) as u64;
        StatsSnapshot {
            rx_packets: get(&self.rx_packets),
            rx_bytes: get(&self.rx_bytes),
            tx_packets: get(&self.tx_packets),
            tx_bytes: get(&self.tx_bytes),
            rx_errors: get(&self.rx_errors),
            rx_dropped: get(&self.rx_dropped),
            desync_events: get(&self.desync_events),
            alloc_failures: get(&self.alloc_failures),
            forced_reclaims: get(&self.forced_reclaims),
            refill_retries: get(&self.refill_retries),
        }
    }
}

/// A point-in-time copy of a channel's (or a whole engine's) counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Transmit packets and bytes are counted when they are queued to the hardware.
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Received frames the hardware flagged with an error.
    pub rx_errors: u64,
    /// Received frames that did not fit in one buffer.
    pub rx_dropped: u64,
    pub desync_events: u64,
    /// Refills that could not get every buffer they asked for.
    pub alloc_failures: u64,
    /// Buffers taken back from the hardware without it completing them.
    pub forced_reclaims: u64,
    pub refill_retries: u64,
}

impl AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: StatsSnapshot) {
        self.rx_packets += other.rx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_packets += other.tx_packets;
        self.tx_bytes += other.tx_bytes;
        self.rx_errors += other.rx_errors;
        self.rx_dropped += other.rx_dropped;
        self.desync_events += other.desync_events;
        self.alloc_failures += other.alloc_failures;
        self.forced_reclaims += other.forced_reclaims;
        self.refill_retries += other.refill_retries;
    }
}
