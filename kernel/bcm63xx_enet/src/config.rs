//! Configuration values for the DMA engine and its channels.

use iudma_descriptors::DESC_LENGTH_MAX;
use nic_queues::MAX_RING_SIZE;
use crate::DmaError;

/// The default number of receive descriptors per channel.
pub const DEFAULT_RX_RING_SIZE:         usize = 64;
/// The default number of transmit descriptors per channel.
pub const DEFAULT_TX_RING_SIZE:         usize = 32;
/// The default DMA burst length, in 32-bit words.
pub const DEFAULT_MAX_BURST:            u32 = 16;
/// The default receive buffer size: a VLAN-tagged 1500-byte frame plus FCS, rounded up to the burst size.
pub const DEFAULT_RX_BUFFER_SIZE:       u16 = 1536;
/// The length of the frame check sequence the MAC leaves at the end of received frames.
pub const ETH_FCS_LEN:                  u16 = 4;
/// The buffer count written to a BCM6345 channel's FC register when flow control is on.
pub const DEFAULT_FC_THRESHOLD:         u32 = 5;

/// How long `disable()` waits for in-flight transmissions and for the channel to halt.
pub const DEFAULT_QUIESCE_TIMEOUT_US:   u32 = 1000;
pub const DEFAULT_QUIESCE_POLL_US:      u32 = 1;
/// How long to wait before retrying a receive refill that ran out of buffers.
pub const DEFAULT_REFILL_RETRY_MS:      u32 = 1000;


/// Where the flow-control thresholds sit, as fractions of the receive ring's capacity.
///
/// The hardware pauses fetching once fewer than `low` receive buffers are posted,
/// and resumes once `high` are posted again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowThresholds {
    pub low_numerator: usize,
    pub high_numerator: usize,
    pub denominator: usize,
}

impl FlowThresholds {
    /// Computes the `(low, high)` descriptor counts for a ring of `capacity` descriptors.
    pub fn for_capacity(&self, capacity: usize) -> (usize, usize) {
        (capacity * self.low_numerator / self.denominator,
         capacity * self.high_numerator / self.denominator)
    }

    pub fn validate(&self) -> Result<(), DmaError> {
        if self.denominator == 0 {
            return Err(DmaError::InvalidConfig("flow threshold denominator must be non-zero"));
        }
        if self.low_numerator >= self.high_numerator || self.high_numerator > self.denominator {
            return Err(DmaError::InvalidConfig("flow thresholds must satisfy low < high <= 1"));
        }
        Ok(())
    }
}

impl Default for FlowThresholds {
    /// One third and two thirds of the ring.
    fn default() -> Self {
        FlowThresholds { low_numerator: 1, high_numerator: 2, denominator: 3 }
    }
}


/// The configuration of one channel, fixed when it is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub rx_ring_size: usize,
    pub tx_ring_size: usize,
    /// The size requested from the allocator for each receive buffer.
    pub rx_buffer_size: u16,
    pub max_burst: u32,
    /// Whether to remove the frame check sequence from the length reported for received frames.
    pub strip_fcs: bool,
    /// Whether to use hardware flow control, if the geometry provides it.
    pub flow_control: bool,
    pub flow_thresholds: FlowThresholds,
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), DmaError> {
        if self.rx_ring_size == 0 || self.rx_ring_size > MAX_RING_SIZE {
            return Err(DmaError::InvalidConfig("rx ring size must be between 1 and MAX_RING_SIZE"));
        }
        if self.tx_ring_size == 0 || self.tx_ring_size > MAX_RING_SIZE {
            return Err(DmaError::InvalidConfig("tx ring size must be between 1 and MAX_RING_SIZE"));
        }
        if self.rx_buffer_size <= ETH_FCS_LEN || self.rx_buffer_size > DESC_LENGTH_MAX {
            return Err(DmaError::InvalidConfig("rx buffer size must fit a frame and a descriptor length field"));
        }
        if self.max_burst == 0 {
            return Err(DmaError::InvalidConfig("max burst must be non-zero"));
        }
        if self.flow_control {
            self.flow_thresholds.validate()?;
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            rx_ring_size: DEFAULT_RX_RING_SIZE,
            tx_ring_size: DEFAULT_TX_RING_SIZE,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            max_burst: DEFAULT_MAX_BURST,
            strip_fcs: true,
            flow_control: true,
            flow_thresholds: FlowThresholds::default(),
        }
    }
}


/// Engine-wide timing configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub quiesce_timeout_us: u32,
    pub quiesce_poll_us: u32,
    pub refill_retry_ms: u32,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), DmaError> {
        if self.quiesce_poll_us == 0 {
            return Err(DmaError::InvalidConfig("quiesce poll interval must be non-zero"));
        }
        if self.quiesce_poll_us > self.quiesce_timeout_us {
            return Err(DmaError::InvalidConfig("quiesce poll interval must not exceed the timeout"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            quiesce_timeout_us: DEFAULT_QUIESCE_TIMEOUT_US,
            quiesce_poll_us: DEFAULT_QUIESCE_POLL_US,
            refill_retry_ms: DEFAULT_REFILL_RETRY_MS,
        }
    }
}
