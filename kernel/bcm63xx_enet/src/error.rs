use core::fmt;
use nic_queues::RingDesync;

/// Which ring of a channel an event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

/// What revealed that a ring's bookkeeping and the hardware disagree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesyncKind {
    /// The channel raised its "not owner" interrupt:
    /// the hardware reached a descriptor it had not been given.
    NotOwnerInterrupt,
    /// Inspecting the descriptor table turned up an inconsistency.
    Descriptor(RingDesync),
}

impl fmt::Display for DesyncKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DesyncKind::NotOwnerInterrupt => write!(f, "hardware raised a not-owner interrupt"),
            DesyncKind::Descriptor(desync) => write!(f, "{}", desync),
        }
    }
}

/// The errors returned by the DMA engine and its channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaError {
    /// Every descriptor of the ring is owned by the hardware; retry once completions are reclaimed.
    RingFull,
    /// The channel is being disabled and accepts no new work.
    ChannelQuiescing,
    /// The channel is not enabled.
    ChannelInactive,
    /// The buffer allocator had nothing to give; a refill retry has been scheduled.
    BufferAllocationFailed,
    /// The channel's rings no longer match the hardware. The channel must be reset.
    RingDesync {
        channel: usize,
        direction: Direction,
        reason: DesyncKind,
    },
    /// The register geometry is unusable, or doesn't match the regions provided.
    GeometryMismatch(&'static str),
    /// No channel with that id exists, or can exist, on this engine.
    InvalidChannel,
    InvalidConfig(&'static str),
    /// The packet length is zero, longer than its buffer, or longer than a descriptor can describe.
    InvalidLength,
}

impl DmaError {
    /// Returns true if retrying later, without resetting anything, may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DmaError::RingFull | DmaError::ChannelQuiescing | DmaError::BufferAllocationFailed)
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RingFull => write!(f, "ring is full"),
            Self::ChannelQuiescing => write!(f, "channel is quiescing"),
            Self::ChannelInactive => write!(f, "channel is not active"),
            Self::BufferAllocationFailed => write!(f, "buffer allocation failed"),
            Self::RingDesync { channel, direction, reason } =>
                write!(f, "channel {} {:?} ring desynchronized: {}", channel, direction, reason),
            Self::GeometryMismatch(msg) => write!(f, "geometry mismatch: {}", msg),
            Self::InvalidChannel => write!(f, "invalid channel"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::InvalidLength => write!(f, "invalid packet length"),
        }
    }
}

/// A post that was refused, carrying back what was posted.
pub struct Rejected<B> {
    pub error: DmaError,
    pub buffer: B,
}

impl<B> Rejected<B> {
    pub fn new(error: DmaError, buffer: B) -> Rejected<B> {
        Rejected { error, buffer }
    }

    pub fn into_buffer(self) -> B {
        self.buffer
    }
}

impl<B> fmt::Debug for Rejected<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rejected").field("error", &self.error).finish_non_exhaustive()
    }
}

impl<B> fmt::Display for Rejected<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}
