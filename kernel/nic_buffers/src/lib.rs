//! Defines buffers that are used to send and receive packets,
//! and the allocator interface that DMA rings draw them from.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate mpmc;


use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use alloc::{boxed::Box, vec};

/// A buffer that a DMA engine can read from or write into.
///
/// The ring that holds a buffer only needs to know where the device sees it
/// and how many bytes it may write into it.
pub trait DmaBuffer: Send {
    /// The address at which the DMA engine accesses this buffer.
    fn bus_address(&self) -> u32;

    /// The number of bytes this buffer can hold.
    fn capacity(&self) -> u16;
}

/// The source of packet buffers for a DMA engine.
pub trait BufferAllocator: Send + Sync {
    type Buffer: DmaBuffer;

    /// Returns a buffer of at least `size` bytes, or `None` if none is available right now.
    /// Must not block.
    fn allocate(&self, size: u16) -> Option<Self::Buffer>;

    /// Takes back a buffer that is no longer in use.
    fn release(&self, buffer: Self::Buffer);

    /// Translates the host address of device-visible memory (e.g., a descriptor table)
    /// into the address the DMA engine must be given.
    fn bus_address_of(&self, host_address: usize) -> Option<u32>;
}


/// A buffer that stores a packet (or one fragment of it) and is contiguous in bus address space.
/// Auto-dereferences into a byte slice that covers its current length.
pub struct PacketBuffer {
    data: Box<[u8]>,
    bus_addr: u32,
    length: u16,
}

impl PacketBuffer {
    /// Wraps the given memory, which the device sees at `bus_addr`.
    /// The length starts out equal to the capacity.
    pub fn new(data: Box<[u8]>, bus_addr: u32) -> Result<PacketBuffer, &'static str> {
        let length = u16::try_from(data.len())
            .map_err(|_| "PacketBuffer::new(): buffers larger than 64 KiB are not supported")?;
        Ok(PacketBuffer { data, bus_addr, length })
    }

    pub fn bus_addr(&self) -> u32 {
        self.bus_addr
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if usize::from(length) > self.data.len() {
            Err("PacketBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl DmaBuffer for PacketBuffer {
    fn bus_address(&self) -> u32 {
        self.bus_addr
    }

    fn capacity(&self) -> u16 {
        // checked in `new()`
        self.data.len() as u16
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[..usize::from(self.length)]
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..usize::from(self.length)]
    }
}


/// Treats host addresses as bus addresses, if they fit in 32 bits.
pub fn identity_bus_address(host_address: usize) -> Option<u32> {
    u32::try_from(host_address).ok()
}

/// Strips the MIPS KSEG0/KSEG1 segment bits off a host address, as on the BCM63xx SoCs.
pub fn kseg_bus_address(host_address: usize) -> Option<u32> {
    Some((host_address & 0x1fff_ffff) as u32)
}


/// A fixed set of equally sized packet buffers.
///
/// Buffer `i` is placed at bus address `bus_base + i * buffer_size`.
/// Allocation and release never block, so the pool can be used from interrupt context.
pub struct BufferPool {
    buffers: mpmc::Queue<PacketBuffer>,
    buffer_size: u16,
    total: usize,
    available: AtomicUsize,
    translate: fn(usize) -> Option<u32>,
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `buffer_size` bytes each.
    ///
    /// # Arguments
    /// * `count`: number of buffers initially added to the pool
    /// * `buffer_size`: size of each buffer in bytes
    /// * `bus_base`: the bus address of the first buffer
    pub fn new(count: usize, buffer_size: u16, bus_base: u32) -> Result<BufferPool, &'static str> {
        if count == 0 || buffer_size == 0 {
            return Err("BufferPool::new(): count and buffer size must be non-zero");
        }
        let span = (count as u64) * (buffer_size as u64);
        if (bus_base as u64) + span > (u32::MAX as u64) + 1 {
            return Err("BufferPool::new(): buffers would extend beyond the 32-bit bus address space");
        }

        let buffers = mpmc::Queue::with_capacity(count);
        for i in 0..count {
            let bus_addr = bus_base + (i as u32) * (buffer_size as u32);
            let buffer = PacketBuffer::new(vec![0u8; buffer_size as usize].into_boxed_slice(), bus_addr)?;
            if buffers.push(buffer).is_err() {
                error!("BufferPool::new(): pool is full, cannot add buffer {}!", i);
                return Err("BufferPool::new(): pool is full");
            }
        }
        Ok(BufferPool {
            buffers,
            buffer_size,
            total: count,
            available: AtomicUsize::new(count),
            translate: identity_bus_address,
        })
    }

    /// Replaces the function used by [`BufferAllocator::bus_address_of()`].
    pub fn with_address_translation(mut self, translate: fn(usize) -> Option<u32>) -> BufferPool {
        self.translate = translate;
        self
    }

    pub fn buffer_size(&self) -> u16 {
        self.buffer_size
    }

    /// The number of buffers this pool was created with.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The number of buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }
}

impl BufferAllocator for BufferPool {
    type Buffer = PacketBuffer;

    fn allocate(&self, size: u16) -> Option<PacketBuffer> {
        if size > self.buffer_size {
            warn!("BufferPool: requested {} bytes, but buffers are only {} bytes", size, self.buffer_size);
            return None;
        }
        let mut buffer = self.buffers.pop()?;
        self.available.fetch_sub(1, Ordering::AcqRel);
        buffer.length = buffer.capacity();
        Some(buffer)
    }

    fn release(&self, buffer: PacketBuffer) {
        match self.buffers.push(buffer) {
            Ok(()) => { self.available.fetch_add(1, Ordering::AcqRel); }
            Err(_e) => error!("BufferPool: couldn't return released buffer to pool, bus_addr: {:#X}", _e.bus_addr),
        }
    }

    fn bus_address_of(&self, host_address: usize) -> Option<u32> {
        (self.translate)(host_address)
    }
}
