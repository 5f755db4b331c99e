//! Access to the memory-mapped register regions.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use spin::Mutex;
use volatile::Volatile;
use crate::{Region, RegLoc};

/// A region of 32-bit registers.
///
/// Implementations are shared between interrupt context and caller context,
/// so both accessors take `&self`.
pub trait RegisterBlock: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

impl<R: RegisterBlock + ?Sized> RegisterBlock for Arc<R> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}


/// A mapped MMIO region of real hardware registers.
pub struct MmioRegion {
    base: usize,
    len: usize,
}

// The region is only ever accessed through volatile 32-bit loads and stores.
unsafe impl Send for MmioRegion { }
unsafe impl Sync for MmioRegion { }

impl MmioRegion {
    /// Wraps an already-mapped register region of `len` bytes starting at virtual address `base`.
    ///
    /// # Safety
    /// The range must be mapped as device memory for as long as the returned value lives,
    /// and must not be accessed through any other `MmioRegion`.
    pub unsafe fn new(base: usize, len: usize) -> MmioRegion {
        MmioRegion { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn register(&self, offset: usize) -> Option<*mut Volatile<u32>> {
        if offset % 4 != 0 || offset + 4 > self.len {
            return None;
        }
        Some((self.base + offset) as *mut Volatile<u32>)
    }
}

impl RegisterBlock for MmioRegion {
    fn read32(&self, offset: usize) -> u32 {
        match self.register(offset) {
            Some(reg) => unsafe { (*reg).read() },
            None => {
                error!("MmioRegion: read of invalid register offset {:#X} (region length {:#X})", offset, self.len);
                0
            }
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        match self.register(offset) {
            Some(reg) => unsafe { (*reg).write(value) },
            None => error!("MmioRegion: write of invalid register offset {:#X} (region length {:#X})", offset, self.len),
        }
    }
}

impl fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MmioRegion {{ base: {:#X}, len: {:#X} }}", self.base, self.len)
    }
}


/// A register region backed by ordinary memory, standing in for hardware.
///
/// Registers read as zero until written. Registers marked with
/// [`RamRegisters::set_write_one_to_clear()`] behave like interrupt status
/// registers: writing a 1 bit clears it. Every store made through
/// [`RegisterBlock::write32()`] is also recorded so that its order can be inspected.
#[derive(Default)]
pub struct RamRegisters {
    inner: Mutex<RamState>,
}

#[derive(Default)]
struct RamState {
    values: BTreeMap<usize, u32>,
    write_one_to_clear: Vec<usize>,
    writes: Vec<(usize, u32)>,
}

impl RamRegisters {
    pub fn new() -> RamRegisters {
        RamRegisters::default()
    }

    /// Makes the register at `offset` clear the bits that are written to it.
    pub fn set_write_one_to_clear(&self, offset: usize) {
        self.inner.lock().write_one_to_clear.push(offset);
    }

    /// Returns the current value of a register without recording an access.
    pub fn get(&self, offset: usize) -> u32 {
        self.inner.lock().values.get(&offset).copied().unwrap_or(0)
    }

    /// Sets a register as the hardware would, without recording a write.
    pub fn set(&self, offset: usize, value: u32) {
        self.inner.lock().values.insert(offset, value);
    }

    /// All recorded writes, oldest first.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.inner.lock().writes.clone()
    }

    /// The values written to one register, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.inner.lock().writes.iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }
}

impl RegisterBlock for RamRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.inner.lock();
        state.writes.push((offset, value));
        if state.write_one_to_clear.contains(&offset) {
            let current = state.values.get(&offset).copied().unwrap_or(0);
            state.values.insert(offset, current & !value);
        } else {
            state.values.insert(offset, value);
        }
    }
}


/// The register regions of one DMA controller, shared by the engine and all of its channels.
///
/// Read-modify-write sequences on registers that several channels share
/// (e.g., the global config register) go through [`SharedRegisters::modify()`],
/// which serializes them.
pub struct SharedRegisters<R: RegisterBlock> {
    dma: R,
    dmac: R,
    dmas: Option<R>,
    rmw_lock: Mutex<()>,
}

impl<R: RegisterBlock> SharedRegisters<R> {
    pub fn new(dma: R, dmac: R, dmas: Option<R>) -> SharedRegisters<R> {
        SharedRegisters { dma, dmac, dmas, rmw_lock: Mutex::new(()) }
    }

    pub fn region(&self, region: Region) -> Option<&R> {
        match region {
            Region::Dma  => Some(&self.dma),
            Region::Dmac => Some(&self.dmac),
            Region::Dmas => self.dmas.as_ref(),
        }
    }

    pub fn has_region(&self, region: Region) -> bool {
        self.region(region).is_some()
    }

    pub fn read(&self, loc: RegLoc) -> u32 {
        match self.region(loc.region) {
            Some(block) => block.read32(loc.offset),
            None => {
                error!("read of register {:?} in a region that is not mapped", loc);
                0
            }
        }
    }

    pub fn write(&self, loc: RegLoc, value: u32) {
        match self.region(loc.region) {
            Some(block) => block.write32(loc.offset, value),
            None => error!("write of {:#X} to register {:?} in a region that is not mapped", value, loc),
        }
    }

    /// Atomically (with respect to other callers of this function) updates a register.
    pub fn modify<F: FnOnce(u32) -> u32>(&self, loc: RegLoc, f: F) {
        let _guard = self.rmw_lock.lock();
        let value = self.read(loc);
        self.write(loc, f(value));
    }
}
