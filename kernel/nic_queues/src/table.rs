//! The block of descriptors that the DMA engine walks.

use alloc::boxed::Box;
use core::ptr::NonNull;
use iudma_descriptors::Descriptor;
use zerocopy::{AsBytes, FromBytes};

/// A zero-initialized, contiguous array of descriptors shared with the DMA engine.
///
/// The table is held through a raw pointer rather than a `Box`
/// because the device writes into it behind the compiler's back.
pub struct DescriptorTable {
    descs: NonNull<[Descriptor]>,
}

// The table is only reached through its owning ring, which is itself behind a lock.
unsafe impl Send for DescriptorTable { }

impl DescriptorTable {
    pub(crate) fn new_zeroed(len: usize) -> DescriptorTable {
        let boxed: Box<[Descriptor]> = Descriptor::new_box_slice_zeroed(len);
        DescriptorTable { descs: NonNull::from(Box::leak(boxed)) }
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// The host address of the first descriptor, used to program the ring start register.
    pub fn host_address(&self) -> usize {
        self.descs.as_ptr() as *mut Descriptor as usize
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * core::mem::size_of::<Descriptor>()
    }

    pub fn get(&self, index: usize) -> Option<&Descriptor> {
        if index < self.len() {
            Some(unsafe { &*(self.descs.as_ptr() as *mut Descriptor).add(index) })
        } else {
            None
        }
    }

    pub(crate) fn desc(&self, index: usize) -> &Descriptor {
        debug_assert!(index < self.len());
        unsafe { &*(self.descs.as_ptr() as *mut Descriptor).add(index % self.len()) }
    }

    pub(crate) fn desc_mut(&mut self, index: usize) -> &mut Descriptor {
        debug_assert!(index < self.len());
        unsafe { &mut *(self.descs.as_ptr() as *mut Descriptor).add(index % self.len()) }
    }

    /// The raw bytes of the table, exactly as the DMA engine sees them.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { self.descs.as_ref() }.as_bytes()
    }
}

impl Drop for DescriptorTable {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.descs.as_ptr()) });
    }
}
