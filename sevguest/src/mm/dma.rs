// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

//! Page granular allocator for memory shared with the hypervisor.
//!
//! A [`DmaRegion`] describes a physically contiguous range of guest memory
//! that the embedding environment has already mapped shared (C-bit clear).
//! Buffers handed out by [`DmaRegion::reserve`] keep their physical address
//! for their whole lifetime and are returned to the region when dropped.

use crate::address::{Address, PhysAddr, VirtAddr};
use crate::error::SevError;
use crate::locking::SpinLock;
use crate::types::{PAGE_SHIFT, PAGE_SIZE};
use crate::utils::pages_for;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaError {
    // Null or unaligned base address, or a size below one page
    InvalidRegion,
    // No contiguous run of free pages large enough
    OutOfMemory,
    // Access outside of a reserved buffer
    OutOfBounds,
}

impl From<DmaError> for SevError {
    fn from(e: DmaError) -> Self {
        Self::Dma(e)
    }
}

#[derive(Debug)]
struct PageBitmap {
    bits: Vec<u64>,
    npages: usize,
}

impl PageBitmap {
    fn new(npages: usize) -> Self {
        Self {
            bits: vec![0; npages.div_ceil(64)],
            npages,
        }
    }

    fn get(&self, page: usize) -> bool {
        self.bits[page / 64] & (1u64 << (page % 64)) != 0
    }

    fn set(&mut self, start: usize, count: usize, value: bool) {
        for page in start..start + count {
            let mask = 1u64 << (page % 64);
            if value {
                self.bits[page / 64] |= mask;
            } else {
                self.bits[page / 64] &= !mask;
            }
        }
    }

    /// First fit search for `count` contiguous free pages.
    fn alloc(&mut self, count: usize) -> Option<usize> {
        let mut start = 0;
        while start + count <= self.npages {
            match (start..start + count).find(|&page| self.get(page)) {
                Some(used) => start = used + 1,
                None => {
                    self.set(start, count, true);
                    return Some(start);
                }
            }
        }
        None
    }

    fn used(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// A physically contiguous range of memory shared with the hypervisor.
#[derive(Debug)]
pub struct DmaRegion {
    vaddr: VirtAddr,
    paddr: PhysAddr,
    size: usize,
    pages: SpinLock<PageBitmap>,
}

impl DmaRegion {
    /// Creates an allocator over `size` bytes mapped at `vaddr`, backed by
    /// guest physical memory starting at `paddr`. Trailing bytes that do not
    /// fill a whole page are never handed out.
    ///
    /// # Safety
    ///
    /// The range must be mapped shared at `vaddr`, physically contiguous
    /// from `paddr`, and must not be used by anything else for the lifetime
    /// of the region.
    pub unsafe fn new(vaddr: VirtAddr, paddr: PhysAddr, size: usize) -> Result<Self, SevError> {
        if vaddr.is_null()
            || !vaddr.is_page_aligned()
            || !paddr.is_page_aligned()
            || size < PAGE_SIZE
        {
            return Err(DmaError::InvalidRegion.into());
        }
        vaddr
            .checked_add(size)
            .ok_or(SevError::Dma(DmaError::InvalidRegion))?;

        let npages = size >> PAGE_SHIFT;
        log::debug!(
            "DMA region: {} pages at {:#x} (phys {:#x})",
            npages,
            vaddr,
            paddr
        );
        Ok(Self {
            vaddr,
            paddr,
            size: npages << PAGE_SHIFT,
            pages: SpinLock::new(PageBitmap::new(npages)),
        })
    }

    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of pages currently handed out.
    pub fn used_pages(&self) -> usize {
        self.pages.lock().used()
    }

    /// Reserves a zeroed, page aligned buffer of at least `len` bytes.
    pub fn reserve(&self, len: usize) -> Result<DmaBuffer<'_>, SevError> {
        let count = pages_for(len);
        let first = self
            .pages
            .lock()
            .alloc(count)
            .ok_or(SevError::Dma(DmaError::OutOfMemory))?;

        let buffer = DmaBuffer {
            region: self,
            first,
            count,
            len,
        };
        // SAFETY: the pages were just reserved for this buffer, so nothing
        // else can be accessing them.
        unsafe {
            ptr::write_bytes(buffer.vaddr().as_mut_ptr::<u8>(), 0, count << PAGE_SHIFT);
        }
        Ok(buffer)
    }

    fn release(&self, first: usize, count: usize) {
        self.pages.lock().set(first, count, false);
    }
}

/// Shared buffer reserved from a [`DmaRegion`], released on drop.
#[derive(Debug)]
pub struct DmaBuffer<'a> {
    region: &'a DmaRegion,
    first: usize,
    count: usize,
    len: usize,
}

impl DmaBuffer<'_> {
    pub fn vaddr(&self) -> VirtAddr {
        self.region.vaddr + (self.first << PAGE_SHIFT)
    }

    pub fn paddr(&self) -> PhysAddr {
        self.region.paddr + (self.first << PAGE_SHIFT)
    }

    /// Requested length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the reservation, always a multiple of the page size.
    pub fn capacity(&self) -> usize {
        self.count << PAGE_SHIFT
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), DmaError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity() => Ok(()),
            _ => Err(DmaError::OutOfBounds),
        }
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), SevError> {
        self.check(offset, data.len())?;
        // SAFETY: the range was bounds checked against the reservation, which
        // is owned exclusively by this buffer on the guest side.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.vaddr().as_mut_ptr::<u8>().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copies bytes at `offset` out of the buffer into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), SevError> {
        self.check(offset, out.len())?;
        // SAFETY: the range was bounds checked against the reservation. The
        // hypervisor may change the contents concurrently, which is why they
        // are only ever copied, never referenced.
        unsafe {
            ptr::copy_nonoverlapping(
                self.vaddr().as_ptr::<u8>().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }
}

impl Drop for DmaBuffer<'_> {
    fn drop(&mut self) {
        self.region.release(self.first, self.count);
    }
}
