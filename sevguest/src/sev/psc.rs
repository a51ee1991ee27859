// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

//! Page state changes through the GHCB shared buffer.

use crate::address::{Address, PhysAddr, VirtAddr};
use crate::error::{ErrorClass, SevError};
use crate::types::PageSize;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::ghcb::{Ghcb, GhcbError, GHCBExitCode, GHCB_BUFFER_SIZE};
use super::{pvalidate, PvalidateOp};

/// Maximum number of entries in one request: the shared buffer minus the
/// 8 byte header, in 8 byte entries.
pub const PSC_MAX_ENTRIES: usize = (GHCB_BUFFER_SIZE - 8) / 8;

const PSC_OP_PRIVATE: u8 = 1;
const PSC_OP_SHARED: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PscError {
    // Start or end is not aligned to the requested page size
    Unaligned,
    // The range does not contain a single page
    EmptyRange,
    // The range needs more entries than fit into the shared buffer
    TooManyEntries(usize),
    // The hypervisor did not process every submitted entry
    Incomplete { submitted: u16, cur: u16, end: u16 },
}

impl PscError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unaligned | Self::EmptyRange | Self::TooManyEntries(_) => ErrorClass::Range,
            Self::Incomplete { .. } => ErrorClass::Protocol,
        }
    }
}

impl From<PscError> for SevError {
    fn from(e: PscError) -> Self {
        Self::Psc(e)
    }
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageStateChangeHeader {
    pub cur_entry: u16,
    pub end_entry: u16,
    reserved: u32,
}

/// One entry of a page state change request.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PscEntry {
    #[bits(12)]
    pub cur_page: u16,
    #[bits(40)]
    pub gfn: u64,
    #[bits(4)]
    pub operation: u8,
    pub huge: bool,
    #[bits(7)]
    rsvd_63_57: u8,
}

impl PscEntry {
    fn for_page(paddr: PhysAddr, size: PageSize, private: bool) -> Self {
        let op = if private {
            PSC_OP_PRIVATE
        } else {
            PSC_OP_SHARED
        };
        PscEntry::new()
            .with_gfn(paddr.pfn() as u64)
            .with_operation(op)
            .with_huge(size == PageSize::Huge)
    }
}

/// Splits `[start, end)` into pages of `size`, checking every limit of a
/// single request.
fn psc_pages(start: PhysAddr, end: PhysAddr, size: PageSize) -> Result<Vec<PhysAddr>, PscError> {
    let pgsize = usize::from(size);
    if !start.is_aligned(pgsize) || !end.is_aligned(pgsize) {
        return Err(PscError::Unaligned);
    }
    if start >= end {
        return Err(PscError::EmptyRange);
    }

    let count = (end - start) / pgsize;
    if count > PSC_MAX_ENTRIES {
        return Err(PscError::TooManyEntries(count));
    }

    Ok((0..count).map(|i| start + i * pgsize).collect())
}

fn pvalidate_pages(
    ghcb: &Ghcb<'_>,
    pages: &[PhysAddr],
    size: PageSize,
    op: PvalidateOp,
) -> Result<(), SevError> {
    for paddr in pages {
        // SAFETY: the caller of page_state_change() guarantees that the range
        // is identity mapped and not in use.
        unsafe {
            pvalidate(ghcb.platform(), VirtAddr::from(paddr.bits()), size, op)?;
        }
    }
    Ok(())
}

impl Ghcb<'_> {
    /// Converts the guest physical range `[start, end)` to private or shared
    /// memory with a single `SNP_PSC` exit.
    ///
    /// For a shared conversion every page is invalidated before the exit, for
    /// a private conversion every page is validated after it. The C-bit of
    /// the mappings has to be set by the caller after a private conversion
    /// and cleared only after a shared one.
    ///
    /// Range violations are reported before any page is touched. A failed
    /// `PVALIDATE` or an incomplete request leaves the state of the range
    /// indeterminate.
    ///
    /// # Safety
    ///
    /// The range must be identity mapped, and no live reference may exist to
    /// memory whose state is changed.
    pub unsafe fn page_state_change(
        &mut self,
        start: PhysAddr,
        end: PhysAddr,
        size: PageSize,
        private: bool,
    ) -> Result<(), SevError> {
        let pages = psc_pages(start, end, size)?;
        let scratch = u64::from(self.buffer_paddr()?);

        // psc_pages() bounds the count by PSC_MAX_ENTRIES
        let submitted = (pages.len() - 1) as u16;
        let header = PageStateChangeHeader {
            cur_entry: 0,
            end_entry: submitted,
            reserved: 0,
        };
        self.write_buffer(header.as_bytes(), 0)?;
        for (i, paddr) in pages.iter().enumerate() {
            let entry = PscEntry::for_page(*paddr, size, private);
            self.write_buffer(&u64::from(entry).to_le_bytes(), 8 + i * 8)?;
        }

        if !private {
            pvalidate_pages(self, &pages, size, PvalidateOp::Invalid)?;
        }

        if let Err(e) = self.exit(GHCBExitCode::SNP_PSC.into(), 0, 0, scratch) {
            if let SevError::Ghcb(GhcbError::VmgexitError(_, info2)) = e {
                log::error!(
                    "GHCB SnpPageStateChange failed err_high: {:#x} err_low: {:#x}",
                    info2 >> 32,
                    info2 & 0xffff_ffff
                );
            }
            return Err(e);
        }

        let mut raw = [0u8; 8];
        self.read_buffer(&mut raw, 0)?;
        let resp = PageStateChangeHeader::read_from_bytes(&raw)
            .map_err(|_| SevError::Ghcb(GhcbError::InvalidOffset))?;
        let (cur, end_entry) = (resp.cur_entry, resp.end_entry);
        if cur <= submitted || end_entry != submitted {
            log::error!(
                "incomplete page state change (submitted: {} cur: {} end: {})",
                submitted,
                cur,
                end_entry
            );
            return Err(PscError::Incomplete {
                submitted,
                cur,
                end: end_entry,
            }
            .into());
        }

        if private {
            pvalidate_pages(self, &pages, size, PvalidateOp::Valid)?;
        }

        Ok(())
    }
}
