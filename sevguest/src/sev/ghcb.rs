// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::PhysAddr;
use crate::cpu::msr::SEV_GHCB;
use crate::error::{ErrorClass, SevError};
use crate::mm::{DmaBuffer, DmaRegion};
use crate::platform::SevPlatform;
use crate::types::{PageSize, PAGE_SIZE, VMPL_MAX};

use alloc::vec;
use alloc::vec::Vec;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::msr_protocol::{invalidate_page_msr, register_ghcb_gpa_msr};
use super::{pvalidate, PvalidateOp};

pub const GHCB_BUFFER_SIZE: usize = 0x7f0;

/// GHCB protocol version written into every exit.
const GHCB_VERSION: u16 = 2;

macro_rules! ghcb_getter {
    ($name:ident, $field:ident,$t:ty) => {
        fn $name(&self) -> Result<$t, GhcbError> {
            self.is_valid(offset_of!(Self, $field))
                .then(|| self.$field.load(Ordering::Relaxed))
                .ok_or(GhcbError::VmgexitInvalid)
        }
    };
}

macro_rules! ghcb_setter {
    ($name:ident, $field:ident, $t:ty) => {
        fn $name(&self, val: $t) {
            self.$field.store(val, Ordering::Relaxed);
            self.set_valid(offset_of!(Self, $field));
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GhcbError {
    // No shared memory region was configured for this GHCB
    NoSharedMemory,
    // The GHCB is used before init()
    NotInitialized,
    // init() was called on a GHCB that is already in use
    AlreadyInitialized,
    // Attempted to access an invalid offset in the GHCB shared buffer
    InvalidOffset,
    // The hypervisor did not mark a returned field as valid
    VmgexitInvalid,
    // The hypervisor returned a different exit code than the one requested
    ExitCodeMismatch { expected: u64, found: u64 },
    // A response from the hypervisor included an error code
    VmgexitError(u64, u64),
}

impl GhcbError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoSharedMemory
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::InvalidOffset => ErrorClass::Configuration,
            Self::VmgexitInvalid | Self::ExitCodeMismatch { .. } | Self::VmgexitError(..) => {
                ErrorClass::Protocol
            }
        }
    }
}

impl From<GhcbError> for SevError {
    fn from(e: GhcbError) -> Self {
        Self::Ghcb(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
#[expect(non_camel_case_types, clippy::upper_case_acronyms)]
pub enum GHCBExitCode {
    RDTSC = 0x6e,
    SNP_PSC = 0x8000_0010,
    GUEST_REQUEST = 0x8000_0011,
}

impl From<GHCBExitCode> for u64 {
    fn from(code: GHCBExitCode) -> u64 {
        code as u64
    }
}

/// Layout of the shared GHCB page. Every field is an atomic since the
/// hypervisor may write the page at any time.
#[repr(C)]
#[derive(Debug)]
pub struct GHCB {
    reserved_1: [AtomicU8; 0x1f8],
    rax: AtomicU64,
    reserved_2: [AtomicU8; 0x110],
    rdx: AtomicU64,
    reserved_3: [AtomicU8; 0x78],
    sw_exit_code: AtomicU64,
    sw_exit_info_1: AtomicU64,
    sw_exit_info_2: AtomicU64,
    sw_scratch: AtomicU64,
    reserved_4: [AtomicU8; 0x40],
    valid_bitmap: [AtomicU64; 2],
    reserved_5: [AtomicU8; 0x400],
    buffer: [AtomicU8; GHCB_BUFFER_SIZE],
    reserved_6: [AtomicU8; 0xa],
    version: AtomicU16,
    usage: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<GHCB>() == PAGE_SIZE);

impl GHCB {
    ghcb_getter!(get_rax_valid, rax, u64);
    ghcb_getter!(get_rdx_valid, rdx, u64);

    ghcb_setter!(set_exit_code_valid, sw_exit_code, u64);
    ghcb_setter!(set_exit_info_1_valid, sw_exit_info_1, u64);
    ghcb_setter!(set_exit_info_2_valid, sw_exit_info_2, u64);
    ghcb_setter!(set_sw_scratch_valid, sw_scratch, u64);

    /// Clears the valid bitmap. The bitmap is rebuilt from scratch for every
    /// exit so that no field of an earlier exit is exposed again.
    pub fn clear(&self) {
        self.valid_bitmap[0].store(0, Ordering::Relaxed);
        self.valid_bitmap[1].store(0, Ordering::Relaxed);
    }

    fn set_valid(&self, offset: usize) {
        let bit: usize = (offset >> 3) & 0x3f;
        let index: usize = (offset >> 9) & 0x1;
        let mask: u64 = 1 << bit;

        self.valid_bitmap[index].fetch_or(mask, Ordering::Relaxed);
    }

    fn is_valid(&self, offset: usize) -> bool {
        let bit: usize = (offset >> 3) & 0x3f;
        let index: usize = (offset >> 9) & 0x1;
        let mask: u64 = 1 << bit;

        (self.valid_bitmap[index].load(Ordering::Relaxed) & mask) == mask
    }

    fn vmgexit(
        &self,
        platform: &dyn SevPlatform,
        ghcb_pa: PhysAddr,
        exit_code: u64,
        exit_info_1: u64,
        exit_info_2: u64,
    ) -> Result<(), GhcbError> {
        self.version.store(GHCB_VERSION, Ordering::Relaxed);
        // GHCB Follows standard format
        self.usage.store(0, Ordering::Relaxed);
        self.set_exit_code_valid(exit_code);
        self.set_exit_info_1_valid(exit_info_1);
        self.set_exit_info_2_valid(exit_info_2);

        // SAFETY: the GHCB page is reserved for this instance and shared with
        // the hypervisor, and exclusive access to the instance keeps the MSR
        // stable until the trap returns.
        unsafe {
            platform.write_msr(SEV_GHCB, u64::from(ghcb_pa));
            platform.vmgexit();
        }

        let found = self.sw_exit_code.load(Ordering::Relaxed);
        if found != exit_code {
            log::error!(
                "GHCB exit code mismatch: expected {:#x}, found {:#x}",
                exit_code,
                found
            );
            return Err(GhcbError::ExitCodeMismatch {
                expected: exit_code,
                found,
            });
        }

        let sw_exit_info_1 = self.sw_exit_info_1.load(Ordering::Relaxed);
        let sw_exit_info_2 = self.sw_exit_info_2.load(Ordering::Relaxed);
        if sw_exit_info_1 != 0 || sw_exit_info_2 != 0 {
            return Err(GhcbError::VmgexitError(sw_exit_info_1, sw_exit_info_2));
        }

        Ok(())
    }

    fn write_buffer_slice(&self, data: &[u8], offset: usize) -> Result<(), GhcbError> {
        let dst = &self
            .buffer
            .get(offset..)
            .ok_or(GhcbError::InvalidOffset)?
            .get(..data.len())
            .ok_or(GhcbError::InvalidOffset)?;
        for (dst, src) in dst.iter().zip(data.iter().copied()) {
            dst.store(src, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_buffer_slice(&self, data: &mut [u8], offset: usize) -> Result<(), GhcbError> {
        let src = &self
            .buffer
            .get(offset..)
            .ok_or(GhcbError::InvalidOffset)?
            .get(..data.len())
            .ok_or(GhcbError::InvalidOffset)?;
        for (d, s) in data.iter_mut().zip(src.iter()) {
            *d = s.load(Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Guest side of one Guest-Hypervisor Communication Block.
///
/// There is one instance per logical CPU. All exits through an instance are
/// serialized by `&mut self`; an instance shared between contexts of the same
/// CPU has to be wrapped in a [`crate::locking::SpinLock`].
#[derive(Debug)]
pub struct Ghcb<'a> {
    platform: &'a dyn SevPlatform,
    shared: Option<&'a DmaRegion>,
    page: Option<DmaBuffer<'a>>,
    /// Sequence number the next guest request is sealed with.
    pub(crate) seqno: u64,
    /// VMPCK indices that must not be used anymore on this instance.
    pub(crate) vmpck_disabled: [bool; VMPL_MAX],
}

impl<'a> Ghcb<'a> {
    /// Creates an uninitialized GHCB. `shared` is the region the GHCB page
    /// and the guest request pages are reserved from.
    pub fn new(platform: &'a dyn SevPlatform, shared: Option<&'a DmaRegion>) -> Self {
        Self {
            platform,
            shared,
            page: None,
            seqno: 0,
            vmpck_disabled: [false; VMPL_MAX],
        }
    }

    /// Reserves the GHCB page from the shared region and starts the guest
    /// request session at sequence number 1. An instance is initialized
    /// once; a second call fails with [`GhcbError::AlreadyInitialized`]
    /// and leaves the session untouched.
    ///
    /// With `register` set, the page's GPA is registered with the hypervisor,
    /// its validation is rescinded and it is converted to shared through the
    /// GHCB MSR protocol.
    pub fn init(&mut self, register: bool) -> Result<(), SevError> {
        if self.is_initialized() {
            return Err(GhcbError::AlreadyInitialized.into());
        }
        let region = self.shared.ok_or(GhcbError::NoSharedMemory)?;
        let page = region.reserve(PAGE_SIZE)?;

        if register {
            let gpa = page.paddr();
            // SAFETY: the page was just reserved from the shared region and is
            // not referenced by anything else.
            unsafe {
                register_ghcb_gpa_msr(self.platform, gpa)?;
                pvalidate(
                    self.platform,
                    page.vaddr(),
                    PageSize::Regular,
                    PvalidateOp::Invalid,
                )?;
                invalidate_page_msr(self.platform, gpa)?;
            }
            log::info!("GHCB registered at {:#x}", gpa);
        }

        self.page = Some(page);
        self.seqno = 1;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.page.is_some()
    }

    pub fn platform(&self) -> &'a dyn SevPlatform {
        self.platform
    }

    /// Shared region guest request pages are reserved from.
    pub(crate) fn shared_region(&self) -> Result<&'a DmaRegion, GhcbError> {
        self.shared.ok_or(GhcbError::NoSharedMemory)
    }

    /// Sequence number the next guest request will be sealed with.
    pub fn sequence(&self) -> u64 {
        self.seqno
    }

    /// Guest physical address of the GHCB page.
    pub fn paddr(&self) -> Result<PhysAddr, GhcbError> {
        self.page
            .as_ref()
            .map(DmaBuffer::paddr)
            .ok_or(GhcbError::NotInitialized)
    }

    /// Guest physical address of the shared buffer inside the GHCB page.
    pub fn buffer_paddr(&self) -> Result<PhysAddr, GhcbError> {
        Ok(self.paddr()? + offset_of!(GHCB, buffer))
    }

    fn layout(&self) -> Result<&GHCB, GhcbError> {
        let page = self.page.as_ref().ok_or(GhcbError::NotInitialized)?;
        // SAFETY: the page is reserved for this instance, page aligned and
        // exactly GHCB sized. All fields of GHCB are atomics, so concurrent
        // writes by the hypervisor do not violate aliasing rules.
        Ok(unsafe { &*page.vaddr().as_ptr::<GHCB>() })
    }

    /// Hands control to the hypervisor with the given exit code and exit
    /// information. Only the exit code, both exit information fields and,
    /// when non-zero, `scratch` are marked valid.
    ///
    /// Fails when the hypervisor does not echo `exit_code` or reports an
    /// error through either exit information field.
    pub fn exit(
        &mut self,
        exit_code: u64,
        exit_info_1: u64,
        exit_info_2: u64,
        scratch: u64,
    ) -> Result<(), SevError> {
        let ghcb_pa = self.paddr()?;
        let ghcb = self.layout()?;

        ghcb.clear();
        if scratch != 0 {
            ghcb.set_sw_scratch_valid(scratch);
        }
        ghcb.vmgexit(self.platform, ghcb_pa, exit_code, exit_info_1, exit_info_2)?;
        Ok(())
    }

    /// Reads the time stamp counter through the hypervisor.
    pub fn rdtsc(&mut self) -> Result<u64, SevError> {
        self.exit(GHCBExitCode::RDTSC.into(), 0, 0, 0)?;
        let ghcb = self.layout()?;
        let rax = ghcb.get_rax_valid()?;
        let rdx = ghcb.get_rdx_valid()?;
        Ok((rax & 0xffff_ffff) | (rdx << 32))
    }

    pub(crate) fn write_buffer(&self, data: &[u8], offset: usize) -> Result<(), GhcbError> {
        self.layout()?.write_buffer_slice(data, offset)
    }

    pub(crate) fn read_buffer(&self, data: &mut [u8], offset: usize) -> Result<(), GhcbError> {
        self.layout()?.read_buffer_slice(data, offset)
    }

    /// Returns a copy of the whole GHCB page.
    pub fn dump(&self) -> Result<Vec<u8>, GhcbError> {
        let page = self.page.as_ref().ok_or(GhcbError::NotInitialized)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        page.read(0, &mut buf).map_err(|_| GhcbError::InvalidOffset)?;
        Ok(buf)
    }
}
