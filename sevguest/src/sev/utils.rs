// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::VirtAddr;
use crate::error::SevError;
use crate::platform::SevPlatform;
use crate::types::PageSize;
use core::fmt;

#[cfg(target_arch = "x86_64")]
use crate::address::Address;
#[cfg(target_arch = "x86_64")]
use core::arch::asm;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[expect(non_camel_case_types)]
pub enum SevSnpError {
    FAIL_INPUT(u64),
    FAIL_PERMISSION(u64),
    FAIL_SIZEMISMATCH(u64),
    // Not a real error value, but we want to keep track of this,
    // especially for protocol-specific messaging
    FAIL_UNCHANGED(u64),
    // Any other return value of the instruction
    FAIL_UNKNOWN(u64),
}

impl SevSnpError {
    // This should get optimized away by the compiler to a single instruction
    pub fn ret(&self) -> u64 {
        match self {
            Self::FAIL_INPUT(ret)
            | Self::FAIL_UNCHANGED(ret)
            | Self::FAIL_PERMISSION(ret)
            | Self::FAIL_SIZEMISMATCH(ret)
            | Self::FAIL_UNKNOWN(ret) => *ret,
        }
    }

    /// Maps a raw PVALIDATE return code onto an error. `0` means success and
    /// yields `None`.
    pub fn from_ret(ret: u64) -> Option<Self> {
        match ret {
            0 => None,
            1 => Some(Self::FAIL_INPUT(ret)),
            2 => Some(Self::FAIL_PERMISSION(ret)),
            6 => Some(Self::FAIL_SIZEMISMATCH(ret)),
            0x10 => Some(Self::FAIL_UNCHANGED(ret)),
            _ => Some(Self::FAIL_UNKNOWN(ret)),
        }
    }
}

impl fmt::Display for SevSnpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FAIL_INPUT(_) => write!(f, "FAIL_INPUT"),
            Self::FAIL_UNCHANGED(_) => write!(f, "FAIL_UNCHANGED"),
            Self::FAIL_PERMISSION(_) => write!(f, "FAIL_PERMISSION"),
            Self::FAIL_SIZEMISMATCH(_) => write!(f, "FAIL_SIZEMISMATCH"),
            Self::FAIL_UNKNOWN(_) => write!(f, "FAIL_UNKNOWN"),
        }
    }
}

/// The desired state of the page passed to PVALIDATE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum PvalidateOp {
    Invalid = 0,
    Valid = 1,
}

/// Validates or rescinds validation of the page at `vaddr` through the
/// platform's PVALIDATE primitive. Every failing return code, including the
/// "unchanged" indication, is reported as [`SevError::Pvalidate`].
///
/// # Safety
///
/// See [`SevPlatform::pvalidate`].
pub unsafe fn pvalidate(
    platform: &dyn SevPlatform,
    vaddr: VirtAddr,
    size: PageSize,
    op: PvalidateOp,
) -> Result<(), SevError> {
    // SAFETY: requirements are delegated to the caller.
    let ret = unsafe { platform.pvalidate(vaddr, size, op) };
    match SevSnpError::from_ret(ret) {
        None => Ok(()),
        Some(err) => {
            log::error!(
                "PVALIDATE({:?}) failed at {}: {} ({:#x})",
                op,
                vaddr,
                err,
                err.ret()
            );
            Err(SevError::Pvalidate(vaddr, err))
        }
    }
}

/// Executes PVALIDATE and returns the raw result: the value of `eax`, or
/// `0x10` when the instruction left the validation state unchanged.
///
/// # Safety
///
/// `vaddr` must be mapped, and changing its validation state must not break
/// memory safety: no live references may exist to a page being invalidated.
#[cfg(target_arch = "x86_64")]
pub unsafe fn raw_pvalidate(vaddr: VirtAddr, size: PageSize, valid: PvalidateOp) -> u64 {
    let rax = vaddr.bits();
    let rcx: u64 = match size {
        PageSize::Regular => 0,
        PageSize::Huge => 1,
    };
    let rdx = valid as u64;
    let ret: u64;
    let cf: u64;

    // SAFETY: requirements have to be checked by the caller.
    unsafe {
        asm!("xorq %r8, %r8",
             "pvalidate",
             "jnc 1f",
             "incq %r8",
             "1:",
             in("rax")  rax,
             in("rcx")  rcx,
             in("rdx")  rdx,
             lateout("rax") ret,
             lateout("r8") cf,
             options(att_syntax));
    }

    match ret {
        0 if cf != 0 => 0x10,
        _ => ret,
    }
}

/// # Safety
/// VMGEXIT operations generally need to be performed with interrupts disabled
/// to ensure that an interrupt cannot cause the GHCB MSR to change prior to
/// exiting to the host.  It is the caller's responsibility to ensure that
/// interrupt handling is configured correctly for the attempted operation.
#[cfg(target_arch = "x86_64")]
pub unsafe fn raw_vmgexit() {
    // SAFETY: requirements have to be checked by the caller.
    unsafe {
        asm!("rep; vmmcall", options(att_syntax));
    }
}
