// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

use crate::address::VirtAddr;
use crate::sev::PvalidateOp;
use crate::types::PageSize;
use core::fmt;

#[cfg(target_arch = "x86_64")]
pub mod snp;

#[cfg(target_arch = "x86_64")]
pub use snp::SnpPlatform;

/// The hardware primitives the guest side of the GHCB protocol is built on.
///
/// Every GHCB, page state change and guest request path in this crate only
/// reaches the CPU through this trait, so that the protocol logic can run on
/// top of a simulated hypervisor.
pub trait SevPlatform: fmt::Debug + Sync {
    /// Reads the model specific register `msr`. Reading has no side effects.
    fn read_msr(&self, msr: u32) -> u64;

    /// Writes `val` to the model specific register `msr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the new MSR value does not break memory
    /// safety. For the GHCB MSR this means the value is either an MSR
    /// protocol request or the physical address of a page that is mapped
    /// shared and owned by the caller until the next trap returns.
    unsafe fn write_msr(&self, msr: u32, val: u64);

    /// Traps to the hypervisor (`VMGEXIT`) and returns once the hypervisor
    /// resumes the guest. On return the GHCB page and the GHCB MSR hold the
    /// hypervisor's response.
    ///
    /// # Safety
    ///
    /// The caller must have written a valid request to the GHCB MSR and must
    /// ensure that nothing else on this CPU changes the GHCB MSR or the GHCB
    /// page until this function returns.
    unsafe fn vmgexit(&self);

    /// Executes `PVALIDATE` on the page mapped at `vaddr`. Returns `0` on
    /// success, `0x10` when the validation state was already the requested
    /// one, or the raw non-zero error code of the instruction otherwise.
    ///
    /// # Safety
    ///
    /// `vaddr` must map the guest physical page whose validation state is
    /// changed, and no live reference may exist to a page being invalidated.
    unsafe fn pvalidate(&self, vaddr: VirtAddr, size: PageSize, op: PvalidateOp) -> u64;
}
