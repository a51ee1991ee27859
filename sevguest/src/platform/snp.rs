// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

use super::SevPlatform;
use crate::address::VirtAddr;
use crate::cpu::msr::{read_msr, write_msr};
use crate::sev::utils::{raw_pvalidate, raw_vmgexit};
use crate::sev::PvalidateOp;
use crate::types::PageSize;

/// [`SevPlatform`] backed by the real instructions of an SEV-SNP guest.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnpPlatform;

impl SnpPlatform {
    pub const fn new() -> Self {
        Self
    }
}

impl SevPlatform for SnpPlatform {
    fn read_msr(&self, msr: u32) -> u64 {
        read_msr(msr)
    }

    unsafe fn write_msr(&self, msr: u32, val: u64) {
        // SAFETY: requirements are delegated to the caller.
        unsafe { write_msr(msr, val) }
    }

    unsafe fn vmgexit(&self) {
        // SAFETY: requirements are delegated to the caller.
        unsafe { raw_vmgexit() }
    }

    unsafe fn pvalidate(&self, vaddr: VirtAddr, size: PageSize, op: PvalidateOp) -> u64 {
        // SAFETY: requirements are delegated to the caller.
        unsafe { raw_pvalidate(vaddr, size, op) }
    }
}
