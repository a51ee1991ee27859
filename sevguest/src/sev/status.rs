// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::cpu::msr::SEV_STATUS;
use crate::platform::SevPlatform;
use bitflags::bitflags;
use core::fmt::{self, Write};

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SEVStatusFlags: u64 {
        const SEV           = 1 << 0;
        const SEV_ES        = 1 << 1;
        const SEV_SNP       = 1 << 2;
        const VTOM          = 1 << 3;
        const REFLECT_VC    = 1 << 4;
        const REST_INJ      = 1 << 5;
        const ALT_INJ       = 1 << 6;
        const DBGSWP        = 1 << 7;
        const PREV_HOST_IBS = 1 << 8;
        const BTB_ISOLATION = 1 << 9;
        const VMPL_SSS      = 1 << 10;
        const SECURE_TSC    = 1 << 11;
        const VMSA_REG_PROT = 1 << 16;
        const SMT_PROT      = 1 << 17;
    }
}

const FLAG_NAMES: [(SEVStatusFlags, &str); 14] = [
    (SEVStatusFlags::SEV, "SEV"),
    (SEVStatusFlags::SEV_ES, "SEV-ES"),
    (SEVStatusFlags::SEV_SNP, "SEV-SNP"),
    (SEVStatusFlags::VTOM, "VTOM"),
    (SEVStatusFlags::REFLECT_VC, "REFLECT_VC"),
    (SEVStatusFlags::REST_INJ, "RESTRICTED_INJECTION"),
    (SEVStatusFlags::ALT_INJ, "ALTERNATE_INJECTION"),
    (SEVStatusFlags::DBGSWP, "DEBUG_SWAP"),
    (SEVStatusFlags::PREV_HOST_IBS, "PREVENT_HOST_IBS"),
    (SEVStatusFlags::BTB_ISOLATION, "SNP_BTB_ISOLATION"),
    (SEVStatusFlags::VMPL_SSS, "VMPL_SSS"),
    (SEVStatusFlags::SECURE_TSC, "SECURE_TSC"),
    (SEVStatusFlags::VMSA_REG_PROT, "VMSA_REG_PROT"),
    (SEVStatusFlags::SMT_PROT, "SMT_PROTECTION"),
];

impl fmt::Display for SEVStatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for (flag, name) in FLAG_NAMES.iter() {
            if !self.contains(*flag) {
                continue;
            }
            if !first {
                f.write_char(' ')?;
            }
            f.write_str(name)?;
            first = false;
        }

        Ok(())
    }
}

impl SEVStatusFlags {
    pub fn sev_es_enabled(&self) -> bool {
        self.contains(SEVStatusFlags::SEV_ES)
    }

    pub fn sev_snp_enabled(&self) -> bool {
        self.contains(SEVStatusFlags::SEV_SNP)
    }
}

/// Reads and decodes the `SEV_STATUS` MSR. Unknown bits are dropped.
pub fn sev_status(platform: &dyn SevPlatform) -> SEVStatusFlags {
    let status = SEVStatusFlags::from_bits_truncate(platform.read_msr(SEV_STATUS));
    log::debug!("SEV status: {}", status);
    status
}

/// Position of the C-bit in a page table entry, taken from `EBX` of CPUID
/// leaf `0x8000001f`.
pub fn encrypted_bit(cpuid_ebx: u32) -> u32 {
    cpuid_ebx & 0x3f
}

/// Page table entry mask selecting private (encrypted) memory.
pub fn encryption_mask(cpuid_ebx: u32) -> u64 {
    1u64 << encrypted_bit(cpuid_ebx)
}
