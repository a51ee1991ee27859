// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

#[cfg(target_arch = "x86_64")]
use core::arch::asm;

pub const SEV_STATUS: u32 = 0xC001_0131;
pub const SEV_GHCB: u32 = 0xC001_0130;

#[cfg(target_arch = "x86_64")]
pub fn read_msr(msr: u32) -> u64 {
    let eax: u32;
    let edx: u32;

    // SAFETY: Inline assembly to read the specified MSR. It does not change
    // any state.
    unsafe {
        asm!("rdmsr",
             in("ecx") msr,
             out("eax") eax,
             out("edx") edx,
             options(att_syntax));
    }
    u64::from(eax) | u64::from(edx) << 32
}

/// # Safety
///
/// The caller should ensure that the new value in the target MSR doesn't break
/// memory safety.
#[cfg(target_arch = "x86_64")]
pub unsafe fn write_msr(msr: u32, val: u64) {
    let eax = val as u32;
    let edx = (val >> 32) as u32;

    // SAFETY: requirements have to be checked by the caller.
    unsafe {
        asm!("wrmsr",
             in("ecx") msr,
             in("eax") eax,
             in("edx") edx,
             options(att_syntax));
    }
}
