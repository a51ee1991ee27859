// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{Address, PhysAddr};
use crate::cpu::msr::SEV_GHCB;
use crate::error::SevError;
use crate::platform::SevPlatform;

use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GhcbMsrError {
    // The info section of the response did not match our request
    InfoMismatch,
    // The data section of the response did not match our request,
    // or it was malformed altogether.
    DataMismatch,
    // The hypervisor does not implement GHCB protocol version 2
    UnsupportedVersion,
}

impl From<GhcbMsrError> for SevError {
    fn from(e: GhcbMsrError) -> Self {
        Self::GhcbMsr(e)
    }
}

#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum GHCBMsr {}

impl GHCBMsr {
    pub const SEV_INFO_REQ: u64 = 0x02;
    pub const SEV_INFO_RESP: u64 = 0x01;
    pub const SNP_REG_GHCB_GPA_REQ: u64 = 0x12;
    pub const SNP_REG_GHCB_GPA_RESP: u64 = 0x13;
    pub const SNP_STATE_CHANGE_REQ: u64 = 0x14;
    pub const SNP_STATE_CHANGE_RESP: u64 = 0x15;
    pub const SNP_HV_FEATURES_REQ: u64 = 0x80;
    pub const SNP_HV_FEATURES_RESP: u64 = 0x81;
}

/// GHCB protocol version implemented by this crate.
pub const GHCB_PROTOCOL_VERSION: u16 = 2;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GHCBHvFeatures: u64 {
        const SEV_SNP                 = 1 << 0;
        const SEV_SNP_AP_CREATION     = 1 << 1;
        const SEV_SNP_RESTR_INJ       = 1 << 2;
        const SEV_SNP_RESTR_INJ_TIMER = 1 << 3;
        const APIC_ID_LIST            = 1 << 4;
        const SEV_SNP_MULTI_VMPL      = 1 << 5;
        const SEV_PAGE_STATE_CHANGE   = 1 << 6;
        const SEV_SNP_EXT_INTERRUPTS  = 1 << 9;
    }
}

impl Display for GHCBHvFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}", self.bits()))
    }
}

/// Decoded `SEV_INFO` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SevInfo {
    pub min_version: u16,
    pub max_version: u16,
    pub c_bit: u8,
}

/// Sends one MSR protocol request and returns the hypervisor's response.
///
/// # Safety
///
/// `request` must be a GHCB MSR protocol request whose effect does not break
/// memory safety.
unsafe fn msr_request(platform: &dyn SevPlatform, request: u64) -> u64 {
    // SAFETY: requirements are delegated to the caller.
    unsafe {
        platform.write_msr(SEV_GHCB, request);
        platform.vmgexit();
    }
    platform.read_msr(SEV_GHCB)
}

/// Queries the range of GHCB protocol versions the hypervisor implements and
/// checks that it covers the version this crate speaks.
pub fn verify_ghcb_version(platform: &dyn SevPlatform) -> Result<SevInfo, GhcbMsrError> {
    // SAFETY: Requesting info through the GHCB MSR protocol is safe.
    let sev_info = unsafe { msr_request(platform, GHCBMsr::SEV_INFO_REQ) };

    if (sev_info & 0xfff) != GHCBMsr::SEV_INFO_RESP {
        log::error!("unexpected SEV_INFO response: {:#x}", sev_info & 0xfff);
        return Err(GhcbMsrError::InfoMismatch);
    }

    let info = SevInfo {
        min_version: ((sev_info >> 32) & 0xffff) as u16,
        max_version: ((sev_info >> 48) & 0xffff) as u16,
        c_bit: ((sev_info >> 24) & 0xff) as u8,
    };

    if !(info.min_version..=info.max_version).contains(&GHCB_PROTOCOL_VERSION) {
        log::error!(
            "the hypervisor doesn't support GHCB version {} (min: {}, max: {})",
            GHCB_PROTOCOL_VERSION,
            info.min_version,
            info.max_version
        );
        return Err(GhcbMsrError::UnsupportedVersion);
    }

    Ok(info)
}

pub fn hypervisor_ghcb_features(
    platform: &dyn SevPlatform,
) -> Result<GHCBHvFeatures, GhcbMsrError> {
    // SAFETY: Requesting HV features through the GHCB MSR protocol is safe.
    let result = unsafe { msr_request(platform, GHCBMsr::SNP_HV_FEATURES_REQ) };
    if (result & 0xFFF) != GHCBMsr::SNP_HV_FEATURES_RESP {
        return Err(GhcbMsrError::InfoMismatch);
    }

    let features = GHCBHvFeatures::from_bits_truncate(result >> 12);
    log::debug!("hypervisor GHCB features: {}", features);
    Ok(features)
}

/// # Safety
///
/// Since this causes the GHCB to be remapped to a different physical address
/// (allowing leaking and modifying its content), `addr` should be validated.
pub unsafe fn register_ghcb_gpa_msr(
    platform: &dyn SevPlatform,
    addr: PhysAddr,
) -> Result<(), GhcbMsrError> {
    let gpa = u64::from(addr);

    // SAFETY: safety requirements should be checked by the caller
    let info = unsafe { msr_request(platform, gpa | GHCBMsr::SNP_REG_GHCB_GPA_REQ) };

    if (info & 0xfff) != GHCBMsr::SNP_REG_GHCB_GPA_RESP {
        return Err(GhcbMsrError::InfoMismatch);
    }

    if (info & !0xfff) != gpa {
        return Err(GhcbMsrError::DataMismatch);
    }

    Ok(())
}

/// # Safety
///
/// See [`validate_page_msr`] or [`invalidate_page_msr`] safety requirements.
unsafe fn set_page_valid_status_msr(
    platform: &dyn SevPlatform,
    addr: PhysAddr,
    valid: bool,
) -> Result<(), GhcbMsrError> {
    let mut info: u64 = u64::from(addr) & 0x000f_ffff_ffff_f000;

    if valid {
        info |= 1u64 << 52;
    } else {
        info |= 2u64 << 52;
    }

    info |= GHCBMsr::SNP_STATE_CHANGE_REQ;
    // SAFETY: safety requirements are delegated to the caller.
    let response = unsafe { msr_request(platform, info) };

    if (response & 0xfff) != GHCBMsr::SNP_STATE_CHANGE_RESP {
        return Err(GhcbMsrError::InfoMismatch);
    }

    if (response & !0xfff) != 0 {
        log::error!(
            "MSR page state change for {:#x} failed: {:#x}",
            addr.bits(),
            response >> 32
        );
        return Err(GhcbMsrError::DataMismatch);
    }

    Ok(())
}

/// Asks the hypervisor to assign the page at `addr` to the guest's private
/// memory.
///
/// # Safety
///
/// Since this causes a page to be remmaped with a different encryption
/// attribute, `addr` should be validated.
pub unsafe fn validate_page_msr(
    platform: &dyn SevPlatform,
    addr: PhysAddr,
) -> Result<(), GhcbMsrError> {
    // SAFETY: safety requirements are delegated to the caller.
    unsafe { set_page_valid_status_msr(platform, addr, true) }
}

/// Asks the hypervisor to make the page at `addr` shared.
///
/// # Safety
///
/// Since this causes a page to be remmaped with a different encryption
/// attribute, `addr` should be validated.
pub unsafe fn invalidate_page_msr(
    platform: &dyn SevPlatform,
    addr: PhysAddr,
) -> Result<(), GhcbMsrError> {
    // SAFETY: safety requirements are delegated to the caller.
    unsafe { set_page_valid_status_msr(platform, addr, false) }
}
