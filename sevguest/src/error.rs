// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023 SUSE LLC
//
// Author: Carlos López <carlos.lopez@suse.com>

use crate::address::VirtAddr;
use crate::greq::GreqError;
use crate::mm::dma::DmaError;
use crate::sev::ghcb::GhcbError;
use crate::sev::msr_protocol::GhcbMsrError;
use crate::sev::psc::PscError;
use crate::sev::secrets_page::SecretsError;
use crate::sev::SevSnpError;
use core::fmt;

/// Coarse classification of every [`SevError`].
///
/// None of these are retried by this crate. `Crypto` and `Protocol` errors
/// on the guest request channel are fatal to the VMPCK session, `Hardware`
/// errors during a page state change leave the memory state ambiguous and
/// are fatal to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or missing page, region, address or size at init
    Configuration,
    /// The hypervisor or firmware broke the documented contract
    Protocol,
    /// AEAD authentication failure
    Crypto,
    /// Non-zero PVALIDATE return
    Hardware,
    /// Page state change batch or range limits
    Range,
}

// As a general rule, functions private to a given module may use the
// leaf error types. Public functions should return a SevError
// containing a leaf error type, usually the one corresponding to
// that module. We always provide a way to convert a leaf error into
// a SevError via the From trait at the module level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SevError {
    // Errors related to GHCB
    Ghcb(GhcbError),
    // Errors related to MSR protocol
    GhcbMsr(GhcbMsrError),
    // Errors related to page state changes
    Psc(PscError),
    // PVALIDATE failed for the given address
    Pvalidate(VirtAddr, SevSnpError),
    // Errors related to SNP_GUEST_REQUEST messages
    Greq(GreqError),
    // Errors related to the secrets page
    Secrets(SecretsError),
    // Errors related to the shared DMA region
    Dma(DmaError),
}

impl SevError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Ghcb(e) => e.class(),
            Self::GhcbMsr(_) => ErrorClass::Protocol,
            Self::Psc(e) => e.class(),
            Self::Pvalidate(..) => ErrorClass::Hardware,
            Self::Greq(e) => e.class(),
            Self::Secrets(e) => e.class(),
            Self::Dma(_) => ErrorClass::Configuration,
        }
    }
}

impl fmt::Display for SevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ghcb(e) => write!(f, "GHCB error: {e:?}"),
            Self::GhcbMsr(e) => write!(f, "GHCB MSR protocol error: {e:?}"),
            Self::Psc(e) => write!(f, "page state change error: {e:?}"),
            Self::Pvalidate(vaddr, e) => {
                write!(f, "PVALIDATE failed at {vaddr}: {e} ({:#x})", e.ret())
            }
            Self::Greq(e) => write!(f, "SNP_GUEST_REQUEST error: {e:?}"),
            Self::Secrets(e) => write!(f, "secrets page error: {e:?}"),
            Self::Dma(e) => write!(f, "DMA region error: {e:?}"),
        }
    }
}

impl core::error::Error for SevError {}
