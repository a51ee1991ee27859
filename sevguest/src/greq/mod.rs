// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (C) 2023 IBM
//
// Author: Claudio Carvalho <cclaudio@linux.ibm.com>

//! `SNP_GUEST_REQUEST` mechanism to communicate with the PSP

use crate::error::{ErrorClass, SevError};

pub mod driver;
pub mod msg;
pub mod pld_key;
pub mod pld_report;
pub mod pld_tsc;
pub mod services;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GreqError {
    // The response carried a different sequence number than expected
    SequenceMismatch { expected: u64, found: u64 },
    // The sequence number space of the session is exhausted
    SequenceOverflow,
    // The response header does not match the request
    InvalidHeader,
    // The response is too short for the expected payload
    InvalidResponseSize,
    // AEAD tag verification failed
    Crypto,
    // The PSP returned a non-zero status in the response payload
    RequestError(u32),
    // The attestation report has a version this crate does not understand
    UnsupportedReportVersion(u32),
    // The VMPCK was disabled after a failed exchange
    VmpckDisabled(usize),
    // VMPCK index outside of [0, VMPL_MAX)
    InvalidVmpckIndex(usize),
    // Caller supplied buffer has an invalid size
    InvalidParameter,
}

impl GreqError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Crypto => ErrorClass::Crypto,
            Self::InvalidVmpckIndex(_) | Self::InvalidParameter => ErrorClass::Configuration,
            Self::SequenceMismatch { .. }
            | Self::SequenceOverflow
            | Self::InvalidHeader
            | Self::InvalidResponseSize
            | Self::RequestError(_)
            | Self::UnsupportedReportVersion(_)
            | Self::VmpckDisabled(_) => ErrorClass::Protocol,
        }
    }
}

impl From<GreqError> for SevError {
    fn from(e: GreqError) -> Self {
        Self::Greq(e)
    }
}
