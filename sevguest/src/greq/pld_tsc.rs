// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

//! `SNP_GUEST_REQUEST` command to query the Secure TSC parameters.

use core::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::greq::GreqError;

/// MSG_TSC_INFO_REQ payload: 128 reserved bytes
pub const TSC_INFO_REQ_SIZE: usize = 128;

/// MSG_TSC_INFO_RSP payload format (AMD SEV-SNP firmware ABI, table 39)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SnpTscInfo {
    status: u32,
    rsvd_04: u32,
    guest_tsc_scale: u64,
    guest_tsc_offset: u64,
    tsc_factor: u32,
    rsvd_1c: [u8; 100],
}

const _: () = assert!(size_of::<SnpTscInfo>() == 128);

impl SnpTscInfo {
    /// Parses a decrypted MSG_TSC_INFO_RSP payload, failing on a non-zero
    /// status.
    pub fn parse(buf: &[u8]) -> Result<Self, GreqError> {
        let (rsp, _) = Self::read_from_prefix(buf).map_err(|_| GreqError::InvalidResponseSize)?;
        let status = rsp.status;
        if status != 0 {
            log::error!("TSC info request failed, status {:#x}", status);
            return Err(GreqError::RequestError(status));
        }
        Ok(rsp)
    }

    pub fn guest_tsc_scale(&self) -> u64 {
        self.guest_tsc_scale
    }

    pub fn guest_tsc_offset(&self) -> u64 {
        self.guest_tsc_offset
    }

    pub fn tsc_factor(&self) -> u32 {
        self.tsc_factor
    }
}
