// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

//! `SNP_GUEST_REQUEST` command to derive a key from the platform root keys.

use core::mem::size_of;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::greq::GreqError;

/// Size of a derived key
pub const DERIVED_KEY_SIZE: usize = 32;

bitflags! {
    /// Root key and signing key selection of a key request
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct KeySelect: u32 {
        /// Derive from the VM root key instead of the chip key
        const ROOT_KEY_VMRK = 1 << 0;
        /// Derive from the VCEK
        const VCEK          = 1 << 1;
        /// Derive from the VLEK
        const VLEK          = 2 << 1;
    }
}

bitflags! {
    /// Guest data mixed into a derived key
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GuestFieldSelect: u64 {
        const GUEST_POLICY      = 1 << 0;
        const IMAGE_ID          = 1 << 1;
        const FAMILY_ID         = 1 << 2;
        const MEASUREMENT       = 1 << 3;
        const GUEST_SVN         = 1 << 4;
        const TCB_VERSION       = 1 << 5;
        const LAUNCH_MIT_VECTOR = 1 << 6;
    }
}

/// MSG_KEY_REQ payload format (AMD SEV-SNP firmware ABI, table 19)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SnpKeyRequest {
    key_select: u32,
    rsvd_04: u32,
    guest_field_select: u64,
    vmpl: u32,
    guest_svn: u32,
    tcb_version: u64,
    launch_mit_vector: u64,
    rsvd_28: [u8; 472],
}

const _: () = assert!(size_of::<SnpKeyRequest>() == 512);

impl SnpKeyRequest {
    pub fn new(key_select: KeySelect, guest_field_select: GuestFieldSelect, vmpl: u32) -> Self {
        Self {
            key_select: key_select.bits(),
            rsvd_04: 0,
            guest_field_select: guest_field_select.bits(),
            vmpl,
            guest_svn: 0,
            tcb_version: 0,
            launch_mit_vector: 0,
            rsvd_28: [0; 472],
        }
    }

    /// Guest SVN to mix in with [`GuestFieldSelect::GUEST_SVN`]
    pub fn with_guest_svn(mut self, guest_svn: u32) -> Self {
        self.guest_svn = guest_svn;
        self
    }

    /// TCB version to mix in with [`GuestFieldSelect::TCB_VERSION`]
    pub fn with_tcb_version(mut self, tcb_version: u64) -> Self {
        self.tcb_version = tcb_version;
        self
    }

    /// Mitigation vector to mix in with
    /// [`GuestFieldSelect::LAUNCH_MIT_VECTOR`]
    pub fn with_launch_mit_vector(mut self, launch_mit_vector: u64) -> Self {
        self.launch_mit_vector = launch_mit_vector;
        self
    }

    pub fn key_select(&self) -> KeySelect {
        KeySelect::from_bits_retain(self.key_select)
    }

    pub fn guest_field_select(&self) -> GuestFieldSelect {
        GuestFieldSelect::from_bits_retain(self.guest_field_select)
    }

    pub fn vmpl(&self) -> u32 {
        self.vmpl
    }
}

/// MSG_KEY_RSP payload format (AMD SEV-SNP firmware ABI, table 21)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SnpKeyResponse {
    status: u32,
    rsvd_04: [u8; 28],
    derived_key: [u8; DERIVED_KEY_SIZE],
}

impl SnpKeyResponse {
    /// Parses a decrypted MSG_KEY_RSP payload, failing on a non-zero status.
    pub fn parse(buf: &[u8]) -> Result<Self, GreqError> {
        let (rsp, _) = Self::read_from_prefix(buf).map_err(|_| GreqError::InvalidResponseSize)?;
        let status = rsp.status;
        if status != 0 {
            log::error!("key derivation request failed, status {:#x}", status);
            return Err(GreqError::RequestError(status));
        }
        Ok(rsp)
    }

    pub fn derived_key(&self) -> [u8; DERIVED_KEY_SIZE] {
        self.derived_key
    }
}
