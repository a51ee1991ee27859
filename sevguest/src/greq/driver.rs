// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (C) 2023 IBM
//
// Author: Claudio Carvalho <cclaudio@linux.ibm.com>

//! Driver to send `SNP_GUEST_REQUEST` commands to the PSP through a GHCB.

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    error::SevError,
    greq::{
        msg::{open, seal, SnpGuestRequestMsgHdr, SnpGuestRequestMsgType},
        GreqError,
    },
    mm::DmaBuffer,
    sev::{
        ghcb::{GHCBExitCode, Ghcb, GhcbError},
        secrets_page::VMPCK_SIZE,
    },
    types::{PAGE_SIZE, VMPL_MAX},
};

impl Ghcb<'_> {
    /// Sends `request` as a `SNP_GUEST_REQUEST` message of type `msg_type`,
    /// protected by `key`, the VMPCK with index `vmpck_index`, and returns
    /// the decrypted response payload.
    ///
    /// The request is sealed with the current sequence number `n` and the
    /// response must carry `n + 1`. The sequence number only advances,
    /// past the response, after the response was authenticated.
    ///
    /// Any failure once the request was handed to the hypervisor disables
    /// `vmpck_index` on this GHCB: reusing the key would reuse an AES-GCM
    /// nonce. Callers should also wipe the key from the secrets page with
    /// [`crate::sev::SnpSecrets::clear_vmpck`].
    pub fn guest_request(
        &mut self,
        vmpck_index: usize,
        key: &[u8; VMPCK_SIZE],
        request: &[u8],
        msg_type: SnpGuestRequestMsgType,
    ) -> Result<Vec<u8>, SevError> {
        if vmpck_index >= VMPL_MAX {
            return Err(GreqError::InvalidVmpckIndex(vmpck_index).into());
        }
        if self.vmpck_disabled[vmpck_index] {
            return Err(GreqError::VmpckDisabled(vmpck_index).into());
        }
        if !self.is_initialized() {
            return Err(GhcbError::NotInitialized.into());
        }

        let seqno = self.seqno;
        // The sequence number is restored only when the guest is rebooted.
        let Some(next_seqno) = seqno.checked_add(2) else {
            log::error!("SNP_GUEST_REQUEST: sequence number overflow");
            self.disable_vmpck(vmpck_index);
            return Err(GreqError::SequenceOverflow.into());
        };

        let vmpck =
            u8::try_from(vmpck_index).map_err(|_| GreqError::InvalidVmpckIndex(vmpck_index))?;
        let mut hdr = SnpGuestRequestMsgHdr::new(msg_type, vmpck);
        let sealed = seal(&mut hdr, seqno, request, key)?;

        let region = self.shared_region()?;
        let mut req_page = region.reserve(PAGE_SIZE)?;
        let resp_page = region.reserve(PAGE_SIZE)?;
        req_page.write(0, &sealed)?;

        let result = self
            .exit(
                GHCBExitCode::GUEST_REQUEST.into(),
                req_page.paddr().into(),
                resp_page.paddr().into(),
                0,
            )
            .and_then(|_| read_response(&resp_page, msg_type, vmpck, key, seqno + 1));

        match result {
            Ok(payload) => {
                self.seqno = next_seqno;
                Ok(payload)
            }
            Err(e) => {
                log::error!("SNP_GUEST_REQUEST failed: {}", e);
                self.disable_vmpck(vmpck_index);
                Err(e)
            }
        }
    }

    /// Whether `vmpck_index` was disabled by a failed guest request.
    pub fn is_vmpck_disabled(&self, vmpck_index: usize) -> bool {
        self.vmpck_disabled
            .get(vmpck_index)
            .copied()
            .unwrap_or(true)
    }

    fn disable_vmpck(&mut self, vmpck_index: usize) {
        if let Some(disabled) = self.vmpck_disabled.get_mut(vmpck_index) {
            log::error!("disabling VMPCK{}", vmpck_index);
            *disabled = true;
        }
    }
}

/// Copies the response out of the hypervisor-writable page before
/// validating and decrypting it.
fn read_response(
    page: &DmaBuffer<'_>,
    msg_type: SnpGuestRequestMsgType,
    vmpck: u8,
    key: &[u8; VMPCK_SIZE],
    expected_seqno: u64,
) -> Result<Vec<u8>, SevError> {
    let mut response = vec![0u8; PAGE_SIZE];
    page.read(0, &mut response)?;

    let (hdr, payload) = SnpGuestRequestMsgHdr::parse(&response)?;
    hdr.validate_response(msg_type, vmpck)?;
    Ok(open(&hdr, payload, key, expected_seqno)?)
}
