// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (C) 2023 IBM
//
// Author: Claudio Carvalho <cclaudio@linux.ibm.com>

//! API to send `SNP_GUEST_REQUEST` commands to the PSP

use zerocopy::IntoBytes;

use crate::{
    error::SevError,
    greq::{
        msg::SnpGuestRequestMsgType,
        pld_key::{SnpKeyRequest, SnpKeyResponse, DERIVED_KEY_SIZE},
        pld_report::{AttestationReport, SnpReportRequest, SnpReportResponse},
        pld_tsc::{SnpTscInfo, TSC_INFO_REQ_SIZE},
        GreqError,
    },
    sev::{ghcb::Ghcb, secrets_page::VMPCK_SIZE},
};

/// Requests an attestation report bound to `data` (at most 64 bytes, zero
/// padded) from the PSP.
///
/// The request is protected by `key`, the VMPCK with index `index`, and
/// the report is generated for VMPL `index`. Fails with
/// [`GreqError::UnsupportedReportVersion`] on a report format other than
/// version 5.
pub fn get_attestation_report(
    ghcb: &mut Ghcb<'_>,
    data: &[u8],
    key: &[u8; VMPCK_SIZE],
    index: usize,
) -> Result<AttestationReport, SevError> {
    let vmpl = u32::try_from(index).map_err(|_| GreqError::InvalidVmpckIndex(index))?;
    let request = SnpReportRequest::new(data, vmpl)?;
    let response = ghcb.guest_request(
        index,
        key,
        request.as_bytes(),
        SnpGuestRequestMsgType::ReportRequest,
    )?;
    Ok(*SnpReportResponse::parse(&response)?.report())
}

/// Derives a key from the platform root keys as described by `request`.
pub fn derive_key(
    ghcb: &mut Ghcb<'_>,
    request: &SnpKeyRequest,
    key: &[u8; VMPCK_SIZE],
    index: usize,
) -> Result<[u8; DERIVED_KEY_SIZE], SevError> {
    let response = ghcb.guest_request(
        index,
        key,
        request.as_bytes(),
        SnpGuestRequestMsgType::KeyRequest,
    )?;
    Ok(SnpKeyResponse::parse(&response)?.derived_key())
}

/// Queries the Secure TSC scale and offset applied to the guest.
pub fn tsc_info(
    ghcb: &mut Ghcb<'_>,
    key: &[u8; VMPCK_SIZE],
    index: usize,
) -> Result<SnpTscInfo, SevError> {
    let request = [0u8; TSC_INFO_REQ_SIZE];
    let response =
        ghcb.guest_request(index, key, &request, SnpGuestRequestMsgType::TscInfoRequest)?;
    Ok(SnpTscInfo::parse(&response)?)
}
