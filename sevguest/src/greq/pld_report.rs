// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

//! `SNP_GUEST_REQUEST` command to request an attestation report.

use core::mem::size_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::greq::GreqError;

/// Size of the `SnpReportRequest.user_data`
pub const USER_DATA_SIZE: usize = 64;

/// Attestation report format this crate understands
pub const REPORT_VERSION: u32 = 5;

/// MSG_REPORT_REQ payload format (AMD SEV-SNP firmware ABI, table 22)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SnpReportRequest {
    /// Guest-provided data to be included in the attestation report
    /// REPORT_DATA (512 bits)
    user_data: [u8; USER_DATA_SIZE],
    /// The VMPL to put in the attestation report
    vmpl: u32,
    /// 00b: VLEK if installed, VCEK otherwise. 01b: VCEK. 10b: VLEK.
    key_sel: u32,
    /// Reserved, must be zero
    rsvd: [u8; 24],
}

impl SnpReportRequest {
    /// Builds a request for a report bound to `user_data` at `vmpl`.
    /// `user_data` shorter than 64 bytes is zero padded.
    pub fn new(user_data: &[u8], vmpl: u32) -> Result<Self, GreqError> {
        let mut data = [0u8; USER_DATA_SIZE];
        data.get_mut(..user_data.len())
            .ok_or(GreqError::InvalidParameter)?
            .copy_from_slice(user_data);
        Ok(Self {
            user_data: data,
            vmpl,
            key_sel: 0,
            rsvd: [0; 24],
        })
    }
}

/// MSG_REPORT_RSP payload format (AMD SEV-SNP firmware ABI, table 25)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SnpReportResponse {
    /// Firmware status, see [`SnpReportResponseStatus`]
    status: u32,
    /// Size in bytes of the report
    report_size: u32,
    reserved_08: [u8; 24],
    report: AttestationReport,
}

/// Possible status values of a [`SnpReportResponse`]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnpReportResponseStatus {
    Success = 0,
    InvalidParameters = 0x16,
    InvalidKeySelection = 0x27,
}

impl SnpReportResponse {
    /// Parses a decrypted MSG_REPORT_RSP payload, failing on a non-zero
    /// status or on a report version other than [`REPORT_VERSION`].
    pub fn parse(buf: &[u8]) -> Result<Self, GreqError> {
        let (rsp, _) = Self::read_from_prefix(buf).map_err(|_| GreqError::InvalidResponseSize)?;
        let status = rsp.status;
        if status != SnpReportResponseStatus::Success as u32 {
            log::error!("attestation report request failed, status {:#x}", status);
            return Err(GreqError::RequestError(status));
        }
        if usize::try_from(rsp.report_size).ok() != Some(size_of::<AttestationReport>()) {
            return Err(GreqError::InvalidResponseSize);
        }
        let version = rsp.report.version();
        if version != REPORT_VERSION {
            log::warn!("unsupported attestation report version {}", version);
            return Err(GreqError::UnsupportedReportVersion(version));
        }
        Ok(rsp)
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    pub fn report(&self) -> &AttestationReport {
        &self.report
    }
}

/// The `TCB_VERSION` contains the security version numbers of each
/// component in the trusted computing base (TCB) of the SNP firmware.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcbVersion {
    raw: u64,
}

impl TcbVersion {
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// SVN of the PSP bootloader
    pub fn boot_loader(&self) -> u8 {
        self.raw.to_le_bytes()[0]
    }

    /// SVN of the PSP operating system
    pub fn tee(&self) -> u8 {
        self.raw.to_le_bytes()[1]
    }

    /// SVN of the SNP firmware
    pub fn snp(&self) -> u8 {
        self.raw.to_le_bytes()[6]
    }

    /// Lowest current patch level of all cores
    pub fn microcode(&self) -> u8 {
        self.raw.to_le_bytes()[7]
    }
}

/// ATTESTATION_REPORT structure, version 5 (AMD SEV-SNP firmware ABI,
/// table 23). The report is signed with ECDSA P-384 over bytes
/// `0..0x2a0`.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AttestationReport {
    version: u32,
    guest_svn: u32,
    policy: u64,
    family_id: [u8; 16],
    image_id: [u8; 16],
    vmpl: u32,
    signature_algo: u32,
    current_tcb: TcbVersion,
    platform_info: u64,
    signer_info: u32,
    reserved_04c: u32,
    report_data: [u8; USER_DATA_SIZE],
    measurement: [u8; 48],
    host_data: [u8; 32],
    id_key_digest: [u8; 48],
    author_key_digest: [u8; 48],
    report_id: [u8; 32],
    report_id_ma: [u8; 32],
    reported_tcb: TcbVersion,
    cpuid_fam_id: u8,
    cpuid_mod_id: u8,
    cpuid_step: u8,
    reserved_18b: [u8; 21],
    chip_id: [u8; 64],
    committed_tcb: TcbVersion,
    current_build: u8,
    current_minor: u8,
    current_major: u8,
    reserved_1eb: u8,
    committed_build: u8,
    committed_minor: u8,
    committed_major: u8,
    reserved_1ef: u8,
    launch_tcb: TcbVersion,
    launch_mit_vector: u64,
    current_mit_vector: u64,
    reserved_208: [u8; 152],
    signature: [u8; 512],
}

const _: () = assert!(size_of::<AttestationReport>() == 1184);

impl AttestationReport {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn guest_svn(&self) -> u32 {
        self.guest_svn
    }

    pub fn policy(&self) -> u64 {
        self.policy
    }

    pub fn vmpl(&self) -> u32 {
        self.vmpl
    }

    pub fn signature_algo(&self) -> u32 {
        self.signature_algo
    }

    pub fn current_tcb(&self) -> TcbVersion {
        self.current_tcb
    }

    pub fn reported_tcb(&self) -> TcbVersion {
        self.reported_tcb
    }

    pub fn committed_tcb(&self) -> TcbVersion {
        self.committed_tcb
    }

    pub fn launch_tcb(&self) -> TcbVersion {
        self.launch_tcb
    }

    pub fn platform_info(&self) -> u64 {
        self.platform_info
    }

    pub fn report_data(&self) -> &[u8; USER_DATA_SIZE] {
        &self.report_data
    }

    pub fn measurement(&self) -> &[u8; 48] {
        &self.measurement
    }

    pub fn host_data(&self) -> &[u8; 32] {
        &self.host_data
    }

    pub fn chip_id(&self) -> &[u8; 64] {
        &self.chip_id
    }

    /// CPUID family, model and stepping of the platform
    pub fn cpuid(&self) -> (u8, u8, u8) {
        (self.cpuid_fam_id, self.cpuid_mod_id, self.cpuid_step)
    }

    /// Firmware version as (major, minor, build)
    pub fn current_firmware(&self) -> (u8, u8, u8) {
        (self.current_major, self.current_minor, self.current_build)
    }

    pub fn launch_mit_vector(&self) -> u64 {
        self.launch_mit_vector
    }

    pub fn current_mit_vector(&self) -> u64 {
        self.current_mit_vector
    }

    pub fn signature(&self) -> &[u8; 512] {
        &self.signature
    }

    /// Raw report bytes, as signed by the firmware
    pub fn bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}
