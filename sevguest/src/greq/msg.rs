// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (C) 2023 IBM
//
// Author: Claudio Carvalho <cclaudio@linux.ibm.com>

//! Message envelope that carries an encrypted `SNP_GUEST_REQUEST` command

use core::mem::{offset_of, size_of};

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    crypto::aead::{Aes256Gcm, Aes256GcmTrait, AUTHTAG_SIZE, IV_SIZE},
    greq::GreqError,
    sev::secrets_page::VMPCK_SIZE,
    types::PAGE_SIZE,
};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Version of the message header
const HDR_VERSION: u8 = 1;
/// Version of the message payload
pub const MSG_VERSION: u8 = 1;

/// AEAD Algorithm Encodings (AMD SEV-SNP spec. table 99)
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub enum SnpGuestRequestAead {
    Invalid = 0,
    Aes256Gcm = 1,
}

/// Message Type Encodings (AMD SEV-SNP spec. table 100)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SnpGuestRequestMsgType {
    Invalid = 0,
    KeyRequest = 3,
    KeyResponse = 4,
    ReportRequest = 5,
    ReportResponse = 6,
    TscInfoRequest = 17,
    TscInfoResponse = 18,
}

impl SnpGuestRequestMsgType {
    /// Type the PSP answers a request of this type with.
    pub fn response(self) -> Self {
        match self {
            Self::KeyRequest => Self::KeyResponse,
            Self::ReportRequest => Self::ReportResponse,
            Self::TscInfoRequest => Self::TscInfoResponse,
            _ => Self::Invalid,
        }
    }
}

impl TryFrom<u8> for SnpGuestRequestMsgType {
    type Error = GreqError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Invalid),
            3 => Ok(Self::KeyRequest),
            4 => Ok(Self::KeyResponse),
            5 => Ok(Self::ReportRequest),
            6 => Ok(Self::ReportResponse),
            17 => Ok(Self::TscInfoRequest),
            18 => Ok(Self::TscInfoResponse),
            _ => Err(GreqError::InvalidHeader),
        }
    }
}

/// Message header size
pub const MSG_HDR_SIZE: usize = size_of::<SnpGuestRequestMsgHdr>();
/// Largest payload that fits a message page next to the header and the tag
pub const MSG_PAYLOAD_SIZE: usize = PAGE_SIZE - MSG_HDR_SIZE - AUTHTAG_SIZE;

/// Offset of the first header byte covered by the AAD
const AAD_OFFSET: usize = offset_of!(SnpGuestRequestMsgHdr, algo);

/// `SNP_GUEST_REQUEST` message header format (AMD SEV-SNP spec. table 98)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SnpGuestRequestMsgHdr {
    /// Message authentication tag
    authtag: [u8; 32],
    /// The sequence number for this message
    msg_seqno: u64,
    /// Reserve. Must be zero.
    rsvd1: [u8; 8],
    /// The AEAD used to encrypt this message
    algo: u8,
    /// The version of the message header
    hdr_version: u8,
    /// The size of the message header in bytes
    hdr_sz: u16,
    /// The type of the payload
    msg_type: u8,
    /// The version of the payload
    msg_version: u8,
    /// The size of the payload in bytes
    msg_sz: u16,
    /// Reserved. Must be zero.
    rsvd2: u32,
    /// The ID of the VMPCK used to protect this message
    msg_vmpck: u8,
    /// Reserved. Must be zero.
    rsvd3: [u8; 35],
}

const _: () = assert!(MSG_HDR_SIZE == 96);

impl SnpGuestRequestMsgHdr {
    /// Creates a header for a request of `msg_type` protected by the VMPCK
    /// with index `msg_vmpck`. Sequence number and payload size are filled
    /// in by [`seal`].
    pub fn new(msg_type: SnpGuestRequestMsgType, msg_vmpck: u8) -> Self {
        Self {
            algo: SnpGuestRequestAead::Aes256Gcm as u8,
            hdr_version: HDR_VERSION,
            hdr_sz: MSG_HDR_SIZE as u16,
            msg_type: msg_type as u8,
            msg_version: MSG_VERSION,
            msg_vmpck,
            ..Default::default()
        }
    }

    /// Parses a header from the start of `buf`, returning it along with
    /// the bytes following it.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8]), GreqError> {
        let (hdr, rest) =
            Self::read_from_prefix(buf).map_err(|_| GreqError::InvalidResponseSize)?;
        if hdr.hdr_version != HDR_VERSION
            || usize::from(hdr.hdr_sz) != MSG_HDR_SIZE
            || hdr.algo != SnpGuestRequestAead::Aes256Gcm as u8
        {
            return Err(GreqError::InvalidHeader);
        }
        Ok((hdr, rest))
    }

    pub fn seqno(&self) -> u64 {
        self.msg_seqno
    }

    pub fn msg_type(&self) -> Result<SnpGuestRequestMsgType, GreqError> {
        SnpGuestRequestMsgType::try_from(self.msg_type)
    }

    pub fn msg_version(&self) -> u8 {
        self.msg_version
    }

    pub fn msg_vmpck(&self) -> u8 {
        self.msg_vmpck
    }

    pub fn msg_sz(&self) -> usize {
        usize::from(self.msg_sz)
    }

    /// Checks that a response header answers a request of type
    /// `request` protected by the VMPCK `vmpck`.
    pub fn validate_response(
        &self,
        request: SnpGuestRequestMsgType,
        vmpck: u8,
    ) -> Result<(), GreqError> {
        if self.msg_type()? != request.response()
            || self.msg_version != MSG_VERSION
            || self.msg_vmpck != vmpck
        {
            return Err(GreqError::InvalidHeader);
        }
        Ok(())
    }

    /// Header fields used as additional authenticated data (AAD)
    fn aad(&self) -> &[u8] {
        &self.as_bytes()[AAD_OFFSET..]
    }

    fn authtag(&self) -> [u8; AUTHTAG_SIZE] {
        let mut tag = [0u8; AUTHTAG_SIZE];
        tag.copy_from_slice(&self.authtag[..AUTHTAG_SIZE]);
        tag
    }
}

impl Default for SnpGuestRequestMsgHdr {
    /// `rsvd3: [u8; 35]` is too large for `#[derive(Default)]`.
    fn default() -> Self {
        Self {
            authtag: [0; 32],
            msg_seqno: 0,
            rsvd1: [0; 8],
            algo: 0,
            hdr_version: 0,
            hdr_sz: 0,
            msg_type: 0,
            msg_version: 0,
            msg_sz: 0,
            rsvd2: 0,
            msg_vmpck: 0,
            rsvd3: [0; 35],
        }
    }
}

/// Build the initialization vector for AES-256 GCM: the first 12 bytes of
/// the little endian 128-bit sequence field.
fn build_iv(msg_seqno: u64) -> [u8; IV_SIZE] {
    const U64_SIZE: usize = size_of::<u64>();
    let mut iv = [0u8; IV_SIZE];

    iv[..U64_SIZE].copy_from_slice(&msg_seqno.to_le_bytes());
    iv
}

/// Encrypts `plaintext` under `key` with sequence number `seqno` and returns
/// the complete message: header followed by the ciphertext. The
/// authentication tag is moved into the header.
///
/// `hdr` is updated with the sequence number, the payload size and the tag.
pub fn seal(
    hdr: &mut SnpGuestRequestMsgHdr,
    seqno: u64,
    plaintext: &[u8],
    key: &[u8; VMPCK_SIZE],
) -> Result<Vec<u8>, GreqError> {
    if plaintext.len() > MSG_PAYLOAD_SIZE {
        return Err(GreqError::InvalidParameter);
    }
    hdr.msg_sz = u16::try_from(plaintext.len()).map_err(|_| GreqError::InvalidParameter)?;
    hdr.msg_seqno = seqno;
    hdr.authtag = [0; 32];

    let iv = build_iv(seqno);
    let mut ciphertext = vec![0u8; plaintext.len() + AUTHTAG_SIZE];
    let len = Aes256Gcm::encrypt(&iv, key, hdr.aad(), plaintext, &mut ciphertext)?;
    if len != ciphertext.len() {
        return Err(GreqError::Crypto);
    }

    // The AEAD API appends the tag to the ciphertext
    let tag = ciphertext.split_off(plaintext.len());
    hdr.authtag[..AUTHTAG_SIZE].copy_from_slice(&tag);

    let mut msg = Vec::with_capacity(MSG_HDR_SIZE + ciphertext.len());
    msg.extend_from_slice(hdr.as_bytes());
    msg.extend_from_slice(&ciphertext);
    Ok(msg)
}

/// Authenticates and decrypts the payload of a message whose header is
/// `hdr`. `ciphertext` holds the bytes following the header and may be
/// longer than the payload.
///
/// Fails without decrypting when the header does not carry
/// `expected_seqno`. No plaintext is returned on tag failure.
pub fn open(
    hdr: &SnpGuestRequestMsgHdr,
    ciphertext: &[u8],
    key: &[u8; VMPCK_SIZE],
    expected_seqno: u64,
) -> Result<Vec<u8>, GreqError> {
    let found = hdr.seqno();
    if found != expected_seqno {
        return Err(GreqError::SequenceMismatch {
            expected: expected_seqno,
            found,
        });
    }

    let payload = ciphertext
        .get(..hdr.msg_sz())
        .ok_or(GreqError::InvalidResponseSize)?;

    let mut aad_hdr = *hdr;
    aad_hdr.authtag = [0; 32];

    let mut inbuf = Vec::with_capacity(payload.len() + AUTHTAG_SIZE);
    inbuf.extend_from_slice(payload);
    inbuf.extend_from_slice(&hdr.authtag());

    let iv = build_iv(expected_seqno);
    let mut plaintext = vec![0u8; payload.len()];
    let len = Aes256Gcm::decrypt(&iv, key, aad_hdr.aad(), &inbuf, &mut plaintext)?;
    plaintext.truncate(len);
    Ok(plaintext)
}
