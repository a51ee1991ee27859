// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (C) 2023 IBM
//
// Author: Claudio Carvalho <cclaudio@linux.ibm.com>

//! AEAD seam used to seal and open guest request messages

pub mod aead {
    use crate::{greq::GreqError, sev::secrets_page::VMPCK_SIZE};

    /// AES-GCM tag length; the message header reserves 32 bytes for it
    pub const AUTHTAG_SIZE: usize = 16;
    /// 96-bit nonce, taken from the low bytes of the message sequence field
    pub const IV_SIZE: usize = 12;
    /// VMPCKs are AES-256 keys
    pub const KEY_SIZE: usize = VMPCK_SIZE;

    /// AES-256-GCM as used by the `SNP_GUEST_REQUEST` envelope.
    pub trait Aes256GcmTrait {
        /// Seals `inbuf` into `outbuf` as ciphertext followed by the tag.
        /// `outbuf` must hold `inbuf.len() + AUTHTAG_SIZE` bytes, otherwise
        /// [`GreqError::InvalidParameter`] is returned. Returns the number of
        /// bytes written.
        fn encrypt(
            iv: &[u8; IV_SIZE],
            key: &[u8; KEY_SIZE],
            aad: &[u8],
            inbuf: &[u8],
            outbuf: &mut [u8],
        ) -> Result<usize, GreqError>;

        /// Opens `inbuf`, ciphertext followed by the tag, into `outbuf`.
        /// Nothing is written on [`GreqError::Crypto`].
        fn decrypt(
            iv: &[u8; IV_SIZE],
            key: &[u8; KEY_SIZE],
            aad: &[u8],
            inbuf: &[u8],
            outbuf: &mut [u8],
        ) -> Result<usize, GreqError>;
    }

    #[derive(Copy, Clone, Debug)]
    pub struct Aes256Gcm;
}

pub mod rustcrypto;
