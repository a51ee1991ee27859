// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{Address, VirtAddr};
use crate::error::{ErrorClass, SevError};
use crate::types::{PAGE_SIZE, VMPL_MAX};

use alloc::boxed::Box;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const VMPCK_SIZE: usize = 32;

/// Secrets page format versions this crate can parse.
const SUPPORTED_VERSIONS: [u32; 3] = [2, 3, 4];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretsError {
    // The secrets page is used before init()
    NotInitialized,
    // Null or unaligned secrets page address
    InvalidAddress,
    // The mapping is smaller than a page
    InvalidSize,
    // VMPCK index outside of [0, VMPL_MAX)
    InvalidIndex(usize),
    // The firmware wrote a secrets page format we do not understand
    UnsupportedVersion(u32),
}

impl SecretsError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnsupportedVersion(_) => ErrorClass::Protocol,
            _ => ErrorClass::Configuration,
        }
    }
}

impl From<SecretsError> for SevError {
    fn from(e: SecretsError) -> Self {
        Self::Secrets(e)
    }
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct SecretsPage {
    version: u32,
    imien: u32,
    fms: u32,
    reserved_00c: u32,
    gosvw: [u8; 16],
    vmpck: [[u8; VMPCK_SIZE]; VMPL_MAX],
    reserved_0a0: [u8; 96],
    vmsa_tweak_bmp: [u64; 8],
    svsm_base: u64,
    svsm_size: u64,
    svsm_caa: u64,
    svsm_max_version: u32,
    svsm_guest_vmpl: u8,
    reserved_15d: [u8; 3],
    tsc_factor: u32,
    reserved_164: u32,
    launch_mit_vector: u64,
    reserved_170: [u8; 3728],
}

const _: () = assert!(core::mem::size_of::<SecretsPage>() == PAGE_SIZE);

impl SecretsPage {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fms(&self) -> u32 {
        self.fms
    }

    pub fn tsc_factor(&self) -> u32 {
        self.tsc_factor
    }

    pub fn launch_mit_vector(&self) -> u64 {
        self.launch_mit_vector
    }

    pub fn get_vmpck(&self, idx: usize) -> Result<[u8; VMPCK_SIZE], SecretsError> {
        self.vmpck
            .get(idx)
            .copied()
            .ok_or(SecretsError::InvalidIndex(idx))
    }

    pub fn is_vmpck_clear(&self, idx: usize) -> Result<bool, SecretsError> {
        Ok(self.get_vmpck(idx)?.iter().all(|e| *e == 0))
    }

    pub fn clear_vmpck(&mut self, idx: usize) -> Result<(), SecretsError> {
        self.vmpck
            .get_mut(idx)
            .ok_or(SecretsError::InvalidIndex(idx))?
            .fill(0);
        Ok(())
    }
}

/// Private copy of the firmware secrets page.
///
/// The page is copied once by [`SnpSecrets::init`]; afterwards every key is
/// served from the copy, and the firmware page itself is never read again.
#[derive(Debug, Default)]
pub struct SnpSecrets {
    page: Option<Box<SecretsPage>>,
}

impl SnpSecrets {
    pub const fn new() -> Self {
        Self { page: None }
    }

    /// Copies the secrets page mapped at `addr`.
    ///
    /// # Safety
    ///
    /// A non-null `addr` must point to at least `size` bytes of readable
    /// memory holding the secrets page.
    pub unsafe fn init(&mut self, addr: VirtAddr, size: usize) -> Result<(), SevError> {
        if addr.is_null() || !addr.is_page_aligned() {
            return Err(SecretsError::InvalidAddress.into());
        }
        if size < PAGE_SIZE {
            return Err(SecretsError::InvalidSize.into());
        }

        // SAFETY: the caller guarantees that at least `size` bytes, and thus
        // one page, are mapped at `addr`.
        let bytes = unsafe { core::slice::from_raw_parts(addr.as_ptr::<u8>(), PAGE_SIZE) };
        self.init_from_bytes(bytes)
    }

    /// Parses a secrets page from a copy already in private memory.
    pub fn init_from_bytes(&mut self, bytes: &[u8]) -> Result<(), SevError> {
        let (page, _) =
            SecretsPage::read_from_prefix(bytes).map_err(|_| SecretsError::InvalidSize)?;

        let version = page.version();
        if !SUPPORTED_VERSIONS.contains(&version) {
            log::error!("unsupported secrets page version {}", version);
            return Err(SecretsError::UnsupportedVersion(version).into());
        }

        log::debug!("secrets page version {} (fms {:#x})", version, page.fms());
        self.page = Some(Box::new(page));
        Ok(())
    }

    fn page(&self) -> Result<&SecretsPage, SecretsError> {
        self.page.as_deref().ok_or(SecretsError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.page.is_some()
    }

    pub fn version(&self) -> Result<u32, SevError> {
        Ok(self.page()?.version())
    }

    pub fn fms(&self) -> Result<u32, SevError> {
        Ok(self.page()?.fms())
    }

    pub fn tsc_factor(&self) -> Result<u32, SevError> {
        Ok(self.page()?.tsc_factor())
    }

    pub fn launch_mit_vector(&self) -> Result<u64, SevError> {
        Ok(self.page()?.launch_mit_vector())
    }

    /// Returns the VM private communication key for VMPL `idx`.
    pub fn vmpck(&self, idx: usize) -> Result<[u8; VMPCK_SIZE], SevError> {
        Ok(self.page()?.get_vmpck(idx)?)
    }

    pub fn is_vmpck_clear(&self, idx: usize) -> Result<bool, SevError> {
        Ok(self.page()?.is_vmpck_clear(idx)?)
    }

    /// Wipes VMPCK `idx` from the private copy, e.g. after the guest request
    /// session using it has been compromised.
    pub fn clear_vmpck(&mut self, idx: usize) -> Result<(), SevError> {
        let page = self.page.as_deref_mut().ok_or(SecretsError::NotInitialized)?;
        page.clear_vmpck(idx)?;
        log::warn!("VMPCK{} cleared", idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::TestMemory;
    use core::mem::offset_of;

    fn secrets_bytes(version: u32) -> [u8; PAGE_SIZE] {
        let mut bytes = [0u8; PAGE_SIZE];
        bytes[0..4].copy_from_slice(&version.to_le_bytes());
        bytes[8..12].copy_from_slice(&0x00a0_0f11u32.to_le_bytes());
        for (i, key) in bytes[0x20..0xa0].chunks_mut(VMPCK_SIZE).enumerate() {
            key.fill(0x10 + i as u8);
        }
        bytes[0x160..0x164].copy_from_slice(&7u32.to_le_bytes());
        bytes[0x168..0x170].copy_from_slice(&0x55u64.to_le_bytes());
        bytes
    }

    #[test]
    fn test_secrets_layout() {
        assert_eq!(offset_of!(SecretsPage, fms), 0x8);
        assert_eq!(offset_of!(SecretsPage, vmpck), 0x20);
        assert_eq!(offset_of!(SecretsPage, vmsa_tweak_bmp), 0x100);
        assert_eq!(offset_of!(SecretsPage, svsm_base), 0x140);
        assert_eq!(offset_of!(SecretsPage, tsc_factor), 0x160);
        assert_eq!(offset_of!(SecretsPage, launch_mit_vector), 0x168);
    }

    #[test]
    fn test_secrets_parse() {
        let mut secrets = SnpSecrets::new();
        secrets.init_from_bytes(&secrets_bytes(4)).unwrap();
        assert_eq!(secrets.version().unwrap(), 4);
        assert_eq!(secrets.fms().unwrap(), 0x00a0_0f11);
        assert_eq!(secrets.tsc_factor().unwrap(), 7);
        assert_eq!(secrets.launch_mit_vector().unwrap(), 0x55);
        for idx in 0..VMPL_MAX {
            assert_eq!(secrets.vmpck(idx).unwrap(), [0x10 + idx as u8; VMPCK_SIZE]);
        }
    }

    #[test]
    fn test_vmpck_idempotent() {
        let mem = TestMemory::new(1);
        mem.write(0, &secrets_bytes(3));
        let mut secrets = SnpSecrets::new();
        // SAFETY: the test memory holds one mapped page.
        unsafe { secrets.init(mem.vaddr(), mem.size()).unwrap() };

        let first = secrets.vmpck(1).unwrap();
        // The firmware page is not read again
        mem.write(0x40, &[0xff; VMPCK_SIZE]);
        assert_eq!(secrets.vmpck(1).unwrap(), first);
        assert_eq!(secrets.vmpck(1).unwrap(), [0x11; VMPCK_SIZE]);
    }

    #[test]
    fn test_secrets_errors() {
        let mut secrets = SnpSecrets::new();
        assert_eq!(
            secrets.vmpck(0).unwrap_err(),
            SevError::Secrets(SecretsError::NotInitialized)
        );
        // SAFETY: invalid addresses are rejected before any access.
        let err = unsafe { secrets.init(VirtAddr::null(), PAGE_SIZE).unwrap_err() };
        assert_eq!(err, SevError::Secrets(SecretsError::InvalidAddress));
        assert_eq!(err.class(), ErrorClass::Configuration);
        // SAFETY: invalid addresses are rejected before any access.
        let err = unsafe { secrets.init(VirtAddr::new(0x1000), 100).unwrap_err() };
        assert_eq!(err, SevError::Secrets(SecretsError::InvalidSize));
        // SAFETY: invalid addresses are rejected before any access.
        let err = unsafe { secrets.init(VirtAddr::new(0x1008), PAGE_SIZE).unwrap_err() };
        assert_eq!(err, SevError::Secrets(SecretsError::InvalidAddress));
        assert!(!secrets.is_initialized());

        let err = secrets.init_from_bytes(&secrets_bytes(1)).unwrap_err();
        assert_eq!(err, SevError::Secrets(SecretsError::UnsupportedVersion(1)));
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(!secrets.is_initialized());

        secrets.init_from_bytes(&secrets_bytes(2)).unwrap();
        assert_eq!(
            secrets.vmpck(4).unwrap_err(),
            SevError::Secrets(SecretsError::InvalidIndex(4))
        );
    }

    #[test]
    fn test_clear_vmpck() {
        let mut secrets = SnpSecrets::new();
        secrets.init_from_bytes(&secrets_bytes(4)).unwrap();
        assert!(!secrets.is_vmpck_clear(2).unwrap());
        secrets.clear_vmpck(2).unwrap();
        assert!(secrets.is_vmpck_clear(2).unwrap());
        assert_eq!(secrets.vmpck(2).unwrap(), [0; VMPCK_SIZE]);
        assert!(!secrets.is_vmpck_clear(1).unwrap());
        assert_eq!(
            secrets.clear_vmpck(VMPL_MAX).unwrap_err(),
            SevError::Secrets(SecretsError::InvalidIndex(VMPL_MAX))
        );
    }

    #[test]
    fn test_page_vmpck_index_checked() {
        let (mut page, _) = SecretsPage::read_from_prefix(&secrets_bytes(4)[..]).unwrap();
        assert_eq!(page.get_vmpck(3).unwrap(), [0x13; VMPCK_SIZE]);
        assert_eq!(page.get_vmpck(4), Err(SecretsError::InvalidIndex(4)));
        assert_eq!(page.is_vmpck_clear(9), Err(SecretsError::InvalidIndex(9)));
        assert_eq!(page.clear_vmpck(4), Err(SecretsError::InvalidIndex(4)));
        page.clear_vmpck(3).unwrap();
        assert_eq!(page.is_vmpck_clear(3), Ok(true));
    }
}
