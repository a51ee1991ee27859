// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Nicolai Stange <nstange@suse.de>

//! Guest side of the AMD SEV-ES/SEV-SNP guest-hypervisor communication
//! channel: the GHCB protocol, encrypted `SNP_GUEST_REQUEST` messages, page
//! state changes and the firmware secrets page.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address;
pub mod cpu;
pub mod crypto;
pub mod error;
pub mod greq;
pub mod locking;
pub mod mm;
pub mod platform;
pub mod sev;
pub mod types;
pub mod utils;

pub use error::{ErrorClass, SevError};

#[test]
fn test_nop() {}

// Utilities for test configurations.
#[cfg(test)]
pub mod testutils;
