// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

pub mod ghcb;
pub mod msr_protocol;
pub mod psc;
pub mod secrets_page;
pub mod status;

pub mod utils;

pub use ghcb::{Ghcb, GhcbError, GHCBExitCode};
pub use msr_protocol::{hypervisor_ghcb_features, verify_ghcb_version, GhcbMsrError};
pub use psc::PscError;
pub use secrets_page::{SecretsError, SecretsPage, SnpSecrets, VMPCK_SIZE};
pub use status::{sev_status, SEVStatusFlags};
pub use utils::{pvalidate, PvalidateOp, SevSnpError};
