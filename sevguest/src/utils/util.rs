// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::types::{PAGE_SHIFT, PAGE_SIZE};
use core::ops::{Add, BitAnd, Not, Sub};

pub fn align_up<T>(addr: T, align: T) -> T
where
    T: Add<Output = T> + Sub<Output = T> + BitAnd<Output = T> + Not<Output = T> + From<u8> + Copy,
{
    let mask: T = align - T::from(1u8);
    (addr + mask) & !mask
}

pub fn page_align_up(x: usize) -> usize {
    align_up(x, PAGE_SIZE)
}

/// Number of 4KiB pages backing `len` bytes. An empty buffer still takes a
/// page.
pub fn pages_for(len: usize) -> usize {
    page_align_up(len.max(1)) >> PAGE_SHIFT
}
