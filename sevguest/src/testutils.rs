// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 The sevguest Authors

//! Simulated hardware for unit tests: heap-backed "guest physical" memory and
//! a hypervisor that answers GHCB exits, MSR protocol requests and guest
//! requests (playing the PSP as well).

use crate::address::{PhysAddr, VirtAddr};
use crate::cpu::msr::SEV_GHCB;
use crate::greq::msg::{open, seal, SnpGuestRequestMsgHdr};
use crate::mm::DmaRegion;
use crate::platform::SevPlatform;
use crate::sev::msr_protocol::{GHCBHvFeatures, GHCBMsr};
use crate::sev::{PvalidateOp, VMPCK_SIZE};
use crate::types::{PageSize, PAGE_SIZE, VMPL_MAX};

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fake guest physical addresses handed out to [`TestMemory`] instances, so
/// that physical and virtual addresses never coincide.
static NEXT_FAKE_PADDR: AtomicUsize = AtomicUsize::new(0x10_0000_0000);

const GHCB_RAX: usize = 0x1f8;
const GHCB_RDX: usize = 0x310;
const GHCB_EXIT_CODE: usize = 0x390;
const GHCB_EXIT_INFO_1: usize = 0x398;
const GHCB_EXIT_INFO_2: usize = 0x3a0;
const GHCB_SCRATCH: usize = 0x3a8;
const GHCB_VALID_BITMAP: usize = 0x3f0;
const GHCB_BUFFER: usize = 0x800;
const GHCB_VERSION: usize = 0xffa;
const GHCB_USAGE: usize = 0xffc;

const EXIT_RDTSC: u64 = 0x6e;
const EXIT_SNP_PSC: u64 = 0x8000_0010;
const EXIT_GUEST_REQUEST: u64 = 0x8000_0011;

fn bitmap_pos(offset: usize) -> (usize, u64) {
    ((offset >> 9) & 1, 1u64 << ((offset >> 3) & 0x3f))
}

/// Page aligned, zeroed heap memory posing as guest memory at a fake
/// physical address.
#[derive(Debug)]
pub struct TestMemory {
    ptr: NonNull<u8>,
    layout: Layout,
    paddr: PhysAddr,
}

impl TestMemory {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("out of memory");
        let paddr = NEXT_FAKE_PADDR.fetch_add(0x1000_0000, Ordering::Relaxed);
        Self {
            ptr,
            layout,
            paddr: PhysAddr::new(paddr),
        }
    }

    pub fn vaddr(&self) -> VirtAddr {
        VirtAddr::from(self.ptr.as_ptr())
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// A DMA region covering the whole memory.
    pub fn region(&self) -> DmaRegion {
        // SAFETY: the memory is owned by self and outlives the region in
        // every test.
        unsafe { DmaRegion::new(self.vaddr(), self.paddr(), self.size()) }.unwrap()
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size());
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    fn window(&self) -> MemWindow {
        MemWindow {
            vaddr: self.ptr.as_ptr() as usize,
            paddr: self.paddr.into(),
            size: self.size(),
        }
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// The part of [`TestMemory`] the simulated hypervisor can reach through
/// guest physical addresses.
#[derive(Clone, Copy, Debug)]
struct MemWindow {
    vaddr: usize,
    paddr: usize,
    size: usize,
}

impl MemWindow {
    fn translate(&self, gpa: u64, len: usize) -> Option<*mut u8> {
        let gpa = usize::try_from(gpa).ok()?;
        let off = gpa.checked_sub(self.paddr)?;
        (off.checked_add(len)? <= self.size).then(|| (self.vaddr + off) as *mut u8)
    }

    fn read(&self, gpa: u64, out: &mut [u8]) -> bool {
        let Some(src) = self.translate(gpa, out.len()) else {
            return false;
        };
        // SAFETY: translate() checked the bounds.
        unsafe { ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        true
    }

    fn write(&self, gpa: u64, data: &[u8]) -> bool {
        let Some(dst) = self.translate(gpa, data.len()) else {
            return false;
        };
        // SAFETY: translate() checked the bounds.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        true
    }
}

/// A GHCB page as seen by the hypervisor.
struct GhcbView(*mut u8);

impl GhcbView {
    fn u64_at(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: the view covers a whole page and every offset used is
        // naturally aligned.
        unsafe { AtomicU64::from_ptr(self.0.add(offset).cast()) }
    }

    fn get(&self, offset: usize) -> u64 {
        self.u64_at(offset).load(Ordering::Relaxed)
    }

    fn set(&self, offset: usize, val: u64) {
        self.u64_at(offset).store(val, Ordering::Relaxed);
    }

    fn set_valid(&self, offset: usize, val: u64) {
        self.set(offset, val);
        let (index, mask) = bitmap_pos(offset);
        self.u64_at(GHCB_VALID_BITMAP + index * 8)
            .fetch_or(mask, Ordering::Relaxed);
    }

    fn version(&self) -> u16 {
        // SAFETY: see u64_at().
        unsafe { AtomicU16::from_ptr(self.0.add(GHCB_VERSION).cast()) }.load(Ordering::Relaxed)
    }

    fn usage(&self) -> u32 {
        // SAFETY: see u64_at().
        unsafe { AtomicU32::from_ptr(self.0.add(GHCB_USAGE).cast()) }.load(Ordering::Relaxed)
    }

    fn psc_header(&self) -> (u16, u16) {
        let raw = self.get(GHCB_BUFFER);
        ((raw & 0xffff) as u16, ((raw >> 16) & 0xffff) as u16)
    }
}

/// One `VMGEXIT` through a GHCB page, captured before the hypervisor wrote
/// its response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    /// GHCB MSR value at the time of the exit
    pub msr: u64,
    pub exit_code: u64,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub scratch: u64,
    pub valid_bitmap: [u64; 2],
    pub version: u16,
    pub usage: u32,
    /// `(cur_entry, end_entry)` of a page state change request
    pub psc_header: (u16, u16),
    pub psc_entries: Vec<u64>,
}

impl ExitRecord {
    pub fn is_valid(&self, offset: usize) -> bool {
        let (index, mask) = bitmap_pos(offset);
        self.valid_bitmap[index] & mask != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Exit(ExitRecord),
    Pvalidate {
        vaddr: VirtAddr,
        size: PageSize,
        op: PvalidateOp,
    },
    MsrPsc {
        gpa: PhysAddr,
        private: bool,
    },
}

/// How the simulated PSP answers guest requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PspBehavior {
    #[default]
    Normal,
    /// Answers with the sequence number of the request
    ReplaySequence,
    /// Flips a bit of the authentication tag
    CorruptPayload,
    /// Answers with the request message type
    WrongType,
}

#[derive(Debug)]
struct MockState {
    msrs: HashMap<u32, u64>,
    sev_info: (u16, u16, u8),
    hv_features: GHCBHvFeatures,
    registered_gpa: Option<PhysAddr>,
    corrupt_msr: bool,
    events: Vec<Event>,
    exit_response: (Option<u64>, u64, u64),
    tsc: u64,
    psc_progress: Option<u16>,
    pvalidate_result: u64,
    psp_keys: [Option<[u8; VMPCK_SIZE]>; VMPL_MAX],
    psp_response: Vec<u8>,
    psp_behavior: PspBehavior,
    psp_requests: Vec<(usize, Vec<u8>)>,
}

/// A hypervisor, and the PSP behind it, implementing [`SevPlatform`].
#[derive(Debug)]
pub struct MockHypervisor {
    mem: Option<MemWindow>,
    state: Mutex<MockState>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            mem: None,
            state: Mutex::new(MockState {
                msrs: HashMap::new(),
                sev_info: (1, 2, 51),
                hv_features: GHCBHvFeatures::SEV_SNP,
                registered_gpa: None,
                corrupt_msr: false,
                events: Vec::new(),
                exit_response: (None, 0, 0),
                tsc: 0,
                psc_progress: None,
                pvalidate_result: 0,
                psp_keys: [None; VMPL_MAX],
                psp_response: Vec::new(),
                psp_behavior: PspBehavior::Normal,
                psp_requests: Vec::new(),
            }),
        }
    }

    /// A hypervisor that can access `mem` through its guest physical
    /// addresses.
    pub fn with_memory(mem: &TestMemory) -> Self {
        Self {
            mem: Some(mem.window()),
            ..Self::new()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_msr(&self, msr: u32, val: u64) {
        self.state().msrs.insert(msr, val);
    }

    pub fn set_sev_info(&self, min: u16, max: u16, c_bit: u8) {
        self.state().sev_info = (min, max, c_bit);
    }

    pub fn set_hv_features(&self, features: GHCBHvFeatures) {
        self.state().hv_features = features;
    }

    pub fn registered_gpa(&self) -> Option<PhysAddr> {
        self.state().registered_gpa
    }

    /// Makes every GPA registration and MSR page state change answer with
    /// wrong data.
    pub fn corrupt_msr_responses(&self, corrupt: bool) {
        self.state().corrupt_msr = corrupt;
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn exits(&self) -> Vec<ExitRecord> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Exit(rec) => Some(rec.clone()),
                _ => None,
            })
            .collect()
    }

    /// Overrides the echoed exit code (when `Some`) and the exit information
    /// returned by every following GHCB exit.
    pub fn set_exit_response(&self, exit_code: Option<u64>, info1: u64, info2: u64) {
        self.state().exit_response = (exit_code, info1, info2);
    }

    pub fn set_tsc(&self, tsc: u64) {
        self.state().tsc = tsc;
    }

    /// `cur_entry` reported back for page state changes. By default every
    /// entry is processed.
    pub fn set_psc_progress(&self, cur_entry: Option<u16>) {
        self.state().psc_progress = cur_entry;
    }

    pub fn set_pvalidate_result(&self, ret: u64) {
        self.state().pvalidate_result = ret;
    }

    pub fn set_psp_key(&self, index: usize, key: [u8; VMPCK_SIZE]) {
        self.state().psp_keys[index] = Some(key);
    }

    pub fn set_psp_response(&self, payload: &[u8]) {
        self.state().psp_response = payload.to_vec();
    }

    pub fn set_psp_behavior(&self, behavior: PspBehavior) {
        self.state().psp_behavior = behavior;
    }

    /// Decrypted requests received by the PSP, with their VMPCK index.
    pub fn psp_requests(&self) -> Vec<(usize, Vec<u8>)> {
        self.state().psp_requests.clone()
    }

    fn msr_protocol(&self, st: &mut MockState, request: u64) -> u64 {
        match request & 0xfff {
            GHCBMsr::SEV_INFO_REQ => {
                let (min, max, c_bit) = st.sev_info;
                (u64::from(max) << 48)
                    | (u64::from(min) << 32)
                    | (u64::from(c_bit) << 24)
                    | GHCBMsr::SEV_INFO_RESP
            }
            GHCBMsr::SNP_REG_GHCB_GPA_REQ => {
                let gpa = request & !0xfff;
                st.registered_gpa = Some(PhysAddr::from(gpa));
                let data = if st.corrupt_msr { gpa + 0x1000 } else { gpa };
                data | GHCBMsr::SNP_REG_GHCB_GPA_RESP
            }
            GHCBMsr::SNP_STATE_CHANGE_REQ => {
                let gpa = PhysAddr::from(request & 0x000f_ffff_ffff_f000);
                let private = (request >> 52) & 0xf == 1;
                st.events.push(Event::MsrPsc { gpa, private });
                let err = if st.corrupt_msr { 1u64 << 32 } else { 0 };
                err | GHCBMsr::SNP_STATE_CHANGE_RESP
            }
            GHCBMsr::SNP_HV_FEATURES_REQ => {
                (st.hv_features.bits() << 12) | GHCBMsr::SNP_HV_FEATURES_RESP
            }
            _ => 0,
        }
    }

    fn ghcb_exit(&self, st: &mut MockState, gpa: u64) {
        let Some(mem) = self.mem else {
            return;
        };
        let Some(page) = mem.translate(gpa, PAGE_SIZE) else {
            return;
        };
        let ghcb = GhcbView(page);

        let exit_code = ghcb.get(GHCB_EXIT_CODE);
        let (psc_header, psc_entries) = if exit_code == EXIT_SNP_PSC {
            let (cur, end) = ghcb.psc_header();
            let count = (usize::from(end) + 1).min(253);
            let entries = (0..count)
                .map(|i| ghcb.get(GHCB_BUFFER + 8 + i * 8))
                .collect();
            ((cur, end), entries)
        } else {
            ((0, 0), Vec::new())
        };
        let record = ExitRecord {
            msr: gpa,
            exit_code,
            exit_info_1: ghcb.get(GHCB_EXIT_INFO_1),
            exit_info_2: ghcb.get(GHCB_EXIT_INFO_2),
            scratch: ghcb.get(GHCB_SCRATCH),
            valid_bitmap: [
                ghcb.get(GHCB_VALID_BITMAP),
                ghcb.get(GHCB_VALID_BITMAP + 8),
            ],
            version: ghcb.version(),
            usage: ghcb.usage(),
            psc_header,
            psc_entries,
        };
        let (req_gpa, resp_gpa) = (record.exit_info_1, record.exit_info_2);
        st.events.push(Event::Exit(record));

        let (code_override, info1, info2) = st.exit_response;
        if info1 == 0 && info2 == 0 {
            match exit_code {
                EXIT_RDTSC => {
                    ghcb.set_valid(GHCB_RAX, st.tsc & 0xffff_ffff);
                    ghcb.set_valid(GHCB_RDX, st.tsc >> 32);
                }
                EXIT_SNP_PSC => {
                    let (_, end) = ghcb.psc_header();
                    let cur = st.psc_progress.unwrap_or(end.wrapping_add(1));
                    let raw = ghcb.get(GHCB_BUFFER);
                    ghcb.set(GHCB_BUFFER, (raw & !0xffff) | u64::from(cur));
                }
                EXIT_GUEST_REQUEST => self.psp_request(st, &mem, req_gpa, resp_gpa),
                _ => {}
            }
        }

        ghcb.set(GHCB_EXIT_CODE, code_override.unwrap_or(exit_code));
        ghcb.set(GHCB_EXIT_INFO_1, info1);
        ghcb.set(GHCB_EXIT_INFO_2, info2);
    }

    fn psp_request(&self, st: &mut MockState, mem: &MemWindow, req_gpa: u64, resp_gpa: u64) {
        let mut request = vec![0u8; PAGE_SIZE];
        if !mem.read(req_gpa, &mut request) {
            return;
        }
        let Ok((hdr, payload)) = SnpGuestRequestMsgHdr::parse(&request) else {
            return;
        };
        let index = usize::from(hdr.msg_vmpck());
        let Some(key) = st.psp_keys.get(index).copied().flatten() else {
            return;
        };
        let Ok(plaintext) = open(&hdr, payload, &key, hdr.seqno()) else {
            return;
        };
        st.psp_requests.push((index, plaintext));

        let Ok(req_type) = hdr.msg_type() else {
            return;
        };
        let (rsp_type, seqno) = match st.psp_behavior {
            PspBehavior::WrongType => (req_type, hdr.seqno() + 1),
            PspBehavior::ReplaySequence => (req_type.response(), hdr.seqno()),
            _ => (req_type.response(), hdr.seqno() + 1),
        };
        let mut rsp_hdr = SnpGuestRequestMsgHdr::new(rsp_type, hdr.msg_vmpck());
        let mut response = seal(&mut rsp_hdr, seqno, &st.psp_response, &key).unwrap();
        if st.psp_behavior == PspBehavior::CorruptPayload {
            response[0] ^= 1;
        }
        mem.write(resp_gpa, &response);
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SevPlatform for MockHypervisor {
    fn read_msr(&self, msr: u32) -> u64 {
        self.state().msrs.get(&msr).copied().unwrap_or(0)
    }

    unsafe fn write_msr(&self, msr: u32, val: u64) {
        self.state().msrs.insert(msr, val);
    }

    unsafe fn vmgexit(&self) {
        let mut st = self.state();
        let msr = st.msrs.get(&SEV_GHCB).copied().unwrap_or(0);
        if msr & 0xfff == 0 {
            self.ghcb_exit(&mut st, msr);
        } else {
            let response = self.msr_protocol(&mut st, msr);
            st.msrs.insert(SEV_GHCB, response);
        }
    }

    unsafe fn pvalidate(&self, vaddr: VirtAddr, size: PageSize, op: PvalidateOp) -> u64 {
        let mut st = self.state();
        st.events.push(Event::Pvalidate { vaddr, size, op });
        st.pvalidate_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_translation() {
        let mem = TestMemory::new(2);
        assert_ne!(usize::from(mem.paddr()), usize::from(mem.vaddr()));
        let window = mem.window();
        mem.write(PAGE_SIZE, b"abcd");
        let mut out = [0u8; 4];
        assert!(window.read(u64::from(mem.paddr() + PAGE_SIZE), &mut out));
        assert_eq!(&out, b"abcd");
        assert!(!window.read(u64::from(mem.paddr() + (2 * PAGE_SIZE - 2)), &mut out));
        assert!(!window.read(u64::from(mem.paddr()) - 8, &mut out));
    }
}
