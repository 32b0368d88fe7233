//! Return-address manager.
//!
//! A uprobe hijacks a function's return address so the kernel can later run
//! the matching uretprobe; it then restores the original address when the
//! uretprobe fires. Any sample taken while that hijack is in effect sees the
//! uprobe trampoline instead of the real caller on the stack (or in the
//! kernel-supplied callchain), one entry per currently-open uprobe on that
//! thread. This module undoes the hijack before a sample is unwound or
//! classified, restoring the addresses the CPU would have seen with no
//! instrumentation present.

use rustc_hash::FxHashMap;

use crate::maps::Maps;

/// One hijacked return address, recorded at the moment a uprobe fires.
#[derive(Clone, Copy, Debug)]
struct HijackedFrame {
    /// Stack pointer *inside* the uprobe'd function, i.e. the address at
    /// which the kernel overwrote the return address on the stack.
    sp: u64,
    original_return_address: u64,
}

#[derive(Default)]
pub struct ReturnAddressManager {
    /// Per-thread stack of hijacks, outermost first, matching call order.
    open_hijacks: FxHashMap<u32, Vec<HijackedFrame>>,
}

impl ReturnAddressManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a hijack when a uprobe fires. `sp` is the entered function's
    /// stack pointer, i.e. where the kernel wrote the trampoline address.
    pub fn process_function_entry(&mut self, tid: u32, sp: u64, original_return_address: u64) {
        self.open_hijacks.entry(tid).or_default().push(HijackedFrame {
            sp,
            original_return_address,
        });
    }

    /// Un-records a hijack when the matching uretprobe fires. A mismatch
    /// (nothing was open for this thread, or the stack is empty) is not an
    /// error: uprobes attached mid-run can produce a uretprobe with no
    /// matching entry.
    pub fn process_function_exit(&mut self, tid: u32) {
        if let Some(stack) = self.open_hijacks.get_mut(&tid) {
            stack.pop();
            if stack.is_empty() {
                self.open_hijacks.remove(&tid);
            }
        }
    }

    /// Patches a raw stack byte dump in place. `stack_sp` is the address the
    /// dump starts at. For every hijack on this thread whose `sp` falls
    /// inside `[stack_sp, stack_sp + bytes.len())`, the 8 bytes at that
    /// offset are overwritten with the original return address. A thread
    /// with no open hijacks leaves the dump untouched.
    pub fn patch_sample(&self, tid: u32, stack_sp: u64, bytes: &mut [u8]) {
        let Some(hijacks) = self.open_hijacks.get(&tid) else {
            return;
        };
        // Iterate newest-first: if two hijacks somehow shared an `sp` (they
        // shouldn't), the most recently opened one wins, matching what the
        // kernel would currently have written there.
        for hijack in hijacks.iter().rev() {
            let Some(offset) = hijack.sp.checked_sub(stack_sp) else {
                continue;
            };
            let offset = offset as usize;
            if offset + 8 > bytes.len() {
                continue;
            }
            bytes[offset..offset + 8].copy_from_slice(&hijack.original_return_address.to_le_bytes());
        }
    }

    /// Positions in `callchain` whose IP the maps oracle recognizes as lying
    /// inside the uprobes trampoline mapping — the entries [`Self::patch_callchain`]
    /// is about to overwrite, in ascending (innermost-first) order.
    pub fn trampoline_positions(callchain: &[u64], maps: &Maps) -> Vec<usize> {
        callchain
            .iter()
            .enumerate()
            .filter(|&(_, &ip)| matches!(maps.find(ip), Some((_, m)) if m.is_uprobes_trampoline()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Patches a kernel-supplied callchain (an array of return addresses,
    /// caller-to-callee order reversed: index 0 is the innermost pc) in
    /// place, replacing every IP that falls in the `"[uprobes]"` mapping with
    /// the matching saved return address.
    ///
    /// The count of trampoline entries found in `callchain` must be at most
    /// the count of unique stack pointers among this thread's open hijacks,
    /// and at least that count minus one (a tail-call run of hijacks sharing
    /// a stack pointer counts once; when the counts differ by exactly one,
    /// the innermost, most-recently-opened hijack hasn't overwritten its
    /// stack slot yet — either pre-push or post-pop — and is skipped).
    /// Patches are applied outermost frame inward. Any other discrepancy
    /// means some hijack record was lost or reordered, and the sample must
    /// be discarded rather than misattributed: returns `false`.
    pub fn patch_callchain(&self, tid: u32, callchain: &mut [u64], maps: &Maps) -> bool {
        let ascending_positions = Self::trampoline_positions(callchain, maps);

        let Some(hijacks) = self.open_hijacks.get(&tid) else {
            return ascending_positions.is_empty();
        };

        // Collapse tail-call runs of equal sp into one record each, keeping
        // the outermost (first-pushed) representative of each run.
        let mut unique_records: Vec<&HijackedFrame> = Vec::new();
        for hijack in hijacks {
            if unique_records.last().map_or(true, |prev: &&HijackedFrame| prev.sp != hijack.sp) {
                unique_records.push(hijack);
            }
        }

        let unique_count = unique_records.len();
        let trampoline_count = ascending_positions.len();
        if trampoline_count > unique_count || unique_count > trampoline_count + 1 {
            return false;
        }

        let records = &unique_records[..trampoline_count];
        for (&position, record) in ascending_positions.iter().rev().zip(records.iter()) {
            callchain[position] = record.original_return_address;
        }
        true
    }

    pub fn open_hijack_count(&self, tid: u32) -> usize {
        self.open_hijacks.get(&tid).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_sample_restores_single_hijack() {
        let mut mgr = ReturnAddressManager::new();
        mgr.process_function_entry(1, 0x7000, 0xdead_beef);

        let mut bytes = vec![0u8; 32];
        bytes[8..16].copy_from_slice(&0x1111_2222_3333_4444u64.to_le_bytes());
        mgr.patch_sample(1, 0x6ff8, &mut bytes);

        let mut restored = [0u8; 8];
        restored.copy_from_slice(&bytes[8..16]);
        assert_eq!(u64::from_le_bytes(restored), 0xdead_beef);
    }

    #[test]
    fn patch_sample_is_noop_with_no_open_hijacks() {
        let mgr = ReturnAddressManager::new();
        let mut bytes = vec![0xAAu8; 16];
        let before = bytes.clone();
        mgr.patch_sample(1, 0x1000, &mut bytes);
        assert_eq!(bytes, before);
    }

    #[test]
    fn entry_then_exit_clears_state() {
        let mut mgr = ReturnAddressManager::new();
        mgr.process_function_entry(1, 0x7000, 0xdead_beef);
        assert_eq!(mgr.open_hijack_count(1), 1);
        mgr.process_function_exit(1);
        assert_eq!(mgr.open_hijack_count(1), 0);
    }

    #[test]
    fn exit_with_no_entry_does_not_panic() {
        let mut mgr = ReturnAddressManager::new();
        mgr.process_function_exit(42);
        assert_eq!(mgr.open_hijack_count(42), 0);
    }

    fn maps_with_trampoline() -> Maps {
        let mut maps = Maps::new();
        maps.add_and_sort(
            0x7FFF_FFFF_E000,
            0x7FFF_FFFF_E001,
            0,
            crate::model::MapFlags::NONE,
            crate::model::UPROBES_MAPPING_NAME.into(),
            0,
        );
        maps
    }

    const TRAMPOLINE: u64 = 0x7FFF_FFFF_E000;

    #[test]
    fn patch_callchain_patches_trampoline_entries_outermost_first() {
        let mut mgr = ReturnAddressManager::new();
        mgr.process_function_entry(1, 0x7000, 0xaaaa); // outer, oldest
        mgr.process_function_entry(1, 0x6000, 0xbbbb); // inner, newest
        let maps = maps_with_trampoline();

        let mut callchain = vec![0x1234, TRAMPOLINE, TRAMPOLINE];
        assert!(mgr.patch_callchain(1, &mut callchain, &maps));
        assert_eq!(callchain, vec![0x1234, 0xbbbb, 0xaaaa]);
    }

    #[test]
    fn patch_callchain_fails_when_trampoline_entries_outnumber_unique_hijacks() {
        let mut mgr = ReturnAddressManager::new();
        mgr.process_function_entry(1, 0x7000, 0xaaaa);
        let maps = maps_with_trampoline();

        let mut callchain = vec![0x1234, TRAMPOLINE, TRAMPOLINE];
        assert!(!mgr.patch_callchain(1, &mut callchain, &maps));
    }

    #[test]
    fn patch_callchain_fails_when_no_hijacks_open_for_a_trampoline_entry() {
        let mgr = ReturnAddressManager::new();
        let maps = maps_with_trampoline();

        let mut callchain = vec![0x1234, TRAMPOLINE];
        assert!(!mgr.patch_callchain(1, &mut callchain, &maps));
    }

    #[test]
    fn patch_callchain_is_noop_with_no_hijacks_and_no_trampoline_entries() {
        let mgr = ReturnAddressManager::new();
        let maps = maps_with_trampoline();

        let mut callchain = vec![0x1234, 0x5678];
        assert!(mgr.patch_callchain(1, &mut callchain, &maps));
        assert_eq!(callchain, vec![0x1234, 0x5678]);
    }

    #[test]
    fn patch_callchain_skips_innermost_hijack_missing_its_trampoline_entry() {
        let mut mgr = ReturnAddressManager::new();
        mgr.process_function_entry(1, 0x7000, 0xaaaa); // outer, already overwritten
        mgr.process_function_entry(1, 0x6000, 0xbbbb); // inner, not overwritten yet
        let maps = maps_with_trampoline();

        let mut callchain = vec![TRAMPOLINE];
        assert!(mgr.patch_callchain(1, &mut callchain, &maps));
        assert_eq!(callchain, vec![0xaaaa]);
    }

    #[test]
    fn patch_callchain_collapses_tail_call_run_of_equal_sp_records() {
        let mut mgr = ReturnAddressManager::new();
        mgr.process_function_entry(1, 0x7000, 0xaaaa); // outer caller, correct address
        mgr.process_function_entry(1, 0x7000, 0xcccc); // tail call, same sp
        mgr.process_function_entry(1, 0x6000, 0xbbbb); // inner, distinct sp
        let maps = maps_with_trampoline();

        let mut callchain = vec![0x1234, TRAMPOLINE, TRAMPOLINE];
        assert!(mgr.patch_callchain(1, &mut callchain, &maps));
        assert_eq!(callchain, vec![0x1234, 0xbbbb, 0xaaaa]);
    }
}
