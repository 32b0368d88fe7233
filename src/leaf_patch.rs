//! Leaf-function caller patcher.
//!
//! A frame-pointer-based callchain is built by walking `%rbp` chains, which
//! only works for callers; a leaf function that never pushes `%rbp` (because
//! it never needs to) is invisible to the walk except as the innermost pc,
//! and its own caller is missing from the chain entirely. This module takes
//! one DWARF/CFI unwind step from the sampled registers: if that step can
//! only reach one frame (the leaf itself), the chain is already complete; if
//! it reaches two, the second is the missing caller; three or more means
//! this was never a leaf-missing case to begin with.

use crate::maps::Maps;
use crate::model::{CallstackType, RegsUserAll, StackSlice};
use crate::unwind::UnwindBackend;

/// Outcome of attempting to patch the caller of a possible leaf function.
pub enum LeafPatchResult {
    /// The innermost frame has frame pointers; the callchain needs no
    /// patching.
    AlreadyComplete,
    /// The caller was missing and has been inserted into `callchain`.
    Patched,
    /// The probing step failed or was inconclusive; the caller reports this
    /// as the given classification instead of patching.
    Error(CallstackType),
}

/// Attempts to patch the caller of a leaf innermost frame into `callchain`
/// (caller-to-callee reversed: index 0 is the innermost pc, as produced by
/// the kernel's frame-pointer callchain walk). `regs` is the sample's
/// register snapshot and `stack` its raw stack dump, both as sampled (i.e.
/// *before* [`crate::return_address::ReturnAddressManager::patch_sample`],
/// which only applies to explicit stack dumps, not to this synthetic
/// single-step unwind). `configured_stack_dump_size` is the operator's
/// configured kernel dump size; a shorter dump means the sample cannot be
/// trusted to attempt the patch at all.
pub fn patch_caller_of_leaf_function(
    callchain: &mut Vec<u64>,
    regs: &RegsUserAll,
    stack: &StackSlice,
    configured_stack_dump_size: u16,
    maps: &Maps,
    unwinder: &mut dyn UnwindBackend,
) -> LeafPatchResult {
    if (stack.bytes.len() as u64) < configured_stack_dump_size as u64 {
        return LeafPatchResult::Error(CallstackType::StackTopForDwarfUnwindingTooSmall);
    }

    let (frames, err) = unwinder.unwind(regs, std::slice::from_ref(stack), 3);

    if err.is_some() && frames.len() <= 1 {
        return LeafPatchResult::Error(CallstackType::DwarfUnwindingError);
    }

    match frames.len() {
        0 => LeafPatchResult::Error(CallstackType::DwarfUnwindingError),
        1 => {
            let in_executable_memory = maps
                .find(regs.ip)
                .map(|(_, mapping)| mapping.flags.exec)
                .unwrap_or(false);
            if in_executable_memory {
                LeafPatchResult::AlreadyComplete
            } else {
                LeafPatchResult::Error(CallstackType::DwarfUnwindingError)
            }
        }
        2 => {
            // `frames[1]` is already the caller's real return address, the
            // same convention a restored hijack uses; the caller applies the
            // usual minus-one only to entries still raw from the kernel.
            callchain.insert(1, frames[1]);
            LeafPatchResult::Patched
        }
        _ => LeafPatchResult::Error(CallstackType::FramePointerUnwindingError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::Unwinder;

    fn stack(bytes: Vec<u8>, start: u64) -> StackSlice {
        StackSlice { start, bytes }
    }

    #[test]
    fn dump_smaller_than_configured_size_is_rejected_outright() {
        let mut unwinder = Unwinder::new();
        let maps = Maps::new();
        let regs = RegsUserAll {
            ip: 0x1000,
            sp: 0x7000,
            bp: 0x7000,
            ..Default::default()
        };
        let mut callchain = vec![0x1000];
        let result = patch_caller_of_leaf_function(
            &mut callchain,
            &regs,
            &stack(vec![0; 4], 0x7000),
            256,
            &maps,
            &mut unwinder,
        );
        assert!(matches!(
            result,
            LeafPatchResult::Error(CallstackType::StackTopForDwarfUnwindingTooSmall)
        ));
    }
}
