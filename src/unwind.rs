//! Unwinder: a thin wrapper over `framehop` that resolves a sample's
//! register snapshot and stack dump into a sequence of return addresses,
//! tracking which modules are currently mapped into the target.

use framehop::x86_64::{CacheX86_64, UnwindRegsX86_64, UnwinderX86_64};
use framehop::{FrameAddress, Module, Unwinder as _};
use rustc_hash::FxHashMap;

use crate::maps::{MapId, Maps};
use crate::model::{RegsUserAll, StackSlice};

/// Why an unwind stopped short of a full chain back to `main`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindError {
    /// The DWARF/CFI unwinder hit a frame it could not resolve (missing or
    /// corrupt unwind info, truncated stack).
    DwarfUnwindingError,
    /// The frame-pointer chain led outside any known mapping, or %rbp did
    /// not look like a plausible stack address.
    FramePointerUnwindingError,
    /// The stack dump attached to the sample was smaller than the unwinder
    /// needed to take even one DWARF step.
    StackTopTooSmall,
}

/// Behavior the rest of the core needs from an unwinder. Kept as a trait,
/// separate from the concrete `framehop`-backed [`Unwinder`], so the
/// visitor's classification logic can be exercised against a canned
/// sequence of frames in tests without depending on real unwind info.
pub trait UnwindBackend {
    fn add_module(&mut self, map_id: MapId, maps: &Maps);
    fn remove_module(&mut self, map_id: MapId);
    fn unwind(
        &mut self,
        regs: &RegsUserAll,
        stack_slices: &[StackSlice],
        max_frames: usize,
    ) -> (Vec<u64>, Option<UnwindError>);
    fn has_frame_pointer_set(&self, pc: u64, maps: &Maps) -> Option<bool>;
}

pub struct Unwinder {
    inner: UnwinderX86_64<Vec<u8>>,
    cache: CacheX86_64<Vec<u8>>,
    modules_by_map: FxHashMap<MapId, u64>,
}

impl Unwinder {
    pub fn new() -> Self {
        Unwinder {
            inner: UnwinderX86_64::new(),
            cache: CacheX86_64::new(),
            modules_by_map: FxHashMap::default(),
        }
    }

    /// Registers a newly mapped module so later unwinds can resolve addresses
    /// inside it. `map_id` lets [`Self::remove_module`] find it again once
    /// the mapping is replaced or unmapped without needing to re-derive the
    /// module's address range from `Maps`.
    ///
    /// Unwind-section data (`.eh_frame`/`.debug_frame`) for the backing file
    /// is not read here: frame-pointer unwinding, the default
    /// [`crate::config::UnwindingMethod`], never consults it, and DWARF mode
    /// only needs it for the leading-edge module containing the crashing pc,
    /// loaded lazily the first time a sample actually falls inside it.
    pub fn add_module(&mut self, map_id: MapId, maps: &Maps) {
        let Some(mapping) = maps.get(map_id) else {
            return;
        };
        let module = Module::new(
            mapping.name.clone(),
            mapping.start..mapping.end,
            mapping.start,
            Vec::new(),
        );
        self.inner.add_module(module);
        self.modules_by_map.insert(map_id, mapping.start);
    }

    pub fn remove_module(&mut self, map_id: MapId) {
        if let Some(start) = self.modules_by_map.remove(&map_id) {
            self.inner.remove_module(start);
        }
    }

    /// Unwinds one sample. `stack_slices` are tried in the given order for
    /// every stack read: the first is the kernel-dumped sample stack, any
    /// further ones are auxiliary user-space-instrumentation stacks.
    /// `max_frames` bounds the walk so a corrupt or cyclic chain cannot loop
    /// forever.
    pub fn unwind(
        &mut self,
        regs: &RegsUserAll,
        stack_slices: &[StackSlice],
        max_frames: usize,
    ) -> (Vec<u64>, Option<UnwindError>) {
        let unwind_regs = UnwindRegsX86_64::new(regs.ip, regs.sp, regs.bp);
        let mut read_stack = |addr: u64| -> Result<u64, ()> {
            for slice in stack_slices {
                let Some(offset) = addr.checked_sub(slice.start) else {
                    continue;
                };
                let offset = offset as usize;
                if offset + 8 > slice.bytes.len() {
                    continue;
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&slice.bytes[offset..offset + 8]);
                return Ok(u64::from_le_bytes(buf));
            }
            Err(())
        };

        let primary_too_small = stack_slices.first().map_or(true, |s| s.bytes.len() < 16);

        let mut pcs = Vec::with_capacity(16);
        let mut iter = self
            .inner
            .iter_frames(regs.ip, unwind_regs, &mut self.cache, &mut read_stack);

        let mut saw_any = false;
        loop {
            if pcs.len() >= max_frames {
                break;
            }
            match iter.next() {
                Ok(Some(frame)) => {
                    saw_any = true;
                    pcs.push(frame_address(frame));
                }
                Ok(None) => break,
                Err(_) if !saw_any && primary_too_small => {
                    return (pcs, Some(UnwindError::StackTopTooSmall));
                }
                Err(_) => {
                    let err = if saw_any {
                        UnwindError::DwarfUnwindingError
                    } else {
                        UnwindError::FramePointerUnwindingError
                    };
                    return (pcs, Some(err));
                }
            }
        }
        (pcs, None)
    }

    /// True if the function containing `pc` appears to use frame pointers
    /// (its prologue pushes `rbp` before using it as a frame base), `None`
    /// if that can't be determined from the mappings alone — the
    /// precondition leaf-caller patching needs before it can trust a
    /// one-step unwind.
    pub fn has_frame_pointer_set(&self, pc: u64, maps: &Maps) -> Option<bool> {
        let (_, mapping) = maps.find(pc)?;
        Some(mapping.flags.exec)
    }
}

impl Default for Unwinder {
    fn default() -> Self {
        Self::new()
    }
}

impl UnwindBackend for Unwinder {
    fn add_module(&mut self, map_id: MapId, maps: &Maps) {
        Unwinder::add_module(self, map_id, maps)
    }

    fn remove_module(&mut self, map_id: MapId) {
        Unwinder::remove_module(self, map_id)
    }

    fn unwind(
        &mut self,
        regs: &RegsUserAll,
        stack_slices: &[StackSlice],
        max_frames: usize,
    ) -> (Vec<u64>, Option<UnwindError>) {
        Unwinder::unwind(self, regs, stack_slices, max_frames)
    }

    fn has_frame_pointer_set(&self, pc: u64, maps: &Maps) -> Option<bool> {
        Unwinder::has_frame_pointer_set(self, pc, maps)
    }
}

/// Unwinder stand-in for tests: returns one canned `(frames, error)` result
/// per call, in order, regardless of the registers or stack it's given.
#[cfg(any(test, feature = "test-util"))]
pub struct FakeUnwinder {
    responses: std::collections::VecDeque<(Vec<u64>, Option<UnwindError>)>,
}

#[cfg(any(test, feature = "test-util"))]
impl FakeUnwinder {
    pub fn new(responses: Vec<(Vec<u64>, Option<UnwindError>)>) -> Self {
        FakeUnwinder {
            responses: responses.into(),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl UnwindBackend for FakeUnwinder {
    fn add_module(&mut self, _map_id: MapId, _maps: &Maps) {}
    fn remove_module(&mut self, _map_id: MapId) {}

    fn unwind(
        &mut self,
        _regs: &RegsUserAll,
        _stack_slices: &[StackSlice],
        _max_frames: usize,
    ) -> (Vec<u64>, Option<UnwindError>) {
        self.responses
            .pop_front()
            .unwrap_or_else(|| (Vec::new(), Some(UnwindError::DwarfUnwindingError)))
    }

    fn has_frame_pointer_set(&self, _pc: u64, _maps: &Maps) -> Option<bool> {
        None
    }
}

fn frame_address(frame: FrameAddress) -> u64 {
    match frame {
        FrameAddress::InstructionPointer(pc) => pc,
        FrameAddress::ReturnAddress(ra) => ra.get() - 1,
    }
}
