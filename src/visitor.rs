//! Unwinding visitor: the dispatcher that threads every decoded event
//! through the maps oracle, the unwinder, the return-address and
//! function-call managers, and the leaf-function caller patcher, then
//! classifies and forwards the result to a [`Listener`].

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::Config;
use crate::counters::Counters;
use crate::function_call::FunctionCallManager;
use crate::leaf_patch::{self, LeafPatchResult};
use crate::listener::{Listener, ModuleInfoProvider};
use crate::maps::Maps;
use crate::model::{
    AddressInfo, CallstackSample, CallstackType, ModuleUpdate, PerfEvent, StackSlice,
    UPROBES_MAPPING_NAME,
};
use crate::return_address::ReturnAddressManager;
use crate::unwind::UnwindBackend;

/// Hard cap on frames collected per unwind so a corrupt chain cannot spin
/// the worker forever.
const MAX_FRAMES: usize = 512;

#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameLocation {
    Uprobes,
    Instrumentation,
    Normal,
}

pub struct UnwindingVisitor<U, L, P> {
    maps: Maps,
    unwinder: U,
    return_addresses: ReturnAddressManager,
    function_calls: FunctionCallManager,
    config: Config,
    listener: L,
    module_provider: P,
    /// Last `(sp, ip, cpu)` seen for an open uprobe on each tid.
    uprobe_dedup: FxHashMap<u32, (u64, u64, u32)>,
    seen_addresses: FxHashSet<u64>,
}

impl<U: UnwindBackend, L: Listener, P: ModuleInfoProvider> UnwindingVisitor<U, L, P> {
    pub fn new(config: Config, unwinder: U, listener: L, module_provider: P) -> Self {
        UnwindingVisitor {
            maps: Maps::new(),
            unwinder,
            return_addresses: ReturnAddressManager::new(),
            function_calls: FunctionCallManager::new(),
            config,
            listener,
            module_provider,
            uprobe_dedup: FxHashMap::default(),
            seen_addresses: FxHashSet::default(),
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    pub fn dispatch(&mut self, counters: &Counters, event: PerfEvent) {
        match event {
            PerfEvent::Mmap {
                pid,
                timestamp_ns,
                start,
                len,
                page_offset,
                flags,
                name,
                ..
            } => self.handle_mmap(pid, timestamp_ns, start, len, page_offset, flags, name),

            PerfEvent::Uprobe {
                tid,
                function_id,
                timestamp_ns,
                cpu,
                sp,
                ip,
                original_return_address,
                args,
                ..
            } => self.handle_uprobe_entry(tid, function_id, timestamp_ns, cpu, sp, ip, original_return_address, args),

            PerfEvent::Uretprobe {
                pid,
                tid,
                timestamp_ns,
                return_value,
                ..
            } => self.handle_probe_exit(pid, tid, timestamp_ns, return_value, true),

            PerfEvent::UserSpaceFunctionEntry {
                tid,
                function_id,
                timestamp_ns,
                sp,
                return_address,
                ..
            } => {
                self.function_calls
                    .process_function_entry(tid, function_id, timestamp_ns, None);
                self.return_addresses
                    .process_function_entry(tid, sp, return_address);
            }

            PerfEvent::UserSpaceFunctionExit {
                pid,
                tid,
                timestamp_ns,
                ..
            } => self.handle_probe_exit(pid, tid, timestamp_ns, None, false),

            PerfEvent::StackSample {
                pid,
                tid,
                timestamp_ns,
                regs,
                stack,
                ..
            } => self.handle_stack_sample(counters, pid, tid, timestamp_ns, regs, stack),

            PerfEvent::CallchainSample {
                pid,
                tid,
                timestamp_ns,
                regs,
                ips,
                stack,
                ..
            } => self.handle_callchain_sample(counters, pid, tid, timestamp_ns, regs, ips, stack),

            PerfEvent::Exit { tid, .. } => {
                self.uprobe_dedup.remove(&tid);
            }

            PerfEvent::Lost { count, .. } => {
                counters.add_lost_records(count);
                self.listener.on_lost_perf_records(count);
            }

            PerfEvent::Fork { .. }
            | PerfEvent::SchedSwitch { .. }
            | PerfEvent::SchedWakeup { .. }
            | PerfEvent::Throttle { .. } => {}
        }
    }

    fn handle_mmap(
        &mut self,
        pid: u32,
        timestamp_ns: u64,
        start: u64,
        len: u64,
        page_offset: u64,
        flags: crate::model::MapFlags,
        name: String,
    ) {
        if name == UPROBES_MAPPING_NAME {
            self.maps.add_and_sort(start, start + len, page_offset, flags, name, 0);
            return;
        }

        let module_info = self.module_provider.create_module(&name, start, start + len);
        let load_bias = module_info.as_ref().map(|m| m.load_bias).unwrap_or(0);
        let map_id = self
            .maps
            .add_and_sort(start, start + len, page_offset, flags, name, load_bias);
        self.unwinder.add_module(map_id, &self.maps);

        if let Ok(module) = module_info {
            self.listener.on_module_update(ModuleUpdate {
                pid,
                timestamp_ns,
                module,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_uprobe_entry(
        &mut self,
        tid: u32,
        function_id: u64,
        timestamp_ns: u64,
        cpu: u32,
        sp: u64,
        ip: u64,
        original_return_address: u64,
        args: Option<crate::model::AbiArgRegs>,
    ) {
        let key = (sp, ip, cpu);
        if let Some(&prev) = self.uprobe_dedup.get(&tid) {
            if prev == key {
                return;
            }
            if sp > prev.0 {
                log::warn!(
                    "tid {tid}: uprobe at sp {sp:#x} is above the previous open probe's sp {:#x}; a uretprobe was likely lost",
                    prev.0
                );
            }
        }
        self.uprobe_dedup.insert(tid, key);
        self.function_calls
            .process_function_entry(tid, function_id, timestamp_ns, args);
        self.return_addresses
            .process_function_entry(tid, sp, original_return_address);
    }

    fn handle_probe_exit(
        &mut self,
        pid: u32,
        tid: u32,
        timestamp_ns: u64,
        return_value: Option<u64>,
        is_uprobe: bool,
    ) {
        if is_uprobe {
            self.uprobe_dedup.remove(&tid);
        }
        if let Some(call) = self
            .function_calls
            .process_function_exit(pid, tid, timestamp_ns, return_value)
        {
            self.listener.on_function_call(call);
        }
        self.return_addresses.process_function_exit(tid);
    }

    fn frame_location(&self, pc: u64) -> FrameLocation {
        match self.maps.find(pc) {
            Some((_, mapping)) if mapping.is_uprobes_trampoline() => FrameLocation::Uprobes,
            Some((_, mapping)) => {
                if self.is_in_instrumentation(pc, Some(&mapping.name)) {
                    FrameLocation::Instrumentation
                } else {
                    FrameLocation::Normal
                }
            }
            None => {
                if self.is_in_instrumentation(pc, None) {
                    FrameLocation::Instrumentation
                } else {
                    FrameLocation::Normal
                }
            }
        }
    }

    fn is_in_instrumentation(&self, pc: u64, mapping_name: Option<&str>) -> bool {
        let Some(usi) = &self.config.user_space_instrumentation_addresses else {
            return false;
        };
        usi.is_in_trampoline(pc) || mapping_name == Some(usi.injected_library_map_name.as_str())
    }

    fn record_address_info(&mut self, pc: u64) {
        if !self.seen_addresses.insert(pc) {
            return;
        }
        let (module_name, offset_in_function) = match self.maps.find(pc) {
            Some((_, mapping)) => (mapping.name.clone(), mapping.file_relative_offset(pc)),
            None => (String::new(), pc),
        };
        self.listener.on_address_info(AddressInfo {
            absolute_address: pc,
            module_name,
            // Symbol names are outside this engine's scope; the external
            // symbolizer fills this in from the module name + offset.
            function_name: String::new(),
            offset_in_function,
        });
    }

    fn emit_callstack(
        &mut self,
        counters: &Counters,
        pid: u32,
        tid: u32,
        timestamp_ns: u64,
        pcs: Vec<u64>,
        kind: CallstackType,
    ) {
        match kind {
            CallstackType::Complete => {}
            CallstackType::InUprobes => counters.bump_discarded_in_uretprobes(),
            _ => counters.bump_unwinding_errors(),
        }
        for &pc in &pcs {
            self.record_address_info(pc);
        }
        self.listener.on_callstack_sample(CallstackSample {
            pid,
            tid,
            timestamp_ns,
            pcs,
            kind,
        });
    }

    fn handle_stack_sample(
        &mut self,
        counters: &Counters,
        pid: u32,
        tid: u32,
        timestamp_ns: u64,
        regs: crate::model::RegsUserAll,
        stack: StackSlice,
    ) {
        let mut bytes = stack.bytes;
        self.return_addresses.patch_sample(tid, stack.start, &mut bytes);
        let slice = StackSlice {
            start: stack.start,
            bytes,
        };

        let (frames, err) = self.unwinder.unwind(&regs, std::slice::from_ref(&slice), MAX_FRAMES);
        if frames.is_empty() {
            return;
        }

        let innermost = frames[0];
        match self.frame_location(innermost) {
            FrameLocation::Uprobes => {
                self.emit_callstack(counters, pid, tid, timestamp_ns, frames, CallstackType::InUprobes);
                return;
            }
            FrameLocation::Instrumentation => {
                let mut cut = frames.len();
                for i in (0..frames.len()).rev() {
                    if self.frame_location(frames[i]) != FrameLocation::Instrumentation {
                        cut = i + 1;
                        break;
                    }
                }
                let preserved = frames[..cut].to_vec();
                self.emit_callstack(
                    counters,
                    pid,
                    tid,
                    timestamp_ns,
                    preserved,
                    CallstackType::InUserSpaceInstrumentation,
                );
                return;
            }
            FrameLocation::Normal => {}
        }

        let outermost = *frames.last().unwrap();
        if self.frame_location(outermost) == FrameLocation::Uprobes {
            self.emit_callstack(
                counters,
                pid,
                tid,
                timestamp_ns,
                vec![innermost],
                CallstackType::CallstackPatchingFailed,
            );
            return;
        }

        let single_frame_ok = frames.len() == 1 && self.config.stop_at_function_containing(innermost);
        if let Some(err) = err {
            if frames.len() == 1 && single_frame_ok {
                self.emit_callstack(counters, pid, tid, timestamp_ns, frames, CallstackType::Complete);
                return;
            }
            let kind = match err {
                crate::unwind::UnwindError::StackTopTooSmall => {
                    CallstackType::StackTopForDwarfUnwindingTooSmall
                }
                crate::unwind::UnwindError::FramePointerUnwindingError => {
                    CallstackType::FramePointerUnwindingError
                }
                crate::unwind::UnwindError::DwarfUnwindingError => CallstackType::DwarfUnwindingError,
            };
            self.emit_callstack(counters, pid, tid, timestamp_ns, frames, kind);
            return;
        }
        if frames.len() == 1 && !single_frame_ok {
            self.emit_callstack(counters, pid, tid, timestamp_ns, frames, CallstackType::DwarfUnwindingError);
            return;
        }

        self.emit_callstack(counters, pid, tid, timestamp_ns, frames, CallstackType::Complete);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_callchain_sample(
        &mut self,
        counters: &Counters,
        pid: u32,
        tid: u32,
        timestamp_ns: u64,
        regs: crate::model::RegsUserAll,
        ips: Vec<u64>,
        stack: StackSlice,
    ) {
        if ips.len() <= 1 {
            return;
        }
        if ips.len() == 2 {
            self.emit_callstack(
                counters,
                pid,
                tid,
                timestamp_ns,
                vec![ips[1]],
                CallstackType::FramePointerUnwindingError,
            );
            return;
        }

        let innermost = ips[1];
        let in_uprobes = match self.maps.find(innermost) {
            None => true,
            Some((_, mapping)) => mapping.is_uprobes_trampoline(),
        };
        if in_uprobes {
            self.emit_callstack(counters, pid, tid, timestamp_ns, ips[1..].to_vec(), CallstackType::InUprobes);
            return;
        }
        if self.frame_location(innermost) == FrameLocation::Instrumentation {
            self.emit_callstack(
                counters,
                pid,
                tid,
                timestamp_ns,
                ips[1..].to_vec(),
                CallstackType::InUserSpaceInstrumentation,
            );
            return;
        }

        let mut user_chain = ips[1..].to_vec();

        let leaf_patched = match leaf_patch::patch_caller_of_leaf_function(
            &mut user_chain,
            &regs,
            &stack,
            self.config.stack_dump_size,
            &self.maps,
            &mut self.unwinder,
        ) {
            LeafPatchResult::Patched => true,
            LeafPatchResult::AlreadyComplete => false,
            LeafPatchResult::Error(kind) => {
                self.emit_callstack(counters, pid, tid, timestamp_ns, vec![innermost], kind);
                return;
            }
        };

        // `user_chain[0]` is the sample's real, currently-executing pc, never
        // a return address a probe could have hijacked; only the frames
        // above it in the walk are candidates for patching. Positions are
        // recorded before patching since `patch_callchain` overwrites the
        // trampoline addresses that identify them.
        let trampoline_positions = if user_chain.len() < 2 {
            Vec::new()
        } else {
            ReturnAddressManager::trampoline_positions(&user_chain[1..], &self.maps)
        };

        if user_chain.len() < 2
            || !self
                .return_addresses
                .patch_callchain(tid, &mut user_chain[1..], &self.maps)
        {
            self.emit_callstack(
                counters,
                pid,
                tid,
                timestamp_ns,
                vec![innermost],
                CallstackType::CallstackPatchingFailed,
            );
            return;
        }

        // Entries patch_callchain or leaf-patch filled in already hold the
        // exact caller return address, never decremented. Entries the kernel
        // supplied directly are still raw return addresses and need the
        // usual minus-one so they land inside the call instruction rather
        // than past it. `user_chain[0]` (the real innermost pc) is exempt
        // either way.
        let mut already_final: FxHashSet<usize> = trampoline_positions.into_iter().map(|i| i + 1).collect();
        already_final.insert(0);
        if leaf_patched {
            already_final.insert(1);
        }
        for (i, pc) in user_chain.iter_mut().enumerate() {
            if !already_final.contains(&i) {
                *pc = pc.wrapping_sub(1);
            }
        }

        self.emit_callstack(counters, pid, tid, timestamp_ns, user_chain, CallstackType::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleInfoError;
    use crate::model::{CallstackSample as Sample, FunctionCall, MapFlags, ModuleInfo};
    use crate::unwind::{FakeUnwinder, UnwindError};

    #[derive(Default)]
    struct RecordingListener {
        samples: Vec<Sample>,
        calls: Vec<FunctionCall>,
        address_infos: Vec<AddressInfo>,
    }

    impl Listener for RecordingListener {
        fn on_callstack_sample(&mut self, sample: Sample) {
            self.samples.push(sample);
        }
        fn on_function_call(&mut self, call: FunctionCall) {
            self.calls.push(call);
        }
        fn on_address_info(&mut self, info: AddressInfo) {
            self.address_infos.push(info);
        }
        fn on_module_update(&mut self, _update: ModuleUpdate) {}
    }

    struct NoopModuleProvider;
    impl ModuleInfoProvider for NoopModuleProvider {
        fn create_module(
            &mut self,
            filename: &str,
            address_start: u64,
            address_end: u64,
        ) -> Result<ModuleInfo, ModuleInfoError> {
            Ok(ModuleInfo {
                name: filename.to_string(),
                file_path: filename.to_string(),
                address_start,
                address_end,
                load_bias: 0,
                executable_segment_offset: 0,
                object_file_type: crate::model::ObjectFileType::ElfFile,
            })
        }
    }

    fn config_with_uprobes_mapping() -> (Config, Maps) {
        let mut maps = Maps::new();
        maps.add_and_sort(
            0x100,
            0x400,
            0,
            MapFlags {
                read: true,
                write: false,
                exec: true,
            },
            "target".into(),
            0,
        );
        maps.add_and_sort(
            0x7FFF_FFFF_E000,
            0x7FFF_FFFF_E001,
            0,
            MapFlags::NONE,
            UPROBES_MAPPING_NAME.into(),
            0,
        );
        (Config::default(), maps)
    }

    fn visitor_with(
        maps: Maps,
        fake: FakeUnwinder,
    ) -> UnwindingVisitor<FakeUnwinder, RecordingListener, NoopModuleProvider> {
        let mut visitor = UnwindingVisitor::new(Config::default(), fake, RecordingListener::default(), NoopModuleProvider);
        visitor.maps = maps;
        visitor
    }

    fn regs() -> crate::model::RegsUserAll {
        crate::model::RegsUserAll::default()
    }

    fn stack() -> StackSlice {
        StackSlice {
            start: 0x7000,
            bytes: vec![0; 256],
        }
    }

    #[test]
    fn scenario_1_perfect_dwarf_sample_is_complete() {
        let (_, maps) = config_with_uprobes_mapping();
        let fake = FakeUnwinder::new(vec![(vec![0x100, 0x200, 0x300], None)]);
        let mut visitor = visitor_with(maps, fake);
        let counters = Counters::new();

        visitor.dispatch(
            &counters,
            PerfEvent::StackSample {
                tid: 1,
                pid: 1,
                timestamp_ns: 1,
                stream: 0,
                regs: regs(),
                stack: stack(),
            },
        );

        let listener = visitor.listener();
        assert_eq!(listener.samples.len(), 1);
        assert_eq!(listener.samples[0].pcs, vec![0x100, 0x200, 0x300]);
        assert_eq!(listener.samples[0].kind, CallstackType::Complete);
        assert_eq!(listener.address_infos.len(), 3);
    }

    #[test]
    fn scenario_2_top_frame_in_uprobes() {
        let (_, maps) = config_with_uprobes_mapping();
        let fake = FakeUnwinder::new(vec![(vec![0x7FFF_FFFF_E000, 0x200], None)]);
        let mut visitor = visitor_with(maps, fake);
        let counters = Counters::new();

        visitor.dispatch(
            &counters,
            PerfEvent::StackSample {
                tid: 1,
                pid: 1,
                timestamp_ns: 1,
                stream: 0,
                regs: regs(),
                stack: stack(),
            },
        );

        let listener = visitor.listener();
        assert_eq!(listener.samples.len(), 1);
        assert_eq!(listener.samples[0].pcs, vec![0x7FFF_FFFF_E000, 0x200]);
        assert_eq!(listener.samples[0].kind, CallstackType::InUprobes);
        assert_eq!(counters.discarded_samples_in_uretprobes(), 1);
    }

    #[test]
    fn scenario_5_entry_exit_pairing_with_args() {
        let (_, maps) = config_with_uprobes_mapping();
        let fake = FakeUnwinder::new(vec![]);
        let mut visitor = visitor_with(maps, fake);
        let counters = Counters::new();

        let args = crate::model::AbiArgRegs {
            di: 1,
            si: 2,
            dx: 3,
            cx: 4,
            r8: 5,
            r9: 6,
        };

        visitor.dispatch(
            &counters,
            PerfEvent::Uprobe {
                tid: 11,
                pid: 7,
                timestamp_ns: 500,
                stream: 0,
                function_id: 5,
                cpu: 0,
                sp: 0x7000,
                ip: 0x100,
                original_return_address: 0x900,
                args: Some(args),
            },
        );
        visitor.dispatch(
            &counters,
            PerfEvent::Uretprobe {
                tid: 11,
                pid: 7,
                timestamp_ns: 600,
                stream: 0,
                return_value: Some(456),
            },
        );

        let listener = visitor.listener();
        assert_eq!(listener.calls.len(), 1);
        let call = &listener.calls[0];
        assert_eq!(call.function_id, 5);
        assert_eq!(call.duration_ns, 100);
        assert_eq!(call.depth, 0);
        assert_eq!(call.return_value, Some(456));
        assert_eq!(call.registers, Some(args));
    }

    #[test]
    fn duplicate_uprobe_same_tuple_is_suppressed() {
        let (_, maps) = config_with_uprobes_mapping();
        let fake = FakeUnwinder::new(vec![]);
        let mut visitor = visitor_with(maps, fake);
        let counters = Counters::new();

        let event = || PerfEvent::Uprobe {
            tid: 1,
            pid: 1,
            timestamp_ns: 0,
            stream: 0,
            function_id: 1,
            cpu: 0,
            sp: 0x7000,
            ip: 0x100,
            original_return_address: 0x900,
            args: None,
        };
        visitor.dispatch(&counters, event());
        visitor.dispatch(&counters, event());

        visitor.dispatch(
            &counters,
            PerfEvent::Uretprobe {
                tid: 1,
                pid: 1,
                timestamp_ns: 10,
                stream: 0,
                return_value: None,
            },
        );

        // Only one entry was registered despite two identical Uprobe events,
        // so exactly one exit pairs with it.
        let listener = visitor.listener();
        assert_eq!(listener.calls.len(), 1);
    }

    #[test]
    fn mmap_of_uprobes_mapping_is_preserved_with_infinite_bias() {
        let fake = FakeUnwinder::new(vec![]);
        let mut visitor = visitor_with(Maps::new(), fake);
        let counters = Counters::new();

        visitor.dispatch(
            &counters,
            PerfEvent::Mmap {
                tid: 1,
                pid: 1,
                timestamp_ns: 0,
                stream: 0,
                start: 0x7FFF_FFFF_E000,
                len: 0x1000,
                page_offset: 0,
                flags: MapFlags::NONE,
                name: UPROBES_MAPPING_NAME.to_string(),
            },
        );

        let (_, mapping) = visitor.maps.find(0x7FFF_FFFF_E500).unwrap();
        assert_eq!(mapping.load_bias, crate::model::INFINITE_LOAD_BIAS);
        assert!(mapping.flags.exec);
        // A special mapping never gets a listener module update.
        assert!(visitor.listener().calls.is_empty());
    }

    #[test]
    fn empty_unwind_result_is_dropped_silently() {
        let (_, maps) = config_with_uprobes_mapping();
        let fake = FakeUnwinder::new(vec![(vec![], Some(UnwindError::DwarfUnwindingError))]);
        let mut visitor = visitor_with(maps, fake);
        let counters = Counters::new();

        visitor.dispatch(
            &counters,
            PerfEvent::StackSample {
                tid: 1,
                pid: 1,
                timestamp_ns: 1,
                stream: 0,
                regs: regs(),
                stack: stack(),
            },
        );

        assert!(visitor.listener().samples.is_empty());
    }

    #[test]
    fn scenario_3_patchable_callchain_restores_hijacked_return_address() {
        let (_, maps) = config_with_uprobes_mapping();
        // One-step unwind from the innermost frame finds only itself, so the
        // leaf-patcher leaves the callchain untouched.
        let fake = FakeUnwinder::new(vec![(vec![0x100], None)]);
        let mut visitor = visitor_with(maps, fake);
        visitor.config.stack_dump_size = 0;
        let counters = Counters::new();

        visitor.dispatch(
            &counters,
            PerfEvent::Uprobe {
                tid: 1,
                pid: 1,
                timestamp_ns: 0,
                stream: 0,
                function_id: 1,
                cpu: 0,
                sp: 0x7000,
                ip: 0x100,
                original_return_address: 0x200,
                args: None,
            },
        );

        visitor.dispatch(
            &counters,
            PerfEvent::CallchainSample {
                tid: 1,
                pid: 1,
                timestamp_ns: 1,
                stream: 0,
                regs: crate::model::RegsUserAll {
                    ip: 0x100,
                    ..regs()
                },
                ips: vec![0xffff_ffff_8000_0000, 0x100, 0x7FFF_FFFF_E000, 0x301],
                stack: stack(),
            },
        );

        let listener = visitor.listener();
        assert_eq!(listener.samples.len(), 1);
        assert_eq!(listener.samples[0].pcs, vec![0x100, 0x200, 0x300]);
        assert_eq!(listener.samples[0].kind, CallstackType::Complete);
    }

    #[test]
    fn scenario_4_leaf_caller_recovery_inserts_missing_frame() {
        let (_, maps) = config_with_uprobes_mapping();
        // One-step unwind reaches two frames: the leaf itself and its
        // missing caller.
        let fake = FakeUnwinder::new(vec![(vec![0x100, 0x200], None)]);
        let mut visitor = visitor_with(maps, fake);
        visitor.config.stack_dump_size = 0;
        let counters = Counters::new();

        visitor.dispatch(
            &counters,
            PerfEvent::CallchainSample {
                tid: 1,
                pid: 1,
                timestamp_ns: 1,
                stream: 0,
                regs: crate::model::RegsUserAll {
                    ip: 0x100,
                    ..regs()
                },
                ips: vec![0xffff_ffff_8000_0000, 0x100, 0x301],
                stack: stack(),
            },
        );

        let listener = visitor.listener();
        assert_eq!(listener.samples.len(), 1);
        assert_eq!(listener.samples[0].pcs, vec![0x100, 0x200, 0x300]);
        assert_eq!(listener.samples[0].kind, CallstackType::Complete);
    }
}
