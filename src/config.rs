//! Configuration surface: everything a recording session needs to know
//! before it opens its first perf event.

use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindingMethod {
    FramePointers,
    Dwarf,
}

#[derive(Clone, Debug)]
pub struct InstrumentedFunction {
    pub function_id: u64,
    pub absolute_address: u64,
    pub name: String,
    pub record_args: bool,
    pub record_return_value: bool,
}

#[derive(Clone, Debug)]
pub struct InstrumentedTracepoint {
    pub category: String,
    pub name: String,
}

/// Address ranges of the entry/return trampolines and the injected library
/// used by the user-space-instrumentation alternative to kernel uprobes.
#[derive(Clone, Debug)]
pub struct UserSpaceInstrumentationAddresses {
    pub entry_trampoline_range: (u64, u64),
    pub return_trampoline_range: (u64, u64),
    pub injected_library_map_name: String,
}

impl UserSpaceInstrumentationAddresses {
    pub fn is_in_entry_trampoline(&self, pc: u64) -> bool {
        pc >= self.entry_trampoline_range.0 && pc < self.entry_trampoline_range.1
    }

    pub fn is_in_return_trampoline(&self, pc: u64) -> bool {
        pc >= self.return_trampoline_range.0 && pc < self.return_trampoline_range.1
    }

    pub fn is_in_trampoline(&self, pc: u64) -> bool {
        self.is_in_entry_trampoline(pc) || self.is_in_return_trampoline(pc)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub trace_context_switches: bool,
    /// Absence disables time-based sampling.
    pub sampling_period_ns: Option<u64>,
    /// Both the kernel's user-stack dump size and the minimum required to
    /// attempt leaf-caller patching.
    pub stack_dump_size: u16,
    pub unwinding_method: UnwindingMethod,
    pub instrumented_functions: Vec<InstrumentedFunction>,
    pub trace_thread_state: bool,
    pub trace_gpu_driver: bool,
    pub instrumented_tracepoints: Vec<InstrumentedTracepoint>,
    pub user_space_instrumentation_addresses: Option<UserSpaceInstrumentationAddresses>,
    /// address -> size. Single-frame unwinds whose only frame falls in one of
    /// these ranges are classified `Complete` instead of `DwarfUnwindingError`.
    pub stop_at_functions: BTreeMap<u64, u64>,
    /// Time-order merger grace window: events older than the minimum
    /// timestamp that could still arrive, by this many nanoseconds, are
    /// released for dispatch.
    pub merge_grace_ns: u64,
}

impl Config {
    pub fn stop_at_function_containing(&self, pc: u64) -> bool {
        // BTreeMap is sorted by key (address), so the last entry with
        // start <= pc is the only candidate range that could contain it.
        self.stop_at_functions
            .range(..=pc)
            .next_back()
            .map(|(&start, &size)| pc < start + size)
            .unwrap_or(false)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            trace_context_switches: false,
            sampling_period_ns: Some(1_000_000),
            stack_dump_size: 32 * 1024,
            unwinding_method: UnwindingMethod::FramePointers,
            instrumented_functions: Vec::new(),
            trace_thread_state: false,
            trace_gpu_driver: false,
            instrumented_tracepoints: Vec::new(),
            user_space_instrumentation_addresses: None,
            stop_at_functions: BTreeMap::new(),
            merge_grace_ns: 10_000_000,
        }
    }
}
