//! Data model shared by every stage of the pipeline: decoded kernel records,
//! the register/stack views the unwinder consumes, and the events emitted to
//! the [`crate::listener::Listener`].

use std::fmt;

/// A single memory mapping as tracked by the [`crate::maps::Maps`] oracle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub page_offset: u64,
    pub flags: MapFlags,
    pub name: String,
    /// Difference between a symbol's virtual address in the file and its
    /// runtime address. `u64::MAX` is used as the sentinel for "infinite",
    /// i.e. the special `[uprobes]` trampoline mapping, which never needs a
    /// file-relative offset computed.
    pub load_bias: u64,
}

pub const INFINITE_LOAD_BIAS: u64 = u64::MAX;

/// Name of the kernel-installed uprobe/uretprobe trampoline mapping, as it
/// appears in `/proc/<pid>/maps` while a uprobe is attached.
pub const UPROBES_MAPPING_NAME: &str = "[uprobes]";

impl Mapping {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_uprobes_trampoline(&self) -> bool {
        self.name == UPROBES_MAPPING_NAME
    }

    pub fn file_relative_offset(&self, addr: u64) -> u64 {
        debug_assert!(self.contains(addr));
        (addr - self.start) + self.page_offset
    }
}

/// Minimal read/write/exec bitset; kept as a plain struct (rather than
/// pulling in `bitflags`) since it has exactly three bits and no set algebra
/// beyond construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MapFlags {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl MapFlags {
    pub const NONE: MapFlags = MapFlags {
        read: false,
        write: false,
        exec: false,
    };

    pub fn exec() -> Self {
        MapFlags {
            read: true,
            write: false,
            exec: true,
        }
    }
}

/// Full x86-64 general-purpose register snapshot, in `PERF_REG_X86_*` order,
/// as carried by a [`PerfEvent::StackSample`] or [`PerfEvent::CallchainSample`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RegsUserAll {
    pub ax: u64,
    pub bx: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub bp: u64,
    pub sp: u64,
    pub ip: u64,
    pub flags: u64,
    pub cs: u64,
    pub ss: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Sparse register snapshot used by probe-entry records that only ask the
/// kernel for `sp` and `ip` (the common case for uprobes with no argument
/// recording).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RegsUserSp {
    pub sp: u64,
    pub ip: u64,
}

/// The six System V AMD64 integer-argument registers, captured at function
/// entry when `record_args` is set for that instrumented function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AbiArgRegs {
    pub di: u64,
    pub si: u64,
    pub dx: u64,
    pub cx: u64,
    pub r8: u64,
    pub r9: u64,
}

/// A byte range dumped from the target's stack, attached to a sample.
#[derive(Clone)]
pub struct StackSlice {
    pub start: u64,
    pub bytes: Vec<u8>,
}

impl StackSlice {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.start + self.len()
    }

    /// Two slices are disjoint if neither's range overlaps the other's.
    pub fn is_disjoint_from(&self, other: &StackSlice) -> bool {
        self.end() <= other.start || other.end() <= self.start
    }
}

impl fmt::Debug for StackSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackSlice")
            .field("start", &format_args!("{:#x}", self.start))
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A decoded kernel record, time-ordered by [`crate::merge::TimeOrderMerger`]
/// and dispatched by [`crate::visitor::UnwindingVisitor`].
///
/// Every variant carries `tid`, `timestamp_ns`, and `stream` (the identifier
/// of the ring buffer / CPU it was read from, used only for merge-ordering
/// tie-breaks, never for semantics).
#[derive(Clone, Debug)]
pub enum PerfEvent {
    Fork {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
    },
    Exit {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
    },
    Mmap {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
        start: u64,
        len: u64,
        page_offset: u64,
        flags: MapFlags,
        name: String,
    },
    StackSample {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
        regs: RegsUserAll,
        stack: StackSlice,
    },
    CallchainSample {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
        regs: RegsUserAll,
        /// Frame-pointer-walked IP chain as the kernel produced it: index 0
        /// is a kernel-context marker, index 1 the innermost user pc.
        ips: Vec<u64>,
        /// Raw stack dump taken alongside the callchain, needed by the
        /// leaf-function caller patcher ([`crate::leaf_patch`]) to take one
        /// DWARF step past the innermost frame.
        stack: StackSlice,
    },
    Uprobe {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
        function_id: u64,
        cpu: u32,
        sp: u64,
        ip: u64,
        original_return_address: u64,
        args: Option<AbiArgRegs>,
    },
    Uretprobe {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
        return_value: Option<u64>,
    },
    UserSpaceFunctionEntry {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
        function_id: u64,
        sp: u64,
        return_address: u64,
    },
    UserSpaceFunctionExit {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
    },
    SchedSwitch {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
    },
    SchedWakeup {
        tid: u32,
        pid: u32,
        timestamp_ns: u64,
        stream: u32,
    },
    Lost {
        timestamp_ns: u64,
        stream: u32,
        count: u64,
    },
    Throttle {
        timestamp_ns: u64,
        stream: u32,
        unthrottle: bool,
    },
}

impl PerfEvent {
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            PerfEvent::Fork { timestamp_ns, .. }
            | PerfEvent::Exit { timestamp_ns, .. }
            | PerfEvent::Mmap { timestamp_ns, .. }
            | PerfEvent::StackSample { timestamp_ns, .. }
            | PerfEvent::CallchainSample { timestamp_ns, .. }
            | PerfEvent::Uprobe { timestamp_ns, .. }
            | PerfEvent::Uretprobe { timestamp_ns, .. }
            | PerfEvent::UserSpaceFunctionEntry { timestamp_ns, .. }
            | PerfEvent::UserSpaceFunctionExit { timestamp_ns, .. }
            | PerfEvent::SchedSwitch { timestamp_ns, .. }
            | PerfEvent::SchedWakeup { timestamp_ns, .. }
            | PerfEvent::Lost { timestamp_ns, .. }
            | PerfEvent::Throttle { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    pub fn stream(&self) -> u32 {
        match self {
            PerfEvent::Fork { stream, .. }
            | PerfEvent::Exit { stream, .. }
            | PerfEvent::Mmap { stream, .. }
            | PerfEvent::StackSample { stream, .. }
            | PerfEvent::CallchainSample { stream, .. }
            | PerfEvent::Uprobe { stream, .. }
            | PerfEvent::Uretprobe { stream, .. }
            | PerfEvent::UserSpaceFunctionEntry { stream, .. }
            | PerfEvent::UserSpaceFunctionExit { stream, .. }
            | PerfEvent::SchedSwitch { stream, .. }
            | PerfEvent::SchedWakeup { stream, .. }
            | PerfEvent::Lost { stream, .. }
            | PerfEvent::Throttle { stream, .. } => *stream,
        }
    }
}

/// Classification tag attached to every emitted callstack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallstackType {
    Complete,
    InUprobes,
    InUserSpaceInstrumentation,
    DwarfUnwindingError,
    FramePointerUnwindingError,
    StackTopForDwarfUnwindingTooSmall,
    CallstackPatchingFailed,
}

/// An ordered sequence of program counters plus its classification. Never
/// empty for an emitted sample.
#[derive(Clone, Debug)]
pub struct CallstackSample {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub pcs: Vec<u64>,
    pub kind: CallstackType,
}

/// A matched probe entry/exit pair.
#[derive(Clone, Debug)]
pub struct FunctionCall {
    pub pid: u32,
    pub tid: u32,
    pub function_id: u64,
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
    pub depth: u32,
    pub return_value: Option<u64>,
    pub registers: Option<AbiArgRegs>,
}

/// Address -> (module, function, offset) annotation, emitted at most once per
/// absolute address for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct AddressInfo {
    pub absolute_address: u64,
    pub module_name: String,
    pub function_name: String,
    pub offset_in_function: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectFileType {
    ElfFile,
    CoffFile,
}

#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub name: String,
    pub file_path: String,
    pub address_start: u64,
    pub address_end: u64,
    pub load_bias: u64,
    pub executable_segment_offset: u64,
    pub object_file_type: ObjectFileType,
}

#[derive(Clone, Debug)]
pub struct ModuleUpdate {
    pub pid: u32,
    pub timestamp_ns: u64,
    pub module: ModuleInfo,
}
