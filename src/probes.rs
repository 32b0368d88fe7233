//! Uprobe/uretprobe attachment via the kernel's dynamic PMU interface: one
//! uprobe pair per configured instrumented function.
//!
//! A uprobe has no static `PERF_TYPE_*`; its type id and the bit position of
//! the "is this a return probe" flag are both read from sysfs at runtime,
//! then folded into a `perf_event_open` attr's `type`/`config` the same way
//! any other dynamic PMU event is opened.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;

use crate::error::PerfOpenError;
use crate::ringbuf::{
    self, PerfEventAttr, PERF_ATTR_FLAG_SAMPLE_ID_ALL, PERF_SAMPLE_CPU, PERF_SAMPLE_IP,
    PERF_SAMPLE_REGS_USER, PERF_SAMPLE_STACK_USER, PERF_SAMPLE_TID, PERF_SAMPLE_TIME,
};

/// Which of a uprobe/uretprobe pair is being opened. Distinct from
/// [`crate::decode::StreamKind`]: this picks what to *ask the kernel for*,
/// the other picks how to *read what comes back* — they stay in lockstep by
/// construction (`Tracer::open_uprobe_pair` derives both from the same
/// `InstrumentedFunction`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UprobeKind {
    /// Entry trampoline, full GPR snapshot so argument registers are
    /// available (`function.record_args`).
    EntryWithArgs,
    /// Entry trampoline, SP+IP only.
    EntrySpOnly,
    /// Return trampoline (uretprobe).
    Exit,
}

/// `PERF_REG_X86_SP` (7) and `PERF_REG_X86_IP` (8), the sparse set an
/// entry-without-args record asks the kernel for.
const PERF_REG_X86_SP: u64 = 7;
const PERF_REG_X86_IP: u64 = 8;

/// `PERF_REG_X86_AX` (0). At the instant a uretprobe fires, the callee has
/// already returned, so `ax` holds its System V return value.
const PERF_REG_X86_AX: u64 = 0;

/// Same bit layout `Tracer` uses for sampling events
/// (`perf_event_sample_regs_user_all`).
const REGS_USER_ALL_MASK: u64 = 0x0003_ffff;

/// Bytes of stack dumped on an entry trampoline so the caller's return
/// address (the word at `[rsp]` before the callee's prologue runs) can be
/// recovered without a uretprobe.
const RETURN_ADDRESS_STACK_DUMP_SIZE: u32 = 8;

const UPROBE_TYPE_PATH: &str = "/sys/bus/event_source/devices/uprobe/type";
const UPROBE_RETPROBE_BIT_PATH: &str = "/sys/bus/event_source/devices/uprobe/format/retprobe";

fn read_dynamic_pmu_type(path: &'static str) -> Result<u32, PerfOpenError> {
    let contents = fs::read_to_string(path).map_err(|source| PerfOpenError::DynamicPmuType { path, source })?;
    contents
        .trim()
        .parse::<u32>()
        .map_err(|_| PerfOpenError::DynamicPmuType {
            path,
            source: io::Error::new(io::ErrorKind::InvalidData, "dynamic PMU type file did not contain an integer"),
        })
}

/// The kernel exposes the retprobe flag's bit position as `config:N` in its
/// format file rather than the bit value itself.
fn read_retprobe_bit(path: &'static str) -> Result<u32, PerfOpenError> {
    let contents = fs::read_to_string(path).map_err(|source| PerfOpenError::DynamicPmuType { path, source })?;
    let bit_str = contents.trim().strip_prefix("config:").ok_or_else(|| {
        PerfOpenError::DynamicPmuType {
            path,
            source: io::Error::new(io::ErrorKind::InvalidData, "format file did not start with 'config:'"),
        }
    })?;
    bit_str
        .parse::<u32>()
        .map_err(|_| PerfOpenError::DynamicPmuType {
            path,
            source: io::Error::new(io::ErrorKind::InvalidData, "retprobe format bit was not an integer"),
        })
}

/// Attaches a uprobe (if `is_return_probe` is false) or uretprobe (if true)
/// at `file_offset` bytes into `binary_path`, for `pid` (or all processes,
/// if the dynamic PMU allows `-1`). Returns the new event's raw fd; the
/// caller decides whether to give it its own ring buffer or share one.
pub fn attach_uprobe(
    pid: i32,
    binary_path: &CString,
    file_offset: u64,
    kind: UprobeKind,
    group_fd: i32,
) -> Result<RawFd, PerfOpenError> {
    let ty = read_dynamic_pmu_type(UPROBE_TYPE_PATH)?;
    let config = if kind == UprobeKind::Exit {
        1u64 << read_retprobe_bit(UPROBE_RETPROBE_BIT_PATH)?
    } else {
        0
    };

    let mut attr = PerfEventAttr {
        kind: ty,
        size: std::mem::size_of::<PerfEventAttr>() as u32,
        config,
        sample_type: PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU,
        flags: PERF_ATTR_FLAG_SAMPLE_ID_ALL,
        ..Default::default()
    };
    match kind {
        UprobeKind::EntryWithArgs => {
            attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
            attr.sample_regs_user = REGS_USER_ALL_MASK;
            attr.sample_stack_user = RETURN_ADDRESS_STACK_DUMP_SIZE;
        }
        UprobeKind::EntrySpOnly => {
            attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
            attr.sample_regs_user = (1 << PERF_REG_X86_SP) | (1 << PERF_REG_X86_IP);
            attr.sample_stack_user = RETURN_ADDRESS_STACK_DUMP_SIZE;
        }
        UprobeKind::Exit => {
            attr.sample_type |= PERF_SAMPLE_REGS_USER;
            attr.sample_regs_user = 1 << PERF_REG_X86_AX;
        }
    }
    // `config1`/`config2` carry the probe location for dynamic PMUs; they
    // don't have named fields in our trimmed-down `PerfEventAttr` because
    // nothing else in this core needs them, so they're folded into
    // `bp_addr_or_config`/`bp_len_or_config`, which occupy the identical
    // byte offsets in the real kernel struct.
    attr.bp_addr_or_config = binary_path.as_ptr() as u64;
    attr.bp_len_or_config = file_offset;

    ringbuf::open_perf_event(&attr, pid, -1, group_fd)
}
