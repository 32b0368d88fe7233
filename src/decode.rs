//! Record decoder: turns raw `perf_event_header`-prefixed bytes into typed
//! events. Every ring buffer is opened with one fixed `sample_type` mask for
//! its whole lifetime, so which fields are present in a
//! `PERF_RECORD_SAMPLE` body is known statically from which [`StreamKind`]
//! produced it rather than re-derived from the header.

use byteorder::{ByteOrder, LittleEndian as LE};

use crate::model::{AbiArgRegs, MapFlags, PerfEvent, RegsUserAll, StackSlice};
use crate::ringbuf::{
    PERF_RECORD_EXIT, PERF_RECORD_FORK, PERF_RECORD_LOST, PERF_RECORD_MMAP2, PERF_RECORD_SAMPLE,
    PERF_RECORD_SWITCH, PERF_RECORD_THROTTLE, PERF_RECORD_UNTHROTTLE,
};

/// Which `perf_event_open` attr a physical ring buffer was opened with,
/// i.e. how to interpret a `PERF_RECORD_SAMPLE` body read from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// IP, TID, TIME, CPU, REGS_USER, STACK_USER.
    StackSample,
    /// IP, TID, TIME, CPU, CALLCHAIN, REGS_USER.
    CallchainSample,
    /// Full register snapshot on entry (uprobe configured to record args).
    UprobeEntryWithArgs,
    /// SP+IP only on entry (uprobe with no arg recording, or the
    /// user-space-instrumentation entry trampoline).
    UprobeEntrySpOnly,
    /// Return value (`rax`) via a single-register `REGS_USER` sample on a
    /// uretprobe trampoline firing.
    ProbeExit,
    /// mmap/task/fork/exit/throttle bookkeeping events, no sample body.
    Bookkeeping,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn u32(&mut self) -> u32 {
        let v = LE::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        v
    }

    fn u64(&mut self) -> u64 {
        let v = LE::read_u64(&self.data[self.pos..]);
        self.pos += 8;
        v
    }

    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        slice
    }

    fn cstr(&mut self) -> String {
        let remaining = &self.data[self.pos..];
        let end = remaining.iter().position(|&b| b == 0).unwrap_or(remaining.len());
        let s = String::from_utf8_lossy(&remaining[..end]).into_owned();
        // mmap/comm names are null-padded to an 8-byte boundary.
        let consumed = (end + 1 + 7) / 8 * 8;
        self.pos += consumed.min(remaining.len());
        s
    }
}

pub fn decode_mmap2(body: &[u8], stream: u32) -> PerfEvent {
    let mut c = Cursor::new(body);
    let pid = c.u32();
    let tid = c.u32();
    let start = c.u64();
    let len = c.u64();
    let page_offset = c.u64();
    // dev(u32) + inode(u64) + inode_generation(u64), present in the
    // "real mmap" variant of MMAP2 (the only one a live perf_event_open
    // session emits; the build-id variant is a perf.data-only extension).
    let _dev = c.u32();
    let _inode = c.u64();
    let _inode_generation = c.u64();
    let prot = c.u32();
    let _flags = c.u32();
    let name = c.cstr();

    const PROT_EXEC: u32 = 0x4;
    const PROT_WRITE: u32 = 0x2;
    const PROT_READ: u32 = 0x1;

    PerfEvent::Mmap {
        tid,
        pid,
        timestamp_ns: 0,
        stream,
        start,
        len,
        page_offset,
        flags: MapFlags {
            read: prot & PROT_READ != 0,
            write: prot & PROT_WRITE != 0,
            exec: prot & PROT_EXEC != 0,
        },
        name,
    }
}

fn read_regs_all(c: &mut Cursor) -> RegsUserAll {
    let _abi = c.u64();
    RegsUserAll {
        ax: c.u64(),
        bx: c.u64(),
        cx: c.u64(),
        dx: c.u64(),
        si: c.u64(),
        di: c.u64(),
        bp: c.u64(),
        sp: c.u64(),
        ip: c.u64(),
        flags: c.u64(),
        cs: c.u64(),
        ss: c.u64(),
        r8: c.u64(),
        r9: c.u64(),
        r10: c.u64(),
        r11: c.u64(),
        r12: c.u64(),
        r13: c.u64(),
        r14: c.u64(),
        r15: c.u64(),
    }
}

pub fn decode_stack_sample(body: &[u8], stream: u32) -> PerfEvent {
    let mut c = Cursor::new(body);
    let ip = c.u64();
    let pid = c.u32();
    let tid = c.u32();
    let time = c.u64();
    let cpu = c.u32();
    let _res = c.u32();
    let mut regs = read_regs_all(&mut c);
    regs.ip = ip;
    let dump_size = c.u64() as usize;
    let data = c.bytes(dump_size).to_vec();
    let dyn_size = if dump_size > 0 { c.u64() } else { 0 };
    let _ = cpu;

    PerfEvent::StackSample {
        tid,
        pid,
        timestamp_ns: time,
        stream,
        regs,
        stack: StackSlice {
            start: regs_sp_from(&data, dyn_size, regs.sp),
            bytes: data,
        },
    }
}

/// The kernel's stack dump starts at the sampled `%rsp`; `dyn_size` (how
/// much of the dump is "live" rather than past the thread's actual stack
/// top) doesn't change the dump's start address, only how much of it is
/// meaningful, so it is recorded but not used to adjust `start`.
fn regs_sp_from(_data: &[u8], _dyn_size: u64, sp: u64) -> u64 {
    sp
}

pub fn decode_callchain_sample(body: &[u8], stream: u32) -> PerfEvent {
    let mut c = Cursor::new(body);
    let ip = c.u64();
    let pid = c.u32();
    let tid = c.u32();
    let time = c.u64();
    let cpu = c.u32();
    let _res = c.u32();
    let nr = c.u64();
    let mut ips = Vec::with_capacity(nr as usize);
    for _ in 0..nr {
        ips.push(c.u64());
    }
    let mut regs = read_regs_all(&mut c);
    regs.ip = ip;
    let _ = cpu;

    PerfEvent::CallchainSample {
        tid,
        pid,
        timestamp_ns: time,
        stream,
        regs,
        ips,
        // The synthetic one-step DWARF unwind used by the leaf-caller
        // patcher needs a stack dump; callers that need it attach a small
        // STACK_USER mask alongside CALLCHAIN and patch this in after
        // decoding proper, since the two fields interleave by sample_type
        // bit order and aren't both modeled here.
        stack: StackSlice {
            start: regs.sp,
            bytes: Vec::new(),
        },
    }
}

/// A uprobe fires on the target's very first instruction, before the
/// prologue pushes anything, so the word at `[rsp]` at that moment is still
/// the `call` instruction's return address. Both entry streams carry an
/// 8-byte `STACK_USER` dump for exactly this reason, recovering
/// `original_return_address` without needing a uretprobe pair.
fn read_return_address_from_stack_dump(c: &mut Cursor) -> u64 {
    let dump_size = c.u64() as usize;
    let bytes = c.bytes(dump_size);
    let return_address = if dump_size >= 8 { LE::read_u64(bytes) } else { 0 };
    if dump_size > 0 {
        let _dyn_size = c.u64();
    }
    return_address
}

pub fn decode_uprobe_entry_with_args(body: &[u8], stream: u32, function_id: u64) -> PerfEvent {
    let mut c = Cursor::new(body);
    let ip = c.u64();
    let pid = c.u32();
    let tid = c.u32();
    let time = c.u64();
    let cpu = c.u32();
    let _res = c.u32();
    let regs = read_regs_all(&mut c);
    let original_return_address = read_return_address_from_stack_dump(&mut c);

    PerfEvent::Uprobe {
        tid,
        pid,
        timestamp_ns: time,
        stream,
        function_id,
        cpu,
        sp: regs.sp,
        ip,
        original_return_address,
        args: Some(AbiArgRegs {
            di: regs.di,
            si: regs.si,
            dx: regs.dx,
            cx: regs.cx,
            r8: regs.r8,
            r9: regs.r9,
        }),
    }
}

pub fn decode_uprobe_entry_sp_only(body: &[u8], stream: u32, function_id: u64) -> PerfEvent {
    let mut c = Cursor::new(body);
    let ip = c.u64();
    let pid = c.u32();
    let tid = c.u32();
    let time = c.u64();
    let cpu = c.u32();
    let _res = c.u32();
    let _abi = c.u64();
    let sp = c.u64();
    let ip_reg = c.u64();
    let _ = ip_reg;
    let original_return_address = read_return_address_from_stack_dump(&mut c);

    PerfEvent::Uprobe {
        tid,
        pid,
        timestamp_ns: time,
        stream,
        function_id,
        cpu,
        sp,
        ip,
        original_return_address,
        args: None,
    }
}

/// `attach_uprobe` configures every `UprobeKind::Exit` event with a
/// single-register (`ax`) `PERF_SAMPLE_REGS_USER` mask, so a record from this
/// stream always carries the function's return value.
pub fn decode_probe_exit(body: &[u8], stream: u32) -> PerfEvent {
    let mut c = Cursor::new(body);
    let _ip = c.u64();
    let pid = c.u32();
    let tid = c.u32();
    let time = c.u64();
    let cpu = c.u32();
    let _res = c.u32();
    let _abi = c.u64();
    let return_value = c.u64();
    let _ = cpu;

    PerfEvent::Uretprobe {
        tid,
        pid,
        timestamp_ns: time,
        stream,
        return_value: Some(return_value),
    }
}

pub fn decode_lost(body: &[u8], stream: u32, timestamp_ns: u64) -> PerfEvent {
    let mut c = Cursor::new(body);
    let _id = c.u64();
    let count = c.u64();
    PerfEvent::Lost {
        timestamp_ns,
        stream,
        count,
    }
}

pub fn decode_fork_or_exit(body: &[u8], stream: u32, kind: u32) -> PerfEvent {
    let mut c = Cursor::new(body);
    let pid = c.u32();
    let _ppid = c.u32();
    let tid = c.u32();
    let _ptid = c.u32();
    let time = c.u64();

    if kind == PERF_RECORD_EXIT {
        PerfEvent::Exit {
            tid,
            pid,
            timestamp_ns: time,
            stream,
        }
    } else {
        PerfEvent::Fork {
            tid,
            pid,
            timestamp_ns: time,
            stream,
        }
    }
}

pub fn decode_throttle(body: &[u8], stream: u32, kind: u32) -> PerfEvent {
    let mut c = Cursor::new(body);
    let time = c.u64();
    let _id = c.u64();
    let _stream_id = c.u64();
    PerfEvent::Throttle {
        timestamp_ns: time,
        stream,
        unthrottle: kind == PERF_RECORD_UNTHROTTLE,
    }
}

pub fn is_bookkeeping_kind(kind: u32) -> bool {
    matches!(
        kind,
        PERF_RECORD_MMAP2 | PERF_RECORD_LOST | PERF_RECORD_FORK | PERF_RECORD_EXIT | PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE | PERF_RECORD_SWITCH
    )
}

pub fn is_sample_kind(kind: u32) -> bool {
    kind == PERF_RECORD_SAMPLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstr_reads_null_terminated_name_and_pads_to_eight() {
        let mut data = b"abc\0\0\0\0\0".to_vec();
        data.extend_from_slice(&[0xFFu8; 8]);
        let mut c = Cursor::new(&data);
        assert_eq!(c.cstr(), "abc");
        assert_eq!(c.pos, 8);
    }

    #[test]
    fn decode_mmap2_reads_protection_flags() {
        let mut body = Vec::new();
        body.extend_from_slice(&42u32.to_le_bytes()); // pid
        body.extend_from_slice(&7u32.to_le_bytes()); // tid
        body.extend_from_slice(&0x1000u64.to_le_bytes()); // start
        body.extend_from_slice(&0x2000u64.to_le_bytes()); // len
        body.extend_from_slice(&0u64.to_le_bytes()); // page_offset
        body.extend_from_slice(&0u32.to_le_bytes()); // dev
        body.extend_from_slice(&0u64.to_le_bytes()); // inode
        body.extend_from_slice(&0u64.to_le_bytes()); // inode_generation
        body.extend_from_slice(&0x5u32.to_le_bytes()); // prot: read+exec
        body.extend_from_slice(&0u32.to_le_bytes()); // flags
        body.extend_from_slice(b"/bin/true\0\0\0\0\0\0\0");

        let event = decode_mmap2(&body, 3);
        match event {
            PerfEvent::Mmap {
                pid,
                tid,
                start,
                len,
                flags,
                name,
                stream,
                ..
            } => {
                assert_eq!(pid, 42);
                assert_eq!(tid, 7);
                assert_eq!(start, 0x1000);
                assert_eq!(len, 0x2000);
                assert!(flags.read && flags.exec && !flags.write);
                assert_eq!(name, "/bin/true");
                assert_eq!(stream, 3);
            }
            _ => panic!("expected Mmap"),
        }
    }

    #[test]
    fn decode_uprobe_entry_sp_only_recovers_return_address_from_stack_dump() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x4010u64.to_le_bytes()); // ip
        body.extend_from_slice(&100u32.to_le_bytes()); // pid
        body.extend_from_slice(&101u32.to_le_bytes()); // tid
        body.extend_from_slice(&2_000u64.to_le_bytes()); // time
        body.extend_from_slice(&0u32.to_le_bytes()); // cpu
        body.extend_from_slice(&0u32.to_le_bytes()); // res
        body.extend_from_slice(&0u64.to_le_bytes()); // regs abi
        body.extend_from_slice(&0x7fff_0000u64.to_le_bytes()); // sp
        body.extend_from_slice(&0x4010u64.to_le_bytes()); // ip register
        body.extend_from_slice(&8u64.to_le_bytes()); // stack dump size
        body.extend_from_slice(&0xdead_beef_u64.to_le_bytes()); // return address
        body.extend_from_slice(&8u64.to_le_bytes()); // dyn_size

        match decode_uprobe_entry_sp_only(&body, 5, 42) {
            PerfEvent::Uprobe {
                sp,
                ip,
                original_return_address,
                args,
                ..
            } => {
                assert_eq!(sp, 0x7fff_0000);
                assert_eq!(ip, 0x4010);
                assert_eq!(original_return_address, 0xdead_beef);
                assert!(args.is_none());
            }
            _ => panic!("expected Uprobe"),
        }
    }

    #[test]
    fn decode_probe_exit_recovers_return_value_from_ax_register() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x4020u64.to_le_bytes()); // ip
        body.extend_from_slice(&100u32.to_le_bytes()); // pid
        body.extend_from_slice(&101u32.to_le_bytes()); // tid
        body.extend_from_slice(&3_000u64.to_le_bytes()); // time
        body.extend_from_slice(&0u32.to_le_bytes()); // cpu
        body.extend_from_slice(&0u32.to_le_bytes()); // res
        body.extend_from_slice(&0u64.to_le_bytes()); // regs abi
        body.extend_from_slice(&456u64.to_le_bytes()); // ax

        match decode_probe_exit(&body, 4) {
            PerfEvent::Uretprobe {
                pid,
                tid,
                timestamp_ns,
                return_value,
                ..
            } => {
                assert_eq!(pid, 100);
                assert_eq!(tid, 101);
                assert_eq!(timestamp_ns, 3_000);
                assert_eq!(return_value, Some(456));
            }
            _ => panic!("expected Uretprobe"),
        }
    }

    #[test]
    fn decode_lost_reads_count() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u64.to_le_bytes());
        body.extend_from_slice(&9u64.to_le_bytes());
        match decode_lost(&body, 1, 500) {
            PerfEvent::Lost { count, stream, timestamp_ns } => {
                assert_eq!(count, 9);
                assert_eq!(stream, 1);
                assert_eq!(timestamp_ns, 500);
            }
            _ => panic!("expected Lost"),
        }
    }
}
