//! Ring-buffer reader: owns one `perf_event_open` file descriptor and its
//! mmap'd metadata page plus data buffer, and decodes raw
//! `perf_event_header`-prefixed records into typed [`PerfEvent`]s.
//!
//! The kernel writes `data_head`; the reader writes `data_tail`; the data
//! region itself is never written to from here.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use libc::{c_int, c_ulong, c_void, pid_t, syscall, SYS_perf_event_open};

use crate::error::PerfOpenError;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_THROTTLE: u32 = 5;
pub const PERF_RECORD_UNTHROTTLE: u32 = 6;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_SWITCH: u32 = 14;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_ATTR_FLAG_INHERIT: u64 = 1 << 1;
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const PERF_ATTR_FLAG_MMAP: u64 = 1 << 8;
pub const PERF_ATTR_FLAG_COMM: u64 = 1 << 9;
pub const PERF_ATTR_FLAG_FREQ: u64 = 1 << 10;
pub const PERF_ATTR_FLAG_ENABLE_ON_EXEC: u64 = 1 << 12;
pub const PERF_ATTR_FLAG_TASK: u64 = 1 << 13;
pub const PERF_ATTR_FLAG_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const PERF_ATTR_FLAG_MMAP2: u64 = 1 << 23;
pub const PERF_ATTR_FLAG_CONTEXT_SWITCH: u64 = 1 << 26;

pub const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

/// Mirrors `struct perf_event_attr`'s fixed-up-front-layout fields; only
/// those actually set by this core are listed (everything else is left
/// zeroed by `Default`, matching the kernel's "0 means unset" convention).
#[derive(Clone, Default)]
#[repr(C)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config: u64,
    pub bp_len_or_config: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
}

/// The fixed portion of the kernel-mapped metadata page preceding the data
/// ring. `reserved` pads out to the kernel's ABI offset for `data_head`; its
/// exact contents are never read.
#[repr(C)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    reserved: [u8; 118 * 8 + 4],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
    aux_head: u64,
    aux_tail: u64,
    aux_offset: u64,
    aux_size: u64,
}

#[repr(C)]
struct PerfEventHeader {
    kind: u32,
    misc: u16,
    size: u16,
}

fn sys_perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
    flags: c_ulong,
) -> c_int {
    unsafe { syscall(SYS_perf_event_open, attr as *const _, pid, cpu, group_fd, flags) as c_int }
}

unsafe fn read_head(page: *const PerfEventMmapPage) -> u64 {
    let head = ptr::read_volatile(&(*page).data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn write_tail(page: *mut PerfEventMmapPage, value: u64) {
    fence(Ordering::Release);
    ptr::write_volatile(&mut (*page).data_tail, value);
}

unsafe fn read_tail(page: *const PerfEventMmapPage) -> u64 {
    ptr::read_volatile(&(*page).data_tail)
}

/// A decoded record header plus its raw, possibly wrap-split, body.
pub enum RecordBody<'a> {
    Single(&'a [u8]),
    Split(&'a [u8], &'a [u8]),
}

impl RecordBody<'_> {
    pub fn len(&self) -> usize {
        match self {
            RecordBody::Single(s) => s.len(),
            RecordBody::Split(a, b) => a.len() + b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the (possibly split) body into one contiguous buffer. The
    /// kernel never splits a `perf_event_header` itself across the
    /// wraparound boundary, but a record's payload can straddle it.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            RecordBody::Single(s) => s.to_vec(),
            RecordBody::Split(a, b) => {
                let mut out = Vec::with_capacity(a.len() + b.len());
                out.extend_from_slice(a);
                out.extend_from_slice(b);
                out
            }
        }
    }
}

pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    /// Total record size, header included.
    pub size: u16,
}

/// One mmap'd perf ring buffer.
pub struct RingBuffer {
    fd: RawFd,
    /// Metadata page plus data region, mapped contiguously: page at offset
    /// 0, data starting one page later, per the kernel ABI.
    mapping: *mut u8,
    mapping_len: usize,
    data_size: u64,
    /// Our private read cursor; always equal to the metadata page's
    /// `data_tail` except mid-`consume_record`/`skip_record`.
    position: u64,
}

impl RingBuffer {
    /// `data_pages` must be a power of two; the mapping is `1 + data_pages`
    /// pages (metadata page followed by the data ring).
    pub fn new(fd: RawFd, data_pages: usize) -> Result<Self, PerfOpenError> {
        let page_size = 4096usize;
        let data_size = data_pages * page_size;
        let mapping_len = page_size + data_size;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(PerfOpenError::Mmap(io::Error::last_os_error()));
        }

        let position = unsafe { read_tail(addr as *const PerfEventMmapPage) };

        Ok(RingBuffer {
            fd,
            mapping: addr as *mut u8,
            mapping_len,
            data_size: data_size as u64,
            position,
        })
    }

    fn page(&self) -> *mut PerfEventMmapPage {
        self.mapping as *mut PerfEventMmapPage
    }

    fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.mapping.add(4096), self.data_size as usize)
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `data_head > data_tail`, read with the kernel's acquire-fence
    /// protocol.
    pub fn has_new_data(&self) -> bool {
        let head = unsafe { read_head(self.page()) };
        head > self.position
    }

    /// Peeks the header of the next unread record without advancing the
    /// cursor. Returns `None` if there is nothing new.
    pub fn read_header(&self) -> Option<RecordHeader> {
        let head = unsafe { read_head(self.page()) };
        if head == self.position {
            return None;
        }
        let data = self.data();
        let relative = (self.position % self.data_size) as usize;
        let header_size = std::mem::size_of::<PerfEventHeader>();
        // The kernel pads every record, including its header, to never
        // straddle the wraparound boundary, so a direct cast is always safe
        // here.
        let header =
            unsafe { &*(data[relative..relative + header_size].as_ptr() as *const PerfEventHeader) };
        Some(RecordHeader {
            kind: header.kind,
            misc: header.misc,
            size: header.size,
        })
    }

    /// Copies `header`'s body (the record minus its header) out of the ring
    /// and advances `data_tail` past the whole record. Must be called with
    /// the `RecordHeader` just returned by [`Self::read_header`].
    pub fn consume_record(&mut self, header: &RecordHeader) -> Vec<u8> {
        let body = self.body_location(header);
        let bytes = body.to_vec();
        self.advance(header.size as u64);
        bytes
    }

    /// Advances past `header`'s record without copying its body.
    pub fn skip_record(&mut self, header: &RecordHeader) {
        self.advance(header.size as u64);
    }

    fn body_location(&self, header: &RecordHeader) -> RecordBody<'_> {
        let header_size = std::mem::size_of::<PerfEventHeader>() as u64;
        let relative = self.position % self.data_size;
        let body_start = (relative + header_size) % self.data_size;
        let body_len = header.size as u64 - header_size;
        let body_end = body_start + body_len;

        let data = self.data();
        if body_end > self.data_size {
            let first_len = (self.data_size - body_start) as usize;
            let first = &data[body_start as usize..body_start as usize + first_len];
            let second_len = (body_end - self.data_size) as usize;
            let second = &data[..second_len];
            RecordBody::Split(first, second)
        } else {
            RecordBody::Single(&data[body_start as usize..body_end as usize])
        }
    }

    fn advance(&mut self, size: u64) {
        self.position += size;
        unsafe { write_tail(self.page(), self.position) };
    }
}

// The mmap'd region is plain memory with no thread affinity; the
// single-threaded-worker model means only one thread ever touches a given
// `RingBuffer` at a time, it just isn't necessarily the thread that created
// it (the controller may be handed off to a dedicated worker thread after
// `start()`).
unsafe impl Send for RingBuffer {}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapping as *mut c_void, self.mapping_len);
            libc::close(self.fd);
        }
    }
}

/// Opens one perf event with the given attr, returning its raw fd. The
/// caller is responsible for wrapping it in a [`RingBuffer`] (or, for
/// non-sampling auxiliary events such as uretprobes sharing a group leader's
/// buffer, leaving it unmapped).
pub fn open_perf_event(
    attr: &PerfEventAttr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
) -> Result<RawFd, PerfOpenError> {
    let fd = sys_perf_event_open(attr, pid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC);
    if fd < 0 {
        return Err(PerfOpenError::SysOpen(io::Error::last_os_error()));
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_struct_is_the_expected_abi_size() {
        // perf_event_attr's leading fixed fields, pre-v4 extensions; a
        // mismatch here means the kernel will read garbage for `flags` and
        // beyond.
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 96);
    }

    #[test]
    fn mmap_page_places_data_head_at_known_offset() {
        // data_head directly follows the 118-u64-plus-one-u32 reserved
        // block; this is the offset the kernel itself writes to.
        let offset = std::mem::offset_of!(PerfEventMmapPage, data_head);
        assert_eq!(offset, 1024);
    }
}
