//! Ring-buffer group: owns every open ring buffer for a tracing session and
//! round-robins over them with a small batch size per buffer before
//! rotating, decoding each drained record into a [`PerfEvent`] and handing
//! it to the caller.
//!
//! Polling is non-blocking: no `poll(2)`, since the worker never blocks
//! waiting for data and instead moves on to the next ring buffer or sleeps.

use crate::decode;
use crate::decode::StreamKind;
use crate::model::PerfEvent;
use crate::ringbuf::RingBuffer;

/// How many records to drain from one ring buffer before moving to the
/// next, so one noisy stream can't starve the others.
const BATCH_SIZE: usize = 5;

struct Member {
    ring: RingBuffer,
    kind: StreamKind,
    /// The instrumented function this buffer's probe fires for; irrelevant
    /// for sampling/bookkeeping streams.
    function_id: u64,
    stream: u32,
}

#[derive(Default)]
pub struct PerfEventGroup {
    members: Vec<Member>,
    next: usize,
}

impl PerfEventGroup {
    pub fn new() -> Self {
        PerfEventGroup::default()
    }

    pub fn add(&mut self, ring: RingBuffer, kind: StreamKind, function_id: u64, stream: u32) {
        self.members.push(Member {
            ring,
            kind,
            function_id,
            stream,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Drains up to [`BATCH_SIZE`] records from each ring buffer in turn,
    /// appending decoded events to `out`. Returns whether any buffer had
    /// new data this pass (the worker sleeps when this is false).
    pub fn poll_once(&mut self, out: &mut Vec<PerfEvent>) -> bool {
        if self.members.is_empty() {
            return false;
        }
        let mut any_new_data = false;
        let len = self.members.len();
        for offset in 0..len {
            let idx = (self.next + offset) % len;
            let member = &mut self.members[idx];
            let mut drained = 0;
            while drained < BATCH_SIZE {
                if !member.ring.has_new_data() {
                    break;
                }
                any_new_data = true;
                let Some(header) = member.ring.read_header() else {
                    break;
                };
                if let Some(event) = decode_one(member, &header) {
                    out.push(event);
                } else {
                    member.ring.skip_record(&header);
                }
                drained += 1;
            }
        }
        self.next = (self.next + 1) % len;
        any_new_data
    }
}

fn decode_one(member: &mut Member, header: &crate::ringbuf::RecordHeader) -> Option<PerfEvent> {
    if decode::is_bookkeeping_kind(header.kind) {
        let body = member.ring.consume_record(header);
        return Some(decode_bookkeeping(&body, header.kind, member.stream));
    }
    if !decode::is_sample_kind(header.kind) {
        member.ring.skip_record(header);
        return None;
    }
    let body = member.ring.consume_record(header);
    Some(match member.kind {
        StreamKind::StackSample => decode::decode_stack_sample(&body, member.stream),
        StreamKind::CallchainSample => decode::decode_callchain_sample(&body, member.stream),
        StreamKind::UprobeEntryWithArgs => {
            decode::decode_uprobe_entry_with_args(&body, member.stream, member.function_id)
        }
        StreamKind::UprobeEntrySpOnly => {
            decode::decode_uprobe_entry_sp_only(&body, member.stream, member.function_id)
        }
        StreamKind::ProbeExit => decode::decode_probe_exit(&body, member.stream),
        StreamKind::Bookkeeping => decode_bookkeeping(&body, header.kind, member.stream),
    })
}

fn decode_bookkeeping(body: &[u8], kind: u32, stream: u32) -> PerfEvent {
    use crate::ringbuf::{
        PERF_RECORD_EXIT, PERF_RECORD_FORK, PERF_RECORD_LOST, PERF_RECORD_MMAP2, PERF_RECORD_SWITCH,
        PERF_RECORD_THROTTLE, PERF_RECORD_UNTHROTTLE,
    };
    match kind {
        PERF_RECORD_MMAP2 => decode::decode_mmap2(body, stream),
        PERF_RECORD_LOST => decode::decode_lost(body, stream, 0),
        PERF_RECORD_FORK | PERF_RECORD_EXIT => decode::decode_fork_or_exit(body, stream, kind),
        PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => decode::decode_throttle(body, stream, kind),
        PERF_RECORD_SWITCH => PerfEvent::SchedSwitch {
            tid: 0,
            pid: 0,
            timestamp_ns: 0,
            stream,
        },
        _ => PerfEvent::Lost {
            timestamp_ns: 0,
            stream,
            count: 0,
        },
    }
}
