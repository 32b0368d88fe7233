//! Tracer controller: owns the lifecycle state machine, opens the perf
//! events a session needs, and drives the single-threaded worker loop that
//! drains ring buffers through the time-order merger into the unwinding
//! visitor.
//!
//! The worker loop is a try-then-consume pass with a sleep-when-idle shape
//! and an `Arc<AtomicBool>` stop flag that can be flipped from a thread
//! other than the one running the loop; per-CPU ring buffers are fanned out
//! into [`crate::group::PerfEventGroup`].

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{Config, UnwindingMethod};
use crate::counters::Counters;
use crate::decode::StreamKind;
use crate::error::{PerfOpenError, TracerError};
use crate::group::PerfEventGroup;
use crate::listener::{Listener, ModuleInfoProvider};
use crate::merge::TimeOrderMerger;
use crate::model::MapFlags;
use crate::probes;
use crate::proc_maps;
use crate::ringbuf::{
    self, PerfEventAttr, RingBuffer, PERF_ATTR_FLAG_COMM, PERF_ATTR_FLAG_CONTEXT_SWITCH,
    PERF_ATTR_FLAG_ENABLE_ON_EXEC, PERF_ATTR_FLAG_EXCLUDE_KERNEL, PERF_ATTR_FLAG_MMAP,
    PERF_ATTR_FLAG_MMAP2, PERF_ATTR_FLAG_SAMPLE_ID_ALL, PERF_ATTR_FLAG_TASK, PERF_COUNT_SW_CPU_CLOCK,
    PERF_COUNT_SW_DUMMY, PERF_SAMPLE_CALLCHAIN, PERF_SAMPLE_CPU, PERF_SAMPLE_IP,
    PERF_SAMPLE_REGS_USER, PERF_SAMPLE_STACK_USER, PERF_SAMPLE_TID, PERF_SAMPLE_TIME,
    PERF_TYPE_SOFTWARE,
};
use crate::unwind::UnwindBackend;
use crate::visitor::UnwindingVisitor;

/// All 19 GPRs plus IP as enumerated by `perf_event_sample_regs_user_all`:
/// indices 0 through 16 plus r8-r15, see `decode::read_regs_all`.
const REGS_USER_ALL_MASK: u64 = 0x0003_ffff;

const WORKER_IDLE_SLEEP: Duration = Duration::from_millis(5);
const RING_BUFFER_DATA_PAGES_SAMPLING: usize = 4096; // 16 MiB
const RING_BUFFER_DATA_PAGES_UPROBES: usize = 2048; // 8 MiB
const RING_BUFFER_DATA_PAGES_CONTEXT_SWITCH: usize = 512; // 2 MiB

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub struct StartOptions {
    pub pid: u32,
}

/// Owns every perf-event fd a session opened, its listener, and the pieces
/// of the pipeline that dispatch decoded events into it.
pub struct Tracer<U, L, P> {
    state: TracerState,
    config: Config,
    counters: Arc<Counters>,
    group: PerfEventGroup,
    merger: TimeOrderMerger,
    visitor: UnwindingVisitor<U, L, P>,
    stop_requested: Arc<AtomicBool>,
    pid: u32,
    /// Running maximum of every timestamp seen so far, used as a stand-in
    /// for "now" when deciding what the merger can release. Perf timestamps
    /// are `CLOCK_MONOTONIC`-based and this core never reads that clock
    /// independently (no `time_mult`/`time_shift`/`time_zero` conversion is
    /// implemented), so the grace window is anchored to observed data
    /// rather than wall time.
    last_seen_timestamp: u64,
}

impl<U: UnwindBackend, L: Listener, P: ModuleInfoProvider> Tracer<U, L, P> {
    pub fn new(config: Config, unwinder: U, listener: L, module_provider: P) -> Self {
        Tracer {
            state: TracerState::Stopped,
            counters: Arc::new(Counters::new()),
            group: PerfEventGroup::new(),
            merger: TimeOrderMerger::new(),
            visitor: UnwindingVisitor::new(config.clone(), unwinder, listener, module_provider),
            stop_requested: Arc::new(AtomicBool::new(false)),
            config,
            pid: 0,
            last_seen_timestamp: 0,
        }
    }

    pub fn state(&self) -> TracerState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// A handle the caller can flip to request a stop from another thread;
    /// `stop()` sets an atomic flag checked every worker iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn listener_mut(&mut self) -> &mut L {
        self.visitor.listener_mut()
    }

    pub fn into_listener(self) -> L {
        self.visitor.into_listener()
    }

    /// Opens per-CPU perf events, snapshots the target's existing mappings,
    /// and transitions Stopped -> Starting -> Running. Does not spawn a
    /// worker thread itself; the caller drives [`Self::run_once`] or
    /// [`Self::run`] on whichever thread it chooses, since the core itself
    /// stays single-threaded and leaves that choice to the caller.
    pub fn start(&mut self, options: StartOptions) -> Result<(), TracerError> {
        self.state = TracerState::Starting;
        self.pid = options.pid;

        if !process_exists(options.pid) {
            self.state = TracerState::Stopped;
            return Err(TracerError::ProcessVanished { pid: options.pid });
        }

        self.open_sampling_events(options.pid)
            .map_err(|source| TracerError::Open { pid: options.pid, source })?;

        if self.config.trace_context_switches {
            self.open_context_switch_events(options.pid)
                .map_err(|source| TracerError::Open { pid: options.pid, source })?;
        }

        for function in self.config.instrumented_functions.clone() {
            self.open_uprobe_pair(options.pid, &function)
                .map_err(|source| TracerError::Open { pid: options.pid, source })?;
        }

        self.snapshot_initial_maps(options.pid);

        self.state = TracerState::Running;
        Ok(())
    }

    fn open_sampling_events(&mut self, pid: u32) -> Result<(), PerfOpenError> {
        let cpu_count = num_cpus::get();
        let (kind, sample_type) = match self.config.unwinding_method {
            UnwindingMethod::Dwarf => (
                StreamKind::StackSample,
                PERF_SAMPLE_IP
                    | PERF_SAMPLE_TID
                    | PERF_SAMPLE_TIME
                    | PERF_SAMPLE_CPU
                    | PERF_SAMPLE_REGS_USER
                    | PERF_SAMPLE_STACK_USER,
            ),
            UnwindingMethod::FramePointers => (
                StreamKind::CallchainSample,
                PERF_SAMPLE_IP
                    | PERF_SAMPLE_TID
                    | PERF_SAMPLE_TIME
                    | PERF_SAMPLE_CPU
                    | PERF_SAMPLE_CALLCHAIN
                    | PERF_SAMPLE_REGS_USER,
            ),
        };

        for cpu in 0..cpu_count {
            let mut attr = PerfEventAttr {
                kind: PERF_TYPE_SOFTWARE,
                size: std::mem::size_of::<PerfEventAttr>() as u32,
                config: PERF_COUNT_SW_CPU_CLOCK,
                sample_type,
                flags: PERF_ATTR_FLAG_SAMPLE_ID_ALL
                    | PERF_ATTR_FLAG_MMAP
                    | PERF_ATTR_FLAG_MMAP2
                    | PERF_ATTR_FLAG_COMM
                    | PERF_ATTR_FLAG_TASK
                    | PERF_ATTR_FLAG_ENABLE_ON_EXEC,
                sample_regs_user: REGS_USER_ALL_MASK,
                ..Default::default()
            };
            attr.sample_period_or_freq = self.config.sampling_period_ns.unwrap_or(1_000_000);
            if sample_type & PERF_SAMPLE_STACK_USER != 0 {
                attr.sample_stack_user = self.config.stack_dump_size as u32;
            }

            let fd = ringbuf::open_perf_event(&attr, pid as i32, cpu as i32, -1)?;
            let ring = RingBuffer::new(fd, RING_BUFFER_DATA_PAGES_SAMPLING)?;
            self.group.add(ring, kind, 0, cpu as u32);
        }
        Ok(())
    }

    fn open_context_switch_events(&mut self, pid: u32) -> Result<(), PerfOpenError> {
        let cpu_count = num_cpus::get();
        for cpu in 0..cpu_count {
            let attr = PerfEventAttr {
                kind: PERF_TYPE_SOFTWARE,
                size: std::mem::size_of::<PerfEventAttr>() as u32,
                config: PERF_COUNT_SW_DUMMY,
                sample_type: PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU,
                flags: PERF_ATTR_FLAG_SAMPLE_ID_ALL
                    | PERF_ATTR_FLAG_CONTEXT_SWITCH
                    | PERF_ATTR_FLAG_ENABLE_ON_EXEC
                    | PERF_ATTR_FLAG_EXCLUDE_KERNEL,
                ..Default::default()
            };
            let fd = ringbuf::open_perf_event(&attr, pid as i32, cpu as i32, -1)?;
            let ring = RingBuffer::new(fd, RING_BUFFER_DATA_PAGES_CONTEXT_SWITCH)?;
            self.group.add(ring, StreamKind::Bookkeeping, 0, cpu as u32 + 1_000);
        }
        Ok(())
    }

    fn open_uprobe_pair(
        &mut self,
        pid: u32,
        function: &crate::config::InstrumentedFunction,
    ) -> Result<(), PerfOpenError> {
        // The binary path a uprobe attaches to is read once from
        // `/proc/<pid>/exe`; every instrumented function in this core is
        // assumed to live in the main executable rather than a loaded
        // shared library, the narrower of the two readings.
        let exe_path = std::fs::read_link(format!("/proc/{pid}/exe"))
            .map_err(|source| PerfOpenError::ProcMaps { pid, source })?;
        let exe_cstring = CString::new(exe_path.to_string_lossy().as_bytes())
            .map_err(|_| PerfOpenError::ProcMaps {
                pid,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "nul byte in /proc/<pid>/exe"),
            })?;

        let (uprobe_kind, entry_kind) = if function.record_args {
            (probes::UprobeKind::EntryWithArgs, StreamKind::UprobeEntryWithArgs)
        } else {
            (probes::UprobeKind::EntrySpOnly, StreamKind::UprobeEntrySpOnly)
        };
        let entry_fd = probes::attach_uprobe(pid as i32, &exe_cstring, function.absolute_address, uprobe_kind, -1)?;
        let entry_ring = RingBuffer::new(entry_fd, RING_BUFFER_DATA_PAGES_UPROBES)?;
        self.group.add(entry_ring, entry_kind, function.function_id, 2_000_000 + function.function_id as u32);

        if function.record_return_value {
            let exit_fd =
                probes::attach_uprobe(pid as i32, &exe_cstring, function.absolute_address, probes::UprobeKind::Exit, -1)?;
            let exit_ring = RingBuffer::new(exit_fd, RING_BUFFER_DATA_PAGES_UPROBES)?;
            self.group
                .add(exit_ring, StreamKind::ProbeExit, function.function_id, 3_000_000 + function.function_id as u32);
        }
        Ok(())
    }

    fn snapshot_initial_maps(&mut self, pid: u32) {
        let Ok(regions) = proc_maps::read(pid) else {
            return;
        };
        for region in regions {
            if region.name.is_empty() {
                continue;
            }
            self.visitor.dispatch(
                &self.counters,
                crate::model::PerfEvent::Mmap {
                    tid: pid,
                    pid,
                    timestamp_ns: 0,
                    stream: u32::MAX,
                    start: region.start,
                    len: region.end - region.start,
                    page_offset: region.file_offset,
                    flags: MapFlags {
                        read: region.is_read,
                        write: region.is_write,
                        exec: region.is_executable,
                    },
                    name: region.name,
                },
            );
        }
    }

    /// One pass of the worker loop: drain a small batch from each ring
    /// buffer, feed decoded events into the merger, dispatch whatever is
    /// now old enough to be released. Returns whether any work happened, so
    /// [`Self::run`] knows whether to sleep.
    pub fn run_once(&mut self) -> bool {
        let mut decoded = Vec::new();
        let had_new_data = self.group.poll_once(&mut decoded);
        for event in &decoded {
            self.last_seen_timestamp = self.last_seen_timestamp.max(event.timestamp_ns());
        }
        for event in decoded {
            self.merger.push(event, &self.counters);
        }

        let mut ready = Vec::new();
        let drained =
            self.merger
                .pull_ready(self.last_seen_timestamp, self.config.merge_grace_ns, &mut ready);
        for event in ready {
            self.visitor.dispatch(&self.counters, event);
        }

        had_new_data || drained > 0
    }

    /// Runs the worker loop until `self.stop_handle()` is flipped, sleeping
    /// briefly whenever a pass found nothing to do: the worker yields only
    /// once both ring buffers and the ordered queue are empty.
    pub fn run(&mut self) {
        self.state = TracerState::Running;
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if !self.run_once() {
                thread::sleep(WORKER_IDLE_SLEEP);
            }
        }
        self.drain_on_stop();
        self.state = TracerState::Stopped;
    }

    /// Flushes whatever the merger is still holding, ignoring the grace
    /// window, so no buffered event is silently lost on shutdown.
    fn drain_on_stop(&mut self) {
        self.state = TracerState::Stopping;
        let mut ready = Vec::new();
        self.merger.pull_ready(u64::MAX, 0, &mut ready);
        for event in ready {
            self.visitor.dispatch(&self.counters, event);
        }
    }

    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }
}

fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}
