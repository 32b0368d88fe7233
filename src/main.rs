//! CLI entry point: attaches to an already-running pid and prints decoded
//! callstacks, function calls, and module updates to stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use clap::Parser;

use probetrace_core::config::UnwindingMethod;
use probetrace_core::error::ModuleInfoError;
use probetrace_core::model::{
    AddressInfo, CallstackSample, FunctionCall, ModuleInfo, ModuleUpdate, ObjectFileType,
};
use probetrace_core::{Config, Listener, ModuleInfoProvider, StartOptions, Tracer, Unwinder};

#[derive(Parser, Debug)]
#[command(name = "probetrace", about = "Samples and traces a running process's callstacks")]
struct Opt {
    /// Process id to attach to.
    #[arg(long)]
    pid: u32,

    /// Sampling period, in nanoseconds. Omit to disable time-based sampling.
    #[arg(long)]
    sampling_period_ns: Option<u64>,

    /// Unwind using frame pointers (kernel-side callchain) instead of a
    /// software DWARF unwind over a dumped stack.
    #[arg(long)]
    frame_pointers: bool,

    /// Also trace context switches.
    #[arg(long)]
    context_switches: bool,
}

struct StdoutListener;

impl Listener for StdoutListener {
    fn on_callstack_sample(&mut self, sample: CallstackSample) {
        println!(
            "callstack pid={} tid={} ts={} kind={:?} frames={}",
            sample.pid,
            sample.tid,
            sample.timestamp_ns,
            sample.kind,
            sample.pcs.len()
        );
    }

    fn on_function_call(&mut self, call: FunctionCall) {
        println!(
            "call pid={} tid={} fn={} dur_ns={} depth={}",
            call.pid, call.tid, call.function_id, call.duration_ns, call.depth
        );
    }

    fn on_address_info(&mut self, info: AddressInfo) {
        println!(
            "address 0x{:x} module={} offset=0x{:x}",
            info.absolute_address, info.module_name, info.offset_in_function
        );
    }

    fn on_module_update(&mut self, update: ModuleUpdate) {
        println!(
            "module pid={} {} [0x{:x}, 0x{:x})",
            update.pid, update.module.name, update.module.address_start, update.module.address_end
        );
    }

    fn on_lost_perf_records(&mut self, count: u64) {
        log::warn!("lost {count} perf records");
    }

    fn on_out_of_order_events_discarded(&mut self, count: u64) {
        log::warn!("discarded {count} out-of-order events");
    }

    fn on_errors_with_perf_event_open(&mut self, message: String) {
        log::error!("perf_event_open: {message}");
    }
}

/// Stands in for the real symbol/ELF-parsing collaborator this core depends
/// on but does not implement; producing symbol names is out of scope here.
struct PassthroughModuleProvider;

impl ModuleInfoProvider for PassthroughModuleProvider {
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
            object_file_type: ObjectFileType::ElfFile,
        })
    }
}

fn main() {
    env_logger::init();

    let opt = Opt::parse();

    let config = Config {
        trace_context_switches: opt.context_switches,
        sampling_period_ns: opt.sampling_period_ns,
        unwinding_method: if opt.frame_pointers {
            UnwindingMethod::FramePointers
        } else {
            UnwindingMethod::Dwarf
        },
        ..Config::default()
    };

    let mut tracer = Tracer::new(config, Unwinder::new(), StdoutListener, PassthroughModuleProvider);

    if let Err(error) = tracer.start(StartOptions { pid: opt.pid }) {
        eprintln!("failed to start tracing pid {}: {error}", opt.pid);
        std::process::exit(1);
    }

    install_sigint_handler();

    let tracer_stop_handle = tracer.stop_handle();
    let worker = thread::spawn(move || {
        tracer.run();
        tracer
    });

    while !SIGINT_RECEIVED.load(Ordering::SeqCst) && !worker.is_finished() {
        thread::sleep(std::time::Duration::from_millis(100));
    }
    tracer_stop_handle.store(true, Ordering::SeqCst);

    let _tracer = worker.join().expect("worker thread panicked");
}

/// Process-wide, since a signal can land on any thread and a signal handler
/// has no portable way to reach a non-`'static` value.
static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

fn install_sigint_handler() {
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGINT,
            nix::sys::signal::SigHandler::Handler(handle_sigint),
        );
    }
}

extern "C" fn handle_sigint(_: i32) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}
