//! Unwinding and probe-correlation engine for a Linux `perf_event_open`
//! sampling/tracing profiler.
//!
//! The core is a single-threaded pipeline: a [`tracer::Tracer`] opens perf
//! events, drains their ring buffers (`ringbuf`) through a decoder
//! (`decode`), orders them across streams (`merge`), and dispatches them
//! (`visitor`) against a maps oracle (`maps`), an unwinder (`unwind`), and
//! the probe bookkeeping managers (`return_address`, `function_call`) to
//! produce the events a [`listener::Listener`] consumes.

pub mod config;
pub mod counters;
pub mod decode;
pub mod error;
pub mod function_call;
pub mod group;
pub mod leaf_patch;
pub mod listener;
pub mod maps;
pub mod merge;
pub mod model;
pub mod probes;
pub mod proc_maps;
pub mod return_address;
pub mod ringbuf;
pub mod tracer;
pub mod unwind;
pub mod visitor;

pub use config::Config;
pub use counters::Counters;
pub use error::{ModuleInfoError, PerfOpenError, TracerError};
pub use listener::{Listener, ModuleInfoProvider};
pub use model::{CallstackSample, CallstackType, FunctionCall, ModuleInfo, ModuleUpdate};
pub use tracer::{StartOptions, Tracer, TracerState};
pub use unwind::Unwinder;
