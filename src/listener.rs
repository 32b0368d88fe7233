//! Output interface. The visitor never blocks on a listener call, so
//! implementations must be cheap or buffer internally.

use crate::error::ModuleInfoError;
use crate::model::{AddressInfo, CallstackSample, FunctionCall, ModuleInfo, ModuleUpdate};

/// External collaborator that turns a newly observed mapping into a
/// resolved [`ModuleInfo`]. Symbol resolution and ELF/PE parsing live
/// entirely on the other side of this trait; the core only ever sees the
/// result.
pub trait ModuleInfoProvider {
    fn create_module(
        &mut self,
        filename: &str,
        address_start: u64,
        address_end: u64,
    ) -> Result<ModuleInfo, ModuleInfoError>;
}

pub trait Listener {
    fn on_callstack_sample(&mut self, sample: CallstackSample);
    fn on_function_call(&mut self, call: FunctionCall);
    fn on_address_info(&mut self, info: AddressInfo);
    fn on_module_update(&mut self, update: ModuleUpdate);

    fn on_lost_perf_records(&mut self, _count: u64) {}
    fn on_out_of_order_events_discarded(&mut self, _count: u64) {}
    fn on_errors_with_perf_event_open(&mut self, _message: String) {}
}
