//! Function-call manager: pairs up uprobe/uretprobe records on the same
//! thread into a single [`FunctionCall`], tracking call depth.

use rustc_hash::FxHashMap;

use crate::model::{AbiArgRegs, FunctionCall};

struct OpenCall {
    function_id: u64,
    begin_timestamp_ns: u64,
    args: Option<AbiArgRegs>,
}

#[derive(Default)]
pub struct FunctionCallManager {
    open_calls: FxHashMap<u32, Vec<OpenCall>>,
}

impl FunctionCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_function_entry(
        &mut self,
        tid: u32,
        function_id: u64,
        begin_timestamp_ns: u64,
        args: Option<AbiArgRegs>,
    ) {
        self.open_calls.entry(tid).or_default().push(OpenCall {
            function_id,
            begin_timestamp_ns,
            args,
        });
    }

    /// Matches the most recent open call on this thread against a uretprobe
    /// firing at `end_timestamp_ns`. Returns `None` if no call was open
    /// (e.g. the uprobe fired before tracing started). Depth is the number
    /// of calls still open on this thread *after* this one is popped, so the
    /// outermost call on an empty stack is depth 0.
    pub fn process_function_exit(
        &mut self,
        pid: u32,
        tid: u32,
        end_timestamp_ns: u64,
        return_value: Option<u64>,
    ) -> Option<FunctionCall> {
        let stack = self.open_calls.get_mut(&tid)?;
        let call = stack.pop()?;
        let depth = stack.len() as u32;
        if stack.is_empty() {
            self.open_calls.remove(&tid);
        }

        Some(FunctionCall {
            pid,
            tid,
            function_id: call.function_id,
            duration_ns: end_timestamp_ns.saturating_sub(call.begin_timestamp_ns),
            end_timestamp_ns,
            depth,
            return_value,
            registers: call.args,
        })
    }

    pub fn open_call_count(&self, tid: u32) -> usize {
        self.open_calls.get(&tid).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_call_has_depth_zero() {
        let mut mgr = FunctionCallManager::new();
        mgr.process_function_entry(1, 42, 1_000, None);
        let call = mgr.process_function_exit(7, 1, 1_500, None).unwrap();
        assert_eq!(call.function_id, 42);
        assert_eq!(call.duration_ns, 500);
        assert_eq!(call.depth, 0);
        assert_eq!(call.pid, 7);
    }

    #[test]
    fn nested_calls_report_increasing_then_decreasing_depth() {
        let mut mgr = FunctionCallManager::new();
        mgr.process_function_entry(1, 1, 0, None);
        mgr.process_function_entry(1, 2, 10, None);
        mgr.process_function_entry(1, 3, 20, None);

        let innermost = mgr.process_function_exit(9, 1, 30, None).unwrap();
        assert_eq!(innermost.function_id, 3);
        assert_eq!(innermost.depth, 2);

        let middle = mgr.process_function_exit(9, 1, 40, None).unwrap();
        assert_eq!(middle.function_id, 2);
        assert_eq!(middle.depth, 1);

        let outer = mgr.process_function_exit(9, 1, 50, None).unwrap();
        assert_eq!(outer.function_id, 1);
        assert_eq!(outer.depth, 0);
    }

    #[test]
    fn exit_with_no_matching_entry_returns_none() {
        let mut mgr = FunctionCallManager::new();
        assert!(mgr.process_function_exit(1, 99, 100, None).is_none());
    }

    #[test]
    fn args_are_carried_from_entry_to_exit() {
        let mut mgr = FunctionCallManager::new();
        let args = AbiArgRegs {
            di: 1,
            si: 2,
            dx: 3,
            cx: 4,
            r8: 5,
            r9: 6,
        };
        mgr.process_function_entry(1, 42, 0, Some(args));
        let call = mgr
            .process_function_exit(1, 1, 10, Some(0xabc))
            .unwrap();
        assert_eq!(call.registers, Some(args));
        assert_eq!(call.return_value, Some(0xabc));
    }
}
