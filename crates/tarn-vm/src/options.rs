/// Tunables of one VM instance.
#[derive(Clone, Debug)]
pub struct VmOptions {
    /// Once the call stack or the value stack grows beyond this many entries,
    /// calls in tail position reuse the caller's frame.
    pub tail_call_threshold: usize,
    /// Hard limit on call-stack frames before "stack overflow".
    pub max_call_depth: usize,
    /// Limit on nested host-side re-entries (`Vm::call`, resume, closers).
    pub max_native_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            tail_call_threshold: 65536,
            max_call_depth: 200_000,
            max_native_depth: 200,
        }
    }
}
