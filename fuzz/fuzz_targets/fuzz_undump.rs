#![no_main]

use libfuzzer_sys::fuzz_target;
use tarn_vm::{Vm, VmOptions};

fuzz_target!(|data: &[u8]| {
    // Malformed chunks must be rejected with an error, never a panic,
    // and must not leave partial code behind.
    let mut vm = Vm::new(VmOptions {
        max_call_depth: 256,
        ..VmOptions::default()
    });
    let before = vm.code.len();
    match vm.undump(data) {
        Ok(function) => {
            // Running an accepted chunk may fail, but never panic.
            let _ = vm.call(function, vec![]);
        }
        Err(_) => assert_eq!(vm.code.len(), before),
    }
});
