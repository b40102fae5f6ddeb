use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    error::{Fault, RuntimeErrorKind},
    objects::object_native_function::{NativeCallResult, NativeObject, NativeResult},
    value::Value,
    vm::Vm,
};

/// `clock()`: seconds since the Unix epoch.
pub struct ClockTime;

impl NativeObject for ClockTime {
    fn call(&self, vm: &mut Vm, _arg_count: usize) -> NativeResult {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| Fault::new(RuntimeErrorKind::Internal, format!("Time went backwards: {}", err)))?;
        vm.push(Value::Double(duration.as_secs_f64()))?;
        Ok(NativeCallResult::Expression)
    }
}

impl ClockTime {
    pub fn new() -> Self {
        ClockTime {}
    }
}
