use crate::{error::Fault, vm::Vm};

/// What a native left on the stack: `Expression` means it pushed exactly one
/// result, `Void` means it pushed nothing and the call evaluates to `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCallResult {
    Expression,
    Void,
}

pub type NativeResult = Result<NativeCallResult, Fault>;

/// Host-callable body. Arguments are read with `Vm::get_arg`: index 0 is the
/// receiver (or the native itself for a free function), 1.. the declared
/// arguments.
pub trait NativeObject {
    fn call(&self, vm: &mut Vm, arg_count: usize) -> NativeResult;
}

impl<F> NativeObject for F
where
    F: Fn(&mut Vm, usize) -> NativeResult,
{
    fn call(&self, vm: &mut Vm, arg_count: usize) -> NativeResult {
        self(vm, arg_count)
    }
}

pub struct NativeFunction {
    pub name: String,
    /// `None` accepts any argument count.
    pub arity: Option<u8>,
    native_object: Box<dyn NativeObject>,
}

impl NativeFunction {
    pub fn new<F>(name: &str, arity: Option<u8>, function: F) -> Self
    where
        F: Fn(&mut Vm, usize) -> NativeResult + 'static,
    {
        NativeFunction::from_object(name, arity, function)
    }

    pub fn from_object(name: &str, arity: Option<u8>, native_object: impl NativeObject + 'static) -> Self {
        NativeFunction {
            name: name.to_string(),
            arity,
            native_object: Box::new(native_object),
        }
    }

    pub fn invoke(&self, vm: &mut Vm, arg_count: usize) -> NativeResult {
        if let Some(arity) = self.arity {
            if arity as usize != arg_count {
                return Err(Fault::new(
                    crate::error::RuntimeErrorKind::Arity,
                    format!("Native '{}' expects {} arguments but got {}.", self.name, arity, arg_count),
                ));
            }
        }
        self.native_object.call(vm, arg_count)
    }
}
