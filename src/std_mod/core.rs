use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    context::Library,
    error::{Fault, RuntimeErrorKind},
    objects::{
        object_host::{HostObject, ListObject},
        object_native_function::{NativeCallResult, NativeFunction, NativeResult},
    },
    std_mod::time::ClockTime,
    value::Value,
    vm::Vm,
};

pub const LIBRARY_NAME: &str = "Core";

pub fn library() -> Library {
    Library::new(LIBRARY_NAME)
        .with("print", native("print", Some(1), print))
        .with("str", native("str", Some(1), to_str))
        .with(
            "clock",
            Value::NativeFunction(Rc::new(NativeFunction::from_object("clock", Some(0), ClockTime::new()))),
        )
        .with("assert", native("assert", None, assert))
        .with("assert_eq", native("assert_eq", Some(2), assert_eq))
        .with("len", native("len", Some(1), len))
        .with("List", native("List", Some(0), list))
        .with("push", native("push", Some(2), push))
        .with("duplicate", native("duplicate", Some(1), duplicate))
        .with("vm_start", native("vm_start", None, vm_start))
        .with("vm_resume", native("vm_resume", Some(1), vm_resume))
}

fn native(name: &str, arity: Option<u8>, function: fn(&mut Vm, usize) -> NativeResult) -> Value {
    Value::NativeFunction(Rc::new(NativeFunction::new(name, arity, function)))
}

fn print(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    let text = vm.get_arg(1).to_string();
    vm.print_line(&text);
    Ok(NativeCallResult::Void)
}

fn to_str(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    let text = vm.get_arg(1).to_string();
    vm.push(Value::string(&text))?;
    Ok(NativeCallResult::Expression)
}

fn assert(vm: &mut Vm, arg_count: usize) -> NativeResult {
    if !(1..=2).contains(&arg_count) {
        return Err(Fault::new(
            RuntimeErrorKind::Arity,
            format!("'assert' expects 1 or 2 arguments but got {}.", arg_count),
        ));
    }
    if vm.get_arg(1).is_falsey() {
        let message = match vm.get_arg(2) {
            Value::Null => "Assertion failed.".to_string(),
            message => format!("Assertion failed: {}", message),
        };
        return Err(Fault::panic(message));
    }
    Ok(NativeCallResult::Void)
}

fn assert_eq(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    let expected = vm.get_arg(1);
    let actual = vm.get_arg(2);
    if expected != actual {
        return Err(Fault::panic(format!("Expected '{}' but got '{}'.", expected, actual)));
    }
    Ok(NativeCallResult::Void)
}

fn len(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    let length = match vm.get_arg(1) {
        Value::String(text) => text.as_str().chars().count(),
        Value::HostObject(host) => host.len().ok_or_else(|| {
            Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("'{}' has no length.", host.type_name()),
            )
        })?,
        other => {
            return Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("'{}' has no length.", other.type_name()),
            ))
        }
    };
    vm.push(Value::Double(length as f64))?;
    Ok(NativeCallResult::Expression)
}

fn list(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    vm.push(Value::HostObject(Rc::new(ListObject::default())))?;
    Ok(NativeCallResult::Expression)
}

fn push(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    let target = vm.get_arg(1);
    let list = match &target {
        Value::HostObject(host) => host.as_any().downcast_ref::<ListObject>(),
        _ => None,
    };
    match list {
        Some(list) => list.push(vm.get_arg(2)),
        None => {
            return Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("'push' expects a List, got '{}'.", target.type_name()),
            ))
        }
    }
    Ok(NativeCallResult::Void)
}

fn duplicate(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    let copy = match vm.get_arg(1) {
        Value::Instance(instance) => {
            let copy = instance.borrow().duplicate();
            Value::Instance(copy)
        }
        other => {
            return Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("Cannot duplicate a '{}'.", other.type_name()),
            ))
        }
    };
    vm.push(copy)?;
    Ok(NativeCallResult::Expression)
}

/// A child VM driven from script through `vm_start`/`vm_resume`.
pub struct VmHandle {
    vm: RefCell<Vm>,
    suspended: Cell<bool>,
}

impl VmHandle {
    pub fn is_suspended(&self) -> bool {
        self.suspended.get()
    }
}

impl HostObject for VmHandle {
    fn type_name(&self) -> &str {
        "Vm"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `vm_start(fn, args..)` runs `fn` in a child VM seeded with a copy of the
/// globals, until it returns or yields. Captured locals still live on this
/// VM's stack are copied into the child.
fn vm_start(vm: &mut Vm, arg_count: usize) -> NativeResult {
    if arg_count == 0 {
        return Err(Fault::new(RuntimeErrorKind::Arity, "'vm_start' expects a function to run."));
    }
    let function = vm.detach_callable(&vm.get_arg(1));

    let mut child = vm.child();
    for index in 2..=arg_count {
        child.push(vm.detach_callable(&vm.get_arg(index)))?;
    }
    let result = child.push_call_frame_and_run(function, arg_count - 1)?;

    let handle = VmHandle {
        suspended: Cell::new(result == crate::vm::InterpretResult::InterpretYield),
        vm: RefCell::new(child),
    };
    vm.push(Value::HostObject(Rc::new(handle)))?;
    Ok(NativeCallResult::Expression)
}

/// `vm_resume(handle)` continues a suspended child; evaluates to whether it
/// is still suspended afterwards.
fn vm_resume(vm: &mut Vm, _arg_count: usize) -> NativeResult {
    let target = vm.get_arg(1);
    let handle = match &target {
        Value::HostObject(host) => host.as_any().downcast_ref::<VmHandle>(),
        _ => None,
    }
    .ok_or_else(|| {
        Fault::new(
            RuntimeErrorKind::TypeMismatch,
            format!("'vm_resume' expects a Vm handle, got '{}'.", target.type_name()),
        )
    })?;

    if handle.suspended.get() {
        let mut child = handle
            .vm
            .try_borrow_mut()
            .map_err(|_| Fault::new(RuntimeErrorKind::Internal, "A VM cannot resume itself."))?;
        child.resume()?;
        handle.suspended.set(child.is_suspended());
    }
    vm.push(Value::Bool(handle.suspended.get()))?;
    Ok(NativeCallResult::Expression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compiler::Compiler, scanner::Scanner, vm::VmConfig};

    fn run(text: &str) -> Result<Vm, crate::error::RuntimeError> {
        let mut vm = Vm::new(VmConfig {
            echo_print: false,
            ..VmConfig::default()
        });
        vm.libraries().borrow_mut().add(library()).unwrap();
        vm.bind_library(LIBRARY_NAME).unwrap();
        let tokens = Scanner::new().scan(text).unwrap();
        let chunk = Compiler::new(tokens, "test").compile().unwrap();
        vm.interpret(chunk, 0)?;
        Ok(vm)
    }

    #[test]
    fn test_list_natives() {
        let vm = run("var l = List(); push(l, 1); push(l, \"two\"); l[0] = 3; print(l[0]); print(len(l)); print(l[1]);")
            .unwrap();
        assert_eq!(vm.printed(), "3\n2\ntwo\n");
    }

    #[test]
    fn test_list_index_out_of_range() {
        let err = run("var l = List(); l[0];").unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::IndexOutOfRange);
    }

    #[test]
    fn test_str_and_len() {
        let vm = run("print(str(1.5) + \"!\"); print(len(\"four\"));").unwrap();
        assert_eq!(vm.printed(), "1.5!\n4\n");
    }

    #[test]
    fn test_assertions_raise_panic() {
        let err = run("assert(1 == 2, \"math\");").unwrap_err();
        assert!(err.is_panic());
        assert!(err.message.contains("math"));

        let err = run("assert_eq(1, 2);").unwrap_err();
        assert!(err.is_panic());
        assert!(run("assert(true); assert_eq(\"a\", \"a\");").is_ok());
    }

    #[test]
    fn test_duplicate_copies_fields() {
        let vm = run(
            r#"
            class P { var x = 1; }
            var a = P();
            freeze a;
            var b = duplicate(a);
            b.y = 2;
            b.x = 5;
            print(a.x);
            "#,
        )
        .unwrap();
        assert_eq!(vm.printed(), "1\n");
    }

    #[test]
    fn test_vm_start_and_resume() {
        let vm = run(
            r#"
            fun worker(n) {
                print("a" + str(n));
                yield;
                print("b");
                yield;
                print("c");
            }
            var handle = vm_start(worker, 1);
            print(vm_resume(handle));
            print(vm_resume(handle));
            print(vm_resume(handle));
            "#,
        )
        .unwrap();
        assert_eq!(vm.printed(), "a1\nb\ntrue\nc\nfalse\nfalse\n");
    }

    #[test]
    fn test_vm_start_copies_captured_locals() {
        let vm = run(
            r#"
            fun outer() {
                var pad1 = 100;
                var pad2 = 200;
                var x = 42;
                fun inner() { print(x); x = 1; yield; print(x); }
                var handle = vm_start(inner);
                print(x);
                vm_resume(handle);
                print(x);
            }
            outer();
            "#,
        )
        .unwrap();
        assert_eq!(vm.printed(), "42\n42\n1\n42\n");
    }

    #[test]
    fn test_clock_is_positive() {
        let vm = run("var t = clock();").unwrap();
        assert!(vm.get_global("t").and_then(|t| t.as_double()).unwrap_or_default() > 0.0);
    }
}
