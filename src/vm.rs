use std::{cell::RefCell, rc::Rc};

use tracing::{debug, info};

use crate::{
    call_frame::CallFrame,
    chunk::{BuildOpCode, Chunk, OpCode, TestOpCode, NO_INIT_CHAIN},
    constants::{MAX_FRAMES_SIZE, MAX_STACK_SIZE},
    context::LibraryRegistry,
    error::{ContextError, Fault, RuntimeError, RuntimeErrorKind},
    objects::{
        object_class::{Class, ClassRef, InitChainFragment},
        object_closure::{Closure, FunctionType},
        object_instance::{BoundMethod, Instance, InstanceRef},
        object_native_function::{NativeCallResult, NativeFunction},
        object_string::HashedString,
        object_upvalue::{Upvalue, UpvalueRef},
    },
    table::Table,
    test_runner::TestRunner,
    value::Value,
};

#[derive(Debug, Clone, PartialEq)]
pub enum InterpretResult {
    InterpretOk(Value),
    /// Execution stopped at a `yield`; `Vm::resume` continues it.
    InterpretYield,
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_frames: usize,
    pub max_stack: usize,
    /// Run test sets as they are declared.
    pub run_tests: bool,
    /// Mirror `print` output to stdout as well as the output log.
    pub echo_print: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_frames: MAX_FRAMES_SIZE,
            max_stack: MAX_STACK_SIZE,
            run_tests: true,
            echo_print: true,
        }
    }
}

enum RunOutcome {
    Returned(Value),
    Yielded,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Sorted by stack slot.
    open_upvalues: Vec<UpvalueRef>,
    config: VmConfig,
    test_runner: Rc<RefCell<TestRunner>>,
    libraries: Rc<RefCell<LibraryRegistry>>,
    output: Rc<RefCell<String>>,
    build_queue: Vec<String>,
    native_base: usize,
    run_depth: usize,
    instruction_start: usize,
    /// Frame depth and stack base of a run suspended by `yield`.
    suspended: Option<(usize, usize)>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("stack", &self.stack)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new(VmConfig::default())
    }
}

impl Vm {
    pub fn new(config: VmConfig) -> Vm {
        Vm::with_shared(
            config,
            Rc::new(RefCell::new(TestRunner::new())),
            Rc::new(RefCell::new(LibraryRegistry::default())),
            Rc::new(RefCell::new(String::new())),
        )
    }

    pub fn with_shared(
        config: VmConfig,
        test_runner: Rc<RefCell<TestRunner>>,
        libraries: Rc<RefCell<LibraryRegistry>>,
        output: Rc<RefCell<String>>,
    ) -> Vm {
        Vm {
            stack: Vec::with_capacity(u8::MAX as usize + 1),
            frames: Vec::with_capacity(config.max_frames),
            globals: Table::new(),
            open_upvalues: vec![],
            config,
            test_runner,
            libraries,
            output,
            build_queue: vec![],
            native_base: 0,
            run_depth: 0,
            instruction_start: 0,
            suspended: None,
        }
    }

    /// A fresh VM seeded with a copy of this one's globals. The test ledger,
    /// library registry and output log are shared.
    pub fn child(&self) -> Vm {
        let mut vm = Vm::with_shared(
            self.config.clone(),
            Rc::clone(&self.test_runner),
            Rc::clone(&self.libraries),
            Rc::clone(&self.output),
        );
        vm.copy_from(self);
        vm
    }

    pub fn copy_from(&mut self, parent: &Vm) {
        self.globals = parent.globals.clone();
    }

    /// A copy of `callable` that can run on another VM: upvalues still open on
    /// this VM's stack become closed cells holding their current value.
    pub fn detach_callable(&self, callable: &Value) -> Value {
        match callable {
            Value::Closure(closure) => {
                if closure.upvalues.iter().all(|upvalue| upvalue.borrow().open_slot().is_none()) {
                    return callable.clone();
                }
                let upvalues = closure
                    .upvalues
                    .iter()
                    .map(|upvalue| {
                        let open = upvalue.borrow().open_slot();
                        match open {
                            Some(slot) => {
                                let value = self.stack.get(slot).cloned().unwrap_or_default();
                                Rc::new(RefCell::new(Upvalue::Closed(value)))
                            }
                            None => Rc::clone(upvalue),
                        }
                    })
                    .collect();
                Value::Closure(Rc::new(Closure::with_upvalues(closure, upvalues)))
            }
            Value::BoundMethod(bound) => Value::BoundMethod(Rc::new(BoundMethod {
                receiver: bound.receiver.clone(),
                method: self.detach_callable(&bound.method),
            })),
            Value::Combined(methods) => {
                Value::Combined(methods.iter().map(|method| self.detach_callable(method)).collect())
            }
            other => other.clone(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn test_runner(&self) -> Rc<RefCell<TestRunner>> {
        Rc::clone(&self.test_runner)
    }

    pub fn libraries(&self) -> Rc<RefCell<LibraryRegistry>> {
        Rc::clone(&self.libraries)
    }

    pub fn printed(&self) -> String {
        self.output.borrow().clone()
    }

    pub fn print_line(&mut self, text: &str) {
        if self.config.echo_print {
            println!("{}", text);
        }
        let mut output = self.output.borrow_mut();
        output.push_str(text);
        output.push('\n');
    }

    pub fn take_build_queue(&mut self) -> Vec<String> {
        std::mem::take(&mut self.build_queue)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    pub fn globals(&self) -> &Table {
        &self.globals
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.find(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(HashedString::new(name), value);
    }

    /// Merges a registered library's bindings into the globals.
    pub fn bind_library(&mut self, name: &str) -> Result<(), ContextError> {
        let bindings = self
            .libraries
            .borrow()
            .get(name)
            .map(|library| library.bindings.clone())
            .ok_or_else(|| ContextError::UnknownLibrary(name.to_string()))?;
        debug!(library = name, count = bindings.len(), "binding library");
        for (key, value) in bindings {
            self.globals.insert(HashedString::new(&key), value);
        }
        Ok(())
    }

    // ---- stack ----

    pub fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.stack.len() >= self.config.max_stack {
            return Err(Fault::new(RuntimeErrorKind::StackOverflow, "Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, Fault> {
        self.stack
            .pop()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "Stack underflow."))
    }

    pub fn peek(&self, distance: usize) -> Result<&Value, Fault> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|index| self.stack.get(index))
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "Stack underflow."))
    }

    /// Argument `index` of the running native: 0 is the receiver or the
    /// native itself, 1.. the call's arguments.
    pub fn get_arg(&self, index: usize) -> Value {
        self.stack.get(self.native_base + index).cloned().unwrap_or_default()
    }

    // ---- host entry points ----

    pub fn interpret(&mut self, chunk: Rc<Chunk>, start: usize) -> Result<InterpretResult, RuntimeError> {
        debug!(chunk = %chunk.name, start, "interpret");
        let closure = Rc::new(Closure::prototype(chunk, 0, FunctionType::Script));
        self.interpret_closure(closure, start)
    }

    fn interpret_closure(&mut self, closure: Rc<Closure>, start: usize) -> Result<InterpretResult, RuntimeError> {
        let depth = self.frames.len();
        let base = self.stack.len();
        if self.suspended.is_some() {
            let fault = Fault::new(RuntimeErrorKind::Yield, "Cannot interpret while suspended; resume first.");
            return Err(self.fail(fault, depth, base));
        }
        if let Err(fault) = self.push(Value::Closure(Rc::clone(&closure))) {
            return Err(self.fail(fault, depth, base));
        }
        self.frames.push(CallFrame::new(closure, start, base));
        self.execute(depth, base)
    }

    pub fn resume(&mut self) -> Result<InterpretResult, RuntimeError> {
        match self.suspended.take() {
            Some((depth, base)) => self.execute(depth, base),
            None => {
                let fault = Fault::new(RuntimeErrorKind::Yield, "Cannot resume a VM that is not suspended.");
                Err(self.fail(fault, self.frames.len(), self.stack.len()))
            }
        }
    }

    /// Calls `callable` with the `arg_count` values already on top of the
    /// stack, running until that call completes or yields.
    pub fn push_call_frame_and_run(
        &mut self,
        callable: Value,
        arg_count: usize,
    ) -> Result<InterpretResult, RuntimeError> {
        let depth = self.frames.len();
        let base = match self.stack.len().checked_sub(arg_count) {
            Some(base) => base,
            None => {
                let fault = Fault::new(RuntimeErrorKind::Internal, "Fewer values on the stack than arguments.");
                return Err(self.fail(fault, depth, 0));
            }
        };
        if self.stack.len() >= self.config.max_stack {
            let fault = Fault::new(RuntimeErrorKind::StackOverflow, "Stack overflow.");
            return Err(self.fail(fault, depth, base));
        }
        self.stack.insert(base, callable.clone());

        if let Err(fault) = self.call_value(callable, arg_count) {
            return Err(self.fail(fault, depth, base));
        }
        if self.frames.len() > depth {
            return self.execute(depth, base);
        }
        match self.pop() {
            Ok(value) => Ok(InterpretResult::InterpretOk(value)),
            Err(fault) => Err(self.fail(fault, depth, base)),
        }
    }

    /// Synchronous call from host code. Yielding inside is an error.
    pub fn call(&mut self, callable: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let depth = self.frames.len();
        let base = self.stack.len();

        self.run_depth += 1;
        let result = self.push_and_call(callable, args);
        self.run_depth -= 1;

        result.map_err(|fault| self.fail(fault, depth, base))
    }

    fn push_and_call(&mut self, callable: Value, args: &[Value]) -> Result<Value, Fault> {
        self.push(callable.clone())?;
        for arg in args {
            self.push(arg.clone())?;
        }
        self.call_and_wait(callable, args.len())
    }

    fn execute(&mut self, depth: usize, base: usize) -> Result<InterpretResult, RuntimeError> {
        self.run_depth += 1;
        let result = self.run(depth);
        self.run_depth -= 1;

        match result {
            Ok(RunOutcome::Returned(value)) => Ok(InterpretResult::InterpretOk(value)),
            Ok(RunOutcome::Yielded) => {
                self.suspended = Some((depth, base));
                Ok(InterpretResult::InterpretYield)
            }
            Err(fault) => Err(self.fail(fault, depth, base)),
        }
    }

    /// Decorates `fault` with the failing location, then discards every frame
    /// and stack slot above `depth`/`base`.
    fn fail(&mut self, fault: Fault, depth: usize, base: usize) -> RuntimeError {
        let error = self.runtime_error(fault);
        self.close_upvalues(base);
        self.stack.truncate(base);
        self.frames.truncate(depth);
        error
    }

    fn runtime_error(&self, fault: Fault) -> RuntimeError {
        let (chunk, line) = match self.frames.last() {
            Some(frame) => (frame.chunk().name.clone(), frame.chunk().line_at(self.instruction_start)),
            None => (String::new(), 0),
        };

        let stack_dump = self
            .stack
            .iter()
            .enumerate()
            .rev()
            .map(|(index, value)| format!("{:>4}: {:?}", index, value))
            .collect::<Vec<_>>()
            .join("\n");
        let call_stack = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let ip = frame.ip.saturating_sub(1);
                format!("chunk:'{}' ip:'{}' line:{}", frame.chunk().name, ip, frame.chunk().line_at(ip))
            })
            .collect::<Vec<_>>()
            .join("\n");

        RuntimeError {
            kind: fault.kind,
            message: fault.message,
            offset: self.instruction_start,
            chunk,
            line,
            stack_dump,
            call_stack,
        }
    }

    // ---- frame access ----

    fn frame(&self) -> Result<&CallFrame, Fault> {
        self.frames
            .last()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "No active call frame."))
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, Fault> {
        self.frames
            .last_mut()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "No active call frame."))
    }

    fn read_byte(&mut self) -> Result<u8, Fault> {
        self.frame_mut()?
            .read_byte()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "Unexpected end of bytecode."))
    }

    fn read_u16(&mut self) -> Result<u16, Fault> {
        self.frame_mut()?
            .read_u16()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "Unexpected end of bytecode."))
    }

    fn constant(&self, index: u8) -> Result<Value, Fault> {
        self.frame()?
            .chunk()
            .get_constant(index as usize)
            .cloned()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, format!("No constant at index {}.", index)))
    }

    fn read_constant(&mut self) -> Result<Value, Fault> {
        let index = self.read_byte()?;
        self.constant(index)
    }

    fn constant_string(&self, index: u8) -> Result<HashedString, Fault> {
        match self.constant(index)? {
            Value::String(name) => Ok(name),
            other => Err(Fault::new(
                RuntimeErrorKind::Internal,
                format!("Expected a string constant, found '{}'.", other.type_name()),
            )),
        }
    }

    fn read_string(&mut self) -> Result<HashedString, Fault> {
        let index = self.read_byte()?;
        self.constant_string(index)
    }

    fn stack_base(&self) -> Result<usize, Fault> {
        Ok(self.frame()?.stack_base)
    }

    fn peek_class(&self, distance: usize) -> Result<ClassRef, Fault> {
        match self.peek(distance)? {
            Value::Class(class) => Ok(Rc::clone(class)),
            other => Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("Expected a class, found '{}'.", other.type_name()),
            )),
        }
    }

    // ---- execution ----

    fn run(&mut self, exit_depth: usize) -> Result<RunOutcome, Fault> {
        loop {
            debug_feature::trace_instruction(self);

            self.instruction_start = self.frame()?.ip;
            let byte = self.read_byte()?;
            let instruction = OpCode::from_byte(byte)
                .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, format!("Unknown opcode {}.", byte)))?;

            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant()?;
                    self.push(constant)?;
                }
                OpCode::Null => self.push(Value::Null)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Duplicate => {
                    let value = self.peek(0)?.clone();
                    self.push(value)?;
                }
                OpCode::GetLocal => {
                    let slot = self.stack_base()? + self.read_byte()? as usize;
                    let value = self.stack_slot(slot)?;
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.stack_base()? + self.read_byte()? as usize;
                    let value = self.peek(0)?.clone();
                    self.set_stack_slot(slot, value)?;
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let upvalue = self.upvalue(index)?;
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(slot) => self.stack_slot(*slot)?,
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let upvalue = self.upvalue(index)?;
                    let value = self.peek(0)?.clone();
                    let open = upvalue.borrow().open_slot();
                    match open {
                        Some(slot) => self.set_stack_slot(slot, value)?,
                        None => *upvalue.borrow_mut() = Upvalue::Closed(value),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string()?;
                    let value = self.pop()?;
                    self.globals.insert(name, value);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string()?;
                    let value = self.globals.get(&name).cloned().ok_or_else(|| {
                        Fault::new(RuntimeErrorKind::UndefinedGlobal, format!("Undefined variable '{}'.", name))
                    })?;
                    self.push(value)?;
                }
                OpCode::SetGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0)?.clone();
                    match self.globals.get_mut(&name) {
                        Some(slot) => *slot = value,
                        None => {
                            return Err(Fault::new(
                                RuntimeErrorKind::UndefinedGlobal,
                                format!("Undefined variable '{}'.", name),
                            ))
                        }
                    }
                }
                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    match self.overload_for(&a, OpCode::Equal) {
                        Some(overload) => self.call_overload(overload, a, b)?,
                        None => self.push(Value::Bool(a == b))?,
                    }
                }
                OpCode::Greater
                | OpCode::Less
                | OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Modulo => self.binary_op(instruction)?,
                OpCode::Negate => match self.pop()? {
                    Value::Double(number) => self.push(Value::Double(-number))?,
                    other => {
                        return Err(Fault::new(
                            RuntimeErrorKind::TypeMismatch,
                            format!("Operand must be a number, got '{}'.", other.type_name()),
                        ))
                    }
                },
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Jump => {
                    let offset = self.read_u16()? as usize;
                    self.frame_mut()?.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16()? as usize;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16()? as usize;
                    if !self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16()? as usize;
                    self.frame_mut()?.ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte()? as usize;
                    let callee = self.peek(arg_count)?.clone();
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()? as usize;
                    self.invoke(&name, arg_count)?;
                }
                OpCode::Closure => self.make_closure()?,
                OpCode::Capture => {
                    return Err(Fault::new(RuntimeErrorKind::Internal, "Capture outside of a closure."));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len().saturating_sub(1);
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "Return without a frame."))?;
                    self.close_upvalues(frame.stack_base);
                    self.stack.truncate(frame.stack_base);
                    if self.frames.len() <= exit_depth {
                        return Ok(RunOutcome::Returned(result));
                    }
                    self.push(result)?;
                }
                OpCode::Yield => {
                    if self.run_depth > 1 {
                        return Err(Fault::new(
                            RuntimeErrorKind::Yield,
                            "Cannot yield from inside a nested call.",
                        ));
                    }
                    return Ok(RunOutcome::Yielded);
                }
                OpCode::Throw => {
                    let value = self.pop()?;
                    let message = match value {
                        Value::Null => "Throw".to_string(),
                        other => other.to_string(),
                    };
                    return Err(Fault::panic(message));
                }
                OpCode::Class => {
                    let name = self.read_string()?;
                    let chain = self.read_u16()?;
                    let mut class = Class::new(name.as_str());
                    if chain != NO_INIT_CHAIN {
                        class.init_chains.push(InitChainFragment {
                            closure: Rc::clone(&self.frame()?.closure),
                            offset: chain as usize,
                        });
                    }
                    self.push(Value::Class(class.into_ref()))?;
                }
                OpCode::Inherit => {
                    let subclass = self.peek_class(0)?;
                    let superclass = match self.peek(1)? {
                        Value::Class(class) => Rc::clone(class),
                        other => {
                            return Err(Fault::new(
                                RuntimeErrorKind::TypeMismatch,
                                format!("Superclass must be a class, got '{}'.", other.type_name()),
                            ))
                        }
                    };
                    if Rc::ptr_eq(&subclass, &superclass) {
                        return Err(Fault::new(RuntimeErrorKind::TypeMismatch, "A class can't inherit from itself."));
                    }
                    subclass.borrow_mut().inherit_from(&superclass);
                    self.pop()?;
                }
                OpCode::Mixin => {
                    let mixin = match self.pop()? {
                        Value::Class(class) => class,
                        other => {
                            return Err(Fault::new(
                                RuntimeErrorKind::TypeMismatch,
                                format!("Mixin must be a class, got '{}'.", other.type_name()),
                            ))
                        }
                    };
                    let class = self.peek_class(0)?;
                    if Rc::ptr_eq(&class, &mixin) {
                        return Err(Fault::new(RuntimeErrorKind::TypeMismatch, "A class can't mix in itself."));
                    }
                    let source = mixin.borrow();
                    class.borrow_mut().mixin_from(&source);
                }
                OpCode::Method => {
                    let name = self.read_string()?;
                    let method = self.peek(0)?.clone();
                    self.peek_class(1)?.borrow_mut().add_method(name, method);
                    self.pop()?;
                }
                OpCode::GetProperty => {
                    let name = self.read_string()?;
                    let target = self.peek(0)?.clone();
                    let value = self.get_property(&target, &name)?;
                    self.pop()?;
                    self.push(value)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_string()?;
                    let value = self.pop()?;
                    let target = self.pop()?;
                    self.set_property(&target, name, value.clone())?;
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string()?;
                    let superclass = match self.pop()? {
                        Value::Class(class) => class,
                        other => {
                            return Err(Fault::new(
                                RuntimeErrorKind::TypeMismatch,
                                format!("Superclass must be a class, got '{}'.", other.type_name()),
                            ))
                        }
                    };
                    let receiver = self.pop()?;
                    let method = superclass.borrow().find_method(&name).ok_or_else(|| {
                        Fault::new(
                            RuntimeErrorKind::UndefinedProperty,
                            format!("Undefined superclass method '{}'.", name),
                        )
                    })?;
                    self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })))?;
                }
                OpCode::Freeze => match self.pop()? {
                    Value::Instance(instance) => {
                        instance.borrow_mut().frozen = true;
                    }
                    Value::Class(class) => {
                        class.borrow_mut().frozen = true;
                    }
                    other => {
                        return Err(Fault::new(
                            RuntimeErrorKind::TypeMismatch,
                            format!("Cannot freeze a '{}'.", other.type_name()),
                        ))
                    }
                },
                OpCode::GetIndex => {
                    let index = self.pop()?;
                    let value = match self.pop()? {
                        Value::HostObject(host) => host.get_index(&index)?,
                        other => {
                            return Err(Fault::new(
                                RuntimeErrorKind::TypeMismatch,
                                format!("Cannot index a '{}'.", other.type_name()),
                            ))
                        }
                    };
                    self.push(value)?;
                }
                OpCode::SetIndex => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    match self.pop()? {
                        Value::HostObject(host) => host.set_index(&index, value.clone())?,
                        other => {
                            return Err(Fault::new(
                                RuntimeErrorKind::TypeMismatch,
                                format!("Cannot index a '{}'.", other.type_name()),
                            ))
                        }
                    }
                    self.push(value)?;
                }
                OpCode::Test => self.test_op()?,
                OpCode::Build => self.build_op()?,
            }
        }
    }

    fn stack_slot(&self, slot: usize) -> Result<Value, Fault> {
        self.stack
            .get(slot)
            .cloned()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, format!("Stack slot {} out of range.", slot)))
    }

    fn set_stack_slot(&mut self, slot: usize, value: Value) -> Result<(), Fault> {
        match self.stack.get_mut(slot) {
            Some(entry) => {
                *entry = value;
                Ok(())
            }
            None => Err(Fault::new(RuntimeErrorKind::Internal, format!("Stack slot {} out of range.", slot))),
        }
    }

    fn upvalue(&self, index: usize) -> Result<UpvalueRef, Fault> {
        self.frame()?
            .closure
            .upvalues
            .get(index)
            .cloned()
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, format!("Upvalue {} out of range.", index)))
    }

    fn binary_op(&mut self, op: OpCode) -> Result<(), Fault> {
        let b = self.pop()?;
        let a = self.pop()?;
        if let Some(overload) = self.overload_for(&a, op) {
            return self.call_overload(overload, a, b);
        }

        let result = match (op, &a, &b) {
            (OpCode::Add, Value::Double(x), Value::Double(y)) => Value::Double(x + y),
            (OpCode::Add, Value::String(_), _) | (OpCode::Add, _, Value::String(_)) => {
                Value::string(&format!("{}{}", a, b))
            }
            (OpCode::Subtract, Value::Double(x), Value::Double(y)) => Value::Double(x - y),
            (OpCode::Multiply, Value::Double(x), Value::Double(y)) => Value::Double(x * y),
            (OpCode::Divide, Value::Double(x), Value::Double(y)) => Value::Double(x / y),
            (OpCode::Modulo, Value::Double(x), Value::Double(y)) => Value::Double(x % y),
            (OpCode::Greater, Value::Double(x), Value::Double(y)) => Value::Bool(x > y),
            (OpCode::Less, Value::Double(x), Value::Double(y)) => Value::Bool(x < y),
            (OpCode::Greater, Value::String(x), Value::String(y)) => Value::Bool(x.as_str() > y.as_str()),
            (OpCode::Less, Value::String(x), Value::String(y)) => Value::Bool(x.as_str() < y.as_str()),
            _ => {
                return Err(Fault::new(
                    RuntimeErrorKind::TypeMismatch,
                    format!(
                        "Cannot perform '{}' on operands of type '{}' and '{}'.",
                        op,
                        a.type_name(),
                        b.type_name()
                    ),
                ))
            }
        };
        self.push(result)
    }

    fn overload_for(&self, value: &Value, op: OpCode) -> Option<Value> {
        match value {
            Value::Instance(instance) => {
                let class = Rc::clone(&instance.borrow().class);
                let overload = class.borrow().overload(op);
                overload
            }
            _ => None,
        }
    }

    /// Runs `overload` with the left operand as receiver and the right one as
    /// its single argument.
    fn call_overload(&mut self, overload: Value, lhs: Value, rhs: Value) -> Result<(), Fault> {
        self.push(lhs)?;
        self.push(rhs)?;
        let result = self.call_and_wait(overload, 1)?;
        self.push(result)
    }

    fn make_closure(&mut self) -> Result<(), Fault> {
        let prototype = match self.read_constant()? {
            Value::Closure(closure) => closure,
            other => {
                return Err(Fault::new(
                    RuntimeErrorKind::Internal,
                    format!("Closure operand is a '{}'.", other.type_name()),
                ))
            }
        };
        let count = self.read_byte()? as usize;
        let base = self.stack_base()?;
        let enclosing = Rc::clone(&self.frame()?.closure);

        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            if self.read_byte()? != OpCode::Capture.to_byte() {
                return Err(Fault::new(RuntimeErrorKind::Internal, "Malformed closure capture list."));
            }
            let is_local = self.read_byte()? == 1;
            let index = self.read_byte()? as usize;
            let upvalue = if is_local {
                self.capture_upvalue(base + index)
            } else {
                enclosing
                    .upvalues
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, "Captured upvalue out of range."))?
            };
            upvalues.push(upvalue);
        }

        self.push(Value::Closure(Rc::new(Closure::with_upvalues(&prototype, upvalues))))
    }

    fn capture_upvalue(&mut self, slot: usize) -> UpvalueRef {
        if let Some(existing) = self.open_upvalues.iter().find(|u| u.borrow().open_slot() == Some(slot)) {
            return Rc::clone(existing);
        }

        let upvalue = Upvalue::new(slot);
        let position = self
            .open_upvalues
            .iter()
            .position(|u| u.borrow().open_slot().map_or(false, |open| open > slot))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(position, Rc::clone(&upvalue));
        upvalue
    }

    /// Moves every open upvalue at or above `from` off the stack.
    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|upvalue| {
            let open = upvalue.borrow().open_slot();
            match open {
                Some(slot) if slot >= from => {
                    let value = stack.get(slot).cloned().unwrap_or_default();
                    upvalue.borrow_mut().close(value);
                    false
                }
                _ => true,
            }
        });
    }

    // ---- calls ----

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), Fault> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, arg_count),
            Value::NativeFunction(native) => self.call_native(&native, arg_count),
            Value::BoundMethod(bound) => {
                let base = self.stack.len() - arg_count - 1;
                self.stack[base] = bound.receiver.clone();
                self.call_value(bound.method.clone(), arg_count)
            }
            Value::Class(class) => self.construct(class, arg_count),
            Value::Combined(methods) => self.call_combined(&methods, arg_count),
            other => Err(Fault::new(
                RuntimeErrorKind::NotCallable,
                format!("Can only call functions and classes, got '{}'.", other.type_name()),
            )),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, arg_count: usize) -> Result<(), Fault> {
        if closure.arity as usize != arg_count {
            return Err(Fault::new(
                RuntimeErrorKind::Arity,
                format!(
                    "Expected {} arguments but got {} calling '{}'.",
                    closure.arity,
                    arg_count,
                    closure.name()
                ),
            ));
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(Fault::new(RuntimeErrorKind::StackOverflow, "Stack overflow."));
        }
        let base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame::new(closure, 0, base));
        Ok(())
    }

    fn call_native(&mut self, native: &NativeFunction, arg_count: usize) -> Result<(), Fault> {
        let base = self.stack.len() - arg_count - 1;
        let previous = std::mem::replace(&mut self.native_base, base);
        let result = native.invoke(self, arg_count);
        self.native_base = previous;

        let value = match result? {
            NativeCallResult::Expression => self.pop()?,
            NativeCallResult::Void => Value::Null,
        };
        self.stack.truncate(base);
        self.push(value)
    }

    fn invoke(&mut self, name: &HashedString, arg_count: usize) -> Result<(), Fault> {
        let receiver = self.peek(arg_count)?.clone();
        let base = self.stack.len() - arg_count - 1;
        match &receiver {
            Value::Instance(instance) => {
                // A field holding a callable shadows a method of the same name.
                let field = instance.borrow().fields.get(name).cloned();
                if let Some(field) = field {
                    self.stack[base] = field.clone();
                    return self.call_value(field, arg_count);
                }
                let method = find_method(instance, name)?;
                self.call_value(method, arg_count)
            }
            Value::Class(class) => {
                let field = static_field(class, name)?;
                self.stack[base] = field.clone();
                self.call_value(field, arg_count)
            }
            other => Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("Only instances have methods, got '{}'.", other.type_name()),
            )),
        }
    }

    fn construct(&mut self, class: ClassRef, arg_count: usize) -> Result<(), Fault> {
        let base = self.stack.len() - arg_count - 1;
        let instance = Value::Instance(Instance::new(Rc::clone(&class)));
        self.stack[base] = instance.clone();

        let (chains, initializer) = {
            let class = class.borrow();
            (class.init_chains.clone(), class.initializer())
        };
        for fragment in chains {
            self.run_init_fragment(&instance, fragment)?;
        }

        match initializer {
            Some(initializer) => self.call_value(initializer, arg_count),
            None if arg_count != 0 => {
                let name = class.borrow().name.clone();
                Err(Fault::new(
                    RuntimeErrorKind::Arity,
                    format!("Expected 0 arguments but got {} constructing '{}'.", arg_count, name),
                ))
            }
            None => Ok(()),
        }
    }

    fn run_init_fragment(&mut self, instance: &Value, fragment: InitChainFragment) -> Result<(), Fault> {
        if self.frames.len() >= self.config.max_frames {
            return Err(Fault::new(RuntimeErrorKind::StackOverflow, "Stack overflow."));
        }
        let depth = self.frames.len();
        self.push(instance.clone())?;
        let base = self.stack.len() - 1;
        self.frames.push(CallFrame::new(fragment.closure, fragment.offset, base));
        self.run_nested(depth)?;
        Ok(())
    }

    /// Each member runs to completion with the same receiver and arguments;
    /// the last one's result is the call's result.
    fn call_combined(&mut self, methods: &[Value], arg_count: usize) -> Result<(), Fault> {
        let base = self.stack.len() - arg_count - 1;
        let frame_values = self.stack.split_off(base);

        let mut result = Value::Null;
        for method in methods {
            for value in &frame_values {
                self.push(value.clone())?;
            }
            result = self.call_and_wait(method.clone(), arg_count)?;
        }
        self.push(result)
    }

    /// Calls `callee` (already placed with its arguments on the stack) and
    /// runs until it has returned.
    fn call_and_wait(&mut self, callee: Value, arg_count: usize) -> Result<Value, Fault> {
        let depth = self.frames.len();
        self.call_value(callee, arg_count)?;
        if self.frames.len() > depth {
            return self.run_nested(depth);
        }
        self.pop()
    }

    fn run_nested(&mut self, depth: usize) -> Result<Value, Fault> {
        self.run_depth += 1;
        let result = self.run(depth);
        self.run_depth -= 1;
        match result? {
            RunOutcome::Returned(value) => Ok(value),
            RunOutcome::Yielded => Err(Fault::new(
                RuntimeErrorKind::Yield,
                "Cannot yield from inside a nested call.",
            )),
        }
    }

    // ---- properties ----

    fn get_property(&self, target: &Value, name: &HashedString) -> Result<Value, Fault> {
        match target {
            Value::Instance(instance) => {
                let field = instance.borrow().fields.get(name).cloned();
                if let Some(field) = field {
                    return Ok(field);
                }
                let method = find_method(instance, name)?;
                Ok(Value::BoundMethod(Rc::new(BoundMethod {
                    receiver: target.clone(),
                    method,
                })))
            }
            Value::Class(class) => static_field(class, name),
            other => Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("Only instances have properties, got '{}'.", other.type_name()),
            )),
        }
    }

    fn set_property(&mut self, target: &Value, name: HashedString, value: Value) -> Result<(), Fault> {
        match target {
            Value::Instance(instance) => instance.borrow_mut().set_field(name, value),
            Value::Class(class) => class.borrow_mut().set_field(name, value),
            other => Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("Only instances have fields, got '{}'.", other.type_name()),
            )),
        }
    }

    // ---- test and build protocol ----

    fn test_op(&mut self) -> Result<(), Fault> {
        let sub = self.read_byte()?;
        let a = self.read_byte()?;
        let b = self.read_byte()?;

        match TestOpCode::from_repr(sub) {
            Some(TestOpCode::SetStart) => {
                let name = self.constant_string(a)?;
                let mut addresses = Vec::with_capacity(b as usize);
                for _ in 0..b {
                    let (sub, hi, lo) = self.read_test_op()?;
                    if sub != TestOpCode::CaseAddress {
                        return Err(Fault::new(RuntimeErrorKind::Internal, "Malformed test set address table."));
                    }
                    addresses.push(u16::from_be_bytes([hi, lo]) as usize);
                }
                if self.read_test_op()?.0 != TestOpCode::SetEnd {
                    return Err(Fault::new(RuntimeErrorKind::Internal, "Test set is missing its end marker."));
                }
                if self.config.run_tests {
                    self.run_test_set(name.as_str(), &addresses)?;
                }
            }
            Some(TestOpCode::CaseStart) => {
                let case = self.constant_string(a)?;
                self.test_runner.borrow_mut().start_case(case.as_str())?;
            }
            Some(TestOpCode::CaseEnd) => {
                let case = self.constant_string(a)?;
                self.test_runner.borrow_mut().end_case(case.as_str())?;
            }
            Some(TestOpCode::CaseAddress) | Some(TestOpCode::SetEnd) => {}
            None => {
                return Err(Fault::new(RuntimeErrorKind::Internal, format!("Unknown test op {}.", sub)));
            }
        }
        Ok(())
    }

    fn read_test_op(&mut self) -> Result<(TestOpCode, u8, u8), Fault> {
        if self.read_byte()? != OpCode::Test.to_byte() {
            return Err(Fault::new(RuntimeErrorKind::Internal, "Expected a test instruction."));
        }
        let sub = self.read_byte()?;
        let sub = TestOpCode::from_repr(sub)
            .ok_or_else(|| Fault::new(RuntimeErrorKind::Internal, format!("Unknown test op {}.", sub)))?;
        Ok((sub, self.read_byte()?, self.read_byte()?))
    }

    /// Runs each case in its own child VM. A panicking case is recorded as
    /// incomplete by the ledger and does not stop its siblings; any other
    /// error ends the set and propagates.
    fn run_test_set(&mut self, name: &str, addresses: &[usize]) -> Result<(), Fault> {
        let closure = Rc::clone(&self.frame()?.closure);
        self.test_runner.borrow_mut().start_set(name);
        let mut outcome = Ok(());
        for address in addresses {
            let mut child = self.child();
            match child.interpret_closure(Rc::clone(&closure), *address) {
                Ok(_) => {}
                Err(err) if err.is_panic() => {
                    info!(test_set = name, error = %err.message, "test case failed");
                }
                Err(err) => {
                    outcome = Err(Fault::new(err.kind, format!("Test set '{}' aborted: {}", name, err)));
                    break;
                }
            }
        }
        self.test_runner.borrow_mut().end_set();
        outcome
    }

    fn build_op(&mut self) -> Result<(), Fault> {
        let sub = self.read_byte()?;
        let name = self.read_string()?;
        match BuildOpCode::from_repr(sub) {
            Some(BuildOpCode::Bind) => self
                .bind_library(name.as_str())
                .map_err(|err| Fault::new(RuntimeErrorKind::Build, err.to_string())),
            Some(BuildOpCode::Queue) => {
                debug!(script = %name, "queueing script");
                self.build_queue.push(name.as_str().to_string());
                Ok(())
            }
            None => Err(Fault::new(RuntimeErrorKind::Internal, format!("Unknown build op {}.", sub))),
        }
    }
}

fn find_method(instance: &InstanceRef, name: &HashedString) -> Result<Value, Fault> {
    let instance = instance.borrow();
    let method = instance.class.borrow().find_method(name);
    match method {
        Some(method) => Ok(method),
        None => Err(Fault::new(
            RuntimeErrorKind::UndefinedProperty,
            format!("Undefined property '{}' on instance of '{}'.", name, instance.class_name()),
        )),
    }
}

fn static_field(class: &ClassRef, name: &HashedString) -> Result<Value, Fault> {
    let class = class.borrow();
    match class.fields.get(name) {
        Some(field) => Ok(field.clone()),
        None => Err(Fault::new(
            RuntimeErrorKind::UndefinedProperty,
            format!("Undefined static '{}' on class '{}'.", name, class.name),
        )),
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn trace_instruction(vm: &Vm) {
        let Some(frame) = vm.frames.last() else {
            return;
        };
        let stack = vm
            .stack
            .iter()
            .map(|value| format!("[ {:?} ]", value))
            .collect::<Vec<_>>()
            .join(" ");
        let mut instruction = String::new();
        debug::disassemble_instruction(frame.chunk(), frame.ip, &mut instruction);
        tracing::trace!("{:>17} {}\n{}", "", stack, instruction.trim_end());
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::*;

    pub fn trace_instruction(_vm: &Vm) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compiler::Compiler, context::Library, scanner::Scanner, std_mod};

    fn vm() -> Vm {
        let mut vm = Vm::new(VmConfig {
            echo_print: false,
            ..VmConfig::default()
        });
        vm.libraries().borrow_mut().add(std_mod::core::library()).unwrap();
        vm.bind_library(std_mod::core::LIBRARY_NAME).unwrap();
        vm
    }

    fn chunk(text: &str) -> Rc<Chunk> {
        let tokens = Scanner::new().scan(text).unwrap();
        Compiler::new(tokens, "test").compile().unwrap()
    }

    fn run(text: &str) -> Vm {
        let mut vm = vm();
        let result = vm.interpret(chunk(text), 0);
        assert!(result.is_ok(), "{}", result.unwrap_err());
        vm
    }

    fn run_err(text: &str) -> RuntimeError {
        let mut vm = vm();
        vm.interpret(chunk(text), 0).unwrap_err()
    }

    fn global(vm: &Vm, name: &str) -> Value {
        vm.get_global(name).unwrap_or_default()
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let vm = run("var a = 1 + 2 * 3; var b = (10 - 4) / 4; var c = 7 % 4; var d = !(5 - 4 > 3 * 2 == !nil);");
        assert_eq!(global(&vm, "a"), Value::Double(7.0));
        assert_eq!(global(&vm, "b"), Value::Double(1.5));
        assert_eq!(global(&vm, "c"), Value::Double(3.0));
        assert_eq!(global(&vm, "d"), Value::Bool(true));
    }

    #[test]
    fn test_string_concatenate() {
        let vm = run(r#"var s = "st" + "ri" + "ng"; var t = "n=" + 3;"#);
        assert_eq!(global(&vm, "s"), Value::string("string"));
        assert_eq!(global(&vm, "t"), Value::string("n=3"));
    }

    #[test]
    fn test_print_statement() {
        let vm = run("print(1 + 2); print(3 * 4);");
        assert_eq!(vm.printed(), "3\n12\n");
    }

    #[test]
    fn test_type_mismatch_names_both_operands() {
        let err = run_err("var a = 1 - true;");
        assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch);
        assert!(err.message.contains("'Double' and 'Bool'"), "{}", err.message);
        assert_eq!(err.chunk, "test");
    }

    #[test]
    fn test_undefined_global() {
        let err = run_err("print(missing);");
        assert_eq!(err.kind, RuntimeErrorKind::UndefinedGlobal);
        assert!(err.stack_dump.contains("native fn print"));
    }

    #[test]
    fn test_control_flow() {
        let vm = run(
            r#"
            var total = 0;
            for (var i = 0; i < 10; i += 1) {
                if (i == 2) continue;
                if (i == 6) break;
                total += i;
            }
            var n = 0;
            while (n < 5) n = n + 1;
            var l = 0;
            loop { l += 1; if (l > 3) break; }
            var both = true and false;
            var either = false or "x";
            "#,
        );
        assert_eq!(global(&vm, "total"), Value::Double(13.0));
        assert_eq!(global(&vm, "n"), Value::Double(5.0));
        assert_eq!(global(&vm, "l"), Value::Double(4.0));
        assert_eq!(global(&vm, "both"), Value::Bool(false));
        assert_eq!(global(&vm, "either"), Value::string("x"));
    }

    #[test]
    fn test_break_closes_captured_loop_locals() {
        let vm = run(
            r#"
            var f;
            for (var i = 0; i < 3; i += 1) {
                var captured = i * 10;
                f = fun () { return captured; };
                if (i == 1) break;
            }
            var r = f();
            "#,
        );
        assert_eq!(global(&vm, "r"), Value::Double(10.0));
    }

    #[test]
    fn test_fib_function() {
        let vm = run(
            r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 2) + fib(n - 1);
            }
            var r = fib(15);
            "#,
        );
        assert_eq!(global(&vm, "r"), Value::Double(610.0));
    }

    #[test]
    fn test_retval_is_implicit_result() {
        let vm = run(
            r#"
            fun a() { retval = 4; }
            fun b() { retval = 4; return; }
            fun c() { }
            var ra = a(); var rb = b(); var rc = c();
            "#,
        );
        assert_eq!(global(&vm, "ra"), Value::Double(4.0));
        assert_eq!(global(&vm, "rb"), Value::Double(4.0));
        assert_eq!(global(&vm, "rc"), Value::Null);
    }

    #[test]
    fn test_closure_over_mutable_local() {
        let vm = run("fun Foo() { var a = 10; fun Bar() { a = 7; } Bar(); print(a); } Foo();");
        assert_eq!(vm.printed(), "7\n");
    }

    #[test]
    fn test_closure_with_shared_variable() {
        let vm = run(
            r#"
            var set; var get;
            fun main() {
                var a = 1;
                fun s(value) { a = value; }
                fun g() { return a; }
                set = s; get = g;
            }
            main();
            set(5);
            var r = get();
            "#,
        );
        assert_eq!(global(&vm, "r"), Value::Double(5.0));
    }

    #[test]
    fn test_arity_error() {
        let err = run_err("fun f(a) {} f();");
        assert_eq!(err.kind, RuntimeErrorKind::Arity);
        assert!(err.call_stack.contains("chunk:'test'"));
    }

    #[test]
    fn test_stack_overflow() {
        let err = run_err("fun f() { f(); } f();");
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
    }

    #[test]
    fn test_class_fields_methods_and_init() {
        let vm = run(
            r#"
            class Point {
                var x = 1, y = 2;
                init(x) { this.y = this.y + 10; }
                Sum() { return this.x + this.y; }
            }
            var p = Point(5);
            var s = p.Sum();
            var m = p.Sum;
            var s2 = m();
            "#,
        );
        assert_eq!(global(&vm, "s"), Value::Double(17.0));
        assert_eq!(global(&vm, "s2"), Value::Double(17.0));
    }

    #[test]
    fn test_inheritance_and_super() {
        let vm = run(
            r#"
            class A { var a = 1; Name() { return "A"; } }
            class B < A { Name() { return "B" + super.Name(); } }
            var b = B();
            var n = b.Name();
            var f = b.a;
            "#,
        );
        assert_eq!(global(&vm, "n"), Value::string("BA"));
        assert_eq!(global(&vm, "f"), Value::Double(1.0));
    }

    #[test]
    fn test_operator_overload() {
        let vm = run(
            r#"
            class V {
                var x = 0;
                init(x) {}
                _add(other) { return V(this.x + other.x); }
                _eq(other) { return this.x == other.x; }
                _ls(other) { return this.x < other.x; }
            }
            var v = V(1) + V(2);
            var x = v.x;
            var same = V(3) == v;
            var less = V(1) < v;
            "#,
        );
        assert_eq!(global(&vm, "x"), Value::Double(3.0));
        assert_eq!(global(&vm, "same"), Value::Bool(true));
        assert_eq!(global(&vm, "less"), Value::Bool(true));
    }

    #[test]
    fn test_static_fields_and_methods() {
        let vm = run(
            r#"
            class Counter {
                static var count = 0;
                static Bump(n) { Counter.count = Counter.count + n; return Counter.count; }
            }
            Counter.Bump(2);
            var c = Counter.Bump(3);
            "#,
        );
        assert_eq!(global(&vm, "c"), Value::Double(5.0));
    }

    #[test]
    fn test_class_is_frozen_after_declaration() {
        let err = run_err("class T { static var a = 1; } T.a = 2; T.b = 3;");
        assert_eq!(err.kind, RuntimeErrorKind::FreezeViolation);
    }

    #[test]
    fn test_freeze_instance() {
        let vm = run("class T { var a = 1; } var t = T(); freeze t; t.a = 2; var a = t.a;");
        assert_eq!(global(&vm, "a"), Value::Double(2.0));

        let err = run_err("class T { var a = 1; } var t = T(); freeze t; t.b = 2;");
        assert_eq!(err.kind, RuntimeErrorKind::FreezeViolation);
        assert!(err.message.contains("'b'"));
    }

    #[test]
    fn test_function_in_field_initializer() {
        let vm = run(
            r#"
            class T {
                var n = 10;
                var add = fun (x) { return x + 1; };
                var owner = fun () { return this; };
            }
            var t = T();
            print(t.add(2));
            print(t.owner().n);
            "#,
        );
        assert_eq!(vm.printed(), "3\n10\n");
    }

    #[test]
    fn test_mixin_combines_methods() {
        let vm = run(
            r#"
            var log = "";
            class A { Tick() { log = log + "a"; } }
            class B { Tick() { log = log + "b"; return 2; } }
            class C { mixin A, B; }
            var r = C().Tick();
            "#,
        );
        assert_eq!(global(&vm, "log"), Value::string("ab"));
        assert_eq!(global(&vm, "r"), Value::Double(2.0));
    }

    #[test]
    fn test_throw_is_panic() {
        let err = run_err("throw \"boom\";");
        assert!(err.is_panic());
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_yield_and_resume() {
        let mut vm = vm();
        let result = vm.interpret(chunk("var a = 1; yield; a = 2;"), 0).unwrap();
        assert_eq!(result, InterpretResult::InterpretYield);
        assert_eq!(vm.get_global("a"), Some(Value::Double(1.0)));
        assert!(vm.is_suspended());

        let err = vm.interpret(chunk("a = 3;"), 0).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Yield);
        assert!(vm.is_suspended());

        let result = vm.resume().unwrap();
        assert_eq!(result, InterpretResult::InterpretOk(Value::Null));
        assert_eq!(vm.get_global("a"), Some(Value::Double(2.0)));
        assert!(vm.resume().is_err());
    }

    #[test]
    fn test_host_calls_script_function() {
        let mut vm = run("fun add(a, b) { return a + b; }");
        let add = vm.get_global("add").unwrap();
        let sum = vm.call(add.clone(), &[Value::Double(2.0), Value::Double(3.0)]).unwrap();
        assert_eq!(sum, Value::Double(5.0));

        vm.push(Value::Double(4.0)).unwrap();
        vm.push(Value::Double(6.0)).unwrap();
        let result = vm.push_call_frame_and_run(add, 2).unwrap();
        assert_eq!(result, InterpretResult::InterpretOk(Value::Double(10.0)));
    }

    #[test]
    fn test_host_native_reads_args() {
        let mut vm = vm();
        let native = NativeFunction::new("twice", Some(1), |vm, _argc| {
            let value = vm.get_arg(1).as_double().unwrap_or_default();
            vm.push(Value::Double(value * 2.0))?;
            Ok(NativeCallResult::Expression)
        });
        vm.libraries()
            .borrow_mut()
            .add(Library::new("Twice").with("twice", Value::NativeFunction(Rc::new(native))))
            .unwrap();
        vm.interpret(chunk("build bind \"Twice\"; var r = twice(21);"), 0).unwrap();
        assert_eq!(vm.get_global("r"), Some(Value::Double(42.0)));
    }

    #[test]
    fn test_unknown_library_is_build_error() {
        let err = run_err("build bind \"Nope\";");
        assert_eq!(err.kind, RuntimeErrorKind::Build);
    }

    #[test]
    fn test_build_queue_collects_names() {
        let mut vm = run("build queue \"a\", \"b\";");
        assert_eq!(vm.take_build_queue(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_test_set_runs_cases_in_children() {
        let vm = run(
            r#"
            var shared = 1;
            test T {
                testcase Ok { assert_eq(shared, 1); shared = 5; }
                testcase Fails { assert(false, "nope"); }
            }
            "#,
        );
        let runner = vm.test_runner();
        let runner = runner.borrow();
        assert_eq!(runner.tests_found(), 2);
        assert!(!runner.all_passed());
        // Children work on copies of the globals.
        assert_eq!(global(&vm, "shared"), Value::Double(1.0));
    }

    #[test]
    fn test_duplicate_case_id_aborts_the_set() {
        let err = run_err("test T { testcase A { } testcase A { throw \"x\"; } }");
        assert_eq!(err.kind, RuntimeErrorKind::Internal);
        assert!(err.message.contains("already been started"), "{}", err.message);
    }

    #[test]
    fn test_non_panic_error_in_case_propagates() {
        let mut vm = vm();
        let err = vm
            .interpret(chunk("test T { testcase Bad { var x = 1 + nil; } testcase Later { } }"), 0)
            .unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch);
        let dump = vm.test_runner().borrow().generate_dump();
        assert_eq!(dump, "\"T:Bad\" Incomplete\n");
    }
}
