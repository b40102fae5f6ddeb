//! ULox: a small class-based scripting language with a bytecode VM, built-in
//! test sets and host-bound libraries.

pub mod call_frame;
pub mod chunk;
pub mod compiler;
pub mod compilettes;
pub mod constants;
pub mod context;
pub mod debug;
pub mod error;
pub mod objects;
pub mod scanner;
pub mod std_mod;
pub mod table;
pub mod test_runner;
pub mod value;
pub mod vm;

pub use context::{Context, ContextConfig, DefaultLocator, Library, Script, ScriptLocator};
pub use error::{Result, RuntimeError, RuntimeErrorKind, UloxError};
pub use value::Value;
pub use vm::{InterpretResult, Vm, VmConfig};

/// Scans and compiles `text` into a chunk called `name`.
pub fn compile_source(name: &str, text: &str) -> Result<std::rc::Rc<chunk::Chunk>> {
    let tokens = scanner::Scanner::new().scan(text)?;
    Ok(compiler::Compiler::new(tokens, name).compile()?)
}
