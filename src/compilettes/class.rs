use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::{
    chunk::{OpCode, NO_INIT_CHAIN},
    compilettes::Compilette,
    compiler::{ClassCompileState, ClassStage, CompileResult, Compiler},
    constants::{INIT_NAME, SUPER_NAME},
    objects::object_closure::FunctionType,
    scanner::TokenType,
};

/// Handler for one kind of class-body element.
trait ClassBodyCompilette {
    fn stage(&self) -> ClassStage;

    fn process(&self, compiler: &mut Compiler, class_name: &str) -> CompileResult;
}

pub struct ClassCompilette {
    body: FxHashMap<TokenType, Rc<dyn ClassBodyCompilette>>,
}

impl ClassCompilette {
    pub fn new() -> Self {
        let mut body: FxHashMap<TokenType, Rc<dyn ClassBodyCompilette>> = FxHashMap::default();
        body.insert(TokenType::Static, Rc::new(StaticCompilette));
        body.insert(TokenType::Mixin, Rc::new(MixinCompilette));
        body.insert(TokenType::Var, Rc::new(FieldCompilette));
        body.insert(TokenType::Init, Rc::new(InitCompilette));
        body.insert(TokenType::Identifier, Rc::new(MethodCompilette));
        ClassCompilette { body }
    }

    fn class_body(&self, compiler: &mut Compiler, name: &str) -> CompileResult {
        let mut has_superclass = false;
        if compiler.match_token(TokenType::Less) {
            compiler.consume(TokenType::Identifier, "Expect superclass name.")?;
            let superclass = compiler.previous.lexeme.clone();
            if superclass == name {
                return Err(compiler.error("A class can't inherit from itself."));
            }
            compiler.named_variable(&superclass, false)?;

            compiler.begin_scope();
            compiler.add_local(SUPER_NAME)?;
            compiler.define_variable(0);

            compiler.named_variable(name, false)?;
            compiler.emit_op(OpCode::Inherit);
            has_superclass = true;
            if let Some(class) = compiler.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        compiler.named_variable(name, false)?;
        compiler.consume(TokenType::LeftBrace, "Expect '{' before class body.")?;

        while !compiler.check(TokenType::RightBrace) && !compiler.check(TokenType::Eof) {
            let token_type = compiler.current.token_type;
            let element = match self.body.get(&token_type) {
                Some(element) => Rc::clone(element),
                None => return Err(compiler.error_at_current("Expect class body element.")),
            };
            self.advance_stage(compiler, name, element.stage())?;
            if token_type != TokenType::Identifier {
                compiler.advance();
            }
            element.process(compiler, name)?;
        }
        compiler.consume(TokenType::RightBrace, "Expect '}' after class body.")?;

        finish_init_chain(compiler)?;
        if let Some(class) = compiler.classes.last_mut() {
            class.stage = ClassStage::Complete;
        }
        // Consumes the class pushed for the body.
        compiler.emit_op(OpCode::Freeze);

        if has_superclass {
            compiler.end_scope();
        }
        Ok(())
    }

    fn advance_stage(&self, compiler: &mut Compiler, name: &str, stage: ClassStage) -> CompileResult {
        let current = compiler.classes.last().map_or(ClassStage::Begin, |c| c.stage);
        if stage < current {
            return Err(compiler.error_at_current(&format!(
                "Stage out of order. Type '{}' is at stage '{}' has encountered a late '{}' stage element.",
                name, current, stage
            )));
        }
        if let Some(class) = compiler.classes.last_mut() {
            class.stage = stage;
        }
        Ok(())
    }
}

impl Compilette for ClassCompilette {
    fn match_token(&self) -> TokenType {
        TokenType::Class
    }

    fn process(&self, compiler: &mut Compiler) -> CompileResult {
        compiler.consume(TokenType::Identifier, "Expect class name.")?;
        let name = compiler.previous.lexeme.clone();
        let name_constant = compiler.identifier_constant(&name)?;
        compiler.declare_variable(&name)?;

        compiler.emit_op_operand(OpCode::Class, name_constant);
        let init_chain_operand = compiler.code_len();
        compiler.emit_u16(NO_INIT_CHAIN);
        compiler.define_variable(name_constant);

        compiler.classes.push(ClassCompileState {
            name: name.clone(),
            stage: ClassStage::Begin,
            has_superclass: false,
            field_names: vec![],
            init_chain_operand,
            has_fragment: false,
            pending_chain_jump: None,
        });
        let result = self.class_body(compiler, &name);
        compiler.classes.pop();
        result
    }
}

/// Closes the chain of field fragments with a terminal `null; return`.
fn finish_init_chain(compiler: &mut Compiler) -> CompileResult {
    let pending = compiler.classes.last_mut().and_then(|c| c.pending_chain_jump.take());
    if let Some(pending) = pending {
        let skip = compiler.emit_jump_bytes(OpCode::Jump);
        compiler.patch_jump_offset(pending)?;
        compiler.emit_op(OpCode::Null);
        compiler.emit_op(OpCode::Return);
        compiler.patch_jump_offset(skip)?;
    }
    Ok(())
}

fn consume_name(compiler: &mut Compiler, message: &str) -> CompileResult<(String, u8)> {
    compiler.consume(TokenType::Identifier, message)?;
    let name = compiler.previous.lexeme.clone();
    let constant = compiler.identifier_constant(&name)?;
    Ok((name, constant))
}

/// `static var a = 1, b;` or `static Name(..) { .. }`, stored on the class.
struct StaticCompilette;

impl ClassBodyCompilette for StaticCompilette {
    fn stage(&self) -> ClassStage {
        ClassStage::Static
    }

    fn process(&self, compiler: &mut Compiler, _class_name: &str) -> CompileResult {
        if compiler.match_token(TokenType::Var) {
            loop {
                let (_, constant) = consume_name(compiler, "Expect static field name.")?;
                compiler.emit_op(OpCode::Duplicate);
                if compiler.match_token(TokenType::Equal) {
                    compiler.expression()?;
                } else {
                    compiler.emit_op(OpCode::Null);
                }
                compiler.emit_op_operand(OpCode::SetProperty, constant);
                compiler.emit_op(OpCode::Pop);
                if !compiler.match_token(TokenType::Comma) {
                    break;
                }
            }
            return compiler.consume(TokenType::Semicolon, "Expect ';' after static field declaration.");
        }

        let (name, constant) = consume_name(compiler, "Expect static method name.")?;
        compiler.emit_op(OpCode::Duplicate);
        compiler.function(&name, FunctionType::Function)?;
        compiler.emit_op_operand(OpCode::SetProperty, constant);
        compiler.emit_op(OpCode::Pop);
        Ok(())
    }
}

/// `mixin A, B;` applied left to right.
struct MixinCompilette;

impl ClassBodyCompilette for MixinCompilette {
    fn stage(&self) -> ClassStage {
        ClassStage::Mixin
    }

    fn process(&self, compiler: &mut Compiler, class_name: &str) -> CompileResult {
        loop {
            compiler.consume(TokenType::Identifier, "Expect mixin class name.")?;
            let mixin = compiler.previous.lexeme.clone();
            if mixin == class_name {
                return Err(compiler.error("A class can't mix in itself."));
            }
            compiler.named_variable(&mixin, false)?;
            compiler.emit_op(OpCode::Mixin);
            if !compiler.match_token(TokenType::Comma) {
                break;
            }
        }
        compiler.consume(TokenType::Semicolon, "Expect ';' after mixin list.")
    }
}

/// `var a = 1, b;` inside a class body. Emitted inline but jumped over; the
/// fragment is reached through the class's init chain.
struct FieldCompilette;

impl ClassBodyCompilette for FieldCompilette {
    fn stage(&self) -> ClassStage {
        ClassStage::Var
    }

    fn process(&self, compiler: &mut Compiler, _class_name: &str) -> CompileResult {
        let skip = compiler.emit_jump_bytes(OpCode::Jump);
        let start = compiler.code_len();
        link_fragment(compiler, start)?;

        loop {
            let (name, constant) = consume_name(compiler, "Expect field name.")?;
            if let Some(class) = compiler.classes.last_mut() {
                class.field_names.push(name);
            }
            compiler.emit_op_operand(OpCode::GetLocal, 0);
            if compiler.match_token(TokenType::Equal) {
                compiler.field_initializer()?;
            } else {
                compiler.emit_op(OpCode::Null);
            }
            compiler.emit_op_operand(OpCode::SetProperty, constant);
            compiler.emit_op(OpCode::Pop);
            if !compiler.match_token(TokenType::Comma) {
                break;
            }
        }
        compiler.consume(TokenType::Semicolon, "Expect ';' after field declaration.")?;

        let chain = compiler.emit_jump_bytes(OpCode::Jump);
        if let Some(class) = compiler.classes.last_mut() {
            class.pending_chain_jump = Some(chain);
        }
        compiler.patch_jump_offset(skip)
    }
}

/// Points the class operand (first fragment) or the previous fragment's
/// trailing jump at `start`.
fn link_fragment(compiler: &mut Compiler, start: usize) -> CompileResult {
    let (first, operand, pending) = match compiler.classes.last_mut() {
        Some(class) => {
            let first = !class.has_fragment;
            class.has_fragment = true;
            (first, class.init_chain_operand, class.pending_chain_jump.take())
        }
        None => return Err(compiler.error("Field declared outside of a class.")),
    };
    if first {
        compiler.patch_u16(operand, start)
    } else if let Some(pending) = pending {
        compiler.patch_jump_offset(pending)
    } else {
        Ok(())
    }
}

struct InitCompilette;

impl ClassBodyCompilette for InitCompilette {
    fn stage(&self) -> ClassStage {
        ClassStage::Init
    }

    fn process(&self, compiler: &mut Compiler, _class_name: &str) -> CompileResult {
        let constant = compiler.identifier_constant(INIT_NAME)?;
        compiler.function(INIT_NAME, FunctionType::Initializer)?;
        compiler.emit_op_operand(OpCode::Method, constant);
        Ok(())
    }
}

struct MethodCompilette;

impl ClassBodyCompilette for MethodCompilette {
    fn stage(&self) -> ClassStage {
        ClassStage::Method
    }

    fn process(&self, compiler: &mut Compiler, _class_name: &str) -> CompileResult {
        let (name, constant) = consume_name(compiler, "Expect method name.")?;
        compiler.function(&name, FunctionType::Method)?;
        compiler.emit_op_operand(OpCode::Method, constant);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{compiler::Compiler, debug, scanner::Scanner};

    fn compile(text: &str) -> Result<String, String> {
        let tokens = Scanner::new().scan(text).unwrap();
        Compiler::new(tokens, "test")
            .compile()
            .map(|chunk| debug::disassemble_chunk(&chunk))
            .map_err(|err| err.message)
    }

    #[test]
    fn test_stage_order_is_enforced() {
        let err = compile("class T { Meth() {} var a = 1; }").unwrap_err();
        assert!(err.contains("Stage out of order"), "{}", err);
        assert!(compile("class T { static var s = 1; mixin M; var a; init() {} Meth() {} }").is_ok());
    }

    #[test]
    fn test_field_fragment_sets_init_chain_operand() {
        let text = compile("class T { var a = 1; var b; }").unwrap();
        assert!(!text.contains(&format!("init_chain={}", crate::chunk::NO_INIT_CHAIN)));
        let plain = compile("class T { Meth() {} }").unwrap();
        assert!(plain.contains(&format!("init_chain={}", crate::chunk::NO_INIT_CHAIN)));
    }

    #[test]
    fn test_self_inheritance_is_error() {
        assert!(compile("class T < T { }").is_err());
    }

    #[test]
    fn test_field_initializer_cannot_capture_locals() {
        let err = compile("fun f() { var x = 1; class T { var a = x; } }").unwrap_err();
        assert!(err.contains("enclosing locals"));
    }

    #[test]
    fn test_super_requires_superclass() {
        assert!(compile("class T { Meth() { super.Meth(); } }").is_err());
        assert!(compile("class A { Meth() {} } class B < A { Meth() { super.Meth(); } }").is_ok());
    }
}
