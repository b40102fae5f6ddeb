use crate::{
    chunk::{BuildOpCode, OpCode},
    compilettes::Compilette,
    compiler::{CompileResult, Compiler},
    scanner::{Literal, TokenType},
    value::Value,
};

/// `build bind "A", "B";` and `build queue "script";`
pub struct BuildCompilette;

impl Compilette for BuildCompilette {
    fn match_token(&self) -> TokenType {
        TokenType::Build
    }

    fn process(&self, compiler: &mut Compiler) -> CompileResult {
        let sub = if compiler.match_token(TokenType::Bind) {
            BuildOpCode::Bind
        } else if compiler.match_token(TokenType::Queue) {
            BuildOpCode::Queue
        } else {
            return Err(compiler.error_at_current("Expect 'bind' or 'queue' after 'build'."));
        };

        loop {
            compiler.consume(TokenType::String, "Expect string name after build command.")?;
            let name = match &compiler.previous.literal {
                Literal::String(text) => text.clone(),
                _ => return Err(compiler.error("Expect string name after build command.")),
            };
            let constant = compiler.make_constant(Value::string(&name))?;
            compiler.emit_op(OpCode::Build);
            compiler.emit_bytes(sub as u8, constant);

            if !compiler.match_token(TokenType::Comma) {
                break;
            }
        }
        compiler.consume(TokenType::Semicolon, "Expect ';' after build command.")
    }
}

#[cfg(test)]
mod tests {
    use crate::{chunk::OpCode, compiler::Compiler, scanner::Scanner};

    #[test]
    fn test_build_emits_one_op_per_name() {
        let tokens = Scanner::new().scan("build bind \"Core\", \"Extra\";").unwrap();
        let chunk = Compiler::new(tokens, "test").compile().unwrap();
        let builds = chunk.code.iter().filter(|b| **b == OpCode::Build.to_byte()).count();
        assert_eq!(builds, 2);
    }

    #[test]
    fn test_build_requires_subcommand() {
        let tokens = Scanner::new().scan("build \"Core\";").unwrap();
        assert!(Compiler::new(tokens, "test").compile().is_err());
    }
}
