use crate::{
    chunk::{OpCode, TestOpCode},
    compilettes::Compilette,
    compiler::{CompileResult, Compiler, TestSetCompileState},
    constants::MAX_TEST_CASES,
    scanner::{Literal, TokenType},
    value::Value,
};

fn test_name(compiler: &mut Compiler, what: &str) -> CompileResult<u8> {
    let name = match compiler.current.token_type {
        TokenType::Identifier => compiler.current.lexeme.clone(),
        TokenType::String => match &compiler.current.literal {
            Literal::String(text) => text.clone(),
            _ => compiler.current.lexeme.clone(),
        },
        _ => return Err(compiler.error_at_current(&format!("Expect {} name.", what))),
    };
    compiler.advance();
    compiler.make_constant(Value::string(&name))
}

fn emit_test(compiler: &mut Compiler, sub: TestOpCode, a: u8, b: u8) {
    compiler.emit_op(OpCode::Test);
    compiler.emit_byte(sub as u8);
    compiler.emit_bytes(a, b);
}

/// `test Name { testcase A { .. } .. }`. Case bodies are jumped over at
/// declaration time; the trailing `SetStart` block lists their addresses so
/// the VM can run each one in isolation.
pub struct TestSetCompilette;

impl Compilette for TestSetCompilette {
    fn match_token(&self) -> TokenType {
        TokenType::Test
    }

    fn process(&self, compiler: &mut Compiler) -> CompileResult {
        if !compiler.is_top_level() || !compiler.test_sets.is_empty() {
            return Err(compiler.error("Test sets may only be declared at the top level."));
        }

        let name_constant = test_name(compiler, "test set")?;
        compiler.consume(TokenType::LeftBrace, "Expect '{' after test set name.")?;

        let skip = compiler.emit_jump_bytes(OpCode::Jump);
        compiler.test_sets.push(TestSetCompileState {
            name_constant,
            case_addresses: vec![],
        });

        let mut body = Ok(());
        while !compiler.check(TokenType::RightBrace) && !compiler.check(TokenType::Eof) {
            if !compiler.match_token(TokenType::TestCase) {
                body = Err(compiler.error_at_current("Expect 'testcase' inside test set."));
                break;
            }
            body = TestcaseCompilette.process(compiler);
            if body.is_err() {
                break;
            }
        }
        let state = compiler.test_sets.pop();
        body?;
        compiler.consume(TokenType::RightBrace, "Expect '}' after test set body.")?;

        let cases = state.map(|s| s.case_addresses).unwrap_or_default();
        compiler.patch_jump_offset(skip)?;

        emit_test(compiler, TestOpCode::SetStart, name_constant, cases.len() as u8);
        for address in cases {
            if address >= u16::MAX as usize {
                return Err(compiler.error("Test case address out of range."));
            }
            let [hi, lo] = (address as u16).to_be_bytes();
            emit_test(compiler, TestOpCode::CaseAddress, hi, lo);
        }
        emit_test(compiler, TestOpCode::SetEnd, 0, 0);
        Ok(())
    }
}

/// A single case inside a test set. Its body ends in its own `Return`, so it
/// runs as a frame of its own.
pub struct TestcaseCompilette;

impl Compilette for TestcaseCompilette {
    fn match_token(&self) -> TokenType {
        TokenType::TestCase
    }

    fn process(&self, compiler: &mut Compiler) -> CompileResult {
        if compiler.test_sets.is_empty() {
            return Err(compiler.error("'testcase' must be inside a test set."));
        }
        let case_count = compiler.test_sets.last().map_or(0, |s| s.case_addresses.len());
        if case_count >= MAX_TEST_CASES {
            return Err(compiler.error("Too many test cases in one test set."));
        }

        let name_constant = test_name(compiler, "test case")?;
        let address = compiler.code_len();

        emit_test(compiler, TestOpCode::CaseStart, name_constant, 0);
        compiler.consume(TokenType::LeftBrace, "Expect '{' before test case body.")?;
        compiler.begin_scope();
        compiler.block()?;
        compiler.end_scope();
        emit_test(compiler, TestOpCode::CaseEnd, name_constant, 0);
        compiler.emit_op(OpCode::Null);
        compiler.emit_op(OpCode::Return);

        if let Some(set) = compiler.test_sets.last_mut() {
            set.case_addresses.push(address);
        }
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
    fn test_set_lists_case_addresses() {
        let text = compile("test T { testcase A { } testcase \"B c\" { } }").unwrap();
        assert_eq!(text.matches("CaseAddress").count(), 2);
        assert_eq!(text.matches("CaseStart").count(), 2);
        assert!(text.contains("SetStart 'T' 2"));
        assert!(text.contains("'B c'"));
    }

    #[test]
    fn test_testcase_outside_set_is_error() {
        let err = compile("testcase A { }").unwrap_err();
        assert!(err.contains("inside a test set"));
    }

    #[test]
    fn test_nested_test_set_is_error() {
        assert!(compile("fun f() { test T { } }").is_err());
        assert!(compile("test T { test U { } }").is_err());
    }
}
