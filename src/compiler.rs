use std::rc::Rc;

use strum::EnumCount;
use tracing::debug;

use crate::{
    chunk::{Chunk, OpCode},
    compilettes::CompiletteRegistry,
    constants::{MAX_ARGUMENTS, MAX_CONSTANTS, MAX_LOCALS, MAX_UPVALUES, RETVAL_NAME, SUPER_NAME, THIS_NAME},
    error::CompileError,
    objects::object_closure::{Closure, FunctionType},
    scanner::{Literal, Token, TokenType},
    value::Value,
};

pub type CompileResult<T = ()> = Result<T, CompileError>;

struct Local {
    name: String,
    // -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopContext {
    start: usize,
    scope_depth: i32,
    break_patches: Vec<usize>,
}

/// Per-function compilation state. The enclosing function's state sits one
/// below this one on `Compiler::states`.
struct CompilerState {
    chunk: Chunk,
    kind: FunctionType,
    arity: u8,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopContext>,
    scope_depth: i32,
    retval_slot: Option<u8>,
}

impl CompilerState {
    fn new(name: &str, kind: FunctionType) -> Self {
        let slot_zero = match kind {
            FunctionType::Method | FunctionType::Initializer => THIS_NAME,
            _ => "",
        };
        CompilerState {
            chunk: Chunk::new(name),
            kind,
            arity: 0,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                is_captured: false,
            }],
            upvalues: vec![],
            loops: vec![],
            scope_depth: 0,
            retval_slot: None,
        }
    }
}

/// Class declaration stages. Body elements must appear in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
pub enum ClassStage {
    Begin,
    Static,
    Mixin,
    Var,
    Init,
    Method,
    Complete,
}

pub struct ClassCompileState {
    pub name: String,
    pub stage: ClassStage,
    pub has_superclass: bool,
    pub field_names: Vec<String>,
    /// Location of the `Class` instruction's init-chain operand.
    pub init_chain_operand: usize,
    pub has_fragment: bool,
    /// Trailing jump of the last emitted fragment, to be chained onward.
    pub pending_chain_jump: Option<usize>,
}

pub struct TestSetCompileState {
    pub name_constant: u8,
    pub case_addresses: Vec<usize>,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParserFn = fn(&mut Compiler, can_assign: bool) -> CompileResult;

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParserFn>, infix: Option<ParserFn>, precedence: Precedence) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

const RULES: [ParseRule; TokenType::COUNT] = {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::COUNT];
    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|c, _can_assign| c.grouping()),
        Some(|c, _can_assign| c.call()),
        Precedence::Call);
    rules[TokenType::LeftBracket as usize] = ParseRule::new(
        None,
        Some(|c, can_assign| c.subscript(can_assign)),
        Precedence::Call);
    rules[TokenType::Dot as usize] = ParseRule::new(
        None,
        Some(|c, can_assign| c.dot(can_assign)),
        Precedence::Call);
    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|c, _can_assign| c.unary()),
        Some(|c, _can_assign| c.binary()),
        Precedence::Term);
    rules[TokenType::Plus as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Term);
    rules[TokenType::Slash as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Factor);
    rules[TokenType::Star as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Factor);
    rules[TokenType::Percent as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Factor);
    rules[TokenType::Bang as usize] = ParseRule::new(
        Some(|c, _can_assign| c.unary()),
        None,
        Precedence::None);
    rules[TokenType::BangEqual as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Equality);
    rules[TokenType::EqualEqual as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Equality);
    rules[TokenType::Greater as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Comparison);
    rules[TokenType::GreaterEqual as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Comparison);
    rules[TokenType::Less as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Comparison);
    rules[TokenType::LessEqual as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.binary()),
        Precedence::Comparison);
    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|c, can_assign| c.variable(can_assign)),
        None,
        Precedence::None);
    rules[TokenType::String as usize] = ParseRule::new(
        Some(|c, _can_assign| c.string()),
        None,
        Precedence::None);
    rules[TokenType::Int as usize] = ParseRule::new(
        Some(|c, _can_assign| c.number()),
        None,
        Precedence::None);
    rules[TokenType::Float as usize] = ParseRule::new(
        Some(|c, _can_assign| c.number()),
        None,
        Precedence::None);
    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.and()),
        Precedence::And);
    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|c, _can_assign| c.or()),
        Precedence::Or);
    rules[TokenType::False as usize] = ParseRule::new(
        Some(|c, _can_assign| c.literal()),
        None,
        Precedence::None);
    rules[TokenType::True as usize] = ParseRule::new(
        Some(|c, _can_assign| c.literal()),
        None,
        Precedence::None);
    rules[TokenType::Null as usize] = ParseRule::new(
        Some(|c, _can_assign| c.literal()),
        None,
        Precedence::None);
    rules[TokenType::This as usize] = ParseRule::new(
        Some(|c, _can_assign| c.this()),
        None,
        Precedence::None);
    rules[TokenType::Super as usize] = ParseRule::new(
        Some(|c, _can_assign| c.super_()),
        None,
        Precedence::None);
    rules[TokenType::Fun as usize] = ParseRule::new(
        Some(|c, _can_assign| c.function("", FunctionType::Function)),
        None,
        Precedence::None);
    rules
};

const COMPOUND_ASSIGNMENTS: [(TokenType, OpCode); 5] = [
    (TokenType::PlusEqual, OpCode::Add),
    (TokenType::MinusEqual, OpCode::Subtract),
    (TokenType::StarEqual, OpCode::Multiply),
    (TokenType::SlashEqual, OpCode::Divide),
    (TokenType::PercentEqual, OpCode::Modulo),
];

/// Single-pass compiler: tokens in, bytecode out, no intermediate tree.
/// Declarations starting with a registered keyword are handed to the
/// matching compilette.
pub struct Compiler {
    pub(crate) current: Token,
    pub(crate) previous: Token,
    tokens: std::vec::IntoIter<Token>,
    states: Vec<CompilerState>,
    pub(crate) classes: Vec<ClassCompileState>,
    pub(crate) test_sets: Vec<TestSetCompileState>,
    /// State compiling the current field-initializer fragment, if any.
    fragment_state: Option<usize>,
    declarations: CompiletteRegistry,
}

impl Compiler {
    pub fn new(tokens: Vec<Token>, name: &str) -> Compiler {
        let eof = Token::synthetic(TokenType::Eof, "");
        Compiler {
            current: eof.clone(),
            previous: eof,
            tokens: tokens.into_iter(),
            states: vec![CompilerState::new(name, FunctionType::Script)],
            classes: vec![],
            test_sets: vec![],
            fragment_state: None,
            declarations: CompiletteRegistry::declarations(),
        }
    }

    pub fn compile(mut self) -> CompileResult<Rc<Chunk>> {
        debug!(chunk = %self.state().chunk.name, "compiling");
        self.advance();

        while !self.match_token(TokenType::Eof) {
            self.declaration()?;
        }

        let state = self.end_compiler()?;
        Ok(Rc::new(state.chunk))
    }

    // ---- token stream ----

    pub(crate) fn advance(&mut self) {
        let next = self
            .tokens
            .next()
            .unwrap_or_else(|| Token::synthetic(TokenType::Eof, ""));
        self.previous = std::mem::replace(&mut self.current, next);
    }

    pub(crate) fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    pub(crate) fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    pub(crate) fn consume(&mut self, token_type: TokenType, message: &str) -> CompileResult {
        if self.check(token_type) {
            self.advance();
            return Ok(());
        }
        Err(self.error_at_current(message))
    }

    // ---- errors ----

    pub(crate) fn error(&self, message: &str) -> CompileError {
        self.error_at(&self.previous, message)
    }

    pub(crate) fn error_at_current(&self, message: &str) -> CompileError {
        self.error_at(&self.current, message)
    }

    fn error_at(&self, token: &Token, message: &str) -> CompileError {
        let lexeme = match token.token_type {
            TokenType::Eof => "end".to_string(),
            _ => token.lexeme.clone(),
        };
        CompileError {
            message: message.to_string(),
            token: lexeme,
            line: token.line,
            column: token.column,
            chunk: self.state().chunk.name.clone(),
        }
    }

    // ---- state access ----

    fn state(&self) -> &CompilerState {
        let index = self.states.len() - 1;
        &self.states[index]
    }

    fn state_mut(&mut self) -> &mut CompilerState {
        let index = self.states.len() - 1;
        &mut self.states[index]
    }

    pub(crate) fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.state_mut().chunk
    }

    pub(crate) fn code_len(&self) -> usize {
        self.state().chunk.len()
    }

    pub(crate) fn is_top_level(&self) -> bool {
        self.states.len() == 1 && self.state().scope_depth == 0
    }

    // ---- emission ----

    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    pub(crate) fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
    }

    pub(crate) fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    pub(crate) fn emit_op_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_bytes(op.to_byte(), operand);
    }

    pub(crate) fn emit_u16(&mut self, value: u16) {
        self.emit_byte(((value >> 8) & 0xff) as u8);
        self.emit_byte((value & 0xff) as u8);
    }

    fn emit_constant(&mut self, value: Value) -> CompileResult {
        let index = self.make_constant(value)?;
        self.emit_op_operand(OpCode::Constant, index);
        Ok(())
    }

    pub(crate) fn make_constant(&mut self, value: Value) -> CompileResult<u8> {
        if let Some(index) = self.state().chunk.find_constant(&value) {
            return Ok(index as u8);
        }

        let index = self.current_chunk().add_constant(value);
        if index >= MAX_CONSTANTS {
            return Err(self.error("Too many constants in one chunk."));
        }
        Ok(index as u8)
    }

    pub(crate) fn identifier_constant(&mut self, name: &str) -> CompileResult<u8> {
        self.make_constant(Value::string(name))
    }

    /// Emits `instruction` with a placeholder 16-bit operand and returns the
    /// operand's location for `patch_jump_offset`.
    pub(crate) fn emit_jump_bytes(&mut self, instruction: OpCode) -> usize {
        self.emit_op(instruction);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    pub(crate) fn patch_jump_offset(&mut self, operand: usize) -> CompileResult {
        // -2 to adjust for the jump offset operand itself.
        let jump = self.code_len() - operand - 2;
        if jump > u16::MAX as usize {
            return Err(self.error("Too much code to jump over."));
        }
        self.current_chunk().write_u16_at(operand, jump as u16);
        Ok(())
    }

    pub(crate) fn patch_u16(&mut self, operand: usize, value: usize) -> CompileResult {
        if value >= u16::MAX as usize {
            return Err(self.error("Chunk too large for a 16-bit address."));
        }
        self.current_chunk().write_u16_at(operand, value as u16);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> CompileResult {
        self.emit_op(OpCode::Loop);

        // +2 to skip the operand of the 'Loop' instruction.
        let offset = self.code_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(self.error("Loop body too large."));
        }
        self.emit_u16(offset as u16);
        Ok(())
    }

    fn emit_return(&mut self) {
        match (self.state().kind, self.state().retval_slot) {
            (FunctionType::Initializer, _) => self.emit_op_operand(OpCode::GetLocal, 0),
            (_, Some(slot)) => self.emit_op_operand(OpCode::GetLocal, slot),
            (_, None) => self.emit_op(OpCode::Null),
        }
        self.emit_op(OpCode::Return);
    }

    fn end_compiler(&mut self) -> CompileResult<CompilerState> {
        self.emit_return();
        let state = self.states.pop().ok_or_else(|| self.error("Compiler state underflow."))?;
        debug_feature::disassemble_chunk(&state.chunk);
        Ok(state)
    }

    // ---- scopes and variables ----

    pub(crate) fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    pub(crate) fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        loop {
            let state = self.state();
            let captured = match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => local.is_captured,
                _ => break,
            };
            self.emit_op(if captured { OpCode::CloseUpvalue } else { OpCode::Pop });
            self.state_mut().locals.pop();
        }
    }

    /// Pops locals deeper than `depth` without forgetting them; used when
    /// jumping out of a scope early.
    fn discard_locals_above(&mut self, depth: i32) {
        let captured: Vec<bool> = self
            .state()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in captured {
            self.emit_op(if is_captured { OpCode::CloseUpvalue } else { OpCode::Pop });
        }
    }

    pub(crate) fn parse_variable(&mut self, message: &str) -> CompileResult<u8> {
        self.consume(TokenType::Identifier, message)?;
        let name = self.previous.lexeme.clone();

        self.declare_variable(&name)?;
        if self.state().scope_depth > 0 {
            return Ok(0);
        }
        self.identifier_constant(&name)
    }

    pub(crate) fn declare_variable(&mut self, name: &str) -> CompileResult {
        let state = self.state();
        if state.scope_depth == 0 {
            return Ok(());
        }

        let duplicate = state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == -1 || local.depth >= state.scope_depth)
            .any(|local| local.name == name);
        if duplicate {
            return Err(self.error("Already a variable with this name in this scope."));
        }

        self.add_local(name)
    }

    pub(crate) fn add_local(&mut self, name: &str) -> CompileResult {
        if self.state().locals.len() >= MAX_LOCALS {
            return Err(self.error("Too many local variables in function."));
        }
        self.state_mut().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    pub(crate) fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_operand(OpCode::DefineGlobal, global);
    }

    pub(crate) fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&self, state_index: usize, name: &str) -> CompileResult<Option<u8>> {
        for (index, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(self.error("Can't read local variable in its own initializer."));
                }
                return Ok(Some(index as u8));
            }
        }
        Ok(None)
    }

    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> CompileResult<Option<u8>> {
        if state_index == 0 {
            return Ok(None);
        }

        let enclosing = state_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name)? {
            if self.fragment_state == Some(enclosing) {
                return Err(self.error("Field initializers cannot reference enclosing locals."));
            }
            self.states[enclosing].locals[local as usize].is_captured = true;
            return self.add_upvalue(state_index, local, true).map(Some);
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name)? {
            return self.add_upvalue(state_index, upvalue, false).map(Some);
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> CompileResult<u8> {
        let desc = UpvalueDesc { index, is_local };
        let upvalues = &self.states[state_index].upvalues;
        if let Some(existing) = upvalues.iter().position(|u| *u == desc) {
            return Ok(existing as u8);
        }
        if upvalues.len() >= MAX_UPVALUES {
            return Err(self.error("Too many closure variables in function."));
        }
        self.states[state_index].upvalues.push(desc);
        Ok((self.states[state_index].upvalues.len() - 1) as u8)
    }

    pub(crate) fn named_variable(&mut self, name: &str, can_assign: bool) -> CompileResult {
        let current = self.states.len() - 1;
        let (get_op, set_op, operand) = if let Some(slot) = self.resolve_local(current, name)? {
            if self.fragment_state == Some(current) {
                return Err(self.error("Field initializers cannot reference enclosing locals."));
            }
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(current, name)? {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name)?;
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression()?;
            self.emit_op_operand(set_op, operand);
        } else if let Some(op) = self.match_compound_assignment(can_assign) {
            self.emit_op_operand(get_op, operand);
            self.expression()?;
            self.emit_op(op);
            self.emit_op_operand(set_op, operand);
        } else {
            self.emit_op_operand(get_op, operand);
        }
        Ok(())
    }

    fn match_compound_assignment(&mut self, can_assign: bool) -> Option<OpCode> {
        if !can_assign {
            return None;
        }
        let op = COMPOUND_ASSIGNMENTS
            .iter()
            .find(|(token_type, _)| self.check(*token_type))
            .map(|(_, op)| *op)?;
        self.advance();
        Some(op)
    }

    // ---- declarations ----

    pub(crate) fn declaration(&mut self) -> CompileResult {
        if let Some(compilette) = self.declarations.get(self.current.token_type) {
            self.advance();
            return compilette.process(self);
        }

        if self.match_token(TokenType::Fun) {
            self.fun_declaration()
        } else if self.match_token(TokenType::Var) {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn fun_declaration(&mut self) -> CompileResult {
        let global = self.parse_variable("Expect function name.")?;
        let name = self.previous.lexeme.clone();
        // A function may refer to itself.
        self.mark_initialized();
        self.function(&name, FunctionType::Function)?;
        self.define_variable(global);
        Ok(())
    }

    fn var_declaration(&mut self) -> CompileResult {
        loop {
            let global = self.parse_variable("Expect variable name.")?;
            if self.match_token(TokenType::Equal) {
                self.expression()?;
            } else {
                self.emit_op(OpCode::Null);
            }
            self.define_variable(global);

            if !self.match_token(TokenType::Comma) {
                break;
            }
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.")
    }

    /// Compiles a parameter list and body into a new chunk and emits the
    /// `Closure` instruction that instantiates it.
    pub(crate) fn function(&mut self, name: &str, kind: FunctionType) -> CompileResult {
        self.states.push(CompilerState::new(name, kind));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.")?;
        let mut params = vec![];
        if !self.check(TokenType::RightParen) {
            loop {
                if self.state().arity as usize >= MAX_ARGUMENTS {
                    return Err(self.error_at_current("Can't have more than 255 parameters."));
                }
                self.state_mut().arity += 1;
                let constant = self.parse_variable("Expect parameter name.")?;
                params.push((self.previous.lexeme.clone(), self.state().locals.len() - 1));
                self.define_variable(constant);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.")?;

        if kind == FunctionType::Initializer {
            self.auto_assign_fields(&params)?;
        } else {
            self.emit_op(OpCode::Null);
            self.add_local(RETVAL_NAME)?;
            self.mark_initialized();
            let slot = (self.state().locals.len() - 1) as u8;
            self.state_mut().retval_slot = Some(slot);
        }

        self.consume(TokenType::LeftBrace, "Expect '{' before function body.")?;
        self.block()?;

        let state = self.end_compiler()?;
        let upvalue_count = state.upvalues.len();
        let prototype = Closure::prototype(Rc::new(state.chunk), state.arity, kind);
        let constant = self.make_constant(Value::Closure(Rc::new(prototype)))?;
        self.emit_bytes(OpCode::Closure.to_byte(), constant);
        self.emit_byte(upvalue_count as u8);
        for upvalue in state.upvalues {
            self.emit_op(OpCode::Capture);
            self.emit_bytes(upvalue.is_local as u8, upvalue.index);
        }
        Ok(())
    }

    /// `init(a, b)` assigns `this.a = a` for each parameter that names a
    /// declared field, ahead of the user's body.
    fn auto_assign_fields(&mut self, params: &[(String, usize)]) -> CompileResult {
        let fields = match self.classes.last() {
            Some(class) => class.field_names.clone(),
            None => return Ok(()),
        };
        for (param, slot) in params {
            if fields.iter().any(|field| field == param) {
                let name = self.identifier_constant(param)?;
                self.emit_op_operand(OpCode::GetLocal, 0);
                self.emit_op_operand(OpCode::GetLocal, *slot as u8);
                self.emit_op_operand(OpCode::SetProperty, name);
                self.emit_op(OpCode::Pop);
            }
        }
        Ok(())
    }

    /// Compiles an initializer expression as part of an init-chain fragment,
    /// where slot 0 holds the instance under construction.
    pub(crate) fn field_initializer(&mut self) -> CompileResult {
        let outer = self.fragment_state.replace(self.states.len() - 1);
        let result = self.expression();
        self.fragment_state = outer;
        result
    }

    /// The field-initializer state whose instance `this` refers to from the
    /// current state, unless a method in between rebinds it.
    fn initializer_instance_state(&self) -> Option<usize> {
        let fragment = self.fragment_state?;
        let rebound = self.states[fragment + 1..]
            .iter()
            .any(|state| matches!(state.kind, FunctionType::Method | FunctionType::Initializer));
        if rebound {
            None
        } else {
            Some(fragment)
        }
    }

    /// Upvalue index in `state_index` reaching slot 0 (the instance) of the
    /// fragment state.
    fn capture_instance(&mut self, state_index: usize, fragment: usize) -> CompileResult<u8> {
        let enclosing = state_index - 1;
        if enclosing == fragment {
            return self.add_upvalue(state_index, 0, true);
        }
        let upvalue = self.capture_instance(enclosing, fragment)?;
        self.add_upvalue(state_index, upvalue, false)
    }

    // ---- statements ----

    fn statement(&mut self) -> CompileResult {
        match self.current.token_type {
            TokenType::If => {
                self.advance();
                self.if_statement()
            }
            TokenType::While => {
                self.advance();
                self.while_statement()
            }
            TokenType::For => {
                self.advance();
                self.for_statement()
            }
            TokenType::Loop => {
                self.advance();
                self.loop_statement()
            }
            TokenType::Break => {
                self.advance();
                self.break_statement()
            }
            TokenType::Continue => {
                self.advance();
                self.continue_statement()
            }
            TokenType::Return => {
                self.advance();
                self.return_statement()
            }
            TokenType::Throw => {
                self.advance();
                self.throw_statement()
            }
            TokenType::Yield => {
                self.advance();
                self.emit_op(OpCode::Yield);
                self.consume(TokenType::Semicolon, "Expect ';' after 'yield'.")
            }
            TokenType::Freeze => {
                self.advance();
                self.expression()?;
                self.emit_op(OpCode::Freeze);
                self.consume(TokenType::Semicolon, "Expect ';' after freeze target.")
            }
            TokenType::LeftBrace => {
                self.advance();
                self.begin_scope();
                self.block()?;
                self.end_scope();
                Ok(())
            }
            _ => self.expression_statement(),
        }
    }

    pub(crate) fn block(&mut self) -> CompileResult {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration()?;
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.")
    }

    fn expression_statement(&mut self) -> CompileResult {
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after expression.")?;
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> CompileResult {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenType::RightParen, "Expect ')' after condition.")?;

        let then_jump = self.emit_jump_bytes(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement()?;

        let else_jump = self.emit_jump_bytes(OpCode::Jump);
        self.patch_jump_offset(then_jump)?;
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenType::Else) {
            self.statement()?;
        }
        self.patch_jump_offset(else_jump)
    }

    fn push_loop(&mut self, start: usize) {
        let scope_depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopContext {
            start,
            scope_depth,
            break_patches: vec![],
        });
    }

    fn pop_loop(&mut self) -> CompileResult {
        if let Some(context) = self.state_mut().loops.pop() {
            for patch in context.break_patches {
                self.patch_jump_offset(patch)?;
            }
        }
        Ok(())
    }

    fn while_statement(&mut self) -> CompileResult {
        let loop_start = self.code_len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenType::RightParen, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump_bytes(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.push_loop(loop_start);
        self.statement()?;
        self.emit_loop(loop_start)?;

        self.patch_jump_offset(exit_jump)?;
        self.emit_op(OpCode::Pop);
        self.pop_loop()
    }

    fn for_statement(&mut self) -> CompileResult {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.")?;
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.code_len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression()?;
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.")?;
            exit_jump = Some(self.emit_jump_bytes(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump_bytes(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression()?;
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump_offset(body_jump)?;
        }

        self.push_loop(loop_start);
        self.statement()?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump_offset(exit_jump)?;
            self.emit_op(OpCode::Pop);
        }
        self.pop_loop()?;
        self.end_scope();
        Ok(())
    }

    fn loop_statement(&mut self) -> CompileResult {
        let loop_start = self.code_len();
        self.push_loop(loop_start);
        self.statement()?;
        self.emit_loop(loop_start)?;
        self.pop_loop()
    }

    fn break_statement(&mut self) -> CompileResult {
        let depth = match self.state().loops.last() {
            Some(context) => context.scope_depth,
            None => return Err(self.error("Cannot use 'break' outside of a loop.")),
        };
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.")?;
        self.discard_locals_above(depth);
        let jump = self.emit_jump_bytes(OpCode::Jump);
        if let Some(context) = self.state_mut().loops.last_mut() {
            context.break_patches.push(jump);
        }
        Ok(())
    }

    fn continue_statement(&mut self) -> CompileResult {
        let (depth, start) = match self.state().loops.last() {
            Some(context) => (context.scope_depth, context.start),
            None => return Err(self.error("Cannot use 'continue' outside of a loop.")),
        };
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.")?;
        self.discard_locals_above(depth);
        self.emit_loop(start)
    }

    fn return_statement(&mut self) -> CompileResult {
        if self.state().kind == FunctionType::Script {
            return Err(self.error("Can't return from top-level code."));
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
            return Ok(());
        }

        if self.state().kind == FunctionType::Initializer {
            return Err(self.error("Can't return a value from an initializer."));
        }
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after return value.")?;
        self.emit_op(OpCode::Return);
        Ok(())
    }

    fn throw_statement(&mut self) -> CompileResult {
        if self.check(TokenType::Semicolon) {
            self.emit_op(OpCode::Null);
        } else {
            self.expression()?;
        }
        self.consume(TokenType::Semicolon, "Expect ';' after throw.")?;
        self.emit_op(OpCode::Throw);
        Ok(())
    }

    // ---- expressions ----

    pub(crate) fn expression(&mut self) -> CompileResult {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> CompileResult {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        match RULES[self.previous.token_type as usize].prefix {
            Some(prefix) => prefix(self, can_assign)?,
            None => return Err(self.error("Expect expression.")),
        }

        while precedence <= RULES[self.current.token_type as usize].precedence {
            self.advance();
            match RULES[self.previous.token_type as usize].infix {
                Some(infix) => infix(self, can_assign)?,
                None => return Err(self.error("Expect infix parse function.")),
            }
        }

        let dangling = self.check(TokenType::Equal)
            || COMPOUND_ASSIGNMENTS.iter().any(|(token_type, _)| self.check(*token_type));
        if can_assign && dangling {
            return Err(self.error_at_current("Invalid assignment target."));
        }
        Ok(())
    }

    fn grouping(&mut self) -> CompileResult {
        self.expression()?;
        self.consume(TokenType::RightParen, "Expect ')' after expression.")
    }

    fn number(&mut self) -> CompileResult {
        let value = match self.previous.literal {
            Literal::Number(number) => number,
            _ => return Err(self.error("Expect number literal.")),
        };
        self.emit_constant(Value::Double(value))
    }

    fn string(&mut self) -> CompileResult {
        let text = match &self.previous.literal {
            Literal::String(text) => text.clone(),
            _ => return Err(self.error("Expect string literal.")),
        };
        self.emit_constant(Value::string(&text))
    }

    fn literal(&mut self) -> CompileResult {
        match self.previous.token_type {
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::Null => self.emit_op(OpCode::Null),
            _ => return Err(self.error("Unexpected literal.")),
        }
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> CompileResult {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign)
    }

    fn this(&mut self) -> CompileResult {
        let current = self.states.len() - 1;
        match self.initializer_instance_state() {
            Some(fragment) if fragment == current => {
                self.emit_op_operand(OpCode::GetLocal, 0);
                return Ok(());
            }
            Some(fragment) => {
                let index = self.capture_instance(current, fragment)?;
                self.emit_op_operand(OpCode::GetUpvalue, index);
                return Ok(());
            }
            None => {}
        }
        if self.classes.is_empty() {
            return Err(self.error("Cannot use 'this' outside of a class."));
        }
        if self.resolve_local(current, THIS_NAME)?.is_none() && !self.this_reachable(current) {
            return Err(self.error("Cannot use 'this' outside of a method."));
        }
        self.named_variable(THIS_NAME, false)
    }

    fn this_reachable(&self, state_index: usize) -> bool {
        self.states[..=state_index]
            .iter()
            .any(|state| matches!(state.kind, FunctionType::Method | FunctionType::Initializer))
    }

    fn super_(&mut self) -> CompileResult {
        match self.classes.last() {
            None => return Err(self.error("Cannot use 'super' outside of a class.")),
            Some(class) if !class.has_superclass => {
                return Err(self.error("Cannot use 'super' in a class with no superclass."))
            }
            _ => {}
        }
        if self.initializer_instance_state().is_some() {
            return Err(self.error("Cannot use 'super' in a field initializer."));
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.")?;
        self.consume(TokenType::Identifier, "Expect superclass method name.")?;
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name)?;

        self.this()?;
        self.named_variable(SUPER_NAME, false)?;
        self.emit_op_operand(OpCode::GetSuper, constant);
        Ok(())
    }

    fn unary(&mut self) -> CompileResult {
        let operator_type = self.previous.token_type;
        self.parse_precedence(Precedence::Unary)?;

        match operator_type {
            TokenType::Bang => self.emit_op(OpCode::Not),
            TokenType::Minus => self.emit_op(OpCode::Negate),
            _ => return Err(self.error("Expect unary operator.")),
        }
        Ok(())
    }

    fn binary(&mut self) -> CompileResult {
        let operator_type = self.previous.token_type;
        let rule = &RULES[operator_type as usize];
        self.parse_precedence(rule.precedence.next())?;

        match operator_type {
            TokenType::BangEqual => self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte()),
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte()),
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte()),
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            TokenType::Percent => self.emit_op(OpCode::Modulo),
            _ => return Err(self.error("Unexpected binary operator.")),
        }
        Ok(())
    }

    fn and(&mut self) -> CompileResult {
        let end_jump = self.emit_jump_bytes(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump_offset(end_jump)
    }

    fn or(&mut self) -> CompileResult {
        let end_jump = self.emit_jump_bytes(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump_offset(end_jump)
    }

    fn argument_list(&mut self) -> CompileResult<u8> {
        let mut count = 0usize;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression()?;
                if count == MAX_ARGUMENTS {
                    return Err(self.error("Can't have more than 255 arguments."));
                }
                count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.")?;
        Ok(count as u8)
    }

    fn call(&mut self) -> CompileResult {
        let count = self.argument_list()?;
        self.emit_op_operand(OpCode::Call, count);
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> CompileResult {
        self.consume(TokenType::Identifier, "Expect property name after '.'.")?;
        let name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&name)?;

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression()?;
            self.emit_op_operand(OpCode::SetProperty, constant);
        } else if let Some(op) = self.match_compound_assignment(can_assign) {
            self.emit_op(OpCode::Duplicate);
            self.emit_op_operand(OpCode::GetProperty, constant);
            self.expression()?;
            self.emit_op(op);
            self.emit_op_operand(OpCode::SetProperty, constant);
        } else if self.match_token(TokenType::LeftParen) {
            let count = self.argument_list()?;
            self.emit_bytes(OpCode::Invoke.to_byte(), constant);
            self.emit_byte(count);
        } else {
            self.emit_op_operand(OpCode::GetProperty, constant);
        }
        Ok(())
    }

    fn subscript(&mut self, can_assign: bool) -> CompileResult {
        self.expression()?;
        self.consume(TokenType::RightBracket, "Expect ']' after index.")?;

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression()?;
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
        Ok(())
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use crate::{chunk::Chunk, debug};

    pub fn disassemble_chunk(chunk: &Chunk) {
        tracing::trace!("\n{}", debug::disassemble_chunk(chunk));
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use crate::chunk::Chunk;

    pub fn disassemble_chunk(_chunk: &Chunk) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Scanner;

    fn compile(text: &str) -> CompileResult<Rc<Chunk>> {
        let tokens = Scanner::new().scan(text).expect("scan");
        Compiler::new(tokens, "test").compile()
    }

    #[test]
    fn test_compile() {
        let chunk = compile("!(5 - 4 > 3 * 2 == !nil);").unwrap();

        assert!(chunk.constants[0] == Value::Double(5.0));
        assert!(chunk.constants[1] == Value::Double(4.0));

        let expected = vec![
            OpCode::Constant.to_byte(), 0,
            OpCode::Constant.to_byte(), 1,
            OpCode::Subtract.to_byte(),
            OpCode::Constant.to_byte(), 2,
            OpCode::Constant.to_byte(), 3,
            OpCode::Multiply.to_byte(),
            OpCode::Greater.to_byte(),
            OpCode::Null.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Equal.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::Null.to_byte(),
            OpCode::Return.to_byte(),
        ];
        pretty_assertions::assert_eq!(chunk.code, expected);
    }

    #[test]
    fn test_shared_string_constants() {
        let chunk = compile("\"this is a test string\"; \"this is a test string\";").unwrap();
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn test_self_referencing_local_is_error() {
        let err = compile("fun Foo() { var a = a; }").unwrap_err();
        assert!(err.message.contains("own initializer"), "{}", err);
        assert_eq!(err.chunk, "Foo");
    }

    #[test]
    fn test_global_self_reference_is_allowed() {
        assert!(compile("var a = a;").is_ok());
    }

    #[test]
    fn test_local_redeclaration_is_error() {
        let err = compile("fun Foo() { var a = 1; var a = 2; }").unwrap_err();
        assert!(err.message.contains("Already a variable"));
        assert!(compile("fun Foo() { var a = 1; { var a = 2; } }").is_ok());
    }

    #[test]
    fn test_break_outside_loop_is_error() {
        assert!(compile("break;").is_err());
        assert!(compile("while (true) { break; }").is_ok());
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = compile("1 + 2 = 3;").unwrap_err();
        assert!(err.message.contains("Invalid assignment target"));
    }

    #[test]
    fn test_return_from_top_level_is_error() {
        assert!(compile("return 1;").is_err());
    }

    #[test]
    fn test_this_outside_class_is_error() {
        assert!(compile("fun Foo() { return this; }").is_err());
    }

    #[test]
    fn test_function_in_field_initializer_has_own_scope() {
        assert!(compile("class T { var f = fun (x) { var y = x; return y + 1; }; }").is_ok());
        assert!(compile("class T { var f = fun () { return this; }; }").is_ok());
        let err = compile("fun Outer() { var x = 1; class T { var f = fun () { return x; }; } }").unwrap_err();
        assert!(err.message.contains("enclosing locals"), "{}", err.message);
    }

    #[test]
    fn test_super_in_field_initializer_is_error() {
        let err = compile("class A { Meth() {} } class B < A { var m = super.Meth; }").unwrap_err();
        assert_eq!(err.message, "Cannot use 'super' in a field initializer.");
    }

    #[test]
    fn test_error_carries_location() {
        let err = compile("var a = 1;\nvar b = ;").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.token, ";");
        assert_eq!(err.chunk, "test");
    }
}
