//! Single-pass compiler: parses source text and emits bytecode directly.
//!
//! Expressions go through a Pratt parser: a table maps each token kind to an
//! optional prefix handler, an optional infix handler, and a precedence.
//! Statements are parsed by recursive descent. There is no AST; every
//! handler appends bytes to the chunk of the function currently being built.
//!
//! Lexical scoping is resolved during the same pass. Each function under
//! compilation keeps its own locals array and upvalue list; a name that is
//! not a local is looked up outward through the enclosing functions (turning
//! into an upvalue chain), and otherwise becomes a late-bound global.
//!
//! On a syntax error the compiler records the diagnostic, enters panic mode
//! (which suppresses cascading messages), and synchronizes at the next
//! statement boundary so independent errors are all reported.

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{Chunk, Opcode},
    error::{CompileError, CompileErrors, ErrorSite},
    heap::{Heap, HeapId},
    lexer::{Lexer, Token, TokenKind},
    value::Value,
};

/// Locals per function, including the reserved slot 0.
const MAX_LOCALS: usize = 256;
/// Captured variables per function.
const MAX_UPVALUES: usize = 256;
/// `break` statements per enclosing loop or switch.
const MAX_BREAKS: usize = 256;

/// Compiles a source program into its top-level function object.
pub(crate) fn compile(source: &str, heap: &mut Heap) -> Result<HeapId, CompileErrors> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_kind(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();
    if compiler.parser.had_error {
        Err(CompileErrors(compiler.parser.errors))
    } else {
        Ok(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct Rule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled so
    /// `var a = a;` is caught.
    depth: i32,
    /// Set when a nested function closes over this local; scope exit then
    /// emits `CloseUpvalue` instead of `Pop`.
    captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Constant-pool dedup key: the same literal or name reuses its pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Number(u64),
    Obj(HeapId),
}

/// Per-function compilation state. The innermost function is the top of the
/// compiler's `funcs` stack.
struct FuncScope<'src> {
    kind: FunctionKind,
    name: Option<HeapId>,
    arity: u8,
    chunk: Chunk,
    const_cache: AHashMap<ConstKey, u8>,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

impl<'src> FuncScope<'src> {
    fn new(kind: FunctionKind, name: Option<HeapId>) -> Self {
        // Slot 0 belongs to the callee; in methods it is addressable as
        // `this`, elsewhere its name is unmatchable.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            const_cache: AHashMap::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Class currently being compiled; tracks whether `super` is legal.
struct ClassScope {
    has_superclass: bool,
}

/// Innermost enclosing loop: where `continue` jumps and which locals it must
/// discard first.
struct LoopScope {
    start: usize,
    depth: i32,
}

/// Innermost construct `break` can leave (loop or switch), with the forward
/// jumps to patch once its end is known.
struct BreakScope {
    depth: i32,
    jumps: SmallVec<[usize; 8]>,
}

struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
}

pub(crate) struct Compiler<'src, 'h> {
    parser: Parser<'src>,
    heap: &'h mut Heap,
    funcs: Vec<FuncScope<'src>>,
    classes: Vec<ClassScope>,
    loops: Vec<LoopScope>,
    breaks: Vec<BreakScope>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Self {
            parser: Parser {
                lexer: Lexer::new(source),
                current: placeholder,
                previous: placeholder,
                had_error: false,
                panic_mode: false,
                errors: Vec::new(),
            },
            heap,
            funcs: vec![FuncScope::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            loops: Vec::new(),
            breaks: Vec::new(),
        }
    }

    // === error reporting ===

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        let site = match token.kind {
            TokenKind::Eof => ErrorSite::End,
            TokenKind::Error => ErrorSite::Bare,
            _ => ErrorSite::Lexeme(token.lexeme.to_owned()),
        };
        self.parser.errors.push(CompileError {
            line: token.line,
            site,
            message: message.to_owned(),
        });
        self.parser.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.parser.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.parser.current, message);
    }

    // === token plumbing ===

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.lexer.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let token = self.parser.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // === emission ===

    fn func(&mut self) -> &mut FuncScope<'src> {
        self.funcs.last_mut().expect("compiler function stack is never empty")
    }

    fn func_ref(&self) -> &FuncScope<'src> {
        self.funcs.last().expect("compiler function stack is never empty")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.func().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: Opcode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_ops(&mut self, first: Opcode, second: Opcode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    /// Emits a jump with a placeholder offset; returns the offset to patch.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.func_ref().chunk.code.len() - 2
    }

    /// Back-fills a forward jump to land after the last emitted byte.
    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.func_ref().chunk.code.len() - offset - 2;
        if jump > usize::from(u16::MAX) {
            self.error("too much code to jump over.");
        }
        let [lo, hi] = (jump as u16).to_le_bytes();
        let code = &mut self.func().chunk.code;
        code[offset] = lo;
        code[offset + 1] = hi;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);
        let offset = self.func_ref().chunk.code.len() - loop_start + 2;
        if offset > usize::from(u16::MAX) {
            self.error("loop body too large.");
        }
        let [lo, hi] = (offset as u16).to_le_bytes();
        self.emit_byte(lo);
        self.emit_byte(hi);
    }

    /// The implicit return: initializers return `this`, everything else nil.
    fn emit_return(&mut self) {
        if self.func_ref().kind == FunctionKind::Initializer {
            self.emit_op_byte(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let key = match value {
            Value::Number(n) => Some(ConstKey::Number(n.to_bits())),
            Value::Obj(id) => Some(ConstKey::Obj(id)),
            Value::Nil | Value::Bool(_) => None,
        };
        if let Some(key) = key
            && let Some(&index) = self.func_ref().const_cache.get(&key)
        {
            return index;
        }
        let index = self.func().chunk.add_constant(value);
        if index > usize::from(u8::MAX) {
            self.error("too many constants in one chunk.");
            return 0;
        }
        let index = index as u8;
        if let Some(key) = key {
            self.func().const_cache.insert(key, index);
        }
        index
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(Opcode::Constant, constant);
    }

    /// Finishes the innermost function: emits the implicit return and turns
    /// the accumulated state into a heap function object.
    fn end_function(&mut self) -> (HeapId, Vec<UpvalueRef>) {
        self.emit_return();
        let scope = self.funcs.pop().expect("compiler function stack is never empty");
        let function = self
            .heap
            .new_function(scope.name, scope.arity, scope.upvalues.len(), Rc::new(scope.chunk));
        (function, scope.upvalues)
    }

    // === scopes and variables ===

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func().scope_depth -= 1;
        let depth = self.func_ref().scope_depth;
        loop {
            let (in_scope, captured) = match self.func_ref().locals.last() {
                Some(local) if local.depth > depth => (true, local.captured),
                _ => (false, false),
            };
            if !in_scope {
                break;
            }
            // Captured locals must be hoisted off the stack, not discarded.
            let op = if captured { Opcode::CloseUpvalue } else { Opcode::Pop };
            self.emit_op(op);
            self.func().locals.pop();
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.heap.intern_bytes(name.as_bytes());
        self.make_constant(Value::Obj(id))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.func_ref().locals.len() == MAX_LOCALS {
            self.error("too many local variables in function.");
            return;
        }
        self.func().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.func_ref().scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let mut duplicate = false;
        {
            let func = self.func_ref();
            for local in func.locals.iter().rev() {
                if local.depth != -1 && local.depth < func.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        // Locals are resolved by slot, so only globals need a name constant.
        if self.func_ref().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.parser.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let func = self.func();
        if func.scope_depth == 0 {
            return;
        }
        let depth = func.scope_depth;
        if let Some(local) = func.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.func_ref().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(Opcode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, func_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.funcs[func_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        // The same variable may be captured several times; reuse the slot.
        for (i, upvalue) in self.funcs[func_index].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if self.funcs[func_index].upvalues.len() == MAX_UPVALUES {
            self.error("too many closure variables in function.");
            return 0;
        }
        self.funcs[func_index].upvalues.push(UpvalueRef { index, is_local });
        (self.funcs[func_index].upvalues.len() - 1) as u8
    }

    /// Looks for `name` in the functions enclosing `func_index`.
    ///
    /// A hit in the direct parent captures that local; a hit further out is
    /// forwarded through each intermediate function's upvalue list, so at
    /// runtime every closure only ever reaches one level up.
    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }
        let enclosing = func_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.funcs[enclosing].locals[usize::from(local)].captured = true;
            return Some(self.add_upvalue(func_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_index, upvalue, false));
        }
        None
    }

    /// Emits the access for a name: local, then upvalue, then global. At
    /// assignment precedence also handles `=`, `++`, and `--` suffixes; the
    /// inc/dec sequence leaves the pre-update value as the expression result
    /// while the variable keeps the update.
    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let current = self.funcs.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(current, name) {
            (Opcode::GetLocal, Opcode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(current, name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (Opcode::GetGlobal, Opcode::SetGlobal, constant)
        };

        if !can_assign {
            self.emit_op_byte(get_op, arg);
            return;
        }

        if self.match_kind(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else if self.match_kind(TokenKind::PlusPlus) {
            self.emit_op_byte(get_op, arg);
            self.emit_op(Opcode::Inc);
            self.emit_op_byte(set_op, arg);
            self.emit_op(Opcode::Dec);
        } else if self.match_kind(TokenKind::MinusMinus) {
            self.emit_op_byte(get_op, arg);
            self.emit_op(Opcode::Dec);
            self.emit_op_byte(set_op, arg);
            self.emit_op(Opcode::Inc);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // === Pratt machinery ===

    fn rule(kind: TokenKind) -> Rule<'src, 'h> {
        let (prefix, infix, precedence): (Option<ParseFn<'src, 'h>>, Option<ParseFn<'src, 'h>>, Precedence) = match kind
        {
            TokenKind::LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            TokenKind::LeftBracket => (Some(Self::list_literal), Some(Self::subscript), Precedence::Call),
            TokenKind::Dot => (None, Some(Self::dot), Precedence::Call),
            TokenKind::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => (None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Star => (None, Some(Self::binary), Precedence::Factor),
            TokenKind::Bang => (Some(Self::unary), None, Precedence::None),
            TokenKind::BangEqual | TokenKind::EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            TokenKind::Identifier => (Some(Self::variable), None, Precedence::None),
            TokenKind::Str => (Some(Self::string), None, Precedence::None),
            TokenKind::Number => (Some(Self::number), None, Precedence::None),
            TokenKind::And => (None, Some(Self::and_), Precedence::And),
            TokenKind::Or => (None, Some(Self::or_), Precedence::Or),
            TokenKind::False | TokenKind::Nil | TokenKind::True => (Some(Self::literal), None, Precedence::None),
            TokenKind::Super => (Some(Self::super_), None, Precedence::None),
            TokenKind::This => (Some(Self::this_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        Rule {
            prefix,
            infix,
            precedence,
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.parser.previous.kind).prefix else {
            self.error("expect expression.");
            return;
        };

        // Only an expression parsed at assignment precedence may be an
        // assignment target.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.parser.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.parser.previous.kind)
                .infix
                .expect("token with a precedence always has an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_kind(TokenKind::Equal) {
            self.error("invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // === expression handlers ===

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.parser.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.parser.previous.lexeme.as_bytes();
        // Strip the surrounding quotes, then decode escapes.
        let bytes = decode_escapes(&lexeme[1..lexeme.len() - 1]);
        let id = self.heap.intern_bytes(&bytes);
        self.emit_constant(Value::Obj(id));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            TokenKind::True => self.emit_op(Opcode::True),
            _ => unreachable!("literal handler on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous.lexeme, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(Opcode::Not),
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            _ => unreachable!("unary handler on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        let rule = Self::rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenKind::BangEqual => self.emit_ops(Opcode::Equal, Opcode::Not),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(Opcode::Less, Opcode::Not),
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEqual => self.emit_ops(Opcode::Greater, Opcode::Not),
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            _ => unreachable!("binary handler on non-binary token"),
        }
    }

    /// `and` short-circuits by jumping over the right operand, popping the
    /// left value only when evaluation continues.
    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(Opcode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expect property name after '.'.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        if can_assign && self.match_kind(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(Opcode::SetProperty, name);
        } else if self.match_kind(TokenKind::LeftParen) {
            // Property access followed by a call collapses into the
            // method-dispatch fast path.
            let arg_count = self.argument_list();
            self.emit_op_byte(Opcode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(Opcode::GetProperty, name);
        }
    }

    /// `a[i]`, `a[i] = v`, and the append form `a[] = v`.
    fn subscript(&mut self, can_assign: bool) {
        let has_index = !self.check(TokenKind::RightBracket);
        if has_index {
            self.expression();
        }
        self.consume(TokenKind::RightBracket, "expect ']' after subscript.");

        if can_assign && self.match_kind(TokenKind::Equal) {
            self.expression();
            if has_index {
                self.emit_op(Opcode::SetIndex);
            } else {
                self.emit_op(Opcode::ShiftIndex);
            }
        } else if has_index {
            self.emit_op(Opcode::GetIndex);
        } else {
            self.error("expect index expression in '[]'.");
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut length: usize = 0;
        loop {
            if self.check(TokenKind::RightBracket) {
                break;
            }
            self.expression();
            length += 1;
            if length > 255 {
                self.error("can't have more than 255 elements in a list literal.");
                return;
            }
            if !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "expect ']' after list elements.");
        self.emit_op_byte(Opcode::List, length as u8);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "expect superclass method name.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        self.named_variable("this", false);
        if self.match_kind(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_byte(Opcode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op_byte(Opcode::GetSuper, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    // === declarations and statements ===

    fn declaration(&mut self) {
        if self.match_kind(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_kind(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_kind(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_kind(TokenKind::Print) {
            self.print_statement();
        } else if self.match_kind(TokenKind::Break) {
            self.break_statement();
        } else if self.match_kind(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_kind(TokenKind::For) {
            self.for_statement();
        } else if self.match_kind(TokenKind::If) {
            self.if_statement();
        } else if self.match_kind(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_kind(TokenKind::Return) {
            self.return_statement();
        } else if self.match_kind(TokenKind::While) {
            self.while_statement();
        } else if self.match_kind(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after block.");
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern_bytes(self.parser.previous.lexeme.as_bytes());
        self.funcs.push(FuncScope::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.func_ref().arity == 255 {
                    self.error_at_current("can't have more than 255 parameters.");
                } else {
                    self.func().arity += 1;
                }
                let constant = self.parse_variable("expect parameter name.");
                self.define_variable(constant);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "expect '{' before function body.");
        self.block();

        // No end_scope: the frame disappears wholesale at runtime.
        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(Opcode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "expect method name.");
        let constant = self.identifier_constant(self.parser.previous.lexeme);
        let kind = if self.parser.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op_byte(Opcode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op_byte(Opcode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassScope { has_superclass: false });

        if self.match_kind(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expect superclass name.");
            self.variable(false);

            if class_name.lexeme == self.parser.previous.lexeme {
                self.error("a class can't inherit from itself.");
            }

            // `super` lives in a scope of its own so every method closure
            // can capture it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name.lexeme, false);
            self.emit_op(Opcode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        // The class goes back on the stack so Method opcodes can find it.
        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after class body.");
        self.emit_op(Opcode::Pop);

        if self.classes.last().is_some_and(|c| c.has_superclass) {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("expect function name.");
        // Initialized before the body compiles so the function can recurse.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        loop {
            let message = if self.parser.previous.kind == TokenKind::Comma {
                "expect ';' after declaration."
            } else {
                "expect variable name."
            };
            let global = self.parse_variable(message);

            if self.match_kind(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(Opcode::Nil);
            }
            self.define_variable(global);

            if !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "expect ';' after variable declaration.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expect ';' after expression.");
        self.emit_op(Opcode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expect ';' after value.");
        self.emit_op(Opcode::Print);
    }

    fn return_statement(&mut self) {
        if self.func_ref().kind == FunctionKind::Script {
            self.error("can't return from top-level code.");
        }
        if self.match_kind(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.func_ref().kind == FunctionKind::Initializer {
                self.error("can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after condition.");

        // The jump peeks the condition, so both paths pop it explicitly.
        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);

        if self.match_kind(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.func_ref().chunk.code.len();
        let depth = self.func_ref().scope_depth;
        self.loops.push(LoopScope { start: loop_start, depth });
        self.breaks.push(BreakScope {
            depth,
            jumps: SmallVec::new(),
        });

        self.consume(TokenKind::LeftParen, "expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        // The condition value is still on the stack on the exit path too.
        self.emit_op(Opcode::Pop);

        self.loops.pop();
        self.patch_breaks();
    }

    fn for_statement(&mut self) {
        // A variable declared in the initializer is scoped to the loop.
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expect '(' after 'for'.");
        if self.match_kind(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_kind(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.func_ref().chunk.code.len();
        let depth = self.func_ref().scope_depth;
        self.loops.push(LoopScope { start: loop_start, depth });
        self.breaks.push(BreakScope {
            depth,
            jumps: SmallVec::new(),
        });

        let mut exit_jump = None;
        if !self.match_kind(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_kind(TokenKind::RightParen) {
            // The increment textually precedes the body but runs after it:
            // jump over it now, loop back to it from the body's end.
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.func_ref().chunk.code.len();
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            if let Some(scope) = self.loops.last_mut() {
                // `continue` must run the increment, not skip it.
                scope.start = increment_start;
            }
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Opcode::Pop);
        }

        self.loops.pop();
        self.patch_breaks();
        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after value.");
        self.consume(TokenKind::LeftBrace, "expect '{' before switch cases.");

        let depth = self.func_ref().scope_depth;
        self.breaks.push(BreakScope {
            depth,
            jumps: SmallVec::new(),
        });

        // 0: before any case, 1: inside cases, 2: after default.
        let mut state = 0u8;
        let mut previous_case_skip: Option<usize> = None;
        let mut fall_through: Option<usize> = None;

        while !self.match_kind(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_kind(TokenKind::Case) || self.match_kind(TokenKind::Default) {
                let case_kind = self.parser.previous.kind;

                if state == 2 {
                    self.error("can't have cases after the default case.");
                }

                if state == 1 {
                    // The previous case matched but did not break; its body
                    // falls into this one over the comparison.
                    fall_through = Some(self.emit_jump(Opcode::Jump));
                    if let Some(skip) = previous_case_skip.take() {
                        self.patch_jump(skip);
                        self.emit_op(Opcode::Pop);
                    }
                }

                if case_kind == TokenKind::Case {
                    state = 1;
                    // Compare against a copy of the discriminant.
                    self.emit_op(Opcode::Dup);
                    self.expression();
                    self.consume(TokenKind::Colon, "expect ':' after case value.");
                    self.emit_op(Opcode::Equal);
                    previous_case_skip = Some(self.emit_jump(Opcode::JumpIfFalse));
                    // Pop the comparison result before the body runs.
                    self.emit_op(Opcode::Pop);
                } else {
                    state = 2;
                    self.consume(TokenKind::Colon, "expect ':' after 'default'.");
                    previous_case_skip = None;
                }

                if let Some(jump) = fall_through.take() {
                    self.patch_jump(jump);
                }
            } else {
                if state == 0 {
                    self.error("can't have statements before any case.");
                }
                self.statement();
            }
        }

        // Without a default, the last case's miss-jump lands on a pop of the
        // comparison result; a matched body must hop over that pop.
        if state == 1 {
            let end_fall_through = self.emit_jump(Opcode::Jump);
            if let Some(skip) = previous_case_skip.take() {
                self.patch_jump(skip);
                self.emit_op(Opcode::Pop);
            }
            self.patch_jump(end_fall_through);
        }

        self.patch_breaks();
        // Discard the discriminant.
        self.emit_op(Opcode::Pop);
        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.breaks.is_empty() {
            self.error("can't use 'break' outside of a loop or switch.");
            self.consume(TokenKind::Semicolon, "expect ';' after 'break'.");
            return;
        }
        self.consume(TokenKind::Semicolon, "expect ';' after 'break'.");

        let depth = self.breaks.last().map_or(0, |scope| scope.depth);
        self.discard_locals_deeper_than(depth);

        let jump = self.emit_jump(Opcode::Jump);
        let full = self.breaks.last().is_some_and(|scope| scope.jumps.len() == MAX_BREAKS);
        if full {
            self.error("too many 'break' statements in one loop or switch.");
        } else if let Some(scope) = self.breaks.last_mut() {
            scope.jumps.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        if self.loops.is_empty() {
            self.error("can't use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "expect ';' after 'continue'.");
            return;
        }
        self.consume(TokenKind::Semicolon, "expect ';' after 'continue'.");

        let (start, depth) = self.loops.last().map_or((0, 0), |scope| (scope.start, scope.depth));
        self.discard_locals_deeper_than(depth);
        self.emit_loop(start);
    }

    /// Emits pops for locals that would go out of scope when control leaves
    /// early, without removing them from compile-time scope tracking.
    fn discard_locals_deeper_than(&mut self, depth: i32) {
        let pops = self
            .func_ref()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .count();
        for _ in 0..pops {
            self.emit_op(Opcode::Pop);
        }
    }

    /// Patches every `break` recorded for the construct that just ended.
    fn patch_breaks(&mut self) {
        let scope = self.breaks.pop().expect("break scope stack underflow");
        for jump in scope.jumps {
            self.patch_jump(jump);
        }
    }

    /// Skips tokens until a statement boundary so parsing can resume after
    /// an error.
    fn synchronize(&mut self) {
        self.parser.panic_mode = false;

        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }
}

/// Decodes the escape sequences of a string literal's inner bytes.
///
/// Recognized: `\\ \" \' \a \b \e \n \r \t \?`, `\xHH` (one raw byte), and
/// `\uHHHH` (UTF-8 encoded codepoint). Anything else, including truncated
/// hex forms, is kept verbatim.
fn decode_escapes(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'\\' || i + 1 >= raw.len() {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        match raw[i + 1] {
            b'u' if i + 6 <= raw.len() && raw[i + 2..i + 6].iter().all(u8::is_ascii_hexdigit) => {
                let codepoint = hex_value(&raw[i + 2..i + 6]);
                if let Some(c) = char::from_u32(codepoint) {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    i += 6;
                } else {
                    // Unencodable (surrogate) codepoint: keep the backslash.
                    out.push(b'\\');
                    i += 1;
                }
            }
            b'x' if i + 4 <= raw.len() && raw[i + 2..i + 4].iter().all(u8::is_ascii_hexdigit) => {
                out.push(hex_value(&raw[i + 2..i + 4]) as u8);
                i += 4;
            }
            simple => {
                let decoded = match simple {
                    b'\\' => Some(b'\\'),
                    b'"' => Some(b'"'),
                    b'\'' => Some(b'\''),
                    b'a' => Some(0x07),
                    b'b' => Some(0x08),
                    b'e' => Some(0x1B),
                    b'n' => Some(b'\n'),
                    b'r' => Some(b'\r'),
                    b't' => Some(b'\t'),
                    b'?' => Some(b'?'),
                    _ => None,
                };
                if let Some(byte) = decoded {
                    out.push(byte);
                    i += 2;
                } else {
                    out.push(b'\\');
                    i += 1;
                }
            }
        }
    }
    out
}

fn hex_value(digits: &[u8]) -> u32 {
    digits.iter().fold(0, |acc, &d| {
        let nibble = match d {
            b'0'..=b'9' => u32::from(d - b'0'),
            b'a'..=b'f' => u32::from(d - b'a' + 10),
            b'A'..=b'F' => u32::from(d - b'A' + 10),
            _ => unreachable!("caller checked hex digits"),
        };
        acc * 16 + nibble
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn compile_errors(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        match compile(source, &mut heap) {
            Ok(_) => Vec::new(),
            Err(errors) => errors.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn decodes_simple_escapes() {
        assert_eq!(decode_escapes(br"A\tB\n"), b"A\tB\n");
        assert_eq!(decode_escapes(br#"\"quoted\""#), b"\"quoted\"");
        assert_eq!(decode_escapes(br"\a\b\e\?"), &[0x07, 0x08, 0x1B, b'?']);
    }

    #[test]
    fn decodes_hex_and_unicode_escapes() {
        assert_eq!(decode_escapes(br"\x41\x00"), &[0x41, 0x00]);
        assert_eq!(decode_escapes(br"\u00e9"), "\u{e9}".as_bytes());
        assert_eq!(decode_escapes(br"\u4e2d"), "\u{4e2d}".as_bytes());
    }

    #[test]
    fn keeps_malformed_escapes_verbatim() {
        assert_eq!(decode_escapes(br"\q"), b"\\q");
        assert_eq!(decode_escapes(br"\x4"), b"\\x4");
        assert_eq!(decode_escapes(br"\uZZZZ"), b"\\uZZZZ");
    }

    #[test]
    fn clean_sources_compile() {
        assert_eq!(compile_errors("print 1 + 2;"), Vec::<String>::new());
        assert_eq!(
            compile_errors("class A { init(x) { this.x = x; } } var a = A(1);"),
            Vec::<String>::new()
        );
        assert_eq!(
            compile_errors("fun f() { var xs = [1, 2]; for (var i = 0; i < 2; i = i + 1) { xs[i] = i; } }"),
            Vec::<String>::new()
        );
    }

    #[test]
    fn reports_missing_expression() {
        let errors = compile_errors("print ;");
        assert_eq!(errors, vec!["[line 1] Error at ';': expect expression."]);
    }

    #[test]
    fn synchronizes_and_reports_independent_errors() {
        let errors = compile_errors("print ;\nvar 2 = 3;\n");
        assert_eq!(
            errors,
            vec![
                "[line 1] Error at ';': expect expression.",
                "[line 2] Error at '2': expect variable name.",
            ]
        );
    }

    #[test]
    fn rejects_return_at_top_level() {
        let errors = compile_errors("return 1;");
        assert_eq!(errors, vec!["[line 1] Error at 'return': can't return from top-level code."]);
    }

    #[test]
    fn rejects_returning_value_from_initializer() {
        let errors = compile_errors("class A { init() { return 1; } }");
        assert_eq!(
            errors,
            vec!["[line 1] Error at 'return': can't return a value from an initializer."]
        );
    }

    #[test]
    fn rejects_break_and_continue_outside_loops() {
        assert_eq!(
            compile_errors("break;"),
            vec!["[line 1] Error at 'break': can't use 'break' outside of a loop or switch."]
        );
        assert_eq!(
            compile_errors("continue;"),
            vec!["[line 1] Error at 'continue': can't use 'continue' outside of a loop."]
        );
    }

    #[test]
    fn rejects_this_and_super_outside_classes() {
        assert_eq!(
            compile_errors("print this;"),
            vec!["[line 1] Error at 'this': can't use 'this' outside of a class."]
        );
        assert_eq!(
            compile_errors("class A { f() { return super.f(); } }"),
            vec!["[line 1] Error at 'super': can't use 'super' in a class with no superclass."]
        );
    }

    #[test]
    fn rejects_self_inheritance() {
        let errors = compile_errors("class A < A {}");
        assert_eq!(errors, vec!["[line 1] Error at 'A': a class can't inherit from itself."]);
    }

    #[test]
    fn rejects_duplicate_declaration_in_scope() {
        let errors = compile_errors("{ var a = 1; var a = 2; }");
        assert_eq!(
            errors,
            vec!["[line 1] Error at 'a': already a variable with this name in this scope."]
        );
    }

    #[test]
    fn rejects_reading_local_in_its_own_initializer() {
        let errors = compile_errors("{ var a = 1; { var a = a; } }");
        assert_eq!(
            errors,
            vec!["[line 1] Error at 'a': can't read local variable in its own initializer."]
        );
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        let errors = compile_errors("var a = 1; var b = 2; a + b = 3;");
        assert_eq!(errors, vec!["[line 1] Error at '=': invalid assignment target."]);
    }

    #[test]
    fn rejects_statements_before_any_case() {
        let errors = compile_errors("switch (1) { print 1; }");
        assert_eq!(
            errors,
            vec!["[line 1] Error at 'print': can't have statements before any case."]
        );
    }

    #[test]
    fn rejects_cases_after_default() {
        let errors = compile_errors("switch (1) { default: print 0; case 1: print 1; }");
        assert_eq!(
            errors,
            vec!["[line 1] Error at 'case': can't have cases after the default case."]
        );
    }

    #[test]
    fn enforces_constant_pool_limit() {
        // 256 distinct number literals fit; adding distinct globals'
        // name constants pushes the pool past the 8-bit limit.
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        let errors = compile_errors(&source);
        assert!(
            errors.iter().any(|e| e.contains("too many constants in one chunk.")),
            "got: {errors:?}"
        );
    }

    #[test]
    fn comma_separated_var_declarations_compile() {
        assert_eq!(compile_errors("var a = 1, b, c = 3; print b;"), Vec::<String>::new());
    }
}
