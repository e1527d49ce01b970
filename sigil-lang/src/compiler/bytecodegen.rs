use crate::interner::{Symbol, ToSymbol};
use crate::runtime::vm::{
    mark_globals, Disassembly, FuncProto, GlobalTable, Heap, Marker, ObjRef, Object, OpCode,
    RootSource, TypeId, Value,
};
use crate::utils::error::ReportableError;
use crate::utils::metadata::{Location, GLOBAL_LABEL};

use super::parser::{Op, Token, TokenInfo, TokenStream, TooManyLines, MAX_LINES};
use super::resolver::{self, Environment, FunctionKind, Resolved, UpvalueDesc};
use super::{Error, ErrorAt, ErrorKind};

/// Everything the compiler holds on to that the collector must not free: the
/// name and literal pool of every function still being compiled, and the
/// globals of earlier runs.
struct CompilerRoots<'a> {
    envs: &'a [Environment],
    globals: &'a GlobalTable,
}

impl RootSource for CompilerRoots<'_> {
    fn mark_roots(&self, marker: &mut Marker<'_>) {
        for env in self.envs.iter() {
            if let Some(name) = env.proto.name {
                marker.mark_object(name);
            }
            env.proto
                .chunk
                .literals
                .iter()
                .for_each(|v| marker.mark_value(*v));
        }
        mark_globals(self.globals, marker);
    }
}

macro_rules! compiler_roots {
    ($self:ident) => {
        &CompilerRoots {
            envs: &$self.envs,
            globals: $self.globals,
        }
    };
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
    Call,       // () []
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
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

fn infix_precedence(token: &Token) -> Precedence {
    match token {
        Token::Or => Precedence::Or,
        Token::And => Precedence::And,
        Token::Op(Op::Equal | Op::NotEqual) => Precedence::Equality,
        Token::Op(Op::LessThan | Op::LessEqual | Op::GreaterThan | Op::GreaterEqual) => {
            Precedence::Comparison
        }
        Token::Op(Op::Sum | Op::Minus) => Precedence::Term,
        Token::Op(Op::Product | Op::Divide) => Precedence::Factor,
        Token::ParenBegin | Token::ArrayBegin => Precedence::Call,
        _ => Precedence::None,
    }
}

/// What happens to an expression statement that is closed by `}` instead of `;`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trailing {
    /// Not allowed, `;` is required.
    Statement,
    Discard,
    /// Appended to the accumulator list in the given slot.
    Append(u8),
}

fn start_of_input() -> TokenInfo {
    TokenInfo {
        token: Token::EndOfInput,
        line: 1,
        column: 1,
        span: 0..0,
    }
}

/// Single pass compiler: parses with precedence climbing and emits straight
/// into the chunk of the innermost function being compiled.
pub struct ByteCodeGenerator<'a> {
    src: &'a str,
    tokens: TokenStream,
    heap: &'a mut Heap,
    globals: &'a GlobalTable,
    // innermost function last
    envs: Vec<Environment>,
    current: TokenInfo,
    previous: TokenInfo,
    errors: Vec<Error>,
    panic_mode: bool,
    fatal: bool,
}

impl<'a> ByteCodeGenerator<'a> {
    fn new(src: &'a str, tokens: TokenStream, heap: &'a mut Heap, globals: &'a GlobalTable) -> Self {
        let script = Environment::new(FunctionKind::Script, FuncProto::new(None), "".to_symbol());
        Self {
            src,
            tokens,
            heap,
            globals,
            envs: vec![script],
            current: start_of_input(),
            previous: start_of_input(),
            errors: vec![],
            panic_mode: false,
            fatal: false,
        }
    }

    fn env(&self) -> &Environment {
        self.envs
            .last()
            .unwrap_or_else(|| unreachable!("no function being compiled"))
    }
    fn env_mut(&mut self) -> &mut Environment {
        self.envs
            .last_mut()
            .unwrap_or_else(|| unreachable!("no function being compiled"))
    }
    fn is_global_scope(&self) -> bool {
        let env = self.env();
        env.kind == FunctionKind::Script && env.scope_depth == 0
    }

    fn run(mut self) -> Result<ObjRef, Vec<Error>> {
        self.advance();
        while !self.matches(&Token::EndOfInput) {
            self.declaration(Trailing::Statement);
        }
        let (function, _) = self.end_function();
        if self.errors.is_empty() {
            Ok(function)
        } else {
            Err(self.errors)
        }
    }

    // tokens

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, start_of_input());
        loop {
            if self.fatal {
                self.current = TokenInfo {
                    token: Token::EndOfInput,
                    ..self.previous.clone()
                };
                return;
            }
            match self.tokens.next_token() {
                Ok(info) => {
                    let lexical = match &info.token {
                        Token::Error(msg) => Some(msg.clone()),
                        _ => None,
                    };
                    self.current = info;
                    match lexical {
                        Some(msg) => self.error_at_current(ErrorKind::Lexical(msg)),
                        None => return,
                    }
                }
                Err(TooManyLines { span }) => {
                    self.current = TokenInfo {
                        token: Token::EndOfInput,
                        line: MAX_LINES as u16,
                        column: 1,
                        span,
                    };
                    self.error_at_current(ErrorKind::TooManyLines);
                }
            }
        }
    }

    fn check(&self, token: &Token) -> bool {
        self.current.token == *token
    }

    fn matches(&mut self, token: &Token) -> bool {
        if !self.check(token) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token: &Token, what: &'static str) {
        if self.check(token) {
            self.advance();
        } else {
            self.error_at_current(ErrorKind::Expected(what));
        }
    }

    fn consume_identifier(&mut self, what: &'static str) -> Option<Symbol> {
        match self.current.token {
            Token::Ident(name) => {
                self.advance();
                Some(name)
            }
            _ => {
                self.error_at_current(ErrorKind::Expected(what));
                None
            }
        }
    }

    // errors

    fn error(&mut self, kind: ErrorKind) {
        let info = self.previous.clone();
        self.error_at(&info, kind);
    }

    fn error_at_current(&mut self, kind: ErrorKind) {
        let info = self.current.clone();
        self.error_at(&info, kind);
    }

    fn error_at(&mut self, info: &TokenInfo, kind: ErrorKind) {
        if self.fatal || (self.panic_mode && !kind.is_fatal()) {
            return;
        }
        self.panic_mode = true;
        self.fatal = kind.is_fatal();
        let at = match (&info.token, &kind) {
            (_, ErrorKind::Lexical(_) | ErrorKind::TooManyLines) | (Token::Error(_), _) => {
                ErrorAt::Nowhere
            }
            (Token::EndOfInput, _) => ErrorAt::End,
            _ => ErrorAt::Lexeme(
                self.src
                    .chars()
                    .skip(info.span.start)
                    .take(info.span.len())
                    .collect(),
            ),
        };
        self.errors.push(Error {
            kind,
            location: Location::new(info.span.clone(), GLOBAL_LABEL.to_symbol()),
            line: info.line,
            at,
        });
    }

    /// Skips to a likely statement boundary after an error. A `}` is left for
    /// the enclosing block to consume.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&Token::EndOfInput) {
            if self.previous.token == Token::SemiColon {
                return;
            }
            match self.current.token {
                Token::BlockEnd
                | Token::Var
                | Token::Const
                | Token::Function
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Echo
                | Token::Return => return,
                _ => self.advance(),
            }
        }
    }

    // emission

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        if self.env_mut().proto.chunk.write(byte, line).is_err() {
            self.error(ErrorKind::CodeTooLarge);
        }
    }

    /// Emits `op` with its operand bytes and tracks the static stack height.
    fn emit(&mut self, op: OpCode, operands: &[u8]) {
        let effect = op.stack_effect(operands.first().copied().unwrap_or(0));
        self.env_mut().stack_height += effect;
        self.emit_byte(op.into());
        for byte in operands.iter() {
            self.emit_byte(*byte);
        }
    }

    fn code_len(&self) -> usize {
        self.env().proto.chunk.len()
    }

    /// Returns the offset of the placeholder operand.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op, &[0xff, 0xff]);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.code_len() - offset - 2;
        match u16::try_from(jump) {
            Ok(jump) => self.env_mut().proto.chunk.patch_u16(offset, jump),
            Err(_) => self.error(ErrorKind::JumpTooLarge),
        }
    }

    fn emit_loop(&mut self, start: usize) {
        // the operand counts from after the LOOP instruction
        let offset = self.code_len() + 3 - start;
        let offset = u16::try_from(offset).unwrap_or_else(|_| {
            self.error(ErrorKind::LoopTooLarge);
            0
        });
        self.emit(OpCode::Loop, &offset.to_le_bytes());
    }

    fn emit_pops(&mut self, count: u8) {
        match count {
            0 => {}
            1 => self.emit(OpCode::Pop, &[]),
            n => self.emit(OpCode::PopN, &[n]),
        }
    }

    fn make_literal(&mut self, value: Value) -> u8 {
        match self.env_mut().proto.chunk.add_literal(value) {
            Some(index) => index,
            None => {
                self.error(ErrorKind::TooManyLiterals);
                0
            }
        }
    }

    fn emit_literal(&mut self, value: Value) {
        let index = self.make_literal(value);
        self.emit(OpCode::Literal, &[index]);
    }

    fn intern(&mut self, text: &str) -> ObjRef {
        self.heap.intern(text, compiler_roots!(self))
    }

    fn name_literal(&mut self, name: Symbol) -> u8 {
        let name = self.intern(&name.to_string());
        self.make_literal(Value::String(name))
    }

    // scopes

    fn declare(&mut self, name: Symbol, is_const: bool) {
        if let Err(e) = self.env_mut().declare_local(name, is_const) {
            self.error(e.into());
        }
    }

    fn declare_hidden(&mut self) -> u8 {
        self.env_mut().declare_hidden().unwrap_or_else(|e| {
            self.error(e.into());
            0
        })
    }

    fn begin_scope(&mut self) {
        self.env_mut().begin_scope();
    }

    fn end_scope(&mut self) {
        let popped = self.env_mut().end_scope();
        let mut pending = 0;
        for local in popped.iter().filter(|l| !l.is_temporary) {
            if local.is_captured {
                self.emit_pops(pending);
                pending = 0;
                self.emit(OpCode::CloseUpvalue, &[]);
            } else {
                pending += 1;
            }
        }
        self.emit_pops(pending);
    }

    /// Every statement leaves exactly its declared locals on the stack.
    fn check_stack_height(&self) {
        if self.errors.is_empty() {
            let env = self.env();
            debug_assert_eq!(
                env.stack_height,
                env.locals.len() as i32,
                "static stack height out of sync with the locals"
            );
        }
    }

    // statements

    /// Returns whether a trailing expression was appended to an accumulator.
    fn declaration(&mut self, trailing: Trailing) -> bool {
        let mut appended = false;
        if self.matches(&Token::Var) {
            self.var_declaration(false);
        } else if self.matches(&Token::Const) {
            self.var_declaration(true);
        } else if self.matches(&Token::Function) {
            if matches!(self.current.token, Token::Ident(_)) {
                self.fn_declaration();
            } else {
                // an anonymous function starting an expression statement
                self.function(None);
                self.infix(Precedence::Assignment, true);
                appended = self.finish_expression_statement(trailing);
            }
        } else {
            appended = self.statement(trailing);
        }
        if self.panic_mode {
            self.synchronize();
        }
        self.check_stack_height();
        appended
    }

    fn var_declaration(&mut self, is_const: bool) {
        let Some(name) = self.consume_identifier("variable name") else {
            return;
        };
        if self.is_global_scope() {
            let global = self.name_literal(name);
            self.initializer(is_const);
            self.consume(&Token::SemiColon, "';' after variable declaration");
            let op = if is_const {
                OpCode::DefineGlobalConst
            } else {
                OpCode::DefineGlobalVar
            };
            self.emit(op, &[global]);
        } else {
            self.declare(name, is_const);
            self.initializer(is_const);
            self.consume(&Token::SemiColon, "';' after variable declaration");
            self.env_mut().mark_defined();
        }
    }

    fn initializer(&mut self, is_const: bool) {
        if self.matches(&Token::Assign) {
            self.expression();
        } else {
            if is_const {
                self.error(ErrorKind::ConstWithoutInitializer);
            }
            self.emit(OpCode::Nil, &[]);
        }
    }

    fn fn_declaration(&mut self) {
        let Some(name) = self.consume_identifier("function name") else {
            return;
        };
        if self.is_global_scope() {
            let global = self.name_literal(name);
            self.function(Some(name));
            self.emit(OpCode::DefineGlobalVar, &[global]);
        } else {
            self.declare(name, false);
            self.env_mut().mark_defined();
            self.function(Some(name));
        }
    }

    fn statement(&mut self, trailing: Trailing) -> bool {
        match self.current.token {
            Token::If => {
                self.advance();
                self.if_statement();
            }
            Token::While => {
                self.advance();
                self.while_statement();
            }
            Token::For => {
                self.advance();
                self.for_loop(None);
            }
            Token::Return => {
                self.advance();
                self.return_statement();
            }
            Token::BlockBegin => {
                self.advance();
                self.begin_scope();
                self.block(Trailing::Statement);
                self.end_scope();
            }
            _ => {
                self.expression();
                return self.finish_expression_statement(trailing);
            }
        }
        false
    }

    fn finish_expression_statement(&mut self, trailing: Trailing) -> bool {
        match trailing {
            Trailing::Append(slot) if self.check(&Token::BlockEnd) => {
                self.emit(OpCode::AppendLocal, &[slot]);
                true
            }
            Trailing::Discard if self.check(&Token::BlockEnd) => {
                self.emit(OpCode::Pop, &[]);
                false
            }
            _ => {
                self.consume(&Token::SemiColon, "';' after expression");
                self.emit(OpCode::Pop, &[]);
                false
            }
        }
    }

    /// Declarations up to and including the closing `}`.
    fn block(&mut self, trailing: Trailing) -> bool {
        let mut appended = false;
        while !self.check(&Token::BlockEnd) && !self.check(&Token::EndOfInput) {
            appended = self.declaration(trailing);
        }
        self.consume(&Token::BlockEnd, "'}' after block");
        appended
    }

    fn scoped_block(&mut self, what: &'static str) {
        self.consume(&Token::BlockBegin, what);
        self.begin_scope();
        self.block(Trailing::Statement);
        self.end_scope();
    }

    fn if_statement(&mut self) {
        let mut exits = vec![];
        loop {
            self.expression();
            let skip = self.emit_jump(OpCode::JumpIfFalsePop);
            self.scoped_block("'{' after condition");
            if self.check(&Token::Elif) || self.check(&Token::Else) {
                exits.push(self.emit_jump(OpCode::Jump));
            }
            self.patch_jump(skip);
            if self.matches(&Token::Elif) {
                continue;
            }
            if self.matches(&Token::Else) {
                self.scoped_block("'{' after 'else'");
            }
            break;
        }
        for exit in exits {
            self.patch_jump(exit);
        }
    }

    fn while_statement(&mut self) {
        let start = self.code_len();
        self.expression();
        let exit = self.emit_jump(OpCode::JumpIfFalsePop);
        self.scoped_block("'{' after condition");
        self.emit_loop(start);
        self.patch_jump(exit);
    }

    fn return_statement(&mut self) {
        if self.env().kind == FunctionKind::Script {
            self.error(ErrorKind::ReturnAtTopLevel);
        }
        if self.matches(&Token::SemiColon) {
            self.emit(OpCode::Nil, &[]);
        } else {
            self.expression();
            self.consume(&Token::SemiColon, "';' after return value");
        }
        self.emit(OpCode::Return, &[]);
    }

    /// `for` has been consumed. With `acc`, every iteration appends its value to
    /// the list in that slot.
    ///
    /// The loop variable is followed by two hidden locals, the end bound and
    /// the step direction, which `COMPARE_ITERATOR` fixes on its first run.
    fn for_loop(&mut self, acc: Option<u8>) {
        self.begin_scope();
        let name = self.consume_identifier("loop variable name");
        self.consume(&Token::In, "'in' after loop variable");

        // the loop variable starts at 0 unless a start bound replaces it
        let zero = self.make_literal(Value::Number(0.0));
        self.emit(OpCode::Literal, &[zero]);
        let var = self.declare_hidden();
        let inclusive = match self.current.token {
            Token::Colon | Token::ColonEqual => self.range_end(),
            _ => {
                self.expression();
                match self.current.token {
                    Token::Colon | Token::ColonEqual => {
                        self.emit(OpCode::SetLocal, &[var]);
                        self.emit(OpCode::Pop, &[]);
                        self.range_end()
                    }
                    // a single bound is the end
                    _ => false,
                }
            }
        };
        self.declare_hidden();
        self.emit(OpCode::Literal, &[zero]);
        let dir = self.declare_hidden();
        if let Some(name) = name {
            if let Some(local) = self.env_mut().locals.get_mut(var as usize) {
                local.name = name;
            }
        }

        let start = self.code_len();
        self.emit(OpCode::CompareIterator, &[var, inclusive as u8]);
        let exit = self.emit_jump(OpCode::JumpIfZero);

        self.consume(&Token::BlockBegin, "'{' before loop body");
        self.begin_scope();
        let trailing = acc.map_or(Trailing::Discard, Trailing::Append);
        let appended = self.block(trailing);
        if let Some(slot) = acc.filter(|_| !appended) {
            self.emit(OpCode::Nil, &[]);
            self.emit(OpCode::AppendLocal, &[slot]);
        }
        self.end_scope();

        self.emit(OpCode::GetLocal, &[var]);
        self.emit(OpCode::GetLocal, &[dir]);
        self.emit(OpCode::Add, &[]);
        self.emit(OpCode::SetLocal, &[var]);
        self.emit(OpCode::Pop, &[]);
        self.emit_loop(start);
        self.patch_jump(exit);
        self.end_scope();
    }

    /// Consumes `:` or `:=` and the end bound. Returns whether it is inclusive.
    fn range_end(&mut self) -> bool {
        let inclusive = self.check(&Token::ColonEqual);
        self.advance();
        self.expression();
        inclusive
    }

    // functions

    /// Compiles parameters and body into a new function and emits the
    /// `CLOSURE` that instantiates it.
    fn function(&mut self, name: Option<Symbol>) {
        let label = name.map_or_else(|| "anonymous".to_string(), |n| n.to_string());
        let label = self.intern(&label);
        let slot0 = name.unwrap_or_else(|| "".to_symbol());
        self.envs.push(Environment::new(
            FunctionKind::Function,
            FuncProto::new(Some(label)),
            slot0,
        ));
        self.begin_scope();

        self.consume(&Token::ParenBegin, "'(' after function name");
        if !self.check(&Token::ParenEnd) {
            loop {
                if self.env().proto.arity == u8::MAX {
                    self.error_at_current(ErrorKind::TooManyParameters);
                } else {
                    self.env_mut().proto.arity += 1;
                }
                if let Some(param) = self.consume_identifier("parameter name") {
                    self.declare(param, false);
                    let env = self.env_mut();
                    env.mark_defined();
                    // arguments are already on the stack when the body runs
                    env.stack_height += 1;
                }
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.consume(&Token::ParenEnd, "')' after parameters");
        self.consume(&Token::BlockBegin, "'{' before function body");
        self.block(Trailing::Statement);

        let (function, upvalues) = self.end_function();
        let index = self.make_literal(Value::Function(function));
        let mut operands = vec![index];
        for upvalue in upvalues.iter() {
            operands.push(upvalue.is_local as u8);
            operands.push(upvalue.index);
        }
        self.emit(OpCode::Closure, &operands);
    }

    /// Finishes the innermost function and moves it into the heap.
    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit(OpCode::Nil, &[]);
        self.emit(OpCode::Return, &[]);
        let Environment {
            mut proto,
            upvalues,
            ..
        } = self
            .envs
            .pop()
            .unwrap_or_else(|| unreachable!("no function being compiled"));
        proto.upvalue_count = upvalues.len();
        if self.errors.is_empty() && log::log_enabled!(log::Level::Debug) {
            let dis = Disassembly {
                function: &proto,
                heap: &*self.heap,
                nested: false,
            };
            log::debug!("{dis}");
        }
        let function = self
            .heap
            .alloc(Object::Function(proto), compiler_roots!(self));
        (function, upvalues)
    }

    // expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(can_assign) {
            self.error(ErrorKind::Expected("expression"));
            return;
        }
        self.infix(precedence, can_assign);
    }

    fn infix(&mut self, precedence: Precedence, can_assign: bool) {
        while precedence <= infix_precedence(&self.current.token) {
            self.advance();
            self.infix_rule(can_assign);
        }
        if can_assign && self.matches(&Token::Assign) {
            self.error(ErrorKind::InvalidAssignmentTarget);
        }
    }

    /// Returns false when the previous token cannot start an expression.
    fn prefix(&mut self, can_assign: bool) -> bool {
        match self.previous.token.clone() {
            Token::Number(text) => match text.parse::<f64>() {
                Ok(n) => self.emit_literal(Value::Number(n)),
                Err(_) => self.error(ErrorKind::Lexical("Malformed number".to_string())),
            },
            Token::Str(text) => {
                let s = self.intern(&text);
                self.emit_literal(Value::String(s));
            }
            Token::True => self.emit(OpCode::True, &[]),
            Token::False => self.emit(OpCode::False, &[]),
            Token::Nil => self.emit(OpCode::Nil, &[]),
            Token::TypeLit(t) => {
                let op = match t {
                    TypeId::Bool => OpCode::TypeBool,
                    TypeId::Float => OpCode::TypeFloat,
                    TypeId::String => OpCode::TypeString,
                    TypeId::List => OpCode::TypeList,
                    TypeId::Function => OpCode::TypeFunction,
                    TypeId::TypeId => OpCode::TypeTypeId,
                };
                self.emit(op, &[]);
            }
            Token::Ident(name) => self.variable(name, can_assign),
            Token::ParenBegin => {
                self.expression();
                self.consume(&Token::ParenEnd, "')' after expression");
            }
            Token::ArrayBegin => self.list(),
            Token::Op(Op::Minus) => {
                self.parse_precedence(Precedence::Unary);
                self.emit(OpCode::Negate, &[]);
            }
            Token::Op(Op::Not) => {
                self.parse_precedence(Precedence::Unary);
                self.emit(OpCode::Not, &[]);
            }
            Token::Print => self.builtin(OpCode::Print, "'(' after 'print'"),
            Token::Echo => self.builtin(OpCode::Echo, "'(' after 'echo'"),
            Token::TypeOf => self.builtin(OpCode::Type, "'(' after 'type'"),
            Token::Function => {
                let name = match self.current.token {
                    Token::Ident(name) => {
                        self.advance();
                        Some(name)
                    }
                    _ => None,
                };
                self.function(name);
            }
            Token::For => self.for_expression(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, can_assign: bool) {
        match self.previous.token {
            Token::Op(op) => self.binary(op),
            Token::And => {
                let end = self.emit_jump(OpCode::JumpIfFalse);
                self.emit(OpCode::Pop, &[]);
                self.parse_precedence(Precedence::And);
                self.patch_jump(end);
            }
            Token::Or => {
                let end = self.emit_jump(OpCode::JumpIfTrue);
                self.emit(OpCode::Pop, &[]);
                self.parse_precedence(Precedence::Or);
                self.patch_jump(end);
            }
            Token::ParenBegin => self.call(),
            Token::ArrayBegin => self.index(can_assign),
            ref other => unreachable!("{other} has no infix rule"),
        }
    }

    fn binary(&mut self, op: Op) {
        self.parse_precedence(infix_precedence(&Token::Op(op)).next());
        let code = match op {
            Op::Sum => OpCode::Add,
            Op::Minus => OpCode::Subtract,
            Op::Product => OpCode::Multiply,
            Op::Divide => OpCode::Divide,
            Op::Equal => OpCode::Equal,
            Op::NotEqual => OpCode::NotEqual,
            Op::LessThan => OpCode::Less,
            Op::LessEqual => OpCode::LessEqual,
            Op::GreaterThan => OpCode::Greater,
            Op::GreaterEqual => OpCode::GreaterEqual,
            Op::Not => unreachable!("'!' is not a binary operator"),
        };
        self.emit(code, &[]);
    }

    fn call(&mut self) {
        let mut argc: u8 = 0;
        if !self.check(&Token::ParenEnd) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error(ErrorKind::TooManyArguments);
                } else {
                    argc += 1;
                }
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.consume(&Token::ParenEnd, "')' after arguments");
        self.emit(OpCode::Call, &[argc]);
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(&Token::ArrayEnd, "']' after index");
        if can_assign && self.matches(&Token::Assign) {
            self.expression();
            self.emit(OpCode::IndexSet, &[]);
        } else {
            self.emit(OpCode::IndexGet, &[]);
        }
    }

    fn list(&mut self) {
        let mut count: u8 = 0;
        while !self.check(&Token::ArrayEnd) && !self.check(&Token::EndOfInput) {
            self.expression();
            if count == u8::MAX {
                self.error(ErrorKind::TooManyListElements);
            } else {
                count += 1;
            }
            if !self.matches(&Token::Comma) {
                break;
            }
        }
        self.consume(&Token::ArrayEnd, "']' after list elements");
        self.emit(OpCode::MakeList, &[count]);
    }

    fn builtin(&mut self, op: OpCode, what: &'static str) {
        self.consume(&Token::ParenBegin, what);
        self.expression();
        self.consume(&Token::ParenEnd, "')' after argument");
        self.emit(op, &[]);
    }

    fn variable(&mut self, name: Symbol, can_assign: bool) {
        let resolved = match resolver::resolve(&mut self.envs, name) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.error(e.into());
                return;
            }
        };
        let (get, set, operand, is_const) = match resolved {
            Resolved::Local { slot, is_const } => (OpCode::GetLocal, OpCode::SetLocal, slot, is_const),
            Resolved::Upvalue { index, is_const } => {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, index, is_const)
            }
            // constness of globals is checked when the assignment runs
            Resolved::Global => {
                let index = self.name_literal(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, index, false)
            }
        };
        if can_assign && self.matches(&Token::Assign) {
            if is_const {
                self.error(ErrorKind::AssignToConstant);
            }
            self.expression();
            self.emit(set, &[operand]);
        } else {
            self.emit(get, &[operand]);
        }
    }

    /// `for` as an expression evaluates to the list of its iteration values.
    fn for_expression(&mut self) {
        // the local being initialized does not own a stack slot yet
        let shelved = self.env_mut().shelve_pending();
        self.begin_scope();
        // operands already on the stack sit below the loop's locals
        if let Err(e) = self.env_mut().declare_temporaries() {
            self.error(e.into());
        }
        self.emit(OpCode::MakeList, &[0]);
        let acc = self.declare_hidden();
        self.for_loop(Some(acc));
        // the accumulator stays on the stack as the result
        self.env_mut().end_scope();
        self.env_mut().restore_pending(shelved);
    }
}

fn compile_inner(src: &str, heap: &mut Heap, globals: &GlobalTable) -> Result<ObjRef, Vec<Error>> {
    let tokens = TokenStream::new(src).map_err(|errs| {
        errs.into_iter()
            .map(|e| {
                let span = e.0.span();
                let line = src.chars().take(span.start).filter(|c| *c == '\n').count() + 1;
                Error {
                    kind: ErrorKind::Lexical(e.to_string()),
                    location: Location::new(span, GLOBAL_LABEL.to_symbol()),
                    line: line.min(MAX_LINES) as u16,
                    at: ErrorAt::Nowhere,
                }
            })
            .collect::<Vec<_>>()
    })?;
    ByteCodeGenerator::new(src, tokens, heap, globals).run()
}

pub fn gen_bytecode(
    src: &str,
    heap: &mut Heap,
    globals: &GlobalTable,
) -> Result<ObjRef, Vec<Box<dyn ReportableError>>> {
    compile_inner(src, heap, globals).map_err(|errs| {
        errs.into_iter()
            .map(|e| Box::new(e) as Box<dyn ReportableError>)
            .collect()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::vm::{GcConfig, Heap};

    fn compile_ok(heap: &mut Heap, src: &str) -> ObjRef {
        match compile_inner(src, heap, &GlobalTable::new()) {
            Ok(f) => f,
            Err(errs) => panic!(
                "{}",
                errs.iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        }
    }

    fn compile_err(src: &str) -> Vec<String> {
        let mut heap = Heap::default();
        match compile_inner(src, &mut heap, &GlobalTable::new()) {
            Ok(_) => panic!("{src} compiled"),
            Err(errs) => errs.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn ops(heap: &Heap, function: ObjRef) -> Vec<OpCode> {
        let chunk = &heap.function(function).chunk;
        let mut res = vec![];
        let mut offset = 0;
        while offset < chunk.len() {
            let op = OpCode::try_from(chunk.code[offset]).unwrap();
            let mut next = offset + 1 + op.operand_len();
            if op == OpCode::Closure {
                let Value::Function(f) = chunk.literals[chunk.code[offset + 1] as usize] else {
                    panic!("closure of a non-function literal");
                };
                next = offset + 2 + 2 * heap.function(f).upvalue_count;
            }
            res.push(op);
            offset = next;
        }
        res
    }

    fn nested_function(heap: &Heap, function: ObjRef, name: &str) -> ObjRef {
        heap.function(function)
            .chunk
            .literals
            .iter()
            .find_map(|v| match v {
                Value::Function(f) if heap.function(*f).name(heap) == name => Some(*f),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn global_declaration() {
        let mut heap = Heap::default();
        let script = compile_ok(&mut heap, "var a = 1 + 2;");
        use OpCode::*;
        assert_eq!(
            ops(&heap, script),
            vec![Literal, Literal, Add, DefineGlobalVar, Nil, Return]
        );
    }

    #[test]
    fn block_locals_are_popped() {
        let mut heap = Heap::default();
        let script = compile_ok(&mut heap, "{ var a = 1; var b = 2; print(a); }");
        use OpCode::*;
        assert_eq!(
            ops(&heap, script),
            vec![Literal, Literal, GetLocal, Print, Pop, PopN, Nil, Return]
        );
    }

    #[test]
    fn captured_locals_are_closed() {
        let mut heap = Heap::default();
        let src = "fn outer() { var x = 1; fn inner() { return x; } return inner; }";
        let script = compile_ok(&mut heap, src);
        let outer = nested_function(&heap, script, "outer");
        let inner = nested_function(&heap, outer, "inner");
        assert_eq!(heap.function(inner).upvalue_count, 1);
        let code = &heap.function(outer).chunk.code;
        let at = code
            .iter()
            .position(|b| *b == u8::from(OpCode::Closure))
            .unwrap();
        // is_local, slot of x
        assert_eq!(&code[at + 2..at + 4], &[1, 1]);

        let script = compile_ok(&mut heap, "{ var x = 1; fn f() { return x; } }");
        use OpCode::*;
        assert_eq!(
            ops(&heap, script),
            vec![Literal, Closure, Pop, CloseUpvalue, Nil, Return]
        );
    }

    #[test]
    fn upvalues_chain_through_functions() {
        let mut heap = Heap::default();
        let src = "fn a() { var x = 1; fn b() { fn c() { return x; } return c; } return b; }";
        let script = compile_ok(&mut heap, src);
        let a = nested_function(&heap, script, "a");
        let b = nested_function(&heap, a, "b");
        let c = nested_function(&heap, b, "c");
        assert_eq!(heap.function(b).upvalue_count, 1);
        assert_eq!(heap.function(c).upvalue_count, 1);
        let code = &heap.function(b).chunk.code;
        let at = code
            .iter()
            .position(|b| *b == u8::from(OpCode::Closure))
            .unwrap();
        // c captures b's upvalue 0
        assert_eq!(&code[at + 2..at + 4], &[0, 0]);
    }

    #[test]
    fn recursion_uses_slot_zero() {
        let mut heap = Heap::default();
        let script = compile_ok(&mut heap, "fn f(n) { return f(n); }");
        let f = nested_function(&heap, script, "f");
        assert_eq!(heap.function(f).arity, 1);
        let get_local = u8::from(OpCode::GetLocal);
        assert_eq!(
            &heap.function(f).chunk.code[..4],
            &[get_local, 0, get_local, 1]
        );
    }

    #[test]
    fn identical_literals_share_an_entry() {
        let mut heap = Heap::default();
        let script = compile_ok(&mut heap, "print(\"a\" + \"a\" + 1 + 1);");
        assert_eq!(heap.function(script).chunk.literals.len(), 2);
    }

    #[test]
    fn for_expression_keeps_its_list() {
        let mut heap = Heap::default();
        // a temporary, a pending local and nested loops around the accumulator
        let src = "fn f() { var out = 1 + len(for i in 0:3 { for j in :=i { j } }); var x = for k in 3 { k; }; return x; }";
        compile_ok(&mut heap, src);
    }

    #[test]
    fn loop_body_local_shadows_pending_local() {
        let mut heap = Heap::default();
        compile_ok(
            &mut heap,
            "{ var a = for i in 0:2 { var a = i * 10; a }; print(a); }",
        );
        assert_eq!(
            compile_err("{ var a = for i in 0:2 { var b = a; b }; }"),
            vec!["[line 1] Error at 'a': Can't read local variable in its own initializer"]
        );
    }

    #[test]
    fn missing_semicolon() {
        assert_eq!(
            compile_err("var a = 1"),
            vec!["[line 1] Error at end: Expect ';' after variable declaration"]
        );
    }

    #[test]
    fn own_initializer() {
        assert_eq!(
            compile_err("{ var a = 1;\n { var a = a; } }"),
            vec!["[line 2] Error at 'a': Can't read local variable in its own initializer"]
        );
        assert_eq!(
            compile_err("{ var a = for i in 1 { a }; }"),
            vec!["[line 1] Error at 'a': Can't read local variable in its own initializer"]
        );
    }

    #[test]
    fn semantic_errors() {
        assert_eq!(
            compile_err("return 1;"),
            vec!["[line 1] Error at 'return': Can't return from top-level code"]
        );
        assert_eq!(
            compile_err("const c;"),
            vec!["[line 1] Error at 'c': Constant must be initialized"]
        );
        assert_eq!(
            compile_err("{ const c = 1; c = 2; }"),
            vec!["[line 1] Error at '=': Cannot assign to constant"]
        );
        assert_eq!(
            compile_err("{ var a; var a; }"),
            vec!["[line 1] Error at 'a': Already a variable with this name in this scope"]
        );
        assert_eq!(
            compile_err("1 + 2 = 3;"),
            vec!["[line 1] Error at '=': Invalid assignment target"]
        );
    }

    #[test]
    fn lexical_errors_have_no_location() {
        // the parse error that follows is suppressed
        assert_eq!(
            compile_err("var s = \"open;"),
            vec!["[line 1] Error: Unterminated string"]
        );
    }

    #[test]
    fn panic_mode_resynchronizes() {
        // one error per statement, not per token
        let errs = compile_err("var = 1 2 3;\nprint(1 +);\nvar ok = 1;");
        assert_eq!(errs.len(), 2);
        assert!(errs[0].starts_with("[line 1]"));
        assert!(errs[1].starts_with("[line 2]"));
    }

    #[test]
    fn too_many_literals() {
        let body = (0..256).map(|i| format!("{i};")).collect::<String>();
        let errs = compile_err(&format!("fn f() {{ {body} }}"));
        assert_eq!(
            errs,
            vec!["[line 1] Error at '255': Too many literals in one function"]
        );
    }

    #[test]
    fn too_many_lines_is_fatal() {
        let src = format!("var = ;\n{}print(1);\nvar = ;", "\n".repeat(MAX_LINES));
        let errs = compile_err(&src);
        assert_eq!(errs.len(), 2);
        assert_eq!(errs[1], format!("[line {MAX_LINES}] Error: Too many lines"));
    }

    #[test]
    fn compiles_under_gc_stress() {
        let mut heap = Heap::new(GcConfig {
            stress: true,
            ..Default::default()
        });
        let src = "fn f(a) { var s = \"x\" + a; fn g() { return s + \"y\"; } return g; }\nvar t = \"z\";";
        let script = compile_ok(&mut heap, src);
        assert!(heap.stats().collections > 0);
        let f = nested_function(&heap, script, "f");
        let g = nested_function(&heap, f, "g");
        assert!(heap.function(g).chunk.literals.iter().all(|v| match v {
            Value::String(s) => heap.contains(*s),
            _ => true,
        }));
    }
}
