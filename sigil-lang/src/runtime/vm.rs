use std::collections::HashMap;
use std::io::Write;

pub mod bytecode;
pub mod garbagecollector;
pub mod program;
pub mod value;
pub use bytecode::*;
pub use garbagecollector::{GcConfig, GcStats, Heap, Marker, ObjRef, RootSource};
pub use program::{Chunk, Disassembly, FuncProto};
pub use value::{Closure, List, Object, TypeId, UpvalueState, Value};

use super::{Error, ErrorKind, InterpretError, TraceFrame};
use crate::compiler;
use crate::utils::error::ReportableError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub max_frames: usize,
    pub gc: GcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frames: 256,
            gc: GcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Global {
    pub value: Value,
    pub is_const: bool,
}

/// Keyed by the interned name string.
pub type GlobalTable = HashMap<ObjRef, Global>;

pub(crate) fn mark_globals(globals: &GlobalTable, marker: &mut Marker<'_>) {
    for (name, global) in globals.iter() {
        marker.mark_object(*name);
        marker.mark_value(global.value);
    }
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    // cached from the closure
    function: ObjRef,
    ip: usize,
    // stack index of the callee, locals follow it
    slots: usize,
}

struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a GlobalTable,
    open_upvalues: &'a [ObjRef],
}

impl RootSource for VmRoots<'_> {
    fn mark_roots(&self, marker: &mut Marker<'_>) {
        self.stack.iter().for_each(|v| marker.mark_value(*v));
        for frame in self.frames.iter() {
            marker.mark_object(frame.closure);
        }
        mark_globals(self.globals, marker);
        self.open_upvalues
            .iter()
            .for_each(|r| marker.mark_object(*r));
    }
}

// Borrows every field but the heap, so it can be passed to `self.heap.alloc`.
macro_rules! vm_roots {
    ($self:ident) => {
        &VmRoots {
            stack: &$self.stack,
            frames: &$self.frames,
            globals: &$self.globals,
            open_upvalues: &$self.open_upvalues,
        }
    };
}

macro_rules! binary_number_op {
    ($self:ident, $wrap:path, $op:tt) => {{
        match ($self.peek(1), $self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                $self.pop();
                $self.pop();
                $self.push($wrap(a $op b));
            }
            _ => return Err(ErrorKind::OperandsMustBeNumbers),
        }
    }};
}

/// Indices are integral and limited to the `i32` range.
fn as_index(value: Value) -> Result<i64, ErrorKind> {
    match value {
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => {
            if (i32::MIN as f64..=i32::MAX as f64).contains(&n) {
                Ok(n as i64)
            } else {
                Err(ErrorKind::IndexOutOfBounds)
            }
        }
        _ => Err(ErrorKind::IndexNotInteger),
    }
}

pub struct Machine {
    heap: Heap,
    globals: GlobalTable,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    // sorted by descending stack slot
    open_upvalues: Vec<ObjRef>,
    config: Config,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Machine {
    pub fn new(config: Config) -> Self {
        Self {
            heap: Heap::new(config.gc),
            globals: GlobalTable::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(config.max_frames),
            open_upvalues: vec![],
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn heap(&self) -> &Heap {
        &self.heap
    }
    pub fn globals(&self) -> &GlobalTable {
        &self.globals
    }
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Value of a global variable, looked up by name.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals
            .iter()
            .find_map(|(k, g)| (self.heap.string(*k).as_str() == name).then_some(g.value))
    }

    pub fn collect_garbage(&mut self) {
        self.heap.collect(vm_roots!(self));
    }

    pub fn compile(&mut self, src: &str) -> Result<ObjRef, Vec<Box<dyn ReportableError>>> {
        compiler::compile(src, &mut self.heap, &self.globals)
    }

    pub fn emit_bytecode(&mut self, src: &str) -> Result<String, Vec<Box<dyn ReportableError>>> {
        let function = self.compile(src)?;
        let dis = Disassembly {
            function: self.heap.function(function),
            heap: &self.heap,
            nested: true,
        };
        Ok(dis.to_string())
    }

    pub fn interpret(&mut self, src: &str, out: &mut impl Write) -> Result<(), InterpretError> {
        let function = self.compile(src)?;
        self.run_function(function, out)?;
        Ok(())
    }

    /// Wraps a compiled top-level function in a closure and runs it to completion.
    pub fn run_function(&mut self, function: ObjRef, out: &mut impl Write) -> Result<(), Error> {
        debug_assert!(self.stack.is_empty() && self.frames.is_empty());
        // keep the function rooted while its closure is allocated
        self.push(Value::Function(function));
        let closure = self.heap.alloc(
            Object::Closure(Closure {
                function,
                upvalues: vec![],
            }),
            vm_roots!(self),
        );
        self.pop();
        self.push(Value::Closure(closure));
        let res = self
            .call_value(Value::Closure(closure), 0)
            .and_then(|()| self.run(out));
        res.map_err(|kind| self.runtime_error(kind))
    }

    fn runtime_error(&mut self, kind: ErrorKind) -> Error {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.heap.function(frame.function);
                TraceFrame {
                    function: function.name(&self.heap).to_string(),
                    line: function.chunk.get_line_number(frame.ip.saturating_sub(1)),
                }
            })
            .collect();
        log::debug!("runtime error: {kind}, resetting the machine");
        self.reset();
        Error { kind, trace }
    }

    fn reset(&mut self) {
        // closures that escaped before the error must keep their captured values
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value)
    }
    fn pop(&mut self) -> Value {
        self.stack
            .pop()
            .unwrap_or_else(|| unreachable!("operand stack underflow"))
    }
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames
            .last()
            .unwrap_or_else(|| unreachable!("no active call frame"))
    }
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .unwrap_or_else(|| unreachable!("no active call frame"))
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self
            .frames
            .last_mut()
            .unwrap_or_else(|| unreachable!("no active call frame"));
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }
    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        u16::from_le_bytes([lo, hi])
    }
    fn read_literal(&mut self) -> Value {
        let i = self.read_byte() as usize;
        self.heap.function(self.frame().function).chunk.literals[i]
    }
    fn read_name(&mut self) -> ObjRef {
        match self.read_literal() {
            Value::String(r) => r,
            other => unreachable!("global name literal is {other:?}"),
        }
    }
    fn name_of(&self, r: ObjRef) -> String {
        self.heap.string(r).as_str().to_string()
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), ErrorKind> {
        let Value::Closure(closure) = callee else {
            return Err(ErrorKind::NotCallable);
        };
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            return Err(ErrorKind::ArityMismatch {
                expected: arity,
                got: argc,
            });
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(ErrorKind::StackOverflow);
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - argc as usize - 1,
        });
        Ok(())
    }

    /// Reuses the open upvalue aliasing `slot` if there is one.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, r) in self.open_upvalues.iter().enumerate() {
            let UpvalueState::Open(open_slot) = self.heap.upvalue(*r) else {
                unreachable!("closed upvalue in the open list");
            };
            if open_slot == slot {
                return *r;
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }
        let r = self
            .heap
            .alloc(Object::Upvalue(UpvalueState::Open(slot)), vm_roots!(self));
        self.open_upvalues.insert(insert_at, r);
        r
    }

    /// Closes every open upvalue aliasing `from` or a slot above it.
    fn close_upvalues(&mut self, from: usize) {
        let mut count = 0;
        for r in self.open_upvalues.iter() {
            let upvalue = self.heap.upvalue_mut(*r);
            match *upvalue {
                UpvalueState::Open(slot) if slot >= from => {
                    *upvalue = UpvalueState::Closed(self.stack[slot]);
                    count += 1;
                }
                _ => break,
            }
        }
        self.open_upvalues.drain(..count);
    }

    fn read_upvalue(&self, index: u8) -> ObjRef {
        self.heap.closure(self.frame().closure).upvalues[index as usize]
    }

    fn trace_instruction(&self) {
        let frame = self.frame();
        let stack = self
            .stack
            .iter()
            .map(|v| format!("[ {} ]", self.heap.display(*v, true)))
            .collect::<String>();
        let mut line = String::new();
        let chunk = &self.heap.function(frame.function).chunk;
        if chunk
            .disassemble_instruction(frame.ip, &self.heap, &mut line)
            .is_ok()
        {
            log::trace!("          {stack}\n{}", line.trim_end());
        }
    }

    fn run(&mut self, out: &mut impl Write) -> Result<(), ErrorKind> {
        loop {
            if log::log_enabled!(log::Level::Trace) {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = OpCode::try_from(byte).unwrap_or_else(|e| unreachable!("{e}"));
            match op {
                OpCode::Literal => {
                    let v = self.read_literal();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::TypeBool => self.push(Value::TypeId(TypeId::Bool)),
                OpCode::TypeFloat => self.push(Value::TypeId(TypeId::Float)),
                OpCode::TypeString => self.push(Value::TypeId(TypeId::String)),
                OpCode::TypeList => self.push(Value::TypeId(TypeId::List)),
                OpCode::TypeFunction => self.push(Value::TypeId(TypeId::Function)),
                OpCode::TypeTypeId => self.push(Value::TypeId(TypeId::TypeId)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let n = self.read_byte() as usize;
                    self.stack.truncate(self.stack.len() - n);
                }
                OpCode::DefineGlobalVar | OpCode::DefineGlobalConst => {
                    let name = self.read_name();
                    if self.globals.contains_key(&name) {
                        return Err(ErrorKind::GlobalRedefinition(self.name_of(name)));
                    }
                    let global = Global {
                        value: self.peek(0),
                        is_const: op == OpCode::DefineGlobalConst,
                    };
                    self.globals.insert(name, global);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let name = self.read_name();
                    match self.globals.get(&name).map(|g| g.value) {
                        Some(v) => self.push(v),
                        None => return Err(ErrorKind::UndefinedVariable(self.name_of(name))),
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_name();
                    let value = self.peek(0);
                    match self.globals.get(&name).map(|g| g.is_const) {
                        Some(true) => return Err(ErrorKind::AssignToConstant(self.name_of(name))),
                        Some(false) => {
                            self.globals.insert(name, Global { value, is_const: false });
                        }
                        None => return Err(ErrorKind::UndefinedVariable(self.name_of(name))),
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.frame().slots + self.read_byte() as usize;
                    self.push(self.stack[slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.frame().slots + self.read_byte() as usize;
                    self.stack[slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte();
                    let v = match self.heap.upvalue(self.read_upvalue(index)) {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(v) => v,
                    };
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte();
                    let value = self.peek(0);
                    let r = self.read_upvalue(index);
                    match self.heap.upvalue_mut(r) {
                        UpvalueState::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        UpvalueState::Closed(v) => *v = value,
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Greater => binary_number_op!(self, Value::Bool, >),
                OpCode::GreaterEqual => binary_number_op!(self, Value::Bool, >=),
                OpCode::Less => binary_number_op!(self, Value::Bool, <),
                OpCode::LessEqual => binary_number_op!(self, Value::Bool, <=),
                OpCode::Add => self.add()?,
                OpCode::Subtract => binary_number_op!(self, Value::Number, -),
                OpCode::Multiply => binary_number_op!(self, Value::Number, *),
                OpCode::Divide => binary_number_op!(self, Value::Number, /),
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(ErrorKind::OperandMustBeNumber),
                },
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Print | OpCode::Echo => {
                    let v = self.peek(0);
                    let verbose = op == OpCode::Echo;
                    writeln!(out, "{}", self.heap.display(v, verbose))
                        .map_err(|e| ErrorKind::Output(e.to_string()))?;
                    self.pop();
                    self.push(Value::Nil);
                }
                OpCode::Type => {
                    let v = self.pop();
                    self.push(v.type_id().map_or(Value::Nil, Value::TypeId));
                }
                OpCode::MakeList => {
                    let n = self.read_byte() as usize;
                    let values = self.stack.split_off(self.stack.len() - n);
                    let list = self
                        .heap
                        .alloc(Object::List(List::new(values)), vm_roots!(self));
                    self.push(Value::List(list));
                }
                OpCode::IndexGet => self.index_get()?,
                OpCode::IndexSet => self.index_set()?,
                OpCode::AppendLocal => {
                    let slot = self.frame().slots + self.read_byte() as usize;
                    let value = self.pop();
                    match self.stack[slot] {
                        Value::List(list) => self.heap.list_mut(list).append(value),
                        other => unreachable!("accumulator is {other:?}"),
                    }
                }
                OpCode::CompareIterator => {
                    let slot = self.frame().slots + self.read_byte() as usize;
                    let inclusive = self.read_byte() != 0;
                    let dir = self.compare_iterator(slot, inclusive)?;
                    self.push(Value::Number(dir));
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::JumpIfTrue | OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() == (op == OpCode::JumpIfFalse) {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfTruePop | OpCode::JumpIfFalsePop => {
                    let offset = self.read_u16() as usize;
                    if self.pop().is_falsey() == (op == OpCode::JumpIfFalsePop) {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfZero => {
                    let offset = self.read_u16() as usize;
                    if self.pop() == Value::Number(0.0) {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    self.call_value(self.peek(argc as usize), argc)?;
                }
                OpCode::Closure => self.make_closure(),
                OpCode::Return => {
                    let result = self.pop();
                    let slots = self.frame().slots;
                    self.close_upvalues(slots);
                    self.frames.pop();
                    self.stack.truncate(slots);
                    if self.frames.is_empty() {
                        debug_assert!(self.stack.is_empty(), "stack not empty after script");
                        return Ok(());
                    }
                    self.push(result);
                }
            }
        }
    }

    fn add(&mut self) -> Result<(), ErrorKind> {
        let (a, b) = (self.peek(1), self.peek(0));
        let result = match (a, b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
            (Value::String(_), _) | (_, Value::String(_)) => {
                let text = format!(
                    "{}{}",
                    self.heap.display(a, false),
                    self.heap.display(b, false)
                );
                Value::String(self.heap.intern(&text, vm_roots!(self)))
            }
            (Value::List(x), Value::List(y)) => {
                let list = self.heap.list(x).concat(self.heap.list(y));
                Value::List(self.heap.alloc(Object::List(list), vm_roots!(self)))
            }
            _ => return Err(ErrorKind::InvalidAddOperands),
        };
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn index_get(&mut self) -> Result<(), ErrorKind> {
        let (target, index) = (self.peek(1), self.peek(0));
        let result = match target {
            Value::List(list) => {
                let i = as_index(index)?;
                self.heap
                    .list(list)
                    .get(i)
                    .ok_or(ErrorKind::IndexOutOfBounds)?
            }
            Value::String(s) => {
                let i = as_index(index)?;
                let c = self
                    .heap
                    .string(s)
                    .char_at(i)
                    .ok_or(ErrorKind::IndexOutOfBounds)?;
                let mut buf = [0u8; 4];
                Value::String(self.heap.intern(c.encode_utf8(&mut buf), vm_roots!(self)))
            }
            _ => return Err(ErrorKind::NotIndexable),
        };
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn index_set(&mut self) -> Result<(), ErrorKind> {
        let (target, index, value) = (self.peek(2), self.peek(1), self.peek(0));
        match target {
            Value::List(list) => {
                let i = as_index(index)?;
                self.heap
                    .list_mut(list)
                    .set(i, value)
                    .map_err(|_| ErrorKind::IndexOutOfBounds)?;
            }
            Value::String(_) => return Err(ErrorKind::StringImmutable),
            _ => return Err(ErrorKind::NotIndexable),
        }
        self.stack.truncate(self.stack.len() - 3);
        self.push(value);
        Ok(())
    }

    /// `slot` holds the loop variable, followed by the hidden `end` and `dir`
    /// locals. `dir` is fixed on first use; returns it while the variable is in
    /// range and `0` once it is not.
    fn compare_iterator(&mut self, slot: usize, inclusive: bool) -> Result<f64, ErrorKind> {
        let (Value::Number(x), Value::Number(end), Value::Number(mut dir)) =
            (self.stack[slot], self.stack[slot + 1], self.stack[slot + 2])
        else {
            return Err(ErrorKind::RangeBoundsNotNumbers);
        };
        if dir == 0.0 {
            dir = if x < end {
                1.0
            } else if x > end {
                -1.0
            } else if inclusive {
                1.0
            } else {
                0.0
            };
            self.stack[slot + 2] = Value::Number(dir);
        }
        let in_range = match (dir > 0.0, inclusive) {
            _ if dir == 0.0 => false,
            (true, false) => x < end,
            (true, true) => x <= end,
            (false, false) => x > end,
            (false, true) => x >= end,
        };
        Ok(if in_range { dir } else { 0.0 })
    }

    fn make_closure(&mut self) {
        let function = match self.read_literal() {
            Value::Function(f) => f,
            other => unreachable!("closure literal is {other:?}"),
        };
        let count = self.heap.function(function).upvalue_count;
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte();
            let upvalue = if is_local {
                self.capture_upvalue(self.frame().slots + index as usize)
            } else {
                self.read_upvalue(index)
            };
            upvalues.push(upvalue);
        }
        let closure = self.heap.alloc(
            Object::Closure(Closure { function, upvalues }),
            vm_roots!(self),
        );
        self.push(Value::Closure(closure));
    }
}

#[cfg(test)]
mod test;
