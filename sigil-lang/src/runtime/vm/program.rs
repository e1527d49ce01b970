use std::fmt::{self, Write};

use itertools::Itertools;

use super::garbagecollector::{Heap, ObjRef};
use super::value::{Object, Value};
use super::OpCode;

pub const MAX_CODE_LEN: usize = 65535;
pub const MAX_LITERALS: usize = 255;

/// `count` consecutive bytes were emitted for source line `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRun {
    pub line: u16,
    pub count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFull;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Chunk {
    pub code: Vec<u8>,
    lines: Vec<LineRun>,
    pub literals: Vec<Value>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.code.len()
    }
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn write(&mut self, byte: u8, line: u16) -> Result<(), ChunkFull> {
        if self.code.len() >= MAX_CODE_LEN {
            return Err(ChunkFull);
        }
        self.code.push(byte);
        match self.lines.last_mut() {
            Some(run) if run.line == line && run.count < u8::MAX => run.count += 1,
            _ => self.lines.push(LineRun { line, count: 1 }),
        }
        Ok(())
    }

    pub fn write_op(&mut self, op: OpCode, line: u16) -> Result<(), ChunkFull> {
        self.write(op.into(), line)
    }

    /// Returns the index of an equal literal if one exists, `None` once the pool is full.
    pub fn add_literal(&mut self, value: Value) -> Option<u8> {
        if let Some(i) = self.literals.iter().position(|v| v.same_literal(&value)) {
            return Some(i as u8);
        }
        if self.literals.len() >= MAX_LITERALS {
            return None;
        }
        self.literals.push(value);
        Some((self.literals.len() - 1) as u8)
    }

    pub fn get_line_number(&self, offset: usize) -> u16 {
        let mut end = self.code.len();
        for run in self.lines.iter().rev() {
            let start = end - run.count as usize;
            if offset >= start {
                return run.line;
            }
            end = start;
        }
        0
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.code[offset], self.code[offset + 1]])
    }

    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.code[offset] = lo;
        self.code[offset + 1] = hi;
    }

    /// Writes one instruction and returns the offset of the next one.
    pub fn disassemble_instruction(
        &self,
        offset: usize,
        heap: &Heap,
        out: &mut impl Write,
    ) -> Result<usize, fmt::Error> {
        write!(out, "{offset:04} ")?;
        let line = self.get_line_number(offset);
        if offset > 0 && line == self.get_line_number(offset - 1) {
            write!(out, "   | ")?;
        } else {
            write!(out, "{line:>4} ")?;
        }
        let op = match OpCode::try_from(self.code[offset]) {
            Ok(op) => op,
            Err(e) => {
                writeln!(out, "{e}")?;
                return Ok(offset + 1);
            }
        };
        let next = offset + 1 + op.operand_len();
        match op {
            OpCode::Literal
            | OpCode::DefineGlobalVar
            | OpCode::DefineGlobalConst
            | OpCode::GetGlobal
            | OpCode::SetGlobal => {
                let i = self.code[offset + 1];
                let lit = self.literals[i as usize];
                writeln!(out, "{op} {i:>4} '{}'", heap.display(lit, true))?;
            }
            OpCode::PopN
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::MakeList
            | OpCode::AppendLocal
            | OpCode::Call => {
                writeln!(out, "{op} {:>4}", self.code[offset + 1])?;
            }
            OpCode::CompareIterator => {
                let slot = self.code[offset + 1];
                let kind = if self.code[offset + 2] != 0 {
                    "inclusive"
                } else {
                    "exclusive"
                };
                writeln!(out, "{op} {slot:>4} {kind}")?;
            }
            OpCode::Loop => {
                let jump = self.read_u16(offset + 1) as usize;
                writeln!(out, "{op} {offset:>4} -> {}", next - jump)?;
            }
            OpCode::Jump
            | OpCode::JumpIfTrue
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTruePop
            | OpCode::JumpIfFalsePop
            | OpCode::JumpIfZero => {
                let jump = self.read_u16(offset + 1) as usize;
                writeln!(out, "{op} {offset:>4} -> {}", next + jump)?;
            }
            OpCode::Closure => {
                let i = self.code[offset + 1];
                let lit = self.literals[i as usize];
                writeln!(out, "{op} {i:>4} {}", heap.display(lit, true))?;
                let count = match lit {
                    Value::Function(f) => heap.function(f).upvalue_count,
                    _ => 0,
                };
                let mut pos = next;
                for _ in 0..count {
                    let kind = if self.code[pos] != 0 { "local" } else { "upvalue" };
                    writeln!(out, "{pos:04}    |   {kind} {}", self.code[pos + 1])?;
                    pos += 2;
                }
                return Ok(pos);
            }
            _ => writeln!(out, "{op}")?,
        }
        Ok(next)
    }
}

/// Function body produced by the compiler. Immutable once moved into the heap.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FuncProto {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

impl FuncProto {
    pub fn new(name: Option<ObjRef>) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
    pub fn name<'a>(&self, heap: &'a Heap) -> &'a str {
        self.name.map_or("<script>", |n| heap.string(n).as_str())
    }
}

/// Disassembly of a function, followed by the functions in its literal pool
/// when `nested` is set.
pub struct Disassembly<'a> {
    pub function: &'a FuncProto,
    pub heap: &'a Heap,
    pub nested: bool,
}

impl fmt::Display for Disassembly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Disassembly {
            function,
            heap,
            nested,
        } = *self;
        writeln!(
            f,
            "== {} == arity:{} upvalues:{}",
            function.name(heap),
            function.arity,
            function.upvalue_count
        )?;
        let chunk = &function.chunk;
        if !chunk.literals.is_empty() {
            let literals = chunk.literals.iter().map(|v| heap.display(*v, true)).join(", ");
            writeln!(f, "literals: {literals}")?;
        }
        let mut offset = 0;
        while offset < chunk.len() {
            offset = chunk.disassemble_instruction(offset, heap, f)?;
        }
        if !nested {
            return Ok(());
        }
        for lit in chunk.literals.iter() {
            if let Value::Function(r) = lit {
                if let Object::Function(inner) = heap.get(*r) {
                    let inner = Disassembly {
                        function: inner,
                        heap,
                        nested,
                    };
                    write!(f, "{inner}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn line_runs_coalesce_and_decode() {
        let mut chunk = Chunk::default();
        for _ in 0..3 {
            chunk.write_op(OpCode::Nil, 1).unwrap();
        }
        chunk.write_op(OpCode::Pop, 2).unwrap();
        for _ in 0..300 {
            chunk.write_op(OpCode::Nil, 7).unwrap();
        }
        assert_eq!(chunk.lines.len(), 4);
        assert_eq!(chunk.get_line_number(0), 1);
        assert_eq!(chunk.get_line_number(2), 1);
        assert_eq!(chunk.get_line_number(3), 2);
        assert_eq!(chunk.get_line_number(4), 7);
        assert_eq!(chunk.get_line_number(303), 7);
    }

    #[test]
    fn literals_are_deduplicated() {
        let mut chunk = Chunk::default();
        assert_eq!(chunk.add_literal(Value::Number(1.0)), Some(0));
        assert_eq!(chunk.add_literal(Value::Number(2.0)), Some(1));
        assert_eq!(chunk.add_literal(Value::Number(1.0)), Some(0));
        assert_eq!(chunk.add_literal(Value::Bool(true)), Some(2));
    }

    #[test]
    fn literal_pool_is_bounded() {
        let mut chunk = Chunk::default();
        for i in 0..MAX_LITERALS {
            assert_eq!(chunk.add_literal(Value::Number(i as f64)), Some(i as u8));
        }
        assert_eq!(chunk.add_literal(Value::Number(-1.0)), None);
        // existing entries are still found
        assert_eq!(chunk.add_literal(Value::Number(3.0)), Some(3));
    }

    #[test]
    fn code_is_bounded() {
        let mut chunk = Chunk::default();
        for _ in 0..MAX_CODE_LEN {
            chunk.write(0, 1).unwrap();
        }
        assert_eq!(chunk.write(0, 1), Err(ChunkFull));
    }

    #[test]
    fn disassembly_lists_literals_and_lines() {
        let heap = Heap::default();
        let mut function = FuncProto::new(None);
        let chunk = &mut function.chunk;
        let one = chunk.add_literal(Value::Number(1.0)).unwrap();
        chunk.write_op(OpCode::Literal, 1).unwrap();
        chunk.write(one, 1).unwrap();
        chunk.write_op(OpCode::Print, 1).unwrap();
        chunk.write_op(OpCode::Return, 2).unwrap();
        let dis = Disassembly {
            function: &function,
            heap: &heap,
            nested: false,
        }
        .to_string();
        let lines = dis.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "== <script> == arity:0 upvalues:0");
        assert_eq!(lines[1], "literals: 1");
        assert!(lines[2].starts_with("0000    1 "));
        assert!(lines[3].starts_with("0002    | "));
        assert!(lines[4].starts_with("0003    2 "));
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn u16_operands_are_little_endian() {
        let mut chunk = Chunk::default();
        chunk.write_op(OpCode::Jump, 1).unwrap();
        chunk.write(0xff, 1).unwrap();
        chunk.write(0xff, 1).unwrap();
        chunk.patch_u16(1, 0x1234);
        assert_eq!(chunk.code[1], 0x34);
        assert_eq!(chunk.read_u16(1), 0x1234);
    }
}
