/// One byte opcode followed by its operands. u16 operands are little-endian.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // literal pool index
    Literal,
    Nil,
    True,
    False,
    TypeBool,
    TypeFloat,
    TypeString,
    TypeList,
    TypeFunction,
    TypeTypeId,
    Pop,
    // count
    PopN,
    // literal index of the name
    DefineGlobalVar,
    DefineGlobalConst,
    GetGlobal,
    SetGlobal,
    // slot relative to the frame base
    GetLocal,
    SetLocal,
    // index into the running closure's upvalues
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Not,
    Print,
    Echo,
    Type,
    // element count
    MakeList,
    IndexGet,
    IndexSet,
    // slot of the accumulator list
    AppendLocal,
    // slot of the loop variable, inclusive flag
    CompareIterator,
    // u16 forward offset
    Jump,
    // u16 backward offset
    Loop,
    JumpIfTrue,
    JumpIfFalse,
    JumpIfTruePop,
    JumpIfFalsePop,
    JumpIfZero,
    // argument count
    Call,
    // literal index of the function, then (is_local, index) per upvalue
    Closure,
    Return,
}

const OPCODES: [OpCode; 51] = [
    OpCode::Literal,
    OpCode::Nil,
    OpCode::True,
    OpCode::False,
    OpCode::TypeBool,
    OpCode::TypeFloat,
    OpCode::TypeString,
    OpCode::TypeList,
    OpCode::TypeFunction,
    OpCode::TypeTypeId,
    OpCode::Pop,
    OpCode::PopN,
    OpCode::DefineGlobalVar,
    OpCode::DefineGlobalConst,
    OpCode::GetGlobal,
    OpCode::SetGlobal,
    OpCode::GetLocal,
    OpCode::SetLocal,
    OpCode::GetUpvalue,
    OpCode::SetUpvalue,
    OpCode::CloseUpvalue,
    OpCode::Equal,
    OpCode::NotEqual,
    OpCode::Greater,
    OpCode::GreaterEqual,
    OpCode::Less,
    OpCode::LessEqual,
    OpCode::Add,
    OpCode::Subtract,
    OpCode::Multiply,
    OpCode::Divide,
    OpCode::Negate,
    OpCode::Not,
    OpCode::Print,
    OpCode::Echo,
    OpCode::Type,
    OpCode::MakeList,
    OpCode::IndexGet,
    OpCode::IndexSet,
    OpCode::AppendLocal,
    OpCode::CompareIterator,
    OpCode::Jump,
    OpCode::Loop,
    OpCode::JumpIfTrue,
    OpCode::JumpIfFalse,
    OpCode::JumpIfTruePop,
    OpCode::JumpIfFalsePop,
    OpCode::JumpIfZero,
    OpCode::Call,
    OpCode::Closure,
    OpCode::Return,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpCode(pub u8);

impl std::fmt::Display for InvalidOpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid opcode {}", self.0)
    }
}
impl std::error::Error for InvalidOpCode {}

impl TryFrom<u8> for OpCode {
    type Error = InvalidOpCode;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        OPCODES
            .get(value as usize)
            .copied()
            .ok_or(InvalidOpCode(value))
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl OpCode {
    /// Number of operand bytes following the opcode. `Closure` is followed by
    /// two more bytes per captured upvalue on top of this.
    pub fn operand_len(self) -> usize {
        match self {
            OpCode::Literal
            | OpCode::PopN
            | OpCode::DefineGlobalVar
            | OpCode::DefineGlobalConst
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::MakeList
            | OpCode::AppendLocal
            | OpCode::Call
            | OpCode::Closure => 1,
            OpCode::CompareIterator
            | OpCode::Jump
            | OpCode::Loop
            | OpCode::JumpIfTrue
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTruePop
            | OpCode::JumpIfFalsePop
            | OpCode::JumpIfZero => 2,
            _ => 0,
        }
    }

    /// Net change of the operand stack height caused by executing this opcode.
    /// `arg` is the first operand byte for the opcodes whose effect depends on it.
    pub fn stack_effect(self, arg: u8) -> i32 {
        let arg = arg as i32;
        match self {
            OpCode::Literal
            | OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::TypeBool
            | OpCode::TypeFloat
            | OpCode::TypeString
            | OpCode::TypeList
            | OpCode::TypeFunction
            | OpCode::TypeTypeId
            | OpCode::GetGlobal
            | OpCode::GetLocal
            | OpCode::GetUpvalue
            | OpCode::CompareIterator
            | OpCode::Closure => 1,
            OpCode::SetGlobal
            | OpCode::SetLocal
            | OpCode::SetUpvalue
            | OpCode::Negate
            | OpCode::Not
            | OpCode::Print
            | OpCode::Echo
            | OpCode::Type
            | OpCode::Jump
            | OpCode::Loop
            | OpCode::JumpIfTrue
            | OpCode::JumpIfFalse => 0,
            OpCode::Pop
            | OpCode::DefineGlobalVar
            | OpCode::DefineGlobalConst
            | OpCode::CloseUpvalue
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::Greater
            | OpCode::GreaterEqual
            | OpCode::Less
            | OpCode::LessEqual
            | OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::IndexGet
            | OpCode::AppendLocal
            | OpCode::JumpIfTruePop
            | OpCode::JumpIfFalsePop
            | OpCode::JumpIfZero
            | OpCode::Return => -1,
            OpCode::IndexSet => -2,
            OpCode::PopN | OpCode::Call => -arg,
            OpCode::MakeList => 1 - arg,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Literal => "LITERAL",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::TypeBool => "TYPE_BOOL",
            OpCode::TypeFloat => "TYPE_FLOAT",
            OpCode::TypeString => "TYPE_STRING",
            OpCode::TypeList => "TYPE_LIST",
            OpCode::TypeFunction => "TYPE_FUNCTION",
            OpCode::TypeTypeId => "TYPE_TYPEID",
            OpCode::Pop => "POP",
            OpCode::PopN => "POP_N",
            OpCode::DefineGlobalVar => "DEFINE_GLOBAL_VAR",
            OpCode::DefineGlobalConst => "DEFINE_GLOBAL_CONST",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOT_EQUAL",
            OpCode::Greater => "GREATER",
            OpCode::GreaterEqual => "GREATER_EQUAL",
            OpCode::Less => "LESS",
            OpCode::LessEqual => "LESS_EQUAL",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUBTRACT",
            OpCode::Multiply => "MULTIPLY",
            OpCode::Divide => "DIVIDE",
            OpCode::Negate => "NEGATE",
            OpCode::Not => "NOT",
            OpCode::Print => "PRINT",
            OpCode::Echo => "ECHO",
            OpCode::Type => "TYPE",
            OpCode::MakeList => "MAKE_LIST",
            OpCode::IndexGet => "INDEX_GET",
            OpCode::IndexSet => "INDEX_SET",
            OpCode::AppendLocal => "APPEND_LOCAL",
            OpCode::CompareIterator => "COMPARE_ITERATOR",
            OpCode::Jump => "JUMP",
            OpCode::Loop => "LOOP",
            OpCode::JumpIfTrue => "JUMP_IF_TRUE",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::JumpIfTruePop => "JUMP_IF_TRUE_POP",
            OpCode::JumpIfFalsePop => "JUMP_IF_FALSE_POP",
            OpCode::JumpIfZero => "JUMP_IF_ZERO",
            OpCode::Call => "CALL",
            OpCode::Closure => "CLOSURE",
            OpCode::Return => "RETURN",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<20}", self.mnemonic())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn byte_roundtrip_covers_every_opcode() {
        for (i, op) in OPCODES.iter().enumerate() {
            assert_eq!(*op as u8, i as u8);
            assert_eq!(OpCode::try_from(i as u8), Ok(*op));
        }
        assert_eq!(OpCode::try_from(OPCODES.len() as u8), Err(InvalidOpCode(51)));
    }

    #[test]
    fn stack_effects() {
        assert_eq!(OpCode::Literal.stack_effect(0), 1);
        assert_eq!(OpCode::Add.stack_effect(0), -1);
        assert_eq!(OpCode::Call.stack_effect(3), -3);
        assert_eq!(OpCode::MakeList.stack_effect(4), -3);
        assert_eq!(OpCode::MakeList.stack_effect(0), 1);
        assert_eq!(OpCode::PopN.stack_effect(2), -2);
        assert_eq!(OpCode::IndexSet.stack_effect(0), -2);
    }
}
