use std::fmt;

use crate::interner::Symbol;
use crate::runtime::vm::TypeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Sum,     // +
    Minus,   // -
    Product, // *
    Divide,  // /
    Not,     // !

    Equal,        // ==
    NotEqual,     // !=
    LessThan,     // <
    LessEqual,    // <=
    GreaterThan,  // >
    GreaterEqual, // >=
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Ident(Symbol),
    // kept as text, parsed when emitted
    Number(String),
    Str(String),
    TypeLit(TypeId),

    Op(Op),
    Assign,

    Comma,
    Colon,
    ColonEqual,
    SemiColon,

    ParenBegin,
    ParenEnd,
    ArrayBegin,
    ArrayEnd,
    BlockBegin,
    BlockEnd,

    And,
    Or,
    Var,
    Const,
    Function, //"fn"
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Return,
    Print,
    Echo,
    TypeOf, //"type"
    True,
    False,
    Nil,

    /// A lexical problem, reported when the token is reached.
    Error(String),

    EndOfInput,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Op::Sum => write!(f, "+"),
            Op::Minus => write!(f, "-"),
            Op::Product => write!(f, "*"),
            Op::Divide => write!(f, "/"),
            Op::Not => write!(f, "!"),
            Op::Equal => write!(f, "=="),
            Op::NotEqual => write!(f, "!="),
            Op::LessThan => write!(f, "<"),
            Op::LessEqual => write!(f, "<="),
            Op::GreaterThan => write!(f, ">"),
            Op::GreaterEqual => write!(f, ">="),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Ident(x) => write!(f, "{x}"),
            Token::Number(x) => write!(f, "{x}"),
            Token::Str(x) => write!(f, "\"{x}\""),
            Token::TypeLit(t) => write!(f, "{t}"),
            Token::Op(x) => write!(f, "{x}"),
            Token::Assign => write!(f, "="),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::ColonEqual => write!(f, ":="),
            Token::SemiColon => write!(f, ";"),
            Token::ParenBegin => write!(f, "("),
            Token::ParenEnd => write!(f, ")"),
            Token::ArrayBegin => write!(f, "["),
            Token::ArrayEnd => write!(f, "]"),
            Token::BlockBegin => write!(f, "{{"),
            Token::BlockEnd => write!(f, "}}"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Var => write!(f, "var"),
            Token::Const => write!(f, "const"),
            Token::Function => write!(f, "fn"),
            Token::If => write!(f, "if"),
            Token::Elif => write!(f, "elif"),
            Token::Else => write!(f, "else"),
            Token::While => write!(f, "while"),
            Token::For => write!(f, "for"),
            Token::In => write!(f, "in"),
            Token::Return => write!(f, "return"),
            Token::Print => write!(f, "print"),
            Token::Echo => write!(f, "echo"),
            Token::TypeOf => write!(f, "type"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Nil => write!(f, "nil"),
            Token::Error(msg) => write!(f, "{msg}"),
            Token::EndOfInput => write!(f, "endofinput"),
        }
    }
}
