pub mod bytecodegen;
pub mod parser;
pub mod resolver;

use std::fmt;

use crate::runtime::vm::{GlobalTable, Heap, ObjRef};
use crate::utils::{error::ReportableError, metadata::Location};
use resolver::ResolveError;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    Lexical(String),
    /// What the parser was looking for, e.g. "';' after expression".
    Expected(&'static str),
    InvalidAssignmentTarget,
    ReadInOwnInitializer,
    AlreadyDeclared,
    TooManyLocals,
    TooManyUpvalues,
    TooManyLiterals,
    TooManyArguments,
    TooManyParameters,
    TooManyListElements,
    JumpTooLarge,
    LoopTooLarge,
    AssignToConstant,
    ConstWithoutInitializer,
    ReturnAtTopLevel,
    TooManyLines,
    CodeTooLarge,
}

impl ErrorKind {
    /// Fatal errors end compilation instead of resynchronizing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::TooManyLines | ErrorKind::CodeTooLarge)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Lexical(msg) => write!(f, "{msg}"),
            ErrorKind::Expected(what) => write!(f, "Expect {what}"),
            ErrorKind::InvalidAssignmentTarget => write!(f, "Invalid assignment target"),
            ErrorKind::ReadInOwnInitializer => {
                write!(f, "Can't read local variable in its own initializer")
            }
            ErrorKind::AlreadyDeclared => {
                write!(f, "Already a variable with this name in this scope")
            }
            ErrorKind::TooManyLocals => write!(f, "Too many local variables in function"),
            ErrorKind::TooManyUpvalues => write!(f, "Too many closure variables in function"),
            ErrorKind::TooManyLiterals => write!(f, "Too many literals in one function"),
            ErrorKind::TooManyArguments => write!(f, "Can't have more than 255 arguments"),
            ErrorKind::TooManyParameters => write!(f, "Can't have more than 255 parameters"),
            ErrorKind::TooManyListElements => {
                write!(f, "Can't have more than 255 elements in a list literal")
            }
            ErrorKind::JumpTooLarge => write!(f, "Too much code to jump over"),
            ErrorKind::LoopTooLarge => write!(f, "Loop body too large"),
            ErrorKind::AssignToConstant => write!(f, "Cannot assign to constant"),
            ErrorKind::ConstWithoutInitializer => write!(f, "Constant must be initialized"),
            ErrorKind::ReturnAtTopLevel => write!(f, "Can't return from top-level code"),
            ErrorKind::TooManyLines => write!(f, "Too many lines"),
            ErrorKind::CodeTooLarge => write!(f, "Too much code in one function"),
        }
    }
}

impl From<ResolveError> for ErrorKind {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::ReadInOwnInitializer => ErrorKind::ReadInOwnInitializer,
            ResolveError::AlreadyDeclared => ErrorKind::AlreadyDeclared,
            ResolveError::TooManyLocals => ErrorKind::TooManyLocals,
            ResolveError::TooManyUpvalues => ErrorKind::TooManyUpvalues,
        }
    }
}

/// The token an error is attributed to.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorAt {
    End,
    Lexeme(String),
    Nowhere,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub location: Location,
    pub line: u16,
    pub at: ErrorAt,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.at {
            ErrorAt::End => write!(f, " at end")?,
            ErrorAt::Lexeme(text) => write!(f, " at '{text}'")?,
            ErrorAt::Nowhere => {}
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for Error {}

impl ReportableError for Error {
    fn get_labels(&self) -> Vec<(Location, String)> {
        vec![(self.location.clone(), self.kind.to_string())]
    }
}

/// Compiles a whole source text into a top-level function living in `heap`.
///
/// `globals` is only read, to keep the values of earlier runs alive should the
/// compiler trigger a collection.
pub fn compile(
    src: &str,
    heap: &mut Heap,
    globals: &GlobalTable,
) -> Result<ObjRef, Vec<Box<dyn ReportableError>>> {
    bytecodegen::gen_bytecode(src, heap, globals)
}
