use crate::utils::{error::ReportableError, metadata::Location};

pub mod vm;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    OperandMustBeNumber,
    OperandsMustBeNumbers,
    InvalidAddOperands,
    NotCallable,
    ArityMismatch { expected: u8, got: u8 },
    StackOverflow,
    UndefinedVariable(String),
    GlobalRedefinition(String),
    AssignToConstant(String),
    IndexNotInteger,
    IndexOutOfBounds,
    NotIndexable,
    StringImmutable,
    RangeBoundsNotNumbers,
    Output(String),
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::OperandMustBeNumber => write!(f, "Operand must be a number"),
            ErrorKind::OperandsMustBeNumbers => write!(f, "Operands must be numbers"),
            ErrorKind::InvalidAddOperands => write!(
                f,
                "Operands must be two numbers, two lists, or include a string"
            ),
            ErrorKind::NotCallable => write!(f, "Can only call functions"),
            ErrorKind::ArityMismatch { expected, got } => {
                write!(f, "Expected {expected} arguments but got {got}")
            }
            ErrorKind::StackOverflow => write!(f, "stack overflow"),
            ErrorKind::UndefinedVariable(name) => write!(f, "Undefined variable '{name}'"),
            ErrorKind::GlobalRedefinition(name) => write!(f, "Global '{name}' is already defined"),
            ErrorKind::AssignToConstant(name) => write!(f, "Cannot assign to constant '{name}'"),
            ErrorKind::IndexNotInteger => write!(f, "Index must be an integer"),
            ErrorKind::IndexOutOfBounds => write!(f, "Index out of bounds"),
            ErrorKind::NotIndexable => write!(f, "Can only index lists and strings"),
            ErrorKind::StringImmutable => write!(f, "Strings are immutable"),
            ErrorKind::RangeBoundsNotNumbers => {
                write!(f, "For-loop range bounds must be numbers")
            }
            ErrorKind::Output(e) => write!(f, "Failed to write output: {e}"),
        }
    }
}

/// One active call at the moment of the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub line: u16,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] in {}", self.line, self.function)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    /// Innermost frame first.
    pub trace: Vec<TraceFrame>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Runtime Error: {}", self.kind)?;
        for frame in self.trace.iter() {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl ReportableError for Error {
    fn get_message(&self) -> String {
        format!("Runtime Error: {}", self.kind)
    }
    // bytecode keeps lines, not byte spans
    fn get_labels(&self) -> Vec<(Location, String)> {
        vec![]
    }
    fn get_notes(&self) -> Vec<String> {
        self.trace.iter().map(|frame| frame.to_string()).collect()
    }
}

#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<Box<dyn ReportableError>>),
    Runtime(Error),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(errs) => {
                write!(f, "{}", crate::utils::error::dump_to_string(errs))
            }
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}

impl InterpretError {
    pub fn into_reportables(self) -> Vec<Box<dyn ReportableError>> {
        match self {
            InterpretError::Compile(errs) => errs,
            InterpretError::Runtime(e) => vec![Box::new(e)],
        }
    }
}

impl From<Vec<Box<dyn ReportableError>>> for InterpretError {
    fn from(errs: Vec<Box<dyn ReportableError>>) -> Self {
        InterpretError::Compile(errs)
    }
}

impl From<Error> for InterpretError {
    fn from(e: Error) -> Self {
        InterpretError::Runtime(e)
    }
}
