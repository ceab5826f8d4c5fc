use std::fmt;

use thiserror::Error;

/// The different error types that can be raised by the vireo runtime
#[derive(Error, Clone, Debug)]
#[allow(missing_docs)]
pub enum ErrorKind {
    #[error("{0}")]
    StringError(String),
    #[error("Unable to perform '{op}' with {lhs} and {rhs}")]
    InvalidBinaryOp {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("Expected {expected}, found {found}")]
    UnexpectedType {
        expected: String,
        found: &'static str,
    },
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Integer overflow in '{op}'")]
    IntegerOverflow { op: &'static str },
    #[error("Index {index} is out of range {min}..={max}")]
    IndexOutOfRange { index: i64, min: i64, max: i64 },
    #[error("Ordinal {ordinal} is outside the declared range of '{type_name}'")]
    OrdinalOutOfRange { ordinal: i64, type_name: String },
    #[error("Undefined global '{0}'")]
    UndefinedGlobal(String),
    #[error("Cannot assign to constant global '{0}'")]
    AssignToConst(String),
    #[error("Unknown procedure '{0}'")]
    UnknownProcedure(String),
    #[error("Unknown builtin '{0}'")]
    UnknownBuiltin(String),
    #[error("Unknown field '{0}'")]
    UnknownField(String),
    #[error("No method table for class '{0}'")]
    UnknownClass(String),
    #[error("Routine '{name}' expects {expected} arguments, found {found}")]
    ArityMismatch {
        name: String,
        expected: u8,
        found: u8,
    },
    #[error("Nil pointer dereference")]
    NilDereference,
    #[error("Cannot assign through an opaque pointer")]
    OpaquePointerWrite,
    #[error("Stack overflow")]
    StackOverflow,
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Call frame limit reached")]
    FrameOverflow,
    #[error("Empty call stack")]
    EmptyCallStack,
    #[error("Truncated instruction stream")]
    TruncatedInstruction,
    #[error("Invalid mutex handle {0}")]
    InvalidMutexHandle(usize),
    #[error("Mutex {0} is not held by the current thread")]
    MutexNotOwned(usize),
    #[error("Invalid thread handle {0}")]
    InvalidThreadHandle(usize),
    #[error("Thread {0} has no unconsumed result")]
    ResultAlreadyTaken(usize),
    #[error("The worker pool is shutting down")]
    PoolShutdown,
    #[error("Host slot {0} is empty")]
    EmptyHostSlot(u8),
    #[error("Chunk version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("Execution interrupted")]
    Interrupted,
}

/// An error raised by the vireo runtime
///
/// Carries a trace of the frames that were unwound after the error was
/// raised, each with the instruction offset and source line of the
/// instruction that was executing.
#[derive(Clone, Debug)]
pub struct Error {
    /// The error variant
    pub kind: ErrorKind,
    /// Frames unwound while the error propagated, innermost first
    pub trace: Vec<TraceFrame>,
}

/// An instruction offset and source line in an error trace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceFrame {
    /// The offset of the instruction that was executing
    pub ip: u32,
    /// The source line recorded for that offset
    pub line: u32,
}

impl Error {
    /// Initializes an error with the given kind
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
        }
    }

    /// Extends the trace with an instruction offset and source line
    pub fn extend_trace(&mut self, ip: u32, line: u32) {
        self.trace.push(TraceFrame { ip, line });
    }

    /// True if the error represents an interrupt rather than a fault
    pub fn is_interrupt(&self) -> bool {
        matches!(self.kind, ErrorKind::Interrupted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for TraceFrame { ip, line } in self.trace.iter() {
            write!(f, "\n--- at offset {ip} [line {line}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Self::new(ErrorKind::StringError(error))
    }
}

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Self::new(ErrorKind::StringError(error.into()))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// The Result type used by the vireo runtime
pub type Result<T> = std::result::Result<T, Error>;

/// Creates a [crate::Error] from a message (with format-like behaviour), wrapped in `Err`
#[macro_export]
macro_rules! runtime_error {
    ($error:literal) => {
        Err($crate::Error::from(format!($error)))
    };
    ($error:expr) => {
        Err($crate::Error::from($error))
    };
    ($error:literal, $($y:expr),+ $(,)?) => {
        Err($crate::Error::from(format!($error, $($y),+)))
    };
}

/// Creates an error describing a type mismatch
pub fn unexpected_type(expected: &str, found: &crate::Value) -> Error {
    Error::new(ErrorKind::UnexpectedType {
        expected: expected.into(),
        found: found.type_as_string(),
    })
}
