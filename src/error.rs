//! Error taxonomy for the compilation pipeline.
//!
//! Every failure is attributed to the method being compiled: translation and
//! linking failures are caught at the worklist / top-level boundary and
//! rewrapped with the method's qualified name so a worker log line is enough
//! to locate the offending bytecode.

use std::io;

use crate::model::Token;

/// Error raised by the baseline instruction translator.
#[derive(Debug)]
pub enum TranslateError {
    /// Opcode not covered by the baseline translator
    UnsupportedOpcode(u8),
    /// Evaluation stack underflow at an instruction boundary
    StackUnderflow,
    /// Branch target outside the method body
    BadBranchTarget(u32),
    /// Ran out of scratch registers inside one basic block
    RegisterPressure,
    /// Call target with no known signature
    UnknownCallee(Token),
    /// Instruction stream ended mid-instruction
    TruncatedBody,
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::UnsupportedOpcode(op) => write!(f, "unsupported opcode: 0x{:02x}", op),
            TranslateError::StackUnderflow => write!(f, "evaluation stack underflow"),
            TranslateError::BadBranchTarget(t) => write!(f, "branch target 0x{:x} out of range", t),
            TranslateError::RegisterPressure => write!(f, "out of scratch registers"),
            TranslateError::UnknownCallee(t) => write!(f, "no signature for callee {}", t),
            TranslateError::TruncatedBody => write!(f, "truncated method body"),
        }
    }
}

impl std::error::Error for TranslateError {}

/// Compiler-level error, always carrying enough context to name the
/// offending method.
#[derive(Debug)]
pub enum CompileError {
    /// The type-size oracle reported size zero for a concrete, resolved type.
    /// Indicates an incomplete type system; aborts the method.
    FrameLayout { method: String, ty: String },
    /// The instruction translator rejected an instruction.
    Translate {
        method: String,
        offset: u32,
        cause: TranslateError,
    },
    /// The second-pass linker could not satisfy a reference.
    Link { method: String, detail: String },
    /// A synthesized helper was expected in the persistent cache but is
    /// missing. A prior compilation step must have failed silently.
    CacheInconsistency { token: Token },
    /// Method metadata could not be loaded
    MissingMethod(Token),
    /// Internal consistency failure (a bug in the compiler itself)
    Internal(String),
    /// Executable-memory mapping or protection failure at install time
    Memory(String),
    /// I/O failure while reading or writing the persistent repository
    Io(io::Error),
    /// Malformed persistent repository image
    BadImage(String),
}

impl From<io::Error> for CompileError {
    fn from(e: io::Error) -> Self {
        CompileError::Io(e)
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::FrameLayout { method, ty } => {
                write!(f, "{}: zero-sized type {} reached frame layout", method, ty)
            }
            CompileError::Translate {
                method,
                offset,
                cause,
            } => write!(f, "{}: at IL_{:04x}: {}", method, offset, cause),
            CompileError::Link { method, detail } => write!(f, "{}: link failed: {}", method, detail),
            CompileError::CacheInconsistency { token } => {
                write!(f, "helper {} missing from precompiled repository", token)
            }
            CompileError::MissingMethod(t) => write!(f, "no metadata for method {}", t),
            CompileError::Internal(msg) => write!(f, "internal compiler error: {}", msg),
            CompileError::Memory(msg) => write!(f, "executable memory: {}", msg),
            CompileError::Io(e) => write!(f, "I/O error: {}", e),
            CompileError::BadImage(msg) => write!(f, "bad repository image: {}", msg),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Translate { cause, .. } => Some(cause),
            CompileError::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
