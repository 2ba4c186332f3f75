//! ciljit - a method-level JIT compiler for CIL-style bytecode
//!
//! This library turns stack-machine method bodies into relocatable x86-64
//! binaries: frame layout, block-by-block translation, exception handler
//! helpers, cleanup routines, jump-size estimation, and a two-pass link.
//! The execution side caches compiled binaries in memory and in a
//! persistent repository, and installs them into executable pages.

pub mod config;
pub mod error;
pub mod exec;
pub mod frame;
pub mod jit;
pub mod model;
pub mod resolve;
pub mod util;

// Re-export commonly used types
pub use config::{CompilerConfig, MachineSpec};
pub use error::{CompileError, CompileResult};
pub use jit::compiler::MethodCompiler;
pub use jit::secondpass::{BinaryHandle, SecondPassBinary};
pub use model::{ModuleId, RawToken, TableKind, Token};
