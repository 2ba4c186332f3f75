//! The method-level compiler: bytecode in, relocatable native code out.

pub mod block;
pub mod compiler;
pub mod context;
pub mod firstpass;
pub mod secondpass;
pub mod translate;
pub mod x86_64;
