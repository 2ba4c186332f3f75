//! Core data model: tokens and element types.

pub mod element_type;
pub mod token;

pub use element_type::{ElementType, GenericInst, TypeKind};
pub use token::{ModuleId, RawToken, TableKind, Token};
