//! Structural type descriptors.
//!
//! An `ElementType` describes the shape of a local, argument, field or stack
//! slot: a base kind plus pointer level and modifier flags. Equality is
//! structural; two descriptors built independently from the same signature
//! compare equal.

use crate::model::token::Token;
use crate::util::crc64::Crc64;

/// Base kind of an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeKind {
    Void = 0x01,
    Bool = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0A,
    U8 = 0x0B,
    R4 = 0x0C,
    R8 = 0x0D,
    String = 0x0E,
    /// Value type, `class_token` names the definition
    ValueType = 0x11,
    /// Reference type, `class_token` names the definition
    Class = 0x12,
    /// Native-width integer
    IntPtr = 0x18,
    UIntPtr = 0x19,
    Object = 0x1C,
}

impl TypeKind {
    /// Fixed size in bytes for primitive kinds, `None` where the size depends
    /// on the type definition (value types) or the machine (pointers).
    pub fn fixed_size(self) -> Option<u32> {
        Some(match self {
            TypeKind::Void => 0,
            TypeKind::Bool | TypeKind::I1 | TypeKind::U1 => 1,
            TypeKind::Char | TypeKind::I2 | TypeKind::U2 => 2,
            TypeKind::I4 | TypeKind::U4 | TypeKind::R4 => 4,
            TypeKind::I8 | TypeKind::U8 | TypeKind::R8 => 8,
            _ => return None,
        })
    }
}

/// A generic instantiation: open base definition plus ordered arguments.
/// Equality is structural and recursive through the arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenericInst {
    pub base: Token,
    pub args: Vec<ElementType>,
}

/// Full element-type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementType {
    pub kind: TypeKind,
    /// Number of `*` levels applied over the base kind
    pub pointer_level: u8,
    pub by_ref: bool,
    pub pinned: bool,
    pub single_dim_array: bool,
    /// Definition token for `ValueType`/`Class` kinds
    pub class_token: Option<Token>,
    /// Present when the type is a generic instantiation
    pub generic: Option<Box<GenericInst>>,
}

impl ElementType {
    pub fn simple(kind: TypeKind) -> ElementType {
        ElementType {
            kind,
            pointer_level: 0,
            by_ref: false,
            pinned: false,
            single_dim_array: false,
            class_token: None,
            generic: None,
        }
    }

    pub fn generic_of(kind: TypeKind, base: Token, args: Vec<ElementType>) -> ElementType {
        ElementType {
            class_token: Some(base),
            generic: Some(Box::new(GenericInst { base, args })),
            ..ElementType::simple(kind)
        }
    }

    pub fn class(token: Token) -> ElementType {
        ElementType {
            class_token: Some(token),
            ..ElementType::simple(TypeKind::Class)
        }
    }

    pub fn value_type(token: Token) -> ElementType {
        ElementType {
            class_token: Some(token),
            ..ElementType::simple(TypeKind::ValueType)
        }
    }

    pub fn pointer_to(mut self) -> ElementType {
        self.pointer_level += 1;
        self
    }

    /// True for types whose storage is a GC heap reference: object, string,
    /// single-dimension arrays and non-value classes. A pointer to any of
    /// these is a raw address, not a reference, so any pointer level disables
    /// the predicate.
    pub fn is_object_and_not_value_type(&self) -> bool {
        if self.pointer_level > 0 {
            return false;
        }
        self.single_dim_array
            || matches!(self.kind, TypeKind::Object | TypeKind::String | TypeKind::Class)
    }

    /// Like `is_object_and_not_value_type`, but also true for value types
    /// with a class definition (their fields may hold references).
    pub fn is_object(&self) -> bool {
        if self.pointer_level > 0 {
            return false;
        }
        self.is_object_and_not_value_type()
            || (self.kind == TypeKind::ValueType && self.class_token.is_some())
    }

    /// True when storage is machine-word sized regardless of the base kind.
    pub fn is_pointer_like(&self) -> bool {
        self.pointer_level > 0
            || self.by_ref
            || matches!(self.kind, TypeKind::IntPtr | TypeKind::UIntPtr)
    }

    pub fn is_generic(&self) -> bool {
        self.generic.is_some()
    }

    /// A concrete type is fully resolved and not an open/instantiated
    /// generic; a size of zero for such a type is a type-system bug.
    pub fn is_concrete(&self) -> bool {
        !self.is_generic() && !self.class_token.is_some_and(|t| t.is_unresolved())
    }

    /// Feed a stable encoding of this descriptor into a content signature.
    /// The encoding commits to every structural field so distinct types never
    /// collide by construction.
    pub fn hash_into(&self, crc: &mut Crc64) {
        crc.update(&[self.kind as u8, self.pointer_level]);
        let flags = (self.by_ref as u8)
            | ((self.pinned as u8) << 1)
            | ((self.single_dim_array as u8) << 2);
        crc.update(&[flags]);
        match self.class_token {
            Some(t) => {
                crc.update(&[1]);
                crc.update(&t.module.0.to_le_bytes());
                crc.update(&t.raw.0.to_le_bytes());
            }
            None => crc.update(&[0]),
        }
        match &self.generic {
            Some(g) => {
                crc.update(&[1]);
                crc.update(&g.base.module.0.to_le_bytes());
                crc.update(&g.base.raw.0.to_le_bytes());
                crc.update(&(g.args.len() as u32).to_le_bytes());
                for arg in &g.args {
                    arg.hash_into(crc);
                }
            }
            None => crc.update(&[0]),
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.by_ref {
            write!(f, "ref ")?;
        }
        match (self.kind, self.class_token) {
            (TypeKind::Class, Some(t)) | (TypeKind::ValueType, Some(t)) => write!(f, "{}", t)?,
            (k, _) => write!(f, "{:?}", k)?,
        }
        for _ in 0..self.pointer_level {
            write!(f, "*")?;
        }
        if self.single_dim_array {
            write!(f, "[]")?;
        }
        Ok(())
    }
}
