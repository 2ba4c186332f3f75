//! Global identities.
//!
//! A method or type is named by a `Token`: a (module id, raw token) pair. The
//! raw token packs a metadata table kind in its high byte and a 24-bit row,
//! mirroring CLR-style metadata tokens. Equality and hashing are structural
//! over the pair.

use std::fmt;

/// Identifies a loaded module. Plain index into the `ModuleArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// Reserved id for identities that have not been resolved to a module.
    pub const UNRESOLVED: ModuleId = ModuleId(u32::MAX);
    /// Reserved id for compiler-synthesized identities with no owning module.
    pub const SYNTHETIC: ModuleId = ModuleId(u32::MAX - 1);

    pub fn is_reserved(self) -> bool {
        self == Self::UNRESOLVED || self == Self::SYNTHETIC
    }
}

/// Metadata table kinds carried in a raw token's high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TableKind {
    TypeDef = 0x02,
    Method = 0x06,
    MemberRef = 0x0A,
    /// External/runtime-internal reference, never compiled locally
    Internal = 0x70,
    /// Compiler-synthesized helper (exception handlers, cleanup routines)
    Helper = 0x71,
    /// Synthesized instance destructor
    InstanceDtor = 0x72,
    /// Synthesized static-constructor wrapper
    CctorWrapper = 0x73,
    /// Static storage cell
    StaticData = 0x74,
}

impl TableKind {
    pub fn from_u8(b: u8) -> Option<TableKind> {
        Some(match b {
            0x02 => TableKind::TypeDef,
            0x06 => TableKind::Method,
            0x0A => TableKind::MemberRef,
            0x70 => TableKind::Internal,
            0x71 => TableKind::Helper,
            0x72 => TableKind::InstanceDtor,
            0x73 => TableKind::CctorWrapper,
            0x74 => TableKind::StaticData,
            _ => return None,
        })
    }
}

/// Raw in-module token: table kind in the high byte, 24-bit row below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawToken(pub u32);

impl RawToken {
    pub fn new(kind: TableKind, row: u32) -> RawToken {
        debug_assert!(row < (1 << 24));
        RawToken(((kind as u32) << 24) | (row & 0x00FF_FFFF))
    }

    pub fn kind(self) -> Option<TableKind> {
        TableKind::from_u8((self.0 >> 24) as u8)
    }

    pub fn row(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }
}

/// Global token: (module, raw token). Uniquely names a method or type across
/// all loaded modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    pub module: ModuleId,
    pub raw: RawToken,
}

impl Token {
    pub fn new(module: ModuleId, raw: RawToken) -> Token {
        Token { module, raw }
    }

    pub fn build(module: ModuleId, kind: TableKind, row: u32) -> Token {
        Token::new(module, RawToken::new(kind, row))
    }

    /// The "no such identity" sentinel.
    pub fn unresolved() -> Token {
        Token {
            module: ModuleId::UNRESOLVED,
            raw: RawToken(0),
        }
    }

    pub fn is_unresolved(self) -> bool {
        self.module == ModuleId::UNRESOLVED
    }

    /// Stable symbol name used for call relocations and resolve lists.
    pub fn symbol(self) -> String {
        format!("M{}:{:08x}", self.module.0, self.raw.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unresolved() {
            write!(f, "<unresolved>")
        } else {
            write!(f, "{:08x}@{}", self.raw.0, self.module.0)
        }
    }
}
