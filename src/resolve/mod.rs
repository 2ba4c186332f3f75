//! Collaborator interfaces and method metadata.
//!
//! The compiler core never parses metadata tables itself; it consumes a
//! type/size oracle and a method source through the traits here. Tests and
//! the demo driver provide table-backed implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{CompileError, CompileResult};
use crate::model::{ElementType, ModuleId, TableKind, Token};
use crate::util::crc64::Crc64;

/// One field of a type: identity, declared type, byte offset inside the
/// owning type's layout.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub token: Token,
    pub ty: ElementType,
    pub offset: u32,
}

/// Type/size oracle. Keyed by global token; layout decisions (sizes, field
/// offsets, base chains) belong to the runtime's type loader, not to the
/// compiler.
pub trait TypeResolver: Send + Sync {
    /// Size in bytes of a value of this type. 0 for a concrete resolved type
    /// means the type system is incomplete and compilation must abort.
    fn type_size(&self, ty: &ElementType) -> u32;

    /// Ordered fields of a type definition, offsets relative to the start of
    /// the type's instance layout.
    fn fields_of(&self, ty: Token) -> Vec<FieldInfo>;

    /// Direct base type, if any. Used to walk inherited members during
    /// member teardown.
    fn base_of(&self, ty: Token) -> Option<Token>;

    /// Whether instances of this type need member teardown when collected
    /// (any object-typed member, directly or inherited).
    fn needs_member_teardown(&self, ty: Token) -> bool;
}

/// Clause kinds of a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

impl ClauseKind {
    /// Catch and filter handlers receive the thrown object on entry.
    pub fn receives_exception(self) -> bool {
        matches!(self, ClauseKind::Catch | ClauseKind::Filter)
    }
}

/// One exception clause of a method body.
#[derive(Debug, Clone)]
pub struct ExceptionClause {
    pub kind: ClauseKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    /// Caught type for `Catch` clauses
    pub class_token: Option<Token>,
}

impl ExceptionClause {
    pub fn protects(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_offset + self.try_length
    }
}

/// Calling convention of a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// Caller reverts pushed arguments
    Cdecl,
    /// Callee reverts pushed arguments on return
    Stdcall,
}

#[derive(Debug, Clone)]
pub struct MethodSig {
    pub call_conv: CallConv,
    pub has_this: bool,
    pub ret: ElementType,
    pub params: Vec<ElementType>,
}

/// A custom attribute attached to a method, reduced to name + string
/// arguments. Only the export attribute is consumed by the compiler.
#[derive(Debug, Clone)]
pub struct CustomAttribute {
    pub name: String,
    pub args: Vec<String>,
}

/// Everything the compiler needs to know about one method.
#[derive(Debug, Clone)]
pub struct MethodDesc {
    /// Qualified name, used in error wrapping and debug metadata
    pub name: String,
    /// Owning type, if any
    pub parent_type: Option<Token>,
    pub sig: MethodSig,
    pub locals: Vec<ElementType>,
    /// Whether the body requests automatic zeroing of locals
    pub init_locals: bool,
    /// Raw bytecode stream; empty for abstract/extern declarations
    pub body: Vec<u8>,
    pub clauses: Vec<ExceptionClause>,
    pub attributes: Vec<CustomAttribute>,
}

impl MethodDesc {
    /// Structural content signature: stable across runs, changes whenever
    /// the declared shape or the body changes. Keys the persistent cache.
    pub fn content_signature(&self) -> u64 {
        let mut crc = Crc64::new();
        // architecture tag, so binaries never migrate across targets
        crc.update(b"x86_64");
        crc.update(self.name.as_bytes());
        crc.update(&[self.sig.has_this as u8, self.sig.call_conv as u8]);
        self.sig.ret.hash_into(&mut crc);
        crc.update(&(self.sig.params.len() as u32).to_le_bytes());
        for p in &self.sig.params {
            p.hash_into(&mut crc);
        }
        crc.update(&(self.locals.len() as u32).to_le_bytes());
        for l in &self.locals {
            l.hash_into(&mut crc);
        }
        crc.update(&[self.init_locals as u8]);
        crc.update(&(self.body.len() as u32).to_le_bytes());
        crc.update(&self.body);
        crc.digest()
    }

    pub fn attribute(&self, name: &str) -> Option<&CustomAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Method metadata source.
pub trait MethodSource: Send + Sync {
    fn load_method(&self, token: Token) -> CompileResult<MethodDesc>;

    /// Static constructor of a type, if it declares one.
    fn static_initializer_of(&self, ty: Token) -> Option<Token>;
}

/// Runtime entry points the compiler emits calls to, plus runtime-level
/// classification of methods.
#[derive(Debug, Clone)]
pub struct RuntimeHooks {
    /// `decObject(obj)` — drops one reference
    pub dec_obj: Token,
    /// `registerRoutine(fn, framePtr)` — pushes onto the unwind stack
    pub register_routine: Token,
    /// `unregisterRoutine()` — pops the unwind stack
    pub unregister_routine: Token,
    /// `currentException() -> obj`
    pub current_exception: Token,
    /// Modules whose methods are runtime-internal; their arguments are not
    /// subject to automatic cleanup
    pub framework_modules: Vec<ModuleId>,
}

impl RuntimeHooks {
    pub fn is_framework_method(&self, method: Token) -> bool {
        self.framework_modules.contains(&method.module)
    }

    pub fn is_finalizer(&self, desc: &MethodDesc) -> bool {
        desc.sig.has_this && desc.name.ends_with(".Finalize")
    }
}

/// One loaded module. The helper-row counter is owned here rather than in
/// process-wide state so two arenas never interfere.
#[derive(Debug)]
pub struct ModuleInfo {
    pub name: String,
    next_helper_row: AtomicU32,
}

impl ModuleInfo {
    pub fn new(name: &str) -> ModuleInfo {
        ModuleInfo {
            name: name.to_string(),
            next_helper_row: AtomicU32::new(1),
        }
    }

    pub fn with_helper_row(name: &str, next: u32) -> ModuleInfo {
        ModuleInfo {
            name: name.to_string(),
            next_helper_row: AtomicU32::new(next),
        }
    }

    pub fn next_helper_row(&self) -> u32 {
        self.next_helper_row.load(Ordering::SeqCst)
    }
}

/// Arena of loaded modules, indexed by `ModuleId`. Cross-module references
/// are plain ids resolved through the arena.
#[derive(Debug, Default)]
pub struct ModuleArena {
    modules: Vec<ModuleInfo>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleArena {
    pub fn new() -> ModuleArena {
        ModuleArena::default()
    }

    pub fn add(&mut self, info: ModuleInfo) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        self.by_name.insert(info.name.clone(), id);
        self.modules.push(info);
        id
    }

    pub fn get(&self, id: ModuleId) -> Option<&ModuleInfo> {
        self.modules.get(id.0 as usize)
    }

    pub fn id_of(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &ModuleInfo)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleId(i as u32), m))
    }

    pub fn name_of(&self, id: ModuleId) -> CompileResult<&str> {
        self.get(id)
            .map(|m| m.name.as_str())
            .ok_or_else(|| CompileError::Internal(format!("unknown module id {}", id.0)))
    }

    /// Allocate a fresh synthetic token of `kind` in `module`.
    pub fn alloc_synthetic(&self, module: ModuleId, kind: TableKind) -> CompileResult<Token> {
        let info = self
            .get(module)
            .ok_or_else(|| CompileError::Internal(format!("unknown module id {}", module.0)))?;
        let row = info.next_helper_row.fetch_add(1, Ordering::SeqCst);
        Ok(Token::build(module, kind, row))
    }
}

/// Bundle of collaborators one compilation runs against.
pub struct CompileEnv {
    pub modules: ModuleArena,
    pub resolver: Box<dyn TypeResolver>,
    pub methods: Box<dyn MethodSource>,
    pub hooks: RuntimeHooks,
}
