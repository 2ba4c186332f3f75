//! Second-pass binary: final layout and linking.
//!
//! The linker lays the first pass's blocks out in ascending id order,
//! patches every intra-method jump displacement, and lifts symbol
//! relocations into a dependency list resolved at install time. The
//! serialized form of the result is what the persistent repository stores.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CompileError, CompileResult};
use crate::jit::block::BlockId;
use crate::jit::firstpass::{FirstPass, JumpKind, RelocKind};

/// Unresolved reference from the final code blob to an external symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Offset of the patched field in `code`
    pub offset: usize,
    pub symbol: String,
    pub kind: RelocKind,
}

/// Debug metadata attached to a compiled method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub method_name: String,
    /// Name under which the method is exported, when an export attribute
    /// was attached
    pub export_name: Option<String>,
}

/// Fully laid-out, relocatable code blob.
#[derive(Debug, PartialEq, Eq)]
pub struct SecondPassBinary {
    pub code: Vec<u8>,
    pub deps: Vec<Dependency>,
    /// Symbols of enclosing scopes (ancestor helpers innermost first, then
    /// the parent method) a nested helper resolves references through
    pub resolve_chain: Vec<String>,
    pub debug: DebugInfo,
}

impl SecondPassBinary {
    /// Binary for a bodyless (abstract/extern) method.
    pub fn empty(method_name: &str) -> SecondPassBinary {
        SecondPassBinary {
            code: Vec::new(),
            deps: Vec::new(),
            resolve_chain: Vec::new(),
            debug: DebugInfo {
                method_name: method_name.to_string(),
                export_name: None,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Lay out and patch a first-pass binary.
///
/// `terminal` names the canonical return block; its presence is a sealing
/// invariant of the compiler, so a missing terminal is an internal error.
/// Jump targets that were never compiled, and short jumps whose finalized
/// displacement overflows, are linking failures attributed to `method_name`.
pub fn link(
    pass: &FirstPass,
    terminal: BlockId,
    resolve_chain: Vec<String>,
    method_name: &str,
) -> CompileResult<SecondPassBinary> {
    if !pass.has_block(terminal) {
        return Err(CompileError::Internal(format!(
            "{}: terminal block {:?} missing from first pass",
            method_name, terminal
        )));
    }

    // ascending id order is the layout order
    let mut starts: BTreeMap<BlockId, usize> = BTreeMap::new();
    let mut total = 0usize;
    for (id, block) in &pass.blocks {
        starts.insert(*id, total);
        total += block.len();
    }

    let mut code = Vec::with_capacity(total);
    let mut deps = Vec::new();
    for (id, block) in &pass.blocks {
        let base = starts[id];
        code.extend_from_slice(&block.code);
        for reloc in &block.symbol_relocs {
            deps.push(Dependency {
                offset: base + reloc.offset,
                symbol: reloc.symbol.clone(),
                kind: reloc.kind,
            });
        }
        for reloc in &block.block_relocs {
            let target = *starts.get(&reloc.target).ok_or_else(|| CompileError::Link {
                method: method_name.to_string(),
                detail: format!("jump to uncompiled block {:?}", reloc.target),
            })? as i64;
            let field = (base + reloc.offset) as i64;
            match reloc.kind {
                JumpKind::Rel8 => {
                    let disp = target - (field + 1);
                    let disp = i8::try_from(disp).map_err(|_| CompileError::Link {
                        method: method_name.to_string(),
                        detail: format!("short jump to {:?} overflows ({} bytes)", reloc.target, disp),
                    })?;
                    code[field as usize] = disp as u8;
                }
                JumpKind::Rel32 => {
                    let disp = (target - (field + 4)) as i32;
                    code[field as usize..field as usize + 4]
                        .copy_from_slice(&disp.to_le_bytes());
                }
            }
        }
    }

    Ok(SecondPassBinary {
        code,
        deps,
        resolve_chain,
        debug: DebugInfo {
            method_name: method_name.to_string(),
            export_name: None,
        },
    })
}

// ---- wire format ----
//
// The serialized binary is opaque to the repository; only this module reads
// and writes it. All fields little-endian.

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn read_u8(input: &mut &[u8]) -> CompileResult<u8> {
    let (&b, rest) = input
        .split_first()
        .ok_or_else(|| CompileError::BadImage("truncated binary".to_string()))?;
    *input = rest;
    Ok(b)
}

fn read_u32(input: &mut &[u8]) -> CompileResult<u32> {
    if input.len() < 4 {
        return Err(CompileError::BadImage("truncated binary".to_string()));
    }
    let (head, rest) = input.split_at(4);
    *input = rest;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}

fn read_bytes(input: &mut &[u8]) -> CompileResult<Vec<u8>> {
    let len = read_u32(input)? as usize;
    if input.len() < len {
        return Err(CompileError::BadImage("truncated binary".to_string()));
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head.to_vec())
}

fn read_string(input: &mut &[u8]) -> CompileResult<String> {
    String::from_utf8(read_bytes(input)?)
        .map_err(|_| CompileError::BadImage("non-utf8 string in binary".to_string()))
}

impl SecondPassBinary {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        write_bytes(out, &self.code);
        out.extend_from_slice(&(self.deps.len() as u32).to_le_bytes());
        for dep in &self.deps {
            out.extend_from_slice(&(dep.offset as u32).to_le_bytes());
            out.push(match dep.kind {
                RelocKind::Rel32 => 0,
                RelocKind::Abs64 => 1,
            });
            write_bytes(out, dep.symbol.as_bytes());
        }
        out.extend_from_slice(&(self.resolve_chain.len() as u32).to_le_bytes());
        for sym in &self.resolve_chain {
            write_bytes(out, sym.as_bytes());
        }
        write_bytes(out, self.debug.method_name.as_bytes());
        match &self.debug.export_name {
            Some(name) => {
                out.push(1);
                write_bytes(out, name.as_bytes());
            }
            None => out.push(0),
        }
    }

    pub fn deserialize(input: &mut &[u8]) -> CompileResult<SecondPassBinary> {
        let code = read_bytes(input)?;
        let dep_count = read_u32(input)?;
        let mut deps = Vec::with_capacity(dep_count as usize);
        for _ in 0..dep_count {
            let offset = read_u32(input)? as usize;
            let kind = match read_u8(input)? {
                0 => RelocKind::Rel32,
                1 => RelocKind::Abs64,
                k => {
                    return Err(CompileError::BadImage(format!(
                        "unknown relocation kind {}",
                        k
                    )));
                }
            };
            let symbol = read_string(input)?;
            deps.push(Dependency {
                offset,
                symbol,
                kind,
            });
        }
        let chain_count = read_u32(input)?;
        let mut resolve_chain = Vec::with_capacity(chain_count as usize);
        for _ in 0..chain_count {
            resolve_chain.push(read_string(input)?);
        }
        let method_name = read_string(input)?;
        let export_name = match read_u8(input)? {
            0 => None,
            _ => Some(read_string(input)?),
        };
        Ok(SecondPassBinary {
            code,
            deps,
            resolve_chain,
            debug: DebugInfo {
                method_name,
                export_name,
            },
        })
    }
}

/// Shared handle to a published binary.
pub type BinaryHandle = Arc<SecondPassBinary>;
