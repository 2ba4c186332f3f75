//! Per-method compilation context.
//!
//! Owns the worklist of pending blocks, the set of block ids already
//! compiled, and the pre-scanned bit-set of forced block boundaries. One
//! context belongs to one method (or one helper sub-compilation) and is
//! never shared across threads.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::jit::block::{BlockId, MethodBlock};
use crate::jit::secondpass::SecondPassBinary;
use crate::model::Token;
use crate::resolve::ExceptionClause;

/// Fixed-capacity bit set over bytecode offsets.
#[derive(Debug, Clone)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> BitSet {
        BitSet {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 64] |= 1 << (index % 64);
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / 64] & (1 << (index % 64)) != 0
    }
}

/// Mutable state of one method compilation.
pub struct CompileContext {
    /// Blocks discovered but not yet compiled
    pub worklist: VecDeque<MethodBlock>,
    /// Block ids compiled in this context
    pub compiled: BTreeSet<BlockId>,
    /// Bytecode offsets that must start a new block
    pub split: BitSet,
    /// Synthetic identity of the cleanup routine, unresolved when the
    /// method needs none
    pub cleanup_token: Token,
}

impl CompileContext {
    pub fn new(body_len: usize) -> CompileContext {
        CompileContext {
            worklist: VecDeque::new(),
            compiled: BTreeSet::new(),
            split: BitSet::new(body_len),
            cleanup_token: Token::unresolved(),
        }
    }

    /// Context for a helper rooted in the same body, sharing the parent's
    /// split decisions.
    pub fn for_helper(&self) -> CompileContext {
        CompileContext {
            worklist: VecDeque::new(),
            compiled: BTreeSet::new(),
            split: self.split.clone(),
            cleanup_token: Token::unresolved(),
        }
    }

    pub fn enqueue(&mut self, block: MethodBlock) {
        self.worklist.push_back(block);
    }

    pub fn is_compiled(&self, id: BlockId) -> bool {
        self.compiled.contains(&id)
    }

    pub fn mark_compiled(&mut self, id: BlockId) {
        self.compiled.insert(id);
    }

    /// Whether `offset` was pre-scanned as a branch target.
    pub fn is_forced_boundary(&self, offset: u32) -> bool {
        self.split.get(offset as usize)
    }
}

/// One exception clause being compiled into a handler helper.
pub struct HelperState {
    pub clause: ExceptionClause,
    /// Synthetic identity of the compiled helper
    pub token: Token,
    /// Enclosing scope: another helper's token, or the parent method
    pub parent: Token,
    pub binary: Option<Arc<SecondPassBinary>>,
}
