//! Basic blocks and per-block compilation state.
//!
//! A block is identified by the bytecode offset it starts at; a handful of
//! negative ids name synthesized blocks that run before the body, and one
//! id past any possible offset names the canonical return block. Each block
//! carries the evaluation-stack and register state it was entered with, so
//! a forked continuation resumes exactly where its parent stopped.

use crate::jit::x86_64::Reg;
use crate::model::Token;

/// Block identifier. Non-negative values below `RET` are bytecode offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub i64);

impl BlockId {
    /// Function prologue framing
    pub const PROLOG: BlockId = BlockId(-3);
    /// Zero-initialization of object locals
    pub const INIT_OBJECTS: BlockId = BlockId(-2);
    /// Registration of the cleanup routine on the unwind stack
    pub const REG_CLEANUP: BlockId = BlockId(-1);
    /// Canonical return block, laid out after every body block
    pub const RET: BlockId = BlockId(1 << 32);

    pub fn from_offset(offset: u32) -> BlockId {
        BlockId(offset as i64)
    }

    pub fn is_synthetic(self) -> bool {
        self.0 < 0 || self == Self::RET
    }

    pub fn offset(self) -> Option<u32> {
        if self.is_synthetic() {
            None
        } else {
            Some(self.0 as u32)
        }
    }
}

/// How a sealed block transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// Block still being translated
    Pending,
    /// Falls into the next block in layout order
    Fallthrough,
    Always(BlockId),
    /// Conditional branch; the flag test on `reg` is already encoded in the
    /// block payload, only the jump itself is appended at estimation time.
    Cond {
        target: BlockId,
        /// Branch taken when the tested register is zero
        when_zero: bool,
    },
    Return,
}

/// One evaluation-stack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEntity {
    Const(i64),
    Reg(Reg),
    /// Address of a method, resolved by the linker
    MethodAddress(Token),
}

/// Evaluation stack snapshot.
#[derive(Debug, Clone, Default)]
pub struct EvalStack {
    entries: Vec<StackEntity>,
}

impl EvalStack {
    pub fn push(&mut self, e: StackEntity) {
        self.entries.push(e);
    }

    pub fn pop(&mut self) -> Option<StackEntity> {
        self.entries.pop()
    }

    pub fn peek(&self) -> Option<&StackEntity> {
        self.entries.last()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scratch registers handed to the translator, in allocation order. RAX is
/// excluded (return value / scratch for fixed sequences), RBX is the helper
/// frame-base register.
const TEMP_POOL: [Reg; 8] = [
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

const NONVOLATILE_POOL: [Reg; 4] = [Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Simple bitmap register allocator, no spilling.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    in_use: u16,
    /// Non-volatile registers ever handed out; the prologue saves these
    nonvolatile_used: u16,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    pub fn new() -> RegisterFile {
        RegisterFile {
            in_use: 0,
            nonvolatile_used: 0,
        }
    }

    fn bit(reg: Reg) -> u16 {
        1 << (reg as u8)
    }

    pub fn alloc_temp(&mut self) -> Option<Reg> {
        for &r in &TEMP_POOL {
            if self.in_use & Self::bit(r) == 0 {
                self.in_use |= Self::bit(r);
                return Some(r);
            }
        }
        None
    }

    pub fn alloc_nonvolatile(&mut self) -> Option<Reg> {
        for &r in &NONVOLATILE_POOL {
            if self.in_use & Self::bit(r) == 0 {
                self.in_use |= Self::bit(r);
                self.nonvolatile_used |= Self::bit(r);
                return Some(r);
            }
        }
        None
    }

    /// Mark a specific register as taken (reserved frame-base register).
    pub fn reserve(&mut self, reg: Reg) {
        self.in_use |= Self::bit(reg);
        if reg.is_nonvolatile() {
            self.nonvolatile_used |= Self::bit(reg);
        }
    }

    pub fn free(&mut self, reg: Reg) {
        self.in_use &= !Self::bit(reg);
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        self.in_use & Self::bit(reg) == 0
    }

    /// Non-volatile registers the prologue must save, in pool order.
    pub fn used_nonvolatile(&self) -> Vec<Reg> {
        let mut regs: Vec<Reg> = NONVOLATILE_POOL
            .iter()
            .copied()
            .filter(|&r| self.nonvolatile_used & Self::bit(r) != 0)
            .collect();
        if self.nonvolatile_used & Self::bit(Reg::Rbx) != 0 {
            regs.insert(0, Reg::Rbx);
        }
        regs
    }

    pub fn merge_used(&mut self, other: &RegisterFile) {
        self.nonvolatile_used |= other.nonvolatile_used;
    }
}

/// Per-block compilation state.
#[derive(Debug, Clone)]
pub struct MethodBlock {
    pub id: BlockId,
    pub stack: EvalStack,
    pub regs: RegisterFile,
    pub terminator: Terminator,
    /// Set once the terminator's jump bytes have been emitted
    pub finalized: bool,
    /// Deepest call-argument stack this block pushes, in bytes
    pub max_temp_stack: u32,
    /// Call-argument bytes currently pushed and not yet reverted
    pub pending_args: u32,
    /// Frame base register (RBP for method bodies, the reserved register
    /// for helpers)
    pub base_ptr: Reg,
}

impl MethodBlock {
    pub fn new(id: BlockId, base_ptr: Reg) -> MethodBlock {
        MethodBlock {
            id,
            stack: EvalStack::default(),
            regs: RegisterFile::new(),
            terminator: Terminator::Pending,
            finalized: false,
            max_temp_stack: 0,
            pending_args: 0,
            base_ptr,
        }
    }

    /// Continuation block starting at `id` with this block's state.
    pub fn fork(&self, id: BlockId) -> MethodBlock {
        MethodBlock {
            id,
            stack: self.stack.clone(),
            regs: self.regs.clone(),
            terminator: Terminator::Pending,
            finalized: false,
            max_temp_stack: 0,
            pending_args: 0,
            base_ptr: self.base_ptr,
        }
    }

    /// A re-queued, already-compiled block contributes only its temp-stack
    /// bookkeeping.
    pub fn merge_temp_stack(&mut self, other: &MethodBlock) {
        self.max_temp_stack = self.max_temp_stack.max(other.max_temp_stack);
    }

    pub fn note_temp_stack(&mut self, bytes: u32) {
        self.max_temp_stack = self.max_temp_stack.max(bytes);
    }

    /// Track one pushed call-argument word.
    pub fn push_arg_bytes(&mut self, bytes: u32) {
        self.pending_args += bytes;
        self.max_temp_stack = self.max_temp_stack.max(self.pending_args);
    }

    /// Track reverted call arguments.
    pub fn pop_arg_bytes(&mut self, bytes: u32) {
        self.pending_args = self.pending_args.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_classes() {
        assert!(BlockId::PROLOG.is_synthetic());
        assert!(BlockId::RET.is_synthetic());
        let b = BlockId::from_offset(12);
        assert!(!b.is_synthetic());
        assert_eq!(b.offset(), Some(12));
        assert!(BlockId::PROLOG < BlockId::INIT_OBJECTS);
        assert!(BlockId::INIT_OBJECTS < BlockId::REG_CLEANUP);
        assert!(BlockId(0x1000) < BlockId::RET);
    }

    #[test]
    fn test_register_file_exhaustion() {
        let mut regs = RegisterFile::new();
        let mut got = Vec::new();
        while let Some(r) = regs.alloc_temp() {
            got.push(r);
        }
        assert_eq!(got.len(), 8);
        assert_eq!(got[0], Reg::Rcx);
        regs.free(Reg::Rsi);
        assert_eq!(regs.alloc_temp(), Some(Reg::Rsi));
    }

    #[test]
    fn test_nonvolatile_tracking() {
        let mut regs = RegisterFile::new();
        regs.reserve(Reg::Rbx);
        let r = regs.alloc_nonvolatile().unwrap();
        assert_eq!(r, Reg::R12);
        assert_eq!(regs.used_nonvolatile(), vec![Reg::Rbx, Reg::R12]);
    }

    #[test]
    fn test_fork_carries_state() {
        let mut b = MethodBlock::new(BlockId::from_offset(0), Reg::Rbp);
        let r = b.regs.alloc_temp().unwrap();
        b.stack.push(StackEntity::Reg(r));
        b.note_temp_stack(16);

        let f = b.fork(BlockId::from_offset(8));
        assert_eq!(f.stack.depth(), 1);
        assert!(!f.regs.is_free(r));
        assert_eq!(f.terminator, Terminator::Pending);
        assert_eq!(f.max_temp_stack, 0);
    }

    #[test]
    fn test_merge_temp_stack() {
        let mut a = MethodBlock::new(BlockId(0), Reg::Rbp);
        let mut b = MethodBlock::new(BlockId(0), Reg::Rbp);
        a.note_temp_stack(8);
        b.note_temp_stack(24);
        a.merge_temp_stack(&b);
        assert_eq!(a.max_temp_stack, 24);
    }
}
