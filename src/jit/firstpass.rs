//! First-pass binary: the block graph before addresses are finalized.
//!
//! Every block owns its encoded payload plus two relocation lists: symbol
//! references (patched by the linker once dependency addresses are known)
//! and block references (patched when the blocks are laid out end to end).

use std::collections::BTreeMap;

use crate::jit::block::{BlockId, MethodBlock, StackEntity};
use crate::jit::x86_64::{Asm, Cond, Reg};
use crate::model::Token;

/// How a patched field is written by the linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit displacement relative to the end of the field
    Rel32,
    /// Absolute 64-bit address
    Abs64,
}

/// Reference from inside a block's payload to an external symbol.
#[derive(Debug, Clone)]
pub struct SymbolReloc {
    /// Offset of the patched field inside the block payload
    pub offset: usize,
    pub symbol: String,
    pub kind: RelocKind,
}

/// Encoded width of an intra-method jump displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Rel8,
    Rel32,
}

/// Reference from inside a block's payload to another block of the same
/// first-pass binary.
#[derive(Debug, Clone, Copy)]
pub struct BlockReloc {
    pub offset: usize,
    pub target: BlockId,
    pub kind: JumpKind,
}

/// One block of encoded code plus its relocations and, once sealed, the
/// compilation state it ended with.
#[derive(Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub code: Vec<u8>,
    pub symbol_relocs: Vec<SymbolReloc>,
    pub block_relocs: Vec<BlockReloc>,
    pub state: Option<MethodBlock>,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> BasicBlock {
        BasicBlock {
            id,
            code: Vec::new(),
            symbol_relocs: Vec::new(),
            block_relocs: Vec::new(),
            state: None,
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Append an unconditional jump to `target`, recording the displacement
    /// field for later patching.
    pub fn emit_jump(&mut self, target: BlockId, kind: JumpKind) {
        let mut asm = Asm::new(&mut self.code);
        match kind {
            JumpKind::Rel8 => {
                asm.jmp_rel8(0);
                let off = self.code.len() - 1;
                self.block_relocs.push(BlockReloc {
                    offset: off,
                    target,
                    kind,
                });
            }
            JumpKind::Rel32 => {
                asm.jmp_rel32(0);
                let off = self.code.len() - 4;
                self.block_relocs.push(BlockReloc {
                    offset: off,
                    target,
                    kind,
                });
            }
        }
    }

    /// Append a conditional jump to `target`.
    pub fn emit_jcc(&mut self, cond: Cond, target: BlockId, kind: JumpKind) {
        let mut asm = Asm::new(&mut self.code);
        match kind {
            JumpKind::Rel8 => {
                asm.jcc_rel8(cond, 0);
                let off = self.code.len() - 1;
                self.block_relocs.push(BlockReloc {
                    offset: off,
                    target,
                    kind,
                });
            }
            JumpKind::Rel32 => {
                asm.jcc_rel32(cond, 0);
                let off = self.code.len() - 4;
                self.block_relocs.push(BlockReloc {
                    offset: off,
                    target,
                    kind,
                });
            }
        }
    }
}

/// First-pass binary under construction.
#[derive(Debug, Default)]
pub struct FirstPass {
    pub blocks: BTreeMap<BlockId, BasicBlock>,
    /// Callee reverts pushed arguments on return
    pub stdcall: bool,
    pub locals_size: u32,
    pub args_size: u32,
}

impl FirstPass {
    pub fn new(stdcall: bool, locals_size: u32, args_size: u32) -> FirstPass {
        FirstPass {
            blocks: BTreeMap::new(),
            stdcall,
            locals_size,
            args_size,
        }
    }

    pub fn has_block(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn insert(&mut self, block: BasicBlock) {
        self.blocks.insert(block.id, block);
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(&id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&id)
    }

    /// Detach every block whose id satisfies `belongs`; used to move a
    /// helper's blocks out of its parent's first pass.
    pub fn take_blocks(&mut self, belongs: impl Fn(BlockId) -> bool) -> Vec<BasicBlock> {
        let ids: Vec<BlockId> = self
            .blocks
            .keys()
            .copied()
            .filter(|&id| belongs(id))
            .collect();
        ids.into_iter()
            .filter_map(|id| self.blocks.remove(&id))
            .collect()
    }

    /// Largest call-argument stack any block pushes.
    pub fn max_temp_stack(&self) -> u32 {
        self.blocks
            .values()
            .filter_map(|b| b.state.as_ref())
            .map(|s| s.max_temp_stack)
            .max()
            .unwrap_or(0)
    }
}

/// Argument-slot offset from the frame base: saved RBP + return address.
pub const ARG_BASE_DISP: i32 = 16;

/// Mid-level emitter: frame-relative addressing and call sequences over one
/// block, keeping the block state's bookkeeping in sync.
pub struct Codegen<'a> {
    pub block: &'a mut BasicBlock,
    pub state: &'a mut MethodBlock,
    pub locals_size: u32,
}

impl<'a> Codegen<'a> {
    pub fn new(block: &'a mut BasicBlock, state: &'a mut MethodBlock, locals_size: u32) -> Self {
        Codegen {
            block,
            state,
            locals_size,
        }
    }

    fn asm(&mut self) -> Asm<'_> {
        Asm::new(&mut self.block.code)
    }

    /// Displacement of a local slot from the frame base register.
    pub fn local_disp(&self, slot_offset: u32) -> i32 {
        slot_offset as i32 - self.locals_size as i32
    }

    /// Displacement of an argument slot from the frame base register.
    pub fn arg_disp(&self, slot_offset: u32) -> i32 {
        ARG_BASE_DISP + slot_offset as i32
    }

    pub fn store_const_to_frame(&mut self, disp: i32, imm: i32) {
        let base = self.state.base_ptr;
        self.asm().mov_mi32(base, disp, imm);
    }

    pub fn load_frame(&mut self, dst: Reg, disp: i32) {
        let base = self.state.base_ptr;
        self.asm().mov_rm(dst, base, disp);
    }

    pub fn store_frame(&mut self, disp: i32, src: Reg) {
        let base = self.state.base_ptr;
        self.asm().mov_mr(base, disp, src);
    }

    pub fn load_const(&mut self, dst: Reg, imm: i64) {
        if let Ok(v) = i32::try_from(imm) {
            self.asm().mov_ri32(dst, v);
        } else {
            self.asm().mov_ri64(dst, imm);
        }
    }

    /// Push one call argument, tracking the temp-stack watermark.
    pub fn push_arg(&mut self, entity: StackEntity) {
        match entity {
            StackEntity::Const(v) => {
                self.asm().mov_ri64(Reg::Rax, v);
                self.asm().push(Reg::Rax);
            }
            StackEntity::Reg(r) => self.asm().push(r),
            StackEntity::MethodAddress(t) => {
                self.load_method_address(Reg::Rax, t);
                self.asm().push(Reg::Rax);
            }
        }
        self.state.push_arg_bytes(8);
    }

    /// Caller-side argument cleanup after a cdecl call.
    pub fn revert_stack(&mut self, bytes: u32) {
        if bytes > 0 {
            self.asm().add_ri32(Reg::Rsp, bytes as i32);
        }
        self.state.pop_arg_bytes(bytes);
    }

    /// CALL to a symbolic target, patched by the linker.
    pub fn call_symbol(&mut self, target: Token) {
        self.asm().call_rel32(0);
        let off = self.block.code.len() - 4;
        self.block.symbol_relocs.push(SymbolReloc {
            offset: off,
            symbol: target.symbol(),
            kind: RelocKind::Rel32,
        });
    }

    /// Materialize a method's absolute address into `dst`.
    pub fn load_method_address(&mut self, dst: Reg, target: Token) {
        self.asm().mov_ri64(dst, 0);
        let off = self.block.code.len() - 8;
        self.block.symbol_relocs.push(SymbolReloc {
            offset: off,
            symbol: target.symbol(),
            kind: RelocKind::Abs64,
        });
    }

    /// Materialize a stack entity into a register, allocating one if the
    /// entity is not already register-resident.
    pub fn materialize(&mut self, entity: StackEntity) -> Option<Reg> {
        match entity {
            StackEntity::Reg(r) => Some(r),
            StackEntity::Const(v) => {
                let r = self.state.regs.alloc_temp()?;
                self.load_const(r, v);
                Some(r)
            }
            StackEntity::MethodAddress(t) => {
                let r = self.state.regs.alloc_temp()?;
                self.load_method_address(r, t);
                Some(r)
            }
        }
    }

    pub fn move_reg(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.asm().mov_rr(dst, src);
        }
    }

    /// TEST reg, reg — encodes the flag set for a conditional terminator.
    pub fn test_reg(&mut self, reg: Reg) {
        self.asm().test_rr(reg, reg);
    }

    /// CMP + SETcc + MOVZX, result register reused from `lhs`.
    pub fn cmp_set(&mut self, cond: Cond, lhs: Reg, rhs: Reg) {
        self.asm().cmp_rr(lhs, rhs);
        self.asm().setcc(cond, lhs);
        self.asm().movzx_r64_r8(lhs, lhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleId, TableKind};

    fn method_token() -> Token {
        Token::build(ModuleId(0), TableKind::Method, 1)
    }

    #[test]
    fn test_jump_reloc_offsets() {
        let mut b = BasicBlock::new(BlockId(0));
        b.emit_jump(BlockId(8), JumpKind::Rel8);
        assert_eq!(b.code, [0xEB, 0x00]);
        assert_eq!(b.block_relocs[0].offset, 1);

        b.emit_jcc(Cond::E, BlockId(16), JumpKind::Rel32);
        assert_eq!(&b.code[2..4], [0x0F, 0x84]);
        assert_eq!(b.block_relocs[1].offset, 4);
    }

    #[test]
    fn test_call_symbol_records_rel32() {
        let mut b = BasicBlock::new(BlockId(0));
        let mut s = MethodBlock::new(BlockId(0), Reg::Rbp);
        let mut cg = Codegen::new(&mut b, &mut s, 0);
        cg.call_symbol(method_token());
        assert_eq!(b.code[0], 0xE8);
        assert_eq!(b.symbol_relocs[0].offset, 1);
        assert_eq!(b.symbol_relocs[0].kind, RelocKind::Rel32);
        assert_eq!(b.symbol_relocs[0].symbol, method_token().symbol());
    }

    #[test]
    fn test_load_method_address_records_abs64() {
        let mut b = BasicBlock::new(BlockId(0));
        let mut s = MethodBlock::new(BlockId(0), Reg::Rbp);
        let mut cg = Codegen::new(&mut b, &mut s, 0);
        cg.load_method_address(Reg::Rcx, method_token());
        assert_eq!(b.symbol_relocs[0].offset, 2);
        assert_eq!(b.symbol_relocs[0].kind, RelocKind::Abs64);
        assert_eq!(b.code.len(), 10);
    }

    #[test]
    fn test_frame_displacements() {
        let mut b = BasicBlock::new(BlockId(0));
        let mut s = MethodBlock::new(BlockId(0), Reg::Rbp);
        let cg = Codegen::new(&mut b, &mut s, 24);
        assert_eq!(cg.local_disp(0), -24);
        assert_eq!(cg.local_disp(16), -8);
        assert_eq!(cg.arg_disp(0), 16);
        assert_eq!(cg.arg_disp(8), 24);
    }

    #[test]
    fn test_push_arg_tracks_watermark() {
        let mut b = BasicBlock::new(BlockId(0));
        let mut s = MethodBlock::new(BlockId(0), Reg::Rbp);
        let mut cg = Codegen::new(&mut b, &mut s, 0);
        cg.push_arg(StackEntity::Const(1));
        cg.push_arg(StackEntity::Reg(Reg::Rcx));
        assert_eq!(s.max_temp_stack, 16);
    }

    #[test]
    fn test_take_blocks_partitions() {
        let mut pass = FirstPass::new(false, 0, 0);
        pass.insert(BasicBlock::new(BlockId(0)));
        pass.insert(BasicBlock::new(BlockId(10)));
        pass.insert(BasicBlock::new(BlockId(20)));
        let moved = pass.take_blocks(|id| id.0 >= 10);
        assert_eq!(moved.len(), 2);
        assert!(pass.has_block(BlockId(0)));
        assert!(!pass.has_block(BlockId(10)));
    }
}
