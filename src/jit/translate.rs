//! Baseline bytecode translation.
//!
//! One instruction in, a handful of native instructions out. The translator
//! holds no cross-instruction state beyond the block's evaluation stack and
//! register file; anything smarter belongs to an optimizing pipeline this
//! compiler deliberately does not have.

use crate::error::TranslateError;
use crate::jit::block::StackEntity;
use crate::jit::firstpass::Codegen;
use crate::jit::x86_64::{Cond, Reg};
use crate::frame::{ArgSlots, LocalSlots};
use crate::model::{ModuleId, RawToken, Token, TypeKind};
use crate::resolve::{CallConv, CompileEnv};

// opcode bytes (ECMA-335 partition III subset)
const NOP: u8 = 0x00;
const LDARG_0: u8 = 0x02;
const LDLOC_0: u8 = 0x06;
const STLOC_0: u8 = 0x0A;
const LDARG_S: u8 = 0x0E;
const STARG_S: u8 = 0x10;
const LDLOC_S: u8 = 0x11;
const STLOC_S: u8 = 0x13;
const LDNULL: u8 = 0x14;
const LDC_I4_M1: u8 = 0x15;
const LDC_I4_0: u8 = 0x16;
const LDC_I4_8: u8 = 0x1E;
const LDC_I4_S: u8 = 0x1F;
const LDC_I4: u8 = 0x20;
const DUP: u8 = 0x25;
const POP: u8 = 0x26;
const CALL: u8 = 0x28;
const RET: u8 = 0x2A;
const BR_S: u8 = 0x2B;
const BRFALSE_S: u8 = 0x2C;
const BRTRUE_S: u8 = 0x2D;
const BR: u8 = 0x38;
const BRFALSE: u8 = 0x39;
const BRTRUE: u8 = 0x3A;
const ADD: u8 = 0x58;
const SUB: u8 = 0x59;
const MUL: u8 = 0x5A;
const ENDFINALLY: u8 = 0xDC;
const LEAVE: u8 = 0xDD;
const LEAVE_S: u8 = 0xDE;
const PREFIX_FE: u8 = 0xFE;
const FE_CEQ: u8 = 0x01;
const FE_CGT: u8 = 0x02;
const FE_CLT: u8 = 0x04;

/// Seekable cursor over a method body.
pub struct BytecodeReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeReader<'a> {
    pub fn new(body: &'a [u8]) -> BytecodeReader<'a> {
        BytecodeReader { body, pos: 0 }
    }

    pub fn pos(&self) -> u32 {
        self.pos as u32
    }

    pub fn len(&self) -> u32 {
        self.body.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.body.len()
    }

    pub fn seek(&mut self, offset: u32) {
        self.pos = offset as usize;
    }

    pub fn read_u8(&mut self) -> Result<u8, TranslateError> {
        let b = *self
            .body
            .get(self.pos)
            .ok_or(TranslateError::TruncatedBody)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_i8(&mut self) -> Result<i8, TranslateError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u32(&mut self) -> Result<u32, TranslateError> {
        if self.pos + 4 > self.body.len() {
            return Err(TranslateError::TruncatedBody);
        }
        let v = u32::from_le_bytes([
            self.body[self.pos],
            self.body[self.pos + 1],
            self.body[self.pos + 2],
            self.body[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, TranslateError> {
        Ok(self.read_u32()? as i32)
    }
}

/// What one translated instruction did to control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Branch { target: u32 },
    /// Flag test already emitted; the block seals with a conditional
    /// terminator toward `target`
    CondBranch { target: u32, when_zero: bool },
    Return,
    /// `leave`: exits every protected region toward `target` with an empty
    /// evaluation stack
    Leave { target: u32 },
    /// `endfinally`: returns from the enclosing handler helper
    EndHandler,
}

fn branch_target(reader: &BytecodeReader, rel: i32) -> Result<u32, TranslateError> {
    let target = reader.pos() as i64 + rel as i64;
    if target < 0 || target as u32 >= reader.len() {
        return Err(TranslateError::BadBranchTarget(target as u32));
    }
    Ok(target as u32)
}

/// Byte offsets that must start a basic block: every branch target. Run
/// before any code is emitted so a target discovered late never lands in
/// the middle of an already-compiled block.
pub fn scan_branch_targets(body: &[u8]) -> Result<Vec<u32>, TranslateError> {
    let mut reader = BytecodeReader::new(body);
    let mut targets = Vec::new();
    while !reader.at_end() {
        let op = reader.read_u8()?;
        match op {
            BR_S | BRFALSE_S | BRTRUE_S | LEAVE_S => {
                let rel = reader.read_i8()? as i32;
                targets.push(branch_target(&reader, rel)?);
            }
            BR | BRFALSE | BRTRUE | LEAVE => {
                let rel = reader.read_i32()?;
                targets.push(branch_target(&reader, rel)?);
            }
            LDARG_S | STARG_S | LDLOC_S | STLOC_S | LDC_I4_S => {
                reader.read_u8()?;
            }
            LDC_I4 | CALL => {
                reader.read_u32()?;
            }
            PREFIX_FE => {
                reader.read_u8()?;
            }
            _ => {}
        }
    }
    targets.sort_unstable();
    targets.dedup();
    Ok(targets)
}

fn load_slot(
    cg: &mut Codegen,
    disp: i32,
) -> Result<StepOutcome, TranslateError> {
    let reg = cg
        .state
        .regs
        .alloc_temp()
        .ok_or(TranslateError::RegisterPressure)?;
    cg.load_frame(reg, disp);
    cg.state.stack.push(StackEntity::Reg(reg));
    Ok(StepOutcome::Continue)
}

fn store_slot(cg: &mut Codegen, disp: i32) -> Result<StepOutcome, TranslateError> {
    let entity = cg.state.stack.pop().ok_or(TranslateError::StackUnderflow)?;
    match entity {
        StackEntity::Const(v) => {
            if let Ok(imm) = i32::try_from(v) {
                cg.store_const_to_frame(disp, imm);
            } else {
                let reg = cg
                    .state
                    .regs
                    .alloc_temp()
                    .ok_or(TranslateError::RegisterPressure)?;
                cg.load_const(reg, v);
                cg.store_frame(disp, reg);
                cg.state.regs.free(reg);
            }
        }
        entity => {
            let reg = cg
                .materialize(entity)
                .ok_or(TranslateError::RegisterPressure)?;
            cg.store_frame(disp, reg);
            cg.state.regs.free(reg);
        }
    }
    Ok(StepOutcome::Continue)
}

fn local_disp(cg: &Codegen, locals: &LocalSlots, index: usize) -> Result<i32, TranslateError> {
    let slot = locals
        .get(index)
        .ok_or(TranslateError::BadBranchTarget(index as u32))?;
    Ok(cg.local_disp(slot.offset))
}

fn arg_disp(cg: &Codegen, args: &ArgSlots, index: usize) -> Result<i32, TranslateError> {
    let slot = args
        .get(index)
        .ok_or(TranslateError::BadBranchTarget(index as u32))?;
    Ok(cg.arg_disp(slot.offset))
}

fn binary_op(
    cg: &mut Codegen,
    op: impl FnOnce(&mut Codegen, Reg, Reg),
) -> Result<StepOutcome, TranslateError> {
    let rhs = cg.state.stack.pop().ok_or(TranslateError::StackUnderflow)?;
    let lhs = cg.state.stack.pop().ok_or(TranslateError::StackUnderflow)?;
    let rhs = cg.materialize(rhs).ok_or(TranslateError::RegisterPressure)?;
    let lhs = cg.materialize(lhs).ok_or(TranslateError::RegisterPressure)?;
    op(cg, lhs, rhs);
    cg.state.regs.free(rhs);
    cg.state.stack.push(StackEntity::Reg(lhs));
    Ok(StepOutcome::Continue)
}

fn compare_op(cg: &mut Codegen, cond: Cond) -> Result<StepOutcome, TranslateError> {
    binary_op(cg, |cg, lhs, rhs| cg.cmp_set(cond, lhs, rhs))
}

fn emit_call(
    cg: &mut Codegen,
    env: &CompileEnv,
    module: ModuleId,
    raw: u32,
) -> Result<StepOutcome, TranslateError> {
    let callee = Token::new(module, RawToken(raw));
    let desc = env
        .methods
        .load_method(callee)
        .map_err(|_| TranslateError::UnknownCallee(callee))?;

    let argc = desc.sig.params.len() + desc.sig.has_this as usize;
    let mut freed = Vec::with_capacity(argc);
    // evaluation-stack top is the last argument; pushing top-first leaves
    // the first argument at [rsp], as both conventions expect
    for _ in 0..argc {
        let entity = cg.state.stack.pop().ok_or(TranslateError::StackUnderflow)?;
        if let StackEntity::Reg(r) = entity {
            freed.push(r);
        }
        cg.push_arg(entity);
    }
    cg.call_symbol(callee);
    let arg_bytes = (argc * 8) as u32;
    match desc.sig.call_conv {
        CallConv::Cdecl => cg.revert_stack(arg_bytes),
        CallConv::Stdcall => cg.state.pop_arg_bytes(arg_bytes),
    }
    for r in freed {
        cg.state.regs.free(r);
    }
    if desc.sig.ret.kind != TypeKind::Void {
        let reg = cg
            .state
            .regs
            .alloc_temp()
            .ok_or(TranslateError::RegisterPressure)?;
        cg.move_reg(reg, Reg::Rax);
        cg.state.stack.push(StackEntity::Reg(reg));
    }
    Ok(StepOutcome::Continue)
}

/// Translate the instruction at the reader's position into `cg`'s block.
pub fn step(
    reader: &mut BytecodeReader,
    cg: &mut Codegen,
    locals: &LocalSlots,
    args: &ArgSlots,
    env: &CompileEnv,
    module: ModuleId,
) -> Result<StepOutcome, TranslateError> {
    let op = reader.read_u8()?;
    match op {
        NOP => Ok(StepOutcome::Continue),

        op if (LDARG_0..LDARG_0 + 4).contains(&op) => {
            let disp = arg_disp(cg, args, (op - LDARG_0) as usize)?;
            load_slot(cg, disp)
        }
        LDARG_S => {
            let index = reader.read_u8()? as usize;
            let disp = arg_disp(cg, args, index)?;
            load_slot(cg, disp)
        }
        STARG_S => {
            let index = reader.read_u8()? as usize;
            let disp = arg_disp(cg, args, index)?;
            store_slot(cg, disp)
        }

        op if (LDLOC_0..LDLOC_0 + 4).contains(&op) => {
            let disp = local_disp(cg, locals, (op - LDLOC_0) as usize)?;
            load_slot(cg, disp)
        }
        LDLOC_S => {
            let index = reader.read_u8()? as usize;
            let disp = local_disp(cg, locals, index)?;
            load_slot(cg, disp)
        }
        op if (STLOC_0..STLOC_0 + 4).contains(&op) => {
            let disp = local_disp(cg, locals, (op - STLOC_0) as usize)?;
            store_slot(cg, disp)
        }
        STLOC_S => {
            let index = reader.read_u8()? as usize;
            let disp = local_disp(cg, locals, index)?;
            store_slot(cg, disp)
        }

        LDNULL => {
            cg.state.stack.push(StackEntity::Const(0));
            Ok(StepOutcome::Continue)
        }
        op if (LDC_I4_M1..=LDC_I4_8).contains(&op) => {
            cg.state
                .stack
                .push(StackEntity::Const(op as i64 - LDC_I4_0 as i64));
            Ok(StepOutcome::Continue)
        }
        LDC_I4_S => {
            let v = reader.read_i8()?;
            cg.state.stack.push(StackEntity::Const(v as i64));
            Ok(StepOutcome::Continue)
        }
        LDC_I4 => {
            let v = reader.read_i32()?;
            cg.state.stack.push(StackEntity::Const(v as i64));
            Ok(StepOutcome::Continue)
        }

        DUP => {
            let top = *cg.state.stack.peek().ok_or(TranslateError::StackUnderflow)?;
            match top {
                StackEntity::Reg(src) => {
                    let reg = cg
                        .state
                        .regs
                        .alloc_temp()
                        .ok_or(TranslateError::RegisterPressure)?;
                    cg.move_reg(reg, src);
                    cg.state.stack.push(StackEntity::Reg(reg));
                }
                other => cg.state.stack.push(other),
            }
            Ok(StepOutcome::Continue)
        }
        POP => {
            let entity = cg.state.stack.pop().ok_or(TranslateError::StackUnderflow)?;
            if let StackEntity::Reg(r) = entity {
                cg.state.regs.free(r);
            }
            Ok(StepOutcome::Continue)
        }

        CALL => {
            let raw = reader.read_u32()?;
            emit_call(cg, env, module, raw)
        }
        RET => {
            // a returned value travels in rax
            if let Some(entity) = cg.state.stack.pop() {
                match entity {
                    StackEntity::Const(v) => cg.load_const(Reg::Rax, v),
                    StackEntity::Reg(r) => {
                        cg.move_reg(Reg::Rax, r);
                        cg.state.regs.free(r);
                    }
                    StackEntity::MethodAddress(t) => cg.load_method_address(Reg::Rax, t),
                }
            }
            Ok(StepOutcome::Return)
        }

        ADD => binary_op(cg, |cg, lhs, rhs| {
            let mut asm = crate::jit::x86_64::Asm::new(&mut cg.block.code);
            asm.add_rr(lhs, rhs);
        }),
        SUB => binary_op(cg, |cg, lhs, rhs| {
            let mut asm = crate::jit::x86_64::Asm::new(&mut cg.block.code);
            asm.sub_rr(lhs, rhs);
        }),
        MUL => binary_op(cg, |cg, lhs, rhs| {
            let mut asm = crate::jit::x86_64::Asm::new(&mut cg.block.code);
            asm.imul_rr(lhs, rhs);
        }),

        BR_S => {
            let rel = reader.read_i8()? as i32;
            Ok(StepOutcome::Branch {
                target: branch_target(reader, rel)?,
            })
        }
        BR => {
            let rel = reader.read_i32()?;
            Ok(StepOutcome::Branch {
                target: branch_target(reader, rel)?,
            })
        }
        BRFALSE_S | BRTRUE_S | BRFALSE | BRTRUE => {
            let short = op == BRFALSE_S || op == BRTRUE_S;
            let rel = if short {
                reader.read_i8()? as i32
            } else {
                reader.read_i32()?
            };
            let target = branch_target(reader, rel)?;
            let entity = cg.state.stack.pop().ok_or(TranslateError::StackUnderflow)?;
            let reg = cg
                .materialize(entity)
                .ok_or(TranslateError::RegisterPressure)?;
            cg.test_reg(reg);
            cg.state.regs.free(reg);
            Ok(StepOutcome::CondBranch {
                target,
                when_zero: op == BRFALSE_S || op == BRFALSE,
            })
        }

        LEAVE_S => {
            let rel = reader.read_i8()? as i32;
            Ok(StepOutcome::Leave {
                target: branch_target(reader, rel)?,
            })
        }
        LEAVE => {
            let rel = reader.read_i32()?;
            Ok(StepOutcome::Leave {
                target: branch_target(reader, rel)?,
            })
        }
        ENDFINALLY => Ok(StepOutcome::EndHandler),

        PREFIX_FE => match reader.read_u8()? {
            FE_CEQ => compare_op(cg, Cond::E),
            FE_CGT => compare_op(cg, Cond::G),
            FE_CLT => compare_op(cg, Cond::L),
            ext => Err(TranslateError::UnsupportedOpcode(ext)),
        },

        op => Err(TranslateError::UnsupportedOpcode(op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::frame::FrameBuilder;
    use crate::jit::block::{BlockId, MethodBlock};
    use crate::jit::firstpass::BasicBlock;
    use crate::model::{ElementType, TableKind};
    use crate::resolve::{
        CallConv, FieldInfo, MethodDesc, MethodSig, MethodSource, ModuleArena, ModuleInfo,
        RuntimeHooks, TypeResolver,
    };

    struct WordSizes;

    impl TypeResolver for WordSizes {
        fn type_size(&self, _ty: &ElementType) -> u32 {
            8
        }
        fn fields_of(&self, _ty: Token) -> Vec<FieldInfo> {
            vec![]
        }
        fn base_of(&self, _ty: Token) -> Option<Token> {
            None
        }
        fn needs_member_teardown(&self, _ty: Token) -> bool {
            false
        }
    }

    struct NoMethods;

    impl MethodSource for NoMethods {
        fn load_method(&self, token: Token) -> Result<MethodDesc, CompileError> {
            Err(CompileError::MissingMethod(token))
        }
        fn static_initializer_of(&self, _ty: Token) -> Option<Token> {
            None
        }
    }

    fn env() -> CompileEnv {
        let mut modules = ModuleArena::new();
        let m = modules.add(ModuleInfo::new("test"));
        CompileEnv {
            modules,
            resolver: Box::new(WordSizes),
            methods: Box::new(NoMethods),
            hooks: RuntimeHooks {
                dec_obj: Token::build(m, TableKind::Internal, 1),
                register_routine: Token::build(m, TableKind::Internal, 2),
                unregister_routine: Token::build(m, TableKind::Internal, 3),
                current_exception: Token::build(m, TableKind::Internal, 4),
                framework_modules: vec![],
            },
        }
    }

    fn run(body: &[u8], locals: &LocalSlots, args: &ArgSlots) -> (BasicBlock, Vec<StepOutcome>) {
        let e = env();
        let mut block = BasicBlock::new(BlockId(0));
        let mut state = MethodBlock::new(BlockId(0), Reg::Rbp);
        let mut reader = BytecodeReader::new(body);
        let mut outcomes = Vec::new();
        while !reader.at_end() {
            let mut cg = Codegen::new(&mut block, &mut state, locals.total_size());
            let out = step(&mut reader, &mut cg, locals, args, &e, ModuleId(0)).unwrap();
            let done = out != StepOutcome::Continue;
            outcomes.push(out);
            if done {
                break;
            }
        }
        block.state = Some(state);
        (block, outcomes)
    }

    fn no_frame() -> (LocalSlots, ArgSlots) {
        let b = FrameBuilder::new(&WordSizes, 8);
        (
            b.layout_locals("t", &[]).unwrap(),
            b.layout_args("t", None, &[]).unwrap(),
        )
    }

    fn one_local() -> (LocalSlots, ArgSlots) {
        let b = FrameBuilder::new(&WordSizes, 8);
        (
            b.layout_locals("t", &[ElementType::simple(TypeKind::I4)])
                .unwrap(),
            b.layout_args("t", None, &[]).unwrap(),
        )
    }

    #[test]
    fn test_scan_finds_forward_and_backward_targets() {
        // 0: br.s +2 (-> 4); 2: nop nop; 4: br.s -4 (-> 2); 6: ret
        let body = [BR_S, 2, NOP, NOP, BR_S, 0xFC_u8, RET];
        let targets = scan_branch_targets(&body).unwrap();
        assert_eq!(targets, vec![2, 4]);
    }

    #[test]
    fn test_scan_rejects_out_of_range() {
        let body = [BR_S, 0x40, RET];
        assert!(matches!(
            scan_branch_targets(&body),
            Err(TranslateError::BadBranchTarget(_))
        ));
    }

    #[test]
    fn test_ldc_stloc_uses_constant_store() {
        let (locals, args) = one_local();
        let (block, _) = run(&[LDC_I4_0 + 5, STLOC_0], &locals, &args);
        // mov qword [rbp - 8], 5
        assert_eq!(
            block.code,
            [0x48, 0xC7, 0x45, 0xF8, 0x05, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_add_folds_through_registers() {
        let (locals, args) = one_local();
        let (block, outs) = run(&[LDLOC_0, LDC_I4_0 + 2, ADD, STLOC_0, RET], &locals, &args);
        assert_eq!(*outs.last().unwrap(), StepOutcome::Return);
        let state = block.state.unwrap();
        assert!(state.stack.is_empty());
        // all temps returned to the pool
        assert!(state.regs.is_free(Reg::Rcx));
        assert!(state.regs.is_free(Reg::Rdx));
    }

    #[test]
    fn test_return_value_lands_in_rax() {
        let (locals, args) = no_frame();
        let (block, outs) = run(&[LDC_I4_0 + 5, RET], &locals, &args);
        assert_eq!(*outs.last().unwrap(), StepOutcome::Return);
        // mov rax, 5
        assert_eq!(block.code, [0x48, 0xC7, 0xC0, 0x05, 0x00, 0x00, 0x00]);
        assert!(block.state.unwrap().stack.is_empty());
    }

    #[test]
    fn test_brtrue_emits_test_in_payload() {
        let (locals, args) = no_frame();
        let (block, outs) = run(&[LDC_I4_0 + 1, BRTRUE_S, 0, NOP], &locals, &args);
        assert_eq!(
            outs.last().unwrap(),
            &StepOutcome::CondBranch {
                target: 3,
                when_zero: false
            }
        );
        // payload ends with test rcx, rcx
        let n = block.code.len();
        assert_eq!(&block.code[n - 3..], [0x48, 0x85, 0xC9]);
    }

    #[test]
    fn test_stack_underflow_reported() {
        let e = env();
        let (locals, args) = no_frame();
        let mut block = BasicBlock::new(BlockId(0));
        let mut state = MethodBlock::new(BlockId(0), Reg::Rbp);
        let body = [POP];
        let mut reader = BytecodeReader::new(&body);
        let mut cg = Codegen::new(&mut block, &mut state, 0);
        let err = step(&mut reader, &mut cg, &locals, &args, &e, ModuleId(0)).unwrap_err();
        assert!(matches!(err, TranslateError::StackUnderflow));
    }

    #[test]
    fn test_unsupported_opcode_reported() {
        let e = env();
        let (locals, args) = no_frame();
        let mut block = BasicBlock::new(BlockId(0));
        let mut state = MethodBlock::new(BlockId(0), Reg::Rbp);
        let body = [0x5B]; // div
        let mut reader = BytecodeReader::new(&body);
        let mut cg = Codegen::new(&mut block, &mut state, 0);
        let err = step(&mut reader, &mut cg, &locals, &args, &e, ModuleId(0)).unwrap_err();
        assert!(matches!(err, TranslateError::UnsupportedOpcode(0x5B)));
    }

    #[test]
    fn test_unknown_callee_reported() {
        let e = env();
        let (locals, args) = no_frame();
        let mut block = BasicBlock::new(BlockId(0));
        let mut state = MethodBlock::new(BlockId(0), Reg::Rbp);
        let body = [CALL, 0x01, 0x00, 0x00, 0x06];
        let mut reader = BytecodeReader::new(&body);
        let mut cg = Codegen::new(&mut block, &mut state, 0);
        let err = step(&mut reader, &mut cg, &locals, &args, &e, ModuleId(0)).unwrap_err();
        assert!(matches!(err, TranslateError::UnknownCallee(_)));
    }

    #[test]
    fn test_leave_clears_toward_target() {
        let (locals, args) = no_frame();
        let body = [LEAVE_S, 1, NOP, RET];
        let (_, outs) = run(&body, &locals, &args);
        assert_eq!(outs.last().unwrap(), &StepOutcome::Leave { target: 3 });
    }
}
