//! Method compiler.
//!
//! Orchestrates one method's translation: frame layout, block worklist,
//! synthesized init/cleanup/registration blocks, exception-handler helpers,
//! jump-distance estimation and final linking. One compilation is
//! single-threaded; concurrency lives a level up, in the worker.

use std::sync::Arc;

use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::frame::{ArgSlots, FrameBuilder, LocalSlots};
use crate::jit::block::{BlockId, MethodBlock, StackEntity, Terminator};
use crate::jit::context::{CompileContext, HelperState};
use crate::jit::firstpass::{BasicBlock, Codegen, FirstPass, JumpKind};
use crate::jit::secondpass::{self, SecondPassBinary};
use crate::jit::translate::{self, BytecodeReader, StepOutcome};
use crate::jit::x86_64::{Asm, Cond, MAX_JUMP_BYTES, Reg};
use crate::model::{ElementType, ModuleId, TableKind, Token};
use crate::resolve::{CallConv, CompileEnv, MethodDesc};
use crate::util::crc64::crc64;

/// Register helpers park the parent frame pointer in.
const HELPER_BASE: Reg = Reg::Rbx;

/// Publication callback: every binary a compilation produces (main body,
/// helpers, cleanup routine) goes through here.
pub trait MethodSink {
    fn publish(
        &self,
        module_name: &str,
        signature: u64,
        token: Token,
        binary: &Arc<SecondPassBinary>,
        from_cache: bool,
    );
}

/// Cache signature of a synthesized routine, keyed by its token alone; the
/// routine has no declared shape of its own.
pub fn synthetic_signature(token: Token) -> u64 {
    crc64(&token.raw.0.to_le_bytes())
}

pub struct MethodCompiler<'a> {
    env: &'a CompileEnv,
    config: &'a CompilerConfig,
    sink: &'a dyn MethodSink,
}

impl<'a> MethodCompiler<'a> {
    pub fn new(
        env: &'a CompileEnv,
        config: &'a CompilerConfig,
        sink: &'a dyn MethodSink,
    ) -> MethodCompiler<'a> {
        MethodCompiler { env, config, sink }
    }

    fn trace(&self, msg: std::fmt::Arguments) {
        if self.config.trace {
            eprintln!("[jit] {}", msg);
        }
    }

    /// Compile one method into a relocatable binary. Helpers and the
    /// cleanup routine are published through the sink as a side effect;
    /// the main binary is returned for the caller to publish.
    pub fn compile(&self, token: Token) -> CompileResult<Arc<SecondPassBinary>> {
        let desc = self.env.methods.load_method(token)?;
        let module_name = self.env.modules.name_of(token.module)?.to_string();

        // bodyless declaration: nothing to translate
        if desc.body.is_empty() {
            return Ok(Arc::new(SecondPassBinary::empty(&desc.name)));
        }
        self.trace(format_args!("compiling {} ({})", desc.name, token));

        let builder = FrameBuilder::new(self.env.resolver.as_ref(), self.config.machine.word);
        let locals = builder.layout_locals(&desc.name, &desc.locals)?;
        let this_ty = if desc.sig.has_this {
            Some(match desc.parent_type {
                Some(t) => ElementType::class(t),
                None => ElementType::simple(crate::model::TypeKind::Object),
            })
        } else {
            None
        };
        let args = builder.layout_args(&desc.name, this_ty, &desc.sig.params)?;

        let mut ctx = CompileContext::new(desc.body.len());
        ctx.cleanup_token = self.cleanup_token_for(token, &desc, &locals, &args)?;

        // forced boundaries must be known before any block is compiled
        for target in
            translate::scan_branch_targets(&desc.body).map_err(|cause| CompileError::Translate {
                method: desc.name.clone(),
                offset: 0,
                cause,
            })?
        {
            ctx.split.set(target as usize);
        }

        let stdcall = desc.sig.call_conv == CallConv::Stdcall;
        let mut pass = FirstPass::new(stdcall, locals.total_size(), args.total_size());
        self.emit_init_objects(&mut pass, &desc, &locals);
        if !ctx.cleanup_token.is_unresolved() && self.config.exception_handling {
            self.emit_register_cleanup(&mut pass, ctx.cleanup_token);
        }

        let mut helpers = self.allocate_helpers(token, &desc)?;

        ctx.enqueue(MethodBlock::new(BlockId::from_offset(0), Reg::Rbp));
        drain_worklist(
            self.env,
            token.module,
            &desc,
            &locals,
            &args,
            &mut pass,
            &mut ctx,
            None,
        )?;

        for index in 0..helpers.len() {
            self.compile_helper(token, &desc, &locals, &args, &mut pass, &ctx, &mut helpers, index)?;
        }

        emit_frame_blocks(&mut pass, Reg::Rbp, self.env);
        estimate_encoding(&mut pass, self.config.machine.short_jump_threshold);
        let mut binary = secondpass::link(&pass, BlockId::RET, Vec::new(), &desc.name)?;

        // export attribute: declared name copied into debug metadata; a
        // missing argument is tolerated
        if let Some(attr) = desc.attribute("Export") {
            binary.debug.export_name = attr.args.first().cloned();
        }

        if !ctx.cleanup_token.is_unresolved() {
            let cleanup = self.compile_cleanup(token, &desc, &locals, &args)?;
            self.sink.publish(
                &module_name,
                synthetic_signature(ctx.cleanup_token),
                ctx.cleanup_token,
                &Arc::new(cleanup),
                false,
            );
        }
        for helper in &helpers {
            if let Some(bin) = &helper.binary {
                self.sink.publish(
                    &module_name,
                    synthetic_signature(helper.token),
                    helper.token,
                    bin,
                    false,
                );
            }
        }

        self.trace(format_args!(
            "{}: {} bytes, {} blocks, {} helpers, {} argument-stack bytes",
            desc.name,
            binary.code.len(),
            pass.blocks.len(),
            helpers.len(),
            pass.max_temp_stack()
        ));
        Ok(Arc::new(binary))
    }

    /// A cleanup routine is needed when any local holds a heap reference
    /// (directly or through a value-type field), when a non-"this" argument
    /// does and the method is not runtime-internal, or when the method is a
    /// finalizer of a type needing member teardown. The identity is
    /// allocated up front: the body may reference it before it is emitted.
    fn cleanup_token_for(
        &self,
        token: Token,
        desc: &MethodDesc,
        locals: &LocalSlots,
        args: &ArgSlots,
    ) -> CompileResult<Token> {
        let resolver = self.env.resolver.as_ref();
        let cleanup_locals = locals.count_objects_deep(resolver) > 0
            || (args.count_objects() > 0 && !self.env.hooks.is_framework_method(token));
        let cleanup_class = self.env.hooks.is_finalizer(desc)
            && desc
                .parent_type
                .is_some_and(|t| resolver.needs_member_teardown(t));
        if cleanup_locals || cleanup_class {
            self.env
                .modules
                .alloc_synthetic(token.module, TableKind::Helper)
        } else {
            Ok(Token::unresolved())
        }
    }

    /// Zero-fill of object locals when the body requests it. One object
    /// local gets a single constant store; several share one zero register.
    fn emit_init_objects(&self, pass: &mut FirstPass, desc: &MethodDesc, locals: &LocalSlots) {
        if !desc.init_locals || locals.count_objects() == 0 {
            return;
        }
        let mut block = BasicBlock::new(BlockId::INIT_OBJECTS);
        let mut state = MethodBlock::new(BlockId::INIT_OBJECTS, Reg::Rbp);
        let object_count = locals.count_objects();
        {
            let mut cg = Codegen::new(&mut block, &mut state, pass.locals_size);
            if object_count == 1 {
                let index = locals.first_object().unwrap_or(0);
                if let Some(slot) = locals.get(index) {
                    let disp = cg.local_disp(slot.offset);
                    cg.store_const_to_frame(disp, 0);
                }
            } else {
                // one register load amortized across every store
                let mut asm = Asm::new(&mut cg.block.code);
                asm.xor_rr(Reg::Rax, Reg::Rax);
                let disps: Vec<i32> = locals
                    .iter()
                    .filter(|s| s.ty.is_object_and_not_value_type())
                    .map(|s| cg.local_disp(s.offset))
                    .collect();
                for disp in disps {
                    cg.store_frame(disp, Reg::Rax);
                }
            }
        }
        state.terminator = Terminator::Fallthrough;
        block.state = Some(state);
        pass.insert(block);
    }

    /// Register the cleanup routine's address and the frame pointer on the
    /// process-wide unwind stack.
    fn emit_register_cleanup(&self, pass: &mut FirstPass, cleanup: Token) {
        let mut block = BasicBlock::new(BlockId::REG_CLEANUP);
        let mut state = MethodBlock::new(BlockId::REG_CLEANUP, Reg::Rbp);
        {
            let mut cg = Codegen::new(&mut block, &mut state, pass.locals_size);
            // registerRoutine(fn, framePtr): first argument lands at [rsp]
            cg.push_arg(StackEntity::Reg(Reg::Rbp));
            cg.push_arg(StackEntity::MethodAddress(cleanup));
            cg.call_symbol(self.env.hooks.register_routine);
            cg.revert_stack(16);
        }
        state.terminator = Terminator::Fallthrough;
        block.state = Some(state);
        pass.insert(block);
    }

    fn allocate_helpers(&self, token: Token, desc: &MethodDesc) -> CompileResult<Vec<HelperState>> {
        if !self.config.exception_handling {
            return Ok(Vec::new());
        }
        let mut helpers = Vec::with_capacity(desc.clauses.len());
        for clause in &desc.clauses {
            helpers.push(HelperState {
                clause: clause.clone(),
                token: self
                    .env
                    .modules
                    .alloc_synthetic(token.module, TableKind::Helper)?,
                parent: token,
                binary: None,
            });
        }
        // nesting: a clause whose try start falls inside another clause's
        // try range resolves enclosing references through that helper
        for i in 0..helpers.len() {
            let start = helpers[i].clause.try_offset;
            let mut parent = token;
            let mut best_len = u32::MAX;
            for j in 0..helpers.len() {
                if i != j
                    && helpers[j].clause.protects(start)
                    && helpers[j].clause.try_length < best_len
                {
                    best_len = helpers[j].clause.try_length;
                    parent = helpers[j].token;
                }
            }
            helpers[i].parent = parent;
        }
        Ok(helpers)
    }

    /// Compile one clause's handler as an independent `(framePtr) -> void`
    /// function. Body blocks are compiled into the parent's first pass
    /// through the shared worklist machinery, then moved into the helper's
    /// own pass and linked with a resolve chain through every enclosing
    /// scope.
    #[allow(clippy::too_many_arguments)]
    fn compile_helper(
        &self,
        method_token: Token,
        desc: &MethodDesc,
        locals: &LocalSlots,
        args: &ArgSlots,
        pass: &mut FirstPass,
        ctx: &CompileContext,
        helpers: &mut Vec<HelperState>,
        index: usize,
    ) -> CompileResult<()> {
        let clause = helpers[index].clause.clone();
        let helper_token = helpers[index].token;
        let name = format!("{}@handler_{:x}", desc.name, clause.handler_offset);

        // entry: park the frame pointer argument, then for catch/filter
        // fetch the in-flight exception before any handler instruction
        let mut entry = BasicBlock::new(BlockId::INIT_OBJECTS);
        let mut entry_state = MethodBlock::new(BlockId::INIT_OBJECTS, HELPER_BASE);
        entry_state.regs.reserve(HELPER_BASE);
        {
            let mut cg = Codegen::new(&mut entry, &mut entry_state, pass.locals_size);
            let mut asm = Asm::new(&mut cg.block.code);
            asm.mov_rm(HELPER_BASE, Reg::Rbp, 16);
            if clause.kind.receives_exception() {
                cg.call_symbol(self.env.hooks.current_exception);
                let reg = cg.state.regs.alloc_temp().ok_or_else(|| {
                    CompileError::Internal(format!("{}: no register for exception entry", name))
                })?;
                cg.move_reg(reg, Reg::Rax);
                cg.state.stack.push(StackEntity::Reg(reg));
            }
        }
        entry_state.terminator = Terminator::Fallthrough;

        let mut root = entry_state.fork(BlockId::from_offset(clause.handler_offset));
        root.base_ptr = HELPER_BASE;

        let mut helper_ctx = ctx.for_helper();
        helper_ctx.enqueue(root);
        drain_worklist(
            self.env,
            method_token.module,
            desc,
            locals,
            args,
            pass,
            &mut helper_ctx,
            Some((
                clause.handler_offset,
                clause.handler_offset + clause.handler_length,
            )),
        )?;

        // lift the helper's blocks out of the parent's first pass
        let compiled = helper_ctx.compiled.clone();
        let moved = pass.take_blocks(|id| compiled.contains(&id) && !ctx.is_compiled(id));
        // the helper reuses the parent frame, so its own pass allocates none
        let mut helper_pass = FirstPass::new(false, 0, 0);
        entry.state = Some(entry_state);
        helper_pass.insert(entry);
        for block in moved {
            helper_pass.insert(block);
        }

        emit_frame_blocks(&mut helper_pass, HELPER_BASE, self.env);
        estimate_encoding(&mut helper_pass, self.config.machine.short_jump_threshold);

        // resolve chain: ancestor helpers innermost first, then the method
        let mut chain = Vec::new();
        let mut parent = helpers[index].parent;
        while parent != method_token {
            chain.push(parent.symbol());
            parent = helpers
                .iter()
                .find(|h| h.token == parent)
                .map(|h| h.parent)
                .unwrap_or(method_token);
        }
        chain.push(method_token.symbol());

        debug_assert_eq!(helpers[index].token, helper_token);
        let binary = secondpass::link(&helper_pass, BlockId::RET, chain, &name)?;
        helpers[index].binary = Some(Arc::new(binary));
        Ok(())
    }

    /// The cleanup routine: `(framePtr) -> void`, dereferencing every heap
    /// reference the frame owns, then (for finalizers) every object member
    /// of the type through the "this" pointer alone.
    fn compile_cleanup(
        &self,
        token: Token,
        desc: &MethodDesc,
        locals: &LocalSlots,
        args: &ArgSlots,
    ) -> CompileResult<SecondPassBinary> {
        let resolver = self.env.resolver.as_ref();
        let name = format!("{}@cleanup", desc.name);
        // the routine walks the parent frame through its pointer argument
        // and allocates no locals of its own
        let mut pass = FirstPass::new(false, 0, 0);

        let mut block = BasicBlock::new(BlockId::from_offset(0));
        let mut state = MethodBlock::new(BlockId::from_offset(0), HELPER_BASE);
        state.regs.reserve(HELPER_BASE);
        {
            let mut cg = Codegen::new(&mut block, &mut state, locals.total_size());
            Asm::new(&mut cg.block.code).mov_rm(HELPER_BASE, Reg::Rbp, 16);

            let mut frame_refs: Vec<i32> = Vec::new();
            for slot in locals.iter() {
                collect_ref_disps(
                    &slot.ty,
                    cg.local_disp(slot.offset),
                    resolver,
                    &mut frame_refs,
                );
            }
            if !self.env.hooks.is_framework_method(token) {
                for (_, slot) in args.explicit() {
                    collect_ref_disps(
                        &slot.ty,
                        cg.arg_disp(slot.offset),
                        resolver,
                        &mut frame_refs,
                    );
                }
            }
            for disp in frame_refs {
                emit_dec_ref(&mut cg, self.env, HELPER_BASE, disp);
            }

            // finalizer of a teardown type: members via "this" only
            if self.env.hooks.is_finalizer(desc) {
                if let Some(ty) = desc.parent_type.filter(|&t| resolver.needs_member_teardown(t)) {
                    let this_disp = cg.arg_disp(0);
                    Asm::new(&mut cg.block.code).mov_rm(Reg::R12, HELPER_BASE, this_disp);
                    cg.state.regs.reserve(Reg::R12);
                    for offset in member_ref_offsets(ty, resolver) {
                        emit_dec_ref(&mut cg, self.env, Reg::R12, offset as i32);
                    }
                }
            }
        }
        state.terminator = Terminator::Fallthrough;
        block.state = Some(state);
        pass.insert(block);

        emit_frame_blocks(&mut pass, HELPER_BASE, self.env);
        estimate_encoding(&mut pass, self.config.machine.short_jump_threshold);
        secondpass::link(&pass, BlockId::RET, vec![token.symbol()], &name)
    }

    /// Synthesized instance destructor for a type: dereferences every
    /// object member, including inherited ones.
    pub fn compile_instance_destructor(&self, ty: Token) -> CompileResult<Arc<SecondPassBinary>> {
        let resolver = self.env.resolver.as_ref();
        let name = format!("{}@dtor", ty);
        let mut pass = FirstPass::new(false, 0, 8);

        let mut block = BasicBlock::new(BlockId::from_offset(0));
        let mut state = MethodBlock::new(BlockId::from_offset(0), HELPER_BASE);
        state.regs.reserve(HELPER_BASE);
        {
            let mut cg = Codegen::new(&mut block, &mut state, 0);
            // "this" into the nonvolatile base so it survives every call
            Asm::new(&mut cg.block.code).mov_rm(HELPER_BASE, Reg::Rbp, 16);
            for offset in member_ref_offsets(ty, resolver) {
                emit_dec_ref(&mut cg, self.env, HELPER_BASE, offset as i32);
            }
        }
        state.terminator = Terminator::Fallthrough;
        block.state = Some(state);
        pass.insert(block);

        emit_frame_blocks(&mut pass, HELPER_BASE, self.env);
        estimate_encoding(&mut pass, self.config.machine.short_jump_threshold);
        Ok(Arc::new(secondpass::link(
            &pass,
            BlockId::RET,
            Vec::new(),
            &name,
        )?))
    }

    /// Synthesized static-constructor wrapper: runs the type's initializer
    /// at most once, guarded by a synthetic flag cell.
    pub fn compile_cctor_wrapper(&self, ty: Token) -> CompileResult<Arc<SecondPassBinary>> {
        let name = format!("{}@cctor", ty);
        let Some(cctor) = self.env.methods.static_initializer_of(ty) else {
            return Ok(Arc::new(SecondPassBinary::empty(&name)));
        };
        let flag = self
            .env
            .modules
            .alloc_synthetic(ty.module, TableKind::StaticData)?;

        let mut pass = FirstPass::new(false, 0, 0);
        let mut block = BasicBlock::new(BlockId::from_offset(0));
        let mut state = MethodBlock::new(BlockId::from_offset(0), Reg::Rbp);
        {
            let mut cg = Codegen::new(&mut block, &mut state, 0);
            cg.load_method_address(Reg::Rax, flag);
            let mut asm = Asm::new(&mut cg.block.code);
            asm.mov_rm(Reg::Rcx, Reg::Rax, 0);
            asm.test_rr(Reg::Rcx, Reg::Rcx);
            // skip over the flag store (7 bytes) and the call (5 bytes)
            asm.jcc_rel8(Cond::Ne, 12);
            // flag set before the call so a recursive entry short-circuits
            asm.mov_mi32(Reg::Rax, 0, 1);
            cg.call_symbol(cctor);
        }
        state.terminator = Terminator::Fallthrough;
        block.state = Some(state);
        pass.insert(block);

        emit_frame_blocks(&mut pass, Reg::Rbp, self.env);
        estimate_encoding(&mut pass, self.config.machine.short_jump_threshold);
        Ok(Arc::new(secondpass::link(
            &pass,
            BlockId::RET,
            Vec::new(),
            &name,
        )?))
    }
}

/// Frame displacements of every heap reference stored in one slot of type
/// `ty` at `disp`: the slot itself, or object fields of a value type.
fn collect_ref_disps(
    ty: &ElementType,
    disp: i32,
    resolver: &dyn crate::resolve::TypeResolver,
    out: &mut Vec<i32>,
) {
    if ty.is_object_and_not_value_type() {
        out.push(disp);
        return;
    }
    if !ty.is_object() {
        return;
    }
    let Some(class) = ty.class_token else { return };
    for field in resolver.fields_of(class) {
        collect_ref_disps(&field.ty, disp + field.offset as i32, resolver, out);
    }
}

/// Offsets of object members of a type, base chain included.
fn member_ref_offsets(ty: Token, resolver: &dyn crate::resolve::TypeResolver) -> Vec<u32> {
    let mut offsets = Vec::new();
    let mut current = Some(ty);
    while let Some(t) = current {
        for field in resolver.fields_of(t) {
            if field.ty.is_object_and_not_value_type() {
                offsets.push(field.offset);
            }
        }
        current = resolver.base_of(t);
    }
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

/// One reference-drop call: load the slot, pass it, revert the argument.
fn emit_dec_ref(cg: &mut Codegen, env: &CompileEnv, base: Reg, disp: i32) {
    Asm::new(&mut cg.block.code).mov_rm(Reg::Rax, base, disp);
    cg.push_arg(StackEntity::Reg(Reg::Rax));
    cg.call_symbol(env.hooks.dec_obj);
    cg.revert_stack(8);
}

/// Drain the pending-block worklist until empty.
///
/// A block id popped twice merges its temp-stack bookkeeping into the
/// compiled block instead of recompiling. Translation stops at forced
/// boundaries (the continuation is forked forward) or at an instruction
/// that ends the block naturally.
#[allow(clippy::too_many_arguments)]
fn drain_worklist(
    env: &CompileEnv,
    module: ModuleId,
    desc: &MethodDesc,
    locals: &LocalSlots,
    args: &ArgSlots,
    pass: &mut FirstPass,
    ctx: &mut CompileContext,
    handler_range: Option<(u32, u32)>,
) -> CompileResult<()> {
    while let Some(mut state) = ctx.worklist.pop_front() {
        let id = state.id;
        if ctx.is_compiled(id) {
            if let Some(existing) = pass.get_mut(id).and_then(|b| b.state.as_mut()) {
                existing.merge_temp_stack(&state);
            }
            continue;
        }
        let start = id.offset().ok_or_else(|| {
            CompileError::Internal(format!("{}: synthetic block {:?} on worklist", desc.name, id))
        })?;

        let mut block = BasicBlock::new(id);
        let mut reader = BytecodeReader::new(&desc.body);
        reader.seek(start);

        let terminator = loop {
            let offset = reader.pos();
            if reader.at_end() {
                break Terminator::Return;
            }
            if offset != start && ctx.is_forced_boundary(offset) {
                let next = state.fork(BlockId::from_offset(offset));
                ctx.enqueue(next);
                break Terminator::Fallthrough;
            }

            let mut cg = Codegen::new(&mut block, &mut state, pass.locals_size);
            let outcome = translate::step(&mut reader, &mut cg, locals, args, env, module)
                .map_err(|cause| CompileError::Translate {
                    method: desc.name.clone(),
                    offset,
                    cause,
                })?;
            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Branch { target } => {
                    let tid = BlockId::from_offset(target);
                    if !ctx.is_compiled(tid) {
                        ctx.enqueue(state.fork(tid));
                    }
                    break Terminator::Always(tid);
                }
                StepOutcome::Leave { target } => {
                    // a leave abandons the evaluation stack
                    while let Some(e) = state.stack.pop() {
                        if let StackEntity::Reg(r) = e {
                            state.regs.free(r);
                        }
                    }
                    // a leave out of a handler ends the handler routine; the
                    // runtime resumes the parent at the recorded target
                    if handler_range.is_some_and(|(s, e)| target < s || target >= e) {
                        break Terminator::Return;
                    }
                    let tid = BlockId::from_offset(target);
                    if !ctx.is_compiled(tid) {
                        ctx.enqueue(state.fork(tid));
                    }
                    break Terminator::Always(tid);
                }
                StepOutcome::CondBranch { target, when_zero } => {
                    let tid = BlockId::from_offset(target);
                    if !ctx.is_compiled(tid) {
                        ctx.enqueue(state.fork(tid));
                    }
                    // the fallthrough offset is a forced boundary, so the
                    // continuation is always the next block in layout order
                    let fall = BlockId::from_offset(reader.pos());
                    if !ctx.is_compiled(fall) {
                        ctx.enqueue(state.fork(fall));
                    }
                    break Terminator::Cond {
                        target: tid,
                        when_zero,
                    };
                }
                StepOutcome::Return | StepOutcome::EndHandler => break Terminator::Return,
            }
        };

        state.terminator = terminator;
        ctx.mark_compiled(id);
        block.state = Some(state);
        pass.insert(block);
    }
    Ok(())
}

/// Prologue/epilogue framing blocks. The epilogue pops the unwind-stack
/// registration iff the pass carries a registration block.
fn emit_frame_blocks(pass: &mut FirstPass, base: Reg, env: &CompileEnv) {
    let saved = {
        let mut merged = crate::jit::block::RegisterFile::new();
        for block in pass.blocks.values() {
            if let Some(state) = &block.state {
                merged.merge_used(&state.regs);
            }
        }
        merged.used_nonvolatile()
    };
    let locals_size = pass.locals_size;
    let unregister = pass.has_block(BlockId::REG_CLEANUP);

    let mut prolog = BasicBlock::new(BlockId::PROLOG);
    {
        let mut asm = Asm::new(&mut prolog.code);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if locals_size > 0 {
            asm.sub_ri32(Reg::Rsp, locals_size as i32);
        }
        for &r in &saved {
            asm.push(r);
        }
    }
    let mut prolog_state = MethodBlock::new(BlockId::PROLOG, base);
    prolog_state.terminator = Terminator::Fallthrough;
    prolog.state = Some(prolog_state);
    pass.insert(prolog);

    let mut ret = BasicBlock::new(BlockId::RET);
    {
        let mut sym = None;
        {
            let mut asm = Asm::new(&mut ret.code);
            if unregister {
                asm.call_rel32(0);
                sym = Some(ret.code.len() - 4);
            }
        }
        if let Some(off) = sym {
            ret.symbol_relocs.push(crate::jit::firstpass::SymbolReloc {
                offset: off,
                symbol: env.hooks.unregister_routine.symbol(),
                kind: crate::jit::firstpass::RelocKind::Rel32,
            });
        }
        let mut asm = Asm::new(&mut ret.code);
        for &r in saved.iter().rev() {
            asm.pop(r);
        }
        if locals_size > 0 {
            asm.add_ri32(Reg::Rsp, locals_size as i32);
        }
        asm.pop(Reg::Rbp);
        if pass.stdcall && pass.args_size > 0 {
            asm.ret_imm16(pass.args_size as u16);
        } else {
            asm.ret();
        }
    }
    let mut ret_state = MethodBlock::new(BlockId::RET, base);
    ret_state.terminator = Terminator::Return;
    ret_state.finalized = true;
    ret.state = Some(ret_state);
    pass.insert(ret);
}

/// Worst-case distance between two blocks: encoded payload of every block
/// lying between them, each padded by the fixed jump upper bound. Forward
/// jumps exclude both endpoints; backward jumps include them.
fn estimate_distance(pass: &FirstPass, from: BlockId, target: BlockId) -> i64 {
    let mut sum = 0i64;
    if target > from {
        for (id, block) in pass.blocks.range(from..target) {
            if *id == from {
                continue;
            }
            sum += block.len() as i64 + MAX_JUMP_BYTES;
        }
    } else {
        for (_, block) in pass.blocks.range(target..=from) {
            sum += block.len() as i64 + MAX_JUMP_BYTES;
        }
    }
    sum
}

/// A distance strictly below the threshold takes the short form; the
/// boundary itself rounds to the long form.
fn can_use_short(distance: i64, threshold: i64) -> bool {
    distance < threshold
}

/// Finalize every terminator: append the jump bytes each block needs, in
/// a single pass over layout order. Already-finalized terminators are
/// no-ops.
fn estimate_encoding(pass: &mut FirstPass, threshold: i64) {
    let ids: Vec<BlockId> = pass.blocks.keys().copied().collect();
    for (pos, &id) in ids.iter().enumerate() {
        let Some(state) = pass.get(id).and_then(|b| b.state.as_ref()) else {
            continue;
        };
        if state.finalized {
            continue;
        }
        let terminator = state.terminator;
        match terminator {
            Terminator::Pending | Terminator::Fallthrough => {}
            Terminator::Return => {
                // no jump when the canonical return block is laid out next
                let next = ids.get(pos + 1).copied();
                if next != Some(BlockId::RET) {
                    let kind = if can_use_short(estimate_distance(pass, id, BlockId::RET), threshold)
                    {
                        JumpKind::Rel8
                    } else {
                        JumpKind::Rel32
                    };
                    if let Some(block) = pass.get_mut(id) {
                        block.emit_jump(BlockId::RET, kind);
                    }
                }
            }
            Terminator::Always(target) => {
                let kind = if can_use_short(estimate_distance(pass, id, target), threshold) {
                    JumpKind::Rel8
                } else {
                    JumpKind::Rel32
                };
                if let Some(block) = pass.get_mut(id) {
                    block.emit_jump(target, kind);
                }
            }
            Terminator::Cond { target, when_zero } => {
                let cond = if when_zero { Cond::E } else { Cond::Ne };
                let kind = if can_use_short(estimate_distance(pass, id, target), threshold) {
                    JumpKind::Rel8
                } else {
                    JumpKind::Rel32
                };
                if let Some(block) = pass.get_mut(id) {
                    block.emit_jcc(cond, target, kind);
                }
            }
        }
        if let Some(state) = pass.get_mut(id).and_then(|b| b.state.as_mut()) {
            state.finalized = true;
        }
    }
}
