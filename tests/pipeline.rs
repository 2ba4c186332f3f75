//! End-to-end pipeline tests: bytecode through the compiler, the caches,
//! and the persistent repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ciljit::config::CompilerConfig;
use ciljit::error::{CompileError, CompileResult};
use ciljit::exec::binary_cache::BinaryCache;
use ciljit::exec::repository::PrecompiledRepository;
use ciljit::exec::worker::{CompileObserver, CompilerWorker, StaticScheduler};
use ciljit::jit::compiler::{MethodCompiler, MethodSink};
use ciljit::jit::secondpass::{BinaryHandle, SecondPassBinary};
use ciljit::model::{ElementType, ModuleId, TableKind, Token, TypeKind};
use ciljit::resolve::{
    CallConv, ClauseKind, CompileEnv, ExceptionClause, FieldInfo, MethodDesc, MethodSig,
    MethodSource, ModuleArena, ModuleInfo, RuntimeHooks, TypeResolver,
};

// opcodes used by the fixtures
const NOP: u8 = 0x00;
const LDC_I4_2: u8 = 0x18;
const LDC_I4_3: u8 = 0x19;
const ADD: u8 = 0x58;
const RET: u8 = 0x2A;
const LEAVE_S: u8 = 0xDE;

struct FixtureResolver;

impl TypeResolver for FixtureResolver {
    fn type_size(&self, ty: &ElementType) -> u32 {
        ty.kind.fixed_size().unwrap_or(8)
    }
    fn fields_of(&self, _ty: Token) -> Vec<FieldInfo> {
        Vec::new()
    }
    fn base_of(&self, _ty: Token) -> Option<Token> {
        None
    }
    fn needs_member_teardown(&self, _ty: Token) -> bool {
        false
    }
}

struct MapSource {
    methods: HashMap<Token, MethodDesc>,
}

impl MethodSource for MapSource {
    fn load_method(&self, token: Token) -> CompileResult<MethodDesc> {
        self.methods
            .get(&token)
            .cloned()
            .ok_or(CompileError::MissingMethod(token))
    }
    fn static_initializer_of(&self, _ty: Token) -> Option<Token> {
        None
    }
}

fn hooks() -> RuntimeHooks {
    RuntimeHooks {
        dec_obj: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 1),
        register_routine: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 2),
        unregister_routine: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 3),
        current_exception: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 4),
        framework_modules: Vec::new(),
    }
}

fn method(name: &str, body: Vec<u8>) -> MethodDesc {
    MethodDesc {
        name: name.to_string(),
        parent_type: None,
        sig: MethodSig {
            call_conv: CallConv::Cdecl,
            has_this: false,
            ret: ElementType::simple(TypeKind::Void),
            params: Vec::new(),
        },
        locals: Vec::new(),
        init_locals: false,
        body,
        clauses: Vec::new(),
        attributes: Vec::new(),
    }
}

/// One module named app.dll holding the given methods, rows assigned in
/// order starting at 1.
fn env_with(methods: Vec<MethodDesc>) -> (Arc<CompileEnv>, Vec<Token>) {
    let mut modules = ModuleArena::new();
    let id = modules.add(ModuleInfo::new("app.dll"));
    let mut map = HashMap::new();
    let mut tokens = Vec::new();
    for (row, desc) in methods.into_iter().enumerate() {
        let token = Token::build(id, TableKind::Method, row as u32 + 1);
        map.insert(token, desc);
        tokens.push(token);
    }
    let env = CompileEnv {
        modules,
        resolver: Box::new(FixtureResolver),
        methods: Box::new(MapSource { methods: map }),
        hooks: hooks(),
    };
    (Arc::new(env), tokens)
}

/// Sink that records every published binary.
#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(Token, u64, Arc<SecondPassBinary>)>>,
}

impl MethodSink for RecordingSink {
    fn publish(
        &self,
        _module_name: &str,
        signature: u64,
        token: Token,
        binary: &Arc<SecondPassBinary>,
        _from_cache: bool,
    ) {
        self.published
            .lock()
            .unwrap()
            .push((token, signature, binary.clone()));
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn obj() -> ElementType {
    ElementType::simple(TypeKind::Object)
}

#[test]
fn test_ret_only_method_is_a_bare_frame() {
    let (env, tokens) = env_with(vec![method("App.Empty", vec![RET])]);
    let config = CompilerConfig::default();
    let sink = RecordingSink::default();
    let compiler = MethodCompiler::new(&env, &config, &sink);

    let binary = compiler.compile(tokens[0]).unwrap();
    // push rbp; mov rbp, rsp; pop rbp; ret
    assert_eq!(binary.code, [0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3]);
    assert!(binary.deps.is_empty());
    // no heap references, no cleanup routine
    assert!(sink.published.lock().unwrap().is_empty());
}

#[test]
fn test_compilation_is_idempotent() {
    let (env, tokens) = env_with(vec![method(
        "App.Sum",
        vec![LDC_I4_2, LDC_I4_3, ADD, RET],
    )]);
    let config = CompilerConfig::default();
    let sink = RecordingSink::default();
    let compiler = MethodCompiler::new(&env, &config, &sink);

    let first = compiler.compile(tokens[0]).unwrap();
    let second = compiler.compile(tokens[0]).unwrap();
    assert_eq!(first.code, second.code);
    assert_eq!(first.deps.len(), second.deps.len());

    // the persistent-cache key is stable across loads
    let a = env.methods.load_method(tokens[0]).unwrap().content_signature();
    let b = env.methods.load_method(tokens[0]).unwrap().content_signature();
    assert_eq!(a, b);
}

#[test]
fn test_single_object_local_uses_constant_store() {
    let mut desc = method("App.One", vec![RET]);
    desc.locals = vec![obj()];
    desc.init_locals = true;
    let (env, tokens) = env_with(vec![desc]);
    let config = CompilerConfig::default();
    let sink = RecordingSink::default();
    let compiler = MethodCompiler::new(&env, &config, &sink);

    let binary = compiler.compile(tokens[0]).unwrap();
    // mov qword [rbp - 8], 0
    assert!(contains(
        &binary.code,
        &[0x48, 0xC7, 0x45, 0xF8, 0x00, 0x00, 0x00, 0x00]
    ));
    // the frame now owns a reference: a cleanup routine is registered
    let symbols: Vec<String> = binary.deps.iter().map(|d| d.symbol.clone()).collect();
    assert!(symbols.contains(&env.hooks.register_routine.symbol()));
    assert!(symbols.contains(&env.hooks.unregister_routine.symbol()));

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0.raw.kind(), Some(TableKind::Helper));
    assert!(symbols.contains(&published[0].0.symbol()));
}

#[test]
fn test_cleanup_routine_allocates_no_locals_of_its_own() {
    let mut desc = method("App.Owner", vec![RET]);
    desc.locals = vec![obj(), ElementType::simple(TypeKind::I8)];
    desc.init_locals = true;
    let (env, tokens) = env_with(vec![desc]);
    let config = CompilerConfig::default();
    let sink = RecordingSink::default();
    let compiler = MethodCompiler::new(&env, &config, &sink);

    compiler.compile(tokens[0]).unwrap();

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let cleanup = &published[0].2;
    // the parent frame arrives through the pointer argument; the routine's
    // own prologue must not carve out the parent's locals again
    assert!(!contains(&cleanup.code, &[0x48, 0x83, 0xEC]));
    assert!(!contains(&cleanup.code, &[0x48, 0x81, 0xEC]));
    // the object local is still dereferenced relative to the parent frame:
    // mov rax, [rbx - 16]
    assert!(contains(&cleanup.code, &[0x48, 0x8B, 0x43, 0xF0]));
}

#[test]
fn test_several_object_locals_share_one_zero_register() {
    let mut desc = method("App.Three", vec![RET]);
    desc.locals = vec![obj(), obj(), obj()];
    desc.init_locals = true;
    let (env, tokens) = env_with(vec![desc]);
    let config = CompilerConfig::default();
    let sink = RecordingSink::default();
    let compiler = MethodCompiler::new(&env, &config, &sink);

    let binary = compiler.compile(tokens[0]).unwrap();
    // xor rax, rax once, then one store per slot
    assert!(contains(&binary.code, &[0x48, 0x31, 0xC0]));
    for disp in [0xE8, 0xF0, 0xF8] {
        assert!(contains(&binary.code, &[0x48, 0x89, 0x45, disp]));
    }
    let zero_loads = binary
        .code
        .windows(3)
        .filter(|w| *w == [0x48, 0x31, 0xC0])
        .count();
    assert_eq!(zero_loads, 1);
}

#[test]
fn test_catch_handler_fetches_exception_before_handler_code() {
    // 0: nop (protected); 1: leave.s -> 5; 3: leave.s -> 5 (handler); 5: ret
    let mut desc = method("App.Guarded", vec![NOP, LEAVE_S, 2, LEAVE_S, 0, RET]);
    desc.clauses = vec![ExceptionClause {
        kind: ClauseKind::Catch,
        try_offset: 0,
        try_length: 3,
        handler_offset: 3,
        handler_length: 2,
        class_token: None,
    }];
    let (env, tokens) = env_with(vec![desc]);
    let config = CompilerConfig::default();
    let sink = RecordingSink::default();
    let compiler = MethodCompiler::new(&env, &config, &sink);

    compiler.compile(tokens[0]).unwrap();

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let (token, _, helper) = &published[0];
    assert_eq!(token.raw.kind(), Some(TableKind::Helper));
    assert!(helper.debug.method_name.contains("@handler_3"));

    // after the prologue: mov rbx, [rbp + 16], then the exception fetch
    // before any handler instruction
    assert!(contains(&helper.code, &[0x48, 0x8B, 0x5D, 0x10]));
    assert_eq!(helper.deps[0].symbol, env.hooks.current_exception.symbol());
    assert_eq!(helper.resolve_chain, vec![tokens[0].symbol()]);
}

#[test]
fn test_no_heap_references_means_no_cleanup() {
    let mut desc = method("App.Plain", vec![RET]);
    desc.locals = vec![ElementType::simple(TypeKind::I4)];
    desc.sig.params = vec![ElementType::simple(TypeKind::I8)];
    let (env, tokens) = env_with(vec![desc]);
    let config = CompilerConfig::default();
    let sink = RecordingSink::default();
    let compiler = MethodCompiler::new(&env, &config, &sink);

    let binary = compiler.compile(tokens[0]).unwrap();
    assert!(binary.deps.is_empty());
    assert!(sink.published.lock().unwrap().is_empty());
    // the local is still allocated
    assert!(contains(&binary.code, &[0x48, 0x83, 0xEC, 0x08]));
}

#[derive(Default)]
struct Recorder {
    compiled: Mutex<Vec<(Token, bool, Vec<u8>)>>,
}

impl CompileObserver for Recorder {
    fn on_compiled(&self, token: Token, binary: &BinaryHandle, from_cache: bool) {
        self.compiled
            .lock()
            .unwrap()
            .push((token, from_cache, binary.code.clone()));
    }
    fn on_failure(&self, _token: Token, _error: &CompileError) {}
}

#[test]
fn test_repository_round_trip_serves_second_run_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo.bin");
    let mut config = CompilerConfig::default();
    config.repository_path = Some(path.clone());

    let (env, tokens) = env_with(vec![method(
        "App.Sum",
        vec![LDC_I4_2, LDC_I4_3, ADD, RET],
    )]);

    let first = Arc::new(Recorder::default());
    let worker = CompilerWorker::new(
        env.clone(),
        config.clone(),
        Arc::new(BinaryCache::new()),
        Arc::new(PrecompiledRepository::new()),
        Arc::new(StaticScheduler::new(tokens.clone())),
        vec![first.clone()],
    );
    worker.run().unwrap();
    assert!(path.exists());
    let fresh_code = {
        let compiled = first.compiled.lock().unwrap();
        assert_eq!(compiled.len(), 1);
        assert!(!compiled[0].1);
        compiled[0].2.clone()
    };

    let repo = Arc::new(PrecompiledRepository::load(&path).unwrap());
    let second = Arc::new(Recorder::default());
    let worker = CompilerWorker::new(
        env,
        config,
        Arc::new(BinaryCache::new()),
        repo,
        Arc::new(StaticScheduler::new(tokens)),
        vec![second.clone()],
    );
    worker.run().unwrap();
    let compiled = second.compiled.lock().unwrap();
    assert_eq!(compiled.len(), 1);
    assert!(compiled[0].1);
    assert_eq!(compiled[0].2, fresh_code);
}
