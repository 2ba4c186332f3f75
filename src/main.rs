use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};

use ciljit::config::{CompilerConfig, ConfigFile};
use ciljit::error::{CompileError, CompileResult};
use ciljit::exec::binary_cache::BinaryCache;
use ciljit::exec::memory::CodeInstaller;
use ciljit::exec::repository::PrecompiledRepository;
use ciljit::exec::worker::{CompileObserver, CompilerWorker, StaticScheduler};
use ciljit::jit::secondpass::BinaryHandle;
use ciljit::model::{ElementType, ModuleId, TableKind, Token, TypeKind};
use ciljit::resolve::{
    CallConv, CompileEnv, FieldInfo, MethodDesc, MethodSig, MethodSource, ModuleArena, ModuleInfo,
    RuntimeHooks, TypeResolver,
};

#[derive(Parser)]
#[command(name = "ciljit", version, about = "Method-level JIT compiler for CIL-style bytecode")]
struct Cli {
    /// Path to a ciljit.toml configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the contents of a persistent repository file
    Inspect {
        /// Repository file to read
        repository: PathBuf,
    },
    /// Compile a built-in sample module, install it, and run it
    Demo,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match ConfigFile::load(path) {
            Ok(file) => file.into_config(),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => CompilerConfig::default(),
    };

    let result = match cli.command {
        Command::Inspect { repository } => inspect(&repository),
        Command::Demo => demo(config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn inspect(path: &std::path::Path) -> CompileResult<()> {
    let repo = PrecompiledRepository::load(path)?;
    for (name, next_helper_row, methods) in repo.snapshot() {
        println!("module {} (next helper row {})", name, next_helper_row);
        for (signature, last_access, code_len) in methods {
            println!(
                "  {:016x}  last access {:>12}  {:>6} bytes",
                signature, last_access, code_len
            );
        }
    }
    Ok(())
}

/// Fixed sample module: `Sample.Add` computes 2 + 3.
struct SampleModule {
    add: Token,
}

impl TypeResolver for SampleModule {
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

impl MethodSource for SampleModule {
    fn load_method(&self, token: Token) -> CompileResult<MethodDesc> {
        if token != self.add {
            return Err(CompileError::MissingMethod(token));
        }
        Ok(MethodDesc {
            name: "Sample.Add".to_string(),
            parent_type: None,
            sig: MethodSig {
                call_conv: CallConv::Cdecl,
                has_this: false,
                ret: ElementType::simple(TypeKind::I4),
                params: Vec::new(),
            },
            locals: Vec::new(),
            init_locals: false,
            // ldc.i4.2; ldc.i4.3; add; ret
            body: vec![0x18, 0x19, 0x58, 0x2A],
            clauses: Vec::new(),
            attributes: Vec::new(),
        })
    }
    fn static_initializer_of(&self, _ty: Token) -> Option<Token> {
        None
    }
}

#[derive(Default)]
struct PrintObserver {
    binaries: Mutex<Vec<(Token, BinaryHandle)>>,
}

impl CompileObserver for PrintObserver {
    fn on_compiled(&self, token: Token, binary: &BinaryHandle, from_cache: bool) {
        println!(
            "compiled {} ({} bytes{})",
            binary.debug.method_name,
            binary.code.len(),
            if from_cache { ", cached" } else { "" }
        );
        if let Ok(mut binaries) = self.binaries.lock() {
            binaries.push((token, binary.clone()));
        }
    }
    fn on_failure(&self, token: Token, error: &CompileError) {
        eprintln!("failed {}: {}", token, error);
    }
}

fn demo(config: CompilerConfig) -> CompileResult<()> {
    // A pre-existing repository also carries the module's helper row; the
    // arena must start from it so helper tokens line up with stored binaries.
    let repository = match &config.repository_path {
        Some(path) if path.exists() => PrecompiledRepository::load(path)?,
        _ => PrecompiledRepository::new(),
    };

    let mut modules = ModuleArena::new();
    let info = match repository.helper_row_of("sample.dll") {
        Some(row) => ModuleInfo::with_helper_row("sample.dll", row),
        None => ModuleInfo::new("sample.dll"),
    };
    let id = modules.add(info);
    let add = Token::build(id, TableKind::Method, 1);
    let source = SampleModule { add };

    let env = Arc::new(CompileEnv {
        modules,
        resolver: Box::new(SampleModule { add }),
        methods: Box::new(source),
        hooks: RuntimeHooks {
            dec_obj: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 1),
            register_routine: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 2),
            unregister_routine: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 3),
            current_exception: Token::build(ModuleId::SYNTHETIC, TableKind::Internal, 4),
            framework_modules: Vec::new(),
        },
    });

    let observer = Arc::new(PrintObserver::default());
    let worker_count = config.worker_count.max(1);
    let worker = Arc::new(CompilerWorker::new(
        env,
        config,
        Arc::new(BinaryCache::new()),
        Arc::new(repository),
        Arc::new(StaticScheduler::new(vec![add])),
        vec![observer.clone()],
    ));
    let handles: Vec<_> = (0..worker_count)
        .map(|_| {
            let worker = worker.clone();
            std::thread::spawn(move || worker.run())
        })
        .collect();
    for handle in handles {
        handle
            .join()
            .map_err(|_| CompileError::Internal("worker thread panicked".to_string()))??;
    }

    let binaries = observer
        .binaries
        .lock()
        .map_err(|_| CompileError::Internal("observer lock poisoned".to_string()))?;
    let Some((_, binary)) = binaries.iter().find(|(t, _)| *t == add) else {
        return Err(CompileError::Internal("sample method not compiled".to_string()));
    };

    let mut installer = CodeInstaller::new();
    let entry = installer.install(&add.symbol(), binary)?;
    let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(entry) };
    println!("Sample.Add() = {}", f());
    Ok(())
}
