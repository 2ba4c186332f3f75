//! Background compilation worker.
//!
//! A worker pulls method identities from a `Scheduler`, resolves each one
//! against the in-memory cache, then the persistent repository, and only
//! then the compiler. Everything it produces flows through `publish` into
//! both caches and out to the observers. Item failures are reported and
//! the loop keeps going; the scan finishing shuts the worker down and
//! persists the repository once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::exec::binary_cache::BinaryCache;
use crate::exec::repository::PrecompiledRepository;
use crate::jit::compiler::{synthetic_signature, MethodCompiler, MethodSink};
use crate::jit::secondpass::{BinaryHandle, SecondPassBinary};
use crate::model::{TableKind, Token};
use crate::resolve::CompileEnv;

/// One-shot wakeup latch. Schedulers notify it when new work arrives so an
/// idle worker does not spin.
#[derive(Default)]
pub struct WakeEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl WakeEvent {
    pub fn new() -> WakeEvent {
        WakeEvent::default()
    }

    pub fn notify(&self) {
        let mut signalled = relock(self.signalled.lock());
        *signalled = true;
        self.cond.notify_all();
    }

    /// Block until the next `notify`, then reset.
    pub fn wait(&self) {
        let mut signalled = relock(self.signalled.lock());
        while !*signalled {
            signalled = relock(self.cond.wait(signalled));
        }
        *signalled = false;
    }
}

/// Result of asking the scheduler for the next unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Compile this identity next
    Method(Token),
    /// Nothing to do right now; wait on the wake event
    Idle,
    /// The scan is over; persist and shut down
    Finished,
}

/// Source of compilation work.
pub trait Scheduler: Send + Sync {
    fn next(&self) -> ScanOutcome;
    fn wake_event(&self) -> &WakeEvent;
}

/// Receives compilation results as they are published.
pub trait CompileObserver: Send + Sync {
    fn on_compiled(&self, token: Token, binary: &BinaryHandle, from_cache: bool);
    fn on_failure(&self, token: Token, error: &CompileError);
}

/// Scheduler over a fixed queue: hands out the queued tokens in order and
/// then reports the scan finished.
#[derive(Default)]
pub struct StaticScheduler {
    queue: Mutex<VecDeque<Token>>,
    event: WakeEvent,
}

impl StaticScheduler {
    pub fn new(tokens: Vec<Token>) -> StaticScheduler {
        StaticScheduler {
            queue: Mutex::new(tokens.into()),
            event: WakeEvent::new(),
        }
    }

    pub fn push(&self, token: Token) {
        relock(self.queue.lock()).push_back(token);
        self.event.notify();
    }
}

impl Scheduler for StaticScheduler {
    fn next(&self) -> ScanOutcome {
        match relock(self.queue.lock()).pop_front() {
            Some(token) => ScanOutcome::Method(token),
            None => ScanOutcome::Finished,
        }
    }

    fn wake_event(&self) -> &WakeEvent {
        &self.event
    }
}

pub struct CompilerWorker {
    env: Arc<CompileEnv>,
    config: CompilerConfig,
    cache: Arc<BinaryCache>,
    repository: Arc<PrecompiledRepository>,
    scheduler: Arc<dyn Scheduler>,
    observers: Vec<Arc<dyn CompileObserver>>,
    persisted: AtomicBool,
}

impl CompilerWorker {
    pub fn new(
        env: Arc<CompileEnv>,
        config: CompilerConfig,
        cache: Arc<BinaryCache>,
        repository: Arc<PrecompiledRepository>,
        scheduler: Arc<dyn Scheduler>,
        observers: Vec<Arc<dyn CompileObserver>>,
    ) -> CompilerWorker {
        CompilerWorker {
            env,
            config,
            cache,
            repository,
            scheduler,
            observers,
            persisted: AtomicBool::new(false),
        }
    }

    fn trace(&self, msg: std::fmt::Arguments) {
        if self.config.trace {
            eprintln!("[worker] {}", msg);
        }
    }

    /// Main loop. Shared between threads through `Arc`; the first worker to
    /// see the scan finish persists the repository.
    pub fn run(&self) -> CompileResult<()> {
        loop {
            match self.scheduler.next() {
                ScanOutcome::Method(token) => {
                    if let Err(error) = self.process(token) {
                        self.trace(format_args!("{} failed: {}", token, error));
                        for obs in &self.observers {
                            obs.on_failure(token, &error);
                        }
                    }
                }
                ScanOutcome::Idle => self.scheduler.wake_event().wait(),
                ScanOutcome::Finished => {
                    if !self.persisted.swap(true, Ordering::SeqCst)
                        && let Some(path) = &self.config.repository_path
                    {
                        self.trace(format_args!("persisting repository to {}", path.display()));
                        self.repository.persist(path, &self.env.modules)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn process(&self, token: Token) -> CompileResult<()> {
        // an already-published method is still reported, as a cache hit
        if let Some(binary) = self.cache.get_second_pass_method(token) {
            for obs in &self.observers {
                obs.on_compiled(token, &binary, true);
            }
            return Ok(());
        }
        let kind = token
            .raw
            .kind()
            .ok_or_else(|| CompileError::Internal(format!("unclassifiable token {}", token)))?;
        match kind {
            // External references are someone else's to compile
            TableKind::MemberRef | TableKind::Internal => Ok(()),
            TableKind::Method => self.process_method(token),
            TableKind::InstanceDtor => {
                let ty = Token::build(token.module, TableKind::TypeDef, token.raw.row());
                self.process_synthesized(token, |c| c.compile_instance_destructor(ty))
            }
            TableKind::CctorWrapper => {
                let ty = Token::build(token.module, TableKind::TypeDef, token.raw.row());
                self.process_synthesized(token, |c| c.compile_cctor_wrapper(ty))
            }
            // A helper is only ever produced alongside its parent method;
            // meeting one the repository has never seen means the caches
            // disagree about what was compiled.
            TableKind::Helper => {
                let module_name = self.env.modules.name_of(token.module)?;
                let signature = synthetic_signature(token);
                let binary = self
                    .repository
                    .fetch(module_name, signature)
                    .ok_or(CompileError::CacheInconsistency { token })?;
                let module_name = module_name.to_string();
                self.publish(&module_name, signature, token, &binary, true);
                Ok(())
            }
            TableKind::TypeDef | TableKind::StaticData => Err(CompileError::Internal(format!(
                "token {} is not compilable",
                token
            ))),
        }
    }

    fn process_method(&self, token: Token) -> CompileResult<()> {
        let module_name = self.env.modules.name_of(token.module)?.to_string();
        let desc = self.env.methods.load_method(token)?;
        let signature = desc.content_signature();
        if let Some(binary) = self.repository.fetch(&module_name, signature) {
            self.trace(format_args!("{} served from repository", token));
            self.publish(&module_name, signature, token, &binary, true);
            return Ok(());
        }
        self.trace(format_args!("compiling {} ({})", desc.name, token));
        let compiler = MethodCompiler::new(&self.env, &self.config, self);
        let binary = compiler.compile(token)?;
        self.publish(&module_name, signature, token, &binary, false);
        Ok(())
    }

    fn process_synthesized<F>(&self, token: Token, compile: F) -> CompileResult<()>
    where
        F: FnOnce(&MethodCompiler) -> CompileResult<Arc<SecondPassBinary>>,
    {
        let module_name = self.env.modules.name_of(token.module)?.to_string();
        let signature = synthetic_signature(token);
        if let Some(binary) = self.repository.fetch(&module_name, signature) {
            self.publish(&module_name, signature, token, &binary, true);
            return Ok(());
        }
        let compiler = MethodCompiler::new(&self.env, &self.config, self);
        let binary = compile(&compiler)?;
        self.publish(&module_name, signature, token, &binary, false);
        Ok(())
    }
}

impl MethodSink for CompilerWorker {
    fn publish(
        &self,
        module_name: &str,
        signature: u64,
        token: Token,
        binary: &Arc<SecondPassBinary>,
        from_cache: bool,
    ) {
        self.cache.add_second_pass_method(token, binary.clone());
        self.repository.append(module_name, signature, binary.clone());
        for obs in &self.observers {
            obs.on_compiled(token, binary, from_cache);
        }
    }
}
