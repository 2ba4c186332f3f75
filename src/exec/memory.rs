//! Executable memory and code installation.
//!
//! Compiled blobs are copied into mmap'd pages, their dependencies patched
//! against the process-wide symbol table, and the pages flipped to
//! read/execute. Installation is the only place relocations turn into real
//! addresses; everything upstream stays position-independent.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::error::{CompileError, CompileResult};
use crate::jit::firstpass::RelocKind;
use crate::jit::secondpass::SecondPassBinary;

fn memory_err(detail: &str) -> CompileError {
    CompileError::Memory(detail.to_string())
}

/// A page-aligned mapping, writable until `make_executable()` flips it to
/// read/execute. Never mapped writable and executable at once.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> CompileResult<ExecutableMemory> {
        if size == 0 {
            return Err(memory_err("cannot map zero bytes"));
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let size = size.div_ceil(page) * page;
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(memory_err("mmap failed"));
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or_else(|| memory_err("mmap returned null"))?;
        Ok(ExecutableMemory {
            ptr,
            size,
            executable: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy bytes into the mapping. Rejected once the mapping is
    /// executable, or when the write would overflow it.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> CompileResult<()> {
        if self.executable {
            return Err(memory_err("write into an executable mapping"));
        }
        if offset + data.len() > self.size {
            return Err(memory_err("write past the end of the mapping"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the mapping to read/execute; it can no longer be written.
    pub fn make_executable(&mut self) -> CompileResult<()> {
        if self.executable {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(memory_err("mprotect failed"));
        }
        self.executable = true;
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// Owns its mapping; the executable flag is only mutated through &mut.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// Installs linked binaries into executable pages, resolving their
/// dependency lists against a symbol table of previously installed code.
#[derive(Default)]
pub struct CodeInstaller {
    symbols: HashMap<String, usize>,
    installed: Vec<ExecutableMemory>,
}

impl CodeInstaller {
    pub fn new() -> CodeInstaller {
        CodeInstaller::default()
    }

    /// Pre-register an externally provided entry point (runtime hooks).
    pub fn define_symbol(&mut self, symbol: &str, address: usize) {
        self.symbols.insert(symbol.to_string(), address);
    }

    pub fn address_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.get(symbol).copied()
    }

    /// Number of live installed mappings. Mappings stay alive for the
    /// installer's lifetime; installed code is never unmapped under running
    /// callers.
    pub fn installed_blocks(&self) -> usize {
        self.installed.len()
    }

    /// Copy `binary` into fresh executable memory under `symbol`, patching
    /// every dependency. An unsatisfied dependency is a linking failure.
    pub fn install(&mut self, symbol: &str, binary: &SecondPassBinary) -> CompileResult<usize> {
        if binary.code.is_empty() {
            return Err(CompileError::Link {
                method: binary.debug.method_name.clone(),
                detail: "cannot install an empty binary".to_string(),
            });
        }
        let mut code = binary.code.clone();
        let mut memory = ExecutableMemory::new(code.len())?;
        let base = memory.as_ptr() as usize;

        for dep in &binary.deps {
            let target =
                self.address_of(&dep.symbol)
                    .ok_or_else(|| CompileError::Link {
                        method: binary.debug.method_name.clone(),
                        detail: format!("unresolved dependency {}", dep.symbol),
                    })?;
            match dep.kind {
                RelocKind::Rel32 => {
                    let field_end = base + dep.offset + 4;
                    let disp = target as i64 - field_end as i64;
                    let disp = i32::try_from(disp).map_err(|_| CompileError::Link {
                        method: binary.debug.method_name.clone(),
                        detail: format!("dependency {} out of rel32 range", dep.symbol),
                    })?;
                    code[dep.offset..dep.offset + 4].copy_from_slice(&disp.to_le_bytes());
                }
                RelocKind::Abs64 => {
                    code[dep.offset..dep.offset + 8]
                        .copy_from_slice(&(target as u64).to_le_bytes());
                }
            }
        }

        memory.write(0, &code)?;
        memory.make_executable()?;
        self.symbols.insert(symbol.to_string(), base);
        self.installed.push(memory);
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::secondpass::{DebugInfo, Dependency};

    fn blob(code: Vec<u8>, deps: Vec<Dependency>) -> SecondPassBinary {
        SecondPassBinary {
            code,
            deps,
            resolve_chain: Vec::new(),
            debug: DebugInfo {
                method_name: "T.m".to_string(),
                export_name: None,
            },
        }
    }

    #[test]
    fn test_allocate_write_execute() {
        let mut mem = ExecutableMemory::new(64).unwrap();
        assert!(mem.size() >= 64);
        mem.write(0, &[0x90, 0xC3]).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.is_executable());
        assert!(matches!(
            mem.write(0, &[0x90]),
            Err(CompileError::Memory(_))
        ));
    }

    #[test]
    fn test_zero_size_mapping_is_rejected() {
        assert!(matches!(
            ExecutableMemory::new(0),
            Err(CompileError::Memory(_))
        ));
    }

    #[test]
    fn test_install_patches_abs64() {
        let mut installer = CodeInstaller::new();
        installer.define_symbol("hook", 0x1122_3344_5566);
        // mov rax, imm64; ret
        let mut code = vec![0x48, 0xB8];
        code.extend_from_slice(&[0u8; 8]);
        code.push(0xC3);
        let bin = blob(
            code,
            vec![Dependency {
                offset: 2,
                symbol: "hook".to_string(),
                kind: RelocKind::Abs64,
            }],
        );
        let base = installer.install("T.m", &bin).unwrap();
        assert_eq!(installer.address_of("T.m"), Some(base));
        assert_eq!(installer.installed_blocks(), 1);
        let installed = unsafe { std::slice::from_raw_parts(base as *const u8, 11) };
        assert_eq!(&installed[2..10], (0x1122_3344_5566u64).to_le_bytes());
    }

    #[test]
    fn test_install_unresolved_dependency_fails() {
        let mut installer = CodeInstaller::new();
        let bin = blob(
            vec![0xE8, 0, 0, 0, 0, 0xC3],
            vec![Dependency {
                offset: 1,
                symbol: "missing".to_string(),
                kind: RelocKind::Rel32,
            }],
        );
        assert!(matches!(
            installer.install("T.m", &bin),
            Err(CompileError::Link { .. })
        ));
    }
}
