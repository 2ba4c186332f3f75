//! Persistent store of compiled method binaries.
//!
//! Methods are keyed by module name and content signature, so a method
//! recompiled from an unchanged body is served from disk instead of the
//! compiler. The store also remembers each module's next synthetic helper
//! row, keeping helper identities stable across processes.
//!
//! File layout: magic, a signature-width byte, then per module a
//! NUL-terminated name, the next helper row, and the method records
//! (signature, last-access timestamp, serialized binary).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CompileError, CompileResult};
use crate::jit::secondpass::{BinaryHandle, SecondPassBinary};
use crate::resolve::ModuleArena;

const MAGIC: &[u8] = b"CILJITPC\r\n";
const SIGNATURE_WIDTH: u8 = 8;

struct MethodEntry {
    binary: BinaryHandle,
    last_access: u64,
}

#[derive(Default)]
struct ModuleEntry {
    next_helper_row: u32,
    methods: BTreeMap<u64, MethodEntry>,
}

#[derive(Default)]
pub struct PrecompiledRepository {
    modules: Mutex<BTreeMap<String, ModuleEntry>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PrecompiledRepository {
    pub fn new() -> PrecompiledRepository {
        PrecompiledRepository::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ModuleEntry>> {
        match self.modules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn contains(&self, module: &str, signature: u64) -> bool {
        self.lock()
            .get(module)
            .is_some_and(|m| m.methods.contains_key(&signature))
    }

    /// Look up a method and refresh its last-access timestamp.
    pub fn fetch(&self, module: &str, signature: u64) -> Option<BinaryHandle> {
        let mut modules = self.lock();
        let entry = modules.get_mut(module)?.methods.get_mut(&signature)?;
        entry.last_access = unix_now();
        Some(entry.binary.clone())
    }

    /// Record a freshly compiled method. Appending a signature that is
    /// already present does nothing; the stored binary is equivalent.
    pub fn append(&self, module: &str, signature: u64, binary: BinaryHandle) {
        let mut modules = self.lock();
        let entry = modules.entry(module.to_string()).or_default();
        entry.methods.entry(signature).or_insert(MethodEntry {
            binary,
            last_access: unix_now(),
        });
    }

    /// The stored next helper row for `module`, when the module has been
    /// seen before.
    ///
    /// Embedders that load a repository must feed this row into
    /// `ModuleInfo::with_helper_row` when building the arena, before any
    /// compilation starts. Otherwise synthetic helper tokens restart at row
    /// one and no longer match the helper binaries stored here.
    pub fn helper_row_of(&self, module: &str) -> Option<u32> {
        self.lock()
            .get(module)
            .map(|m| m.next_helper_row)
            .filter(|&row| row > 0)
    }

    pub fn method_count(&self) -> usize {
        self.lock().values().map(|m| m.methods.len()).sum()
    }

    /// Per-module view for diagnostics: (name, next helper row, methods as
    /// (signature, last access, code length)).
    pub fn snapshot(&self) -> Vec<(String, u32, Vec<(u64, u64, usize)>)> {
        self.lock()
            .iter()
            .map(|(name, entry)| {
                let methods = entry
                    .methods
                    .iter()
                    .map(|(sig, m)| (*sig, m.last_access, m.binary.code.len()))
                    .collect();
                (name.clone(), entry.next_helper_row, methods)
            })
            .collect()
    }

    pub fn load(path: &Path) -> CompileResult<PrecompiledRepository> {
        let data = fs::read(path)?;
        let mut input = data.as_slice();
        expect_bytes(&mut input, MAGIC)?;
        let width = read_u8(&mut input)?;
        if width != SIGNATURE_WIDTH {
            return Err(CompileError::BadImage(format!(
                "unsupported signature width {width}"
            )));
        }
        let module_count = read_u32(&mut input)?;
        let mut modules = BTreeMap::new();
        for _ in 0..module_count {
            let name = read_cstr(&mut input)?;
            let next_helper_row = read_u32(&mut input)?;
            let method_count = read_u32(&mut input)?;
            let mut methods = BTreeMap::new();
            for _ in 0..method_count {
                let signature = read_u64(&mut input)?;
                let last_access = read_u64(&mut input)?;
                let binary = SecondPassBinary::deserialize(&mut input)?;
                methods.insert(
                    signature,
                    MethodEntry {
                        binary: Arc::new(binary),
                        last_access,
                    },
                );
            }
            modules.insert(
                name,
                ModuleEntry {
                    next_helper_row,
                    methods,
                },
            );
        }
        Ok(PrecompiledRepository {
            modules: Mutex::new(modules),
        })
    }

    /// Write the repository to disk, recording the arena's current helper
    /// rows. Called once at shutdown.
    pub fn persist(&self, path: &Path, arena: &ModuleArena) -> CompileResult<()> {
        let mut modules = self.lock();
        for (_, info) in arena.iter() {
            modules.entry(info.name.clone()).or_default().next_helper_row =
                info.next_helper_row();
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(SIGNATURE_WIDTH);
        out.extend_from_slice(&(modules.len() as u32).to_le_bytes());
        for (name, entry) in modules.iter() {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.extend_from_slice(&entry.next_helper_row.to_le_bytes());
            out.extend_from_slice(&(entry.methods.len() as u32).to_le_bytes());
            for (signature, method) in &entry.methods {
                out.extend_from_slice(&signature.to_le_bytes());
                out.extend_from_slice(&method.last_access.to_le_bytes());
                method.binary.serialize(&mut out);
            }
        }
        fs::write(path, out)?;
        Ok(())
    }
}

fn expect_bytes(input: &mut &[u8], expected: &[u8]) -> CompileResult<()> {
    if input.len() < expected.len() || &input[..expected.len()] != expected {
        return Err(CompileError::BadImage("bad repository magic".to_string()));
    }
    *input = &input[expected.len()..];
    Ok(())
}

fn read_u8(input: &mut &[u8]) -> CompileResult<u8> {
    let (&b, rest) = input
        .split_first()
        .ok_or_else(|| CompileError::BadImage("truncated repository".to_string()))?;
    *input = rest;
    Ok(b)
}

fn read_u32(input: &mut &[u8]) -> CompileResult<u32> {
    if input.len() < 4 {
        return Err(CompileError::BadImage("truncated repository".to_string()));
    }
    let (head, rest) = input.split_at(4);
    *input = rest;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(head);
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(input: &mut &[u8]) -> CompileResult<u64> {
    if input.len() < 8 {
        return Err(CompileError::BadImage("truncated repository".to_string()));
    }
    let (head, rest) = input.split_at(8);
    *input = rest;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(head);
    Ok(u64::from_le_bytes(buf))
}

fn read_cstr(input: &mut &[u8]) -> CompileResult<String> {
    let nul = input
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CompileError::BadImage("unterminated module name".to_string()))?;
    let name = String::from_utf8(input[..nul].to_vec())
        .map_err(|_| CompileError::BadImage("non-utf8 module name".to_string()))?;
    *input = &input[nul + 1..];
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::jit::secondpass::DebugInfo;

    fn binary(code: Vec<u8>) -> BinaryHandle {
        Arc::new(SecondPassBinary {
            code,
            deps: Vec::new(),
            resolve_chain: Vec::new(),
            debug: DebugInfo {
                method_name: "T.m".to_string(),
                export_name: None,
            },
        })
    }

    #[test]
    fn test_fetch_refreshes_timestamp() {
        let repo = PrecompiledRepository::new();
        repo.append("app.dll", 0xABCD, binary(vec![0xC3]));
        assert!(repo.contains("app.dll", 0xABCD));
        assert!(repo.fetch("app.dll", 0xABCD).is_some());
        assert!(repo.fetch("app.dll", 0x1234).is_none());
        let snap = repo.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].2[0].1 > 0);
    }

    #[test]
    fn test_duplicate_append_keeps_first() {
        let repo = PrecompiledRepository::new();
        repo.append("app.dll", 1, binary(vec![0xC3]));
        repo.append("app.dll", 1, binary(vec![0x90, 0xC3]));
        assert_eq!(repo.method_count(), 1);
        assert_eq!(repo.fetch("app.dll", 1).map(|b| b.code.clone()), Some(vec![0xC3]));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.bin");

        let repo = PrecompiledRepository::new();
        repo.append("app.dll", 7, binary(vec![0x55, 0xC3]));
        repo.append("lib.dll", 9, binary(vec![0xC3]));

        let mut arena = ModuleArena::new();
        arena.add(crate::resolve::ModuleInfo::with_helper_row("app.dll", 5));
        repo.persist(&path, &arena).unwrap();

        let loaded = PrecompiledRepository::load(&path).unwrap();
        assert_eq!(loaded.method_count(), 2);
        assert_eq!(loaded.helper_row_of("app.dll"), Some(5));
        assert_eq!(
            loaded.fetch("app.dll", 7).map(|b| b.code.clone()),
            Some(vec![0x55, 0xC3])
        );
        assert_eq!(
            loaded.fetch("lib.dll", 9).map(|b| b.code.clone()),
            Some(vec![0xC3])
        );
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.bin");
        fs::write(&path, b"NOTAREPO").unwrap();
        assert!(matches!(
            PrecompiledRepository::load(&path),
            Err(CompileError::BadImage(_))
        ));
    }
}
