//! Compiler configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Target-machine parameters the compiler keys encoding decisions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSpec {
    /// Machine word size in bytes
    pub word: u32,
    /// Largest forward distance (exclusive) still encodable as a short jump
    pub short_jump_threshold: i64,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            word: 8,
            short_jump_threshold: 127,
        }
    }
}

/// Runtime configuration for the compiler engine.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Whether protected regions are compiled into handler helpers
    pub exception_handling: bool,
    pub machine: MachineSpec,
    /// Where the persistent repository is stored (None = in-memory only)
    pub repository_path: Option<PathBuf>,
    pub worker_count: u32,
    pub trace: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            exception_handling: true,
            machine: MachineSpec::default(),
            repository_path: None,
            worker_count: 1,
            trace: false,
        }
    }
}

/// On-disk configuration (ciljit.toml)
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub compiler: CompilerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompilerSection {
    #[serde(default = "default_true")]
    pub exception_handling: bool,
    #[serde(default)]
    pub repository: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub trace: bool,
}

fn default_true() -> bool {
    true
}

fn default_workers() -> u32 {
    1
}

impl Default for CompilerSection {
    fn default() -> Self {
        Self {
            exception_handling: true,
            repository: None,
            workers: 1,
            trace: false,
        }
    }
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }

    pub fn into_config(self) -> CompilerConfig {
        CompilerConfig {
            exception_handling: self.compiler.exception_handling,
            machine: MachineSpec::default(),
            repository_path: self.compiler.repository,
            worker_count: self.compiler.workers.max(1),
            trace: self.compiler.trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CompilerConfig::default();
        assert!(cfg.exception_handling);
        assert_eq!(cfg.machine.word, 8);
        assert_eq!(cfg.machine.short_jump_threshold, 127);
    }

    #[test]
    fn test_parse_toml() {
        let file: ConfigFile = toml::from_str(
            r#"
            [compiler]
            exception_handling = false
            workers = 4
            trace = true
            "#,
        )
        .unwrap();
        let cfg = file.into_config();
        assert!(!cfg.exception_handling);
        assert_eq!(cfg.worker_count, 4);
        assert!(cfg.trace);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let file: ConfigFile = toml::from_str("").unwrap();
        let cfg = file.into_config();
        assert!(cfg.exception_handling);
        assert_eq!(cfg.worker_count, 1);
    }
}
