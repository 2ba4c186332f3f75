//! Execution-side services: caches, the persistent repository, background
//! workers, and installation of linked code into executable memory.

pub mod binary_cache;
pub mod memory;
pub mod repository;
pub mod worker;
