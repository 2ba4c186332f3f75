//! In-memory cache of linked method binaries.
//!
//! Shared between compiler workers and the runtime. Every lookup and
//! insert takes the lock for the duration of that one operation only, so
//! two workers racing on the same token are both valid; a duplicate insert
//! simply overwrites with an equivalent binary.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::jit::secondpass::BinaryHandle;
use crate::model::Token;

#[derive(Default)]
pub struct BinaryCache {
    entries: Mutex<HashMap<Token, BinaryHandle>>,
}

impl BinaryCache {
    pub fn new() -> BinaryCache {
        BinaryCache::default()
    }

    pub fn is_method_exist(&self, token: Token) -> bool {
        match self.entries.lock() {
            Ok(map) => map.contains_key(&token),
            Err(poisoned) => poisoned.into_inner().contains_key(&token),
        }
    }

    pub fn get_second_pass_method(&self, token: Token) -> Option<BinaryHandle> {
        match self.entries.lock() {
            Ok(map) => map.get(&token).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&token).cloned(),
        }
    }

    pub fn add_second_pass_method(&self, token: Token, binary: BinaryHandle) {
        match self.entries.lock() {
            Ok(mut map) => {
                map.insert(token, binary);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(token, binary);
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
