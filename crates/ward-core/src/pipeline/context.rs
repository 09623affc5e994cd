use std::collections::BTreeMap;
use std::str::FromStr;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use super::ProtectError;
use crate::crypto::splitmix_finalize;
use crate::module::{MethodToken, Module, ModuleId};

const MODULE_SEED_PRIME: u64 = 0x9E37_79B9_7F4A_7C15;

/// Everything a phase may touch while one module is being processed.
pub struct ModuleContext {
    pub id: ModuleId,
    pub module: Module,
    rng: ChaCha20Rng,
}

impl ModuleContext {
    /// The RNG is derived from the run seed and the module id, so two
    /// modules never share a keystream and a fixed seed reproduces a build.
    pub fn new(id: ModuleId, module: Module, seed: u64) -> Self {
        let module_seed =
            splitmix_finalize(seed ^ (id.0 as u64 + 1).wrapping_mul(MODULE_SEED_PRIME));
        ModuleContext {
            id,
            module,
            rng: ChaCha20Rng::seed_from_u64(module_seed),
        }
    }

    pub fn rng(&mut self) -> &mut ChaCha20Rng {
        &mut self.rng
    }

    pub fn into_module(self) -> Module {
        self.module
    }
}

/// Per-invocation input of a phase: its target set plus the owning
/// protection's parameters for this module.
#[derive(Debug, Clone, Default)]
pub struct ProtectionParameters {
    pub targets: Vec<MethodToken>,
    values: BTreeMap<String, String>,
}

impl ProtectionParameters {
    pub fn new(targets: Vec<MethodToken>, values: BTreeMap<String, String>) -> Self {
        ProtectionParameters { targets, values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Parse `name`, falling back to `default` when it is absent.
    pub fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ProtectError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ProtectError::InvalidParameter {
                name: name.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
