//! Ward runtime: loads protected modules and runs them.
//!
//! Loading runs the module's initializers in order. For Normal-mode
//! anti-tamper that is where every sealed body is verified and decrypted,
//! so a tampered module never becomes runnable. Invoke hooks are installed
//! next; the JIT hook decrypts and verifies a sealed body on its first
//! invocation.
//!
//! ```no_run
//! let bytes = std::fs::read("app.protected.wmod").unwrap();
//! let module = ward_runtime::load(&bytes).unwrap();
//! let answer = module.invoke("main", &[]).unwrap();
//! # let _ = answer;
//! ```

mod error;
mod interp;
mod jit;
mod loader;
mod normal;
mod policy;

pub use error::{ExecError, LoadError};
pub use interp::{DEFAULT_FUEL, MAX_CALL_DEPTH};
pub use loader::LoadedModule;

use ward_core::module::{read_module, Module};

/// Parse a WMOD container and load it.
pub fn load(data: &[u8]) -> Result<LoadedModule, LoadError> {
    LoadedModule::from_module(read_module(data)?)
}

fn section<'m>(
    module: &'m Module,
    helper: &'static str,
    name: &'static str,
) -> Result<&'m [u8], LoadError> {
    module
        .find_section(name)
        .map(|s| s.data.as_slice())
        .ok_or(LoadError::MissingSection {
            helper,
            section: name,
        })
}
