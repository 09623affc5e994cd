//! # Ward: anti-tamper protection for bytecode modules
//!
//! Ward post-processes WMOD bytecode modules. Protections run as phases
//! of a fixed pipeline; the anti-tamper protection seals method bodies so
//! that a modified module refuses to run, in one of two modes:
//!
//! - **normal**: a load-time initializer verifies a cascade integrity
//!   chain over all sealed bodies and decrypts them before anything runs.
//! - **jit**: each body is decrypted and verified on its first invocation.
//!
//! ## Usage
//!
//! ```no_run
//! use ward::{assemble, protections, Driver, ModuleId, ModuleSettings, ProtectionSettings};
//!
//! let module = assemble(".module demo\n.method main 0\n    push 42\n    ret\n.end\n").unwrap();
//! let driver = Driver::new(protections::builtin()).unwrap().with_seed(0xC0FFEE);
//! let settings = ModuleSettings::new().enable(
//!     "ward.anti_tamper",
//!     ProtectionSettings::default().with("mode", "jit"),
//! );
//! let protected = driver.protect(ModuleId(0), module, &settings).unwrap();
//! let loaded = ward::LoadedModule::from_module(protected).unwrap();
//! assert_eq!(loaded.invoke("main", &[]).unwrap(), 42);
//! ```

pub use ward_core::config::{self, ConfigError, ModuleConfig, ProjectConfig};
pub use ward_core::module::{
    self, read_module, write_module, MethodBody, MethodDef, MethodFlags, MethodToken, Module,
    ModuleError, ModuleId, RuntimeHelper, Section,
};
pub use ward_core::pipeline::{
    self, Driver, ModuleContext, ModuleSettings, PipelineStage, ProtectError,
    ProtectionParameters, ProtectionPhase, ProtectionPipeline, ProtectionSettings,
    ProtectionTargets, ServiceRegistry,
};
pub use ward_core::protections::{
    self, anti_tamper, AntiTamperProtection, AntiTamperService, IntrospectionProtection,
    JunkProtection, Protection, ProtectionPreset, ANTI_TAMPER_SERVICE_ID,
};
pub use ward_core::vm::{self, assemble, AsmError, Instruction};

pub use ward_runtime::{load, ExecError, LoadError, LoadedModule};
