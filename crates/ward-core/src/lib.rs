//! Ward core: module model, bytecode, crypto primitives and the
//! protection pipeline.
//!
//! Everything that runs at protection time lives here. The runtime side
//! (loading a protected module and executing it) lives in `ward-runtime`,
//! which shares the metadata layouts defined in [`protections::anti_tamper::meta`].

pub mod config;
pub mod crypto;
pub mod integrity;
pub mod module;
pub mod pipeline;
pub mod protections;
pub mod vm;

pub use module::{MethodBody, MethodDef, MethodFlags, MethodToken, Module, ModuleId, RuntimeHelper, Section};
pub use pipeline::{Driver, ModuleContext, ProtectError};
