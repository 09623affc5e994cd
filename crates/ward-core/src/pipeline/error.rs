use crate::module::{MethodToken, ModuleError, ModuleId};
use crate::protections::anti_tamper::meta::MetaError;
use crate::vm::DecodeError;

/// Errors raised while protecting a module. Every variant aborts
/// processing of the module it occurred in.
#[derive(Debug, thiserror::Error)]
pub enum ProtectError {
    /// `mode` names something other than `normal` or `jit`.
    #[error("unknown anti-tamper mode '{0}' (expected 'normal' or 'jit')")]
    UnknownMode(String),

    #[error("parameter '{name}' has invalid value '{value}': {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    /// Metadata finalization found no handle left by injection. The inject
    /// phase was skipped or the pipeline ran out of order.
    #[error("no anti-tamper handle for module '{module}' ({id}); injection did not run before metadata finalization")]
    MissingHandle { module: String, id: ModuleId },

    #[error("module '{module}' ({id}) already holds an anti-tamper handle")]
    DuplicateHandle { module: String, id: ModuleId },

    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("service '{0}' is not registered")]
    ServiceNotFound(String),

    #[error("service '{0}' has a different type than requested")]
    ServiceType(String),

    #[error("protection dependency cycle between {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("module '{module}' has no method named '{name}'")]
    UnknownMethod { module: String, name: String },

    #[error("method {token} has an undecodable body: {source}")]
    Decode {
        token: MethodToken,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Module(#[from] ModuleError),
}
