use ward_core::module::{MethodToken, ModuleError};
use ward_core::protections::anti_tamper::meta::MetaError;
use ward_core::vm::DecodeError;

/// Errors raised while loading a module.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("anti-tamper table is malformed: {0}")]
    Meta(#[from] MetaError),

    #[error("module references runtime helper {helper} but has no {section} section")]
    MissingSection {
        helper: &'static str,
        section: &'static str,
    },

    #[error("{helper} cannot be used as {role}")]
    MisplacedHelper {
        helper: &'static str,
        role: &'static str,
    },

    #[error("module '{module}' failed integrity verification: {reason}")]
    Tampered { module: String, reason: String },
}

/// Errors raised while executing a method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("no method named '{0}'")]
    UnknownMethod(String),

    #[error("no method with token {0}")]
    UnknownToken(MethodToken),

    #[error("method {method} takes {expected} arguments, got {got}")]
    Arity {
        method: MethodToken,
        expected: u8,
        got: usize,
    },

    #[error("method {0} is sealed and no runtime helper supplies its body")]
    SealedBody(MethodToken),

    #[error("method {0} failed integrity verification")]
    Tampered(MethodToken),

    #[error("module is poisoned after a failed integrity check")]
    Poisoned,

    #[error("method {token} has an undecodable body: {source}")]
    Decode {
        token: MethodToken,
        #[source]
        source: DecodeError,
    },

    #[error("stack underflow in {method} at instruction {pc}")]
    StackUnderflow { method: MethodToken, pc: usize },

    #[error("stack overflow in {method} at instruction {pc}")]
    StackOverflow { method: MethodToken, pc: usize },

    #[error("argument {index} out of range in {method}")]
    BadArgument { method: MethodToken, index: u8 },

    #[error("method {0} ran off the end of its body")]
    MissingReturn(MethodToken),

    #[error("call depth limit {0} exceeded")]
    CallDepth(usize),

    #[error("fuel exhausted")]
    FuelExhausted,
}
