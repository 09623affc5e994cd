use std::fmt;
use std::str::FromStr;

use super::meta::TamperPolicy;
use super::{jit::JitMode, normal::NormalMode, AntiTamperProtection};
use crate::module::MethodToken;
use crate::pipeline::{ModuleContext, ProtectError};

/// How protected bodies are recovered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Every body is verified and decrypted by a load-time initializer.
    #[default]
    Normal,
    /// Each body is verified and decrypted on its first invocation.
    Jit,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Jit => "jit",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ProtectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "jit" => Ok(Mode::Jit),
            _ => Err(ProtectError::UnknownMode(s.to_string())),
        }
    }
}

/// Per-module strategy state, created by the inject phase and consumed by
/// metadata finalization.
pub(super) trait ModeHandler: Send {
    fn mode(&self) -> Mode;

    fn inject(
        &mut self,
        parent: &AntiTamperProtection,
        ctx: &mut ModuleContext,
        targets: &[MethodToken],
    ) -> Result<(), ProtectError>;

    fn finalize(
        self: Box<Self>,
        parent: &AntiTamperProtection,
        ctx: &mut ModuleContext,
        targets: &[MethodToken],
    ) -> Result<(), ProtectError>;
}

pub(super) fn handler_for(mode: Mode, policy: TamperPolicy) -> Box<dyn ModeHandler> {
    match mode {
        Mode::Normal => Box::new(NormalMode::new(policy)),
        Mode::Jit => Box::new(JitMode::new(policy)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!("JIT".parse::<Mode>().unwrap(), Mode::Jit);
        assert_eq!("Normal".parse::<Mode>().unwrap(), Mode::Normal);
    }

    #[test]
    fn unknown_mode_is_an_error() {
        match "dynamic".parse::<Mode>() {
            Err(ProtectError::UnknownMode(m)) => assert_eq!(m, "dynamic"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn handler_matches_mode() {
        assert_eq!(handler_for(Mode::Jit, TamperPolicy::Reject).mode(), Mode::Jit);
        assert_eq!(handler_for(Mode::Normal, TamperPolicy::Abort).mode(), Mode::Normal);
    }
}
