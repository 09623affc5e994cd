//! Protections shipped with Ward.
//!
//! A protection is a named bundle of pipeline phases. Protections that
//! need each other talk through services published in the
//! [`ServiceRegistry`] during initialization, or through a handle passed at
//! construction.

pub mod anti_tamper;
pub mod introspection;
pub mod junk;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use crate::module::ModuleId;
use crate::pipeline::{ProtectError, ProtectionPipeline, ServiceRegistry};

pub use anti_tamper::{AntiTamperProtection, AntiTamperService, ANTI_TAMPER_SERVICE_ID};
pub use introspection::IntrospectionProtection;
pub use junk::JunkProtection;

/// Strength presets. A protection is enabled by a preset when its own
/// preset is at or below the selected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionPreset {
    #[default]
    None,
    Minimum,
    Normal,
    Aggressive,
    Maximum,
}

impl ProtectionPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtectionPreset::None => "none",
            ProtectionPreset::Minimum => "minimum",
            ProtectionPreset::Normal => "normal",
            ProtectionPreset::Aggressive => "aggressive",
            ProtectionPreset::Maximum => "maximum",
        }
    }

    /// Whether a protection declared at `level` is part of this preset.
    pub fn includes(self, level: ProtectionPreset) -> bool {
        level != ProtectionPreset::None && level <= self
    }
}

impl fmt::Display for ProtectionPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtectionPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ProtectionPreset::None),
            "minimum" => Ok(ProtectionPreset::Minimum),
            "normal" => Ok(ProtectionPreset::Normal),
            "aggressive" => Ok(ProtectionPreset::Aggressive),
            "maximum" => Ok(ProtectionPreset::Maximum),
            other => Err(format!("unknown preset '{}'", other)),
        }
    }
}

/// A protection that can be scheduled by the [`crate::Driver`].
pub trait Protection: Send + Sync {
    /// Short id used in logs.
    fn id(&self) -> &'static str;

    /// Globally unique id. Settings and dependency lists refer to this.
    fn full_id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn preset(&self) -> ProtectionPreset;

    /// Protections that must be scheduled after this one.
    fn before(&self) -> &'static [&'static str] {
        &[]
    }

    /// Protections that must be scheduled before this one.
    fn after(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called once per driver, in scheduled order, before any module is
    /// processed.
    fn initialize(&self, _services: &mut ServiceRegistry) -> Result<(), ProtectError> {
        Ok(())
    }

    /// Called when a phase fails for module `id`. Drops whatever per-module
    /// state earlier phases left behind.
    fn abort_module(&self, _id: ModuleId) {}

    fn populate_pipeline(self: Arc<Self>, pipeline: &mut ProtectionPipeline);
}

/// The standard protection set, wired together.
pub fn builtin() -> Vec<Arc<dyn Protection>> {
    let anti_tamper = Arc::new(AntiTamperProtection::new());
    let introspection = Arc::new(IntrospectionProtection::new(anti_tamper.service()));
    vec![anti_tamper, Arc::new(JunkProtection::new()), introspection]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schedule;

    #[test]
    fn preset_ordering() {
        assert!(ProtectionPreset::Normal.includes(ProtectionPreset::Minimum));
        assert!(ProtectionPreset::Normal.includes(ProtectionPreset::Normal));
        assert!(!ProtectionPreset::Minimum.includes(ProtectionPreset::Normal));
        assert!(!ProtectionPreset::Maximum.includes(ProtectionPreset::None));
    }

    #[test]
    fn preset_parse() {
        assert_eq!("Aggressive".parse::<ProtectionPreset>(), Ok(ProtectionPreset::Aggressive));
        assert!("loud".parse::<ProtectionPreset>().is_err());
    }

    #[test]
    fn builtin_schedule_puts_introspection_first() {
        let order: Vec<&str> = schedule(builtin())
            .unwrap()
            .iter()
            .map(|p| p.full_id())
            .collect();
        assert_eq!(order, vec!["ward.introspection", "ward.anti_tamper", "ward.junk"]);
    }
}
