//! Project files.
//!
//! A project lists the modules to protect and, per module, a preset plus
//! explicit protection settings:
//!
//! ```toml
//! seed = "c0ffee"
//!
//! [[module]]
//! input = "app.wmod"
//! preset = "normal"
//!
//! [module.protections."ward.anti_tamper"]
//! mode = "jit"
//! methods = ["check_license"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::pipeline::{ModuleSettings, ProtectionSettings};
use crate::protections::{Protection, ProtectionPreset};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid project file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid hex seed '{0}'")]
    InvalidSeed(String),
    #[error("module '{module}' configures unknown protection '{id}'")]
    UnknownProtection { module: String, id: String },
    #[error("'{protection}.{key}' must be a string, number or boolean")]
    BadValue { protection: String, key: String },
    #[error("'{protection}.methods' must be a list of method names")]
    BadMethods { protection: String },
    #[error("project lists no modules")]
    NoModules,
}

/// Parse a hex seed, with or without a `0x` prefix.
pub fn parse_seed(s: &str) -> Result<u64, ConfigError> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidSeed(s.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Hex seed. A random one is drawn when absent.
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(rename = "module", default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    pub input: PathBuf,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub preset: ProtectionPreset,
    /// Settings keyed by protection `full_id`.
    #[serde(default)]
    pub protections: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

impl ProjectConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: ProjectConfig = toml::from_str(text)?;
        if config.modules.is_empty() {
            return Err(ConfigError::NoModules);
        }
        Ok(config)
    }

    /// Load a project. Relative module paths are resolved against the
    /// directory of the project file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        if let Some(base) = path.parent() {
            for module in &mut config.modules {
                module.input = base.join(&module.input);
                if let Some(out) = module.output.take() {
                    module.output = Some(base.join(out));
                }
            }
        }
        Ok(config)
    }

    pub fn seed(&self) -> Result<Option<u64>, ConfigError> {
        self.seed.as_deref().map(parse_seed).transpose()
    }
}

impl ModuleConfig {
    /// `app.wmod` → `app.protected.wmod` unless an output is given.
    pub fn output_path(&self) -> PathBuf {
        if let Some(out) = &self.output {
            return out.clone();
        }
        let stem = self
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match self.input.extension() {
            Some(ext) => format!("{}.protected.{}", stem, ext.to_string_lossy()),
            None => format!("{}.protected", stem),
        };
        self.input.with_file_name(name)
    }

    fn label(&self) -> String {
        self.input.display().to_string()
    }

    /// Resolve the preset and explicit settings against the available
    /// protections. An explicit entry enables its protection; `enabled =
    /// false` turns one off even if the preset includes it.
    pub fn settings(
        &self,
        protections: &[Arc<dyn Protection>],
    ) -> Result<ModuleSettings, ConfigError> {
        let mut settings = ModuleSettings::new();
        for p in protections {
            if self.preset.includes(p.preset()) {
                settings = settings.enable(p.full_id(), ProtectionSettings::default());
            }
        }

        for (id, table) in &self.protections {
            if !protections.iter().any(|p| p.full_id() == id) {
                return Err(ConfigError::UnknownProtection {
                    module: self.label(),
                    id: id.clone(),
                });
            }
            let mut entry = ProtectionSettings::default();
            let mut enabled = true;
            for (key, value) in table {
                match (key.as_str(), value) {
                    ("enabled", toml::Value::Boolean(on)) => enabled = *on,
                    ("methods", toml::Value::Array(items)) => {
                        let names = items
                            .iter()
                            .map(|v| v.as_str().map(str::to_string))
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(|| ConfigError::BadMethods { protection: id.clone() })?;
                        entry.methods = Some(names);
                    }
                    ("methods", _) => {
                        return Err(ConfigError::BadMethods { protection: id.clone() })
                    }
                    (_, value) => {
                        entry.values.insert(key.clone(), scalar(id, key, value)?);
                    }
                }
            }
            if enabled {
                settings.protections.insert(id.clone(), entry);
            } else {
                settings.protections.remove(id);
            }
        }
        Ok(settings)
    }
}

fn scalar(protection: &str, key: &str, value: &toml::Value) -> Result<String, ConfigError> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        _ => Err(ConfigError::BadValue {
            protection: protection.to_string(),
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protections::builtin;

    const PROJECT: &str = r#"
seed = "0xC0FFEE"

[[module]]
input = "app.wmod"
preset = "normal"

[module.protections."ward.anti_tamper"]
mode = "jit"
on_tamper = "corrupt"
methods = ["check", "verify"]

[[module]]
input = "lib.wmod"
output = "out/lib.wmod"

[module.protections."ward.junk"]
ratio = 4
"#;

    #[test]
    fn parses_project() {
        let project = ProjectConfig::from_toml(PROJECT).unwrap();
        assert_eq!(project.seed().unwrap(), Some(0xC0FFEE));
        assert_eq!(project.modules.len(), 2);
        assert_eq!(project.modules[0].preset, ProtectionPreset::Normal);
        assert_eq!(project.modules[1].preset, ProtectionPreset::None);
        assert_eq!(project.modules[0].output_path(), PathBuf::from("app.protected.wmod"));
        assert_eq!(project.modules[1].output_path(), PathBuf::from("out/lib.wmod"));
    }

    #[test]
    fn resolves_settings_with_preset() {
        let project = ProjectConfig::from_toml(PROJECT).unwrap();
        let protections = builtin();

        let first = project.modules[0].settings(&protections).unwrap();
        assert!(first.is_enabled("ward.junk"));
        assert!(first.is_enabled("ward.introspection"));
        let at = &first.protections["ward.anti_tamper"];
        assert_eq!(at.values["mode"], "jit");
        assert_eq!(at.values["on_tamper"], "corrupt");
        assert_eq!(at.methods.as_deref(), Some(&["check".to_string(), "verify".to_string()][..]));

        let second = project.modules[1].settings(&protections).unwrap();
        assert_eq!(second.protections.len(), 1);
        assert_eq!(second.protections["ward.junk"].values["ratio"], "4");
    }

    #[test]
    fn enabled_false_overrides_preset() {
        let project = ProjectConfig::from_toml(
            "[[module]]\ninput = \"a.wmod\"\npreset = \"maximum\"\n\
             [module.protections.\"ward.junk\"]\nenabled = false\n",
        )
        .unwrap();
        let settings = project.modules[0].settings(&builtin()).unwrap();
        assert!(!settings.is_enabled("ward.junk"));
        assert!(settings.is_enabled("ward.anti_tamper"));
    }

    #[test]
    fn rejects_unknown_protection_and_bad_values() {
        let unknown = ProjectConfig::from_toml(
            "[[module]]\ninput = \"a.wmod\"\n[module.protections.\"ward.nope\"]\n",
        )
        .unwrap();
        assert!(matches!(
            unknown.modules[0].settings(&builtin()),
            Err(ConfigError::UnknownProtection { .. })
        ));

        let nested = ProjectConfig::from_toml(
            "[[module]]\ninput = \"a.wmod\"\n[module.protections.\"ward.junk\"]\nratio = [1]\n",
        )
        .unwrap();
        assert!(matches!(
            nested.modules[0].settings(&builtin()),
            Err(ConfigError::BadValue { .. })
        ));

        let methods = ProjectConfig::from_toml(
            "[[module]]\ninput = \"a.wmod\"\n[module.protections.\"ward.junk\"]\nmethods = \"a\"\n",
        )
        .unwrap();
        assert!(matches!(
            methods.modules[0].settings(&builtin()),
            Err(ConfigError::BadMethods { .. })
        ));
    }

    #[test]
    fn rejects_empty_project_and_bad_seed() {
        assert!(matches!(ProjectConfig::from_toml(""), Err(ConfigError::NoModules)));
        assert!(matches!(parse_seed("xyz"), Err(ConfigError::InvalidSeed(_))));
        assert_eq!(parse_seed("0Xff").unwrap(), 0xFF);
    }
}
