//! In-memory model of a compiled Ward module.
//!
//! A module is a flat list of methods (stack-machine bytecode bodies),
//! a set of named data sections, and references to runtime helpers that
//! the loader runs at load time (initializers) or consults on every
//! method invocation (invoke hooks).

mod reader;
mod writer;

pub(crate) use reader::Cursor;
pub use reader::{read_module, ModuleError};
pub use writer::write_module;

use std::fmt;

/// Container magic: `WMOD`.
pub const MODULE_MAGIC: u32 = 0x444F_4D57;
/// Current container version.
pub const MODULE_VERSION: u16 = 1;
/// First token handed out by the assembler.
pub const FIRST_METHOD_TOKEN: u32 = 0x0600_0001;

/// Identity of a module within one protection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identity of a method inside its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodToken(pub u32);

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Per-method flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MethodFlags(pub u16);

impl MethodFlags {
    pub const NONE: MethodFlags = MethodFlags(0);
    /// The method must stay readable (reflection, diagnostics dumps).
    pub const INTROSPECTABLE: MethodFlags = MethodFlags(0x0001);

    pub fn contains(self, other: MethodFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MethodFlags) {
        self.0 |= other.0;
    }
}

/// Where a method's executable body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodBody {
    /// Plain bytecode.
    Code(Vec<u8>),
    /// Moved into anti-tamper storage; a runtime helper supplies it.
    Sealed,
}

impl MethodBody {
    pub fn code(&self) -> Option<&[u8]> {
        match self {
            MethodBody::Code(code) => Some(code),
            MethodBody::Sealed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub token: MethodToken,
    pub name: String,
    /// Number of arguments the method takes.
    pub params: u8,
    pub flags: MethodFlags,
    pub body: MethodBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
}

/// Runtime helper routines shipped by `ward-runtime` that a module can
/// reference. The module only stores the reference; the loader owns the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuntimeHelper {
    /// Verifies and decrypts every sealed body before the module runs.
    NormalInitializer = 1,
    /// Decrypts and verifies a sealed body on its first invocation.
    JitHook = 2,
}

impl RuntimeHelper {
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            1 => Some(RuntimeHelper::NormalInitializer),
            2 => Some(RuntimeHelper::JitHook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Module {
    pub name: String,
    pub methods: Vec<MethodDef>,
    pub sections: Vec<Section>,
    pub initializers: Vec<RuntimeHelper>,
    pub invoke_hooks: Vec<RuntimeHelper>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn method(&self, token: MethodToken) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.token == token)
    }

    pub fn method_mut(&mut self, token: MethodToken) -> Option<&mut MethodDef> {
        self.methods.iter_mut().find(|m| m.token == token)
    }

    pub fn method_by_name(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// All method tokens, ascending.
    pub fn tokens(&self) -> Vec<MethodToken> {
        let mut tokens: Vec<MethodToken> = self.methods.iter().map(|m| m.token).collect();
        tokens.sort();
        tokens
    }

    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Replace the data of `name`, appending the section if it does not exist.
    pub fn set_section(&mut self, name: &str, data: Vec<u8>) {
        match self.sections.iter_mut().find(|s| s.name == name) {
            Some(section) => section.data = data,
            None => self.sections.push(Section {
                name: name.to_string(),
                data,
            }),
        }
    }

    /// Next unused method token.
    pub fn next_token(&self) -> MethodToken {
        self.methods
            .iter()
            .map(|m| m.token.0 + 1)
            .max()
            .map(MethodToken)
            .unwrap_or(MethodToken(FIRST_METHOD_TOKEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(token: u32, name: &str) -> MethodDef {
        MethodDef {
            token: MethodToken(token),
            name: name.to_string(),
            params: 0,
            flags: MethodFlags::NONE,
            body: MethodBody::Code(vec![0x3F]),
        }
    }

    #[test]
    fn tokens_are_sorted() {
        let mut module = Module::new("m");
        module.methods.push(method(0x0600_0003, "c"));
        module.methods.push(method(0x0600_0001, "a"));
        assert_eq!(module.tokens(), vec![MethodToken(0x0600_0001), MethodToken(0x0600_0003)]);
        assert_eq!(module.next_token(), MethodToken(0x0600_0004));
    }

    #[test]
    fn set_section_replaces_in_place() {
        let mut module = Module::new("m");
        module.set_section(".a", vec![1]);
        module.set_section(".b", vec![2]);
        module.set_section(".a", vec![3, 4]);
        assert_eq!(module.sections.len(), 2);
        assert_eq!(module.find_section(".a").map(|s| s.data.clone()), Some(vec![3, 4]));
    }

    #[test]
    fn flags_contain() {
        let mut flags = MethodFlags::NONE;
        assert!(!flags.contains(MethodFlags::INTROSPECTABLE));
        flags.insert(MethodFlags::INTROSPECTABLE);
        assert!(flags.contains(MethodFlags::INTROSPECTABLE));
    }

    #[test]
    fn empty_module_starts_at_first_token() {
        assert_eq!(Module::new("m").next_token(), MethodToken(FIRST_METHOD_TOKEN));
    }
}
