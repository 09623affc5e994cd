//! WMOD container reader.
//!
//! Parses the little-endian container produced by [`super::write_module`].
//! The reader is strict: anything it does not understand is an error, and
//! so are trailing bytes after the last table.

use super::{
    MethodBody, MethodDef, MethodFlags, MethodToken, Module, RuntimeHelper, Section, MODULE_MAGIC,
    MODULE_VERSION,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    #[error("invalid module magic (expected WMOD)")]
    InvalidMagic,
    #[error("unsupported module version {0}")]
    UnsupportedVersion(u16),
    #[error("module is truncated at offset {0}")]
    Truncated(usize),
    #[error("invalid utf-8 in string at offset {0}")]
    InvalidString(usize),
    #[error("unknown runtime helper id {0}")]
    UnknownHelper(u8),
    #[error("unknown body kind {kind} for method {token}")]
    UnknownBodyKind { token: MethodToken, kind: u8 },
    #[error("{0} trailing bytes after module")]
    TrailingBytes(usize),
    #[error("{what} count {count} exceeds the container limit")]
    TooMany { what: &'static str, count: usize },
}

// ---------------------------------------------------------------------------
// Little-endian cursor
// ---------------------------------------------------------------------------

pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ModuleError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(ModuleError::Truncated(self.pos))?;
        if end > self.data.len() {
            return Err(ModuleError::Truncated(self.pos));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ModuleError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ModuleError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ModuleError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ModuleError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], ModuleError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.bytes(N)?);
        Ok(buf)
    }

    fn string(&mut self) -> Result<String, ModuleError> {
        let len = self.u16()? as usize;
        let start = self.pos;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ModuleError::InvalidString(start))
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a WMOD container.
pub fn read_module(data: &[u8]) -> Result<Module, ModuleError> {
    let mut cur = Cursor::new(data);

    if cur.u32()? != MODULE_MAGIC {
        return Err(ModuleError::InvalidMagic);
    }
    let version = cur.u16()?;
    if version != MODULE_VERSION {
        return Err(ModuleError::UnsupportedVersion(version));
    }

    let name = cur.string()?;

    let method_count = cur.u32()? as usize;
    let mut methods = Vec::with_capacity(method_count.min(cur.remaining()));
    for _ in 0..method_count {
        let token = MethodToken(cur.u32()?);
        let name = cur.string()?;
        let params = cur.u8()?;
        let flags = MethodFlags(cur.u16()?);
        let body = match cur.u8()? {
            0 => {
                let len = cur.u32()? as usize;
                MethodBody::Code(cur.bytes(len)?.to_vec())
            }
            1 => MethodBody::Sealed,
            kind => return Err(ModuleError::UnknownBodyKind { token, kind }),
        };
        methods.push(MethodDef {
            token,
            name,
            params,
            flags,
            body,
        });
    }

    let section_count = cur.u16()? as usize;
    let mut sections = Vec::with_capacity(section_count);
    for _ in 0..section_count {
        let name = cur.string()?;
        let len = cur.u32()? as usize;
        sections.push(Section {
            name,
            data: cur.bytes(len)?.to_vec(),
        });
    }

    let initializers = read_helpers(&mut cur)?;
    let invoke_hooks = read_helpers(&mut cur)?;

    if cur.remaining() != 0 {
        return Err(ModuleError::TrailingBytes(cur.remaining()));
    }

    Ok(Module {
        name,
        methods,
        sections,
        initializers,
        invoke_hooks,
    })
}

fn read_helpers(cur: &mut Cursor<'_>) -> Result<Vec<RuntimeHelper>, ModuleError> {
    let count = cur.u8()?;
    (0..count)
        .map(|_| {
            let id = cur.u8()?;
            RuntimeHelper::from_u8(id).ok_or(ModuleError::UnknownHelper(id))
        })
        .collect()
}
