//! Anti-tamper storage layout.
//!
//! Shared by the protection side, which writes the tables, and
//! `ward-runtime`, which reads them back at load or invoke time.
//!
//! ```text
//! .atbody   ciphertext of every protected body, back to back
//! .atinit   "ATN1" | u8 policy | [32] masked tail key | [32] root | u32 n
//!           n × { u32 token | u32 offset | u32 len | [32] digest }
//! .atjit    "ATJ1" | u8 policy | [16] masked key | u32 n
//!           n × { u32 token | u32 offset | u32 len | u64 nonce | [32] digest }
//! ```

use std::fmt;
use std::str::FromStr;

use crate::crypto::digest::{module_mask, sha256_parts, xor_mask, Digest256};
use crate::crypto::xtea::{key_from_bytes, XteaKey};
use crate::module::{Cursor, MethodToken, ModuleError};

pub const BODY_SECTION: &str = ".atbody";
pub const NORMAL_SECTION: &str = ".atinit";
pub const JIT_SECTION: &str = ".atjit";

pub const NORMAL_MAGIC: [u8; 4] = *b"ATN1";
pub const JIT_MAGIC: [u8; 4] = *b"ATJ1";

const NORMAL_MASK_DOMAIN: &str = "atinit.tail";
const JIT_MASK_DOMAIN: &str = "atjit.key";

// ─── Tamper policy ──────────────────────────────────────────

/// What the runtime does when a protected body fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TamperPolicy {
    /// Refuse to load (Normal) or to run (JIT) and poison the module.
    #[default]
    Reject = 0,
    /// Keep running with every result silently corrupted.
    Corrupt = 1,
    /// Abort the process.
    Abort = 2,
}

impl TamperPolicy {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TamperPolicy::Reject),
            1 => Some(TamperPolicy::Corrupt),
            2 => Some(TamperPolicy::Abort),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TamperPolicy::Reject => "reject",
            TamperPolicy::Corrupt => "corrupt",
            TamperPolicy::Abort => "abort",
        }
    }
}

impl fmt::Display for TamperPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TamperPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(TamperPolicy::Reject),
            "corrupt" => Ok(TamperPolicy::Corrupt),
            "abort" => Ok(TamperPolicy::Abort),
            other => Err(format!(
                "unknown tamper policy '{}' (expected reject, corrupt or abort)",
                other
            )),
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaError {
    #[error("{section} has bad magic")]
    BadMagic { section: &'static str },
    #[error("unknown tamper policy byte {0}")]
    UnknownPolicy(u8),
    #[error("{0} trailing bytes after table")]
    TrailingBytes(usize),
    #[error("body of {token} ({offset}+{len}) lies outside .atbody ({body_len} bytes)")]
    OutOfRange {
        token: MethodToken,
        offset: u32,
        len: u32,
        body_len: usize,
    },
    #[error("table has too many entries ({0})")]
    TooMany(usize),
    #[error(transparent)]
    Layout(#[from] ModuleError),
}

// ─── Normal table ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalEntry {
    pub token: MethodToken,
    pub offset: u32,
    pub len: u32,
    pub digest: Digest256,
}

/// Contents of `.atinit`. Entries are in chain order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalTable {
    pub policy: TamperPolicy,
    pub masked_tail_key: Digest256,
    pub root: Digest256,
    pub entries: Vec<NormalEntry>,
}

impl NormalTable {
    pub fn mask_tail_key(tail_key: &Digest256, module_name: &str) -> Digest256 {
        let mut out = *tail_key;
        xor_mask(&mut out, &module_mask(module_name, NORMAL_MASK_DOMAIN));
        out
    }

    pub fn tail_key(&self, module_name: &str) -> Digest256 {
        Self::mask_tail_key(&self.masked_tail_key, module_name)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| MetaError::TooMany(self.entries.len()))?;
        let mut buf = Vec::with_capacity(73 + self.entries.len() * 44);
        buf.extend_from_slice(&NORMAL_MAGIC);
        buf.push(self.policy as u8);
        buf.extend_from_slice(&self.masked_tail_key);
        buf.extend_from_slice(&self.root);
        buf.extend_from_slice(&count.to_le_bytes());
        for e in &self.entries {
            buf.extend_from_slice(&e.token.0.to_le_bytes());
            buf.extend_from_slice(&e.offset.to_le_bytes());
            buf.extend_from_slice(&e.len.to_le_bytes());
            buf.extend_from_slice(&e.digest);
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MetaError> {
        let mut cur = Cursor::new(data);
        if cur.array::<4>()? != NORMAL_MAGIC {
            return Err(MetaError::BadMagic {
                section: NORMAL_SECTION,
            });
        }
        let policy = read_policy(&mut cur)?;
        let masked_tail_key = cur.array::<32>()?;
        let root = cur.array::<32>()?;
        let count = cur.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(cur.remaining() / 44));
        for _ in 0..count {
            entries.push(NormalEntry {
                token: MethodToken(cur.u32()?),
                offset: cur.u32()?,
                len: cur.u32()?,
                digest: cur.array::<32>()?,
            });
        }
        expect_end(&cur)?;
        Ok(NormalTable {
            policy,
            masked_tail_key,
            root,
            entries,
        })
    }
}

// ─── JIT table ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitEntry {
    pub token: MethodToken,
    pub offset: u32,
    pub len: u32,
    pub nonce: u64,
    /// [`jit_digest`] of the plaintext body.
    pub digest: Digest256,
}

/// Contents of `.atjit`. Entries are in token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitTable {
    pub policy: TamperPolicy,
    pub masked_key: [u8; 16],
    pub entries: Vec<JitEntry>,
}

impl JitTable {
    pub fn mask_key(key: &[u8; 16], module_name: &str) -> [u8; 16] {
        let mut out = *key;
        xor_mask(&mut out, &module_mask(module_name, JIT_MASK_DOMAIN));
        out
    }

    pub fn key(&self, module_name: &str) -> XteaKey {
        key_from_bytes(&Self::mask_key(&self.masked_key, module_name))
    }

    pub fn entry(&self, token: MethodToken) -> Option<(usize, &JitEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.token == token)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| MetaError::TooMany(self.entries.len()))?;
        let mut buf = Vec::with_capacity(25 + self.entries.len() * 52);
        buf.extend_from_slice(&JIT_MAGIC);
        buf.push(self.policy as u8);
        buf.extend_from_slice(&self.masked_key);
        buf.extend_from_slice(&count.to_le_bytes());
        for e in &self.entries {
            buf.extend_from_slice(&e.token.0.to_le_bytes());
            buf.extend_from_slice(&e.offset.to_le_bytes());
            buf.extend_from_slice(&e.len.to_le_bytes());
            buf.extend_from_slice(&e.nonce.to_le_bytes());
            buf.extend_from_slice(&e.digest);
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MetaError> {
        let mut cur = Cursor::new(data);
        if cur.array::<4>()? != JIT_MAGIC {
            return Err(MetaError::BadMagic {
                section: JIT_SECTION,
            });
        }
        let policy = read_policy(&mut cur)?;
        let masked_key = cur.array::<16>()?;
        let count = cur.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(cur.remaining() / 52));
        for _ in 0..count {
            entries.push(JitEntry {
                token: MethodToken(cur.u32()?),
                offset: cur.u32()?,
                len: cur.u32()?,
                nonce: cur.u64()?,
                digest: cur.array::<32>()?,
            });
        }
        expect_end(&cur)?;
        Ok(JitTable {
            policy,
            masked_key,
            entries,
        })
    }
}

// ─── Helpers ────────────────────────────────────────────────

/// Digest stored for a JIT body. Binding the token keeps entries from
/// being swapped between methods.
pub fn jit_digest(token: MethodToken, plain: &[u8]) -> Digest256 {
    sha256_parts(&[token.0.to_le_bytes().as_slice(), plain])
}

/// The slice of `.atbody` an entry points at.
pub fn body_slice(
    body: &[u8],
    token: MethodToken,
    offset: u32,
    len: u32,
) -> Result<&[u8], MetaError> {
    let start = offset as usize;
    start
        .checked_add(len as usize)
        .filter(|&end| end <= body.len())
        .map(|end| &body[start..end])
        .ok_or(MetaError::OutOfRange {
            token,
            offset,
            len,
            body_len: body.len(),
        })
}

fn read_policy(cur: &mut Cursor<'_>) -> Result<TamperPolicy, MetaError> {
    let raw = cur.u8()?;
    TamperPolicy::from_u8(raw).ok_or(MetaError::UnknownPolicy(raw))
}

fn expect_end(cur: &Cursor<'_>) -> Result<(), MetaError> {
    match cur.remaining() {
        0 => Ok(()),
        n => Err(MetaError::TrailingBytes(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal() -> NormalTable {
        NormalTable {
            policy: TamperPolicy::Corrupt,
            masked_tail_key: [7; 32],
            root: [9; 32],
            entries: vec![
                NormalEntry { token: MethodToken(0x0600_0001), offset: 0, len: 5, digest: [1; 32] },
                NormalEntry { token: MethodToken(0x0600_0003), offset: 5, len: 11, digest: [2; 32] },
            ],
        }
    }

    #[test]
    fn normal_table_round_trip() {
        let table = normal();
        let bytes = table.encode().unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 32 + 32 + 4 + 2 * 44);
        assert_eq!(NormalTable::decode(&bytes).unwrap(), table);
    }

    #[test]
    fn jit_table_round_trip() {
        let table = JitTable {
            policy: TamperPolicy::Reject,
            masked_key: [3; 16],
            entries: vec![JitEntry {
                token: MethodToken(0x0600_0002),
                offset: 0,
                len: 9,
                nonce: 0xDEAD_BEEF_0000_0001,
                digest: [4; 32],
            }],
        };
        let bytes = table.encode().unwrap();
        assert_eq!(JitTable::decode(&bytes).unwrap(), table);
        assert_eq!(table.entry(MethodToken(0x0600_0002)).map(|(i, _)| i), Some(0));
        assert!(table.entry(MethodToken(1)).is_none());
    }

    #[test]
    fn decode_rejects_wrong_magic_and_policy() {
        let mut bytes = normal().encode().unwrap();
        assert!(matches!(JitTable::decode(&bytes), Err(MetaError::BadMagic { .. })));
        bytes[4] = 9;
        assert_eq!(NormalTable::decode(&bytes), Err(MetaError::UnknownPolicy(9)));
    }

    #[test]
    fn decode_rejects_truncation_and_trailing() {
        let bytes = normal().encode().unwrap();
        assert!(matches!(
            NormalTable::decode(&bytes[..bytes.len() - 1]),
            Err(MetaError::Layout(ModuleError::Truncated(_)))
        ));
        let mut long = bytes.clone();
        long.push(0);
        assert_eq!(NormalTable::decode(&long), Err(MetaError::TrailingBytes(1)));
    }

    #[test]
    fn masks_are_bound_to_module_name() {
        let key = [0x11u8; 32];
        let masked = NormalTable::mask_tail_key(&key, "app");
        assert_ne!(masked, key);
        let table = NormalTable { masked_tail_key: masked, ..normal() };
        assert_eq!(table.tail_key("app"), key);
        assert_ne!(table.tail_key("other"), key);
    }

    #[test]
    fn body_slice_bounds() {
        let body = [0u8; 10];
        assert_eq!(body_slice(&body, MethodToken(1), 2, 8).unwrap().len(), 8);
        assert!(body_slice(&body, MethodToken(1), 3, 8).is_err());
        assert!(body_slice(&body, MethodToken(1), u32::MAX, 2).is_err());
    }

    #[test]
    fn policy_parse() {
        assert_eq!("CORRUPT".parse::<TamperPolicy>(), Ok(TamperPolicy::Corrupt));
        assert!("ignore".parse::<TamperPolicy>().is_err());
        assert_eq!(TamperPolicy::default(), TamperPolicy::Reject);
    }
}
