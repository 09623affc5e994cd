//! JIT-mode invoke hook.
//!
//! Each protected method owns a `OnceLock`. The first invocation decrypts
//! and verifies the body inside `get_or_init`; concurrent first callers
//! block on the same cell, so a body is decoded exactly once no matter how
//! many threads race for it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use tracing::debug;
use ward_core::crypto::xtea::{ctr_apply, XteaKey};
use ward_core::module::{MethodToken, Module};
use ward_core::protections::anti_tamper::meta::{
    body_slice, jit_digest, JitTable, TamperPolicy, BODY_SECTION, JIT_SECTION,
};

use crate::error::{ExecError, LoadError};
use crate::policy::{TamperState, Verdict};
use crate::section;

const HELPER: &str = "JitHook";

enum Decoded {
    Verified(Vec<u8>),
    /// Digest mismatch. The unverified plaintext is kept for `Corrupt`.
    Tampered(Vec<u8>),
}

struct Slot {
    token: MethodToken,
    cipher: Vec<u8>,
    nonce: u64,
    digest: [u8; 32],
    decoded: OnceLock<Decoded>,
    decodes: AtomicUsize,
}

pub(crate) struct JitHook {
    module: String,
    policy: TamperPolicy,
    key: XteaKey,
    slots: Vec<Slot>,
}

impl JitHook {
    pub(crate) fn install(module: &Module) -> Result<Self, LoadError> {
        let table = JitTable::decode(section(module, HELPER, JIT_SECTION)?)?;
        let body = section(module, HELPER, BODY_SECTION)?;

        let mut slots = Vec::with_capacity(table.entries.len());
        for e in &table.entries {
            slots.push(Slot {
                token: e.token,
                cipher: body_slice(body, e.token, e.offset, e.len)?.to_vec(),
                nonce: e.nonce,
                digest: e.digest,
                decoded: OnceLock::new(),
                decodes: AtomicUsize::new(0),
            });
        }
        debug!(module = %module.name, methods = slots.len(), "jit hook installed");

        Ok(JitHook {
            module: module.name.clone(),
            policy: table.policy,
            key: table.key(&module.name),
            slots,
        })
    }

    fn slot(&self, token: MethodToken) -> Option<&Slot> {
        self.slots.iter().find(|s| s.token == token)
    }

    pub(crate) fn covers(&self, token: MethodToken) -> bool {
        self.slot(token).is_some()
    }

    pub(crate) fn decode_count(&self, token: MethodToken) -> usize {
        self.slot(token)
            .map(|s| s.decodes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Plain body of `token`, decoding it on first use. `None` if the hook
    /// does not cover the method.
    pub(crate) fn supply(
        &self,
        token: MethodToken,
        state: &TamperState,
    ) -> Option<Result<&[u8], ExecError>> {
        let slot = self.slot(token)?;
        let decoded = slot.decoded.get_or_init(|| {
            slot.decodes.fetch_add(1, Ordering::SeqCst);
            let mut plain = slot.cipher.clone();
            ctr_apply(&mut plain, &self.key, slot.nonce);
            if jit_digest(token, &plain) == slot.digest {
                debug!(method = %token, "body decoded");
                Decoded::Verified(plain)
            } else {
                Decoded::Tampered(plain)
            }
        });

        Some(match decoded {
            Decoded::Verified(plain) => Ok(plain.as_slice()),
            Decoded::Tampered(plain) => {
                let detail = format!("body of {} does not match its digest", token);
                match state.respond(self.policy, &self.module, &detail) {
                    Verdict::Reject => Err(ExecError::Tampered(token)),
                    Verdict::Continue => Ok(plain.as_slice()),
                }
            }
        })
    }
}
