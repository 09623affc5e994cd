//! JIT mode: bodies decrypted on first invocation.
//!
//! No initializer is added. Inject registers [`RuntimeHelper::JitHook`],
//! which the runtime consults whenever a sealed method is invoked.
//! Finalize encrypts each body with XTEA-CTR. Nonces are `base + offset`,
//! and a body of `len` bytes uses at most `len` counter blocks, so the
//! counter ranges of two methods never overlap.

use rand::Rng;
use tracing::{debug, info};

use super::handler::{Mode, ModeHandler};
use super::meta::{jit_digest, JitEntry, JitTable, TamperPolicy, BODY_SECTION, JIT_SECTION};
use super::{byte_len, collect_bodies, seal_methods, AntiTamperProtection, TamperReport};
use crate::crypto::xtea::{ctr_apply, key_to_bytes, XteaKey};
use crate::module::{MethodToken, RuntimeHelper};
use crate::pipeline::{ModuleContext, ProtectError};

pub(super) struct JitMode {
    policy: TamperPolicy,
    protected: Vec<MethodToken>,
    key: XteaKey,
    nonce_base: u64,
}

impl JitMode {
    pub(super) fn new(policy: TamperPolicy) -> Self {
        JitMode {
            policy,
            protected: Vec::new(),
            key: [0; 4],
            nonce_base: 0,
        }
    }
}

impl ModeHandler for JitMode {
    fn mode(&self) -> Mode {
        Mode::Jit
    }

    fn inject(
        &mut self,
        _parent: &AntiTamperProtection,
        ctx: &mut ModuleContext,
        targets: &[MethodToken],
    ) -> Result<(), ProtectError> {
        self.protected = targets.to_vec();
        self.protected.sort();
        self.key = ctx.rng().gen();
        self.nonce_base = ctx.rng().gen();

        let module = &mut ctx.module;
        if !module.invoke_hooks.contains(&RuntimeHelper::JitHook) {
            module.invoke_hooks.push(RuntimeHelper::JitHook);
        }
        module.set_section(JIT_SECTION, Vec::new());
        module.set_section(BODY_SECTION, Vec::new());

        debug!(methods = self.protected.len(), "jit hook registered");
        Ok(())
    }

    fn finalize(
        self: Box<Self>,
        parent: &AntiTamperProtection,
        ctx: &mut ModuleContext,
        targets: &[MethodToken],
    ) -> Result<(), ProtectError> {
        let bodies = collect_bodies(&ctx.module, &self.protected, targets);

        let mut body = Vec::new();
        let mut entries = Vec::with_capacity(bodies.len());
        for (token, plain) in &bodies {
            let offset = byte_len(&body)?;
            let nonce = self.nonce_base.wrapping_add(offset as u64);
            let mut cipher = plain.clone();
            ctr_apply(&mut cipher, &self.key, nonce);
            entries.push(JitEntry {
                token: *token,
                offset,
                len: byte_len(plain)?,
                nonce,
                digest: jit_digest(*token, plain),
            });
            body.extend_from_slice(&cipher);
        }

        let table = JitTable {
            policy: self.policy,
            masked_key: JitTable::mask_key(&key_to_bytes(&self.key), &ctx.module.name),
            entries,
        };

        let tokens: Vec<MethodToken> = bodies.iter().map(|(t, _)| *t).collect();
        let body_bytes = body.len();
        ctx.module.set_section(BODY_SECTION, body);
        ctx.module.set_section(JIT_SECTION, table.encode()?);
        seal_methods(&mut ctx.module, &tokens);

        info!(
            methods = tokens.len(),
            bytes = body_bytes,
            policy = %self.policy,
            "bodies encrypted for first-call decoding"
        );
        parent.record_report(
            ctx.id,
            TamperReport {
                mode: Mode::Jit,
                policy: self.policy,
                methods: tokens,
                body_bytes,
            },
        );
        Ok(())
    }
}
