//! Normal mode: cascade-sealed bodies restored by a load-time initializer.
//!
//! Inject puts [`RuntimeHelper::NormalInitializer`] at the front of the
//! module's initializer list, so it runs before anything else in the
//! module can. Finalize seals the protected bodies in token order into a
//! [`crate::integrity::CascadeChain`]. At load the initializer checks every
//! digest and the root, then decrypts all bodies at once.

use rand::Rng;
use tracing::{debug, info};

use super::handler::{Mode, ModeHandler};
use super::meta::{NormalEntry, NormalTable, TamperPolicy, BODY_SECTION, NORMAL_SECTION};
use super::{byte_len, collect_bodies, seal_methods, AntiTamperProtection, TamperReport};
use crate::crypto::digest::Digest256;
use crate::integrity::seal;
use crate::module::{MethodToken, RuntimeHelper};
use crate::pipeline::{ModuleContext, ProtectError};

pub(super) struct NormalMode {
    policy: TamperPolicy,
    protected: Vec<MethodToken>,
    tail_key: Digest256,
}

impl NormalMode {
    pub(super) fn new(policy: TamperPolicy) -> Self {
        NormalMode {
            policy,
            protected: Vec::new(),
            tail_key: [0; 32],
        }
    }
}

impl ModeHandler for NormalMode {
    fn mode(&self) -> Mode {
        Mode::Normal
    }

    fn inject(
        &mut self,
        _parent: &AntiTamperProtection,
        ctx: &mut ModuleContext,
        targets: &[MethodToken],
    ) -> Result<(), ProtectError> {
        self.protected = targets.to_vec();
        self.protected.sort();
        self.tail_key = ctx.rng().gen();

        let module = &mut ctx.module;
        module
            .initializers
            .retain(|h| *h != RuntimeHelper::NormalInitializer);
        module.initializers.insert(0, RuntimeHelper::NormalInitializer);
        module.set_section(NORMAL_SECTION, Vec::new());
        module.set_section(BODY_SECTION, Vec::new());

        debug!(methods = self.protected.len(), "normal initializer injected");
        Ok(())
    }

    fn finalize(
        self: Box<Self>,
        parent: &AntiTamperProtection,
        ctx: &mut ModuleContext,
        targets: &[MethodToken],
    ) -> Result<(), ProtectError> {
        let bodies = collect_bodies(&ctx.module, &self.protected, targets);
        let plain: Vec<&[u8]> = bodies.iter().map(|(_, code)| code.as_slice()).collect();
        let chain = seal(&plain, self.tail_key);

        let mut body = Vec::new();
        let mut entries = Vec::with_capacity(bodies.len());
        for ((token, _), (chunk, digest)) in bodies
            .iter()
            .zip(chain.chunks.iter().zip(chain.digests.iter()))
        {
            entries.push(NormalEntry {
                token: *token,
                offset: byte_len(&body)?,
                len: byte_len(chunk)?,
                digest: *digest,
            });
            body.extend_from_slice(chunk);
        }

        let table = NormalTable {
            policy: self.policy,
            masked_tail_key: NormalTable::mask_tail_key(&self.tail_key, &ctx.module.name),
            root: chain.root,
            entries,
        };

        let tokens: Vec<MethodToken> = bodies.iter().map(|(t, _)| *t).collect();
        let body_bytes = body.len();
        ctx.module.set_section(BODY_SECTION, body);
        ctx.module.set_section(NORMAL_SECTION, table.encode()?);
        seal_methods(&mut ctx.module, &tokens);

        info!(
            methods = tokens.len(),
            bytes = body_bytes,
            policy = %self.policy,
            "bodies sealed into cascade chain"
        );
        parent.record_report(
            ctx.id,
            TamperReport {
                mode: Mode::Normal,
                policy: self.policy,
                methods: tokens,
                body_bytes,
            },
        );
        Ok(())
    }
}
