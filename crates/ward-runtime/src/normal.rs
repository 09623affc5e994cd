//! Normal-mode initializer.
//!
//! Runs inside [`crate::load`] before the module is handed out, so no
//! protected method can execute before every body is verified.

use std::collections::HashMap;

use tracing::debug;
use ward_core::integrity::CascadeChain;
use ward_core::module::{MethodBody, MethodToken, Module};
use ward_core::protections::anti_tamper::meta::{
    body_slice, NormalTable, BODY_SECTION, NORMAL_SECTION,
};

use crate::error::LoadError;
use crate::policy::{TamperState, Verdict};
use crate::section;

const HELPER: &str = "NormalInitializer";

/// Verify the cascade chain and restore every sealed body.
pub(crate) fn initialize(
    module: &Module,
    state: &TamperState,
) -> Result<HashMap<MethodToken, Vec<u8>>, LoadError> {
    let table = NormalTable::decode(section(module, HELPER, NORMAL_SECTION)?)?;
    let body = section(module, HELPER, BODY_SECTION)?;

    let mut chunks = Vec::with_capacity(table.entries.len());
    for e in &table.entries {
        chunks.push(body_slice(body, e.token, e.offset, e.len)?.to_vec());
    }
    let chain = CascadeChain {
        chunks,
        digests: table.entries.iter().map(|e| e.digest).collect(),
        root: table.root,
        tail_key: table.tail_key(&module.name),
    };

    // A listed method that carries plain code again had its seal removed.
    let unsealed = table
        .entries
        .iter()
        .find(|e| !matches!(module.method(e.token).map(|m| &m.body), Some(MethodBody::Sealed)));

    let verified = match unsealed {
        Some(e) => Err(format!("method {} is no longer sealed", e.token)),
        None => chain.open().map_err(|e| e.to_string()),
    };

    let plain = match verified {
        Ok(plain) => plain,
        Err(reason) => match state.respond(table.policy, &module.name, &reason) {
            Verdict::Reject => {
                return Err(LoadError::Tampered {
                    module: module.name.clone(),
                    reason,
                })
            }
            Verdict::Continue => chain.open_unchecked(),
        },
    };

    debug!(module = %module.name, bodies = plain.len(), "sealed bodies restored");
    Ok(table
        .entries
        .iter()
        .map(|e| e.token)
        .zip(plain)
        .collect())
}
