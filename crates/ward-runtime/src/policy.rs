//! Tamper response.
//!
//! When a helper detects a modified body it hands the event to
//! [`TamperState::respond`], which applies the policy baked into the
//! module. `Corrupt` arms a poison value that the loader XORs into every
//! result, so the module keeps running but computes garbage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::error;
use ward_core::crypto::digest::sha256;
use ward_core::crypto::splitmix_finalize;
use ward_core::protections::anti_tamper::meta::TamperPolicy;

/// What the caller should do after a tamper event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Fail the load or invocation.
    Reject,
    /// Carry on with the unverified body.
    Continue,
}

#[derive(Debug, Default)]
pub(crate) struct TamperState {
    poison: AtomicU64,
    rejected: AtomicBool,
}

impl TamperState {
    pub(crate) fn respond(&self, policy: TamperPolicy, module: &str, detail: &str) -> Verdict {
        error!(module, %policy, detail, "integrity check failed");
        match policy {
            TamperPolicy::Reject => {
                self.rejected.store(true, Ordering::SeqCst);
                Verdict::Reject
            }
            TamperPolicy::Corrupt => {
                self.poison.store(poison_for(module), Ordering::SeqCst);
                Verdict::Continue
            }
            TamperPolicy::Abort => std::process::abort(),
        }
    }

    /// Non-zero once a `Corrupt` policy fired.
    pub(crate) fn poison(&self) -> u64 {
        self.poison.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Poison value for a module. Never zero.
fn poison_for(module: &str) -> u64 {
    let d = sha256(module.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&d[..8]);
    splitmix_finalize(u64::from_le_bytes(word)) | 1
}
