//! Anti-tamper protection.
//!
//! Works in two phases that the pipeline keeps apart:
//!
//! - **inject** (before `OptimizeMethods`) filters the targets through the
//!   exclusion table, freezes it, and lets the selected [`Mode`] add its
//!   runtime helper. The mode's handler is parked in a side table.
//! - **metadata** (before `EndModule`) takes the handler back out and lets
//!   it seal whatever the bodies look like after every method-level
//!   transform has run.
//!
//! Other protections keep methods out of the target set through
//! [`AntiTamperService::exclude_method`], which only has an effect until
//! injection has run for that module.

mod handler;
mod jit;
pub mod meta;
mod normal;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

pub use handler::Mode;
pub use meta::TamperPolicy;

use handler::{handler_for, ModeHandler};

use super::{Protection, ProtectionPreset};
use crate::module::{MethodBody, MethodToken, Module, ModuleError, ModuleId};
use crate::pipeline::{
    ModuleContext, PipelineStage, ProtectError, ProtectionParameters, ProtectionPhase,
    ProtectionPipeline, ProtectionTargets, ServiceRegistry,
};

pub const ANTI_TAMPER_SERVICE_ID: &str = "ward.anti_tamper";

/// Capability other protections use to keep methods out of anti-tamper.
pub trait AntiTamperService: Send + Sync {
    /// Exclude `method` of the module in `ctx`.
    ///
    /// Returns `false` without changing anything if injection already ran
    /// for the module, or if the module has no such method.
    fn exclude_method(&self, ctx: &ModuleContext, method: MethodToken) -> bool;
}

/// Outcome of metadata finalization for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TamperReport {
    pub mode: Mode,
    pub policy: TamperPolicy,
    /// Sealed methods, in table order.
    pub methods: Vec<MethodToken>,
    pub body_bytes: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Exclusions ─────────────────────────────────────────────

#[derive(Default)]
struct Exclusions {
    methods: BTreeSet<MethodToken>,
    frozen: bool,
}

#[derive(Default)]
struct ExclusionTable {
    modules: Mutex<HashMap<ModuleId, Exclusions>>,
}

impl ExclusionTable {
    /// Freeze the module's exclusions and return `targets` without them.
    fn freeze(&self, id: ModuleId, targets: &[MethodToken]) -> Vec<MethodToken> {
        let mut modules = lock(&self.modules);
        let entry = modules.entry(id).or_default();
        entry.frozen = true;
        filter_excluded(entry, targets)
    }

    /// `targets` without exclusions, or `None` if the module was never frozen.
    fn filter(&self, id: ModuleId, targets: &[MethodToken]) -> Option<Vec<MethodToken>> {
        let modules = lock(&self.modules);
        match modules.get(&id) {
            Some(entry) if entry.frozen => Some(filter_excluded(entry, targets)),
            _ => None,
        }
    }

    fn forget(&self, id: ModuleId) {
        lock(&self.modules).remove(&id);
    }
}

fn filter_excluded(entry: &Exclusions, targets: &[MethodToken]) -> Vec<MethodToken> {
    let mut out: Vec<MethodToken> = targets
        .iter()
        .copied()
        .filter(|t| !entry.methods.contains(t))
        .collect();
    out.sort();
    out.dedup();
    out
}

impl AntiTamperService for ExclusionTable {
    fn exclude_method(&self, ctx: &ModuleContext, method: MethodToken) -> bool {
        if ctx.module.method(method).is_none() {
            debug!(module = %ctx.module.name, %method, "exclusion of unknown method ignored");
            return false;
        }
        let mut modules = lock(&self.modules);
        let entry = modules.entry(ctx.id).or_default();
        if entry.frozen {
            warn!(
                module = %ctx.module.name,
                %method,
                "anti-tamper already injected; late exclusion has no effect"
            );
            return false;
        }
        entry.methods.insert(method);
        debug!(module = %ctx.module.name, %method, "method excluded from anti-tamper");
        true
    }
}

// ─── Protection ─────────────────────────────────────────────

/// Protects method bodies against modification.
///
/// Parameters: `mode` (`normal` | `jit`, default `normal`) and `on_tamper`
/// (`reject` | `corrupt` | `abort`, default `reject`).
pub struct AntiTamperProtection {
    exclusions: Arc<ExclusionTable>,
    handles: Mutex<HashMap<ModuleId, Box<dyn ModeHandler>>>,
    reports: Mutex<HashMap<ModuleId, TamperReport>>,
}

impl Default for AntiTamperProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl AntiTamperProtection {
    pub fn new() -> Self {
        AntiTamperProtection {
            exclusions: Arc::new(ExclusionTable::default()),
            handles: Mutex::new(HashMap::new()),
            reports: Mutex::new(HashMap::new()),
        }
    }

    /// The exclusion capability, for protections built alongside this one.
    pub fn service(&self) -> Arc<dyn AntiTamperService> {
        self.exclusions.clone()
    }

    /// Handles created by inject and not yet consumed.
    pub fn pending_handles(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn report(&self, id: ModuleId) -> Option<TamperReport> {
        lock(&self.reports).get(&id).cloned()
    }

    fn record_report(&self, id: ModuleId, report: TamperReport) {
        lock(&self.reports).insert(id, report);
    }

    fn inject(&self, ctx: &mut ModuleContext, params: &ProtectionParameters) -> Result<(), ProtectError> {
        let targets = self.exclusions.freeze(ctx.id, &params.targets);
        if targets.is_empty() {
            debug!(module = %ctx.module.name, "no anti-tamper targets");
            return Ok(());
        }

        let mode = match params.get("mode") {
            Some(raw) => raw.parse::<Mode>()?,
            None => Mode::default(),
        };
        let policy = params.parse_or("on_tamper", TamperPolicy::default())?;

        if lock(&self.handles).contains_key(&ctx.id) {
            return Err(ProtectError::DuplicateHandle {
                module: ctx.module.name.clone(),
                id: ctx.id,
            });
        }

        let mut handler = handler_for(mode, policy);
        handler.inject(self, ctx, &targets)?;
        debug!(
            module = %ctx.module.name,
            mode = %handler.mode(),
            targets = targets.len(),
            "anti-tamper injected"
        );
        lock(&self.handles).insert(ctx.id, handler);
        Ok(())
    }

    fn finalize(&self, ctx: &mut ModuleContext, params: &ProtectionParameters) -> Result<(), ProtectError> {
        let handler = lock(&self.handles).remove(&ctx.id);
        let targets = self.exclusions.filter(ctx.id, &params.targets);
        match (handler, targets) {
            // A parked handle is always consumed, whatever the targets now are.
            (Some(handler), targets) => handler.finalize(self, ctx, &targets.unwrap_or_default()),
            (None, Some(targets)) if targets.is_empty() => Ok(()),
            (None, _) if params.targets.is_empty() => Ok(()),
            (None, _) => Err(ProtectError::MissingHandle {
                module: ctx.module.name.clone(),
                id: ctx.id,
            }),
        }
    }
}

impl Protection for AntiTamperProtection {
    fn id(&self) -> &'static str {
        "anti tamper"
    }

    fn full_id(&self) -> &'static str {
        ANTI_TAMPER_SERVICE_ID
    }

    fn name(&self) -> &'static str {
        "Anti Tamper Protection"
    }

    fn description(&self) -> &'static str {
        "Seals method bodies so that modified modules refuse to run."
    }

    fn preset(&self) -> ProtectionPreset {
        ProtectionPreset::Maximum
    }

    fn initialize(&self, services: &mut ServiceRegistry) -> Result<(), ProtectError> {
        services.register(ANTI_TAMPER_SERVICE_ID, self.service())
    }

    fn abort_module(&self, id: ModuleId) {
        let handle = lock(&self.handles).remove(&id);
        lock(&self.reports).remove(&id);
        self.exclusions.forget(id);
        if let Some(handle) = handle {
            debug!(%id, mode = %handle.mode(), "pending anti-tamper handle dropped");
        }
    }

    fn populate_pipeline(self: Arc<Self>, pipeline: &mut ProtectionPipeline) {
        pipeline.insert_pre_stage(
            PipelineStage::OptimizeMethods,
            Arc::new(InjectPhase(Arc::clone(&self))),
        );
        pipeline.insert_pre_stage(PipelineStage::EndModule, Arc::new(MetadataPhase(self)));
    }
}

struct InjectPhase(Arc<AntiTamperProtection>);

impl ProtectionPhase for InjectPhase {
    fn parent_id(&self) -> &'static str {
        ANTI_TAMPER_SERVICE_ID
    }

    fn name(&self) -> &'static str {
        "Anti-tamper helpers injection"
    }

    fn targets(&self) -> ProtectionTargets {
        ProtectionTargets::Methods
    }

    fn execute(&self, ctx: &mut ModuleContext, params: &ProtectionParameters) -> Result<(), ProtectError> {
        self.0.inject(ctx, params)
    }
}

struct MetadataPhase(Arc<AntiTamperProtection>);

impl ProtectionPhase for MetadataPhase {
    fn parent_id(&self) -> &'static str {
        ANTI_TAMPER_SERVICE_ID
    }

    fn name(&self) -> &'static str {
        "Anti-tamper metadata finalization"
    }

    fn targets(&self) -> ProtectionTargets {
        ProtectionTargets::Methods
    }

    fn execute(&self, ctx: &mut ModuleContext, params: &ProtectionParameters) -> Result<(), ProtectError> {
        self.0.finalize(ctx, params)
    }
}

// ─── Shared by the modes ────────────────────────────────────

/// Plain bodies of the protected methods, in token order.
///
/// Only methods protected at inject time are sealed. Anything in the
/// finalize targets that was not is left alone, and so are protected
/// methods whose body is no longer plain code.
fn collect_bodies(
    module: &Module,
    protected: &[MethodToken],
    targets: &[MethodToken],
) -> Vec<(MethodToken, Vec<u8>)> {
    for token in targets.iter().filter(|t| !protected.contains(t)) {
        debug!(method = %token, "not protected at injection; left as is");
    }
    let mut bodies = Vec::with_capacity(protected.len());
    for &token in protected {
        match module.method(token).map(|m| &m.body) {
            Some(MethodBody::Code(code)) => bodies.push((token, code.clone())),
            Some(MethodBody::Sealed) => {
                warn!(method = %token, "body already sealed; skipped");
            }
            None => {
                warn!(method = %token, "protected method disappeared; skipped");
            }
        }
    }
    bodies
}

fn seal_methods(module: &mut Module, tokens: &[MethodToken]) {
    for &token in tokens {
        if let Some(method) = module.method_mut(token) {
            method.body = MethodBody::Sealed;
        }
    }
}

fn byte_len(data: &[u8]) -> Result<u32, ProtectError> {
    u32::try_from(data.len()).map_err(|_| {
        ProtectError::Module(ModuleError::TooMany {
            what: "anti-tamper body byte",
            count: data.len(),
        })
    })
}
