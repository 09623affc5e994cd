//! Keeps introspectable methods readable.
//!
//! Methods flagged [`MethodFlags::INTROSPECTABLE`] are read as data by the
//! host (reflection, diagnostics dumps). Sealing them would break that, so
//! this protection excludes them from anti-tamper before injection runs.

use std::sync::Arc;

use tracing::debug;

use super::{AntiTamperService, Protection, ProtectionPreset, ANTI_TAMPER_SERVICE_ID};
use crate::module::MethodFlags;
use crate::pipeline::{
    ModuleContext, PipelineStage, ProtectError, ProtectionParameters, ProtectionPhase,
    ProtectionPipeline, ProtectionTargets,
};

pub const INTROSPECTION_ID: &str = "ward.introspection";

pub struct IntrospectionProtection {
    anti_tamper: Arc<dyn AntiTamperService>,
}

impl IntrospectionProtection {
    pub fn new(anti_tamper: Arc<dyn AntiTamperService>) -> Self {
        IntrospectionProtection { anti_tamper }
    }
}

impl Protection for IntrospectionProtection {
    fn id(&self) -> &'static str {
        "introspection"
    }

    fn full_id(&self) -> &'static str {
        INTROSPECTION_ID
    }

    fn name(&self) -> &'static str {
        "Introspection Guard"
    }

    fn description(&self) -> &'static str {
        "Excludes introspectable methods from body sealing."
    }

    fn preset(&self) -> ProtectionPreset {
        ProtectionPreset::Minimum
    }

    fn before(&self) -> &'static [&'static str] {
        &[ANTI_TAMPER_SERVICE_ID]
    }

    fn populate_pipeline(self: Arc<Self>, pipeline: &mut ProtectionPipeline) {
        pipeline.insert_post_stage(PipelineStage::ProcessModule, Arc::new(ExcludePhase(self)));
    }
}

struct ExcludePhase(Arc<IntrospectionProtection>);

impl ProtectionPhase for ExcludePhase {
    fn parent_id(&self) -> &'static str {
        INTROSPECTION_ID
    }

    fn name(&self) -> &'static str {
        "Introspectable method exclusion"
    }

    fn targets(&self) -> ProtectionTargets {
        ProtectionTargets::Modules
    }

    fn execute(&self, ctx: &mut ModuleContext, _params: &ProtectionParameters) -> Result<(), ProtectError> {
        let ctx: &ModuleContext = ctx;
        let flagged: Vec<_> = ctx
            .module
            .methods
            .iter()
            .filter(|m| m.flags.contains(MethodFlags::INTROSPECTABLE))
            .map(|m| m.token)
            .collect();
        let excluded = flagged
            .iter()
            .filter(|&&token| self.0.anti_tamper.exclude_method(ctx, token))
            .count();
        debug!(flagged = flagged.len(), excluded, "introspectable methods excluded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{MethodToken, ModuleId};
    use crate::vm::assemble;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<MethodToken>>);

    impl AntiTamperService for Recorder {
        fn exclude_method(&self, _ctx: &ModuleContext, method: MethodToken) -> bool {
            self.0.lock().unwrap().push(method);
            true
        }
    }

    #[test]
    fn excludes_only_flagged_methods() {
        let recorder = Arc::new(Recorder::default());
        let protection = Arc::new(IntrospectionProtection::new(recorder.clone()));
        let module = assemble(
            ".module m\n.method a 0\n ret\n.end\n.method b 0 introspectable\n ret\n.end\n",
        )
        .unwrap();
        let b = module.method_by_name("b").unwrap().token;
        let mut ctx = ModuleContext::new(ModuleId(0), module, 1);
        ExcludePhase(protection)
            .execute(&mut ctx, &ProtectionParameters::default())
            .unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![b]);
    }
}
