use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use super::{
    ModuleContext, PipelineStage, ProtectError, ProtectionParameters, ProtectionPhase,
    ProtectionPipeline, ProtectionTargets, ServiceRegistry,
};
use crate::module::{MethodToken, Module, ModuleId};
use crate::protections::Protection;

/// Settings of one protection on one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionSettings {
    /// Explicit target methods by name. `None` targets every method.
    pub methods: Option<Vec<String>>,
    pub values: BTreeMap<String, String>,
}

impl ProtectionSettings {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

/// Which protections are enabled on a module, keyed by `full_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSettings {
    pub protections: BTreeMap<String, ProtectionSettings>,
}

impl ModuleSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(mut self, full_id: &str, settings: ProtectionSettings) -> Self {
        self.protections.insert(full_id.to_string(), settings);
        self
    }

    pub fn is_enabled(&self, full_id: &str) -> bool {
        self.protections.contains_key(full_id)
    }
}

/// Order protections so every `before`/`after` constraint holds.
///
/// Among protections that are ready at the same time the input order is
/// kept. Constraints naming an id that is not in the list are ignored.
pub fn schedule(
    protections: Vec<Arc<dyn Protection>>,
) -> Result<Vec<Arc<dyn Protection>>, ProtectError> {
    let n = protections.len();
    let index: BTreeMap<&str, usize> = protections
        .iter()
        .enumerate()
        .map(|(i, p)| (p.full_id(), i))
        .collect();

    // edges[a] holds every b that must come after a
    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (i, p) in protections.iter().enumerate() {
        for id in p.before() {
            if let Some(&j) = index.get(id) {
                edges[i].insert(j);
            }
        }
        for id in p.after() {
            if let Some(&j) = index.get(id) {
                edges[j].insert(i);
            }
        }
    }

    let mut indegree = vec![0usize; n];
    for targets in &edges {
        for &j in targets {
            indegree[j] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &edges[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| protections[i].full_id().to_string())
            .collect();
        return Err(ProtectError::DependencyCycle(stuck));
    }

    let mut slots: Vec<Option<Arc<dyn Protection>>> = protections.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Runs the pipeline over modules.
///
/// A driver is built once per run. Modules can then be protected one at a
/// time or from several threads; per-module state inside protections is
/// keyed by [`ModuleId`].
pub struct Driver {
    protections: Vec<Arc<dyn Protection>>,
    services: ServiceRegistry,
    pipeline: ProtectionPipeline,
    seed: u64,
}

impl Driver {
    pub fn new(protections: Vec<Arc<dyn Protection>>) -> Result<Self, ProtectError> {
        let protections = schedule(protections)?;

        let mut services = ServiceRegistry::new();
        for p in &protections {
            p.initialize(&mut services)?;
        }

        let mut pipeline = ProtectionPipeline::new();
        for p in &protections {
            Arc::clone(p).populate_pipeline(&mut pipeline);
        }

        debug!(
            protections = protections.len(),
            services = services.len(),
            "driver ready"
        );

        Ok(Driver {
            protections,
            services,
            pipeline,
            seed: rand::random(),
        })
    }

    /// Fix the run seed so builds are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Protections in scheduled order.
    pub fn protections(&self) -> &[Arc<dyn Protection>] {
        &self.protections
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn pipeline(&self) -> &ProtectionPipeline {
        &self.pipeline
    }

    /// Run every stage over `module`. The first phase error aborts the
    /// module: every protection drops its state for `id` and the error is
    /// returned.
    pub fn protect(
        &self,
        id: ModuleId,
        module: Module,
        settings: &ModuleSettings,
    ) -> Result<Module, ProtectError> {
        let span = info_span!("protect", module = %module.name, id = %id);
        let _guard = span.enter();

        let mut ctx = ModuleContext::new(id, module, self.seed);
        if let Err(err) = self.run_stages(&mut ctx, settings) {
            warn!(error = %err, "module aborted");
            for protection in &self.protections {
                protection.abort_module(id);
            }
            return Err(err);
        }

        info!(methods = ctx.module.methods.len(), "module processed");
        Ok(ctx.into_module())
    }

    fn run_stages(
        &self,
        ctx: &mut ModuleContext,
        settings: &ModuleSettings,
    ) -> Result<(), ProtectError> {
        for stage in PipelineStage::ALL {
            for phase in self.pipeline.pre_stage(stage) {
                run_phase(phase.as_ref(), stage, ctx, settings)?;
            }
            for phase in self.pipeline.post_stage(stage) {
                run_phase(phase.as_ref(), stage, ctx, settings)?;
            }
        }
        Ok(())
    }
}

fn run_phase(
    phase: &dyn ProtectionPhase,
    stage: PipelineStage,
    ctx: &mut ModuleContext,
    settings: &ModuleSettings,
) -> Result<(), ProtectError> {
    let Some(cfg) = settings.protections.get(phase.parent_id()) else {
        return Ok(());
    };
    let targets = match phase.targets() {
        ProtectionTargets::Methods => resolve_targets(&ctx.module, cfg)?,
        ProtectionTargets::Modules => Vec::new(),
    };
    debug!(%stage, phase = phase.name(), targets = targets.len(), "running phase");
    let params = ProtectionParameters::new(targets, cfg.values.clone());
    phase.execute(ctx, &params)
}

fn resolve_targets(
    module: &Module,
    cfg: &ProtectionSettings,
) -> Result<Vec<MethodToken>, ProtectError> {
    let Some(names) = &cfg.methods else {
        return Ok(module.tokens());
    };
    let mut tokens = Vec::with_capacity(names.len());
    for name in names {
        let method = module
            .method_by_name(name)
            .ok_or_else(|| ProtectError::UnknownMethod {
                module: module.name.clone(),
                name: name.clone(),
            })?;
        tokens.push(method.token);
    }
    tokens.sort();
    tokens.dedup();
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protections::ProtectionPreset;
    use std::sync::Mutex;

    struct Fake {
        id: &'static str,
        before: &'static [&'static str],
        after: &'static [&'static str],
    }

    impl Protection for Fake {
        fn id(&self) -> &'static str {
            self.id
        }
        fn full_id(&self) -> &'static str {
            self.id
        }
        fn name(&self) -> &'static str {
            self.id
        }
        fn description(&self) -> &'static str {
            ""
        }
        fn preset(&self) -> ProtectionPreset {
            ProtectionPreset::None
        }
        fn before(&self) -> &'static [&'static str] {
            self.before
        }
        fn after(&self) -> &'static [&'static str] {
            self.after
        }
        fn populate_pipeline(self: Arc<Self>, _: &mut ProtectionPipeline) {}
    }

    fn fake(
        id: &'static str,
        before: &'static [&'static str],
        after: &'static [&'static str],
    ) -> Arc<dyn Protection> {
        Arc::new(Fake { id, before, after })
    }

    fn ids(list: &[Arc<dyn Protection>]) -> Vec<&'static str> {
        list.iter().map(|p| p.full_id()).collect()
    }

    #[test]
    fn schedule_honours_before_and_after() {
        let list = vec![
            fake("c", &[], &["a"]),
            fake("a", &[], &[]),
            fake("b", &["a"], &[]),
        ];
        assert_eq!(ids(&schedule(list).unwrap()), vec!["b", "a", "c"]);
    }

    #[test]
    fn schedule_keeps_input_order_when_free() {
        let list = vec![fake("x", &[], &[]), fake("y", &[], &["missing"])];
        assert_eq!(ids(&schedule(list).unwrap()), vec!["x", "y"]);
    }

    #[test]
    fn schedule_detects_cycle() {
        let list = vec![fake("a", &["b"], &[]), fake("b", &["a"], &[])];
        match schedule(list) {
            Err(ProtectError::DependencyCycle(ids)) => {
                assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|l| ids(&l))),
        }
    }

    struct Recorder {
        log: Arc<Mutex<Vec<(String, usize)>>>,
    }

    struct RecordPhase {
        label: &'static str,
        log: Arc<Mutex<Vec<(String, usize)>>>,
    }

    impl ProtectionPhase for RecordPhase {
        fn parent_id(&self) -> &'static str {
            "rec"
        }
        fn name(&self) -> &'static str {
            self.label
        }
        fn targets(&self) -> ProtectionTargets {
            ProtectionTargets::Methods
        }
        fn execute(
            &self,
            _: &mut ModuleContext,
            params: &ProtectionParameters,
        ) -> Result<(), ProtectError> {
            self.log
                .lock()
                .unwrap()
                .push((self.label.to_string(), params.targets.len()));
            Ok(())
        }
    }

    impl Protection for Recorder {
        fn id(&self) -> &'static str {
            "rec"
        }
        fn full_id(&self) -> &'static str {
            "rec"
        }
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn description(&self) -> &'static str {
            ""
        }
        fn preset(&self) -> ProtectionPreset {
            ProtectionPreset::None
        }
        fn abort_module(&self, id: ModuleId) {
            self.log.lock().unwrap().push(("abort".to_string(), id.0 as usize));
        }
        fn populate_pipeline(self: Arc<Self>, pipeline: &mut ProtectionPipeline) {
            pipeline.insert_pre_stage(
                PipelineStage::EndModule,
                Arc::new(RecordPhase { label: "end", log: self.log.clone() }),
            );
            pipeline.insert_post_stage(
                PipelineStage::Inspection,
                Arc::new(RecordPhase { label: "inspect", log: self.log.clone() }),
            );
        }
    }

    fn two_methods() -> Module {
        crate::vm::assemble(
            ".module m\n.method a 0\n push 1\n ret\n.end\n.method b 0\n push 2\n ret\n.end\n",
        )
        .unwrap()
    }

    #[test]
    fn protect_runs_phases_in_stage_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = Driver::new(vec![Arc::new(Recorder { log: log.clone() })]).unwrap();
        let settings = ModuleSettings::new().enable("rec", ProtectionSettings::default());
        driver.protect(ModuleId(0), two_methods(), &settings).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![("inspect".to_string(), 2), ("end".to_string(), 2)]
        );
    }

    #[test]
    fn disabled_protection_does_not_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = Driver::new(vec![Arc::new(Recorder { log: log.clone() })]).unwrap();
        driver
            .protect(ModuleId(0), two_methods(), &ModuleSettings::new())
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn explicit_method_list_resolves_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = Driver::new(vec![Arc::new(Recorder { log: log.clone() })]).unwrap();
        let settings = ModuleSettings::new().enable(
            "rec",
            ProtectionSettings {
                methods: Some(vec!["b".to_string()]),
                ..Default::default()
            },
        );
        driver.protect(ModuleId(0), two_methods(), &settings).unwrap();
        assert_eq!(log.lock().unwrap()[0].1, 1);

        let bad = ModuleSettings::new().enable(
            "rec",
            ProtectionSettings {
                methods: Some(vec!["zzz".to_string()]),
                ..Default::default()
            },
        );
        assert!(matches!(
            driver.protect(ModuleId(1), two_methods(), &bad),
            Err(ProtectError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn failed_module_is_aborted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = Driver::new(vec![Arc::new(Recorder { log: log.clone() })]).unwrap();
        let bad = ModuleSettings::new().enable(
            "rec",
            ProtectionSettings {
                methods: Some(vec!["zzz".to_string()]),
                ..Default::default()
            },
        );
        assert!(driver.protect(ModuleId(3), two_methods(), &bad).is_err());
        assert_eq!(*log.lock().unwrap(), vec![("abort".to_string(), 3)]);

        log.lock().unwrap().clear();
        let good = ModuleSettings::new().enable("rec", ProtectionSettings::default());
        driver.protect(ModuleId(3), two_methods(), &good).unwrap();
        assert!(log.lock().unwrap().iter().all(|(label, _)| label != "abort"));
    }
}
