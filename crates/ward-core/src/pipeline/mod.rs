//! Protection pipeline.
//!
//! Processing one module walks a fixed list of stages. Protections do not
//! run on their own: they insert phases before or after a stage, and the
//! [`Driver`] runs those phases in order. Two phases that anchor to
//! different stages are therefore ordered by the stages themselves, with
//! no locking involved.

mod context;
mod driver;
mod error;
mod services;

pub use context::{ModuleContext, ProtectionParameters};
pub use driver::{schedule, Driver, ModuleSettings, ProtectionSettings};
pub use error::ProtectError;
pub use services::ServiceRegistry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Stages a module goes through, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineStage {
    Inspection,
    BeginModule,
    ProcessModule,
    OptimizeMethods,
    EndModule,
    WriteModule,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Inspection,
        PipelineStage::BeginModule,
        PipelineStage::ProcessModule,
        PipelineStage::OptimizeMethods,
        PipelineStage::EndModule,
        PipelineStage::WriteModule,
    ];
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a phase is handed as its target set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionTargets {
    /// Method tokens selected for the owning protection.
    Methods,
    /// The module as a whole; the target list is empty.
    Modules,
}

/// One unit of work a protection contributes to the pipeline.
pub trait ProtectionPhase: Send + Sync {
    /// `full_id` of the protection that owns this phase.
    fn parent_id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn targets(&self) -> ProtectionTargets;

    fn execute(
        &self,
        ctx: &mut ModuleContext,
        params: &ProtectionParameters,
    ) -> Result<(), ProtectError>;
}

/// Phases anchored before and after each stage.
#[derive(Default)]
pub struct ProtectionPipeline {
    pre: BTreeMap<PipelineStage, Vec<Arc<dyn ProtectionPhase>>>,
    post: BTreeMap<PipelineStage, Vec<Arc<dyn ProtectionPhase>>>,
}

impl ProtectionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `phase` right before `stage`.
    pub fn insert_pre_stage(&mut self, stage: PipelineStage, phase: Arc<dyn ProtectionPhase>) {
        self.pre.entry(stage).or_default().push(phase);
    }

    /// Run `phase` right after `stage`.
    pub fn insert_post_stage(&mut self, stage: PipelineStage, phase: Arc<dyn ProtectionPhase>) {
        self.post.entry(stage).or_default().push(phase);
    }

    pub fn pre_stage(&self, stage: PipelineStage) -> &[Arc<dyn ProtectionPhase>] {
        self.pre.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn post_stage(&self, stage: PipelineStage) -> &[Arc<dyn ProtectionPhase>] {
        self.post.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Phase names in execution order, for diagnostics.
    pub fn describe(&self) -> Vec<String> {
        let mut out = Vec::new();
        for stage in PipelineStage::ALL {
            for phase in self.pre_stage(stage) {
                out.push(format!("pre {stage}: {}", phase.name()));
            }
            for phase in self.post_stage(stage) {
                out.push(format!("post {stage}: {}", phase.name()));
            }
        }
        out
    }
}
