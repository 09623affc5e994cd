//! Junk instruction insertion.
//!
//! Interleaves stack-neutral sequences with the real instructions of each
//! plain method body. Jump targets are remapped so that a branch to an
//! instruction lands on the junk placed in front of it, which leaves the
//! behaviour of the method unchanged.
//!
//! Runs after `OptimizeMethods`, i.e. between anti-tamper injection and
//! metadata finalization, so the sealed bodies contain the junk.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use super::{Protection, ProtectionPreset};
use crate::module::MethodBody;
use crate::pipeline::{
    ModuleContext, PipelineStage, ProtectError, ProtectionParameters, ProtectionPhase,
    ProtectionPipeline, ProtectionTargets,
};
use crate::vm::{decode, encode, Instruction};

pub const JUNK_ID: &str = "ward.junk";
pub const DEFAULT_RATIO: u8 = 2;
pub const MAX_RATIO: u8 = 8;

/// One stack-neutral sequence.
fn junk_unit(rng: &mut impl Rng) -> Vec<Instruction> {
    match rng.gen_range(0..4) {
        0 => vec![Instruction::Nop],
        1 => vec![Instruction::Push(rng.gen()), Instruction::Pop],
        2 => vec![
            Instruction::Push(rng.gen()),
            Instruction::Dup,
            Instruction::Pop,
            Instruction::Pop,
        ],
        _ => vec![
            Instruction::Push(rng.gen()),
            Instruction::Push(rng.gen()),
            Instruction::Xor,
            Instruction::Pop,
        ],
    }
}

/// Insert up to `ratio` junk sequences in front of every instruction.
pub fn inject_junk(
    instructions: &[Instruction],
    ratio: u8,
    rng: &mut impl Rng,
) -> Vec<Instruction> {
    if ratio == 0 {
        return instructions.to_vec();
    }

    let mut out = Vec::with_capacity(instructions.len() * (1 + ratio as usize));
    // new_index[i] is where the junk in front of old instruction i starts
    let mut new_index = Vec::with_capacity(instructions.len() + 1);
    for inst in instructions {
        new_index.push(out.len() as u32);
        for _ in 0..rng.gen_range(0..=ratio) {
            out.extend(junk_unit(rng));
        }
        out.push(*inst);
    }
    new_index.push(out.len() as u32);

    for inst in out.iter_mut() {
        if let Some(target) = inst.branch_target() {
            let mapped = new_index
                .get(target as usize)
                .copied()
                .unwrap_or(target);
            *inst = inst.with_branch_target(mapped);
        }
    }
    out
}

pub struct JunkProtection;

impl Default for JunkProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl JunkProtection {
    pub fn new() -> Self {
        JunkProtection
    }
}

impl Protection for JunkProtection {
    fn id(&self) -> &'static str {
        "junk"
    }

    fn full_id(&self) -> &'static str {
        JUNK_ID
    }

    fn name(&self) -> &'static str {
        "Junk Instructions"
    }

    fn description(&self) -> &'static str {
        "Inserts stack-neutral instructions into method bodies."
    }

    fn preset(&self) -> ProtectionPreset {
        ProtectionPreset::Normal
    }

    fn after(&self) -> &'static [&'static str] {
        &[super::ANTI_TAMPER_SERVICE_ID]
    }

    fn populate_pipeline(self: Arc<Self>, pipeline: &mut ProtectionPipeline) {
        pipeline.insert_post_stage(PipelineStage::OptimizeMethods, Arc::new(JunkPhase));
    }
}

struct JunkPhase;

impl ProtectionPhase for JunkPhase {
    fn parent_id(&self) -> &'static str {
        JUNK_ID
    }

    fn name(&self) -> &'static str {
        "Junk insertion"
    }

    fn targets(&self) -> ProtectionTargets {
        ProtectionTargets::Methods
    }

    fn execute(&self, ctx: &mut ModuleContext, params: &ProtectionParameters) -> Result<(), ProtectError> {
        let ratio = params.parse_or("ratio", DEFAULT_RATIO)?;
        if ratio > MAX_RATIO {
            return Err(ProtectError::InvalidParameter {
                name: "ratio".to_string(),
                value: ratio.to_string(),
                reason: format!("must be between 0 and {}", MAX_RATIO),
            });
        }

        for &token in &params.targets {
            let Some(MethodBody::Code(code)) = ctx.module.method(token).map(|m| &m.body) else {
                continue;
            };
            let instructions =
                decode(code).map_err(|source| ProtectError::Decode { token, source })?;
            let padded = encode(&inject_junk(&instructions, ratio, ctx.rng()));
            debug!(method = %token, before = instructions.len(), after = padded.len(), "junk inserted");
            if let Some(method) = ctx.module.method_mut(token) {
                method.body = MethodBody::Code(padded);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn countdown() -> Vec<Instruction> {
        // while (n != 0) n = n - 1; return 7
        vec![
            Instruction::LdArg(0),
            Instruction::Dup,
            Instruction::Jz(7),
            Instruction::Push(1),
            Instruction::Sub,
            Instruction::Jmp(1),
            Instruction::Nop,
            Instruction::Pop,
            Instruction::Push(7),
            Instruction::Ret,
        ]
    }

    #[test]
    fn ratio_zero_is_identity() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        assert_eq!(inject_junk(&countdown(), 0, &mut rng), countdown());
    }

    #[test]
    fn real_instructions_keep_order_and_branches_follow() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let original = countdown();
        let padded = inject_junk(&original, 4, &mut rng);
        assert!(padded.len() > original.len());

        // junk never emits these, so their positions are exact
        let pos = |pred: fn(&Instruction) -> bool| padded.iter().position(pred).unwrap();
        let ldarg = pos(|i| matches!(i, Instruction::LdArg(_)));
        let jz = pos(|i| matches!(i, Instruction::Jz(_)));
        let jmp = pos(|i| matches!(i, Instruction::Jmp(_)));
        let ret = pos(|i| matches!(i, Instruction::Ret));

        let jmp_target = padded[jmp].branch_target().unwrap() as usize;
        assert!(jmp_target > ldarg && jmp_target < jz);
        let jz_target = padded[jz].branch_target().unwrap() as usize;
        assert!(jz_target > jmp && jz_target < ret);
    }

    #[test]
    fn output_decodes() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let padded = inject_junk(&countdown(), MAX_RATIO, &mut rng);
        assert_eq!(decode(&encode(&padded)).unwrap(), padded);
    }
}
