//! Seeded mutation state and the catalog entry points.

use crate::batch::MutationBatch;
use crate::dispatch::VirtualDispatch;
use crate::util::{MutationConfig, RuleKind};
use crate::{multi, single, Site};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shapeshift_core::decoder::Instruction;
use shapeshift_utils::errors::TransformError;
use tracing::debug;

/// Owns everything the mutation catalog needs between calls: the seeded random source, the
/// rule configuration and the dispatch stubs emitted so far.
///
/// Two contexts built from the same configuration and seed make identical decisions for the
/// same input.
#[derive(Debug)]
pub struct MutationContext {
    config: MutationConfig,
    rng: StdRng,
    dispatch: Option<VirtualDispatch>,
}

impl MutationContext {
    /// Validates `config` and seeds the random source.
    pub fn new(config: MutationConfig, seed: u64) -> Result<Self, TransformError> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            dispatch: None,
        })
    }

    /// The validated configuration.
    pub const fn config(&self) -> &MutationConfig {
        &self.config
    }

    /// Attaches the table the virtual call rule dispatches through.
    pub fn attach_dispatch(&mut self, dispatch: VirtualDispatch) {
        self.dispatch = Some(dispatch);
    }

    /// The attached dispatch table and its stub cache, if any.
    pub const fn dispatch(&self) -> Option<&VirtualDispatch> {
        self.dispatch.as_ref()
    }

    /// First in-place rule that matches and passes its gate.
    pub fn mutate_single(&mut self, ins: &Instruction) -> Option<Instruction> {
        self.apply_single(ins).map(|(_, out)| out)
    }

    /// Like [`MutationContext::mutate_single`], also naming the rule that fired.
    pub fn apply_single(&mut self, ins: &Instruction) -> Option<(RuleKind, Instruction)> {
        for rule in single::CATALOG {
            if !rule.matches(ins) || !self.gate(rule.kind()) {
                continue;
            }
            if let Some(out) = rule.rewrite(ins) {
                debug!(rule = %rule.kind(), from = %ins, to = %out, "in-place rewrite");
                return Some((rule.kind(), out));
            }
        }
        None
    }

    /// First expansion rule that matches and passes its gate, for an instruction whose
    /// address is unknown. An empty batch means nothing matched.
    pub fn mutate_many(&mut self, ins: &Instruction) -> Result<MutationBatch, TransformError> {
        self.expand(ins, None)
    }

    /// Like [`MutationContext::mutate_many`], for an instruction at `address`. Address
    /// dependent rules (virtual call) only fire here.
    pub fn mutate_many_at(
        &mut self,
        ins: &Instruction,
        address: u64,
    ) -> Result<MutationBatch, TransformError> {
        self.expand(ins, Some(address))
    }

    fn expand(
        &mut self,
        ins: &Instruction,
        address: Option<u64>,
    ) -> Result<MutationBatch, TransformError> {
        let mut site = Site {
            address,
            config: &self.config,
            rng: &mut self.rng,
            dispatch: self.dispatch.as_mut(),
        };
        for rule in multi::CATALOG {
            if !rule.matches(ins, &site) {
                continue;
            }
            let p = site.config.probability_for(rule.kind());
            if !site.rng.random_bool(p) {
                continue;
            }
            let batch = rule.expand(ins, &mut site)?;
            if batch.is_empty() {
                continue;
            }
            debug!(rule = %rule.kind(), from = %ins, records = batch.len(), "expansion");
            return Ok(batch);
        }
        Ok(MutationBatch::empty())
    }

    fn gate(&mut self, kind: RuleKind) -> bool {
        let p = self.config.probability_for(kind);
        self.rng.random_bool(p)
    }
}
