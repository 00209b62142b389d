//! Instruction-level mutation for the shapeshift codec.
//!
//! In-place rules ([`single`]) swap one record for another of similar length; expansion
//! rules ([`multi`]) emit a short [`MutationBatch`]. [`MutationContext`] gates both with a
//! seeded random source and [`Rewriter`] drives them over a whole buffer.

pub mod batch;
pub mod context;
pub mod dispatch;
pub mod mba;
pub mod multi;
pub mod rewriter;
pub mod single;
pub mod util;

pub use batch::MutationBatch;
pub use context::MutationContext;
pub use rewriter::{RewriteConfig, RewriteOutput, RewriteStats, Rewriter};
pub use util::{MutationConfig, RuleKind};

use dispatch::VirtualDispatch;
use rand::rngs::StdRng;
use shapeshift_core::decoder::Instruction;
use shapeshift_utils::errors::TransformError;

/// Trait for rules that replace one instruction with exactly one other.
pub trait InPlaceRule: Send + Sync {
    /// Returns the rule's identity for configuration and logging.
    fn kind(&self) -> RuleKind;
    /// Structural predicate, checked before the random gate.
    fn matches(&self, ins: &Instruction) -> bool;
    /// Builds the replacement. Only called when `matches` holds.
    fn rewrite(&self, ins: &Instruction) -> Option<Instruction>;
}

/// Trait for rules that expand one instruction into a short sequence.
pub trait ExpansionRule: Send + Sync {
    /// Returns the rule's identity for configuration and logging.
    fn kind(&self) -> RuleKind;
    /// Structural predicate, checked before the random gate.
    fn matches(&self, ins: &Instruction, site: &Site<'_>) -> bool;
    /// Builds the replacement sequence. Only called when `matches` holds.
    fn expand(&self, ins: &Instruction, site: &mut Site<'_>)
        -> Result<MutationBatch, TransformError>;
}

/// Everything an expansion rule may consult besides the instruction itself.
#[derive(Debug)]
pub struct Site<'a> {
    /// Address of the instruction, when the caller knows it
    pub address: Option<u64>,
    /// Catalog configuration
    pub config: &'a MutationConfig,
    /// The context's random source, for rules that draw masks
    pub rng: &'a mut StdRng,
    /// Dispatch table and stub cache, when one is attached
    pub dispatch: Option<&'a mut VirtualDispatch>,
}
