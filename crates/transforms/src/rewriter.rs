//! Drives the mutation catalog over a byte buffer.
//!
//! Each decodable instruction is offered to the expansion rules first, then to the in-place
//! rules. A replacement shorter than the original is padded with the filler byte; a longer one
//! is only taken while the output stays within `ceil(input_len * max_expansion)` bytes, with
//! room left for the rest of the input. Bytes that do not decode are copied one at a time.

use crate::batch::MutationBatch;
use crate::context::MutationContext;
use crate::util::RuleKind;
use serde::{Deserialize, Serialize};
use shapeshift_core::decoder::{decode, Instruction};
use shapeshift_utils::errors::TransformError;
use std::collections::BTreeMap;
use tracing::{debug, info, trace};

/// Configuration for the rewriting driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// Output budget as a multiple of the input length (at least 1.0)
    pub max_expansion: f64,
    /// Byte used to pad replacements shorter than the original
    pub filler: u8,
    /// Address of the first input byte, for address-dependent rules
    pub base_address: u64,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            max_expansion: 2.0,
            filler: 0x90, // nop
            base_address: 0,
        }
    }
}

impl RewriteConfig {
    /// Rejects an expansion budget below 1.0, infinity and NaN.
    pub fn validate(&self) -> Result<(), TransformError> {
        if !self.max_expansion.is_finite() || self.max_expansion < 1.0 {
            return Err(TransformError::InvalidConfig(format!(
                "max_expansion must be a finite value >= 1.0, got {}",
                self.max_expansion
            )));
        }
        Ok(())
    }

    /// Output budget for an input of `input_len` bytes.
    pub fn budget(&self, input_len: usize) -> usize {
        (input_len as f64 * self.max_expansion).ceil() as usize
    }
}

/// Counters collected over one rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteStats {
    /// Input size in bytes
    pub input_len: usize,
    /// Output size in bytes
    pub output_len: usize,
    /// Instructions decoded
    pub decoded: usize,
    /// Bytes copied verbatim because they did not decode
    pub raw_bytes: usize,
    /// Replacements taken, by rule
    pub applied: BTreeMap<RuleKind, usize>,
    /// Replacements dropped because they did not fit the budget
    pub over_budget: usize,
    /// Replacements dropped because they did not encode
    pub rejected: usize,
    /// Filler bytes added after short replacements
    pub padding: usize,
}

impl RewriteStats {
    /// Total replacements taken.
    pub fn mutations(&self) -> usize {
        self.applied.values().sum()
    }

    /// Output size relative to the input size.
    pub fn expansion_ratio(&self) -> f64 {
        if self.input_len == 0 {
            return 1.0;
        }
        self.output_len as f64 / self.input_len as f64
    }
}

/// Result of [`Rewriter::rewrite`].
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteOutput {
    /// Rewritten code
    pub bytes: Vec<u8>,
    /// What happened along the way
    pub stats: RewriteStats,
}

/// Rewrites instruction streams with a [`MutationContext`].
#[derive(Debug)]
pub struct Rewriter {
    context: MutationContext,
    config: RewriteConfig,
}

impl Rewriter {
    /// Validates `config` and takes ownership of `context`.
    pub fn new(context: MutationContext, config: RewriteConfig) -> Result<Self, TransformError> {
        config.validate()?;
        Ok(Self { context, config })
    }

    /// The mutation context, including any attached dispatch table.
    pub const fn context(&self) -> &MutationContext {
        &self.context
    }

    /// Mutable access, e.g. to attach a dispatch table after construction.
    pub fn context_mut(&mut self) -> &mut MutationContext {
        &mut self.context
    }

    /// The driver configuration.
    pub const fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// Rewrites `input` into a new buffer. The input is not modified.
    pub fn rewrite(&mut self, input: &[u8]) -> Result<RewriteOutput, TransformError> {
        let budget = self.config.budget(input.len());
        let mut out = Vec::with_capacity(budget);
        let mut stats = RewriteStats {
            input_len: input.len(),
            ..RewriteStats::default()
        };

        debug!(
            input_len = input.len(),
            budget,
            max_expansion = self.config.max_expansion,
            "starting rewrite"
        );

        let mut offset = 0;
        while offset < input.len() {
            let ins = match decode(&input[offset..]) {
                Ok(ins) => ins,
                Err(err) => {
                    trace!(offset, %err, "copying undecodable byte");
                    out.push(input[offset]);
                    stats.raw_bytes += 1;
                    offset += 1;
                    continue;
                }
            };
            stats.decoded += 1;

            let size = usize::from(ins.size);
            let end = offset + size;
            let original = &input[offset..end];
            // what is left of the budget once the rest of the input is accounted for
            let available = budget.saturating_sub(out.len() + (input.len() - end));
            let address = self.config.base_address.wrapping_add(offset as u64);

            match self.replacement(&ins, address, available, &mut stats)? {
                Some((rule, bytes)) => {
                    trace!(offset, %rule, from = %ins, len = bytes.len(), "replacing");
                    out.extend_from_slice(&bytes);
                    if bytes.len() < size {
                        let pad = size - bytes.len();
                        out.resize(out.len() + pad, self.config.filler);
                        stats.padding += pad;
                    }
                    *stats.applied.entry(rule).or_default() += 1;
                }
                None => out.extend_from_slice(original),
            }
            offset = end;
        }

        stats.output_len = out.len();
        info!(
            input = stats.input_len,
            output = stats.output_len,
            decoded = stats.decoded,
            mutations = stats.mutations(),
            over_budget = stats.over_budget,
            rejected = stats.rejected,
            "rewrite finished"
        );
        Ok(RewriteOutput { bytes: out, stats })
    }

    /// Picks the encoded replacement for `ins`: the expansion rules first, the in-place rules
    /// second. A candidate that does not fit in `available` bytes is dropped and the next
    /// stage is tried.
    fn replacement(
        &mut self,
        ins: &Instruction,
        address: u64,
        available: usize,
        stats: &mut RewriteStats,
    ) -> Result<Option<(RuleKind, Vec<u8>)>, TransformError> {
        let batch = self.context.mutate_many_at(ins, address)?;
        if let Some(rule) = batch.rule() {
            if let Some(bytes) = fit(batch.encode_within(available), stats)? {
                return Ok(Some((rule, bytes)));
            }
        }

        let Some((rule, single)) = self.context.apply_single(ins) else {
            return Ok(None);
        };
        let batch = MutationBatch::from_rule(rule, &[single])?;
        Ok(fit(batch.encode_within(available), stats)?.map(|bytes| (rule, bytes)))
    }
}

/// Turns a capacity or encoding failure into "keep the original", propagating every other
/// error.
fn fit(
    encoded: Result<Vec<u8>, TransformError>,
    stats: &mut RewriteStats,
) -> Result<Option<Vec<u8>>, TransformError> {
    match encoded {
        Ok(bytes) => Ok(Some(bytes)),
        Err(TransformError::CapacityExceeded { needed, available }) => {
            debug!(needed, available, "replacement over budget, keeping original");
            stats.over_budget += 1;
            Ok(None)
        }
        Err(TransformError::Encode(err)) => {
            debug!(%err, "replacement does not encode, keeping original");
            stats.rejected += 1;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
