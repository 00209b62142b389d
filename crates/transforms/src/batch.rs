//! Bounded output of the expansion rules.

use crate::util::RuleKind;
use shapeshift_core::decoder::Instruction;
use shapeshift_core::encoder::encode_into;
use shapeshift_utils::errors::TransformError;

/// Ordered, bounded sequence of replacement records.
///
/// Empty means "no rule matched".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutationBatch {
    rule: Option<RuleKind>,
    items: Vec<Instruction>,
}

impl MutationBatch {
    /// Most records one rule may produce.
    pub const CAPACITY: usize = 4;

    /// An empty batch, the "no match" result.
    pub const fn empty() -> Self {
        Self {
            rule: None,
            items: Vec::new(),
        }
    }

    /// Builds the output of `rule` from `items`.
    pub fn from_rule(rule: RuleKind, items: &[Instruction]) -> Result<Self, TransformError> {
        let mut batch = Self {
            rule: Some(rule),
            items: Vec::with_capacity(Self::CAPACITY),
        };
        for ins in items {
            batch.push(*ins)?;
        }
        Ok(batch)
    }

    /// Appends a record; a fifth one is rejected.
    pub fn push(&mut self, ins: Instruction) -> Result<(), TransformError> {
        if self.items.len() == Self::CAPACITY {
            return Err(TransformError::BatchOverflow {
                capacity: Self::CAPACITY,
            });
        }
        self.items.push(ins);
        Ok(())
    }

    /// The rule that produced the batch.
    pub const fn rule(&self) -> Option<RuleKind> {
        self.rule
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no rule matched.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The records in execution order.
    pub fn as_slice(&self) -> &[Instruction] {
        &self.items
    }

    /// Iterates the records in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.items.iter()
    }

    /// Concatenated encoding of every record.
    pub fn encode(&self) -> Result<Vec<u8>, TransformError> {
        let mut bytes = Vec::with_capacity(self.items.len() * 8);
        for ins in &self.items {
            encode_into(ins, &mut bytes)?;
        }
        Ok(bytes)
    }

    /// Like [`MutationBatch::encode`], but fails with `CapacityExceeded` when the result is
    /// longer than `available` bytes.
    pub fn encode_within(&self, available: usize) -> Result<Vec<u8>, TransformError> {
        let bytes = self.encode()?;
        if bytes.len() > available {
            return Err(TransformError::CapacityExceeded {
                needed: bytes.len(),
                available,
            });
        }
        Ok(bytes)
    }
}

impl<'a> IntoIterator for &'a MutationBatch {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
