//! Rule identities and the catalog configuration.

use serde::{Deserialize, Serialize};
use shapeshift_core::operand::Reg;
use shapeshift_utils::errors::TransformError;
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one rule of the mutation catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// `mov r, 0` → `xor r, r`
    ZeroMove,
    /// `mov r/m, r` → `mov r, r/m` (register-direct only)
    StoreToLoad,
    /// `xor r, r` → `mov r32, 0`
    XorZero,
    /// `push imm32` → `sub rsp, 8; mov qword [rsp], imm32`
    PushExpand,
    /// `xchg a, b` → three `xor`s
    XchgSwap,
    /// `add acc, imm32` through a masked scratch register
    AddMba,
    /// `sub acc, imm32` through a masked scratch register
    SubMba,
    /// `mov r32, imm32` as masked load plus unmask
    MovImmMba,
    /// `jcc rel32` → `setncc al; test al, al; jnz; jmp`
    JccInvert,
    /// `call rel32` → `mov rax, stub; call rax`
    VirtualCall,
}

impl RuleKind {
    /// In-place rules, in priority order.
    pub const SINGLE: [Self; 3] = [Self::ZeroMove, Self::StoreToLoad, Self::XorZero];

    /// Expansion rules, in priority order.
    pub const MULTI: [Self; 7] = [
        Self::PushExpand,
        Self::XchgSwap,
        Self::AddMba,
        Self::SubMba,
        Self::MovImmMba,
        Self::JccInvert,
        Self::VirtualCall,
    ];

    /// Snake-case name, the same key the configuration file uses.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ZeroMove => "zero_move",
            Self::StoreToLoad => "store_to_load",
            Self::XorZero => "xor_zero",
            Self::PushExpand => "push_expand",
            Self::XchgSwap => "xchg_swap",
            Self::AddMba => "add_mba",
            Self::SubMba => "sub_mba",
            Self::MovImmMba => "mov_imm_mba",
            Self::JccInvert => "jcc_invert",
            Self::VirtualCall => "virtual_call",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const fn default_scratch() -> Reg {
    Reg::RCX
}

/// Configuration for the mutation catalog.
///
/// There is no `Default`: the gate probability must always be chosen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Chance that a rule whose pattern matches is actually applied
    pub probability: f64,
    /// Per-rule replacements for `probability`
    #[serde(default)]
    pub overrides: BTreeMap<RuleKind, f64>,
    /// Register the arithmetic rules may clobber
    #[serde(default = "default_scratch")]
    pub scratch: Reg,
    /// Enables the virtual call rule (also needs an attached dispatch table)
    #[serde(default)]
    pub virtual_call: bool,
}

impl MutationConfig {
    /// Every rule gated at `probability`, `rcx` as scratch, virtual calls off.
    pub fn new(probability: f64) -> Self {
        Self {
            probability,
            overrides: BTreeMap::new(),
            scratch: default_scratch(),
            virtual_call: false,
        }
    }

    /// Gates `kind` at its own probability.
    pub fn with_override(mut self, kind: RuleKind, probability: f64) -> Self {
        self.overrides.insert(kind, probability);
        self
    }

    /// Picks the register the arithmetic rules clobber.
    pub const fn with_scratch(mut self, scratch: Reg) -> Self {
        self.scratch = scratch;
        self
    }

    /// Turns the virtual call rule on or off.
    pub const fn with_virtual_call(mut self, enabled: bool) -> Self {
        self.virtual_call = enabled;
        self
    }

    /// The gate probability for `kind`.
    pub fn probability_for(&self, kind: RuleKind) -> f64 {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.probability)
    }

    /// Checks probabilities and the scratch register.
    ///
    /// The scratch register must differ from the accumulator it feeds and from the stack
    /// pointer.
    pub fn validate(&self) -> Result<(), TransformError> {
        check_probability("probability", self.probability)?;
        for (kind, p) in &self.overrides {
            check_probability(kind.name(), *p)?;
        }
        if self.scratch == Reg::RAX || self.scratch == Reg::RSP {
            return Err(TransformError::InvalidConfig(format!(
                "scratch register {} is reserved",
                self.scratch
            )));
        }
        Ok(())
    }
}

fn check_probability(field: &str, p: f64) -> Result<(), TransformError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(TransformError::InvalidConfig(format!(
            "{field} must be within 0..=1, got {p}"
        )))
    }
}
