use crate::machine::Machine;
use shapeshift_core::decoder::decode;
use shapeshift_core::operand::Reg;
use shapeshift_transform::{MutationConfig, MutationContext, RewriteConfig, Rewriter, RuleKind};

/// Straight-line code using only forms the register machine models, ending in `ret`.
fn sample() -> Vec<u8> {
    hex::decode(concat!(
        "b844332211",     // mov eax, 0x11223344
        "0510000000",     // add eax, 0x10
        "4887d9",         // xchg rcx, rbx
        "4c89c2",         // mov rdx, r8
        "6801000000",     // push 1
        "31f6",           // xor esi, esi
        "482d00010000",   // sub rax, 0x100
        "c3",             // ret
    ))
    .unwrap()
}

fn rewriter(config: MutationConfig, seed: u64, max_expansion: f64) -> Rewriter {
    let context = MutationContext::new(config, seed).unwrap();
    let config = RewriteConfig {
        max_expansion,
        ..RewriteConfig::default()
    };
    Rewriter::new(context, config).unwrap()
}

#[test]
fn rewrite_preserves_behavior() {
    let input = sample();
    for seed in 0..32 {
        let mut rw = rewriter(MutationConfig::new(0.7), seed, 4.0);
        let scratch = rw.context().config().scratch;
        let budget = rw.config().budget(input.len());
        let out = rw.rewrite(&input).unwrap();
        assert!(out.bytes.len() <= budget);

        let mut before = Machine::seeded(seed);
        let mut after = before.clone();
        assert_eq!(before.run(&input, 0x1000), 0);
        assert_eq!(after.run(&out.bytes, 0x1000), 0);
        for reg in (0..16).filter_map(Reg::new).filter(|&r| r != scratch) {
            assert_eq!(before.get(reg), after.get(reg), "seed {seed}: {reg}");
        }
        assert_eq!(before.mem, after.mem, "seed {seed}");
    }
}

#[test]
fn rewrite_is_reproducible() {
    let input = sample();
    let a = rewriter(MutationConfig::new(0.5), 99, 3.0).rewrite(&input).unwrap();
    let b = rewriter(MutationConfig::new(0.5), 99, 3.0).rewrite(&input).unwrap();
    assert_eq!(a, b);
}

#[test]
fn rewrite_counts_rules() {
    let config = MutationConfig::new(0.0)
        .with_override(RuleKind::PushExpand, 1.0)
        .with_override(RuleKind::XorZero, 1.0);
    let out = rewriter(config, 0, 3.0).rewrite(&sample()).unwrap();
    assert_eq!(out.stats.applied.get(&RuleKind::PushExpand), Some(&1));
    assert_eq!(out.stats.applied.get(&RuleKind::XorZero), Some(&1));
    assert_eq!(out.stats.mutations(), 2);
    assert_eq!(out.stats.decoded, 8);
    assert_eq!(out.stats.output_len, out.bytes.len());
    // push grows by 10, xor esi, esi (2) becomes mov esi, 0 (5)
    assert_eq!(out.bytes.len(), sample().len() + 10 + 3);
}

#[test]
fn rewrite_keeps_unknown_bytes_in_place() {
    let mut input = vec![0xF4, 0x0F, 0x0B];
    input.extend_from_slice(&sample());
    let out = rewriter(MutationConfig::new(1.0), 3, 4.0).rewrite(&input).unwrap();
    assert_eq!(&out.bytes[..3], &input[..3]);
    assert_eq!(out.stats.raw_bytes, 3);
    assert!(decode(&out.bytes[3..]).is_ok());
}

#[test]
fn budget_of_one_never_grows() {
    let input = sample();
    for seed in 0..8 {
        let out = rewriter(MutationConfig::new(1.0), seed, 1.0).rewrite(&input).unwrap();
        assert_eq!(out.bytes.len(), input.len());
    }
}

/// Branches whose displacement sits at the end of its range, then `ret`.
fn edge_branches() -> Vec<u8> {
    hex::decode(concat!(
        "0f8400000080", // je -0x80000000
        "0f84ffffff7f", // je +0x7fffffff
        "7580",         // jne -0x80
        "e900000080",   // jmp -0x80000000
        "e8ffffff7f",   // call +0x7fffffff
        "c3",           // ret
    ))
    .unwrap()
}

#[test]
fn edge_branches_never_fail() {
    let input = edge_branches();
    for seed in 0..16 {
        let out = rewriter(MutationConfig::new(1.0), seed, 4.0).rewrite(&input).unwrap();
        assert_eq!(&out.bytes[..6], &input[..6], "seed {seed}");
        assert_eq!(out.stats.decoded, 6);
    }
}

#[test]
fn edge_branch_keeps_its_target() {
    let input = edge_branches();
    let config = MutationConfig::new(0.0).with_override(RuleKind::JccInvert, 1.0);
    let out = rewriter(config, 0, 4.0).rewrite(&input).unwrap();
    assert_eq!(out.stats.applied.get(&RuleKind::JccInvert), Some(&1));
    assert_eq!(&out.bytes[..6], &input[..6]);

    // the second je now ends in a jmp at output offset 17
    assert_eq!(out.bytes[17], 0xE9);
    let rel = i32::from_le_bytes(out.bytes[18..22].try_into().unwrap());
    assert_eq!(22 + i64::from(rel), 12 + i64::from(i32::MAX));
    assert_eq!(&out.bytes[22..], &input[12..]);
}
