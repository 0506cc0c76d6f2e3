//! Branch switching across a long canonical chain.

mod common;

use agora_common::{Block, ChainError, StoreKind};
use agora_module_chain_coordinator::ApplyOutcome;
use agora_test_utils::{
    build_chain_from_genesis, child_with_txs, ledger, now_after, CheckpointOracle,
};
use common::{apply_all, balance, memory_chain, memory_chain_with};
use config::Config;

/// `length` blocks on top of `base`, each minting one coin to `account`
fn minting_branch(base: &Block, salt: u8, account: &str, length: u64) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    for nonce in 0..length {
        let parent = blocks.last().unwrap_or(base);
        let tx = ledger::mint(account, 1, u64::from(salt) * 1000 + nonce);
        blocks.push(child_with_txs(parent, salt, vec![tx]));
    }
    blocks
}

/// Branches diverging at block 100: the longer one wins and state only
/// reflects its transactions
#[test]
fn test_switch_to_longer_branch_at_100() {
    let mut chain = memory_chain(CheckpointOracle::never());
    let (_, trunk) = build_chain_from_genesis(100, 1);
    apply_all(&mut chain, &trunk);
    let base = &trunk[99];

    let branch_a = minting_branch(base, 2, "alice", 3);
    let branch_b = minting_branch(base, 3, "bob", 4);

    let outcomes = apply_all(&mut chain, &branch_a);
    assert!(outcomes.iter().all(|o| *o == ApplyOutcome::Extended));
    assert_eq!(balance(&chain, "alice"), 3);

    let outcomes = apply_all(&mut chain, &branch_b);
    assert!(outcomes[..3].iter().all(|o| *o == ApplyOutcome::SideBranch));
    let ApplyOutcome::Switched { ancestor, abandoned } = &outcomes[3] else {
        panic!("expected a branch switch, got {:?}", outcomes[3]);
    };
    assert_eq!(*ancestor, base.id());
    assert_eq!(abandoned.len(), 3);

    assert_eq!(chain.head(), branch_b[3].id());
    assert_eq!(balance(&chain, "alice"), 0);
    assert_eq!(balance(&chain, "bob"), 4);
    for block in &branch_a {
        assert!(!chain.is_canonical(&block.id()));
        assert!(chain.contains(&block.id()));
    }
}

/// State after a switch equals the state of applying the winning branch
/// alone
#[test]
fn test_switch_state_matches_direct_application() {
    let (_, trunk) = build_chain_from_genesis(10, 1);
    let base = &trunk[9];
    let loser = minting_branch(base, 2, "alice", 5);
    let mut winner = minting_branch(base, 3, "bob", 5);
    let top = child_with_txs(&winner[4], 3, vec![ledger::store_call("c", "k", "v", 77)]);
    winner.push(top);

    let mut switched = memory_chain(CheckpointOracle::never());
    apply_all(&mut switched, &trunk);
    apply_all(&mut switched, &loser);
    apply_all(&mut switched, &winner);

    let mut direct = memory_chain(CheckpointOracle::never());
    apply_all(&mut direct, &trunk);
    apply_all(&mut direct, &winner);

    assert_eq!(switched.head(), direct.head());
    let (switched, direct) = (switched.state_reader(), direct.state_reader());
    for kind in StoreKind::ALL {
        assert_eq!(switched.scan(kind).unwrap(), direct.scan(kind).unwrap(), "{kind:?} differs");
    }
}

/// A failing block on the longer branch leaves the old chain untouched
#[test]
fn test_failed_switch_is_all_or_nothing() {
    let mut chain = memory_chain(CheckpointOracle::never());
    let (_, trunk) = build_chain_from_genesis(5, 1);
    apply_all(&mut chain, &trunk);
    let base = &trunk[4];
    let current = minting_branch(base, 2, "alice", 2);
    apply_all(&mut chain, &current);

    let b1 = child_with_txs(base, 3, vec![ledger::mint("bob", 1, 0)]);
    let b2 = child_with_txs(&b1, 3, vec![ledger::reverting_call(1)]);
    let b3 = child_with_txs(&b2, 3, vec![ledger::mint("bob", 1, 2)]);
    chain.apply_block(b1.clone(), u64::MAX / 2).unwrap();
    chain.apply_block(b2.clone(), u64::MAX / 2).unwrap();
    assert!(chain.apply_block(b3.clone(), u64::MAX / 2).is_err());

    assert_eq!(chain.head(), current[1].id());
    assert_eq!(balance(&chain, "alice"), 2);
    assert_eq!(balance(&chain, "bob"), 0);
    assert!(!chain.contains(&b2.id()));
    assert!(!chain.contains(&b3.id()));
    assert!(!chain.is_halted());
}

/// A longer branch that only meets ours beyond the branch limit is refused
/// as a hard fork and the current chain stays
#[test]
fn test_branch_past_the_limit_is_a_hard_fork() {
    let overrides = Config::builder()
        .set_override("max-branch-length", 2)
        .unwrap()
        .build()
        .unwrap();
    let mut chain = memory_chain_with(&overrides, CheckpointOracle::never());
    let (origin, trunk) = build_chain_from_genesis(3, 1);
    apply_all(&mut chain, &trunk);

    let rival = minting_branch(&origin, 2, "mallory", 4);
    let outcomes = apply_all(&mut chain, &rival[..3]);
    assert!(outcomes.iter().all(|o| *o == ApplyOutcome::SideBranch));

    let tip = rival[3].clone();
    let result = chain.apply_block(tip.clone(), now_after(&tip));
    assert_eq!(result, Err(ChainError::HardFork { max_branch_length: 2 }));
    assert_eq!(chain.head(), trunk[2].id());
    assert!(!chain.contains(&tip.id()));
    assert_eq!(balance(&chain, "mallory"), 0);
}
