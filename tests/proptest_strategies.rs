//! Proptest strategies for sequences of memory operations

#![allow(dead_code)]

use proptest::prelude::*;

/// One step against a live manager; `slot` picks a live allocation modulo
/// the number alive
#[derive(Debug, Clone)]
pub enum Op {
    Reserve { granules: usize, top_down: bool, commit: bool },
    Commit { slot: usize, pages: usize },
    Decommit { slot: usize, pages: usize },
    Release { slot: usize },
    ReleaseInterior { slot: usize },
}

pub fn reserve() -> impl Strategy<Value = Op> {
    (1usize..8, any::<bool>(), any::<bool>()).prop_map(|(granules, top_down, commit)| Op::Reserve {
        granules,
        top_down,
        commit,
    })
}

pub fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => reserve(),
        2 => (any::<usize>(), 1usize..16).prop_map(|(slot, pages)| Op::Commit { slot, pages }),
        1 => (any::<usize>(), 1usize..16).prop_map(|(slot, pages)| Op::Decommit { slot, pages }),
        2 => any::<usize>().prop_map(|slot| Op::Release { slot }),
        1 => any::<usize>().prop_map(|slot| Op::ReleaseInterior { slot }),
    ]
}

pub fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op(), 1..40)
}
