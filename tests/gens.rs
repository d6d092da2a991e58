use proptest::prelude::*;
use runahead::{GenOrder, GenVec};

#[test]
fn zero_vector_compares_equal_to_itself() {
    let z = GenVec::zero(4);
    assert_eq!(z.compare(&GenVec::zero(4)), GenOrder::Eq);
    assert!(!z.dominates(&GenVec::zero(4)));
}

#[test]
fn first_differing_slot_decides() {
    let a = GenVec::from(vec![0, 5, 5]);
    let b = GenVec::from(vec![1, 0, 0]);
    assert_eq!(a.compare(&b), GenOrder::Lt);
    assert!(b.dominates(&a));
}

#[test]
fn length_mismatch_is_a_configuration_error() {
    let a = GenVec::zero(2);
    let b = GenVec::zero(4);
    assert_eq!(a.compare(&b), GenOrder::Incomparable);
    assert_eq!(b.compare(&a), GenOrder::Incomparable);
}

/// Pairs of same-length vectors, as they occur within one run.
fn vec_pair() -> impl Strategy<Value = (Vec<u64>, Vec<u64>)> {
    (1usize..6).prop_flat_map(|n| {
        (
            prop::collection::vec(0u64..10, n),
            prop::collection::vec(0u64..10, n),
        )
    })
}

proptest! {
    #[test]
    fn same_length_vectors_are_totally_ordered((a, b) in vec_pair()) {
        let (ga, gb) = (GenVec::from(a), GenVec::from(b));
        match ga.compare(&gb) {
            GenOrder::Lt => prop_assert_eq!(gb.compare(&ga), GenOrder::Gt),
            GenOrder::Gt => prop_assert_eq!(gb.compare(&ga), GenOrder::Lt),
            GenOrder::Eq => prop_assert_eq!(gb.compare(&ga), GenOrder::Eq),
            GenOrder::Incomparable => prop_assert!(false, "equal lengths must be comparable"),
        }
    }

    #[test]
    fn merge_max_is_an_upper_bound((a, b) in vec_pair()) {
        let (ga, gb) = (GenVec::from(a), GenVec::from(b));
        let m = ga.merge_max(&gb);
        prop_assert_ne!(m.compare(&ga), GenOrder::Lt);
        prop_assert_ne!(m.compare(&gb), GenOrder::Lt);
    }

    #[test]
    fn merge_max_is_commutative((a, b) in vec_pair()) {
        let (ga, gb) = (GenVec::from(a), GenVec::from(b));
        prop_assert_eq!(ga.merge_max(&gb), gb.merge_max(&ga));
    }

    #[test]
    fn bump_overwrites_exactly_one_slot(
        (v, slot, count) in (1usize..6).prop_flat_map(|n| {
            (prop::collection::vec(0u64..10, n), 0..n, 1u64..100)
        })
    ) {
        let g = GenVec::from(v.clone());
        let bumped = g.bump(slot, count);
        prop_assert_eq!(bumped.slot(slot), count);
        for (i, original) in v.iter().enumerate() {
            if i != slot {
                prop_assert_eq!(bumped.slot(i), *original);
            }
        }
    }

    #[test]
    fn bumping_own_slot_above_dominates_the_original(
        (v, slot) in (1usize..6).prop_flat_map(|n| {
            (prop::collection::vec(0u64..10, n), 0..n)
        })
    ) {
        let g = GenVec::from(v);
        let bumped = g.bump(slot, g.slot(slot) + 1);
        prop_assert!(bumped.dominates(&g));
    }
}
