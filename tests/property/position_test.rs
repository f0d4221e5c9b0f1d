// tests/property/position_test.rs

//! Ordering properties of fractional list positions.

use liveroom::core::crdt::position;
use proptest::prelude::*;

/// A position reachable by a chain of insertions from an empty list.
fn arb_position() -> impl Strategy<Value = String> {
    // A random walk of before/after/between moves from the first position.
    prop::collection::vec(0u8..3, 0..12).prop_map(|moves| {
        let mut low: Option<String> = None;
        let mut high: Option<String> = None;
        let mut pos = position::first();
        for step in moves {
            match step {
                0 => {
                    high = Some(pos.clone());
                    pos = position::between(low.as_deref(), high.as_deref());
                }
                1 => {
                    low = Some(pos.clone());
                    pos = position::between(low.as_deref(), high.as_deref());
                }
                _ => {}
            }
        }
        pos
    })
}

proptest! {
    #[test]
    fn between_stays_strictly_inside_bounds(a in arb_position(), b in arb_position()) {
        prop_assume!(a != b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let mid = position::between(Some(&lo), Some(&hi));
        prop_assert!(lo < mid, "{lo:?} !< {mid:?}");
        prop_assert!(mid < hi, "{mid:?} !< {hi:?}");
    }

    #[test]
    fn before_and_after_are_strictly_ordered(p in arb_position()) {
        prop_assert!(position::before(&p) < p);
        prop_assert!(p < position::after(&p));
    }

    #[test]
    fn repeated_bisection_never_collides(splits in 1usize..60) {
        // Repeatedly split the smallest gap; every key must stay unique and
        // ordered.
        let mut keys = vec![position::first(), position::after(&position::first())];
        for _ in 0..splits {
            let mid = position::between(Some(&keys[0]), Some(&keys[1]));
            prop_assert!(keys[0] < mid && mid < keys[1]);
            keys[1] = mid;
        }
    }
}
