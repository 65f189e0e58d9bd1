use ndtape::{Error, Math, NDArray, Result};
use proptest::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Opens one scope per plan entry, allocating `alloc` arrays and keeping
/// `keep` of them at each level. With `fail`, the innermost level errors
/// out after allocating.
fn run_nested(math: &Math, plan: &[(usize, usize)], fail: bool) -> Result<Vec<NDArray>> {
    let Some(&(alloc, keep)) = plan.first() else {
        return Ok(Vec::new());
    };
    math.scope(|_| {
        let arrays: Vec<NDArray> = (0..alloc).map(|i| math.fill(vec![2, 2], i as f32)).collect();
        if fail && plan.len() == 1 {
            return Err(Error::InvalidConfig("injected fault".into()));
        }
        // whatever the inner levels hand back is released with this level
        let _ = run_nested(math, &plan[1..], fail);
        Ok(arrays.into_iter().take(keep).collect())
    })
}

#[test]
fn test_scope_releases_intermediates() {
    let math = Math::cpu();
    let x = math.fill(vec![3], 2.0);
    let y = math
        .scope(|_| {
            let a = math.square(&x)?;
            let b = math.exp(&a)?;
            math.sum(&b, None)
        })
        .unwrap();
    assert_eq!(math.live_arrays(), 2);
    assert!(!y.is_disposed());
    assert_eq!(math.scope_depth(), 0);
}

#[test]
fn test_scope_released_on_panic() {
    let math = Math::cpu();
    let result = catch_unwind(AssertUnwindSafe(|| {
        math.scope(|_| -> Result<()> {
            let _a = math.fill(vec![8], 1.0);
            let _b = math.fill(vec![8], 2.0);
            panic!("boom");
        })
    }));
    assert!(result.is_err());
    assert_eq!(math.scope_depth(), 0);
    assert_eq!(math.live_arrays(), 0);
}

#[test]
fn test_disposal_fault_stays_in_its_scope() {
    let math = Math::cpu();
    let outer = math.begin_scope();
    let survivor = math.fill(vec![2], 1.0);

    let inner = math.begin_scope();
    let a = math.fill(vec![2], 2.0);
    let b = math.fill(vec![2], 3.0);
    a.dispose().unwrap();
    assert!(matches!(inner.end(), Err(Error::UseAfterDispose { .. })));
    assert!(b.is_disposed());
    assert!(!survivor.is_disposed());

    outer.end().unwrap();
    assert!(survivor.is_disposed());
    assert_eq!(math.live_arrays(), 0);
}

#[test]
fn test_views_are_not_tracked_twice() {
    let math = Math::cpu();
    let kept = math
        .scope(|_| {
            let x = math.fill(vec![2, 3], 1.0);
            let flat = x.as_1d()?;
            let _again = flat.reshape(vec![3, 2])?;
            Ok(flat)
        })
        .unwrap();
    assert!(!kept.is_disposed());
    assert_eq!(math.live_arrays(), 1);
}

#[test]
fn test_stale_guard_leaves_sibling_scopes_alone() {
    let math = Math::cpu();
    let outer = math.begin_scope();
    let inner = math.begin_scope();
    assert!(outer.end().is_err());

    let fresh = math.begin_scope();
    let nested = math.begin_scope();
    let a = math.fill(vec![2], 1.0);
    assert_eq!(nested.depth(), inner.depth());

    assert!(matches!(inner.track(&a), Err(Error::ScopeClosed { depth: 2 })));
    drop(inner);
    assert_eq!(math.scope_depth(), 2);
    assert!(!a.is_disposed());

    nested.end().unwrap();
    assert!(a.is_disposed());
    fresh.end().unwrap();
    assert_eq!(math.scope_depth(), 0);
}

#[test]
fn test_ending_a_closed_scope_is_an_error() {
    let math = Math::cpu();
    let outer = math.begin_scope();
    let inner = math.begin_scope();
    assert!(outer.end().is_err());
    let sibling = math.begin_scope();
    assert!(matches!(inner.end(), Err(Error::ScopeClosed { depth: 2 })));
    assert_eq!(math.scope_depth(), 1);
    sibling.end().unwrap();
}

proptest! {
    #[test]
    fn prop_live_arrays_match_outermost_keeps(
        levels in prop::collection::vec((0usize..5, 0usize..5), 1..5),
        fail in any::<bool>(),
    ) {
        let plan: Vec<(usize, usize)> = levels.iter().map(|&(a, k)| (a, k.min(a))).collect();
        let math = Math::cpu();
        let result = run_nested(&math, &plan, fail);

        let expected = if fail && plan.len() == 1 { 0 } else { plan[0].1 };
        prop_assert_eq!(result.is_err(), fail && plan.len() == 1);
        prop_assert_eq!(math.live_arrays(), expected);
        prop_assert_eq!(math.scope_depth(), 0);
    }
}
