//! Property tests for evaluation and tape shortening
use nalgebra::Vector3;
use rand::{rngs::StdRng, Rng, SeedableRng};
use whittle::{
    context::Tree,
    eval::{Evaluator, Feature, FeatureChoice},
    tape::Choice,
};

/// A grab-bag of shapes exercising every corner of the op set
fn shapes() -> Vec<Tree> {
    let (x, y, z) = Tree::axes();
    vec![
        (x.square() + y.square() + z.square()).sqrt() - 1.0,
        x.clone() * 0.5 + y.clone() * 0.25 - z.clone() + 0.1,
        (x.clone() + y.clone()).min(x.clone() - y.clone()).max(z.clone() - 0.5),
        (x.clone() * 3.0).sin() + (y.clone() * 2.0).cos() - z.clone(),
        x.clone().abs().max(y.clone().abs()).max(z.clone().abs()) - 0.75,
        (x.square() + y.square()).sqrt() - (z.clone() * 0.5 + 0.8),
        -(x.clone().min(y.clone())) + (z.square() - 0.3),
        y.clone().atan2(x.clone()) * 0.25 + z.clone(),
    ]
}

fn random_box(rng: &mut StdRng) -> (Vector3<f32>, Vector3<f32>) {
    let mut lower = Vector3::zeros();
    let mut upper = Vector3::zeros();
    for i in 0..3 {
        let a: f32 = rng.gen_range(-2.0..2.0);
        let b: f32 = rng.gen_range(-2.0..2.0);
        lower[i] = a.min(b);
        upper[i] = a.max(b);
    }
    (lower, upper)
}

fn random_point(
    rng: &mut StdRng,
    lower: Vector3<f32>,
    upper: Vector3<f32>,
) -> Vector3<f32> {
    Vector3::from_fn(|i, _| {
        if lower[i] == upper[i] {
            lower[i]
        } else {
            rng.gen_range(lower[i]..=upper[i])
        }
    })
}

#[test]
fn test_interval_soundness() {
    // For any box, every sampled value must lie within the evaluated
    // interval (unless the interval is flagged as possibly-NaN)
    let mut rng = StdRng::seed_from_u64(0x1234);
    for shape in shapes() {
        let tape = shape.tape().unwrap();
        let mut eval = Evaluator::new(&tape);
        for _ in 0..16 {
            let (lower, upper) = random_box(&mut rng);
            let (i, maybe_nan) = eval.eval_interval(&tape, lower, upper);
            if maybe_nan {
                continue;
            }
            for _ in 0..64 {
                let p = random_point(&mut rng, lower, upper);
                let v = eval.eval_point(&tape, p);
                assert!(
                    v.is_nan() || (v >= i.lower() && v <= i.upper()),
                    "value {v} at {p:?} outside interval {i} on box \
                     [{lower:?}, {upper:?}]"
                );
            }
        }
    }
}

#[test]
fn test_tape_push_equivalence() {
    // On the box used for pushing, the shortened tape must agree with the
    // original pointwise
    let mut rng = StdRng::seed_from_u64(0xABCD);
    for shape in shapes() {
        let tape = shape.tape().unwrap();
        let mut eval = Evaluator::new(&tape);
        for _ in 0..16 {
            let (lower, upper) = random_box(&mut rng);
            let _ = eval.eval_interval(&tape, lower, upper);
            let pushed = eval.push_from_last(&tape);
            assert!(pushed.len() <= tape.len());
            for _ in 0..64 {
                let p = random_point(&mut rng, lower, upper);
                let full = eval.eval_point(&tape, p);
                let short = eval.eval_point(&pushed, p);
                assert!(
                    (full == short)
                        || (full.is_nan() && short.is_nan())
                        || (full - short).abs() < 1e-6,
                    "tape mismatch at {p:?}: {full} != {short}"
                );
            }
        }
    }
}

#[test]
fn test_push_shrinks_decided_min() {
    let shape = (Tree::x() + 1.0).min(Tree::y() + 1.0);
    let tape = shape.tape().unwrap();
    let mut eval = Evaluator::new(&tape);

    // x is decisively the smaller side on this box
    let _ = eval.eval_interval(
        &tape,
        Vector3::new(-5.0, 8.0, 0.0),
        Vector3::new(-4.0, 9.0, 0.0),
    );
    let pushed = eval.push_from_last(&tape);
    assert!(
        pushed.len() < tape.len(),
        "push failed to drop the losing branch"
    );

    // And the shortened tape ignores y entirely
    let v = eval.eval_point(&pushed, Vector3::new(1.0, 100.0, 0.0));
    assert_eq!(v, 2.0);
}

////////////////////////////////////////////////////////////////////////////////

fn random_unit(rng: &mut StdRng) -> Vector3<f32> {
    loop {
        let v = Vector3::from_fn(|_, _| rng.gen_range(-1.0..1.0f32));
        let n = v.norm();
        if n > 0.1 && n <= 1.0 {
            return v / n;
        }
    }
}

/// Searches for a direction `n` with `n . e > 0` for every epsilon, by
/// perceptron iteration
///
/// Returns a certificate direction when one is found with a comfortable
/// margin; the search is inconclusive for infeasible or knife-edge sets.
fn find_feasible(eps: &[Vector3<f32>]) -> Option<Vector3<f32>> {
    let mut n: Vector3<f32> = eps.iter().sum();
    if n.norm() < 1e-6 {
        n = eps[0];
    }
    for _ in 0..10_000 {
        let mut ok = true;
        for e in eps {
            if n.dot(e) <= 0.0 {
                n += *e;
                ok = false;
            }
        }
        if ok {
            let n = n.normalize();
            let margin = eps
                .iter()
                .map(|e| n.dot(e))
                .fold(f32::INFINITY, f32::min);
            if margin > 1e-3 {
                return Some(n);
            }
            return None;
        }
    }
    None
}

/// Searches for an infeasibility certificate: a convex combination of the
/// epsilons close to zero (so no half-space can contain them all)
///
/// Uses Frank-Wolfe iteration to approximate the minimum-norm point of the
/// convex hull.
fn find_infeasible(eps: &[Vector3<f32>]) -> bool {
    let mut c: Vector3<f32> =
        eps.iter().sum::<Vector3<f32>>() / eps.len() as f32;
    for _ in 0..2_000 {
        if c.norm() < 1e-4 {
            return true;
        }
        let e = eps
            .iter()
            .copied()
            .min_by(|a, b| c.dot(a).partial_cmp(&c.dot(b)).unwrap())
            .unwrap();
        let d = c - e;
        if d.norm() < 1e-9 {
            break;
        }
        let gamma = (c.dot(&d) / d.norm_squared()).clamp(0.0, 1.0);
        c -= d * gamma;
    }
    c.norm() < 1e-4
}

#[test]
fn test_compatible_matches_feasibility() {
    // `is_compatible` must agree with linear feasibility of the epsilon
    // set.  Random sets are checked against independent feasibility /
    // infeasibility certificates; knife-edge sets (where no certificate is
    // conclusive) are skipped.
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let choice = FeatureChoice {
        id: 0,
        choice: Choice::Left,
    };
    let mut checked = 0;
    for _ in 0..512 {
        let n = rng.gen_range(1..=6);
        let eps: Vec<_> = (0..n).map(|_| random_unit(&mut rng)).collect();

        // Build the feature incrementally, mirroring the accepted set
        let mut f = Feature::default();
        let mut set: Vec<Vector3<f32>> = vec![];
        for e in eps {
            let mut candidate = set.clone();
            candidate.push(e);
            let got = f.is_compatible(e);
            if let Some(w) = find_feasible(&candidate) {
                assert!(
                    got,
                    "rejected feasible set {candidate:?} (witness {w:?})"
                );
                checked += 1;
            } else if find_infeasible(&candidate) {
                assert!(
                    !got,
                    "accepted infeasible set {candidate:?}"
                );
                checked += 1;
            }
            if got {
                assert!(f.push(e, choice));
                set.push(e);
            }
        }
    }
    assert!(checked > 200, "not enough cases exercised ({checked})");
}

#[test]
fn test_compatibility_is_monotone() {
    // Adding vectors can only shrink the feasible cone: once a direction is
    // incompatible, it stays incompatible as the set grows
    let mut rng = StdRng::seed_from_u64(0xF00D);
    for _ in 0..128 {
        let mut f = Feature::default();
        let probe = random_unit(&mut rng);
        let choice = FeatureChoice {
            id: 0,
            choice: Choice::Left,
        };
        let mut was_incompatible = false;
        for _ in 0..5 {
            let e = random_unit(&mut rng);
            if !f.push(e, choice) {
                continue;
            }
            let now = f.is_compatible(probe);
            if was_incompatible {
                assert!(
                    !now,
                    "probe {probe:?} became compatible after adding vectors"
                );
            }
            was_incompatible = !now;
        }
    }
}
