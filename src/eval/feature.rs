//! Gradient disambiguation at `min` / `max` coincidences
//!
//! At a point where both operands of a `min` or `max` clause are equal, the
//! derivative of the result is multi-valued.  A [`Feature`] records one
//! consistent resolution: for every such clause, which branch was taken, plus
//! a set of unit *epsilon* directions into which that resolution remains
//! valid.  A feature is only kept while its epsilon set admits a common
//! strictly-positive direction, so the branch assignments never contradict
//! each other geometrically.
use crate::{
    tape::{Choice, Id, Opcode, Tape},
    types::Grad,
};
use nalgebra::Vector3;
use std::collections::HashMap;

/// Widened zero for sign tests in the compatibility predicate
///
/// An exact zero (a candidate direction exactly in the test plane) is
/// rejected; values within this tolerance are treated the same way so the
/// predicate doesn't flicker under rounding.
const ZERO_TOLERANCE: f32 = 1e-12;

/// Records which branch of an ambiguous `min` / `max` clause was taken
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FeatureChoice {
    /// Destination slot of the clause
    pub id: Id,
    /// Branch taken (`Left` or `Right`)
    pub choice: Choice,
}

/// One consistent resolution of the derivative ambiguities at a point
#[derive(Clone, Debug, Default)]
pub struct Feature {
    /// Gradient of the function under this resolution
    pub deriv: Vector3<f32>,
    epsilons: Vec<Vector3<f32>>,
    choices: Vec<FeatureChoice>,
}

impl Feature {
    /// Returns the recorded branch choices, most recent first
    pub fn choices(&self) -> &[FeatureChoice] {
        &self.choices
    }

    /// Returns the unit epsilon directions constraining this feature
    pub fn epsilons(&self) -> &[Vector3<f32>] {
        &self.epsilons
    }

    /// Checks whether adding the direction `e` still admits a single
    /// half-space, i.e. a direction `n` with `n · e_i > 0` for every stored
    /// epsilon and for `e` itself
    pub fn is_compatible(&self, e: Vector3<f32>) -> bool {
        let norm = e.norm();
        if norm == 0.0 {
            return false;
        }
        let e = e / norm;

        if self.epsilons.is_empty() {
            return true;
        }
        if self.epsilons.len() == 1 {
            return e.dot(&self.epsilons[0]) != -1.0;
        }

        // Return early if the epsilon is already in the list.  Note that
        // this runs before the planar check, so an epsilon that is already
        // present is accepted even if the existing set has somehow become
        // infeasible; `test_push_ordering` pins this down.
        if self.epsilons.iter().any(|i| e == *i) {
            return true;
        }

        match self.check_planar(e) {
            Planar::Fail => return false,
            Planar::Success => return true,
            Planar::NotPlanar => (),
        }

        // Otherwise, we construct every possible separating plane and check
        // against every remaining point to make sure they work.
        //
        // Yes, this is an O(n^3) loop.  It's far from optimal, but will
        // suffice unless someone builds a deliberately pathological model.
        let mut es = self.epsilons.clone();
        es.push(e);
        let n = es.len();
        for a in 0..n {
            for b in 0..n {
                if a == b || es[a].dot(&es[b]) == -1.0 {
                    continue;
                }
                let norm = es[a].cross(&es[b]);
                let mut sign = 0i8;
                let mut passed = true;
                for (c, ec) in es.iter().enumerate() {
                    if c == a || c == b {
                        continue;
                    }
                    let d = norm.dot(ec);
                    if d < -ZERO_TOLERANCE {
                        passed &= sign <= 0;
                        sign = -1;
                    } else if d > ZERO_TOLERANCE {
                        passed &= sign >= 0;
                        sign = 1;
                    } else {
                        passed = false;
                    }
                    if !passed {
                        break;
                    }
                }
                if passed {
                    return true;
                }
            }
        }
        false
    }

    /// Records a choice, adding its epsilon if compatible
    ///
    /// Returns `false` (leaving the feature unchanged) if the epsilon is
    /// incompatible with the existing set.
    pub fn push(&mut self, e: Vector3<f32>, choice: FeatureChoice) -> bool {
        if !self.is_compatible(e) {
            return false;
        }
        self.choices.insert(0, choice);
        let norm = e.norm();
        if norm > 0.0 {
            let e = e / norm;
            if !self.epsilons.iter().any(|i| *i == e) {
                self.epsilons.push(e);
            }
        }
        true
    }

    /// Special case for coplanar epsilon sets
    ///
    /// If every stored epsilon and `v` lie in a common plane, feasibility
    /// reduces to the set fitting inside an open half-plane: sort by angle
    /// and look for a circular gap larger than pi.
    fn check_planar(&self, v: Vector3<f32>) -> Planar {
        if self.epsilons.len() < 2 {
            return Planar::NotPlanar;
        }

        let plane = self.epsilons[0].cross(&v);
        let norm = plane.norm();
        if norm < ZERO_TOLERANCE {
            // v is (anti-)parallel to the first epsilon; no unique plane
            return Planar::NotPlanar;
        }
        let plane = plane / norm;

        let reference = self.epsilons[0];
        let mut angles = vec![0.0f32];
        for w in self.epsilons.iter().skip(1).chain(std::iter::once(&v)) {
            if w.dot(&plane).abs() > 1e-6 {
                return Planar::NotPlanar;
            }
            let angle = reference.cross(w).dot(&plane).atan2(reference.dot(w));
            angles.push(angle);
        }

        // Largest circular gap between adjacent directions; the set fits in
        // an open half-plane iff some gap exceeds pi.
        angles.sort_by(|a, b| a.total_cmp(b));
        let mut max_gap = angles[0] + std::f32::consts::TAU
            - angles.last().unwrap();
        for pair in angles.windows(2) {
            max_gap = max_gap.max(pair[1] - pair[0]);
        }
        if max_gap > std::f32::consts::PI {
            Planar::Success
        } else {
            Planar::Fail
        }
    }
}

enum Planar {
    Fail,
    Success,
    NotPlanar,
}

////////////////////////////////////////////////////////////////////////////////

/// Feature evaluator
///
/// Enumerates the distinct gradients of the function at a single point by
/// exploring branch assignments for ambiguous `min` / `max` clauses,
/// pruning assignments whose epsilon sets become incompatible.
#[derive(Default)]
pub struct FeatureEval {
    slots: Vec<Grad>,
}

/// First ambiguous, unassigned clause hit during a walk
struct Ambiguity {
    /// Position of the clause in the tape
    pos: usize,
    lhs: Grad,
    rhs: Grad,
}

impl FeatureEval {
    /// Walks the tape at `p` with the given forced branch choices
    ///
    /// Returns the root gradient and the first ambiguous `min` / `max`
    /// clause that has no assignment (if any).
    fn walk(
        &mut self,
        tape: &Tape,
        vars: &[f32],
        p: Vector3<f32>,
        assigned: &HashMap<usize, Choice>,
    ) -> (Grad, Option<Ambiguity>) {
        self.slots.resize(tape.slot_count(), Grad::from(f32::NAN));
        self.slots.fill(Grad::from(f32::NAN));
        let mut ambiguity: Option<Ambiguity> = None;

        for (i, c) in tape.clauses().iter().enumerate().rev() {
            let (a, b) = (c.a as usize, c.b as usize);
            let v = match c.op {
                Opcode::Input => match c.a {
                    0 => Grad::new(p.x, 1.0, 0.0, 0.0),
                    1 => Grad::new(p.y, 0.0, 1.0, 0.0),
                    2 => Grad::new(p.z, 0.0, 0.0, 1.0),
                    i => panic!("invalid input axis {i}"),
                },
                Opcode::Var => vars[a].into(),
                Opcode::Const => tape.constant(c.a).into(),

                Opcode::Neg => -self.slots[a],
                Opcode::Abs => self.slots[a].abs(),
                Opcode::Recip => self.slots[a].recip(),
                Opcode::Sqrt => self.slots[a].sqrt(),
                Opcode::Square => self.slots[a].square(),
                Opcode::Exp => self.slots[a].exp(),
                Opcode::Ln => self.slots[a].ln(),
                Opcode::Sin => self.slots[a].sin(),
                Opcode::Cos => self.slots[a].cos(),
                Opcode::Tan => self.slots[a].tan(),
                Opcode::Asin => self.slots[a].asin(),
                Opcode::Acos => self.slots[a].acos(),
                Opcode::Atan => self.slots[a].atan(),

                Opcode::Add => self.slots[a] + self.slots[b],
                Opcode::Sub => self.slots[a] - self.slots[b],
                Opcode::Mul => self.slots[a] * self.slots[b],
                Opcode::Div => self.slots[a] / self.slots[b],
                Opcode::Atan2 => self.slots[a].atan2(self.slots[b]),
                Opcode::Pow => self.slots[a].pow(self.slots[b]),
                Opcode::Less => self.slots[a].less(self.slots[b]),
                Opcode::Min | Opcode::Max => {
                    let (va, vb) = (self.slots[a], self.slots[b]);
                    if let Some(&ch) = assigned.get(&i) {
                        match ch {
                            Choice::Left => va,
                            Choice::Right => vb,
                            _ => unreachable!("unassignable choice"),
                        }
                    } else {
                        if va.v == vb.v
                            && va.deriv() != vb.deriv()
                            && ambiguity.is_none()
                        {
                            ambiguity = Some(Ambiguity {
                                pos: i,
                                lhs: va,
                                rhs: vb,
                            });
                        }
                        if c.op == Opcode::Min {
                            va.min(vb)
                        } else {
                            va.max(vb)
                        }
                    }
                }
            };
            self.slots[c.out as usize] = v;
        }
        (self.slots[tape.root() as usize], ambiguity)
    }

    /// Enumerates the distinct gradient features at the given position
    ///
    /// Away from any `min` / `max` coincidence this returns a single feature
    /// holding the plain gradient.  At a coincidence, each compatible branch
    /// assignment produces one feature; duplicates (by gradient) are dropped.
    pub fn features_at(
        &mut self,
        tape: &Tape,
        vars: &[f32],
        p: Vector3<f32>,
    ) -> Vec<Feature> {
        let mut out: Vec<Feature> = vec![];
        let mut todo = vec![(HashMap::new(), Feature::default())];

        // Bounded DFS over branch assignments.  The bound is far above
        // anything a reasonable model produces; deeply pathological points
        // fall back to the plain gradient below.
        let mut steps = 0;
        while let Some((assigned, feature)) = todo.pop() {
            steps += 1;
            if steps > 64 {
                log::warn!(
                    "feature search at {p:?} exceeded its step limit"
                );
                break;
            }
            let (g, ambiguity) = self.walk(tape, vars, p, &assigned);
            let Some(amb) = ambiguity else {
                let mut f = feature;
                f.deriv = g.deriv();
                if !out
                    .iter()
                    .any(|o| (o.deriv - f.deriv).norm() < 1e-6)
                {
                    out.push(f);
                }
                continue;
            };

            // For min(a, b), the left branch stays active for displacements
            // where a falls below b, i.e. along ∇b - ∇a; for max it's the
            // reverse.
            let (da, db) = (amb.lhs.deriv(), amb.rhs.deriv());
            let clause = tape.clauses()[amb.pos];
            let e_left = if clause.op == Opcode::Max {
                da - db
            } else {
                db - da
            };
            for (choice, eps) in
                [(Choice::Left, e_left), (Choice::Right, -e_left)]
            {
                let mut f = feature.clone();
                if f.push(
                    eps,
                    FeatureChoice {
                        id: clause.out,
                        choice,
                    },
                ) {
                    let mut assigned = assigned.clone();
                    assigned.insert(amb.pos, choice);
                    todo.push((assigned, f));
                }
            }
        }

        if out.is_empty() {
            // Every assignment was epsilon-incompatible (or the search was
            // cut short); keep the plain gradient so the caller always gets
            // something usable.
            let (g, _) = self.walk(tape, vars, p, &HashMap::new());
            out.push(Feature {
                deriv: g.deriv(),
                ..Default::default()
            });
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Tree;

    fn v(x: f32, y: f32, z: f32) -> Vector3<f32> {
        Vector3::new(x, y, z)
    }

    #[test]
    fn test_compatible_basics() {
        let mut f = Feature::default();
        assert!(!f.is_compatible(v(0.0, 0.0, 0.0)));
        assert!(f.is_compatible(v(1.0, 0.0, 0.0)));
        assert!(f.push(
            v(1.0, 0.0, 0.0),
            FeatureChoice {
                id: 0,
                choice: Choice::Left
            }
        ));

        // Anything but the exact opposite is fine with a single epsilon
        assert!(f.is_compatible(v(0.0, 1.0, 0.0)));
        assert!(!f.is_compatible(v(-1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_compatible_pair() {
        // Scenario from the kernel's original test suite: with epsilons
        // {+x, +y}, the direction (-1, -1, 0) is infeasible while (1, 1, 0)
        // is fine
        let mut f = Feature::default();
        let c = FeatureChoice {
            id: 0,
            choice: Choice::Left,
        };
        assert!(f.push(v(1.0, 0.0, 0.0), c));
        assert!(f.push(v(0.0, 1.0, 0.0), c));

        let s = 1.0 / 2.0f32.sqrt();
        assert!(!f.is_compatible(v(-s, -s, 0.0)));
        assert!(f.is_compatible(v(s, s, 0.0)));
    }

    #[test]
    fn test_planar_fast_path() {
        // Epsilons at 0 and 60 degrees in the XY plane
        let mut f = Feature::default();
        let c = FeatureChoice {
            id: 0,
            choice: Choice::Left,
        };
        let t = std::f32::consts::PI / 3.0;
        assert!(f.push(v(1.0, 0.0, 0.0), c));
        assert!(f.push(v(t.cos(), t.sin(), 0.0), c));

        // 120 degrees keeps the spread under pi
        let u = 2.0 * std::f32::consts::PI / 3.0;
        assert!(f.is_compatible(v(u.cos(), u.sin(), 0.0)));

        // 180 degrees pushes the spread to pi, which is infeasible
        assert!(!f.is_compatible(v(-1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_compatibility_monotone() {
        // If a set is compatible, any subset must be; build up one vector
        // at a time and check that every prefix accepted the next vector
        let dirs = [
            v(1.0, 0.0, 0.0),
            v(0.8, 0.6, 0.0),
            v(0.6, 0.0, 0.8),
            v(0.5, 0.5, 0.70710678),
        ];
        let c = FeatureChoice {
            id: 0,
            choice: Choice::Left,
        };
        let mut f = Feature::default();
        for d in dirs {
            assert!(f.is_compatible(d));
            assert!(f.push(d, c));
        }

        // And the incompatible direction stays incompatible as the set
        // grows
        let mut f = Feature::default();
        assert!(f.push(v(1.0, 0.0, 0.0), c));
        let bad = v(-1.0, 0.0, 0.0);
        assert!(!f.is_compatible(bad));
        assert!(f.push(v(0.0, 1.0, 0.0), c));
        assert!(!f.is_compatible(bad));
        assert!(f.push(v(0.0, 0.0, 1.0), c));
        assert!(!f.is_compatible(bad));
    }

    #[test]
    fn test_push_ordering() {
        // An epsilon that is already present is accepted by the early-exit
        // check, before the planar test could reject the set as a whole
        let mut f = Feature::default();
        let c = FeatureChoice {
            id: 0,
            choice: Choice::Left,
        };
        assert!(f.push(v(1.0, 0.0, 0.0), c));
        assert!(f.push(v(0.0, 1.0, 0.0), c));
        assert!(f.push(v(0.0, 0.0, 1.0), c));
        let eps = f.epsilons().to_vec();
        for e in eps {
            assert!(f.is_compatible(e));
            assert!(f.push(e, c));
        }
        assert_eq!(f.epsilons().len(), 3);
    }

    #[test]
    fn test_features_at_corner() {
        // Cube corner via max(max(|x|, |y|), |z|) - 1, expressed with
        // explicit min/max so the ambiguity machinery kicks in
        let (x, y, z) = Tree::axes();
        let half = |t: &Tree| t.clone().max(-t.clone());
        let cube = half(&x).max(half(&y)).max(half(&z)) - 1.0;
        let tape = cube.tape().unwrap();
        let mut e = FeatureEval::default();

        // Face: single feature pointing along +x
        let fs = e.features_at(&tape, &[], v(1.0, 0.0, 0.0));
        assert_eq!(fs.len(), 1);
        assert!((fs[0].deriv.normalize() - v(1.0, 0.0, 0.0)).norm() < 1e-6);

        // Edge: two features
        let fs = e.features_at(&tape, &[], v(1.0, 1.0, 0.0));
        assert_eq!(fs.len(), 2);

        // Corner: three features
        let fs = e.features_at(&tape, &[], v(1.0, 1.0, 1.0));
        assert_eq!(fs.len(), 3);
        for f in &fs {
            assert!(f.deriv.norm() > 0.5);
        }
    }
}
