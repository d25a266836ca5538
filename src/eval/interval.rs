//! Interval evaluation with choice recording and NaN tracking
use crate::{
    tape::{Choice, Opcode, Tape},
    types::Interval,
};
use nalgebra::Vector3;

/// Interval evaluator
///
/// Walks a tape over an axis-aligned box, producing a sound outer bound on
/// the function's range.  Two side tables are maintained per clause:
///
/// - `maybe_nan` records whether the clause may produce a NaN somewhere in
///   the box.  NaN-possible clauses are stored as the full range
///   `(-inf, +inf)` so that downstream arithmetic stays sound, with the NaN
///   itself tracked out-of-band.
/// - `choices` records, for every `min` / `max` clause, whether one operand
///   dominates on this box; [`crate::tape::TapeData::simplify`] consumes
///   this to build a shortened tape.
#[derive(Default)]
pub struct IntervalEval {
    slots: Vec<Interval>,
    maybe_nan: Vec<bool>,
    choices: Vec<Choice>,
}

impl IntervalEval {
    /// Returns the choices recorded by the most recent evaluation
    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    /// Evaluates the tape over the box `[lower, upper]`
    ///
    /// Returns the interval at the root clause and whether it may be NaN.
    ///
    /// # Panics
    /// If `lower > upper` on any axis
    pub fn eval_with(
        &mut self,
        tape: &Tape,
        vars: &[f32],
        lower: Vector3<f32>,
        upper: Vector3<f32>,
    ) -> (Interval, bool) {
        assert!(
            (0..3).all(|i| lower[i] <= upper[i]),
            "invalid box {lower:?} > {upper:?}"
        );
        let n = tape.slot_count();
        self.slots.resize(n, f32::NAN.into());
        self.slots.fill(f32::NAN.into());
        self.maybe_nan.resize(n, false);
        self.maybe_nan.fill(false);
        self.choices.clear();
        self.choices.resize(tape.len(), Choice::Unknown);

        for (i, c) in tape.clauses().iter().enumerate().rev() {
            let (a, b) = (c.a as usize, c.b as usize);
            let nan_in = match c.op.arg_count() {
                0 => false,
                1 => self.maybe_nan[a],
                _ => self.maybe_nan[a] || self.maybe_nan[b],
            };
            let v = match c.op {
                Opcode::Input => match c.a {
                    0 => Interval::new(lower.x, upper.x),
                    1 => Interval::new(lower.y, upper.y),
                    2 => Interval::new(lower.z, upper.z),
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
                Opcode::Min => {
                    let (v, ch) = self.slots[a].min_choice(self.slots[b]);
                    self.choices[i] = ch;
                    v
                }
                Opcode::Max => {
                    let (v, ch) = self.slots[a].max_choice(self.slots[b]);
                    self.choices[i] = ch;
                    v
                }
            };
            let out = c.out as usize;
            if v.has_nan() {
                self.slots[out] = Interval::full();
                self.maybe_nan[out] = true;
            } else {
                self.slots[out] = v;
                self.maybe_nan[out] = nan_in;
            }
        }
        let root = tape.root() as usize;
        (self.slots[root], self.maybe_nan[root])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{context::Tree, types::State};

    fn eval(
        t: &Tree,
        lower: [f32; 3],
        upper: [f32; 3],
    ) -> (Interval, bool) {
        let tape = t.tape().unwrap();
        let mut e = IntervalEval::default();
        e.eval_with(&tape, &[], lower.into(), upper.into())
    }

    #[test]
    fn test_basic_math() {
        let x = Tree::x();
        let (out, nan) = eval(&(x + 1.0), [1.0; 3], [2.0; 3]);
        assert_eq!(out.lower(), 2.0);
        assert_eq!(out.upper(), 3.0);
        assert!(!nan);
    }

    #[test]
    fn test_bounds_growth() {
        // (x + y) * (x - y) is evaluated without term cancellation
        let (x, y, _) = Tree::axes();
        let f = (x.clone() + y.clone()) * (x - y);
        let (out, _) = eval(&f, [0.0; 3], [1.0; 3]);
        assert_eq!(out.lower(), -2.0);
        assert_eq!(out.upper(), 2.0);
    }

    #[test]
    fn test_nan_tracking() {
        // sqrt goes NaN when its argument straddles zero, which must not
        // allow the region to be pruned
        let f = Tree::x().sqrt() - 10.0;
        let (out, nan) = eval(&f, [-1.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        assert!(nan);
        assert_eq!(out.state(nan), State::Ambiguous);

        // On a strictly positive domain there's no NaN and the shifted
        // result can prune
        let (out, nan) = eval(&f, [1.0, 0.0, 0.0], [4.0, 0.0, 0.0]);
        assert!(!nan);
        assert_eq!(out.state(nan), State::Filled);
    }

    #[test]
    fn test_choice_recording() {
        let shape = (Tree::x() + 1.0).min(Tree::y() + 1.0);
        let tape = shape.tape().unwrap();
        let mut e = IntervalEval::default();

        // x + 1 is decisively smaller, so the min should record Left
        let (out, _) = e.eval_with(
            &tape,
            &[],
            Vector3::new(-5.0, 8.0, 0.0),
            Vector3::new(-4.0, 9.0, 0.0),
        );
        out.compare_eq(Interval::new(-4.0, -3.0));
        let min_pos = tape
            .clauses()
            .iter()
            .position(|c| c.op == Opcode::Min)
            .unwrap();
        assert_eq!(e.choices()[min_pos], Choice::Left);
    }
}
