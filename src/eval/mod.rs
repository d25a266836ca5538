//! Evaluator family for walking tapes over different domains
//!
//! Each evaluator owns its own scratch memory (sized to the base tape's slot
//! count) and walks the clause stream back-to-front:
//!
//! - [`IntervalEval`]: interval arithmetic over a region, recording min/max
//!   choices for tape shortening
//! - [`PointEval`]: single-point evaluation
//! - [`ArrayEval`]: bulk evaluation over many points
//! - [`DerivEval`]: bulk forward-mode gradients, with ambiguity flags
//! - [`FeatureEval`]: gradient disambiguation at min/max coincidences
//!
//! The [`Evaluator`] bundle groups one of each around a shared [`Deck`]; a
//! worker thread owns exactly one bundle.
mod array;
mod deriv;
mod feature;
mod interval;
mod point;

pub use array::ArrayEval;
pub use deriv::DerivEval;
pub use feature::{Feature, FeatureChoice, FeatureEval};
pub use interval::IntervalEval;
pub use point::PointEval;

use crate::{
    error::Error,
    tape::{Deck, Tape},
    types::{Grad, Interval},
};
use nalgebra::Vector3;

/// A complete set of evaluators sharing one tape deck
///
/// Evaluators are thread-local: each worker owns its own `Evaluator` with its
/// own tape stack and clause caches.  Tapes themselves are immutable and
/// shared by reference counting.
pub struct Evaluator {
    pub(crate) deck: Deck,
    interval: IntervalEval,
    point: PointEval,
    array: ArrayEval,
    deriv: DerivEval,
    feature: FeatureEval,
}

impl Evaluator {
    /// Builds a new evaluator bundle rooted at the given tape
    pub fn new(tape: &Tape) -> Self {
        Self {
            deck: Deck::new(tape),
            interval: IntervalEval::default(),
            point: PointEval::default(),
            array: ArrayEval::default(),
            deriv: DerivEval::default(),
            feature: FeatureEval::default(),
        }
    }

    /// Interval evaluation over the box `[lower, upper]` using an explicit
    /// tape
    ///
    /// Returns the root interval and whether it may contain a NaN.
    pub fn eval_interval(
        &mut self,
        tape: &Tape,
        lower: Vector3<f32>,
        upper: Vector3<f32>,
    ) -> (Interval, bool) {
        self.interval.eval_with(tape, &self.deck.vars, lower, upper)
    }

    /// Builds a shortened tape from the most recent interval evaluation
    ///
    /// `tape` must be the same tape passed to [`Self::eval_interval`].
    pub fn push_from_last(&mut self, tape: &Tape) -> Tape {
        let buf = self.deck.take_spare();
        Tape::from_data(tape.simplify(self.interval.choices(), buf))
    }

    /// Interval evaluation on the deck's active tape
    pub fn eval_interval_top(
        &mut self,
        lower: Vector3<f32>,
        upper: Vector3<f32>,
    ) -> (Interval, bool) {
        self.interval
            .eval_with(self.deck.active(), &self.deck.vars, lower, upper)
    }

    /// Shortens the deck's active tape using the most recent interval
    /// evaluation, pushing the result onto the deck
    pub fn push_top(&mut self) {
        let buf = self.deck.take_spare();
        let data = self.deck.active().simplify(self.interval.choices(), buf);
        self.deck.push(Tape::from_data(data));
    }

    /// Pops the most recent pushed tape from the deck
    pub fn pop(&mut self) {
        self.deck.pop();
    }

    /// Single-point evaluation
    pub fn eval_point(&mut self, tape: &Tape, p: Vector3<f32>) -> f32 {
        self.point.eval_with(tape, &self.deck.vars, p.x, p.y, p.z)
    }

    /// Bulk evaluation over many points
    pub fn eval_array(
        &mut self,
        tape: &Tape,
        xs: &[f32],
        ys: &[f32],
        zs: &[f32],
        out: &mut [f32],
    ) -> Result<(), Error> {
        self.array
            .eval_with(tape, &self.deck.vars, xs, ys, zs, out)
    }

    /// Bulk gradient evaluation
    ///
    /// `ambiguous[i]` is set when some min/max clause saw equal operands with
    /// differing gradients at point `i`; callers should resolve such points
    /// through [`Self::features_at`].
    pub fn eval_deriv(
        &mut self,
        tape: &Tape,
        xs: &[f32],
        ys: &[f32],
        zs: &[f32],
        out: &mut [Grad],
        ambiguous: &mut [bool],
    ) -> Result<(), Error> {
        self.deriv
            .eval_with(tape, &self.deck.vars, xs, ys, zs, out, ambiguous)
    }

    /// Enumerates the distinct gradient features at the given position
    pub fn features_at(
        &mut self,
        tape: &Tape,
        p: Vector3<f32>,
    ) -> Vec<Feature> {
        self.feature.features_at(tape, &self.deck.vars, p)
    }

    /// Changes a variable's value by name
    ///
    /// Returns `true` if the value changed.  The new value is seen by every
    /// subsequent evaluation in this bundle, including evaluations of pushed
    /// tapes (which share the base tape's variable numbering).
    pub fn set_var(&mut self, name: &str, value: f32) -> Result<bool, Error> {
        let var = self.deck.var_index(name).ok_or(Error::BadVar)?;
        self.deck.set_var(var, value)
    }

    /// Applies a set of named variable values, skipping unknown names
    pub fn apply_vars(&mut self, vars: &[(String, f32)]) {
        for (name, value) in vars {
            let _ = self.set_var(name, *value);
        }
    }

    /// Returns the deck's active (topmost) tape
    pub fn active_tape(&self) -> &Tape {
        self.deck.active()
    }

    /// Reclaims a tape's clause buffer, if this was the last handle
    pub fn recycle_tape(&mut self, tape: Tape) {
        if let Some(buf) = tape.take() {
            self.deck.give_spare(buf);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Tree;

    #[test]
    fn test_set_var() {
        let x = Tree::x();
        let r = Tree::var("r");
        let shape = x - r;
        let tape = shape.tape().unwrap();
        let mut eval = Evaluator::new(&tape);

        let v = eval.eval_point(&tape.clone(), Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(v, 1.0);

        assert!(eval.set_var("r", 1.0).unwrap());
        assert!(!eval.set_var("r", 1.0).unwrap());
        let tape = eval.active_tape().clone();
        let v = eval.eval_point(&tape, Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(v, 0.0);

        assert!(matches!(eval.set_var("nope", 1.0), Err(Error::BadVar)));
    }
}
