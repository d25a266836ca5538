//! Single-point evaluation
use crate::tape::{Opcode, Tape};

/// Pointwise evaluator for a single sample position
#[derive(Default)]
pub struct PointEval {
    slots: Vec<f32>,
}

impl PointEval {
    /// Evaluates the tape at the given position
    pub fn eval_with(
        &mut self,
        tape: &Tape,
        vars: &[f32],
        x: f32,
        y: f32,
        z: f32,
    ) -> f32 {
        self.slots.resize(tape.slot_count(), f32::NAN);
        self.slots.fill(f32::NAN);

        for c in tape.clauses().iter().rev() {
            let (a, b) = (c.a as usize, c.b as usize);
            let v = match c.op {
                Opcode::Input => match c.a {
                    0 => x,
                    1 => y,
                    2 => z,
                    i => panic!("invalid input axis {i}"),
                },
                Opcode::Var => vars[a],
                Opcode::Const => tape.constant(c.a),

                Opcode::Neg => -self.slots[a],
                Opcode::Abs => self.slots[a].abs(),
                Opcode::Recip => 1.0 / self.slots[a],
                Opcode::Sqrt => self.slots[a].sqrt(),
                Opcode::Square => self.slots[a] * self.slots[a],
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
                Opcode::Pow => self.slots[a].powf(self.slots[b]),
                Opcode::Less => {
                    if self.slots[a].is_nan() || self.slots[b].is_nan() {
                        f32::NAN
                    } else {
                        (self.slots[a] < self.slots[b]) as u8 as f32
                    }
                }
                // Unlike f32::min/max, these are NaN if *either* input is
                // NaN
                Opcode::Min => {
                    if self.slots[a].is_nan() || self.slots[b].is_nan() {
                        f32::NAN
                    } else {
                        self.slots[a].min(self.slots[b])
                    }
                }
                Opcode::Max => {
                    if self.slots[a].is_nan() || self.slots[b].is_nan() {
                        f32::NAN
                    } else {
                        self.slots[a].max(self.slots[b])
                    }
                }
            };
            self.slots[c.out as usize] = v;
        }
        self.slots[tape.root() as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Tree;

    #[test]
    fn test_point_eval() {
        let (x, y, z) = Tree::axes();
        let sphere = (x.square() + y.square() + z.square()).sqrt() - 1.0;
        let tape = sphere.tape().unwrap();
        let mut e = PointEval::default();
        assert_eq!(e.eval_with(&tape, &[], 0.0, 0.0, 0.0), -1.0);
        assert_eq!(e.eval_with(&tape, &[], 2.0, 0.0, 0.0), 1.0);
        assert!(e.eval_with(&tape, &[], 1.0, 0.0, 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_min_nan() {
        let f = Tree::x().sqrt().min(Tree::y());
        let tape = f.tape().unwrap();
        let mut e = PointEval::default();
        assert!(e.eval_with(&tape, &[], -1.0, 1.0, 0.0).is_nan());
        assert_eq!(e.eval_with(&tape, &[], 4.0, 1.0, 0.0), 1.0);
    }
}
