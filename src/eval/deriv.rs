//! Bulk forward-mode gradient evaluation
use crate::{
    error::Error,
    tape::{Opcode, Tape},
    types::Grad,
};

/// Bulk gradient evaluator
///
/// Produces the value and partial derivatives at each sample position.  At a
/// `min` / `max` clause whose operands coincide in value but not in gradient,
/// the derivative is multi-valued; such samples are flagged as ambiguous so
/// that callers can resolve them through
/// [`FeatureEval`](crate::eval::FeatureEval).
#[derive(Default)]
pub struct DerivEval {
    slots: Vec<Vec<Grad>>,
    slice_size: usize,
}

impl DerivEval {
    fn prepare(&mut self, tape: &Tape, size: usize) {
        self.slots.resize_with(tape.slot_count(), || {
            vec![Grad::from(f32::NAN); size.max(self.slice_size)]
        });
        if size > self.slice_size {
            for s in self.slots.iter_mut() {
                s.resize(size, Grad::from(f32::NAN));
            }
            self.slice_size = size;
        }
    }

    /// Evaluates gradients at every position in the input slices
    ///
    /// `ambiguous` must be the same length as the positions; entries are set
    /// to `true` (never cleared) when a min/max coincidence is found.
    pub fn eval_with(
        &mut self,
        tape: &Tape,
        vars: &[f32],
        xs: &[f32],
        ys: &[f32],
        zs: &[f32],
        out: &mut [Grad],
        ambiguous: &mut [bool],
    ) -> Result<(), Error> {
        if xs.len() != ys.len()
            || ys.len() != zs.len()
            || zs.len() != out.len()
            || out.len() != ambiguous.len()
        {
            return Err(Error::MismatchedSlices);
        }
        let size = xs.len();
        self.prepare(tape, size);
        ambiguous.fill(false);

        for c in tape.clauses().iter().rev() {
            let (a, b) = (c.a as usize, c.b as usize);
            let out_slot = c.out as usize;
            match c.op {
                Opcode::Input => {
                    for i in 0..size {
                        self.slots[out_slot][i] = match c.a {
                            0 => Grad::new(xs[i], 1.0, 0.0, 0.0),
                            1 => Grad::new(ys[i], 0.0, 1.0, 0.0),
                            2 => Grad::new(zs[i], 0.0, 0.0, 1.0),
                            i => panic!("invalid input axis {i}"),
                        }
                    }
                }
                Opcode::Var => {
                    self.slots[out_slot][0..size].fill(vars[a].into())
                }
                Opcode::Const => self.slots[out_slot][0..size]
                    .fill(tape.constant(c.a).into()),
                _ => {
                    for i in 0..size {
                        let va = self.slots[a][i];
                        let vb = if c.op.arg_count() == 2 {
                            self.slots[b][i]
                        } else {
                            Grad::from(f32::NAN)
                        };
                        self.slots[out_slot][i] = match c.op {
                            Opcode::Neg => -va,
                            Opcode::Abs => va.abs(),
                            Opcode::Recip => va.recip(),
                            Opcode::Sqrt => va.sqrt(),
                            Opcode::Square => va.square(),
                            Opcode::Exp => va.exp(),
                            Opcode::Ln => va.ln(),
                            Opcode::Sin => va.sin(),
                            Opcode::Cos => va.cos(),
                            Opcode::Tan => va.tan(),
                            Opcode::Asin => va.asin(),
                            Opcode::Acos => va.acos(),
                            Opcode::Atan => va.atan(),
                            Opcode::Add => va + vb,
                            Opcode::Sub => va - vb,
                            Opcode::Mul => va * vb,
                            Opcode::Div => va / vb,
                            Opcode::Atan2 => va.atan2(vb),
                            Opcode::Pow => va.pow(vb),
                            Opcode::Less => va.less(vb),
                            Opcode::Min | Opcode::Max => {
                                if va.v == vb.v && va.deriv() != vb.deriv() {
                                    ambiguous[i] = true;
                                }
                                if c.op == Opcode::Min {
                                    va.min(vb)
                                } else {
                                    va.max(vb)
                                }
                            }
                            Opcode::Input | Opcode::Var | Opcode::Const => {
                                unreachable!()
                            }
                        };
                    }
                }
            }
        }
        out.copy_from_slice(&self.slots[tape.root() as usize][0..size]);
        Ok(())
    }
}
