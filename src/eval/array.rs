//! Bulk evaluation over slices of sample positions
use crate::{
    error::Error,
    tape::{Opcode, Tape},
};

/// Bulk evaluator, amortizing tape-walking overhead over many points
///
/// Slot storage is retained between calls so that repeated evaluations (e.g.
/// the per-cell corner checks during octree construction) do not reallocate.
#[derive(Default)]
pub struct ArrayEval {
    slots: Vec<Vec<f32>>,
    slice_size: usize,
}

impl ArrayEval {
    fn prepare(&mut self, tape: &Tape, size: usize) {
        self.slots.resize_with(tape.slot_count(), || {
            vec![f32::NAN; size.max(self.slice_size)]
        });
        if size > self.slice_size {
            for s in self.slots.iter_mut() {
                s.resize(size, f32::NAN);
            }
            self.slice_size = size;
        }
    }

    /// Evaluates the tape at every position in the input slices
    pub fn eval_with(
        &mut self,
        tape: &Tape,
        vars: &[f32],
        xs: &[f32],
        ys: &[f32],
        zs: &[f32],
        out: &mut [f32],
    ) -> Result<(), Error> {
        if xs.len() != ys.len()
            || ys.len() != zs.len()
            || zs.len() != out.len()
        {
            return Err(Error::MismatchedSlices);
        }
        let size = xs.len();
        self.prepare(tape, size);

        for c in tape.clauses().iter().rev() {
            let (a, b) = (c.a as usize, c.b as usize);
            let out_slot = c.out as usize;
            match c.op {
                Opcode::Input => {
                    self.slots[out_slot][0..size].copy_from_slice(match c.a {
                        0 => xs,
                        1 => ys,
                        2 => zs,
                        i => panic!("invalid input axis {i}"),
                    })
                }
                Opcode::Var => self.slots[out_slot][0..size].fill(vars[a]),
                Opcode::Const => {
                    self.slots[out_slot][0..size].fill(tape.constant(c.a))
                }
                _ => {
                    for i in 0..size {
                        let va = self.slots[a][i];
                        let vb = if c.op.arg_count() == 2 {
                            self.slots[b][i]
                        } else {
                            f32::NAN
                        };
                        self.slots[out_slot][i] = match c.op {
                            Opcode::Neg => -va,
                            Opcode::Abs => va.abs(),
                            Opcode::Recip => 1.0 / va,
                            Opcode::Sqrt => va.sqrt(),
                            Opcode::Square => va * va,
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
                            Opcode::Pow => va.powf(vb),
                            Opcode::Less => {
                                if va.is_nan() || vb.is_nan() {
                                    f32::NAN
                                } else {
                                    (va < vb) as u8 as f32
                                }
                            }
                            Opcode::Min => {
                                if va.is_nan() || vb.is_nan() {
                                    f32::NAN
                                } else {
                                    va.min(vb)
                                }
                            }
                            Opcode::Max => {
                                if va.is_nan() || vb.is_nan() {
                                    f32::NAN
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
        out[0..size]
            .copy_from_slice(&self.slots[tape.root() as usize][0..size]);
        Ok(())
    }
}
