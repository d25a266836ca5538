//! Flattened expression programs and region-specialized shortening
//!
//! A [`Tape`] is an immutable, shareable clause stream lowered from a
//! [`Context`](crate::context::Context).  Clauses are stored root-first and
//! evaluated back-to-front, so each clause's operands are written before the
//! clause itself is reached.
//!
//! Interval evaluation over a region records a [`Choice`] for every `min` and
//! `max` clause; [`TapeData::simplify`] then builds a shortened tape in which
//! decided clauses become pass-throughs and unreachable clauses are dropped.
//! Shortened tapes are pointwise equal to their parent on the region used to
//! build them, and stack up in a per-evaluator [`Deck`].
use crate::error::Error;
use std::{collections::HashMap, sync::Arc};

/// Index of a clause's output slot within a tape
pub type Id = u32;

/// Marker for an unused operand slot
pub const UNUSED: Id = Id::MAX;

/// Records which side of a `min` or `max` clause was active during interval
/// evaluation
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Choice {
    /// The clause has not been evaluated
    #[default]
    Unknown,
    /// Only the left-hand argument can be chosen on this region
    Left,
    /// Only the right-hand argument can be chosen on this region
    Right,
    /// Either argument may be chosen
    Both,
}

/// Operation performed by a single clause
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Opcode {
    /// Reads one of the input axes (`a` is 0 = x, 1 = y, 2 = z)
    Input,
    /// Reads a user variable (`a` indexes the tape's variable table)
    Var,
    /// Loads a constant (`a` indexes the tape's constant table)
    Const,

    Neg,
    Abs,
    Recip,
    Sqrt,
    Square,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,

    Add,
    Sub,
    Mul,
    Div,
    Atan2,
    Pow,
    Less,
    Min,
    Max,
}

impl Opcode {
    /// Returns the number of value operands (0, 1, or 2)
    ///
    /// `Input`, `Var`, and `Const` use `a` as an index rather than a value
    /// operand, so they report 0 here.
    pub fn arg_count(&self) -> usize {
        match self {
            Opcode::Input | Opcode::Var | Opcode::Const => 0,
            Opcode::Neg
            | Opcode::Abs
            | Opcode::Recip
            | Opcode::Sqrt
            | Opcode::Square
            | Opcode::Exp
            | Opcode::Ln
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Tan
            | Opcode::Asin
            | Opcode::Acos
            | Opcode::Atan => 1,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Atan2
            | Opcode::Pow
            | Opcode::Less
            | Opcode::Min
            | Opcode::Max => 2,
        }
    }
}

/// A single operation in a tape
///
/// `out` is the destination slot; `a` and `b` index earlier slots (or carry
/// table indices for `Input` / `Var` / `Const`), with [`UNUSED`] as the
/// sentinel for absent operands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Clause {
    pub op: Opcode,
    pub out: Id,
    pub a: Id,
    pub b: Id,
}

impl Clause {
    pub(crate) fn unary(op: Opcode, out: Id, a: Id) -> Self {
        Self {
            op,
            out,
            a,
            b: UNUSED,
        }
    }

    pub(crate) fn binary(op: Opcode, out: Id, a: Id, b: Id) -> Self {
        Self { op, out, a, b }
    }
}

/// Variable table shared by a tape and everything pushed from it
///
/// Maps variable names to indices in the evaluators' value arrays.
#[derive(Debug, Default)]
pub struct VarMap {
    names: Vec<String>,
    map: HashMap<String, u32>,
}

impl VarMap {
    pub(crate) fn insert(&mut self, name: &str) -> u32 {
        if let Some(&i) = self.map.get(name) {
            i
        } else {
            let i = self.names.len() as u32;
            self.names.push(name.to_owned());
            self.map.insert(name.to_owned(), i);
            i
        }
    }

    /// Looks up a variable index by name
    pub fn get(&self, name: &str) -> Option<u32> {
        self.map.get(name).copied()
    }

    /// Number of variables in the table
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Checks whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Flat clause program, stored root-first
///
/// This is typically wrapped in a [`Tape`] for shared ownership.
#[derive(Debug)]
pub struct TapeData {
    /// Clauses in reverse evaluation order: the root clause is first, and
    /// every clause appears before the clauses producing its operands
    clauses: Vec<Clause>,

    /// Output slot of the root clause
    root: Id,

    /// Number of slots used by the *base* tape
    ///
    /// Shortened tapes keep their parent's slot numbering, so this does not
    /// shrink when clauses are dropped; evaluator scratch memory is sized
    /// once per deck.
    slot_count: usize,

    /// Constant table, shared with shortened tapes
    consts: Arc<Vec<f32>>,

    /// Variable table, shared with shortened tapes
    vars: Arc<VarMap>,
}

impl TapeData {
    pub(crate) fn new(
        clauses: Vec<Clause>,
        root: Id,
        slot_count: usize,
        consts: Arc<Vec<f32>>,
        vars: Arc<VarMap>,
    ) -> Self {
        Self {
            clauses,
            root,
            slot_count,
            consts,
            vars,
        }
    }

    /// Returns the clause list (root-first)
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Returns the number of clauses in this tape
    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// Checks whether the tape contains any clauses
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Returns the root clause's output slot
    pub fn root(&self) -> Id {
        self.root
    }

    /// Returns the slot count of the base tape
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Looks up a constant by table index
    pub fn constant(&self, i: Id) -> f32 {
        self.consts[i as usize]
    }

    /// Returns the variable table
    pub fn vars(&self) -> &VarMap {
        &self.vars
    }

    /// Number of user variables read by the base tape
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Builds a shortened tape from a set of recorded choices
    ///
    /// `choices` must be aligned with this tape's clause list (one entry per
    /// clause).  Decided `min` / `max` clauses are replaced by pass-throughs
    /// to the surviving operand, and clauses that become unreachable from the
    /// root are dropped.  `buf` is recycled as the new tape's clause storage.
    ///
    /// On the region whose interval evaluation produced `choices`, the result
    /// is pointwise equal to this tape.
    pub fn simplify(&self, choices: &[Choice], mut buf: Vec<Clause>) -> Self {
        assert_eq!(choices.len(), self.clauses.len());
        buf.clear();

        let mut active = vec![false; self.slot_count];
        let mut remap: Vec<Id> = (0..self.slot_count as Id).collect();
        active[self.root as usize] = true;

        // First pass: walking from the root, mark live operands and record
        // pass-throughs for decided min/max clauses.
        for (c, &choice) in self.clauses.iter().zip(choices) {
            if !active[c.out as usize] {
                continue;
            }
            match (c.op, choice) {
                (Opcode::Min | Opcode::Max, Choice::Left) => {
                    remap[c.out as usize] = c.a;
                    active[c.a as usize] = true;
                }
                (Opcode::Min | Opcode::Max, Choice::Right) => {
                    remap[c.out as usize] = c.b;
                    active[c.b as usize] = true;
                }
                _ => match c.op.arg_count() {
                    0 => (),
                    1 => active[c.a as usize] = true,
                    _ => {
                        active[c.a as usize] = true;
                        active[c.b as usize] = true;
                    }
                },
            }
        }

        let resolve = |mut i: Id| {
            while remap[i as usize] != i {
                i = remap[i as usize];
            }
            i
        };

        // Second pass: emit surviving clauses with operands remapped through
        // pass-through chains.
        for c in &self.clauses {
            if !active[c.out as usize] || remap[c.out as usize] != c.out {
                continue;
            }
            let mut c = *c;
            match c.op.arg_count() {
                0 => (),
                1 => c.a = resolve(c.a),
                _ => {
                    c.a = resolve(c.a);
                    c.b = resolve(c.b);
                }
            }
            buf.push(c);
        }

        TapeData {
            clauses: buf,
            root: resolve(self.root),
            slot_count: self.slot_count,
            consts: self.consts.clone(),
            vars: self.vars.clone(),
        }
    }
}

/// Shared handle to an immutable [`TapeData`]
#[derive(Clone, Debug)]
pub struct Tape(Arc<TapeData>);

impl Tape {
    pub(crate) fn from_data(data: TapeData) -> Self {
        Self(Arc::new(data))
    }

    /// Attempts to reclaim the clause buffer, if this is the last handle
    pub(crate) fn take(self) -> Option<Vec<Clause>> {
        Arc::try_unwrap(self.0).ok().map(|data| data.clauses)
    }
}

impl std::ops::Deref for Tape {
    type Target = TapeData;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Per-evaluator stack of tapes, plus recycled storage and variable values
///
/// The base tape sits at the bottom; [`Deck::push`] publishes a shortened
/// tape for a region and [`Deck::pop`] releases it, reclaiming its clause
/// buffer when possible.  A deck is owned by a single evaluator and never
/// shared across workers.
#[derive(Debug)]
pub struct Deck {
    base: Tape,
    stack: Vec<Tape>,

    /// Spare clause buffers, recycled between pushes
    spares: Vec<Vec<Clause>>,

    /// Current values for user variables, indexed per the tape's [`VarMap`]
    pub(crate) vars: Vec<f32>,
}

impl Deck {
    /// Builds a new deck rooted at the given tape
    pub fn new(tape: &Tape) -> Self {
        Self {
            vars: vec![0.0; tape.var_count()],
            base: tape.clone(),
            stack: vec![],
            spares: vec![],
        }
    }

    /// Returns the tape at the top of the stack
    pub fn active(&self) -> &Tape {
        self.stack.last().unwrap_or(&self.base)
    }

    /// Returns the base (unshortened) tape
    pub fn base(&self) -> &Tape {
        &self.base
    }

    /// Current stack depth (0 = only the base tape)
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Pushes a shortened tape onto the stack
    pub fn push(&mut self, tape: Tape) {
        self.stack.push(tape);
    }

    /// Pops the most recent pushed tape, restoring its parent
    ///
    /// Does nothing if only the base tape remains.
    pub fn pop(&mut self) {
        if let Some(t) = self.stack.pop() {
            if let Some(buf) = t.take() {
                self.spares.push(buf);
            }
        }
    }

    /// Takes a spare clause buffer, or allocates a fresh one
    pub(crate) fn take_spare(&mut self) -> Vec<Clause> {
        self.spares.pop().unwrap_or_default()
    }

    /// Returns a spare clause buffer for reuse
    pub(crate) fn give_spare(&mut self, buf: Vec<Clause>) {
        self.spares.push(buf);
    }

    /// Changes a variable's value, returning `true` if the value changed
    pub fn set_var(&mut self, var: u32, value: f32) -> Result<bool, Error> {
        let slot = self
            .vars
            .get_mut(var as usize)
            .ok_or(Error::BadVar)?;
        let changed = *slot != value;
        *slot = value;
        Ok(changed)
    }

    /// Looks up a variable index by name
    pub fn var_index(&self, name: &str) -> Option<u32> {
        self.base.vars().get(name)
    }
}
