//! Deduplicated expression storage and lowering to tapes
//!
//! A [`Context`] is an arena of unique expression nodes, addressed by
//! [`Node`] handles.  It is the front end consumed by the meshing pipeline:
//! expressions are built up (directly, or through the free-floating [`Tree`]
//! sugar), then lowered to a [`Tape`] with [`Context::tape`].
mod tree;

pub use tree::{Tree, TreeOp};

use crate::{
    error::Error,
    tape::{Clause, Opcode, Tape, TapeData, VarMap},
};
use ordered_float::OrderedFloat;
use std::{collections::HashMap, sync::Arc};

/// A handle to an expression node stored in a [`Context`]
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Node(usize);

/// Single-argument opcodes
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum UnaryOpcode {
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
}

/// Two-argument opcodes
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum BinaryOpcode {
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

/// An expression operation, parameterized by child [`Node`] handles
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Op {
    /// Coordinate input (0 = x, 1 = y, 2 = z)
    Input(u8),
    /// Named user variable
    Var(String),
    /// Floating-point constant
    Const(OrderedFloat<f64>),
    /// Single-argument operation
    Unary(UnaryOpcode, Node),
    /// Two-argument operation
    Binary(BinaryOpcode, Node, Node),
}

/// A `Context` holds a set of deduplicated constants, variables, and
/// operations.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// all of its contents when dropped.
#[derive(Debug, Default)]
pub struct Context {
    ops: Vec<Op>,
    map: HashMap<Op, Node>,
}

impl Context {
    /// Builds a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of nodes in the context
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Looks up the operation for the given node
    pub fn get_op(&self, node: Node) -> Option<&Op> {
        self.ops.get(node.0)
    }

    fn push_op(&mut self, op: Op) -> Node {
        if let Some(&n) = self.map.get(&op) {
            n
        } else {
            let n = Node(self.ops.len());
            self.ops.push(op.clone());
            self.map.insert(op, n);
            n
        }
    }

    fn check(&self, node: Node) -> Result<Node, Error> {
        if node.0 < self.ops.len() {
            Ok(node)
        } else {
            Err(Error::BadNode)
        }
    }

    /// Constructs or finds the `x` axis node
    pub fn x(&mut self) -> Node {
        self.push_op(Op::Input(0))
    }

    /// Constructs or finds the `y` axis node
    pub fn y(&mut self) -> Node {
        self.push_op(Op::Input(1))
    }

    /// Constructs or finds the `z` axis node
    pub fn z(&mut self) -> Node {
        self.push_op(Op::Input(2))
    }

    /// Returns the `(x, y, z)` axis nodes
    pub fn axes(&mut self) -> (Node, Node, Node) {
        (self.x(), self.y(), self.z())
    }

    /// Constructs or finds a constant node
    pub fn constant(&mut self, f: f64) -> Node {
        self.push_op(Op::Const(OrderedFloat(f)))
    }

    /// Constructs or finds a named variable node
    ///
    /// Names matching the coordinate axes are rejected.
    pub fn var(&mut self, name: &str) -> Result<Node, Error> {
        if matches!(name, "x" | "y" | "z" | "X" | "Y" | "Z") {
            return Err(Error::ReservedName);
        }
        Ok(self.push_op(Op::Var(name.to_owned())))
    }

    /// Builds a unary operation node
    pub fn op_unary(
        &mut self,
        op: UnaryOpcode,
        a: Node,
    ) -> Result<Node, Error> {
        let a = self.check(a)?;
        Ok(self.push_op(Op::Unary(op, a)))
    }

    /// Builds a binary operation node
    pub fn op_binary(
        &mut self,
        op: BinaryOpcode,
        a: Node,
        b: Node,
    ) -> Result<Node, Error> {
        let a = self.check(a)?;
        let b = self.check(b)?;
        Ok(self.push_op(Op::Binary(op, a, b)))
    }

    /// Imports a free-floating [`Tree`] into this context
    ///
    /// Shared subtrees (by pointer identity) are imported once.
    pub fn import(&mut self, tree: &Tree) -> Node {
        let mut seen: HashMap<*const TreeOp, Node> = HashMap::new();
        self.import_inner(tree, &mut seen)
    }

    fn import_inner(
        &mut self,
        tree: &Tree,
        seen: &mut HashMap<*const TreeOp, Node>,
    ) -> Node {
        let key = tree.as_ptr();
        if let Some(&n) = seen.get(&key) {
            return n;
        }
        let n = match tree.op() {
            TreeOp::Input(i) => self.push_op(Op::Input(*i)),
            TreeOp::Const(f) => self.constant(*f),
            TreeOp::Var(name) => self.push_op(Op::Var(name.clone())),
            TreeOp::Unary(op, a) => {
                let a = self.import_inner(a, seen);
                self.push_op(Op::Unary(*op, a))
            }
            TreeOp::Binary(op, a, b) => {
                let a = self.import_inner(a, seen);
                let b = self.import_inner(b, seen);
                self.push_op(Op::Binary(*op, a, b))
            }
        };
        seen.insert(key, n);
        n
    }

    /// Lowers the expression rooted at `root` into a flat clause program
    ///
    /// Clauses are emitted root-first (reverse evaluation order), with one
    /// slot per reachable node.
    pub fn tape(&self, root: Node) -> Result<Tape, Error> {
        if self.is_empty() {
            return Err(Error::EmptyContext);
        }
        self.check(root)?;

        // Iterative post-order traversal, so that every node lands after the
        // nodes it depends on.
        let mut order = vec![];
        let mut seen = vec![false; self.ops.len()];
        let mut stack = vec![(root, false)];
        while let Some((n, processed)) = stack.pop() {
            if processed {
                order.push(n);
                continue;
            }
            if seen[n.0] {
                continue;
            }
            seen[n.0] = true;
            stack.push((n, true));
            match &self.ops[n.0] {
                Op::Input(..) | Op::Var(..) | Op::Const(..) => (),
                Op::Unary(_, a) => {
                    if !seen[a.0] {
                        stack.push((*a, false));
                    }
                }
                Op::Binary(_, a, b) => {
                    if !seen[a.0] {
                        stack.push((*a, false));
                    }
                    if !seen[b.0] {
                        stack.push((*b, false));
                    }
                }
            }
        }

        let mut slots: HashMap<Node, u32> = HashMap::new();
        for (i, n) in order.iter().enumerate() {
            slots.insert(*n, i as u32);
        }

        let mut consts = vec![];
        let mut vars = VarMap::default();
        let mut clauses = Vec::with_capacity(order.len());
        for n in &order {
            let out = slots[n];
            let c = match &self.ops[n.0] {
                Op::Input(i) => {
                    Clause::unary(Opcode::Input, out, *i as u32)
                }
                Op::Var(name) => {
                    let v = vars.insert(name);
                    Clause::unary(Opcode::Var, out, v)
                }
                Op::Const(f) => {
                    let i = consts.len() as u32;
                    consts.push(f.0 as f32);
                    Clause::unary(Opcode::Const, out, i)
                }
                Op::Unary(op, a) => {
                    let op = match op {
                        UnaryOpcode::Neg => Opcode::Neg,
                        UnaryOpcode::Abs => Opcode::Abs,
                        UnaryOpcode::Recip => Opcode::Recip,
                        UnaryOpcode::Sqrt => Opcode::Sqrt,
                        UnaryOpcode::Square => Opcode::Square,
                        UnaryOpcode::Exp => Opcode::Exp,
                        UnaryOpcode::Ln => Opcode::Ln,
                        UnaryOpcode::Sin => Opcode::Sin,
                        UnaryOpcode::Cos => Opcode::Cos,
                        UnaryOpcode::Tan => Opcode::Tan,
                        UnaryOpcode::Asin => Opcode::Asin,
                        UnaryOpcode::Acos => Opcode::Acos,
                        UnaryOpcode::Atan => Opcode::Atan,
                    };
                    Clause::unary(op, out, slots[a])
                }
                Op::Binary(op, a, b) => {
                    let op = match op {
                        BinaryOpcode::Add => Opcode::Add,
                        BinaryOpcode::Sub => Opcode::Sub,
                        BinaryOpcode::Mul => Opcode::Mul,
                        BinaryOpcode::Div => Opcode::Div,
                        BinaryOpcode::Atan2 => Opcode::Atan2,
                        BinaryOpcode::Pow => Opcode::Pow,
                        BinaryOpcode::Less => Opcode::Less,
                        BinaryOpcode::Min => Opcode::Min,
                        BinaryOpcode::Max => Opcode::Max,
                    };
                    Clause::binary(op, out, slots[a], slots[b])
                }
            };
            clauses.push(c);
        }
        clauses.reverse();

        let root_id = slots[&root];
        Ok(Tape::from_data(TapeData::new(
            clauses,
            root_id,
            order.len(),
            Arc::new(consts),
            Arc::new(vars),
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dedup() {
        let mut ctx = Context::new();
        let x1 = ctx.x();
        let x2 = ctx.x();
        assert_eq!(x1, x2);

        let a = ctx.op_binary(BinaryOpcode::Add, x1, x2).unwrap();
        let b = ctx.op_binary(BinaryOpcode::Add, x2, x1).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_bad_node() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut other = Context::new();
        let y = other.y();
        let far = Node(100);
        assert!(matches!(
            ctx.op_binary(BinaryOpcode::Add, x, far),
            Err(Error::BadNode)
        ));
        // A node from another context happens to be in range here, so this
        // is not detectable; just check that in-range nodes are accepted
        assert!(ctx.op_binary(BinaryOpcode::Add, x, y).is_ok());
    }

    #[test]
    fn test_reserved_var() {
        let mut ctx = Context::new();
        assert!(matches!(ctx.var("x"), Err(Error::ReservedName)));
        assert!(ctx.var("radius").is_ok());
    }

    #[test]
    fn test_tape_order() {
        let mut ctx = Context::new();
        let (x, y, _) = ctx.axes();
        let sum = ctx.op_binary(BinaryOpcode::Add, x, y).unwrap();
        let tape = ctx.tape(sum).unwrap();

        assert_eq!(tape.len(), 3);
        assert_eq!(tape.slot_count(), 3);

        // Root-first ordering: the root clause must come before its operands
        assert_eq!(tape.clauses()[0].out, tape.root());
        assert_eq!(tape.clauses()[0].op, Opcode::Add);

        // Operands must be written before the clauses that consume them,
        // walking in evaluation (reverse) order
        let mut written = vec![false; tape.slot_count()];
        for c in tape.clauses().iter().rev() {
            if c.op.arg_count() >= 1 {
                assert!(written[c.a as usize]);
            }
            if c.op.arg_count() == 2 {
                assert!(written[c.b as usize]);
            }
            written[c.out as usize] = true;
        }
        assert!(written[tape.root() as usize]);
    }
}
