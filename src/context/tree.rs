//! Free-floating expression sugar
//!
//! A [`Tree`] is a reference-counted expression with overloaded operators,
//! convenient for building up shapes before importing them into a
//! [`Context`](super::Context).  Unlike `Context` nodes, trees are not
//! deduplicated; two calls to [`Tree::x`] produce two distinct objects.
use super::{BinaryOpcode, Context, UnaryOpcode};
use crate::{error::Error, tape::Tape};
use std::sync::Arc;

/// Operation at a single tree node
#[allow(missing_docs)]
#[derive(Debug)]
pub enum TreeOp {
    Input(u8),
    Const(f64),
    Var(String),
    Unary(UnaryOpcode, Tree),
    Binary(BinaryOpcode, Tree, Tree),
}

/// A free-floating math expression
#[derive(Clone, Debug)]
pub struct Tree(Arc<TreeOp>);

impl Tree {
    pub(crate) fn op(&self) -> &TreeOp {
        &self.0
    }

    pub(crate) fn as_ptr(&self) -> *const TreeOp {
        Arc::as_ptr(&self.0)
    }

    fn from_op(op: TreeOp) -> Self {
        Self(Arc::new(op))
    }

    /// Returns the `x` coordinate input
    pub fn x() -> Self {
        Self::from_op(TreeOp::Input(0))
    }

    /// Returns the `y` coordinate input
    pub fn y() -> Self {
        Self::from_op(TreeOp::Input(1))
    }

    /// Returns the `z` coordinate input
    pub fn z() -> Self {
        Self::from_op(TreeOp::Input(2))
    }

    /// Returns all three coordinate inputs
    pub fn axes() -> (Self, Self, Self) {
        (Self::x(), Self::y(), Self::z())
    }

    /// Builds a constant
    pub fn constant(f: f64) -> Self {
        Self::from_op(TreeOp::Const(f))
    }

    /// Builds a named user variable
    pub fn var(name: &str) -> Self {
        Self::from_op(TreeOp::Var(name.to_owned()))
    }

    fn unary(op: UnaryOpcode, a: &Tree) -> Self {
        Self::from_op(TreeOp::Unary(op, a.clone()))
    }

    fn binary(op: BinaryOpcode, a: &Tree, b: &Tree) -> Self {
        Self::from_op(TreeOp::Binary(op, a.clone(), b.clone()))
    }

    /// Absolute value
    pub fn abs(&self) -> Self {
        Self::unary(UnaryOpcode::Abs, self)
    }

    /// Reciprocal
    pub fn recip(&self) -> Self {
        Self::unary(UnaryOpcode::Recip, self)
    }

    /// Square root
    pub fn sqrt(&self) -> Self {
        Self::unary(UnaryOpcode::Sqrt, self)
    }

    /// Squaring
    pub fn square(&self) -> Self {
        Self::unary(UnaryOpcode::Square, self)
    }

    /// Exponential function
    pub fn exp(&self) -> Self {
        Self::unary(UnaryOpcode::Exp, self)
    }

    /// Natural log
    pub fn ln(&self) -> Self {
        Self::unary(UnaryOpcode::Ln, self)
    }

    /// Sine
    pub fn sin(&self) -> Self {
        Self::unary(UnaryOpcode::Sin, self)
    }

    /// Cosine
    pub fn cos(&self) -> Self {
        Self::unary(UnaryOpcode::Cos, self)
    }

    /// Tangent
    pub fn tan(&self) -> Self {
        Self::unary(UnaryOpcode::Tan, self)
    }

    /// Arcsine
    pub fn asin(&self) -> Self {
        Self::unary(UnaryOpcode::Asin, self)
    }

    /// Arccosine
    pub fn acos(&self) -> Self {
        Self::unary(UnaryOpcode::Acos, self)
    }

    /// Arctangent
    pub fn atan(&self) -> Self {
        Self::unary(UnaryOpcode::Atan, self)
    }

    /// Minimum of two expressions (CSG union of distance fields)
    pub fn min<T: Into<Tree>>(&self, other: T) -> Self {
        Self::binary(BinaryOpcode::Min, self, &other.into())
    }

    /// Maximum of two expressions (CSG intersection of distance fields)
    pub fn max<T: Into<Tree>>(&self, other: T) -> Self {
        Self::binary(BinaryOpcode::Max, self, &other.into())
    }

    /// Four-quadrant arctangent, with `self` as `y`
    pub fn atan2<T: Into<Tree>>(&self, x: T) -> Self {
        Self::binary(BinaryOpcode::Atan2, self, &x.into())
    }

    /// Power function
    pub fn pow<T: Into<Tree>>(&self, exp: T) -> Self {
        Self::binary(BinaryOpcode::Pow, self, &exp.into())
    }

    /// Strict less-than comparison (1 if true, 0 otherwise)
    pub fn less<T: Into<Tree>>(&self, other: T) -> Self {
        Self::binary(BinaryOpcode::Less, self, &other.into())
    }

    /// Lowers this tree to a tape in a fresh [`Context`]
    pub fn tape(&self) -> Result<Tape, Error> {
        let mut ctx = Context::new();
        let root = ctx.import(self);
        ctx.tape(root)
    }
}

impl From<f64> for Tree {
    fn from(f: f64) -> Self {
        Tree::constant(f)
    }
}

impl From<f32> for Tree {
    fn from(f: f32) -> Self {
        Tree::constant(f as f64)
    }
}

macro_rules! impl_tree_binary {
    ($trait:ident, $fn:ident, $op:expr) => {
        impl<T: Into<Tree>> std::ops::$trait<T> for Tree {
            type Output = Tree;
            fn $fn(self, rhs: T) -> Tree {
                Tree::binary($op, &self, &rhs.into())
            }
        }
        impl std::ops::$trait<Tree> for f64 {
            type Output = Tree;
            fn $fn(self, rhs: Tree) -> Tree {
                Tree::binary($op, &Tree::constant(self), &rhs)
            }
        }
    };
}

impl_tree_binary!(Add, add, BinaryOpcode::Add);
impl_tree_binary!(Sub, sub, BinaryOpcode::Sub);
impl_tree_binary!(Mul, mul, BinaryOpcode::Mul);
impl_tree_binary!(Div, div, BinaryOpcode::Div);

impl std::ops::Neg for Tree {
    type Output = Tree;
    fn neg(self) -> Tree {
        Tree::unary(UnaryOpcode::Neg, &self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tree_import() {
        let (x, y, z) = Tree::axes();
        let sphere = (x.square() + y.square() + z.square()).sqrt() - 1.0;
        let tape = sphere.tape().unwrap();
        // x, y, z, 3 squares, 2 adds, sqrt, const, sub
        assert_eq!(tape.len(), 11);
    }

    #[test]
    fn test_shared_subtree() {
        let x = Tree::x();
        let sum = x.clone() + x.clone();
        let mut ctx = Context::new();
        let n = ctx.import(&sum);
        assert!(ctx.get_op(n).is_some());
        // The shared `x` should only be imported once
        assert_eq!(ctx.len(), 2);
    }
}
