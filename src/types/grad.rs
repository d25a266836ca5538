/// A scalar field sample with associated partial derivatives
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Grad {
    /// Value of the distance field at this point
    pub v: f32,
    /// Partial derivative with respect to `x`
    pub dx: f32,
    /// Partial derivative with respect to `y`
    pub dy: f32,
    /// Partial derivative with respect to `z`
    pub dz: f32,
}

impl std::fmt::Display for Grad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self.v, self.dx, self.dy, self.dz)
    }
}

impl Grad {
    /// Constructs a new gradient
    pub fn new(v: f32, dx: f32, dy: f32, dz: f32) -> Self {
        Self { v, dx, dy, dz }
    }

    /// Returns the derivative terms as a (non-normalized) 3-vector
    pub fn deriv(&self) -> nalgebra::Vector3<f32> {
        nalgebra::Vector3::new(self.dx, self.dy, self.dz)
    }

    /// Absolute value
    pub fn abs(self) -> Self {
        if self.v < 0.0 {
            -self
        } else {
            self
        }
    }

    /// Square root
    pub fn sqrt(self) -> Self {
        let v = self.v.sqrt();
        Grad {
            v,
            dx: self.dx / (2.0 * v),
            dy: self.dy / (2.0 * v),
            dz: self.dz / (2.0 * v),
        }
    }

    /// Squaring, with a tighter derivative than generic multiplication
    pub fn square(self) -> Self {
        Grad {
            v: self.v * self.v,
            dx: 2.0 * self.v * self.dx,
            dy: 2.0 * self.v * self.dy,
            dz: 2.0 * self.v * self.dz,
        }
    }

    /// Sine
    pub fn sin(self) -> Self {
        let c = self.v.cos();
        Grad {
            v: self.v.sin(),
            dx: self.dx * c,
            dy: self.dy * c,
            dz: self.dz * c,
        }
    }

    /// Cosine
    pub fn cos(self) -> Self {
        let s = -self.v.sin();
        Grad {
            v: self.v.cos(),
            dx: self.dx * s,
            dy: self.dy * s,
            dz: self.dz * s,
        }
    }

    /// Tangent
    pub fn tan(self) -> Self {
        let c = self.v.cos().powi(2);
        Grad {
            v: self.v.tan(),
            dx: self.dx / c,
            dy: self.dy / c,
            dz: self.dz / c,
        }
    }

    /// Arcsin
    pub fn asin(self) -> Self {
        let r = (1.0 - self.v.powi(2)).sqrt();
        Grad {
            v: self.v.asin(),
            dx: self.dx / r,
            dy: self.dy / r,
            dz: self.dz / r,
        }
    }

    /// Arccos
    pub fn acos(self) -> Self {
        let r = (1.0 - self.v.powi(2)).sqrt();
        Grad {
            v: self.v.acos(),
            dx: -self.dx / r,
            dy: -self.dy / r,
            dz: -self.dz / r,
        }
    }

    /// Arctangent
    pub fn atan(self) -> Self {
        let r = self.v.powi(2) + 1.0;
        Grad {
            v: self.v.atan(),
            dx: self.dx / r,
            dy: self.dy / r,
            dz: self.dz / r,
        }
    }

    /// Exponential function
    pub fn exp(self) -> Self {
        let v = self.v.exp();
        Grad {
            v,
            dx: v * self.dx,
            dy: v * self.dy,
            dz: v * self.dz,
        }
    }

    /// Natural log
    pub fn ln(self) -> Self {
        Grad {
            v: self.v.ln(),
            dx: self.dx / self.v,
            dy: self.dy / self.v,
            dz: self.dz / self.v,
        }
    }

    /// Reciprocal
    pub fn recip(self) -> Self {
        let v2 = -self.v.powi(2);
        Grad {
            v: 1.0 / self.v,
            dx: self.dx / v2,
            dy: self.dy / v2,
            dz: self.dz / v2,
        }
    }

    /// Power function, using `a^b = exp(b ln a)` for the derivative terms
    pub fn pow(self, rhs: Self) -> Self {
        let v = self.v.powf(rhs.v);
        let da = rhs.v * self.v.powf(rhs.v - 1.0);
        let db = v * self.v.ln();
        Grad {
            v,
            dx: da * self.dx + db * rhs.dx,
            dy: da * self.dy + db * rhs.dy,
            dz: da * self.dz + db * rhs.dz,
        }
    }

    /// Strict less-than comparison, with zero derivative
    pub fn less(self, rhs: Self) -> Self {
        if self.v.is_nan() || rhs.v.is_nan() {
            f32::NAN.into()
        } else {
            ((self.v < rhs.v) as u8 as f32).into()
        }
    }

    /// Four-quadrant arctangent
    pub fn atan2(self, x: Self) -> Self {
        let y = self;
        let d = x.v.powi(2) + y.v.powi(2);
        Grad {
            v: y.v.atan2(x.v),
            dx: (x.v * y.dx - y.v * x.dx) / d,
            dy: (x.v * y.dy - y.v * x.dy) / d,
            dz: (x.v * y.dz - y.v * x.dz) / d,
        }
    }

    /// Minimum of two values
    pub fn min(self, rhs: Self) -> Self {
        if self.v < rhs.v {
            self
        } else {
            rhs
        }
    }

    /// Maximum of two values
    pub fn max(self, rhs: Self) -> Self {
        if self.v > rhs.v {
            self
        } else {
            rhs
        }
    }

    /// Checks that the two values are roughly equal, panicking otherwise
    #[cfg(test)]
    pub(crate) fn compare_eq(&self, other: Self) {
        let d = (self.v - other.v)
            .abs()
            .max((self.dx - other.dx).abs())
            .max((self.dy - other.dy).abs())
            .max((self.dz - other.dz).abs());
        if d >= 1e-6 {
            panic!("lhs != rhs ({self:?} != {other:?})");
        }
    }
}

impl From<f32> for Grad {
    fn from(v: f32) -> Self {
        Grad {
            v,
            dx: 0.0,
            dy: 0.0,
            dz: 0.0,
        }
    }
}

impl From<Grad> for nalgebra::Vector4<f32> {
    fn from(g: Grad) -> Self {
        nalgebra::Vector4::new(g.dx, g.dy, g.dz, g.v)
    }
}

impl std::ops::Add<Grad> for Grad {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Grad {
            v: self.v + rhs.v,
            dx: self.dx + rhs.dx,
            dy: self.dy + rhs.dy,
            dz: self.dz + rhs.dz,
        }
    }
}

impl std::ops::Mul<Grad> for Grad {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self {
            v: self.v * rhs.v,
            dx: self.v * rhs.dx + rhs.v * self.dx,
            dy: self.v * rhs.dy + rhs.v * self.dy,
            dz: self.v * rhs.dz + rhs.v * self.dz,
        }
    }
}

impl std::ops::Div<Grad> for Grad {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let d = rhs.v.powi(2);
        Self {
            v: self.v / rhs.v,
            dx: (rhs.v * self.dx - self.v * rhs.dx) / d,
            dy: (rhs.v * self.dy - self.v * rhs.dy) / d,
            dz: (rhs.v * self.dz - self.v * rhs.dz) / d,
        }
    }
}

impl std::ops::Sub<Grad> for Grad {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            v: self.v - rhs.v,
            dx: self.dx - rhs.dx,
            dy: self.dy - rhs.dy,
            dz: self.dz - rhs.dz,
        }
    }
}

impl std::ops::Neg for Grad {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            v: -self.v,
            dx: -self.dx,
            dy: -self.dy,
            dz: -self.dz,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sphere_grad() {
        // d/dx of sqrt(x^2 + y^2 + z^2) at (3, 4, 0) is 3/5
        let x = Grad::new(3.0, 1.0, 0.0, 0.0);
        let y = Grad::new(4.0, 0.0, 1.0, 0.0);
        let z = Grad::new(0.0, 0.0, 0.0, 1.0);
        let r = (x.square() + y.square() + z.square()).sqrt();
        r.compare_eq(Grad::new(5.0, 0.6, 0.8, 0.0));
    }

    #[test]
    fn test_pow_grad() {
        // d/dx of x^3 at x = 2 is 12
        let x = Grad::new(2.0, 1.0, 0.0, 0.0);
        let p = x.pow(3.0.into());
        p.compare_eq(Grad::new(8.0, 12.0, 0.0, 0.0));
    }
}
