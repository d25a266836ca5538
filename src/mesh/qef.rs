//! Quadratic Error Function accumulation and minimization
use super::cell::CellVertex;
use crate::region::Region;
use nalgebra::{Matrix3, Vector3, Vector4};

/// Relative eigenvalue threshold for the truncated pseudoinverse
///
/// Singular values below this fraction of the largest are clamped to zero;
/// the number that survive defines the feature rank of the cell (1 = face,
/// 2 = edge, 3 = corner).
const EIGENVALUE_CUTOFF: f32 = 0.1;

/// Solver for a quadratic error function to position a vertex within a cell
///
/// Accumulates `A^T A`, `A^T b` and `b^T b` for the error function
/// `E(v) = sum_i (n_i . (v - p_i))^2`, along with the mass point of the
/// contributing intersections.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct QuadraticErrorSolver {
    /// A^T A term
    ata: Matrix3<f32>,

    /// A^T b term
    atb: Vector3<f32>,

    /// b^T b term
    btb: f32,

    /// Mass point of intersections, stored as XYZ / W so that summing works
    mass_point: Vector4<f32>,
}

/// Result of solving a QEF within a cell
#[derive(Copy, Clone, Debug)]
pub struct QefSolution {
    /// Vertex position (clamped into the cell)
    pub vertex: CellVertex,
    /// Number of significant eigenvalues (0 if the QEF was empty)
    pub rank: u8,
    /// Residual error at the vertex
    pub error: f32,
}

impl std::ops::AddAssign for QuadraticErrorSolver {
    fn add_assign(&mut self, rhs: Self) {
        self.ata += rhs.ata;
        self.atb += rhs.atb;
        self.btb += rhs.btb;
        self.mass_point += rhs.mass_point;
    }
}

impl QuadraticErrorSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the accumulated mass point (XYZ / W)
    pub fn mass_point(&self) -> Vector4<f32> {
        self.mass_point
    }

    /// Returns the raw accumulated terms, for merging into a parent cell
    pub fn parts(&self) -> (Matrix3<f32>, Vector3<f32>, f32) {
        (self.ata, self.atb, self.btb)
    }

    /// Rebuilds a solver from raw accumulated terms
    pub fn from_parts(
        ata: Matrix3<f32>,
        atb: Vector3<f32>,
        btb: f32,
        mass_point: Vector4<f32>,
    ) -> Self {
        Self {
            ata,
            atb,
            btb,
            mass_point,
        }
    }

    /// Adds a new intersection to the QEF
    ///
    /// `pos` is accumulated into the mass point unconditionally.  `norm` is
    /// the (normalized) surface normal; an invalid normal is passed as zero
    /// and contributes nothing to the `A` / `b` terms.
    pub fn add_intersection(
        &mut self,
        pos: Vector3<f32>,
        norm: Vector3<f32>,
    ) {
        self.mass_point += Vector4::new(pos.x, pos.y, pos.z, 1.0);
        if norm != Vector3::zeros() {
            self.ata += norm * norm.transpose();
            self.atb += norm * norm.dot(&pos);
            self.btb += norm.dot(&pos).powi(2);
        }
    }

    /// Solves the QEF, minimizing towards the mass point
    ///
    /// The system is recentered on the mass point, then solved through the
    /// truncated SVD of `A^T A`: singular values below
    /// [`EIGENVALUE_CUTOFF`] (relative to the largest) are clamped to zero
    /// in the pseudoinverse, and the surviving count is reported as the
    /// feature rank.  A vertex escaping the cell is clamped back inside,
    /// with the error recomputed at the clamped position.
    pub fn solve(&self, cell: &Region<3>) -> QefSolution {
        if self.mass_point.w == 0.0 {
            // No intersections at all; nothing sensible to report.  An
            // infinite error prevents any collapse from accepting this.
            log::warn!("solving an empty QEF");
            return QefSolution {
                vertex: CellVertex {
                    pos: cell.center(),
                },
                rank: 0,
                error: f32::INFINITY,
            };
        }
        let center = self.mass_point.xyz() / self.mass_point.w;
        let atb = self.atb - self.ata * center;

        let svd = nalgebra::linalg::SVD::new(self.ata, true, true);

        // nalgebra doesn't always actually order singular values (?!)
        // https://github.com/dimforge/nalgebra/issues/1215
        let mut singular_values =
            svd.singular_values.data.0[0].map(ordered_float::OrderedFloat);
        singular_values.sort();
        singular_values.reverse();
        let singular_values = singular_values.map(|o| o.0);

        let cutoff = singular_values[0].abs() * EIGENVALUE_CUTOFF;
        let rank = if singular_values[0].abs() < 1e-12 {
            0
        } else {
            (0..3)
                .find(|i| singular_values[*i].abs() < cutoff)
                .unwrap_or(3) as u8
        };

        let pos = if rank == 0 {
            // Fully degenerate: fall back to the mass point
            center
        } else {
            svd.solve(&atb, cutoff)
                .map(|c| c + center)
                .unwrap_or(center)
        };

        let pos = if cell.contains(pos) {
            pos
        } else {
            cell.clamp(pos)
        };
        let error = ((pos.transpose() * self.ata * pos
            - 2.0 * pos.transpose() * self.atb)[0]
            + self.btb)
            .max(0.0);

        QefSolution {
            vertex: CellVertex { pos },
            rank,
            error,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unit_region() -> Region<3> {
        Region::centered_cube(1.0)
    }

    #[test]
    fn test_qef_planar() {
        // Three samples on the plane z = 0.5 with +z normals
        let mut q = QuadraticErrorSolver::new();
        let n = Vector3::new(0.0, 0.0, 1.0);
        q.add_intersection(Vector3::new(-0.5, -0.25, 0.5), n);
        q.add_intersection(Vector3::new(0.25, 0.5, 0.5), n);
        q.add_intersection(Vector3::new(0.5, -0.5, 0.5), n);
        let sol = q.solve(&unit_region());
        assert_eq!(sol.rank, 1);
        assert!(sol.error < 1e-9);
        assert!((sol.vertex.pos.z - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_qef_corner() {
        // Three orthogonal planes meeting at (0.5, 0.5, 0.5)
        let mut q = QuadraticErrorSolver::new();
        q.add_intersection(
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        q.add_intersection(
            Vector3::new(0.0, 0.5, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        q.add_intersection(
            Vector3::new(0.0, 0.0, 0.5),
            Vector3::new(0.0, 0.0, 1.0),
        );
        let sol = q.solve(&unit_region());
        assert_eq!(sol.rank, 3);
        assert!(
            (sol.vertex.pos - Vector3::new(0.5, 0.5, 0.5)).norm() < 1e-4,
            "bad vertex {:?}",
            sol.vertex.pos
        );
    }

    #[test]
    fn test_qef_edge_rank() {
        // Two planes meeting along an edge
        let mut q = QuadraticErrorSolver::new();
        q.add_intersection(
            Vector3::new(0.5, 0.0, -0.5),
            Vector3::new(1.0, 0.0, 0.0),
        );
        q.add_intersection(
            Vector3::new(0.5, 0.0, 0.5),
            Vector3::new(1.0, 0.0, 0.0),
        );
        q.add_intersection(
            Vector3::new(0.0, 0.5, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let sol = q.solve(&unit_region());
        assert_eq!(sol.rank, 2);
        assert!((sol.vertex.pos.x - 0.5).abs() < 1e-4);
        assert!((sol.vertex.pos.y - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_qef_clamp() {
        // Two nearly-parallel planes whose intersection is far outside the
        // cell; the vertex must be clamped inside with a finite error
        let mut q = QuadraticErrorSolver::new();
        q.add_intersection(
            Vector3::new(0.0, -0.5, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        q.add_intersection(
            Vector3::new(0.0, 0.5, 0.0),
            Vector3::new(0.1, 0.995, 0.0).normalize(),
        );
        let sol = q.solve(&unit_region());
        assert!(unit_region().contains(sol.vertex.pos));
        assert!(sol.error.is_finite());
    }

    #[test]
    fn test_qef_merge() {
        let mut a = QuadraticErrorSolver::new();
        a.add_intersection(
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let mut b = QuadraticErrorSolver::new();
        b.add_intersection(
            Vector3::new(0.0, 0.5, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        a += b;
        assert_eq!(a.mass_point().w, 2.0);

        let (ata, atb, btb) = a.parts();
        let rebuilt =
            QuadraticErrorSolver::from_parts(ata, atb, btb, a.mass_point());
        assert_eq!(rebuilt, a);
    }

    #[test]
    fn test_invalid_normal() {
        // A zero normal contributes to the mass point only
        let mut q = QuadraticErrorSolver::new();
        q.add_intersection(Vector3::new(0.25, 0.0, 0.0), Vector3::zeros());
        assert_eq!(q.mass_point().w, 1.0);
        let sol = q.solve(&unit_region());
        assert_eq!(sol.rank, 0);
        assert!((sol.vertex.pos.x - 0.25).abs() < 1e-6);
    }
}
