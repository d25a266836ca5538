//! 2D contouring: dual contouring over an adaptive quadtree
//!
//! This is the planar sibling of the [`mesh`](crate::mesh) module: the field
//! is sliced at a fixed `z`, ambiguous cells subdivide under interval
//! pruning (with tape shortening through the evaluator's deck), leaf cells
//! place a vertex by minimizing a 2D QEF, and the dual walk emits oriented
//! line segments with the filled region on their left.
//!
//! The 2D machinery is small enough that it stays single-threaded.
use crate::{
    error::Error,
    eval::Evaluator,
    mesh::CancelToken,
    region::Region,
    tape::Tape,
    types::{Grad, State},
};
use arrayvec::ArrayVec;
use nalgebra::{Matrix2, Vector2, Vector3};
use once_cell::sync::Lazy;

/// Settings when contouring a 2D slice
#[derive(Clone, Debug)]
pub struct Settings {
    /// Region to contour over
    pub bounds: Region<2>,

    /// Minimum cell edge length
    pub resolution: f32,

    /// QEF residual threshold for collapsing cells
    pub max_err: f32,

    /// Height of the slicing plane
    pub z: f32,

    /// Values for named variables in the tape
    pub vars: Vec<(String, f32)>,

    /// Cooperative cancellation flag
    pub cancel: CancelToken,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bounds: Region::centered_cube(1.0),
            resolution: 0.05,
            max_err: 1e-6,
            z: 0.0,
            vars: vec![],
            cancel: CancelToken::new(),
        }
    }
}

impl Settings {
    fn depth(&self) -> u8 {
        self.bounds.depth_for(self.resolution)
    }
}

/// An indexed set of oriented contour segments
///
/// Each segment keeps the filled region on its left, so closed loops wind
/// counter-clockwise around solid material.
#[derive(Default, Debug)]
pub struct ContourSet {
    /// Vertex positions
    pub vertices: Vec<Vector2<f32>>,
    /// Oriented segments, as indexes into [`Self::vertices`]
    pub edges: Vec<[usize; 2]>,
}

impl ContourSet {
    /// Chains segments into polylines (closed loops where possible)
    pub fn polylines(&self) -> Vec<Vec<usize>> {
        let mut next = vec![usize::MAX; self.vertices.len()];
        for e in &self.edges {
            next[e[0]] = e[1];
        }
        let mut seen = vec![false; self.vertices.len()];
        let mut out = vec![];
        for e in &self.edges {
            let start = e[0];
            if seen[start] {
                continue;
            }
            let mut line = vec![start];
            seen[start] = true;
            let mut v = next[start];
            while v != usize::MAX && !seen[v] {
                line.push(v);
                seen[v] = true;
                v = next[v];
            }
            if v == start {
                // Closed loop; repeat the start for convenience
                line.push(start);
            }
            out.push(line);
        }
        out
    }
}

////////////////////////////////////////////////////////////////////////////////

// Square corners are numbered with bit 0 = +x and bit 1 = +y; edges are
// packed as `2 * axis + side`, where `axis` is the varying axis and `side`
// selects the position on the other axis:
//
//   0 = bottom (y = 0), 1 = top (y = 1), 2 = left (x = 0), 3 = right (x = 1)

/// A directed square edge, from the inside corner to the outside corner
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct DirectedEdge2 {
    start: u8,
    end: u8,
}

impl DirectedEdge2 {
    fn index(&self) -> usize {
        let axis = (self.start ^ self.end).trailing_zeros() as usize;
        debug_assert!(axis < 2);
        let other = 1 - axis;
        2 * axis + ((self.start >> other) & 1) as usize
    }
}

/// For each corner mask, the partition of sign-changing edges into vertex
/// groups
///
/// Grouping follows connected filled regions, so the two diagonal
/// configurations produce two vertices and everything else produces at most
/// one.
static CELL_TO_VERT_TO_EDGES_2D: Lazy<[Vec<Vec<DirectedEdge2>>; 16]> =
    Lazy::new(|| {
        std::array::from_fn(|mask| {
            // Cluster filled corners through edge adjacency
            let filled = |c: usize| mask & (1 << c) != 0;
            let mut region = [usize::MAX; 4];
            let mut count = 0;
            for c in 0..4 {
                if !filled(c) || region[c] != usize::MAX {
                    continue;
                }
                let mut todo = vec![c];
                while let Some(i) = todo.pop() {
                    if region[i] != usize::MAX {
                        continue;
                    }
                    region[i] = count;
                    for axis in [1usize, 2] {
                        let j = i ^ axis;
                        if filled(j) && region[j] == usize::MAX {
                            todo.push(j);
                        }
                    }
                }
                count += 1;
            }

            let mut verts = vec![vec![]; count];
            for start in 0..4u8 {
                for axis in [1u8, 2] {
                    let end = start ^ axis;
                    if filled(start as usize) && !filled(end as usize) {
                        verts[region[start as usize]]
                            .push(DirectedEdge2 { start, end });
                    }
                }
            }
            verts
        })
    });

/// Per-mask collapse safety: filled and empty corners each connected
///
/// This is the 2D corner-topology test; it rejects exactly the two diagonal
/// configurations.
fn corners_are_manifold_2d(mask: u8) -> bool {
    mask != 0b0110 && mask != 0b1001
}

////////////////////////////////////////////////////////////////////////////////

/// 2D quadratic error function
#[derive(Copy, Clone, Debug, Default)]
struct Qef2 {
    ata: Matrix2<f32>,
    atb: Vector2<f32>,
    btb: f32,
    mass_point: Vector3<f32>,
}

impl std::ops::AddAssign for Qef2 {
    fn add_assign(&mut self, rhs: Self) {
        self.ata += rhs.ata;
        self.atb += rhs.atb;
        self.btb += rhs.btb;
        self.mass_point += rhs.mass_point;
    }
}

impl Qef2 {
    fn add_intersection(&mut self, pos: Vector2<f32>, norm: Vector2<f32>) {
        self.mass_point += Vector3::new(pos.x, pos.y, 1.0);
        if norm != Vector2::zeros() {
            self.ata += norm * norm.transpose();
            self.atb += norm * norm.dot(&pos);
            self.btb += norm.dot(&pos).powi(2);
        }
    }

    /// Solves the QEF, returning the vertex, rank (1 = line, 2 = corner),
    /// and residual error
    fn solve(&self, cell: &Region<2>) -> (Vector2<f32>, u8, f32) {
        if self.mass_point.z == 0.0 {
            return (cell.center(), 0, f32::INFINITY);
        }
        let center = self.mass_point.xy() / self.mass_point.z;
        let atb = self.atb - self.ata * center;

        let svd = nalgebra::linalg::SVD::new(self.ata, true, true);
        let mut sv = svd.singular_values.data.0[0]
            .map(ordered_float::OrderedFloat);
        sv.sort();
        sv.reverse();
        let sv = sv.map(|o| o.0);

        let cutoff = sv[0].abs() * 0.1;
        let rank = if sv[0].abs() < 1e-12 {
            0
        } else {
            (0..2).find(|i| sv[*i].abs() < cutoff).unwrap_or(2) as u8
        };
        let pos = if rank == 0 {
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
        (pos, rank, error)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A quadtree leaf crossing the contour
#[derive(Clone, Debug)]
struct Leaf2 {
    mask: u8,

    /// One vertex per connected patch (two in the diagonal cases)
    verts: ArrayVec<Vector2<f32>, 2>,

    /// Which vertex each edge crossing belongs to
    vert_of_edge: [u8; 4],

    /// Crossing positions, indexed by square edge
    crossings: [Option<Vector2<f32>>; 4],

    /// Depth of the largest merged chain (0 = native leaf)
    level: u8,

    /// Accumulated QEF, for merging into a parent
    qef: Qef2,
}

/// A quadtree cell
///
/// 2D trees are cheap and built serially, so children are boxed directly
/// rather than pooled.
#[derive(Clone, Debug)]
enum Cell2 {
    Empty,
    Full,
    Leaf(Leaf2),
    Branch(Box<[Cell2; 4]>),
}

impl Cell2 {
    fn corner(&self, c: usize) -> bool {
        match self {
            Cell2::Empty => false,
            Cell2::Full => true,
            Cell2::Leaf(leaf) => leaf.mask & (1 << c) != 0,
            Cell2::Branch(..) => panic!(),
        }
    }

    fn is_leaf(&self) -> bool {
        !matches!(self, Cell2::Branch(..))
    }
}

struct Builder<'a> {
    eval: Evaluator,
    settings: &'a Settings,
}

impl Builder<'_> {
    fn build_cell(&mut self, region: Region<2>, depth: u8) -> Cell2 {
        if self.settings.cancel.is_cancelled() {
            return Cell2::Empty;
        }
        let z = self.settings.z;
        let lower = Vector3::new(region.lower().x, region.lower().y, z);
        let upper = Vector3::new(region.upper().x, region.upper().y, z);
        let (i, nan) = self.eval.eval_interval_top(lower, upper);
        match i.state(nan) {
            State::Filled => return Cell2::Full,
            State::Empty => return Cell2::Empty,
            _ => (),
        }
        if depth >= self.settings.depth() {
            self.eval.push_top();
            let out = self.leaf(region);
            self.eval.pop();
            return out;
        }

        self.eval.push_top();
        let children: [Cell2; 4] = std::array::from_fn(|i| {
            self.build_cell(region.child(i), depth + 1)
        });
        self.eval.pop();

        self.collect_children(children, region)
    }

    fn leaf(&mut self, region: Region<2>) -> Cell2 {
        let z = self.settings.z;
        let tape = self.eval.active_tape().clone();

        let mut xs = [0.0; 4];
        let mut ys = [0.0; 4];
        for c in 0..4 {
            let p = region.corner(c);
            xs[c] = p.x;
            ys[c] = p.y;
        }
        let zs = [z; 4];
        let mut values = [0.0; 4];
        self.eval
            .eval_array(&tape, &xs, &ys, &zs, &mut values)
            .unwrap();
        let mask = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v < 0.0)
            .fold(0, |acc, (i, _)| acc | (1 << i)) as u8;
        if mask == 0 {
            return Cell2::Empty;
        } else if mask == 0b1111 {
            return Cell2::Full;
        }

        let mut leaf = Leaf2 {
            mask,
            verts: ArrayVec::new(),
            vert_of_edge: [u8::MAX; 4],
            crossings: [None; 4],
            level: 0,
            qef: Qef2::default(),
        };

        for (vi, edges) in
            CELL_TO_VERT_TO_EDGES_2D[mask as usize].iter().enumerate()
        {
            let mut qef = Qef2::default();
            for e in edges {
                // Bisect for the crossing
                let mut lo = region.corner(e.start as usize);
                let mut hi = region.corner(e.end as usize);
                for _ in 0..16 {
                    let mid = (lo + hi) / 2.0;
                    let v = self.eval.eval_point(
                        &tape,
                        Vector3::new(mid.x, mid.y, z),
                    );
                    if v < 0.0 {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                let pos = (lo + hi) / 2.0;

                let mut grad = [Grad::default()];
                let mut ambig = [false];
                self.eval
                    .eval_deriv(
                        &tape,
                        &[pos.x],
                        &[pos.y],
                        &[z],
                        &mut grad,
                        &mut ambig,
                    )
                    .unwrap();
                let n = Vector2::new(grad[0].dx, grad[0].dy);
                let norm = n.norm();
                let n = if norm > 1e-12 && norm.is_finite() {
                    n / norm
                } else {
                    Vector2::zeros()
                };
                qef.add_intersection(pos, n);
                leaf.crossings[e.index()] = Some(pos);
                leaf.vert_of_edge[e.index()] = vi as u8;
            }
            let (pos, _rank, _err) = qef.solve(&region);
            leaf.verts.push(pos);
            leaf.qef += qef;
        }
        Cell2::Leaf(leaf)
    }

    /// Merges a quartet of children, or keeps them as a branch
    fn collect_children(
        &mut self,
        children: [Cell2; 4],
        region: Region<2>,
    ) -> Cell2 {
        let empty = children.iter().filter(|c| matches!(c, Cell2::Empty)).count();
        let full = children.iter().filter(|c| matches!(c, Cell2::Full)).count();
        if empty == 4 {
            return Cell2::Empty;
        }
        if full == 4 {
            return Cell2::Full;
        }
        if !children.iter().all(|c| c.is_leaf()) {
            return Cell2::Branch(Box::new(children));
        }

        // Children must each be collapse-safe with a single patch
        let mut mask = 0u8;
        for (i, c) in children.iter().enumerate() {
            if let Cell2::Leaf(leaf) = c {
                if leaf.verts.len() != 1
                    || !corners_are_manifold_2d(leaf.mask)
                {
                    return Cell2::Branch(Box::new(children));
                }
            }
            mask |= (c.corner(i) as u8) << i;
        }
        if !corners_are_manifold_2d(mask) {
            return Cell2::Branch(Box::new(children));
        }

        // Sign consistency on shared boundaries: the midpoint of each
        // coarse edge and the cell center must agree with at least one
        // corner of their feature
        for (a, b, mid_owner, mid_corner) in [
            (0usize, 1usize, 0usize, 1usize), // bottom edge, midpoint
            (2, 3, 2, 3),                     // top edge
            (0, 2, 0, 2),                     // left edge
            (1, 3, 1, 3),                     // right edge
        ] {
            let mid = children[mid_owner].corner(mid_corner);
            let ea = mask & (1 << a) != 0;
            let eb = mask & (1 << b) != 0;
            if mid != ea && mid != eb {
                return Cell2::Branch(Box::new(children));
            }
        }
        let center = children[0].corner(3);
        if (0..4).all(|c| (mask & (1 << c) != 0) != center) {
            return Cell2::Branch(Box::new(children));
        }

        // Merge the QEFs and retest the error
        let mut qef = Qef2::default();
        let mut level = 0u8;
        for c in &children {
            if let Cell2::Leaf(leaf) = c {
                qef += leaf.qef;
                level = level.max(leaf.level + 1);
            } else {
                level = level.max(1);
            }
        }
        let (pos, _rank, err) = qef.solve(&region);
        if err >= self.settings.max_err {
            return Cell2::Branch(Box::new(children));
        }

        // Take boundary crossings from whichever child half has them
        let mut merged = Leaf2 {
            mask,
            verts: ArrayVec::new(),
            vert_of_edge: [0; 4],
            crossings: [None; 4],
            level,
            qef,
        };
        for (i, c) in children.iter().enumerate() {
            if let Cell2::Leaf(leaf) = c {
                // Child i touches the parent's boundary edges matching its
                // own corner position
                for e in 0..4 {
                    let child_on_edge = match e {
                        0 => i & 2 == 0, // bottom: children 0, 1
                        1 => i & 2 != 0, // top: children 2, 3
                        2 => i & 1 == 0, // left: children 0, 2
                        _ => i & 1 != 0, // right: children 1, 3
                    };
                    if child_on_edge && leaf.crossings[e].is_some() {
                        merged.crossings[e] = leaf.crossings[e];
                    }
                }
            }
        }
        merged.verts.push(pos);
        Cell2::Leaf(merged)
    }
}

////////////////////////////////////////////////////////////////////////////////

struct Walker {
    out: ContourSet,
    /// Deduplicated vertex positions, keyed by bit pattern
    seen: std::collections::HashMap<(u32, u32), usize>,
}

impl Walker {
    fn vertex(&mut self, p: Vector2<f32>) -> usize {
        let key = (p.x.to_bits(), p.y.to_bits());
        if let Some(&i) = self.seen.get(&key) {
            i
        } else {
            let i = self.out.vertices.len();
            self.out.vertices.push(p);
            self.seen.insert(key, i);
            i
        }
    }

    fn cell(&mut self, cell: &Cell2) {
        if let Cell2::Branch(children) = cell {
            for c in children.iter() {
                self.cell(c);
            }
            // Interior adjacencies
            self.edge_x(&children[0], &children[1]);
            self.edge_x(&children[2], &children[3]);
            self.edge_y(&children[0], &children[2]);
            self.edge_y(&children[1], &children[3]);
        }
    }

    /// Child lookup, standing in for the cell itself at a leaf
    fn child(cell: &Cell2, i: usize) -> &Cell2 {
        match cell {
            Cell2::Branch(children) => &children[i],
            c => c,
        }
    }

    /// Handles two cells sharing a vertical edge (`a` left of `b`)
    fn edge_x(&mut self, a: &Cell2, b: &Cell2) {
        if !a.is_leaf() || !b.is_leaf() {
            self.edge_x(Self::child(a, 1), Self::child(b, 0));
            self.edge_x(Self::child(a, 3), Self::child(b, 2));
            return;
        }
        // Signs across the shared edge, read from whichever side is a leaf
        let (below, above) = match (a, b) {
            (Cell2::Leaf(la), _) => (
                la.mask & 0b0010 != 0, // corner 1
                la.mask & 0b1000 != 0, // corner 3
            ),
            (_, Cell2::Leaf(lb)) => (
                lb.mask & 0b0001 != 0, // corner 0
                lb.mask & 0b0100 != 0, // corner 2
            ),
            _ => return,
        };
        if below == above {
            return;
        }
        let (Some(va), Some(vb)) =
            (Self::leaf_vert(a, 3), Self::leaf_vert(b, 2))
        else {
            return;
        };
        let va = self.vertex(va);
        let vb = self.vertex(vb);
        // Keep the filled region on the left of the segment
        if below {
            self.out.edges.push([vb, va]);
        } else {
            self.out.edges.push([va, vb]);
        }
    }

    /// Handles two cells sharing a horizontal edge (`a` below `b`)
    fn edge_y(&mut self, a: &Cell2, b: &Cell2) {
        if !a.is_leaf() || !b.is_leaf() {
            self.edge_y(Self::child(a, 2), Self::child(b, 0));
            self.edge_y(Self::child(a, 3), Self::child(b, 1));
            return;
        }
        let (left, right) = match (a, b) {
            (Cell2::Leaf(la), _) => (
                la.mask & 0b0100 != 0, // corner 2
                la.mask & 0b1000 != 0, // corner 3
            ),
            (_, Cell2::Leaf(lb)) => (
                lb.mask & 0b0001 != 0, // corner 0
                lb.mask & 0b0010 != 0, // corner 1
            ),
            _ => return,
        };
        if left == right {
            return;
        }
        let (Some(va), Some(vb)) =
            (Self::leaf_vert(a, 1), Self::leaf_vert(b, 0))
        else {
            return;
        };
        let va = self.vertex(va);
        let vb = self.vertex(vb);
        if left {
            self.out.edges.push([va, vb]);
        } else {
            self.out.edges.push([vb, va]);
        }
    }

    /// Returns the cell vertex responsible for the given edge of the cell
    fn leaf_vert(cell: &Cell2, edge: usize) -> Option<Vector2<f32>> {
        match cell {
            Cell2::Leaf(leaf) => {
                let vi = leaf.vert_of_edge[edge];
                if (vi as usize) < leaf.verts.len() {
                    Some(leaf.verts[vi as usize])
                } else {
                    // A merged leaf has a single vertex for all edges
                    leaf.verts.first().copied()
                }
            }
            _ => None,
        }
    }
}

/// Builds a set of contours from the given tape
pub fn render(tape: &Tape, settings: &Settings) -> Result<ContourSet, Error> {
    let mut eval = Evaluator::new(tape);
    eval.apply_vars(&settings.vars);
    let mut builder = Builder { eval, settings };
    let root = builder.build_cell(settings.bounds, 0);
    if settings.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let mut walker = Walker {
        out: ContourSet::default(),
        seen: Default::default(),
    };
    walker.cell(&root);
    Ok(walker.out)
}
