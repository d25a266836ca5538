//! Octree construction for Manifold Dual Contouring
//!
//! Construction proceeds top-down: every cell gets an interval evaluation
//! (which may prove it entirely inside or outside, and otherwise yields a
//! shortened tape for the region), ambiguous cells subdivide until the base
//! resolution, and leaf cells sample corners, locate edge crossings, and
//! solve a QEF for their vertices.  On the way back up,
//! [`OctreeBuilder::collect_children`] merges subtrees whose combined cell
//! stays topologically safe and within the error budget.
use super::{
    cell::{Cell, CellData, CellIndex, CellVertex, Leaf},
    gen::{CELL_TO_VERT_TO_EDGES, CORNERS_ARE_MANIFOLD},
    pool::{ObjectPool, Reclaim},
    types::{Corner, DirectedEdge, X, Y, Z},
    Settings,
};
use crate::{
    error::Error,
    eval::Evaluator,
    tape::Tape,
    types::State,
};
use arrayvec::ArrayVec;
use nalgebra::{Matrix3, Vector3, Vector4};
use smallvec::SmallVec;
use std::sync::Arc;

use super::qef::QuadraticErrorSolver;

/// Number of bisection rounds used when locating an edge crossing
///
/// Crossing positions feed the QEF as `b`-terms, so their error shows up
/// squared in collapse residuals; in `f32` this needs to go well past the
/// point where the sign test stops improving visually.
const EDGE_SEARCH_DEPTH: usize = 16;

/// A single surface sample on a cell edge
#[derive(Copy, Clone, Debug)]
pub(crate) struct HermiteSample {
    /// Position of the crossing
    pub pos: Vector3<f32>,
    /// Unit surface normal, or zero if the gradient was degenerate
    pub norm: Vector3<f32>,
    /// Field value at the crossing (should be near zero)
    pub value: f32,
}

/// Samples along one directed cell edge
///
/// Typically a single crossing; the inline capacity covers the occasional
/// multi-feature point, and pathological cells spill to the heap.
pub(crate) type HermiteVec = SmallVec<[HermiteSample; 2]>;

/// Heap data for an ambiguous (surface-crossing) cell
///
/// Only ambiguous cells carry one of these; filled and empty cells are
/// packed entirely into their [`CellData`] word.
#[derive(Clone, Debug)]
pub(crate) struct DcLeaf {
    /// Bitfield of filled corners
    pub corner_mask: u8,

    /// Number of vertices in this cell (more than one keeps the surface
    /// manifold for tunnel-like corner configurations)
    pub vertex_count: u8,

    /// Feature rank of the cell's vertex (1 = face, 2 = edge, 3 = corner)
    pub rank: u8,

    /// Depth of the largest chain of leaves merged into this cell
    /// (0 = native leaf)
    pub level: u8,

    /// Whether the corner configuration is safe to merge into a parent
    pub manifold: bool,

    /// QEF residual at the chosen vertex
    pub qef_err: f32,

    /// Vertex positions
    pub verts: ArrayVec<CellVertex, 4>,

    /// Per-directed-edge surface samples
    ///
    /// Shared by reference counting, because a merged parent reuses its
    /// children's boundary intersections.
    pub intersections: [Option<Arc<HermiteVec>>; 24],

    /// Mass point of the contributing intersections (XYZ / W)
    pub mass_point: Vector4<f32>,

    /// Accumulated A^T A term
    pub ata: Matrix3<f32>,

    /// Accumulated A^T b term
    pub atb: Vector3<f32>,

    /// Accumulated b^T b term
    pub btb: f32,
}

impl Default for DcLeaf {
    fn default() -> Self {
        const NONE: Option<Arc<HermiteVec>> = None;
        Self {
            corner_mask: 0,
            vertex_count: 0,
            rank: 0,
            level: 0,
            manifold: false,
            qef_err: -1.0,
            verts: ArrayVec::new(),
            intersections: [NONE; 24],
            mass_point: Vector4::zeros(),
            ata: Matrix3::zeros(),
            atb: Vector3::zeros(),
            btb: 0.0,
        }
    }
}

impl Reclaim for DcLeaf {
    fn reclaim(&mut self) {
        *self = Self::default();
    }
}

impl DcLeaf {
    /// Rebuilds the accumulated QEF for this cell
    pub fn qef(&self) -> QuadraticErrorSolver {
        QuadraticErrorSolver::from_parts(
            self.ata,
            self.atb,
            self.btb,
            self.mass_point,
        )
    }

    fn store_qef(&mut self, qef: &QuadraticErrorSolver) {
        let (ata, atb, btb) = qef.parts();
        self.ata = ata;
        self.atb = atb;
        self.btb = btb;
        self.mass_point = qef.mass_point();
    }
}

/// Directed edge indices of the parent cell which the child at the given
/// corner can contribute intersections to
///
/// These are the three parent edges running through the child's corner, in
/// both directions.
pub(crate) fn edges_from_child(child: usize) -> [usize; 6] {
    let mut out = [0; 6];
    let mut i = 0;
    for t in [X, Y, Z] {
        let u = t.next();
        let v = u.next();
        let undirected = t.index() * 4
            + ((child >> v.index()) & 1) * 2
            + ((child >> u.index()) & 1);
        out[i] = undirected * 2;
        out[i + 1] = undirected * 2 + 1;
        i += 2;
    }
    out
}

////////////////////////////////////////////////////////////////////////////////

/// Per-leaf metadata in a finished octree
#[derive(Copy, Clone, Debug)]
pub(crate) struct LeafInfo {
    /// Starting index of this leaf's vertices within [`Octree::verts`]
    ///
    /// Cell vertices come first, followed by one vertex per intersected
    /// edge, in marching-table order.
    pub vert_index: usize,

    /// Feature rank of the cell (1 = face, 2 = edge, 3 = corner)
    pub rank: u8,

    /// Depth of the largest merged chain (0 = native leaf)
    pub level: u8,
}

/// Octree storing occupancy and vertex positions for Manifold Dual
/// Contouring
#[derive(Debug)]
pub struct Octree {
    /// Packed cells; the root is always at index 0
    pub(crate) cells: Vec<CellData>,

    /// Vertex positions, indexed through [`LeafInfo::vert_index`]
    pub(crate) verts: Vec<CellVertex>,

    /// Per-leaf metadata, indexed by [`Leaf::index`]
    pub(crate) leafs: Vec<LeafInfo>,

    /// Parent cell of every cell (`u32::MAX` for the root and for unused
    /// slots); used for neighbor queries
    pub(crate) parents: Vec<u32>,
}

impl std::ops::Index<CellIndex> for Octree {
    type Output = CellData;
    fn index(&self, i: CellIndex) -> &CellData {
        &self.cells[i.index]
    }
}

impl Octree {
    /// Builds an octree over `settings.bounds`, subdividing until cell edges
    /// are at or below `settings.resolution`
    pub fn build(tape: &Tape, settings: &Settings) -> Result<Self, Error> {
        log::trace!(
            "building octree to depth {} on {} thread(s)",
            settings.depth(),
            settings.threads.max(1),
        );
        let out = if settings.threads == 0 {
            let mut builder = OctreeBuilder::new(ObjectPool::default());
            let mut eval = Evaluator::new(tape);
            eval.apply_vars(&settings.vars);
            builder.recurse(
                &mut eval,
                tape,
                CellIndex::root(settings.bounds),
                settings,
            );
            Octree::merge(vec![builder])
        } else {
            super::worker::OctreeWorker::scheduler(tape, settings)
        };
        if settings.cancel.is_cancelled() {
            log::trace!("octree build was cancelled");
            return Err(Error::Cancelled);
        }
        Ok(out)
    }

    /// Merges per-worker octree fragments into a single octree
    ///
    /// Cross-worker branch references are rewritten into the merged arrays,
    /// leaf payloads are flattened into vertex lists, and the parent table
    /// is rebuilt.
    pub(crate) fn merge(builders: Vec<OctreeBuilder>) -> Self {
        let mut cell_offsets = vec![0];
        for b in &builders {
            let i = cell_offsets.last().unwrap();
            cell_offsets.push(i + b.cells.len());
        }

        let mut out = Octree {
            cells: Vec::with_capacity(*cell_offsets.last().unwrap()),
            verts: vec![],
            leafs: vec![],
            parents: vec![],
        };

        for b in builders.iter() {
            for c in &b.cells {
                let c: Cell = match (*c).into() {
                    c @ (Cell::Empty | Cell::Full | Cell::Invalid) => c,
                    Cell::Branch { index, thread } => Cell::Branch {
                        index: cell_offsets[thread as usize] + index,
                        thread: 0,
                    },
                    Cell::Leaf(Leaf { mask, index }) => {
                        let info = out.flatten_leaf(&b.leafs[index], mask);
                        Cell::Leaf(Leaf { mask, index: info })
                    }
                };
                out.cells.push(c.into());
            }
        }
        out.rebuild_parents();
        out
    }

    /// Copies one leaf payload into the flat vertex array, returning its
    /// index in [`Self::leafs`]
    fn flatten_leaf(&mut self, leaf: &DcLeaf, mask: u8) -> usize {
        let vert_index = self.verts.len();
        debug_assert_eq!(leaf.vertex_count as usize, leaf.verts.len());
        self.verts.extend(leaf.verts.iter().cloned());
        for vs in CELL_TO_VERT_TO_EDGES[mask as usize].iter() {
            for e in vs.iter() {
                self.verts.push(CellVertex {
                    pos: leaf_edge_pos(leaf, *e),
                });
            }
        }
        let index = self.leafs.len();
        self.leafs.push(LeafInfo {
            vert_index,
            rank: leaf.rank,
            level: leaf.level,
        });
        index
    }

    fn rebuild_parents(&mut self) {
        self.parents = vec![u32::MAX; self.cells.len()];
        let mut todo = vec![0usize];
        while let Some(i) = todo.pop() {
            if let Cell::Branch { index, .. } = self.cells[i].into() {
                for j in 0..8 {
                    self.parents[index + j] = i as u32;
                    todo.push(index + j);
                }
            }
        }
    }

    /// Unpacks the cell at the given handle
    pub(crate) fn cell(&self, i: CellIndex) -> Cell {
        self.cells[i.index].into()
    }

    pub(crate) fn is_leaf(&self, cell: CellIndex) -> bool {
        match self.cell(cell) {
            Cell::Leaf(..) | Cell::Full | Cell::Empty => true,
            Cell::Branch { .. } => false,
            Cell::Invalid => panic!(),
        }
    }

    /// Looks up the given child of a cell
    ///
    /// If the cell is a leaf node, returns that cell instead.
    pub(crate) fn child<C: Into<Corner>>(
        &self,
        cell: CellIndex,
        child: C,
    ) -> CellIndex {
        let child = child.into();
        match self.cell(cell) {
            Cell::Leaf { .. } | Cell::Full | Cell::Empty => cell,
            Cell::Branch { index, .. } => cell.child(index, child),
            Cell::Invalid => panic!(),
        }
    }

}

/// Returns the surface position recorded on the given (inside-to-outside)
/// edge of a leaf
fn leaf_edge_pos(leaf: &DcLeaf, e: DirectedEdge) -> Vector3<f32> {
    // The crossing is stored under the directed slot whose start corner is
    // inside; a merged leaf carries its children's slots, which share the
    // parent's orientation.  Multi-sample edges use the sample closest to
    // the surface.
    for d in [e.index(), e.index() ^ 1] {
        if let Some(v) = &leaf.intersections[d] {
            let best = v
                .iter()
                .min_by(|a, b| a.value.abs().total_cmp(&b.value.abs()));
            if let Some(best) = best {
                return best.pos;
            }
        }
    }
    log::warn!("missing intersection on edge {e:?}");
    let m = leaf.mass_point;
    m.xyz() / m.w.max(1.0)
}

////////////////////////////////////////////////////////////////////////////////

/// Result of evaluating a single cell
pub(crate) enum CellResult {
    /// The cell is resolved without subdividing
    Done(Cell),
    /// The cell must subdivide, evaluating children against the given
    /// (shortened) tape
    Recurse(Tape),
}

/// Result of collecting a cluster of eight children
pub(crate) enum BranchResult {
    /// All children were empty
    Empty,
    /// All children were full
    Full,
    /// The children remain as a branch rooted at the given index
    Branch(usize),
    /// The children merged into a single leaf
    Leaf(DcLeaf),
}

/// An octree under construction
///
/// During construction, leaf cells index into an arena of [`DcLeaf`]
/// payloads; collapse releases payloads back to the object pool and recycles
/// their arena slots.
pub(crate) struct OctreeBuilder {
    pub(crate) cells: Vec<CellData>,
    pub(crate) leafs: Vec<DcLeaf>,
    free_leafs: Vec<usize>,
    pub(crate) leaf_pool: ObjectPool<DcLeaf>,
}

impl OctreeBuilder {
    /// Builds a new octree builder, allocating the shared root cluster
    pub(crate) fn new(leaf_pool: ObjectPool<DcLeaf>) -> Self {
        Self {
            cells: vec![Cell::Invalid.into(); 8],
            leafs: vec![],
            free_leafs: vec![],
            leaf_pool,
        }
    }

    /// Builds an empty octree builder for secondary workers
    pub(crate) fn empty(leaf_pool: ObjectPool<DcLeaf>) -> Self {
        Self {
            cells: vec![],
            leafs: vec![],
            free_leafs: vec![],
            leaf_pool,
        }
    }

    /// Records the given cell into the provided index
    ///
    /// # Panics
    /// If the cell is already populated
    pub(crate) fn record(&mut self, index: usize, cell: CellData) {
        debug_assert_eq!(self.cells[index], Cell::Invalid.into());
        self.cells[index] = cell;
    }

    /// Stores a leaf payload, returning the cell that points at it
    pub(crate) fn store_leaf(&mut self, leaf: DcLeaf) -> Cell {
        let mask = leaf.corner_mask;
        let index = if let Some(i) = self.free_leafs.pop() {
            self.leafs[i] = leaf;
            i
        } else {
            self.leafs.push(leaf);
            self.leafs.len() - 1
        };
        Cell::Leaf(Leaf { mask, index })
    }

    fn release_leaf(&mut self, index: usize) {
        let leaf = std::mem::take(&mut self.leafs[index]);
        self.leaf_pool.put(leaf);
        self.free_leafs.push(index);
    }

    /// Evaluates a single cell
    ///
    /// Terminal results are returned directly; ambiguous cells at the base
    /// resolution run the full leaf evaluation, and larger ambiguous cells
    /// return a shortened tape for their children.
    pub(crate) fn eval_cell(
        &mut self,
        eval: &mut Evaluator,
        tape: &Tape,
        cell: CellIndex,
        settings: &Settings,
    ) -> CellResult {
        let (i, nan) = eval.eval_interval(
            tape,
            cell.bounds.lower(),
            cell.bounds.upper(),
        );
        match i.state(nan) {
            State::Filled => CellResult::Done(Cell::Full),
            State::Empty => CellResult::Done(Cell::Empty),
            _ => {
                let sub = eval.push_from_last(tape);
                if cell.depth >= settings.depth() as usize {
                    let out = self.leaf(eval, &sub, cell);
                    eval.recycle_tape(sub);
                    CellResult::Done(out)
                } else {
                    CellResult::Recurse(sub)
                }
            }
        }
    }

    /// Recursively builds the given cell (single-threaded path)
    pub(crate) fn recurse(
        &mut self,
        eval: &mut Evaluator,
        tape: &Tape,
        cell: CellIndex,
        settings: &Settings,
    ) {
        if settings.cancel.is_cancelled() {
            return;
        }
        match self.eval_cell(eval, tape, cell, settings) {
            CellResult::Done(c) => self.cells[cell.index] = c.into(),
            CellResult::Recurse(sub) => {
                let index = self.cells.len();
                for _ in Corner::iter() {
                    self.cells.push(Cell::Invalid.into());
                }
                for i in Corner::iter() {
                    self.recurse(eval, &sub, cell.child(index, i), settings);
                }
                if settings.cancel.is_cancelled() {
                    return;
                }
                let r = self
                    .collect_children(cell, index, settings.max_err)
                    .unwrap();
                let c = self.apply_branch_result(r, index, 0);
                self.cells[cell.index] = c.into();
                eval.recycle_tape(sub);
            }
        }
    }

    /// Converts a [`BranchResult`] into a recorded cell, freeing child cells
    /// when they are no longer referenced
    pub(crate) fn apply_branch_result(
        &mut self,
        r: BranchResult,
        index: usize,
        thread: u8,
    ) -> Cell {
        let (out, free_children) = match r {
            BranchResult::Empty => (Cell::Empty, true),
            BranchResult::Full => (Cell::Full, true),
            BranchResult::Branch(index) => {
                (Cell::Branch { index, thread }, false)
            }
            BranchResult::Leaf(leaf) => (self.store_leaf(leaf), true),
        };
        if free_children {
            self.free_cluster(index);
        }
        out
    }

    /// Releases a cluster of eight child cells that is no longer referenced
    pub(crate) fn free_cluster(&mut self, index: usize) {
        if index == self.cells.len() - 8 {
            self.cells.truncate(index);
        } else {
            self.cells[index..index + 8].fill(Cell::Invalid.into());
        }
    }

    /// Evaluates the given cell at the base resolution
    fn leaf(
        &mut self,
        eval: &mut Evaluator,
        tape: &Tape,
        cell: CellIndex,
    ) -> Cell {
        let mut xs = [0.0; 12];
        let mut ys = [0.0; 12];
        let mut zs = [0.0; 12];
        for i in Corner::iter() {
            let p = cell.corner(i);
            xs[i.index()] = p.x;
            ys[i.index()] = p.y;
            zs[i.index()] = p.z;
        }
        let mut corners = [0.0; 8];
        eval.eval_array(tape, &xs[..8], &ys[..8], &zs[..8], &mut corners)
            .unwrap();

        // Build a mask of active corners, which determines cell topology,
        // vertex count, and active edges
        let mask = corners
            .iter()
            .enumerate()
            .filter(|(_i, &v)| v < 0.0)
            .fold(0, |acc, (i, _v)| acc | (1 << i)) as u8;

        // Early exit if the cell is entirely empty or full
        if mask == 0 {
            return Cell::Empty;
        } else if mask == 255 {
            return Cell::Full;
        }

        let edges: ArrayVec<DirectedEdge, 12> = CELL_TO_VERT_TO_EDGES
            [mask as usize]
            .iter()
            .flat_map(|vs| vs.iter().copied())
            .collect();
        let n = edges.len();

        // Bisect along each sign-changing edge to find the crossing,
        // batching all edges through the bulk evaluator at each round
        let mut lo: ArrayVec<Vector3<f32>, 12> =
            edges.iter().map(|e| cell.corner(e.start())).collect();
        let mut hi: ArrayVec<Vector3<f32>, 12> =
            edges.iter().map(|e| cell.corner(e.end())).collect();
        let mut values = [0.0; 12];
        for _ in 0..EDGE_SEARCH_DEPTH {
            for j in 0..n {
                let mid = (lo[j] + hi[j]) / 2.0;
                xs[j] = mid.x;
                ys[j] = mid.y;
                zs[j] = mid.z;
            }
            eval.eval_array(
                tape,
                &xs[..n],
                &ys[..n],
                &zs[..n],
                &mut values[..n],
            )
            .unwrap();
            for j in 0..n {
                let mid = Vector3::new(xs[j], ys[j], zs[j]);
                if values[j] < 0.0 {
                    lo[j] = mid;
                } else {
                    hi[j] = mid;
                }
            }
        }

        let pos: ArrayVec<Vector3<f32>, 12> = (0..n)
            .map(|j| (lo[j] + hi[j]) / 2.0)
            .collect();
        for (j, p) in pos.iter().enumerate() {
            xs[j] = p.x;
            ys[j] = p.y;
            zs[j] = p.z;
        }
        let mut grads = [crate::types::Grad::default(); 12];
        let mut ambiguous = [false; 12];
        eval.eval_deriv(
            tape,
            &xs[..n],
            &ys[..n],
            &zs[..n],
            &mut grads[..n],
            &mut ambiguous[..n],
        )
        .unwrap();

        let mut leaf = self.leaf_pool.get();
        leaf.corner_mask = mask;
        leaf.manifold = CORNERS_ARE_MANIFOLD[mask as usize];
        leaf.level = 0;

        for (j, e) in edges.iter().enumerate() {
            let mut samples = HermiteVec::new();
            if ambiguous[j] {
                // The gradient is multi-valued here (a min/max coincidence);
                // store one sample per compatible feature
                for f in eval.features_at(tape, pos[j]) {
                    samples.push(HermiteSample {
                        pos: pos[j],
                        norm: normalize_or_zero(f.deriv),
                        value: grads[j].v,
                    });
                }
            } else {
                samples.push(HermiteSample {
                    pos: pos[j],
                    norm: normalize_or_zero(grads[j].deriv()),
                    value: grads[j].v,
                });
            }
            leaf.intersections[e.index()] = Some(Arc::new(samples));
        }

        // One QEF per vertex group from the marching table
        let mut total = QuadraticErrorSolver::new();
        let mut rank = 0;
        let mut err = f32::INFINITY;
        for vs in CELL_TO_VERT_TO_EDGES[mask as usize].iter() {
            let mut qef = QuadraticErrorSolver::new();
            for e in vs.iter() {
                if let Some(samples) = &leaf.intersections[e.index()] {
                    for s in samples.iter() {
                        qef.add_intersection(s.pos, s.norm);
                    }
                }
            }
            let sol = qef.solve(&cell.bounds);
            leaf.verts.push(sol.vertex);
            rank = rank.max(sol.rank);
            err = err.min(sol.error);
            total += qef;
        }
        leaf.vertex_count = leaf.verts.len() as u8;
        leaf.rank = rank;
        leaf.qef_err = err;
        leaf.store_qef(&total);

        self.store_leaf(leaf)
    }

    /// Checks a cluster of eight children for completion, collapsing where
    /// topology and error allow
    ///
    /// Returns `None` if any child is still unpopulated (which only happens
    /// during multithreaded construction).
    ///
    /// # Panics
    /// `index` must be a multiple of 8, pointing at the start of a cluster.
    pub(crate) fn collect_children(
        &mut self,
        cell: CellIndex,
        index: usize,
        max_err: f32,
    ) -> Option<BranchResult> {
        assert_eq!(index % 8, 0);
        let cells = {
            let mut cells = [Cell::Invalid; 8];
            for (&c, o) in self.cells[index..index + 8].iter().zip(&mut cells)
            {
                *o = c.into();
            }
            cells
        };

        let mut full_count = 0;
        let mut empty_count = 0;
        let mut has_branch = false;
        for c in &cells {
            match c {
                Cell::Invalid => return None,
                Cell::Full => full_count += 1,
                Cell::Empty => empty_count += 1,
                Cell::Branch { .. } => has_branch = true,
                Cell::Leaf(..) => (),
            }
        }

        if full_count == 8 {
            return Some(BranchResult::Full);
        } else if empty_count == 8 {
            return Some(BranchResult::Empty);
        } else if has_branch {
            // Collapse never looks through grandchildren
            return Some(BranchResult::Branch(index));
        }

        let Some(mask) = self.collapsible(&cells) else {
            return Some(BranchResult::Branch(index));
        };

        // Candidate merged leaf: accumulate the children's QEFs and take
        // their intersections along the parent's boundary edges
        let mut qef = QuadraticErrorSolver::new();
        let mut level = 0u8;
        let mut merged = self.leaf_pool.get();
        for (i, c) in cells.iter().enumerate() {
            match c {
                Cell::Leaf(Leaf { index: li, .. }) => {
                    let child = &self.leafs[*li];
                    qef += child.qef();
                    level = level.max(child.level + 1);
                    for d in edges_from_child(i) {
                        if let Some(v) = &child.intersections[d] {
                            debug_assert!(merged.intersections[d].is_none());
                            merged.intersections[d] = Some(v.clone());
                        }
                    }
                }
                Cell::Empty | Cell::Full => level = level.max(1),
                _ => unreachable!(),
            }
        }

        let sol = qef.solve(&cell.bounds);
        if sol.error >= max_err {
            self.leaf_pool.put(merged);
            return Some(BranchResult::Branch(index));
        }

        merged.corner_mask = mask;
        merged.vertex_count = 1;
        merged.manifold = true;
        merged.rank = sol.rank;
        merged.level = level;
        merged.qef_err = sol.error;
        merged.verts.push(sol.vertex);
        merged.store_qef(&qef);

        for c in &cells {
            if let Cell::Leaf(Leaf { index, .. }) = c {
                self.release_leaf(*index);
            }
        }
        Some(BranchResult::Leaf(merged))
    }

    /// Checks whether a cluster of eight children can be merged without
    /// changing the topology of the extracted surface
    ///
    /// Every child must be a terminal or a manifold single-vertex leaf, the
    /// sign checks from "Dual Contouring of Hermite Data" (Ju et al, 2002)
    /// §4.1 must pass on shared edges, faces, and the center, and the merged
    /// corner configuration must itself be manifold (Gerstner et al, 2000).
    ///
    /// Returns the merged corner mask when collapsible.
    pub(crate) fn collapsible(&self, cells: &[Cell; 8]) -> Option<u8> {
        let mut mask = 0u8;
        for (i, &c) in cells.iter().enumerate() {
            let b = match c {
                Cell::Leaf(Leaf { mask, index }) => {
                    let leaf = &self.leafs[index];
                    if leaf.vertex_count != 1 || !leaf.manifold {
                        return None;
                    }
                    (mask & (1 << i) != 0) as u8
                }
                Cell::Empty => 0,
                Cell::Full => 1,
                Cell::Branch { .. } => return None,
                Cell::Invalid => panic!(),
            };
            mask |= b << i;
        }

        use super::frame::{Frame, XYZ, YZX, ZXY};
        for (t, u, v) in [XYZ::frame(), YZX::frame(), ZXY::frame()] {
            // The sign in the middle of a coarse edge must agree with the
            // sign of at least one of the edge's two endpoints.
            for i in 0..4 {
                let a = (u * ((i & 1) != 0)) | (v * ((i & 2) != 0));
                let b = a | t;
                let center = cells[a.index()].corner(b);

                if [a, b]
                    .iter()
                    .all(|v| ((mask & (1 << v.index())) != 0) != center)
                {
                    return None;
                }
            }

            // The sign in the middle of a coarse face must agree with the
            // sign of at least one of the face's four corners.
            for i in 0..2 {
                let a: Corner = t * (i == 1);
                let b = a | u;
                let c = a | v;
                let d = a | u | v;

                let center = cells[a.index()].corner(d);

                if [a, b, c, d]
                    .iter()
                    .all(|v| ((mask & (1 << v.index())) != 0) != center)
                {
                    return None;
                }
            }
        }

        // The sign in the middle of the coarse cell must agree with the
        // sign of at least one of its eight corners.
        let center = cells[0].corner(Corner::new(7));
        if (0..8).all(|v| ((mask & (1 << v)) != 0) != center) {
            return None;
        }

        if CORNERS_ARE_MANIFOLD[mask as usize] {
            Some(mask)
        } else {
            None
        }
    }
}

fn normalize_or_zero(v: Vector3<f32>) -> Vector3<f32> {
    let norm = v.norm();
    if norm > 1e-12 && norm.is_finite() {
        v / norm
    } else {
        Vector3::zeros()
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Tree;
    use crate::mesh::CancelToken;

    pub(crate) fn sphere(center: [f32; 3], radius: f32) -> Tree {
        let (x, y, z) = Tree::axes();
        ((x - center[0] as f64).square()
            + (y - center[1] as f64).square()
            + (z - center[2] as f64).square())
        .sqrt()
            - radius as f64
    }

    pub(crate) fn cube(
        bx: [f32; 2],
        by: [f32; 2],
        bz: [f32; 2],
    ) -> Tree {
        let (x, y, z) = Tree::axes();
        let x_bounds = (-x.clone() + bx[0] as f64).max(x - bx[1] as f64);
        let y_bounds = (-y.clone() + by[0] as f64).max(y - by[1] as f64);
        let z_bounds = (-z.clone() + bz[0] as f64).max(z - bz[1] as f64);
        x_bounds.max(y_bounds).max(z_bounds)
    }

    fn settings(depth: u8, threads: u8) -> Settings {
        let bounds = crate::region::Region::centered_cube(1.0);
        Settings {
            threads,
            bounds,
            // extent is 2, so 2 / 2^depth per cell edge
            resolution: 2.0 / f32::powi(2.0, depth as i32) + 1e-6,
            max_err: 1e-8,
            vars: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_empty_root() {
        let shape = sphere([2.0; 3], 0.1);
        let tape = shape.tape().unwrap();
        let octree = Octree::build(&tape, &settings(2, 0)).unwrap();
        assert_eq!(Cell::Empty, octree.cells[0].into());
        assert!(octree.verts.is_empty());
    }

    #[test]
    fn test_sphere_leaf_cells() {
        let shape = sphere([0.0; 3], 0.6);
        let tape = shape.tape().unwrap();
        let octree = Octree::build(&tape, &settings(1, 0)).unwrap();

        // The sphere's surface crosses all 8 subcells, so nothing collapses
        // to a terminal; count the leaf cells
        let Cell::Branch { index, .. } = octree.cells[0].into() else {
            panic!("root must be a branch");
        };
        for i in 0..8 {
            let c: Cell = octree.cells[index + i].into();
            assert!(matches!(c, Cell::Leaf(..)), "child {i} is {c:?}");
        }
    }

    #[test]
    fn test_empty_collapse() {
        // A sphere too small to be sampled at depth 1 collapses to Empty
        let shape = sphere([0.1; 3], 0.05);
        let tape = shape.tape().unwrap();
        for threads in [0, 4] {
            let octree =
                Octree::build(&tape, &settings(1, threads)).unwrap();
            assert_eq!(
                octree.cells[0],
                Cell::Empty.into(),
                "failed to collapse octree with {threads} threads"
            );
        }
    }

    #[test]
    fn test_plane_vertex() {
        // A plane's leaf vertex must land on the plane, at the mass point
        const EPSILON: f32 = 1e-3;
        for offset in [0.0, -0.2, 0.2] {
            let (x, y, z) = Tree::axes();
            let f = x * 0.25 + y * 0.5 + z + offset as f64;
            let tape = f.tape().unwrap();
            let octree = Octree::build(&tape, &settings(0, 0)).unwrap();

            let Cell::Leaf(Leaf { index, .. }) = octree.cells[0].into()
            else {
                panic!("root must be a leaf")
            };
            let info = octree.leafs[index];
            assert_eq!(info.rank, 1);

            let mut eval = Evaluator::new(&tape);
            let pos = octree.verts[info.vert_index].pos;
            let v = eval.eval_point(&tape, pos);
            assert!(
                v.abs() < EPSILON,
                "bad vertex position {pos:?} (value {v}, offset {offset})"
            );
        }
    }

    #[test]
    fn test_cube_ranks() {
        // An axis-aligned cube built from min/max: the QEF must report
        // rank 3 at corners, rank 2 along edges, and rank 1 on faces
        let shape = cube([-0.51, 0.52], [-0.53, 0.54], [-0.55, 0.56]);
        let tape = shape.tape().unwrap();
        let s = settings(3, 0);
        let octree = Octree::build(&tape, &s).unwrap();

        let mut ranks = [0usize; 4];
        let mut todo = vec![CellIndex::root(s.bounds)];
        while let Some(c) = todo.pop() {
            match octree.cell(c) {
                Cell::Branch { index, .. } => {
                    for i in Corner::iter() {
                        todo.push(c.child(index, i));
                    }
                }
                Cell::Leaf(Leaf { index, .. }) => {
                    ranks[octree.leafs[index].rank as usize] += 1;
                }
                _ => (),
            }
        }
        // All three ranks must be present: 8 corners, edges, faces
        assert!(ranks[3] >= 8, "expected at least 8 corner cells: {ranks:?}");
        assert!(ranks[2] > 0, "expected edge cells: {ranks:?}");
        assert!(ranks[1] > 0, "expected face cells: {ranks:?}");
    }

    #[test]
    fn test_collapsible() {
        fn build(shape: &Tree, depth: u8) -> (OctreeBuilder, Settings) {
            let tape = shape.tape().unwrap();
            let s = settings(depth, 0);
            let mut builder = OctreeBuilder::new(ObjectPool::default());
            let mut eval = Evaluator::new(&tape);
            builder.recurse(
                &mut eval,
                &tape,
                CellIndex::root(s.bounds),
                &s,
            );
            (builder, s)
        }

        // A sphere centered in the cell can't collapse (it has an interior
        // vertex, so the children disagree with any single merged cell)
        let (builder, _) = build(&sphere([0.0; 3], 0.5), 1);
        let cells: [Cell; 8] =
            std::array::from_fn(|i| builder.cells[8 + i].into());
        assert!(builder.collapsible(&cells).is_none());

        // A flat plane collapses; verify via the public result: the root
        // should be a single leaf with level > 0
        let plane = Tree::x() - 0.1;
        let (builder, _) = build(&plane, 2);
        let root: Cell = builder.cells[0].into();
        let Cell::Leaf(Leaf { index, .. }) = root else {
            panic!("plane should collapse to a leaf, got {root:?}");
        };
        assert!(builder.leafs[index].level > 0);
        assert!(builder.leafs[index].qef_err < 1e-8);

        // The same structure must survive finalization
        let octree = Octree::merge(vec![builder]);
        let Cell::Leaf(Leaf { index, .. }) = octree.cells[0].into() else {
            panic!("merge changed the root cell");
        };
        assert!(octree.leafs[index].level > 0);
    }

    #[test]
    fn test_collapse_error_threshold() {
        // With a tiny error budget, a curved surface must not collapse
        let shape = sphere([0.0; 3], 0.8);
        let tape = shape.tape().unwrap();
        let mut s = settings(3, 0);
        s.max_err = 1e-12;
        let octree = Octree::build(&tape, &s).unwrap();
        let Cell::Branch { .. } = octree.cells[0].into() else {
            panic!("sphere must not collapse to a single leaf");
        };
    }

    #[test]
    fn test_cancel() {
        let shape = sphere([0.0; 3], 0.6);
        let tape = shape.tape().unwrap();
        let mut s = settings(4, 0);
        s.cancel.cancel();
        assert!(matches!(
            Octree::build(&tape, &s),
            Err(Error::Cancelled)
        ));
    }
}
