//! Dual walking: traversing the octree and emitting mesh primitives
//!
//! The walker recursively visits every interior face and edge of the
//! subdivision, gathering the cells incident to each feature (expanding
//! coarser cells to virtually fill finer neighborhoods) and emitting a fan
//! of triangles around every sign-changing edge.  The traversal is generic
//! over a [`DualMesher`] sink, so the same recursion drives both the
//! single-threaded builder and the work-stealing parallel walker.
use super::{
    cell::{Cell, CellIndex, CellVertex, Leaf},
    frame::{Frame, XYZ, YZX, ZXY},
    octree::Octree,
    types::{Corner, Edge, X, Y, Z},
    Mesh,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for the dual traversal
///
/// `cell`, `face`, and `edge` are continuation hooks: the serial mesher
/// recurses directly, while the parallel mesher queues tasks.  `vertex` and
/// `triangle` emit actual mesh data.
pub(crate) trait DualMesher {
    /// Index type for emitted vertices
    type VertexIndex: Copy;

    fn cell(&mut self, octree: &Octree, cell: CellIndex);
    fn face<F: Frame>(&mut self, octree: &Octree, a: CellIndex, b: CellIndex);
    fn edge<F: Frame>(
        &mut self,
        octree: &Octree,
        a: CellIndex,
        b: CellIndex,
        c: CellIndex,
        d: CellIndex,
    );

    /// Looks up or claims the mesh-vertex index for an octree vertex
    ///
    /// `v` is an absolute offset into the octree's vertex array; indices are
    /// assigned lazily, in walk order.
    fn vertex(&mut self, v: usize, verts: &[CellVertex]) -> Self::VertexIndex;

    /// Records a triangle with a clockwise winding, intersection vertex
    /// last
    fn triangle(
        &mut self,
        a: Self::VertexIndex,
        b: Self::VertexIndex,
        c: Self::VertexIndex,
    );
}

/// Recurses into a branch cell, visiting child cells, interior faces, and
/// interior edges
pub(crate) fn walk_cell<M: DualMesher>(
    octree: &Octree,
    cell: CellIndex,
    out: &mut M,
) {
    if let Cell::Branch { index, .. } = octree.cell(cell) {
        debug_assert_eq!(index % 8, 0);
        for i in Corner::iter() {
            out.cell(octree, cell.child(index, i));
        }

        fn walk_faces<T: Frame, M: DualMesher>(
            octree: &Octree,
            cell: CellIndex,
            index: usize,
            out: &mut M,
        ) {
            let (t, u, v) = T::frame();
            for c in [Corner::new(0), u.into(), v.into(), u | v] {
                out.face::<T>(
                    octree,
                    cell.child(index, c),
                    cell.child(index, c | t),
                );
            }
        }
        walk_faces::<XYZ, M>(octree, cell, index, out);
        walk_faces::<YZX, M>(octree, cell, index, out);
        walk_faces::<ZXY, M>(octree, cell, index, out);

        for i in [false, true] {
            out.edge::<XYZ>(
                octree,
                cell.child(index, X * i),
                cell.child(index, (X * i) | Y),
                cell.child(index, (X * i) | Y | Z),
                cell.child(index, (X * i) | Z),
            );
            out.edge::<YZX>(
                octree,
                cell.child(index, Y * i),
                cell.child(index, (Y * i) | Z),
                cell.child(index, (Y * i) | X | Z),
                cell.child(index, (Y * i) | X),
            );
            out.edge::<ZXY>(
                octree,
                cell.child(index, Z * i),
                cell.child(index, (Z * i) | X),
                cell.child(index, (Z * i) | X | Y),
                cell.child(index, (Z * i) | Y),
            );
        }
    }
}

/// Handles two cells sharing a common face
///
/// `lo` is below `hi` on the `T` axis; the cells share a `UV` face, where
/// `T-U-V` forms a right-handed coordinate system.
pub(crate) fn walk_face<T: Frame, M: DualMesher>(
    octree: &Octree,
    lo: CellIndex,
    hi: CellIndex,
    out: &mut M,
) {
    if octree.is_leaf(lo) && octree.is_leaf(hi) {
        return;
    }
    let (t, u, v) = T::frame();
    out.face::<T>(octree, octree.child(lo, t), octree.child(hi, Corner::new(0)));
    out.face::<T>(octree, octree.child(lo, t | u), octree.child(hi, u));
    out.face::<T>(octree, octree.child(lo, t | v), octree.child(hi, v));
    out.face::<T>(
        octree,
        octree.child(lo, t | u | v),
        octree.child(hi, u | v),
    );
    for i in [false, true] {
        out.edge::<T::Next>(
            octree,
            octree.child(lo, (u * i) | t),
            octree.child(lo, (u * i) | v | t),
            octree.child(hi, (u * i) | v),
            octree.child(hi, u * i),
        );
        out.edge::<<T::Next as Frame>::Next>(
            octree,
            octree.child(lo, (v * i) | t),
            octree.child(hi, v * i),
            octree.child(hi, (v * i) | u),
            octree.child(lo, (v * i) | u | t),
        );
    }
}

/// Handles four cells sharing a common edge aligned on axis `T`
///
/// Cells are in the order `[0, U, U | V, V]`, i.e. a right-handed winding
/// about `+T` (where `T-U-V` is a right-handed coordinate frame):
///
/// - `walk_edge::<X>` is `[0, Y, Y | Z, Z]`
/// - `walk_edge::<Y>` is `[0, Z, Z | X, X]`
/// - `walk_edge::<Z>` is `[0, X, X | Y, Y]`
pub(crate) fn walk_edge<T: Frame, M: DualMesher>(
    octree: &Octree,
    a: CellIndex,
    b: CellIndex,
    c: CellIndex,
    d: CellIndex,
    out: &mut M,
) {
    let cs = [a, b, c, d];
    if !cs.iter().all(|v| octree.is_leaf(*v)) {
        let (t, u, v) = T::frame();
        for i in [false, true] {
            out.edge::<T>(
                octree,
                octree.child(a, (t * i) | u | v),
                octree.child(b, (t * i) | v),
                octree.child(c, t * i),
                octree.child(d, (t * i) | u),
            )
        }
        return;
    }

    // If any of the leaves are empty or full, then this edge can't include
    // a sign change
    let leafs = cs.map(|cell| match octree.cell(cell) {
        Cell::Leaf(leaf) => Some(leaf),
        Cell::Empty | Cell::Full => None,
        Cell::Branch { .. } => unreachable!(),
        Cell::Invalid => panic!(),
    });
    if leafs.iter().any(Option::is_none) {
        return;
    }
    let leafs = leafs.map(Option::unwrap);

    let deepest = (0..4).max_by_key(|i| cs[*i].depth).unwrap();

    let (t, _u, _v) = T::frame();

    // Each cell of the quartet touches the shared edge at a different
    // (u, v) offset
    #[allow(clippy::identity_op)]
    let edges = [
        Edge::new((t.index() * 4 + 3) as u8),
        Edge::new((t.index() * 4 + 2) as u8),
        Edge::new((t.index() * 4 + 0) as u8),
        Edge::new((t.index() * 4 + 1) as u8),
    ];

    let corner_sign =
        |leaf: Leaf, c: Corner| leaf.mask & (1 << c.index()) != 0;

    // Find the starting sign of the relevant edge, bailing out early if
    // there's no sign change.  All of the deepest cells' edges see the same
    // transition, so any of them works here.
    let starting_sign = {
        let (start, end) = edges[deepest].corners();
        let start = corner_sign(leafs[deepest], start);
        let end = corner_sign(leafs[deepest], end);
        if start == end {
            return;
        }
        start
    };

    // Pick each cell's vertex for this edge
    let mut verts = [None; 4];
    for i in 0..4 {
        if cs[i].depth == cs[deepest].depth {
            let (start, end) = edges[i].corners();
            debug_assert_eq!(corner_sign(leafs[i], start), starting_sign);
            debug_assert_eq!(corner_sign(leafs[i], end), !starting_sign);
            verts[i] = leafs[i].edge(edges[i]);
        } else {
            // A coarser cell neighboring finer cells must be manifold, so
            // it has a single vertex shared by all of its edges
            let mut iter = (0..12).filter_map(|j| leafs[i].edge(Edge::new(j)));
            verts[i] = iter.next();
            if iter.any(|other| other.vert != verts[i].unwrap().vert) {
                panic!("invalid multi-vertex neighbor at {:?}", cs[i]);
            }
        }
    }
    let verts = verts.map(Option::unwrap);

    // The intersection vertex comes from the deepest cell
    let i = out.vertex(
        octree.leafs[leafs[deepest].index].vert_index
            + verts[deepest].edge.0 as usize,
        &octree.verts,
    );
    let mut vert = |j: usize| {
        out.vertex(
            octree.leafs[leafs[j].index].vert_index + verts[j].vert.0 as usize,
            &octree.verts,
        )
    };
    let vs = [vert(0), vert(1), vert(2), vert(3)];

    // Pick the triangle winding depending on the edge direction, skipping
    // degenerate triangles where a coarse cell appears more than once
    let winding = if starting_sign { 3 } else { 1 };
    for j in 0..4 {
        if cs[j].index != cs[(j + winding) % 4].index {
            out.triangle(vs[j], vs[(j + winding) % 4], i)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Single-threaded mesher, accumulating into a [`Mesh`]
#[derive(Default)]
pub(crate) struct MeshBuilder {
    /// Map from octree vertex indices to mesh vertex indices
    ///
    /// `usize::MAX` marks an unmapped vertex.
    map: Vec<usize>,
    out: Mesh,
}

impl MeshBuilder {
    pub fn take(self) -> Mesh {
        self.out
    }
}

impl DualMesher for MeshBuilder {
    type VertexIndex = usize;

    fn cell(&mut self, octree: &Octree, cell: CellIndex) {
        walk_cell(octree, cell, self);
    }

    fn face<F: Frame>(&mut self, octree: &Octree, a: CellIndex, b: CellIndex) {
        walk_face::<F, _>(octree, a, b, self)
    }

    fn edge<F: Frame>(
        &mut self,
        octree: &Octree,
        a: CellIndex,
        b: CellIndex,
        c: CellIndex,
        d: CellIndex,
    ) {
        walk_edge::<F, _>(octree, a, b, c, d, self)
    }

    fn vertex(&mut self, v: usize, verts: &[CellVertex]) -> usize {
        if v >= self.map.len() {
            self.map.resize(v + 1, usize::MAX);
        }
        match self.map[v] {
            usize::MAX => {
                let next_vert = self.out.vertices.len();
                self.out.vertices.push(verts[v].pos);
                self.map[v] = next_vert;
                next_vert
            }
            u => u,
        }
    }

    fn triangle(&mut self, a: usize, b: usize, c: usize) {
        self.out.triangles.push(nalgebra::Vector3::new(a, b, c))
    }
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
enum Task {
    Cell(CellIndex),
    FaceXYZ(CellIndex, CellIndex),
    FaceYZX(CellIndex, CellIndex),
    FaceZXY(CellIndex, CellIndex),
    EdgeXYZ(CellIndex, CellIndex, CellIndex, CellIndex),
    EdgeYZX(CellIndex, CellIndex, CellIndex, CellIndex),
    EdgeZXY(CellIndex, CellIndex, CellIndex, CellIndex),
}

/// Multithreaded mesher
///
/// The traversal is partitioned through work-stealing queues; vertices are
/// claimed through a shared atomic array and emitted into per-thread
/// buffers, which are stitched together (with index fixup) at the end.
pub(crate) struct DualWorker<'a> {
    /// Global index of this worker thread
    thread_index: usize,

    octree: &'a Octree,

    /// Map from octree vertex index to claimed mesh vertex
    ///
    /// Entries start at 0; a thread claims a vertex with a compare-exchange.
    /// A claimed entry has the top bit set, the thread index in the next 8
    /// bits, and an index into that thread's vertex buffer in the rest.
    map: &'a [AtomicU64],

    tris: Vec<nalgebra::Vector3<u64>>,
    verts: Vec<nalgebra::Vector3<f32>>,

    queue: super::pool::QueuePool<Task>,
}

impl<'a> DualWorker<'a> {
    pub fn scheduler(
        octree: &Octree,
        root: CellIndex,
        threads: usize,
    ) -> Mesh {
        let queues = super::pool::QueuePool::new(threads);
        let map = octree
            .verts
            .iter()
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>();

        let mut workers = queues
            .into_iter()
            .enumerate()
            .map(|(thread_index, queue)| DualWorker {
                thread_index,
                octree,
                map: &map,
                queue,
                tris: vec![],
                verts: vec![],
            })
            .collect::<Vec<_>>();
        workers[0].queue.push(Task::Cell(root));

        let pool = &super::pool::ThreadPool::new(threads);
        let out: Vec<_> = std::thread::scope(|s| {
            let mut handles = vec![];
            for w in workers {
                handles.push(s.spawn(move || w.run(pool)));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Calculate per-thread offsets within the merged mesh
        let mut vert_offsets = vec![0];
        for (_, verts) in &out {
            let i = vert_offsets.last().unwrap();
            vert_offsets.push(i + verts.len());
        }

        let mut mesh = Mesh::default();
        mesh.vertices.reserve(*vert_offsets.last().unwrap());
        mesh.triangles
            .reserve(out.iter().map(|(t, _)| t.len()).sum());

        for (tris, verts) in out {
            mesh.vertices.extend(verts);
            mesh.triangles.extend(tris.into_iter().map(|t| {
                t.map(|v| {
                    let thread = ((v >> 55) & 0xFF) as usize;
                    let i: usize = (v & ((1 << 55) - 1)).try_into().unwrap();
                    vert_offsets[thread] + i
                })
            }));
        }
        mesh
    }

    pub fn run(
        mut self,
        pool: &super::pool::ThreadPool,
    ) -> (Vec<nalgebra::Vector3<u64>>, Vec<nalgebra::Vector3<f32>>) {
        let mut ctx = pool.start(self.thread_index);

        loop {
            if let Some(task) = self.queue.pop() {
                match task {
                    Task::Cell(i) => walk_cell(self.octree, i, &mut self),
                    Task::FaceXYZ(a, b) => {
                        walk_face::<XYZ, _>(self.octree, a, b, &mut self)
                    }
                    Task::FaceYZX(a, b) => {
                        walk_face::<YZX, _>(self.octree, a, b, &mut self)
                    }
                    Task::FaceZXY(a, b) => {
                        walk_face::<ZXY, _>(self.octree, a, b, &mut self)
                    }
                    Task::EdgeXYZ(a, b, c, d) => {
                        walk_edge::<XYZ, _>(self.octree, a, b, c, d, &mut self)
                    }
                    Task::EdgeYZX(a, b, c, d) => {
                        walk_edge::<YZX, _>(self.octree, a, b, c, d, &mut self)
                    }
                    Task::EdgeZXY(a, b, c, d) => {
                        walk_edge::<ZXY, _>(self.octree, a, b, c, d, &mut self)
                    }
                };

                if self.queue.changed() {
                    ctx.wake();
                }
                continue;
            }

            if !ctx.sleep() {
                break;
            }
        }

        (self.tris, self.verts)
    }
}

impl DualMesher for DualWorker<'_> {
    // One byte is reserved for the thread index, so indices are u64 even on
    // 32-bit platforms
    type VertexIndex = u64;

    fn cell(&mut self, _octree: &Octree, cell: CellIndex) {
        self.queue.push(Task::Cell(cell));
    }

    fn face<F: Frame>(&mut self, _octree: &Octree, a: CellIndex, b: CellIndex) {
        match F::frame().0 {
            X => self.queue.push(Task::FaceXYZ(a, b)),
            Y => self.queue.push(Task::FaceYZX(a, b)),
            Z => self.queue.push(Task::FaceZXY(a, b)),
            _ => unreachable!(),
        }
    }

    fn edge<F: Frame>(
        &mut self,
        _octree: &Octree,
        a: CellIndex,
        b: CellIndex,
        c: CellIndex,
        d: CellIndex,
    ) {
        match F::frame().0 {
            X => self.queue.push(Task::EdgeXYZ(a, b, c, d)),
            Y => self.queue.push(Task::EdgeYZX(a, b, c, d)),
            Z => self.queue.push(Task::EdgeZXY(a, b, c, d)),
            _ => unreachable!(),
        }
    }

    /// Claims the given octree vertex for this thread, or returns another
    /// thread's claimed index
    fn vertex(&mut self, v: usize, verts: &[CellVertex]) -> u64 {
        let mut next = self.verts.len() as u64;
        assert!(next < (1 << 55));
        next |= 1 << 63;
        next |= (self.thread_index as u64) << 55;

        match self.map[v].compare_exchange(
            0,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                self.verts.push(verts[v].pos);
                next
            }
            Err(i) => i,
        }
    }

    fn triangle(&mut self, a: u64, b: u64, c: u64) {
        self.tris.push(nalgebra::Vector3::new(a, b, c))
    }
}
