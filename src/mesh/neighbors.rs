//! Neighbor lookup across subdivision boundaries
//!
//! Given a cell and a direction (toward a face, edge, or corner of that
//! cell), [`Octree::neighbor`] returns the adjacent cell at equal or coarser
//! level.  The walk never descends below the query cell's depth: dual
//! contouring recurses into finer neighbors through the walker instead, so a
//! coarser result is always the right answer here.
//!
//! The lookup reconstructs the cell's corner path from the parent table,
//! offsets it along the requested axes (ascending exactly as far as the
//! carry propagates, then descending through mirrored child indices), and
//! walks back down from the deepest shared ancestor.
use super::{
    cell::{Cell, CellIndex},
    octree::Octree,
};

/// Direction toward one of the 26 neighbors of a cell
///
/// Each axis moves by -1, 0, or +1 cells; the all-zero direction is not a
/// valid neighbor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NeighborDir([i8; 3]);

impl NeighborDir {
    /// Builds a new direction
    ///
    /// # Panics
    /// If any component is outside `{-1, 0, 1}`, or all are zero
    pub fn new(d: [i8; 3]) -> Self {
        assert!(d.iter().all(|v| (-1..=1).contains(v)));
        assert!(d != [0; 3]);
        Self(d)
    }

    /// Iterates over all 26 directions
    pub fn iter() -> impl Iterator<Item = NeighborDir> {
        (0..27).filter(|&i| i != 13).map(|i| {
            NeighborDir([i % 3 - 1, (i / 3) % 3 - 1, (i / 9) % 3 - 1])
        })
    }

    /// Iterates over the six face directions
    pub fn faces() -> impl Iterator<Item = NeighborDir> {
        [
            [-1, 0, 0],
            [1, 0, 0],
            [0, -1, 0],
            [0, 1, 0],
            [0, 0, -1],
            [0, 0, 1],
        ]
        .into_iter()
        .map(NeighborDir)
    }
}

impl Octree {
    /// Returns the corner path from the root to the given cell
    ///
    /// Each entry is a corner index (0-7); the first entry is the child of
    /// the root.
    fn path_to(&self, cell: CellIndex) -> Vec<u8> {
        let mut path = vec![];
        let mut i = cell.index;
        while self.parents[i] != u32::MAX {
            // Clusters are 8-aligned, so the corner is the index within the
            // cluster
            path.push((i % 8) as u8);
            i = self.parents[i] as usize;
        }
        debug_assert_eq!(i, 0, "cell is not connected to the root");
        path.reverse();
        path
    }

    /// Looks up the neighbor of `cell` in direction `d`
    ///
    /// Returns `None` if the neighbor would fall outside the octree, and the
    /// neighboring cell (at equal or coarser level) otherwise.
    pub(crate) fn neighbor(
        &self,
        cell: CellIndex,
        d: NeighborDir,
        root: CellIndex,
    ) -> Option<CellIndex> {
        let mut path = self.path_to(cell);
        debug_assert_eq!(path.len(), cell.depth);

        // Per-axis binary add/subtract over the corner path, from the
        // deepest bit up.  The carry stopping is equivalent to ascending to
        // the first ancestor that contains the move; the bit flips below it
        // mirror the descent on the far side.
        for axis in 0..3 {
            match d.0[axis] {
                0 => continue,
                dir => {
                    let bit = 1u8 << axis;
                    let mut ok = false;
                    for c in path.iter_mut().rev() {
                        let set = *c & bit != 0;
                        *c ^= bit;
                        // Moving up flips set bits until an unset one
                        // absorbs the carry (and mirrored for moving down)
                        if set != (dir > 0) {
                            ok = true;
                            break;
                        }
                    }
                    if !ok {
                        // The carry escaped the root
                        return None;
                    }
                }
            }
        }

        // Descend from the root along the new path, stopping early at
        // leaves and terminals (the neighbor at a coarser level)
        let mut out = root;
        for c in path {
            match self.cell(out) {
                Cell::Branch { index, .. } => {
                    out = out.child(index, super::types::Corner::new(c));
                }
                Cell::Invalid => panic!("invalid cell in neighbor walk"),
                _ => break,
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        context::Tree,
        mesh::{cell::Leaf, types::Corner, CancelToken, Settings},
        region::Region,
    };

    fn sphere_octree(depth: u8) -> (Octree, Settings) {
        let (x, y, z) = Tree::axes();
        let shape = (x.square() + y.square() + z.square()).sqrt() - 0.7;
        let tape = shape.tape().unwrap();
        let settings = Settings {
            threads: 0,
            bounds: Region::centered_cube(1.0),
            resolution: 2.0 / f32::powi(2.0, depth as i32) + 1e-6,
            max_err: 1e-8,
            vars: Vec::new(),
            cancel: CancelToken::new(),
        };
        (Octree::build(&tape, &settings).unwrap(), settings)
    }

    fn collect_leafs(
        octree: &Octree,
        cell: CellIndex,
        out: &mut Vec<CellIndex>,
    ) {
        match octree.cell(cell) {
            Cell::Branch { index, .. } => {
                for i in Corner::iter() {
                    collect_leafs(octree, cell.child(index, i), out);
                }
            }
            Cell::Leaf(..) => out.push(cell),
            _ => (),
        }
    }

    #[test]
    fn test_neighbor_direction_count() {
        assert_eq!(NeighborDir::iter().count(), 26);
        assert_eq!(NeighborDir::faces().count(), 6);
    }

    #[test]
    fn test_face_neighbors_are_symmetric() {
        let (octree, s) = sphere_octree(3);
        let root = CellIndex::root(s.bounds);
        let mut leafs = vec![];
        collect_leafs(&octree, root, &mut leafs);
        assert!(!leafs.is_empty());

        for &cell in &leafs {
            for (d, rev) in [
                ([1, 0, 0], [-1, 0, 0]),
                ([0, 1, 0], [0, -1, 0]),
                ([0, 0, 1], [0, 0, -1]),
            ] {
                let Some(n) =
                    octree.neighbor(cell, NeighborDir::new(d), root)
                else {
                    continue;
                };
                // Neighbors are at equal-or-coarser depth
                assert!(n.depth <= cell.depth);

                // Walking back from an equal-depth neighbor returns home
                if n.depth == cell.depth {
                    let back = octree
                        .neighbor(n, NeighborDir::new(rev), root)
                        .unwrap();
                    assert_eq!(back.index, cell.index);
                }
            }
        }
    }

    #[test]
    fn test_neighbor_signs_agree() {
        // Corner samples on a shared face must agree between neighbors:
        // for the +X neighbor, our corners with the X bit set match the
        // neighbor's corners with the X bit clear
        let (octree, s) = sphere_octree(3);
        let root = CellIndex::root(s.bounds);
        let mut leafs = vec![];
        collect_leafs(&octree, root, &mut leafs);

        for &cell in &leafs {
            let Cell::Leaf(Leaf { mask, .. }) = octree.cell(cell) else {
                unreachable!()
            };
            let Some(n) =
                octree.neighbor(cell, NeighborDir::new([1, 0, 0]), root)
            else {
                continue;
            };
            if n.depth != cell.depth {
                // A coarser neighbor's corners aren't corners of our face
                continue;
            }
            let n_cell = octree.cell(n);
            if matches!(n_cell, Cell::Branch { .. }) {
                continue;
            }
            for c in Corner::iter().filter(|c| *c & super::super::types::X) {
                let ours = mask & (1 << c.index()) != 0;
                let flipped = Corner::new((c.index() ^ 1) as u8);
                let theirs = n_cell.corner(flipped);
                assert_eq!(
                    ours, theirs,
                    "sign mismatch between {cell:?} and {n:?}"
                );
            }
        }
    }

    #[test]
    fn test_edge_of_octree() {
        let (octree, s) = sphere_octree(2);
        let root = CellIndex::root(s.bounds);

        // A cell on the -X boundary has no -X neighbor
        let Cell::Branch { index, .. } = octree.cell(root) else {
            panic!("root must branch")
        };
        let child = root.child(index, Corner::new(0));
        assert!(octree
            .neighbor(child, NeighborDir::new([-1, 0, 0]), root)
            .is_none());
        assert!(octree
            .neighbor(child, NeighborDir::new([1, 0, 0]), root)
            .is_some());
    }
}
