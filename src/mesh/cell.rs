//! Cell storage for the dual-contouring octree
use super::{
    gen::CELL_TO_EDGE_TO_VERT,
    types::{Corner, Edge, Intersection},
};
use crate::region::Region;

/// Raw cell data, bit-packed into a `u64`
///
/// Unpack to a [`Cell`] to actually use it.  The top two bits select the
/// cell type; branches also carry the owning worker thread in the next 8
/// bits, so that partial octrees built on different threads can reference
/// each other until they are merged.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct CellData(u64);

impl From<Cell> for CellData {
    fn from(c: Cell) -> Self {
        let i = match c {
            Cell::Invalid => 0,
            Cell::Empty => 1,
            Cell::Full => 2,
            Cell::Branch { index, thread } => {
                debug_assert!((index as u64) < (1 << 54));
                (0b10 << 62) | ((thread as u64) << 54) | index as u64
            }
            Cell::Leaf(Leaf { mask, index }) => {
                debug_assert!((index as u64) < (1 << 54));
                (0b11 << 62) | ((mask as u64) << 54) | index as u64
            }
        };
        CellData(i)
    }
}

impl std::fmt::Debug for CellData {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        let c: Cell = (*self).into();
        c.fmt(f)
    }
}

/// Unpacked form of [`CellData`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Cell {
    /// The cell has been allocated but not yet populated
    Invalid,
    /// The cell is entirely outside the shape
    Empty,
    /// The cell is entirely inside the shape
    Full,
    /// The cell subdivides into eight children, starting at `index`
    Branch { index: usize, thread: u8 },
    /// The cell intersects the surface
    Leaf(Leaf),
}

impl Cell {
    /// Checks whether the given corner is empty (`false`) or full (`true`)
    ///
    /// # Panics
    /// If the cell is a branch or invalid
    pub fn corner(self, c: Corner) -> bool {
        let t = 1 << c.index();
        match self {
            Cell::Leaf(Leaf { mask, .. }) => mask & t != 0,
            Cell::Empty => false,
            Cell::Full => true,
            Cell::Branch { .. } | Cell::Invalid => panic!(),
        }
    }
}

impl From<CellData> for Cell {
    fn from(c: CellData) -> Self {
        let i = c.0;
        match i {
            0 => Cell::Invalid,
            1 => Cell::Empty,
            2 => Cell::Full,
            _ => {
                let index = (i & ((1 << 54) - 1)).try_into().unwrap();
                match (i >> 62) & 0b11 {
                    0b10 => Cell::Branch {
                        thread: (i >> 54) as u8,
                        index,
                    },
                    0b11 => Cell::Leaf(Leaf {
                        mask: (i >> 54) as u8,
                        index,
                    }),
                    _ => panic!("invalid cell encoding"),
                }
            }
        }
    }
}

/// An ambiguous cell, with vertex data stored out-of-line
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Leaf {
    /// Bitfield of filled corners
    pub mask: u8,
    /// Index of this leaf's payload
    pub index: usize,
}

impl Leaf {
    /// Returns the edge intersection for the given edge (if present)
    pub fn edge(&self, e: Edge) -> Option<Intersection> {
        CELL_TO_EDGE_TO_VERT[self.mask as usize][e.index()]
    }
}

/// A vertex positioned within a cell
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CellVertex {
    /// Position of this vertex
    pub pos: nalgebra::Vector3<f32>,
}

impl Default for CellVertex {
    fn default() -> Self {
        Self {
            pos: nalgebra::Vector3::new(f32::NAN, f32::NAN, f32::NAN),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Cell handle used during traversal
///
/// Cell bounds are not stored in the octree itself; they are rebuilt while
/// descending the tree.  `index` points to where this cell is stored in the
/// octree's cell array.
#[derive(Copy, Clone, Debug)]
pub struct CellIndex {
    pub index: usize,
    pub depth: usize,
    pub bounds: Region<3>,
}

impl CellIndex {
    /// Builds a handle for the root cell covering the given region
    pub fn root(bounds: Region<3>) -> Self {
        CellIndex {
            index: 0,
            depth: 0,
            bounds,
        }
    }

    /// Returns the position of the given corner
    pub fn corner(&self, i: Corner) -> nalgebra::Vector3<f32> {
        self.bounds.corner(i.index())
    }

    /// Returns a child cell handle for the given corner, with the child
    /// cluster rooted at `index`
    pub fn child<C: Into<Corner>>(&self, index: usize, i: C) -> Self {
        let i = i.into();
        CellIndex {
            index: index + i.index(),
            depth: self.depth + 1,
            bounds: self.bounds.child(i.index()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cell_encode_decode() {
        for c in [
            Cell::Empty,
            Cell::Invalid,
            Cell::Full,
            Cell::Branch {
                index: 12345,
                thread: 17,
            },
            Cell::Branch {
                index: 0x12340054322345,
                thread: 128,
            },
            Cell::Leaf(Leaf {
                index: 12345,
                mask: 0b101,
            }),
            Cell::Leaf(Leaf {
                index: 0x123400005432,
                mask: 0b11011010,
            }),
        ] {
            assert_eq!(c, Cell::from(CellData::from(c)));
        }
    }

    #[test]
    fn test_cell_corner() {
        let c = Cell::Empty;
        for i in Corner::iter() {
            assert!(!c.corner(i));
        }
        let c = Cell::Full;
        for i in Corner::iter() {
            assert!(c.corner(i));
        }
        let c = Cell::Leaf(Leaf {
            mask: 0b00000010,
            index: 0,
        });
        assert!(!c.corner(Corner::new(0)));
        assert!(c.corner(Corner::new(1)));
    }
}
