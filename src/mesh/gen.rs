//! Build-time generated tables for Manifold Dual Contouring
//!
//! See `build.rs` for how these are constructed.
use super::types::{Corner, DirectedEdge, Intersection, Offset};

include!(concat!(env!("OUT_DIR"), "/mdc_tables.rs"));

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vert_edge_tables_agree() {
        for mask in 0..256usize {
            let mut edge_count = 0;
            for (vert, edges) in CELL_TO_VERT_TO_EDGES[mask].iter().enumerate()
            {
                for e in edges.iter() {
                    // Every edge in the vertex table starts inside and ends
                    // outside
                    assert!(mask & (1 << e.start().index()) != 0);
                    assert!(mask & (1 << e.end().index()) == 0);

                    // And the edge table points back at the right vertex
                    let i = CELL_TO_EDGE_TO_VERT[mask]
                        [e.to_undirected().index()]
                    .unwrap();
                    assert_eq!(i.vert.0 as usize, vert);
                    edge_count += 1;
                }
            }
            // Intersection offsets follow the vertex offsets
            let vert_count = CELL_TO_VERT_TO_EDGES[mask].len();
            let mut offsets: Vec<usize> = CELL_TO_EDGE_TO_VERT[mask]
                .iter()
                .flatten()
                .map(|i| i.edge.0 as usize)
                .collect();
            offsets.sort();
            assert_eq!(offsets.len(), edge_count);
            for (i, o) in offsets.into_iter().enumerate() {
                assert_eq!(o, vert_count + i);
            }
        }
    }

    #[test]
    fn test_manifold_table() {
        // Empty and full cells are trivially manifold
        assert!(CORNERS_ARE_MANIFOLD[0]);
        assert!(CORNERS_ARE_MANIFOLD[255]);

        // A single corner is manifold
        assert!(CORNERS_ARE_MANIFOLD[0b0000_0001]);

        // Two diagonally-opposite corners are not
        assert!(!CORNERS_ARE_MANIFOLD[0b1000_0001]);

        // A face diagonal is not manifold either
        assert!(!CORNERS_ARE_MANIFOLD[0b0000_1001]);

        // A full face is fine
        assert!(CORNERS_ARE_MANIFOLD[0b0000_1111]);

        // Manifold configurations are exactly the single-vertex,
        // edge-connected ones; cross-check against the vertex table
        for mask in 1..255usize {
            if CORNERS_ARE_MANIFOLD[mask] {
                assert_eq!(
                    CELL_TO_VERT_TO_EDGES[mask].len(),
                    1,
                    "manifold mask {mask:#010b} has multiple patches"
                );
            }
        }
    }
}
