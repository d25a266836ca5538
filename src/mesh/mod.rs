//! Octree construction and meshing
//!
//! This module implements
//! [Manifold Dual Contouring](https://people.engr.tamu.edu/schaefer/research/dualsimp_tvcg.pdf)
//! to generate a triangle mesh from an implicit surface.
//!
//! The resulting meshes should be
//! - Manifold
//! - Watertight
//! - Preserving sharp features (corners / edges)
//!
//! However, they may contain self-intersections, and are not guaranteed to
//! catch thin features (below the sampling grid resolution).
//!
//! Here's a full example:
//!
//! ```
//! use whittle::{context::Tree, mesh::{self, Settings}, region::Region};
//!
//! let (x, y, z) = Tree::axes();
//! let sphere = (x.square() + y.square() + z.square()).sqrt() - 0.6;
//! let tape = sphere.tape()?;
//! let settings = Settings {
//!     bounds: Region::centered_cube(1.0),
//!     resolution: 0.1,
//!     ..Settings::default()
//! };
//! let mesh = mesh::render(&tape, &settings)?;
//! assert!(!mesh.triangles.is_empty());
//!
//! // Open a file to write, e.g.
//! // let mut f = std::fs::File::create("out.stl")?;
//! # let mut f = vec![];
//! mesh.write_stl(&mut f)?;
//! # Ok::<(), whittle::Error>(())
//! ```
pub(crate) mod cell;
mod dual;
mod frame;
mod gen;
mod neighbors;
mod octree;
mod output;
mod pool;
mod qef;
mod worker;

#[doc(hidden)]
pub mod types;

pub use neighbors::NeighborDir;
pub use octree::Octree;
pub use qef::QuadraticErrorSolver;

use crate::{error::Error, region::Region, tape::Tape};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// An indexed 3D mesh
#[derive(Default, Debug)]
pub struct Mesh {
    /// Triangles, as indexes into [`self.vertices`](Self::vertices)
    pub triangles: Vec<nalgebra::Vector3<usize>>,
    /// Vertex positions
    pub vertices: Vec<nalgebra::Vector3<f32>>,
}

impl Mesh {
    /// Builds a new empty mesh
    pub fn new() -> Self {
        Self::default()
    }
}

/// Cancellation flag shared between a caller and a running build
///
/// Workers poll the token at task boundaries; once cancelled, the build
/// winds down and returns [`Error::Cancelled`] without publishing a partial
/// result.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Builds a new (uncancelled) token
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Checks whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Settings when building an octree and mesh
#[derive(Clone, Debug)]
pub struct Settings {
    /// Number of worker threads to use
    ///
    /// 0 indicates to use the single-threaded evaluator; other values spin
    /// up that many threads for octree construction and dual walking.
    pub threads: u8,

    /// Region to mesh over
    pub bounds: Region<3>,

    /// Minimum cell edge length
    ///
    /// Subdivision continues until every cell edge is at or below this
    /// length.
    pub resolution: f32,

    /// QEF residual threshold for collapsing cells
    pub max_err: f32,

    /// Values for named variables in the tape
    ///
    /// Names not present in the tape are ignored; unlisted variables
    /// evaluate as zero.
    pub vars: Vec<(String, f32)>,

    /// Cooperative cancellation flag
    pub cancel: CancelToken,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads: 8,
            bounds: Region::centered_cube(1.0),
            resolution: 0.05,
            max_err: 1e-6,
            vars: vec![],
            cancel: CancelToken::new(),
        }
    }
}

impl Settings {
    /// Subdivision depth implied by the bounds and resolution
    pub fn depth(&self) -> u8 {
        self.bounds.depth_for(self.resolution)
    }
}

impl Octree {
    /// Recursively walks the dual of the octree, building a mesh
    pub fn walk_dual(&self, settings: &Settings) -> Mesh {
        let root = cell::CellIndex::root(settings.bounds);
        let mesh = if settings.threads == 0 {
            let mut out = dual::MeshBuilder::default();
            use dual::DualMesher;
            out.cell(self, root);
            out.take()
        } else {
            dual::DualWorker::scheduler(self, root, settings.threads as usize)
        };
        log::trace!(
            "walked dual: {} vertices, {} triangles",
            mesh.vertices.len(),
            mesh.triangles.len()
        );
        mesh
    }
}

/// Builds a mesh from the given tape
///
/// This is the all-in-one entry point: it constructs the octree over
/// `settings.bounds` (possibly in parallel), then walks its dual to emit an
/// indexed triangle mesh.
pub fn render(tape: &Tape, settings: &Settings) -> Result<Mesh, Error> {
    let octree = Octree::build(tape, settings)?;
    Ok(octree.walk_dual(settings))
}
