//! Isosurface extraction for implicit surfaces
//!
//! `whittle` turns a scalar field (a signed-distance-like function built as
//! an expression tree) into a polygonal mesh, using Manifold Dual
//! Contouring over an adaptive octree:
//!
//! - expressions are lowered to flat [`tape`](crate::tape)s, which interval
//!   evaluation can *shorten* per region, skipping branches of `min` / `max`
//!   that cannot win there
//! - ambiguous regions subdivide (possibly across worker threads) down to
//!   the target resolution; leaf cells position vertices by minimizing a
//!   quadratic error function over surface samples
//! - cells collapse back together where topology and error allow, and a
//!   dual walk connects the surviving vertices into triangles
//!
//! ```
//! use whittle::{context::Tree, mesh};
//!
//! let (x, y, z) = Tree::axes();
//! let sphere = (x.square() + y.square() + z.square()).sqrt() - 0.6;
//! let tape = sphere.tape()?;
//! let mesh = mesh::render(&tape, &mesh::Settings::default())?;
//! assert!(!mesh.triangles.is_empty());
//! # Ok::<(), whittle::Error>(())
//! ```
pub mod context;
pub mod contour;
pub mod eval;
pub mod mesh;
pub mod region;
pub mod tape;
pub mod types;

mod error;
pub use error::Error;
