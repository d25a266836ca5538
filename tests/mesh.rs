//! End-to-end meshing tests
use nalgebra::Vector3;
use std::collections::BTreeMap;
use whittle::{
    context::Tree,
    eval::Evaluator,
    mesh::{self, Mesh, Settings},
    region::Region,
};

fn sphere(center: [f64; 3], radius: f64) -> Tree {
    let (x, y, z) = Tree::axes();
    ((x - center[0]).square()
        + (y - center[1]).square()
        + (z - center[2]).square())
    .sqrt()
        - radius
}

fn cube(bx: [f64; 2], by: [f64; 2], bz: [f64; 2]) -> Tree {
    let (x, y, z) = Tree::axes();
    let x_bounds = (-x.clone() + bx[0]).max(x - bx[1]);
    let y_bounds = (-y.clone() + by[0]).max(y - by[1]);
    let z_bounds = (-z.clone() + bz[0]).max(z - bz[1]);
    x_bounds.max(y_bounds).max(z_bounds)
}

fn check_for_vertex_dupes(mesh: &Mesh) -> Result<(), String> {
    let mut verts = mesh.vertices.clone();
    verts.sort_by_key(|k| (k.x.to_bits(), k.y.to_bits(), k.z.to_bits()));
    for i in 1..verts.len() {
        if verts[i - 1] == verts[i] {
            return Err(format!("duplicate vertices at {}", verts[i]));
        }
    }
    Ok(())
}

fn check_for_edge_matching(mesh: &Mesh) -> Result<(), String> {
    let mut edges: BTreeMap<_, usize> = BTreeMap::new();
    for t in &mesh.triangles {
        for edge in [(t.x, t.y), (t.y, t.z), (t.z, t.x)] {
            if t.x == t.y || t.y == t.z || t.x == t.z {
                return Err("triangle with duplicate edges".to_string());
            }
            *edges.entry(edge).or_default() += 1;
        }
    }
    for (&(a, b), &i) in &edges {
        if i != 1 {
            return Err(format!(
                "duplicate edge ({a}, {b}) between {:?} {:?}",
                mesh.vertices[a], mesh.vertices[b]
            ));
        }
        if !edges.contains_key(&(b, a)) {
            return Err("unpaired edges".to_owned());
        }
    }
    Ok(())
}

fn settings(resolution: f32, threads: u8) -> Settings {
    Settings {
        threads,
        bounds: Region::centered_cube(2.0),
        resolution,
        max_err: 1e-8,
        ..Settings::default()
    }
}

#[test]
fn test_sphere_roundtrip() {
    let shape = sphere([0.0; 3], 1.0);
    let tape = shape.tape().unwrap();
    for threads in [0, 8] {
        let s = settings(0.1, threads);
        let mesh = mesh::render(&tape, &s).unwrap();
        assert!(!mesh.triangles.is_empty());

        // Every vertex must be within a cell's length of the true surface
        for v in &mesh.vertices {
            let r = v.norm();
            assert!(
                (r - 1.0).abs() < 0.1,
                "vertex {v:?} too far from the sphere (r = {r})"
            );
        }

        // The mesh must be closed and manifold
        if let Err(e) = check_for_vertex_dupes(&mesh) {
            panic!("{e} (with {threads} threads)");
        }
        if let Err(e) = check_for_edge_matching(&mesh) {
            panic!("{e} (with {threads} threads)");
        }
    }
}

#[test]
fn test_sphere_vertex_count() {
    // Dual contouring puts roughly one vertex per surface-crossing cell, so
    // the count should be near (surface area) / (cell edge)^2
    let shape = sphere([0.0; 3], 1.0);
    let tape = shape.tape().unwrap();
    let s = settings(0.1, 0);
    let mesh = mesh::render(&tape, &s).unwrap();

    // Cell edge at depth 6 over [-2, 2] is 0.0625
    // The mesh holds one vertex per crossed cell plus one per crossed
    // edge (roughly one more per cell), so allow a generous band around
    // the cell-count estimate
    let cell = 4.0 / 64.0f32;
    let expected = 4.0 * std::f32::consts::PI / (cell * cell);
    let count = mesh.vertices.len() as f32;
    assert!(
        count > expected * 0.5 && count < expected * 3.0,
        "vertex count {count} too far from estimate {expected}"
    );
}

#[test]
fn test_cube_collapse() {
    // An axis-aligned cube collapses its flat faces; the mesh should use
    // far fewer triangles than the raw grid would produce, while staying
    // closed
    let shape = cube([-1.0, 1.0], [-1.0, 1.0], [-1.0, 1.0]);
    let tape = shape.tape().unwrap();
    let mut s = settings(0.1, 0);
    s.max_err = 1e-4;
    let mesh = mesh::render(&tape, &s).unwrap();
    assert!(!mesh.triangles.is_empty());

    if let Err(e) = check_for_edge_matching(&mesh) {
        panic!("collapsed cube mesh is not closed: {e}");
    }

    // All vertices on the cube surface
    for v in &mesh.vertices {
        let d = v.x.abs().max(v.y.abs()).max(v.z.abs());
        assert!((d - 1.0).abs() < 0.05, "vertex {v:?} off the cube");
    }

    // The raw grid would produce ~2 triangles per boundary cell; collapse
    // should do much better on flat faces
    let cells_per_face = (2.0f32 / 0.0625).powi(2);
    let raw_estimate = 6.0 * cells_per_face * 2.0;
    assert!(
        (mesh.triangles.len() as f32) < raw_estimate / 2.0,
        "expected collapse to reduce triangle count, got {}",
        mesh.triangles.len()
    );
}

#[test]
fn test_csg_difference() {
    // Sphere with a cylindrical hole: max(-(x^2+y^2+z^2-1), x^2+y^2-0.25)
    // is the complement form; meshing the equivalent difference must stay
    // manifold
    let (x, y, z) = Tree::axes();
    let sphere_sq = x.square() + y.square() + z.square() - 1.0;
    let cylinder = x.square() + y.square() - 0.25;
    let shape = sphere_sq.max(-cylinder);
    let tape = shape.tape().unwrap();

    let s = settings(0.1, 0);
    let mesh = mesh::render(&tape, &s).unwrap();
    assert!(!mesh.triangles.is_empty());
    if let Err(e) = check_for_edge_matching(&mesh) {
        panic!("CSG difference mesh is not closed: {e}");
    }
}

#[test]
fn test_empty_region() {
    // A region entirely outside the shape produces no triangles
    let shape = sphere([10.0; 3], 0.5);
    let tape = shape.tape().unwrap();
    for threads in [0, 4] {
        let mesh = mesh::render(&tape, &settings(0.25, threads)).unwrap();
        assert!(mesh.triangles.is_empty());
        assert!(mesh.vertices.is_empty());
    }
}

#[test]
fn test_threaded_matches_serial_topology() {
    // Vertex indices differ across thread counts, but the surface must
    // have the same size and stay closed
    let shape = sphere([0.1, 0.2, -0.1], 0.8);
    let tape = shape.tape().unwrap();
    let serial = mesh::render(&tape, &settings(0.1, 0)).unwrap();
    let threaded = mesh::render(&tape, &settings(0.1, 8)).unwrap();
    assert_eq!(serial.vertices.len(), threaded.vertices.len());
    assert_eq!(serial.triangles.len(), threaded.triangles.len());
    check_for_edge_matching(&serial).unwrap();
    check_for_edge_matching(&threaded).unwrap();
}

#[test]
fn test_mesh_values_near_zero() {
    // Sampled at mesh vertices, the field should be close to zero
    let shape = sphere([0.0; 3], 0.9);
    let tape = shape.tape().unwrap();
    let mesh = mesh::render(&tape, &settings(0.1, 0)).unwrap();
    let mut eval = Evaluator::new(&tape);
    for v in &mesh.vertices {
        let d = eval.eval_point(&tape, Vector3::new(v.x, v.y, v.z));
        assert!(d.abs() < 0.05, "field value {d} too large at {v:?}");
    }
}

#[test]
fn test_render_with_vars() {
    // A variable-radius sphere: the same tape meshes at whatever radius
    // the settings carry
    let (x, y, z) = Tree::axes();
    let r = Tree::var("r");
    let shape = (x.square() + y.square() + z.square()).sqrt() - r;
    let tape = shape.tape().unwrap();

    for radius in [0.5f32, 1.2] {
        let mut s = settings(0.1, 0);
        s.vars = vec![("r".to_owned(), radius)];
        let mesh = mesh::render(&tape, &s).unwrap();
        assert!(!mesh.triangles.is_empty());
        for v in &mesh.vertices {
            assert!(
                (v.norm() - radius).abs() < 0.1,
                "vertex {v:?} is off the radius-{radius} sphere"
            );
        }
    }

    // With no vars set, the radius is zero and nothing is emitted
    let mesh = mesh::render(&tape, &settings(0.1, 0)).unwrap();
    assert!(mesh.triangles.is_empty());
}

#[test]
fn test_stl_output() {
    let shape = sphere([0.0; 3], 1.0);
    let tape = shape.tape().unwrap();
    let mesh = mesh::render(&tape, &settings(0.25, 0)).unwrap();
    let mut out = vec![];
    mesh.write_stl(&mut out).unwrap();
    assert_eq!(out.len(), 84 + 50 * mesh.triangles.len());
}
