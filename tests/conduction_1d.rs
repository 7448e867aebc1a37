mod common;

use common::host_db;
use dfmatrix::solver::assembly::{EquationSystem, Gamma, LaplacianBoundary};
use dfmatrix::solver::mesh::BoxMesh;
use dfmatrix::{MatrixDataBase, SolverConfig};

/// Assembles `-laplacian(T) = 0` on `n` unit cells with `T = 0` and `T = n`
/// at the ends. Returns the data base and the synced equation.
fn assemble(n: usize) -> (MatrixDataBase, EquationSystem) {
    let input = BoxMesh::channel_1d(n).generate();
    let nbf = input.num_boundary_faces();
    let x_max = input.patch_sizes[0];
    let (_device, mut db) = host_db(input, &SolverConfig::default());

    let gamma = db.allocate_scalar("gamma", n).unwrap();
    let boundary_gamma = db.allocate_scalar("boundary_gamma", nbf).unwrap();
    let boundary_t = db.allocate_scalar("boundary_t", nbf).unwrap();
    db.upload(gamma, &vec![1.0; n]).unwrap();
    db.upload_boundary(boundary_gamma, &vec![1.0; nbf], 1).unwrap();
    let mut t_b = vec![0.0; nbf];
    t_b[x_max] = n as f64;
    db.upload_boundary(boundary_t, &t_b, 1).unwrap();

    let patch = db.mesh.velocity_patch;
    let mut eqn = EquationSystem::new(&mut db, "TEqn", 1).unwrap();
    eqn.initialize_time_step(&mut db).unwrap();
    eqn.fvm_laplacian(
        &mut db,
        Gamma::Cell(gamma),
        boundary_gamma,
        LaplacianBoundary::Patch {
            patch,
            value: boundary_t,
        },
        -1.0,
    )
    .unwrap();
    eqn.add_to_source(&mut db, None).unwrap();
    eqn.sync(&mut db).unwrap();
    (db, eqn)
}

#[test]
fn three_cell_matrix_matches_hand_assembly() {
    let (db, eqn) = assemble(3);
    let values = db.download(eqn.system().values).unwrap();
    let source = db.download(eqn.system().source).unwrap();
    let diag: Vec<f64> = db.topology().diag_index().iter().map(|&k| values[k as usize]).collect();
    assert_eq!(diag, vec![3.0, 2.0, 3.0]);
    for row in 0..3 {
        for k in db.topology().row_range(row) {
            if k != db.topology().diag_index()[row] as usize {
                assert_eq!(values[k], -1.0);
            }
        }
    }
    assert_eq!(source, vec![0.0, 0.0, 6.0]);
}

#[test]
fn three_cell_profile_is_linear() {
    let (mut db, mut eqn) = assemble(3);
    let stats = eqn.solve(&mut db, &SolverConfig::default().energy).unwrap();
    assert!(stats[0].converged);
    let mut t = vec![0.0; 3];
    eqn.update_psi(&db, &mut t).unwrap();
    for (got, want) in t.iter().zip([0.5, 1.5, 2.5]) {
        assert!((got - want).abs() < 1e-6, "{t:?}");
    }
}

#[test]
fn longer_channel_with_cg() {
    let n = 25;
    let (mut db, mut eqn) = assemble(n);
    let config = SolverConfig::default().pressure;
    let stats = eqn.solve(&mut db, &config).unwrap();
    assert!(stats[0].converged);
    let mut t = vec![0.0; n];
    eqn.update_psi(&db, &mut t).unwrap();
    for (i, v) in t.iter().enumerate() {
        assert!((v - (i as f64 + 0.5)).abs() < 1e-6);
    }
    let solve = db.metrics().get_location_stats("bridge:solve").unwrap();
    assert_eq!(solve.call_count, 1);
}
