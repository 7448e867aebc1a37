mod common;

use common::{host_db, EnergyState, FlowState};
use dfmatrix::solver::assembly::{EnergyEquation, SpeciesEquation};
use dfmatrix::solver::database::SpeciesInputs;
use dfmatrix::solver::mesh::{BoxMesh, MeshInput};
use dfmatrix::{MatrixDataBase, SolverConfig};
use nalgebra::Vector3;

#[test]
fn adiabatic_energy_balances_kinetic_energy_and_pressure_work() {
    let input = BoxMesh::channel_1d(6).generate();
    let config = SolverConfig::default();
    let (_device, mut db) = host_db(input.clone(), &config);
    db.prepare_flow(&FlowState::uniform(&input, Vector3::zeros()).inputs())
        .unwrap();

    let mut energy = EnergyState::uniform(&input, 1.0);
    energy.k = vec![0.5; input.num_cells];
    energy.k_old = vec![0.2; input.num_cells];
    energy.dpdt = vec![3.0; input.num_cells];

    let mut eqn = EnergyEquation::new(&mut db).unwrap();
    eqn.assemble(&mut db, &energy.inputs()).unwrap();
    assert!(eqn.solve(&mut db).unwrap().converged);
    let mut he = vec![0.0; input.num_cells];
    eqn.update_psi(&db, &mut he).unwrap();

    let expected = 1.0 + config.delta_t * 3.0 - (0.5 - 0.2);
    for (i, v) in he.iter().enumerate() {
        assert!((v - expected).abs() < 1e-8, "cell {i}: {v} vs {expected}");
    }
}

fn species_case(y0: f64) -> (MeshInput, MatrixDataBase, SpeciesEquation) {
    let input = BoxMesh::new(4, 3, 2, Vector3::new(1.0, 1.0, 1.0))
        .with_species(1)
        .generate();
    let (_device, mut db) = host_db(input.clone(), &SolverConfig::default());
    db.prepare_flow(&FlowState::uniform(&input, Vector3::new(1.0, 0.0, 0.0)).inputs())
        .unwrap();
    let (n, nbf) = (input.num_cells, input.num_boundary_faces());
    db.prepare_species(&SpeciesInputs {
        y: &[vec![y0; n]],
        rho_d: &[vec![1e-2; n]],
        boundary_y: &[vec![y0; nbf]],
        boundary_rho_d: &[vec![1e-2; nbf]],
    })
    .unwrap();
    let eqn = SpeciesEquation::new(&mut db).unwrap();
    (input, db, eqn)
}

#[test]
fn uniform_mass_fraction_is_preserved_by_divergence_free_flux() {
    let (input, mut db, mut eqn) = species_case(0.3);
    assert_eq!(eqn.num_species(), 1);
    eqn.assemble(&mut db, 0, None).unwrap();
    assert!(eqn.solve(&mut db, 0).unwrap().converged);
    let mut y = vec![0.0; input.num_cells];
    eqn.update_psi(&db, 0, &mut y).unwrap();
    for v in y {
        assert!((v - 0.3).abs() < 1e-9);
    }
}

#[test]
fn positive_source_raises_mass_fraction() {
    let (input, mut db, mut eqn) = species_case(0.3);
    let rate = vec![10.0; input.num_cells];
    eqn.assemble(&mut db, 0, Some(&rate)).unwrap();
    eqn.solve(&mut db, 0).unwrap();
    let mut y = vec![0.0; input.num_cells];
    eqn.update_psi(&db, 0, &mut y).unwrap();
    let expected = 0.3 + db.config().delta_t * 10.0;
    for v in y {
        assert!(v > 0.3);
        assert!((v - expected).abs() < 1e-9);
    }
}

#[test]
fn short_species_source_is_rejected() {
    let (_input, mut db, mut eqn) = species_case(0.1);
    assert!(eqn.assemble(&mut db, 0, Some(&[1.0])).is_err());
}
