use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use dfmatrix::solver::assembly::{MomentumEquation, MomentumInputs};
use dfmatrix::solver::database::FlowInputs;
use dfmatrix::solver::gpu::HostDevice;
use dfmatrix::solver::mesh::BoxMesh;
use dfmatrix::solver::topology::MatrixTopology;
use dfmatrix::{MatrixDataBase, SolverConfig};
use nalgebra::Vector3;

fn assembly_benchmark(c: &mut Criterion) {
    let mesh = BoxMesh::new(20, 20, 20, Vector3::new(1.0, 1.0, 1.0)).generate();
    let n = mesh.num_cells;
    let nbf = mesh.num_boundary_faces();

    let mut group = c.benchmark_group("assembly");
    group.sample_size(10);
    group.bench_function("topology_build", |b| {
        b.iter(|| {
            MatrixTopology::build(n, &mesh.owner, &mesh.neighbour, &mesh.boundary_face_cell).unwrap();
        });
    });

    let mut db = MatrixDataBase::new(Arc::new(HostDevice::new()), mesh.clone(), &SolverConfig::default()).unwrap();
    let phi: Vec<f64> = mesh.sf.chunks(3).map(|s| s[0]).collect();
    let boundary_phi: Vec<f64> = mesh.boundary_sf.chunks(3).map(|s| s[0]).collect();
    let u: Vec<f64> = (0..3 * n).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();
    let boundary_u: Vec<f64> = (0..3 * nbf).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();
    let (ones, boundary_ones) = (vec![1.0; n], vec![1.0; nbf]);
    let (nu, boundary_nu) = (vec![1e-3; n], vec![1e-3; nbf]);
    let p: Vec<f64> = (0..n).map(|i| i as f64 * 1e-3).collect();
    db.prepare_flow(&FlowInputs {
        rho_old: &ones,
        rho: &ones,
        phi: &phi,
        boundary_phi: &boundary_phi,
        boundary_rho: &boundary_ones,
        p: &p,
        boundary_p: &boundary_ones,
        u_old: &u,
        boundary_u: &boundary_u,
        nu_eff: &nu,
        boundary_nu_eff: &boundary_nu,
    })
    .unwrap();
    let mut momentum = MomentumEquation::new(&mut db).unwrap();

    group.bench_function("momentum_assemble", |b| {
        b.iter(|| {
            momentum.assemble(&mut db, &MomentumInputs::default()).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, assembly_benchmark);
criterion_main!(benches);
