use std::sync::Arc;

use dfmatrix::solver::assembly::{EnergyEquation, MomentumEquation, MomentumInputs};
use dfmatrix::solver::database::{check_vector_equal, EnergyInputs, FlowInputs};
use dfmatrix::solver::gpu::{ComputeDevice, HostDevice, WgpuDevice};
use dfmatrix::solver::mesh::{BoxMesh, MeshInput};
use dfmatrix::{MatrixDataBase, SolverConfig};

struct Assembled {
    momentum_values: Vec<f64>,
    momentum_source: Vec<f64>,
    energy_values: Vec<f64>,
    energy_source: Vec<f64>,
    a: Vec<f64>,
}

fn run(device: Arc<dyn ComputeDevice>, input: &MeshInput) -> Assembled {
    let n = input.num_cells;
    let ns = input.num_surfaces();
    let nbf = input.num_boundary_faces();
    let ramp = |len: usize, scale: f64| -> Vec<f64> { (0..len).map(|i| 1.0 + scale * (i % 7) as f64).collect() };

    let mut db = MatrixDataBase::new(device, input.clone(), &SolverConfig::default()).unwrap();
    let (rho, rho_old, u_old) = (ramp(n, 0.01), ramp(n, 0.02), ramp(3 * n, 0.1));
    let (phi, boundary_phi) = (ramp(ns, -0.05), ramp(nbf, 0.03));
    let (p, boundary_p, boundary_u) = (ramp(n, 0.5), ramp(nbf, 0.5), ramp(3 * nbf, 0.1));
    let (boundary_rho, nu_eff, boundary_nu_eff) = (ramp(nbf, 0.01), ramp(n, 0.001), ramp(nbf, 0.001));
    db.prepare_flow(&FlowInputs {
        rho_old: &rho_old,
        rho: &rho,
        phi: &phi,
        boundary_phi: &boundary_phi,
        boundary_rho: &boundary_rho,
        p: &p,
        boundary_p: &boundary_p,
        u_old: &u_old,
        boundary_u: &boundary_u,
        nu_eff: &nu_eff,
        boundary_nu_eff: &boundary_nu_eff,
    })
    .unwrap();

    let mut momentum = MomentumEquation::new(&mut db).unwrap();
    momentum.assemble(&mut db, &MomentumInputs::default()).unwrap();
    let a = momentum.a(&mut db).unwrap();

    let (he_old, k, k_old) = (ramp(n, 2.0), ramp(n, 0.1), ramp(n, 0.05));
    let (alpha_eff, dpdt, diff_corr_flux) = (ramp(n, 0.01), ramp(n, 1.0), ramp(3 * n, 0.2));
    let (boundary_he, boundary_k, boundary_alpha_eff) = (ramp(nbf, 2.0), ramp(nbf, 0.1), ramp(nbf, 0.01));
    let (boundary_gradient, boundary_diff_corr_flux) = (ramp(nbf, -0.3), ramp(3 * nbf, 0.2));
    let mut energy = EnergyEquation::new(&mut db).unwrap();
    energy
        .assemble(
            &mut db,
            &EnergyInputs {
                he_old: &he_old,
                k: &k,
                k_old: &k_old,
                alpha_eff: &alpha_eff,
                dpdt: &dpdt,
                diff_corr_flux: &diff_corr_flux,
                boundary_he: &boundary_he,
                boundary_k: &boundary_k,
                boundary_alpha_eff: &boundary_alpha_eff,
                boundary_gradient: &boundary_gradient,
                boundary_diff_corr_flux: &boundary_diff_corr_flux,
            },
        )
        .unwrap();

    let (ms, es) = (*momentum.equation().system(), *energy.equation().system());
    Assembled {
        momentum_values: db.download(ms.values).unwrap(),
        momentum_source: db.download(ms.source).unwrap(),
        energy_values: db.download(es.values).unwrap(),
        energy_source: db.download(es.source).unwrap(),
        a,
    }
}

#[test]
fn wgpu_assembly_matches_host() {
    let gpu = match WgpuDevice::new() {
        Ok(device) => device,
        Err(err) => {
            eprintln!("skipping: {err}");
            return;
        }
    };
    let input = BoxMesh::new(5, 4, 3, nalgebra::Vector3::new(1.0, 0.8, 0.6)).generate();
    let host = run(Arc::new(HostDevice::new()), &input);
    let device = run(Arc::new(gpu), &input);

    // summation order may differ between backends; compare against the field's scale
    for (name, h, d) in [
        ("UEqn values", &host.momentum_values, &device.momentum_values),
        ("UEqn source", &host.momentum_source, &device.momentum_source),
        ("EEqn values", &host.energy_values, &device.energy_values),
        ("EEqn source", &host.energy_source, &device.energy_source),
    ] {
        let scale = h.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let err = h.iter().zip(d).fold(0.0f64, |m, (a, b)| m.max((a - b).abs()));
        assert_eq!(h.len(), d.len(), "{name}");
        assert!(err <= 1e-10 * scale, "{name}: max error {err:e} at scale {scale:e}");
    }
    assert!(check_vector_equal(&host.a, &device.a, 1e-10));
}
