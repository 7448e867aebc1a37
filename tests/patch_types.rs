mod common;

use std::sync::Arc;

use common::host_db;
use dfmatrix::solver::boundary::{PatchType, PatchTypeNames};
use dfmatrix::solver::error::{Error, TopologyError};
use dfmatrix::solver::gpu::{ComputeDevice, HostDevice};
use dfmatrix::solver::mesh::{BoxMesh, MeshInput};
use dfmatrix::{MatrixDataBase, SolverConfig};
use nalgebra::Vector3;

fn case(velocity: &[&str], species: &[&str]) -> MeshInput {
    let mut input = BoxMesh::new(3, 2, 2, Vector3::new(1.5, 1.0, 1.0)).generate();
    input.patch_types = PatchTypeNames {
        velocity: velocity.iter().map(|s| s.to_string()).collect(),
        species: species.iter().map(|s| s.to_string()).collect(),
    };
    input
}

fn expand(types: &[PatchType], sizes: &[usize]) -> Vec<u32> {
    types
        .iter()
        .zip(sizes)
        .flat_map(|(ty, &size)| std::iter::repeat(ty.gpu_id()).take(size))
        .collect()
}

#[test]
fn case_built_from_patch_type_names() {
    let input = case(
        &["fixedValue", "zeroGradient", "cyclic", "processor", "empty", "calculated"],
        &["fixedValue", "zero_gradient", "zeroGradient", "zeroGradient", "empty", "empty"],
    );
    let sizes = input.patch_sizes.clone();
    let (_device, db) = host_db(input, &SolverConfig::default());

    use PatchType::*;
    let velocity = expand(&[FixedValue, ZeroGradient, Coupled, Coupled, Empty, FixedValue], &sizes);
    let species = expand(&[FixedValue, ZeroGradient, ZeroGradient, ZeroGradient, Empty, Empty], &sizes);
    let table = db.patch_table();
    assert_eq!(table.velocity.iter().map(|t| t.gpu_id()).collect::<Vec<_>>(), velocity);
    assert_eq!(table.species.iter().map(|t| t.gpu_id()).collect::<Vec<_>>(), species);

    let topo = db.topology().clone();
    assert_eq!(
        db.download_index(db.mesh.velocity_patch).unwrap(),
        topo.permute_boundary_values(&velocity, 1)
    );
    assert_eq!(
        db.download_index(db.mesh.species_patch).unwrap(),
        topo.permute_boundary_values(&species, 1)
    );
}

#[test]
fn unknown_patch_type_fails_before_allocating() {
    let input = case(
        &["fixedValue", "zeroGradient", "slip", "zeroGradient", "empty", "empty"],
        &["zeroGradient"; 6],
    );
    let device = Arc::new(HostDevice::new());
    let err = MatrixDataBase::new(device.clone(), input, &SolverConfig::default())
        .err()
        .expect("construction must fail");
    match err {
        Error::Topology(TopologyError::UnknownPatchType { patch, name }) => {
            assert_eq!(patch, 2);
            assert_eq!(name, "slip");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn patch_count_must_match_the_mesh() {
    let input = case(&["fixedValue"; 5], &["zeroGradient"; 6]);
    let device = Arc::new(HostDevice::new());
    let result = MatrixDataBase::new(device.clone(), input, &SolverConfig::default());
    assert!(matches!(result, Err(Error::Topology(TopologyError::SizeMismatch { .. }))));
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn per_patch_values_and_types_upload_in_grouped_order() {
    let input = BoxMesh::new(3, 2, 2, Vector3::new(1.5, 1.0, 1.0)).generate();
    let sizes = input.patch_sizes.clone();
    let (_device, mut db) = host_db(input, &SolverConfig::default());

    let patches: Vec<Vec<f64>> = sizes
        .iter()
        .enumerate()
        .map(|(p, &size)| (0..3 * size).map(|i| (10 * p + i) as f64).collect())
        .collect();
    let slices: Vec<&[f64]> = patches.iter().map(Vec::as_slice).collect();
    let host: Vec<f64> = patches.concat();
    let dst = db.flow.boundary_u;
    db.upload_patches(dst, &slices, 3).unwrap();
    let topo = db.topology().clone();
    let grouped = db.download(dst).unwrap();
    assert_eq!(topo.unpermute_boundary_values(&grouped, 3), host);

    // one patch short of the mesh
    assert!(db.upload_patches(dst, &slices[1..], 3).is_err());

    let names = ["zeroGradient", "fixedValue", "empty", "empty", "coupled", "zeroGradient"];
    let tags = db.allocate_patch_types("pressure_patch_type", &names).unwrap();
    use PatchType::*;
    let expected = expand(&[ZeroGradient, FixedValue, Empty, Empty, Coupled, ZeroGradient], &sizes);
    assert_eq!(db.download_index(tags).unwrap(), topo.permute_boundary_values(&expected, 1));
    assert!(db.allocate_patch_types("pressure_patch_type", &["fixedValue"]).is_err());
}
