//! Mesh hand-off consumed by the data base, and a structured box generator
//! used by the tests, the benchmark and the demo binary.

use nalgebra::Vector3;

use crate::solver::boundary::{PatchType, PatchTypeNames};

/// Flat geometry and connectivity, in the host solver's native orders:
/// internal faces in face order, boundary faces concatenated patch by patch.
#[derive(Debug, Clone, Default)]
pub struct MeshInput {
    pub num_cells: usize,
    pub owner: Vec<u32>,
    pub neighbour: Vec<u32>,
    pub volume: Vec<f64>,
    /// Owner interpolation weight per internal face.
    pub weight: Vec<f64>,
    pub mag_sf: Vec<f64>,
    pub delta_coeffs: Vec<f64>,
    /// Face area vectors, owner -> neighbour, three per face.
    pub sf: Vec<f64>,
    pub boundary_face_cell: Vec<u32>,
    /// Outward boundary area vectors, three per face.
    pub boundary_sf: Vec<f64>,
    pub boundary_mag_sf: Vec<f64>,
    pub boundary_delta_coeffs: Vec<f64>,
    pub boundary_weight: Vec<f64>,
    pub patch_names: Vec<String>,
    pub patch_sizes: Vec<usize>,
    /// Boundary condition type names per patch, resolved by the data base.
    pub patch_types: PatchTypeNames,
    pub num_species: usize,
}

impl MeshInput {
    pub fn num_surfaces(&self) -> usize {
        self.owner.len()
    }

    pub fn num_boundary_faces(&self) -> usize {
        self.boundary_face_cell.len()
    }
}

/// The six sides of a box, in patch order.
pub const BOX_PATCHES: [&str; 6] = ["xmin", "xmax", "ymin", "ymax", "zmin", "zmax"];

/// Uniform hexahedral block. Cell `(i, j, k)` has index `i + nx*(j + ny*k)`.
#[derive(Debug, Clone)]
pub struct BoxMesh {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub size: Vector3<f64>,
    /// Patch types for `BOX_PATCHES`, velocity row then species row.
    pub velocity_patches: [PatchType; 6],
    pub species_patches: [PatchType; 6],
    pub num_species: usize,
}

impl BoxMesh {
    pub fn new(nx: usize, ny: usize, nz: usize, size: Vector3<f64>) -> Self {
        Self {
            nx,
            ny,
            nz,
            size,
            velocity_patches: [PatchType::FixedValue; 6],
            species_patches: [PatchType::ZeroGradient; 6],
            num_species: 0,
        }
    }

    /// `n` unit cubes along x. The x ends are fixed value and the lateral
    /// sides are empty, so the case is one-dimensional.
    pub fn channel_1d(n: usize) -> Self {
        let mut mesh = Self::new(n, 1, 1, Vector3::new(n as f64, 1.0, 1.0));
        mesh.velocity_patches = [
            PatchType::FixedValue,
            PatchType::FixedValue,
            PatchType::Empty,
            PatchType::Empty,
            PatchType::Empty,
            PatchType::Empty,
        ];
        mesh.species_patches = [
            PatchType::FixedValue,
            PatchType::ZeroGradient,
            PatchType::Empty,
            PatchType::Empty,
            PatchType::Empty,
            PatchType::Empty,
        ];
        mesh
    }

    pub fn with_species(mut self, num_species: usize) -> Self {
        self.num_species = num_species;
        self
    }

    pub fn num_cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    pub fn spacing(&self) -> Vector3<f64> {
        self.size
            .component_div(&Vector3::new(self.nx as f64, self.ny as f64, self.nz as f64))
    }

    pub fn cell_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.nx * (j + self.ny * k)
    }

    pub fn cell_centre(&self, cell: usize) -> Vector3<f64> {
        let i = cell % self.nx;
        let j = (cell / self.nx) % self.ny;
        let k = cell / (self.nx * self.ny);
        let h = self.spacing();
        Vector3::new(
            (i as f64 + 0.5) * h.x,
            (j as f64 + 0.5) * h.y,
            (k as f64 + 0.5) * h.z,
        )
    }

    pub fn generate(&self) -> MeshInput {
        let h = self.spacing();
        let dims = [self.nx, self.ny, self.nz];
        // face area normal to each axis
        let area = Vector3::new(h.y * h.z, h.x * h.z, h.x * h.y);
        let volume = h.x * h.y * h.z;
        let n = self.num_cells();

        let mut mesh = MeshInput {
            num_cells: n,
            volume: vec![volume; n],
            num_species: self.num_species,
            ..MeshInput::default()
        };

        // Internal faces in upper-triangular order: each cell lists its +x, +y, +z neighbours.
        for k in 0..self.nz {
            for j in 0..self.ny {
                for i in 0..self.nx {
                    let cell = self.cell_index(i, j, k);
                    let ijk = [i, j, k];
                    for axis in 0..3 {
                        if ijk[axis] + 1 >= dims[axis] {
                            continue;
                        }
                        let mut next = ijk;
                        next[axis] += 1;
                        let neighbour = self.cell_index(next[0], next[1], next[2]);
                        let normal = Vector3::ith(axis, 1.0);
                        mesh.owner.push(cell as u32);
                        mesh.neighbour.push(neighbour as u32);
                        mesh.weight.push(0.5);
                        mesh.mag_sf.push(area[axis]);
                        mesh.delta_coeffs.push(1.0 / h[axis]);
                        mesh.sf.extend((normal * area[axis]).iter());
                    }
                }
            }
        }

        for (patch, name) in BOX_PATCHES.iter().enumerate() {
            let axis = patch / 2;
            let high = patch % 2 == 1;
            let layer = if high { dims[axis] - 1 } else { 0 };
            let normal = Vector3::ith(axis, if high { 1.0 } else { -1.0 });
            let ty = self.velocity_patches[patch];
            let start = mesh.boundary_face_cell.len();
            for k in 0..self.nz {
                for j in 0..self.ny {
                    for i in 0..self.nx {
                        if [i, j, k][axis] != layer {
                            continue;
                        }
                        mesh.boundary_face_cell.push(self.cell_index(i, j, k) as u32);
                        mesh.boundary_sf.extend((normal * area[axis]).iter());
                        mesh.boundary_mag_sf.push(area[axis]);
                        mesh.boundary_delta_coeffs.push(2.0 / h[axis]);
                        mesh.boundary_weight.push(if ty == PatchType::Coupled { 0.5 } else { 1.0 });
                    }
                }
            }
            let size = mesh.boundary_face_cell.len() - start;
            mesh.patch_names.push(name.to_string());
            mesh.patch_sizes.push(size);
        }
        mesh.patch_types = PatchTypeNames::from_types(&self.velocity_patches, &self.species_patches);

        log::debug!(
            "box mesh {}x{}x{}: {} cells, {} internal faces, {} boundary faces",
            self.nx,
            self.ny,
            self.nz,
            n,
            mesh.num_surfaces(),
            mesh.num_boundary_faces()
        );
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_face_counts() {
        let mesh = BoxMesh::new(3, 2, 2, Vector3::new(3.0, 2.0, 2.0)).generate();
        assert_eq!(mesh.num_cells, 12);
        // (nx-1)*ny*nz + nx*(ny-1)*nz + nx*ny*(nz-1)
        assert_eq!(mesh.num_surfaces(), 8 + 6 + 6);
        assert_eq!(mesh.num_boundary_faces(), 2 * (4 + 6 + 6));
        assert_eq!(mesh.patch_sizes, vec![4, 4, 6, 6, 6, 6]);
        assert!(mesh.owner.iter().zip(&mesh.neighbour).all(|(o, n)| o < n));
    }

    #[test]
    fn closed_cells_sum_to_zero_area() {
        let mesh = BoxMesh::new(2, 3, 1, Vector3::new(1.0, 1.5, 0.5)).generate();
        let mut sum = vec![Vector3::<f64>::zeros(); mesh.num_cells];
        for f in 0..mesh.num_surfaces() {
            let s = Vector3::from_column_slice(&mesh.sf[3 * f..3 * f + 3]);
            sum[mesh.owner[f] as usize] += s;
            sum[mesh.neighbour[f] as usize] -= s;
        }
        for b in 0..mesh.num_boundary_faces() {
            sum[mesh.boundary_face_cell[b] as usize] +=
                Vector3::from_column_slice(&mesh.boundary_sf[3 * b..3 * b + 3]);
        }
        for s in sum {
            assert!(s.norm() < 1e-12);
        }
    }

    #[test]
    fn channel_geometry() {
        let channel = BoxMesh::channel_1d(3);
        let mesh = channel.generate();
        assert_eq!(mesh.num_surfaces(), 2);
        assert_eq!(mesh.delta_coeffs, vec![1.0, 1.0]);
        assert_eq!(mesh.boundary_delta_coeffs[0], 2.0);
        assert_eq!(mesh.patch_types.velocity[0], "fixedValue");
        assert_eq!(mesh.patch_types.velocity[2], "empty");
        assert_eq!(mesh.patch_types.species[1], "zeroGradient");
        assert_eq!(channel.cell_centre(2).x, 2.5);
    }
}
