//! Kernel launch descriptors.
//!
//! Each `Kernel` names a compute kernel together with the buffers and
//! scalars it reads and writes. Backends either interpret the descriptor
//! directly (host) or lower it to a WGSL dispatch through [`Kernel::layout`].
//!
//! Layout conventions shared by every kernel:
//! - matrix values are component-major, `values[c * nnz + k]`;
//! - cell vectors (source, psi, fields) interleave components, `x[cell * ncmpt + c]`;
//! - face arrays are in CSR off-diagonal slot order (`2 * ns` entries);
//! - boundary arrays are in grouped boundary order.

use bytemuck::{Pod, Zeroable};

use super::{BufferId, DeviceBuffer};

type F = DeviceBuffer<f64>;
type U = DeviceBuffer<u32>;

/// Buffers for one assembled linear system `A psi = b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearSystem {
    pub values: F,
    pub source: F,
    pub psi: F,
    pub internal_coeffs: F,
    pub boundary_coeffs: F,
    pub ncmpt: u32,
    pub num_cells: u32,
    pub nnz: u32,
    pub num_boundary_faces: u32,
}

/// CSR skeleton as resident on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrBindings {
    pub row_ptr: U,
    pub col_index: U,
    pub diag_index: U,
    pub permed_index: U,
    pub cell_boundary_ptr: U,
    pub num_cells: u32,
    pub num_surfaces: u32,
}

impl CsrBindings {
    pub fn nnz(&self) -> u32 {
        self.num_cells + 2 * self.num_surfaces
    }
}

/// Per-slot face geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBindings {
    pub weight: F,
    pub mag_sf: F,
    pub delta_coeffs: F,
    /// Face area vectors, three per slot, oriented owner -> neighbour.
    pub sf: F,
    /// Boundary face area vectors, three per grouped boundary face.
    pub boundary_sf: F,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    Fill {
        dst: F,
        value: f64,
    },
    /// `dst[j*ncmpt + c] = src[(index[j] mod wrap)*ncmpt + c]`; `wrap == 0` disables the modulo.
    Gather {
        dst: F,
        src: F,
        index: U,
        ncmpt: u32,
        wrap: u32,
    },
    Product {
        dst: F,
        a: F,
        b: F,
    },
    /// Owner weight 1 for outflow from the owner, 0 otherwise.
    UpwindWeight {
        dst: F,
        phi: F,
    },
    FvmDdt {
        sys: LinearSystem,
        diag_index: U,
        volume: F,
        rho: F,
        rho_old: F,
        psi_old: F,
        rdt: f64,
    },
    FvmDiv {
        sys: LinearSystem,
        csr: CsrBindings,
        weight: F,
        phi: F,
        coeff: f64,
    },
    FvmLaplacian {
        sys: LinearSystem,
        csr: CsrBindings,
        faces: FaceBindings,
        gamma: F,
        /// `gamma` is per face (face order) rather than per cell.
        face_gamma: bool,
        coeff: f64,
    },
    BoundaryDiv {
        sys: LinearSystem,
        patch_type: U,
        phi: F,
        weight: F,
        value: F,
        coeff: f64,
    },
    BoundaryLaplacian {
        sys: LinearSystem,
        patch_type: U,
        gamma: F,
        mag_sf: F,
        delta_coeffs: F,
        value: F,
        gradient: F,
        /// Treat every non-empty face as fixed-gradient using `gradient`.
        fixed_gradient: bool,
        coeff: f64,
    },
    AddBoundaryDiagSrc {
        sys: LinearSystem,
        diag_index: U,
        cell_offset: U,
        cell_id: U,
    },
    FvcGradScalar {
        out: F,
        field: F,
        boundary_field: F,
        csr: CsrBindings,
        faces: FaceBindings,
        volume: F,
        coeff: f64,
        volume_scaled: bool,
    },
    FvcGradVector {
        out: F,
        field: F,
        boundary_field: F,
        csr: CsrBindings,
        faces: FaceBindings,
        volume: F,
    },
    Dev2Transpose {
        out: F,
        grad: F,
    },
    FvcDivTensor {
        source: F,
        tensor: F,
        gamma: F,
        boundary_gamma: F,
        csr: CsrBindings,
        faces: FaceBindings,
        coeff: f64,
    },
    FvcDivFaceScalar {
        source: F,
        phi: F,
        field: F,
        boundary_phi: F,
        boundary_field: F,
        csr: CsrBindings,
        weight: F,
        coeff: f64,
    },
    FvcDivCellVector {
        source: F,
        field: F,
        boundary_field: F,
        csr: CsrBindings,
        faces: FaceBindings,
        coeff: f64,
    },
    FvcDivFlux {
        source: F,
        flux: F,
        boundary_flux: F,
        csr: CsrBindings,
        coeff: f64,
    },
    /// `coeff * rdt * (rho*f - rho_old*f_old) * V`, with `f = 1` when `field` is `None`.
    FvcDdt {
        source: F,
        rho: F,
        rho_old: F,
        field: Option<(F, F)>,
        volume: F,
        rdt: f64,
        coeff: f64,
    },
    AddCellSource {
        source: F,
        field: F,
        volume: F,
        ncmpt: u32,
        coeff: f64,
        volume_scaled: bool,
    },
    /// Folds an external `[lower | diag | upper]` matrix and its source.
    AddLduMatrix {
        sys: LinearSystem,
        ldu: F,
        ldu_source: F,
        tmp_perm: U,
        coeff: f64,
    },
    ComputeA {
        out: F,
        sys: LinearSystem,
        diag_index: U,
        cell_boundary_ptr: U,
        volume: F,
    },
    ComputeH {
        out: F,
        sys: LinearSystem,
        csr: CsrBindings,
        volume: F,
    },
    /// Adds `upper*psi_N - lower*psi_P` to `out[face]`.
    FaceFlux {
        out: F,
        sys: LinearSystem,
        face_csr_index: U,
        owner: U,
        neighbour: U,
    },
    /// Adds `internal*psi_P - boundary` to `out[grouped face]`.
    BoundaryFaceFlux {
        out: F,
        sys: LinearSystem,
        boundary_face_cell: U,
    },
}

/// Uniform block shared by every WGSL kernel: eight integers then four
/// doubles. Each shader names the fields it uses.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LaunchParams {
    pub ints: [u32; 8],
    pub scalars: [f64; 4],
}

impl LaunchParams {
    fn new(ints: &[u32], scalars: &[f64]) -> Self {
        let mut params = Self::default();
        params.ints[..ints.len()].copy_from_slice(ints);
        params.scalars[..scalars.len()].copy_from_slice(scalars);
        params
    }
}

/// A kernel lowered to shader name, storage bindings and uniform block.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelLayout {
    pub shader: &'static str,
    pub buffers: Vec<BufferId>,
    /// The first `writable` buffers are bound read-write, the rest read-only.
    pub writable: u32,
    pub params: LaunchParams,
    pub invocations: u32,
}

fn csr_ids(csr: &CsrBindings) -> [BufferId; 5] {
    [
        csr.row_ptr.id(),
        csr.col_index.id(),
        csr.diag_index.id(),
        csr.permed_index.id(),
        csr.cell_boundary_ptr.id(),
    ]
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Fill { .. } => "fill",
            Kernel::Gather { .. } => "gather",
            Kernel::Product { .. } => "product",
            Kernel::UpwindWeight { .. } => "upwind_weight",
            Kernel::FvmDdt { .. } => "fvm_ddt",
            Kernel::FvmDiv { .. } => "fvm_div",
            Kernel::FvmLaplacian { .. } => "fvm_laplacian",
            Kernel::BoundaryDiv { .. } => "boundary_div",
            Kernel::BoundaryLaplacian { .. } => "boundary_laplacian",
            Kernel::AddBoundaryDiagSrc { .. } => "add_boundary_diag_src",
            Kernel::FvcGradScalar { .. } => "fvc_grad_scalar",
            Kernel::FvcGradVector { .. } => "fvc_grad_vector",
            Kernel::Dev2Transpose { .. } => "dev2_transpose",
            Kernel::FvcDivTensor { .. } => "fvc_div_tensor",
            Kernel::FvcDivFaceScalar { .. } => "fvc_div_face_scalar",
            Kernel::FvcDivCellVector { .. } => "fvc_div_cell_vector",
            Kernel::FvcDivFlux { .. } => "fvc_div_flux",
            Kernel::FvcDdt { .. } => "fvc_ddt",
            Kernel::AddCellSource { .. } => "add_cell_source",
            Kernel::AddLduMatrix { .. } => "add_ldu_matrix",
            Kernel::ComputeA { .. } => "compute_a",
            Kernel::ComputeH { .. } => "compute_h",
            Kernel::FaceFlux { .. } => "face_flux",
            Kernel::BoundaryFaceFlux { .. } => "boundary_face_flux",
        }
    }

    /// Number of leading bindings the kernel writes.
    pub fn writable_bindings(&self) -> u32 {
        match self {
            Kernel::FvmDdt { .. }
            | Kernel::BoundaryDiv { .. }
            | Kernel::BoundaryLaplacian { .. }
            | Kernel::AddBoundaryDiagSrc { .. }
            | Kernel::AddLduMatrix { .. } => 2,
            _ => 1,
        }
    }

    /// Binding order here must match the `@binding` indices in the shader of
    /// the same name; the uniform block always follows the storage buffers.
    pub fn layout(&self) -> KernelLayout {
        let shader = self.name();
        let (buffers, params, invocations): (Vec<BufferId>, LaunchParams, u32) = match *self {
            Kernel::Fill { dst, value } => {
                let n = dst.len() as u32;
                (vec![dst.id()], LaunchParams::new(&[n], &[value]), n)
            }
            Kernel::Gather {
                dst,
                src,
                index,
                ncmpt,
                wrap,
            } => {
                let n = index.len() as u32;
                (
                    vec![dst.id(), src.id(), index.id()],
                    LaunchParams::new(&[n, ncmpt, wrap], &[]),
                    n,
                )
            }
            Kernel::Product { dst, a, b } => {
                let n = dst.len() as u32;
                (
                    vec![dst.id(), a.id(), b.id()],
                    LaunchParams::new(&[n], &[]),
                    n,
                )
            }
            Kernel::UpwindWeight { dst, phi } => {
                let n = dst.len() as u32;
                (vec![dst.id(), phi.id()], LaunchParams::new(&[n], &[]), n)
            }
            Kernel::FvmDdt {
                sys,
                diag_index,
                volume,
                rho,
                rho_old,
                psi_old,
                rdt,
            } => (
                vec![
                    sys.values.id(),
                    sys.source.id(),
                    diag_index.id(),
                    volume.id(),
                    rho.id(),
                    rho_old.id(),
                    psi_old.id(),
                ],
                LaunchParams::new(&[sys.num_cells, sys.nnz, sys.ncmpt], &[rdt]),
                sys.num_cells,
            ),
            Kernel::FvmDiv {
                sys,
                csr,
                weight,
                phi,
                coeff,
            } => (
                vec![
                    sys.values.id(),
                    csr.row_ptr.id(),
                    csr.diag_index.id(),
                    csr.permed_index.id(),
                    weight.id(),
                    phi.id(),
                ],
                LaunchParams::new(
                    &[csr.num_cells, csr.num_surfaces, sys.nnz, sys.ncmpt],
                    &[coeff],
                ),
                csr.num_cells,
            ),
            Kernel::FvmLaplacian {
                sys,
                csr,
                faces,
                gamma,
                face_gamma,
                coeff,
            } => (
                vec![
                    sys.values.id(),
                    csr.row_ptr.id(),
                    csr.col_index.id(),
                    csr.diag_index.id(),
                    csr.permed_index.id(),
                    faces.weight.id(),
                    faces.mag_sf.id(),
                    faces.delta_coeffs.id(),
                    gamma.id(),
                ],
                LaunchParams::new(
                    &[
                        csr.num_cells,
                        csr.num_surfaces,
                        sys.nnz,
                        sys.ncmpt,
                        face_gamma as u32,
                    ],
                    &[coeff],
                ),
                csr.num_cells,
            ),
            Kernel::BoundaryDiv {
                sys,
                patch_type,
                phi,
                weight,
                value,
                coeff,
            } => (
                vec![
                    sys.internal_coeffs.id(),
                    sys.boundary_coeffs.id(),
                    patch_type.id(),
                    phi.id(),
                    weight.id(),
                    value.id(),
                ],
                LaunchParams::new(&[sys.num_boundary_faces, sys.ncmpt], &[coeff]),
                sys.num_boundary_faces,
            ),
            Kernel::BoundaryLaplacian {
                sys,
                patch_type,
                gamma,
                mag_sf,
                delta_coeffs,
                value,
                gradient,
                fixed_gradient,
                coeff,
            } => (
                vec![
                    sys.internal_coeffs.id(),
                    sys.boundary_coeffs.id(),
                    patch_type.id(),
                    gamma.id(),
                    mag_sf.id(),
                    delta_coeffs.id(),
                    value.id(),
                    gradient.id(),
                ],
                LaunchParams::new(
                    &[sys.num_boundary_faces, sys.ncmpt, fixed_gradient as u32],
                    &[coeff],
                ),
                sys.num_boundary_faces,
            ),
            Kernel::AddBoundaryDiagSrc {
                sys,
                diag_index,
                cell_offset,
                cell_id,
            } => {
                let nbc = cell_id.len() as u32;
                (
                    vec![
                        sys.values.id(),
                        sys.source.id(),
                        sys.internal_coeffs.id(),
                        sys.boundary_coeffs.id(),
                        diag_index.id(),
                        cell_offset.id(),
                        cell_id.id(),
                    ],
                    LaunchParams::new(&[nbc, sys.nnz, sys.ncmpt], &[]),
                    nbc,
                )
            }
            Kernel::FvcGradScalar {
                out,
                field,
                boundary_field,
                csr,
                faces,
                volume,
                coeff,
                volume_scaled,
            } => {
                let mut ids = vec![out.id(), field.id(), boundary_field.id()];
                ids.extend(csr_ids(&csr));
                ids.extend([faces.weight.id(), faces.sf.id(), faces.boundary_sf.id(), volume.id()]);
                (
                    ids,
                    LaunchParams::new(
                        &[csr.num_cells, csr.num_surfaces, volume_scaled as u32],
                        &[coeff],
                    ),
                    csr.num_cells,
                )
            }
            Kernel::FvcGradVector {
                out,
                field,
                boundary_field,
                csr,
                faces,
                volume,
            } => {
                let mut ids = vec![out.id(), field.id(), boundary_field.id()];
                ids.extend(csr_ids(&csr));
                ids.extend([faces.weight.id(), faces.sf.id(), faces.boundary_sf.id(), volume.id()]);
                (
                    ids,
                    LaunchParams::new(&[csr.num_cells, csr.num_surfaces], &[]),
                    csr.num_cells,
                )
            }
            Kernel::Dev2Transpose { out, grad } => {
                let n = (out.len() / 9) as u32;
                (vec![out.id(), grad.id()], LaunchParams::new(&[n], &[]), n)
            }
            Kernel::FvcDivTensor {
                source,
                tensor,
                gamma,
                boundary_gamma,
                csr,
                faces,
                coeff,
            } => {
                let mut ids = vec![source.id(), tensor.id(), gamma.id(), boundary_gamma.id()];
                ids.extend(csr_ids(&csr));
                ids.extend([faces.weight.id(), faces.sf.id(), faces.boundary_sf.id()]);
                (
                    ids,
                    LaunchParams::new(&[csr.num_cells, csr.num_surfaces], &[coeff]),
                    csr.num_cells,
                )
            }
            Kernel::FvcDivFaceScalar {
                source,
                phi,
                field,
                boundary_phi,
                boundary_field,
                csr,
                weight,
                coeff,
            } => {
                let mut ids = vec![
                    source.id(),
                    phi.id(),
                    field.id(),
                    boundary_phi.id(),
                    boundary_field.id(),
                ];
                ids.extend(csr_ids(&csr));
                ids.push(weight.id());
                (
                    ids,
                    LaunchParams::new(&[csr.num_cells, csr.num_surfaces], &[coeff]),
                    csr.num_cells,
                )
            }
            Kernel::FvcDivCellVector {
                source,
                field,
                boundary_field,
                csr,
                faces,
                coeff,
            } => {
                let mut ids = vec![source.id(), field.id(), boundary_field.id()];
                ids.extend(csr_ids(&csr));
                ids.extend([faces.weight.id(), faces.sf.id(), faces.boundary_sf.id()]);
                (
                    ids,
                    LaunchParams::new(&[csr.num_cells, csr.num_surfaces], &[coeff]),
                    csr.num_cells,
                )
            }
            Kernel::FvcDivFlux {
                source,
                flux,
                boundary_flux,
                csr,
                coeff,
            } => (
                vec![
                    source.id(),
                    flux.id(),
                    boundary_flux.id(),
                    csr.row_ptr.id(),
                    csr.diag_index.id(),
                    csr.permed_index.id(),
                    csr.cell_boundary_ptr.id(),
                ],
                LaunchParams::new(&[csr.num_cells, csr.num_surfaces], &[coeff]),
                csr.num_cells,
            ),
            Kernel::FvcDdt {
                source,
                rho,
                rho_old,
                field,
                volume,
                rdt,
                coeff,
            } => {
                let n = volume.len() as u32;
                let (f, f_old, has_field) = match field {
                    Some((f, f_old)) => (f, f_old, 1),
                    None => (rho, rho_old, 0),
                };
                (
                    vec![
                        source.id(),
                        rho.id(),
                        rho_old.id(),
                        f.id(),
                        f_old.id(),
                        volume.id(),
                    ],
                    LaunchParams::new(&[n, has_field], &[rdt, coeff]),
                    n,
                )
            }
            Kernel::AddCellSource {
                source,
                field,
                volume,
                ncmpt,
                coeff,
                volume_scaled,
            } => {
                let n = volume.len() as u32;
                (
                    vec![source.id(), field.id(), volume.id()],
                    LaunchParams::new(&[n, ncmpt, volume_scaled as u32], &[coeff]),
                    n * ncmpt,
                )
            }
            Kernel::AddLduMatrix {
                sys,
                ldu,
                ldu_source,
                tmp_perm,
                coeff,
            } => (
                vec![
                    sys.values.id(),
                    sys.source.id(),
                    ldu.id(),
                    ldu_source.id(),
                    tmp_perm.id(),
                ],
                LaunchParams::new(&[sys.nnz, sys.num_cells, sys.ncmpt], &[coeff]),
                sys.nnz.max(sys.num_cells * sys.ncmpt),
            ),
            Kernel::ComputeA {
                out,
                sys,
                diag_index,
                cell_boundary_ptr,
                volume,
            } => (
                vec![
                    out.id(),
                    sys.values.id(),
                    sys.internal_coeffs.id(),
                    diag_index.id(),
                    cell_boundary_ptr.id(),
                    volume.id(),
                ],
                LaunchParams::new(&[sys.num_cells, sys.ncmpt], &[]),
                sys.num_cells,
            ),
            Kernel::ComputeH {
                out,
                sys,
                csr,
                volume,
            } => (
                vec![
                    out.id(),
                    sys.values.id(),
                    sys.source.id(),
                    sys.psi.id(),
                    sys.internal_coeffs.id(),
                    csr.row_ptr.id(),
                    csr.col_index.id(),
                    csr.diag_index.id(),
                    csr.cell_boundary_ptr.id(),
                    volume.id(),
                ],
                LaunchParams::new(&[sys.num_cells, sys.nnz, sys.ncmpt], &[]),
                sys.num_cells,
            ),
            Kernel::FaceFlux {
                out,
                sys,
                face_csr_index,
                owner,
                neighbour,
            } => {
                let ns = owner.len() as u32;
                (
                    vec![
                        out.id(),
                        sys.values.id(),
                        sys.psi.id(),
                        face_csr_index.id(),
                        owner.id(),
                        neighbour.id(),
                    ],
                    LaunchParams::new(&[ns], &[]),
                    ns,
                )
            }
            Kernel::BoundaryFaceFlux {
                out,
                sys,
                boundary_face_cell,
            } => (
                vec![
                    out.id(),
                    sys.internal_coeffs.id(),
                    sys.boundary_coeffs.id(),
                    sys.psi.id(),
                    boundary_face_cell.id(),
                ],
                LaunchParams::new(&[sys.num_boundary_faces], &[]),
                sys.num_boundary_faces,
            ),
        };
        KernelLayout {
            shader,
            buffers,
            writable: self.writable_bindings(),
            params,
            invocations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_params_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<LaunchParams>(), 64);
        let p = LaunchParams::new(&[3, 4], &[0.5]);
        assert_eq!(p.ints[..3], [3, 4, 0]);
        assert_eq!(p.scalars[0], 0.5);
    }

    #[test]
    fn fvc_ddt_without_field_binds_density_twice() {
        let rho = DeviceBuffer::<f64>::from_raw(1, 4);
        let rho_old = DeviceBuffer::<f64>::from_raw(2, 4);
        let k = Kernel::FvcDdt {
            source: DeviceBuffer::from_raw(0, 4),
            rho,
            rho_old,
            field: None,
            volume: DeviceBuffer::from_raw(3, 4),
            rdt: 2.0,
            coeff: -1.0,
        };
        let layout = k.layout();
        assert_eq!(layout.buffers, vec![0, 1, 2, 1, 2, 3]);
        assert_eq!(layout.writable, 1);
        assert_eq!(layout.params.ints[..2], [4, 0]);
        assert_eq!(layout.invocations, 4);
    }
}
