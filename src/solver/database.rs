//! Device-resident matrix data base.
//!
//! Owns the topology, every device allocation, and the per-run metrics. The
//! immutable mesh arrays are uploaded once at construction; per-step
//! snapshots are overwritten by the `prepare_*` calls; scratch buffers are
//! shared by the assemblers, which is why everything that writes them takes
//! `&mut self`.
//!
//! Allocations live until the data base drops unless released explicitly
//! with `release` / `release_system`; an application that rebuilds its
//! equation systems must release the old ones.

use std::sync::Arc;
use std::time::Instant;

use crate::solver::boundary::{construct_boundary_selector, PatchStaging, PatchTable, PatchType};
use crate::solver::error::{check_len, AssemblyError, DeviceError, DeviceErrorKind, Error, Result, TopologyError};
use crate::solver::gpu::{
    BufferId, ComputeDevice, CsrBindings, DeviceBuffer, DeviceScalar, FaceBindings, Kernel,
    LinearSystem,
};
use crate::solver::mesh::MeshInput;
use crate::solver::options::SolverConfig;
use crate::solver::profiling::{ProfileCategory, ProfileTimer, ProfilingStats};
use crate::solver::topology::MatrixTopology;

type F = DeviceBuffer<f64>;
type U = DeviceBuffer<u32>;

struct LedgerEntry {
    id: BufferId,
    bytes: u64,
    label: String,
}

/// Acquisition record of every device allocation. Dropping the ledger
/// releases the allocations in reverse acquisition order, so a data base that
/// fails half-way through construction leaves nothing behind.
pub struct BufferLedger {
    device: Arc<dyn ComputeDevice>,
    metrics: Arc<ProfilingStats>,
    entries: Vec<LedgerEntry>,
    total_bytes: u64,
}

impl BufferLedger {
    pub fn new(device: Arc<dyn ComputeDevice>, metrics: Arc<ProfilingStats>) -> Self {
        Self {
            device,
            metrics,
            entries: Vec::new(),
            total_bytes: 0,
        }
    }

    pub fn acquire<T: DeviceScalar>(&mut self, label: &str, len: usize) -> std::result::Result<DeviceBuffer<T>, DeviceError> {
        let bytes = (len * std::mem::size_of::<T>()) as u64;
        let _t = ProfileTimer::new(&self.metrics, ProfileCategory::Allocation, "ledger:acquire").with_bytes(bytes);
        let id = self.device.create_buffer(label, bytes)?;
        self.entries.push(LedgerEntry {
            id,
            bytes,
            label: label.to_string(),
        });
        self.total_bytes += bytes;
        self.metrics.record_device_alloc(bytes);
        Ok(DeviceBuffer::from_raw(id, len))
    }

    pub fn acquire_with<T: DeviceScalar>(&mut self, label: &str, data: &[T]) -> std::result::Result<DeviceBuffer<T>, DeviceError> {
        let buffer = self.acquire::<T>(label, data.len())?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let _t = ProfileTimer::new(&self.metrics, ProfileCategory::Upload, "ledger:initial_upload")
            .with_bytes(bytes.len() as u64);
        self.device.write_buffer(buffer.id(), 0, bytes)?;
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Releases one allocation ahead of the ledger's drop. Returns false for
    /// an id this ledger does not own.
    pub fn release(&mut self, id: BufferId) -> bool {
        let Some(pos) = self.entries.iter().rposition(|e| e.id == id) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        self.device.release_buffer(entry.id);
        self.metrics.record_device_free(entry.bytes);
        self.total_bytes -= entry.bytes;
        true
    }
}

impl Drop for BufferLedger {
    fn drop(&mut self) {
        let count = self.entries.len();
        for entry in self.entries.drain(..).rev() {
            self.device.release_buffer(entry.id);
            self.metrics.record_device_free(entry.bytes);
        }
        if count > 0 {
            log::debug!("released {count} device buffers");
        }
    }
}

/// Immutable per-mesh arrays besides the CSR skeleton and face geometry.
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    pub volume: F,
    pub owner: U,
    pub neighbour: U,
    pub face_csr_index: U,
    pub tmp_permutated_list: U,
    pub bound_permutation_list: U,
    /// Grouped boundary order from here on.
    pub boundary_face_cell: U,
    pub boundary_cell_id: U,
    pub boundary_cell_offset: U,
    pub boundary_mag_sf: F,
    pub boundary_delta_coeffs: F,
    pub boundary_weight: F,
    pub velocity_patch: U,
    pub species_patch: U,
}

/// Density, flux, pressure and velocity snapshots for the current step.
#[derive(Debug, Clone, Copy)]
pub struct FlowBuffers {
    pub rho_old: F,
    pub rho: F,
    /// Face flux in CSR slot order.
    pub phi: F,
    pub boundary_phi: F,
    pub boundary_rho: F,
    pub p: F,
    pub boundary_p: F,
    pub u_old: F,
    pub boundary_u: F,
    pub nu_eff: F,
    pub boundary_nu_eff: F,
}

#[derive(Debug, Clone, Copy)]
pub struct EnergyBuffers {
    pub he_old: F,
    pub k: F,
    pub k_old: F,
    pub alpha_eff: F,
    pub dpdt: F,
    pub diff_corr_flux: F,
    pub boundary_he: F,
    pub boundary_k: F,
    pub boundary_alpha_eff: F,
    pub boundary_gradient: F,
    pub boundary_diff_corr_flux: F,
}

#[derive(Debug, Clone, Default)]
pub struct SpeciesBuffers {
    pub y: Vec<F>,
    pub rho_d: Vec<F>,
    pub boundary_y: Vec<F>,
    pub boundary_rho_d: Vec<F>,
}

/// Buffers shared between assemblers. Contents are only meaningful between
/// the call that fills them and the next assembler that reuses them.
#[derive(Debug, Clone, Copy)]
pub struct ScratchBuffers {
    /// External `[lower | diag | upper]` matrix.
    pub ldu: F,
    pub ldu_source: F,
    pub cell: F,
    pub cell_gamma: F,
    pub face: F,
    pub face_weight: F,
    pub face_gamma: F,
    pub boundary: F,
    pub boundary_gamma: F,
    pub boundary_zero: F,
    pub grad_u: F,
    pub dev2_t: F,
}

pub struct EnergyInputs<'a> {
    pub he_old: &'a [f64],
    pub k: &'a [f64],
    pub k_old: &'a [f64],
    pub alpha_eff: &'a [f64],
    pub dpdt: &'a [f64],
    /// Cell vector, three per cell.
    pub diff_corr_flux: &'a [f64],
    pub boundary_he: &'a [f64],
    pub boundary_k: &'a [f64],
    pub boundary_alpha_eff: &'a [f64],
    pub boundary_gradient: &'a [f64],
    pub boundary_diff_corr_flux: &'a [f64],
}

pub struct FlowInputs<'a> {
    pub rho_old: &'a [f64],
    pub rho: &'a [f64],
    /// One value per internal face, in face order.
    pub phi: &'a [f64],
    pub boundary_phi: &'a [f64],
    pub boundary_rho: &'a [f64],
    pub p: &'a [f64],
    pub boundary_p: &'a [f64],
    pub u_old: &'a [f64],
    pub boundary_u: &'a [f64],
    pub nu_eff: &'a [f64],
    pub boundary_nu_eff: &'a [f64],
}

pub struct SpeciesInputs<'a> {
    pub y: &'a [Vec<f64>],
    pub rho_d: &'a [Vec<f64>],
    pub boundary_y: &'a [Vec<f64>],
    pub boundary_rho_d: &'a [Vec<f64>],
}

pub struct MatrixDataBase {
    topology: MatrixTopology,
    device: Arc<dyn ComputeDevice>,
    metrics: Arc<ProfilingStats>,
    config: SolverConfig,
    num_species: usize,
    patch_table: PatchTable,
    patch_staging: PatchStaging,
    pub csr: CsrBindings,
    pub faces: FaceBindings,
    pub mesh: MeshBuffers,
    pub flow: FlowBuffers,
    pub energy: EnergyBuffers,
    pub species: SpeciesBuffers,
    pub scratch: ScratchBuffers,
    ledger: BufferLedger,
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn gpu_ids(types: &[PatchType]) -> Vec<u32> {
    types.iter().map(|t| t.gpu_id()).collect()
}

impl MatrixDataBase {
    pub fn new(device: Arc<dyn ComputeDevice>, input: MeshInput, config: &SolverConfig) -> Result<Self> {
        let start = Instant::now();
        let topology = MatrixTopology::build(
            input.num_cells,
            &input.owner,
            &input.neighbour,
            &input.boundary_face_cell,
        )?;
        let n = topology.num_cells();
        let ns = topology.num_surfaces();
        let nbf = topology.num_boundary_faces();
        let nnz = topology.nnz();

        check_len("volume", n, input.volume.len())?;
        check_len("weight", ns, input.weight.len())?;
        check_len("mag_sf", ns, input.mag_sf.len())?;
        check_len("delta_coeffs", ns, input.delta_coeffs.len())?;
        check_len("sf", 3 * ns, input.sf.len())?;
        check_len("boundary_sf", 3 * nbf, input.boundary_sf.len())?;
        check_len("boundary_mag_sf", nbf, input.boundary_mag_sf.len())?;
        check_len("boundary_delta_coeffs", nbf, input.boundary_delta_coeffs.len())?;
        check_len("boundary_weight", nbf, input.boundary_weight.len())?;
        let patch_total: usize = input.patch_sizes.iter().sum();
        if patch_total != nbf {
            return Err(Error::Topology(TopologyError::SizeMismatch {
                what: "patch_sizes",
                expected: nbf,
                actual: patch_total,
            }));
        }
        let patch_table = PatchTable::resolve(&input.patch_types, &input.patch_sizes)?;
        let patch_staging = PatchStaging::new(&input.patch_sizes);

        log::info!(
            "matrix topology: {} cells, {} internal faces, {} boundary faces ({} boundary cells), nnz {}",
            n,
            ns,
            nbf,
            topology.num_boundary_cells(),
            nnz
        );

        let metrics = Arc::new(ProfilingStats::new());
        let mut ledger = BufferLedger::new(device.clone(), metrics.clone());

        let csr = CsrBindings {
            row_ptr: ledger.acquire_with("row_ptr", topology.row_ptr())?,
            col_index: ledger.acquire_with("col_index", topology.col_index())?,
            diag_index: ledger.acquire_with("diag_index", topology.diag_index())?,
            permed_index: ledger.acquire_with("permed_index", topology.permed_index())?,
            cell_boundary_ptr: ledger.acquire_with("cell_boundary_ptr", topology.cell_boundary_ptr())?,
            num_cells: n as u32,
            num_surfaces: ns as u32,
        };
        let csr_bytes = ledger.total_bytes();

        let faces = FaceBindings {
            weight: ledger.acquire_with("weight", &topology.permute_face_values(&input.weight, 1))?,
            mag_sf: ledger.acquire_with("mag_sf", &topology.permute_face_values(&input.mag_sf, 1))?,
            delta_coeffs: ledger.acquire_with(
                "delta_coeffs",
                &topology.permute_face_values(&input.delta_coeffs, 1),
            )?,
            sf: ledger.acquire_with("sf", &topology.permute_face_values(&input.sf, 3))?,
            boundary_sf: ledger.acquire_with(
                "boundary_sf",
                &topology.permute_boundary_values(&input.boundary_sf, 3),
            )?,
        };
        let face_bytes = ledger.total_bytes() - csr_bytes;

        let mesh = MeshBuffers {
            volume: ledger.acquire_with("volume", &input.volume)?,
            owner: ledger.acquire_with("owner", topology.owner())?,
            neighbour: ledger.acquire_with("neighbour", topology.neighbour())?,
            face_csr_index: ledger.acquire_with("face_csr_index", topology.face_csr_index())?,
            tmp_permutated_list: ledger.acquire_with("tmp_permutated_list", topology.tmp_permutated_list())?,
            bound_permutation_list: ledger
                .acquire_with("bound_permutation_list", topology.bound_permutation_list())?,
            boundary_face_cell: ledger.acquire_with("boundary_face_cell", topology.boundary_face_cell())?,
            boundary_cell_id: ledger.acquire_with("boundary_cell_id", topology.boundary_cell_id())?,
            boundary_cell_offset: ledger.acquire_with("boundary_cell_offset", topology.boundary_cell_offset())?,
            boundary_mag_sf: ledger.acquire_with(
                "boundary_mag_sf",
                &topology.permute_boundary_values(&input.boundary_mag_sf, 1),
            )?,
            boundary_delta_coeffs: ledger.acquire_with(
                "boundary_delta_coeffs",
                &topology.permute_boundary_values(&input.boundary_delta_coeffs, 1),
            )?,
            boundary_weight: ledger.acquire_with(
                "boundary_weight",
                &topology.permute_boundary_values(&input.boundary_weight, 1),
            )?,
            velocity_patch: ledger.acquire_with(
                "velocity_patch_type",
                &topology.permute_boundary_values(&gpu_ids(&patch_table.velocity), 1),
            )?,
            species_patch: ledger.acquire_with(
                "species_patch_type",
                &topology.permute_boundary_values(&gpu_ids(&patch_table.species), 1),
            )?,
        };
        let mesh_bytes = ledger.total_bytes() - csr_bytes - face_bytes;

        let flow = FlowBuffers {
            rho_old: ledger.acquire("rho_old", n)?,
            rho: ledger.acquire("rho", n)?,
            phi: ledger.acquire("phi", 2 * ns)?,
            boundary_phi: ledger.acquire("boundary_phi", nbf)?,
            boundary_rho: ledger.acquire("boundary_rho", nbf)?,
            p: ledger.acquire("p", n)?,
            boundary_p: ledger.acquire("boundary_p", nbf)?,
            u_old: ledger.acquire("u_old", 3 * n)?,
            boundary_u: ledger.acquire("boundary_u", 3 * nbf)?,
            nu_eff: ledger.acquire("nu_eff", n)?,
            boundary_nu_eff: ledger.acquire("boundary_nu_eff", nbf)?,
        };
        let energy = EnergyBuffers {
            he_old: ledger.acquire("he_old", n)?,
            k: ledger.acquire("k", n)?,
            k_old: ledger.acquire("k_old", n)?,
            alpha_eff: ledger.acquire("alpha_eff", n)?,
            dpdt: ledger.acquire("dpdt", n)?,
            diff_corr_flux: ledger.acquire("diff_corr_flux", 3 * n)?,
            boundary_he: ledger.acquire("boundary_he", nbf)?,
            boundary_k: ledger.acquire("boundary_k", nbf)?,
            boundary_alpha_eff: ledger.acquire("boundary_alpha_eff", nbf)?,
            boundary_gradient: ledger.acquire("boundary_gradient", nbf)?,
            boundary_diff_corr_flux: ledger.acquire("boundary_diff_corr_flux", 3 * nbf)?,
        };
        let mut species = SpeciesBuffers::default();
        for s in 0..input.num_species {
            species.y.push(ledger.acquire(&format!("y_{s}"), n)?);
            species.rho_d.push(ledger.acquire(&format!("rho_d_{s}"), n)?);
            species.boundary_y.push(ledger.acquire(&format!("boundary_y_{s}"), nbf)?);
            species
                .boundary_rho_d
                .push(ledger.acquire(&format!("boundary_rho_d_{s}"), nbf)?);
        }
        let field_bytes = ledger.total_bytes() - csr_bytes - face_bytes - mesh_bytes;

        let scratch = ScratchBuffers {
            ldu: ledger.acquire("ldu", nnz)?,
            ldu_source: ledger.acquire("ldu_source", 3 * n)?,
            cell: ledger.acquire("cell_staging", 9 * n)?,
            cell_gamma: ledger.acquire("cell_gamma", n)?,
            face: ledger.acquire("face_staging", 3 * ns)?,
            face_weight: ledger.acquire("face_weight", 2 * ns)?,
            face_gamma: ledger.acquire("face_gamma", ns)?,
            boundary: ledger.acquire("boundary_staging", 3 * nbf)?,
            boundary_gamma: ledger.acquire("boundary_gamma", nbf)?,
            boundary_zero: ledger.acquire("boundary_zero", 3 * nbf)?,
            grad_u: ledger.acquire("grad_u", 9 * n)?,
            dev2_t: ledger.acquire("dev2_t", 9 * n)?,
        };

        log::debug!(
            "device bytes: csr {:.3} MB, faces {:.3} MB, mesh {:.3} MB, fields {:.3} MB",
            mb(csr_bytes),
            mb(face_bytes),
            mb(mesh_bytes),
            mb(field_bytes)
        );
        log::info!("Total bytes malloc on device: {:.3} MB", mb(ledger.total_bytes()));

        device.sync()?;
        metrics.record_location(
            "database:new",
            ProfileCategory::Allocation,
            start.elapsed(),
            ledger.total_bytes(),
        );

        Ok(Self {
            topology,
            device,
            metrics,
            config: config.clone(),
            num_species: input.num_species,
            patch_table,
            patch_staging,
            csr,
            faces,
            mesh,
            flow,
            energy,
            species,
            scratch,
            ledger,
        })
    }

    pub fn topology(&self) -> &MatrixTopology {
        &self.topology
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.device
    }

    pub fn metrics(&self) -> &ProfilingStats {
        &self.metrics
    }

    /// Shared handle for timers that must outlive a `&mut self` borrow.
    pub fn metrics_handle(&self) -> Arc<ProfilingStats> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn num_species(&self) -> usize {
        self.num_species
    }

    pub fn num_cells(&self) -> usize {
        self.topology.num_cells()
    }

    pub fn num_boundary_faces(&self) -> usize {
        self.topology.num_boundary_faces()
    }

    /// Per-face patch types resolved from the mesh's patch type names, host order.
    pub fn patch_table(&self) -> &PatchTable {
        &self.patch_table
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.ledger.total_bytes()
    }

    pub fn num_allocations(&self) -> usize {
        self.ledger.len()
    }

    pub fn allocate_system(&mut self, label: &str, ncmpt: usize) -> std::result::Result<LinearSystem, DeviceError> {
        let n = self.topology.num_cells();
        let nnz = self.topology.nnz();
        let nbf = self.topology.num_boundary_faces();
        let system = LinearSystem {
            values: self.ledger.acquire(&format!("{label}.values"), ncmpt * nnz)?,
            source: self.ledger.acquire(&format!("{label}.source"), ncmpt * n)?,
            psi: self.ledger.acquire(&format!("{label}.psi"), ncmpt * n)?,
            internal_coeffs: self.ledger.acquire(&format!("{label}.internal_coeffs"), ncmpt * nbf)?,
            boundary_coeffs: self.ledger.acquire(&format!("{label}.boundary_coeffs"), ncmpt * nbf)?,
            ncmpt: ncmpt as u32,
            num_cells: n as u32,
            nnz: nnz as u32,
            num_boundary_faces: nbf as u32,
        };
        log::debug!("allocated linear system {label} with {ncmpt} component(s)");
        Ok(system)
    }

    pub fn allocate_scalar(&mut self, label: &str, len: usize) -> std::result::Result<F, DeviceError> {
        self.ledger.acquire(label, len)
    }

    pub fn allocate_index(&mut self, label: &str, data: &[u32]) -> std::result::Result<U, DeviceError> {
        self.ledger.acquire_with(label, data)
    }

    /// Resolves one boundary condition type name per patch and uploads the
    /// per-face tags in grouped order.
    pub fn allocate_patch_types<S: AsRef<str>>(&mut self, label: &'static str, patch_type_names: &[S]) -> Result<U> {
        let types = construct_boundary_selector(patch_type_names, &self.patch_staging.patch_sizes())?;
        check_len(label, self.num_boundary_faces(), types.len())?;
        let grouped = self.topology.permute_boundary_values(&gpu_ids(&types), 1);
        Ok(self.ledger.acquire_with(label, &grouped)?)
    }

    /// Returns an allocation to the device before the data base drops.
    pub fn release<T: DeviceScalar>(&mut self, buffer: DeviceBuffer<T>) -> Result<()> {
        self.sync()?;
        if !self.ledger.release(buffer.id()) {
            return Err(DeviceError::new("release", DeviceErrorKind::InvalidBuffer(buffer.id())).into());
        }
        Ok(())
    }

    pub fn release_system(&mut self, system: LinearSystem) -> Result<()> {
        for buffer in [
            system.boundary_coeffs,
            system.internal_coeffs,
            system.psi,
            system.source,
            system.values,
        ] {
            self.release(buffer)?;
        }
        log::debug!("released linear system with {} component(s)", system.ncmpt);
        Ok(())
    }

    pub fn launch(&self, kernel: Kernel) -> std::result::Result<(), DeviceError> {
        let _t = ProfileTimer::new(&self.metrics, ProfileCategory::Dispatch, kernel.name());
        self.device.launch(&kernel)
    }

    pub fn fill(&self, dst: F, value: f64) -> std::result::Result<(), DeviceError> {
        self.launch(Kernel::Fill { dst, value })
    }

    /// Queues a host-to-device copy of a whole buffer.
    pub fn upload(&self, dst: F, data: &[f64]) -> Result<()> {
        check_len("upload", dst.len(), data.len())?;
        self.upload_at(dst, 0, data)
    }

    /// Queues a copy into `dst` starting at element `offset`.
    pub fn upload_at(&self, dst: F, offset: usize, data: &[f64]) -> Result<()> {
        if offset + data.len() > dst.len() {
            return Err(AssemblyError::Input {
                what: "upload",
                expected: dst.len().saturating_sub(offset),
                actual: data.len(),
            }
            .into());
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let _t = ProfileTimer::new(&self.metrics, ProfileCategory::Upload, "database:upload")
            .with_bytes(bytes.len() as u64);
        self.device.write_buffer(dst.id(), (offset * 8) as u64, bytes)?;
        Ok(())
    }

    /// Stages a host-ordered boundary array and permutes it into grouped order on the device.
    pub fn upload_boundary(&mut self, dst: F, data: &[f64], ncmpt: usize) -> Result<()> {
        let nbf = self.num_boundary_faces();
        check_len("boundary upload", nbf * ncmpt, data.len())?;
        check_len("boundary destination", nbf * ncmpt, dst.len())?;
        if nbf == 0 {
            return Ok(());
        }
        let staging = DeviceBuffer::from_raw(self.scratch.boundary.id(), nbf * ncmpt);
        self.upload(staging, data)?;
        self.launch(Kernel::Gather {
            dst,
            src: staging,
            index: self.mesh.bound_permutation_list,
            ncmpt: ncmpt as u32,
            wrap: 0,
        })?;
        Ok(())
    }

    /// Stages a face-ordered array and duplicates it into CSR slot order on the device.
    pub fn upload_face_values(&mut self, dst: F, data: &[f64], ncmpt: usize) -> Result<()> {
        let ns = self.topology.num_surfaces();
        check_len("face upload", ns * ncmpt, data.len())?;
        check_len("face destination", 2 * ns * ncmpt, dst.len())?;
        if ns == 0 {
            return Ok(());
        }
        let staging = DeviceBuffer::from_raw(self.scratch.face.id(), ns * ncmpt);
        self.upload(staging, data)?;
        self.launch(Kernel::Gather {
            dst,
            src: staging,
            index: self.csr.permed_index,
            ncmpt: ncmpt as u32,
            wrap: ns as u32,
        })?;
        Ok(())
    }

    /// Concatenates per-patch slices into host boundary order, then uploads
    /// them like `upload_boundary`.
    pub fn upload_patches(&mut self, dst: F, patches: &[&[f64]], ncmpt: usize) -> Result<()> {
        let mut staged = vec![0.0; self.patch_staging.num_faces() * ncmpt];
        self.patch_staging.gather(patches, ncmpt, &mut staged)?;
        self.upload_boundary(dst, &staged, ncmpt)
    }

    pub fn upload_face_flux(&mut self, dst: F, phi: &[f64]) -> Result<()> {
        self.upload_face_values(dst, phi, 1)
    }

    pub fn prepare_flow(&mut self, inputs: &FlowInputs<'_>) -> Result<()> {
        let metrics = self.metrics.clone();
        let _t = ProfileTimer::new(&metrics, ProfileCategory::Upload, "database:prepare_flow");
        let n = self.num_cells();
        let flow = self.flow;
        check_len("rho_old", n, inputs.rho_old.len())?;
        check_len("rho", n, inputs.rho.len())?;
        check_len("p", n, inputs.p.len())?;
        check_len("u_old", 3 * n, inputs.u_old.len())?;
        check_len("nu_eff", n, inputs.nu_eff.len())?;
        self.upload(flow.rho_old, inputs.rho_old)?;
        self.upload(flow.rho, inputs.rho)?;
        self.upload(flow.p, inputs.p)?;
        self.upload(flow.u_old, inputs.u_old)?;
        self.upload(flow.nu_eff, inputs.nu_eff)?;
        self.upload_face_flux(flow.phi, inputs.phi)?;
        self.upload_boundary(flow.boundary_phi, inputs.boundary_phi, 1)?;
        self.upload_boundary(flow.boundary_rho, inputs.boundary_rho, 1)?;
        self.upload_boundary(flow.boundary_p, inputs.boundary_p, 1)?;
        self.upload_boundary(flow.boundary_u, inputs.boundary_u, 3)?;
        self.upload_boundary(flow.boundary_nu_eff, inputs.boundary_nu_eff, 1)?;
        Ok(())
    }

    pub fn prepare_data(&mut self, inputs: &EnergyInputs<'_>) -> Result<()> {
        let metrics = self.metrics.clone();
        let _t = ProfileTimer::new(&metrics, ProfileCategory::Upload, "database:prepare_data");
        let n = self.num_cells();
        let energy = self.energy;
        check_len("he_old", n, inputs.he_old.len())?;
        check_len("k", n, inputs.k.len())?;
        check_len("k_old", n, inputs.k_old.len())?;
        check_len("alpha_eff", n, inputs.alpha_eff.len())?;
        check_len("dpdt", n, inputs.dpdt.len())?;
        check_len("diff_corr_flux", 3 * n, inputs.diff_corr_flux.len())?;
        self.upload(energy.he_old, inputs.he_old)?;
        self.upload(energy.k, inputs.k)?;
        self.upload(energy.k_old, inputs.k_old)?;
        self.upload(energy.alpha_eff, inputs.alpha_eff)?;
        self.upload(energy.dpdt, inputs.dpdt)?;
        self.upload(energy.diff_corr_flux, inputs.diff_corr_flux)?;
        self.upload_boundary(energy.boundary_he, inputs.boundary_he, 1)?;
        self.upload_boundary(energy.boundary_k, inputs.boundary_k, 1)?;
        self.upload_boundary(energy.boundary_alpha_eff, inputs.boundary_alpha_eff, 1)?;
        self.upload_boundary(energy.boundary_gradient, inputs.boundary_gradient, 1)?;
        self.upload_boundary(energy.boundary_diff_corr_flux, inputs.boundary_diff_corr_flux, 3)?;
        Ok(())
    }

    pub fn prepare_species(&mut self, inputs: &SpeciesInputs<'_>) -> Result<()> {
        let metrics = self.metrics.clone();
        let _t = ProfileTimer::new(&metrics, ProfileCategory::Upload, "database:prepare_species");
        let n = self.num_cells();
        let ns = self.num_species;
        check_len("species mass fractions", ns, inputs.y.len())?;
        check_len("species diffusivities", ns, inputs.rho_d.len())?;
        check_len("species boundary mass fractions", ns, inputs.boundary_y.len())?;
        check_len("species boundary diffusivities", ns, inputs.boundary_rho_d.len())?;
        for s in 0..ns {
            check_len("y", n, inputs.y[s].len())?;
            check_len("rho_d", n, inputs.rho_d[s].len())?;
            let (y, rho_d) = (self.species.y[s], self.species.rho_d[s]);
            let (y_b, rho_d_b) = (self.species.boundary_y[s], self.species.boundary_rho_d[s]);
            self.upload(y, &inputs.y[s])?;
            self.upload(rho_d, &inputs.rho_d[s])?;
            self.upload_boundary(y_b, &inputs.boundary_y[s], 1)?;
            self.upload_boundary(rho_d_b, &inputs.boundary_rho_d[s], 1)?;
        }
        Ok(())
    }

    /// Blocking read of a whole buffer.
    pub fn download(&self, src: F) -> Result<Vec<f64>> {
        let _t = ProfileTimer::new(&self.metrics, ProfileCategory::Download, "database:download")
            .with_bytes(src.size_bytes());
        let bytes = self.device.read_buffer(src.id(), 0, src.size_bytes())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn download_index(&self, src: U) -> Result<Vec<u32>> {
        let bytes = self.device.read_buffer(src.id(), 0, src.size_bytes())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Waits for the stream, then copies the solution into `psi`.
    pub fn update_psi(&self, system: &LinearSystem, psi: &mut [f64]) -> Result<()> {
        check_len("psi", system.psi.len(), psi.len())?;
        self.sync()?;
        let solution = self.download(system.psi)?;
        psi.copy_from_slice(&solution);
        Ok(())
    }

    /// Replaces the device solution with a host-corrected field.
    pub fn correct_psi(&self, system: &LinearSystem, psi: &[f64]) -> Result<()> {
        check_len("psi", system.psi.len(), psi.len())?;
        self.upload(system.psi, psi)
    }

    pub fn sync(&self) -> Result<()> {
        let _t = ProfileTimer::new(&self.metrics, ProfileCategory::Sync, "database:sync");
        self.device.sync()?;
        Ok(())
    }
}

/// Compares two vectors element-wise with a relative tolerance. Mismatches are
/// logged with their index; returns whether all elements agree.
pub fn check_vector_equal(reference: &[f64], candidate: &[f64], rel_tol: f64) -> bool {
    if reference.len() != candidate.len() {
        log::warn!(
            "length mismatch: reference {} vs candidate {}",
            reference.len(),
            candidate.len()
        );
        return false;
    }
    let mut ok = true;
    for (i, (&a, &b)) in reference.iter().zip(candidate).enumerate() {
        let scale = a.abs().max(b.abs());
        let diff = (a - b).abs();
        let equal = diff == 0.0 || diff / scale <= rel_tol;
        if !equal || !b.is_finite() {
            if ok {
                log::warn!("mismatch at {i}: reference {a:e}, candidate {b:e}, rel error {:e}", diff / scale);
            }
            ok = false;
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::gpu::HostDevice;
    use crate::solver::mesh::BoxMesh;

    fn host() -> Arc<dyn ComputeDevice> {
        Arc::new(HostDevice::new())
    }

    #[test]
    fn ledger_releases_in_reverse_order() {
        let device = Arc::new(HostDevice::new());
        let metrics = Arc::new(ProfilingStats::new());
        {
            let mut ledger = BufferLedger::new(device.clone(), metrics.clone());
            ledger.acquire::<f64>("a", 4).unwrap();
            ledger.acquire_with::<u32>("b", &[1, 2, 3]).unwrap();
            assert_eq!(ledger.labels().collect::<Vec<_>>(), vec!["a", "b"]);
            assert_eq!(ledger.total_bytes(), 44);
            assert_eq!(device.live_buffers(), 2);
        }
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(metrics.get_memory_stats().net_bytes(), 0);
    }

    #[test]
    fn boundary_upload_is_grouped() {
        let device = host();
        let mut db = MatrixDataBase::new(
            device,
            BoxMesh::channel_1d(3).generate(),
            &SolverConfig::default(),
        )
        .unwrap();
        let nbf = db.num_boundary_faces();
        let host: Vec<f64> = (0..nbf).map(|b| b as f64).collect();
        let dst = db.flow.boundary_p;
        db.upload_boundary(dst, &host, 1).unwrap();
        let grouped = db.download(dst).unwrap();
        assert_eq!(grouped, db.topology().permute_boundary_values(&host, 1));
    }

    #[test]
    fn face_flux_lands_in_slot_order() {
        let mut db = MatrixDataBase::new(host(), BoxMesh::channel_1d(3).generate(), &SolverConfig::default())
            .unwrap();
        let phi = db.flow.phi;
        db.upload_face_flux(phi, &[1.5, -2.0]).unwrap();
        // slot order: cell0 upper(f0), cell1 lower(f0), cell1 upper(f1), cell2 lower(f1)
        assert_eq!(db.download(phi).unwrap(), vec![1.5, 1.5, -2.0, -2.0]);
    }

    #[test]
    fn wrong_length_is_an_input_error() {
        let db = MatrixDataBase::new(host(), BoxMesh::channel_1d(2).generate(), &SolverConfig::default())
            .unwrap();
        let err = db.upload(db.flow.rho, &[1.0; 5]).unwrap_err();
        assert!(matches!(err, Error::Assembly(_)));
    }

    #[test]
    fn short_upload_is_rejected_but_upload_at_fills_a_prefix() {
        let db = MatrixDataBase::new(host(), BoxMesh::channel_1d(3).generate(), &SolverConfig::default())
            .unwrap();
        let rho = db.flow.rho;
        db.upload(rho, &[4.0; 3]).unwrap();
        let err = db.upload(rho, &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::Assembly(AssemblyError::Input { what: "upload", expected: 3, actual: 1 })
        ));
        assert_eq!(db.download(rho).unwrap(), vec![4.0; 3]);

        db.upload_at(rho, 1, &[2.0, 3.0]).unwrap();
        assert_eq!(db.download(rho).unwrap(), vec![4.0, 2.0, 3.0]);
        assert!(db.upload_at(rho, 2, &[2.0, 3.0]).is_err());
    }

    #[test]
    fn ledger_release_frees_one_entry() {
        let device = Arc::new(HostDevice::new());
        let metrics = Arc::new(ProfilingStats::new());
        let mut ledger = BufferLedger::new(device.clone(), metrics.clone());
        let a = ledger.acquire::<f64>("a", 4).unwrap();
        ledger.acquire_with::<u32>("b", &[1, 2, 3]).unwrap();
        assert!(ledger.release(a.id()));
        assert!(!ledger.release(a.id()));
        assert_eq!(ledger.labels().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(ledger.total_bytes(), 12);
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(metrics.get_memory_stats().net_bytes(), 12);
    }

    #[test]
    fn vector_comparison() {
        assert!(check_vector_equal(&[1.0, 2.0], &[1.0, 2.0 + 1e-13], 1e-12));
        assert!(!check_vector_equal(&[1.0, 2.0], &[1.0, 2.1], 1e-6));
        assert!(!check_vector_equal(&[1.0], &[1.0, 1.0], 1e-6));
        assert!(!check_vector_equal(&[1.0], &[f64::NAN], 1e-6));
    }
}
