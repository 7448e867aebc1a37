//! CPU backend with the same stream semantics as the wgpu one.
//!
//! Commands are queued in submission order and only executed when the stream
//! is drained (`sync`, a read, or a release). Kernels run on the rayon pool
//! where their outputs split cleanly per cell; everything touching the
//! component-major value array walks rows sequentially.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector3};
use parking_lot::Mutex;
use rayon::prelude::*;

use super::kernels::{CsrBindings, Kernel};
use super::{padded_size, BufferId, ComputeDevice, DeviceBuffer};
use crate::solver::boundary::PatchType;
use crate::solver::error::{DeviceError, DeviceErrorKind};
use crate::solver::topology::off_diagonal_slot;

enum Command {
    Write {
        id: BufferId,
        offset: u64,
        data: Vec<u8>,
    },
    Copy {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    Launch(Kernel),
}

struct HostBuffer {
    label: String,
    size: u64,
    words: Vec<u64>,
}

impl HostBuffer {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.size as usize]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.size as usize]
    }

    fn f64s(&self) -> &[f64] {
        &bytemuck::cast_slice(&self.words)[..self.size as usize / 8]
    }

    fn f64s_mut(&mut self) -> &mut [f64] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.size as usize / 8]
    }

    fn u32s(&self) -> &[u32] {
        &bytemuck::cast_slice(&self.words)[..self.size as usize / 4]
    }
}

#[derive(Default)]
struct State {
    buffers: HashMap<BufferId, HostBuffer>,
    pending: Vec<Command>,
    next_id: BufferId,
    allocated: u64,
}

pub struct HostDevice {
    state: Mutex<State>,
    memory_limit: Option<u64>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            memory_limit: None,
        }
    }

    /// Fails allocations once `limit` bytes are live, like a device running out of memory.
    pub fn with_memory_limit(limit: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            memory_limit: Some(limit),
        }
    }

    pub fn pending_commands(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn buffer_label(&self, id: BufferId) -> Option<String> {
        self.state.lock().buffers.get(&id).map(|b| b.label.clone())
    }
}

impl State {
    fn check_range(&self, op: &'static str, id: BufferId, offset: u64, size: u64) -> Result<(), DeviceError> {
        let buffer = self
            .buffers
            .get(&id)
            .ok_or_else(|| DeviceError::new(op, DeviceErrorKind::InvalidBuffer(id)))?;
        if offset + size > buffer.size {
            return Err(DeviceError::new(
                op,
                DeviceErrorKind::SizeMismatch {
                    expected: buffer.size,
                    actual: offset + size,
                },
            ));
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        let pending = std::mem::take(&mut self.pending);
        for command in pending {
            self.execute(command)?;
        }
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<(), DeviceError> {
        match command {
            Command::Write { id, offset, data } => {
                self.check_range("write_buffer", id, offset, data.len() as u64)?;
                if let Some(buffer) = self.buffers.get_mut(&id) {
                    let start = offset as usize;
                    buffer.bytes_mut()[start..start + data.len()].copy_from_slice(&data);
                }
                Ok(())
            }
            Command::Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.check_range("copy_buffer", src, src_offset, size)?;
                self.check_range("copy_buffer", dst, dst_offset, size)?;
                let (s, d) = (src_offset as usize, dst_offset as usize);
                let chunk = self.buffers[&src].bytes()[s..s + size as usize].to_vec();
                if let Some(buffer) = self.buffers.get_mut(&dst) {
                    buffer.bytes_mut()[d..d + chunk.len()].copy_from_slice(&chunk);
                }
                Ok(())
            }
            Command::Launch(kernel) => self.run_kernel(&kernel),
        }
    }

    fn run_kernel(&mut self, kernel: &Kernel) -> Result<(), DeviceError> {
        let layout = kernel.layout();
        let writable = &layout.buffers[..layout.writable as usize];
        let mut outputs = Vec::with_capacity(writable.len());
        for &id in writable {
            match self.buffers.remove(&id) {
                Some(buffer) => outputs.push((id, buffer)),
                None => {
                    self.buffers.extend(outputs);
                    return Err(DeviceError::new(
                        kernel.name(),
                        DeviceErrorKind::InvalidBuffer(id),
                    ));
                }
            }
        }
        let result = {
            let inputs = Inputs {
                buffers: &self.buffers,
                kernel: kernel.name(),
            };
            let mut outs: Vec<&mut [f64]> = outputs.iter_mut().map(|(_, b)| b.f64s_mut()).collect();
            execute_kernel(kernel, &inputs, &mut outs)
        };
        self.buffers.extend(outputs);
        result
    }
}

impl ComputeDevice for HostDevice {
    fn name(&self) -> String {
        format!("host ({} threads)", rayon::current_num_threads())
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferId, DeviceError> {
        let mut state = self.state.lock();
        let padded = padded_size(size);
        if let Some(limit) = self.memory_limit {
            if state.allocated + padded > limit {
                return Err(DeviceError::new(
                    "create_buffer",
                    DeviceErrorKind::OutOfMemory {
                        requested: padded,
                        available: limit.saturating_sub(state.allocated),
                    },
                ));
            }
        }
        state.next_id += 1;
        let id = state.next_id;
        state.allocated += padded;
        state.buffers.insert(
            id,
            HostBuffer {
                label: label.to_string(),
                size,
                words: vec![0u64; (padded / 8) as usize],
            },
        );
        Ok(id)
    }

    fn release_buffer(&self, id: BufferId) {
        let mut state = self.state.lock();
        if let Err(err) = state.drain() {
            log::error!("pending work failed while releasing buffer {id}: {err}");
        }
        if let Some(buffer) = state.buffers.remove(&id) {
            state.allocated -= (buffer.words.len() * 8) as u64;
        }
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check_range("write_buffer", id, offset, data.len() as u64)?;
        state.pending.push(Command::Write {
            id,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn copy_buffer(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check_range("copy_buffer", src, src_offset, size)?;
        state.check_range("copy_buffer", dst, dst_offset, size)?;
        state.pending.push(Command::Copy {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    fn launch(&self, kernel: &Kernel) -> Result<(), DeviceError> {
        self.state.lock().pending.push(Command::Launch(*kernel));
        Ok(())
    }

    fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.state.lock();
        state.drain()?;
        state.check_range("read_buffer", id, offset, size)?;
        let start = offset as usize;
        Ok(state.buffers[&id].bytes()[start..start + size as usize].to_vec())
    }

    fn sync(&self) -> Result<(), DeviceError> {
        self.state.lock().drain()
    }

    fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated
    }
}

struct Inputs<'a> {
    buffers: &'a HashMap<BufferId, HostBuffer>,
    kernel: &'static str,
}

impl<'a> Inputs<'a> {
    fn f(&self, buffer: DeviceBuffer<f64>) -> Result<&'a [f64], DeviceError> {
        self.buffers
            .get(&buffer.id())
            .map(HostBuffer::f64s)
            .ok_or_else(|| DeviceError::new(self.kernel, DeviceErrorKind::InvalidBuffer(buffer.id())))
    }

    fn u(&self, buffer: DeviceBuffer<u32>) -> Result<&'a [u32], DeviceError> {
        self.buffers
            .get(&buffer.id())
            .map(HostBuffer::u32s)
            .ok_or_else(|| DeviceError::new(self.kernel, DeviceErrorKind::InvalidBuffer(buffer.id())))
    }

    fn rows(&self, csr: &CsrBindings) -> Result<Rows<'a>, DeviceError> {
        Ok(Rows {
            row_ptr: self.u(csr.row_ptr)?,
            col_index: self.u(csr.col_index)?,
            diag_index: self.u(csr.diag_index)?,
            permed_index: self.u(csr.permed_index)?,
            cell_boundary_ptr: self.u(csr.cell_boundary_ptr)?,
            ns: csr.num_surfaces,
        })
    }
}

/// Read-only view of the CSR bindings used by row kernels.
struct Rows<'a> {
    row_ptr: &'a [u32],
    col_index: &'a [u32],
    diag_index: &'a [u32],
    permed_index: &'a [u32],
    cell_boundary_ptr: &'a [u32],
    ns: u32,
}

impl Rows<'_> {
    /// Calls `f(k, slot, column, upper)` for every off-diagonal entry of `row`.
    #[inline]
    fn for_each_face(&self, row: usize, mut f: impl FnMut(usize, usize, usize, bool)) {
        let diag = self.diag_index[row] as usize;
        for k in self.row_ptr[row] as usize..self.row_ptr[row + 1] as usize {
            if k == diag {
                continue;
            }
            let j = off_diagonal_slot(row, k, diag);
            f(k, j, self.col_index[k] as usize, self.permed_index[j] >= self.ns);
        }
    }

    fn boundary_faces(&self, row: usize) -> std::ops::Range<usize> {
        self.cell_boundary_ptr[row] as usize..self.cell_boundary_ptr[row + 1] as usize
    }
}

#[inline]
fn interpolate(upper: bool, w: f64, here: f64, there: f64) -> f64 {
    if upper {
        w * here + (1.0 - w) * there
    } else {
        w * there + (1.0 - w) * here
    }
}

#[inline]
fn sign(upper: bool) -> f64 {
    if upper {
        1.0
    } else {
        -1.0
    }
}

#[inline]
fn vec3(data: &[f64], i: usize) -> Vector3<f64> {
    Vector3::new(data[3 * i], data[3 * i + 1], data[3 * i + 2])
}

#[inline]
fn mat3(data: &[f64], i: usize) -> Matrix3<f64> {
    Matrix3::from_row_slice(&data[9 * i..9 * i + 9])
}

fn patch(kernel: &'static str, id: u32) -> Result<PatchType, DeviceError> {
    PatchType::from_gpu_id(id)
        .ok_or_else(|| DeviceError::new(kernel, DeviceErrorKind::Backend(format!("invalid patch type tag {id}"))))
}

fn execute_kernel(kernel: &Kernel, ins: &Inputs<'_>, outs: &mut [&mut [f64]]) -> Result<(), DeviceError> {
    match *kernel {
        Kernel::Fill { value, .. } => {
            outs[0].par_iter_mut().for_each(|x| *x = value);
        }
        Kernel::Gather {
            src,
            index,
            ncmpt,
            wrap,
            ..
        } => {
            let src = ins.f(src)?;
            let index = ins.u(index)?;
            let n = ncmpt as usize;
            outs[0]
                .par_chunks_mut(n)
                .zip(index.par_iter())
                .for_each(|(dst, &i)| {
                    let s = if wrap > 0 { i % wrap } else { i } as usize;
                    dst.copy_from_slice(&src[s * n..(s + 1) * n]);
                });
        }
        Kernel::Product { a, b, .. } => {
            let (a, b) = (ins.f(a)?, ins.f(b)?);
            outs[0]
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, x)| *x = a[i] * b[i]);
        }
        Kernel::UpwindWeight { phi, .. } => {
            let phi = ins.f(phi)?;
            outs[0]
                .par_iter_mut()
                .zip(phi.par_iter())
                .for_each(|(w, &f)| *w = if f >= 0.0 { 1.0 } else { 0.0 });
        }
        Kernel::FvmDdt {
            sys,
            diag_index,
            volume,
            rho,
            rho_old,
            psi_old,
            rdt,
        } => {
            let diag = ins.u(diag_index)?;
            let (vol, rho, rho_old, psi_old) =
                (ins.f(volume)?, ins.f(rho)?, ins.f(rho_old)?, ins.f(psi_old)?);
            let (nnz, ncmpt) = (sys.nnz as usize, sys.ncmpt as usize);
            let (values, rest) = outs.split_at_mut(1);
            let (values, source) = (&mut *values[0], &mut *rest[0]);
            for i in 0..sys.num_cells as usize {
                let d = rdt * rho[i] * vol[i];
                for c in 0..ncmpt {
                    values[c * nnz + diag[i] as usize] += d;
                    source[i * ncmpt + c] += rdt * rho_old[i] * psi_old[i * ncmpt + c] * vol[i];
                }
            }
        }
        Kernel::FvmDiv {
            sys,
            csr,
            weight,
            phi,
            coeff,
        } => {
            let rows = ins.rows(&csr)?;
            let (weight, phi) = (ins.f(weight)?, ins.f(phi)?);
            let (nnz, ncmpt) = (sys.nnz as usize, sys.ncmpt as usize);
            let values = &mut *outs[0];
            for i in 0..csr.num_cells as usize {
                let mut diag_sum = 0.0;
                rows.for_each_face(i, |k, j, _, upper| {
                    let (w, f) = (weight[j], phi[j]);
                    let (off, d) = if upper {
                        ((1.0 - w) * f, w * f)
                    } else {
                        (-w * f, -(1.0 - w) * f)
                    };
                    for c in 0..ncmpt {
                        values[c * nnz + k] += coeff * off;
                    }
                    diag_sum += coeff * d;
                });
                let diag = rows.diag_index[i] as usize;
                for c in 0..ncmpt {
                    values[c * nnz + diag] += diag_sum;
                }
            }
        }
        Kernel::FvmLaplacian {
            sys,
            csr,
            faces,
            gamma,
            face_gamma,
            coeff,
        } => {
            let rows = ins.rows(&csr)?;
            let (weight, mag_sf, delta, gamma) = (
                ins.f(faces.weight)?,
                ins.f(faces.mag_sf)?,
                ins.f(faces.delta_coeffs)?,
                ins.f(gamma)?,
            );
            let (nnz, ncmpt, ns) = (sys.nnz as usize, sys.ncmpt as usize, csr.num_surfaces);
            let values = &mut *outs[0];
            for i in 0..csr.num_cells as usize {
                let mut diag_sum = 0.0;
                rows.for_each_face(i, |k, j, col, upper| {
                    let gamma_f = if face_gamma {
                        gamma[(rows.permed_index[j] % ns) as usize]
                    } else {
                        interpolate(upper, weight[j], gamma[i], gamma[col])
                    };
                    let c_f = coeff * gamma_f * mag_sf[j] * delta[j];
                    for c in 0..ncmpt {
                        values[c * nnz + k] += c_f;
                    }
                    diag_sum -= c_f;
                });
                let diag = rows.diag_index[i] as usize;
                for c in 0..ncmpt {
                    values[c * nnz + diag] += diag_sum;
                }
            }
        }
        Kernel::BoundaryDiv {
            sys,
            patch_type,
            phi,
            weight,
            value,
            coeff,
        } => {
            let types = ins.u(patch_type)?;
            let (phi, weight, value) = (ins.f(phi)?, ins.f(weight)?, ins.f(value)?);
            let ncmpt = sys.ncmpt as usize;
            let (internal, rest) = outs.split_at_mut(1);
            let (internal, boundary) = (&mut *internal[0], &mut *rest[0]);
            for f in 0..sys.num_boundary_faces as usize {
                let ty = patch(kernel.name(), types[f])?;
                for c in 0..ncmpt {
                    let idx = f * ncmpt + c;
                    let (vic, vbc) = ty.value_coeffs(value[idx], weight[f]);
                    internal[idx] += coeff * phi[f] * vic;
                    boundary[idx] -= coeff * phi[f] * vbc;
                }
            }
        }
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
        } => {
            let types = ins.u(patch_type)?;
            let (gamma, mag_sf, delta, value, gradient) = (
                ins.f(gamma)?,
                ins.f(mag_sf)?,
                ins.f(delta_coeffs)?,
                ins.f(value)?,
                ins.f(gradient)?,
            );
            let ncmpt = sys.ncmpt as usize;
            let (internal, rest) = outs.split_at_mut(1);
            let (internal, boundary) = (&mut *internal[0], &mut *rest[0]);
            for f in 0..sys.num_boundary_faces as usize {
                let ty = patch(kernel.name(), types[f])?;
                let gamma_mag_sf = gamma[f] * mag_sf[f];
                for c in 0..ncmpt {
                    let idx = f * ncmpt + c;
                    let (gic, gbc) = if fixed_gradient && ty != PatchType::Empty {
                        (0.0, gradient[idx])
                    } else {
                        ty.gradient_coeffs(value[idx], delta[f])
                    };
                    internal[idx] += coeff * gamma_mag_sf * gic;
                    boundary[idx] -= coeff * gamma_mag_sf * gbc;
                }
            }
        }
        Kernel::AddBoundaryDiagSrc {
            sys,
            diag_index,
            cell_offset,
            cell_id,
        } => {
            let (diag, offset, cells) = (ins.u(diag_index)?, ins.u(cell_offset)?, ins.u(cell_id)?);
            let internal = ins.f(sys.internal_coeffs)?;
            let boundary = ins.f(sys.boundary_coeffs)?;
            let (nnz, ncmpt) = (sys.nnz as usize, sys.ncmpt as usize);
            let (values, rest) = outs.split_at_mut(1);
            let (values, source) = (&mut *values[0], &mut *rest[0]);
            for (g, &cell) in cells.iter().enumerate() {
                let cell = cell as usize;
                for c in 0..ncmpt {
                    let mut int_sum = 0.0;
                    let mut bnd_sum = 0.0;
                    for f in offset[g] as usize..offset[g + 1] as usize {
                        int_sum += internal[f * ncmpt + c];
                        bnd_sum += boundary[f * ncmpt + c];
                    }
                    values[c * nnz + diag[cell] as usize] += int_sum;
                    source[cell * ncmpt + c] += bnd_sum;
                }
            }
        }
        Kernel::FvcGradScalar {
            field,
            boundary_field,
            csr,
            faces,
            volume,
            coeff,
            volume_scaled,
            ..
        } => {
            let rows = ins.rows(&csr)?;
            let (psi, psi_b, weight, sf, bsf, vol) = (
                ins.f(field)?,
                ins.f(boundary_field)?,
                ins.f(faces.weight)?,
                ins.f(faces.sf)?,
                ins.f(faces.boundary_sf)?,
                ins.f(volume)?,
            );
            outs[0].par_chunks_mut(3).enumerate().for_each(|(i, out)| {
                let mut acc = Vector3::<f64>::zeros();
                rows.for_each_face(i, |_, j, col, upper| {
                    let face = interpolate(upper, weight[j], psi[i], psi[col]);
                    acc += vec3(sf, j) * (sign(upper) * face);
                });
                for b in rows.boundary_faces(i) {
                    acc += vec3(bsf, b) * psi_b[b];
                }
                let scale = if volume_scaled { coeff / vol[i] } else { coeff };
                for d in 0..3 {
                    out[d] += scale * acc[d];
                }
            });
        }
        Kernel::FvcGradVector {
            field,
            boundary_field,
            csr,
            faces,
            volume,
            ..
        } => {
            let rows = ins.rows(&csr)?;
            let (u, u_b, weight, sf, bsf, vol) = (
                ins.f(field)?,
                ins.f(boundary_field)?,
                ins.f(faces.weight)?,
                ins.f(faces.sf)?,
                ins.f(faces.boundary_sf)?,
                ins.f(volume)?,
            );
            outs[0].par_chunks_mut(9).enumerate().for_each(|(i, out)| {
                let mut grad = Matrix3::<f64>::zeros();
                let u_i = vec3(u, i);
                rows.for_each_face(i, |_, j, col, upper| {
                    let w = weight[j];
                    let u_c = vec3(u, col);
                    let face = if upper {
                        u_i * w + u_c * (1.0 - w)
                    } else {
                        u_c * w + u_i * (1.0 - w)
                    };
                    grad += vec3(sf, j) * face.transpose() * sign(upper);
                });
                for b in rows.boundary_faces(i) {
                    grad += vec3(bsf, b) * vec3(u_b, b).transpose();
                }
                grad /= vol[i];
                for a in 0..3 {
                    for c in 0..3 {
                        out[3 * a + c] = grad[(a, c)];
                    }
                }
            });
        }
        Kernel::Dev2Transpose { grad, .. } => {
            let grad = ins.f(grad)?;
            outs[0].par_chunks_mut(9).enumerate().for_each(|(i, out)| {
                let t = mat3(grad, i).transpose();
                let dev2 = t - Matrix3::identity() * (2.0 / 3.0 * t.trace());
                for a in 0..3 {
                    for c in 0..3 {
                        out[3 * a + c] = dev2[(a, c)];
                    }
                }
            });
        }
        Kernel::FvcDivTensor {
            tensor,
            gamma,
            boundary_gamma,
            csr,
            faces,
            coeff,
            ..
        } => {
            let rows = ins.rows(&csr)?;
            let (t, gamma, gamma_b, weight, sf, bsf) = (
                ins.f(tensor)?,
                ins.f(gamma)?,
                ins.f(boundary_gamma)?,
                ins.f(faces.weight)?,
                ins.f(faces.sf)?,
                ins.f(faces.boundary_sf)?,
            );
            outs[0].par_chunks_mut(3).enumerate().for_each(|(i, out)| {
                let t_i = mat3(t, i) * gamma[i];
                let mut acc = Vector3::<f64>::zeros();
                rows.for_each_face(i, |_, j, col, upper| {
                    let w = weight[j];
                    let t_c = mat3(t, col) * gamma[col];
                    let face = if upper {
                        t_i * w + t_c * (1.0 - w)
                    } else {
                        t_c * w + t_i * (1.0 - w)
                    };
                    acc += face.transpose() * vec3(sf, j) * sign(upper);
                });
                for b in rows.boundary_faces(i) {
                    acc += (mat3(t, i) * gamma_b[b]).transpose() * vec3(bsf, b);
                }
                for d in 0..3 {
                    out[d] += coeff * acc[d];
                }
            });
        }
        Kernel::FvcDivFaceScalar {
            phi,
            field,
            boundary_phi,
            boundary_field,
            csr,
            weight,
            coeff,
            ..
        } => {
            let rows = ins.rows(&csr)?;
            let (phi, k, phi_b, k_b, weight) = (
                ins.f(phi)?,
                ins.f(field)?,
                ins.f(boundary_phi)?,
                ins.f(boundary_field)?,
                ins.f(weight)?,
            );
            outs[0].par_iter_mut().enumerate().for_each(|(i, out)| {
                let mut acc = 0.0;
                rows.for_each_face(i, |_, j, col, upper| {
                    acc += sign(upper) * phi[j] * interpolate(upper, weight[j], k[i], k[col]);
                });
                for b in rows.boundary_faces(i) {
                    acc += phi_b[b] * k_b[b];
                }
                *out += coeff * acc;
            });
        }
        Kernel::FvcDivCellVector {
            field,
            boundary_field,
            csr,
            faces,
            coeff,
            ..
        } => {
            let rows = ins.rows(&csr)?;
            let (v, v_b, weight, sf, bsf) = (
                ins.f(field)?,
                ins.f(boundary_field)?,
                ins.f(faces.weight)?,
                ins.f(faces.sf)?,
                ins.f(faces.boundary_sf)?,
            );
            outs[0].par_iter_mut().enumerate().for_each(|(i, out)| {
                let v_i = vec3(v, i);
                let mut acc = 0.0;
                rows.for_each_face(i, |_, j, col, upper| {
                    let w = weight[j];
                    let v_c = vec3(v, col);
                    let face = if upper {
                        v_i * w + v_c * (1.0 - w)
                    } else {
                        v_c * w + v_i * (1.0 - w)
                    };
                    acc += sign(upper) * vec3(sf, j).dot(&face);
                });
                for b in rows.boundary_faces(i) {
                    acc += vec3(bsf, b).dot(&vec3(v_b, b));
                }
                *out += coeff * acc;
            });
        }
        Kernel::FvcDivFlux {
            flux,
            boundary_flux,
            csr,
            coeff,
            ..
        } => {
            let rows = ins.rows(&csr)?;
            let (flux, flux_b) = (ins.f(flux)?, ins.f(boundary_flux)?);
            outs[0].par_iter_mut().enumerate().for_each(|(i, out)| {
                let mut acc = 0.0;
                rows.for_each_face(i, |_, j, _, upper| acc += sign(upper) * flux[j]);
                for b in rows.boundary_faces(i) {
                    acc += flux_b[b];
                }
                *out += coeff * acc;
            });
        }
        Kernel::FvcDdt {
            rho,
            rho_old,
            field,
            volume,
            rdt,
            coeff,
            ..
        } => {
            let (rho, rho_old, vol) = (ins.f(rho)?, ins.f(rho_old)?, ins.f(volume)?);
            let field = match field {
                Some((f, f_old)) => Some((ins.f(f)?, ins.f(f_old)?)),
                None => None,
            };
            outs[0].par_iter_mut().enumerate().for_each(|(i, out)| {
                let (f, f_old) = field.map_or((1.0, 1.0), |(f, f_old)| (f[i], f_old[i]));
                *out += coeff * rdt * (rho[i] * f - rho_old[i] * f_old) * vol[i];
            });
        }
        Kernel::AddCellSource {
            field,
            volume,
            ncmpt,
            coeff,
            volume_scaled,
            ..
        } => {
            let (field, vol) = (ins.f(field)?, ins.f(volume)?);
            let n = ncmpt as usize;
            outs[0].par_iter_mut().enumerate().for_each(|(idx, out)| {
                let scale = if volume_scaled { vol[idx / n] } else { 1.0 };
                *out += coeff * field[idx] * scale;
            });
        }
        Kernel::AddLduMatrix {
            sys,
            ldu,
            ldu_source,
            tmp_perm,
            coeff,
        } => {
            let (ldu, ldu_source, perm) = (ins.f(ldu)?, ins.f(ldu_source)?, ins.u(tmp_perm)?);
            let nnz = sys.nnz as usize;
            let (values, rest) = outs.split_at_mut(1);
            let (values, source) = (&mut *values[0], &mut *rest[0]);
            for c in 0..sys.ncmpt as usize {
                for k in 0..nnz {
                    values[c * nnz + k] += coeff * ldu[perm[k] as usize];
                }
            }
            for (s, &e) in source.iter_mut().zip(ldu_source) {
                *s += coeff * e;
            }
        }
        Kernel::ComputeA {
            sys,
            diag_index,
            cell_boundary_ptr,
            volume,
            ..
        } => {
            let (values, internal) = (ins.f(sys.values)?, ins.f(sys.internal_coeffs)?);
            let (diag, ptr, vol) = (ins.u(diag_index)?, ins.u(cell_boundary_ptr)?, ins.f(volume)?);
            let ncmpt = sys.ncmpt as usize;
            outs[0].par_iter_mut().enumerate().for_each(|(i, out)| {
                let (int_0, avg) = internal_sums(internal, ptr, i, ncmpt, 0);
                *out = (values[diag[i] as usize] - int_0 + avg) / vol[i];
            });
        }
        Kernel::ComputeH { sys, csr, volume, .. } => {
            let rows = ins.rows(&csr)?;
            let (values, source, psi, internal, vol) = (
                ins.f(sys.values)?,
                ins.f(sys.source)?,
                ins.f(sys.psi)?,
                ins.f(sys.internal_coeffs)?,
                ins.f(volume)?,
            );
            let (nnz, ncmpt) = (sys.nnz as usize, sys.ncmpt as usize);
            outs[0].par_chunks_mut(ncmpt).enumerate().for_each(|(i, out)| {
                for c in 0..ncmpt {
                    let mut h = source[i * ncmpt + c];
                    rows.for_each_face(i, |k, _, col, _| {
                        h -= values[c * nnz + k] * psi[col * ncmpt + c];
                    });
                    let (int_c, avg) = internal_sums(internal, rows.cell_boundary_ptr, i, ncmpt, c);
                    h += (avg - int_c) * psi[i * ncmpt + c];
                    out[c] = h / vol[i];
                }
            });
        }
        Kernel::FaceFlux {
            sys,
            face_csr_index,
            owner,
            neighbour,
            ..
        } => {
            let (values, psi) = (ins.f(sys.values)?, ins.f(sys.psi)?);
            let (fci, owner, neighbour) = (ins.u(face_csr_index)?, ins.u(owner)?, ins.u(neighbour)?);
            let ns = owner.len();
            outs[0].par_iter_mut().enumerate().for_each(|(f, out)| {
                let lower = values[fci[f] as usize];
                let upper = values[fci[ns + f] as usize];
                *out += upper * psi[neighbour[f] as usize] - lower * psi[owner[f] as usize];
            });
        }
        Kernel::BoundaryFaceFlux {
            sys,
            boundary_face_cell,
            ..
        } => {
            let (internal, boundary, psi) = (
                ins.f(sys.internal_coeffs)?,
                ins.f(sys.boundary_coeffs)?,
                ins.f(sys.psi)?,
            );
            let cells = ins.u(boundary_face_cell)?;
            outs[0].par_iter_mut().enumerate().for_each(|(b, out)| {
                *out += internal[b] * psi[cells[b] as usize] - boundary[b];
            });
        }
    }
    Ok(())
}

/// Component `c` of the summed internal coefficients of `cell`, plus their
/// component average.
fn internal_sums(internal: &[f64], ptr: &[u32], cell: usize, ncmpt: usize, c: usize) -> (f64, f64) {
    let mut sums = [0.0f64; 3];
    for f in ptr[cell] as usize..ptr[cell + 1] as usize {
        for (cc, sum) in sums.iter_mut().enumerate().take(ncmpt) {
            *sum += internal[f * ncmpt + cc];
        }
    }
    let avg = sums[..ncmpt].iter().sum::<f64>() / ncmpt as f64;
    (sums[c], avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(dev: &HostDevice, data: &[f64]) -> DeviceBuffer<f64> {
        let id = dev.create_buffer("test", (data.len() * 8) as u64).unwrap();
        dev.write_buffer(id, 0, bytemuck::cast_slice(data)).unwrap();
        DeviceBuffer::from_raw(id, data.len())
    }

    fn read(dev: &HostDevice, buf: DeviceBuffer<f64>) -> Vec<f64> {
        let bytes = dev.read_buffer(buf.id(), 0, buf.size_bytes()).unwrap();
        bytemuck::pod_collect_to_vec(&bytes)
    }

    #[test]
    fn commands_wait_for_sync() {
        let dev = HostDevice::new();
        let buf = upload(&dev, &[1.0, 2.0]);
        dev.launch(&Kernel::Fill { dst: buf, value: 7.0 }).unwrap();
        assert_eq!(dev.pending_commands(), 2);
        dev.sync().unwrap();
        assert_eq!(dev.pending_commands(), 0);
        assert_eq!(read(&dev, buf), vec![7.0, 7.0]);
    }

    #[test]
    fn stream_preserves_submission_order() {
        let dev = HostDevice::new();
        let a = upload(&dev, &[1.0, 2.0, 3.0]);
        let b = upload(&dev, &[0.0; 3]);
        dev.copy_buffer(a.id(), 0, b.id(), 0, 24).unwrap();
        dev.write_buffer(a.id(), 0, bytemuck::cast_slice(&[9.0f64])).unwrap();
        assert_eq!(read(&dev, b), vec![1.0, 2.0, 3.0]);
        assert_eq!(read(&dev, a), vec![9.0, 2.0, 3.0]);
    }

    #[test]
    fn memory_limit_reports_out_of_memory() {
        let dev = HostDevice::with_memory_limit(64);
        dev.create_buffer("a", 48).unwrap();
        let err = dev.create_buffer("b", 48).unwrap_err();
        assert!(matches!(err.kind, DeviceErrorKind::OutOfMemory { requested: 48, available: 16 }));
        assert_eq!(dev.live_buffers(), 1);
    }

    #[test]
    fn release_returns_memory() {
        let dev = HostDevice::new();
        let id = dev.create_buffer("a", 20).unwrap();
        assert_eq!(dev.allocated_bytes(), 24);
        assert_eq!(dev.buffer_label(id).as_deref(), Some("a"));
        dev.release_buffer(id);
        assert_eq!(dev.allocated_bytes(), 0);
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let dev = HostDevice::new();
        let buf = upload(&dev, &[0.0; 2]);
        let err = dev.write_buffer(buf.id(), 8, &[0u8; 16]).unwrap_err();
        assert_eq!(err.op, "write_buffer");
        assert!(dev.write_buffer(999, 0, &[0u8; 8]).is_err());
    }

    #[test]
    fn gather_wraps_face_index() {
        let dev = HostDevice::new();
        let src = upload(&dev, &[10.0, 20.0]);
        let dst = upload(&dev, &[0.0; 4]);
        let idx_id = dev.create_buffer("idx", 16).unwrap();
        dev.write_buffer(idx_id, 0, bytemuck::cast_slice(&[2u32, 0, 3, 1])).unwrap();
        let index = DeviceBuffer::<u32>::from_raw(idx_id, 4);
        dev.launch(&Kernel::Gather {
            dst,
            src,
            index,
            ncmpt: 1,
            wrap: 2,
        })
        .unwrap();
        assert_eq!(read(&dev, dst), vec![10.0, 10.0, 20.0, 20.0]);
    }

    #[test]
    fn dev2_transpose_of_shear() {
        let dev = HostDevice::new();
        // du_x/dy = 2, du_y/dy = 3
        let mut g = [0.0; 9];
        g[3] = 2.0;
        g[4] = 3.0;
        let grad = upload(&dev, &g);
        let out = upload(&dev, &[0.0; 9]);
        dev.launch(&Kernel::Dev2Transpose { out, grad }).unwrap();
        let r = read(&dev, out);
        assert_eq!(r[1], 2.0);
        assert_eq!(r[3], 0.0);
        assert!((r[0] + 2.0).abs() < 1e-15);
        assert!((r[4] - 1.0).abs() < 1e-15);
        assert!((r[8] + 2.0).abs() < 1e-15);
    }
}
