use std::time::{Duration, Instant};

use wide::f64x4;

use crate::solver::options::{KrylovMethod, LinearSolverConfig, PreconditionerType};

#[derive(Clone, Debug)]
pub struct SparseMatrix {
    pub values: Vec<f64>,
    pub col_indices: Vec<usize>,
    pub row_offsets: Vec<usize>,
    pub n_rows: usize,
    pub n_cols: usize,
}

impl SparseMatrix {
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            values: Vec::new(),
            col_indices: Vec::new(),
            row_offsets: vec![0; n_rows + 1],
            n_rows,
            n_cols,
        }
    }

    /// Square matrix over an existing CSR skeleton.
    pub fn from_csr(row_ptr: &[u32], col_index: &[u32], values: Vec<f64>) -> Self {
        let n = row_ptr.len().saturating_sub(1);
        Self {
            values,
            col_indices: col_index.iter().map(|&c| c as usize).collect(),
            row_offsets: row_ptr.iter().map(|&r| r as usize).collect(),
            n_rows: n,
            n_cols: n,
        }
    }

    pub fn from_triplets(n_rows: usize, n_cols: usize, triplets: &[(usize, usize, f64)]) -> Self {
        let mut row_offsets = vec![0; n_rows + 1];
        for &(r, _, _) in triplets {
            row_offsets[r + 1] += 1;
        }
        for i in 0..n_rows {
            row_offsets[i + 1] += row_offsets[i];
        }

        let mut mat = Self::new(n_rows, n_cols);
        mat.values = vec![0.0; triplets.len()];
        mat.col_indices = vec![0; triplets.len()];

        let mut next = row_offsets.clone();
        for &(r, c, v) in triplets {
            let idx = next[r];
            mat.values[idx] = v;
            mat.col_indices[idx] = c;
            next[r] += 1;
        }
        mat.row_offsets = row_offsets;
        mat
    }

    pub fn mat_vec_mul(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.n_cols);
        debug_assert_eq!(y.len(), self.n_rows);

        for (i, yi) in y.iter_mut().enumerate() {
            let mut sum = 0.0;
            for j in self.row_offsets[i]..self.row_offsets[i + 1] {
                sum += self.values[j] * x[self.col_indices[j]];
            }
            *yi = sum;
        }
    }

    pub fn diagonal(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.n_rows];
        for (i, d) in diag.iter_mut().enumerate() {
            for j in self.row_offsets[i]..self.row_offsets[i + 1] {
                if self.col_indices[j] == i {
                    *d += self.values[j];
                }
            }
        }
        diag
    }
}

#[derive(Default, Clone, Copy, Debug, PartialEq)]
pub struct LinearSolverStats {
    pub iterations: usize,
    pub residual: f64,
    pub initial_residual: f64,
    pub converged: bool,
    pub diverged: bool,
    pub time: Duration,
}

const BREAKDOWN: f64 = 1e-300;
const DIVERGENCE_FACTOR: f64 = 1e10;

struct Preconditioner {
    inv_diag: Option<Vec<f64>>,
}

impl Preconditioner {
    fn new(a: &SparseMatrix, kind: PreconditionerType) -> Self {
        let inv_diag = match kind {
            PreconditionerType::None => None,
            PreconditionerType::Jacobi => Some(
                a.diagonal()
                    .into_iter()
                    .map(|d| if d.abs() > BREAKDOWN { 1.0 / d } else { 1.0 })
                    .collect(),
            ),
        };
        Self { inv_diag }
    }

    fn apply(&self, r: &[f64], z: &mut [f64]) {
        match &self.inv_diag {
            Some(inv) => mul(inv, r, z),
            None => z.copy_from_slice(r),
        }
    }
}

/// Solves `a x = b` starting from the current `x`. Non-convergence is
/// reported through the stats, never as an error.
pub fn solve(a: &SparseMatrix, b: &[f64], x: &mut [f64], config: &LinearSolverConfig) -> LinearSolverStats {
    let start = Instant::now();
    let precond = Preconditioner::new(a, config.preconditioner);
    let (iterations, residual, initial_residual) = match config.method {
        KrylovMethod::BiCgStab => solve_bicgstab(a, b, x, &precond, config),
        KrylovMethod::Cg => solve_cg(a, b, x, &precond, config),
    };
    let diverged = !residual.is_finite() || residual > DIVERGENCE_FACTOR * initial_residual.max(config.tolerance);
    LinearSolverStats {
        iterations,
        residual,
        initial_residual,
        converged: !diverged && is_converged(residual, initial_residual, config),
        diverged,
        time: start.elapsed(),
    }
}

fn is_converged(residual: f64, initial: f64, config: &LinearSolverConfig) -> bool {
    residual <= config.tolerance || (config.rel_tol > 0.0 && residual <= config.rel_tol * initial)
}

fn residual(a: &SparseMatrix, b: &[f64], x: &[f64], r: &mut [f64]) {
    a.mat_vec_mul(x, r);
    // r = b - Ax
    let mut i = 0;
    let n = b.len();
    while i + 4 <= n {
        let res: [f64; 4] = (f64x4::from(&b[i..i + 4]) - f64x4::from(&r[i..i + 4])).into();
        r[i..i + 4].copy_from_slice(&res);
        i += 4;
    }
    while i < n {
        r[i] = b[i] - r[i];
        i += 1;
    }
}

fn solve_bicgstab(
    a: &SparseMatrix,
    b: &[f64],
    x: &mut [f64],
    precond: &Preconditioner,
    config: &LinearSolverConfig,
) -> (usize, f64, f64) {
    let n = b.len();
    let mut r = vec![0.0; n];
    residual(a, b, x, &mut r);

    let init_resid = norm(&r);
    if is_converged(init_resid, init_resid, config) && init_resid <= config.tolerance {
        return (0, init_resid, init_resid);
    }

    let r0 = r.clone();
    let mut rho_old = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;
    let mut v = vec![0.0; n];
    let mut p = vec![0.0; n];
    let mut p_hat = vec![0.0; n];
    let mut s = vec![0.0; n];
    let mut s_hat = vec![0.0; n];
    let mut t = vec![0.0; n];
    let mut resid = init_resid;

    for iter in 0..config.max_iter {
        let rho_new = dot(&r0, &r);
        if !rho_new.is_finite() {
            log::warn!("BiCGStab: rho is not finite at iteration {iter}");
            return (iter, f64::NAN, init_resid);
        }
        if rho_new.abs() < BREAKDOWN {
            return (iter, resid, init_resid);
        }

        if iter == 0 {
            p.copy_from_slice(&r);
        } else {
            // p = r + beta * (p - omega * v)
            let beta = (rho_new / rho_old) * (alpha / omega);
            let (v_beta, v_omega) = (f64x4::splat(beta), f64x4::splat(omega));
            let mut i = 0;
            while i + 4 <= n {
                let res: [f64; 4] = (f64x4::from(&r[i..i + 4])
                    + v_beta * (f64x4::from(&p[i..i + 4]) - v_omega * f64x4::from(&v[i..i + 4])))
                .into();
                p[i..i + 4].copy_from_slice(&res);
                i += 4;
            }
            while i < n {
                p[i] = r[i] + beta * (p[i] - omega * v[i]);
                i += 1;
            }
        }

        precond.apply(&p, &mut p_hat);
        a.mat_vec_mul(&p_hat, &mut v);
        let r0_v = dot(&r0, &v);
        if r0_v.abs() < BREAKDOWN {
            return (iter, resid, init_resid);
        }
        alpha = rho_new / r0_v;

        // s = r - alpha * v
        s.copy_from_slice(&r);
        axpy(-alpha, &v, &mut s);

        let s_norm = norm(&s);
        if is_converged(s_norm, init_resid, config) {
            axpy(alpha, &p_hat, x);
            return (iter + 1, s_norm, init_resid);
        }

        precond.apply(&s, &mut s_hat);
        a.mat_vec_mul(&s_hat, &mut t);
        let t_t = dot(&t, &t);
        omega = if t_t.abs() < BREAKDOWN { 0.0 } else { dot(&t, &s) / t_t };

        axpy(alpha, &p_hat, x);
        axpy(omega, &s_hat, x);
        r.copy_from_slice(&s);
        axpy(-omega, &t, &mut r);

        resid = norm(&r);
        if !resid.is_finite() || resid > DIVERGENCE_FACTOR * init_resid {
            log::warn!("BiCGStab diverging at iteration {iter}: residual {resid:e}");
            return (iter + 1, resid, init_resid);
        }
        if is_converged(resid, init_resid, config) {
            return (iter + 1, resid, init_resid);
        }
        if omega.abs() < BREAKDOWN {
            return (iter + 1, resid, init_resid);
        }
        rho_old = rho_new;
    }

    (config.max_iter, resid, init_resid)
}

fn solve_cg(
    a: &SparseMatrix,
    b: &[f64],
    x: &mut [f64],
    precond: &Preconditioner,
    config: &LinearSolverConfig,
) -> (usize, f64, f64) {
    let n = b.len();
    let mut r = vec![0.0; n];
    residual(a, b, x, &mut r);
    let init_resid = norm(&r);

    let mut z = vec![0.0; n];
    precond.apply(&r, &mut z);
    let mut p = z.clone();
    let mut rz_old = dot(&r, &z);
    let mut q = vec![0.0; n];
    let mut resid = init_resid;

    for iter in 0..config.max_iter {
        if resid <= config.tolerance || (iter > 0 && is_converged(resid, init_resid, config)) {
            return (iter, resid, init_resid);
        }

        a.mat_vec_mul(&p, &mut q);
        let p_q = dot(&p, &q);
        if p_q.abs() < BREAKDOWN {
            return (iter, resid, init_resid);
        }
        let alpha = rz_old / p_q;
        axpy(alpha, &p, x);
        axpy(-alpha, &q, &mut r);

        resid = norm(&r);
        if !resid.is_finite() {
            log::warn!("CG: residual is not finite at iteration {iter}");
            return (iter + 1, resid, init_resid);
        }
        if is_converged(resid, init_resid, config) {
            return (iter + 1, resid, init_resid);
        }

        precond.apply(&r, &mut z);
        let rz_new = dot(&r, &z);
        let beta = rz_new / rz_old;
        // p = z + beta * p
        let v_beta = f64x4::splat(beta);
        let mut i = 0;
        while i + 4 <= n {
            let res: [f64; 4] = (f64x4::from(&z[i..i + 4]) + v_beta * f64x4::from(&p[i..i + 4])).into();
            p[i..i + 4].copy_from_slice(&res);
            i += 4;
        }
        while i < n {
            p[i] = z[i] + beta * p[i];
            i += 1;
        }
        rz_old = rz_new;
    }

    (config.max_iter, resid, init_resid)
}

/// y += alpha * x
fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    let v_alpha = f64x4::splat(alpha);
    let n = x.len();
    let mut i = 0;
    while i + 4 <= n {
        let res: [f64; 4] = (f64x4::from(&y[i..i + 4]) + v_alpha * f64x4::from(&x[i..i + 4])).into();
        y[i..i + 4].copy_from_slice(&res);
        i += 4;
    }
    while i < n {
        y[i] += alpha * x[i];
        i += 1;
    }
}

fn mul(a: &[f64], b: &[f64], out: &mut [f64]) {
    let n = a.len();
    let mut i = 0;
    while i + 4 <= n {
        let res: [f64; 4] = (f64x4::from(&a[i..i + 4]) * f64x4::from(&b[i..i + 4])).into();
        out[i..i + 4].copy_from_slice(&res);
        i += 4;
    }
    while i < n {
        out[i] = a[i] * b[i];
        i += 1;
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = f64x4::splat(0.0);
    let mut i = 0;
    let n = a.len();
    while i + 4 <= n {
        sum += f64x4::from(&a[i..i + 4]) * f64x4::from(&b[i..i + 4]);
        i += 4;
    }
    let mut s = sum.reduce_add();
    while i < n {
        s += a[i] * b[i];
        i += 1;
    }
    s
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}
