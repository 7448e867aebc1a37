//! CSR skeleton and permutation tables derived from owner/neighbour connectivity.
//!
//! Every internal face `f` contributes two off-diagonal entries. In the flat
//! `[lower | upper]` source layout, entry `f` is the lower coefficient (row
//! `neighbour[f]`, column `owner[f]`) and entry `ns + f` is the upper one (row
//! `owner[f]`, column `neighbour[f]`). The external LDU layout inserts the
//! diagonal block between them: `[lower | diag | upper]`.
//!
//! All tables are produced the same way: enumerate `(row, column)` keys for the
//! source entries, stable-sort the source indices by key, and read the sorted
//! sequence back out. Ties keep source order, so layouts are reproducible.

use std::ops::Range;

use crate::solver::error::TopologyError;

#[derive(Debug, Clone)]
pub struct MatrixTopology {
    num_cells: usize,
    owner: Vec<u32>,
    neighbour: Vec<u32>,
    row_ptr: Vec<u32>,
    col_index: Vec<u32>,
    diag_index: Vec<u32>,
    permed_index: Vec<u32>,
    tmp_permutated_list: Vec<u32>,
    face_csr_index: Vec<u32>,
    bound_permutation_list: Vec<u32>,
    boundary_face_cell: Vec<u32>,
    boundary_cell_id: Vec<u32>,
    boundary_cell_offset: Vec<u32>,
    cell_boundary_ptr: Vec<u32>,
}

impl MatrixTopology {
    /// Builds the CSR skeleton and every permutation table.
    ///
    /// `boundary_face_cells[b]` is the cell owning boundary face `b`, in the
    /// host's patch-concatenated order.
    pub fn build(
        num_cells: usize,
        owner: &[u32],
        neighbour: &[u32],
        boundary_face_cells: &[u32],
    ) -> Result<Self, TopologyError> {
        validate_faces(num_cells, owner, neighbour)?;
        for (index, &cell) in boundary_face_cells.iter().enumerate() {
            check_cell("boundary_face_cells", index, cell, num_cells)?;
        }

        let ns = owner.len();
        let nnz = num_cells + 2 * ns;

        // [lower | diag | upper] keys
        let key = |src: usize| -> (u32, u32) {
            if src < ns {
                (neighbour[src], owner[src])
            } else if src < ns + num_cells {
                let cell = (src - ns) as u32;
                (cell, cell)
            } else {
                let f = src - ns - num_cells;
                (owner[f], neighbour[f])
            }
        };
        let mut order: Vec<u32> = (0..nnz as u32).collect();
        order.sort_by_key(|&src| key(src as usize));

        let mut row_counts = vec![0u32; num_cells];
        let mut col_index = Vec::with_capacity(nnz);
        let mut diag_index = vec![u32::MAX; num_cells];
        let mut permed_index = Vec::with_capacity(2 * ns);
        let mut face_csr_index = vec![0u32; 2 * ns];

        for (k, &src) in order.iter().enumerate() {
            let src = src as usize;
            let (row, col) = key(src);
            row_counts[row as usize] += 1;
            col_index.push(col);
            if src < ns {
                permed_index.push(src as u32);
                face_csr_index[src] = k as u32;
            } else if src < ns + num_cells {
                diag_index[row as usize] = k as u32;
            } else {
                let upper = src - num_cells;
                permed_index.push(upper as u32);
                face_csr_index[upper] = k as u32;
            }
        }

        let mut row_ptr = Vec::with_capacity(num_cells + 1);
        row_ptr.push(0u32);
        for count in &row_counts {
            let last = *row_ptr.last().unwrap_or(&0);
            row_ptr.push(last + count);
        }

        let (bound_permutation_list, boundary_face_cell) = sort_by_cell(boundary_face_cells);
        let (boundary_cell_id, boundary_cell_offset) = group_boundary_faces(&boundary_face_cell);

        let mut cell_boundary_ptr = vec![0u32; num_cells + 1];
        for &cell in &boundary_face_cell {
            cell_boundary_ptr[cell as usize + 1] += 1;
        }
        for i in 0..num_cells {
            cell_boundary_ptr[i + 1] += cell_boundary_ptr[i];
        }

        let topology = Self {
            num_cells,
            owner: owner.to_vec(),
            neighbour: neighbour.to_vec(),
            row_ptr,
            col_index,
            diag_index,
            permed_index,
            tmp_permutated_list: order,
            face_csr_index,
            bound_permutation_list,
            boundary_face_cell,
            boundary_cell_id,
            boundary_cell_offset,
            cell_boundary_ptr,
        };
        topology.validate()?;
        log::debug!(
            "topology: {} cells, {} internal faces, {} boundary faces on {} cells, nnz {}",
            num_cells,
            ns,
            topology.num_boundary_faces(),
            topology.num_boundary_cells(),
            nnz
        );
        Ok(topology)
    }

    /// Checks CSR well-formedness: monotone row pointer that ends at `nnz`,
    /// ascending columns, exactly one diagonal per row.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.row_ptr.len() != self.num_cells + 1 {
            return Err(TopologyError::SizeMismatch {
                what: "row_ptr",
                expected: self.num_cells + 1,
                actual: self.row_ptr.len(),
            });
        }
        for row in 0..self.num_cells {
            if self.row_ptr[row + 1] < self.row_ptr[row] {
                return Err(TopologyError::NonMonotoneRowPointer { row });
            }
        }
        if self.row_ptr[self.num_cells] as usize != self.nnz() {
            return Err(TopologyError::SizeMismatch {
                what: "row_ptr[num_cells]",
                expected: self.nnz(),
                actual: self.row_ptr[self.num_cells] as usize,
            });
        }
        for row in 0..self.num_cells {
            let entries = &self.col_index[self.row_range(row)];
            let diagonals = entries.iter().filter(|&&c| c as usize == row).count();
            if diagonals != 1 || self.diag_index[row] == u32::MAX {
                return Err(TopologyError::MissingDiagonal { row });
            }
            if entries.windows(2).any(|w| w[0] >= w[1]) {
                return Err(TopologyError::NonMonotoneRowPointer { row });
            }
        }
        Ok(())
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    pub fn num_surfaces(&self) -> usize {
        self.owner.len()
    }

    /// Off-diagonal entry count, `2 * num_surfaces`.
    pub fn num_faces(&self) -> usize {
        2 * self.owner.len()
    }

    pub fn nnz(&self) -> usize {
        self.num_cells + self.num_faces()
    }

    pub fn num_boundary_faces(&self) -> usize {
        self.bound_permutation_list.len()
    }

    pub fn num_boundary_cells(&self) -> usize {
        self.boundary_cell_id.len()
    }

    pub fn owner(&self) -> &[u32] {
        &self.owner
    }

    pub fn neighbour(&self) -> &[u32] {
        &self.neighbour
    }

    pub fn row_ptr(&self) -> &[u32] {
        &self.row_ptr
    }

    pub fn col_index(&self) -> &[u32] {
        &self.col_index
    }

    /// Global offset of each row's diagonal inside the value array.
    pub fn diag_index(&self) -> &[u32] {
        &self.diag_index
    }

    /// CSR off-diagonal slot -> `[lower | upper]` source index.
    pub fn permed_index(&self) -> &[u32] {
        &self.permed_index
    }

    /// CSR entry -> `[lower | diag | upper]` source index.
    pub fn tmp_permutated_list(&self) -> &[u32] {
        &self.tmp_permutated_list
    }

    /// `[lower | upper]` source index -> CSR entry.
    pub fn face_csr_index(&self) -> &[u32] {
        &self.face_csr_index
    }

    /// Grouped boundary position -> host boundary face index.
    pub fn bound_permutation_list(&self) -> &[u32] {
        &self.bound_permutation_list
    }

    /// Owning cell of each boundary face, in grouped order.
    pub fn boundary_face_cell(&self) -> &[u32] {
        &self.boundary_face_cell
    }

    pub fn boundary_cell_id(&self) -> &[u32] {
        &self.boundary_cell_id
    }

    pub fn boundary_cell_offset(&self) -> &[u32] {
        &self.boundary_cell_offset
    }

    /// Per-cell range into the grouped boundary order; empty for interior cells.
    pub fn cell_boundary_ptr(&self) -> &[u32] {
        &self.cell_boundary_ptr
    }

    pub fn row_range(&self, row: usize) -> Range<usize> {
        self.row_ptr[row] as usize..self.row_ptr[row + 1] as usize
    }

    /// Off-diagonal slot of CSR entry `k` in `row`. `k` must not be the diagonal.
    #[inline]
    pub fn off_diagonal_slot(&self, row: usize, k: usize) -> usize {
        off_diagonal_slot(row, k, self.diag_index[row] as usize)
    }

    /// Reorders a per-face array (`ncmpt` values per face) into CSR off-diagonal
    /// slot order. Each face appears twice, once for each of its entries.
    pub fn permute_face_values(&self, values: &[f64], ncmpt: usize) -> Vec<f64> {
        let ns = self.num_surfaces();
        let mut out = Vec::with_capacity(self.num_faces() * ncmpt);
        for &src in &self.permed_index {
            let face = src as usize % ns;
            out.extend_from_slice(&values[face * ncmpt..(face + 1) * ncmpt]);
        }
        out
    }

    /// Reorders a host boundary array into grouped order.
    pub fn permute_boundary_values<T: Copy>(&self, values: &[T], ncmpt: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(values.len());
        for &src in &self.bound_permutation_list {
            let b = src as usize;
            out.extend_from_slice(&values[b * ncmpt..(b + 1) * ncmpt]);
        }
        out
    }

    /// Inverse of [`permute_boundary_values`](Self::permute_boundary_values).
    pub fn unpermute_boundary_values<T: Copy + Default>(&self, grouped: &[T], ncmpt: usize) -> Vec<T> {
        let mut out = vec![T::default(); grouped.len()];
        for (i, &src) in self.bound_permutation_list.iter().enumerate() {
            let b = src as usize;
            out[b * ncmpt..(b + 1) * ncmpt].copy_from_slice(&grouped[i * ncmpt..(i + 1) * ncmpt]);
        }
        out
    }
}

#[inline]
pub fn off_diagonal_slot(row: usize, k: usize, diag: usize) -> usize {
    if k > diag {
        k - row - 1
    } else {
        k - row
    }
}

pub fn inverse_permutation(perm: &[u32]) -> Vec<u32> {
    let mut inv = vec![0u32; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p as usize] = i as u32;
    }
    inv
}

pub fn is_permutation(perm: &[u32]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        match seen.get_mut(p as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

fn check_cell(what: &'static str, index: usize, cell: u32, num_cells: usize) -> Result<(), TopologyError> {
    if (cell as usize) < num_cells {
        Ok(())
    } else {
        Err(TopologyError::CellOutOfRange {
            what,
            index,
            cell,
            num_cells,
        })
    }
}

fn validate_faces(num_cells: usize, owner: &[u32], neighbour: &[u32]) -> Result<(), TopologyError> {
    if owner.len() != neighbour.len() {
        return Err(TopologyError::SizeMismatch {
            what: "neighbour",
            expected: owner.len(),
            actual: neighbour.len(),
        });
    }
    for (face, (&o, &n)) in owner.iter().zip(neighbour).enumerate() {
        check_cell("owner", face, o, num_cells)?;
        check_cell("neighbour", face, n, num_cells)?;
        if o >= n {
            return Err(TopologyError::OwnerNotLower {
                face,
                owner: o,
                neighbour: n,
            });
        }
    }
    let mut pairs: Vec<(u32, u32, usize)> = owner
        .iter()
        .zip(neighbour)
        .enumerate()
        .map(|(face, (&o, &n))| (o, n, face))
        .collect();
    pairs.sort_unstable();
    for w in pairs.windows(2) {
        if w[0].0 == w[1].0 && w[0].1 == w[1].1 {
            return Err(TopologyError::DuplicateFace {
                face: w[1].2,
                owner: w[1].0,
                neighbour: w[1].1,
            });
        }
    }
    Ok(())
}

fn sort_by_cell(boundary_face_cells: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let mut perm: Vec<u32> = (0..boundary_face_cells.len() as u32).collect();
    perm.sort_by_key(|&b| boundary_face_cells[b as usize]);
    let cells = perm.iter().map(|&b| boundary_face_cells[b as usize]).collect();
    (perm, cells)
}

fn group_boundary_faces(sorted_cells: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let mut ids = Vec::new();
    let mut offsets = vec![0u32];
    for (i, &cell) in sorted_cells.iter().enumerate() {
        if ids.last() != Some(&cell) {
            if i > 0 {
                offsets.push(i as u32);
            }
            ids.push(cell);
        }
    }
    if !sorted_cells.is_empty() {
        offsets.push(sorted_cells.len() as u32);
    }
    (ids, offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2x2 block of cells:
    //   2 3
    //   0 1
    fn quad() -> MatrixTopology {
        let owner = [0, 0, 1, 2];
        let neighbour = [1, 2, 3, 3];
        let boundary = [0, 0, 1, 1, 2, 2, 3, 3];
        MatrixTopology::build(4, &owner, &neighbour, &boundary).unwrap()
    }

    #[test]
    fn quad_layout_matches_hand_count() {
        let t = quad();
        assert_eq!(t.row_ptr(), &[0, 3, 6, 9, 12]);
        assert_eq!(t.col_index(), &[0, 1, 2, 0, 1, 3, 0, 2, 3, 1, 2, 3]);
        assert_eq!(t.diag_index(), &[0, 4, 7, 11]);
        // slots: row0 -> (0,1) upper f0, (0,2) upper f1; row1 -> (1,0) lower f0, (1,3) upper f2 ...
        assert_eq!(t.permed_index(), &[4, 5, 0, 6, 1, 7, 2, 3]);
    }

    #[test]
    fn tmp_permutation_places_diagonal_block() {
        let t = quad();
        let ns = t.num_surfaces() as u32;
        for (row, &d) in t.diag_index().iter().enumerate() {
            assert_eq!(t.tmp_permutated_list()[d as usize], ns + row as u32);
        }
    }

    #[test]
    fn off_diagonal_slot_skips_diagonal() {
        let t = quad();
        let mut slot = 0;
        for row in 0..t.num_cells() {
            for k in t.row_range(row) {
                if k == t.diag_index()[row] as usize {
                    continue;
                }
                assert_eq!(t.off_diagonal_slot(row, k), slot);
                assert_eq!(t.face_csr_index()[t.permed_index()[slot] as usize] as usize, k);
                slot += 1;
            }
        }
        assert_eq!(slot, t.num_faces());
    }

    #[test]
    fn isolated_cell_gets_diagonal_row() {
        let t = MatrixTopology::build(3, &[0], &[1], &[]).unwrap();
        assert_eq!(t.row_range(2).len(), 1);
        assert_eq!(t.col_index()[t.diag_index()[2] as usize], 2);
        assert_eq!(t.num_boundary_cells(), 0);
        assert_eq!(t.boundary_cell_offset(), &[0]);
    }

    #[test]
    fn boundary_groups_collect_faces_per_cell() {
        let t = MatrixTopology::build(3, &[0, 1], &[1, 2], &[2, 0, 2, 0, 2]).unwrap();
        assert_eq!(t.boundary_cell_id(), &[0, 2]);
        assert_eq!(t.boundary_cell_offset(), &[0, 2, 5]);
        assert_eq!(t.bound_permutation_list(), &[1, 3, 0, 2, 4]);
        assert_eq!(t.cell_boundary_ptr(), &[0, 2, 2, 5]);
    }

    #[test]
    fn rejects_malformed_faces() {
        assert!(matches!(
            MatrixTopology::build(2, &[1], &[0], &[]),
            Err(TopologyError::OwnerNotLower { face: 0, .. })
        ));
        assert!(matches!(
            MatrixTopology::build(2, &[0], &[2], &[]),
            Err(TopologyError::CellOutOfRange { what: "neighbour", .. })
        ));
        assert!(matches!(
            MatrixTopology::build(3, &[0, 0], &[1, 1], &[]),
            Err(TopologyError::DuplicateFace { face: 1, .. })
        ));
        assert!(matches!(
            MatrixTopology::build(3, &[0, 1], &[1], &[]),
            Err(TopologyError::SizeMismatch { .. })
        ));
        assert!(matches!(
            MatrixTopology::build(2, &[0], &[1], &[5]),
            Err(TopologyError::CellOutOfRange { what: "boundary_face_cells", .. })
        ));
    }

    #[test]
    fn face_values_are_duplicated_in_slot_order() {
        let t = quad();
        let w = [10.0, 20.0, 30.0, 40.0];
        let slots = t.permute_face_values(&w, 1);
        assert_eq!(slots, vec![10.0, 20.0, 10.0, 30.0, 20.0, 40.0, 30.0, 40.0]);
    }

    #[test]
    fn boundary_permutation_round_trips() {
        let t = MatrixTopology::build(3, &[0, 1], &[1, 2], &[2, 0, 2, 0, 2]).unwrap();
        let host: Vec<f64> = (0..10).map(f64::from).collect();
        let grouped = t.permute_boundary_values(&host, 2);
        assert_eq!(&grouped[..2], &[2.0, 3.0]);
        assert_eq!(t.unpermute_boundary_values(&grouped, 2), host);
    }

    #[test]
    fn inverse_undoes_permutation() {
        let p = [3u32, 0, 2, 1];
        assert!(is_permutation(&p));
        let inv = inverse_permutation(&p);
        for i in 0..p.len() {
            assert_eq!(inv[p[i] as usize] as usize, i);
        }
        assert!(!is_permutation(&[0, 0, 1]));
    }
}
