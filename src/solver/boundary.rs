//! Boundary patch classification and the per-face linearisation coefficients.

use serde::{Deserialize, Serialize};

use crate::solver::error::TopologyError;

/// Patch linearisation class, resolved once per boundary face.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchType {
    #[default]
    ZeroGradient = 0,
    FixedValue = 1,
    Coupled = 2,
    Empty = 3,
}

impl PatchType {
    pub fn gpu_id(self) -> u32 {
        self as u32
    }

    pub fn from_gpu_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(PatchType::ZeroGradient),
            1 => Some(PatchType::FixedValue),
            2 => Some(PatchType::Coupled),
            3 => Some(PatchType::Empty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatchType::ZeroGradient => "zeroGradient",
            PatchType::FixedValue => "fixedValue",
            PatchType::Coupled => "coupled",
            PatchType::Empty => "empty",
        }
    }

    /// Value interpolation coefficients `(internal, boundary)` for a face with
    /// boundary value `psi_b` and owner weight `w`.
    pub fn value_coeffs(self, psi_b: f64, w: f64) -> (f64, f64) {
        match self {
            PatchType::ZeroGradient => (1.0, 0.0),
            PatchType::FixedValue => (0.0, psi_b),
            PatchType::Coupled => (w, (1.0 - w) * psi_b),
            PatchType::Empty => (0.0, 0.0),
        }
    }

    /// Surface-normal gradient coefficients `(internal, boundary)`.
    pub fn gradient_coeffs(self, psi_b: f64, delta: f64) -> (f64, f64) {
        match self {
            PatchType::ZeroGradient | PatchType::Empty => (0.0, 0.0),
            PatchType::FixedValue | PatchType::Coupled => (-delta, delta * psi_b),
        }
    }
}

impl std::str::FromStr for PatchType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "zeroGradient" | "zero_gradient" => Ok(PatchType::ZeroGradient),
            "fixedValue" | "fixed_value" | "calculated" | "extrapolatedCalculated" => {
                Ok(PatchType::FixedValue)
            }
            "coupled" | "processor" | "cyclic" => Ok(PatchType::Coupled),
            "empty" => Ok(PatchType::Empty),
            _ => Err(format!("unknown patch type: {}", value)),
        }
    }
}

/// Expands per-patch type names into one tag per boundary face, in patch order.
pub fn construct_boundary_selector<S: AsRef<str>>(
    patch_type_names: &[S],
    patch_sizes: &[usize],
) -> Result<Vec<PatchType>, TopologyError> {
    if patch_type_names.len() != patch_sizes.len() {
        return Err(TopologyError::SizeMismatch {
            what: "patch_sizes",
            expected: patch_type_names.len(),
            actual: patch_sizes.len(),
        });
    }
    let mut selector = Vec::with_capacity(patch_sizes.iter().sum());
    for (patch, (name, &size)) in patch_type_names.iter().zip(patch_sizes).enumerate() {
        let ty: PatchType = name
            .as_ref()
            .parse()
            .map_err(|_| TopologyError::UnknownPatchType {
                patch,
                name: name.as_ref().to_string(),
            })?;
        selector.extend(std::iter::repeat(ty).take(size));
    }
    Ok(selector)
}

/// Boundary condition type names as the host case declares them, one per
/// patch: row 0 for velocity-like fields, row 1 for the species.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTypeNames {
    pub velocity: Vec<String>,
    pub species: Vec<String>,
}

impl PatchTypeNames {
    pub fn from_types(velocity: &[PatchType], species: &[PatchType]) -> Self {
        let names = |types: &[PatchType]| types.iter().map(|t| t.as_str().to_string()).collect();
        Self {
            velocity: names(velocity),
            species: names(species),
        }
    }
}

/// Two-row patch table with one type per boundary face, host order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchTable {
    pub velocity: Vec<PatchType>,
    pub species: Vec<PatchType>,
}

impl PatchTable {
    /// Expands both rows of per-patch names over `patch_sizes`.
    pub fn resolve(names: &PatchTypeNames, patch_sizes: &[usize]) -> Result<Self, TopologyError> {
        Ok(Self {
            velocity: construct_boundary_selector(&names.velocity, patch_sizes)?,
            species: construct_boundary_selector(&names.species, patch_sizes)?,
        })
    }
}

/// Concatenates per-patch slices into the flat boundary order the data base
/// expects, `ncmpt` values per face.
#[derive(Debug, Clone)]
pub struct PatchStaging {
    offsets: Vec<usize>,
}

impl PatchStaging {
    pub fn new(patch_sizes: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(patch_sizes.len() + 1);
        offsets.push(0);
        for size in patch_sizes {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + size);
        }
        Self { offsets }
    }

    pub fn num_faces(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    pub fn patch_offset(&self, patch: usize) -> usize {
        self.offsets[patch]
    }

    pub fn num_patches(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn patch_sizes(&self) -> Vec<usize> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Writes each patch into its own disjoint range of `out`. Every patch
    /// slice must hold `ncmpt` values per face of that patch.
    pub fn gather(&self, patches: &[&[f64]], ncmpt: usize, out: &mut [f64]) -> Result<(), TopologyError> {
        if patches.len() != self.num_patches() {
            return Err(TopologyError::SizeMismatch {
                what: "patch count",
                expected: self.num_patches(),
                actual: patches.len(),
            });
        }
        if out.len() != self.num_faces() * ncmpt {
            return Err(TopologyError::SizeMismatch {
                what: "staged boundary values",
                expected: self.num_faces() * ncmpt,
                actual: out.len(),
            });
        }
        for (patch, values) in patches.iter().enumerate() {
            let start = self.offsets[patch] * ncmpt;
            let len = (self.offsets[patch + 1] - self.offsets[patch]) * ncmpt;
            if values.len() != len {
                return Err(TopologyError::SizeMismatch {
                    what: "patch values",
                    expected: len,
                    actual: values.len(),
                });
            }
            out[start..start + len].copy_from_slice(values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_expands_patches_in_order() {
        let sel = construct_boundary_selector(&["fixedValue", "zeroGradient", "empty"], &[2, 1, 3]).unwrap();
        assert_eq!(
            sel,
            vec![
                PatchType::FixedValue,
                PatchType::FixedValue,
                PatchType::ZeroGradient,
                PatchType::Empty,
                PatchType::Empty,
                PatchType::Empty,
            ]
        );
    }

    #[test]
    fn selector_rejects_unknown_names() {
        let err = construct_boundary_selector(&["zeroGradient", "totalPressure"], &[1, 1]).unwrap_err();
        assert_eq!(
            err,
            TopologyError::UnknownPatchType {
                patch: 1,
                name: "totalPressure".into()
            }
        );
    }

    #[test]
    fn linearisation_coefficients() {
        assert_eq!(PatchType::ZeroGradient.value_coeffs(5.0, 0.3), (1.0, 0.0));
        assert_eq!(PatchType::FixedValue.value_coeffs(5.0, 0.3), (0.0, 5.0));
        assert_eq!(PatchType::Coupled.value_coeffs(4.0, 0.25), (0.25, 3.0));
        assert_eq!(PatchType::FixedValue.gradient_coeffs(2.0, 4.0), (-4.0, 8.0));
        assert_eq!(PatchType::Empty.gradient_coeffs(2.0, 4.0), (0.0, 0.0));
    }

    #[test]
    fn staging_writes_disjoint_ranges() {
        let staging = PatchStaging::new(&[1, 2]);
        let mut out = vec![0.0; 6];
        staging.gather(&[&[1.0, 2.0], &[3.0, 4.0, 5.0, 6.0]], 2, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(staging.num_faces(), 3);
        assert_eq!(staging.patch_offset(1), 1);
        assert!(staging.gather(&[&[1.0, 2.0], &[3.0]], 2, &mut out).is_err());
        assert!(staging.gather(&[&[1.0, 2.0]], 2, &mut out).is_err());
    }

    #[test]
    fn patch_types_serialize_by_case_name() {
        assert_eq!(serde_json::to_string(&PatchType::FixedValue).unwrap(), "\"fixedValue\"");
        let parsed: Vec<PatchType> = serde_json::from_str(r#"["zeroGradient", "empty", "coupled"]"#).unwrap();
        assert_eq!(parsed, vec![PatchType::ZeroGradient, PatchType::Empty, PatchType::Coupled]);
        for ty in parsed {
            assert_eq!(ty.as_str().parse::<PatchType>(), Ok(ty));
        }
    }

    #[test]
    fn table_resolves_both_rows() {
        let names = PatchTypeNames {
            velocity: vec!["fixedValue".into(), "empty".into()],
            species: vec!["zeroGradient".into(), "empty".into()],
        };
        let table = PatchTable::resolve(&names, &[1, 2]).unwrap();
        assert_eq!(table.velocity, vec![PatchType::FixedValue, PatchType::Empty, PatchType::Empty]);
        assert_eq!(table.species[0], PatchType::ZeroGradient);
        assert_eq!(
            PatchTypeNames::from_types(&[PatchType::FixedValue, PatchType::Empty], &[PatchType::ZeroGradient, PatchType::Empty]),
            names
        );
    }
}
