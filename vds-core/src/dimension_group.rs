// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C1 (part 1): `DimensionGroup` — named subsets of dataset axes used for
//! chunking. See spec §4.1.

/// Maximum dataset dimensionality the engine supports (spec §3 invariant:
/// `2 <= D <= 6`).
pub const MAX_DIMENSIONALITY: usize = 6;

/// An ordered subset of `{0..D-1}` of size 2 or 3 that identifies one
/// chunking of the N-D cube, e.g. `012`, `013`, `45`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DimensionGroup {
    dims: Vec<usize>,
}

impl DimensionGroup {
    fn new(dims: Vec<usize>) -> Self {
        debug_assert!(dims.len() == 2 || dims.len() == 3);
        Self { dims }
    }

    pub fn dimensionality(&self) -> usize {
        self.dims.len()
    }

    /// The k-th original axis index this group chunks along.
    pub fn dimension(&self, k: usize) -> usize {
        self.dims[k]
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dims
    }

    /// `"Dimensions_<digits>"`, e.g. `Dimensions_012`.
    pub fn name(&self) -> String {
        let digits: String = self.dims.iter().map(|d| d.to_string()).collect();
        format!("Dimensions_{digits}")
    }

    /// Highest original axis index referenced by this group.
    pub fn top_dimension(&self) -> usize {
        *self.dims.iter().max().unwrap()
    }

    /// All distinct 2-D dimension groups (every pair `i < j`) plus all 3-D
    /// groups (every ordered triple `i < j < k`) within the first
    /// `dimensionality` axes, up to `MAX_DIMENSIONALITY`. Enumeration order is
    /// deterministic so `Layout` construction is reproducible.
    pub fn enumerate(dimensionality: usize) -> Vec<DimensionGroup> {
        let d = dimensionality.min(MAX_DIMENSIONALITY);
        let mut groups = Vec::new();
        for i in 0..d {
            for j in (i + 1)..d {
                groups.push(DimensionGroup::new(vec![i, j]));
            }
        }
        for i in 0..d {
            for j in (i + 1)..d {
                for k in (j + 1)..d {
                    groups.push(DimensionGroup::new(vec![i, j, k]));
                }
            }
        }
        groups
    }

    /// The canonical 2-D or 3-D group built from explicit axis indices, used
    /// by callers (e.g. `AccessManager`) that address a layer by dimension
    /// group name rather than by enumeration order.
    pub fn from_dims(dims: &[usize]) -> Option<DimensionGroup> {
        if dims.len() != 2 && dims.len() != 3 {
            return None;
        }
        let mut sorted = dims.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != dims.len() {
            return None;
        }
        Some(DimensionGroup::new(sorted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_3d_cube_has_three_pairs_and_one_triple() {
        let groups = DimensionGroup::enumerate(3);
        let names: Vec<String> = groups.iter().map(|g| g.name()).collect();
        assert_eq!(
            names,
            vec![
                "Dimensions_01",
                "Dimensions_02",
                "Dimensions_12",
                "Dimensions_012"
            ]
        );
    }

    #[test]
    fn enumerate_caps_at_six_dims() {
        let groups = DimensionGroup::enumerate(8);
        assert!(groups.iter().all(|g| g.top_dimension() < MAX_DIMENSIONALITY));
    }

    #[test]
    fn from_dims_rejects_duplicates_and_bad_arity() {
        assert!(DimensionGroup::from_dims(&[0, 0]).is_none());
        assert!(DimensionGroup::from_dims(&[0]).is_none());
        assert!(DimensionGroup::from_dims(&[3, 1]).is_some());
    }
}
