//! Region algebra over N-dimensional index space.
//!
//! A [`Region`] is an axis-aligned box described by a starting index and an
//! extent per axis. All operations here are pure; degenerate input produces an
//! empty region rather than an error, so callers check [`Region::is_empty`]
//! before using a result.

use crate::core::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned box in index space.
///
/// Samples are laid out with axis 0 varying fastest; a "line" is one run of
/// samples along axis 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    index: Vec<i64>,
    size: Vec<i64>,
}

impl Region {
    /// Create a region from a starting index and a size.
    ///
    /// No validation happens here; see [`Region::validate`].
    pub fn new(index: impl Into<Vec<i64>>, size: impl Into<Vec<i64>>) -> Self {
        Self {
            index: index.into(),
            size: size.into(),
        }
    }

    /// Create a region starting at the origin.
    pub fn from_size(size: impl Into<Vec<i64>>) -> Self {
        let size = size.into();
        Self {
            index: vec![0; size.len()],
            size,
        }
    }

    /// The zero-axis region. It holds exactly one sample.
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Check that the region is well formed.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.index.len() != self.size.len() {
            return Err(PipelineError::InvalidRegion {
                reason: format!(
                    "index has {} axes but size has {}",
                    self.index.len(),
                    self.size.len()
                ),
            });
        }
        if let Some(axis) = self.size.iter().position(|&s| s < 0) {
            return Err(PipelineError::InvalidRegion {
                reason: format!("negative extent {} on axis {}", self.size[axis], axis),
            });
        }
        Ok(())
    }

    /// Number of axes.
    pub fn dimension(&self) -> usize {
        self.size.len()
    }

    /// Starting index per axis.
    pub fn index(&self) -> &[i64] {
        &self.index
    }

    /// Extent per axis.
    pub fn size(&self) -> &[i64] {
        &self.size
    }

    /// Exclusive upper bound on `axis`.
    pub fn upper(&self, axis: usize) -> i64 {
        self.index[axis] + self.size[axis]
    }

    /// Whether any extent is zero (or negative).
    pub fn is_empty(&self) -> bool {
        self.size.iter().any(|&s| s <= 0)
    }

    /// Number of samples covered.
    pub fn num_pixels(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.size.iter().map(|&s| s as u64).product()
    }

    /// Whether `idx` lies inside the region.
    pub fn contains_index(&self, idx: &[i64]) -> bool {
        idx.len() == self.dimension()
            && (0..self.dimension()).all(|j| idx[j] >= self.index[j] && idx[j] < self.upper(j))
    }

    /// Enlarge the region by `radius[j]` samples on both sides of axis `j`.
    pub fn padded(&self, radius: &[i64]) -> Region {
        let index = self
            .index
            .iter()
            .enumerate()
            .map(|(j, &i)| i - radius.get(j).copied().unwrap_or(0))
            .collect::<Vec<_>>();
        let size = self
            .size
            .iter()
            .enumerate()
            .map(|(j, &s)| s + 2 * radius.get(j).copied().unwrap_or(0))
            .collect::<Vec<_>>();
        Region { index, size }
    }

    /// Linear offset of `idx` in a buffer laid out over this region.
    pub fn offset_of(&self, idx: &[i64]) -> Option<usize> {
        if !self.contains_index(idx) {
            return None;
        }
        let mut offset = 0usize;
        let mut stride = 1usize;
        for j in 0..self.dimension() {
            offset += (idx[j] - self.index[j]) as usize * stride;
            stride *= self.size[j] as usize;
        }
        Some(offset)
    }

    /// Length of one line along axis 0.
    pub fn line_length(&self) -> usize {
        match self.size.first() {
            Some(&s) => s.max(0) as usize,
            None => 1,
        }
    }

    /// Number of lines along axis 0.
    pub fn line_count(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.size.iter().skip(1).map(|&s| s as usize).product()
    }

    /// Index of the first sample on `line`.
    pub fn line_start(&self, line: usize) -> Vec<i64> {
        let mut idx = self.index.clone();
        let mut rem = line;
        for j in 1..self.dimension() {
            let extent = self.size[j] as usize;
            idx[j] += (rem % extent) as i64;
            rem /= extent;
        }
        idx
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[index {:?}, size {:?}]", self.index, self.size)
    }
}

/// Intersection of two regions.
///
/// Empty when the regions are disjoint on any axis or differ in dimension.
pub fn intersect(a: &Region, b: &Region) -> Region {
    if a.dimension() != b.dimension() {
        return Region::new(a.index.clone(), vec![0; a.dimension()]);
    }
    let mut index = Vec::with_capacity(a.dimension());
    let mut size = Vec::with_capacity(a.dimension());
    for j in 0..a.dimension() {
        let lo = a.index[j].max(b.index[j]);
        let hi = a.upper(j).min(b.upper(j));
        index.push(lo);
        size.push((hi - lo).max(0));
    }
    Region { index, size }
}

/// Whether `inner` lies entirely inside `outer`.
pub fn contains(outer: &Region, inner: &Region) -> bool {
    if outer.dimension() != inner.dimension() {
        return false;
    }
    if inner.is_empty() {
        return true;
    }
    (0..outer.dimension())
        .all(|j| inner.index[j] >= outer.index[j] && inner.upper(j) <= outer.upper(j))
}

/// Crop `region` to the part that lies inside `largest`.
pub fn crop_to_largest(region: &Region, largest: &Region) -> Region {
    intersect(region, largest)
}

/// Smallest region containing both `a` and `b`. Empty operands are ignored.
pub fn bounding_union(a: &Region, b: &Region) -> Region {
    if a.is_empty() {
        return b.clone();
    }
    if b.is_empty() || a.dimension() != b.dimension() {
        return a.clone();
    }
    let mut index = Vec::with_capacity(a.dimension());
    let mut size = Vec::with_capacity(a.dimension());
    for j in 0..a.dimension() {
        let lo = a.index[j].min(b.index[j]);
        let hi = a.upper(j).max(b.upper(j));
        index.push(lo);
        size.push(hi - lo);
    }
    Region { index, size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate() {
        assert!(Region::new([0, 0], [4, 4]).validate().is_ok());
        assert!(Region::new([0, 0], [0, 4]).validate().is_ok());
        assert!(matches!(
            Region::new([0, 0], [-1, 4]).validate(),
            Err(PipelineError::InvalidRegion { .. })
        ));
        assert!(matches!(
            Region::new([0], [1, 1]).validate(),
            Err(PipelineError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_empty_and_scalar() {
        assert!(Region::from_size([3, 0]).is_empty());
        assert_eq!(Region::from_size([3, 0]).num_pixels(), 0);
        assert!(!Region::scalar().is_empty());
        assert_eq!(Region::scalar().num_pixels(), 1);
        assert_eq!(Region::scalar().line_count(), 1);
        assert_eq!(Region::scalar().line_length(), 1);
    }

    #[test]
    fn test_intersect_disjoint() {
        let a = Region::new([0, 0], [4, 4]);
        let b = Region::new([10, 0], [4, 4]);
        assert!(intersect(&a, &b).is_empty());

        let c = Region::new([2, 2], [4, 4]);
        assert_eq!(intersect(&a, &c), Region::new([2, 2], [2, 2]));
    }

    #[test]
    fn test_contains() {
        let outer = Region::new([0, 0], [8, 8]);
        assert!(contains(&outer, &Region::new([2, 2], [6, 6])));
        assert!(!contains(&outer, &Region::new([2, 2], [7, 6])));
        assert!(contains(&outer, &Region::new([100, 100], [0, 3])));
        assert!(!contains(&outer, &Region::from_size([1])));
    }

    #[test]
    fn test_crop_to_largest() {
        let largest = Region::from_size([10, 10]);
        let cropped = crop_to_largest(&Region::new([-2, 5], [6, 10]), &largest);
        assert_eq!(cropped, Region::new([0, 5], [4, 5]));
    }

    #[test]
    fn test_padded() {
        let r = Region::new([2, 3], [4, 5]);
        assert_eq!(r.padded(&[1, 2]), Region::new([1, 1], [6, 9]));
    }

    #[test]
    fn test_lines_and_offsets() {
        let r = Region::new([1, 10, 100], [3, 2, 2]);
        assert_eq!(r.line_count(), 4);
        assert_eq!(r.line_length(), 3);
        assert_eq!(r.line_start(0), vec![1, 10, 100]);
        assert_eq!(r.line_start(1), vec![1, 11, 100]);
        assert_eq!(r.line_start(2), vec![1, 10, 101]);
        assert_eq!(r.offset_of(&[1, 10, 100]), Some(0));
        assert_eq!(r.offset_of(&[2, 11, 100]), Some(4));
        assert_eq!(r.offset_of(&[3, 11, 101]), Some(11));
        assert_eq!(r.offset_of(&[4, 10, 100]), None);
    }

    #[test]
    fn test_bounding_union() {
        let a = Region::new([0, 0], [2, 2]);
        let b = Region::new([4, 1], [2, 4]);
        assert_eq!(bounding_union(&a, &b), Region::new([0, 0], [6, 5]));
        assert_eq!(bounding_union(&Region::from_size([0, 0]), &b), b);
    }

    fn region_2d() -> impl Strategy<Value = Region> {
        (-20i64..20, -20i64..20, 0i64..15, 0i64..15)
            .prop_map(|(x, y, w, h)| Region::new([x, y], [w, h]))
    }

    proptest! {
        #[test]
        fn prop_intersection_is_contained(a in region_2d(), b in region_2d()) {
            let i = intersect(&a, &b);
            prop_assert!(contains(&a, &i));
            prop_assert!(contains(&b, &i));
        }

        #[test]
        fn prop_union_contains_both(a in region_2d(), b in region_2d()) {
            let u = bounding_union(&a, &b);
            prop_assert!(contains(&u, &a));
            prop_assert!(contains(&u, &b));
        }

        #[test]
        fn prop_crop_never_exceeds_largest(r in region_2d(), largest in region_2d()) {
            let cropped = crop_to_largest(&r, &largest);
            prop_assert!(contains(&largest, &cropped));
            prop_assert!(cropped.num_pixels() <= r.num_pixels());
        }
    }
}
