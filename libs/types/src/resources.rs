//! Fixed-dimension resource vectors.
//!
//! Every capacity and demand in a cell is a vector of the same dimension
//! count (e.g. cpu/memory/disk). The count is chosen once when the cell is
//! constructed and threaded through as a [`Dimensions`] value; mixing vectors
//! of different dimension is a programming error and panics.

use serde::{Deserialize, Serialize};

/// Number of resource dimensions in a cell.
///
/// Constructed once and passed explicitly wherever vectors are created,
/// instead of living in process-wide mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions(usize);

impl Dimensions {
    /// Creates a dimension count. Must be at least 1.
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "resource dimension count must be at least 1");
        Self(count)
    }

    /// Returns the dimension count.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.0
    }
}

/// A capacity or demand vector.
///
/// All arithmetic is element-wise. Comparisons short-circuit: `fits_within`
/// is "all dimensions ≤", `any_less_than` is "at least one dimension <".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector(Vec<f64>);

impl ResourceVector {
    /// The all-zero vector.
    #[must_use]
    pub fn zero(dims: Dimensions) -> Self {
        Self(vec![0.0; dims.count()])
    }

    /// Builds a vector from explicit values.
    #[must_use]
    pub fn from_values(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "resource vector cannot be empty");
        Self(values)
    }

    /// Returns the dimension count of this vector.
    #[must_use]
    pub fn dims(&self) -> usize {
        self.0.len()
    }

    /// Returns the raw values.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    fn check_dims(&self, other: &Self) {
        assert_eq!(
            self.0.len(),
            other.0.len(),
            "resource vector dimension mismatch: {} vs {}",
            self.0.len(),
            other.0.len()
        );
    }

    /// Element-wise addition in place.
    pub fn add_assign(&mut self, other: &Self) {
        self.check_dims(other);
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a += b;
        }
    }

    /// Element-wise subtraction in place.
    pub fn sub_assign(&mut self, other: &Self) {
        self.check_dims(other);
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a -= b;
        }
    }

    /// Element-wise maximum in place.
    pub fn max_assign(&mut self, other: &Self) {
        self.check_dims(other);
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a = a.max(*b);
        }
    }

    /// Element-wise minimum in place.
    pub fn min_assign(&mut self, other: &Self) {
        self.check_dims(other);
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a = a.min(*b);
        }
    }

    /// Returns `self + other`.
    #[must_use]
    pub fn plus(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.add_assign(other);
        out
    }

    /// Adds a scalar to every dimension.
    #[must_use]
    pub fn plus_scalar(&self, value: f64) -> Self {
        Self(self.0.iter().map(|a| a + value).collect())
    }

    /// True iff `self[i] <= other[i]` for every dimension.
    #[must_use]
    pub fn fits_within(&self, other: &Self) -> bool {
        self.check_dims(other);
        self.0.iter().zip(&other.0).all(|(a, b)| a <= b)
    }

    /// True iff `self[i] < other[i]` for at least one dimension.
    #[must_use]
    pub fn any_less_than(&self, other: &Self) -> bool {
        self.check_dims(other);
        self.0.iter().zip(&other.0).any(|(a, b)| a < b)
    }

    /// True iff `self[i] >= other[i]` for every dimension.
    ///
    /// Used by the feasibility tracker: a demand that dominates a recorded
    /// failed demand cannot place either.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        self.check_dims(other);
        self.0.iter().zip(&other.0).all(|(a, b)| a >= b)
    }

    /// `max_i (self[i] - allocated[i]) / available[i]`.
    ///
    /// The utilization of accumulated demand against a reservation. The
    /// caller supplies `available` with an epsilon already folded in so a
    /// zero reservation never divides by zero.
    #[must_use]
    pub fn utilization(&self, allocated: &Self, available: &Self) -> f64 {
        self.check_dims(allocated);
        self.check_dims(available);
        self.0
            .iter()
            .zip(&allocated.0)
            .zip(&available.0)
            .map(|((d, a), av)| (d - a) / av)
            .fold(f64::NEG_INFINITY, f64::max)
    }
}
