use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Row-major extents of a tensor. Never empty and never contains a zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape(SmallVec<[usize; 4]>);

impl TensorShape {
    // an empty dimension list is a scalar
    pub fn new(dims: impl IntoIterator<Item = usize>) -> Result<Self> {
        let mut dims: SmallVec<[usize; 4]> = dims.into_iter().collect();
        if dims.is_empty() { dims.push(1); }
        if dims.contains(&0) {
            return Err(Error::ZeroDimension { dims: dims.to_vec() });
        }
        Ok(Self(dims))
    }
    pub fn scalar() -> Self { Self(smallvec::smallvec![1]) }
    pub fn rank(&self) -> usize { self.0.len() }
    pub fn dim(&self, d: usize) -> usize { self.0[d] }
    pub fn dims(&self) -> &[usize] { &self.0 }
    pub fn num_elements(&self) -> usize { self.0.iter().product() }
    // number of elements between two consecutive indices of `d`
    pub fn stride(&self, d: usize) -> usize { self.0[d + 1..].iter().product() }
    pub fn is_scalar(&self) -> bool { self.num_elements() == 1 && self.rank() == 1 }
    pub fn push_back(&self, n: usize) -> Result<Self> {
        Self::new(self.0.iter().copied().chain(std::iter::once(n)))
    }
    // every entry of `perm` must be a valid dimension
    pub fn permuted(&self, perm: &[usize]) -> Self {
        Self(perm.iter().map(|p| self.0[*p]).collect())
    }
    // dimension `d` set to 1
    pub fn collapsed(&self, d: usize) -> Self {
        let mut dims = self.0.clone();
        dims[d] = 1;
        Self(dims)
    }
    pub fn with_dim(&self, d: usize, n: usize) -> Result<Self> {
        if d >= self.rank() {
            return Err(Error::InvalidDimension { dim: d, rank: self.rank() });
        }
        let mut dims = self.0.clone();
        dims[d] = n;
        Self::new(dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 { f.write_str("x")?; }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}
