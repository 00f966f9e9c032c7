use std::fmt;

use serde::{Deserialize, Serialize};

use super::{FirstDimDistribution, TensorShape};
use crate::error::{Error, Result};

/// A global shape together with the tiles holding its leading dimension.
///
/// All trailing dimensions are stored whole on every tile. The distribution
/// always sums to the leading dimension; every constructor checks this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistributedShape {
    shape: TensorShape,
    dist: FirstDimDistribution,
}

impl DistributedShape {
    pub fn on_tiles(shape: TensorShape, dist: FirstDimDistribution) -> Result<Self> {
        let sum = dist.sum();
        if sum != shape.dim(0) {
            return Err(Error::InvalidDistribution { sum, expected: shape.dim(0) });
        }
        Ok(Self { shape, dist })
    }
    pub fn on_single_tile(shape: TensorShape, tile: usize) -> Self {
        let dist = FirstDimDistribution::single(tile, shape.dim(0));
        Self { shape, dist }
    }
    pub fn scalar(tile: usize) -> Self {
        Self::on_single_tile(TensorShape::scalar(), tile)
    }
    /// Spread rows evenly over tiles `0..n`, the last tile takes the remainder.
    pub fn linearly_distributed(shape: TensorShape, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::InvalidArgument { arg: "n", reason: "needs at least one tile".into() });
        }
        let rows = shape.dim(0);
        let each = rows / n;
        let mut dist: FirstDimDistribution = (0..n).map(|t| (t, each)).collect();
        dist.add(n - 1, rows - each * n);
        Self::on_tiles(shape, dist)
    }

    pub fn global_shape(&self) -> &TensorShape { &self.shape }
    pub fn distribution(&self) -> &FirstDimDistribution { &self.dist }
    pub fn rank(&self) -> usize { self.shape.rank() }
    pub fn dim(&self, d: usize) -> usize { self.shape.dim(d) }
    pub fn num_elements(&self) -> usize { self.shape.num_elements() }
    pub fn num_elements_on_tile(&self, tile: usize) -> usize {
        self.dist.get(tile) * self.shape.stride(0)
    }
    // tiles holding at least one row, ascending
    pub fn tiles(&self) -> impl Iterator<Item = usize> + '_ {
        self.dist.iter_nonzero().map(|(t, _)| t)
    }

    /// Same distribution, different trailing dimensions.
    pub fn with_trailing(&self, shape: TensorShape) -> Result<Self> {
        Self::on_tiles(shape, self.dist.clone())
    }

    // `perm[0]` must be 0 so the distribution still sums to the leading dimension
    pub(crate) fn permuted(&self, perm: &[usize]) -> Self {
        Self { shape: self.shape.permuted(perm), dist: self.dist.clone() }
    }

    /// Trailing dimension `d` (never the leading one) reduced to extent 1.
    pub fn collapse_trailing(&self, d: usize) -> Result<Self> {
        if d == 0 || d >= self.rank() {
            return Err(Error::InvalidDimension { dim: d, rank: self.rank() });
        }
        Ok(self.collapsed(d))
    }
    pub(crate) fn collapsed(&self, d: usize) -> Self {
        Self { shape: self.shape.collapsed(d), dist: self.dist.clone() }
    }

    /// Broadcast two shapes together.
    ///
    /// Trailing dimensions follow the usual right-aligned rules. On top of
    /// that, equal-rank operands must agree on the distribution of the
    /// leading dimension unless one of them has a leading extent of 1. When
    /// the ranks differ, the higher-ranked operand's distribution is kept.
    pub fn broadcast(a: &DistributedShape, b: &DistributedShape) -> Option<DistributedShape> {
        let (long, short) = if a.rank() >= b.rank() { (a, b) } else { (b, a) };
        let (lr, sr) = (long.rank(), short.rank());
        let mut dims: Vec<usize> = long.shape.dims().to_vec();
        // compare right-aligned, stop before the leading dimension
        for i in 1..sr {
            let (l, s) = (long.dim(lr - i), short.dim(sr - i));
            dims[lr - i] = match (l, s) {
                _ if l == s => l,
                (1, s) => s,
                (l, 1) => l,
                _ => return None,
            };
        }
        let dist = if lr != sr {
            // the short shape's leading dimension aligns with a trailing one
            let (l, s) = (long.dim(lr - sr), short.dim(0));
            dims[lr - sr] = match (l, s) {
                _ if l == s => l,
                (1, s) => s,
                (l, 1) => l,
                _ => return None,
            };
            long.dist.clone()
        } else {
            match (a.dim(0), b.dim(0)) {
                (_, 1) => { dims[0] = a.dim(0); a.dist.clone() }
                (1, _) => { dims[0] = b.dim(0); b.dist.clone() }
                _ if a.dist == b.dist && a.dim(0) == b.dim(0) => a.dist.clone(),
                _ => return None,
            }
        };
        let shape = TensorShape::new(dims).ok()?;
        DistributedShape::on_tiles(shape, dist).ok()
    }

    /// Merge tiles `[g*k, g*(k+1))` into tile `g*k`.
    pub fn group_first_dimension(&self, group_size: usize) -> DistributedShape {
        if group_size <= 1 {
            return self.clone();
        }
        let mut dist = FirstDimDistribution::new();
        for (tile, rows) in self.dist.iter_nonzero() {
            dist.add(tile / group_size * group_size, rows);
        }
        Self { shape: self.shape.clone(), dist }
    }
}

impl fmt::Display for DistributedShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shape)
    }
}
