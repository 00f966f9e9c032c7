use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::DistributedShape;
use crate::error::{Error, Result};

/// Half-open range `[start, end)` of flattened element indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

impl Interval {
    pub fn new(start: usize, end: usize) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }
    pub fn len(&self) -> usize { self.end - self.start }
    pub fn is_empty(&self) -> bool { self.start == self.end }
}

/// Which element ranges of a tensor live on which tile.
///
/// The order of intervals on a tile is the order in which a kernel running
/// on that tile sees the elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileMapping(BTreeMap<usize, Vec<Interval>>);

impl TileMapping {
    pub fn new() -> Self { Self(BTreeMap::new()) }

    /// Consecutive row blocks, one per tile in ascending tile order.
    pub fn linear(shape: &DistributedShape) -> Self {
        let stride = shape.global_shape().stride(0);
        let mut mapping = Self::new();
        let mut offset = 0;
        for (tile, rows) in shape.distribution().iter_nonzero() {
            let len = rows * stride;
            mapping.push(tile, Interval { start: offset, end: offset + len });
            offset += len;
        }
        mapping
    }

    pub fn push(&mut self, tile: usize, interval: Interval) {
        self.0.entry(tile).or_default().push(interval);
    }
    pub fn intervals(&self, tile: usize) -> &[Interval] {
        self.0.get(&tile).map(Vec::as_slice).unwrap_or(&[])
    }
    // tiles with at least one element
    pub fn tiles(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().filter(|(_, v)| v.iter().any(|i| !i.is_empty())).map(|(t, _)| *t)
    }
    pub fn is_empty(&self) -> bool { self.tiles().next().is_none() }
    pub fn max_tile(&self) -> Option<usize> { self.tiles().last() }
    pub fn num_elements_on_tile(&self, tile: usize) -> usize {
        self.intervals(tile).iter().map(Interval::len).sum()
    }
    pub fn num_elements(&self) -> usize {
        self.0.values().flatten().map(Interval::len).sum()
    }

    /// Global element index of every local element of `tile`, in local order.
    pub fn local_to_global(&self, tile: usize) -> Vec<usize> {
        self.intervals(tile).iter().flat_map(|i| i.start..i.end).collect()
    }

    /// Merge touching intervals and drop empty ones, keeping local order.
    pub fn simplified(&self) -> Self {
        let mut out = Self::new();
        for (tile, intervals) in &self.0 {
            let mut merged: Vec<Interval> = vec![];
            for i in intervals.iter().filter(|i| !i.is_empty()) {
                match merged.last_mut() {
                    Some(last) if last.end == i.start => last.end = i.end,
                    _ => merged.push(*i),
                }
            }
            if !merged.is_empty() { out.0.insert(*tile, merged); }
        }
        out
    }

    /// Multiply every offset, for viewing elements as `factor` words each.
    pub fn scale_up(&self, factor: usize) -> Self {
        let scaled = self.0.iter().map(|(t, v)| {
            (*t, v.iter().map(|i| Interval { start: i.start * factor, end: i.end * factor }).collect())
        });
        Self(scaled.collect())
    }

    /// Group tiles by accelerator unit: tile `t` becomes `t / partitions_per_unit`.
    pub fn to_unit_mapping(&self, partitions_per_unit: usize) -> Self {
        let mut out = Self::new();
        for (tile, intervals) in &self.0 {
            for i in intervals {
                out.push(tile / partitions_per_unit.max(1), *i);
            }
        }
        out.simplified()
    }

    /// True when this mapping places rows exactly as the shape says.
    pub fn is_compatible_with(&self, shape: &DistributedShape) -> bool {
        if self.num_elements() != shape.num_elements() {
            return false;
        }
        let tiles: std::collections::BTreeSet<usize> = self.tiles().chain(shape.tiles()).collect();
        tiles.iter().all(|t| self.num_elements_on_tile(*t) == shape.num_elements_on_tile(*t))
    }
}
