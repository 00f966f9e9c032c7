//! How the rows of a partitioned matrix are laid out on tiles.
//!
//! Every tile stores its rows in a fixed order: interior rows nobody else
//! reads, then separator rows grouped by the set of tiles that read them,
//! then halo rows (copies of other tiles' separator rows) grouped by the
//! region they come from. Halo exchange relies on this order to move whole
//! regions with one block copy.

mod addressing;
mod coloring;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tilesolve_kerpiler::{CopyBlock, DistributedShape, FirstDimDistribution, TensorShape};

pub use self::{
    addressing::TileAddressing,
    coloring::{multicolor_recommended, Coloring},
};
use crate::{
    error::{Error, Result},
    host::CrsMatrix,
    partition::Partitioning,
};

/// Owned rows some other tiles read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeparatorRegion {
    pub dst_tiles: BTreeSet<usize>,
    // global row ids
    pub rows: Vec<usize>,
}

/// A copy of the separator region of `src_tile` sent to `dst_tiles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HaloRegion {
    pub src_tile: usize,
    pub dst_tiles: BTreeSet<usize>,
    pub rows: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePartition {
    pub tile: usize,
    pub interior_rows: Vec<usize>,
    pub separator_regions: Vec<SeparatorRegion>,
    pub halo_regions: Vec<HaloRegion>,
    local_to_global: Vec<usize>,
    global_to_local: HashMap<usize, usize>,
}

impl TilePartition {
    pub fn new(
        tile: usize,
        interior_rows: Vec<usize>,
        separator_regions: Vec<SeparatorRegion>,
        halo_regions: Vec<HaloRegion>,
    ) -> Self {
        let local_to_global: Vec<usize> = interior_rows
            .iter()
            .chain(separator_regions.iter().flat_map(|r| &r.rows))
            .chain(halo_regions.iter().flat_map(|r| &r.rows))
            .copied()
            .collect();
        let global_to_local = local_to_global.iter().enumerate().map(|(l, g)| (*g, l)).collect();
        Self { tile, interior_rows, separator_regions, halo_regions, local_to_global, global_to_local }
    }

    pub fn num_interior(&self) -> usize { self.interior_rows.len() }
    pub fn num_separator(&self) -> usize { self.separator_regions.iter().map(|r| r.rows.len()).sum() }
    pub fn num_halo(&self) -> usize { self.halo_regions.iter().map(|r| r.rows.len()).sum() }
    // interior and separator rows
    pub fn num_owned(&self) -> usize { self.num_interior() + self.num_separator() }

    pub fn num_rows(&self, with_halo: bool) -> usize {
        if with_halo { self.local_to_global.len() } else { self.num_owned() }
    }

    pub fn local_to_global(&self) -> &[usize] { &self.local_to_global }
    pub fn global_to_local(&self, row: usize) -> Option<usize> { self.global_to_local.get(&row).copied() }

    pub fn is_interior(&self, local: usize) -> bool { local < self.num_interior() }
    pub fn is_separator(&self, local: usize) -> bool { (self.num_interior()..self.num_owned()).contains(&local) }
    pub fn is_halo(&self, local: usize) -> bool { (self.num_owned()..self.num_rows(true)).contains(&local) }
}

/// The per-tile row layouts of one matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedTileLayout {
    tiles: Vec<TilePartition>,
    num_rows: usize,
}

impl DistributedTileLayout {
    /// Classify every row and collect the regions of every tile. A row is
    /// a separator row when rows on other tiles reference it, and lands in
    /// the halo of each of those tiles.
    #[tracing::instrument(skip_all, fields(rows = m.num_rows(), tiles = partitioning.num_tiles()))]
    pub fn build(m: &CrsMatrix, partitioning: &Partitioning) -> Result<Self> {
        if partitioning.num_rows() != m.num_rows() {
            return Err(Error::Layout(format!(
                "partitioning covers {} rows, the matrix has {}",
                partitioning.num_rows(),
                m.num_rows()
            )));
        }
        let num_tiles = partitioning.num_tiles();
        let referencing = m.referencing_rows();
        let mut rows_of = vec![vec![]; num_tiles];
        for row in 0..m.num_rows() {
            rows_of[partitioning.tile_of(row)].push(row);
        }

        // a source tile appends to the halo list of each tile reading from it
        let halos: Vec<Mutex<Vec<HaloRegion>>> = (0..num_tiles).map(|_| Mutex::new(vec![])).collect();
        let owned: Vec<(Vec<usize>, Vec<SeparatorRegion>)> = rows_of
            .par_iter()
            .enumerate()
            .map(|(tile, rows)| {
                let mut interior = vec![];
                let mut separators: BTreeMap<BTreeSet<usize>, Vec<usize>> = BTreeMap::new();
                for &row in rows {
                    let readers: BTreeSet<usize> =
                        referencing[row].iter().map(|r| partitioning.tile_of(*r)).filter(|t| *t != tile).collect();
                    if readers.is_empty() {
                        interior.push(row);
                    } else {
                        separators.entry(readers).or_default().push(row);
                    }
                }
                for (dst_tiles, rows) in &separators {
                    for dst in dst_tiles {
                        halos[*dst].lock().push(HaloRegion { src_tile: tile, dst_tiles: dst_tiles.clone(), rows: rows.clone() });
                    }
                }
                let separators = separators.into_iter().map(|(dst_tiles, rows)| SeparatorRegion { dst_tiles, rows }).collect();
                (interior, separators)
            })
            .collect();

        let tiles: Vec<TilePartition> = owned
            .into_iter()
            .zip(halos)
            .enumerate()
            .map(|(tile, ((interior, separators), halo))| {
                let mut halo = halo.into_inner();
                // arrival order depends on scheduling
                halo.sort_by(|a, b| (a.src_tile, &a.dst_tiles).cmp(&(b.src_tile, &b.dst_tiles)));
                TilePartition::new(tile, interior, separators, halo)
            })
            .collect();
        for t in &tiles {
            tracing::trace!(
                tile = t.tile,
                interior = t.num_interior(),
                separator = t.num_separator(),
                halo = t.num_halo(),
                "tile layout"
            );
        }
        Ok(Self { tiles, num_rows: m.num_rows() })
    }

    pub fn num_tiles(&self) -> usize { self.tiles.len() }
    pub fn num_rows(&self) -> usize { self.num_rows }
    pub fn tiles(&self) -> &[TilePartition] { &self.tiles }
    pub fn tile(&self, tile: usize) -> &TilePartition { &self.tiles[tile] }

    /// Rows per tile, with `width` columns per row when it is non-zero.
    pub fn vector_shape(&self, with_halo: bool, width: usize) -> Result<DistributedShape> {
        let dist: FirstDimDistribution = self.tiles.iter().map(|t| (t.tile, t.num_rows(with_halo))).collect();
        let mut shape = TensorShape::new([dist.sum()])?;
        if width > 0 {
            shape = shape.push_back(width)?;
        }
        Ok(DistributedShape::on_tiles(shape, dist)?)
    }

    /// Where each tile's block starts in a decomposed vector.
    pub fn tile_offsets(&self, with_halo: bool) -> Vec<usize> {
        self.tiles
            .iter()
            .scan(0, |at, t| {
                let start = *at;
                *at += t.num_rows(with_halo);
                Some(start)
            })
            .collect()
    }

    /// Reorder a global vector into tile blocks in local row order.
    pub fn decompose_vector(&self, values: &[f64], with_halo: bool) -> Result<Vec<f64>> {
        if values.len() != self.num_rows {
            return Err(Error::Layout(format!("vector has {} rows, the layout {}", values.len(), self.num_rows)));
        }
        let mut out = Vec::with_capacity(self.tiles.iter().map(|t| t.num_rows(with_halo)).sum());
        for t in &self.tiles {
            out.extend(t.local_to_global()[..t.num_rows(with_halo)].iter().map(|g| values[*g]));
        }
        Ok(out)
    }

    /// Inverse of [`decompose_vector`](Self::decompose_vector). Halo cells
    /// are skipped, owned rows land at their global position.
    pub fn reassemble_vector(&self, decomposed: &[f64], with_halo: bool) -> Result<Vec<f64>> {
        let offsets = self.tile_offsets(with_halo);
        let expected = self.tiles.iter().map(|t| t.num_rows(with_halo)).sum::<usize>();
        if decomposed.len() != expected {
            return Err(Error::Layout(format!("decomposed vector has {} cells, expected {expected}", decomposed.len())));
        }
        let mut out = vec![0.0; self.num_rows];
        for (t, start) in self.tiles.iter().zip(offsets) {
            for (l, g) in t.local_to_global()[..t.num_owned()].iter().enumerate() {
                out[*g] = decomposed[start + l];
            }
        }
        Ok(out)
    }

    /// Block copies that refresh every halo region of a vector with halo
    /// from the separator rows it mirrors.
    pub fn halo_copy_blocks(&self) -> Result<Vec<CopyBlock>> {
        let offsets = self.tile_offsets(true);
        let mut blocks = vec![];
        for dst in &self.tiles {
            let mut at = dst.num_owned();
            for region in &dst.halo_regions {
                let src = &self.tiles[region.src_tile];
                let (Some(first), Some(last)) = (region.rows.first(), region.rows.last()) else { continue };
                let start = src.global_to_local(*first).filter(|l| src.is_separator(*l));
                let end = src.global_to_local(*last);
                match (start, end) {
                    (Some(s), Some(e)) if e + 1 - s == region.rows.len() => {
                        blocks.push(CopyBlock { src: offsets[src.tile] + s, dst: offsets[dst.tile] + at, len: region.rows.len() });
                    }
                    _ => {
                        return Err(Error::Layout(format!(
                            "halo region of tile {} is not contiguous on tile {}",
                            dst.tile, src.tile
                        )))
                    }
                }
                at += region.rows.len();
            }
        }
        Ok(blocks)
    }
}
