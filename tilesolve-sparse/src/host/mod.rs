//! Host side matrices and their decomposition over tiles.

mod crs;
mod poisson;
mod triplet;

use std::sync::Arc;

use rayon::prelude::*;

pub use self::{
    crs::CrsMatrix,
    poisson::poisson_3d,
    triplet::{Triplet, TripletMatrix},
};
use crate::{
    error::Result,
    layout::{multicolor_recommended, Coloring, DistributedTileLayout, TileAddressing},
    partition::{calculate_partitioning, GraphPartitioner, Partitioning},
};

/// A CRS matrix together with everything needed to place it on tiles:
/// the row partitioning, the tile layout, the local addressing and the
/// row coloring of every tile.
#[derive(Debug, Clone)]
pub struct HostMatrix {
    crs: CrsMatrix,
    partitioning: Partitioning,
    layout: Arc<DistributedTileLayout>,
    addressing: Vec<TileAddressing>,
    coloring: Vec<Coloring>,
    multicolor_recommended: bool,
}

impl HostMatrix {
    pub fn new(crs: CrsMatrix, num_tiles: usize, partitioner: &dyn GraphPartitioner) -> Result<Self> {
        let partitioning = calculate_partitioning(&crs, num_tiles, partitioner)?;
        Self::with_partitioning(crs, partitioning)
    }

    #[tracing::instrument(skip_all, fields(rows = crs.num_rows(), tiles = partitioning.num_tiles()))]
    pub fn with_partitioning(crs: CrsMatrix, partitioning: Partitioning) -> Result<Self> {
        let layout = DistributedTileLayout::build(&crs, &partitioning)?;
        let addressing: Vec<TileAddressing> =
            layout.tiles().par_iter().map(|t| TileAddressing::build(&crs, t)).collect::<Result<_>>()?;
        let coloring: Vec<Coloring> = addressing.par_iter().map(Coloring::compute).collect();
        let multicolor_recommended = multicolor_recommended(&coloring);
        tracing::info!(
            colors = coloring.iter().map(Coloring::num_colors).max().unwrap_or(0),
            multicolor_recommended,
            "matrix decomposed"
        );
        Ok(Self { crs, partitioning, layout: Arc::new(layout), addressing, coloring, multicolor_recommended })
    }

    pub fn crs(&self) -> &CrsMatrix { &self.crs }
    pub fn partitioning(&self) -> &Partitioning { &self.partitioning }
    pub fn layout(&self) -> &Arc<DistributedTileLayout> { &self.layout }
    pub fn addressing(&self) -> &[TileAddressing] { &self.addressing }
    pub fn coloring(&self) -> &[Coloring] { &self.coloring }
    pub fn multicolor_recommended(&self) -> bool { self.multicolor_recommended }
    pub fn num_rows(&self) -> usize { self.crs.num_rows() }
    pub fn num_tiles(&self) -> usize { self.layout.num_tiles() }

    pub fn decompose_vector(&self, values: &[f64], with_halo: bool) -> Result<Vec<f64>> {
        self.layout.decompose_vector(values, with_halo)
    }

    pub fn reassemble_vector(&self, decomposed: &[f64], with_halo: bool) -> Result<Vec<f64>> {
        self.layout.reassemble_vector(decomposed, with_halo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::RecursiveBisection;

    #[test]
    fn decomposition_covers_every_row_once() {
        let crs = poisson_3d(4, 3, 2).into_crs().unwrap();
        let host = HostMatrix::new(crs, 4, &RecursiveBisection::default()).unwrap();
        assert_eq!(host.num_tiles(), 4);
        assert_eq!(host.addressing().len(), 4);
        let owned: usize = host.layout().tiles().iter().map(|t| t.num_owned()).sum();
        assert_eq!(owned, 24);
        let nnz: usize = host.addressing().iter().map(|a| a.row_ptr[a.num_rows()]).sum();
        assert_eq!(nnz, host.crs().nnz());
        for (a, c) in host.addressing().iter().zip(host.coloring()) {
            assert_eq!(c.colors.len(), a.num_rows());
        }
    }
}
