use super::TilePartition;
use crate::{
    error::{Error, Result},
    host::CrsMatrix,
};

/// The owned rows of one tile in CRS form over local row ids. Columns are
/// sorted ascending per row, halo columns come last since their local ids
/// follow the owned rows.
#[derive(Debug, Clone, PartialEq)]
pub struct TileAddressing {
    pub row_ptr: Vec<usize>,
    pub col_ind: Vec<usize>,
    pub off_diag: Vec<f64>,
    pub diag: Vec<f64>,
}

impl TileAddressing {
    pub fn build(m: &CrsMatrix, part: &TilePartition) -> Result<Self> {
        let owned = part.num_owned();
        let mut row_ptr = Vec::with_capacity(owned + 1);
        let mut col_ind = vec![];
        let mut off_diag = vec![];
        let mut diag = Vec::with_capacity(owned);
        row_ptr.push(0);
        for &g in &part.local_to_global()[..owned] {
            let mut entries = m
                .row(g)
                .map(|(col, v)| match part.global_to_local(col) {
                    Some(l) => Ok((l, v)),
                    None => Err(Error::Layout(format!("row {g} on tile {} reads row {col} it has no copy of", part.tile))),
                })
                .collect::<Result<Vec<_>>>()?;
            entries.sort_by_key(|(l, _)| *l);
            col_ind.extend(entries.iter().map(|(l, _)| *l));
            off_diag.extend(entries.iter().map(|(_, v)| *v));
            row_ptr.push(col_ind.len());
            diag.push(m.diag()[g]);
        }
        // device vectors cannot be empty, the padding is never read
        if col_ind.is_empty() {
            col_ind.push(0);
            off_diag.push(0.0);
        }
        Ok(Self { row_ptr, col_ind, off_diag, diag })
    }

    pub fn num_rows(&self) -> usize { self.diag.len() }

    /// Local columns of `row`.
    pub fn cols(&self, row: usize) -> &[usize] { &self.col_ind[self.row_ptr[row]..self.row_ptr[row + 1]] }

    /// Off-diagonal `(local column, value)` pairs of `row`.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        self.col_ind[range.clone()].iter().copied().zip(self.off_diag[range].iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::TripletMatrix,
        layout::DistributedTileLayout,
        partition::Partitioning,
    };

    #[test]
    fn local_columns_with_halo_last() {
        // 0 - 1 - 2 - 3 with row 1 also reading row 3
        let mut m = TripletMatrix::new(4, 4);
        for i in 0..4 {
            m.push(i, i, 4.0 + i as f64);
        }
        for (i, j) in [(0, 1), (1, 2), (2, 3), (1, 3)] {
            m.push(i, j, -1.0 - i as f64);
            m.push(j, i, -1.0 - i as f64);
        }
        let m = m.into_crs().unwrap();
        let p = Partitioning::new(vec![1, 0, 0, 1], 2).unwrap();
        let layout = DistributedTileLayout::build(&m, &p).unwrap();
        let t0 = layout.tile(0);
        // rows 1 and 2 are both read by tile 1, rows 0 and 3 are the halo
        assert_eq!(t0.local_to_global(), &[1, 2, 0, 3]);
        let a = TileAddressing::build(&m, t0).unwrap();
        assert_eq!(a.diag, vec![5.0, 6.0]);
        assert_eq!(a.row_ptr, vec![0, 3, 5]);
        assert_eq!(a.cols(0), &[1, 2, 3]);
        assert_eq!(a.cols(1), &[0, 3]);
        assert_eq!(a.row(1).collect::<Vec<_>>(), vec![(0, -2.0), (3, -3.0)]);
    }

    #[test]
    fn diagonal_matrix_gets_padding() {
        let mut m = TripletMatrix::new(2, 2);
        m.push(0, 0, 1.0);
        m.push(1, 1, 1.0);
        let m = m.into_crs().unwrap();
        let p = Partitioning::new(vec![0, 0], 1).unwrap();
        let layout = DistributedTileLayout::build(&m, &p).unwrap();
        let a = TileAddressing::build(&m, layout.tile(0)).unwrap();
        assert_eq!(a.row_ptr, vec![0, 0, 0]);
        assert_eq!(a.col_ind, vec![0]);
        assert_eq!(a.off_diag, vec![0.0]);
    }
}
