use serde::{Deserialize, Serialize};

/// A square matrix in compressed row storage with the diagonal kept apart.
///
/// `col_ind`/`off_diag` hold the off-diagonal entries of row `i` at
/// `row_ptr[i]..row_ptr[i + 1]`, columns ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrsMatrix {
    row_ptr: Vec<usize>,
    col_ind: Vec<usize>,
    off_diag: Vec<f64>,
    diag: Vec<f64>,
}

impl CrsMatrix {
    pub(crate) fn from_parts(row_ptr: Vec<usize>, col_ind: Vec<usize>, off_diag: Vec<f64>, diag: Vec<f64>) -> Self {
        Self { row_ptr, col_ind, off_diag, diag }
    }

    pub fn num_rows(&self) -> usize { self.diag.len() }
    // off-diagonal non-zeros
    pub fn nnz(&self) -> usize { self.col_ind.len() }
    pub fn row_ptr(&self) -> &[usize] { &self.row_ptr }
    pub fn col_ind(&self) -> &[usize] { &self.col_ind }
    pub fn off_diag(&self) -> &[f64] { &self.off_diag }
    pub fn diag(&self) -> &[f64] { &self.diag }

    pub fn row_len(&self, row: usize) -> usize { self.row_ptr[row + 1] - self.row_ptr[row] }

    /// Off-diagonal `(column, value)` pairs of `row`.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        self.col_ind[range.clone()].iter().copied().zip(self.off_diag[range].iter().copied())
    }

    /// For every row, the rows whose off-diagonal entries reference it.
    pub fn referencing_rows(&self) -> Vec<Vec<usize>> {
        let mut out = vec![vec![]; self.num_rows()];
        for row in 0..self.num_rows() {
            for (col, _) in self.row(row) {
                out[col].push(row);
            }
        }
        out
    }

    /// `A x` on the host.
    pub fn multiply(&self, x: &[f64]) -> Vec<f64> {
        (0..self.num_rows())
            .map(|i| self.diag[i] * x[i] + self.row(i).map(|(j, v)| v * x[j]).sum::<f64>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::host::TripletMatrix;

    #[test]
    fn transpose_pattern_and_product() {
        let mut m = TripletMatrix::new(3, 3);
        for i in 0..3 {
            m.push(i, i, 2.0);
        }
        m.push(0, 1, 1.0);
        m.push(2, 1, -1.0);
        let crs = m.into_crs().unwrap();
        assert_eq!(crs.nnz(), 2);
        assert_eq!(crs.referencing_rows(), vec![vec![], vec![0, 2], vec![]]);
        assert_eq!(crs.multiply(&[1.0, 2.0, 3.0]), vec![4.0, 4.0, 4.0]);
    }
}
