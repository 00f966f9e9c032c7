use serde::{Deserialize, Serialize};

use super::CrsMatrix;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Triplet {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// A sparse matrix in coordinate form, entries in any order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripletMatrix {
    pub num_rows: usize,
    pub num_cols: usize,
    pub entries: Vec<Triplet>,
}

impl TripletMatrix {
    pub fn new(num_rows: usize, num_cols: usize) -> Self {
        Self { num_rows, num_cols, entries: vec![] }
    }

    pub fn with_capacity(num_rows: usize, num_cols: usize, capacity: usize) -> Self {
        Self { num_rows, num_cols, entries: Vec::with_capacity(capacity) }
    }

    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        self.entries.push(Triplet { row, col, value });
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Order entries by row, then column.
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|t| (t.row, t.col));
    }

    /// Convert to CRS with the diagonal split off. Duplicate entries are
    /// summed, rows without entries stay empty and a missing diagonal reads 0.
    pub fn into_crs(mut self) -> Result<CrsMatrix> {
        if self.num_rows != self.num_cols {
            return Err(Error::Matrix(format!("expected a square matrix, got {}x{}", self.num_rows, self.num_cols)));
        }
        if let Some(t) = self.entries.iter().find(|t| t.row >= self.num_rows || t.col >= self.num_cols) {
            return Err(Error::Matrix(format!(
                "entry ({}, {}) outside a {}x{} matrix",
                t.row, t.col, self.num_rows, self.num_cols
            )));
        }
        self.sort();

        let n = self.num_rows;
        let mut diag = vec![0.0; n];
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut col_ind = vec![];
        let mut off_diag: Vec<f64> = vec![];
        row_ptr.push(0);
        let mut entries = self.entries.iter().peekable();
        for row in 0..n {
            while let Some(t) = entries.next_if(|t| t.row == row) {
                if t.col == row {
                    diag[row] += t.value;
                } else if col_ind.len() > row_ptr[row] && col_ind.last() == Some(&t.col) {
                    // duplicates are adjacent after sorting
                    if let Some(v) = off_diag.last_mut() {
                        *v += t.value;
                    }
                } else {
                    col_ind.push(t.col);
                    off_diag.push(t.value);
                }
            }
            row_ptr.push(col_ind.len());
        }
        Ok(CrsMatrix::from_parts(row_ptr, col_ind, off_diag, diag))
    }
}
