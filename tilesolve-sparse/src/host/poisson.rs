use super::TripletMatrix;

/// The 7-point finite difference Laplacian on an `nx` by `ny` by `nz` grid.
/// Row `k * nx * ny + j * nx + i` holds 6 on the diagonal and -1 for every
/// neighbour inside the grid.
pub fn poisson_3d(nx: usize, ny: usize, nz: usize) -> TripletMatrix {
    let n = nx * ny * nz;
    let mut m = TripletMatrix::with_capacity(n, n, 7 * n);
    tracing::debug!(nx, ny, nz, "generating 7-point poisson matrix");
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let row = k * nx * ny + j * nx + i;
                m.push(row, row, 6.0);
                if i > 0 {
                    m.push(row, row - 1, -1.0);
                }
                if i + 1 < nx {
                    m.push(row, row + 1, -1.0);
                }
                if j > 0 {
                    m.push(row, row - nx, -1.0);
                }
                if j + 1 < ny {
                    m.push(row, row + nx, -1.0);
                }
                if k > 0 {
                    m.push(row, row - nx * ny, -1.0);
                }
                if k + 1 < nz {
                    m.push(row, row + nx * ny, -1.0);
                }
            }
        }
    }
    tracing::trace!(rows = n, entries = m.len(), "poisson matrix generated");
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_rows() {
        let crs = poisson_3d(3, 3, 3).into_crs().unwrap();
        assert_eq!(crs.num_rows(), 27);
        assert!(crs.diag().iter().all(|d| *d == 6.0));
        // the center has all six neighbours, a corner three
        assert_eq!(crs.row_len(13), 6);
        assert_eq!(crs.row_len(0), 3);
        assert_eq!(crs.row(0).collect::<Vec<_>>(), vec![(1, -1.0), (3, -1.0), (9, -1.0)]);
        // row sums are non-negative and zero only in the interior
        let sums = crs.multiply(&[1.0; 27]);
        assert_eq!(sums[13], 0.0);
        assert_eq!(sums[0], 3.0);
    }
}
