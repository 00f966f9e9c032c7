use std::collections::BTreeSet;

use super::TileAddressing;

// a color needs more rows than this to keep all workers of a tile busy
const MIN_PARALLEL_COLOR_SIZE: usize = 12;
const MIN_PARALLEL_SHARE: f64 = 0.9;

/// Greedy level coloring of the owned rows of one tile.
///
/// A row gets its color once all its lower neighbours (smaller local id,
/// in either direction of the sparsity pattern) are colored, one color per
/// wavefront. So `colors[i] > colors[j]` for every neighbour `j < i`, and
/// all rows of one color can be updated at the same time in a triangular
/// sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coloring {
    pub colors: Vec<usize>,
    // rows grouped by color, ascending within a color
    pub sort_addr: Vec<usize>,
    // color `c` occupies `sort_addr[start_ptr[c]..start_ptr[c + 1]]`
    pub start_ptr: Vec<usize>,
}

impl Coloring {
    pub fn compute(a: &TileAddressing) -> Self {
        let n = a.num_rows();
        let mut edges = BTreeSet::new();
        for i in 0..n {
            for &j in a.cols(i) {
                // halo columns are not updated on this tile
                if j < n && j != i {
                    edges.insert((i.min(j), i.max(j)));
                }
            }
        }
        let mut upper = vec![vec![]; n];
        let mut pending = vec![0usize; n];
        for (lo, hi) in edges {
            upper[lo].push(hi);
            pending[hi] += 1;
        }

        let mut colors = vec![0; n];
        let mut wavefront: Vec<usize> = (0..n).filter(|r| pending[*r] == 0).collect();
        let mut num_colors = 0;
        while !wavefront.is_empty() {
            let mut next = vec![];
            for &row in &wavefront {
                colors[row] = num_colors;
                for &u in &upper[row] {
                    pending[u] -= 1;
                    if pending[u] == 0 {
                        next.push(u);
                    }
                }
            }
            wavefront = next;
            num_colors += 1;
        }

        let mut start_ptr = vec![0; num_colors + 1];
        for c in &colors {
            start_ptr[c + 1] += 1;
        }
        for c in 0..num_colors {
            start_ptr[c + 1] += start_ptr[c];
        }
        let mut sort_addr: Vec<usize> = (0..n).collect();
        sort_addr.sort_by_key(|r| colors[*r]);
        Self { colors, sort_addr, start_ptr }
    }

    pub fn num_colors(&self) -> usize { self.start_ptr.len() - 1 }

    pub fn rows_of_color(&self, color: usize) -> &[usize] {
        &self.sort_addr[self.start_ptr[color]..self.start_ptr[color + 1]]
    }
}

/// Whether colored sweeps pay off: most rows must sit in colors large
/// enough to spread over the workers of a tile.
pub fn multicolor_recommended(colorings: &[Coloring]) -> bool {
    let total: usize = colorings.iter().map(|c| c.colors.len()).sum();
    let parallel: usize = colorings
        .iter()
        .flat_map(|c| (0..c.num_colors()).map(move |color| c.rows_of_color(color).len()))
        .filter(|len| *len > MIN_PARALLEL_COLOR_SIZE)
        .sum();
    let recommended = total > 0 && parallel as f64 >= MIN_PARALLEL_SHARE * total as f64;
    tracing::debug!(total, parallel, recommended, "multicolor recommendation");
    recommended
}
