//! Row partitioning.
//!
//! The rows of a matrix are the vertices of its adjacency graph. A
//! [`GraphPartitioner`] splits that graph into balanced parts with a small
//! edge cut, one part per tile.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    host::CrsMatrix,
};

/// Which tile owns each row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partitioning {
    row_to_tile: Vec<usize>,
    num_tiles: usize,
}

impl Partitioning {
    pub fn new(row_to_tile: Vec<usize>, num_tiles: usize) -> Result<Self> {
        if let Some(bad) = row_to_tile.iter().find(|t| **t >= num_tiles) {
            return Err(Error::Partitioning(format!("tile {bad} out of range for {num_tiles} tiles")));
        }
        Ok(Self { row_to_tile, num_tiles })
    }

    pub fn num_tiles(&self) -> usize { self.num_tiles }
    pub fn num_rows(&self) -> usize { self.row_to_tile.len() }
    pub fn row_to_tile(&self) -> &[usize] { &self.row_to_tile }
    pub fn tile_of(&self, row: usize) -> usize { self.row_to_tile[row] }

    pub fn rows_per_tile(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_tiles];
        for t in &self.row_to_tile {
            counts[*t] += 1;
        }
        counts
    }

    /// `(max - min) / min` over the rows per tile, 0 without rows.
    pub fn imbalance(&self) -> f64 {
        let counts = self.rows_per_tile();
        match (counts.iter().min(), counts.iter().max()) {
            (Some(&min), Some(&max)) if min > 0 => (max - min) as f64 / min as f64,
            (Some(_), Some(&max)) if max > 0 => f64::INFINITY,
            _ => 0.0,
        }
    }
}

/// An undirected graph in adjacency form with integer weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedGraph {
    pub xadj: Vec<usize>,
    pub adjncy: Vec<usize>,
    pub vertex_weights: Vec<u64>,
    pub edge_weights: Vec<u64>,
}

// coefficients are mapped linearly onto 1..=EDGE_WEIGHT_SCALE
const EDGE_WEIGHT_SCALE: f64 = 1000.0;

impl WeightedGraph {
    /// The symmetrised adjacency graph of `m`. A row weighs its number of
    /// off-diagonal entries plus one, an edge the magnitude of its largest
    /// coefficient relative to the largest in the matrix.
    pub fn from_crs(m: &CrsMatrix) -> Self {
        let n = m.num_rows();
        let max = m.off_diag().iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        let weight = |v: f64| -> u64 {
            if max > 0.0 {
                ((v.abs() * EDGE_WEIGHT_SCALE / max) as u64).max(1)
            } else {
                1
            }
        };
        let mut adj: Vec<BTreeMap<usize, u64>> = vec![BTreeMap::new(); n];
        for row in 0..n {
            for (col, v) in m.row(row) {
                let w = weight(v);
                for (a, b) in [(row, col), (col, row)] {
                    let e = adj[a].entry(b).or_insert(w);
                    *e = (*e).max(w);
                }
            }
        }
        let mut graph = WeightedGraph {
            xadj: Vec::with_capacity(n + 1),
            adjncy: vec![],
            vertex_weights: (0..n).map(|r| m.row_len(r) as u64 + 1).collect(),
            edge_weights: vec![],
        };
        graph.xadj.push(0);
        for edges in adj {
            for (to, w) in edges {
                graph.adjncy.push(to);
                graph.edge_weights.push(w);
            }
            graph.xadj.push(graph.adjncy.len());
        }
        graph
    }

    pub fn num_vertices(&self) -> usize { self.vertex_weights.len() }

    pub fn neighbours(&self, v: usize) -> impl Iterator<Item = (usize, u64)> + '_ {
        let range = self.xadj[v]..self.xadj[v + 1];
        self.adjncy[range.clone()].iter().copied().zip(self.edge_weights[range].iter().copied())
    }

    /// Total weight of edges between different parts.
    pub fn edge_cut(&self, parts: &[usize]) -> u64 {
        let mut cut = 0;
        for v in 0..self.num_vertices() {
            cut += self.neighbours(v).filter(|(u, _)| parts[*u] != parts[v]).map(|(_, w)| w).sum::<u64>();
        }
        cut / 2
    }
}

/// Splits a graph into `num_parts` parts, returning the part of every vertex.
#[auto_impl(&, Box, Arc)]
pub trait GraphPartitioner {
    fn partition(&self, graph: &WeightedGraph, num_parts: usize) -> Result<Vec<usize>>;
}

/// Recursive bisection by greedy graph growing with a boundary refinement
/// pass after every cut. Every part receives at least one vertex as long
/// as there are enough vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecursiveBisection {
    pub refinement_passes: usize,
    // allowed deviation from the target weight of one side, in percent
    pub tolerance_percent: u64,
}

impl Default for RecursiveBisection {
    fn default() -> Self {
        Self { refinement_passes: 4, tolerance_percent: 3 }
    }
}

// side of a vertex during one bisection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Outside,
    A,
    B,
}

impl GraphPartitioner for RecursiveBisection {
    fn partition(&self, graph: &WeightedGraph, num_parts: usize) -> Result<Vec<usize>> {
        if num_parts == 0 {
            return Err(Error::Partitioning("cannot partition into zero parts".into()));
        }
        let mut parts = vec![0; graph.num_vertices()];
        let mut side = vec![Side::Outside; graph.num_vertices()];
        let vertices: Vec<usize> = (0..graph.num_vertices()).collect();
        self.split(graph, vertices, num_parts, 0, &mut parts, &mut side);
        Ok(parts)
    }
}

impl RecursiveBisection {
    fn split(
        &self,
        graph: &WeightedGraph,
        vertices: Vec<usize>,
        k: usize,
        first: usize,
        parts: &mut [usize],
        side: &mut [Side],
    ) {
        if k == 1 || vertices.len() <= 1 {
            for v in vertices {
                parts[v] = first;
            }
            return;
        }
        let k1 = k / 2;
        let (a, b) = self.bisect(graph, &vertices, k1, k, side);
        self.split(graph, a, k1, first, parts, side);
        self.split(graph, b, k - k1, first + k1, parts, side);
    }

    /// Split `vertices` so that side A carries about `k1 / k` of their weight.
    fn bisect(
        &self,
        graph: &WeightedGraph,
        vertices: &[usize],
        k1: usize,
        k: usize,
        side: &mut [Side],
    ) -> (Vec<usize>, Vec<usize>) {
        let n = vertices.len();
        let total: u64 = vertices.iter().map(|v| graph.vertex_weights[*v]).sum();
        let target = total * k1 as u64 / k as u64;
        let min_a = k1.min(n);
        let min_b = (k - k1).min(n - min_a);
        for v in vertices {
            side[*v] = Side::B;
        }

        // grow A breadth first from a vertex far away from the first one
        let start = farthest(graph, vertices[0], side);
        let mut queue = VecDeque::from([start]);
        let mut seen: BTreeSet<usize> = BTreeSet::from([start]);
        let mut fallback = vertices.iter();
        let mut size_a = 0;
        let mut weight_a = 0;
        while n - size_a > min_b && (size_a < min_a || weight_a < target) {
            let v = match queue.pop_front() {
                Some(v) => v,
                // a disconnected remainder continues from the next unvisited vertex
                None => match fallback.find(|v| !seen.contains(*v)) {
                    Some(&v) => {
                        seen.insert(v);
                        v
                    }
                    None => break,
                },
            };
            side[v] = Side::A;
            size_a += 1;
            weight_a += graph.vertex_weights[v];
            for (u, _) in graph.neighbours(v) {
                if side[u] == Side::B && seen.insert(u) {
                    queue.push_back(u);
                }
            }
        }

        self.refine(graph, vertices, target, total, (size_a, weight_a), (min_a, min_b), side);

        let mut a = vec![];
        let mut b = vec![];
        for v in vertices {
            match side[*v] {
                Side::A => a.push(*v),
                _ => b.push(*v),
            }
            side[*v] = Side::Outside;
        }
        (a, b)
    }

    // move boundary vertices with a positive cut gain while the balance holds
    #[allow(clippy::too_many_arguments)]
    fn refine(
        &self,
        graph: &WeightedGraph,
        vertices: &[usize],
        target: u64,
        total: u64,
        (mut size_a, mut weight_a): (usize, u64),
        (min_a, min_b): (usize, usize),
        side: &mut [Side],
    ) {
        let max_vertex = vertices.iter().map(|v| graph.vertex_weights[*v]).max().unwrap_or(0);
        let slack = (total * self.tolerance_percent / 100).max(max_vertex);
        let n = vertices.len();
        for _ in 0..self.refinement_passes {
            let mut moved = false;
            for &v in vertices {
                let (mut same, mut other) = (0i64, 0i64);
                for (u, w) in graph.neighbours(v) {
                    match side[u] {
                        Side::Outside => {}
                        s if s == side[v] => same += w as i64,
                        _ => other += w as i64,
                    }
                }
                if other <= same {
                    continue;
                }
                let w = graph.vertex_weights[v];
                let (new_size, new_weight) = match side[v] {
                    Side::A if size_a > min_a => (size_a - 1, weight_a - w),
                    Side::B if n - size_a > min_b => (size_a + 1, weight_a + w),
                    _ => continue,
                };
                if new_weight.abs_diff(target) > slack.max(weight_a.abs_diff(target)) {
                    continue;
                }
                side[v] = if side[v] == Side::A { Side::B } else { Side::A };
                size_a = new_size;
                weight_a = new_weight;
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }
}

// last vertex reached by a breadth first search inside the current subset
fn farthest(graph: &WeightedGraph, start: usize, side: &[Side]) -> usize {
    let mut seen = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    let mut last = start;
    while let Some(v) = queue.pop_front() {
        last = v;
        for (u, _) in graph.neighbours(v) {
            if side[u] != Side::Outside && seen.insert(u) {
                queue.push_back(u);
            }
        }
    }
    last
}

/// Assign the rows of `m` to `num_tiles` tiles. Parts the partitioner
/// leaves empty are dropped and the remaining ones renumbered, so the
/// result may use fewer tiles than requested.
#[tracing::instrument(skip(m, partitioner), fields(rows = m.num_rows()))]
pub fn calculate_partitioning(
    m: &CrsMatrix,
    num_tiles: usize,
    partitioner: &dyn GraphPartitioner,
) -> Result<Partitioning> {
    if num_tiles == 0 {
        return Err(Error::Partitioning("at least one tile is needed".into()));
    }
    if num_tiles == 1 {
        tracing::warn!("partitioning into a single part, every row goes to tile 0");
        return Partitioning::new(vec![0; m.num_rows()], 1);
    }
    let graph = WeightedGraph::from_crs(m);
    let parts = partitioner.partition(&graph, num_tiles)?;
    if parts.len() != m.num_rows() {
        return Err(Error::Partitioning(format!("{} parts for {} rows", parts.len(), m.num_rows())));
    }
    if let Some(bad) = parts.iter().find(|p| **p >= num_tiles) {
        return Err(Error::Partitioning(format!("part {bad} out of range for {num_tiles} parts")));
    }

    let used: BTreeSet<usize> = parts.iter().copied().collect();
    let partitioning = if used.len() < num_tiles {
        tracing::warn!(requested = num_tiles, used = used.len(), "dropping empty partitions");
        let renumber: BTreeMap<usize, usize> = used.iter().enumerate().map(|(i, p)| (*p, i)).collect();
        Partitioning::new(parts.iter().map(|p| renumber[p]).collect(), used.len())?
    } else {
        Partitioning::new(parts, num_tiles)?
    };
    tracing::info!(
        tiles = partitioning.num_tiles(),
        edge_cut = graph.edge_cut(partitioning.row_to_tile()),
        imbalance = partitioning.imbalance(),
        "matrix partitioned"
    );
    Ok(partitioning)
}
