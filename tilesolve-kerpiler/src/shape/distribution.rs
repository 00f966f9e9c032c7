use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of leading-dimension rows held by each tile.
///
/// Entries are explicit: a tile that holds zero rows can be present and is
/// distinguishable from a tile that is absent. Equality and [`count`] ignore
/// zero entries, so for comparison purposes zero and absent coincide.
///
/// [`count`]: FirstDimDistribution::count
#[derive(Debug, Clone, Default, Eq, Serialize, Deserialize)]
pub struct FirstDimDistribution(BTreeMap<usize, usize>);

impl FirstDimDistribution {
    pub fn new() -> Self { Self(BTreeMap::new()) }
    pub fn single(tile: usize, rows: usize) -> Self {
        Self(BTreeMap::from([(tile, rows)]))
    }
    // rows held by `tile`, 0 when absent
    pub fn get(&self, tile: usize) -> usize { self.0.get(&tile).copied().unwrap_or(0) }
    pub fn contains(&self, tile: usize) -> bool { self.0.contains_key(&tile) }
    pub fn insert(&mut self, tile: usize, rows: usize) -> Option<usize> { self.0.insert(tile, rows) }
    pub fn add(&mut self, tile: usize, rows: usize) { *self.0.entry(tile).or_insert(0) += rows; }
    pub fn remove(&mut self, tile: usize) -> Option<usize> { self.0.remove(&tile) }
    pub fn clear(&mut self) { self.0.clear() }
    pub fn sum(&self) -> usize { self.0.values().sum() }
    // every present entry, including explicit zeros
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.0.iter().map(|(t, n)| (*t, *n))
    }
    pub fn iter_nonzero(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.iter().filter(|(_, n)| *n != 0)
    }
    pub fn count(&self) -> usize { self.iter_nonzero().count() }
    pub fn is_empty(&self) -> bool { self.count() == 0 }
    // largest tile with rows, None if every tile is empty
    pub fn max_key(&self) -> Option<usize> { self.iter_nonzero().map(|(t, _)| t).last() }
    pub fn min_key(&self) -> Option<usize> { self.iter_nonzero().map(|(t, _)| t).next() }
    pub fn max_value(&self) -> usize { self.0.values().copied().max().unwrap_or(0) }
}

impl PartialEq for FirstDimDistribution {
    fn eq(&self, other: &Self) -> bool {
        self.iter_nonzero().eq(other.iter_nonzero())
    }
}

impl std::hash::Hash for FirstDimDistribution {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for (t, n) in self.iter_nonzero() { (t, n).hash(state) }
    }
}

impl<const N: usize> From<[(usize, usize); N]> for FirstDimDistribution {
    fn from(x: [(usize, usize); N]) -> Self { Self(BTreeMap::from(x)) }
}

impl FromIterator<(usize, usize)> for FirstDimDistribution {
    fn from_iter<I: IntoIterator<Item = (usize, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_entries_are_present_but_not_counted() {
        let d = FirstDimDistribution::from([(0, 2), (3, 0), (5, 1)]);
        assert!(d.contains(3));
        assert!(!d.contains(4));
        assert_eq!(d.get(3), 0);
        assert_eq!(d.get(4), 0);
        assert_eq!(d.count(), 2);
        assert_eq!(d.iter().count(), 3);
        assert_eq!(d.iter_nonzero().map(|(t, _)| t).collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn equality_ignores_zero_entries() {
        let a = FirstDimDistribution::from([(0, 2), (1, 0)]);
        let b = FirstDimDistribution::from([(0, 2)]);
        assert_eq!(a, b);
        assert_ne!(a, FirstDimDistribution::from([(0, 1), (1, 1)]));
    }

    #[test]
    fn keys_of_empty_distribution() {
        let d = FirstDimDistribution::from([(2, 0), (7, 0)]);
        assert_eq!(d.max_key(), None);
        assert_eq!(d.min_key(), None);
        let d = FirstDimDistribution::from([(2, 1), (7, 3), (9, 0)]);
        assert_eq!(d.max_key(), Some(7));
        assert_eq!(d.min_key(), Some(2));
    }
}
