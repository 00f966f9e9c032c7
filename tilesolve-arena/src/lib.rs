//! Append-only arena addressed by typed indices.
//!
//! Nodes are never removed, so a handle stays valid for the lifetime of the
//! arena. Children are always allocated before their parents, which makes
//! index order a topological order of any graph stored here.

use std::{fmt::Debug, hash::Hash, marker::PhantomData, ops::{Index, IndexMut}};

/// Handle of a value stored in an [`Arena`].
pub struct Idx<T> {
    raw: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Idx<T> {
    pub fn from_raw(raw: u32) -> Self {
        Self { raw, _marker: PhantomData }
    }
    pub fn raw(self) -> u32 { self.raw }
    pub fn index(self) -> usize { self.raw as usize }
    // move a handle into an arena that had `by` values in front of it
    pub fn shift(self, by: u32) -> Self { Self::from_raw(self.raw + by) }
}

// manual impls, derives would put bounds on T
impl<T> Clone for Idx<T> {
    fn clone(&self) -> Self { *self }
}
impl<T> Copy for Idx<T> {}
impl<T> PartialEq for Idx<T> {
    fn eq(&self, other: &Self) -> bool { self.raw == other.raw }
}
impl<T> Eq for Idx<T> {}
impl<T> PartialOrd for Idx<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl<T> Ord for Idx<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.raw.cmp(&other.raw) }
}
impl<T> Hash for Idx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) { self.raw.hash(state) }
}
impl<T> Debug for Idx<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { items: vec![] }
    }
    pub fn with_capacity(n: usize) -> Self {
        Self { items: Vec::with_capacity(n) }
    }
    // store a value and return its handle
    pub fn alloc(&mut self, x: T) -> Idx<T> {
        self.items.push(x);
        Idx::from_raw((self.items.len() - 1) as u32)
    }
    // store a run of values, handles are consecutive
    pub fn alloc_ext(&mut self, xs: impl IntoIterator<Item = T>) -> std::ops::Range<u32> {
        let start = self.items.len() as u32;
        self.items.extend(xs);
        start..self.items.len() as u32
    }
    // move every value of `other` behind the values of this arena.
    // `relink` rewrites the handles a value holds, it receives the offset.
    pub fn append(&mut self, other: Arena<T>, mut relink: impl FnMut(T, u32) -> T) -> u32 {
        let offset = self.items.len() as u32;
        self.items.extend(other.items.into_iter().map(|x| relink(x, offset)));
        offset
    }
    pub fn get(&self, idx: Idx<T>) -> Option<&T> { self.items.get(idx.index()) }
    pub fn get_mut(&mut self, idx: Idx<T>) -> Option<&mut T> { self.items.get_mut(idx.index()) }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    // handle of the most recent allocation
    pub fn last(&self) -> Option<Idx<T>> {
        self.items.len().checked_sub(1).map(|i| Idx::from_raw(i as u32))
    }
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Idx<T>, &T)> + '_ {
        self.items.iter().enumerate().map(|(i, x)| (Idx::from_raw(i as u32), x))
    }
    pub fn values(&self) -> impl DoubleEndedIterator<Item = &T> + '_ { self.items.iter() }
}

impl<T> Index<Idx<T>> for Arena<T> {
    type Output = T;
    fn index(&self, idx: Idx<T>) -> &T { &self.items[idx.index()] }
}

impl<T> IndexMut<Idx<T>> for Arena<T> {
    fn index_mut(&mut self, idx: Idx<T>) -> &mut T { &mut self.items[idx.index()] }
}
