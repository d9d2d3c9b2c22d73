//! Ordered set engine
//!
//! A sorted, deduplicated container of keyed records. Set algebra walks
//! both operands in key order at once, so every binary operation is
//! linear in the combined size.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;

/// A record stored in an [`OrderedSet`], ordered by its key.
pub trait Record: Clone {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;
}

impl Record for u64 {
    type Key = u64;

    fn key(&self) -> u64 {
        *self
    }
}

impl Record for u32 {
    type Key = u32;

    fn key(&self) -> u32 {
        *self
    }
}

/// What `add` does when the key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Overwrite the stored record
    #[default]
    Replace,
    /// Keep the stored record
    Ignore,
}

/// Sorted, deduplicated set of records
#[derive(Debug, Clone)]
pub struct OrderedSet<R: Record> {
    items: BTreeMap<R::Key, R>,
    policy: DuplicatePolicy,
}

impl<R: Record> Default for OrderedSet<R> {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

impl<R: Record> PartialEq for OrderedSet<R>
where
    R: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<R: Record> FromIterator<R> for OrderedSet<R> {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        let mut set = Self::default();
        for record in iter {
            set.add(record);
        }
        set
    }
}

impl<R: Record> OrderedSet<R> {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            items: BTreeMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Insert a record. Returns true when the key was not present before.
    pub fn add(&mut self, record: R) -> bool {
        let key = record.key();
        match self.items.get_mut(&key) {
            Some(existing) => {
                if self.policy == DuplicatePolicy::Replace {
                    *existing = record;
                }
                false
            }
            None => {
                self.items.insert(key, record);
                true
            }
        }
    }

    /// Remove the record with this key, if any.
    pub fn delete(&mut self, key: &R::Key) -> Option<R> {
        self.items.remove(key)
    }

    pub fn contains(&self, key: &R::Key) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records in ascending key order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &R> {
        self.items.values()
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &R::Key> {
        self.items.keys()
    }

    /// Keys present in either set; the left record wins on equal keys.
    pub fn union(&self, other: &Self) -> Self {
        self.merge(other, true, true, true)
    }

    /// Keys present in both sets, carrying the left records.
    pub fn intersect(&self, other: &Self) -> Self {
        self.merge(other, false, true, false)
    }

    /// Keys of `self` absent from `other`.
    pub fn difference(&self, other: &Self) -> Self {
        self.merge(other, true, false, false)
    }

    /// Keys present in exactly one of the sets.
    pub fn symmetric_difference(&self, other: &Self) -> Self {
        self.merge(other, true, false, true)
    }

    /// Walk both sets in key order, keeping left-only, common and
    /// right-only keys as requested. The walk yields keys already sorted,
    /// so the result map is bulk-built in one pass.
    fn merge(&self, other: &Self, left_only: bool, both: bool, right_only: bool) -> Self {
        let mut out = Vec::with_capacity(self.items.len() + other.items.len());
        let mut left: Peekable<_> = self.items.iter().peekable();
        let mut right: Peekable<_> = other.items.iter().peekable();

        loop {
            let step = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((lk, _)), Some((rk, _))) => lk.cmp(rk),
            };

            match step {
                Ordering::Less => {
                    if let Some((k, r)) = left.next() {
                        if left_only {
                            out.push((k.clone(), r.clone()));
                        }
                    }
                }
                Ordering::Greater => {
                    if let Some((k, r)) = right.next() {
                        if right_only {
                            out.push((k.clone(), r.clone()));
                        }
                    }
                }
                Ordering::Equal => {
                    let l = left.next();
                    right.next();
                    if let Some((k, r)) = l {
                        if both {
                            out.push((k.clone(), r.clone()));
                        }
                    }
                }
            }
        }

        Self {
            items: BTreeMap::from_iter(out),
            policy: self.policy,
        }
    }
}
