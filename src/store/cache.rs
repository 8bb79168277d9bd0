// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A small least-recently-used cache of loaded artifacts.

use std::collections::VecDeque;

use ndarray::{ArcArray, IxDyn};

use crate::c64;

/// The kinds of arrays the store can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    BeamM,
    BeamSvd,
    InvbeamSvd,
    BeamUt,
    SingularValues,
}

/// What a cached array is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: ArtifactKind,
    pub mi: usize,
    /// `None` for a whole-mode read.
    pub fi: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum CachedArray {
    Complex(ArcArray<c64, IxDyn>),
    Real(ArcArray<f64, IxDyn>),
}

/// Most recently used entries are at the front.
#[derive(Debug)]
pub struct ArtifactCache {
    cap: usize,
    entries: VecDeque<(CacheKey, CachedArray)>,
}

impl ArtifactCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::with_capacity(cap),
        }
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<CachedArray> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(pos)?;
        let value = entry.1.clone();
        self.entries.push_front(entry);
        Some(value)
    }

    pub fn insert(&mut self, key: CacheKey, value: CachedArray) {
        if self.cap == 0 {
            return;
        }
        if let Some(pos) = self.entries.iter().position(|(k, _)| k == &key) {
            self.entries.remove(pos);
        }
        self.entries.push_front((key, value));
        self.entries.truncate(self.cap);
    }

    /// Forget everything cached about a mode.
    pub fn invalidate_mode(&mut self, mi: usize) {
        self.entries.retain(|(k, _)| k.mi != mi);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn key(mi: usize, fi: Option<usize>) -> CacheKey {
        CacheKey {
            kind: ArtifactKind::SingularValues,
            mi,
            fi,
        }
    }

    fn value(v: f64) -> CachedArray {
        CachedArray::Real(ArrayD::from_elem(IxDyn(&[1]), v).into_shared())
    }

    fn real(v: CachedArray) -> f64 {
        match v {
            CachedArray::Real(a) => a[[0]],
            CachedArray::Complex(_) => panic!("expected a real array"),
        }
    }

    #[test]
    fn test_single_slot_keeps_last_value() {
        let mut cache = ArtifactCache::new(1);
        cache.insert(key(0, None), value(1.0));
        assert_eq!(real(cache.get(&key(0, None)).unwrap()), 1.0);
        cache.insert(key(1, None), value(2.0));
        assert!(cache.get(&key(0, None)).is_none());
        assert_eq!(real(cache.get(&key(1, None)).unwrap()), 2.0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let mut cache = ArtifactCache::new(2);
        cache.insert(key(0, Some(0)), value(1.0));
        cache.insert(key(0, Some(1)), value(2.0));
        // Touch the first, so the second is the oldest.
        assert!(cache.get(&key(0, Some(0))).is_some());
        cache.insert(key(1, None), value(3.0));
        assert!(cache.get(&key(0, Some(1))).is_none());
        assert!(cache.get(&key(0, Some(0))).is_some());
        assert!(cache.get(&key(1, None)).is_some());
    }

    #[test]
    fn test_invalidate_and_zero_capacity() {
        let mut cache = ArtifactCache::new(3);
        cache.insert(key(0, None), value(1.0));
        cache.insert(key(1, None), value(2.0));
        cache.invalidate_mode(0);
        assert!(cache.get(&key(0, None)).is_none());
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());

        let mut cache = ArtifactCache::new(0);
        cache.insert(key(0, None), value(1.0));
        assert!(cache.get(&key(0, None)).is_none());
    }
}
