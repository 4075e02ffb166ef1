//! Deterministic key partitioning
//!
//! Intersects the per-source key maps and assigns keys to workers
//! round-robin over the canonical order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::data::{SourceTagMap, WorkKey};

/// One complete key with its tag on every source, in source order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: WorkKey,
    pub tags: Vec<String>,
}

/// Canonical ordered set of complete keys. Read-only once broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    entries: Vec<KeyEntry>,
}

impl KeySet {
    /// Keep only keys present in every source, sorted by key
    pub fn intersect(per_source: &[SourceTagMap]) -> Self {
        let Some((first, rest)) = per_source.split_first() else {
            return Self::default();
        };

        let entries: Vec<KeyEntry> = first
            .iter()
            .filter_map(|(key, tag)| {
                let mut tags = Vec::with_capacity(per_source.len());
                tags.push(tag.clone());
                for map in rest {
                    tags.push(map.get(key)?.clone());
                }
                Some(KeyEntry {
                    key: key.clone(),
                    tags,
                })
            })
            .collect();

        debug!(
            "{} of {} keys complete across {} sources",
            entries.len(),
            first.len(),
            per_source.len()
        );

        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in canonical order
    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    /// Keys in canonical order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Canonical position of a key
    pub fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.key.as_str().cmp(key))
            .ok()
    }
}

/// Static round-robin assignment of canonical positions to workers
#[derive(Debug, Clone, Copy)]
pub struct KeyAssigner {
    num_workers: u32,
}

impl KeyAssigner {
    /// Create an assigner for a group of `num_workers`
    pub fn new(num_workers: u32) -> Self {
        Self { num_workers }
    }

    /// Worker owning the key at `position`
    pub fn owner(&self, position: usize) -> u32 {
        if self.num_workers == 0 {
            return 0;
        }
        (position % self.num_workers as usize) as u32
    }

    /// Whether `worker_id` owns the key at `position`
    pub fn is_local(&self, position: usize, worker_id: u32) -> bool {
        self.num_workers > 0 && self.owner(position) == worker_id
    }

    /// Keys owned by one worker, with their canonical positions
    pub fn keys_for_worker<'a>(
        &self,
        keys: &'a KeySet,
        worker_id: u32,
    ) -> Vec<(usize, &'a KeyEntry)> {
        keys.entries()
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.is_local(*idx, worker_id))
            .collect()
    }

    /// Full worker -> keys assignment
    pub fn assign(&self, keys: &KeySet) -> HashMap<u32, Vec<WorkKey>> {
        let mut assignments: HashMap<u32, Vec<WorkKey>> =
            (0..self.num_workers).map(|id| (id, Vec::new())).collect();

        if self.num_workers == 0 {
            return assignments;
        }

        for (idx, entry) in keys.entries().iter().enumerate() {
            assignments
                .entry(self.owner(idx))
                .or_default()
                .push(entry.key.clone());
        }

        debug!(
            "Assigned {} keys to {} workers",
            keys.len(),
            self.num_workers
        );

        assignments
    }
}
