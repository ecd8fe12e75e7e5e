use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::index::VectorIndex;
use uuid::Uuid;

const RESERVE_CHUNK: usize = 10_000;

/// Cosine-metric usearch index keyed by UUID.
///
/// usearch addresses vectors by u64 keys; keys are allocated monotonically
/// in insertion order, which is what makes the (distance, key) sort below a
/// stable insertion-order tiebreak. The index is not persisted to disk; it
/// is rebuilt from the stored embeddings on startup.
pub struct UsearchIndex {
    index: RwLock<usearch::Index>,
    keys: RwLock<KeyMap>,
    dimensions: usize,
}

#[derive(Default)]
struct KeyMap {
    forward: HashMap<Uuid, u64>,
    reverse: HashMap<u64, Uuid>,
    next: u64,
}

impl KeyMap {
    fn allocate(&mut self, id: Uuid) -> u64 {
        let key = self.next;
        self.next += 1;
        self.forward.insert(id, key);
        self.reverse.insert(key, id);
        key
    }

    fn release(&mut self, id: Uuid) -> Option<u64> {
        let key = self.forward.remove(&id)?;
        self.reverse.remove(&key);
        Some(key)
    }
}

impl UsearchIndex {
    pub fn new(dimensions: usize) -> Result<Self> {
        let opts = usearch::IndexOptions {
            dimensions,
            metric: usearch::MetricKind::Cos,
            quantization: usearch::ScalarKind::F32,
            ..Default::default()
        };
        let index = usearch::Index::new(&opts).map_err(|e| Error::Index(e.to_string()))?;
        index
            .reserve(RESERVE_CHUNK)
            .map_err(|e| Error::Index(e.to_string()))?;

        Ok(Self {
            index: RwLock::new(index),
            keys: RwLock::new(KeyMap::default()),
            dimensions,
        })
    }
}

impl VectorIndex for UsearchIndex {
    fn add(&self, id: Uuid, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::Validation(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        // Re-adding an id replaces its vector.
        if self.keys.read().unwrap().forward.contains_key(&id) {
            self.remove(id)?;
        }

        let key = self.keys.write().unwrap().allocate(id);
        let index = self.index.read().unwrap();
        if index.size() >= index.capacity() {
            index
                .reserve(index.capacity() + RESERVE_CHUNK)
                .map_err(|e| Error::Index(e.to_string()))?;
        }
        index
            .add(key, vector)
            .map_err(|e| Error::Index(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<()> {
        let key = match self.keys.write().unwrap().release(id) {
            Some(k) => k,
            None => return Ok(()),
        };
        let index = self.index.read().unwrap();
        index.remove(key).map_err(|e| Error::Index(e.to_string()))?;
        Ok(())
    }

    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(Uuid, f32)>> {
        if query.len() != self.dimensions {
            return Err(Error::Validation(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                query.len()
            )));
        }

        let matches = {
            let index = self.index.read().unwrap();
            index
                .search(query, limit)
                .map_err(|e| Error::Index(e.to_string()))?
        };

        let mut hits: Vec<(u64, f32)> = matches
            .keys
            .iter()
            .copied()
            .zip(matches.distances.iter().copied())
            .collect();
        // Ascending distance; equal distances resolve to the earlier insert.
        hits.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let keys = self.keys.read().unwrap();
        Ok(hits
            .into_iter()
            .filter_map(|(key, distance)| keys.reverse.get(&key).map(|&id| (id, distance)))
            .collect())
    }

    fn filtered_search(
        &self,
        query: &[f32],
        limit: usize,
        filter: &dyn Fn(Uuid) -> bool,
    ) -> Result<Vec<(Uuid, f32)>> {
        let index_size = self.len();
        if index_size == 0 {
            return Ok(Vec::new());
        }
        // Oversample and widen until enough survivors or the whole index
        // has been scanned.
        let mut oversample = (limit * 3).max(1);
        loop {
            let candidates = self.search(query, oversample.min(index_size))?;
            let survivors: Vec<(Uuid, f32)> = candidates
                .into_iter()
                .filter(|(id, _)| filter(*id))
                .take(limit)
                .collect();
            if survivors.len() >= limit || oversample >= index_size {
                return Ok(survivors);
            }
            oversample = (oversample * 2).min(index_size);
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn len(&self) -> usize {
        self.index.read().unwrap().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_vector(dims: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis % dims] = 1.0;
        v
    }

    fn blended_vector(dims: usize, axis: usize, other: usize, weight: f32) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis % dims] = 1.0;
        v[other % dims] = weight;
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    #[test]
    fn test_add_and_search() {
        let index = UsearchIndex::new(8).unwrap();

        let mut ids = Vec::new();
        for i in 0..8 {
            let id = Uuid::now_v7();
            index.add(id, &unit_vector(8, i)).unwrap();
            ids.push(id);
        }
        assert_eq!(index.len(), 8);

        let results = index.search(&unit_vector(8, 3), 3).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].0, ids[3]);
        assert!(results[0].1 < 1e-5);
    }

    #[test]
    fn test_tie_break_is_insertion_order() {
        let index = UsearchIndex::new(8).unwrap();

        // Two vectors equidistant from the query axis, inserted in order.
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        index.add(first, &blended_vector(8, 1, 0, 0.5)).unwrap();
        index.add(second, &blended_vector(8, 2, 0, 0.5)).unwrap();

        let results = index.search(&unit_vector(8, 0), 2).unwrap();
        assert_eq!(results.len(), 2);
        assert!((results[0].1 - results[1].1).abs() < 1e-5);
        assert_eq!(results[0].0, first);
        assert_eq!(results[1].0, second);
    }

    #[test]
    fn test_remove() {
        let index = UsearchIndex::new(8).unwrap();
        let id = Uuid::now_v7();
        index.add(id, &unit_vector(8, 0)).unwrap();
        assert_eq!(index.len(), 1);

        index.remove(id).unwrap();
        assert_eq!(index.len(), 0);

        // Removing an unknown id is a no-op.
        index.remove(Uuid::now_v7()).unwrap();
    }

    #[test]
    fn test_replace_on_readd() {
        let index = UsearchIndex::new(8).unwrap();
        let id = Uuid::now_v7();
        index.add(id, &unit_vector(8, 0)).unwrap();
        index.add(id, &unit_vector(8, 5)).unwrap();
        assert_eq!(index.len(), 1);

        let results = index.search(&unit_vector(8, 5), 1).unwrap();
        assert_eq!(results[0].0, id);
        assert!(results[0].1 < 1e-5);
    }

    #[test]
    fn test_filtered_search_excludes() {
        let index = UsearchIndex::new(8).unwrap();

        let mut ids = Vec::new();
        for i in 0..8 {
            let id = Uuid::now_v7();
            index.add(id, &blended_vector(8, i, 0, 0.3)).unwrap();
            ids.push(id);
        }

        let excluded: std::collections::HashSet<Uuid> = ids.iter().step_by(2).copied().collect();
        let results = index
            .filtered_search(&unit_vector(8, 0), 4, &|id| !excluded.contains(&id))
            .unwrap();

        assert!(!results.is_empty());
        for (id, _) in &results {
            assert!(!excluded.contains(id));
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = UsearchIndex::new(8).unwrap();
        assert!(index.add(Uuid::now_v7(), &[0.1; 4]).is_err());
        assert!(index.search(&[0.1; 4], 1).is_err());
    }
}
