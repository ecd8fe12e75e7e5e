//! In-process read cache for memory records on the retrieval path.
//!
//! Access counts are never served from here; they are incremented with an
//! atomic SQL update and only read back through storage.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::model::memory::MemoryRecord;

pub struct RecordCache {
    entries: Mutex<HashMap<Uuid, (MemoryRecord, Instant)>>,
    ttl: Duration,
    max_entries: usize,
}

impl RecordCache {
    pub fn new(ttl_seconds: u64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_seconds),
            max_entries,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<MemoryRecord> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((record, inserted_at)) = entries.get(&id) {
            if inserted_at.elapsed() < self.ttl {
                return Some(record.clone());
            }
            entries.remove(&id);
        }
        None
    }

    pub fn put(&self, record: MemoryRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if entries.len() >= self.max_entries {
            let now = Instant::now();
            entries.retain(|_, (_, inserted_at)| now.duration_since(*inserted_at) < self.ttl);
        }
        if entries.len() >= self.max_entries && !entries.contains_key(&record.id) {
            return;
        }

        entries.insert(record.id, (record, Instant::now()));
    }

    pub fn invalidate(&self, id: Uuid) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::memory::MemoryType;

    fn make_record(id: Uuid) -> MemoryRecord {
        MemoryRecord {
            id,
            agent_id: None,
            content: format!("content-{id}"),
            embedding: vec![0.0; 4],
            memory_type: MemoryType::Episodic,
            importance: 0.5,
            access_count: 0,
            last_accessed_at: None,
            metadata: serde_json::Value::Null,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_put_and_get() {
        let cache = RecordCache::new(60, 16);
        let id = Uuid::now_v7();
        cache.put(make_record(id));
        assert_eq!(cache.get(id).unwrap().id, id);
    }

    #[test]
    fn test_miss_and_invalidate() {
        let cache = RecordCache::new(60, 16);
        assert!(cache.get(Uuid::now_v7()).is_none());

        let id = Uuid::now_v7();
        cache.put(make_record(id));
        cache.invalidate(id);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = RecordCache::new(60, 2);
        cache.put(make_record(Uuid::now_v7()));
        cache.put(make_record(Uuid::now_v7()));
        cache.put(make_record(Uuid::now_v7()));
        assert!(cache.len() <= 2);
    }
}
