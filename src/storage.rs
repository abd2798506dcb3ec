use crate::error::Result;
use crate::types::{MemoryId, MemoryRecord, Relationship, SupersededPair};
use async_trait::async_trait;

/// Values filled into records that do not set them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertDefaults {
    pub source: Option<String>,
    pub tags: Vec<String>,
}

impl UpsertDefaults {
    pub fn apply(&self, record: &mut MemoryRecord) {
        if record.metadata.source.is_none() {
            record.metadata.source = self.source.clone();
        }
        for tag in &self.tags {
            if !record.metadata.tags.contains(tag) {
                record.metadata.tags.push(tag.clone());
            }
        }
    }
}

/// Record and relationship persistence, scoped by index name
#[async_trait]
pub trait MemoryStorage: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Load one record with its outgoing edges; superseded records included
    async fn get_memory(&self, index: &str, id: &str) -> Result<Option<MemoryRecord>>;

    /// Load several records in request order, skipping unknown ids
    async fn get_memories(&self, index: &str, ids: &[MemoryId]) -> Result<Vec<MemoryRecord>>;

    /// Live (not superseded) records ordered by narrative time
    async fn list_memories(&self, index: &str, limit: Option<i64>) -> Result<Vec<MemoryRecord>>;

    /// Insert or replace records. A record whose `relationships` is `None`
    /// keeps its stored edges; `Some` replaces them atomically.
    async fn upsert_memories(
        &self,
        index: &str,
        records: &[MemoryRecord],
        defaults: Option<&UpsertDefaults>,
    ) -> Result<Vec<MemoryId>>;

    async fn delete_memories(&self, index: &str, ids: &[MemoryId]) -> Result<u64>;

    async fn mark_memories_superseded(&self, index: &str, pairs: &[SupersededPair]) -> Result<u64>;

    async fn increment_sleep_cycles(&self, index: &str, ids: &[MemoryId]) -> Result<u64>;

    async fn get_relationships(&self, index: &str, source_id: &str) -> Result<Vec<Relationship>>;
}
