use crate::models::{ChunkMetadata, MetadataFilter, ScoredChunk};
use serde::{Deserialize, Serialize};

/// One stored chunk: primary key, text, metadata and embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexRecord {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
}

/// The narrow surface the pipeline needs from a vector store engine.
pub trait VectorStore {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, chunk_id: &str) -> bool;

    /// Inserts records whose chunk id is not yet stored; returns how many
    /// were inserted.
    fn insert_new(&mut self, records: Vec<IndexRecord>) -> usize;

    fn get(&self, chunk_id: &str) -> Option<&IndexRecord>;

    /// Up to `k` chunks matching `filter` with relevance at or above
    /// `score_floor`, best first.
    fn similarity_search(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
        score_floor: f32,
    ) -> Vec<ScoredChunk>;

    fn records(&self) -> Box<dyn Iterator<Item = &IndexRecord> + '_>;
}
