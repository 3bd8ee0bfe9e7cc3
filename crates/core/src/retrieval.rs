use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::{MetadataFilter, QueryRequest, ScoredChunk, DEFAULT_SCORE_FLOOR, DEFAULT_TOP_K};
use crate::traits::VectorStore;
use tracing::debug;

/// Similarity search parameters for one question.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalRequest<'a> {
    pub question: &'a str,
    pub filter: &'a MetadataFilter,
    pub k: usize,
    pub score_floor: f32,
}

impl<'a> RetrievalRequest<'a> {
    pub fn new(question: &'a str, filter: &'a MetadataFilter) -> Self {
        Self {
            question,
            filter,
            k: DEFAULT_TOP_K,
            score_floor: DEFAULT_SCORE_FLOOR,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_score_floor(mut self, score_floor: f32) -> Self {
        self.score_floor = score_floor;
        self
    }
}

impl<'a> From<&'a QueryRequest> for RetrievalRequest<'a> {
    fn from(query: &'a QueryRequest) -> Self {
        Self {
            question: &query.question,
            filter: &query.filter,
            k: query.k,
            score_floor: query.score_floor,
        }
    }
}

/// Top-`k` chunks for the question under the filter, best first. An empty
/// result is a normal outcome, not an error.
pub async fn retrieve<E, S>(
    embedder: &E,
    store: Option<&S>,
    request: &RetrievalRequest<'_>,
) -> Result<Vec<ScoredChunk>, SearchError>
where
    E: Embedder + ?Sized,
    S: VectorStore + ?Sized,
{
    let question = request.question.trim();
    if question.is_empty() {
        return Err(SearchError::Request("question is empty".to_string()));
    }

    let Some(store) = store else {
        return Err(SearchError::NotReady(
            "no vector index has been built yet".to_string(),
        ));
    };

    if request.k == 0 || store.is_empty() {
        return Ok(Vec::new());
    }

    let query_vector = embedder.embed_query(question).await?;
    let hits = store.similarity_search(
        &query_vector,
        request.k,
        request.filter,
        request.score_floor,
    );

    debug!(
        hits = hits.len(),
        k = request.k,
        score_floor = request.score_floor,
        filter = ?request.filter,
        "retrieval finished"
    );
    Ok(hits)
}
