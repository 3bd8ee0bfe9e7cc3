use crate::answer::AnswerPipeline;
use crate::embeddings::Embedder;
use crate::error::QueryError;
use crate::explain::ExplainabilitySummarizer;
use crate::extractor::PdfExtractor;
use crate::index::VectorIndexManager;
use crate::llm::LanguageModel;
use crate::models::{AnswerRecord, MetadataFilter, Outcome, QueryRequest};
use crate::retrieval::RetrievalRequest;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// Holds the answer for the most recent `(question, filter)` pair.
///
/// Asking the same trimmed question under the same filter again returns the
/// cached record; any change to either replaces it.
#[derive(Debug, Default)]
pub struct AnswerCache {
    current: Option<((String, MetadataFilter), AnswerRecord)>,
}

impl AnswerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, request: &QueryRequest) -> Option<&AnswerRecord> {
        let key = request.cache_key();
        self.current
            .as_ref()
            .filter(|(cached, _)| *cached == key)
            .map(|(_, record)| record)
    }

    pub fn store(&mut self, request: &QueryRequest, record: AnswerRecord) {
        self.current = Some((request.cache_key(), record));
    }

    pub fn invalidate(&mut self) {
        self.current = None;
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }
}

/// Answers questions against one index: retrieve, draft and verify, then
/// explain the cited pages.
pub struct QuerySession<E, M, X> {
    index: VectorIndexManager<E>,
    pipeline: AnswerPipeline<M>,
    summarizer: ExplainabilitySummarizer<M, X>,
    cache: AnswerCache,
}

impl<E, M, X> QuerySession<E, M, X>
where
    E: Embedder,
    M: LanguageModel,
    X: PdfExtractor,
{
    pub fn new(
        index: VectorIndexManager<E>,
        pipeline: AnswerPipeline<M>,
        summarizer: ExplainabilitySummarizer<M, X>,
    ) -> Self {
        Self {
            index,
            pipeline,
            summarizer,
            cache: AnswerCache::new(),
        }
    }

    pub fn index(&self) -> &VectorIndexManager<E> {
        &self.index
    }

    /// Mutable index access; drops the cached answer since the index may
    /// change underneath it.
    pub fn index_mut(&mut self) -> &mut VectorIndexManager<E> {
        self.cache.invalidate();
        &mut self.index
    }

    pub fn cache(&self) -> &AnswerCache {
        &self.cache
    }

    pub async fn ask(&mut self, request: &QueryRequest) -> Result<AnswerRecord, QueryError> {
        if let Some(record) = self.cache.get(request) {
            debug!("answer served from session cache");
            return Ok(record.clone());
        }

        let request_id = Uuid::new_v4();
        let span = info_span!("query", %request_id, filter = ?request.filter, k = request.k);
        let record = self.answer_uncached(request).instrument(span).await?;

        self.cache.store(request, record.clone());
        Ok(record)
    }

    async fn answer_uncached(&self, request: &QueryRequest) -> Result<AnswerRecord, QueryError> {
        let question = request.question.trim();
        let retrieval = RetrievalRequest::from(request);
        let retrieved = self.index.retrieve(&retrieval).await?;
        info!(retrieved = retrieved.len(), "chunks retrieved");

        let answer = self.pipeline.answer(question, &retrieved).await?;

        let explanations = match answer.outcome {
            Outcome::DatabaseAnswer | Outcome::NoDatabaseInfo => {
                self.summarizer.summarize(question, &retrieved).await
            }
            Outcome::NoResults | Outcome::Ungrounded => Vec::new(),
        };

        Ok(AnswerRecord {
            question: question.to_string(),
            filter: request.filter.clone(),
            draft_answer: answer.draft_answer,
            verified_answer: answer.verified_answer,
            outcome: answer.outcome,
            retrieved,
            explanations,
        })
    }
}
