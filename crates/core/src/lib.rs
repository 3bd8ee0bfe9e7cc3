pub mod answer;
pub mod chunk_id;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod explain;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod metadata;
pub mod models;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod traits;

pub use answer::{classify_outcome, AnswerPipeline, PipelineAnswer};
pub use chunk_id::{assign_chunk_ids, chunk_id};
pub use chunking::{chunk_pages, chunk_pdf_pages, split_text, ChunkingConfig, Provenance};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbeddingConfig, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IndexError, IngestError, LlmError, QueryError, SearchError};
pub use explain::{unique_pages, ExplainabilitySummarizer, PageRef};
pub use extractor::{extract_page_texts, LopdfExtractor, PageTexts, PdfExtractor};
pub use index::{AddOutcome, IndexConfig, VectorIndexManager};
pub use ingest::{
    archive_upload, discover_pdf_files, state_folder, BillIngestor, IngestionReport, SkippedPdf,
    UploadReport,
};
pub use llm::{ChatCompletionsClient, CompletionRequest, LanguageModel, LlmConfig, RetryPolicy};
pub use metadata::{parse_bill_info, MetadataExtractor};
pub use models::{
    AnswerRecord, BillMetadata, BillRecord, ChunkMetadata, ExplainabilityEntry, IndexedDocument,
    IngestionOptions, JurisdictionType, MetadataFilter, Outcome, QueryRequest, ScoredChunk,
    UploadForm,
};
pub use retrieval::{retrieve, RetrievalRequest};
pub use session::{AnswerCache, QuerySession};
pub use store::FlatVectorStore;
pub use traits::{IndexRecord, VectorStore};
