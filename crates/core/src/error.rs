use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf not found: {0}")]
    NotFound(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no index found at {0}")]
    IndexNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt index: {0}")]
    Corrupt(String),

    #[error("index is locked by another writer: {0}")]
    Locked(String),

    #[error("chunk/metadata count mismatch: {texts} texts, {metadatas} metadatas")]
    LengthMismatch { texts: usize, metadatas: usize },

    #[error("embedding failed: {0}")]
    Embedding(#[from] LlmError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] LlmError),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("request to {endpoint} failed after {attempts} attempt(s): {details}")]
    RetriesExhausted {
        endpoint: String,
        attempts: usize,
        details: String,
    },

    #[error("llm client misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("answer generation failed: {0}")]
    Llm(#[from] LlmError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
