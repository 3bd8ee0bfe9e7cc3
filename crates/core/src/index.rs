use crate::chunk_id::assign_chunk_ids;
use crate::embeddings::Embedder;
use crate::error::{IndexError, SearchError};
use crate::llm::non_blank_env;
use crate::models::{ChunkMetadata, IndexedDocument, ScoredChunk};
use crate::retrieval::{retrieve, RetrievalRequest};
use crate::store::FlatVectorStore;
use crate::traits::{IndexRecord, VectorStore};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_INDEX_NAME: &str = "index.json";
const LOCK_FILE_NAME: &str = ".index.lock";

#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub folder: PathBuf,
    pub index_name: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("./db_manager/vector_index"),
            index_name: DEFAULT_INDEX_NAME.to_string(),
        }
    }
}

impl IndexConfig {
    pub fn in_folder(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            ..Self::default()
        }
    }

    /// Honours `RAG_INDEX_DIR` when set.
    pub fn from_env() -> Self {
        match non_blank_env("RAG_INDEX_DIR") {
            Some(folder) => Self::in_folder(folder),
            None => Self::default(),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.folder.join(&self.index_name)
    }
}

/// Result of one [`VectorIndexManager::add`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// No index existed; a new one was built and persisted.
    Created { added: usize },
    /// New chunk ids were appended and the index persisted.
    Appended { added: usize, skipped: usize },
    /// Every chunk id was already present; nothing was written.
    Unchanged { skipped: usize },
}

impl AddOutcome {
    pub fn added(&self) -> usize {
        match self {
            AddOutcome::Created { added } | AddOutcome::Appended { added, .. } => *added,
            AddOutcome::Unchanged { .. } => 0,
        }
    }
}

/// Exclusive advisory lock on the index folder, released on drop.
struct WriterLock {
    file: File,
}

impl WriterLock {
    fn acquire(folder: &Path) -> Result<Self, IndexError> {
        fs::create_dir_all(folder)?;
        let path = folder.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| IndexError::Locked(path.display().to_string()))?;
        Ok(Self { file })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Owns the persisted chunk index: create-or-load, id-deduplicated adds and
/// lookups.
pub struct VectorIndexManager<E> {
    config: IndexConfig,
    embedder: E,
    store: Option<FlatVectorStore>,
}

impl<E: Embedder> VectorIndexManager<E> {
    /// A manager with no index yet; the first non-empty `add` creates one.
    pub fn new(config: IndexConfig, embedder: E) -> Self {
        Self {
            config,
            embedder,
            store: None,
        }
    }

    /// Loads the persisted index, failing with `IndexNotFound` if absent.
    pub fn load(config: IndexConfig, embedder: E) -> Result<Self, IndexError> {
        let store = read_store(&config, &embedder)?;
        Ok(Self {
            config,
            embedder,
            store: Some(store),
        })
    }

    /// Loads the index when its file exists. Any load failure is logged and
    /// treated as "no index yet" so ingestion can build a fresh one.
    pub fn create_or_load(config: IndexConfig, embedder: E) -> Self {
        let path = config.index_path();
        if !path.exists() {
            debug!(path = %path.display(), "no vector index yet");
            return Self::new(config, embedder);
        }

        let store = match read_store(&config, &embedder) {
            Ok(store) => Some(store),
            Err(error) => {
                warn!(
                    path = %path.display(),
                    %error,
                    "could not load vector index, a new one will be created"
                );
                None
            }
        };

        Self {
            config,
            embedder,
            store,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn store(&self) -> Option<&FlatVectorStore> {
        self.store.as_ref()
    }

    pub fn has_index(&self) -> bool {
        self.store.is_some()
    }

    pub fn len(&self) -> usize {
        self.store.as_ref().map_or(0, VectorStore::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assigns chunk ids, then stores only chunks whose id is new.
    ///
    /// The id filter and the save both run under the writer lock against the
    /// index as it is on disk, so concurrent writers never drop each other's
    /// chunks. In-memory state changes only after a successful save.
    pub async fn add(
        &mut self,
        texts: Vec<String>,
        mut metadatas: Vec<ChunkMetadata>,
    ) -> Result<AddOutcome, IndexError> {
        if texts.len() != metadatas.len() {
            return Err(IndexError::LengthMismatch {
                texts: texts.len(),
                metadatas: metadatas.len(),
            });
        }

        assign_chunk_ids(&mut metadatas);
        let incoming = texts.len();
        if incoming == 0 {
            return Ok(AddOutcome::Unchanged { skipped: 0 });
        }

        let _lock = WriterLock::acquire(&self.config.folder)?;
        self.refresh_from_disk();

        let (fresh_texts, fresh_metadatas) = self.new_chunks(texts, metadatas);
        let skipped = incoming - fresh_texts.len();
        if fresh_texts.is_empty() {
            debug!(skipped, "no new chunk ids to add");
            return Ok(AddOutcome::Unchanged { skipped });
        }

        let embeddings = self.embedder.embed_documents(&fresh_texts).await?;
        if embeddings.len() != fresh_texts.len() {
            return Err(IndexError::Corrupt(format!(
                "{} embeddings returned for {} chunks",
                embeddings.len(),
                fresh_texts.len()
            )));
        }

        let records: Vec<IndexRecord> = fresh_texts
            .into_iter()
            .zip(fresh_metadatas)
            .zip(embeddings)
            .filter_map(|((text, metadata), embedding)| {
                metadata.chunk_id.clone().map(|chunk_id| IndexRecord {
                    chunk_id,
                    text,
                    metadata,
                    embedding,
                })
            })
            .collect();

        let dimensions = match self.store.as_ref() {
            Some(store) => store.dimensions(),
            None => records.first().map_or(0, |record| record.embedding.len()),
        };
        if let Some(bad) = records
            .iter()
            .find(|record| record.embedding.len() != dimensions)
        {
            return Err(IndexError::Corrupt(format!(
                "embedding for {} has {} dimensions, index uses {}",
                bad.chunk_id,
                bad.embedding.len(),
                dimensions
            )));
        }

        let created = self.store.is_none();
        let mut store = match self.store.as_ref() {
            Some(store) => store.clone(),
            None => FlatVectorStore::new(self.embedder.model_id(), dimensions),
        };
        let added = store.insert_new(records);
        store.save(&self.config.index_path())?;

        info!(
            added,
            skipped,
            total_chunks = store.len(),
            path = %self.config.index_path().display(),
            "vector index persisted"
        );
        self.store = Some(store);

        Ok(if created {
            AddOutcome::Created { added }
        } else {
            AddOutcome::Appended { added, skipped }
        })
    }

    /// Re-reads the persisted index. Call with the writer lock held. An
    /// unreadable file leaves the in-memory index as it was.
    fn refresh_from_disk(&mut self) {
        let path = self.config.index_path();
        if !path.exists() {
            return;
        }
        match read_store(&self.config, &self.embedder) {
            Ok(store) => self.store = Some(store),
            Err(error) => {
                warn!(path = %path.display(), %error, "could not re-read vector index before writing");
            }
        }
    }

    /// Chunks whose id is neither stored nor repeated earlier in the batch.
    fn new_chunks(
        &self,
        texts: Vec<String>,
        metadatas: Vec<ChunkMetadata>,
    ) -> (Vec<String>, Vec<ChunkMetadata>) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut fresh_texts = Vec::new();
        let mut fresh_metadatas = Vec::new();
        for (text, metadata) in texts.into_iter().zip(metadatas) {
            let Some(chunk_id) = metadata.chunk_id.clone() else {
                continue;
            };
            let stored = self
                .store
                .as_ref()
                .is_some_and(|store| store.contains(&chunk_id));
            if stored || !seen.insert(chunk_id) {
                continue;
            }
            fresh_texts.push(text);
            fresh_metadatas.push(metadata);
        }
        (fresh_texts, fresh_metadatas)
    }

    /// Exact chunk-id lookup of the stored chunk text.
    pub fn lookup_text(&self, chunk_id: &str) -> Option<&str> {
        self.store
            .as_ref()
            .and_then(|store| store.get(chunk_id))
            .map(|record| record.text.as_str())
    }

    pub async fn retrieve(
        &self,
        request: &RetrievalRequest<'_>,
    ) -> Result<Vec<ScoredChunk>, SearchError> {
        retrieve(&self.embedder, self.store.as_ref(), request).await
    }

    /// Distinct documents in the index, in first-ingested order.
    pub fn documents(&self) -> Vec<IndexedDocument> {
        let Some(store) = self.store.as_ref() else {
            return Vec::new();
        };

        let mut documents: Vec<IndexedDocument> = Vec::new();
        for record in store.records() {
            let metadata = &record.metadata;
            let existing = documents.iter_mut().find(|document| {
                document.path == metadata.path && document.title == metadata.bill.title
            });
            match existing {
                Some(document) => document.chunk_count += 1,
                None => documents.push(IndexedDocument {
                    title: metadata.bill.title.clone(),
                    jurisdiction: metadata.bill.jurisdiction,
                    state: metadata.bill.state.clone(),
                    topics: metadata.bill.topics.clone(),
                    path: metadata.path.clone(),
                    chunk_count: 1,
                }),
            }
        }
        documents
    }
}

fn read_store<E: Embedder>(
    config: &IndexConfig,
    embedder: &E,
) -> Result<FlatVectorStore, IndexError> {
    let store = FlatVectorStore::load(&config.index_path())?;
    let expected = embedder.model_id();
    if store.embedding_model() != expected {
        return Err(IndexError::Corrupt(format!(
            "index was built with embedding model {}, current model is {}",
            store.embedding_model(),
            expected
        )));
    }

    info!(
        path = %config.index_path().display(),
        chunks = store.len(),
        "loaded vector index"
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::MetadataFilter;
    use tempfile::tempdir;

    fn batch() -> (Vec<String>, Vec<ChunkMetadata>) {
        let texts = vec![
            "A controller shall provide a consumer with a reasonably accessible privacy notice."
                .to_string(),
            "A consumer may opt out of the processing of personal data for targeted advertising."
                .to_string(),
            "The attorney general has exclusive authority to enforce this chapter.".to_string(),
        ];
        let metadatas = [1, 1, 2]
            .into_iter()
            .map(|page| {
                let mut metadata = ChunkMetadata {
                    page: Some(page),
                    path: Some("./pdfs/Texas/tdpsa.pdf".to_string()),
                    ..ChunkMetadata::default()
                };
                metadata.bill.title = Some("Texas: Data Privacy and Security Act".to_string());
                metadata.bill.state = Some("Texas".to_string());
                metadata
            })
            .collect();
        (texts, metadatas)
    }

    #[tokio::test]
    async fn adding_twice_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut manager = VectorIndexManager::new(
            IndexConfig::in_folder(dir.path()),
            CharacterNgramEmbedder::default(),
        );

        let (texts, metadatas) = batch();
        let first = manager.add(texts.clone(), metadatas.clone()).await?;
        let second = manager.add(texts, metadatas).await?;

        assert_eq!(first, AddOutcome::Created { added: 3 });
        assert_eq!(second, AddOutcome::Unchanged { skipped: 3 });
        assert_eq!(manager.len(), 3);

        let reloaded = VectorIndexManager::load(
            IndexConfig::in_folder(dir.path()),
            CharacterNgramEmbedder::default(),
        )?;
        assert_eq!(reloaded.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn only_new_chunk_ids_are_appended() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = IndexConfig::in_folder(dir.path());
        let mut manager = VectorIndexManager::new(config.clone(), CharacterNgramEmbedder::default());

        let (texts, metadatas) = batch();
        manager.add(texts[..2].to_vec(), metadatas[..2].to_vec()).await?;

        let mut manager = VectorIndexManager::create_or_load(config, CharacterNgramEmbedder::default());
        let outcome = manager.add(texts, metadatas).await?;

        assert_eq!(outcome, AddOutcome::Appended { added: 1, skipped: 2 });
        assert_eq!(manager.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn empty_batch_on_missing_index_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = IndexConfig::in_folder(dir.path().join("fresh"));
        let mut manager = VectorIndexManager::new(config.clone(), CharacterNgramEmbedder::default());

        let outcome = manager.add(Vec::new(), Vec::new()).await?;

        assert_eq!(outcome, AddOutcome::Unchanged { skipped: 0 });
        assert!(!manager.has_index());
        assert!(!config.index_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn lookup_returns_text_for_exact_id() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut manager = VectorIndexManager::new(
            IndexConfig::in_folder(dir.path()),
            CharacterNgramEmbedder::default(),
        );
        let (texts, metadatas) = batch();
        manager.add(texts.clone(), metadatas).await?;

        let id = "Texas:_Data_Privacy_and_Security_Act_Page_1_ChunkNo_1";
        assert_eq!(manager.lookup_text(id), Some(texts[1].as_str()));
        assert_eq!(manager.lookup_text("Texas:_Data_Privacy_and_Security_Act_Page_9_ChunkNo_0"), None);
        Ok(())
    }

    #[test]
    fn load_without_index_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = VectorIndexManager::load(
            IndexConfig::in_folder(dir.path()),
            CharacterNgramEmbedder::default(),
        );
        assert!(matches!(result, Err(IndexError::IndexNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_index_is_replaced_on_next_add() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = IndexConfig::in_folder(dir.path());
        fs::write(config.index_path(), b"{ not json")?;

        let mut manager = VectorIndexManager::create_or_load(config.clone(), CharacterNgramEmbedder::default());
        assert!(!manager.has_index());

        let (texts, metadatas) = batch();
        let outcome = manager.add(texts, metadatas).await?;

        assert_eq!(outcome, AddOutcome::Created { added: 3 });
        let reloaded = VectorIndexManager::load(config, CharacterNgramEmbedder::default())?;
        assert_eq!(reloaded.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn index_from_another_embedding_model_is_not_reused() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = IndexConfig::in_folder(dir.path());
        let mut manager = VectorIndexManager::new(config.clone(), CharacterNgramEmbedder { dimensions: 16 });
        let (texts, metadatas) = batch();
        manager.add(texts, metadatas).await?;

        let result = VectorIndexManager::load(config.clone(), CharacterNgramEmbedder::default());
        assert!(matches!(result, Err(IndexError::Corrupt(_))));

        let fallback = VectorIndexManager::create_or_load(config, CharacterNgramEmbedder::default());
        assert!(!fallback.has_index());
        Ok(())
    }

    #[tokio::test]
    async fn held_lock_blocks_a_second_writer() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = IndexConfig::in_folder(dir.path());
        let _held = WriterLock::acquire(&config.folder)?;

        let mut manager = VectorIndexManager::new(config, CharacterNgramEmbedder::default());
        let (texts, metadatas) = batch();
        let result = manager.add(texts, metadatas).await;

        assert!(matches!(result, Err(IndexError::Locked(_))));
        Ok(())
    }

    #[tokio::test]
    async fn writers_loaded_from_the_same_index_keep_each_others_chunks(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = IndexConfig::in_folder(dir.path());
        let (texts, metadatas) = batch();
        let mut seed = VectorIndexManager::new(config.clone(), CharacterNgramEmbedder::default());
        seed.add(texts[..1].to_vec(), metadatas[..1].to_vec()).await?;

        let mut first = VectorIndexManager::create_or_load(config.clone(), CharacterNgramEmbedder::default());
        let mut second = VectorIndexManager::create_or_load(config.clone(), CharacterNgramEmbedder::default());

        let from_first = first.add(texts[..2].to_vec(), metadatas[..2].to_vec()).await?;
        let from_second = second.add(texts[2..].to_vec(), metadatas[2..].to_vec()).await?;

        assert_eq!(from_first, AddOutcome::Appended { added: 1, skipped: 1 });
        assert_eq!(from_second, AddOutcome::Appended { added: 1, skipped: 0 });
        assert_eq!(second.len(), 3);

        let persisted = VectorIndexManager::load(config, CharacterNgramEmbedder::default())?;
        assert_eq!(persisted.len(), 3);
        assert_eq!(
            persisted.lookup_text("Texas:_Data_Privacy_and_Security_Act_Page_1_ChunkNo_1"),
            Some(texts[1].as_str())
        );
        assert_eq!(
            persisted.lookup_text("Texas:_Data_Privacy_and_Security_Act_Page_2_ChunkNo_0"),
            Some(texts[2].as_str())
        );
        Ok(())
    }

    #[tokio::test]
    async fn untitled_chunks_on_one_page_keep_the_first() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut manager = VectorIndexManager::new(
            IndexConfig::in_folder(dir.path()),
            CharacterNgramEmbedder::default(),
        );
        let untitled = |path: &str| ChunkMetadata {
            page: Some(4),
            path: Some(path.to_string()),
            ..ChunkMetadata::default()
        };

        manager
            .add(
                vec!["Biometric identifiers may not be sold.".to_string()],
                vec![untitled("./pdfs/Ohio/first.pdf")],
            )
            .await?;
        let outcome = manager
            .add(
                vec!["A data broker shall register annually.".to_string()],
                vec![untitled("./pdfs/Ohio/second.pdf")],
            )
            .await?;

        assert_eq!(outcome, AddOutcome::Unchanged { skipped: 1 });
        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.lookup_text("unknown_Page_4_ChunkNo_0"),
            Some("Biometric identifiers may not be sold.")
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_save_leaves_the_batch_retryable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = IndexConfig::in_folder(dir.path());
        let mut manager = VectorIndexManager::new(config.clone(), CharacterNgramEmbedder::default());
        let (texts, metadatas) = batch();
        manager.add(texts[..1].to_vec(), metadatas[..1].to_vec()).await?;

        // A non-empty directory at the index path makes the final rename fail.
        fs::remove_file(config.index_path())?;
        fs::create_dir_all(config.index_path().join("blocker"))?;
        let failed = manager.add(texts.clone(), metadatas.clone()).await;
        assert!(failed.is_err());
        assert_eq!(manager.len(), 1);

        fs::remove_dir_all(config.index_path())?;
        let retried = manager.add(texts, metadatas).await?;

        assert_eq!(retried, AddOutcome::Appended { added: 2, skipped: 1 });
        let persisted = VectorIndexManager::load(config, CharacterNgramEmbedder::default())?;
        assert_eq!(persisted.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn documents_group_chunks_by_path_and_title() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut manager = VectorIndexManager::new(
            IndexConfig::in_folder(dir.path()),
            CharacterNgramEmbedder::default(),
        );
        let (texts, metadatas) = batch();
        manager.add(texts, metadatas).await?;

        let documents = manager.documents();

        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].chunk_count, 3);
        assert_eq!(documents[0].state.as_deref(), Some("Texas"));
        Ok(())
    }

    #[tokio::test]
    async fn retrieval_is_filtered_by_state() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut manager = VectorIndexManager::new(
            IndexConfig::in_folder(dir.path()),
            CharacterNgramEmbedder::default(),
        );
        let (texts, metadatas) = batch();
        manager.add(texts, metadatas).await?;

        let ohio = MetadataFilter::state("Ohio");
        let request = RetrievalRequest::new("opt out of targeted advertising", &ohio);
        assert!(manager.retrieve(&request).await?.is_empty());

        let texas = MetadataFilter::state("Texas");
        let request = RetrievalRequest::new("opt out of targeted advertising", &texas);
        let hits = manager.retrieve(&request).await?;
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.metadata.bill.state.as_deref() == Some("Texas")));
        Ok(())
    }
}
