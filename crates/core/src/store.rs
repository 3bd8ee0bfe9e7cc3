use crate::embeddings::cosine_similarity;
use crate::error::IndexError;
use crate::models::{MetadataFilter, ScoredChunk};
use crate::traits::{IndexRecord, VectorStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const FORMAT_VERSION: u32 = 1;

/// Exact-scan vector store persisted as a single JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatVectorStore {
    format_version: u32,
    embedding_model: String,
    dimensions: usize,
    updated_at: DateTime<Utc>,
    records: Vec<IndexRecord>,
    #[serde(skip)]
    by_id: HashMap<String, usize>,
}

impl FlatVectorStore {
    pub fn new(embedding_model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            embedding_model: embedding_model.into(),
            dimensions,
            updated_at: Utc::now(),
            records: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        if !path.is_file() {
            return Err(IndexError::IndexNotFound(path.display().to_string()));
        }

        let reader = BufReader::new(File::open(path)?);
        let mut store: FlatVectorStore = serde_json::from_reader(reader)?;

        if store.format_version != FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported format version {} in {}",
                store.format_version,
                path.display()
            )));
        }
        if let Some(bad) = store
            .records
            .iter()
            .find(|record| record.embedding.len() != store.dimensions)
        {
            return Err(IndexError::Corrupt(format!(
                "record {} has {} dimensions, index declares {}",
                bad.chunk_id,
                bad.embedding.len(),
                store.dimensions
            )));
        }

        store.rebuild_lookup();
        Ok(store)
    }

    /// Writes to a sibling temp file and renames it over `path`.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn rebuild_lookup(&mut self) {
        self.by_id.clear();
        for (position, record) in self.records.iter().enumerate() {
            self.by_id.entry(record.chunk_id.clone()).or_insert(position);
        }
    }
}

impl VectorStore for FlatVectorStore {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn contains(&self, chunk_id: &str) -> bool {
        self.by_id.contains_key(chunk_id)
    }

    fn insert_new(&mut self, records: Vec<IndexRecord>) -> usize {
        let mut inserted = 0;
        for record in records {
            if self.by_id.contains_key(&record.chunk_id) {
                continue;
            }
            self.by_id.insert(record.chunk_id.clone(), self.records.len());
            self.records.push(record);
            inserted += 1;
        }
        if inserted > 0 {
            self.updated_at = Utc::now();
        }
        inserted
    }

    fn get(&self, chunk_id: &str) -> Option<&IndexRecord> {
        self.by_id
            .get(chunk_id)
            .and_then(|position| self.records.get(*position))
    }

    fn similarity_search(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
        score_floor: f32,
    ) -> Vec<ScoredChunk> {
        let mut scored: Vec<(f32, &IndexRecord)> = self
            .records
            .iter()
            .filter(|record| filter.matches(&record.metadata))
            .map(|record| (cosine_similarity(query_vector, &record.embedding), record))
            .filter(|(score, _)| *score >= score_floor)
            .collect();

        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        scored
            .into_iter()
            .take(k)
            .map(|(score, record)| ScoredChunk {
                chunk_id: record.chunk_id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                score,
            })
            .collect()
    }

    fn records(&self) -> Box<dyn Iterator<Item = &IndexRecord> + '_> {
        Box::new(self.records.iter())
    }
}
