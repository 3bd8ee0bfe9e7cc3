use crate::chunking::{chunk_pages, ChunkingConfig, Provenance};
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::extractor::{PageTexts, PdfExtractor};
use crate::index::{AddOutcome, VectorIndexManager};
use crate::llm::LanguageModel;
use crate::metadata::MetadataExtractor;
use crate::models::{BillMetadata, BillRecord, IngestionOptions, UploadForm, SUBMITTED_ONLINE_PATH};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Bills for one state live under `<pdf_root>/<State>`.
pub fn state_folder(pdf_root: &Path, state: &str) -> PathBuf {
    pdf_root.join(state.trim())
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    Ok(digest_bytes(&bytes))
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    /// One record per document path; a later run over the same path replaces
    /// the earlier record.
    pub records: Vec<BillRecord>,
    pub skipped_files: Vec<SkippedPdf>,
    pub chunks_added: usize,
    pub chunks_skipped: usize,
}

impl IngestionReport {
    fn push_record(&mut self, record: BillRecord) {
        match self
            .records
            .iter_mut()
            .find(|existing| existing.path == record.path)
        {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    fn count(&mut self, outcome: AddOutcome) {
        match outcome {
            AddOutcome::Created { added } => self.chunks_added += added,
            AddOutcome::Appended { added, skipped } => {
                self.chunks_added += added;
                self.chunks_skipped += skipped;
            }
            AddOutcome::Unchanged { skipped } => self.chunks_skipped += skipped,
        }
    }
}

#[derive(Debug)]
pub struct UploadReport {
    pub record: BillRecord,
    pub outcome: AddOutcome,
}

/// Extract, classify, chunk and index bills.
pub struct BillIngestor<X, M> {
    extractor: X,
    classifier: MetadataExtractor<M>,
    chunking: ChunkingConfig,
}

impl<X: PdfExtractor, M: LanguageModel> BillIngestor<X, M> {
    pub fn new(extractor: X, model: M, options: IngestionOptions) -> Result<Self, IngestError> {
        let chunking = ChunkingConfig::from(options);
        chunking.validate()?;
        Ok(Self {
            extractor,
            classifier: MetadataExtractor::new(model),
            chunking,
        })
    }

    /// Ingests every PDF under `folder`, recursively.
    pub async fn ingest_folder<E: Embedder>(
        &self,
        folder: &Path,
        index: &mut VectorIndexManager<E>,
    ) -> Result<IngestionReport, IngestError> {
        let files = discover_pdf_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }
        self.ingest_paths(&files, index).await
    }

    /// Unreadable or textless documents are skipped whole; index failures
    /// abort the run.
    #[instrument(skip_all, fields(documents = paths.len()))]
    pub async fn ingest_paths<E: Embedder>(
        &self,
        paths: &[PathBuf],
        index: &mut VectorIndexManager<E>,
    ) -> Result<IngestionReport, IngestError> {
        let mut report = IngestionReport::default();

        for path in paths {
            let pages = match self.read_pages(path) {
                Ok(pages) => pages,
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping pdf");
                    report.skipped_files.push(SkippedPdf {
                        path: path.clone(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };

            let bill = self.classify(&pages).await;
            let provenance = Provenance::from_pdf_path(&path.to_string_lossy());
            let outcome = self.index_pages(&pages, &provenance, &bill, index).await?;
            report.count(outcome);

            let checksum = match digest_file(path) {
                Ok(checksum) => Some(checksum),
                Err(error) => {
                    warn!(path = %path.display(), %error, "could not checksum pdf");
                    None
                }
            };
            info!(
                path = %provenance.path,
                title = bill.title.as_deref().unwrap_or_default(),
                added = outcome.added(),
                "bill ingested"
            );
            report.push_record(BillRecord {
                metadata: bill,
                path: provenance.path,
                filename: provenance.filename,
                checksum,
                ingested_at: Utc::now(),
            });
        }

        Ok(report)
    }

    /// Ingests a PDF received as bytes. The form's jurisdiction fields
    /// override the model's classification.
    #[instrument(skip_all, fields(filename = filename))]
    pub async fn ingest_upload<E: Embedder>(
        &self,
        filename: &str,
        bytes: &[u8],
        form: &UploadForm,
        index: &mut VectorIndexManager<E>,
    ) -> Result<UploadReport, IngestError> {
        let pages = self.extractor.extract_pages_from_bytes(bytes)?;
        if pages.iter().all(|page| page.trim().is_empty()) {
            return Err(IngestError::InvalidArgument(format!(
                "no text could be extracted from {filename}"
            )));
        }

        let mut bill = self.classify(&pages).await;
        bill.override_with(form);

        let provenance = Provenance::submitted_online(filename);
        let outcome = self.index_pages(&pages, &provenance, &bill, index).await?;
        info!(added = outcome.added(), "uploaded bill ingested");

        Ok(UploadReport {
            record: BillRecord {
                metadata: bill,
                path: SUBMITTED_ONLINE_PATH.to_string(),
                filename: provenance.filename,
                checksum: Some(digest_bytes(bytes)),
                ingested_at: Utc::now(),
            },
            outcome,
        })
    }

    fn read_pages(&self, path: &Path) -> Result<PageTexts, IngestError> {
        let pages = self.extractor.extract_pages(path)?;
        if pages.iter().all(|page| page.trim().is_empty()) {
            return Err(IngestError::InvalidArgument(format!(
                "no text extracted from {}",
                path.display()
            )));
        }
        Ok(pages)
    }

    async fn classify(&self, pages: &[String]) -> BillMetadata {
        self.classifier.extract(&pages.join("\n")).await
    }

    async fn index_pages<E: Embedder>(
        &self,
        pages: &[String],
        provenance: &Provenance,
        bill: &BillMetadata,
        index: &mut VectorIndexManager<E>,
    ) -> Result<AddOutcome, IngestError> {
        let (texts, mut metadatas) = chunk_pages(pages, provenance, self.chunking)?;
        for metadata in &mut metadatas {
            metadata.merge_bill(bill);
        }
        Ok(index.add(texts, metadatas).await?)
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Saves an uploaded PDF under `<pdf_root>/<State or Type>/<Title>.pdf` so it
/// can be re-ingested from disk later.
pub fn archive_upload(
    pdf_root: &Path,
    bill: &BillMetadata,
    filename: &str,
    bytes: &[u8],
) -> Result<PathBuf, IngestError> {
    let folder = match (bill.jurisdiction, bill.state.as_deref()) {
        (Some(kind), Some(state)) if kind.is_state_level() => state.to_string(),
        (Some(kind), _) => kind.label().to_string(),
        (None, _) => "Uncategorized".to_string(),
    };
    let folder = sanitize_file_name(&folder);

    let mut name = sanitize_file_name(bill.title.as_deref().unwrap_or(filename));
    if name.is_empty() {
        return Err(IngestError::MissingFileName(filename.to_string()));
    }
    if !name.to_lowercase().ends_with(".pdf") {
        name.push_str(".pdf");
    }

    let dest_dir = pdf_root.join(folder);
    fs::create_dir_all(&dest_dir)?;
    let dest = dest_dir.join(name);
    fs::write(&dest, bytes)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::extractor::test_pdf::{pdf_bytes, write_pdf};
    use crate::extractor::LopdfExtractor;
    use crate::index::IndexConfig;
    use crate::llm::testing::ScriptedModel;
    use crate::models::JurisdictionType;
    use crate::traits::VectorStore;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    const TEXAS_REPLY: &str = r#"{"Title": "Texas: Act", "Date": "09012025",
        "Type": "State level sectoral", "Sector": "Children's Data Protection",
        "State": "Texas", "Topics": ["minors"]}"#;

    fn index_in(dir: &Path) -> VectorIndexManager<CharacterNgramEmbedder> {
        VectorIndexManager::create_or_load(
            IndexConfig::in_folder(dir.join("index")),
            CharacterNgramEmbedder::default(),
        )
    }

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        fs::write(base.join("notes.txt"), b"not a pdf")?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        assert_eq!(digest_file(&file_path)?, digest_file(&file_path)?);
        assert_eq!(digest_file(&file_path)?, digest_bytes(b"abc"));
        Ok(())
    }

    #[test]
    fn state_folder_is_under_pdf_root() {
        assert_eq!(
            state_folder(Path::new("pdfs"), " Texas "),
            PathBuf::from("pdfs/Texas")
        );
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let options = IngestionOptions {
            chunk_size: 100,
            chunk_overlap: 100,
        };
        let result = BillIngestor::new(LopdfExtractor, ScriptedModel::default(), options);
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }

    #[tokio::test]
    async fn two_page_bill_is_indexed_once() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf_dir = dir.path().join("pdfs").join("Texas");
        fs::create_dir_all(&pdf_dir)?;
        let pdf = pdf_dir.join("hb18.pdf");
        write_pdf(&pdf, &[Some("Definitions of minor"), Some("Parental consent duties")]);

        let model = ScriptedModel::new(&[TEXAS_REPLY, TEXAS_REPLY]);
        let ingestor = BillIngestor::new(LopdfExtractor, &model, IngestionOptions::default())?;
        let mut index = index_in(dir.path());

        let first = ingestor.ingest_paths(&[pdf.clone()], &mut index).await?;
        let second = ingestor.ingest_paths(&[pdf], &mut index).await?;

        assert_eq!(first.chunks_added, 2);
        assert_eq!(second.chunks_added, 0);
        assert_eq!(second.chunks_skipped, 2);
        assert_eq!(index.len(), 2);
        assert!(index.lookup_text("Texas:_Act_Page_1_ChunkNo_0").is_some());
        assert!(index.lookup_text("Texas:_Act_Page_2_ChunkNo_0").is_some());

        let record = &first.records[0];
        assert_eq!(record.path, "./pdfs/Texas/hb18.pdf");
        assert_eq!(record.filename, "hb18.pdf");
        assert_eq!(record.metadata.state.as_deref(), Some("Texas"));
        assert!(record.checksum.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_and_blank_pdfs_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let good = dir.path().join("good.pdf");
        let blank = dir.path().join("blank.pdf");
        let broken = dir.path().join("broken.pdf");
        write_pdf(&good, &[Some("Section 1. Short title.")]);
        write_pdf(&blank, &[None, None]);
        fs::write(&broken, b"%PDF-1.4\n%broken")?;
        let missing = dir.path().join("missing.pdf");

        let model = ScriptedModel::new(&[TEXAS_REPLY]);
        let ingestor = BillIngestor::new(LopdfExtractor, &model, IngestionOptions::default())?;
        let mut index = index_in(dir.path());

        let report = ingestor
            .ingest_paths(&[missing, blank, broken, good], &mut index)
            .await?;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.skipped_files.len(), 3);
        assert_eq!(report.chunks_added, 1);
        assert_eq!(model.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_path_keeps_one_record() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf = dir.path().join("a.pdf");
        write_pdf(&pdf, &[Some("Section 1.")]);

        let model = ScriptedModel::new(&[TEXAS_REPLY, r#"{"Title": "Texas: Renamed"}"#]);
        let ingestor = BillIngestor::new(LopdfExtractor, &model, IngestionOptions::default())?;
        let mut index = index_in(dir.path());

        let report = ingestor
            .ingest_paths(&[pdf.clone(), pdf], &mut index)
            .await?;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].metadata.title.as_deref(), Some("Texas: Renamed"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_folder_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let ingestor = BillIngestor::new(
            LopdfExtractor,
            ScriptedModel::default(),
            IngestionOptions::default(),
        )?;
        let mut index = index_in(dir.path());

        let result = ingestor.ingest_folder(dir.path(), &mut index).await;
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn upload_is_marked_submitted_online() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let bytes = pdf_bytes(&[Some("Section 1. Health data.")]);
        let model = ScriptedModel::new(&[TEXAS_REPLY]);
        let ingestor = BillIngestor::new(LopdfExtractor, &model, IngestionOptions::default())?;
        let mut index = index_in(dir.path());
        let form = UploadForm {
            jurisdiction: JurisdictionType::StateSectoral,
            state: Some("Ohio".to_string()),
            sector: Some("Health".to_string()),
        };

        let report = ingestor
            .ingest_upload("upload.pdf", &bytes, &form, &mut index)
            .await?;

        assert_eq!(report.outcome, AddOutcome::Created { added: 1 });
        assert_eq!(report.record.path, SUBMITTED_ONLINE_PATH);
        assert_eq!(report.record.metadata.state.as_deref(), Some("Ohio"));
        assert_eq!(report.record.metadata.sector.as_deref(), Some("Health"));

        let stored = index
            .store()
            .and_then(|store| store.records().next().cloned())
            .ok_or("no chunk stored")?;
        assert_eq!(stored.metadata.path.as_deref(), Some(SUBMITTED_ONLINE_PATH));
        assert_eq!(stored.metadata.source, None);
        assert_eq!(stored.metadata.filename.as_deref(), Some("upload.pdf"));
        Ok(())
    }

    #[tokio::test]
    async fn textless_upload_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let bytes = pdf_bytes(&[None]);
        let model = ScriptedModel::default();
        let ingestor = BillIngestor::new(LopdfExtractor, &model, IngestionOptions::default())?;
        let mut index = index_in(dir.path());
        let form = UploadForm {
            jurisdiction: JurisdictionType::Federal,
            state: None,
            sector: None,
        };

        let result = ingestor
            .ingest_upload("empty.pdf", &bytes, &form, &mut index)
            .await;

        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        assert_eq!(model.calls(), 0);
        Ok(())
    }

    #[test]
    fn archived_upload_lands_in_state_folder() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let bill = BillMetadata {
            title: Some("Ohio: Health data / privacy".to_string()),
            jurisdiction: Some(JurisdictionType::StateSectoral),
            state: Some("Ohio".to_string()),
            ..BillMetadata::default()
        };

        let dest = archive_upload(dir.path(), &bill, "upload.pdf", b"%PDF")?;

        assert_eq!(dest, dir.path().join("Ohio").join("Ohio Health data  privacy.pdf"));
        assert_eq!(fs::read(&dest)?, b"%PDF");
        Ok(())
    }
}
