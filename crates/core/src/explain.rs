use crate::chunk_id::UNKNOWN_TITLE;
use crate::extractor::{PageTexts, PdfExtractor};
use crate::llm::{CompletionRequest, LanguageModel};
use crate::models::{ExplainabilityEntry, ScoredChunk, SUBMITTED_ONLINE_PATH};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_SUMMARY_WORKERS: usize = 4;

const SUMMARY_SYSTEM_PROMPT: &str = "You only have knowledge based on the provided text.";

fn summary_prompt(question: &str, page_text: &str) -> String {
    format!(
        "I will provide a single page from a bill and a question a user asked. Using only information from
that page, provide a brief summary of the key points from the page that relate to the question.
Respond in bullet points and provide only the summary, no introduction or context. Try to be concise.
Only use information from the context provided.
Question:
{question}
Context:
{page_text}
Summary:
"
    )
}

/// One page cited by a retrieval result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub path: Option<String>,
    pub title: Option<String>,
    pub page: u32,
}

/// Distinct `(path, title, page)` triples in first-seen order. Chunks without
/// a page number are left out.
pub fn unique_pages(chunks: &[ScoredChunk]) -> Vec<PageRef> {
    let mut pages: Vec<PageRef> = Vec::new();
    for chunk in chunks {
        let Some(page) = chunk.metadata.page else {
            continue;
        };
        let candidate = PageRef {
            path: chunk.metadata.path.clone(),
            title: chunk.metadata.bill.title.clone(),
            page,
        };
        if !pages.contains(&candidate) {
            pages.push(candidate);
        }
    }
    pages
}

/// Summarises each cited page against the question, one model call per page.
pub struct ExplainabilitySummarizer<M, X> {
    model: M,
    extractor: X,
    base_dir: PathBuf,
    workers: usize,
}

impl<M: LanguageModel, X: PdfExtractor> ExplainabilitySummarizer<M, X> {
    pub fn new(model: M, extractor: X) -> Self {
        Self {
            model,
            extractor,
            base_dir: PathBuf::from("."),
            workers: DEFAULT_SUMMARY_WORKERS,
        }
    }

    /// Directory the stored `./...` paths are resolved against.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub async fn summarize(
        &self,
        question: &str,
        chunks: &[ScoredChunk],
    ) -> Vec<ExplainabilityEntry> {
        let pages = unique_pages(chunks);
        if pages.is_empty() {
            return Vec::new();
        }

        let mut sources: HashMap<String, Option<PageTexts>> = HashMap::new();
        for page in &pages {
            if let Some(path) = page.path.as_deref() {
                if !sources.contains_key(path) {
                    let texts = self.read_source(path, original_source(chunks, path));
                    sources.insert(path.to_string(), texts);
                }
            }
        }

        let jobs: Vec<(PageRef, String)> = pages
            .into_iter()
            .map(|page| {
                let from_pdf = page
                    .path
                    .as_deref()
                    .and_then(|path| sources.get(path))
                    .and_then(Option::as_ref)
                    .and_then(|texts| texts.get(page.page.saturating_sub(1) as usize))
                    .map(|text| text.trim())
                    .filter(|text| !text.is_empty())
                    .map(str::to_string);
                let text = from_pdf.unwrap_or_else(|| retrieved_page_text(chunks, &page));
                (page, text)
            })
            .collect();

        debug!(pages = jobs.len(), workers = self.workers, "summarising cited pages");

        stream::iter(jobs)
            .map(|(page, text)| self.summarize_page(question, page, text))
            .buffered(self.workers)
            .collect()
            .await
    }

    /// Page texts of a cited document, read from the ingested location when
    /// it is still there, else from `stored_path` under `base_dir`.
    fn read_source(&self, stored_path: &str, source: Option<&str>) -> Option<PageTexts> {
        if stored_path == SUBMITTED_ONLINE_PATH {
            return None;
        }

        if let Some(source) = source {
            match self.extractor.extract_pages(Path::new(source)) {
                Ok(texts) => return Some(texts),
                Err(error) => debug!(source, %error, "ingested pdf location not readable"),
            }
        }

        let path = resolve(&self.base_dir, stored_path);
        match self.extractor.extract_pages(&path) {
            Ok(texts) => Some(texts),
            Err(error) => {
                warn!(path = %path.display(), %error, "cannot re-read source pdf, using retrieved chunks");
                None
            }
        }
    }

    async fn summarize_page(
        &self,
        question: &str,
        page: PageRef,
        text: String,
    ) -> ExplainabilityEntry {
        let request = CompletionRequest::new(summary_prompt(question, &text))
            .with_system(SUMMARY_SYSTEM_PROMPT);

        let summary_text = match self.model.complete(request).await {
            Ok(summary) => summary.trim().to_string(),
            Err(error) => {
                warn!(page = page.page, path = ?page.path, %error, "page summary failed");
                String::new()
            }
        };

        ExplainabilityEntry {
            document_title: page.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            page: page.page,
            summary_text,
            source_path: page.path.unwrap_or_default(),
        }
    }
}

fn resolve(base_dir: &Path, stored_path: &str) -> PathBuf {
    let relative = stored_path.strip_prefix("./").unwrap_or(stored_path);
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

fn original_source<'a>(chunks: &'a [ScoredChunk], stored_path: &str) -> Option<&'a str> {
    chunks
        .iter()
        .filter(|chunk| chunk.metadata.path.as_deref() == Some(stored_path))
        .find_map(|chunk| chunk.metadata.source.as_deref())
}

fn retrieved_page_text(chunks: &[ScoredChunk], page: &PageRef) -> String {
    chunks
        .iter()
        .filter(|chunk| {
            chunk.metadata.page == Some(page.page)
                && chunk.metadata.path == page.path
                && chunk.metadata.bill.title == page.title
        })
        .map(|chunk| chunk.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}
