use crate::error::IngestError;
use lopdf::Document;
use std::path::Path;
use tracing::debug;

/// Page-indexed plain text: element `i` holds page `i + 1`.
///
/// Pages without extractable text are kept as empty strings so that page
/// numbers stay positional.
pub type PageTexts = Vec<String>;

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<PageTexts, IngestError>;

    fn extract_pages_from_bytes(&self, bytes: &[u8]) -> Result<PageTexts, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<PageTexts, IngestError> {
        if !path.is_file() {
            return Err(IngestError::NotFound(path.display().to_string()));
        }

        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        Ok(page_texts(&document))
    }

    fn extract_pages_from_bytes(&self, bytes: &[u8]) -> Result<PageTexts, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        Ok(page_texts(&document))
    }
}

fn page_texts(document: &Document) -> PageTexts {
    document
        .get_pages()
        .into_keys()
        .map(|page_no| match document.extract_text(&[page_no]) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => String::new(),
            Err(error) => {
                debug!(page = page_no, %error, "page has no extractable text");
                String::new()
            }
        })
        .collect()
}

pub fn extract_page_texts(path: &Path) -> Result<PageTexts, IngestError> {
    LopdfExtractor.extract_pages(path)
}
