use crate::error::IngestError;
use crate::models::{ChunkMetadata, IngestionOptions, SUBMITTED_ONLINE_PATH};

/// Separators tried in order: paragraph, line, word, then single characters.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        IngestionOptions::default().into()
    }
}

impl From<IngestionOptions> for ChunkingConfig {
    fn from(value: IngestionOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            chunk_overlap: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Where a run of chunks came from; copied onto every chunk stub.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub source: Option<String>,
    pub filename: String,
    pub path: String,
}

impl Provenance {
    pub fn from_pdf_path(pdf_path: &str) -> Self {
        let parts = path_parts(pdf_path);
        let filename = parts.last().copied().unwrap_or(pdf_path).to_string();
        let tail = parts[parts.len().saturating_sub(3)..].join("/");

        Self {
            source: Some(pdf_path.to_string()),
            filename,
            path: format!("./{tail}"),
        }
    }

    pub fn submitted_online(filename: &str) -> Self {
        Self {
            source: None,
            filename: filename.to_string(),
            path: SUBMITTED_ONLINE_PATH.to_string(),
        }
    }
}

fn path_parts(pdf_path: &str) -> Vec<&str> {
    pdf_path
        .split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits `text` into windows of at most `chunk_size` characters, preferring
/// paragraph, then line, then word boundaries, with up to `chunk_overlap`
/// characters carried over between neighbouring windows.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    split_recursive(text, &SEPARATORS, config)
}

fn split_recursive(text: &str, separators: &[&str], config: ChunkingConfig) -> Vec<String> {
    let mut separator = "";
    let mut finer: &[&str] = &[];
    for (position, candidate) in separators.iter().enumerate() {
        if candidate.is_empty() || text.contains(candidate) {
            separator = candidate;
            finer = &separators[position + 1..];
            break;
        }
    }

    let mut chunks = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    for piece in split_keeping_separator(text, separator) {
        if char_len(piece) < config.chunk_size {
            pending.push(piece);
            continue;
        }

        if !pending.is_empty() {
            chunks.extend(merge_pieces(&pending, config));
            pending.clear();
        }

        if finer.is_empty() {
            chunks.push(piece.to_string());
        } else {
            chunks.extend(split_recursive(piece, finer, config));
        }
    }

    if !pending.is_empty() {
        chunks.extend(merge_pieces(&pending, config));
    }

    chunks
}

/// Splits on `separator`, attaching each separator to the piece that follows it.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(index, ch)| &text[index..index + ch.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (index, _) in text.match_indices(separator) {
        if index > start {
            pieces.push(&text[start..index]);
        }
        start = index;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Greedily packs pieces into windows, then drops leading pieces until at
/// most `chunk_overlap` characters remain to seed the next window.
fn merge_pieces(pieces: &[&str], config: ChunkingConfig) -> Vec<String> {
    let mut merged = Vec::new();
    let mut window: Vec<(&str, usize)> = Vec::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(piece);

        if total + len > config.chunk_size && !window.is_empty() {
            push_joined(&mut merged, &window);
            while total > config.chunk_overlap
                || (total + len > config.chunk_size && total > 0)
            {
                let (_, dropped) = window.remove(0);
                total -= dropped;
            }
        }

        window.push((piece, len));
        total += len;
    }

    push_joined(&mut merged, &window);
    merged
}

fn push_joined(out: &mut Vec<String>, window: &[(&str, usize)]) {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

/// Chunks every non-blank page and returns parallel chunk texts and metadata
/// stubs. Page numbers are 1-based positions in `pages`, so blank pages
/// contribute nothing but still occupy their page number.
pub fn chunk_pages(
    pages: &[String],
    provenance: &Provenance,
    config: ChunkingConfig,
) -> Result<(Vec<String>, Vec<ChunkMetadata>), IngestError> {
    config.validate()?;

    let mut texts = Vec::new();
    let mut metadatas = Vec::new();

    for (index, page_text) in pages.iter().enumerate() {
        if page_text.trim().is_empty() {
            continue;
        }

        let page = (index + 1) as u32;
        for chunk in split_text(page_text, config) {
            texts.push(chunk);
            metadatas.push(ChunkMetadata {
                source: provenance.source.clone(),
                page: Some(page),
                filename: Some(provenance.filename.clone()),
                path: Some(provenance.path.clone()),
                ..ChunkMetadata::default()
            });
        }
    }

    Ok((texts, metadatas))
}

pub fn chunk_pdf_pages(
    pages: &[String],
    pdf_path: &str,
    config: ChunkingConfig,
) -> Result<(Vec<String>, Vec<ChunkMetadata>), IngestError> {
    chunk_pages(pages, &Provenance::from_pdf_path(pdf_path), config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_bill_text() -> String {
        let sentence = "A covered entity shall not sell the personal data of a known child \
                        without verifiable parental consent.";
        let paragraph = vec![sentence; 6].join(" ");
        vec![paragraph; 5].join("\n\n")
    }

    #[test]
    fn chunks_never_exceed_chunk_size() {
        let config = ChunkingConfig::default();
        let chunks = split_text(&long_bill_text(), config);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= config.chunk_size);
        }
    }

    #[test]
    fn unbroken_text_falls_back_to_character_windows() {
        let config = ChunkingConfig {
            chunk_size: 10,
            chunk_overlap: 3,
        };
        let chunks = split_text(&"x".repeat(25), config);

        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn neighbouring_windows_overlap() {
        let config = ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 15,
        };
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let chunks = split_text(text, config);

        assert_eq!(chunks.len(), 2);
        let carried = chunks[1].split_whitespace().next().unwrap_or_default();
        assert_eq!(carried, "zeta");
        assert!(chunks[0].split_whitespace().any(|word| word == carried));
    }

    #[test]
    fn paragraphs_are_not_split_when_they_fit() {
        let config = ChunkingConfig {
            chunk_size: 30,
            chunk_overlap: 5,
        };
        let chunks = split_text("Section one applies.\n\nSection two applies.", config);

        assert_eq!(chunks, vec!["Section one applies.", "Section two applies."]);
    }

    #[test]
    fn two_short_pages_give_one_chunk_each() -> Result<(), IngestError> {
        let pages = vec![
            "This is the first page in the project TPLC".to_string(),
            "Second page in the project TPLC".to_string(),
        ];

        let (texts, metadatas) =
            chunk_pdf_pages(&pages, "pdfs/Texas/tplc.pdf", ChunkingConfig::default())?;

        assert_eq!(texts, pages);
        assert_eq!(metadatas[0].page, Some(1));
        assert_eq!(metadatas[1].page, Some(2));
        assert!(texts.iter().all(|text| text.chars().count() <= 800));
        Ok(())
    }

    #[test]
    fn blank_pages_are_skipped_but_keep_numbering() -> Result<(), IngestError> {
        let pages = vec![String::new(), "real text".to_string(), "  \n ".to_string()];

        let (texts, metadatas) =
            chunk_pdf_pages(&pages, "pdfs/Texas/a.pdf", ChunkingConfig::default())?;

        assert_eq!(texts, vec!["real text"]);
        assert!(metadatas.iter().all(|meta| meta.page == Some(2)));
        Ok(())
    }

    #[test]
    fn max_page_matches_page_count() -> Result<(), IngestError> {
        let pages = vec![long_bill_text(), "short".to_string(), long_bill_text()];

        let (texts, metadatas) =
            chunk_pdf_pages(&pages, "/data/pdfs/Ohio/sb.pdf", ChunkingConfig::default())?;

        assert_eq!(texts.len(), metadatas.len());
        let max_page = metadatas.iter().filter_map(|meta| meta.page).max();
        assert_eq!(max_page, Some(pages.len() as u32));
        Ok(())
    }

    #[test]
    fn stubs_carry_source_filename_and_short_path() -> Result<(), IngestError> {
        let pages = vec!["text".to_string()];

        let (_, metadatas) = chunk_pdf_pages(
            &pages,
            "/srv/data/pdfs/Texas/HB 186.pdf",
            ChunkingConfig::default(),
        )?;

        let stub = &metadatas[0];
        assert_eq!(stub.source.as_deref(), Some("/srv/data/pdfs/Texas/HB 186.pdf"));
        assert_eq!(stub.filename.as_deref(), Some("HB 186.pdf"));
        assert_eq!(stub.path.as_deref(), Some("./pdfs/Texas/HB 186.pdf"));
        assert_eq!(stub.chunk_id, None);
        Ok(())
    }

    #[test]
    fn uploads_use_submitted_online_path() -> Result<(), IngestError> {
        let pages = vec!["uploaded text".to_string()];

        let (_, metadatas) = chunk_pages(
            &pages,
            &Provenance::submitted_online("bill.pdf"),
            ChunkingConfig::default(),
        )?;

        assert_eq!(metadatas[0].path.as_deref(), Some(SUBMITTED_ONLINE_PATH));
        assert_eq!(metadatas[0].source, None);
        Ok(())
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let config = ChunkingConfig {
            chunk_size: 100,
            chunk_overlap: 100,
        };
        let result = chunk_pages(&["x".to_string()], &Provenance::submitted_online("a"), config);
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }
}
