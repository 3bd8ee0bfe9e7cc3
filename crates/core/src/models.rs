use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, NoneAsEmptyString};
use std::collections::BTreeMap;

/// `Path` recorded for chunks of documents uploaded through a form rather than
/// read from the bill folders.
pub const SUBMITTED_ONLINE_PATH: &str = "Submitted-Online";

pub const MAX_TOPICS: usize = 6;

pub const SECTORS: [&str; 10] = [
    "Health",
    "Education",
    "Finance",
    "Telecommunications & Technology",
    "Government & Public Sector",
    "Retail & E-Commerce",
    "Employment & HR",
    "Media & Advertising",
    "Critical Infrastructure (Energy, Transportation, etc.)",
    "Children’s Data Protection",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JurisdictionType {
    #[serde(rename = "State level sectoral")]
    StateSectoral,
    #[serde(rename = "Comprehensive State level")]
    StateComprehensive,
    #[serde(rename = "Federal level")]
    Federal,
    #[serde(rename = "GDPR")]
    Gdpr,
}

impl JurisdictionType {
    pub const ALL: [JurisdictionType; 4] = [
        JurisdictionType::StateSectoral,
        JurisdictionType::StateComprehensive,
        JurisdictionType::Federal,
        JurisdictionType::Gdpr,
    ];

    /// Label used in prompts, persisted metadata and equality filters.
    pub fn label(self) -> &'static str {
        match self {
            JurisdictionType::StateSectoral => "State level sectoral",
            JurisdictionType::StateComprehensive => "Comprehensive State level",
            JurisdictionType::Federal => "Federal level",
            JurisdictionType::Gdpr => "GDPR",
        }
    }

    /// Lenient parse of the labels models and users actually produce
    /// ("State-level sectoral", "state_sectoral", "Federal", ...).
    pub fn parse_label(raw: &str) -> Option<Self> {
        let folded = raw
            .trim()
            .to_lowercase()
            .replace(['-', '_'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        if folded.is_empty() {
            return None;
        }
        if folded.contains("gdpr") || folded.contains("eu ") || folded == "eu" {
            return Some(JurisdictionType::Gdpr);
        }
        if folded.contains("federal") {
            return Some(JurisdictionType::Federal);
        }
        if folded.contains("comprehensive") {
            return Some(JurisdictionType::StateComprehensive);
        }
        if folded.contains("sectoral") {
            return Some(JurisdictionType::StateSectoral);
        }
        None
    }

    pub fn is_state_level(self) -> bool {
        matches!(
            self,
            JurisdictionType::StateSectoral | JurisdictionType::StateComprehensive
        )
    }
}

impl std::fmt::Display for JurisdictionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps a free-form sector name onto one of [`SECTORS`].
pub fn canonical_sector(raw: &str) -> Option<&'static str> {
    let wanted = raw.trim().replace('\'', "’").to_lowercase();
    if wanted.is_empty() || wanted == "null" {
        return None;
    }
    SECTORS
        .iter()
        .copied()
        .find(|sector| sector.to_lowercase() == wanted)
}

/// Document-level classification produced by the metadata extractor.
///
/// Every field is optional: a failed classification yields the empty record
/// and downstream consumers must cope with blanks.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BillMetadata {
    #[serde(rename = "Title", default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(rename = "Date", default)]
    pub date: Option<String>,
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<JurisdictionType>,
    #[serde(rename = "Sector", default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(rename = "State", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "Topics", default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

impl BillMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.date.is_none()
            && self.jurisdiction.is_none()
            && self.sector.is_none()
            && self.state.is_none()
            && self.topics.is_empty()
    }

    /// Applies values a user entered on the upload form on top of the
    /// model's classification.
    pub fn override_with(&mut self, form: &UploadForm) {
        self.jurisdiction = Some(form.jurisdiction);
        if let Some(state) = form.state.as_ref().filter(|state| !state.trim().is_empty()) {
            self.state = Some(state.trim().to_string());
        }
        if let Some(sector) = form.sector.as_deref().and_then(canonical_sector) {
            self.sector = Some(sector.to_string());
        }
        if !form.jurisdiction.is_state_level() {
            self.state = None;
        }
        if form.jurisdiction != JurisdictionType::StateSectoral {
            self.sector = None;
        }
    }
}

/// Jurisdiction details entered alongside an uploaded PDF.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadForm {
    pub jurisdiction: JurisdictionType,
    pub state: Option<String>,
    pub sector: Option<String>,
}

/// Per-chunk metadata: provenance stub from the chunker, merged document
/// metadata, and the chunk id assigned before indexing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    #[serde(rename = "Source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "Page", default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(rename = "Filename", default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(rename = "Path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub bill: BillMetadata,
    #[serde(rename = "Chunk_id", default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(rename = "SeqInPage", default, skip_serializing_if = "Option::is_none")]
    pub seq_in_page: Option<u32>,
}

impl ChunkMetadata {
    pub fn merge_bill(&mut self, bill: &BillMetadata) {
        self.bill = bill.clone();
    }

    /// Looks up a metadata value by its persisted key, for equality filters.
    pub fn field(&self, key: &str) -> Option<String> {
        let key = key.trim();
        let is = |name: &str| key.eq_ignore_ascii_case(name);

        if is("Title") {
            self.bill.title.clone()
        } else if is("Date") {
            self.bill.date.clone()
        } else if is("Type") {
            self.bill.jurisdiction.map(|kind| kind.label().to_string())
        } else if is("Sector") {
            self.bill.sector.clone()
        } else if is("State") {
            self.bill.state.clone()
        } else if is("Source") {
            self.source.clone()
        } else if is("Page") {
            self.page.map(|page| page.to_string())
        } else if is("Filename") {
            self.filename.clone()
        } else if is("Path") {
            self.path.clone()
        } else if is("Chunk_id") {
            self.chunk_id.clone()
        } else {
            None
        }
    }
}

/// Equality filter over chunk metadata, e.g. `State = "Texas"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MetadataFilter(BTreeMap<String, String>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(name: impl Into<String>) -> Self {
        Self::new().with("State", name)
    }

    pub fn jurisdiction(kind: JurisdictionType) -> Self {
        Self::new().with("Type", kind.label())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.0
            .iter()
            .all(|(key, wanted)| metadata.field(key).as_deref() == Some(wanted.as_str()))
    }
}

/// One ingested document, as handed to the flat-file ledger. Keyed by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillRecord {
    #[serde(flatten)]
    pub metadata: BillMetadata,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Filename")]
    pub filename: String,
    pub checksum: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

/// One retrieved chunk with its relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Distinct document present in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedDocument {
    pub title: Option<String>,
    pub jurisdiction: Option<JurisdictionType>,
    pub state: Option<String>,
    pub topics: Vec<String>,
    pub path: Option<String>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 200,
        }
    }
}

pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_SCORE_FLOOR: f32 = 0.2;

/// One user question against one jurisdiction filter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub question: String,
    pub filter: MetadataFilter,
    pub k: usize,
    pub score_floor: f32,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>, filter: MetadataFilter) -> Self {
        Self {
            question: question.into(),
            filter,
            k: DEFAULT_TOP_K,
            score_floor: DEFAULT_SCORE_FLOOR,
        }
    }

    pub fn cache_key(&self) -> (String, MetadataFilter) {
        (self.question.trim().to_string(), self.filter.clone())
    }
}

/// How a question was resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NoResults,
    DatabaseAnswer,
    NoDatabaseInfo,
    Ungrounded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExplainabilityEntry {
    #[serde(rename = "Document")]
    pub document_title: String,
    #[serde(rename = "Page")]
    pub page: u32,
    #[serde(rename = "Relevant Information")]
    pub summary_text: String,
    #[serde(rename = "File Path")]
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question: String,
    pub filter: MetadataFilter,
    pub draft_answer: Option<String>,
    pub verified_answer: String,
    pub outcome: Outcome,
    pub retrieved: Vec<ScoredChunk>,
    pub explanations: Vec<ExplainabilityEntry>,
}
