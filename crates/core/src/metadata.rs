use crate::llm::{CompletionRequest, LanguageModel};
use crate::models::{canonical_sector, BillMetadata, JurisdictionType, MAX_TOPICS, SECTORS};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

fn classification_prompt(bill_text: &str) -> String {
    let sectors = SECTORS
        .iter()
        .map(|sector| format!("\"{sector}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are given the text of a legal document from a PDF file.
Extract the following details:
1. Type of the bill (choose from: "State level sectoral", "Federal level", "Comprehensive State level", "GDPR").
Choose Comprehensive State level if it is a state legislation related to more than one sector.
2. If the bill is "State level sectoral", specify the sector (choose from: {sectors}). Otherwise, set it to null.
3. The latest date mentioned in the bill in MMDDYYYY format.
4. For state-level laws ("State level sectoral" or "Comprehensive State level"), which state is it
associated with (e.g., "Texas", "California"). Otherwise, set it to null.
5. The title of the bill in 15 words or less. Use the State name as the first word if it is a
State level sectoral or Comprehensive State level bill, otherwise write Federal as the first word.
Then put a colon ":" and write the title of the bill after that.
6. A list of no more than six topics that the bill is related to.

Return the information as a JSON object EXACTLY in the following format:
{{"Title": "", "Date": "", "Type": "", "Sector": "", "State": "", "Topics": []}}

Bill text:
{bill_text}
"#
    )
}

/// Classifies a whole bill with one model call.
pub struct MetadataExtractor<M> {
    model: M,
}

impl<M: LanguageModel> MetadataExtractor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    /// Never fails: transport errors and unparsable replies are logged and
    /// produce the empty record.
    pub async fn extract(&self, bill_text: &str) -> BillMetadata {
        let request = CompletionRequest::new(classification_prompt(bill_text));
        match self.model.complete(request).await {
            Ok(reply) => parse_bill_info(&reply),
            Err(error) => {
                warn!(%error, "bill classification call failed");
                BillMetadata::default()
            }
        }
    }
}

fn fence_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)^\s*```(?:json|JSON)?\s*(.*?)\s*```\s*$").ok())
        .as_ref()
}

/// Removes an optional Markdown code fence around a model reply.
pub fn strip_code_fence(reply: &str) -> &str {
    fence_pattern()
        .and_then(|pattern| pattern.captures(reply))
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str())
        .unwrap_or_else(|| reply.trim())
}

pub fn parse_bill_info(reply: &str) -> BillMetadata {
    let body = strip_code_fence(reply);
    let object = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(object)) => object,
        Ok(other) => {
            warn!(kind = json_kind(&other), "bill classification reply is not a JSON object");
            return BillMetadata::default();
        }
        Err(error) => {
            warn!(%error, "could not parse bill classification reply");
            return BillMetadata::default();
        }
    };

    let jurisdiction = text_field(&object, "Type").and_then(|raw| {
        let parsed = JurisdictionType::parse_label(&raw);
        if parsed.is_none() {
            debug!(value = %raw, "unrecognised bill type");
        }
        parsed
    });

    let sector = match jurisdiction {
        Some(JurisdictionType::StateSectoral) => text_field(&object, "Sector")
            .and_then(|raw| canonical_sector(&raw))
            .map(str::to_string),
        _ => None,
    };

    let state = match jurisdiction {
        Some(kind) if !kind.is_state_level() => None,
        _ => text_field(&object, "State"),
    };

    BillMetadata {
        title: text_field(&object, "Title"),
        date: text_field(&object, "Date").and_then(normalize_date),
        jurisdiction,
        sector,
        state,
        topics: topics_field(&object),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match object.get(key)? {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    if text.is_empty() || text.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(text)
    }
}

/// Keeps dates that reduce to exactly eight digits (`MMDDYYYY`).
fn normalize_date(raw: String) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 8 {
        Some(digits)
    } else {
        debug!(value = %raw, "discarding date not in MMDDYYYY form");
        None
    }
}

fn topics_field(object: &Map<String, Value>) -> Vec<String> {
    let topics: Vec<String> = match object.get("Topics") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|topic| topic.trim().to_string())
            .collect(),
        Some(Value::String(joined)) => joined
            .split([',', ';'])
            .map(|topic| topic.trim().to_string())
            .collect(),
        _ => Vec::new(),
    };

    topics
        .into_iter()
        .filter(|topic| !topic.is_empty())
        .take(MAX_TOPICS)
        .collect()
}
