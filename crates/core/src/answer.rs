//! Two-stage answering: a draft grounded in the retrieved chunks, then a
//! verification pass that restructures the draft and classifies it.
//!
//! The verified text always carries exactly one of three sentinels, and the
//! [`Outcome`] is derived from that text alone.

use crate::error::LlmError;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::metadata::strip_code_fence;
use crate::models::{Outcome, ScoredChunk};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const NO_RESULTS_NOTICE: &str =
    "No relevant documents found for the selected state based on your query.";

pub const DATABASE_PREFIX: &str = "According to my database of information, ";

pub const TRAINING_DATA_LEAD: &str =
    "According to my training data, the answer to your question is...";

pub const DATABASE_ANSWER_HEADER: &str = "The document database has an answer to your question. \
Here is the structured response based on TPLC's database";

pub const NO_DATABASE_INFO: &str =
    "Sorry, the database does not have specific information about your question";

pub const UNGROUNDED_APOLOGY: &str = "Sorry, the LLM cannot currently generate a good enough \
response for this question. Please refer to the side table and see if there is anything from \
those topics that you would like to know about.";

const DRAFT_SYSTEM_PROMPT: &str = "You are a helpful assistant that MUST write an introduction, \
bullet points for the main body of the response, and a conclusion";

const VERIFY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that MUST write an introduction, bullet points, and a conclusion";

// Lowercased, whitespace-collapsed fragments used to spot sentinels in free text.
const UNGROUNDED_MARKER: &str = "the llm cannot currently generate a good enough response";
const NO_DATABASE_INFO_MARKER: &str =
    "the database does not have specific information about your question";
const DATABASE_ANSWER_MARKER: &str = "the document database has an answer to your question";

/// Retrieved chunk texts joined the way they are shown to the model.
pub fn context_block(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|chunk| chunk.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn draft_prompt(context: &str, question: &str) -> String {
    format!(
        r#"If the context has documents related to the question, start your answer with
"{DATABASE_PREFIX}".
If the context does not have documents related to the question, start your answer with
"{NO_DATABASE_INFO}". After this, say on the next line
"{TRAINING_DATA_LEAD}", and then write the answer on the next line from your training data.

Context:
{context}

Question:
{question}

Answer:
"#
    )
}

fn verify_prompt(context: &str, question: &str, draft: &str, structured: bool) -> String {
    let reply_format = if structured {
        r#"
Reply with a JSON object EXACTLY in the following format:
{"outcome": "", "answer": ""}
Set "outcome" to "no_database_info", "ungrounded" or "database_answer" for the three cases
above, and put the full statement you would have written in "answer".
"#
    } else {
        ""
    };

    format!(
        r#"I will provide you the answer to a question I asked an LLM model based on a given context.
Look at the question and the answer, and make sure that the answer is correct and coherent.
DO NOT MENTION THAT I HAVE ASKED YOU THIS QUESTION BEFORE.

If the answer contains "{NO_DATABASE_INFO}" or a similar phrase, state
"{NO_DATABASE_INFO}".

If the answer does not make sense, state "{UNGROUNDED_APOLOGY}"

If the answer does make sense, state "{DATABASE_ANSWER_HEADER}", and then write the answer with
an introduction, body and conclusion for the response, based on the question and answer and
context you were provided. DO NOT USE THE WORDS INTRODUCTION, BODY, CONCLUSION, in your response.
THERE MUST BE AN INTRODUCTION AND CONCLUSION part to your response no matter what.
{reply_format}
Context:
{context}

Question:
{question}

Previous Answer:
{draft}

Answer:
"#
    )
}

fn folded(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn precedence(outcome: Outcome) -> u8 {
    match outcome {
        Outcome::Ungrounded => 3,
        Outcome::NoDatabaseInfo => 2,
        Outcome::DatabaseAnswer => 1,
        Outcome::NoResults => 0,
    }
}

/// The highest-precedence sentinel found in `text`, if any.
pub fn detect_sentinel(text: &str) -> Option<Outcome> {
    let text = folded(text);
    if text.contains(UNGROUNDED_MARKER) {
        Some(Outcome::Ungrounded)
    } else if text.contains(NO_DATABASE_INFO_MARKER) {
        Some(Outcome::NoDatabaseInfo)
    } else if text.contains(DATABASE_ANSWER_MARKER) {
        Some(Outcome::DatabaseAnswer)
    } else {
        None
    }
}

/// Outcome of a verified answer; text with no sentinel counts as ungrounded.
pub fn classify_outcome(text: &str) -> Outcome {
    detect_sentinel(text).unwrap_or(Outcome::Ungrounded)
}

/// Rewrites `text` so it carries exactly the sentinel for `outcome`.
///
/// Returns the outcome actually represented by the result, which is
/// `Ungrounded` when a database answer has no body left after the header.
pub fn canonicalize(outcome: Outcome, text: &str) -> (Outcome, String) {
    match outcome {
        Outcome::NoResults => (Outcome::NoResults, NO_RESULTS_NOTICE.to_string()),
        Outcome::Ungrounded => (Outcome::Ungrounded, UNGROUNDED_APOLOGY.to_string()),
        Outcome::NoDatabaseInfo => (Outcome::NoDatabaseInfo, NO_DATABASE_INFO.to_string()),
        Outcome::DatabaseAnswer => {
            let body = strip_header(text);
            if body.is_empty() {
                (Outcome::Ungrounded, UNGROUNDED_APOLOGY.to_string())
            } else {
                (
                    Outcome::DatabaseAnswer,
                    format!("{DATABASE_ANSWER_HEADER}\n\n{body}"),
                )
            }
        }
    }
}

fn header_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            let words = |sentence: &str| {
                sentence
                    .split_whitespace()
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(r"\s+")
            };
            let (lead, rest) = DATABASE_ANSWER_HEADER
                .split_once(". ")
                .unwrap_or((DATABASE_ANSWER_HEADER, ""));
            let rest = words(rest).replace('\'', "['’]");
            Regex::new(&format!(
                r#"(?i){}(?:[\s.]*{})?[\s.:"”]*"#,
                words(lead),
                rest
            ))
            .ok()
        })
        .as_ref()
}

/// Drops every copy of the database-answer header, or of its first sentence,
/// and the punctuation that trails it.
fn strip_header(text: &str) -> String {
    match header_pattern() {
        Some(pattern) => pattern.replace_all(text, "").trim().to_string(),
        None => text.replace(DATABASE_ANSWER_HEADER, "").trim().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct VerificationReply {
    outcome: Outcome,
    #[serde(default)]
    answer: String,
}

/// Reads a structured verification reply; `None` when the reply is not the
/// requested JSON object.
fn parse_verification(reply: &str) -> Option<(Outcome, String)> {
    let parsed: VerificationReply = serde_json::from_str(strip_code_fence(reply)).ok()?;
    if parsed.outcome == Outcome::NoResults {
        return None;
    }

    let outcome = match detect_sentinel(&parsed.answer) {
        Some(found) if precedence(found) > precedence(parsed.outcome) => found,
        _ => parsed.outcome,
    };
    Some((outcome, parsed.answer))
}

/// Draft text, verified text and outcome of one answered question.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineAnswer {
    pub draft_answer: Option<String>,
    pub verified_answer: String,
    pub outcome: Outcome,
}

impl PipelineAnswer {
    fn no_results() -> Self {
        Self {
            draft_answer: None,
            verified_answer: NO_RESULTS_NOTICE.to_string(),
            outcome: Outcome::NoResults,
        }
    }
}

pub struct AnswerPipeline<M> {
    model: M,
    structured_verification: bool,
}

impl<M: LanguageModel> AnswerPipeline<M> {
    /// Structured verification is on by default.
    pub fn new(model: M) -> Self {
        Self {
            model,
            structured_verification: true,
        }
    }

    pub fn with_structured_verification(mut self, enabled: bool) -> Self {
        self.structured_verification = enabled;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Runs draft then verification over `chunks`. Makes no model call when
    /// `chunks` is empty.
    pub async fn answer(
        &self,
        question: &str,
        chunks: &[ScoredChunk],
    ) -> Result<PipelineAnswer, LlmError> {
        if chunks.is_empty() {
            debug!("no retrieved chunks, skipping model calls");
            return Ok(PipelineAnswer::no_results());
        }

        let context = context_block(chunks);

        let draft = self
            .model
            .complete(
                CompletionRequest::new(draft_prompt(&context, question))
                    .with_system(DRAFT_SYSTEM_PROMPT),
            )
            .await?;
        debug!(chars = draft.len(), "draft answer received");

        let mut request =
            CompletionRequest::new(verify_prompt(&context, question, &draft, self.structured_verification))
                .with_system(VERIFY_SYSTEM_PROMPT);
        if self.structured_verification {
            request = request.json();
        }
        let reply = self.model.complete(request).await?;

        let (outcome, text) = match self
            .structured_verification
            .then(|| parse_verification(&reply))
            .flatten()
        {
            Some(parsed) => parsed,
            None => {
                if self.structured_verification {
                    warn!("verification reply was not structured, falling back to sentinel text");
                }
                (classify_outcome(&reply), reply)
            }
        };

        let (outcome, verified_answer) = canonicalize(outcome, &text);
        info!(?outcome, context_chunks = chunks.len(), "answer verified");

        Ok(PipelineAnswer {
            draft_answer: Some(draft),
            verified_answer,
            outcome,
        })
    }
}
