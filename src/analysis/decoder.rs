use serde::de::DeserializeOwned;
use thiserror::Error;

use super::types::{
    AnalysisResult, AnalysisTaskKind, CaseRepertorization, FollowUpQuestions, NarrativeThemes,
    RemedyComparison, SrpHighlight,
};

/// The model's text did not decode into the task's schema.
/// Never retried: resending the same prompt tends to reproduce the same reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Model returned an empty reply")]
    EmptyReply,

    #[error("No JSON object found in model reply")]
    NoJsonObject,

    #[error("Reply does not match the {task} schema: {message}")]
    SchemaMismatch {
        task: AnalysisTaskKind,
        message: String,
    },

    #[error("{task} result failed validation: {message}")]
    Invalid {
        task: AnalysisTaskKind,
        message: String,
    },
}

/// Post-parse checks serde cannot express.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// Locate the JSON object in a model reply.
///
/// Accepts bare JSON, JSON inside a markdown fence (with or without a
/// language tag, closed or not), and a single object surrounded by prose.
pub fn extract_json_payload(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.starts_with('{') {
        trimmed
    } else if let Some(fenced) = fenced_block(trimmed) {
        fenced
    } else {
        trimmed
    };

    outer_object(candidate)
}

/// Content of the first ``` fence, language tag skipped.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_ticks = &text[open + 3..];
    let tag_len = after_ticks
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(after_ticks.len());
    let body = &after_ticks[tag_len..];

    let content = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    let content = content.trim();
    (!content.is_empty()).then_some(content)
}

/// Span from the first `{` to the last `}`.
fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Decode a reply into one task's result type.
pub fn decode_as<T>(task: AnalysisTaskKind, raw: &str) -> Result<T, DecodeError>
where
    T: DeserializeOwned + Validate,
{
    if raw.trim().is_empty() {
        return Err(DecodeError::EmptyReply);
    }
    let payload = extract_json_payload(raw).ok_or(DecodeError::NoJsonObject)?;

    let parsed: T = serde_json::from_str(payload).map_err(|e| DecodeError::SchemaMismatch {
        task,
        message: e.to_string(),
    })?;

    parsed
        .validate()
        .map_err(|message| DecodeError::Invalid { task, message })?;

    Ok(parsed)
}

/// Decode a reply for `task` into the matching [`AnalysisResult`] variant.
pub fn decode(task: AnalysisTaskKind, raw: &str) -> Result<AnalysisResult, DecodeError> {
    Ok(match task {
        AnalysisTaskKind::NarrativeAnalysis => {
            AnalysisResult::NarrativeThemes(decode_as(task, raw)?)
        }
        AnalysisTaskKind::PeculiarSymptoms => AnalysisResult::SrpHighlight(decode_as(task, raw)?),
        AnalysisTaskKind::CaseRepertorization => {
            AnalysisResult::CaseRepertorization(decode_as(task, raw)?)
        }
        AnalysisTaskKind::RemedyComparison => {
            AnalysisResult::RemedyComparison(decode_as(task, raw)?)
        }
        AnalysisTaskKind::FollowUpQuestions => {
            AnalysisResult::FollowUpQuestions(decode_as(task, raw)?)
        }
    })
}

/// Turns a model reply into a typed result for its task.
///
/// [`JsonDecoder`] is the production implementation; the analyzer takes any
/// decoder so replies can be decoded differently in tests.
pub trait Decoder: Send + Sync {
    fn decode(&self, task: AnalysisTaskKind, raw: &str) -> Result<AnalysisResult, DecodeError>;
}

/// Extracts the first JSON object from the reply and checks it against the
/// task schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, task: AnalysisTaskKind, raw: &str) -> Result<AnalysisResult, DecodeError> {
        decode(task, raw)
    }
}

/// A result type owned by exactly one [`AnalysisResult`] variant.
pub trait TaskOutput: Sized {
    fn from_result(result: AnalysisResult) -> Option<Self>;
}

macro_rules! task_output {
    ($($variant:ident),* $(,)?) => {
        $(
            impl TaskOutput for $variant {
                fn from_result(result: AnalysisResult) -> Option<Self> {
                    match result {
                        AnalysisResult::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

task_output!(
    NarrativeThemes,
    SrpHighlight,
    CaseRepertorization,
    RemedyComparison,
    FollowUpQuestions,
);

// ──────────────────────────────────────────────
// Schema validation
// ──────────────────────────────────────────────

fn require_text(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("'{field}' is empty"));
    }
    Ok(())
}

fn require_items<T>(field: &str, items: &[T]) -> Result<(), String> {
    if items.is_empty() {
        return Err(format!("'{field}' has no entries"));
    }
    Ok(())
}

impl Validate for NarrativeThemes {
    fn validate(&self) -> Result<(), String> {
        require_items("themes", &self.themes)?;
        for theme in &self.themes {
            require_text("themes[].theme", &theme.theme)?;
        }
        require_text("portrait_summary", &self.portrait_summary)?;
        require_text("disclaimer", &self.disclaimer)
    }
}

impl Validate for SrpHighlight {
    // An empty list is a legitimate answer: not every case has SRP symptoms.
    fn validate(&self) -> Result<(), String> {
        for symptom in &self.peculiar_symptoms {
            require_text("peculiar_symptoms[].symptom", &symptom.symptom)?;
        }
        require_text("disclaimer", &self.disclaimer)
    }
}

impl Validate for CaseRepertorization {
    fn validate(&self) -> Result<(), String> {
        require_items("remedies", &self.remedies)?;
        for remedy in &self.remedies {
            require_text("remedies[].name", &remedy.name)?;
        }
        require_text("disclaimer", &self.disclaimer)
    }
}

impl Validate for RemedyComparison {
    fn validate(&self) -> Result<(), String> {
        require_items("comparisons", &self.comparisons)?;
        for contrast in &self.comparisons {
            require_text("comparisons[].remedy", &contrast.remedy)?;
        }
        require_text("recommendation", &self.recommendation)?;
        require_text("disclaimer", &self.disclaimer)
    }
}

impl Validate for FollowUpQuestions {
    fn validate(&self) -> Result<(), String> {
        require_items("questions", &self.questions)?;
        for question in &self.questions {
            require_text("questions[].question", &question.question)?;
        }
        require_text("disclaimer", &self.disclaimer)
    }
}
