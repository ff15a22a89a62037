use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::throttle::ClientUsageCounters;
use crate::case::CaseSnapshot;

// ──────────────────────────────────────────────
// Tasks and envelopes
// ──────────────────────────────────────────────

/// The five analyses the pipeline can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisTaskKind {
    NarrativeAnalysis,
    PeculiarSymptoms,
    CaseRepertorization,
    RemedyComparison,
    FollowUpQuestions,
}

impl AnalysisTaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NarrativeAnalysis => "narrative_analysis",
            Self::PeculiarSymptoms => "peculiar_symptoms",
            Self::CaseRepertorization => "case_repertorization",
            Self::RemedyComparison => "remedy_comparison",
            Self::FollowUpQuestions => "follow_up_questions",
        }
    }
}

impl fmt::Display for AnalysisTaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remedies to contrast plus the symptoms that should drive the contrast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonPayload {
    pub remedies: Vec<String>,
    pub key_symptoms: Vec<String>,
    /// Thermal state is the general most often used to split close remedies.
    pub thermal: Option<String>,
}

/// Case snapshot plus any remedies already under consideration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowUpPayload {
    pub snapshot: CaseSnapshot,
    pub candidate_remedies: Vec<String>,
}

/// Input to the prompt builder.
#[derive(Debug, Clone, Copy)]
pub enum AnalysisTask<'a> {
    Narrative(&'a CaseSnapshot),
    PeculiarSymptoms(&'a CaseSnapshot),
    Repertorization(&'a CaseSnapshot),
    RemedyComparison(&'a ComparisonPayload),
    FollowUp(&'a FollowUpPayload),
}

impl AnalysisTask<'_> {
    pub fn kind(&self) -> AnalysisTaskKind {
        match self {
            Self::Narrative(_) => AnalysisTaskKind::NarrativeAnalysis,
            Self::PeculiarSymptoms(_) => AnalysisTaskKind::PeculiarSymptoms,
            Self::Repertorization(_) => AnalysisTaskKind::CaseRepertorization,
            Self::RemedyComparison(_) => AnalysisTaskKind::RemedyComparison,
            Self::FollowUp(_) => AnalysisTaskKind::FollowUpQuestions,
        }
    }
}

/// System + user instruction pair for one request. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptEnvelope {
    pub task: AnalysisTaskKind,
    pub system: String,
    pub user: String,
}

// ──────────────────────────────────────────────
// Transport outcomes
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    RateLimited { message: String },
    Network { message: String },
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { message } => write!(f, "rate limited: {message}"),
            Self::Network { message } => write!(f, "network failure: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// Non-2xx status other than 429.
    HttpStatus { status: u16, body: String },
    /// 2xx whose body lacks the fields every reply must carry.
    MalformedEnvelope { message: String },
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpStatus { status, body } => write!(f, "HTTP {status}: {body}"),
            Self::MalformedEnvelope { message } => write!(f, "malformed response: {message}"),
        }
    }
}

/// Classification of one transport attempt, decided once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Success {
        text: String,
        usage: Option<TokenUsage>,
    },
    RetryableFailure {
        reason: RetryReason,
        suggested_delay: Option<Duration>,
    },
    QuotaExhausted {
        message: String,
    },
    FatalFailure {
        reason: FatalReason,
    },
}

impl TransportOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableFailure { .. })
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RetryableFailure { .. } => "retryable",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::FatalFailure { .. } => "fatal",
        }
    }
}

/// One request/response exchange with the remote model.
///
/// Implementations own the throttle and usage counters; the retry and decode
/// layers sit above this seam so tests can swap in a scripted fake.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: &PromptEnvelope) -> TransportOutcome;

    async fn usage(&self) -> ClientUsageCounters;

    async fn reset_usage(&self);
}

// ──────────────────────────────────────────────
// Decoded results
// ──────────────────────────────────────────────

/// Model-reported strength of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[serde(alias = "medium")]
    Moderate,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeTheme {
    pub theme: String,
    pub evidence: String,
}

/// Result of narrative analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeThemes {
    pub themes: Vec<NarrativeTheme>,
    /// Short constitutional portrait of the person, persisted on success.
    pub portrait_summary: String,
    #[serde(default)]
    pub mental_emotional_highlights: Vec<String>,
    #[serde(default)]
    pub suggested_key_symptoms: Vec<String>,
    pub disclaimer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeculiarSymptom {
    pub symptom: String,
    pub why_peculiar: String,
    #[serde(default)]
    pub rubric_hint: Option<String>,
}

/// Strange, rare and peculiar symptoms picked out of the case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrpHighlight {
    pub peculiar_symptoms: Vec<PeculiarSymptom>,
    pub disclaimer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymptomHierarchy {
    #[serde(default)]
    pub mental: Vec<String>,
    #[serde(default)]
    pub generals: Vec<String>,
    #[serde(default)]
    pub peculiar: Vec<String>,
    #[serde(default)]
    pub local: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemedySuggestion {
    pub name: String,
    pub confidence: Confidence,
    pub rationale: String,
    #[serde(default)]
    pub matching_symptoms: Vec<String>,
}

/// Full case analysis: ranked symptom hierarchy and remedy suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRepertorization {
    pub case_summary: String,
    pub symptom_hierarchy: SymptomHierarchy,
    pub remedies: Vec<RemedySuggestion>,
    pub disclaimer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemedyContrast {
    pub remedy: String,
    #[serde(default)]
    pub supporting_features: Vec<String>,
    #[serde(default)]
    pub contradicting_features: Vec<String>,
    pub fit: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemedyComparison {
    pub comparisons: Vec<RemedyContrast>,
    pub recommendation: String,
    #[serde(default)]
    pub differentiating_questions: Vec<String>,
    pub disclaimer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub question: String,
    pub purpose: String,
    #[serde(default)]
    pub target_remedy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpQuestions {
    pub questions: Vec<FollowUpQuestion>,
    pub disclaimer: String,
}

/// Decoded reply, one variant per task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum AnalysisResult {
    NarrativeThemes(NarrativeThemes),
    SrpHighlight(SrpHighlight),
    CaseRepertorization(CaseRepertorization),
    RemedyComparison(RemedyComparison),
    FollowUpQuestions(FollowUpQuestions),
}

impl AnalysisResult {
    pub fn task(&self) -> AnalysisTaskKind {
        match self {
            Self::NarrativeThemes(_) => AnalysisTaskKind::NarrativeAnalysis,
            Self::SrpHighlight(_) => AnalysisTaskKind::PeculiarSymptoms,
            Self::CaseRepertorization(_) => AnalysisTaskKind::CaseRepertorization,
            Self::RemedyComparison(_) => AnalysisTaskKind::RemedyComparison,
            Self::FollowUpQuestions(_) => AnalysisTaskKind::FollowUpQuestions,
        }
    }

    pub fn disclaimer(&self) -> &str {
        match self {
            Self::NarrativeThemes(r) => &r.disclaimer,
            Self::SrpHighlight(r) => &r.disclaimer,
            Self::CaseRepertorization(r) => &r.disclaimer,
            Self::RemedyComparison(r) => &r.disclaimer,
            Self::FollowUpQuestions(r) => &r.disclaimer,
        }
    }
}
